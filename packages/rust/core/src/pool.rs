//! Bounded worker pool.
//!
//! Work items go into a task queue drained by `concurrency` workers. Each item
//! runs in its own task so a panic becomes a [`OutcomeStatus::Failure`] for
//! that record only. Outcomes flow back over a result channel to the caller,
//! which is the only place progress is reported from.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, instrument, warn};

use docenrich_shared::{DocEnrichError, DocumentRecord, Result};

use crate::selector::WorkItem;

/// Result of processing one work item.
#[derive(Debug)]
pub enum OutcomeStatus {
    Success(DocumentRecord),
    Failure(DocEnrichError),
}

/// Per-item outcome, tagged with the item's batch position.
#[derive(Debug)]
pub struct Outcome {
    pub position: usize,
    pub record_id: String,
    pub status: OutcomeStatus,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self.status, OutcomeStatus::Success(_))
    }
}

/// Observer for pool completion. Called from the collecting task only.
pub trait PoolProgress: Send + Sync {
    fn item_done(&self, outcome: &Outcome, completed: usize, total: usize);
}

/// Fixed-size pool of concurrent workers.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    concurrency: usize,
}

impl WorkerPool {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run `task` once per item with at most `concurrency` items in flight.
    ///
    /// Returns one outcome per item, in completion order. Nothing is retried
    /// here.
    #[instrument(skip_all, fields(items = items.len(), concurrency = self.concurrency))]
    pub async fn run<F, Fut>(
        &self,
        items: Vec<WorkItem>,
        task: F,
        progress: &dyn PoolProgress,
    ) -> Vec<Outcome>
    where
        F: Fn(DocumentRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<DocumentRecord>> + Send + 'static,
    {
        let total = items.len();
        if total == 0 {
            return Vec::new();
        }

        let (task_tx, task_rx) = mpsc::channel::<WorkItem>(total);
        for item in items {
            if task_tx.send(item).await.is_err() {
                break;
            }
        }
        drop(task_tx);

        let queue = Arc::new(Mutex::new(task_rx));
        let task = Arc::new(task);
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<Outcome>();

        let workers = self.concurrency.min(total);
        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let queue = Arc::clone(&queue);
            let task = Arc::clone(&task);
            let result_tx = result_tx.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    let next = queue.lock().await.recv().await;
                    let Some(WorkItem { position, record }) = next else {
                        break;
                    };
                    let record_id = record.id.clone();

                    let handle = tokio::spawn((task.as_ref())(record));
                    let status = match handle.await {
                        Ok(Ok(enriched)) => OutcomeStatus::Success(enriched),
                        Ok(Err(e)) => OutcomeStatus::Failure(e),
                        Err(join_err) => OutcomeStatus::Failure(DocEnrichError::Worker(format!(
                            "task for {record_id} did not complete: {join_err}"
                        ))),
                    };

                    let outcome = Outcome {
                        position,
                        record_id,
                        status,
                    };
                    if result_tx.send(outcome).is_err() {
                        break;
                    }
                }
                debug!(worker_id, "worker finished");
            }));
        }
        drop(result_tx);

        let mut outcomes = Vec::with_capacity(total);
        while let Some(outcome) = result_rx.recv().await {
            if let OutcomeStatus::Failure(e) = &outcome.status {
                warn!(
                    record_id = %outcome.record_id,
                    error_class = e.class(),
                    error = %e,
                    "enrichment failed"
                );
            }
            progress.item_done(&outcome, outcomes.len() + 1, total);
            outcomes.push(outcome);
        }

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker task failed");
            }
        }

        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingProgress {
        seen: AtomicUsize,
        last_total: AtomicUsize,
    }

    impl PoolProgress for CountingProgress {
        fn item_done(&self, _outcome: &Outcome, completed: usize, total: usize) {
            self.seen.fetch_add(1, Ordering::SeqCst);
            assert!(completed <= total);
            self.last_total.store(total, Ordering::SeqCst);
        }
    }

    fn items(n: usize) -> Vec<WorkItem> {
        (0..n)
            .map(|i| WorkItem {
                position: i,
                record: DocumentRecord::new(format!("doc-{i}"), format!("Título {i}")),
            })
            .collect()
    }

    #[tokio::test]
    async fn every_item_gets_one_outcome() {
        let progress = CountingProgress {
            seen: AtomicUsize::new(0),
            last_total: AtomicUsize::new(0),
        };
        let outcomes = WorkerPool::new(4)
            .run(items(25), |record| async move { Ok(record) }, &progress)
            .await;

        assert_eq!(outcomes.len(), 25);
        assert!(outcomes.iter().all(Outcome::is_success));
        let mut positions: Vec<_> = outcomes.iter().map(|o| o.position).collect();
        positions.sort_unstable();
        assert_eq!(positions, (0..25).collect::<Vec<_>>());
        assert_eq!(progress.seen.load(Ordering::SeqCst), 25);
        assert_eq!(progress.last_total.load(Ordering::SeqCst), 25);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);
        static PEAK: AtomicUsize = AtomicUsize::new(0);

        let progress = CountingProgress {
            seen: AtomicUsize::new(0),
            last_total: AtomicUsize::new(0),
        };
        let outcomes = WorkerPool::new(3)
            .run(
                items(12),
                |record| async move {
                    let now = IN_FLIGHT.fetch_add(1, Ordering::SeqCst) + 1;
                    PEAK.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
                    Ok(record)
                },
                &progress,
            )
            .await;

        assert_eq!(outcomes.len(), 12);
        assert!(PEAK.load(Ordering::SeqCst) <= 3);
        assert!(PEAK.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn errors_and_panics_stay_per_item() {
        let progress = CountingProgress {
            seen: AtomicUsize::new(0),
            last_total: AtomicUsize::new(0),
        };
        let outcomes = WorkerPool::new(2)
            .run(
                items(6),
                |record| async move {
                    match record.id.as_str() {
                        "doc-1" => Err(DocEnrichError::MalformedResponse("bad".into())),
                        "doc-4" => panic!("boom"),
                        _ => Ok(record),
                    }
                },
                &progress,
            )
            .await;

        assert_eq!(outcomes.len(), 6);
        for outcome in &outcomes {
            match (outcome.record_id.as_str(), &outcome.status) {
                ("doc-1", OutcomeStatus::Failure(e)) => assert_eq!(e.class(), "malformed_response"),
                ("doc-4", OutcomeStatus::Failure(e)) => assert_eq!(e.class(), "worker"),
                (_, OutcomeStatus::Success(record)) => assert_eq!(record.id, outcome.record_id),
                (id, status) => panic!("unexpected outcome for {id}: {status:?}"),
            }
        }
    }

    #[tokio::test]
    async fn empty_input_returns_immediately() {
        let progress = CountingProgress {
            seen: AtomicUsize::new(0),
            last_total: AtomicUsize::new(0),
        };
        let outcomes = WorkerPool::new(8)
            .run(Vec::new(), |record| async move { Ok(record) }, &progress)
            .await;
        assert!(outcomes.is_empty());
        assert_eq!(progress.seen.load(Ordering::SeqCst), 0);
    }
}
