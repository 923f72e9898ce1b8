//! End-to-end batch run: load → select → enrich in parallel → merge → write.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use docenrich_shared::{
    DocEnrichError, DocumentRecord, EnrichmentResult, MalformedPolicy, PLACEHOLDER_SUMMARY_PREFIX,
    PipelineOptions, Result,
};

use crate::client::{EnrichmentClient, fallback_short_title};
use crate::merge::{self, MergedRecord};
use crate::pool::{Outcome, OutcomeStatus, PoolProgress, WorkerPool};
use crate::selector;
use crate::source::{self, Batch};

/// A failed record as reported to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub record_id: String,
    pub error_class: &'static str,
    pub message: String,
}

/// Summary of one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub input: PathBuf,
    pub output: PathBuf,
    pub total: usize,
    pub selected: usize,
    pub passthrough: usize,
    /// Records enriched this run, placeholders included.
    pub enriched: usize,
    /// Enriched records carrying the malformed-response placeholder.
    pub placeholders: usize,
    pub failed: usize,
    pub cache_hits: usize,
    pub service_calls: usize,
    pub retries: usize,
    pub failures: Vec<FailureRecord>,
    pub elapsed: Duration,
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called as each selected record finishes, successfully or not.
    fn record_done(&self, record_id: &str, success: bool, completed: usize, total: usize);
    /// Called when the run completes.
    fn done(&self, report: &RunReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn record_done(&self, _record_id: &str, _success: bool, _completed: usize, _total: usize) {}
    fn done(&self, _report: &RunReport) {}
}

/// Adapts a `ProgressReporter` to the pool's progress interface.
struct PipelinePoolProgress<'a> {
    inner: &'a dyn ProgressReporter,
}

impl PoolProgress for PipelinePoolProgress<'_> {
    fn item_done(&self, outcome: &Outcome, completed: usize, total: usize) {
        self.inner
            .record_done(&outcome.record_id, outcome.is_success(), completed, total);
    }
}

/// Options each per-record task needs.
#[derive(Debug, Clone, Copy)]
struct ItemOptions {
    malformed_policy: MalformedPolicy,
    short_titles: bool,
    clock: fn() -> DateTime<Utc>,
}

/// The batch enrichment pipeline.
pub struct BatchPipeline {
    client: Arc<EnrichmentClient>,
    options: PipelineOptions,
    clock: fn() -> DateTime<Utc>,
}

impl BatchPipeline {
    pub fn new(client: EnrichmentClient, options: PipelineOptions) -> Self {
        Self {
            client: Arc::new(client),
            options,
            clock: Utc::now,
        }
    }

    /// Replace the timestamp source used for `updated_at`.
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    pub fn client(&self) -> &EnrichmentClient {
        &self.client
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Run the full pipeline over one JSON-lines file.
    ///
    /// 1. Load the batch
    /// 2. Select records needing enrichment
    /// 3. Enrich them on the worker pool
    /// 4. Merge outcomes in input order
    /// 5. Atomically write `output`
    ///
    /// Per-record failures end up in the report. Only loading and persisting
    /// errors fail the run.
    #[instrument(skip_all, fields(input = %input.display(), output = %output.display()))]
    pub async fn run(
        &self,
        input: &Path,
        output: &Path,
        progress: &dyn ProgressReporter,
    ) -> Result<RunReport> {
        let start = Instant::now();

        progress.phase("Loading batch");
        let batch = source::load_batch(input)?;

        let (merged, mut report) = self.process(&batch, progress).await;

        progress.phase("Writing batch");
        merge::write_batch_atomic(output, &merged)?;

        report.input = input.to_path_buf();
        report.output = output.to_path_buf();
        report.elapsed = start.elapsed();

        info!(
            total = report.total,
            selected = report.selected,
            enriched = report.enriched,
            placeholders = report.placeholders,
            failed = report.failed,
            cache_hits = report.cache_hits,
            service_calls = report.service_calls,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "pipeline run complete"
        );
        progress.done(&report);
        Ok(report)
    }

    /// Enrich an in-memory batch and merge the outcomes, without writing.
    pub async fn process<'a>(
        &self,
        batch: &'a Batch,
        progress: &dyn ProgressReporter,
    ) -> (Vec<MergedRecord<'a>>, RunReport) {
        let before = self.client.counters();

        progress.phase("Selecting records");
        let selection = selector::select(batch);
        let mut report = RunReport {
            total: batch.len(),
            selected: selection.to_process.len(),
            passthrough: selection.passthrough.len(),
            ..Default::default()
        };
        info!(
            total = report.total,
            selected = report.selected,
            passthrough = report.passthrough,
            "selected records"
        );

        progress.phase("Enriching records");
        let client = Arc::clone(&self.client);
        let item_options = ItemOptions {
            malformed_policy: self.options.malformed_policy,
            short_titles: self.options.short_titles,
            clock: self.clock,
        };
        let pool = WorkerPool::new(self.options.concurrency);
        let outcomes = pool
            .run(
                selection.to_process,
                move |record| enrich_record(Arc::clone(&client), item_options, record),
                &PipelinePoolProgress { inner: progress },
            )
            .await;

        for outcome in &outcomes {
            match &outcome.status {
                OutcomeStatus::Success(record) => {
                    report.enriched += 1;
                    if is_placeholder(record) {
                        report.placeholders += 1;
                    }
                }
                OutcomeStatus::Failure(e) => {
                    report.failed += 1;
                    report.failures.push(FailureRecord {
                        record_id: outcome.record_id.clone(),
                        error_class: e.class(),
                        message: e.to_string(),
                    });
                }
            }
        }
        report.failures.sort_by(|a, b| a.record_id.cmp(&b.record_id));

        let counters = self.client.counters().since(&before);
        report.cache_hits = counters.cache_hits;
        report.service_calls = counters.service_calls;
        report.retries = counters.retries;

        progress.phase("Merging");
        (merge::merge(batch, outcomes), report)
    }
}

fn is_placeholder(record: &DocumentRecord) -> bool {
    record
        .summary_plain_es
        .as_deref()
        .is_some_and(|s| s.starts_with(PLACEHOLDER_SUMMARY_PREFIX))
}

/// Enrich one record. Runs inside its own task on the pool.
async fn enrich_record(
    client: Arc<EnrichmentClient>,
    options: ItemOptions,
    mut record: DocumentRecord,
) -> Result<DocumentRecord> {
    let text = record.full_text.as_deref().unwrap_or_default();

    let result = match client.enrich(&record.title_original, text).await {
        Ok(result) => result,
        Err(e @ DocEnrichError::MalformedResponse(_)) => match options.malformed_policy {
            MalformedPolicy::Placeholder => {
                warn!(record_id = %record.id, error = %e, "malformed response, using placeholder");
                EnrichmentResult::placeholder(&record.title_original)
            }
            MalformedPolicy::Fail => return Err(e),
        },
        Err(e) => return Err(e),
    };

    if options.short_titles {
        let short_title = if result.is_placeholder() {
            fallback_short_title(&record.title_original)
        } else {
            match client
                .short_title(&record.title_original, &result.summary_plain_es)
                .await
            {
                Ok(title) => title,
                Err(e) => {
                    warn!(
                        record_id = %record.id,
                        error_class = e.class(),
                        error = %e,
                        "short title failed, using title prefix"
                    );
                    fallback_short_title(&record.title_original)
                }
            }
        };
        record.short_title = Some(short_title);
    }

    record.apply_enrichment(&result, (options.clock)());
    Ok(record)
}
