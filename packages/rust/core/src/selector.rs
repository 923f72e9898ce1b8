//! Work selection: which records of a batch need enrichment this run.

use docenrich_shared::DocumentRecord;

use crate::source::Batch;

/// A record picked for enrichment, with its position in the batch.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub position: usize,
    pub record: DocumentRecord,
}

/// Partition of a batch into work and passthrough.
#[derive(Debug, Default)]
pub struct Selection {
    pub to_process: Vec<WorkItem>,
    /// Positions of records copied to the output unchanged.
    pub passthrough: Vec<usize>,
}

/// A record needs enrichment iff it has source text and was never enriched.
pub fn needs_enrichment(record: &DocumentRecord) -> bool {
    record.has_source_text() && !record.is_enriched()
}

/// Split `batch` into records to enrich and records to pass through.
pub fn select(batch: &Batch) -> Selection {
    let mut selection = Selection::default();
    for (position, entry) in batch.entries().iter().enumerate() {
        if needs_enrichment(&entry.record) {
            selection.to_process.push(WorkItem {
                position,
                record: entry.record.clone(),
            });
        } else {
            selection.passthrough.push(position);
        }
    }
    tracing::debug!(
        selected = selection.to_process.len(),
        passthrough = selection.passthrough.len(),
        "selected work"
    );
    selection
}
