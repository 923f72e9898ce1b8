//! JSON-lines batch source.
//!
//! Each non-blank line is one [`DocumentRecord`]. The raw line is kept next
//! to the parsed record so untouched records can be written back byte for byte.

use std::collections::HashSet;
use std::path::Path;

use tracing::{info, warn};

use docenrich_shared::{DocEnrichError, DocumentRecord, Result};

/// One record of a batch together with the line it was read from.
#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub record: DocumentRecord,
    pub line: String,
}

/// The full ordered set of records loaded for one run.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    entries: Vec<BatchEntry>,
}

impl Batch {
    /// Build a batch from in-memory records, rendering each as a JSON line.
    pub fn from_records(records: Vec<DocumentRecord>) -> Self {
        let entries = records
            .into_iter()
            .map(|record| {
                let line = serde_json::to_string(&record).unwrap_or_default();
                BatchEntry { record, line }
            })
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn records(&self) -> impl Iterator<Item = &DocumentRecord> {
        self.entries.iter().map(|e| &e.record)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Read a whole batch file into memory.
pub fn load_batch(path: &Path) -> Result<Batch> {
    let content = std::fs::read_to_string(path).map_err(|e| DocEnrichError::io(path, e))?;
    let batch = parse_batch(path, &content)?;
    info!(path = %path.display(), records = batch.len(), "loaded batch");
    Ok(batch)
}

/// Parse JSON-lines content. `path` is only used in error messages.
///
/// A line that does not parse aborts the load: the batch is rewritten at the
/// end of the run, so a skipped line would be lost.
pub fn parse_batch(path: &Path, content: &str) -> Result<Batch> {
    let mut entries = Vec::new();
    let mut seen = HashSet::new();

    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }

        let record: DocumentRecord =
            serde_json::from_str(line).map_err(|e| DocEnrichError::Source {
                path: path.to_path_buf(),
                line: idx + 1,
                message: e.to_string(),
            })?;

        if !seen.insert(record.id.clone()) {
            warn!(record_id = %record.id, line = idx + 1, "duplicate record id in batch");
        }

        entries.push(BatchEntry {
            record,
            line: line.to_string(),
        });
    }

    Ok(Batch { entries })
}
