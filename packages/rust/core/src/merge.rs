//! Merge & persist: put outcomes back into batch order and rewrite the file.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::{debug, instrument, warn};

use docenrich_shared::{DocEnrichError, DocumentRecord, Result};

use crate::pool::{Outcome, OutcomeStatus};
use crate::source::{Batch, BatchEntry};

/// One position of the rebuilt batch.
#[derive(Debug)]
pub enum MergedRecord<'a> {
    /// Successfully enriched this run.
    Enriched(DocumentRecord),
    /// Passthrough or failed: the record as it was read.
    Original(&'a BatchEntry),
}

impl MergedRecord<'_> {
    pub fn record(&self) -> &DocumentRecord {
        match self {
            Self::Enriched(record) => record,
            Self::Original(entry) => &entry.record,
        }
    }

    /// Output line for this position.
    ///
    /// Enriched records drop their raw text and keep `text_length`. Records
    /// still waiting for enrichment keep the exact input line, raw text
    /// included, so they stay eligible on the next run.
    pub fn render(&self) -> serde_json::Result<String> {
        match self {
            Self::Enriched(record) => serde_json::to_string(&record.stripped()),
            Self::Original(entry) if entry.record.is_enriched() && entry.record.full_text.is_some() => {
                serde_json::to_string(&entry.record.stripped())
            }
            Self::Original(entry) => Ok(entry.line.clone()),
        }
    }
}

/// Rebuild the batch in input order, substituting successful outcomes.
///
/// Outcomes are matched by batch position, so repeated ids cannot swap
/// results. Failed outcomes leave the original record in place.
pub fn merge(batch: &Batch, outcomes: Vec<Outcome>) -> Vec<MergedRecord<'_>> {
    let mut enriched: HashMap<usize, DocumentRecord> = HashMap::new();

    for outcome in outcomes {
        let OutcomeStatus::Success(record) = outcome.status else {
            continue;
        };
        match batch.entries().get(outcome.position) {
            Some(entry) if entry.record.id == record.id => {
                enriched.insert(outcome.position, record);
            }
            _ => warn!(
                record_id = %record.id,
                position = outcome.position,
                "outcome does not match batch position, keeping original"
            ),
        }
    }

    batch
        .entries()
        .iter()
        .enumerate()
        .map(|(position, entry)| match enriched.remove(&position) {
            Some(record) => MergedRecord::Enriched(record),
            None => MergedRecord::Original(entry),
        })
        .collect()
}

/// Write the merged batch to `path` all-or-nothing.
///
/// Lines go to `.<name>.tmp` beside the target, which is synced and renamed
/// over it, and the directory is synced so the rename survives a crash. On a
/// failure before the rename the temp file is removed and the previous file
/// is left as it was.
#[instrument(skip_all, fields(path = %path.display(), records = merged.len()))]
pub fn write_batch_atomic(path: &Path, merged: &[MergedRecord<'_>]) -> Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| DocEnrichError::validation(format!("output path has no file name: {}", path.display())))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let temp = dir.join(format!(".{}.tmp", file_name.to_string_lossy()));

    if let Err(e) = write_lines(&temp, merged) {
        let _ = std::fs::remove_file(&temp);
        return Err(DocEnrichError::persist(&temp, e));
    }

    if let Err(e) = std::fs::rename(&temp, path) {
        let _ = std::fs::remove_file(&temp);
        return Err(DocEnrichError::persist(path, e));
    }

    sync_dir(dir).map_err(|e| DocEnrichError::persist(dir, e))?;

    debug!("wrote batch");
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

// Directory handles cannot be synced on this platform.
#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

fn write_lines(temp: &Path, merged: &[MergedRecord<'_>]) -> std::io::Result<()> {
    let mut writer = BufWriter::new(File::create(temp)?);
    for item in merged {
        let line = item.render()?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
    }
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use docenrich_shared::EnrichmentResult;
    use std::path::PathBuf;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("docenrich-merge-test-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn enriched(record: &DocumentRecord) -> DocumentRecord {
        let mut record = record.clone();
        let result = EnrichmentResult {
            summary_plain_es: "Resumen".into(),
            keywords: vec!["k".into()],
            affects_to: vec!["empresas".into()],
            transparency_notes: "Nota".into(),
        };
        record.apply_enrichment(&result, Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap());
        record
    }

    fn sample_batch() -> Batch {
        let content = concat!(
            "{\"id\":\"a\",\"title_original\":\"A\",\"full_text\":\"texto a\",\"text_length\":7}\n",
            "{\"id\":\"b\", \"title_original\":\"B\", \"full_text\":\"\"}\n",
            "{\"id\":\"c\",\"title_original\":\"C\",\"full_text\":\"texto c\",\"text_length\":7}\n",
        );
        crate::source::parse_batch(Path::new("in.jsonl"), content).unwrap()
    }

    #[test]
    fn merge_keeps_order_and_failed_records() {
        let batch = sample_batch();
        let a = enriched(&batch.entries()[0].record);
        let outcomes = vec![
            Outcome {
                position: 2,
                record_id: "c".into(),
                status: OutcomeStatus::Failure(DocEnrichError::MalformedResponse("x".into())),
            },
            Outcome {
                position: 0,
                record_id: "a".into(),
                status: OutcomeStatus::Success(a),
            },
        ];

        let merged = merge(&batch, outcomes);
        let ids: Vec<_> = merged.iter().map(|m| m.record().id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        assert!(matches!(merged[0], MergedRecord::Enriched(_)));
        assert!(matches!(merged[1], MergedRecord::Original(_)));
        assert!(matches!(merged[2], MergedRecord::Original(_)));

        // failed and passthrough records keep their exact input line
        assert_eq!(merged[1].render().unwrap(), batch.entries()[1].line);
        assert_eq!(merged[2].render().unwrap(), batch.entries()[2].line);
    }

    #[test]
    fn enriched_output_strips_text_but_keeps_length() {
        let batch = sample_batch();
        let a = enriched(&batch.entries()[0].record);
        let merged = merge(
            &batch,
            vec![Outcome {
                position: 0,
                record_id: "a".into(),
                status: OutcomeStatus::Success(a),
            }],
        );

        let line = merged[0].render().unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert!(value.get("full_text").is_none());
        assert_eq!(value["text_length"], 7);
        assert_eq!(value["summary_plain_es"], "Resumen");
        assert_eq!(value["updated_at"], "2026-01-02T03:04:05Z");
    }

    #[test]
    fn mismatched_outcome_is_ignored() {
        let batch = sample_batch();
        let stray = enriched(&DocumentRecord::new("zzz", "Z"));
        let merged = merge(
            &batch,
            vec![Outcome {
                position: 1,
                record_id: "zzz".into(),
                status: OutcomeStatus::Success(stray),
            }],
        );
        assert!(merged.iter().all(|m| matches!(m, MergedRecord::Original(_))));
    }

    #[test]
    fn atomic_write_replaces_file() {
        let dir = temp_dir();
        let path = dir.join("batch.jsonl");
        std::fs::write(&path, "old contents\n").unwrap();

        let batch = sample_batch();
        let merged = merge(&batch, Vec::new());
        write_batch_atomic(&path, &merged).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        let expected: String = batch.entries().iter().map(|e| format!("{}\n", e.line)).collect();
        assert_eq!(written, expected);
        assert!(!dir.join(".batch.jsonl.tmp").exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn directory_is_synced_after_rename() {
        let dir = temp_dir();
        let path = dir.join("batch.jsonl");

        let batch = sample_batch();
        let merged = merge(&batch, Vec::new());
        write_batch_atomic(&path, &merged).unwrap();
        sync_dir(&dir).unwrap();

        let entries: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, vec!["batch.jsonl".to_string()]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn failed_write_leaves_previous_version() {
        let dir = temp_dir();
        // a directory in the target position makes the final rename fail
        let path = dir.join("batch.jsonl");
        std::fs::create_dir_all(path.join("occupied")).unwrap();

        let batch = sample_batch();
        let merged = merge(&batch, Vec::new());
        let err = write_batch_atomic(&path, &merged).unwrap_err();

        assert_eq!(err.class(), "persist");
        assert!(path.join("occupied").is_dir());
        assert!(!dir.join(".batch.jsonl.tmp").exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_directory_is_persist_error() {
        let path = std::env::temp_dir()
            .join(format!("docenrich-missing-{}", uuid::Uuid::now_v7()))
            .join("out.jsonl");
        let batch = sample_batch();
        let err = write_batch_atomic(&path, &merge(&batch, Vec::new())).unwrap_err();
        assert_eq!(err.class(), "persist");
        assert!(!path.exists());
    }
}
