//! Core domain types: document records, enrichment results, cache entries.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Maximum number of keywords kept on a record.
pub const MAX_KEYWORDS: usize = 8;

/// Maximum number of affected-group tags kept on a record.
pub const MAX_AFFECTED_GROUPS: usize = 3;

/// Prefix marking a summary produced by the malformed-response fallback.
/// Downstream quality checks look for it.
pub const PLACEHOLDER_SUMMARY_PREFIX: &str = "[Resumen no disponible]";

/// Transparency note used when the service gave nothing usable.
pub const DEFAULT_TRANSPARENCY_NOTE: &str =
    "Documento oficial que puede afectar a la ciudadanía.";

// ---------------------------------------------------------------------------
// DocumentRecord
// ---------------------------------------------------------------------------

/// One line of a batch file: a gazette entry, procurement notice or budget report.
///
/// Source fields are written by upstream collectors and never touched here.
/// Enrichment fields are set together by [`DocumentRecord::apply_enrichment`],
/// which is also the only place `updated_at` gets set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Stable identifier, unique within a batch.
    pub id: String,
    /// Publishing source (e.g. `BOE`, `PLACSP`, `IGAE`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Document type (e.g. `real_decreto`, `licitacion`).
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    /// Title as published.
    #[serde(default)]
    pub title_original: String,
    /// Publication date as published (ISO 8601).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_published: Option<String>,
    /// Raw extracted text. Only carried as enrichment input; stripped on write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_text: Option<String>,
    /// Length of the extracted text, kept after `full_text` is stripped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_length: Option<u64>,

    /// Plain-language summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_plain_es: Option<String>,
    /// Search keywords, at most [`MAX_KEYWORDS`].
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Affected-group tags, at most [`MAX_AFFECTED_GROUPS`].
    #[serde(default)]
    pub affects_to: Vec<String>,
    /// Short editorial headline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_title: Option<String>,
    /// Why citizens should care about this document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transparency_notes: Option<String>,
    /// Set iff the record has been enriched.
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub updated_at: Option<DateTime<Utc>>,

    /// Source-specific metadata this crate does not interpret.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl DocumentRecord {
    /// Create a bare record with only identity and title set.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: None,
            doc_type: None,
            title_original: title.into(),
            date_published: None,
            full_text: None,
            text_length: None,
            summary_plain_es: None,
            keywords: Vec::new(),
            affects_to: Vec::new(),
            short_title: None,
            transparency_notes: None,
            updated_at: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Attach extracted text (and its length) to the record.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        let text = text.into();
        self.text_length = Some(text.chars().count() as u64);
        self.full_text = Some(text);
        self
    }

    /// A record is enriched iff its last-updated timestamp is set.
    pub fn is_enriched(&self) -> bool {
        self.updated_at.is_some()
    }

    /// Whether the record carries non-empty extracted text.
    pub fn has_source_text(&self) -> bool {
        self.full_text.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Overwrite the enrichment fields and stamp the record as enriched.
    pub fn apply_enrichment(&mut self, result: &EnrichmentResult, at: DateTime<Utc>) {
        self.summary_plain_es = Some(result.summary_plain_es.clone());
        self.keywords = result.keywords.clone();
        self.affects_to = result.affects_to.clone();
        self.transparency_notes = Some(result.transparency_notes.clone());
        self.updated_at = Some(at);
    }

    /// Copy of the record without the raw text payload.
    pub fn stripped(&self) -> Self {
        Self {
            full_text: None,
            ..self.clone()
        }
    }
}

/// Accepts RFC 3339, naive ISO 8601 (read as UTC) or a bare date.
/// `null` and the empty string both mean "not set".
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(raw) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    parse_timestamp(raw)
        .map(Some)
        .ok_or_else(|| serde::de::Error::custom(format!("unrecognised timestamp: {raw:?}")))
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    if let Ok(t) = raw.parse::<NaiveDateTime>() {
        return Some(t.and_utc());
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(t.and_utc());
    }
    raw.parse::<NaiveDate>()
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc())
}

// ---------------------------------------------------------------------------
// EnrichmentResult
// ---------------------------------------------------------------------------

/// The four-field object the generation service must return.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnrichmentResult {
    pub summary_plain_es: String,
    pub keywords: Vec<String>,
    pub affects_to: Vec<String>,
    pub transparency_notes: String,
}

impl EnrichmentResult {
    /// Deterministic fallback used when the service response is unusable.
    pub fn placeholder(title: &str) -> Self {
        Self {
            summary_plain_es: format!("{PLACEHOLDER_SUMMARY_PREFIX} {title}"),
            keywords: Vec::new(),
            affects_to: Vec::new(),
            transparency_notes: DEFAULT_TRANSPARENCY_NOTE.to_string(),
        }
    }

    /// Whether this result came from [`EnrichmentResult::placeholder`].
    pub fn is_placeholder(&self) -> bool {
        self.summary_plain_es.starts_with(PLACEHOLDER_SUMMARY_PREFIX)
    }

    /// Trim entries, drop empty ones and apply the list caps.
    pub fn normalized(self) -> Self {
        Self {
            summary_plain_es: self.summary_plain_es.trim().to_string(),
            keywords: clean_list(self.keywords, MAX_KEYWORDS),
            affects_to: clean_list(self.affects_to, MAX_AFFECTED_GROUPS),
            transparency_notes: self.transparency_notes.trim().to_string(),
        }
    }
}

fn clean_list(items: Vec<String>, cap: usize) -> Vec<String> {
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .take(cap)
        .collect()
}

// ---------------------------------------------------------------------------
// CacheEntry
// ---------------------------------------------------------------------------

/// A stored service answer, addressed by the fingerprint of its prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The full rendered payload that was sent.
    pub prompt: String,
    /// Raw response text as returned by the service.
    pub response: String,
    /// When the entry was written.
    pub timestamp: DateTime<Utc>,
    /// Model identifier that produced the response.
    pub model: String,
}
