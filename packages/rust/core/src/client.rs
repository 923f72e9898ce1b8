//! Enrichment client: prompt construction, response parsing, bounded retry
//! and fingerprint caching over a [`GenerationService`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use docenrich_shared::{
    CacheEntry, DocEnrichError, EnrichmentResult, Result, RetryConfig, ServiceErrorKind,
};
use docenrich_storage::{Fingerprint, FingerprintCache};

use crate::service::{CompletionRequest, CompletionResponse, GenerationService};

/// System instructions for the four-field enrichment object.
pub const ENRICHMENT_SYSTEM_PROMPT: &str = "\
Eres un asistente que explica documentos oficiales de la administración pública española \
a la ciudadanía en un lenguaje claro y sencillo.

Responde ÚNICAMENTE con un objeto JSON con exactamente estos cuatro campos:
- \"summary_plain_es\": resumen en español llano de 2 a 4 frases.
- \"keywords\": lista de hasta 8 palabras clave en minúsculas.
- \"affects_to\": lista de hasta 3 colectivos afectados (por ejemplo \"autonomos\", \"empresas\", \"funcionarios\", \"estudiantes\", \"ciudadania_general\").
- \"transparency_notes\": una frase que explique por qué este documento importa a la ciudadanía.

No añadas texto fuera del objeto JSON.";

/// System instructions for the optional short editorial headline.
pub const SHORT_TITLE_SYSTEM_PROMPT: &str = "\
Eres un editor que escribe titulares breves y claros para documentos oficiales.

Responde ÚNICAMENTE con un objeto JSON de la forma {\"short_title\": \"...\"}. \
El titular debe tener como máximo 12 palabras, sin jerga jurídica ni siglas sin explicar.";

/// Token bound for short-title requests.
const SHORT_TITLE_MAX_TOKENS: u32 = 60;

/// Characters kept from the original title when no short title is available.
pub const SHORT_TITLE_FALLBACK_CHARS: usize = 100;

/// Longest text prefix of at most `budget` characters. Never splits a char.
pub fn truncate_chars(text: &str, budget: usize) -> &str {
    match text.char_indices().nth(budget) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

/// Fallback short title: the first [`SHORT_TITLE_FALLBACK_CHARS`] characters of the title.
pub fn fallback_short_title(title: &str) -> String {
    truncate_chars(title.trim(), SHORT_TITLE_FALLBACK_CHARS).to_string()
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Point-in-time copy of the client counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientCounters {
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub service_calls: usize,
    pub retries: usize,
}

impl ClientCounters {
    /// Counters accumulated since `earlier`.
    pub fn since(&self, earlier: &ClientCounters) -> ClientCounters {
        ClientCounters {
            cache_hits: self.cache_hits.saturating_sub(earlier.cache_hits),
            cache_misses: self.cache_misses.saturating_sub(earlier.cache_misses),
            service_calls: self.service_calls.saturating_sub(earlier.service_calls),
            retries: self.retries.saturating_sub(earlier.retries),
        }
    }
}

#[derive(Debug, Default)]
struct Stats {
    cache_hits: AtomicUsize,
    cache_misses: AtomicUsize,
    service_calls: AtomicUsize,
    retries: AtomicUsize,
}

// ---------------------------------------------------------------------------
// EnrichmentClient
// ---------------------------------------------------------------------------

/// Adapter over the generation service used by every worker.
///
/// Shared behind an `Arc`; all state is either immutable or atomic.
pub struct EnrichmentClient {
    service: Arc<dyn GenerationService>,
    cache: Arc<dyn FingerprintCache>,
    retry: RetryConfig,
    text_budget_chars: usize,
    stats: Stats,
}

impl EnrichmentClient {
    pub fn new(
        service: Arc<dyn GenerationService>,
        cache: Arc<dyn FingerprintCache>,
        retry: RetryConfig,
        text_budget_chars: usize,
    ) -> Self {
        Self {
            service,
            cache,
            retry,
            text_budget_chars,
            stats: Stats::default(),
        }
    }

    pub fn counters(&self) -> ClientCounters {
        ClientCounters {
            cache_hits: self.stats.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.stats.cache_misses.load(Ordering::Relaxed),
            service_calls: self.stats.service_calls.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
        }
    }

    /// Build the enrichment request for a document. Text beyond the budget is
    /// dropped silently, keeping the prefix.
    pub fn enrichment_request(&self, title: &str, text: &str) -> CompletionRequest {
        let excerpt = truncate_chars(text, self.text_budget_chars);
        CompletionRequest::new(
            ENRICHMENT_SYSTEM_PROMPT,
            format!("Título: {title}\n\nTexto del documento:\n{excerpt}"),
        )
    }

    /// Derive the four enrichment fields for a document.
    ///
    /// Fails with a `Service` error once retries are exhausted, or with
    /// `MalformedResponse` when the answer holds no valid object. Malformed
    /// answers are never retried here.
    pub async fn enrich(&self, title: &str, text: &str) -> Result<EnrichmentResult> {
        let request = self.enrichment_request(title, text);
        self.cached_call(&request, parse_enrichment).await
    }

    /// Ask for a headline of at most twelve words.
    pub async fn short_title(&self, title: &str, summary: &str) -> Result<String> {
        let request = CompletionRequest::new(
            SHORT_TITLE_SYSTEM_PROMPT,
            format!("Título original: {title}\n\nResumen: {summary}"),
        )
        .with_max_tokens(SHORT_TITLE_MAX_TOKENS);
        self.cached_call(&request, parse_short_title).await
    }

    /// Cache lookup, then service call with retry, then cache write.
    ///
    /// Only answers that parse are stored, so a bad answer is asked again on
    /// the next run instead of being replayed forever.
    async fn cached_call<T>(
        &self,
        request: &CompletionRequest,
        parse: fn(&str) -> Result<T>,
    ) -> Result<T> {
        let fingerprint = Fingerprint::of(&[&request.system, &request.user]);

        match self.cache.get(&fingerprint).await {
            Ok(Some(entry)) => match parse(&entry.response) {
                Ok(parsed) => {
                    self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                    debug!(%fingerprint, "using cached response");
                    return Ok(parsed);
                }
                Err(e) => {
                    warn!(%fingerprint, error = %e, "cached response unusable, treating as miss");
                }
            },
            Ok(None) => {}
            Err(e) => {
                warn!(%fingerprint, error = %e, error_class = e.class(), "cache read failed, treating as miss");
            }
        }
        self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);

        let response = self.call_with_retry(request, &fingerprint).await?;
        let parsed = parse(&response.content)?;

        let entry = CacheEntry {
            prompt: request.rendered(),
            response: response.content,
            timestamp: Utc::now(),
            model: response.model,
        };
        if let Err(e) = self.cache.put(&fingerprint, &entry).await {
            warn!(%fingerprint, error = %e, error_class = e.class(), "cache write failed");
        }

        Ok(parsed)
    }

    async fn call_with_retry(
        &self,
        request: &CompletionRequest,
        fingerprint: &Fingerprint,
    ) -> Result<CompletionResponse> {
        let mut waited = Duration::ZERO;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            self.stats.service_calls.fetch_add(1, Ordering::Relaxed);

            let err = match self.service.complete(request).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };

            if !err.is_retryable() || attempt >= self.retry.max_attempts {
                return Err(err);
            }

            let delay = self.retry_delay(attempt - 1, &err);
            if waited + delay > self.retry.max_total_wait {
                warn!(%fingerprint, attempt, waited_ms = waited.as_millis() as u64, "retry wait budget exhausted");
                return Err(err);
            }

            warn!(
                %fingerprint,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "service call failed, retrying"
            );
            self.stats.retries.fetch_add(1, Ordering::Relaxed);
            waited += delay;
            tokio::time::sleep(delay).await;
        }
    }

    /// Exponential backoff, stretched to honour `retry-after`, capped per attempt.
    fn retry_delay(&self, retry: u32, err: &DocEnrichError) -> Duration {
        let backoff = self.retry.backoff(retry);
        let hinted = match err {
            DocEnrichError::Service {
                kind: ServiceErrorKind::RateLimited {
                    retry_after: Some(after),
                },
                ..
            } => backoff.max(*after),
            _ => backoff,
        };
        hinted.min(self.retry.max_delay)
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

/// Parse the four-field object out of raw response text.
pub fn parse_enrichment(raw: &str) -> Result<EnrichmentResult> {
    let result = extract_json::<EnrichmentResult>(raw)
        .ok_or_else(|| malformed("no valid enrichment object", raw))?
        .normalized();
    if result.summary_plain_es.is_empty() {
        return Err(malformed("empty summary", raw));
    }
    Ok(result)
}

#[derive(Deserialize)]
struct ShortTitle {
    short_title: String,
}

fn parse_short_title(raw: &str) -> Result<String> {
    let title = extract_json::<ShortTitle>(raw)
        .map(|t| t.short_title.trim().to_string())
        .ok_or_else(|| malformed("no short_title object", raw))?;
    if title.is_empty() {
        return Err(malformed("empty short_title", raw));
    }
    Ok(title)
}

/// Try the whole text, then a fenced ```json block, then the outermost braces.
fn extract_json<T: DeserializeOwned>(raw: &str) -> Option<T> {
    static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("valid regex")
    });

    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    if let Some(value) = FENCE_RE
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .and_then(|m| serde_json::from_str(m.as_str()).ok())
    {
        return Some(value);
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

fn malformed(reason: &str, raw: &str) -> DocEnrichError {
    let snippet: String = raw.chars().take(120).collect();
    DocEnrichError::MalformedResponse(format!("{reason} (got: {snippet})"))
}
