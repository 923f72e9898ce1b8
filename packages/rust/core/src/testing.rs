//! Scripted generation service and cache doubles used by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use docenrich_shared::{CacheEntry, DocEnrichError, Result, ServiceErrorKind};
use docenrich_storage::{Fingerprint, FingerprintCache};

use crate::client::SHORT_TITLE_SYSTEM_PROMPT;
use crate::service::{CompletionRequest, CompletionResponse, GenerationService};

pub(crate) const SCRIPTED_MODEL: &str = "scripted-model";

type Predicate = fn(&CompletionRequest) -> bool;

/// A valid four-field answer with the given summary.
pub(crate) fn enrichment_json(summary: &str) -> String {
    serde_json::json!({
        "summary_plain_es": summary,
        "keywords": ["hacienda", "presupuestos"],
        "affects_to": ["ciudadania_general"],
        "transparency_notes": "Afecta al uso del dinero público."
    })
    .to_string()
}

fn echo_response(request: &CompletionRequest) -> String {
    if request.system == SHORT_TITLE_SYSTEM_PROMPT {
        return serde_json::json!({ "short_title": "Titular breve" }).to_string();
    }
    let title = request
        .user
        .lines()
        .next()
        .unwrap_or_default()
        .trim_start_matches("Título: ");
    enrichment_json(&format!("Resumen de {title}"))
}

fn garbage_response(_: &CompletionRequest) -> String {
    "Lo siento, hoy no tengo un JSON para ti.".to_string()
}

/// Deterministic [`GenerationService`] double.
///
/// Answers are a pure function of the request, so identical prompts always
/// get identical answers. Failures, panics and latency are scripted per call
/// or per request.
pub(crate) struct ScriptedService {
    respond: fn(&CompletionRequest) -> String,
    fail_first: Option<(usize, ServiceErrorKind)>,
    fail_when: Option<(Predicate, ServiceErrorKind)>,
    panic_when: Option<Predicate>,
    latency: Option<fn(&CompletionRequest) -> Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedService {
    fn with_responder(respond: fn(&CompletionRequest) -> String) -> Self {
        Self {
            respond,
            fail_first: None,
            fail_when: None,
            panic_when: None,
            latency: None,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Always answers with a valid object summarising the title line.
    pub fn echoing() -> Self {
        Self::with_responder(echo_response)
    }

    /// Always answers with prose instead of JSON.
    pub fn garbage() -> Self {
        Self::with_responder(garbage_response)
    }

    pub fn fail_first(mut self, calls: usize, kind: ServiceErrorKind) -> Self {
        self.fail_first = Some((calls, kind));
        self
    }

    pub fn fail_when(mut self, predicate: Predicate, kind: ServiceErrorKind) -> Self {
        self.fail_when = Some((predicate, kind));
        self
    }

    pub fn panic_when(mut self, predicate: Predicate) -> Self {
        self.panic_when = Some(predicate);
        self
    }

    pub fn with_latency(mut self, latency: fn(&CompletionRequest) -> Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl GenerationService for ScriptedService {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency(request)).await;
        }

        if self.panic_when.is_some_and(|p| p(request)) {
            panic!("scripted panic");
        }
        if let Some((n, kind)) = self.fail_first {
            if call < n {
                return Err(DocEnrichError::service(kind, format!("scripted failure #{call}")));
            }
        }
        if let Some((predicate, kind)) = self.fail_when {
            if predicate(request) {
                return Err(DocEnrichError::service(kind, "scripted failure"));
            }
        }

        Ok(CompletionResponse {
            content: (self.respond)(request),
            model: SCRIPTED_MODEL.to_string(),
        })
    }
}

/// Cache whose every read and write fails with `CacheIo`.
#[derive(Default)]
pub(crate) struct BrokenCache {
    gets: AtomicUsize,
    puts: AtomicUsize,
}

impl BrokenCache {
    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FingerprintCache for BrokenCache {
    async fn get(&self, _fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        Err(DocEnrichError::CacheIo("disk unavailable".into()))
    }

    async fn put(&self, _fingerprint: &Fingerprint, _entry: &CacheEntry) -> Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        Err(DocEnrichError::CacheIo("disk full".into()))
    }
}
