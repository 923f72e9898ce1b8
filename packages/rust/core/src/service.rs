//! Generation service seam and its OpenAI-compatible HTTP implementation.
//!
//! The enrichment client only ever talks to a [`GenerationService`]; the HTTP
//! details (auth header, `response_format`, status classification) stay here.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use tracing::debug;

use docenrich_shared::{DocEnrichError, Result, ServiceConfig, ServiceErrorKind};

/// One chat-completion style request: system instructions plus user content.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    /// Overrides the configured token bound for short answers.
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            max_tokens: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// The payload exactly as it is stored for audit next to a cached answer.
    pub fn rendered(&self) -> String {
        format!("{}\n\n{}", self.system, self.user)
    }
}

/// Raw message content returned by the service.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResponse {
    pub content: String,
    pub model: String,
}

/// Anything that can turn a [`CompletionRequest`] into text.
///
/// Implementations classify failures into [`ServiceErrorKind`] so the caller
/// can decide what to retry.
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// The returned `model` is recorded with cached responses.
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse>;
}

// ---------------------------------------------------------------------------
// OpenAI-compatible HTTP service
// ---------------------------------------------------------------------------

/// Chat-completions client for OpenAI and API-compatible gateways.
pub struct OpenAiCompatibleService {
    http: reqwest::Client,
    config: ServiceConfig,
    endpoint: String,
}

impl OpenAiCompatibleService {
    pub fn new(config: ServiceConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("docenrich/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DocEnrichError::config(format!("failed to build HTTP client: {e}")))?;

        let endpoint = format!(
            "{}/chat/completions",
            config.base_url.as_str().trim_end_matches('/')
        );

        Ok(Self {
            http,
            config,
            endpoint,
        })
    }

    fn request_body(&self, request: &CompletionRequest) -> serde_json::Value {
        serde_json::json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.user },
            ],
            "max_tokens": request.max_tokens.unwrap_or(self.config.max_tokens),
            "temperature": self.config.temperature,
            "response_format": { "type": "json_object" },
        })
    }
}

#[async_trait]
impl GenerationService for OpenAiCompatibleService {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&self.request_body(request))
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, &body));
        }

        let data: serde_json::Value = response.json().await.map_err(classify_transport)?;

        let content = data["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                DocEnrichError::MalformedResponse("response has no message content".into())
            })?
            .to_string();

        let model = data["model"]
            .as_str()
            .unwrap_or(&self.config.model)
            .to_string();

        debug!(
            %model,
            prompt_tokens = data["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            completion_tokens = data["usage"]["completion_tokens"].as_u64().unwrap_or(0),
            "completion received"
        );

        Ok(CompletionResponse { content, model })
    }
}

fn classify_transport(e: reqwest::Error) -> DocEnrichError {
    let kind = if e.is_timeout() {
        ServiceErrorKind::Timeout
    } else {
        ServiceErrorKind::Transport
    };
    DocEnrichError::service(kind, e.to_string())
}

fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> DocEnrichError {
    let code = status.as_u16();
    let kind = match status {
        StatusCode::TOO_MANY_REQUESTS => ServiceErrorKind::RateLimited { retry_after },
        StatusCode::REQUEST_TIMEOUT => ServiceErrorKind::Server { status: code },
        s if s.is_server_error() => ServiceErrorKind::Server { status: code },
        _ => ServiceErrorKind::Rejected { status: code },
    };
    let snippet: String = body.chars().take(200).collect();
    DocEnrichError::service(kind, format!("HTTP {code}: {snippet}"))
}

/// Longest `retry-after` honoured. The retry budget caps the real wait anyway.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// `retry-after` in delta-seconds form. HTTP-date values are ignored.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(|secs| {
            Duration::try_from_secs_f64(secs)
                .unwrap_or(MAX_RETRY_AFTER)
                .min(MAX_RETRY_AFTER)
        })
}
