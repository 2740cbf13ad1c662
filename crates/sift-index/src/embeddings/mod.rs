//! Embedding provider trait and the HTTP implementation.
//!
//! Providers make exactly one attempt per call and report failures through
//! [`EmbedError`]. Retrying, backoff and batch shrinking are the pipeline's
//! job, driven by the error variant.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

const OPENROUTER_EMBEDDINGS_URL: &str = "https://openrouter.ai/api/v1/embeddings";
const DEFAULT_MODEL: &str = "qwen/qwen3-embedding-8b";
const DEFAULT_MAX_BATCH: usize = 32;

/// How a single provider call went wrong.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmbedError {
    #[error("rate limited by provider (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("batch payload rejected as too large")]
    PayloadTooLarge,

    #[error("provider call failed: {0}")]
    Transient(String),
}

/// Turns entity texts into vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// One vector per text, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;

    fn dimensions(&self) -> usize;

    fn model_name(&self) -> &str;

    /// Hard upper bound on texts per request.
    fn max_batch_size(&self) -> usize {
        DEFAULT_MAX_BATCH
    }
}

#[derive(Serialize)]
struct EmbedRequestBody<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponseBody {
    data: Vec<EmbedItem>,
}

#[derive(Deserialize)]
struct EmbedItem {
    index: usize,
    embedding: Vec<f32>,
}

/// Client for an OpenAI-compatible `/embeddings` endpoint; OpenRouter unless
/// [`HttpEmbeddings::with_base_url`] points it elsewhere.
pub struct HttpEmbeddings {
    http: Client,
    endpoint: String,
    api_key: String,
    model: String,
    dims: usize,
    batch_cap: usize,
}

impl HttpEmbeddings {
    pub fn new(api_key: String, model: Option<String>, dimensions: Option<usize>) -> Self {
        Self {
            http: Client::new(),
            endpoint: OPENROUTER_EMBEDDINGS_URL.to_owned(),
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_owned()),
            dims: dimensions.unwrap_or(crate::DEFAULT_DIMENSIONS),
            batch_cap: DEFAULT_MAX_BATCH,
        }
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.endpoint = url;
        self
    }

    /// Zero is clamped to one.
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.batch_cap = size.max(1);
        self
    }

    async fn post(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let body = EmbedRequestBody {
            model: &self.model,
            input: texts,
        };
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| EmbedError::Transient(format!("request to {} failed: {e}", self.endpoint)))?;

        let status = response.status();
        if status.is_success() {
            let parsed: EmbedResponseBody = response
                .json()
                .await
                .map_err(|e| EmbedError::Transient(format!("malformed embeddings response: {e}")))?;
            return collect_vectors(parsed, texts.len(), self.dims);
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let detail = response.text().await.unwrap_or_default();
        let err = classify_failure(status, retry_after, &detail);
        warn!(status = status.as_u16(), texts = texts.len(), "embedding call rejected: {err}");
        Err(err)
    }
}

/// Seconds form only; HTTP-date values are ignored.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Map a non-success response onto the error variant the retry loop acts on.
/// Some providers report oversized input as a 400 with a descriptive body.
fn classify_failure(status: StatusCode, retry_after: Option<Duration>, detail: &str) -> EmbedError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => EmbedError::RateLimited { retry_after },
        StatusCode::PAYLOAD_TOO_LARGE => EmbedError::PayloadTooLarge,
        StatusCode::BAD_REQUEST if mentions_oversize(detail) => EmbedError::PayloadTooLarge,
        other => EmbedError::Transient(format!("HTTP {}: {}", other.as_u16(), detail.trim())),
    }
}

fn mentions_oversize(detail: &str) -> bool {
    let detail = detail.to_ascii_lowercase();
    ["too large", "too many", "maximum context"]
        .iter()
        .any(|needle| detail.contains(needle))
}

/// Reorder by `index` and reject responses that miss inputs or return
/// vectors of the wrong width.
fn collect_vectors(
    body: EmbedResponseBody,
    expected: usize,
    dims: usize,
) -> Result<Vec<Vec<f32>>, EmbedError> {
    let mut items = body.data;
    if items.len() != expected {
        return Err(EmbedError::Transient(format!(
            "asked for {expected} embeddings, provider returned {}",
            items.len()
        )));
    }
    items.sort_unstable_by_key(|item| item.index);
    if let Some(bad) = items.iter().find(|item| item.embedding.len() != dims) {
        return Err(EmbedError::Transient(format!(
            "embedding {} has {} dimensions, expected {dims}",
            bad.index,
            bad.embedding.len()
        )));
    }
    Ok(items.into_iter().map(|item| item.embedding).collect())
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddings {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!(texts = texts.len(), model = %self.model, "embedding batch");
        self.post(texts).await
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn max_batch_size(&self) -> usize {
        self.batch_cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(index: usize, embedding: Vec<f32>) -> EmbedItem {
        EmbedItem { index, embedding }
    }

    #[test]
    fn defaults_target_openrouter() {
        let provider = HttpEmbeddings::new("k".into(), None, None);
        assert_eq!(provider.endpoint, OPENROUTER_EMBEDDINGS_URL);
        assert_eq!(provider.model_name(), DEFAULT_MODEL);
        assert_eq!(provider.dimensions(), crate::DEFAULT_DIMENSIONS);
        assert_eq!(provider.max_batch_size(), DEFAULT_MAX_BATCH);
    }

    #[test]
    fn builder_overrides_apply() {
        let provider = HttpEmbeddings::new("k".into(), Some("local/embed".into()), Some(8))
            .with_base_url("http://localhost:9000/v1/embeddings".into())
            .with_max_batch_size(0);
        assert_eq!(provider.endpoint, "http://localhost:9000/v1/embeddings");
        assert_eq!(provider.model_name(), "local/embed");
        assert_eq!(provider.dimensions(), 8);
        assert_eq!(provider.max_batch_size(), 1);
    }

    #[test]
    fn vectors_come_back_in_input_order() {
        let body = EmbedResponseBody {
            data: vec![item(1, vec![0.0, 2.0]), item(0, vec![1.0, 0.0])],
        };
        let vectors = collect_vectors(body, 2, 2).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 2.0]]);
    }

    #[test]
    fn short_or_misshapen_responses_are_transient() {
        let short = EmbedResponseBody { data: vec![item(0, vec![1.0])] };
        assert!(matches!(collect_vectors(short, 2, 1), Err(EmbedError::Transient(_))));

        let narrow = EmbedResponseBody { data: vec![item(0, vec![1.0])] };
        assert!(matches!(collect_vectors(narrow, 1, 3), Err(EmbedError::Transient(_))));
    }

    #[test]
    fn statuses_map_to_retry_classes() {
        let wait = Some(Duration::from_secs(3));
        assert_eq!(
            classify_failure(StatusCode::TOO_MANY_REQUESTS, wait, ""),
            EmbedError::RateLimited { retry_after: wait }
        );
        assert_eq!(
            classify_failure(StatusCode::PAYLOAD_TOO_LARGE, None, ""),
            EmbedError::PayloadTooLarge
        );
        assert_eq!(
            classify_failure(StatusCode::BAD_REQUEST, None, "Input exceeds maximum context length"),
            EmbedError::PayloadTooLarge
        );
        assert!(matches!(
            classify_failure(StatusCode::BAD_REQUEST, None, "unknown model"),
            EmbedError::Transient(_)
        ));
        assert!(matches!(
            classify_failure(StatusCode::BAD_GATEWAY, None, "upstream"),
            EmbedError::Transient(_)
        ));
    }

    #[test]
    fn retry_after_accepts_seconds_only() {
        assert_eq!(parse_retry_after(" 7 "), Some(Duration::from_secs(7)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2026 07:28:00 GMT"), None);
    }

    #[tokio::test]
    async fn empty_batch_skips_the_network() {
        let provider = HttpEmbeddings::new("k".into(), None, None)
            .with_base_url("http://127.0.0.1:1/embeddings".into());
        assert!(provider.embed_batch(&[]).await.unwrap().is_empty());
    }
}
