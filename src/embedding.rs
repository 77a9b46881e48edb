//! Embedding provider abstraction and HTTP client.
//!
//! Chunks are vectorized by an external embedding service. Two wire formats
//! are supported:
//!
//! - **`ollama`** — `POST <base>/api/embed` with `{model, input}` returning
//!   `{embeddings: [[f32]]}` (the default, no auth).
//! - **`openai`** — `POST <base>/v1/embeddings` with a Bearer key returning
//!   `{data: [{embedding: [f32]}]}`.
//!
//! Each content-type bucket (`code` / `docs`) can point at a different
//! provider, URL, key, and model via the per-bucket environment overrides.
//!
//! # Retry Strategy
//!
//! Connect errors, timeouts, and HTTP 5xx are retried up to `max_retries`
//! attempts with exponential backoff (`backoff_base_ms * 2^attempt`).
//! HTTP 4xx and response-validation failures are fatal immediately. After
//! exhausting attempts the last cause is wrapped in
//! [`EmbedderError::RetryExhausted`].

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::classify::ContentType;

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_EMBEDDING_MODEL: &str = "manutic/nomic-embed-code";
pub const DEFAULT_EMBEDDING_BATCH_SIZE: usize = 16;
pub const DEFAULT_EMBEDDING_MAX_RETRIES: u32 = 5;
pub const DEFAULT_EMBEDDING_BACKOFF_BASE_MS: u64 = 500;
pub const DEFAULT_EMBEDDING_TIMEOUT_SECONDS: u64 = 120;

#[derive(Debug, Error)]
pub enum EmbedderError {
    /// The response shape was wrong (count or vector-size mismatch).
    /// Never retried.
    #[error("invalid embedder response: {0}")]
    Validation(String),
    /// All retry attempts were consumed; wraps the last cause.
    #[error("embedding failed after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<EmbedderError>,
    },
    /// Non-success HTTP status from the embedding service.
    #[error("embedder returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    /// Transport-level failure (connect, timeout, decode).
    #[error("embedder request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{0}")]
    Other(String),
}

impl EmbedderError {
    fn is_retryable(&self) -> bool {
        match self {
            EmbedderError::Request(err) => err.is_connect() || err.is_timeout(),
            EmbedderError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Resolved embedder settings, frozen after construction.
#[derive(Debug, Clone)]
pub struct EmbedderConfig {
    pub provider: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub batch_size: usize,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub timeout_seconds: u64,
}

fn resolve_int<T: std::str::FromStr>(raw: Option<String>, default: T, label: &str) -> Result<T> {
    match raw {
        None => Ok(default),
        Some(value) => match value.trim().parse::<T>() {
            Ok(parsed) => Ok(parsed),
            Err(_) => bail!("{} must be a valid integer, got '{}'", label, value),
        },
    }
}

/// Resolve the embedder configuration for one content-type bucket.
///
/// Per-bucket variables (`EMBEDDING_PROVIDER_CODE`,
/// `EMBEDDING_PROVIDER_CODE_API_URL`, `EMBEDDING_MODEL_CODE`, ...) take
/// precedence over the shared ones (`OLLAMA_URL`, `EMBEDDING_MODEL`, ...).
pub fn load_embedder_config<E>(bucket: Option<ContentType>, env: E) -> Result<EmbedderConfig>
where
    E: Fn(&str) -> Option<String>,
{
    let suffix = bucket.map(|b| b.as_str().to_uppercase());
    let bucket_var = |stem: &str| -> Option<String> {
        suffix
            .as_ref()
            .and_then(|s| env(&stem.replace("{}", s)))
            .filter(|v| !v.trim().is_empty())
    };

    let provider = bucket_var("EMBEDDING_PROVIDER_{}")
        .unwrap_or_else(|| "ollama".to_string())
        .trim()
        .to_lowercase();

    match provider.as_str() {
        "ollama" | "openai" => {}
        other => bail!("unknown embedding provider: '{}'. Must be ollama or openai.", other),
    }

    let base_url = bucket_var("EMBEDDING_PROVIDER_{}_API_URL")
        .or_else(|| env("OLLAMA_URL"))
        .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string());

    let api_key = bucket_var("EMBEDDING_PROVIDER_{}_API_KEY");

    let model = bucket_var("EMBEDDING_MODEL_{}")
        .or_else(|| env("EMBEDDING_MODEL"))
        .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string());

    Ok(EmbedderConfig {
        provider,
        base_url,
        api_key,
        model,
        batch_size: resolve_int(
            env("EMBEDDING_BATCH_SIZE"),
            DEFAULT_EMBEDDING_BATCH_SIZE,
            "EMBEDDING_BATCH_SIZE",
        )?,
        max_retries: resolve_int(
            env("EMBEDDING_MAX_RETRIES"),
            DEFAULT_EMBEDDING_MAX_RETRIES,
            "EMBEDDING_MAX_RETRIES",
        )?,
        backoff_base_ms: resolve_int(
            env("EMBEDDING_BACKOFF_BASE_MS"),
            DEFAULT_EMBEDDING_BACKOFF_BASE_MS,
            "EMBEDDING_BACKOFF_BASE_MS",
        )?,
        timeout_seconds: resolve_int(
            env("EMBEDDING_TIMEOUT_SECONDS"),
            DEFAULT_EMBEDDING_TIMEOUT_SECONDS,
            "EMBEDDING_TIMEOUT_SECONDS",
        )?,
    })
}

/// Trait for embedding backends.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier used for collection naming and reporting.
    fn model_name(&self) -> &str;

    /// Batch size honored by [`Embedder::embed_texts_batched`].
    fn batch_size(&self) -> usize;

    /// Embed a batch of texts, optionally validating the vector size.
    async fn embed_texts(
        &self,
        texts: &[String],
        expected_vector_size: Option<usize>,
    ) -> Result<Vec<Vec<f32>>, EmbedderError>;

    /// Embed texts in groups of `batch_size`, preserving input order.
    async fn embed_texts_batched(
        &self,
        texts: &[String],
        expected_vector_size: Option<usize>,
    ) -> Result<Vec<Vec<f32>>, EmbedderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut all = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size().max(1)) {
            let embeddings = self.embed_texts(batch, expected_vector_size).await?;
            all.extend(embeddings);
        }
        Ok(all)
    }

    /// Discover the model's vector size by embedding the literal `"x"`.
    async fn probe_vector_size(&self) -> Result<usize, EmbedderError> {
        let embeddings = self.embed_texts(&["x".to_string()], None).await?;
        let size = embeddings.first().map(Vec::len).unwrap_or(0);
        if size == 0 {
            return Err(EmbedderError::Other(
                "empty response while probing vector size".to_string(),
            ));
        }
        info!(vector_size = size, "probed embedding vector size");
        Ok(size)
    }
}

/// HTTP embedder speaking the Ollama or OpenAI embedding wire format.
pub struct HttpEmbedder {
    config: EmbedderConfig,
    client: reqwest::Client,
}

impl HttpEmbedder {
    pub fn new(config: EmbedderConfig) -> Result<Self, EmbedderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &EmbedderConfig {
        &self.config
    }

    fn embed_url(&self) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        match self.config.provider.as_str() {
            "openai" => format!("{base}/v1/embeddings"),
            _ => format!("{base}/api/embed"),
        }
    }

    /// One attempt: POST the batch and parse the provider response.
    async fn request_embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        let body = serde_json::json!({
            "model": self.config.model,
            "input": texts,
        });

        let mut request = self.client.post(self.embed_url()).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbedderError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let json: Value = response.json().await?;
        let embeddings = match self.config.provider.as_str() {
            "openai" => parse_openai_embeddings(&json)?,
            _ => parse_ollama_embeddings(&json)?,
        };

        if embeddings.len() != texts.len() {
            return Err(EmbedderError::Validation(format!(
                "embedding count ({}) != text count ({})",
                embeddings.len(),
                texts.len()
            )));
        }

        Ok(embeddings)
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(
            self.config
                .backoff_base_ms
                .saturating_mul(1u64 << attempt.min(16)),
        )
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    async fn embed_texts(
        &self,
        texts: &[String],
        expected_vector_size: Option<usize>,
    ) -> Result<Vec<Vec<f32>>, EmbedderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let attempts = self.config.max_retries.max(1);
        let mut last_error: Option<EmbedderError> = None;

        for attempt in 0..attempts {
            match self.request_embeddings(texts).await {
                Ok(embeddings) => {
                    if let (Some(expected), Some(first)) =
                        (expected_vector_size, embeddings.first())
                    {
                        if first.len() != expected {
                            return Err(EmbedderError::Validation(format!(
                                "vector size ({}) != expected ({})",
                                first.len(),
                                expected
                            )));
                        }
                    }
                    return Ok(embeddings);
                }
                Err(err) => {
                    if !err.is_retryable() {
                        return Err(err);
                    }

                    if attempt + 1 < attempts {
                        let delay = self.backoff_delay(attempt);
                        warn!(
                            attempt = attempt + 1,
                            attempts,
                            error = %err,
                            delay_ms = delay.as_millis() as u64,
                            "embedding attempt failed, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_error = Some(err);
                }
            }
        }

        Err(EmbedderError::RetryExhausted {
            attempts,
            source: Box::new(
                last_error.unwrap_or_else(|| EmbedderError::Other("no attempt recorded".into())),
            ),
        })
    }
}

fn parse_ollama_embeddings(json: &Value) -> Result<Vec<Vec<f32>>, EmbedderError> {
    let embeddings = json
        .get("embeddings")
        .and_then(Value::as_array)
        .ok_or_else(|| EmbedderError::Validation("missing embeddings array".to_string()))?;

    embeddings.iter().map(parse_vector).collect()
}

fn parse_openai_embeddings(json: &Value) -> Result<Vec<Vec<f32>>, EmbedderError> {
    let data = json
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| EmbedderError::Validation("missing data array".to_string()))?;

    data.iter()
        .map(|item| {
            let embedding = item
                .get("embedding")
                .ok_or_else(|| EmbedderError::Validation("missing embedding field".to_string()))?;
            parse_vector(embedding)
        })
        .collect()
}

fn parse_vector(value: &Value) -> Result<Vec<f32>, EmbedderError> {
    let array = value
        .as_array()
        .ok_or_else(|| EmbedderError::Validation("embedding is not an array".to_string()))?;
    Ok(array
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

/// Build the embedder for one bucket from the environment.
pub fn create_embedder<E>(bucket: Option<ContentType>, env: E) -> Result<HttpEmbedder>
where
    E: Fn(&str) -> Option<String>,
{
    let config = load_embedder_config(bucket, env)?;
    debug!(provider = %config.provider, model = %config.model, "embedder configured");
    Ok(HttpEmbedder::new(config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::spawn_scripted_server;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    fn embedder_with(base_url: &str, max_retries: u32) -> HttpEmbedder {
        HttpEmbedder::new(EmbedderConfig {
            provider: "ollama".to_string(),
            base_url: base_url.to_string(),
            api_key: None,
            model: "test-model".to_string(),
            batch_size: 2,
            max_retries,
            backoff_base_ms: 1,
            timeout_seconds: 5,
        })
        .unwrap()
    }

    #[test]
    fn config_defaults_and_bucket_overrides() {
        let config = load_embedder_config(None, |_| None).unwrap();
        assert_eq!(config.provider, "ollama");
        assert_eq!(config.base_url, DEFAULT_OLLAMA_URL);
        assert_eq!(config.model, DEFAULT_EMBEDDING_MODEL);
        assert_eq!(config.batch_size, DEFAULT_EMBEDDING_BATCH_SIZE);

        let env = env_from(&[
            ("EMBEDDING_MODEL", "shared-model"),
            ("EMBEDDING_MODEL_DOCS", "docs-model"),
            ("EMBEDDING_PROVIDER_DOCS", "openai"),
            ("EMBEDDING_PROVIDER_DOCS_API_URL", "https://api.example.com"),
            ("EMBEDDING_PROVIDER_DOCS_API_KEY", "sk-test"),
        ]);
        let docs = load_embedder_config(Some(ContentType::Docs), &env).unwrap();
        assert_eq!(docs.provider, "openai");
        assert_eq!(docs.model, "docs-model");
        assert_eq!(docs.base_url, "https://api.example.com");
        assert_eq!(docs.api_key.as_deref(), Some("sk-test"));

        let code = load_embedder_config(Some(ContentType::Code), &env).unwrap();
        assert_eq!(code.provider, "ollama");
        assert_eq!(code.model, "shared-model");
    }

    #[test]
    fn config_rejects_bad_integers_and_providers() {
        let env = env_from(&[("EMBEDDING_BATCH_SIZE", "lots")]);
        let err = load_embedder_config(None, env).unwrap_err();
        assert!(err.to_string().contains("EMBEDDING_BATCH_SIZE"));

        let env = env_from(&[("EMBEDDING_PROVIDER_CODE", "mystery")]);
        let err = load_embedder_config(Some(ContentType::Code), env).unwrap_err();
        assert!(err.to_string().contains("mystery"));
    }

    #[tokio::test]
    async fn retries_5xx_then_succeeds() {
        let ok_body = r#"{"embeddings": [[0.1, 0.2, 0.3]]}"#.to_string();
        let base = spawn_scripted_server(vec![
            (500, "server busy".to_string()),
            (500, "server busy".to_string()),
            (200, ok_body),
        ]);

        let embedder = embedder_with(&base, 3);
        let result = embedder.embed_texts(&["x".to_string()], None).await.unwrap();
        assert_eq!(result, vec![vec![0.1, 0.2, 0.3]]);
    }

    #[tokio::test]
    async fn exhausts_retries_on_persistent_5xx() {
        let base = spawn_scripted_server(vec![(500, "down".to_string())]);

        let embedder = embedder_with(&base, 1);
        let err = embedder
            .embed_texts(&["x".to_string()], None)
            .await
            .unwrap_err();
        assert!(matches!(err, EmbedderError::RetryExhausted { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn client_errors_are_fatal_immediately() {
        let base = spawn_scripted_server(vec![(400, "bad request".to_string())]);

        let embedder = embedder_with(&base, 5);
        let err = embedder
            .embed_texts(&["x".to_string()], None)
            .await
            .unwrap_err();
        assert!(matches!(err, EmbedderError::Status { status: 400, .. }));
    }

    #[tokio::test]
    async fn count_mismatch_is_validation_error() {
        let body = r#"{"embeddings": [[0.1]]}"#.to_string();
        let base = spawn_scripted_server(vec![(200, body)]);

        let embedder = embedder_with(&base, 5);
        let err = embedder
            .embed_texts(&["a".to_string(), "b".to_string()], None)
            .await
            .unwrap_err();
        assert!(matches!(err, EmbedderError::Validation(_)));
    }

    #[tokio::test]
    async fn vector_size_mismatch_is_validation_error() {
        let body = r#"{"embeddings": [[0.1, 0.2]]}"#.to_string();
        let base = spawn_scripted_server(vec![(200, body)]);

        let embedder = embedder_with(&base, 5);
        let err = embedder
            .embed_texts(&["a".to_string()], Some(3))
            .await
            .unwrap_err();
        assert!(matches!(err, EmbedderError::Validation(_)));
    }

    #[tokio::test]
    async fn probe_reads_vector_length() {
        let body = r#"{"embeddings": [[0.0, 0.0, 0.0, 0.0]]}"#.to_string();
        let base = spawn_scripted_server(vec![(200, body)]);

        let embedder = embedder_with(&base, 1);
        assert_eq!(embedder.probe_vector_size().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn batched_embedding_preserves_order() {
        let batch1 = r#"{"embeddings": [[1.0], [2.0]]}"#.to_string();
        let batch2 = r#"{"embeddings": [[3.0]]}"#.to_string();
        let base = spawn_scripted_server(vec![(200, batch1), (200, batch2)]);

        let embedder = embedder_with(&base, 1);
        let texts = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let result = embedder.embed_texts_batched(&texts, None).await.unwrap();
        assert_eq!(result, vec![vec![1.0], vec![2.0], vec![3.0]]);
    }

    #[test]
    fn parses_openai_response_shape() {
        let json: Value = serde_json::from_str(
            r#"{"data": [{"embedding": [0.5, 0.25]}, {"embedding": [1.0, 2.0]}]}"#,
        )
        .unwrap();
        let parsed = parse_openai_embeddings(&json).unwrap();
        assert_eq!(parsed, vec![vec![0.5, 0.25], vec![1.0, 2.0]]);
    }
}
