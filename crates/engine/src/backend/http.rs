use async_trait::async_trait;
use resilience::{BackendError, RequestContext};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::Instant;

use super::normalize::l2_normalize_in_place;
use super::Backend;

/// Request/response shape of the remote endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiProvider {
    /// `{"inputs": [...]}` → nested arrays.
    #[serde(alias = "hf")]
    HuggingFace,
    /// `{"input": [...], "model": ...}` → `{"data": [{"embedding": [...]}]}`.
    #[serde(alias = "gpt")]
    OpenAi,
    /// `{"texts": [...]}` → `{"embeddings": [...]}`.
    #[default]
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpBackendConfig {
    pub url: String,
    #[serde(default)]
    pub provider: ApiProvider,
    #[serde(default)]
    pub model: String,
    /// Sent verbatim as the `Authorization` header.
    #[serde(default)]
    pub auth_header: Option<String>,
    pub dimension: usize,
    #[serde(default = "default_normalize")]
    pub normalize: bool,
    #[serde(with = "resilience::serde_millis", default = "default_timeout")]
    pub timeout: Duration,
}

fn default_normalize() -> bool {
    true
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

impl HttpBackendConfig {
    pub fn new(url: impl Into<String>, dimension: usize) -> Self {
        Self {
            url: url.into(),
            provider: ApiProvider::default(),
            model: String::new(),
            auth_header: None,
            dimension,
            normalize: default_normalize(),
            timeout: default_timeout(),
        }
    }

    pub fn with_provider(mut self, provider: ApiProvider, model: impl Into<String>) -> Self {
        self.provider = provider;
        self.model = model.into();
        self
    }

    pub fn with_auth_header(mut self, header: impl Into<String>) -> Self {
        self.auth_header = Some(header.into());
        self
    }
}

/// Backend that posts batches to a remote feature-extraction endpoint.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    name: String,
    config: HttpBackendConfig,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(name: impl Into<String>, config: HttpBackendConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(32)
            .build()
            .map_err(|e| BackendError::Other(format!("building HTTP client: {e}")))?;
        Ok(Self {
            name: name.into(),
            config,
            client,
        })
    }

    /// Request timeout: the configured one, shortened to the context deadline.
    fn timeout_for(&self, ctx: &RequestContext) -> Duration {
        match ctx.deadline() {
            Some(deadline) => self
                .config
                .timeout
                .min(deadline.saturating_duration_since(Instant::now())),
            None => self.config.timeout,
        }
    }

    async fn send(&self, ctx: &RequestContext, payload: Value) -> Result<Value, BackendError> {
        let mut request = self
            .client
            .post(&self.config.url)
            .timeout(self.timeout_for(ctx))
            .header("Content-Type", "application/json");
        if let Some(header) = self.config.auth_header.as_deref() {
            request = request.header("Authorization", header);
        }

        let response = request.json(&payload).send().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout(e.to_string())
            } else {
                BackendError::Connection(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), &body));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| BackendError::Malformed(format!("invalid JSON response: {e}")))
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn compute_vectors(
        &self,
        ctx: &RequestContext,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, BackendError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let payload = build_payload(self.config.provider, texts, &self.config.model);
        let response = self.send(ctx, payload).await?;
        let mut vectors = parse_embeddings(response)?;

        if vectors.len() != texts.len() {
            return Err(BackendError::Malformed(format!(
                "endpoint returned {} embeddings for {} inputs",
                vectors.len(),
                texts.len()
            )));
        }
        if self.config.normalize {
            for vector in &mut vectors {
                l2_normalize_in_place(vector);
            }
        }
        tracing::debug!(device = %self.name, texts = texts.len(), "remote batch embedded");
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// 408 is a timeout; 429 and 5xx mean the service is saturated or down; the
/// remaining 4xx codes are refusals that will not change on retry.
fn status_error(status: u16, body: &str) -> BackendError {
    let message = format!("HTTP {status}: {body}");
    match status {
        408 => BackendError::Timeout(message),
        429 | 500..=599 => BackendError::Connection(message),
        _ => BackendError::Rejected(message),
    }
}

fn build_payload(provider: ApiProvider, texts: &[String], model: &str) -> Value {
    match provider {
        ApiProvider::HuggingFace => json!({ "inputs": texts }),
        ApiProvider::OpenAi => json!({ "input": texts, "model": model }),
        ApiProvider::Custom => json!({ "texts": texts }),
    }
}

fn parse_embeddings(value: Value) -> Result<Vec<Vec<f32>>, BackendError> {
    match value {
        Value::Object(mut map) => {
            if let Some(embeddings) = map.remove("embeddings") {
                return parse_collection(embeddings);
            }
            if let Some(Value::Array(items)) = map.remove("data") {
                return items
                    .into_iter()
                    .map(|item| match item {
                        Value::Object(mut obj) => obj
                            .remove("embedding")
                            .ok_or_else(|| {
                                BackendError::Malformed("missing `embedding` in data item".into())
                            })
                            .and_then(parse_vector),
                        _ => Err(BackendError::Malformed(
                            "unexpected entry inside `data` array".into(),
                        )),
                    })
                    .collect();
            }
            Err(BackendError::Malformed("unsupported response shape".into()))
        }
        other => parse_collection(other),
    }
}

fn parse_collection(value: Value) -> Result<Vec<Vec<f32>>, BackendError> {
    match value {
        Value::Array(items) if items.is_empty() => Ok(Vec::new()),
        Value::Array(items) if items.iter().all(Value::is_array) => {
            items.into_iter().map(parse_vector).collect()
        }
        other => parse_vector(other).map(|vector| vec![vector]),
    }
}

fn parse_vector(value: Value) -> Result<Vec<f32>, BackendError> {
    match value {
        Value::Array(values) => values
            .into_iter()
            .map(|entry| match entry {
                Value::Number(num) => num
                    .as_f64()
                    .map(|f| f as f32)
                    .ok_or_else(|| BackendError::Malformed("non-finite embedding value".into())),
                other => Err(BackendError::Malformed(format!(
                    "embedding entries must be numbers, got {other:?}"
                ))),
            })
            .collect(),
        other => Err(BackendError::Malformed(format!(
            "embedding vector must be an array, got {other:?}"
        ))),
    }
}
