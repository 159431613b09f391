//! HTTP implementations of the external service traits.
//!
//! Thin reqwest clients. Status classification maps HTTP failures onto the
//! error taxonomy: 429 and 5xx are throttling-class (retryable by the
//! shared backoff wrapper; no retry loops live here), 400 is bad-request,
//! 401/403 is auth, and transport errors carry no HTTP status. Each client
//! applies its own per-call timeout, independent of the document-level
//! wall-clock ceiling.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};

use docgraph_core::chunk::PageText;

use crate::config::EndpointConfig;
use crate::error::ServiceError;
use crate::services::{CompletionOutput, CompletionService, EmbeddingService, OcrService};

fn build_client(config: &EndpointConfig) -> Client {
    Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .unwrap_or_default()
}

fn require_url(url: &Option<String>, service: &str) -> Result<String, ServiceError> {
    url.clone()
        .ok_or_else(|| ServiceError::BadRequest(format!("services.{}.url not configured", service)))
}

/// Map a non-success response onto the error taxonomy.
async fn classify_failure(response: Response) -> ServiceError {
    let status = response.status();
    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return ServiceError::Throttled { retry_after };
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ServiceError::Auth(format!("{}: {}", status, body))
        }
        _ => ServiceError::BadRequest(format!("{}: {}", status, body)),
    }
}

// ============ Completion ============

/// Completion client posting `{model, prompt, max_output}` JSON and reading
/// `{text, input_units, output_units}` back.
pub struct HttpCompletionService {
    client: Client,
    url: Option<String>,
    model: Option<String>,
}

impl HttpCompletionService {
    pub fn new(config: &EndpointConfig) -> Self {
        Self {
            client: build_client(config),
            url: config.url.clone(),
            model: config.model.clone(),
        }
    }
}

#[async_trait]
impl CompletionService for HttpCompletionService {
    async fn complete(
        &self,
        prompt: &str,
        max_output_units: i64,
    ) -> Result<CompletionOutput, ServiceError> {
        let url = require_url(&self.url, "completion")?;
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "max_output": max_output_units,
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(classify_failure(response).await);
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ServiceError::InvalidResponse(e.to_string()))?;

        let text = json
            .get("text")
            .and_then(|t| t.as_str())
            .ok_or_else(|| ServiceError::InvalidResponse("missing text field".into()))?
            .to_string();
        let input_units = json.get("input_units").and_then(|v| v.as_i64()).unwrap_or(0);
        let output_units = json
            .get("output_units")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);

        Ok(CompletionOutput {
            text,
            input_units,
            output_units,
        })
    }
}

// ============ Embedding ============

/// Embedding client posting `{model, input: [...]}` and reading
/// `{embeddings: [[...], ...]}` back, one vector per input in order.
pub struct HttpEmbeddingService {
    client: Client,
    url: Option<String>,
    model: Option<String>,
}

impl HttpEmbeddingService {
    pub fn new(config: &EndpointConfig) -> Self {
        Self {
            client: build_client(config),
            url: config.url.clone(),
            model: config.model.clone(),
        }
    }
}

#[async_trait]
impl EmbeddingService for HttpEmbeddingService {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        let url = require_url(&self.url, "embedding")?;
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(classify_failure(response).await);
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ServiceError::InvalidResponse(e.to_string()))?;

        let embeddings = json
            .get("embeddings")
            .and_then(|e| e.as_array())
            .ok_or_else(|| ServiceError::InvalidResponse("missing embeddings array".into()))?;

        let mut result = Vec::with_capacity(embeddings.len());
        for embedding in embeddings {
            let vec: Vec<f32> = embedding
                .as_array()
                .ok_or_else(|| {
                    ServiceError::InvalidResponse("embedding is not an array".into())
                })?
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect();
            result.push(vec);
        }

        if result.len() != texts.len() {
            return Err(ServiceError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                result.len()
            )));
        }

        Ok(result)
    }
}

// ============ OCR ============

/// OCR client posting raw document bytes and reading
/// `{pages: [{page, text}, ...]}` back.
pub struct HttpOcrService {
    client: Client,
    url: Option<String>,
}

impl HttpOcrService {
    pub fn new(config: &EndpointConfig) -> Self {
        Self {
            client: build_client(config),
            url: config.url.clone(),
        }
    }
}

#[async_trait]
impl OcrService for HttpOcrService {
    async fn recognize(
        &self,
        document: &[u8],
        _page_count: i64,
    ) -> Result<Vec<PageText>, ServiceError> {
        let url = require_url(&self.url, "ocr")?;
        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/pdf")
            .body(document.to_vec())
            .send()
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(classify_failure(response).await);
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ServiceError::InvalidResponse(e.to_string()))?;

        let pages = json
            .get("pages")
            .and_then(|p| p.as_array())
            .ok_or_else(|| ServiceError::InvalidResponse("missing pages array".into()))?;

        let mut result = Vec::with_capacity(pages.len());
        for (i, page) in pages.iter().enumerate() {
            let number = page
                .get("page")
                .and_then(|v| v.as_i64())
                .unwrap_or(i as i64 + 1);
            let text = page
                .get("text")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string();
            result.push(PageText::new(number, text));
        }

        Ok(result)
    }
}
