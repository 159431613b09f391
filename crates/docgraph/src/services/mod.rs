//! External service abstractions and implementations.
//!
//! The pipeline talks to three black-box collaborators (OCR, completion,
//! embedding) through async traits so orchestration code depends only
//! on the interface and tests inject mocks. HTTP implementations live in
//! [`http`]; the structured-markup envelope shared by completion prompts
//! and responses lives in [`markup`].

pub mod http;
pub mod markup;

use async_trait::async_trait;

use docgraph_core::chunk::PageText;

use crate::error::ServiceError;

/// Output of one completion call: raw text plus measured unit counts for
/// the cost ledger.
#[derive(Debug, Clone)]
pub struct CompletionOutput {
    pub text: String,
    pub input_units: i64,
    pub output_units: i64,
}

/// Text completion service.
///
/// The contract distinguishes a throttled failure class (retryable) from
/// all other failures; responses are expected to contain the structured
/// markup envelope but are returned raw; parsing is the caller's concern.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(
        &self,
        prompt: &str,
        max_output_units: i64,
    ) -> Result<CompletionOutput, ServiceError>;
}

/// Embedding generation service. Batchable; one vector per input text, in
/// input order, all of the same dimension.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError>;
}

/// OCR service: raw document bytes in, per-page plain text out. Treated as
/// a black box with only success/failure and text as the contract.
#[async_trait]
pub trait OcrService: Send + Sync {
    async fn recognize(
        &self,
        document: &[u8],
        page_count: i64,
    ) -> Result<Vec<PageText>, ServiceError>;
}
