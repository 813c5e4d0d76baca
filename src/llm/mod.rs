/// Completion-model port.
///
/// The engine only needs "given a prompt, return text"; transport, model
/// choice and sampling are the implementation's business.
pub mod mock;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("completion request failed: {0}")]
    RequestFailed(String),

    #[error("model returned an empty completion")]
    EmptyResponse,
}

#[async_trait]
pub trait Llm: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;
}
