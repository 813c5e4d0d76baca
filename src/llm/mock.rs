/// Closure-backed LLM for tests and offline runs.
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{Llm, LlmError};

type Responder = dyn Fn(&str) -> Result<String, LlmError> + Send + Sync;

/// An `Llm` whose completions are produced by a plain function of the prompt.
pub struct MockLlm {
    responder: Box<Responder>,
    calls: AtomicUsize,
}

impl MockLlm {
    pub fn from_fn<F>(responder: F) -> Self
    where
        F: Fn(&str) -> Result<String, LlmError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            calls: AtomicUsize::new(0),
        }
    }

    /// Always answer with the same text.
    pub fn fixed(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::from_fn(move |_| Ok(text.clone()))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Llm for MockLlm {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.responder)(prompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_llm_routes_by_prompt() {
        let llm = MockLlm::from_fn(|p| {
            if p.contains("ping") {
                Ok("pong".to_string())
            } else {
                Err(LlmError::EmptyResponse)
            }
        });
        assert_eq!(llm.complete("ping").await.unwrap(), "pong");
        assert!(llm.complete("other").await.is_err());
        assert_eq!(llm.calls(), 2);
    }
}
