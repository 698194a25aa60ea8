pub mod ollama;
pub mod openai;

use async_trait::async_trait;

use crate::error::InferenceError;
use crate::types::{ModelReply, ModelRequest};

/// Pure chat-completion call. No state, no history, no tool execution.
/// Request in, reply out.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    async fn infer(&self, request: ModelRequest) -> Result<ModelReply, InferenceError>;
}

/// Blanket impl so `Box<dyn InferenceProvider>` can be passed directly to `ChatSession::new()`.
#[async_trait]
impl InferenceProvider for Box<dyn InferenceProvider> {
    async fn infer(&self, request: ModelRequest) -> Result<ModelReply, InferenceError> {
        (**self).infer(request).await
    }
}

pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;
