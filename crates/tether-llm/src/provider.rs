//! Model provider trait.

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::error::LlmResult;
use crate::types::{Message, StreamEvent};

/// Type alias for boxed event streams.
pub type EventStream = Pin<Box<dyn Stream<Item = LlmResult<StreamEvent>> + Send>>;

/// A language-model provider with streaming output.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider name.
    fn name(&self) -> &str;

    /// Model identifier in use.
    fn model(&self) -> &str;

    /// Stream a completion for the given system prompt and messages.
    ///
    /// # Errors
    ///
    /// Returns an error when the request cannot be started; per-event
    /// failures surface inside the stream.
    async fn stream(&self, system_prompt: &str, messages: &[Message]) -> LlmResult<EventStream>;

    /// Count tokens in text (approximate).
    fn count_tokens(&self, text: &str) -> usize {
        // Rough approximation: ~4 chars per token
        text.len() / 4
    }

    /// Size of the model's context window, in tokens.
    fn context_window(&self) -> usize;
}

/// Blanket implementation allowing `Box<dyn ModelProvider>` to be used as
/// a type parameter wherever `P: ModelProvider` is required.
#[async_trait]
impl ModelProvider for Box<dyn ModelProvider> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn model(&self) -> &str {
        (**self).model()
    }

    async fn stream(&self, system_prompt: &str, messages: &[Message]) -> LlmResult<EventStream> {
        (**self).stream(system_prompt, messages).await
    }

    fn count_tokens(&self, text: &str) -> usize {
        (**self).count_tokens(text)
    }

    fn context_window(&self) -> usize {
        (**self).context_window()
    }
}
