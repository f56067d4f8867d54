//! Commonly used types, re-exported for glob import.

pub use crate::error::{LlmError, LlmResult};
pub use crate::provider::{EventStream, ModelProvider};
pub use crate::types::{Message, MessageRole, StreamEvent, Usage};
