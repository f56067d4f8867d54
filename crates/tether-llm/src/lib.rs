//! Tether LLM - provider abstraction for streaming language models.
//!
//! Concrete provider SDKs live outside this workspace; hosts implement
//! [`ModelProvider`] over their SDK of choice and hand it to the session
//! coordinator.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod prelude;

mod error;
mod provider;
mod types;

pub use error::{LlmError, LlmResult};
pub use provider::{EventStream, ModelProvider};
pub use types::{Message, MessageRole, StreamEvent, Usage};
