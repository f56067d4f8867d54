//! Tether Session - the conversation side of the MCP runtime.
//!
//! This crate provides:
//! - Deterministic system-prompt assembly from typed sections
//! - Projection of persisted session rounds into a token-budgeted
//!   provider message list
//! - Incremental extraction of tool calls embedded in streamed model text
//! - The session coordinator driving the turn loop: stream, extract,
//!   execute through the server manager, persist, repeat
//! - The session-store seam with an in-memory reference implementation
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tether_mcp::ServerManager;
//! use tether_session::{MemorySessionStore, SessionCoordinator, SystemPromptConfig};
//!
//! # async fn example(provider: Arc<impl tether_llm::ModelProvider + 'static>) {
//! let coordinator = Arc::new(
//!     SessionCoordinator::new(
//!         provider,
//!         Arc::new(ServerManager::new()),
//!         Arc::new(MemorySessionStore::new()),
//!     )
//!     .with_prompt_config(SystemPromptConfig::new().with_instructions("Be helpful.")),
//! );
//!
//! let handle = coordinator.handle_request("session-1", "hello").await.unwrap();
//! let outcome = handle.completion.wait().await;
//! assert!(outcome.is_ok());
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod prelude;

mod coordinator;
mod error;
mod extract;
mod history;
mod prompt;
mod store;

pub use coordinator::{
    CompletionHandle, CoordinatorConfig, ITERATION_RETRY_DELAY_MS, MAX_ITERATION_RETRIES,
    RoundHandle, RoundOutcome, SessionCoordinator, StreamedRound, TurnStream,
};
pub use error::{SessionError, SessionResult};
pub use extract::{DEFAULT_EXTRACT_INTERVAL, ToolCallExtractor};
pub use history::{
    DEFAULT_SAFETY_BUFFER, available_tokens, project_rounds, render_tool_call,
    render_tool_outcome, trim_messages,
};
pub use prompt::{
    DateSection, DynamicContextEntry, FileContext, SystemPromptConfig, TOOL_CALL_PREAMBLE,
    WorkspaceMetadata, build_system_prompt, build_system_prompt_at,
};
pub use store::{
    MemorySessionStore, Round, RoundRequest, RoundResponse, SessionStore, ToolCallOutcome,
    ToolCallRequest, Turn, TurnPatch, TurnStatus, TurnToolCall, TurnWatcher,
};
