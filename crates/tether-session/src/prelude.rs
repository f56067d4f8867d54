//! Commonly used types, re-exported for glob import.

pub use crate::coordinator::{
    CoordinatorConfig, RoundHandle, RoundOutcome, SessionCoordinator, StreamedRound,
};
pub use crate::error::{SessionError, SessionResult};
pub use crate::extract::ToolCallExtractor;
pub use crate::prompt::{SystemPromptConfig, build_system_prompt};
pub use crate::store::{
    MemorySessionStore, Round, SessionStore, ToolCallOutcome, ToolCallRequest, Turn, TurnPatch,
    TurnStatus, TurnWatcher,
};
