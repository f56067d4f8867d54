//! Session-store seam: persisted rounds and turns.
//!
//! The coordinator owns no durable state; everything goes through an
//! injected [`SessionStore`]. Streaming-turn fan-out is part of the store
//! contract: every `update_turn` is published to the response's watchers
//! in FIFO order, and dropping a watcher detaches it. A reference
//! in-memory implementation ships for tests and embedding.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::error::{SessionError, SessionResult};
use crate::history::project_rounds;
use tether_llm::Message;
use tether_mcp::ToolResult;

/// The tool call a turn ended with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Target server id.
    pub server_name: String,
    /// Method (tool) name on that server.
    pub method_name: String,
    /// Call arguments.
    pub arguments: Value,
}

/// Outcome of a tool call, as persisted on the turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolCallOutcome {
    /// The tool ran and returned a result.
    Result(ToolResult),
    /// The invocation failed.
    Error {
        /// Failure description.
        error: String,
    },
}

/// A turn's tool exchange: the call, and its response once executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnToolCall {
    /// The extracted call.
    pub call: ToolCallRequest,
    /// `None` until the call has been executed.
    pub response: Option<ToolCallOutcome>,
}

/// Turn status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    /// Model output still arriving.
    Streaming,
    /// Finished normally.
    Completed,
    /// Failed mid-stream.
    Error,
}

/// One contiguous assistant segment, optionally ending in a tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    /// Turn id.
    pub id: String,
    /// Response this turn belongs to.
    pub response_id: String,
    /// Visible content (tool-call regions stripped).
    pub content: String,
    /// Unmodified model output.
    pub raw_response: String,
    /// Input tokens reported by the provider.
    pub input_tokens: u64,
    /// Output tokens reported by the provider.
    pub output_tokens: u64,
    /// Current status.
    pub status: TurnStatus,
    /// When streaming ended.
    pub stream_end_time: Option<DateTime<Utc>>,
    /// Tool exchange, if the turn ended in a call.
    pub tool_calls: Option<TurnToolCall>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Turn {
    /// Whether this turn is completed without a tool call, which marks
    /// the end of a round's response.
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.status == TurnStatus::Completed && self.tool_calls.is_none()
    }
}

/// The user request that opened a round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundRequest {
    /// Request content.
    pub content: String,
}

/// The assistant response to a round: an ordered sequence of turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundResponse {
    /// Response id.
    pub id: String,
    /// Turns, in creation order.
    pub turns: Vec<Turn>,
}

/// One user request and its full assistant response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    /// Round id.
    pub id: String,
    /// Session this round belongs to.
    pub session_id: String,
    /// The user request.
    pub request: RoundRequest,
    /// The assistant response.
    pub response: RoundResponse,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Partial update applied to a turn.
#[derive(Debug, Clone, Default)]
pub struct TurnPatch {
    /// New visible content.
    pub content: Option<String>,
    /// New raw output.
    pub raw_response: Option<String>,
    /// New input token count.
    pub input_tokens: Option<u64>,
    /// New output token count.
    pub output_tokens: Option<u64>,
    /// New status.
    pub status: Option<TurnStatus>,
    /// Stream end time.
    pub stream_end_time: Option<DateTime<Utc>>,
    /// Tool exchange (replaces any existing value).
    pub tool_calls: Option<TurnToolCall>,
}

impl TurnPatch {
    /// Empty patch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set visible content.
    #[must_use]
    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Set raw output.
    #[must_use]
    pub fn raw_response(mut self, raw: impl Into<String>) -> Self {
        self.raw_response = Some(raw.into());
        self
    }

    /// Set token counts.
    #[must_use]
    pub fn tokens(mut self, input: u64, output: u64) -> Self {
        self.input_tokens = Some(input);
        self.output_tokens = Some(output);
        self
    }

    /// Set status.
    #[must_use]
    pub fn status(mut self, status: TurnStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Set stream end time.
    #[must_use]
    pub fn stream_end_time(mut self, time: DateTime<Utc>) -> Self {
        self.stream_end_time = Some(time);
        self
    }

    /// Set the tool exchange.
    #[must_use]
    pub fn tool_calls(mut self, tool_calls: TurnToolCall) -> Self {
        self.tool_calls = Some(tool_calls);
        self
    }

    fn apply(self, turn: &mut Turn) {
        if let Some(content) = self.content {
            turn.content = content;
        }
        if let Some(raw) = self.raw_response {
            turn.raw_response = raw;
        }
        if let Some(input) = self.input_tokens {
            turn.input_tokens = input;
        }
        if let Some(output) = self.output_tokens {
            turn.output_tokens = output;
        }
        if let Some(status) = self.status {
            turn.status = status;
        }
        if let Some(time) = self.stream_end_time {
            turn.stream_end_time = Some(time);
        }
        if let Some(tool_calls) = self.tool_calls {
            turn.tool_calls = Some(tool_calls);
        }
    }
}

/// Stream of turn snapshots for one response, FIFO, unbounded. Dropping
/// the watcher detaches it from the store.
pub struct TurnWatcher {
    receiver: mpsc::UnboundedReceiver<Turn>,
}

impl TurnWatcher {
    /// Wrap a receiver; store implementations use this.
    #[must_use]
    pub fn new(receiver: mpsc::UnboundedReceiver<Turn>) -> Self {
        Self { receiver }
    }

    /// Receive the next snapshot.
    pub async fn recv(&mut self) -> Option<Turn> {
        self.receiver.recv().await
    }
}

impl Stream for TurnWatcher {
    type Item = Turn;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Injected persistence for sessions, rounds, and turns.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a round with the given request content and an empty
    /// response.
    async fn create_round(&self, session_id: &str, content: &str) -> SessionResult<Round>;

    /// Append a new `streaming` turn to a response.
    async fn create_turn(&self, response_id: &str) -> SessionResult<Turn>;

    /// Apply a patch and publish the updated snapshot to watchers.
    async fn update_turn(&self, turn_id: &str, patch: TurnPatch) -> SessionResult<Turn>;

    /// Fetch one turn.
    async fn get_turn(&self, turn_id: &str) -> SessionResult<Turn>;

    /// Fetch one round.
    async fn get_round(&self, round_id: &str) -> SessionResult<Round>;

    /// All rounds of a session, in creation order.
    async fn list_rounds(&self, session_id: &str) -> SessionResult<Vec<Round>>;

    /// Ids of all sessions with at least one round.
    async fn list_sessions(&self) -> SessionResult<Vec<String>>;

    /// Subscribe to turn snapshots for a response.
    fn track_streaming_turns(&self, response_id: &str) -> TurnWatcher;

    /// Project a session's rounds into a provider message list.
    async fn render_session_history(&self, session_id: &str) -> SessionResult<Vec<Message>> {
        let rounds = self.list_rounds(session_id).await?;
        Ok(project_rounds(&rounds))
    }
}

#[derive(Default)]
struct MemoryInner {
    rounds: HashMap<String, Round>,
    round_order: HashMap<String, Vec<String>>,
    turn_to_round: HashMap<String, String>,
    response_to_round: HashMap<String, String>,
    watchers: HashMap<String, Vec<mpsc::UnboundedSender<Turn>>>,
}

impl MemoryInner {
    fn publish(&mut self, response_id: &str, turn: &Turn) {
        let drained = if let Some(watchers) = self.watchers.get_mut(response_id) {
            watchers.retain(|watcher| watcher.send(turn.clone()).is_ok());
            watchers.is_empty()
        } else {
            false
        };
        if drained {
            self.watchers.remove(response_id);
        }
    }
}

/// In-memory [`SessionStore`] for tests and embedding.
#[derive(Default)]
pub struct MemorySessionStore {
    inner: Mutex<MemoryInner>,
}

impl MemorySessionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_round(&self, session_id: &str, content: &str) -> SessionResult<Round> {
        let round = Round {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            request: RoundRequest {
                content: content.to_string(),
            },
            response: RoundResponse {
                id: uuid::Uuid::new_v4().to_string(),
                turns: Vec::new(),
            },
            created_at: Utc::now(),
        };

        let mut inner = self.lock();
        inner
            .response_to_round
            .insert(round.response.id.clone(), round.id.clone());
        inner
            .round_order
            .entry(session_id.to_string())
            .or_default()
            .push(round.id.clone());
        inner.rounds.insert(round.id.clone(), round.clone());
        Ok(round)
    }

    async fn create_turn(&self, response_id: &str) -> SessionResult<Turn> {
        let turn = Turn {
            id: uuid::Uuid::new_v4().to_string(),
            response_id: response_id.to_string(),
            content: String::new(),
            raw_response: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            status: TurnStatus::Streaming,
            stream_end_time: None,
            tool_calls: None,
            created_at: Utc::now(),
        };

        let mut inner = self.lock();
        let round_id = inner
            .response_to_round
            .get(response_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound {
                what: "response",
                id: response_id.to_string(),
            })?;
        inner
            .turn_to_round
            .insert(turn.id.clone(), round_id.clone());
        if let Some(round) = inner.rounds.get_mut(&round_id) {
            round.response.turns.push(turn.clone());
        }
        inner.publish(response_id, &turn);
        Ok(turn)
    }

    async fn update_turn(&self, turn_id: &str, patch: TurnPatch) -> SessionResult<Turn> {
        let mut inner = self.lock();
        let round_id = inner
            .turn_to_round
            .get(turn_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound {
                what: "turn",
                id: turn_id.to_string(),
            })?;

        let updated = {
            let round = inner
                .rounds
                .get_mut(&round_id)
                .ok_or_else(|| SessionError::NotFound {
                    what: "round",
                    id: round_id.clone(),
                })?;
            let turn = round
                .response
                .turns
                .iter_mut()
                .find(|t| t.id == turn_id)
                .ok_or_else(|| SessionError::NotFound {
                    what: "turn",
                    id: turn_id.to_string(),
                })?;
            patch.apply(turn);
            turn.clone()
        };

        let response_id = updated.response_id.clone();
        inner.publish(&response_id, &updated);
        Ok(updated)
    }

    async fn get_turn(&self, turn_id: &str) -> SessionResult<Turn> {
        let inner = self.lock();
        let round_id = inner
            .turn_to_round
            .get(turn_id)
            .ok_or_else(|| SessionError::NotFound {
                what: "turn",
                id: turn_id.to_string(),
            })?;
        inner
            .rounds
            .get(round_id)
            .and_then(|round| round.response.turns.iter().find(|t| t.id == turn_id))
            .cloned()
            .ok_or_else(|| SessionError::NotFound {
                what: "turn",
                id: turn_id.to_string(),
            })
    }

    async fn get_round(&self, round_id: &str) -> SessionResult<Round> {
        let inner = self.lock();
        inner
            .rounds
            .get(round_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound {
                what: "round",
                id: round_id.to_string(),
            })
    }

    async fn list_rounds(&self, session_id: &str) -> SessionResult<Vec<Round>> {
        let inner = self.lock();
        let ids = inner.round_order.get(session_id).cloned().unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| inner.rounds.get(id).cloned())
            .collect())
    }

    async fn list_sessions(&self) -> SessionResult<Vec<String>> {
        let inner = self.lock();
        let mut sessions: Vec<String> = inner.round_order.keys().cloned().collect();
        sessions.sort();
        Ok(sessions)
    }

    fn track_streaming_turns(&self, response_id: &str) -> TurnWatcher {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        inner
            .watchers
            .entry(response_id.to_string())
            .or_default()
            .push(tx);
        TurnWatcher::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_round_and_turn_lifecycle() {
        let store = MemorySessionStore::new();
        let round = store.create_round("sess", "hello").await.unwrap();
        assert_eq!(round.request.content, "hello");
        assert!(round.response.turns.is_empty());

        let turn = store.create_turn(&round.response.id).await.unwrap();
        assert_eq!(turn.status, TurnStatus::Streaming);

        let updated = store
            .update_turn(
                &turn.id,
                TurnPatch::new()
                    .content("hi")
                    .status(TurnStatus::Completed)
                    .tokens(10, 5),
            )
            .await
            .unwrap();
        assert_eq!(updated.content, "hi");
        assert_eq!(updated.input_tokens, 10);
        assert!(updated.is_final());

        let fetched = store.get_round(&round.id).await.unwrap();
        assert_eq!(fetched.response.turns.len(), 1);
        assert_eq!(fetched.response.turns[0].content, "hi");
    }

    #[tokio::test]
    async fn test_rounds_ordered_per_session() {
        let store = MemorySessionStore::new();
        store.create_round("a", "one").await.unwrap();
        store.create_round("a", "two").await.unwrap();
        store.create_round("b", "other").await.unwrap();

        let rounds = store.list_rounds("a").await.unwrap();
        assert_eq!(rounds.len(), 2);
        assert_eq!(rounds[0].request.content, "one");
        assert_eq!(rounds[1].request.content, "two");

        assert_eq!(
            store.list_sessions().await.unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[tokio::test]
    async fn test_watcher_receives_fifo_snapshots() {
        let store = MemorySessionStore::new();
        let round = store.create_round("sess", "hello").await.unwrap();
        let mut watcher = store.track_streaming_turns(&round.response.id);

        let turn = store.create_turn(&round.response.id).await.unwrap();
        store
            .update_turn(&turn.id, TurnPatch::new().content("a"))
            .await
            .unwrap();
        store
            .update_turn(
                &turn.id,
                TurnPatch::new().content("ab").status(TurnStatus::Completed),
            )
            .await
            .unwrap();

        let first = watcher.next().await.unwrap();
        assert_eq!(first.content, "");
        let second = watcher.next().await.unwrap();
        assert_eq!(second.content, "a");
        let third = watcher.next().await.unwrap();
        assert_eq!(third.content, "ab");
        assert_eq!(third.status, TurnStatus::Completed);
    }

    #[tokio::test]
    async fn test_dropped_watcher_detaches() {
        let store = MemorySessionStore::new();
        let round = store.create_round("sess", "hello").await.unwrap();
        let watcher = store.track_streaming_turns(&round.response.id);
        drop(watcher);

        // Publishing to a dropped watcher prunes it without error.
        let turn = store.create_turn(&round.response.id).await.unwrap();
        store
            .update_turn(&turn.id, TurnPatch::new().content("x"))
            .await
            .unwrap();
        assert!(store.lock().watchers.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let store = MemorySessionStore::new();
        assert!(matches!(
            store.create_turn("ghost").await,
            Err(SessionError::NotFound { .. })
        ));
        assert!(matches!(
            store.get_turn("ghost").await,
            Err(SessionError::NotFound { .. })
        ));
        assert!(store.list_rounds("ghost").await.unwrap().is_empty());
    }
}
