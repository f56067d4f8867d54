//! The turn loop: prompt → stream → extract → execute → persist → repeat.
//!
//! `handle_request` creates the round and response records before any
//! provider call and returns immediately; the loop runs in the background
//! and resolves a completion handle that captures errors instead of
//! rethrowing them, so a streaming consumer is never torn down by a
//! recoverable fault.

use futures::StreamExt;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{SessionError, SessionResult};
use crate::extract::{DEFAULT_EXTRACT_INTERVAL, ToolCallExtractor};
use crate::history::{
    DEFAULT_SAFETY_BUFFER, available_tokens, project_rounds, trim_messages,
};
use crate::prompt::{SystemPromptConfig, build_system_prompt};
use crate::store::{
    SessionStore, ToolCallOutcome, ToolCallRequest, Turn, TurnPatch, TurnStatus, TurnToolCall,
    TurnWatcher,
};
use tether_llm::{Message, ModelProvider, StreamEvent};
use tether_mcp::ServerManager;

/// Consecutive iteration failures tolerated before the round is fatal.
pub const MAX_ITERATION_RETRIES: u32 = 3;

/// Base wait between iteration retries; attempt `n` waits `n` times this.
pub const ITERATION_RETRY_DELAY_MS: u64 = 1000;

/// Sentinel appended to a turn's content when the round dies.
const STREAM_ERROR_NOTICE: &str = "[response interrupted: internal error]";

/// Tunables for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Tokens held back from the context window.
    pub safety_buffer: usize,
    /// Minimum interval between extraction attempts while streaming.
    pub extract_interval: Duration,
    /// Consecutive iteration failures tolerated.
    pub max_iteration_retries: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            safety_buffer: DEFAULT_SAFETY_BUFFER,
            extract_interval: DEFAULT_EXTRACT_INTERVAL,
            max_iteration_retries: MAX_ITERATION_RETRIES,
        }
    }
}

/// Terminal outcome of a round, as seen by the completion handle.
#[derive(Debug, Clone)]
pub struct RoundOutcome {
    /// The response id the outcome belongs to.
    pub response_id: String,
    /// Failure description, `None` on success. Errors are captured here
    /// rather than rethrown.
    pub error: Option<String>,
}

impl RoundOutcome {
    /// Whether the round completed without a fatal error.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Resolves when the round reaches a terminal state.
pub struct CompletionHandle {
    response_id: String,
    receiver: oneshot::Receiver<RoundOutcome>,
}

impl CompletionHandle {
    /// Wait for the round to finish.
    pub async fn wait(self) -> RoundOutcome {
        match self.receiver.await {
            Ok(outcome) => outcome,
            Err(_) => RoundOutcome {
                response_id: self.response_id,
                error: Some("round task dropped".to_string()),
            },
        }
    }
}

/// Handle to an in-flight round.
pub struct RoundHandle {
    /// The created round's id.
    pub round_id: String,
    /// The created response's id.
    pub response_id: String,
    /// Resolves at the round's terminal state.
    pub completion: CompletionHandle,
    cancel: CancellationToken,
}

impl RoundHandle {
    /// Request cancellation: any in-flight tool invocation finishes, the
    /// current turn is completed, and the loop stops.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Stream of turn snapshots that ends after the final turn (completed
/// with no tool call). Dropping it detaches the watcher; the background
/// round continues to completion.
pub struct TurnStream {
    watcher: TurnWatcher,
    done: bool,
}

impl futures::Stream for TurnStream {
    type Item = Turn;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match Pin::new(&mut self.watcher).poll_next(cx) {
            Poll::Ready(Some(turn)) => {
                if turn.is_final() {
                    self.done = true;
                }
                Poll::Ready(Some(turn))
            },
            other => other,
        }
    }
}

/// A round handle plus its live turn-snapshot stream.
pub struct StreamedRound {
    /// Handle to the background round.
    pub handle: RoundHandle,
    /// Ordered turn snapshots.
    pub turns: TurnStream,
}

enum IterationOutcome {
    /// Final turn completed with no tool call.
    Finished,
    /// One or more tool calls executed; the loop re-enters.
    ToolExecuted,
    /// Cancellation observed.
    Cancelled,
}

struct IterationError {
    turn_id: Option<String>,
    error: SessionError,
}

impl IterationError {
    fn before_turn(error: SessionError) -> Self {
        Self {
            turn_id: None,
            error,
        }
    }

    fn on_turn(turn_id: &str, error: SessionError) -> Self {
        Self {
            turn_id: Some(turn_id.to_string()),
            error,
        }
    }
}

/// Drives request-response rounds for sessions.
pub struct SessionCoordinator<P: ModelProvider + 'static> {
    provider: Arc<P>,
    manager: Arc<ServerManager>,
    store: Arc<dyn SessionStore>,
    config: CoordinatorConfig,
    prompt: RwLock<SystemPromptConfig>,
}

impl<P: ModelProvider + 'static> SessionCoordinator<P> {
    /// Create a coordinator over a provider, a server manager, and a
    /// session store.
    #[must_use]
    pub fn new(provider: Arc<P>, manager: Arc<ServerManager>, store: Arc<dyn SessionStore>) -> Self {
        Self {
            provider,
            manager,
            store,
            config: CoordinatorConfig::default(),
            prompt: RwLock::new(SystemPromptConfig::default()),
        }
    }

    /// Override the tunables.
    #[must_use]
    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the prompt template. Tools and clock are filled per round.
    #[must_use]
    pub fn with_prompt_config(self, prompt: SystemPromptConfig) -> Self {
        self.set_prompt_config(prompt);
        self
    }

    /// Replace the prompt template at runtime.
    pub fn set_prompt_config(&self, prompt: SystemPromptConfig) {
        let mut guard = self
            .prompt
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = prompt;
    }

    /// Open a round for a user request. The round and empty response are
    /// created before any provider call; processing continues in the
    /// background.
    ///
    /// # Errors
    ///
    /// Returns an error only when the store cannot create the round.
    pub async fn handle_request(
        self: &Arc<Self>,
        session_id: &str,
        request_content: &str,
    ) -> SessionResult<RoundHandle> {
        let round = self.store.create_round(session_id, request_content).await?;
        Ok(self.spawn_round(session_id, request_content, round.id, round.response.id))
    }

    /// As [`SessionCoordinator::handle_request`], additionally returning
    /// the turn-snapshot stream for the response. The subscription is
    /// taken before processing starts, so no snapshot is missed.
    ///
    /// # Errors
    ///
    /// Returns an error only when the store cannot create the round.
    pub async fn stream_request(
        self: &Arc<Self>,
        session_id: &str,
        request_content: &str,
    ) -> SessionResult<StreamedRound> {
        let round = self.store.create_round(session_id, request_content).await?;
        let watcher = self.store.track_streaming_turns(&round.response.id);
        let handle = self.spawn_round(session_id, request_content, round.id, round.response.id);
        Ok(StreamedRound {
            handle,
            turns: TurnStream {
                watcher,
                done: false,
            },
        })
    }

    fn spawn_round(
        self: &Arc<Self>,
        session_id: &str,
        request_content: &str,
        round_id: String,
        response_id: String,
    ) -> RoundHandle {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let coordinator = Arc::clone(self);
        let session = session_id.to_string();
        let request = request_content.to_string();
        let rid = response_id.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            let error = match coordinator.run_round(&session, &request, &rid, &token).await {
                Ok(()) => {
                    info!(response = %rid, "round completed");
                    None
                },
                Err(e) => {
                    error!(response = %rid, error = %e, "round failed");
                    Some(e.to_string())
                },
            };
            let _ = outcome_tx.send(RoundOutcome {
                response_id: rid,
                error,
            });
        });

        RoundHandle {
            round_id,
            response_id: response_id.clone(),
            completion: CompletionHandle {
                response_id,
                receiver: outcome_rx,
            },
            cancel,
        }
    }

    async fn run_round(
        &self,
        session_id: &str,
        request_content: &str,
        response_id: &str,
        cancel: &CancellationToken,
    ) -> SessionResult<()> {
        let mut consecutive_errors: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            match self
                .run_iteration(session_id, request_content, response_id, cancel)
                .await
            {
                Ok(IterationOutcome::Finished | IterationOutcome::Cancelled) => return Ok(()),
                Ok(IterationOutcome::ToolExecuted) => {
                    consecutive_errors = 0;
                },
                Err(failed) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    warn!(
                        response = %response_id,
                        attempt = consecutive_errors,
                        error = %failed.error,
                        "iteration failed"
                    );

                    if consecutive_errors >= self.config.max_iteration_retries {
                        self.seal_failed_turn(response_id, failed.turn_id.as_deref(), &failed.error)
                            .await;
                        return Err(SessionError::RoundFailed {
                            attempts: consecutive_errors,
                            reason: failed.error.to_string(),
                        });
                    }

                    if let Some(turn_id) = failed.turn_id.as_deref() {
                        let _ = self
                            .store
                            .update_turn(turn_id, TurnPatch::new().status(TurnStatus::Error))
                            .await;
                    }

                    let delay = ITERATION_RETRY_DELAY_MS.saturating_mul(u64::from(consecutive_errors));
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                },
            }
        }
    }

    /// Close the turn the fatal error happened on (creating one if the
    /// failure predated turn creation) with the error sentinel.
    async fn seal_failed_turn(
        &self,
        response_id: &str,
        turn_id: Option<&str>,
        error: &SessionError,
    ) {
        let turn_id = match turn_id {
            Some(id) => id.to_string(),
            None => match self.store.create_turn(response_id).await {
                Ok(turn) => turn.id,
                Err(e) => {
                    error!(response = %response_id, error = %e, "failed to create error turn");
                    return;
                },
            },
        };

        let existing = self
            .store
            .get_turn(&turn_id)
            .await
            .map(|t| t.content)
            .unwrap_or_default();
        let content = if existing.is_empty() {
            format!("{STREAM_ERROR_NOTICE} {error}")
        } else {
            format!("{existing}\n{STREAM_ERROR_NOTICE} {error}")
        };

        let _ = self
            .store
            .update_turn(
                &turn_id,
                TurnPatch::new()
                    .content(content)
                    .status(TurnStatus::Completed)
                    .stream_end_time(chrono::Utc::now()),
            )
            .await;
    }

    async fn build_context(
        &self,
        session_id: &str,
        request_content: &str,
    ) -> SessionResult<(String, Vec<Message>)> {
        let tools = self.manager.list_all_tools().await;
        let prompt_config = {
            let guard = self
                .prompt
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.clone()
        }
        .with_tools(tools);
        let system_prompt = build_system_prompt(&prompt_config);

        let rounds = self.store.list_rounds(session_id).await?;
        let mut messages = project_rounds(&rounds);
        if !messages.last().is_some_and(Message::is_user) {
            messages.push(Message::user(request_content));
        }

        let available =
            available_tokens(&*self.provider, &system_prompt, self.config.safety_buffer);
        let messages = trim_messages(messages, available, |text| {
            self.provider.count_tokens(text)
        });

        Ok((system_prompt, messages))
    }

    #[allow(clippy::too_many_lines)]
    async fn run_iteration(
        &self,
        session_id: &str,
        request_content: &str,
        response_id: &str,
        cancel: &CancellationToken,
    ) -> Result<IterationOutcome, IterationError> {
        // Step 1: context. History is re-read from the store every pass so
        // persisted tool exchanges feed the next provider call.
        let (system_prompt, messages) = self
            .build_context(session_id, request_content)
            .await
            .map_err(IterationError::before_turn)?;

        // Step 2: a fresh streaming turn.
        let turn = self
            .store
            .create_turn(response_id)
            .await
            .map_err(IterationError::before_turn)?;
        let turn_id = turn.id;

        // Step 3: stream the provider.
        let mut stream = self
            .provider
            .stream(&system_prompt, &messages)
            .await
            .map_err(|e| IterationError::on_turn(&turn_id, e.into()))?;

        let mut extractor = ToolCallExtractor::with_interval(self.config.extract_interval);
        let mut raw = String::new();
        let mut queued: VecDeque<ToolCallRequest> = VecDeque::new();
        let mut cancelled = false;

        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => {
                    debug!(turn = %turn_id, "cancellation observed mid-stream");
                    cancelled = true;
                    break;
                },
                event = stream.next() => event,
            };
            let Some(event) = event else {
                break;
            };
            let event = event.map_err(|e| IterationError::on_turn(&turn_id, e.into()))?;

            match event {
                StreamEvent::TextDelta(text) => {
                    raw.push_str(&text);
                    extractor.append(&text);
                    queued.extend(extractor.extract());

                    self.store
                        .update_turn(
                            &turn_id,
                            TurnPatch::new()
                                .content(extractor.visible_content())
                                .raw_response(raw.clone()),
                        )
                        .await
                        .map_err(|e| IterationError::on_turn(&turn_id, e))?;
                },
                StreamEvent::Usage {
                    input_tokens,
                    output_tokens,
                } => {
                    self.store
                        .update_turn(&turn_id, TurnPatch::new().tokens(input_tokens, output_tokens))
                        .await
                        .map_err(|e| IterationError::on_turn(&turn_id, e))?;
                },
                StreamEvent::Done => break,
            }
        }

        // Step 4: one final unconditional extraction after the stream.
        queued.extend(extractor.extract_now());
        let content = extractor.visible_content().to_string();

        if queued.is_empty() || cancelled {
            // Step 5: final turn, or a cancelled one; either way it is
            // completed and the loop stops. Calls extracted but not yet
            // started are not begun after cancellation.
            self.store
                .update_turn(
                    &turn_id,
                    TurnPatch::new()
                        .content(content)
                        .raw_response(raw)
                        .status(TurnStatus::Completed)
                        .stream_end_time(chrono::Utc::now()),
                )
                .await
                .map_err(|e| IterationError::on_turn(&turn_id, e))?;
            return Ok(if cancelled {
                IterationOutcome::Cancelled
            } else {
                IterationOutcome::Finished
            });
        }

        // Execute the extracted calls strictly in emission order, each on
        // its own turn; the first closes the turn that streamed it.
        let mut current_turn_id = turn_id.clone();
        let mut first = true;
        while let Some(call) = queued.pop_front() {
            if !first {
                let next = self
                    .store
                    .create_turn(response_id)
                    .await
                    .map_err(|e| IterationError::on_turn(&current_turn_id, e))?;
                current_turn_id = next.id;
            }

            self.store
                .update_turn(
                    &current_turn_id,
                    TurnPatch::new()
                        .content(if first { content.clone() } else { String::new() })
                        .raw_response(if first { raw.clone() } else { String::new() })
                        .status(TurnStatus::Completed)
                        .stream_end_time(chrono::Utc::now())
                        .tool_calls(TurnToolCall {
                            call: call.clone(),
                            response: None,
                        }),
                )
                .await
                .map_err(|e| IterationError::on_turn(&current_turn_id, e))?;

            // Step 4a: invoke through the manager. A cancellation arriving
            // now lets the in-flight invocation finish.
            debug!(
                server = %call.server_name,
                method = %call.method_name,
                "executing extracted tool call"
            );
            let outcome = match self
                .manager
                .invoke_tool(&call.server_name, &call.method_name, call.arguments.clone())
                .await
            {
                Ok(result) => ToolCallOutcome::Result(result),
                Err(e) => ToolCallOutcome::Error {
                    error: e.to_string(),
                },
            };

            self.store
                .update_turn(
                    &current_turn_id,
                    TurnPatch::new().tool_calls(TurnToolCall {
                        call,
                        response: Some(outcome),
                    }),
                )
                .await
                .map_err(|e| IterationError::on_turn(&current_turn_id, e))?;

            first = false;

            // A cancellation that arrived during the invocation let it
            // finish; remaining queued calls are not started.
            if cancel.is_cancelled() {
                return Ok(IterationOutcome::Cancelled);
            }
        }
        // Step 4b/4c happen on re-entry: history is re-read and a new
        // streaming turn is created.
        Ok(IterationOutcome::ToolExecuted)
    }
}

impl<P: ModelProvider + 'static> std::fmt::Debug for SessionCoordinator<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCoordinator")
            .field("provider", &self.provider.name())
            .field("model", &self.provider.model())
            .finish_non_exhaustive()
    }
}
