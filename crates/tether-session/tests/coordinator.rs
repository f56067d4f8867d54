//! End-to-end rounds: scripted provider + scripted MCP peer + memory
//! store.

use futures::StreamExt;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use tether_llm::{EventStream, LlmError, LlmResult, Message, ModelProvider, StreamEvent};
use tether_mcp::transport::{Transport, TransportEvent, TransportFactory};
use tether_mcp::{LogBuffer, McpError, McpResult, ServerConfig, ServerManager};
use tether_session::{
    CoordinatorConfig, MemorySessionStore, SessionCoordinator, SessionStore, SystemPromptConfig,
    ToolCallOutcome, TurnStatus,
};

/// One scripted provider pass.
enum Pass {
    /// Emit these events, then end the stream.
    Events(Vec<StreamEvent>),
    /// Fail to open the stream.
    Fail(String),
    /// Emit these events, then hang until cancelled.
    Hang(Vec<StreamEvent>),
}

struct ScriptedProvider {
    passes: Mutex<VecDeque<Pass>>,
}

impl ScriptedProvider {
    fn new(passes: Vec<Pass>) -> Self {
        Self {
            passes: Mutex::new(passes.into_iter().collect()),
        }
    }
}

#[async_trait::async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-1"
    }

    async fn stream(&self, _system_prompt: &str, _messages: &[Message]) -> LlmResult<EventStream> {
        let pass = {
            let mut passes = self.passes.lock().unwrap();
            passes.pop_front()
        };
        match pass {
            Some(Pass::Events(events)) => {
                let events: Vec<LlmResult<StreamEvent>> = events.into_iter().map(Ok).collect();
                Ok(Box::pin(futures::stream::iter(events)))
            },
            Some(Pass::Fail(reason)) => Err(LlmError::RequestFailed(reason)),
            Some(Pass::Hang(events)) => {
                let events: Vec<LlmResult<StreamEvent>> = events.into_iter().map(Ok).collect();
                Ok(Box::pin(
                    futures::stream::iter(events).chain(futures::stream::pending()),
                ))
            },
            None => Ok(Box::pin(futures::stream::iter(vec![Ok(StreamEvent::Done)]))),
        }
    }

    fn context_window(&self) -> usize {
        100_000
    }
}

/// Minimal in-process MCP peer answering the handshake, tool listing,
/// and `ping` with `"pong"`.
struct StubTransport {
    events: tokio::sync::Mutex<Option<mpsc::Sender<TransportEvent>>>,
    closed: AtomicBool,
}

#[async_trait::async_trait]
impl Transport for StubTransport {
    async fn start(&self) -> McpResult<mpsc::Receiver<TransportEvent>> {
        let (tx, rx) = mpsc::channel(64);
        *self.events.lock().await = Some(tx);
        Ok(rx)
    }

    async fn send(&self, message: &Value) -> McpResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::TransportClosed {
                server: "stub".to_string(),
            });
        }
        let method = message.get("method").and_then(Value::as_str).unwrap_or("");
        let Some(id) = message.get("id").and_then(Value::as_i64) else {
            return Ok(());
        };
        let result = match method {
            "initialize" => serde_json::json!({
                "protocolVersion": "2024-11-05",
                "serverInfo": {"name": "stub", "version": "0.0.1"},
                "capabilities": {"tools": {}},
            }),
            "tools/list" => serde_json::json!({
                "tools": [{"name": "ping", "description": "", "inputSchema": {"type": "object"}}],
            }),
            "tools/call" => serde_json::json!({
                "isError": false,
                "content": [{"type": "text", "text": "pong"}],
            }),
            _ => serde_json::json!({}),
        };
        let reply = serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result});
        let sender = { self.events.lock().await.clone() };
        if let Some(sender) = sender {
            let _ = sender.send(TransportEvent::Message(reply)).await;
        }
        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn server_name(&self) -> &str {
        "stub"
    }
}

struct StubFactory;

#[async_trait::async_trait]
impl TransportFactory for StubFactory {
    async fn build(
        &self,
        _server_name: &str,
        _config: &ServerConfig,
        _logs: Arc<LogBuffer>,
    ) -> McpResult<Arc<dyn Transport>> {
        Ok(Arc::new(StubTransport {
            events: tokio::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }
}

async fn manager_with_stub_server() -> Arc<ServerManager> {
    let manager = Arc::new(ServerManager::with_transport_factory(Arc::new(StubFactory)));
    manager
        .start_server("s1", ServerConfig::stdio("stub"))
        .await
        .unwrap();
    manager
}

fn coordinator(
    provider: ScriptedProvider,
    manager: Arc<ServerManager>,
    store: Arc<MemorySessionStore>,
) -> Arc<SessionCoordinator<ScriptedProvider>> {
    Arc::new(
        SessionCoordinator::new(Arc::new(provider), manager, store).with_prompt_config(
            SystemPromptConfig::new().with_instructions("Answer briefly."),
        ),
    )
}

const TOOL_CALL_JSON: &str = "{\"name\":\"s1.ping\",\"arguments\":{}}";

#[tokio::test]
async fn test_round_with_tool_call() {
    let provider = ScriptedProvider::new(vec![
        Pass::Events(vec![
            StreamEvent::TextDelta("Hello ".to_string()),
            StreamEvent::TextDelta(TOOL_CALL_JSON.to_string()),
            StreamEvent::Usage {
                input_tokens: 12,
                output_tokens: 7,
            },
            StreamEvent::Done,
        ]),
        Pass::Events(vec![
            StreamEvent::TextDelta("done".to_string()),
            StreamEvent::Done,
        ]),
    ]);
    let manager = manager_with_stub_server().await;
    let store = Arc::new(MemorySessionStore::new());
    let coordinator = coordinator(provider, manager.clone(), store.clone());

    let handle = coordinator.handle_request("sess", "hi").await.unwrap();
    let outcome = handle.completion.wait().await;
    assert!(outcome.is_ok(), "round failed: {:?}", outcome.error);

    let rounds = store.list_rounds("sess").await.unwrap();
    assert_eq!(rounds.len(), 1);
    let turns = &rounds[0].response.turns;
    assert_eq!(turns.len(), 2);

    let first = &turns[0];
    assert_eq!(first.content, "Hello ");
    assert!(first.raw_response.contains(TOOL_CALL_JSON));
    assert_eq!(first.status, TurnStatus::Completed);
    assert_eq!(first.input_tokens, 12);
    let exchange = first.tool_calls.as_ref().unwrap();
    assert_eq!(exchange.call.server_name, "s1");
    assert_eq!(exchange.call.method_name, "ping");
    assert_eq!(exchange.call.arguments, serde_json::json!({}));
    match exchange.response.as_ref().unwrap() {
        ToolCallOutcome::Result(result) => {
            assert!(!result.is_error);
            assert_eq!(result.text_content(), "pong");
        },
        ToolCallOutcome::Error { error } => panic!("unexpected error: {error}"),
    }

    let second = &turns[1];
    assert_eq!(second.content, "done");
    assert_eq!(second.status, TurnStatus::Completed);
    assert!(second.tool_calls.is_none());

    manager.cleanup().await;
}

#[tokio::test]
async fn test_tool_error_recorded_on_turn() {
    // Target a server that is not registered: the invocation fails and
    // the error lands in toolCalls.response.
    let provider = ScriptedProvider::new(vec![
        Pass::Events(vec![
            StreamEvent::TextDelta("{\"name\":\"ghost.run\",\"arguments\":{}}".to_string()),
            StreamEvent::Done,
        ]),
        Pass::Events(vec![
            StreamEvent::TextDelta("recovered".to_string()),
            StreamEvent::Done,
        ]),
    ]);
    let manager = manager_with_stub_server().await;
    let store = Arc::new(MemorySessionStore::new());
    let coordinator = coordinator(provider, manager.clone(), store.clone());

    let handle = coordinator.handle_request("sess", "go").await.unwrap();
    assert!(handle.completion.wait().await.is_ok());

    let rounds = store.list_rounds("sess").await.unwrap();
    let exchange = rounds[0].response.turns[0].tool_calls.as_ref().unwrap();
    match exchange.response.as_ref().unwrap() {
        ToolCallOutcome::Error { error } => assert!(error.contains("ghost")),
        ToolCallOutcome::Result(_) => panic!("expected an error outcome"),
    }

    manager.cleanup().await;
}

#[tokio::test]
async fn test_stream_request_snapshots_end_after_final_turn() {
    let provider = ScriptedProvider::new(vec![
        Pass::Events(vec![
            StreamEvent::TextDelta("Hello ".to_string()),
            StreamEvent::TextDelta(TOOL_CALL_JSON.to_string()),
            StreamEvent::Done,
        ]),
        Pass::Events(vec![
            StreamEvent::TextDelta("done".to_string()),
            StreamEvent::Done,
        ]),
    ]);
    let manager = manager_with_stub_server().await;
    let store = Arc::new(MemorySessionStore::new());
    let coordinator = coordinator(provider, manager.clone(), store.clone());

    let streamed = coordinator.stream_request("sess", "hi").await.unwrap();
    let snapshots: Vec<_> = streamed.turns.collect().await;
    assert!(!snapshots.is_empty());

    // Snapshots are FIFO per response; the last one is the final turn.
    let last = snapshots.last().unwrap();
    assert_eq!(last.content, "done");
    assert!(last.is_final());
    for pair in snapshots.windows(2) {
        assert!(pair[0].created_at <= pair[1].created_at);
    }

    assert!(streamed.handle.completion.wait().await.is_ok());
    manager.cleanup().await;
}

#[tokio::test]
async fn test_dropped_stream_does_not_cancel_round() {
    let provider = ScriptedProvider::new(vec![Pass::Events(vec![
        StreamEvent::TextDelta("quiet finish".to_string()),
        StreamEvent::Done,
    ])]);
    let manager = manager_with_stub_server().await;
    let store = Arc::new(MemorySessionStore::new());
    let coordinator = coordinator(provider, manager.clone(), store.clone());

    let streamed = coordinator.stream_request("sess", "hi").await.unwrap();
    drop(streamed.turns); // consumer cancels early

    let outcome = streamed.handle.completion.wait().await;
    assert!(outcome.is_ok());

    let rounds = store.list_rounds("sess").await.unwrap();
    assert_eq!(rounds[0].response.turns[0].content, "quiet finish");
    manager.cleanup().await;
}

#[tokio::test(start_paused = true)]
async fn test_retry_budget_exhaustion_seals_turn() {
    let provider = ScriptedProvider::new(vec![
        Pass::Fail("boom 1".to_string()),
        Pass::Fail("boom 2".to_string()),
        Pass::Fail("boom 3".to_string()),
    ]);
    let manager = Arc::new(ServerManager::new());
    let store = Arc::new(MemorySessionStore::new());
    let coordinator = coordinator(provider, manager, store.clone());

    let handle = coordinator.handle_request("sess", "hi").await.unwrap();
    let outcome = handle.completion.wait().await;
    assert!(outcome.error.as_deref().unwrap().contains("boom 3"));

    // The last turn is completed with an error sentinel in its content.
    let rounds = store.list_rounds("sess").await.unwrap();
    let last = rounds[0].response.turns.last().unwrap();
    assert_eq!(last.status, TurnStatus::Completed);
    assert!(last.content.contains("boom 3"));
}

#[tokio::test(start_paused = true)]
async fn test_transient_errors_recover() {
    let provider = ScriptedProvider::new(vec![
        Pass::Fail("hiccup".to_string()),
        Pass::Events(vec![
            StreamEvent::TextDelta("all good".to_string()),
            StreamEvent::Done,
        ]),
    ]);
    let manager = Arc::new(ServerManager::new());
    let store = Arc::new(MemorySessionStore::new());
    let coordinator = coordinator(provider, manager, store.clone());

    let handle = coordinator.handle_request("sess", "hi").await.unwrap();
    assert!(handle.completion.wait().await.is_ok());

    let rounds = store.list_rounds("sess").await.unwrap();
    let turns = &rounds[0].response.turns;
    // The failed pass's turn is marked error; the retry's turn completes.
    assert_eq!(turns.last().unwrap().content, "all good");
    assert!(turns.iter().any(|t| t.status == TurnStatus::Error));
}

#[tokio::test]
async fn test_cancellation_completes_current_turn() {
    let provider = ScriptedProvider::new(vec![Pass::Hang(vec![StreamEvent::TextDelta(
        "partial".to_string(),
    )])]);
    let manager = Arc::new(ServerManager::new());
    let store = Arc::new(MemorySessionStore::new());
    let coordinator = coordinator(provider, manager, store.clone());

    let handle = coordinator.handle_request("sess", "hi").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    handle.cancel();

    let outcome = handle.completion.wait().await;
    assert!(outcome.is_ok());

    let rounds = store.list_rounds("sess").await.unwrap();
    let turn = rounds[0].response.turns.last().unwrap();
    assert_eq!(turn.status, TurnStatus::Completed);
    assert_eq!(turn.content, "partial");
}

#[tokio::test]
async fn test_history_rereads_between_passes() {
    // The second provider call must see the persisted tool exchange.
    struct RecordingProvider {
        inner: ScriptedProvider,
        seen: Arc<Mutex<Vec<Vec<Message>>>>,
    }

    #[async_trait::async_trait]
    impl ModelProvider for RecordingProvider {
        fn name(&self) -> &str {
            "recording"
        }
        fn model(&self) -> &str {
            "recording-1"
        }
        async fn stream(
            &self,
            system_prompt: &str,
            messages: &[Message],
        ) -> LlmResult<EventStream> {
            self.seen.lock().unwrap().push(messages.to_vec());
            self.inner.stream(system_prompt, messages).await
        }
        fn context_window(&self) -> usize {
            100_000
        }
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let provider = RecordingProvider {
        inner: ScriptedProvider::new(vec![
            Pass::Events(vec![
                StreamEvent::TextDelta(TOOL_CALL_JSON.to_string()),
                StreamEvent::Done,
            ]),
            Pass::Events(vec![
                StreamEvent::TextDelta("done".to_string()),
                StreamEvent::Done,
            ]),
        ]),
        seen: Arc::clone(&seen),
    };
    let manager = manager_with_stub_server().await;
    let store = Arc::new(MemorySessionStore::new());
    let coordinator = Arc::new(SessionCoordinator::new(
        Arc::new(provider),
        manager.clone(),
        store.clone() as Arc<dyn SessionStore>,
    ));

    let handle = coordinator.handle_request("sess", "hi").await.unwrap();
    assert!(handle.completion.wait().await.is_ok());

    let passes = seen.lock().unwrap();
    assert_eq!(passes.len(), 2);
    let assistant = passes[1]
        .iter()
        .find(|m| !m.is_user())
        .expect("assistant history present on the second pass");
    assert!(assistant.content.contains("s1.ping"));
    assert!(assistant.content.contains("pong"));
    drop(passes);

    manager.cleanup().await;
}

#[tokio::test]
async fn test_usage_chunks_update_token_counts() {
    let provider = ScriptedProvider::new(vec![Pass::Events(vec![
        StreamEvent::TextDelta("answer".to_string()),
        StreamEvent::Usage {
            input_tokens: 100,
            output_tokens: 25,
        },
        StreamEvent::Done,
    ])]);
    let manager = Arc::new(ServerManager::new());
    let store = Arc::new(MemorySessionStore::new());
    let coordinator = coordinator(provider, manager, store.clone());

    let handle = coordinator.handle_request("sess", "hi").await.unwrap();
    assert!(handle.completion.wait().await.is_ok());

    let rounds = store.list_rounds("sess").await.unwrap();
    let turn = &rounds[0].response.turns[0];
    assert_eq!(turn.input_tokens, 100);
    assert_eq!(turn.output_tokens, 25);
    assert!(turn.stream_end_time.is_some());
}

#[tokio::test]
async fn test_coordinator_config_override() {
    let provider = ScriptedProvider::new(vec![Pass::Events(vec![StreamEvent::Done])]);
    let manager = Arc::new(ServerManager::new());
    let store = Arc::new(MemorySessionStore::new());
    let coordinator = Arc::new(
        SessionCoordinator::new(Arc::new(provider), manager, store.clone())
            .with_config(CoordinatorConfig {
                safety_buffer: 10,
                extract_interval: std::time::Duration::ZERO,
                max_iteration_retries: 1,
            }),
    );

    let handle = coordinator.handle_request("sess", "hi").await.unwrap();
    assert!(handle.completion.wait().await.is_ok());
}
