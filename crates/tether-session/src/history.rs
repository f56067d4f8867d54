//! Projection of persisted rounds into a provider message list, and
//! token-budget trimming.

use serde_json::Value;
use tracing::debug;

use crate::store::{Round, ToolCallOutcome, ToolCallRequest, Turn};
use tether_llm::{Message, ModelProvider};

/// Tokens held back from the context window as slack.
pub const DEFAULT_SAFETY_BUFFER: usize = 50;

/// Render a tool call in the wire envelope the extractor recognises.
#[must_use]
pub fn render_tool_call(call: &ToolCallRequest) -> String {
    serde_json::json!({
        "name": format!("{}.{}", call.server_name, call.method_name),
        "arguments": call.arguments,
    })
    .to_string()
}

/// Render a tool result (or error) as its structured JSON block.
#[must_use]
pub fn render_tool_outcome(outcome: &ToolCallOutcome) -> String {
    serde_json::to_value(outcome)
        .map(|v| v.to_string())
        .unwrap_or_default()
}

/// Fold a turn's visible content, handling the JSON-encoded array form
/// (`[{"type": "text", "text": …}, …]`) some providers persist.
fn turn_text(turn: &Turn) -> String {
    let trimmed = turn.content.trim();
    if trimmed.starts_with('[')
        && let Ok(Value::Array(parts)) = serde_json::from_str::<Value>(trimmed)
    {
        let texts: Vec<&str> = parts
            .iter()
            .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect();
        if !texts.is_empty() {
            return texts.join("");
        }
    }
    turn.content.clone()
}

/// Project rounds into messages: one `user` message per request, all
/// response turns folded into one `assistant` message, with completed
/// tool exchanges rendered as call + result blocks.
#[must_use]
pub fn project_rounds(rounds: &[Round]) -> Vec<Message> {
    let mut messages = Vec::new();

    for round in rounds {
        messages.push(Message::user(&round.request.content));

        let mut parts: Vec<String> = Vec::new();
        for turn in &round.response.turns {
            let text = turn_text(turn);
            if !text.trim().is_empty() {
                parts.push(text);
            }
            if let Some(exchange) = &turn.tool_calls
                && let Some(response) = &exchange.response
            {
                parts.push(render_tool_call(&exchange.call));
                parts.push(render_tool_outcome(response));
            }
        }

        let assistant = parts.join("\n");
        if !assistant.trim().is_empty() {
            messages.push(Message::assistant(assistant));
        }
    }

    messages
}

/// Tokens available for history: context window minus the system prompt
/// and a safety buffer.
pub fn available_tokens<P: ModelProvider + ?Sized>(
    provider: &P,
    system_prompt: &str,
    safety_buffer: usize,
) -> usize {
    provider
        .context_window()
        .saturating_sub(provider.count_tokens(system_prompt))
        .saturating_sub(safety_buffer)
}

/// Trim messages to a token budget.
///
/// The last `user` message and everything after it are always preserved;
/// earlier messages are prepended one at a time, newest first, until one
/// would overflow the budget.
#[must_use]
pub fn trim_messages(
    messages: Vec<Message>,
    available: usize,
    count: impl Fn(&str) -> usize,
) -> Vec<Message> {
    let total: usize = messages
        .iter()
        .map(|m| count(&m.content))
        .fold(0, usize::saturating_add);
    if total <= available {
        return messages;
    }

    let tail_start = messages
        .iter()
        .rposition(Message::is_user)
        .unwrap_or_else(|| messages.len().saturating_sub(1));

    let mut used: usize = messages[tail_start..]
        .iter()
        .map(|m| count(&m.content))
        .fold(0, usize::saturating_add);

    let mut keep_from = tail_start;
    for index in (0..tail_start).rev() {
        let cost = count(&messages[index].content);
        if used.saturating_add(cost) > available {
            break;
        }
        used = used.saturating_add(cost);
        keep_from = index;
    }

    debug!(
        dropped = keep_from,
        kept = messages.len().saturating_sub(keep_from),
        "history trimmed to budget"
    );
    messages[keep_from..].to_vec()
}
