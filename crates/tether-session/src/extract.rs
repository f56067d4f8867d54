//! Incremental extraction of tool calls embedded in model text.
//!
//! The model emits tool calls as JSON objects of shape
//! `{"name": "<server>.<method>", "arguments": {…}}` inline with prose.
//! The extractor scans a growing buffer for balanced brace regions,
//! validates them, removes them from the visible content, and emits call
//! records. Malformed or unterminated regions stay in the buffer until a
//! later chunk completes them; scanning is strict, with no pattern-based
//! stripping of fragments.

use serde_json::Value;
use std::time::{Duration, Instant};

use crate::store::ToolCallRequest;

/// Minimum interval between rate-limited parse attempts.
pub const DEFAULT_EXTRACT_INTERVAL: Duration = Duration::from_millis(100);

/// Incremental tool-call extractor over streamed text.
pub struct ToolCallExtractor {
    content: String,
    min_interval: Duration,
    last_attempt: Option<Instant>,
}

impl ToolCallExtractor {
    /// Create an extractor with the default rate limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_interval(DEFAULT_EXTRACT_INTERVAL)
    }

    /// Create an extractor with an explicit rate limit.
    #[must_use]
    pub fn with_interval(min_interval: Duration) -> Self {
        Self {
            content: String::new(),
            min_interval,
            last_attempt: None,
        }
    }

    /// Append a stream chunk to the buffer.
    pub fn append(&mut self, text: &str) {
        self.content.push_str(text);
    }

    /// The buffered text with all extracted regions removed.
    #[must_use]
    pub fn visible_content(&self) -> &str {
        &self.content
    }

    /// Rate-limited extraction: a no-op within the minimum interval of
    /// the previous attempt. Returns newly extracted calls, in order.
    pub fn extract(&mut self) -> Vec<ToolCallRequest> {
        if let Some(last) = self.last_attempt
            && last.elapsed() < self.min_interval
        {
            return Vec::new();
        }
        self.extract_now()
    }

    /// Unconditional extraction, used once the stream is done.
    pub fn extract_now(&mut self) -> Vec<ToolCallRequest> {
        self.last_attempt = Some(Instant::now());

        let (remaining, calls) = scan(&self.content);
        if !calls.is_empty() {
            self.content = remaining;
        }
        calls
    }
}

impl Default for ToolCallExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Scan for balanced top-level `{…}` regions that parse as tool calls.
/// Returns the text with extracted regions removed (collapsing whitespace
/// that spanned a removal) and the calls in emission order.
fn scan(content: &str) -> (String, Vec<ToolCallRequest>) {
    let mut calls = Vec::new();
    let mut removals: Vec<(usize, usize)> = Vec::new();

    let mut depth: u32 = 0;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in content.char_indices() {
        if depth > 0 && in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = idx;
                }
                depth = depth.saturating_add(1);
            },
            '}' if depth > 0 => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    let end = idx.saturating_add(ch.len_utf8());
                    if let Some(call) = parse_tool_call(&content[start..end]) {
                        removals.push((start, end));
                        calls.push(call);
                    }
                }
            },
            _ => {},
        }
    }

    if removals.is_empty() {
        return (content.to_string(), calls);
    }

    let mut out = String::with_capacity(content.len());
    let mut cursor = 0usize;
    for &(region_start, region_end) in &removals {
        push_collapsed(&mut out, &content[cursor..region_start]);
        cursor = region_end;
    }
    push_collapsed(&mut out, &content[cursor..]);

    (out, calls)
}

/// Append a segment, collapsing whitespace that would otherwise double up
/// across a removed region. Whitespace inside surviving prose is never
/// touched.
fn push_collapsed(out: &mut String, segment: &str) {
    if segment.is_empty() {
        return;
    }
    let trailing_ws = out.chars().next_back().is_some_and(char::is_whitespace);
    if trailing_ws && segment.starts_with(char::is_whitespace) {
        out.push_str(segment.trim_start());
    } else {
        out.push_str(segment);
    }
}

/// A region is a tool call when it parses as an object whose top-level
/// keys include a dotted `name` string and an `arguments` object.
fn parse_tool_call(region: &str) -> Option<ToolCallRequest> {
    let value: Value = serde_json::from_str(region).ok()?;
    let object = value.as_object()?;
    let name = object.get("name")?.as_str()?;
    let arguments = object.get("arguments")?;
    if !arguments.is_object() {
        return None;
    }

    let (server_name, method_name) = name.split_once('.')?;
    if server_name.is_empty() || method_name.is_empty() {
        return None;
    }

    Some(ToolCallRequest {
        server_name: server_name.to_string(),
        method_name: method_name.to_string(),
        arguments: arguments.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> ToolCallExtractor {
        ToolCallExtractor::with_interval(Duration::ZERO)
    }

    #[test]
    fn test_extracts_call_and_strips_region() {
        let mut ex = extractor();
        ex.append("Hello {\"name\":\"s1.ping\",\"arguments\":{}}");

        let calls = ex.extract_now();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].server_name, "s1");
        assert_eq!(calls[0].method_name, "ping");
        assert_eq!(calls[0].arguments, serde_json::json!({}));
        assert_eq!(ex.visible_content(), "Hello ");
    }

    #[test]
    fn test_whitespace_collapsed_across_removal() {
        let mut ex = extractor();
        ex.append("before {\"name\":\"a.b\",\"arguments\":{}} after");
        ex.extract_now();
        assert_eq!(ex.visible_content(), "before after");
    }

    #[test]
    fn test_partial_json_left_pending() {
        let mut ex = extractor();
        ex.append("text {\"name\":\"s1.pi");
        assert!(ex.extract_now().is_empty());
        assert_eq!(ex.visible_content(), "text {\"name\":\"s1.pi");

        ex.append("ng\",\"arguments\":{\"x\":1}}");
        let calls = ex.extract_now();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments, serde_json::json!({"x": 1}));
        assert_eq!(ex.visible_content(), "text ");
    }

    #[test]
    fn test_non_tool_objects_survive() {
        let mut ex = extractor();
        ex.append("config is {\"key\": \"value\"} and {\"name\": \"nodot\", \"arguments\": {}}");
        assert!(ex.extract_now().is_empty());
        assert_eq!(
            ex.visible_content(),
            "config is {\"key\": \"value\"} and {\"name\": \"nodot\", \"arguments\": {}}"
        );
    }

    #[test]
    fn test_braces_inside_strings_do_not_confuse() {
        let mut ex = extractor();
        ex.append("{\"name\":\"s1.run\",\"arguments\":{\"code\":\"if (x) { y(); }\"}}");
        let calls = ex.extract_now();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].arguments,
            serde_json::json!({"code": "if (x) { y(); }"})
        );
    }

    #[test]
    fn test_escaped_quotes_in_strings() {
        let mut ex = extractor();
        ex.append("{\"name\":\"s1.say\",\"arguments\":{\"text\":\"quote \\\" and } brace\"}}");
        let calls = ex.extract_now();
        assert_eq!(calls.len(), 1);
    }

    #[test]
    fn test_multiple_calls_in_order() {
        let mut ex = extractor();
        ex.append(
            "{\"name\":\"a.one\",\"arguments\":{}} middle {\"name\":\"b.two\",\"arguments\":{}}",
        );
        let calls = ex.extract_now();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].method_name, "one");
        assert_eq!(calls[1].method_name, "two");
        assert_eq!(ex.visible_content(), "middle ");
    }

    #[test]
    fn test_idempotent_on_repeated_extraction() {
        let mut ex = extractor();
        ex.append("keep {\"name\":\"s.m\",\"arguments\":{}} this");
        let first = ex.extract_now();
        assert_eq!(first.len(), 1);
        let visible = ex.visible_content().to_string();

        let second = ex.extract_now();
        assert!(second.is_empty());
        assert_eq!(ex.visible_content(), visible);
    }

    #[test]
    fn test_rate_limit_defers_until_forced() {
        let mut ex = ToolCallExtractor::with_interval(Duration::from_secs(60));
        assert!(ex.extract().is_empty()); // first attempt, nothing buffered

        ex.append("{\"name\":\"s.m\",\"arguments\":{}}");
        // Within the interval: deferred.
        assert!(ex.extract().is_empty());
        // Forced extraction ignores the interval.
        assert_eq!(ex.extract_now().len(), 1);
    }

    #[test]
    fn test_method_name_splits_on_first_dot() {
        let mut ex = extractor();
        ex.append("{\"name\":\"srv.ns.method\",\"arguments\":{}}");
        let calls = ex.extract_now();
        assert_eq!(calls[0].server_name, "srv");
        assert_eq!(calls[0].method_name, "ns.method");
    }
}
