//! Bounded ring of recent per-server log lines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Default maximum number of retained records.
pub const DEFAULT_MAX_ENTRIES: usize = 100;

/// Default maximum message length in characters.
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 1000;

/// Sentinel appended to truncated messages.
const TRUNCATION_MARKER: &str = "…";

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Debug-level output.
    Debug,
    /// Informational output.
    Info,
    /// Warning output.
    Warning,
    /// Error output.
    Error,
}

impl LogLevel {
    /// Classify a raw stderr line by substring match.
    #[must_use]
    pub fn classify(line: &str) -> Self {
        let lower = line.to_lowercase();
        if lower.contains("error") {
            Self::Error
        } else if lower.contains("warn") {
            Self::Warning
        } else {
            Self::Info
        }
    }
}

/// A single buffered log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// When the record was appended.
    pub timestamp: DateTime<Utc>,
    /// Severity.
    pub level: LogLevel,
    /// Message text, truncated to the buffer's cap.
    pub message: String,
    /// Optional structured metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Bounded, thread-safe buffer of recent log records.
///
/// Appending beyond the entry cap evicts the oldest record. Messages longer
/// than the per-message cap are truncated with a marker.
#[derive(Debug)]
pub struct LogBuffer {
    entries: Mutex<VecDeque<LogRecord>>,
    max_entries: usize,
    max_message_len: usize,
}

impl LogBuffer {
    /// Create a buffer with default caps.
    #[must_use]
    pub fn new() -> Self {
        Self::with_caps(DEFAULT_MAX_ENTRIES, DEFAULT_MAX_MESSAGE_LEN)
    }

    /// Create a buffer with explicit caps.
    ///
    /// Caps of zero are bumped to one so the buffer stays usable.
    #[must_use]
    pub fn with_caps(max_entries: usize, max_message_len: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(max_entries.max(1))),
            max_entries: max_entries.max(1),
            max_message_len: max_message_len.max(1),
        }
    }

    /// Append a record, evicting the oldest when full.
    pub fn append(&self, level: LogLevel, message: impl Into<String>, metadata: Option<Value>) {
        let mut message = message.into();
        if message.chars().count() > self.max_message_len {
            message = message
                .chars()
                .take(self.max_message_len)
                .collect::<String>();
            message.push_str(TRUNCATION_MARKER);
        }

        let record = LogRecord {
            timestamp: Utc::now(),
            level,
            message,
            metadata,
        };

        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if entries.len() >= self.max_entries {
            entries.pop_front();
        }
        entries.push_back(record);
    }

    /// Copy of the buffered records, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<LogRecord> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.iter().cloned().collect()
    }

    /// Remove all records.
    pub fn clear(&self) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.clear();
    }

    /// Number of buffered records.
    #[must_use]
    pub fn len(&self) -> usize {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_snapshot() {
        let buf = LogBuffer::new();
        buf.append(LogLevel::Info, "hello", None);
        buf.append(LogLevel::Error, "boom", Some(serde_json::json!({"code": 1})));

        let snap = buf.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].message, "hello");
        assert_eq!(snap[1].level, LogLevel::Error);
    }

    #[test]
    fn test_eviction_keeps_newest() {
        let buf = LogBuffer::with_caps(3, 100);
        for i in 0..5 {
            buf.append(LogLevel::Info, format!("line {i}"), None);
        }
        let snap = buf.snapshot();
        assert_eq!(snap.len(), 3);
        assert_eq!(snap[0].message, "line 2");
        assert_eq!(snap[2].message, "line 4");
    }

    #[test]
    fn test_message_truncation() {
        let buf = LogBuffer::with_caps(10, 8);
        buf.append(LogLevel::Info, "a".repeat(20), None);
        let snap = buf.snapshot();
        assert_eq!(snap[0].message, format!("{}{}", "a".repeat(8), "…"));
    }

    #[test]
    fn test_clear() {
        let buf = LogBuffer::new();
        buf.append(LogLevel::Info, "x", None);
        buf.clear();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_stderr_classification() {
        assert_eq!(LogLevel::classify("ERROR: it broke"), LogLevel::Error);
        assert_eq!(LogLevel::classify("warning: odd input"), LogLevel::Warning);
        assert_eq!(LogLevel::classify("listening on :8080"), LogLevel::Info);
    }
}
