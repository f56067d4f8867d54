//! Deterministic system-prompt assembly.
//!
//! Sections are emitted in a fixed order (Instructions, Tools, Files,
//! Dynamic Context, Workspace Metadata, System Information, Current
//! Date/Time), each only when present and non-empty, joined by exactly
//! two newlines. Equal inputs produce byte-equal output, except for the
//! date section, which reads a clock at build time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use tether_mcp::ToolWithServer;

/// Preamble emitted ahead of the tool listing, documenting the inline
/// invocation format the extractor recognises.
pub const TOOL_CALL_PREAMBLE: &str = "You can invoke the tools listed below. \
To call a tool, emit a JSON object with this exact shape inline in your response:\n\
\n\
{\"name\": \"<server>.<tool>\", \"arguments\": { ... }}\n\
\n\
The arguments object must conform to the tool's input schema. The result \
is returned to you before you continue.";

/// A named file included verbatim in the prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileContext {
    /// Display name.
    pub name: String,
    /// File content.
    pub content: String,
}

/// A named dynamic-context result, serialized as a fenced JSON block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicContextEntry {
    /// Display name.
    pub name: String,
    /// Result value.
    pub result: Value,
}

/// Workspace metadata surfaced to the model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceMetadata {
    /// Workspace name.
    pub name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Optional path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Date section configuration.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DateSection {
    /// ISO-8601 with time when set; locale long-form date otherwise.
    #[serde(default)]
    pub include_time: bool,
}

/// Typed input to the prompt builder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemPromptConfig {
    /// Instructions section.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    /// Tools section, grouped by server when emitted.
    #[serde(default)]
    pub tools: Vec<ToolWithServer>,
    /// Files section.
    #[serde(default)]
    pub files: Vec<FileContext>,
    /// Dynamic-context section.
    #[serde(default)]
    pub dynamic_context: Vec<DynamicContextEntry>,
    /// Workspace metadata section.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<WorkspaceMetadata>,
    /// Emit the system-information section.
    #[serde(default)]
    pub include_system_info: bool,
    /// Date section; omitted when `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateSection>,
}

impl SystemPromptConfig {
    /// Empty config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set instructions.
    #[must_use]
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Set the tool listing.
    #[must_use]
    pub fn with_tools(mut self, tools: Vec<ToolWithServer>) -> Self {
        self.tools = tools;
        self
    }

    /// Add a file.
    #[must_use]
    pub fn with_file(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.push(FileContext {
            name: name.into(),
            content: content.into(),
        });
        self
    }

    /// Add a dynamic-context entry.
    #[must_use]
    pub fn with_dynamic_context(mut self, name: impl Into<String>, result: Value) -> Self {
        self.dynamic_context.push(DynamicContextEntry {
            name: name.into(),
            result,
        });
        self
    }

    /// Set workspace metadata.
    #[must_use]
    pub fn with_workspace(mut self, workspace: WorkspaceMetadata) -> Self {
        self.workspace = Some(workspace);
        self
    }

    /// Emit the system-information section.
    #[must_use]
    pub fn with_system_info(mut self) -> Self {
        self.include_system_info = true;
        self
    }

    /// Emit the date section.
    #[must_use]
    pub fn with_date(mut self, include_time: bool) -> Self {
        self.date = Some(DateSection { include_time });
        self
    }
}

/// Assemble the system prompt, reading the clock for the date section.
#[must_use]
pub fn build_system_prompt(config: &SystemPromptConfig) -> String {
    build_system_prompt_at(config, Utc::now())
}

/// Assemble the system prompt with an explicit clock value.
#[must_use]
pub fn build_system_prompt_at(config: &SystemPromptConfig, now: DateTime<Utc>) -> String {
    let mut sections: Vec<String> = Vec::new();

    if let Some(instructions) = config.instructions.as_deref()
        && !instructions.is_empty()
    {
        sections.push(format!("## Instructions\n{instructions}"));
    }

    if !config.tools.is_empty() {
        sections.push(tools_section(&config.tools));
    }

    if !config.files.is_empty() {
        let mut section = String::from("## Files");
        for file in &config.files {
            section.push_str(&format!("\n### {}\n```\n{}\n```", file.name, file.content));
        }
        sections.push(section);
    }

    if !config.dynamic_context.is_empty() {
        let mut section = String::from("## Dynamic Context");
        for entry in &config.dynamic_context {
            let body = serde_json::to_string_pretty(&entry.result)
                .unwrap_or_else(|_| entry.result.to_string());
            section.push_str(&format!("\n### {}\n```json\n{body}\n```", entry.name));
        }
        sections.push(section);
    }

    if let Some(workspace) = &config.workspace {
        let mut section = format!("## Workspace\nName: {}", workspace.name);
        if let Some(description) = &workspace.description {
            section.push_str(&format!("\nDescription: {description}"));
        }
        if let Some(path) = &workspace.path {
            section.push_str(&format!("\nPath: {path}"));
        }
        sections.push(section);
    }

    if config.include_system_info {
        sections.push(format!(
            "## System Information\nOS: {}\nArchitecture: {}",
            std::env::consts::OS,
            std::env::consts::ARCH
        ));
    }

    if let Some(date) = &config.date {
        let value = if date.include_time {
            now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        } else {
            now.format("%A, %B %d, %Y").to_string()
        };
        sections.push(format!("## Current Date/Time\n{value}"));
    }

    sections.join("\n\n")
}

fn tools_section(tools: &[ToolWithServer]) -> String {
    // Group by server, sorted by server name; tool order within a server
    // is preserved as given.
    let mut by_server: BTreeMap<&str, Vec<&ToolWithServer>> = BTreeMap::new();
    for tool in tools {
        by_server.entry(&tool.server_name).or_default().push(tool);
    }

    let mut section = format!("## Tools\n{TOOL_CALL_PREAMBLE}");
    for (server, server_tools) in by_server {
        section.push_str(&format!("\n### Server: {server}"));
        for entry in server_tools {
            let schema = serde_json::to_string_pretty(&entry.tool.input_schema)
                .unwrap_or_else(|_| entry.tool.input_schema.to_string());
            section.push_str(&format!(
                "\n#### {}\n{}\nInput schema:\n```json\n{schema}\n```",
                entry.tool.name,
                entry.tool.description.as_deref().unwrap_or(""),
            ));
        }
    }
    section
}
