//! Context builder for assembling agent prompts

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use weaver_provider::Message;

/// Task the assistant is asked to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Create,
    Enhance,
    Explain,
    #[default]
    General,
}

impl Mode {
    /// Parse a mode name; anything unrecognized is `General`
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "create" => Mode::Create,
            "enhance" => Mode::Enhance,
            "explain" => Mode::Explain,
            _ => Mode::General,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Create => "create",
            Mode::Enhance => "enhance",
            Mode::Explain => "explain",
            Mode::General => "general",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted transcript line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
}

impl HistoryEntry {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }

    fn to_message(&self) -> Option<Message> {
        match self.role.as_str() {
            "user" => Some(Message::user(&self.content)),
            "assistant" => Some(Message::assistant(&self.content)),
            _ => None,
        }
    }
}

/// Builds the system prompt and seed messages for a run
#[derive(Debug, Clone, Default)]
pub struct ContextBuilder;

impl ContextBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Build the system prompt for a mode
    pub fn build_system_prompt(&self, mode: Mode, project_id: Option<&str>) -> String {
        let mut parts = vec![self.identity()];

        parts.push(match mode {
            Mode::Create => Self::create_section(),
            Mode::Enhance => Self::enhance_section(project_id),
            Mode::Explain => Self::explain_section(),
            Mode::General => Self::general_section(),
        });

        parts.join("\n\n---\n\n")
    }

    fn identity(&self) -> String {
        let now = Local::now().format("%Y-%m-%d %H:%M (%A)");

        format!(
            r#"# weaver

You are weaver, an assistant that designs and maintains automation workflows.
A workflow is a graph of blocks connected by edges; each block has a type and a configuration.
You have tools to inspect the available block types, read existing projects and propose changes.

## Current Time
{}

Use tools whenever you need facts about blocks or projects instead of guessing.
Keep answers concise. When you are done, reply with plain text."#,
            now
        )
    }

    fn create_section() -> String {
        r#"## Task: Create
Design a new workflow for the user's request.
- Look up the block types you plan to use before referencing them.
- Describe the blocks, their configuration and how they connect.
- Ask for missing details only when the request cannot be satisfied without them."#
            .to_string()
    }

    fn enhance_section(project_id: Option<&str>) -> String {
        let target = match project_id {
            Some(id) if !id.is_empty() => format!(
                "The target project is `{}`. Load it before proposing changes.",
                id
            ),
            _ => "No target project was given; ask which project to change if it is unclear."
                .to_string(),
        };

        format!(
            r#"## Task: Enhance
Improve an existing workflow.
{}
- Keep working parts intact and explain every change you make."#,
            target
        )
    }

    fn explain_section() -> String {
        r#"## Task: Explain
Explain how a workflow or block works in plain language.
- Walk through the data flow from trigger to final block.
- Do not modify anything."#
            .to_string()
    }

    fn general_section() -> String {
        r#"## Task: General
Answer questions about workflows, blocks and automation.
Use tools when the answer depends on the current catalog or project state."#
            .to_string()
    }

    /// Seed messages: the last `limit` user/assistant history entries,
    /// followed by the current user message
    pub fn build_messages(
        &self,
        history: &[HistoryEntry],
        limit: usize,
        current: &str,
    ) -> Vec<Message> {
        let replayable: Vec<Message> = history
            .iter()
            .filter_map(HistoryEntry::to_message)
            .collect();
        let skip = replayable.len().saturating_sub(limit);

        debug!(
            "Replaying {} of {} history messages",
            replayable.len() - skip,
            history.len()
        );

        let mut messages: Vec<Message> = replayable.into_iter().skip(skip).collect();
        messages.push(Message::user(current));
        messages
    }
}
