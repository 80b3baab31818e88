//! Agent loop - core reasoning engine

use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use weaver_config::AgentDefaults;
use weaver_events::{EventEmitter, EventType};
use weaver_provider::{ChatClient, ChatRequest, Message, ProviderError, Role, ToolCall, ToolResult};

use crate::context::{ContextBuilder, HistoryEntry, Mode};
use crate::tools::{ToolContext, ToolExecutor, ToolRegistry};
use crate::{AgentError, Result};

/// Response returned when the iteration budget runs out
pub const MAX_ITERATIONS_RESPONSE: &str =
    "I couldn't finish this request within the allowed number of steps. \
     Try breaking it into smaller requests.";

/// Loop limits and sampling parameters
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub max_iterations: u32,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub history_limit: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::from(&AgentDefaults::default())
    }
}

impl From<&AgentDefaults> for AgentConfig {
    fn from(defaults: &AgentDefaults) -> Self {
        Self {
            max_iterations: defaults.max_iterations,
            max_tokens: defaults.max_tokens,
            temperature: Some(defaults.temperature),
            history_limit: defaults.history_limit,
        }
    }
}

/// One invocation of the agent
#[derive(Debug, Clone, Default)]
pub struct RunInput {
    pub message: String,
    pub mode: Mode,
    pub history: Vec<HistoryEntry>,
    pub tenant_id: String,
    pub user_id: String,
    pub project_id: Option<String>,
}

impl RunInput {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_history(mut self, history: Vec<HistoryEntry>) -> Self {
        self.history = history;
        self
    }

    pub fn with_identity(
        mut self,
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        self.tenant_id = tenant_id.into();
        self.user_id = user_id.into();
        self
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Done,
    MaxIterationsReached,
}

/// Result of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunOutput {
    pub response: String,
    /// Tool names in invocation order, repeats included
    pub tools_used: Vec<String>,
    pub iterations: u32,
    pub total_tokens: u64,
    pub outcome: RunOutcome,
    /// Full transcript of the run
    pub messages: Vec<Message>,
}

/// Drives a chat client through reasoning and tool-use iterations
pub struct AgentLoop<C, T: ?Sized = ToolRegistry> {
    client: Arc<C>,
    tools: Arc<T>,
    context: ContextBuilder,
    config: AgentConfig,
    events: EventEmitter,
}

impl<C, T> AgentLoop<C, T>
where
    C: ChatClient,
    T: ToolExecutor + ?Sized,
{
    pub fn new(client: C, tools: Arc<T>) -> Self {
        Self {
            client: Arc::new(client),
            tools,
            context: ContextBuilder::new(),
            config: AgentConfig::default(),
            events: EventEmitter::disabled(),
        }
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Run one request to completion.
    ///
    /// Tool failures are fed back to the model as error results. A chat
    /// failure emits an `error` event and ends the run; cancellation ends it
    /// silently with [`AgentError::Cancelled`].
    pub async fn run(&self, cancel: &CancellationToken, input: RunInput) -> Result<RunOutput> {
        let run_id = Uuid::new_v4();
        info!(
            "◆ Run {} started (mode: {}, tenant: {}, user: {})",
            run_id, input.mode, input.tenant_id, input.user_id
        );

        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let mut ctx =
            ToolContext::new(&input.tenant_id, &input.user_id).with_cancel(cancel.clone());
        if let Some(project_id) = &input.project_id {
            ctx = ctx.with_project(project_id);
        }

        let system_prompt = self
            .context
            .build_system_prompt(input.mode, input.project_id.as_deref());
        let mut messages =
            self.context
                .build_messages(&input.history, self.config.history_limit, &input.message);
        let definitions = self.tools.definitions();

        let mut tools_used: Vec<String> = Vec::new();
        let mut total_tokens: u64 = 0;

        for iteration in 1..=self.config.max_iterations {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            debug!("Run {} iteration {}", run_id, iteration);
            self.events
                .emit_kind(EventType::Thinking, json!({ "iteration": iteration }));

            let request = ChatRequest {
                system_prompt: system_prompt.clone(),
                messages: messages.clone(),
                tools: definitions.clone(),
                max_tokens: self.config.max_tokens,
                temperature: self.config.temperature,
            };

            let response = match self.client.chat_with_tools(cancel, request).await {
                Ok(response) => response,
                Err(ProviderError::Cancelled) => return Err(AgentError::Cancelled),
                Err(_) if cancel.is_cancelled() => return Err(AgentError::Cancelled),
                Err(e) => {
                    error!("◆ Run {} chat call failed: {}", run_id, e);
                    self.events.emit_kind(
                        EventType::Error,
                        json!({ "message": e.to_string(), "iteration": iteration }),
                    );
                    return Err(e.into());
                }
            };

            total_tokens += response.usage.total();
            let calls = response.tool_calls();

            if response.has_tool_use() && !calls.is_empty() {
                for call in &calls {
                    self.events.emit_kind(
                        EventType::ToolCall,
                        json!({ "id": call.id, "name": call.name, "input": call.input }),
                    );
                    tools_used.push(call.name.clone());
                }

                let results = match self.tools.execute_batch(&ctx, &calls).await {
                    Ok(results) if results.len() == calls.len() => results,
                    Ok(results) => {
                        warn!(
                            "◆ Tool batch returned {} results for {} calls",
                            results.len(),
                            calls.len()
                        );
                        batch_failure(&calls, "tool batch returned mismatched results")
                    }
                    Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
                    Err(e) => {
                        warn!("◆ Tool batch failed: {}", e);
                        batch_failure(&calls, &e.to_string())
                    }
                };

                if cancel.is_cancelled() {
                    return Err(AgentError::Cancelled);
                }

                append_assistant_turn(
                    &mut messages,
                    Message::assistant_blocks(response.content),
                );
                messages.push(Message::tool_results(&results));

                for (call, result) in calls.iter().zip(&results) {
                    self.events.emit_kind(
                        EventType::ToolResult,
                        json!({
                            "id": call.id,
                            "name": call.name,
                            "is_error": result.is_error,
                            "content": result.content,
                        }),
                    );
                }
                continue;
            }

            let text = response.text();
            if !text.is_empty() {
                self.events
                    .emit_kind(EventType::PartialText, json!({ "text": text }));
            }

            if response.is_end_turn() {
                if !text.is_empty() {
                    append_assistant_text(&mut messages, &text);
                }

                self.events.emit_kind(
                    EventType::Complete,
                    json!({
                        "response": text,
                        "iterations": iteration,
                        "tools_used": tools_used,
                        "total_tokens": total_tokens,
                    }),
                );
                info!(
                    "◆ Run {} done after {} iteration(s), {} tokens",
                    run_id, iteration, total_tokens
                );

                return Ok(RunOutput {
                    response: text,
                    tools_used,
                    iterations: iteration,
                    total_tokens,
                    outcome: RunOutcome::Done,
                    messages,
                });
            }

            debug!(
                "Run {} stopped with '{}', continuing",
                run_id, response.stop_reason
            );
            if !text.is_empty() {
                append_assistant_text(&mut messages, &text);
            }
        }

        warn!(
            "◆ Run {} hit the iteration limit ({})",
            run_id, self.config.max_iterations
        );
        self.events.emit_kind(
            EventType::Complete,
            json!({
                "response": MAX_ITERATIONS_RESPONSE,
                "iterations": self.config.max_iterations,
                "tools_used": tools_used,
                "total_tokens": total_tokens,
                "outcome": RunOutcome::MaxIterationsReached,
            }),
        );

        Ok(RunOutput {
            response: MAX_ITERATIONS_RESPONSE.to_string(),
            tools_used,
            iterations: self.config.max_iterations,
            total_tokens,
            outcome: RunOutcome::MaxIterationsReached,
            messages,
        })
    }
}

/// One error result per call, ids preserved
fn batch_failure(calls: &[ToolCall], reason: &str) -> Vec<ToolResult> {
    calls
        .iter()
        .map(|call| ToolResult::error(&call.id, reason))
        .collect()
}

/// Continue the trailing assistant turn instead of opening a second one
fn append_assistant_turn(messages: &mut Vec<Message>, turn: Message) {
    match messages.last_mut() {
        Some(last) if last.role == Role::Assistant => last.content.extend(turn.content),
        _ => messages.push(turn),
    }
}

fn append_assistant_text(messages: &mut Vec<Message>, text: &str) {
    append_assistant_turn(messages, Message::assistant(text));
}
