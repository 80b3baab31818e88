//! Agent core
//!
//! Tool registry, self-correction and the reasoning loop that drives a chat
//! client through tool-use iterations.

use thiserror::Error;

pub mod context;
pub mod corrector;
pub mod loop_agent;
pub mod tools;

pub use context::{ContextBuilder, HistoryEntry, Mode};
pub use corrector::{
    parse_with_correction, CorrectionError, CorrectionResult, ErrorType, SelfCorrector, Strategy,
};
pub use loop_agent::{
    AgentConfig, AgentLoop, RunInput, RunOutcome, RunOutput, MAX_ITERATIONS_RESPONSE,
};
pub use tools::{handler_fn, BoxError, Tool, ToolContext, ToolExecutor, ToolHandler, ToolRegistry};

pub use weaver_provider::ProviderError;

/// Agent errors
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("invalid tool: {0}")]
    InvalidTool(String),

    #[error("duplicate tool: {0}")]
    DuplicateTool(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("tool '{tool}' execution failed: {source}")]
    ToolExecution {
        tool: String,
        #[source]
        source: BoxError,
    },

    #[error("chat client error: {0}")]
    Provider(#[from] ProviderError),

    #[error("run cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, AgentError>;
