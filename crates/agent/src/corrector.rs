//! Self-correction
//!
//! Classifies failures into recovery strategies, produces guidance for the
//! model's next attempt, and recovers JSON wrapped in prose or markdown.

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, warn};

use weaver_config::CorrectionConfig;
use weaver_provider::ProviderError;

use crate::AgentError;

/// Failure category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    JsonParse,
    Validation,
    ToolNotFound,
    ToolExecution,
    RateLimit,
    Timeout,
    Unknown,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::JsonParse => "json_parse",
            ErrorType::Validation => "validation",
            ErrorType::ToolNotFound => "tool_not_found",
            ErrorType::ToolExecution => "tool_execution",
            ErrorType::RateLimit => "rate_limit",
            ErrorType::Timeout => "timeout",
            ErrorType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recovery action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    None,
    Retry,
    Reformat,
    Alternative,
    /// Needs a human; never retried automatically
    Ask,
}

/// Classification of one failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionResult {
    pub strategy: Strategy,
    /// Guidance for the next attempt, empty when there is none
    pub retry_message: String,
    pub should_retry: bool,
    pub error_type: ErrorType,
    pub error_message: String,
}

/// Correction errors
#[derive(Error, Debug)]
pub enum CorrectionError {
    #[error("unparsable response: {0}")]
    UnparsableResponse(String),

    #[error("giving up after {attempt} attempt(s): {original}")]
    RetryExhausted {
        original: String,
        correction: Box<CorrectionResult>,
        attempt: u32,
    },
}

/// Error classifier and retry driver
#[derive(Debug, Clone, Default)]
pub struct SelfCorrector {
    config: CorrectionConfig,
    available_tools: Vec<String>,
}

impl SelfCorrector {
    pub fn new(config: CorrectionConfig) -> Self {
        Self {
            config,
            available_tools: Vec::new(),
        }
    }

    /// Tool names to suggest when the model asks for one that does not exist
    pub fn with_available_tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = names.into_iter().map(Into::into).collect();
        names.sort();
        names.dedup();
        self.available_tools = names;
        self
    }

    pub fn config(&self) -> &CorrectionConfig {
        &self.config
    }

    /// Classify a failure. Total: every error maps to exactly one category.
    pub fn analyze(&self, error: &(dyn StdError + 'static)) -> CorrectionResult {
        let message = error.to_string();
        let error_type = classify_structured(error).unwrap_or_else(|| classify_message(&message));
        self.resolve(error_type, message)
    }

    /// Classify a bare error message
    pub fn analyze_message(&self, message: &str) -> CorrectionResult {
        self.resolve(classify_message(message), message.to_string())
    }

    fn resolve(&self, error_type: ErrorType, error_message: String) -> CorrectionResult {
        let (strategy, should_retry) = match error_type {
            ErrorType::JsonParse if self.config.retry_on_parse_error => (Strategy::Reformat, true),
            ErrorType::Validation if self.config.retry_on_validation => (Strategy::Retry, true),
            ErrorType::ToolNotFound => (Strategy::Alternative, true),
            ErrorType::ToolExecution if self.config.retry_on_tool_error => (Strategy::Retry, true),
            ErrorType::Unknown => (Strategy::Ask, false),
            _ => (Strategy::None, false),
        };

        let mut result = CorrectionResult {
            strategy,
            retry_message: String::new(),
            should_retry,
            error_type,
            error_message,
        };
        result.retry_message = self.retry_message(&result).unwrap_or_default();
        result
    }

    /// Guidance text for the model's next attempt
    pub fn retry_message(&self, result: &CorrectionResult) -> Option<String> {
        if !result.should_retry {
            return None;
        }

        let err = &result.error_message;
        match (result.strategy, result.error_type) {
            (Strategy::Reformat, _) => Some(format!(
                "Your previous response could not be parsed as JSON ({err}). \
                 Reply again with valid JSON only, without markdown fences or commentary."
            )),
            (Strategy::Retry, ErrorType::Validation) => Some(format!(
                "The previous request failed validation: {err}. \
                 Fix the offending fields and try again."
            )),
            (Strategy::Alternative, _) if self.available_tools.is_empty() => Some(format!(
                "{err}. Use only the tools listed in your tool definitions."
            )),
            (Strategy::Alternative, _) => Some(format!(
                "{err}. Use only the available tools: {}.",
                self.available_tools.join(", ")
            )),
            (Strategy::Retry, _) => Some(format!(
                "The previous tool call failed: {err}. \
                 Adjust the input or choose a different approach."
            )),
            _ => None,
        }
    }

    /// Run `op` until it succeeds or the failure is not worth retrying.
    ///
    /// `op` receives the previous attempt's classification (`None` on the
    /// first call) and is invoked at most `max_retries + 1` times.
    pub async fn with_correction<T, E, F, Fut>(
        &self,
        max_retries: u32,
        mut op: F,
    ) -> Result<T, CorrectionError>
    where
        E: StdError + 'static,
        F: FnMut(Option<CorrectionResult>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut previous = None;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let error = match op(previous.take()).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let correction = self.analyze(&error);
            if !correction.should_retry || attempt > max_retries {
                debug!(
                    "◆ Not retrying {} ({:?}) after {} attempt(s)",
                    correction.error_type, correction.strategy, attempt
                );
                return Err(CorrectionError::RetryExhausted {
                    original: error.to_string(),
                    correction: Box::new(correction),
                    attempt,
                });
            }

            warn!(
                "◆ Attempt {} failed with {}, retrying: {}",
                attempt, correction.error_type, correction.error_message
            );
            previous = Some(correction);
        }
    }
}

fn classify_structured(error: &(dyn StdError + 'static)) -> Option<ErrorType> {
    if let Some(err) = error.downcast_ref::<AgentError>() {
        return match err {
            AgentError::ToolNotFound(_) => Some(ErrorType::ToolNotFound),
            AgentError::ToolExecution { .. } => Some(ErrorType::ToolExecution),
            AgentError::InvalidTool(_) | AgentError::DuplicateTool(_) => {
                Some(ErrorType::Validation)
            }
            AgentError::Cancelled => Some(ErrorType::Unknown),
            AgentError::Provider(p) => classify_provider(p),
        };
    }
    if let Some(err) = error.downcast_ref::<ProviderError>() {
        return classify_provider(err);
    }
    if let Some(err) = error.downcast_ref::<CorrectionError>() {
        return match err {
            CorrectionError::UnparsableResponse(_) => Some(ErrorType::JsonParse),
            CorrectionError::RetryExhausted { correction, .. } => Some(correction.error_type),
        };
    }
    if error.is::<serde_json::Error>() {
        return Some(ErrorType::JsonParse);
    }
    None
}

fn classify_provider(error: &ProviderError) -> Option<ErrorType> {
    match error {
        ProviderError::Upstream { status: 429, .. } => Some(ErrorType::RateLimit),
        ProviderError::Timeout(_) => Some(ErrorType::Timeout),
        ProviderError::Request(e) if e.is_timeout() => Some(ErrorType::Timeout),
        ProviderError::Cancelled => Some(ErrorType::Unknown),
        _ => None,
    }
}

/// Ordered substring rules; the first match wins
fn classify_message(message: &str) -> ErrorType {
    let msg = message.to_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|n| msg.contains(n));

    if any(&["json", "parse", "unmarshal", "syntax"]) {
        ErrorType::JsonParse
    } else if any(&["validation", "invalid", "required", "missing"]) {
        ErrorType::Validation
    } else if msg.contains("tool") && msg.contains("not found") {
        ErrorType::ToolNotFound
    } else if any(&["execute", "execution"]) {
        ErrorType::ToolExecution
    } else if any(&["rate", "limit", "429"]) {
        ErrorType::RateLimit
    } else if any(&["timeout", "deadline"]) {
        ErrorType::Timeout
    } else {
        ErrorType::Unknown
    }
}

const FENCE_PATTERN: &str = r"(?s)^\s*```[\w+.-]*[ \t]*\r?\n(.*?)\r?\n?\s*```\s*$";

/// Decode JSON that may be wrapped in a markdown fence or surrounded by prose
pub fn parse_with_correction<T: DeserializeOwned>(
    raw: impl AsRef<[u8]>,
) -> Result<T, CorrectionError> {
    let raw = raw.as_ref();

    let first_err = match serde_json::from_slice::<T>(raw) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };

    let text = String::from_utf8_lossy(raw);

    if let Some(inner) = strip_fence(&text) {
        if let Ok(value) = serde_json::from_str::<T>(inner) {
            debug!("◆ Recovered JSON from fenced block");
            return Ok(value);
        }
    }

    if let Some(span) = balanced_span(&text) {
        if let Ok(value) = serde_json::from_str::<T>(span) {
            debug!("◆ Recovered JSON from embedded span");
            return Ok(value);
        }
    }

    Err(CorrectionError::UnparsableResponse(first_err.to_string()))
}

fn strip_fence(text: &str) -> Option<&str> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = FENCE.get_or_init(|| Regex::new(FENCE_PATTERN).ok()).as_ref()?;
    re.captures(text).and_then(|c| c.get(1)).map(|m| m.as_str())
}

/// First balanced `{...}` or `[...]` span, skipping brackets inside strings
fn balanced_span(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_message_rules_are_ordered() {
        // "invalid json" hits the parse rule before validation
        assert_eq!(classify_message("invalid JSON payload"), ErrorType::JsonParse);
        assert_eq!(classify_message("field is required"), ErrorType::Validation);
        assert_eq!(classify_message("Tool foo Not Found"), ErrorType::ToolNotFound);
        assert_eq!(classify_message("failed to execute step"), ErrorType::ToolExecution);
        assert_eq!(classify_message("HTTP 429"), ErrorType::RateLimit);
        assert_eq!(classify_message("deadline exceeded"), ErrorType::Timeout);
        assert_eq!(classify_message("something odd"), ErrorType::Unknown);
    }

    #[test]
    fn test_not_found_without_tool_is_unknown() {
        assert_eq!(classify_message("page not found"), ErrorType::Unknown);
    }

    #[test]
    fn test_balanced_span_respects_strings() {
        let text = r#"prefix {"a": "}{", "b": [1, 2]} trailing }"#;
        assert_eq!(balanced_span(text), Some(r#"{"a": "}{", "b": [1, 2]}"#));

        let text = r#"see ["x\"]", 2] and more"#;
        assert_eq!(balanced_span(text), Some(r#"["x\"]", 2]"#));

        assert_eq!(balanced_span("{ never closed"), None);
        assert_eq!(balanced_span("no json"), None);
    }

    #[test]
    fn test_strip_fence_variants() {
        assert_eq!(strip_fence("```json\n{\"a\":1}\n```"), Some("{\"a\":1}"));
        assert_eq!(strip_fence("```\n[1]\n```\n"), Some("[1]"));
        assert_eq!(strip_fence("plain"), None);
    }

    #[test]
    fn test_fence_then_span_fallback() {
        let value: Value = parse_with_correction("Here you go: {\"ok\": true}.").unwrap();
        assert_eq!(value, json!({"ok": true}));
    }

    #[test]
    fn test_retry_message_lists_known_tools() {
        let corrector = SelfCorrector::default().with_available_tools(["list_blocks", "get_block"]);
        let result = corrector.analyze(&AgentError::ToolNotFound("make_coffee".into()));

        assert_eq!(result.strategy, Strategy::Alternative);
        assert!(result
            .retry_message
            .contains("Use only the available tools: get_block, list_blocks."));
    }
}
