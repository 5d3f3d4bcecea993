//! Error taxonomy and recovery strategies.
//!
//! Every error carries a category, a severity, and a recoverability flag.
//! The supervisor consults [`recovery_strategy`] when an error escapes a
//! tool boundary; errors raised *inside* a tool never reach it (they are
//! converted to failing tool results and surfaced to the model instead).

use serde::Serialize;
use thiserror::Error;

use crate::types::{Hwnd, TaskStatus};

/// How bad an error is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    /// Noted, execution unaffected.
    Warning,
    /// Retry or degrade.
    Error,
    /// Stop the task.
    Critical,
    /// Emergency stop.
    Fatal,
}

/// Which subsystem an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Model/provider errors.
    Llm,
    /// Tool execution errors.
    Tool,
    /// Window errors.
    Window,
    /// Task state errors.
    State,
    /// Concurrency control errors.
    Concurrency,
    /// Security screen errors.
    Security,
    /// Tool-call validation errors.
    Validation,
    /// Everything else.
    Unknown,
}

/// The runtime's error type.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum AgentError {
    /// Provider returned a non-success status.
    #[error("api error (status {status}): {message}")]
    Api {
        /// HTTP-ish status code.
        status: u16,
        /// Provider message.
        message: String,
        /// Provider-suggested wait, seconds.
        retry_after: Option<u64>,
    },

    /// Provider rate limit hit.
    #[error("rate limited (retry after {retry_after:?}s)")]
    RateLimited {
        /// Provider-suggested wait, seconds.
        retry_after: Option<u64>,
    },

    /// The conversation no longer fits the context window.
    #[error("context exceeds token limit ({current_tokens}/{max_tokens})")]
    TokenLimit {
        /// Estimated current size.
        current_tokens: usize,
        /// Configured ceiling.
        max_tokens: usize,
    },

    /// The model response could not be parsed.
    #[error("failed to parse model response: {0}")]
    ResponseParse(String),

    /// A tool body failed.
    #[error("tool '{tool}' failed: {message}")]
    ToolExecution {
        /// Tool name.
        tool: String,
        /// Arguments as issued.
        args: serde_json::Value,
        /// Failure description.
        message: String,
    },

    /// No tool with that name is registered.
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// A tool call failed shape or type validation.
    #[error("invalid tool call, field '{field}': {message}")]
    ToolValidation {
        /// Offending field.
        field: String,
        /// What was wrong.
        message: String,
    },

    /// A tool exceeded its deadline.
    #[error("tool '{tool}' timed out after {timeout_ms}ms")]
    ToolTimeout {
        /// Tool name.
        tool: String,
        /// The deadline that was exceeded.
        timeout_ms: u64,
    },

    /// The target window no longer exists.
    #[error("window {hwnd} no longer exists")]
    WindowLost {
        /// The lost window.
        hwnd: Hwnd,
    },

    /// The target window refused focus.
    #[error("window {hwnd} cannot be focused")]
    WindowNotFocusable {
        /// The window.
        hwnd: Hwnd,
    },

    /// Another task holds the window lock.
    #[error("window {hwnd} is locked by {owner}")]
    WindowLocked {
        /// The contended window.
        hwnd: Hwnd,
        /// Task id of the current holder.
        owner: String,
    },

    /// A task status transition outside the legal set.
    #[error("illegal task transition: {from} -> {to}")]
    InvalidStateTransition {
        /// Current status.
        from: TaskStatus,
        /// Requested status.
        to: TaskStatus,
    },

    /// The task id is unknown to the store.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// Saving or loading a checkpoint failed.
    #[error("checkpoint failed: {0}")]
    Checkpoint(String),

    /// All task slots are occupied.
    #[error("too many concurrent tasks ({current}/{max})")]
    TooManyTasks {
        /// Currently running tasks.
        current: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A generic lock acquisition failed.
    #[error("resource lock failed: {0}")]
    ResourceLock(String),

    /// An action the current principal may not perform.
    #[error("unauthorized action: {0}")]
    Unauthorized(String),

    /// The user denied a confirmation-gated tool.
    #[error("sensitive operation denied: {tool}")]
    SensitiveOperationDenied {
        /// The gated tool.
        tool: String,
    },

    /// The security screen matched an injection pattern.
    #[error("prompt injection detected: {0}")]
    PromptInjection(String),

    /// A critical fault; the task must stop.
    #[error("critical error: {0}")]
    Critical(String),

    /// A fatal fault; emergency stop.
    #[error("fatal error: {0}")]
    Fatal(String),

    /// Persistence-layer failure surfaced by a `TaskStore`.
    #[error("store error: {0}")]
    Store(String),
}

impl AgentError {
    /// Severity of this error.
    #[must_use]
    pub fn severity(&self) -> ErrorSeverity {
        use AgentError::*;
        match self {
            ToolNotFound(_) | ToolValidation { .. } | Checkpoint(_) | TooManyTasks { .. } => {
                ErrorSeverity::Warning
            }
            WindowLost { .. } | Unauthorized(_) | Critical(_) => ErrorSeverity::Critical,
            PromptInjection(_) | Fatal(_) => ErrorSeverity::Fatal,
            _ => ErrorSeverity::Error,
        }
    }

    /// Subsystem this error belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        use AgentError::*;
        match self {
            Api { .. } | RateLimited { .. } | TokenLimit { .. } | ResponseParse(_) => {
                ErrorCategory::Llm
            }
            ToolExecution { .. } | ToolNotFound(_) | ToolTimeout { .. } => ErrorCategory::Tool,
            ToolValidation { .. } => ErrorCategory::Validation,
            WindowLost { .. } | WindowNotFocusable { .. } | WindowLocked { .. } => {
                ErrorCategory::Window
            }
            InvalidStateTransition { .. } | TaskNotFound(_) | Checkpoint(_) | Store(_) => {
                ErrorCategory::State
            }
            TooManyTasks { .. } | ResourceLock(_) => ErrorCategory::Concurrency,
            Unauthorized(_) | SensitiveOperationDenied { .. } | PromptInjection(_) => {
                ErrorCategory::Security
            }
            Critical(_) | Fatal(_) => ErrorCategory::Unknown,
        }
    }

    /// Whether retrying could help.
    #[must_use]
    pub fn recoverable(&self) -> bool {
        use AgentError::*;
        !matches!(
            self,
            WindowLost { .. }
                | InvalidStateTransition { .. }
                | TaskNotFound(_)
                | Unauthorized(_)
                | SensitiveOperationDenied { .. }
                | PromptInjection(_)
                | Critical(_)
                | Fatal(_)
        )
    }

    /// Whether the supervisor should retry: recoverable and not fatal.
    #[must_use]
    pub fn should_retry(&self) -> bool {
        self.recoverable() && self.severity() != ErrorSeverity::Fatal
    }

    /// Whether this is a security-screen error (never retried, always
    /// surfaced to the user).
    #[must_use]
    pub fn is_security(&self) -> bool {
        self.category() == ErrorCategory::Security
    }

    /// Serialized form for events and logs.
    #[must_use]
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "message": self.to_string(),
            "category": self.category(),
            "severity": self.severity(),
            "recoverable": self.recoverable(),
        })
    }
}

/// Fallback action a recovery strategy may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    /// Compress the conversation, then retry once.
    CompressContext,
    /// Nothing extra: the failure already reached the model as a tool
    /// result.
    InformLlm,
}

/// How the supervisor should react to an error outside the tool boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryStrategy {
    /// Whether to retry at all.
    pub retry: bool,
    /// Retry budget for the task lifecycle.
    pub max_retries: u32,
    /// Exponential backoff base: sleep `base ^ attempt` seconds.
    pub backoff_base: f64,
    /// Optional fallback action before the retry.
    pub fallback: Option<Fallback>,
    /// Whether the user must be told.
    pub notify_user: bool,
}

impl RecoveryStrategy {
    fn no_retry(notify_user: bool) -> Self {
        Self {
            retry: false,
            max_retries: 0,
            backoff_base: 0.0,
            fallback: None,
            notify_user,
        }
    }

    fn retry(max_retries: u32, backoff_base: f64) -> Self {
        Self {
            retry: true,
            max_retries,
            backoff_base,
            fallback: None,
            notify_user: false,
        }
    }

    fn with_fallback(mut self, fallback: Fallback) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

/// Look up the recovery strategy for an error.
#[must_use]
pub fn recovery_strategy(error: &AgentError) -> RecoveryStrategy {
    use AgentError::*;
    match error {
        RateLimited { retry_after } => {
            RecoveryStrategy::retry(5, (*retry_after).unwrap_or(5) as f64)
        }
        Api { .. } => RecoveryStrategy::retry(3, 2.0),
        TokenLimit { .. } => RecoveryStrategy::retry(1, 1.0).with_fallback(Fallback::CompressContext),
        ToolExecution { .. } => RecoveryStrategy::retry(2, 1.0).with_fallback(Fallback::InformLlm),
        WindowLost { .. } => RecoveryStrategy::no_retry(true),
        TooManyTasks { .. } => RecoveryStrategy::retry(10, 1.0),
        e if e.is_security() => RecoveryStrategy::no_retry(true),
        e if e.recoverable() => RecoveryStrategy::retry(2, 2.0),
        _ => RecoveryStrategy::no_retry(true),
    }
}
