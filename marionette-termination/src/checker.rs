//! The terminate-or-continue decision engine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use marionette_types::{ToolCall, ToolResult};

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// The agent declared the task done.
    Completed,
    /// The agent asked for user help.
    NeedsHelp,
    /// Iteration budget exhausted.
    MaxIterations,
    /// Wall-clock budget exhausted.
    Timeout,
    /// Context token budget exhausted.
    TokenLimit,
    /// Too many failing iterations.
    ConsecutiveFailures,
    /// The target window disappeared.
    WindowLost,
    /// A critical fault outside the agent's control.
    CriticalError,
    /// The user cancelled.
    UserCancelled,
    /// The user paused.
    UserPaused,
}

/// ERROR vs FAIL partition of termination reasons.
///
/// FAIL is a task-level negative outcome the agent reached by its own
/// reasoning; ERROR is a system-level fault that prevented the agent
/// from reasoning further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationType {
    /// Completed successfully.
    Success,
    /// Negative outcome (may be retryable by a new task).
    Fail,
    /// System fault; emergency stop.
    Error,
    /// User-driven stop.
    Cancelled,
}

/// The checker's verdict for one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminationResult {
    /// Whether the loop must stop.
    pub should_terminate: bool,
    /// Why, when terminating.
    pub reason: Option<TerminationReason>,
    /// ERROR/FAIL/SUCCESS/CANCELLED partition, when terminating.
    pub termination_type: Option<TerminationType>,
    /// Human-readable explanation.
    pub message: String,
    /// Structured detail for events and logs.
    #[serde(default)]
    pub details: serde_json::Value,
}

impl TerminationResult {
    /// Keep iterating.
    #[must_use]
    pub fn continue_running() -> Self {
        Self {
            should_terminate: false,
            reason: None,
            termination_type: None,
            message: "Continue".into(),
            details: serde_json::Value::Null,
        }
    }

    /// Terminate successfully.
    #[must_use]
    pub fn completed(message: impl Into<String>) -> Self {
        Self {
            should_terminate: true,
            reason: Some(TerminationReason::Completed),
            termination_type: Some(TerminationType::Success),
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    /// Terminate as a task-level failure.
    #[must_use]
    pub fn failed(
        reason: TerminationReason,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            should_terminate: true,
            reason: Some(reason),
            termination_type: Some(TerminationType::Fail),
            message: message.into(),
            details,
        }
    }

    /// Terminate as a system fault.
    #[must_use]
    pub fn error(
        reason: TerminationReason,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            should_terminate: true,
            reason: Some(reason),
            termination_type: Some(TerminationType::Error),
            message: message.into(),
            details,
        }
    }

    /// Terminate as a user-driven stop.
    #[must_use]
    pub fn cancelled(reason: TerminationReason, message: impl Into<String>) -> Self {
        Self {
            should_terminate: true,
            reason: Some(reason),
            termination_type: Some(TerminationType::Cancelled),
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    /// Serialized form for events.
    #[must_use]
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Thresholds for the checker.
#[derive(Debug, Clone)]
pub struct TerminationConfig {
    /// Iteration budget.
    pub max_iterations: u32,
    /// Wall-clock budget for the whole task.
    pub task_timeout: Duration,
    /// Wall-clock bound for a single iteration.
    pub iteration_timeout: Duration,
    /// Consecutive failing iterations tolerated.
    pub max_consecutive_failures: u32,
    /// Total failing iterations tolerated.
    pub max_total_failures: u32,
    /// Context token ceiling.
    pub max_context_tokens: usize,
}

impl Default for TerminationConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            task_timeout: Duration::from_secs(1800),
            iteration_timeout: Duration::from_secs(120),
            max_consecutive_failures: 3,
            max_total_failures: 10,
            max_context_tokens: 180_000,
        }
    }
}

/// A detected `set_task_status` invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusCall {
    /// The declared status: `"completed"` or `"needs_help"`.
    pub status: String,
    /// The agent's explanation.
    pub description: String,
    /// Detection time.
    pub timestamp: DateTime<Utc>,
}

/// Find the first `set_task_status` call among `tool_calls`.
#[must_use]
pub fn detect_set_task_status(tool_calls: &[ToolCall]) -> Option<TaskStatusCall> {
    tool_calls
        .iter()
        .find(|call| call.name == "set_task_status")
        .map(|call| TaskStatusCall {
            status: call.arg_str("status").unwrap_or_default().to_string(),
            description: call.arg_str("description").unwrap_or_default().to_string(),
            timestamp: Utc::now(),
        })
}

/// Everything the checker observes about one iteration.
#[derive(Debug, Clone)]
pub struct CheckContext {
    /// The current iteration index.
    pub iteration: u32,
    /// Tool results produced this iteration.
    pub tool_results: Vec<ToolResult>,
    /// A `set_task_status` call seen this iteration, if any.
    pub set_task_status: Option<TaskStatusCall>,
    /// Whether every target window still exists.
    pub window_exists: bool,
    /// Time since the task started.
    pub elapsed: Duration,
    /// Current context size in tokens (0 = unknown).
    pub current_tokens: usize,
    /// A critical fault observed outside tool dispatch.
    pub critical_error: Option<String>,
}

impl CheckContext {
    /// Benign defaults for the given iteration.
    #[must_use]
    pub fn new(iteration: u32) -> Self {
        Self {
            iteration,
            tool_results: Vec::new(),
            set_task_status: None,
            window_exists: true,
            elapsed: Duration::ZERO,
            current_tokens: 0,
            critical_error: None,
        }
    }

    /// Attach this iteration's tool results.
    #[must_use]
    pub fn with_tool_results(mut self, results: Vec<ToolResult>) -> Self {
        self.tool_results = results;
        self
    }

    /// Record a detected `set_task_status` call.
    #[must_use]
    pub fn with_status_call(mut self, call: TaskStatusCall) -> Self {
        self.set_task_status = Some(call);
        self
    }

    /// Record the window probe outcome.
    #[must_use]
    pub fn with_window_exists(mut self, exists: bool) -> Self {
        self.window_exists = exists;
        self
    }

    /// Record elapsed task time.
    #[must_use]
    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    /// Record the current context size.
    #[must_use]
    pub fn with_tokens(mut self, tokens: usize) -> Self {
        self.current_tokens = tokens;
        self
    }

    /// Record a critical fault.
    #[must_use]
    pub fn with_critical_error(mut self, error: impl Into<String>) -> Self {
        self.critical_error = Some(error.into());
        self
    }
}

/// Failure counters and user flags, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckerStats {
    /// Failing iterations in a row.
    pub consecutive_failures: u32,
    /// Failing iterations overall.
    pub total_failures: u32,
    /// Last iteration with zero failing results.
    pub last_success_iteration: u32,
    /// Whether the user cancelled.
    pub user_cancelled: bool,
    /// Whether the user paused.
    pub user_paused: bool,
}

/// Priority-ordered termination decisions.
///
/// Check order: status call, user cancel, user pause, critical error,
/// window lost, failure-counter update, consecutive failures, total
/// failures, iteration budget, timeout, token ceiling.
#[derive(Debug)]
pub struct TerminationChecker {
    config: TerminationConfig,
    consecutive_failures: u32,
    total_failures: u32,
    last_success_iteration: u32,
    user_cancelled: bool,
    user_paused: bool,
}

impl TerminationChecker {
    /// Create a checker with the given thresholds.
    #[must_use]
    pub fn new(config: TerminationConfig) -> Self {
        Self {
            config,
            consecutive_failures: 0,
            total_failures: 0,
            last_success_iteration: 0,
            user_cancelled: false,
            user_paused: false,
        }
    }

    /// Decide whether the loop should stop, updating failure counters as
    /// a side effect.
    pub fn check(&mut self, ctx: CheckContext) -> TerminationResult {
        // 1. set_task_status wins over everything, including a lost window.
        if let Some(call) = &ctx.set_task_status {
            match call.status.as_str() {
                "completed" => return TerminationResult::completed("Task completed by agent"),
                "needs_help" => {
                    return TerminationResult::failed(
                        TerminationReason::NeedsHelp,
                        "Agent needs user help",
                        serde_json::json!({ "description": call.description }),
                    );
                }
                _ => {}
            }
        }

        // 2–3. User control.
        if self.user_cancelled {
            return TerminationResult::cancelled(
                TerminationReason::UserCancelled,
                "Cancelled by user",
            );
        }
        if self.user_paused {
            return TerminationResult::cancelled(TerminationReason::UserPaused, "Paused by user");
        }

        // 4. Critical fault.
        if let Some(error) = &ctx.critical_error {
            return TerminationResult::error(
                TerminationReason::CriticalError,
                format!("Critical error: {error}"),
                serde_json::json!({ "error": error }),
            );
        }

        // 5. Window lost.
        if !ctx.window_exists {
            return TerminationResult::error(
                TerminationReason::WindowLost,
                "Target window no longer exists",
                serde_json::Value::Null,
            );
        }

        // 6. Failure counters.
        let has_failure = ctx.tool_results.iter().any(ToolResult::is_error);
        if has_failure {
            self.consecutive_failures += 1;
            self.total_failures += 1;
        } else {
            self.consecutive_failures = 0;
            self.last_success_iteration = ctx.iteration;
        }

        // 7. Consecutive failures.
        if self.consecutive_failures >= self.config.max_consecutive_failures {
            return TerminationResult::failed(
                TerminationReason::ConsecutiveFailures,
                format!("{} consecutive tool failures", self.consecutive_failures),
                serde_json::json!({
                    "consecutive_failures": self.consecutive_failures,
                    "max_allowed": self.config.max_consecutive_failures,
                }),
            );
        }

        // 8. Total failures.
        if self.total_failures >= self.config.max_total_failures {
            return TerminationResult::failed(
                TerminationReason::ConsecutiveFailures,
                format!("Total failures ({}) exceeded limit", self.total_failures),
                serde_json::json!({
                    "total_failures": self.total_failures,
                    "max_allowed": self.config.max_total_failures,
                }),
            );
        }

        // 9. Iteration budget.
        if ctx.iteration >= self.config.max_iterations {
            return TerminationResult::failed(
                TerminationReason::MaxIterations,
                format!("Reached max iterations ({})", self.config.max_iterations),
                serde_json::json!({
                    "iteration": ctx.iteration,
                    "max_iterations": self.config.max_iterations,
                }),
            );
        }

        // 10. Wall clock.
        if ctx.elapsed > self.config.task_timeout {
            return TerminationResult::failed(
                TerminationReason::Timeout,
                format!("Task timed out after {:.1}s", ctx.elapsed.as_secs_f64()),
                serde_json::json!({
                    "elapsed_s": ctx.elapsed.as_secs_f64(),
                    "timeout_s": self.config.task_timeout.as_secs_f64(),
                }),
            );
        }

        // 11. Token ceiling. Zero means "not measured".
        if ctx.current_tokens > 0 && ctx.current_tokens > self.config.max_context_tokens {
            return TerminationResult::failed(
                TerminationReason::TokenLimit,
                format!(
                    "Context exceeds token limit ({}/{})",
                    ctx.current_tokens, self.config.max_context_tokens
                ),
                serde_json::json!({
                    "current_tokens": ctx.current_tokens,
                    "max_tokens": self.config.max_context_tokens,
                }),
            );
        }

        TerminationResult::continue_running()
    }

    /// Signal user cancellation; observed at the next check.
    pub fn cancel(&mut self) {
        self.user_cancelled = true;
    }

    /// Signal user pause; observed at the next check.
    pub fn pause(&mut self) {
        self.user_paused = true;
    }

    /// Clear the pause flag.
    pub fn resume(&mut self) {
        self.user_paused = false;
    }

    /// Zero every counter and clear the user flags.
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.total_failures = 0;
        self.last_success_iteration = 0;
        self.user_cancelled = false;
        self.user_paused = false;
    }

    /// Current counters and flags.
    #[must_use]
    pub fn stats(&self) -> CheckerStats {
        CheckerStats {
            consecutive_failures: self.consecutive_failures,
            total_failures: self.total_failures,
            last_success_iteration: self.last_success_iteration,
            user_cancelled: self.user_cancelled,
            user_paused: self.user_paused,
        }
    }
}
