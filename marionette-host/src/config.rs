//! Supervisor configuration.

use std::collections::HashSet;
use std::time::Duration;

use marionette_concurrency::ConcurrencyConfig;
use marionette_termination::TerminationConfig;

/// All the supervisor's tunables. Subsets project into the termination
/// and concurrency configs.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Task store location (opaque to the core, handed to integrations).
    pub db_path: String,

    /// Iteration budget per task.
    pub max_iterations: u32,
    /// Wall-clock bound for a single iteration.
    pub iteration_timeout: Duration,
    /// Settle time after each tool call before the next perception step.
    pub screenshot_delay: Duration,

    /// Default retry budget for unclassified errors.
    pub max_retries: u32,
    /// Default exponential backoff base.
    pub retry_backoff_base: f64,

    /// How many tasks may run at once.
    pub max_concurrent_tasks: usize,
    /// How many model calls may be in flight at once.
    pub max_api_concurrency: usize,

    /// Save a checkpoint every N iterations.
    pub checkpoint_interval: u32,

    /// Context token ceiling.
    pub max_context_tokens: usize,
    /// Compress proactively past this fraction of the ceiling.
    pub context_compress_threshold: f64,

    /// Wall-clock budget for the whole task.
    pub task_timeout: Duration,
    /// Consecutive failing iterations tolerated.
    pub max_consecutive_failures: u32,
    /// Total failing iterations tolerated.
    pub max_total_failures: u32,

    /// Whether to cross-check self-declared completions.
    pub verify_success: bool,
    /// Model used for the cross-check.
    pub verification_model: String,
    /// Minimum confidence for a verification to pass.
    pub min_verification_confidence: f64,

    /// Tools whose invocation requires user confirmation.
    pub sensitive_tools: HashSet<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            db_path: "marionette_tasks.db".into(),
            max_iterations: 50,
            iteration_timeout: Duration::from_secs(120),
            screenshot_delay: Duration::from_millis(750),
            max_retries: 3,
            retry_backoff_base: 2.0,
            max_concurrent_tasks: 3,
            max_api_concurrency: 5,
            checkpoint_interval: 5,
            max_context_tokens: 180_000,
            context_compress_threshold: 0.75,
            task_timeout: Duration::from_secs(1800),
            max_consecutive_failures: 3,
            max_total_failures: 10,
            verify_success: true,
            verification_model: "claude-3-haiku-20240307".into(),
            min_verification_confidence: 0.7,
            sensitive_tools: [
                "delete_file",
                "system_command",
                "send_email",
                "make_payment",
                "modify_settings",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl AgentConfig {
    /// The termination-checker subset.
    #[must_use]
    pub fn to_termination_config(&self) -> TerminationConfig {
        TerminationConfig {
            max_iterations: self.max_iterations,
            task_timeout: self.task_timeout,
            iteration_timeout: self.iteration_timeout,
            max_consecutive_failures: self.max_consecutive_failures,
            max_total_failures: self.max_total_failures,
            max_context_tokens: self.max_context_tokens,
        }
    }

    /// The concurrency-manager subset.
    #[must_use]
    pub fn to_concurrency_config(&self) -> ConcurrencyConfig {
        ConcurrencyConfig {
            max_concurrent_tasks: self.max_concurrent_tasks,
            max_api_concurrency: self.max_api_concurrency,
            ..ConcurrencyConfig::default()
        }
    }
}
