//! The supervisor agent and its run loop.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use marionette_agent::{AgentFactory, AppAgent};
use marionette_blackboard::{Blackboard, BlackboardSnapshot};
use marionette_concurrency::ConcurrencyManager;
use marionette_termination::{
    CheckContext, SuccessVerifier, TerminationChecker, TerminationReason, TerminationResult,
    TerminationType, detect_set_task_status,
};
use marionette_types::{
    AgentError, AgentEvent, ContextCompressor, ErrorSeverity, EventBus, EventType, Fallback, Hwnd,
    LlmClient, Message, ParamType, TaskStatus, TaskStore, ToolCall, ToolCallRecord,
    ToolDefinition, ToolParameter, ToolResult, recovery_strategy,
};
use marionette_validate::ToolCallValidator;

use crate::config::AgentConfig;
use crate::state_manager::TaskStateManager;

/// Supervisor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostAgentState {
    /// No task in flight.
    Idle,
    /// Admitting a task and building its plan.
    Planning,
    /// Iterating.
    Executing,
    /// Blocked on a user decision.
    WaitingConfirm,
    /// The last task ended badly.
    Error,
    /// The last task completed.
    Completed,
}

/// What one pass of the loop produced.
#[derive(Debug, Clone)]
pub struct IterationResult {
    /// Iteration index at execution time.
    pub iteration: u32,
    /// Tool calls the model issued.
    pub tool_calls: Vec<ToolCall>,
    /// Their results, index-aligned with `tool_calls`.
    pub tool_results: Vec<ToolResult>,
    /// Free text from the model.
    pub thinking: Option<String>,
    /// Wall-clock duration of the iteration.
    pub duration_ms: f64,
    /// Whether the model expects another turn.
    pub should_continue: bool,
    /// Error caught inside the iteration, if any.
    pub error: Option<String>,
    /// Whether that error was critical (triggers emergency stop).
    pub critical: bool,
}

impl IterationResult {
    fn empty(iteration: u32) -> Self {
        Self {
            iteration,
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            thinking: None,
            duration_ms: 0.0,
            should_continue: false,
            error: None,
            critical: false,
        }
    }
}

/// The structured result of `process_task` / `resume`.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    /// The task.
    pub task_id: String,
    /// Terminal (or paused) status.
    pub status: TaskStatus,
    /// Iterations executed.
    pub iterations: u32,
    /// Wall-clock duration.
    pub duration: Duration,
    /// Final blackboard contents.
    pub blackboard: Option<BlackboardSnapshot>,
}

/// One entry in the supervisor's tool registry.
#[derive(Clone)]
enum HostTool {
    /// The built-in `set_task_status` tool.
    SetTaskStatus,
    /// A per-window worker exposed as `app_agent_<hwnd>`.
    Agent(Arc<dyn AppAgent>),
}

/// Cloneable control surface usable while a task runs: cancellation,
/// pause, and confirmation replies all cross the loop boundary here.
#[derive(Clone)]
pub struct HostControl {
    checker: Arc<StdMutex<TerminationChecker>>,
    confirmations: Arc<StdMutex<HashMap<String, oneshot::Sender<bool>>>>,
}

impl HostControl {
    /// Cancel the running task at the next iteration boundary.
    pub fn cancel(&self) {
        self.checker.lock().expect("checker poisoned").cancel();
    }

    /// Pause the running task at the next iteration boundary.
    pub fn pause(&self) {
        self.checker.lock().expect("checker poisoned").pause();
    }

    /// Clear a pending pause.
    pub fn resume(&self) {
        self.checker.lock().expect("checker poisoned").resume();
    }

    /// Answer a pending `USER_CONFIRM_REQUIRED` request. Returns `false`
    /// when the action id is unknown (already answered or expired).
    pub fn resolve_confirmation(&self, action_id: &str, approved: bool) -> bool {
        let sender = self
            .confirmations
            .lock()
            .expect("confirmation map poisoned")
            .remove(action_id);
        match sender {
            Some(sender) => sender.send(approved).is_ok(),
            None => false,
        }
    }
}

type ThinkingCallback = Arc<dyn Fn(&str) + Send + Sync>;
type ToolStartCallback = Arc<dyn Fn(&str, &serde_json::Value) + Send + Sync>;
type ToolEndCallback = Arc<dyn Fn(&str, &ToolResult) + Send + Sync>;

/// The supervisor. Owns the outer loop, the tool registry (built-ins
/// plus `app_agent_<hwnd>` workers), the per-task blackboard, and the
/// termination/verification machinery.
///
/// One `HostAgent` processes one task at a time; several hosts may share
/// one [`ConcurrencyManager`].
pub struct HostAgent {
    config: AgentConfig,
    llm: Arc<dyn LlmClient>,
    state_manager: TaskStateManager,
    event_bus: Arc<dyn EventBus>,
    probe: Arc<dyn marionette_types::WindowProbe>,
    factory: Arc<AgentFactory>,
    concurrency: Arc<ConcurrencyManager>,
    verifier: SuccessVerifier,
    verification_client: Option<Arc<dyn LlmClient>>,
    compressor: Option<Arc<dyn ContextCompressor>>,

    host_state: HostAgentState,
    is_processing: bool,
    current_task_id: Option<String>,
    iteration_count: u32,
    retry_count: u32,
    start_time: Option<Instant>,
    messages: Vec<Message>,
    tool_history: Vec<ToolCallRecord>,
    target_hwnds: HashSet<Hwnd>,
    last_response_tokens: usize,

    app_agents: HashMap<Hwnd, Arc<dyn AppAgent>>,
    tools: HashMap<String, HostTool>,
    tool_definitions: Vec<ToolDefinition>,

    blackboard: Option<Arc<Blackboard>>,

    checker: Arc<StdMutex<TerminationChecker>>,
    confirmations: Arc<StdMutex<HashMap<String, oneshot::Sender<bool>>>>,

    on_thinking: Option<ThinkingCallback>,
    on_tool_start: Option<ToolStartCallback>,
    on_tool_end: Option<ToolEndCallback>,
}

impl HostAgent {
    /// Create a supervisor over its collaborators.
    #[must_use]
    pub fn new(
        config: AgentConfig,
        llm: Arc<dyn LlmClient>,
        task_store: Arc<dyn TaskStore>,
        event_bus: Arc<dyn EventBus>,
        probe: Arc<dyn marionette_types::WindowProbe>,
        factory: Arc<AgentFactory>,
        concurrency: Arc<ConcurrencyManager>,
    ) -> Self {
        let verifier = SuccessVerifier::new(
            config.verification_model.clone(),
            config.min_verification_confidence,
        );
        let checker = Arc::new(StdMutex::new(TerminationChecker::new(
            config.to_termination_config(),
        )));
        info!(max_iterations = config.max_iterations, "host agent created");

        let mut host = Self {
            config,
            llm,
            state_manager: TaskStateManager::new(task_store),
            event_bus,
            probe,
            factory,
            concurrency,
            verifier,
            verification_client: None,
            compressor: None,
            host_state: HostAgentState::Idle,
            is_processing: false,
            current_task_id: None,
            iteration_count: 0,
            retry_count: 0,
            start_time: None,
            messages: Vec::new(),
            tool_history: Vec::new(),
            target_hwnds: HashSet::new(),
            last_response_tokens: 0,
            app_agents: HashMap::new(),
            tools: HashMap::new(),
            tool_definitions: Vec::new(),
            blackboard: None,
            checker,
            confirmations: Arc::new(StdMutex::new(HashMap::new())),
            on_thinking: None,
            on_tool_start: None,
            on_tool_end: None,
        };
        host.register_builtin_tools();
        host
    }

    /// Set the (typically cheaper) client used for success verification.
    #[must_use]
    pub fn with_verification_client(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.verification_client = Some(client);
        self
    }

    /// Set the context-compression hook.
    #[must_use]
    pub fn with_compressor(mut self, compressor: Arc<dyn ContextCompressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    /// Observe model thinking.
    pub fn on_thinking(&mut self, callback: ThinkingCallback) {
        self.on_thinking = Some(callback);
    }

    /// Observe tool starts.
    pub fn on_tool_start(&mut self, callback: ToolStartCallback) {
        self.on_tool_start = Some(callback);
    }

    /// Observe tool completions.
    pub fn on_tool_end(&mut self, callback: ToolEndCallback) {
        self.on_tool_end = Some(callback);
    }

    /// The control surface for UIs and watchdogs.
    #[must_use]
    pub fn control(&self) -> HostControl {
        HostControl {
            checker: Arc::clone(&self.checker),
            confirmations: Arc::clone(&self.confirmations),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> HostAgentState {
        self.host_state
    }

    /// Whether a task is in flight.
    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.is_processing
    }

    /// The in-flight task, if any.
    #[must_use]
    pub fn current_task_id(&self) -> Option<&str> {
        self.current_task_id.as_deref()
    }

    /// The current task's blackboard.
    #[must_use]
    pub fn blackboard(&self) -> Option<&Arc<Blackboard>> {
        self.blackboard.as_ref()
    }

    // --- tool registry ---

    fn register_builtin_tools(&mut self) {
        self.tools
            .insert("set_task_status".into(), HostTool::SetTaskStatus);
        self.tool_definitions.push(
            ToolDefinition::new(
                "set_task_status",
                "Set the task status. Call when the task is finished or you need user help.",
                vec![
                    ToolParameter::required("status", ParamType::String, "Task status")
                        .with_enum(&["completed", "needs_help"]),
                    ToolParameter::required(
                        "description",
                        ParamType::String,
                        "What was completed, or what help is needed",
                    ),
                ],
            )
            .category("control"),
        );
    }

    /// Register a worker as the `app_agent_<hwnd>` tool. Re-registering
    /// the same window replaces the entry.
    pub fn register_app_agent(&mut self, agent: Arc<dyn AppAgent>) {
        let hwnd = agent.hwnd();
        let tool_name = format!("app_agent_{hwnd}");

        self.tool_definitions.retain(|d| d.name != tool_name);
        self.tool_definitions.push(
            ToolDefinition::new(
                tool_name.clone(),
                format!("Execute task on {} window (hwnd={hwnd})", agent.app_type()),
                vec![ToolParameter::required(
                    "task",
                    ParamType::String,
                    "Task to execute on this window",
                )],
            )
            .window_bound()
            .category("agent"),
        );
        self.tools.insert(tool_name, HostTool::Agent(Arc::clone(&agent)));
        self.app_agents.insert(hwnd, agent);
        info!(hwnd, "registered app agent");
    }

    /// Remove a worker and its tool.
    pub fn unregister_app_agent(&mut self, hwnd: Hwnd) {
        if self.app_agents.remove(&hwnd).is_some() {
            let tool_name = format!("app_agent_{hwnd}");
            self.tools.remove(&tool_name);
            self.tool_definitions.retain(|d| d.name != tool_name);
            info!(hwnd, "unregistered app agent");
        }
    }

    /// The worker for a window, if registered.
    #[must_use]
    pub fn app_agent(&self, hwnd: Hwnd) -> Option<&Arc<dyn AppAgent>> {
        self.app_agents.get(&hwnd)
    }

    /// Create (or fetch) the worker for a window through the factory and
    /// register it.
    pub async fn register_window(
        &mut self,
        hwnd: Hwnd,
        app_type: Option<&str>,
    ) -> Arc<dyn AppAgent> {
        let agent = self.factory.create(hwnd, app_type, None).await;
        self.register_app_agent(Arc::clone(&agent));
        agent
    }

    // --- task processing ---

    /// Process one task to a terminal status.
    ///
    /// Admission is atomic: a task slot plus every target window lock,
    /// or a clean rejection with nothing held.
    ///
    /// # Errors
    ///
    /// `AgentError::TooManyTasks` when no slot is free,
    /// `AgentError::WindowLocked` when a target window is held elsewhere,
    /// `AgentError::Critical` when this host is already processing, and
    /// any unrecoverable error escaping the loop (after the task has
    /// been failed).
    pub async fn process_task(
        &mut self,
        task_id: &str,
        task_text: &str,
        target_hwnds: &[Hwnd],
    ) -> Result<TaskOutcome, AgentError> {
        if self.is_processing {
            return Err(AgentError::Critical(format!(
                "already processing task {:?}",
                self.current_task_id
            )));
        }
        info!(task_id, "starting task");

        let hwnd_set: HashSet<Hwnd> = target_hwnds.iter().copied().collect();
        if !self.concurrency.acquire_task_slot(task_id, hwnd_set.clone()) {
            return Err(AgentError::TooManyTasks {
                current: self.concurrency.active_task_count(),
                max: self.config.max_concurrent_tasks,
            });
        }
        if !hwnd_set.is_empty() && !self.concurrency.acquire_windows(&hwnd_set, task_id).await {
            self.concurrency.release_task_slot(task_id);
            let hwnd = hwnd_set.iter().copied().next().unwrap_or(0);
            return Err(AgentError::WindowLocked {
                hwnd,
                owner: self
                    .concurrency
                    .get_window_owner(hwnd)
                    .unwrap_or_else(|| "another task".into()),
            });
        }

        self.begin_task(task_id, hwnd_set);

        let outcome = match self.drive_task(task_id, task_text, target_hwnds).await {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                error!(task_id, %error, "task failed with error");
                self.fail_task(task_id, &error.to_string()).await;
                Err(error)
            }
        };
        self.cleanup_after_task(task_id);
        outcome
    }

    /// Reset per-task fields for a fresh run.
    fn begin_task(&mut self, task_id: &str, hwnd_set: HashSet<Hwnd>) {
        self.is_processing = true;
        self.current_task_id = Some(task_id.to_string());
        self.host_state = HostAgentState::Planning;
        self.iteration_count = 0;
        self.retry_count = 0;
        self.start_time = Some(Instant::now());
        self.messages = Vec::new();
        self.tool_history = Vec::new();
        self.target_hwnds = hwnd_set;
        self.last_response_tokens = 0;
        self.blackboard = Some(Arc::new(Blackboard::new(Some(task_id.to_string()))));
        *self.checker.lock().expect("checker poisoned") =
            TerminationChecker::new(self.config.to_termination_config());
    }

    async fn drive_task(
        &mut self,
        task_id: &str,
        task_text: &str,
        target_hwnds: &[Hwnd],
    ) -> Result<TaskOutcome, AgentError> {
        self.state_manager
            .create_task(task_id, task_text, target_hwnds)
            .await?;
        self.state_manager
            .transition(task_id, TaskStatus::Running, None)
            .await?;

        self.publish(
            EventType::TaskStarted,
            serde_json::json!({
                "task_text": task_text,
                "target_hwnds": target_hwnds,
            }),
        )
        .await;

        self.messages.push(Message::user(task_text));
        self.run_loop(task_id, task_text).await
    }

    /// Release everything `process_task` acquired and clear per-task
    /// identity. The lifecycle state set by termination handling is
    /// preserved.
    fn cleanup_after_task(&mut self, task_id: &str) {
        let hwnds = std::mem::take(&mut self.target_hwnds);
        self.concurrency.release_windows(&hwnds);
        self.concurrency.release_task_slot(task_id);
        self.is_processing = false;
        self.current_task_id = None;
        if self.host_state == HostAgentState::Executing
            || self.host_state == HostAgentState::Planning
        {
            self.host_state = HostAgentState::Idle;
        }
    }

    // --- the loop ---

    async fn run_loop(
        &mut self,
        task_id: &str,
        task_text: &str,
    ) -> Result<TaskOutcome, AgentError> {
        self.host_state = HostAgentState::Executing;

        let mut final_screenshot: Option<String> = None;
        let mut termination: Option<TerminationResult> = None;

        while self.is_processing {
            let elapsed = self
                .start_time
                .map(|s| s.elapsed())
                .unwrap_or(Duration::ZERO);

            let result = self.run_iteration(task_id).await?;
            self.iteration_count += 1;

            let iteration_errored = result.tool_results.iter().any(ToolResult::is_error);
            for call in &result.tool_calls {
                self.tool_history.push(ToolCallRecord {
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                    error: iteration_errored,
                });
            }
            for tool_result in &result.tool_results {
                if let Some(image) = &tool_result.base64_image {
                    final_screenshot = Some(image.clone());
                }
            }

            let status_call = detect_set_task_status(&result.tool_calls);
            let window_exists = self.check_windows_exist().await;

            let mut ctx = CheckContext::new(self.iteration_count)
                .with_tool_results(result.tool_results.clone())
                .with_window_exists(window_exists)
                .with_elapsed(elapsed)
                .with_tokens(self.last_response_tokens);
            if let Some(call) = status_call {
                ctx = ctx.with_status_call(call);
            }
            if result.critical {
                ctx = ctx.with_critical_error(result.error.clone().unwrap_or_default());
            }

            let verdict = self.checker.lock().expect("checker poisoned").check(ctx);
            if verdict.should_terminate {
                info!(
                    task_id,
                    reason = ?verdict.reason,
                    termination_type = ?verdict.termination_type,
                    "task terminating"
                );
                termination = Some(verdict);
                break;
            }

            if self.config.checkpoint_interval > 0
                && self.iteration_count % self.config.checkpoint_interval == 0
            {
                self.save_checkpoint(task_id).await?;
            }

            tokio::task::yield_now().await;
        }

        if let Some(verdict) = termination {
            self.handle_termination(task_id, task_text, &verdict, final_screenshot.as_deref())
                .await?;
        }
        self.task_outcome(task_id).await
    }

    /// Run one iteration, routing caught errors through the recovery
    /// table. Recoverable errors come back as a retryable empty result;
    /// critical ones are flagged for emergency stop; the rest propagate.
    async fn run_iteration(&mut self, task_id: &str) -> Result<IterationResult, AgentError> {
        let iteration = self.iteration_count;
        let started = Instant::now();

        match self.iteration_body(task_id).await {
            Ok(mut result) => {
                result.duration_ms = started.elapsed().as_secs_f64() * 1000.0;
                Ok(result)
            }
            Err(error) => {
                error!(iteration, %error, "iteration error");
                if self.handle_error(&error).await {
                    let mut result = IterationResult::empty(iteration);
                    result.should_continue = true;
                    result.error = Some(error.to_string());
                    result.duration_ms = started.elapsed().as_secs_f64() * 1000.0;
                    Ok(result)
                } else if matches!(
                    error.severity(),
                    ErrorSeverity::Critical | ErrorSeverity::Fatal
                ) {
                    let mut result = IterationResult::empty(iteration);
                    result.error = Some(error.to_string());
                    result.critical = true;
                    Ok(result)
                } else {
                    Err(error)
                }
            }
        }
    }

    async fn iteration_body(&mut self, task_id: &str) -> Result<IterationResult, AgentError> {
        let iteration = self.iteration_count;

        let status = self.state_manager.get_status(task_id).await?;
        if status != TaskStatus::Running {
            debug!(task_id, %status, "task no longer running");
            return Ok(IterationResult::empty(iteration));
        }

        if let Some(compressor) = self.compressor.clone() {
            if compressor.should_compress(&self.messages) {
                let before = self.messages.len();
                self.messages = compressor.compress(std::mem::take(&mut self.messages)).await;
                debug!(before, after = self.messages.len(), "context compressed");
            }
        }

        let response = {
            let _permit = self.concurrency.api_slot().await;
            self.llm.call(&self.messages, &self.tool_definitions).await?
        };
        self.last_response_tokens = response.total_tokens();

        self.messages.push(Message::assistant(
            response.content.clone(),
            response.tool_calls.clone(),
        ));

        if let Some(content) = &response.content {
            self.publish(
                EventType::AgentThinking,
                serde_json::json!({ "thinking": content, "iteration": iteration }),
            )
            .await;
            if let Some(callback) = &self.on_thinking {
                callback(content);
            }
        }

        let tool_calls = response.tool_calls.clone();
        let mut tool_results = Vec::with_capacity(tool_calls.len());
        for call in &tool_calls {
            let result = self.execute_tool(call).await;
            let content = match (&result.output, &result.error) {
                (_, Some(error)) => format!("Error: {error}"),
                (Some(output), None) => output.clone(),
                (None, None) => String::new(),
            };
            self.messages.push(Message::tool(&call.id, &call.name, content));
            tool_results.push(result);

            tokio::time::sleep(self.config.screenshot_delay).await;
        }

        let status_called = tool_calls.iter().any(|c| c.name == "set_task_status");
        let should_continue = !status_called && response.needs_tool_execution();

        Ok(IterationResult {
            iteration,
            tool_calls,
            tool_results,
            thinking: response.content,
            duration_ms: 0.0,
            should_continue,
            error: None,
            critical: false,
        })
    }

    // --- tool dispatch ---

    fn validator(&self) -> ToolCallValidator {
        let registered = self
            .tool_definitions
            .iter()
            .map(|d| (d.name.clone(), d.clone()))
            .collect();
        let mut sensitive = self.config.sensitive_tools.clone();
        sensitive.extend(
            self.tool_definitions
                .iter()
                .filter(|d| d.is_sensitive)
                .map(|d| d.name.clone()),
        );
        ToolCallValidator::new(registered, sensitive)
    }

    async fn execute_tool(&mut self, call: &ToolCall) -> ToolResult {
        let tool_name = call.name.clone();
        let tool_args = call.arguments.clone();

        self.publish(
            EventType::ToolStart,
            serde_json::json!({ "tool_name": tool_name, "args": tool_args }),
        )
        .await;
        if let Some(callback) = &self.on_tool_start {
            callback(&tool_name, &tool_args);
        }

        let started = Instant::now();
        let validator = self.validator();

        let window_bounds = match call.hwnd {
            Some(hwnd) => self.probe.window_bounds(hwnd).await,
            None => None,
        };
        let validation = validator.validate(call, window_bounds.as_ref());
        if !validation.valid {
            let result = validation.to_tool_result();
            self.finish_tool(&tool_name, &result, started).await;
            return result;
        }

        if validator.is_sensitive(&tool_name) {
            let approved = self.request_confirmation(&tool_name, &tool_args).await;
            if !approved {
                let result = ToolResult::failure("User denied the operation");
                self.finish_tool(&tool_name, &result, started).await;
                return result;
            }
        }

        let invoked: Result<ToolResult, AgentError> =
            match self.tools.get(&tool_name).cloned() {
                None => Ok(ToolResult::failure(format!("Tool '{tool_name}' not found"))),
                Some(HostTool::SetTaskStatus) => self.tool_set_task_status(&tool_args).await,
                Some(HostTool::Agent(agent)) => {
                    let task = call.arg_str("task").unwrap_or_default().to_string();
                    match agent.execute(&task).await {
                        Ok(result) => Ok(result),
                        Err(error) => {
                            if let AgentError::WindowLost { hwnd } = &error {
                                self.factory.remove_cached(*hwnd);
                            }
                            Err(error)
                        }
                    }
                }
            };

        match invoked {
            Ok(result) => {
                self.finish_tool(&tool_name, &result, started).await;
                result
            }
            Err(error) => {
                let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
                self.publish(
                    EventType::ToolError,
                    serde_json::json!({
                        "tool_name": tool_name,
                        "error": error.to_string(),
                        "duration_ms": duration_ms,
                    }),
                )
                .await;
                ToolResult::failure(error.to_string()).with_duration_ms(duration_ms)
            }
        }
    }

    async fn finish_tool(&mut self, tool_name: &str, result: &ToolResult, started: Instant) {
        self.publish(
            EventType::ToolEnd,
            serde_json::json!({
                "tool_name": tool_name,
                "result": result.to_value(),
                "duration_ms": started.elapsed().as_secs_f64() * 1000.0,
            }),
        )
        .await;
        if let Some(callback) = &self.on_tool_end {
            callback(tool_name, result);
        }
    }

    /// The built-in `set_task_status` tool.
    ///
    /// `needs_help` transitions immediately (the user must see the ask
    /// even before the loop winds down); `completed` defers its
    /// transition to termination handling so verification can still fail
    /// the task without an illegal completed-to-failed edge.
    async fn tool_set_task_status(
        &mut self,
        args: &serde_json::Value,
    ) -> Result<ToolResult, AgentError> {
        let status = args.get("status").and_then(serde_json::Value::as_str).unwrap_or("");
        let description = args
            .get("description")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("")
            .to_string();

        match status {
            "completed" => Ok(ToolResult::success(format!(
                "Task marked as completed: {description}"
            ))),
            "needs_help" => {
                self.request_help(&description).await?;
                Ok(ToolResult::success(format!("Help requested: {description}")))
            }
            other => Ok(ToolResult::failure(format!("Invalid status: {other}"))),
        }
    }

    // --- confirmation gate ---

    async fn request_confirmation(&mut self, tool_name: &str, tool_args: &serde_json::Value) -> bool {
        let action_id = Uuid::new_v4().to_string();
        let (sender, receiver) = oneshot::channel();
        self.confirmations
            .lock()
            .expect("confirmation map poisoned")
            .insert(action_id.clone(), sender);

        warn!(tool_name, action_id = %action_id, "sensitive operation requires confirmation");
        self.publish(
            EventType::UserConfirmRequired,
            serde_json::json!({
                "action_id": action_id,
                "tool_name": tool_name,
                "tool_args": tool_args,
                "risk_level": "high",
            }),
        )
        .await;

        self.host_state = HostAgentState::WaitingConfirm;
        let approved = receiver.await.unwrap_or(false);
        self.host_state = HostAgentState::Executing;
        self.confirmations
            .lock()
            .expect("confirmation map poisoned")
            .remove(&action_id);
        approved
    }

    // --- error recovery ---

    /// Consult the recovery table. Returns true when the caller should
    /// retry the iteration.
    async fn handle_error(&mut self, error: &AgentError) -> bool {
        let strategy = recovery_strategy(error);
        if strategy.notify_user {
            warn!(%error, "error requires user attention");
        }
        if !strategy.retry {
            return false;
        }
        if self.retry_count >= strategy.max_retries {
            return false;
        }
        self.retry_count += 1;

        if strategy.fallback == Some(Fallback::CompressContext) {
            if let Some(compressor) = self.compressor.clone() {
                self.messages = compressor.compress(std::mem::take(&mut self.messages)).await;
            }
        }

        let wait = strategy.backoff_base.powi(self.retry_count as i32);
        info!(wait_s = wait, attempt = self.retry_count, "retrying after backoff");
        tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        true
    }

    // --- termination ---

    async fn handle_termination(
        &mut self,
        task_id: &str,
        task_text: &str,
        verdict: &TerminationResult,
        final_screenshot: Option<&str>,
    ) -> Result<(), AgentError> {
        match verdict.termination_type {
            Some(TerminationType::Success) => {
                if self.config.verify_success && final_screenshot.is_some() {
                    let client = self.verification_client.clone();
                    let verified = self
                        .verifier
                        .verify(
                            task_text,
                            final_screenshot,
                            &self.tool_history,
                            client.as_deref(),
                        )
                        .await;
                    if !verified {
                        warn!(task_id, "task verification failed");
                        self.fail_task(task_id, "Task verification failed").await;
                        return Ok(());
                    }
                }
                self.complete_task(task_id, &verdict.message).await?;
            }
            Some(TerminationType::Fail) => {
                if verdict.reason == Some(TerminationReason::NeedsHelp) {
                    self.request_help(&verdict.message).await?;
                } else {
                    self.fail_task(task_id, &verdict.message).await;
                }
            }
            Some(TerminationType::Error) => {
                self.emergency_stop(task_id, &verdict.message).await?;
            }
            Some(TerminationType::Cancelled) => {
                if verdict.reason == Some(TerminationReason::UserPaused) {
                    self.save_checkpoint(task_id).await?;
                    self.state_manager
                        .transition(task_id, TaskStatus::Paused, Some(&verdict.message))
                        .await?;
                } else {
                    // Cancellation is reachable from Running only through
                    // Interrupted.
                    self.state_manager
                        .transition(task_id, TaskStatus::Interrupted, Some(&verdict.message))
                        .await?;
                    self.state_manager
                        .transition(task_id, TaskStatus::Cancelled, Some(&verdict.message))
                        .await?;
                }
                self.is_processing = false;
            }
            None => {}
        }
        Ok(())
    }

    async fn complete_task(&mut self, task_id: &str, description: &str) -> Result<(), AgentError> {
        self.state_manager
            .transition(task_id, TaskStatus::Completed, Some(description))
            .await?;
        self.publish(
            EventType::TaskCompleted,
            serde_json::json!({ "description": description }),
        )
        .await;
        self.is_processing = false;
        self.host_state = HostAgentState::Completed;
        info!(task_id, description, "task completed");
        Ok(())
    }

    /// Fail the task. Tolerant of an already-terminal store status so it
    /// is safe on error-unwind paths.
    async fn fail_task(&mut self, task_id: &str, error: &str) {
        if let Err(transition_error) = self
            .state_manager
            .transition(task_id, TaskStatus::Failed, Some(error))
            .await
        {
            warn!(task_id, %transition_error, "could not mark task failed");
        }
        self.publish(EventType::TaskFailed, serde_json::json!({ "error": error }))
            .await;
        self.is_processing = false;
        self.host_state = HostAgentState::Error;
        error!(task_id, error, "task failed");
    }

    async fn request_help(&mut self, description: &str) -> Result<(), AgentError> {
        if let Some(task_id) = self.current_task_id.clone() {
            self.state_manager
                .transition(&task_id, TaskStatus::NeedsHelp, Some(description))
                .await?;
        }
        self.is_processing = false;
        self.host_state = HostAgentState::WaitingConfirm;
        info!(description, "help requested");
        Ok(())
    }

    /// Forced termination with checkpoint preservation: the window is
    /// gone or a critical fault fired, so save what we have and mark the
    /// task interrupted for later resume.
    async fn emergency_stop(&mut self, task_id: &str, reason: &str) -> Result<(), AgentError> {
        self.is_processing = false;

        if let Err(checkpoint_error) = self.save_checkpoint(task_id).await {
            warn!(task_id, %checkpoint_error, "emergency checkpoint failed");
        }
        self.state_manager
            .transition(task_id, TaskStatus::Interrupted, Some(reason))
            .await?;
        self.publish(
            EventType::TaskFailed,
            serde_json::json!({ "type": "emergency_stop", "reason": reason }),
        )
        .await;
        self.host_state = HostAgentState::Error;
        error!(task_id, reason, "emergency stop");
        Ok(())
    }

    // --- probes, checkpoints, events ---

    async fn check_windows_exist(&self) -> bool {
        if self.target_hwnds.is_empty() {
            return true;
        }
        let probes = self
            .target_hwnds
            .iter()
            .map(|hwnd| self.probe.exists(*hwnd));
        join_all(probes).await.into_iter().all(|exists| exists)
    }

    async fn save_checkpoint(&mut self, task_id: &str) -> Result<(), AgentError> {
        let blackboard = match &self.blackboard {
            Some(board) => serde_json::to_value(board.snapshot().await)
                .map_err(|e| AgentError::Checkpoint(e.to_string()))?,
            None => serde_json::Value::Null,
        };
        let mut hwnds: Vec<Hwnd> = self.app_agents.keys().copied().collect();
        hwnds.sort_unstable();

        let state = serde_json::json!({
            "iteration": self.iteration_count,
            "messages": self.messages,
            "blackboard": blackboard,
            "app_agents": hwnds,
        });
        self.state_manager
            .store()
            .save_checkpoint(task_id, self.iteration_count, state)
            .await?;

        self.publish(
            EventType::CheckpointSaved,
            serde_json::json!({ "iteration": self.iteration_count }),
        )
        .await;
        debug!(task_id, iteration = self.iteration_count, "checkpoint saved");
        Ok(())
    }

    async fn task_outcome(&self, task_id: &str) -> Result<TaskOutcome, AgentError> {
        let status = self.state_manager.get_status(task_id).await?;
        let blackboard = match &self.blackboard {
            Some(board) => Some(board.snapshot().await),
            None => None,
        };
        Ok(TaskOutcome {
            task_id: task_id.to_string(),
            status,
            iterations: self.iteration_count,
            duration: self
                .start_time
                .map(|s| s.elapsed())
                .unwrap_or(Duration::ZERO),
            blackboard,
        })
    }

    async fn publish(&self, event_type: EventType, payload: serde_json::Value) {
        if let Some(task_id) = &self.current_task_id {
            self.event_bus
                .publish(AgentEvent::new(event_type, task_id, payload, "host_agent"))
                .await;
        }
    }

    /// Release window locks held past `max_age`. Intended to be called
    /// periodically by the embedder or a watchdog.
    pub fn cleanup_stale_locks(&self, max_age: Duration) -> usize {
        self.concurrency.cleanup_stale_locks(max_age)
    }

    // --- resume ---

    /// Resume a paused or interrupted task from its latest checkpoint.
    ///
    /// Rebuilds the conversation and blackboard, re-registers workers
    /// for every checkpointed window the probe still sees (lost windows
    /// are skipped with a warning), transitions the task back to
    /// `Running`, and re-enters the loop.
    ///
    /// # Errors
    ///
    /// `AgentError::Checkpoint` when no checkpoint exists or it cannot
    /// be decoded, plus everything `process_task` can return.
    pub async fn resume(&mut self, task_id: &str) -> Result<TaskOutcome, AgentError> {
        if self.is_processing {
            return Err(AgentError::Critical(format!(
                "already processing task {:?}",
                self.current_task_id
            )));
        }

        let checkpoint = self
            .state_manager
            .store()
            .load_checkpoint(task_id)
            .await?
            .ok_or_else(|| AgentError::Checkpoint(format!("no checkpoint for task {task_id}")))?;

        let messages: Vec<Message> =
            serde_json::from_value(checkpoint.state["messages"].clone())
                .map_err(|e| AgentError::Checkpoint(format!("bad messages: {e}")))?;
        let hwnds: Vec<Hwnd> = serde_json::from_value(checkpoint.state["app_agents"].clone())
            .map_err(|e| AgentError::Checkpoint(format!("bad app_agents: {e}")))?;
        let board = match checkpoint.state.get("blackboard") {
            Some(value) if !value.is_null() => {
                let snapshot: BlackboardSnapshot = serde_json::from_value(value.clone())
                    .map_err(|e| AgentError::Checkpoint(format!("bad blackboard: {e}")))?;
                Blackboard::from_snapshot(snapshot)
            }
            _ => Blackboard::new(Some(task_id.to_string())),
        };

        let mut live = HashSet::new();
        for hwnd in &hwnds {
            if self.probe.exists(*hwnd).await {
                live.insert(*hwnd);
            } else {
                warn!(hwnd, "checkpointed window no longer exists, skipping");
            }
        }

        if !self.concurrency.acquire_task_slot(task_id, live.clone()) {
            return Err(AgentError::TooManyTasks {
                current: self.concurrency.active_task_count(),
                max: self.config.max_concurrent_tasks,
            });
        }
        if !live.is_empty() && !self.concurrency.acquire_windows(&live, task_id).await {
            self.concurrency.release_task_slot(task_id);
            let hwnd = live.iter().copied().next().unwrap_or(0);
            return Err(AgentError::WindowLocked {
                hwnd,
                owner: self
                    .concurrency
                    .get_window_owner(hwnd)
                    .unwrap_or_else(|| "another task".into()),
            });
        }

        self.begin_task(task_id, live.clone());
        self.iteration_count = checkpoint.iteration;
        self.messages = messages;
        self.blackboard = Some(Arc::new(board));

        for hwnd in live {
            let agent = self.factory.create(hwnd, None, None).await;
            self.register_app_agent(agent);
        }

        // The original task text is the opening user message.
        let task_text = self
            .messages
            .iter()
            .find(|m| m.role == marionette_types::MessageRole::User)
            .and_then(|m| m.content.clone())
            .unwrap_or_default();

        info!(task_id, iteration = checkpoint.iteration, "resuming task");

        let outcome = match self.resume_inner(task_id, &task_text).await {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                error!(task_id, %error, "resumed task failed with error");
                self.fail_task(task_id, &error.to_string()).await;
                Err(error)
            }
        };
        self.cleanup_after_task(task_id);
        outcome
    }

    async fn resume_inner(
        &mut self,
        task_id: &str,
        task_text: &str,
    ) -> Result<TaskOutcome, AgentError> {
        self.state_manager
            .transition(task_id, TaskStatus::Running, Some("resumed"))
            .await?;
        self.publish(
            EventType::TaskStarted,
            serde_json::json!({
                "task_text": task_text,
                "target_hwnds": self.target_hwnds.iter().copied().collect::<Vec<_>>(),
                "resumed": true,
            }),
        )
        .await;
        self.run_loop(task_id, task_text).await
    }
}
