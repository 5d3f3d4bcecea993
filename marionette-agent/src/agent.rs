//! The worker contract and its shared core.

use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use marionette_types::{
    AgentError, Hwnd, InputDriver, Screenshotter, ToolDefinition, ToolResult, WindowProbe,
};

/// Kind of application behind a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppType {
    /// A web browser.
    Browser,
    /// A generic desktop application.
    Desktop,
    /// A code editor or IDE.
    Ide,
    /// An office suite window.
    Office,
    /// A terminal emulator.
    Terminal,
    /// A custom-registered kind.
    Custom,
}

impl AppType {
    /// Lowercase wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AppType::Browser => "browser",
            AppType::Desktop => "desktop",
            AppType::Ide => "ide",
            AppType::Office => "office",
            AppType::Terminal => "terminal",
            AppType::Custom => "custom",
        }
    }
}

impl std::fmt::Display for AppType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppAgentState {
    /// Ready for work.
    Idle,
    /// Running a task or tool.
    Executing,
    /// Blocked on an external response.
    Waiting,
    /// The last execution failed.
    Error,
}

/// Worker tunables.
#[derive(Debug, Clone)]
pub struct AppAgentConfig {
    /// Hard deadline per tool call.
    pub tool_timeout: Duration,
    /// Settle time before the post-action capture.
    pub screenshot_delay: Duration,
    /// Whether to recapture the window after each task.
    pub verify_after_action: bool,
    /// Multiplier applied to coordinate arguments (DPI scaling).
    pub coordinate_scale: f64,
}

impl Default for AppAgentConfig {
    fn default() -> Self {
        Self {
            tool_timeout: Duration::from_secs(30),
            screenshot_delay: Duration::from_millis(750),
            verify_after_action: true,
            coordinate_scale: 1.0,
        }
    }
}

/// State shared by every worker implementation: identity, config,
/// execution state, and the OS-facing handles.
pub struct AgentCore {
    hwnd: Hwnd,
    app_type: AppType,
    config: AppAgentConfig,
    state: StdMutex<AppAgentState>,
    active: AtomicBool,
    probe: Arc<dyn WindowProbe>,
    input: Arc<dyn InputDriver>,
    screenshotter: Arc<dyn Screenshotter>,
}

impl AgentCore {
    /// Create a core bound to one window.
    #[must_use]
    pub fn new(
        hwnd: Hwnd,
        app_type: AppType,
        config: AppAgentConfig,
        probe: Arc<dyn WindowProbe>,
        input: Arc<dyn InputDriver>,
        screenshotter: Arc<dyn Screenshotter>,
    ) -> Self {
        debug!(hwnd, app_type = %app_type, "app agent created");
        Self {
            hwnd,
            app_type,
            config,
            state: StdMutex::new(AppAgentState::Idle),
            active: AtomicBool::new(true),
            probe,
            input,
            screenshotter,
        }
    }

    /// The owned window.
    #[must_use]
    pub fn hwnd(&self) -> Hwnd {
        self.hwnd
    }

    /// The application kind.
    #[must_use]
    pub fn app_type(&self) -> AppType {
        self.app_type
    }

    /// Worker tunables.
    #[must_use]
    pub fn config(&self) -> &AppAgentConfig {
        &self.config
    }

    /// Current execution state.
    #[must_use]
    pub fn state(&self) -> AppAgentState {
        *self.state.lock().expect("agent state poisoned")
    }

    /// Set the execution state.
    pub fn set_state(&self, state: AppAgentState) {
        *self.state.lock().expect("agent state poisoned") = state;
    }

    /// Whether the worker may accept work.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Mark the worker usable or dead.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// Window introspection handle.
    #[must_use]
    pub fn probe(&self) -> &Arc<dyn WindowProbe> {
        &self.probe
    }

    /// Input injection handle.
    #[must_use]
    pub fn input(&self) -> &Arc<dyn InputDriver> {
        &self.input
    }

    /// Screenshot handle.
    #[must_use]
    pub fn screenshotter(&self) -> &Arc<dyn Screenshotter> {
        &self.screenshotter
    }
}

/// Coordinate argument names subject to DPI scaling.
const COORDINATE_PARAMS: [&str; 6] = ["x", "y", "start_x", "start_y", "end_x", "end_y"];

/// Multiply coordinate arguments by `scale` in place.
fn scale_coordinates(arguments: &mut serde_json::Value, scale: f64) {
    let Some(map) = arguments.as_object_mut() else {
        return;
    };
    for key in COORDINATE_PARAMS {
        if let Some(value) = map.get_mut(key) {
            if let Some(number) = value.as_f64() {
                *value = serde_json::json!((number * scale).round() as i64);
            }
        }
    }
}

/// A worker bound to one window.
///
/// Implementations supply the tool table ([`Self::tool_definitions`],
/// [`Self::dispatch_tool`]) and the window-state hook; the provided
/// [`execute`](Self::execute) and
/// [`call_tool`](Self::call_tool) methods carry the shared contract:
/// liveness checks, deadlines, coordinate scaling, and error conversion.
#[async_trait]
pub trait AppAgent: Send + Sync {
    /// The shared core.
    fn core(&self) -> &AgentCore;

    /// The worker's tool table.
    fn tool_definitions(&self) -> Vec<ToolDefinition>;

    /// Current window state as seen by this worker.
    async fn window_state(&self) -> Result<serde_json::Value, AgentError>;

    /// Run one primitive tool. Unknown names return a failing result.
    async fn dispatch_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, AgentError>;

    /// Interpret a free-form task against the current window state.
    ///
    /// The default is a descriptive stub; richer workers expand this
    /// into local micro-planning over their own tools.
    async fn execute_task(
        &self,
        task: &str,
        _window_state: &serde_json::Value,
    ) -> Result<String, AgentError> {
        Ok(format!(
            "Task '{}' executed on {} window",
            task,
            self.core().app_type()
        ))
    }

    /// The owned window.
    fn hwnd(&self) -> Hwnd {
        self.core().hwnd()
    }

    /// The application kind.
    fn app_type(&self) -> AppType {
        self.core().app_type()
    }

    /// Whether the worker may accept work.
    fn is_active(&self) -> bool {
        self.core().is_active()
    }

    /// Claude-style schemas for every tool.
    fn tool_schemas(&self) -> Vec<serde_json::Value> {
        self.tool_definitions()
            .iter()
            .map(ToolDefinition::to_input_schema)
            .collect()
    }

    /// Execute a task. This is the single entry point the supervisor
    /// invokes as a tool.
    ///
    /// # Errors
    ///
    /// `AgentError::WindowLost` when the window disappeared; the worker
    /// marks itself inactive first. Every other failure is returned as a
    /// failing [`ToolResult`], never an `Err`.
    async fn execute(&self, task: &str) -> Result<ToolResult, AgentError> {
        let core = self.core();
        if !core.is_active() {
            return Ok(ToolResult::failure(format!(
                "AppAgent for hwnd={} is not active",
                core.hwnd()
            )));
        }

        core.set_state(AppAgentState::Executing);
        let started = Instant::now();

        if !core.probe().exists(core.hwnd()).await {
            core.set_active(false);
            core.set_state(AppAgentState::Error);
            return Err(AgentError::WindowLost { hwnd: core.hwnd() });
        }

        let outcome = async {
            let window_state = self.window_state().await?;
            self.execute_task(task, &window_state).await
        }
        .await;

        match outcome {
            Ok(output) => {
                let mut result = ToolResult::success(output)
                    .with_hwnd(core.hwnd())
                    .with_duration_ms(started.elapsed().as_secs_f64() * 1000.0);

                if core.config().verify_after_action {
                    tokio::time::sleep(core.config().screenshot_delay).await;
                    match core.screenshotter().capture(core.hwnd()).await {
                        Ok(png) => result = result.with_image(BASE64.encode(png)),
                        Err(error) => {
                            warn!(hwnd = core.hwnd(), %error, "post-action capture failed");
                        }
                    }
                }

                core.set_state(AppAgentState::Idle);
                Ok(result)
            }
            Err(error) => {
                core.set_state(AppAgentState::Error);
                Ok(ToolResult::failure(error.to_string())
                    .with_hwnd(core.hwnd())
                    .with_duration_ms(started.elapsed().as_secs_f64() * 1000.0))
            }
        }
    }

    /// Invoke one primitive directly, under the tool deadline and with
    /// coordinate scaling applied.
    ///
    /// # Errors
    ///
    /// `AgentError::ToolTimeout` past the deadline;
    /// `AgentError::ToolExecution` for any other dispatch failure.
    async fn call_tool(
        &self,
        name: &str,
        mut arguments: serde_json::Value,
    ) -> Result<ToolResult, AgentError> {
        let core = self.core();
        let scale = core.config().coordinate_scale;
        if (scale - 1.0).abs() > f64::EPSILON {
            scale_coordinates(&mut arguments, scale);
        }

        let started = Instant::now();
        let dispatched =
            tokio::time::timeout(core.config().tool_timeout, self.dispatch_tool(name, arguments.clone()))
                .await;

        match dispatched {
            Err(_) => Err(AgentError::ToolTimeout {
                tool: name.to_string(),
                timeout_ms: core.config().tool_timeout.as_millis() as u64,
            }),
            Ok(Err(error)) => match error {
                already @ AgentError::ToolExecution { .. } => Err(already),
                other => Err(AgentError::ToolExecution {
                    tool: name.to_string(),
                    args: arguments,
                    message: other.to_string(),
                }),
            },
            Ok(Ok(result)) => {
                let mut result = result;
                if result.hwnd.is_none() {
                    result.hwnd = Some(core.hwnd());
                }
                if result.duration_ms.is_none() {
                    result.duration_ms = Some(started.elapsed().as_secs_f64() * 1000.0);
                }
                Ok(result)
            }
        }
    }
}
