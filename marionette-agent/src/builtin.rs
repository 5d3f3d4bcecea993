//! The built-in worker kinds: browser, desktop, IDE.

use async_trait::async_trait;
use serde::Deserialize;

use marionette_types::{
    AgentError, MouseButton, ParamType, ScrollDirection, ToolDefinition, ToolParameter, ToolResult,
};

use crate::agent::{AgentCore, AppAgent};

fn parse_args<T: serde::de::DeserializeOwned>(
    tool: &str,
    arguments: serde_json::Value,
) -> Result<T, AgentError> {
    serde_json::from_value(arguments.clone()).map_err(|e| AgentError::ToolExecution {
        tool: tool.to_string(),
        args: arguments,
        message: format!("invalid arguments: {e}"),
    })
}

async fn base_window_state(core: &AgentCore) -> Result<serde_json::Value, AgentError> {
    let hwnd = core.hwnd();
    let title = core.probe().window_title(hwnd).await;
    let bounds = core.probe().window_bounds(hwnd).await;
    Ok(serde_json::json!({
        "hwnd": hwnd,
        "app_type": core.app_type().as_str(),
        "title": title,
        "bounds": bounds,
    }))
}

fn unknown_tool(core: &AgentCore, name: &str) -> ToolResult {
    ToolResult::failure(format!(
        "Tool '{name}' not found in {} agent",
        core.app_type()
    ))
}

// --- browser ---

#[derive(Deserialize)]
struct NavigateArgs {
    url: String,
}

#[derive(Deserialize)]
struct ClickArgs {
    x: i64,
    y: i64,
}

#[derive(Deserialize)]
struct TypeTextArgs {
    text: String,
}

fn default_scroll_amount() -> i64 {
    300
}

#[derive(Deserialize)]
struct ScrollArgs {
    direction: ScrollDirection,
    #[serde(default = "default_scroll_amount")]
    amount: i64,
}

/// Worker for browser windows: navigation, clicking, typing, scrolling.
pub struct BrowserAgent {
    core: AgentCore,
}

impl BrowserAgent {
    /// Create a browser worker over the given core.
    #[must_use]
    pub fn new(core: AgentCore) -> Self {
        Self { core }
    }
}

#[async_trait]
impl AppAgent for BrowserAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition::new(
                "navigate",
                "Navigate the browser to a URL",
                vec![ToolParameter::required("url", ParamType::String, "Target URL")],
            )
            .window_bound()
            .category("browser"),
            ToolDefinition::new(
                "click",
                "Click at window-relative coordinates",
                vec![
                    ToolParameter::required("x", ParamType::Integer, "X coordinate"),
                    ToolParameter::required("y", ParamType::Integer, "Y coordinate"),
                ],
            )
            .window_bound()
            .category("browser"),
            ToolDefinition::new(
                "type_text",
                "Type text into the focused element",
                vec![ToolParameter::required("text", ParamType::String, "Text to type")],
            )
            .window_bound()
            .category("browser"),
            ToolDefinition::new(
                "scroll",
                "Scroll the page",
                vec![
                    ToolParameter::required("direction", ParamType::String, "Scroll direction")
                        .with_enum(&["up", "down", "left", "right"]),
                    ToolParameter::optional("amount", ParamType::Integer, "Pixels to scroll")
                        .with_default(serde_json::json!(300)),
                ],
            )
            .window_bound()
            .category("browser"),
        ]
    }

    async fn window_state(&self) -> Result<serde_json::Value, AgentError> {
        base_window_state(&self.core).await
    }

    async fn dispatch_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, AgentError> {
        let hwnd = self.core.hwnd();
        match name {
            "navigate" => {
                let args: NavigateArgs = parse_args(name, arguments)?;
                self.core.input().navigate(hwnd, &args.url).await?;
                Ok(ToolResult::success(format!("Navigated to {}", args.url)))
            }
            "click" => {
                let args: ClickArgs = parse_args(name, arguments)?;
                self.core
                    .input()
                    .click(hwnd, args.x, args.y, MouseButton::Left, 1)
                    .await?;
                Ok(ToolResult::success(format!("Clicked ({}, {})", args.x, args.y)))
            }
            "type_text" => {
                let args: TypeTextArgs = parse_args(name, arguments)?;
                self.core.input().type_text(hwnd, &args.text).await?;
                Ok(ToolResult::success(format!("Typed {} characters", args.text.len())))
            }
            "scroll" => {
                let args: ScrollArgs = parse_args(name, arguments)?;
                self.core
                    .input()
                    .scroll(hwnd, args.direction, args.amount)
                    .await?;
                Ok(ToolResult::success(format!("Scrolled {} px", args.amount)))
            }
            other => Ok(unknown_tool(&self.core, other)),
        }
    }
}

// --- desktop ---

fn default_clicks() -> u32 {
    1
}

#[derive(Deserialize)]
struct MouseClickArgs {
    x: i64,
    y: i64,
    #[serde(default)]
    button: MouseButton,
    #[serde(default = "default_clicks")]
    clicks: u32,
}

#[derive(Deserialize)]
struct KeyboardTypeArgs {
    text: String,
}

#[derive(Deserialize)]
struct HotkeyArgs {
    keys: String,
}

/// Worker for generic desktop windows: raw mouse, keyboard, and focus.
pub struct DesktopAgent {
    core: AgentCore,
}

impl DesktopAgent {
    /// Create a desktop worker over the given core.
    #[must_use]
    pub fn new(core: AgentCore) -> Self {
        Self { core }
    }
}

#[async_trait]
impl AppAgent for DesktopAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition::new(
                "mouse_click",
                "Click the mouse at window-relative coordinates",
                vec![
                    ToolParameter::required("x", ParamType::Integer, "X coordinate"),
                    ToolParameter::required("y", ParamType::Integer, "Y coordinate"),
                    ToolParameter::optional("button", ParamType::String, "Mouse button")
                        .with_enum(&["left", "right", "middle"])
                        .with_default(serde_json::json!("left")),
                    ToolParameter::optional("clicks", ParamType::Integer, "Click count")
                        .with_default(serde_json::json!(1)),
                ],
            )
            .window_bound()
            .category("desktop"),
            ToolDefinition::new(
                "keyboard_type",
                "Type text with the keyboard",
                vec![ToolParameter::required("text", ParamType::String, "Text to type")],
            )
            .window_bound()
            .category("desktop"),
            ToolDefinition::new(
                "hotkey",
                "Press a key combination like \"ctrl+c\"",
                vec![ToolParameter::required("keys", ParamType::String, "Key combination")],
            )
            .window_bound()
            .category("desktop"),
            ToolDefinition::new("window_focus", "Bring the window to the foreground", vec![])
                .window_bound()
                .category("desktop"),
        ]
    }

    async fn window_state(&self) -> Result<serde_json::Value, AgentError> {
        base_window_state(&self.core).await
    }

    async fn dispatch_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, AgentError> {
        let hwnd = self.core.hwnd();
        match name {
            "mouse_click" => {
                let args: MouseClickArgs = parse_args(name, arguments)?;
                self.core
                    .input()
                    .click(hwnd, args.x, args.y, args.button, args.clicks)
                    .await?;
                Ok(ToolResult::success(format!(
                    "Clicked ({}, {}) x{}",
                    args.x, args.y, args.clicks
                )))
            }
            "keyboard_type" => {
                let args: KeyboardTypeArgs = parse_args(name, arguments)?;
                self.core.input().type_text(hwnd, &args.text).await?;
                Ok(ToolResult::success(format!("Typed {} characters", args.text.len())))
            }
            "hotkey" => {
                let args: HotkeyArgs = parse_args(name, arguments)?;
                self.core.input().key(hwnd, &args.keys).await?;
                Ok(ToolResult::success(format!("Pressed {}", args.keys)))
            }
            "window_focus" => {
                self.core.input().focus(hwnd).await?;
                Ok(ToolResult::success("Window focused"))
            }
            other => Ok(unknown_tool(&self.core, other)),
        }
    }
}

// --- ide ---

#[derive(Deserialize)]
struct OpenFileArgs {
    path: String,
}

#[derive(Deserialize)]
struct GotoLineArgs {
    line: u64,
}

#[derive(Deserialize)]
struct RunTerminalCommandArgs {
    command: String,
}

/// Worker for editor/IDE windows: file navigation and the integrated
/// terminal. Terminal commands are confirmation-gated.
pub struct IdeAgent {
    core: AgentCore,
}

impl IdeAgent {
    /// Create an IDE worker over the given core.
    #[must_use]
    pub fn new(core: AgentCore) -> Self {
        Self { core }
    }
}

#[async_trait]
impl AppAgent for IdeAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition::new(
                "open_file",
                "Open a file in the editor",
                vec![ToolParameter::required("path", ParamType::String, "File path")],
            )
            .window_bound()
            .category("ide"),
            ToolDefinition::new(
                "goto_line",
                "Jump to a line in the active editor",
                vec![ToolParameter::required("line", ParamType::Integer, "Line number")],
            )
            .window_bound()
            .category("ide"),
            ToolDefinition::new(
                "run_terminal_command",
                "Run a command in the integrated terminal",
                vec![ToolParameter::required("command", ParamType::String, "Shell command")],
            )
            .window_bound()
            .sensitive()
            .category("ide"),
        ]
    }

    async fn window_state(&self) -> Result<serde_json::Value, AgentError> {
        base_window_state(&self.core).await
    }

    async fn dispatch_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, AgentError> {
        let hwnd = self.core.hwnd();
        match name {
            "open_file" => {
                let args: OpenFileArgs = parse_args(name, arguments)?;
                self.core.input().open_file(hwnd, &args.path).await?;
                Ok(ToolResult::success(format!("Opened {}", args.path)))
            }
            "goto_line" => {
                let args: GotoLineArgs = parse_args(name, arguments)?;
                self.core.input().goto_line(hwnd, args.line).await?;
                Ok(ToolResult::success(format!("Jumped to line {}", args.line)))
            }
            "run_terminal_command" => {
                let args: RunTerminalCommandArgs = parse_args(name, arguments)?;
                self.core.input().run_command(hwnd, &args.command).await?;
                Ok(ToolResult::success(format!("Ran `{}`", args.command)))
            }
            other => Ok(unknown_tool(&self.core, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AppAgentConfig, AppAgentState, AppType};
    use marionette_types::{Hwnd, InputDriver, Screenshotter, WindowBounds, WindowProbe};
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeOs {
        exists: StdMutex<bool>,
        actions: StdMutex<Vec<String>>,
        capture_fails: bool,
    }

    impl FakeOs {
        fn live() -> Arc<Self> {
            Arc::new(Self {
                exists: StdMutex::new(true),
                ..Self::default()
            })
        }

        fn actions(&self) -> Vec<String> {
            self.actions.lock().unwrap().clone()
        }

        fn record(&self, action: String) {
            self.actions.lock().unwrap().push(action);
        }
    }

    #[async_trait]
    impl WindowProbe for FakeOs {
        async fn exists(&self, _hwnd: Hwnd) -> bool {
            *self.exists.lock().unwrap()
        }
        async fn window_class(&self, _hwnd: Hwnd) -> Option<String> {
            Some("Chrome_WidgetWin_1".into())
        }
        async fn window_title(&self, _hwnd: Hwnd) -> Option<String> {
            Some("Example - Chrome".into())
        }
        async fn window_bounds(&self, _hwnd: Hwnd) -> Option<WindowBounds> {
            Some(WindowBounds { x: 0, y: 0, width: 800, height: 600 })
        }
    }

    #[async_trait]
    impl InputDriver for FakeOs {
        async fn click(
            &self,
            _hwnd: Hwnd,
            x: i64,
            y: i64,
            button: MouseButton,
            clicks: u32,
        ) -> Result<(), AgentError> {
            self.record(format!("click {x},{y} {button:?} x{clicks}"));
            Ok(())
        }
        async fn type_text(&self, _hwnd: Hwnd, text: &str) -> Result<(), AgentError> {
            self.record(format!("type {text}"));
            Ok(())
        }
        async fn key(&self, _hwnd: Hwnd, combo: &str) -> Result<(), AgentError> {
            self.record(format!("key {combo}"));
            Ok(())
        }
        async fn focus(&self, _hwnd: Hwnd) -> Result<(), AgentError> {
            self.record("focus".into());
            Ok(())
        }
        async fn navigate(&self, _hwnd: Hwnd, url: &str) -> Result<(), AgentError> {
            self.record(format!("navigate {url}"));
            Ok(())
        }
        async fn scroll(
            &self,
            _hwnd: Hwnd,
            direction: ScrollDirection,
            amount: i64,
        ) -> Result<(), AgentError> {
            self.record(format!("scroll {direction:?} {amount}"));
            Ok(())
        }
        async fn open_file(&self, _hwnd: Hwnd, path: &str) -> Result<(), AgentError> {
            self.record(format!("open {path}"));
            Ok(())
        }
        async fn goto_line(&self, _hwnd: Hwnd, line: u64) -> Result<(), AgentError> {
            self.record(format!("goto {line}"));
            Ok(())
        }
        async fn run_command(&self, _hwnd: Hwnd, command: &str) -> Result<(), AgentError> {
            self.record(format!("run {command}"));
            Ok(())
        }
    }

    #[async_trait]
    impl Screenshotter for FakeOs {
        async fn capture(&self, _hwnd: Hwnd) -> Result<Vec<u8>, AgentError> {
            if self.capture_fails {
                Err(AgentError::ToolExecution {
                    tool: "capture".into(),
                    args: serde_json::Value::Null,
                    message: "no surface".into(),
                })
            } else {
                Ok(vec![0x89, 0x50, 0x4e, 0x47])
            }
        }
    }

    fn browser_with(os: Arc<FakeOs>, config: AppAgentConfig) -> BrowserAgent {
        BrowserAgent::new(AgentCore::new(
            101,
            AppType::Browser,
            config,
            os.clone(),
            os.clone(),
            os,
        ))
    }

    fn quick_config() -> AppAgentConfig {
        AppAgentConfig {
            screenshot_delay: std::time::Duration::from_millis(1),
            ..AppAgentConfig::default()
        }
    }

    #[tokio::test]
    async fn execute_succeeds_and_attaches_screenshot() {
        let os = FakeOs::live();
        let agent = browser_with(os, quick_config());

        let result = agent.execute("focus the page").await.unwrap();
        assert!(!result.is_error());
        assert_eq!(result.hwnd, Some(101));
        assert!(result.base64_image.is_some());
        assert!(result.duration_ms.is_some());
        assert_eq!(agent.core().state(), AppAgentState::Idle);
    }

    #[tokio::test]
    async fn execute_raises_window_lost_and_deactivates() {
        let os = FakeOs::live();
        *os.exists.lock().unwrap() = false;
        let agent = browser_with(os, quick_config());

        let error = agent.execute("anything").await.unwrap_err();
        assert!(matches!(error, AgentError::WindowLost { hwnd: 101 }));
        assert!(!agent.is_active());
        assert_eq!(agent.core().state(), AppAgentState::Error);

        // Further work is refused with a failure result, not an error.
        let result = agent.execute("again").await.unwrap();
        assert!(result.is_error());
    }

    #[tokio::test]
    async fn capture_failure_is_not_fatal() {
        let os = Arc::new(FakeOs {
            exists: StdMutex::new(true),
            actions: StdMutex::new(Vec::new()),
            capture_fails: true,
        });
        let agent = browser_with(os, quick_config());

        let result = agent.execute("task").await.unwrap();
        assert!(!result.is_error());
        assert!(result.base64_image.is_none());
    }

    #[tokio::test]
    async fn browser_tools_drive_the_input_surface() {
        let os = FakeOs::live();
        let agent = browser_with(os.clone(), quick_config());

        agent
            .call_tool("navigate", serde_json::json!({"url": "https://example.com"}))
            .await
            .unwrap();
        agent
            .call_tool("click", serde_json::json!({"x": 10, "y": 20}))
            .await
            .unwrap();
        agent
            .call_tool("scroll", serde_json::json!({"direction": "down"}))
            .await
            .unwrap();

        let actions = os.actions();
        assert_eq!(actions[0], "navigate https://example.com");
        assert_eq!(actions[1], "click 10,20 Left x1");
        assert_eq!(actions[2], "scroll Down 300");
    }

    #[tokio::test]
    async fn coordinate_scale_applies_before_dispatch() {
        let os = FakeOs::live();
        let agent = browser_with(
            os.clone(),
            AppAgentConfig {
                coordinate_scale: 2.0,
                ..quick_config()
            },
        );

        agent
            .call_tool("click", serde_json::json!({"x": 10, "y": 20}))
            .await
            .unwrap();
        assert_eq!(os.actions()[0], "click 20,40 Left x1");
    }

    #[tokio::test]
    async fn unknown_tool_returns_failure_result() {
        let os = FakeOs::live();
        let agent = browser_with(os, quick_config());
        let result = agent.call_tool("teleport", serde_json::json!({})).await.unwrap();
        assert!(result.is_error());
        assert!(result.error.unwrap().contains("not found in browser agent"));
    }

    #[tokio::test]
    async fn bad_arguments_become_tool_execution_error() {
        let os = FakeOs::live();
        let agent = browser_with(os, quick_config());
        let error = agent
            .call_tool("click", serde_json::json!({"x": "ten", "y": 20}))
            .await
            .unwrap_err();
        assert!(matches!(error, AgentError::ToolExecution { .. }));
    }

    #[tokio::test]
    async fn desktop_and_ide_tool_sets() {
        let os = FakeOs::live();
        let desktop = DesktopAgent::new(AgentCore::new(
            202,
            AppType::Desktop,
            quick_config(),
            os.clone(),
            os.clone(),
            os.clone(),
        ));
        desktop
            .call_tool(
                "mouse_click",
                serde_json::json!({"x": 5, "y": 6, "button": "right", "clicks": 2}),
            )
            .await
            .unwrap();
        desktop
            .call_tool("hotkey", serde_json::json!({"keys": "ctrl+c"}))
            .await
            .unwrap();
        desktop.call_tool("window_focus", serde_json::json!({})).await.unwrap();

        let ide = IdeAgent::new(AgentCore::new(
            303,
            AppType::Ide,
            quick_config(),
            os.clone(),
            os.clone(),
            os.clone(),
        ));
        ide.call_tool("open_file", serde_json::json!({"path": "src/main.rs"}))
            .await
            .unwrap();
        ide.call_tool("goto_line", serde_json::json!({"line": 42}))
            .await
            .unwrap();

        let actions = os.actions();
        assert_eq!(
            actions,
            vec![
                "click 5,6 Right x2",
                "key ctrl+c",
                "focus",
                "open src/main.rs",
                "goto 42",
            ]
        );

        let sensitive: Vec<_> = ide
            .tool_definitions()
            .into_iter()
            .filter(|d| d.is_sensitive)
            .map(|d| d.name)
            .collect();
        assert_eq!(sensitive, vec!["run_terminal_command"]);
    }
}
