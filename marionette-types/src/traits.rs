//! Collaborator traits: the seams between the orchestration core and the
//! outside world.
//!
//! The core consumes these and implements none of them. Transport, OS
//! capture, input injection, and persistence all live behind this
//! boundary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AgentError;
use crate::event::AgentEvent;
use crate::types::{
    Hwnd, LlmResponse, Message, MouseButton, ScrollDirection, TaskStatus, ToolDefinition,
    WindowBounds,
};

/// The model transport.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Produce the next assistant turn for `messages` with `tools`
    /// available.
    async fn call(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<LlmResponse, AgentError>;
}

/// A persisted checkpoint, opaque to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Iteration count at save time.
    pub iteration: u32,
    /// The supervisor's serialized state.
    pub state: serde_json::Value,
}

/// Task persistence. Implementations map their own failures to
/// [`AgentError::Store`].
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create a task record in `Pending`.
    async fn create_task(
        &self,
        task_id: &str,
        text: &str,
        target_hwnds: &[Hwnd],
    ) -> Result<(), AgentError>;

    /// Current status of a task.
    async fn get_status(&self, task_id: &str) -> Result<TaskStatus, AgentError>;

    /// Record a status, with an optional human-readable reason.
    async fn set_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        reason: Option<&str>,
    ) -> Result<(), AgentError>;

    /// Persist a checkpoint for later resume.
    async fn save_checkpoint(
        &self,
        task_id: &str,
        iteration: u32,
        state: serde_json::Value,
    ) -> Result<(), AgentError>;

    /// The most recent checkpoint, if any.
    async fn load_checkpoint(&self, task_id: &str) -> Result<Option<Checkpoint>, AgentError>;
}

/// Publish-only event sink. The core never subscribes.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish one event.
    async fn publish(&self, event: AgentEvent);
}

/// Read-only window introspection.
#[async_trait]
pub trait WindowProbe: Send + Sync {
    /// Whether the window still exists.
    async fn exists(&self, hwnd: Hwnd) -> bool;

    /// OS window class name, if the window exists.
    async fn window_class(&self, hwnd: Hwnd) -> Option<String>;

    /// Window title, if the window exists.
    async fn window_title(&self, hwnd: Hwnd) -> Option<String>;

    /// Screen rectangle, if the window exists.
    async fn window_bounds(&self, hwnd: Hwnd) -> Option<WindowBounds>;
}

/// OS input injection and application automation surface.
///
/// Coordinates are window-relative and already DPI-scaled by the caller.
/// Failures are [`AgentError::ToolExecution`].
#[async_trait]
pub trait InputDriver: Send + Sync {
    /// Click at a point.
    async fn click(
        &self,
        hwnd: Hwnd,
        x: i64,
        y: i64,
        button: MouseButton,
        clicks: u32,
    ) -> Result<(), AgentError>;

    /// Type text into the focused element.
    async fn type_text(&self, hwnd: Hwnd, text: &str) -> Result<(), AgentError>;

    /// Press a key combination like `"ctrl+c"`.
    async fn key(&self, hwnd: Hwnd, combo: &str) -> Result<(), AgentError>;

    /// Bring the window to the foreground.
    async fn focus(&self, hwnd: Hwnd) -> Result<(), AgentError>;

    /// Navigate a browser window to a URL.
    async fn navigate(&self, hwnd: Hwnd, url: &str) -> Result<(), AgentError>;

    /// Scroll by `amount` pixels in `direction`.
    async fn scroll(
        &self,
        hwnd: Hwnd,
        direction: ScrollDirection,
        amount: i64,
    ) -> Result<(), AgentError>;

    /// Open a file in an editor window.
    async fn open_file(&self, hwnd: Hwnd, path: &str) -> Result<(), AgentError>;

    /// Jump to a line in an editor window.
    async fn goto_line(&self, hwnd: Hwnd, line: u64) -> Result<(), AgentError>;

    /// Run a command in an integrated terminal.
    async fn run_command(&self, hwnd: Hwnd, command: &str) -> Result<(), AgentError>;
}

/// Screenshot capture.
#[async_trait]
pub trait Screenshotter: Send + Sync {
    /// Capture the window as PNG bytes.
    async fn capture(&self, hwnd: Hwnd) -> Result<Vec<u8>, AgentError>;
}

/// Optional conversation-compression hook.
///
/// When configured, the supervisor calls [`compress`](Self::compress)
/// after a token-limit error (once per the recovery budget) and may also
/// compress proactively between iterations.
#[async_trait]
pub trait ContextCompressor: Send + Sync {
    /// Whether the conversation should be compressed now.
    fn should_compress(&self, messages: &[Message]) -> bool;

    /// Produce a smaller, semantically equivalent conversation.
    async fn compress(&self, messages: Vec<Message>) -> Vec<Message>;
}
