#![deny(missing_docs)]
//! # marionette-types — value types and protocol boundaries
//!
//! The leaf crate of the marionette workspace. Defines the value types
//! exchanged between the supervisor, its per-window workers, and the LLM
//! (`ToolResult`, `ToolCall`, `Message`, `LlmResponse`, `ToolDefinition`),
//! the error taxonomy with recovery metadata, the event vocabulary, and
//! the collaborator traits the runtime consumes but does not implement
//! (`LlmClient`, `TaskStore`, `EventBus`, `WindowProbe`, `InputDriver`,
//! `Screenshotter`).
//!
//! Every trait here is operation-defined, not mechanism-defined:
//! [`LlmClient::call`] means "produce the next assistant turn", not "make
//! an HTTP request". A recorded fixture, a local model, and a hosted API
//! all implement the same trait.

pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use error::{
    AgentError, ErrorCategory, ErrorSeverity, Fallback, RecoveryStrategy, recovery_strategy,
};
pub use event::{AgentEvent, EventType};
pub use traits::{
    Checkpoint, ContextCompressor, EventBus, InputDriver, LlmClient, Screenshotter, TaskStore,
    WindowProbe,
};
pub use types::{
    Hwnd, LlmResponse, Message, MessageRole, MouseButton, ParamType, ScrollDirection, StopReason,
    TaskStatus, ToolCall, ToolCallRecord, ToolDefinition, ToolParameter, ToolResult, WindowBounds,
};
