//! Core message, tool, and task value types.

use serde::{Deserialize, Serialize};

/// An opaque OS window handle.
///
/// Windows-style `HWND` semantics; any OS identifier that fits in 64 bits
/// works. The runtime never interprets the value.
pub type Hwnd = u64;

/// The role of a message participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// A human user.
    User,
    /// The model.
    Assistant,
    /// A system instruction.
    System,
    /// A tool result echoed back to the model.
    Tool,
}

/// The result of executing one tool call.
///
/// Exactly one of `output` / `error` is set; the constructors enforce it.
/// May carry the screenshot taken after the action, the window the tool
/// acted on, and the wall-clock duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Success output. `None` iff the call failed.
    pub output: Option<String>,
    /// Failure description. `None` iff the call succeeded.
    pub error: Option<String>,
    /// Base64-encoded PNG captured after the action, if any.
    pub base64_image: Option<String>,
    /// The window this result is bound to.
    pub hwnd: Option<Hwnd>,
    /// Wall-clock duration of the call in milliseconds.
    pub duration_ms: Option<f64>,
}

impl ToolResult {
    /// Create a successful result.
    #[must_use]
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: Some(output.into()),
            error: None,
            base64_image: None,
            hwnd: None,
            duration_ms: None,
        }
    }

    /// Create a failed result.
    #[must_use]
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            output: None,
            error: Some(error.into()),
            base64_image: None,
            hwnd: None,
            duration_ms: None,
        }
    }

    /// Bind this result to a window.
    #[must_use]
    pub fn with_hwnd(mut self, hwnd: Hwnd) -> Self {
        self.hwnd = Some(hwnd);
        self
    }

    /// Record the call duration.
    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: f64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Attach a post-action screenshot.
    #[must_use]
    pub fn with_image(mut self, base64_png: impl Into<String>) -> Self {
        self.base64_image = Some(base64_png.into());
        self
    }

    /// Whether this result represents a failure.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Serialize for event payloads and checkpoints.
    #[must_use]
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// A tool invocation request emitted by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Opaque model-assigned id. Must be echoed on the result message.
    pub id: String,
    /// Name of the tool to invoke.
    pub name: String,
    /// JSON object of arguments.
    pub arguments: serde_json::Value,
    /// The window the call targets, when the tool is window-bound.
    pub hwnd: Option<Hwnd>,
}

impl ToolCall {
    /// Create a call with a JSON-object argument map.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            hwnd: None,
        }
    }

    /// Look up a single argument by name.
    #[must_use]
    pub fn arg(&self, name: &str) -> Option<&serde_json::Value> {
        self.arguments.get(name)
    }

    /// A string argument, if present and a string.
    #[must_use]
    pub fn arg_str(&self, name: &str) -> Option<&str> {
        self.arg(name).and_then(serde_json::Value::as_str)
    }
}

/// A message in the supervisor's conversation with the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// The author role.
    pub role: MessageRole,
    /// Text content, if any.
    pub content: Option<String>,
    /// For tool messages: the id of the call being answered.
    pub tool_call_id: Option<String>,
    /// For tool messages: the tool name.
    pub name: Option<String>,
    /// For assistant messages: the tool calls issued this turn.
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// Base64-encoded PNG attachments (screenshots).
    #[serde(default)]
    pub images: Vec<String>,
}

impl Message {
    /// A user message.
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: Some(text.into()),
            tool_call_id: None,
            name: None,
            tool_calls: Vec::new(),
            images: Vec::new(),
        }
    }

    /// An assistant message with optional text and tool calls.
    #[must_use]
    pub fn assistant(text: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: text,
            tool_call_id: None,
            name: None,
            tool_calls,
            images: Vec::new(),
        }
    }

    /// A system message.
    #[must_use]
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: Some(text.into()),
            tool_call_id: None,
            name: None,
            tool_calls: Vec::new(),
            images: Vec::new(),
        }
    }

    /// A tool-result message answering `tool_call_id`.
    #[must_use]
    pub fn tool(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: MessageRole::Tool,
            content: Some(content.into()),
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
            tool_calls: Vec::new(),
            images: Vec::new(),
        }
    }

    /// Attach a base64 PNG to this message.
    #[must_use]
    pub fn with_image(mut self, base64_png: impl Into<String>) -> Self {
        self.images.push(base64_png.into());
        self
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Natural end of turn.
    EndTurn,
    /// The model wants tool results before continuing.
    ToolUse,
    /// Output token budget exhausted.
    MaxTokens,
    /// A stop sequence matched.
    StopSequence,
}

/// One assistant turn as seen by the run loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    /// Free text (surfaced as "thinking").
    pub content: Option<String>,
    /// Why generation stopped.
    pub stop_reason: StopReason,
    /// Tool calls issued this turn, in model order.
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// Tokens in the request.
    pub input_tokens: usize,
    /// Tokens generated.
    pub output_tokens: usize,
}

impl LlmResponse {
    /// Whether the loop must execute tools before calling the model again.
    #[must_use]
    pub fn needs_tool_execution(&self) -> bool {
        self.stop_reason == StopReason::ToolUse && !self.tool_calls.is_empty()
    }

    /// Total tokens attributed to this turn.
    #[must_use]
    pub fn total_tokens(&self) -> usize {
        self.input_tokens + self.output_tokens
    }
}

/// JSON Schema primitive type of a tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    /// A UTF-8 string.
    String,
    /// A whole number.
    Integer,
    /// Any number.
    Number,
    /// True or false.
    Boolean,
    /// A JSON array.
    Array,
    /// A JSON object.
    Object,
}

impl ParamType {
    /// The JSON Schema name of this type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }
}

/// One declared parameter of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParameter {
    /// Parameter name.
    pub name: String,
    /// Declared type.
    pub param_type: ParamType,
    /// Human-readable description for the model.
    pub description: String,
    /// Whether the model must supply it.
    pub required: bool,
    /// Closed set of allowed string values, if any.
    pub enum_values: Option<Vec<String>>,
    /// Default applied when the model omits the parameter.
    pub default: Option<serde_json::Value>,
}

impl ToolParameter {
    /// A required parameter.
    #[must_use]
    pub fn required(
        name: impl Into<String>,
        param_type: ParamType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: description.into(),
            required: true,
            enum_values: None,
            default: None,
        }
    }

    /// An optional parameter.
    #[must_use]
    pub fn optional(
        name: impl Into<String>,
        param_type: ParamType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: description.into(),
            required: false,
            enum_values: None,
            default: None,
        }
    }

    /// Restrict the parameter to a closed value set.
    #[must_use]
    pub fn with_enum(mut self, values: &[&str]) -> Self {
        self.enum_values = Some(values.iter().map(|v| (*v).to_string()).collect());
        self
    }

    /// Supply a default for an optional parameter.
    #[must_use]
    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// The definition of one tool exposed to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name.
    pub name: String,
    /// What the tool does, for the model.
    pub description: String,
    /// Declared parameters.
    pub parameters: Vec<ToolParameter>,
    /// Whether the tool targets a specific window.
    pub supports_hwnd: bool,
    /// Whether invocation requires user confirmation.
    pub is_sensitive: bool,
    /// Grouping label (e.g. "browser", "desktop", "control").
    pub category: String,
}

impl ToolDefinition {
    /// Create a definition with no special flags.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Vec<ToolParameter>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            supports_hwnd: false,
            is_sensitive: false,
            category: String::new(),
        }
    }

    /// Mark the tool window-bound.
    #[must_use]
    pub fn window_bound(mut self) -> Self {
        self.supports_hwnd = true;
        self
    }

    /// Mark the tool sensitive (confirmation-gated).
    #[must_use]
    pub fn sensitive(mut self) -> Self {
        self.is_sensitive = true;
        self
    }

    /// Set the grouping label.
    #[must_use]
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Emit the Claude-style `{name, description, input_schema}` object.
    #[must_use]
    pub fn to_input_schema(&self) -> serde_json::Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            let mut prop = serde_json::Map::new();
            prop.insert("type".into(), param.param_type.as_str().into());
            prop.insert("description".into(), param.description.clone().into());
            if let Some(values) = &param.enum_values {
                prop.insert("enum".into(), serde_json::json!(values));
            }
            if let Some(default) = &param.default {
                prop.insert("default".into(), default.clone());
            }
            properties.insert(param.name.clone(), serde_json::Value::Object(prop));
            if param.required {
                required.push(param.name.clone());
            }
        }
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "input_schema": {
                "type": "object",
                "properties": properties,
                "required": required,
            }
        })
    }
}

/// A coarse record of one executed tool call, kept by the supervisor for
/// the post-hoc success verifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Tool name.
    pub name: String,
    /// Arguments as issued.
    pub arguments: serde_json::Value,
    /// Whether the iteration containing this call produced any error.
    pub error: bool,
}

/// External task state, owned by the task store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet admitted.
    Pending,
    /// The loop is iterating.
    Running,
    /// Suspended at an iteration boundary; resumable.
    Paused,
    /// Terminal: finished successfully.
    Completed,
    /// Terminal: the agent asked for user help.
    NeedsHelp,
    /// Terminal: the agent failed by its own reasoning.
    Failed,
    /// Emergency-stopped on a system fault; checkpointed.
    Interrupted,
    /// Terminal: cancelled by the user.
    Cancelled,
}

impl TaskStatus {
    /// Lowercase wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::NeedsHelp => "needs_help",
            TaskStatus::Failed => "failed",
            TaskStatus::Interrupted => "interrupted",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Whether the status is final.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::NeedsHelp | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether `from -> to` is a legal task transition.
    #[must_use]
    pub fn legal_transition(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (from, to),
            (Pending, Running)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, NeedsHelp)
                | (Running, Interrupted)
                | (Paused, Running)
                | (Interrupted, Running)
                | (Interrupted, Cancelled)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mouse button selector for pointer tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    /// Primary button.
    Left,
    /// Secondary button.
    Right,
    /// Wheel button.
    Middle,
}

impl Default for MouseButton {
    fn default() -> Self {
        MouseButton::Left
    }
}

/// Scroll direction for wheel tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    /// Toward the top of the content.
    Up,
    /// Toward the bottom.
    Down,
    /// Toward the left edge.
    Left,
    /// Toward the right edge.
    Right,
}

/// The screen rectangle of a window, used to bound coordinate arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowBounds {
    /// Left edge.
    pub x: i64,
    /// Top edge.
    pub y: i64,
    /// Width in pixels.
    pub width: i64,
    /// Height in pixels.
    pub height: i64,
}
