//! Event vocabulary published on the event bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonical event names the runtime emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// A task was admitted and the loop started.
    TaskStarted,
    /// The task reached `Completed`.
    TaskCompleted,
    /// The task reached `Failed` or emergency-stopped.
    TaskFailed,
    /// The model produced free text this iteration.
    AgentThinking,
    /// A tool call is about to run.
    ToolStart,
    /// A tool call returned.
    ToolEnd,
    /// A tool call raised.
    ToolError,
    /// A sensitive tool awaits a user decision.
    UserConfirmRequired,
    /// A checkpoint was persisted.
    CheckpointSaved,
}

impl EventType {
    /// The canonical wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::TaskStarted => "TASK_STARTED",
            EventType::TaskCompleted => "TASK_COMPLETED",
            EventType::TaskFailed => "TASK_FAILED",
            EventType::AgentThinking => "AGENT_THINKING",
            EventType::ToolStart => "TOOL_START",
            EventType::ToolEnd => "TOOL_END",
            EventType::ToolError => "TOOL_ERROR",
            EventType::UserConfirmRequired => "USER_CONFIRM_REQUIRED",
            EventType::CheckpointSaved => "CHECKPOINT_SAVED",
        }
    }
}

/// One published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    /// Event kind.
    pub event_type: EventType,
    /// The task this event belongs to.
    pub task_id: String,
    /// Event-specific payload.
    pub payload: serde_json::Value,
    /// Emitting component (e.g. "host_agent").
    pub source: String,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
}

impl AgentEvent {
    /// Create an event stamped with the current time.
    #[must_use]
    pub fn new(
        event_type: EventType,
        task_id: impl Into<String>,
        payload: serde_json::Value,
        source: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            task_id: task_id.into(),
            payload,
            source: source.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_wire_names() {
        assert_eq!(EventType::TaskStarted.as_str(), "TASK_STARTED");
        assert_eq!(EventType::UserConfirmRequired.as_str(), "USER_CONFIRM_REQUIRED");
        let json = serde_json::to_string(&EventType::CheckpointSaved).unwrap();
        assert_eq!(json, "\"CHECKPOINT_SAVED\"");
    }
}
