#![deny(missing_docs)]
//! Per-task shared state: the blackboard.
//!
//! One [`Blackboard`] lives for the duration of one task. It carries the
//! supervisor's subtask decomposition (with dependency-aware scheduling),
//! shared results, inter-agent messages, free-form context, and an
//! append-only trajectory for audit. Every mutating operation serializes
//! through an internal async mutex, so any two calls on the same board
//! observe a total order.
//!
//! The whole board round-trips through [`BlackboardSnapshot`] for
//! checkpointing.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use marionette_types::Hwnd;

/// Status of a subtask or of the overall request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Not yet started.
    Pending,
    /// Assigned and running.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Blocked on the user.
    NeedsHelp,
}

impl RequestStatus {
    /// Whether this status is final for a subtask.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }
}

/// A unit of work the supervisor carved out of the task.
///
/// Dependencies are ids, not references; a subtask is eligible to
/// dispatch iff it is `Pending` and every dependency is `Completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTask {
    /// Unique id within the board.
    pub id: String,
    /// What to do.
    pub description: String,
    /// The window the work targets, if known up front.
    pub target_hwnd: Option<Hwnd>,
    /// Application kind hint for the factory.
    pub app_type: Option<String>,
    /// Current status.
    pub status: RequestStatus,
    /// Result text once completed.
    pub result: Option<String>,
    /// Error text once failed.
    pub error: Option<String>,
    /// Name of the worker the subtask was handed to.
    pub assigned_agent: Option<String>,
    /// Ids of subtasks that must complete first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Completion time for terminal states.
    pub completed_at: Option<DateTime<Utc>>,
}

impl SubTask {
    /// Create a pending subtask.
    #[must_use]
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            target_hwnd: None,
            app_type: None,
            status: RequestStatus::Pending,
            result: None,
            error: None,
            assigned_agent: None,
            dependencies: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Target a specific window.
    #[must_use]
    pub fn with_target(mut self, hwnd: Hwnd) -> Self {
        self.target_hwnd = Some(hwnd);
        self
    }

    /// Hint the application kind.
    #[must_use]
    pub fn with_app_type(mut self, app_type: impl Into<String>) -> Self {
        self.app_type = Some(app_type.into());
        self
    }

    /// Require other subtasks to complete first.
    #[must_use]
    pub fn with_dependencies(mut self, ids: &[&str]) -> Self {
        self.dependencies = ids.iter().map(|s| (*s).to_string()).collect();
        self
    }

    fn mark_completed(&mut self, result: String) {
        self.status = RequestStatus::Completed;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
    }

    fn mark_failed(&mut self, error: String) {
        self.status = RequestStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(Utc::now());
    }
}

/// Kind of an inter-agent message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Plain information.
    Info,
    /// A request for action.
    Request,
    /// An answer to a request.
    Response,
    /// An error report.
    Error,
}

/// A message between agents sharing this board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    /// Sender name.
    pub from: String,
    /// Recipient name.
    pub to: String,
    /// Message body.
    pub content: String,
    /// Message kind.
    pub message_type: MessageKind,
    /// Send time.
    pub timestamp: DateTime<Utc>,
    /// Free-form extras.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// One audit entry. Append-only, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryEntry {
    /// What happened.
    pub action: String,
    /// Which agent did it.
    pub agent: String,
    /// Free-form detail.
    #[serde(default)]
    pub details: serde_json::Value,
    /// When.
    pub timestamp: DateTime<Utc>,
}

/// The serialized form of a whole board. Round-trips every field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlackboardSnapshot {
    /// Owning task id.
    pub task_id: Option<String>,
    /// Overall request status.
    pub request_status: RequestStatus,
    /// Overall request error, if any.
    pub request_error: Option<String>,
    /// Subtasks keyed by id.
    pub subtasks: HashMap<String, SubTask>,
    /// Insertion order of subtask ids.
    pub subtask_order: Vec<String>,
    /// Shared results keyed by name.
    pub results: HashMap<String, serde_json::Value>,
    /// All inter-agent messages.
    pub messages: Vec<AgentMessage>,
    /// Free-form context.
    pub context: HashMap<String, serde_json::Value>,
    /// Audit trajectory.
    pub trajectory: Vec<TrajectoryEntry>,
}

#[derive(Debug, Default)]
struct Inner {
    subtasks: HashMap<String, SubTask>,
    subtask_order: Vec<String>,
    results: HashMap<String, serde_json::Value>,
    messages: Vec<AgentMessage>,
    context: HashMap<String, serde_json::Value>,
    trajectory: Vec<TrajectoryEntry>,
    request_status: RequestStatus,
    request_error: Option<String>,
}

impl Default for RequestStatus {
    fn default() -> Self {
        RequestStatus::Pending
    }
}

/// Mutex-protected shared state for one task.
#[derive(Debug)]
pub struct Blackboard {
    task_id: Option<String>,
    inner: Mutex<Inner>,
}

impl Blackboard {
    /// Create an empty board for `task_id`.
    #[must_use]
    pub fn new(task_id: Option<String>) -> Self {
        Self {
            task_id,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// The owning task id.
    #[must_use]
    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    // --- subtasks ---

    /// Add a subtask. Rejects duplicate ids.
    pub async fn add_subtask(&self, subtask: SubTask) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.subtasks.contains_key(&subtask.id) {
            warn!(id = %subtask.id, "subtask already exists");
            return false;
        }
        debug!(id = %subtask.id, "added subtask");
        inner.subtask_order.push(subtask.id.clone());
        inner.subtasks.insert(subtask.id.clone(), subtask);
        true
    }

    /// Add several subtasks, skipping duplicates.
    pub async fn add_subtasks(&self, subtasks: Vec<SubTask>) {
        for subtask in subtasks {
            self.add_subtask(subtask).await;
        }
    }

    /// A copy of the subtask with this id.
    pub async fn get_subtask(&self, id: &str) -> Option<SubTask> {
        self.inner.lock().await.subtasks.get(id).cloned()
    }

    /// Update a subtask's status in place. Terminal states stamp
    /// `completed_at`; unknown ids are a logged no-op.
    pub async fn update_subtask_status(
        &self,
        id: &str,
        status: RequestStatus,
        result: Option<String>,
        error: Option<String>,
    ) {
        let mut inner = self.inner.lock().await;
        let Some(subtask) = inner.subtasks.get_mut(id) else {
            warn!(id, "subtask not found");
            return;
        };
        subtask.status = status;
        match status {
            RequestStatus::Completed => subtask.mark_completed(result.unwrap_or_default()),
            RequestStatus::Failed => {
                subtask.mark_failed(error.unwrap_or_else(|| "Unknown error".into()));
            }
            _ => {}
        }
        debug!(id, status = ?status, "subtask status updated");
    }

    /// The first pending subtask, in insertion order, whose dependencies
    /// have all completed.
    pub async fn get_next_subtask(&self) -> Option<SubTask> {
        let inner = self.inner.lock().await;
        for id in &inner.subtask_order {
            let subtask = &inner.subtasks[id];
            if subtask.status != RequestStatus::Pending {
                continue;
            }
            let deps_satisfied = subtask.dependencies.iter().all(|dep| {
                inner
                    .subtasks
                    .get(dep)
                    .is_some_and(|d| d.status == RequestStatus::Completed)
            });
            if deps_satisfied {
                return Some(subtask.clone());
            }
        }
        None
    }

    /// All pending subtasks, in insertion order.
    pub async fn get_pending_subtasks(&self) -> Vec<SubTask> {
        let inner = self.inner.lock().await;
        inner
            .subtask_order
            .iter()
            .filter_map(|id| inner.subtasks.get(id))
            .filter(|st| st.status == RequestStatus::Pending)
            .cloned()
            .collect()
    }

    /// Number of subtasks on the board.
    pub async fn subtask_count(&self) -> usize {
        self.inner.lock().await.subtasks.len()
    }

    /// True iff the board is non-empty and every subtask is terminal.
    pub async fn all_completed(&self) -> bool {
        let inner = self.inner.lock().await;
        !inner.subtasks.is_empty() && inner.subtasks.values().all(|st| st.status.is_terminal())
    }

    /// True iff any subtask failed.
    pub async fn has_failures(&self) -> bool {
        let inner = self.inner.lock().await;
        inner
            .subtasks
            .values()
            .any(|st| st.status == RequestStatus::Failed)
    }

    // --- results ---

    /// Store a shared result.
    pub async fn set_result(&self, key: impl Into<String>, value: serde_json::Value) {
        let key = key.into();
        debug!(%key, "set result");
        self.inner.lock().await.results.insert(key, value);
    }

    /// Fetch a shared result.
    pub async fn get_result(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.lock().await.results.get(key).cloned()
    }

    /// A copy of every shared result.
    pub async fn get_all_results(&self) -> HashMap<String, serde_json::Value> {
        self.inner.lock().await.results.clone()
    }

    // --- messages ---

    /// Append an inter-agent message.
    pub async fn send_message(
        &self,
        from: impl Into<String>,
        to: impl Into<String>,
        content: impl Into<String>,
        message_type: MessageKind,
        metadata: serde_json::Value,
    ) {
        let message = AgentMessage {
            from: from.into(),
            to: to.into(),
            content: content.into(),
            message_type,
            timestamp: Utc::now(),
            metadata,
        };
        debug!(from = %message.from, to = %message.to, "message");
        self.inner.lock().await.messages.push(message);
    }

    /// Messages addressed to `agent`.
    pub async fn get_messages_for(&self, agent: &str) -> Vec<AgentMessage> {
        self.inner
            .lock()
            .await
            .messages
            .iter()
            .filter(|m| m.to == agent)
            .cloned()
            .collect()
    }

    /// Every message on the board.
    pub async fn get_all_messages(&self) -> Vec<AgentMessage> {
        self.inner.lock().await.messages.clone()
    }

    // --- context ---

    /// Set a context value.
    pub async fn set_context(&self, key: impl Into<String>, value: serde_json::Value) {
        self.inner.lock().await.context.insert(key.into(), value);
    }

    /// Get a context value.
    pub async fn get_context(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.lock().await.context.get(key).cloned()
    }

    /// Merge several context values at once.
    pub async fn update_context(&self, updates: HashMap<String, serde_json::Value>) {
        self.inner.lock().await.context.extend(updates);
    }

    // --- trajectory ---

    /// Append an audit entry.
    pub async fn add_trajectory(
        &self,
        action: impl Into<String>,
        agent: impl Into<String>,
        details: serde_json::Value,
    ) {
        self.inner.lock().await.trajectory.push(TrajectoryEntry {
            action: action.into(),
            agent: agent.into(),
            details,
            timestamp: Utc::now(),
        });
    }

    /// A copy of the trajectory.
    pub async fn get_trajectory(&self) -> Vec<TrajectoryEntry> {
        self.inner.lock().await.trajectory.clone()
    }

    // --- request status ---

    /// Overall request status.
    pub async fn request_status(&self) -> RequestStatus {
        self.inner.lock().await.request_status
    }

    /// Set the overall request status and error.
    pub async fn set_request_status(&self, status: RequestStatus, error: Option<String>) {
        let mut inner = self.inner.lock().await;
        inner.request_status = status;
        inner.request_error = error;
    }

    // --- serialization ---

    /// Serialize the entire board.
    pub async fn snapshot(&self) -> BlackboardSnapshot {
        let inner = self.inner.lock().await;
        BlackboardSnapshot {
            task_id: self.task_id.clone(),
            request_status: inner.request_status,
            request_error: inner.request_error.clone(),
            subtasks: inner.subtasks.clone(),
            subtask_order: inner.subtask_order.clone(),
            results: inner.results.clone(),
            messages: inner.messages.clone(),
            context: inner.context.clone(),
            trajectory: inner.trajectory.clone(),
        }
    }

    /// Rebuild a board from a snapshot.
    #[must_use]
    pub fn from_snapshot(snapshot: BlackboardSnapshot) -> Self {
        Self {
            task_id: snapshot.task_id,
            inner: Mutex::new(Inner {
                subtasks: snapshot.subtasks,
                subtask_order: snapshot.subtask_order,
                results: snapshot.results,
                messages: snapshot.messages,
                context: snapshot.context,
                trajectory: snapshot.trajectory,
                request_status: snapshot.request_status,
                request_error: snapshot.request_error,
            }),
        }
    }

    /// Reset every collection and the request status.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        *inner = Inner::default();
    }
}
