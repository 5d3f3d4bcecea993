//! Legal-transition enforcement over the task store.

use std::sync::Arc;

use tracing::debug;

use marionette_types::{AgentError, Hwnd, TaskStatus, TaskStore};

/// Wraps the [`TaskStore`] and enforces the legal task transition set.
///
/// Transitions: `pending -> running`,
/// `running -> {paused, completed, failed, needs_help, interrupted}`,
/// `paused -> running`, `interrupted -> {running, cancelled}`.
/// Anything else is [`AgentError::InvalidStateTransition`] and never
/// reaches the store. Same-state transitions are a no-op.
pub struct TaskStateManager {
    store: Arc<dyn TaskStore>,
}

impl TaskStateManager {
    /// Wrap a store.
    #[must_use]
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Create a task record in `Pending`.
    pub async fn create_task(
        &self,
        task_id: &str,
        text: &str,
        target_hwnds: &[Hwnd],
    ) -> Result<(), AgentError> {
        self.store.create_task(task_id, text, target_hwnds).await
    }

    /// Current status.
    pub async fn get_status(&self, task_id: &str) -> Result<TaskStatus, AgentError> {
        self.store.get_status(task_id).await
    }

    /// Transition a task, enforcing legality.
    pub async fn transition(
        &self,
        task_id: &str,
        to: TaskStatus,
        reason: Option<&str>,
    ) -> Result<(), AgentError> {
        let from = self.store.get_status(task_id).await?;
        if from == to {
            return Ok(());
        }
        if !TaskStatus::legal_transition(from, to) {
            return Err(AgentError::InvalidStateTransition { from, to });
        }
        debug!(task_id, %from, %to, "task transition");
        self.store.set_status(task_id, to, reason).await
    }
}
