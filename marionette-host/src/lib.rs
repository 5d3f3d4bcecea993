//! The supervisor: one agent loop driving many windows.
//!
//! [`HostAgent`] owns the outer iterate-until-terminate loop: it builds
//! the conversation, calls the model under the process-wide API gate,
//! validates and dispatches tool calls (including per-window workers
//! registered as `app_agent_<hwnd>` tools), records results, and lets
//! the termination checker decide when to stop. Sensitive tools are
//! gated behind a user confirmation round trip; checkpoints make
//! emergency stops resumable.

mod config;
mod host;
mod state_manager;

pub use config::AgentConfig;
pub use host::{HostAgent, HostAgentState, HostControl, IterationResult, TaskOutcome};
pub use state_manager::TaskStateManager;
