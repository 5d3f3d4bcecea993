#![deny(missing_docs)]
//! # marionette — umbrella crate
//!
//! Single import surface for the marionette workspace. Re-exports the
//! member crates behind feature flags, plus a `prelude` for the happy
//! path.
//!
//! | Crate | Feature | What it holds |
//! |-------|---------|---------------|
//! | `marionette-types` | `core` | Value types, errors, collaborator traits |
//! | `marionette-blackboard` | `core` | Per-task shared state |
//! | `marionette-concurrency` | `core` | Task slots, window locks, API gate |
//! | `marionette-termination` | `core` | Termination decisions, verification |
//! | `marionette-validate` | `core` | Tool-call validation, security screen |
//! | `marionette-agent` | `agents` | Per-window workers, factory |
//! | `marionette-host` | `host` | The supervisor loop |

#[cfg(feature = "agents")]
pub use marionette_agent;
#[cfg(feature = "core")]
pub use marionette_blackboard;
#[cfg(feature = "core")]
pub use marionette_concurrency;
#[cfg(feature = "host")]
pub use marionette_host;
#[cfg(feature = "core")]
pub use marionette_termination;
#[cfg(feature = "core")]
pub use marionette_types;
#[cfg(feature = "core")]
pub use marionette_validate;

/// Happy-path imports for embedding the runtime.
pub mod prelude {
    #[cfg(feature = "agents")]
    pub use marionette_agent::{
        AgentCore, AgentFactory, AppAgent, AppAgentConfig, AppAgentState, AppType,
    };
    #[cfg(feature = "core")]
    pub use marionette_blackboard::{Blackboard, RequestStatus, SubTask};
    #[cfg(feature = "core")]
    pub use marionette_concurrency::{ConcurrencyConfig, ConcurrencyManager};
    #[cfg(feature = "host")]
    pub use marionette_host::{AgentConfig, HostAgent, HostControl, TaskOutcome};
    #[cfg(feature = "core")]
    pub use marionette_termination::{
        SuccessVerifier, TerminationChecker, TerminationConfig, TerminationResult, TerminationType,
    };
    #[cfg(feature = "core")]
    pub use marionette_types::{
        AgentError, EventBus, Hwnd, InputDriver, LlmClient, LlmResponse, Message, Screenshotter,
        TaskStatus, TaskStore, ToolCall, ToolDefinition, ToolResult, WindowProbe,
    };
    #[cfg(feature = "core")]
    pub use marionette_validate::{SecurityValidator, ToolCallValidator};
}
