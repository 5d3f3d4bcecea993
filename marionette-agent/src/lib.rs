//! Per-window worker agents.
//!
//! An [`AppAgent`] owns exactly one OS window and exposes a typed tool
//! set for it. The supervisor registers each worker as a single tool
//! (`app_agent_<hwnd>`) whose one argument is a free-form task string:
//! the supervisor-as-tools pattern. [`AgentFactory`] maps a window (by
//! OS class name, then title keywords) to the right worker kind and
//! caches instances per hwnd.

mod agent;
mod builtin;
mod factory;

pub use agent::{AgentCore, AppAgent, AppAgentConfig, AppAgentState, AppType};
pub use builtin::{BrowserAgent, DesktopAgent, IdeAgent};
pub use factory::{AgentCtor, AgentFactory, AgentSeed};
