//! Termination decisions and post-hoc success verification.
//!
//! [`TerminationChecker`] is the single authority on whether the
//! supervisor loop keeps running: a pure, priority-ordered decision over
//! the current iteration's observations, returned as a value (never a
//! control-flow exception). [`SuccessVerifier`] cross-checks a
//! self-declared completion against the final screenshot with a cheaper
//! model, failing open.

mod checker;
mod verifier;

pub use checker::{
    CheckContext, CheckerStats, TaskStatusCall, TerminationChecker, TerminationConfig,
    TerminationReason, TerminationResult, TerminationType, detect_set_task_status,
};
pub use verifier::SuccessVerifier;
