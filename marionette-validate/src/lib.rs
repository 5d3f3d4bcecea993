#![deny(missing_docs)]
//! Tool-call validation and security screening.
//!
//! [`ToolCallValidator`] checks model-issued tool calls against the
//! registered definitions before anything executes: name, required
//! parameters, runtime types, positive-only values, string length, and
//! coordinate bounds. A failing [`ValidationResult`] is converted by the
//! supervisor to a failing tool result and returned to the model, which
//! learns from the error on its next turn; validation never aborts the
//! loop.
//!
//! [`SecurityValidator`] screens text for prompt-injection patterns and
//! redacts secret-shaped substrings with `[REDACTED]`.

mod security;
mod tool_call;

pub use security::{SecurityFinding, SecurityValidator};
pub use tool_call::{ToolCallValidator, ValidationError, ValidationResult};
