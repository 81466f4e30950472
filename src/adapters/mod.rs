//! Adapters for external systems.
//!
//! Adapters turn a job into work done outside the process. The only adapter
//! so far runs shell commands rendered from a template.

pub mod command;

// Re-export the command executor
pub use command::{render_value, CommandExecutor, CommandTemplate, TemplateError};
