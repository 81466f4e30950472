//! Domain types for the retry pipeline.
//!
//! This module contains the data structures every other layer works on:
//! - Job: a raw queue payload with typed field lookup
//! - FieldPath: dotted field addresses with an optional trailing index
//! - FieldValue: the typed view of a resolved field

pub mod job;
pub mod path;
pub mod value;

// Re-export commonly used types
pub use job::{Job, JobError};
pub use path::{FieldPath, PathIndex};
pub use value::{FieldValue, ValueKind};
