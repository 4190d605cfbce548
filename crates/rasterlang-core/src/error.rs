//! Core error types for rasterlang-core.
//!
//! Uses `thiserror` for structured, matchable error variants. Only
//! conditions a caller can act on are errors; violated IR invariants are
//! internal bugs and panic at the constructor.

use thiserror::Error;

/// Errors produced while assembling the pipeline model.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A definition calls a function that was never registered.
    #[error("call to unknown function '{name}'")]
    UnknownFunction { name: String },

    /// Two distinct functions were registered under one name.
    #[error("conflicting definitions registered for function '{name}'")]
    DuplicateFunction { name: String },
}
