//! Custom error types for the run-control engine.
//!
//! This module defines the primary error type, `RcError`, for the entire crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to
//! report the failures that run-control operations can produce.
//!
//! ## Error Hierarchy
//!
//! `RcError` consolidates the main failure sources:
//!
//! - **Validation errors** (`DuplicateProgram`, `UnknownProgram`, `MissingField`,
//!   `IllegalTransition`, `UnknownState`, `InvalidValue`): surfaced synchronously
//!   to the caller with all state left unchanged.
//! - **Store errors** (`NoSuchPath`, `TypeMismatch`, `NotADirectory`): the shared
//!   store rejected an operation against its namespace or typing rules.
//! - **Transport errors** (`Transport`, `Refused`): a request/reply round-trip
//!   could not complete, or the authority replied FAIL. There is no implicit
//!   retry; the caller decides.
//! - **`Config` / `ConfigLoad`**: semantic and parse-level configuration
//!   problems, mirroring the split between file-format errors and values that
//!   parse but are logically wrong.
//! - **`Io`**: wraps `std::io::Error` for process and stream plumbing.
//!
//! A convergence timeout is deliberately *not* an error: `wait_transition`
//! returns `Ok(false)` because a timeout is an expected operational outcome.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type RcResult<T> = std::result::Result<T, RcError>;

/// Primary error type for the run-control crate.
#[derive(Error, Debug)]
pub enum RcError {
    /// A program with this name is already registered.
    #[error("Program '{0}' already exists")]
    DuplicateProgram(String),

    /// No program with this name is registered.
    #[error("No such program '{0}'")]
    UnknownProgram(String),

    /// A required program-definition field was omitted or empty.
    #[error("Program definition is missing required field '{0}'")]
    MissingField(&'static str),

    /// The requested transition is not in the current state's legal-next set.
    #[error("Illegal transition {from} -> {to}; valid transitions are {allowed}")]
    IllegalTransition {
        /// State the machine was in when the transition was requested.
        from: String,
        /// State that was requested.
        to: String,
        /// Comma-joined list of states legal from `from`.
        allowed: String,
    },

    /// The state name is not in the transition table's domain.
    #[error("State '{0}' is not declared in the transition table")]
    UnknownState(String),

    /// A metadata or parameter value failed basic validation.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// The store has no entry at this path.
    #[error("No such store path '{0}'")]
    NoSuchPath(String),

    /// A directory operation was attempted on a variable (or vice versa).
    #[error("Store path '{0}' is not a directory")]
    NotADirectory(String),

    /// A variable was accessed with the wrong type.
    #[error("Type mismatch at '{path}': {detail}")]
    TypeMismatch {
        /// Store path of the offending variable.
        path: String,
        /// Human-readable description of the mismatch.
        detail: String,
    },

    /// A request/reply round-trip could not complete.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The authority replied FAIL to a request.
    #[error("Request refused: {0}")]
    Refused(String),

    /// A wire message could not be parsed.
    #[error("Malformed wire message: {0}")]
    Malformed(String),

    /// Configuration could not be loaded or parsed.
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] figment::Error),

    /// Configuration parsed but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Config(String),

    /// I/O failure in process or stream plumbing.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
