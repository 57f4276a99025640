//! Error types for the execution runtime.
//!
//! - [`ExecError`] — Cheaply cloneable error delivered through promise chains
//!   and routed to execution error hooks.
//! - [`ErrorKind`] — The classified failure behind an [`ExecError`].

pub mod exec_error;

pub use exec_error::{ErrorKind, ExecError};

/// Convenience alias for runtime-level results.
pub type ExecResult<T> = Result<T, ExecError>;
