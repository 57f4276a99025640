//! Runtime error type.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Classified failures raised by the runtime or folded into promise chains.
#[derive(Debug, Error)]
pub enum ErrorKind {
    #[error("current thread is not managed by an execution")]
    UnmanagedThread,
    #[error("this execution has completed (a promise may be in use from a cleanup hook)")]
    ExecutionCompleted,
    #[error("no entry in registry for type {0}")]
    NotInRegistry(&'static str),
    #[error("promise timed out after {0:?}")]
    TimedOut(Duration),
    #[error("{0}")]
    Message(String),
    #[error("{0}")]
    Source(Box<dyn std::error::Error + Send + Sync>),
}

/// Error delivered through promise chains and execution error hooks.
///
/// One failure can fan out to many waiters (see the caching promise), so the
/// kind is shared and clones are cheap.
#[derive(Debug, Clone)]
pub struct ExecError {
    kind: Arc<ErrorKind>,
}

impl ExecError {
    /// Wrap an arbitrary error.
    pub fn new(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        ErrorKind::Source(Box::new(error)).into()
    }

    /// Error carrying just a message.
    pub fn msg(message: impl Into<String>) -> Self {
        ErrorKind::Message(message.into()).into()
    }

    pub(crate) fn unmanaged_thread() -> Self {
        ErrorKind::UnmanagedThread.into()
    }

    pub(crate) fn execution_completed() -> Self {
        ErrorKind::ExecutionCompleted.into()
    }

    pub(crate) fn not_in_registry(type_name: &'static str) -> Self {
        ErrorKind::NotInRegistry(type_name).into()
    }

    pub(crate) fn timed_out(duration: Duration) -> Self {
        ErrorKind::TimedOut(duration).into()
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn is_unmanaged_thread(&self) -> bool {
        matches!(*self.kind, ErrorKind::UnmanagedThread)
    }

    pub fn is_execution_completed(&self) -> bool {
        matches!(*self.kind, ErrorKind::ExecutionCompleted)
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(*self.kind, ErrorKind::TimedOut(_))
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind, f)
    }
}

impl std::error::Error for ExecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &*self.kind {
            ErrorKind::Source(inner) => Some(inner.as_ref() as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl From<ErrorKind> for ExecError {
    fn from(kind: ErrorKind) -> Self {
        ExecError { kind: Arc::new(kind) }
    }
}

impl From<String> for ExecError {
    fn from(message: String) -> Self {
        ExecError::msg(message)
    }
}

impl From<&str> for ExecError {
    fn from(message: &str) -> Self {
        ExecError::msg(message)
    }
}
