//! Interception of user-code segments.
//!
//! Interceptors wrap every user-code segment an execution runs, in order:
//! controller-wide (fixed at construction), registry-provided (snapshot at
//! execution start), then ad-hoc (registered mid-execution). Each interceptor
//! must resume its [`Continuation`] exactly once; after the last one the
//! segment body itself runs. The chain is walked by slice recursion rather
//! than a growing closure stack, so long chains stay shallow.

use std::sync::Arc;

use crate::error::ExecResult;

use super::execution::Execution;

/// The kind of work a segment performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecType {
    /// Event-loop compute segment.
    Compute,
    /// Function offloaded to the blocking executor.
    Blocking,
}

/// Remainder of an interceptor chain, ending in the segment body.
pub struct Continuation<'a> {
    inner: Box<dyn FnOnce() -> ExecResult<()> + 'a>,
}

impl<'a> Continuation<'a> {
    pub(crate) fn new(inner: impl FnOnce() -> ExecResult<()> + 'a) -> Self {
        Continuation { inner: Box::new(inner) }
    }

    /// Run the rest of the chain and the segment. Must be called exactly once.
    pub fn resume(self) -> ExecResult<()> {
        (self.inner)()
    }
}

/// Observes segment execution, typically to propagate contextual state such
/// as log scopes or trace spans around user code.
pub trait ExecInterceptor: Send + Sync {
    fn intercept(
        &self,
        execution: &Execution,
        exec_type: ExecType,
        continuation: Continuation<'_>,
    ) -> ExecResult<()>;
}

pub(crate) fn run_chain<'a>(
    execution: &'a Execution,
    exec_type: ExecType,
    chain: &'a [Arc<dyn ExecInterceptor>],
    segment: Box<dyn FnOnce() -> ExecResult<()> + 'a>,
) -> ExecResult<()> {
    match chain.split_first() {
        None => segment(),
        Some((head, rest)) => head.intercept(
            execution,
            exec_type,
            Continuation::new(move || run_chain(execution, exec_type, rest, segment)),
        ),
    }
}
