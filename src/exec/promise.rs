//! Lazy one-shot asynchronous values.
//!
//! A [`Promise`] is a function from a [`Downstream`] to an eventual single
//! delivery of one of success, error, or complete. Nothing happens until a
//! terminal operator ([`Promise::then`] or [`Promise::result`]) connects the
//! chain, which must happen inside an execution segment: the terminal
//! reserves a point in the execution's stream and every continuation runs as
//! a segment on the owning worker, never on the thread that produced the
//! underlying completion.
//!
//! `Downstream` methods consume `self`, so a downstream cannot be fired
//! twice; racing producers (see [`Promise::timeout`]) share a one-shot slot
//! and the loser's delivery is dropped.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{ExecError, ExecResult};

use super::caching::CachedPromise;
use super::execution::Execution;
use super::throttle::Throttle;

/// Terminal delivery of a promise.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    Success(T),
    Error(ExecError),
    /// Finished without a value (for example, a consumed error).
    Complete,
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::Error(_))
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Outcome::Complete)
    }

    pub fn as_success(&self) -> Option<&T> {
        match self {
            Outcome::Success(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_success(self) -> Option<T> {
        match self {
            Outcome::Success(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&ExecError> {
        match self {
            Outcome::Error(error) => Some(error),
            _ => None,
        }
    }
}

/// Receiver side of a promise. Consumed by the one terminal call.
pub struct Downstream<T> {
    deliver: Box<dyn FnOnce(Outcome<T>) + Send>,
}

impl<T: Send + 'static> Downstream<T> {
    pub fn new(deliver: impl FnOnce(Outcome<T>) + Send + 'static) -> Self {
        Downstream { deliver: Box::new(deliver) }
    }

    pub fn success(self, value: T) {
        (self.deliver)(Outcome::Success(value));
    }

    pub fn error(self, error: ExecError) {
        (self.deliver)(Outcome::Error(error));
    }

    pub fn complete(self) {
        (self.deliver)(Outcome::Complete);
    }

    pub fn accept(self, outcome: Outcome<T>) {
        (self.deliver)(outcome);
    }
}

pub(crate) type ConnectFn<T> = Box<dyn FnOnce(Downstream<T>) + Send + 'static>;

/// Lazy one-shot asynchronous value with operator composition.
pub struct Promise<T> {
    on_connect: ConnectFn<T>,
}

impl<T: Send + 'static> Promise<T> {
    pub(crate) fn from_connect(on_connect: impl FnOnce(Downstream<T>) + Send + 'static) -> Self {
        Promise { on_connect: Box::new(on_connect) }
    }

    pub(crate) fn into_connect(self) -> ConnectFn<T> {
        self.on_connect
    }

    /// Promise of an already-known value.
    pub fn of(value: T) -> Self {
        Promise::from_connect(move |down| down.success(value))
    }

    /// Promise that always delivers `error`.
    pub fn error(error: ExecError) -> Self {
        Promise::from_connect(move |down| down.error(error))
    }

    /// Promise that finishes without a value.
    pub fn completed() -> Self {
        Promise::from_connect(|down| down.complete())
    }

    /// Promise evaluating `producer` at connect time, folding `Err` into an
    /// error delivery.
    pub fn from_fn(producer: impl FnOnce() -> ExecResult<T> + Send + 'static) -> Self {
        Promise::from_connect(move |down| match producer() {
            Ok(value) => down.success(value),
            Err(error) => down.error(error),
        })
    }

    /// Promise backed by an asynchronous producer.
    ///
    /// The producer receives the downstream and delivers from wherever its
    /// work finishes; deliveries arriving off the owning worker are
    /// marshalled onto it before the operator chain runs.
    pub fn from_async(producer: impl FnOnce(Downstream<T>) + Send + 'static) -> Self {
        Promise::from_connect(move |down| match Execution::try_current() {
            Some(execution) => producer(marshalled(execution, down)),
            None => producer(down),
        })
    }

    /// Adapt a fallible promise factory: an `Err` becomes an error delivery.
    pub fn wrap(factory: impl FnOnce() -> ExecResult<Promise<T>> + Send + 'static) -> Self {
        Promise::from_connect(move |down| match factory() {
            Ok(promise) => (promise.on_connect)(down),
            Err(error) => down.error(error),
        })
    }

    /// Transform the success value; errors and completes pass through.
    pub fn map<U: Send + 'static>(
        self,
        transform: impl FnOnce(T) -> U + Send + 'static,
    ) -> Promise<U> {
        Promise::from_connect(move |down| {
            (self.on_connect)(Downstream::new(move |outcome| match outcome {
                Outcome::Success(value) => down.success(transform(value)),
                Outcome::Error(error) => down.error(error),
                Outcome::Complete => down.complete(),
            }))
        })
    }

    /// Transform the success value into another promise.
    pub fn flat_map<U: Send + 'static>(
        self,
        transform: impl FnOnce(T) -> Promise<U> + Send + 'static,
    ) -> Promise<U> {
        Promise::from_connect(move |down| {
            (self.on_connect)(Downstream::new(move |outcome| match outcome {
                Outcome::Success(value) => (transform(value).on_connect)(down),
                Outcome::Error(error) => down.error(error),
                Outcome::Complete => down.complete(),
            }))
        })
    }

    /// Convert an error into a value (or a replacement error).
    pub fn map_error(
        self,
        transform: impl FnOnce(ExecError) -> ExecResult<T> + Send + 'static,
    ) -> Promise<T> {
        Promise::from_connect(move |down| {
            (self.on_connect)(Downstream::new(move |outcome| match outcome {
                Outcome::Error(error) => match transform(error) {
                    Ok(value) => down.success(value),
                    Err(replacement) => down.error(replacement),
                },
                other => down.accept(other),
            }))
        })
    }

    /// Observe and consume an error before the terminal; the chain then
    /// finishes without a value. A failing handler replaces the error.
    pub fn on_error(
        self,
        handler: impl FnOnce(ExecError) -> ExecResult<()> + Send + 'static,
    ) -> Promise<T> {
        Promise::from_connect(move |down| {
            (self.on_connect)(Downstream::new(move |outcome| match outcome {
                Outcome::Error(error) => match handler(error) {
                    Ok(()) => down.complete(),
                    Err(replacement) => down.error(replacement),
                },
                other => down.accept(other),
            }))
        })
    }

    /// Observe the outcome without changing it.
    pub fn wiretap(
        self,
        listener: impl FnOnce(&Outcome<T>) -> ExecResult<()> + Send + 'static,
    ) -> Promise<T> {
        Promise::from_connect(move |down| {
            (self.on_connect)(Downstream::new(move |outcome| match listener(&outcome) {
                Ok(()) => down.accept(outcome),
                Err(error) => down.error(error),
            }))
        })
    }

    /// Terminal: run `consumer` with the success value as a user-code
    /// segment on the owning worker. Errors route to the execution's error
    /// hook; a complete delivery just releases the reserved position.
    pub fn then(self, consumer: impl FnOnce(T) -> ExecResult<()> + Send + 'static) -> ExecResult<()> {
        let execution = Execution::current()?;
        execution.subscribe(move |handle| {
            (self.on_connect)(Downstream::new(move |outcome| match outcome {
                Outcome::Success(value) => handle.complete_with(move || consumer(value)),
                Outcome::Error(error) => handle.complete_with(move || Err(error)),
                Outcome::Complete => handle.complete(),
            }));
            Ok(())
        })
    }

    /// Terminal over the full [`Outcome`], including completes.
    pub fn result(
        self,
        consumer: impl FnOnce(Outcome<T>) -> ExecResult<()> + Send + 'static,
    ) -> ExecResult<()> {
        let execution = Execution::current()?;
        execution.subscribe(move |handle| {
            (self.on_connect)(Downstream::new(move |outcome| {
                handle.complete_with(move || consumer(outcome));
            }));
            Ok(())
        })
    }

    /// Gate connection of this promise behind `throttle`.
    pub fn throttled(self, throttle: &Throttle) -> Promise<T> {
        throttle.gate(self.into_connect())
    }

    /// Error with a timeout if the underlying promise has not delivered
    /// within `duration`. The underlying work is not preempted; its late
    /// delivery is dropped.
    pub fn timeout(self, duration: Duration) -> Promise<T> {
        Promise::from_connect(move |down| {
            let execution = match Execution::try_current() {
                Some(execution) => execution,
                None => {
                    down.error(ExecError::unmanaged_thread());
                    return;
                }
            };
            let slot = Arc::new(Mutex::new(Some(down)));
            let timer_slot = slot.clone();
            execution.event_loop().execute_after(
                duration,
                Box::new(move || {
                    if let Some(down) = timer_slot.lock().take() {
                        down.error(ExecError::timed_out(duration));
                    }
                }),
            );
            (self.on_connect)(Downstream::new(move |outcome| {
                if let Some(down) = slot.lock().take() {
                    down.accept(outcome);
                }
            }));
        })
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Single-fire caching variant: the underlying promise is connected at
    /// most once and every subscriber observes the same outcome.
    pub fn cache(self) -> CachedPromise<T> {
        CachedPromise::new(self)
    }
}

/// Promise that succeeds with `()` after `duration`, timed on the owning
/// worker.
pub fn sleep(duration: Duration) -> Promise<()> {
    Promise::from_async(move |down| match Execution::try_current() {
        Some(execution) => {
            execution
                .event_loop()
                .execute_after(duration, Box::new(move || down.success(())));
        }
        None => down.error(ExecError::unmanaged_thread()),
    })
}

fn marshalled<T: Send + 'static>(execution: Execution, down: Downstream<T>) -> Downstream<T> {
    Downstream::new(move |outcome| {
        if execution.is_bound_here() {
            down.accept(outcome);
        } else {
            execution
                .event_loop()
                .execute(Box::new(move || down.accept(outcome)));
        }
    })
}
