//! Single-fire caching promise.
//!
//! Wraps an upstream so the first connect fires it exactly once and stores
//! the terminal outcome; every other connect enqueues a waiter holding a
//! reserved stream handle. Once the outcome exists, a drain delivers it to
//! each waiter inside that waiter's own execution — never inline — so each
//! execution observes the delivery in its own segment order.
//!
//! The drain is guarded by an atomic request counter: whoever moves it from
//! zero drains, and keeps draining while requests arrived in the meantime.
//! Requests are therefore never lost and the drain never recurses.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::execution::{Execution, StreamHandle};
use super::promise::{ConnectFn, Downstream, Outcome, Promise};

/// Shareable handle to a cached promise. Clones observe the same single
/// firing of the underlying upstream.
#[derive(Clone)]
pub struct CachedPromise<T: Clone + Send + 'static> {
    upstream: Arc<CachingUpstream<T>>,
}

impl<T: Clone + Send + 'static> CachedPromise<T> {
    pub(crate) fn new(promise: Promise<T>) -> Self {
        CachedPromise { upstream: Arc::new(CachingUpstream::new(promise.into_connect())) }
    }

    /// Promise delivering this cache's outcome to the current execution.
    pub fn promise(&self) -> Promise<T> {
        let upstream = self.upstream.clone();
        Promise::from_connect(move |down| CachingUpstream::connect(&upstream, down))
    }
}

struct Waiter<T> {
    downstream: Downstream<T>,
    handle: StreamHandle,
}

struct CachingUpstream<T: Clone + Send + 'static> {
    upstream: Mutex<Option<ConnectFn<T>>>,
    fired: AtomicBool,
    result: Mutex<Option<Outcome<T>>>,
    waiting: Mutex<VecDeque<Waiter<T>>>,
    drain_requested: AtomicUsize,
}

impl<T: Clone + Send + 'static> CachingUpstream<T> {
    fn new(upstream: ConnectFn<T>) -> Self {
        CachingUpstream {
            upstream: Mutex::new(Some(upstream)),
            fired: AtomicBool::new(false),
            result: Mutex::new(None),
            waiting: Mutex::new(VecDeque::new()),
            drain_requested: AtomicUsize::new(0),
        }
    }

    fn connect(this: &Arc<Self>, downstream: Downstream<T>) {
        if !this.fired.swap(true, Ordering::AcqRel) {
            let upstream = this.upstream.lock().take();
            if let Some(upstream) = upstream {
                let cache = this.clone();
                let context = Execution::try_current();
                upstream(Downstream::new(move |outcome: Outcome<T>| {
                    *cache.result.lock() = Some(outcome.clone());
                    CachingUpstream::schedule_drain(&cache, context.as_ref());
                    downstream.accept(outcome);
                }));
            }
        } else {
            let execution = match Execution::current() {
                Ok(execution) => execution,
                Err(error) => {
                    downstream.error(error);
                    return;
                }
            };
            let cache = this.clone();
            let slot = Arc::new(Mutex::new(Some(downstream)));
            let failed = slot.clone();
            let subscribed = execution.subscribe(move |handle| {
                if let Some(downstream) = slot.lock().take() {
                    cache.waiting.lock().push_back(Waiter { downstream, handle });
                    if cache.result.lock().is_some() {
                        cache.try_drain();
                    }
                }
                Ok(())
            });
            if let Err(error) = subscribed {
                if let Some(downstream) = failed.lock().take() {
                    downstream.error(error);
                }
            }
        }
    }

    fn schedule_drain(this: &Arc<Self>, context: Option<&Execution>) {
        match context {
            Some(execution) => {
                let cache = this.clone();
                execution
                    .event_loop()
                    .execute(Box::new(move || cache.try_drain()));
            }
            None => this.try_drain(),
        }
    }

    fn try_drain(&self) {
        if self.drain_requested.fetch_add(1, Ordering::AcqRel) > 0 {
            // A drainer is active; it will observe this request.
            return;
        }
        let mut claimed = 1;
        loop {
            let outcome = self.result.lock().clone();
            if let Some(outcome) = outcome {
                loop {
                    let waiter = self.waiting.lock().pop_front();
                    match waiter {
                        None => break,
                        Some(Waiter { downstream, handle }) => {
                            let delivered = outcome.clone();
                            handle.complete_with(move || {
                                downstream.accept(delivered);
                                Ok(())
                            });
                        }
                    }
                }
            }
            let remaining = self.drain_requested.fetch_sub(claimed, Ordering::AcqRel) - claimed;
            if remaining == 0 {
                return;
            }
            claimed = remaining;
        }
    }
}
