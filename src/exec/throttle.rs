//! Fair gating of promise activation.
//!
//! A throttle bounds how many gated promises are running at once. A permit
//! is reserved when the gated promise is connected; if none is free the
//! connection joins a FIFO queue with its reserved stream handle, and a
//! released permit dispatches the next waiter back into that waiter's own
//! execution.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::ExecResult;

use super::execution::{Execution, StreamHandle};
use super::promise::{ConnectFn, Downstream, Promise};

type GateSegment = Box<dyn FnOnce() -> ExecResult<()> + Send + 'static>;

/// Fair semaphore over promise activation. Cheap to clone.
#[derive(Clone)]
pub struct Throttle {
    shared: Arc<ThrottleShared>,
}

struct ThrottleShared {
    size: Option<usize>,
    queue: Mutex<ThrottleQueue>,
}

#[derive(Default)]
struct ThrottleQueue {
    active: usize,
    waiting: VecDeque<(StreamHandle, GateSegment)>,
}

impl Throttle {
    /// Throttle admitting at most `size` concurrent connections.
    pub fn of_size(size: usize) -> Self {
        Throttle {
            shared: Arc::new(ThrottleShared {
                size: Some(size),
                queue: Mutex::new(ThrottleQueue::default()),
            }),
        }
    }

    /// Throttle that never queues.
    pub fn unlimited() -> Self {
        Throttle {
            shared: Arc::new(ThrottleShared {
                size: None,
                queue: Mutex::new(ThrottleQueue::default()),
            }),
        }
    }

    /// Configured size; `None` when unlimited.
    pub fn size(&self) -> Option<usize> {
        self.shared.size
    }

    /// Gated promises currently running.
    pub fn active(&self) -> usize {
        self.shared.queue.lock().active
    }

    /// Connections waiting for a permit.
    pub fn waiting(&self) -> usize {
        self.shared.queue.lock().waiting.len()
    }

    pub(crate) fn gate<T: Send + 'static>(&self, connect: ConnectFn<T>) -> Promise<T> {
        let throttle = self.clone();
        Promise::from_connect(move |down| {
            let execution = match Execution::current() {
                Ok(execution) => execution,
                Err(error) => {
                    down.error(error);
                    return;
                }
            };
            let slot = Arc::new(Mutex::new(Some(down)));
            let failed = slot.clone();
            let submit_to = throttle.clone();
            let subscribed = execution.subscribe(move |handle| {
                let gate_handle = handle.clone();
                let release_on = submit_to.clone();
                let segment: GateSegment = Box::new(move || {
                    if let Some(down) = slot.lock().take() {
                        connect(Downstream::new(move |outcome| {
                            release_on.release();
                            gate_handle.complete_with(move || {
                                down.accept(outcome);
                                Ok(())
                            });
                        }));
                    }
                    Ok(())
                });
                submit_to.submit(handle, segment);
                Ok(())
            });
            if let Err(error) = subscribed {
                if let Some(down) = failed.lock().take() {
                    down.error(error);
                }
            }
        })
    }

    fn submit(&self, handle: StreamHandle, segment: GateSegment) {
        let mut queue = self.shared.queue.lock();
        if self.shared.size.map_or(true, |size| queue.active < size) {
            queue.active += 1;
            drop(queue);
            handle.event(move || segment());
        } else {
            queue.waiting.push_back((handle, segment));
        }
    }

    fn release(&self) {
        let next = {
            let mut queue = self.shared.queue.lock();
            queue.active = queue.active.saturating_sub(1);
            if self.shared.size.map_or(true, |size| queue.active < size) {
                match queue.waiting.pop_front() {
                    Some(entry) => {
                        queue.active += 1;
                        Some(entry)
                    }
                    None => None,
                }
            } else {
                None
            }
        };
        if let Some((handle, segment)) = next {
            handle.event(move || segment());
        }
    }
}
