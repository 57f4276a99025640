//! Event-loop worker group.
//!
//! Each worker is a dedicated OS thread driving a current-thread tokio
//! runtime: the runtime's timer serves delayed tasks while the thread drains
//! a FIFO task queue. Executions are pinned to one worker for their whole
//! life, which is what makes their state single-threaded by construction.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::{ExecError, ExecResult};

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

/// Handle to one pinned worker thread. Cheap to clone.
#[derive(Clone)]
pub(crate) struct EventLoop {
    shared: Arc<EventLoopShared>,
}

struct EventLoopShared {
    tx: mpsc::UnboundedSender<Task>,
    runtime: tokio::runtime::Handle,
    thread_id: ThreadId,
    index: usize,
}

impl EventLoop {
    pub(crate) fn in_event_loop(&self) -> bool {
        thread::current().id() == self.shared.thread_id
    }

    /// Run `task` on the worker thread, after all previously submitted tasks.
    pub(crate) fn execute(&self, task: Task) {
        if self.shared.tx.send(task).is_err() {
            tracing::warn!(worker = self.shared.index, "event loop stopped; task dropped");
        }
    }

    /// Run `task` on the worker thread once `delay` has elapsed.
    pub(crate) fn execute_after(&self, delay: Duration, task: Task) {
        let tx = self.shared.tx.clone();
        let index = self.shared.index;
        let _ = self.shared.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(task).is_err() {
                tracing::debug!(worker = index, "event loop stopped; timed task dropped");
            }
        });
    }
}

pub(crate) struct EventLoopGroup {
    loops: Vec<EventLoop>,
    next: AtomicUsize,
}

impl EventLoopGroup {
    pub(crate) fn new(threads: usize, thread_name: &str) -> ExecResult<Self> {
        let mut loops = Vec::with_capacity(threads);
        for index in 0..threads {
            loops.push(spawn_event_loop(index, thread_name)?);
        }
        Ok(EventLoopGroup { loops, next: AtomicUsize::new(0) })
    }

    /// Round-robin worker assignment.
    pub(crate) fn next_loop(&self) -> EventLoop {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        self.loops[index].clone()
    }
}

fn spawn_event_loop(index: usize, thread_name: &str) -> ExecResult<EventLoop> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
    let (ready_tx, ready_rx) =
        std::sync::mpsc::channel::<std::io::Result<(tokio::runtime::Handle, ThreadId)>>();

    thread::Builder::new()
        .name(format!("{thread_name}-{index}"))
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
            {
                Ok(runtime) => runtime,
                Err(error) => {
                    let _ = ready_tx.send(Err(error));
                    return;
                }
            };
            let _ = ready_tx.send(Ok((runtime.handle().clone(), thread::current().id())));
            runtime.block_on(async move {
                while let Some(task) = rx.recv().await {
                    task();
                }
            });
            tracing::debug!(worker = index, "event loop thread stopped");
        })
        .map_err(ExecError::new)?;

    match ready_rx.recv() {
        Ok(Ok((runtime, thread_id))) => Ok(EventLoop {
            shared: Arc::new(EventLoopShared { tx, runtime, thread_id, index }),
        }),
        Ok(Err(error)) => Err(ExecError::new(error)),
        Err(error) => Err(ExecError::new(error)),
    }
}
