//! Execution and its segmented event stream.
//!
//! An [`Execution`] is one logical thread of control pinned to one event-loop
//! worker. Work arrives as *segments* grouped into *events*: the stream is a
//! FIFO of events, each event a FIFO of segments, and [`Execution::subscribe`]
//! pushes a fresh nested stream whose segments run before the remainder of
//! the parent. That nesting is how asynchronous completions are delivered at
//! a reserved point in the sequence without reordering sibling work.
//!
//! Segments are either *user code* (run under the interceptor chain, errors
//! routed to the execution's error hook) or *infrastructure code* (errors
//! logged and swallowed). A segment runs to completion without suspension;
//! anything that looks like suspension is really more segments.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{ExecError, ExecResult};
use crate::registry::Registry;

use super::controller::ExecController;
use super::event_loop::EventLoop;
use super::interceptor::{self, ExecInterceptor, ExecType};

pub(crate) type UserSegment = Box<dyn FnOnce() -> ExecResult<()> + Send + 'static>;
pub(crate) type ErrorHook =
    Box<dyn Fn(&Execution, ExecError) -> ExecResult<()> + Send + Sync + 'static>;
pub(crate) type CompletionHook = Box<dyn FnOnce(&Execution) -> ExecResult<()> + Send + 'static>;
type CleanupHook = Box<dyn FnOnce() -> ExecResult<()> + Send + 'static>;

pub(crate) enum Segment {
    User(UserSegment),
    Infra(UserSegment),
}

type Event = VecDeque<Segment>;

/// One nesting level of the segment stream. The event queue is behind a lock
/// because completions enqueue from other threads.
pub(crate) struct EventStream {
    events: Mutex<VecDeque<Event>>,
}

type StreamRef = Arc<EventStream>;

impl EventStream {
    fn new_ref() -> StreamRef {
        Arc::new(EventStream { events: Mutex::new(VecDeque::new()) })
    }

    fn with_initial_event() -> StreamRef {
        let stream = Self::new_ref();
        stream.events.lock().push_back(VecDeque::new());
        stream
    }
}

struct OverlayEntry {
    type_id: TypeId,
    value: Arc<dyn Any + Send + Sync>,
}

pub(crate) struct ExecutionState {
    controller: ExecController,
    event_loop: EventLoop,
    /// The current stream; swapped by subscribe and restored by handles.
    stream: Mutex<StreamRef>,
    done: AtomicBool,
    on_error: ErrorHook,
    on_complete: Mutex<Option<CompletionHook>>,
    cleanup: Mutex<Vec<CleanupHook>>,
    overlay: Mutex<Vec<OverlayEntry>>,
    global_interceptors: Arc<[Arc<dyn ExecInterceptor>]>,
    registry_interceptors: Mutex<Vec<Arc<dyn ExecInterceptor>>>,
    adhoc_interceptors: Mutex<Vec<Arc<dyn ExecInterceptor>>>,
}

thread_local! {
    static THREAD_BINDING: RefCell<Option<Execution>> = const { RefCell::new(None) };
}

/// Handle to one logical cooperative task. Cheap to clone; clones refer to
/// the same execution.
#[derive(Clone)]
pub struct Execution {
    state: Arc<ExecutionState>,
}

impl std::fmt::Debug for Execution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Execution").finish_non_exhaustive()
    }
}

enum Next {
    Run(Segment),
    EventDrained { stream_empty: bool },
    StreamEmpty,
}

impl Execution {
    pub(crate) fn create(
        controller: ExecController,
        event_loop: EventLoop,
        global_interceptors: Arc<[Arc<dyn ExecInterceptor>]>,
        on_error: ErrorHook,
        on_complete: CompletionHook,
    ) -> Execution {
        Execution {
            state: Arc::new(ExecutionState {
                controller,
                event_loop,
                stream: Mutex::new(EventStream::new_ref()),
                done: AtomicBool::new(false),
                on_error,
                on_complete: Mutex::new(Some(on_complete)),
                cleanup: Mutex::new(Vec::new()),
                overlay: Mutex::new(Vec::new()),
                global_interceptors,
                registry_interceptors: Mutex::new(Vec::new()),
                adhoc_interceptors: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The execution bound to the current thread.
    ///
    /// Fails with an unmanaged-thread error when the caller is not running
    /// inside a segment.
    pub fn current() -> ExecResult<Execution> {
        Execution::try_current().ok_or_else(ExecError::unmanaged_thread)
    }

    /// Like [`Execution::current`], but `None` off managed threads.
    pub fn try_current() -> Option<Execution> {
        THREAD_BINDING.with(|binding| binding.borrow().clone())
    }

    pub(crate) fn is_bound_here(&self) -> bool {
        THREAD_BINDING.with(|binding| {
            binding
                .borrow()
                .as_ref()
                .is_some_and(|bound| Arc::ptr_eq(&bound.state, &self.state))
        })
    }

    pub fn controller(&self) -> &ExecController {
        &self.state.controller
    }

    pub(crate) fn event_loop(&self) -> &EventLoop {
        &self.state.event_loop
    }

    pub fn is_done(&self) -> bool {
        self.state.done.load(Ordering::Acquire)
    }

    /// Reserve a point in the segment sequence.
    ///
    /// `consumer` receives a [`StreamHandle`] through which later (possibly
    /// off-thread) code injects segments at the reserved position; those
    /// segments run before the remainder of the current event.
    pub fn subscribe(
        &self,
        consumer: impl FnOnce(StreamHandle) -> ExecResult<()> + Send + 'static,
    ) -> ExecResult<()> {
        if self.is_done() {
            return Err(ExecError::execution_completed());
        }
        {
            let stream = self.state.stream.lock().clone();
            let mut events = stream.events.lock();
            if events.is_empty() {
                events.push_back(VecDeque::new());
            }
            let execution = self.clone();
            if let Some(head) = events.front_mut() {
                head.push_back(Segment::Infra(Box::new(move || {
                    let parent = execution.state.stream.lock().clone();
                    let nested = EventStream::with_initial_event();
                    *execution.state.stream.lock() = nested.clone();
                    consumer(StreamHandle { execution: execution.clone(), parent, stream: nested })
                })));
            }
        }
        self.drain();
        Ok(())
    }

    /// Request a drain on the owning worker; used to re-enter the execution
    /// after an off-thread completion.
    pub fn event_loop_drain(&self) {
        let execution = self.clone();
        self.state.event_loop.execute(Box::new(move || execution.drain()));
    }

    pub(crate) fn drain(&self) {
        if self.is_done() {
            return;
        }

        // Already inside a drain frame on this thread; the outer loop will
        // pick up whatever was just queued.
        if self.is_bound_here() {
            return;
        }

        let bound_elsewhere = THREAD_BINDING.with(|binding| binding.borrow().is_some());
        if !self.state.event_loop.in_event_loop() || bound_elsewhere {
            if !self.is_done() {
                let execution = self.clone();
                self.state.event_loop.execute(Box::new(move || execution.drain()));
            }
            return;
        }

        let _guard = BindGuard::bind(self.clone());
        loop {
            let stream = self.state.stream.lock().clone();
            let next = {
                let mut events = stream.events.lock();
                match events.front_mut() {
                    None => Next::StreamEmpty,
                    Some(event) => match event.pop_front() {
                        Some(segment) => Next::Run(segment),
                        None => {
                            events.pop_front();
                            Next::EventDrained { stream_empty: events.is_empty() }
                        }
                    },
                }
            };
            match next {
                Next::StreamEmpty => return,
                Next::EventDrained { stream_empty } => {
                    if stream_empty {
                        if self.is_done() {
                            self.finish();
                        }
                        return;
                    }
                }
                Next::Run(Segment::User(segment)) => {
                    if let Err(error) = self.run_intercepted(ExecType::Compute, segment) {
                        self.route_user_error(error);
                    }
                }
                Next::Run(Segment::Infra(segment)) => {
                    if let Err(error) = segment() {
                        tracing::error!(error = %error, "internal runtime error in infrastructure segment");
                    }
                }
            }
        }
    }

    /// Replace the current event with a single segment that routes `error`
    /// through the execution's error hook. A failing hook is re-enqueued as a
    /// user segment so interceptors and default logging still observe it.
    fn route_user_error(&self, error: ExecError) {
        let stream = self.state.stream.lock().clone();
        let mut events = stream.events.lock();
        if events.is_empty() {
            events.push_back(VecDeque::new());
        }
        if let Some(event) = events.front_mut() {
            event.clear();
            let execution = self.clone();
            event.push_front(Segment::Infra(Box::new(move || {
                if let Err(hook_error) = (execution.state.on_error)(&execution, error) {
                    let stream = execution.state.stream.lock().clone();
                    let mut events = stream.events.lock();
                    if events.is_empty() {
                        events.push_back(VecDeque::new());
                    }
                    if let Some(event) = events.front_mut() {
                        event.push_front(Segment::User(Box::new(move || Err(hook_error))));
                    }
                }
                Ok(())
            })));
        }
    }

    fn finish(&self) {
        if let Some(on_complete) = self.state.on_complete.lock().take() {
            if let Err(error) = on_complete(self) {
                tracing::warn!(error = %error, "completion hook failed");
            }
        }
        let hooks: Vec<CleanupHook> = std::mem::take(&mut *self.state.cleanup.lock());
        for hook in hooks {
            if let Err(error) = hook() {
                tracing::warn!(error = %error, "cleanup hook failed");
            }
        }
    }

    pub(crate) fn run_intercepted<'a>(
        &self,
        exec_type: ExecType,
        segment: impl FnOnce() -> ExecResult<()> + 'a,
    ) -> ExecResult<()> {
        let interceptors = self.all_interceptors();
        if interceptors.is_empty() {
            return segment();
        }
        interceptor::run_chain(self, exec_type, &interceptors, Box::new(segment))
    }

    fn all_interceptors(&self) -> Vec<Arc<dyn ExecInterceptor>> {
        let global = &self.state.global_interceptors;
        let registry = self.state.registry_interceptors.lock();
        let adhoc = self.state.adhoc_interceptors.lock();
        if global.is_empty() && registry.is_empty() && adhoc.is_empty() {
            return Vec::new();
        }
        let mut all = Vec::with_capacity(global.len() + registry.len() + adhoc.len());
        all.extend(global.iter().cloned());
        all.extend(registry.iter().cloned());
        all.extend(adhoc.iter().cloned());
        all
    }

    /// Register an interceptor for the remainder of this execution.
    pub fn add_interceptor(&self, interceptor: Arc<dyn ExecInterceptor>) {
        self.state.adhoc_interceptors.lock().push(interceptor);
    }

    /// Run `hook` when the execution terminates, after the completion hook.
    /// Hooks run in registration order; a failing hook never suppresses the
    /// ones after it.
    pub fn on_cleanup(&self, hook: impl FnOnce() -> ExecResult<()> + Send + 'static) {
        self.state.cleanup.lock().push(Box::new(hook));
    }

    /// Add a value to this execution's registry overlay.
    pub fn add<T: Send + Sync + 'static>(&self, value: T) {
        self.state.overlay.lock().push(OverlayEntry {
            type_id: TypeId::of::<T>(),
            value: Arc::new(value),
        });
    }

    /// First overlay value registered for `T`.
    pub fn maybe_get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        let overlay = self.state.overlay.lock();
        overlay
            .iter()
            .find(|entry| entry.type_id == TypeId::of::<T>())
            .and_then(|entry| entry.value.clone().downcast::<T>().ok())
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> ExecResult<Arc<T>> {
        self.maybe_get::<T>()
            .ok_or_else(|| ExecError::not_in_registry(std::any::type_name::<T>()))
    }

    pub fn get_all<T: Send + Sync + 'static>(&self) -> Vec<Arc<T>> {
        let overlay = self.state.overlay.lock();
        overlay
            .iter()
            .filter(|entry| entry.type_id == TypeId::of::<T>())
            .filter_map(|entry| entry.value.clone().downcast::<T>().ok())
            .collect()
    }

    /// Immutable snapshot of the overlay as a [`Registry`].
    pub fn registry_snapshot(&self) -> Registry {
        let overlay = self.state.overlay.lock();
        Registry::from_entries(
            overlay
                .iter()
                .map(|entry| (entry.type_id, entry.value.clone()))
                .collect(),
        )
    }

    /// Effective lookup context: `child` (typically request-scoped) overlaid
    /// on this execution's registry.
    pub fn join(&self, child: Registry) -> Registry {
        self.registry_snapshot().join(child)
    }

    pub(crate) fn snapshot_registry_interceptors(&self) {
        let snapshot: Vec<Arc<dyn ExecInterceptor>> = self
            .get_all::<Arc<dyn ExecInterceptor>>()
            .iter()
            .map(|interceptor| Arc::clone(&**interceptor))
            .collect();
        *self.state.registry_interceptors.lock() = snapshot;
    }

    /// Seed the stream with the initial user action and the terminal marker
    /// that flips `done`.
    pub(crate) fn enqueue_initial(&self, action: UserSegment) {
        let stream = self.state.stream.lock().clone();
        let mut events = stream.events.lock();
        events.push_back(VecDeque::from([Segment::User(action)]));
        let state = self.state.clone();
        events.push_back(VecDeque::from([Segment::Infra(Box::new(move || {
            state.done.store(true, Ordering::Release);
            Ok(())
        }))]));
    }
}

/// Reservation token allowing later, possibly off-thread, code to inject
/// segments at a fixed point in an execution's stream.
#[derive(Clone)]
pub struct StreamHandle {
    execution: Execution,
    parent: StreamRef,
    stream: StreamRef,
}

impl StreamHandle {
    pub fn execution(&self) -> &Execution {
        &self.execution
    }

    /// Enqueue a user-code segment inside the reserved position.
    pub fn event(&self, segment: impl FnOnce() -> ExecResult<()> + Send + 'static) {
        self.push(Segment::User(Box::new(segment)));
    }

    /// Enqueue a final user-code segment: it pops the nested stream back to
    /// the parent, then runs.
    pub fn complete_with(self, segment: impl FnOnce() -> ExecResult<()> + Send + 'static) {
        let execution = self.execution.clone();
        let parent = self.parent.clone();
        self.push(Segment::User(Box::new(move || {
            *execution.state.stream.lock() = parent;
            segment()
        })));
    }

    /// Pop the nested stream without further work.
    pub fn complete(self) {
        let execution = self.execution.clone();
        let parent = self.parent.clone();
        self.push(Segment::Infra(Box::new(move || {
            *execution.state.stream.lock() = parent;
            Ok(())
        })));
    }

    fn push(&self, segment: Segment) {
        {
            let mut events = self.stream.events.lock();
            events.push_back(VecDeque::from([segment]));
        }
        self.execution.drain();
    }
}

struct BindGuard;

impl BindGuard {
    fn bind(execution: Execution) -> BindGuard {
        THREAD_BINDING.with(|binding| *binding.borrow_mut() = Some(execution));
        BindGuard
    }
}

impl Drop for BindGuard {
    fn drop(&mut self) {
        THREAD_BINDING.with(|binding| *binding.borrow_mut() = None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::controller::ExecController;
    use std::sync::mpsc::channel;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(10);

    fn controller() -> ExecController {
        ExecController::builder()
            .compute_threads(1)
            .thread_name("execution-test")
            .build()
            .unwrap()
    }

    #[derive(Debug, PartialEq)]
    struct Tag(&'static str);

    #[test]
    fn test_overlay_lookup_and_snapshot() {
        let controller = controller();
        let (tx, rx) = channel::<(bool, bool, usize, bool)>();
        controller.fork().start(move |execution| {
            execution.add(Tag("first"));
            execution.add(Tag("second"));
            let first_wins = execution
                .maybe_get::<Tag>()
                .map(|tag| *tag == Tag("first"))
                .unwrap_or(false);
            let missing = execution.maybe_get::<String>().is_none();
            let count = execution.get_all::<Tag>().len();
            let snapshot_hit = execution.registry_snapshot().maybe_get::<Tag>().is_some();
            let _ = tx.send((first_wins, missing, count, snapshot_hit));
            Ok(())
        });
        let (first_wins, missing, count, snapshot_hit) = rx.recv_timeout(WAIT).unwrap();
        assert!(first_wins);
        assert!(missing);
        assert_eq!(count, 2);
        assert!(snapshot_hit);
    }

    #[test]
    fn test_join_prefers_request_scoped_child() {
        let controller = controller();
        let (tx, rx) = channel::<(bool, usize)>();
        controller.fork().start(move |execution| {
            execution.add(Tag("base"));
            let joined = execution.join(Registry::single(Tag("request")));
            let child_wins = joined
                .maybe_get::<Tag>()
                .map(|tag| *tag == Tag("request"))
                .unwrap_or(false);
            let total = joined.get_all::<Tag>().len();
            let _ = tx.send((child_wins, total));
            Ok(())
        });
        let (child_wins, total) = rx.recv_timeout(WAIT).unwrap();
        assert!(child_wins);
        assert_eq!(total, 2);
    }

    #[test]
    fn test_subscribe_fails_after_completion() {
        let controller = controller();
        let (handle_tx, handle_rx) = channel::<Execution>();
        controller
            .fork()
            .on_complete(move |execution| {
                let _ = handle_tx.send(execution.clone());
                Ok(())
            })
            .start(|_execution| Ok(()));
        let execution = handle_rx.recv_timeout(WAIT).unwrap();
        assert!(execution.is_done());
        let error = execution.subscribe(|_handle| Ok(())).unwrap_err();
        assert!(error.is_execution_completed());
    }

    #[test]
    fn test_current_inside_segment_is_this_execution() {
        let controller = controller();
        let (tx, rx) = channel::<bool>();
        controller.fork().start(move |execution| {
            let bound = Execution::current()?;
            let _ = tx.send(Arc::ptr_eq(&bound.state, &execution.state));
            Ok(())
        });
        assert!(rx.recv_timeout(WAIT).unwrap());
    }
}
