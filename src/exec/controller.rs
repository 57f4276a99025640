//! Execution controller: owns the event-loop worker group and the blocking
//! executor, and is the factory for executions.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::ExecConfig;
use crate::error::{ExecError, ExecResult};

use super::event_loop::EventLoopGroup;
use super::execution::{CompletionHook, ErrorHook, Execution, UserSegment};
use super::interceptor::{ExecInterceptor, ExecType};
use super::promise::{Downstream, Promise};

/// Owns a fixed set of event-loop workers and a blocking pool. Cheap to
/// clone; executions keep their controller alive.
#[derive(Clone)]
pub struct ExecController {
    shared: Arc<ControllerShared>,
}

struct ControllerShared {
    event_loops: EventLoopGroup,
    blocking: BlockingPool,
    interceptors: Arc<[Arc<dyn ExecInterceptor>]>,
}

impl ExecController {
    /// Controller with default configuration.
    pub fn new() -> ExecResult<Self> {
        ExecController::builder().build()
    }

    pub fn builder() -> ExecControllerBuilder {
        let defaults = ExecConfig::default();
        ExecControllerBuilder {
            compute_threads: defaults.compute_threads,
            max_blocking_threads: defaults.max_blocking_threads,
            thread_name: defaults.thread_name,
            interceptors: Vec::new(),
        }
    }

    pub fn from_config(config: &ExecConfig) -> ExecResult<Self> {
        ExecController::builder().config(config).build()
    }

    /// Begin describing a new execution.
    pub fn fork(&self) -> ExecStarter {
        ExecStarter {
            controller: self.clone(),
            on_error: None,
            on_complete: None,
            registry_init: None,
        }
    }

    /// Promise of an already-known value.
    pub fn promise_of<T: Send + 'static>(&self, value: T) -> Promise<T> {
        Promise::of(value)
    }

    /// Promise backed by an asynchronous producer; see [`Promise::from_async`].
    pub fn promise<T: Send + 'static>(
        &self,
        producer: impl FnOnce(Downstream<T>) + Send + 'static,
    ) -> Promise<T> {
        Promise::from_async(producer)
    }

    /// Run `function` on the blocking executor and deliver its result on the
    /// owning worker. The function runs under the interceptor chain with
    /// [`ExecType::Blocking`].
    pub fn blocking<T, F>(&self, function: F) -> Promise<T>
    where
        T: Send + 'static,
        F: FnOnce() -> ExecResult<T> + Send + 'static,
    {
        let controller = self.clone();
        Promise::from_async(move |down| {
            let execution = match Execution::try_current() {
                Some(execution) => execution,
                None => {
                    down.error(ExecError::unmanaged_thread());
                    return;
                }
            };
            let slot = Arc::new(Mutex::new(Some(down)));
            let failed = slot.clone();
            let blocking_execution = execution.clone();
            let subscribed = execution.subscribe(move |handle| {
                controller.shared.blocking.submit(move || {
                    let result = run_blocking(&blocking_execution, function);
                    handle.complete_with(move || {
                        if let Some(down) = slot.lock().take() {
                            match result {
                                Ok(value) => down.success(value),
                                Err(error) => down.error(error),
                            }
                        }
                        Ok(())
                    });
                });
                Ok(())
            });
            if let Err(error) = subscribed {
                if let Some(down) = failed.lock().take() {
                    down.error(error);
                }
            }
        })
    }
}

fn run_blocking<T>(
    execution: &Execution,
    function: impl FnOnce() -> ExecResult<T>,
) -> ExecResult<T> {
    let mut output = None;
    execution.run_intercepted(ExecType::Blocking, || {
        output = Some(function()?);
        Ok(())
    })?;
    output.ok_or_else(|| ExecError::msg("blocking interceptor chain did not run the continuation"))
}

struct BlockingPool {
    runtime: Option<tokio::runtime::Runtime>,
    handle: tokio::runtime::Handle,
}

impl BlockingPool {
    fn new(max_threads: usize, thread_name: &str) -> ExecResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(max_threads)
            .thread_name(format!("{thread_name}-blocking"))
            .build()
            .map_err(ExecError::new)?;
        let handle = runtime.handle().clone();
        Ok(BlockingPool { runtime: Some(runtime), handle })
    }

    fn submit(&self, task: impl FnOnce() + Send + 'static) {
        let _ = self.handle.spawn_blocking(task);
    }
}

impl Drop for BlockingPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Builds an [`ExecController`].
pub struct ExecControllerBuilder {
    compute_threads: Option<usize>,
    max_blocking_threads: usize,
    thread_name: String,
    interceptors: Vec<Arc<dyn ExecInterceptor>>,
}

impl ExecControllerBuilder {
    pub fn compute_threads(mut self, threads: usize) -> Self {
        self.compute_threads = Some(threads);
        self
    }

    pub fn max_blocking_threads(mut self, threads: usize) -> Self {
        self.max_blocking_threads = threads;
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Controller-wide interceptor; the set is fixed once built.
    pub fn interceptor(mut self, interceptor: Arc<dyn ExecInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn config(mut self, config: &ExecConfig) -> Self {
        self.compute_threads = config.compute_threads;
        self.max_blocking_threads = config.max_blocking_threads;
        self.thread_name = config.thread_name.clone();
        self
    }

    pub fn build(self) -> ExecResult<ExecController> {
        let threads = self.compute_threads.unwrap_or_else(default_compute_threads).max(1);
        let event_loops = EventLoopGroup::new(threads, &self.thread_name)?;
        let blocking = BlockingPool::new(self.max_blocking_threads.max(1), &self.thread_name)?;
        Ok(ExecController {
            shared: Arc::new(ControllerShared {
                event_loops,
                blocking,
                interceptors: self.interceptors.into(),
            }),
        })
    }
}

fn default_compute_threads() -> usize {
    std::thread::available_parallelism()
        .map(|parallelism| parallelism.get() * 2)
        .unwrap_or(2)
}

type RegistryInit = Box<dyn FnOnce(&Execution) -> ExecResult<()> + Send + 'static>;

/// Describes and starts one execution.
pub struct ExecStarter {
    controller: ExecController,
    on_error: Option<ErrorHook>,
    on_complete: Option<CompletionHook>,
    registry_init: Option<RegistryInit>,
}

impl ExecStarter {
    /// Hook receiving user errors routed out of segments. May be invoked
    /// more than once over the life of the execution.
    pub fn on_error(
        mut self,
        hook: impl Fn(&Execution, ExecError) -> ExecResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Box::new(hook));
        self
    }

    /// Hook running once the terminal marker has been processed and the
    /// stream has emptied, before cleanup hooks.
    pub fn on_complete(
        mut self,
        hook: impl FnOnce(&Execution) -> ExecResult<()> + Send + 'static,
    ) -> Self {
        self.on_complete = Some(Box::new(hook));
        self
    }

    /// Seed the execution's registry overlay before the first segment runs.
    pub fn register(
        mut self,
        init: impl FnOnce(&Execution) -> ExecResult<()> + Send + 'static,
    ) -> Self {
        self.registry_init = Some(Box::new(init));
        self
    }

    /// Start the execution with `action` as its first user-code segment.
    /// Completion is observed through the hooks.
    pub fn start(self, action: impl FnOnce(&Execution) -> ExecResult<()> + Send + 'static) {
        let on_error = self.on_error.unwrap_or_else(|| {
            Box::new(|_execution: &Execution, error: ExecError| {
                tracing::error!(error = %error, "unhandled execution error");
                Ok(())
            })
        });
        let on_complete = self
            .on_complete
            .unwrap_or_else(|| Box::new(|_execution: &Execution| Ok(())));

        let event_loop = self.controller.shared.event_loops.next_loop();
        let interceptors = self.controller.shared.interceptors.clone();
        let execution =
            Execution::create(self.controller, event_loop, interceptors, on_error, on_complete);

        let init_result = match self.registry_init {
            Some(init) => init(&execution),
            None => Ok(()),
        };
        execution.snapshot_registry_interceptors();

        let in_segment = execution.clone();
        let initial: UserSegment = match init_result {
            Ok(()) => Box::new(move || action(&in_segment)),
            Err(error) => Box::new(move || Err(error)),
        };
        execution.enqueue_initial(initial);
        execution.drain();
    }
}
