//! Structural properties of the runtime: segment ordering, interception,
//! registry semantics, hook isolation, and thread management.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use xexec::{
    check_all, sleep, Continuation, ExecController, ExecError, ExecInterceptor, ExecResult,
    ExecType, Execution, HealthCheck, HealthCheckResult, Promise, Registry,
};

const WAIT: Duration = Duration::from_secs(10);

fn controller() -> ExecController {
    ExecController::builder()
        .compute_threads(2)
        .thread_name("property-exec")
        .build()
        .expect("controller build")
}

#[derive(Default)]
struct OverlapDetector {
    in_segment: AtomicBool,
    overlaps: AtomicUsize,
    segments: AtomicUsize,
}

impl ExecInterceptor for OverlapDetector {
    fn intercept(
        &self,
        _execution: &Execution,
        _exec_type: ExecType,
        continuation: Continuation<'_>,
    ) -> ExecResult<()> {
        if self.in_segment.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.segments.fetch_add(1, Ordering::SeqCst);
        let result = continuation.resume();
        self.in_segment.store(false, Ordering::SeqCst);
        result
    }
}

struct NamedInterceptor {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

impl ExecInterceptor for NamedInterceptor {
    fn intercept(
        &self,
        _execution: &Execution,
        _exec_type: ExecType,
        continuation: Continuation<'_>,
    ) -> ExecResult<()> {
        self.log.lock().unwrap().push(self.name.to_string());
        continuation.resume()
    }
}

#[test]
fn test_segments_of_one_execution_never_overlap() {
    let controller = ExecController::builder()
        .compute_threads(4)
        .thread_name("overlap-exec")
        .build()
        .expect("controller build");
    let (done_tx, done_rx) = channel::<usize>();
    let detectors: Vec<Arc<OverlapDetector>> =
        (0..8).map(|_| Arc::new(OverlapDetector::default())).collect();

    for (i, detector) in detectors.iter().enumerate() {
        let done_tx = done_tx.clone();
        let interceptor: Arc<dyn ExecInterceptor> = detector.clone();
        controller
            .fork()
            .register(move |execution| {
                execution.add::<Arc<dyn ExecInterceptor>>(interceptor);
                Ok(())
            })
            .on_complete(move |_execution| {
                let _ = done_tx.send(i);
                Ok(())
            })
            .start(move |execution| {
                execution
                    .controller()
                    .blocking(|| Ok(5))
                    .flat_map(|n: i32| sleep(Duration::from_millis(5)).map(move |_| n))
                    .map(|n| n * 2)
                    .then(|_n| Ok(()))
            });
    }

    for _ in 0..8 {
        done_rx.recv_timeout(WAIT).unwrap();
    }
    for detector in detectors {
        assert_eq!(detector.overlaps.load(Ordering::SeqCst), 0);
        assert!(detector.segments.load(Ordering::SeqCst) >= 2);
    }
}

#[test]
fn test_segments_in_one_event_run_in_fifo_order() {
    let controller = controller();
    let (tx, rx) = channel::<&'static str>();
    let inline_tx = tx.clone();
    let first_tx = tx.clone();
    let second_tx = tx;

    controller.fork().start(move |_execution| {
        Promise::of(1).then(move |_| {
            let _ = first_tx.send("c1");
            Ok(())
        })?;
        Promise::of(2).then(move |_| {
            let _ = second_tx.send("c2");
            Ok(())
        })?;
        let _ = inline_tx.send("action-end");
        Ok(())
    });

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "action-end");
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "c1");
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "c2");
}

#[test]
fn test_nested_segments_precede_parent_siblings() {
    let controller = controller();
    let (tx, rx) = channel::<&'static str>();
    let injected_tx = tx.clone();
    let sibling_tx = tx;

    controller.fork().start(move |execution| {
        execution.subscribe(move |handle| {
            handle.event(move || {
                let _ = injected_tx.send("u");
                Ok(())
            });
            handle.complete();
            Ok(())
        })?;
        execution.subscribe(move |handle| {
            let _ = sibling_tx.send("p1");
            handle.complete();
            Ok(())
        })?;
        Ok(())
    });

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "u");
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "p1");
}

#[test]
fn test_interceptors_run_global_then_registry_then_adhoc() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let controller = ExecController::builder()
        .compute_threads(1)
        .thread_name("interceptor-exec")
        .interceptor(Arc::new(NamedInterceptor { name: "global", log: log.clone() }))
        .build()
        .expect("controller build");

    let (tx, rx) = channel::<()>();
    let registry_interceptor: Arc<dyn ExecInterceptor> =
        Arc::new(NamedInterceptor { name: "registry", log: log.clone() });
    let adhoc_interceptor: Arc<dyn ExecInterceptor> =
        Arc::new(NamedInterceptor { name: "adhoc", log: log.clone() });

    controller
        .fork()
        .register(move |execution| {
            execution.add::<Arc<dyn ExecInterceptor>>(registry_interceptor);
            Ok(())
        })
        .on_complete(move |_execution| {
            let _ = tx.send(());
            Ok(())
        })
        .start(move |execution| {
            execution.add_interceptor(adhoc_interceptor);
            Promise::of(()).then(|_| Ok(()))
        });

    rx.recv_timeout(WAIT).unwrap();
    let log = log.lock().unwrap();
    // The initial action sees global + registry; the consumer segment also
    // sees the ad-hoc interceptor added during the action.
    assert_eq!(*log, vec!["global", "registry", "global", "registry", "adhoc"]);
}

#[test]
fn test_failing_cleanup_hook_does_not_suppress_later_hooks() {
    let controller = controller();
    let (tx, rx) = channel::<&'static str>();
    let complete_tx = tx.clone();
    let second_tx = tx;

    controller
        .fork()
        .on_complete(move |_execution| {
            let _ = complete_tx.send("complete");
            Ok(())
        })
        .start(move |execution| {
            execution.on_cleanup(|| Err(ExecError::msg("cleanup failure")));
            execution.on_cleanup(move || {
                let _ = second_tx.send("second-hook");
                Ok(())
            });
            Ok(())
        });

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "complete");
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "second-hook");
}

#[test]
fn test_current_fails_on_unmanaged_thread() {
    let error = Execution::current().unwrap_err();
    assert!(error.is_unmanaged_thread());
    assert!(Execution::try_current().is_none());
}

#[test]
fn test_promise_in_cleanup_hook_fails_as_completed() {
    let controller = controller();
    let (tx, rx) = channel::<&'static str>();

    controller.fork().start(move |execution| {
        execution.on_cleanup(move || {
            match Promise::of(1).then(|_| Ok(())) {
                Err(error) if error.is_execution_completed() => {
                    let _ = tx.send("completed-error");
                }
                _ => {
                    let _ = tx.send("unexpected");
                }
            }
            Ok(())
        });
        Ok(())
    });

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "completed-error");
}

#[derive(Debug)]
struct ServiceName(&'static str);

#[derive(Debug)]
struct RequestId(String);

#[test]
fn test_execution_overlay_joins_with_request_registry() {
    let controller = controller();
    let (tx, rx) = channel::<(String, String)>();

    controller
        .fork()
        .register(|execution| {
            execution.add(ServiceName("billing"));
            Ok(())
        })
        .start(move |execution| {
            let request = Registry::single(RequestId("r-17".to_string()));
            let joined = execution.join(request);
            let service = joined.get::<ServiceName>()?;
            let request_id = joined.get::<RequestId>()?;
            let _ = tx.send((service.0.to_string(), request_id.0.clone()));
            Ok(())
        });

    let (service, request_id) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(service, "billing");
    assert_eq!(request_id, "r-17");
}

struct StaticCheck {
    check_name: &'static str,
    healthy: bool,
}

impl HealthCheck for StaticCheck {
    fn name(&self) -> &str {
        self.check_name
    }

    fn check(&self, _registry: &Registry) -> Promise<HealthCheckResult> {
        if self.healthy {
            Promise::of(HealthCheckResult::healthy())
        } else {
            Promise::error(ExecError::msg("dependency down"))
        }
    }
}

#[test]
fn test_check_all_reports_failed_checks_as_unhealthy() {
    let controller = controller();
    let registry = Registry::builder()
        .add::<Arc<dyn HealthCheck>>(Arc::new(StaticCheck { check_name: "ok", healthy: true }))
        .add::<Arc<dyn HealthCheck>>(Arc::new(StaticCheck { check_name: "db", healthy: false }))
        .build();

    let (tx, rx) = channel::<Vec<(String, bool, Option<String>)>>();
    controller.fork().start(move |_execution| {
        check_all(&registry).then(move |results| {
            let mut summary: Vec<(String, bool, Option<String>)> = results
                .into_iter()
                .map(|(name, result)| (name, result.healthy, result.message))
                .collect();
            summary.sort();
            let _ = tx.send(summary);
            Ok(())
        })
    });

    let summary = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(summary.len(), 2);
    assert_eq!(summary[0].0, "db");
    assert!(!summary[0].1);
    assert_eq!(summary[0].2.as_deref(), Some("dependency down"));
    assert_eq!(summary[1].0, "ok");
    assert!(summary[1].1);
    assert_eq!(summary[1].2, None);
}
