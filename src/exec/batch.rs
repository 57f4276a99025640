//! Parallel fan-out/fan-in.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::ExecError;

use super::execution::Execution;
use super::promise::{Outcome, Promise};

/// Run each named promise on its own freshly started execution and deliver
/// the combined outcomes once every one has terminated.
///
/// Because each unit gets its own execution, the batch never deadlocks even
/// when the calling execution is itself gated by a throttle.
pub fn parallel<T: Send + 'static>(
    promises: Vec<(String, Promise<T>)>,
) -> Promise<HashMap<String, Outcome<T>>> {
    Promise::from_async(move |down| {
        let execution = match Execution::try_current() {
            Some(execution) => execution,
            None => {
                down.error(ExecError::unmanaged_thread());
                return;
            }
        };
        let total = promises.len();
        if total == 0 {
            down.success(HashMap::new());
            return;
        }
        let controller = execution.controller().clone();
        let results: Arc<Mutex<HashMap<String, Outcome<T>>>> =
            Arc::new(Mutex::new(HashMap::with_capacity(total)));
        let remaining = Arc::new(AtomicUsize::new(total));
        let down = Arc::new(Mutex::new(Some(down)));

        for (name, promise) in promises {
            let record = {
                let results = results.clone();
                let remaining = remaining.clone();
                let down = down.clone();
                move |outcome: Outcome<T>| {
                    results.lock().insert(name, outcome);
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        if let Some(down) = down.lock().take() {
                            let combined = std::mem::take(&mut *results.lock());
                            down.success(combined);
                        }
                    }
                }
            };
            // One recording per unit, whichever of the terminal consumer or
            // the execution error hook gets there first.
            let slot = Arc::new(Mutex::new(Some(record)));
            let error_slot = slot.clone();
            controller
                .fork()
                .on_error(move |_execution, error| {
                    if let Some(record) = error_slot.lock().take() {
                        record(Outcome::Error(error));
                    }
                    Ok(())
                })
                .start(move |_execution| {
                    promise.result(move |outcome| {
                        if let Some(record) = slot.lock().take() {
                            record(outcome);
                        }
                        Ok(())
                    })
                });
        }
    })
}
