pub mod batch;
pub mod caching;
pub mod controller;
pub(crate) mod event_loop;
pub mod execution;
pub mod interceptor;
pub mod promise;
pub mod throttle;

pub use batch::parallel;
pub use caching::CachedPromise;
pub use controller::{ExecController, ExecControllerBuilder, ExecStarter};
pub use execution::{Execution, StreamHandle};
pub use interceptor::{Continuation, ExecInterceptor, ExecType};
pub use promise::{sleep, Downstream, Outcome, Promise};
pub use throttle::Throttle;
