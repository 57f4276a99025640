//! Health-check contract over the execution runtime.
//!
//! Checks are registered in a [`Registry`] as `Arc<dyn HealthCheck>` values;
//! [`check_all`] runs each one on its own execution and reports a check
//! whose promise fails as unhealthy rather than failing the whole sweep.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::exec::{parallel, Outcome, Promise};
use crate::registry::Registry;

/// Result of one health check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HealthCheckResult {
    pub fn healthy() -> Self {
        HealthCheckResult { healthy: true, message: None }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        HealthCheckResult { healthy: false, message: Some(message.into()) }
    }
}

/// A named check reporting the health of some component asynchronously.
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;

    fn check(&self, registry: &Registry) -> Promise<HealthCheckResult>;
}

/// Run every [`HealthCheck`] registered in `registry`, each on its own
/// execution, and deliver results keyed by check name.
pub fn check_all(registry: &Registry) -> Promise<HashMap<String, HealthCheckResult>> {
    let promises: Vec<(String, Promise<HealthCheckResult>)> = registry
        .get_all::<Arc<dyn HealthCheck>>()
        .iter()
        .map(|check| {
            let check = Arc::clone(&**check);
            let name = check.name().to_string();
            let promise = check
                .check(registry)
                .map_error(|error| Ok(HealthCheckResult::unhealthy(error.to_string())));
            (name, promise)
        })
        .collect();

    parallel(promises).map(|outcomes| {
        outcomes
            .into_iter()
            .map(|(name, outcome)| {
                let result = match outcome {
                    Outcome::Success(result) => result,
                    Outcome::Error(error) => HealthCheckResult::unhealthy(error.to_string()),
                    Outcome::Complete => {
                        HealthCheckResult::unhealthy("health check finished without a result")
                    }
                };
                (name, result)
            })
            .collect()
    })
}
