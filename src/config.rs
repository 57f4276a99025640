//! Controller configuration.

use serde::{Deserialize, Serialize};

/// Configuration for the execution controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Number of event-loop threads; `None` means twice the logical CPU count.
    #[serde(default)]
    pub compute_threads: Option<usize>,
    /// Upper bound on threads in the blocking pool.
    #[serde(default = "default_max_blocking_threads")]
    pub max_blocking_threads: usize,
    /// Prefix for runtime thread names.
    #[serde(default = "default_thread_name")]
    pub thread_name: String,
}

fn default_max_blocking_threads() -> usize {
    512
}

fn default_thread_name() -> String {
    "xexec-compute".to_string()
}

impl Default for ExecConfig {
    fn default() -> Self {
        ExecConfig {
            compute_threads: None,
            max_blocking_threads: default_max_blocking_threads(),
            thread_name: default_thread_name(),
        }
    }
}
