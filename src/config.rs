//! Engine configuration.

/// Limits and modes applied to a single workflow run.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum number of block executions (real and per-iteration virtual
    /// instances both count) before the run fails.
    pub max_steps: u32,
    /// Wall-clock bound for the whole run, in seconds.
    pub max_execution_time_secs: u64,
    /// Bound for a single handler call, in seconds.
    pub block_timeout_secs: u64,
    /// When set, `execute` stops after the first scheduling pass and
    /// reports the pending block set instead of running to completion.
    pub debug: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_steps: 500,
            max_execution_time_secs: 600,
            block_timeout_secs: 60,
            debug: false,
        }
    }
}
