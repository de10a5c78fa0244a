use std::time::Duration;

/// Knobs for one runtime instance. Hosts fill these from flags; nothing is
/// read from files.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeOptions {
    /// Glide animation step.
    pub tick: Duration,
    /// How often a `wait until` condition is re-evaluated.
    pub poll_interval: Duration,
    /// How long a mouse sync waits for the host before using the last known
    /// position.
    pub mouse_timeout: Duration,
    /// Broadcast records kept for diagnostics.
    pub history_capacity: usize,
    /// Statements one task may execute before a warning is logged.
    pub step_warning: u64,
    pub seed: u64,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            tick: Duration::from_micros(16_667),
            poll_interval: Duration::from_micros(16_667),
            mouse_timeout: Duration::from_millis(50),
            history_capacity: 100,
            step_warning: 1_000_000,
            seed: 0x5eed,
        }
    }
}

impl RuntimeOptions {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }
}
