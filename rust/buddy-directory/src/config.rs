use std::time::Duration;

#[derive(Debug, Clone)]
pub struct GadgetConfig {
    /// How long a property fetch may stay in flight before it is abandoned.
    pub fetch_timeout: Duration,
    /// Interval at which the event loop sweeps for expired fetches.
    pub sweep_interval: Duration,
    pub command_queue_size: usize,
    /// Capacity of the membership and property broadcast channels.
    pub event_capacity: usize,
    /// Ask the directory for a buddy's properties when the point query fails.
    pub fallback_to_directory: bool,
}

impl Default for GadgetConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
            command_queue_size: 100,
            event_capacity: 1000,
            fallback_to_directory: true,
        }
    }
}

impl GadgetConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_command_queue_size(mut self, size: usize) -> Self {
        self.command_queue_size = size;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn with_directory_fallback(mut self, enabled: bool) -> Self {
        self.fallback_to_directory = enabled;
        self
    }
}
