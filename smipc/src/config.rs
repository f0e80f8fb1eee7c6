//! Endpoint configuration.

/// Endpoint configuration.
///
/// Controls whether the endpoint accepts incoming peers, how it waits for
/// work, and how many upper-layer execution contexts it serves.
#[derive(Debug, Clone)]
pub struct Config {
    /// Accept incoming peers: create a shared region and a bound control
    /// socket. Default: false
    pub listen: bool,
    /// Pure-polling mode: no poll set, no event notifiers, no control
    /// socket. Progress scans rings directly. Default: false
    pub no_wait: bool,
    /// Upper bound on per-endpoint execution contexts.
    /// Default: 1
    pub max_contexts: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: false,
            no_wait: false,
            max_contexts: 1,
        }
    }
}

impl Config {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the listen flag.
    pub fn with_listen(mut self, listen: bool) -> Self {
        self.listen = listen;
        self
    }

    /// Set pure-polling mode.
    pub fn with_no_wait(mut self, no_wait: bool) -> Self {
        self.no_wait = no_wait;
        self
    }

    /// Set the maximum number of execution contexts.
    pub fn with_max_contexts(mut self, max_contexts: u8) -> Self {
        self.max_contexts = max_contexts;
        self
    }
}
