//! Configuration for the broker's liveness, write, and queueing behavior.

use std::time::Duration;

/// Broker configuration
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Maximum time a single write to a client's port may take before the
    /// write counts as failed and the client is evicted.
    pub write_timeout: Option<Duration>,

    /// Evict registered clients that have sent nothing (not even a ping)
    /// for this long. `None` disables the liveness sweep.
    pub client_timeout: Option<Duration>,

    /// How often the liveness sweep runs
    pub sweep_interval: Duration,

    /// Frames decoded by port readers but not yet handled by the broker
    /// loop. Readers wait once this many are queued.
    pub inbound_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            write_timeout: Some(Duration::from_secs(1)),
            // Three missed heartbeats at the client's default 5s interval
            client_timeout: Some(Duration::from_secs(15)),
            sweep_interval: Duration::from_secs(5),
            inbound_capacity: 1024,
        }
    }
}

impl BrokerConfig {
    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Configure the liveness sweep; `None` disables it.
    pub fn with_client_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.client_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Bound the inbound queue; clamped to at least one slot.
    pub fn with_inbound_capacity(mut self, capacity: usize) -> Self {
        self.inbound_capacity = capacity.max(1);
        self
    }
}
