//! Configuration types for the pool roles.

use crate::types::RackId;

/// Configuration for a rack daemon.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    /// Rack this daemon serves.
    pub rack_id: RackId,
    /// Whether the rack exposes a CXL memory region.
    pub with_cxl: bool,
    /// Number of 2 MiB slabs carved out of the CXL region.
    pub cxl_slab_count: usize,
    /// Decay-counter value at which a proxied page migrates. The check is
    /// an equality so the transition through the watermark fires once.
    pub hot_swap_watermark: u64,
    /// Decay constant of the hot-access counter, in 1/µs.
    pub hot_decay_lambda: f64,
    /// Coalescing window of the hot-access counter, in µs.
    pub hot_stat_window_us: u64,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            rack_id: 0,
            with_cxl: true,
            cxl_slab_count: 64,
            hot_swap_watermark: 4,
            hot_decay_lambda: 1e-4,
            hot_stat_window_us: 50,
        }
    }
}

/// Configuration for a compute client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Rack the client is colocated with.
    pub rack_id: RackId,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self { rack_id: 0 }
    }
}
