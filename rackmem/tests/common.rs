//! Shared cluster bootstrap for the integration tests.

use rackmem::config::DaemonOptions;
use rackmem::fabric::{Cluster, ClusterBuilder};
use rackmem::types::{GlobalAddr, PageId};

/// Build a cluster with deterministic heat accounting: every access counts
/// (no coalescing window) and heat never decays, so the n-th proxy access
/// reads exactly n.
pub fn test_cluster(racks: &[(usize, usize)]) -> Cluster {
    let mut builder = ClusterBuilder::new().daemon_options(DaemonOptions {
        hot_stat_window_us: 0,
        hot_decay_lambda: 0.0,
        ..DaemonOptions::default()
    });
    for &(slab_count, client_count) in racks {
        builder = builder.rack(slab_count, client_count);
    }
    builder.build()
}

pub fn gaddr(page_id: PageId, offset: u64) -> GlobalAddr {
    GlobalAddr::new(page_id, offset)
}

/// A recognizable per-page fill pattern.
pub fn pattern(page_id: PageId, len: usize) -> Vec<u8> {
    (0..len).map(|i| (page_id as usize + i) as u8).collect()
}
