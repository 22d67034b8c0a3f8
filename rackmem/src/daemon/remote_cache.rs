//! Cached metadata for pages this daemon proxies for.

use hotness::DecayCounter;
use parking_lot::Mutex;

use crate::types::MacId;

/// One entry of the hot-stats map: the owner's RDMA handle for the page
/// plus the access-heat counter driving the proxy/migrate decision.
///
/// Created on first miss; destroyed when this daemon becomes the owner or
/// when the owner invalidates the ref. Entry identity (`Arc::ptr_eq`)
/// witnesses concurrent migrations across latch-upgrade gaps.
pub struct RemotePageMeta {
    pub remote_page_addr: u64,
    pub remote_page_rkey: u32,
    pub remote_daemon_id: MacId,
    pub stats: Mutex<DecayCounter>,
}

impl RemotePageMeta {
    pub fn new(addr: u64, rkey: u32, daemon_id: MacId, lambda: f64, window_us: u64) -> Self {
        Self {
            remote_page_addr: addr,
            remote_page_rkey: rkey,
            remote_daemon_id: daemon_id,
            stats: Mutex::new(DecayCounter::new(lambda, window_us)),
        }
    }
}
