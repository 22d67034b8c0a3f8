//! Daemon role: the per-rack page engine.
//!
//! The daemon owns its rack's CXL region, serves local clients over the
//! message queue, and talks to the master and to peer daemons for pages it
//! does not hold. The access path in [`access`] decides per request
//! between a local ref, proxy RDMA, and page migration.

pub mod access;
pub mod broadcast;
pub mod migrate;
pub mod page_table;
pub mod remote_cache;
pub mod service;

use std::sync::Arc;

use keylock::LockRegistry;
use shardmap::ShardMap;

use crate::config::DaemonOptions;
use crate::cxl::CxlRegion;
use crate::rdma::DmaAllocator;
use crate::rpc::ConnManager;
use crate::stats::DaemonStats;
use crate::types::{MacId, PageId, RackId};

pub use page_table::{PageMetadata, PageTable};
pub use remote_cache::RemotePageMeta;

pub struct DaemonContext {
    pub options: DaemonOptions,
    pub daemon_id: MacId,
    pub rack_id: RackId,
    pub cxl: Arc<CxlRegion>,
    pub page_table: PageTable,
    /// Heat and RDMA handles for pages this daemon proxies for.
    pub hot_stats: ShardMap<PageId, Arc<RemotePageMeta>>,
    /// Per-page ref latches guarding `PageMetadata` internals and the
    /// proxy-vs-migrate decision.
    pub page_ref_lock: LockRegistry<PageId>,
    pub conns: ConnManager,
    pub dma: Arc<dyn DmaAllocator>,
    pub stats: DaemonStats,
}

impl DaemonContext {
    pub fn new(
        options: DaemonOptions,
        daemon_id: MacId,
        cxl: Arc<CxlRegion>,
        dma: Arc<dyn DmaAllocator>,
    ) -> Self {
        let rack_id = options.rack_id;
        let page_table = PageTable::new(options.cxl_slab_count);
        Self {
            options,
            daemon_id,
            rack_id,
            cxl,
            page_table,
            hot_stats: ShardMap::new(),
            page_ref_lock: LockRegistry::new(),
            conns: ConnManager::new(),
            dma,
            stats: DaemonStats::default(),
        }
    }
}
