//! Master-side RPC handlers.

use std::sync::Arc;

use log::{debug, info};
use shardmap::ShardMap;

use crate::error::Error;
use crate::master::directory::{IdAllocator, PageDirectory, PageOwner, RackTable};
use crate::proto::master::*;
use crate::rpc::{DaemonConn, DaemonRpc, RpcFuture};
use crate::stats::MasterStats;
use crate::types::{MacId, PageId, RackId, INVALID_PAGE_ID, MASTER_MAC_ID};

/// Cluster membership: racks, their daemons, and the mac id allocator.
pub struct ClusterManager {
    pub mac_ids: IdAllocator,
    racks: ShardMap<RackId, Arc<RackTable>>,
    conns: ShardMap<MacId, Arc<DaemonConn>>,
}

impl Default for ClusterManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterManager {
    pub fn new() -> Self {
        Self {
            mac_ids: IdAllocator::unbounded(),
            racks: ShardMap::new(),
            conns: ShardMap::new(),
        }
    }

    pub fn rack(&self, rack_id: RackId) -> crate::Result<Arc<RackTable>> {
        self.racks.get(&rack_id).ok_or(Error::RackNotFound(rack_id))
    }

    pub fn daemon(&self, mac_id: MacId) -> crate::Result<Arc<DaemonConn>> {
        self.conns.get(&mac_id).ok_or(Error::ConnNotFound(mac_id))
    }

    pub fn racks(&self) -> Vec<Arc<RackTable>> {
        let mut out = Vec::new();
        self.racks.for_each(|_, r| {
            out.push(r.clone());
            true
        });
        out
    }
}

pub struct MasterContext {
    pub master_id: MacId,
    pub cluster: ClusterManager,
    pub directory: PageDirectory,
    pub stats: MasterStats,
}

impl Default for MasterContext {
    fn default() -> Self {
        Self::new()
    }
}

impl MasterContext {
    pub fn new() -> Self {
        Self {
            master_id: MASTER_MAC_ID,
            cluster: ClusterManager::new(),
            directory: PageDirectory::new(),
            stats: MasterStats::default(),
        }
    }
}

/// A new daemon joins: allocate its mac id, record its rack, grow the page
/// id space by the rack's capacity, and tell it about every rack already
/// present so it can cross-connect.
///
/// Invoked by the transport's accept path, which supplies the call surface
/// of the joining daemon.
pub fn join_daemon(
    ctx: &MasterContext,
    rpc: Arc<dyn DaemonRpc>,
    rdma: Arc<dyn crate::rdma::RdmaConn>,
    req: JoinDaemonRequest,
) -> JoinDaemonReply {
    let mac_id: MacId = ctx
        .cluster
        .mac_ids
        .gen()
        .expect("mac id allocation failed")
        .try_into()
        .expect("mac id overflowed MacId width");

    let other_racks: Vec<RackInfo> = ctx
        .cluster
        .racks()
        .iter()
        .map(|r| RackInfo {
            rack_id: r.rack_id,
            daemon_id: r.daemon.daemon_id,
            ip: r.daemon.ip.clone(),
            port: r.daemon.port,
        })
        .collect();

    assert!(
        ctx.cluster.rack(req.rack_id).is_err(),
        "reconnect of rack {} daemon",
        req.rack_id
    );

    let conn = Arc::new(DaemonConn {
        daemon_id: mac_id,
        rack_id: req.rack_id,
        ip: req.ip.clone(),
        port: req.port,
        rpc,
        rdma,
    });
    let rack = Arc::new(RackTable::new(
        req.rack_id,
        req.with_cxl,
        req.free_page_num,
        conn.clone(),
    ));
    ctx.cluster.racks.insert(req.rack_id, rack);
    ctx.cluster.conns.insert(mac_id, conn);

    ctx.directory.page_ids.expand(req.free_page_num);

    info!("connect with daemon [rack:{} --- id:{}]", req.rack_id, mac_id);

    JoinDaemonReply {
        daemon_mac_id: mac_id,
        master_mac_id: ctx.master_id,
        rdma_port: 0,
        other_racks,
    }
}

pub fn join_client(ctx: &MasterContext, req: JoinClientRequest) -> JoinClientReply {
    let rack = ctx
        .cluster
        .rack(req.rack_id)
        .expect("join_client for unknown rack");
    let mac_id: MacId = ctx
        .cluster
        .mac_ids
        .gen()
        .expect("mac id allocation failed")
        .try_into()
        .expect("mac id overflowed MacId width");
    rack.clients.write().push(mac_id);

    info!("connect with client [rack:{} --- id:{}]", req.rack_id, mac_id);

    JoinClientReply { mac_id }
}

/// Allocate `count` consecutive page ids, placing as many as the quota
/// allows on the requester's rack and spilling the rest across other racks
/// in iteration order.
pub fn alloc_page(ctx: &MasterContext, req: AllocPageRequest) -> AllocPageReply {
    let conn = ctx
        .cluster
        .daemon(req.mac_id)
        .expect("alloc_page from unknown daemon");
    let rack = ctx
        .cluster
        .rack(conn.rack_id)
        .expect("daemon without rack table");

    let start = ctx
        .directory
        .page_ids
        .multi_gen(req.count)
        .expect("no usable page");

    let near_count = req.count.min(rack.free_quota());
    for i in 0..near_count {
        ctx.directory.add_page(&rack, start + i as u64);
    }

    let mut remaining = req.count - near_count;
    let mut next_idx = near_count;

    if remaining > 0 {
        struct SpillAlloc {
            fu: RpcFuture<crate::proto::daemon::AllocPageMemoryReply>,
            rack: Arc<RackTable>,
            start: PageId,
            count: usize,
        }
        let mut spills = Vec::new();

        for other in ctx.cluster.racks() {
            if remaining == 0 {
                break;
            }
            let n = remaining.min(other.free_quota());
            if n == 0 {
                continue;
            }
            let spill_start = start + next_idx as u64;
            let fu = other
                .daemon
                .rpc
                .alloc_page_memory(crate::proto::daemon::AllocPageMemoryRequest {
                    mac_id: ctx.master_id,
                    start_page_id: spill_start,
                    count: n,
                });
            spills.push(SpillAlloc {
                fu,
                rack: other.clone(),
                start: spill_start,
                count: n,
            });
            next_idx += n;
            remaining -= n;
        }

        assert_eq!(
            remaining, 0,
            "{}",
            Error::CapacityExceeded("cluster page quota")
        );

        for spill in spills {
            spill.fu.wait();
            for i in 0..spill.count {
                ctx.directory.add_page(&spill.rack, spill.start + i as u64);
            }
        }
    }

    debug!(
        "alloc {} pages from daemon {}: start={} near={}",
        req.count, req.mac_id, start, near_count
    );

    AllocPageReply {
        start_page_id: start,
        start_count: near_count,
    }
}

pub fn free_page(_ctx: &MasterContext, _req: FreePageRequest) -> FreePageReply {
    panic!("{}", Error::Unsupported("freePage"));
}

/// Latch a page (and optionally its swap partner) for a proxy read or a
/// migration, and report the page's current owner.
///
/// Pairs are always acquired in ascending page id order, so two daemons
/// swapping the same pair in opposite directions cannot deadlock.
pub fn latch_remote_page(ctx: &MasterContext, req: LatchRemotePageRequest) -> LatchRemotePageReply {
    assert_ne!(req.page_id, INVALID_PAGE_ID, "latch of invalid page");
    assert_ne!(
        req.page_id, req.page_id_swap,
        "can't latch page {} twice",
        req.page_id
    );

    let meta = ctx
        .directory
        .find(req.page_id)
        .unwrap_or_else(|_| panic!("can't find page {}", req.page_id));

    if req.page_id_swap == INVALID_PAGE_ID {
        if req.is_write_lock {
            meta.latch.lock();
        } else {
            meta.latch.lock_shared();
        }
    } else {
        let swap_meta = ctx
            .directory
            .find(req.page_id_swap)
            .unwrap_or_else(|_| panic!("can't find page {}", req.page_id_swap));

        let (first, second) = if req.page_id < req.page_id_swap {
            (&meta, &swap_meta)
        } else {
            (&swap_meta, &meta)
        };
        if req.is_write_lock {
            first.latch.lock();
            second.latch.lock();
        } else {
            first.latch.lock_shared();
            second.latch.lock_shared();
        }
    }

    let owner = meta.owner();
    LatchRemotePageReply {
        dest_rack_id: owner.rack_id,
        dest_daemon_id: owner.daemon_id,
    }
}

/// Release the shared latch held for a proxy operation.
pub fn unlatch_remote_page(
    ctx: &MasterContext,
    req: UnlatchRemotePageRequest,
) -> UnlatchRemotePageReply {
    let meta = ctx
        .directory
        .find(req.page_id)
        .unwrap_or_else(|_| panic!("can't find page {}", req.page_id));
    meta.latch.unlock_shared();
    UnlatchRemotePageReply { ret: true }
}

/// Commit a migration: update ownership of the migrated page (and its swap
/// partner), then release the exclusive latches. Both directory entries are
/// updated before either latch is released, so no observer sees a
/// half-applied swap.
pub fn unlatch_page_and_swap(
    ctx: &MasterContext,
    req: UnlatchPageAndSwapRequest,
) -> UnlatchPageAndSwapReply {
    let meta = ctx
        .directory
        .find(req.page_id)
        .unwrap_or_else(|_| panic!("can't find page {}", req.page_id));
    meta.set_owner(PageOwner {
        rack_id: req.new_rack_id,
        daemon_id: req.new_daemon_id,
    });

    if req.page_id_swap != INVALID_PAGE_ID {
        let swap_meta = ctx
            .directory
            .find(req.page_id_swap)
            .unwrap_or_else(|_| panic!("can't find page {}", req.page_id_swap));
        swap_meta.set_owner(PageOwner {
            rack_id: req.new_rack_id_swap,
            daemon_id: req.new_daemon_id_swap,
        });
        meta.latch.unlock();
        swap_meta.latch.unlock();
        debug!(
            "swap page {} -> daemon {}, page {} -> daemon {}",
            req.page_id, req.new_daemon_id, req.page_id_swap, req.new_daemon_id_swap
        );
    } else {
        meta.latch.unlock();
        debug!("move page {} -> daemon {}", req.page_id, req.new_daemon_id);
    }

    ctx.stats
        .page_swap
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    UnlatchPageAndSwapReply { ret: true }
}
