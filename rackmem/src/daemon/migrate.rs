//! Migration protocol, current-owner side.

use log::debug;

use crate::daemon::{broadcast, DaemonContext};
use crate::proto::daemon::*;
use crate::rdma::RdmaBatch;
use crate::types::PAGE_SIZE;

/// Hand `req.page_id` over to the requesting daemon, optionally taking its
/// victim page in exchange.
///
/// The requester holds the master's exclusive latch on the page (and on
/// the victim) for the whole exchange, so no new proxy can latch in
/// meanwhile. Locally we invalidate every other reference first, then move
/// both pages in one batched RDMA submission: write our slab into the
/// requester's reserved slab, and if a swap is requested, read the
/// victim's slab into a freshly reserved local one.
///
/// A future policy may decline based on `req.hot_score`; the current
/// policy always accepts, and `swapped` only reports whether a victim
/// moved.
pub fn try_migrate_page(ctx: &DaemonContext, req: TryMigratePageRequest) -> TryMigratePageReply {
    ctx.stats
        .page_swap
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    let _ref_guard = ctx.page_ref_lock.unique(req.page_id);

    let page_meta = ctx
        .page_table
        .table
        .get(&req.page_id)
        .unwrap_or_else(|| panic!("migrate of non-resident page {}", req.page_id));

    debug!(
        "daemon {}: migrate page {} to daemon {} (swap page {})",
        ctx.daemon_id, req.page_id, req.mac_id, req.swap_page_id
    );

    // The requester already dropped its own ref by starting the migration.
    broadcast::del_page_ref_and_cache(ctx, req.page_id, &page_meta, Some(req.mac_id));

    let requester = ctx
        .conns
        .daemon(req.mac_id)
        .expect("migration requester not connected");

    let mut batch = RdmaBatch::new();
    batch.prep_write(
        ctx.cxl.virtual_addr(page_meta.cxl_offset()),
        ctx.cxl.rkey(),
        PAGE_SIZE,
        req.swapin_page_addr,
        req.swapin_page_rkey,
    );

    let is_swap = !(req.swapout_page_addr == 0 && req.swapout_page_rkey == 0);
    let mut victim_meta = None;
    if is_swap {
        // The victim lands in a freshly reserved local slab.
        let meta = ctx
            .page_table
            .alloc_page_memory()
            .expect("no slab for inbound swap page");
        batch.prep_read(
            ctx.cxl.virtual_addr(meta.cxl_offset()),
            ctx.cxl.rkey(),
            PAGE_SIZE,
            req.swapout_page_addr,
            req.swapout_page_rkey,
        );
        victim_meta = Some(meta);
    }

    let fu = requester.rdma.submit(batch);
    while fu.try_get() != 0 {
        std::thread::yield_now();
    }

    ctx.page_table.cancel_page_memory(req.page_id, &page_meta);
    if let Some(meta) = victim_meta {
        ctx.page_table.apply_page_memory(req.swap_page_id, meta);
    }

    TryMigratePageReply { swapped: is_swap }
}

/// Master-initiated placement of freshly allocated page ids into local
/// slabs (the spill portion of a cross-rack `allocPage`).
pub fn alloc_page_memory(ctx: &DaemonContext, req: AllocPageMemoryRequest) -> AllocPageMemoryReply {
    assert!(
        ctx.page_table.test_alloc_page_memory(req.count),
        "can't allocate {} more page slabs",
        req.count
    );

    for c in 0..req.count {
        let meta = ctx
            .page_table
            .alloc_page_memory()
            .expect("slab free list raced below quota");
        ctx.page_table
            .apply_page_memory(req.start_page_id + c as u64, meta);
    }

    AllocPageMemoryReply { ret: true }
}
