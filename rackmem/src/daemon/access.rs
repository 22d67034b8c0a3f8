//! The access path: ref, proxy, or migrate.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use log::{debug, trace};
use rand::thread_rng;

use crate::daemon::{broadcast, DaemonContext, PageMetadata, RemotePageMeta};
use crate::proto::daemon::*;
use crate::proto::{client as client_proto, master as master_proto};
use crate::rdma::RdmaBatch;
use crate::rpc::ClientConn;
use crate::types::{timestamp_us, PageId, INVALID_PAGE_ID};

/// Serve one client page access.
///
/// Local hit: record the client as a referrer and hand back the CXL
/// offset. Miss: look up (or fetch, under the master's shared latch) the
/// owner's RDMA handle, bump the page's heat, and either proxy the I/O
/// or, exactly when the heat hits the watermark, migrate the page in and
/// retry, which then lands on the hit path.
pub fn get_page_ref_or_proxy(
    ctx: &DaemonContext,
    client: &Arc<ClientConn>,
    req: GetPageRefOrProxyRequest,
) -> GetPageRefOrProxyReply {
    let page_id = req.gaddr.page_id();
    let page_offset = req.gaddr.offset();

    loop {
        let page_ref_lock = ctx.page_ref_lock.shared(page_id);

        if let Some(page_meta) = ctx.page_table.table.get(&page_id) {
            ctx.stats
                .page_hit
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            page_meta.ref_client.lock().insert(client.client_id);
            return GetPageRefOrProxyReply {
                refs: true,
                offset: page_meta.cxl_offset(),
                read_data: Vec::new(),
            };
        }

        ctx.stats
            .page_miss
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        // First miss on this page: learn the owner and take an RDMA ref,
        // all under the master's shared latch so the page cannot move
        // between the lookup and the ref.
        let (rem_page_meta, _inserted) = ctx.hot_stats.find_or_emplace(&page_id, || {
            let master = ctx.conns.master();
            let latch_resp = master
                .rpc
                .latch_remote_page(master_proto::LatchRemotePageRequest {
                    mac_id: ctx.daemon_id,
                    is_write_lock: false,
                    page_id,
                    page_id_swap: INVALID_PAGE_ID,
                })
                .wait();

            let dest = ctx
                .conns
                .daemon(latch_resp.dest_daemon_id)
                .expect("page owner not connected");

            let rref = dest
                .rpc
                .get_page_rdma_ref(GetPageRdmaRefRequest {
                    mac_id: ctx.daemon_id,
                    page_id,
                })
                .wait();

            master
                .rpc
                .unlatch_remote_page(master_proto::UnlatchRemotePageRequest {
                    mac_id: ctx.daemon_id,
                    page_id,
                })
                .wait();

            Arc::new(RemotePageMeta::new(
                rref.addr,
                rref.rkey,
                latch_resp.dest_daemon_id,
                ctx.options.hot_decay_lambda,
                ctx.options.hot_stat_window_us,
            ))
        });

        let current_hot = rem_page_meta.stats.lock().add(timestamp_us());

        // Only the exact transition through the watermark migrates; colder
        // and hotter both proxy, so the migration fires once.
        if current_hot != ctx.options.hot_swap_watermark {
            return proxy_io(ctx, &rem_page_meta, page_offset, &req);
        }

        // Upgrade the page ref latch. This is a release-then-acquire, not
        // an atomic upgrade; the identity re-check below catches anything
        // that slipped through the gap.
        drop(page_ref_lock);
        let page_ref_lock = ctx.page_ref_lock.unique(page_id);

        match ctx.hot_stats.get(&page_id) {
            Some(current) if Arc::ptr_eq(&current, &rem_page_meta) => {}
            _ => continue,
        }

        migrate_page_in(ctx, page_id, &rem_page_meta, page_ref_lock);
        // The page is now local; retry lands on the hit path.
    }
}

/// Proxy the access with one-sided RDMA against the owner's slab.
fn proxy_io(
    ctx: &DaemonContext,
    rem_page_meta: &Arc<RemotePageMeta>,
    page_offset: u64,
    req: &GetPageRefOrProxyRequest,
) -> GetPageRefOrProxyReply {
    ctx.stats
        .page_dio
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    let dest = ctx
        .conns
        .daemon(rem_page_meta.remote_daemon_id)
        .expect("page owner not connected");
    let remote_addr = rem_page_meta.remote_page_addr + page_offset;
    let rkey = rem_page_meta.remote_page_rkey;

    match req.op {
        PageOp::Read => {
            let dma = ctx.dma.alloc_dma(req.read_size);
            let mut batch = RdmaBatch::new();
            batch.prep_read(dma.addr, dma.lkey, req.read_size, remote_addr, rkey);
            let fu = dest.rdma.submit(batch);
            while fu.try_get() != 0 {
                std::thread::yield_now();
            }
            GetPageRefOrProxyReply {
                refs: false,
                offset: 0,
                read_data: dma.mem.to_vec(),
            }
        }
        PageOp::WriteRaw => {
            let dma = ctx.dma.alloc_dma(req.write_raw.len());
            dma.mem.fill_from(&req.write_raw);
            let mut batch = RdmaBatch::new();
            batch.prep_write(dma.addr, dma.lkey, req.write_raw.len(), remote_addr, rkey);
            let fu = dest.rdma.submit(batch);
            while fu.try_get() != 0 {
                std::thread::yield_now();
            }
            GetPageRefOrProxyReply {
                refs: false,
                offset: 0,
                read_data: Vec::new(),
            }
        }
        // The pull-based write would fetch the payload from the client via
        // getCurrentWriteData; its RDMA leg was never enabled upstream.
        PageOp::Write => panic!("{}", crate::Error::Unsupported("pull-based WRITE op")),
    }
}

/// A chosen swap-out victim, pinned so no concurrent chooser takes it.
struct SwapVictim {
    page_id: PageId,
    meta: Arc<PageMetadata>,
}

/// Pull the page in from its owner, swapping a victim out if the local
/// region is nearly full. Caller holds the exclusive ref latch on
/// `page_id` and has verified `rem_page_meta` is still current.
fn migrate_page_in(
    ctx: &DaemonContext,
    page_id: PageId,
    rem_page_meta: &Arc<RemotePageMeta>,
    page_ref_lock: keylock::UniqueGuard<'_, PageId>,
) {
    ctx.stats
        .page_swap
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    let dest = ctx
        .conns
        .daemon(rem_page_meta.remote_daemon_id)
        .expect("page owner not connected");

    // Reserve the slab that will receive the page.
    let page_meta = ctx
        .page_table
        .alloc_page_memory()
        .expect("no slab for inbound page");

    let victim = if ctx.page_table.nearly_full() {
        Some(choose_swap_victim(ctx))
    } else {
        None
    };

    let swap_page_id = victim.as_ref().map_or(INVALID_PAGE_ID, |v| v.page_id);

    // Exclusive ref latch on the victim, and its slab's RDMA coordinates
    // for the peer to read from.
    let (swapout_addr, swapout_rkey, swapout_ref_lock) = match &victim {
        Some(v) => (
            ctx.cxl.virtual_addr(v.meta.cxl_offset()),
            ctx.cxl.rkey(),
            Some(ctx.page_ref_lock.unique(v.page_id)),
        ),
        None => (0, 0, None),
    };

    debug!(
        "daemon {}: pull page {} from daemon {} (victim {})",
        ctx.daemon_id, page_id, dest.daemon_id, swap_page_id
    );

    let master = ctx.conns.master();
    let latch_fu = master
        .rpc
        .latch_remote_page(master_proto::LatchRemotePageRequest {
            mac_id: ctx.daemon_id,
            is_write_lock: true,
            page_id,
            page_id_swap: swap_page_id,
        });

    // While the latch is in flight, invalidate the victim everywhere. The
    // broadcast completing is what makes the later copy safe: no peer will
    // begin a new RDMA read of the victim.
    if let Some(v) = &victim {
        broadcast::del_page_ref_and_cache(ctx, v.page_id, &v.meta, None);
    }

    latch_fu.wait();

    // Drop the now-stale proxy cache for the inbound page.
    let erased = ctx
        .hot_stats
        .erase_if(&page_id, |m| Arc::ptr_eq(m, rem_page_meta));
    assert!(erased, "hot-stats entry for page {} vanished", page_id);

    let migrate_resp = dest
        .rpc
        .try_migrate_page(TryMigratePageRequest {
            mac_id: ctx.daemon_id,
            page_id,
            swap_page_id,
            hot_score: ctx.options.hot_swap_watermark,
            swapout_page_addr: swapout_addr,
            swapin_page_addr: ctx.cxl.virtual_addr(page_meta.cxl_offset()),
            swapout_page_rkey: swapout_rkey,
            swapin_page_rkey: ctx.cxl.rkey(),
        })
        .wait();

    // The page is now locally resident.
    ctx.page_table.apply_page_memory(page_id, page_meta);
    match (&victim, migrate_resp.swapped) {
        (Some(v), true) => ctx.page_table.cancel_page_memory(v.page_id, &v.meta),
        // Declined victim: the page stays put, release the pin.
        (Some(v), false) => v.meta.unpin(),
        (None, _) => {}
    }

    drop(swapout_ref_lock);
    drop(page_ref_lock);

    let (new_daemon_id_swap, new_rack_id_swap) = if migrate_resp.swapped {
        (dest.daemon_id, dest.rack_id)
    } else {
        (ctx.daemon_id, ctx.rack_id)
    };
    master
        .rpc
        .unlatch_page_and_swap(master_proto::UnlatchPageAndSwapRequest {
            mac_id: ctx.daemon_id,
            page_id,
            new_daemon_id: ctx.daemon_id,
            new_rack_id: ctx.rack_id,
            page_id_swap: swap_page_id,
            new_daemon_id_swap,
            new_rack_id_swap,
        })
        .wait();
}

/// Pick and pin a swap-out victim, in priority order: an unreferenced page
/// found by a random-start table walk, else the least recently used page
/// reported across all local clients, else any pinnable page.
fn choose_swap_victim(ctx: &DaemonContext) -> SwapVictim {
    let mut rng = thread_rng();
    let mut chosen: Option<SwapVictim> = None;

    ctx.page_table.table.random_for_each(&mut rng, |pid, meta| {
        if meta.ref_client.lock().is_empty()
            && meta.ref_daemon.lock().is_empty()
            && meta.try_pin()
        {
            chosen = Some(SwapVictim {
                page_id: *pid,
                meta: meta.clone(),
            });
            return false;
        }
        true
    });
    if let Some(v) = chosen {
        return v;
    }

    // Every page is referenced somewhere: ask each client for its oldest
    // cached page and try the candidates coldest-first.
    let mut oldest_heap: BinaryHeap<Reverse<(u64, PageId)>> = BinaryHeap::new();
    for client_conn in ctx.conns.clients() {
        let resp = client_conn
            .rpc
            .get_page_past_access_freq(client_proto::GetPagePastAccessFreqRequest {
                mac_id: ctx.daemon_id,
            })
            .wait();
        if resp.oldest_page_id != INVALID_PAGE_ID {
            oldest_heap.push(Reverse((resp.last_access_ts, resp.oldest_page_id)));
        }
    }
    while let Some(Reverse((ts, pid))) = oldest_heap.pop() {
        if let Some(meta) = ctx.page_table.table.get(&pid) {
            if meta.try_pin() {
                trace!("victim {} chosen by client LRU (ts {})", pid, ts);
                return SwapVictim {
                    page_id: pid,
                    meta,
                };
            }
        }
    }

    // The LRU candidates were all pinned meanwhile: take anything.
    let mut fallback: Option<SwapVictim> = None;
    ctx.page_table.table.random_for_each(&mut rng, |pid, meta| {
        if meta.try_pin() {
            fallback = Some(SwapVictim {
                page_id: *pid,
                meta: meta.clone(),
            });
            return false;
        }
        true
    });
    fallback.expect("no swappable page in a nearly-full table")
}
