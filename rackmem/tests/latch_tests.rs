//! The master latch protocol under contention.

use std::sync::Arc;
use std::thread;

use rackmem::fabric::{DaemonHandle, FabricRdmaConn, RdmaFabric};
use rackmem::master::{service, MasterContext, PageOwner};
use rackmem::proto::master::*;
use rackmem::types::INVALID_PAGE_ID;

/// Master with one registered rack and `page_count` pages in the
/// directory. The daemon's call surface is never exercised here.
fn master_with_pages(page_count: usize) -> (Arc<MasterContext>, u32) {
    let ctx = Arc::new(MasterContext::new());
    let handle = Arc::new(DaemonHandle::new());
    let rdma = Arc::new(FabricRdmaConn::new(Arc::new(RdmaFabric::new())));
    let reply = service::join_daemon(
        &ctx,
        handle,
        rdma,
        JoinDaemonRequest {
            rack_id: 0,
            ip: "10.0.0.1".to_string(),
            port: 31850,
            with_cxl: true,
            free_page_num: page_count,
        },
    );
    let alloc = service::alloc_page(
        &ctx,
        AllocPageRequest {
            mac_id: reply.daemon_mac_id,
            count: page_count,
        },
    );
    assert_eq!(alloc.start_page_id, 1);
    (ctx, reply.daemon_mac_id)
}

fn unlatch_pair(ctx: &MasterContext, mac_id: u32, owner: PageOwner, a: u64, b: u64) {
    service::unlatch_page_and_swap(
        ctx,
        UnlatchPageAndSwapRequest {
            mac_id,
            page_id: a,
            new_daemon_id: owner.daemon_id,
            new_rack_id: owner.rack_id,
            page_id_swap: b,
            new_daemon_id_swap: owner.daemon_id,
            new_rack_id_swap: owner.rack_id,
        },
    );
}

/// freePage is a deliberate fatal.
#[test]
#[should_panic(expected = "not supported")]
fn test_free_page_is_fatal() {
    let (ctx, mac_id) = master_with_pages(1);
    service::free_page(
        &ctx,
        FreePageRequest {
            mac_id,
            start_page_id: 1,
        },
    );
}

/// A shared latch for a proxy and its release round-trip.
#[test]
fn test_latch_shared_round_trip() {
    let (ctx, mac_id) = master_with_pages(2);

    let reply = service::latch_remote_page(
        &ctx,
        LatchRemotePageRequest {
            mac_id,
            is_write_lock: false,
            page_id: 1,
            page_id_swap: INVALID_PAGE_ID,
        },
    );
    assert_eq!(reply.dest_daemon_id, mac_id);
    assert!(ctx.directory.find(1).unwrap().latch.is_locked());

    service::unlatch_remote_page(&ctx, UnlatchRemotePageRequest { mac_id, page_id: 1 });
    assert!(!ctx.directory.find(1).unwrap().latch.is_locked());
}

/// Two readers share a latch; they both see the same owner pair.
#[test]
fn test_shared_latches_coexist() {
    let (ctx, mac_id) = master_with_pages(1);
    for _ in 0..2 {
        let reply = service::latch_remote_page(
            &ctx,
            LatchRemotePageRequest {
                mac_id,
                is_write_lock: false,
                page_id: 1,
                page_id_swap: INVALID_PAGE_ID,
            },
        );
        assert_eq!(reply.dest_rack_id, 0);
    }
    service::unlatch_remote_page(&ctx, UnlatchRemotePageRequest { mac_id, page_id: 1 });
    service::unlatch_remote_page(&ctx, UnlatchRemotePageRequest { mac_id, page_id: 1 });
    assert!(!ctx.directory.find(1).unwrap().latch.is_locked());
}

/// S4 / P4: opposite-order swap latches of the same pair serialize on the
/// ascending-id rule instead of deadlocking.
#[test]
fn test_inverse_swap_latch_pairs_do_not_deadlock() {
    let (ctx, mac_id) = master_with_pages(2);
    let owner = ctx.directory.find(1).unwrap().owner();

    let mut handles = Vec::new();
    for (a, b) in [(1u64, 2u64), (2u64, 1u64)] {
        let ctx = ctx.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..200 {
                service::latch_remote_page(
                    &ctx,
                    LatchRemotePageRequest {
                        mac_id,
                        is_write_lock: true,
                        page_id: a,
                        page_id_swap: b,
                    },
                );
                unlatch_pair(&ctx, mac_id, owner, a, b);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert!(!ctx.directory.find(1).unwrap().latch.is_locked());
    assert!(!ctx.directory.find(2).unwrap().latch.is_locked());
}

/// unLatchPageAndSwap updates both directory entries before either latch
/// is observable as released.
#[test]
fn test_swap_commit_updates_both_entries() {
    let (ctx, mac_id) = master_with_pages(2);

    service::latch_remote_page(
        &ctx,
        LatchRemotePageRequest {
            mac_id,
            is_write_lock: true,
            page_id: 1,
            page_id_swap: 2,
        },
    );

    service::unlatch_page_and_swap(
        &ctx,
        UnlatchPageAndSwapRequest {
            mac_id,
            page_id: 1,
            new_daemon_id: 7,
            new_rack_id: 3,
            page_id_swap: 2,
            new_daemon_id_swap: 8,
            new_rack_id_swap: 4,
        },
    );

    assert_eq!(
        ctx.directory.find(1).unwrap().owner(),
        PageOwner {
            rack_id: 3,
            daemon_id: 7
        }
    );
    assert_eq!(
        ctx.directory.find(2).unwrap().owner(),
        PageOwner {
            rack_id: 4,
            daemon_id: 8
        }
    );
    assert!(!ctx.directory.find(1).unwrap().latch.is_locked());
    assert!(!ctx.directory.find(2).unwrap().latch.is_locked());
    assert_eq!(ctx.stats.page_swaps(), 1);
}
