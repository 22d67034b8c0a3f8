//! Daemon-side handlers outside the access and migration paths.

use std::sync::Arc;

use log::info;

use crate::daemon::DaemonContext;
use crate::error::Error;
use crate::proto::daemon::*;
use crate::proto::master as master_proto;
use crate::rpc::{ClientConn, ClientRpc};

/// A client joins the rack: obtain its mac id from the master and record
/// the connection. The message-queue rings backing `client_rpc` are set up
/// by the transport's bootstrap path (a fresh ring pair whose offset the
/// daemon hands back to the client).
pub fn join_rack(
    ctx: &DaemonContext,
    client_rpc: Arc<dyn ClientRpc>,
    req: JoinRackRequest,
) -> (JoinRackReply, Arc<ClientConn>) {
    assert_eq!(
        req.rack_id, ctx.rack_id,
        "can't join different rack {} ---> {}",
        req.rack_id, ctx.rack_id
    );

    let master = ctx.conns.master();
    let resp = master
        .rpc
        .join_client(master_proto::JoinClientRequest {
            rack_id: ctx.rack_id,
        })
        .wait();

    let conn = Arc::new(ClientConn {
        client_id: resp.mac_id,
        rpc: client_rpc,
    });
    ctx.conns.add_client(conn.clone());

    info!(
        "connect with client [rack:{} --- id:{}]",
        ctx.rack_id, resp.mac_id
    );

    (
        JoinRackReply {
            client_mac_id: resp.mac_id,
            daemon_mac_id: ctx.daemon_id,
        },
        conn,
    )
}

/// Client-facing page allocation: the master picks the placement; the run
/// of ids it placed on this rack is backed by local slabs immediately.
pub fn client_alloc_page(ctx: &DaemonContext, req: ClientAllocPageRequest) -> ClientAllocPageReply {
    let master = ctx.conns.master();
    let resp = master
        .rpc
        .alloc_page(master_proto::AllocPageRequest {
            mac_id: ctx.daemon_id,
            count: req.count,
        })
        .wait();

    for c in 0..resp.start_count {
        let meta = ctx
            .page_table
            .alloc_page_memory()
            .expect("no slab for freshly allocated page");
        ctx.page_table
            .apply_page_memory(resp.start_page_id + c as u64, meta);
    }

    ClientAllocPageReply {
        start_page_id: resp.start_page_id,
    }
}

/// Hand out this daemon's RDMA coordinates for a resident page and record
/// the requester as a ref holder.
pub fn get_page_rdma_ref(ctx: &DaemonContext, req: GetPageRdmaRefRequest) -> GetPageRdmaRefReply {
    let page_meta = ctx
        .page_table
        .table
        .get(&req.page_id)
        .unwrap_or_else(|| panic!("rdma ref of non-resident page {}", req.page_id));

    page_meta.ref_daemon.lock().insert(req.mac_id);

    GetPageRdmaRefReply {
        addr: ctx.cxl.virtual_addr(page_meta.cxl_offset()),
        rkey: ctx.cxl.rkey(),
    }
}

/// Invalidate any relationship between this daemon and `req.page_id` held
/// on behalf of the caller: the caller's entry in our ref set if the page
/// is resident here, and our own cached proxy handle if we hold one (once
/// the page moves, its cached `(addr, rkey)` must never be re-served).
///
/// Idempotent: repeating the call leaves identical state.
pub fn del_page_rdma_ref(ctx: &DaemonContext, req: DelPageRdmaRefRequest) -> DelPageRdmaRefReply {
    let _ref_lock = ctx.page_ref_lock.unique(req.page_id);

    ctx.hot_stats.erase(&req.page_id);

    if let Some(page_meta) = ctx.page_table.table.get(&req.page_id) {
        page_meta.ref_daemon.lock().remove(&req.mac_id);
    }

    DelPageRdmaRefReply { ret: true }
}

/// Page freeing is not part of the pool's contract.
pub fn free_page(_ctx: &DaemonContext) {
    panic!("{}", Error::Unsupported("freePage"));
}

/// Byte-granular allocation inside pages is not part of the pool's
/// contract.
pub fn alloc(_ctx: &DaemonContext) {
    panic!("{}", Error::Unsupported("byte-granular alloc"));
}

pub fn free(_ctx: &DaemonContext) {
    panic!("{}", Error::Unsupported("byte-granular free"));
}
