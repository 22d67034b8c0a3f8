//! Ref/cache invalidation broadcast.

use std::sync::Arc;

use log::debug;

use crate::daemon::{DaemonContext, PageMetadata};
use crate::proto::{client, daemon};
use crate::types::{MacId, PageId};

/// Invalidate every reference to `page_id` before it moves: delete the
/// RDMA ref on every peer daemon in `ref_daemon` (except `unless_daemon`,
/// which dropped its own ref by initiating the migration) and the cached
/// CXL offset on every client in `ref_client`.
///
/// Joins all replies before returning. Every invalidation must be
/// acknowledged before the page copy is submitted; once this returns, no
/// peer will start a new RDMA read of the page and no client holds its
/// offset.
pub fn del_page_ref_and_cache(
    ctx: &DaemonContext,
    page_id: PageId,
    page_meta: &Arc<PageMetadata>,
    unless_daemon: Option<MacId>,
) {
    let daemons: Vec<MacId> = page_meta.ref_daemon.lock().iter().copied().collect();
    let clients: Vec<MacId> = page_meta.ref_client.lock().iter().copied().collect();

    debug!(
        "daemon {}: invalidate page {} ({} daemon refs, {} client caches)",
        ctx.daemon_id,
        page_id,
        daemons.len(),
        clients.len()
    );

    let mut del_ref_futs = Vec::new();
    for mac_id in daemons {
        if Some(mac_id) == unless_daemon {
            continue;
        }
        let conn = ctx
            .conns
            .daemon(mac_id)
            .expect("ref_daemon entry without connection");
        del_ref_futs.push(conn.rpc.del_page_rdma_ref(daemon::DelPageRdmaRefRequest {
            mac_id: ctx.daemon_id,
            page_id,
        }));
    }

    let mut remove_cache_futs = Vec::new();
    for mac_id in clients {
        let conn = ctx
            .conns
            .client(mac_id)
            .expect("ref_client entry without connection");
        remove_cache_futs.push(conn.rpc.remove_page_cache(client::RemovePageCacheRequest {
            mac_id: ctx.daemon_id,
            page_id,
        }));
    }

    for fu in del_ref_futs {
        fu.wait();
    }
    for fu in remove_cache_futs {
        fu.wait();
    }
}
