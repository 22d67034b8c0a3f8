//! RPC futures, the role traits the core calls through, and connection
//! records.
//!
//! Every remote call returns an [`RpcFuture`]: a one-shot slot the caller
//! polls with `try_get` and, while empty, yields. Tasks never block the OS
//! thread in a way that starves the transport; a parked task keeps
//! yielding so whichever thread drives completions can run.
//!
//! The traits below are the full interface the core consumes from the
//! transport; anything that can deliver these calls (in-process fabric,
//! eRPC, message queue) plugs in behind them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::proto::{client, daemon, master};
use crate::types::{MacId, RackId};

struct Slot<T> {
    ready: AtomicBool,
    value: Mutex<Option<T>>,
}

/// Write side of a one-shot RPC slot.
pub struct Promise<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Promise<T> {
    /// Complete the call. Consumes the promise; a call completes once.
    pub fn fill(self, value: T) {
        *self.slot.value.lock() = Some(value);
        self.slot.ready.store(true, Ordering::Release);
    }
}

/// Read side of a one-shot RPC slot.
pub struct RpcFuture<T> {
    slot: Arc<Slot<T>>,
}

impl<T> RpcFuture<T> {
    /// Non-blocking poll. Returns the value once the reply has landed.
    pub fn try_get(&self) -> Option<T> {
        if self.slot.ready.load(Ordering::Acquire) {
            self.slot.value.lock().take()
        } else {
            None
        }
    }

    /// Poll-and-yield until the reply lands.
    pub fn wait(self) -> T {
        loop {
            if let Some(v) = self.try_get() {
                return v;
            }
            thread::yield_now();
        }
    }
}

/// Create a connected promise/future pair.
pub fn oneshot<T>() -> (Promise<T>, RpcFuture<T>) {
    let slot = Arc::new(Slot {
        ready: AtomicBool::new(false),
        value: Mutex::new(None),
    });
    (
        Promise { slot: slot.clone() },
        RpcFuture { slot },
    )
}

// === Role traits ===

/// Calls a daemon makes into the master.
pub trait MasterRpc: Send + Sync {
    fn join_client(&self, req: master::JoinClientRequest) -> RpcFuture<master::JoinClientReply>;
    fn alloc_page(&self, req: master::AllocPageRequest) -> RpcFuture<master::AllocPageReply>;
    fn free_page(&self, req: master::FreePageRequest) -> RpcFuture<master::FreePageReply>;
    fn latch_remote_page(
        &self,
        req: master::LatchRemotePageRequest,
    ) -> RpcFuture<master::LatchRemotePageReply>;
    fn unlatch_remote_page(
        &self,
        req: master::UnlatchRemotePageRequest,
    ) -> RpcFuture<master::UnlatchRemotePageReply>;
    fn unlatch_page_and_swap(
        &self,
        req: master::UnlatchPageAndSwapRequest,
    ) -> RpcFuture<master::UnlatchPageAndSwapReply>;
}

/// Calls a daemon (or the master) makes into a peer daemon.
pub trait DaemonRpc: Send + Sync {
    fn get_page_rdma_ref(
        &self,
        req: daemon::GetPageRdmaRefRequest,
    ) -> RpcFuture<daemon::GetPageRdmaRefReply>;
    fn del_page_rdma_ref(
        &self,
        req: daemon::DelPageRdmaRefRequest,
    ) -> RpcFuture<daemon::DelPageRdmaRefReply>;
    fn try_migrate_page(
        &self,
        req: daemon::TryMigratePageRequest,
    ) -> RpcFuture<daemon::TryMigratePageReply>;
    fn alloc_page_memory(
        &self,
        req: daemon::AllocPageMemoryRequest,
    ) -> RpcFuture<daemon::AllocPageMemoryReply>;
}

/// Calls a daemon makes back into a local client, over the message queue.
pub trait ClientRpc: Send + Sync {
    fn remove_page_cache(
        &self,
        req: client::RemovePageCacheRequest,
    ) -> RpcFuture<client::RemovePageCacheReply>;
    fn get_current_write_data(
        &self,
        req: client::GetCurrentWriteDataRequest,
    ) -> RpcFuture<client::GetCurrentWriteDataReply>;
    fn get_page_past_access_freq(
        &self,
        req: client::GetPagePastAccessFreqRequest,
    ) -> RpcFuture<client::GetPagePastAccessFreqReply>;
}

/// Calls a client makes into its local rack daemon, over the message queue.
pub trait RackRpc: Send + Sync {
    fn get_page_ref_or_proxy(
        &self,
        req: daemon::GetPageRefOrProxyRequest,
    ) -> RpcFuture<daemon::GetPageRefOrProxyReply>;
    fn alloc_page(
        &self,
        req: daemon::ClientAllocPageRequest,
    ) -> RpcFuture<daemon::ClientAllocPageReply>;
}

// === Connection records ===

/// The master as seen from a daemon.
pub struct MasterConn {
    pub master_id: MacId,
    pub rpc: Arc<dyn MasterRpc>,
}

/// A peer daemon as seen from a daemon or the master.
pub struct DaemonConn {
    pub daemon_id: MacId,
    pub rack_id: RackId,
    pub ip: String,
    pub port: u16,
    pub rpc: Arc<dyn DaemonRpc>,
    pub rdma: Arc<dyn crate::rdma::RdmaConn>,
}

/// A local client as seen from its daemon.
pub struct ClientConn {
    pub client_id: MacId,
    pub rpc: Arc<dyn ClientRpc>,
}

/// Connection table of a daemon: its master, every peer daemon by mac id,
/// and the local clients behind their message queues.
pub struct ConnManager {
    master: Mutex<Option<Arc<MasterConn>>>,
    daemons: shardmap::ShardMap<MacId, Arc<DaemonConn>>,
    clients: shardmap::ShardMap<MacId, Arc<ClientConn>>,
}

impl Default for ConnManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnManager {
    pub fn new() -> Self {
        Self {
            master: Mutex::new(None),
            daemons: shardmap::ShardMap::new(),
            clients: shardmap::ShardMap::new(),
        }
    }

    pub fn set_master(&self, conn: Arc<MasterConn>) {
        *self.master.lock() = Some(conn);
    }

    pub fn master(&self) -> Arc<MasterConn> {
        self.master.lock().clone().expect("master not connected")
    }

    pub fn add_daemon(&self, conn: Arc<DaemonConn>) {
        self.daemons.insert(conn.daemon_id, conn);
    }

    pub fn daemon(&self, mac_id: MacId) -> crate::Result<Arc<DaemonConn>> {
        self.daemons
            .get(&mac_id)
            .ok_or(crate::Error::ConnNotFound(mac_id))
    }

    pub fn add_client(&self, conn: Arc<ClientConn>) {
        self.clients.insert(conn.client_id, conn);
    }

    pub fn client(&self, mac_id: MacId) -> crate::Result<Arc<ClientConn>> {
        self.clients
            .get(&mac_id)
            .ok_or(crate::Error::ConnNotFound(mac_id))
    }

    pub fn clients(&self) -> Vec<Arc<ClientConn>> {
        let mut out = Vec::new();
        self.clients.for_each(|_, c| {
            out.push(c.clone());
            true
        });
        out
    }
}
