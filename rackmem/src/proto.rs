//! Request/response types for every RPC surface of the pool.
//!
//! Grouped by the serving role: `master` for calls the master handles,
//! `daemon` for calls a daemon handles (from peers over the wire and from
//! local clients over the shared-memory queue), `client` for the calls a
//! daemon makes back into its clients. Wire encoding is the transport's
//! concern; these are the typed payloads the core exchanges.

use crate::types::{GlobalAddr, MacId, PageId, RackId};

/// Calls served by the master.
pub mod master {
    use super::*;

    #[derive(Debug, Clone)]
    pub struct JoinDaemonRequest {
        pub rack_id: RackId,
        pub ip: String,
        pub port: u16,
        pub with_cxl: bool,
        pub free_page_num: usize,
    }

    /// A rack already known to the master, returned to a joining daemon so
    /// it can cross-connect.
    #[derive(Debug, Clone)]
    pub struct RackInfo {
        pub rack_id: RackId,
        pub daemon_id: MacId,
        pub ip: String,
        pub port: u16,
    }

    #[derive(Debug, Clone)]
    pub struct JoinDaemonReply {
        pub daemon_mac_id: MacId,
        pub master_mac_id: MacId,
        pub rdma_port: u16,
        pub other_racks: Vec<RackInfo>,
    }

    #[derive(Debug, Clone)]
    pub struct JoinClientRequest {
        pub rack_id: RackId,
    }

    #[derive(Debug, Clone)]
    pub struct JoinClientReply {
        pub mac_id: MacId,
    }

    #[derive(Debug, Clone)]
    pub struct AllocPageRequest {
        pub mac_id: MacId,
        pub count: usize,
    }

    #[derive(Debug, Clone)]
    pub struct AllocPageReply {
        pub start_page_id: PageId,
        /// How many of the allocated pages were placed on the requesting
        /// daemon's rack. The remainder live on other racks.
        pub start_count: usize,
    }

    #[derive(Debug, Clone)]
    pub struct FreePageRequest {
        pub mac_id: MacId,
        pub start_page_id: PageId,
    }

    #[derive(Debug, Clone)]
    pub struct FreePageReply {
        pub ret: bool,
    }

    #[derive(Debug, Clone)]
    pub struct LatchRemotePageRequest {
        pub mac_id: MacId,
        pub is_write_lock: bool,
        pub page_id: PageId,
        /// Second page of a swap, or `INVALID_PAGE_ID` for a single latch.
        pub page_id_swap: PageId,
    }

    #[derive(Debug, Clone)]
    pub struct LatchRemotePageReply {
        pub dest_rack_id: RackId,
        pub dest_daemon_id: MacId,
    }

    #[derive(Debug, Clone)]
    pub struct UnlatchRemotePageRequest {
        pub mac_id: MacId,
        pub page_id: PageId,
    }

    #[derive(Debug, Clone)]
    pub struct UnlatchRemotePageReply {
        pub ret: bool,
    }

    #[derive(Debug, Clone)]
    pub struct UnlatchPageAndSwapRequest {
        pub mac_id: MacId,
        pub page_id: PageId,
        pub new_daemon_id: MacId,
        pub new_rack_id: RackId,
        pub page_id_swap: PageId,
        pub new_daemon_id_swap: MacId,
        pub new_rack_id_swap: RackId,
    }

    #[derive(Debug, Clone)]
    pub struct UnlatchPageAndSwapReply {
        pub ret: bool,
    }
}

/// Calls served by a daemon.
pub mod daemon {
    use super::*;

    // --- peer daemons, over the wire ---

    #[derive(Debug, Clone)]
    pub struct GetPageRdmaRefRequest {
        pub mac_id: MacId,
        pub page_id: PageId,
    }

    #[derive(Debug, Clone)]
    pub struct GetPageRdmaRefReply {
        pub addr: u64,
        pub rkey: u32,
    }

    #[derive(Debug, Clone)]
    pub struct DelPageRdmaRefRequest {
        pub mac_id: MacId,
        pub page_id: PageId,
    }

    #[derive(Debug, Clone)]
    pub struct DelPageRdmaRefReply {
        pub ret: bool,
    }

    #[derive(Debug, Clone)]
    pub struct TryMigratePageRequest {
        pub mac_id: MacId,
        pub page_id: PageId,
        pub swap_page_id: PageId,
        /// Requester-side heat at migration time. Carried for a future
        /// declination policy; the current policy always accepts.
        pub hot_score: u64,
        pub swapout_page_addr: u64,
        pub swapin_page_addr: u64,
        pub swapout_page_rkey: u32,
        pub swapin_page_rkey: u32,
    }

    #[derive(Debug, Clone)]
    pub struct TryMigratePageReply {
        /// Whether the victim page actually moved into the old owner.
        pub swapped: bool,
    }

    #[derive(Debug, Clone)]
    pub struct AllocPageMemoryRequest {
        pub mac_id: MacId,
        pub start_page_id: PageId,
        pub count: usize,
    }

    #[derive(Debug, Clone)]
    pub struct AllocPageMemoryReply {
        pub ret: bool,
    }

    // --- local clients, over the shared-memory message queue ---

    #[derive(Debug, Clone)]
    pub struct JoinRackRequest {
        pub rack_id: RackId,
        pub client_ipv4: String,
        pub client_port: u16,
    }

    #[derive(Debug, Clone)]
    pub struct JoinRackReply {
        pub client_mac_id: MacId,
        pub daemon_mac_id: MacId,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum PageOp {
        Read,
        /// Pull-based write: the daemon fetches the payload from the client
        /// via `getCurrentWriteData`. Reserved, currently rejected.
        Write,
        /// Push-based write: the payload rides in the request.
        WriteRaw,
    }

    #[derive(Debug, Clone)]
    pub struct GetPageRefOrProxyRequest {
        pub gaddr: GlobalAddr,
        pub op: PageOp,
        /// Client-side buffer address for the reserved pull-based write.
        pub write_buf: u64,
        /// Payload for `WriteRaw`, empty otherwise.
        pub write_raw: Vec<u8>,
        /// Bytes to read for `Read`.
        pub read_size: usize,
    }

    #[derive(Debug, Clone)]
    pub struct GetPageRefOrProxyReply {
        /// True if the page is locally resident; `offset` is then the
        /// client's direct CXL offset and no data is carried.
        pub refs: bool,
        pub offset: u64,
        pub read_data: Vec<u8>,
    }

    #[derive(Debug, Clone)]
    pub struct ClientAllocPageRequest {
        pub count: usize,
    }

    #[derive(Debug, Clone)]
    pub struct ClientAllocPageReply {
        pub start_page_id: PageId,
    }
}

/// Calls a daemon makes back into its local clients.
pub mod client {
    use super::*;

    #[derive(Debug, Clone)]
    pub struct RemovePageCacheRequest {
        pub mac_id: MacId,
        pub page_id: PageId,
    }

    #[derive(Debug, Clone)]
    pub struct RemovePageCacheReply {}

    #[derive(Debug, Clone)]
    pub struct GetCurrentWriteDataRequest {
        pub mac_id: MacId,
        pub write_buf: u64,
        pub write_size: usize,
    }

    #[derive(Debug, Clone)]
    pub struct GetCurrentWriteDataReply {
        pub data: Vec<u8>,
    }

    #[derive(Debug, Clone)]
    pub struct GetPagePastAccessFreqRequest {
        pub mac_id: MacId,
    }

    #[derive(Debug, Clone)]
    pub struct GetPagePastAccessFreqReply {
        /// Client's least recently touched cached page, or
        /// `INVALID_PAGE_ID` if the cache is empty.
        pub oldest_page_id: PageId,
        pub last_access_ts: u64,
    }
}

// === message-queue payloads: Client ↔ Daemon ===

/// Requests flowing client → daemon.
#[derive(Debug, Clone)]
pub enum ClientToDaemon {
    GetPageRefOrProxy(daemon::GetPageRefOrProxyRequest),
    AllocPage(daemon::ClientAllocPageRequest),
}

/// Responses to [`ClientToDaemon`] requests.
#[derive(Debug, Clone)]
pub enum DaemonToClientResp {
    GetPageRefOrProxy(daemon::GetPageRefOrProxyReply),
    AllocPage(daemon::ClientAllocPageReply),
}

/// Requests flowing daemon → client.
#[derive(Debug, Clone)]
pub enum DaemonToClient {
    RemovePageCache(client::RemovePageCacheRequest),
    GetCurrentWriteData(client::GetCurrentWriteDataRequest),
    GetPagePastAccessFreq(client::GetPagePastAccessFreqRequest),
}

/// Responses to [`DaemonToClient`] requests.
#[derive(Debug, Clone)]
pub enum ClientToDaemonResp {
    RemovePageCache(client::RemovePageCacheReply),
    GetCurrentWriteData(client::GetCurrentWriteDataReply),
    GetPagePastAccessFreq(client::GetPagePastAccessFreqReply),
}

/// Payload size as accounted against a message ring's byte budget: the
/// fixed struct footprint plus any variable-length data it drags along.
pub trait WireSize {
    fn wire_size(&self) -> usize;
}

impl WireSize for ClientToDaemon {
    fn wire_size(&self) -> usize {
        let dynamic = match self {
            ClientToDaemon::GetPageRefOrProxy(r) => r.write_raw.len(),
            ClientToDaemon::AllocPage(_) => 0,
        };
        std::mem::size_of::<Self>() + dynamic
    }
}

impl WireSize for DaemonToClientResp {
    fn wire_size(&self) -> usize {
        let dynamic = match self {
            DaemonToClientResp::GetPageRefOrProxy(r) => r.read_data.len(),
            DaemonToClientResp::AllocPage(_) => 0,
        };
        std::mem::size_of::<Self>() + dynamic
    }
}

impl WireSize for DaemonToClient {
    fn wire_size(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}

impl WireSize for ClientToDaemonResp {
    fn wire_size(&self) -> usize {
        let dynamic = match self {
            ClientToDaemonResp::GetCurrentWriteData(r) => r.data.len(),
            _ => 0,
        };
        std::mem::size_of::<Self>() + dynamic
    }
}
