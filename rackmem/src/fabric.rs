//! In-process cluster fabric.
//!
//! Stands in for the wire: implements the role traits by dispatching each
//! incoming call onto its own thread (handlers park on futures, so they
//! must not share the transport's thread), executes one-sided RDMA batches
//! against registered memory, and pumps the client ↔ daemon message-queue
//! rings. A production deployment would put eRPC and verbs behind the same
//! traits.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use log::info;
use parking_lot::Mutex;

use crate::client::ClientContext;
use crate::config::{ClientOptions, DaemonOptions};
use crate::cxl::CxlRegion;
use crate::daemon::{access, migrate, service as daemon_service, DaemonContext};
use crate::master::{service as master_service, MasterContext};
use crate::msgq::{
    ClientMsgqEndpoint, DaemonMsgqEndpoint, MsgQueuePair, ToClientMsg, ToDaemonMsg,
};
use crate::proto::{
    daemon as daemon_proto, master as master_proto, ClientToDaemon, ClientToDaemonResp,
    DaemonToClient, DaemonToClientResp,
};
use crate::rdma::{
    DmaAllocator, DmaBuf, IoBuf, RdmaBatch, RdmaConn, RdmaFuture, RdmaMemory, RdmaOp,
};
use crate::rpc::{
    oneshot, ClientConn, DaemonConn, DaemonRpc, MasterConn, MasterRpc, RpcFuture,
};
use crate::types::RackId;

/// Run `f` as its own task and hand back the future of its result.
fn dispatch<T, F>(f: F) -> RpcFuture<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (promise, future) = oneshot();
    thread::spawn(move || promise.fill(f()));
    future
}

// === RDMA engine ===

struct Registration {
    start: u64,
    len: usize,
    rkey: u32,
    mem: Arc<dyn RdmaMemory>,
}

struct FabricState {
    next_addr: u64,
    next_rkey: u32,
    regs: Vec<Registration>,
}

/// Registered-memory address space shared by every node in the process.
pub struct RdmaFabric {
    state: Mutex<FabricState>,
}

impl Default for RdmaFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl RdmaFabric {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FabricState {
                next_addr: 0x0001_0000_0000,
                next_rkey: 1,
                regs: Vec::new(),
            }),
        }
    }

    /// Register `mem`, returning its base address and key.
    pub fn register(&self, mem: Arc<dyn RdmaMemory>) -> (u64, u32) {
        let len = mem.len();
        let mut state = self.state.lock();
        let start = state.next_addr;
        // Guard gap so off-by-one addresses never resolve.
        state.next_addr += (len as u64 + 4095) / 4096 * 4096 + 4096;
        let rkey = state.next_rkey;
        state.next_rkey += 1;
        state.regs.push(Registration {
            start,
            len,
            rkey,
            mem,
        });
        (start, rkey)
    }

    /// Create and register a CXL region of `slab_count` pages.
    pub fn new_region(&self, slab_count: usize) -> Arc<CxlRegion> {
        let len = slab_count * crate::types::PAGE_SIZE;
        let (start, rkey);
        {
            let mut state = self.state.lock();
            start = state.next_addr;
            state.next_addr += len as u64 + 4096;
            rkey = state.next_rkey;
            state.next_rkey += 1;
        }
        let region = Arc::new(CxlRegion::new(start, rkey, slab_count));
        self.state.lock().regs.push(Registration {
            start,
            len,
            rkey,
            mem: region.clone(),
        });
        region
    }

    fn resolve(&self, addr: u64, len: usize, key: u32) -> (Arc<dyn RdmaMemory>, usize) {
        let state = self.state.lock();
        let reg = state
            .regs
            .iter()
            .find(|r| addr >= r.start && addr + len as u64 <= r.start + r.len as u64)
            .unwrap_or_else(|| {
                panic!(
                    "{}",
                    crate::Error::Transport(format!("unregistered address {:#x}", addr))
                )
            });
        assert_eq!(
            reg.rkey, key,
            "{}",
            crate::Error::Transport(format!("bad key for address {:#x}", addr))
        );
        (reg.mem.clone(), (addr - reg.start) as usize)
    }
}

impl DmaAllocator for RdmaFabric {
    fn alloc_dma(&self, len: usize) -> DmaBuf {
        let mem = Arc::new(IoBuf::new(len));
        let (addr, lkey) = self.register(mem.clone());
        DmaBuf { addr, lkey, mem }
    }
}

/// Executes one-sided batches against the fabric's registered memory. Ops
/// run on a completion thread; the submitter polls the returned future.
pub struct FabricRdmaConn {
    fabric: Arc<RdmaFabric>,
}

impl FabricRdmaConn {
    pub fn new(fabric: Arc<RdmaFabric>) -> Self {
        Self { fabric }
    }
}

impl RdmaConn for FabricRdmaConn {
    fn submit(&self, batch: RdmaBatch) -> RdmaFuture {
        let outstanding = Arc::new(AtomicUsize::new(batch.ops.len()));
        let fabric = self.fabric.clone();
        let counter = outstanding.clone();
        thread::spawn(move || {
            for op in batch.ops {
                match op {
                    RdmaOp::Read {
                        local_addr,
                        lkey,
                        len,
                        remote_addr,
                        rkey,
                    } => {
                        let (remote, roff) = fabric.resolve(remote_addr, len, rkey);
                        let (local, loff) = fabric.resolve(local_addr, len, lkey);
                        let mut tmp = vec![0u8; len];
                        remote.load(roff, &mut tmp);
                        local.store(loff, &tmp);
                    }
                    RdmaOp::Write {
                        local_addr,
                        lkey,
                        len,
                        remote_addr,
                        rkey,
                    } => {
                        let (local, loff) = fabric.resolve(local_addr, len, lkey);
                        let (remote, roff) = fabric.resolve(remote_addr, len, rkey);
                        let mut tmp = vec![0u8; len];
                        local.load(loff, &mut tmp);
                        remote.store(roff, &tmp);
                    }
                }
                counter.fetch_sub(1, Ordering::AcqRel);
            }
        });
        RdmaFuture::new(outstanding)
    }
}

// === Role handles ===

/// The master's call surface.
pub struct MasterHandle {
    pub ctx: Arc<MasterContext>,
}

impl MasterRpc for MasterHandle {
    fn join_client(
        &self,
        req: master_proto::JoinClientRequest,
    ) -> RpcFuture<master_proto::JoinClientReply> {
        let ctx = self.ctx.clone();
        dispatch(move || master_service::join_client(&ctx, req))
    }

    fn alloc_page(
        &self,
        req: master_proto::AllocPageRequest,
    ) -> RpcFuture<master_proto::AllocPageReply> {
        let ctx = self.ctx.clone();
        dispatch(move || master_service::alloc_page(&ctx, req))
    }

    fn free_page(
        &self,
        req: master_proto::FreePageRequest,
    ) -> RpcFuture<master_proto::FreePageReply> {
        let ctx = self.ctx.clone();
        dispatch(move || master_service::free_page(&ctx, req))
    }

    fn latch_remote_page(
        &self,
        req: master_proto::LatchRemotePageRequest,
    ) -> RpcFuture<master_proto::LatchRemotePageReply> {
        let ctx = self.ctx.clone();
        dispatch(move || master_service::latch_remote_page(&ctx, req))
    }

    fn unlatch_remote_page(
        &self,
        req: master_proto::UnlatchRemotePageRequest,
    ) -> RpcFuture<master_proto::UnlatchRemotePageReply> {
        let ctx = self.ctx.clone();
        dispatch(move || master_service::unlatch_remote_page(&ctx, req))
    }

    fn unlatch_page_and_swap(
        &self,
        req: master_proto::UnlatchPageAndSwapRequest,
    ) -> RpcFuture<master_proto::UnlatchPageAndSwapReply> {
        let ctx = self.ctx.clone();
        dispatch(move || master_service::unlatch_page_and_swap(&ctx, req))
    }
}

/// A daemon's call surface. Created before the daemon context exists (the
/// master learns it during join), bound once the context is up.
pub struct DaemonHandle {
    ctx: OnceLock<Arc<DaemonContext>>,
}

impl Default for DaemonHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonHandle {
    pub fn new() -> Self {
        Self {
            ctx: OnceLock::new(),
        }
    }

    pub fn bind(&self, ctx: Arc<DaemonContext>) {
        if self.ctx.set(ctx).is_err() {
            panic!("daemon handle bound twice");
        }
    }

    fn ctx(&self) -> Arc<DaemonContext> {
        self.ctx.get().expect("daemon handle not bound").clone()
    }
}

impl DaemonRpc for DaemonHandle {
    fn get_page_rdma_ref(
        &self,
        req: daemon_proto::GetPageRdmaRefRequest,
    ) -> RpcFuture<daemon_proto::GetPageRdmaRefReply> {
        let ctx = self.ctx();
        dispatch(move || daemon_service::get_page_rdma_ref(&ctx, req))
    }

    fn del_page_rdma_ref(
        &self,
        req: daemon_proto::DelPageRdmaRefRequest,
    ) -> RpcFuture<daemon_proto::DelPageRdmaRefReply> {
        let ctx = self.ctx();
        dispatch(move || daemon_service::del_page_rdma_ref(&ctx, req))
    }

    fn try_migrate_page(
        &self,
        req: daemon_proto::TryMigratePageRequest,
    ) -> RpcFuture<daemon_proto::TryMigratePageReply> {
        let ctx = self.ctx();
        dispatch(move || migrate::try_migrate_page(&ctx, req))
    }

    fn alloc_page_memory(
        &self,
        req: daemon_proto::AllocPageMemoryRequest,
    ) -> RpcFuture<daemon_proto::AllocPageMemoryReply> {
        let ctx = self.ctx();
        dispatch(move || migrate::alloc_page_memory(&ctx, req))
    }
}

// === Message-queue pumps ===

fn spawn_daemon_msgq_loop(
    ctx: Arc<DaemonContext>,
    conn: Arc<ClientConn>,
    endpoint: Arc<DaemonMsgqEndpoint>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) {
            let Some(env) = endpoint.to_daemon.dequeue() else {
                thread::yield_now();
                continue;
            };
            match env.body {
                ToDaemonMsg::Req(req) => {
                    let ctx = ctx.clone();
                    let conn = conn.clone();
                    let endpoint = endpoint.clone();
                    let call_id = env.header.call_id;
                    let rpc_type = env.header.rpc_type;
                    // Handlers park on futures; give each its own task.
                    thread::spawn(move || {
                        let resp = match req {
                            ClientToDaemon::GetPageRefOrProxy(r) => {
                                DaemonToClientResp::GetPageRefOrProxy(
                                    access::get_page_ref_or_proxy(&ctx, &conn, r),
                                )
                            }
                            ClientToDaemon::AllocPage(r) => DaemonToClientResp::AllocPage(
                                daemon_service::client_alloc_page(&ctx, r),
                            ),
                        };
                        endpoint.reply(call_id, rpc_type, resp);
                    });
                }
                ToDaemonMsg::Resp(resp) => endpoint.complete(env.header.call_id, resp),
            }
        }
    })
}

fn spawn_client_msgq_loop(
    ctx: Arc<ClientContext>,
    endpoint: Arc<ClientMsgqEndpoint>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) {
            let Some(env) = endpoint.to_client.dequeue() else {
                thread::yield_now();
                continue;
            };
            match env.body {
                ToClientMsg::Req(req) => {
                    let resp = match req {
                        DaemonToClient::RemovePageCache(r) => {
                            ClientToDaemonResp::RemovePageCache(ctx.remove_page_cache(&r))
                        }
                        DaemonToClient::GetCurrentWriteData(r) => {
                            ClientToDaemonResp::GetCurrentWriteData(ctx.get_current_write_data(&r))
                        }
                        DaemonToClient::GetPagePastAccessFreq(r) => {
                            ClientToDaemonResp::GetPagePastAccessFreq(
                                ctx.get_page_past_access_freq(&r),
                            )
                        }
                    };
                    endpoint.reply(env.header.call_id, env.header.rpc_type, resp);
                }
                ToClientMsg::Resp(resp) => endpoint.complete(env.header.call_id, resp),
            }
        }
    })
}

// === Cluster assembly ===

#[derive(Debug, Clone)]
pub struct RackSpec {
    pub slab_count: usize,
    pub client_count: usize,
}

pub struct ClusterBuilder {
    specs: Vec<RackSpec>,
    options: DaemonOptions,
}

impl Default for ClusterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterBuilder {
    pub fn new() -> Self {
        Self {
            specs: Vec::new(),
            options: DaemonOptions::default(),
        }
    }

    /// Add a rack with `slab_count` CXL page slabs and `client_count`
    /// clients.
    pub fn rack(mut self, slab_count: usize, client_count: usize) -> Self {
        self.specs.push(RackSpec {
            slab_count,
            client_count,
        });
        self
    }

    /// Daemon tuning applied to every rack (`rack_id` and slab count are
    /// overwritten per rack).
    pub fn daemon_options(mut self, options: DaemonOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Cluster {
        let rdma = Arc::new(RdmaFabric::new());
        let fabric_conn: Arc<dyn RdmaConn> = Arc::new(FabricRdmaConn::new(rdma.clone()));

        let master = Arc::new(MasterContext::new());
        let master_handle = Arc::new(MasterHandle {
            ctx: master.clone(),
        });

        let stop = Arc::new(AtomicBool::new(false));
        let mut loops = Vec::new();
        let mut daemon_handles: Vec<Arc<DaemonHandle>> = Vec::new();
        let mut daemons: Vec<Arc<DaemonContext>> = Vec::new();

        for (i, spec) in self.specs.iter().enumerate() {
            let rack_id = i as RackId;
            let handle = Arc::new(DaemonHandle::new());
            let cxl = rdma.new_region(spec.slab_count);

            let reply = master_service::join_daemon(
                &master,
                handle.clone(),
                fabric_conn.clone(),
                master_proto::JoinDaemonRequest {
                    rack_id,
                    ip: format!("10.0.{}.1", i),
                    port: 31850 + i as u16,
                    with_cxl: self.options.with_cxl,
                    free_page_num: spec.slab_count,
                },
            );

            let mut options = self.options.clone();
            options.rack_id = rack_id;
            options.cxl_slab_count = spec.slab_count;

            let ctx = Arc::new(DaemonContext::new(
                options,
                reply.daemon_mac_id,
                cxl,
                rdma.clone(),
            ));
            ctx.conns.set_master(Arc::new(MasterConn {
                master_id: reply.master_mac_id,
                rpc: master_handle.clone(),
            }));

            // Cross-connect with every rack that joined earlier.
            for info in &reply.other_racks {
                let other_handle = daemon_handles[info.rack_id as usize].clone();
                let other_ctx = daemons[info.rack_id as usize].clone();
                ctx.conns.add_daemon(Arc::new(DaemonConn {
                    daemon_id: info.daemon_id,
                    rack_id: info.rack_id,
                    ip: info.ip.clone(),
                    port: info.port,
                    rpc: other_handle,
                    rdma: fabric_conn.clone(),
                }));
                other_ctx.conns.add_daemon(Arc::new(DaemonConn {
                    daemon_id: reply.daemon_mac_id,
                    rack_id,
                    ip: format!("10.0.{}.1", i),
                    port: 31850 + i as u16,
                    rpc: handle.clone(),
                    rdma: fabric_conn.clone(),
                }));
            }

            handle.bind(ctx.clone());
            daemon_handles.push(handle);
            daemons.push(ctx);
        }

        let mut clients: Vec<Vec<Arc<ClientContext>>> = Vec::new();
        for (i, spec) in self.specs.iter().enumerate() {
            let rack_id = i as RackId;
            let mut rack_clients = Vec::new();
            for j in 0..spec.client_count {
                let pair = MsgQueuePair::new();
                let daemon_ep = Arc::new(DaemonMsgqEndpoint::new(&pair));
                let client_ep = Arc::new(ClientMsgqEndpoint::new(&pair));

                let (reply, conn) = daemon_service::join_rack(
                    &daemons[i],
                    daemon_ep.clone(),
                    daemon_proto::JoinRackRequest {
                        rack_id,
                        client_ipv4: format!("10.0.{}.{}", i, j + 2),
                        client_port: 40000 + j as u16,
                    },
                );

                let client_ctx = Arc::new(ClientContext::new(
                    ClientOptions { rack_id },
                    reply.client_mac_id,
                    reply.daemon_mac_id,
                    client_ep.clone(),
                    daemons[i].cxl.clone(),
                ));

                loops.push(spawn_daemon_msgq_loop(
                    daemons[i].clone(),
                    conn,
                    daemon_ep,
                    stop.clone(),
                ));
                loops.push(spawn_client_msgq_loop(
                    client_ctx.clone(),
                    client_ep,
                    stop.clone(),
                ));
                rack_clients.push(client_ctx);
            }
            clients.push(rack_clients);
        }

        info!(
            "cluster up: {} racks, {} clients",
            daemons.len(),
            clients.iter().map(|c| c.len()).sum::<usize>()
        );

        Cluster {
            master,
            daemons,
            clients,
            rdma,
            stop,
            loops,
        }
    }
}

/// A fully wired in-process cluster.
pub struct Cluster {
    pub master: Arc<MasterContext>,
    pub daemons: Vec<Arc<DaemonContext>>,
    pub clients: Vec<Vec<Arc<ClientContext>>>,
    pub rdma: Arc<RdmaFabric>,
    stop: Arc<AtomicBool>,
    loops: Vec<JoinHandle<()>>,
}

impl Cluster {
    pub fn builder() -> ClusterBuilder {
        ClusterBuilder::new()
    }

    pub fn daemon(&self, rack: usize) -> &Arc<DaemonContext> {
        &self.daemons[rack]
    }

    pub fn client(&self, rack: usize, idx: usize) -> &Arc<ClientContext> {
        &self.clients[rack][idx]
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.loops.drain(..) {
            let _ = handle.join();
        }
    }
}
