//! Client ↔ daemon message queue contract.
//!
//! Each client shares an SPSC ring pair with its rack daemon: one ring per
//! direction, every message a fixed header plus payload. The rings hold
//! [`RING_BUF_LEN`] bytes of messages in aggregate; a producer whose
//! message does not fit yields until the consumer drains. Payloads larger
//! than a whole ring bypass the budget through the overflow arena, exactly
//! so multi-megabyte proxy reads cannot wedge the queue.
//!
//! The shared-memory layout itself (head/tail words, cache-line placement,
//! the UDP bootstrap packet carrying the ring offset) belongs to the
//! transport; this module keeps the operational contract: bounded rings,
//! typed envelopes, out-of-order responses matched by call id.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::proto::{
    ClientToDaemon, ClientToDaemonResp, DaemonToClient, DaemonToClientResp, WireSize,
};
use crate::proto::{client, daemon};
use crate::rpc::{oneshot, ClientRpc, RackRpc, RpcFuture};

/// Aggregate in-flight byte budget of one ring.
pub const RING_BUF_LEN: usize = 2048;

/// Message op codes carried in the header.
pub mod rpc_type {
    pub const GET_PAGE_REF_OR_PROXY: u8 = 1;
    pub const ALLOC_PAGE: u8 = 2;
    pub const REMOVE_PAGE_CACHE: u8 = 3;
    pub const GET_CURRENT_WRITE_DATA: u8 = 4;
    pub const GET_PAGE_PAST_ACCESS_FREQ: u8 = 5;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgType {
    Req,
    Resp,
}

#[derive(Clone, Copy, Debug)]
pub struct MsgHeader {
    pub rpc_type: u8,
    pub msg_type: MsgType,
    pub size: usize,
    pub call_id: u32,
}

pub struct Envelope<T> {
    pub header: MsgHeader,
    pub body: T,
}

struct RingState<T> {
    queue: VecDeque<Envelope<T>>,
    used: usize,
}

/// One direction of the queue pair.
pub struct MsgRing<T> {
    state: Mutex<RingState<T>>,
}

impl<T> Default for MsgRing<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MsgRing<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RingState {
                queue: VecDeque::new(),
                used: 0,
            }),
        }
    }

    fn fits_in_ring(header: &MsgHeader) -> bool {
        header.size <= RING_BUF_LEN
    }

    /// Enqueue, yielding while the ring budget is exhausted. Oversized
    /// messages go through the arena and do not count against the budget.
    pub fn enqueue(&self, env: Envelope<T>) {
        if !Self::fits_in_ring(&env.header) {
            self.state.lock().queue.push_back(env);
            return;
        }
        let mut env = Some(env);
        loop {
            {
                let mut state = self.state.lock();
                let size = env.as_ref().unwrap().header.size;
                if state.used + size <= RING_BUF_LEN {
                    state.used += size;
                    state.queue.push_back(env.take().unwrap());
                    return;
                }
            }
            thread::yield_now();
        }
    }

    pub fn dequeue(&self) -> Option<Envelope<T>> {
        let mut state = self.state.lock();
        let env = state.queue.pop_front()?;
        if Self::fits_in_ring(&env.header) {
            state.used -= env.header.size;
        }
        Some(env)
    }
}

/// Message flowing toward the daemon: a client request or the client's
/// response to a daemon-initiated call.
pub enum ToDaemonMsg {
    Req(ClientToDaemon),
    Resp(ClientToDaemonResp),
}

/// Message flowing toward the client.
pub enum ToClientMsg {
    Req(DaemonToClient),
    Resp(DaemonToClientResp),
}

/// The SPSC ring pair backing one client connection.
pub struct MsgQueuePair {
    pub to_daemon: Arc<MsgRing<ToDaemonMsg>>,
    pub to_client: Arc<MsgRing<ToClientMsg>>,
}

impl Default for MsgQueuePair {
    fn default() -> Self {
        Self::new()
    }
}

impl MsgQueuePair {
    pub fn new() -> Self {
        Self {
            to_daemon: Arc::new(MsgRing::new()),
            to_client: Arc::new(MsgRing::new()),
        }
    }
}

type Completion<R> = Box<dyn FnOnce(R) + Send>;

// === Daemon-side endpoint ===

/// The daemon's view of one client connection. Outgoing calls implement
/// [`ClientRpc`]; the daemon's poll loop feeds incoming responses back via
/// [`complete`](Self::complete) and replies to client requests via
/// [`reply`](Self::reply).
pub struct DaemonMsgqEndpoint {
    to_client: Arc<MsgRing<ToClientMsg>>,
    pub to_daemon: Arc<MsgRing<ToDaemonMsg>>,
    pending: Mutex<HashMap<u32, Completion<ClientToDaemonResp>>>,
    next_call_id: AtomicU32,
}

impl DaemonMsgqEndpoint {
    pub fn new(pair: &MsgQueuePair) -> Self {
        Self {
            to_client: pair.to_client.clone(),
            to_daemon: pair.to_daemon.clone(),
            pending: Mutex::new(HashMap::new()),
            next_call_id: AtomicU32::new(1),
        }
    }

    fn call(&self, rpc_type: u8, body: DaemonToClient, done: Completion<ClientToDaemonResp>) {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().insert(call_id, done);
        let size = body.wire_size();
        self.to_client.enqueue(Envelope {
            header: MsgHeader {
                rpc_type,
                msg_type: MsgType::Req,
                size,
                call_id,
            },
            body: ToClientMsg::Req(body),
        });
    }

    /// Route a response dequeued by the daemon's poll loop.
    pub fn complete(&self, call_id: u32, resp: ClientToDaemonResp) {
        if let Some(done) = self.pending.lock().remove(&call_id) {
            done(resp);
        }
    }

    /// Answer a client request.
    pub fn reply(&self, call_id: u32, rpc_type: u8, resp: DaemonToClientResp) {
        let size = resp.wire_size();
        self.to_client.enqueue(Envelope {
            header: MsgHeader {
                rpc_type,
                msg_type: MsgType::Resp,
                size,
                call_id,
            },
            body: ToClientMsg::Resp(resp),
        });
    }
}

impl ClientRpc for DaemonMsgqEndpoint {
    fn remove_page_cache(
        &self,
        req: client::RemovePageCacheRequest,
    ) -> RpcFuture<client::RemovePageCacheReply> {
        let (p, fu) = oneshot();
        self.call(
            rpc_type::REMOVE_PAGE_CACHE,
            DaemonToClient::RemovePageCache(req),
            Box::new(move |resp| match resp {
                ClientToDaemonResp::RemovePageCache(r) => p.fill(r),
                other => panic!("mismatched msgq response: {:?}", other),
            }),
        );
        fu
    }

    fn get_current_write_data(
        &self,
        req: client::GetCurrentWriteDataRequest,
    ) -> RpcFuture<client::GetCurrentWriteDataReply> {
        let (p, fu) = oneshot();
        self.call(
            rpc_type::GET_CURRENT_WRITE_DATA,
            DaemonToClient::GetCurrentWriteData(req),
            Box::new(move |resp| match resp {
                ClientToDaemonResp::GetCurrentWriteData(r) => p.fill(r),
                other => panic!("mismatched msgq response: {:?}", other),
            }),
        );
        fu
    }

    fn get_page_past_access_freq(
        &self,
        req: client::GetPagePastAccessFreqRequest,
    ) -> RpcFuture<client::GetPagePastAccessFreqReply> {
        let (p, fu) = oneshot();
        self.call(
            rpc_type::GET_PAGE_PAST_ACCESS_FREQ,
            DaemonToClient::GetPagePastAccessFreq(req),
            Box::new(move |resp| match resp {
                ClientToDaemonResp::GetPagePastAccessFreq(r) => p.fill(r),
                other => panic!("mismatched msgq response: {:?}", other),
            }),
        );
        fu
    }
}

// === Client-side endpoint ===

/// The client's view of its daemon connection. Outgoing calls implement
/// [`RackRpc`]; the client's poll loop feeds daemon responses back via
/// [`complete`](Self::complete) and answers daemon requests via
/// [`reply`](Self::reply).
pub struct ClientMsgqEndpoint {
    to_daemon: Arc<MsgRing<ToDaemonMsg>>,
    pub to_client: Arc<MsgRing<ToClientMsg>>,
    pending: Mutex<HashMap<u32, Completion<DaemonToClientResp>>>,
    next_call_id: AtomicU32,
}

impl ClientMsgqEndpoint {
    pub fn new(pair: &MsgQueuePair) -> Self {
        Self {
            to_daemon: pair.to_daemon.clone(),
            to_client: pair.to_client.clone(),
            pending: Mutex::new(HashMap::new()),
            next_call_id: AtomicU32::new(1),
        }
    }

    fn call(&self, rpc_type: u8, body: ClientToDaemon, done: Completion<DaemonToClientResp>) {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().insert(call_id, done);
        let size = body.wire_size();
        self.to_daemon.enqueue(Envelope {
            header: MsgHeader {
                rpc_type,
                msg_type: MsgType::Req,
                size,
                call_id,
            },
            body: ToDaemonMsg::Req(body),
        });
    }

    pub fn complete(&self, call_id: u32, resp: DaemonToClientResp) {
        if let Some(done) = self.pending.lock().remove(&call_id) {
            done(resp);
        }
    }

    /// Answer a daemon request.
    pub fn reply(&self, call_id: u32, rpc_type: u8, resp: ClientToDaemonResp) {
        let size = resp.wire_size();
        self.to_daemon.enqueue(Envelope {
            header: MsgHeader {
                rpc_type,
                msg_type: MsgType::Resp,
                size,
                call_id,
            },
            body: ToDaemonMsg::Resp(resp),
        });
    }
}

impl RackRpc for ClientMsgqEndpoint {
    fn get_page_ref_or_proxy(
        &self,
        req: daemon::GetPageRefOrProxyRequest,
    ) -> RpcFuture<daemon::GetPageRefOrProxyReply> {
        let (p, fu) = oneshot();
        self.call(
            rpc_type::GET_PAGE_REF_OR_PROXY,
            ClientToDaemon::GetPageRefOrProxy(req),
            Box::new(move |resp| match resp {
                DaemonToClientResp::GetPageRefOrProxy(r) => p.fill(r),
                other => panic!("mismatched msgq response: {:?}", other),
            }),
        );
        fu
    }

    fn alloc_page(
        &self,
        req: daemon::ClientAllocPageRequest,
    ) -> RpcFuture<daemon::ClientAllocPageReply> {
        let (p, fu) = oneshot();
        self.call(
            rpc_type::ALLOC_PAGE,
            ClientToDaemon::AllocPage(req),
            Box::new(move |resp| match resp {
                DaemonToClientResp::AllocPage(r) => p.fill(r),
                other => panic!("mismatched msgq response: {:?}", other),
            }),
        );
        fu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(size: usize, call_id: u32) -> Envelope<u32> {
        Envelope {
            header: MsgHeader {
                rpc_type: 0,
                msg_type: MsgType::Req,
                size,
                call_id,
            },
            body: call_id,
        }
    }

    #[test]
    fn test_ring_fifo() {
        let ring: MsgRing<u32> = MsgRing::new();
        ring.enqueue(envelope(64, 1));
        ring.enqueue(envelope(64, 2));
        assert_eq!(ring.dequeue().unwrap().body, 1);
        assert_eq!(ring.dequeue().unwrap().body, 2);
        assert!(ring.dequeue().is_none());
    }

    #[test]
    fn test_ring_budget_blocks_producer() {
        let ring = Arc::new(MsgRing::new());
        ring.enqueue(envelope(2048, 1));
        let ring2 = ring.clone();
        let producer = thread::spawn(move || {
            // Does not fit until the first message is drained.
            ring2.enqueue(envelope(64, 2));
        });
        thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(ring.dequeue().unwrap().body, 1);
        producer.join().unwrap();
        assert_eq!(ring.dequeue().unwrap().body, 2);
    }

    #[test]
    fn test_oversized_message_bypasses_budget() {
        let ring: MsgRing<u32> = MsgRing::new();
        ring.enqueue(envelope(2048, 1));
        // Larger than the whole ring: goes through the arena immediately.
        ring.enqueue(envelope(4096, 2));
        assert_eq!(ring.dequeue().unwrap().body, 1);
        assert_eq!(ring.dequeue().unwrap().body, 2);
    }
}
