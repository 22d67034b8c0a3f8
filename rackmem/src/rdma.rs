//! One-sided RDMA interface consumed by the access and migration paths.
//!
//! The core prepares batches of reads/writes against `(addr, rkey)` pairs
//! it learned from page owners, submits them through a connection, and
//! polls the returned future until the outstanding count reaches zero.
//! Queue-pair setup and completion processing are the transport's problem;
//! the in-process engine lives in [`crate::fabric`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

/// Byte storage addressable by the RDMA layer (a CXL region or a
/// registered I/O buffer).
pub trait RdmaMemory: Send + Sync {
    fn len(&self) -> usize;
    fn load(&self, offset: usize, dst: &mut [u8]);
    fn store(&self, offset: usize, src: &[u8]);
}

/// A plain registered I/O buffer, used for proxy read replies and staged
/// write payloads.
pub struct IoBuf {
    data: Mutex<Vec<u8>>,
}

impl IoBuf {
    pub fn new(len: usize) -> Self {
        Self {
            data: Mutex::new(vec![0u8; len]),
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    pub fn fill_from(&self, src: &[u8]) {
        self.store(0, src);
    }
}

impl RdmaMemory for IoBuf {
    fn len(&self) -> usize {
        self.data.lock().len()
    }

    fn load(&self, offset: usize, dst: &mut [u8]) {
        let data = self.data.lock();
        dst.copy_from_slice(&data[offset..offset + dst.len()]);
    }

    fn store(&self, offset: usize, src: &[u8]) {
        let mut data = self.data.lock();
        data[offset..offset + src.len()].copy_from_slice(src);
    }
}

/// A registered I/O buffer plus its address and local key.
pub struct DmaBuf {
    pub addr: u64,
    pub lkey: u32,
    pub mem: Arc<IoBuf>,
}

/// Registers I/O buffers with the RDMA layer on demand.
pub trait DmaAllocator: Send + Sync {
    fn alloc_dma(&self, len: usize) -> DmaBuf;
}

#[derive(Debug, Clone, Copy)]
pub enum RdmaOp {
    /// Read `len` bytes from `(remote_addr, rkey)` into `(local_addr, lkey)`.
    Read {
        local_addr: u64,
        lkey: u32,
        len: usize,
        remote_addr: u64,
        rkey: u32,
    },
    /// Write `len` bytes from `(local_addr, lkey)` to `(remote_addr, rkey)`.
    Write {
        local_addr: u64,
        lkey: u32,
        len: usize,
        remote_addr: u64,
        rkey: u32,
    },
}

/// A batch of one-sided ops submitted as one unit.
#[derive(Debug, Default)]
pub struct RdmaBatch {
    pub(crate) ops: Vec<RdmaOp>,
}

impl RdmaBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prep_read(&mut self, local_addr: u64, lkey: u32, len: usize, remote_addr: u64, rkey: u32) {
        self.ops.push(RdmaOp::Read {
            local_addr,
            lkey,
            len,
            remote_addr,
            rkey,
        });
    }

    pub fn prep_write(&mut self, local_addr: u64, lkey: u32, len: usize, remote_addr: u64, rkey: u32) {
        self.ops.push(RdmaOp::Write {
            local_addr,
            lkey,
            len,
            remote_addr,
            rkey,
        });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Completion handle of a submitted batch. `try_get` reports how many ops
/// are still outstanding; the submitter polls until it reaches zero.
pub struct RdmaFuture {
    outstanding: Arc<AtomicUsize>,
}

impl RdmaFuture {
    pub fn new(outstanding: Arc<AtomicUsize>) -> Self {
        Self { outstanding }
    }

    pub fn try_get(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Poll-and-yield until every op in the batch has completed.
    pub fn wait(&self) {
        while self.try_get() != 0 {
            thread::yield_now();
        }
    }
}

/// A connection capable of executing one-sided batches against its peer.
pub trait RdmaConn: Send + Sync {
    fn submit(&self, batch: RdmaBatch) -> RdmaFuture;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_accumulates_ops() {
        let mut batch = RdmaBatch::new();
        assert!(batch.is_empty());
        batch.prep_write(0x10, 1, 64, 0x20, 2);
        batch.prep_read(0x30, 1, 64, 0x40, 2);
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_iobuf_load_store() {
        let buf = IoBuf::new(16);
        buf.store(4, b"abcd");
        let mut out = [0u8; 4];
        buf.load(4, &mut out);
        assert_eq!(&out, b"abcd");
        assert_eq!(buf.to_vec()[4..8], *b"abcd");
    }
}
