//! Client role: the page-offset cache and the read/write entry points.
//!
//! A client talks only to its local rack daemon. A cached page is accessed
//! directly in the shared CXL region; everything else goes through
//! `getPageRefOrProxy`, which either establishes such a mapping (`refs`)
//! or carries the data itself (proxy I/O).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use shardmap::ShardMap;

use crate::config::ClientOptions;
use crate::cxl::CxlRegion;
use crate::proto::client::*;
use crate::proto::daemon::{
    ClientAllocPageRequest, GetPageRefOrProxyRequest, PageOp,
};
use crate::rpc::RackRpc;
use crate::types::{timestamp_us, GlobalAddr, MacId, PageId, INVALID_PAGE_ID};

/// A cached page mapping: the CXL offset plus the last access timestamp
/// feeding the daemon's LRU victim query.
pub struct CacheEntry {
    pub offset: u64,
    last_access_us: AtomicU64,
}

impl CacheEntry {
    fn new(offset: u64) -> Self {
        Self {
            offset,
            last_access_us: AtomicU64::new(timestamp_us()),
        }
    }

    fn touch(&self) {
        self.last_access_us.store(timestamp_us(), Ordering::Relaxed);
    }

    pub fn last_access_us(&self) -> u64 {
        self.last_access_us.load(Ordering::Relaxed)
    }
}

/// Hooks for exercising invalidation ordering in tests and fault drills.
#[derive(Default)]
pub struct ClientHooks {
    /// Runs before a `removePageCache` request is applied.
    pub before_remove_cache: Mutex<Option<Box<dyn Fn(PageId) + Send + Sync>>>,
}

pub struct ClientContext {
    pub options: ClientOptions,
    pub client_id: MacId,
    pub daemon_id: MacId,
    pub rack: Arc<dyn RackRpc>,
    pub cxl: Arc<CxlRegion>,
    pub cache: ShardMap<PageId, Arc<CacheEntry>>,
    /// Buffers staged for the reserved pull-based write path; the daemon
    /// fetches them by address via `getCurrentWriteData`.
    write_staging: Mutex<HashMap<u64, Vec<u8>>>,
    pub hooks: ClientHooks,
}

impl ClientContext {
    pub fn new(
        options: ClientOptions,
        client_id: MacId,
        daemon_id: MacId,
        rack: Arc<dyn RackRpc>,
        cxl: Arc<CxlRegion>,
    ) -> Self {
        Self {
            options,
            client_id,
            daemon_id,
            rack,
            cxl,
            cache: ShardMap::new(),
            write_staging: Mutex::new(HashMap::new()),
            hooks: ClientHooks::default(),
        }
    }

    /// Allocate `count` consecutive pages through the local daemon.
    pub fn alloc_pages(&self, count: usize) -> PageId {
        self.rack
            .alloc_page(ClientAllocPageRequest { count })
            .wait()
            .start_page_id
    }

    /// Read `len` bytes at `gaddr`.
    pub fn read(&self, gaddr: GlobalAddr, len: usize) -> Vec<u8> {
        let page_id = gaddr.page_id();
        if let Some(entry) = self.cache.get(&page_id) {
            entry.touch();
            return self.cxl.read(entry.offset + gaddr.offset(), len);
        }

        let resp = self
            .rack
            .get_page_ref_or_proxy(GetPageRefOrProxyRequest {
                gaddr,
                op: PageOp::Read,
                write_buf: 0,
                write_raw: Vec::new(),
                read_size: len,
            })
            .wait();

        if resp.refs {
            self.cache
                .find_or_emplace(&page_id, || Arc::new(CacheEntry::new(resp.offset)));
            self.cxl.read(resp.offset + gaddr.offset(), len)
        } else {
            resp.read_data
        }
    }

    /// Write `data` at `gaddr`.
    pub fn write(&self, gaddr: GlobalAddr, data: &[u8]) {
        let page_id = gaddr.page_id();
        if let Some(entry) = self.cache.get(&page_id) {
            entry.touch();
            self.cxl.write(entry.offset + gaddr.offset(), data);
            return;
        }

        let resp = self
            .rack
            .get_page_ref_or_proxy(GetPageRefOrProxyRequest {
                gaddr,
                op: PageOp::WriteRaw,
                write_buf: 0,
                write_raw: data.to_vec(),
                read_size: 0,
            })
            .wait();

        if resp.refs {
            self.cache
                .find_or_emplace(&page_id, || Arc::new(CacheEntry::new(resp.offset)));
            self.cxl.write(resp.offset + gaddr.offset(), data);
        }
    }

    /// Stage a buffer for the reserved pull-based write path.
    pub fn stage_write_data(&self, buf_addr: u64, data: Vec<u8>) {
        self.write_staging.lock().insert(buf_addr, data);
    }

    // === handlers for daemon-initiated calls ===

    /// Drop the cached offset for a page about to move. Idempotent.
    pub fn remove_page_cache(&self, req: &RemovePageCacheRequest) -> RemovePageCacheReply {
        if let Some(hook) = &*self.hooks.before_remove_cache.lock() {
            hook(req.page_id);
        }
        self.cache.erase(&req.page_id);
        RemovePageCacheReply {}
    }

    /// Hand the daemon a staged write buffer.
    pub fn get_current_write_data(
        &self,
        req: &GetCurrentWriteDataRequest,
    ) -> GetCurrentWriteDataReply {
        let data = self
            .write_staging
            .lock()
            .get(&req.write_buf)
            .map(|d| d[..req.write_size.min(d.len())].to_vec())
            .unwrap_or_default();
        GetCurrentWriteDataReply { data }
    }

    /// Report the least recently touched cached page for victim selection.
    pub fn get_page_past_access_freq(
        &self,
        _req: &GetPagePastAccessFreqRequest,
    ) -> GetPagePastAccessFreqReply {
        let mut oldest_page_id = INVALID_PAGE_ID;
        let mut last_access_ts = u64::MAX;
        self.cache.for_each(|pid, entry| {
            let ts = entry.last_access_us();
            if ts < last_access_ts {
                last_access_ts = ts;
                oldest_page_id = *pid;
            }
            true
        });
        GetPagePastAccessFreqReply {
            oldest_page_id,
            last_access_ts,
        }
    }
}
