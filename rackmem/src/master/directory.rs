//! Global page directory, rack tables, and id allocation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use shardmap::ShardMap;

use crate::error::{Error, Result};
use crate::rpc::DaemonConn;
use crate::types::{MacId, PageId, RackId, INVALID_PAGE_ID};

/// Current placement of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageOwner {
    pub rack_id: RackId,
    pub daemon_id: MacId,
}

/// Directory entry for one live page. The entry (and its latch) is never
/// destroyed while the page is live; ownership changes only under the
/// exclusive latch.
pub struct PageRackMeta {
    pub latch: super::PageLatch,
    owner: RwLock<PageOwner>,
}

impl PageRackMeta {
    pub fn new(owner: PageOwner) -> Self {
        Self {
            latch: super::PageLatch::new(),
            owner: RwLock::new(owner),
        }
    }

    /// Read the `(rack_id, daemon_id)` pair. The pair is written only under
    /// the exclusive latch, so readers always observe a consistent pair.
    pub fn owner(&self) -> PageOwner {
        *self.owner.read()
    }

    pub fn set_owner(&self, owner: PageOwner) {
        *self.owner.write() = owner;
    }
}

/// Per-rack bookkeeping: the daemon connection plus page quota.
pub struct RackTable {
    pub rack_id: RackId,
    pub with_cxl: bool,
    pub max_free_page_num: usize,
    current_allocated: AtomicUsize,
    pub daemon: Arc<DaemonConn>,
    pub clients: RwLock<Vec<MacId>>,
}

impl RackTable {
    pub fn new(
        rack_id: RackId,
        with_cxl: bool,
        max_free_page_num: usize,
        daemon: Arc<DaemonConn>,
    ) -> Self {
        Self {
            rack_id,
            with_cxl,
            max_free_page_num,
            current_allocated: AtomicUsize::new(0),
            daemon,
            clients: RwLock::new(Vec::new()),
        }
    }

    pub fn current_allocated(&self) -> usize {
        self.current_allocated.load(Ordering::Acquire)
    }

    /// Pages this rack can still take.
    pub fn free_quota(&self) -> usize {
        self.max_free_page_num - self.current_allocated()
    }
}

/// Monotonic id allocator over a growable capacity. Ids start at 1; 0 is
/// the invalid page id.
pub struct IdAllocator {
    state: Mutex<IdState>,
}

struct IdState {
    next: u64,
    capacity: u64,
}

impl IdAllocator {
    /// Allocator with zero initial capacity; `expand` before `gen`.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(IdState {
                next: 1,
                capacity: 0,
            }),
        }
    }

    /// Allocator that never runs out (mac ids).
    pub fn unbounded() -> Self {
        Self {
            state: Mutex::new(IdState {
                next: 1,
                capacity: u64::MAX,
            }),
        }
    }

    pub fn expand(&self, n: usize) {
        self.state.lock().capacity += n as u64;
    }

    pub fn gen(&self) -> Result<u64> {
        self.multi_gen(1)
    }

    /// Allocate `count` consecutive ids.
    pub fn multi_gen(&self, count: usize) -> Result<u64> {
        let mut state = self.state.lock();
        if state.next + count as u64 > state.capacity.saturating_add(1) {
            return Err(Error::CapacityExceeded("id allocator"));
        }
        let start = state.next;
        state.next += count as u64;
        Ok(start)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// The directory mapping every live page id to its rack metadata.
pub struct PageDirectory {
    pages: ShardMap<PageId, Arc<PageRackMeta>>,
    pub page_ids: IdAllocator,
}

impl Default for PageDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl PageDirectory {
    pub fn new() -> Self {
        Self {
            pages: ShardMap::new(),
            page_ids: IdAllocator::new(),
        }
    }

    pub fn find(&self, page_id: PageId) -> Result<Arc<PageRackMeta>> {
        self.pages.get(&page_id).ok_or(Error::PageNotFound(page_id))
    }

    /// Register `page_id` as resident on `rack`'s daemon.
    pub fn add_page(&self, rack: &RackTable, page_id: PageId) {
        debug_assert_ne!(page_id, INVALID_PAGE_ID);
        let meta = Arc::new(PageRackMeta::new(PageOwner {
            rack_id: rack.rack_id,
            daemon_id: rack.daemon.daemon_id,
        }));
        let inserted = self.pages.insert(page_id, meta);
        assert!(inserted, "page {} registered twice", page_id);
        let now = rack.current_allocated.fetch_add(1, Ordering::AcqRel) + 1;
        assert!(
            now <= rack.max_free_page_num,
            "rack {} over-allocated: {} > {}",
            rack.rack_id,
            now,
            rack.max_free_page_num
        );
    }

    /// Drop `page_id` from the directory, returning its quota to `rack`.
    pub fn remove_page(&self, rack: &RackTable, page_id: PageId) {
        if self.pages.erase(&page_id).is_some() {
            rack.current_allocated.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}
