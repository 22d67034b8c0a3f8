//! Daemon page table and the physical slot allocator over the CXL region.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use shardmap::ShardMap;

use crate::error::{Error, Result};
use crate::types::{MacId, PageId, PAGE_SIZE};

/// Metadata of one locally resident page.
///
/// `ref_daemon` and `ref_client` are weak back-references: mac ids to
/// dispatch invalidations to, never owning handles. While either set is
/// non-empty the page's slab must not move, which the migration path
/// guarantees by broadcasting invalidation before any copy.
pub struct PageMetadata {
    cxl_offset: u64,
    pub ref_daemon: Mutex<HashSet<MacId>>,
    pub ref_client: Mutex<HashSet<MacId>>,
    pin_count: AtomicU32,
}

impl PageMetadata {
    fn new(cxl_offset: u64) -> Self {
        Self {
            cxl_offset,
            ref_daemon: Mutex::new(HashSet::new()),
            ref_client: Mutex::new(HashSet::new()),
            pin_count: AtomicU32::new(0),
        }
    }

    /// Byte offset of the page's slab in the CXL region. Fixed for the
    /// lifetime of the metadata.
    pub fn cxl_offset(&self) -> u64 {
        self.cxl_offset
    }

    /// Claim the page as a migration victim. Fails if anyone else holds a
    /// pin, so concurrent victim choosers cannot pick the same page.
    pub fn try_pin(&self) -> bool {
        self.pin_count
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn unpin(&self) {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_count.load(Ordering::Acquire) > 0
    }
}

/// `page_id → PageMetadata` for locally resident pages, plus the free list
/// over the CXL region's 2 MiB slabs.
///
/// A slab is always in exactly one of three states: on the free list,
/// reserved by an `AllocPageMemory` caller, or referenced by exactly one
/// inserted `PageMetadata`.
pub struct PageTable {
    pub table: ShardMap<PageId, Arc<PageMetadata>>,
    free_slabs: Mutex<Vec<u64>>,
    total_slabs: usize,
}

impl PageTable {
    pub fn new(slab_count: usize) -> Self {
        // Hand out low offsets first.
        let free = (0..slab_count).rev().map(|i| (i * PAGE_SIZE) as u64).collect();
        Self {
            table: ShardMap::new(),
            free_slabs: Mutex::new(free),
            total_slabs: slab_count,
        }
    }

    /// Reserve a slab and return fresh metadata for it. The metadata is
    /// not yet in the table; the reservation counts against capacity until
    /// `apply_page_memory` or `cancel_page_memory`.
    pub fn alloc_page_memory(&self) -> Result<Arc<PageMetadata>> {
        let offset = self
            .free_slabs
            .lock()
            .pop()
            .ok_or(Error::CapacityExceeded("cxl page slabs"))?;
        Ok(Arc::new(PageMetadata::new(offset)))
    }

    /// Insert reserved metadata under `page_id`; the page is now resident.
    pub fn apply_page_memory(&self, page_id: PageId, meta: Arc<PageMetadata>) {
        let inserted = self.table.insert(page_id, meta);
        assert!(inserted, "page {} already resident", page_id);
    }

    /// Remove `page_id` (if inserted) and return `meta`'s slab to the free
    /// list.
    pub fn cancel_page_memory(&self, page_id: PageId, meta: &Arc<PageMetadata>) {
        self.table.erase_if(&page_id, |m| Arc::ptr_eq(m, meta));
        self.free_slabs.lock().push(meta.cxl_offset);
    }

    /// True when at most one slab is still free.
    pub fn nearly_full(&self) -> bool {
        self.free_slabs.lock().len() <= 1
    }

    /// Whether `n` further reservations would succeed.
    pub fn test_alloc_page_memory(&self, n: usize) -> bool {
        self.free_slabs.lock().len() >= n
    }

    pub fn free_slab_count(&self) -> usize {
        self.free_slabs.lock().len()
    }

    pub fn total_slabs(&self) -> usize {
        self.total_slabs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_apply_cancel() {
        let pt = PageTable::new(2);
        assert_eq!(pt.free_slab_count(), 2);

        let meta = pt.alloc_page_memory().unwrap();
        assert_eq!(meta.cxl_offset(), 0);
        assert_eq!(pt.free_slab_count(), 1);
        assert!(!pt.table.contains(&10));

        pt.apply_page_memory(10, meta.clone());
        assert!(pt.table.contains(&10));

        pt.cancel_page_memory(10, &meta);
        assert!(!pt.table.contains(&10));
        assert_eq!(pt.free_slab_count(), 2);
    }

    #[test]
    fn test_cancel_without_apply_returns_slab() {
        let pt = PageTable::new(1);
        let meta = pt.alloc_page_memory().unwrap();
        assert!(pt.alloc_page_memory().is_err());
        pt.cancel_page_memory(99, &meta);
        assert!(pt.alloc_page_memory().is_ok());
    }

    #[test]
    fn test_nearly_full() {
        let pt = PageTable::new(3);
        assert!(!pt.nearly_full());
        let _a = pt.alloc_page_memory().unwrap();
        assert!(!pt.nearly_full());
        let _b = pt.alloc_page_memory().unwrap();
        assert!(pt.nearly_full());
        assert!(pt.test_alloc_page_memory(1));
        assert!(!pt.test_alloc_page_memory(2));
    }

    #[test]
    fn test_try_pin_is_exclusive() {
        let pt = PageTable::new(1);
        let meta = pt.alloc_page_memory().unwrap();
        assert!(meta.try_pin());
        assert!(!meta.try_pin());
        assert!(meta.is_pinned());
        meta.unpin();
        assert!(meta.try_pin());
    }
}
