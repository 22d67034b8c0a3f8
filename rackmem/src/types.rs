//! Core identifier types and the global address split.

use std::sync::OnceLock;

/// Page size: 2 MiB.
pub const PAGE_SIZE: usize = 2 << 20;

/// Low bits of a [`GlobalAddr`] holding the in-page offset.
pub const OFFSET_BITS: u32 = PAGE_SIZE.trailing_zeros();

/// Page id 0 is reserved and never allocated.
pub const INVALID_PAGE_ID: PageId = 0;

/// The master's fixed mac id. Daemon and client ids are allocated from 1.
pub const MASTER_MAC_ID: MacId = 0;

pub type PageId = u64;
pub type RackId = u32;

/// Cluster-wide machine identifier, allocated by the master for every
/// daemon and client that joins.
pub type MacId = u32;

/// 64-bit global address: `(page_id << OFFSET_BITS) | offset`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct GlobalAddr(u64);

impl GlobalAddr {
    pub fn new(page_id: PageId, offset: u64) -> Self {
        debug_assert!(offset < PAGE_SIZE as u64);
        Self((page_id << OFFSET_BITS) | offset)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn page_id(self) -> PageId {
        self.0 >> OFFSET_BITS
    }

    pub fn offset(self) -> u64 {
        self.0 & ((1u64 << OFFSET_BITS) - 1)
    }
}

/// Microseconds since process start, strictly positive.
pub fn timestamp_us() -> u64 {
    static START: OnceLock<minstant::Instant> = OnceLock::new();
    let start = START.get_or_init(minstant::Instant::now);
    start.elapsed().as_micros() as u64 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_split() {
        assert_eq!(PAGE_SIZE, 2 * 1024 * 1024);
        assert_eq!(OFFSET_BITS, 21);
    }

    #[test]
    fn test_gaddr_round_trip() {
        let a = GlobalAddr::new(100, 0x1000);
        assert_eq!(a.page_id(), 100);
        assert_eq!(a.offset(), 0x1000);
        assert_eq!(a.raw(), (100 << 21) | 0x1000);
        assert_eq!(GlobalAddr::from_raw(a.raw()), a);
    }

    #[test]
    fn test_gaddr_offset_boundaries() {
        let a = GlobalAddr::new(7, PAGE_SIZE as u64 - 1);
        assert_eq!(a.page_id(), 7);
        assert_eq!(a.offset(), PAGE_SIZE as u64 - 1);
        let b = GlobalAddr::new(8, 0);
        assert_eq!(b.page_id(), 8);
        assert_eq!(b.offset(), 0);
    }

    #[test]
    fn test_timestamp_is_monotonic_nonzero() {
        let a = timestamp_us();
        let b = timestamp_us();
        assert!(a >= 1);
        assert!(b >= a);
    }
}
