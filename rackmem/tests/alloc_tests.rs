//! Page allocation placement and directory consistency.

mod common;

use common::{gaddr, test_cluster};

/// S6: an allocation bigger than the local rack's quota spills onto other
/// racks, near pages first.
#[test]
fn test_alloc_page_spans_racks() {
    let cluster = test_cluster(&[(2, 1), (10, 1)]);
    let c0 = cluster.client(0, 0);
    let d0 = cluster.daemon(0);
    let d1 = cluster.daemon(1);

    let start = c0.alloc_pages(5);

    let dir = &cluster.master.directory;
    for i in 0..5u64 {
        let owner = dir.find(start + i).unwrap().owner();
        if i < 2 {
            assert_eq!(owner.daemon_id, d0.daemon_id, "page {} should be near", i);
            assert!(d0.page_table.table.contains(&(start + i)));
        } else {
            assert_eq!(owner.daemon_id, d1.daemon_id, "page {} should spill", i);
            assert!(d1.page_table.table.contains(&(start + i)));
        }
    }
    assert_eq!(dir.page_count(), 5);

    // Spilled pages are usable: rack 0 reaches them by proxy.
    c0.write(gaddr(start + 3, 0), b"spilled");
    assert_eq!(c0.read(gaddr(start + 3, 0), 7), b"spilled");
}

/// P1 over a spread of allocations: every directory entry is resident on
/// exactly the daemon it names.
#[test]
fn test_directory_matches_residency() {
    let cluster = test_cluster(&[(4, 1), (4, 1), (4, 1)]);

    let mut pages = Vec::new();
    for rack in 0..3 {
        let start = cluster.client(rack, 0).alloc_pages(2);
        pages.extend((0..2u64).map(|i| start + i));
    }

    for page_id in pages {
        let owner = cluster.master.directory.find(page_id).unwrap().owner();
        let mut resident = 0;
        for daemon in &cluster.daemons {
            if daemon.page_table.table.contains(&page_id) {
                resident += 1;
                assert_eq!(daemon.daemon_id, owner.daemon_id);
                assert_eq!(daemon.rack_id, owner.rack_id);
            }
        }
        assert_eq!(resident, 1);
    }
}

/// Consecutive allocations hand out consecutive, non-overlapping id runs,
/// never the invalid id.
#[test]
fn test_alloc_ids_are_consecutive_and_valid() {
    let cluster = test_cluster(&[(8, 1)]);
    let c0 = cluster.client(0, 0);

    let a = c0.alloc_pages(3);
    let b = c0.alloc_pages(2);
    assert_ne!(a, rackmem::INVALID_PAGE_ID);
    assert_eq!(b, a + 3);
}
