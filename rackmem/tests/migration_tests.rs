//! Hot-page migration: watermark trigger, swap at capacity, concurrency,
//! and invalidation ordering.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{gaddr, pattern, test_cluster};
use rackmem::master::PageOwner;
use rackmem::types::PAGE_SIZE;

/// S2: the fourth proxy access hits the watermark exactly and migrates the
/// page to the accessing rack.
#[test]
fn test_warming_to_watermark_migrates() {
    let cluster = test_cluster(&[(8, 1), (8, 1)]);
    let c0 = cluster.client(0, 0);
    let c1 = cluster.client(1, 0);
    let d0 = cluster.daemon(0);
    let d1 = cluster.daemon(1);

    let page_id = c0.alloc_pages(1);
    let data = pattern(page_id, 0x100);
    c0.write(gaddr(page_id, 0), &data);

    // Three cold reads proxy.
    for _ in 0..3 {
        assert_eq!(c1.read(gaddr(page_id, 0), 0x100), data);
    }
    assert!(d0.page_table.table.contains(&page_id));
    assert_eq!(d1.stats.snapshot().page_swap, 0);

    // The fourth access observes heat == watermark and migrates.
    assert_eq!(c1.read(gaddr(page_id, 0), 0x100), data);

    assert!(d1.page_table.table.contains(&page_id));
    assert!(!d0.page_table.table.contains(&page_id));
    assert!(!d1.hot_stats.contains(&page_id));

    let owner = cluster.master.directory.find(page_id).unwrap().owner();
    assert_eq!(
        owner,
        PageOwner {
            rack_id: d1.rack_id,
            daemon_id: d1.daemon_id
        }
    );

    // The original writer's cache was invalidated during the move.
    assert!(c0.cache.get(&page_id).is_none());

    // Post-migration the page serves locally on rack 1.
    assert_eq!(c1.read(gaddr(page_id, 0), 0x100), data);
    assert!(c1.cache.get(&page_id).is_some());
    assert_eq!(d1.stats.snapshot().page_swap, 1);
}

/// S3: at capacity the migration swaps out an unreferenced victim; both
/// pages change racks and the directory reflects the exchange.
#[test]
fn test_swap_at_full_capacity() {
    let cluster = test_cluster(&[(4, 1), (2, 1)]);
    let c0 = cluster.client(0, 0);
    let c1 = cluster.client(1, 0);
    let d0 = cluster.daemon(0);
    let d1 = cluster.daemon(1);

    let hot_page = c0.alloc_pages(1);
    let hot_data = pattern(hot_page, 0x80);
    c0.write(gaddr(hot_page, 0), &hot_data);

    // One local, untouched page on rack 1 leaves a single free slab, so
    // the migration must swap.
    let victim_page = c1.alloc_pages(1);
    let victim_data = pattern(victim_page, 0x80);
    {
        let meta = d1.page_table.table.get(&victim_page).unwrap();
        d1.cxl.write(meta.cxl_offset(), &victim_data);
    }
    assert!(d1.page_table.nearly_full());

    for _ in 0..4 {
        assert_eq!(c1.read(gaddr(hot_page, 0), 0x80), hot_data);
    }

    // Hot page came in, victim went out.
    assert!(d1.page_table.table.contains(&hot_page));
    assert!(!d1.page_table.table.contains(&victim_page));
    assert!(d0.page_table.table.contains(&victim_page));
    assert!(!d0.page_table.table.contains(&hot_page));

    let dir = &cluster.master.directory;
    assert_eq!(dir.find(hot_page).unwrap().owner().daemon_id, d1.daemon_id);
    assert_eq!(dir.find(victim_page).unwrap().owner().daemon_id, d0.daemon_id);

    // Both payloads survived the exchange.
    assert_eq!(c1.read(gaddr(hot_page, 0), 0x80), hot_data);
    assert_eq!(c0.read(gaddr(victim_page, 0), 0x80), victim_data);
}

/// R3: migrating a page away and then heating it from its old home brings
/// it back, with no dangling refs on either side.
#[test]
fn test_inverse_migration_restores_owner() {
    let cluster = test_cluster(&[(8, 1), (8, 1)]);
    let c0 = cluster.client(0, 0);
    let c1 = cluster.client(1, 0);
    let d0 = cluster.daemon(0);
    let d1 = cluster.daemon(1);

    let page_id = c0.alloc_pages(1);
    let data = pattern(page_id, 0x40);
    c0.write(gaddr(page_id, 0), &data);

    for _ in 0..4 {
        c1.read(gaddr(page_id, 0), 0x40);
    }
    assert!(d1.page_table.table.contains(&page_id));

    for _ in 0..4 {
        assert_eq!(c0.read(gaddr(page_id, 0), 0x40), data);
    }

    assert!(d0.page_table.table.contains(&page_id));
    assert!(!d1.page_table.table.contains(&page_id));
    assert_eq!(
        cluster.master.directory.find(page_id).unwrap().owner().daemon_id,
        d0.daemon_id
    );

    let meta = d0.page_table.table.get(&page_id).unwrap();
    assert!(meta.ref_daemon.lock().is_empty());
    assert!(!d0.hot_stats.contains(&page_id));
    assert!(!d1.hot_stats.contains(&page_id));
    assert_eq!(c0.read(gaddr(page_id, 0), 0x40), data);
}

/// S4 (system level): two daemons concurrently pulling pages off each
/// other make progress and end with every page resident on exactly the
/// daemon the directory names.
#[test]
fn test_concurrent_inverse_migrations() {
    let cluster = test_cluster(&[(8, 1), (8, 1)]);
    let c0 = cluster.client(0, 0).clone();
    let c1 = cluster.client(1, 0).clone();
    let d0 = cluster.daemon(0);
    let d1 = cluster.daemon(1);

    let page_a = c0.alloc_pages(1);
    let page_b = c1.alloc_pages(1);
    let data_a = pattern(page_a, 0x40);
    let data_b = pattern(page_b, 0x40);
    {
        let meta = d0.page_table.table.get(&page_a).unwrap();
        d0.cxl.write(meta.cxl_offset(), &data_a);
        let meta = d1.page_table.table.get(&page_b).unwrap();
        d1.cxl.write(meta.cxl_offset(), &data_b);
    }

    let t0 = thread::spawn(move || {
        for _ in 0..4 {
            assert_eq!(c0.read(gaddr(page_b, 0), 0x40), data_b);
        }
    });
    let t1 = thread::spawn(move || {
        for _ in 0..4 {
            assert_eq!(c1.read(gaddr(page_a, 0), 0x40), data_a);
        }
    });
    t0.join().unwrap();
    t1.join().unwrap();

    // P1: each page is resident on exactly the daemon the directory names.
    for page_id in [page_a, page_b] {
        let owner = cluster.master.directory.find(page_id).unwrap().owner();
        let mut resident = 0;
        for daemon in &cluster.daemons {
            if daemon.page_table.table.contains(&page_id) {
                resident += 1;
                assert_eq!(daemon.daemon_id, owner.daemon_id);
            }
        }
        assert_eq!(resident, 1, "page {} resident on {} daemons", page_id, resident);
    }
}

/// S5: the migration's page copy cannot start while a client invalidation
/// is still unacknowledged.
#[test]
fn test_invalidation_completes_before_copy() {
    let cluster = test_cluster(&[(4, 2), (4, 1)]);
    let c0a = cluster.client(0, 0);
    let c0b = cluster.client(0, 1);
    let c1 = cluster.client(1, 0);
    let d0 = cluster.daemon(0);
    let d1 = cluster.daemon(1);

    let page_id = c0a.alloc_pages(1);
    let data = pattern(page_id, 0x40);
    c0a.write(gaddr(page_id, 0), &data);

    // Second client holds a cache ref that the migration must invalidate.
    assert_eq!(c0b.read(gaddr(page_id, 0), 0x40), data);
    assert!(c0b.cache.get(&page_id).is_some());

    // Stall c0b's invalidation ack.
    let release = Arc::new(AtomicBool::new(false));
    {
        let release = release.clone();
        *c0b.hooks.before_remove_cache.lock() = Some(Box::new(move |_| {
            while !release.load(Ordering::Acquire) {
                thread::yield_now();
            }
        }));
    }

    let c1_clone = c1.clone();
    let migrator = thread::spawn(move || {
        for _ in 0..4 {
            c1_clone.read(gaddr(page_id, 0), 0x40);
        }
    });

    // While the ack is outstanding the page has not moved: the directory
    // still names rack 0 and rack 1's reserved slab is untouched.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(
        cluster.master.directory.find(page_id).unwrap().owner().daemon_id,
        d0.daemon_id
    );
    assert!(!d1.page_table.table.contains(&page_id));
    assert_eq!(d1.cxl.read(0, PAGE_SIZE), vec![0u8; PAGE_SIZE]);

    release.store(true, Ordering::Release);
    migrator.join().unwrap();

    assert!(d1.page_table.table.contains(&page_id));
    assert!(c0b.cache.get(&page_id).is_none());
    assert_eq!(c1.read(gaddr(page_id, 0), 0x40), data);
}
