//! Cold-path proxy I/O and invalidation idempotence.

mod common;

use common::{gaddr, pattern, test_cluster};
use rackmem::proto::client::RemovePageCacheRequest;
use rackmem::proto::daemon::DelPageRdmaRefRequest;

/// S1: a cold remote read is served by proxy RDMA, leaves an RDMA ref on
/// the owner, and seeds the hot-stats entry at heat 1.
#[test]
fn test_cold_read_proxies() {
    let cluster = test_cluster(&[(4, 1), (4, 1)]);
    let c0 = cluster.client(0, 0);
    let c1 = cluster.client(1, 0);

    let page_id = c0.alloc_pages(1);
    let data = pattern(page_id, 0x2000);
    c0.write(gaddr(page_id, 0), &data);

    let read = c1.read(gaddr(page_id, 0x1000), 64);
    assert_eq!(read, &data[0x1000..0x1040]);

    let d0 = cluster.daemon(0);
    let d1 = cluster.daemon(1);

    // Owner records the proxying daemon as a ref holder.
    let meta = d0.page_table.table.get(&page_id).unwrap();
    assert!(meta.ref_daemon.lock().contains(&d1.daemon_id));

    // Proxying daemon caches the owner's handle at heat 1.
    let cache = d1.hot_stats.get(&page_id).unwrap();
    assert_eq!(cache.stats.lock().value(), 1);
    assert_eq!(cache.remote_daemon_id, d0.daemon_id);

    // The client side saw proxy data, not a local mapping.
    assert!(c1.cache.get(&page_id).is_none());

    let stats = d1.stats.snapshot();
    assert_eq!(stats.page_miss, 1);
    assert_eq!(stats.page_dio, 1);
    assert_eq!(stats.page_swap, 0);
}

/// A cold remote write lands in the owner's slab without migrating.
#[test]
fn test_cold_write_raw_proxies() {
    let cluster = test_cluster(&[(4, 1), (4, 1)]);
    let c0 = cluster.client(0, 0);
    let c1 = cluster.client(1, 0);

    let page_id = c0.alloc_pages(1);
    c1.write(gaddr(page_id, 0x800), b"remote write");

    // Still owned by rack 0; the write is visible there.
    assert!(cluster.daemon(0).page_table.table.contains(&page_id));
    assert_eq!(c0.read(gaddr(page_id, 0x800), 12), b"remote write");
    assert_eq!(cluster.daemon(1).stats.snapshot().page_dio, 1);
}

/// A local access is a hit: the client gets a CXL mapping and later reads
/// bypass the daemon.
#[test]
fn test_local_access_hits() {
    let cluster = test_cluster(&[(4, 1)]);
    let c0 = cluster.client(0, 0);

    let page_id = c0.alloc_pages(1);
    c0.write(gaddr(page_id, 0), b"local");
    assert_eq!(c0.read(gaddr(page_id, 0), 5), b"local");

    assert!(c0.cache.get(&page_id).is_some());
    let meta = cluster.daemon(0).page_table.table.get(&page_id).unwrap();
    assert!(meta.ref_client.lock().contains(&c0.client_id));
}

/// R1: delPageRDMARef is idempotent on both the ref set and the remote
/// cache.
#[test]
fn test_del_page_rdma_ref_idempotent() {
    let cluster = test_cluster(&[(4, 1), (4, 1)]);
    let c0 = cluster.client(0, 0);
    let c1 = cluster.client(1, 0);

    let page_id = c0.alloc_pages(1);
    c1.read(gaddr(page_id, 0), 8);

    let d0 = cluster.daemon(0);
    let d1 = cluster.daemon(1);
    assert!(d1.hot_stats.contains(&page_id));

    // Owner tells the ref holder to drop its cached handle.
    let req = DelPageRdmaRefRequest {
        mac_id: d0.daemon_id,
        page_id,
    };
    rackmem::daemon::service::del_page_rdma_ref(d1, req.clone());
    assert!(!d1.hot_stats.contains(&page_id));
    rackmem::daemon::service::del_page_rdma_ref(d1, req);
    assert!(!d1.hot_stats.contains(&page_id));

    // Holder tells the owner it dropped its ref.
    let req = DelPageRdmaRefRequest {
        mac_id: d1.daemon_id,
        page_id,
    };
    rackmem::daemon::service::del_page_rdma_ref(d0, req.clone());
    let meta = d0.page_table.table.get(&page_id).unwrap();
    assert!(!meta.ref_daemon.lock().contains(&d1.daemon_id));
    rackmem::daemon::service::del_page_rdma_ref(d0, req);
    let meta = d0.page_table.table.get(&page_id).unwrap();
    assert!(!meta.ref_daemon.lock().contains(&d1.daemon_id));
}

/// R2: removePageCache is idempotent.
#[test]
fn test_remove_page_cache_idempotent() {
    let cluster = test_cluster(&[(4, 1)]);
    let c0 = cluster.client(0, 0);

    let page_id = c0.alloc_pages(1);
    c0.write(gaddr(page_id, 0), b"x");
    assert!(c0.cache.get(&page_id).is_some());

    let req = RemovePageCacheRequest {
        mac_id: c0.daemon_id,
        page_id,
    };
    c0.remove_page_cache(&req);
    assert!(c0.cache.get(&page_id).is_none());
    c0.remove_page_cache(&req);
    assert!(c0.cache.get(&page_id).is_none());
}

/// The reserved pull-based write surface answers with the staged buffer.
#[test]
fn test_get_current_write_data() {
    let cluster = test_cluster(&[(4, 1)]);
    let c0 = cluster.client(0, 0);

    c0.stage_write_data(0xdead_0000, b"staged payload".to_vec());
    let reply = c0.get_current_write_data(&rackmem::proto::client::GetCurrentWriteDataRequest {
        mac_id: c0.daemon_id,
        write_buf: 0xdead_0000,
        write_size: 6,
    });
    assert_eq!(reply.data, b"staged");

    let reply = c0.get_current_write_data(&rackmem::proto::client::GetCurrentWriteDataRequest {
        mac_id: c0.daemon_id,
        write_buf: 0xbeef_0000,
        write_size: 6,
    });
    assert!(reply.data.is_empty());
}
