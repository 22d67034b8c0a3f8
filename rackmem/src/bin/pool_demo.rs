//! Boot an in-process cluster and drive a migration-heavy workload.
//!
//! Clients on rack 1 hammer pages homed on rack 0; once a page's heat hits
//! the watermark it migrates over. Stats counters at the end show the
//! hit/proxy/migrate split per daemon.

use clap::Parser;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use rackmem::config::DaemonOptions;
use rackmem::fabric::Cluster;
use rackmem::types::GlobalAddr;

#[derive(Parser, Debug)]
#[command(about = "rackmem in-process demo")]
struct Args {
    /// Number of racks (one daemon each).
    #[arg(long, default_value_t = 2)]
    racks: usize,

    /// Clients per rack.
    #[arg(long, default_value_t = 1)]
    clients: usize,

    /// CXL page slabs per rack.
    #[arg(long, default_value_t = 32)]
    slabs: usize,

    /// Pages to allocate from rack 0.
    #[arg(long, default_value_t = 8)]
    pages: usize,

    /// Accesses per client.
    #[arg(long, default_value_t = 200)]
    ops: usize,

    /// RNG seed.
    #[arg(long, default_value_t = 1)]
    seed: u64,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    assert!(args.racks >= 2, "need at least two racks");

    let mut builder = Cluster::builder().daemon_options(DaemonOptions {
        // Count every access; the demo's loop is far faster than the
        // default 50µs coalescing window.
        hot_stat_window_us: 0,
        hot_decay_lambda: 0.0,
        ..DaemonOptions::default()
    });
    for _ in 0..args.racks {
        builder = builder.rack(args.slabs, args.clients);
    }
    let cluster = builder.build();

    // Home a run of pages on rack 0 and seed them with a pattern.
    let home = cluster.client(0, 0);
    let start_page = home.alloc_pages(args.pages);
    for p in 0..args.pages {
        let page_id = start_page + p as u64;
        home.write(GlobalAddr::new(page_id, 0), &page_id.to_le_bytes());
    }

    // Remote clients hammer the pages until the hot ones migrate over.
    let mut rng = SmallRng::seed_from_u64(args.seed);
    for _ in 0..args.ops {
        let page_id = start_page + rng.gen_range(0..args.pages) as u64;
        for (rack, rack_clients) in cluster.clients.iter().enumerate().skip(1) {
            for (idx, _) in rack_clients.iter().enumerate() {
                let data = cluster.client(rack, idx).read(GlobalAddr::new(page_id, 0), 8);
                assert_eq!(data, page_id.to_le_bytes());
            }
        }
    }

    for (rack, daemon) in cluster.daemons.iter().enumerate() {
        let stats = daemon.stats.snapshot();
        println!(
            "daemon {} (rack {}): hit={} miss={} dio={} swap={} resident={}",
            daemon.daemon_id,
            rack,
            stats.page_hit,
            stats.page_miss,
            stats.page_dio,
            stats.page_swap,
            daemon.page_table.table.len(),
        );
    }
    println!("master: page_swaps={}", cluster.master.stats.page_swaps());
}
