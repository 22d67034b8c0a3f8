//! rackmem - rack-scale disaggregated memory pool.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐   latch / directory RPC   ┌────────────┐
//! │   Master   │◄──────────────────────────►│   Daemon   │ (one per rack,
//! │  page dir  │                            │ page table │  owns the rack's
//! └────────────┘                            │ hot stats  │  CXL memory)
//!                                           └─────▲──────┘
//!                        one-sided RDMA  ┌────────┘│ msgq (shared memory)
//!                        to peer daemons │    ┌────▼─────┐
//!                                        │    │  Client  │ (many per rack,
//!                                        │    │ pagecache│  local CXL access)
//!                                        ▼    └──────────┘
//! ```
//!
//! Clients address memory through a global address space; each 2 MiB page
//! is resident on exactly one daemon. A client access that misses the local
//! rack is served by its daemon either as proxy I/O (one-sided RDMA against
//! the owner) while the page is cold, or by migrating the page into the
//! local rack once its access heat reaches the watermark. The master's
//! per-page latch serializes migrations cluster-wide.

pub mod client;
pub mod config;
pub mod cxl;
pub mod daemon;
pub mod error;
pub mod fabric;
pub mod master;
pub mod msgq;
pub mod proto;
pub mod rdma;
pub mod rpc;
pub mod stats;
pub mod types;

pub use error::{Error, Result};
pub use types::{GlobalAddr, MacId, PageId, RackId, INVALID_PAGE_ID, PAGE_SIZE};
