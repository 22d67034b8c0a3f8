//! Master role: the global page directory and the migration latch protocol.

pub mod directory;
pub mod latch;
pub mod service;

pub use directory::{IdAllocator, PageDirectory, PageOwner, PageRackMeta, RackTable};
pub use latch::PageLatch;
pub use service::MasterContext;
