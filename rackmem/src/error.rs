//! Error types for rackmem.

use crate::types::{MacId, PageId, RackId};

/// Pool operation errors.
///
/// Core paths treat most of these as fatal (spec'd behavior: a migration
/// either completes end-to-end or the process dies); the enum exists so the
/// failing lookup names what was missing.
#[derive(Debug)]
pub enum Error {
    /// Page is not present in the consulted table or directory.
    PageNotFound(PageId),
    /// No rack table registered under this rack id.
    RackNotFound(RackId),
    /// No connection registered under this mac id.
    ConnNotFound(MacId),
    /// An allocator (page ids, rack quota, CXL slabs) ran out.
    CapacityExceeded(&'static str),
    /// Operation is deliberately not supported.
    Unsupported(&'static str),
    /// RPC or RDMA failure reported by the transport.
    Transport(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::PageNotFound(id) => write!(f, "page {} not found", id),
            Error::RackNotFound(id) => write!(f, "rack {} not found", id),
            Error::ConnNotFound(id) => write!(f, "connection for mac {} not found", id),
            Error::CapacityExceeded(what) => write!(f, "capacity exceeded: {}", what),
            Error::Unsupported(what) => write!(f, "not supported: {}", what),
            Error::Transport(msg) => write!(f, "transport error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

/// Result type for rackmem operations.
pub type Result<T> = std::result::Result<T, Error>;
