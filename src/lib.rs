// slabstore - In-process object store for short immutable byte strings
//
// Objects (1..=255 bytes) are grouped by length into per-size pools of
// anonymously mapped slabs. An object's address doubles as its handle.

#![warn(rust_2018_idioms)]

pub mod config;
pub mod store;

// Re-exports for convenience
pub use config::StoreConfig;
pub use store::{ObjAddr, ObjectStore, SlabAddr, SlabPool, StoreStats};

/// slabstore error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        /// Object sizes are limited to 1..=255 bytes.
        #[error("object size {0} is outside limits (1-255)")]
        InvalidSize(usize),

        /// The OS refused the anonymous memory mapping for a new slab.
        #[error("anonymous memory mapping failed: {0}")]
        AllocFailed(std::io::Error),

        /// The address does not point into any slab known to the store.
        #[error("address {0:#x} does not resolve to any known slab")]
        AddressNotResolved(usize),

        /// No pool serves the requested object size.
        #[error("no pool serves object size {0}")]
        PoolNotFound(u8),

        /// A slab address handed to a pool does not belong to it.
        #[error("slab {0:#x} is not known to this pool")]
        SlabNotFound(usize),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
