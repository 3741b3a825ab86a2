//! Infrastructure Adapters
//!
//! Reference implementations of the domain ports, following the
//! Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │        RangeLock  │  ReadCache  │  BlockFile               │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ InMemoryRangeLock │ InMemoryReadCache │ MemoryBlockFile    │ │
//! │  │ FsBlockFile       │ CounterExporter                        │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use cached_block_file::adapters::{InMemoryReadCache, MemoryBlockFile};
//! use cached_block_file::cached_file::{CachedBlockFile, CachedFileConfig};
//!
//! let cache = Arc::new(InMemoryReadCache::default());
//! let lower = Arc::new(MemoryBlockFile::default());
//! let file = CachedBlockFile::new(FileId::new(), lower, cache, CachedFileConfig::default())?;
//! ```

mod exporter;
#[cfg(unix)]
mod fs_file;
mod memory_file;
mod range_lock;
mod read_cache;

pub use exporter::CounterExporter;
#[cfg(unix)]
pub use fs_file::FsBlockFile;
pub use memory_file::{MemoryBlockFile, MemoryBlockFileConfig, MemoryFileStats};
pub use range_lock::InMemoryRangeLock;
pub use read_cache::{InMemoryReadCache, ReadCacheConfig, ReadCacheStats};
