//! Cached Block File
//!
//! A write-through, read-populated byte-range cache layered over an
//! asynchronous block file. Reads are assembled from cached bytes and
//! physical sub-reads of the gaps; writes always reach the lower file; copies
//! whose source is fully cached become writes of the cached bytes.
//!
//! # Architecture
//!
//! ```text
//!            caller
//!              │
//!              ▼
//!   ┌─────────────────────┐      ┌──────────────┐
//!   │   CachedBlockFile   │─────▶│  RangeLock   │  one per file
//!   │  (requests, pool,   │      └──────────────┘
//!   │   counters)         │      ┌──────────────┐
//!   │                     │─────▶│  ReadCache   │  shared, keyed by FileId
//!   └─────────┬───────────┘      └──────────────┘
//!             ▼
//!   ┌─────────────────────┐
//!   │   Lower BlockFile   │
//!   └─────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Reference range lock, read cache and lower files
//! - [`cached_file`] - The cached block file and its request types
//! - [`domain`] - Buffers, value objects and port traits
//! - [`error`] - Error types

pub mod adapters;
pub mod cached_file;
pub mod domain;
pub mod error;

// Re-export commonly used types
pub use cached_file::{CachedBlockFile, CachedFileConfig, Completion, CountersSnapshot};
pub use domain::{BlockFile, FileId, IoBuffer, IoPriority, RangeLock, ReadCache, WritePolicy};
pub use error::{Error, Result};
