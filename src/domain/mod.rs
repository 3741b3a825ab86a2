//! Domain Layer
//!
//! Core value types and the port traits the cached block file is built on.
//!
//! # Architecture
//!
//! - **Buffers** (`buffer.rs`) - Immutable multi-element I/O buffers
//! - **Ports** (`ports.rs`) - Trait abstractions for the range lock, the
//!   read cache and the lower block file
//!
//! # Usage
//!
//! ```ignore
//! use cached_block_file::domain::{BlockFile, IoPriority};
//!
//! async fn read_header<F: BlockFile>(file: &F) -> Result<Bytes> {
//!     file.read(IoPriority::Foreground, 0, BytesMut::zeroed(512), CancellationToken::new())
//!         .await
//! }
//! ```

pub mod buffer;
pub mod ports;

// Re-export commonly used types
pub use buffer::IoBuffer;
pub use ports::{
    // Port traits
    BlockFile,
    // Value objects
    EvictionRegistration,
    FileId,
    IoPriority,
    RangeLock,
    RangeToken,
    ReadCache,
    WritePolicy,
};
