//! Shared harness for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

use cached_block_file::adapters::{InMemoryReadCache, MemoryBlockFile, MemoryBlockFileConfig};
use cached_block_file::{
    BlockFile, CachedBlockFile, CachedFileConfig, Error, FileId, IoBuffer, IoPriority, Result,
    WritePolicy,
};

// =============================================================================
// Controlled Block File
// =============================================================================

/// Lower file wrapper that can hold issued transfers at a gate and inject
/// failures.
///
/// A transfer counts as issued once it reaches the gate; from then on it
/// ignores cancellation, like a transfer handed to a device.
pub struct ControlledBlockFile {
    inner: MemoryBlockFile,
    gate: watch::Sender<bool>,
    issued: AtomicUsize,
    issued_changed: Notify,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_copies: AtomicBool,
}

impl ControlledBlockFile {
    pub fn new(contents: Vec<u8>) -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            inner: MemoryBlockFile::with_contents(
                MemoryBlockFileConfig {
                    name: "controlled".to_string(),
                    ..Default::default()
                },
                contents,
            ),
            gate,
            issued: AtomicUsize::new(0),
            issued_changed: Notify::new(),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            fail_copies: AtomicBool::new(false),
        }
    }

    pub fn inner(&self) -> &MemoryBlockFile {
        &self.inner
    }

    pub fn close_gate(&self) {
        self.gate.send_replace(false);
    }

    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_copies(&self, fail: bool) {
        self.fail_copies.store(fail, Ordering::SeqCst);
    }

    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    /// Physical reads, writes and copies completed by the inner file.
    pub fn physical_transfers(&self) -> u64 {
        self.inner.stats().physical_transfers()
    }

    /// Wait until at least `count` transfers have been issued.
    pub async fn wait_issued(&self, count: usize) {
        loop {
            let changed = self.issued_changed.notified();
            if self.issued() >= count {
                return;
            }
            changed.await;
        }
    }

    async fn issue(&self) {
        self.issued.fetch_add(1, Ordering::SeqCst);
        self.issued_changed.notify_waiters();

        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
    }
}

#[async_trait]
impl BlockFile for ControlledBlockFile {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn is_write_through(&self) -> bool {
        self.inner.is_write_through()
    }

    async fn read(
        &self,
        priority: IoPriority,
        offset: u64,
        buf: BytesMut,
        cancel: CancellationToken,
    ) -> Result<Bytes> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.issue().await;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::lower_file("read", "injected failure"));
        }
        self.inner
            .read(priority, offset, buf, CancellationToken::new())
            .await
    }

    async fn write(
        &self,
        priority: IoPriority,
        offset: u64,
        data: IoBuffer,
        cancel: CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.issue().await;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::lower_file("write", "injected failure"));
        }
        self.inner
            .write(priority, offset, data, CancellationToken::new())
            .await
    }

    async fn copy(
        &self,
        priority: IoPriority,
        source: u64,
        target: u64,
        length: u64,
        cancel: CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.issue().await;
        if self.fail_copies.load(Ordering::SeqCst) {
            return Err(Error::lower_file("copy", "injected failure"));
        }
        self.inner
            .copy(priority, source, target, length, CancellationToken::new())
            .await
    }

    async fn set_file_size(&self, size: u64) -> Result<()> {
        self.inner.set_file_size(size).await
    }

    async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }

    fn cancel_all(&self) {
        self.inner.cancel_all();
    }

    fn close(&self) {
        self.inner.close();
    }

    fn set_background_queue_length(&self, length: usize) {
        self.inner.set_background_queue_length(length);
    }
}

// =============================================================================
// Setup
// =============================================================================

pub struct TestFile {
    pub lower: Arc<ControlledBlockFile>,
    pub cache: Arc<InMemoryReadCache>,
    pub file: CachedBlockFile,
}

impl TestFile {
    pub fn id(&self) -> FileId {
        self.file.file_id()
    }
}

pub fn setup(contents: Vec<u8>, write_policy: WritePolicy) -> TestFile {
    let lower = Arc::new(ControlledBlockFile::new(contents));
    let cache = Arc::new(InMemoryReadCache::default());
    let file = CachedBlockFile::new(
        FileId::new(),
        lower.clone(),
        cache.clone(),
        CachedFileConfig {
            write_policy,
            ..Default::default()
        },
    )
    .expect("valid config");

    TestFile { lower, cache, file }
}

/// Deterministic non-repeating-looking test data.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i * 31 + seed as usize * 7) % 251) as u8)
        .collect()
}
