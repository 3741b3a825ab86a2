//! Filesystem Block File
//!
//! A [`BlockFile`] over a regular file. Positional I/O runs on the blocking
//! thread pool so no runtime worker ever waits on the disk.
//!
//! Write-through files call `sync_data` after every write and copy.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::domain::buffer::IoBuffer;
use crate::domain::ports::{BlockFile, IoPriority};
use crate::error::{Error, Result};

/// Chunk size used when copying within the file.
const COPY_CHUNK_SIZE: usize = 1024 * 1024;

/// Block file over a local filesystem file.
pub struct FsBlockFile {
    name: String,
    path: PathBuf,
    file: Arc<File>,
    size: Arc<AtomicU64>,
    write_through: bool,
    io_permits: Semaphore,
    background_permits: Arc<Semaphore>,
    background_limit: Mutex<usize>,
    cancel_all: Mutex<CancellationToken>,
    closed: AtomicBool,
}

impl FsBlockFile {
    /// Open (creating if needed) the file at `path`.
    pub fn open(path: impl AsRef<Path>, write_through: bool, max_concurrent_io: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let size = file.metadata()?.len();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        debug!(path = %path.display(), size, "Opened block file");
        Ok(Self {
            name,
            path,
            file: Arc::new(file),
            size: Arc::new(AtomicU64::new(size)),
            write_through,
            io_permits: Semaphore::new(max_concurrent_io.max(1)),
            background_permits: Arc::new(Semaphore::new(2)),
            background_limit: Mutex::new(2),
            cancel_all: Mutex::new(CancellationToken::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::FileClosed)
        } else {
            Ok(())
        }
    }

    /// Wait for the permits an I/O of `priority` needs, honoring cancellation.
    async fn admit(
        &self,
        priority: IoPriority,
        cancel: &CancellationToken,
    ) -> Result<(tokio::sync::SemaphorePermit<'_>, Option<tokio::sync::OwnedSemaphorePermit>)> {
        self.ensure_open()?;
        let cancel_all = self.cancel_all.lock().clone();
        let background = Arc::clone(&self.background_permits);

        let wait = async {
            let permit = self
                .io_permits
                .acquire()
                .await
                .map_err(|e| Error::Internal(format!("semaphore error: {}", e)))?;
            let background = match priority {
                IoPriority::Foreground => None,
                IoPriority::Background => Some(
                    background
                        .acquire_owned()
                        .await
                        .map_err(|e| Error::Internal(format!("semaphore error: {}", e)))?,
                ),
            };
            Ok::<_, Error>((permit, background))
        };

        let permits = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = cancel_all.cancelled() => Err(Error::Cancelled),
            permits = wait => permits,
        };
        let permits = permits?;
        self.ensure_open()?;
        Ok(permits)
    }

    /// Run a blocking closure against the file on the blocking pool.
    async fn blocking<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&File) -> std::io::Result<T> + Send + 'static,
    {
        let file = Arc::clone(&self.file);
        let result = tokio::task::spawn_blocking(move || f(&file))
            .await
            .map_err(|e| Error::Internal(format!("blocking {} task failed: {}", operation, e)))?;
        result.map_err(|e| {
            warn!(file = %self.name, operation, error = %e, "Filesystem I/O failed");
            Error::lower_file(operation, e.to_string())
        })
    }

    fn extend_size(&self, end: u64) {
        self.size.fetch_max(end, Ordering::AcqRel);
    }
}

#[async_trait]
impl BlockFile for FsBlockFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    fn is_write_through(&self) -> bool {
        self.write_through
    }

    #[instrument(skip(self, buf, cancel), fields(file = %self.name, length = buf.len()))]
    async fn read(
        &self,
        priority: IoPriority,
        offset: u64,
        buf: BytesMut,
        cancel: CancellationToken,
    ) -> Result<Bytes> {
        let length = buf.len() as u64;
        let _permits = self.admit(priority, &cancel).await?;

        let size = self.size();
        if offset.checked_add(length).map_or(true, |end| end > size) {
            return Err(Error::OutOfBounds {
                offset,
                length,
                size,
            });
        }

        let mut buf = buf;
        let buf = self
            .blocking("read", move |file| {
                file.read_exact_at(&mut buf, offset)?;
                Ok(buf)
            })
            .await?;
        Ok(buf.freeze())
    }

    #[instrument(skip(self, data, cancel), fields(file = %self.name, length = data.size()))]
    async fn write(
        &self,
        priority: IoPriority,
        offset: u64,
        data: IoBuffer,
        cancel: CancellationToken,
    ) -> Result<()> {
        let length = data.size();
        let end = offset.checked_add(length).ok_or(Error::OutOfBounds {
            offset,
            length,
            size: self.size(),
        })?;
        let _permits = self.admit(priority, &cancel).await?;

        let sync = self.write_through;
        self.blocking("write", move |file| {
            for (at, element) in data.elements_at(offset) {
                file.write_all_at(element, at)?;
            }
            if sync {
                file.sync_data()?;
            }
            Ok(())
        })
        .await?;

        self.extend_size(end);
        Ok(())
    }

    #[instrument(skip(self, cancel), fields(file = %self.name))]
    async fn copy(
        &self,
        priority: IoPriority,
        source: u64,
        target: u64,
        length: u64,
        cancel: CancellationToken,
    ) -> Result<()> {
        let size = self.size();
        let out_of_bounds = Error::OutOfBounds {
            offset: source,
            length,
            size,
        };
        if source.checked_add(length).map_or(true, |end| end > size) {
            return Err(out_of_bounds);
        }
        let end = target.checked_add(length).ok_or(out_of_bounds)?;
        let _permits = self.admit(priority, &cancel).await?;

        let sync = self.write_through;
        self.blocking("copy", move |file| {
            let mut chunk = vec![0u8; COPY_CHUNK_SIZE.min(length as usize)];
            let mut done = 0u64;
            while done < length {
                let n = (length - done).min(chunk.len() as u64) as usize;
                file.read_exact_at(&mut chunk[..n], source + done)?;
                file.write_all_at(&chunk[..n], target + done)?;
                done += n as u64;
            }
            if sync {
                file.sync_data()?;
            }
            Ok(())
        })
        .await?;

        self.extend_size(end);
        Ok(())
    }

    async fn set_file_size(&self, size: u64) -> Result<()> {
        self.ensure_open()?;
        self.blocking("set_file_size", move |file| file.set_len(size))
            .await?;
        self.size.store(size, Ordering::Release);
        debug!(file = %self.name, size, "Resized file");
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        self.blocking("flush", |file| file.sync_data()).await
    }

    fn cancel_all(&self) {
        let mut token = self.cancel_all.lock();
        token.cancel();
        *token = CancellationToken::new();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.cancel_all();
    }

    fn set_background_queue_length(&self, length: usize) {
        let length = length.max(1);
        let mut limit = self.background_limit.lock();
        if length > *limit {
            self.background_permits.add_permits(length - *limit);
        } else if length < *limit {
            // Retire surplus permits as they come back
            let surplus = (*limit - length) as u32;
            let permits = Arc::clone(&self.background_permits);
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    if let Ok(permit) = permits.acquire_many_owned(surplus).await {
                        permit.forget();
                    }
                });
            }
        }
        *limit = length;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[tokio::test]
    async fn test_write_read_roundtrip_on_disk() {
        let dir = TempDir::new("fs_block_file").unwrap();
        let file = FsBlockFile::open(dir.path().join("data.bin"), true, 8).unwrap();
        assert_eq!(file.name(), "data.bin");

        let data: IoBuffer = vec![Bytes::from_static(b"abc"), Bytes::from_static(b"def")]
            .into_iter()
            .collect();
        file.write(IoPriority::Foreground, 2, data, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(file.size(), 8);

        let read = file
            .read(IoPriority::Foreground, 2, BytesMut::zeroed(6), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(&read[..], b"abcdef");
    }

    #[tokio::test]
    async fn test_copy_and_truncate() {
        let dir = TempDir::new("fs_block_file").unwrap();
        let path = dir.path().join("copy.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        let file = FsBlockFile::open(&path, false, 8).unwrap();
        file.copy(IoPriority::Background, 0, 10, 4, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"01234567890123");

        file.set_file_size(5).await.unwrap();
        assert_eq!(file.size(), 5);
        assert_eq!(std::fs::read(&path).unwrap(), b"01234");
    }

    #[tokio::test]
    async fn test_closed_file() {
        let dir = TempDir::new("fs_block_file").unwrap();
        let file = FsBlockFile::open(dir.path().join("closed.bin"), false, 1).unwrap();
        file.close();
        assert!(matches!(file.flush().await, Err(Error::FileClosed)));
    }
}
