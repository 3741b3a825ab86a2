//! Concurrency Integration Tests
//!
//! Range exclusion, deadlock freedom and cancellation behaviour of the
//! cached layer under concurrent requests.

mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinSet;

use cached_block_file::{Completion, Error, IoPriority, ReadCache, WritePolicy};
use cached_block_file::cached_file::TransferRequest;
use common::{pattern, setup, TestFile};

// =============================================================================
// Range Exclusion
// =============================================================================

mod exclusion_tests {
    use super::*;

    #[tokio::test]
    async fn test_truncate_waits_for_inflight_read() {
        let data = pattern(4096, 1);
        let t = setup(data.clone(), WritePolicy::CacheOnWrite);

        t.lower.close_gate();
        let read = t.file.read(IoPriority::Foreground, 1000, 1000, None).unwrap();
        t.lower.wait_issued(1).await;

        let truncate = t.file.set_file_size(500, None).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!truncate.is_finished());
        assert_eq!(t.file.size(), 4096);

        t.lower.open_gate();
        let buffer = read.await.unwrap();
        assert_eq!(buffer.to_vec(), data[1000..2000]);

        truncate.await.unwrap();
        assert_eq!(t.file.size(), 500);
        // Bytes read before the truncate are not served afterwards
        assert!(t.cache.query(t.id(), 1000).is_none());
    }

    #[tokio::test]
    async fn test_disjoint_requests_do_not_wait() {
        let t = setup(pattern(8192, 2), WritePolicy::CacheOnWrite);

        t.lower.close_gate();
        let blocked = t.file.read(IoPriority::Foreground, 0, 100, None).unwrap();
        t.lower.wait_issued(1).await;

        // Disjoint range: reaches the lower file while the first is held
        let other = t
            .file
            .write(IoPriority::Foreground, 4096, Bytes::from_static(b"abc"), None)
            .unwrap();
        t.lower.wait_issued(2).await;

        t.lower.open_gate();
        blocked.await.unwrap();
        other.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_overlapping_writes_are_atomic_to_readers() {
        let t = Arc::new(setup(vec![0; 8192], WritePolicy::CacheOnWrite));
        let mut tasks = JoinSet::new();

        for fill in 1..=16u8 {
            let t = Arc::clone(&t);
            tasks.spawn(async move {
                t.file
                    .write(IoPriority::Foreground, 1024, Bytes::from(vec![fill; 4096]), None)
                    .unwrap()
                    .await
                    .unwrap();
            });
        }
        for _ in 0..16 {
            let t = Arc::clone(&t);
            tasks.spawn(async move {
                let data = t
                    .file
                    .read(IoPriority::Background, 1024, 4096, None)
                    .unwrap()
                    .await
                    .unwrap()
                    .to_vec();
                assert!(data.iter().all(|b| *b == data[0]), "torn read observed");
            });
        }

        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }
    }
}

// =============================================================================
// Deadlock Freedom
// =============================================================================

mod deadlock_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reversed_copy_pairs_complete() {
        const BLOCK: u64 = 256;
        const BLOCKS: u64 = 64;

        let t = Arc::new(setup(pattern((BLOCK * BLOCKS) as usize, 3), WritePolicy::CacheOnWrite));
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut tasks = JoinSet::new();

        for _ in 0..100 {
            let a = rng.gen_range(0..BLOCKS);
            let mut b = rng.gen_range(0..BLOCKS);
            if a == b {
                b = (b + 1) % BLOCKS;
            }

            for (source, target) in [(a, b), (b, a)] {
                let t = Arc::clone(&t);
                let priority = if rng.gen_bool(0.5) {
                    IoPriority::Foreground
                } else {
                    IoPriority::Background
                };
                tasks.spawn(async move {
                    t.file
                        .copy(priority, source * BLOCK, target * BLOCK, BLOCK, None)
                        .unwrap()
                        .await
                });
            }
        }

        let drained = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(joined) = tasks.join_next().await {
                joined.unwrap().unwrap();
            }
        })
        .await;
        assert!(drained.is_ok(), "copies deadlocked");
        assert_eq!(t.file.counters().copy_count, 200);
    }

    /// Queue a gated write on `[0, 10)`, then a copy out of it, then `second`
    /// spanning both the copy's ranges, and open the gate.
    async fn queue_behind_copy<F, T>(
        t: &TestFile,
        second: F,
    ) -> (Completion<(), TransferRequest>, T)
    where
        F: FnOnce(&TestFile) -> T,
    {
        t.lower.close_gate();
        let blocker = t
            .file
            .write(IoPriority::Foreground, 0, Bytes::from(vec![7; 10]), None)
            .unwrap();
        t.lower.wait_issued(1).await;

        let copy = t.file.copy(IoPriority::Foreground, 0, 100, 10, None).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let queued = second(t);
        tokio::time::sleep(Duration::from_millis(10)).await;

        t.lower.open_gate();
        blocker.await.unwrap();
        (copy, queued)
    }

    #[tokio::test]
    async fn test_copy_completes_past_read_spanning_both_ranges() {
        let t = setup(pattern(4096, 6), WritePolicy::NoCacheOnWrite);
        let (copy, read) = queue_behind_copy(&t, |t| {
            t.file.read(IoPriority::Foreground, 5, 100, None).unwrap()
        })
        .await;

        let drained = tokio::time::timeout(Duration::from_secs(3), async {
            copy.await.unwrap();
            read.await.unwrap()
        })
        .await;
        let buffer = drained.expect("copy and read deadlocked");
        assert_eq!(buffer.size(), 100);
        assert_eq!(t.lower.inner().contents_at(100, 10), vec![7; 10]);
    }

    #[tokio::test]
    async fn test_copies_of_different_lengths_complete() {
        let t = setup(pattern(4096, 7), WritePolicy::NoCacheOnWrite);
        let (copy, other) = queue_behind_copy(&t, |t| {
            t.file.copy(IoPriority::Background, 5, 200, 100, None).unwrap()
        })
        .await;

        let drained = tokio::time::timeout(Duration::from_secs(3), async {
            copy.await.unwrap();
            other.await.unwrap();
        })
        .await;
        assert!(drained.is_ok(), "copies deadlocked");
        assert_eq!(t.file.counters().copy_count, 2);
    }

    #[tokio::test]
    async fn test_copy_completes_past_truncate_spanning_both_ranges() {
        let t = setup(pattern(4096, 8), WritePolicy::CacheOnWrite);
        let (copy, truncate) =
            queue_behind_copy(&t, |t| t.file.set_file_size(5, None).unwrap()).await;

        let drained = tokio::time::timeout(Duration::from_secs(3), async {
            let copied = copy.await;
            let truncated = truncate.await;
            (copied, truncated)
        })
        .await;
        let (copied, truncated) = drained.expect("copy and truncate deadlocked");
        copied.unwrap();
        truncated.unwrap();
        assert_eq!(t.file.size(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mixed_unaligned_workload_completes() {
        const SIZE: u64 = 16 * 1024;
        const MAX_LEN: u64 = 2048;

        let t = Arc::new(setup(pattern(SIZE as usize, 9), WritePolicy::CacheOnWrite));
        let mut rng = StdRng::seed_from_u64(0xdead_10c);
        let mut tasks = JoinSet::new();

        for _ in 0..400 {
            let t = Arc::clone(&t);
            let length = rng.gen_range(1..=MAX_LEN);
            let offset = rng.gen_range(0..SIZE - length);
            let priority = if rng.gen_bool(0.5) {
                IoPriority::Foreground
            } else {
                IoPriority::Background
            };

            // Outcomes vary with interleaving and file size; only completion matters
            match rng.gen_range(0..10) {
                0..=4 => {
                    let mut target = rng.gen_range(0..SIZE - length);
                    while target.abs_diff(offset) < length {
                        target = rng.gen_range(0..SIZE - length);
                    }
                    tasks.spawn(async move {
                        let _ = t.file.copy(priority, offset, target, length, None).unwrap().await;
                    });
                }
                5 | 6 => {
                    tasks.spawn(async move {
                        let _ = t.file.read(priority, offset, length, None).unwrap().await;
                    });
                }
                7 | 8 => {
                    let fill = rng.gen::<u8>();
                    tasks.spawn(async move {
                        let data = Bytes::from(vec![fill; length as usize]);
                        let _ = t.file.write(priority, offset, data, None).unwrap().await;
                    });
                }
                _ => {
                    let new_size = rng.gen_range(SIZE / 2..=SIZE);
                    tasks.spawn(async move {
                        let _ = t.file.set_file_size(new_size, None).unwrap().await;
                    });
                }
            }
        }

        let drained = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(joined) = tasks.join_next().await {
                joined.unwrap();
            }
        })
        .await;
        assert!(drained.is_ok(), "mixed workload deadlocked");
    }
}

// =============================================================================
// Cancellation
// =============================================================================

mod cancellation_tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_while_waiting_for_range() {
        let t = setup(pattern(4096, 4), WritePolicy::NoCacheOnWrite);

        t.lower.close_gate();
        let write = t
            .file
            .write(IoPriority::Foreground, 0, Bytes::from(vec![9; 100]), None)
            .unwrap();
        t.lower.wait_issued(1).await;

        let read = t.file.read(IoPriority::Foreground, 50, 100, None).unwrap();
        tokio::task::yield_now().await;
        read.cancel();
        assert_matches!(read.await, Err(Error::Cancelled));

        t.lower.open_gate();
        write.await.unwrap();

        assert_eq!(t.lower.issued(), 1);
        assert_eq!(t.cache.entry_count(t.id()), 0);
        assert_eq!(t.file.counters().read_count, 0);
    }

    #[tokio::test]
    async fn test_cancel_after_issue_reports_transfer_outcome() {
        let data = pattern(4096, 5);
        let t = setup(data.clone(), WritePolicy::CacheOnWrite);

        t.lower.close_gate();
        let read = t.file.read(IoPriority::Foreground, 0, 2048, None).unwrap();
        t.lower.wait_issued(1).await;

        read.cancel();
        t.lower.open_gate();
        let buffer = read.await.unwrap();
        assert_eq!(buffer.to_vec(), data[..2048]);
    }

    #[tokio::test]
    async fn test_cancel_before_start_leaves_file_untouched() {
        let t = setup(vec![0; 1024], WritePolicy::CacheOnWrite);

        t.lower.close_gate();
        let blocker = t.file.read(IoPriority::Foreground, 0, 1024, None).unwrap();
        t.lower.wait_issued(1).await;

        let write = t
            .file
            .write(IoPriority::Foreground, 10, Bytes::from_static(b"never"), None)
            .unwrap();
        write.cancel();
        assert_matches!(write.await, Err(Error::Cancelled));

        t.lower.open_gate();
        blocker.await.unwrap();
        assert_eq!(t.lower.inner().contents(), vec![0; 1024]);
        assert_eq!(t.file.counters().write_count, 0);
    }

    #[tokio::test]
    async fn test_cancelled_truncate_keeps_size() {
        let t = setup(vec![0; 1024], WritePolicy::CacheOnWrite);

        t.lower.close_gate();
        let blocker = t.file.read(IoPriority::Foreground, 900, 100, None).unwrap();
        t.lower.wait_issued(1).await;

        let truncate = t.file.set_file_size(0, None).unwrap();
        truncate.cancel();
        assert_matches!(truncate.await, Err(Error::Cancelled));

        t.lower.open_gate();
        blocker.await.unwrap();
        assert_eq!(t.file.size(), 1024);
    }
}
