use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Serializes ledger mutations per content hash within this process.
///
/// Entries nobody holds or waits on are dropped on the next acquire, so the
/// map only grows with the number of hashes being mutated concurrently.
#[derive(Default)]
pub struct HashLocks {
    entries: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

pub struct HashGuard {
    _guard: OwnedMutexGuard<()>,
}

impl HashLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, content_hash: &str) -> HashGuard {
        let lock = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.retain(|_, lock| Arc::strong_count(lock) > 1);
            entries
                .entry(content_hash.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        HashGuard {
            _guard: lock.lock_owned().await,
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_hash_is_mutually_exclusive() {
        let locks = Arc::new(HashLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("abc").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.expect("task");
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_hashes_do_not_block_each_other() {
        let locks = HashLocks::new();
        let _first = locks.acquire("aaaa").await;
        let second = tokio::time::timeout(Duration::from_millis(100), locks.acquire("bbbb")).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn released_entries_are_pruned() {
        let locks = HashLocks::new();
        drop(locks.acquire("aaaa").await);
        drop(locks.acquire("bbbb").await);
        let _held = locks.acquire("cccc").await;
        assert_eq!(locks.tracked(), 1);
    }
}
