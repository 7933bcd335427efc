//
// Per-key mutual exclusion for the signup critical sections
//

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;

use crate::error::{Error, Kind};

/// The process-wide lock table for `signup:{event}:{role}` sections.
/// Cross-process safety is carried by the unique index on registrations.
pub static SIGNUP_LOCKS: LazyLock<KeyedLocks> = LazyLock::new(KeyedLocks::new);

pub fn signup_lock_key(event_uuid: &str, role_uuid: &str) -> String {
    format!("signup:{event_uuid}:{role_uuid}")
}

pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Held for the duration of a critical section; releasing is dropping.
#[derive(Debug)]
pub struct KeyedGuard {
    _guard: OwnedMutexGuard<()>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Acquires the mutex for `key`, waiting at most `timeout_ms`. Waiters
    /// are served in FIFO order (tokio mutexes are fair). On timeout the
    /// caller gets `Unavailable` and is expected to retry.
    pub async fn acquire(&self, key: &str, timeout_ms: u64) -> Result<KeyedGuard, Error> {
        // The shard guard must not be held across the await below.
        let lock = self.locks.entry(key.to_string()).or_default().value().clone();

        match timeout(Duration::from_millis(timeout_ms), lock.lock_owned()).await {
            Ok(guard) => Ok(KeyedGuard {
                _guard: guard,
            }),
            Err(_) => Err(Error::new(
                "The role is busy processing other signups, please try again",
                format!("Timed out after {timeout_ms}ms waiting for lock {key}"),
            )
            .with_kind(Kind::Unavailable)),
        }
    }

    /// Drops table entries nobody is holding or waiting on. Called from the
    /// periodic sweeps so the table stays bounded by live contention, not by
    /// every key ever locked.
    pub fn shrink(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }
}

impl Default for KeyedLocks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn same_key_is_mutually_exclusive() {
        let locks = Arc::new(KeyedLocks::new());
        let in_section = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let in_section = Arc::clone(&in_section);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("signup:e1:r1", 5_000).await.unwrap();
                let n = in_section.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(n, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_section.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_keys_do_not_block_each_other() {
        let locks = KeyedLocks::new();
        let _a = locks.acquire("signup:e1:r1", 1_000).await.unwrap();
        // Must succeed immediately even while r1 is held.
        let _b = locks.acquire("signup:e1:r2", 10).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_times_out_as_unavailable() {
        let locks = KeyedLocks::new();
        let _held = locks.acquire("signup:e1:r1", 1_000).await.unwrap();

        let err = locks.acquire("signup:e1:r1", 50).await.unwrap_err();
        assert_eq!(err.kind(), Some(Kind::Unavailable));
    }

    #[tokio::test]
    async fn shrink_keeps_held_entries() {
        let locks = KeyedLocks::new();
        let guard = locks.acquire("signup:e1:r1", 1_000).await.unwrap();
        {
            let _other = locks.acquire("signup:e1:r2", 1_000).await.unwrap();
        }

        locks.shrink();
        assert_eq!(locks.len(), 1);

        drop(guard);
        locks.shrink();
        assert_eq!(locks.len(), 0);
    }
}
