use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

const MIN_SWEEP_THRESHOLD: usize = 1024;

type RefreshLock = AsyncMutex<()>;

struct LocksInner {
    /// Keyed by a digest of the refresh token, so raw tokens don't linger in
    /// memory for the lifetime of the registry.
    locks: HashMap<blake3::Hash, Weak<RefreshLock>>,
    sweep_at: usize,
}

/// Lazily created per-refresh-token locks.
///
/// An entry lives only while someone holds or waits for its lock. Dead
/// entries are swept once the map outgrows `sweep_at`, which then doubles
/// with the live population, keeping the sweeping cost amortized constant.
pub(crate) struct RefreshLocks {
    inner: Mutex<LocksInner>,
    min_sweep_threshold: usize,
}

impl Default for RefreshLocks {
    fn default() -> Self {
        Self::with_sweep_threshold(MIN_SWEEP_THRESHOLD)
    }
}

impl RefreshLocks {
    pub(crate) fn with_sweep_threshold(min_sweep_threshold: usize) -> Self {
        Self {
            inner: Mutex::new(LocksInner {
                locks: HashMap::new(),
                sweep_at: min_sweep_threshold,
            }),
            min_sweep_threshold,
        }
    }

    fn lock_for(&self, refresh_token: &str) -> Arc<RefreshLock> {
        let key = blake3::hash(refresh_token.as_bytes());
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = inner.locks.get(&key).and_then(Weak::upgrade) {
            return existing;
        }

        if inner.sweep_at <= inner.locks.len() {
            inner.locks.retain(|_, lock| 0 < lock.strong_count());
            inner.sweep_at = (inner.locks.len() * 2).max(self.min_sweep_threshold);
        }

        let lock = Arc::new(RefreshLock::new(()));
        inner.locks.insert(key, Arc::downgrade(&lock));
        lock
    }

    /// Wait for exclusive access to refreshes of `refresh_token`.
    pub(crate) async fn acquire(&self, refresh_token: &str) -> OwnedMutexGuard<()> {
        self.lock_for(refresh_token).lock_owned().await
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .locks
            .len()
    }
}
