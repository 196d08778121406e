//! Per-volume mutual exclusion.
//!
//! [`VolumeLocks`] records which volume IDs have an operation in flight.  It
//! is not a queue: a second acquisition of a held ID fails immediately and
//! the caller reports [`CsiError::Aborted`](crate::CsiError::Aborted) so the
//! orchestrator retries later.
//!
//! The registry is an ordinary value shared through an `Arc`, so each driver
//! (and each test) gets its own.

use std::sync::Arc;

use dashmap::DashSet;

/// Set of volume IDs with an operation in flight.
#[derive(Debug, Default)]
pub struct VolumeLocks {
    held: DashSet<String>,
}

impl VolumeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically mark `volume_id` as held.  Returns `false` if it was
    /// already held.
    pub fn try_acquire(&self, volume_id: &str) -> bool {
        self.held.insert(volume_id.to_owned())
    }

    /// Release `volume_id`.  Releasing an ID that is not held is a no-op.
    pub fn release(&self, volume_id: &str) {
        self.held.remove(volume_id);
    }

    /// Point-in-time check; not atomic with a later `try_acquire`.
    pub fn is_locked(&self, volume_id: &str) -> bool {
        self.held.contains(volume_id)
    }

    /// Acquire `volume_id` and return a guard that releases it on drop.
    pub fn try_lock(self: &Arc<Self>, volume_id: &str) -> Option<VolumeLockGuard> {
        self.try_acquire(volume_id).then(|| VolumeLockGuard {
            locks: Arc::clone(self),
            volume_id: volume_id.to_owned(),
        })
    }
}

/// Releases its volume ID when dropped.
#[derive(Debug)]
pub struct VolumeLockGuard {
    locks: Arc<VolumeLocks>,
    volume_id: String,
}

impl Drop for VolumeLockGuard {
    fn drop(&mut self) {
        self.locks.release(&self.volume_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_is_exclusive_until_release() {
        let locks = VolumeLocks::new();
        assert!(locks.try_acquire("vol-1"));
        assert!(!locks.try_acquire("vol-1"));
        assert!(locks.is_locked("vol-1"));

        // Other keys are independent.
        assert!(locks.try_acquire("vol-2"));

        locks.release("vol-1");
        assert!(!locks.is_locked("vol-1"));
        assert!(locks.try_acquire("vol-1"));
    }

    #[test]
    fn release_absent_is_noop() {
        let locks = VolumeLocks::new();
        locks.release("never-held");
        assert!(!locks.is_locked("never-held"));
    }

    #[test]
    fn guard_releases_on_drop() {
        let locks = Arc::new(VolumeLocks::new());
        {
            let _guard = locks.try_lock("shared/vol-1").expect("first lock");
            assert!(locks.try_lock("shared/vol-1").is_none());
        }
        assert!(!locks.is_locked("shared/vol-1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_acquire_has_single_winner() {
        let locks = Arc::new(VolumeLocks::new());
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..64 {
            let locks = Arc::clone(&locks);
            tasks.spawn(async move { locks.try_acquire("contended") });
        }
        let winners = tasks
            .join_all()
            .await
            .into_iter()
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
