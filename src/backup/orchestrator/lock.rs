use crate::backup::config::TargetId;
use dashmap::DashSet;
use std::sync::Arc;

/// Per-target mutual exclusion: at most one job of a target runs at a time.
#[derive(Debug, Default, Clone)]
pub struct TargetLocks {
    held: Arc<DashSet<TargetId>>,
}

/// Releases the target's lock when dropped.
#[derive(Debug)]
pub struct TargetLockGuard {
    held: Arc<DashSet<TargetId>>,
    target: TargetId,
}

impl TargetLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` when a job of `target` already holds the lock.
    pub fn try_acquire(&self, target: &TargetId) -> Option<TargetLockGuard> {
        self.held.insert(target.clone()).then(|| TargetLockGuard {
            held: self.held.clone(),
            target: target.clone(),
        })
    }

    pub fn is_held(&self, target: &TargetId) -> bool {
        self.held.contains(target)
    }
}

impl Drop for TargetLockGuard {
    fn drop(&mut self) {
        self.held.remove(&self.target);
    }
}
