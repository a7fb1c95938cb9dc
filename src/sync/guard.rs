use std::sync::Arc;

use dashmap::DashMap;

/// One sync run per user at a time.
#[derive(Debug, Clone, Default)]
pub struct SyncGuard {
    running: Arc<DashMap<String, ()>>,
}

/// Held for the duration of a sync; releases the user on drop.
#[derive(Debug)]
pub struct SyncPermit {
    running: Arc<DashMap<String, ()>>,
    user_id: String,
}

impl SyncGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when a sync for `user_id` is already in flight.
    pub fn try_acquire(&self, user_id: &str) -> Option<SyncPermit> {
        match self.running.entry(user_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
                Some(SyncPermit {
                    running: Arc::clone(&self.running),
                    user_id: user_id.to_string(),
                })
            }
        }
    }

    pub fn is_running(&self, user_id: &str) -> bool {
        self.running.contains_key(user_id)
    }
}

impl Drop for SyncPermit {
    fn drop(&mut self) {
        self.running.remove(&self.user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_is_rejected_until_drop() {
        let guard = SyncGuard::new();
        let permit = guard.try_acquire("u1").unwrap();
        assert!(guard.try_acquire("u1").is_none());
        assert!(guard.try_acquire("u2").is_some());
        assert!(guard.is_running("u1"));

        drop(permit);
        assert!(!guard.is_running("u1"));
        assert!(guard.try_acquire("u1").is_some());
    }
}
