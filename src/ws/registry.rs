#![expect(
    clippy::module_name_repetitions,
    reason = "The registry type is named for what it registers"
)]

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Ids of requests that were written and whose responses have not been read yet.
///
/// Every operation takes the single inner lock, so each answer is a snapshot: a `true` from
/// [`contains`](Self::contains) may be stale by the time the caller acts on it.
#[derive(Debug, Default)]
pub struct RequestRegistry {
    ids: Mutex<HashSet<String>>,
}

impl RequestRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `id`. Inserting an id that is already present is a no-op.
    ///
    /// Callers that must reject an id already in flight should use [`try_add`](Self::try_add),
    /// which checks and inserts under one lock.
    pub fn add(&self, id: &str) {
        self.lock().insert(id.to_owned());
    }

    /// Insert `id` unless it is already present. Returns whether it was inserted.
    pub fn try_add(&self, id: &str) -> bool {
        let mut ids = self.lock();
        if ids.contains(id) {
            return false;
        }
        ids.insert(id.to_owned())
    }

    /// Remove `id`. Removing an absent id is not an error.
    pub fn remove(&self, id: &str) {
        self.lock().remove(id);
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Forget every pending id.
    pub fn reset(&self) {
        *self.lock() = HashSet::new();
    }

    // A set has no intermediate state worth protecting, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
