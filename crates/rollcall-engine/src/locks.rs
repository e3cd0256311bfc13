use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Per-key mutual exclusion. Operations on different keys run in parallel;
/// operations on the same key are serialized in arrival order of the lock.
#[derive(Default)]
pub struct KeyedLocks {
    slots: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lock<T>(&self, key: &str, f: impl FnOnce() -> T) -> T {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(key.to_string()).or_default())
        };

        let result = {
            let _guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };

        // One reference lives in the map, one here. Anything above two means
        // another caller is waiting and will reuse the slot.
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if Arc::strong_count(&slot) == 2 {
            slots.remove(key);
        }

        result
    }

    /// Number of keys currently held or awaited.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
