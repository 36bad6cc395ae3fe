use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::matrix::settings::{lock, SettingKey, SettingsStore};

/// Monotonic transaction id counter for idempotent writes.
///
/// Every allocation is persisted so ids never repeat across restarts within
/// one session epoch. A failed write is logged; the counter keeps going.
///
/// Allocation and persistence happen under one lock, so the stored value
/// never falls behind an id already handed out.
pub struct TransactionIds {
    next: Mutex<u64>,
    store: Arc<dyn SettingsStore>,
}

impl TransactionIds {
    pub fn load(store: Arc<dyn SettingsStore>) -> Self {
        let next = store
            .load(SettingKey::TransactionId)
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);

        Self {
            next: Mutex::new(next),
            store,
        }
    }

    /// Allocate the next id.
    pub fn next(&self) -> u64 {
        let mut next = lock(&self.next);
        let id = *next;
        *next = id.saturating_add(1);
        self.persist(*next);
        id
    }

    /// The id the next call to [`next`](Self::next) will hand out.
    pub fn peek(&self) -> u64 {
        *lock(&self.next)
    }

    /// Start a new epoch (on logout).
    pub fn reset(&self) {
        let mut next = lock(&self.next);
        *next = 0;
        self.persist(0);
    }

    fn persist(&self, value: u64) {
        if let Err(e) = self.store.store(SettingKey::TransactionId, &value.to_string()) {
            warn!("failed to persist transaction id: {e}");
        }
    }
}

impl std::fmt::Debug for TransactionIds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionIds")
            .field("next", &self.peek())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::matrix::settings::{MemorySettings, SettingsError};

    /// Holds the write of `slow_value` for a while before committing it.
    struct SlowStore {
        inner: MemorySettings,
        slow_value: &'static str,
    }

    impl SettingsStore for SlowStore {
        fn load(&self, key: SettingKey) -> Option<String> {
            self.inner.load(key)
        }

        fn store(&self, key: SettingKey, value: &str) -> Result<(), SettingsError> {
            if value == self.slow_value {
                std::thread::sleep(Duration::from_millis(200));
            }
            self.inner.store(key, value)
        }
    }

    #[test]
    fn starts_at_one_and_strictly_increases() {
        let ids = TransactionIds::load(Arc::new(MemorySettings::new()));
        let a = ids.next();
        let b = ids.next();
        let c = ids.next();
        assert_eq!(a, 1);
        assert!(a < b && b < c);
    }

    #[test]
    fn resumes_from_persisted_value() {
        let store: Arc<dyn SettingsStore> = Arc::new(MemorySettings::new());
        {
            let ids = TransactionIds::load(store.clone());
            ids.next();
            ids.next();
        }
        assert_eq!(store.load(SettingKey::TransactionId).as_deref(), Some("3"));

        let ids = TransactionIds::load(store);
        assert_eq!(ids.next(), 3);
    }

    #[test]
    fn ignores_garbage_in_store() {
        let store = MemorySettings::new().with(SettingKey::TransactionId, "not-a-number");
        let ids = TransactionIds::load(Arc::new(store));
        assert_eq!(ids.peek(), 1);
    }

    #[test]
    fn reset_starts_a_new_epoch() {
        let store: Arc<dyn SettingsStore> = Arc::new(MemorySettings::new());
        let ids = TransactionIds::load(store.clone());
        ids.next();
        ids.reset();
        assert_eq!(ids.peek(), 0);
        assert_eq!(store.load(SettingKey::TransactionId).as_deref(), Some("0"));
    }

    #[test]
    fn concurrent_allocations_never_repeat() {
        let ids = Arc::new(TransactionIds::load(Arc::new(MemorySettings::new())));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || (0..50).map(|_| ids.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 200);
    }

    #[test]
    fn slow_write_cannot_roll_back_a_later_allocation() {
        let store = Arc::new(SlowStore {
            inner: MemorySettings::new(),
            slow_value: "2",
        });
        let ids = Arc::new(TransactionIds::load(store.clone()));

        let first = {
            let ids = ids.clone();
            std::thread::spawn(move || ids.next())
        };
        std::thread::sleep(Duration::from_millis(50));
        let second = ids.next();
        let first = first.join().unwrap();

        let mut handed_out = [first, second];
        handed_out.sort_unstable();
        assert_eq!(handed_out, [1, 2]);
        assert_eq!(store.load(SettingKey::TransactionId).as_deref(), Some("3"));

        let reloaded = TransactionIds::load(store);
        assert_eq!(reloaded.next(), 3);
    }
}
