//! Per-item mutual exclusion.
//!
//! A process-wide monitor over the set of currently-locked item keys:
//! a waiter re-checks membership under the mutex, parks on the notifier
//! while its key is held elsewhere, and release broadcasts to all
//! waiters. The same key can only be re-acquired after the current
//! holder releases.

use std::collections::HashSet;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// The process-wide item lock table.
static ITEM_LOCKS: Lazy<Arc<KeyedMutex>> = Lazy::new(|| Arc::new(KeyedMutex::new()));

/// The global keyed mutex guarding per-item storage paths.
pub(crate) fn item_locks() -> Arc<KeyedMutex> {
    Arc::clone(&ITEM_LOCKS)
}

/// A dynamic mutex keyed by string.
pub(crate) struct KeyedMutex {
    keys: Mutex<HashSet<String>>,
    notify: Notify,
}

impl KeyedMutex {
    pub(crate) fn new() -> Self {
        KeyedMutex {
            keys: Mutex::new(HashSet::new()),
            notify: Notify::new(),
        }
    }

    /// Acquire the lock for `key`, waiting while another holder has it.
    pub(crate) async fn lock(self: &Arc<Self>, key: String) -> KeyedGuard {
        loop {
            // Register for notification before checking, so a release
            // between the check and the await cannot be missed.
            let notified = self.notify.notified();
            {
                let mut keys = self.keys.lock();
                if keys.insert(key.clone()) {
                    return KeyedGuard {
                        owner: Arc::clone(self),
                        key,
                    };
                }
            }
            notified.await;
        }
    }

    fn unlock(&self, key: &str) {
        self.keys.lock().remove(key);
        self.notify.notify_waiters();
    }
}

/// Releases the key on drop.
pub(crate) struct KeyedGuard {
    owner: Arc<KeyedMutex>,
    key: String,
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        self.owner.unlock(&self.key);
    }
}
