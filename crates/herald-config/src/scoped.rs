//! Scoped mutation contexts and the per-identifier lock registry.
//!
//! Compound values need read-then-mutate-then-write; a [`ScopedValue`]
//! makes that sequence safe. Acquiring one takes the identifier's lock and
//! reads the current merged value; the only way to persist is
//! [`ScopedValue::commit`], which consumes the context and issues exactly
//! one driver write. Dropping the context without committing (early
//! return, error, task cancellation) writes nothing and releases the lock.
//!
//! Locks are `tokio::sync::Mutex` entries in a [`DashMap`] keyed by
//! identifier. The map holds [`Weak`] references, so a lock lives only as
//! long as some context (or pending acquisition) holds it.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::driver::StorageDriver;
use crate::error::ConfigResult;
use crate::identifier::Identifier;

// ---------------------------------------------------------------------------
// Lock registry
// ---------------------------------------------------------------------------

/// Per-identifier lock table shared by all scopes of one [`Config`].
///
/// [`Config`]: crate::store::Config
#[derive(Default)]
pub(crate) struct LockRegistry {
    locks: DashMap<Identifier, Weak<Mutex<()>>>,
}

impl LockRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `id`, suspending while another context on the
    /// same identifier is open. Contexts on different identifiers never
    /// contend.
    pub(crate) async fn acquire(&self, id: &Identifier) -> OwnedMutexGuard<()> {
        let lock = self.lock_handle(id);
        lock.lock_owned().await
    }

    /// Upgrade the live lock for `id`, or install a fresh one if the
    /// previous holder's `Arc` has been dropped.
    fn lock_handle(&self, id: &Identifier) -> Arc<Mutex<()>> {
        match self.locks.entry(id.clone()) {
            Entry::Occupied(mut entry) => match entry.get().upgrade() {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(Mutex::new(()));
                    entry.insert(Arc::downgrade(&lock));
                    lock
                }
            },
            Entry::Vacant(entry) => {
                let lock = Arc::new(Mutex::new(()));
                entry.insert(Arc::downgrade(&lock));
                lock
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scoped mutation context
// ---------------------------------------------------------------------------

/// Exclusive mutable view of one value.
///
/// Holds the identifier's lock for its whole lifetime. Mutate the value in
/// place via [`value_mut`](Self::value_mut), then call
/// [`commit`](Self::commit) to persist; there is no other path to the
/// driver, so partial state can never be double-written and the final
/// write can never be forgotten without also discarding the context.
pub struct ScopedValue {
    driver: Arc<dyn StorageDriver>,
    id: Identifier,
    value: Value,
    is_default: bool,
    committed: bool,
    _guard: OwnedMutexGuard<()>,
}

impl ScopedValue {
    pub(crate) fn new(
        driver: Arc<dyn StorageDriver>,
        id: Identifier,
        value: Value,
        is_default: bool,
        guard: OwnedMutexGuard<()>,
    ) -> Self {
        Self {
            driver,
            id,
            value,
            is_default,
            committed: false,
            _guard: guard,
        }
    }

    /// The current merged value.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Mutable access to the value. Changes only persist via
    /// [`commit`](Self::commit).
    pub fn value_mut(&mut self) -> &mut Value {
        &mut self.value
    }

    /// Replace the value wholesale.
    pub fn replace(&mut self, value: Value) {
        self.value = value;
    }

    /// Whether the value was resolved entirely from registered defaults,
    /// i.e. no stored row existed when the context was opened.
    pub fn is_default(&self) -> bool {
        self.is_default
    }

    /// The identifier this context is locked on.
    pub fn id(&self) -> &Identifier {
        &self.id
    }

    /// Persist the (possibly mutated) value with one driver write and
    /// release the lock.
    pub async fn commit(mut self) -> ConfigResult<()> {
        self.committed = true;
        let result = self.driver.set(&self.id, self.value.clone()).await;
        debug!(id = %self.id, ok = result.is_ok(), "scoped context committed");
        result
    }

    /// Discard the context without writing. Equivalent to dropping it;
    /// spelled out for call sites where the abort is deliberate.
    pub fn abort(self) {}
}

impl Drop for ScopedValue {
    fn drop(&mut self) {
        if !self.committed {
            debug!(id = %self.id, "scoped context dropped without commit");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
