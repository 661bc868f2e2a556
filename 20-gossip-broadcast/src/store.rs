//! Deduplicated record of every value this node has learned.
//!
//! The store is the only place a value is ever marked as "seen", and the
//! check-and-insert in [`MessageStore::add`] is what decides whether a
//! broadcast starts a new dissemination.

use std::collections::HashSet;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::message::Value;

/// Insertion-ordered set of broadcast values.
///
/// One `RwLock` guards both the ordered sequence and the membership set, so
/// the two can never disagree. Reads (`contains`, `snapshot`) share the lock;
/// `add` takes it exclusively for the duration of a single insert.
///
/// # Why RwLock instead of Mutex?
///
/// Every `read` request copies the whole store, and a busy cluster reads far
/// more often than it learns new values. Writes only happen the first time a
/// value is seen, so most accesses can share the lock.
///
/// # Why a HashSet and a Vec?
///
/// `read_ok` lists values in the order this node learned them, which the
/// `Vec` keeps. The `HashSet` answers "seen before?" in constant time, so
/// dedup does not scan the sequence. Each value is stored twice; values are
/// small JSON numbers.
#[derive(Default)]
pub struct MessageStore {
    inner: RwLock<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    values: Vec<Value>,
    seen: HashSet<Value>,
}

impl MessageStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, value: &Value) -> bool {
        self.read().seen.contains(value)
    }

    /// Inserts `value` unless it is already present.
    ///
    /// Returns `true` only for the call that actually inserted the value.
    /// Concurrent callers racing on the same value see exactly one `true`.
    pub fn add(&self, value: Value) -> bool {
        let mut inner = self.write();
        if !inner.seen.insert(value.clone()) {
            return false;
        }
        inner.values.push(value);
        true
    }

    /// Returns a copy of every stored value in insertion order.
    pub fn snapshot(&self) -> Vec<Value> {
        self.read().values.clone()
    }

    pub fn len(&self) -> usize {
        self.read().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Critical sections only push or copy, so a poisoned lock still guards consistent data.
    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
