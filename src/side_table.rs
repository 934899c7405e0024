//! Extra state attached to objects this crate does not own, keyed by object
//! identity. Entries die with their owner: a lookup never sees state of a
//! dropped object, even if its address is reused.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

struct Slot<K: ?Sized, V> {
    owner: Weak<K>,
    value: Arc<V>,
}

impl<K: ?Sized, V> Slot<K, V> {
    fn is_live(&self) -> bool {
        self.owner.strong_count() > 0
    }
}

pub struct SideTable<K: ?Sized, V> {
    entries: Mutex<HashMap<usize, Slot<K, V>>>,
}

impl<K: ?Sized, V> fmt::Debug for SideTable<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SideTable")
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}

impl<K: ?Sized, V> Default for SideTable<K, V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

fn address<K: ?Sized>(key: &Arc<K>) -> usize {
    Arc::as_ptr(key).cast::<()>() as usize
}

impl<K: ?Sized, V> SideTable<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &Arc<K>) -> Option<Arc<V>> {
        let mut entries = self.entries.lock();
        let addr = address(key);
        match entries.get(&addr) {
            Some(slot) if slot.is_live() => Some(slot.value.clone()),
            Some(_) => {
                entries.remove(&addr);
                None
            }
            None => None,
        }
    }

    pub fn get_or_insert_with(&self, key: &Arc<K>, f: impl FnOnce() -> V) -> Arc<V> {
        let mut entries = self.entries.lock();
        let addr = address(key);
        if let Some(slot) = entries.get(&addr)
            && slot.is_live()
        {
            return slot.value.clone();
        }
        let value = Arc::new(f());
        entries.insert(
            addr,
            Slot {
                owner: Arc::downgrade(key),
                value: value.clone(),
            },
        );
        value
    }

    /// Returns the live value it replaced.
    pub fn insert(&self, key: &Arc<K>, value: V) -> Option<Arc<V>> {
        let previous = self.entries.lock().insert(
            address(key),
            Slot {
                owner: Arc::downgrade(key),
                value: Arc::new(value),
            },
        );
        previous.filter(Slot::is_live).map(|s| s.value)
    }

    pub fn remove(&self, key: &Arc<K>) -> Option<Arc<V>> {
        self.entries
            .lock()
            .remove(&address(key))
            .filter(Slot::is_live)
            .map(|s| s.value)
    }

    /// Drops entries whose owner is gone; returns how many.
    pub fn prune(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, slot| slot.is_live());
        before - entries.len()
    }

    /// Includes entries of dropped owners not yet pruned.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
