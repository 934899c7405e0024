//! Live transactions and the thread-local holders of their thread contexts.
//!
//! Threads the agent knows about up front register a slot and read their
//! context through it; any other thread falls back to a thread-local map.

use parking_lot::Mutex;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

use crate::thread_context::ThreadContext;
use crate::transaction::{Transaction, TransactionId};

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Registry id and slot index of the slot this thread holds, if any.
    static MANAGED_SLOT: Cell<Option<(u64, usize)>> = const { Cell::new(None) };
    static FALLBACK_CONTEXTS: RefCell<HashMap<u64, Arc<ThreadContext>>> = RefCell::new(HashMap::new());
}

#[derive(Debug, Default)]
struct ContextHolder {
    occupied: AtomicBool,
    context: Mutex<Option<Arc<ThreadContext>>>,
}

#[derive(Debug)]
pub struct TransactionRegistry {
    id: u64,
    transactions: Mutex<BTreeMap<TransactionId, Arc<Transaction>>>,
    slots: Vec<ContextHolder>,
}

impl TransactionRegistry {
    pub fn new(slot_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            transactions: Mutex::new(BTreeMap::new()),
            slots: (0..slot_capacity).map(|_| ContextHolder::default()).collect(),
        })
    }

    fn managed_slot(&self) -> Option<usize> {
        match MANAGED_SLOT.get() {
            Some((registry, slot)) if registry == self.id => Some(slot),
            _ => None,
        }
    }

    pub fn is_managed_thread(&self) -> bool {
        self.managed_slot().is_some()
    }

    pub fn current_thread_context(&self) -> Option<Arc<ThreadContext>> {
        match self.managed_slot() {
            Some(slot) => self.slots[slot].context.lock().clone(),
            None => FALLBACK_CONTEXTS.with(|m| m.borrow().get(&self.id).cloned()),
        }
    }

    /// Replaces the calling thread's context and returns the previous one.
    pub fn set_current_thread_context(&self, context: Option<Arc<ThreadContext>>) -> Option<Arc<ThreadContext>> {
        match self.managed_slot() {
            Some(slot) => std::mem::replace(&mut *self.slots[slot].context.lock(), context),
            None => FALLBACK_CONTEXTS.with(|m| {
                let mut map = m.borrow_mut();
                match context {
                    Some(context) => map.insert(self.id, context),
                    None => map.remove(&self.id),
                }
            }),
        }
    }

    /// Claims a slot for the calling thread until the guard drops. `None`
    /// when the thread already holds a slot in any registry or every slot
    /// is taken.
    pub fn register_managed_thread(self: &Arc<Self>) -> Option<ManagedThreadGuard> {
        if MANAGED_SLOT.get().is_some() {
            return None;
        }
        let slot = self.slots.iter().position(|holder| {
            holder
                .occupied
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        });
        let Some(slot) = slot else {
            debug!(capacity = self.slots.len(), "no free managed thread slot");
            return None;
        };
        let carried = FALLBACK_CONTEXTS.with(|m| m.borrow_mut().remove(&self.id));
        *self.slots[slot].context.lock() = carried;
        MANAGED_SLOT.set(Some((self.id, slot)));
        Some(ManagedThreadGuard {
            registry: self.clone(),
            slot,
            _not_send: PhantomData,
        })
    }

    /// Spawns a named thread that runs `f` with a managed slot.
    pub fn spawn_managed<F, T>(self: &Arc<Self>, name: &str, f: F) -> io::Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let registry = self.clone();
        thread::Builder::new().name(name.to_string()).spawn(move || {
            let guard = registry.register_managed_thread();
            if guard.is_none() {
                warn!("managed thread running without a slot");
            }
            f()
        })
    }

    pub fn add_transaction(&self, transaction: Arc<Transaction>) {
        self.transactions.lock().insert(transaction.id(), transaction);
    }

    pub fn remove_transaction(&self, id: TransactionId) -> Option<Arc<Transaction>> {
        self.transactions.lock().remove(&id)
    }

    /// In-flight transactions, oldest first.
    pub fn transactions(&self) -> Vec<Arc<Transaction>> {
        self.transactions.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.transactions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn has_fallback_context(&self) -> bool {
        FALLBACK_CONTEXTS.with(|m| m.borrow().contains_key(&self.id))
    }
}

/// Releases a managed slot; the thread falls back to the thread-local map,
/// keeping whatever context it held.
#[derive(Debug)]
pub struct ManagedThreadGuard {
    registry: Arc<TransactionRegistry>,
    slot: usize,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ManagedThreadGuard {
    fn drop(&mut self) {
        let holder = &self.registry.slots[self.slot];
        let context = holder.context.lock().take();
        MANAGED_SLOT.set(None);
        if let Some(context) = context {
            FALLBACK_CONTEXTS.with(|m| m.borrow_mut().insert(self.registry.id, context));
        }
        holder.occupied.store(false, Ordering::Release);
    }
}
