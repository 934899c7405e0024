//! Structural adapters: carrying a transaction across a functional-interface
//! hand-off (a task submitted to an executor, a callback, a future
//! continuation) by wrapping the task in an adapter selected up front for
//! that interface.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::side_table::SideTable;
use crate::thread_context::{AuxThreadContext, TraceContext};
use crate::trace_entry::TraceEntry;

pub type Task = Box<dyn FnOnce() + Send>;

pub const RUNNABLE: &str = "java.lang.Runnable";
pub const CALLABLE: &str = "java.util.concurrent.Callable";
pub const SCALA_FUNCTION0: &str = "scala.Function0";

pub trait StructuralAdapter: Send + Sync + fmt::Debug {
    /// Java name of the interface whose single abstract method this adapter
    /// bridges.
    fn functional_interface(&self) -> &str;

    fn adapt(&self, task: Task, context: AuxThreadContext) -> Task;
}

/// Ends the aux root even when the task panics, so the transaction can
/// still complete.
struct EndOnDrop(TraceEntry);

impl Drop for EndOnDrop {
    fn drop(&mut self) {
        self.0.end();
    }
}

/// Runs the task inside the aux thread context.
#[derive(Debug, Clone)]
pub struct ContextPropagatingAdapter {
    interface: String,
    completes_async_transaction: bool,
}

impl ContextPropagatingAdapter {
    pub fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
            completes_async_transaction: false,
        }
    }

    /// The wrapped task's end also marks its async transaction complete.
    pub fn completing_async_transaction(mut self) -> Self {
        self.completes_async_transaction = true;
        self
    }
}

impl StructuralAdapter for ContextPropagatingAdapter {
    fn functional_interface(&self) -> &str {
        &self.interface
    }

    fn adapt(&self, task: Task, context: AuxThreadContext) -> Task {
        if context.is_nop() {
            return task;
        }
        let completes = self.completes_async_transaction;
        Box::new(move || {
            let entry = if completes {
                context.start_and_mark_async_transaction_complete()
            } else {
                context.start()
            };
            let _end = EndOnDrop(entry);
            task();
        })
    }
}

#[derive(Debug, Default)]
pub struct AdapterRegistry {
    adapters: RwLock<HashMap<String, Arc<dyn StructuralAdapter>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context propagation for `Runnable`, `Callable` and `scala.Function0`.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        for interface in [RUNNABLE, CALLABLE, SCALA_FUNCTION0] {
            registry.register(Arc::new(ContextPropagatingAdapter::new(interface)));
        }
        registry
    }

    pub fn register(&self, adapter: Arc<dyn StructuralAdapter>) -> Option<Arc<dyn StructuralAdapter>> {
        let interface = adapter.functional_interface().to_string();
        self.adapters.write().insert(interface, adapter)
    }

    pub fn adapter(&self, interface: &str) -> Option<Arc<dyn StructuralAdapter>> {
        self.adapters.read().get(interface).cloned()
    }

    pub fn interfaces(&self) -> Vec<String> {
        let mut names: Vec<_> = self.adapters.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Wraps `task` so it continues the caller's transaction. Outside a
    /// transaction, or with no adapter for `interface`, the task is returned
    /// unchanged.
    pub fn wrap(&self, interface: &str, task: Task, context: &dyn TraceContext) -> Task {
        if !context.is_in_transaction() {
            return task;
        }
        match self.adapter(interface) {
            Some(adapter) => adapter.adapt(task, context.create_aux_thread_context()),
            None => task,
        }
    }
}

/// Attaches an aux thread context to a task object at submission and hands
/// it out once at execution, for hand-offs where the submitted object
/// cannot be wrapped.
pub struct ContextCarrier<K: ?Sized> {
    table: SideTable<K, Mutex<Option<AuxThreadContext>>>,
}

impl<K: ?Sized> fmt::Debug for ContextCarrier<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextCarrier").field("table", &self.table).finish()
    }
}

impl<K: ?Sized> Default for ContextCarrier<K> {
    fn default() -> Self {
        Self {
            table: SideTable::new(),
        }
    }
}

impl<K: ?Sized> ContextCarrier<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false (dropping `context`) when the object already carries one.
    pub fn attach(&self, object: &Arc<K>, context: AuxThreadContext) -> bool {
        if context.is_nop() {
            return false;
        }
        let slot = self.table.get_or_insert_with(object, || Mutex::new(None));
        let mut slot = slot.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(context);
        true
    }

    pub fn take(&self, object: &Arc<K>) -> Option<AuxThreadContext> {
        let slot = self.table.remove(object)?;
        slot.lock().take()
    }

    /// Releases contexts of objects that were dropped without running.
    pub fn prune(&self) -> usize {
        self.table.prune()
    }
}
