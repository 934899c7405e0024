//! Per-thread trace state and the API advice handlers talk to.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Weak};
use std::time::Duration;
use tracing::debug;

use crate::invocation::Throwable;
use crate::registry::TransactionRegistry;
use crate::timer::{Timer, TimerNode};
use crate::trace_entry::TraceEntry;
use crate::transaction::Transaction;

pub const AUX_THREAD_TIMER: &str = "auxiliary thread";

/// Everything instrumentation may do from inside a traced method.
pub trait TraceContext: Send + Sync + fmt::Debug {
    fn start_trace_entry(&self, message: &str, timer_name: &str) -> TraceEntry;
    fn start_timer(&self, timer_name: &str) -> Timer;
    /// Adds an already ended entry carrying an error.
    fn add_error_entry(&self, message: &str, throwable: Option<&Throwable>);
    fn set_transaction_type(&self, value: &str, priority: i32);
    fn set_transaction_name(&self, value: &str, priority: i32);
    fn set_transaction_user(&self, value: &str, priority: i32);
    fn add_transaction_attribute(&self, name: &str, value: &str);
    fn set_transaction_slow_threshold(&self, threshold: Duration, priority: i32);
    fn set_transaction_error(&self, message: &str);
    fn set_transaction_async(&self);
    fn set_transaction_async_complete(&self);
    fn create_aux_thread_context(&self) -> AuxThreadContext;
    fn is_in_transaction(&self) -> bool;
    fn transaction(&self) -> Option<Arc<Transaction>>;
    fn is_suppressed(&self, group: &str) -> bool;
    /// True when this call suppressed the group; only that caller unsuppresses.
    fn suppress(&self, group: &str) -> bool;
    fn unsuppress(&self, group: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    Main,
    Aux { completes_async_transaction: bool },
}

/// Trace state of one thread inside one transaction.
pub struct ThreadContext {
    me: Weak<ThreadContext>,
    transaction: Arc<Transaction>,
    registry: Weak<TransactionRegistry>,
    kind: ContextKind,
    root: Arc<TimerNode>,
    timer_stack: Mutex<Vec<Arc<TimerNode>>>,
    depth: AtomicUsize,
    suppressed: Mutex<HashSet<String>>,
    /// Restored into the registry when this context's root ends.
    previous: Mutex<Option<Arc<ThreadContext>>>,
    ended: AtomicBool,
}

impl fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadContext")
            .field("transaction", &self.transaction.id())
            .field("kind", &self.kind)
            .field("depth", &self.depth.load(Ordering::Relaxed))
            .finish()
    }
}

impl ThreadContext {
    /// Installs a fresh context for `transaction` on the calling thread and
    /// starts its root entry and root timer.
    pub(crate) fn install_root(
        transaction: Arc<Transaction>,
        registry: &Arc<TransactionRegistry>,
        root: Arc<TimerNode>,
        message: &str,
        kind: ContextKind,
    ) -> TraceEntry {
        let context = Arc::new_cyclic(|me| ThreadContext {
            me: me.clone(),
            transaction: transaction.clone(),
            registry: Arc::downgrade(registry),
            kind,
            root: root.clone(),
            timer_stack: Mutex::new(Vec::new()),
            depth: AtomicUsize::new(0),
            suppressed: Mutex::new(HashSet::new()),
            previous: Mutex::new(None),
            ended: AtomicBool::new(false),
        });
        if kind == ContextKind::Main {
            transaction.set_main_thread_context(&context);
        }
        let start_nanos = context.now_nanos();
        let record = TraceEntry::record_root(transaction.entries(), message, start_nanos);
        let timer = Timer::start(root, transaction.ticker().clone(), true, None);
        let previous = registry.set_current_thread_context(Some(context.clone()));
        *context.previous.lock() = previous;
        TraceEntry::root(context, record, timer)
    }

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.transaction
    }

    pub fn root_timer(&self) -> &Arc<TimerNode> {
        &self.root
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    pub(crate) fn now_nanos(&self) -> u64 {
        self.transaction.ticker().now_nanos()
    }

    fn current_timer(&self) -> Arc<TimerNode> {
        self.timer_stack.lock().last().cloned().unwrap_or_else(|| self.root.clone())
    }

    fn pop_timer(&self, node: &Arc<TimerNode>) {
        let mut stack = self.timer_stack.lock();
        if let Some(pos) = stack.iter().rposition(|n| Arc::ptr_eq(n, node)) {
            stack.truncate(pos);
        }
    }

    fn push_timer(&self, name: &str) -> Timer {
        let parent = self.current_timer();
        if parent.name() == name {
            return Timer::nop();
        }
        let node = parent.child(name);
        self.timer_stack.lock().push(node.clone());
        let me = self.me.clone();
        Timer::start(
            node,
            self.transaction.ticker().clone(),
            true,
            Some(Box::new(move |node: &Arc<TimerNode>| {
                if let Some(context) = me.upgrade() {
                    context.pop_timer(node);
                }
            })),
        )
    }

    pub(crate) fn extend_timer(&self, node: Arc<TimerNode>) -> Timer {
        if self.is_ended() {
            return Timer::nop();
        }
        Timer::start(node, self.transaction.ticker().clone(), false, None)
    }

    pub(crate) fn pop_entry(&self) {
        let _ = self
            .depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| d.checked_sub(1));
    }

    /// Called once when the root entry ends.
    pub(crate) fn end_root(&self, _end_nanos: u64) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        let previous = self.previous.lock().take();
        if let Some(registry) = self.registry.upgrade() {
            let current = registry.current_thread_context();
            if current.as_ref().is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), self)) {
                registry.set_current_thread_context(previous);
            }
        }
        if let ContextKind::Aux {
            completes_async_transaction: true,
        } = self.kind
        {
            self.transaction.mark_async_complete();
        }
        self.transaction.release();
    }

    fn this(&self) -> Option<Arc<ThreadContext>> {
        self.me.upgrade()
    }
}

impl TraceContext for ThreadContext {
    fn start_trace_entry(&self, message: &str, timer_name: &str) -> TraceEntry {
        let Some(context) = self.this() else {
            return TraceEntry::nop();
        };
        if self.is_ended() {
            debug!(message, "trace entry started after the root ended");
            return TraceEntry::nop();
        }
        let timer = self.push_timer(timer_name);
        let depth = self.depth.fetch_add(1, Ordering::AcqRel) + 1;
        let start_nanos = self.now_nanos();
        TraceEntry::start(context, self.transaction.entries(), message, start_nanos, depth, timer)
    }

    fn start_timer(&self, timer_name: &str) -> Timer {
        if self.is_ended() {
            return Timer::nop();
        }
        self.push_timer(timer_name)
    }

    fn add_error_entry(&self, message: &str, throwable: Option<&Throwable>) {
        let Some(context) = self.this() else {
            return;
        };
        let depth = self.depth.fetch_add(1, Ordering::AcqRel) + 1;
        let mut entry = TraceEntry::start(
            context,
            self.transaction.entries(),
            message,
            self.now_nanos(),
            depth,
            Timer::nop(),
        );
        match throwable {
            Some(throwable) => entry.end_with_info(throwable),
            None => entry.end_with_error_message(message),
        }
    }

    fn set_transaction_type(&self, value: &str, priority: i32) {
        self.transaction.set_transaction_type(value, priority);
    }

    fn set_transaction_name(&self, value: &str, priority: i32) {
        self.transaction.set_transaction_name(value, priority);
    }

    fn set_transaction_user(&self, value: &str, priority: i32) {
        self.transaction.set_user(value, priority);
    }

    fn add_transaction_attribute(&self, name: &str, value: &str) {
        self.transaction.add_attribute(name, value);
    }

    fn set_transaction_slow_threshold(&self, threshold: Duration, priority: i32) {
        self.transaction.set_slow_threshold(threshold, priority);
    }

    fn set_transaction_error(&self, message: &str) {
        self.transaction.set_error(message);
    }

    fn set_transaction_async(&self) {
        self.transaction.set_async();
    }

    fn set_transaction_async_complete(&self) {
        self.transaction.mark_async_complete();
    }

    fn create_aux_thread_context(&self) -> AuxThreadContext {
        AuxThreadContext::reserve(&self.transaction, self.registry.clone())
    }

    fn is_in_transaction(&self) -> bool {
        true
    }

    fn transaction(&self) -> Option<Arc<Transaction>> {
        Some(self.transaction.clone())
    }

    fn is_suppressed(&self, group: &str) -> bool {
        self.suppressed.lock().contains(group)
    }

    fn suppress(&self, group: &str) -> bool {
        self.suppressed.lock().insert(group.to_string())
    }

    fn unsuppress(&self, group: &str) {
        self.suppressed.lock().remove(group);
    }
}

/// Context used when the thread is not inside a transaction.
#[derive(Debug, Default)]
pub struct NopTraceContext;

static NOP_CONTEXT: LazyLock<Arc<NopTraceContext>> = LazyLock::new(|| Arc::new(NopTraceContext));

pub fn nop_context() -> Arc<dyn TraceContext> {
    NOP_CONTEXT.clone()
}

impl TraceContext for NopTraceContext {
    fn start_trace_entry(&self, _message: &str, _timer_name: &str) -> TraceEntry {
        TraceEntry::nop()
    }

    fn start_timer(&self, _timer_name: &str) -> Timer {
        Timer::nop()
    }

    fn add_error_entry(&self, _message: &str, _throwable: Option<&Throwable>) {}

    fn set_transaction_type(&self, _value: &str, _priority: i32) {}

    fn set_transaction_name(&self, _value: &str, _priority: i32) {}

    fn set_transaction_user(&self, _value: &str, _priority: i32) {}

    fn add_transaction_attribute(&self, _name: &str, _value: &str) {}

    fn set_transaction_slow_threshold(&self, _threshold: Duration, _priority: i32) {}

    fn set_transaction_error(&self, _message: &str) {}

    fn set_transaction_async(&self) {}

    fn set_transaction_async_complete(&self) {}

    fn create_aux_thread_context(&self) -> AuxThreadContext {
        AuxThreadContext::nop()
    }

    fn is_in_transaction(&self) -> bool {
        false
    }

    fn transaction(&self) -> Option<Arc<Transaction>> {
        None
    }

    fn is_suppressed(&self, _group: &str) -> bool {
        false
    }

    fn suppress(&self, _group: &str) -> bool {
        false
    }

    fn unsuppress(&self, _group: &str) {}
}

/// A reserved slot for continuing a transaction on another thread. Holds the
/// transaction open until started (and its root ended) or dropped.
#[derive(Debug, Default)]
pub struct AuxThreadContext {
    inner: Option<AuxInner>,
}

#[derive(Debug)]
struct AuxInner {
    transaction: Arc<Transaction>,
    registry: Weak<TransactionRegistry>,
}

impl AuxThreadContext {
    pub fn nop() -> Self {
        Self { inner: None }
    }

    pub(crate) fn reserve(transaction: &Arc<Transaction>, registry: Weak<TransactionRegistry>) -> Self {
        if !transaction.try_reserve_aux() {
            debug!(transaction = transaction.id(), "aux thread context refused");
            return Self::nop();
        }
        Self {
            inner: Some(AuxInner {
                transaction: transaction.clone(),
                registry,
            }),
        }
    }

    pub fn is_nop(&self) -> bool {
        self.inner.is_none()
    }

    pub fn transaction(&self) -> Option<&Arc<Transaction>> {
        self.inner.as_ref().map(|i| &i.transaction)
    }

    /// Runs the rest of the transaction's work on the calling thread. The
    /// returned root entry must be ended when that work finishes.
    pub fn start(self) -> TraceEntry {
        self.start_with(false)
    }

    /// Like [`AuxThreadContext::start`], and ending the returned root also
    /// marks the async transaction complete.
    pub fn start_and_mark_async_transaction_complete(self) -> TraceEntry {
        self.start_with(true)
    }

    fn start_with(mut self, completes_async_transaction: bool) -> TraceEntry {
        let Some(inner) = self.inner.take() else {
            return TraceEntry::nop();
        };
        let Some(registry) = inner.registry.upgrade() else {
            inner.transaction.release();
            return TraceEntry::nop();
        };
        // already inside the same transaction on this thread
        if let Some(current) = registry.current_thread_context()
            && Arc::ptr_eq(current.transaction(), &inner.transaction)
            && !current.is_ended()
        {
            if completes_async_transaction {
                inner.transaction.mark_async_complete();
            }
            inner.transaction.release();
            return TraceEntry::nop();
        }
        let root = inner.transaction.add_aux_root(AUX_THREAD_TIMER);
        ThreadContext::install_root(
            inner.transaction,
            &registry,
            root,
            AUX_THREAD_TIMER,
            ContextKind::Aux {
                completes_async_transaction,
            },
        )
    }
}

impl Drop for AuxThreadContext {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.transaction.release();
        }
    }
}
