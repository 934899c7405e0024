//! The transaction aggregate: naming, error state, timers and entries of
//! one logical unit of work, plus its exactly-once completion.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::collector::TraceCollector;
use crate::registry::TransactionRegistry;
use crate::thread_context::ThreadContext;
use crate::timer::{Ticker, TimerNode, TimerSnapshot};
use crate::trace_entry::{EntryLimits, EntryLog, EntrySnapshot};

pub type TransactionId = u64;

/// Names set by instrumentation descriptors.
pub const PRIORITY_CORE_PLUGIN: i32 = 1000;
/// Names set by user-configured advice.
pub const PRIORITY_USER_PLUGIN: i32 = 2000;
/// Names set explicitly through the public API.
pub const PRIORITY_USER_API: i32 = 3000;
pub const PRIORITY_CORE_MAX: i32 = 4000;

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
struct Prioritized<T> {
    value: T,
    priority: i32,
}

impl<T> Prioritized<T> {
    fn new(value: T, priority: i32) -> Self {
        Self { value, priority }
    }

    /// Later setters win ties.
    fn offer(&mut self, value: T, priority: i32) -> bool {
        if priority < self.priority {
            return false;
        }
        self.value = value;
        self.priority = priority;
        true
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransactionSettings {
    pub limits: EntryLimits,
    pub max_aux_contexts: usize,
}

#[derive(Debug, Default)]
struct Lifecycle {
    /// The main thread's root plus every started-or-pending aux context.
    outstanding: usize,
    aux_created: usize,
    is_async: bool,
    async_complete: bool,
    completed: bool,
    end_nanos: Option<u64>,
}

impl Lifecycle {
    fn ready(&self) -> bool {
        !self.completed && self.outstanding == 0 && (!self.is_async || self.async_complete)
    }
}

#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    start_time_millis: u64,
    start_nanos: u64,
    ticker: Arc<dyn Ticker>,
    headline: String,
    transaction_type: Mutex<Prioritized<String>>,
    transaction_name: Mutex<Prioritized<String>>,
    user: Mutex<Prioritized<String>>,
    attributes: Mutex<BTreeMap<String, Vec<String>>>,
    error: Mutex<Option<String>>,
    slow_threshold: Mutex<Option<Prioritized<u64>>>,
    root_timer: Arc<TimerNode>,
    aux_roots: Mutex<Vec<Arc<TimerNode>>>,
    entries: EntryLog,
    lifecycle: Mutex<Lifecycle>,
    max_aux_contexts: usize,
    partial_stores: AtomicU64,
    /// Context of the thread that started the transaction.
    main_context: Mutex<Weak<ThreadContext>>,
    registry: Weak<TransactionRegistry>,
    collector: Arc<dyn TraceCollector>,
}

pub(crate) struct NewTransaction<'a> {
    pub transaction_type: &'a str,
    pub transaction_name: &'a str,
    pub headline: &'a str,
    pub timer_name: &'a str,
    pub priority: i32,
}

impl Transaction {
    pub(crate) fn new(
        spec: NewTransaction<'_>,
        settings: TransactionSettings,
        ticker: Arc<dyn Ticker>,
        registry: Weak<TransactionRegistry>,
        collector: Arc<dyn TraceCollector>,
    ) -> Arc<Self> {
        let start_time_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Arc::new(Self {
            id: NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed),
            start_time_millis,
            start_nanos: ticker.now_nanos(),
            ticker,
            headline: spec.headline.to_string(),
            transaction_type: Mutex::new(Prioritized::new(spec.transaction_type.to_string(), spec.priority)),
            transaction_name: Mutex::new(Prioritized::new(spec.transaction_name.to_string(), spec.priority)),
            user: Mutex::new(Prioritized::new(String::new(), i32::MIN)),
            attributes: Mutex::new(BTreeMap::new()),
            error: Mutex::new(None),
            slow_threshold: Mutex::new(None),
            root_timer: TimerNode::new(spec.timer_name),
            aux_roots: Mutex::new(Vec::new()),
            entries: EntryLog::new(settings.limits),
            lifecycle: Mutex::new(Lifecycle {
                outstanding: 1,
                ..Lifecycle::default()
            }),
            max_aux_contexts: settings.max_aux_contexts,
            partial_stores: AtomicU64::new(0),
            main_context: Mutex::new(Weak::new()),
            registry,
            collector,
        })
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// The starting thread's context while it is still alive.
    pub fn main_thread_context(&self) -> Option<Arc<ThreadContext>> {
        self.main_context.lock().upgrade()
    }

    pub(crate) fn set_main_thread_context(&self, context: &Arc<ThreadContext>) {
        *self.main_context.lock() = Arc::downgrade(context);
    }

    pub fn headline(&self) -> &str {
        &self.headline
    }

    pub fn transaction_type(&self) -> String {
        self.transaction_type.lock().value.clone()
    }

    pub fn transaction_name(&self) -> String {
        self.transaction_name.lock().value.clone()
    }

    pub fn user(&self) -> String {
        self.user.lock().value.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    pub fn attributes(&self) -> BTreeMap<String, Vec<String>> {
        self.attributes.lock().clone()
    }

    pub fn set_transaction_type(&self, value: &str, priority: i32) -> bool {
        !value.is_empty() && self.transaction_type.lock().offer(value.to_string(), priority)
    }

    pub fn set_transaction_name(&self, value: &str, priority: i32) -> bool {
        !value.is_empty() && self.transaction_name.lock().offer(value.to_string(), priority)
    }

    pub fn set_user(&self, value: &str, priority: i32) -> bool {
        !value.is_empty() && self.user.lock().offer(value.to_string(), priority)
    }

    /// The first error sticks.
    pub fn set_error(&self, message: &str) {
        let mut error = self.error.lock();
        if error.is_none() {
            *error = Some(message.to_string());
        }
    }

    pub fn add_attribute(&self, name: &str, value: &str) {
        let mut attributes = self.attributes.lock();
        let values = attributes.entry(name.to_string()).or_default();
        if !values.iter().any(|v| v == value) {
            values.push(value.to_string());
        }
    }

    pub fn set_slow_threshold(&self, threshold: Duration, priority: i32) {
        let millis = threshold.as_millis() as u64;
        let mut slow = self.slow_threshold.lock();
        match slow.as_mut() {
            Some(current) => {
                current.offer(millis, priority);
            }
            None => *slow = Some(Prioritized::new(millis, priority)),
        }
    }

    pub fn slow_threshold_millis(&self) -> Option<u64> {
        self.slow_threshold.lock().as_ref().map(|s| s.value)
    }

    pub fn root_timer(&self) -> &Arc<TimerNode> {
        &self.root_timer
    }

    pub(crate) fn add_aux_root(&self, name: &str) -> Arc<TimerNode> {
        let node = TimerNode::new(name);
        self.aux_roots.lock().push(node.clone());
        node
    }

    pub fn entries(&self) -> &EntryLog {
        &self.entries
    }

    pub fn ticker(&self) -> &Arc<dyn Ticker> {
        &self.ticker
    }

    pub fn start_nanos(&self) -> u64 {
        self.start_nanos
    }

    /// Elapsed so far, or the final duration once completed.
    pub fn duration_nanos(&self) -> u64 {
        let end = self
            .lifecycle
            .lock()
            .end_nanos
            .unwrap_or_else(|| self.ticker.now_nanos());
        end.saturating_sub(self.start_nanos)
    }

    pub fn is_completed(&self) -> bool {
        self.lifecycle.lock().completed
    }

    pub fn is_async(&self) -> bool {
        self.lifecycle.lock().is_async
    }

    pub fn partial_store_count(&self) -> u64 {
        self.partial_stores.load(Ordering::Acquire)
    }

    pub fn set_async(&self) {
        self.lifecycle.lock().is_async = true;
    }

    pub fn mark_async_complete(self: &Arc<Self>) {
        let ready = {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.async_complete = true;
            lifecycle.ready()
        };
        if ready {
            self.complete();
        }
    }

    /// Holds the transaction open for one more aux context. Fails once the
    /// transaction completed or the per-transaction limit is reached.
    pub(crate) fn try_reserve_aux(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.completed || lifecycle.aux_created >= self.max_aux_contexts {
            return false;
        }
        lifecycle.aux_created += 1;
        lifecycle.outstanding += 1;
        true
    }

    /// Drops one hold (the main root or an aux context).
    pub(crate) fn release(self: &Arc<Self>) {
        let ready = {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.outstanding = lifecycle.outstanding.saturating_sub(1);
            lifecycle.ready()
        };
        if ready {
            self.complete();
        }
    }

    fn complete(self: &Arc<Self>) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if !lifecycle.ready() {
                return;
            }
            lifecycle.completed = true;
            lifecycle.end_nanos = Some(self.ticker.now_nanos());
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_transaction(self.id);
        }
        let snapshot = self.snapshot(false);
        debug!(
            id = self.id,
            name = %snapshot.transaction_name,
            entries = snapshot.entries.len(),
            "transaction completed"
        );
        self.collector.on_completed_transaction(snapshot);
    }

    /// Hands an in-flight snapshot to the collector. Does nothing once the
    /// transaction completed.
    pub fn store_partial(&self) -> bool {
        if self.is_completed() {
            return false;
        }
        self.collector.store_partial_transaction(self.snapshot(true));
        self.partial_stores.fetch_add(1, Ordering::AcqRel);
        true
    }

    pub fn snapshot(&self, partial: bool) -> TransactionSnapshot {
        let (complete, is_async) = {
            let lifecycle = self.lifecycle.lock();
            (lifecycle.completed, lifecycle.is_async)
        };
        TransactionSnapshot {
            id: self.id,
            transaction_type: self.transaction_type(),
            transaction_name: self.transaction_name(),
            headline: self.headline.clone(),
            user: self.user(),
            attributes: self.attributes(),
            error: self.error(),
            start_time_millis: self.start_time_millis,
            duration_nanos: self.duration_nanos(),
            slow_threshold_millis: self.slow_threshold_millis(),
            complete,
            partial,
            is_async,
            root_timer: self.root_timer.snapshot(),
            aux_thread_root_timers: self.aux_roots.lock().iter().map(|t| t.snapshot()).collect(),
            entries: self.entries.snapshot(self.start_nanos),
            entry_limit_exceeded: self.entries.limit_exceeded(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionSnapshot {
    pub id: TransactionId,
    pub transaction_type: String,
    pub transaction_name: String,
    pub headline: String,
    pub user: String,
    pub attributes: BTreeMap<String, Vec<String>>,
    pub error: Option<String>,
    pub start_time_millis: u64,
    pub duration_nanos: u64,
    pub slow_threshold_millis: Option<u64>,
    pub complete: bool,
    pub partial: bool,
    pub is_async: bool,
    pub root_timer: TimerSnapshot,
    pub aux_thread_root_timers: Vec<TimerSnapshot>,
    pub entries: Vec<EntrySnapshot>,
    pub entry_limit_exceeded: bool,
}
