//! Trace entries and the per-transaction entry log.
//!
//! An entry is admitted as real while the transaction holds fewer than
//! `max` real entries; later entries start as dummies that record nothing.
//! A dummy is escalated when it ends, if it ran past the escalation
//! threshold or carries an error, until the log holds `max * multiplier`
//! entries. Past that cap dummies stay dummies. Transaction roots and
//! auxiliary thread roots are recorded but never counted.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::invocation::Throwable;
use crate::thread_context::ThreadContext;
use crate::timer::{Timer, TimerNode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLimits {
    pub max_real: usize,
    pub cap_multiplier: usize,
    pub escalation_threshold_nanos: u64,
}

impl EntryLimits {
    pub fn hard_cap(&self) -> usize {
        self.max_real.saturating_mul(self.cap_multiplier)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct EntryEnd {
    end_nanos: u64,
    error: Option<String>,
}

/// One recorded entry, shared between the log and its live handle.
#[derive(Debug)]
pub struct EntryRecord {
    message: Mutex<String>,
    start_nanos: u64,
    depth: usize,
    escalated: bool,
    end: Mutex<Option<EntryEnd>>,
}

impl EntryRecord {
    fn new(message: String, start_nanos: u64, depth: usize, escalated: bool) -> Arc<Self> {
        Arc::new(Self {
            message: Mutex::new(message),
            start_nanos,
            depth,
            escalated,
            end: Mutex::new(None),
        })
    }

    fn finish(&self, end_nanos: u64, error: Option<String>) {
        *self.end.lock() = Some(EntryEnd { end_nanos, error });
    }

    fn snapshot(&self, transaction_start: u64) -> EntrySnapshot {
        let end = self.end.lock().clone();
        let active = end.is_none();
        EntrySnapshot {
            message: self.message.lock().clone(),
            start_offset_nanos: self.start_nanos.saturating_sub(transaction_start),
            duration_nanos: end.as_ref().map(|e| e.end_nanos.saturating_sub(self.start_nanos)),
            depth: self.depth,
            error: end.and_then(|e| e.error),
            active,
            escalated: self.escalated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntrySnapshot {
    pub message: String,
    pub start_offset_nanos: u64,
    /// `None` while the entry is still running.
    pub duration_nanos: Option<u64>,
    pub depth: usize,
    pub error: Option<String>,
    pub active: bool,
    pub escalated: bool,
}

/// Entries of one transaction, appended from any thread working on it.
#[derive(Debug)]
pub struct EntryLog {
    limits: EntryLimits,
    inner: Mutex<EntryLogInner>,
}

#[derive(Debug, Default)]
struct EntryLogInner {
    records: Vec<Arc<EntryRecord>>,
    /// Admitted plus escalated entries; roots are not counted.
    counted: usize,
    limit_exceeded: bool,
}

impl EntryLog {
    pub fn new(limits: EntryLimits) -> Self {
        Self {
            limits,
            inner: Mutex::new(EntryLogInner::default()),
        }
    }

    pub fn limits(&self) -> EntryLimits {
        self.limits
    }

    /// A real record while under `max_real`, otherwise `None` (dummy).
    fn admit(&self, message: &str, start_nanos: u64, depth: usize) -> Option<Arc<EntryRecord>> {
        let mut inner = self.inner.lock();
        if inner.counted >= self.limits.max_real {
            inner.limit_exceeded = true;
            return None;
        }
        inner.counted += 1;
        let record = EntryRecord::new(message.to_string(), start_nanos, depth, false);
        inner.records.push(record.clone());
        Some(record)
    }

    fn record_uncounted(&self, message: &str, start_nanos: u64, depth: usize) -> Arc<EntryRecord> {
        let record = EntryRecord::new(message.to_string(), start_nanos, depth, false);
        self.inner.lock().records.push(record.clone());
        record
    }

    /// Appends an ended dummy if it qualifies and the hard cap allows it.
    fn escalate(&self, dummy: &Dummy, end_nanos: u64, error: Option<String>) -> bool {
        let duration = end_nanos.saturating_sub(dummy.start_nanos);
        if duration < self.limits.escalation_threshold_nanos && error.is_none() {
            return false;
        }
        let mut inner = self.inner.lock();
        if inner.counted >= self.limits.hard_cap() {
            return false;
        }
        inner.counted += 1;
        let record = EntryRecord::new(dummy.message.clone(), dummy.start_nanos, dummy.depth, true);
        record.finish(end_nanos, error);
        inner.records.push(record);
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn counted(&self) -> usize {
        self.inner.lock().counted
    }

    pub fn limit_exceeded(&self) -> bool {
        self.inner.lock().limit_exceeded
    }

    pub fn snapshot(&self, transaction_start: u64) -> Vec<EntrySnapshot> {
        let records = self.inner.lock().records.clone();
        records.iter().map(|r| r.snapshot(transaction_start)).collect()
    }
}

#[derive(Debug, Clone)]
struct Dummy {
    message: String,
    start_nanos: u64,
    depth: usize,
}

#[derive(Debug)]
enum EntryState {
    /// The transaction's own root or an auxiliary thread root.
    Root(Arc<EntryRecord>),
    Real(Arc<EntryRecord>),
    /// Holds its message only on this handle; nothing is in the log yet.
    Dummy(Dummy),
    Ended { recorded: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Root,
    Real,
    Dummy,
}

/// Handle to a started trace entry. A nop handle ignores everything.
#[derive(Debug, Default)]
pub struct TraceEntry {
    inner: Option<EntryInner>,
}

#[derive(Debug)]
struct EntryInner {
    context: Arc<ThreadContext>,
    state: EntryState,
    timer: Option<Timer>,
    /// Timer node kept for `extend` after the entry ended.
    node: Option<Arc<TimerNode>>,
}

impl TraceEntry {
    pub fn nop() -> Self {
        Self { inner: None }
    }

    pub(crate) fn root(context: Arc<ThreadContext>, record: Arc<EntryRecord>, timer: Timer) -> Self {
        let node = timer.node().cloned();
        Self {
            inner: Some(EntryInner {
                context,
                state: EntryState::Root(record),
                timer: Some(timer),
                node,
            }),
        }
    }

    pub(crate) fn start(
        context: Arc<ThreadContext>,
        log: &EntryLog,
        message: &str,
        start_nanos: u64,
        depth: usize,
        timer: Timer,
    ) -> Self {
        let state = match log.admit(message, start_nanos, depth) {
            Some(record) => EntryState::Real(record),
            None => EntryState::Dummy(Dummy {
                message: message.to_string(),
                start_nanos,
                depth,
            }),
        };
        let node = timer.node().cloned();
        Self {
            inner: Some(EntryInner {
                context,
                state,
                timer: Some(timer),
                node,
            }),
        }
    }

    pub(crate) fn record_root(log: &EntryLog, message: &str, start_nanos: u64) -> Arc<EntryRecord> {
        log.record_uncounted(message, start_nanos, 0)
    }

    pub fn is_nop(&self) -> bool {
        self.inner.is_none()
    }

    /// `None` once ended (and for nop handles).
    pub fn kind(&self) -> Option<EntryKind> {
        match self.inner.as_ref().map(|i| &i.state) {
            Some(EntryState::Root(_)) => Some(EntryKind::Root),
            Some(EntryState::Real(_)) => Some(EntryKind::Real),
            Some(EntryState::Dummy(_)) => Some(EntryKind::Dummy),
            Some(EntryState::Ended { .. }) | None => None,
        }
    }

    /// Whether the ended entry made it into the log.
    pub fn was_recorded(&self) -> bool {
        matches!(
            self.inner.as_ref().map(|i| &i.state),
            Some(EntryState::Ended { recorded: true })
        )
    }

    pub fn set_message(&mut self, message: &str) {
        let Some(inner) = self.inner.as_mut() else {
            return;
        };
        match &mut inner.state {
            EntryState::Root(record) | EntryState::Real(record) => *record.message.lock() = message.to_string(),
            EntryState::Dummy(dummy) => dummy.message = message.to_string(),
            EntryState::Ended { .. } => {}
        }
    }

    pub fn end(&mut self) {
        self.finish(None, false);
    }

    /// Ends with an error; on a transaction root this also marks the
    /// transaction as errored.
    pub fn end_with_error(&mut self, throwable: &Throwable) {
        self.finish(Some(throwable.to_string()), true);
    }

    /// Records the throwable on the entry without treating it as an error of
    /// the transaction.
    pub fn end_with_info(&mut self, throwable: &Throwable) {
        self.finish(Some(throwable.to_string()), false);
    }

    pub(crate) fn end_with_error_message(&mut self, message: &str) {
        self.finish(Some(message.to_string()), false);
    }

    /// Reopens the entry's timer for more work on the same logical operation;
    /// the time is added without counting another invocation.
    pub fn extend(&self) -> Timer {
        let Some(inner) = self.inner.as_ref() else {
            return Timer::nop();
        };
        match &inner.node {
            Some(node) => inner.context.extend_timer(node.clone()),
            None => Timer::nop(),
        }
    }

    fn finish(&mut self, error: Option<String>, is_error: bool) {
        let Some(inner) = self.inner.as_mut() else {
            return;
        };
        let state = std::mem::replace(&mut inner.state, EntryState::Ended { recorded: false });
        if let EntryState::Ended { recorded } = state {
            debug!("trace entry ended twice");
            inner.state = EntryState::Ended { recorded };
            return;
        }
        if let Some(timer) = inner.timer.take() {
            timer.stop();
        }
        let end_nanos = inner.context.now_nanos();
        let context = inner.context.clone();
        let recorded = match state {
            EntryState::Root(record) => {
                record.finish(end_nanos, error.clone());
                if is_error && let Some(message) = &error {
                    context.transaction().set_error(message);
                }
                context.end_root(end_nanos);
                true
            }
            EntryState::Real(record) => {
                record.finish(end_nanos, error);
                context.pop_entry();
                true
            }
            EntryState::Dummy(dummy) => {
                let escalated = context.transaction().entries().escalate(&dummy, end_nanos, error);
                context.pop_entry();
                escalated
            }
            EntryState::Ended { .. } => false,
        };
        inner.state = EntryState::Ended { recorded };
    }
}
