//! Timer trees. A node aggregates every start/stop of one named timer under
//! one parent, so a loop calling the same method a thousand times produces
//! one node with a count of 1000, not a thousand nodes.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic nanosecond clock.
pub trait Ticker: Send + Sync + fmt::Debug {
    fn now_nanos(&self) -> u64;
}

#[derive(Debug)]
pub struct SystemTicker {
    origin: Instant,
}

impl SystemTicker {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemTicker {
    fn default() -> Self {
        Self::new()
    }
}

impl Ticker for SystemTicker {
    fn now_nanos(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualTicker {
    nanos: AtomicU64,
}

impl ManualTicker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::AcqRel);
    }

    pub fn set(&self, nanos: u64) {
        self.nanos.store(nanos, Ordering::Release);
    }
}

impl Ticker for ManualTicker {
    fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub struct TimerNode {
    name: String,
    total_nanos: AtomicU64,
    count: AtomicU64,
    /// Starts not yet matched by a stop; sync and async work may overlap.
    running: AtomicU32,
    children: Mutex<Vec<Arc<TimerNode>>>,
}

impl TimerNode {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            total_nanos: AtomicU64::new(0),
            count: AtomicU64::new(0),
            running: AtomicU32::new(0),
            children: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn total_nanos(&self) -> u64 {
        self.total_nanos.load(Ordering::Acquire)
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) > 0
    }

    /// The child named `name`, created on first use.
    pub fn child(&self, name: &str) -> Arc<TimerNode> {
        let mut children = self.children.lock();
        if let Some(existing) = children.iter().find(|c| c.name == name) {
            return existing.clone();
        }
        let node = TimerNode::new(name);
        children.push(node.clone());
        node
    }

    pub fn children(&self) -> Vec<Arc<TimerNode>> {
        self.children.lock().clone()
    }

    pub(crate) fn begin(&self) {
        self.running.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn record(&self, nanos: u64, counted: bool) {
        self.total_nanos.fetch_add(nanos, Ordering::AcqRel);
        if counted {
            self.count.fetch_add(1, Ordering::AcqRel);
        }
        self.running.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn snapshot(&self) -> TimerSnapshot {
        TimerSnapshot {
            name: self.name.clone(),
            total_nanos: self.total_nanos(),
            count: self.count(),
            active: self.is_running(),
            children: self.children().iter().map(|c| c.snapshot()).collect(),
        }
    }
}

/// A started timer. Dropping it without [`Timer::stop`] records nothing.
#[must_use = "a timer records nothing until it is stopped"]
#[derive(Debug, Default)]
pub struct Timer {
    inner: Option<TimerInner>,
}

struct TimerInner {
    node: Arc<TimerNode>,
    ticker: Arc<dyn Ticker>,
    start_nanos: u64,
    /// Extensions add time without adding to the count.
    counted: bool,
    on_stop: Option<Box<dyn FnOnce(&Arc<TimerNode>) + Send>>,
}

impl fmt::Debug for TimerInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerInner")
            .field("node", &self.node.name)
            .field("start_nanos", &self.start_nanos)
            .field("counted", &self.counted)
            .finish()
    }
}

impl Timer {
    pub fn nop() -> Self {
        Self { inner: None }
    }

    pub(crate) fn start(
        node: Arc<TimerNode>,
        ticker: Arc<dyn Ticker>,
        counted: bool,
        on_stop: Option<Box<dyn FnOnce(&Arc<TimerNode>) + Send>>,
    ) -> Self {
        node.begin();
        let start_nanos = ticker.now_nanos();
        Self {
            inner: Some(TimerInner {
                node,
                ticker,
                start_nanos,
                counted,
                on_stop,
            }),
        }
    }

    pub fn is_nop(&self) -> bool {
        self.inner.is_none()
    }

    pub fn node(&self) -> Option<&Arc<TimerNode>> {
        self.inner.as_ref().map(|i| &i.node)
    }

    /// Records the elapsed time and returns it (zero for a nop timer).
    pub fn stop(mut self) -> u64 {
        let Some(inner) = self.inner.take() else {
            return 0;
        };
        let elapsed = inner.ticker.now_nanos().saturating_sub(inner.start_nanos);
        inner.node.record(elapsed, inner.counted);
        if let Some(on_stop) = inner.on_stop {
            on_stop(&inner.node);
        }
        elapsed
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            // unbalance the running count, nothing else
            inner.node.running.fetch_sub(1, Ordering::AcqRel);
            if let Some(on_stop) = inner.on_stop {
                on_stop(&inner.node);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerSnapshot {
    pub name: String,
    pub total_nanos: u64,
    pub count: u64,
    pub active: bool,
    pub children: Vec<TimerSnapshot>,
}

impl TimerSnapshot {
    pub fn empty(name: &str) -> Self {
        Self {
            name: name.to_string(),
            total_nanos: 0,
            count: 0,
            active: false,
            children: Vec::new(),
        }
    }

    pub fn child(&self, name: &str) -> Option<&TimerSnapshot> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Adds `other` into `self`, matching children by name.
    pub fn merge(&mut self, other: &TimerSnapshot) {
        self.total_nanos += other.total_nanos;
        self.count += other.count;
        self.active |= other.active;
        for child in &other.children {
            match self.children.iter_mut().find(|c| c.name == child.name) {
                Some(existing) => existing.merge(child),
                None => self.children.push(child.clone()),
            }
        }
    }
}
