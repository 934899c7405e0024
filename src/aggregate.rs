//! Per-interval rollups of completed transactions, keyed by type and name.

use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::mpsc::{RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::collector::TraceCollector;
use crate::timer::TimerSnapshot;
use crate::transaction::TransactionSnapshot;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionAggregate {
    pub transaction_type: String,
    pub transaction_name: String,
    pub count: u64,
    pub error_count: u64,
    pub total_duration_nanos: u64,
    pub max_duration_nanos: u64,
    pub root_timer: TimerSnapshot,
}

impl TransactionAggregate {
    fn new(transaction: &TransactionSnapshot) -> Self {
        Self {
            transaction_type: transaction.transaction_type.clone(),
            transaction_name: transaction.transaction_name.clone(),
            count: 0,
            error_count: 0,
            total_duration_nanos: 0,
            max_duration_nanos: 0,
            root_timer: TimerSnapshot::empty(&transaction.root_timer.name),
        }
    }

    fn add(&mut self, transaction: &TransactionSnapshot) {
        self.count += 1;
        if transaction.error.is_some() {
            self.error_count += 1;
        }
        self.total_duration_nanos += transaction.duration_nanos;
        self.max_duration_nanos = self.max_duration_nanos.max(transaction.duration_nanos);
        self.root_timer.merge(&transaction.root_timer);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateBatch {
    pub capture_time_millis: u64,
    pub aggregates: Vec<TransactionAggregate>,
}

pub trait AggregateSink: Send + Sync + fmt::Debug {
    fn store(&self, batch: AggregateBatch);
}

#[derive(Debug, Default)]
pub struct InMemoryAggregateSink {
    batches: Mutex<Vec<AggregateBatch>>,
}

impl InMemoryAggregateSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn batches(&self) -> Vec<AggregateBatch> {
        self.batches.lock().clone()
    }
}

impl AggregateSink for InMemoryAggregateSink {
    fn store(&self, batch: AggregateBatch) {
        self.batches.lock().push(batch);
    }
}

/// Collector decorator that folds each completed transaction into the
/// current interval before passing it on.
#[derive(Debug)]
pub struct Aggregator {
    delegate: Arc<dyn TraceCollector>,
    sink: Arc<dyn AggregateSink>,
    pending: Mutex<BTreeMap<(String, String), TransactionAggregate>>,
}

impl Aggregator {
    pub fn new(delegate: Arc<dyn TraceCollector>, sink: Arc<dyn AggregateSink>) -> Arc<Self> {
        Arc::new(Self {
            delegate,
            sink,
            pending: Mutex::new(BTreeMap::new()),
        })
    }

    /// Hands the current interval to the sink; returns how many aggregates
    /// it held.
    pub fn flush(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending.lock());
        if pending.is_empty() {
            return 0;
        }
        let capture_time_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let aggregates: Vec<_> = pending.into_values().collect();
        let count = aggregates.len();
        debug!(count, "flushing transaction aggregates");
        self.sink.store(AggregateBatch {
            capture_time_millis,
            aggregates,
        });
        count
    }
}

impl TraceCollector for Aggregator {
    fn on_completed_transaction(&self, transaction: TransactionSnapshot) {
        {
            let key = (
                transaction.transaction_type.clone(),
                transaction.transaction_name.clone(),
            );
            let mut pending = self.pending.lock();
            pending
                .entry(key)
                .or_insert_with(|| TransactionAggregate::new(&transaction))
                .add(&transaction);
        }
        self.delegate.on_completed_transaction(transaction);
    }

    fn store_partial_transaction(&self, transaction: TransactionSnapshot) {
        self.delegate.store_partial_transaction(transaction);
    }
}

/// Flushes an [`Aggregator`] every interval, and once more on shutdown.
#[derive(Debug)]
pub struct AggregateFlusher {
    tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl AggregateFlusher {
    pub fn spawn(aggregator: Arc<Aggregator>, interval: Duration) -> Result<Self> {
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let interval = interval.max(Duration::from_millis(1));
        let handle = std::thread::Builder::new()
            .name("xyzzy-aggregate-flush".to_string())
            .spawn(move || {
                loop {
                    match rx.recv_timeout(interval) {
                        Ok(()) | Err(RecvTimeoutError::Timeout) => {
                            aggregator.flush();
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            aggregator.flush();
                            break;
                        }
                    }
                }
            })?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn shutdown_and_flush(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AggregateFlusher {
    fn drop(&mut self) {
        self.shutdown_and_flush();
    }
}
