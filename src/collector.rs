//! Where finished and in-flight transactions go, and the watcher that
//! stores long-running transactions before they complete.

use anyhow::Result;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::mpsc::{RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::AgentConfig;
use crate::registry::TransactionRegistry;
use crate::transaction::{Transaction, TransactionSnapshot};

pub trait TraceCollector: Send + Sync + fmt::Debug {
    fn on_completed_transaction(&self, transaction: TransactionSnapshot);
    /// An in-flight snapshot; a later partial or the completed snapshot of
    /// the same id supersedes it.
    fn store_partial_transaction(&self, transaction: TransactionSnapshot);
}

/// Keeps everything in memory; used by tests and the offline tools.
#[derive(Debug, Default)]
pub struct InMemoryCollector {
    completed: Mutex<Vec<TransactionSnapshot>>,
    partial: Mutex<Vec<TransactionSnapshot>>,
}

impl InMemoryCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn completed(&self) -> Vec<TransactionSnapshot> {
        self.completed.lock().clone()
    }

    pub fn partial(&self) -> Vec<TransactionSnapshot> {
        self.partial.lock().clone()
    }
}

impl TraceCollector for InMemoryCollector {
    fn on_completed_transaction(&self, transaction: TransactionSnapshot) {
        self.completed.lock().push(transaction);
    }

    fn store_partial_transaction(&self, transaction: TransactionSnapshot) {
        self.partial.lock().push(transaction);
    }
}

/// Logs every transaction as one JSON line.
#[derive(Debug, Default)]
pub struct LoggingCollector;

impl TraceCollector for LoggingCollector {
    fn on_completed_transaction(&self, transaction: TransactionSnapshot) {
        match serde_json::to_string(&transaction) {
            Ok(json) => info!(target: "xyzzy_agent::trace", "{json}"),
            Err(e) => debug!("unserializable transaction {}: {e}", transaction.id),
        }
    }

    fn store_partial_transaction(&self, transaction: TransactionSnapshot) {
        match serde_json::to_string(&transaction) {
            Ok(json) => info!(target: "xyzzy_agent::trace", partial = true, "{json}"),
            Err(e) => debug!("unserializable transaction {}: {e}", transaction.id),
        }
    }
}

/// Polls the registry and stores a partial snapshot of every transaction
/// each time it runs another full threshold without completing.
#[derive(Debug)]
pub struct ImmediateTraceStoreWatcher {
    tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ImmediateTraceStoreWatcher {
    pub fn spawn(registry: Arc<TransactionRegistry>, config: &AgentConfig) -> Result<Self> {
        let threshold = Duration::from_secs(config.immediate_partial_store_threshold_seconds);
        let poll = Duration::from_millis(config.immediate_partial_store_poll_millis.max(1));
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let handle = std::thread::Builder::new()
            .name("xyzzy-immediate-store".to_string())
            .spawn(move || {
                loop {
                    match rx.recv_timeout(poll) {
                        Ok(()) | Err(RecvTimeoutError::Timeout) => {
                            store_due_transactions(&registry, threshold);
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    /// Runs a check now instead of waiting for the next poll.
    pub fn wake(&self) {
        if let Some(tx) = self.tx.as_ref() {
            let _ = tx.send(());
        }
    }

    pub fn shutdown(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ImmediateTraceStoreWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Stores partial snapshots of transactions that crossed their next
/// threshold multiple. A zero threshold disables storing.
pub fn store_due_transactions(registry: &TransactionRegistry, threshold: Duration) -> usize {
    let threshold_nanos = threshold.as_nanos() as u64;
    if threshold_nanos == 0 {
        return 0;
    }
    let mut stored = 0;
    for transaction in registry.transactions() {
        let due = threshold_nanos.saturating_mul(transaction.partial_store_count() + 1);
        if transaction.duration_nanos() >= due && ImmediateTraceStoreRunnable::new(transaction).run() {
            stored += 1;
        }
    }
    stored
}

/// One partial store of one transaction.
#[derive(Debug, Clone)]
pub struct ImmediateTraceStoreRunnable {
    transaction: Arc<Transaction>,
}

impl ImmediateTraceStoreRunnable {
    pub fn new(transaction: Arc<Transaction>) -> Self {
        Self { transaction }
    }

    /// False when the transaction already completed; its final snapshot
    /// supersedes any partial one.
    pub fn run(&self) -> bool {
        let stored = self.transaction.store_partial();
        if stored {
            debug!(id = self.transaction.id(), "stored partial transaction");
        }
        stored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::ManualTicker;
    use crate::tracer::{StartTransaction, Tracer};
    use std::time::Instant;

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        done()
    }

    #[test]
    fn watcher_stores_long_transactions_in_the_background() -> anyhow::Result<()> {
        let config = AgentConfig {
            immediate_partial_store_threshold_seconds: 1,
            immediate_partial_store_poll_millis: 1,
            ..AgentConfig::default()
        };
        let collector = InMemoryCollector::new();
        let ticker = Arc::new(ManualTicker::new());
        let tracer = Tracer::with_ticker(Arc::new(config.clone()), collector.clone(), ticker.clone());
        let mut watcher = ImmediateTraceStoreWatcher::spawn(tracer.registry().clone(), &config)?;

        let mut root = tracer.start_transaction(StartTransaction::new("Web", "/slow", "GET /slow", "http request"));
        ticker.advance(Duration::from_millis(500));
        std::thread::sleep(Duration::from_millis(20));
        assert!(collector.partial().is_empty());

        ticker.advance(Duration::from_millis(600));
        assert!(wait_until(|| collector.partial().len() == 1));
        ticker.advance(Duration::from_secs(1));
        watcher.wake();
        assert!(wait_until(|| collector.partial().len() == 2));

        root.end();
        watcher.shutdown();
        assert_eq!(collector.partial().len(), 2);
        assert!(collector.partial().iter().all(|t| t.partial));
        assert_eq!(collector.completed().len(), 1);
        Ok(())
    }

    #[test]
    fn zero_threshold_stores_nothing() {
        let collector = InMemoryCollector::new();
        let tracer = Tracer::with_ticker(
            Arc::new(AgentConfig::default()),
            collector.clone(),
            Arc::new(ManualTicker::new()),
        );
        let mut root = tracer.start_transaction(StartTransaction::new("Web", "/a", "GET /a", "http request"));
        assert_eq!(store_due_transactions(tracer.registry(), Duration::ZERO), 0);
        root.end();
        assert!(collector.partial().is_empty());
    }
}
