//! Entry point for starting transactions on the calling thread.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::collector::TraceCollector;
use crate::config::{AgentConfig, AlreadyInTransactionBehavior};
use crate::registry::TransactionRegistry;
use crate::thread_context::{ContextKind, ThreadContext, TraceContext, nop_context};
use crate::timer::{SystemTicker, Ticker};
use crate::trace_entry::{EntryLimits, TraceEntry};
use crate::transaction::{NewTransaction, PRIORITY_CORE_PLUGIN, Transaction, TransactionSettings};

#[derive(Debug, Clone, Copy)]
pub struct StartTransaction<'a> {
    pub transaction_type: &'a str,
    pub transaction_name: &'a str,
    pub message: &'a str,
    pub timer_name: &'a str,
    pub priority: i32,
    pub behavior: AlreadyInTransactionBehavior,
}

impl<'a> StartTransaction<'a> {
    pub fn new(transaction_type: &'a str, transaction_name: &'a str, message: &'a str, timer_name: &'a str) -> Self {
        Self {
            transaction_type,
            transaction_name,
            message,
            timer_name,
            priority: PRIORITY_CORE_PLUGIN,
            behavior: AlreadyInTransactionBehavior::CaptureTraceEntry,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn behavior(mut self, behavior: AlreadyInTransactionBehavior) -> Self {
        self.behavior = behavior;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Tracer {
    registry: Arc<TransactionRegistry>,
    collector: Arc<dyn TraceCollector>,
    config: Arc<AgentConfig>,
    ticker: Arc<dyn Ticker>,
}

impl Tracer {
    pub fn new(config: Arc<AgentConfig>, collector: Arc<dyn TraceCollector>) -> Self {
        Self::with_ticker(config, collector, Arc::new(SystemTicker::new()))
    }

    pub fn with_ticker(config: Arc<AgentConfig>, collector: Arc<dyn TraceCollector>, ticker: Arc<dyn Ticker>) -> Self {
        let registry = TransactionRegistry::new(config.managed_thread_slots);
        Self::with_registry(config, collector, ticker, registry)
    }

    /// A tracer over an existing registry; tracers sharing one registry see
    /// each other's threads and in-flight transactions.
    pub fn with_registry(
        config: Arc<AgentConfig>,
        collector: Arc<dyn TraceCollector>,
        ticker: Arc<dyn Ticker>,
        registry: Arc<TransactionRegistry>,
    ) -> Self {
        Self {
            registry,
            collector,
            config,
            ticker,
        }
    }

    pub fn registry(&self) -> &Arc<TransactionRegistry> {
        &self.registry
    }

    pub fn collector(&self) -> &Arc<dyn TraceCollector> {
        &self.collector
    }

    pub fn config(&self) -> &Arc<AgentConfig> {
        &self.config
    }

    pub fn ticker(&self) -> &Arc<dyn Ticker> {
        &self.ticker
    }

    fn settings(&self) -> TransactionSettings {
        TransactionSettings {
            limits: EntryLimits {
                max_real: self.config.max_trace_entries_per_transaction,
                cap_multiplier: self.config.trace_entry_cap_multiplier,
                escalation_threshold_nanos: Duration::from_millis(self.config.escalation_threshold_millis).as_nanos()
                    as u64,
            },
            max_aux_contexts: self.config.max_aux_thread_contexts_per_transaction,
        }
    }

    /// Starts a transaction, or acts on the enclosing one according to
    /// `start.behavior` when the thread is already inside a transaction.
    pub fn start_transaction(&self, start: StartTransaction<'_>) -> TraceEntry {
        if let Some(current) = self.thread_context() {
            match start.behavior {
                AlreadyInTransactionBehavior::CaptureTraceEntry => {
                    return current.start_trace_entry(start.message, start.timer_name);
                }
                AlreadyInTransactionBehavior::DoNothing => return TraceEntry::nop(),
                AlreadyInTransactionBehavior::CaptureNewTransaction => {
                    debug!(outer = current.transaction().id(), "nesting a new transaction");
                }
            }
        }
        let transaction = Transaction::new(
            NewTransaction {
                transaction_type: start.transaction_type,
                transaction_name: start.transaction_name,
                headline: start.message,
                timer_name: start.timer_name,
                priority: start.priority,
            },
            self.settings(),
            self.ticker.clone(),
            Arc::downgrade(&self.registry),
            self.collector.clone(),
        );
        self.registry.add_transaction(transaction.clone());
        let root = transaction.root_timer().clone();
        ThreadContext::install_root(transaction, &self.registry, root, start.message, ContextKind::Main)
    }

    /// The calling thread's live context, if it is inside a transaction.
    pub fn thread_context(&self) -> Option<Arc<ThreadContext>> {
        self.registry.current_thread_context().filter(|c| !c.is_ended())
    }

    pub fn context(&self) -> Arc<dyn TraceContext> {
        match self.thread_context() {
            Some(context) => context,
            None => nop_context(),
        }
    }

    pub fn current_transaction(&self) -> Option<Arc<Transaction>> {
        self.thread_context().map(|c| c.transaction().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{InMemoryCollector, store_due_transactions};
    use crate::timer::ManualTicker;
    use crate::trace_entry::EntryKind;

    fn tracer(config: AgentConfig) -> (Tracer, Arc<InMemoryCollector>, Arc<ManualTicker>) {
        let collector = InMemoryCollector::new();
        let ticker = Arc::new(ManualTicker::new());
        let tracer = Tracer::with_ticker(Arc::new(config), collector.clone(), ticker.clone());
        (tracer, collector, ticker)
    }

    #[test]
    fn nested_entries_and_timers_build_one_transaction() {
        let (tracer, collector, ticker) = tracer(AgentConfig::default());
        let mut root = tracer.start_transaction(StartTransaction::new("Web", "/a", "GET /a", "http request"));
        assert_eq!(root.kind(), Some(EntryKind::Root));
        let ctx = tracer.context();
        assert!(ctx.is_in_transaction());
        for _ in 0..2 {
            let mut entry = ctx.start_trace_entry("jdbc query", "jdbc");
            // same-name nesting adds nothing
            let inner = ctx.start_timer("jdbc");
            assert!(inner.is_nop());
            ticker.advance(Duration::from_millis(3));
            entry.end();
        }
        root.end();
        assert!(!tracer.context().is_in_transaction());
        assert!(tracer.registry().is_empty());

        let completed = collector.completed();
        assert_eq!(completed.len(), 1);
        let trace = &completed[0];
        assert_eq!(trace.transaction_name, "/a");
        assert_eq!(trace.duration_nanos, 6_000_000);
        let jdbc = trace.root_timer.child("jdbc").map(|t| (t.count, t.total_nanos));
        assert_eq!(jdbc, Some((2, 6_000_000)));
        assert_eq!(trace.entries.len(), 3);
        assert_eq!(trace.entries[1].depth, 1);
    }

    #[test]
    fn already_in_transaction_behaviors() {
        let (tracer, collector, _) = tracer(AgentConfig::default());
        let mut outer = tracer.start_transaction(StartTransaction::new("Web", "outer", "outer", "outer"));
        let start = StartTransaction::new("Background", "inner", "inner", "inner");

        let nothing = tracer.start_transaction(start.behavior(AlreadyInTransactionBehavior::DoNothing));
        assert!(nothing.is_nop());

        let mut entry = tracer.start_transaction(start);
        assert_eq!(entry.kind(), Some(EntryKind::Real));
        entry.end();

        let mut nested =
            tracer.start_transaction(start.behavior(AlreadyInTransactionBehavior::CaptureNewTransaction));
        assert_eq!(nested.kind(), Some(EntryKind::Root));
        nested.end();
        assert_eq!(
            tracer.current_transaction().map(|t| t.transaction_name()),
            Some("outer".to_string())
        );
        outer.end();

        let names: Vec<_> = collector.completed().into_iter().map(|t| t.transaction_name).collect();
        assert_eq!(names, vec!["inner", "outer"]);
    }

    #[test]
    fn errors_on_the_root_mark_the_transaction() {
        let (tracer, collector, _) = tracer(AgentConfig::default());
        let mut root = tracer.start_transaction(StartTransaction::new("Web", "/e", "GET /e", "http request"));
        tracer.context().add_error_entry("lookup failed", None);
        root.end_with_error(&crate::invocation::Throwable::new("java.io.IOException", Some("reset")));
        let trace = &collector.completed()[0];
        assert_eq!(trace.error.as_deref(), Some("java.io.IOException: reset"));
        assert_eq!(trace.entries[1].error.as_deref(), Some("lookup failed"));
    }

    #[test]
    fn long_transactions_are_stored_partially_once_per_threshold() {
        let (tracer, collector, ticker) = tracer(AgentConfig::default());
        let mut root = tracer.start_transaction(StartTransaction::new("Web", "/slow", "GET /slow", "http request"));
        let threshold = Duration::from_secs(60);
        assert_eq!(store_due_transactions(tracer.registry(), threshold), 0);
        ticker.advance(Duration::from_secs(61));
        assert_eq!(store_due_transactions(tracer.registry(), threshold), 1);
        assert_eq!(store_due_transactions(tracer.registry(), threshold), 0);
        ticker.advance(Duration::from_secs(60));
        assert_eq!(store_due_transactions(tracer.registry(), threshold), 1);
        root.end();
        assert_eq!(store_due_transactions(tracer.registry(), threshold), 0);
        assert_eq!(collector.partial().len(), 2);
        assert!(collector.partial()[0].root_timer.active);
        assert_eq!(collector.completed().len(), 1);
    }

    #[test]
    fn tracers_over_one_registry_share_thread_state() {
        let (first, collector, ticker) = tracer(AgentConfig::default());
        let second = Tracer::with_registry(
            first.config().clone(),
            collector.clone(),
            ticker.clone(),
            first.registry().clone(),
        );
        assert!(Arc::ptr_eq(first.registry(), second.registry()));

        let mut root = first.start_transaction(StartTransaction::new("Web", "/a", "GET /a", "http request"));
        assert!(second.context().is_in_transaction());
        assert_eq!(second.registry().len(), 1);
        let mut entry = second.start_transaction(StartTransaction::new("Web", "/b", "nested", "nested"));
        assert_eq!(entry.kind(), Some(EntryKind::Real));
        entry.end();
        root.end();
        assert_eq!(collector.completed().len(), 1);
    }

    #[test]
    fn transactions_point_back_at_their_starting_thread() -> anyhow::Result<()> {
        let (tracer, _, _) = tracer(AgentConfig::default());
        let mut root = tracer.start_transaction(StartTransaction::new("Web", "/a", "GET /a", "http request"));
        let transaction = tracer.current_transaction().ok_or_else(|| anyhow::anyhow!("no transaction"))?;
        let main = transaction
            .main_thread_context()
            .ok_or_else(|| anyhow::anyhow!("no main context"))?;
        assert_eq!(main.kind(), ContextKind::Main);
        assert!(tracer.thread_context().is_some_and(|c| Arc::ptr_eq(&c, &main)));

        // an aux thread's context does not replace it
        let aux = tracer.context().create_aux_thread_context();
        let worker = std::thread::spawn(move || {
            let mut aux_root = aux.start();
            aux_root.end();
        });
        worker.join().map_err(|_| anyhow::anyhow!("worker panicked"))?;
        assert!(transaction.main_thread_context().is_some_and(|c| Arc::ptr_eq(&c, &main)));

        drop(main);
        root.end();
        drop(root);
        assert!(transaction.main_thread_context().is_none());
        Ok(())
    }
}
