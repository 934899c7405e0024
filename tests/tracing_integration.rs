use anyhow::Result;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;
use xyzzy_agent::advice::AdviceCache;
use xyzzy_agent::collector::InMemoryCollector;
use xyzzy_agent::config::{AdviceConfig, AgentConfig, CaptureKind};
use xyzzy_agent::dispatch::AdviceDispatcher;
use xyzzy_agent::invocation::Invocation;
use xyzzy_agent::pointcut::PointcutSpec;
use xyzzy_agent::timer::ManualTicker;
use xyzzy_agent::trace_entry::EntryKind;
use xyzzy_agent::tracer::{StartTransaction, Tracer};

fn advice(method: &str, kind: CaptureKind, timer: &str) -> AdviceConfig {
    AdviceConfig {
        pointcut: PointcutSpec {
            class_name: "com.example.OrderService".to_string(),
            method_name: method.to_string(),
            timer_name: timer.to_string(),
            ..PointcutSpec::default()
        },
        capture_kind: kind,
        ..AdviceConfig::default()
    }
}

fn transaction_advice() -> AdviceConfig {
    AdviceConfig {
        transaction_type: "Web".to_string(),
        transaction_name_template: "{{className}}.{{methodName}}".to_string(),
        ..advice("placeOrder", CaptureKind::Transaction, "http request")
    }
}

fn manual_tracer(config: AgentConfig) -> (Tracer, Arc<InMemoryCollector>, Arc<ManualTicker>) {
    let collector = InMemoryCollector::new();
    let ticker = Arc::new(ManualTicker::new());
    let tracer = Tracer::with_ticker(Arc::new(config), collector.clone(), ticker.clone());
    (tracer, collector, ticker)
}

#[test]
fn woven_timer_inside_transaction_counts_once() -> Result<()> {
    let cache = Arc::new(AdviceCache::new(
        &[],
        &[transaction_advice(), advice("validate", CaptureKind::Timer, "t")],
    )?);
    let (tracer, collector, ticker) = manual_tracer(AgentConfig::default());
    let dispatcher = AdviceDispatcher::new(cache, tracer);

    let mut outer = dispatcher.on_before(0, &Invocation::new("com.example.OrderService", "placeOrder"));
    let mut inner = dispatcher.on_before(1, &Invocation::new("com.example.OrderService", "validate"));
    ticker.advance(Duration::from_millis(4));
    dispatcher.on_return(1, &mut inner, None);
    dispatcher.on_after(1, inner);
    dispatcher.on_return(0, &mut outer, None);
    dispatcher.on_after(0, outer);

    let completed = collector.completed();
    assert_eq!(completed.len(), 1);
    let trace = &completed[0];
    assert_eq!(trace.transaction_name, "com.example.OrderService.placeOrder");
    let t = trace.root_timer.child("t").map(|t| (t.count, t.total_nanos));
    assert_eq!(t, Some((1, 4_000_000)));
    Ok(())
}

#[test]
fn slow_entries_past_the_limit_escalate_up_to_the_cap() {
    let config = AgentConfig {
        max_trace_entries_per_transaction: 2,
        trace_entry_cap_multiplier: 2,
        escalation_threshold_millis: 10,
        ..AgentConfig::default()
    };
    let (tracer, collector, ticker) = manual_tracer(config);
    let mut root = tracer.start_transaction(StartTransaction::new("Web", "/slow", "GET /slow", "http request"));
    let ctx = tracer.context();
    let mut kinds = Vec::new();
    for i in 0..5 {
        let mut entry = ctx.start_trace_entry(&format!("query {i}"), "jdbc");
        kinds.push(entry.kind());
        ticker.advance(Duration::from_millis(20));
        entry.end();
    }
    root.end();

    assert_eq!(
        kinds,
        vec![
            Some(EntryKind::Real),
            Some(EntryKind::Real),
            Some(EntryKind::Dummy),
            Some(EntryKind::Dummy),
            Some(EntryKind::Dummy),
        ]
    );
    let trace = &collector.completed()[0];
    assert!(trace.entry_limit_exceeded);
    let recorded: Vec<&str> = trace.entries[1..].iter().map(|e| e.message.as_str()).collect();
    assert_eq!(recorded, vec!["query 0", "query 1", "query 2", "query 3"]);
    assert!(trace.entries[3].escalated);
    // the timer still sees every call
    assert_eq!(trace.root_timer.child("jdbc").map(|t| t.count), Some(5));
}

#[test]
fn fast_dummies_are_dropped() {
    let config = AgentConfig {
        max_trace_entries_per_transaction: 1,
        escalation_threshold_millis: 10,
        ..AgentConfig::default()
    };
    let (tracer, collector, ticker) = manual_tracer(config);
    let mut root = tracer.start_transaction(StartTransaction::new("Web", "/fast", "GET /fast", "http request"));
    let ctx = tracer.context();
    for _ in 0..3 {
        let mut entry = ctx.start_trace_entry("cache get", "cache");
        ticker.advance(Duration::from_millis(1));
        entry.end();
    }
    root.end();
    let trace = &collector.completed()[0];
    assert_eq!(trace.entries.len(), 2);
    assert!(trace.entry_limit_exceeded);
}

#[test]
fn aux_thread_holds_the_transaction_until_it_finishes() -> Result<()> {
    let collector = InMemoryCollector::new();
    let tracer = Tracer::new(Arc::new(AgentConfig::default()), collector.clone());
    let mut root = tracer.start_transaction(StartTransaction::new("Web", "/async", "GET /async", "http request"));
    let aux = tracer.context().create_aux_thread_context();
    assert!(!aux.is_nop());

    let (started_tx, started_rx) = mpsc::channel();
    let (ended_tx, ended_rx) = mpsc::channel::<()>();
    let worker_tracer = tracer.clone();
    let worker = std::thread::spawn(move || {
        let mut aux_root = aux.start();
        let mut entry = worker_tracer.context().start_trace_entry("render", "render");
        let _ = started_tx.send(());
        let _ = ended_rx.recv();
        std::thread::sleep(Duration::from_millis(50));
        entry.end();
        aux_root.end();
    });
    started_rx.recv()?;
    root.end();
    assert!(collector.completed().is_empty(), "aux thread still running");
    assert_eq!(tracer.registry().len(), 1);
    ended_tx.send(())?;

    worker.join().map_err(|_| anyhow::anyhow!("worker panicked"))?;
    let completed = collector.completed();
    assert_eq!(completed.len(), 1);
    let trace = &completed[0];
    assert_eq!(trace.aux_thread_root_timers.len(), 1);
    let end_of = |message: &str| -> Result<u64> {
        let entry = trace
            .entries
            .iter()
            .find(|e| e.message == message)
            .ok_or_else(|| anyhow::anyhow!("no entry {message}"))?;
        let duration = entry.duration_nanos.ok_or_else(|| anyhow::anyhow!("{message} still running"))?;
        Ok(entry.start_offset_nanos + duration)
    };
    let main_end = end_of("GET /async")?;
    let render_end = end_of("render")?;
    assert!(render_end >= main_end + 50_000_000, "render ended after the main root");
    assert!(trace.duration_nanos >= render_end);
    assert!(tracer.registry().is_empty());
    Ok(())
}

#[test]
fn async_transactions_complete_when_marked() -> Result<()> {
    let (tracer, collector, _) = manual_tracer(AgentConfig::default());
    let mut root = tracer.start_transaction(StartTransaction::new("Web", "/callback", "GET /callback", "http request"));
    let ctx = tracer.context();
    ctx.set_transaction_async();
    let aux = ctx.create_aux_thread_context();
    root.end();

    let worker = std::thread::spawn(move || {
        let mut aux_root = aux.start_and_mark_async_transaction_complete();
        aux_root.end();
    });
    worker.join().map_err(|_| anyhow::anyhow!("worker panicked"))?;
    let completed = collector.completed();
    assert_eq!(completed.len(), 1);
    assert!(completed[0].is_async);
    Ok(())
}

fn grouped_entry(method: &str) -> AdviceConfig {
    AdviceConfig {
        trace_entry_message_template: "http {{methodName}}".to_string(),
        pointcut: PointcutSpec {
            nesting_group: "http-client".to_string(),
            ..advice(method, CaptureKind::TraceEntry, "http client").pointcut
        },
        ..advice(method, CaptureKind::TraceEntry, "http client")
    }
}

#[test]
fn shared_nesting_group_records_only_the_outermost_call() -> Result<()> {
    let cache = Arc::new(AdviceCache::new(
        &[],
        &[transaction_advice(), grouped_entry("execute"), grouped_entry("send")],
    )?);
    let (tracer, collector, _) = manual_tracer(AgentConfig::default());
    let dispatcher = AdviceDispatcher::new(cache, tracer);

    let mut root = dispatcher.on_before(0, &Invocation::new("com.example.OrderService", "placeOrder"));
    let mut outer = dispatcher.on_before(1, &Invocation::new("com.example.OrderService", "execute"));
    let mut inner = dispatcher.on_before(2, &Invocation::new("com.example.OrderService", "send"));
    assert!(!outer.is_skipped());
    assert!(inner.is_skipped());
    dispatcher.on_return(2, &mut inner, None);
    dispatcher.on_after(2, inner);
    dispatcher.on_return(1, &mut outer, None);
    dispatcher.on_after(1, outer);
    dispatcher.on_return(0, &mut root, None);
    dispatcher.on_after(0, root);

    let trace = &collector.completed()[0];
    let messages: Vec<&str> = trace.entries[1..].iter().map(|e| e.message.as_str()).collect();
    assert_eq!(messages, vec!["http execute"]);
    Ok(())
}

#[test]
fn nesting_groups_are_suppressed_per_thread() -> Result<()> {
    let cache = Arc::new(AdviceCache::new(
        &[],
        &[transaction_advice(), grouped_entry("execute"), grouped_entry("send")],
    )?);
    let (tracer, collector, _) = manual_tracer(AgentConfig::default());
    let dispatcher = Arc::new(AdviceDispatcher::new(cache, tracer.clone()));
    let send = Invocation::new("com.example.OrderService", "send");

    let mut root = dispatcher.on_before(0, &Invocation::new("com.example.OrderService", "placeOrder"));
    let mut outer = dispatcher.on_before(1, &Invocation::new("com.example.OrderService", "execute"));
    assert!(!outer.is_skipped());

    // the aux thread has its own context and so its own suppressed groups
    let aux = tracer.context().create_aux_thread_context();
    let worker_dispatcher = dispatcher.clone();
    let worker_send = send.clone();
    let worker = std::thread::spawn(move || {
        let mut aux_root = aux.start();
        let mut traveler = worker_dispatcher.on_before(2, &worker_send);
        let captured = !traveler.is_skipped();
        worker_dispatcher.on_return(2, &mut traveler, None);
        worker_dispatcher.on_after(2, traveler);
        aux_root.end();
        captured
    });
    let captured = worker.join().map_err(|_| anyhow::anyhow!("worker panicked"))?;
    assert!(captured);

    let inner = dispatcher.on_before(2, &send);
    assert!(inner.is_skipped(), "still suppressed on the main thread");
    dispatcher.on_after(2, inner);
    dispatcher.on_return(1, &mut outer, None);
    dispatcher.on_after(1, outer);
    dispatcher.on_return(0, &mut root, None);
    dispatcher.on_after(0, root);

    let trace = &collector.completed()[0];
    let mut messages: Vec<&str> = trace
        .entries
        .iter()
        .map(|e| e.message.as_str())
        .filter(|m| m.starts_with("http "))
        .collect();
    messages.sort_unstable();
    assert_eq!(messages, vec!["http execute", "http send"]);
    Ok(())
}

#[test]
fn managed_threads_keep_their_own_context() -> Result<()> {
    let (tracer, collector, _) = manual_tracer(AgentConfig::default());
    let registry = tracer.registry().clone();
    let worker_tracer = tracer.clone();
    let handle = registry.spawn_managed("xyzzy-test-worker", move || {
        let managed = worker_tracer.registry().is_managed_thread();
        let mut root =
            worker_tracer.start_transaction(StartTransaction::new("Background", "job", "job", "background"));
        let in_transaction = worker_tracer.context().is_in_transaction();
        root.end();
        (managed, in_transaction, worker_tracer.context().is_in_transaction())
    })?;
    let (managed, during, after) = handle.join().map_err(|_| anyhow::anyhow!("worker panicked"))?;
    assert!(managed);
    assert!(during);
    assert!(!after);
    assert!(!tracer.context().is_in_transaction());
    assert_eq!(collector.completed()[0].transaction_type, "Background");
    Ok(())
}
