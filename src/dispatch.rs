//! Runtime side of woven code: the bridge handlers resolve the advisor by
//! id and act on the calling thread's trace context.
//!
//! A before-handler returns a [`Traveler`] that woven code keeps in a local
//! and hands back to the return, throw and after handlers of the same call.
//! Nothing here may unwind into instrumented code, so every entry point runs
//! under `catch_unwind` and degrades to doing nothing.

use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::advice::{AdviceCache, Advisor, AdvisorId};
use crate::config::CaptureKind;
use crate::invocation::{Invocation, MessageTemplate, Throwable, Value};
use crate::thread_context::TraceContext;
use crate::timer::Timer;
use crate::trace_entry::{EntryKind, TraceEntry};
use crate::tracer::{StartTransaction, Tracer};
use crate::transaction::{PRIORITY_CORE_PLUGIN, PRIORITY_USER_PLUGIN};

pub type TravelerValue = Box<dyn Any + Send>;

/// Code behind `captureKind: other` advice, registered by handler name.
pub trait AdviceHandler: Send + Sync + fmt::Debug {
    fn on_before(&self, _context: &dyn TraceContext, _invocation: &Invocation) -> Option<TravelerValue> {
        None
    }

    /// May replace the method's return value.
    fn on_return(
        &self,
        _context: &dyn TraceContext,
        _traveler: Option<&mut TravelerValue>,
        _return_value: Option<&Value>,
    ) -> Option<Value> {
        None
    }

    fn on_throw(&self, _context: &dyn TraceContext, _traveler: Option<&mut TravelerValue>, _throwable: &Throwable) {}

    fn on_after(&self, _context: &dyn TraceContext, _traveler: Option<TravelerValue>) {}
}

enum TravelerState {
    Skipped,
    Timer(Timer),
    Entry {
        entry: TraceEntry,
        /// Kept when the message needs the return value.
        rerender: Option<(MessageTemplate, Invocation)>,
    },
    Custom {
        handler: Arc<dyn AdviceHandler>,
        value: Option<TravelerValue>,
    },
}

impl fmt::Debug for TravelerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TravelerState::Skipped => f.write_str("Skipped"),
            TravelerState::Timer(t) => f.debug_tuple("Timer").field(t).finish(),
            TravelerState::Entry { entry, .. } => f.debug_tuple("Entry").field(entry).finish(),
            TravelerState::Custom { handler, .. } => f.debug_tuple("Custom").field(handler).finish(),
        }
    }
}

/// Per-call state carried from the before-handler to the others.
#[derive(Debug)]
pub struct Traveler {
    state: TravelerState,
    suppression: Option<(Arc<dyn TraceContext>, String)>,
}

impl Traveler {
    fn skipped() -> Self {
        Self {
            state: TravelerState::Skipped,
            suppression: None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.state, TravelerState::Skipped)
    }

    pub fn entry_kind(&self) -> Option<EntryKind> {
        match &self.state {
            TravelerState::Entry { entry, .. } => entry.kind(),
            _ => None,
        }
    }

    fn release_suppression(&mut self) {
        if let Some((context, group)) = self.suppression.take() {
            context.unsuppress(&group);
        }
    }
}

#[derive(Debug)]
pub struct AdviceDispatcher {
    advice_cache: Arc<AdviceCache>,
    tracer: Tracer,
    handlers: RwLock<HashMap<String, Arc<dyn AdviceHandler>>>,
}

impl AdviceDispatcher {
    pub fn new(advice_cache: Arc<AdviceCache>, tracer: Tracer) -> Self {
        Self {
            advice_cache,
            tracer,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn register_handler(&self, name: &str, handler: Arc<dyn AdviceHandler>) {
        self.handlers.write().insert(name.to_string(), handler);
    }

    pub fn on_before(&self, id: AdvisorId, invocation: &Invocation) -> Traveler {
        match catch_unwind(AssertUnwindSafe(|| self.before(id, invocation))) {
            Ok(traveler) => traveler,
            Err(_) => {
                warn!(advisor = id, "before advice panicked");
                Traveler::skipped()
            }
        }
    }

    pub fn on_return(&self, id: AdvisorId, traveler: &mut Traveler, return_value: Option<&Value>) -> Option<Value> {
        match catch_unwind(AssertUnwindSafe(|| self.on_return_inner(traveler, return_value))) {
            Ok(replacement) => replacement,
            Err(_) => {
                warn!(advisor = id, "return advice panicked");
                None
            }
        }
    }

    pub fn on_throw(&self, id: AdvisorId, traveler: &mut Traveler, throwable: &Throwable) {
        if catch_unwind(AssertUnwindSafe(|| self.on_throw_inner(traveler, throwable))).is_err() {
            warn!(advisor = id, "throw advice panicked");
        }
    }

    pub fn on_after(&self, id: AdvisorId, traveler: Traveler) {
        if catch_unwind(AssertUnwindSafe(move || self.on_after_inner(traveler))).is_err() {
            warn!(advisor = id, "after advice panicked");
        }
    }

    fn before(&self, id: AdvisorId, invocation: &Invocation) -> Traveler {
        let Some(advisor) = self.advice_cache.advisor(id) else {
            debug!(advisor = id, "unknown advisor");
            return Traveler::skipped();
        };
        let group = advisor.effective_nesting_group();
        let context = self.tracer.context();
        if let Some(group) = &group
            && context.is_suppressed(group)
        {
            return Traveler::skipped();
        }
        let state = match advisor.capture_kind() {
            CaptureKind::Timer => {
                if !context.is_in_transaction() {
                    return Traveler::skipped();
                }
                TravelerState::Timer(context.start_timer(advisor.pointcut.timer_name()))
            }
            CaptureKind::TraceEntry => {
                if !context.is_in_transaction() {
                    return Traveler::skipped();
                }
                let template = MessageTemplate::parse(&advisor.config.trace_entry_message_template);
                let message = template.render(invocation, None);
                let entry = context.start_trace_entry(&message, advisor.pointcut.timer_name());
                let rerender = template.uses_return_value().then(|| (template, invocation.clone()));
                TravelerState::Entry { entry, rerender }
            }
            CaptureKind::Transaction => self.start_transaction(&advisor, invocation),
            CaptureKind::Other => {
                let handler = self.handlers.read().get(&advisor.config.handler).cloned();
                let Some(handler) = handler else {
                    debug!(handler = %advisor.config.handler, "no handler registered");
                    return Traveler::skipped();
                };
                let value = handler.on_before(&*context, invocation);
                TravelerState::Custom { handler, value }
            }
        };
        let mut traveler = Traveler {
            state,
            suppression: None,
        };
        if let Some(group) = group {
            let context = self.tracer.context();
            if context.suppress(&group) {
                traveler.suppression = Some((context, group));
            }
        }
        traveler
    }

    fn start_transaction(&self, advisor: &Advisor, invocation: &Invocation) -> TravelerState {
        let config = &advisor.config;
        let priority = if advisor.reweavable {
            PRIORITY_USER_PLUGIN
        } else {
            PRIORITY_CORE_PLUGIN
        };
        let name = MessageTemplate::parse(&config.transaction_name_template).render(invocation, None);
        let message_template = MessageTemplate::parse(&config.trace_entry_message_template);
        let message = if config.trace_entry_message_template.is_empty() {
            name.clone()
        } else {
            message_template.render(invocation, None)
        };
        let entry = self.tracer.start_transaction(
            StartTransaction::new(&config.transaction_type, &name, &message, advisor.pointcut.timer_name())
                .priority(priority)
                .behavior(config.already_in_transaction_behavior),
        );
        if entry.kind() == Some(EntryKind::Root) {
            let context = self.tracer.context();
            if !config.transaction_user_template.is_empty() {
                let user = MessageTemplate::parse(&config.transaction_user_template).render(invocation, None);
                context.set_transaction_user(&user, priority);
            }
            for (attribute, template) in &config.transaction_attribute_templates {
                let value = MessageTemplate::parse(template).render(invocation, None);
                if !value.is_empty() {
                    context.add_transaction_attribute(attribute, &value);
                }
            }
            if let Some(millis) = config.transaction_slow_threshold_millis {
                context.set_transaction_slow_threshold(Duration::from_millis(millis), priority);
            }
        }
        let rerender = message_template
            .uses_return_value()
            .then(|| (message_template, invocation.clone()));
        TravelerState::Entry { entry, rerender }
    }

    fn on_return_inner(&self, traveler: &mut Traveler, return_value: Option<&Value>) -> Option<Value> {
        let state = std::mem::replace(&mut traveler.state, TravelerState::Skipped);
        match state {
            TravelerState::Skipped => None,
            TravelerState::Timer(timer) => {
                timer.stop();
                traveler.release_suppression();
                None
            }
            TravelerState::Entry { mut entry, rerender } => {
                if let Some((template, invocation)) = rerender {
                    entry.set_message(&template.render(&invocation, return_value));
                }
                entry.end();
                traveler.release_suppression();
                None
            }
            TravelerState::Custom { handler, mut value } => {
                let context = self.tracer.context();
                let replacement = handler.on_return(&*context, value.as_mut(), return_value);
                traveler.state = TravelerState::Custom { handler, value };
                traveler.release_suppression();
                replacement
            }
        }
    }

    fn on_throw_inner(&self, traveler: &mut Traveler, throwable: &Throwable) {
        let state = std::mem::replace(&mut traveler.state, TravelerState::Skipped);
        match state {
            TravelerState::Skipped => {}
            TravelerState::Timer(timer) => {
                timer.stop();
                traveler.release_suppression();
            }
            TravelerState::Entry { mut entry, .. } => {
                entry.end_with_error(throwable);
                traveler.release_suppression();
            }
            TravelerState::Custom { handler, mut value } => {
                let context = self.tracer.context();
                handler.on_throw(&*context, value.as_mut(), throwable);
                traveler.state = TravelerState::Custom { handler, value };
                traveler.release_suppression();
            }
        }
    }

    fn on_after_inner(&self, mut traveler: Traveler) {
        let state = std::mem::replace(&mut traveler.state, TravelerState::Skipped);
        if let TravelerState::Custom { handler, value } = state {
            let context = self.tracer.context();
            handler.on_after(&*context, value);
        }
        traveler.release_suppression();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::InMemoryCollector;
    use crate::config::{AdviceConfig, AgentConfig};
    use crate::pointcut::PointcutSpec;
    use crate::timer::ManualTicker;
    use parking_lot::Mutex;

    fn config(method: &str, kind: CaptureKind) -> AdviceConfig {
        AdviceConfig {
            pointcut: PointcutSpec {
                class_name: "com.example.Service".to_string(),
                method_name: method.to_string(),
                timer_name: "t".to_string(),
                ..PointcutSpec::default()
            },
            capture_kind: kind,
            ..AdviceConfig::default()
        }
    }

    fn dispatcher(configs: &[AdviceConfig]) -> anyhow::Result<(AdviceDispatcher, Arc<InMemoryCollector>)> {
        let cache = Arc::new(AdviceCache::new(&[], configs)?);
        let collector = InMemoryCollector::new();
        let tracer = Tracer::with_ticker(
            Arc::new(AgentConfig::default()),
            collector.clone(),
            Arc::new(ManualTicker::new()),
        );
        Ok((AdviceDispatcher::new(cache, tracer), collector))
    }

    fn web_transaction() -> AdviceConfig {
        AdviceConfig {
            transaction_type: "Web".to_string(),
            transaction_name_template: "/users/{{0}}".to_string(),
            transaction_user_template: "{{1}}".to_string(),
            transaction_slow_threshold_millis: Some(250),
            pointcut: PointcutSpec {
                timer_name: "http request".to_string(),
                ..config("handle", CaptureKind::Transaction).pointcut
            },
            ..config("handle", CaptureKind::Transaction)
        }
    }

    #[test]
    fn timer_advice_inside_a_transaction_adds_one_child() -> anyhow::Result<()> {
        let (dispatcher, collector) = dispatcher(&[web_transaction(), config("work", CaptureKind::Timer)])?;
        let request = Invocation::new("com.example.Service", "handle")
            .args(vec![Value::string("42"), Value::string("alice")]);
        let mut outer = dispatcher.on_before(0, &request);
        assert_eq!(outer.entry_kind(), Some(EntryKind::Root));

        let mut inner = dispatcher.on_before(1, &Invocation::new("com.example.Service", "work"));
        assert!(!inner.is_skipped());
        dispatcher.on_return(1, &mut inner, None);
        dispatcher.on_return(0, &mut outer, None);

        let trace = &collector.completed()[0];
        assert_eq!(trace.transaction_type, "Web");
        assert_eq!(trace.transaction_name, "/users/42");
        assert_eq!(trace.user, "alice");
        assert_eq!(trace.slow_threshold_millis, Some(250));
        assert_eq!(trace.root_timer.name, "http request");
        assert_eq!(trace.root_timer.child("t").map(|t| t.count), Some(1));
        Ok(())
    }

    #[test]
    fn timers_outside_transactions_do_nothing() -> anyhow::Result<()> {
        let (dispatcher, collector) = dispatcher(&[config("work", CaptureKind::Timer)])?;
        let mut traveler = dispatcher.on_before(0, &Invocation::new("com.example.Service", "work"));
        assert!(traveler.is_skipped());
        dispatcher.on_return(0, &mut traveler, None);
        assert!(dispatcher.on_before(99, &Invocation::new("x", "y")).is_skipped());
        assert!(collector.completed().is_empty());
        Ok(())
    }

    #[test]
    fn trace_entries_render_return_values_and_suppress_self_nesting() -> anyhow::Result<()> {
        let entry = AdviceConfig {
            trace_entry_message_template: "{{methodName}}({{0}}) => {{_}}".to_string(),
            ..config("find", CaptureKind::TraceEntry)
        };
        let (dispatcher, collector) = dispatcher(&[web_transaction(), entry])?;
        let mut root = dispatcher.on_before(0, &Invocation::new("com.example.Service", "handle"));
        let call = Invocation::new("com.example.Service", "find").args(vec![Value::int(7)]);
        let mut outer = dispatcher.on_before(1, &call);
        let nested = dispatcher.on_before(1, &call);
        assert!(nested.is_skipped());
        dispatcher.on_after(1, nested);
        dispatcher.on_return(1, &mut outer, Some(&Value::string("row")));
        let again = dispatcher.on_before(1, &call);
        assert!(!again.is_skipped(), "group released at return");
        drop(again);
        dispatcher.on_throw(0, &mut root, &Throwable::new("java.lang.IllegalStateException", None));

        let trace = &collector.completed()[0];
        assert_eq!(trace.error.as_deref(), Some("java.lang.IllegalStateException"));
        assert_eq!(trace.entries[1].message, "find(7) => row");
        Ok(())
    }

    #[derive(Debug, Default)]
    struct Recording {
        calls: Mutex<Vec<String>>,
    }

    impl AdviceHandler for Recording {
        fn on_before(&self, context: &dyn TraceContext, invocation: &Invocation) -> Option<TravelerValue> {
            self.calls
                .lock()
                .push(format!("before {} {}", invocation.method_name, context.is_in_transaction()));
            Some(Box::new(5_i64))
        }

        fn on_return(
            &self,
            _context: &dyn TraceContext,
            traveler: Option<&mut TravelerValue>,
            _return_value: Option<&Value>,
        ) -> Option<Value> {
            let n = traveler.and_then(|t| t.downcast_ref::<i64>().copied()).unwrap_or(0);
            self.calls.lock().push("return".to_string());
            Some(Value::int(n * 2))
        }

        fn on_after(&self, _context: &dyn TraceContext, traveler: Option<TravelerValue>) {
            self.calls.lock().push(format!("after {}", traveler.is_some()));
        }
    }

    #[derive(Debug)]
    struct Panicking;

    impl AdviceHandler for Panicking {
        fn on_before(&self, _context: &dyn TraceContext, _invocation: &Invocation) -> Option<TravelerValue> {
            panic!("handler bug");
        }
    }

    #[test]
    fn custom_handlers_get_the_traveler_and_may_replace_returns() -> anyhow::Result<()> {
        let other = AdviceConfig {
            handler: "recording".to_string(),
            ..config("compute", CaptureKind::Other)
        };
        let broken = AdviceConfig {
            handler: "panicking".to_string(),
            ..config("explode", CaptureKind::Other)
        };
        let (dispatcher, _) = dispatcher(&[other, broken])?;
        let recording = Arc::new(Recording::default());
        dispatcher.register_handler("recording", recording.clone());
        dispatcher.register_handler("panicking", Arc::new(Panicking));

        let mut traveler = dispatcher.on_before(0, &Invocation::new("com.example.Service", "compute"));
        let replaced = dispatcher.on_return(0, &mut traveler, Some(&Value::int(1)));
        dispatcher.on_after(0, traveler);
        assert_eq!(replaced, Some(Value::int(10)));
        assert_eq!(
            *recording.calls.lock(),
            vec!["before compute false", "return", "after true"]
        );

        let traveler = dispatcher.on_before(1, &Invocation::new("com.example.Service", "explode"));
        assert!(traveler.is_skipped());
        Ok(())
    }

    #[test]
    fn custom_advice_releases_its_group_when_the_method_throws() -> anyhow::Result<()> {
        let grouped = AdviceConfig {
            handler: "recording".to_string(),
            pointcut: PointcutSpec {
                nesting_group: "cache".to_string(),
                ..config("compute", CaptureKind::Other).pointcut
            },
            ..config("compute", CaptureKind::Other)
        };
        let (dispatcher, _) = dispatcher(&[web_transaction(), grouped])?;
        let recording = Arc::new(Recording::default());
        dispatcher.register_handler("recording", recording.clone());

        let mut root = dispatcher.on_before(0, &Invocation::new("com.example.Service", "handle"));
        let call = Invocation::new("com.example.Service", "compute");
        let mut outer = dispatcher.on_before(1, &call);
        assert!(!outer.is_skipped());
        assert!(dispatcher.on_before(1, &call).is_skipped());

        dispatcher.on_throw(1, &mut outer, &Throwable::new("java.lang.RuntimeException", None));
        let again = dispatcher.on_before(1, &call);
        assert!(!again.is_skipped(), "group released at throw");
        dispatcher.on_after(1, again);
        dispatcher.on_after(1, outer);
        dispatcher.on_return(0, &mut root, None);
        assert_eq!(
            *recording.calls.lock(),
            vec!["before compute true", "before compute true", "after true", "after true"]
        );
        Ok(())
    }
}
