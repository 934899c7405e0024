//! Advisors: a pointcut bound to a capture kind and the handler shape woven
//! code uses to call it. [`AdviceCache`] owns the active advisor set.

use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::{debug, error, info};

use crate::config::{
    AdviceConfig, CaptureKind, InstrumentationDescriptor, validate_advice_configs,
};
use crate::error::ConfigError;
use crate::invocation::MessageTemplate;
use crate::pointcut::PointcutDescriptor;

pub type AdvisorId = u32;

/// One argument pushed by woven code before calling a bridge handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Binding {
    AdvisorId,
    Receiver,
    MethodName,
    ClassName,
    MethodArgs,
    Traveler,
    ReturnValue,
    Throwable,
}

impl Binding {
    pub fn descriptor(self) -> &'static str {
        match self {
            Binding::AdvisorId => "I",
            Binding::Receiver | Binding::Traveler | Binding::ReturnValue => "Ljava/lang/Object;",
            Binding::MethodName | Binding::ClassName => "Ljava/lang/String;",
            Binding::MethodArgs => "[Ljava/lang/Object;",
            Binding::Throwable => "Ljava/lang/Throwable;",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerShape {
    pub bindings: Vec<Binding>,
    /// The handler returns an `Object`: the traveler for before-handlers, a
    /// replacement return value for return-handlers.
    pub returns_value: bool,
}

impl HandlerShape {
    fn new(bindings: Vec<Binding>, returns_value: bool) -> Self {
        Self {
            bindings,
            returns_value,
        }
    }

    pub fn descriptor(&self) -> String {
        let mut d = String::from("(");
        for b in &self.bindings {
            d.push_str(b.descriptor());
        }
        d.push(')');
        d.push_str(if self.returns_value {
            "Ljava/lang/Object;"
        } else {
            "V"
        });
        d
    }

    pub fn binds(&self, binding: Binding) -> bool {
        self.bindings.contains(&binding)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AdviceShape {
    pub before: Option<HandlerShape>,
    pub on_return: Option<HandlerShape>,
    pub on_throw: Option<HandlerShape>,
    pub on_after: Option<HandlerShape>,
}

impl AdviceShape {
    fn for_config(config: &AdviceConfig, targets_constructor: bool) -> Self {
        use Binding::*;
        match config.capture_kind {
            CaptureKind::Other => Self {
                before: (!targets_constructor).then(|| {
                    HandlerShape::new(vec![AdvisorId, Receiver, MethodName, ClassName, MethodArgs], true)
                }),
                on_return: Some(HandlerShape::new(vec![AdvisorId, Traveler, ReturnValue], true)),
                on_throw: (!targets_constructor)
                    .then(|| HandlerShape::new(vec![AdvisorId, Traveler, Throwable], false)),
                on_after: Some(HandlerShape::new(vec![AdvisorId, Traveler], false)),
            },
            kind => {
                let templates = templates(config, kind);
                let mut before = vec![AdvisorId];
                if templates.iter().any(MessageTemplate::uses_receiver) {
                    before.push(Receiver);
                }
                if templates.iter().any(MessageTemplate::uses_method_name) {
                    before.push(MethodName);
                }
                if templates.iter().any(MessageTemplate::uses_class_name) {
                    before.push(ClassName);
                }
                if templates.iter().any(MessageTemplate::uses_args) {
                    before.push(MethodArgs);
                }
                let mut on_return = vec![AdvisorId, Traveler];
                if templates.iter().any(MessageTemplate::uses_return_value) {
                    on_return.push(ReturnValue);
                }
                Self {
                    before: Some(HandlerShape::new(before, true)),
                    on_return: Some(HandlerShape::new(on_return, false)),
                    on_throw: Some(HandlerShape::new(vec![AdvisorId, Traveler, Throwable], false)),
                    on_after: None,
                }
            }
        }
    }

    pub fn has_traveler(&self) -> bool {
        self.before.as_ref().is_some_and(|b| b.returns_value)
    }

    pub fn needs_return_value(&self) -> bool {
        self.on_return
            .as_ref()
            .is_some_and(|r| r.binds(Binding::ReturnValue) || r.returns_value)
    }
}

fn templates(config: &AdviceConfig, kind: CaptureKind) -> Vec<MessageTemplate> {
    let mut sources: Vec<&str> = Vec::new();
    match kind {
        CaptureKind::Transaction => {
            sources.push(&config.transaction_name_template);
            sources.push(&config.transaction_user_template);
            sources.extend(config.transaction_attribute_templates.values().map(String::as_str));
            sources.push(&config.trace_entry_message_template);
        }
        CaptureKind::TraceEntry => sources.push(&config.trace_entry_message_template),
        CaptureKind::Timer | CaptureKind::Other => {}
    }
    sources
        .into_iter()
        .filter(|s| !s.is_empty())
        .map(MessageTemplate::parse)
        .collect()
}

#[derive(Debug, Clone)]
pub struct Advisor {
    pub id: AdvisorId,
    pub config: AdviceConfig,
    pub pointcut: PointcutDescriptor,
    pub shape: AdviceShape,
    /// Position across all configured advice; ties on `order` keep it.
    pub declaration_index: usize,
    /// Reweavable advisors come from user configuration; instrumentation
    /// descriptors are fixed for the life of the process.
    pub reweavable: bool,
    pub fingerprint: String,
    /// Instrumentation id, or empty for user configuration.
    pub source: String,
}

impl Advisor {
    pub fn build(
        id: AdvisorId,
        config: &AdviceConfig,
        declaration_index: usize,
        reweavable: bool,
        source: &str,
    ) -> Result<Self, ConfigError> {
        let pointcut = PointcutDescriptor::try_from(config.pointcut.clone())?;
        let shape = AdviceShape::for_config(config, pointcut.targets_constructor());
        Ok(Self {
            id,
            config: config.clone(),
            shape,
            pointcut,
            declaration_index,
            reweavable,
            fingerprint: config.fingerprint(),
            source: source.to_string(),
        })
    }

    pub fn capture_kind(&self) -> CaptureKind {
        self.config.capture_kind
    }

    /// The explicit nesting group, or an implicit per-advisor group for trace
    /// entries that must not capture themselves when nested.
    pub fn effective_nesting_group(&self) -> Option<String> {
        if let Some(g) = self.pointcut.nesting_group() {
            return Some(g.to_string());
        }
        (self.config.capture_kind == CaptureKind::TraceEntry && !self.config.trace_entry_capture_self_nested)
            .then(|| format!("__advisor_{}", self.id))
    }

    pub fn sort_key(&self) -> (i32, usize) {
        (self.pointcut.order(), self.declaration_index)
    }
}

/// The active advisor set. Reweavable advisors are swapped as a whole on
/// [`AdviceCache::update_advisors`]; an unchanged config keeps its advisor
/// id. Retired advisors stay resolvable by id until
/// [`AdviceCache::retire_unreferenced`] finds no woven code using them.
#[derive(Debug)]
pub struct AdviceCache {
    next_id: AtomicU32,
    non_reweavable: Vec<Arc<Advisor>>,
    reweavable: RwLock<Arc<Vec<Arc<Advisor>>>>,
    by_id: RwLock<HashMap<AdvisorId, Arc<Advisor>>>,
    generation: AtomicU64,
}

impl AdviceCache {
    pub fn new(
        descriptors: &[InstrumentationDescriptor],
        configs: &[AdviceConfig],
    ) -> Result<Self, ConfigError> {
        crate::config::validate_descriptors(descriptors)?;
        let cache = Self {
            next_id: AtomicU32::new(0),
            non_reweavable: Vec::new(),
            reweavable: RwLock::new(Arc::new(Vec::new())),
            by_id: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
        };
        let mut non_reweavable = Vec::new();
        for d in descriptors {
            for config in &d.advice {
                let advisor = Advisor::build(cache.allocate_id(), config, non_reweavable.len(), false, &d.id)?;
                non_reweavable.push(Arc::new(advisor));
            }
        }
        let cache = Self {
            non_reweavable,
            ..cache
        };
        {
            let mut by_id = cache.by_id.write();
            for a in &cache.non_reweavable {
                by_id.insert(a.id, a.clone());
            }
        }
        cache.update_advisors(configs)?;
        Ok(cache)
    }

    fn allocate_id(&self) -> AdvisorId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Validates every config first; on any failure nothing is swapped.
    pub fn update_advisors(&self, configs: &[AdviceConfig]) -> Result<(), ConfigError> {
        if let Err(e) = validate_advice_configs(configs) {
            error!(error = %e, "rejecting advice configuration");
            return Err(e);
        }
        let offset = self.non_reweavable.len();
        let mut previous: HashMap<String, Vec<Arc<Advisor>>> = HashMap::new();
        for a in self.reweavable.read().iter().rev() {
            previous.entry(a.fingerprint.clone()).or_default().push(a.clone());
        }
        let mut built = Vec::with_capacity(configs.len());
        for (i, config) in configs.iter().enumerate() {
            let declaration_index = offset + i;
            let kept = previous.get_mut(&config.fingerprint()).and_then(Vec::pop);
            let advisor = match kept {
                Some(a) if a.declaration_index == declaration_index => a,
                Some(a) => Arc::new(Advisor::build(a.id, config, declaration_index, true, "")?),
                None => Arc::new(Advisor::build(self.allocate_id(), config, declaration_index, true, "")?),
            };
            built.push(advisor);
        }
        {
            let mut by_id = self.by_id.write();
            for a in &built {
                by_id.insert(a.id, a.clone());
            }
        }
        *self.reweavable.write() = Arc::new(built);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        info!(generation, advisors = configs.len(), "advice configuration applied");
        Ok(())
    }

    /// Instrumentation advisors followed by the current reweavable set.
    pub fn advisors(&self) -> Vec<Arc<Advisor>> {
        let reweavable = self.reweavable.read().clone();
        self.non_reweavable
            .iter()
            .chain(reweavable.iter())
            .cloned()
            .collect()
    }

    pub fn reweavable_advisors(&self) -> Arc<Vec<Arc<Advisor>>> {
        self.reweavable.read().clone()
    }

    pub fn advisor(&self, id: AdvisorId) -> Option<Arc<Advisor>> {
        self.by_id.read().get(&id).cloned()
    }

    /// Advisors resolvable by id, retired ones included.
    pub fn advisor_count(&self) -> usize {
        self.by_id.read().len()
    }

    /// Forgets retired advisors no id in `referenced` points at. Returns how
    /// many were dropped.
    pub fn retire_unreferenced(&self, referenced: &HashSet<AdvisorId>) -> usize {
        let current: HashSet<AdvisorId> = self.advisors().iter().map(|a| a.id).collect();
        let mut by_id = self.by_id.write();
        let before = by_id.len();
        by_id.retain(|id, _| current.contains(id) || referenced.contains(id));
        let retired = before - by_id.len();
        if retired > 0 {
            debug!(retired, "dropped unreferenced advisors");
        }
        retired
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Whether `configs` differ from what the currently woven code reflects.
    pub fn is_out_of_sync(&self, configs: &[AdviceConfig]) -> bool {
        let current: BTreeSet<String> = self
            .reweavable
            .read()
            .iter()
            .map(|a| a.fingerprint.clone())
            .collect();
        let wanted: BTreeSet<String> = configs.iter().map(AdviceConfig::fingerprint).collect();
        current != wanted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pointcut::PointcutSpec;

    fn config(method: &str, kind: CaptureKind) -> AdviceConfig {
        AdviceConfig {
            pointcut: PointcutSpec {
                class_name: "com.example.Foo".to_string(),
                method_name: method.to_string(),
                timer_name: "t".to_string(),
                ..PointcutSpec::default()
            },
            capture_kind: kind,
            trace_entry_message_template: "{{methodName}} {{0}} => {{_}}".to_string(),
            handler: "h".to_string(),
            ..AdviceConfig::default()
        }
    }

    #[test]
    fn shapes_bind_only_what_templates_reference() {
        let timer = Advisor::build(0, &config("bar", CaptureKind::Timer), 0, true, "").expect("advisor");
        let before = timer.shape.before.as_ref().expect("before");
        assert_eq!(before.bindings, vec![Binding::AdvisorId]);
        assert_eq!(before.descriptor(), "(I)Ljava/lang/Object;");
        assert!(!timer.shape.needs_return_value());

        let entry = Advisor::build(1, &config("bar", CaptureKind::TraceEntry), 0, true, "").expect("advisor");
        let before = entry.shape.before.as_ref().expect("before");
        assert_eq!(
            before.bindings,
            vec![Binding::AdvisorId, Binding::MethodName, Binding::MethodArgs]
        );
        assert!(entry.shape.needs_return_value());
        assert_eq!(
            entry.shape.on_throw.as_ref().map(HandlerShape::descriptor).as_deref(),
            Some("(ILjava/lang/Object;Ljava/lang/Throwable;)V")
        );
        assert_eq!(entry.effective_nesting_group().as_deref(), Some("__advisor_1"));
    }

    #[test]
    fn constructor_advice_has_no_before_handler() {
        let ctor = Advisor::build(0, &config("<init>", CaptureKind::Other), 0, true, "").expect("advisor");
        assert!(ctor.shape.before.is_none());
        assert!(!ctor.shape.has_traveler());
        assert!(ctor.shape.on_return.as_ref().is_some_and(|r| r.returns_value));
    }

    #[test]
    fn update_is_all_or_nothing_and_tracks_sync_state() -> Result<(), ConfigError> {
        let good = vec![config("bar", CaptureKind::Timer)];
        let cache = AdviceCache::new(&[], &good)?;
        assert_eq!(cache.generation(), 1);
        let first_id = cache.advisors()[0].id;
        assert!(!cache.is_out_of_sync(&good));

        let mut bad = good.clone();
        bad.push(config("", CaptureKind::Timer));
        assert!(matches!(
            cache.update_advisors(&bad),
            Err(ConfigError::InvalidAdvice { index: 1, .. })
        ));
        assert_eq!(cache.generation(), 1);
        assert_eq!(cache.advisors().len(), 1);

        let changed = vec![config("baz", CaptureKind::Timer)];
        assert!(cache.is_out_of_sync(&changed));
        cache.update_advisors(&changed)?;
        assert!(!cache.is_out_of_sync(&changed));
        assert_eq!(cache.advisors()[0].pointcut.spec().method_name, "baz");
        // retired advisors still resolve for already-woven code
        assert!(cache.advisor(first_id).is_some());
        Ok(())
    }

    #[test]
    fn instrumentation_advisors_precede_user_advisors() -> Result<(), ConfigError> {
        let descriptor = InstrumentationDescriptor {
            id: "plugin".to_string(),
            name: "Plugin".to_string(),
            properties: Vec::new(),
            advice: vec![config("bar", CaptureKind::Timer)],
        };
        let cache = AdviceCache::new(&[descriptor], &[config("baz", CaptureKind::Timer)])?;
        let advisors = cache.advisors();
        assert_eq!(advisors.len(), 2);
        assert!(!advisors[0].reweavable && advisors[0].source == "plugin");
        assert!(advisors[1].reweavable);
        assert_eq!(advisors[1].declaration_index, 1);
        assert_eq!(cache.reweavable_advisors().len(), 1);
        Ok(())
    }

    #[test]
    fn reapplying_the_same_configs_keeps_advisor_ids() -> Result<(), ConfigError> {
        let configs = vec![config("bar", CaptureKind::Timer), config("baz", CaptureKind::TraceEntry)];
        let cache = AdviceCache::new(&[], &configs)?;
        let ids: Vec<AdvisorId> = cache.advisors().iter().map(|a| a.id).collect();
        for _ in 0..10 {
            cache.update_advisors(&configs)?;
        }
        assert_eq!(cache.advisor_count(), 2);
        assert_eq!(cache.advisors().iter().map(|a| a.id).collect::<Vec<_>>(), ids);

        // reordering keeps ids but takes the new declaration order
        let reordered = vec![configs[1].clone(), configs[0].clone()];
        cache.update_advisors(&reordered)?;
        let advisors = cache.advisors();
        assert_eq!(advisors.iter().map(|a| a.id).collect::<Vec<_>>(), vec![ids[1], ids[0]]);
        assert_eq!(advisors[0].declaration_index, 0);
        assert_eq!(cache.advisor_count(), 2);
        Ok(())
    }

    #[test]
    fn retired_advisors_are_dropped_once_unreferenced() -> Result<(), ConfigError> {
        let cache = AdviceCache::new(&[], &[config("bar", CaptureKind::Timer)])?;
        let old = cache.advisors()[0].id;
        cache.update_advisors(&[config("baz", CaptureKind::Timer)])?;
        assert_eq!(cache.advisor_count(), 2);

        assert_eq!(cache.retire_unreferenced(&HashSet::from([old])), 0);
        assert!(cache.advisor(old).is_some());
        assert_eq!(cache.retire_unreferenced(&HashSet::new()), 1);
        assert!(cache.advisor(old).is_none());
        assert_eq!(cache.advisor_count(), 1);
        Ok(())
    }
}
