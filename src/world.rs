//! Per-loader cache of analyzed classes: hierarchy, methods and the
//! advisors each method picked up when the class was analyzed.
//!
//! Entries are keyed by `(defining loader, class name)` and hold the loader
//! weakly, so classes of a dropped loader disappear on the next prune.
//! Removal bumps an epoch under the write lock; an analysis that started
//! before a removal does not insert its result, which keeps stale advisor
//! bindings from being resurrected by a racing class load.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

use crate::advice::{AdviceCache, Advisor, AdvisorId};
use crate::classfile::descriptor::MethodDescriptor;
use crate::classfile::{
    ACC_INTERFACE, ACC_PRIVATE, ACC_STATIC, ClassFile, annotation_types, internal_to_java_name,
};
use crate::error::ResolutionError;
use crate::loader::{ClassLoader, LoaderId, delegation_chain};
use crate::matcher::{AdviceMatcher, sort_advisors};
use crate::pointcut::{MethodView, TypeView};

const MAX_HIERARCHY_DEPTH: usize = 64;

/// `None` is the bootstrap loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LoaderKey(pub Option<LoaderId>);

impl LoaderKey {
    pub fn of(loader: Option<&Arc<dyn ClassLoader>>) -> Self {
        LoaderKey(loader.map(|l| l.id()))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzedMethod {
    pub name: String,
    pub descriptor: String,
    pub parameter_types: Vec<String>,
    pub return_type: String,
    pub access: u16,
    pub annotations: Vec<String>,
    pub has_code: bool,
    /// Sorted by `(order, declaration index)`.
    pub advisor_ids: Vec<AdvisorId>,
}

impl AnalyzedMethod {
    pub fn view(&self) -> MethodView<'_> {
        MethodView {
            name: &self.name,
            parameter_types: &self.parameter_types,
            return_type: &self.return_type,
            access: self.access,
            annotations: &self.annotations,
        }
    }

    fn overridable(&self) -> bool {
        self.access & (ACC_PRIVATE | ACC_STATIC) == 0 && self.name != "<init>"
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Ancestor {
    pub name: String,
    pub annotations: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzedClass {
    /// Java name.
    pub name: String,
    pub loader: LoaderKey,
    pub access: u16,
    pub super_name: Option<String>,
    pub interface_names: Vec<String>,
    pub annotations: Vec<String>,
    pub methods: Vec<AnalyzedMethod>,
    /// Every resolved or named ancestor, nearest first.
    pub ancestors: Vec<Ancestor>,
    /// Ancestors whose bytes could not be found or parsed.
    pub unresolved: Vec<String>,
    /// Fingerprints of the reweavable advice configs matched by any method.
    pub reweavable_fingerprints: BTreeSet<String>,
    /// Advice cache generation this analysis ran against.
    pub generation: u64,
}

impl AnalyzedClass {
    pub fn is_interface(&self) -> bool {
        self.access & ACC_INTERFACE != 0
    }

    pub fn has_advice(&self) -> bool {
        self.methods.iter().any(|m| !m.advisor_ids.is_empty())
    }

    pub fn has_reweavable_advice(&self) -> bool {
        !self.reweavable_fingerprints.is_empty()
    }

    pub fn method(&self, name: &str, descriptor: &str) -> Option<&AnalyzedMethod> {
        self.methods
            .iter()
            .find(|m| m.name == name && m.descriptor == descriptor)
    }

    pub fn type_view(&self) -> TypeView<'_> {
        TypeView {
            name: &self.name,
            annotations: &self.annotations,
        }
    }
}

#[derive(Debug)]
struct LoaderEntry {
    /// `None` for the bootstrap loader.
    loader: Option<Weak<dyn ClassLoader>>,
    classes: HashMap<String, Arc<AnalyzedClass>>,
}

impl LoaderEntry {
    fn is_alive(&self) -> bool {
        self.loader.as_ref().is_none_or(|w| w.strong_count() > 0)
    }
}

#[derive(Debug)]
pub struct AnalyzedWorld {
    advice_cache: Arc<AdviceCache>,
    bootstrap: Option<Arc<dyn ClassLoader>>,
    entries: RwLock<HashMap<LoaderKey, LoaderEntry>>,
    removal_epoch: AtomicU64,
}

impl AnalyzedWorld {
    /// `bootstrap` serves classes no application loader defines (the JDK).
    pub fn new(advice_cache: Arc<AdviceCache>, bootstrap: Option<Arc<dyn ClassLoader>>) -> Self {
        Self {
            advice_cache,
            bootstrap,
            entries: RwLock::new(HashMap::new()),
            removal_epoch: AtomicU64::new(0),
        }
    }

    pub fn advice_cache(&self) -> &Arc<AdviceCache> {
        &self.advice_cache
    }

    /// Cached analysis, computed on first access. Resolution failures are
    /// logged and reported as `None`.
    pub fn get_analyzed_class(
        &self,
        class_name: &str,
        loader: Option<&Arc<dyn ClassLoader>>,
    ) -> Option<Arc<AnalyzedClass>> {
        let java = internal_to_java_name(class_name);
        match self.resolve(&java, loader, 0, &mut Vec::new()) {
            Ok(class) => Some(class),
            Err(e) => {
                debug!(class = %java, error = %e, "class analysis failed");
                None
            }
        }
    }

    /// Analysis of a class being defined right now by `loader`.
    pub fn analyze_bytes(
        &self,
        class_name: &str,
        bytes: &[u8],
        loader: Option<&Arc<dyn ClassLoader>>,
    ) -> Result<Arc<AnalyzedClass>, ResolutionError> {
        let java = internal_to_java_name(class_name);
        if let Some(cached) = self.cached(&java, LoaderKey::of(loader)) {
            return Ok(cached);
        }
        self.analyze(&java, bytes, loader, 0, &mut Vec::new())
    }

    pub fn cached(&self, class_name: &str, loader: LoaderKey) -> Option<Arc<AnalyzedClass>> {
        let java = internal_to_java_name(class_name);
        self.entries
            .read()
            .get(&loader)
            .filter(|e| e.is_alive())
            .and_then(|e| e.classes.get(&java).cloned())
    }

    /// Every cached analysis of `class_name`, one per defining loader.
    pub fn analyzed_classes(&self, class_name: &str) -> Vec<Arc<AnalyzedClass>> {
        let java = internal_to_java_name(class_name);
        let entries = self.entries.read();
        let mut found: Vec<Arc<AnalyzedClass>> = entries
            .values()
            .filter(|e| e.is_alive())
            .filter_map(|e| e.classes.get(&java).cloned())
            .collect();
        found.sort_by_key(|c| c.loader);
        found
    }

    pub fn len(&self) -> usize {
        self.entries.read().values().map(|e| e.classes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evicts classes so the next analysis sees the current advisors.
    pub fn remove_classes(&self, classes: &[(String, LoaderKey)]) {
        let mut entries = self.entries.write();
        self.removal_epoch.fetch_add(1, Ordering::AcqRel);
        for (name, loader) in classes {
            if let Some(entry) = entries.get_mut(loader) {
                entry.classes.remove(&internal_to_java_name(name));
            }
        }
    }

    /// Classes whose methods picked up reweavable advice, optionally
    /// evicting them in the same critical section.
    pub fn get_classes_with_reweavable_advice(&self, remove: bool) -> Vec<Arc<AnalyzedClass>> {
        let mut entries = self.entries.write();
        if remove {
            self.removal_epoch.fetch_add(1, Ordering::AcqRel);
        }
        let mut found = Vec::new();
        for entry in entries.values_mut() {
            let names: Vec<String> = entry
                .classes
                .values()
                .filter(|c| c.has_reweavable_advice())
                .map(|c| c.name.clone())
                .collect();
            for name in names {
                let class = if remove {
                    entry.classes.remove(&name)
                } else {
                    entry.classes.get(&name).cloned()
                };
                found.extend(class);
            }
        }
        found.sort_by(|a, b| a.name.cmp(&b.name).then(a.loader.cmp(&b.loader)));
        found
    }

    /// Advisor ids bound to any cached method, which is what woven code
    /// calls back with.
    pub fn referenced_advisor_ids(&self) -> HashSet<AdvisorId> {
        self.entries
            .read()
            .values()
            .filter(|e| e.is_alive())
            .flat_map(|e| e.classes.values())
            .flat_map(|c| c.methods.iter())
            .flat_map(|m| m.advisor_ids.iter().copied())
            .collect()
    }

    /// Drops entries of loaders that no longer exist.
    pub fn prune(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.is_alive());
        before - entries.len()
    }

    fn resolve(
        &self,
        java_name: &str,
        loader: Option<&Arc<dyn ClassLoader>>,
        depth: usize,
        visiting: &mut Vec<String>,
    ) -> Result<Arc<AnalyzedClass>, ResolutionError> {
        if depth > MAX_HIERARCHY_DEPTH {
            return Err(ResolutionError::HierarchyTooDeep(java_name.to_string()));
        }
        let mut chain: Vec<Option<Arc<dyn ClassLoader>>> = vec![None];
        if let Some(l) = loader {
            chain.extend(delegation_chain(l).into_iter().map(Some));
        }
        for candidate in &chain {
            if let Some(hit) = self.cached(java_name, LoaderKey::of(candidate.as_ref())) {
                return Ok(hit);
            }
        }
        for candidate in &chain {
            let found = match candidate {
                Some(l) => l.find_class_bytes(java_name),
                None => match &self.bootstrap {
                    Some(b) => b.find_class_bytes(java_name),
                    None => Ok(None),
                },
            };
            let bytes = found.map_err(|e| ResolutionError::Io {
                name: java_name.to_string(),
                message: e.to_string(),
            })?;
            if let Some(bytes) = bytes {
                return self.analyze(java_name, &bytes, candidate.as_ref(), depth, visiting);
            }
        }
        Err(ResolutionError::NotFound(java_name.to_string()))
    }

    fn analyze(
        &self,
        java_name: &str,
        bytes: &[u8],
        loader: Option<&Arc<dyn ClassLoader>>,
        depth: usize,
        visiting: &mut Vec<String>,
    ) -> Result<Arc<AnalyzedClass>, ResolutionError> {
        let epoch = self.removal_epoch.load(Ordering::Acquire);
        let unparseable = |source| ResolutionError::Unparseable {
            name: java_name.to_string(),
            source,
        };
        let class_file = ClassFile::parse(bytes).map_err(unparseable)?;
        let pool = &class_file.constant_pool;
        let super_name = class_file
            .super_name()
            .map_err(unparseable)?
            .map(internal_to_java_name);
        let interface_names: Vec<String> = class_file
            .interface_names()
            .map_err(unparseable)?
            .into_iter()
            .map(internal_to_java_name)
            .collect();
        let annotations = class_file.annotations().map_err(unparseable)?;

        let mut methods = Vec::with_capacity(class_file.methods.len());
        for m in &class_file.methods {
            let name = m.name(pool).map_err(unparseable)?.to_string();
            let descriptor = m.descriptor(pool).map_err(unparseable)?.to_string();
            let parsed = MethodDescriptor::parse(&descriptor).map_err(unparseable)?;
            methods.push(AnalyzedMethod {
                parameter_types: parsed.parameter_java_names(),
                return_type: parsed.return_java_name(),
                access: m.access_flags,
                annotations: annotation_types(&m.attributes, pool).map_err(unparseable)?,
                has_code: m.attribute(pool, "Code").is_some(),
                advisor_ids: Vec::new(),
                name,
                descriptor,
            });
        }

        visiting.push(java_name.to_string());
        let mut ancestors: Vec<Ancestor> = Vec::new();
        let mut resolved: Vec<Arc<AnalyzedClass>> = Vec::new();
        let mut unresolved = Vec::new();
        for parent in super_name.iter().chain(interface_names.iter()) {
            if visiting.contains(parent) {
                continue;
            }
            match self.resolve(parent, loader, depth + 1, visiting) {
                Ok(p) => {
                    push_ancestor(&mut ancestors, &p.name, &p.annotations);
                    for a in &p.ancestors {
                        push_ancestor(&mut ancestors, &a.name, &a.annotations);
                    }
                    unresolved.extend(p.unresolved.iter().cloned());
                    resolved.push(p);
                }
                Err(e) => {
                    debug!(class = %java_name, ancestor = %parent, error = %e, "ancestor unresolved");
                    push_ancestor(&mut ancestors, parent, &[]);
                    unresolved.push(parent.clone());
                }
            }
        }
        visiting.pop();
        unresolved.sort();
        unresolved.dedup();

        let generation = self.advice_cache.generation();
        let matcher = AdviceMatcher::new(self.advice_cache.advisors());
        let class_view = TypeView {
            name: java_name,
            annotations: &annotations,
        };
        let ancestor_views: Vec<TypeView<'_>> = ancestors
            .iter()
            .map(|a| TypeView {
                name: &a.name,
                annotations: &a.annotations,
            })
            .collect();
        let class_advisors = matcher.class_advisors(class_view, &ancestor_views);

        let mut reweavable_fingerprints = BTreeSet::new();
        for method in &mut methods {
            let mut matched =
                AdviceMatcher::method_advisors(&class_advisors, method.view(), method.has_code);
            if method.has_code && method.overridable() {
                matched.extend(self.inherited_advisors(&resolved, method));
                sort_advisors(&mut matched);
            }
            for a in matched.iter().filter(|a| a.reweavable) {
                reweavable_fingerprints.insert(a.fingerprint.clone());
            }
            method.advisor_ids = AdviceMatcher::ids(&matched);
        }
        drop(ancestor_views);

        let analyzed = Arc::new(AnalyzedClass {
            name: java_name.to_string(),
            loader: LoaderKey::of(loader),
            access: class_file.access_flags,
            super_name,
            interface_names,
            annotations,
            methods,
            ancestors,
            unresolved,
            reweavable_fingerprints,
            generation,
        });
        self.insert(loader, analyzed.clone(), epoch);
        Ok(analyzed)
    }

    /// Advisors bound to the overridden method in any resolved ancestor.
    fn inherited_advisors(
        &self,
        resolved: &[Arc<AnalyzedClass>],
        method: &AnalyzedMethod,
    ) -> Vec<Arc<Advisor>> {
        resolved
            .iter()
            .filter_map(|p| p.method(&method.name, &method.descriptor))
            .filter(|m| m.overridable())
            .flat_map(|m| m.advisor_ids.iter())
            .filter_map(|id| self.advice_cache.advisor(*id))
            .collect()
    }

    fn insert(&self, loader: Option<&Arc<dyn ClassLoader>>, class: Arc<AnalyzedClass>, epoch: u64) {
        let mut entries = self.entries.write();
        if self.removal_epoch.load(Ordering::Acquire) != epoch {
            debug!(class = %class.name, "skipping cache insert after concurrent removal");
            return;
        }
        let key = LoaderKey::of(loader);
        let entry = entries.entry(key).or_insert_with(|| LoaderEntry {
            loader: loader.map(Arc::downgrade),
            classes: HashMap::new(),
        });
        entry.classes.insert(class.name.clone(), class);
    }
}

fn push_ancestor(ancestors: &mut Vec<Ancestor>, name: &str, annotations: &[String]) {
    if ancestors.iter().all(|a| a.name != name) {
        ancestors.push(Ancestor {
            name: name.to_string(),
            annotations: annotations.to_vec(),
        });
    }
}
