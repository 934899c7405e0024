//! Retransforming already-loaded classes after the advice configuration
//! changes, and the JVM instrumentation boundary it drives.

use anyhow::{Context, Result, bail};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::advice::AdviceCache;
use crate::classfile::{ClassFile, internal_to_java_name};
use crate::config::{AdviceConfig, AgentConfig};
use crate::loader::ClassLoader;
use crate::pointcut::{LoadedTypeView, PointcutClassName};
use crate::weaver::ClassFileTransformer;
use crate::world::{AnalyzedWorld, LoaderKey};

/// A class the JVM has defined.
#[derive(Clone)]
pub struct LoadedClass {
    /// Java name.
    pub name: String,
    pub loader: Option<Arc<dyn ClassLoader>>,
    pub super_name: Option<String>,
    pub interface_names: Vec<String>,
    pub annotations: Vec<String>,
}

impl fmt::Debug for LoadedClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedClass")
            .field("name", &self.name)
            .field("loader", &self.loader_key())
            .finish()
    }
}

impl LoadedClass {
    pub fn from_bytes(loader: Option<Arc<dyn ClassLoader>>, bytes: &[u8]) -> Result<Self> {
        let class = ClassFile::parse(bytes)?;
        Ok(Self {
            name: internal_to_java_name(class.name()?),
            super_name: class.super_name()?.map(internal_to_java_name),
            interface_names: class
                .interface_names()?
                .into_iter()
                .map(internal_to_java_name)
                .collect(),
            annotations: class.annotations()?,
            loader,
        })
    }

    pub fn loader_key(&self) -> LoaderKey {
        LoaderKey::of(self.loader.as_ref())
    }

    pub fn key(&self) -> (String, LoaderKey) {
        (self.name.clone(), self.loader_key())
    }

    fn view(&self) -> LoadedTypeView<'_> {
        LoadedTypeView {
            name: &self.name,
            annotations: &self.annotations,
        }
    }
}

/// What the agent needs from the JVM's instrumentation interface.
pub trait Instrumentation: Send + Sync + fmt::Debug {
    fn is_retransform_classes_supported(&self) -> bool;

    fn all_loaded_classes(&self) -> Vec<LoadedClass>;

    fn is_modifiable_class(&self, class: &LoadedClass) -> bool;

    /// Runs the installed transformer again over each class's original bytes.
    fn retransform_classes(&self, classes: &[LoadedClass]) -> Result<()>;
}

/// Loaded classes matched by any selector, directly or through a loaded
/// ancestor, that the JVM allows to be retransformed. Agent classes are
/// never included.
pub fn get_existing_modifiable_sub_classes(
    selectors: &[PointcutClassName],
    loaded: &[LoadedClass],
    instrumentation: &dyn Instrumentation,
    config: &AgentConfig,
) -> Vec<LoadedClass> {
    if selectors.is_empty() {
        return Vec::new();
    }
    let mut by_name: HashMap<&str, Vec<&LoadedClass>> = HashMap::new();
    for class in loaded {
        by_name.entry(class.name.as_str()).or_default().push(class);
    }
    let mut matching = Vec::new();
    for class in loaded {
        if config.is_agent_internal(&class.name) || !instrumentation.is_modifiable_class(class) {
            continue;
        }
        let ancestors = loaded_ancestors(class, &by_name);
        let views: Vec<LoadedTypeView<'_>> = ancestors.iter().map(|a| a.view()).collect();
        if selectors.iter().any(|s| s.applies_to(class.view(), &views)) {
            matching.push(class.clone());
        }
    }
    matching.sort_by(|a, b| a.name.cmp(&b.name).then(a.loader_key().cmp(&b.loader_key())));
    matching
}

/// Loaded ancestors of `class`, nearest first. A name defined by several
/// loaders resolves to the one in `class`'s delegation chain.
fn loaded_ancestors<'a>(class: &LoadedClass, by_name: &HashMap<&str, Vec<&'a LoadedClass>>) -> Vec<&'a LoadedClass> {
    let visible: HashSet<LoaderKey> = match &class.loader {
        Some(l) => crate::loader::delegation_chain(l)
            .iter()
            .map(|l| LoaderKey::of(Some(l)))
            .chain(std::iter::once(LoaderKey(None)))
            .collect(),
        None => HashSet::from([LoaderKey(None)]),
    };
    let mut found: Vec<&'a LoadedClass> = Vec::new();
    let mut queue: VecDeque<String> = class
        .super_name
        .iter()
        .chain(class.interface_names.iter())
        .cloned()
        .collect();
    let mut seen = HashSet::new();
    while let Some(name) = queue.pop_front() {
        if !seen.insert(name.clone()) {
            continue;
        }
        let Some(candidates) = by_name.get(name.as_str()) else {
            continue;
        };
        let pick = candidates
            .iter()
            .find(|c| visible.contains(&c.loader_key()))
            .or_else(|| candidates.first());
        if let Some(ancestor) = pick {
            queue.extend(ancestor.super_name.iter().cloned());
            queue.extend(ancestor.interface_names.iter().cloned());
            found.push(*ancestor);
        }
    }
    found
}

/// Where the current user advice configuration comes from.
pub trait AdviceConfigSource: Send + Sync + fmt::Debug {
    fn advice_configs(&self) -> Result<Vec<AdviceConfig>>;
}

#[derive(Debug, Default)]
pub struct StaticConfigSource {
    configs: RwLock<Vec<AdviceConfig>>,
}

impl StaticConfigSource {
    pub fn new(configs: Vec<AdviceConfig>) -> Self {
        Self {
            configs: RwLock::new(configs),
        }
    }

    pub fn set(&self, configs: Vec<AdviceConfig>) {
        *self.configs.write() = configs;
    }
}

impl AdviceConfigSource for StaticConfigSource {
    fn advice_configs(&self) -> Result<Vec<AdviceConfig>> {
        Ok(self.configs.read().clone())
    }
}

/// A JSON array of advice configs, re-read on every call. A missing file
/// means no user advice.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl AdviceConfigSource for FileConfigSource {
    fn advice_configs(&self) -> Result<Vec<AdviceConfig>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read advice config: {}", self.path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse advice config: {}", self.path.display()))
    }
}

/// Applies `configs` and retransforms every loaded class whose reweavable
/// advice may have changed. Returns how many classes ended up with a
/// different set of reweavable advice; 0 when the JVM cannot retransform or
/// `configs` are the ones already applied, in which case nothing is
/// retransformed.
pub fn reweave(
    world: &AnalyzedWorld,
    instrumentation: &dyn Instrumentation,
    configs: &[AdviceConfig],
    config: &AgentConfig,
) -> Result<usize> {
    if !instrumentation.is_retransform_classes_supported() {
        debug!("retransform not supported, skipping reweave");
        return Ok(0);
    }
    let advice_cache = world.advice_cache();
    let applied: Vec<String> = advice_cache
        .reweavable_advisors()
        .iter()
        .map(|a| a.fingerprint.clone())
        .collect();
    let wanted: Vec<String> = configs.iter().map(AdviceConfig::fingerprint).collect();
    if applied == wanted {
        debug!("advice configuration unchanged, skipping reweave");
        return Ok(0);
    }
    advice_cache.update_advisors(configs)?;
    let selectors: Vec<PointcutClassName> = advice_cache
        .reweavable_advisors()
        .iter()
        .filter_map(|a| a.pointcut.class_selector())
        .collect();
    let loaded = instrumentation.all_loaded_classes();
    let possible_new = get_existing_modifiable_sub_classes(&selectors, &loaded, instrumentation, config);

    let mut before: HashMap<(String, LoaderKey), BTreeSet<String>> = HashMap::new();
    for class in &possible_new {
        let fingerprints = world
            .cached(&class.name, class.loader_key())
            .map(|c| c.reweavable_fingerprints.clone())
            .unwrap_or_default();
        before.insert(class.key(), fingerprints);
    }
    // evict both sets before retransforming so subclasses cannot inherit
    // advisors from a stale parent analysis
    for existing in world.get_classes_with_reweavable_advice(true) {
        before.insert((existing.name.clone(), existing.loader), existing.reweavable_fingerprints.clone());
    }
    let possible_keys: Vec<(String, LoaderKey)> = possible_new.iter().map(LoadedClass::key).collect();
    world.remove_classes(&possible_keys);

    let targets: Vec<LoadedClass> = loaded
        .into_iter()
        .filter(|c| before.contains_key(&c.key()))
        .collect();
    if targets.is_empty() {
        advice_cache.retire_unreferenced(&world.referenced_advisor_ids());
        return Ok(0);
    }
    instrumentation.retransform_classes(&targets)?;
    advice_cache.retire_unreferenced(&world.referenced_advisor_ids());

    let changed = targets
        .iter()
        .filter(|c| {
            let after = world
                .cached(&c.name, c.loader_key())
                .map(|a| a.reweavable_fingerprints.clone())
                .unwrap_or_default();
            before.get(&c.key()) != Some(&after)
        })
        .count();
    info!(retransformed = targets.len(), changed, "reweave complete");
    Ok(changed)
}

impl AdviceCache {
    /// Retransforms classes loaded before the agent's transformer was
    /// installed that any advisor targets. Returns how many were
    /// retransformed.
    pub fn initial_reweave(
        &self,
        loaded: &[LoadedClass],
        instrumentation: &dyn Instrumentation,
        config: &AgentConfig,
    ) -> Result<usize> {
        if !instrumentation.is_retransform_classes_supported() {
            return Ok(0);
        }
        let selectors: Vec<PointcutClassName> = self
            .advisors()
            .iter()
            .filter_map(|a| a.pointcut.class_selector())
            .collect();
        let classes = get_existing_modifiable_sub_classes(&selectors, loaded, instrumentation, config);
        if classes.is_empty() {
            return Ok(0);
        }
        instrumentation.retransform_classes(&classes)?;
        Ok(classes.len())
    }
}

#[derive(Debug)]
struct DefinedClass {
    loaded: LoadedClass,
    original: Vec<u8>,
    current: Vec<u8>,
    retransforms: usize,
}

/// An in-process stand-in for the JVM side of instrumentation: defines
/// classes through the installed transformer and replays it on retransform.
#[derive(Debug)]
pub struct SimulatedInstrumentation {
    retransform_supported: bool,
    transformer: RwLock<Option<ClassFileTransformer>>,
    classes: RwLock<Vec<DefinedClass>>,
}

impl SimulatedInstrumentation {
    pub fn new(retransform_supported: bool) -> Self {
        Self {
            retransform_supported,
            transformer: RwLock::new(None),
            classes: RwLock::new(Vec::new()),
        }
    }

    pub fn install_transformer(&self, transformer: ClassFileTransformer) {
        *self.transformer.write() = Some(transformer);
    }

    fn run_transformer(&self, loader: Option<&Arc<dyn ClassLoader>>, internal_name: &str, bytes: &[u8]) -> Vec<u8> {
        self.transformer
            .read()
            .as_ref()
            .and_then(|t| t.transform(loader, internal_name, bytes))
            .unwrap_or_else(|| bytes.to_vec())
    }

    /// Defines `class_name` from `loader`'s bytes, weaving it if a
    /// transformer is installed.
    pub fn load_class(&self, loader: &Arc<dyn ClassLoader>, class_name: &str) -> Result<LoadedClass> {
        let java = internal_to_java_name(class_name);
        let key = (java.clone(), LoaderKey::of(Some(loader)));
        if let Some(existing) = self.classes.read().iter().find(|c| c.loaded.key() == key) {
            return Ok(existing.loaded.clone());
        }
        let Some(original) = loader.find_class_bytes(&java)? else {
            bail!("class not found: {java} in {}", loader.name());
        };
        let loaded = LoadedClass::from_bytes(Some(loader.clone()), &original)?;
        let current = self.run_transformer(Some(loader), &crate::classfile::java_to_internal_name(&java), &original);
        self.classes.write().push(DefinedClass {
            loaded: loaded.clone(),
            original,
            current,
            retransforms: 0,
        });
        Ok(loaded)
    }

    /// Bytes currently defined for the class.
    pub fn class_bytes(&self, class_name: &str, loader: &Arc<dyn ClassLoader>) -> Option<Vec<u8>> {
        let key = (internal_to_java_name(class_name), LoaderKey::of(Some(loader)));
        self.classes
            .read()
            .iter()
            .find(|c| c.loaded.key() == key)
            .map(|c| c.current.clone())
    }

    pub fn retransform_count(&self, class_name: &str) -> usize {
        let java = internal_to_java_name(class_name);
        self.classes
            .read()
            .iter()
            .filter(|c| c.loaded.name == java)
            .map(|c| c.retransforms)
            .sum()
    }
}

impl Instrumentation for SimulatedInstrumentation {
    fn is_retransform_classes_supported(&self) -> bool {
        self.retransform_supported
    }

    fn all_loaded_classes(&self) -> Vec<LoadedClass> {
        self.classes.read().iter().map(|c| c.loaded.clone()).collect()
    }

    fn is_modifiable_class(&self, class: &LoadedClass) -> bool {
        !class.name.starts_with("java.lang.") && !class.name.ends_with("[]")
    }

    fn retransform_classes(&self, classes: &[LoadedClass]) -> Result<()> {
        if !self.retransform_supported {
            bail!("retransformClasses is not supported");
        }
        let wanted: HashSet<(String, LoaderKey)> = classes.iter().map(LoadedClass::key).collect();
        let pending: Vec<(LoadedClass, Vec<u8>)> = self
            .classes
            .read()
            .iter()
            .filter(|c| wanted.contains(&c.loaded.key()))
            .map(|c| (c.loaded.clone(), c.original.clone()))
            .collect();
        for (class, original) in pending {
            let internal = crate::classfile::java_to_internal_name(&class.name);
            let current = self.run_transformer(class.loader.as_ref(), &internal, &original);
            let mut defined = self.classes.write();
            if let Some(entry) = defined.iter_mut().find(|c| c.loaded.key() == class.key()) {
                entry.current = current;
                entry.retransforms += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::builder::ClassBuilder;
    use crate::classfile::{ACC_ABSTRACT, ACC_INTERFACE, ACC_PUBLIC};
    use crate::loader::MapClassLoader;
    use crate::pointcut::PointcutSpec;

    fn timer(class_name: &str, method: &str) -> AdviceConfig {
        AdviceConfig {
            pointcut: PointcutSpec {
                class_name: class_name.to_string(),
                method_name: method.to_string(),
                timer_name: "t".to_string(),
                ..PointcutSpec::default()
            },
            ..AdviceConfig::default()
        }
    }

    fn class(name: &str, super_name: &str, interfaces: &[&str]) -> anyhow::Result<Vec<u8>> {
        let mut builder = ClassBuilder::new(name, super_name);
        for i in interfaces {
            builder = builder.interface(i);
        }
        builder = builder.method(ACC_PUBLIC, "run", "()V", 0, 1, vec![0xb1]);
        Ok(builder.build()?)
    }

    fn setup() -> anyhow::Result<(Arc<AnalyzedWorld>, Arc<SimulatedInstrumentation>, Arc<dyn ClassLoader>)> {
        let task = ClassBuilder::new("com/example/Task", "java/lang/Object")
            .access(ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT)
            .abstract_method(ACC_PUBLIC | ACC_ABSTRACT, "run", "()V")
            .build()?;
        let loader = MapClassLoader::new("app", None)
            .with_class("com/example/Task", task)
            .with_class("com/example/Foo", class("com/example/Foo", "java/lang/Object", &["com/example/Task"])?)
            .with_class("com/example/Bar", class("com/example/Bar", "com/example/Foo", &[])?)
            .with_class("com/example/Other", class("com/example/Other", "java/lang/Object", &[])?)
            .with_class("org/xyzzy/agent/Internal", class("org/xyzzy/agent/Internal", "java/lang/Object", &["com/example/Task"])?)
            .into_arc();
        let cache = Arc::new(AdviceCache::new(&[], &[])?);
        let world = Arc::new(AnalyzedWorld::new(cache, None));
        let jvm = Arc::new(SimulatedInstrumentation::new(true));
        jvm.install_transformer(ClassFileTransformer::new(world.clone(), Arc::new(AgentConfig::default())));
        for name in ["com/example/Task", "com/example/Foo", "com/example/Bar", "com/example/Other", "org/xyzzy/agent/Internal"] {
            jvm.load_class(&loader, name)?;
        }
        Ok((world, jvm, loader))
    }

    #[test]
    fn sub_classes_of_matching_types_are_selected() -> anyhow::Result<()> {
        let (_, jvm, _) = setup()?;
        let selectors: Vec<_> = [timer("com.example.Task", "run")]
            .iter()
            .filter_map(|c| crate::pointcut::PointcutDescriptor::try_from(c.pointcut.clone()).ok())
            .filter_map(|p| p.class_selector())
            .collect();
        let found = get_existing_modifiable_sub_classes(
            &selectors,
            &jvm.all_loaded_classes(),
            jvm.as_ref(),
            &AgentConfig::default(),
        );
        let names: Vec<_> = found.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["com.example.Bar", "com.example.Foo", "com.example.Task"]);
        Ok(())
    }

    #[test]
    fn reweave_counts_changes_and_is_idempotent() -> anyhow::Result<()> {
        let (world, jvm, loader) = setup()?;
        let config = AgentConfig::default();
        let before = jvm.class_bytes("com/example/Foo", &loader);

        let configs = vec![timer("com.example.Foo", "run")];
        assert_eq!(reweave(&world, jvm.as_ref(), &configs, &config)?, 2, "Foo and its subclass Bar");
        assert_ne!(jvm.class_bytes("com/example/Foo", &loader), before);
        assert!(!world.advice_cache().is_out_of_sync(&configs));
        assert_eq!(reweave(&world, jvm.as_ref(), &configs, &config)?, 0);
        assert_eq!(jvm.retransform_count("com.example.Foo"), 1, "unchanged configs retransform nothing");

        assert_eq!(reweave(&world, jvm.as_ref(), &[], &config)?, 2);
        assert_eq!(jvm.class_bytes("com/example/Foo", &loader), before);
        assert_eq!(jvm.retransform_count("com.example.Foo"), 2);
        assert_eq!(jvm.retransform_count("com.example.Other"), 0);
        Ok(())
    }

    #[test]
    fn reweaving_drops_advisors_no_class_uses() -> anyhow::Result<()> {
        let (world, jvm, _) = setup()?;
        let config = AgentConfig::default();
        let cache = world.advice_cache().clone();
        for round in 0..6 {
            let target = if round % 2 == 0 { "com.example.Foo" } else { "com.example.Other" };
            reweave(&world, jvm.as_ref(), &[timer(target, "run")], &config)?;
            assert_eq!(cache.advisor_count(), 1, "round {round}");
            let id = cache.advisors()[0].id;
            assert!(world.referenced_advisor_ids().contains(&id));
        }
        reweave(&world, jvm.as_ref(), &[], &config)?;
        assert_eq!(cache.advisor_count(), 0);
        Ok(())
    }

    #[test]
    fn initial_reweave_weaves_classes_loaded_before_the_transformer() -> anyhow::Result<()> {
        let loader = MapClassLoader::new("app", None)
            .with_class("com/example/Foo", class("com/example/Foo", "java/lang/Object", &[])?)
            .with_class("com/example/Other", class("com/example/Other", "java/lang/Object", &[])?)
            .into_arc();
        let jvm = SimulatedInstrumentation::new(true);
        for name in ["com/example/Foo", "com/example/Other"] {
            jvm.load_class(&loader, name)?;
        }
        let unwoven = jvm.class_bytes("com/example/Foo", &loader);

        let cache = Arc::new(AdviceCache::new(&[], &[timer("com.example.Foo", "run")])?);
        let world = Arc::new(AnalyzedWorld::new(cache.clone(), None));
        let config = AgentConfig::default();
        jvm.install_transformer(ClassFileTransformer::new(world, Arc::new(config.clone())));
        let count = cache.initial_reweave(&jvm.all_loaded_classes(), &jvm, &config)?;

        assert_eq!(count, 1);
        assert_eq!(jvm.retransform_count("com.example.Foo"), 1);
        assert_eq!(jvm.retransform_count("com.example.Other"), 0);
        assert_ne!(jvm.class_bytes("com/example/Foo", &loader), unwoven);
        Ok(())
    }

    #[test]
    fn reweave_without_retransform_support_is_a_no_op() -> anyhow::Result<()> {
        let cache = Arc::new(AdviceCache::new(&[], &[])?);
        let world = AnalyzedWorld::new(cache, None);
        let jvm = SimulatedInstrumentation::new(false);
        let configs = vec![timer("com.example.Foo", "run")];
        assert_eq!(reweave(&world, &jvm, &configs, &AgentConfig::default())?, 0);
        assert!(world.advice_cache().is_out_of_sync(&configs));
        Ok(())
    }

    #[test]
    fn file_source_reads_a_json_array() -> anyhow::Result<()> {
        let path = std::env::temp_dir().join(format!(
            "xyzzy-advice-{}-{}.json",
            std::process::id(),
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH)?.as_nanos()
        ));
        let source = FileConfigSource::new(&path);
        assert!(source.advice_configs()?.is_empty());
        std::fs::write(&path, serde_json::to_string(&vec![timer("com.example.Foo", "run")])?)?;
        assert_eq!(source.advice_configs()?.len(), 1);
        std::fs::remove_file(&path)?;
        Ok(())
    }
}
