//! Class-file transformer: analyzes a class as it is defined, weaves the
//! advisors its methods picked up and never lets a failure escape to the
//! class-loading caller.

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::Serialize;
use std::io::{Read, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use zip::write::FileOptions;

use crate::advice::{AdviceCache, Advisor};
use crate::classfile::{ClassFile, internal_to_java_name};
use crate::classpath::open_archive;
use crate::config::AgentConfig;
use crate::error::WeaveError;
use crate::loader::{ClassLoader, JarClassLoader};
use crate::method_weaver::{ClassContext, weave_method};
use crate::scan::resource_to_class_name;
use crate::world::{AnalyzedClass, AnalyzedWorld};

#[derive(Debug, Clone)]
pub struct ClassFileTransformer {
    world: Arc<AnalyzedWorld>,
    config: Arc<AgentConfig>,
}

impl ClassFileTransformer {
    pub fn new(world: Arc<AnalyzedWorld>, config: Arc<AgentConfig>) -> Self {
        Self { world, config }
    }

    pub fn world(&self) -> &Arc<AnalyzedWorld> {
        &self.world
    }

    /// Woven bytes, or `None` to define the class unchanged. Errors and
    /// panics are logged and swallowed.
    pub fn transform(
        &self,
        loader: Option<&Arc<dyn ClassLoader>>,
        class_name: &str,
        bytes: &[u8],
    ) -> Option<Vec<u8>> {
        if self.config.is_agent_internal(class_name) {
            return None;
        }
        match catch_unwind(AssertUnwindSafe(|| self.try_transform(loader, class_name, bytes))) {
            Ok(Ok(woven)) => woven,
            Ok(Err(e)) => {
                warn!(class = %internal_to_java_name(class_name), error = %e, "class left unwoven");
                None
            }
            Err(_) => {
                warn!(class = %internal_to_java_name(class_name), "weaving panicked, class left unwoven");
                None
            }
        }
    }

    pub fn try_transform(
        &self,
        loader: Option<&Arc<dyn ClassLoader>>,
        class_name: &str,
        bytes: &[u8],
    ) -> Result<Option<Vec<u8>>, WeaveError> {
        let analyzed = self.world.analyze_bytes(class_name, bytes, loader)?;
        if !analyzed.has_advice() {
            return Ok(None);
        }
        weave_class(bytes, &analyzed, self.world.advice_cache(), &self.config)
    }
}

/// Weaves every method of `analyzed` that picked up advisors.
pub fn weave_class(
    bytes: &[u8],
    analyzed: &AnalyzedClass,
    advice_cache: &AdviceCache,
    config: &AgentConfig,
) -> Result<Option<Vec<u8>>, WeaveError> {
    let mut class = ClassFile::parse(bytes)?;
    let class_name = internal_to_java_name(class.name()?);
    let owner_is_object = class.super_name()?.is_none();
    let this_class = class.this_class;
    let major_version = class.major_version;
    let context = ClassContext {
        class_name: &class_name,
        this_class,
        owner_is_object,
        major_version,
        bridge_class: &config.bridge_class,
    };

    let mut methods = std::mem::take(&mut class.methods);
    let mut woven = 0usize;
    for method in &mut methods {
        let name = method.name(&class.constant_pool)?;
        let descriptor = method.descriptor(&class.constant_pool)?;
        let Some(analyzed_method) = analyzed.method(name, descriptor) else {
            continue;
        };
        if analyzed_method.advisor_ids.is_empty() {
            continue;
        }
        let advisors: Vec<Arc<Advisor>> = analyzed_method
            .advisor_ids
            .iter()
            .filter_map(|id| advice_cache.advisor(*id))
            .collect();
        if weave_method(&mut class.constant_pool, method, &advisors, &context)? {
            woven += 1;
        }
    }
    class.methods = methods;
    if woven == 0 {
        return Ok(None);
    }
    debug!(class = %class_name, methods = woven, "class woven");
    Ok(Some(class.to_bytes()))
}

#[derive(Debug, Serialize)]
pub struct WeaveFailure {
    pub class_name: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct WeaveJarReport {
    pub input: String,
    pub output: String,
    pub classes_woven: usize,
    pub classes_unchanged: usize,
    pub classes_failed: usize,
    pub failures: Vec<WeaveFailure>,
    pub duration_ms: u64,
}

enum Outcome {
    Woven(Vec<u8>),
    Unchanged,
    Failed(String),
}

/// Offline weaving: every class of `input` is analyzed with the jar itself
/// as its defining loader and written, woven or not, to `output` together
/// with the jar's other entries.
pub fn weave_jar(
    input: &Path,
    output: &Path,
    advice_cache: Arc<AdviceCache>,
    config: Arc<AgentConfig>,
) -> Result<WeaveJarReport> {
    let start = Instant::now();
    let loader = JarClassLoader::new("offline", vec![input.to_path_buf()], None)?.into_arc();
    let world = Arc::new(AnalyzedWorld::new(advice_cache, None));
    let transformer = ClassFileTransformer::new(world, config);

    let mut archive = open_archive(input)?;
    let mut entries: Vec<(String, Vec<u8>)> = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .with_context(|| format!("Failed to read entry #{i} of {}", input.display()))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut bytes)
            .with_context(|| format!("Failed to read {name} from {}", input.display()))?;
        entries.push((name, bytes));
    }

    let outcomes: Vec<Outcome> = entries
        .par_iter()
        .map(|(name, bytes)| {
            let Some(class_name) = resource_to_class_name(name) else {
                return Outcome::Unchanged;
            };
            if transformer.config.is_agent_internal(&class_name) {
                return Outcome::Unchanged;
            }
            let attempt = catch_unwind(AssertUnwindSafe(|| {
                transformer.try_transform(Some(&loader), &class_name, bytes)
            }));
            match attempt {
                Ok(Ok(Some(woven))) => Outcome::Woven(woven),
                Ok(Ok(None)) => Outcome::Unchanged,
                Ok(Err(e)) => Outcome::Failed(e.to_string()),
                Err(_) => Outcome::Failed("weaving panicked".to_string()),
            }
        })
        .collect();

    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let file = std::fs::File::create(output)
        .with_context(|| format!("Failed to create jar: {}", output.display()))?;
    let mut zip = zip::ZipWriter::new(file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    let mut report = WeaveJarReport {
        input: input.to_string_lossy().to_string(),
        output: output.to_string_lossy().to_string(),
        classes_woven: 0,
        classes_unchanged: 0,
        classes_failed: 0,
        failures: Vec::new(),
        duration_ms: 0,
    };
    for ((name, original), outcome) in entries.iter().zip(outcomes) {
        let is_class = resource_to_class_name(name).is_some();
        let bytes = match outcome {
            Outcome::Woven(woven) => {
                report.classes_woven += 1;
                woven
            }
            Outcome::Unchanged => {
                if is_class {
                    report.classes_unchanged += 1;
                }
                original.clone()
            }
            Outcome::Failed(error) => {
                report.classes_failed += 1;
                report.failures.push(WeaveFailure {
                    class_name: resource_to_class_name(name).unwrap_or_default(),
                    error,
                });
                original.clone()
            }
        };
        zip.start_file(name.as_str(), options)
            .with_context(|| format!("Failed to write {name} to {}", output.display()))?;
        zip.write_all(&bytes)?;
    }
    zip.finish()
        .with_context(|| format!("Failed to finish jar: {}", output.display()))?;
    report.duration_ms = start.elapsed().as_millis() as u64;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::builder::ClassBuilder;
    use crate::classfile::code::{INVOKESTATIC, Insn, RETURN, instructions};
    use crate::classfile::ACC_PUBLIC;
    use crate::config::{AdviceConfig, CaptureKind};
    use crate::loader::MapClassLoader;
    use crate::pointcut::PointcutSpec;

    fn temp_path(name: &str) -> std::path::PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("xyzzy-weaver-{name}-{}-{nanos}", std::process::id()))
    }

    fn timer_config(class_name: &str, method: &str) -> AdviceConfig {
        AdviceConfig {
            pointcut: PointcutSpec {
                class_name: class_name.to_string(),
                method_name: method.to_string(),
                method_parameter_types: vec!["..".to_string()],
                timer_name: "t".to_string(),
                ..PointcutSpec::default()
            },
            capture_kind: CaptureKind::Timer,
            ..AdviceConfig::default()
        }
    }

    fn transformer(configs: &[AdviceConfig]) -> anyhow::Result<ClassFileTransformer> {
        let cache = Arc::new(AdviceCache::new(&[], configs)?);
        let world = Arc::new(AnalyzedWorld::new(cache, None));
        Ok(ClassFileTransformer::new(world, Arc::new(AgentConfig::default())))
    }

    fn bridge_calls(bytes: &[u8]) -> anyhow::Result<Vec<String>> {
        let class = ClassFile::parse(bytes)?;
        let mut calls = Vec::new();
        for method in &class.methods {
            let Some(code) = method.code(&class.constant_pool)? else {
                continue;
            };
            for (_, insn) in instructions(&code.code)? {
                if let Insn::Member {
                    opcode: INVOKESTATIC,
                    index,
                } = insn
                {
                    let (_, name, _) = class.constant_pool.member_ref(index)?;
                    calls.push(format!("{}.{name}", method.name(&class.constant_pool)?));
                }
            }
        }
        Ok(calls)
    }

    #[test]
    fn weaves_only_matched_methods() -> anyhow::Result<()> {
        let bytes = ClassBuilder::new("com/example/Foo", "java/lang/Object")
            .method(ACC_PUBLIC, "bar", "()V", 0, 1, vec![RETURN])
            .method(ACC_PUBLIC, "baz", "()V", 0, 1, vec![RETURN])
            .build()?;
        let transformer = transformer(&[timer_config("com.example.Foo", "bar")])?;
        let woven = transformer
            .transform(None, "com/example/Foo", &bytes)
            .expect("woven");
        assert_eq!(bridge_calls(&woven)?, vec!["bar.onBefore", "bar.onReturn"]);

        let other = ClassBuilder::new("com/example/Other", "java/lang/Object")
            .method(ACC_PUBLIC, "bar", "()V", 0, 1, vec![RETURN])
            .build()?;
        assert_eq!(transformer.transform(None, "com/example/Other", &other), None);
        Ok(())
    }

    #[test]
    fn subclass_inherits_advice_through_loader() -> anyhow::Result<()> {
        let base = ClassBuilder::new("com/example/Base", "java/lang/Object")
            .method(ACC_PUBLIC, "run", "()V", 0, 1, vec![RETURN])
            .build()?;
        let loader = MapClassLoader::new("app", None)
            .with_class("com/example/Base", base)
            .into_arc();
        let sub = ClassBuilder::new("com/example/Sub", "com/example/Base")
            .method(ACC_PUBLIC, "run", "()V", 0, 1, vec![RETURN])
            .build()?;
        let mut config = timer_config("com.example.Base", "run");
        config.pointcut.sub_type_restriction = "com.example.Base".to_string();
        let transformer = transformer(&[config])?;
        let woven = transformer.transform(Some(&loader), "com/example/Sub", &sub);
        assert!(woven.is_some());
        Ok(())
    }

    #[test]
    fn failures_and_agent_classes_leave_bytes_alone() -> anyhow::Result<()> {
        let transformer = transformer(&[timer_config("*", "*")])?;
        assert_eq!(transformer.transform(None, "com/example/Broken", b"not a class"), None);

        let internal = ClassBuilder::new("org/xyzzy/agent/Internal", "java/lang/Object")
            .method(ACC_PUBLIC, "run", "()V", 0, 1, vec![RETURN])
            .build()?;
        assert_eq!(transformer.transform(None, "org/xyzzy/agent/Internal", &internal), None);
        Ok(())
    }

    #[test]
    fn weave_jar_creates_missing_output_directories() -> anyhow::Result<()> {
        let base = temp_path("jar");
        std::fs::create_dir_all(&base)?;
        let input = base.join("app.jar");
        let class = ClassBuilder::new("com/example/Foo", "java/lang/Object")
            .method(ACC_PUBLIC, "bar", "()V", 0, 1, vec![RETURN])
            .build()?;
        let mut zip = zip::ZipWriter::new(std::fs::File::create(&input)?);
        zip.start_file("com/example/Foo.class", FileOptions::default())?;
        zip.write_all(&class)?;
        zip.start_file("META-INF/MANIFEST.MF", FileOptions::default())?;
        zip.write_all(b"Manifest-Version: 1.0\n")?;
        zip.finish()?;

        let output = base.join("out").join("nested").join("app-woven.jar");
        let cache = Arc::new(AdviceCache::new(&[], &[timer_config("com.example.Foo", "bar")])?);
        let report = weave_jar(&input, &output, cache, Arc::new(AgentConfig::default()))?;
        assert!(output.is_file());
        assert_eq!(report.classes_woven, 1);
        assert_eq!(report.classes_failed, 0);
        let archive = open_archive(&output)?;
        assert_eq!(archive.len(), 2);
        std::fs::remove_dir_all(&base)?;
        Ok(())
    }
}
