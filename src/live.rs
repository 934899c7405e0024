//! Live weaving queries: auto-complete over classes and methods visible to
//! the agent, method signatures for building pointcuts, and on-demand
//! reweaving.

use anyhow::Result;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::advice::AdviceCache;
use crate::classfile::{
    ACC_ABSTRACT, ACC_NATIVE, ACC_PRIVATE, ACC_PROTECTED, ACC_PUBLIC, ACC_STATIC, ACC_STRICT, ClassFile,
};
use crate::classfile::descriptor::MethodDescriptor;
use crate::classpath::ClasspathCache;
use crate::config::AgentConfig;
use crate::reweave::{AdviceConfigSource, Instrumentation, reweave};
use crate::world::AnalyzedWorld;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalMeta {
    pub jvm_out_of_sync: bool,
    pub jvm_retransform_classes_supported: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodSignature {
    pub name: String,
    pub parameter_types: Vec<String>,
    pub return_type: String,
    pub modifiers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MethodInfo {
    name: String,
    parameter_types: Vec<String>,
    return_type: String,
    access: u16,
}

impl MethodInfo {
    /// public, protected, package-private, private.
    fn accessibility(&self) -> u8 {
        if self.access & ACC_PUBLIC != 0 {
            0
        } else if self.access & ACC_PROTECTED != 0 {
            1
        } else if self.access & ACC_PRIVATE != 0 {
            3
        } else {
            2
        }
    }

    /// Modifiers the pointcut matcher cares about, in Java source order.
    /// `final` and `synchronized` never affect matching.
    fn modifiers(&self) -> Vec<String> {
        [
            (ACC_PUBLIC, "public"),
            (ACC_PROTECTED, "protected"),
            (ACC_PRIVATE, "private"),
            (ACC_ABSTRACT, "abstract"),
            (ACC_STATIC, "static"),
            (ACC_NATIVE, "native"),
            (ACC_STRICT, "strictfp"),
        ]
        .iter()
        .filter(|(flag, _)| self.access & flag != 0)
        .map(|(_, name)| name.to_string())
        .collect()
    }
}

#[derive(Debug)]
pub struct LiveWeavingService {
    world: Arc<AnalyzedWorld>,
    instrumentation: Arc<dyn Instrumentation>,
    config_source: Arc<dyn AdviceConfigSource>,
    advice_cache: Arc<AdviceCache>,
    classpath: Arc<ClasspathCache>,
    agent_config: Arc<AgentConfig>,
}

impl LiveWeavingService {
    pub fn new(
        world: Arc<AnalyzedWorld>,
        instrumentation: Arc<dyn Instrumentation>,
        config_source: Arc<dyn AdviceConfigSource>,
        advice_cache: Arc<AdviceCache>,
        classpath: Arc<ClasspathCache>,
    ) -> Self {
        Self {
            world,
            instrumentation,
            config_source,
            advice_cache,
            classpath,
            agent_config: Arc::new(AgentConfig::default()),
        }
    }

    pub fn with_agent_config(mut self, agent_config: Arc<AgentConfig>) -> Self {
        self.agent_config = agent_config;
        self
    }

    pub fn get_global_meta(&self) -> Result<GlobalMeta> {
        let configs = self.config_source.advice_configs()?;
        Ok(GlobalMeta {
            jvm_out_of_sync: self.advice_cache.is_out_of_sync(&configs),
            jvm_retransform_classes_supported: self.instrumentation.is_retransform_classes_supported(),
        })
    }

    pub fn preload_classpath_cache(&self) {
        self.classpath.preload_in_background();
    }

    /// Classes on the classpath or loaded in the JVM whose name contains
    /// `partial`, ignoring case; sorted, at most `limit`.
    pub fn get_matching_class_names(&self, partial: &str, limit: usize) -> Result<Vec<String>> {
        self.classpath.ensure_loaded()?;
        let needle = partial.to_lowercase();
        let mut names: BTreeSet<String> = self
            .classpath
            .class_names()
            .into_iter()
            .filter(|n| n.to_lowercase().contains(&needle))
            .collect();
        names.extend(
            self.instrumentation
                .all_loaded_classes()
                .into_iter()
                .map(|c| c.name)
                .filter(|n| n.to_lowercase().contains(&needle)),
        );
        Ok(names
            .into_iter()
            .filter(|n| !self.agent_config.is_agent_internal(n))
            .take(limit)
            .collect())
    }

    /// Method names declared by `class_name` containing `partial`, ignoring
    /// case; constructors and static initializers are left out.
    pub fn get_matching_method_names(&self, class_name: &str, partial: &str, limit: usize) -> Result<Vec<String>> {
        let needle = partial.to_lowercase();
        let names: BTreeSet<String> = self
            .methods(class_name)?
            .into_iter()
            .map(|m| m.name)
            .filter(|n| n != "<init>" && n != "<clinit>")
            .filter(|n| n.to_lowercase().contains(&needle))
            .collect();
        Ok(names.into_iter().take(limit).collect())
    }

    /// Signatures of every overload of `method_name`. Patterns yield none.
    pub fn get_method_signatures(&self, class_name: &str, method_name: &str) -> Result<Vec<MethodSignature>> {
        if method_name.contains('*') || method_name.contains('|') {
            return Ok(Vec::new());
        }
        let methods: Vec<MethodInfo> = self
            .methods(class_name)?
            .into_iter()
            .filter(|m| m.name == method_name)
            .collect();
        Ok(distinct_signatures(methods)
            .into_iter()
            .map(|m| MethodSignature {
                modifiers: m.modifiers(),
                name: m.name,
                parameter_types: m.parameter_types,
                return_type: m.return_type,
            })
            .collect())
    }

    /// Re-reads the advice configuration and reweaves; 0 when the JVM cannot
    /// retransform.
    pub fn reweave(&self) -> Result<usize> {
        let configs = self.config_source.advice_configs()?;
        reweave(&self.world, self.instrumentation.as_ref(), &configs, &self.agent_config)
    }

    /// Methods from the classpath copy of the class and from every analyzed
    /// (loaded) copy.
    fn methods(&self, class_name: &str) -> Result<Vec<MethodInfo>> {
        let java = class_name.replace('/', ".");
        let mut methods = Vec::new();
        if let Some(bytes) = self.classpath.class_bytes(&java)? {
            match parse_methods(&bytes) {
                Ok(found) => methods.extend(found),
                Err(e) => debug!(class = %java, error = %e, "unparseable classpath class"),
            }
        }
        for analyzed in self.world.analyzed_classes(&java) {
            for m in &analyzed.methods {
                let info = MethodInfo {
                    name: m.name.clone(),
                    parameter_types: m.parameter_types.clone(),
                    return_type: m.return_type.clone(),
                    access: m.access,
                };
                if !methods.contains(&info) {
                    methods.push(info);
                }
            }
        }
        Ok(methods)
    }
}

/// One method per parameter and return types, the first seen winning, most
/// accessible first.
fn distinct_signatures(methods: Vec<MethodInfo>) -> Vec<MethodInfo> {
    let mut seen = HashSet::new();
    let mut distinct: Vec<MethodInfo> = methods
        .into_iter()
        .filter(|m| seen.insert((m.parameter_types.clone(), m.return_type.clone())))
        .collect();
    distinct.sort_by(|a, b| {
        a.accessibility()
            .cmp(&b.accessibility())
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.parameter_types.len().cmp(&b.parameter_types.len()))
            .then_with(|| a.parameter_types.cmp(&b.parameter_types))
    });
    distinct
}

fn parse_methods(bytes: &[u8]) -> Result<Vec<MethodInfo>> {
    let class = ClassFile::parse(bytes)?;
    let pool = &class.constant_pool;
    let mut methods = Vec::with_capacity(class.methods.len());
    for m in &class.methods {
        let descriptor = MethodDescriptor::parse(m.descriptor(pool)?)?;
        methods.push(MethodInfo {
            name: m.name(pool)?.to_string(),
            parameter_types: descriptor.parameter_java_names(),
            return_type: descriptor.return_java_name(),
            access: m.access_flags,
        });
    }
    Ok(methods)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::builder::ClassBuilder;
    use crate::classfile::{ACC_FINAL, ACC_SYNCHRONIZED};
    use crate::config::AdviceConfig;
    use crate::loader::{ClassLoader, MapClassLoader};
    use crate::pointcut::PointcutSpec;
    use crate::reweave::{SimulatedInstrumentation, StaticConfigSource};
    use crate::weaver::ClassFileTransformer;
    use std::io::Write;
    use std::path::PathBuf;
    use zip::write::FileOptions;

    fn temp_path(name: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("xyzzy-live-{name}-{}-{nanos}", std::process::id()))
    }

    fn write_jar(path: &PathBuf, entries: &[(&str, Vec<u8>)]) -> Result<()> {
        let file = std::fs::File::create(path)?;
        let mut zip = zip::ZipWriter::new(file);
        let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for (name, bytes) in entries {
            zip.start_file(*name, options)?;
            zip.write_all(bytes)?;
        }
        zip.finish()?;
        Ok(())
    }

    fn repository() -> Result<Vec<u8>> {
        Ok(ClassBuilder::new("com/example/UserRepository", "java/lang/Object")
            .method(ACC_PUBLIC, "<init>", "()V", 1, 1, vec![0xb1])
            .method(ACC_PUBLIC | ACC_FINAL, "findUser", "(Ljava/lang/String;)Ljava/lang/Object;", 1, 2, vec![0x01, 0xb0])
            .method(ACC_PRIVATE, "findUser", "()Ljava/lang/Object;", 1, 1, vec![0x01, 0xb0])
            .method(ACC_PUBLIC | ACC_SYNCHRONIZED, "findUser", "(Ljava/lang/String;I)Ljava/lang/Object;", 1, 3, vec![0x01, 0xb0])
            .method(ACC_PUBLIC | ACC_STATIC, "flush", "()V", 0, 0, vec![0xb1])
            .build()?)
    }

    fn service(
        dir: &PathBuf,
        instrumentation: Arc<SimulatedInstrumentation>,
        configs: Vec<AdviceConfig>,
        world: Arc<AnalyzedWorld>,
    ) -> LiveWeavingService {
        LiveWeavingService::new(
            world.clone(),
            instrumentation,
            Arc::new(StaticConfigSource::new(configs)),
            world.advice_cache().clone(),
            Arc::new(ClasspathCache::new(vec![dir.clone()])),
        )
    }

    #[test]
    fn auto_complete_over_classpath_and_signatures() -> Result<()> {
        let dir = temp_path("classpath");
        std::fs::create_dir_all(&dir)?;
        write_jar(
            &dir.join("app.jar"),
            &[
                ("com/example/UserRepository.class", repository()?),
                ("com/example/OrderService.class", ClassBuilder::new("com/example/OrderService", "java/lang/Object").build()?),
                ("org/xyzzy/agent/UserHelper.class", ClassBuilder::new("org/xyzzy/agent/UserHelper", "java/lang/Object").build()?),
            ],
        )?;
        let world = Arc::new(AnalyzedWorld::new(Arc::new(AdviceCache::new(&[], &[])?), None));
        let live = service(&dir, Arc::new(SimulatedInstrumentation::new(false)), Vec::new(), world);

        assert_eq!(live.get_matching_class_names("user", 10)?, vec!["com.example.UserRepository"]);
        assert_eq!(live.get_matching_class_names("com.example", 1)?, vec!["com.example.OrderService"]);
        assert_eq!(
            live.get_matching_method_names("com.example.UserRepository", "", 10)?,
            vec!["findUser", "flush"]
        );

        let signatures = live.get_method_signatures("com.example.UserRepository", "findUser")?;
        let shapes: Vec<(Vec<String>, Vec<String>)> = signatures
            .iter()
            .map(|s| (s.modifiers.clone(), s.parameter_types.clone()))
            .collect();
        assert_eq!(
            shapes,
            vec![
                (vec!["public".to_string()], vec!["java.lang.String".to_string()]),
                (vec!["public".to_string()], vec!["java.lang.String".to_string(), "int".to_string()]),
                (vec!["private".to_string()], vec![]),
            ]
        );
        assert!(live.get_method_signatures("com.example.UserRepository", "find*")?.is_empty());
        assert_eq!(live.reweave()?, 0);
        assert!(!live.get_global_meta()?.jvm_retransform_classes_supported);
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn reweave_applies_the_configured_advice() -> Result<()> {
        let dir = temp_path("empty");
        std::fs::create_dir_all(&dir)?;
        let loader: Arc<dyn ClassLoader> = MapClassLoader::new("app", None)
            .with_class("com/example/UserRepository", repository()?)
            .into_arc();
        let world = Arc::new(AnalyzedWorld::new(Arc::new(AdviceCache::new(&[], &[])?), None));
        let jvm = Arc::new(SimulatedInstrumentation::new(true));
        jvm.install_transformer(ClassFileTransformer::new(world.clone(), Arc::new(AgentConfig::default())));
        jvm.load_class(&loader, "com/example/UserRepository")?;

        let config = AdviceConfig {
            pointcut: PointcutSpec {
                class_name: "com.example.UserRepository".to_string(),
                method_name: "findUser".to_string(),
                method_parameter_types: vec!["..".to_string()],
                timer_name: "find user".to_string(),
                ..PointcutSpec::default()
            },
            ..AdviceConfig::default()
        };
        let live = service(&dir, jvm.clone(), vec![config], world);
        assert!(live.get_global_meta()?.jvm_out_of_sync);
        assert_eq!(live.reweave()?, 1);
        assert_eq!(live.reweave()?, 0);
        assert_eq!(
            live.get_global_meta()?,
            GlobalMeta {
                jvm_out_of_sync: false,
                jvm_retransform_classes_supported: true,
            }
        );
        assert_eq!(jvm.retransform_count("com.example.UserRepository"), 1);
        // loaded classes count toward auto-complete even off the classpath
        assert_eq!(live.get_matching_class_names("repo", 5)?, vec!["com.example.UserRepository"]);
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn copies_with_different_access_yield_one_signature() {
        let info = |access: u16, params: &[&str]| MethodInfo {
            name: "findUser".to_string(),
            parameter_types: params.iter().map(|p| p.to_string()).collect(),
            return_type: "java.lang.Object".to_string(),
            access,
        };
        let methods = vec![
            info(ACC_PUBLIC, &["java.lang.String"]),
            info(ACC_PUBLIC, &["java.lang.String", "int"]),
            // a loaded copy from an older version of the class
            info(ACC_PRIVATE, &["java.lang.String"]),
            info(ACC_PROTECTED, &[]),
        ];
        let distinct = distinct_signatures(methods);
        let shapes: Vec<(u16, usize)> = distinct.iter().map(|m| (m.access, m.parameter_types.len())).collect();
        assert_eq!(shapes, vec![(ACC_PUBLIC, 1), (ACC_PUBLIC, 2), (ACC_PROTECTED, 0)]);
    }
}
