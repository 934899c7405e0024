//! Class loaders as seen by class analysis: a parent chain plus a way to read
//! a class's bytes without defining it.

use anyhow::Result;
use rayon::prelude::*;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::classpath::{catalog_resources, read_jar_entry};
use crate::scan::class_name_to_resource;

pub type LoaderId = u64;

static NEXT_LOADER_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_loader_id() -> LoaderId {
    NEXT_LOADER_ID.fetch_add(1, Ordering::Relaxed)
}

pub trait ClassLoader: Send + Sync + fmt::Debug {
    fn id(&self) -> LoaderId;

    fn name(&self) -> &str;

    /// `None` delegates straight to the bootstrap loader.
    fn parent(&self) -> Option<Arc<dyn ClassLoader>>;

    /// Bytes of a class this loader defines itself (no delegation).
    /// `class_name` may be a Java or an internal name.
    fn find_class_bytes(&self, class_name: &str) -> Result<Option<Vec<u8>>>;
}

/// Loader chain from the root-most ancestor down to `loader`.
pub fn delegation_chain(loader: &Arc<dyn ClassLoader>) -> Vec<Arc<dyn ClassLoader>> {
    let mut chain = vec![loader.clone()];
    let mut current = loader.parent();
    while let Some(p) = current {
        if chain.iter().any(|c| c.id() == p.id()) {
            break;
        }
        current = p.parent();
        chain.push(p);
    }
    chain.reverse();
    chain
}

/// Serves classes from memory; used for generated code and tests.
pub struct MapClassLoader {
    id: LoaderId,
    name: String,
    parent: Option<Arc<dyn ClassLoader>>,
    classes: HashMap<String, Vec<u8>>,
}

impl MapClassLoader {
    pub fn new(name: &str, parent: Option<Arc<dyn ClassLoader>>) -> Self {
        Self {
            id: next_loader_id(),
            name: name.to_string(),
            parent,
            classes: HashMap::new(),
        }
    }

    /// `internal_name` like `com/example/Foo`.
    pub fn with_class(mut self, internal_name: &str, bytes: Vec<u8>) -> Self {
        self.classes.insert(internal_name.replace('.', "/"), bytes);
        self
    }

    pub fn into_arc(self) -> Arc<dyn ClassLoader> {
        Arc::new(self)
    }
}

impl fmt::Debug for MapClassLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapClassLoader")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("classes", &self.classes.len())
            .finish()
    }
}

impl ClassLoader for MapClassLoader {
    fn id(&self) -> LoaderId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn parent(&self) -> Option<Arc<dyn ClassLoader>> {
        self.parent.clone()
    }

    fn find_class_bytes(&self, class_name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.classes.get(&class_name.replace('.', "/")).cloned())
    }
}

/// Serves classes out of jars. Entries are indexed once at construction;
/// bytes are read on demand through a memory map.
pub struct JarClassLoader {
    id: LoaderId,
    name: String,
    parent: Option<Arc<dyn ClassLoader>>,
    jars: Vec<PathBuf>,
    /// Resource name to the first jar (classpath order) that has it.
    index: HashMap<String, usize>,
}

impl JarClassLoader {
    pub fn new(name: &str, jars: Vec<PathBuf>, parent: Option<Arc<dyn ClassLoader>>) -> Result<Self> {
        let listed: Vec<Vec<String>> = jars
            .par_iter()
            .map(|jar| catalog_resources(jar))
            .collect::<Result<_>>()?;
        let mut index = HashMap::new();
        for (i, entries) in listed.into_iter().enumerate() {
            for entry in entries {
                index.entry(entry).or_insert(i);
            }
        }
        Ok(Self {
            id: next_loader_id(),
            name: name.to_string(),
            parent,
            jars,
            index,
        })
    }

    pub fn class_count(&self) -> usize {
        self.index.keys().filter(|k| k.ends_with(".class")).count()
    }

    pub fn into_arc(self) -> Arc<dyn ClassLoader> {
        Arc::new(self)
    }
}

impl fmt::Debug for JarClassLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JarClassLoader")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("jars", &self.jars)
            .finish()
    }
}

impl ClassLoader for JarClassLoader {
    fn id(&self) -> LoaderId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn parent(&self) -> Option<Arc<dyn ClassLoader>> {
        self.parent.clone()
    }

    fn find_class_bytes(&self, class_name: &str) -> Result<Option<Vec<u8>>> {
        let resource = class_name_to_resource(class_name);
        let Some(&jar) = self.index.get(&resource) else {
            return Ok(None);
        };
        read_jar_entry(&self.jars[jar], &resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::{SystemTime, UNIX_EPOCH};
    use zip::write::FileOptions;

    fn temp_path(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "xyzzy_loader_test_{}_{}_{}",
            std::process::id(),
            nanos,
            name
        ))
    }

    fn write_jar(path: &std::path::Path, entries: &[(&str, &[u8])]) -> Result<()> {
        let file = std::fs::File::create(path)?;
        let mut zip = zip::ZipWriter::new(file);
        let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for (name, content) in entries {
            zip.start_file(*name, options)?;
            zip.write_all(content)?;
        }
        zip.finish()?;
        Ok(())
    }

    #[test]
    fn jar_loader_prefers_earlier_jars() -> Result<()> {
        let first = temp_path("first.jar");
        let second = temp_path("second.jar");
        write_jar(&first, &[("com/example/A.class", b"first")])?;
        write_jar(
            &second,
            &[("com/example/A.class", b"second"), ("com/example/B.class", b"b")],
        )?;

        let loader = JarClassLoader::new("app", vec![first.clone(), second.clone()], None)?;
        assert_eq!(loader.class_count(), 2);
        assert_eq!(loader.find_class_bytes("com.example.A")?, Some(b"first".to_vec()));
        assert_eq!(loader.find_class_bytes("com/example/B")?, Some(b"b".to_vec()));
        assert_eq!(loader.find_class_bytes("com.example.C")?, None);
        std::fs::remove_file(first)?;
        std::fs::remove_file(second)?;
        Ok(())
    }

    #[test]
    fn jar_loader_serves_classes_behind_a_shared_handle() -> Result<()> {
        let jar = temp_path("shared.jar");
        write_jar(&jar, &[("com/example/A.class", b"a")])?;
        let root = MapClassLoader::new("root", None).into_arc();
        let loader = JarClassLoader::new("app", vec![jar.clone()], Some(root))?.into_arc();
        assert_eq!(loader.name(), "app");
        assert_eq!(loader.find_class_bytes("com.example.A")?, Some(b"a".to_vec()));
        let names: Vec<String> = delegation_chain(&loader)
            .iter()
            .map(|l| l.name().to_string())
            .collect();
        assert_eq!(names, vec!["root", "app"]);
        std::fs::remove_file(jar)?;
        Ok(())
    }

    #[test]
    fn delegation_chain_runs_root_first() {
        let root = MapClassLoader::new("root", None).into_arc();
        let mid = MapClassLoader::new("mid", Some(root.clone())).into_arc();
        let leaf = MapClassLoader::new("leaf", Some(mid.clone())).into_arc();
        let names: Vec<String> = delegation_chain(&leaf)
            .iter()
            .map(|l| l.name().to_string())
            .collect();
        assert_eq!(names, vec!["root", "mid", "leaf"]);
    }
}
