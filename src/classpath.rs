//! Class names and bytes available on a classpath (jars and class
//! directories), cataloged lazily or in the background.

use anyhow::{Context, Result};
use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::scan::{class_name_to_resource, resource_to_class_name, scan_files, scan_jars};

pub(crate) fn open_archive(jar_path: &Path) -> Result<ZipArchive<Cursor<Mmap>>> {
    let file = File::open(jar_path)
        .with_context(|| format!("Failed to open jar: {}", jar_path.display()))?;
    // SAFETY: the file is opened read-only and the mapping is owned by the archive.
    let mmap = unsafe { Mmap::map(&file) }
        .with_context(|| format!("Failed to mmap jar: {}", jar_path.display()))?;
    ZipArchive::new(Cursor::new(mmap))
        .with_context(|| format!("Failed to read zip structure: {}", jar_path.display()))
}

/// Every entry name in a jar.
pub fn catalog_resources(jar_path: &Path) -> Result<Vec<String>> {
    let archive = open_archive(jar_path)?;
    Ok(archive.file_names().map(str::to_string).collect())
}

/// Java names of every class in a jar, inner classes included.
pub fn catalog(jar_path: &Path) -> Result<Vec<String>> {
    let mut classes: Vec<String> = catalog_resources(jar_path)?
        .iter()
        .filter_map(|entry| resource_to_class_name(entry))
        .collect();
    classes.sort();
    Ok(classes)
}

pub fn read_jar_entry(jar_path: &Path, entry_name: &str) -> Result<Option<Vec<u8>>> {
    let mut archive = open_archive(jar_path)?;
    let Ok(mut entry) = archive.by_name(entry_name) else {
        return Ok(None);
    };
    let mut bytes = Vec::with_capacity(entry.size() as usize);
    entry
        .read_to_end(&mut bytes)
        .with_context(|| format!("Failed to read {entry_name} from {}", jar_path.display()))?;
    Ok(Some(bytes))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassLocation {
    Jar(PathBuf),
    /// A loose `.class` file.
    File(PathBuf),
}

#[derive(Debug)]
pub struct ClasspathCache {
    roots: Vec<PathBuf>,
    index: RwLock<BTreeMap<String, Vec<ClassLocation>>>,
    loaded: AtomicBool,
    preload: Mutex<Option<JoinHandle<()>>>,
}

impl ClasspathCache {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self {
            roots,
            index: RwLock::new(BTreeMap::new()),
            loaded: AtomicBool::new(false),
            preload: Mutex::new(None),
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Catalogs every root once; later calls are free.
    pub fn ensure_loaded(&self) -> Result<()> {
        if self.is_loaded() {
            return Ok(());
        }
        let started = Instant::now();
        let mut index: BTreeMap<String, Vec<ClassLocation>> = BTreeMap::new();
        for root in &self.roots {
            if root.is_dir() {
                let class_files = scan_files(root, |p| p.extension().is_some_and(|e| e == "class"))?;
                for file in class_files {
                    let Ok(relative) = file.strip_prefix(root) else {
                        continue;
                    };
                    let relative = relative.to_string_lossy().replace('\\', "/");
                    if let Some(name) = resource_to_class_name(&relative) {
                        index.entry(name).or_default().push(ClassLocation::File(file));
                    }
                }
            }
            let jars = scan_jars(root)?;
            let cataloged: Vec<(PathBuf, Result<Vec<String>>)> = jars
                .into_par_iter()
                .map(|jar| {
                    let classes = catalog(&jar);
                    (jar, classes)
                })
                .collect();
            for (jar, classes) in cataloged {
                match classes {
                    Ok(classes) => {
                        for class in classes {
                            index
                                .entry(class)
                                .or_default()
                                .push(ClassLocation::Jar(jar.clone()));
                        }
                    }
                    Err(e) => warn!(jar = %jar.display(), error = %e, "skipping unreadable jar"),
                }
            }
        }
        let classes = index.len();
        let mut guard = self.index.write();
        if !self.is_loaded() {
            *guard = index;
            self.loaded.store(true, Ordering::Release);
        }
        debug!(classes, elapsed_ms = started.elapsed().as_millis() as u64, "classpath cataloged");
        Ok(())
    }

    /// Starts cataloging on a background thread unless already loaded or
    /// in progress.
    pub fn preload_in_background(self: &Arc<Self>) {
        let mut preload = self.preload.lock();
        if self.is_loaded() || preload.is_some() {
            return;
        }
        let cache = self.clone();
        let spawned = std::thread::Builder::new()
            .name("xyzzy-classpath-preload".to_string())
            .spawn(move || {
                if let Err(e) = cache.ensure_loaded() {
                    warn!(error = %e, "classpath preload failed");
                }
            });
        match spawned {
            Ok(handle) => *preload = Some(handle),
            Err(e) => warn!(error = %e, "failed to spawn classpath preload thread"),
        }
    }

    pub fn wait_for_preload(&self) {
        let handle = self.preload.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    pub fn class_names(&self) -> Vec<String> {
        self.index.read().keys().cloned().collect()
    }

    pub fn locations(&self, class_name: &str) -> Vec<ClassLocation> {
        self.index
            .read()
            .get(&class_name.replace('/', "."))
            .cloned()
            .unwrap_or_default()
    }

    /// Bytes from the first location of `class_name`.
    pub fn class_bytes(&self, class_name: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_loaded()?;
        for location in self.locations(class_name) {
            let bytes = match &location {
                ClassLocation::Jar(jar) => read_jar_entry(jar, &class_name_to_resource(class_name))?,
                ClassLocation::File(path) => Some(
                    std::fs::read(path)
                        .with_context(|| format!("Failed to read class file: {}", path.display()))?,
                ),
            };
            if bytes.is_some() {
                return Ok(bytes);
            }
        }
        Ok(None)
    }
}
