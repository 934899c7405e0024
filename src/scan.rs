use anyhow::Result;
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use std::sync::mpsc;

/// Jars under `base` (or `base` itself when it is a jar), walked in parallel.
pub fn scan_jars(base: &Path) -> Result<Vec<PathBuf>> {
    scan_files(base, |path| path.extension().is_some_and(|e| e == "jar"))
}

/// Files under `base` whose file name is exactly `file_name`.
pub fn scan_named_files(base: &Path, file_name: &str) -> Result<Vec<PathBuf>> {
    scan_files(base, |path| path.file_name().is_some_and(|n| n == file_name))
}

pub fn scan_files(base: &Path, accept: impl Fn(&Path) -> bool + Sync) -> Result<Vec<PathBuf>> {
    if !base.exists() {
        anyhow::bail!("path does not exist: {}", base.display());
    }
    if base.is_file() {
        return Ok(if accept(base) {
            vec![base.to_path_buf()]
        } else {
            Vec::new()
        });
    }

    let (tx, rx) = mpsc::channel();
    let walker = WalkBuilder::new(base)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .build_parallel();

    let accept = &accept;
    walker.run(|| {
        let tx = tx.clone();
        Box::new(move |entry| {
            if let Ok(entry) = entry {
                let path = entry.path();
                if entry.file_type().is_some_and(|t| t.is_file()) && accept(path) {
                    let _ = tx.send(path.to_path_buf());
                }
            }
            ignore::WalkState::Continue
        })
    });

    drop(tx);
    let mut found: Vec<PathBuf> = rx.iter().collect();
    found.sort();
    Ok(found)
}

/// `com.example.Foo` or `com/example/Foo` to `com/example/Foo.class`.
pub fn class_name_to_resource(class_name: &str) -> String {
    format!("{}.class", class_name.replace('.', "/"))
}

/// `com/example/Foo.class` to `com.example.Foo`; `None` for non-class
/// entries and for `module-info`/`package-info`.
pub fn resource_to_class_name(entry: &str) -> Option<String> {
    let stem = entry.strip_suffix(".class")?;
    if stem.ends_with("module-info") || stem.ends_with("package-info") {
        return None;
    }
    Some(stem.replace(['/', '\\'], "."))
}
