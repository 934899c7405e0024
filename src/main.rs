use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;
use xyzzy_agent::advice::AdviceCache;
use xyzzy_agent::classpath::ClasspathCache;
use xyzzy_agent::cli::{Cli, Commands};
use xyzzy_agent::config::{AgentConfig, InstrumentationDescriptor, collect_descriptors, load_agent_config, read_descriptors};
use xyzzy_agent::live::{LiveWeavingService, MethodSignature};
use xyzzy_agent::reweave::{SimulatedInstrumentation, StaticConfigSource};
use xyzzy_agent::weaver::weave_jar;
use xyzzy_agent::world::AnalyzedWorld;

const LOG_ENV: &str = "XYZZY_LOG";

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = Arc::new(load_agent_config(cli.config.as_deref())?);

    match cli.command.clone() {
        Commands::Weave {
            input,
            instrumentation,
            output,
        } => {
            let descriptors = read_all_descriptors(&instrumentation)?;
            let advice_cache = Arc::new(AdviceCache::new(&descriptors, &[])?);
            let report = weave_jar(&input, &output, advice_cache, config)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Classes {
            partial,
            classpath,
            limit,
        } => {
            let start = Instant::now();
            let live = offline_service(classpath, config)?;
            let classes = live.get_matching_class_names(&partial, limit)?;
            let output = ClassesResult {
                partial,
                classes,
                duration_ms: start.elapsed().as_millis() as u64,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Methods {
            class_name,
            partial,
            classpath,
            limit,
        } => {
            let start = Instant::now();
            let live = offline_service(classpath, config)?;
            let methods = live.get_matching_method_names(&class_name, &partial, limit)?;
            let output = MethodsResult {
                class_name,
                partial,
                methods,
                duration_ms: start.elapsed().as_millis() as u64,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Signatures {
            class_name,
            method_name,
            classpath,
        } => {
            let start = Instant::now();
            let live = offline_service(classpath, config)?;
            let signatures = live.get_method_signatures(&class_name, &method_name)?;
            let output = SignaturesResult {
                class_name,
                method_name,
                signatures,
                duration_ms: start.elapsed().as_millis() as u64,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Validate { files } => {
            let report = validate_files(&files)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.valid {
                anyhow::bail!("invalid instrumentation");
            }
        }
        Commands::List { dir, output } => {
            let descriptors = collect_descriptors(&dir)?;
            let content = serde_json::to_string_pretty(&descriptors)?;
            write_output(&content, output.as_deref())?;
        }
    }

    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn read_all_descriptors(paths: &[PathBuf]) -> Result<Vec<InstrumentationDescriptor>> {
    let mut descriptors = Vec::new();
    for path in paths {
        descriptors.extend(read_descriptors(path)?);
    }
    Ok(descriptors)
}

/// Queries over a classpath with no running JVM behind them.
fn offline_service(classpath: Vec<PathBuf>, config: Arc<AgentConfig>) -> Result<LiveWeavingService> {
    let advice_cache = Arc::new(AdviceCache::new(&[], &[])?);
    let world = Arc::new(AnalyzedWorld::new(advice_cache.clone(), None));
    Ok(LiveWeavingService::new(
        world,
        Arc::new(SimulatedInstrumentation::new(false)),
        Arc::new(StaticConfigSource::new(Vec::new())),
        advice_cache,
        Arc::new(ClasspathCache::new(classpath)),
    )
    .with_agent_config(config))
}

#[derive(Debug, Serialize)]
struct ClassesResult {
    partial: String,
    classes: Vec<String>,
    duration_ms: u64,
}

#[derive(Debug, Serialize)]
struct MethodsResult {
    class_name: String,
    partial: String,
    methods: Vec<String>,
    duration_ms: u64,
}

#[derive(Debug, Serialize)]
struct SignaturesResult {
    class_name: String,
    method_name: String,
    signatures: Vec<MethodSignature>,
    duration_ms: u64,
}

#[derive(Debug, Serialize)]
struct AdviceErrors {
    index: usize,
    errors: Vec<String>,
}

#[derive(Debug, Serialize)]
struct DescriptorReport {
    id: String,
    advice_count: usize,
    invalid: Vec<AdviceErrors>,
}

#[derive(Debug, Serialize)]
struct FileReport {
    path: String,
    descriptors: Vec<DescriptorReport>,
}

#[derive(Debug, Serialize)]
struct ValidateReport {
    valid: bool,
    files: Vec<FileReport>,
}

fn validate_files(paths: &[PathBuf]) -> Result<ValidateReport> {
    let mut files = Vec::with_capacity(paths.len());
    let mut valid = true;
    for path in paths {
        let descriptors = read_descriptors(path)?;
        let mut reports = Vec::with_capacity(descriptors.len());
        for d in &descriptors {
            let invalid: Vec<AdviceErrors> = d
                .advice
                .iter()
                .enumerate()
                .map(|(index, a)| AdviceErrors {
                    index,
                    errors: a.validation_errors(),
                })
                .filter(|e| !e.errors.is_empty())
                .collect();
            valid &= invalid.is_empty();
            reports.push(DescriptorReport {
                id: d.id.clone(),
                advice_count: d.advice.len(),
                invalid,
            });
        }
        files.push(FileReport {
            path: path.to_string_lossy().to_string(),
            descriptors: reports,
        });
    }
    Ok(ValidateReport { valid, files })
}

fn write_output(content: &str, output: Option<&Path>) -> Result<()> {
    if let Some(path) = output {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    } else {
        print!("{content}");
        if !content.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}
