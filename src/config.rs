use anyhow::{Context, Result};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::env;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use zip::ZipArchive;

use crate::error::ConfigError;
use crate::pointcut::{PointcutDescriptor, PointcutSpec};
use crate::scan::{scan_jars, scan_named_files};

pub const DESCRIPTOR_FILE: &str = "xyzzy.instrumentation.json";
pub const DESCRIPTOR_LIST_FILE: &str = "xyzzy.instrumentation-list.json";
pub const JAR_DESCRIPTOR_ENTRY: &str = "META-INF/xyzzy.instrumentation.json";
pub const CONFIG_ENV: &str = "XYZZY_AGENT_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    pub max_trace_entries_per_transaction: usize,
    /// Dummy entries may still be escalated until the recorded count reaches
    /// `max_trace_entries_per_transaction * trace_entry_cap_multiplier`.
    pub trace_entry_cap_multiplier: usize,
    pub escalation_threshold_millis: u64,
    pub max_aux_thread_contexts_per_transaction: usize,
    pub immediate_partial_store_threshold_seconds: u64,
    pub immediate_partial_store_poll_millis: u64,
    pub managed_thread_slots: usize,
    pub aggregate_interval_seconds: u64,
    /// Java package prefixes that are never woven.
    pub agent_internal_prefixes: Vec<String>,
    /// Internal name of the class woven code calls into.
    pub bridge_class: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_trace_entries_per_transaction: 2000,
            trace_entry_cap_multiplier: 2,
            escalation_threshold_millis: 1000,
            max_aux_thread_contexts_per_transaction: 2000,
            immediate_partial_store_threshold_seconds: 60,
            immediate_partial_store_poll_millis: 1000,
            managed_thread_slots: 256,
            aggregate_interval_seconds: 60,
            agent_internal_prefixes: vec!["org.xyzzy.agent.".to_string()],
            bridge_class: "org/xyzzy/agent/bridge/AdviceBridge".to_string(),
        }
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read agent config: {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse agent config: {}", path.display()))
    }

    /// Whether a class (Java or internal name) belongs to the agent itself.
    pub fn is_agent_internal(&self, class_name: &str) -> bool {
        let java = class_name.replace('/', ".");
        let bridge = self.bridge_class.replace('/', ".");
        java == bridge
            || self
                .agent_internal_prefixes
                .iter()
                .any(|p| java.starts_with(p.as_str()))
    }
}

/// Explicit path, then `XYZZY_AGENT_CONFIG`, then the per-user default when
/// it exists.
pub fn resolve_agent_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
    if let Some(p) = explicit {
        return Ok(Some(p.to_path_buf()));
    }
    if let Ok(p) = env::var(CONFIG_ENV)
        && !p.is_empty()
    {
        return Ok(Some(PathBuf::from(p)));
    }
    let default_path = agent_home()?.join("config.json");
    Ok(default_path.exists().then_some(default_path))
}

pub fn load_agent_config(explicit: Option<&Path>) -> Result<AgentConfig> {
    match resolve_agent_config_path(explicit)? {
        Some(path) => AgentConfig::load(&path),
        None => Ok(AgentConfig::default()),
    }
}

pub fn agent_home() -> Result<PathBuf> {
    let base = dirs::data_local_dir()
        .or_else(dirs::cache_dir)
        .or_else(dirs::home_dir)
        .ok_or_else(|| anyhow::anyhow!("Failed to resolve data directory"))?;
    Ok(base.join("xyzzy-agent"))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureKind {
    Transaction,
    TraceEntry,
    #[default]
    Timer,
    Other,
}

impl CaptureKind {
    /// Timer, trace entry and transaction all start a timer.
    pub fn captures_timer(self) -> bool {
        !matches!(self, CaptureKind::Other)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlreadyInTransactionBehavior {
    #[default]
    CaptureTraceEntry,
    CaptureNewTransaction,
    DoNothing,
}

/// One advice declaration: a pointcut plus what to capture when it fires.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdviceConfig {
    #[serde(flatten)]
    pub pointcut: PointcutSpec,
    pub capture_kind: CaptureKind,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub transaction_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub transaction_name_template: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub transaction_user_template: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub transaction_attribute_templates: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_slow_threshold_millis: Option<u64>,
    pub already_in_transaction_behavior: AlreadyInTransactionBehavior,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub trace_entry_message_template: String,
    pub trace_entry_capture_self_nested: bool,
    /// Registered handler name for capture kind `other`.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub handler: String,
}

impl AdviceConfig {
    pub fn validation_errors(&self) -> Vec<String> {
        let p = &self.pointcut;
        let mut errors = Vec::new();
        if p.class_name.is_empty() && p.class_annotation.is_empty() {
            errors.push("className and classAnnotation are both empty".to_string());
        }
        if p.method_name.is_empty() && p.method_annotation.is_empty() {
            errors.push("methodName and methodAnnotation are both empty".to_string());
        }
        if self.capture_kind.captures_timer() && p.timer_name.is_empty() {
            errors.push("timerName is empty".to_string());
        }
        if !p
            .timer_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == ' ')
        {
            errors.push(format!("timerName contains invalid characters: {}", p.timer_name));
        }
        if self.capture_kind == CaptureKind::TraceEntry && self.trace_entry_message_template.is_empty() {
            errors.push("traceEntryMessageTemplate is empty".to_string());
        }
        if self.capture_kind == CaptureKind::Transaction {
            if self.transaction_type.is_empty() {
                errors.push("transactionType is empty".to_string());
            }
            if self.transaction_name_template.is_empty() {
                errors.push("transactionNameTemplate is empty".to_string());
            }
        }
        if self.capture_kind == CaptureKind::Other && self.handler.is_empty() {
            errors.push("handler is empty".to_string());
        }
        if p.method_name == "<init>" && self.capture_kind != CaptureKind::Other {
            errors.push("constructor pointcuts only support captureKind other".to_string());
        }
        if p.method_name == "<clinit>" {
            errors.push("static initializers cannot be instrumented".to_string());
        }
        if let Err(e) = PointcutDescriptor::try_from(p.clone()) {
            errors.push(e.to_string());
        }
        errors
    }

    pub fn is_valid(&self) -> bool {
        self.validation_errors().is_empty()
    }

    /// Stable content hash, used to tell whether woven code reflects this
    /// exact configuration.
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

/// Rejects the whole list when any entry is invalid.
pub fn validate_advice_configs(configs: &[AdviceConfig]) -> Result<(), ConfigError> {
    for (index, config) in configs.iter().enumerate() {
        let errors = config.validation_errors();
        if !errors.is_empty() {
            return Err(ConfigError::InvalidAdvice { index, errors });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    String,
    Boolean,
    Double,
    List,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub property_type: PropertyType,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub default: serde_json::Value,
    #[serde(default)]
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentationDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub properties: Vec<PropertyDescriptor>,
    #[serde(default)]
    pub advice: Vec<AdviceConfig>,
}

pub fn read_descriptor(path: &Path) -> Result<InstrumentationDescriptor> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read instrumentation descriptor: {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse instrumentation descriptor: {}", path.display()))
}

/// Accepts either a single descriptor or a descriptor list document.
pub fn read_descriptors(path: &Path) -> Result<Vec<InstrumentationDescriptor>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read instrumentation file: {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse instrumentation file: {}", path.display()))?;
    if value.is_array() {
        Ok(serde_json::from_value(value)?)
    } else {
        Ok(vec![serde_json::from_value(value)?])
    }
}

pub fn read_descriptor_from_jar(jar_path: &Path) -> Result<Option<InstrumentationDescriptor>> {
    let file = File::open(jar_path)
        .with_context(|| format!("Failed to open jar: {}", jar_path.display()))?;
    // SAFETY: read-only mapping that lives only for the duration of this call.
    let mmap = unsafe { Mmap::map(&file) }
        .with_context(|| format!("Failed to mmap jar: {}", jar_path.display()))?;
    let mut archive = ZipArchive::new(Cursor::new(&mmap[..]))
        .with_context(|| format!("Failed to read zip structure: {}", jar_path.display()))?;
    let Ok(mut entry) = archive.by_name(JAR_DESCRIPTOR_ENTRY) else {
        return Ok(None);
    };
    let mut text = String::new();
    entry.read_to_string(&mut text)?;
    let descriptor = serde_json::from_str(&text).with_context(|| {
        format!("Failed to parse {JAR_DESCRIPTOR_ENTRY} in {}", jar_path.display())
    })?;
    Ok(Some(descriptor))
}

/// Descriptors from loose `xyzzy.instrumentation.json` files and plugin jars
/// under `dir`, sorted by id.
pub fn collect_descriptors(dir: &Path) -> Result<Vec<InstrumentationDescriptor>> {
    let mut descriptors = Vec::new();
    for path in scan_named_files(dir, DESCRIPTOR_FILE)? {
        descriptors.push(read_descriptor(&path)?);
    }
    for jar in scan_jars(dir)? {
        if let Some(d) = read_descriptor_from_jar(&jar)? {
            descriptors.push(d);
        }
    }
    descriptors.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(descriptors)
}

/// Duplicate ids and invalid advice are both fatal for the whole set.
pub fn validate_descriptors(descriptors: &[InstrumentationDescriptor]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for d in descriptors {
        if !seen.insert(d.id.as_str()) {
            return Err(ConfigError::DuplicateId(d.id.clone()));
        }
        validate_advice_configs(&d.advice)?;
    }
    Ok(())
}
