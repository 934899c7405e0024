use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};
use xyzzy_agent::classfile::builder::ClassBuilder;
use xyzzy_agent::classfile::{ACC_PRIVATE, ACC_PUBLIC, ACC_STATIC};

const BRIDGE: &[u8] = b"org/xyzzy/agent/bridge/AdviceBridge";

fn temp_dir(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    std::env::temp_dir().join(format!("xyzzy_it_{}_{}_{}", std::process::id(), nanos, name))
}

fn write_file(path: &Path, content: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

fn write_jar(path: &Path, entries: &[(&str, Vec<u8>)]) -> anyhow::Result<()> {
    use std::io::Write;
    use zip::write::FileOptions;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
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

fn read_jar_entry(path: &Path, name: &str) -> anyhow::Result<Vec<u8>> {
    use std::io::Read;
    let mut archive = zip::ZipArchive::new(std::fs::File::open(path)?)?;
    let mut entry = archive.by_name(name)?;
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes)?;
    Ok(bytes)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn run(args: &[&str]) -> anyhow::Result<Output> {
    let bin = env!("CARGO_BIN_EXE_xyzzy-agent");
    Ok(Command::new(bin).args(args).env("XYZZY_AGENT_CONFIG", "").output()?)
}

fn run_json(args: &[&str]) -> anyhow::Result<Value> {
    let out = run(args)?;
    if !out.status.success() {
        return Err(anyhow::anyhow!(
            "command failed: status={:?}, stderr={}",
            out.status.code(),
            String::from_utf8_lossy(&out.stderr)
        ));
    }
    Ok(serde_json::from_slice(&out.stdout)?)
}

fn app_jar(path: &Path) -> anyhow::Result<()> {
    let handler = ClassBuilder::new("com/example/Handler", "java/lang/Object")
        .method(ACC_PUBLIC, "<init>", "()V", 0, 1, vec![0xb1])
        .method(ACC_PUBLIC, "handle", "(Ljava/lang/String;)V", 0, 2, vec![0xb1])
        .method(ACC_PRIVATE, "handleLater", "(J)V", 0, 3, vec![0xb1])
        .method(ACC_PUBLIC | ACC_STATIC, "create", "()Ljava/lang/Object;", 1, 0, vec![0x01, 0xb0])
        .build()?;
    let other = ClassBuilder::new("com/example/Other", "java/lang/Object").build()?;
    write_jar(
        path,
        &[
            ("META-INF/MANIFEST.MF", b"Manifest-Version: 1.0\n".to_vec()),
            ("com/example/Handler.class", handler),
            ("com/example/Other.class", other),
        ],
    )
}

const INSTRUMENTATION: &str = r#"{
  "id": "handler",
  "name": "Handler",
  "advice": [
    {
      "className": "com.example.Handler",
      "methodName": "handle",
      "methodParameterTypes": [".."],
      "captureKind": "timer",
      "timerName": "handle"
    }
  ]
}"#;

#[test]
fn weave_rewrites_matching_classes_and_keeps_other_entries() -> anyhow::Result<()> {
    let base = temp_dir("weave");
    let input = base.join("app.jar");
    let output = base.join("out").join("app-woven.jar");
    let instrumentation = base.join("handler.json");
    app_jar(&input)?;
    write_file(&instrumentation, INSTRUMENTATION)?;

    let report = run_json(&[
        "weave",
        input.to_string_lossy().as_ref(),
        "--instrumentation",
        instrumentation.to_string_lossy().as_ref(),
        "-o",
        output.to_string_lossy().as_ref(),
    ])?;
    assert_eq!(report["classes_woven"], Value::from(1));
    assert_eq!(report["classes_unchanged"], Value::from(1));
    assert_eq!(report["classes_failed"], Value::from(0));

    assert!(contains(&read_jar_entry(&output, "com/example/Handler.class")?, BRIDGE));
    assert!(!contains(&read_jar_entry(&output, "com/example/Other.class")?, BRIDGE));
    assert_eq!(read_jar_entry(&output, "META-INF/MANIFEST.MF")?, b"Manifest-Version: 1.0\n");

    std::fs::remove_dir_all(&base)?;
    Ok(())
}

#[test]
fn auto_complete_queries_read_the_classpath() -> anyhow::Result<()> {
    let base = temp_dir("complete");
    let jar = base.join("lib").join("app.jar");
    app_jar(&jar)?;
    let classpath = base.join("lib");
    let cp = classpath.to_string_lossy().to_string();

    let classes = run_json(&["classes", "handler", "--classpath", &cp])?;
    assert_eq!(classes["classes"], serde_json::json!(["com.example.Handler"]));

    let methods = run_json(&["methods", "com.example.Handler", "HANDLE", "--classpath", &cp])?;
    assert_eq!(methods["methods"], serde_json::json!(["handle", "handleLater"]));

    let signatures = run_json(&["signatures", "com.example.Handler", "handleLater", "--classpath", &cp])?;
    assert_eq!(
        signatures["signatures"],
        serde_json::json!([{
            "name": "handleLater",
            "parameterTypes": ["long"],
            "returnType": "void",
            "modifiers": ["private"]
        }])
    );

    std::fs::remove_dir_all(&base)?;
    Ok(())
}

#[test]
fn validate_fails_on_invalid_advice() -> anyhow::Result<()> {
    let base = temp_dir("validate");
    let good = base.join("good.json");
    let bad = base.join("bad.json");
    write_file(&good, INSTRUMENTATION)?;
    write_file(
        &bad,
        r#"{"id":"bad","name":"Bad","advice":[{"className":"com.example.Handler","captureKind":"trace-entry","timerName":"x"}]}"#,
    )?;

    let ok = run_json(&["validate", good.to_string_lossy().as_ref()])?;
    assert_eq!(ok["valid"], Value::Bool(true));

    let out = run(&["validate", bad.to_string_lossy().as_ref()])?;
    assert!(!out.status.success());
    let report: Value = serde_json::from_slice(&out.stdout)?;
    assert_eq!(report["valid"], Value::Bool(false));
    let errors = &report["files"][0]["descriptors"][0]["invalid"][0]["errors"];
    assert_eq!(errors.as_array().map(|e| e.len()), Some(2));

    std::fs::remove_dir_all(&base)?;
    Ok(())
}

#[test]
fn list_gathers_loose_and_jar_descriptors() -> anyhow::Result<()> {
    let base = temp_dir("list");
    let plugins = base.join("plugins");
    write_file(&plugins.join("handler").join("xyzzy.instrumentation.json"), INSTRUMENTATION)?;
    write_jar(
        &plugins.join("jdbc-plugin.jar"),
        &[(
            "META-INF/xyzzy.instrumentation.json",
            br#"{"id":"jdbc","name":"JDBC","advice":[]}"#.to_vec(),
        )],
    )?;
    let output = base.join("list.json");

    let out = run(&[
        "list",
        "--dir",
        plugins.to_string_lossy().as_ref(),
        "-o",
        output.to_string_lossy().as_ref(),
    ])?;
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let list: Value = serde_json::from_str(&std::fs::read_to_string(&output)?)?;
    let ids: Vec<&str> = list
        .as_array()
        .map(|a| a.iter().filter_map(|d| d["id"].as_str()).collect())
        .unwrap_or_default();
    assert_eq!(ids, vec!["handler", "jdbc"]);

    std::fs::remove_dir_all(&base)?;
    Ok(())
}
