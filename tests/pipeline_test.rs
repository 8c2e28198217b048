//! Install-Time Pipeline Integration Tests
//!
//! Rejection paths run without an interpreter. Tests that reach the sandbox
//! skip when no suitable `python3` is installed.

use serde_json::json;
use skillgate::skills::quarantine::{QuarantineError, ReleaseLedger, RELEASE_SOURCE, RELEASE_TRUST};
use skillgate::skills::report::{SkillReport, REPORT_FILE};
use skillgate::skills::types::{ExecutionStatus, FailureKind};
use skillgate::{Config, InvocationPolicy, QuarantineStore, SkillGate, SkillSandbox};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

fn python_available() -> bool {
    std::process::Command::new("python3")
        .args(["-c", "import sys; sys.exit(0 if sys.version_info >= (3, 8) else 1)"])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn test_config(tmp: &TempDir) -> Config {
    let mut config = Config::from_sources(None, |_| None);
    config.work_dir = tmp.path().join("work");
    config.install_dir = tmp.path().join("installed");
    config.quarantine_db = tmp.path().join("quarantine.db");
    config.sandbox_timeout = Duration::from_secs(3);
    config
}

fn create_gate(tmp: &TempDir) -> (SkillGate, Arc<QuarantineStore>) {
    gate_with(test_config(tmp))
}

fn gate_with(config: Config) -> (SkillGate, Arc<QuarantineStore>) {
    let quarantine = Arc::new(QuarantineStore::in_memory());
    let gate = SkillGate::new(
        config.gate_settings(),
        Arc::new(SkillSandbox::new(config.sandbox_config())),
        quarantine.clone(),
        InvocationPolicy::TrustInstall,
    );
    (gate, quarantine)
}

fn write_zip(path: &Path, members: &[(&str, &str)]) -> PathBuf {
    let file = fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    for (name, content) in members {
        zip.start_file(*name, SimpleFileOptions::default()).unwrap();
        zip.write_all(content.as_bytes()).unwrap();
    }
    zip.finish().unwrap();
    path.to_path_buf()
}

fn write_dir(root: &Path, files: &[(&str, &str)]) -> PathBuf {
    for (rel, content) in files {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
    root.to_path_buf()
}

const SCENARIO_B: &str = r#"import subprocess

def execute(context):
    subprocess.run("ls -la", shell=True)
    return {"success": True}
"#;

#[tokio::test]
async fn test_scenario_b_rejected_before_sandbox() {
    let tmp = TempDir::new().unwrap();
    let (gate, quarantine) = create_gate(&tmp);
    let archive = write_zip(&tmp.path().join("b.zip"), &[("skill.py", SCENARIO_B)]);

    let report = gate.validate_archive(&archive).await.unwrap();

    assert!(!report.ok);
    assert!(!report.verdict.ok);
    assert_eq!(report.failure, Some(FailureKind::Security));
    assert!(report.outcome.is_none(), "sandbox must not run");
    assert!(report.purity.is_none());
    let reasons = report.reasons().join("\n");
    assert!(reasons.contains("forbidden import: subprocess"), "{}", reasons);
    assert!(reasons.contains("possible command execution: subprocess.run()"), "{}", reasons);

    let entries = quarantine.list().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].reason, "security_violation");
    assert_eq!(report.quarantine_id.as_deref(), Some(entries[0].id.as_str()));
    assert!(!tmp.path().join("installed").join("skill").exists());
}

#[tokio::test]
async fn test_banned_builtin_short_circuits() {
    let tmp = TempDir::new().unwrap();
    let (gate, _) = create_gate(&tmp);
    let src = write_dir(
        &tmp.path().join("src"),
        &[("skill.py", "def execute(context):\n    return {\"success\": eval(\"True\")}\n")],
    );

    let report = gate.validate_dir(&src).await.unwrap();
    assert!(!report.ok);
    assert_eq!(report.failure, Some(FailureKind::Security));
    assert!(report.outcome.is_none());
    assert!(report.reasons()[0].contains("forbidden call: eval()"));
}

#[tokio::test]
async fn test_annotation_code_rejected() {
    let tmp = TempDir::new().unwrap();
    let (gate, _) = create_gate(&tmp);
    let src = write_dir(
        &tmp.path().join("src"),
        &[(
            "skill.py",
            "def execute(context: eval(\"dict\")) -> exec(\"x = 1\"):\n    return {\"success\": True}\n",
        )],
    );

    let report = gate.validate_dir(&src).await.unwrap();
    assert_eq!(report.failure, Some(FailureKind::Security));
    assert!(report.outcome.is_none());
    let reasons = report.reasons().join("\n");
    assert!(reasons.contains("forbidden call: eval()"), "{}", reasons);
    assert!(reasons.contains("forbidden call: exec()"), "{}", reasons);
}

#[tokio::test]
async fn test_impure_helper_module_rejected() {
    let tmp = TempDir::new().unwrap();
    let (gate, _) = create_gate(&tmp);
    let src = write_dir(
        &tmp.path().join("src"),
        &[
            ("skill.py", "from helper import think\n\ndef execute(context):\n    return {\"success\": True, \"result\": think(context)}\n"),
            ("helper.py", "import anthropic\n\nCACHE = {}\nhits = 0\n\ndef think(context):\n    global hits\n    hits += 1\n    return CACHE.get(context.get('q'))\n"),
        ],
    );

    let report = gate.validate_dir(&src).await.unwrap();
    assert_eq!(report.failure, Some(FailureKind::Purity));
    assert!(report.outcome.is_none());
    let purity = report.purity.unwrap();
    assert!(purity.violations.iter().all(|f| f.file.as_deref() == Some("helper.py")));
    assert!(purity.violations.iter().any(|f| f.code == "global_state"));
}

#[tokio::test]
async fn test_syntax_error_reported_separately() {
    let tmp = TempDir::new().unwrap();
    let (gate, _) = create_gate(&tmp);
    let src = write_dir(&tmp.path().join("src"), &[("skill.py", "def execute(context:\n    return {}\n")]);

    let report = gate.validate_dir(&src).await.unwrap();
    assert_eq!(report.failure, Some(FailureKind::Syntax));
    let analysis = report.analysis.unwrap();
    let err = analysis.syntax_error.unwrap();
    assert_eq!(err.file, "skill.py");
    assert!(analysis.violations.is_empty());
}

#[tokio::test]
async fn test_purity_rejection_quarantined() {
    let tmp = TempDir::new().unwrap();
    let (gate, quarantine) = create_gate(&tmp);
    let src = write_dir(
        &tmp.path().join("src"),
        &[(
            "skill.py",
            "def execute(context):\n    reply = ask_llm(context.get('q'))\n    return {\"success\": True, \"result\": reply}\n",
        )],
    );

    let report = gate.validate_dir(&src).await.unwrap();
    assert!(!report.ok);
    assert!(!report.verdict.ok, "every rejection clears the verdict");
    assert!(report.analysis.as_ref().unwrap().passed(), "static analysis passed");
    assert_eq!(report.failure, Some(FailureKind::Purity));
    assert!(report.outcome.is_none());
    assert_eq!(quarantine.list().unwrap()[0].reason, "purity_violation");
}

#[tokio::test]
async fn test_caller_directory_untouched() {
    let tmp = TempDir::new().unwrap();
    let (gate, _) = create_gate(&tmp);
    let src = write_dir(&tmp.path().join("src"), &[("tool.py", SCENARIO_B)]);

    gate.validate_dir(&src).await.unwrap();

    let names: Vec<String> = fs::read_dir(&src)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["tool.py".to_string()]);
    let leftovers = fs::read_dir(tmp.path().join("work")).map(|d| d.count()).unwrap_or(0);
    assert_eq!(leftovers, 0, "staging copies are removed");
}

#[tokio::test]
async fn test_packaging_rejections() {
    let tmp = TempDir::new().unwrap();
    let (gate, quarantine) = create_gate(&tmp);

    let not_zip = tmp.path().join("skill.tar");
    fs::write(&not_zip, b"whatever").unwrap();
    let report = gate.validate_archive(&not_zip).await.unwrap();
    assert_eq!(report.failure, Some(FailureKind::Packaging));
    assert!(report.reasons()[0].contains("not a .zip file"));

    let traversal = write_zip(
        &tmp.path().join("evil.zip"),
        &[("skill.py", "def execute(context):\n    return {\"success\": True}\n"), ("../evil.py", "x")],
    );
    let report = gate.validate_archive(&traversal).await.unwrap();
    assert_eq!(report.failure, Some(FailureKind::Packaging));
    assert!(report.reasons()[0].contains("parent directory segment"));
    assert!(!tmp.path().join("work").join("evil.py").exists());

    let empty = write_zip(&tmp.path().join("empty.zip"), &[("README.md", "nothing here")]);
    let report = gate.validate_archive(&empty).await.unwrap();
    assert_eq!(report.failure, Some(FailureKind::Packaging));
    assert!(report.reasons()[0].contains("no entrypoint detected"));

    assert_eq!(quarantine.list().unwrap().len(), 3);
}

#[tokio::test]
async fn test_compiled_member_rejected() {
    let tmp = TempDir::new().unwrap();
    let (gate, quarantine) = create_gate(&tmp);
    let archive = write_zip(
        &tmp.path().join("cached.zip"),
        &[
            ("skill.py", "import helper\n\ndef execute(context):\n    return helper.run(context)\n"),
            ("__pycache__/helper.cpython-311.pyc", "compiled"),
        ],
    );

    let report = gate.validate_archive(&archive).await.unwrap();
    assert!(!report.ok);
    assert_eq!(report.failure, Some(FailureKind::Packaging));
    assert!(report.reasons()[0].contains("compiled or native code members"));
    assert!(report.reasons()[0].contains("helper.cpython-311.pyc"));
    assert!(report.outcome.is_none());
    assert_eq!(quarantine.list().unwrap().len(), 1);
}

#[tokio::test]
async fn test_run_refuses_rejected_skill() {
    let tmp = TempDir::new().unwrap();
    // an interpreter that cannot start shows whether the sandbox was reached
    let mut config = test_config(&tmp);
    config.python = "definitely-not-a-python-binary".to_string();
    let (gate, quarantine) = gate_with(config);

    let dangerous = write_dir(&tmp.path().join("danger"), &[("skill.py", SCENARIO_B)]);
    let outcome = gate.test(&dangerous, None).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Failure);
    assert!(!outcome.success);
    let error = outcome.error.unwrap_or_default();
    assert!(error.starts_with("refused before sandbox (security_violation)"), "{}", error);
    assert!(error.contains("forbidden import: subprocess"), "{}", error);

    let impure = write_dir(
        &tmp.path().join("impure"),
        &[("skill.py", "def execute(context):\n    return {\"success\": True, \"result\": ask_llm(context)}\n")],
    );
    let error = gate.test(&impure, None).await.unwrap().error.unwrap_or_default();
    assert!(error.starts_with("refused before sandbox (purity_violation)"), "{}", error);

    assert!(quarantine.list().unwrap().is_empty(), "test runs do not quarantine");
}

#[tokio::test]
async fn test_release_after_rejection() {
    let tmp = TempDir::new().unwrap();
    let (gate, quarantine) = create_gate(&tmp);
    let archive = write_zip(&tmp.path().join("b.zip"), &[("skill.py", SCENARIO_B)]);
    let report = gate.validate_archive(&archive).await.unwrap();
    let id = report.quarantine_id.unwrap();
    let original = quarantine.get(&id).unwrap().unwrap();

    let ledger = ReleaseLedger::new(tmp.path().join("released.jsonl"));
    let released = quarantine.release(&id, &ledger).unwrap();
    assert_eq!(released.trust_score, RELEASE_TRUST);
    assert_ne!(released.trust_score, original.trust_score);
    assert!(quarantine.list().unwrap().is_empty());

    let ledger_text = fs::read_to_string(ledger.path()).unwrap();
    let line: serde_json::Value = serde_json::from_str(ledger_text.trim()).unwrap();
    assert_eq!(line["source"], RELEASE_SOURCE);
    assert_eq!(line["content"], original.content);

    assert!(matches!(
        quarantine.release(&id, &ledger),
        Err(QuarantineError::NotFound(_))
    ));
    assert_eq!(fs::read_to_string(ledger.path()).unwrap().lines().count(), 1);
}

#[tokio::test]
async fn test_scenario_a_approved_and_installed() {
    if !python_available() {
        eprintln!("python3 >= 3.8 not available, skipping");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let (gate, quarantine) = create_gate(&tmp);
    let archive = write_zip(
        &tmp.path().join("hello.zip"),
        &[("hello.py", "def execute(context):\n    return {\"success\": True}\n")],
    );

    let report = gate.validate_archive(&archive).await.unwrap();

    assert!(report.ok, "{:?}", report.reasons());
    assert!(report.verdict.ok);
    assert!(report.verdict.permissions.is_empty());
    assert_eq!(report.verdict.skill_id, "hello");
    let outcome = report.outcome.as_ref().unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Success);
    assert_eq!(outcome.result, Some(json!({"success": true})));
    assert!(outcome.blocked_calls.is_empty());
    assert!(quarantine.list().unwrap().is_empty());

    let installed = report.installed_at.unwrap();
    assert!(installed.join("hello.py").is_file());
    assert!(installed.join("entrypoint.json").is_file());
    assert!(installed.join(REPORT_FILE).is_file());

    let saved = SkillReport::load(&installed).unwrap();
    assert!(saved.ok);
    let stages: Vec<&str> = saved.stages.iter().map(|s| s.stage.as_str()).collect();
    assert_eq!(stages, vec!["normalize", "static_analysis", "purity", "sandbox"]);
    assert!(saved.permissions.is_empty());
}

#[tokio::test]
async fn test_declarative_skill_approved() {
    if !python_available() {
        eprintln!("python3 >= 3.8 not available, skipping");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let (gate, _) = create_gate(&tmp);
    let src = write_dir(
        &tmp.path().join("greeter"),
        &[("skill.yaml", "name: Greeter\nmessage: Hello there\n")],
    );

    let report = gate.validate_dir(&src).await.unwrap();
    assert!(report.ok, "{:?}", report.reasons());
    assert_eq!(report.verdict.skill_id, "greeter");
    let result = report.outcome.unwrap().result.unwrap();
    assert_eq!(result, json!({"success": true, "message": "Hello there"}));
}

#[tokio::test]
async fn test_looping_skill_times_out() {
    if !python_available() {
        eprintln!("python3 >= 3.8 not available, skipping");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    config.sandbox_timeout = Duration::from_secs(1);
    let (gate, quarantine) = gate_with(config);
    let src = write_dir(
        &tmp.path().join("spin"),
        &[(
            "skill.py",
            "def execute(context):\n    n = 0\n    while True:\n        n += 1\n    return {\"success\": True, \"result\": n}\n",
        )],
    );

    let report = gate.validate_dir(&src).await.unwrap();
    assert!(!report.ok);
    assert_eq!(report.failure, Some(FailureKind::Timeout));
    assert_eq!(report.outcome.unwrap().status, ExecutionStatus::Timeout);
    assert_eq!(quarantine.list().unwrap()[0].reason, "timeout");
    assert!(!tmp.path().join("installed").join("skill").exists());
}

#[tokio::test]
async fn test_reinstall_replaces_previous_version() {
    if !python_available() {
        eprintln!("python3 >= 3.8 not available, skipping");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let (gate, _) = create_gate(&tmp);
    let manifest = |version: &str| {
        format!(r#"{{"id": "hello", "name": "Hello", "version": "{}"}}"#, version)
    };

    for version in ["1.0", "2.0"] {
        let src = write_dir(
            &tmp.path().join(format!("hello-{}", version)),
            &[
                ("skill.py", "def execute(context):\n    return {\"success\": True}\n"),
                ("manifest.json", &manifest(version)),
            ],
        );
        let report = gate.validate_dir(&src).await.unwrap();
        assert!(report.ok, "{:?}", report.reasons());
    }

    let installed = tmp.path().join("installed");
    let saved = SkillReport::load(&installed.join("hello")).unwrap();
    assert_eq!(saved.version, "2.0");
    let names: Vec<String> = fs::read_dir(&installed)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["hello".to_string()], "no temp or backup dirs remain");
}

#[tokio::test]
async fn test_caught_deadline_not_installed() {
    if !python_available() {
        eprintln!("python3 >= 3.8 not available, skipping");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    config.sandbox_timeout = Duration::from_secs(1);
    let (gate, quarantine) = gate_with(config);
    let src = write_dir(
        &tmp.path().join("stubborn"),
        &[(
            "skill.py",
            "import time\n\ndef execute(context):\n    try:\n        time.sleep(30)\n    except BaseException:\n        pass\n    return {\"success\": True}\n",
        )],
    );

    let report = gate.validate_dir(&src).await.unwrap();
    assert!(!report.ok);
    assert_eq!(report.failure, Some(FailureKind::Timeout));
    assert!(report.installed_at.is_none());
    assert_eq!(quarantine.list().unwrap()[0].reason, "timeout");
}
