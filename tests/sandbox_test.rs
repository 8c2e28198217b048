//! Sandbox Runner Integration Tests
//!
//! These spawn a real interpreter and skip when `python3` >= 3.8 is missing.

use serde_json::json;
use skillgate::skills::types::{EntrypointRecord, ExecutionStatus, Permission};
use skillgate::skills::{SandboxConfig, SkillSandbox};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

fn python_available() -> bool {
    std::process::Command::new("python3")
        .args(["-c", "import sys; sys.exit(0 if sys.version_info >= (3, 8) else 1)"])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn create_sandbox(tmp: &TempDir) -> SkillSandbox {
    SkillSandbox::new(SandboxConfig {
        work_dir: tmp.path().join("work"),
        ..Default::default()
    })
}

fn skill_dir(tmp: &TempDir, source: &str) -> PathBuf {
    let dir = tmp.path().join("skill");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("skill.py"), source).unwrap();
    dir
}

fn no_permissions() -> BTreeSet<Permission> {
    BTreeSet::new()
}

async fn run(sandbox: &SkillSandbox, dir: &Path, context: serde_json::Value) -> skillgate::skills::ExecutionOutcome {
    sandbox
        .test_skill(
            dir,
            &EntrypointRecord::default(),
            &context,
            Duration::from_secs(3),
            &no_permissions(),
        )
        .await
}

#[tokio::test]
async fn test_context_round_trip() {
    if !python_available() {
        eprintln!("python3 >= 3.8 not available, skipping");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let sandbox = create_sandbox(&tmp);
    let dir = skill_dir(
        &tmp,
        "def execute(context):\n    return {\"success\": True, \"result\": context.get(\"city\", \"\").upper()}\n",
    );

    let outcome = run(&sandbox, &dir, json!({"action": "lookup", "city": "oslo"})).await;

    assert_eq!(outcome.status, ExecutionStatus::Success);
    assert!(outcome.success);
    assert_eq!(outcome.result, Some(json!({"success": true, "result": "OSLO"})));
    assert!(outcome.blocked_calls.is_empty());
    let scratch_left = fs::read_dir(tmp.path().join("work")).map(|d| d.count()).unwrap_or(0);
    assert_eq!(scratch_left, 0, "scratch directories are removed");
}

#[tokio::test]
async fn test_print_goes_to_stderr() {
    if !python_available() {
        eprintln!("python3 >= 3.8 not available, skipping");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let sandbox = create_sandbox(&tmp);
    let dir = skill_dir(
        &tmp,
        "def execute(context):\n    print(\"chatty skill\")\n    return {\"success\": True}\n",
    );

    let outcome = run(&sandbox, &dir, json!({})).await;

    assert_eq!(outcome.status, ExecutionStatus::Success);
    assert!(outcome.stderr.contains("chatty skill"));
    assert_eq!(outcome.result, Some(json!({"success": true})));
}

#[tokio::test]
async fn test_swallowed_write_still_blocked() {
    if !python_available() {
        eprintln!("python3 >= 3.8 not available, skipping");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let sandbox = create_sandbox(&tmp);
    let target = tmp.path().join("outside.txt");
    let source = format!(
        "def execute(context):\n    try:\n        with open({:?}, \"w\") as f:\n            f.write(\"x\")\n    except Exception:\n        pass\n    return {{\"success\": True}}\n",
        target.to_string_lossy()
    );
    let dir = skill_dir(&tmp, &source);

    let outcome = run(&sandbox, &dir, json!({})).await;

    assert!(!target.exists());
    assert_eq!(outcome.blocked_calls.len(), 1);
    assert_eq!(outcome.blocked_calls[0].category, "fs_write");
    assert!(outcome.blocked_calls[0].blocked);
}

#[tokio::test]
async fn test_socket_blocked_without_permission() {
    if !python_available() {
        eprintln!("python3 >= 3.8 not available, skipping");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let sandbox = create_sandbox(&tmp);
    let dir = skill_dir(
        &tmp,
        "import socket\n\ndef execute(context):\n    s = socket.socket()\n    s.close()\n    return {\"success\": True}\n",
    );

    let outcome = run(&sandbox, &dir, json!({})).await;

    assert_eq!(outcome.status, ExecutionStatus::Failure);
    assert!(outcome.error.unwrap_or_default().contains("PermissionError"));
    assert!(outcome.blocked_calls.iter().any(|b| b.category == "network"));
}

#[tokio::test]
async fn test_raised_exception_is_failure() {
    if !python_available() {
        eprintln!("python3 >= 3.8 not available, skipping");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let sandbox = create_sandbox(&tmp);
    let dir = skill_dir(&tmp, "def execute(context):\n    raise ValueError(\"bad input\")\n");

    let outcome = run(&sandbox, &dir, json!({})).await;

    assert_eq!(outcome.status, ExecutionStatus::Failure);
    assert!(!outcome.success);
    assert_eq!(outcome.error.as_deref(), Some("ValueError: bad input"));
    assert!(outcome.trace.is_some());
}

#[tokio::test]
async fn test_sleeping_skill_hits_deadline() {
    if !python_available() {
        eprintln!("python3 >= 3.8 not available, skipping");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let sandbox = create_sandbox(&tmp);
    let dir = skill_dir(
        &tmp,
        "import time\n\ndef execute(context):\n    time.sleep(30)\n    return {\"success\": True}\n",
    );

    let started = std::time::Instant::now();
    let outcome = sandbox
        .test_skill(
            &dir,
            &EntrypointRecord::default(),
            &json!({}),
            Duration::from_secs(1),
            &no_permissions(),
        )
        .await;

    assert_eq!(outcome.status, ExecutionStatus::Timeout);
    assert!(!outcome.success);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_caught_deadline_still_times_out() {
    if !python_available() {
        eprintln!("python3 >= 3.8 not available, skipping");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let sandbox = create_sandbox(&tmp);
    let dir = skill_dir(
        &tmp,
        "import time\n\ndef execute(context):\n    try:\n        time.sleep(30)\n    except BaseException:\n        pass\n    return {\"success\": True, \"result\": \"survived\"}\n",
    );

    let outcome = sandbox
        .test_skill(
            &dir,
            &EntrypointRecord::default(),
            &json!({}),
            Duration::from_secs(1),
            &no_permissions(),
        )
        .await;

    assert_eq!(outcome.status, ExecutionStatus::Timeout);
    assert!(!outcome.success);
    assert!(outcome.result.is_none());
}

#[tokio::test]
async fn test_forged_reply_rejected() {
    if !python_available() {
        eprintln!("python3 >= 3.8 not available, skipping");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let sandbox = create_sandbox(&tmp);
    let dir = skill_dir(
        &tmp,
        concat!(
            "import os\n\n",
            "def execute(context):\n",
            "    line = b'{\"status\": \"success\", \"success\": true, \"result\": \"forged\"}\\n'\n",
            "    for fd in range(3, 20):\n",
            "        try:\n",
            "            os.write(fd, line)\n",
            "        except OSError:\n",
            "            pass\n",
            "    os._exit(0)\n",
        ),
    );

    let outcome = run(&sandbox, &dir, json!({})).await;

    assert_eq!(outcome.status, ExecutionStatus::Failure);
    assert!(!outcome.success);
    assert!(
        outcome.error.unwrap_or_default().starts_with("sandbox protocol error"),
        "forged line must not be taken as the reply"
    );
}

#[tokio::test]
async fn test_frame_walk_blocked() {
    if !python_available() {
        eprintln!("python3 >= 3.8 not available, skipping");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let sandbox = create_sandbox(&tmp);
    let dir = skill_dir(
        &tmp,
        "import sys\n\ndef execute(context):\n    caller = sys._getframe(1)\n    return {\"success\": True, \"result\": sorted(caller.f_locals)}\n",
    );

    let outcome = run(&sandbox, &dir, json!({})).await;

    assert_eq!(outcome.status, ExecutionStatus::Failure);
    assert!(outcome.blocked_calls.iter().any(|b| b.category == "introspection"));
}
