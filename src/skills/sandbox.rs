//! Sandbox Runner
//!
//! Executes a skill's entry function in a fresh Python interpreter:
//! - Cleared environment with a small allowlist of benign variables
//! - Private scratch working directory, removed afterwards
//! - Embedded harness with an audit-hook behaviour monitor
//! - Graceful deadline inside the harness, forced kill outside it
//! - Output limits on captured stdout/stderr
//!
//! # Protocol
//!
//! One JSON request is written to the child's stdin, then stdin is closed.
//! The harness answers with exactly one JSON line on a private duplicate of
//! stdout; anything the skill prints lands on stderr. The request carries a
//! per-run nonce which the reply must echo, and any other output on that
//! channel is a protocol error.
//!
//! The deadline is enforced twice: the harness answers `timeout` and exits
//! from its alarm handler, and a reply whose own elapsed time reaches the
//! deadline is a timeout whatever status it claims.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::execution::{InvocationError, SkillInvoker};
use super::types::{
    BehaviorEvent, EntrypointRecord, ExecutionOutcome, ExecutionStatus, ExtractedSkill, Permission,
};

/// Harness source run with `python3 -I -B -c`
const HARNESS: &str = include_str!("sandbox_harness.py");

/// Sandbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Interpreter binary
    pub python: String,
    /// Deadline for one run
    pub timeout: Duration,
    /// Extra wait after the deadline before the child is killed
    pub kill_grace: Duration,
    /// Parent of per-run scratch directories
    pub work_dir: PathBuf,
    /// Maximum captured stdout in bytes (stderr gets a quarter)
    pub max_output_bytes: usize,
    /// Environment variables passed through from the host
    pub allowed_env_vars: HashSet<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            timeout: Duration::from_secs(4),
            kill_grace: Duration::from_secs(1),
            work_dir: std::env::temp_dir().join("skillgate"),
            max_output_bytes: 1024 * 1024, // 1 MB
            allowed_env_vars: default_allowed_env_vars(),
        }
    }
}

/// Benign environment variables
fn default_allowed_env_vars() -> HashSet<String> {
    ["PATH", "LANG", "LC_ALL", "TZ"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Harness reply, as written by the child
#[derive(Debug, Deserialize)]
struct HarnessReply {
    status: ExecutionStatus,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    trace: Option<String>,
    #[serde(default)]
    behavior_log: Vec<BehaviorEvent>,
    #[serde(default)]
    blocked_calls: Vec<BehaviorEvent>,
    #[serde(default)]
    nonce: String,
    #[serde(default)]
    elapsed_ms: u64,
}

/// The single reply line on the harness channel carrying `nonce`
fn parse_reply(stdout: &str, nonce: &str) -> std::result::Result<HarnessReply, String> {
    let lines: Vec<&str> = stdout.lines().filter(|l| !l.trim().is_empty()).collect();
    let line = match lines.as_slice() {
        [] => return Err("no result".to_string()),
        [line] => *line,
        _ => return Err(format!("{} reply lines", lines.len())),
    };
    let reply: HarnessReply =
        serde_json::from_str(line).map_err(|e| format!("malformed reply: {}", e))?;
    if reply.nonce != nonce {
        return Err("reply nonce mismatch".to_string());
    }
    Ok(reply)
}

/// Read a stream to the end, keeping at most `max` bytes.
/// Draining continues past the cap so the child never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, max: usize) -> std::io::Result<(Vec<u8>, bool)> {
    let mut buf = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let room = max.saturating_sub(buf.len());
        if n > room {
            truncated = true;
        }
        buf.extend_from_slice(&chunk[..n.min(room)]);
    }
    Ok((buf, truncated))
}

fn tail(s: &str, max_chars: usize) -> String {
    let count = s.chars().count();
    if count <= max_chars {
        s.trim().to_string()
    } else {
        s.chars().skip(count - max_chars).collect::<String>().trim().to_string()
    }
}

/// Skill sandbox executor
pub struct SkillSandbox {
    config: SandboxConfig,
}

impl SkillSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run an extracted skill with the sandbox's default deadline
    pub async fn run(
        &self,
        skill: &ExtractedSkill,
        context: &Value,
        permissions: &BTreeSet<Permission>,
    ) -> ExecutionOutcome {
        self.test_skill(&skill.dir, &skill.entrypoint, context, self.config.timeout, permissions)
            .await
    }

    /// Execute `entry` from `skill_dir` once, in a fresh interpreter.
    ///
    /// Never fails: infrastructure problems become a `Failure` outcome.
    pub async fn test_skill(
        &self,
        skill_dir: &Path,
        entry: &EntrypointRecord,
        context: &Value,
        timeout: Duration,
        permissions: &BTreeSet<Permission>,
    ) -> ExecutionOutcome {
        let start = Instant::now();
        if timeout.is_zero() {
            warn!("Refusing sandbox run of {} with a zero timeout", entry);
            return ExecutionOutcome::failed(
                ExecutionStatus::Failure,
                0,
                "sandbox timeout must be positive".to_string(),
            );
        }
        let scratch = self.config.work_dir.join(format!("run-{}", Uuid::new_v4()));

        let outcome = match self
            .spawn_and_wait(skill_dir, entry, context, timeout, permissions, &scratch, start)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Sandbox run of {} failed: {:#}", entry, e);
                ExecutionOutcome::failed(
                    ExecutionStatus::Failure,
                    start.elapsed().as_millis() as u64,
                    format!("sandbox error: {:#}", e),
                )
            }
        };

        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            debug!("Scratch cleanup of {} skipped: {}", scratch.display(), e);
        }

        info!(
            "Sandbox run of {}: {:?} in {}ms ({} blocked)",
            entry,
            outcome.status,
            outcome.elapsed_ms,
            outcome.blocked_calls.len()
        );
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn spawn_and_wait(
        &self,
        skill_dir: &Path,
        entry: &EntrypointRecord,
        context: &Value,
        timeout: Duration,
        permissions: &BTreeSet<Permission>,
        scratch: &Path,
        start: Instant,
    ) -> Result<ExecutionOutcome> {
        tokio::fs::create_dir_all(scratch.join("output"))
            .await
            .with_context(|| format!("Failed to create scratch dir {}", scratch.display()))?;
        let skill_dir = tokio::fs::canonicalize(skill_dir)
            .await
            .with_context(|| format!("Skill dir not found: {}", skill_dir.display()))?;

        let nonce = Uuid::new_v4().simple().to_string();
        let request = json!({
            "nonce": &nonce,
            "skill_dir": skill_dir.to_string_lossy(),
            "entry_file": entry.file,
            "entry_function": entry.function,
            "context": context,
            "timeout": timeout.as_secs_f64(),
            "allow_network": permissions.contains(&Permission::Network),
            "allow_fs_write": permissions.contains(&Permission::FsWrite),
            "scratch_dir": scratch.to_string_lossy(),
        });
        let payload = serde_json::to_vec(&request).context("Failed to encode sandbox request")?;

        let mut cmd = Command::new(&self.config.python);
        cmd.args(["-I", "-B", "-c", HARNESS])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(scratch)
            .kill_on_drop(true)
            .env_clear(); // Clear all environment

        for var in &self.config.allowed_env_vars {
            if let Ok(value) = std::env::var(var) {
                cmd.env(var, value);
            }
        }
        cmd.env("HOME", scratch)
            .env("TMPDIR", scratch)
            .env("PYTHONIOENCODING", "utf-8")
            .env("PYTHONDONTWRITEBYTECODE", "1");

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.config.python))?;

        let mut stdin = child.stdin.take().context("Child stdin not captured")?;
        let stdout = child.stdout.take().context("Child stdout not captured")?;
        let stderr = child.stderr.take().context("Child stderr not captured")?;

        // A child that dies before reading stdin must not abort the run
        if let Err(e) = stdin.write_all(&payload).await {
            debug!("Sandbox stdin write failed: {}", e);
        }
        drop(stdin);

        let max = self.config.max_output_bytes;
        let waited = tokio::time::timeout(timeout + self.config.kill_grace, async {
            let (out, err) = tokio::join!(read_capped(stdout, max), read_capped(stderr, max / 4));
            let status = child.wait().await?;
            Ok::<_, anyhow::Error>((out?, err?, status))
        })
        .await;

        let elapsed_ms = start.elapsed().as_millis() as u64;

        let ((stdout_buf, truncated), (stderr_buf, _), status) = match waited {
            Ok(result) => result?,
            Err(_) => {
                let _ = child.kill().await;
                warn!(
                    "Sandboxed skill {} killed after {:.2}s",
                    entry,
                    timeout.as_secs_f64()
                );
                return Ok(ExecutionOutcome::failed(
                    ExecutionStatus::Timeout,
                    elapsed_ms,
                    format!("timed out after {:.2}s", timeout.as_secs_f64()),
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&stdout_buf);
        let stderr = tail(&String::from_utf8_lossy(&stderr_buf), 4000);

        let reply = match parse_reply(&stdout, &nonce) {
            Ok(reply) => reply,
            Err(problem) => {
                let reason = if truncated {
                    "sandbox output exceeded the capture limit".to_string()
                } else if problem == "no result" {
                    format!(
                        "sandbox exited with {} and no result",
                        status
                            .code()
                            .map(|c| format!("code {}", c))
                            .unwrap_or_else(|| "a signal".to_string())
                    )
                } else {
                    warn!("Sandbox protocol error for {}: {}", entry, problem);
                    format!("sandbox protocol error: {}", problem)
                };
                let mut outcome = ExecutionOutcome::failed(ExecutionStatus::Failure, elapsed_ms, reason);
                outcome.stderr = stderr;
                outcome.truncated = truncated;
                return Ok(outcome);
            }
        };

        debug!("Sandbox exit status for {}: {}", entry, status);

        let deadline_ms = timeout.as_millis() as u64;
        let overran = reply.elapsed_ms >= deadline_ms;
        if overran && reply.status != ExecutionStatus::Timeout {
            warn!(
                "Sandboxed skill {} reported {:?} after the {:.2}s deadline",
                entry,
                reply.status,
                timeout.as_secs_f64()
            );
        }
        let status = if overran {
            ExecutionStatus::Timeout
        } else {
            reply.status
        };
        let error = if status == ExecutionStatus::Timeout && reply.status != ExecutionStatus::Timeout {
            Some(format!("timed out after {:.2}s", timeout.as_secs_f64()))
        } else {
            reply.error
        };

        Ok(ExecutionOutcome {
            status,
            success: reply.success && status == ExecutionStatus::Success,
            elapsed_ms,
            result: if status == ExecutionStatus::Success { reply.result } else { None },
            error,
            trace: reply.trace,
            behavior_log: reply.behavior_log,
            blocked_calls: reply.blocked_calls,
            stderr,
            truncated,
        })
    }
}

/// Call-time invoker for the isolated policy: every call is a sandbox run
#[async_trait]
impl SkillInvoker for SkillSandbox {
    async fn invoke(&self, skill: &ExtractedSkill, context: &Value) -> std::result::Result<Value, InvocationError> {
        let (declared, _) = skill.manifest.declared_permissions();
        let outcome = self.run(skill, context, &declared).await;

        if let Some(first) = outcome.blocked_calls.first() {
            return Err(InvocationError::Blocked(first.to_string()));
        }
        match outcome.status {
            ExecutionStatus::Success => Ok(outcome.result.unwrap_or(Value::Null)),
            ExecutionStatus::Timeout => Err(InvocationError::Timeout(self.config.timeout)),
            ExecutionStatus::Failure => Err(InvocationError::Failed(
                outcome.error.unwrap_or_else(|| "skill failed".to_string()),
            )),
        }
    }
}
