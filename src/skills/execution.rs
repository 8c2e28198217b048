//! Execution Context / Result Validator
//!
//! Call-time gate wrapped around every invocation of an installed skill.
//! Re-checks purity, screens the context for orchestration state, invokes
//! the skill through the configured [`InvocationPolicy`], and validates the
//! result shape.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::normalizer;
use super::purity;
use super::sandbox::SkillSandbox;
use super::types::{ExecutionReport, ExtractedSkill};

/// Context keys that carry orchestration state (compared case-insensitively)
pub const FORBIDDEN_CONTEXT_KEYS: [&str; 20] = [
    "user",
    "user_id",
    "user_name",
    "user_email",
    "conversation_history",
    "chat_history",
    "previous_messages",
    "goal",
    "objective",
    "intent",
    "objective_final",
    "system_state",
    "orchestrator_state",
    "agent_state",
    "llm",
    "ai",
    "model",
    "provider",
    "openai",
    "anthropic",
];

/// Keys a skill result may contain
pub const ALLOWED_RESULT_KEYS: [&str; 7] =
    ["success", "result", "error", "data", "output", "message", "status"];

/// Error text that suggests the skill tested its confinement
const ESCAPE_MARKERS: [&str; 8] = [
    "permission denied",
    "access denied",
    "not allowed",
    "operation not permitted",
    "restricted",
    "sandbox",
    "escape",
    "blocked",
];

/// Rolling history size
pub const HISTORY_CAPACITY: usize = 100;

/// Invocation failure reported by a [`SkillInvoker`]
#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    #[error("{0}")]
    Failed(String),
    #[error("blocked by sandbox: {0}")]
    Blocked(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Invokes a loaded skill with a context
#[async_trait]
pub trait SkillInvoker: Send + Sync {
    async fn invoke(&self, skill: &ExtractedSkill, context: &Value) -> Result<Value, InvocationError>;
}

/// How call-time invocations are executed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationPolicy {
    /// Call the supplied invoker directly; install-time sandboxing is trusted
    #[default]
    TrustInstall,
    /// Every call is a fresh sandbox run
    Isolated,
}

impl InvocationPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "trust_install" | "trust-install" | "trust" => Some(Self::TrustInstall),
            "isolated" | "sandbox" => Some(Self::Isolated),
            _ => None,
        }
    }
}

/// Aggregate view over the rolling history
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub avg_elapsed_ms: f64,
    pub purity_violations: usize,
    pub safety_violations: usize,
}

/// Check a result against the result contract
pub fn validate_result(value: &Value) -> Vec<String> {
    let Some(map) = value.as_object() else {
        return vec!["result must be a mapping".to_string()];
    };

    let mut problems = Vec::new();
    let unexpected: Vec<&str> = map
        .keys()
        .map(String::as_str)
        .filter(|k| !ALLOWED_RESULT_KEYS.contains(k))
        .collect();
    if !unexpected.is_empty() {
        problems.push(format!("unexpected result keys: {}", unexpected.join(", ")));
    }
    match map.get("success") {
        Some(Value::Bool(_)) => {}
        Some(_) => problems.push("result field 'success' must be a boolean".to_string()),
        None => problems.push("result is missing boolean 'success'".to_string()),
    }
    problems
}

/// Forbidden keys present in a context
pub fn forbidden_keys(context: &Map<String, Value>) -> Vec<String> {
    context
        .keys()
        .filter(|k| FORBIDDEN_CONTEXT_KEYS.contains(&k.to_lowercase().as_str()))
        .cloned()
        .collect()
}

fn looks_like_escape(message: &str) -> bool {
    let lower = message.to_lowercase();
    ESCAPE_MARKERS.iter().any(|m| lower.contains(m))
}

/// Call-time validator
pub struct ExecutionValidator {
    policy: InvocationPolicy,
    sandbox: Arc<SkillSandbox>,
    history: Mutex<VecDeque<ExecutionReport>>,
}

impl ExecutionValidator {
    pub fn new(policy: InvocationPolicy, sandbox: Arc<SkillSandbox>) -> Self {
        Self {
            policy,
            sandbox,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
        }
    }

    pub fn policy(&self) -> InvocationPolicy {
        self.policy
    }

    /// Validate a call, invoke the skill, validate its result.
    ///
    /// Every call is recorded in the rolling history, including rejected ones.
    pub async fn validate_and_execute(
        &self,
        skill_id: &str,
        skill_dir: &Path,
        context: &Map<String, Value>,
        invoker: &dyn SkillInvoker,
    ) -> ExecutionReport {
        let mut report = ExecutionReport {
            skill_id: skill_id.to_string(),
            success: false,
            elapsed_ms: 0,
            result: None,
            error: None,
            purity_violations: Vec::new(),
            safety_violations: Vec::new(),
        };

        let skill = match normalizer::load(skill_dir) {
            Ok(skill) => skill,
            Err(e) => {
                report.error = Some(format!("cannot load skill: {}", e));
                return self.record(report);
            }
        };

        let purity = purity::validate_skill(&skill);
        if !purity.is_pure {
            report.purity_violations = purity.violations.iter().map(|f| f.to_string()).collect();
            report.error = Some("skill failed purity check".to_string());
            warn!(
                "Skill '{}' refused at call time: {} purity violations",
                skill_id,
                report.purity_violations.len()
            );
            return self.record(report);
        }

        let forbidden = forbidden_keys(context);
        if !forbidden.is_empty() {
            report.safety_violations = forbidden
                .iter()
                .map(|k| format!("FORBIDDEN_CONTEXT_KEY: {}", k))
                .collect();
            report.error = Some(format!("context carries orchestration state: {}", forbidden.join(", ")));
            warn!("Skill '{}' refused: forbidden context keys {:?}", skill_id, forbidden);
            return self.record(report);
        }

        if !context.contains_key("action") {
            report.error = Some("context is missing required key 'action'".to_string());
            return self.record(report);
        }

        let payload = Value::Object(context.clone());
        let start = Instant::now();
        let invoked = match self.policy {
            InvocationPolicy::TrustInstall => invoker.invoke(&skill, &payload).await,
            InvocationPolicy::Isolated => self.sandbox.invoke(&skill, &payload).await,
        };
        report.elapsed_ms = start.elapsed().as_millis() as u64;

        match invoked {
            Ok(value) => {
                let problems = validate_result(&value);
                if problems.is_empty() {
                    report.success = value.get("success").and_then(Value::as_bool).unwrap_or(false);
                    if !report.success {
                        report.error = value
                            .get("error")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .or_else(|| Some("skill reported failure".to_string()));
                    }
                } else {
                    report.error = Some(problems.join("; "));
                }
                report.result = Some(value);
            }
            Err(e) => {
                let message = e.to_string();
                if looks_like_escape(&message) {
                    warn!("Possible escape attempt by '{}': {}", skill_id, message);
                    report
                        .safety_violations
                        .push(format!("POSSIBLE_ESCAPE_ATTEMPT: {}", message));
                }
                report.error = Some(message);
            }
        }

        info!(
            "Executed '{}' ({:?}): success={} in {}ms",
            skill_id, self.policy, report.success, report.elapsed_ms
        );
        self.record(report)
    }

    fn record(&self, report: ExecutionReport) -> ExecutionReport {
        let mut history = self.history.lock();
        if history.len() >= HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(report.clone());
        debug!("Execution history holds {} reports", history.len());
        report
    }

    /// Reports in the rolling history, oldest first
    pub fn history(&self) -> Vec<ExecutionReport> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn stats(&self) -> ExecutionStats {
        let history = self.history.lock();
        let total = history.len();
        if total == 0 {
            return ExecutionStats::default();
        }
        let successful = history.iter().filter(|r| r.success).count();
        let elapsed: u64 = history.iter().map(|r| r.elapsed_ms).sum();
        ExecutionStats {
            total,
            successful,
            failed: total - successful,
            success_rate: successful as f64 / total as f64,
            avg_elapsed_ms: elapsed as f64 / total as f64,
            purity_violations: history.iter().filter(|r| !r.purity_violations.is_empty()).count(),
            safety_violations: history.iter().filter(|r| !r.safety_violations.is_empty()).count(),
        }
    }
}
