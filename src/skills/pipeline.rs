//! Install-Time Pipeline
//!
//! ```text
//! archive ─▶ unpack ─▶ normalize ─▶ static analysis ─▶ purity ─▶ sandbox
//!                                                                 │
//!                              rejected ◀── any stage fails ──────┤
//!                                 │                               ▼
//!                            quarantine                       install
//! ```
//!
//! Stages run in order and stage N+1 never starts unless stage N passed.
//! Every run happens on a staging copy under the work directory; caller
//! directories are never modified or deleted.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use super::analyzer;
use super::archive::{self, ArchiveLimits};
use super::execution::{self, ExecutionValidator, SkillInvoker};
use super::normalizer;
use super::purity;
use super::quarantine::QuarantineStore;
use super::report::{ReportLimits, SkillReport};
use super::sandbox::SkillSandbox;
use super::types::{
    AnalysisReport, ExecutionOutcome, ExecutionReport, ExecutionStatus, ExtractedSkill, FailureKind,
    PackagingError, Permission, PurityVerdict, SafetyVerdict,
};

/// Context used for the install-time sandbox run
pub fn self_test_context() -> Value {
    json!({"action": "self_test", "test_mode": true})
}

/// Settings for the install-time pipeline
#[derive(Debug, Clone)]
pub struct GateSettings {
    pub limits: ArchiveLimits,
    pub sandbox_timeout: Duration,
    /// Parent of staging copies
    pub work_dir: PathBuf,
    /// Approved skills land in `<install_root>/<id>`
    pub install_root: PathBuf,
}

/// Everything the pipeline learned about one submission
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateReport {
    pub ok: bool,
    pub verdict: SafetyVerdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purity: Option<PurityVerdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ExecutionOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_at: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quarantine_id: Option<String>,
}

impl GateReport {
    fn rejected(kind: FailureKind, reasons: Vec<String>) -> Self {
        Self {
            ok: false,
            verdict: SafetyVerdict {
                ok: false,
                skill_id: String::new(),
                name: String::new(),
                version: String::new(),
                permissions: Vec::new(),
                reasons,
                warnings: Vec::new(),
            },
            failure: Some(kind),
            analysis: None,
            purity: None,
            outcome: None,
            installed_at: None,
            quarantine_id: None,
        }
    }

    pub fn reasons(&self) -> &[String] {
        &self.verdict.reasons
    }
}

/// Trust recorded with a quarantined rejection
fn quarantine_trust(kind: FailureKind) -> f64 {
    match kind {
        FailureKind::Security | FailureKind::EscapeSuspicion => 0.0,
        FailureKind::Packaging | FailureKind::Syntax => 0.1,
        FailureKind::Purity => 0.2,
        FailureKind::Runtime | FailureKind::Timeout => 0.3,
    }
}

fn looks_like_escape(message: &str) -> bool {
    let lower = message.to_lowercase();
    [
        "permission denied",
        "access denied",
        "not allowed",
        "operation not permitted",
        "restricted",
        "escape",
    ]
    .iter()
    .any(|m| lower.contains(m))
}

/// Copy a directory tree, skipping symbolic links
pub fn copy_tree(src: &Path, dst: &Path) -> Result<usize> {
    let mut copied = 0;
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", src.display()))?;
        let rel = entry.path().strip_prefix(src).context("Walked outside source tree")?;
        let target = dst.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
            copied += 1;
        } else {
            warn!("Skipping non-regular file {}", entry.path().display());
        }
    }
    Ok(copied)
}

fn source_digest(skill: &ExtractedSkill) -> String {
    let mut hasher = Sha256::new();
    if let Ok(bytes) = fs::read(skill.entry_path()) {
        hasher.update(&bytes);
    }
    hex::encode(&hasher.finalize()[..16])
}

/// Stage outcome: continue with a value or stop with a rejection
enum Stage<T> {
    Pass(T),
    Fail(FailureKind, Vec<String>),
}

/// The install-time gate
pub struct SkillGate {
    settings: GateSettings,
    sandbox: Arc<SkillSandbox>,
    quarantine: Arc<QuarantineStore>,
    validator: ExecutionValidator,
}

impl SkillGate {
    pub fn new(
        settings: GateSettings,
        sandbox: Arc<SkillSandbox>,
        quarantine: Arc<QuarantineStore>,
        policy: execution::InvocationPolicy,
    ) -> Self {
        let validator = ExecutionValidator::new(policy, sandbox.clone());
        Self {
            settings,
            sandbox,
            quarantine,
            validator,
        }
    }

    pub fn settings(&self) -> &GateSettings {
        &self.settings
    }

    pub fn quarantine(&self) -> &QuarantineStore {
        &self.quarantine
    }

    pub fn validator(&self) -> &ExecutionValidator {
        &self.validator
    }

    fn staging_dir(&self, prefix: &str) -> PathBuf {
        self.settings
            .work_dir
            .join(format!("{}-{}", prefix, Uuid::new_v4()))
    }

    fn report_limits(&self) -> ReportLimits {
        ReportLimits {
            archive: self.settings.limits,
            sandbox_timeout_secs: self.settings.sandbox_timeout.as_secs_f64(),
        }
    }

    /// Validate an uploaded `.zip` archive
    pub async fn validate_archive(&self, archive_path: &Path) -> Result<GateReport> {
        let is_zip = archive_path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("zip"))
            .unwrap_or(false);
        if !is_zip {
            let reasons = vec![format!("{}: not a .zip file", archive_path.display())];
            return self.reject_unidentified(FailureKind::Packaging, reasons, archive_path);
        }

        let staging = self.staging_dir("extract");
        let root = match archive::unpack(archive_path, &self.settings.limits, &staging) {
            Ok(root) => root,
            Err(e) => {
                remove_staging(&staging);
                return self.reject_unidentified(FailureKind::Packaging, vec![e.to_string()], archive_path);
            }
        };

        let report = self.run_stages(&root).await;
        remove_staging(&staging);
        report
    }

    /// Validate a pre-extracted skill directory
    pub async fn validate_dir(&self, dir: &Path) -> Result<GateReport> {
        if !dir.is_dir() {
            anyhow::bail!("Not a directory: {}", dir.display());
        }
        let staging = self.staging_dir("stage");
        copy_tree(dir, &staging)?;
        let report = self.run_stages(&staging).await;
        remove_staging(&staging);
        report
    }

    /// Run a pre-extracted skill once in the sandbox without installing it.
    ///
    /// Static analysis and purity still run first; a skill they reject is
    /// refused without being executed.
    pub async fn test(&self, dir: &Path, context: Option<Value>) -> Result<ExecutionOutcome> {
        let staging = self.staging_dir("test");
        copy_tree(dir, &staging)?;
        let outcome = self.test_staged(&staging, dir, context).await;
        remove_staging(&staging);
        outcome
    }

    async fn test_staged(&self, staging: &Path, dir: &Path, context: Option<Value>) -> Result<ExecutionOutcome> {
        let skill = normalizer::normalize(staging)
            .map_err(|e| anyhow::Error::new(e).context(format!("Cannot test {}", dir.display())))?;
        let (mut report, mut gate, declared) = self.open_reports(&skill);
        if let Some((kind, reasons)) = self.check_before_run(&skill, &declared, &mut report, &mut gate)? {
            warn!("Refusing to run '{}' ({}): {}", skill.manifest.id, kind, reasons.join("; "));
            return Ok(ExecutionOutcome::failed(
                ExecutionStatus::Failure,
                0,
                format!("refused before sandbox ({}): {}", kind, reasons.join("; ")),
            ));
        }

        let context = context.unwrap_or_else(self_test_context);
        Ok(self
            .sandbox
            .test_skill(
                &skill.dir,
                &skill.entrypoint,
                &context,
                self.settings.sandbox_timeout,
                &declared,
            )
            .await)
    }

    /// Call-time execution of an installed skill
    pub async fn execute(
        &self,
        skill_id: &str,
        context: &Map<String, Value>,
        invoker: &dyn SkillInvoker,
    ) -> Result<ExecutionReport> {
        let rel = archive::safe_member_path(skill_id).map_err(|e| anyhow::anyhow!("Invalid skill id {}", e))?;
        if rel.components().count() != 1 {
            anyhow::bail!("Invalid skill id: {}", skill_id);
        }
        let dir = self.settings.install_root.join(rel);
        Ok(self
            .validator
            .validate_and_execute(skill_id, &dir, context, invoker)
            .await)
    }

    /// Fresh per-skill report and verdict, with the declared permission set
    fn open_reports(&self, skill: &ExtractedSkill) -> (SkillReport, GateReport, BTreeSet<Permission>) {
        let mut report = SkillReport::new(skill, self.report_limits());
        let (declared, unknown) = skill.manifest.declared_permissions();
        let mut warnings = skill.warnings.clone();
        warnings.extend(unknown.iter().map(|p| format!("unknown permission ignored: {}", p)));
        report.record("normalize", true, Vec::new(), warnings.clone());

        let gate = GateReport {
            ok: false,
            verdict: SafetyVerdict {
                ok: false,
                skill_id: skill.manifest.id.clone(),
                name: skill.manifest.name.clone(),
                version: skill.manifest.version.clone(),
                permissions: declared.iter().copied().collect(),
                reasons: Vec::new(),
                warnings,
            },
            failure: None,
            analysis: None,
            purity: None,
            outcome: None,
            installed_at: None,
            quarantine_id: None,
        };
        (report, gate, declared)
    }

    /// Static analysis then purity. Returns the first failing stage, if any.
    fn check_before_run(
        &self,
        skill: &ExtractedSkill,
        declared: &BTreeSet<Permission>,
        report: &mut SkillReport,
        gate: &mut GateReport,
    ) -> Result<Option<(FailureKind, Vec<String>)>> {
        // Static analysis
        let analysis = analyzer::analyze_dir(&skill.dir, declared)
            .with_context(|| format!("Failed to analyze {}", skill.dir.display()))?;
        let stage = Self::analysis_stage(&analysis);
        gate.verdict
            .warnings
            .extend(analysis.warnings.iter().map(|w| w.to_string()));
        report.record(
            "static_analysis",
            matches!(stage, Stage::Pass(())),
            stage_reasons(&stage),
            analysis.warnings.iter().map(|w| w.to_string()).collect(),
        );
        gate.analysis = Some(analysis);
        if let Stage::Fail(kind, reasons) = stage {
            return Ok(Some((kind, reasons)));
        }

        // Purity
        let verdict = purity::validate_skill(skill);
        let purity_warnings: Vec<String> = verdict.warnings.iter().map(|w| w.to_string()).collect();
        let purity_reasons: Vec<String> = verdict.violations.iter().map(|v| v.to_string()).collect();
        report.record("purity", verdict.is_pure, purity_reasons.clone(), purity_warnings);
        let is_pure = verdict.is_pure;
        gate.purity = Some(verdict);
        if !is_pure {
            return Ok(Some((FailureKind::Purity, purity_reasons)));
        }
        Ok(None)
    }

    async fn run_stages(&self, root: &Path) -> Result<GateReport> {
        // Normalize
        let skill = match normalizer::normalize(root) {
            Ok(skill) => skill,
            Err(PackagingError::Io(e)) => {
                return Err(e).with_context(|| format!("Failed to normalize {}", root.display()))
            }
            Err(e) => return self.reject_unidentified(FailureKind::Packaging, vec![e.to_string()], root),
        };
        let (mut report, mut gate, declared) = self.open_reports(&skill);
        if let Some((kind, reasons)) = self.check_before_run(&skill, &declared, &mut report, &mut gate)? {
            return self.reject(gate, report, &skill, kind, reasons);
        }

        // Sandbox
        let outcome = self
            .sandbox
            .test_skill(
                &skill.dir,
                &skill.entrypoint,
                &self_test_context(),
                self.settings.sandbox_timeout,
                &declared,
            )
            .await;
        let (stage, sandbox_warnings) = Self::sandbox_stage(&outcome);
        report.record(
            "sandbox",
            matches!(stage, Stage::Pass(())),
            stage_reasons(&stage),
            sandbox_warnings.clone(),
        );
        gate.verdict.warnings.extend(sandbox_warnings);
        gate.outcome = Some(outcome);
        if let Stage::Fail(kind, reasons) = stage {
            return self.reject(gate, report, &skill, kind, reasons);
        }

        self.install(gate, report, &skill, &declared)
    }

    fn analysis_stage(analysis: &AnalysisReport) -> Stage<()> {
        if let Some(err) = &analysis.syntax_error {
            return Stage::Fail(FailureKind::Syntax, vec![err.to_string()]);
        }
        if !analysis.violations.is_empty() {
            return Stage::Fail(
                FailureKind::Security,
                analysis.violations.iter().map(|v| v.to_string()).collect(),
            );
        }
        Stage::Pass(())
    }

    fn sandbox_stage(outcome: &ExecutionOutcome) -> (Stage<()>, Vec<String>) {
        let mut warnings = Vec::new();
        if !outcome.blocked_calls.is_empty() {
            let reasons = outcome
                .blocked_calls
                .iter()
                .map(|b| format!("blocked call: {}", b))
                .collect();
            return (Stage::Fail(FailureKind::Security, reasons), warnings);
        }
        match outcome.status {
            ExecutionStatus::Timeout => {
                let reason = outcome.error.clone().unwrap_or_else(|| "sandbox timeout".to_string());
                return (Stage::Fail(FailureKind::Timeout, vec![reason]), warnings);
            }
            ExecutionStatus::Failure => {
                let reason = outcome.error.clone().unwrap_or_else(|| "sandbox run failed".to_string());
                let kind = if looks_like_escape(&reason) || reason.starts_with("sandbox protocol error") {
                    FailureKind::EscapeSuspicion
                } else {
                    FailureKind::Runtime
                };
                return (Stage::Fail(kind, vec![reason]), warnings);
            }
            ExecutionStatus::Success => {}
        }

        let result = outcome.result.clone().unwrap_or(Value::Null);
        let problems = execution::validate_result(&result);
        if !problems.is_empty() {
            return (Stage::Fail(FailureKind::Runtime, problems), warnings);
        }
        if result.get("success") == Some(&Value::Bool(false)) {
            warnings.push("self-test returned success=false".to_string());
        }
        if outcome.truncated {
            warnings.push("sandbox output was truncated".to_string());
        }
        (Stage::Pass(()), warnings)
    }

    fn reject(
        &self,
        mut gate: GateReport,
        mut report: SkillReport,
        skill: &ExtractedSkill,
        kind: FailureKind,
        reasons: Vec<String>,
    ) -> Result<GateReport> {
        report.finish();
        warn!(
            "Rejected skill '{}' ({}): {}",
            skill.manifest.id,
            kind,
            reasons.join("; ")
        );
        gate.ok = false;
        gate.verdict.ok = false;
        gate.failure = Some(kind);
        gate.verdict.reasons = reasons;

        let content = json!({
            "skillId": skill.manifest.id,
            "name": skill.manifest.name,
            "version": skill.manifest.version,
            "entrypoint": skill.entrypoint.to_string(),
            "sourceDigest": source_digest(skill),
            "failure": kind,
            "reasons": gate.verdict.reasons,
            "report": report,
        });
        let entry = self
            .quarantine
            .quarantine(&content.to_string(), kind.as_str(), quarantine_trust(kind))
            .context("Failed to quarantine rejected skill")?;
        gate.quarantine_id = Some(entry.id);
        Ok(gate)
    }

    fn reject_unidentified(&self, kind: FailureKind, reasons: Vec<String>, source: &Path) -> Result<GateReport> {
        warn!("Rejected {} ({}): {}", source.display(), kind, reasons.join("; "));
        let mut gate = GateReport::rejected(kind, reasons);
        let content = json!({
            "source": source.display().to_string(),
            "failure": kind,
            "reasons": gate.verdict.reasons,
        });
        let entry = self
            .quarantine
            .quarantine(&content.to_string(), kind.as_str(), quarantine_trust(kind))
            .context("Failed to quarantine rejected package")?;
        gate.quarantine_id = Some(entry.id);
        Ok(gate)
    }

    fn install(
        &self,
        mut gate: GateReport,
        mut report: SkillReport,
        skill: &ExtractedSkill,
        declared: &BTreeSet<Permission>,
    ) -> Result<GateReport> {
        let ok = report.finish();
        if !ok {
            // Unreachable with every stage passed; keep the invariant explicit
            return self.reject(gate, report, skill, FailureKind::Runtime, vec!["incomplete report".to_string()]);
        }

        let rel = archive::safe_member_path(&skill.manifest.id)
            .map_err(|e| anyhow::anyhow!("Unsafe skill id {}", e))?;
        let target = self.settings.install_root.join(rel);
        let copied = install_tree(&skill.dir, &target, &self.settings.install_root, |dir| {
            report.write(dir).map(|_| ())
        })?;
        debug!("Installed {} files for '{}'", copied, skill.manifest.id);

        info!(
            "Approved skill '{}' v{} with permissions {:?}",
            skill.manifest.id, skill.manifest.version, declared
        );
        gate.ok = true;
        gate.verdict.ok = true;
        gate.installed_at = Some(target);
        Ok(gate)
    }
}

/// Replace `target` with a copy of `src`. The copy and `finish` run in a
/// sibling temp dir which is then renamed into place, so a failed install
/// leaves any previous version untouched.
fn install_tree(
    src: &Path,
    target: &Path,
    install_root: &Path,
    finish: impl FnOnce(&Path) -> Result<()>,
) -> Result<usize> {
    fs::create_dir_all(install_root)
        .with_context(|| format!("Failed to create {}", install_root.display()))?;
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = install_root.join(format!(".{}.tmp-{}", name, Uuid::new_v4().simple()));

    let copied = match copy_tree(src, &temp).and_then(|n| finish(&temp).map(|()| n)) {
        Ok(n) => n,
        Err(e) => {
            remove_staging(&temp);
            return Err(e);
        }
    };

    if target.exists() {
        let previous = normalizer::load(target)
            .map(|s| format!("'{}' v{}", s.manifest.name, s.manifest.version))
            .unwrap_or_else(|_| "an unreadable skill".to_string());
        warn!("Replacing {} installed at {}", previous, target.display());
        let backup = install_root.join(format!(".{}.old-{}", name, Uuid::new_v4().simple()));
        fs::rename(target, &backup)
            .with_context(|| format!("Failed to move aside {}", target.display()))?;
        if let Err(e) = fs::rename(&temp, target) {
            // put the previous version back
            let _ = fs::rename(&backup, target);
            remove_staging(&temp);
            return Err(e).with_context(|| format!("Failed to install into {}", target.display()));
        }
        remove_staging(&backup);
    } else {
        fs::rename(&temp, target).with_context(|| format!("Failed to install into {}", target.display()))?;
    }
    Ok(copied)
}

fn stage_reasons(stage: &Stage<()>) -> Vec<String> {
    match stage {
        Stage::Pass(()) => Vec::new(),
        Stage::Fail(_, reasons) => reasons.clone(),
    }
}

fn remove_staging(dir: &Path) {
    if let Err(e) = fs::remove_dir_all(dir) {
        debug!("Staging cleanup of {} skipped: {}", dir.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skills::types::BehaviorEvent;

    fn outcome(status: ExecutionStatus, result: Option<Value>) -> ExecutionOutcome {
        let mut o = ExecutionOutcome::failed(status, 5, "x");
        o.success = status == ExecutionStatus::Success;
        o.error = if o.success { None } else { Some("ValueError: bad".to_string()) };
        o.result = result;
        o
    }

    fn fails_with(stage: &Stage<()>) -> Option<FailureKind> {
        match stage {
            Stage::Fail(kind, _) => Some(*kind),
            Stage::Pass(()) => None,
        }
    }

    #[test]
    fn test_sandbox_stage_success() {
        let (stage, warnings) =
            SkillGate::sandbox_stage(&outcome(ExecutionStatus::Success, Some(json!({"success": true}))));
        assert_eq!(fails_with(&stage), None);
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_sandbox_stage_soft_failure_warns() {
        let (stage, warnings) = SkillGate::sandbox_stage(&outcome(
            ExecutionStatus::Success,
            Some(json!({"success": false, "error": "no data"})),
        ));
        assert_eq!(fails_with(&stage), None);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_sandbox_stage_failures() {
        let (stage, _) = SkillGate::sandbox_stage(&outcome(ExecutionStatus::Timeout, None));
        assert_eq!(fails_with(&stage), Some(FailureKind::Timeout));

        let (stage, _) = SkillGate::sandbox_stage(&outcome(ExecutionStatus::Failure, None));
        assert_eq!(fails_with(&stage), Some(FailureKind::Runtime));

        let (stage, _) = SkillGate::sandbox_stage(&outcome(ExecutionStatus::Success, Some(json!("done"))));
        assert_eq!(fails_with(&stage), Some(FailureKind::Runtime));

        let mut blocked = outcome(ExecutionStatus::Success, Some(json!({"success": true})));
        blocked.blocked_calls.push(BehaviorEvent {
            category: "network".into(),
            event: "socket.connect".into(),
            detail: String::new(),
            blocked: true,
        });
        let (stage, _) = SkillGate::sandbox_stage(&blocked);
        assert_eq!(fails_with(&stage), Some(FailureKind::Security));
    }

    #[test]
    fn test_escape_text_classified() {
        let mut o = outcome(ExecutionStatus::Failure, None);
        o.error = Some("PermissionError: [Errno 1] Operation not permitted".into());
        let (stage, _) = SkillGate::sandbox_stage(&o);
        assert_eq!(fails_with(&stage), Some(FailureKind::EscapeSuspicion));
    }

    #[test]
    fn test_install_tree_replaces_atomically() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path().join("installed");
        let target = root.join("hello");
        let v1 = tmp.path().join("v1");
        fs::create_dir_all(&v1).unwrap();
        fs::write(v1.join("skill.py"), "one").unwrap();
        let v2 = tmp.path().join("v2");
        fs::create_dir_all(&v2).unwrap();
        fs::write(v2.join("skill.py"), "two").unwrap();

        install_tree(&v1, &target, &root, |_| Ok(())).unwrap();
        assert_eq!(fs::read_to_string(target.join("skill.py")).unwrap(), "one");

        // a failing finish leaves the installed version alone
        let err = install_tree(&v2, &target, &root, |_| anyhow::bail!("report write failed"));
        assert!(err.is_err());
        assert_eq!(fs::read_to_string(target.join("skill.py")).unwrap(), "one");

        install_tree(&v2, &target, &root, |dir| {
            fs::write(dir.join("report.json"), "{}")?;
            Ok(())
        })
        .unwrap();
        assert_eq!(fs::read_to_string(target.join("skill.py")).unwrap(), "two");
        assert!(target.join("report.json").exists());

        let names: Vec<String> = fs::read_dir(&root)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["hello".to_string()], "no temp or backup dirs remain");
    }

    #[test]
    fn test_forged_reply_classified_as_escape() {
        let mut o = outcome(ExecutionStatus::Failure, None);
        o.error = Some("sandbox protocol error: reply nonce mismatch".into());
        let (stage, _) = SkillGate::sandbox_stage(&o);
        assert_eq!(fails_with(&stage), Some(FailureKind::EscapeSuspicion));
    }

    #[test]
    fn test_copy_tree() {
        let tmp = tempfile::TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("lib")).unwrap();
        fs::write(src.join("skill.py"), "x").unwrap();
        fs::write(src.join("lib/util.py"), "y").unwrap();
        let dst = tmp.path().join("dst");
        assert_eq!(copy_tree(&src, &dst).unwrap(), 2);
        assert_eq!(fs::read_to_string(dst.join("lib/util.py")).unwrap(), "y");
    }
}
