//! Cumulative Skill Report
//!
//! `skill_report.json` collects identity, declared permissions, every
//! stage's outcome and the limits in force, so an audit never has to
//! re-run the analysis. Stage records are only ever appended.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::archive::ArchiveLimits;
use super::types::{EntrypointRecord, ExtractedSkill, Permission, SkillOrigin};

/// Report file name inside a skill directory
pub const REPORT_FILE: &str = "skill_report.json";

/// One pipeline stage's outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: String,
    pub passed: bool,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub timestamp: String,
}

/// Limits in force when the report was written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportLimits {
    #[serde(flatten)]
    pub archive: ArchiveLimits,
    pub sandbox_timeout_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillReport {
    pub skill_id: String,
    pub name: String,
    pub version: String,
    /// Recognized declared permissions; unknown names are dropped
    pub permissions: Vec<Permission>,
    pub entrypoint: EntrypointRecord,
    pub origin: SkillOrigin,
    pub stages: Vec<StageRecord>,
    pub ok: bool,
    pub reasons: Vec<String>,
    pub prepared_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validated_at: Option<String>,
    pub limits: ReportLimits,
}

impl SkillReport {
    pub fn new(skill: &ExtractedSkill, limits: ReportLimits) -> Self {
        Self {
            skill_id: skill.manifest.id.clone(),
            name: skill.manifest.name.clone(),
            version: skill.manifest.version.clone(),
            permissions: skill.manifest.declared_permissions().0.into_iter().collect(),
            entrypoint: skill.entrypoint.clone(),
            origin: skill.origin,
            stages: Vec::new(),
            ok: false,
            reasons: Vec::new(),
            prepared_at: Utc::now().to_rfc3339(),
            validated_at: None,
            limits,
        }
    }

    /// Append a stage outcome; reasons of failed stages accumulate
    pub fn record(&mut self, stage: &str, passed: bool, reasons: Vec<String>, warnings: Vec<String>) {
        if !passed {
            self.reasons.extend(reasons.iter().cloned());
        }
        self.stages.push(StageRecord {
            stage: stage.to_string(),
            passed,
            reasons,
            warnings,
            timestamp: Utc::now().to_rfc3339(),
        });
    }

    /// Final verdict: ok only if every recorded stage passed
    pub fn finish(&mut self) -> bool {
        self.ok = !self.stages.is_empty() && self.stages.iter().all(|s| s.passed);
        self.validated_at = Some(Utc::now().to_rfc3339());
        self.ok
    }

    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.stage == name)
    }

    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(REPORT_FILE);
        let json = serde_json::to_string_pretty(self).context("Failed to serialize skill report")?;
        std::fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(REPORT_FILE);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("Invalid report {}", path.display()))
    }
}
