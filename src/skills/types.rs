//! Skill Gate Type Definitions
//!
//! Core data structures shared by every stage of the ingestion pipeline:
//! manifests, entrypoint records, verdicts, execution outcomes and the
//! failure taxonomy.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

/// Manifest file name inside an extracted skill
pub const MANIFEST_FILE: &str = "manifest.json";

/// Entrypoint indirection record file name
pub const ENTRYPOINT_FILE: &str = "entrypoint.json";

/// Canonical entry source file
pub const CANONICAL_ENTRY_FILE: &str = "skill.py";

/// Canonical entry function
pub const CANONICAL_ENTRY_FUNCTION: &str = "execute";

/// Capability a skill may declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Network,
    FsRead,
    FsWrite,
}

impl Permission {
    /// Parse a declared capability string
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "network" | "net" => Some(Self::Network),
            "fs_read" | "fs.read" | "file_read" => Some(Self::FsRead),
            "fs_write" | "fs.write" | "file_write" => Some(Self::FsWrite),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::FsRead => "fs_read",
            Self::FsWrite => "fs_write",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `manifest.json` contents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SkillManifest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl SkillManifest {
    /// Split declared permissions into known capabilities and unknown strings
    pub fn declared_permissions(&self) -> (BTreeSet<Permission>, Vec<String>) {
        let mut known = BTreeSet::new();
        let mut unknown = Vec::new();
        for raw in &self.permissions {
            match Permission::parse(raw) {
                Some(p) => {
                    known.insert(p);
                }
                None => unknown.push(raw.clone()),
            }
        }
        (known, unknown)
    }

    /// Names of required fields that are empty
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.id.trim().is_empty() {
            missing.push("id");
        }
        if self.name.trim().is_empty() {
            missing.push("name");
        }
        if self.version.trim().is_empty() {
            missing.push("version");
        }
        missing
    }
}

/// Where the entrypoint lives, persisted as `entrypoint.json`.
///
/// Resolved at load time by the sandbox harness instead of synthesizing a
/// wrapper module around a non-canonical entrypoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrypointRecord {
    /// Entry source file, relative to the skill directory
    pub file: String,
    /// Entry function name
    pub function: String,
}

impl Default for EntrypointRecord {
    fn default() -> Self {
        Self {
            file: CANONICAL_ENTRY_FILE.to_string(),
            function: CANONICAL_ENTRY_FUNCTION.to_string(),
        }
    }
}

impl EntrypointRecord {
    pub fn new(file: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            function: function.into(),
        }
    }

    /// True for `skill.py:execute`
    pub fn is_canonical(&self) -> bool {
        self.file == CANONICAL_ENTRY_FILE && self.function == CANONICAL_ENTRY_FUNCTION
    }
}

impl fmt::Display for EntrypointRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.function)
    }
}

/// How the skill's manifest and entrypoint were obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillOrigin {
    /// Built from a `skill.yaml` descriptor (trusted by construction)
    Declarative,
    /// Author-supplied source with a detected entrypoint
    Source,
}

/// A skill unpacked into its canonical directory layout
#[derive(Debug, Clone)]
pub struct ExtractedSkill {
    pub dir: PathBuf,
    pub manifest: SkillManifest,
    pub entrypoint: EntrypointRecord,
    pub origin: SkillOrigin,
    /// Non-fatal notes gathered during normalization
    pub warnings: Vec<String>,
}

impl ExtractedSkill {
    /// Absolute path of the entry source file
    pub fn entry_path(&self) -> PathBuf {
        self.dir.join(&self.entrypoint.file)
    }
}

/// Syntax error location, kept apart from security findings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntaxErrorInfo {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub message: String,
}

impl fmt::Display for SyntaxErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "syntax error in {} at line {}, column {}: {}",
            self.file, self.line, self.column, self.message
        )
    }
}

/// A single analyzer or purity finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// Machine-readable code, e.g. `forbidden_import`
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl Finding {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            file: None,
            line: None,
        }
    }

    pub fn at(mut self, file: &str, line: u32) -> Self {
        self.file = Some(file.to_string());
        self.line = Some(line);
        self
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, "{}:{}: {}", file, line, self.message),
            (Some(file), None) => write!(f, "{}: {}", file, self.message),
            _ => f.write_str(&self.message),
        }
    }
}

/// Static Security Analyzer output
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syntax_error: Option<SyntaxErrorInfo>,
    pub violations: Vec<Finding>,
    pub warnings: Vec<Finding>,
    /// Capabilities the code was observed to need
    pub permissions_required: BTreeSet<Permission>,
    /// Notable operations seen in the source (informational)
    pub detected_operations: Vec<String>,
}

impl AnalysisReport {
    pub fn passed(&self) -> bool {
        self.syntax_error.is_none() && self.violations.is_empty()
    }
}

/// Install-time safety verdict
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyVerdict {
    pub ok: bool,
    pub skill_id: String,
    pub name: String,
    pub version: String,
    pub permissions: Vec<Permission>,
    pub reasons: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Best-effort description of what the entry function reads
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputContract {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Keys read by direct subscript
    pub required: Vec<String>,
    /// Keys read through `.get()`
    pub optional: Vec<String>,
}

/// Best-effort description of what the entry function returns
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputContract {
    pub keys: Vec<String>,
    pub has_success: bool,
    pub has_error: bool,
    pub has_result: bool,
}

/// Purity Validator output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurityVerdict {
    pub skill_id: String,
    pub is_pure: bool,
    pub violations: Vec<Finding>,
    pub warnings: Vec<Finding>,
    pub input_contract: InputContract,
    pub output_contract: OutputContract,
}

/// Terminal state of a sandbox run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failure,
    Timeout,
}

/// One monitored operation attempted by the skill
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BehaviorEvent {
    pub category: String,
    pub event: String,
    #[serde(default)]
    pub detail: String,
    #[serde(default)]
    pub blocked: bool,
}

impl fmt::Display for BehaviorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{} ({})", self.event, self.category)
        } else {
            write!(f, "{} ({}): {}", self.event, self.category, self.detail)
        }
    }
}

/// Sandbox Runner output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub success: bool,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
    #[serde(default)]
    pub behavior_log: Vec<BehaviorEvent>,
    #[serde(default)]
    pub blocked_calls: Vec<BehaviorEvent>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    #[serde(default)]
    pub truncated: bool,
}

impl ExecutionOutcome {
    /// Outcome for a run that never produced a result
    pub fn failed(status: ExecutionStatus, elapsed_ms: u64, error: impl Into<String>) -> Self {
        Self {
            status,
            success: false,
            elapsed_ms,
            result: None,
            error: Some(error.into()),
            trace: None,
            behavior_log: Vec::new(),
            blocked_calls: Vec::new(),
            stderr: String::new(),
            truncated: false,
        }
    }
}

/// Call-time execution report
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub skill_id: String,
    pub success: bool,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub purity_violations: Vec<String>,
    pub safety_violations: Vec<String>,
}

/// Failure taxonomy across the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Malformed or oversized archive, traversal, missing entrypoint
    Packaging,
    /// Source failed to parse
    Syntax,
    /// Forbidden import/call or undeclared capability
    Security,
    /// Skill is not a pure, orchestration-unaware function
    Purity,
    /// Skill raised or returned an invalid result
    Runtime,
    /// Deadline exceeded
    Timeout,
    /// Error text suggesting an attempt to break out of the sandbox
    EscapeSuspicion,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Packaging => "packaging_error",
            Self::Syntax => "syntax_error",
            Self::Security => "security_violation",
            Self::Purity => "purity_violation",
            Self::Runtime => "runtime_failure",
            Self::Timeout => "timeout",
            Self::EscapeSuspicion => "escape_suspicion",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Archive and layout errors; every one is terminal
#[derive(Debug, thiserror::Error)]
pub enum PackagingError {
    #[error("archive is {actual} bytes, limit is {limit}")]
    ArchiveTooLarge { actual: u64, limit: u64 },
    #[error("archive has {actual} members, limit is {limit}")]
    TooManyMembers { actual: usize, limit: usize },
    #[error("archive expands to {actual} bytes, limit is {limit}")]
    UncompressedTooLarge { actual: u64, limit: u64 },
    #[error("unsafe archive member paths: {}", .0.join(", "))]
    UnsafePaths(Vec<String>),
    #[error("compiled or native code members: {}", .0.join(", "))]
    CompiledCode(Vec<String>),
    #[error("not a valid zip archive: {0}")]
    InvalidArchive(String),
    #[error("no entrypoint detected")]
    NoEntrypoint,
    #[error("manifest incomplete: {}", .0.join("; "))]
    ManifestIncomplete(Vec<String>),
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_parse() {
        assert_eq!(Permission::parse("network"), Some(Permission::Network));
        assert_eq!(Permission::parse(" FS_WRITE "), Some(Permission::FsWrite));
        assert_eq!(Permission::parse("root"), None);
    }

    #[test]
    fn test_declared_permissions_splits_unknown() {
        let manifest = SkillManifest {
            id: "x".into(),
            name: "X".into(),
            version: "1.0".into(),
            permissions: vec!["network".into(), "telepathy".into()],
        };
        let (known, unknown) = manifest.declared_permissions();
        assert!(known.contains(&Permission::Network));
        assert_eq!(unknown, vec!["telepathy".to_string()]);
    }

    #[test]
    fn test_missing_fields() {
        let manifest = SkillManifest {
            name: "X".into(),
            ..Default::default()
        };
        assert_eq!(manifest.missing_fields(), vec!["id", "version"]);
    }

    #[test]
    fn test_entrypoint_canonical() {
        assert!(EntrypointRecord::default().is_canonical());
        assert!(!EntrypointRecord::new("main.py", "main").is_canonical());
        assert_eq!(EntrypointRecord::new("main.py", "main").to_string(), "main.py:main");
    }

    #[test]
    fn test_verdict_serializes_camel_case() {
        let verdict = SafetyVerdict {
            ok: true,
            skill_id: "weather".into(),
            name: "Weather".into(),
            version: "1.0".into(),
            permissions: vec![Permission::Network],
            reasons: vec![],
            warnings: vec![],
        };
        let json = serde_json::to_value(&verdict).unwrap();
        assert_eq!(json["skillId"], "weather");
        assert_eq!(json["permissions"][0], "network");
    }
}
