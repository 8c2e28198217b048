//! Skill Ingestion Pipeline
//!
//! Decides whether third-party skill code may ever be invoked by the agent.
//!
//! # Architecture
//!
//! ```text
//! SkillPackage ─▶ archive ─▶ normalizer ─▶ analyzer ─▶ purity ─▶ sandbox
//!                                                                  │
//!                        report + quarantine ◀──── verdict ◀───────┘
//!
//! call time:  context ─▶ execution (purity again, context/result contract)
//! ```
//!
//! # Skill Layout
//!
//! After normalization a skill directory holds:
//!
//! ```text
//! manifest.json      {"id", "name", "version", "permissions": [...]}
//! skill.py           canonical entry, or any file named by entrypoint.json
//! entrypoint.json    {"file": "tools/main.py", "function": "run"} (optional)
//! skill.yaml         declarative descriptor (optional)
//! ```
//!
//! # Security
//!
//! Source is inspected as a typed syntax tree and never executed to be
//! analyzed. The only execution happens in the sandbox: a separate
//! interpreter process with a cleared environment, an audit-hook monitor and
//! a hard deadline.

pub mod analyzer;
pub mod archive;
pub mod descriptor;
pub mod execution;
pub mod normalizer;
pub mod pipeline;
pub mod purity;
pub mod quarantine;
pub mod report;
pub mod sandbox;
pub mod syntax;
pub mod types;

pub use archive::ArchiveLimits;
pub use execution::{ExecutionStats, ExecutionValidator, InvocationError, InvocationPolicy, SkillInvoker};
pub use pipeline::{GateReport, GateSettings, SkillGate};
pub use quarantine::{
    Admission, QuarantineBackend, QuarantineEntry, QuarantineError, QuarantineStatus, QuarantineStore,
    ReleaseLedger,
};
pub use report::{SkillReport, StageRecord};
pub use sandbox::{SandboxConfig, SkillSandbox};
pub use types::{
    AnalysisReport, EntrypointRecord, ExecutionOutcome, ExecutionReport, ExecutionStatus, ExtractedSkill,
    FailureKind, Finding, PackagingError, Permission, PurityVerdict, SafetyVerdict, SkillManifest,
};
