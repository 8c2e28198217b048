//! SkillGate
//!
//! Ingestion gate for untrusted, third-party skills: decides whether a
//! skill's code is safe to execute at all, and whether it behaves as a pure,
//! orchestration-unaware function.
//!
//! # Features
//!
//! - **Package Normalizer**: zip-bomb and path-traversal defenses, entrypoint detection
//! - **Static Security Analyzer**: syntax-tree scan with declare-before-use permissions
//! - **Purity Validator**: no generative backends, no skill composition, bounded complexity
//! - **Sandbox Runner**: one isolated interpreter process per run, hard deadline
//! - **Execution Validator**: call-time context and result contract
//! - **Quarantine**: bounded store with explicit release
//!
//! # Architecture
//!
//! ```text
//! archive/dir ──► SkillGate ──► normalizer ──► analyzer ──► purity ──► sandbox
//!                    │                                                  │
//!                    ├── Quarantine (SQLite)  ◄──── rejected ───────────┤
//!                    └── install root         ◄──── approved ───────────┘
//! ```

pub mod config;
pub mod skills;

pub use config::Config;
pub use skills::{
    ExecutionValidator, GateReport, InvocationPolicy, QuarantineStore, SkillGate, SkillSandbox,
};
