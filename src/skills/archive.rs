//! Skill Archive Unpacking
//!
//! Extracts an uploaded zip into a fresh directory after checking the whole
//! central directory first: archive size, member count, declared expansion
//! size, and member paths. Nothing is written until every member passes.
//! Bytecode and native libraries are refused outright: only source can be
//! analyzed.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

use super::types::PackagingError;

/// Drive-letter absolute paths (`C:/...`, `c:\...`)
static DRIVE_PATH: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z]:").unwrap());

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// Size caps applied before and during extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveLimits {
    pub max_archive_bytes: u64,
    pub max_members: usize,
    pub max_uncompressed_bytes: u64,
}

impl Default for ArchiveLimits {
    fn default() -> Self {
        Self {
            max_archive_bytes: 15 * 1024 * 1024,
            max_members: 60,
            max_uncompressed_bytes: 40 * 1024 * 1024,
        }
    }
}

/// Validate one member name and turn it into a relative path.
///
/// Returns `Err` with the reason for absolute, drive-letter, traversing or
/// NUL-containing names.
pub fn safe_member_path(name: &str) -> Result<PathBuf, String> {
    let normalized = name.replace('\\', "/");
    if normalized.contains('\0') {
        return Err(format!("{:?}: NUL byte in path", name));
    }
    if normalized.starts_with('/') {
        return Err(format!("{}: absolute path", name));
    }
    if DRIVE_PATH.is_match(&normalized) {
        return Err(format!("{}: drive-letter path", name));
    }

    let mut rel = PathBuf::new();
    for segment in normalized.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(format!("{}: parent directory segment", name)),
            s => rel.push(s),
        }
    }

    // Re-check with the platform's own path rules
    if rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(format!("{}: non-relative path", name));
    }
    if rel.as_os_str().is_empty() {
        return Err(format!("{}: empty path", name));
    }
    Ok(rel)
}

/// Extensions of compiled bytecode and native libraries
const COMPILED_EXTENSIONS: [&str; 6] = ["pyc", "pyo", "so", "pyd", "dll", "dylib"];

/// Whether a member path is compiled or native code, or sits in `__pycache__`
pub fn is_compiled_artifact(rel: &Path) -> bool {
    if rel.components().any(|c| c.as_os_str() == "__pycache__") {
        return true;
    }
    let Some(name) = rel.file_name().map(|n| n.to_string_lossy().to_lowercase()) else {
        return false;
    };
    // versioned shared objects: libfoo.so.1
    name.contains(".so.")
        || rel
            .extension()
            .map(|e| COMPILED_EXTENSIONS.contains(&e.to_string_lossy().to_lowercase().as_str()))
            .unwrap_or(false)
}

struct PlannedMember {
    index: usize,
    rel: PathBuf,
}

/// Unpack `archive` into `dest`, returning the skill root directory.
///
/// When every member sits under one top-level folder, that folder is the
/// skill root.
pub fn unpack(archive: &Path, limits: &ArchiveLimits, dest: &Path) -> Result<PathBuf, PackagingError> {
    let size = fs::metadata(archive)?.len();
    if size > limits.max_archive_bytes {
        return Err(PackagingError::ArchiveTooLarge {
            actual: size,
            limit: limits.max_archive_bytes,
        });
    }

    let file = fs::File::open(archive)?;
    let mut zip =
        zip::ZipArchive::new(file).map_err(|e| PackagingError::InvalidArchive(e.to_string()))?;

    let mut plan = Vec::new();
    let mut problems = Vec::new();
    let mut compiled = Vec::new();
    let mut declared_total: u64 = 0;

    for index in 0..zip.len() {
        let entry = zip
            .by_index(index)
            .map_err(|e| PackagingError::InvalidArchive(e.to_string()))?;
        let name = entry.name().to_string();

        if entry.is_dir() {
            if let Err(reason) = safe_member_path(&name) {
                // "./" style roots are harmless, anything else is not
                if !matches!(name.as_str(), "./" | ".") {
                    problems.push(reason);
                }
            }
            continue;
        }

        if entry
            .unix_mode()
            .map(|mode| mode & S_IFMT == S_IFLNK)
            .unwrap_or(false)
        {
            problems.push(format!("{}: symbolic link", name));
            continue;
        }

        match safe_member_path(&name) {
            Ok(rel) if is_compiled_artifact(&rel) => compiled.push(name),
            Ok(rel) => {
                declared_total = declared_total.saturating_add(entry.size());
                plan.push(PlannedMember { index, rel });
            }
            Err(reason) => problems.push(reason),
        }
    }

    if !problems.is_empty() {
        warn!("Rejected archive {:?}: {} unsafe members", archive, problems.len());
        return Err(PackagingError::UnsafePaths(problems));
    }
    if !compiled.is_empty() {
        warn!("Rejected archive {:?}: {} compiled members", archive, compiled.len());
        return Err(PackagingError::CompiledCode(compiled));
    }
    if plan.len() > limits.max_members {
        return Err(PackagingError::TooManyMembers {
            actual: plan.len(),
            limit: limits.max_members,
        });
    }
    if declared_total > limits.max_uncompressed_bytes {
        return Err(PackagingError::UncompressedTooLarge {
            actual: declared_total,
            limit: limits.max_uncompressed_bytes,
        });
    }

    fs::create_dir_all(dest)?;
    let mut written: u64 = 0;

    for member in &plan {
        let entry = zip
            .by_index(member.index)
            .map_err(|e| PackagingError::InvalidArchive(e.to_string()))?;
        let target = dest.join(&member.rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        // Declared sizes can lie; bound what is actually inflated
        let remaining = limits.max_uncompressed_bytes - written;
        let mut out = fs::File::create(&target)?;
        let copied = io::copy(&mut entry.take(remaining + 1), &mut out)?;
        written += copied;
        if written > limits.max_uncompressed_bytes {
            return Err(PackagingError::UncompressedTooLarge {
                actual: written,
                limit: limits.max_uncompressed_bytes,
            });
        }
        debug!("Extracted {:?} ({} bytes)", member.rel, copied);
    }

    info!("Unpacked {} members ({} bytes) into {:?}", plan.len(), written, dest);
    Ok(skill_root(dest)?)
}

/// Descend into a lone top-level folder
fn skill_root(dest: &Path) -> io::Result<PathBuf> {
    let entries: Vec<_> = fs::read_dir(dest)?.filter_map(|e| e.ok()).collect();
    if entries.len() == 1 && entries[0].file_type()?.is_dir() {
        return Ok(entries[0].path());
    }
    Ok(dest.to_path_buf())
}
