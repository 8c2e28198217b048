//! Package Normalizer
//!
//! Turns an extracted directory into the canonical skill layout:
//! `manifest.json`, one entrypoint, declared permissions.
//!
//! Three shapes are accepted:
//!
//! 1. **Declarative**: a `skill.yaml` descriptor. The manifest comes from the
//!    descriptor and a zero-logic `skill.py` returning a canned message is
//!    written if none exists.
//! 2. **Canonical**: `skill.py` defining `execute(context)`.
//! 3. **Detected**: any other `.py` file with a recognizable entry function.
//!    The location is stored in `entrypoint.json` and resolved at load time.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::archive::{is_compiled_artifact, safe_member_path};
use super::descriptor::{slugify, Descriptor};
use super::syntax;
use super::types::{
    EntrypointRecord, ExtractedSkill, PackagingError, SkillManifest, SkillOrigin,
    CANONICAL_ENTRY_FILE, CANONICAL_ENTRY_FUNCTION, ENTRYPOINT_FILE, MANIFEST_FILE,
};

/// Entry function names recognized during detection, in preference order
const ENTRY_FUNCTIONS: [&str; 5] = ["execute", "main", "run", "handle", "process"];

/// Every `.py` file under `dir`, relative and sorted, skipping caches and
/// hidden directories
pub fn python_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            e.depth() == 0 || !(name.starts_with('.') || name == "__pycache__")
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().map(|x| x == "py").unwrap_or(false))
        .filter_map(|e| e.path().strip_prefix(dir).ok().map(Path::to_path_buf))
        .collect();
    files.sort();
    files
}

/// Compiled or native files anywhere under `dir`, caches included
fn compiled_files(dir: &Path) -> Vec<String> {
    let mut found: Vec<String> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.path().strip_prefix(dir).ok().map(Path::to_path_buf))
        .filter(|rel| is_compiled_artifact(rel))
        .map(|rel| display_path(&rel))
        .collect();
    found.sort();
    found
}

/// Relative path rendered with `/` separators
pub fn display_path(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Whether `path` defines a top-level `function` taking a positional
/// parameter. `None` when the file cannot be read or parsed.
fn defines_entry(path: &Path, function: &str) -> Option<bool> {
    let source = fs::read_to_string(path).ok()?;
    let parsed = syntax::parse(&source, &path.to_string_lossy()).ok()?;
    let found = parsed
        .top_level_functions()
        .any(|def| def.name.as_str() == function && positional_count(def) >= 1);
    Some(found)
}

fn positional_count(def: &rustpython_parser::ast::StmtFunctionDef) -> usize {
    def.args.posonlyargs.len() + def.args.args.len()
}

/// Find the entrypoint: `skill.py:execute`, then `main.py:main`, then the
/// best-ranked entry-like function in any other source file.
pub fn detect_entrypoint(dir: &Path) -> Option<EntrypointRecord> {
    let preferred = [
        (CANONICAL_ENTRY_FILE, CANONICAL_ENTRY_FUNCTION),
        ("main.py", "main"),
    ];
    for (file, function) in preferred {
        let path = dir.join(file);
        if !path.is_file() {
            continue;
        }
        // An unparseable preferred file is still the entrypoint; the
        // analyzer reports the syntax error with its location.
        match defines_entry(&path, function) {
            Some(true) | None => return Some(EntrypointRecord::new(file, function)),
            Some(false) => {}
        }
    }

    let mut candidates: Vec<(u8, usize, String, String)> = Vec::new();
    for rel in python_files(dir) {
        let file_name = rel
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if file_name.starts_with('_') {
            continue;
        }
        let Ok(source) = fs::read_to_string(dir.join(&rel)) else {
            continue;
        };
        let rel_display = display_path(&rel);
        let Ok(parsed) = syntax::parse(&source, &rel_display) else {
            continue;
        };
        for def in parsed.top_level_functions() {
            let Some(rank) = ENTRY_FUNCTIONS.iter().position(|f| *f == def.name.as_str()) else {
                continue;
            };
            if positional_count(def) >= 1 {
                let main_first = if file_name.eq_ignore_ascii_case("main.py") { 0 } else { 1 };
                candidates.push((main_first, rank, rel_display.clone(), def.name.as_str().to_string()));
            }
        }
    }

    candidates.sort();
    candidates
        .into_iter()
        .next()
        .map(|(_, _, file, function)| EntrypointRecord::new(file, function))
}

/// Read and check `manifest.json`
pub fn read_manifest(dir: &Path) -> Result<SkillManifest, PackagingError> {
    let text = fs::read_to_string(dir.join(MANIFEST_FILE))?;
    let mut manifest: SkillManifest = serde_json::from_str(&text)
        .map_err(|e| PackagingError::InvalidManifest(e.to_string()))?;

    manifest.id = manifest.id.trim().to_string();
    manifest.name = manifest.name.trim().to_string();
    manifest.version = manifest.version.trim().to_string();
    manifest.permissions = manifest
        .permissions
        .iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();

    let missing = manifest.missing_fields();
    if !missing.is_empty() {
        return Err(PackagingError::ManifestIncomplete(
            missing
                .into_iter()
                .map(|f| format!("manifest.json: missing {}", f))
                .collect(),
        ));
    }
    Ok(manifest)
}

fn write_manifest(dir: &Path, manifest: &SkillManifest) -> Result<(), PackagingError> {
    let json = serde_json::to_string_pretty(manifest)
        .map_err(|e| PackagingError::InvalidManifest(e.to_string()))?;
    fs::write(dir.join(MANIFEST_FILE), json)?;
    Ok(())
}

/// Persist (or clear) the indirection record for `entry`
fn write_entrypoint_record(dir: &Path, entry: &EntrypointRecord) -> Result<(), PackagingError> {
    let path = dir.join(ENTRYPOINT_FILE);
    if entry.is_canonical() {
        if path.exists() {
            fs::remove_file(&path)?;
        }
        return Ok(());
    }
    let json = serde_json::to_string_pretty(entry)
        .map_err(|e| PackagingError::InvalidManifest(e.to_string()))?;
    fs::write(path, json)?;
    Ok(())
}

/// Normalize an extracted directory in place
pub fn normalize(dir: &Path) -> Result<ExtractedSkill, PackagingError> {
    let compiled = compiled_files(dir);
    if !compiled.is_empty() {
        warn!("Refusing {:?}: {} compiled members", dir, compiled.len());
        return Err(PackagingError::CompiledCode(compiled));
    }

    let mut warnings = Vec::new();
    let has_manifest = dir.join(MANIFEST_FILE).is_file();

    if let Some(descriptor) = Descriptor::load(dir)? {
        info!("Declarative skill '{}' in {:?}", descriptor.id, dir);
        let manifest = if has_manifest {
            read_manifest(dir)?
        } else {
            let manifest = SkillManifest {
                id: descriptor.id.clone(),
                name: descriptor.name.clone(),
                version: descriptor.version.clone(),
                permissions: descriptor.permissions.clone(),
            };
            write_manifest(dir, &manifest)?;
            manifest
        };

        let entry_file = dir.join(CANONICAL_ENTRY_FILE);
        if entry_file.exists() {
            warnings.push("skill.yaml present but skill.py kept as supplied".to_string());
        } else {
            fs::write(&entry_file, descriptor.entry_source())?;
        }

        let entrypoint = EntrypointRecord::default();
        write_entrypoint_record(dir, &entrypoint)?;
        return Ok(ExtractedSkill {
            dir: dir.to_path_buf(),
            manifest,
            entrypoint,
            origin: SkillOrigin::Declarative,
            warnings,
        });
    }

    let entrypoint = detect_entrypoint(dir).ok_or(PackagingError::NoEntrypoint)?;
    debug!("Detected entrypoint {} in {:?}", entrypoint, dir);

    let manifest = if has_manifest {
        read_manifest(dir)?
    } else {
        let stem = Path::new(&entrypoint.file)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "skill".to_string());
        let manifest = SkillManifest {
            id: slugify(&stem),
            name: stem,
            version: "1.0".to_string(),
            permissions: Vec::new(),
        };
        warnings.push("manifest.json generated from entrypoint".to_string());
        write_manifest(dir, &manifest)?;
        manifest
    };

    if !entrypoint.is_canonical() {
        info!("Recording entrypoint {} for skill '{}'", entrypoint, manifest.id);
    }
    write_entrypoint_record(dir, &entrypoint)?;

    Ok(ExtractedSkill {
        dir: dir.to_path_buf(),
        manifest,
        entrypoint,
        origin: SkillOrigin::Source,
        warnings,
    })
}

/// Load an already-normalized skill, resolving its entrypoint record
pub fn load(dir: &Path) -> Result<ExtractedSkill, PackagingError> {
    let manifest = read_manifest(dir)?;

    let record_path = dir.join(ENTRYPOINT_FILE);
    let entrypoint = if record_path.is_file() {
        let text = fs::read_to_string(&record_path)?;
        let record: EntrypointRecord = serde_json::from_str(&text)
            .map_err(|e| PackagingError::InvalidManifest(format!("{}: {}", ENTRYPOINT_FILE, e)))?;
        if let Err(reason) = safe_member_path(&record.file) {
            warn!("Refusing entrypoint record in {:?}: {}", dir, reason);
            return Err(PackagingError::UnsafePaths(vec![reason]));
        }
        record
    } else {
        EntrypointRecord::default()
    };

    if !dir.join(&entrypoint.file).is_file() {
        return Err(PackagingError::NoEntrypoint);
    }

    let origin = if dir.join(super::descriptor::DESCRIPTOR_FILE).is_file() {
        SkillOrigin::Declarative
    } else {
        SkillOrigin::Source
    };

    Ok(ExtractedSkill {
        dir: dir.to_path_buf(),
        manifest,
        entrypoint,
        origin,
        warnings: Vec::new(),
    })
}
