//! SkillGate - Entry Point
//!
//! Commands:
//! - validate <zip|dir>: run the install-time pipeline
//! - test <dir>: one sandbox run, no install
//! - check <dir>: parse-only check of `skill.py`
//! - purity [skills_root]: purity summary, installed skills by default
//! - quarantine list | release <id>

use anyhow::{bail, Context};
use skillgate::skills::{purity, syntax, ReleaseLedger, SkillGate, SkillSandbox};
use skillgate::{Config, QuarantineStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

fn print_help() {
    println!("SkillGate v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: skillgate [OPTIONS] <COMMAND>");
    println!();
    println!("Commands:");
    println!("  validate <zip|dir>            Validate and install a skill package");
    println!("  test <dir> [--context JSON]   Run a skill once in the sandbox");
    println!("  check <dir>                   Check that skill.py parses");
    println!("  purity [skills_root]          Purity summary (default: install dir)");
    println!("  quarantine list               List quarantined submissions");
    println!("  quarantine release <id>       Release a quarantined submission");
    println!();
    println!("Options:");
    println!("  --config <path>    TOML config file");
    println!("  --json             Log as JSON lines on stderr");
    println!("  --version, -V      Show version");
    println!("  --help, -h         Show this help");
    println!();
    println!("Environment variables:");
    println!("  SKILLGATE_ZIP_MAX_MB               Archive size cap (default: 15)");
    println!("  SKILLGATE_ZIP_MAX_FILES            Member count cap (default: 60)");
    println!("  SKILLGATE_ZIP_MAX_UNCOMPRESSED_MB  Expanded size cap (default: 40)");
    println!("  SKILLGATE_SANDBOX_TIMEOUT          Sandbox deadline in seconds (default: 4)");
    println!("  SKILLGATE_PYTHON                   Interpreter (default: python3)");
    println!("  SKILLGATE_WORK_DIR                 Staging and scratch directory");
    println!("  SKILLGATE_INSTALL_DIR              Approved skills directory");
    println!("  SKILLGATE_QUARANTINE_DB            Quarantine database path");
    println!("  SKILLGATE_QUARANTINE_CAPACITY      Quarantine entries kept (default: 100)");
    println!("  SKILLGATE_INVOCATION_POLICY        trust_install | isolated");
}

/// Split `--flag value` options from positional arguments
fn take_option(args: &mut Vec<String>, flag: &str) -> anyhow::Result<Option<String>> {
    let Some(pos) = args.iter().position(|a| a == flag) else {
        return Ok(None);
    };
    if pos + 1 >= args.len() {
        bail!("{} requires a value", flag);
    }
    let value = args.remove(pos + 1);
    args.remove(pos);
    Ok(Some(value))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn build_gate(config: &Config) -> anyhow::Result<SkillGate> {
    let sandbox = Arc::new(SkillSandbox::new(config.sandbox_config()));
    let quarantine = Arc::new(open_quarantine(config)?);
    Ok(SkillGate::new(
        config.gate_settings(),
        sandbox,
        quarantine,
        config.invocation_policy,
    ))
}

fn open_quarantine(config: &Config) -> anyhow::Result<QuarantineStore> {
    Ok(QuarantineStore::open(&config.quarantine_db)
        .with_context(|| format!("Failed to open {}", config.quarantine_db.display()))?
        .with_capacity(config.quarantine_capacity))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Parse args
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let help_mode = args.iter().any(|a| a == "--help" || a == "-h");
    let version_mode = args.iter().any(|a| a == "--version" || a == "-V");
    let json_logs = args.iter().any(|a| a == "--json");
    args.retain(|a| a != "--json");

    if help_mode || args.is_empty() {
        print_help();
        return Ok(());
    }
    if version_mode {
        println!("skillgate {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // Logs go to stderr; stdout carries verdicts
    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    if json_logs {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    let config_path = take_option(&mut args, "--config")?.map(PathBuf::from);
    let context = take_option(&mut args, "--context")?;
    let config = match config_path {
        Some(path) => Config::load(Some(&path))?,
        None => Config::from_env()?,
    };

    let command: Vec<&str> = args.iter().map(String::as_str).collect();
    match command.as_slice() {
        ["validate", target] => {
            let gate = build_gate(&config)?;
            let target = Path::new(target);
            info!("SkillGate v{} validating {}", env!("CARGO_PKG_VERSION"), target.display());
            let report = if target.is_dir() {
                gate.validate_dir(target).await?
            } else {
                gate.validate_archive(target).await?
            };
            print_json(&report)?;
            if !report.ok {
                std::process::exit(1);
            }
        }
        ["test", dir] => {
            let gate = build_gate(&config)?;
            let context = match context {
                Some(raw) => Some(serde_json::from_str(&raw).context("--context is not valid JSON")?),
                None => None,
            };
            let outcome = gate.test(Path::new(dir), context).await?;
            print_json(&outcome)?;
            if !outcome.success {
                std::process::exit(1);
            }
        }
        ["check", dir] => {
            let ok = syntax::quick_syntax_check(Path::new(dir));
            print_json(&serde_json::json!({ "ok": ok }))?;
            if !ok {
                std::process::exit(1);
            }
        }
        ["purity"] => print_json(&purity::purity_summary(&config.install_dir)?)?,
        ["purity", root] => print_json(&purity::purity_summary(Path::new(root))?)?,
        ["quarantine", "list"] => {
            let store = open_quarantine(&config)?;
            print_json(&store.list()?)?;
        }
        ["quarantine", "release", id] => {
            let store = open_quarantine(&config)?;
            let ledger = ReleaseLedger::new(config.release_ledger_path());
            let released = store.release(id, &ledger)?;
            info!("Released {} into {}", released.id, ledger.path().display());
            print_json(&released)?;
        }
        _ => {
            print_help();
            bail!("Unknown command: {}", args.join(" "));
        }
    }

    Ok(())
}
