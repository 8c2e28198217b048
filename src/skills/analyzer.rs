//! Static Security Analyzer
//!
//! Walks the syntax tree of every source file in a skill and rejects
//! dangerous code before any of it runs. Working on the tree rather than on
//! text means comments and string contents are never mistaken for code.
//!
//! # Rules
//!
//! - Disallowed module import → violation
//! - Networking module import without the `network` permission → violation
//! - Direct call to a dynamic-evaluation builtin → violation
//! - Attribute call whose method looks like process execution → violation,
//!   whatever the receiver is
//! - Call or import that reaches the sandbox's own descriptors, signals or
//!   process lifetime (`os.write`, `os._exit`, `signal`) → violation
//! - String literal equal to a credential/env-var name → warning

use once_cell::sync::Lazy;
use regex::Regex;
use rustpython_parser::ast;
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

use super::normalizer::{display_path, python_files};
use super::syntax::{self, call_leaf, dotted_name, str_constant, walk_expr, walk_stmt, ParsedSource, Visitor};
use super::types::{AnalysisReport, Finding, Permission};

/// Modules a skill may never import
pub static FORBIDDEN_MODULES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "ctypes",
        "socket",
        "importlib",
        "inspect",
        "asyncio.subprocess",
        "subprocess",
        "shutil",
        "multiprocessing",
        "pty",
        "win32api",
        "win32con",
        "win32gui",
        "pyautogui",
        "keyring",
        "getpass",
    ]
    .into_iter()
    .collect()
});

/// Modules that need the `network` permission
pub static NETWORK_MODULES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "requests",
        "httpx",
        "urllib",
        "urllib3",
        "aiohttp",
        "http.client",
        "ftplib",
        "smtplib",
        "poplib",
        "imaplib",
        "websocket",
        "websockets",
    ]
    .into_iter()
    .collect()
});

/// Modules that can disarm the sandbox deadline or reach harness state
pub const TAMPER_MODULES: [&str; 4] = ["signal", "faulthandler", "gc", "resource"];

/// `os` functions on raw descriptors or the process itself, flagged whatever the receiver
const TAMPER_METHODS: [&str; 9] = [
    "_exit",
    "abort",
    "dup",
    "dup2",
    "fdopen",
    "closerange",
    "kill",
    "killpg",
    "setitimer",
];

/// Builtins that evaluate code
pub const FORBIDDEN_CALLS: [&str; 4] = ["eval", "exec", "compile", "__import__"];

/// Credential and environment names that should not appear in skill code
pub static SENSITIVE_NAMES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "TELEGRAM_TOKEN",
        "TELEGRAM_BOT_TOKEN",
        "TELEGRAM_API_KEY",
        "WHATSAPP_TOKEN",
        "WHATSAPP_ACCESS_TOKEN",
        "OPENAI_API_KEY",
        "ANTHROPIC_API_KEY",
        "GROQ_API_KEY",
        "GEMINI_API_KEY",
        "ADMIN_PASSWORD",
        "SECRET_KEY",
        "JWT_SECRET",
        "DATABASE_URL",
        "DB_PASSWORD",
        "REDIS_PASSWORD",
        "MONGO_URI",
        "AWS_ACCESS_KEY_ID",
        "AWS_SECRET_ACCESS_KEY",
        "AWS_SESSION_TOKEN",
        "AZURE_CLIENT_SECRET",
        "AZURE_STORAGE_KEY",
        "GCP_SERVICE_ACCOUNT_KEY",
        "GITHUB_TOKEN",
        "GITLAB_TOKEN",
        "DOCKER_TOKEN",
        "STRIPE_SECRET_KEY",
        "PAYPAL_CLIENT_SECRET",
        "PASSWORD",
        "SECRET",
        "PRIVATE_KEY",
        "API_SECRET",
        "AUTH_TOKEN",
        "EMAIL_PASSWORD",
        "SMTP_PASSWORD",
        "IMAP_PASSWORD",
        "SSH_KEY",
    ]
    .into_iter()
    .collect()
});

/// Method names that spawn processes or run shell commands
static SHELL_METHOD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(system|popen|Popen|run|call|check_call|check_output|getoutput|getstatusoutput|startfile|spawn[lv]p?e?|exec[lv]p?e?|posix_spawnp?)$",
    )
    .unwrap()
});

/// Calls that mutate the filesystem
const FS_WRITE_CALLS: [&str; 9] = [
    "remove",
    "unlink",
    "rmdir",
    "removedirs",
    "makedirs",
    "mkdir",
    "rename",
    "write_text",
    "write_bytes",
];

/// Every dotted prefix: `a.b.c` → `a`, `a.b`, `a.b.c`
fn prefixes(module: &str) -> impl Iterator<Item = &str> {
    module
        .match_indices('.')
        .map(move |(i, _)| &module[..i])
        .chain(std::iter::once(module))
}

fn forbidden_module(module: &str) -> Option<&str> {
    prefixes(module).find(|p| FORBIDDEN_MODULES.contains(p))
}

fn tamper_module(module: &str) -> Option<&str> {
    prefixes(module).find(|p| TAMPER_MODULES.contains(p))
}

fn network_module(module: &str) -> Option<&str> {
    prefixes(module).find(|p| NETWORK_MODULES.contains(p))
}

/// Literal mode argument of an `open(...)` call
fn open_mode(call: &ast::ExprCall) -> Option<&str> {
    call.keywords
        .iter()
        .find(|kw| kw.arg.as_ref().map(|a| a.as_str() == "mode").unwrap_or(false))
        .and_then(|kw| str_constant(&kw.value))
        .or_else(|| call.args.get(1).and_then(str_constant))
}

struct SecurityVisitor<'a> {
    parsed: &'a ParsedSource,
    declared: &'a BTreeSet<Permission>,
    report: &'a mut AnalysisReport,
}

impl<'a> SecurityVisitor<'a> {
    fn violation(&mut self, line: u32, code: &str, message: String) {
        self.report
            .violations
            .push(Finding::new(code, message).at(&self.parsed.path, line));
    }

    fn warning(&mut self, line: u32, code: &str, message: String) {
        self.report
            .warnings
            .push(Finding::new(code, message).at(&self.parsed.path, line));
    }

    fn operation(&mut self, op: &str) {
        if !self.report.detected_operations.iter().any(|o| o == op) {
            self.report.detected_operations.push(op.to_string());
        }
    }

    /// Check the modules named by one import statement
    fn check_imports(&mut self, line: u32, modules: &[String]) {
        let mut network_hit: Option<String> = None;
        for module in modules {
            if let Some(m) = forbidden_module(module) {
                self.violation(line, "forbidden_import", format!("forbidden import: {}", m));
            }
            if let Some(m) = tamper_module(module) {
                self.violation(line, "sandbox_tampering", format!("sandbox tampering import: {}", m));
            }
            if network_hit.is_none() {
                network_hit = network_module(module).map(str::to_string);
            }
        }

        if let Some(module) = network_hit {
            self.report.permissions_required.insert(Permission::Network);
            self.operation("network_import");
            if !self.declared.contains(&Permission::Network) {
                self.violation(
                    line,
                    "undeclared_network",
                    format!("import of {} requires the 'network' permission", module),
                );
            }
        }
    }

    fn check_call(&mut self, call: &ast::ExprCall) {
        let line = self.parsed.line_of(call);

        if let ast::Expr::Name(ast::ExprName { id, .. }) = call.func.as_ref() {
            let name = id.as_str();
            if FORBIDDEN_CALLS.contains(&name) {
                self.violation(line, "forbidden_call", format!("forbidden call: {}()", name));
            }
            if name == "open" {
                if let Some(mode) = open_mode(call) {
                    if mode.contains(['w', 'a', 'x', '+']) {
                        self.fs_write(line, "open(..., mode)");
                    }
                }
            }
        }

        if let ast::Expr::Attribute(ast::ExprAttribute { attr, .. }) = call.func.as_ref() {
            let method = attr.as_str();
            if SHELL_METHOD.is_match(method) {
                let target = dotted_name(&call.func).unwrap_or_else(|| format!(".{}", method));
                self.violation(
                    line,
                    "command_execution",
                    format!("possible command execution: {}()", target),
                );
            }
            if FS_WRITE_CALLS.contains(&method) {
                self.fs_write(line, &format!(".{}()", method));
            }
            let target = dotted_name(&call.func);
            let raw_write = target.as_deref() == Some("os.write");
            if raw_write || TAMPER_METHODS.contains(&method) {
                let target = target.unwrap_or_else(|| format!(".{}", method));
                self.violation(line, "sandbox_tampering", format!("sandbox tampering call: {}()", target));
            }
        }

        if call_leaf(&call.func) == Some("getenv") {
            self.operation("env_access");
            self.warning(line, "env_access", "reads environment variables".to_string());
        }
    }

    fn fs_write(&mut self, line: u32, what: &str) {
        self.report.permissions_required.insert(Permission::FsWrite);
        self.operation("file_write");
        if !self.declared.contains(&Permission::FsWrite) {
            self.warning(
                line,
                "undeclared_fs_write",
                format!("file write {} without the 'fs_write' permission", what),
            );
        }
    }
}

impl<'a> Visitor for SecurityVisitor<'a> {
    fn visit_stmt(&mut self, stmt: &ast::Stmt) {
        match stmt {
            ast::Stmt::Import(ast::StmtImport { names, .. }) => {
                let line = self.parsed.line_of(stmt);
                let modules: Vec<String> = names.iter().map(|a| a.name.as_str().to_string()).collect();
                self.check_imports(line, &modules);
            }
            ast::Stmt::ImportFrom(ast::StmtImportFrom {
                module,
                names,
                level,
                ..
            }) => {
                let relative = level.map(|l| l.to_u32() > 0).unwrap_or(false);
                if let (false, Some(module)) = (relative, module) {
                    let line = self.parsed.line_of(stmt);
                    let base = module.as_str();
                    let mut modules = vec![base.to_string()];
                    modules.extend(
                        names
                            .iter()
                            .filter(|a| a.name.as_str() != "*")
                            .map(|a| format!("{}.{}", base, a.name.as_str())),
                    );
                    self.check_imports(line, &modules);

                    if base == "os" {
                        for alias in names {
                            let name = alias.name.as_str();
                            if SHELL_METHOD.is_match(name) {
                                self.violation(
                                    line,
                                    "command_execution",
                                    format!("possible command execution: os.{}", name),
                                );
                            }
                            if name == "write" || TAMPER_METHODS.contains(&name) {
                                self.violation(
                                    line,
                                    "sandbox_tampering",
                                    format!("sandbox tampering import: os.{}", name),
                                );
                            }
                        }
                    }
                }
            }
            _ => {}
        }
        walk_stmt(self, stmt);
    }

    fn visit_expr(&mut self, expr: &ast::Expr) {
        match expr {
            ast::Expr::Call(call) => self.check_call(call),
            ast::Expr::Attribute(ast::ExprAttribute { attr, .. }) if attr.as_str() == "environ" => {
                let line = self.parsed.line_of(expr);
                self.operation("env_access");
                self.warning(line, "env_access", "reads environment variables".to_string());
            }
            ast::Expr::Constant(_) => {
                if let Some(s) = str_constant(expr) {
                    if SENSITIVE_NAMES.contains(s) {
                        let line = self.parsed.line_of(expr);
                        self.warning(
                            line,
                            "sensitive_name",
                            format!("string literal names a credential: {}", s),
                        );
                    }
                }
            }
            _ => {}
        }
        walk_expr(self, expr);
    }
}

/// Analyze one already-parsed file into `report`
pub fn analyze_parsed(parsed: &ParsedSource, declared: &BTreeSet<Permission>, report: &mut AnalysisReport) {
    let mut visitor = SecurityVisitor {
        parsed,
        declared,
        report,
    };
    syntax::walk_body(&mut visitor, &parsed.suite);
}

/// Analyze a single source text
pub fn analyze_source(source: &str, path: &str, declared: &BTreeSet<Permission>) -> AnalysisReport {
    let mut report = AnalysisReport::default();
    match syntax::parse(source, path) {
        Ok(parsed) => analyze_parsed(&parsed, declared, &mut report),
        Err(err) => report.syntax_error = Some(err),
    }
    report
}

/// Analyze every source file of a skill directory
pub fn analyze_dir(dir: &Path, declared: &BTreeSet<Permission>) -> std::io::Result<AnalysisReport> {
    let mut report = AnalysisReport::default();
    for rel in python_files(dir) {
        let rel_display = display_path(&rel);
        let bytes = fs::read(dir.join(&rel))?;
        let source = String::from_utf8_lossy(&bytes);
        match syntax::parse(&source, &rel_display) {
            Ok(parsed) => analyze_parsed(&parsed, declared, &mut report),
            Err(err) => {
                debug!("Syntax error in {}: {}", rel_display, err.message);
                if report.syntax_error.is_none() {
                    report.syntax_error = Some(err);
                }
            }
        }
    }

    if !report.violations.is_empty() {
        warn!(
            "Static analysis of {:?}: {} violations",
            dir,
            report.violations.len()
        );
    }
    Ok(report)
}
