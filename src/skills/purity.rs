//! Purity Validator
//!
//! Enforces that a skill is a pure function of its context, unaware of the
//! orchestration around it: if it ran standalone with no intelligence layer
//! behind it, it would behave identically.
//!
//! Works on the syntax trees of the skill's source files and is independent
//! of the static analyzer, so the call-time gate can run it on its own.
//! Helper modules get the whole-file checks; the entry function checks
//! apply to the entry file.
//!
//! # Checks
//!
//! | Check | Outcome |
//! |-------|---------|
//! | one entry function taking one positional parameter | violation |
//! | generative-backend identifiers | violation |
//! | invoking other skills | violation |
//! | process/frame/module introspection, dynamic import | violation |
//! | banned dynamic-execution builtins | violation |
//! | `if` nesting deeper than 3 (warning at 3) | violation |
//! | no value-returning `return` (warning for non-mapping returns) | violation |
//! | module-level mutable state, `global`, `nonlocal` | violation |

use once_cell::sync::Lazy;
use rustpython_parser::ast;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::normalizer::{self, display_path, python_files};
use super::syntax::{
    self, call_leaf, docstring, dotted_name, str_constant, walk_expr, walk_stmt, ParsedSource,
    Visitor,
};
use super::types::{
    ExtractedSkill, Finding, InputContract, OutputContract, PurityVerdict, CANONICAL_ENTRY_FILE,
    CANONICAL_ENTRY_FUNCTION,
};

/// Deepest allowed `if` nesting inside one function
pub const MAX_CONDITIONAL_DEPTH: usize = 3;

/// Identifier segments tied to generative backends
static LLM_SEGMENTS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "openai",
        "anthropic",
        "groq",
        "gemini",
        "claude",
        "gpt",
        "llm",
        "ai",
        "langchain",
        "transformers",
        "torch",
        "ollama",
        "mistral",
        "cohere",
    ]
    .into_iter()
    .collect()
});

/// Whole identifiers tied to generative backends
static LLM_NAMES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "llama_index",
        "generate_text",
        "ask_llm",
        "query_llm",
        "call_llm",
        "get_ai_response",
    ]
    .into_iter()
    .collect()
});

/// Dotted fragments of completion APIs
const LLM_DOTTED: [&str; 2] = ["chat.completions", "completions.create"];

/// Calls that hand control to another skill
const SKILL_CALLS: [&str; 5] = ["run_skill", "call_skill", "invoke_skill", "execute_skill", "load_skill"];

/// Packages holding other skills
const SKILL_PACKAGES: [&str; 3] = ["skill", "skills", "skills_user"];

/// Dotted names that reach into the interpreter
const INTROSPECTION_DOTTED: [&str; 5] = [
    "sys.modules",
    "sys._getframe",
    "os.environ",
    "os.getenv",
    "sys.settrace",
];

/// Attribute names that reach into frames, code objects or class internals
const INTROSPECTION_ATTRS: [&str; 9] = [
    "__subclasses__",
    "__globals__",
    "__code__",
    "__builtins__",
    "__loader__",
    "__spec__",
    "f_back",
    "f_globals",
    "f_locals",
];

/// Bare names that reach into the interpreter
const INTROSPECTION_NAMES: [&str; 5] = ["__builtins__", "__loader__", "__spec__", "getenv", "reload"];

/// Modules for introspection or dynamic import
const INTROSPECTION_MODULES: [&str; 3] = ["importlib", "imp", "inspect"];

/// Builtins that execute code or reach namespaces dynamically
const BANNED_BUILTINS: [&str; 12] = [
    "eval",
    "exec",
    "compile",
    "__import__",
    "globals",
    "locals",
    "vars",
    "getattr",
    "setattr",
    "delattr",
    "breakpoint",
    "input",
];

/// Constructors producing mutable containers
const MUTABLE_CONSTRUCTORS: [&str; 8] = [
    "list",
    "dict",
    "set",
    "bytearray",
    "defaultdict",
    "deque",
    "OrderedDict",
    "Counter",
];

/// Match an identifier against generative-backend vocabulary
fn llm_token(identifier: &str) -> Option<String> {
    let lower = identifier.to_lowercase();
    if LLM_NAMES.contains(lower.as_str()) {
        return Some(lower);
    }
    for pattern in LLM_DOTTED {
        if lower.contains(pattern) {
            return Some(pattern.to_string());
        }
    }
    lower
        .split(|c: char| c == '_' || c == '.')
        .map(|seg| seg.trim_end_matches(|c: char| c.is_ascii_digit()))
        .find(|seg| LLM_SEGMENTS.contains(seg))
        .map(str::to_string)
}

fn is_mapping_expr(expr: &ast::Expr) -> bool {
    match expr {
        ast::Expr::Dict(_) | ast::Expr::DictComp(_) => true,
        ast::Expr::Call(call) => matches!(
            call.func.as_ref(),
            ast::Expr::Name(ast::ExprName { id, .. }) if id.as_str() == "dict"
        ),
        _ => false,
    }
}

fn is_mutable_value(expr: &ast::Expr) -> bool {
    match expr {
        ast::Expr::List(_)
        | ast::Expr::Dict(_)
        | ast::Expr::Set(_)
        | ast::Expr::ListComp(_)
        | ast::Expr::DictComp(_)
        | ast::Expr::SetComp(_) => true,
        ast::Expr::Call(call) => call_leaf(&call.func)
            .map(|leaf| MUTABLE_CONSTRUCTORS.contains(&leaf))
            .unwrap_or(false),
        _ => false,
    }
}

fn target_names(expr: &ast::Expr, out: &mut Vec<String>) {
    match expr {
        ast::Expr::Name(ast::ExprName { id, .. }) => out.push(id.as_str().to_string()),
        ast::Expr::Tuple(ast::ExprTuple { elts, .. }) | ast::Expr::List(ast::ExprList { elts, .. }) => {
            for e in elts {
                target_names(e, out);
            }
        }
        _ => {}
    }
}

fn is_constant_name(name: &str) -> bool {
    name.chars().any(|c| c.is_ascii_uppercase())
        && name.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

/// Deepest `if` nesting in a body, not descending into nested definitions.
/// An `elif` chain stays at the depth of its first `if`.
fn max_if_depth(body: &[ast::Stmt], depth: usize) -> usize {
    body.iter().map(|s| stmt_if_depth(s, depth)).max().unwrap_or(depth)
}

fn stmt_if_depth(stmt: &ast::Stmt, depth: usize) -> usize {
    use ast::Stmt;
    match stmt {
        Stmt::If(ast::StmtIf { body, orelse, .. }) => {
            let inner = max_if_depth(body, depth + 1);
            let other = match orelse.as_slice() {
                [elif @ Stmt::If(_)] => stmt_if_depth(elif, depth),
                rest => max_if_depth(rest, depth + 1),
            };
            inner.max(other)
        }
        Stmt::For(ast::StmtFor { body, orelse, .. })
        | Stmt::AsyncFor(ast::StmtAsyncFor { body, orelse, .. })
        | Stmt::While(ast::StmtWhile { body, orelse, .. }) => {
            max_if_depth(body, depth).max(max_if_depth(orelse, depth))
        }
        Stmt::With(ast::StmtWith { body, .. }) | Stmt::AsyncWith(ast::StmtAsyncWith { body, .. }) => {
            max_if_depth(body, depth)
        }
        Stmt::Try(ast::StmtTry {
            body,
            handlers,
            orelse,
            finalbody,
            ..
        })
        | Stmt::TryStar(ast::StmtTryStar {
            body,
            handlers,
            orelse,
            finalbody,
            ..
        }) => {
            let mut d = max_if_depth(body, depth)
                .max(max_if_depth(orelse, depth))
                .max(max_if_depth(finalbody, depth));
            for handler in handlers {
                let ast::ExceptHandler::ExceptHandler(h) = handler;
                d = d.max(max_if_depth(&h.body, depth));
            }
            d
        }
        Stmt::Match(ast::StmtMatch { cases, .. }) => cases
            .iter()
            .map(|c| max_if_depth(&c.body, depth))
            .max()
            .unwrap_or(depth),
        _ => depth,
    }
}

/// Whole-file scan: vocabulary, skill calls, introspection, builtins,
/// nesting and shared state
struct FileScan<'a> {
    parsed: &'a ParsedSource,
    entry: &'a str,
    violations: Vec<Finding>,
    warnings: Vec<Finding>,
    reported_llm: HashSet<String>,
    reported_introspection: HashSet<String>,
}

impl<'a> FileScan<'a> {
    fn violation(&mut self, line: u32, code: &str, message: String) {
        self.violations.push(Finding::new(code, message).at(&self.parsed.path, line));
    }

    fn warning(&mut self, line: u32, code: &str, message: String) {
        self.warnings.push(Finding::new(code, message).at(&self.parsed.path, line));
    }

    fn check_llm(&mut self, line: u32, identifier: &str) {
        if let Some(token) = llm_token(identifier) {
            if self.reported_llm.insert(token.clone()) {
                self.violation(
                    line,
                    "llm_reference",
                    format!("references generative backend '{}' via '{}'", token, identifier),
                );
            }
        }
    }

    fn check_introspection(&mut self, line: u32, what: &str) {
        if self.reported_introspection.insert(what.to_string()) {
            self.violation(line, "introspection", format!("introspection or dynamic import: {}", what));
        }
    }

    fn check_import_path(&mut self, line: u32, module: &str) {
        self.check_llm(line, module);
        let first = module.split('.').next().unwrap_or(module);
        if SKILL_PACKAGES.contains(&first) {
            self.violation(line, "skill_invocation", format!("imports skill package '{}'", module));
        }
        if INTROSPECTION_MODULES.contains(&first) {
            self.check_introspection(line, first);
        }
    }

    fn check_call(&mut self, line: u32, call: &ast::ExprCall) {
        match call.func.as_ref() {
            ast::Expr::Name(ast::ExprName { id, .. }) => {
                let name = id.as_str();
                if BANNED_BUILTINS.contains(&name) {
                    self.violation(line, "banned_builtin", format!("calls banned builtin {}()", name));
                }
                if SKILL_CALLS.contains(&name) {
                    self.violation(line, "skill_invocation", format!("invokes another skill via {}()", name));
                }
                if name == self.entry {
                    self.violation(
                        line,
                        "skill_invocation",
                        format!("calls entry function {}() recursively", name),
                    );
                }
            }
            ast::Expr::Attribute(ast::ExprAttribute { attr, .. }) => {
                let method = attr.as_str();
                if SKILL_CALLS.contains(&method) || method == "execute" {
                    let target = dotted_name(&call.func).unwrap_or_else(|| format!(".{}", method));
                    self.violation(line, "skill_invocation", format!("invokes another skill via {}()", target));
                }
            }
            _ => {}
        }
    }

    fn check_module_binding(&mut self, line: u32, targets: &[&ast::Expr], value: &ast::Expr) {
        if !is_mutable_value(value) {
            return;
        }
        let mut names = Vec::new();
        for t in targets {
            target_names(t, &mut names);
        }
        for name in names {
            if is_constant_name(&name) {
                self.warning(
                    line,
                    "mutable_module_state",
                    format!("module-level constant '{}' is a mutable container", name),
                );
            } else {
                self.violation(
                    line,
                    "mutable_module_state",
                    format!("module-level mutable state '{}'", name),
                );
            }
        }
    }

    /// Module-level statements, descending through control flow but not
    /// into function or class bodies
    fn scan_module_state(&mut self, body: &[ast::Stmt]) {
        use ast::Stmt;
        for stmt in body {
            let line = self.parsed.line_of(stmt);
            match stmt {
                Stmt::Assign(ast::StmtAssign { targets, value, .. }) => {
                    let refs: Vec<&ast::Expr> = targets.iter().collect();
                    self.check_module_binding(line, &refs, value);
                }
                Stmt::AnnAssign(ast::StmtAnnAssign {
                    target,
                    value: Some(value),
                    ..
                }) => {
                    self.check_module_binding(line, &[target.as_ref()], value);
                }
                Stmt::If(ast::StmtIf { body, orelse, .. }) => {
                    self.scan_module_state(body);
                    self.scan_module_state(orelse);
                }
                Stmt::Try(ast::StmtTry {
                    body,
                    orelse,
                    finalbody,
                    handlers,
                    ..
                }) => {
                    self.scan_module_state(body);
                    self.scan_module_state(orelse);
                    self.scan_module_state(finalbody);
                    for handler in handlers {
                        let ast::ExceptHandler::ExceptHandler(h) = handler;
                        self.scan_module_state(&h.body);
                    }
                }
                Stmt::With(ast::StmtWith { body, .. }) => self.scan_module_state(body),
                _ => {}
            }
        }
    }
}

impl<'a> Visitor for FileScan<'a> {
    fn visit_stmt(&mut self, stmt: &ast::Stmt) {
        use ast::Stmt;
        let line = self.parsed.line_of(stmt);
        match stmt {
            Stmt::FunctionDef(ast::StmtFunctionDef { name, body, .. })
            | Stmt::AsyncFunctionDef(ast::StmtAsyncFunctionDef { name, body, .. }) => {
                let depth = max_if_depth(body, 0);
                if depth > MAX_CONDITIONAL_DEPTH {
                    self.violation(
                        line,
                        "nesting_depth",
                        format!(
                            "{}() nests conditionals {} deep (limit {})",
                            name.as_str(),
                            depth,
                            MAX_CONDITIONAL_DEPTH
                        ),
                    );
                } else if depth == MAX_CONDITIONAL_DEPTH {
                    self.warning(
                        line,
                        "nesting_depth",
                        format!("{}() nests conditionals {} deep", name.as_str(), depth),
                    );
                }
            }
            Stmt::Import(ast::StmtImport { names, .. }) => {
                for alias in names {
                    self.check_import_path(line, alias.name.as_str());
                    if let Some(asname) = &alias.asname {
                        self.check_llm(line, asname.as_str());
                    }
                }
            }
            Stmt::ImportFrom(ast::StmtImportFrom { module, names, .. }) => {
                if let Some(module) = module {
                    self.check_import_path(line, module.as_str());
                }
                for alias in names {
                    self.check_llm(line, alias.name.as_str());
                    if INTROSPECTION_NAMES.contains(&alias.name.as_str()) {
                        self.check_introspection(line, alias.name.as_str());
                    }
                }
            }
            Stmt::Global(_) => {
                self.violation(line, "global_state", "uses 'global' shared state".to_string());
            }
            Stmt::Nonlocal(_) => {
                self.violation(line, "global_state", "uses 'nonlocal' shared state".to_string());
            }
            _ => {}
        }
        walk_stmt(self, stmt);
    }

    fn visit_expr(&mut self, expr: &ast::Expr) {
        let line = self.parsed.line_of(expr);
        match expr {
            ast::Expr::Name(ast::ExprName { id, .. }) => {
                let name = id.as_str();
                self.check_llm(line, name);
                if INTROSPECTION_NAMES.contains(&name) {
                    self.check_introspection(line, name);
                }
                if name == "skill_registry" {
                    self.violation(line, "skill_invocation", "references the skill registry".to_string());
                }
            }
            ast::Expr::Attribute(ast::ExprAttribute { attr, .. }) => {
                let attr = attr.as_str();
                self.check_llm(line, attr);
                if let Some(dotted) = dotted_name(expr) {
                    if LLM_DOTTED.iter().any(|p| dotted.to_lowercase().contains(p)) {
                        self.check_llm(line, &dotted);
                    }
                    if INTROSPECTION_DOTTED.contains(&dotted.as_str()) {
                        self.check_introspection(line, &dotted);
                    }
                }
                if INTROSPECTION_ATTRS.contains(&attr) {
                    self.check_introspection(line, attr);
                }
                if attr == "skill_registry" {
                    self.violation(line, "skill_invocation", "references the skill registry".to_string());
                }
            }
            ast::Expr::Subscript(ast::ExprSubscript { value, .. }) => {
                if let ast::Expr::Name(ast::ExprName { id, .. }) = value.as_ref() {
                    if id.as_str() == "skills" {
                        self.violation(line, "skill_invocation", "indexes a skill collection".to_string());
                    }
                }
            }
            ast::Expr::Call(call) => self.check_call(line, call),
            _ => {}
        }
        walk_expr(self, expr);
    }
}

/// Entry-function scan: returns and context access, skipping nested
/// definitions
struct EntryScan<'a> {
    parsed: &'a ParsedSource,
    param: &'a str,
    value_returns: usize,
    non_mapping_returns: Vec<u32>,
    output_keys: BTreeSet<String>,
    required: BTreeSet<String>,
    optional: BTreeSet<String>,
    direct_access: bool,
}

impl<'a> Visitor for EntryScan<'a> {
    fn visit_stmt(&mut self, stmt: &ast::Stmt) {
        match stmt {
            ast::Stmt::FunctionDef(_) | ast::Stmt::AsyncFunctionDef(_) | ast::Stmt::ClassDef(_) => return,
            ast::Stmt::Return(ast::StmtReturn { value: Some(value), .. }) => {
                self.value_returns += 1;
                if is_mapping_expr(value) {
                    if let ast::Expr::Dict(ast::ExprDict { keys, .. }) = value.as_ref() {
                        for key in keys.iter().flatten() {
                            if let Some(k) = str_constant(key) {
                                self.output_keys.insert(k.to_string());
                            }
                        }
                    }
                } else {
                    self.non_mapping_returns.push(self.parsed.line_of(stmt));
                }
            }
            _ => {}
        }
        walk_stmt(self, stmt);
    }

    fn visit_expr(&mut self, expr: &ast::Expr) {
        match expr {
            ast::Expr::Lambda(_) => return,
            ast::Expr::Call(call) => {
                if let ast::Expr::Attribute(ast::ExprAttribute { value, attr, .. }) = call.func.as_ref() {
                    let on_param = matches!(
                        value.as_ref(),
                        ast::Expr::Name(ast::ExprName { id, .. }) if id.as_str() == self.param
                    );
                    if on_param && attr.as_str() == "get" {
                        if let Some(key) = call.args.first().and_then(str_constant) {
                            self.optional.insert(key.to_string());
                        }
                    }
                }
            }
            ast::Expr::Subscript(ast::ExprSubscript { value, slice, .. }) => {
                if let ast::Expr::Name(ast::ExprName { id, .. }) = value.as_ref() {
                    if id.as_str() == self.param {
                        self.direct_access = true;
                        if let Some(key) = str_constant(slice) {
                            self.required.insert(key.to_string());
                        }
                    }
                }
            }
            _ => {}
        }
        walk_expr(self, expr);
    }
}

fn empty_verdict(skill_id: &str, violation: Finding) -> PurityVerdict {
    PurityVerdict {
        skill_id: skill_id.to_string(),
        is_pure: false,
        violations: vec![violation],
        warnings: Vec::new(),
        input_contract: InputContract::default(),
        output_contract: OutputContract::default(),
    }
}

/// Whole-file checks, run on every source file of a skill
fn scan_file(parsed: &ParsedSource, entry: &str) -> (Vec<Finding>, Vec<Finding>) {
    let mut scan = FileScan {
        parsed,
        entry,
        violations: Vec::new(),
        warnings: Vec::new(),
        reported_llm: HashSet::new(),
        reported_introspection: HashSet::new(),
    };
    syntax::walk_body(&mut scan, &parsed.suite);
    scan.scan_module_state(&parsed.suite);
    (scan.violations, scan.warnings)
}

/// Entry function shape, returns and contracts
#[derive(Default)]
struct EntryCheck {
    violations: Vec<Finding>,
    warnings: Vec<Finding>,
    input_contract: InputContract,
    output_contract: OutputContract,
}

fn check_entry(parsed: &ParsedSource, entry: &str) -> EntryCheck {
    let mut out = EntryCheck::default();

    let defs: Vec<&ast::Stmt> = parsed
        .suite
        .iter()
        .filter(|s| match s {
            ast::Stmt::FunctionDef(d) => d.name.as_str() == entry,
            ast::Stmt::AsyncFunctionDef(d) => d.name.as_str() == entry,
            _ => false,
        })
        .collect();

    match defs.as_slice() {
        [] => out.violations.push(
            Finding::new("entrypoint", format!("missing entry function {}(context)", entry))
                .at(&parsed.path, 1),
        ),
        [ast::Stmt::AsyncFunctionDef(def)] => out.violations.push(
            Finding::new("entrypoint", format!("entry function {}() must not be async", entry))
                .at(&parsed.path, parsed.line_of(def)),
        ),
        [ast::Stmt::FunctionDef(def)] => {
            let line = parsed.line_of(def);
            let args = &def.args;
            let positional: Vec<&ast::ArgWithDefault> =
                args.posonlyargs.iter().chain(args.args.iter()).collect();
            let extra = args.vararg.is_some() || args.kwarg.is_some() || !args.kwonlyargs.is_empty();

            if positional.len() != 1 || extra {
                out.violations.push(
                    Finding::new(
                        "entrypoint",
                        format!("entry function {}() must take exactly one context parameter", entry),
                    )
                    .at(&parsed.path, line),
                );
            }

            let param = positional
                .first()
                .map(|a| a.def.arg.as_str())
                .unwrap_or("context");
            if positional.len() == 1 && param != "context" {
                out.warnings.push(
                    Finding::new(
                        "parameter_name",
                        format!("entry parameter is '{}', expected 'context'", param),
                    )
                    .at(&parsed.path, line),
                );
            }

            let mut entry_scan = EntryScan {
                parsed,
                param,
                value_returns: 0,
                non_mapping_returns: Vec::new(),
                output_keys: BTreeSet::new(),
                required: BTreeSet::new(),
                optional: BTreeSet::new(),
                direct_access: false,
            };
            syntax::walk_body(&mut entry_scan, &def.body);

            if entry_scan.value_returns == 0 {
                out.violations.push(
                    Finding::new(
                        "missing_return",
                        format!("entry function {}() never returns a result mapping", entry),
                    )
                    .at(&parsed.path, line),
                );
            }
            for ret_line in &entry_scan.non_mapping_returns {
                out.warnings.push(
                    Finding::new("non_mapping_return", "return value is not a mapping")
                        .at(&parsed.path, *ret_line),
                );
            }
            if entry_scan.direct_access && entry_scan.optional.is_empty() {
                out.warnings.push(
                    Finding::new(
                        "direct_context_access",
                        format!("reads {}[...] directly without .get()", param),
                    )
                    .at(&parsed.path, line),
                );
            }

            out.input_contract = InputContract {
                description: docstring(&def.body),
                required: entry_scan.required.into_iter().collect(),
                optional: entry_scan.optional.into_iter().collect(),
            };
            out.output_contract = OutputContract {
                has_success: entry_scan.output_keys.contains("success"),
                has_error: entry_scan.output_keys.contains("error"),
                has_result: entry_scan.output_keys.contains("result"),
                keys: entry_scan.output_keys.into_iter().collect(),
            };
        }
        _ => out.violations.push(
            Finding::new("entrypoint", format!("entry function {}() is defined more than once", entry))
                .at(&parsed.path, parsed.line_of(defs[1])),
        ),
    }
    out
}

fn verdict(skill_id: &str, mut entry: EntryCheck, files: Vec<(Vec<Finding>, Vec<Finding>)>) -> PurityVerdict {
    for (violations, warnings) in files {
        entry.violations.extend(violations);
        entry.warnings.extend(warnings);
    }

    debug!(
        "Purity of '{}': {} violations, {} warnings",
        skill_id,
        entry.violations.len(),
        entry.warnings.len()
    );

    PurityVerdict {
        skill_id: skill_id.to_string(),
        is_pure: entry.violations.is_empty(),
        violations: entry.violations,
        warnings: entry.warnings,
        input_contract: entry.input_contract,
        output_contract: entry.output_contract,
    }
}

/// Validate a parsed entry file against entry function `entry`
pub fn validate_parsed(parsed: &ParsedSource, entry: &str, skill_id: &str) -> PurityVerdict {
    let file = scan_file(parsed, entry);
    verdict(skill_id, check_entry(parsed, entry), vec![file])
}

/// Validate source text
pub fn validate_source(source: &str, path: &str, entry: &str, skill_id: &str) -> PurityVerdict {
    match syntax::parse(source, path) {
        Ok(parsed) => validate_parsed(&parsed, entry, skill_id),
        Err(err) => empty_verdict(
            skill_id,
            Finding::new("syntax_error", err.to_string()).at(&err.file, err.line),
        ),
    }
}

/// Validate an entry source file on disk
pub fn validate_file(path: &Path, rel_path: &str, entry: &str, skill_id: &str) -> PurityVerdict {
    match std::fs::read(path) {
        Ok(bytes) => validate_source(&String::from_utf8_lossy(&bytes), rel_path, entry, skill_id),
        Err(e) => empty_verdict(
            skill_id,
            Finding::new("unreadable", format!("cannot read {}: {}", rel_path, e)),
        ),
    }
}

/// Validate a skill directory. Every source file gets the whole-file
/// checks; the entry shape and contracts come from `entry_file` alone.
pub fn validate_dir(dir: &Path, entry_file: &str, entry: &str, skill_id: &str) -> PurityVerdict {
    let mut entry_check = None;
    let mut files = Vec::new();

    for rel in python_files(dir) {
        let rel_path = display_path(&rel);
        let parsed = std::fs::read(dir.join(&rel))
            .map_err(|e| Finding::new("unreadable", format!("cannot read {}: {}", rel_path, e)))
            .and_then(|bytes| {
                syntax::parse(&String::from_utf8_lossy(&bytes), &rel_path)
                    .map_err(|err| Finding::new("syntax_error", err.to_string()).at(&err.file, err.line))
            });
        match parsed {
            Ok(parsed) => {
                files.push(scan_file(&parsed, entry));
                if rel_path == entry_file {
                    entry_check = Some(check_entry(&parsed, entry));
                }
            }
            Err(finding) if rel_path == entry_file => return empty_verdict(skill_id, finding),
            Err(finding) => files.push((vec![finding], Vec::new())),
        }
    }

    let entry_check = entry_check.unwrap_or_else(|| EntryCheck {
        violations: vec![Finding::new(
            "unreadable",
            format!("entry file {} not found", entry_file),
        )],
        ..EntryCheck::default()
    });
    verdict(skill_id, entry_check, files)
}

/// Validate an extracted skill: all of its source files, entry function
/// from the recorded entrypoint
pub fn validate_skill(skill: &ExtractedSkill) -> PurityVerdict {
    validate_dir(
        &skill.dir,
        &skill.entrypoint.file,
        &skill.entrypoint.function,
        &skill.manifest.id,
    )
}

/// Validate every skill directory directly under `skills_root`, in name
/// order. A normalized skill uses its recorded entrypoint; a bare directory
/// with a `skill.py` is checked under its directory name. Anything else is
/// skipped.
pub fn batch_validate(skills_root: &Path) -> std::io::Result<Vec<PurityVerdict>> {
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(skills_root)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();

    let mut verdicts = Vec::new();
    for dir in dirs {
        match normalizer::load(&dir) {
            Ok(skill) => verdicts.push(validate_skill(&skill)),
            Err(_) if dir.join(CANONICAL_ENTRY_FILE).is_file() => {
                let id = dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                verdicts.push(validate_dir(&dir, CANONICAL_ENTRY_FILE, CANONICAL_ENTRY_FUNCTION, &id));
            }
            Err(e) => debug!("Skipping {:?}: {}", dir, e),
        }
    }
    Ok(verdicts)
}

/// Aggregate purity over a skills directory
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PuritySummary {
    pub total_skills: usize,
    pub pure_skills: usize,
    pub impure_skills: usize,
    /// 0 when there are no skills
    pub purity_percentage: f64,
    /// Violation messages of each impure skill
    pub violations_by_skill: BTreeMap<String, Vec<String>>,
}

pub fn purity_summary(skills_root: &Path) -> std::io::Result<PuritySummary> {
    let verdicts = batch_validate(skills_root)?;
    let total_skills = verdicts.len();
    let pure_skills = verdicts.iter().filter(|v| v.is_pure).count();
    let violations_by_skill = verdicts
        .iter()
        .filter(|v| !v.is_pure)
        .map(|v| {
            let messages = v.violations.iter().map(|f| f.to_string()).collect();
            (v.skill_id.clone(), messages)
        })
        .collect();

    Ok(PuritySummary {
        total_skills,
        pure_skills,
        impure_skills: total_skills - pure_skills,
        purity_percentage: if total_skills == 0 {
            0.0
        } else {
            pure_skills as f64 * 100.0 / total_skills as f64
        },
        violations_by_skill,
    })
}
