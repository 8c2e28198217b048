//! Python Syntax Tree Access
//!
//! Wraps the embedded parser so analysis stages inspect a typed syntax tree
//! and never run untrusted source to look at it. Provides line mapping, a
//! recursive [`Visitor`], and small helpers for dotted names and docstrings.

use std::path::Path;

use rustpython_parser::ast::{self, Ranged};
use rustpython_parser::Parse;

use super::types::SyntaxErrorInfo;

/// Byte offset to line/column mapping
#[derive(Debug, Clone)]
pub struct LineIndex {
    line_starts: Vec<usize>,
}

impl LineIndex {
    pub fn new(source: &str) -> Self {
        let mut line_starts = vec![0];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i + 1);
            }
        }
        Self { line_starts }
    }

    /// 1-based line and column for a byte offset
    pub fn position(&self, source: &str, offset: usize) -> (u32, u32) {
        let offset = offset.min(source.len());
        let line = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        };
        let start = self.line_starts[line];
        let column = source
            .get(start..offset)
            .map(|s| s.chars().count())
            .unwrap_or(0);
        (line as u32 + 1, column as u32 + 1)
    }
}

/// A parsed source file
#[derive(Debug)]
pub struct ParsedSource {
    /// Display path, relative to the skill directory
    pub path: String,
    pub source: String,
    pub suite: ast::Suite,
    lines: LineIndex,
}

impl ParsedSource {
    /// 1-based line of any node
    pub fn line_of<T: Ranged>(&self, node: &T) -> u32 {
        let offset = u32::from(node.range().start()) as usize;
        self.lines.position(&self.source, offset).0
    }

    /// Top-level function definitions with their names
    pub fn top_level_functions(&self) -> impl Iterator<Item = &ast::StmtFunctionDef> {
        self.suite.iter().filter_map(|stmt| match stmt {
            ast::Stmt::FunctionDef(def) => Some(def),
            _ => None,
        })
    }
}

/// Parse Python source into a syntax tree
pub fn parse(source: &str, path: &str) -> Result<ParsedSource, SyntaxErrorInfo> {
    let lines = LineIndex::new(source);
    match ast::Suite::parse(source, path) {
        Ok(suite) => Ok(ParsedSource {
            path: path.to_string(),
            source: source.to_string(),
            suite,
            lines,
        }),
        Err(err) => {
            let (line, column) = lines.position(source, u32::from(err.offset) as usize);
            Err(SyntaxErrorInfo {
                file: path.to_string(),
                line,
                column,
                message: err.error.to_string(),
            })
        }
    }
}

/// Whether `skill.py` in a skill directory exists and parses
pub fn quick_syntax_check(skill_dir: &Path) -> bool {
    match std::fs::read_to_string(skill_dir.join("skill.py")) {
        Ok(source) => parse(&source, "skill.py").is_ok(),
        Err(_) => false,
    }
}

/// `a.b.c` for a chain of attribute accesses on a name
pub fn dotted_name(expr: &ast::Expr) -> Option<String> {
    match expr {
        ast::Expr::Name(ast::ExprName { id, .. }) => Some(id.as_str().to_string()),
        ast::Expr::Attribute(ast::ExprAttribute { value, attr, .. }) => {
            dotted_name(value).map(|base| format!("{}.{}", base, attr.as_str()))
        }
        _ => None,
    }
}

/// Final segment of a call target: `b` for `a.b(...)`, `f` for `f(...)`
pub fn call_leaf(func: &ast::Expr) -> Option<&str> {
    match func {
        ast::Expr::Name(ast::ExprName { id, .. }) => Some(id.as_str()),
        ast::Expr::Attribute(ast::ExprAttribute { attr, .. }) => Some(attr.as_str()),
        _ => None,
    }
}

/// String constant value
pub fn str_constant(expr: &ast::Expr) -> Option<&str> {
    match expr {
        ast::Expr::Constant(ast::ExprConstant {
            value: ast::Constant::Str(s),
            ..
        }) => Some(s.as_str()),
        _ => None,
    }
}

/// Docstring of a function or module body
pub fn docstring(body: &[ast::Stmt]) -> Option<String> {
    match body.first() {
        Some(ast::Stmt::Expr(ast::StmtExpr { value, .. })) => {
            str_constant(value).map(|s| s.trim().to_string())
        }
        _ => None,
    }
}

/// Recursive syntax tree visitor.
///
/// Override a method to inspect a node; call the matching `walk_*` function
/// to keep descending.
pub trait Visitor {
    fn visit_stmt(&mut self, stmt: &ast::Stmt) {
        walk_stmt(self, stmt);
    }

    fn visit_expr(&mut self, expr: &ast::Expr) {
        walk_expr(self, expr);
    }
}

pub fn walk_body<V: Visitor + ?Sized>(v: &mut V, body: &[ast::Stmt]) {
    for stmt in body {
        v.visit_stmt(stmt);
    }
}

fn walk_opt<V: Visitor + ?Sized>(v: &mut V, expr: &Option<Box<ast::Expr>>) {
    if let Some(e) = expr {
        v.visit_expr(e);
    }
}

/// Defaults and annotations, both evaluated when the `def` runs
fn walk_arguments<V: Visitor + ?Sized>(v: &mut V, args: &ast::Arguments) {
    for arg in args
        .posonlyargs
        .iter()
        .chain(args.args.iter())
        .chain(args.kwonlyargs.iter())
    {
        walk_opt(v, &arg.def.annotation);
        walk_opt(v, &arg.default);
    }
    for arg in args.vararg.iter().chain(args.kwarg.iter()) {
        walk_opt(v, &arg.annotation);
    }
}

fn walk_comprehensions<V: Visitor + ?Sized>(v: &mut V, generators: &[ast::Comprehension]) {
    for gen in generators {
        v.visit_expr(&gen.target);
        v.visit_expr(&gen.iter);
        for cond in &gen.ifs {
            v.visit_expr(cond);
        }
    }
}

pub fn walk_stmt<V: Visitor + ?Sized>(v: &mut V, stmt: &ast::Stmt) {
    use ast::Stmt;
    match stmt {
        Stmt::FunctionDef(ast::StmtFunctionDef {
            args,
            body,
            decorator_list,
            returns,
            ..
        })
        | Stmt::AsyncFunctionDef(ast::StmtAsyncFunctionDef {
            args,
            body,
            decorator_list,
            returns,
            ..
        }) => {
            for dec in decorator_list {
                v.visit_expr(dec);
            }
            walk_arguments(v, args);
            walk_opt(v, returns);
            walk_body(v, body);
        }
        Stmt::ClassDef(ast::StmtClassDef {
            bases,
            keywords,
            body,
            decorator_list,
            ..
        }) => {
            for e in decorator_list.iter().chain(bases.iter()) {
                v.visit_expr(e);
            }
            for kw in keywords {
                v.visit_expr(&kw.value);
            }
            walk_body(v, body);
        }
        Stmt::Return(ast::StmtReturn { value, .. }) => walk_opt(v, value),
        Stmt::Delete(ast::StmtDelete { targets, .. }) => {
            for t in targets {
                v.visit_expr(t);
            }
        }
        Stmt::Assign(ast::StmtAssign { targets, value, .. }) => {
            for t in targets {
                v.visit_expr(t);
            }
            v.visit_expr(value);
        }
        Stmt::AugAssign(ast::StmtAugAssign { target, value, .. }) => {
            v.visit_expr(target);
            v.visit_expr(value);
        }
        Stmt::AnnAssign(ast::StmtAnnAssign {
            target,
            annotation,
            value,
            ..
        }) => {
            v.visit_expr(target);
            v.visit_expr(annotation);
            walk_opt(v, value);
        }
        Stmt::For(ast::StmtFor {
            target,
            iter,
            body,
            orelse,
            ..
        })
        | Stmt::AsyncFor(ast::StmtAsyncFor {
            target,
            iter,
            body,
            orelse,
            ..
        }) => {
            v.visit_expr(target);
            v.visit_expr(iter);
            walk_body(v, body);
            walk_body(v, orelse);
        }
        Stmt::While(ast::StmtWhile {
            test, body, orelse, ..
        })
        | Stmt::If(ast::StmtIf {
            test, body, orelse, ..
        }) => {
            v.visit_expr(test);
            walk_body(v, body);
            walk_body(v, orelse);
        }
        Stmt::With(ast::StmtWith { items, body, .. })
        | Stmt::AsyncWith(ast::StmtAsyncWith { items, body, .. }) => {
            for item in items {
                v.visit_expr(&item.context_expr);
                walk_opt(v, &item.optional_vars);
            }
            walk_body(v, body);
        }
        Stmt::Match(ast::StmtMatch { subject, cases, .. }) => {
            v.visit_expr(subject);
            for case in cases {
                walk_opt(v, &case.guard);
                walk_body(v, &case.body);
            }
        }
        Stmt::Raise(ast::StmtRaise { exc, cause, .. }) => {
            walk_opt(v, exc);
            walk_opt(v, cause);
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
            walk_body(v, body);
            for handler in handlers {
                let ast::ExceptHandler::ExceptHandler(h) = handler;
                walk_opt(v, &h.type_);
                walk_body(v, &h.body);
            }
            walk_body(v, orelse);
            walk_body(v, finalbody);
        }
        Stmt::Assert(ast::StmtAssert { test, msg, .. }) => {
            v.visit_expr(test);
            walk_opt(v, msg);
        }
        Stmt::Expr(ast::StmtExpr { value, .. }) => v.visit_expr(value),
        _ => {}
    }
}

pub fn walk_expr<V: Visitor + ?Sized>(v: &mut V, expr: &ast::Expr) {
    use ast::Expr;
    match expr {
        Expr::BoolOp(ast::ExprBoolOp { values, .. }) => {
            for e in values {
                v.visit_expr(e);
            }
        }
        Expr::NamedExpr(ast::ExprNamedExpr { target, value, .. }) => {
            v.visit_expr(target);
            v.visit_expr(value);
        }
        Expr::BinOp(ast::ExprBinOp { left, right, .. }) => {
            v.visit_expr(left);
            v.visit_expr(right);
        }
        Expr::UnaryOp(ast::ExprUnaryOp { operand, .. }) => v.visit_expr(operand),
        Expr::Lambda(ast::ExprLambda { args, body, .. }) => {
            walk_arguments(v, args);
            v.visit_expr(body);
        }
        Expr::IfExp(ast::ExprIfExp {
            test, body, orelse, ..
        }) => {
            v.visit_expr(test);
            v.visit_expr(body);
            v.visit_expr(orelse);
        }
        Expr::Dict(ast::ExprDict { keys, values, .. }) => {
            for k in keys.iter().flatten() {
                v.visit_expr(k);
            }
            for val in values {
                v.visit_expr(val);
            }
        }
        Expr::Set(ast::ExprSet { elts, .. })
        | Expr::List(ast::ExprList { elts, .. })
        | Expr::Tuple(ast::ExprTuple { elts, .. }) => {
            for e in elts {
                v.visit_expr(e);
            }
        }
        Expr::ListComp(ast::ExprListComp {
            elt, generators, ..
        })
        | Expr::SetComp(ast::ExprSetComp {
            elt, generators, ..
        })
        | Expr::GeneratorExp(ast::ExprGeneratorExp {
            elt, generators, ..
        }) => {
            v.visit_expr(elt);
            walk_comprehensions(v, generators);
        }
        Expr::DictComp(ast::ExprDictComp {
            key,
            value,
            generators,
            ..
        }) => {
            v.visit_expr(key);
            v.visit_expr(value);
            walk_comprehensions(v, generators);
        }
        Expr::Await(ast::ExprAwait { value, .. })
        | Expr::YieldFrom(ast::ExprYieldFrom { value, .. })
        | Expr::Attribute(ast::ExprAttribute { value, .. })
        | Expr::Starred(ast::ExprStarred { value, .. }) => v.visit_expr(value),
        Expr::Yield(ast::ExprYield { value, .. }) => walk_opt(v, value),
        Expr::Compare(ast::ExprCompare {
            left, comparators, ..
        }) => {
            v.visit_expr(left);
            for e in comparators {
                v.visit_expr(e);
            }
        }
        Expr::Call(ast::ExprCall {
            func,
            args,
            keywords,
            ..
        }) => {
            v.visit_expr(func);
            for a in args {
                v.visit_expr(a);
            }
            for kw in keywords {
                v.visit_expr(&kw.value);
            }
        }
        Expr::FormattedValue(ast::ExprFormattedValue {
            value, format_spec, ..
        }) => {
            v.visit_expr(value);
            walk_opt(v, format_spec);
        }
        Expr::JoinedStr(ast::ExprJoinedStr { values, .. }) => {
            for e in values {
                v.visit_expr(e);
            }
        }
        Expr::Subscript(ast::ExprSubscript { value, slice, .. }) => {
            v.visit_expr(value);
            v.visit_expr(slice);
        }
        Expr::Slice(ast::ExprSlice {
            lower, upper, step, ..
        }) => {
            walk_opt(v, lower);
            walk_opt(v, upper);
            walk_opt(v, step);
        }
        _ => {}
    }
}
