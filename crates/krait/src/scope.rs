//! Scope analysis: per-scope symbol tables with closure capture.
//!
//! Each lexical scope gets a [`SymbolTable`]; the compiler keeps them on a
//! stack whose depth equals the lexical nesting. Name resolution walks
//! outward only. A free-variable lookup that finds a local in an enclosing
//! function promotes that local to a cell in its owning scope, records the
//! free reference in the using scope, and transparently propagates the
//! capture through every scope in between. Promotion is idempotent.

use ahash::AHashSet;
use indexmap::IndexMap;

use crate::ast::{Arguments, Comprehension, Expr, ExprLoc, FStringPart, Pattern, PatternLoc, Stmt, StmtLoc};

/// What kind of lexical scope a symbol table describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScopeKind {
    Module,
    Function,
    Class,
    Comprehension,
}

/// Classification of a resolved name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SymScope {
    /// A slot in the function's locals array.
    Local,
    /// A module-level binding.
    Global,
    /// Not bound anywhere visible; the VM falls back to builtins.
    Builtin,
    /// A local of this scope captured by a nested scope.
    Cell,
    /// A variable captured from an enclosing function scope.
    Free,
}

/// A resolved name. The meaning of `index` depends on `scope`: a local
/// slot for `Local`, a cell index for `Cell`, a free-variable index for
/// `Free`, and unused for `Global`/`Builtin` (those index the names table,
/// allocated at emission time).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Symbol {
    pub scope: SymScope,
    pub index: u16,
    /// For cells that used to be plain locals: the local slot they had
    /// before promotion. The slot stays reserved in `varnames` and holds
    /// the cell at run time, so parameter values can be moved into cells
    /// on function entry.
    pub original_index: Option<u16>,
}

impl Symbol {
    fn plain(scope: SymScope) -> Self {
        Self {
            scope,
            index: 0,
            original_index: None,
        }
    }
}

/// Name sets gathered by the pre-scan of a scope's body.
///
/// Python classifies a name as local the moment it is assigned *anywhere*
/// in the scope, so the compiler scans for assignments before emitting any
/// of the scope's code.
#[derive(Debug, Default)]
pub(crate) struct ScopeInfo {
    pub assigned: AHashSet<String>,
    pub globals: AHashSet<String>,
    pub nonlocals: AHashSet<String>,
}

impl ScopeInfo {
    /// Pre-scans a module body.
    pub fn for_module(body: &[StmtLoc]) -> Self {
        let mut info = Self::default();
        info.collect_stmts(body);
        info
    }

    /// Pre-scans a function: parameters count as assigned names.
    pub fn for_function(args: &Arguments, body: &[StmtLoc]) -> Self {
        let mut info = Self::default();
        for name in args.param_names() {
            info.assigned.insert(name.to_owned());
        }
        info.collect_stmts(body);
        info
    }

    /// Pre-scans a lambda body.
    pub fn for_lambda(args: &Arguments, body: &ExprLoc) -> Self {
        let mut info = Self::default();
        for name in args.param_names() {
            info.assigned.insert(name.to_owned());
        }
        info.collect_expr(body);
        info
    }

    /// Pre-scans a class body.
    pub fn for_class(body: &[StmtLoc]) -> Self {
        let mut info = Self::default();
        info.collect_stmts(body);
        info
    }

    /// Builds the scope info of a comprehension: its generators' targets
    /// are its locals, along with the hidden iterator parameter.
    pub fn for_comprehension(generators: &[Comprehension]) -> Self {
        let mut info = Self::default();
        info.assigned.insert(".0".to_owned());
        for generator in generators {
            info.collect_target(&generator.target);
        }
        info
    }

    fn collect_stmts(&mut self, body: &[StmtLoc]) {
        for stmt in body {
            self.collect_stmt(stmt);
        }
    }

    fn collect_stmt(&mut self, stmt: &StmtLoc) {
        match &stmt.stmt {
            Stmt::Expr(e) | Stmt::Return(Some(e)) => self.collect_expr(e),
            Stmt::Assign { targets, value } => {
                for target in targets {
                    self.collect_target(target);
                }
                self.collect_expr(value);
            }
            Stmt::AugAssign { target, value, .. } => {
                self.collect_target(target);
                self.collect_expr(value);
            }
            Stmt::AnnAssign {
                target,
                annotation,
                value,
            } => {
                if value.is_some() {
                    self.collect_target(target);
                }
                self.collect_expr(annotation);
                if let Some(value) = value {
                    self.collect_expr(value);
                }
            }
            Stmt::If { test, body, orelse } | Stmt::While { test, body, orelse } => {
                self.collect_expr(test);
                self.collect_stmts(body);
                self.collect_stmts(orelse);
            }
            Stmt::For {
                target,
                iter,
                body,
                orelse,
                ..
            } => {
                self.collect_target(target);
                self.collect_expr(iter);
                self.collect_stmts(body);
                self.collect_stmts(orelse);
            }
            Stmt::FunctionDef(def) => {
                self.assigned.insert(def.name.clone());
                // Decorators, defaults, and annotations evaluate in the
                // enclosing scope; the body does not.
                for dec in &def.decorators {
                    self.collect_expr(dec);
                }
                self.collect_arguments(&def.args);
                if let Some(returns) = &def.returns {
                    self.collect_expr(returns);
                }
            }
            Stmt::ClassDef(def) => {
                self.assigned.insert(def.name.clone());
                for dec in &def.decorators {
                    self.collect_expr(dec);
                }
                for base in &def.bases {
                    self.collect_expr(base);
                }
                for kw in &def.keywords {
                    self.collect_expr(&kw.value);
                }
            }
            Stmt::Import { names } => {
                for alias in names {
                    let binding = alias
                        .alias
                        .clone()
                        .unwrap_or_else(|| alias.name.split('.').next().unwrap_or(&alias.name).to_owned());
                    self.assigned.insert(binding);
                }
            }
            Stmt::ImportFrom { names, .. } => {
                for alias in names {
                    self.assigned
                        .insert(alias.alias.clone().unwrap_or_else(|| alias.name.clone()));
                }
            }
            Stmt::Raise { exc, cause } => {
                if let Some(exc) = exc {
                    self.collect_expr(exc);
                }
                if let Some(cause) = cause {
                    self.collect_expr(cause);
                }
            }
            Stmt::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => {
                self.collect_stmts(body);
                for handler in handlers {
                    if let Some(exc_type) = &handler.exc_type {
                        self.collect_expr(exc_type);
                    }
                    if let Some(name) = &handler.name {
                        self.assigned.insert(name.clone());
                    }
                    self.collect_stmts(&handler.body);
                }
                self.collect_stmts(orelse);
                self.collect_stmts(finalbody);
            }
            Stmt::With { items, body, .. } => {
                for item in items {
                    self.collect_expr(&item.context_expr);
                    if let Some(target) = &item.target {
                        self.collect_target(target);
                    }
                }
                self.collect_stmts(body);
            }
            Stmt::Assert { test, msg } => {
                self.collect_expr(test);
                if let Some(msg) = msg {
                    self.collect_expr(msg);
                }
            }
            Stmt::Delete { targets } => {
                for target in targets {
                    // `del x` classifies x as local, like assignment.
                    if let Expr::Name(name) = &target.expr {
                        self.assigned.insert(name.clone());
                    } else {
                        self.collect_expr(target);
                    }
                }
            }
            Stmt::Global { names } => {
                for name in names {
                    self.globals.insert(name.clone());
                }
            }
            Stmt::Nonlocal { names } => {
                for name in names {
                    self.nonlocals.insert(name.clone());
                }
            }
            Stmt::Match { subject, cases } => {
                self.collect_expr(subject);
                for case in cases {
                    self.collect_pattern(&case.pattern);
                    if let Some(guard) = &case.guard {
                        self.collect_expr(guard);
                    }
                    self.collect_stmts(&case.body);
                }
            }
            Stmt::TypeAlias { name, value, .. } => {
                self.assigned.insert(name.clone());
                self.collect_expr(value);
            }
            Stmt::Return(None) | Stmt::Pass | Stmt::Break | Stmt::Continue => {}
        }
    }

    /// Records the names bound by an assignment target.
    fn collect_target(&mut self, target: &ExprLoc) {
        match &target.expr {
            Expr::Name(name) => {
                self.assigned.insert(name.clone());
            }
            Expr::Tuple(items) | Expr::List(items) => {
                for item in items {
                    self.collect_target(item);
                }
            }
            Expr::Starred(inner) => self.collect_target(inner),
            // Attribute and subscript targets bind no local names, but their
            // subexpressions may contain walruses.
            _ => self.collect_expr(target),
        }
    }

    fn collect_pattern(&mut self, pattern: &PatternLoc) {
        match &pattern.pattern {
            Pattern::Capture { name: Some(name) } | Pattern::Star { name: Some(name) } => {
                self.assigned.insert(name.clone());
            }
            Pattern::Capture { name: None } | Pattern::Star { name: None } | Pattern::Singleton(_) => {}
            Pattern::Value(expr) => self.collect_expr(expr),
            Pattern::Or(patterns) | Pattern::Sequence { patterns } => {
                for p in patterns {
                    self.collect_pattern(p);
                }
            }
            Pattern::As { pattern, name } => {
                self.assigned.insert(name.clone());
                self.collect_pattern(pattern);
            }
            Pattern::Mapping { keys, patterns, rest } => {
                for key in keys {
                    self.collect_expr(key);
                }
                for p in patterns {
                    self.collect_pattern(p);
                }
                if let Some(rest) = rest {
                    self.assigned.insert(rest.clone());
                }
            }
            Pattern::Class {
                cls,
                patterns,
                kwd_patterns,
                ..
            } => {
                self.collect_expr(cls);
                for p in patterns.iter().chain(kwd_patterns) {
                    self.collect_pattern(p);
                }
            }
        }
    }

    /// Walks an expression looking for walrus targets.
    ///
    /// Descends through comprehensions (whose walrus targets hoist into the
    /// enclosing scope per PEP 572) but not into lambda bodies, which form
    /// their own scope.
    fn collect_expr(&mut self, expr: &ExprLoc) {
        match &expr.expr {
            Expr::Named { target, value } => {
                if let Expr::Name(name) = &target.expr {
                    self.assigned.insert(name.clone());
                }
                self.collect_expr(value);
            }
            Expr::Name(_) | Expr::Literal(_) => {}
            Expr::FString(parts) => {
                for part in parts {
                    if let FStringPart::Expr { expr, .. } = part {
                        self.collect_expr(expr);
                    }
                }
            }
            Expr::UnaryOp { operand, .. } => self.collect_expr(operand),
            Expr::BinaryOp { left, right, .. } => {
                self.collect_expr(left);
                self.collect_expr(right);
            }
            Expr::BoolOp { values, .. } => {
                for value in values {
                    self.collect_expr(value);
                }
            }
            Expr::Compare { left, comparators, .. } => {
                self.collect_expr(left);
                for comparator in comparators {
                    self.collect_expr(comparator);
                }
            }
            Expr::Call { func, args, keywords } => {
                self.collect_expr(func);
                for arg in args {
                    self.collect_expr(arg);
                }
                for kw in keywords {
                    self.collect_expr(&kw.value);
                }
            }
            Expr::Attribute { object, .. } => self.collect_expr(object),
            Expr::Subscript { object, index } => {
                self.collect_expr(object);
                self.collect_expr(index);
            }
            Expr::Slice { lower, upper, step } => {
                for part in [lower, upper, step].into_iter().flatten() {
                    self.collect_expr(part);
                }
            }
            Expr::List(items) | Expr::Tuple(items) | Expr::Set(items) => {
                for item in items {
                    self.collect_expr(item);
                }
            }
            Expr::Dict { keys, values } => {
                for key in keys.iter().flatten() {
                    self.collect_expr(key);
                }
                for value in values {
                    self.collect_expr(value);
                }
            }
            Expr::Lambda { args, .. } => {
                // The body is its own scope; defaults evaluate here.
                self.collect_arguments(args);
            }
            Expr::ListComp { elt, generators }
            | Expr::SetComp { elt, generators }
            | Expr::GeneratorExp { elt, generators } => {
                self.collect_expr(elt);
                self.collect_generators(generators);
            }
            Expr::DictComp { key, value, generators } => {
                self.collect_expr(key);
                self.collect_expr(value);
                self.collect_generators(generators);
            }
            Expr::Yield(value) => {
                if let Some(value) = value {
                    self.collect_expr(value);
                }
            }
            Expr::YieldFrom(value) | Expr::Await(value) | Expr::Starred(value) => self.collect_expr(value),
            Expr::IfElse { test, body, orelse } => {
                self.collect_expr(test);
                self.collect_expr(body);
                self.collect_expr(orelse);
            }
        }
    }

    fn collect_generators(&mut self, generators: &[Comprehension]) {
        for generator in generators {
            // Targets bind in the comprehension's own scope; only walruses
            // hoist out.
            self.collect_expr(&generator.iter);
            for cond in &generator.ifs {
                self.collect_expr(cond);
            }
        }
    }

    fn collect_arguments(&mut self, args: &Arguments) {
        for default in &args.defaults {
            self.collect_expr(default);
        }
        for default in args.kw_defaults.iter().flatten() {
            self.collect_expr(default);
        }
        for param in args
            .posonly
            .iter()
            .chain(&args.args)
            .chain(args.vararg.as_ref())
            .chain(&args.kwonly)
            .chain(args.kwarg.as_ref())
        {
            if let Some(annotation) = &param.annotation {
                self.collect_expr(annotation);
            }
        }
    }
}

/// A symbol table for one lexical scope.
#[derive(Debug)]
pub(crate) struct SymbolTable {
    pub kind: ScopeKind,
    /// Resolved symbols, in first-resolution order.
    symbols: IndexMap<String, Symbol>,
    /// Names declared `global` in this scope.
    globals: AHashSet<String>,
    /// Names declared `nonlocal` in this scope.
    nonlocals: AHashSet<String>,
    /// Names assigned somewhere in this scope (pre-scan result).
    assigned: AHashSet<String>,
    /// Cell variable names in promotion order.
    pub cells: Vec<String>,
    /// Free variable names in first-reference order.
    pub frees: Vec<String>,
    /// Next unallocated local slot.
    next_local: u16,
}

impl SymbolTable {
    fn new(kind: ScopeKind, info: ScopeInfo) -> Self {
        Self {
            kind,
            symbols: IndexMap::new(),
            globals: info.globals,
            nonlocals: info.nonlocals,
            assigned: info.assigned,
            cells: Vec::new(),
            frees: Vec::new(),
            next_local: 0,
        }
    }

    /// Looks up an already-resolved symbol.
    pub fn get(&self, name: &str) -> Option<Symbol> {
        self.symbols.get(name).copied()
    }

    /// The symbols of this scope paired with their names, in resolution order.
    pub fn symbols(&self) -> impl Iterator<Item = (&str, Symbol)> {
        self.symbols.iter().map(|(name, sym)| (name.as_str(), *sym))
    }

    fn alloc_local(&mut self) -> u16 {
        let slot = self.next_local;
        self.next_local = self.next_local.saturating_add(1);
        slot
    }

    fn insert(&mut self, name: &str, symbol: Symbol) -> Symbol {
        self.symbols.insert(name.to_owned(), symbol);
        symbol
    }

    /// Declares this scope's `__class__` cell (class scopes only).
    pub fn declare_class_cell(&mut self) {
        if !self.cells.iter().any(|c| c == "__class__") {
            let index = u16::try_from(self.cells.len()).unwrap_or(u16::MAX);
            self.cells.push("__class__".to_owned());
            self.insert(
                "__class__",
                Symbol {
                    scope: SymScope::Cell,
                    index,
                    original_index: None,
                },
            );
        }
    }

    /// Promotes a name to a cell in this scope. Idempotent; re-promotion is
    /// a no-op. A name that already had a local slot keeps it recorded as
    /// `original_index`.
    fn promote_to_cell(&mut self, name: &str) {
        match self.symbols.get(name).copied() {
            Some(sym) if sym.scope == SymScope::Cell => {}
            Some(sym) if sym.scope == SymScope::Local => {
                let index = u16::try_from(self.cells.len()).unwrap_or(u16::MAX);
                self.cells.push(name.to_owned());
                self.insert(
                    name,
                    Symbol {
                        scope: SymScope::Cell,
                        index,
                        original_index: Some(sym.index),
                    },
                );
            }
            _ => {
                let index = u16::try_from(self.cells.len()).unwrap_or(u16::MAX);
                self.cells.push(name.to_owned());
                self.insert(
                    name,
                    Symbol {
                        scope: SymScope::Cell,
                        index,
                        original_index: None,
                    },
                );
            }
        }
    }

    /// Records a free variable in this scope, returning its symbol.
    fn add_free(&mut self, name: &str) -> Symbol {
        if let Some(sym) = self.symbols.get(name).copied()
            && sym.scope == SymScope::Free
        {
            return sym;
        }
        let index = match self.frees.iter().position(|f| f == name) {
            Some(index) => index,
            None => {
                self.frees.push(name.to_owned());
                self.frees.len() - 1
            }
        };
        self.insert(
            name,
            Symbol {
                scope: SymScope::Free,
                index: u16::try_from(index).unwrap_or(u16::MAX),
                original_index: None,
            },
        )
    }
}

/// The stack of symbol tables for the scopes currently being compiled.
#[derive(Debug, Default)]
pub(crate) struct ScopeStack {
    tables: Vec<SymbolTable>,
}

impl ScopeStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters a new scope.
    pub fn push(&mut self, kind: ScopeKind, info: ScopeInfo) {
        self.tables.push(SymbolTable::new(kind, info));
    }

    /// Leaves the innermost scope, returning its finished table.
    pub fn pop(&mut self) -> SymbolTable {
        self.tables.pop().expect("scope stack underflow")
    }

    pub fn current(&self) -> &SymbolTable {
        self.tables.last().expect("scope stack is empty")
    }

    pub fn current_mut(&mut self) -> &mut SymbolTable {
        self.tables.last_mut().expect("scope stack is empty")
    }

    /// Whether the scope immediately enclosing the current one is a class
    /// body that declared a `__class__` cell.
    pub fn parent_is_class_with_cell(&self) -> bool {
        let len = self.tables.len();
        len >= 2
            && self.tables[len - 2].kind == ScopeKind::Class
            && self.tables[len - 2].cells.iter().any(|c| c == "__class__")
    }

    /// Defines a parameter as a local of the current scope.
    pub fn define_param(&mut self, name: &str) -> u16 {
        let table = self.current_mut();
        if let Some(sym) = table.get(name)
            && sym.scope == SymScope::Local
        {
            return sym.index;
        }
        let slot = table.alloc_local();
        table.insert(
            name,
            Symbol {
                scope: SymScope::Local,
                index: slot,
                original_index: None,
            },
        );
        slot
    }

    /// Validates and resolves one `nonlocal` declaration of the current
    /// scope, performing the capture immediately.
    pub fn declare_nonlocal(&mut self, name: &str) -> Result<(), String> {
        let cur = self.tables.len() - 1;
        if self.tables[cur].kind == ScopeKind::Module {
            return Err("nonlocal declaration not allowed at module level".to_owned());
        }
        let Some(source) = self.find_capture_source(cur, name) else {
            return Err(format!("no binding for nonlocal '{name}' found"));
        };
        self.capture(source, cur, name);
        Ok(())
    }

    /// Resolves a name in the current scope, performing any capture the
    /// resolution requires.
    pub fn resolve(&mut self, name: &str) -> Symbol {
        let cur = self.tables.len() - 1;
        if let Some(sym) = self.tables[cur].get(name) {
            return sym;
        }
        if self.tables[cur].kind == ScopeKind::Module {
            let scope = if self.tables[cur].assigned.contains(name) {
                SymScope::Global
            } else {
                SymScope::Builtin
            };
            return self.tables[cur].insert(name, Symbol::plain(scope));
        }
        if self.tables[cur].globals.contains(name) {
            return self.tables[cur].insert(name, Symbol::plain(SymScope::Global));
        }
        if !self.tables[cur].nonlocals.contains(name) && self.tables[cur].assigned.contains(name) {
            let slot = self.tables[cur].alloc_local();
            return self.tables[cur].insert(
                name,
                Symbol {
                    scope: SymScope::Local,
                    index: slot,
                    original_index: None,
                },
            );
        }
        match self.find_capture_source(cur, name) {
            Some(source) => self.capture(source, cur, name),
            None => {
                let scope = if self.tables.first().is_some_and(|t| t.assigned.contains(name)) {
                    SymScope::Global
                } else {
                    SymScope::Builtin
                };
                self.tables[cur].insert(name, Symbol::plain(scope))
            }
        }
    }

    /// Resolves the store target of a walrus inside a comprehension, which
    /// assigns into the first non-comprehension enclosing scope.
    pub fn resolve_walrus_store(&mut self, name: &str) -> Result<Symbol, String> {
        let cur = self.tables.len() - 1;
        let mut owner = cur;
        while owner > 0 && self.tables[owner].kind == ScopeKind::Comprehension {
            owner -= 1;
        }
        if owner == cur {
            return Ok(self.resolve(name));
        }
        match self.tables[owner].kind {
            ScopeKind::Module => Ok(self.tables[cur].insert(name, Symbol::plain(SymScope::Global))),
            ScopeKind::Class => Err(format!(
                "assignment expression within a comprehension cannot be used in a class body: '{name}'"
            )),
            ScopeKind::Function | ScopeKind::Comprehension => {
                self.tables[owner].assigned.insert(name.to_owned());
                Ok(self.capture(owner, cur, name))
            }
        }
    }

    /// Finds the innermost enclosing function-like scope that owns `name`.
    ///
    /// Class scopes are skipped (their locals are not visible to nested
    /// scopes) with the single exception of the `__class__` cell. A scope
    /// that declared the name `global` stops the walk.
    fn find_capture_source(&self, cur: usize, name: &str) -> Option<usize> {
        for i in (0..cur).rev() {
            let table = &self.tables[i];
            match table.kind {
                ScopeKind::Module => return None,
                ScopeKind::Class => {
                    if name == "__class__" && table.cells.iter().any(|c| c == name) {
                        return Some(i);
                    }
                }
                ScopeKind::Function | ScopeKind::Comprehension => {
                    if table.globals.contains(name) {
                        return None;
                    }
                    if table.nonlocals.contains(name) {
                        // Pass-through: the true owner is further out.
                        continue;
                    }
                    if table.assigned.contains(name) {
                        return Some(i);
                    }
                }
            }
        }
        None
    }

    /// Promotes the name to a cell at `source` and threads the free
    /// reference through every scope from just inside `source` to `cur`.
    fn capture(&mut self, source: usize, cur: usize, name: &str) -> Symbol {
        self.tables[source].promote_to_cell(name);
        let mut result = self.tables[source].get(name).unwrap_or(Symbol::plain(SymScope::Cell));
        for i in source + 1..=cur {
            result = self.tables[i].add_free(name);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn function_scope(assigned: &[&str]) -> ScopeInfo {
        let mut info = ScopeInfo::default();
        for name in assigned {
            info.assigned.insert((*name).to_owned());
        }
        info
    }

    #[test]
    fn module_assignment_is_global() {
        let mut scopes = ScopeStack::new();
        scopes.push(ScopeKind::Module, function_scope(&["x"]));
        assert_eq!(scopes.resolve("x").scope, SymScope::Global);
        assert_eq!(scopes.resolve("print").scope, SymScope::Builtin);
    }

    #[test]
    fn function_assignment_is_local() {
        let mut scopes = ScopeStack::new();
        scopes.push(ScopeKind::Module, function_scope(&[]));
        scopes.push(ScopeKind::Function, function_scope(&["a", "b"]));
        let a = scopes.resolve("a");
        let b = scopes.resolve("b");
        assert_eq!(a.scope, SymScope::Local);
        assert_eq!(b.scope, SymScope::Local);
        assert_ne!(a.index, b.index);
    }

    #[test]
    fn capture_promotes_enclosing_local_to_cell() {
        let mut scopes = ScopeStack::new();
        scopes.push(ScopeKind::Module, function_scope(&[]));
        scopes.push(ScopeKind::Function, function_scope(&["x"]));
        // Materialize x as a local with a slot first.
        let local = scopes.resolve("x");
        assert_eq!(local.scope, SymScope::Local);

        scopes.push(ScopeKind::Function, function_scope(&[]));
        let free = scopes.resolve("x");
        assert_eq!(free.scope, SymScope::Free);
        assert_eq!(free.index, 0);

        let inner = scopes.pop();
        assert_eq!(inner.frees, vec!["x".to_owned()]);
        let outer = scopes.pop();
        assert_eq!(outer.cells, vec!["x".to_owned()]);
        let promoted = outer.get("x").unwrap();
        assert_eq!(promoted.scope, SymScope::Cell);
        assert_eq!(promoted.original_index, Some(local.index));
    }

    #[test]
    fn promotion_is_idempotent() {
        let mut scopes = ScopeStack::new();
        scopes.push(ScopeKind::Module, function_scope(&[]));
        scopes.push(ScopeKind::Function, function_scope(&["x"]));
        scopes.push(ScopeKind::Function, function_scope(&[]));
        let first = scopes.resolve("x");
        let second = scopes.resolve("x");
        assert_eq!(first, second);
        scopes.pop();
        let outer = scopes.pop();
        assert_eq!(outer.cells.len(), 1);
    }

    #[test]
    fn intermediate_scopes_propagate_frees() {
        let mut scopes = ScopeStack::new();
        scopes.push(ScopeKind::Module, function_scope(&[]));
        scopes.push(ScopeKind::Function, function_scope(&["x"]));
        scopes.push(ScopeKind::Function, function_scope(&[]));
        scopes.push(ScopeKind::Function, function_scope(&[]));
        let sym = scopes.resolve("x");
        assert_eq!(sym.scope, SymScope::Free);
        let innermost = scopes.pop();
        assert_eq!(innermost.frees, vec!["x".to_owned()]);
        let middle = scopes.pop();
        assert_eq!(middle.frees, vec!["x".to_owned()], "pass-through scope records the free");
        let owner = scopes.pop();
        assert_eq!(owner.cells, vec!["x".to_owned()]);
    }

    #[test]
    fn global_declaration_wins_over_assignment() {
        let mut scopes = ScopeStack::new();
        scopes.push(ScopeKind::Module, function_scope(&[]));
        let mut info = function_scope(&["x"]);
        info.globals.insert("x".to_owned());
        scopes.push(ScopeKind::Function, info);
        assert_eq!(scopes.resolve("x").scope, SymScope::Global);
    }

    #[test]
    fn nonlocal_requires_enclosing_binding() {
        let mut scopes = ScopeStack::new();
        scopes.push(ScopeKind::Module, function_scope(&["x"]));
        scopes.push(ScopeKind::Function, function_scope(&[]));
        assert!(scopes.declare_nonlocal("x").is_err(), "module globals do not satisfy nonlocal");

        scopes.push(ScopeKind::Function, function_scope(&[]));
        assert!(scopes.declare_nonlocal("missing").is_err());
    }

    #[test]
    fn nonlocal_captures_enclosing_local() {
        let mut scopes = ScopeStack::new();
        scopes.push(ScopeKind::Module, function_scope(&[]));
        scopes.push(ScopeKind::Function, function_scope(&["count"]));
        scopes.push(ScopeKind::Function, function_scope(&["count"]));
        // `nonlocal count` in the inner scope overrides the local classification.
        let mut_inner = scopes.current_mut();
        mut_inner.nonlocals.insert("count".to_owned());
        assert!(scopes.declare_nonlocal("count").is_ok());
        assert_eq!(scopes.resolve("count").scope, SymScope::Free);
    }

    #[test]
    fn comprehension_walrus_hoists_to_function() {
        let mut scopes = ScopeStack::new();
        scopes.push(ScopeKind::Module, function_scope(&[]));
        scopes.push(ScopeKind::Function, function_scope(&[]));
        scopes.push(ScopeKind::Comprehension, function_scope(&[".0", "i"]));
        let sym = scopes.resolve_walrus_store("total").unwrap();
        assert_eq!(sym.scope, SymScope::Free);
        scopes.pop();
        let function = scopes.pop();
        assert_eq!(function.cells, vec!["total".to_owned()]);
    }

    #[test]
    fn comprehension_walrus_at_module_is_global() {
        let mut scopes = ScopeStack::new();
        scopes.push(ScopeKind::Module, function_scope(&[]));
        scopes.push(ScopeKind::Comprehension, function_scope(&[".0"]));
        let sym = scopes.resolve_walrus_store("found").unwrap();
        assert_eq!(sym.scope, SymScope::Global);
    }

    #[test]
    fn class_scope_is_skipped_in_capture_walk() {
        let mut scopes = ScopeStack::new();
        scopes.push(ScopeKind::Module, function_scope(&[]));
        scopes.push(ScopeKind::Function, function_scope(&["x"]));
        scopes.push(ScopeKind::Class, function_scope(&["x"]));
        scopes.push(ScopeKind::Function, function_scope(&[]));
        let sym = scopes.resolve("x");
        assert_eq!(sym.scope, SymScope::Free);
        scopes.pop();
        scopes.pop();
        let function = scopes.pop();
        assert_eq!(function.cells, vec!["x".to_owned()], "the function local, not the class local, is captured");
    }

    #[test]
    fn class_cell_is_capturable() {
        let mut scopes = ScopeStack::new();
        scopes.push(ScopeKind::Module, function_scope(&[]));
        scopes.push(ScopeKind::Class, function_scope(&[]));
        scopes.current_mut().declare_class_cell();
        scopes.push(ScopeKind::Function, function_scope(&[]));
        let sym = scopes.resolve("__class__");
        assert_eq!(sym.scope, SymScope::Free);
        let method = scopes.pop();
        assert_eq!(method.frees, vec!["__class__".to_owned()]);
    }

    #[test]
    fn scope_info_collects_assignments() {
        use crate::parse::parse_module_text;
        let (module, errors) = parse_module_text(
            "a = 1\nfor i in range(3):\n    pass\ndef f():\n    pass\nimport os.path\nwith open('x') as fh:\n    pass\n",
            "test.py",
        );
        assert_eq!(errors, vec![]);
        let info = ScopeInfo::for_module(&module.body);
        for name in ["a", "i", "f", "os", "fh"] {
            assert!(info.assigned.contains(name), "missing {name}");
        }
    }

    #[test]
    fn scope_info_collects_walrus_in_comprehension() {
        use crate::parse::parse_module_text;
        let (module, errors) = parse_module_text("values = [y := x, y ** 2]\n", "test.py");
        assert_eq!(errors, vec![]);
        let info = ScopeInfo::for_module(&module.body);
        assert!(info.assigned.contains("y"));
    }
}
