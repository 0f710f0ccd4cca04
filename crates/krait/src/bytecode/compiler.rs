//! AST to bytecode compilation.
//!
//! One [`Compiler`] drives the whole tree. Nested scopes (functions, class
//! bodies, comprehensions) are compiled reentrantly: the per-scope mutable
//! state lives in a [`CompileUnit`] pushed onto a stack alongside its
//! [`SymbolTable`], and popping the pair finalizes a [`CodeObject`] that the
//! parent embeds in its constant pool.

use crate::{
    ast::{
        Arguments, BoolOperator, ClassDef, CmpOperator, Comprehension, Conversion, ExceptHandler, Expr, ExprLoc,
        FStringPart, FunctionDef, Keyword, Literal, MatchCase, Module, Operator, Pattern, PatternLoc, Singleton, Stmt,
        StmtLoc, UnaryOperator, WithItem, body_references_class_cell,
    },
    error::CompileError,
    location::CodeRange,
    scope::{ScopeInfo, ScopeKind, ScopeStack, SymScope, Symbol},
    value::Value,
};

use super::{
    builder::{CodeBuilder, JumpLabel},
    code::{CodeFlags, CodeObject},
    op::Opcode,
};

/// Compiles a parsed module into a code object plus any emitter diagnostics.
pub(crate) fn compile_module(module: &Module, filename: &str) -> (CodeObject, Vec<CompileError>) {
    let mut compiler = Compiler::new(filename);
    compiler.scopes.push(ScopeKind::Module, ScopeInfo::for_module(&module.body));
    compiler.units.push(CompileUnit::new(
        CodeBuilder::new(filename),
        "<module>".to_owned(),
        1,
        ScopeKind::Module,
        false,
    ));
    compiler.compile_scope_body(&module.body);
    compiler.builder().emit(Opcode::LoadNone);
    compiler.builder().emit(Opcode::Return);
    let code = compiler.finish_unit();
    (code, compiler.errors)
}

/// Tracks one enclosing loop for `break`/`continue` emission.
struct LoopCtx {
    /// Jump target of `continue`: the `while` test or the `ForIter`.
    start: usize,
    /// `break` jumps patched to the common post-loop offset.
    break_jumps: Vec<JumpLabel>,
    /// For loops keep their iterator on the stack; `break` must pop it.
    is_for: bool,
}

/// Per-scope emission state, saved and restored around nested scopes.
struct CompileUnit {
    builder: CodeBuilder,
    name: String,
    first_line: u32,
    kind: ScopeKind,
    is_async: bool,
    is_generator: bool,
    arg_count: u16,
    kwonly_arg_count: u16,
    var_flags: CodeFlags,
    loops: Vec<LoopCtx>,
    /// `LoadDeref`/`StoreDeref` of free variables, patched once the scope's
    /// cell count is final (free indices follow the cells).
    free_patches: Vec<(usize, u16)>,
}

impl CompileUnit {
    fn new(builder: CodeBuilder, name: String, first_line: u32, kind: ScopeKind, is_async: bool) -> Self {
        Self {
            builder,
            name,
            first_line,
            kind,
            is_async,
            is_generator: false,
            arg_count: 0,
            kwonly_arg_count: 0,
            var_flags: CodeFlags::default(),
            loops: Vec::new(),
            free_patches: Vec::new(),
        }
    }
}

/// How a function-like scope's body is provided.
#[derive(Clone, Copy)]
enum FnBody<'a> {
    /// Ordinary statements (`def`, `async def`).
    Stmts(&'a [StmtLoc]),
    /// A single returned expression (lambda).
    Expr(&'a ExprLoc),
}

struct Compiler {
    filename: String,
    scopes: ScopeStack,
    units: Vec<CompileUnit>,
    /// Qualified-name components of the enclosing scopes.
    qual_stack: Vec<String>,
    errors: Vec<CompileError>,
}

impl Compiler {
    fn new(filename: &str) -> Self {
        Self {
            filename: filename.to_owned(),
            scopes: ScopeStack::new(),
            units: Vec::new(),
            qual_stack: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn unit(&mut self) -> &mut CompileUnit {
        self.units.last_mut().expect("no active compile unit")
    }

    fn builder(&mut self) -> &mut CodeBuilder {
        &mut self.unit().builder
    }

    fn err(&mut self, range: CodeRange, message: impl Into<String>) {
        self.errors.push(CompileError::new(&self.filename, range, message));
    }

    fn qualname(&self, name: &str) -> String {
        if self.qual_stack.is_empty() {
            name.to_owned()
        } else {
            format!("{}.{}", self.qual_stack.join("."), name)
        }
    }

    /// Pops the current unit and symbol table and assembles the code object.
    fn finish_unit(&mut self) -> CodeObject {
        let mut unit = self.units.pop().expect("no active compile unit");
        let table = self.scopes.pop();

        let cell_count = u16::try_from(table.cells.len()).unwrap_or(u16::MAX);
        for (offset, free_index) in unit.free_patches.drain(..) {
            unit.builder.patch_arg_at(offset, cell_count.saturating_add(free_index));
        }

        // Densify varnames: every local slot gets its name, and a promoted
        // cell's former slot keeps the name so the VM can move parameter
        // values into cells on entry.
        for (name, sym) in table.symbols() {
            match sym.scope {
                SymScope::Local => unit.builder.note_varname(sym.index, name),
                SymScope::Cell => {
                    if let Some(original) = sym.original_index {
                        unit.builder.note_varname(original, name);
                    }
                }
                _ => {}
            }
        }

        let mut flags = unit.var_flags;
        if unit.is_async {
            if unit.is_generator {
                flags.insert(CodeFlags::ASYNC_GENERATOR);
            } else {
                flags.insert(CodeFlags::COROUTINE);
            }
        } else if unit.is_generator {
            flags.insert(CodeFlags::GENERATOR);
        }

        unit.builder.finish(
            unit.name,
            unit.first_line,
            unit.arg_count,
            unit.kwonly_arg_count,
            flags,
            table.cells,
            table.frees,
            &mut self.errors,
        )
    }

    // === Name access ===

    fn emit_deref(&mut self, op: Opcode, sym: Symbol) {
        match sym.scope {
            SymScope::Cell => self.builder().emit_arg(op, i32::from(sym.index)),
            SymScope::Free => {
                let at = self.builder().current_offset();
                self.builder().emit_arg(op, i32::from(sym.index));
                self.unit().free_patches.push((at, sym.index));
            }
            _ => unreachable!("emit_deref on non-cell symbol"),
        }
    }

    fn emit_load_name(&mut self, name: &str) {
        let sym = self.scopes.resolve(name);
        let kind = self.unit().kind;
        match sym.scope {
            SymScope::Cell | SymScope::Free => self.emit_deref(Opcode::LoadDeref, sym),
            SymScope::Local if matches!(kind, ScopeKind::Function | ScopeKind::Comprehension) => {
                self.builder().note_varname(sym.index, name);
                self.builder().emit_arg(Opcode::LoadFast, i32::from(sym.index));
            }
            SymScope::Global | SymScope::Builtin
                if matches!(kind, ScopeKind::Function | ScopeKind::Comprehension) =>
            {
                let index = self.builder().add_name(name);
                self.builder().emit_arg(Opcode::LoadGlobal, i32::from(index));
            }
            // Module and class bodies resolve names dynamically.
            _ => {
                let index = self.builder().add_name(name);
                self.builder().emit_arg(Opcode::LoadName, i32::from(index));
            }
        }
    }

    fn emit_store_sym(&mut self, name: &str, sym: Symbol) {
        let kind = self.unit().kind;
        match sym.scope {
            SymScope::Cell | SymScope::Free => self.emit_deref(Opcode::StoreDeref, sym),
            SymScope::Local if matches!(kind, ScopeKind::Function | ScopeKind::Comprehension) => {
                self.builder().note_varname(sym.index, name);
                self.builder().emit_arg(Opcode::StoreFast, i32::from(sym.index));
            }
            SymScope::Global | SymScope::Builtin if kind != ScopeKind::Module => {
                let index = self.builder().add_name(name);
                self.builder().emit_arg(Opcode::StoreGlobal, i32::from(index));
            }
            _ => {
                let index = self.builder().add_name(name);
                self.builder().emit_arg(Opcode::StoreName, i32::from(index));
            }
        }
    }

    fn emit_store_name(&mut self, name: &str) {
        let sym = self.scopes.resolve(name);
        self.emit_store_sym(name, sym);
    }

    fn emit_delete_name(&mut self, name: &str, range: CodeRange) {
        let sym = self.scopes.resolve(name);
        let kind = self.unit().kind;
        match sym.scope {
            SymScope::Cell | SymScope::Free => {
                self.err(range, format!("cannot delete variable '{name}' referenced in nested scope"));
            }
            SymScope::Local if matches!(kind, ScopeKind::Function | ScopeKind::Comprehension) => {
                self.builder().note_varname(sym.index, name);
                self.builder().emit_arg(Opcode::DeleteFast, i32::from(sym.index));
            }
            SymScope::Global | SymScope::Builtin if kind != ScopeKind::Module => {
                let index = self.builder().add_name(name);
                self.builder().emit_arg(Opcode::DeleteGlobal, i32::from(index));
            }
            _ => {
                let index = self.builder().add_name(name);
                self.builder().emit_arg(Opcode::DeleteName, i32::from(index));
            }
        }
    }

    fn emit_load_global_name(&mut self, name: &str) {
        let index = self.builder().add_name(name);
        self.builder().emit_arg(Opcode::LoadGlobal, i32::from(index));
    }

    fn load_const(&mut self, value: Value) {
        let index = self.builder().add_const(value);
        self.builder().emit_arg(Opcode::LoadConst, i32::from(index));
    }

    // === Statements ===

    /// Compiles a scope body, treating a leading string-literal statement as
    /// a docstring: it reaches the constant pool but emits no code.
    fn compile_scope_body(&mut self, body: &[StmtLoc]) {
        let mut rest = body;
        if let Some((first, tail)) = body.split_first()
            && let Stmt::Expr(expr) = &first.stmt
            && let Expr::Literal(Literal::Str(text)) = &expr.expr
        {
            let _ = self.builder().add_const(Value::Str(text.clone()));
            rest = tail;
        }
        for stmt in rest {
            self.compile_stmt(stmt);
        }
    }

    fn compile_stmts(&mut self, body: &[StmtLoc]) {
        for stmt in body {
            self.compile_stmt(stmt);
        }
    }

    fn compile_stmt(&mut self, stmt: &StmtLoc) {
        self.builder().set_location(stmt.position);
        match &stmt.stmt {
            Stmt::Expr(expr) => {
                self.compile_expr(expr);
                self.builder().emit(Opcode::Pop);
            }
            Stmt::Assign { targets, value } => {
                self.compile_expr(value);
                for (i, target) in targets.iter().enumerate() {
                    if i + 1 < targets.len() {
                        self.builder().emit(Opcode::Dup);
                    }
                    self.compile_store_target(target);
                }
            }
            Stmt::AugAssign { target, op, value } => self.compile_aug_assign(target, *op, value),
            Stmt::AnnAssign {
                target,
                annotation,
                value,
            } => {
                if let Some(value) = value {
                    self.compile_expr(value);
                    self.compile_store_target(target);
                }
                // Annotations evaluate for their side effects at module and
                // class level only.
                if matches!(self.unit().kind, ScopeKind::Module | ScopeKind::Class) {
                    self.compile_expr(annotation);
                    self.builder().emit(Opcode::Pop);
                }
            }
            Stmt::If { test, body, orelse } => {
                self.compile_expr(test);
                let to_else = self.builder().emit_jump(Opcode::PopJumpIfFalse);
                self.compile_stmts(body);
                if orelse.is_empty() {
                    self.builder().patch_jump(to_else);
                } else {
                    let to_end = self.builder().emit_jump(Opcode::Jump);
                    self.builder().patch_jump(to_else);
                    self.compile_stmts(orelse);
                    self.builder().patch_jump(to_end);
                }
            }
            Stmt::While { test, body, orelse } => self.compile_while(test, body, orelse),
            Stmt::For {
                target,
                iter,
                body,
                orelse,
                is_async,
            } => {
                if *is_async && !self.unit().is_async {
                    self.err(stmt.position, "'async for' outside async function");
                }
                self.compile_for(target, iter, body, orelse);
            }
            Stmt::FunctionDef(def) => self.compile_function_def(def, stmt.position),
            Stmt::ClassDef(def) => self.compile_class_def(def, stmt.position),
            Stmt::Return(value) => {
                if !matches!(self.unit().kind, ScopeKind::Function) {
                    self.err(stmt.position, "'return' outside function");
                }
                match value {
                    Some(value) => self.compile_expr(value),
                    None => self.builder().emit(Opcode::LoadNone),
                }
                self.builder().emit(Opcode::Return);
            }
            Stmt::Pass => {}
            Stmt::Break => {
                let Some(is_for) = self.unit().loops.last().map(|ctx| ctx.is_for) else {
                    self.err(stmt.position, "'break' outside loop");
                    return;
                };
                if is_for {
                    self.builder().emit(Opcode::Pop);
                }
                let label = self.builder().emit_jump(Opcode::Jump);
                if is_for {
                    // The pop above is only on the break path; restore the
                    // linear bookkeeping for the code that follows.
                    self.builder().adjust_stack_depth(1);
                }
                self.unit()
                    .loops
                    .last_mut()
                    .expect("loop context vanished")
                    .break_jumps
                    .push(label);
            }
            Stmt::Continue => {
                let Some(ctx) = self.unit().loops.last() else {
                    self.err(stmt.position, "'continue' outside loop");
                    return;
                };
                let start = ctx.start;
                self.builder().emit_jump_to(Opcode::Jump, start);
            }
            Stmt::Import { names } => self.compile_import(names),
            Stmt::ImportFrom { module, names, star } => self.compile_import_from(module, names, *star),
            Stmt::Raise { exc, cause } => {
                let mut argc = 0;
                if let Some(exc) = exc {
                    self.compile_expr(exc);
                    argc = 1;
                }
                if let Some(cause) = cause {
                    self.compile_expr(cause);
                    argc = 2;
                }
                self.builder().emit_arg(Opcode::RaiseVarargs, argc);
            }
            Stmt::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => self.compile_try(body, handlers, orelse, finalbody),
            Stmt::With { items, body, is_async } => {
                if *is_async && !self.unit().is_async {
                    self.err(stmt.position, "'async with' outside async function");
                }
                self.compile_with(items, body);
            }
            Stmt::Assert { test, msg } => {
                self.compile_expr(test);
                let to_end = self.builder().emit_jump(Opcode::PopJumpIfTrue);
                self.emit_load_global_name("AssertionError");
                if let Some(msg) = msg {
                    self.compile_expr(msg);
                    self.builder().emit_arg(Opcode::Call, 1);
                }
                self.builder().emit_arg(Opcode::RaiseVarargs, 1);
                self.builder().patch_jump(to_end);
            }
            Stmt::Delete { targets } => {
                for target in targets {
                    self.compile_delete_target(target);
                }
            }
            // Declarations were consumed by the pre-scan; `nonlocal` still
            // validates here, where a source position is at hand.
            Stmt::Global { .. } => {}
            Stmt::Nonlocal { names } => {
                for name in names {
                    if let Err(message) = self.scopes.declare_nonlocal(name) {
                        self.err(stmt.position, message);
                    }
                }
            }
            Stmt::Match { subject, cases } => self.compile_match(subject, cases),
            Stmt::TypeAlias { name, value, .. } => {
                self.compile_expr(value);
                self.emit_store_name(name);
            }
        }
    }

    fn compile_while(&mut self, test: &ExprLoc, body: &[StmtLoc], orelse: &[StmtLoc]) {
        let start = self.builder().current_offset();
        self.unit().loops.push(LoopCtx {
            start,
            break_jumps: Vec::new(),
            is_for: false,
        });
        self.compile_expr(test);
        let to_else = self.builder().emit_jump(Opcode::PopJumpIfFalse);
        self.compile_stmts(body);
        self.builder().emit_jump_to(Opcode::Jump, start);
        self.builder().patch_jump(to_else);
        self.compile_stmts(orelse);
        let ctx = self.unit().loops.pop().expect("loop context vanished");
        for label in ctx.break_jumps {
            self.builder().patch_jump(label);
        }
    }

    fn compile_for(&mut self, target: &ExprLoc, iter: &ExprLoc, body: &[StmtLoc], orelse: &[StmtLoc]) {
        let base = self.builder().stack_depth();
        self.compile_expr(iter);
        self.builder().emit(Opcode::GetIter);
        let start = self.builder().current_offset();
        self.unit().loops.push(LoopCtx {
            start,
            break_jumps: Vec::new(),
            is_for: true,
        });
        let to_end = self.builder().emit_jump(Opcode::ForIter);
        self.compile_store_target(target);
        self.compile_stmts(body);
        self.builder().emit_jump_to(Opcode::Jump, start);
        self.builder().patch_jump(to_end);
        // ForIter popped the iterator on the exhaustion edge.
        self.builder().set_stack_depth(base);
        self.compile_stmts(orelse);
        let ctx = self.unit().loops.pop().expect("loop context vanished");
        for label in ctx.break_jumps {
            self.builder().patch_jump(label);
        }
    }

    fn compile_aug_assign(&mut self, target: &ExprLoc, op: Operator, value: &ExprLoc) {
        let inplace = inplace_op(op);
        match &target.expr {
            Expr::Name(name) => {
                self.emit_load_name(name);
                self.compile_expr(value);
                self.builder().emit(inplace);
                self.emit_store_name(name);
            }
            Expr::Attribute { object, attr } => {
                self.compile_expr(object);
                self.builder().emit(Opcode::Dup);
                let index = self.builder().add_name(attr);
                self.builder().emit_arg(Opcode::LoadAttr, i32::from(index));
                self.compile_expr(value);
                self.builder().emit(inplace);
                self.builder().emit(Opcode::Rot2);
                self.builder().emit_arg(Opcode::StoreAttr, i32::from(index));
            }
            Expr::Subscript { object, index } => {
                // Subject and index evaluate exactly once: duplicate the
                // pair, read the old value, apply, rotate, store.
                self.compile_expr(object);
                self.compile_expr(index);
                self.builder().emit(Opcode::Dup2);
                self.builder().emit(Opcode::BinarySubscr);
                self.compile_expr(value);
                self.builder().emit(inplace);
                self.builder().emit(Opcode::Rot3);
                self.builder().emit(Opcode::StoreSubscr);
            }
            _ => self.err(target.position, "invalid augmented assignment target"),
        }
    }

    /// Stores the value on top of the stack into an assignment target.
    fn compile_store_target(&mut self, target: &ExprLoc) {
        match &target.expr {
            Expr::Name(name) => {
                // Walrus targets inside comprehensions hoist; plain targets
                // resolve in the current scope.
                self.emit_store_name(name);
            }
            Expr::Attribute { object, attr } => {
                self.compile_expr(object);
                let index = self.builder().add_name(attr);
                self.builder().emit_arg(Opcode::StoreAttr, i32::from(index));
            }
            Expr::Subscript { object, index } => {
                self.compile_expr(object);
                self.compile_expr(index);
                self.builder().emit(Opcode::StoreSubscr);
            }
            Expr::Tuple(items) | Expr::List(items) => self.compile_unpack_targets(target.position, items),
            Expr::Starred(_) => {
                self.err(target.position, "starred assignment target must be within a list or tuple");
                self.builder().emit(Opcode::Pop);
            }
            _ => {
                self.err(target.position, "invalid assignment target");
                self.builder().emit(Opcode::Pop);
            }
        }
    }

    fn compile_unpack_targets(&mut self, position: CodeRange, items: &[ExprLoc]) {
        let star_at = items.iter().position(|item| matches!(item.expr, Expr::Starred(_)));
        match star_at {
            None => {
                let count = i32::try_from(items.len()).unwrap_or(i32::MAX);
                self.builder().emit_arg(Opcode::UnpackSequence, count);
                for item in items {
                    self.compile_store_target(item);
                }
            }
            Some(star) => {
                let before = star;
                let after = items.len() - star - 1;
                if before > 0xFF || after > 0xFF {
                    self.err(position, "too many assignment targets around starred target");
                    self.builder().emit(Opcode::Pop);
                    return;
                }
                let packed = i32::try_from((before << 8) | after).unwrap_or(0);
                self.builder().emit_arg(Opcode::ExtractStar, packed);
                for item in items {
                    if let Expr::Starred(inner) = &item.expr {
                        self.compile_store_target(inner);
                    } else {
                        self.compile_store_target(item);
                    }
                }
            }
        }
    }

    fn compile_delete_target(&mut self, target: &ExprLoc) {
        match &target.expr {
            Expr::Name(name) => self.emit_delete_name(name, target.position),
            Expr::Attribute { object, attr } => {
                self.compile_expr(object);
                let index = self.builder().add_name(attr);
                self.builder().emit_arg(Opcode::DeleteAttr, i32::from(index));
            }
            Expr::Subscript { object, index } => {
                self.compile_expr(object);
                self.compile_expr(index);
                self.builder().emit(Opcode::DeleteSubscr);
            }
            Expr::Tuple(items) | Expr::List(items) => {
                for item in items {
                    self.compile_delete_target(item);
                }
            }
            _ => self.err(target.position, "cannot delete this expression"),
        }
    }

    fn compile_import(&mut self, names: &[crate::ast::ImportAlias]) {
        for alias in names {
            self.load_const(Value::None);
            let name_index = self.builder().add_name(&alias.name);
            self.builder().emit_arg(Opcode::ImportName, i32::from(name_index));
            match &alias.alias {
                Some(bound) => {
                    // `import a.b.c as x` binds the attribute chain.
                    for attr in alias.name.split('.').skip(1) {
                        let index = self.builder().add_name(attr);
                        self.builder().emit_arg(Opcode::LoadAttr, i32::from(index));
                    }
                    self.emit_store_name(bound);
                }
                None => {
                    // `import a.b.c` binds the top-level package name.
                    let top = alias.name.split('.').next().unwrap_or(&alias.name);
                    self.emit_store_name(top);
                }
            }
        }
    }

    fn compile_import_from(&mut self, module: &str, names: &[crate::ast::ImportAlias], star: bool) {
        if star {
            self.load_const(Value::StrArray(vec!["*".to_owned()]));
            let index = self.builder().add_name(module);
            self.builder().emit_arg(Opcode::ImportName, i32::from(index));
            self.builder().emit(Opcode::ImportStar);
            return;
        }
        let fromlist: Vec<String> = names.iter().map(|a| a.name.clone()).collect();
        self.load_const(Value::StrArray(fromlist));
        let index = self.builder().add_name(module);
        self.builder().emit_arg(Opcode::ImportName, i32::from(index));
        for alias in names {
            let attr_index = self.builder().add_name(&alias.name);
            self.builder().emit_arg(Opcode::ImportFrom, i32::from(attr_index));
            let bound = alias.alias.as_deref().unwrap_or(&alias.name);
            self.emit_store_name(bound);
        }
        self.builder().emit(Opcode::Pop);
    }

    fn compile_try(
        &mut self,
        body: &[StmtLoc],
        handlers: &[ExceptHandler],
        orelse: &[StmtLoc],
        finalbody: &[StmtLoc],
    ) {
        let base = self.builder().stack_depth();
        let finally_label = (!finalbody.is_empty()).then(|| self.builder().emit_jump(Opcode::SetupFinally));
        let except_label = (!handlers.is_empty()).then(|| self.builder().emit_jump(Opcode::SetupExcept));

        self.compile_stmts(body);

        let mut end_jumps = Vec::new();
        if let Some(except_label) = except_label {
            self.builder().emit(Opcode::PopExcept);
            let to_else = self.builder().emit_jump(Opcode::Jump);
            self.builder().patch_jump(except_label);
            // The VM pushes the in-flight exception before entering.
            self.builder().set_stack_depth(base + 1);

            for handler in handlers {
                self.builder().set_location(handler.position);
                let next_label = handler.exc_type.as_ref().map(|exc_type| {
                    self.builder().emit(Opcode::Dup);
                    self.compile_expr(exc_type);
                    self.builder().emit(Opcode::ExceptionMatch);
                    self.builder().emit_jump(Opcode::PopJumpIfFalse)
                });
                match &handler.name {
                    Some(name) => self.emit_store_name(name),
                    None => self.builder().emit(Opcode::Pop),
                }
                self.compile_stmts(&handler.body);
                self.builder().emit(Opcode::ClearException);
                if let Some(name) = &handler.name {
                    // The exception variable is unbound on normal handler exit.
                    let sym = self.scopes.resolve(name);
                    self.builder().emit(Opcode::LoadNone);
                    self.emit_store_sym(name, sym);
                    if !matches!(sym.scope, SymScope::Cell | SymScope::Free) {
                        self.emit_delete_name(name, handler.position);
                    }
                }
                end_jumps.push(self.builder().emit_jump(Opcode::Jump));
                if let Some(next_label) = next_label {
                    self.builder().patch_jump(next_label);
                    self.builder().set_stack_depth(base + 1);
                }
            }
            // No handler matched: re-raise.
            self.builder().emit_arg(Opcode::RaiseVarargs, 0);

            self.builder().patch_jump(to_else);
            self.builder().set_stack_depth(base);
        }

        self.compile_stmts(orelse);
        for label in end_jumps {
            self.builder().patch_jump(label);
        }

        if let Some(finally_label) = finally_label {
            self.builder().patch_jump(finally_label);
            self.compile_stmts(finalbody);
            self.builder().emit(Opcode::EndFinally);
        }
    }

    fn compile_with(&mut self, items: &[WithItem], body: &[StmtLoc]) {
        // Context managers stay on the stack across the body; exits run in
        // reverse acquisition order.
        for item in items {
            self.compile_expr(&item.context_expr);
            self.builder().emit(Opcode::Dup);
            let enter = self.builder().add_name("__enter__");
            self.builder().emit_arg(Opcode::LoadMethod, i32::from(enter));
            self.builder().emit_arg(Opcode::CallMethod, 0);
            match &item.target {
                Some(target) => self.compile_store_target(target),
                None => self.builder().emit(Opcode::Pop),
            }
        }
        self.compile_stmts(body);
        for _ in items.iter().rev() {
            let exit = self.builder().add_name("__exit__");
            self.builder().emit_arg(Opcode::LoadMethod, i32::from(exit));
            self.builder().emit(Opcode::LoadNone);
            self.builder().emit(Opcode::LoadNone);
            self.builder().emit(Opcode::LoadNone);
            self.builder().emit_arg(Opcode::CallMethod, 3);
            self.builder().emit(Opcode::Pop);
        }
    }

    // === Functions and classes ===

    fn compile_function_def(&mut self, def: &FunctionDef, position: CodeRange) {
        for decorator in &def.decorators {
            self.compile_expr(decorator);
        }
        self.emit_function(
            &def.name,
            &def.args,
            FnBody::Stmts(&def.body),
            def.is_async,
            position.start().line,
        );
        for _ in &def.decorators {
            self.builder().emit_arg(Opcode::Call, 1);
        }
        self.emit_store_name(&def.name);
    }

    /// Compiles a function-like scope and emits the `MakeFunction` sequence
    /// that builds it at run time.
    fn emit_function(&mut self, name: &str, args: &Arguments, body: FnBody<'_>, is_async: bool, first_line: u32) {
        let mut make_flags = 0;
        if !args.defaults.is_empty() {
            for default in &args.defaults {
                self.compile_expr(default);
            }
            let count = i32::try_from(args.defaults.len()).unwrap_or(i32::MAX);
            self.builder().emit_arg(Opcode::BuildTuple, count);
            make_flags |= 1;
        }
        let kw_defaults: Vec<(&str, &ExprLoc)> = args
            .kwonly
            .iter()
            .zip(&args.kw_defaults)
            .filter_map(|(param, default)| default.as_ref().map(|d| (param.name.as_str(), d)))
            .collect();
        if !kw_defaults.is_empty() {
            for (kw_name, default) in &kw_defaults {
                self.load_const(Value::Str((*kw_name).to_owned()));
                self.compile_expr(default);
            }
            let count = i32::try_from(kw_defaults.len()).unwrap_or(i32::MAX);
            self.builder().emit_arg(Opcode::BuildMap, count);
            make_flags |= 2;
        }

        let qualname = self.qualname(name);
        let info = match body {
            FnBody::Stmts(stmts) => ScopeInfo::for_function(args, stmts),
            FnBody::Expr(expr) => ScopeInfo::for_lambda(args, expr),
        };
        self.scopes.push(ScopeKind::Function, info);
        self.units.push(CompileUnit::new(
            CodeBuilder::new(&self.filename),
            name.to_owned(),
            first_line,
            ScopeKind::Function,
            is_async,
        ));
        self.qual_stack.push(format!("{name}.<locals>"));

        // Parameter slots, in CPython's varnames order.
        for param in args.posonly.iter().chain(&args.args).chain(&args.kwonly) {
            let slot = self.scopes.define_param(&param.name);
            self.builder().note_varname(slot, &param.name);
        }
        if let Some(param) = &args.vararg {
            let slot = self.scopes.define_param(&param.name);
            self.builder().note_varname(slot, &param.name);
            self.unit().var_flags.insert(CodeFlags::VARARGS);
        }
        if let Some(param) = &args.kwarg {
            let slot = self.scopes.define_param(&param.name);
            self.builder().note_varname(slot, &param.name);
            self.unit().var_flags.insert(CodeFlags::VARKEYWORDS);
        }
        self.unit().arg_count = u16::try_from(args.arg_count()).unwrap_or(u16::MAX);
        self.unit().kwonly_arg_count = u16::try_from(args.kwonly.len()).unwrap_or(u16::MAX);

        // Methods that mention `super` or `__class__` capture the class cell.
        if let FnBody::Stmts(stmts) = body
            && self.scopes.parent_is_class_with_cell()
            && body_references_class_cell(stmts)
        {
            let _ = self.scopes.resolve("__class__");
        }

        match body {
            FnBody::Stmts(stmts) => {
                self.compile_scope_body(stmts);
                self.builder().emit(Opcode::LoadNone);
                self.builder().emit(Opcode::Return);
            }
            FnBody::Expr(expr) => {
                self.compile_expr(expr);
                self.builder().emit(Opcode::Return);
            }
        }

        self.qual_stack.pop();
        let code = self.finish_unit();
        let code_index = self.builder().add_const(Value::Code(Box::new(code)));
        self.builder().emit_arg(Opcode::LoadConst, i32::from(code_index));
        self.load_const(Value::Str(qualname));
        self.builder().emit_arg(Opcode::MakeFunction, make_flags);
    }

    fn compile_class_def(&mut self, def: &ClassDef, position: CodeRange) {
        for decorator in &def.decorators {
            self.compile_expr(decorator);
        }
        self.builder().emit(Opcode::LoadBuildClass);

        // Compile the class body as a function executed by the builder.
        let qualname = self.qualname(&def.name);
        self.scopes.push(ScopeKind::Class, ScopeInfo::for_class(&def.body));
        let needs_class_cell = def.body.iter().any(|stmt| match &stmt.stmt {
            Stmt::FunctionDef(method) => body_references_class_cell(&method.body),
            _ => false,
        });
        if needs_class_cell {
            self.scopes.current_mut().declare_class_cell();
        }
        self.units.push(CompileUnit::new(
            CodeBuilder::new(&self.filename),
            def.name.clone(),
            position.start().line,
            ScopeKind::Class,
            false,
        ));
        self.qual_stack.push(def.name.clone());
        self.compile_scope_body(&def.body);
        self.builder().emit(Opcode::LoadLocals);
        self.builder().emit(Opcode::Return);
        self.qual_stack.pop();
        let code = self.finish_unit();

        let code_index = self.builder().add_const(Value::Code(Box::new(code)));
        self.builder().emit_arg(Opcode::LoadConst, i32::from(code_index));
        self.load_const(Value::Str(qualname));
        self.builder().emit_arg(Opcode::MakeFunction, 0);
        self.load_const(Value::Str(def.name.clone()));
        for base in &def.bases {
            if matches!(base.expr, Expr::Starred(_)) {
                self.err(base.position, "starred expressions in class bases are not supported");
                continue;
            }
            self.compile_expr(base);
        }
        let argc = 2 + i32::try_from(def.bases.len()).unwrap_or(0);
        if def.keywords.is_empty() {
            self.builder().emit_arg(Opcode::Call, argc);
        } else {
            let mut names = Vec::new();
            for kw in &def.keywords {
                match &kw.name {
                    Some(name) => {
                        names.push(name.clone());
                        self.compile_expr(&kw.value);
                    }
                    None => self.err(kw.position, "'**' in class definitions is not supported"),
                }
            }
            let count = i32::try_from(names.len()).unwrap_or(0);
            self.load_const(Value::StrArray(names));
            self.builder().emit_arg(Opcode::CallKw, argc + count);
        }

        for _ in &def.decorators {
            self.builder().emit_arg(Opcode::Call, 1);
        }
        self.emit_store_name(&def.name);
    }

    // === Expressions ===

    fn compile_expr(&mut self, expr: &ExprLoc) {
        self.builder().set_location(expr.position);
        match &expr.expr {
            Expr::Name(name) => self.emit_load_name(name),
            Expr::Literal(literal) => {
                let value = literal_value(literal);
                self.load_const(value);
            }
            Expr::FString(parts) => self.compile_fstring(parts),
            Expr::UnaryOp { op, operand } => {
                self.compile_expr(operand);
                self.builder().emit(match op {
                    UnaryOperator::Not => Opcode::UnaryNot,
                    UnaryOperator::Minus => Opcode::UnaryNegative,
                    UnaryOperator::Plus => Opcode::UnaryPositive,
                    UnaryOperator::Invert => Opcode::UnaryInvert,
                });
            }
            Expr::BinaryOp { left, op, right } => {
                self.compile_expr(left);
                self.compile_expr(right);
                self.builder().emit(binary_op(*op));
            }
            Expr::BoolOp { op, values } => {
                let short_circuit = match op {
                    BoolOperator::And => Opcode::JumpIfFalseOrPop,
                    BoolOperator::Or => Opcode::JumpIfTrueOrPop,
                };
                let mut labels = Vec::new();
                for (i, value) in values.iter().enumerate() {
                    self.compile_expr(value);
                    if i + 1 < values.len() {
                        labels.push(self.builder().emit_jump(short_circuit));
                    }
                }
                for label in labels {
                    self.builder().patch_jump(label);
                }
            }
            Expr::Compare { left, ops, comparators } => self.compile_compare(left, ops, comparators),
            Expr::Call { func, args, keywords } => self.compile_call(func, args, keywords),
            Expr::Attribute { object, attr } => {
                self.compile_expr(object);
                let index = self.builder().add_name(attr);
                self.builder().emit_arg(Opcode::LoadAttr, i32::from(index));
            }
            Expr::Subscript { object, index } => {
                self.compile_expr(object);
                self.compile_expr(index);
                self.builder().emit(Opcode::BinarySubscr);
            }
            Expr::Slice { lower, upper, step } => {
                // Slices build through the `slice` builtin, the same route
                // f-strings take through `str` and `format`.
                self.emit_load_global_name("slice");
                for part in [lower, upper, step] {
                    match part {
                        Some(part) => self.compile_expr(part),
                        None => self.load_const(Value::None),
                    }
                }
                self.builder().emit_arg(Opcode::Call, 3);
            }
            Expr::List(items) => {
                if has_starred(items) {
                    self.emit_load_global_name("list");
                    self.compile_star_items_as_tuple(items);
                    self.builder().emit_arg(Opcode::Call, 1);
                } else {
                    self.compile_exprs(items);
                    let count = i32::try_from(items.len()).unwrap_or(i32::MAX);
                    self.builder().emit_arg(Opcode::BuildList, count);
                }
            }
            Expr::Tuple(items) => {
                if has_starred(items) {
                    self.compile_star_items_as_tuple(items);
                } else {
                    self.compile_exprs(items);
                    let count = i32::try_from(items.len()).unwrap_or(i32::MAX);
                    self.builder().emit_arg(Opcode::BuildTuple, count);
                }
            }
            Expr::Set(items) => {
                if has_starred(items) {
                    self.emit_load_global_name("set");
                    self.compile_star_items_as_tuple(items);
                    self.builder().emit_arg(Opcode::Call, 1);
                } else {
                    self.compile_exprs(items);
                    let count = i32::try_from(items.len()).unwrap_or(i32::MAX);
                    self.builder().emit_arg(Opcode::BuildSet, count);
                }
            }
            Expr::Dict { keys, values } => self.compile_dict(keys, values),
            Expr::Lambda { args, body } => {
                self.emit_function("<lambda>", args, FnBody::Expr(body), false, expr.position.start().line);
            }
            Expr::ListComp { elt, generators } => {
                self.compile_comprehension(CompKind::List, elt, None, generators, expr.position);
            }
            Expr::SetComp { elt, generators } => {
                self.compile_comprehension(CompKind::Set, elt, None, generators, expr.position);
            }
            Expr::DictComp { key, value, generators } => {
                self.compile_comprehension(CompKind::Dict, key, Some(value), generators, expr.position);
            }
            Expr::GeneratorExp { elt, generators } => {
                self.compile_comprehension(CompKind::Generator, elt, None, generators, expr.position);
            }
            Expr::Yield(value) => {
                if !self.check_yield_allowed(expr.position) {
                    self.builder().emit(Opcode::LoadNone);
                    return;
                }
                match value {
                    Some(value) => self.compile_expr(value),
                    None => self.builder().emit(Opcode::LoadNone),
                }
                self.builder().emit(Opcode::YieldValue);
            }
            Expr::YieldFrom(value) => {
                if !self.check_yield_allowed(expr.position) {
                    self.builder().emit(Opcode::LoadNone);
                    return;
                }
                self.compile_expr(value);
                self.builder().emit(Opcode::GetIter);
                self.builder().emit(Opcode::YieldFrom);
            }
            Expr::Await(value) => {
                if !self.unit().is_async {
                    self.err(expr.position, "'await' outside async function");
                }
                self.compile_expr(value);
                self.builder().emit(Opcode::GetAwaitable);
                self.builder().emit(Opcode::YieldFrom);
            }
            Expr::Starred(_) => {
                self.err(expr.position, "starred expression cannot be used here");
                self.builder().emit(Opcode::LoadNone);
            }
            Expr::IfElse { test, body, orelse } => {
                let base = self.builder().stack_depth();
                self.compile_expr(test);
                let to_else = self.builder().emit_jump(Opcode::PopJumpIfFalse);
                self.compile_expr(body);
                let to_end = self.builder().emit_jump(Opcode::Jump);
                self.builder().patch_jump(to_else);
                self.builder().set_stack_depth(base);
                self.compile_expr(orelse);
                self.builder().patch_jump(to_end);
            }
            Expr::Named { target, value } => {
                self.compile_expr(value);
                self.builder().emit(Opcode::Dup);
                if let Expr::Name(name) = &target.expr {
                    if self.unit().kind == ScopeKind::Comprehension {
                        match self.scopes.resolve_walrus_store(name) {
                            Ok(sym) => self.emit_store_sym(name, sym),
                            Err(message) => {
                                self.err(target.position, message);
                                self.builder().emit(Opcode::Pop);
                            }
                        }
                    } else {
                        self.emit_store_name(name);
                    }
                } else {
                    self.err(target.position, "walrus target must be an identifier");
                    self.builder().emit(Opcode::Pop);
                }
            }
        }
    }

    fn compile_exprs(&mut self, exprs: &[ExprLoc]) {
        for expr in exprs {
            self.compile_expr(expr);
        }
    }

    fn check_yield_allowed(&mut self, position: CodeRange) -> bool {
        match self.unit().kind {
            ScopeKind::Function => {
                self.unit().is_generator = true;
                true
            }
            ScopeKind::Comprehension => {
                self.err(position, "'yield' inside comprehension");
                false
            }
            ScopeKind::Module | ScopeKind::Class => {
                self.err(position, "'yield' outside function");
                false
            }
        }
    }

    /// Chained comparisons evaluate each operand once, keeping the shared
    /// operand on the stack with dup-and-rotate and short-circuiting on the
    /// first false result.
    fn compile_compare(&mut self, left: &ExprLoc, ops: &[CmpOperator], comparators: &[ExprLoc]) {
        self.compile_expr(left);
        if ops.len() == 1 {
            self.compile_expr(&comparators[0]);
            self.builder().emit(compare_op(ops[0]));
            return;
        }
        let base = self.builder().stack_depth();
        let mut cleanup_jumps = Vec::new();
        for (i, (op, comparator)) in ops.iter().zip(comparators).enumerate() {
            let last = i + 1 == ops.len();
            self.compile_expr(comparator);
            if last {
                self.builder().emit(compare_op(*op));
            } else {
                self.builder().emit(Opcode::Dup);
                self.builder().emit(Opcode::Rot3);
                self.builder().emit(compare_op(*op));
                cleanup_jumps.push(self.builder().emit_jump(Opcode::JumpIfFalseOrPop));
            }
        }
        let to_end = self.builder().emit_jump(Opcode::Jump);
        // Short-circuit: the shared operand sits under the false result.
        for label in cleanup_jumps {
            self.builder().patch_jump(label);
        }
        self.builder().set_stack_depth(base + 1);
        self.builder().emit(Opcode::Rot2);
        self.builder().emit(Opcode::Pop);
        self.builder().patch_jump(to_end);
    }

    fn compile_call(&mut self, func: &ExprLoc, args: &[ExprLoc], keywords: &[Keyword]) {
        let has_star = has_starred(args);
        let has_kw_unpack = keywords.iter().any(|kw| kw.name.is_none());
        if has_star || has_kw_unpack {
            self.compile_call_ex(func, args, keywords);
            return;
        }
        if keywords.is_empty() {
            // Method calls avoid building a bound method object.
            if let Expr::Attribute { object, attr } = &func.expr {
                self.compile_expr(object);
                let index = self.builder().add_name(attr);
                self.builder().emit_arg(Opcode::LoadMethod, i32::from(index));
                self.compile_exprs(args);
                let count = i32::try_from(args.len()).unwrap_or(i32::MAX);
                self.builder().emit_arg(Opcode::CallMethod, count);
                return;
            }
            self.compile_expr(func);
            self.compile_exprs(args);
            let count = i32::try_from(args.len()).unwrap_or(i32::MAX);
            self.builder().emit_arg(Opcode::Call, count);
            return;
        }
        self.compile_expr(func);
        self.compile_exprs(args);
        let mut names = Vec::new();
        for kw in keywords {
            if let Some(name) = &kw.name {
                names.push(name.clone());
            }
            self.compile_expr(&kw.value);
        }
        let total = i32::try_from(args.len() + keywords.len()).unwrap_or(i32::MAX);
        self.load_const(Value::StrArray(names));
        self.builder().emit_arg(Opcode::CallKw, total);
    }

    /// Calls with iterable or mapping unpacking collect the positional
    /// arguments into one tuple and the keywords into one dict, then use
    /// `CallEx`.
    fn compile_call_ex(&mut self, func: &ExprLoc, args: &[ExprLoc], keywords: &[Keyword]) {
        self.compile_expr(func);
        self.compile_star_items_as_tuple(args);
        if keywords.is_empty() {
            self.builder().emit_arg(Opcode::CallEx, 0);
            return;
        }
        self.builder().emit_arg(Opcode::BuildMap, 0);
        for kw in keywords {
            match &kw.name {
                Some(name) => {
                    self.load_const(Value::Str(name.clone()));
                    self.compile_expr(&kw.value);
                    self.builder().emit_arg(Opcode::MapAdd, 0);
                }
                None => {
                    let update = self.builder().add_name("update");
                    self.builder().emit_arg(Opcode::LoadMethod, i32::from(update));
                    self.compile_expr(&kw.value);
                    self.builder().emit_arg(Opcode::CallMethod, 1);
                    self.builder().emit(Opcode::Pop);
                }
            }
        }
        self.builder().emit_arg(Opcode::CallEx, 1);
    }

    /// Builds a tuple from items that may contain `*seq` entries: plain
    /// runs become `BuildTuple` chunks, starred entries go through the
    /// `tuple` builtin, and the pieces concatenate with `BinaryAdd`.
    fn compile_star_items_as_tuple(&mut self, items: &[ExprLoc]) {
        let mut have_tuple = false;
        let mut chunk: i32 = 0;
        for item in items {
            if let Expr::Starred(inner) = &item.expr {
                if chunk > 0 {
                    self.builder().emit_arg(Opcode::BuildTuple, chunk);
                    if have_tuple {
                        self.builder().emit(Opcode::BinaryAdd);
                    }
                    have_tuple = true;
                    chunk = 0;
                }
                self.emit_load_global_name("tuple");
                self.compile_expr(inner);
                self.builder().emit_arg(Opcode::Call, 1);
                if have_tuple {
                    self.builder().emit(Opcode::BinaryAdd);
                }
                have_tuple = true;
            } else {
                self.compile_expr(item);
                chunk += 1;
            }
        }
        if chunk > 0 || !have_tuple {
            self.builder().emit_arg(Opcode::BuildTuple, chunk);
            if have_tuple {
                self.builder().emit(Opcode::BinaryAdd);
            }
        }
    }

    fn compile_dict(&mut self, keys: &[Option<ExprLoc>], values: &[ExprLoc]) {
        let has_unpack = keys.iter().any(Option::is_none);
        if !has_unpack {
            for (key, value) in keys.iter().zip(values) {
                if let Some(key) = key {
                    self.compile_expr(key);
                }
                self.compile_expr(value);
            }
            let count = i32::try_from(keys.len()).unwrap_or(i32::MAX);
            self.builder().emit_arg(Opcode::BuildMap, count);
            return;
        }
        // Mixed literal entries and `**mapping` unpacks preserve source
        // order so later entries overwrite earlier ones.
        self.builder().emit_arg(Opcode::BuildMap, 0);
        for (key, value) in keys.iter().zip(values) {
            match key {
                Some(key) => {
                    self.compile_expr(key);
                    self.compile_expr(value);
                    self.builder().emit_arg(Opcode::MapAdd, 0);
                }
                None => {
                    let update = self.builder().add_name("update");
                    self.builder().emit_arg(Opcode::LoadMethod, i32::from(update));
                    self.compile_expr(value);
                    self.builder().emit_arg(Opcode::CallMethod, 1);
                    self.builder().emit(Opcode::Pop);
                }
            }
        }
    }

    fn compile_fstring(&mut self, parts: &[FStringPart]) {
        if parts.is_empty() {
            self.load_const(Value::Str(String::new()));
            return;
        }
        for (i, part) in parts.iter().enumerate() {
            match part {
                FStringPart::Literal(text) => self.load_const(Value::Str(text.clone())),
                FStringPart::Expr {
                    expr,
                    conversion,
                    format_spec,
                } => {
                    // `format(value, spec)` already yields a string, so the
                    // `str` call applies only when there is no spec.
                    if format_spec.is_some() {
                        self.emit_load_global_name("format");
                    }
                    match conversion {
                        Some(Conversion::Repr) => self.emit_load_global_name("repr"),
                        Some(Conversion::Ascii) => self.emit_load_global_name("ascii"),
                        Some(Conversion::Str) => self.emit_load_global_name("str"),
                        None if format_spec.is_none() => self.emit_load_global_name("str"),
                        None => {}
                    }
                    self.compile_expr(expr);
                    if conversion.is_some() || format_spec.is_none() {
                        self.builder().emit_arg(Opcode::Call, 1);
                    }
                    if let Some(spec) = format_spec {
                        self.load_const(Value::Str(spec.clone()));
                        self.builder().emit_arg(Opcode::Call, 2);
                    }
                }
            }
            if i > 0 {
                self.builder().emit(Opcode::BinaryAdd);
            }
        }
    }

    // === Comprehensions ===

    fn compile_comprehension(
        &mut self,
        kind: CompKind,
        elt: &ExprLoc,
        value: Option<&ExprLoc>,
        generators: &[Comprehension],
        position: CodeRange,
    ) {
        if generators.is_empty() {
            self.err(position, "comprehension has no 'for' clause");
            self.builder().emit(Opcode::LoadNone);
            return;
        }
        let name = kind.scope_name();
        let qualname = self.qualname(name);
        self.scopes
            .push(ScopeKind::Comprehension, ScopeInfo::for_comprehension(generators));
        self.units.push(CompileUnit::new(
            CodeBuilder::new(&self.filename),
            name.to_owned(),
            position.start().line,
            ScopeKind::Comprehension,
            false,
        ));
        self.qual_stack.push(name.to_owned());
        let iter_slot = self.scopes.define_param(".0");
        self.builder().note_varname(iter_slot, ".0");
        self.unit().arg_count = 1;
        self.builder().set_location(position);

        match kind {
            CompKind::List => self.builder().emit_arg(Opcode::BuildList, 0),
            CompKind::Set => self.builder().emit_arg(Opcode::BuildSet, 0),
            CompKind::Dict => self.builder().emit_arg(Opcode::BuildMap, 0),
            CompKind::Generator => {
                self.unit().is_generator = true;
            }
        }
        self.compile_generator_level(kind, elt, value, generators, 0);
        match kind {
            CompKind::Generator => {
                self.builder().emit(Opcode::LoadNone);
                self.builder().emit(Opcode::Return);
            }
            _ => self.builder().emit(Opcode::Return),
        }

        self.qual_stack.pop();
        let code = self.finish_unit();
        let code_index = self.builder().add_const(Value::Code(Box::new(code)));
        self.builder().emit_arg(Opcode::LoadConst, i32::from(code_index));
        self.load_const(Value::Str(qualname));
        self.builder().emit_arg(Opcode::MakeFunction, 0);
        // The outermost iterable evaluates in the enclosing scope; nested
        // iterables evaluate inside the comprehension's own code.
        self.compile_expr(&generators[0].iter);
        self.builder().emit(Opcode::GetIter);
        self.builder().emit_arg(Opcode::Call, 1);
    }

    fn compile_generator_level(
        &mut self,
        kind: CompKind,
        elt: &ExprLoc,
        value: Option<&ExprLoc>,
        generators: &[Comprehension],
        level: usize,
    ) {
        let generator = &generators[level];
        if level == 0 {
            self.emit_load_name(".0");
        } else {
            self.compile_expr(&generator.iter);
            self.builder().emit(Opcode::GetIter);
        }
        let start = self.builder().current_offset();
        let to_done = self.builder().emit_jump(Opcode::ForIter);
        self.compile_store_target(&generator.target);
        for cond in &generator.ifs {
            self.compile_expr(cond);
            let fail = self.builder().emit_jump(Opcode::PopJumpIfFalse);
            self.builder().patch_jump_to(fail, start);
        }
        if level + 1 < generators.len() {
            self.compile_generator_level(kind, elt, value, generators, level + 1);
        } else {
            let depth = i32::try_from(generators.len()).unwrap_or(i32::MAX);
            match kind {
                CompKind::List => {
                    self.compile_expr(elt);
                    self.builder().emit_arg(Opcode::ListAppend, depth);
                }
                CompKind::Set => {
                    self.compile_expr(elt);
                    self.builder().emit_arg(Opcode::SetAdd, depth);
                }
                CompKind::Dict => {
                    self.compile_expr(elt);
                    self.compile_expr(value.expect("dict comprehension has a value"));
                    self.builder().emit_arg(Opcode::MapAdd, depth);
                }
                CompKind::Generator => {
                    self.compile_expr(elt);
                    self.builder().emit(Opcode::YieldValue);
                    self.builder().emit(Opcode::Pop);
                }
            }
        }
        self.builder().emit_jump_to(Opcode::Jump, start);
        self.builder().patch_jump(to_done);
        // The exhausted ForIter popped this level's iterator.
        self.builder().adjust_stack_depth(-1);
    }

    // === Pattern matching ===

    fn compile_match(&mut self, subject: &ExprLoc, cases: &[MatchCase]) {
        self.compile_expr(subject);
        let mut end_jumps = Vec::new();
        for case in cases {
            let base = self.builder().stack_depth();
            self.builder().set_location(case.pattern.position);
            self.builder().emit(Opcode::Dup);
            self.compile_pattern(&case.pattern);
            let fail = self.builder().emit_jump(Opcode::PopJumpIfFalse);
            self.builder().emit(Opcode::Pop);
            if let Some(guard) = &case.guard {
                self.compile_expr(guard);
                let guard_fail = self.builder().emit_jump(Opcode::PopJumpIfFalse);
                self.builder().emit(Opcode::Pop);
                self.compile_stmts(&case.body);
                end_jumps.push(self.builder().emit_jump(Opcode::Jump));
                // Guard failure keeps the subject for the next case.
                self.builder().patch_jump(guard_fail);
                self.builder().set_stack_depth(base);
                let skip = self.builder().emit_jump(Opcode::Jump);
                self.builder().patch_jump(fail);
                self.builder().set_stack_depth(base + 1);
                self.builder().emit(Opcode::Pop);
                self.builder().patch_jump(skip);
            } else {
                self.builder().emit(Opcode::Pop);
                self.compile_stmts(&case.body);
                end_jumps.push(self.builder().emit_jump(Opcode::Jump));
                self.builder().patch_jump(fail);
                self.builder().set_stack_depth(base + 1);
                self.builder().emit(Opcode::Pop);
            }
        }
        // No case matched: drop the subject.
        self.builder().emit(Opcode::Pop);
        for label in end_jumps {
            self.builder().patch_jump(label);
        }
    }

    /// Compiles one pattern with the contract: subject on top of the stack
    /// on entry, subject then a boolean on top on exit.
    fn compile_pattern(&mut self, pattern: &PatternLoc) {
        let base = self.builder().stack_depth();
        match &pattern.pattern {
            Pattern::Capture { name } => {
                if let Some(name) = name {
                    self.builder().emit(Opcode::Dup);
                    self.emit_store_name(name);
                }
                self.load_const(Value::Bool(true));
            }
            Pattern::Value(expr) => {
                self.builder().emit(Opcode::Dup);
                self.compile_expr(expr);
                self.builder().emit(Opcode::CompareEq);
            }
            Pattern::Singleton(singleton) => {
                self.builder().emit(Opcode::Dup);
                match singleton {
                    Singleton::None => self.load_const(Value::None),
                    Singleton::True => self.load_const(Value::Bool(true)),
                    Singleton::False => self.load_const(Value::Bool(false)),
                }
                self.builder().emit(Opcode::Is);
            }
            Pattern::Or(alternatives) => {
                let mut success_jumps = Vec::new();
                for (i, alternative) in alternatives.iter().enumerate() {
                    self.compile_pattern(alternative);
                    if i + 1 < alternatives.len() {
                        success_jumps.push(self.builder().emit_jump(Opcode::JumpIfTrueOrPop));
                    }
                }
                for label in success_jumps {
                    self.builder().patch_jump(label);
                }
                self.builder().set_stack_depth(base + 1);
            }
            Pattern::As { pattern, name } => {
                self.compile_pattern(pattern);
                let fail = self.builder().emit_jump(Opcode::PopJumpIfFalse);
                self.builder().emit(Opcode::Dup);
                self.emit_store_name(name);
                self.load_const(Value::Bool(true));
                let done = self.builder().emit_jump(Opcode::Jump);
                self.builder().patch_jump(fail);
                self.builder().set_stack_depth(base);
                self.load_const(Value::Bool(false));
                self.builder().patch_jump(done);
            }
            Pattern::Star { name } => {
                // Reached via sequence extraction: the "subject" here is the
                // already-built list of middle elements.
                if let Some(name) = name {
                    self.builder().emit(Opcode::Dup);
                    self.emit_store_name(name);
                }
                self.load_const(Value::Bool(true));
            }
            Pattern::Sequence { patterns } => self.compile_sequence_pattern(patterns),
            Pattern::Mapping { keys, patterns, rest } => self.compile_mapping_pattern(keys, patterns, rest.as_deref()),
            Pattern::Class {
                cls,
                patterns,
                kwd_names,
                kwd_patterns,
            } => self.compile_class_pattern(cls, patterns, kwd_names, kwd_patterns),
        }
    }

    /// Emits the element loop shared by sequence, mapping, and class
    /// patterns: each extracted element is tested in turn, failing into a
    /// cleanup ladder that pops the partial extraction before the common
    /// failure epilogue.
    fn compile_element_subpatterns(&mut self, elements: &[(i64, &PatternLoc)]) -> Vec<JumpLabel> {
        let mut element_fails = Vec::new();
        for (index, sub) in elements {
            self.builder().emit(Opcode::Dup);
            self.load_const(Value::Int(*index));
            self.builder().emit(Opcode::BinarySubscr);
            self.compile_pattern(sub);
            element_fails.push(self.builder().emit_jump(Opcode::PopJumpIfFalse));
            self.builder().emit(Opcode::Pop);
        }
        element_fails
    }

    fn compile_sequence_pattern(&mut self, patterns: &[PatternLoc]) {
        let base = self.builder().stack_depth();
        let star_at = patterns.iter().position(|p| matches!(p.pattern, Pattern::Star { .. }));
        match star_at {
            None => {
                let count = i32::try_from(patterns.len()).unwrap_or(i32::MAX);
                self.builder().emit_arg(Opcode::MatchSequence, count);
                let shape_fail = self.builder().emit_jump(Opcode::PopJumpIfFalse);
                let elements: Vec<(i64, &PatternLoc)> = patterns
                    .iter()
                    .enumerate()
                    .map(|(i, p)| (i64::try_from(i).unwrap_or(i64::MAX), p))
                    .collect();
                let element_fails = self.compile_element_subpatterns(&elements);
                self.load_const(Value::Bool(true));
                let done = self.builder().emit_jump(Opcode::Jump);
                // Shared cleanup: an element failure pops the element, then
                // falls into the common failure epilogue.
                for label in element_fails {
                    self.builder().patch_jump(label);
                }
                self.builder().set_stack_depth(base + 1);
                self.builder().emit(Opcode::Pop);
                self.builder().patch_jump(shape_fail);
                self.builder().set_stack_depth(base);
                self.load_const(Value::Bool(false));
                self.builder().patch_jump(done);
            }
            Some(star) => self.compile_star_sequence_pattern(patterns, star),
        }
    }

    fn compile_star_sequence_pattern(&mut self, patterns: &[PatternLoc], star: usize) {
        let base = self.builder().stack_depth();
        let before = star;
        let after = patterns.len() - star - 1;
        let required = i32::try_from(before + after).unwrap_or(i32::MAX);
        self.builder().emit_arg(Opcode::MatchStar, required);
        let shape_fail = self.builder().emit_jump(Opcode::PopJumpIfFalse);

        // Extract: [subj] -> [subj, after..., middle-list, before...], so
        // the sub-patterns run left to right from the top.
        self.builder().emit(Opcode::Dup);
        let packed = i32::try_from((before << 8) | after).unwrap_or(0);
        self.builder().emit_arg(Opcode::ExtractStar, packed);

        let total = before + 1 + after;
        let mut cleanup_jumps = Vec::new();
        for sub in patterns {
            self.compile_pattern(sub);
            cleanup_jumps.push(self.builder().emit_jump(Opcode::PopJumpIfFalse));
            self.builder().emit(Opcode::Pop);
        }
        self.load_const(Value::Bool(true));
        let done = self.builder().emit_jump(Opcode::Jump);

        // Cleanup ladder: failing at element j leaves `total - j` extracted
        // values above the subject, so each rung pops one and falls through
        // to the next; the failure at element j enters at rung j.
        let fail_depth = u16::try_from(usize::from(base) + total).unwrap_or(u16::MAX);
        self.builder().set_stack_depth(fail_depth);
        let mut rungs = Vec::with_capacity(total);
        for _ in 0..total {
            rungs.push(self.builder().current_offset());
            self.builder().emit(Opcode::Pop);
        }
        for (j, label) in cleanup_jumps.into_iter().enumerate() {
            self.builder().patch_jump_to(label, rungs[j]);
        }
        self.builder().patch_jump(shape_fail);
        self.builder().set_stack_depth(base);
        self.load_const(Value::Bool(false));
        self.builder().patch_jump(done);
    }

    fn compile_mapping_pattern(&mut self, keys: &[ExprLoc], patterns: &[PatternLoc], rest: Option<&str>) {
        let base = self.builder().stack_depth();
        self.builder().emit(Opcode::MatchMapping);
        let shape_fail = self.builder().emit_jump(Opcode::PopJumpIfFalse);

        if keys.is_empty() && rest.is_none() {
            self.load_const(Value::Bool(true));
            let done = self.builder().emit_jump(Opcode::Jump);
            self.builder().patch_jump(shape_fail);
            self.builder().set_stack_depth(base);
            self.load_const(Value::Bool(false));
            self.builder().patch_jump(done);
            return;
        }

        self.compile_exprs(keys);
        let key_count = i32::try_from(keys.len()).unwrap_or(i32::MAX);
        self.builder().emit_arg(Opcode::BuildTuple, key_count);
        self.builder().emit_arg(Opcode::MatchKeys, key_count);
        let keys_fail = self.builder().emit_jump(Opcode::PopJumpIfFalse);

        // [subj, values]: test each extracted value.
        let elements: Vec<(i64, &PatternLoc)> = patterns
            .iter()
            .enumerate()
            .map(|(i, p)| (i64::try_from(i).unwrap_or(i64::MAX), p))
            .collect();
        let element_fails = self.compile_element_subpatterns(&elements);

        self.builder().emit(Opcode::Pop);
        if let Some(rest) = rest {
            // `**rest` binds a copy of the mapping minus the matched keys.
            self.builder().emit(Opcode::CopyDict);
            for key in keys {
                self.builder().emit(Opcode::Dup);
                self.compile_expr(key);
                self.builder().emit(Opcode::DeleteSubscr);
            }
            self.emit_store_name(rest);
        }
        self.load_const(Value::Bool(true));
        let done = self.builder().emit_jump(Opcode::Jump);

        for label in element_fails {
            self.builder().patch_jump(label);
        }
        self.builder().set_stack_depth(base + 2);
        self.builder().emit(Opcode::Pop);
        self.builder().patch_jump(keys_fail);
        self.builder().set_stack_depth(base + 1);
        self.builder().emit(Opcode::Pop);
        self.builder().patch_jump(shape_fail);
        self.builder().set_stack_depth(base);
        self.load_const(Value::Bool(false));
        self.builder().patch_jump(done);
    }

    fn compile_class_pattern(
        &mut self,
        cls: &ExprLoc,
        patterns: &[PatternLoc],
        kwd_names: &[String],
        kwd_patterns: &[PatternLoc],
    ) {
        let base = self.builder().stack_depth();
        self.compile_expr(cls);
        self.load_const(Value::StrArray(kwd_names.to_vec()));
        let positional = i32::try_from(patterns.len()).unwrap_or(i32::MAX);
        self.builder().emit_arg(Opcode::MatchClass, positional);
        let shape_fail = self.builder().emit_jump(Opcode::PopJumpIfFalse);

        // [subj, attrs]: positional then keyword attribute values.
        let elements: Vec<(i64, &PatternLoc)> = patterns
            .iter()
            .chain(kwd_patterns)
            .enumerate()
            .map(|(i, p)| (i64::try_from(i).unwrap_or(i64::MAX), p))
            .collect();
        let element_fails = self.compile_element_subpatterns(&elements);

        self.builder().emit(Opcode::Pop);
        self.load_const(Value::Bool(true));
        let done = self.builder().emit_jump(Opcode::Jump);

        for label in element_fails {
            self.builder().patch_jump(label);
        }
        self.builder().set_stack_depth(base + 2);
        self.builder().emit(Opcode::Pop);
        self.builder().patch_jump(shape_fail);
        self.builder().set_stack_depth(base + 1);
        self.builder().emit(Opcode::Pop);
        self.builder().set_stack_depth(base);
        self.load_const(Value::Bool(false));
        self.builder().patch_jump(done);
    }
}

/// Which container a comprehension accumulates into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompKind {
    List,
    Set,
    Dict,
    Generator,
}

impl CompKind {
    fn scope_name(self) -> &'static str {
        match self {
            Self::List => "<listcomp>",
            Self::Set => "<setcomp>",
            Self::Dict => "<dictcomp>",
            Self::Generator => "<genexpr>",
        }
    }
}

fn has_starred(items: &[ExprLoc]) -> bool {
    items.iter().any(|item| matches!(item.expr, Expr::Starred(_)))
}

fn literal_value(literal: &Literal) -> Value {
    match literal {
        Literal::None => Value::None,
        Literal::Ellipsis => Value::Ellipsis,
        Literal::Bool(v) => Value::Bool(*v),
        Literal::Int(v) => Value::Int(*v),
        Literal::BigInt(v) => Value::BigInt(v.clone()),
        Literal::Float(v) => Value::Float(*v),
        Literal::Imaginary(v) => Value::Complex { real: 0.0, imag: *v },
        Literal::Str(v) => Value::Str(v.clone()),
        Literal::Bytes(v) => Value::Bytes(v.clone()),
    }
}

fn binary_op(op: Operator) -> Opcode {
    match op {
        Operator::Add => Opcode::BinaryAdd,
        Operator::Sub => Opcode::BinarySub,
        Operator::Mult => Opcode::BinaryMul,
        Operator::MatMult => Opcode::BinaryMatMul,
        Operator::Div => Opcode::BinaryDiv,
        Operator::Mod => Opcode::BinaryMod,
        Operator::Pow => Opcode::BinaryPow,
        Operator::LShift => Opcode::BinaryLShift,
        Operator::RShift => Opcode::BinaryRShift,
        Operator::BitOr => Opcode::BinaryOr,
        Operator::BitXor => Opcode::BinaryXor,
        Operator::BitAnd => Opcode::BinaryAnd,
        Operator::FloorDiv => Opcode::BinaryFloorDiv,
    }
}

fn inplace_op(op: Operator) -> Opcode {
    match op {
        Operator::Add => Opcode::InPlaceAdd,
        Operator::Sub => Opcode::InPlaceSub,
        Operator::Mult => Opcode::InPlaceMul,
        Operator::MatMult => Opcode::InPlaceMatMul,
        Operator::Div => Opcode::InPlaceDiv,
        Operator::Mod => Opcode::InPlaceMod,
        Operator::Pow => Opcode::InPlacePow,
        Operator::LShift => Opcode::InPlaceLShift,
        Operator::RShift => Opcode::InPlaceRShift,
        Operator::BitOr => Opcode::InPlaceOr,
        Operator::BitXor => Opcode::InPlaceXor,
        Operator::BitAnd => Opcode::InPlaceAnd,
        Operator::FloorDiv => Opcode::InPlaceFloorDiv,
    }
}

fn compare_op(op: CmpOperator) -> Opcode {
    match op {
        CmpOperator::Eq => Opcode::CompareEq,
        CmpOperator::NotEq => Opcode::CompareNotEq,
        CmpOperator::Lt => Opcode::CompareLt,
        CmpOperator::LtE => Opcode::CompareLtE,
        CmpOperator::Gt => Opcode::CompareGt,
        CmpOperator::GtE => Opcode::CompareGtE,
        CmpOperator::Is => Opcode::Is,
        CmpOperator::IsNot => Opcode::IsNot,
        CmpOperator::In => Opcode::In,
        CmpOperator::NotIn => Opcode::NotIn,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_module_text;

    fn compile(source: &str) -> (CodeObject, Vec<CompileError>) {
        let (module, parse_errors) = parse_module_text(source, "test.py");
        assert_eq!(parse_errors, vec![], "unexpected parse errors for {source:?}");
        compile_module(&module, "test.py")
    }

    fn compile_ok(source: &str) -> CodeObject {
        let (code, errors) = compile(source);
        assert_eq!(errors, vec![], "unexpected compile errors for {source:?}");
        code
    }

    fn ops(code: &CodeObject) -> Vec<Opcode> {
        code.instructions().map(|(_, op, _)| op).collect()
    }

    #[test]
    fn module_assignment_uses_store_name() {
        let code = compile_ok("x = 1\n");
        assert!(code.constants.contains(&Value::Int(1)));
        let ops = ops(&code);
        assert!(ops.contains(&Opcode::StoreName));
        assert_eq!(code.names, vec!["x".to_owned()]);
        // Module returns None.
        assert_eq!(ops.last(), Some(&Opcode::Return));
    }

    #[test]
    fn function_locals_use_fast_access() {
        let code = compile_ok("def f(a):\n    b = a + 1\n    return b\n");
        let Value::Code(inner) = &code.constants[0] else {
            panic!("expected nested code object");
        };
        assert_eq!(inner.arg_count, 1);
        assert_eq!(inner.varnames, vec!["a".to_owned(), "b".to_owned()]);
        let inner_ops = ops(inner);
        assert!(inner_ops.contains(&Opcode::LoadFast));
        assert!(inner_ops.contains(&Opcode::StoreFast));
        assert!(!inner_ops.contains(&Opcode::LoadName));
    }

    #[test]
    fn defaults_set_make_function_flag() {
        let code = compile_ok("def f(a, b=2):\n    return a + b\n");
        let make = code
            .instructions()
            .find(|(_, op, _)| *op == Opcode::MakeFunction)
            .expect("MakeFunction emitted");
        assert_eq!(make.2.map(|arg| arg & 1), Some(1));
        let inner = code
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Code(inner) => Some(inner),
                _ => None,
            })
            .expect("nested code object");
        assert_eq!(inner.arg_count, 2);
        assert!(inner.freevars.is_empty());
    }

    #[test]
    fn closure_cells_and_frees_line_up() {
        let code = compile_ok("def outer():\n    x = 1\n    def inner():\n        return x\n    return inner\n");
        let Value::Code(outer) = &code.constants[0] else { panic!() };
        assert_eq!(outer.cellvars, vec!["x".to_owned()]);
        let inner = outer
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Code(inner) => Some(inner),
                _ => None,
            })
            .expect("inner code object");
        assert_eq!(inner.freevars, vec!["x".to_owned()]);
        let deref = inner
            .instructions()
            .find(|(_, op, _)| *op == Opcode::LoadDeref)
            .expect("inner loads through the closure");
        assert_eq!(deref.2, Some(0));
    }

    #[test]
    fn for_loop_continue_targets_for_iter() {
        let code = compile_ok("for i in range(3):\n    if i == 1:\n        continue\n    print(i)\n");
        let for_iter = code
            .instructions()
            .find(|(_, op, _)| *op == Opcode::ForIter)
            .expect("ForIter emitted");
        let jumps: Vec<_> = code
            .instructions()
            .filter(|(_, op, arg)| *op == Opcode::Jump && arg.map(usize::from) == Some(for_iter.0))
            .collect();
        assert!(jumps.len() >= 2, "continue and the loop tail both jump to the ForIter");
        // The ForIter target is past the loop.
        let target = usize::from(for_iter.2.unwrap());
        assert!(target > for_iter.0);
    }

    #[test]
    fn listcomp_shape() {
        let code = compile_ok("[x*x for x in range(5) if x % 2 == 0]\n");
        let comp = code
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Code(inner) => Some(inner),
                _ => None,
            })
            .expect("comprehension code object");
        assert_eq!(comp.name, "<listcomp>");
        let comp_ops = ops(comp);
        assert_eq!(comp_ops.first(), Some(&Opcode::BuildList));
        assert!(comp_ops.contains(&Opcode::ForIter));
        let append = comp
            .instructions()
            .find(|(_, op, _)| *op == Opcode::ListAppend)
            .expect("ListAppend emitted");
        assert_eq!(append.2, Some(1));
        assert_eq!(comp.varnames[0], ".0");
    }

    #[test]
    fn match_sequence_pattern_emits_match_sequence() {
        let code = compile_ok("def f(p):\n    match p:\n        case (x, y):\n            return x + y\n        case _:\n            return 0\n");
        let Value::Code(inner) = &code.constants[0] else { panic!() };
        let seq = inner
            .instructions()
            .find(|(_, op, _)| *op == Opcode::MatchSequence)
            .expect("MatchSequence emitted");
        assert_eq!(seq.2, Some(2));
    }

    #[test]
    fn while_break_jumps_past_else() {
        let code = compile_ok("while x:\n    break\nelse:\n    y = 1\n");
        // The break Jump must target an offset past the else body's store.
        let store_y = code
            .instructions()
            .filter(|(_, op, _)| *op == Opcode::StoreName)
            .last()
            .expect("else body stores y");
        let break_jump = code
            .instructions()
            .find(|(_, op, arg)| *op == Opcode::Jump && arg.map(usize::from).is_some_and(|t| t > store_y.0))
            .expect("break jumps past the else block");
        assert!(break_jump.0 < store_y.0);
    }

    #[test]
    fn augmented_subscript_evaluates_subject_once() {
        let code = compile_ok("d[k] += 1\n");
        let ops = ops(&code);
        assert!(ops.contains(&Opcode::Dup2));
        assert!(ops.contains(&Opcode::InPlaceAdd));
        assert!(ops.contains(&Opcode::Rot3));
        assert!(ops.contains(&Opcode::StoreSubscr));
        // The subject loads only once.
        assert_eq!(ops.iter().filter(|op| **op == Opcode::LoadName).count(), 2);
    }

    #[test]
    fn chained_compare_duplicates_middle_operand() {
        let code = compile_ok("r = a < b < c\n");
        let ops = ops(&code);
        assert!(ops.contains(&Opcode::Dup));
        assert!(ops.contains(&Opcode::Rot3));
        assert!(ops.contains(&Opcode::JumpIfFalseOrPop));
        assert_eq!(ops.iter().filter(|op| **op == Opcode::CompareLt).count(), 2);
    }

    #[test]
    fn bool_or_short_circuits() {
        let code = compile_ok("r = a or b or c\n");
        let ops = ops(&code);
        assert_eq!(ops.iter().filter(|op| **op == Opcode::JumpIfTrueOrPop).count(), 2);
    }

    #[test]
    fn generator_function_sets_flag() {
        let code = compile_ok("def g():\n    yield 1\n");
        let Value::Code(inner) = &code.constants[0] else { panic!() };
        assert!(inner.flags.contains(CodeFlags::GENERATOR));
        assert!(!inner.flags.contains(CodeFlags::COROUTINE));
    }

    #[test]
    fn async_function_flags() {
        let code = compile_ok("async def c():\n    await x\nasync def g():\n    yield 1\n");
        let mut codes = code.constants.iter().filter_map(|c| match c {
            Value::Code(inner) => Some(inner),
            _ => None,
        });
        let coroutine = codes.next().unwrap();
        assert!(coroutine.flags.contains(CodeFlags::COROUTINE));
        let agen = codes.next().unwrap();
        assert!(agen.flags.contains(CodeFlags::ASYNC_GENERATOR));
        assert!(!agen.flags.contains(CodeFlags::GENERATOR));
    }

    #[test]
    fn break_outside_loop_is_reported() {
        let (_, errors) = compile("break\n");
        assert!(errors.iter().any(|e| e.message.contains("'break' outside loop")));
    }

    #[test]
    fn nonlocal_without_binding_is_reported() {
        let (_, errors) = compile("def f():\n    nonlocal x\n");
        assert!(errors.iter().any(|e| e.message.contains("no binding for nonlocal")));
    }

    #[test]
    fn yield_outside_function_is_reported() {
        let (_, errors) = compile("yield 1\n");
        assert!(errors.iter().any(|e| e.message.contains("'yield' outside function")));
    }

    #[test]
    fn import_from_builds_fromlist() {
        let code = compile_ok("from os.path import join, split as sp\n");
        assert!(code.constants.iter().any(|c| matches!(
            c,
            Value::StrArray(names) if names == &["join".to_owned(), "split".to_owned()]
        )));
        let ops = ops(&code);
        assert!(ops.contains(&Opcode::ImportName));
        assert_eq!(ops.iter().filter(|op| **op == Opcode::ImportFrom).count(), 2);
    }

    #[test]
    fn class_body_returns_locals() {
        let code = compile_ok("class A:\n    x = 1\n");
        let Value::Code(body) = &code.constants[0] else { panic!() };
        assert_eq!(body.name, "A");
        let body_ops = ops(body);
        assert!(body_ops.contains(&Opcode::LoadLocals));
        assert!(ops(&code).contains(&Opcode::LoadBuildClass));
    }

    #[test]
    fn method_using_super_captures_class_cell() {
        let code = compile_ok("class A:\n    def m(self):\n        return super().m()\n");
        let Value::Code(body) = &code.constants[0] else { panic!() };
        assert_eq!(body.cellvars, vec!["__class__".to_owned()]);
        let method = body
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Code(inner) => Some(inner),
                _ => None,
            })
            .expect("method code object");
        assert_eq!(method.freevars, vec!["__class__".to_owned()]);
    }

    #[test]
    fn validate_passes_on_real_programs() {
        let source = "\
def fib(n):
    a, b = 0, 1
    while a < n:
        yield a
        a, b = b, a + b

total = 0
for value in fib(100):
    if value % 2 == 0:
        total += value
";
        let code = compile_ok(source);
        assert_eq!(code.validate(), vec![]);
        for constant in &code.constants {
            if let Value::Code(inner) = constant {
                assert_eq!(inner.validate(), vec![]);
            }
        }
    }

    #[test]
    fn line_table_is_sorted_and_disjoint() {
        let code = compile_ok("x = 1\ny = 2\nif x:\n    z = x + y\n");
        let mut previous_end = 0;
        for entry in &code.line_table {
            assert!(entry.start >= previous_end, "entries must not overlap");
            assert!(entry.end as usize <= code.bytecode.len());
            previous_end = entry.end;
        }
        assert!(code.line_for_offset(0).is_some());
    }
}
