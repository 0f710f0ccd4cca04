//! The abstract syntax tree produced by the parser.
//!
//! Each category (statement, expression, pattern) is a closed tagged union.
//! Nodes carry their source range through the `*Loc` wrapper structs so the
//! emitter can populate line tables and diagnostics can point at source.

use num_bigint::BigInt;

use crate::location::CodeRange;

/// A parsed module: the ordered statements of one source file.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Module {
    pub body: Vec<StmtLoc>,
}

/// A statement with its source location.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StmtLoc {
    pub position: CodeRange,
    pub stmt: Stmt,
}

impl StmtLoc {
    #[must_use]
    pub fn new(position: CodeRange, stmt: Stmt) -> Self {
        Self { position, stmt }
    }
}

/// An expression with its source location.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExprLoc {
    pub position: CodeRange,
    pub expr: Expr,
}

impl ExprLoc {
    #[must_use]
    pub fn new(position: CodeRange, expr: Expr) -> Self {
        Self { position, expr }
    }
}

/// A match pattern with its source location.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PatternLoc {
    pub position: CodeRange,
    pub pattern: Pattern,
}

impl PatternLoc {
    #[must_use]
    pub fn new(position: CodeRange, pattern: Pattern) -> Self {
        Self { position, pattern }
    }
}

/// A statement in the AST.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Stmt {
    /// An expression evaluated for its side effects; the result is discarded.
    Expr(ExprLoc),
    /// Simple assignment, possibly chained: `a = b = value`.
    ///
    /// Every element of `targets` receives the value of the single
    /// right-hand side, assigned left to right.
    Assign { targets: Vec<ExprLoc>, value: ExprLoc },
    /// Augmented assignment: `target += value` and friends.
    AugAssign {
        target: ExprLoc,
        op: Operator,
        value: ExprLoc,
    },
    /// Annotated assignment: `target: annotation [= value]`.
    ///
    /// The annotation is evaluated only for its side effects at module and
    /// class level; the optional value assigns normally.
    AnnAssign {
        target: ExprLoc,
        annotation: ExprLoc,
        value: Option<ExprLoc>,
    },
    If {
        test: ExprLoc,
        body: Vec<StmtLoc>,
        orelse: Vec<StmtLoc>,
    },
    /// While loop. The else block runs when the loop exits without `break`.
    While {
        test: ExprLoc,
        body: Vec<StmtLoc>,
        orelse: Vec<StmtLoc>,
    },
    /// For loop over an iterable. `is_async` marks `async for` inside
    /// `async def`; the else block runs when the loop exits without `break`.
    For {
        target: ExprLoc,
        iter: ExprLoc,
        body: Vec<StmtLoc>,
        orelse: Vec<StmtLoc>,
        is_async: bool,
    },
    FunctionDef(Box<FunctionDef>),
    ClassDef(Box<ClassDef>),
    Return(Option<ExprLoc>),
    Pass,
    Break,
    Continue,
    /// `import a`, `import a.b as c`, ...
    Import { names: Vec<ImportAlias> },
    /// `from module import a as b, c` or `from module import *`.
    ///
    /// `module` keeps any leading relative-import dots (`.pkg` stays `.pkg`);
    /// a star import has `star` set and empty `names`.
    ImportFrom {
        module: String,
        names: Vec<ImportAlias>,
        star: bool,
    },
    /// `raise`, `raise exc`, or `raise exc from cause`.
    Raise {
        exc: Option<ExprLoc>,
        cause: Option<ExprLoc>,
    },
    Try {
        body: Vec<StmtLoc>,
        handlers: Vec<ExceptHandler>,
        orelse: Vec<StmtLoc>,
        finalbody: Vec<StmtLoc>,
    },
    /// `with a as x, b: ...`. `is_async` marks `async with`.
    With {
        items: Vec<WithItem>,
        body: Vec<StmtLoc>,
        is_async: bool,
    },
    Assert {
        test: ExprLoc,
        msg: Option<ExprLoc>,
    },
    /// `del target, ...`
    Delete { targets: Vec<ExprLoc> },
    Global { names: Vec<String> },
    Nonlocal { names: Vec<String> },
    Match {
        subject: ExprLoc,
        cases: Vec<MatchCase>,
    },
    /// `type Alias[params] = value` (PEP 695).
    TypeAlias {
        name: String,
        type_params: Vec<String>,
        value: ExprLoc,
    },
}

/// A function definition, synchronous or `async def`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub args: Arguments,
    pub body: Vec<StmtLoc>,
    /// Decorator expressions, outermost first (applied bottom-to-top).
    pub decorators: Vec<ExprLoc>,
    pub returns: Option<ExprLoc>,
    pub is_async: bool,
}

/// A class definition.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ClassDef {
    pub name: String,
    pub bases: Vec<ExprLoc>,
    /// Keyword arguments in the class header (e.g. `metaclass=...`).
    pub keywords: Vec<Keyword>,
    pub body: Vec<StmtLoc>,
    pub decorators: Vec<ExprLoc>,
}

/// One `except` clause of a try statement.
///
/// A bare `except:` has no `exc_type`; `except T as e:` binds `name`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExceptHandler {
    pub position: CodeRange,
    pub exc_type: Option<ExprLoc>,
    pub name: Option<String>,
    pub body: Vec<StmtLoc>,
}

/// One item of a with statement: `context_expr [as target]`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WithItem {
    pub context_expr: ExprLoc,
    pub target: Option<ExprLoc>,
}

/// One `name [as alias]` entry of an import statement.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ImportAlias {
    pub position: CodeRange,
    /// Dotted module or attribute name as written.
    pub name: String,
    pub alias: Option<String>,
}

/// One `case pattern [if guard]: body` arm of a match statement.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MatchCase {
    pub pattern: PatternLoc,
    pub guard: Option<ExprLoc>,
    pub body: Vec<StmtLoc>,
}

/// An expression in the AST.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Expr {
    Name(String),
    Literal(Literal),
    /// F-string: a sequence of literal text and interpolated expressions.
    FString(Vec<FStringPart>),
    UnaryOp {
        op: UnaryOperator,
        operand: Box<ExprLoc>,
    },
    BinaryOp {
        left: Box<ExprLoc>,
        op: Operator,
        right: Box<ExprLoc>,
    },
    /// N-ary boolean operation: `a or b or c` is one node, preserving
    /// short-circuit order.
    BoolOp { op: BoolOperator, values: Vec<ExprLoc> },
    /// Comparison chain: `a < b <= c` keeps the left operand plus parallel
    /// operator/comparator lists so each operand is evaluated exactly once.
    Compare {
        left: Box<ExprLoc>,
        ops: Vec<CmpOperator>,
        comparators: Vec<ExprLoc>,
    },
    /// Call expression. Starred arguments appear as [`Expr::Starred`] inside
    /// `args`; `**mapping` appears as a [`Keyword`] without a name.
    Call {
        func: Box<ExprLoc>,
        args: Vec<ExprLoc>,
        keywords: Vec<Keyword>,
    },
    Attribute {
        object: Box<ExprLoc>,
        attr: String,
    },
    Subscript {
        object: Box<ExprLoc>,
        index: Box<ExprLoc>,
    },
    /// Slice expression inside a subscript: `lower:upper:step`, each part optional.
    Slice {
        lower: Option<Box<ExprLoc>>,
        upper: Option<Box<ExprLoc>>,
        step: Option<Box<ExprLoc>>,
    },
    List(Vec<ExprLoc>),
    Tuple(Vec<ExprLoc>),
    Set(Vec<ExprLoc>),
    /// Dict literal as parallel key/value arrays; a missing key marks a
    /// `**mapping` unpack entry, preserving left-to-right overwrite order.
    Dict {
        keys: Vec<Option<ExprLoc>>,
        values: Vec<ExprLoc>,
    },
    Lambda {
        args: Box<Arguments>,
        body: Box<ExprLoc>,
    },
    ListComp {
        elt: Box<ExprLoc>,
        generators: Vec<Comprehension>,
    },
    SetComp {
        elt: Box<ExprLoc>,
        generators: Vec<Comprehension>,
    },
    DictComp {
        key: Box<ExprLoc>,
        value: Box<ExprLoc>,
        generators: Vec<Comprehension>,
    },
    GeneratorExp {
        elt: Box<ExprLoc>,
        generators: Vec<Comprehension>,
    },
    Yield(Option<Box<ExprLoc>>),
    YieldFrom(Box<ExprLoc>),
    Await(Box<ExprLoc>),
    /// `*expr` in call arguments, assignment targets, and display literals.
    Starred(Box<ExprLoc>),
    /// Conditional expression: `body if test else orelse`.
    IfElse {
        test: Box<ExprLoc>,
        body: Box<ExprLoc>,
        orelse: Box<ExprLoc>,
    },
    /// Named expression (walrus): `target := value`. The target is always a name.
    Named {
        target: Box<ExprLoc>,
        value: Box<ExprLoc>,
    },
}

impl Expr {
    /// True for constant expressions that can never have side effects.
    #[must_use]
    pub fn is_literal(&self) -> bool {
        matches!(self, Self::Literal(_))
    }
}

/// A literal constant in source form.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Literal {
    None,
    Ellipsis,
    Bool(bool),
    /// Integer literal that fits `i64`.
    Int(i64),
    /// Integer literal exceeding the `i64` range.
    BigInt(BigInt),
    Float(f64),
    /// Imaginary literal: the imaginary component of a pure-imaginary number.
    Imaginary(f64),
    Str(String),
    Bytes(Vec<u8>),
}

/// One `key=value` (or `**mapping` when `name` is `None`) call argument.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Keyword {
    pub position: CodeRange,
    pub name: Option<String>,
    pub value: ExprLoc,
}

/// One part of an f-string body.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum FStringPart {
    /// Literal text between interpolations, escapes already decoded.
    Literal(String),
    /// An interpolated `{expression[!conversion][:format_spec]}`.
    Expr {
        expr: ExprLoc,
        conversion: Option<Conversion>,
        format_spec: Option<String>,
    },
}

/// The `!s` / `!r` / `!a` conversion of an f-string interpolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Conversion {
    Str,
    Repr,
    Ascii,
}

/// One `for target in iter [if cond]...` clause of a comprehension.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Comprehension {
    pub target: ExprLoc,
    pub iter: ExprLoc,
    pub ifs: Vec<ExprLoc>,
    pub is_async: bool,
}

/// A parameter list: positional-only, positional, `*args`, keyword-only, `**kwargs`.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Arguments {
    /// Parameters before a `/` marker.
    pub posonly: Vec<Param>,
    /// Ordinary positional-or-keyword parameters.
    pub args: Vec<Param>,
    /// The `*args` parameter, if present.
    pub vararg: Option<Param>,
    /// Parameters after `*` or `*args`.
    pub kwonly: Vec<Param>,
    /// The `**kwargs` parameter, if present.
    pub kwarg: Option<Param>,
    /// Defaults for the tail of `posonly + args`, in declaration order.
    pub defaults: Vec<ExprLoc>,
    /// Defaults parallel to `kwonly`; `None` for required keyword-only params.
    pub kw_defaults: Vec<Option<ExprLoc>>,
}

impl Arguments {
    /// Iterates over all parameter names in binding order.
    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.posonly
            .iter()
            .chain(&self.args)
            .chain(self.vararg.as_ref())
            .chain(&self.kwonly)
            .chain(self.kwarg.as_ref())
            .map(|p| p.name.as_str())
    }

    /// Number of positional parameters (positional-only plus ordinary).
    #[must_use]
    pub fn arg_count(&self) -> usize {
        self.posonly.len() + self.args.len()
    }
}

/// A single parameter with optional annotation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Param {
    pub position: CodeRange,
    pub name: String,
    pub annotation: Option<ExprLoc>,
}

/// A structural pattern in a `case` clause.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Pattern {
    /// A literal or dotted-name value, compared to the subject with `==`.
    Value(ExprLoc),
    /// `None`/`True`/`False`, compared to the subject by identity.
    Singleton(Singleton),
    /// A bare name that captures the subject; `None` is the `_` wildcard.
    Capture { name: Option<String> },
    /// `p1 | p2 | ...`: alternatives tried left to right.
    Or(Vec<PatternLoc>),
    /// `pattern as name`; a bare `as`-less capture parses as [`Pattern::Capture`].
    As {
        pattern: Box<PatternLoc>,
        name: String,
    },
    /// `[p0, *rest, pn]` or `(p0, p1)`: at most one star element.
    Sequence { patterns: Vec<PatternLoc> },
    /// `*name` inside a sequence pattern; `None` is `*_`.
    Star { name: Option<String> },
    /// `{key: pattern, ..., **rest}` with literal keys.
    Mapping {
        keys: Vec<ExprLoc>,
        patterns: Vec<PatternLoc>,
        rest: Option<String>,
    },
    /// `Cls(p0, ..., name=p, ...)` with a possibly dotted class reference.
    Class {
        cls: ExprLoc,
        patterns: Vec<PatternLoc>,
        kwd_names: Vec<String>,
        kwd_patterns: Vec<PatternLoc>,
    },
}

/// The three singleton constants usable as identity patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Singleton {
    None,
    True,
    False,
}

/// Binary operators for arithmetic and bitwise operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr, serde::Serialize, serde::Deserialize)]
pub enum Operator {
    // `+`
    Add,
    // `-`
    Sub,
    // `*`
    Mult,
    // `@`
    MatMult,
    // `/`
    Div,
    // `%`
    Mod,
    // `**`
    Pow,
    // `<<`
    LShift,
    // `>>`
    RShift,
    // `|`
    BitOr,
    // `^`
    BitXor,
    // `&`
    BitAnd,
    // `//`
    FloorDiv,
}

/// The two short-circuiting boolean operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BoolOperator {
    And,
    Or,
}

/// Prefix unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum UnaryOperator {
    Not,
    Minus,
    Plus,
    Invert,
}

/// Defined separately since these operators always produce a bool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CmpOperator {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    Is,
    IsNot,
    In,
    NotIn,
}

/// Scans statements for uses of `super` or `__class__`.
///
/// Used when compiling a class body: if any method references either name,
/// the class scope declares a `__class__` cell that methods capture
/// implicitly. The scan descends through nested statements and expressions
/// but stops at nested class definitions, which start their own search.
#[must_use]
pub fn body_references_class_cell(body: &[StmtLoc]) -> bool {
    body.iter().any(stmt_references_class_cell)
}

fn stmt_references_class_cell(stmt: &StmtLoc) -> bool {
    match &stmt.stmt {
        Stmt::Expr(e) | Stmt::Return(Some(e)) => expr_references_class_cell(e),
        Stmt::Assign { targets, value } => {
            targets.iter().any(expr_references_class_cell) || expr_references_class_cell(value)
        }
        Stmt::AugAssign { target, value, .. } => {
            expr_references_class_cell(target) || expr_references_class_cell(value)
        }
        Stmt::AnnAssign {
            target,
            annotation,
            value,
        } => {
            expr_references_class_cell(target)
                || expr_references_class_cell(annotation)
                || value.as_ref().is_some_and(expr_references_class_cell)
        }
        Stmt::If { test, body, orelse } | Stmt::While { test, body, orelse } => {
            expr_references_class_cell(test)
                || body.iter().any(stmt_references_class_cell)
                || orelse.iter().any(stmt_references_class_cell)
        }
        Stmt::For {
            target,
            iter,
            body,
            orelse,
            ..
        } => {
            expr_references_class_cell(target)
                || expr_references_class_cell(iter)
                || body.iter().any(stmt_references_class_cell)
                || orelse.iter().any(stmt_references_class_cell)
        }
        Stmt::FunctionDef(def) => {
            def.decorators.iter().any(expr_references_class_cell) || body_references_class_cell(&def.body)
        }
        // Nested classes resolve `__class__` against their own scope.
        Stmt::ClassDef(_) => false,
        Stmt::Raise { exc, cause } => {
            exc.as_ref().is_some_and(expr_references_class_cell) || cause.as_ref().is_some_and(expr_references_class_cell)
        }
        Stmt::Try {
            body,
            handlers,
            orelse,
            finalbody,
        } => {
            body.iter().any(stmt_references_class_cell)
                || handlers.iter().any(|h| {
                    h.exc_type.as_ref().is_some_and(expr_references_class_cell)
                        || h.body.iter().any(stmt_references_class_cell)
                })
                || orelse.iter().any(stmt_references_class_cell)
                || finalbody.iter().any(stmt_references_class_cell)
        }
        Stmt::With { items, body, .. } => {
            items.iter().any(|item| {
                expr_references_class_cell(&item.context_expr)
                    || item.target.as_ref().is_some_and(expr_references_class_cell)
            }) || body.iter().any(stmt_references_class_cell)
        }
        Stmt::Assert { test, msg } => {
            expr_references_class_cell(test) || msg.as_ref().is_some_and(expr_references_class_cell)
        }
        Stmt::Delete { targets } => targets.iter().any(expr_references_class_cell),
        Stmt::Match { subject, cases } => {
            expr_references_class_cell(subject)
                || cases.iter().any(|case| {
                    case.guard.as_ref().is_some_and(expr_references_class_cell)
                        || case.body.iter().any(stmt_references_class_cell)
                })
        }
        Stmt::TypeAlias { value, .. } => expr_references_class_cell(value),
        Stmt::Return(None)
        | Stmt::Pass
        | Stmt::Break
        | Stmt::Continue
        | Stmt::Import { .. }
        | Stmt::ImportFrom { .. }
        | Stmt::Global { .. }
        | Stmt::Nonlocal { .. } => false,
    }
}

fn expr_references_class_cell(expr: &ExprLoc) -> bool {
    match &expr.expr {
        Expr::Name(name) => name == "super" || name == "__class__",
        Expr::Literal(_) => false,
        Expr::FString(parts) => parts.iter().any(|part| match part {
            FStringPart::Literal(_) => false,
            FStringPart::Expr { expr, .. } => expr_references_class_cell(expr),
        }),
        Expr::UnaryOp { operand, .. } => expr_references_class_cell(operand),
        Expr::BinaryOp { left, right, .. } => {
            expr_references_class_cell(left) || expr_references_class_cell(right)
        }
        Expr::BoolOp { values, .. } => values.iter().any(expr_references_class_cell),
        Expr::Compare { left, comparators, .. } => {
            expr_references_class_cell(left) || comparators.iter().any(expr_references_class_cell)
        }
        Expr::Call { func, args, keywords } => {
            expr_references_class_cell(func)
                || args.iter().any(expr_references_class_cell)
                || keywords.iter().any(|k| expr_references_class_cell(&k.value))
        }
        Expr::Attribute { object, .. } => expr_references_class_cell(object),
        Expr::Subscript { object, index } => {
            expr_references_class_cell(object) || expr_references_class_cell(index)
        }
        Expr::Slice { lower, upper, step } => [lower, upper, step]
            .into_iter()
            .flatten()
            .any(|e| expr_references_class_cell(e)),
        Expr::List(items) | Expr::Tuple(items) | Expr::Set(items) => items.iter().any(expr_references_class_cell),
        Expr::Dict { keys, values } => {
            keys.iter().flatten().any(expr_references_class_cell) || values.iter().any(expr_references_class_cell)
        }
        Expr::Lambda { body, .. } => expr_references_class_cell(body),
        Expr::ListComp { elt, generators }
        | Expr::SetComp { elt, generators }
        | Expr::GeneratorExp { elt, generators } => {
            expr_references_class_cell(elt) || generators_reference_class_cell(generators)
        }
        Expr::DictComp { key, value, generators } => {
            expr_references_class_cell(key)
                || expr_references_class_cell(value)
                || generators_reference_class_cell(generators)
        }
        Expr::Yield(value) => value.as_deref().is_some_and(expr_references_class_cell),
        Expr::YieldFrom(value) | Expr::Await(value) | Expr::Starred(value) => expr_references_class_cell(value),
        Expr::IfElse { test, body, orelse } => {
            expr_references_class_cell(test)
                || expr_references_class_cell(body)
                || expr_references_class_cell(orelse)
        }
        Expr::Named { target, value } => {
            expr_references_class_cell(target) || expr_references_class_cell(value)
        }
    }
}

fn generators_reference_class_cell(generators: &[Comprehension]) -> bool {
    generators.iter().any(|generator| {
        expr_references_class_cell(&generator.iter)
            || expr_references_class_cell(&generator.target)
            || generator.ifs.iter().any(expr_references_class_cell)
    })
}
