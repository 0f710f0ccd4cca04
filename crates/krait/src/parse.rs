//! Syntactic analysis: tokens to AST.
//!
//! Expressions parse with precedence-climbing; statements and patterns by
//! recursive descent dispatched on the leading token. The parser never
//! panics: on a mismatch it records an error and continues from the same
//! token, recovering at the next statement boundary.

use num_bigint::BigInt;
use num_traits::ToPrimitive;

use crate::{
    ast::{
        Arguments, BoolOperator, ClassDef, CmpOperator, Comprehension, Conversion, ExceptHandler, Expr, ExprLoc,
        FStringPart, FunctionDef, ImportAlias, Keyword, Literal, MatchCase, Module, Operator, Param, Pattern,
        PatternLoc, Singleton, Stmt, StmtLoc, UnaryOperator, WithItem,
    },
    error::CompileError,
    lexer::{Lexer, bump_loc, decode_text_escapes, tokenize},
    location::{CodeLoc, CodeRange},
    token::{Token, TokenKind},
};

/// Maximum nesting depth for recursive structures during parsing.
/// This prevents stack overflow from deeply nested input like `((((x,),),),)`.
#[cfg(not(debug_assertions))]
const MAX_NESTING_DEPTH: u16 = 200;
/// In debug builds the limit is lower because stack frames are much larger
/// (no inlining, debug info, etc.).
#[cfg(debug_assertions)]
const MAX_NESTING_DEPTH: u16 = 50;

/// Lexes and parses a complete source string.
///
/// Lexer errors come first in the returned list, in source order.
#[must_use]
pub fn parse_module_text(source: &str, filename: &str) -> (Module, Vec<CompileError>) {
    let (tokens, mut errors) = tokenize(source, filename);
    let mut parser = Parser::new(tokens, filename);
    let module = parser.parse_module();
    errors.append(&mut parser.errors);
    (module, errors)
}

/// A recursive-descent parser over a token stream.
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    filename: String,
    errors: Vec<CompileError>,
    /// Remaining nesting budget; hitting zero reports an error instead of
    /// overflowing the stack.
    depth_remaining: u16,
    /// Enclosing class names for private-name mangling. Nested classes push
    /// their own name, so `__x` inside the nested body mangles with the
    /// inner class.
    class_stack: Vec<String>,
}

impl Parser {
    /// Creates a parser over an already-lexed token stream.
    #[must_use]
    pub fn new(tokens: Vec<Token>, filename: &str) -> Self {
        let tokens = if tokens.is_empty() {
            vec![Token::new(TokenKind::EndOfFile, CodeLoc::start(), CodeLoc::start())]
        } else {
            tokens
        };
        Self {
            tokens,
            pos: 0,
            filename: filename.to_owned(),
            errors: Vec::new(),
            depth_remaining: MAX_NESTING_DEPTH,
            class_stack: Vec::new(),
        }
    }

    // === Token access ===

    fn cur(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or_else(|| {
            self.tokens.last().expect("token stream is never empty")
        })
    }

    fn kind(&self) -> TokenKind {
        self.cur().kind
    }

    fn peek_kind(&self, n: usize) -> TokenKind {
        self.tokens
            .get(self.pos + n)
            .map_or(TokenKind::EndOfFile, |token| token.kind)
    }

    fn cur_text(&self) -> String {
        self.cur().text().to_owned()
    }

    fn cur_range(&self) -> CodeRange {
        self.cur().range()
    }

    fn cur_start(&self) -> CodeLoc {
        self.cur().start
    }

    fn prev_end(&self) -> CodeLoc {
        self.tokens
            .get(self.pos.saturating_sub(1))
            .map_or_else(CodeLoc::start, |token| token.end)
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.kind() == kind
    }

    fn at_soft_keyword(&self, word: &str) -> bool {
        self.at(TokenKind::Identifier) && self.cur().text() == word
    }

    fn advance(&mut self) -> Token {
        let token = self.cur().clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.at(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Consumes the expected token or records an error without advancing,
    /// so parsing resumes from the same token.
    fn expect(&mut self, kind: TokenKind) -> bool {
        if self.eat(kind) {
            return true;
        }
        let found = self.kind();
        self.error_here(format!("expected {kind}, got {found}"));
        false
    }

    fn error(&mut self, range: CodeRange, message: impl Into<String>) {
        self.errors.push(CompileError::new(&self.filename, range, message));
    }

    fn error_here(&mut self, message: impl Into<String>) {
        let range = self.cur_range();
        self.error(range, message);
    }

    /// Applies private-name mangling when inside a class body.
    fn mangle(&self, name: &str) -> String {
        if !name.starts_with("__") || name.ends_with("__") {
            return name.to_owned();
        }
        let Some(class_name) = self.class_stack.last() else {
            return name.to_owned();
        };
        let trimmed = class_name.trim_start_matches('_');
        if trimmed.is_empty() {
            return name.to_owned();
        }
        format!("_{trimmed}{name}")
    }

    fn dummy_expr(&self) -> ExprLoc {
        ExprLoc::new(self.cur_range(), Expr::Literal(Literal::None))
    }

    // === Module and statements ===

    /// Parses the token stream into a module.
    pub fn parse_module(&mut self) -> Module {
        let mut body = Vec::new();
        while !self.at(TokenKind::EndOfFile) {
            if self.eat(TokenKind::Newline) {
                continue;
            }
            if self.at(TokenKind::Indent) {
                self.error_here("unexpected indent");
                self.advance();
                continue;
            }
            if self.eat(TokenKind::Dedent) {
                continue;
            }
            let before = self.pos;
            let stmts = self.parse_statement();
            body.extend(stmts);
            if self.pos == before {
                self.error_here(format!("unexpected {}", self.kind()));
                self.advance();
            }
        }
        Module { body }
    }

    fn parse_statement(&mut self) -> Vec<StmtLoc> {
        match self.kind() {
            TokenKind::If => vec![self.parse_if()],
            TokenKind::While => vec![self.parse_while()],
            TokenKind::For => vec![self.parse_for(false)],
            TokenKind::Try => vec![self.parse_try()],
            TokenKind::With => vec![self.parse_with(false)],
            TokenKind::Def => vec![self.parse_def(false, Vec::new())],
            TokenKind::Class => vec![self.parse_class(Vec::new())],
            TokenKind::At => vec![self.parse_decorated()],
            TokenKind::Async => vec![self.parse_async()],
            TokenKind::Identifier if self.at_soft_keyword("match") => {
                if let Some(stmt) = self.try_parse_match() {
                    vec![stmt]
                } else {
                    self.parse_simple_line()
                }
            }
            TokenKind::Identifier
                if self.at_soft_keyword("type")
                    && self.peek_kind(1) == TokenKind::Identifier
                    && matches!(self.peek_kind(2), TokenKind::Assign | TokenKind::LeftBracket) =>
            {
                vec![self.parse_type_alias()]
            }
            _ => self.parse_simple_line(),
        }
    }

    /// Parses one line of `;`-separated simple statements.
    fn parse_simple_line(&mut self) -> Vec<StmtLoc> {
        let mut stmts = Vec::new();
        loop {
            let before = self.pos;
            stmts.push(self.parse_simple_stmt());
            if self.pos == before {
                break;
            }
            if self.eat(TokenKind::Semicolon) {
                if self.at(TokenKind::Newline) || self.at(TokenKind::EndOfFile) {
                    break;
                }
                continue;
            }
            break;
        }
        self.expect(TokenKind::Newline);
        stmts
    }

    fn parse_simple_stmt(&mut self) -> StmtLoc {
        let start = self.cur_start();
        match self.kind() {
            TokenKind::Pass => {
                self.advance();
                StmtLoc::new(CodeRange::new(start, self.prev_end()), Stmt::Pass)
            }
            TokenKind::Break => {
                self.advance();
                StmtLoc::new(CodeRange::new(start, self.prev_end()), Stmt::Break)
            }
            TokenKind::Continue => {
                self.advance();
                StmtLoc::new(CodeRange::new(start, self.prev_end()), Stmt::Continue)
            }
            TokenKind::Return => {
                self.advance();
                let value = self
                    .expression_follows()
                    .then(|| self.parse_expr_list());
                StmtLoc::new(CodeRange::new(start, self.prev_end()), Stmt::Return(value))
            }
            TokenKind::Raise => {
                self.advance();
                let mut exc = None;
                let mut cause = None;
                if self.expression_follows() {
                    exc = Some(self.parse_expr());
                    if self.eat(TokenKind::From) {
                        cause = Some(self.parse_expr());
                    }
                }
                StmtLoc::new(CodeRange::new(start, self.prev_end()), Stmt::Raise { exc, cause })
            }
            TokenKind::Global => {
                self.advance();
                let names = self.parse_name_list();
                StmtLoc::new(CodeRange::new(start, self.prev_end()), Stmt::Global { names })
            }
            TokenKind::Nonlocal => {
                self.advance();
                let names = self.parse_name_list();
                StmtLoc::new(CodeRange::new(start, self.prev_end()), Stmt::Nonlocal { names })
            }
            TokenKind::Import => self.parse_import(),
            TokenKind::From => self.parse_from_import(),
            TokenKind::Del => {
                self.advance();
                let mut targets = vec![self.parse_expr()];
                while self.eat(TokenKind::Comma) {
                    if !self.expression_follows() {
                        break;
                    }
                    targets.push(self.parse_expr());
                }
                StmtLoc::new(CodeRange::new(start, self.prev_end()), Stmt::Delete { targets })
            }
            TokenKind::Assert => {
                self.advance();
                let test = self.parse_expr();
                let msg = self.eat(TokenKind::Comma).then(|| self.parse_expr());
                StmtLoc::new(CodeRange::new(start, self.prev_end()), Stmt::Assert { test, msg })
            }
            _ => self.parse_expr_or_assignment(),
        }
    }

    fn parse_expr_or_assignment(&mut self) -> StmtLoc {
        let start = self.cur_start();
        let first = self.parse_expr_list();

        if self.at(TokenKind::Assign) {
            let mut parts = vec![first];
            while self.eat(TokenKind::Assign) {
                parts.push(self.parse_expr_list());
            }
            let value = parts.pop().expect("assignment always has a right-hand side");
            for target in &parts {
                self.validate_assign_target(target, true);
            }
            return StmtLoc::new(
                CodeRange::new(start, self.prev_end()),
                Stmt::Assign { targets: parts, value },
            );
        }

        if self.kind().is_augmented_assign() {
            let op = augmented_operator(self.kind());
            self.advance();
            let value = self.parse_expr_list();
            if !matches!(first.expr, Expr::Name(_) | Expr::Attribute { .. } | Expr::Subscript { .. }) {
                self.error(first.position, "invalid augmented assignment target");
            }
            return StmtLoc::new(
                CodeRange::new(start, self.prev_end()),
                Stmt::AugAssign { target: first, op, value },
            );
        }

        if self.at(TokenKind::Colon) {
            self.advance();
            let annotation = self.parse_expr();
            let value = self.eat(TokenKind::Assign).then(|| self.parse_expr_list());
            if !matches!(first.expr, Expr::Name(_) | Expr::Attribute { .. } | Expr::Subscript { .. }) {
                self.error(first.position, "invalid annotated assignment target");
            }
            return StmtLoc::new(
                CodeRange::new(start, self.prev_end()),
                Stmt::AnnAssign {
                    target: first,
                    annotation,
                    value,
                },
            );
        }

        StmtLoc::new(CodeRange::new(start, self.prev_end()), Stmt::Expr(first))
    }

    fn validate_assign_target(&mut self, target: &ExprLoc, star_allowed_inside: bool) {
        match &target.expr {
            Expr::Name(_) | Expr::Attribute { .. } | Expr::Subscript { .. } => {}
            Expr::Tuple(items) | Expr::List(items) => {
                let mut stars = 0;
                for item in items {
                    if matches!(item.expr, Expr::Starred(_)) {
                        stars += 1;
                    }
                    self.validate_assign_target(item, true);
                }
                if stars > 1 {
                    self.error(target.position, "multiple starred expressions in assignment");
                }
            }
            Expr::Starred(inner) => {
                if star_allowed_inside {
                    self.validate_assign_target(inner, false);
                } else {
                    self.error(target.position, "starred assignment target must be within a list or tuple");
                }
            }
            _ => self.error(target.position, "invalid assignment target"),
        }
    }

    fn parse_name_list(&mut self) -> Vec<String> {
        let mut names = Vec::new();
        loop {
            if self.at(TokenKind::Identifier) {
                let name = self.cur_text();
                self.advance();
                names.push(name);
            } else {
                self.expect(TokenKind::Identifier);
                break;
            }
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        names
    }

    fn parse_import(&mut self) -> StmtLoc {
        let start = self.cur_start();
        self.advance();
        let mut names = Vec::new();
        loop {
            let alias_start = self.cur_start();
            let name = self.parse_dotted_name();
            let alias = self.eat(TokenKind::As).then(|| {
                let alias = self.cur_text();
                self.expect(TokenKind::Identifier);
                alias
            });
            names.push(ImportAlias {
                position: CodeRange::new(alias_start, self.prev_end()),
                name,
                alias,
            });
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        StmtLoc::new(CodeRange::new(start, self.prev_end()), Stmt::Import { names })
    }

    fn parse_from_import(&mut self) -> StmtLoc {
        let start = self.cur_start();
        self.advance();
        let mut module = String::new();
        loop {
            if self.eat(TokenKind::Dot) {
                module.push('.');
            } else if self.eat(TokenKind::Ellipsis) {
                module.push_str("...");
            } else {
                break;
            }
        }
        if self.at(TokenKind::Identifier) {
            module.push_str(&self.parse_dotted_name());
        } else if module.is_empty() {
            self.expect(TokenKind::Identifier);
        }
        self.expect(TokenKind::Import);

        if self.eat(TokenKind::Star) {
            return StmtLoc::new(
                CodeRange::new(start, self.prev_end()),
                Stmt::ImportFrom {
                    module,
                    names: Vec::new(),
                    star: true,
                },
            );
        }

        let parenthesized = self.eat(TokenKind::LeftParen);
        let mut names = Vec::new();
        loop {
            let alias_start = self.cur_start();
            if !self.at(TokenKind::Identifier) {
                self.expect(TokenKind::Identifier);
                break;
            }
            let name = self.cur_text();
            self.advance();
            let alias = self.eat(TokenKind::As).then(|| {
                let alias = self.cur_text();
                self.expect(TokenKind::Identifier);
                alias
            });
            names.push(ImportAlias {
                position: CodeRange::new(alias_start, self.prev_end()),
                name,
                alias,
            });
            if !self.eat(TokenKind::Comma) {
                break;
            }
            if parenthesized && self.at(TokenKind::RightParen) {
                break;
            }
        }
        if parenthesized {
            self.expect(TokenKind::RightParen);
        }
        StmtLoc::new(
            CodeRange::new(start, self.prev_end()),
            Stmt::ImportFrom {
                module,
                names,
                star: false,
            },
        )
    }

    fn parse_dotted_name(&mut self) -> String {
        let mut name = self.cur_text();
        if !self.expect(TokenKind::Identifier) {
            return name;
        }
        while self.at(TokenKind::Dot) && self.peek_kind(1) == TokenKind::Identifier {
            self.advance();
            name.push('.');
            name.push_str(&self.cur_text());
            self.advance();
        }
        name
    }

    // === Compound statements ===

    fn parse_if(&mut self) -> StmtLoc {
        let start = self.cur_start();
        self.advance();
        let test = self.parse_expr();
        let body = self.parse_block();
        let orelse = if self.at(TokenKind::Elif) {
            vec![self.parse_if_from_elif()]
        } else if self.eat(TokenKind::Else) {
            self.parse_block()
        } else {
            Vec::new()
        };
        StmtLoc::new(CodeRange::new(start, self.prev_end()), Stmt::If { test, body, orelse })
    }

    /// `elif` parses as a nested `if` in the else branch.
    fn parse_if_from_elif(&mut self) -> StmtLoc {
        let start = self.cur_start();
        self.advance();
        let test = self.parse_expr();
        let body = self.parse_block();
        let orelse = if self.at(TokenKind::Elif) {
            vec![self.parse_if_from_elif()]
        } else if self.eat(TokenKind::Else) {
            self.parse_block()
        } else {
            Vec::new()
        };
        StmtLoc::new(CodeRange::new(start, self.prev_end()), Stmt::If { test, body, orelse })
    }

    fn parse_while(&mut self) -> StmtLoc {
        let start = self.cur_start();
        self.advance();
        let test = self.parse_expr();
        let body = self.parse_block();
        let orelse = if self.eat(TokenKind::Else) { self.parse_block() } else { Vec::new() };
        StmtLoc::new(
            CodeRange::new(start, self.prev_end()),
            Stmt::While { test, body, orelse },
        )
    }

    fn parse_for(&mut self, is_async: bool) -> StmtLoc {
        let start = self.cur_start();
        self.advance();
        let target = self.parse_target_list();
        self.validate_assign_target(&target, true);
        self.expect(TokenKind::In);
        let iter = self.parse_expr_list();
        let body = self.parse_block();
        let orelse = if self.eat(TokenKind::Else) { self.parse_block() } else { Vec::new() };
        StmtLoc::new(
            CodeRange::new(start, self.prev_end()),
            Stmt::For {
                target,
                iter,
                body,
                orelse,
                is_async,
            },
        )
    }

    fn parse_with(&mut self, is_async: bool) -> StmtLoc {
        let start = self.cur_start();
        self.advance();
        let mut items = Vec::new();
        loop {
            let context_expr = self.parse_expr();
            let target = self.eat(TokenKind::As).then(|| {
                let target = self.parse_target_atom();
                self.validate_assign_target(&target, true);
                target
            });
            items.push(WithItem { context_expr, target });
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        let body = self.parse_block();
        StmtLoc::new(
            CodeRange::new(start, self.prev_end()),
            Stmt::With { items, body, is_async },
        )
    }

    fn parse_try(&mut self) -> StmtLoc {
        let start = self.cur_start();
        self.advance();
        let body = self.parse_block();
        let mut handlers = Vec::new();
        while self.at(TokenKind::Except) {
            let handler_start = self.cur_start();
            self.advance();
            let exc_type = self.expression_follows().then(|| self.parse_expr());
            let name = self.eat(TokenKind::As).then(|| {
                let name = self.cur_text();
                self.expect(TokenKind::Identifier);
                name
            });
            let handler_body = self.parse_block();
            if exc_type.is_none()
                && (self.at(TokenKind::Except) || handlers.iter().any(|h: &ExceptHandler| h.exc_type.is_none()))
            {
                self.error(
                    CodeRange::new(handler_start, self.prev_end()),
                    "default 'except:' must be last",
                );
            }
            handlers.push(ExceptHandler {
                position: CodeRange::new(handler_start, self.prev_end()),
                exc_type,
                name,
                body: handler_body,
            });
        }
        let orelse = if self.eat(TokenKind::Else) { self.parse_block() } else { Vec::new() };
        let finalbody = if self.eat(TokenKind::Finally) { self.parse_block() } else { Vec::new() };
        if handlers.is_empty() && finalbody.is_empty() {
            self.error(
                CodeRange::new(start, self.prev_end()),
                "expected 'except' or 'finally' block",
            );
        }
        StmtLoc::new(
            CodeRange::new(start, self.prev_end()),
            Stmt::Try {
                body,
                handlers,
                orelse,
                finalbody,
            },
        )
    }

    fn parse_async(&mut self) -> StmtLoc {
        let start = self.cur_start();
        self.advance();
        match self.kind() {
            TokenKind::Def => self.parse_def(true, Vec::new()),
            TokenKind::For => self.parse_for(true),
            TokenKind::With => self.parse_with(true),
            _ => {
                self.error_here("expected 'def', 'for', or 'with' after 'async'");
                StmtLoc::new(CodeRange::new(start, self.prev_end()), Stmt::Pass)
            }
        }
    }

    fn parse_decorated(&mut self) -> StmtLoc {
        let mut decorators = Vec::new();
        while self.at(TokenKind::At) {
            self.advance();
            decorators.push(self.parse_expr());
            self.expect(TokenKind::Newline);
        }
        match self.kind() {
            TokenKind::Def => self.parse_def(false, decorators),
            TokenKind::Class => self.parse_class(decorators),
            TokenKind::Async => {
                let start = self.cur_start();
                self.advance();
                if self.at(TokenKind::Def) {
                    self.parse_def(true, decorators)
                } else {
                    self.error_here("expected 'def' after 'async' in decorated statement");
                    StmtLoc::new(CodeRange::new(start, self.prev_end()), Stmt::Pass)
                }
            }
            _ => {
                self.error_here("expected 'def' or 'class' after decorators");
                StmtLoc::new(self.cur_range(), Stmt::Pass)
            }
        }
    }

    fn parse_def(&mut self, is_async: bool, decorators: Vec<ExprLoc>) -> StmtLoc {
        let start = self.cur_start();
        self.advance();
        let name = self.mangle(&self.cur_text());
        self.expect(TokenKind::Identifier);
        self.expect(TokenKind::LeftParen);
        let args = self.parse_parameters(TokenKind::RightParen);
        self.expect(TokenKind::RightParen);
        let returns = self.eat(TokenKind::Arrow).then(|| self.parse_expr());
        let body = self.parse_block();
        StmtLoc::new(
            CodeRange::new(start, self.prev_end()),
            Stmt::FunctionDef(Box::new(FunctionDef {
                name,
                args,
                body,
                decorators,
                returns,
                is_async,
            })),
        )
    }

    fn parse_class(&mut self, decorators: Vec<ExprLoc>) -> StmtLoc {
        let start = self.cur_start();
        self.advance();
        let name = self.mangle(&self.cur_text());
        self.expect(TokenKind::Identifier);
        let mut bases = Vec::new();
        let mut keywords = Vec::new();
        if self.eat(TokenKind::LeftParen) {
            (bases, keywords) = self.parse_call_arguments();
            self.expect(TokenKind::RightParen);
        }
        self.class_stack.push(name.clone());
        let body = self.parse_block();
        self.class_stack.pop();
        StmtLoc::new(
            CodeRange::new(start, self.prev_end()),
            Stmt::ClassDef(Box::new(ClassDef {
                name,
                bases,
                keywords,
                body,
                decorators,
            })),
        )
    }

    fn parse_type_alias(&mut self) -> StmtLoc {
        let start = self.cur_start();
        self.advance(); // `type`
        let name = self.cur_text();
        self.expect(TokenKind::Identifier);
        let mut type_params = Vec::new();
        if self.eat(TokenKind::LeftBracket) {
            while self.at(TokenKind::Identifier) {
                type_params.push(self.cur_text());
                self.advance();
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RightBracket);
        }
        self.expect(TokenKind::Assign);
        let value = self.parse_expr();
        let stmt = StmtLoc::new(
            CodeRange::new(start, self.prev_end()),
            Stmt::TypeAlias {
                name,
                type_params,
                value,
            },
        );
        self.expect(TokenKind::Newline);
        stmt
    }

    /// Parses a parameter list for `def` (terminated by `)`) or `lambda`
    /// (terminated by `:`).
    fn parse_parameters(&mut self, terminator: TokenKind) -> Arguments {
        let annotations_allowed = terminator == TokenKind::RightParen;
        let mut args = Arguments::default();
        let mut seen_star = false;
        let mut seen_kwarg = false;
        while !self.at(terminator) && !self.at(TokenKind::Newline) && !self.at(TokenKind::EndOfFile) {
            let param_start = self.cur_start();
            if self.eat(TokenKind::Slash) {
                if !args.posonly.is_empty() || seen_star {
                    self.error(CodeRange::new(param_start, self.prev_end()), "unexpected '/' in parameter list");
                } else if args.args.is_empty() {
                    self.error(
                        CodeRange::new(param_start, self.prev_end()),
                        "at least one parameter must precede '/'",
                    );
                } else {
                    args.posonly = std::mem::take(&mut args.args);
                }
            } else if self.eat(TokenKind::Star) {
                if seen_star {
                    self.error(CodeRange::new(param_start, self.prev_end()), "only one '*' is allowed in a parameter list");
                }
                seen_star = true;
                if self.at(TokenKind::Identifier) {
                    args.vararg = Some(self.parse_param(annotations_allowed));
                }
            } else if self.eat(TokenKind::DoubleStar) {
                seen_kwarg = true;
                args.kwarg = Some(self.parse_param(annotations_allowed));
            } else if self.at(TokenKind::Identifier) {
                if seen_kwarg {
                    self.error_here("keyword argument after **");
                }
                let param = self.parse_param(annotations_allowed);
                let default = self.eat(TokenKind::Assign).then(|| self.parse_expr());
                if seen_star {
                    args.kwonly.push(param);
                    args.kw_defaults.push(default);
                } else {
                    if default.is_none() && !args.defaults.is_empty() {
                        self.error(param.position, "parameter without a default follows parameter with a default");
                    }
                    args.args.push(param);
                    if let Some(default) = default {
                        args.defaults.push(default);
                    }
                }
            } else {
                self.error_here(format!("expected parameter name, got {}", self.kind()));
                break;
            }
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        args
    }

    fn parse_param(&mut self, annotations_allowed: bool) -> Param {
        let start = self.cur_start();
        let name = self.mangle(&self.cur_text());
        self.expect(TokenKind::Identifier);
        let annotation = (annotations_allowed && self.eat(TokenKind::Colon)).then(|| self.parse_expr());
        Param {
            position: CodeRange::new(start, self.prev_end()),
            name,
            annotation,
        }
    }

    /// Parses a `NEWLINE INDENT stmts DEDENT` block after a `:`.
    fn parse_block(&mut self) -> Vec<StmtLoc> {
        if self.depth_remaining == 0 {
            self.error_here("blocks nested too deeply");
            return Vec::new();
        }
        self.depth_remaining -= 1;
        let body = self.parse_block_inner();
        self.depth_remaining += 1;
        body
    }

    fn parse_block_inner(&mut self) -> Vec<StmtLoc> {
        self.expect(TokenKind::Colon);
        if !self.expect(TokenKind::Newline) {
            // Error recovery: skip to the end of the malformed line.
            while !matches!(self.kind(), TokenKind::Newline | TokenKind::EndOfFile) {
                self.advance();
            }
            self.eat(TokenKind::Newline);
        }
        if !self.expect(TokenKind::Indent) {
            return Vec::new();
        }
        let mut body = Vec::new();
        while !self.at(TokenKind::Dedent) && !self.at(TokenKind::EndOfFile) {
            if self.eat(TokenKind::Newline) {
                continue;
            }
            let before = self.pos;
            body.extend(self.parse_statement());
            if self.pos == before {
                self.error_here(format!("unexpected {}", self.kind()));
                self.advance();
            }
        }
        self.eat(TokenKind::Dedent);
        body
    }

    // === Match statements ===

    /// `match` is a soft keyword: speculatively parse a subject expression
    /// and require a `:`; otherwise rewind and treat `match` as a name.
    fn try_parse_match(&mut self) -> Option<StmtLoc> {
        let start = self.cur_start();
        let checkpoint = self.pos;
        let errors_before = self.errors.len();
        self.advance(); // `match`
        if !self.expression_follows() {
            self.pos = checkpoint;
            return None;
        }
        let subject = self.parse_expr_list();
        if !self.at(TokenKind::Colon) || self.errors.len() > errors_before {
            self.pos = checkpoint;
            self.errors.truncate(errors_before);
            return None;
        }
        self.advance(); // `:`
        self.expect(TokenKind::Newline);
        if !self.expect(TokenKind::Indent) {
            return Some(StmtLoc::new(
                CodeRange::new(start, self.prev_end()),
                Stmt::Match {
                    subject,
                    cases: Vec::new(),
                },
            ));
        }
        let mut cases = Vec::new();
        while self.at_soft_keyword("case") {
            self.advance();
            let pattern = self.parse_open_pattern();
            let guard = self.eat(TokenKind::If).then(|| self.parse_expr());
            let body = self.parse_block();
            cases.push(MatchCase { pattern, guard, body });
        }
        if cases.is_empty() {
            self.error_here("expected at least one 'case' block in 'match' statement");
        }
        while !self.eat(TokenKind::Dedent) && !self.at(TokenKind::EndOfFile) {
            self.advance();
        }
        Some(StmtLoc::new(
            CodeRange::new(start, self.prev_end()),
            Stmt::Match { subject, cases },
        ))
    }

    /// Top-level case pattern: bare commas form a sequence pattern.
    fn parse_open_pattern(&mut self) -> PatternLoc {
        let start = self.cur_start();
        let first = self.parse_or_pattern();
        if !self.at(TokenKind::Comma) {
            return first;
        }
        let mut patterns = vec![first];
        while self.eat(TokenKind::Comma) {
            if self.at(TokenKind::Colon) || self.at(TokenKind::If) {
                break;
            }
            patterns.push(self.parse_or_pattern());
        }
        self.check_single_star(&patterns);
        PatternLoc::new(CodeRange::new(start, self.prev_end()), Pattern::Sequence { patterns })
    }

    fn parse_or_pattern(&mut self) -> PatternLoc {
        let start = self.cur_start();
        let first = self.parse_as_pattern();
        if !self.at(TokenKind::Pipe) {
            return first;
        }
        let mut alternatives = vec![first];
        while self.eat(TokenKind::Pipe) {
            alternatives.push(self.parse_as_pattern());
        }
        PatternLoc::new(CodeRange::new(start, self.prev_end()), Pattern::Or(alternatives))
    }

    fn parse_as_pattern(&mut self) -> PatternLoc {
        let start = self.cur_start();
        let pattern = self.parse_closed_pattern();
        if self.eat(TokenKind::As) {
            let name = self.cur_text();
            if name == "_" {
                self.error_here("cannot use '_' as a target of an as-pattern");
            }
            self.expect(TokenKind::Identifier);
            return PatternLoc::new(
                CodeRange::new(start, self.prev_end()),
                Pattern::As {
                    pattern: Box::new(pattern),
                    name,
                },
            );
        }
        pattern
    }

    fn parse_closed_pattern(&mut self) -> PatternLoc {
        if self.depth_remaining == 0 {
            self.error_here("patterns nested too deeply");
            return PatternLoc::new(self.cur_range(), Pattern::Capture { name: None });
        }
        self.depth_remaining -= 1;
        let pattern = self.parse_closed_pattern_inner();
        self.depth_remaining += 1;
        pattern
    }

    fn parse_closed_pattern_inner(&mut self) -> PatternLoc {
        let start = self.cur_start();
        match self.kind() {
            TokenKind::None => {
                self.advance();
                PatternLoc::new(CodeRange::new(start, self.prev_end()), Pattern::Singleton(Singleton::None))
            }
            TokenKind::True => {
                self.advance();
                PatternLoc::new(CodeRange::new(start, self.prev_end()), Pattern::Singleton(Singleton::True))
            }
            TokenKind::False => {
                self.advance();
                PatternLoc::new(CodeRange::new(start, self.prev_end()), Pattern::Singleton(Singleton::False))
            }
            TokenKind::Minus | TokenKind::Int | TokenKind::Float | TokenKind::Imaginary => {
                let negate = self.eat(TokenKind::Minus);
                let literal = self.parse_number_pattern_literal(negate);
                PatternLoc::new(
                    CodeRange::new(start, self.prev_end()),
                    Pattern::Value(ExprLoc::new(CodeRange::new(start, self.prev_end()), Expr::Literal(literal))),
                )
            }
            TokenKind::Str | TokenKind::Bytes => {
                let token = self.advance();
                let literal = match token.kind {
                    TokenKind::Bytes => Literal::Bytes(token.text().chars().map(|c| c as u8).collect()),
                    _ => Literal::Str(token.text().to_owned()),
                };
                PatternLoc::new(
                    CodeRange::new(start, self.prev_end()),
                    Pattern::Value(ExprLoc::new(CodeRange::new(start, self.prev_end()), Expr::Literal(literal))),
                )
            }
            TokenKind::FString | TokenKind::RawFString => {
                self.error_here("patterns may not use f-strings");
                self.advance();
                PatternLoc::new(CodeRange::new(start, self.prev_end()), Pattern::Capture { name: None })
            }
            TokenKind::Star => {
                self.advance();
                let name = self.cur_text();
                self.expect(TokenKind::Identifier);
                let name = if name == "_" { None } else { Some(name) };
                PatternLoc::new(CodeRange::new(start, self.prev_end()), Pattern::Star { name })
            }
            TokenKind::Identifier => self.parse_name_pattern(),
            TokenKind::LeftParen => {
                self.advance();
                if self.eat(TokenKind::RightParen) {
                    return PatternLoc::new(
                        CodeRange::new(start, self.prev_end()),
                        Pattern::Sequence { patterns: Vec::new() },
                    );
                }
                let first = self.parse_or_pattern();
                if self.eat(TokenKind::RightParen) {
                    // A parenthesized group, not a sequence.
                    return first;
                }
                let mut patterns = vec![first];
                while self.eat(TokenKind::Comma) {
                    if self.at(TokenKind::RightParen) {
                        break;
                    }
                    patterns.push(self.parse_or_pattern());
                }
                self.expect(TokenKind::RightParen);
                self.check_single_star(&patterns);
                PatternLoc::new(CodeRange::new(start, self.prev_end()), Pattern::Sequence { patterns })
            }
            TokenKind::LeftBracket => {
                self.advance();
                let mut patterns = Vec::new();
                while !self.at(TokenKind::RightBracket) && !self.at(TokenKind::EndOfFile) {
                    patterns.push(self.parse_or_pattern());
                    if !self.eat(TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RightBracket);
                self.check_single_star(&patterns);
                PatternLoc::new(CodeRange::new(start, self.prev_end()), Pattern::Sequence { patterns })
            }
            TokenKind::LeftBrace => self.parse_mapping_pattern(),
            _ => {
                self.error_here(format!("expected pattern, got {}", self.kind()));
                PatternLoc::new(self.cur_range(), Pattern::Capture { name: None })
            }
        }
    }

    fn parse_number_pattern_literal(&mut self, negate: bool) -> Literal {
        let token = self.advance();
        let literal = match token.kind {
            TokenKind::Int => parse_int_token(token.text()),
            TokenKind::Float => Literal::Float(parse_float_text(token.text())),
            TokenKind::Imaginary => Literal::Imaginary(parse_float_text(token.text())),
            _ => {
                self.error(token.range(), "expected a number after '-' in pattern");
                Literal::Int(0)
            }
        };
        if !negate {
            return literal;
        }
        match literal {
            Literal::Int(v) => Literal::Int(-v),
            Literal::BigInt(v) => Literal::BigInt(-v),
            Literal::Float(v) => Literal::Float(-v),
            Literal::Imaginary(v) => Literal::Imaginary(-v),
            other => other,
        }
    }

    /// A bare name captures; a dotted name is a value pattern; either form
    /// followed by `(` starts a class pattern.
    fn parse_name_pattern(&mut self) -> PatternLoc {
        let start = self.cur_start();
        let name = self.mangle(&self.cur_text());
        self.advance();
        let mut cls = ExprLoc::new(CodeRange::new(start, self.prev_end()), Expr::Name(name.clone()));
        let mut dotted = false;
        while self.at(TokenKind::Dot) && self.peek_kind(1) == TokenKind::Identifier {
            self.advance();
            let attr = self.mangle(&self.cur_text());
            self.advance();
            dotted = true;
            cls = ExprLoc::new(
                CodeRange::new(start, self.prev_end()),
                Expr::Attribute {
                    object: Box::new(cls),
                    attr,
                },
            );
        }
        if self.at(TokenKind::LeftParen) {
            return self.parse_class_pattern(start, cls);
        }
        if dotted {
            return PatternLoc::new(CodeRange::new(start, self.prev_end()), Pattern::Value(cls));
        }
        let name = if name == "_" { None } else { Some(name) };
        PatternLoc::new(CodeRange::new(start, self.prev_end()), Pattern::Capture { name })
    }

    fn parse_class_pattern(&mut self, start: CodeLoc, cls: ExprLoc) -> PatternLoc {
        self.advance(); // `(`
        let mut patterns = Vec::new();
        let mut kwd_names = Vec::new();
        let mut kwd_patterns = Vec::new();
        while !self.at(TokenKind::RightParen) && !self.at(TokenKind::EndOfFile) {
            if self.at(TokenKind::Identifier) && self.peek_kind(1) == TokenKind::Assign {
                let name = self.cur_text();
                self.advance();
                self.advance();
                kwd_names.push(name);
                kwd_patterns.push(self.parse_or_pattern());
            } else {
                if !kwd_names.is_empty() {
                    self.error_here("positional pattern follows keyword pattern in class pattern");
                }
                patterns.push(self.parse_or_pattern());
            }
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RightParen);
        PatternLoc::new(
            CodeRange::new(start, self.prev_end()),
            Pattern::Class {
                cls,
                patterns,
                kwd_names,
                kwd_patterns,
            },
        )
    }

    fn parse_mapping_pattern(&mut self) -> PatternLoc {
        let start = self.cur_start();
        self.advance(); // `{`
        let mut keys = Vec::new();
        let mut patterns = Vec::new();
        let mut rest = None;
        while !self.at(TokenKind::RightBrace) && !self.at(TokenKind::EndOfFile) {
            if self.eat(TokenKind::DoubleStar) {
                let name = self.cur_text();
                self.expect(TokenKind::Identifier);
                if rest.is_some() {
                    self.error_here("only one '**' pattern is allowed");
                }
                rest = Some(name);
                if !self.eat(TokenKind::Comma) {
                    break;
                }
                if !self.at(TokenKind::RightBrace) {
                    self.error_here("'**' pattern must be the last entry");
                }
                continue;
            }
            keys.push(self.parse_mapping_key());
            self.expect(TokenKind::Colon);
            patterns.push(self.parse_or_pattern());
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RightBrace);
        PatternLoc::new(
            CodeRange::new(start, self.prev_end()),
            Pattern::Mapping { keys, patterns, rest },
        )
    }

    /// Mapping-pattern keys are restricted to literals and dotted names.
    fn parse_mapping_key(&mut self) -> ExprLoc {
        let start = self.cur_start();
        match self.kind() {
            TokenKind::Minus | TokenKind::Int | TokenKind::Float | TokenKind::Imaginary => {
                let negate = self.eat(TokenKind::Minus);
                let literal = self.parse_number_pattern_literal(negate);
                ExprLoc::new(CodeRange::new(start, self.prev_end()), Expr::Literal(literal))
            }
            TokenKind::Str => {
                let token = self.advance();
                ExprLoc::new(
                    CodeRange::new(start, self.prev_end()),
                    Expr::Literal(Literal::Str(token.text().to_owned())),
                )
            }
            TokenKind::Bytes => {
                let token = self.advance();
                ExprLoc::new(
                    CodeRange::new(start, self.prev_end()),
                    Expr::Literal(Literal::Bytes(token.text().chars().map(|c| c as u8).collect())),
                )
            }
            TokenKind::None => {
                self.advance();
                ExprLoc::new(CodeRange::new(start, self.prev_end()), Expr::Literal(Literal::None))
            }
            TokenKind::True => {
                self.advance();
                ExprLoc::new(CodeRange::new(start, self.prev_end()), Expr::Literal(Literal::Bool(true)))
            }
            TokenKind::False => {
                self.advance();
                ExprLoc::new(CodeRange::new(start, self.prev_end()), Expr::Literal(Literal::Bool(false)))
            }
            TokenKind::Identifier => {
                let name = self.mangle(&self.cur_text());
                self.advance();
                let mut expr = ExprLoc::new(CodeRange::new(start, self.prev_end()), Expr::Name(name));
                while self.at(TokenKind::Dot) && self.peek_kind(1) == TokenKind::Identifier {
                    self.advance();
                    let attr = self.mangle(&self.cur_text());
                    self.advance();
                    expr = ExprLoc::new(
                        CodeRange::new(start, self.prev_end()),
                        Expr::Attribute {
                            object: Box::new(expr),
                            attr,
                        },
                    );
                }
                expr
            }
            _ => {
                self.error_here("mapping pattern keys must be literals or dotted names");
                self.dummy_expr()
            }
        }
    }

    fn check_single_star(&mut self, patterns: &[PatternLoc]) {
        let stars = patterns
            .iter()
            .filter(|p| matches!(p.pattern, Pattern::Star { .. }))
            .count();
        if stars > 1 {
            if let Some(last) = patterns.last() {
                let position = last.position;
                self.error(position, "multiple starred elements in sequence pattern");
            }
        }
    }

    // === Expressions ===

    /// True when the current token can begin an expression.
    fn expression_follows(&self) -> bool {
        matches!(
            self.kind(),
            TokenKind::Identifier
                | TokenKind::Int
                | TokenKind::Float
                | TokenKind::Imaginary
                | TokenKind::Str
                | TokenKind::Bytes
                | TokenKind::FString
                | TokenKind::RawFString
                | TokenKind::True
                | TokenKind::False
                | TokenKind::None
                | TokenKind::Ellipsis
                | TokenKind::LeftParen
                | TokenKind::LeftBracket
                | TokenKind::LeftBrace
                | TokenKind::Minus
                | TokenKind::Plus
                | TokenKind::Tilde
                | TokenKind::Not
                | TokenKind::Lambda
                | TokenKind::Await
                | TokenKind::Yield
                | TokenKind::Star
        )
    }

    /// Parses `expr (, expr)*`, forming an implicit tuple on a bare comma.
    fn parse_expr_list(&mut self) -> ExprLoc {
        let start = self.cur_start();
        let first = self.parse_star_or_expr();
        if !self.at(TokenKind::Comma) {
            return first;
        }
        let mut items = vec![first];
        while self.eat(TokenKind::Comma) {
            if !self.expression_follows() {
                break;
            }
            items.push(self.parse_star_or_expr());
        }
        ExprLoc::new(CodeRange::new(start, self.prev_end()), Expr::Tuple(items))
    }

    /// A display or target element: `*expr` or a plain expression.
    fn parse_star_or_expr(&mut self) -> ExprLoc {
        if self.at(TokenKind::Star) {
            let start = self.cur_start();
            self.advance();
            let inner = self.parse_bitor();
            return ExprLoc::new(CodeRange::new(start, self.prev_end()), Expr::Starred(Box::new(inner)));
        }
        self.parse_expr()
    }

    /// Full expression: walrus, yield, ternary, lambda, and downward.
    fn parse_expr(&mut self) -> ExprLoc {
        if self.depth_remaining == 0 {
            self.error_here("expression nested too deeply");
            return self.dummy_expr();
        }
        self.depth_remaining -= 1;
        let expr = self.parse_expr_inner();
        self.depth_remaining += 1;
        expr
    }

    fn parse_expr_inner(&mut self) -> ExprLoc {
        let start = self.cur_start();
        if self.at(TokenKind::Yield) {
            self.advance();
            if self.eat(TokenKind::From) {
                let value = self.parse_expr();
                return ExprLoc::new(CodeRange::new(start, self.prev_end()), Expr::YieldFrom(Box::new(value)));
            }
            let value = self.expression_follows().then(|| Box::new(self.parse_expr_list()));
            return ExprLoc::new(CodeRange::new(start, self.prev_end()), Expr::Yield(value));
        }

        let expr = self.parse_ternary();

        if self.at(TokenKind::ColonEqual) {
            if !matches!(expr.expr, Expr::Name(_)) {
                self.error(expr.position, "walrus target not an identifier");
            }
            self.advance();
            let value = self.parse_expr();
            return ExprLoc::new(
                CodeRange::new(start, self.prev_end()),
                Expr::Named {
                    target: Box::new(expr),
                    value: Box::new(value),
                },
            );
        }
        expr
    }

    fn parse_ternary(&mut self) -> ExprLoc {
        if self.at(TokenKind::Lambda) {
            return self.parse_lambda();
        }
        let start = self.cur_start();
        let body = self.parse_or();
        if !self.at(TokenKind::If) {
            return body;
        }
        self.advance();
        let test = self.parse_or();
        self.expect(TokenKind::Else);
        let orelse = self.parse_ternary();
        ExprLoc::new(
            CodeRange::new(start, self.prev_end()),
            Expr::IfElse {
                test: Box::new(test),
                body: Box::new(body),
                orelse: Box::new(orelse),
            },
        )
    }

    fn parse_lambda(&mut self) -> ExprLoc {
        let start = self.cur_start();
        self.advance();
        let args = self.parse_parameters(TokenKind::Colon);
        self.expect(TokenKind::Colon);
        let body = self.parse_ternary();
        ExprLoc::new(
            CodeRange::new(start, self.prev_end()),
            Expr::Lambda {
                args: Box::new(args),
                body: Box::new(body),
            },
        )
    }

    /// `or` collects its operands into a single n-ary node to preserve the
    /// short-circuit chain.
    fn parse_or(&mut self) -> ExprLoc {
        let start = self.cur_start();
        let first = self.parse_and();
        if !self.at(TokenKind::Or) {
            return first;
        }
        let mut values = vec![first];
        while self.eat(TokenKind::Or) {
            values.push(self.parse_and());
        }
        ExprLoc::new(
            CodeRange::new(start, self.prev_end()),
            Expr::BoolOp {
                op: BoolOperator::Or,
                values,
            },
        )
    }

    fn parse_and(&mut self) -> ExprLoc {
        let start = self.cur_start();
        let first = self.parse_not();
        if !self.at(TokenKind::And) {
            return first;
        }
        let mut values = vec![first];
        while self.eat(TokenKind::And) {
            values.push(self.parse_not());
        }
        ExprLoc::new(
            CodeRange::new(start, self.prev_end()),
            Expr::BoolOp {
                op: BoolOperator::And,
                values,
            },
        )
    }

    fn parse_not(&mut self) -> ExprLoc {
        if self.at(TokenKind::Not) {
            let start = self.cur_start();
            self.advance();
            let operand = self.parse_not();
            return ExprLoc::new(
                CodeRange::new(start, self.prev_end()),
                Expr::UnaryOp {
                    op: UnaryOperator::Not,
                    operand: Box::new(operand),
                },
            );
        }
        self.parse_comparison()
    }

    /// Chained comparisons become one node: `a < b < c` keeps `a` plus
    /// parallel operator and comparator lists. `not in` and `is not` are
    /// two-token sequences collapsed to one operator.
    fn parse_comparison(&mut self) -> ExprLoc {
        let start = self.cur_start();
        let left = self.parse_bitor();
        let mut ops = Vec::new();
        let mut comparators = Vec::new();
        loop {
            let op = match self.kind() {
                TokenKind::Less => CmpOperator::Lt,
                TokenKind::Greater => CmpOperator::Gt,
                TokenKind::LessEqual => CmpOperator::LtE,
                TokenKind::GreaterEqual => CmpOperator::GtE,
                TokenKind::EqEqual => CmpOperator::Eq,
                TokenKind::NotEqual => CmpOperator::NotEq,
                TokenKind::In => CmpOperator::In,
                TokenKind::Not if self.peek_kind(1) == TokenKind::In => {
                    self.advance();
                    CmpOperator::NotIn
                }
                TokenKind::Is => {
                    if self.peek_kind(1) == TokenKind::Not {
                        self.advance();
                        CmpOperator::IsNot
                    } else {
                        CmpOperator::Is
                    }
                }
                _ => break,
            };
            self.advance();
            ops.push(op);
            comparators.push(self.parse_bitor());
        }
        if ops.is_empty() {
            return left;
        }
        ExprLoc::new(
            CodeRange::new(start, self.prev_end()),
            Expr::Compare {
                left: Box::new(left),
                ops,
                comparators,
            },
        )
    }

    fn parse_bitor(&mut self) -> ExprLoc {
        let mut left = self.parse_bitxor();
        while self.at(TokenKind::Pipe) {
            self.advance();
            let right = self.parse_bitxor();
            left = binary(left, Operator::BitOr, right);
        }
        left
    }

    fn parse_bitxor(&mut self) -> ExprLoc {
        let mut left = self.parse_bitand();
        while self.at(TokenKind::Caret) {
            self.advance();
            let right = self.parse_bitand();
            left = binary(left, Operator::BitXor, right);
        }
        left
    }

    fn parse_bitand(&mut self) -> ExprLoc {
        let mut left = self.parse_shift();
        while self.at(TokenKind::Amp) {
            self.advance();
            let right = self.parse_shift();
            left = binary(left, Operator::BitAnd, right);
        }
        left
    }

    fn parse_shift(&mut self) -> ExprLoc {
        let mut left = self.parse_arith();
        loop {
            let op = match self.kind() {
                TokenKind::LeftShift => Operator::LShift,
                TokenKind::RightShift => Operator::RShift,
                _ => break,
            };
            self.advance();
            let right = self.parse_arith();
            left = binary(left, op, right);
        }
        left
    }

    fn parse_arith(&mut self) -> ExprLoc {
        let mut left = self.parse_term();
        loop {
            let op = match self.kind() {
                TokenKind::Plus => Operator::Add,
                TokenKind::Minus => Operator::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_term();
            left = binary(left, op, right);
        }
        left
    }

    fn parse_term(&mut self) -> ExprLoc {
        let mut left = self.parse_factor();
        loop {
            let op = match self.kind() {
                TokenKind::Star => Operator::Mult,
                TokenKind::Slash => Operator::Div,
                TokenKind::DoubleSlash => Operator::FloorDiv,
                TokenKind::Percent => Operator::Mod,
                TokenKind::At => Operator::MatMult,
                _ => break,
            };
            self.advance();
            let right = self.parse_factor();
            left = binary(left, op, right);
        }
        left
    }

    fn parse_factor(&mut self) -> ExprLoc {
        let start = self.cur_start();
        let op = match self.kind() {
            TokenKind::Minus => Some(UnaryOperator::Minus),
            TokenKind::Plus => Some(UnaryOperator::Plus),
            TokenKind::Tilde => Some(UnaryOperator::Invert),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.parse_factor();
            return ExprLoc::new(
                CodeRange::new(start, self.prev_end()),
                Expr::UnaryOp {
                    op,
                    operand: Box::new(operand),
                },
            );
        }
        self.parse_power()
    }

    fn parse_power(&mut self) -> ExprLoc {
        let base = self.parse_await();
        if self.at(TokenKind::DoubleStar) {
            self.advance();
            // `**` is right-associative and binds looser than a unary
            // operator on its right: `2 ** -3` parses as `2 ** (-3)`.
            let exponent = self.parse_factor();
            return binary(base, Operator::Pow, exponent);
        }
        base
    }

    fn parse_await(&mut self) -> ExprLoc {
        if self.at(TokenKind::Await) {
            let start = self.cur_start();
            self.advance();
            let operand = self.parse_await();
            return ExprLoc::new(CodeRange::new(start, self.prev_end()), Expr::Await(Box::new(operand)));
        }
        self.parse_postfix()
    }

    /// Postfix chain: calls, subscripts, attribute access.
    fn parse_postfix(&mut self) -> ExprLoc {
        let start = self.cur_start();
        let mut expr = self.parse_atom();
        loop {
            match self.kind() {
                TokenKind::LeftParen => {
                    self.advance();
                    // A generator expression may be the sole call argument
                    // without its own parentheses.
                    if self.expression_follows() && !self.at(TokenKind::Star) {
                        let checkpoint = self.pos;
                        let errors_before = self.errors.len();
                        let first = self.parse_expr();
                        if self.at(TokenKind::For) || (self.at(TokenKind::Async) && self.peek_kind(1) == TokenKind::For)
                        {
                            let generators = self.parse_comprehension_clauses();
                            self.expect(TokenKind::RightParen);
                            let genexpr = ExprLoc::new(
                                CodeRange::new(start, self.prev_end()),
                                Expr::GeneratorExp {
                                    elt: Box::new(first),
                                    generators,
                                },
                            );
                            expr = ExprLoc::new(
                                CodeRange::new(start, self.prev_end()),
                                Expr::Call {
                                    func: Box::new(expr),
                                    args: vec![genexpr],
                                    keywords: Vec::new(),
                                },
                            );
                            continue;
                        }
                        self.pos = checkpoint;
                        self.errors.truncate(errors_before);
                    }
                    let (args, keywords) = self.parse_call_arguments();
                    self.expect(TokenKind::RightParen);
                    expr = ExprLoc::new(
                        CodeRange::new(start, self.prev_end()),
                        Expr::Call {
                            func: Box::new(expr),
                            args,
                            keywords,
                        },
                    );
                }
                TokenKind::LeftBracket => {
                    self.advance();
                    let index = self.parse_subscript_list();
                    self.expect(TokenKind::RightBracket);
                    expr = ExprLoc::new(
                        CodeRange::new(start, self.prev_end()),
                        Expr::Subscript {
                            object: Box::new(expr),
                            index: Box::new(index),
                        },
                    );
                }
                TokenKind::Dot => {
                    self.advance();
                    let attr = self.mangle(&self.cur_text());
                    self.expect(TokenKind::Identifier);
                    expr = ExprLoc::new(
                        CodeRange::new(start, self.prev_end()),
                        Expr::Attribute {
                            object: Box::new(expr),
                            attr,
                        },
                    );
                }
                _ => break,
            }
        }
        expr
    }

    fn parse_call_arguments(&mut self) -> (Vec<ExprLoc>, Vec<Keyword>) {
        let mut args = Vec::new();
        let mut keywords: Vec<Keyword> = Vec::new();
        while !self.at(TokenKind::RightParen) && !self.at(TokenKind::EndOfFile) && !self.at(TokenKind::Newline) {
            let arg_start = self.cur_start();
            if self.eat(TokenKind::DoubleStar) {
                let value = self.parse_expr();
                keywords.push(Keyword {
                    position: CodeRange::new(arg_start, self.prev_end()),
                    name: None,
                    value,
                });
            } else if self.at(TokenKind::Star) {
                self.advance();
                let value = self.parse_bitor();
                args.push(ExprLoc::new(
                    CodeRange::new(arg_start, self.prev_end()),
                    Expr::Starred(Box::new(value)),
                ));
            } else if self.at(TokenKind::Identifier) && self.peek_kind(1) == TokenKind::Assign {
                let name = self.cur_text();
                self.advance();
                self.advance();
                let value = self.parse_expr();
                if keywords.iter().any(|kw| kw.name.is_none()) {
                    self.error(
                        CodeRange::new(arg_start, self.prev_end()),
                        "keyword argument after **",
                    );
                }
                keywords.push(Keyword {
                    position: CodeRange::new(arg_start, self.prev_end()),
                    name: Some(name),
                    value,
                });
            } else {
                let value = self.parse_expr();
                if keywords.iter().any(|kw| kw.name.is_some()) {
                    self.error(value.position, "positional argument follows keyword argument");
                }
                args.push(value);
            }
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        (args, keywords)
    }

    /// Subscript content: slice items, possibly comma-joined into a tuple.
    fn parse_subscript_list(&mut self) -> ExprLoc {
        let start = self.cur_start();
        let first = self.parse_subscript_item();
        if !self.at(TokenKind::Comma) {
            return first;
        }
        let mut items = vec![first];
        while self.eat(TokenKind::Comma) {
            if self.at(TokenKind::RightBracket) {
                break;
            }
            items.push(self.parse_subscript_item());
        }
        ExprLoc::new(CodeRange::new(start, self.prev_end()), Expr::Tuple(items))
    }

    fn parse_subscript_item(&mut self) -> ExprLoc {
        let start = self.cur_start();
        let lower = (!self.at(TokenKind::Colon)).then(|| self.parse_expr());
        if !self.at(TokenKind::Colon) {
            return lower.unwrap_or_else(|| {
                self.error_here("expected subscript expression");
                self.dummy_expr()
            });
        }
        self.advance();
        let upper = (self.expression_follows()).then(|| self.parse_expr());
        let step = self
            .eat(TokenKind::Colon)
            .then(|| self.expression_follows().then(|| self.parse_expr()))
            .flatten();
        ExprLoc::new(
            CodeRange::new(start, self.prev_end()),
            Expr::Slice {
                lower: lower.map(Box::new),
                upper: upper.map(Box::new),
                step: step.map(Box::new),
            },
        )
    }

    /// Targets of `for` and comprehension clauses parse below the
    /// comparison level so the `in` keyword is not consumed as an operator.
    fn parse_target_list(&mut self) -> ExprLoc {
        let start = self.cur_start();
        let first = self.parse_target_atom();
        if !self.at(TokenKind::Comma) {
            return first;
        }
        let mut items = vec![first];
        while self.eat(TokenKind::Comma) {
            if !self.expression_follows() {
                break;
            }
            items.push(self.parse_target_atom());
        }
        ExprLoc::new(CodeRange::new(start, self.prev_end()), Expr::Tuple(items))
    }

    fn parse_target_atom(&mut self) -> ExprLoc {
        if self.at(TokenKind::Star) {
            let start = self.cur_start();
            self.advance();
            let inner = self.parse_bitor();
            return ExprLoc::new(CodeRange::new(start, self.prev_end()), Expr::Starred(Box::new(inner)));
        }
        self.parse_bitor()
    }

    fn parse_comprehension_clauses(&mut self) -> Vec<Comprehension> {
        let mut generators = Vec::new();
        loop {
            let is_async = if self.at(TokenKind::Async) && self.peek_kind(1) == TokenKind::For {
                self.advance();
                true
            } else {
                false
            };
            if !self.at(TokenKind::For) {
                break;
            }
            self.advance();
            let target = self.parse_target_list();
            self.validate_assign_target(&target, true);
            self.expect(TokenKind::In);
            // The iterable parses at `or` precedence: a ternary here would
            // swallow the `if` of a filter clause.
            let iter = self.parse_or();
            let mut ifs = Vec::new();
            while self.at(TokenKind::If) {
                self.advance();
                ifs.push(self.parse_or());
            }
            generators.push(Comprehension {
                target,
                iter,
                ifs,
                is_async,
            });
        }
        generators
    }

    // === Atoms ===

    fn parse_atom(&mut self) -> ExprLoc {
        let start = self.cur_start();
        match self.kind() {
            TokenKind::Identifier => {
                let name = self.mangle(&self.cur_text());
                self.advance();
                ExprLoc::new(CodeRange::new(start, self.prev_end()), Expr::Name(name))
            }
            TokenKind::Int | TokenKind::Float | TokenKind::Imaginary => {
                let token = self.advance();
                let literal = match token.kind {
                    TokenKind::Int => parse_int_token(token.text()),
                    TokenKind::Float => Literal::Float(parse_float_text(token.text())),
                    _ => Literal::Imaginary(parse_float_text(token.text())),
                };
                ExprLoc::new(CodeRange::new(start, self.prev_end()), Expr::Literal(literal))
            }
            TokenKind::Str | TokenKind::Bytes | TokenKind::FString | TokenKind::RawFString => {
                self.parse_string_group()
            }
            TokenKind::True => {
                self.advance();
                ExprLoc::new(CodeRange::new(start, self.prev_end()), Expr::Literal(Literal::Bool(true)))
            }
            TokenKind::False => {
                self.advance();
                ExprLoc::new(CodeRange::new(start, self.prev_end()), Expr::Literal(Literal::Bool(false)))
            }
            TokenKind::None => {
                self.advance();
                ExprLoc::new(CodeRange::new(start, self.prev_end()), Expr::Literal(Literal::None))
            }
            TokenKind::Ellipsis => {
                self.advance();
                ExprLoc::new(CodeRange::new(start, self.prev_end()), Expr::Literal(Literal::Ellipsis))
            }
            TokenKind::LeftParen => self.parse_paren_atom(),
            TokenKind::LeftBracket => self.parse_bracket_atom(),
            TokenKind::LeftBrace => self.parse_brace_atom(),
            TokenKind::Lambda => self.parse_lambda(),
            _ => {
                self.error_here(format!("expected expression, got {}", self.kind()));
                self.dummy_expr()
            }
        }
    }

    fn parse_paren_atom(&mut self) -> ExprLoc {
        let start = self.cur_start();
        self.advance();
        if self.eat(TokenKind::RightParen) {
            return ExprLoc::new(CodeRange::new(start, self.prev_end()), Expr::Tuple(Vec::new()));
        }
        let first = self.parse_star_or_expr();
        if self.at(TokenKind::For) || (self.at(TokenKind::Async) && self.peek_kind(1) == TokenKind::For) {
            let generators = self.parse_comprehension_clauses();
            self.expect(TokenKind::RightParen);
            return ExprLoc::new(
                CodeRange::new(start, self.prev_end()),
                Expr::GeneratorExp {
                    elt: Box::new(first),
                    generators,
                },
            );
        }
        if self.at(TokenKind::Comma) {
            let mut items = vec![first];
            while self.eat(TokenKind::Comma) {
                if self.at(TokenKind::RightParen) {
                    break;
                }
                items.push(self.parse_star_or_expr());
            }
            self.expect(TokenKind::RightParen);
            return ExprLoc::new(CodeRange::new(start, self.prev_end()), Expr::Tuple(items));
        }
        self.expect(TokenKind::RightParen);
        first
    }

    fn parse_bracket_atom(&mut self) -> ExprLoc {
        let start = self.cur_start();
        self.advance();
        if self.eat(TokenKind::RightBracket) {
            return ExprLoc::new(CodeRange::new(start, self.prev_end()), Expr::List(Vec::new()));
        }
        let first = self.parse_star_or_expr();
        if self.at(TokenKind::For) || (self.at(TokenKind::Async) && self.peek_kind(1) == TokenKind::For) {
            let generators = self.parse_comprehension_clauses();
            self.expect(TokenKind::RightBracket);
            return ExprLoc::new(
                CodeRange::new(start, self.prev_end()),
                Expr::ListComp {
                    elt: Box::new(first),
                    generators,
                },
            );
        }
        let mut items = vec![first];
        while self.eat(TokenKind::Comma) {
            if self.at(TokenKind::RightBracket) {
                break;
            }
            items.push(self.parse_star_or_expr());
        }
        self.expect(TokenKind::RightBracket);
        ExprLoc::new(CodeRange::new(start, self.prev_end()), Expr::List(items))
    }

    fn parse_brace_atom(&mut self) -> ExprLoc {
        let start = self.cur_start();
        self.advance();
        if self.eat(TokenKind::RightBrace) {
            // `{}` is always an empty dict.
            return ExprLoc::new(
                CodeRange::new(start, self.prev_end()),
                Expr::Dict {
                    keys: Vec::new(),
                    values: Vec::new(),
                },
            );
        }

        if self.eat(TokenKind::DoubleStar) {
            let value = self.parse_bitor();
            return self.parse_dict_rest(start, vec![None], vec![value]);
        }

        let first = self.parse_star_or_expr();
        if self.eat(TokenKind::Colon) {
            let value = self.parse_expr();
            if self.at(TokenKind::For) || (self.at(TokenKind::Async) && self.peek_kind(1) == TokenKind::For) {
                let generators = self.parse_comprehension_clauses();
                self.expect(TokenKind::RightBrace);
                return ExprLoc::new(
                    CodeRange::new(start, self.prev_end()),
                    Expr::DictComp {
                        key: Box::new(first),
                        value: Box::new(value),
                        generators,
                    },
                );
            }
            return self.parse_dict_rest(start, vec![Some(first)], vec![value]);
        }

        if self.at(TokenKind::For) || (self.at(TokenKind::Async) && self.peek_kind(1) == TokenKind::For) {
            let generators = self.parse_comprehension_clauses();
            self.expect(TokenKind::RightBrace);
            return ExprLoc::new(
                CodeRange::new(start, self.prev_end()),
                Expr::SetComp {
                    elt: Box::new(first),
                    generators,
                },
            );
        }

        let mut items = vec![first];
        while self.eat(TokenKind::Comma) {
            if self.at(TokenKind::RightBrace) {
                break;
            }
            items.push(self.parse_star_or_expr());
        }
        self.expect(TokenKind::RightBrace);
        ExprLoc::new(CodeRange::new(start, self.prev_end()), Expr::Set(items))
    }

    fn parse_dict_rest(
        &mut self,
        start: CodeLoc,
        mut keys: Vec<Option<ExprLoc>>,
        mut values: Vec<ExprLoc>,
    ) -> ExprLoc {
        while self.eat(TokenKind::Comma) {
            if self.at(TokenKind::RightBrace) {
                break;
            }
            if self.eat(TokenKind::DoubleStar) {
                keys.push(None);
                values.push(self.parse_bitor());
                continue;
            }
            let key = self.parse_expr();
            self.expect(TokenKind::Colon);
            let value = self.parse_expr();
            keys.push(Some(key));
            values.push(value);
        }
        self.expect(TokenKind::RightBrace);
        ExprLoc::new(CodeRange::new(start, self.prev_end()), Expr::Dict { keys, values })
    }

    // === String literals ===

    /// Parses a run of adjacent string-family tokens into one literal,
    /// applying implicit concatenation.
    fn parse_string_group(&mut self) -> ExprLoc {
        let start = self.cur_start();
        let mut tokens = vec![self.advance()];
        while matches!(
            self.kind(),
            TokenKind::Str | TokenKind::Bytes | TokenKind::FString | TokenKind::RawFString
        ) {
            tokens.push(self.advance());
        }
        let position = CodeRange::new(start, self.prev_end());

        let any_bytes = tokens.iter().any(|t| t.kind == TokenKind::Bytes);
        let any_text = tokens.iter().any(|t| t.kind != TokenKind::Bytes);
        if any_bytes && any_text {
            self.error(position, "cannot mix bytes and nonbytes literals");
        }
        if any_bytes {
            let mut bytes = Vec::new();
            for token in &tokens {
                bytes.extend(token.text().chars().map(|c| c as u8));
            }
            return ExprLoc::new(position, Expr::Literal(Literal::Bytes(bytes)));
        }

        let any_fstring = tokens
            .iter()
            .any(|t| matches!(t.kind, TokenKind::FString | TokenKind::RawFString));
        if !any_fstring {
            let mut text = String::new();
            for token in &tokens {
                text.push_str(token.text());
            }
            return ExprLoc::new(position, Expr::Literal(Literal::Str(text)));
        }

        // Any f-string in the run promotes the whole literal to an f-string.
        let mut parts: Vec<FStringPart> = Vec::new();
        for token in &tokens {
            match token.kind {
                TokenKind::Str => push_literal_part(&mut parts, token.text()),
                TokenKind::FString | TokenKind::RawFString => {
                    let raw = token.kind == TokenKind::RawFString;
                    let new_parts = self.parse_fstring_body(token, raw);
                    for part in new_parts {
                        match part {
                            FStringPart::Literal(text) => push_literal_part(&mut parts, &text),
                            expr_part => parts.push(expr_part),
                        }
                    }
                }
                _ => {}
            }
        }
        ExprLoc::new(position, Expr::FString(parts))
    }

    /// Estimates the source location of the first body character of an
    /// f-string token. The prefix/quote split is recovered from the length
    /// difference between the token and its captured body.
    fn fstring_body_origin(&self, token: &Token) -> CodeLoc {
        let total = token.end.offset.saturating_sub(token.start.offset) as usize;
        let body_len = token.text().len();
        let overhead = total.saturating_sub(body_len);
        let quote_len = if overhead >= 7 { 3 } else { 1 };
        let lead = u32::try_from(overhead.saturating_sub(quote_len)).unwrap_or(0);
        CodeLoc {
            line: token.start.line,
            column: token.start.column + lead,
            offset: token.start.offset + lead,
        }
    }

    /// Splits an f-string body into literal and expression parts,
    /// re-tokenizing and parsing each embedded expression.
    fn parse_fstring_body(&mut self, token: &Token, raw: bool) -> Vec<FStringPart> {
        let body = token.text().to_owned();
        let origin = self.fstring_body_origin(token);
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut literal_start = 0;
        let bytes = body.as_bytes();
        let mut i = 0;

        while i < bytes.len() {
            if literal.is_empty() {
                literal_start = i;
            }
            match bytes[i] {
                b'{' if bytes.get(i + 1) == Some(&b'{') => {
                    literal.push('{');
                    i += 2;
                }
                b'}' if bytes.get(i + 1) == Some(&b'}') => {
                    literal.push('}');
                    i += 2;
                }
                b'}' => {
                    let here = advance_over(origin, &body[..i]);
                    self.error(CodeRange::new(here, here), "single '}' is not allowed in f-string");
                    i += 1;
                }
                b'{' => {
                    self.flush_fstring_literal(raw, advance_over(origin, &body[..literal_start]), &mut literal, &mut parts);
                    match scan_replacement_field(&body, i + 1) {
                        Some(field) => {
                            let expr_text = &body[i + 1..field.expr_end];
                            if expr_text.trim().is_empty() {
                                let here = advance_over(origin, &body[..i]);
                                self.error(CodeRange::new(here, here), "empty f-string expression");
                            } else {
                                let expr_origin = advance_over(origin, &body[..i + 1]);
                                let expr = self.parse_embedded_expression(expr_text, expr_origin);
                                parts.push(FStringPart::Expr {
                                    expr,
                                    conversion: field.conversion,
                                    format_spec: field.format_spec,
                                });
                            }
                            i = field.end;
                        }
                        None => {
                            let here = advance_over(origin, &body[..i]);
                            self.error(CodeRange::new(here, here), "unmatched '{' in f-string");
                            i = bytes.len();
                        }
                    }
                }
                _ => {
                    let ch_len = body[i..].chars().next().map_or(1, char::len_utf8);
                    literal.push_str(&body[i..i + ch_len]);
                    i += ch_len;
                }
            }
        }
        self.flush_fstring_literal(raw, advance_over(origin, &body[..literal_start]), &mut literal, &mut parts);
        parts
    }

    /// Appends a pending literal segment, decoding escapes unless raw.
    ///
    /// `segment_origin` points at the segment's first character; escape
    /// error positions inside segments containing doubled braces are
    /// best-effort, since `{{` collapses while scanning.
    fn flush_fstring_literal(
        &mut self,
        raw: bool,
        segment_origin: CodeLoc,
        literal: &mut String,
        parts: &mut Vec<FStringPart>,
    ) {
        if literal.is_empty() {
            return;
        }
        let text = std::mem::take(literal);
        let decoded = if raw {
            text
        } else {
            decode_text_escapes(&text, segment_origin, &self.filename, &mut self.errors)
        };
        parts.push(FStringPart::Literal(decoded));
    }

    /// Re-tokenizes and parses one embedded f-string expression.
    fn parse_embedded_expression(&mut self, text: &str, origin: CodeLoc) -> ExprLoc {
        let mut lexer = Lexer::with_origin(text, &self.filename, origin);
        let mut tokens = Vec::new();
        loop {
            let token = lexer.next_token();
            let done = token.kind == TokenKind::EndOfFile;
            if !matches!(token.kind, TokenKind::Comment | TokenKind::Newline | TokenKind::Indent | TokenKind::Dedent) {
                tokens.push(token);
            }
            if done {
                break;
            }
        }
        self.errors.append(&mut lexer.into_errors());

        let mut sub = Parser::new(tokens, &self.filename);
        sub.class_stack.clone_from(&self.class_stack);
        let expr = sub.parse_expr_list();
        if !sub.at(TokenKind::EndOfFile) {
            sub.error_here(format!("unexpected {} in f-string expression", sub.kind()));
        }
        self.errors.append(&mut sub.errors);
        expr
    }
}

/// Scans one `{...}` replacement field starting after the `{`, honoring
/// nested brackets and string quotes, and splitting off the trailing
/// `!conversion` and `:format_spec` at brace depth zero.
fn scan_replacement_field(body: &str, start: usize) -> Option<ReplacementField> {
    let bytes = body.as_bytes();
    let mut depth = 0u32;
    let mut i = start;
    let mut expr_end = None;
    let mut conversion = None;
    let mut format_spec = None;

    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b'(' | b'[' | b'{' => {
                depth += 1;
                i += 1;
            }
            b')' | b']' => {
                depth = depth.saturating_sub(1);
                i += 1;
            }
            b'\'' | b'"' => {
                // Skip a nested string literal wholesale.
                let quote = b;
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
                i += 1;
            }
            b'}' if depth == 0 => {
                if expr_end.is_none() {
                    expr_end = Some(i);
                }
                return Some(ReplacementField {
                    expr_end: expr_end.unwrap_or(i),
                    conversion,
                    format_spec,
                    end: i + 1,
                });
            }
            b'}' => {
                depth = depth.saturating_sub(1);
                i += 1;
            }
            b'!' if depth == 0
                && expr_end.is_none()
                && matches!(bytes.get(i + 1), Some(b'r' | b's' | b'a'))
                && matches!(bytes.get(i + 2), Some(b'}' | b':')) =>
            {
                expr_end = Some(i);
                conversion = Some(match bytes[i + 1] {
                    b'r' => Conversion::Repr,
                    b'a' => Conversion::Ascii,
                    _ => Conversion::Str,
                });
                i += 2;
            }
            b':' if depth == 0 => {
                if expr_end.is_none() {
                    expr_end = Some(i);
                }
                // The format spec runs to the matching close brace;
                // nested braces inside it are tolerated textually.
                let spec_start = i + 1;
                let mut spec_depth = 0u32;
                let mut j = spec_start;
                while j < bytes.len() {
                    match bytes[j] {
                        b'{' => spec_depth += 1,
                        b'}' if spec_depth == 0 => {
                            format_spec = Some(body[spec_start..j].to_owned());
                            return Some(ReplacementField {
                                expr_end: expr_end.unwrap_or(i),
                                conversion,
                                format_spec,
                                end: j + 1,
                            });
                        }
                        b'}' => spec_depth -= 1,
                        _ => {}
                    }
                    j += 1;
                }
                return None;
            }
            _ => {
                i += 1;
            }
        }
    }
    None
}

/// One parsed `{...}` replacement field of an f-string body.
struct ReplacementField {
    expr_end: usize,
    conversion: Option<Conversion>,
    format_spec: Option<String>,
    /// Byte index just past the closing `}`.
    end: usize,
}

fn push_literal_part(parts: &mut Vec<FStringPart>, text: &str) {
    if let Some(FStringPart::Literal(existing)) = parts.last_mut() {
        existing.push_str(text);
    } else {
        parts.push(FStringPart::Literal(text.to_owned()));
    }
}

fn binary(left: ExprLoc, op: Operator, right: ExprLoc) -> ExprLoc {
    let position = left.position.to(right.position);
    ExprLoc::new(
        position,
        Expr::BinaryOp {
            left: Box::new(left),
            op,
            right: Box::new(right),
        },
    )
}

fn augmented_operator(kind: TokenKind) -> Operator {
    match kind {
        TokenKind::PlusEqual => Operator::Add,
        TokenKind::MinusEqual => Operator::Sub,
        TokenKind::StarEqual => Operator::Mult,
        TokenKind::SlashEqual => Operator::Div,
        TokenKind::DoubleSlashEqual => Operator::FloorDiv,
        TokenKind::PercentEqual => Operator::Mod,
        TokenKind::AtEqual => Operator::MatMult,
        TokenKind::AmpEqual => Operator::BitAnd,
        TokenKind::PipeEqual => Operator::BitOr,
        TokenKind::CaretEqual => Operator::BitXor,
        TokenKind::LeftShiftEqual => Operator::LShift,
        TokenKind::RightShiftEqual => Operator::RShift,
        TokenKind::DoubleStarEqual => Operator::Pow,
        _ => Operator::Add,
    }
}

/// Advances a location over a prefix of already-scanned f-string body text.
fn advance_over(mut loc: CodeLoc, text: &str) -> CodeLoc {
    for ch in text.chars() {
        loc = bump_loc(loc, ch);
    }
    loc
}

/// Parses an integer literal into a value, handling radix prefixes and
/// underscore separators. The token keeps the raw lexeme; the constant pool
/// receives the parsed number.
fn parse_int_token(text: &str) -> Literal {
    let Some(value) = parse_int_literal(text) else {
        return Literal::Int(0);
    };
    match value.to_i64() {
        Some(small) => Literal::Int(small),
        None => Literal::BigInt(value),
    }
}

/// Parses an integer literal string into a `BigInt`.
///
/// Supports Python integer literal formats:
/// - Decimal: `123`, `1_000_000`
/// - Hexadecimal: `0x1a2b`, `0X1A2B`
/// - Octal: `0o777`, `0O777`
/// - Binary: `0b1010`, `0B1010`
///
/// Returns `None` if the string cannot be parsed.
fn parse_int_literal(s: &str) -> Option<BigInt> {
    let cleaned: String = s.chars().filter(|c| *c != '_').collect();
    let cleaned = cleaned.as_str();

    if cleaned.len() >= 2 {
        let prefix = &cleaned[..2];
        let digits = &cleaned[2..];
        match prefix.to_ascii_lowercase().as_str() {
            "0x" => return BigInt::parse_bytes(digits.as_bytes(), 16),
            "0o" => return BigInt::parse_bytes(digits.as_bytes(), 8),
            "0b" => return BigInt::parse_bytes(digits.as_bytes(), 2),
            _ => {}
        }
    }

    cleaned.parse::<BigInt>().ok()
}

fn parse_float_text(text: &str) -> f64 {
    let cleaned: String = text.chars().filter(|c| *c != '_').collect();
    cleaned.parse::<f64>().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn parse_ok(source: &str) -> Module {
        let (module, errors) = parse_module_text(source, "test.py");
        assert_eq!(errors, vec![], "unexpected parse errors for {source:?}");
        module
    }

    fn parse_err(source: &str) -> Vec<CompileError> {
        let (_, errors) = parse_module_text(source, "test.py");
        errors
    }

    fn first_expr(module: &Module) -> &Expr {
        match &module.body[0].stmt {
            Stmt::Expr(e) => &e.expr,
            other => panic!("expected expression statement, got {other:?}"),
        }
    }

    #[test]
    fn precedence_of_arithmetic() {
        let module = parse_ok("1 + 2 * 3\n");
        let Expr::BinaryOp { op, right, .. } = first_expr(&module) else {
            panic!("expected binary op");
        };
        assert_eq!(*op, Operator::Add);
        assert!(matches!(right.expr, Expr::BinaryOp { op: Operator::Mult, .. }));
    }

    #[test]
    fn power_is_right_associative() {
        let module = parse_ok("2 ** 3 ** 2\n");
        let Expr::BinaryOp { op, right, .. } = first_expr(&module) else {
            panic!("expected binary op");
        };
        assert_eq!(*op, Operator::Pow);
        assert!(matches!(right.expr, Expr::BinaryOp { op: Operator::Pow, .. }));
    }

    #[test]
    fn chained_comparison_is_one_node() {
        let module = parse_ok("a < b <= c\n");
        let Expr::Compare { ops, comparators, .. } = first_expr(&module) else {
            panic!("expected comparison");
        };
        assert_eq!(ops, &[CmpOperator::Lt, CmpOperator::LtE]);
        assert_eq!(comparators.len(), 2);
    }

    #[test]
    fn not_in_and_is_not_collapse() {
        let module = parse_ok("a not in b\nc is not d\n");
        let Expr::Compare { ops, .. } = first_expr(&module) else { panic!() };
        assert_eq!(ops, &[CmpOperator::NotIn]);
        let Stmt::Expr(second) = &module.body[1].stmt else { panic!() };
        let Expr::Compare { ops, .. } = &second.expr else { panic!() };
        assert_eq!(ops, &[CmpOperator::IsNot]);
    }

    #[test]
    fn bare_commas_form_tuples() {
        let module = parse_ok("a, b = 1, 2\n");
        let Stmt::Assign { targets, value } = &module.body[0].stmt else { panic!() };
        assert!(matches!(targets[0].expr, Expr::Tuple(_)));
        assert!(matches!(value.expr, Expr::Tuple(_)));
    }

    #[test]
    fn one_element_tuple_needs_trailing_comma() {
        let module = parse_ok("(1,)\n(1)\n");
        assert!(matches!(first_expr(&module), Expr::Tuple(items) if items.len() == 1));
        let Stmt::Expr(second) = &module.body[1].stmt else { panic!() };
        assert!(matches!(second.expr, Expr::Literal(Literal::Int(1))));
    }

    #[test]
    fn chained_assignment() {
        let module = parse_ok("a = b = 1\n");
        let Stmt::Assign { targets, .. } = &module.body[0].stmt else { panic!() };
        assert_eq!(targets.len(), 2);
    }

    #[test]
    fn augmented_assignments() {
        let module = parse_ok("x //= 2\ny @= m\nz **= 3\n");
        let Stmt::AugAssign { op, .. } = &module.body[0].stmt else { panic!() };
        assert_eq!(*op, Operator::FloorDiv);
        let Stmt::AugAssign { op, .. } = &module.body[1].stmt else { panic!() };
        assert_eq!(*op, Operator::MatMult);
        let Stmt::AugAssign { op, .. } = &module.body[2].stmt else { panic!() };
        assert_eq!(*op, Operator::Pow);
    }

    #[test]
    fn annotated_assignment() {
        let module = parse_ok("x: int = 5\ny: str\n");
        assert!(matches!(&module.body[0].stmt, Stmt::AnnAssign { value: Some(_), .. }));
        assert!(matches!(&module.body[1].stmt, Stmt::AnnAssign { value: None, .. }));
    }

    #[test]
    fn numeric_literal_values() {
        let module = parse_ok("0x_FF\n1_000\n0b1010\n0o77\n10_000.5\n2j\n");
        assert!(matches!(first_expr(&module), Expr::Literal(Literal::Int(255))));
        let values: Vec<_> = module
            .body
            .iter()
            .map(|stmt| match &stmt.stmt {
                Stmt::Expr(e) => &e.expr,
                _ => panic!(),
            })
            .collect();
        assert!(matches!(values[1], Expr::Literal(Literal::Int(1000))));
        assert!(matches!(values[2], Expr::Literal(Literal::Int(10))));
        assert!(matches!(values[3], Expr::Literal(Literal::Int(63))));
        assert!(matches!(values[4], Expr::Literal(Literal::Float(v)) if (*v - 10000.5).abs() < 1e-9));
        assert!(matches!(values[5], Expr::Literal(Literal::Imaginary(v)) if (*v - 2.0).abs() < 1e-9));
    }

    #[test]
    fn big_integer_literal() {
        let module = parse_ok("123456789012345678901234567890\n");
        assert!(matches!(first_expr(&module), Expr::Literal(Literal::BigInt(_))));
    }

    #[test]
    fn underscore_and_case_round_trip() {
        // Property: the same value regardless of separator placement or
        // base-prefix case.
        let module = parse_ok("0xFF\n0Xf_f\n255\n2_5_5\n");
        for stmt in &module.body {
            let Stmt::Expr(e) = &stmt.stmt else { panic!() };
            assert!(matches!(e.expr, Expr::Literal(Literal::Int(255))));
        }
    }

    #[test]
    fn walrus_requires_name_target() {
        let errors = parse_err("(1 := 2)\n");
        assert!(errors.iter().any(|e| e.message.contains("walrus target not an identifier")));
        assert_eq!(parse_err("(x := 2)\n"), vec![]);
    }

    #[test]
    fn conditional_expression() {
        let module = parse_ok("a if b else c\n");
        assert!(matches!(first_expr(&module), Expr::IfElse { .. }));
    }

    #[test]
    fn lambda_with_defaults() {
        let module = parse_ok("f = lambda a, b=2: a + b\n");
        let Stmt::Assign { value, .. } = &module.body[0].stmt else { panic!() };
        let Expr::Lambda { args, .. } = &value.expr else { panic!() };
        assert_eq!(args.args.len(), 2);
        assert_eq!(args.defaults.len(), 1);
    }

    #[test]
    fn function_parameter_forms() {
        let module = parse_ok("def f(a, b, /, c, d=1, *args, e, f=2, **kwargs):\n    pass\n");
        let Stmt::FunctionDef(def) = &module.body[0].stmt else { panic!() };
        assert_eq!(def.args.posonly.len(), 2);
        assert_eq!(def.args.args.len(), 2);
        assert!(def.args.vararg.is_some());
        assert_eq!(def.args.kwonly.len(), 2);
        assert!(def.args.kw_defaults[0].is_none(), "e has no default");
        assert!(def.args.kw_defaults[1].is_some(), "f defaults to 2");
        assert!(def.args.kwarg.is_some());
    }

    #[test]
    fn decorators_attach() {
        let module = parse_ok("@dec\n@mod.wrap(x)\ndef f():\n    pass\n");
        let Stmt::FunctionDef(def) = &module.body[0].stmt else { panic!() };
        assert_eq!(def.decorators.len(), 2);
    }

    #[test]
    fn class_with_bases_and_keywords() {
        let module = parse_ok("class C(Base, metaclass=Meta):\n    pass\n");
        let Stmt::ClassDef(def) = &module.body[0].stmt else { panic!() };
        assert_eq!(def.bases.len(), 1);
        assert_eq!(def.keywords.len(), 1);
    }

    #[test]
    fn private_names_mangle_in_class_bodies() {
        let module = parse_ok("class C:\n    def m(self):\n        return self.__x\n");
        let Stmt::ClassDef(def) = &module.body[0].stmt else { panic!() };
        let Stmt::FunctionDef(method) = &def.body[0].stmt else { panic!() };
        let Stmt::Return(Some(ret)) = &method.body[0].stmt else { panic!() };
        let Expr::Attribute { attr, .. } = &ret.expr else { panic!() };
        assert_eq!(attr, "_C__x");
    }

    #[test]
    fn comprehension_forms() {
        let module = parse_ok("[x for x in xs if x]\n{x for x in xs}\n{k: v for k, v in xs}\n(x for x in xs)\n");
        assert!(matches!(first_expr(&module), Expr::ListComp { .. }));
        let kinds: Vec<_> = module
            .body
            .iter()
            .map(|stmt| match &stmt.stmt {
                Stmt::Expr(e) => &e.expr,
                _ => panic!(),
            })
            .collect();
        assert!(matches!(kinds[1], Expr::SetComp { .. }));
        assert!(matches!(kinds[2], Expr::DictComp { .. }));
        assert!(matches!(kinds[3], Expr::GeneratorExp { .. }));
    }

    #[test]
    fn comprehension_iterable_stops_before_if() {
        let module = parse_ok("[x for x in xs if x > 0 if x < 10]\n");
        let Expr::ListComp { generators, .. } = first_expr(&module) else { panic!() };
        assert_eq!(generators[0].ifs.len(), 2);
    }

    #[test]
    fn slice_forms() {
        let module = parse_ok("x[1:2:3]\nx[:2]\nx[::2]\nx[1]\nx[1:2, 3]\n");
        assert!(matches!(first_expr(&module), Expr::Subscript { index, .. }
            if matches!(index.expr, Expr::Slice { .. })));
        let Stmt::Expr(last) = &module.body[4].stmt else { panic!() };
        let Expr::Subscript { index, .. } = &last.expr else { panic!() };
        assert!(matches!(index.expr, Expr::Tuple(_)));
    }

    #[test]
    fn call_argument_forms() {
        let module = parse_ok("f(1, x, key=2, *rest, **kw)\n");
        let Expr::Call { args, keywords, .. } = first_expr(&module) else { panic!() };
        assert_eq!(args.len(), 3);
        assert!(matches!(args[2].expr, Expr::Starred(_)));
        assert_eq!(keywords.len(), 2);
        assert!(keywords[1].name.is_none());
    }

    #[test]
    fn positional_after_keyword_is_reported() {
        let errors = parse_err("f(a=1, 2)\n");
        assert!(errors.iter().any(|e| e.message.contains("positional argument follows")));
    }

    #[test]
    fn try_except_else_finally() {
        let module = parse_ok("try:\n    a\nexcept ValueError as e:\n    b\nexcept:\n    c\nelse:\n    d\nfinally:\n    e\n");
        let Stmt::Try {
            handlers,
            orelse,
            finalbody,
            ..
        } = &module.body[0].stmt
        else {
            panic!()
        };
        assert_eq!(handlers.len(), 2);
        assert_eq!(handlers[0].name.as_deref(), Some("e"));
        assert!(handlers[1].exc_type.is_none());
        assert_eq!(orelse.len(), 1);
        assert_eq!(finalbody.len(), 1);
    }

    #[test]
    fn bare_except_must_be_last() {
        let errors = parse_err("try:\n    a\nexcept:\n    b\nexcept ValueError:\n    c\n");
        assert!(errors.iter().any(|e| e.message.contains("must be last")));
    }

    #[test]
    fn with_items_and_targets() {
        let module = parse_ok("with open(p) as f, lock:\n    pass\n");
        let Stmt::With { items, .. } = &module.body[0].stmt else { panic!() };
        assert_eq!(items.len(), 2);
        assert!(items[0].target.is_some());
        assert!(items[1].target.is_none());
    }

    #[test]
    fn import_forms() {
        let module = parse_ok("import os.path as p, sys\nfrom ..pkg import mod as m, other\nfrom x import *\n");
        let Stmt::Import { names } = &module.body[0].stmt else { panic!() };
        assert_eq!(names[0].name, "os.path");
        assert_eq!(names[0].alias.as_deref(), Some("p"));
        let Stmt::ImportFrom { module: m, names, star } = &module.body[1].stmt else { panic!() };
        assert_eq!(m, "..pkg");
        assert_eq!(names.len(), 2);
        assert!(!star);
        let Stmt::ImportFrom { star, .. } = &module.body[2].stmt else { panic!() };
        assert!(star);
    }

    #[test]
    fn match_statement_patterns() {
        let source = "\
match p:
    case (x, y):
        pass
    case [1, *rest]:
        pass
    case {'k': v, **extra}:
        pass
    case Point(0, y=q) | None:
        pass
    case _ if q:
        pass
";
        let module = parse_ok(source);
        let Stmt::Match { cases, .. } = &module.body[0].stmt else { panic!() };
        assert_eq!(cases.len(), 5);
        assert!(matches!(cases[0].pattern.pattern, Pattern::Sequence { .. }));
        let Pattern::Sequence { patterns } = &cases[1].pattern.pattern else { panic!() };
        assert!(matches!(patterns[1].pattern, Pattern::Star { name: Some(ref n) } if n == "rest"));
        let Pattern::Mapping { rest, .. } = &cases[2].pattern.pattern else { panic!() };
        assert_eq!(rest.as_deref(), Some("extra"));
        assert!(matches!(cases[3].pattern.pattern, Pattern::Or(_)));
        assert!(matches!(cases[4].pattern.pattern, Pattern::Capture { name: None }));
        assert!(cases[4].guard.is_some());
    }

    #[test]
    fn match_as_identifier_still_works() {
        let module = parse_ok("match = 5\nresult = match + 1\nmatch(x)\n");
        assert!(matches!(module.body[0].stmt, Stmt::Assign { .. }));
        assert!(matches!(module.body[2].stmt, Stmt::Expr(_)));
    }

    #[test]
    fn positional_pattern_after_keyword_is_reported() {
        let errors = parse_err("match p:\n    case C(x=1, 2):\n        pass\n");
        assert!(errors.iter().any(|e| e.message.contains("positional pattern follows keyword pattern")));
    }

    #[test]
    fn type_alias_statement() {
        let module = parse_ok("type Vector = list[float]\ntype Pair[T] = tuple[T, T]\n");
        let Stmt::TypeAlias { name, .. } = &module.body[0].stmt else { panic!() };
        assert_eq!(name, "Vector");
        let Stmt::TypeAlias { type_params, .. } = &module.body[1].stmt else { panic!() };
        assert_eq!(type_params, &["T".to_owned()]);
    }

    #[test]
    fn type_as_identifier_still_works() {
        let module = parse_ok("type = int\nprint(type)\n");
        assert!(matches!(module.body[0].stmt, Stmt::Assign { .. }));
    }

    #[test]
    fn fstring_parts_and_conversions() {
        let module = parse_ok("f\"a{x!r}b{y:>10}c{z}\"\n");
        let Expr::FString(parts) = first_expr(&module) else { panic!() };
        assert_eq!(parts.len(), 6);
        let FStringPart::Expr { conversion, .. } = &parts[1] else { panic!() };
        assert_eq!(*conversion, Some(Conversion::Repr));
        let FStringPart::Expr { format_spec, .. } = &parts[3] else { panic!() };
        assert_eq!(format_spec.as_deref(), Some(">10"));
    }

    #[test]
    fn fstring_double_braces_are_literal() {
        let module = parse_ok("f\"{{literal}}\"\n");
        let Expr::FString(parts) = first_expr(&module) else { panic!() };
        assert_eq!(parts.len(), 1);
        let FStringPart::Literal(text) = &parts[0] else { panic!() };
        assert_eq!(text, "{literal}");
    }

    #[test]
    fn empty_fstring_expression_is_reported() {
        let errors = parse_err("f\"{}\"\n");
        assert!(errors.iter().any(|e| e.message.contains("empty f-string expression")));
    }

    #[test]
    fn unmatched_brace_is_reported() {
        let errors = parse_err("f\"{x\"\n");
        assert!(errors.iter().any(|e| e.message.contains("unmatched '{'")));
    }

    #[test]
    fn fstring_expression_positions_land_in_file() {
        let (module, errors) = parse_module_text("s = f\"v={value}\"\n", "test.py");
        assert_eq!(errors, vec![]);
        let Stmt::Assign { value, .. } = &module.body[0].stmt else { panic!() };
        let Expr::FString(parts) = &value.expr else { panic!() };
        let FStringPart::Expr { expr, .. } = &parts[1] else { panic!() };
        // `value` starts after `s = f"v={`.
        assert_eq!(expr.position.start().line, 1);
        assert!(expr.position.start().column > 9);
    }

    #[test]
    fn adjacent_strings_concatenate() {
        let module = parse_ok("\"a\" \"b\"\n");
        assert!(matches!(first_expr(&module), Expr::Literal(Literal::Str(s)) if s == "ab"));
    }

    #[test]
    fn adjacent_string_and_fstring_promote() {
        let module = parse_ok("\"a\" f\"{x}\"\n");
        let Expr::FString(parts) = first_expr(&module) else { panic!() };
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn mixing_bytes_and_str_is_reported() {
        let errors = parse_err("b\"a\" \"b\"\n");
        assert!(errors.iter().any(|e| e.message.contains("cannot mix bytes")));
    }

    #[test]
    fn error_recovery_continues_to_next_statement() {
        let (module, errors) = parse_module_text("x = = 1\ny = 2\n", "test.py");
        assert!(!errors.is_empty());
        assert!(module.body.iter().any(|stmt| matches!(
            &stmt.stmt,
            Stmt::Assign { targets, .. } if matches!(&targets[0].expr, Expr::Name(n) if n == "y")
        )));
    }

    #[test]
    fn deeply_nested_input_is_rejected_not_crashed() {
        let source = format!("x = {}1{}\n", "(".repeat(300), ")".repeat(300));
        let (_, errors) = parse_module_text(&source, "test.py");
        assert!(errors.iter().any(|e| e.message.contains("nested too deeply")));
    }

    #[test]
    fn yield_forms() {
        let module = parse_ok("def g():\n    yield\n    yield 1\n    yield 1, 2\n    x = yield from other\n");
        let Stmt::FunctionDef(def) = &module.body[0].stmt else { panic!() };
        assert!(matches!(
            &def.body[0].stmt,
            Stmt::Expr(e) if matches!(e.expr, Expr::Yield(None))
        ));
        assert!(matches!(
            &def.body[2].stmt,
            Stmt::Expr(e) if matches!(&e.expr, Expr::Yield(Some(v)) if matches!(v.expr, Expr::Tuple(_)))
        ));
        assert!(matches!(
            &def.body[3].stmt,
            Stmt::Assign { value, .. } if matches!(value.expr, Expr::YieldFrom(_))
        ));
    }
}
