//! Lexical analysis: source text to tokens.
//!
//! The lexer tracks indentation with a stack of column widths, suppresses
//! newlines inside brackets, and decodes string and number literals. It
//! never aborts: errors are accumulated with positions and the stream always
//! terminates with [`TokenKind::EndOfFile`].

use smallvec::{SmallVec, smallvec};
use unicode_ident::{is_xid_continue, is_xid_start};

use crate::{
    error::CompileError,
    location::{CodeLoc, CodeRange},
    token::{Token, TokenKind, keyword_kind},
};

const BOM: char = '\u{feff}';

/// A tab stop advances the indentation width to the next multiple of this.
const TAB_SIZE: u32 = 8;

/// Tokenizes an entire source string.
///
/// Comments are dropped from the returned stream; use [`Lexer::next_token`]
/// directly to observe them. The stream always ends with exactly one
/// [`TokenKind::EndOfFile`] token and balanced indent/dedent pairs.
#[must_use]
pub fn tokenize(source: &str, filename: &str) -> (Vec<Token>, Vec<CompileError>) {
    let mut lexer = Lexer::new(source, filename);
    let mut tokens = Vec::new();
    loop {
        let token = lexer.next_token();
        if token.kind == TokenKind::Comment {
            continue;
        }
        let done = token.kind == TokenKind::EndOfFile;
        tokens.push(token);
        if done {
            break;
        }
    }
    (tokens, lexer.errors)
}

/// Which quote-prefix letters were present on a string literal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct StrFlags {
    raw: bool,
    bytes: bool,
    fstring: bool,
}

/// Line-boundary state of the lexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// At the start of a logical line: indentation applies.
    LineStart,
    /// Inside a logical line that has produced at least one token.
    InLine,
}

/// A streaming lexer over one source string.
///
/// Positions are tracked incrementally as the cursor advances; no backward
/// scanning is ever needed. A lexer can be given a non-zero origin so that
/// f-string bodies re-tokenized by the parser report positions in the
/// enclosing file.
pub struct Lexer<'src> {
    source: &'src str,
    filename: String,

    /// Byte position within `source`.
    pos: usize,
    /// Current line (1-indexed).
    line: u32,
    /// Current column (1-indexed, characters).
    column: u32,
    /// Added to `pos` when reporting offsets, for sub-lexers over slices.
    offset_bias: u32,

    /// Stack of indentation widths, always starting at `[0]`.
    indents: SmallVec<[u32; 16]>,
    /// Dedent tokens still owed from the last indentation change or EOF.
    pending_dedents: u32,
    /// Depth of open `(`/`[`/`{` brackets; newlines are skipped while > 0.
    nesting: u32,
    state: State,

    errors: Vec<CompileError>,
}

impl<'src> Lexer<'src> {
    /// Creates a lexer for a complete source file.
    #[must_use]
    pub fn new(source: &'src str, filename: &str) -> Self {
        let mut lexer = Self::with_origin(source, filename, CodeLoc::start());
        // A BOM does not count towards the first line's indentation.
        if lexer.peek() == Some(BOM) {
            lexer.advance();
        }
        lexer
    }

    /// Creates a lexer over a slice of a larger file, reporting positions as
    /// if lexing started at `origin`. Used for f-string bodies.
    #[must_use]
    pub(crate) fn with_origin(source: &'src str, filename: &str, origin: CodeLoc) -> Self {
        Self {
            source,
            filename: filename.to_owned(),
            pos: 0,
            line: origin.line,
            column: origin.column,
            offset_bias: origin.offset,
            indents: smallvec![0],
            pending_dedents: 0,
            nesting: 0,
            state: State::LineStart,
            errors: Vec::new(),
        }
    }

    /// Consumes the lexer, returning accumulated errors.
    #[must_use]
    pub fn into_errors(self) -> Vec<CompileError> {
        self.errors
    }

    fn loc(&self) -> CodeLoc {
        CodeLoc {
            line: self.line,
            column: self.column,
            offset: self.offset_bias + u32::try_from(self.pos).unwrap_or(u32::MAX),
        }
    }

    fn peek(&self) -> Option<char> {
        self.source[self.pos..].chars().next()
    }

    fn peek_at(&self, n: usize) -> Option<char> {
        self.source[self.pos..].chars().nth(n)
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.source.len()
    }

    fn error(&mut self, range: CodeRange, message: impl Into<String>) {
        self.errors.push(CompileError::new(&self.filename, range, message));
    }

    fn error_here(&mut self, message: impl Into<String>) {
        let here = self.loc();
        self.error(CodeRange::new(here, here), message);
    }

    /// Produces the next token.
    ///
    /// Unlike [`tokenize`], comments are surfaced as [`TokenKind::Comment`].
    pub fn next_token(&mut self) -> Token {
        loop {
            if self.pending_dedents > 0 {
                self.pending_dedents -= 1;
                let here = self.loc();
                return Token::new(TokenKind::Dedent, here, here);
            }

            if self.at_end() {
                return self.finish();
            }

            if self.state == State::LineStart && self.nesting == 0 {
                match self.handle_line_start() {
                    LineStart::Token(token) => return token,
                    LineStart::BlankLine => continue,
                    LineStart::Content => {}
                }
            }

            self.skip_horizontal_whitespace();
            let start = self.loc();
            let Some(ch) = self.peek() else {
                continue;
            };

            match ch {
                '#' => return self.lex_comment(),
                '\r' | '\n' => {
                    self.consume_newline();
                    if self.nesting > 0 {
                        // Implicit line joining inside brackets.
                        continue;
                    }
                    self.state = State::LineStart;
                    return Token::new(TokenKind::Newline, start, self.loc());
                }
                '\\' => {
                    self.advance();
                    if matches!(self.peek(), Some('\r' | '\n')) {
                        self.consume_newline();
                        continue;
                    }
                    self.error(
                        CodeRange::new(start, self.loc()),
                        "unexpected character after line continuation character",
                    );
                    return Token::with_literal(TokenKind::Illegal, start, self.loc(), "\\".to_owned());
                }
                '0'..='9' => return self.lex_number(),
                '.' => {
                    if matches!(self.peek_at(1), Some('0'..='9')) {
                        return self.lex_number();
                    }
                    self.advance();
                    if self.peek() == Some('.') && self.peek_at(1) == Some('.') {
                        self.advance();
                        self.advance();
                        return Token::new(TokenKind::Ellipsis, start, self.loc());
                    }
                    return Token::new(TokenKind::Dot, start, self.loc());
                }
                '\'' | '"' => return self.lex_string(StrFlags::default(), start),
                c if is_identifier_start(c) => {
                    if let Some(flags) = self.string_prefix() {
                        return self.lex_prefixed_string(flags, start);
                    }
                    return self.lex_identifier(start);
                }
                _ => {
                    if let Some(token) = self.lex_operator(start) {
                        return token;
                    }
                    self.advance();
                    self.error(CodeRange::new(start, self.loc()), format!("unexpected character {ch:?}"));
                    return Token::with_literal(TokenKind::Illegal, start, self.loc(), ch.to_string());
                }
            }
        }
    }

    /// Emits the trailing newline / dedents / EOF sequence.
    fn finish(&mut self) -> Token {
        let here = self.loc();
        if self.state == State::InLine {
            self.state = State::LineStart;
            return Token::new(TokenKind::Newline, here, here);
        }
        if self.indents.len() > 1 {
            self.indents.pop();
            return Token::new(TokenKind::Dedent, here, here);
        }
        Token::new(TokenKind::EndOfFile, here, here)
    }

    fn skip_horizontal_whitespace(&mut self) {
        while matches!(self.peek(), Some(' ' | '\t' | '\x0c')) {
            self.advance();
        }
    }

    /// Consumes `\n`, `\r`, or `\r\n`.
    fn consume_newline(&mut self) {
        if self.eat('\r') {
            if !self.eat('\n') {
                // A lone carriage return still ends the line.
                self.line += 1;
                self.column = 1;
            }
        } else {
            self.eat('\n');
        }
    }

    /// Measures indentation at the start of a logical line and compares it
    /// against the indentation stack.
    fn handle_line_start(&mut self) -> LineStart {
        let start = self.loc();
        let mut width: u32 = 0;
        loop {
            match self.peek() {
                Some(' ') => {
                    width += 1;
                    self.advance();
                }
                Some('\t') => {
                    width = width / TAB_SIZE * TAB_SIZE + TAB_SIZE;
                    self.advance();
                }
                Some('\x0c') => {
                    width = 0;
                    self.advance();
                }
                _ => break,
            }
        }

        match self.peek() {
            // Blank and comment-only lines never drive INDENT/DEDENT.
            None => LineStart::Content,
            Some('\r' | '\n') => {
                self.consume_newline();
                LineStart::BlankLine
            }
            Some('#') => LineStart::Token(self.lex_comment()),
            _ => {
                self.state = State::InLine;
                let current = *self.indents.last().unwrap_or(&0);
                if width > current {
                    self.indents.push(width);
                    return LineStart::Token(Token::new(TokenKind::Indent, start, self.loc()));
                }
                if width < current {
                    let mut dedents: u32 = 0;
                    while self.indents.len() > 1 && width < *self.indents.last().unwrap_or(&0) {
                        self.indents.pop();
                        dedents += 1;
                    }
                    if width != *self.indents.last().unwrap_or(&0) {
                        self.error(
                            CodeRange::new(start, self.loc()),
                            "unindent does not match any outer indentation level",
                        );
                    }
                    self.pending_dedents = dedents.saturating_sub(1);
                    return LineStart::Token(Token::new(TokenKind::Dedent, start, self.loc()));
                }
                LineStart::Content
            }
        }
    }

    fn lex_comment(&mut self) -> Token {
        let start = self.loc();
        let text_start = self.pos;
        while !matches!(self.peek(), None | Some('\r' | '\n')) {
            self.advance();
        }
        let text = self.source[text_start..self.pos].to_owned();
        Token::with_literal(TokenKind::Comment, start, self.loc(), text)
    }

    fn lex_identifier(&mut self, start: CodeLoc) -> Token {
        let start_pos = self.pos;
        // ASCII fast path; fall back to Unicode classification on the first
        // byte outside it.
        while let Some(ch) = self.peek() {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                self.advance();
            } else if !ch.is_ascii() && is_xid_continue(ch) {
                self.advance();
            } else {
                break;
            }
        }
        let lexeme = &self.source[start_pos..self.pos];
        match keyword_kind(lexeme) {
            Some(kind) => Token::new(kind, start, self.loc()),
            None => Token::with_literal(TokenKind::Identifier, start, self.loc(), lexeme.to_owned()),
        }
    }

    /// Checks whether the cursor sits on a string-prefix run (`r`, `b`, `f`,
    /// `u`, or a valid two-letter combination) immediately followed by a quote.
    fn string_prefix(&self) -> Option<StrFlags> {
        let mut flags = StrFlags::default();
        let mut len = 0;
        let mut has_u = false;
        for i in 0..2 {
            match self.peek_at(i) {
                Some('r' | 'R') if !flags.raw => flags.raw = true,
                Some('b' | 'B') if !flags.bytes => flags.bytes = true,
                Some('f' | 'F') if !flags.fstring => flags.fstring = true,
                Some('u' | 'U') if !has_u => has_u = true,
                _ => break,
            }
            len = i + 1;
        }
        if len == 0 || !matches!(self.peek_at(len), Some('\'' | '"')) {
            return None;
        }
        // `u` combines with nothing; `bf` is not a thing.
        if has_u && (len > 1 || flags.raw || flags.bytes || flags.fstring) {
            return None;
        }
        if flags.bytes && flags.fstring {
            return None;
        }
        Some(flags)
    }

    fn lex_prefixed_string(&mut self, flags: StrFlags, start: CodeLoc) -> Token {
        // Consume the prefix letters; the quote handling is shared.
        while !matches!(self.peek(), Some('\'' | '"')) {
            if self.advance().is_none() {
                break;
            }
        }
        self.lex_string(flags, start)
    }

    /// Lexes a string body after any prefix, decoding escapes as dictated by
    /// the prefix flags.
    fn lex_string(&mut self, flags: StrFlags, start: CodeLoc) -> Token {
        let Some(quote) = self.advance() else {
            return Token::new(TokenKind::Illegal, start, self.loc());
        };
        let triple = self.peek() == Some(quote) && self.peek_at(1) == Some(quote);
        if triple {
            self.advance();
            self.advance();
        }

        let body_origin = self.loc();
        let body_start = self.pos;
        let mut terminated = false;
        loop {
            match self.peek() {
                None => break,
                Some('\\') => {
                    // The escaped character never terminates the string, even
                    // in raw mode where it is kept verbatim.
                    self.advance();
                    if self.peek().is_some() {
                        self.advance();
                    }
                }
                Some(c) if c == quote => {
                    if triple {
                        if self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote) {
                            terminated = true;
                            break;
                        }
                        self.advance();
                    } else {
                        terminated = true;
                        break;
                    }
                }
                Some('\r' | '\n') if !triple => break,
                Some(_) => {
                    self.advance();
                }
            }
        }

        let body = &self.source[body_start..self.pos];
        if terminated {
            self.advance();
            if triple {
                self.advance();
                self.advance();
            }
        } else {
            let kind = if flags.fstring { "f-string" } else { "string" };
            self.error(CodeRange::new(start, self.loc()), format!("unterminated {kind} literal"));
        }
        let end = self.loc();

        if flags.fstring {
            let kind = if flags.raw { TokenKind::RawFString } else { TokenKind::FString };
            return Token::with_literal(kind, start, end, body.to_owned());
        }
        if flags.bytes {
            let decoded = if flags.raw {
                body.chars().collect::<String>()
            } else {
                let bytes = decode_bytes_escapes(body, body_origin, &self.filename, &mut self.errors);
                bytes.into_iter().map(char::from).collect()
            };
            return Token::with_literal(TokenKind::Bytes, start, end, decoded);
        }
        let decoded = if flags.raw {
            body.to_owned()
        } else {
            decode_text_escapes(body, body_origin, &self.filename, &mut self.errors)
        };
        Token::with_literal(TokenKind::Str, start, end, decoded)
    }

    /// Lexes a numeric literal, keeping the raw lexeme as the payload.
    ///
    /// The numeric value is computed by the parser so that the constant pool
    /// stores the parsed number while the token retains the source spelling.
    fn lex_number(&mut self) -> Token {
        let start = self.loc();
        let start_pos = self.pos;

        if self.peek() == Some('0') && matches!(self.peek_at(1), Some('x' | 'X' | 'o' | 'O' | 'b' | 'B')) {
            self.advance();
            let radix_char = self.advance().unwrap_or('x');
            let radix = match radix_char {
                'x' | 'X' => 16,
                'o' | 'O' => 8,
                _ => 2,
            };
            let digits = self.scan_digits(radix);
            if digits == 0 {
                let spelled = match radix {
                    16 => "hexadecimal",
                    8 => "octal",
                    _ => "binary",
                };
                self.error(CodeRange::new(start, self.loc()), format!("invalid {spelled} literal"));
            }
            let lexeme = self.source[start_pos..self.pos].to_owned();
            return Token::with_literal(TokenKind::Int, start, self.loc(), lexeme);
        }

        let mut is_float = false;
        self.scan_digits(10);

        if self.peek() == Some('.') {
            // A decimal point is only part of the number when followed by a
            // digit or by a character that cannot start an identifier, so
            // `x.y`-style attribute access on literals still lexes as three
            // tokens.
            let next = self.peek_at(1);
            let consume = match next {
                Some('0'..='9') => true,
                Some(c) => !is_identifier_start(c) && c != '.',
                None => true,
            };
            if consume {
                is_float = true;
                self.advance();
                self.scan_digits(10);
            }
        }

        if matches!(self.peek(), Some('e' | 'E')) {
            let mut lookahead = 1;
            if matches!(self.peek_at(1), Some('+' | '-')) {
                lookahead = 2;
            }
            if matches!(self.peek_at(lookahead), Some('0'..='9')) {
                is_float = true;
                self.advance();
                if matches!(self.peek(), Some('+' | '-')) {
                    self.advance();
                }
                self.scan_digits(10);
            }
        }

        if matches!(self.peek(), Some('j' | 'J')) {
            let lexeme = self.source[start_pos..self.pos].to_owned();
            self.advance();
            return Token::with_literal(TokenKind::Imaginary, start, self.loc(), lexeme);
        }

        let lexeme = self.source[start_pos..self.pos].to_owned();
        let kind = if is_float { TokenKind::Float } else { TokenKind::Int };
        Token::with_literal(kind, start, self.loc(), lexeme)
    }

    /// Scans digits of the given radix with `_` separators, returning the
    /// digit count. Misplaced separators are reported but scanning continues.
    ///
    /// A leading underscore is only reachable right after a radix prefix
    /// (`0x_FF`), where Python permits it; a doubled or trailing underscore
    /// is an error everywhere.
    fn scan_digits(&mut self, radix: u32) -> u32 {
        let mut count = 0;
        let mut last_was_underscore = false;
        loop {
            match self.peek() {
                Some('_') => {
                    if last_was_underscore {
                        self.error_here("invalid use of underscore in numeric literal");
                    }
                    last_was_underscore = true;
                    self.advance();
                }
                Some(c) if c.is_digit(radix) => {
                    count += 1;
                    last_was_underscore = false;
                    self.advance();
                }
                _ => break,
            }
        }
        if last_was_underscore {
            self.error_here("invalid use of underscore in numeric literal");
        }
        count
    }

    /// Lexes operator and delimiter tokens, tracking bracket depth.
    fn lex_operator(&mut self, start: CodeLoc) -> Option<Token> {
        let ch = self.peek()?;
        let kind = match ch {
            '(' => {
                self.nesting += 1;
                TokenKind::LeftParen
            }
            ')' => {
                self.nesting = self.nesting.saturating_sub(1);
                TokenKind::RightParen
            }
            '[' => {
                self.nesting += 1;
                TokenKind::LeftBracket
            }
            ']' => {
                self.nesting = self.nesting.saturating_sub(1);
                TokenKind::RightBracket
            }
            '{' => {
                self.nesting += 1;
                TokenKind::LeftBrace
            }
            '}' => {
                self.nesting = self.nesting.saturating_sub(1);
                TokenKind::RightBrace
            }
            ',' => TokenKind::Comma,
            ';' => TokenKind::Semicolon,
            '~' => TokenKind::Tilde,
            ':' => {
                self.advance();
                let kind = if self.eat('=') { TokenKind::ColonEqual } else { TokenKind::Colon };
                return Some(Token::new(kind, start, self.loc()));
            }
            '+' => {
                self.advance();
                let kind = if self.eat('=') { TokenKind::PlusEqual } else { TokenKind::Plus };
                return Some(Token::new(kind, start, self.loc()));
            }
            '-' => {
                self.advance();
                let kind = if self.eat('=') {
                    TokenKind::MinusEqual
                } else if self.eat('>') {
                    TokenKind::Arrow
                } else {
                    TokenKind::Minus
                };
                return Some(Token::new(kind, start, self.loc()));
            }
            '*' => {
                self.advance();
                let kind = if self.eat('=') {
                    TokenKind::StarEqual
                } else if self.eat('*') {
                    if self.eat('=') { TokenKind::DoubleStarEqual } else { TokenKind::DoubleStar }
                } else {
                    TokenKind::Star
                };
                return Some(Token::new(kind, start, self.loc()));
            }
            '/' => {
                self.advance();
                let kind = if self.eat('=') {
                    TokenKind::SlashEqual
                } else if self.eat('/') {
                    if self.eat('=') { TokenKind::DoubleSlashEqual } else { TokenKind::DoubleSlash }
                } else {
                    TokenKind::Slash
                };
                return Some(Token::new(kind, start, self.loc()));
            }
            '%' => {
                self.advance();
                let kind = if self.eat('=') { TokenKind::PercentEqual } else { TokenKind::Percent };
                return Some(Token::new(kind, start, self.loc()));
            }
            '@' => {
                self.advance();
                let kind = if self.eat('=') { TokenKind::AtEqual } else { TokenKind::At };
                return Some(Token::new(kind, start, self.loc()));
            }
            '&' => {
                self.advance();
                let kind = if self.eat('=') { TokenKind::AmpEqual } else { TokenKind::Amp };
                return Some(Token::new(kind, start, self.loc()));
            }
            '|' => {
                self.advance();
                let kind = if self.eat('=') { TokenKind::PipeEqual } else { TokenKind::Pipe };
                return Some(Token::new(kind, start, self.loc()));
            }
            '^' => {
                self.advance();
                let kind = if self.eat('=') { TokenKind::CaretEqual } else { TokenKind::Caret };
                return Some(Token::new(kind, start, self.loc()));
            }
            '=' => {
                self.advance();
                let kind = if self.eat('=') { TokenKind::EqEqual } else { TokenKind::Assign };
                return Some(Token::new(kind, start, self.loc()));
            }
            '!' => {
                if self.peek_at(1) == Some('=') {
                    self.advance();
                    self.advance();
                    return Some(Token::new(TokenKind::NotEqual, start, self.loc()));
                }
                return None;
            }
            '<' => {
                self.advance();
                let kind = if self.eat('=') {
                    TokenKind::LessEqual
                } else if self.eat('<') {
                    if self.eat('=') { TokenKind::LeftShiftEqual } else { TokenKind::LeftShift }
                } else {
                    TokenKind::Less
                };
                return Some(Token::new(kind, start, self.loc()));
            }
            '>' => {
                self.advance();
                let kind = if self.eat('=') {
                    TokenKind::GreaterEqual
                } else if self.eat('>') {
                    if self.eat('=') { TokenKind::RightShiftEqual } else { TokenKind::RightShift }
                } else {
                    TokenKind::Greater
                };
                return Some(Token::new(kind, start, self.loc()));
            }
            _ => return None,
        };
        self.advance();
        Some(Token::new(kind, start, self.loc()))
    }
}

/// Outcome of indentation handling at the start of a logical line.
enum LineStart {
    /// An INDENT, DEDENT, or comment token to emit.
    Token(Token),
    /// The line was blank; restart at the next line.
    BlankLine,
    /// Indentation unchanged; continue lexing the line's content.
    Content,
}

fn is_identifier_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || (!c.is_ascii() && is_xid_start(c))
}

/// Advances a location over one character of already-lexed text.
pub(crate) fn bump_loc(loc: CodeLoc, ch: char) -> CodeLoc {
    let offset = loc.offset + u32::try_from(ch.len_utf8()).unwrap_or(1);
    if ch == '\n' {
        CodeLoc::new(loc.line + 1, 1, offset)
    } else {
        CodeLoc::new(loc.line, loc.column + 1, offset)
    }
}

/// Decodes the escape sequences of a text (non-raw, non-bytes) string body.
///
/// `origin` is the location of the first body character, used to position
/// error records. Unknown escapes keep the backslash and the character.
pub(crate) fn decode_text_escapes(
    raw: &str,
    origin: CodeLoc,
    filename: &str,
    errors: &mut Vec<CompileError>,
) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    let mut loc = origin;
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            loc = bump_loc(loc, ch);
            continue;
        }
        let escape_start = loc;
        loc = bump_loc(loc, ch);
        let Some(next) = chars.next() else {
            out.push('\\');
            break;
        };
        loc = bump_loc(loc, next);
        match next {
            '\n' => {}
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    let lf = chars.next().unwrap_or('\n');
                    loc = bump_loc(loc, lf);
                }
            }
            '\\' => out.push('\\'),
            '\'' => out.push('\''),
            '"' => out.push('"'),
            'a' => out.push('\x07'),
            'b' => out.push('\x08'),
            'f' => out.push('\x0c'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            'v' => out.push('\x0b'),
            '0'..='7' => {
                let value = decode_octal(next, &mut chars, &mut loc, escape_start, filename, errors);
                out.push(char::from(value));
            }
            'x' => {
                if let Some(value) = decode_hex_digits(&mut chars, &mut loc, 2, escape_start, filename, errors) {
                    out.push(char::from(u8::try_from(value).unwrap_or(u8::MAX)));
                }
            }
            'u' => {
                if let Some(value) = decode_hex_digits(&mut chars, &mut loc, 4, escape_start, filename, errors) {
                    out.push(char::from_u32(value).unwrap_or(char::REPLACEMENT_CHARACTER));
                }
            }
            'U' => {
                if let Some(value) = decode_hex_digits(&mut chars, &mut loc, 8, escape_start, filename, errors) {
                    match char::from_u32(value) {
                        Some(c) => out.push(c),
                        None => {
                            errors.push(CompileError::new(
                                filename,
                                CodeRange::new(escape_start, loc),
                                format!("invalid \\U escape: {value:#x} is not a valid code point"),
                            ));
                            out.push(char::REPLACEMENT_CHARACTER);
                        }
                    }
                }
            }
            'N' => {
                if chars.peek() == Some(&'{') {
                    let brace = chars.next().unwrap_or('{');
                    loc = bump_loc(loc, brace);
                    let mut name = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        loc = bump_loc(loc, c);
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        name.push(c);
                    }
                    if !closed {
                        errors.push(CompileError::new(
                            filename,
                            CodeRange::new(escape_start, loc),
                            "malformed \\N character name escape",
                        ));
                    }
                    match unicode_names2::character(&name) {
                        Some(c) => out.push(c),
                        None => {
                            errors.push(CompileError::new(
                                filename,
                                CodeRange::new(escape_start, loc),
                                format!("unknown Unicode character name {name:?}"),
                            ));
                            out.push(char::REPLACEMENT_CHARACTER);
                        }
                    }
                } else {
                    out.push('\\');
                    out.push('N');
                }
            }
            other => {
                // Permissive: unknown escapes keep the backslash.
                out.push('\\');
                out.push(other);
            }
        }
    }
    out
}

/// Decodes the escape sequences of a bytes literal body.
///
/// `\u`, `\U`, and `\N` are not recognized in bytes literals and stay
/// verbatim; characters above U+00FF are reported as errors.
pub(crate) fn decode_bytes_escapes(
    raw: &str,
    origin: CodeLoc,
    filename: &str,
    errors: &mut Vec<CompileError>,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    let mut loc = origin;
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            let code = u32::from(ch);
            if code > 0xFF {
                errors.push(CompileError::new(
                    filename,
                    CodeRange::new(loc, bump_loc(loc, ch)),
                    "bytes can only contain ASCII literal characters",
                ));
                out.push(b'?');
            } else {
                out.push(u8::try_from(code).unwrap_or(b'?'));
            }
            loc = bump_loc(loc, ch);
            continue;
        }
        let escape_start = loc;
        loc = bump_loc(loc, ch);
        let Some(next) = chars.next() else {
            out.push(b'\\');
            break;
        };
        loc = bump_loc(loc, next);
        match next {
            '\n' => {}
            '\\' => out.push(b'\\'),
            '\'' => out.push(b'\''),
            '"' => out.push(b'"'),
            'a' => out.push(0x07),
            'b' => out.push(0x08),
            'f' => out.push(0x0c),
            'n' => out.push(b'\n'),
            'r' => out.push(b'\r'),
            't' => out.push(b'\t'),
            'v' => out.push(0x0b),
            '0'..='7' => {
                let value = decode_octal(next, &mut chars, &mut loc, escape_start, filename, errors);
                out.push(value);
            }
            'x' => {
                if let Some(value) = decode_hex_digits(&mut chars, &mut loc, 2, escape_start, filename, errors) {
                    out.push(u8::try_from(value).unwrap_or(u8::MAX));
                }
            }
            other => {
                out.push(b'\\');
                let code = u32::from(other);
                out.push(u8::try_from(code).unwrap_or(b'?'));
            }
        }
    }
    out
}

/// Decodes up to three octal digits, the first already consumed.
///
/// Values above the three-digit maximum `0o377` are reported and clamped.
fn decode_octal(
    first: char,
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    loc: &mut CodeLoc,
    escape_start: CodeLoc,
    filename: &str,
    errors: &mut Vec<CompileError>,
) -> u8 {
    let mut value = first.to_digit(8).unwrap_or(0);
    for _ in 0..2 {
        let Some(&c) = chars.peek() else { break };
        let Some(digit) = c.to_digit(8) else { break };
        chars.next();
        *loc = bump_loc(*loc, c);
        value = value * 8 + digit;
    }
    match u8::try_from(value) {
        Ok(byte) => byte,
        Err(_) => {
            errors.push(CompileError::new(
                filename,
                CodeRange::new(escape_start, *loc),
                format!("octal escape value {value:#o} out of range"),
            ));
            u8::MAX
        }
    }
}

/// Decodes exactly `count` hex digits, reporting an error on a short read.
fn decode_hex_digits(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    loc: &mut CodeLoc,
    count: u32,
    escape_start: CodeLoc,
    filename: &str,
    errors: &mut Vec<CompileError>,
) -> Option<u32> {
    let mut value: u32 = 0;
    for _ in 0..count {
        let Some(&c) = chars.peek() else {
            errors.push(CompileError::new(
                filename,
                CodeRange::new(escape_start, *loc),
                format!("truncated escape: expected {count} hex digits"),
            ));
            return None;
        };
        let Some(digit) = c.to_digit(16) else {
            errors.push(CompileError::new(
                filename,
                CodeRange::new(escape_start, *loc),
                format!("invalid hex digit {c:?} in escape"),
            ));
            return None;
        };
        chars.next();
        *loc = bump_loc(*loc, c);
        value = value.wrapping_mul(16).wrapping_add(digit);
    }
    Some(value)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let (tokens, _) = tokenize(source, "test.py");
        tokens.iter().map(|t| t.kind).collect()
    }

    fn kinds_ok(source: &str) -> Vec<TokenKind> {
        let (tokens, errors) = tokenize(source, "test.py");
        assert_eq!(errors, vec![], "unexpected lex errors for {source:?}");
        tokens.iter().map(|t| t.kind).collect()
    }

    #[test]
    fn simple_assignment() {
        assert_eq!(
            kinds_ok("x = 1\n"),
            vec![
                TokenKind::Identifier,
                TokenKind::Assign,
                TokenKind::Int,
                TokenKind::Newline,
                TokenKind::EndOfFile,
            ]
        );
    }

    #[test]
    fn indent_dedent_pairing() {
        let source = "if x:\n    y = 1\n    z = 2\nw = 3\n";
        let kinds = kinds_ok(source);
        let indents = kinds.iter().filter(|k| **k == TokenKind::Indent).count();
        let dedents = kinds.iter().filter(|k| **k == TokenKind::Dedent).count();
        assert_eq!(indents, 1);
        assert_eq!(dedents, 1);
    }

    #[test]
    fn dedents_flushed_at_eof() {
        let source = "if x:\n    if y:\n        z";
        let kinds = kinds(source);
        let indents = kinds.iter().filter(|k| **k == TokenKind::Indent).count();
        let dedents = kinds.iter().filter(|k| **k == TokenKind::Dedent).count();
        assert_eq!(indents, dedents);
        assert_eq!(kinds.last(), Some(&TokenKind::EndOfFile));
    }

    #[test]
    fn blank_and_comment_lines_do_not_indent() {
        let source = "a = 1\n\n    # indented comment\nb = 2\n";
        let kinds = kinds_ok(source);
        assert!(!kinds.contains(&TokenKind::Indent));
        assert!(!kinds.contains(&TokenKind::Dedent));
    }

    #[test]
    fn newline_suppressed_inside_brackets() {
        let source = "x = [1,\n     2,\n     3]\n";
        let kinds = kinds_ok(source);
        assert_eq!(kinds.iter().filter(|k| **k == TokenKind::Newline).count(), 1);
    }

    #[test]
    fn line_continuation_joins_lines() {
        let source = "x = 1 + \\\n    2\n";
        let kinds = kinds_ok(source);
        assert_eq!(kinds.iter().filter(|k| **k == TokenKind::Newline).count(), 1);
    }

    #[test]
    fn inconsistent_dedent_reported() {
        let source = "if x:\n        a = 1\n    b = 2\n";
        let (_, errors) = tokenize(source, "test.py");
        assert!(errors.iter().any(|e| e.message.contains("unindent")));
    }

    #[test]
    fn tab_advances_to_multiple_of_eight() {
        // A tab then "x" indents to column width 8; the nested block at 8
        // spaces matches it, so the dedent pairing stays balanced.
        let source = "if a:\n\tx = 1\n        y = 2\n";
        let kinds = kinds_ok(source);
        assert_eq!(kinds.iter().filter(|k| **k == TokenKind::Indent).count(), 1);
    }

    #[test]
    fn number_forms() {
        let (tokens, errors) = tokenize("0x_FF 0o77 0b1010 1_000 3.14 1e10 2.5E-3 10j 1.5J\n", "test.py");
        assert_eq!(errors, vec![]);
        let kinds: Vec<_> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Int,
                TokenKind::Int,
                TokenKind::Int,
                TokenKind::Int,
                TokenKind::Float,
                TokenKind::Float,
                TokenKind::Float,
                TokenKind::Imaginary,
                TokenKind::Imaginary,
                TokenKind::Newline,
                TokenKind::EndOfFile,
            ]
        );
        assert_eq!(tokens[0].text(), "0x_FF");
        assert_eq!(tokens[7].text(), "10");
    }

    #[test]
    fn dot_disambiguation() {
        // `1.x` is int, dot, identifier; `1.` and `1.0` are floats.
        assert_eq!(
            kinds_ok("a = 1.x\n"),
            vec![
                TokenKind::Identifier,
                TokenKind::Assign,
                TokenKind::Int,
                TokenKind::Dot,
                TokenKind::Identifier,
                TokenKind::Newline,
                TokenKind::EndOfFile,
            ]
        );
        assert_eq!(
            kinds_ok("a = 1.\n"),
            vec![
                TokenKind::Identifier,
                TokenKind::Assign,
                TokenKind::Float,
                TokenKind::Newline,
                TokenKind::EndOfFile,
            ]
        );
    }

    #[test]
    fn empty_radix_literal_is_an_error() {
        let (_, errors) = tokenize("x = 0x\n", "test.py");
        assert!(errors.iter().any(|e| e.message.contains("hexadecimal")));
    }

    #[test]
    fn string_escapes() {
        let (tokens, errors) = tokenize(r#"s = "a\n\x41\u0042\N{LATIN SMALL LETTER C}""#, "test.py");
        assert_eq!(errors, vec![]);
        assert_eq!(tokens[2].text(), "a\nABc");
    }

    #[test]
    fn unknown_escape_keeps_backslash() {
        let (tokens, errors) = tokenize(r#"s = "\q""#, "test.py");
        assert_eq!(errors, vec![]);
        assert_eq!(tokens[2].text(), "\\q");
    }

    #[test]
    fn raw_string_keeps_escapes() {
        let (tokens, errors) = tokenize(r#"s = r"\n""#, "test.py");
        assert_eq!(errors, vec![]);
        assert_eq!(tokens[2].text(), "\\n");
    }

    #[test]
    fn bytes_literal_decodes_to_byte_chars() {
        let (tokens, errors) = tokenize(r#"s = b"\xff\x00a""#, "test.py");
        assert_eq!(errors, vec![]);
        assert_eq!(tokens[2].kind, TokenKind::Bytes);
        let bytes: Vec<u8> = tokens[2].text().chars().map(|c| u8::try_from(u32::from(c)).unwrap()).collect();
        assert_eq!(bytes, vec![0xff, 0x00, b'a']);
    }

    #[test]
    fn triple_quoted_string_spans_lines() {
        let (tokens, errors) = tokenize("s = \"\"\"a\nb\"\"\"\n", "test.py");
        assert_eq!(errors, vec![]);
        assert_eq!(tokens[2].text(), "a\nb");
    }

    #[test]
    fn fstring_captures_raw_body() {
        let (tokens, errors) = tokenize(r#"s = f"x={x!r:>10}""#, "test.py");
        assert_eq!(errors, vec![]);
        assert_eq!(tokens[2].kind, TokenKind::FString);
        assert_eq!(tokens[2].text(), "x={x!r:>10}");
    }

    #[test]
    fn two_letter_prefixes() {
        let (tokens, errors) = tokenize(r#"a = rb"\n" ; b = Rf"{x}""#, "test.py");
        assert_eq!(errors, vec![]);
        assert_eq!(tokens[2].kind, TokenKind::Bytes);
        assert_eq!(tokens[2].text(), "\\n");
        let fstr = tokens.iter().find(|t| t.kind == TokenKind::RawFString).unwrap();
        assert_eq!(fstr.text(), "{x}");
    }

    #[test]
    fn unterminated_string_reported() {
        let (tokens, errors) = tokenize("s = \"abc\n", "test.py");
        assert!(errors.iter().any(|e| e.message.contains("unterminated string")));
        assert_eq!(tokens.last().map(|t| t.kind), Some(TokenKind::EndOfFile));
    }

    #[test]
    fn octal_escape_clamps_out_of_range() {
        let (tokens, errors) = tokenize(r#"s = "\777""#, "test.py");
        assert!(errors.iter().any(|e| e.message.contains("octal escape")));
        assert_eq!(tokens[2].text(), "\u{ff}");
    }

    #[test]
    fn unicode_identifiers() {
        let (tokens, errors) = tokenize("переменная = 1\n", "test.py");
        assert_eq!(errors, vec![]);
        assert_eq!(tokens[0].kind, TokenKind::Identifier);
        assert_eq!(tokens[0].text(), "переменная");
    }

    #[test]
    fn keywords_vs_identifiers() {
        assert_eq!(
            kinds_ok("while match\n"),
            vec![TokenKind::While, TokenKind::Identifier, TokenKind::Newline, TokenKind::EndOfFile]
        );
    }

    #[test]
    fn positions_are_non_decreasing_and_in_bounds() {
        let source = "def f(a, b=2):\n    return a + b\n";
        let (tokens, _) = tokenize(source, "test.py");
        let mut last = 0;
        for token in &tokens {
            assert!(token.start.offset >= last, "positions must be non-decreasing");
            assert!(token.end.offset as usize <= source.len());
            last = token.start.offset;
        }
    }

    #[test]
    fn walrus_and_operators() {
        assert_eq!(
            kinds_ok("(n := 10) // 3 ** 2\n"),
            vec![
                TokenKind::LeftParen,
                TokenKind::Identifier,
                TokenKind::ColonEqual,
                TokenKind::Int,
                TokenKind::RightParen,
                TokenKind::DoubleSlash,
                TokenKind::Int,
                TokenKind::DoubleStar,
                TokenKind::Int,
                TokenKind::Newline,
                TokenKind::EndOfFile,
            ]
        );
    }

    #[test]
    fn comment_tokens_stream_but_not_in_tokenize() {
        let mut lexer = Lexer::new("# hello\nx\n", "test.py");
        let first = lexer.next_token();
        assert_eq!(first.kind, TokenKind::Comment);
        assert_eq!(first.text(), "# hello");
        let (tokens, _) = tokenize("# hello\nx\n", "test.py");
        assert!(tokens.iter().all(|t| t.kind != TokenKind::Comment));
    }
}
