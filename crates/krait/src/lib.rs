#![doc = include_str!("../../../README.md")]

mod ast;
mod bytecode;
mod error;
mod lexer;
mod location;
mod parse;
mod scope;
mod token;
mod value;

pub use crate::{
    bytecode::{CodeFlags, CodeObject, LineEntry, Opcode},
    error::CompileError,
    lexer::{Lexer, tokenize},
    location::{CodeLoc, CodeRange},
    parse::{Parser, parse_module_text},
    token::{Token, TokenKind},
    value::Value,
};

/// Result of one compilation: a best-effort code object plus all diagnostics
/// collected along the way, in source order.
///
/// A code object is produced even when errors were found; callers decide
/// whether a program with diagnostics should still be handed to the VM.
#[derive(Debug)]
pub struct CompileOutput {
    pub code: Option<CodeObject>,
    pub errors: Vec<CompileError>,
}

/// Compiles Python source text into a stack-machine code object.
///
/// `filename` is only echoed into positions and the code object; it is never
/// opened. The pipeline is strictly staged: lexing, parsing, and bytecode
/// emission each collect errors and hand a best-effort result to the next
/// stage, so every input yields a terminating result and an ordered error
/// list. The finished code tree is validated structurally before return.
#[must_use]
pub fn compile_source(source: &str, filename: &str) -> CompileOutput {
    let (module, mut errors) = parse::parse_module_text(source, filename);
    let (code, compile_errors) = bytecode::compile_module(&module, filename);
    errors.extend(compile_errors);
    errors.extend(validate_tree(&code));
    CompileOutput {
        code: Some(code),
        errors,
    }
}

/// Validates a code object and every nested code object in its constants.
fn validate_tree(code: &CodeObject) -> Vec<CompileError> {
    let mut errors = code.validate();
    for constant in &code.constants {
        if let Value::Code(inner) = constant {
            errors.extend(validate_tree(inner));
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_source_produces_code_and_no_errors() {
        let output = compile_source("x = 1\nprint(x + 1)\n", "example.py");
        assert!(output.errors.is_empty(), "unexpected errors: {:?}", output.errors);
        let code = output.code.expect("code object");
        assert_eq!(code.name, "<module>");
        assert_eq!(code.filename, "example.py");
    }

    #[test]
    fn compile_source_collects_errors_but_still_returns_code() {
        let output = compile_source("def f(:\n    pass\n", "bad.py");
        assert!(!output.errors.is_empty());
        assert!(output.code.is_some());
    }

    #[test]
    fn errors_carry_positions_in_display_format() {
        let output = compile_source("x = $\n", "bad.py");
        let rendered = output.errors[0].to_string();
        assert!(rendered.starts_with("bad.py:1:"), "got {rendered}");
    }
}
