//! The diagnostic record shared by every stage of the pipeline.

use std::fmt;

use crate::location::CodeRange;

/// A compilation diagnostic with a source position.
///
/// The lexer, parser, and bytecode emitter all accumulate these instead of
/// aborting: each stage returns a best-effort result alongside its errors,
/// and the caller decides whether a code object with a non-empty error list
/// should be executed.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CompileError {
    /// Name of the source file the error was found in (never opened, only
    /// echoed back in diagnostics).
    pub filename: String,
    /// Where in the source the error was detected.
    pub position: CodeRange,
    /// Human-readable description of the problem.
    pub message: String,
}

impl CompileError {
    /// Creates a new error record.
    pub fn new(filename: impl Into<String>, position: CodeRange, message: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            position,
            message: message.into(),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let start = self.position.start();
        write!(f, "{}:{}:{}: {}", self.filename, start.line, start.column, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::CodeLoc;

    #[test]
    fn display_format() {
        let err = CompileError::new(
            "test.py",
            CodeRange::new(CodeLoc::new(3, 7, 42), CodeLoc::new(3, 8, 43)),
            "unexpected character '?'",
        );
        assert_eq!(err.to_string(), "test.py:3:7: unexpected character '?'");
    }
}
