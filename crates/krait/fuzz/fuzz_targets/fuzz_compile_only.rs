//! Fuzz target: compile arbitrary Python source end to end.
//!
//! This exercises the lexer, parser, scope analysis, and bytecode emitter.
//! A crash here indicates a bug — the pipeline must never panic regardless
//! of input, only return errors alongside a best-effort code object.

#![no_main]

use libfuzzer_sys::fuzz_target;

use krait::compile_source;

fuzz_target!(|data: &[u8]| {
    let Ok(code) = std::str::from_utf8(data) else {
        return;
    };

    // Skip excessively large inputs.
    if code.len() > 8192 {
        return;
    }

    // Attempt to compile. We don't care about the result —
    // only that it doesn't panic.
    let _ = compile_source(code, "fuzz.py");
});
