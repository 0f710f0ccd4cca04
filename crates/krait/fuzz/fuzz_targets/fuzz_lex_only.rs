//! Fuzz target: lex arbitrary source without parsing.
//!
//! Much faster than `fuzz_compile_only`; effective for finding panics in
//! indentation tracking and string/number decoding.

#![no_main]

use libfuzzer_sys::fuzz_target;

use krait::tokenize;

fuzz_target!(|data: &[u8]| {
    let Ok(code) = std::str::from_utf8(data) else {
        return;
    };

    if code.len() > 8192 {
        return;
    }

    let (tokens, _errors) = tokenize(code, "fuzz.py");
    // The stream always terminates with EndOfFile.
    assert!(!tokens.is_empty());
});
