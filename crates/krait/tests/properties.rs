//! Universal properties of the pipeline, exercised over a corpus of inputs
//! ranging from ordinary programs to hostile fragments.

use krait::{CodeObject, Opcode, TokenKind, Value, compile_source, tokenize};

/// Inputs that exercise every stage; many are intentionally malformed.
const CORPUS: &[&str] = &[
    "",
    "\n",
    "x = 1\n",
    "x = 1",
    "if a:\n    b\nelse:\n    c\n",
    "def f(a, b=2, *args, c, **kw):\n    return a\n",
    "class C(Base, metaclass=M):\n    def m(self):\n        return super().m()\n",
    "while x:\n    break\nelse:\n    y\n",
    "for i in range(10):\n    continue\n",
    "try:\n    a\nexcept E as e:\n    b\nfinally:\n    c\n",
    "with a as b, c:\n    d\n",
    "[x for x in y if x]\n{k: v for k, v in z}\n(i for i in j)\n",
    "lambda a, b=1: a + b\n",
    "match p:\n    case [1, *rest] | (x, y) if x:\n        pass\n    case {'k': v, **r}:\n        pass\n",
    "f'{x!r:>10} {y} {{}}'\n",
    "a = b = c, *d = e\n",
    "x: int = 1\ny += 2\nz //= 3\n",
    "assert x, 'message'\n",
    "del a, b[0], c.d\n",
    "global g\n",
    "def f():\n    nonlocal q\n",
    "import a.b.c as d\nfrom ..e import f as g, h\nfrom i import *\n",
    "async def f():\n    await g()\n    async for i in j:\n        pass\n    async with k:\n        pass\n",
    "yield 1\n",
    "return 2\n",
    "break\ncontinue\n",
    "0x 0b2 1__2 1e 'abc\n",
    "\"\\q\\777\\x4\\N{NO SUCH NAME}\"\n",
    "def f(:\n",
    "x = (((((((1)))))))\n",
    "if x:\n        a\n    b\n",
    "\t\tweird\n",
    "f'{'\nf'{}'\nf'{x:'\n",
    "( [ {\n",
    ") ] }\n",
    "$ ? ` @@\n",
    "x = 123456789012345678901234567890 + 0xFFFF_FFFF_FFFF_FFFF_FFFF\n",
    "\u{feff}x = 1\n",
    "переменная = 'значение'\n",
    "match = 1\ntype = 2\ncase = 3\n",
];

fn all_codes(code: &CodeObject) -> Vec<&CodeObject> {
    let mut result = vec![code];
    let mut i = 0;
    while i < result.len() {
        for constant in &result[i].constants {
            if let Value::Code(inner) = constant {
                result.push(inner);
            }
        }
        i += 1;
    }
    result
}

#[test]
fn no_panic_and_terminating_result() {
    for source in CORPUS {
        let output = compile_source(source, "corpus.py");
        assert!(output.code.is_some(), "compilation must return a code object for {source:?}");
    }
}

#[test]
fn token_positions_cover_input() {
    for source in CORPUS {
        let (tokens, _) = tokenize(source, "corpus.py");
        let mut last_start = 0u32;
        for token in &tokens {
            assert!(token.start.offset >= last_start, "non-decreasing positions in {source:?}");
            assert!(token.start.offset <= token.end.offset);
            assert!(
                (token.end.offset as usize) <= source.len(),
                "offset within input for {source:?}"
            );
            last_start = token.start.offset;
        }
        assert_eq!(tokens.last().map(|t| t.kind), Some(TokenKind::EndOfFile));
    }
}

#[test]
fn indent_dedent_balance() {
    for source in CORPUS {
        let (tokens, _) = tokenize(source, "corpus.py");
        let indents = tokens.iter().filter(|t| t.kind == TokenKind::Indent).count();
        let dedents = tokens.iter().filter(|t| t.kind == TokenKind::Dedent).count();
        assert_eq!(indents, dedents, "indent/dedent balance for {source:?}");
    }
}

#[test]
fn newlines_suppressed_inside_matched_brackets() {
    let sources = [
        "x = [1,\n 2]\n",
        "y = f(\n    a,\n    b,\n)\n",
        "z = {\n 'k':\n 1}\n",
        "w = (1 +\n 2)\n",
    ];
    for source in sources {
        let (tokens, errors) = tokenize(source, "brackets.py");
        assert!(errors.is_empty());
        let newlines = tokens.iter().filter(|t| t.kind == TokenKind::Newline).count();
        assert_eq!(newlines, 1, "only the closing logical newline in {source:?}");
    }
}

#[test]
fn jump_integrity() {
    for source in CORPUS {
        let output = compile_source(source, "corpus.py");
        let code = output.code.unwrap();
        for code in all_codes(&code) {
            let boundaries: Vec<usize> = code.instructions().map(|(at, _, _)| at).collect();
            for (at, op, arg) in code.instructions() {
                if op.is_jump() {
                    let target = usize::from(arg.unwrap());
                    assert!(
                        boundaries.binary_search(&target).is_ok(),
                        "jump at {at} in {:?} targets instruction boundary {target} ({source:?})",
                        code.name
                    );
                }
            }
        }
    }
}

#[test]
fn table_bounds() {
    for source in CORPUS {
        let output = compile_source(source, "corpus.py");
        let code = output.code.unwrap();
        for code in all_codes(&code) {
            for (at, op, arg) in code.instructions() {
                let Some(arg) = arg.map(usize::from) else { continue };
                match op {
                    Opcode::LoadFast | Opcode::StoreFast | Opcode::DeleteFast => {
                        assert!(arg < code.varnames.len(), "local index at {at} in {source:?}");
                    }
                    Opcode::LoadGlobal
                    | Opcode::StoreGlobal
                    | Opcode::LoadName
                    | Opcode::StoreName
                    | Opcode::LoadAttr
                    | Opcode::StoreAttr
                    | Opcode::LoadMethod => {
                        assert!(arg < code.names.len(), "name index at {at} in {source:?}");
                    }
                    Opcode::LoadConst => {
                        assert!(arg < code.constants.len(), "constant index at {at} in {source:?}");
                    }
                    Opcode::LoadDeref | Opcode::StoreDeref => {
                        assert!(
                            arg < code.cellvars.len() + code.freevars.len(),
                            "deref index at {at} in {source:?}"
                        );
                    }
                    _ => {}
                }
            }
        }
    }
}

#[test]
fn line_table_monotonicity() {
    for source in CORPUS {
        let output = compile_source(source, "corpus.py");
        let code = output.code.unwrap();
        for code in all_codes(&code) {
            let mut previous_end = 0;
            for entry in &code.line_table {
                assert!(entry.start >= previous_end, "sorted, disjoint entries in {source:?}");
                assert!(entry.start < entry.end, "non-empty ranges in {source:?}");
                assert!(entry.end as usize <= code.bytecode.len());
                previous_end = entry.end;
            }
        }
    }
}

#[test]
fn numeric_literals_round_trip() {
    // The same value regardless of underscore placement or prefix case.
    let groups: &[&[&str]] = &[
        &["255", "2_5_5", "0xff", "0XFF", "0x_f_f"],
        &["10", "0b1010", "0B10_10", "0o12", "0O1_2"],
        &["1000000", "1_000_000", "10_00_000"],
    ];
    for group in groups {
        let mut values = Vec::new();
        for literal in *group {
            let output = compile_source(&format!("x = {literal}\n"), "numbers.py");
            assert!(output.errors.is_empty(), "errors for {literal}: {:?}", output.errors);
            let code = output.code.unwrap();
            let value = code
                .constants
                .iter()
                .find_map(|c| match c {
                    Value::Int(v) => Some(*v),
                    _ => None,
                })
                .expect("integer constant");
            values.push(value);
        }
        assert!(values.windows(2).all(|w| w[0] == w[1]), "group {group:?} produced {values:?}");
    }
}

#[test]
fn closure_soundness() {
    let sources = [
        "def a():\n    x = 1\n    def b():\n        def c():\n            return x\n        return c\n    return b\n",
        "def outer():\n    total = 0\n    items = [total := total + i for i in range(3)]\n    return items\n",
        "class C:\n    def m(self):\n        return __class__\n",
        "def f():\n    v = 2\n    return lambda: v\n",
        "def g():\n    y = 1\n    return (y for _ in range(3))\n",
    ];
    for source in sources {
        let output = compile_source(source, "closures.py");
        assert!(output.errors.is_empty(), "errors for {source:?}: {:?}", output.errors);
        let module = output.code.unwrap();
        let codes = all_codes(&module);
        for code in &codes {
            'free: for free in &code.freevars {
                for other in &codes {
                    if other.cellvars.contains(free) {
                        continue 'free;
                    }
                }
                panic!("free variable {free:?} in {:?} has no matching cell ({source:?})", code.name);
            }
        }
    }
}

#[test]
fn validate_is_clean_on_compiled_output() {
    for source in CORPUS {
        let output = compile_source(source, "corpus.py");
        // compile_source already appends validation errors; re-validate each
        // code object directly to pin the invariant.
        let code = output.code.unwrap();
        for code in all_codes(&code) {
            assert_eq!(code.validate(), vec![], "structural validation for {source:?}");
        }
    }
}

#[test]
fn pathological_nesting_terminates_with_errors() {
    let deep_parens = format!("x = {}1{}\n", "(".repeat(500), ")".repeat(500));
    let output = compile_source(&deep_parens, "deep.py");
    assert!(!output.errors.is_empty());

    let deep_blocks = {
        let mut s = String::new();
        for depth in 0..120 {
            s.push_str(&" ".repeat(depth * 4));
            s.push_str("if x:\n");
        }
        s.push_str(&" ".repeat(120 * 4));
        s.push_str("pass\n");
        s
    };
    let output = compile_source(&deep_blocks, "deep.py");
    assert!(output.code.is_some());
}
