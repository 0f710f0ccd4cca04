//! End-to-end compilation scenarios: literal inputs checked against the
//! expected shape of the produced code objects.

use krait::{CodeObject, Opcode, Value, compile_source};

fn compile_ok(source: &str) -> CodeObject {
    let output = compile_source(source, "test.py");
    assert!(output.errors.is_empty(), "unexpected errors for {source:?}: {:?}", output.errors);
    output.code.expect("compilation produced a code object")
}

fn nested_codes(code: &CodeObject) -> Vec<&CodeObject> {
    code.constants
        .iter()
        .filter_map(|c| match c {
            Value::Code(inner) => Some(inner.as_ref()),
            _ => None,
        })
        .collect()
}

fn find_op(code: &CodeObject, op: Opcode) -> Option<(usize, Option<u16>)> {
    code.instructions().find(|(_, o, _)| *o == op).map(|(at, _, arg)| (at, arg))
}

#[test]
fn simple_assignment() {
    let code = compile_ok("x = 1\n");
    assert!(code.constants.contains(&Value::Int(1)));
    let store = find_op(&code, Opcode::StoreName)
        .or_else(|| find_op(&code, Opcode::StoreGlobal))
        .expect("a store of x");
    let name_index = usize::from(store.1.unwrap());
    assert_eq!(code.names[name_index], "x");
    // The module returns None.
    let ops: Vec<_> = code.instructions().map(|(_, op, _)| op).collect();
    let return_at = ops.iter().rposition(|op| *op == Opcode::Return).unwrap();
    assert_eq!(ops[return_at - 1], Opcode::LoadNone);
}

#[test]
fn function_with_default() {
    let code = compile_ok("def f(a, b=2):\n    return a + b\n");
    let make = code
        .instructions()
        .find(|(_, op, _)| *op == Opcode::MakeFunction)
        .expect("MakeFunction emitted");
    assert_eq!(make.2.map(|flags| flags & 1), Some(1), "has-defaults flag set");

    let inner = nested_codes(&code)[0];
    assert_eq!(inner.arg_count, 2);
    assert!(inner.freevars.is_empty());
    let inner_ops: Vec<_> = inner.instructions().map(|(_, op, _)| op).collect();
    assert!(inner_ops.contains(&Opcode::BinaryAdd));
    assert!(inner_ops.contains(&Opcode::Return));
}

#[test]
fn closure_capture() {
    let code = compile_ok("def outer():\n    x = 1\n    def inner():\n        return x\n    return inner\n");
    let outer = nested_codes(&code)[0];
    assert_eq!(outer.cellvars, vec!["x".to_owned()]);
    let inner = nested_codes(outer)[0];
    assert_eq!(inner.freevars, vec!["x".to_owned()]);
    let deref = find_op(inner, Opcode::LoadDeref).expect("inner loads x through the closure");
    assert_eq!(deref.1, Some(0));
}

#[test]
fn for_loop_with_continue() {
    let code = compile_ok("for i in range(3):\n    if i == 1:\n        continue\n    print(i)\n");
    let (for_at, for_arg) = find_op(&code, Opcode::ForIter).expect("ForIter at the loop head");
    // The ForIter target is a forward jump to the post-loop offset.
    let target = usize::from(for_arg.unwrap());
    assert!(target > for_at);
    assert!(code.instructions().any(|(at, _, _)| at == target), "target is an instruction boundary");
    // continue compiles to a Jump whose target is the ForIter offset.
    let continue_jump = code
        .instructions()
        .any(|(_, op, arg)| op == Opcode::Jump && arg.map(usize::from) == Some(for_at));
    assert!(continue_jump);
}

#[test]
fn list_comprehension() {
    let code = compile_ok("[x*x for x in range(5) if x % 2 == 0]\n");
    let comp = nested_codes(&code)
        .into_iter()
        .find(|c| c.name == "<listcomp>")
        .expect("<listcomp> code object in constants");
    let first = comp.instructions().next().unwrap();
    assert_eq!(first.1, Opcode::BuildList);
    assert_eq!(first.2, Some(0));
    assert_eq!(comp.varnames[0], ".0");
    assert!(comp.instructions().any(|(_, op, _)| op == Opcode::ForIter));
    let append = comp
        .instructions()
        .find(|(_, op, _)| *op == Opcode::ListAppend)
        .expect("ListAppend emitted");
    assert_eq!(append.2, Some(1), "argument equals the number of generators");
}

#[test]
fn match_with_sequence_and_wildcard() {
    let source = "\
def f(p):
    match p:
        case (x, y):
            return x + y
        case _:
            return 0
";
    let code = compile_ok(source);
    let inner = nested_codes(&code)[0];
    let seq = find_op(inner, Opcode::MatchSequence).expect("MatchSequence emitted");
    assert_eq!(seq.1, Some(2));
    assert!(inner.constants.contains(&Value::Int(0)), "wildcard case returns 0");

    // Both case bodies rejoin at a common end offset: at least two jumps
    // share one forward target.
    let mut jump_targets = std::collections::HashMap::new();
    for (_, op, arg) in inner.instructions() {
        if op == Opcode::Jump
            && let Some(arg) = arg
        {
            *jump_targets.entry(arg).or_insert(0) += 1;
        }
    }
    assert!(jump_targets.values().any(|count| *count >= 2), "cases rejoin at a common end");
}

#[test]
fn while_loop_shape() {
    let code = compile_ok("n = 3\nwhile n:\n    n = n - 1\n");
    let pjif = find_op(&code, Opcode::PopJumpIfFalse).expect("loop test branch");
    let target = usize::from(pjif.1.unwrap());
    assert!(target > pjif.0, "test jumps forward past the body");
    assert!(code.instructions().any(|(_, op, arg)| op == Opcode::Jump
        && arg.is_some_and(|t| usize::from(t) < pjif.0)));
}

#[test]
fn try_except_shape() {
    let code = compile_ok("try:\n    risky()\nexcept ValueError:\n    pass\nfinally:\n    done()\n");
    assert!(code.instructions().any(|(_, op, _)| op == Opcode::SetupFinally));
    assert!(code.instructions().any(|(_, op, _)| op == Opcode::SetupExcept));
    assert!(code.instructions().any(|(_, op, _)| op == Opcode::ExceptionMatch));
    assert!(code.instructions().any(|(_, op, _)| op == Opcode::EndFinally));
    assert!(
        code.instructions()
            .any(|(_, op, arg)| op == Opcode::RaiseVarargs && arg == Some(0)),
        "unmatched exceptions re-raise"
    );
}

#[test]
fn with_statement_shape() {
    let code = compile_ok("with open(p) as f:\n    f.read()\n");
    let enter = code
        .instructions()
        .filter(|(_, op, _)| *op == Opcode::LoadMethod)
        .filter_map(|(_, _, arg)| arg)
        .map(|arg| code.names[usize::from(arg)].clone())
        .collect::<Vec<_>>();
    assert!(enter.contains(&"__enter__".to_owned()));
    assert!(enter.contains(&"__exit__".to_owned()));
}

#[test]
fn fstring_concatenates_through_str_calls() {
    let code = compile_ok("name = 'x'\ns = f\"hello {name}!\"\n");
    assert!(code.names.contains(&"str".to_owned()));
    assert!(code.instructions().any(|(_, op, _)| op == Opcode::BinaryAdd));
    assert!(code.constants.iter().any(|c| matches!(c, Value::Str(s) if s == "hello ")));
}

#[test]
fn import_shapes() {
    let code = compile_ok("import os\nfrom sys import path\n");
    assert!(code.instructions().any(|(_, op, _)| op == Opcode::ImportName));
    assert!(code.instructions().any(|(_, op, _)| op == Opcode::ImportFrom));
    assert!(code.constants.iter().any(|c| matches!(c, Value::StrArray(v) if v == &["path".to_owned()])));
}

#[test]
fn class_definition_shape() {
    let code = compile_ok("class Point:\n    def __init__(self, x):\n        self.x = x\n");
    assert!(code.instructions().any(|(_, op, _)| op == Opcode::LoadBuildClass));
    let body = nested_codes(&code).into_iter().find(|c| c.name == "Point").unwrap();
    assert!(body.instructions().any(|(_, op, _)| op == Opcode::LoadLocals));
    let init = nested_codes(body).into_iter().find(|c| c.name == "__init__").unwrap();
    assert_eq!(init.arg_count, 2);
    assert!(init.instructions().any(|(_, op, _)| op == Opcode::StoreAttr));
}

#[test]
fn qualified_names_nest() {
    let code = compile_ok("def outer():\n    def inner():\n        pass\n    return inner\n");
    let outer = nested_codes(&code)[0];
    assert!(
        outer
            .constants
            .iter()
            .any(|c| matches!(c, Value::Str(s) if s == "outer.<locals>.inner")),
        "inner function's qualified name records the nesting"
    );
}

#[test]
fn docstring_reaches_constants_without_code() {
    let code = compile_ok("\"\"\"module docs\"\"\"\nx = 1\n");
    assert!(code.constants.iter().any(|c| matches!(c, Value::Str(s) if s == "module docs")));
}

#[test]
fn peephole_rewrites_return_none() {
    let code = compile_ok("def f():\n    return None\n");
    let inner = nested_codes(&code)[0];
    // `return None` went through LoadConst None; the peephole pass rewrote
    // it to the dedicated LoadNone form with Nop padding.
    let ops: Vec<_> = inner.instructions().map(|(_, op, _)| op).collect();
    assert!(ops.windows(2).any(|w| w[0] == Opcode::LoadNone && w[1] == Opcode::Nop));
}
