//! The code object: compiled bytecode plus its metadata tables.

use crate::{
    error::CompileError,
    location::{CodeLoc, CodeRange},
    value::Value,
};

use super::op::Opcode;

/// Behavior flags of a code object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CodeFlags(u16);

impl CodeFlags {
    /// The function accepts `*args`.
    pub const VARARGS: Self = Self(1 << 0);
    /// The function accepts `**kwargs`.
    pub const VARKEYWORDS: Self = Self(1 << 1);
    /// The body contains `yield` or `yield from`.
    pub const GENERATOR: Self = Self(1 << 2);
    /// The code was defined with `async def` and contains no `yield`.
    pub const COROUTINE: Self = Self(1 << 3);
    /// The code was defined with `async def` and contains `yield`.
    pub const ASYNC_GENERATOR: Self = Self(1 << 4);

    /// Returns whether every flag in `flag` is set.
    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 == flag.0
    }

    /// Sets all flags in `flag`.
    pub fn insert(&mut self, flag: Self) {
        self.0 |= flag.0;
    }

    /// Clears all flags in `flag`.
    pub fn remove(&mut self, flag: Self) {
        self.0 &= !flag.0;
    }

    /// The raw bit set.
    #[must_use]
    pub fn bits(self) -> u16 {
        self.0
    }
}

/// One line-table entry: the bytecode half-open range `[start, end)` was
/// emitted for source `line`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LineEntry {
    pub start: u32,
    pub end: u32,
    pub line: u32,
}

/// Compiled bytecode for a module, function, class body, or comprehension.
///
/// This is the compiler's product and the VM's input. Nested code objects
/// (functions, class bodies, comprehensions) live in the parent's constant
/// pool, so one compilation returns a single immutable code tree.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CodeObject {
    /// Raw instruction stream: 1-byte opcodes, each followed by a 2-byte
    /// little-endian argument when [`Opcode::has_arg`] says so.
    pub bytecode: Vec<u8>,
    /// Constant pool referenced by `LoadConst` and friends.
    pub constants: Vec<Value>,
    /// Names used by global/name/attribute/method/import instructions.
    pub names: Vec<String>,
    /// Function-local variable names by slot index. Slots whose name was
    /// never recorded hold an empty string.
    pub varnames: Vec<String>,
    /// Names of this code's own cells, in promotion order.
    pub cellvars: Vec<String>,
    /// Names of variables captured from enclosing scopes, in first-reference
    /// order. `LoadDeref` indices continue past `cellvars` into this list.
    pub freevars: Vec<String>,
    /// Number of positional parameters (positional-only included).
    pub arg_count: u16,
    /// Number of keyword-only parameters.
    pub kwonly_arg_count: u16,
    pub flags: CodeFlags,
    /// Conservative operand-stack bound computed during emission.
    pub stack_size: u16,
    /// Source line of the `def`/`class` statement, or 1 for modules.
    pub first_line: u32,
    pub filename: String,
    /// `<module>`, the function name, the class name, or a comprehension
    /// marker such as `<listcomp>`.
    pub name: String,
    /// Sorted, disjoint offset ranges mapping bytecode back to source lines.
    pub line_table: Vec<LineEntry>,
}

impl CodeObject {
    /// Looks up the source line for a bytecode offset in O(log n).
    #[must_use]
    pub fn line_for_offset(&self, offset: usize) -> Option<u32> {
        let offset = u32::try_from(offset).ok()?;
        let idx = self.line_table.partition_point(|entry| entry.end <= offset);
        let entry = self.line_table.get(idx)?;
        (entry.start <= offset).then_some(entry.line)
    }

    /// Iterates over `(offset, opcode, arg)` triples.
    ///
    /// Stops early if a byte fails to decode; `validate` reports that case.
    pub fn instructions(&self) -> impl Iterator<Item = (usize, Opcode, Option<u16>)> + '_ {
        let mut offset = 0;
        std::iter::from_fn(move || {
            let byte = *self.bytecode.get(offset)?;
            let op = Opcode::from_repr(byte)?;
            let start = offset;
            let arg = if op.has_arg() {
                let lo = *self.bytecode.get(offset + 1)?;
                let hi = *self.bytecode.get(offset + 2)?;
                offset += 3;
                Some(u16::from_le_bytes([lo, hi]))
            } else {
                offset += 1;
                None
            };
            Some((start, op, arg))
        })
    }

    /// Structurally validates the instruction stream.
    ///
    /// Checks that every byte decodes to an opcode, that table-indexing
    /// arguments are in range, and that every jump target is the first byte
    /// of some instruction. This is defensive: a compiler bug, not user
    /// input, is the only way to fail here, but the errors surface through
    /// the normal diagnostic channel rather than a panic.
    #[must_use]
    pub fn validate(&self) -> Vec<CompileError> {
        let mut errors = Vec::new();
        let here = CodeRange::new(
            CodeLoc::new(self.first_line, 1, 0),
            CodeLoc::new(self.first_line, 1, 0),
        );
        let mut report = |message: String| {
            errors.push(CompileError::new(&self.filename, here, message));
        };

        let mut starts = Vec::new();
        let mut offset = 0;
        while offset < self.bytecode.len() {
            starts.push(offset);
            let byte = self.bytecode[offset];
            let Some(op) = Opcode::from_repr(byte) else {
                report(format!("invalid opcode {byte:#04x} at offset {offset}"));
                break;
            };
            if op.has_arg() {
                if offset + 2 >= self.bytecode.len() {
                    report(format!("truncated argument for {op:?} at offset {offset}"));
                    break;
                }
                offset += 3;
            } else {
                offset += 1;
            }
        }

        for (at, op, arg) in self.instructions() {
            let Some(arg) = arg else { continue };
            let arg = usize::from(arg);
            match op {
                Opcode::LoadConst => {
                    if arg >= self.constants.len() {
                        report(format!("constant index {arg} out of range at offset {at}"));
                    }
                }
                Opcode::LoadFast | Opcode::StoreFast | Opcode::DeleteFast => {
                    if arg >= self.varnames.len() {
                        report(format!("local index {arg} out of range at offset {at}"));
                    }
                }
                Opcode::LoadGlobal
                | Opcode::StoreGlobal
                | Opcode::DeleteGlobal
                | Opcode::LoadName
                | Opcode::StoreName
                | Opcode::DeleteName
                | Opcode::LoadAttr
                | Opcode::StoreAttr
                | Opcode::DeleteAttr
                | Opcode::LoadMethod
                | Opcode::ImportName
                | Opcode::ImportFrom => {
                    if arg >= self.names.len() {
                        report(format!("name index {arg} out of range at offset {at}"));
                    }
                }
                Opcode::LoadDeref | Opcode::StoreDeref => {
                    if arg >= self.cellvars.len() + self.freevars.len() {
                        report(format!("cell index {arg} out of range at offset {at}"));
                    }
                }
                _ if op.is_jump() => {
                    if starts.binary_search(&arg).is_err() {
                        report(format!("jump target {arg} at offset {at} is not an instruction boundary"));
                    }
                }
                _ => {}
            }
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_code(bytecode: Vec<u8>) -> CodeObject {
        CodeObject {
            bytecode,
            constants: Vec::new(),
            names: Vec::new(),
            varnames: Vec::new(),
            cellvars: Vec::new(),
            freevars: Vec::new(),
            arg_count: 0,
            kwonly_arg_count: 0,
            flags: CodeFlags::default(),
            stack_size: 0,
            first_line: 1,
            filename: "test.py".to_owned(),
            name: "<module>".to_owned(),
            line_table: Vec::new(),
        }
    }

    #[test]
    fn flags_insert_and_contains() {
        let mut flags = CodeFlags::default();
        flags.insert(CodeFlags::GENERATOR);
        assert!(flags.contains(CodeFlags::GENERATOR));
        assert!(!flags.contains(CodeFlags::COROUTINE));
        flags.remove(CodeFlags::GENERATOR);
        assert!(!flags.contains(CodeFlags::GENERATOR));
    }

    #[test]
    fn line_lookup_binary_search() {
        let mut code = empty_code(vec![Opcode::LoadNone as u8, Opcode::Return as u8]);
        code.line_table = vec![
            LineEntry { start: 0, end: 4, line: 1 },
            LineEntry { start: 4, end: 10, line: 3 },
        ];
        assert_eq!(code.line_for_offset(0), Some(1));
        assert_eq!(code.line_for_offset(3), Some(1));
        assert_eq!(code.line_for_offset(4), Some(3));
        assert_eq!(code.line_for_offset(9), Some(3));
        assert_eq!(code.line_for_offset(10), None);
    }

    #[test]
    fn validate_rejects_out_of_range_const() {
        let code = empty_code(vec![Opcode::LoadConst as u8, 5, 0, Opcode::Return as u8]);
        let errors = code.validate();
        assert!(errors.iter().any(|e| e.message.contains("constant index")));
    }

    #[test]
    fn validate_rejects_mid_instruction_jump() {
        // Jump target 1 lands inside the jump's own argument bytes.
        let code = empty_code(vec![Opcode::Jump as u8, 1, 0, Opcode::LoadNone as u8, Opcode::Return as u8]);
        let errors = code.validate();
        assert!(errors.iter().any(|e| e.message.contains("not an instruction boundary")));
    }

    #[test]
    fn validate_accepts_well_formed_stream() {
        let code = empty_code(vec![
            Opcode::Jump as u8,
            3,
            0,
            Opcode::LoadNone as u8,
            Opcode::Return as u8,
        ]);
        assert_eq!(code.validate(), vec![]);
    }

    #[test]
    fn instructions_decode_args() {
        let code = empty_code(vec![Opcode::LoadConst as u8, 0x34, 0x12, Opcode::Pop as u8]);
        let decoded: Vec<_> = code.instructions().collect();
        assert_eq!(
            decoded,
            vec![(0, Opcode::LoadConst, Some(0x1234)), (3, Opcode::Pop, None)]
        );
    }
}
