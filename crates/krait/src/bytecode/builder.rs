//! Builder for emitting bytecode during compilation.
//!
//! `CodeBuilder` encodes opcodes and operands into raw bytes, manages
//! forward jumps that need patching, deduplicates constants and names, and
//! tracks source lines and stack depth for the finished code object.

use indexmap::IndexSet;

use crate::{
    error::CompileError,
    location::CodeRange,
    value::Value,
};

use super::{
    code::{CodeFlags, CodeObject, LineEntry},
    op::Opcode,
    optimizer,
};

/// Label for a forward jump that needs patching.
///
/// Stores the bytecode offset of the jump instruction. Pass it to
/// [`CodeBuilder::patch_jump`] once the target location is known.
#[derive(Debug, Clone, Copy)]
pub struct JumpLabel(usize);

/// Mutable emission state for one code object under construction.
#[derive(Debug, Default)]
pub struct CodeBuilder {
    /// The bytecode being built.
    bytecode: Vec<u8>,

    /// Instruction start offsets in emission order, consumed by the
    /// peephole pass so it can walk boundaries without re-decoding.
    instruction_offsets: Vec<usize>,

    /// Constants collected during compilation.
    constants: Vec<Value>,

    /// Deduplicated names for global/name/attribute/import access.
    names: IndexSet<String>,

    /// Local variable names by slot. Slots the symbol table reserved but
    /// never named stay `None` and densify to empty strings.
    varnames: Vec<Option<String>>,

    /// Sealed line-table entries.
    line_table: Vec<LineEntry>,
    /// Line currently being emitted, with the offset its range began at.
    current_line: Option<(u32, usize)>,

    /// Source range used to position emitter-detected errors.
    current_range: CodeRange,

    /// Current and maximum operand stack depth.
    current_stack_depth: u16,
    max_stack_depth: u16,

    /// Emitter-detected errors (argument overflow and the like).
    errors: Vec<CompileError>,
    filename: String,
}

impl CodeBuilder {
    /// Creates an empty builder for the given source file.
    #[must_use]
    pub fn new(filename: &str) -> Self {
        Self {
            filename: filename.to_owned(),
            ..Self::default()
        }
    }

    /// Sets the source range for subsequent instructions; used both for the
    /// line table and to position any emitter-detected errors.
    pub fn set_location(&mut self, range: CodeRange) {
        self.current_range = range;
        self.set_line(range.start().line);
    }

    /// Advances the line table. On a line change the previous
    /// `[start, current-offset)` range is sealed under the previous line.
    pub fn set_line(&mut self, line: u32) {
        match self.current_line {
            Some((current, _)) if current == line => {}
            _ => {
                self.seal_line();
                self.current_line = Some((line, self.bytecode.len()));
            }
        }
    }

    fn seal_line(&mut self) {
        if let Some((line, start)) = self.current_line.take() {
            let end = self.bytecode.len();
            if end > start {
                self.line_table.push(LineEntry {
                    start: u32::try_from(start).unwrap_or(u32::MAX),
                    end: u32::try_from(end).unwrap_or(u32::MAX),
                    line,
                });
            }
        }
    }

    /// Returns the current bytecode offset; used to record loop heads.
    #[must_use]
    pub fn current_offset(&self) -> usize {
        self.bytecode.len()
    }

    /// Current tracked stack depth.
    #[must_use]
    pub fn stack_depth(&self) -> u16 {
        self.current_stack_depth
    }

    /// Emits a no-argument instruction.
    pub fn emit(&mut self, op: Opcode) {
        debug_assert!(!op.has_arg(), "{op:?} requires an argument");
        self.start_instruction();
        self.bytecode.push(op as u8);
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
    }

    /// Emits an instruction with a 16-bit little-endian argument.
    ///
    /// Arguments outside `[-32768, 65535]` are reported and clamped so the
    /// emitted bytecode stays structurally valid; negative values are stored
    /// as two's complement.
    pub fn emit_arg(&mut self, op: Opcode, arg: i32) {
        debug_assert!(op.has_arg(), "{op:?} takes no argument");
        let encoded = self.encode_arg(arg);
        self.start_instruction();
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&encoded.to_le_bytes());
        self.track_arg_effect(op, encoded);
    }

    fn encode_arg(&mut self, arg: i32) -> u16 {
        if let Ok(value) = u16::try_from(arg) {
            value
        } else if let Ok(value) = i16::try_from(arg) {
            value.cast_unsigned()
        } else {
            self.errors.push(CompileError::new(
                &self.filename,
                self.current_range,
                format!("bytecode argument {arg} out of 16-bit range"),
            ));
            if arg < 0 { i16::MIN.cast_unsigned() } else { u16::MAX }
        }
    }

    /// Emits a forward jump with a placeholder target, returning a label to
    /// patch once the target offset is known.
    #[must_use]
    pub fn emit_jump(&mut self, op: Opcode) -> JumpLabel {
        debug_assert!(op.is_jump(), "{op:?} is not a jump");
        self.start_instruction();
        let label = JumpLabel(self.bytecode.len());
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&0u16.to_le_bytes());
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
        label
    }

    /// Patches a forward jump to target the current offset.
    pub fn patch_jump(&mut self, label: JumpLabel) {
        let target = self.bytecode.len();
        self.patch_jump_to(label, target);
    }

    /// Patches a forward jump to an explicit absolute target.
    pub fn patch_jump_to(&mut self, label: JumpLabel, target: usize) {
        let encoded = self.encode_arg(i32::try_from(target).unwrap_or(i32::MAX));
        let bytes = encoded.to_le_bytes();
        self.bytecode[label.0 + 1] = bytes[0];
        self.bytecode[label.0 + 2] = bytes[1];
    }

    /// Emits a jump to an already-known (usually backward) target.
    pub fn emit_jump_to(&mut self, op: Opcode, target: usize) {
        self.emit_arg(op, i32::try_from(target).unwrap_or(i32::MAX));
    }

    /// Overwrites the argument of the instruction at `instr_offset`.
    ///
    /// Used to fix up free-variable indices once a scope's final cell count
    /// is known: `LoadDeref`/`StoreDeref` of a free variable index past the
    /// cells, and cells keep growing until the scope finishes.
    pub fn patch_arg_at(&mut self, instr_offset: usize, arg: u16) {
        let bytes = arg.to_le_bytes();
        self.bytecode[instr_offset + 1] = bytes[0];
        self.bytecode[instr_offset + 2] = bytes[1];
    }

    /// Adds a constant, deduplicating primitive equal values.
    ///
    /// Container constants and heavyweight numeric constants are always
    /// appended: equality on them is expensive or structurally unsafe.
    #[must_use]
    pub fn add_const(&mut self, value: Value) -> u16 {
        if value.is_dedupable() {
            if let Some(index) = self.constants.iter().position(|existing| existing.dedup_eq(&value)) {
                return u16::try_from(index).unwrap_or(u16::MAX);
            }
        }
        let index = self.constants.len();
        if index > usize::from(u16::MAX) {
            self.errors.push(CompileError::new(
                &self.filename,
                self.current_range,
                "constant pool exceeds 16-bit index range",
            ));
            return u16::MAX;
        }
        self.constants.push(value);
        u16::try_from(index).unwrap_or(u16::MAX)
    }

    /// Adds a name to the names table, deduplicating by string equality.
    #[must_use]
    pub fn add_name(&mut self, name: &str) -> u16 {
        let (index, _) = self.names.insert_full(name.to_owned());
        if index > usize::from(u16::MAX) {
            self.errors.push(CompileError::new(
                &self.filename,
                self.current_range,
                "names table exceeds 16-bit index range",
            ));
            return u16::MAX;
        }
        u16::try_from(index).unwrap_or(u16::MAX)
    }

    /// Records the variable name for a local slot, extending the table as
    /// needed. The first name recorded for a slot wins.
    pub fn note_varname(&mut self, slot: u16, name: &str) {
        let slot = usize::from(slot);
        if slot >= self.varnames.len() {
            self.varnames.resize(slot + 1, None);
        }
        if self.varnames[slot].is_none() {
            self.varnames[slot] = Some(name.to_owned());
        }
    }

    /// Sets the stack depth to an absolute value at a branch reconvergence.
    pub fn set_stack_depth(&mut self, depth: u16) {
        self.current_stack_depth = depth;
        self.max_stack_depth = self.max_stack_depth.max(depth);
    }

    /// Manually adjusts stack depth where the effect cannot be derived from
    /// the opcode alone (exception handler entry, pattern cleanup paths).
    pub fn adjust_stack_depth(&mut self, delta: i16) {
        self.adjust_stack(delta);
    }

    fn adjust_stack(&mut self, delta: i16) {
        let depth = i32::from(self.current_stack_depth) + i32::from(delta);
        debug_assert!(depth >= 0, "stack depth went negative: {depth}");
        self.current_stack_depth = u16::try_from(depth.max(0)).unwrap_or(u16::MAX);
        self.max_stack_depth = self.max_stack_depth.max(self.current_stack_depth);
    }

    /// Computes the stack effect of argument-dependent opcodes.
    fn track_arg_effect(&mut self, op: Opcode, arg: u16) {
        let n = i32::from(arg);
        let effect: i32 = match op {
            Opcode::BuildList | Opcode::BuildTuple | Opcode::BuildSet => 1 - n,
            Opcode::BuildMap => 1 - 2 * n,
            Opcode::UnpackSequence => n - 1,
            Opcode::ExtractStar => {
                let before = n >> 8;
                let after = n & 0xFF;
                before + after
            }
            Opcode::RaiseVarargs => -n,
            Opcode::Call => -n,
            Opcode::CallKw | Opcode::CallMethod => -(n + 1),
            Opcode::CallEx => -(1 + (n & 1)),
            Opcode::MakeFunction => -(1 + (n & 1) + ((n >> 1) & 1)),
            _ => i32::from(op.stack_effect().unwrap_or(0)),
        };
        self.adjust_stack(i16::try_from(effect).unwrap_or(0));
    }

    /// Records instruction start metadata before opcode emission so the
    /// peephole pass can iterate boundaries without decoding raw bytes.
    fn start_instruction(&mut self) {
        self.instruction_offsets.push(self.bytecode.len());
    }

    /// Drains emitter-detected errors into the caller's sink.
    pub fn take_errors(&mut self, sink: &mut Vec<CompileError>) {
        sink.append(&mut self.errors);
    }

    /// Finishes the code object: seals the line table, runs the peephole
    /// pass, densifies varnames, and assembles the final tables.
    #[must_use]
    #[expect(clippy::too_many_arguments, reason = "one-shot assembly of the code object header")]
    pub fn finish(
        mut self,
        name: String,
        first_line: u32,
        arg_count: u16,
        kwonly_arg_count: u16,
        flags: CodeFlags,
        cellvars: Vec<String>,
        freevars: Vec<String>,
        errors: &mut Vec<CompileError>,
    ) -> CodeObject {
        self.seal_line();
        optimizer::peephole(
            &mut self.bytecode,
            &self.instruction_offsets,
            &mut self.constants,
            &self.line_table,
        );
        errors.append(&mut self.errors);

        let varnames = self.varnames.into_iter().map(Option::unwrap_or_default).collect();
        CodeObject {
            bytecode: self.bytecode,
            constants: self.constants,
            names: self.names.into_iter().collect(),
            varnames,
            cellvars,
            freevars,
            arg_count,
            kwonly_arg_count,
            flags,
            stack_size: self.max_stack_depth,
            first_line,
            filename: self.filename,
            name,
            line_table: self.line_table,
        }
    }
}
