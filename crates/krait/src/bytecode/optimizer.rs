//! Peephole optimization over emitted bytecode.
//!
//! Every rewrite preserves instruction-stream length so jump targets and
//! line-table offsets stay valid; freed bytes become [`Opcode::Nop`]. A
//! rewrite is skipped when a jump target or a line-table boundary falls
//! between the instructions it would fuse.

use ahash::AHashSet;

use crate::value::Value;

use super::{code::LineEntry, op::Opcode};

/// Runs the single peephole pass over a finished instruction stream.
///
/// `instruction_offsets` are the emission-order instruction boundaries
/// recorded by the builder; rewrites keep them byte-accurate because no
/// rewrite changes the length of the affected region.
pub(crate) fn peephole(
    bytecode: &mut [u8],
    instruction_offsets: &[usize],
    constants: &mut Vec<Value>,
    line_table: &[LineEntry],
) {
    let jump_targets = collect_jump_targets(bytecode, instruction_offsets);
    let line_starts: AHashSet<usize> = line_table.iter().map(|entry| entry.start as usize).collect();

    let mut idx = 0;
    while idx < instruction_offsets.len() {
        let at = instruction_offsets[idx];
        let Some(op) = Opcode::from_repr(bytecode[at]) else {
            idx += 1;
            continue;
        };

        // Dead code after an unconditional exit, up to the next jump target.
        if op.is_unconditional_exit() {
            let dead_start = at + if op.has_arg() { 3 } else { 1 };
            let mut dead_end = dead_start;
            while dead_end < bytecode.len() && !jump_targets.contains(&dead_end) {
                dead_end += 1;
            }
            for byte in &mut bytecode[dead_start..dead_end] {
                *byte = Opcode::Nop as u8;
            }
            // Skip past what we just blanked.
            while idx + 1 < instruction_offsets.len() && instruction_offsets[idx + 1] < dead_end {
                idx += 1;
            }
            idx += 1;
            continue;
        }

        let Some(&next_at) = instruction_offsets.get(idx + 1) else {
            idx += 1;
            continue;
        };

        if op == Opcode::LoadConst && !jump_targets.contains(&next_at) {
            let arg = u16::from_le_bytes([bytecode[at + 1], bytecode[at + 2]]);
            let next_op = Opcode::from_repr(bytecode[next_at]);

            // `LoadConst None; Return` -> `LoadNone; Return`.
            if next_op == Some(Opcode::Return) && constants.get(usize::from(arg)).is_some_and(Value::is_none) {
                bytecode[at] = Opcode::LoadNone as u8;
                bytecode[at + 1] = Opcode::Nop as u8;
                bytecode[at + 2] = Opcode::Nop as u8;
                idx += 2;
                continue;
            }

            let crosses_line = line_starts.contains(&next_at);

            // Duplicated `LoadConst k; LoadConst k` -> `LoadConst k; Dup`.
            if next_op == Some(Opcode::LoadConst)
                && !crosses_line
                && bytecode[next_at + 1] == bytecode[at + 1]
                && bytecode[next_at + 2] == bytecode[at + 2]
            {
                bytecode[next_at] = Opcode::Dup as u8;
                bytecode[next_at + 1] = Opcode::Nop as u8;
                bytecode[next_at + 2] = Opcode::Nop as u8;
                idx += 2;
                continue;
            }

            // Fold unary operators applied to numeric literals.
            if !crosses_line
                && let Some(folded) = next_op.and_then(|unary| fold_unary(unary, constants.get(usize::from(arg))))
                && constants.len() <= usize::from(u16::MAX)
            {
                constants.push(folded);
                let new_arg = u16::try_from(constants.len() - 1).unwrap_or(u16::MAX);
                let bytes = new_arg.to_le_bytes();
                bytecode[at + 1] = bytes[0];
                bytecode[at + 2] = bytes[1];
                bytecode[next_at] = Opcode::Nop as u8;
                idx += 2;
                continue;
            }
        }

        idx += 1;
    }
}

/// Folds one unary opcode over a literal constant, when safe.
///
/// Only bounded numeric literals fold: big integers and anything whose
/// negation could overflow are left to the VM.
fn fold_unary(op: Opcode, value: Option<&Value>) -> Option<Value> {
    match (op, value?) {
        (Opcode::UnaryNegative, Value::Int(v)) => v.checked_neg().map(Value::Int),
        (Opcode::UnaryNegative, Value::Float(v)) => Some(Value::Float(-v)),
        (Opcode::UnaryInvert, Value::Int(v)) => v.checked_neg().and_then(|n| n.checked_sub(1)).map(Value::Int),
        (Opcode::UnaryPositive, Value::Int(v)) => Some(Value::Int(*v)),
        (Opcode::UnaryPositive, Value::Float(v)) => Some(Value::Float(*v)),
        _ => None,
    }
}

/// Collects every absolute offset that an emitted jump can land on.
fn collect_jump_targets(bytecode: &[u8], instruction_offsets: &[usize]) -> AHashSet<usize> {
    let mut targets = AHashSet::new();
    for &at in instruction_offsets {
        let Some(op) = Opcode::from_repr(bytecode[at]) else { continue };
        if op.is_jump() && at + 2 < bytecode.len() {
            let arg = u16::from_le_bytes([bytecode[at + 1], bytecode[at + 2]]);
            targets.insert(usize::from(arg));
        }
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_const_none_return_becomes_load_none() {
        let mut constants = vec![Value::None];
        let mut bytecode = vec![Opcode::LoadConst as u8, 0, 0, Opcode::Return as u8];
        let offsets = vec![0, 3];
        peephole(&mut bytecode, &offsets, &mut constants, &[]);
        assert_eq!(
            bytecode,
            vec![Opcode::LoadNone as u8, Opcode::Nop as u8, Opcode::Nop as u8, Opcode::Return as u8]
        );
    }

    #[test]
    fn duplicate_load_const_collapses_to_dup() {
        let mut constants = vec![Value::Int(7)];
        let mut bytecode = vec![
            Opcode::LoadConst as u8,
            0,
            0,
            Opcode::LoadConst as u8,
            0,
            0,
            Opcode::BinaryAdd as u8,
            Opcode::Return as u8,
        ];
        let offsets = vec![0, 3, 6, 7];
        peephole(&mut bytecode, &offsets, &mut constants, &[]);
        assert_eq!(bytecode[3], Opcode::Dup as u8);
        assert_eq!(bytecode[4], Opcode::Nop as u8);
    }

    #[test]
    fn unary_negative_folds_literal() {
        let mut constants = vec![Value::Int(5)];
        let mut bytecode = vec![
            Opcode::LoadConst as u8,
            0,
            0,
            Opcode::UnaryNegative as u8,
            Opcode::Return as u8,
        ];
        let offsets = vec![0, 3, 4];
        peephole(&mut bytecode, &offsets, &mut constants, &[]);
        assert_eq!(bytecode[3], Opcode::Nop as u8);
        let arg = u16::from_le_bytes([bytecode[1], bytecode[2]]);
        assert_eq!(constants[usize::from(arg)], Value::Int(-5));
    }

    #[test]
    fn rewrite_skipped_when_jump_targets_second_instruction() {
        // The jump lands on the second LoadConst, so collapsing it to Dup
        // would corrupt the jump edge.
        let mut constants = vec![Value::Int(1)];
        let mut bytecode = vec![
            Opcode::PopJumpIfFalse as u8,
            6,
            0,
            Opcode::LoadConst as u8,
            0,
            0,
            Opcode::LoadConst as u8,
            0,
            0,
            Opcode::Return as u8,
        ];
        let offsets = vec![0, 3, 6, 9];
        peephole(&mut bytecode, &offsets, &mut constants, &[]);
        assert_eq!(bytecode[6], Opcode::LoadConst as u8);
    }

    #[test]
    fn dead_code_after_jump_blanked_to_next_target() {
        let mut constants = Vec::new();
        let mut bytecode = vec![
            Opcode::Jump as u8,
            6,
            0,
            Opcode::LoadNone as u8,
            Opcode::Pop as u8,
            Opcode::LoadNone as u8,
            Opcode::LoadNone as u8,
            Opcode::Return as u8,
        ];
        let offsets = vec![0, 3, 4, 5, 6, 7];
        peephole(&mut bytecode, &offsets, &mut constants, &[]);
        assert_eq!(&bytecode[3..6], &[Opcode::Nop as u8, Opcode::Nop as u8, Opcode::Nop as u8]);
        assert_eq!(bytecode[6], Opcode::LoadNone as u8);
    }

    #[test]
    fn fold_skipped_across_line_boundary() {
        let mut constants = vec![Value::Int(5)];
        let mut bytecode = vec![
            Opcode::LoadConst as u8,
            0,
            0,
            Opcode::UnaryNegative as u8,
            Opcode::Return as u8,
        ];
        let offsets = vec![0, 3, 4];
        let line_table = vec![
            LineEntry { start: 0, end: 3, line: 1 },
            LineEntry { start: 3, end: 5, line: 2 },
        ];
        peephole(&mut bytecode, &offsets, &mut constants, &line_table);
        assert_eq!(bytecode[3], Opcode::UnaryNegative as u8);
    }
}
