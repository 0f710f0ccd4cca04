//! Opcode definitions for the stack-machine code objects.
//!
//! Every instruction is either one byte (no argument) or three bytes: the
//! opcode followed by a 16-bit little-endian argument. Jump arguments are
//! absolute byte offsets of the target instruction.
//!
//! The argument space is also used for two documented sentinels:
//! [`Opcode::MatchSequence`] accepts `0xFFFF` ("any length"), and signed
//! arguments such as negative constants in `ExtractStar` packing are stored
//! as two's-complement `u16`.

use strum::FromRepr;

/// One opcode of the virtual machine's instruction set.
///
/// Stack effects are written `[before] -> [after]` with the top of the
/// stack on the right.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, serde::Serialize, serde::Deserialize)]
pub enum Opcode {
    // === Stack manipulation ===
    /// Does nothing. Emitted by the peephole pass to keep rewrites
    /// size-preserving.
    Nop,
    /// Discard the top of stack.
    Pop,
    /// Duplicate the top of stack.
    Dup,
    /// Duplicate the top two values: `[a, b] -> [a, b, a, b]`.
    Dup2,
    /// Swap the top two values: `[a, b] -> [b, a]`.
    Rot2,
    /// Rotate the top three values: `[a, b, c] -> [c, a, b]`.
    Rot3,

    // === Constants ===
    /// Push a constant from the pool. Arg: constant index.
    LoadConst,
    /// Push `None` without touching the constant pool.
    LoadNone,

    // === Local variables (function scopes) ===
    /// Push a local by slot. Arg: index into `varnames`.
    ///
    /// If the slot has been promoted to a cell (see `cellvars` and the
    /// cell's original index), the slot holds the cell and the VM reads and
    /// writes through it; instructions emitted before the promotion keep
    /// operating on the same slot.
    LoadFast,
    /// Pop and store into a local slot. Arg: index into `varnames`.
    StoreFast,
    /// Unbind a local slot. Arg: index into `varnames`.
    DeleteFast,

    // === Module-level and dynamic name access ===
    /// Push a global (falling back to builtins). Arg: index into `names`.
    LoadGlobal,
    /// Pop and store a global. Arg: index into `names`.
    StoreGlobal,
    /// Unbind a global. Arg: index into `names`.
    DeleteGlobal,
    /// Push a name resolved dynamically: local namespace, then global, then
    /// builtins. Used in module and class bodies. Arg: index into `names`.
    LoadName,
    /// Pop and store into the innermost namespace. Arg: index into `names`.
    StoreName,
    /// Unbind a name from the innermost namespace. Arg: index into `names`.
    DeleteName,

    // === Closure cells ===
    /// Push the value held by a cell. Arg: cell index; indices below
    /// `len(cellvars)` address this code's own cells, the rest address
    /// `freevars` captured from enclosing scopes.
    LoadDeref,
    /// Pop and store through a cell. Arg: as for `LoadDeref`.
    StoreDeref,

    // === Attributes ===
    /// Replace the object on top with one of its attributes. Arg: `names` index.
    LoadAttr,
    /// Store into an attribute: `[value, obj] -> []`. Arg: `names` index.
    StoreAttr,
    /// Delete an attribute from the object on top. Arg: `names` index.
    DeleteAttr,

    // === Subscripts ===
    /// Index: `[obj, index] -> [obj[index]]`.
    BinarySubscr,
    /// Store: `[value, obj, index] -> []`, performing `obj[index] = value`.
    StoreSubscr,
    /// Delete: `[obj, index] -> []`, performing `del obj[index]`.
    DeleteSubscr,

    // === Binary arithmetic and bitwise (all `[a, b] -> [a op b]`) ===
    BinaryAdd,
    BinarySub,
    BinaryMul,
    BinaryDiv,
    BinaryFloorDiv,
    BinaryMod,
    BinaryPow,
    BinaryMatMul,
    BinaryLShift,
    BinaryRShift,
    BinaryAnd,
    BinaryOr,
    BinaryXor,

    // === In-place variants used by augmented assignment ===
    InPlaceAdd,
    InPlaceSub,
    InPlaceMul,
    InPlaceDiv,
    InPlaceFloorDiv,
    InPlaceMod,
    InPlacePow,
    InPlaceMatMul,
    InPlaceLShift,
    InPlaceRShift,
    InPlaceAnd,
    InPlaceOr,
    InPlaceXor,

    // === Unary (all `[a] -> [op a]`) ===
    UnaryNegative,
    UnaryPositive,
    UnaryNot,
    UnaryInvert,

    // === Comparisons (all `[a, b] -> [bool]`) ===
    CompareEq,
    CompareNotEq,
    CompareLt,
    CompareLtE,
    CompareGt,
    CompareGtE,
    Is,
    IsNot,
    In,
    NotIn,
    /// Exception-handler type test: `[exc, type] -> [bool]`. Unlike the
    /// plain comparisons, the type may be a tuple of exception types.
    ExceptionMatch,

    // === Container builders ===
    /// Pop `arg` values, push a list of them (first popped last).
    BuildList,
    /// Pop `arg` values, push a tuple.
    BuildTuple,
    /// Pop `arg` values, push a set.
    BuildSet,
    /// Pop `arg` key/value pairs (`2 * arg` values), push a dict.
    BuildMap,

    // === Comprehension appends ===
    /// Pop a value and append it to the list `arg + 1` entries below the
    /// (pre-pop) top; `arg` equals the number of iterators sitting between
    /// the container and the value.
    ListAppend,
    /// As `ListAppend` for sets.
    SetAdd,
    /// Pop a value and a key and insert into the dict `arg + 2` entries
    /// below the (pre-pop) top.
    MapAdd,

    // === Unpacking ===
    /// Pop a sequence of exactly `arg` elements and push them so the first
    /// element ends on top, ready for left-to-right stores. A length
    /// mismatch raises at run time.
    UnpackSequence,
    /// Starred unpacking. Arg packs two u8 counts, `before << 8 | after`:
    /// pop a sequence, push the trailing `after` elements, a list of the
    /// middle, then the leading `before` elements, so stores again run left
    /// to right. Shared between starred assignment and sequence patterns.
    ExtractStar,

    // === Control flow (jump args are absolute instruction offsets) ===
    Jump,
    /// If the top is truthy, jump leaving it on the stack; else pop it.
    JumpIfTrueOrPop,
    /// If the top is falsy, jump leaving it on the stack; else pop it.
    JumpIfFalseOrPop,
    /// Pop the top; jump when it is truthy.
    PopJumpIfTrue,
    /// Pop the top; jump when it is falsy.
    PopJumpIfFalse,
    /// Advance the iterator on top: push the next element, or on
    /// exhaustion pop the iterator and jump to the argument offset.
    ForIter,
    /// Replace the top with `iter(top)`.
    GetIter,

    // === Exception machinery ===
    /// Register an exception handler at the argument offset. When an
    /// exception unwinds to this block, the VM pushes the exception value
    /// and jumps to the handler.
    SetupExcept,
    /// Register a finally block at the argument offset; the VM routes both
    /// normal and exceptional exits of the region through it.
    SetupFinally,
    /// Deregister the innermost handler block on normal completion.
    PopExcept,
    /// Clear the currently-handled exception state.
    ClearException,
    /// Conclude a finally body, re-raising any pending exception.
    EndFinally,
    /// Raise. Arg 0: re-raise the current exception. Arg 1: pop an
    /// exception and raise it. Arg 2: pop a cause then an exception and
    /// raise with `__cause__` set.
    RaiseVarargs,

    // === Calls ===
    /// Call: `[callable, a1..an] -> [result]` with `arg = n`.
    Call,
    /// Keyword call: `[callable, positional.., keyword-values.., names] ->
    /// [result]`. `names` is a `StrArray` constant of the keyword names;
    /// `arg` counts positional plus keyword values.
    CallKw,
    /// Unpacking call: `[callable, args-tuple] -> [result]`, or with arg
    /// bit 0 set, `[callable, args-tuple, kwargs-dict] -> [result]`.
    CallEx,
    /// Push a bound method: `[obj] -> [obj, method]`. Arg: `names` index.
    LoadMethod,
    /// Call a method pushed by `LoadMethod`:
    /// `[obj, method, a1..an] -> [result]` with `arg = n`.
    CallMethod,

    // === Function and class construction ===
    /// Build a function from `[defaults-tuple?, kwdefaults-map?, code,
    /// qualname]`. Arg bit 0: a defaults tuple is present; bit 1: a map of
    /// keyword-only defaults is present. Free variables listed in the
    /// child code's `freevars` are bound to the enclosing frame's cells by
    /// the VM, matched via the enclosing code's `cellvars`/`freevars`.
    MakeFunction,
    /// Push the class builder. The builder is called with the class-body
    /// function, the class name, and the bases; it fills the `__class__`
    /// cell declared by the class body, if any.
    LoadBuildClass,
    /// Push the local namespace mapping of the executing frame. Used at the
    /// end of class bodies.
    LoadLocals,

    // === Imports ===
    /// Import a module: `[fromlist] -> [module]`. The fromlist is a
    /// `StrArray` constant or `None`. Arg: `names` index of the (possibly
    /// dotted) module name; without a fromlist the top-level package is
    /// pushed.
    ImportName,
    /// Push one attribute from the module on top (which stays):
    /// `[module] -> [module, attr]`. Arg: `names` index.
    ImportFrom,
    /// Pop a module and bind all its public names in the current namespace.
    ImportStar,

    // === Pattern matching ===
    /// Sequence-shape test: `[subj] -> [subj, bool]`. True when the subject
    /// is a non-string sequence of exactly `arg` elements. The sentinel arg
    /// `0xFFFF` (the two's-complement spelling of -1) means "any length";
    /// this deliberate reuse of the argument space is defined here, not at
    /// use sites.
    MatchSequence,
    /// Starred-sequence test: `[subj] -> [subj, bool]`. True when the
    /// subject is a non-string sequence of at least `arg` elements.
    MatchStar,
    /// Mapping-shape test: `[subj] -> [subj, bool]`.
    MatchMapping,
    /// Key extraction: `[subj, keys-tuple] -> [subj, values-tuple, bool]`.
    /// True when the mapping subject contains all `arg` keys; the values
    /// tuple holds the corresponding values (or `None` on failure).
    MatchKeys,
    /// Class pattern test: `[subj, cls, kwnames] -> [subj, attrs, bool]`.
    /// `kwnames` is a `StrArray` constant; `arg` is the count of positional
    /// sub-patterns resolved through `__match_args__`. On success `attrs`
    /// is a tuple of the positional then keyword attribute values.
    MatchClass,
    /// Push a shallow copy of the mapping on top: `[subj] -> [subj, copy]`.
    /// Used to build the `**rest` binding of mapping patterns.
    CopyDict,

    // === Generators and coroutines ===
    /// Pop a value and suspend, yielding it; on resume push the sent value.
    YieldValue,
    /// Delegate to the iterator on top until exhaustion, pushing its final
    /// value: `[iter] -> [result]`.
    YieldFrom,
    /// Replace the top with its awaitable: `[obj] -> [awaitable]`.
    GetAwaitable,

    /// Pop the return value and leave the frame.
    Return,
}

impl Opcode {
    /// Whether this opcode carries a 16-bit argument.
    #[must_use]
    pub fn has_arg(self) -> bool {
        matches!(
            self,
            Self::LoadConst
                | Self::LoadFast
                | Self::StoreFast
                | Self::DeleteFast
                | Self::LoadGlobal
                | Self::StoreGlobal
                | Self::DeleteGlobal
                | Self::LoadName
                | Self::StoreName
                | Self::DeleteName
                | Self::LoadDeref
                | Self::StoreDeref
                | Self::LoadAttr
                | Self::StoreAttr
                | Self::DeleteAttr
                | Self::BuildList
                | Self::BuildTuple
                | Self::BuildSet
                | Self::BuildMap
                | Self::ListAppend
                | Self::SetAdd
                | Self::MapAdd
                | Self::UnpackSequence
                | Self::ExtractStar
                | Self::Jump
                | Self::JumpIfTrueOrPop
                | Self::JumpIfFalseOrPop
                | Self::PopJumpIfTrue
                | Self::PopJumpIfFalse
                | Self::ForIter
                | Self::SetupExcept
                | Self::SetupFinally
                | Self::RaiseVarargs
                | Self::Call
                | Self::CallKw
                | Self::CallEx
                | Self::LoadMethod
                | Self::CallMethod
                | Self::MakeFunction
                | Self::ImportName
                | Self::ImportFrom
                | Self::MatchSequence
                | Self::MatchStar
                | Self::MatchKeys
                | Self::MatchClass
        )
    }

    /// Whether this opcode's argument is an absolute jump target.
    #[must_use]
    pub fn is_jump(self) -> bool {
        matches!(
            self,
            Self::Jump
                | Self::JumpIfTrueOrPop
                | Self::JumpIfFalseOrPop
                | Self::PopJumpIfTrue
                | Self::PopJumpIfFalse
                | Self::ForIter
                | Self::SetupExcept
                | Self::SetupFinally
        )
    }

    /// Whether execution never falls through to the next instruction.
    #[must_use]
    pub fn is_unconditional_exit(self) -> bool {
        matches!(self, Self::Jump | Self::Return)
    }

    /// Fixed stack effect, when the opcode has one.
    ///
    /// Opcodes whose effect depends on their argument (`Build*`, calls,
    /// unpacking, `RaiseVarargs`, `MakeFunction`) return `None`; the builder
    /// computes their effect from the argument. Conditional jumps report
    /// their fall-through effect.
    #[must_use]
    pub fn stack_effect(self) -> Option<i16> {
        let effect = match self {
            Self::Nop | Self::Rot2 | Self::Rot3 => 0,
            Self::Pop => -1,
            Self::Dup => 1,
            Self::Dup2 => 2,
            Self::LoadConst
            | Self::LoadNone
            | Self::LoadFast
            | Self::LoadGlobal
            | Self::LoadName
            | Self::LoadDeref
            | Self::LoadBuildClass
            | Self::LoadLocals
            | Self::LoadMethod
            | Self::ImportFrom => 1,
            Self::StoreFast | Self::StoreGlobal | Self::StoreName | Self::StoreDeref => -1,
            Self::DeleteFast | Self::DeleteGlobal | Self::DeleteName => 0,
            Self::LoadAttr => 0,
            Self::StoreAttr => -2,
            Self::DeleteAttr => -1,
            Self::BinarySubscr => -1,
            Self::StoreSubscr => -3,
            Self::DeleteSubscr => -2,
            Self::BinaryAdd
            | Self::BinarySub
            | Self::BinaryMul
            | Self::BinaryDiv
            | Self::BinaryFloorDiv
            | Self::BinaryMod
            | Self::BinaryPow
            | Self::BinaryMatMul
            | Self::BinaryLShift
            | Self::BinaryRShift
            | Self::BinaryAnd
            | Self::BinaryOr
            | Self::BinaryXor
            | Self::InPlaceAdd
            | Self::InPlaceSub
            | Self::InPlaceMul
            | Self::InPlaceDiv
            | Self::InPlaceFloorDiv
            | Self::InPlaceMod
            | Self::InPlacePow
            | Self::InPlaceMatMul
            | Self::InPlaceLShift
            | Self::InPlaceRShift
            | Self::InPlaceAnd
            | Self::InPlaceOr
            | Self::InPlaceXor => -1,
            Self::UnaryNegative | Self::UnaryPositive | Self::UnaryNot | Self::UnaryInvert => 0,
            Self::CompareEq
            | Self::CompareNotEq
            | Self::CompareLt
            | Self::CompareLtE
            | Self::CompareGt
            | Self::CompareGtE
            | Self::Is
            | Self::IsNot
            | Self::In
            | Self::NotIn
            | Self::ExceptionMatch => -1,
            Self::ListAppend | Self::SetAdd => -1,
            Self::MapAdd => -2,
            Self::Jump | Self::SetupExcept | Self::SetupFinally | Self::PopExcept | Self::ClearException
            | Self::EndFinally => 0,
            Self::PopJumpIfTrue | Self::PopJumpIfFalse => -1,
            // Fall-through pops the tested value; the jump edge keeps it.
            Self::JumpIfTrueOrPop | Self::JumpIfFalseOrPop => -1,
            // Fall-through pushes the next element; exhaustion pops the iterator.
            Self::ForIter => 1,
            Self::GetIter | Self::GetAwaitable | Self::YieldValue | Self::YieldFrom => 0,
            Self::ImportName => 0,
            Self::ImportStar => -1,
            Self::MatchSequence | Self::MatchStar | Self::MatchMapping | Self::CopyDict => 1,
            Self::MatchKeys => 1,
            Self::MatchClass => 0,
            Self::Return => -1,
            Self::BuildList
            | Self::BuildTuple
            | Self::BuildSet
            | Self::BuildMap
            | Self::UnpackSequence
            | Self::ExtractStar
            | Self::RaiseVarargs
            | Self::Call
            | Self::CallKw
            | Self::CallEx
            | Self::CallMethod
            | Self::MakeFunction => return None,
        };
        Some(effect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_discriminants() {
        for byte in 0..=u8::MAX {
            if let Some(op) = Opcode::from_repr(byte) {
                assert_eq!(op as u8, byte);
            }
        }
        assert_eq!(Opcode::from_repr(Opcode::Return as u8), Some(Opcode::Return));
    }

    #[test]
    fn arg_classification() {
        assert!(Opcode::LoadConst.has_arg());
        assert!(Opcode::ForIter.has_arg());
        assert!(!Opcode::Pop.has_arg());
        assert!(!Opcode::Return.has_arg());
        assert!(!Opcode::MatchMapping.has_arg());
        assert!(Opcode::MatchSequence.has_arg());
    }

    #[test]
    fn jump_classification() {
        assert!(Opcode::Jump.is_jump());
        assert!(Opcode::SetupFinally.is_jump());
        assert!(!Opcode::Call.is_jump());
        assert!(Opcode::Jump.is_unconditional_exit());
        assert!(!Opcode::PopJumpIfTrue.is_unconditional_exit());
    }

    #[test]
    fn variable_effects_are_unfixed() {
        assert_eq!(Opcode::Call.stack_effect(), None);
        assert_eq!(Opcode::BuildList.stack_effect(), None);
        assert_eq!(Opcode::BinaryAdd.stack_effect(), Some(-1));
        assert_eq!(Opcode::Dup2.stack_effect(), Some(2));
    }
}
