//! Constant-pool values produced by the compiler.
//!
//! These are intentionally detached from any runtime object model: the
//! constant pool stores plain data that the virtual machine turns into live
//! objects when a code object is executed. Integers that fit `i64` stay
//! unboxed; anything larger is kept as a [`num_bigint::BigInt`].

use num_bigint::BigInt;

use crate::bytecode::CodeObject;

/// A value in a code object's constant pool.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Value {
    None,
    Ellipsis,
    Bool(bool),
    /// An integer that fits the machine word.
    Int(i64),
    /// An integer literal that exceeds the `i64` range.
    BigInt(BigInt),
    Float(f64),
    /// A complex number. Imaginary literals produce a zero real part.
    Complex { real: f64, imag: f64 },
    Str(String),
    Bytes(Vec<u8>),
    /// A nested code object (function, class body, or comprehension).
    Code(Box<CodeObject>),
    /// A string array: keyword names for `CallKw` and from-lists for `ImportName`.
    StrArray(Vec<String>),
}

impl Value {
    /// Equality used for constant-pool deduplication.
    ///
    /// Only cheap primitives participate: container constants and heavyweight
    /// numeric constants are appended unconditionally, since equality on them
    /// is either expensive or structurally unsafe (two code objects comparing
    /// equal must still stay distinct). Floats compare by bit pattern so that
    /// `0.0` and `-0.0` keep separate slots.
    #[must_use]
    pub(crate) fn dedup_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) | (Self::Ellipsis, Self::Ellipsis) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            _ => false,
        }
    }

    /// Whether deduplication applies to this value at all.
    #[must_use]
    pub(crate) fn is_dedupable(&self) -> bool {
        matches!(
            self,
            Self::None | Self::Ellipsis | Self::Bool(_) | Self::Int(_) | Self::Float(_) | Self::Str(_) | Self::Bytes(_)
        )
    }

    /// True when the value is the `None` singleton.
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_dedup() {
        assert!(Value::Int(3).dedup_eq(&Value::Int(3)));
        assert!(!Value::Int(3).dedup_eq(&Value::Int(4)));
        assert!(Value::Str("a".into()).dedup_eq(&Value::Str("a".into())));
        assert!(!Value::Bool(true).dedup_eq(&Value::Int(1)));
    }

    #[test]
    fn signed_zero_floats_stay_distinct() {
        assert!(!Value::Float(0.0).dedup_eq(&Value::Float(-0.0)));
        assert!(Value::Float(1.5).dedup_eq(&Value::Float(1.5)));
    }

    #[test]
    fn heavyweight_values_never_dedup() {
        let big = Value::BigInt(BigInt::from(7));
        assert!(!big.is_dedupable());
        assert!(!big.dedup_eq(&big.clone()));
        assert!(!Value::StrArray(vec!["a".into()]).is_dedupable());
    }
}
