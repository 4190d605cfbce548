//! Primitive types carried by every IR expression.
//!
//! A [`Type`] is a type code (int/uint/float/handle), a bit width, and a
//! lane count. Scalars have `lanes == 1`; vectors have `lanes > 1`. The
//! lowering passes manipulate lane counts constantly (widening during
//! vectorization, collapsing during reductions), so the helpers here are
//! deliberately cheap `Copy` operations.

use serde::{Deserialize, Serialize};

/// The kind of value a [`Type`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeCode {
    /// Signed two's-complement integer.
    Int,
    /// Unsigned integer. Single-bit unsigned is the boolean type.
    UInt,
    /// IEEE float.
    Float,
    /// An opaque pointer-sized handle (buffer descriptors, strings).
    Handle,
}

/// A primitive scalar or vector type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Type {
    pub code: TypeCode,
    pub bits: u8,
    pub lanes: u16,
}

impl Type {
    /// A signed integer scalar of the given bit width.
    pub fn int(bits: u8) -> Type {
        Type { code: TypeCode::Int, bits, lanes: 1 }
    }

    /// An unsigned integer scalar of the given bit width.
    pub fn uint(bits: u8) -> Type {
        Type { code: TypeCode::UInt, bits, lanes: 1 }
    }

    /// An IEEE float scalar of the given bit width.
    pub fn float(bits: u8) -> Type {
        Type { code: TypeCode::Float, bits, lanes: 1 }
    }

    /// The scalar boolean type (uint with a single bit).
    pub fn bool_scalar() -> Type {
        Type { code: TypeCode::UInt, bits: 1, lanes: 1 }
    }

    /// A boolean vector with the given lane count.
    pub fn bool_vector(lanes: u16) -> Type {
        Type { code: TypeCode::UInt, bits: 1, lanes }
    }

    /// An opaque pointer-sized handle.
    pub fn handle() -> Type {
        Type { code: TypeCode::Handle, bits: 64, lanes: 1 }
    }

    /// The lane-1 version of this type.
    pub fn element_of(self) -> Type {
        Type { lanes: 1, ..self }
    }

    /// This type with a different lane count.
    pub fn with_lanes(self, lanes: u16) -> Type {
        Type { lanes, ..self }
    }

    pub fn is_scalar(self) -> bool {
        self.lanes == 1
    }

    pub fn is_vector(self) -> bool {
        self.lanes > 1
    }

    pub fn is_bool(self) -> bool {
        self.code == TypeCode::UInt && self.bits == 1
    }

    pub fn is_int(self) -> bool {
        self.code == TypeCode::Int
    }

    pub fn is_uint(self) -> bool {
        self.code == TypeCode::UInt
    }

    pub fn is_float(self) -> bool {
        self.code == TypeCode::Float
    }

    pub fn is_handle(self) -> bool {
        self.code == TypeCode::Handle
    }

    /// Bytes per scalar element, rounding single-bit booleans up to one.
    pub fn bytes(self) -> u32 {
        ((self.bits as u32) + 7) / 8
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let base = match self.code {
            TypeCode::Int => "int",
            TypeCode::UInt => {
                if self.bits == 1 {
                    return write_lanes(f, "bool", None, self.lanes);
                }
                "uint"
            }
            TypeCode::Float => "float",
            TypeCode::Handle => "handle",
        };
        write_lanes(f, base, Some(self.bits), self.lanes)
    }
}

fn write_lanes(
    f: &mut std::fmt::Formatter<'_>,
    base: &str,
    bits: Option<u8>,
    lanes: u16,
) -> std::fmt::Result {
    match bits {
        Some(b) => write!(f, "{base}{b}")?,
        None => write!(f, "{base}")?,
    }
    if lanes > 1 {
        write!(f, "x{lanes}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_constructors() {
        assert!(Type::int(32).is_int());
        assert!(Type::uint(8).is_uint());
        assert!(Type::float(64).is_float());
        assert!(Type::bool_scalar().is_bool());
        assert!(Type::handle().is_handle());
        assert!(Type::int(32).is_scalar());
    }

    #[test]
    fn lane_manipulation() {
        let v = Type::int(32).with_lanes(8);
        assert!(v.is_vector());
        assert_eq!(v.element_of(), Type::int(32));
        assert_eq!(v.with_lanes(1), Type::int(32));
    }

    #[test]
    fn bool_is_single_bit_uint() {
        assert_eq!(Type::bool_scalar(), Type::uint(1));
        assert!(Type::bool_vector(4).is_bool());
        assert!(!Type::uint(8).is_bool());
    }

    #[test]
    fn byte_sizes() {
        assert_eq!(Type::int(32).bytes(), 4);
        assert_eq!(Type::uint(8).bytes(), 1);
        assert_eq!(Type::bool_scalar().bytes(), 1);
        assert_eq!(Type::float(64).bytes(), 8);
    }

    #[test]
    fn display() {
        assert_eq!(Type::int(32).to_string(), "int32");
        assert_eq!(Type::int(32).with_lanes(4).to_string(), "int32x4");
        assert_eq!(Type::bool_scalar().to_string(), "bool");
        assert_eq!(Type::float(32).with_lanes(8).to_string(), "float32x8");
    }
}
