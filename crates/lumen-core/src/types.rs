//! Element types and the type-trait registry.
//!
//! `ElementType` is the abstract precision tag carried by graph tensors.
//! `representation_of` maps a tag to its device value representation, and
//! `DeviceElement` ties each concrete Rust value type back to its tag so
//! kernels can be instantiated per precision.

use crate::{Error, Result};
use bytemuck::Pod;
use std::fmt;

/// Abstract numeric element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    Boolean,
    /// 8-bit exponent, 7-bit mantissa.
    BF16,
    /// 5-bit exponent, 10-bit mantissa.
    F16,
    F32,
    F64,
    /// Packed 4-bit signed integer.
    I4,
    I8,
    I16,
    I32,
    I64,
    /// Packed single-bit value.
    U1,
    /// Packed 4-bit unsigned integer.
    U4,
    U8,
    U16,
    U32,
    U64,
    Undefined,
}

impl ElementType {
    /// All tags, supported or not.
    pub const ALL: [ElementType; 17] = [
        ElementType::Boolean,
        ElementType::BF16,
        ElementType::F16,
        ElementType::F32,
        ElementType::F64,
        ElementType::I4,
        ElementType::I8,
        ElementType::I16,
        ElementType::I32,
        ElementType::I64,
        ElementType::U1,
        ElementType::U4,
        ElementType::U8,
        ElementType::U16,
        ElementType::U32,
        ElementType::U64,
        ElementType::Undefined,
    ];

    /// Check if this is a floating-point type.
    pub fn is_float(self) -> bool {
        matches!(
            self,
            ElementType::BF16 | ElementType::F16 | ElementType::F32 | ElementType::F64
        )
    }

    /// Check if this is an integer type (packed types included).
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            ElementType::I4
                | ElementType::I8
                | ElementType::I16
                | ElementType::I32
                | ElementType::I64
                | ElementType::U4
                | ElementType::U8
                | ElementType::U16
                | ElementType::U32
                | ElementType::U64
        )
    }

    /// Check if this type can hold negative values.
    pub fn is_signed(self) -> bool {
        self.is_float()
            || matches!(
                self,
                ElementType::I4
                    | ElementType::I8
                    | ElementType::I16
                    | ElementType::I32
                    | ElementType::I64
            )
    }

    /// Byte width of one element, failing for types without a device representation.
    pub fn size(self) -> Result<usize> {
        Ok(representation_of(self)?.byte_width)
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementType::Boolean => "boolean",
            ElementType::BF16 => "bf16",
            ElementType::F16 => "f16",
            ElementType::F32 => "f32",
            ElementType::F64 => "f64",
            ElementType::I4 => "i4",
            ElementType::I8 => "i8",
            ElementType::I16 => "i16",
            ElementType::I32 => "i32",
            ElementType::I64 => "i64",
            ElementType::U1 => "u1",
            ElementType::U4 => "u4",
            ElementType::U8 => "u8",
            ElementType::U16 => "u16",
            ElementType::U32 => "u32",
            ElementType::U64 => "u64",
            ElementType::Undefined => "undefined",
        };
        f.write_str(name)
    }
}

/// Concrete value representation used by device kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceRepr {
    Bool,
    BFloat16,
    Half,
    Float,
    Double,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
}

/// Size, alignment and kind of a device value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Representation {
    pub byte_width: usize,
    pub alignment: usize,
    pub kind: DeviceRepr,
}

impl Representation {
    const fn of(byte_width: usize, kind: DeviceRepr) -> Self {
        Self {
            byte_width,
            alignment: byte_width,
            kind,
        }
    }
}

/// Map an element type to its device representation.
///
/// Total over the supported tags. Sub-byte packed types and `Undefined` have
/// no addressable device representation and fail with
/// `Error::UnsupportedElementType`.
pub fn representation_of(dtype: ElementType) -> Result<Representation> {
    let repr = match dtype {
        ElementType::Boolean => Representation::of(1, DeviceRepr::Bool),
        ElementType::BF16 => Representation::of(2, DeviceRepr::BFloat16),
        ElementType::F16 => Representation::of(2, DeviceRepr::Half),
        ElementType::F32 => Representation::of(4, DeviceRepr::Float),
        ElementType::F64 => Representation::of(8, DeviceRepr::Double),
        ElementType::I8 => Representation::of(1, DeviceRepr::Int8),
        ElementType::I16 => Representation::of(2, DeviceRepr::Int16),
        ElementType::I32 => Representation::of(4, DeviceRepr::Int32),
        ElementType::I64 => Representation::of(8, DeviceRepr::Int64),
        ElementType::U8 => Representation::of(1, DeviceRepr::UInt8),
        ElementType::U16 => Representation::of(2, DeviceRepr::UInt16),
        ElementType::U32 => Representation::of(4, DeviceRepr::UInt32),
        ElementType::U64 => Representation::of(8, DeviceRepr::UInt64),
        ElementType::I4 | ElementType::U1 | ElementType::U4 | ElementType::Undefined => {
            return Err(Error::unsupported_type(dtype, "device representation"));
        }
    };
    Ok(repr)
}

/// A concrete value type that kernels can be instantiated for.
///
/// Float kernels widen elements to `f64` for arithmetic and narrow the
/// result back on store. Integer kernels widen to `i128` instead, which
/// holds every supported integer exactly; narrowing keeps the low bits, so
/// wrapping arithmetic in `i128` wraps the same way in the element type.
pub trait DeviceElement: Pod + Send + Sync + 'static {
    const ELEMENT_TYPE: ElementType;
    const IS_INTEGER: bool;

    fn to_f64(self) -> f64;
    fn from_f64(value: f64) -> Self;

    fn to_i128(self) -> i128;
    fn from_i128(value: i128) -> Self;
}

macro_rules! impl_float_element {
    ($ty:ty, $tag:ident) => {
        impl DeviceElement for $ty {
            const ELEMENT_TYPE: ElementType = ElementType::$tag;
            const IS_INTEGER: bool = false;

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }

            #[inline]
            fn from_f64(value: f64) -> Self {
                value as $ty
            }

            #[inline]
            fn to_i128(self) -> i128 {
                self as i128
            }

            #[inline]
            fn from_i128(value: i128) -> Self {
                value as $ty
            }
        }
    };
}

macro_rules! impl_integer_element {
    ($ty:ty, $tag:ident) => {
        impl DeviceElement for $ty {
            const ELEMENT_TYPE: ElementType = ElementType::$tag;
            const IS_INTEGER: bool = true;

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }

            #[inline]
            fn from_f64(value: f64) -> Self {
                value as $ty
            }

            #[inline]
            fn to_i128(self) -> i128 {
                self as i128
            }

            /// Keeps the low bits, so out-of-range values wrap.
            #[inline]
            fn from_i128(value: i128) -> Self {
                value as $ty
            }
        }
    };
}

impl_float_element!(f32, F32);
impl_float_element!(f64, F64);
impl_integer_element!(i8, I8);
impl_integer_element!(i16, I16);
impl_integer_element!(i32, I32);
impl_integer_element!(i64, I64);
impl_integer_element!(u8, U8);
impl_integer_element!(u16, U16);
impl_integer_element!(u32, U32);
impl_integer_element!(u64, U64);

impl DeviceElement for half::f16 {
    const ELEMENT_TYPE: ElementType = ElementType::F16;
    const IS_INTEGER: bool = false;

    #[inline]
    fn to_f64(self) -> f64 {
        half::f16::to_f64(self)
    }

    #[inline]
    fn from_f64(value: f64) -> Self {
        half::f16::from_f64(value)
    }

    #[inline]
    fn to_i128(self) -> i128 {
        half::f16::to_f64(self) as i128
    }

    #[inline]
    fn from_i128(value: i128) -> Self {
        half::f16::from_f64(value as f64)
    }
}

impl DeviceElement for half::bf16 {
    const ELEMENT_TYPE: ElementType = ElementType::BF16;
    const IS_INTEGER: bool = false;

    #[inline]
    fn to_f64(self) -> f64 {
        half::bf16::to_f64(self)
    }

    #[inline]
    fn from_f64(value: f64) -> Self {
        half::bf16::from_f64(value)
    }

    #[inline]
    fn to_i128(self) -> i128 {
        half::bf16::to_f64(self) as i128
    }

    #[inline]
    fn from_i128(value: i128) -> Self {
        half::bf16::from_f64(value as f64)
    }
}

/// Instantiate an expression for the concrete type behind an element tag.
///
/// The body must evaluate to a `lumen_core::Result`. Tags without a numeric
/// device element (booleans and packed types) produce
/// `Error::UnsupportedElementType`.
///
/// ```ignore
/// dispatch_element_type!(dtype, "relu", |T| launch_relu::<T>(ctx, input, output))
/// ```
#[macro_export]
macro_rules! dispatch_element_type {
    ($dtype:expr, $what:expr, |$t:ident| $body:expr) => {{
        match $dtype {
            $crate::ElementType::F16 => {
                type $t = $crate::half::f16;
                $body
            }
            $crate::ElementType::BF16 => {
                type $t = $crate::half::bf16;
                $body
            }
            $crate::ElementType::F32 => {
                type $t = f32;
                $body
            }
            $crate::ElementType::F64 => {
                type $t = f64;
                $body
            }
            $crate::ElementType::I8 => {
                type $t = i8;
                $body
            }
            $crate::ElementType::I16 => {
                type $t = i16;
                $body
            }
            $crate::ElementType::I32 => {
                type $t = i32;
                $body
            }
            $crate::ElementType::I64 => {
                type $t = i64;
                $body
            }
            $crate::ElementType::U8 => {
                type $t = u8;
                $body
            }
            $crate::ElementType::U16 => {
                type $t = u16;
                $body
            }
            $crate::ElementType::U32 => {
                type $t = u32;
                $body
            }
            $crate::ElementType::U64 => {
                type $t = u64;
                $body
            }
            other => Err($crate::Error::unsupported_type(other, $what)),
        }
    }};
}
