use std::fmt;

// DType — element types a tensor can hold
//
// The network itself only ever runs in floating point (F32 by default, F64 in
// tests, F16/BF16 for reduced-precision inference). Integer dtypes exist for
// index tensors (U32 indices for reflect padding and gathers) and for 8-bit
// image buffers handed in from the outside.

/// Runtime tag of a tensor's element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F16,
    BF16,
    F32,
    F64,
    U8,
    U32,
    I64,
}

impl DType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F16 | DType::BF16 => 2,
            DType::F32 | DType::U32 => 4,
            DType::F64 | DType::I64 => 8,
            DType::U8 => 1,
        }
    }

    /// Only float tensors may become variables and carry gradients.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
    }

    pub fn is_half(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16)
    }

    /// Tolerance suited to comparisons at this precision.
    pub fn epsilon(&self) -> f64 {
        match self {
            DType::F16 => 1e-3,
            DType::BF16 => 1e-2,
            DType::F32 => 1e-5,
            DType::F64 => 1e-10,
            DType::U8 | DType::U32 | DType::I64 => 0.0,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::U8 => "u8",
            DType::U32 => "u32",
            DType::I64 => "i64",
        };
        f.write_str(s)
    }
}

/// Rust scalar types that can back a tensor buffer.
///
/// Backends store typed buffers and use this trait to implement every kernel
/// once, generically, going through `f64` for the arithmetic.
pub trait WithDType: Copy + Send + Sync + 'static + num_traits::NumCast + fmt::Debug {
    const DTYPE: DType;

    fn to_f64(self) -> f64;

    fn from_f64(v: f64) -> Self;

    fn zero() -> Self {
        Self::from_f64(0.0)
    }

    fn one() -> Self {
        Self::from_f64(1.0)
    }
}

macro_rules! with_dtype_primitive {
    ($ty:ty, $dtype:ident) => {
        impl WithDType for $ty {
            const DTYPE: DType = DType::$dtype;
            fn to_f64(self) -> f64 {
                self as f64
            }
            fn from_f64(v: f64) -> Self {
                v as $ty
            }
        }
    };
}

with_dtype_primitive!(f32, F32);
with_dtype_primitive!(f64, F64);
with_dtype_primitive!(u8, U8);
with_dtype_primitive!(u32, U32);
with_dtype_primitive!(i64, I64);

impl WithDType for half::f16 {
    const DTYPE: DType = DType::F16;
    fn to_f64(self) -> f64 {
        half::f16::to_f64(self)
    }
    fn from_f64(v: f64) -> Self {
        half::f16::from_f64(v)
    }
}

impl WithDType for half::bf16 {
    const DTYPE: DType = DType::BF16;
    fn to_f64(self) -> f64 {
        half::bf16::to_f64(self)
    }
    fn from_f64(v: f64) -> Self {
        half::bf16::from_f64(v)
    }
}
