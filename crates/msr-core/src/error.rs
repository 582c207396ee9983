use crate::shape::Shape;

/// Every failure mode of the tensor runtime and the layers built on it.
///
/// One enum is shared by all crates of the workspace so that model code can
/// propagate substrate errors with `?` without conversion boilerplate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Two shapes that must agree do not (e.g. `[2,3] + [4,5]`).
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Operation requires a specific number of dimensions.
    #[error("rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    /// Operands of a binary op carry different dtypes.
    #[error("dtype mismatch: expected {expected:?}, got {got:?}")]
    DTypeMismatch {
        expected: crate::DType,
        got: crate::DType,
    },

    #[error("dimension out of range: dim {dim} for tensor with {rank} dimensions")]
    DimOutOfRange { dim: usize, rank: usize },

    #[error("narrow out of bounds: dim {dim}, start {start}, len {len}, dim_size {dim_size}")]
    NarrowOutOfBounds {
        dim: usize,
        start: usize,
        len: usize,
        dim_size: usize,
    },

    #[error("not a scalar: tensor has shape {shape}")]
    NotAScalar { shape: Shape },

    /// Host data length does not match the requested shape.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    #[error("matmul shape mismatch: [{m}x{k1}] @ [{k2}x{n}], inner dims must match")]
    MatmulShapeMismatch {
        m: usize,
        k1: usize,
        k2: usize,
        n: usize,
    },

    #[error(
        "cannot reshape: source has {src} elements, target shape {dst_shape} has {dst} elements"
    )]
    ReshapeElementMismatch {
        src: usize,
        dst: usize,
        dst_shape: Shape,
    },

    /// Reflection padding needs `pad < size` along the padded dimension.
    #[error("reflect pad {pad} too large for dim {dim} of size {size}")]
    ReflectPadTooLarge { dim: usize, pad: usize, size: usize },

    /// Channel count is not divisible by the convolution group count.
    #[error("conv groups mismatch: {channels} channels not divisible into {groups} groups")]
    GroupsMismatch { channels: usize, groups: usize },

    /// Backing storage lock was poisoned by a panicking writer.
    #[error("tensor storage lock poisoned")]
    LockPoisoned,

    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Build an error from a free-form message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Early-return with a formatted [`Error::Msg`].
///
/// `bail!("unsupported window size {}", ws)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
