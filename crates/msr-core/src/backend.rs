use crate::dtype::DType;
use crate::error::Result;
use crate::layout::Layout;
use crate::shape::Shape;
use std::fmt;

// Backend — compute device abstraction
//
// A backend owns a storage type and implements the primitive kernels the
// network needs. Everything above the kernels (autograd, convolution via
// im2col, the spectral ops) lives in msr-core and is shared by all backends.
//
// LAYOUT CONTRACT:
//
//   Binary ops and matmul receive layouts that already have the output shape
//   (broadcast dims carry stride 0). A backend therefore never has to compute
//   broadcast rules itself; it only walks strided indices.

/// Identifies a compute device.
pub trait BackendDevice: Clone + fmt::Debug + Send + Sync + 'static {
    fn name(&self) -> String;
}

/// A typed buffer living on a device.
pub trait BackendStorage: Clone + Send + Sync + 'static {
    fn dtype(&self) -> DType;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Element-wise binary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Element-wise unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Abs,
    Exp,
    Log,
    Sqrt,
    Relu,
    Sigmoid,
    Tanh,
    /// Exact GELU, `x·Φ(x)` with the Gaussian CDF.
    Gelu,
    Sin,
    Cos,
    Square,
}

/// Reductions over one or more dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Mean,
    Max,
    Min,
}

/// Kernel set every compute backend provides.
///
/// All operations take storage plus the layout describing how to read it and
/// return freshly allocated contiguous storage.
pub trait Backend: Clone + Send + Sync + fmt::Debug + 'static {
    type Device: BackendDevice;
    type Storage: BackendStorage;

    //  Creation

    fn zeros(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    fn ones(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    fn full(shape: &Shape, val: f64, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Convert host `f64` data into device storage of `dtype`.
    fn from_f64_slice(data: &[f64], dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Uniform samples in `[0, 1)`.
    fn rand_uniform(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Standard normal samples.
    fn rand_normal(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    //  Element-wise

    /// `out[i] = op(lhs[i], rhs[i])`; both layouts have the output shape.
    fn binary_op(
        op: BinaryOp,
        lhs: &Self::Storage,
        lhs_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
    ) -> Result<Self::Storage>;

    fn unary_op(op: UnaryOp, input: &Self::Storage, layout: &Layout) -> Result<Self::Storage>;

    /// `out[i] = input[i] * mul + add`.
    fn affine(input: &Self::Storage, layout: &Layout, mul: f64, add: f64) -> Result<Self::Storage>;

    fn powf(input: &Self::Storage, layout: &Layout, exponent: f64) -> Result<Self::Storage>;

    //  Reductions

    /// Reduce over `dims` (all elements when empty).
    fn reduce_op(
        op: ReduceOp,
        input: &Self::Storage,
        layout: &Layout,
        dims: &[usize],
        keep_dim: bool,
    ) -> Result<Self::Storage>;

    //  Linear algebra

    /// Batched `[.., m, k] @ [.., k, n]`; the batch dims of both layouts are
    /// already broadcast to the same sizes.
    fn matmul(
        lhs: &Self::Storage,
        lhs_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
    ) -> Result<Self::Storage>;

    //  Data movement

    fn to_contiguous(input: &Self::Storage, layout: &Layout) -> Result<Self::Storage>;

    /// Copy the elements addressed by `layout` to the host, in logical order.
    fn to_f64_vec(input: &Self::Storage, layout: &Layout) -> Result<Vec<f64>>;

    /// Pick entries along `dim` using a 1-D integer index storage.
    fn index_select(
        input: &Self::Storage,
        input_layout: &Layout,
        indices: &Self::Storage,
        indices_layout: &Layout,
        dim: usize,
    ) -> Result<Self::Storage>;

    /// Concatenate along `dim` into `out_shape` (already validated).
    fn cat(
        inputs: &[(&Self::Storage, &Layout)],
        out_shape: &Shape,
        dim: usize,
    ) -> Result<Self::Storage>;

    /// Dtype conversion. The default goes through the host.
    fn cast(
        input: &Self::Storage,
        layout: &Layout,
        dtype: DType,
        device: &Self::Device,
    ) -> Result<Self::Storage> {
        let data = Self::to_f64_vec(input, layout)?;
        Self::from_f64_slice(&data, dtype, device)
    }
}
