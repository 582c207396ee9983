use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::backend::{Backend, BinaryOp, ReduceOp, UnaryOp};
use crate::conv::{self, ConvGeometry};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::op::{Op, TensorId};
use crate::shape::Shape;
use crate::spectral;

// Tensor — n-dimensional array with recorded provenance
//
// A Tensor is a cheap handle (`Arc`) around storage on some backend, a layout
// describing how to read that storage, and the op that produced it. Views
// (transpose, permute, narrow, expand, unsqueeze) share storage and only
// rewrite the layout.
//
// MEMORY MODEL:
//
//   Storage sits behind Arc<RwLock<_>> so parameters held by several layers
//   see in-place updates (`update_data_inplace`), and so that readers never
//   block each other during a forward pass.
//
// HOST KERNELS:
//
//   Convolution and the 2-D FFT run on host f64 buffers (see conv.rs and
//   spectral.rs) and write back through `B::from_f64_slice`. Every other
//   op dispatches to the backend.

struct TensorInner<B: Backend> {
    id: TensorId,
    storage: Arc<RwLock<B::Storage>>,
    layout: Layout,
    dtype: DType,
    device: B::Device,
    /// Operation that produced this tensor; `Op::None` for leaves.
    op: Op<B>,
    /// Whether this tensor is a trainable parameter.
    is_variable: bool,
}

/// An n-dimensional array of numbers on backend `B`.
///
/// ```ignore
/// use msr_core::{DType, Tensor};
/// use msr_cpu::{CpuBackend, CpuDevice};
///
/// let x = Tensor::<CpuBackend>::randn((1, 3, 32, 32), DType::F32, &CpuDevice)?;
/// let y = x.pad_reflect([1, 1, 1, 1])?; // [1, 3, 34, 34]
/// ```
pub struct Tensor<B: Backend> {
    inner: Arc<TensorInner<B>>,
}

impl<B: Backend> Clone for Tensor<B> {
    fn clone(&self) -> Self {
        Tensor {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Tensor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tensor(id={:?}, shape={}, dtype={}, device={:?})",
            self.inner.id,
            self.inner.layout.shape(),
            self.inner.dtype,
            self.inner.device,
        )
    }
}

impl<B: Backend> Tensor<B> {
    // Internal constructors

    pub(crate) fn from_storage(
        storage: B::Storage,
        layout: Layout,
        dtype: DType,
        device: B::Device,
        op: Op<B>,
    ) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::new(RwLock::new(storage)),
                layout,
                dtype,
                device,
                op,
                is_variable: false,
            }),
        }
    }

    fn view_with_layout(&self, layout: Layout, op: Op<B>) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::clone(&self.inner.storage),
                layout,
                dtype: self.inner.dtype,
                device: self.inner.device.clone(),
                op,
                is_variable: false,
            }),
        }
    }

    /// New contiguous tensor on this tensor's device and dtype, built from
    /// host data produced by a host kernel.
    pub(crate) fn from_host_like(&self, data: &[f64], shape: Shape, op: Op<B>) -> Result<Self> {
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        let storage = B::from_f64_slice(data, self.dtype(), self.device())?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            self.dtype(),
            self.device().clone(),
            op,
        ))
    }

    // Accessors

    pub fn id(&self) -> TensorId {
        self.inner.id
    }

    pub fn shape(&self) -> &Shape {
        self.inner.layout.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.inner.layout.dims()
    }

    pub fn rank(&self) -> usize {
        self.inner.layout.rank()
    }

    pub fn elem_count(&self) -> usize {
        self.inner.layout.elem_count()
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn device(&self) -> &B::Device {
        &self.inner.device
    }

    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    pub fn is_contiguous(&self) -> bool {
        self.inner.layout.is_contiguous()
    }

    pub fn is_variable(&self) -> bool {
        self.inner.is_variable
    }

    /// The op that created this tensor.
    pub fn op(&self) -> &Op<B> {
        &self.inner.op
    }

    /// Size of dimension `d`.
    pub fn dim(&self, d: usize) -> Result<usize> {
        self.shape().dim(d)
    }

    fn read_storage(&self) -> Result<RwLockReadGuard<'_, B::Storage>> {
        self.inner.storage.read().map_err(|_| Error::LockPoisoned)
    }

    fn write_storage(&self) -> Result<RwLockWriteGuard<'_, B::Storage>> {
        self.inner.storage.write().map_err(|_| Error::LockPoisoned)
    }

    // In-place mutation

    /// Overwrite the shared storage with `new_data`.
    ///
    /// Every handle sharing this storage (clones held by layers, parameter
    /// lists) observes the new values. Used by weight initialisers.
    pub fn update_data_inplace(&self, new_data: &[f64]) -> Result<()> {
        let expected = self.elem_count();
        if new_data.len() != expected {
            return Err(Error::ElementCountMismatch {
                shape: self.shape().clone(),
                expected,
                got: new_data.len(),
            });
        }
        let new_storage = B::from_f64_slice(new_data, self.dtype(), self.device())?;
        let mut guard = self.write_storage()?;
        *guard = new_storage;
        Ok(())
    }

    // Creation

    pub fn zeros(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::zeros(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    pub fn ones(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::ones(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    pub fn full(
        shape: impl Into<Shape>,
        val: f64,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        let storage = B::full(&shape, val, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    /// Build a tensor from host data, converting to `dtype`.
    pub fn from_f64_slice(
        data: &[f64],
        shape: impl Into<Shape>,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                shape: shape.clone(),
                expected: shape.elem_count(),
                got: data.len(),
            });
        }
        let storage = B::from_f64_slice(data, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    /// Uniform samples in `[0, 1)`.
    pub fn rand(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::rand_uniform(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    /// Standard normal samples.
    pub fn randn(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::rand_normal(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
            Op::None,
        ))
    }

    pub fn zeros_like(other: &Self) -> Result<Self> {
        Self::zeros(other.shape().clone(), other.dtype(), other.device())
    }

    pub fn ones_like(other: &Self) -> Result<Self> {
        Self::ones(other.shape().clone(), other.dtype(), other.device())
    }

    pub fn full_like(other: &Self, val: f64) -> Result<Self> {
        Self::full(other.shape().clone(), val, other.dtype(), other.device())
    }

    /// Mark this tensor as a trainable parameter. Keeps the id and storage
    /// but drops the history: a parameter is always a graph leaf.
    pub fn set_variable(self) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: self.inner.id,
                storage: Arc::clone(&self.inner.storage),
                layout: self.inner.layout.clone(),
                dtype: self.inner.dtype,
                device: self.inner.device.clone(),
                op: Op::None,
                is_variable: true,
            }),
        }
    }

    // Views

    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Self> {
        let new_layout = self.inner.layout.transpose(dim0, dim1)?;
        let op = Op::Transpose {
            input: self.clone(),
            dim0,
            dim1,
        };
        Ok(self.view_with_layout(new_layout, op))
    }

    /// Transpose of a matrix.
    pub fn t(&self) -> Result<Self> {
        if self.rank() != 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: self.rank(),
            });
        }
        self.transpose(0, 1)
    }

    /// Reorder dimensions: output dim `i` is input dim `dims[i]`.
    pub fn permute(&self, dims: &[usize]) -> Result<Self> {
        let new_layout = self.inner.layout.permute(dims)?;
        let op = Op::Permute {
            input: self.clone(),
            dims: dims.to_vec(),
        };
        Ok(self.view_with_layout(new_layout, op))
    }

    /// Slice `len` entries of `dim` starting at `start`.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        let new_layout = self.inner.layout.narrow(dim, start, len)?;
        let op = Op::Narrow {
            input: self.clone(),
            dim,
            start,
            len,
        };
        Ok(self.view_with_layout(new_layout, op))
    }

    /// Reshape to `new_shape`; non-contiguous inputs are copied first.
    pub fn reshape(&self, new_shape: impl Into<Shape>) -> Result<Self> {
        let new_shape = new_shape.into();
        let current_count = self.elem_count();
        let new_count = new_shape.elem_count();
        if current_count != new_count {
            return Err(Error::ReshapeElementMismatch {
                src: current_count,
                dst: new_count,
                dst_shape: new_shape,
            });
        }
        let tensor = self.contiguous()?;
        let op = Op::Reshape {
            input: tensor.clone(),
            src_shape: tensor.shape().clone(),
        };
        Ok(tensor.view_with_layout(Layout::contiguous(new_shape), op))
    }

    /// Dense row-major copy; a cheap clone when already contiguous.
    pub fn contiguous(&self) -> Result<Self> {
        if self.is_contiguous() {
            return Ok(self.clone());
        }
        let storage = self.read_storage()?;
        let new_storage = B::to_contiguous(&storage, &self.inner.layout)?;
        Ok(Self::from_storage(
            new_storage,
            Layout::contiguous(self.shape().clone()),
            self.inner.dtype,
            self.inner.device.clone(),
            Op::Contiguous {
                input: self.clone(),
            },
        ))
    }

    /// Insert a size-1 dim at `dim` (no copy).
    pub fn unsqueeze(&self, dim: usize) -> Result<Self> {
        let rank = self.rank();
        if dim > rank {
            return Err(Error::DimOutOfRange {
                dim,
                rank: rank + 1,
            });
        }
        let mut dims = self.dims().to_vec();
        let mut strides = self.inner.layout.strides().to_vec();
        // Any stride works for a size-1 dim.
        let stride = if dim < rank { dims[dim] * strides[dim] } else { 1 };
        dims.insert(dim, 1);
        strides.insert(dim, stride);
        let layout = Layout::new(Shape::new(dims), strides, self.inner.layout.offset());
        let op = Op::Reshape {
            input: self.clone(),
            src_shape: self.shape().clone(),
        };
        Ok(self.view_with_layout(layout, op))
    }

    /// Remove the size-1 dim at `dim` (no copy).
    pub fn squeeze(&self, dim: usize) -> Result<Self> {
        let rank = self.rank();
        if dim >= rank {
            return Err(Error::DimOutOfRange { dim, rank });
        }
        if self.dims()[dim] != 1 {
            return Err(Error::msg(format!(
                "squeeze: dim {} has size {}, expected 1",
                dim,
                self.dims()[dim]
            )));
        }
        let mut dims = self.dims().to_vec();
        let mut strides = self.inner.layout.strides().to_vec();
        dims.remove(dim);
        strides.remove(dim);
        let layout = Layout::new(Shape::new(dims), strides, self.inner.layout.offset());
        let op = Op::Reshape {
            input: self.clone(),
            src_shape: self.shape().clone(),
        };
        Ok(self.view_with_layout(layout, op))
    }

    /// Broadcast view to `target` (stride 0 along stretched dims).
    ///
    /// Size-1 dims stretch and missing leading dims are prepended:
    /// `[C, 1, 1]` expands to `[B, C, H, W]`.
    pub fn expand(&self, target_shape: impl Into<Shape>) -> Result<Self> {
        let target = target_shape.into();
        if &target == self.shape() {
            return Ok(self.clone());
        }
        let layout = self.inner.layout.broadcast_as(&target)?;
        let op = Op::Expand {
            input: self.clone(),
            src_shape: self.shape().clone(),
        };
        Ok(self.view_with_layout(layout, op))
    }

    /// Merge dims `start_dim..=end_dim` into one.
    pub fn flatten(&self, start_dim: usize, end_dim: usize) -> Result<Self> {
        let rank = self.rank();
        if start_dim > end_dim || end_dim >= rank {
            return Err(Error::DimOutOfRange {
                dim: end_dim,
                rank,
            });
        }
        let dims = self.dims();
        let mut new_dims = dims[..start_dim].to_vec();
        new_dims.push(dims[start_dim..=end_dim].iter().product());
        new_dims.extend_from_slice(&dims[end_dim + 1..]);
        self.reshape(new_dims)
    }

    /// Split into `n` pieces along `dim`; the last one may be smaller.
    pub fn chunk(&self, n: usize, dim: usize) -> Result<Vec<Self>> {
        if n == 0 {
            return Err(Error::msg("chunk: n must be positive"));
        }
        let dim_size = self.dim(dim)?;
        self.split(dim_size.div_ceil(n).max(1), dim)
    }

    /// Split into pieces of `split_size` along `dim`.
    pub fn split(&self, split_size: usize, dim: usize) -> Result<Vec<Self>> {
        if split_size == 0 {
            return Err(Error::msg("split: split_size must be positive"));
        }
        let dim_size = self.dim(dim)?;
        let mut pieces = Vec::new();
        let mut start = 0;
        while start < dim_size {
            let len = split_size.min(dim_size - start);
            pieces.push(self.narrow(dim, start, len)?);
            start += len;
        }
        Ok(pieces)
    }

    // Element-wise arithmetic (broadcasting)

    pub fn add(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Add)
    }

    pub fn sub(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Sub)
    }

    pub fn mul(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Mul)
    }

    pub fn div(&self, rhs: &Self) -> Result<Self> {
        self.binary_op(rhs, BinaryOp::Div)
    }

    fn binary_op(&self, rhs: &Self, op: BinaryOp) -> Result<Self> {
        if self.dtype() != rhs.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: rhs.dtype(),
            });
        }
        let out_shape = Shape::broadcast_shape(self.shape(), rhs.shape())?;
        let lhs_layout = self.inner.layout.broadcast_as(&out_shape)?;
        let rhs_layout = rhs.inner.layout.broadcast_as(&out_shape)?;
        let result = {
            let storage_lhs = self.read_storage()?;
            let storage_rhs = rhs.read_storage()?;
            B::binary_op(op, &storage_lhs, &lhs_layout, &storage_rhs, &rhs_layout)?
        };
        Ok(Self::from_storage(
            result,
            Layout::contiguous(out_shape),
            self.inner.dtype,
            self.inner.device.clone(),
            Op::Binary {
                lhs: self.clone(),
                rhs: rhs.clone(),
                op,
            },
        ))
    }

    // Unary

    pub fn neg(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Neg)
    }

    pub fn abs(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Abs)
    }

    pub fn exp(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Exp)
    }

    pub fn log(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Log)
    }

    pub fn sqrt(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Sqrt)
    }

    pub fn square(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Square)
    }

    pub fn relu(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Relu)
    }

    pub fn sigmoid(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Sigmoid)
    }

    pub fn tanh(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Tanh)
    }

    /// Exact GELU, `x·Φ(x)`.
    pub fn gelu(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Gelu)
    }

    pub fn sin(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Sin)
    }

    pub fn cos(&self) -> Result<Self> {
        self.unary_op(UnaryOp::Cos)
    }

    fn unary_op(&self, op: UnaryOp) -> Result<Self> {
        let result = {
            let storage = self.read_storage()?;
            B::unary_op(op, &storage, &self.inner.layout)?
        };
        Ok(Self::from_storage(
            result,
            Layout::contiguous(self.shape().clone()),
            self.inner.dtype,
            self.inner.device.clone(),
            Op::Unary {
                input: self.clone(),
                op,
            },
        ))
    }

    pub fn powf(&self, exponent: f64) -> Result<Self> {
        let result = {
            let storage = self.read_storage()?;
            B::powf(&storage, &self.inner.layout, exponent)?
        };
        Ok(Self::from_storage(
            result,
            Layout::contiguous(self.shape().clone()),
            self.inner.dtype,
            self.inner.device.clone(),
            Op::Powf {
                input: self.clone(),
                exponent,
            },
        ))
    }

    /// `self * mul + add`.
    pub fn affine(&self, mul: f64, add: f64) -> Result<Self> {
        let result = {
            let storage = self.read_storage()?;
            B::affine(&storage, &self.inner.layout, mul, add)?
        };
        Ok(Self::from_storage(
            result,
            Layout::contiguous(self.shape().clone()),
            self.inner.dtype,
            self.inner.device.clone(),
            Op::Affine {
                input: self.clone(),
                mul,
                add,
            },
        ))
    }

    // Reductions

    pub fn sum_all(&self) -> Result<Self> {
        self.reduce_op(ReduceOp::Sum, &[], false)
    }

    pub fn sum(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Sum, &[dim], keep_dim)
    }

    pub fn sum_dims(&self, dims: &[usize], keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Sum, dims, keep_dim)
    }

    pub fn mean_all(&self) -> Result<Self> {
        self.reduce_op(ReduceOp::Mean, &[], false)
    }

    pub fn mean(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Mean, &[dim], keep_dim)
    }

    /// Mean over several dims at once, e.g. `(1, 2, 3)` for per-sample stats.
    pub fn mean_dims(&self, dims: &[usize], keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Mean, dims, keep_dim)
    }

    pub fn max(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Max, &[dim], keep_dim)
    }

    pub fn min(&self, dim: usize, keep_dim: bool) -> Result<Self> {
        self.reduce_op(ReduceOp::Min, &[dim], keep_dim)
    }

    pub(crate) fn reduce_op(&self, op: ReduceOp, dims: &[usize], keep_dim: bool) -> Result<Self> {
        for &d in dims {
            if d >= self.rank() {
                return Err(Error::DimOutOfRange {
                    dim: d,
                    rank: self.rank(),
                });
            }
        }
        let result = {
            let storage = self.read_storage()?;
            B::reduce_op(op, &storage, &self.inner.layout, dims, keep_dim)?
        };
        let result_shape = reduced_shape(self.dims(), dims, keep_dim);
        Ok(Self::from_storage(
            result,
            Layout::contiguous(result_shape),
            self.inner.dtype,
            self.inner.device.clone(),
            Op::Reduce {
                input: self.clone(),
                op,
                dims: dims.to_vec(),
                keep_dim,
            },
        ))
    }

    // Composite operations

    /// Softmax along `dim`, shifted by the detached max for stability.
    pub fn softmax(&self, dim: usize) -> Result<Self> {
        let max_val = self.max(dim, true)?.detach();
        let exp_x = self.sub(&max_val)?.exp()?;
        let sum_exp = exp_x.sum(dim, true)?;
        exp_x.div(&sum_exp)
    }

    /// Concatenate along `dim`; all other dims must agree.
    pub fn cat(tensors: &[Self], dim: usize) -> Result<Self> {
        let first = match tensors {
            [] => return Err(Error::msg("cat: empty tensor list")),
            [only] => return Ok(only.clone()),
            [first, ..] => first,
        };
        let rank = first.rank();
        if dim >= rank {
            return Err(Error::DimOutOfRange { dim, rank });
        }
        for t in tensors.iter().skip(1) {
            if t.dtype() != first.dtype() {
                return Err(Error::DTypeMismatch {
                    expected: first.dtype(),
                    got: t.dtype(),
                });
            }
            let compatible = t.rank() == rank
                && (0..rank).all(|d| d == dim || t.dims()[d] == first.dims()[d]);
            if !compatible {
                return Err(Error::ShapeMismatch {
                    expected: first.shape().clone(),
                    got: t.shape().clone(),
                });
            }
        }

        let sizes: Vec<usize> = tensors.iter().map(|t| t.dims()[dim]).collect();
        let mut out_dims = first.dims().to_vec();
        out_dims[dim] = sizes.iter().sum();
        let out_shape = Shape::new(out_dims);

        let storage = {
            let guards = tensors
                .iter()
                .map(|t| t.read_storage())
                .collect::<Result<Vec<_>>>()?;
            let pairs: Vec<(&B::Storage, &Layout)> = guards
                .iter()
                .zip(tensors)
                .map(|(g, t)| (&**g, &t.inner.layout))
                .collect();
            B::cat(&pairs, &out_shape, dim)?
        };
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(out_shape),
            first.dtype(),
            first.device().clone(),
            Op::Cat {
                inputs: tensors.to_vec(),
                dim,
                sizes,
            },
        ))
    }

    /// Stack equally shaped tensors along a new dim.
    pub fn stack(tensors: &[Self], dim: usize) -> Result<Self> {
        let first = tensors
            .first()
            .ok_or_else(|| Error::msg("stack: empty tensor list"))?;
        for t in tensors.iter().skip(1) {
            if t.shape() != first.shape() {
                return Err(Error::ShapeMismatch {
                    expected: first.shape().clone(),
                    got: t.shape().clone(),
                });
            }
        }
        let unsqueezed = tensors
            .iter()
            .map(|t| t.unsqueeze(dim))
            .collect::<Result<Vec<_>>>()?;
        Self::cat(&unsqueezed, dim)
    }

    /// Constant padding; `padding` pairs apply to the trailing dims.
    pub fn pad(&self, padding: &[[usize; 2]], value: f64) -> Result<Self> {
        let rank = self.rank();
        if padding.len() > rank {
            return Err(Error::RankMismatch {
                expected: rank,
                got: padding.len(),
            });
        }
        let mut full_pad = vec![[0usize; 2]; rank];
        let lead = rank - padding.len();
        full_pad[lead..].copy_from_slice(padding);
        if full_pad.iter().all(|&[b, a]| b == 0 && a == 0) {
            return Ok(self.clone());
        }

        let mut current = self.detach();
        for (d, &[before, after]) in full_pad.iter().enumerate().rev() {
            if before == 0 && after == 0 {
                continue;
            }
            let mut parts = Vec::with_capacity(3);
            let mut fill_dims = current.dims().to_vec();
            if before > 0 {
                fill_dims[d] = before;
                parts.push(Self::full(
                    fill_dims.clone(),
                    value,
                    self.dtype(),
                    self.device(),
                )?);
            }
            parts.push(current);
            if after > 0 {
                fill_dims[d] = after;
                parts.push(Self::full(fill_dims, value, self.dtype(), self.device())?);
            }
            current = Self::cat(&parts, d)?;
        }

        // Re-wrap the padded data under a single Pad node.
        let storage = current.read_storage()?.clone();
        Ok(Self::from_storage(
            storage,
            current.layout().clone(),
            self.inner.dtype,
            self.inner.device.clone(),
            Op::Pad {
                input: self.clone(),
                padding: full_pad,
            },
        ))
    }

    /// Reflection padding of an NCHW tensor, `[left, right, top, bottom]`.
    ///
    /// The edge row/column is not repeated: reflecting `[a, b, c]` by 2 on
    /// the left gives `[c, b, a, b, c]`. Each pad must be smaller than the
    /// padded dimension.
    pub fn pad_reflect(&self, pad: [usize; 4]) -> Result<Self> {
        if self.rank() != 4 {
            return Err(Error::RankMismatch {
                expected: 4,
                got: self.rank(),
            });
        }
        let [left, right, top, bottom] = pad;
        let mut out = self.clone();
        for (dim, before, after) in [(3, left, right), (2, top, bottom)] {
            if before == 0 && after == 0 {
                continue;
            }
            let indices = reflect_indices(self.dims()[dim], before, after, dim)?;
            let len = indices.len();
            let index = Self::from_f64_slice(&indices, len, DType::U32, self.device())?;
            out = out.index_select(dim, &index)?;
        }
        Ok(out)
    }

    /// Gather entries of `dim` listed in the 1-D integer tensor `indices`.
    pub fn index_select(&self, dim: usize, indices: &Self) -> Result<Self> {
        let rank = self.rank();
        if dim >= rank {
            return Err(Error::DimOutOfRange { dim, rank });
        }
        if indices.rank() != 1 {
            return Err(Error::RankMismatch {
                expected: 1,
                got: indices.rank(),
            });
        }
        let storage = {
            let input = self.read_storage()?;
            let idx = indices.read_storage()?;
            B::index_select(&input, &self.inner.layout, &idx, &indices.inner.layout, dim)?
        };
        let mut out_dims = self.dims().to_vec();
        out_dims[dim] = indices.elem_count();
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(Shape::new(out_dims)),
            self.inner.dtype,
            self.inner.device.clone(),
            Op::IndexSelect {
                input: self.clone(),
                indices: indices.clone(),
                dim,
            },
        ))
    }

    /// Depth-to-space: `[N, C·r², H, W]` to `[N, C, H·r, W·r]`.
    pub fn pixel_shuffle(&self, r: usize) -> Result<Self> {
        if self.rank() != 4 {
            return Err(Error::RankMismatch {
                expected: 4,
                got: self.rank(),
            });
        }
        let (n, c, h, w) = (self.dims()[0], self.dims()[1], self.dims()[2], self.dims()[3]);
        if r == 0 || c % (r * r) != 0 {
            return Err(Error::msg(format!(
                "pixel_shuffle: {} channels not divisible by {}²",
                c, r
            )));
        }
        let oc = c / (r * r);
        self.reshape(vec![n, oc, r, r, h, w])?
            .permute(&[0, 1, 4, 2, 5, 3])?
            .reshape((n, oc, h * r, w * r))
    }

    // Linear algebra

    /// Matrix product over the last two dims; leading dims broadcast.
    ///
    /// `[B, H, N, d] @ [B, H, d, N]` gives `[B, H, N, N]`, and
    /// `[B, N, C] @ [C, D]` gives `[B, N, D]`.
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        if self.rank() < 2 || rhs.rank() < 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: self.rank().min(rhs.rank()),
            });
        }
        if self.dtype() != rhs.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: rhs.dtype(),
            });
        }
        let (lr, rr) = (self.rank(), rhs.rank());
        let (m, k1) = (self.dims()[lr - 2], self.dims()[lr - 1]);
        let (k2, n) = (rhs.dims()[rr - 2], rhs.dims()[rr - 1]);
        if k1 != k2 {
            return Err(Error::MatmulShapeMismatch { m, k1, k2, n });
        }
        let batch = Shape::broadcast_shape(
            &Shape::from(&self.dims()[..lr - 2]),
            &Shape::from(&rhs.dims()[..rr - 2]),
        )?;
        let with_tail = |a: usize, b: usize| {
            let mut d = batch.dims().to_vec();
            d.extend_from_slice(&[a, b]);
            Shape::new(d)
        };
        let lhs_layout = self.inner.layout.broadcast_as(&with_tail(m, k1))?;
        let rhs_layout = rhs.inner.layout.broadcast_as(&with_tail(k2, n))?;
        let storage = {
            let l = self.read_storage()?;
            let r = rhs.read_storage()?;
            B::matmul(&l, &lhs_layout, &r, &rhs_layout)?
        };
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(with_tail(m, n)),
            self.inner.dtype,
            self.inner.device.clone(),
            Op::Matmul {
                lhs: self.clone(),
                rhs: rhs.clone(),
            },
        ))
    }

    // Convolution

    /// Grouped 2-D convolution with zero padding.
    ///
    /// input `[N, C_in, H, W]`, weight `[C_out, C_in / groups, kH, kW]`,
    /// bias `[C_out]`. Returns `[N, C_out, H_out, W_out]`.
    pub fn conv2d(
        &self,
        weight: &Self,
        bias: Option<&Self>,
        stride: [usize; 2],
        padding: [usize; 2],
        groups: usize,
    ) -> Result<Self> {
        let geo = ConvGeometry::new(self.dims(), weight.dims(), stride, padding, groups)?;
        if let Some(b) = bias {
            if b.elem_count() != geo.c_out {
                return Err(Error::ShapeMismatch {
                    expected: Shape::from(geo.c_out),
                    got: b.shape().clone(),
                });
            }
        }
        let input_data = self.to_f64_vec()?;
        let weight_data = weight.to_f64_vec()?;
        let bias_data = bias.map(|b| b.to_f64_vec()).transpose()?;
        let out = conv::conv2d_forward(&geo, &input_data, &weight_data, bias_data.as_deref());
        self.from_host_like(
            &out,
            Shape::new(geo.output_dims()),
            Op::Conv2d {
                input: self.clone(),
                weight: weight.clone(),
                bias: bias.cloned(),
                stride,
                padding,
                groups,
            },
        )
    }

    /// 1-D convolution over `[N, C_in, L]` with weight `[C_out, C_in / groups, K]`,
    /// expressed as a 2-D convolution of height 1.
    pub fn conv1d(
        &self,
        weight: &Self,
        bias: Option<&Self>,
        stride: usize,
        padding: usize,
        groups: usize,
    ) -> Result<Self> {
        if self.rank() != 3 || weight.rank() != 3 {
            return Err(Error::RankMismatch {
                expected: 3,
                got: if self.rank() != 3 {
                    self.rank()
                } else {
                    weight.rank()
                },
            });
        }
        self.unsqueeze(2)?
            .conv2d(
                &weight.unsqueeze(2)?,
                bias,
                [1, stride],
                [0, padding],
                groups,
            )?
            .squeeze(2)
    }

    // Spectral

    /// Real 2-D FFT over the last two dims, unnormalised.
    ///
    /// `[.., M, N]` becomes `[.., M, N/2 + 1, 2]` with (re, im) last.
    pub fn rfft2(&self) -> Result<Self> {
        let rank = self.rank();
        if rank < 2 {
            return Err(Error::RankMismatch {
                expected: 2,
                got: rank,
            });
        }
        let (m, n) = (self.dims()[rank - 2], self.dims()[rank - 1]);
        let batch: usize = self.dims()[..rank - 2].iter().product();
        let spectrum = spectral::rfft2(&self.to_f64_vec()?, batch, m, n);
        let mut out_dims = self.dims()[..rank - 2].to_vec();
        out_dims.extend_from_slice(&[m, spectral::half_len(n), 2]);
        self.from_host_like(
            &spectrum,
            Shape::new(out_dims),
            Op::Rfft2 {
                input: self.clone(),
            },
        )
    }

    /// Inverse of [`Tensor::rfft2`], restoring a last dim of size `width`.
    pub fn irfft2(&self, width: usize) -> Result<Self> {
        let rank = self.rank();
        if rank < 3 {
            return Err(Error::RankMismatch {
                expected: 3,
                got: rank,
            });
        }
        let half = spectral::half_len(width);
        if self.dims()[rank - 1] != 2 || self.dims()[rank - 2] != half {
            return Err(Error::msg(format!(
                "irfft2: spectrum shape {} does not match width {}",
                self.shape(),
                width
            )));
        }
        let m = self.dims()[rank - 3];
        let batch: usize = self.dims()[..rank - 3].iter().product();
        let data = spectral::irfft2(&self.to_f64_vec()?, batch, m, width)?;
        let mut out_dims = self.dims()[..rank - 3].to_vec();
        out_dims.extend_from_slice(&[m, width]);
        self.from_host_like(
            &data,
            Shape::new(out_dims),
            Op::Irfft2 {
                input: self.clone(),
                width,
            },
        )
    }

    /// Complex product of two spectra whose last dim holds (re, im).
    pub fn complex_mul(&self, rhs: &Self) -> Result<Self> {
        let last = self.rank().saturating_sub(1);
        if self.dims().last() != Some(&2) || rhs.dims().last() != Some(&2) {
            return Err(Error::msg(format!(
                "complex_mul: expected a trailing re/im axis, got {} and {}",
                self.shape(),
                rhs.shape()
            )));
        }
        let rhs_last = rhs.rank() - 1;
        let (a_re, a_im) = (self.narrow(last, 0, 1)?, self.narrow(last, 1, 1)?);
        let (b_re, b_im) = (rhs.narrow(rhs_last, 0, 1)?, rhs.narrow(rhs_last, 1, 1)?);
        let re = a_re.mul(&b_re)?.sub(&a_im.mul(&b_im)?)?;
        let im = a_re.mul(&b_im)?.add(&a_im.mul(&b_re)?)?;
        let out_last = re.rank() - 1;
        Self::cat(&[re, im], out_last)
    }

    // Data extraction

    /// All elements in logical order.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        let storage = self.read_storage()?;
        B::to_f64_vec(&storage, &self.inner.layout)
    }

    pub fn to_scalar_f64(&self) -> Result<f64> {
        if self.elem_count() != 1 {
            return Err(Error::NotAScalar {
                shape: self.shape().clone(),
            });
        }
        self.to_f64_vec()?
            .first()
            .copied()
            .ok_or(Error::NotAScalar {
                shape: self.shape().clone(),
            })
    }

    /// Convert to `dtype`. Gradients flow back through the cast.
    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        if self.dtype() == dtype {
            return Ok(self.clone());
        }
        let storage = {
            let guard = self.read_storage()?;
            B::cast(&guard, &self.inner.layout, dtype, self.device())?
        };
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(self.shape().clone()),
            dtype,
            self.device().clone(),
            Op::ToDtype {
                input: self.clone(),
                src_dtype: self.dtype(),
            },
        ))
    }

    // Autograd

    /// Reverse-mode gradients of this scalar w.r.t. every tensor in its graph.
    pub fn backward(&self) -> Result<crate::backprop::GradStore<B>> {
        crate::backprop::backward(self)
    }

    /// Same data, no history, fresh id.
    pub fn detach(&self) -> Self {
        self.view_with_layout(self.layout().clone(), Op::None)
    }
}

/// Shape left after reducing `dims` (all dims when empty).
fn reduced_shape(input: &[usize], dims: &[usize], keep_dim: bool) -> Shape {
    if dims.is_empty() {
        return if keep_dim {
            Shape::new(vec![1; input.len()])
        } else {
            Shape::from(())
        };
    }
    let out: Vec<usize> = input
        .iter()
        .enumerate()
        .filter_map(|(i, &d)| match (dims.contains(&i), keep_dim) {
            (false, _) => Some(d),
            (true, true) => Some(1),
            (true, false) => None,
        })
        .collect();
    Shape::new(out)
}

/// Source positions for reflection padding of a dim of size `n`.
fn reflect_indices(n: usize, before: usize, after: usize, dim: usize) -> Result<Vec<f64>> {
    for pad in [before, after] {
        if pad >= n {
            return Err(Error::ReflectPadTooLarge { dim, pad, size: n });
        }
    }
    let left = (1..=before).rev();
    let body = 0..n;
    let right = (0..after).map(|j| n - 2 - j);
    Ok(left.chain(body).chain(right).map(|i| i as f64).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reflect_indices() {
        let idx = reflect_indices(4, 2, 3, 3).unwrap();
        assert_eq!(idx, vec![2.0, 1.0, 0.0, 1.0, 2.0, 3.0, 2.0, 1.0, 0.0]);
    }

    #[test]
    fn test_reflect_indices_too_large() {
        assert!(matches!(
            reflect_indices(3, 3, 0, 2),
            Err(Error::ReflectPadTooLarge {
                dim: 2,
                pad: 3,
                size: 3
            })
        ));
    }

    #[test]
    fn test_reduced_shape() {
        assert_eq!(reduced_shape(&[2, 3, 4], &[1], false).dims(), &[2, 4]);
        assert_eq!(reduced_shape(&[2, 3, 4], &[1, 2], true).dims(), &[2, 1, 1]);
        assert_eq!(reduced_shape(&[2, 3], &[], false).rank(), 0);
    }
}
