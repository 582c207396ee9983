// CPU Backend — host implementation of the msr-core Backend trait
//
// ARCHITECTURE:
// - CpuDevice is a zero-sized handle; there is only one host.
// - CpuStorage is an enum over Vec<T> for each supported dtype.
// - Kernels are written once, generic over `CpuDType`, and dispatched on the
//   runtime dtype with the `dispatch!` macro.
// - Strided inputs are gathered into logical order first; element-wise work
//   and matmul rows are then spread over the rayon pool.
// - Element-wise math runs in f64 and is rounded back to the storage dtype,
//   so F16/BF16 tensors behave like their f32 counterparts up to rounding.
//
// USAGE:
//   let x = CpuTensor::randn((1, 3, 32, 32), DType::F32, &CpuDevice)?;

use half::{bf16, f16};
use rand::Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;

use msr_core::backend::{Backend, BackendDevice, BackendStorage, BinaryOp, ReduceOp, UnaryOp};
use msr_core::dtype::{DType, WithDType};
use msr_core::error::{Error, Result};
use msr_core::layout::Layout;
use msr_core::scalar;
use msr_core::shape::Shape;

// CpuDevice

/// The host CPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuDevice;

impl BackendDevice for CpuDevice {
    fn name(&self) -> String {
        "cpu".to_string()
    }
}

// CpuStorage

/// Host memory, one variant per dtype.
#[derive(Debug, Clone)]
pub enum CpuStorage {
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    U8(Vec<u8>),
    U32(Vec<u32>),
    I64(Vec<i64>),
}

impl BackendStorage for CpuStorage {
    fn dtype(&self) -> DType {
        match self {
            CpuStorage::F16(_) => DType::F16,
            CpuStorage::BF16(_) => DType::BF16,
            CpuStorage::F32(_) => DType::F32,
            CpuStorage::F64(_) => DType::F64,
            CpuStorage::U8(_) => DType::U8,
            CpuStorage::U32(_) => DType::U32,
            CpuStorage::I64(_) => DType::I64,
        }
    }

    fn len(&self) -> usize {
        match self {
            CpuStorage::F16(v) => v.len(),
            CpuStorage::BF16(v) => v.len(),
            CpuStorage::F32(v) => v.len(),
            CpuStorage::F64(v) => v.len(),
            CpuStorage::U8(v) => v.len(),
            CpuStorage::U32(v) => v.len(),
            CpuStorage::I64(v) => v.len(),
        }
    }
}

/// Element types that have a `CpuStorage` variant.
pub trait CpuDType: WithDType {
    fn slice(storage: &CpuStorage) -> Option<&[Self]>;
    fn wrap(data: Vec<Self>) -> CpuStorage;
}

macro_rules! cpu_dtype {
    ($ty:ty, $variant:ident) => {
        impl CpuDType for $ty {
            fn slice(storage: &CpuStorage) -> Option<&[Self]> {
                match storage {
                    CpuStorage::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn wrap(data: Vec<Self>) -> CpuStorage {
                CpuStorage::$variant(data)
            }
        }
    };
}

cpu_dtype!(f16, F16);
cpu_dtype!(bf16, BF16);
cpu_dtype!(f32, F32);
cpu_dtype!(f64, F64);
cpu_dtype!(u8, U8);
cpu_dtype!(u32, U32);
cpu_dtype!(i64, I64);

// Run `$body` with `$t` bound to the Rust type of `$dtype`.
macro_rules! dispatch {
    ($dtype:expr, $t:ident => $body:expr) => {
        match $dtype {
            DType::F16 => {
                type $t = f16;
                $body
            }
            DType::BF16 => {
                type $t = bf16;
                $body
            }
            DType::F32 => {
                type $t = f32;
                $body
            }
            DType::F64 => {
                type $t = f64;
                $body
            }
            DType::U8 => {
                type $t = u8;
                $body
            }
            DType::U32 => {
                type $t = u32;
                $body
            }
            DType::I64 => {
                type $t = i64;
                $body
            }
        }
    };
}

fn typed<T: CpuDType>(storage: &CpuStorage) -> Result<&[T]> {
    T::slice(storage).ok_or(Error::DTypeMismatch {
        expected: T::DTYPE,
        got: storage.dtype(),
    })
}

// Helpers

/// Elements addressed by `layout`, in logical row-major order.
fn gather<T: Copy>(data: &[T], layout: &Layout) -> Vec<T> {
    let n = layout.elem_count();
    if layout.is_contiguous() && data.len() >= n {
        return data[..n].to_vec();
    }
    layout.strided_indices().map(|i| data[i]).collect()
}

fn from_f64_vec<T: CpuDType>(data: &[f64]) -> CpuStorage {
    T::wrap(data.par_iter().map(|&v| T::from_f64(v)).collect())
}

fn unary_fn(op: UnaryOp) -> fn(f64) -> f64 {
    match op {
        UnaryOp::Neg => |x| -x,
        UnaryOp::Abs => f64::abs,
        UnaryOp::Exp => f64::exp,
        UnaryOp::Log => f64::ln,
        UnaryOp::Sqrt => f64::sqrt,
        UnaryOp::Relu => |x| x.max(0.0),
        UnaryOp::Sigmoid => scalar::sigmoid,
        UnaryOp::Tanh => f64::tanh,
        UnaryOp::Gelu => scalar::gelu,
        UnaryOp::Sin => f64::sin,
        UnaryOp::Cos => f64::cos,
        UnaryOp::Square => |x| x * x,
    }
}

fn binary_fn(op: BinaryOp) -> fn(f64, f64) -> f64 {
    match op {
        BinaryOp::Add => |a, b| a + b,
        BinaryOp::Sub => |a, b| a - b,
        BinaryOp::Mul => |a, b| a * b,
        BinaryOp::Div => |a, b| a / b,
    }
}

fn map_elems<T: CpuDType>(
    data: &[T],
    layout: &Layout,
    f: impl Fn(f64) -> f64 + Sync + Send,
) -> Vec<T> {
    gather(data, layout)
        .par_iter()
        .map(|&x| T::from_f64(f(x.to_f64())))
        .collect()
}

fn zip_elems<T: CpuDType>(
    lhs: &[T],
    lhs_layout: &Layout,
    rhs: &[T],
    rhs_layout: &Layout,
    f: fn(f64, f64) -> f64,
) -> Vec<T> {
    let a = gather(lhs, lhs_layout);
    let b = gather(rhs, rhs_layout);
    a.par_iter()
        .zip(b.par_iter())
        .map(|(&x, &y)| T::from_f64(f(x.to_f64(), y.to_f64())))
        .collect()
}

fn reduce_elems<T: CpuDType>(
    op: ReduceOp,
    data: &[T],
    layout: &Layout,
    dims: &[usize],
) -> Vec<T> {
    let in_dims = layout.dims();
    let reduced: Vec<bool> = (0..in_dims.len())
        .map(|d| dims.is_empty() || dims.contains(&d))
        .collect();
    let keep_shape = Shape::new(
        in_dims
            .iter()
            .zip(&reduced)
            .map(|(&d, &r)| if r { 1 } else { d })
            .collect(),
    );
    let in_strides = layout.shape().stride_contiguous();
    let out_strides: Vec<usize> = keep_shape
        .stride_contiguous()
        .into_iter()
        .zip(&reduced)
        .map(|(s, &r)| if r { 0 } else { s })
        .collect();

    let init = match op {
        ReduceOp::Sum | ReduceOp::Mean => 0.0,
        ReduceOp::Max => f64::NEG_INFINITY,
        ReduceOp::Min => f64::INFINITY,
    };
    let mut acc = vec![init; keep_shape.elem_count()];
    for (i, x) in gather(data, layout).into_iter().enumerate() {
        let mut out = 0;
        for d in 0..in_dims.len() {
            out += (i / in_strides[d]) % in_dims[d] * out_strides[d];
        }
        let x = x.to_f64();
        let slot = &mut acc[out];
        match op {
            ReduceOp::Sum | ReduceOp::Mean => *slot += x,
            ReduceOp::Max => *slot = slot.max(x),
            ReduceOp::Min => *slot = slot.min(x),
        }
    }
    if op == ReduceOp::Mean {
        let count = (layout.elem_count() / keep_shape.elem_count().max(1)).max(1) as f64;
        acc.iter_mut().for_each(|v| *v /= count);
    }
    acc.into_iter().map(T::from_f64).collect()
}

// Batched row-major matmul; both operands already broadcast to [batch.., m, k]
// and [batch.., k, n].
fn matmul_elems<T: CpuDType>(
    lhs: &[T],
    lhs_layout: &Layout,
    rhs: &[T],
    rhs_layout: &Layout,
) -> Vec<T> {
    let rank = lhs_layout.rank();
    let (m, k) = (lhs_layout.dims()[rank - 2], lhs_layout.dims()[rank - 1]);
    let n = rhs_layout.dims()[rank - 1];
    let a: Vec<f64> = gather(lhs, lhs_layout)
        .iter()
        .map(|&v| WithDType::to_f64(v))
        .collect();
    let b: Vec<f64> = gather(rhs, rhs_layout)
        .iter()
        .map(|&v| WithDType::to_f64(v))
        .collect();
    let batch = a.len() / (m * k).max(1);

    let mut out = vec![0.0f64; batch * m * n];
    if n > 0 {
        out.par_chunks_mut(n).enumerate().for_each(|(row, out_row)| {
            let bi = row / m.max(1);
            let a_row = &a[row * k..(row + 1) * k];
            for (p, &av) in a_row.iter().enumerate() {
                if av == 0.0 {
                    continue;
                }
                let b_row = &b[(bi * k + p) * n..(bi * k + p + 1) * n];
                for (o, &bv) in out_row.iter_mut().zip(b_row) {
                    *o += av * bv;
                }
            }
        });
    }
    out.into_iter().map(T::from_f64).collect()
}

fn index_select_elems<T: CpuDType>(
    data: &[T],
    layout: &Layout,
    indices: &[usize],
    dim: usize,
) -> Result<Vec<T>> {
    let dims = layout.dims();
    let size = dims[dim];
    if let Some(&bad) = indices.iter().find(|&&i| i >= size) {
        return Err(Error::msg(format!(
            "index_select: index {} out of range for dim {} of size {}",
            bad, dim, size
        )));
    }
    let outer: usize = dims[..dim].iter().product();
    let inner: usize = dims[dim + 1..].iter().product();
    let src = gather(data, layout);
    let mut out = Vec::with_capacity(outer * indices.len() * inner);
    for o in 0..outer {
        for &i in indices {
            let start = (o * size + i) * inner;
            out.extend_from_slice(&src[start..start + inner]);
        }
    }
    Ok(out)
}

fn cat_elems<T: CpuDType>(
    inputs: &[(&CpuStorage, &Layout)],
    out_shape: &Shape,
    dim: usize,
) -> Result<Vec<T>> {
    let outer: usize = out_shape.dims()[..dim].iter().product();
    let inner: usize = out_shape.dims()[dim + 1..].iter().product();
    let parts = inputs
        .iter()
        .map(|(s, l)| Ok((gather(typed::<T>(s)?, l), l.dims()[dim] * inner)))
        .collect::<Result<Vec<_>>>()?;
    let mut out = Vec::with_capacity(out_shape.elem_count());
    for o in 0..outer {
        for (data, block) in &parts {
            out.extend_from_slice(&data[o * block..(o + 1) * block]);
        }
    }
    Ok(out)
}

// CpuBackend

/// Host compute backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

/// Convenience alias used throughout the workspace.
pub type CpuTensor = msr_core::Tensor<CpuBackend>;

impl Backend for CpuBackend {
    type Device = CpuDevice;
    type Storage = CpuStorage;

    fn zeros(shape: &Shape, dtype: DType, device: &CpuDevice) -> Result<CpuStorage> {
        Self::full(shape, 0.0, dtype, device)
    }

    fn ones(shape: &Shape, dtype: DType, device: &CpuDevice) -> Result<CpuStorage> {
        Self::full(shape, 1.0, dtype, device)
    }

    fn full(shape: &Shape, val: f64, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        let n = shape.elem_count();
        Ok(dispatch!(dtype, T => T::wrap(vec![T::from_f64(val); n])))
    }

    fn from_f64_slice(data: &[f64], dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(dispatch!(dtype, T => from_f64_vec::<T>(data)))
    }

    fn rand_uniform(shape: &Shape, dtype: DType, device: &CpuDevice) -> Result<CpuStorage> {
        if !dtype.is_float() {
            return Err(Error::msg(format!("rand_uniform not supported for {dtype}")));
        }
        let mut rng = rand::thread_rng();
        let data: Vec<f64> = (0..shape.elem_count()).map(|_| rng.gen::<f64>()).collect();
        Self::from_f64_slice(&data, dtype, device)
    }

    fn rand_normal(shape: &Shape, dtype: DType, device: &CpuDevice) -> Result<CpuStorage> {
        if !dtype.is_float() {
            return Err(Error::msg(format!("rand_normal not supported for {dtype}")));
        }
        let mut rng = rand::thread_rng();
        let data: Vec<f64> = (0..shape.elem_count())
            .map(|_| rng.sample::<f64, _>(StandardNormal))
            .collect();
        Self::from_f64_slice(&data, dtype, device)
    }

    fn binary_op(
        op: BinaryOp,
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> Result<CpuStorage> {
        if lhs_layout.shape() != rhs_layout.shape() {
            return Err(Error::ShapeMismatch {
                expected: lhs_layout.shape().clone(),
                got: rhs_layout.shape().clone(),
            });
        }
        let f = binary_fn(op);
        Ok(dispatch!(lhs.dtype(), T => T::wrap(zip_elems(
            typed::<T>(lhs)?,
            lhs_layout,
            typed::<T>(rhs)?,
            rhs_layout,
            f,
        ))))
    }

    fn unary_op(op: UnaryOp, input: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        let f = unary_fn(op);
        Ok(dispatch!(input.dtype(), T => T::wrap(map_elems(typed::<T>(input)?, layout, f))))
    }

    fn affine(input: &CpuStorage, layout: &Layout, mul: f64, add: f64) -> Result<CpuStorage> {
        Ok(dispatch!(input.dtype(), T => T::wrap(map_elems(
            typed::<T>(input)?,
            layout,
            move |x| x * mul + add,
        ))))
    }

    fn powf(input: &CpuStorage, layout: &Layout, exponent: f64) -> Result<CpuStorage> {
        Ok(dispatch!(input.dtype(), T => T::wrap(map_elems(
            typed::<T>(input)?,
            layout,
            move |x| x.powf(exponent),
        ))))
    }

    fn reduce_op(
        op: ReduceOp,
        input: &CpuStorage,
        layout: &Layout,
        dims: &[usize],
        _keep_dim: bool,
    ) -> Result<CpuStorage> {
        // keep_dim only changes the shape, not the element order.
        Ok(dispatch!(input.dtype(), T => T::wrap(reduce_elems(
            op,
            typed::<T>(input)?,
            layout,
            dims,
        ))))
    }

    fn matmul(
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> Result<CpuStorage> {
        let (lr, rr) = (lhs_layout.rank(), rhs_layout.rank());
        if lr < 2 || lr != rr || lhs_layout.dims()[..lr - 2] != rhs_layout.dims()[..rr - 2] {
            return Err(Error::ShapeMismatch {
                expected: lhs_layout.shape().clone(),
                got: rhs_layout.shape().clone(),
            });
        }
        Ok(dispatch!(lhs.dtype(), T => T::wrap(matmul_elems(
            typed::<T>(lhs)?,
            lhs_layout,
            typed::<T>(rhs)?,
            rhs_layout,
        ))))
    }

    fn to_contiguous(input: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        Ok(dispatch!(input.dtype(), T => T::wrap(gather(typed::<T>(input)?, layout))))
    }

    fn to_f64_vec(input: &CpuStorage, layout: &Layout) -> Result<Vec<f64>> {
        Ok(dispatch!(input.dtype(), T => gather(typed::<T>(input)?, layout)
            .into_iter()
            .map(WithDType::to_f64)
            .collect::<Vec<f64>>()))
    }

    fn index_select(
        input: &CpuStorage,
        input_layout: &Layout,
        indices: &CpuStorage,
        indices_layout: &Layout,
        dim: usize,
    ) -> Result<CpuStorage> {
        if dim >= input_layout.rank() {
            return Err(Error::DimOutOfRange {
                dim,
                rank: input_layout.rank(),
            });
        }
        let idx: Vec<usize> = match indices.dtype() {
            DType::U8 | DType::U32 | DType::I64 => Self::to_f64_vec(indices, indices_layout)?
                .into_iter()
                .map(|v| v as usize)
                .collect(),
            other => {
                return Err(Error::msg(format!(
                    "index_select: indices must be integer, got {other}"
                )))
            }
        };
        Ok(dispatch!(input.dtype(), T => T::wrap(index_select_elems(
            typed::<T>(input)?,
            input_layout,
            &idx,
            dim,
        )?)))
    }

    fn cat(inputs: &[(&CpuStorage, &Layout)], out_shape: &Shape, dim: usize) -> Result<CpuStorage> {
        let dtype = inputs
            .first()
            .map(|(s, _)| s.dtype())
            .ok_or_else(|| Error::msg("cat: empty input list"))?;
        Ok(dispatch!(dtype, T => T::wrap(cat_elems::<T>(inputs, out_shape, dim)?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f64_storage(data: &[f64]) -> CpuStorage {
        CpuStorage::F64(data.to_vec())
    }

    #[test]
    fn test_binary_broadcast_layout() {
        // [2, 3] + [3] broadcast via stride 0
        let lhs = f64_storage(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let rhs = f64_storage(&[10.0, 20.0, 30.0]);
        let out_shape = Shape::from((2, 3));
        let ll = Layout::contiguous(out_shape.clone());
        let rl = Layout::contiguous(Shape::from(3))
            .broadcast_as(&out_shape)
            .unwrap();
        let out = CpuBackend::binary_op(BinaryOp::Add, &lhs, &ll, &rhs, &rl).unwrap();
        let v = CpuBackend::to_f64_vec(&out, &ll).unwrap();
        assert_eq!(v, vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
    }

    #[test]
    fn test_reduce_over_two_dims() {
        let data = f64_storage(&(0..12).map(|v| v as f64).collect::<Vec<_>>());
        let layout = Layout::contiguous(Shape::from((2, 2, 3)));
        let out = CpuBackend::reduce_op(ReduceOp::Sum, &data, &layout, &[1, 2], true).unwrap();
        let v = CpuBackend::to_f64_vec(&out, &Layout::contiguous(Shape::from((2, 1, 1)))).unwrap();
        assert_eq!(v, vec![15.0, 51.0]);

        let out = CpuBackend::reduce_op(ReduceOp::Max, &data, &layout, &[0], false).unwrap();
        let v = CpuBackend::to_f64_vec(&out, &Layout::contiguous(Shape::from((2, 3)))).unwrap();
        assert_eq!(v, vec![6.0, 7.0, 8.0, 9.0, 10.0, 11.0]);
    }

    #[test]
    fn test_matmul_batched_broadcast_rhs() {
        // [2, 1, 2] @ [2, 1] with rhs broadcast over the batch
        let lhs = f64_storage(&[1.0, 2.0, 3.0, 4.0]);
        let rhs = f64_storage(&[1.0, 1.0]);
        let ll = Layout::contiguous(Shape::from((2, 1, 2)));
        let rl = Layout::contiguous(Shape::from((2, 1)))
            .broadcast_as(&Shape::from((2, 2, 1)))
            .unwrap();
        let out = CpuBackend::matmul(&lhs, &ll, &rhs, &rl).unwrap();
        let v = CpuBackend::to_f64_vec(&out, &Layout::contiguous(Shape::from((2, 1, 1)))).unwrap();
        assert_eq!(v, vec![3.0, 7.0]);
    }

    #[test]
    fn test_matmul_half_precision() {
        // [2, 2] @ [2, 1] in f16 and bf16, read back through f64
        let ll = Layout::contiguous(Shape::from((2, 2)));
        let rl = Layout::contiguous(Shape::from((2, 1)));
        let ol = Layout::contiguous(Shape::from((2, 1)));
        let lhs = CpuStorage::F16([1.0, 2.0, 3.0, 4.0].map(f16::from_f64).to_vec());
        let rhs = CpuStorage::F16([0.5, -1.0].map(f16::from_f64).to_vec());
        let out = CpuBackend::matmul(&lhs, &ll, &rhs, &rl).unwrap();
        assert_eq!(out.dtype(), DType::F16);
        assert_eq!(CpuBackend::to_f64_vec(&out, &ol).unwrap(), vec![-1.5, -2.5]);

        let lhs = CpuStorage::BF16([1.0, 2.0, 3.0, 4.0].map(bf16::from_f64).to_vec());
        let rhs = CpuStorage::BF16([0.5, -1.0].map(bf16::from_f64).to_vec());
        let out = CpuBackend::matmul(&lhs, &ll, &rhs, &rl).unwrap();
        assert_eq!(CpuBackend::to_f64_vec(&out, &ol).unwrap(), vec![-1.5, -2.5]);
    }

    #[test]
    fn test_index_select_rows() {
        let data = f64_storage(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let layout = Layout::contiguous(Shape::from((3, 2)));
        let idx = CpuStorage::U32(vec![2, 0, 2]);
        let il = Layout::contiguous(Shape::from(3));
        let out = CpuBackend::index_select(&data, &layout, &idx, &il, 0).unwrap();
        let v = CpuBackend::to_f64_vec(&out, &Layout::contiguous(Shape::from((3, 2)))).unwrap();
        assert_eq!(v, vec![5.0, 6.0, 1.0, 2.0, 5.0, 6.0]);
    }

    #[test]
    fn test_cat_middle_dim() {
        let a = f64_storage(&[1.0, 2.0]);
        let b = f64_storage(&[3.0, 4.0, 5.0, 6.0]);
        let la = Layout::contiguous(Shape::from((2, 1)));
        let lb = Layout::contiguous(Shape::from((2, 2)));
        let out_shape = Shape::from((2, 3));
        let out = CpuBackend::cat(&[(&a, &la), (&b, &lb)], &out_shape, 1).unwrap();
        let v = CpuBackend::to_f64_vec(&out, &Layout::contiguous(out_shape)).unwrap();
        assert_eq!(v, vec![1.0, 3.0, 4.0, 2.0, 5.0, 6.0]);
    }

    #[test]
    fn test_dtype_mismatch_is_error() {
        let a = CpuStorage::F32(vec![1.0]);
        let b = CpuStorage::F64(vec![1.0]);
        let l = Layout::contiguous(Shape::from(1));
        assert!(CpuBackend::binary_op(BinaryOp::Add, &a, &l, &b, &l).is_err());
    }

    #[test]
    fn test_half_roundtrip() {
        let s = CpuBackend::from_f64_slice(&[0.5, -1.25], DType::F16, &CpuDevice).unwrap();
        assert_eq!(s.dtype(), DType::F16);
        let v = CpuBackend::to_f64_vec(&s, &Layout::contiguous(Shape::from(2))).unwrap();
        assert_eq!(v, vec![0.5, -1.25]);
    }
}
