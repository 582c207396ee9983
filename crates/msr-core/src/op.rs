// Op — graph node recorded by every differentiable tensor operation
//
// Each tensor remembers the op that produced it together with Arc handles to
// its inputs. The backward pass walks these handles; no separate tape exists.
// Dropping the output drops the graph.

use crate::backend::{Backend, BinaryOp, ReduceOp, UnaryOp};
use crate::dtype::DType;
use crate::shape::Shape;
use crate::Tensor;

/// Unique identifier for a tensor, used as the key in `GradStore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorId(pub(crate) u64);

impl Default for TensorId {
    fn default() -> Self {
        Self::new()
    }
}

impl TensorId {
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        TensorId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// The operation that produced a tensor.
pub enum Op<B: Backend> {
    /// Leaf: input data or a parameter.
    None,

    Binary {
        lhs: Tensor<B>,
        rhs: Tensor<B>,
        op: BinaryOp,
    },

    Unary {
        input: Tensor<B>,
        op: UnaryOp,
    },

    Reduce {
        input: Tensor<B>,
        op: ReduceOp,
        dims: Vec<usize>,
        keep_dim: bool,
    },

    /// Batched matmul; batch dims may have been broadcast.
    Matmul { lhs: Tensor<B>, rhs: Tensor<B> },

    /// Reshape, squeeze and unsqueeze.
    Reshape { input: Tensor<B>, src_shape: Shape },

    Transpose {
        input: Tensor<B>,
        dim0: usize,
        dim1: usize,
    },

    /// Output dim `i` is input dim `dims[i]`.
    Permute { input: Tensor<B>, dims: Vec<usize> },

    Narrow {
        input: Tensor<B>,
        dim: usize,
        start: usize,
        len: usize,
    },

    /// Stride-0 broadcast view of `input`.
    Expand { input: Tensor<B>, src_shape: Shape },

    Affine {
        input: Tensor<B>,
        mul: f64,
        add: f64,
    },

    Contiguous { input: Tensor<B> },

    /// Grouped 2-D convolution. input `[N, C_in, H, W]`,
    /// weight `[C_out, C_in / groups, kH, kW]`.
    Conv2d {
        input: Tensor<B>,
        weight: Tensor<B>,
        bias: Option<Tensor<B>>,
        stride: [usize; 2],
        padding: [usize; 2],
        groups: usize,
    },

    Cat {
        inputs: Vec<Tensor<B>>,
        dim: usize,
        sizes: Vec<usize>,
    },

    Powf { input: Tensor<B>, exponent: f64 },

    /// Constant padding, one `[before, after]` pair per dim.
    Pad {
        input: Tensor<B>,
        padding: Vec<[usize; 2]>,
    },

    IndexSelect {
        input: Tensor<B>,
        indices: Tensor<B>,
        dim: usize,
    },

    ToDtype { input: Tensor<B>, src_dtype: DType },

    /// Real 2-D FFT over the last two dims; output carries a re/im axis.
    Rfft2 { input: Tensor<B> },

    /// Inverse of `Rfft2`; `width` is the restored size of the last dim.
    Irfft2 { input: Tensor<B>, width: usize },
}

impl<B: Backend> Clone for Op<B> {
    fn clone(&self) -> Self {
        match self {
            Op::None => Op::None,
            Op::Binary { lhs, rhs, op } => Op::Binary {
                lhs: lhs.clone(),
                rhs: rhs.clone(),
                op: *op,
            },
            Op::Unary { input, op } => Op::Unary {
                input: input.clone(),
                op: *op,
            },
            Op::Reduce {
                input,
                op,
                dims,
                keep_dim,
            } => Op::Reduce {
                input: input.clone(),
                op: *op,
                dims: dims.clone(),
                keep_dim: *keep_dim,
            },
            Op::Matmul { lhs, rhs } => Op::Matmul {
                lhs: lhs.clone(),
                rhs: rhs.clone(),
            },
            Op::Reshape { input, src_shape } => Op::Reshape {
                input: input.clone(),
                src_shape: src_shape.clone(),
            },
            Op::Transpose { input, dim0, dim1 } => Op::Transpose {
                input: input.clone(),
                dim0: *dim0,
                dim1: *dim1,
            },
            Op::Permute { input, dims } => Op::Permute {
                input: input.clone(),
                dims: dims.clone(),
            },
            Op::Narrow {
                input,
                dim,
                start,
                len,
            } => Op::Narrow {
                input: input.clone(),
                dim: *dim,
                start: *start,
                len: *len,
            },
            Op::Expand { input, src_shape } => Op::Expand {
                input: input.clone(),
                src_shape: src_shape.clone(),
            },
            Op::Affine { input, mul, add } => Op::Affine {
                input: input.clone(),
                mul: *mul,
                add: *add,
            },
            Op::Contiguous { input } => Op::Contiguous {
                input: input.clone(),
            },
            Op::Conv2d {
                input,
                weight,
                bias,
                stride,
                padding,
                groups,
            } => Op::Conv2d {
                input: input.clone(),
                weight: weight.clone(),
                bias: bias.clone(),
                stride: *stride,
                padding: *padding,
                groups: *groups,
            },
            Op::Cat { inputs, dim, sizes } => Op::Cat {
                inputs: inputs.clone(),
                dim: *dim,
                sizes: sizes.clone(),
            },
            Op::Powf { input, exponent } => Op::Powf {
                input: input.clone(),
                exponent: *exponent,
            },
            Op::Pad { input, padding } => Op::Pad {
                input: input.clone(),
                padding: padding.clone(),
            },
            Op::IndexSelect {
                input,
                indices,
                dim,
            } => Op::IndexSelect {
                input: input.clone(),
                indices: indices.clone(),
                dim: *dim,
            },
            Op::ToDtype { input, src_dtype } => Op::ToDtype {
                input: input.clone(),
                src_dtype: *src_dtype,
            },
            Op::Rfft2 { input } => Op::Rfft2 {
                input: input.clone(),
            },
            Op::Irfft2 { input, width } => Op::Irfft2 {
                input: input.clone(),
                width: *width,
            },
        }
    }
}

// Debug prints op kind and input ids only, never data.
impl<B: Backend> std::fmt::Debug for Op<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Op::None => write!(f, "None"),
            Op::Binary { lhs, rhs, op } => {
                write!(f, "Binary({:?}, id={:?}, id={:?})", op, lhs.id(), rhs.id())
            }
            Op::Unary { input, op } => write!(f, "Unary({:?}, id={:?})", op, input.id()),
            Op::Reduce {
                input, op, dims, ..
            } => write!(f, "Reduce({:?}, dims={:?}, id={:?})", op, dims, input.id()),
            Op::Matmul { lhs, rhs } => {
                write!(f, "Matmul(id={:?}, id={:?})", lhs.id(), rhs.id())
            }
            Op::Reshape { input, src_shape } => {
                write!(f, "Reshape(from {}, id={:?})", src_shape, input.id())
            }
            Op::Transpose { input, dim0, dim1 } => {
                write!(f, "Transpose({}, {}, id={:?})", dim0, dim1, input.id())
            }
            Op::Permute { input, dims } => {
                write!(f, "Permute({:?}, id={:?})", dims, input.id())
            }
            Op::Narrow {
                input,
                dim,
                start,
                len,
            } => write!(
                f,
                "Narrow(dim={}, {}..{}, id={:?})",
                dim,
                start,
                start + len,
                input.id()
            ),
            Op::Expand { input, src_shape } => {
                write!(f, "Expand(from {}, id={:?})", src_shape, input.id())
            }
            Op::Affine { input, mul, add } => {
                write!(f, "Affine(*{} +{}, id={:?})", mul, add, input.id())
            }
            Op::Contiguous { input } => write!(f, "Contiguous(id={:?})", input.id()),
            Op::Conv2d {
                input,
                weight,
                bias,
                stride,
                padding,
                groups,
            } => write!(
                f,
                "Conv2d(in={:?}, w={:?}, bias={}, s={:?}, p={:?}, g={})",
                input.id(),
                weight.id(),
                bias.is_some(),
                stride,
                padding,
                groups
            ),
            Op::Cat { inputs, dim, .. } => {
                let ids: Vec<_> = inputs.iter().map(|t| t.id()).collect();
                write!(f, "Cat(dim={}, ids={:?})", dim, ids)
            }
            Op::Powf { input, exponent } => {
                write!(f, "Powf(exp={}, id={:?})", exponent, input.id())
            }
            Op::Pad { input, padding } => {
                write!(f, "Pad(pad={:?}, id={:?})", padding, input.id())
            }
            Op::IndexSelect {
                input,
                indices,
                dim,
            } => write!(
                f,
                "IndexSelect(dim={}, input={:?}, indices={:?})",
                dim,
                input.id(),
                indices.id()
            ),
            Op::ToDtype { input, src_dtype } => {
                write!(f, "ToDtype(from={:?}, id={:?})", src_dtype, input.id())
            }
            Op::Rfft2 { input } => write!(f, "Rfft2(id={:?})", input.id()),
            Op::Irfft2 { input, width } => {
                write!(f, "Irfft2(width={}, id={:?})", width, input.id())
            }
        }
    }
}

impl<B: Backend> Op<B> {
    /// Input tensors of this op, in a fixed order. Index tensors are included
    /// so the topological sort sees them, but they never receive gradients.
    pub fn inputs(&self) -> Vec<&Tensor<B>> {
        match self {
            Op::None => vec![],
            Op::Binary { lhs, rhs, .. } | Op::Matmul { lhs, rhs } => vec![lhs, rhs],
            Op::Unary { input, .. }
            | Op::Reduce { input, .. }
            | Op::Reshape { input, .. }
            | Op::Transpose { input, .. }
            | Op::Permute { input, .. }
            | Op::Narrow { input, .. }
            | Op::Expand { input, .. }
            | Op::Affine { input, .. }
            | Op::Contiguous { input }
            | Op::Powf { input, .. }
            | Op::Pad { input, .. }
            | Op::ToDtype { input, .. }
            | Op::Rfft2 { input }
            | Op::Irfft2 { input, .. } => vec![input],
            Op::Conv2d {
                input,
                weight,
                bias,
                ..
            } => {
                let mut v = vec![input, weight];
                if let Some(b) = bias {
                    v.push(b);
                }
                v
            }
            Op::Cat { inputs, .. } => inputs.iter().collect(),
            Op::IndexSelect { input, indices, .. } => vec![input, indices],
        }
    }
}
