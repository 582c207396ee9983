// Backprop — reverse-mode automatic differentiation
//
// Tensor operations record their inputs in `Op`. `backward()` sorts the graph
// topologically from the scalar root, seeds grad(root) = 1 and walks it in
// reverse, applying the chain rule per op and summing contributions for
// tensors used more than once.
//
// GRADIENT RULES:
//
//   Binary      Add/Sub/Mul/Div, reduced back over broadcast dims
//   Unary       Gelu uses dΦ, Relu/Abs use host masks
//   Reduce      Sum/Mean expand back; Max/Min route to the arg-extremum,
//               ties share the gradient equally
//   Matmul      grad_A = grad @ Bᵀ, grad_B = Aᵀ @ grad (batch dims reduced)
//   Views       Reshape/Transpose/Permute/Narrow/Expand invert the view
//   Conv2d      im2col adjoints (see conv.rs)
//   Pad         narrow back to the unpadded region
//   IndexSelect scatter-add into the selected positions
//   Rfft2       adjoint of the real 2-D FFT (see spectral.rs)
//   Irfft2      weighted forward FFT

use std::collections::{HashMap, HashSet};

use crate::backend::{Backend, BinaryOp, ReduceOp, UnaryOp};
use crate::conv::{self, ConvGeometry};
use crate::error::{Error, Result};
use crate::op::{Op, TensorId};
use crate::scalar;
use crate::shape::Shape;
use crate::spectral;
use crate::tensor::Tensor;

/// Gradients of every tensor in a graph, keyed by tensor id.
pub struct GradStore<B: Backend> {
    grads: HashMap<TensorId, Tensor<B>>,
}

impl<B: Backend> Clone for GradStore<B> {
    fn clone(&self) -> Self {
        GradStore {
            grads: self.grads.clone(),
        }
    }
}

impl<B: Backend> Default for GradStore<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> GradStore<B> {
    pub fn new() -> Self {
        GradStore {
            grads: HashMap::new(),
        }
    }

    /// Gradient of `tensor`, if any reached it.
    pub fn get(&self, tensor: &Tensor<B>) -> Option<&Tensor<B>> {
        self.grads.get(&tensor.id())
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    /// Add `grad` to the gradient already stored for `id`.
    pub fn accumulate(&mut self, id: TensorId, grad: Tensor<B>) -> Result<()> {
        let grad = match self.grads.get(&id) {
            Some(existing) => existing.add(&grad)?,
            None => grad,
        };
        self.grads.insert(id, grad);
        Ok(())
    }
}

// Post-order DFS: every tensor appears after its inputs.
fn build_topo<B: Backend>(root: &Tensor<B>) -> Vec<Tensor<B>> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    let mut stack: Vec<(Tensor<B>, bool)> = vec![(root.clone(), false)];

    // Iterative so that deep networks cannot overflow the call stack.
    while let Some((t, expanded)) = stack.pop() {
        if expanded {
            order.push(t);
            continue;
        }
        if !visited.insert(t.id()) {
            continue;
        }
        let inputs: Vec<Tensor<B>> = t.op().inputs().into_iter().cloned().collect();
        stack.push((t, true));
        for input in inputs.into_iter().rev() {
            if !visited.contains(&input.id()) {
                stack.push((input, false));
            }
        }
    }
    order
}

/// Gradients of the scalar `root` w.r.t. every tensor in its graph.
pub fn backward<B: Backend>(root: &Tensor<B>) -> Result<GradStore<B>> {
    if root.elem_count() != 1 {
        return Err(Error::NotAScalar {
            shape: root.shape().clone(),
        });
    }

    let topo = build_topo(root);
    let mut grads = GradStore::new();
    let seed = Tensor::<B>::ones(root.shape().clone(), root.dtype(), root.device())?;
    grads.grads.insert(root.id(), seed);

    for tensor in topo.iter().rev() {
        let grad_output = match grads.grads.get(&tensor.id()) {
            Some(g) => g.clone(),
            None => continue,
        };

        match tensor.op() {
            Op::None => {}

            Op::Contiguous { input } => grads.accumulate(input.id(), grad_output)?,

            Op::Binary { lhs, rhs, op } => {
                compute_binary_grad(*op, &grad_output, lhs, rhs, &mut grads)?;
            }

            Op::Unary { input, op } => {
                compute_unary_grad(*op, &grad_output, input, &mut grads)?;
            }

            Op::Reduce {
                input, op, dims, ..
            } => {
                compute_reduce_grad(*op, &grad_output, input, dims, &mut grads)?;
            }

            Op::Matmul { lhs, rhs } => {
                let grad_lhs = grad_output.matmul(&last_two_transposed(rhs)?)?;
                let grad_rhs = last_two_transposed(lhs)?.matmul(&grad_output)?;
                grads.accumulate(lhs.id(), reduce_broadcast_grad(&grad_lhs, lhs.shape())?)?;
                grads.accumulate(rhs.id(), reduce_broadcast_grad(&grad_rhs, rhs.shape())?)?;
            }

            Op::Reshape { input, src_shape } => {
                grads.accumulate(input.id(), grad_output.reshape(src_shape.clone())?)?;
            }

            Op::Transpose { input, dim0, dim1 } => {
                grads.accumulate(input.id(), grad_output.transpose(*dim0, *dim1)?)?;
            }

            Op::Permute { input, dims } => {
                let mut inverse = vec![0usize; dims.len()];
                for (i, &d) in dims.iter().enumerate() {
                    inverse[d] = i;
                }
                grads.accumulate(input.id(), grad_output.permute(&inverse)?)?;
            }

            Op::Narrow {
                input,
                dim,
                start,
                len,
            } => {
                let mut padding = vec![[0usize; 2]; input.rank()];
                padding[*dim] = [*start, input.dims()[*dim] - start - len];
                grads.accumulate(input.id(), grad_output.pad(&padding, 0.0)?)?;
            }

            Op::Expand { input, src_shape } => {
                grads.accumulate(input.id(), reduce_broadcast_grad(&grad_output, src_shape)?)?;
            }

            Op::Affine { input, mul, .. } => {
                grads.accumulate(input.id(), grad_output.affine(*mul, 0.0)?)?;
            }

            Op::Conv2d {
                input,
                weight,
                bias,
                stride,
                padding,
                groups,
            } => {
                let geo = ConvGeometry::new(input.dims(), weight.dims(), *stride, *padding, *groups)?;
                let g = conv::conv2d_backward(
                    &geo,
                    &input.to_f64_vec()?,
                    &weight.to_f64_vec()?,
                    &grad_output.to_f64_vec()?,
                );
                grads.accumulate(input.id(), host_grad(&g.input, input)?)?;
                grads.accumulate(weight.id(), host_grad(&g.weight, weight)?)?;
                if let Some(b) = bias {
                    grads.accumulate(b.id(), host_grad(&g.bias, b)?)?;
                }
            }

            Op::Cat { inputs, dim, sizes } => {
                let mut offset = 0usize;
                for (inp, &sz) in inputs.iter().zip(sizes.iter()) {
                    grads.accumulate(inp.id(), grad_output.narrow(*dim, offset, sz)?)?;
                    offset += sz;
                }
            }

            Op::Powf { input, exponent } => {
                // d(xⁿ)/dx = n·xⁿ⁻¹
                let grad = grad_output.mul(&input.powf(exponent - 1.0)?.affine(*exponent, 0.0)?)?;
                grads.accumulate(input.id(), grad)?;
            }

            Op::Pad { input, padding } => {
                let mut grad = grad_output.clone();
                for (d, &[before, after]) in padding.iter().enumerate() {
                    if before > 0 || after > 0 {
                        grad = grad.narrow(d, before, input.dims()[d])?;
                    }
                }
                grads.accumulate(input.id(), grad)?;
            }

            Op::IndexSelect {
                input,
                indices,
                dim,
            } => {
                let grad = index_select_grad(&grad_output, input, indices, *dim)?;
                grads.accumulate(input.id(), grad)?;
            }

            Op::ToDtype { input, src_dtype } => {
                grads.accumulate(input.id(), grad_output.to_dtype(*src_dtype)?)?;
            }

            Op::Rfft2 { input } => {
                let (batch, m, n) = split_last_two(input.dims());
                let g = spectral::rfft2_backward(&grad_output.to_f64_vec()?, batch, m, n);
                grads.accumulate(input.id(), host_grad(&g, input)?)?;
            }

            Op::Irfft2 { input, width } => {
                let (batch, m, _) = split_last_two(&input.dims()[..input.rank() - 1]);
                let g = spectral::irfft2_backward(&grad_output.to_f64_vec()?, batch, m, *width);
                grads.accumulate(input.id(), host_grad(&g, input)?)?;
            }
        }
    }

    Ok(grads)
}

// (product of leading dims, second-to-last, last)
fn split_last_two(dims: &[usize]) -> (usize, usize, usize) {
    let r = dims.len();
    (dims[..r - 2].iter().product(), dims[r - 2], dims[r - 1])
}

fn last_two_transposed<B: Backend>(t: &Tensor<B>) -> Result<Tensor<B>> {
    let r = t.rank();
    t.transpose(r - 2, r - 1)
}

// Host gradient data shaped like `like`.
fn host_grad<B: Backend>(data: &[f64], like: &Tensor<B>) -> Result<Tensor<B>> {
    Tensor::<B>::from_f64_slice(data, like.shape().clone(), like.dtype(), like.device())
}

fn compute_binary_grad<B: Backend>(
    op: BinaryOp,
    grad: &Tensor<B>,
    lhs: &Tensor<B>,
    rhs: &Tensor<B>,
    grads: &mut GradStore<B>,
) -> Result<()> {
    let (grad_lhs, grad_rhs) = match op {
        BinaryOp::Add => (grad.clone(), grad.clone()),
        BinaryOp::Sub => (grad.clone(), grad.neg()?),
        BinaryOp::Mul => (grad.mul(rhs)?, grad.mul(lhs)?),
        BinaryOp::Div => {
            // d(a/b)/db = -a / b²
            let grad_rhs = grad.mul(lhs)?.div(&rhs.square()?)?.neg()?;
            (grad.div(rhs)?, grad_rhs)
        }
    };
    grads.accumulate(lhs.id(), reduce_broadcast_grad(&grad_lhs, lhs.shape())?)?;
    grads.accumulate(rhs.id(), reduce_broadcast_grad(&grad_rhs, rhs.shape())?)?;
    Ok(())
}

/// Sum `grad` over the dims that broadcasting stretched or prepended so it
/// matches `target`.
fn reduce_broadcast_grad<B: Backend>(grad: &Tensor<B>, target: &Shape) -> Result<Tensor<B>> {
    if grad.shape() == target {
        return Ok(grad.clone());
    }
    let lead = grad.rank() - target.rank();
    let dims: Vec<usize> = (0..grad.rank())
        .filter(|&i| i < lead || (target.dims()[i - lead] == 1 && grad.dims()[i] != 1))
        .collect();
    let summed = if dims.is_empty() {
        grad.clone()
    } else {
        grad.sum_dims(&dims, true)?
    };
    summed.reshape(target.clone())
}

// Element-wise host map of the input, multiplied into the incoming gradient.
fn masked_grad<B: Backend>(
    grad: &Tensor<B>,
    input: &Tensor<B>,
    f: impl Fn(f64) -> f64,
) -> Result<Tensor<B>> {
    let factor: Vec<f64> = input.to_f64_vec()?.into_iter().map(f).collect();
    grad.mul(&host_grad(&factor, input)?)
}

fn compute_unary_grad<B: Backend>(
    op: UnaryOp,
    grad: &Tensor<B>,
    input: &Tensor<B>,
    grads: &mut GradStore<B>,
) -> Result<()> {
    let grad_input = match op {
        UnaryOp::Neg => grad.neg()?,
        UnaryOp::Abs => masked_grad(grad, input, |x| {
            if x > 0.0 {
                1.0
            } else if x < 0.0 {
                -1.0
            } else {
                0.0
            }
        })?,
        UnaryOp::Exp => grad.mul(&input.exp()?)?,
        UnaryOp::Log => grad.div(input)?,
        UnaryOp::Sqrt => grad.div(&input.sqrt()?.affine(2.0, 0.0)?)?,
        UnaryOp::Relu => masked_grad(grad, input, |x| if x > 0.0 { 1.0 } else { 0.0 })?,
        UnaryOp::Sigmoid => {
            let s = input.sigmoid()?;
            grad.mul(&s.mul(&s.affine(-1.0, 1.0)?)?)?
        }
        UnaryOp::Tanh => grad.mul(&input.tanh()?.square()?.affine(-1.0, 1.0)?)?,
        UnaryOp::Gelu => masked_grad(grad, input, scalar::gelu_grad)?,
        UnaryOp::Sin => grad.mul(&input.cos()?)?,
        UnaryOp::Cos => grad.mul(&input.sin()?.neg()?)?,
        UnaryOp::Square => grad.mul(&input.affine(2.0, 0.0)?)?,
    };
    grads.accumulate(input.id(), grad_input)
}

fn compute_reduce_grad<B: Backend>(
    op: ReduceOp,
    grad: &Tensor<B>,
    input: &Tensor<B>,
    dims: &[usize],
    grads: &mut GradStore<B>,
) -> Result<()> {
    let reduced: Vec<usize> = if dims.is_empty() {
        (0..input.rank()).collect()
    } else {
        dims.to_vec()
    };
    let mut keep_dims = input.dims().to_vec();
    for &d in &reduced {
        keep_dims[d] = 1;
    }
    let grad = grad.reshape(keep_dims)?;

    let grad_input = match op {
        ReduceOp::Sum => grad.expand(input.shape().clone())?,
        ReduceOp::Mean => {
            let count: usize = reduced.iter().map(|&d| input.dims()[d]).product();
            grad.affine(1.0 / count.max(1) as f64, 0.0)?
                .expand(input.shape().clone())?
        }
        ReduceOp::Max | ReduceOp::Min => {
            let extremum = input
                .detach()
                .reduce_op(op, &reduced, true)?
                .expand(input.shape().clone())?
                .to_f64_vec()?;
            let mask: Vec<f64> = input
                .to_f64_vec()?
                .iter()
                .zip(&extremum)
                .map(|(x, e)| if x == e { 1.0 } else { 0.0 })
                .collect();
            let mask = host_grad(&mask, input)?;
            let ties = mask.sum_dims(&reduced, true)?;
            grad.mul(&mask)?.div(&ties)?
        }
    };
    grads.accumulate(input.id(), grad_input)
}

// Scatter-add of the selected slices back into an input-shaped buffer.
fn index_select_grad<B: Backend>(
    grad: &Tensor<B>,
    input: &Tensor<B>,
    indices: &Tensor<B>,
    dim: usize,
) -> Result<Tensor<B>> {
    let dims = input.dims();
    let outer: usize = dims[..dim].iter().product();
    let inner: usize = dims[dim + 1..].iter().product();
    let size = dims[dim];
    let idx: Vec<usize> = indices
        .to_f64_vec()?
        .into_iter()
        .map(|v| v as usize)
        .collect();
    let grad_data = grad.to_f64_vec()?;

    let mut out = vec![0.0f64; input.elem_count()];
    for o in 0..outer {
        for (j, &src) in idx.iter().enumerate() {
            if src >= size {
                return Err(Error::msg(format!(
                    "index_select backward: index {} out of range for dim of size {}",
                    src, size
                )));
            }
            let g = &grad_data[(o * idx.len() + j) * inner..(o * idx.len() + j + 1) * inner];
            let dst = &mut out[(o * size + src) * inner..(o * size + src + 1) * inner];
            for (d, v) in dst.iter_mut().zip(g) {
                *d += v;
            }
        }
    }
    host_grad(&out, input)
}
