// Host-side convolution kernels: im2col + GEMM, grouped
//
// A convolution over one sample and one group becomes a single GEMM:
//
//   columns = im2col(input[g])         [C_in/g · kH · kW,  H_out · W_out]
//   out[g]  = weight[g] × columns      [C_out/g,            H_out · W_out]
//
// The backward pass reuses the same column buffer:
//
//   grad_weight[g] += grad_out[g] × columnsᵀ
//   grad_input[g]   = col2im(weight[g]ᵀ × grad_out[g])
//
// All buffers are contiguous row-major f64.

use crate::error::{Error, Result};

/// Sizes of one grouped 2-D convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ConvGeometry {
    pub n: usize,
    pub c_in: usize,
    pub h: usize,
    pub w: usize,
    pub c_out: usize,
    pub kh: usize,
    pub kw: usize,
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub groups: usize,
    pub h_out: usize,
    pub w_out: usize,
}

impl ConvGeometry {
    /// Validate input `[N, C_in, H, W]` against weight `[C_out, C_in/groups, kH, kW]`.
    pub fn new(
        input_dims: &[usize],
        weight_dims: &[usize],
        stride: [usize; 2],
        padding: [usize; 2],
        groups: usize,
    ) -> Result<Self> {
        if input_dims.len() != 4 {
            return Err(Error::RankMismatch {
                expected: 4,
                got: input_dims.len(),
            });
        }
        if weight_dims.len() != 4 {
            return Err(Error::RankMismatch {
                expected: 4,
                got: weight_dims.len(),
            });
        }
        let (n, c_in, h, w) = (input_dims[0], input_dims[1], input_dims[2], input_dims[3]);
        let (c_out, wc_in, kh, kw) = (weight_dims[0], weight_dims[1], weight_dims[2], weight_dims[3]);
        if groups == 0 || c_in % groups != 0 {
            return Err(Error::GroupsMismatch {
                channels: c_in,
                groups,
            });
        }
        if c_out % groups != 0 {
            return Err(Error::GroupsMismatch {
                channels: c_out,
                groups,
            });
        }
        if wc_in * groups != c_in {
            return Err(Error::msg(format!(
                "conv2d: input has {} channels but weight expects {} x {} groups",
                c_in, wc_in, groups
            )));
        }
        if stride[0] == 0 || stride[1] == 0 {
            return Err(Error::msg("conv2d: stride must be positive"));
        }
        let [ph, pw] = padding;
        if h + 2 * ph < kh || w + 2 * pw < kw {
            return Err(Error::msg(format!(
                "conv2d: kernel {}x{} larger than padded input {}x{}",
                kh,
                kw,
                h + 2 * ph,
                w + 2 * pw
            )));
        }
        Ok(ConvGeometry {
            n,
            c_in,
            h,
            w,
            c_out,
            kh,
            kw,
            stride,
            padding,
            groups,
            h_out: (h + 2 * ph - kh) / stride[0] + 1,
            w_out: (w + 2 * pw - kw) / stride[1] + 1,
        })
    }

    pub fn output_dims(&self) -> Vec<usize> {
        vec![self.n, self.c_out, self.h_out, self.w_out]
    }

    fn cin_g(&self) -> usize {
        self.c_in / self.groups
    }

    fn cout_g(&self) -> usize {
        self.c_out / self.groups
    }

    fn col_rows(&self) -> usize {
        self.cin_g() * self.kh * self.kw
    }

    fn col_cols(&self) -> usize {
        self.h_out * self.w_out
    }

    fn plane(&self) -> usize {
        self.h * self.w
    }

    // Input slice of channel group `g` in sample `ni`.
    fn input_range(&self, ni: usize, g: usize) -> std::ops::Range<usize> {
        let start = (ni * self.c_in + g * self.cin_g()) * self.plane();
        start..start + self.cin_g() * self.plane()
    }

    fn output_range(&self, ni: usize, g: usize) -> std::ops::Range<usize> {
        let start = (ni * self.c_out + g * self.cout_g()) * self.col_cols();
        start..start + self.cout_g() * self.col_cols()
    }

    fn weight_range(&self, g: usize) -> std::ops::Range<usize> {
        let start = g * self.cout_g() * self.col_rows();
        start..start + self.cout_g() * self.col_rows()
    }

    fn im2col(&self, input: &[f64], columns: &mut [f64]) {
        let [sh, sw] = self.stride;
        let [ph, pw] = self.padding;
        let col_cols = self.col_cols();
        for ci in 0..self.cin_g() {
            for ki in 0..self.kh {
                for kj in 0..self.kw {
                    let row = (ci * self.kh + ki) * self.kw + kj;
                    let dst = &mut columns[row * col_cols..(row + 1) * col_cols];
                    for oh in 0..self.h_out {
                        let ih = (oh * sh + ki) as isize - ph as isize;
                        for ow in 0..self.w_out {
                            let iw = (ow * sw + kj) as isize - pw as isize;
                            dst[oh * self.w_out + ow] = if ih >= 0
                                && (ih as usize) < self.h
                                && iw >= 0
                                && (iw as usize) < self.w
                            {
                                input[(ci * self.h + ih as usize) * self.w + iw as usize]
                            } else {
                                0.0
                            };
                        }
                    }
                }
            }
        }
    }

    // Accumulates into `output`.
    fn col2im(&self, columns: &[f64], output: &mut [f64]) {
        let [sh, sw] = self.stride;
        let [ph, pw] = self.padding;
        let col_cols = self.col_cols();
        for ci in 0..self.cin_g() {
            for ki in 0..self.kh {
                for kj in 0..self.kw {
                    let row = (ci * self.kh + ki) * self.kw + kj;
                    let src = &columns[row * col_cols..(row + 1) * col_cols];
                    for oh in 0..self.h_out {
                        let ih = (oh * sh + ki) as isize - ph as isize;
                        if ih < 0 || ih as usize >= self.h {
                            continue;
                        }
                        for ow in 0..self.w_out {
                            let iw = (ow * sw + kj) as isize - pw as isize;
                            if iw >= 0 && (iw as usize) < self.w {
                                output[(ci * self.h + ih as usize) * self.w + iw as usize] +=
                                    src[oh * self.w_out + ow];
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Forward convolution; returns `[N, C_out, H_out, W_out]` row-major.
pub(crate) fn conv2d_forward(
    geo: &ConvGeometry,
    input: &[f64],
    weight: &[f64],
    bias: Option<&[f64]>,
) -> Vec<f64> {
    let col_cols = geo.col_cols();
    let mut output = vec![0.0f64; geo.n * geo.c_out * col_cols];
    let mut columns = vec![0.0f64; geo.col_rows() * col_cols];
    for ni in 0..geo.n {
        for g in 0..geo.groups {
            geo.im2col(&input[geo.input_range(ni, g)], &mut columns);
            gemm(
                &weight[geo.weight_range(g)],
                &columns,
                &mut output[geo.output_range(ni, g)],
                geo.cout_g(),
                col_cols,
                geo.col_rows(),
            );
        }
        if let Some(b) = bias {
            for co in 0..geo.c_out {
                let row = (ni * geo.c_out + co) * col_cols;
                output[row..row + col_cols]
                    .iter_mut()
                    .for_each(|v| *v += b[co]);
            }
        }
    }
    output
}

/// Gradients of a convolution w.r.t. input, weight and bias.
pub(crate) struct ConvGrads {
    pub input: Vec<f64>,
    pub weight: Vec<f64>,
    pub bias: Vec<f64>,
}

pub(crate) fn conv2d_backward(
    geo: &ConvGeometry,
    input: &[f64],
    weight: &[f64],
    grad_out: &[f64],
) -> ConvGrads {
    let col_cols = geo.col_cols();
    let mut grad_input = vec![0.0f64; input.len()];
    let mut grad_weight = vec![0.0f64; weight.len()];
    let mut grad_bias = vec![0.0f64; geo.c_out];
    let mut columns = vec![0.0f64; geo.col_rows() * col_cols];

    for ni in 0..geo.n {
        for g in 0..geo.groups {
            let go = &grad_out[geo.output_range(ni, g)];

            geo.im2col(&input[geo.input_range(ni, g)], &mut columns);
            gemm_a_bt(
                go,
                &columns,
                &mut grad_weight[geo.weight_range(g)],
                geo.cout_g(),
                geo.col_rows(),
                col_cols,
            );

            columns.iter_mut().for_each(|v| *v = 0.0);
            gemm_at_b(
                &weight[geo.weight_range(g)],
                go,
                &mut columns,
                geo.col_rows(),
                col_cols,
                geo.cout_g(),
            );
            geo.col2im(&columns, &mut grad_input[geo.input_range(ni, g)]);
        }
        for co in 0..geo.c_out {
            let row = (ni * geo.c_out + co) * col_cols;
            grad_bias[co] += grad_out[row..row + col_cols].iter().sum::<f64>();
        }
    }

    ConvGrads {
        input: grad_input,
        weight: grad_weight,
        bias: grad_bias,
    }
}

/// `C += A × B` with A `[m, k]`, B `[k, n]`.
#[inline]
pub(crate) fn gemm(a: &[f64], b: &[f64], c: &mut [f64], m: usize, n: usize, k: usize) {
    for i in 0..m {
        let c_row = &mut c[i * n..(i + 1) * n];
        for p in 0..k {
            let a_val = a[i * k + p];
            if a_val == 0.0 {
                continue;
            }
            let b_row = &b[p * n..(p + 1) * n];
            for (cv, bv) in c_row.iter_mut().zip(b_row) {
                *cv += a_val * bv;
            }
        }
    }
}

/// `C += Aᵀ × B` with A stored `[k, m]`, B `[k, n]`.
#[inline]
pub(crate) fn gemm_at_b(a: &[f64], b: &[f64], c: &mut [f64], m: usize, n: usize, k: usize) {
    for p in 0..k {
        let b_row = &b[p * n..(p + 1) * n];
        for i in 0..m {
            let a_val = a[p * m + i];
            if a_val == 0.0 {
                continue;
            }
            let c_row = &mut c[i * n..(i + 1) * n];
            for (cv, bv) in c_row.iter_mut().zip(b_row) {
                *cv += a_val * bv;
            }
        }
    }
}

/// `C += A × Bᵀ` with A `[m, k]`, B stored `[n, k]`.
#[inline]
pub(crate) fn gemm_a_bt(a: &[f64], b: &[f64], c: &mut [f64], m: usize, n: usize, k: usize) {
    for i in 0..m {
        let a_row = &a[i * k..(i + 1) * k];
        for j in 0..n {
            let b_row = &b[j * k..(j + 1) * k];
            c[i * n + j] += a_row.iter().zip(b_row).map(|(x, y)| x * y).sum::<f64>();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_kernel() {
        let geo = ConvGeometry::new(&[1, 1, 3, 3], &[1, 1, 3, 3], [1, 1], [1, 1], 1).unwrap();
        let x: Vec<f64> = (1..=9).map(|v| v as f64).collect();
        let mut k = vec![0.0; 9];
        k[4] = 1.0;
        let y = conv2d_forward(&geo, &x, &k, None);
        assert_eq!(y, x);
    }

    #[test]
    fn test_depthwise_groups_are_independent() {
        // two channels, groups = 2, each with its own 1x1 scale
        let geo = ConvGeometry::new(&[1, 2, 2, 2], &[2, 1, 1, 1], [1, 1], [0, 0], 2).unwrap();
        let x = vec![1.0, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0];
        let y = conv2d_forward(&geo, &x, &[2.0, -1.0], Some(&[0.5, 0.0]));
        assert_eq!(y, vec![2.5, 4.5, 6.5, 8.5, -10.0, -20.0, -30.0, -40.0]);
    }

    #[test]
    fn test_backward_bias_and_weight() {
        let geo = ConvGeometry::new(&[1, 1, 2, 2], &[1, 1, 1, 1], [1, 1], [0, 0], 1).unwrap();
        let x = vec![1.0, 2.0, 3.0, 4.0];
        let grads = conv2d_backward(&geo, &x, &[3.0], &[1.0; 4]);
        assert_eq!(grads.bias, vec![4.0]);
        assert_eq!(grads.weight, vec![10.0]);
        assert_eq!(grads.input, vec![3.0; 4]);
    }

    #[test]
    fn test_groups_mismatch_is_error() {
        assert!(ConvGeometry::new(&[1, 3, 4, 4], &[4, 1, 3, 3], [1, 1], [1, 1], 2).is_err());
    }
}
