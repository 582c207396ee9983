// Window attention
//
// Tokens are grouped into non-overlapping ws×ws windows and attend only
// within their window. Instead of a q·kᵀ dot product, the query/key affinity
// is a circular 2-D convolution over 8×8 patches of the token grid, computed
// in the frequency domain:
//
//   q, k  [B_, heads, N, d]            N = ws², split into c = N/64 patches
//   score = irfft2(rfft2(q_patch) · rfft2(k_patch))       per (c, d)
//   attn  = softmax(score @ vᵀ + bias)                    [B_, heads, N, N]
//   out   = attn @ v
//
// `bias` comes from a small MLP over log-scaled relative coordinates, so a
// window size not seen in training still gets a bias.

use msr_core::{bail, Backend, DType, Error, Result, Tensor};
use msr_nn::module::prefixed;
use msr_nn::{Linear, Module, ReLU, Sequential};

use crate::config::SPECTRAL_PATCH;

const P: usize = SPECTRAL_PATCH;
const META_HIDDEN: usize = 256;

/// `[B, H, W, C]` → `[B·(H/ws)·(W/ws), ws², C]`, windows in row-major order.
pub fn window_partition<B: Backend>(x: &Tensor<B>, ws: usize) -> Result<Tensor<B>> {
    let d = x.dims().to_vec();
    if d.len() != 4 {
        return Err(Error::RankMismatch {
            expected: 4,
            got: d.len(),
        });
    }
    let (b, h, w, c) = (d[0], d[1], d[2], d[3]);
    if ws == 0 || h % ws != 0 || w % ws != 0 {
        bail!("window_partition: {h}×{w} is not tiled by {ws}×{ws} windows");
    }
    x.reshape(vec![b, h / ws, ws, w / ws, ws, c])?
        .permute(&[0, 1, 3, 2, 4, 5])?
        .reshape((b * (h / ws) * (w / ws), ws * ws, c))
}

/// Inverse of [`window_partition`] for an `h×w` grid.
pub fn window_reverse<B: Backend>(
    windows: &Tensor<B>,
    ws: usize,
    h: usize,
    w: usize,
) -> Result<Tensor<B>> {
    let d = windows.dims().to_vec();
    if d.len() != 3 {
        return Err(Error::RankMismatch {
            expected: 3,
            got: d.len(),
        });
    }
    if ws == 0 || h % ws != 0 || w % ws != 0 || d[1] != ws * ws {
        bail!(
            "window_reverse: windows {:?} do not tile a {h}×{w} grid with ws {ws}",
            d
        );
    }
    let per_image = (h / ws) * (w / ws);
    if d[0] % per_image != 0 {
        bail!("window_reverse: {} windows is not a multiple of {per_image}", d[0]);
    }
    let (b, c) = (d[0] / per_image, d[2]);
    windows
        .reshape(vec![b, h / ws, w / ws, ws, ws, c])?
        .permute(&[0, 1, 3, 2, 4, 5])?
        .reshape((b, h, w, c))
}

/// Log-scaled relative coordinates `[ws², ws², 2]`:
/// `sign(Δ)·ln(1 + |Δ|)` of (row, col) differences between window positions.
pub fn get_relative_positions<B: Backend>(
    ws: usize,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    let n = ws * ws;
    let mut data = Vec::with_capacity(n * n * 2);
    for i in 0..n {
        for j in 0..n {
            for (a, b) in [(i / ws, j / ws), (i % ws, j % ws)] {
                let delta = a as f64 - b as f64;
                data.push(delta.signum() * delta.abs().ln_1p());
            }
        }
    }
    Tensor::<B>::from_f64_slice(&data, (n, n, 2), dtype, device)
}

pub struct WindowAttention<B: Backend> {
    dim: usize,
    window_size: usize,
    num_heads: usize,
    scale: f64,
    /// `[N, N, 2]`, constant
    relative_positions: Tensor<B>,
    meta: Sequential<B>,
}

impl<B: Backend> WindowAttention<B> {
    pub fn new(
        dim: usize,
        window_size: usize,
        num_heads: usize,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let n = window_size * window_size;
        if n == 0 || n % (P * P) != 0 {
            bail!(
                "window attention needs ws² to be a multiple of {}, got ws = {window_size}",
                P * P
            );
        }
        if num_heads == 0 || dim % num_heads != 0 {
            bail!("window attention: dim {dim} is not divisible by {num_heads} heads");
        }
        let head_dim = dim / num_heads;
        let meta = Sequential::new()
            .add(Linear::<B>::new(2, META_HIDDEN, true, dtype, device)?)
            .add(ReLU)
            .add(Linear::<B>::new(META_HIDDEN, num_heads, true, dtype, device)?);
        Ok(WindowAttention {
            dim,
            window_size,
            num_heads,
            scale: (head_dim as f64).powf(-0.5),
            relative_positions: get_relative_positions(window_size, dtype, device)?,
            meta,
        })
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Relative-position bias `[heads, N, N]`.
    pub fn position_bias(&self) -> Result<Tensor<B>> {
        self.meta
            .forward(&self.relative_positions)?
            .permute(&[2, 0, 1])
    }

    /// `[a, b, N, d]` → `[a, b, N/64, d, 8, 8]`
    fn to_patches(t: &Tensor<B>) -> Result<Tensor<B>> {
        let d = t.dims().to_vec();
        t.reshape(vec![d[0], d[1], d[2] / (P * P), P, P, d[3]])?
            .permute(&[0, 1, 2, 5, 3, 4])
    }

    /// `[a, b, c, d, 8, 8]` → `[a, b, c·64, d]`
    fn from_patches(t: &Tensor<B>) -> Result<Tensor<B>> {
        let d = t.dims().to_vec();
        t.permute(&[0, 1, 2, 4, 5, 3])?
            .reshape((d[0], d[1], d[2] * P * P, d[3]))
    }
}

impl<B: Backend> Module<B> for WindowAttention<B> {
    /// `qkv` `[B_, N, 3·dim]` → `[B_, N, dim]`.
    fn forward(&self, qkv: &Tensor<B>) -> Result<Tensor<B>> {
        let d = qkv.dims().to_vec();
        if d.len() != 3 || d[2] != 3 * self.dim {
            bail!(
                "window attention expects [B_, N, {}], got {:?}",
                3 * self.dim,
                d
            );
        }
        let (b_, n) = (d[0], d[1]);
        if n != self.window_size * self.window_size {
            bail!("window attention: {n} tokens per window, expected {}", self.window_size * self.window_size);
        }
        let head_dim = self.dim / self.num_heads;
        let qkv = qkv
            .reshape(vec![b_, n, 3, self.num_heads, head_dim])?
            .permute(&[2, 0, 3, 1, 4])?;
        let parts = qkv.chunk(3, 0)?;
        let q = parts[0].squeeze(0)?.affine(self.scale, 0.0)?;
        let k = parts[1].squeeze(0)?;
        let v = parts[2].squeeze(0)?;

        let q_fft = Self::to_patches(&q)?.rfft2()?;
        let k_fft = Self::to_patches(&k)?.rfft2()?;
        let score = Self::from_patches(&q_fft.complex_mul(&k_fft)?.irfft2(P)?)?;

        let attn = score
            .matmul(&v.transpose(2, 3)?)?
            .add(&self.position_bias()?.unsqueeze(0)?)?
            .softmax(3)?;
        attn.matmul(&v)?
            .transpose(1, 2)?
            .reshape((b_, n, self.dim))
    }

    fn parameters(&self) -> Vec<Tensor<B>> {
        self.meta.parameters()
    }

    fn named_parameters(&self) -> Vec<(String, Tensor<B>)> {
        prefixed("meta", self.meta.named_parameters())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msr_cpu::{CpuBackend, CpuDevice};

    type T = Tensor<CpuBackend>;

    fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() < tol
    }

    #[test]
    fn test_partition_layout() -> Result<()> {
        // 1×4×4×1 grid of 0..16, ws = 2: first window is rows 0-1, cols 0-1
        let data: Vec<f64> = (0..16).map(|i| i as f64).collect();
        let x = T::from_f64_slice(&data, (1, 4, 4, 1), DType::F64, &CpuDevice)?;
        let win = window_partition(&x, 2)?;
        assert_eq!(win.dims(), &[4, 4, 1]);
        let v = win.to_f64_vec()?;
        assert_eq!(&v[0..4], &[0.0, 1.0, 4.0, 5.0]);
        assert_eq!(&v[4..8], &[2.0, 3.0, 6.0, 7.0]);
        assert_eq!(window_reverse(&win, 2, 4, 4)?.to_f64_vec()?, data);
        Ok(())
    }

    #[test]
    fn test_partition_rejects_ragged_grid() {
        let x = T::zeros((1, 6, 8, 2), DType::F64, &CpuDevice).expect("alloc");
        assert!(window_partition(&x, 4).is_err());
    }

    #[test]
    fn test_relative_positions() -> Result<()> {
        let ws = 3;
        let n = ws * ws;
        let rel = get_relative_positions::<CpuBackend>(ws, DType::F64, &CpuDevice)?;
        assert_eq!(rel.dims(), &[n, n, 2]);
        let v = rel.to_f64_vec()?;
        let at = |i: usize, j: usize, k: usize| v[(i * n + j) * 2 + k];
        for i in 0..n {
            assert_eq!(at(i, i, 0), 0.0);
            assert_eq!(at(i, i, 1), 0.0);
            for j in 0..n {
                for k in 0..2 {
                    assert!(approx_eq(at(i, j, k), -at(j, i, k), 1e-15));
                }
            }
        }
        // position 1 is one column right of position 0
        assert!(approx_eq(at(1, 0, 1), 2f64.ln(), 1e-15));
        assert_eq!(at(1, 0, 0), 0.0);
        // position 8 (row 2, col 2) vs 0: ln 3 on both axes
        assert!(approx_eq(at(8, 0, 0), 3f64.ln(), 1e-15));
        Ok(())
    }

    #[test]
    fn test_attention_shapes_and_rows() -> Result<()> {
        let attn = WindowAttention::<CpuBackend>::new(8, 8, 2, DType::F64, &CpuDevice)?;
        let qkv = T::randn((3, 64, 24), DType::F64, &CpuDevice)?;
        let out = attn.forward(&qkv)?;
        assert_eq!(out.dims(), &[3, 64, 8]);
        assert_eq!(attn.position_bias()?.dims(), &[2, 64, 64]);
        Ok(())
    }

    #[test]
    fn test_constant_values_pass_through() -> Result<()> {
        // softmax rows sum to one, so v = const gives out = const
        let attn = WindowAttention::<CpuBackend>::new(4, 8, 1, DType::F64, &CpuDevice)?;
        let qk = T::randn((1, 64, 8), DType::F64, &CpuDevice)?;
        let v = T::full((1, 64, 4), 0.75, DType::F64, &CpuDevice)?;
        let out = attn.forward(&Tensor::cat(&[qk, v], 2)?)?;
        assert!(out.to_f64_vec()?.iter().all(|&o| approx_eq(o, 0.75, 1e-10)));
        Ok(())
    }

    /// Direct evaluation of windowed attention whose q/k affinity is the
    /// circular 2-D convolution of each 8×8 patch of q with the same patch
    /// of k, per channel.
    fn direct_attention(
        qkv: &[f64],
        bias: &[f64],
        b_: usize,
        n: usize,
        dim: usize,
        heads: usize,
    ) -> Vec<f64> {
        let hd = dim / heads;
        let scale = (hd as f64).powf(-0.5);
        let at = |b: usize, tok: usize, ch: usize| qkv[(b * n + tok) * 3 * dim + ch];
        let mut out = vec![0.0; b_ * n * dim];
        for b in 0..b_ {
            for h in 0..heads {
                let ch = |part: usize, j: usize| part * dim + h * hd + j;
                // score[tok][j]
                let mut score = vec![vec![0.0; hd]; n];
                for (tok, row) in score.iter_mut().enumerate() {
                    let (c, p1, p2) = (tok / (P * P), (tok % (P * P)) / P, tok % P);
                    for (j, s) in row.iter_mut().enumerate() {
                        for u1 in 0..P {
                            for u2 in 0..P {
                                let qi = c * P * P + u1 * P + u2;
                                let ki = c * P * P + ((p1 + P - u1) % P) * P + (p2 + P - u2) % P;
                                *s += scale * at(b, qi, ch(0, j)) * at(b, ki, ch(1, j));
                            }
                        }
                    }
                }
                for tok in 0..n {
                    let logits: Vec<f64> = (0..n)
                        .map(|m| {
                            let dot: f64 =
                                (0..hd).map(|j| score[tok][j] * at(b, m, ch(2, j))).sum();
                            dot + bias[(h * n + tok) * n + m]
                        })
                        .collect();
                    let max = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                    let exps: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
                    let total: f64 = exps.iter().sum();
                    for j in 0..hd {
                        out[(b * n + tok) * dim + h * hd + j] = (0..n)
                            .map(|m| exps[m] / total * at(b, m, ch(2, j)))
                            .sum();
                    }
                }
            }
        }
        out
    }

    #[test]
    fn test_attention_matches_direct_circular_convolution() -> Result<()> {
        let (b_, dim, heads) = (2, 4, 2);
        // ws = 16 gives four 8×8 patches per window
        for ws in [8, 16] {
            let n = ws * ws;
            let attn = WindowAttention::<CpuBackend>::new(dim, ws, heads, DType::F64, &CpuDevice)?;
            let qkv = T::randn((b_, n, 3 * dim), DType::F64, &CpuDevice)?;
            let got = attn.forward(&qkv)?.to_f64_vec()?;
            let bias = attn.position_bias()?.to_f64_vec()?;
            let expected = direct_attention(&qkv.to_f64_vec()?, &bias, b_, n, dim, heads);
            assert_eq!(got.len(), expected.len());
            for (i, (g, e)) in got.iter().zip(&expected).enumerate() {
                assert!(approx_eq(*g, *e, 1e-9), "ws {ws}, index {i}: {g} vs {e}");
            }
        }
        Ok(())
    }

    #[test]
    fn test_rejects_small_windows() {
        assert!(WindowAttention::<CpuBackend>::new(8, 4, 2, DType::F64, &CpuDevice).is_err());
        assert!(WindowAttention::<CpuBackend>::new(6, 8, 4, DType::F64, &CpuDevice).is_err());
    }
}
