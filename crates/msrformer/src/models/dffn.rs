// DFFN — frequency-domain feed-forward network
//
//   x  → project_in (1×1, in → 2h)
//      → 8×8 patches → rfft2 → · gate → irfft2 → un-patch
//      → depthwise 3×3 → split (x1, x2) → gelu(x1) · x2
//      → project_out (1×1, h → out)
//
// The gate is a learned real filter per channel over the half spectrum of
// an 8×8 patch, starting at 1 (identity). Inputs whose sides are not
// multiples of 8 are reflect-padded before patching and cropped back
// afterwards.

use msr_core::{Backend, DType, Result, Tensor};
use msr_nn::{init, Conv2d, Module};
use tracing::trace;

use super::init_scaled;
use crate::config::SPECTRAL_PATCH;

const P: usize = SPECTRAL_PATCH;

pub struct DFFN<B: Backend> {
    project_in: Conv2d<B>,
    dwconv: Conv2d<B>,
    /// `[2h, 1, 1, P, P/2 + 1]`
    fft: Tensor<B>,
    project_out: Conv2d<B>,
    hidden: usize,
}

impl<B: Backend> DFFN<B> {
    /// `network_depth` is the total block count of the network; it scales
    /// the init of every convolution by `(8·depth)^(-1/4)`.
    pub fn new(
        network_depth: usize,
        in_features: usize,
        hidden_features: usize,
        out_features: usize,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let h2 = hidden_features * 2;
        let project_in =
            Conv2d::new(in_features, h2, [1, 1], [1, 1], [0, 0], false, dtype, device)?;
        let dwconv = Conv2d::grouped(h2, h2, [3, 3], [1, 1], [1, 1], h2, false, dtype, device)?;
        let project_out = Conv2d::new(
            hidden_features,
            out_features,
            [1, 1],
            [1, 1],
            [0, 0],
            false,
            dtype,
            device,
        )?;
        let gain = super::depth_gain(network_depth);
        for conv in [&project_in, &dwconv, &project_out] {
            init_scaled(conv, gain)?;
        }
        Ok(DFFN {
            project_in,
            dwconv,
            fft: init::ones::<B>((h2, 1, 1, P, P / 2 + 1), dtype, device)?,
            project_out,
            hidden: hidden_features,
        })
    }

    pub fn hidden_features(&self) -> usize {
        self.hidden
    }

    pub fn gate(&self) -> &Tensor<B> {
        &self.fft
    }

    /// Filter every 8×8 patch of `x` `[B, C, H, W]` (H, W multiples of 8)
    /// by the spectral gate.
    fn spectral_filter(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let d = x.dims().to_vec();
        let (b, c, h, w) = (d[0], d[1], d[2], d[3]);
        let patches = x
            .reshape(vec![b, c, h / P, P, w / P, P])?
            .permute(&[0, 1, 2, 4, 3, 5])?;
        let spectrum = patches.rfft2()?.mul(&self.fft.unsqueeze(5)?)?;
        spectrum
            .irfft2(P)?
            .permute(&[0, 1, 2, 4, 3, 5])?
            .reshape((b, c, h, w))
    }
}

impl<B: Backend> Module<B> for DFFN<B> {
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let (h, w) = (x.dim(2)?, x.dim(3)?);
        let pad_h = (P - h % P) % P;
        let pad_w = (P - w % P) % P;

        let mut y = self.project_in.forward(x)?;
        if pad_h > 0 || pad_w > 0 {
            trace!(h, w, pad_h, pad_w, "dffn: padding to whole spectral patches");
            y = y.pad_reflect([0, pad_w, 0, pad_h])?;
        }
        y = self.spectral_filter(&y)?;
        if pad_h > 0 || pad_w > 0 {
            y = y.narrow(2, 0, h)?.narrow(3, 0, w)?;
        }

        let halves = self.dwconv.forward(&y)?.chunk(2, 1)?;
        let gated = halves[0].gelu()?.mul(&halves[1])?;
        self.project_out.forward(&gated)
    }

    fn parameters(&self) -> Vec<Tensor<B>> {
        let mut p = self.project_in.parameters();
        p.extend(self.dwconv.parameters());
        p.push(self.fft.clone());
        p.extend(self.project_out.parameters());
        p
    }

    fn named_parameters(&self) -> Vec<(String, Tensor<B>)> {
        use msr_nn::module::prefixed;
        let mut p = prefixed("project_in", self.project_in.named_parameters());
        p.extend(prefixed("dwconv", self.dwconv.named_parameters()));
        p.push(("fft".to_string(), self.fft.clone()));
        p.extend(prefixed("project_out", self.project_out.named_parameters()));
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msr_cpu::{CpuBackend, CpuDevice};

    type T = Tensor<CpuBackend>;

    fn assert_vec_approx(a: &[f64], b: &[f64], tol: f64) {
        assert_eq!(a.len(), b.len());
        for (i, (x, y)) in a.iter().zip(b).enumerate() {
            assert!((x - y).abs() < tol, "index {i}: {x} vs {y}");
        }
    }

    /// The same network with the spectral stage removed.
    fn without_spectrum(ffn: &DFFN<CpuBackend>, x: &T) -> Result<T> {
        let y = ffn.project_in.forward(x)?;
        let halves = ffn.dwconv.forward(&y)?.chunk(2, 1)?;
        ffn.project_out
            .forward(&halves[0].gelu()?.mul(&halves[1])?)
    }

    #[test]
    fn test_unit_gate_is_identity() -> Result<()> {
        let dev = CpuDevice;
        let ffn = DFFN::<CpuBackend>::new(4, 4, 6, 4, DType::F64, &dev)?;
        let x = T::randn((2, 4, 16, 8), DType::F64, &dev)?;
        let y = ffn.forward(&x)?;
        assert_eq!(y.dims(), &[2, 4, 16, 8]);
        assert_vec_approx(
            &y.to_f64_vec()?,
            &without_spectrum(&ffn, &x)?.to_f64_vec()?,
            1e-10,
        );
        Ok(())
    }

    #[test]
    fn test_unaligned_input_is_padded_and_cropped() -> Result<()> {
        let dev = CpuDevice;
        let ffn = DFFN::<CpuBackend>::new(4, 3, 4, 5, DType::F64, &dev)?;
        let x = T::randn((1, 3, 12, 10), DType::F64, &dev)?;
        let y = ffn.forward(&x)?;
        assert_eq!(y.dims(), &[1, 5, 12, 10]);
        // identity gate: padding must not leak into the cropped result
        assert_vec_approx(
            &y.to_f64_vec()?,
            &without_spectrum(&ffn, &x)?.to_f64_vec()?,
            1e-10,
        );
        Ok(())
    }

    #[test]
    fn test_dc_only_gate_averages_patches() -> Result<()> {
        let dev = CpuDevice;
        let ffn = DFFN::<CpuBackend>::new(1, 1, 1, 1, DType::F64, &dev)?;
        // keep only the (0, 0) frequency: every patch becomes its mean
        let mut gate = vec![0.0; 2 * P * (P / 2 + 1)];
        for ch in 0..2 {
            gate[ch * P * (P / 2 + 1)] = 1.0;
        }
        ffn.gate().update_data_inplace(&gate)?;
        let x = T::randn((1, 2, 8, 16), DType::F64, &dev)?;
        let y = ffn.spectral_filter(&x)?.to_f64_vec()?;
        let xv = x.to_f64_vec()?;
        for ch in 0..2 {
            for pw in 0..2 {
                let mut mean = 0.0;
                for r in 0..8 {
                    for c in 0..8 {
                        mean += xv[ch * 128 + r * 16 + pw * 8 + c];
                    }
                }
                mean /= 64.0;
                for r in 0..8 {
                    for c in 0..8 {
                        let got = y[ch * 128 + r * 16 + pw * 8 + c];
                        assert!((got - mean).abs() < 1e-10);
                    }
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_gate_receives_gradient() -> Result<()> {
        let dev = CpuDevice;
        let ffn = DFFN::<CpuBackend>::new(2, 2, 2, 2, DType::F64, &dev)?;
        let x = T::randn((1, 2, 8, 8), DType::F64, &dev)?;
        let grads = ffn.forward(&x)?.square()?.mean_all()?.backward()?;
        for (name, p) in ffn.named_parameters() {
            let g = grads.get(&p);
            assert!(g.is_some(), "no gradient for {name}");
        }
        Ok(())
    }
}
