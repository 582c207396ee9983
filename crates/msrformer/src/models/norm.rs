// RLN — revised layer normalisation
//
// Normalises each sample over (C, H, W) and, besides the normalised tensor,
// returns a per-channel rescale and rebias computed from the statistics it
// removed:
//
//   mean, std = stats(x)               std = sqrt(var + eps)
//   out       = (x - mean) / std · weight + bias
//   rescale   = meta1(std)             1×1 conv 1 → C, starts near 1
//   rebias    = meta2(mean)            1×1 conv 1 → C, starts near 0
//
// A block applies `rescale`/`rebias` to its branch output so the branch can
// restore the scale the normalisation took away.

use msr_core::{Backend, DType, Result, Tensor};
use msr_nn::module::prefixed;
use msr_nn::{init, Conv2d, Module};

pub const RLN_EPS: f64 = 1e-5;

/// Normalised output plus the statistic-driven modulation.
pub struct RlnOutput<B: Backend> {
    pub normalized: Tensor<B>,
    /// `[B, C, 1, 1]`
    pub rescale: Tensor<B>,
    /// `[B, C, 1, 1]`
    pub rebias: Tensor<B>,
}

pub struct RLN<B: Backend> {
    /// `[1, C, 1, 1]`, starts at 1
    weight: Tensor<B>,
    /// `[1, C, 1, 1]`, starts at 0
    bias: Tensor<B>,
    meta1: Conv2d<B>,
    meta2: Conv2d<B>,
    eps: f64,
    detach_grad: bool,
}

impl<B: Backend> RLN<B> {
    pub fn new(dim: usize, dtype: DType, device: &B::Device) -> Result<Self> {
        let meta = || Conv2d::<B>::new(1, dim, [1, 1], [1, 1], [0, 0], true, dtype, device);
        let (meta1, meta2) = (meta()?, meta()?);
        init::trunc_normal_(meta1.weight(), 0.0, 0.02)?;
        init::trunc_normal_(meta2.weight(), 0.0, 0.02)?;
        if let Some(b) = meta1.bias() {
            init::constant_(b, 1.0)?;
        }
        if let Some(b) = meta2.bias() {
            init::constant_(b, 0.0)?;
        }
        Ok(RLN {
            weight: init::ones::<B>((1, dim, 1, 1), dtype, device)?,
            bias: init::zeros::<B>((1, dim, 1, 1), dtype, device)?,
            meta1,
            meta2,
            eps: RLN_EPS,
            detach_grad: false,
        })
    }

    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    /// Stop gradients from flowing into the statistics through the meta convs.
    pub fn with_detach_grad(mut self, detach_grad: bool) -> Self {
        self.detach_grad = detach_grad;
        self
    }

    pub fn meta_convs(&self) -> (&Conv2d<B>, &Conv2d<B>) {
        (&self.meta1, &self.meta2)
    }

    /// Normalise `x` `[B, C, H, W]` and derive rescale / rebias.
    pub fn norm(&self, x: &Tensor<B>) -> Result<RlnOutput<B>> {
        let mean = x.mean_dims(&[1, 2, 3], true)?;
        let centered = x.sub(&mean)?;
        let std = centered
            .square()?
            .mean_dims(&[1, 2, 3], true)?
            .affine(1.0, self.eps)?
            .sqrt()?;
        let normalized = centered
            .div(&std)?
            .mul(&self.weight)?
            .add(&self.bias)?;

        let (std, mean) = if self.detach_grad {
            (std.detach(), mean.detach())
        } else {
            (std, mean)
        };
        Ok(RlnOutput {
            normalized,
            rescale: self.meta1.forward(&std)?,
            rebias: self.meta2.forward(&mean)?,
        })
    }
}

impl<B: Backend> Module<B> for RLN<B> {
    /// The normalised tensor alone; use [`RLN::norm`] for the modulation.
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        Ok(self.norm(x)?.normalized)
    }

    fn parameters(&self) -> Vec<Tensor<B>> {
        let mut p = vec![self.weight.clone(), self.bias.clone()];
        p.extend(self.meta1.parameters());
        p.extend(self.meta2.parameters());
        p
    }

    fn named_parameters(&self) -> Vec<(String, Tensor<B>)> {
        let mut p = vec![
            ("weight".to_string(), self.weight.clone()),
            ("bias".to_string(), self.bias.clone()),
        ];
        p.extend(prefixed("meta1", self.meta1.named_parameters()));
        p.extend(prefixed("meta2", self.meta2.named_parameters()));
        p
    }
}
