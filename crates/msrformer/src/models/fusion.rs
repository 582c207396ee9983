// CGAFusion — content-guided gated fusion of a skip connection
//
// The decoder feature `x` and the encoder skip `y` are blended per pixel
// and per channel:
//
//   initial = x + y
//   pattn1  = SpatialAttention(initial) + ChannelAttention(initial)
//                 [B, 1, H, W]            [B, C, 1, 1]       broadcast
//   pattn2  = sigmoid(PixelAttention(initial, pattn1))
//   out     = conv1x1(initial + pattn2 · x + (1 − pattn2) · y)
//
// PixelAttention already ends in a sigmoid, so the gate is squashed twice.
// Trained weights depend on that; it is kept.

use msr_core::{Backend, DType, Result, Tensor};
use msr_nn::module::prefixed;
use msr_nn::{Conv2d, Module, PaddingMode};

fn reflect_conv<B: Backend>(
    in_ch: usize,
    out_ch: usize,
    kernel: usize,
    groups: usize,
    dtype: DType,
    device: &B::Device,
) -> Result<Conv2d<B>> {
    let pad = kernel / 2;
    Ok(Conv2d::grouped(
        in_ch,
        out_ch,
        [kernel, kernel],
        [1, 1],
        [pad, pad],
        groups,
        true,
        dtype,
        device,
    )?
    .with_padding_mode(PaddingMode::Reflect))
}

/// Channel mean and max, stacked and squeezed to one map by a 7×7 conv.
pub struct SpatialAttention<B: Backend> {
    sa: Conv2d<B>,
}

impl<B: Backend> SpatialAttention<B> {
    pub fn new(dtype: DType, device: &B::Device) -> Result<Self> {
        Ok(SpatialAttention {
            sa: reflect_conv(2, 1, 7, 1, dtype, device)?,
        })
    }
}

impl<B: Backend> Module<B> for SpatialAttention<B> {
    /// `[B, C, H, W]` → `[B, 1, H, W]`
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let avg = x.mean(1, true)?;
        let max = x.max(1, true)?;
        self.sa.forward(&Tensor::cat(&[avg, max], 1)?)
    }

    fn parameters(&self) -> Vec<Tensor<B>> {
        self.sa.parameters()
    }

    fn named_parameters(&self) -> Vec<(String, Tensor<B>)> {
        prefixed("sa", self.sa.named_parameters())
    }
}

/// Squeeze-and-excitation without the final sigmoid.
pub struct ChannelAttention<B: Backend> {
    squeeze: Conv2d<B>,
    excite: Conv2d<B>,
}

impl<B: Backend> ChannelAttention<B> {
    pub fn new(dim: usize, reduction: usize, dtype: DType, device: &B::Device) -> Result<Self> {
        let hidden = dim / reduction;
        Ok(ChannelAttention {
            squeeze: Conv2d::new(dim, hidden, [1, 1], [1, 1], [0, 0], true, dtype, device)?,
            excite: Conv2d::new(hidden, dim, [1, 1], [1, 1], [0, 0], true, dtype, device)?,
        })
    }
}

impl<B: Backend> Module<B> for ChannelAttention<B> {
    /// `[B, C, H, W]` → `[B, C, 1, 1]`
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let gap = x.mean_dims(&[2, 3], true)?;
        self.excite.forward(&self.squeeze.forward(&gap)?.relu()?)
    }

    fn parameters(&self) -> Vec<Tensor<B>> {
        let mut params = self.squeeze.parameters();
        params.extend(self.excite.parameters());
        params
    }

    fn named_parameters(&self) -> Vec<(String, Tensor<B>)> {
        let mut named = prefixed("ca.0", self.squeeze.named_parameters());
        named.extend(prefixed("ca.2", self.excite.named_parameters()));
        named
    }
}

/// Per-pixel, per-channel gate from a feature map and a coarse attention map.
pub struct PixelAttention<B: Backend> {
    pa2: Conv2d<B>,
}

impl<B: Backend> PixelAttention<B> {
    pub fn new(dim: usize, dtype: DType, device: &B::Device) -> Result<Self> {
        Ok(PixelAttention {
            pa2: reflect_conv(2 * dim, dim, 7, dim, dtype, device)?,
        })
    }

    /// Channels of `x` and `pattn1` are interleaved (`x₀, p₀, x₁, p₁, …`) so
    /// each group of the 7×7 conv sees one feature channel and its gate.
    pub fn forward(&self, x: &Tensor<B>, pattn1: &Tensor<B>) -> Result<Tensor<B>> {
        let (b, c, h, w) = (x.dim(0)?, x.dim(1)?, x.dim(2)?, x.dim(3)?);
        let pattn1 = pattn1.expand((b, c, h, w))?;
        let interleaved = Tensor::stack(&[x.clone(), pattn1], 2)?.reshape((b, 2 * c, h, w))?;
        self.pa2.forward(&interleaved)?.sigmoid()
    }

    pub fn parameters(&self) -> Vec<Tensor<B>> {
        self.pa2.parameters()
    }

    pub fn named_parameters(&self) -> Vec<(String, Tensor<B>)> {
        prefixed("pa2", self.pa2.named_parameters())
    }
}

pub struct CGAFusion<B: Backend> {
    sa: SpatialAttention<B>,
    ca: ChannelAttention<B>,
    pa: PixelAttention<B>,
    conv: Conv2d<B>,
}

impl<B: Backend> CGAFusion<B> {
    pub fn new(dim: usize, reduction: usize, dtype: DType, device: &B::Device) -> Result<Self> {
        Ok(CGAFusion {
            sa: SpatialAttention::new(dtype, device)?,
            ca: ChannelAttention::new(dim, reduction, dtype, device)?,
            pa: PixelAttention::new(dim, dtype, device)?,
            conv: Conv2d::new(dim, dim, [1, 1], [1, 1], [0, 0], true, dtype, device)?,
        })
    }

    /// Fuse decoder feature `x` with skip `y`; both `[B, C, H, W]`.
    pub fn forward(&self, x: &Tensor<B>, y: &Tensor<B>) -> Result<Tensor<B>> {
        let initial = x.add(y)?;
        let pattn1 = self.sa.forward(&initial)?.add(&self.ca.forward(&initial)?)?;
        let pattn2 = self.pa.forward(&initial, &pattn1)?.sigmoid()?;
        let gated_x = pattn2.mul(x)?;
        let gated_y = pattn2.affine(-1.0, 1.0)?.mul(y)?;
        self.conv
            .forward(&initial.add(&gated_x)?.add(&gated_y)?)
    }

    pub fn parameters(&self) -> Vec<Tensor<B>> {
        self.named_parameters().into_iter().map(|(_, p)| p).collect()
    }

    pub fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.elem_count()).sum()
    }

    pub fn named_parameters(&self) -> Vec<(String, Tensor<B>)> {
        let mut named = prefixed("sa", self.sa.named_parameters());
        named.extend(prefixed("ca", self.ca.named_parameters()));
        named.extend(prefixed("pa", self.pa.named_parameters()));
        named.extend(prefixed("conv", self.conv.named_parameters()));
        named
    }
}
