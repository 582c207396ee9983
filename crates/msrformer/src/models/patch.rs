// PatchEmbed & PatchUnEmbed — resolution changes between stages
//
//   PatchEmbed    conv, stride = patch, kernel defaults to patch
//                 [B, in, H, W] → [B, embed, H/patch, W/patch]
//   PatchUnEmbed  conv embed → out·patch², then PixelShuffle(patch)
//                 [B, embed, H, W] → [B, out, H·patch, W·patch]
//
// Both convolutions reflect-pad and keep the default uniform init.

use msr_core::{Backend, DType, Result, Tensor};
use msr_nn::module::prefixed;
use msr_nn::{Conv2d, Module, PaddingMode, PixelShuffle};

pub struct PatchEmbed<B: Backend> {
    patch_size: usize,
    proj: Conv2d<B>,
}

impl<B: Backend> PatchEmbed<B> {
    /// `kernel_size: None` uses `patch_size`.
    pub fn new(
        patch_size: usize,
        in_chans: usize,
        embed_dim: usize,
        kernel_size: Option<usize>,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let k = kernel_size.unwrap_or(patch_size);
        let pad = (k + 1 - patch_size) / 2;
        let proj = Conv2d::new(
            in_chans,
            embed_dim,
            [k, k],
            [patch_size, patch_size],
            [pad, pad],
            true,
            dtype,
            device,
        )?
        .with_padding_mode(PaddingMode::Reflect);
        Ok(PatchEmbed { patch_size, proj })
    }

    pub fn patch_size(&self) -> usize {
        self.patch_size
    }
}

impl<B: Backend> Module<B> for PatchEmbed<B> {
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        self.proj.forward(x)
    }

    fn parameters(&self) -> Vec<Tensor<B>> {
        self.proj.parameters()
    }

    fn named_parameters(&self) -> Vec<(String, Tensor<B>)> {
        prefixed("proj", self.proj.named_parameters())
    }
}

pub struct PatchUnEmbed<B: Backend> {
    proj: Conv2d<B>,
    shuffle: PixelShuffle,
}

impl<B: Backend> PatchUnEmbed<B> {
    /// `kernel_size: None` means a 1×1 projection.
    pub fn new(
        patch_size: usize,
        out_chans: usize,
        embed_dim: usize,
        kernel_size: Option<usize>,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let k = kernel_size.unwrap_or(1);
        let proj = Conv2d::new(
            embed_dim,
            out_chans * patch_size * patch_size,
            [k, k],
            [1, 1],
            [k / 2, k / 2],
            true,
            dtype,
            device,
        )?
        .with_padding_mode(PaddingMode::Reflect);
        Ok(PatchUnEmbed {
            proj,
            shuffle: PixelShuffle::new(patch_size),
        })
    }

    pub fn patch_size(&self) -> usize {
        self.shuffle.upscale()
    }
}

impl<B: Backend> Module<B> for PatchUnEmbed<B> {
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        self.shuffle.forward(&self.proj.forward(x)?)
    }

    fn parameters(&self) -> Vec<Tensor<B>> {
        self.proj.parameters()
    }

    fn named_parameters(&self) -> Vec<(String, Tensor<B>)> {
        prefixed("proj", self.proj.named_parameters())
    }
}
