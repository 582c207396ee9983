// PixelShuffle — sub-pixel upsampling
//
//   [N, C·r², H, W] → [N, C, H·r, W·r]
//
// Channel `c·r² + i·r + j` lands at row offset `i`, column offset `j` of
// output channel `c`, matching torch.nn.PixelShuffle.

use msr_core::backend::Backend;
use msr_core::error::Result;
use msr_core::tensor::Tensor;

use crate::module::Module;

#[derive(Debug, Clone, Copy)]
pub struct PixelShuffle {
    upscale: usize,
}

impl PixelShuffle {
    pub fn new(upscale: usize) -> Self {
        PixelShuffle { upscale }
    }

    pub fn upscale(&self) -> usize {
        self.upscale
    }
}

impl<B: Backend> Module<B> for PixelShuffle {
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        x.pixel_shuffle(self.upscale)
    }
    fn parameters(&self) -> Vec<Tensor<B>> {
        vec![]
    }
}
