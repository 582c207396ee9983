//! The building blocks of the network, bottom-up:
//!
//! - [`diff_conv`] — differential convolutions (central, angular, radial,
//!   horizontal, vertical) that fold into plain 3×3 kernels
//! - [`deconv`] — `DEConv`, the five branches merged into one kernel, and
//!   the residual `DEBlock` around it
//! - [`norm`] — `RLN`, layer norm that also predicts a rescale / rebias
//! - [`dffn`] — feed-forward network gated in the frequency domain
//! - [`window`] — window partition / reverse and windowed self-attention
//!   with a learned relative position bias
//! - [`attention`] — the token mixer combining window attention,
//!   convolution and the DEBlock
//! - [`block`] — `TransformerBlock` and the per-stage `BasicLayer`
//! - [`patch`] — strided patch embedding and pixel-shuffle un-embedding
//! - [`fusion`] — `CGAFusion`, the content-guided skip fusion
//! - [`msrformer`] — the full U-shaped network

use msr_core::{Backend, Result};
use msr_nn::{init, Conv2d};

pub mod attention;
pub mod block;
pub mod deconv;
pub mod dffn;
pub mod diff_conv;
pub mod fusion;
pub mod msrformer;
pub mod norm;
pub mod patch;
pub mod window;

pub use attention::{Attention, AttentionConfig};
pub use block::{BasicLayer, BlockConfig, LayerConfig, TransformerBlock};
pub use deconv::{DEBlock, DEConv};
pub use dffn::DFFN;
pub use diff_conv::{Conv2dAd, Conv2dCd, Conv2dHd, Conv2dRd, Conv2dVd};
pub use fusion::{CGAFusion, ChannelAttention, PixelAttention, SpatialAttention};
pub use msrformer::MsrFormer;
pub use norm::{RlnOutput, RLN};
pub use patch::{PatchEmbed, PatchUnEmbed};
pub use window::{get_relative_positions, window_partition, window_reverse, WindowAttention};

/// Init gain for convolutions inside a network of `network_depth` blocks.
pub(crate) fn depth_gain(network_depth: usize) -> f64 {
    (8.0 * network_depth as f64).powf(-0.25)
}

/// `trunc_normal(std = gain · sqrt(2 / (fan_in + fan_out)))` on the weight,
/// zero bias.
pub(crate) fn init_scaled<B: Backend>(conv: &Conv2d<B>, gain: f64) -> Result<()> {
    let (fan_in, fan_out) = init::compute_fans(conv.weight().shape());
    let std = gain * (2.0 / (fan_in + fan_out)).sqrt();
    init::trunc_normal_(conv.weight(), 0.0, std)?;
    if let Some(b) = conv.bias() {
        init::constant_(b, 0.0)?;
    }
    Ok(())
}
