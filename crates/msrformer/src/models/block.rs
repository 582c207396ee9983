// TransformerBlock & BasicLayer
//
// A block is two residual branches:
//
//   x = x + mix(x)        mix = attention; with window attention the input
//                         is RLN-normalised and the output modulated by the
//                         norm's rescale / rebias
//   x = x + ffn(x)        optionally normalised the same way (`mlp_norm`)
//
// A BasicLayer is a stack of blocks at one resolution. Which blocks carry
// window attention follows `AttnLoc`; odd blocks shift their windows by ws/2.

use msr_core::{Backend, DType, Result, Tensor};
use msr_nn::module::prefixed;
use msr_nn::Module;
use tracing::debug_span;

use super::attention::{Attention, AttentionConfig};
use super::dffn::DFFN;
use super::norm::RLN;
use crate::config::{AttnLoc, ConvType};

#[derive(Debug, Clone, Copy)]
pub struct BlockConfig {
    pub network_depth: usize,
    pub dim: usize,
    pub num_heads: usize,
    pub mlp_ratio: f64,
    pub window_size: usize,
    pub shift_size: usize,
    pub use_attn: bool,
    pub conv_type: Option<ConvType>,
    pub mlp_norm: bool,
}

pub struct TransformerBlock<B: Backend> {
    norm1: Option<RLN<B>>,
    attn: Attention<B>,
    norm2: Option<RLN<B>>,
    ffn: DFFN<B>,
}

impl<B: Backend> TransformerBlock<B> {
    pub fn new(cfg: BlockConfig, dtype: DType, device: &B::Device) -> Result<Self> {
        let norm1 = if cfg.use_attn {
            Some(RLN::new(cfg.dim, dtype, device)?)
        } else {
            None
        };
        let norm2 = if cfg.use_attn && cfg.mlp_norm {
            Some(RLN::new(cfg.dim, dtype, device)?)
        } else {
            None
        };
        let attn = Attention::new(
            AttentionConfig {
                network_depth: cfg.network_depth,
                dim: cfg.dim,
                num_heads: cfg.num_heads,
                window_size: cfg.window_size,
                shift_size: cfg.shift_size,
                use_attn: cfg.use_attn,
                conv_type: cfg.conv_type,
            },
            dtype,
            device,
        )?;
        let hidden = (cfg.dim as f64 * cfg.mlp_ratio) as usize;
        let ffn = DFFN::new(cfg.network_depth, cfg.dim, hidden, cfg.dim, dtype, device)?;
        Ok(TransformerBlock {
            norm1,
            attn,
            norm2,
            ffn,
        })
    }

    pub fn use_attn(&self) -> bool {
        self.attn.use_attn()
    }

    pub fn shift_size(&self) -> usize {
        self.attn.shift_size()
    }
}

/// `branch(x)`, or `branch(norm(x)) · rescale + rebias` when normalised.
fn modulated<B: Backend>(
    norm: Option<&RLN<B>>,
    branch: &dyn Module<B>,
    x: &Tensor<B>,
) -> Result<Tensor<B>> {
    match norm {
        Some(norm) => {
            let n = norm.norm(x)?;
            branch
                .forward(&n.normalized)?
                .mul(&n.rescale)?
                .add(&n.rebias)
        }
        None => branch.forward(x),
    }
}

impl<B: Backend> Module<B> for TransformerBlock<B> {
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let x = x.add(&modulated(self.norm1.as_ref(), &self.attn, x)?)?;
        x.add(&modulated(self.norm2.as_ref(), &self.ffn, &x)?)
    }

    fn parameters(&self) -> Vec<Tensor<B>> {
        self.named_parameters().into_iter().map(|(_, p)| p).collect()
    }

    fn named_parameters(&self) -> Vec<(String, Tensor<B>)> {
        let mut named = Vec::new();
        if let Some(n) = &self.norm1 {
            named.extend(prefixed("norm1", n.named_parameters()));
        }
        named.extend(prefixed("attn", self.attn.named_parameters()));
        if let Some(n) = &self.norm2 {
            named.extend(prefixed("norm2", n.named_parameters()));
        }
        named.extend(prefixed("ffn", self.ffn.named_parameters()));
        named
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LayerConfig {
    pub network_depth: usize,
    pub dim: usize,
    pub depth: usize,
    pub num_heads: usize,
    pub mlp_ratio: f64,
    pub window_size: usize,
    pub attn_ratio: f64,
    pub attn_loc: AttnLoc,
    pub conv_type: Option<ConvType>,
    pub mlp_norm: bool,
}

pub struct BasicLayer<B: Backend> {
    dim: usize,
    blocks: Vec<TransformerBlock<B>>,
}

impl<B: Backend> BasicLayer<B> {
    pub fn new(cfg: LayerConfig, dtype: DType, device: &B::Device) -> Result<Self> {
        let blocks = cfg
            .attn_loc
            .flags(cfg.depth, cfg.attn_ratio)
            .into_iter()
            .enumerate()
            .map(|(i, use_attn)| {
                TransformerBlock::new(
                    BlockConfig {
                        network_depth: cfg.network_depth,
                        dim: cfg.dim,
                        num_heads: cfg.num_heads,
                        mlp_ratio: cfg.mlp_ratio,
                        window_size: cfg.window_size,
                        shift_size: if i % 2 == 0 { 0 } else { cfg.window_size / 2 },
                        use_attn,
                        conv_type: cfg.conv_type,
                        mlp_norm: cfg.mlp_norm,
                    },
                    dtype,
                    device,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(BasicLayer {
            dim: cfg.dim,
            blocks,
        })
    }

    pub fn blocks(&self) -> &[TransformerBlock<B>] {
        &self.blocks
    }
}

impl<B: Backend> Module<B> for BasicLayer<B> {
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let _span = debug_span!("basic_layer", dim = self.dim, depth = self.blocks.len()).entered();
        let mut x = x.clone();
        for blk in &self.blocks {
            x = blk.forward(&x)?;
        }
        Ok(x)
    }

    fn parameters(&self) -> Vec<Tensor<B>> {
        self.blocks.iter().flat_map(|b| b.parameters()).collect()
    }

    fn named_parameters(&self) -> Vec<(String, Tensor<B>)> {
        self.blocks
            .iter()
            .enumerate()
            .flat_map(|(i, b)| prefixed(&format!("blocks.{i}"), b.named_parameters()))
            .collect()
    }
}
