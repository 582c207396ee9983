// MsrFormer — the full restoration network
//
// A three-level U-shape over `BasicLayer` stages:
//
//   patch_embed (3×3)  → layer1 ───────────────────────────── skip1 ──┐
//   patch_merge1 (/2)  → layer2 ─────────────────── skip2 ──┐         │
//   patch_merge2 (/2)  → layer3                             │         │
//   patch_split1 (×2)  → fusion1(·, skip2) + · → layer4 ←───┘         │
//   patch_split2 (×2)  → fusion2(·, skip1) + · → layer5 ←─────────────┘
//   patch_unembed (3×3) → [B, in + 1, H, W]
//
// The head predicts a gain map K (one channel) and an offset B per image
// channel; the restored image is `K·x − B + x`. Inputs are reflect-padded
// to a multiple of 4 (two halvings) and the output cropped back.

use msr_core::{Backend, DType, Result, Tensor};
use msr_nn::module::prefixed;
use msr_nn::{Conv2d, Module};
use tracing::{debug, debug_span, info};

use super::block::{BasicLayer, LayerConfig};
use super::fusion::CGAFusion;
use super::patch::{PatchEmbed, PatchUnEmbed};
use crate::config::MsrFormerConfig;

/// Channel reduction of the fusion gates' channel branch.
const FUSION_REDUCTION: usize = 8;

/// Total downsampling factor of the encoder.
const PAD_MULTIPLE: usize = 4;

pub struct MsrFormer<B: Backend> {
    in_chans: usize,
    patch_embed: PatchEmbed<B>,
    layer1: BasicLayer<B>,
    skip1: Conv2d<B>,
    patch_merge1: PatchEmbed<B>,
    layer2: BasicLayer<B>,
    skip2: Conv2d<B>,
    patch_merge2: PatchEmbed<B>,
    layer3: BasicLayer<B>,
    patch_split1: PatchUnEmbed<B>,
    fusion1: CGAFusion<B>,
    layer4: BasicLayer<B>,
    patch_split2: PatchUnEmbed<B>,
    fusion2: CGAFusion<B>,
    layer5: BasicLayer<B>,
    patch_unembed: PatchUnEmbed<B>,
}

impl<B: Backend> MsrFormer<B> {
    /// Build the network described by `cfg`, which is validated first.
    pub fn new(cfg: &MsrFormerConfig, dtype: DType, device: &B::Device) -> Result<Self> {
        cfg.validate()?;
        let e = cfg.embed_dims;
        let network_depth = cfg.network_depth();
        let layer = |stage: usize| {
            BasicLayer::<B>::new(
                LayerConfig {
                    network_depth,
                    dim: e[stage],
                    depth: cfg.depths[stage],
                    num_heads: cfg.num_heads[stage],
                    mlp_ratio: cfg.mlp_ratios[stage],
                    window_size: cfg.window_size,
                    attn_ratio: cfg.attn_ratio[stage],
                    attn_loc: cfg.attn_loc,
                    conv_type: cfg.conv_type[stage],
                    mlp_norm: cfg.mlp_norm,
                },
                dtype,
                device,
            )
        };
        let skip =
            |dim: usize| Conv2d::<B>::new(dim, dim, [1, 1], [1, 1], [0, 0], true, dtype, device);

        let model = MsrFormer {
            in_chans: cfg.in_chans,
            patch_embed: PatchEmbed::new(1, cfg.in_chans, e[0], Some(3), dtype, device)?,
            layer1: layer(0)?,
            skip1: skip(e[0])?,
            patch_merge1: PatchEmbed::new(2, e[0], e[1], None, dtype, device)?,
            layer2: layer(1)?,
            skip2: skip(e[1])?,
            patch_merge2: PatchEmbed::new(2, e[1], e[2], None, dtype, device)?,
            layer3: layer(2)?,
            patch_split1: PatchUnEmbed::new(2, e[3], e[2], None, dtype, device)?,
            fusion1: CGAFusion::new(e[3], FUSION_REDUCTION, dtype, device)?,
            layer4: layer(3)?,
            patch_split2: PatchUnEmbed::new(2, e[4], e[3], None, dtype, device)?,
            fusion2: CGAFusion::new(e[4], FUSION_REDUCTION, dtype, device)?,
            layer5: layer(4)?,
            patch_unembed: PatchUnEmbed::new(1, cfg.out_chans, e[4], Some(3), dtype, device)?,
        };
        info!(
            parameters = model.num_parameters(),
            network_depth,
            embed_dims = ?e,
            "built MsrFormer"
        );
        Ok(model)
    }

    /// The encoder/decoder trunk: `[B, in, H, W]` → `[B, in + 1, H, W]`.
    /// `H` and `W` must be multiples of 4.
    pub fn forward_features(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let x = self.patch_embed.forward(x)?;
        let x = self.layer1.forward(&x)?;
        let skip1 = x.clone();

        let x = self.patch_merge1.forward(&x)?;
        let x = self.layer2.forward(&x)?;
        let skip2 = x.clone();

        let x = self.patch_merge2.forward(&x)?;
        let x = self.layer3.forward(&x)?;

        let x = self.patch_split1.forward(&x)?;
        let x = self.fusion1.forward(&x, &self.skip2.forward(&skip2)?)?.add(&x)?;
        let x = self.layer4.forward(&x)?;

        let x = self.patch_split2.forward(&x)?;
        let x = self.fusion2.forward(&x, &self.skip1.forward(&skip1)?)?.add(&x)?;
        let x = self.layer5.forward(&x)?;

        self.patch_unembed.forward(&x)
    }

    pub fn in_chans(&self) -> usize {
        self.in_chans
    }
}

impl<B: Backend> Module<B> for MsrFormer<B> {
    /// `[B, in, H, W]` → `[B, in, H, W]`.
    ///
    /// Every reflect pad on the way must be smaller than the side it pads.
    /// The shifted windows at quarter resolution pad `ws/2` on one side and
    /// up to `ws - 1` on the other, so with `ws = 8` that stage needs sides of
    /// at least 7, i.e. `H, W >= 25`; smaller inputs are an error.
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let (h, w) = (x.dim(2)?, x.dim(3)?);
        let _span = debug_span!("msrformer", h, w).entered();

        let mod_h = (PAD_MULTIPLE - h % PAD_MULTIPLE) % PAD_MULTIPLE;
        let mod_w = (PAD_MULTIPLE - w % PAD_MULTIPLE) % PAD_MULTIPLE;
        let padded = if mod_h > 0 || mod_w > 0 {
            debug!(mod_h, mod_w, "padding input");
            x.pad_reflect([0, mod_w, 0, mod_h])?
        } else {
            x.clone()
        };

        let feat = self.forward_features(&padded)?;
        let k = feat.narrow(1, 0, 1)?;
        let b = feat.narrow(1, 1, self.in_chans)?;
        k.mul(&padded)?
            .sub(&b)?
            .add(&padded)?
            .narrow(2, 0, h)?
            .narrow(3, 0, w)
    }

    fn parameters(&self) -> Vec<Tensor<B>> {
        self.named_parameters().into_iter().map(|(_, p)| p).collect()
    }

    fn named_parameters(&self) -> Vec<(String, Tensor<B>)> {
        let mut named = prefixed("patch_embed", self.patch_embed.named_parameters());
        named.extend(prefixed("layer1", self.layer1.named_parameters()));
        named.extend(prefixed("skip1", self.skip1.named_parameters()));
        named.extend(prefixed("patch_merge1", self.patch_merge1.named_parameters()));
        named.extend(prefixed("layer2", self.layer2.named_parameters()));
        named.extend(prefixed("skip2", self.skip2.named_parameters()));
        named.extend(prefixed("patch_merge2", self.patch_merge2.named_parameters()));
        named.extend(prefixed("layer3", self.layer3.named_parameters()));
        named.extend(prefixed("patch_split1", self.patch_split1.named_parameters()));
        named.extend(prefixed("fusion1", self.fusion1.named_parameters()));
        named.extend(prefixed("layer4", self.layer4.named_parameters()));
        named.extend(prefixed("patch_split2", self.patch_split2.named_parameters()));
        named.extend(prefixed("fusion2", self.fusion2.named_parameters()));
        named.extend(prefixed("layer5", self.layer5.named_parameters()));
        named.extend(prefixed("patch_unembed", self.patch_unembed.named_parameters()));
        named
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConvType, NUM_STAGES};
    use msr_cpu::{CpuBackend, CpuDevice};

    type T = Tensor<CpuBackend>;

    fn tiny() -> MsrFormerConfig {
        MsrFormerConfig::default()
            .with_embed_dims([8, 16, 16, 16, 8])
            .with_mlp_ratios([2.0; NUM_STAGES])
            .with_depths([2, 2, 2, 1, 1])
            .with_num_heads([2, 2, 2, 1, 1])
            .with_attn_ratio([0.5, 0.5, 0.5, 0.0, 0.0])
    }

    #[test]
    fn test_rejects_invalid_config() {
        let cfg = tiny().with_out_chans(3);
        assert!(MsrFormer::<CpuBackend>::new(&cfg, DType::F64, &CpuDevice).is_err());
    }

    #[test]
    fn test_features_have_head_channels() -> Result<()> {
        let dev = CpuDevice;
        let model = MsrFormer::<CpuBackend>::new(&tiny(), DType::F64, &dev)?;
        let x = T::randn((1, 3, 32, 32), DType::F64, &dev)?;
        assert_eq!(model.forward_features(&x)?.dims(), &[1, 4, 32, 32]);
        Ok(())
    }

    #[test]
    fn test_parameter_layout() -> Result<()> {
        let cfg = tiny().with_conv_type([Some(ConvType::Conv); NUM_STAGES]);
        let model = MsrFormer::<CpuBackend>::new(&cfg, DType::F64, &CpuDevice)?;
        let named = model.named_parameters();
        assert_eq!(named[0].0, "patch_embed.proj.weight");
        assert_eq!(named[0].1.dims(), &[8, 3, 3, 3]);
        let head = named
            .iter()
            .find(|(n, _)| n == "patch_unembed.proj.weight")
            .map(|(_, p)| p.dims().to_vec());
        assert_eq!(head, Some(vec![4, 8, 3, 3]));
        let split = named
            .iter()
            .find(|(n, _)| n == "patch_split1.proj.weight")
            .map(|(_, p)| p.dims().to_vec());
        assert_eq!(split, Some(vec![64, 16, 1, 1]));
        // one norm per attention block: layer1..3 each have one of two
        let norms = named
            .iter()
            .filter(|(n, _)| n.ends_with("norm1.weight"))
            .count();
        assert_eq!(norms, 3);
        assert_eq!(
            model.num_parameters(),
            named.iter().map(|(_, p)| p.elem_count()).sum::<usize>()
        );
        Ok(())
    }

    #[test]
    fn test_zero_head_is_identity() -> Result<()> {
        let dev = CpuDevice;
        let model = MsrFormer::<CpuBackend>::new(&tiny(), DType::F64, &dev)?;
        for p in model.patch_unembed.parameters() {
            p.update_data_inplace(&vec![0.0; p.elem_count()])?;
        }
        let x = T::randn((1, 3, 29, 30), DType::F64, &dev)?;
        let y = model.forward(&x)?;
        assert_eq!(y.dims(), &[1, 3, 29, 30]);
        let (xv, yv) = (x.to_f64_vec()?, y.to_f64_vec()?);
        for (a, b) in xv.iter().zip(&yv) {
            assert!((a - b).abs() < 1e-12);
        }
        Ok(())
    }
}
