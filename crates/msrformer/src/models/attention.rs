// Attention — the token mixer of a transformer block
//
// Two optional paths share one module:
//
//   window attention   QK (1×1, dim → 2·dim) and V (1×1) are concatenated,
//                      reflect-padded to whole windows (shifted by ws/2 on
//                      odd blocks), split into windows, attended, merged and
//                      cropped back
//   convolution        Conv   : 3×3 → ReLU → 3×3, reflect padded
//                      DWConv : 5×5 depthwise, reflect padded, applied to V
//
// With both, the paths are summed and refined by a DEBlock:
//
//   out = proj(conv(V) + attn)
//   out = proj2(out + deblock(proj3(out)))
//
// INIT:
//
//   QK gets trunc_normal(std = sqrt(2 / (fan_in + fan_out))); every other
//   2-D conv, the DEBlock's included, gets the same scaled by
//   (8 · network_depth)^(-1/4). Biases start at 0.

use msr_core::{bail, Backend, DType, Result, Tensor};
use msr_nn::module::prefixed;
use msr_nn::{Conv2d, Module, PaddingMode, ReLU, Sequential};
use tracing::trace;

use super::deconv::DEBlock;
use super::window::{window_partition, window_reverse, WindowAttention};
use super::{depth_gain, init_scaled};
use crate::config::ConvType;

/// Constructor arguments of [`Attention`].
#[derive(Debug, Clone, Copy)]
pub struct AttentionConfig {
    pub network_depth: usize,
    pub dim: usize,
    pub num_heads: usize,
    pub window_size: usize,
    pub shift_size: usize,
    pub use_attn: bool,
    pub conv_type: Option<ConvType>,
}

struct Projections<B: Backend> {
    v: Conv2d<B>,
    proj: Conv2d<B>,
    proj2: Conv2d<B>,
    proj3: Conv2d<B>,
}

struct WindowBranch<B: Backend> {
    qk: Conv2d<B>,
    attn: WindowAttention<B>,
}

pub struct Attention<B: Backend> {
    dim: usize,
    window_size: usize,
    shift_size: usize,
    conv_type: Option<ConvType>,
    deblock: DEBlock<B>,
    conv: Option<Sequential<B>>,
    projections: Option<Projections<B>>,
    window: Option<WindowBranch<B>>,
}

fn conv1x1<B: Backend>(
    in_ch: usize,
    out_ch: usize,
    dtype: DType,
    device: &B::Device,
) -> Result<Conv2d<B>> {
    Conv2d::new(in_ch, out_ch, [1, 1], [1, 1], [0, 0], true, dtype, device)
}

fn reflect_conv<B: Backend>(
    dim: usize,
    kernel: usize,
    groups: usize,
    dtype: DType,
    device: &B::Device,
) -> Result<Conv2d<B>> {
    let pad = kernel / 2;
    Ok(Conv2d::grouped(
        dim,
        dim,
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

impl<B: Backend> Attention<B> {
    pub fn new(cfg: AttentionConfig, dtype: DType, device: &B::Device) -> Result<Self> {
        let AttentionConfig {
            network_depth,
            dim,
            num_heads,
            window_size,
            shift_size,
            use_attn,
            conv_type,
        } = cfg;
        if !use_attn && conv_type.is_none() {
            bail!("attention block with neither window attention nor a convolution");
        }
        if use_attn && shift_size >= window_size {
            bail!("shift {shift_size} must be smaller than the window size {window_size}");
        }
        let gain = depth_gain(network_depth);

        let deblock = DEBlock::new(dim, 3, dtype, device)?;
        for conv in deblock.conv2d_layers() {
            init_scaled(conv, gain)?;
        }

        let conv = match conv_type {
            Some(ConvType::Conv) => {
                let (c1, c2) = (
                    reflect_conv(dim, 3, 1, dtype, device)?,
                    reflect_conv(dim, 3, 1, dtype, device)?,
                );
                init_scaled(&c1, gain)?;
                init_scaled(&c2, gain)?;
                Some(Sequential::new().add(c1).add(ReLU).add(c2))
            }
            Some(ConvType::DWConv) => {
                let dw = reflect_conv(dim, 5, dim, dtype, device)?;
                init_scaled(&dw, gain)?;
                Some(Sequential::new().add(dw))
            }
            None => None,
        };

        let projections = if use_attn || conv_type == Some(ConvType::DWConv) {
            let p = Projections {
                v: conv1x1(dim, dim, dtype, device)?,
                proj: conv1x1(dim, dim, dtype, device)?,
                proj2: conv1x1(dim, dim, dtype, device)?,
                proj3: Conv2d::new(dim, dim, [3, 3], [1, 1], [1, 1], true, dtype, device)?,
            };
            for c in [&p.v, &p.proj, &p.proj2, &p.proj3] {
                init_scaled(c, gain)?;
            }
            Some(p)
        } else {
            None
        };

        let window = if use_attn {
            let qk = conv1x1(dim, 2 * dim, dtype, device)?;
            init_scaled(&qk, 1.0)?;
            Some(WindowBranch {
                qk,
                attn: WindowAttention::new(dim, window_size, num_heads, dtype, device)?,
            })
        } else {
            None
        };

        Ok(Attention {
            dim,
            window_size,
            shift_size,
            conv_type,
            deblock,
            conv,
            projections,
            window,
        })
    }

    pub fn use_attn(&self) -> bool {
        self.window.is_some()
    }

    pub fn shift_size(&self) -> usize {
        self.shift_size
    }

    /// Reflect-pad `[B, C, H, W]` so both sides are whole windows; with a
    /// shift, `shift` extra rows/cols go on the top/left.
    fn check_size(&self, x: &Tensor<B>, shift: bool) -> Result<Tensor<B>> {
        let ws = self.window_size;
        let (h, w) = (x.dim(2)?, x.dim(3)?);
        let mod_h = (ws - h % ws) % ws;
        let mod_w = (ws - w % ws) % ws;
        let pad = if shift {
            let s = self.shift_size;
            [s, (ws - s + mod_w) % ws, s, (ws - s + mod_h) % ws]
        } else {
            [0, mod_w, 0, mod_h]
        };
        if pad.iter().all(|&p| p == 0) {
            return Ok(x.clone());
        }
        x.pad_reflect(pad)
    }

    fn window_attention(
        &self,
        branch: &WindowBranch<B>,
        x: &Tensor<B>,
        v: &Tensor<B>,
    ) -> Result<Tensor<B>> {
        let (h, w) = (x.dim(2)?, x.dim(3)?);
        let qkv = Tensor::cat(&[branch.qk.forward(x)?, v.clone()], 1)?;
        let shifted = self.check_size(&qkv, self.shift_size > 0)?;
        let (ht, wt) = (shifted.dim(2)?, shifted.dim(3)?);
        trace!(
            dim = self.dim,
            h,
            w,
            ht,
            wt,
            shift = self.shift_size,
            "window attention"
        );

        let windows = window_partition(&shifted.permute(&[0, 2, 3, 1])?, self.window_size)?;
        let attended = branch.attn.forward(&windows)?;
        window_reverse(&attended, self.window_size, ht, wt)?
            .narrow(1, self.shift_size, h)?
            .narrow(2, self.shift_size, w)?
            .permute(&[0, 3, 1, 2])
    }
}

impl<B: Backend> Module<B> for Attention<B> {
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        match (&self.window, &self.projections, &self.conv) {
            (Some(branch), Some(p), conv) => {
                let v = p.v.forward(x)?;
                let attn_out = self.window_attention(branch, x, &v)?;
                match conv {
                    Some(conv) => {
                        let out = p.proj.forward(&conv.forward(&v)?.add(&attn_out)?)?;
                        let deb = self.deblock.forward(&p.proj3.forward(&out)?)?;
                        p.proj2.forward(&out.add(&deb)?)
                    }
                    None => p.proj.forward(&attn_out),
                }
            }
            (None, _, Some(conv)) => match (self.conv_type, &self.projections) {
                (Some(ConvType::DWConv), Some(p)) => p.proj.forward(&conv.forward(&p.v.forward(x)?)?),
                _ => conv.forward(x),
            },
            _ => bail!("attention block has no token mixer"),
        }
    }

    fn parameters(&self) -> Vec<Tensor<B>> {
        self.named_parameters().into_iter().map(|(_, p)| p).collect()
    }

    fn named_parameters(&self) -> Vec<(String, Tensor<B>)> {
        let mut named = prefixed("deblock", self.deblock.named_parameters());
        if let Some(conv) = &self.conv {
            named.extend(prefixed("conv", conv.named_parameters()));
        }
        if let Some(p) = &self.projections {
            named.extend(prefixed("v", p.v.named_parameters()));
            named.extend(prefixed("proj", p.proj.named_parameters()));
            named.extend(prefixed("proj2", p.proj2.named_parameters()));
            named.extend(prefixed("proj3", p.proj3.named_parameters()));
        }
        if let Some(branch) = &self.window {
            named.extend(prefixed("qk", branch.qk.named_parameters()));
            named.extend(prefixed("attn", branch.attn.named_parameters()));
        }
        named
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msr_cpu::{CpuBackend, CpuDevice};

    type T = Tensor<CpuBackend>;

    fn cfg(use_attn: bool, conv_type: Option<ConvType>, shift_size: usize) -> AttentionConfig {
        AttentionConfig {
            network_depth: 4,
            dim: 8,
            num_heads: 2,
            window_size: 8,
            shift_size,
            use_attn,
            conv_type,
        }
    }

    fn names(a: &Attention<CpuBackend>) -> Vec<String> {
        a.named_parameters().into_iter().map(|(n, _)| n).collect()
    }

    #[test]
    fn test_submodules_follow_mode() -> Result<()> {
        let dev = CpuDevice;
        let full = Attention::<CpuBackend>::new(cfg(true, Some(ConvType::DWConv), 0), DType::F64, &dev)?;
        let n = names(&full);
        for key in ["qk.weight", "v.weight", "proj3.bias", "conv.0.weight", "attn.meta.0.weight"] {
            assert!(n.contains(&key.to_string()), "missing {key}");
        }

        let conv_only = Attention::<CpuBackend>::new(cfg(false, Some(ConvType::Conv), 0), DType::F64, &dev)?;
        let n = names(&conv_only);
        assert!(n.contains(&"conv.2.weight".to_string()));
        assert!(!n.iter().any(|k| k.starts_with("v.") || k.starts_with("qk.")));
        assert!(n.iter().any(|k| k.starts_with("deblock.")));
        Ok(())
    }

    #[test]
    fn test_rejects_empty_mixer() {
        assert!(Attention::<CpuBackend>::new(cfg(false, None, 0), DType::F64, &CpuDevice).is_err());
    }

    #[test]
    fn test_output_shape_every_mode() -> Result<()> {
        let dev = CpuDevice;
        // 12×10 is not a multiple of the window: padded, attended, cropped
        let x = T::randn((1, 8, 12, 10), DType::F64, &dev)?;
        for (use_attn, conv, shift) in [
            (true, Some(ConvType::DWConv), 0),
            (true, Some(ConvType::DWConv), 4),
            (true, Some(ConvType::Conv), 4),
            (true, None, 0),
            (false, Some(ConvType::Conv), 0),
            (false, Some(ConvType::DWConv), 0),
        ] {
            let a = Attention::<CpuBackend>::new(cfg(use_attn, conv, shift), DType::F64, &dev)?;
            assert_eq!(a.forward(&x)?.dims(), &[1, 8, 12, 10], "{use_attn} {conv:?} {shift}");
        }
        Ok(())
    }

    #[test]
    fn test_shifted_padding_amounts() -> Result<()> {
        let a = Attention::<CpuBackend>::new(cfg(true, None, 4), DType::F64, &CpuDevice)?;
        let x = T::zeros((1, 1, 16, 13), DType::F64, &CpuDevice)?;
        // h: 4 + 16 + (8-4+0)%8 = 24 ; w: 4 + 13 + (8-4+3)%8 = 24
        let shifted = a.check_size(&x, true)?;
        assert_eq!(shifted.dims(), &[1, 1, 24, 24]);
        let plain = a.check_size(&x, false)?;
        assert_eq!(plain.dims(), &[1, 1, 16, 16]);
        Ok(())
    }

    #[test]
    fn test_qk_init_is_wider_than_gained_convs() -> Result<()> {
        // QK std = sqrt(2/(8+16)) ≈ 0.29; V std = sqrt(2/16) · 32^(-1/4) ≈ 0.15
        let a = Attention::<CpuBackend>::new(cfg(true, Some(ConvType::DWConv), 0), DType::F64, &CpuDevice)?;
        let std_of = |name: &str| -> Result<f64> {
            let p = a
                .named_parameters()
                .into_iter()
                .find(|(n, _)| n == name)
                .map(|(_, p)| p)
                .ok_or_else(|| msr_core::Error::msg(format!("no {name}")))?;
            let v = p.to_f64_vec()?;
            Ok((v.iter().map(|x| x * x).sum::<f64>() / v.len() as f64).sqrt())
        };
        assert!(std_of("qk.bias")? == 0.0);
        let qk = std_of("qk.weight")?;
        let v = std_of("v.weight")?;
        assert!((qk - (2.0f64 / 24.0).sqrt()).abs() < 0.06, "qk std {qk}");
        assert!((v - (2.0f64 / 16.0).sqrt() * 32.0f64.powf(-0.25)).abs() < 0.05, "v std {v}");
        Ok(())
    }
}
