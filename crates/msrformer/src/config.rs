//! Network configuration.
//!
//! [`MsrFormerConfig`] describes the five stages of the encoder/decoder:
//! channel width, depth, heads, feed-forward ratio, how many blocks carry
//! window attention and which convolution the token mixer uses. It
//! round-trips through JSON:
//!
//! ```json
//! {
//!   "in_chans": 3,
//!   "out_chans": 4,
//!   "window_size": 8,
//!   "embed_dims": [24, 48, 96, 48, 24],
//!   "mlp_ratios": [2.66, 3.0, 3.0, 3.0, 2.66],
//!   "depths": [8, 8, 8, 4, 4],
//!   "num_heads": [2, 4, 6, 1, 1],
//!   "attn_ratio": [0.25, 0.5, 0.75, 0.0, 0.0],
//!   "conv_type": ["DWConv", "DWConv", "DWConv", "DWConv", "DWConv"],
//!   "attn_loc": "last",
//!   "mlp_norm": false
//! }
//! ```
//!
//! Missing fields take the default (full-size) values.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Number of stages (three encoder levels, two decoder levels).
pub const NUM_STAGES: usize = 5;

/// Side of the square patches the spectral layers operate on.
pub const SPECTRAL_PATCH: usize = 8;

/// Convolution used by the token mixer of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvType {
    /// Two reflect-padded 3×3 convolutions around a ReLU.
    Conv,
    /// One reflect-padded 5×5 depthwise convolution, wrapped by 1×1 projections.
    DWConv,
}

/// Which blocks of a stage carry window attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttnLoc {
    #[default]
    Last,
    First,
    Middle,
}

impl AttnLoc {
    /// Per-block attention flags for a stage of `depth` blocks, of which
    /// `ratio · depth` (not rounded) use attention.
    pub fn flags(self, depth: usize, ratio: f64) -> Vec<bool> {
        let attn_depth = ratio * depth as f64;
        let depth_f = depth as f64;
        (0..depth)
            .map(|i| {
                let i = i as f64;
                match self {
                    AttnLoc::Last => i >= depth_f - attn_depth,
                    AttnLoc::First => i < attn_depth,
                    AttnLoc::Middle => {
                        i >= ((depth_f - attn_depth) / 2.0).floor()
                            && i < ((depth_f + attn_depth) / 2.0).floor()
                    }
                }
            })
            .collect()
    }
}

/// Configuration of an [`MsrFormer`](crate::models::MsrFormer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MsrFormerConfig {
    /// Image channels.
    pub in_chans: usize,
    /// Channels of the predicted map: one gain channel `K` plus an offset
    /// `B` per image channel.
    pub out_chans: usize,
    pub window_size: usize,
    pub embed_dims: [usize; NUM_STAGES],
    pub mlp_ratios: [f64; NUM_STAGES],
    pub depths: [usize; NUM_STAGES],
    pub num_heads: [usize; NUM_STAGES],
    /// Fraction of each stage's blocks that use window attention.
    pub attn_ratio: [f64; NUM_STAGES],
    /// Token-mixer convolution per stage; `null` means none.
    pub conv_type: [Option<ConvType>; NUM_STAGES],
    pub attn_loc: AttnLoc,
    /// Normalise the feed-forward input of attention blocks with a second RLN.
    pub mlp_norm: bool,
}

impl Default for MsrFormerConfig {
    fn default() -> Self {
        MsrFormerConfig {
            in_chans: 3,
            out_chans: 4,
            window_size: 8,
            embed_dims: [24, 48, 96, 48, 24],
            mlp_ratios: [2.66, 3.0, 3.0, 3.0, 2.66],
            depths: [16, 16, 16, 8, 8],
            num_heads: [2, 4, 6, 1, 1],
            attn_ratio: [0.25, 0.5, 0.75, 0.0, 0.0],
            conv_type: [Some(ConvType::DWConv); NUM_STAGES],
            attn_loc: AttnLoc::Last,
            mlp_norm: false,
        }
    }
}

impl MsrFormerConfig {
    /// Half-depth variant of the default network.
    pub fn small() -> Self {
        Self::default().with_depths([8, 8, 8, 4, 4])
    }

    /// Double-width variant with full 3×3 token-mixer convolutions.
    pub fn large() -> Self {
        Self::default()
            .with_embed_dims([48, 96, 192, 96, 48])
            .with_depths([16, 16, 16, 12, 12])
            .with_conv_type([Some(ConvType::Conv); NUM_STAGES])
    }

    pub fn with_in_chans(mut self, in_chans: usize) -> Self {
        self.in_chans = in_chans;
        self
    }

    pub fn with_out_chans(mut self, out_chans: usize) -> Self {
        self.out_chans = out_chans;
        self
    }

    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }

    pub fn with_embed_dims(mut self, embed_dims: [usize; NUM_STAGES]) -> Self {
        self.embed_dims = embed_dims;
        self
    }

    pub fn with_mlp_ratios(mut self, mlp_ratios: [f64; NUM_STAGES]) -> Self {
        self.mlp_ratios = mlp_ratios;
        self
    }

    pub fn with_depths(mut self, depths: [usize; NUM_STAGES]) -> Self {
        self.depths = depths;
        self
    }

    pub fn with_num_heads(mut self, num_heads: [usize; NUM_STAGES]) -> Self {
        self.num_heads = num_heads;
        self
    }

    pub fn with_attn_ratio(mut self, attn_ratio: [f64; NUM_STAGES]) -> Self {
        self.attn_ratio = attn_ratio;
        self
    }

    pub fn with_conv_type(mut self, conv_type: [Option<ConvType>; NUM_STAGES]) -> Self {
        self.conv_type = conv_type;
        self
    }

    pub fn with_attn_loc(mut self, attn_loc: AttnLoc) -> Self {
        self.attn_loc = attn_loc;
        self
    }

    pub fn with_mlp_norm(mut self, mlp_norm: bool) -> Self {
        self.mlp_norm = mlp_norm;
        self
    }

    /// Total number of transformer blocks; scales the init gain of every block.
    pub fn network_depth(&self) -> usize {
        self.depths.iter().sum()
    }

    /// Feed-forward hidden width of stage `i`: `floor(dim · ratio)`.
    pub fn hidden_dim(&self, stage: usize) -> usize {
        (self.embed_dims[stage] as f64 * self.mlp_ratios[stage]) as usize
    }

    /// Check that a network can be built from this configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.in_chans == 0 {
            return invalid("in_chans must be positive".into());
        }
        if self.out_chans != self.in_chans + 1 {
            return invalid(format!(
                "out_chans must be in_chans + 1 (one gain map plus {} offsets), got {}",
                self.in_chans, self.out_chans
            ));
        }
        if self.embed_dims[1] != self.embed_dims[3] || self.embed_dims[0] != self.embed_dims[4] {
            return invalid(format!(
                "decoder widths must mirror the encoder: embed_dims {:?}",
                self.embed_dims
            ));
        }

        let mut any_attn = false;
        for stage in 0..NUM_STAGES {
            let dim = self.embed_dims[stage];
            if dim == 0 {
                return invalid(format!("embed_dims[{stage}] must be positive"));
            }
            let ratio = self.attn_ratio[stage];
            if !(0.0..=1.0).contains(&ratio) {
                return invalid(format!("attn_ratio[{stage}] = {ratio} is outside [0, 1]"));
            }
            if !(self.mlp_ratios[stage].is_finite() && self.hidden_dim(stage) > 0) {
                return invalid(format!(
                    "mlp_ratios[{stage}] = {} gives an empty feed-forward layer",
                    self.mlp_ratios[stage]
                ));
            }
            let flags = self.attn_loc.flags(self.depths[stage], ratio);
            if flags.iter().any(|&a| a) {
                any_attn = true;
                let heads = self.num_heads[stage];
                if heads == 0 || dim % heads != 0 {
                    return invalid(format!(
                        "embed_dims[{stage}] = {dim} is not divisible by num_heads[{stage}] = {heads}"
                    ));
                }
            }
            if self.conv_type[stage].is_none() && flags.iter().any(|&a| !a) {
                return invalid(format!(
                    "stage {stage} has blocks with neither attention nor a convolution"
                ));
            }
        }
        // Gated fusion reduces channels by 8 in its channel branch.
        for stage in [3, 4] {
            if self.embed_dims[stage] < 8 {
                return invalid(format!(
                    "embed_dims[{stage}] = {} is too narrow for the fusion gate",
                    self.embed_dims[stage]
                ));
            }
        }
        let ws = self.window_size;
        if any_attn && (ws == 0 || (ws * ws) % (SPECTRAL_PATCH * SPECTRAL_PATCH) != 0) {
            return invalid(format!(
                "window_size {ws}: window area must be a multiple of {}",
                SPECTRAL_PATCH * SPECTRAL_PATCH
            ));
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Errors from loading or checking a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for msr_core::Error {
    fn from(e: ConfigError) -> Self {
        msr_core::Error::Msg(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        for cfg in [
            MsrFormerConfig::default(),
            MsrFormerConfig::small(),
            MsrFormerConfig::large(),
        ] {
            assert!(cfg.validate().is_ok(), "{cfg:?}");
        }
        assert_eq!(MsrFormerConfig::default().network_depth(), 64);
        assert_eq!(MsrFormerConfig::small().network_depth(), 32);
        assert_eq!(MsrFormerConfig::large().conv_type[0], Some(ConvType::Conv));
    }

    #[test]
    fn test_attention_flags() {
        // 16 blocks, ratio 1/4 → last 4
        let last = AttnLoc::Last.flags(16, 0.25);
        assert_eq!(last.iter().filter(|&&a| a).count(), 4);
        assert!(last[12] && !last[11]);

        let first = AttnLoc::First.flags(8, 0.5);
        assert_eq!(first, vec![true, true, true, true, false, false, false, false]);

        // 16 blocks, ratio 3/4: floor(2) ≤ i < floor(14)
        let middle = AttnLoc::Middle.flags(16, 0.75);
        assert!(!middle[1] && middle[2] && middle[13] && !middle[14]);

        assert!(AttnLoc::Last.flags(8, 0.0).iter().all(|&a| !a));
        // non-integral attention depth is not rounded: 3·0.5 = 1.5 → i ≥ 1.5
        assert_eq!(AttnLoc::Last.flags(3, 0.5), vec![false, false, true]);
    }

    #[test]
    fn test_hidden_dim_truncates() {
        let cfg = MsrFormerConfig::default();
        assert_eq!(cfg.hidden_dim(0), 63); // 24 · 2.66 = 63.84
        assert_eq!(cfg.hidden_dim(2), 288);
    }

    #[test]
    fn test_json_round_trip_and_defaults() -> Result<(), ConfigError> {
        let cfg = MsrFormerConfig::small().with_attn_loc(AttnLoc::Middle);
        let json = cfg.to_json_string()?;
        assert!(json.contains("\"DWConv\""));
        assert!(json.contains("\"middle\""));
        assert_eq!(MsrFormerConfig::from_json_str(&json)?, cfg);

        let partial = MsrFormerConfig::from_json_str(r#"{ "depths": [2, 2, 2, 1, 1] }"#)?;
        assert_eq!(partial.depths, [2, 2, 2, 1, 1]);
        assert_eq!(partial.embed_dims, MsrFormerConfig::default().embed_dims);
        Ok(())
    }

    #[test]
    fn test_rejects_bad_configs() {
        let bad_window = MsrFormerConfig::default().with_window_size(4);
        assert!(matches!(bad_window.validate(), Err(ConfigError::Invalid(_))));

        let bad_heads = MsrFormerConfig::default().with_num_heads([5, 4, 6, 1, 1]);
        assert!(bad_heads.validate().is_err());

        let no_mixer = MsrFormerConfig::default().with_conv_type([None; NUM_STAGES]);
        assert!(no_mixer.validate().is_err());

        let asymmetric = MsrFormerConfig::default().with_embed_dims([24, 48, 96, 32, 24]);
        assert!(asymmetric.validate().is_err());

        assert!(matches!(
            MsrFormerConfig::from_json_str(r#"{ "depth": [1] }"#),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn test_converts_into_core_error() {
        let err: msr_core::Error = ConfigError::Invalid("x".into()).into();
        assert!(err.to_string().contains("invalid config: x"));
    }
}
