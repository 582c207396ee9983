//! # msrformer
//!
//! MSRFormer: a single-image restoration network mixing windowed
//! self-attention, frequency-domain feed-forward layers and differential
//! (edge-sensitive) convolutions.
//!
//! This is the facade crate; it re-exports the tensor runtime it is built on.
//!
//! ## Usage
//!
//! ```ignore
//! use msrformer::prelude::*;
//!
//! let cfg = MsrFormerConfig::small();
//! let model = MsrFormer::<CpuBackend>::new(&cfg, DType::F32, &CpuDevice)?;
//! let hazy = CpuTensor::rand((1, 3, 64, 64), DType::F32, &CpuDevice)?;
//! let clear = model.forward(&hazy)?; // [1, 3, 64, 64]
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|---------|
//! | `msr-core` | Tensor, Shape, DType, Layout, Backend trait, autograd, conv/FFT kernels |
//! | `msr-cpu` | CPU backend with rayon parallelism |
//! | `msr-nn` | Module trait, Conv2d/Conv1d, Linear, Sequential, init |
//! | `msrformer` | The network, its configuration and tracing setup |
//!
//! ## Modules
//!
//! - [`models`] — every building block of the network, and [`MsrFormer`] itself
//! - [`config`] — serde configuration with presets
//! - [`logging`] — `tracing` subscriber setup

/// Re-export core types.
pub use msr_core::{
    backend::{Backend, BackendDevice, BackendStorage},
    DType, Error, GradStore, Layout, Result, Shape, Tensor, WithDType,
};

/// Re-export CPU backend.
pub use msr_cpu::{CpuBackend, CpuDevice, CpuStorage, CpuTensor};

/// Re-export layers.
pub mod nn {
    pub use msr_nn::*;
}

pub mod config;
pub mod logging;
pub mod models;

pub use config::{AttnLoc, ConfigError, ConvType, MsrFormerConfig};
pub use models::MsrFormer;

/// Everything needed to build and run the network.
pub mod prelude {
    pub use crate::config::{AttnLoc, ConvType, MsrFormerConfig};
    pub use crate::models::MsrFormer;
    pub use crate::nn::Module;
    pub use crate::{CpuBackend, CpuDevice, CpuTensor, DType, Error, Result, Shape, Tensor};
}
