//! # msr-nn
//!
//! Layers for the MSRFormer network, built on `msr-core` tensors.
//!
//! Everything follows the [`Module`] trait pattern:
//!
//! 1. **Module trait** — `forward()` plus named parameter listing
//! 2. **Conv2d / Conv1d** — grouped convolution with zero or reflect padding
//! 3. **Linear** — `y = xWᵀ + b`
//! 4. **Activations** — ReLU, GeLU, Sigmoid as modules
//! 5. **PixelShuffle** — sub-pixel upsampling
//! 6. **init** — uniform / normal / truncated-normal initialisers, both
//!    fresh and in place
//!
//! Modules are generic over `Backend`, so the network definition does not
//! care which device its tensors live on.

pub mod activation;
pub mod conv;
pub mod init;
pub mod linear;
pub mod module;
pub mod pixel_shuffle;
pub mod sequential;

pub use activation::{GeLU, ReLU, Sigmoid};
pub use conv::{Conv1d, Conv2d, PaddingMode};
pub use linear::Linear;
pub use module::Module;
pub use pixel_shuffle::PixelShuffle;
pub use sequential::Sequential;
