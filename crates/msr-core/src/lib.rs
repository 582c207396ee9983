//! # msr-core
//!
//! Tensor runtime underneath the MSRFormer restoration network.
//!
//! This crate provides:
//! - [`Tensor`]: n-dimensional array with reverse-mode autograd
//! - [`Shape`] / [`Layout`]: shape, strides and view offsets
//! - [`DType`]: element types (F16, BF16, F32, F64, U8, U32, I64)
//! - [`Backend`]: the kernel set a compute device implements
//! - [`GradStore`]: gradients returned by `Tensor::backward`
//!
//! Grouped convolution and the real 2-D FFT are implemented once, on host
//! buffers, and shared by every backend.

pub mod backend;
pub mod backprop;
mod conv;
pub mod dtype;
pub mod error;
pub mod layout;
pub mod op;
pub mod scalar;
pub mod shape;
pub mod spectral;
pub mod tensor;

pub use backend::{Backend, BackendDevice, BackendStorage, BinaryOp, ReduceOp, UnaryOp};
pub use backprop::GradStore;
pub use dtype::{DType, WithDType};
pub use error::{Error, Result};
pub use layout::Layout;
pub use op::{Op, TensorId};
pub use shape::Shape;
pub use tensor::Tensor;
