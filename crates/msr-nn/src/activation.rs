// Activation modules — tensor activations wrapped as layers
//
// They carry no parameters; wrapping them lets them sit inside a
// `Sequential` next to convolutions:
//
//   Sequential::new().add(conv1).add(ReLU).add(conv2)

use msr_core::backend::Backend;
use msr_core::error::Result;
use msr_core::tensor::Tensor;

use crate::module::Module;

/// ReLU activation: max(0, x)
pub struct ReLU;

impl<B: Backend> Module<B> for ReLU {
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        x.relu()
    }
    fn parameters(&self) -> Vec<Tensor<B>> {
        vec![]
    }
}

/// Exact GELU: `x·Φ(x)`.
pub struct GeLU;

impl<B: Backend> Module<B> for GeLU {
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        x.gelu()
    }
    fn parameters(&self) -> Vec<Tensor<B>> {
        vec![]
    }
}

/// Sigmoid activation: 1 / (1 + e^(-x))
pub struct Sigmoid;

impl<B: Backend> Module<B> for Sigmoid {
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        x.sigmoid()
    }
    fn parameters(&self) -> Vec<Tensor<B>> {
        vec![]
    }
}
