// Module trait — the interface every layer implements
//
// A layer is a plain struct holding its parameter tensors. `forward` maps one
// input tensor to one output tensor; `parameters` lists every trainable
// tensor so an optimizer (or a gradient check) can find them.
//
// NAMING:
//
// Leaf layers name their tensors `weight` / `bias`. Composite layers prefix
// children with their field name and a dot (`attn.qk.weight`), so the full
// listing of a network reads like a PyTorch state dict.
//
// GENERIC OVER BACKEND:
//
// Modules are generic over `B: Backend`; the same definition runs wherever
// its tensors were created.

use msr_core::backend::Backend;
use msr_core::error::Result;
use msr_core::tensor::Tensor;

/// The trait every layer implements.
///
/// ```ignore
/// struct Gate<B: Backend> {
///     conv: Conv2d<B>,
/// }
///
/// impl<B: Backend> Module<B> for Gate<B> {
///     fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
///         self.conv.forward(x)?.sigmoid()
///     }
///     fn parameters(&self) -> Vec<Tensor<B>> {
///         self.conv.parameters()
///     }
/// }
/// ```
pub trait Module<B: Backend> {
    /// Compute the output tensor from the input tensor.
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>>;

    /// All trainable tensors of this module, children included.
    fn parameters(&self) -> Vec<Tensor<B>>;

    /// Total number of scalar parameters.
    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.elem_count()).sum()
    }

    /// Parameters with dotted, human-readable names.
    ///
    /// The default uses positional names (`param_0`, `param_1`, …); leaf and
    /// composite layers override it.
    fn named_parameters(&self) -> Vec<(String, Tensor<B>)> {
        self.parameters()
            .into_iter()
            .enumerate()
            .map(|(i, p)| (format!("param_{i}"), p))
            .collect()
    }
}

/// Prefix every name in `named` with `prefix.`.
///
/// Composite modules use this to build their `named_parameters` listing.
pub fn prefixed<B: Backend>(
    prefix: &str,
    named: Vec<(String, Tensor<B>)>,
) -> Vec<(String, Tensor<B>)> {
    named
        .into_iter()
        .map(|(k, v)| (format!("{prefix}.{k}"), v))
        .collect()
}
