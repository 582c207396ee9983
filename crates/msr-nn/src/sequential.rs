// Sequential — modules applied one after another
//
//   let body = Sequential::new()
//       .add(conv1)
//       .add(ReLU)
//       .add(conv2);
//
// The output of each layer becomes the input to the next. Children are
// named by position (`0.weight`, `2.bias`), as in PyTorch.

use msr_core::backend::Backend;
use msr_core::error::Result;
use msr_core::tensor::Tensor;

use crate::module::{prefixed, Module};

/// A container that chains modules sequentially.
pub struct Sequential<B: Backend> {
    layers: Vec<Box<dyn Module<B>>>,
}

impl<B: Backend> Sequential<B> {
    pub fn new() -> Self {
        Sequential { layers: Vec::new() }
    }

    /// Append a layer. Returns self for chaining.
    #[allow(clippy::should_implement_trait)]
    pub fn add<M: Module<B> + 'static>(mut self, module: M) -> Self {
        self.layers.push(Box::new(module));
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl<B: Backend> Default for Sequential<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> Module<B> for Sequential<B> {
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let mut out = x.clone();
        for layer in &self.layers {
            out = layer.forward(&out)?;
        }
        Ok(out)
    }

    fn parameters(&self) -> Vec<Tensor<B>> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }

    fn named_parameters(&self) -> Vec<(String, Tensor<B>)> {
        self.layers
            .iter()
            .enumerate()
            .flat_map(|(i, layer)| prefixed(&i.to_string(), layer.named_parameters()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::ReLU;
    use crate::conv::Conv2d;
    use msr_core::dtype::DType;
    use msr_cpu::{CpuBackend, CpuDevice};

    #[test]
    fn test_chain_and_names() -> Result<()> {
        let dev = CpuDevice;
        let seq = Sequential::<CpuBackend>::new()
            .add(Conv2d::new(2, 4, [3, 3], [1, 1], [1, 1], true, DType::F64, &dev)?)
            .add(ReLU)
            .add(Conv2d::new(4, 2, [3, 3], [1, 1], [1, 1], false, DType::F64, &dev)?);
        assert_eq!(seq.len(), 3);
        let x = Tensor::<CpuBackend>::randn((1, 2, 6, 6), DType::F64, &dev)?;
        assert_eq!(seq.forward(&x)?.dims(), &[1, 2, 6, 6]);
        let names: Vec<String> = seq.named_parameters().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["0.weight", "0.bias", "2.weight"]);
        Ok(())
    }
}
