// Linear — fully-connected layer
//
//   y = x @ weight^T + bias
//
// Input `[..., in_features]` becomes `[..., out_features]`; leading dims are
// batch dims and broadcast through the matmul. The relative-position MLP in
// window attention is the main user.
//
// PARAMETER SHAPES:
//
//   weight: [out_features, in_features]
//   bias:   [out_features]
//
// Both start from U(-k, k), k = sqrt(1 / in_features).

use msr_core::backend::Backend;
use msr_core::dtype::DType;
use msr_core::error::{Error, Result};
use msr_core::tensor::Tensor;

use crate::module::Module;

/// A fully-connected layer: `y = xWᵀ + b`.
pub struct Linear<B: Backend> {
    weight: Tensor<B>,
    bias: Option<Tensor<B>>,
    in_features: usize,
    out_features: usize,
}

impl<B: Backend> Linear<B> {
    pub fn new(
        in_features: usize,
        out_features: usize,
        use_bias: bool,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let k = (1.0 / in_features as f64).sqrt();
        let weight = Tensor::<B>::rand((out_features, in_features), dtype, device)?
            .affine(2.0 * k, -k)?
            .set_variable();
        let bias = if use_bias {
            let b = Tensor::<B>::rand(out_features, dtype, device)?
                .affine(2.0 * k, -k)?
                .set_variable();
            Some(b)
        } else {
            None
        };
        Ok(Linear {
            weight,
            bias,
            in_features,
            out_features,
        })
    }

    /// Build from existing tensors, e.g. hand-written test weights.
    pub fn from_tensors(weight: Tensor<B>, bias: Option<Tensor<B>>) -> Result<Self> {
        let dims = weight.dims();
        if dims.len() != 2 {
            return Err(Error::msg(format!(
                "Linear weight must be 2D, got shape {:?}",
                dims
            )));
        }
        let (out_features, in_features) = (dims[0], dims[1]);
        Ok(Linear {
            weight: weight.set_variable(),
            bias: bias.map(|b| b.set_variable()),
            in_features,
            out_features,
        })
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }
    pub fn out_features(&self) -> usize {
        self.out_features
    }
    pub fn weight(&self) -> &Tensor<B> {
        &self.weight
    }
    pub fn bias(&self) -> Option<&Tensor<B>> {
        self.bias.as_ref()
    }
}

impl<B: Backend> Module<B> for Linear<B> {
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let y = x.matmul(&self.weight.t()?)?;
        match &self.bias {
            Some(b) => y.add(b),
            None => Ok(y),
        }
    }

    fn parameters(&self) -> Vec<Tensor<B>> {
        let mut params = vec![self.weight.clone()];
        if let Some(ref b) = self.bias {
            params.push(b.clone());
        }
        params
    }

    fn named_parameters(&self) -> Vec<(String, Tensor<B>)> {
        let mut named = vec![("weight".to_string(), self.weight.clone())];
        if let Some(ref b) = self.bias {
            named.push(("bias".to_string(), b.clone()));
        }
        named
    }
}
