// DEConv & DEBlock — detail-enhanced convolution
//
// DEConv runs five 3×3 branches (central, horizontal, vertical and angular
// difference, plus a vanilla conv) as one convolution: convolution is linear
// in the kernel, so summing the five derived kernels and biases first gives
// the same output as summing five feature maps.
//
// DEBlock wraps it in a residual unit:
//
//   r = relu(deconv(x)) + x
//   out = conv2(r) + x

use msr_core::{Backend, DType, Result, Tensor};
use msr_nn::module::prefixed;
use msr_nn::{Conv2d, Module};

use super::diff_conv::{Conv2dAd, Conv2dCd, Conv2dHd, Conv2dVd};

pub struct DEConv<B: Backend> {
    cd: Conv2dCd<B>,
    hd: Conv2dHd<B>,
    vd: Conv2dVd<B>,
    ad: Conv2dAd<B>,
    plain: Conv2d<B>,
}

impl<B: Backend> DEConv<B> {
    pub fn new(dim: usize, dtype: DType, device: &B::Device) -> Result<Self> {
        Ok(DEConv {
            cd: Conv2dCd::new(dim, dim, true, dtype, device)?,
            hd: Conv2dHd::new(dim, dim, true, dtype, device)?,
            vd: Conv2dVd::new(dim, dim, true, dtype, device)?,
            ad: Conv2dAd::new(dim, dim, true, dtype, device)?,
            plain: Conv2d::new(dim, dim, [3, 3], [1, 1], [1, 1], true, dtype, device)?,
        })
    }

    /// The merged kernel `[dim, dim, 3, 3]` and bias `[dim]`.
    pub fn merged_weight(&self) -> Result<(Tensor<B>, Tensor<B>)> {
        let mut kernel = self.plain.weight().clone();
        let mut bias = match self.plain.bias() {
            Some(b) => b.clone(),
            None => Tensor::<B>::zeros(
                self.plain.out_channels(),
                kernel.dtype(),
                kernel.device(),
            )?,
        };
        for (w, b) in [
            self.cd.get_weight()?,
            self.hd.get_weight()?,
            self.vd.get_weight()?,
            self.ad.get_weight()?,
        ] {
            kernel = kernel.add(&w)?;
            if let Some(b) = b {
                bias = bias.add(&b)?;
            }
        }
        Ok((kernel, bias))
    }

    /// The 2-D convolutions whose weights are re-initialised with the block
    /// they live in (the 1-D bases of hd / vd keep their default init).
    pub fn conv2d_layers(&self) -> Vec<&Conv2d<B>> {
        vec![self.cd.conv(), self.ad.conv(), &self.plain]
    }
}

impl<B: Backend> Module<B> for DEConv<B> {
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let (w, b) = self.merged_weight()?;
        x.conv2d(&w, Some(&b), [1, 1], [1, 1], 1)
    }

    fn parameters(&self) -> Vec<Tensor<B>> {
        let mut p = self.cd.parameters();
        p.extend(self.hd.parameters());
        p.extend(self.vd.parameters());
        p.extend(self.ad.parameters());
        p.extend(self.plain.parameters());
        p
    }

    fn named_parameters(&self) -> Vec<(String, Tensor<B>)> {
        let mut p = prefixed("cd", self.cd.named_parameters());
        p.extend(prefixed("hd", self.hd.named_parameters()));
        p.extend(prefixed("vd", self.vd.named_parameters()));
        p.extend(prefixed("ad", self.ad.named_parameters()));
        p.extend(prefixed("plain", self.plain.named_parameters()));
        p
    }
}

pub struct DEBlock<B: Backend> {
    deconv: DEConv<B>,
    conv2: Conv2d<B>,
}

impl<B: Backend> DEBlock<B> {
    pub fn new(dim: usize, kernel_size: usize, dtype: DType, device: &B::Device) -> Result<Self> {
        let pad = kernel_size / 2;
        Ok(DEBlock {
            deconv: DEConv::new(dim, dtype, device)?,
            conv2: Conv2d::new(
                dim,
                dim,
                [kernel_size, kernel_size],
                [1, 1],
                [pad, pad],
                true,
                dtype,
                device,
            )?,
        })
    }

    pub fn conv2d_layers(&self) -> Vec<&Conv2d<B>> {
        let mut layers = self.deconv.conv2d_layers();
        layers.push(&self.conv2);
        layers
    }
}

impl<B: Backend> Module<B> for DEBlock<B> {
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let r = self.deconv.forward(x)?.relu()?.add(x)?;
        self.conv2.forward(&r)?.add(x)
    }

    fn parameters(&self) -> Vec<Tensor<B>> {
        let mut p = self.deconv.parameters();
        p.extend(self.conv2.parameters());
        p
    }

    fn named_parameters(&self) -> Vec<(String, Tensor<B>)> {
        let mut p = prefixed("deconv", self.deconv.named_parameters());
        p.extend(prefixed("conv2", self.conv2.named_parameters()));
        p
    }
}
