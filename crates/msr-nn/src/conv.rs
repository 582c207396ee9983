// Conv2d & Conv1d — grouped convolution layers
//
// Conv2d applies learnable filters to `[N, C_in, H, W]`, producing
// `[N, C_out, H_out, W_out]`. Channels can be split into `groups`
// independent convolutions (`groups == C_in` gives a depthwise conv).
//
// PADDING MODES:
//
//   Zeros   — the kernel reads zeros outside the image (handled inside the
//             im2col kernel).
//   Reflect — the input is mirror-padded first (`Tensor::pad_reflect`), then
//             convolved without padding. The edge pixel is not repeated.
//
// WEIGHT INITIALIZATION:
//
//   U(-k, k) with k = sqrt(groups / (C_in * kH * kW)), i.e. sqrt(1 / fan_in).
//   Networks that need a different scheme re-initialise in place with the
//   helpers in `init`.
//
// PARAMETER SHAPES:
//
//   Conv2d weight: [C_out, C_in / groups, kH, kW]     bias: [C_out]
//   Conv1d weight: [C_out, C_in / groups, K]          bias: [C_out]
//
// OUTPUT SIZE FORMULA:
//
//   H_out = floor((H + 2*padding_h - kernel_h) / stride_h) + 1

use msr_core::backend::Backend;
use msr_core::dtype::DType;
use msr_core::error::{Error, Result};
use msr_core::shape::Shape;
use msr_core::tensor::Tensor;

use crate::module::Module;

/// How a convolution fills the border outside the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaddingMode {
    #[default]
    Zeros,
    Reflect,
}

fn check_groups(in_channels: usize, out_channels: usize, groups: usize) -> Result<()> {
    if groups == 0 || in_channels % groups != 0 || out_channels % groups != 0 {
        return Err(Error::GroupsMismatch {
            channels: if groups != 0 && in_channels % groups != 0 {
                in_channels
            } else {
                out_channels
            },
            groups,
        });
    }
    Ok(())
}

fn uniform_param<B: Backend>(
    shape: Shape,
    k: f64,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    Ok(Tensor::<B>::rand(shape, dtype, device)?
        .affine(2.0 * k, -k)?
        .set_variable())
}

/// 2D convolutional layer.
///
/// # Examples
/// ```ignore
/// let conv = Conv2d::<CpuBackend>::new(3, 24, [3, 3], [1, 1], [1, 1], true, DType::F32, &dev)?
///     .with_padding_mode(PaddingMode::Reflect);
/// let y = conv.forward(&x)?; // [N, 24, H, W]
/// ```
pub struct Conv2d<B: Backend> {
    /// Convolution filters: [C_out, C_in / groups, kH, kW]
    weight: Tensor<B>,
    /// Optional bias: [C_out]
    bias: Option<Tensor<B>>,
    in_channels: usize,
    out_channels: usize,
    kernel_size: [usize; 2],
    stride: [usize; 2],
    padding: [usize; 2],
    groups: usize,
    padding_mode: PaddingMode,
}

impl<B: Backend> Conv2d<B> {
    /// Create an ungrouped Conv2d with zero padding.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: [usize; 2],
        stride: [usize; 2],
        padding: [usize; 2],
        use_bias: bool,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        Self::grouped(
            in_channels,
            out_channels,
            kernel_size,
            stride,
            padding,
            1,
            use_bias,
            dtype,
            device,
        )
    }

    /// Create a Conv2d whose channels are split into `groups`.
    ///
    /// Both channel counts must be divisible by `groups`.
    #[allow(clippy::too_many_arguments)]
    pub fn grouped(
        in_channels: usize,
        out_channels: usize,
        kernel_size: [usize; 2],
        stride: [usize; 2],
        padding: [usize; 2],
        groups: usize,
        use_bias: bool,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        check_groups(in_channels, out_channels, groups)?;
        let [kh, kw] = kernel_size;
        let fan_in = (in_channels / groups) * kh * kw;
        let k = (1.0 / fan_in as f64).sqrt();

        let weight = uniform_param::<B>(
            Shape::new(vec![out_channels, in_channels / groups, kh, kw]),
            k,
            dtype,
            device,
        )?;
        let bias = if use_bias {
            Some(uniform_param::<B>(
                Shape::from(out_channels),
                k,
                dtype,
                device,
            )?)
        } else {
            None
        };

        Ok(Conv2d {
            weight,
            bias,
            in_channels,
            out_channels,
            kernel_size,
            stride,
            padding,
            groups,
            padding_mode: PaddingMode::Zeros,
        })
    }

    /// Create a Conv2d from existing weight and bias tensors.
    pub fn from_tensors(
        weight: Tensor<B>,
        bias: Option<Tensor<B>>,
        stride: [usize; 2],
        padding: [usize; 2],
        groups: usize,
    ) -> Result<Self> {
        let dims = weight.dims();
        if dims.len() != 4 {
            return Err(Error::msg(format!(
                "Conv2d weight must be 4D [C_out,C_in/groups,kH,kW], got {:?}",
                dims
            )));
        }
        let out_channels = dims[0];
        let in_channels = dims[1] * groups;
        check_groups(in_channels, out_channels, groups)?;
        let kernel_size = [dims[2], dims[3]];
        Ok(Conv2d {
            weight: weight.set_variable(),
            bias: bias.map(|b| b.set_variable()),
            in_channels,
            out_channels,
            kernel_size,
            stride,
            padding,
            groups,
            padding_mode: PaddingMode::Zeros,
        })
    }

    /// Switch how the border is filled. Parameters are unchanged.
    pub fn with_padding_mode(mut self, mode: PaddingMode) -> Self {
        self.padding_mode = mode;
        self
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }
    pub fn out_channels(&self) -> usize {
        self.out_channels
    }
    pub fn kernel_size(&self) -> [usize; 2] {
        self.kernel_size
    }
    pub fn stride(&self) -> [usize; 2] {
        self.stride
    }
    pub fn padding(&self) -> [usize; 2] {
        self.padding
    }
    pub fn groups(&self) -> usize {
        self.groups
    }
    pub fn padding_mode(&self) -> PaddingMode {
        self.padding_mode
    }
    pub fn weight(&self) -> &Tensor<B> {
        &self.weight
    }
    pub fn bias(&self) -> Option<&Tensor<B>> {
        self.bias.as_ref()
    }

    /// Convolve `x` with an arbitrary kernel using this layer's stride,
    /// padding, groups and padding mode.
    ///
    /// Layers that synthesise their kernel from the stored weight (the
    /// differential convolutions) go through here.
    pub fn apply_kernel(
        &self,
        x: &Tensor<B>,
        weight: &Tensor<B>,
        bias: Option<&Tensor<B>>,
    ) -> Result<Tensor<B>> {
        let [ph, pw] = self.padding;
        match self.padding_mode {
            PaddingMode::Zeros => x.conv2d(weight, bias, self.stride, self.padding, self.groups),
            PaddingMode::Reflect if ph == 0 && pw == 0 => {
                x.conv2d(weight, bias, self.stride, [0, 0], self.groups)
            }
            PaddingMode::Reflect => x.pad_reflect([pw, pw, ph, ph])?.conv2d(
                weight,
                bias,
                self.stride,
                [0, 0],
                self.groups,
            ),
        }
    }
}

impl<B: Backend> Module<B> for Conv2d<B> {
    /// Input `[N, C_in, H, W]`, output `[N, C_out, H_out, W_out]`.
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        self.apply_kernel(x, &self.weight, self.bias.as_ref())
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

// Conv1d

/// 1D convolutional layer over `[N, C_in, L]`.
pub struct Conv1d<B: Backend> {
    /// [C_out, C_in / groups, K]
    weight: Tensor<B>,
    bias: Option<Tensor<B>>,
    kernel_size: usize,
    stride: usize,
    padding: usize,
    groups: usize,
}

impl<B: Backend> Conv1d<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        groups: usize,
        use_bias: bool,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        check_groups(in_channels, out_channels, groups)?;
        let k = (1.0 / ((in_channels / groups) * kernel_size) as f64).sqrt();
        let weight = uniform_param::<B>(
            Shape::new(vec![out_channels, in_channels / groups, kernel_size]),
            k,
            dtype,
            device,
        )?;
        let bias = if use_bias {
            Some(uniform_param::<B>(
                Shape::from(out_channels),
                k,
                dtype,
                device,
            )?)
        } else {
            None
        };
        Ok(Conv1d {
            weight,
            bias,
            kernel_size,
            stride,
            padding,
            groups,
        })
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }
    pub fn weight(&self) -> &Tensor<B> {
        &self.weight
    }
    pub fn bias(&self) -> Option<&Tensor<B>> {
        self.bias.as_ref()
    }
}

impl<B: Backend> Module<B> for Conv1d<B> {
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        x.conv1d(
            &self.weight,
            self.bias.as_ref(),
            self.stride,
            self.padding,
            self.groups,
        )
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

#[cfg(test)]
mod tests {
    use super::*;
    use msr_cpu::{CpuBackend, CpuDevice};

    type T = Tensor<CpuBackend>;

    fn arange(n: usize) -> Vec<f64> {
        (0..n).map(|i| i as f64).collect()
    }

    #[test]
    fn test_conv2d_shapes_and_params() -> Result<()> {
        let dev = CpuDevice;
        let conv =
            Conv2d::<CpuBackend>::new(3, 8, [3, 3], [2, 2], [1, 1], true, DType::F64, &dev)?;
        assert_eq!(conv.weight().dims(), &[8, 3, 3, 3]);
        assert_eq!(conv.num_parameters(), 8 * 27 + 8);
        let x = T::randn((2, 3, 9, 9), DType::F64, &dev)?;
        assert_eq!(conv.forward(&x)?.dims(), &[2, 8, 5, 5]);
        Ok(())
    }

    #[test]
    fn test_conv2d_init_bound() -> Result<()> {
        let conv = Conv2d::<CpuBackend>::grouped(
            4,
            4,
            [3, 3],
            [1, 1],
            [1, 1],
            4,
            false,
            DType::F64,
            &CpuDevice,
        )?;
        assert_eq!(conv.weight().dims(), &[4, 1, 3, 3]);
        let k = (1.0f64 / 9.0).sqrt();
        assert!(conv.weight().to_f64_vec()?.iter().all(|v| v.abs() <= k));
        Ok(())
    }

    #[test]
    fn test_groups_must_divide_channels() {
        let r = Conv2d::<CpuBackend>::grouped(
            6,
            4,
            [1, 1],
            [1, 1],
            [0, 0],
            4,
            false,
            DType::F64,
            &CpuDevice,
        );
        assert!(matches!(r, Err(Error::GroupsMismatch { .. })));
    }

    #[test]
    fn test_reflect_padding_mode() -> Result<()> {
        let dev = CpuDevice;
        // 3x3 box filter over a 1x3 row: reflect mirrors without repeating the edge
        let weight = T::ones((1, 1, 1, 3), DType::F64, &dev)?;
        let conv = Conv2d::from_tensors(weight, None, [1, 1], [0, 1], 1)?
            .with_padding_mode(PaddingMode::Reflect);
        let x = T::from_f64_slice(&[1.0, 2.0, 4.0], (1, 1, 1, 3), DType::F64, &dev)?;
        let y = conv.forward(&x)?.to_f64_vec()?;
        assert_eq!(y, vec![2.0 + 1.0 + 2.0, 1.0 + 2.0 + 4.0, 2.0 + 4.0 + 2.0]);

        let box_filter = T::ones((1, 1, 1, 3), DType::F64, &dev)?;
        let zeros = Conv2d::from_tensors(box_filter, None, [1, 1], [0, 1], 1)?;
        assert_eq!(zeros.forward(&x)?.to_f64_vec()?, vec![3.0, 7.0, 6.0]);
        Ok(())
    }

    #[test]
    fn test_named_parameters() -> Result<()> {
        let conv =
            Conv2d::<CpuBackend>::new(2, 2, [1, 1], [1, 1], [0, 0], true, DType::F64, &CpuDevice)?;
        let names: Vec<String> = conv.named_parameters().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["weight", "bias"]);
        Ok(())
    }

    #[test]
    fn test_conv1d_forward() -> Result<()> {
        let dev = CpuDevice;
        let conv = Conv1d::<CpuBackend>::new(2, 4, 3, 1, 1, 2, true, DType::F64, &dev)?;
        assert_eq!(conv.weight().dims(), &[4, 1, 3]);
        let x = T::from_f64_slice(&arange(10), (1, 2, 5), DType::F64, &dev)?;
        assert_eq!(conv.forward(&x)?.dims(), &[1, 4, 5]);
        Ok(())
    }
}
