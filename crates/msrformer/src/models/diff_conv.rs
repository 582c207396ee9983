// Differential convolutions — kernels derived from a learned base kernel
//
// Each layer stores an ordinary convolution and, at forward time, rewrites
// its weight into a kernel that responds to local differences instead of
// intensities. Kernels are flattened to taps
//
//   0 1 2
//   3 4 5        (5×5 kernels use the same row-major numbering, 0..25)
//   6 7 8
//
// and rebuilt with `gather_taps`, an index_select over a small source
// tensor, so gradients reach the base weight through the rewrite.
//
//   cd  central:     w'[4] = w[4] − Σ w                       (sums to zero)
//   ad  angular:     w' = w − θ·w[3,0,1,6,4,2,7,8,5]           (θ = 1)
//   rd  radial:      5×5, outer ring ← w[1..], inner ring ← −θ·w[1..],
//                    centre ← (1−θ)·w[0]                       (padding 2)
//   hd  horizontal:  columns 0 / 2 ← w / −w    (1-D base kernel [o, i, 3])
//   vd  vertical:    rows 0 / 2 ← w / −w       (1-D base kernel [o, i, 3])

use msr_core::{Backend, DType, Result, Tensor};
use msr_nn::{Conv1d, Conv2d, Module};

/// Base kernel `[o, i, kh, kw]` viewed as taps `[o, i, kh·kw]`.
fn flat_taps<B: Backend>(weight: &Tensor<B>) -> Result<Tensor<B>> {
    let d = weight.dims();
    weight.reshape(vec![d[0], d[1], d[2..].iter().product()])
}

/// `out[.., j] = source[.., index[j]]` along the tap axis.
fn gather_taps<B: Backend>(source: &Tensor<B>, index: &[usize]) -> Result<Tensor<B>> {
    let idx: Vec<f64> = index.iter().map(|&i| i as f64).collect();
    let idx = Tensor::<B>::from_f64_slice(&idx, idx.len(), DType::U32, source.device())?;
    source.index_select(2, &idx)
}

/// A `[o, i, 1]` column of zeros matching `like`.
fn zero_tap<B: Backend>(like: &Tensor<B>) -> Result<Tensor<B>> {
    let d = like.dims();
    Tensor::<B>::zeros(vec![d[0], d[1], 1], like.dtype(), like.device())
}

fn square<B: Backend>(taps: Tensor<B>, k: usize) -> Result<Tensor<B>> {
    let d = taps.dims().to_vec();
    taps.reshape(vec![d[0], d[1], k, k])
}

fn named<B: Backend>(
    weight: &Tensor<B>,
    bias: Option<&Tensor<B>>,
) -> Vec<(String, Tensor<B>)> {
    let mut out = vec![("weight".to_string(), weight.clone())];
    if let Some(b) = bias {
        out.push(("bias".to_string(), b.clone()));
    }
    out
}

fn new_conv3<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    padding: usize,
    use_bias: bool,
    dtype: DType,
    device: &B::Device,
) -> Result<Conv2d<B>> {
    Conv2d::new(
        in_channels,
        out_channels,
        [3, 3],
        [1, 1],
        [padding, padding],
        use_bias,
        dtype,
        device,
    )
}

// Central difference

pub struct Conv2dCd<B: Backend> {
    conv: Conv2d<B>,
}

impl<B: Backend> Conv2dCd<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        use_bias: bool,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        Ok(Conv2dCd {
            conv: new_conv3(in_channels, out_channels, 1, use_bias, dtype, device)?,
        })
    }

    pub fn conv(&self) -> &Conv2d<B> {
        &self.conv
    }

    /// Derived 3×3 kernel and the bias.
    pub fn get_weight(&self) -> Result<(Tensor<B>, Option<Tensor<B>>)> {
        let taps = flat_taps(self.conv.weight())?;
        let centre = taps.narrow(2, 4, 1)?.sub(&taps.sum(2, true)?)?;
        let source = Tensor::cat(&[taps, centre], 2)?;
        let kernel = gather_taps(&source, &[0, 1, 2, 3, 9, 5, 6, 7, 8])?;
        Ok((square(kernel, 3)?, self.conv.bias().cloned()))
    }
}

impl<B: Backend> Module<B> for Conv2dCd<B> {
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let (w, b) = self.get_weight()?;
        self.conv.apply_kernel(x, &w, b.as_ref())
    }
    fn parameters(&self) -> Vec<Tensor<B>> {
        self.conv.parameters()
    }
    fn named_parameters(&self) -> Vec<(String, Tensor<B>)> {
        self.conv.named_parameters()
    }
}

// Angular difference

const ANGULAR_PERM: [usize; 9] = [3, 0, 1, 6, 4, 2, 7, 8, 5];

pub struct Conv2dAd<B: Backend> {
    conv: Conv2d<B>,
    theta: f64,
}

impl<B: Backend> Conv2dAd<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        use_bias: bool,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        Ok(Conv2dAd {
            conv: new_conv3(in_channels, out_channels, 1, use_bias, dtype, device)?,
            theta: 1.0,
        })
    }

    pub fn with_theta(mut self, theta: f64) -> Self {
        self.theta = theta;
        self
    }

    pub fn conv(&self) -> &Conv2d<B> {
        &self.conv
    }

    pub fn get_weight(&self) -> Result<(Tensor<B>, Option<Tensor<B>>)> {
        let taps = flat_taps(self.conv.weight())?;
        let rotated = gather_taps(&taps, &ANGULAR_PERM)?.affine(self.theta, 0.0)?;
        Ok((square(taps.sub(&rotated)?, 3)?, self.conv.bias().cloned()))
    }
}

impl<B: Backend> Module<B> for Conv2dAd<B> {
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let (w, b) = self.get_weight()?;
        self.conv.apply_kernel(x, &w, b.as_ref())
    }
    fn parameters(&self) -> Vec<Tensor<B>> {
        self.conv.parameters()
    }
    fn named_parameters(&self) -> Vec<(String, Tensor<B>)> {
        self.conv.named_parameters()
    }
}

// Radial difference

/// Source layout: 0 = zero, 1..=8 = w[1..], 9..=16 = −θ·w[1..], 17 = centre.
const RADIAL_INDEX: [usize; 25] = [
    1, 0, 2, 0, 3, //
    0, 9, 10, 11, 0, //
    4, 12, 17, 13, 5, //
    0, 14, 15, 16, 0, //
    6, 0, 7, 0, 8,
];

pub struct Conv2dRd<B: Backend> {
    /// 3×3 base kernel applied with padding 2.
    conv: Conv2d<B>,
    theta: f64,
}

impl<B: Backend> Conv2dRd<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        use_bias: bool,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        Ok(Conv2dRd {
            conv: new_conv3(in_channels, out_channels, 2, use_bias, dtype, device)?,
            theta: 1.0,
        })
    }

    pub fn with_theta(mut self, theta: f64) -> Self {
        self.theta = theta;
        self
    }

    pub fn conv(&self) -> &Conv2d<B> {
        &self.conv
    }

    /// Derived 5×5 kernel and the bias.
    pub fn get_weight(&self) -> Result<(Tensor<B>, Option<Tensor<B>>)> {
        let taps = flat_taps(self.conv.weight())?;
        let ring = taps.narrow(2, 1, 8)?;
        let inner = ring.affine(-self.theta, 0.0)?;
        let centre = taps.narrow(2, 0, 1)?.affine(1.0 - self.theta, 0.0)?;
        let source = Tensor::cat(&[zero_tap(&taps)?, ring, inner, centre], 2)?;
        let kernel = gather_taps(&source, &RADIAL_INDEX)?;
        Ok((square(kernel, 5)?, self.conv.bias().cloned()))
    }
}

impl<B: Backend> Module<B> for Conv2dRd<B> {
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        if self.theta.abs() < 1e-8 {
            return self.conv.forward(x);
        }
        let (w, b) = self.get_weight()?;
        self.conv.apply_kernel(x, &w, b.as_ref())
    }
    fn parameters(&self) -> Vec<Tensor<B>> {
        self.conv.parameters()
    }
    fn named_parameters(&self) -> Vec<(String, Tensor<B>)> {
        self.conv.named_parameters()
    }
}

// Horizontal / vertical difference

/// Source layout: 0 = zero, 1..=3 = w, 4..=6 = −w.
const HORIZONTAL_INDEX: [usize; 9] = [1, 0, 4, 2, 0, 5, 3, 0, 6];
const VERTICAL_INDEX: [usize; 9] = [1, 2, 3, 0, 0, 0, 4, 5, 6];

fn signed_source<B: Backend>(w: &Tensor<B>) -> Result<Tensor<B>> {
    Tensor::cat(&[zero_tap(w)?, w.clone(), w.neg()?], 2)
}

/// Horizontal-gradient kernel from a 1-D base kernel `[o, i, 3]`.
pub struct Conv2dHd<B: Backend> {
    conv: Conv1d<B>,
}

impl<B: Backend> Conv2dHd<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        use_bias: bool,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        Ok(Conv2dHd {
            conv: Conv1d::new(in_channels, out_channels, 3, 1, 1, 1, use_bias, dtype, device)?,
        })
    }

    pub fn get_weight(&self) -> Result<(Tensor<B>, Option<Tensor<B>>)> {
        let kernel = gather_taps(&signed_source(self.conv.weight())?, &HORIZONTAL_INDEX)?;
        Ok((square(kernel, 3)?, self.conv.bias().cloned()))
    }
}

impl<B: Backend> Module<B> for Conv2dHd<B> {
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let (w, b) = self.get_weight()?;
        x.conv2d(&w, b.as_ref(), [1, 1], [1, 1], 1)
    }
    fn parameters(&self) -> Vec<Tensor<B>> {
        self.conv.parameters()
    }
    fn named_parameters(&self) -> Vec<(String, Tensor<B>)> {
        named(self.conv.weight(), self.conv.bias())
    }
}

/// Vertical-gradient kernel from a 1-D base kernel `[o, i, 3]`.
pub struct Conv2dVd<B: Backend> {
    conv: Conv1d<B>,
}

impl<B: Backend> Conv2dVd<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        use_bias: bool,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        Ok(Conv2dVd {
            conv: Conv1d::new(in_channels, out_channels, 3, 1, 1, 1, use_bias, dtype, device)?,
        })
    }

    pub fn get_weight(&self) -> Result<(Tensor<B>, Option<Tensor<B>>)> {
        let kernel = gather_taps(&signed_source(self.conv.weight())?, &VERTICAL_INDEX)?;
        Ok((square(kernel, 3)?, self.conv.bias().cloned()))
    }
}

impl<B: Backend> Module<B> for Conv2dVd<B> {
    fn forward(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        let (w, b) = self.get_weight()?;
        x.conv2d(&w, b.as_ref(), [1, 1], [1, 1], 1)
    }
    fn parameters(&self) -> Vec<Tensor<B>> {
        self.conv.parameters()
    }
    fn named_parameters(&self) -> Vec<(String, Tensor<B>)> {
        named(self.conv.weight(), self.conv.bias())
    }
}
