// nn::init — parameter initialisation
//
// Two families, mirroring `torch.nn.init`:
//
//   fresh tensors     uniform, normal, constant, zeros, ones, trunc_normal
//   in place          uniform_, trunc_normal_, constant_
//
// The in-place forms overwrite the storage shared by every clone of the
// parameter (`Tensor::update_data_inplace`), so a layer built with default
// init can be re-initialised after construction without being rebuilt.
//
// TRUNCATED NORMAL:
//
//   Samples N(mean, std) and rejects anything outside the absolute bounds
//   [a, b] (default [-2, 2], as timm's trunc_normal_). Sampling happens on
//   the host with rand_distr and is then written into the tensor's dtype.

use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};

use msr_core::backend::Backend;
use msr_core::dtype::DType;
use msr_core::error::{Error, Result};
use msr_core::shape::Shape;
use msr_core::tensor::Tensor;

/// Default lower bound of [`trunc_normal`].
pub const TRUNC_LOW: f64 = -2.0;
/// Default upper bound of [`trunc_normal`].
pub const TRUNC_HIGH: f64 = 2.0;

/// Give up rejecting after this many draws for one element and clamp.
const MAX_REJECTIONS: usize = 1000;

/// Compute (fan_in, fan_out) from a shape.
///
/// - 1-D: fan_in = fan_out = dims[0]
/// - 2-D: fan_in = dims[1], fan_out = dims[0]
/// - 3-D+: convolution layout `[out, in, k...]`, both fans multiplied by
///   the receptive field `product(dims[2..])`
pub fn compute_fans(shape: &Shape) -> (f64, f64) {
    let dims = shape.dims();
    match dims.len() {
        0 => (1.0, 1.0),
        1 => (dims[0] as f64, dims[0] as f64),
        2 => (dims[1] as f64, dims[0] as f64),
        _ => {
            let receptive_field: usize = dims[2..].iter().product();
            let fan_in = dims[1] as f64 * receptive_field as f64;
            let fan_out = dims[0] as f64 * receptive_field as f64;
            (fan_in, fan_out)
        }
    }
}

/// Draw `n` samples of N(mean, std) restricted to `[low, high]`.
pub fn sample_trunc_normal<R: Rng + ?Sized>(
    rng: &mut R,
    n: usize,
    mean: f64,
    std: f64,
    low: f64,
    high: f64,
) -> Result<Vec<f64>> {
    if low >= high {
        return Err(Error::msg(format!(
            "trunc_normal: empty interval [{low}, {high}]"
        )));
    }
    let normal = Normal::new(mean, std)
        .map_err(|e| Error::msg(format!("trunc_normal: std {std}: {e}")))?;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let mut v = normal.sample(rng);
        let mut tries = 1;
        while !(low..=high).contains(&v) && tries < MAX_REJECTIONS {
            v = normal.sample(rng);
            tries += 1;
        }
        out.push(v.clamp(low, high));
    }
    Ok(out)
}

/// Initialize a tensor from U(low, high).
pub fn uniform<B: Backend>(
    shape: impl Into<Shape>,
    low: f64,
    high: f64,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    let t = Tensor::<B>::rand(shape, dtype, device)?
        .affine(high - low, low)?
        .set_variable();
    Ok(t)
}

/// Initialize a tensor from N(mean, std).
pub fn normal<B: Backend>(
    shape: impl Into<Shape>,
    mean: f64,
    std: f64,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    let t = Tensor::<B>::randn(shape, dtype, device)?
        .affine(std, mean)?
        .set_variable();
    Ok(t)
}

/// Truncated normal with the default bounds `[-2, 2]`.
pub fn trunc_normal<B: Backend>(
    shape: impl Into<Shape>,
    mean: f64,
    std: f64,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    let shape = shape.into();
    let data = sample_trunc_normal(
        &mut rand::thread_rng(),
        shape.elem_count(),
        mean,
        std,
        TRUNC_LOW,
        TRUNC_HIGH,
    )?;
    Ok(Tensor::<B>::from_f64_slice(&data, shape, dtype, device)?.set_variable())
}

pub fn constant<B: Backend>(
    shape: impl Into<Shape>,
    val: f64,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    Ok(Tensor::<B>::full(shape, val, dtype, device)?.set_variable())
}

pub fn zeros<B: Backend>(
    shape: impl Into<Shape>,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    Ok(Tensor::<B>::zeros(shape, dtype, device)?.set_variable())
}

pub fn ones<B: Backend>(
    shape: impl Into<Shape>,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    Ok(Tensor::<B>::ones(shape, dtype, device)?.set_variable())
}

// In place

/// Overwrite `t` with U(low, high) samples.
pub fn uniform_<B: Backend>(t: &Tensor<B>, low: f64, high: f64) -> Result<()> {
    if low >= high {
        return Err(Error::msg(format!("uniform_: empty interval [{low}, {high}]")));
    }
    let dist = Uniform::new(low, high);
    let mut rng = rand::thread_rng();
    let data: Vec<f64> = (0..t.elem_count()).map(|_| dist.sample(&mut rng)).collect();
    t.update_data_inplace(&data)
}

/// Overwrite `t` with truncated-normal samples in `[-2, 2]`.
pub fn trunc_normal_<B: Backend>(t: &Tensor<B>, mean: f64, std: f64) -> Result<()> {
    let data = sample_trunc_normal(
        &mut rand::thread_rng(),
        t.elem_count(),
        mean,
        std,
        TRUNC_LOW,
        TRUNC_HIGH,
    )?;
    t.update_data_inplace(&data)
}

/// Overwrite every element of `t` with `val`.
pub fn constant_<B: Backend>(t: &Tensor<B>, val: f64) -> Result<()> {
    t.update_data_inplace(&vec![val; t.elem_count()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use msr_cpu::{CpuBackend, CpuDevice};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    type T = Tensor<CpuBackend>;

    #[test]
    fn test_compute_fans_conv_layout() {
        assert_eq!(compute_fans(&Shape::from((8, 4, 3, 3))), (36.0, 72.0));
        assert_eq!(compute_fans(&Shape::from((5, 2))), (2.0, 5.0));
        assert_eq!(compute_fans(&Shape::from(7)), (7.0, 7.0));
    }

    #[test]
    fn test_trunc_normal_respects_bounds() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(7);
        let v = sample_trunc_normal(&mut rng, 5000, 0.0, 1.5, -1.0, 1.0)?;
        assert!(v.iter().all(|x| (-1.0..=1.0).contains(x)));
        Ok(())
    }

    #[test]
    fn test_trunc_normal_statistics() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(11);
        let v = sample_trunc_normal(&mut rng, 20_000, 0.0, 0.02, TRUNC_LOW, TRUNC_HIGH)?;
        let mean = v.iter().sum::<f64>() / v.len() as f64;
        let var = v.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / v.len() as f64;
        assert!(mean.abs() < 1e-3, "mean {mean}");
        assert!((var.sqrt() - 0.02).abs() < 1e-3, "std {}", var.sqrt());
        Ok(())
    }

    #[test]
    fn test_trunc_normal_rejects_empty_interval() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(sample_trunc_normal(&mut rng, 1, 0.0, 1.0, 1.0, 1.0).is_err());
    }

    #[test]
    fn test_in_place_init_is_seen_by_clones() -> Result<()> {
        let dev = CpuDevice;
        let p = zeros::<CpuBackend>((3, 4), DType::F64, &dev)?;
        let held_by_layer = p.clone();
        constant_(&p, 1.5)?;
        assert!(held_by_layer.to_f64_vec()?.iter().all(|&x| x == 1.5));

        trunc_normal_(&p, 0.0, 0.5)?;
        assert!(held_by_layer
            .to_f64_vec()?
            .iter()
            .all(|x| (TRUNC_LOW..=TRUNC_HIGH).contains(x)));
        assert!(held_by_layer.is_variable());
        Ok(())
    }

    #[test]
    fn test_uniform_bounds() -> Result<()> {
        let dev = CpuDevice;
        let t: T = uniform((16, 16), -0.25, 0.25, DType::F64, &dev)?;
        assert!(t.to_f64_vec()?.iter().all(|x| (-0.25..0.25).contains(x)));
        uniform_(&t, 1.0, 2.0)?;
        assert!(t.to_f64_vec()?.iter().all(|x| (1.0..2.0).contains(x)));
        Ok(())
    }

    #[test]
    fn test_fresh_initialisers() -> Result<()> {
        let dev = CpuDevice;
        let c: T = constant((2, 2), 7.0, DType::F64, &dev)?;
        assert_eq!(c.to_f64_vec()?, vec![7.0; 4]);
        let o: T = ones(3, DType::F64, &dev)?;
        assert_eq!(o.to_f64_vec()?, vec![1.0; 3]);
        let n: T = normal((4, 4), 1.0, 0.0, DType::F64, &dev)?;
        assert_eq!(n.to_f64_vec()?, vec![1.0; 16]);
        let t: T = trunc_normal((8, 8), 0.0, 0.02, DType::F64, &dev)?;
        assert_eq!(t.dims(), &[8, 8]);
        Ok(())
    }
}
