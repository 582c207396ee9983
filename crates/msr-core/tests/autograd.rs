// Autograd tests — analytic gradients against central finite differences

use msr_core::{DType, Result, Tensor};
use msr_cpu::{CpuBackend, CpuDevice};

type T = Tensor<CpuBackend>;

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() < tol
}

fn assert_vec_approx(got: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(got.len(), expected.len(), "length mismatch");
    for (i, (g, e)) in got.iter().zip(expected.iter()).enumerate() {
        assert!(
            approx_eq(*g, *e, tol),
            "index {}: got {} expected {} (tol {})",
            i,
            g,
            e,
            tol
        );
    }
}

fn var(data: &[f64], shape: &[usize]) -> Result<T> {
    Ok(T::from_f64_slice(data, shape, DType::F64, &CpuDevice)?.set_variable())
}

fn seeded(n: usize, seed: f64) -> Vec<f64> {
    (0..n).map(|i| ((i as f64 + 1.0) * seed).sin()).collect()
}

// Central differences of `f` around `data`.
fn numeric_grad(
    f: impl Fn(&T) -> Result<T>,
    data: &[f64],
    shape: &[usize],
) -> Result<Vec<f64>> {
    let eps = 1e-5;
    let mut grad = Vec::with_capacity(data.len());
    for i in 0..data.len() {
        let mut plus = data.to_vec();
        let mut minus = data.to_vec();
        plus[i] += eps;
        minus[i] -= eps;
        let fp = f(&T::from_f64_slice(&plus, shape, DType::F64, &CpuDevice)?)?.to_scalar_f64()?;
        let fm = f(&T::from_f64_slice(&minus, shape, DType::F64, &CpuDevice)?)?.to_scalar_f64()?;
        grad.push((fp - fm) / (2.0 * eps));
    }
    Ok(grad)
}

// Compare the backward gradient of a scalar function with finite differences.
fn check_grad(f: impl Fn(&T) -> Result<T>, data: &[f64], shape: &[usize], tol: f64) -> Result<()> {
    let x = var(data, shape)?;
    let loss = f(&x)?;
    let grads = loss.backward()?;
    let analytic = grads.get(&x).expect("no gradient for input").to_f64_vec()?;
    let numeric = numeric_grad(&f, data, shape)?;
    assert_vec_approx(&analytic, &numeric, tol);
    Ok(())
}

#[test]
fn test_mul_broadcast_grad_reduces() -> Result<()> {
    let a = var(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3])?;
    let b = var(&[1.0, 1.0, 1.0], &[3])?;
    let grads = a.mul(&b)?.sum_all()?.backward()?;
    assert_eq!(grads.get(&b).unwrap().dims(), &[3]);
    assert_eq!(grads.get(&b).unwrap().to_f64_vec()?, vec![5.0, 7.0, 9.0]);
    assert_eq!(grads.get(&a).unwrap().to_f64_vec()?, vec![1.0; 6]);
    Ok(())
}

#[test]
fn test_reused_tensor_accumulates() -> Result<()> {
    let a = var(&[3.0], &[1])?;
    let grads = a.mul(&a)?.sum_all()?.backward()?;
    assert_eq!(grads.get(&a).unwrap().to_f64_vec()?, vec![6.0]);
    Ok(())
}

#[test]
fn test_backward_requires_scalar() -> Result<()> {
    let a = var(&[1.0, 2.0], &[2])?;
    assert!(a.relu()?.backward().is_err());
    Ok(())
}

#[test]
fn test_unary_chain_grad() -> Result<()> {
    let data = seeded(6, 0.7);
    check_grad(
        |x| {
            x.gelu()?
                .mul(&x.sigmoid()?)?
                .add(&x.tanh()?.square()?)?
                .add(&x.abs()?.affine(0.5, 2.0)?.sqrt()?)?
                .sum_all()
        },
        &data,
        &[2, 3],
        1e-4,
    )
}

#[test]
fn test_softmax_grad() -> Result<()> {
    let data = seeded(8, 1.3);
    let w = T::from_f64_slice(&seeded(8, 0.4), (2, 4), DType::F64, &CpuDevice)?;
    check_grad(|x| x.softmax(1)?.mul(&w)?.sum_all(), &data, &[2, 4], 1e-6)
}

#[test]
fn test_mean_and_sqrt_normalisation_grad() -> Result<()> {
    // (x - mean) / sqrt(var + eps), the shape of a per-sample norm
    let data = seeded(12, 0.9);
    let w = T::from_f64_slice(&seeded(12, 2.1), (2, 1, 2, 3), DType::F64, &CpuDevice)?;
    check_grad(
        |x| {
            let mean = x.mean_dims(&[1, 2, 3], true)?;
            let centered = x.sub(&mean)?;
            let std = centered
                .square()?
                .mean_dims(&[1, 2, 3], true)?
                .affine(1.0, 1e-5)?
                .sqrt()?;
            centered.div(&std)?.mul(&w)?.sum_all()
        },
        &data,
        &[2, 1, 2, 3],
        1e-5,
    )
}

#[test]
fn test_max_grad_splits_ties() -> Result<()> {
    let x = var(&[1.0, 5.0, 5.0, 2.0], &[1, 4])?;
    let grads = x.max(1, false)?.sum_all()?.backward()?;
    assert_eq!(grads.get(&x).unwrap().to_f64_vec()?, vec![0.0, 0.5, 0.5, 0.0]);
    Ok(())
}

#[test]
fn test_matmul_batched_grad() -> Result<()> {
    let rhs = T::from_f64_slice(&seeded(6, 0.3), (3, 2), DType::F64, &CpuDevice)?;
    check_grad(
        |x| x.matmul(&rhs)?.square()?.sum_all(),
        &seeded(12, 1.1),
        &[2, 2, 3],
        1e-5,
    )?;
    // gradient w.r.t. the broadcast rhs sums over the batch
    let lhs = T::from_f64_slice(&seeded(12, 1.1), (2, 2, 3), DType::F64, &CpuDevice)?;
    check_grad(
        |w| lhs.matmul(w)?.square()?.sum_all(),
        &seeded(6, 0.3),
        &[3, 2],
        1e-5,
    )
}

#[test]
fn test_view_grads() -> Result<()> {
    let w = T::from_f64_slice(&seeded(24, 0.5), (4, 3, 2), DType::F64, &CpuDevice)?;
    check_grad(
        |x| {
            x.permute(&[2, 0, 1])?
                .reshape((4, 3, 2))?
                .mul(&w)?
                .narrow(1, 1, 2)?
                .sum_all()
        },
        &seeded(24, 0.8),
        &[2, 4, 3],
        1e-6,
    )
}

#[test]
fn test_expand_grad() -> Result<()> {
    let w = T::from_f64_slice(&seeded(12, 0.5), (2, 3, 2), DType::F64, &CpuDevice)?;
    check_grad(
        |x| x.expand(vec![2, 3, 2])?.mul(&w)?.sum_all(),
        &seeded(3, 0.8),
        &[3, 1],
        1e-6,
    )
}

#[test]
fn test_conv2d_grouped_grads() -> Result<()> {
    let x_data = seeded(2 * 4 * 5 * 5, 0.37);
    let w_data = seeded(4 * 2 * 3 * 3, 0.71);
    let b_data = seeded(4, 1.9);
    let weight = T::from_f64_slice(&w_data, (4, 2, 3, 3), DType::F64, &CpuDevice)?;
    let bias = T::from_f64_slice(&b_data, 4, DType::F64, &CpuDevice)?;
    let input = T::from_f64_slice(&x_data, (2, 4, 5, 5), DType::F64, &CpuDevice)?;

    check_grad(
        |x| x.conv2d(&weight, Some(&bias), [2, 1], [1, 1], 2)?.square()?.sum_all(),
        &x_data,
        &[2, 4, 5, 5],
        1e-4,
    )?;
    check_grad(
        |w| input.conv2d(w, Some(&bias), [2, 1], [1, 1], 2)?.square()?.sum_all(),
        &w_data,
        &[4, 2, 3, 3],
        1e-4,
    )?;
    check_grad(
        |b| input.conv2d(&weight, Some(b), [2, 1], [1, 1], 2)?.square()?.sum_all(),
        &b_data,
        &[4],
        1e-4,
    )
}

#[test]
fn test_pad_reflect_grad() -> Result<()> {
    let w = T::from_f64_slice(&seeded(6 * 7, 0.9), (1, 1, 6, 7), DType::F64, &CpuDevice)?;
    check_grad(
        |x| x.pad_reflect([2, 1, 1, 2])?.mul(&w)?.sum_all(),
        &seeded(12, 0.4),
        &[1, 1, 3, 4],
        1e-6,
    )
}

#[test]
fn test_pixel_shuffle_and_cat_grad() -> Result<()> {
    let w = T::from_f64_slice(&seeded(2 * 4 * 4, 0.6), (1, 2, 4, 4), DType::F64, &CpuDevice)?;
    check_grad(
        |x| {
            let y = x.pixel_shuffle(2)?;
            T::cat(&[y.clone(), y.affine(2.0, 0.0)?], 1)?.mul(&w)?.sum_all()
        },
        &seeded(16, 0.3),
        &[1, 4, 2, 2],
        1e-6,
    )
}

#[test]
fn test_spectral_grads() -> Result<()> {
    // odd and even widths exercise the Nyquist weighting
    for &(m, n) in &[(4usize, 6usize), (3, 5)] {
        let filter = T::from_f64_slice(
            &seeded(m * (n / 2 + 1) * 2, 0.45),
            (m, n / 2 + 1, 2),
            DType::F64,
            &CpuDevice,
        )?;
        let w = T::from_f64_slice(&seeded(m * n, 1.7), (m, n), DType::F64, &CpuDevice)?;
        check_grad(
            |x| x.rfft2()?.complex_mul(&filter)?.irfft2(n)?.mul(&w)?.sum_all(),
            &seeded(m * n, 0.77),
            &[m, n],
            1e-6,
        )?;
    }
    Ok(())
}

#[test]
fn test_irfft2_grad_wrt_spectrum() -> Result<()> {
    let w = T::from_f64_slice(&seeded(16, 1.7), (4, 4), DType::F64, &CpuDevice)?;
    check_grad(
        |s| s.irfft2(4)?.mul(&w)?.sum_all(),
        &seeded(4 * 3 * 2, 0.5),
        &[4, 3, 2],
        1e-6,
    )
}

#[test]
fn test_to_dtype_grad_flows() -> Result<()> {
    let x = var(&[1.0, 2.0], &[2])?;
    let grads = x.to_dtype(DType::F32)?.square()?.sum_all()?.backward()?;
    let g = grads.get(&x).unwrap();
    assert_eq!(g.dtype(), DType::F64);
    assert_vec_approx(&g.to_f64_vec()?, &[2.0, 4.0], 1e-6);
    Ok(())
}
