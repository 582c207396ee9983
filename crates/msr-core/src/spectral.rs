// Spectral kernels — 2-D real FFT and its inverse on host buffers
//
// Layout of a spectrum: `[.., M, N/2 + 1, 2]` with the trailing axis holding
// (re, im). The forward transform is unnormalised; the inverse divides by
// M·N, so `irfft2(rfft2(x), N) == x`.
//
// Both transforms are linear maps, so their adjoints give the gradients:
//
//   rfft2ᵀ(G)   = Re( F_Nᴴ · zero_pad_N( F_Mᴴ · G ) )
//   irfft2ᵀ(g)  = rfft2(g) · w_k / (M·N)
//
// with w_k = 1 for the DC column (and the Nyquist column when N is even),
// 2 for every other column.

use num_complex::Complex;
use rustfft::FftPlanner;

use crate::error::{Error, Result};

/// Number of complex columns kept by a real FFT of length `n`.
pub fn half_len(n: usize) -> usize {
    n / 2 + 1
}

fn to_complex(interleaved: &[f64]) -> Vec<Complex<f64>> {
    interleaved
        .chunks_exact(2)
        .map(|c| Complex::new(c[0], c[1]))
        .collect()
}

fn to_interleaved(values: &[Complex<f64>]) -> Vec<f64> {
    values.iter().flat_map(|c| [c.re, c.im]).collect()
}

// FFT along the M axis of a `[batch, m, cols]` complex buffer.
fn fft_columns(
    planner: &mut FftPlanner<f64>,
    data: &mut [Complex<f64>],
    batch: usize,
    m: usize,
    cols: usize,
    inverse: bool,
) {
    if m <= 1 {
        return;
    }
    let fft = if inverse {
        planner.plan_fft_inverse(m)
    } else {
        planner.plan_fft_forward(m)
    };
    let mut column = vec![Complex::new(0.0, 0.0); m];
    for b in 0..batch {
        let base = b * m * cols;
        for k in 0..cols {
            for (i, slot) in column.iter_mut().enumerate() {
                *slot = data[base + i * cols + k];
            }
            fft.process(&mut column);
            for (i, v) in column.iter().enumerate() {
                data[base + i * cols + k] = *v;
            }
        }
    }
}

/// Forward real 2-D FFT of `[batch, m, n]` real data.
pub fn rfft2(data: &[f64], batch: usize, m: usize, n: usize) -> Vec<f64> {
    let half = half_len(n);
    let mut planner = FftPlanner::<f64>::new();
    let row_fft = planner.plan_fft_forward(n);

    let mut rows: Vec<Complex<f64>> = data.iter().map(|&v| Complex::new(v, 0.0)).collect();
    if n > 0 && !rows.is_empty() {
        row_fft.process(&mut rows);
    }

    let mut spectrum = Vec::with_capacity(batch * m * half);
    for row in rows.chunks_exact(n.max(1)) {
        spectrum.extend_from_slice(&row[..half.min(row.len())]);
    }
    fft_columns(&mut planner, &mut spectrum, batch, m, half, false);
    to_interleaved(&spectrum)
}

/// Inverse of [`rfft2`]; `data` is `[batch, m, width/2 + 1, 2]`.
pub fn irfft2(data: &[f64], batch: usize, m: usize, width: usize) -> Result<Vec<f64>> {
    let half = half_len(width);
    if data.len() != batch * m * half * 2 {
        return Err(Error::msg(format!(
            "irfft2: spectrum of {} values does not match {} x {} x {} x 2",
            data.len(),
            batch,
            m,
            half
        )));
    }
    let mut planner = FftPlanner::<f64>::new();
    let mut spectrum = to_complex(data);
    fft_columns(&mut planner, &mut spectrum, batch, m, half, true);

    // Hermitian completion of each row, then a full inverse FFT.
    let mut full = vec![Complex::new(0.0, 0.0); batch * m * width];
    for (src, dst) in spectrum.chunks_exact(half).zip(full.chunks_exact_mut(width)) {
        dst[0] = Complex::new(src[0].re, 0.0);
        for k in 1..half {
            if 2 * k == width {
                dst[k] = Complex::new(src[k].re, 0.0);
            } else {
                dst[k] = src[k];
                dst[width - k] = src[k].conj();
            }
        }
    }
    if width > 0 && !full.is_empty() {
        planner.plan_fft_inverse(width).process(&mut full);
    }

    let scale = 1.0 / (m * width) as f64;
    Ok(full.iter().map(|c| c.re * scale).collect())
}

/// Gradient of [`rfft2`] w.r.t. its real input.
pub fn rfft2_backward(grad: &[f64], batch: usize, m: usize, n: usize) -> Vec<f64> {
    let half = half_len(n);
    let mut planner = FftPlanner::<f64>::new();
    let mut g = to_complex(grad);
    fft_columns(&mut planner, &mut g, batch, m, half, true);

    let mut padded = vec![Complex::new(0.0, 0.0); batch * m * n];
    for (src, dst) in g.chunks_exact(half).zip(padded.chunks_exact_mut(n)) {
        dst[..half].copy_from_slice(src);
    }
    if n > 0 && !padded.is_empty() {
        planner.plan_fft_inverse(n).process(&mut padded);
    }
    padded.iter().map(|c| c.re).collect()
}

/// Gradient of [`irfft2`] w.r.t. its spectrum input.
pub fn irfft2_backward(grad: &[f64], batch: usize, m: usize, width: usize) -> Vec<f64> {
    let half = half_len(width);
    let mut out = rfft2(grad, batch, m, width);
    let scale = 1.0 / (m * width) as f64;
    for (i, pair) in out.chunks_exact_mut(2).enumerate() {
        let k = i % half;
        let w = if k == 0 || 2 * k == width { 1.0 } else { 2.0 };
        pair[0] *= w * scale;
        pair[1] *= w * scale;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: &[f64], b: &[f64]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 1e-9, "{} vs {}", x, y);
        }
    }

    #[test]
    fn test_dc_term_is_sum() {
        let x = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let s = rfft2(&x, 1, 2, 3);
        assert_eq!(s.len(), 2 * 2 * 2);
        assert!((s[0] - 21.0).abs() < 1e-12);
        assert!(s[1].abs() < 1e-12);
    }

    #[test]
    fn test_roundtrip_even_and_odd_width() {
        for &(m, n) in &[(8usize, 8usize), (4, 5), (3, 6)] {
            let x: Vec<f64> = (0..2 * m * n).map(|i| ((i * 7) % 11) as f64 - 5.0).collect();
            let s = rfft2(&x, 2, m, n);
            let back = irfft2(&s, 2, m, n).unwrap();
            assert_close(&back, &x);
        }
    }

    #[test]
    fn test_rfft2_adjoint_identity() {
        // <rfft2(x), G> == <x, rfft2ᵀ(G)>
        let (m, n) = (4, 6);
        let x: Vec<f64> = (0..m * n).map(|i| (i as f64 * 0.37).sin()).collect();
        let g: Vec<f64> = (0..m * half_len(n) * 2)
            .map(|i| (i as f64 * 0.91).cos())
            .collect();
        let lhs: f64 = rfft2(&x, 1, m, n).iter().zip(&g).map(|(a, b)| a * b).sum();
        let rhs: f64 = x
            .iter()
            .zip(rfft2_backward(&g, 1, m, n))
            .map(|(a, b)| a * b)
            .sum();
        assert!((lhs - rhs).abs() < 1e-9);
    }

    #[test]
    fn test_wrong_spectrum_len_is_error() {
        assert!(irfft2(&[0.0; 10], 1, 2, 8).is_err());
    }
}
