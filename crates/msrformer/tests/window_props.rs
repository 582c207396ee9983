// Property tests for the window utilities

use msrformer::models::{get_relative_positions, window_partition, window_reverse};
use msrformer::prelude::*;
use proptest::prelude::*;

type T = CpuTensor;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Partitioning then reversing restores the grid exactly.
    #[test]
    fn prop_partition_reverse_roundtrip(
        b in 1usize..3,
        ws in 1usize..5,
        nh in 1usize..4,
        nw in 1usize..4,
        c in 1usize..4,
    ) {
        let (h, w) = (nh * ws, nw * ws);
        let x = T::randn((b, h, w, c), DType::F64, &CpuDevice).unwrap();
        let windows = window_partition(&x, ws).unwrap();
        prop_assert_eq!(windows.dims(), &[b * nh * nw, ws * ws, c]);
        let back = window_reverse(&windows, ws, h, w).unwrap();
        prop_assert_eq!(back.dims(), x.dims());
        prop_assert_eq!(back.to_f64_vec().unwrap(), x.to_f64_vec().unwrap());
    }

    /// Relative positions are antisymmetric with a zero diagonal.
    #[test]
    fn prop_relative_positions_antisymmetric(ws in 1usize..6) {
        let n = ws * ws;
        let rel = get_relative_positions::<CpuBackend>(ws, DType::F64, &CpuDevice)
            .unwrap()
            .to_f64_vec()
            .unwrap();
        for i in 0..n {
            for j in 0..n {
                for k in 0..2 {
                    let a = rel[(i * n + j) * 2 + k];
                    let b = rel[(j * n + i) * 2 + k];
                    prop_assert!((a + b).abs() < 1e-12);
                    if i == j {
                        prop_assert!(a.abs() < 1e-12);
                    }
                }
            }
        }
    }
}

#[test]
fn test_partition_order_is_row_major() -> Result<()> {
    // 1×4×4×1 grid of 0..16 split into 2×2 windows
    let data: Vec<f64> = (0..16).map(|v| v as f64).collect();
    let x = T::from_f64_slice(&data, (1, 4, 4, 1), DType::F64, &CpuDevice)?;
    let windows = window_partition(&x, 2)?.to_f64_vec()?;
    assert_eq!(
        windows,
        vec![
            0.0, 1.0, 4.0, 5.0, 2.0, 3.0, 6.0, 7.0, 8.0, 9.0, 12.0, 13.0, 10.0, 11.0, 14.0, 15.0
        ]
    );
    Ok(())
}

#[test]
fn test_reverse_rejects_bad_tiling() -> Result<()> {
    let windows = T::zeros((3, 4, 1), DType::F64, &CpuDevice)?;
    assert!(window_reverse(&windows, 2, 4, 4).is_err());
    Ok(())
}
