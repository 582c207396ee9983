// Integration tests for the MsrFormer network
//
// Shapes through the full network on awkward input sizes, and gradient flow
// from the restored image back to every trainable tensor.

use msrformer::config::NUM_STAGES;
use msrformer::prelude::*;

type T = CpuTensor;

fn tiny() -> MsrFormerConfig {
    MsrFormerConfig::default()
        .with_embed_dims([8, 16, 16, 16, 8])
        .with_mlp_ratios([2.0; NUM_STAGES])
        .with_depths([2, 2, 2, 1, 1])
        .with_num_heads([2, 2, 2, 1, 1])
        .with_attn_ratio([0.5, 0.5, 0.5, 0.0, 0.0])
}

#[test]
fn test_output_matches_input_size() -> Result<()> {
    let dev = CpuDevice;
    let model = MsrFormer::<CpuBackend>::new(&tiny(), DType::F64, &dev)?;
    for (h, w) in [(32, 32), (33, 30), (31, 37)] {
        let x = T::rand((1, 3, h, w), DType::F64, &dev)?;
        let y = model.forward(&x)?;
        assert_eq!(y.dims(), &[1, 3, h, w], "input {h}×{w}");
        assert!(y.to_f64_vec()?.iter().all(|v| v.is_finite()));
    }
    Ok(())
}

#[test]
fn test_batch_items_are_independent() -> Result<()> {
    let dev = CpuDevice;
    let model = MsrFormer::<CpuBackend>::new(&tiny(), DType::F64, &dev)?;
    let a = T::rand((1, 3, 32, 32), DType::F64, &dev)?;
    let b = T::rand((1, 3, 32, 32), DType::F64, &dev)?;
    let both = model.forward(&Tensor::cat(&[a.clone(), b], 0)?)?;
    let alone = model.forward(&a)?.to_f64_vec()?;
    let first = both.narrow(0, 0, 1)?.to_f64_vec()?;
    for (x, y) in alone.iter().zip(&first) {
        assert!((x - y).abs() < 1e-9);
    }
    Ok(())
}

#[test]
fn test_too_small_input_is_an_error() -> Result<()> {
    let dev = CpuDevice;
    let model = MsrFormer::<CpuBackend>::new(&tiny(), DType::F64, &dev)?;
    let x = T::rand((1, 3, 2, 2), DType::F64, &dev)?;
    assert!(model.forward(&x).is_err());
    Ok(())
}

#[test]
fn test_smallest_supported_input() -> Result<()> {
    let dev = CpuDevice;
    let model = MsrFormer::<CpuBackend>::new(&tiny(), DType::F64, &dev)?;
    // 24 → 6 at quarter resolution, below the shifted window pad
    for (h, w) in [(24, 24), (24, 25), (25, 24)] {
        let x = T::rand((1, 3, h, w), DType::F64, &dev)?;
        assert!(model.forward(&x).is_err(), "input {h}×{w}");
    }
    for side in 25..=29 {
        let x = T::rand((1, 3, side, side), DType::F64, &dev)?;
        assert_eq!(model.forward(&x)?.dims(), &[1, 3, side, side]);
    }
    Ok(())
}

#[test]
fn test_gradient_reaches_every_parameter() -> Result<()> {
    let dev = CpuDevice;
    // every block uses window attention and the depthwise conv, so every
    // parameter lies on the forward path
    let cfg = tiny().with_attn_ratio([1.0; NUM_STAGES]).with_mlp_norm(true);
    let model = MsrFormer::<CpuBackend>::new(&cfg, DType::F64, &dev)?;
    let x = T::rand((1, 3, 32, 32), DType::F64, &dev)?;
    let target = T::rand((1, 3, 32, 32), DType::F64, &dev)?;

    let loss = model.forward(&x)?.sub(&target)?.abs()?.mean_all()?;
    let grads = loss.backward()?;
    for (name, p) in model.named_parameters() {
        let g = grads.get(&p);
        assert!(g.is_some(), "no gradient for {name}");
        if let Some(g) = g {
            assert_eq!(g.dims(), p.dims(), "gradient shape of {name}");
            assert!(
                g.to_f64_vec()?.iter().all(|v| v.is_finite()),
                "non-finite gradient for {name}"
            );
        }
    }
    Ok(())
}

#[test]
fn test_full_conv_variant_runs() -> Result<()> {
    let dev = CpuDevice;
    let cfg = tiny()
        .with_conv_type([Some(ConvType::Conv); NUM_STAGES])
        .with_attn_loc(AttnLoc::Middle);
    let model = MsrFormer::<CpuBackend>::new(&cfg, DType::F64, &dev)?;
    let x = T::rand((2, 3, 32, 32), DType::F64, &dev)?;
    assert_eq!(model.forward(&x)?.dims(), &[2, 3, 32, 32]);
    Ok(())
}

#[test]
fn test_f32_forward() -> Result<()> {
    let dev = CpuDevice;
    let model = MsrFormer::<CpuBackend>::new(&tiny(), DType::F32, &dev)?;
    let x = T::rand((1, 3, 32, 32), DType::F32, &dev)?;
    let y = model.forward(&x)?;
    assert_eq!(y.dtype(), DType::F32);
    assert_eq!(y.dims(), &[1, 3, 32, 32]);
    Ok(())
}
