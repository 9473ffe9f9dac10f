#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use std::sync::Arc;

use candle::{test_device, DType, Device, IndexOp, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_regional::attention::{AttentionProcessor, CrossAttention};
use candle_regional::colours::BACKGROUND;
use candle_regional::compositor::{feature_resolution, RegionalAttention};
use candle_regional::config::RegionalConfig;
use candle_regional::ingest::{setup_masks, RegionMaskSet};
use candle_regional::session::ColourSession;
use image::RgbImage;

const TOKENS: usize = 77;

fn layer(dev: &Device) -> Result<CrossAttention> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
    CrossAttention::new(8, Some(6), 2, 4, vb)
}

fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
}

/// Compositor over an 8x8 generation whose mask is painted by `paint`.
fn compositor(
    dev: &Device,
    region_count: usize,
    paint: impl Fn(&mut ColourSession, &mut RgbImage),
) -> Result<RegionalAttention> {
    let mut session = ColourSession::new();
    let mut img = RgbImage::from_pixel(8, 8, BACKGROUND);
    paint(&mut session, &mut img);
    let masks = setup_masks(&mut session, &img, region_count, &RegionalConfig::default(), dev)?;
    Ok(RegionalAttention::new(Arc::new(masks), 8, 8))
}

fn pass_through_without_regions(dev: &Device) -> Result<()> {
    let attn = layer(dev)?;
    let xs = Tensor::randn(0f32, 1., (2, 64, 8), dev)?;
    let context = Tensor::randn(0f32, 1., (2, 3 * TOKENS, 6), dev)?;
    let regional = RegionalAttention::new(Arc::new(RegionMaskSet::empty()), 8, 8);
    let out = regional.forward(&attn, &xs, Some(&context), None)?;
    let expected = attn.forward_default(&xs, Some(&context), None)?;
    assert_eq!(out.dims(), &[2, 64, 8]);
    assert!(max_diff(&out, &expected)? < 1e-6);
    Ok(())
}

fn pass_through_when_inactive_or_single_chunk(dev: &Device) -> Result<()> {
    let attn = layer(dev)?;
    let xs = Tensor::randn(0f32, 1., (1, 64, 8), dev)?;
    let regional = compositor(dev, 1, |s, img| {
        let c = s.colour(1);
        img.pixels_mut().for_each(|p| *p = c)
    })?;

    let single = Tensor::randn(0f32, 1., (1, TOKENS, 6), dev)?;
    let out = regional.forward(&attn, &xs, Some(&single), None)?;
    let expected = attn.forward_default(&xs, Some(&single), None)?;
    assert!(max_diff(&out, &expected)? < 1e-6);

    let context = Tensor::randn(0f32, 1., (1, 2 * TOKENS, 6), dev)?;
    regional.set_active(false);
    let out = regional.forward(&attn, &xs, Some(&context), None)?;
    let expected = attn.forward_default(&xs, Some(&context), None)?;
    assert!(max_diff(&out, &expected)? < 1e-6);
    Ok(())
}

fn region_uses_its_chunk(dev: &Device) -> Result<()> {
    let attn = layer(dev)?;
    let xs = Tensor::randn(0f32, 1., (1, 64, 8), dev)?;
    let context = Tensor::randn(0f32, 1., (1, 2 * TOKENS, 6), dev)?;
    // Left half is region 1, right half stays background.
    let regional = compositor(dev, 1, |s, img| {
        let c = s.colour(1);
        for y in 0..8 {
            for x in 0..4 {
                img.put_pixel(x, y, c);
            }
        }
    })?;
    let out = regional.forward(&attn, &xs, Some(&context), None)?;
    let base = attn.forward_default(&xs, Some(&context.narrow(1, 0, TOKENS)?), None)?;
    let region = attn.forward_default(&xs, Some(&context.narrow(1, TOKENS, TOKENS)?), None)?;
    for token in 0..64 {
        let expected = if token % 8 < 4 { &region } else { &base };
        let diff = max_diff(&out.i((.., token))?, &expected.i((.., token))?)?;
        assert!(diff < 1e-5, "token {token} differs by {diff}");
    }
    Ok(())
}

fn missing_chunk_falls_back_to_base(dev: &Device) -> Result<()> {
    let attn = layer(dev)?;
    let xs = Tensor::randn(0f32, 1., (1, 64, 8), dev)?;
    let context = Tensor::randn(0f32, 1., (1, 2 * TOKENS, 6), dev)?;
    let regional = compositor(dev, 2, |s, img| {
        let c = s.colour(2);
        img.pixels_mut().for_each(|p| *p = c)
    })?;
    let out = regional.forward(&attn, &xs, Some(&context), None)?;
    let base = attn.forward_default(&xs, Some(&context.narrow(1, 0, TOKENS)?), None)?;
    assert!(max_diff(&out, &base)? < 1e-5);
    Ok(())
}

fn sparse_regions_use_their_chunks(dev: &Device) -> Result<()> {
    let attn = layer(dev)?;
    let xs = Tensor::randn(0f32, 1., (1, 64, 8), dev)?;
    let context = Tensor::randn(0f32, 1., (1, 4 * TOKENS, 6), dev)?;
    // Top rows are region 1, bottom rows region 3, the middle stays background.
    let regional = compositor(dev, 3, |s, img| {
        let (one, three) = (s.colour(1), s.colour(3));
        for x in 0..8 {
            for y in 0..3 {
                img.put_pixel(x, y, one);
            }
            for y in 5..8 {
                img.put_pixel(x, y, three);
            }
        }
    })?;
    assert_eq!(regional.masks().active_ids(), vec![1, 3]);

    let out = regional.forward(&attn, &xs, Some(&context), None)?;
    let chunk = |i: usize| context.narrow(1, i * TOKENS, TOKENS);
    let base = attn.forward_default(&xs, Some(&chunk(0)?), None)?;
    let first = attn.forward_default(&xs, Some(&chunk(1)?), None)?;
    let third = attn.forward_default(&xs, Some(&chunk(3)?), None)?;
    for token in 0..64 {
        let expected = match token / 8 {
            0..=2 => &first,
            5..=7 => &third,
            _ => &base,
        };
        let diff = max_diff(&out.i((.., token))?, &expected.i((.., token))?)?;
        assert!(diff < 1e-5, "token {token} differs by {diff}");
    }
    Ok(())
}

fn mismatched_resolution_is_fatal(dev: &Device) -> Result<()> {
    let attn = layer(dev)?;
    let xs = Tensor::randn(0f32, 1., (1, 60, 8), dev)?;
    let context = Tensor::randn(0f32, 1., (1, 2 * TOKENS, 6), dev)?;
    let regional = compositor(dev, 1, |s, img| img.put_pixel(0, 0, s.colour(1)))?;
    assert!(regional.forward(&attn, &xs, Some(&context), None).is_err());
    Ok(())
}

test_device!(
    pass_through_without_regions,
    pass_through_without_regions_cpu,
    pass_through_without_regions_gpu,
    pass_through_without_regions_metal
);
test_device!(
    pass_through_when_inactive_or_single_chunk,
    pass_through_when_inactive_or_single_chunk_cpu,
    pass_through_when_inactive_or_single_chunk_gpu,
    pass_through_when_inactive_or_single_chunk_metal
);
test_device!(
    region_uses_its_chunk,
    region_uses_its_chunk_cpu,
    region_uses_its_chunk_gpu,
    region_uses_its_chunk_metal
);
test_device!(
    missing_chunk_falls_back_to_base,
    missing_chunk_falls_back_to_base_cpu,
    missing_chunk_falls_back_to_base_gpu,
    missing_chunk_falls_back_to_base_metal
);
test_device!(
    sparse_regions_use_their_chunks,
    sparse_regions_use_their_chunks_cpu,
    sparse_regions_use_their_chunks_gpu,
    sparse_regions_use_their_chunks_metal
);
test_device!(
    mismatched_resolution_is_fatal,
    mismatched_resolution_is_fatal_cpu,
    mismatched_resolution_is_fatal_gpu,
    mismatched_resolution_is_fatal_metal
);

#[test]
fn resolution_per_depth() -> Result<()> {
    assert_eq!(feature_resolution(512, 512, 4096)?, (64, 64));
    assert_eq!(feature_resolution(512, 512, 64 * 64 / 4)?, (32, 32));
    assert_eq!(feature_resolution(512, 512, 64 * 64 / 16)?, (16, 16));
    assert_eq!(feature_resolution(768, 512, 96 * 64)?, (96, 64));
    Ok(())
}
