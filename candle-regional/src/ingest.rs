//! Mask ingestion: decode a flattened, colour-labeled mask image into one binary
//! tensor per drawn region plus the complementary base-region mask.

use candle::{Device, Result, Tensor};
use image::{DynamicImage, Rgb, RgbImage};
use rayon::prelude::*;

use crate::config::RegionalConfig;
use crate::session::ColourSession;

/// Binary mask of one active region.
#[derive(Debug, Clone)]
pub struct RegionMask {
    /// Region id, 1-based; also the index of the region's conditioning chunk.
    pub id: usize,
    /// Mask of shape `(1, height, width)` holding 0 or 1.
    pub mask: Tensor,
}

/// Masks of every active region of one generation request, plus the base mask.
///
/// Built once per request and read by every hooked attention layer.
#[derive(Debug, Clone)]
pub struct RegionMaskSet {
    regions: Vec<RegionMask>,
    base: Option<Tensor>,
    height: usize,
    width: usize,
}

impl RegionMaskSet {
    /// A set without regions; the compositor passes straight through.
    pub fn empty() -> Self {
        Self {
            regions: Vec::new(),
            base: None,
            height: 0,
            width: 0,
        }
    }

    /// Active regions in ascending id order.
    pub fn regions(&self) -> &[RegionMask] {
        &self.regions
    }

    pub fn region(&self, id: usize) -> Option<&Tensor> {
        self.regions.iter().find(|r| r.id == id).map(|r| &r.mask)
    }

    pub fn active_ids(&self) -> Vec<usize> {
        self.regions.iter().map(|r| r.id).collect()
    }

    /// Pixels not covered by any region, present whenever a region is.
    pub fn base(&self) -> Option<&Tensor> {
        self.base.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Mask resolution as `(height, width)`.
    pub fn dims(&self) -> (usize, usize) {
        (self.height, self.width)
    }
}

fn within_tolerance(pixel: &Rgb<u8>, colour: &Rgb<u8>, tolerance: u8) -> bool {
    pixel
        .0
        .iter()
        .zip(colour.0.iter())
        .all(|(&p, &c)| p.abs_diff(c) < tolerance)
}

/// Decode `image` into region masks for ids `1..=region_count`.
///
/// A pixel belongs to region `id` when every channel is within the configured
/// tolerance of the palette colour of `id`. Regions without any matching pixel are
/// skipped, so the active ids may be sparse. Active regions are recorded in the
/// session registry. The base mask is the complement of the union of all active
/// region masks.
pub fn setup_masks(
    session: &mut ColourSession,
    image: &RgbImage,
    region_count: usize,
    config: &RegionalConfig,
    device: &Device,
) -> Result<RegionMaskSet> {
    let _enter = tracing::span!(tracing::Level::TRACE, "setup-masks").entered();
    if region_count > config.max_region_id {
        candle::bail!(
            "{region_count} regions requested, region ids above {} are unsupported",
            config.max_region_id
        )
    }

    let palette = session
        .colours((region_count + 1).max(config.min_colours))
        .clone();
    let (width, height) = (image.width() as usize, image.height() as usize);
    let tolerance = config.match_tolerance;

    let detected: Vec<(usize, Rgb<u8>, Vec<u8>)> = (1..=region_count)
        .into_par_iter()
        .filter_map(|id| {
            let colour = palette.get(id)?;
            let hits: Vec<u8> = image
                .pixels()
                .map(|p| within_tolerance(p, &colour, tolerance) as u8)
                .collect();
            hits.iter().any(|&h| h != 0).then_some((id, colour, hits))
        })
        .collect();

    let dtype = config.mask_dtype();
    let mut covered = vec![false; width * height];
    let mut regions = Vec::with_capacity(detected.len());
    for (id, colour, hits) in detected {
        session.record_used(id, colour);
        for (c, &h) in covered.iter_mut().zip(hits.iter()) {
            *c |= h != 0;
        }
        let data: Vec<f32> = hits.into_iter().map(f32::from).collect();
        let mask = Tensor::from_vec(data, (1, height, width), device)?.to_dtype(dtype)?;
        regions.push(RegionMask { id, mask });
    }

    let base = if regions.is_empty() {
        None
    } else {
        let data: Vec<f32> = covered.iter().map(|&c| if c { 0.0 } else { 1.0 }).collect();
        Some(Tensor::from_vec(data, (1, height, width), device)?.to_dtype(dtype)?)
    };

    tracing::debug!(
        region_count,
        active = regions.len(),
        height,
        width,
        "ingested region masks"
    );
    Ok(RegionMaskSet {
        regions,
        base,
        height,
        width,
    })
}

/// Like [`setup_masks`], accepting any decoded image; greyscale input is expanded to RGB.
pub fn setup_masks_dynamic(
    session: &mut ColourSession,
    image: &DynamicImage,
    region_count: usize,
    config: &RegionalConfig,
    device: &Device,
) -> Result<RegionMaskSet> {
    setup_masks(session, &image.to_rgb8(), region_count, config, device)
}
