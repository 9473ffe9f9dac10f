//! Region codec: turns freehand strokes into colour-labeled canvases and recovers
//! binary region masks from them.

use std::collections::HashMap;

use candle::Result;
use image::{GrayImage, Luma, Rgb, RgbImage};

use crate::colours::{is_pure_tone, snap_to_palette, BACKGROUND};
use crate::config::{RegionalConfig, MAX_COLOUR_REGIONS};
use crate::contour::{approximate_polygon, arc_length, contour_area, fill_polygon, find_contours};
use crate::session::{ColourSession, LabeledCanvas};

/// Contours must enclose more than this many pixels per unit of perimeter to be filled.
const MIN_AREA_PER_PERIMETER: f64 = 1.5;

/// Douglas-Peucker tolerance as a fraction of the contour perimeter.
const SIMPLIFY_TOLERANCE: f64 = 0.0001;

/// Which label a stroke paints or a mask query selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionTarget {
    /// Erase to background when painting; "not claimed by any region" when querying.
    Background,
    Region(usize),
}

impl RegionTarget {
    /// Map an editor layer index, where any negative value selects the background.
    pub fn from_index(index: i64) -> Self {
        if index < 0 {
            Self::Background
        } else {
            Self::Region(index as usize)
        }
    }

    /// Target the editor should select after a commit. Stops advancing at `max_id`.
    pub fn next(self, max_id: usize) -> Self {
        match self {
            Self::Region(id) if id < max_id => Self::Region(id + 1),
            other => other,
        }
    }
}

/// Paints strokes onto labeled canvases and extracts masks from them.
#[derive(Debug, Clone)]
pub struct RegionCodec {
    max_region_id: usize,
    span: tracing::Span,
}

impl Default for RegionCodec {
    fn default() -> Self {
        Self::new(&RegionalConfig::default())
    }
}

impl RegionCodec {
    pub fn new(config: &RegionalConfig) -> Self {
        Self {
            max_region_id: config.max_region_id,
            span: tracing::span!(tracing::Level::TRACE, "region-codec"),
        }
    }

    fn check_id(&self, id: usize) -> Result<()> {
        if id > self.max_region_id {
            candle::bail!(
                "region id {id} is unsupported, the largest supported id is {}",
                self.max_region_id
            )
        }
        Ok(())
    }

    /// Commit a freehand stroke layer onto `canvas`.
    ///
    /// `stroke` has the same (padded) dimensions as the canvas; any non-black pixel
    /// is part of the stroke. Each stroke outline is simplified and filled with the
    /// colour of `target`, overwriting whatever was there. Returns the relabeled
    /// canvas and the target to use for the next stroke.
    pub fn commit_stroke(
        &self,
        session: &mut ColourSession,
        canvas: &LabeledCanvas,
        stroke: &RgbImage,
        target: RegionTarget,
    ) -> Result<(LabeledCanvas, RegionTarget)> {
        let _enter = self.span.enter();
        if stroke.dimensions() != canvas.padded().dimensions() {
            candle::bail!(
                "stroke layer is {:?} but the canvas is {:?}",
                stroke.dimensions(),
                canvas.padded().dimensions()
            )
        }

        let colour = match target {
            RegionTarget::Background => BACKGROUND,
            RegionTarget::Region(id) => {
                self.check_id(id)?;
                let colour = session.colour(id);
                session.record_used(id, colour);
                colour
            }
        };

        let (width, height) = (canvas.width(), canvas.height());
        let binary = GrayImage::from_fn(width, height, |x, y| {
            let on = stroke.get_pixel(x, y).0.iter().any(|&c| c != 0);
            Luma([if on { 255 } else { 0 }])
        });

        let mut working = canvas.unpadded();
        let mut filled = 0usize;
        for contour in find_contours(&binary) {
            let perimeter = arc_length(&contour);
            if contour_area(&contour) <= perimeter * MIN_AREA_PER_PERIMETER {
                continue;
            }
            let polygon = approximate_polygon(&contour, SIMPLIFY_TOLERANCE * perimeter);
            fill_polygon(&mut working, &polygon, colour);
            filled += 1;
        }
        tracing::debug!(?target, filled, "committed stroke");

        Ok((session.rewrap(&working), target.next(self.max_region_id)))
    }

    /// Binary mask of the pixels labeled `target`, with `fill` for set pixels.
    ///
    /// For [`RegionTarget::Region`] pixels must match the palette colour exactly; a
    /// non-empty match refreshes the registry entry of that region. For
    /// [`RegionTarget::Background`] every pixel whose colour is not registered as in
    /// use is set, so with an empty registry the whole mask is set. Returns `None`
    /// when there is no canvas.
    pub fn extract_mask(
        &self,
        session: &mut ColourSession,
        canvas: Option<&LabeledCanvas>,
        target: RegionTarget,
        fill: u8,
    ) -> Result<Option<GrayImage>> {
        let Some(canvas) = canvas else {
            return Ok(None);
        };
        let (width, height) = (canvas.width(), canvas.height());
        let mask = match target {
            RegionTarget::Region(id) => {
                self.check_id(id)?;
                let colour = session.colour(id);
                let mut any = false;
                let mask = GrayImage::from_fn(width, height, |x, y| {
                    let hit = canvas.pixel(x, y) == colour;
                    any |= hit;
                    Luma([if hit { fill } else { 0 }])
                });
                if any {
                    session.record_used(id, colour);
                }
                mask
            }
            RegionTarget::Background => {
                let used: Vec<Rgb<u8>> = session.registry().values().copied().collect();
                GrayImage::from_fn(width, height, |x, y| {
                    let claimed = used.contains(&canvas.pixel(x, y));
                    Luma([if claimed { 0 } else { fill }])
                })
            }
        };
        Ok(Some(mask))
    }

    /// Commit a stroke and return the new canvas, the next target and the mask of
    /// the target just painted.
    pub fn draw_region(
        &self,
        session: &mut ColourSession,
        canvas: &LabeledCanvas,
        stroke: &RgbImage,
        target: RegionTarget,
    ) -> Result<(LabeledCanvas, RegionTarget, GrayImage)> {
        let (canvas, next) = self.commit_stroke(session, canvas, stroke, target)?;
        let mask = self
            .extract_mask(session, Some(&canvas), target, u8::MAX)?
            .unwrap_or_else(|| GrayImage::new(canvas.width(), canvas.height()));
        Ok((canvas, next, mask))
    }

    /// Adopt an uploaded mask image as a labeled canvas.
    ///
    /// Colours in the pure-tone band are snapped onto the exact palette
    /// saturation/value so lossy round trips still decode. The palette cache is
    /// extended to twice the hue budget. Returns the canvas and its unclaimed mask.
    pub fn import_image(
        &self,
        session: &mut ColourSession,
        image: &RgbImage,
    ) -> Result<(LabeledCanvas, GrayImage)> {
        session.set_variant(0);
        let mut snapped: HashMap<Rgb<u8>, Rgb<u8>> = HashMap::new();
        let mut image = image.clone();
        for pixel in image.pixels_mut() {
            let fixed = *snapped.entry(*pixel).or_insert_with(|| {
                if is_pure_tone(*pixel) {
                    snap_to_palette(*pixel)
                } else {
                    *pixel
                }
            });
            *pixel = fixed;
        }
        let renamed = snapped.iter().filter(|(from, to)| from != to).count();
        tracing::debug!(colours = snapped.len(), renamed, "imported mask image");

        session.colours(2 * MAX_COLOUR_REGIONS);
        let canvas = LabeledCanvas::from_image(image);
        let mask = self
            .extract_mask(session, Some(&canvas), RegionTarget::Background, u8::MAX)?
            .unwrap_or_else(|| GrayImage::new(canvas.width(), canvas.height()));
        Ok((canvas, mask))
    }
}
