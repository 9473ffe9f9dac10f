//! Authoring session state: the cached palette, the registry of colours in use and
//! the padding parity of the canvases handed to the editor.

use std::collections::BTreeMap;

use image::{Rgb, RgbImage};

use crate::colours::{ColourSequence, BACKGROUND};

/// RGB raster whose pixel colours identify the owning region.
///
/// Canvases may carry a one pixel pad on the right and bottom edges. The pad
/// forces the editor to treat consecutive canvases as different images and is
/// never part of the labeled area.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledCanvas {
    image: RgbImage,
    padding: u32,
}

impl LabeledCanvas {
    /// Blank canvas of `height` x `width` pixels plus `padding`.
    pub fn blank(height: u32, width: u32, padding: u32) -> Self {
        let image = RgbImage::from_pixel(width + padding, height + padding, BACKGROUND);
        Self { image, padding }
    }

    /// Wrap an unpadded raster.
    pub fn from_image(image: RgbImage) -> Self {
        Self { image, padding: 0 }
    }

    /// Place `content` into a fresh canvas with the given padding.
    pub fn with_padding(content: &RgbImage, padding: u32) -> Self {
        let mut canvas = Self::blank(content.height(), content.width(), padding);
        image::imageops::replace(&mut canvas.image, content, 0, 0);
        canvas
    }

    pub fn padding(&self) -> u32 {
        self.padding
    }

    /// Width of the labeled area, padding excluded.
    pub fn width(&self) -> u32 {
        self.image.width() - self.padding
    }

    /// Height of the labeled area, padding excluded.
    pub fn height(&self) -> u32 {
        self.image.height() - self.padding
    }

    /// The raster as shown to the editor, padding included.
    pub fn padded(&self) -> &RgbImage {
        &self.image
    }

    /// Copy of the labeled area with the padding stripped.
    pub fn unpadded(&self) -> RgbImage {
        if self.padding == 0 {
            return self.image.clone();
        }
        image::imageops::crop_imm(&self.image, 0, 0, self.width(), self.height()).to_image()
    }

    /// Colour of a pixel in labeled-area coordinates.
    pub fn pixel(&self, x: u32, y: u32) -> Rgb<u8> {
        *self.image.get_pixel(x, y)
    }
}

/// Process-wide colour state of one authoring workflow, held explicitly.
#[derive(Debug, Clone, Default)]
pub struct ColourSession {
    colours: ColourSequence,
    registry: BTreeMap<usize, Rgb<u8>>,
    variant: u32,
}

impl ColourSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start authoring from scratch: forget the palette cache, the registry and the parity.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Palette with at least `n` entries; previously issued entries never change.
    pub fn colours(&mut self, n: usize) -> &ColourSequence {
        self.colours.extend_to(n);
        &self.colours
    }

    /// Palette colour of region `id`.
    pub fn colour(&mut self, id: usize) -> Rgb<u8> {
        self.colours.extend_to(id + 1);
        self.colours.as_slice()[id]
    }

    /// Colours detected in use, keyed by region id.
    pub fn registry(&self) -> &BTreeMap<usize, Rgb<u8>> {
        &self.registry
    }

    pub fn record_used(&mut self, id: usize, colour: Rgb<u8>) {
        self.registry.insert(id, colour);
    }

    /// Padding of the most recently created canvas.
    pub fn variant(&self) -> u32 {
        self.variant
    }

    pub(crate) fn set_variant(&mut self, variant: u32) {
        self.variant = variant;
    }

    /// Create a blank canvas, flipping the padding parity.
    ///
    /// With `wipe` set the registry is cleared as well, which starts a new
    /// drawing on an empty canvas.
    pub fn new_canvas(&mut self, height: u32, width: u32, wipe: bool) -> LabeledCanvas {
        self.variant = 1 - self.variant;
        if wipe {
            self.registry.clear();
        }
        LabeledCanvas::blank(height, width, self.variant)
    }

    /// Wrap `content` into a canvas using the next padding parity, keeping the registry.
    pub(crate) fn rewrap(&mut self, content: &RgbImage) -> LabeledCanvas {
        self.variant = 1 - self.variant;
        LabeledCanvas::with_padding(content, self.variant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canvas_parity_alternates() {
        let mut session = ColourSession::new();
        let a = session.new_canvas(4, 6, true);
        let b = session.new_canvas(4, 6, true);
        assert_eq!(a.padding() + b.padding(), 1);
        assert_eq!((a.height(), a.width()), (4, 6));
        assert_eq!((b.height(), b.width()), (4, 6));
        assert_eq!(a.padded().width(), 6 + a.padding());
    }

    #[test]
    fn test_wipe_clears_registry() {
        let mut session = ColourSession::new();
        let colour = session.colour(3);
        session.record_used(3, colour);
        session.new_canvas(2, 2, false);
        assert_eq!(session.registry().len(), 1);
        session.new_canvas(2, 2, true);
        assert!(session.registry().is_empty());
    }

    #[test]
    fn test_unpadded_strips_edge() {
        let canvas = LabeledCanvas::blank(3, 5, 1);
        let inner = canvas.unpadded();
        assert_eq!(inner.dimensions(), (5, 3));
    }
}
