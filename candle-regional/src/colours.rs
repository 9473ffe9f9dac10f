//! Deterministic colour allocation for region labels.
//!
//! Region `i` is painted with the `i`-th entry of an append-only palette. Hues are
//! handed out by repeatedly bisecting the hue circle: index 0 gets hue 0, index 1
//! gets 1/2, indices 2..4 get the odd quarters, 4..8 the odd eighths and so on, so
//! every new colour lands in the middle of the widest gap left by the previous
//! ones. Saturation and value are both fixed at 0.5.

use image::Rgb;

/// Saturation and value shared by every allocated colour.
pub const PALETTE_SATURATION: f64 = 0.5;
pub const PALETTE_VALUE: f64 = 0.5;

/// Saturation/value band that identifies a palette colour in uploaded images.
pub const PURE_TONE_BAND: (f64, f64) = (0.49, 0.51);

/// Colour used for unlabeled canvas pixels.
pub const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);

/// Hue in `[0, 1)` of palette entry `index`.
pub fn palette_hue(index: usize) -> f64 {
    if index == 0 {
        return 0.0;
    }
    // Entries 2^(c-1)..2^c fill the odd multiples of 1/2^c.
    let cycle = usize::BITS - index.leading_zeros();
    let first = 1usize << (cycle - 1);
    let delta = 1.0 / (1u64 << cycle) as f64;
    delta + 2.0 * delta * (index - first) as f64
}

/// Convert HSV (all components in `[0, 1]`) to RGB in `[0, 1]`.
pub fn hsv_to_rgb(h: f64, s: f64, v: f64) -> (f64, f64, f64) {
    if s == 0.0 {
        return (v, v, v);
    }
    let sector = (h * 6.0).floor();
    let f = h * 6.0 - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));
    match (sector as i64).rem_euclid(6) {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    }
}

/// Convert RGB in `[0, 1]` to HSV in `[0, 1]`.
pub fn rgb_to_hsv(r: f64, g: f64, b: f64) -> (f64, f64, f64) {
    let maxc = r.max(g).max(b);
    let minc = r.min(g).min(b);
    let v = maxc;
    if minc == maxc {
        return (0.0, 0.0, v);
    }
    let range = maxc - minc;
    let s = range / maxc;
    let rc = (maxc - r) / range;
    let gc = (maxc - g) / range;
    let bc = (maxc - b) / range;
    let h = if r == maxc {
        bc - gc
    } else if g == maxc {
        2.0 + rc - bc
    } else {
        4.0 + gc - rc
    };
    ((h / 6.0).rem_euclid(1.0), s, v)
}

/// Quantize an RGB triple in `[0, 1]` the way the palette does: scale by 256 and truncate.
pub fn quantize(rgb: (f64, f64, f64)) -> Rgb<u8> {
    let q = |c: f64| (c * 256.0) as u8;
    Rgb([q(rgb.0), q(rgb.1), q(rgb.2)])
}

/// Palette colour for the given hue.
pub fn palette_colour(hue: f64) -> Rgb<u8> {
    quantize(hsv_to_rgb(hue, PALETTE_SATURATION, PALETTE_VALUE))
}

/// Whether a colour sits in the pure-tone band, i.e. looks like a palette colour.
pub fn is_pure_tone(colour: Rgb<u8>) -> bool {
    let [r, g, b] = colour.0;
    let (_, s, v) = rgb_to_hsv(r as f64 / 255.0, g as f64 / 255.0, b as f64 / 255.0);
    let (lo, hi) = PURE_TONE_BAND;
    (lo..=hi).contains(&s) && (lo..=hi).contains(&v)
}

/// Snap a pure-tone colour onto the exact palette saturation/value, keeping its hue.
pub fn snap_to_palette(colour: Rgb<u8>) -> Rgb<u8> {
    let [r, g, b] = colour.0;
    let (h, _, _) = rgb_to_hsv(r as f64 / 255.0, g as f64 / 255.0, b as f64 / 255.0);
    palette_colour(h)
}

/// Ordered, append-only sequence of region colours; the index is the region id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColourSequence {
    colours: Vec<Rgb<u8>>,
}

impl ColourSequence {
    /// Allocate `n` colours, extending `existing` when it is shorter.
    ///
    /// Entries already present in `existing` are kept verbatim; only the missing
    /// suffix is computed. Returns `None` when `n` is zero.
    pub fn allocate(n: usize, existing: Option<&ColourSequence>) -> Option<ColourSequence> {
        if n == 0 {
            return None;
        }
        let mut sequence = existing.cloned().unwrap_or_default();
        sequence.extend_to(n);
        Some(sequence)
    }

    /// Grow the sequence to at least `n` entries.
    pub fn extend_to(&mut self, n: usize) {
        let start = self.colours.len();
        if n <= start {
            return;
        }
        self.colours
            .extend((start..n).map(|i| palette_colour(palette_hue(i))));
    }

    pub fn len(&self) -> usize {
        self.colours.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colours.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Rgb<u8>> {
        self.colours.get(index).copied()
    }

    pub fn as_slice(&self) -> &[Rgb<u8>] {
        &self.colours
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rgb<u8>> {
        self.colours.iter()
    }
}

/// `#rrggbb` brush colour for the layer painted with palette entry `index`.
pub fn brush_hex(index: usize) -> String {
    let [r, g, b] = palette_colour(palette_hue(index)).0;
    format!("#{r:02x}{g:02x}{b:02x}")
}
