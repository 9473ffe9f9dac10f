//! Mask files and the editor state persisted alongside them.
//!
//! Saved masks are plain PNGs; the editor state rides along as JSON in a text
//! chunk keyed `MRP_State`, so any image viewer still opens the file.

use std::io::{BufWriter, Cursor};
use std::path::Path;

use base64::Engine;
use candle::{Error, Result};
use image::{ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};

use crate::session::LabeledCanvas;

pub const STATE_KEYWORD: &str = "MRP_State";

fn default_prompts() -> String {
    "{}".to_string()
}

fn default_layer_data() -> String {
    "[]".to_string()
}

/// Everything the editor needs to restore a session besides the mask raster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditorState {
    #[serde(default)]
    pub base_prompt: String,
    #[serde(default)]
    pub base_neg_prompt: String,
    /// JSON map from region id to prompt.
    #[serde(default = "default_prompts")]
    pub prompts: String,
    #[serde(default)]
    pub is_auto: bool,
    /// JSON layer ordering record, opaque to this crate.
    #[serde(default = "default_layer_data")]
    pub layer_data: String,
    /// Data URL of the optional image drawn under the mask.
    #[serde(default)]
    pub base_image: String,
}

impl Default for EditorState {
    fn default() -> Self {
        Self {
            base_prompt: String::new(),
            base_neg_prompt: String::new(),
            prompts: default_prompts(),
            is_auto: false,
            layer_data: default_layer_data(),
            base_image: String::new(),
        }
    }
}

impl EditorState {
    /// Parse a side-channel record; anything malformed yields the defaults.
    pub fn from_record(record: &str) -> Self {
        serde_json::from_str(record).unwrap_or_else(|err| {
            tracing::warn!(%err, "malformed editor state, using defaults");
            Self::default()
        })
    }
}

/// Keep only ASCII alphanumerics, `-` and `_` of a user supplied file stem.
pub fn sanitize_stem(name: &str) -> Option<String> {
    let stem: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    (!stem.is_empty()).then_some(stem)
}

fn is_blank(image: &RgbImage) -> bool {
    let raw = image.as_raw();
    if raw.is_empty() {
        return true;
    }
    let sum: u64 = raw.iter().map(|&v| v as u64).sum();
    sum as f64 / raw.len() as f64 > 254.0
}

/// Write `image` as a PNG carrying `state`.
///
/// Returns `false` without touching the file system when the image is blank.
pub fn save_state_png<P: AsRef<Path>>(path: P, image: &RgbImage, state: &EditorState) -> Result<bool> {
    if is_blank(image) {
        tracing::debug!("blank mask, nothing to save");
        return Ok(false);
    }
    let record = serde_json::to_string(state).map_err(Error::wrap)?;
    let file = std::fs::File::create(path.as_ref())?;
    let mut encoder = png::Encoder::new(BufWriter::new(file), image.width(), image.height());
    encoder.set_color(png::ColorType::Rgb);
    encoder.set_depth(png::BitDepth::Eight);
    if record.chars().all(|c| (c as u32) < 0x100) {
        encoder
            .add_text_chunk(STATE_KEYWORD.to_string(), record)
            .map_err(Error::wrap)?;
    } else {
        encoder
            .add_itxt_chunk(STATE_KEYWORD.to_string(), record)
            .map_err(Error::wrap)?;
    }
    let mut writer = encoder.write_header().map_err(Error::wrap)?;
    writer.write_image_data(image.as_raw()).map_err(Error::wrap)?;
    writer.finish().map_err(Error::wrap)?;
    Ok(true)
}

fn read_state_record(bytes: &[u8]) -> Result<Option<String>> {
    let decoder = png::Decoder::new(Cursor::new(bytes));
    let reader = decoder.read_info().map_err(Error::wrap)?;
    let info = reader.info();
    if let Some(chunk) = info
        .uncompressed_latin1_text
        .iter()
        .find(|c| c.keyword == STATE_KEYWORD)
    {
        return Ok(Some(chunk.text.clone()));
    }
    let utf8 = info.utf8_text.iter().find(|c| c.keyword == STATE_KEYWORD);
    Ok(utf8.and_then(|c| c.get_text().ok()))
}

/// Read a mask saved by [`save_state_png`]; a missing record loads as the defaults.
pub fn load_state_png<P: AsRef<Path>>(path: P) -> Result<(RgbImage, EditorState)> {
    let bytes = std::fs::read(path.as_ref())?;
    let image = image::load_from_memory_with_format(&bytes, ImageFormat::Png)
        .map_err(Error::wrap)?
        .to_rgb8();
    let state = read_state_record(&bytes)?
        .map(|record| EditorState::from_record(&record))
        .unwrap_or_default();
    Ok((image, state))
}

/// Save the labeled area of `canvas`, padding stripped.
pub fn save_mask<P: AsRef<Path>>(canvas: &LabeledCanvas, path: P) -> Result<()> {
    canvas.unpadded().save(path.as_ref()).map_err(Error::wrap)
}

/// Load a mask raster, `None` on any failure.
pub fn load_mask<P: AsRef<Path>>(path: P) -> Option<RgbImage> {
    match image::open(path.as_ref()) {
        Ok(img) => Some(img.to_rgb8()),
        Err(err) => {
            tracing::warn!(%err, path = %path.as_ref().display(), "cannot load mask");
            None
        }
    }
}

/// Decode a `data:image/...;base64,...` payload to RGB; anything else is `None`.
pub fn decode_data_url(url: &str) -> Option<RgbImage> {
    if !url.starts_with("data:image") {
        return None;
    }
    let (_, payload) = url.split_once(',')?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .ok()?;
    image::load_from_memory(&bytes).ok().map(|img| img.to_rgb8())
}

/// Encode `image` as a PNG data URL, the form the editor loads.
pub fn encode_data_url(image: &RgbImage) -> Result<String> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(Error::wrap)?;
    let payload = base64::engine::general_purpose::STANDARD.encode(bytes);
    Ok(format!("data:image/png;base64,{payload}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn labeled() -> RgbImage {
        let mut img = RgbImage::from_pixel(16, 12, Rgb([255, 255, 255]));
        for y in 2..8 {
            for x in 3..9 {
                img.put_pixel(x, y, Rgb([64, 128, 128]));
            }
        }
        img
    }

    #[test]
    fn test_state_png() -> Result<()> {
        let path = std::env::temp_dir().join(format!("mrp-state-{}.png", std::process::id()));
        let state = EditorState {
            base_prompt: "a forest".to_string(),
            prompts: r#"{"1": "a red fox"}"#.to_string(),
            ..Default::default()
        };
        assert!(save_state_png(&path, &labeled(), &state)?);
        let (image, loaded) = load_state_png(&path)?;
        std::fs::remove_file(&path)?;
        assert_eq!(image, labeled());
        assert_eq!(loaded, state);
        Ok(())
    }

    #[test]
    fn test_blank_is_not_saved() -> Result<()> {
        let path = std::env::temp_dir().join("mrp-never-written.png");
        let blank = RgbImage::from_pixel(4, 4, Rgb([255, 255, 255]));
        assert!(!save_state_png(&path, &blank, &EditorState::default())?);
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn test_mask_strips_padding() -> Result<()> {
        let path = std::env::temp_dir().join(format!("mrp-mask-{}.png", std::process::id()));
        let mut session = crate::session::ColourSession::new();
        let canvas = session.new_canvas(12, 16, true);
        assert_eq!(canvas.padding(), 1);
        let canvas = LabeledCanvas::with_padding(&labeled(), canvas.padding());
        save_mask(&canvas, &path)?;
        let loaded = load_mask(&path);
        std::fs::remove_file(&path)?;
        assert_eq!(loaded, Some(labeled()));
        assert_eq!(canvas.padded().dimensions(), (17, 13));
        Ok(())
    }

    #[test]
    fn test_missing_mask() {
        let path = std::env::temp_dir().join("mrp-no-such-mask.png");
        assert_eq!(load_mask(path), None);
    }

    #[test]
    fn test_record_defaults() {
        let state = EditorState::from_record(r#"{"base_prompt": "x"}"#);
        assert_eq!(state.base_prompt, "x");
        assert_eq!(state.prompts, "{}");
        assert_eq!(state.layer_data, "[]");
        assert_eq!(EditorState::from_record("garbage"), EditorState::default());
    }

    #[test]
    fn test_data_url() -> Result<()> {
        let url = encode_data_url(&labeled())?;
        assert_eq!(decode_data_url(&url), Some(labeled()));
        assert_eq!(decode_data_url("https://example.com/a.png"), None);
        assert_eq!(decode_data_url("data:image/png;base64,!!!"), None);
        assert_eq!(sanitize_stem("my mask?.png").as_deref(), Some("mymaskpng"));
        assert_eq!(sanitize_stem("../"), None);
        Ok(())
    }
}
