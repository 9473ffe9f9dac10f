//! Configuration for regional prompting.
//!
//! Every field has a default, so an empty JSON object (`{}`) deserializes to [`RegionalConfig::default`].

use candle::{DType, Result};
use serde::{Deserialize, Serialize};

/// Number of tokens in one conditioning chunk (75 prompt tokens plus BOS/EOS).
pub const TOKENS_PER_CHUNK: usize = 77;

/// Number of hues the colour allocator is always asked for during ingestion.
pub const MAX_COLOUR_REGIONS: usize = 359;

/// Highest region id the stroke codec will hand out.
pub const MAX_REGION_ID: usize = 255;

/// Per-channel tolerance used when matching a flattened mask against the palette.
pub const MATCH_TOLERANCE: u8 = 10;

/// Precision used to store and blend region masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskPrecision {
    /// 16-bit floats, halves the memory of large masks.
    #[default]
    Half,
    /// 32-bit floats, for backends without efficient f16 kernels.
    Single,
}

impl MaskPrecision {
    pub fn dtype(&self) -> DType {
        match self {
            Self::Half => DType::F16,
            Self::Single => DType::F32,
        }
    }
}

/// Tunables for mask ingestion, prompt assembly and the attention compositor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionalConfig {
    /// Length of each conditioning chunk in tokens (default: 77).
    #[serde(default = "default_tokens_per_chunk")]
    pub tokens_per_chunk: usize,

    /// Per-channel absolute difference below which a pixel matches a region colour (default: 10).
    #[serde(default = "default_match_tolerance")]
    pub match_tolerance: u8,

    /// Minimum palette length requested during ingestion (default: 359).
    #[serde(default = "default_min_colours")]
    pub min_colours: usize,

    /// Largest supported region id (default: 255).
    #[serde(default = "default_max_region_id")]
    pub max_region_id: usize,

    /// Token joining the base prompt and the region prompts (default: "BREAK").
    #[serde(default = "default_prompt_delimiter")]
    pub prompt_delimiter: String,

    /// Stand-in for regions whose prompt is empty (default: "_").
    #[serde(default = "default_empty_prompt_placeholder")]
    pub empty_prompt_placeholder: String,

    /// Name fragment identifying the cross-attention layers to hook (default: "attn2").
    #[serde(default = "default_attention_marker")]
    pub attention_marker: String,

    /// Storage precision for region masks (default: half).
    #[serde(default)]
    pub mask_precision: MaskPrecision,

    /// Number of prompt characters kept in the generation metadata (default: 200).
    #[serde(default = "default_metadata_prompt_limit")]
    pub metadata_prompt_limit: usize,
}

fn default_tokens_per_chunk() -> usize {
    TOKENS_PER_CHUNK
}
fn default_match_tolerance() -> u8 {
    MATCH_TOLERANCE
}
fn default_min_colours() -> usize {
    MAX_COLOUR_REGIONS
}
fn default_max_region_id() -> usize {
    MAX_REGION_ID
}
fn default_prompt_delimiter() -> String {
    "BREAK".to_string()
}
fn default_empty_prompt_placeholder() -> String {
    "_".to_string()
}
fn default_attention_marker() -> String {
    "attn2".to_string()
}
fn default_metadata_prompt_limit() -> usize {
    200
}

impl Default for RegionalConfig {
    fn default() -> Self {
        Self {
            tokens_per_chunk: TOKENS_PER_CHUNK,
            match_tolerance: MATCH_TOLERANCE,
            min_colours: MAX_COLOUR_REGIONS,
            max_region_id: MAX_REGION_ID,
            prompt_delimiter: default_prompt_delimiter(),
            empty_prompt_placeholder: default_empty_prompt_placeholder(),
            attention_marker: default_attention_marker(),
            mask_precision: MaskPrecision::default(),
            metadata_prompt_limit: default_metadata_prompt_limit(),
        }
    }
}

impl RegionalConfig {
    /// Parse a configuration from JSON, filling unspecified fields with defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(candle::Error::wrap)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file.
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tokens_per_chunk == 0 {
            candle::bail!("tokens_per_chunk must be positive");
        }
        if self.max_region_id == 0 {
            candle::bail!("max_region_id must be positive");
        }
        Ok(())
    }

    /// Storage dtype for region masks.
    pub fn mask_dtype(&self) -> DType {
        self.mask_precision.dtype()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_is_default() -> Result<()> {
        let config = RegionalConfig::from_json_str("{}")?;
        assert_eq!(config, RegionalConfig::default());
        assert_eq!(config.tokens_per_chunk, 77);
        assert_eq!(config.mask_dtype(), DType::F16);
        Ok(())
    }

    #[test]
    fn test_partial_override() -> Result<()> {
        let config =
            RegionalConfig::from_json_str(r#"{"match_tolerance": 4, "mask_precision": "single"}"#)?;
        assert_eq!(config.match_tolerance, 4);
        assert_eq!(config.mask_dtype(), DType::F32);
        assert_eq!(config.prompt_delimiter, "BREAK");
        Ok(())
    }

    #[test]
    fn test_zero_chunk_rejected() {
        assert!(RegionalConfig::from_json_str(r#"{"tokens_per_chunk": 0}"#).is_err());
    }
}
