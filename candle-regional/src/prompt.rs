//! Combined prompt assembly and generation metadata.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::RegionalConfig;

/// Prompts of one request: the base prompt plus one prompt per region id.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RegionalPrompt {
    pub base: String,
    pub negative: String,
    /// Region prompts keyed by 1-based region id.
    pub regions: BTreeMap<usize, String>,
    region_count: usize,
}

impl RegionalPrompt {
    pub fn new(base: &str, negative: &str, region_count: usize) -> Self {
        Self {
            base: base.to_string(),
            negative: negative.to_string(),
            regions: BTreeMap::new(),
            region_count,
        }
    }

    pub fn with_region(mut self, id: usize, prompt: &str) -> Self {
        self.regions.insert(id, prompt.to_string());
        self.region_count = self.region_count.max(id);
        self
    }

    /// Build from the editor's JSON dump mapping `"1"`, `"2"`, ... to prompt text.
    ///
    /// The region count is the number of entries in the map, or `layer_count` when
    /// the map is empty or malformed.
    pub fn from_dump(base: &str, negative: &str, prompts_json: &str, layer_count: usize) -> Self {
        let map: BTreeMap<String, String> = if prompts_json.trim().is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_str(prompts_json).unwrap_or_else(|err| {
                tracing::warn!(%err, "ignoring malformed region prompt map");
                BTreeMap::new()
            })
        };
        let region_count = if map.is_empty() { layer_count } else { map.len() };
        let regions = map
            .into_iter()
            .filter_map(|(k, v)| k.trim().parse::<usize>().ok().map(|id| (id, v)))
            .collect();
        Self {
            base: base.to_string(),
            negative: negative.to_string(),
            regions,
            region_count,
        }
    }

    pub fn region_count(&self) -> usize {
        self.region_count
    }

    /// Prompt of region `id`, or the placeholder when it has no content.
    pub fn region_prompt<'a>(&'a self, id: usize, config: &'a RegionalConfig) -> &'a str {
        self.regions
            .get(&id)
            .map(String::as_str)
            .filter(|p| !p.is_empty())
            .unwrap_or(config.empty_prompt_placeholder.as_str())
    }

    /// Base prompt followed by every region prompt in id order, one conditioning
    /// chunk each, joined by the delimiter.
    pub fn combined(&self, config: &RegionalConfig) -> String {
        if self.region_count == 0 {
            return self.base.clone();
        }
        let mut parts = Vec::with_capacity(self.region_count + 1);
        parts.push(self.base.as_str());
        parts.extend((1..=self.region_count).map(|id| self.region_prompt(id, config)));
        parts.join(&format!(" {} ", config.prompt_delimiter))
    }

    pub fn negative_override(&self) -> Option<&str> {
        (!self.negative.is_empty()).then_some(self.negative.as_str())
    }
}

/// Parameters attached to the generated image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationMetadata {
    #[serde(rename = "MRP Active")]
    pub active: bool,
    /// Number of conditioning chunks, base included.
    #[serde(rename = "MRP Regions")]
    pub regions: usize,
    #[serde(rename = "MRP Prompt")]
    pub prompt: String,
}

impl GenerationMetadata {
    pub fn new(prompt: &RegionalPrompt, combined: &str, config: &RegionalConfig) -> Self {
        Self {
            active: true,
            regions: prompt.region_count() + 1,
            prompt: truncate_chars(combined, config.metadata_prompt_limit),
        }
    }

    /// Key/value pairs in the order the host writes its infotext.
    pub fn params(&self) -> Vec<(&'static str, String)> {
        vec![
            ("MRP Active", self.active.to_string()),
            ("MRP Regions", self.regions.to_string()),
            ("MRP Prompt", self.prompt.clone()),
        ]
    }
}

fn truncate_chars(s: &str, limit: usize) -> String {
    match s.char_indices().nth(limit) {
        Some((end, _)) => format!("{}...", &s[..end]),
        None => s.to_string(),
    }
}
