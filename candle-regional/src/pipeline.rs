//! Per-request orchestration: decode the editor payload, build the region masks,
//! the compositor and the combined prompt.

use std::sync::Arc;

use candle::{Device, Result};

use crate::attention::AttentionProcessor;
use crate::compositor::RegionalAttention;
use crate::config::RegionalConfig;
use crate::environment::Environment;
use crate::hooks::{HookManager, Topology};
use crate::ingest::{setup_masks, RegionMaskSet};
use crate::prompt::{GenerationMetadata, RegionalPrompt};
use crate::session::ColourSession;
use crate::state::decode_data_url;

/// Inputs sent by the editor with a generation request.
#[derive(Debug, Clone, Default)]
pub struct RegionalRequest {
    pub active: bool,
    /// Flattened mask as a `data:image/...;base64,...` URL.
    pub mask_data: String,
    pub base_prompt: String,
    pub negative_prompt: String,
    /// JSON map from region id to prompt.
    pub prompts_dump: String,
    /// Number of layers in the editor, used when the prompt map is empty.
    pub layer_count: usize,
}

/// Everything the host needs to run one regional generation.
#[derive(Debug)]
pub struct PreparedRequest {
    pub prompt: String,
    /// One combined prompt per batch entry.
    pub prompts: Vec<String>,
    /// Replacement negative prompt, when the editor supplied one.
    pub negative_prompt: Option<String>,
    pub metadata: GenerationMetadata,
    pub compositor: Arc<RegionalAttention>,
}

impl PreparedRequest {
    pub fn masks(&self) -> &RegionMaskSet {
        self.compositor.masks()
    }
}

#[derive(Debug, Clone)]
pub struct MaskRegionProcessor {
    height: usize,
    width: usize,
    batch_size: usize,
    environment: Environment,
    config: RegionalConfig,
}

impl MaskRegionProcessor {
    pub fn new(height: usize, width: usize, batch_size: usize, environment: Environment) -> Self {
        Self::with_config(height, width, batch_size, environment, RegionalConfig::default())
    }

    pub fn with_config(
        height: usize,
        width: usize,
        batch_size: usize,
        environment: Environment,
        config: RegionalConfig,
    ) -> Self {
        Self {
            height,
            width,
            batch_size: batch_size.max(1),
            environment,
            config,
        }
    }

    pub fn config(&self) -> &RegionalConfig {
        &self.config
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// Prepare `request`, or `None` when generation should proceed unmodified.
    pub fn prepare(
        &self,
        request: &RegionalRequest,
        session: &mut ColourSession,
        device: &Device,
    ) -> Result<Option<PreparedRequest>> {
        if !request.active {
            return Ok(None);
        }
        let mask = match decode_data_url(&request.mask_data) {
            Some(mask) => mask,
            None => {
                tracing::debug!("no decodable mask in the request, passing through");
                return Ok(None);
            }
        };
        if (mask.height() as usize, mask.width() as usize) != (self.height, self.width) {
            tracing::warn!(
                mask_height = mask.height(),
                mask_width = mask.width(),
                height = self.height,
                width = self.width,
                "mask and generation resolutions differ"
            );
        }

        let prompt = RegionalPrompt::from_dump(
            &request.base_prompt,
            &request.negative_prompt,
            &request.prompts_dump,
            request.layer_count,
        );
        let masks = setup_masks(session, &mask, prompt.region_count(), &self.config, device)?;
        let compositor = RegionalAttention::new(Arc::new(masks), self.height, self.width)
            .with_tokens_per_chunk(self.config.tokens_per_chunk);

        let combined = prompt.combined(&self.config);
        let metadata = GenerationMetadata::new(&prompt, &combined, &self.config);
        tracing::debug!(
            regions = prompt.region_count(),
            active = ?compositor.masks().active_ids(),
            "prepared regional request"
        );
        Ok(Some(PreparedRequest {
            prompts: vec![combined.clone(); self.batch_size],
            prompt: combined,
            negative_prompt: prompt.negative_override().map(str::to_string),
            metadata,
            compositor: Arc::new(compositor),
        }))
    }

    /// Hook manager installing the request's compositor with this environment's topology.
    pub fn hook_manager(&self, prepared: &PreparedRequest) -> HookManager {
        let processor: Arc<dyn AttentionProcessor> = prepared.compositor.clone();
        HookManager::new(
            processor,
            Topology::new(self.environment.is_forge()),
            &self.config.attention_marker,
        )
    }
}
