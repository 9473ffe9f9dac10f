//! Mask-weighted regional attention.
//!
//! The conditioning sequence is made of fixed-size chunks: chunk 0 encodes the
//! base prompt, chunk `k` the prompt of region `k`. Instead of attending over the
//! whole sequence at once, every hooked layer attends once per chunk and blends the
//! results with the region masks resized to the layer's feature resolution.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use candle::{DType, Result, Tensor};

use crate::attention::{AttentionProcessor, CrossAttention};
use crate::config::TOKENS_PER_CHUNK;
use crate::ingest::RegionMaskSet;

/// Halve `x` with ceiling division `times` times, as strided convolutions do.
pub fn repeat_div(mut x: usize, times: usize) -> usize {
    for _ in 0..times {
        x = x.div_ceil(2);
    }
    x
}

/// Spatial resolution of a layer whose flattened feature map holds `tokens` positions.
///
/// The number of halvings is `ceil(log2(sqrt(height * width / tokens)))`, applied
/// to each dimension of the request resolution independently.
pub fn feature_resolution(height: usize, width: usize, tokens: usize) -> Result<(usize, usize)> {
    if tokens == 0 {
        candle::bail!("cannot derive a feature resolution for an empty token sequence")
    }
    let ratio = (height * width) as f64 / tokens as f64;
    let halvings = ratio.sqrt().log2().ceil();
    let halvings = if halvings > 0.0 { halvings as usize } else { 0 };
    Ok((repeat_div(height, halvings), repeat_div(width, halvings)))
}

/// Nearest-neighbour resize of a `(1, H, W)` mask to `(1, height, width, 1)` in `dtype`.
fn resize_mask(mask: &Tensor, height: usize, width: usize, dtype: DType) -> Result<Tensor> {
    let (_, h, w) = mask.dims3()?;
    mask.reshape((1, 1, h, w))?
        .upsample_nearest2d(height, width)?
        .reshape((1, height, width, 1))?
        .to_dtype(dtype)
}

/// Attention processor that composites per-region attention by mask weight.
pub struct RegionalAttention {
    masks: Arc<RegionMaskSet>,
    height: usize,
    width: usize,
    tokens_per_chunk: usize,
    active: AtomicBool,
    span: tracing::Span,
}

impl std::fmt::Debug for RegionalAttention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionalAttention")
            .field("regions", &self.masks.active_ids())
            .field("height", &self.height)
            .field("width", &self.width)
            .field("active", &self.is_active())
            .finish()
    }
}

impl RegionalAttention {
    /// `height` and `width` are the generation resolution the masks refer to.
    pub fn new(masks: Arc<RegionMaskSet>, height: usize, width: usize) -> Self {
        Self {
            masks,
            height,
            width,
            tokens_per_chunk: TOKENS_PER_CHUNK,
            active: AtomicBool::new(true),
            span: tracing::span!(tracing::Level::TRACE, "regional-attn"),
        }
    }

    pub fn with_tokens_per_chunk(mut self, tokens_per_chunk: usize) -> Self {
        self.tokens_per_chunk = tokens_per_chunk.max(1);
        self
    }

    pub fn masks(&self) -> &RegionMaskSet {
        &self.masks
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Enable or disable compositing; when disabled every call passes through.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed)
    }

    fn chunk(&self, context: &Tensor, index: usize) -> Result<Tensor> {
        context.narrow(1, index * self.tokens_per_chunk, self.tokens_per_chunk)
    }
}

impl AttentionProcessor for RegionalAttention {
    fn forward(
        &self,
        attn: &CrossAttention,
        xs: &Tensor,
        context: Option<&Tensor>,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        if !self.is_active() || self.masks.is_empty() {
            return attn.forward_default(xs, context, mask);
        }

        let (b_sz, seq_len, _) = xs.dims3()?;
        let context = context.unwrap_or(xs);
        let num_chunks = context.dim(1)? / self.tokens_per_chunk;
        if num_chunks <= 1 {
            tracing::debug!(num_chunks, "single conditioning chunk, passing through");
            return attn.forward_default(xs, Some(context), mask);
        }

        let (height, width) = feature_resolution(self.height, self.width, seq_len)?;

        let base_context = self.chunk(context, 0)?;
        let base_out = attn.attend(xs, &base_context, mask)?;
        let inner_dim = base_out.dim(2)?;
        let base_out = base_out.reshape((b_sz, height, width, inner_dim))?;

        let mut acc = match self.masks.base() {
            Some(base) => {
                let weight = resize_mask(base, height, width, base_out.dtype())?;
                base_out.broadcast_mul(&weight)?
            }
            None => base_out.zeros_like()?,
        };

        for region in self.masks.regions() {
            let region_context = if region.id < num_chunks {
                self.chunk(context, region.id)?
            } else {
                base_context.clone()
            };
            let out = attn
                .attend(xs, &region_context, mask)?
                .reshape((b_sz, height, width, inner_dim))?;
            let weight = resize_mask(&region.mask, height, width, out.dtype())?;
            acc = (acc + out.broadcast_mul(&weight)?)?;
        }

        let acc = acc.reshape((b_sz, seq_len, inner_dim))?;
        attn.project_out(&acc)
    }
}
