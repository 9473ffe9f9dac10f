//! Cross-attention layer with a replaceable forward processor.
//!
//! The layer mirrors the attention block of a Stable Diffusion UNet: bias-free
//! query/key/value projections, multi-head scaled dot-product attention and a
//! biased output projection. A processor installed on the layer takes over its
//! forward pass, which is how regional attention is hooked in.

use std::sync::Arc;

use candle::{DType, Device, Result, Tensor};
use candle_nn::{Linear, VarBuilder};

/// Replacement forward pass for a [`CrossAttention`] layer.
pub trait AttentionProcessor: Send + Sync {
    /// Compute the layer output for `xs` of shape `(batch, tokens, query_dim)`.
    ///
    /// `context` defaults to `xs` (self-attention) and `mask` is an optional
    /// boolean key mask of shape `(batch, context_tokens)`.
    fn forward(
        &self,
        attn: &CrossAttention,
        xs: &Tensor,
        context: Option<&Tensor>,
        mask: Option<&Tensor>,
    ) -> Result<Tensor>;
}

/// Most negative finite value of `dtype`, used to blank out masked scores.
fn masked_fill_value(dtype: DType, device: &Device) -> Result<Tensor> {
    match dtype {
        DType::F64 => Tensor::new(f64::MIN, device),
        DType::F16 => Tensor::new(half::f16::MIN, device),
        DType::BF16 => Tensor::new(half::bf16::MIN, device),
        _ => Tensor::new(f32::MIN, device)?.to_dtype(dtype),
    }
}

/// Cross-attention layer of a diffusion UNet.
#[derive(Clone)]
pub struct CrossAttention {
    to_q: Linear,
    to_k: Linear,
    to_v: Linear,
    to_out: Linear,
    heads: usize,
    scale: f64,
    processor: Option<Arc<dyn AttentionProcessor>>,
    span: tracing::Span,
}

impl std::fmt::Debug for CrossAttention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossAttention")
            .field("heads", &self.heads)
            .field("hooked", &self.processor.is_some())
            .finish()
    }
}

impl CrossAttention {
    /// `context_dim` of `None` builds a self-attention layer.
    pub fn new(
        query_dim: usize,
        context_dim: Option<usize>,
        heads: usize,
        dim_head: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let inner_dim = heads * dim_head;
        let context_dim = context_dim.unwrap_or(query_dim);
        let to_q = candle_nn::linear_no_bias(query_dim, inner_dim, vb.pp("to_q"))?;
        let to_k = candle_nn::linear_no_bias(context_dim, inner_dim, vb.pp("to_k"))?;
        let to_v = candle_nn::linear_no_bias(context_dim, inner_dim, vb.pp("to_v"))?;
        let to_out = candle_nn::linear(inner_dim, query_dim, vb.pp("to_out.0"))?;
        Ok(Self {
            to_q,
            to_k,
            to_v,
            to_out,
            heads,
            scale: 1.0 / (dim_head as f64).sqrt(),
            processor: None,
            span: tracing::span!(tracing::Level::TRACE, "xa"),
        })
    }

    pub fn heads(&self) -> usize {
        self.heads
    }

    pub fn is_hooked(&self) -> bool {
        self.processor.is_some()
    }

    /// Swap the installed processor, returning the previous one.
    pub fn replace_processor(
        &mut self,
        processor: Option<Arc<dyn AttentionProcessor>>,
    ) -> Option<Arc<dyn AttentionProcessor>> {
        std::mem::replace(&mut self.processor, processor)
    }

    /// `(batch, tokens, heads * dim_head)` to `(batch * heads, tokens, dim_head)`.
    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, n, inner) = xs.dims3()?;
        let dim_head = inner / self.heads;
        xs.reshape((b, n, self.heads, dim_head))?
            .transpose(1, 2)?
            .reshape((b * self.heads, n, dim_head))
    }

    /// `(batch * heads, tokens, dim_head)` to `(batch, tokens, heads * dim_head)`.
    fn merge_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (bh, n, dim_head) = xs.dims3()?;
        let b = bh / self.heads;
        xs.reshape((b, self.heads, n, dim_head))?
            .transpose(1, 2)?
            .reshape((b, n, self.heads * dim_head))
    }

    /// Multi-head attention of `xs` over `context`, before the output projection.
    ///
    /// Returns `(batch, tokens, heads * dim_head)`. Keys where `mask` is zero get the
    /// most negative representable score before the softmax.
    pub fn attend(&self, xs: &Tensor, context: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let q = self.split_heads(&xs.apply(&self.to_q)?)?;
        let k = self.split_heads(&context.apply(&self.to_k)?)?;
        let v = self.split_heads(&context.apply(&self.to_v)?)?;

        let sim = (q.matmul(&k.t()?)? * self.scale)?;
        let sim = match mask {
            None => sim,
            Some(mask) => {
                let (bh, i, j) = sim.dims3()?;
                let b = mask.dim(0)?;
                let mask = mask
                    .flatten_from(1)?
                    .to_dtype(DType::U8)?
                    .unsqueeze(1)?
                    .repeat((1, self.heads, 1))?
                    .reshape((b * self.heads, 1, j))?;
                if b * self.heads != bh {
                    candle::bail!("attention mask batch {b} does not match scores batch {bh}")
                }
                let mask = mask.broadcast_as((bh, i, j))?;
                let fill = masked_fill_value(sim.dtype(), sim.device())?.broadcast_as((bh, i, j))?;
                mask.where_cond(&sim, &fill)?
            }
        };

        let attn = candle_nn::ops::softmax_last_dim(&sim)?;
        self.merge_heads(&attn.matmul(&v)?)
    }

    /// Output projection applied after attention.
    pub fn project_out(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.to_out)
    }

    /// The layer's own forward pass, ignoring any installed processor.
    pub fn forward_default(
        &self,
        xs: &Tensor,
        context: Option<&Tensor>,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let context = context.unwrap_or(xs);
        let out = self.attend(xs, context, mask)?;
        self.project_out(&out)
    }

    /// Forward pass, routed through the installed processor if any.
    pub fn forward(
        &self,
        xs: &Tensor,
        context: Option<&Tensor>,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        match &self.processor {
            Some(processor) => processor.forward(self, xs, context, mask),
            None => self.forward_default(xs, context, mask),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn layer(dev: &Device) -> Result<CrossAttention> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
        CrossAttention::new(8, Some(6), 2, 4, vb)
    }

    #[test]
    fn test_shapes() -> Result<()> {
        let dev = Device::Cpu;
        let attn = layer(&dev)?;
        let xs = Tensor::randn(0f32, 1., (2, 16, 8), &dev)?;
        let ctx = Tensor::randn(0f32, 1., (2, 5, 6), &dev)?;
        assert_eq!(attn.attend(&xs, &ctx, None)?.dims(), &[2, 16, 8]);
        assert_eq!(attn.forward(&xs, Some(&ctx), None)?.dims(), &[2, 16, 8]);
        Ok(())
    }

    #[test]
    fn test_mask_ignores_blanked_keys() -> Result<()> {
        let dev = Device::Cpu;
        let attn = layer(&dev)?;
        let xs = Tensor::randn(0f32, 1., (1, 4, 8), &dev)?;
        let ctx = Tensor::randn(0f32, 1., (1, 5, 6), &dev)?;
        let mask = Tensor::new(&[[1u8, 1, 1, 0, 0]], &dev)?;

        let masked = attn.attend(&xs, &ctx, Some(&mask))?;
        let truncated = attn.attend(&xs, &ctx.narrow(1, 0, 3)?, None)?;
        let diff = (masked - truncated)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-5, "diff {diff}");
        Ok(())
    }

    #[test]
    fn test_fill_value_is_finite() -> Result<()> {
        let dev = Device::Cpu;
        let v = masked_fill_value(DType::F16, &dev)?.to_dtype(DType::F32)?.to_scalar::<f32>()?;
        assert_eq!(v, -65504.0);
        Ok(())
    }
}
