//! Minimal UNet-style host network.
//!
//! Each depth runs a transformer block (self-attention `attn1`, cross-attention
//! `attn2`) over the flattened feature map and then halves the resolution with a
//! stride-2 convolution, matching the downsampling cadence of Stable Diffusion.
//! Module names follow the `input_blocks.{i}.1.transformer_blocks.0.attn{1,2}`
//! layout of the original checkpoints.

use candle::{Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder};

use crate::attention::CrossAttention;
use crate::hooks::{AttentionHost, HostModel, ModuleMut, Topology};

#[derive(Debug, Clone, PartialEq)]
pub struct AttentionUNetConfig {
    pub channels: usize,
    pub context_dim: usize,
    pub heads: usize,
    pub depth: usize,
}

impl Default for AttentionUNetConfig {
    fn default() -> Self {
        Self {
            channels: 32,
            context_dim: 48,
            heads: 4,
            depth: 3,
        }
    }
}

#[derive(Debug, Clone)]
struct TransformerBlock {
    attn1: CrossAttention,
    attn2: CrossAttention,
}

impl TransformerBlock {
    fn new(cfg: &AttentionUNetConfig, vb: VarBuilder) -> Result<Self> {
        let dim_head = cfg.channels / cfg.heads;
        let attn1 = CrossAttention::new(cfg.channels, None, cfg.heads, dim_head, vb.pp("attn1"))?;
        let attn2 = CrossAttention::new(
            cfg.channels,
            Some(cfg.context_dim),
            cfg.heads,
            dim_head,
            vb.pp("attn2"),
        )?;
        Ok(Self { attn1, attn2 })
    }

    /// `xs` is `(batch, channels, height, width)`.
    fn forward(&self, xs: &Tensor, context: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = xs.dims4()?;
        let tokens = xs.flatten_from(2)?.transpose(1, 2)?.contiguous()?;
        let tokens = (&tokens + self.attn1.forward(&tokens, None, None)?)?;
        let tokens = (&tokens + self.attn2.forward(&tokens, Some(context), None)?)?;
        tokens.transpose(1, 2)?.reshape((b, c, h, w))
    }
}

/// Stack of attention blocks with strided downsampling in between.
#[derive(Debug, Clone)]
pub struct AttentionUNet {
    blocks: Vec<(TransformerBlock, Conv2d)>,
}

impl AttentionUNet {
    pub fn new(cfg: &AttentionUNetConfig, vb: VarBuilder) -> Result<Self> {
        if cfg.heads == 0 || cfg.channels % cfg.heads != 0 {
            candle::bail!(
                "channels ({}) must be a multiple of heads ({})",
                cfg.channels,
                cfg.heads
            )
        }
        let conv_cfg = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let vb = vb.pp("input_blocks");
        let blocks = (0..cfg.depth)
            .map(|i| {
                let vb = vb.pp(i.to_string());
                let block = TransformerBlock::new(cfg, vb.pp("1").pp("transformer_blocks.0"))?;
                let down = candle_nn::conv2d(cfg.channels, cfg.channels, 3, conv_cfg, vb.pp("0"))?;
                Ok((block, down))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { blocks })
    }

    /// Run every block on `latents` `(batch, channels, height, width)`, returning the
    /// features of the deepest level.
    pub fn forward(&self, latents: &Tensor, context: &Tensor) -> Result<Tensor> {
        let mut xs = latents.clone();
        for (block, down) in self.blocks.iter() {
            xs = block.forward(&xs, context)?;
            xs = down.forward(&xs)?;
        }
        Ok(xs)
    }
}

impl AttentionHost for AttentionUNet {
    fn visit_modules_mut(&mut self, f: &mut dyn FnMut(&str, ModuleMut<'_>)) {
        for (i, (block, _)) in self.blocks.iter_mut().enumerate() {
            f(&format!("input_blocks.{i}.0"), ModuleMut::Other("Conv2d"));
            let prefix = format!("input_blocks.{i}.1.transformer_blocks.0");
            f(&prefix, ModuleMut::Other("BasicTransformerBlock"));
            f(&format!("{prefix}.attn1"), ModuleMut::CrossAttention(&mut block.attn1));
            f(&format!("{prefix}.attn2"), ModuleMut::CrossAttention(&mut block.attn2));
        }
    }
}

/// Model wrapper exposing an [`AttentionUNet`] through either host layout.
#[derive(Debug, Clone)]
pub struct ReferenceModel {
    pub unet: AttentionUNet,
    pub layout: Topology,
}

impl HostModel for ReferenceModel {
    fn diffusion_model(&mut self) -> &mut dyn AttentionHost {
        &mut self.unet
    }

    fn forge_unet(&mut self) -> Option<&mut dyn AttentionHost> {
        match self.layout {
            Topology::Forge => Some(&mut self.unet),
            Topology::Standard => None,
        }
    }
}
