//! Mask-driven regional prompting for diffusion cross-attention.
//!
//! A user paints colour-coded regions on a canvas and gives each region its own
//! prompt. This crate turns the painted canvas into per-region masks and replaces
//! the cross-attention layers of a denoising network with a compositor that
//! attends to each region's conditioning chunk separately and blends the results
//! by mask weight:
//! - **Colour allocation**: a deterministic, append-only palette bisecting the hue circle
//! - **Region codec**: stroke bitmaps to labeled canvases and back to binary masks
//! - **Mask ingestion**: flattened mask images to region and base mask tensors
//! - **Attention compositor**: per-chunk attention weighted by resized masks
//! - **Hook manager**: reversible, per-layer installation of the compositor
//!
//! # Data flow
//!
//! ```text
//! mask image + prompts ──→ setup_masks ──→ RegionMaskSet ──┐
//!          │                                               ↓
//!          └──→ RegionalPrompt ──→ "base BREAK r1 BREAK r2" │
//!                                                          ↓
//!                  HookManager::install ──→ RegionalAttention on every attn2
//! ```
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --example mask_regional -- demo --output demo.png
//! ```

pub mod attention;
pub mod codec;
pub mod colours;
pub mod compositor;
pub mod config;
pub mod contour;
pub mod environment;
pub mod hooks;
pub mod host;
pub mod ingest;
pub mod pipeline;
pub mod prompt;
pub mod session;
pub mod state;

pub use attention::{AttentionProcessor, CrossAttention};
pub use codec::{RegionCodec, RegionTarget};
pub use colours::ColourSequence;
pub use compositor::{feature_resolution, RegionalAttention};
pub use config::{MaskPrecision, RegionalConfig};
pub use environment::{Environment, HostFlavor, ModelFamily};
pub use hooks::{AttentionHost, HookGuard, HookManager, HostModel, ModuleMut, Topology};
pub use host::{AttentionUNet, AttentionUNetConfig, ReferenceModel};
pub use ingest::{setup_masks, RegionMask, RegionMaskSet};
pub use pipeline::{MaskRegionProcessor, PreparedRequest, RegionalRequest};
pub use prompt::{GenerationMetadata, RegionalPrompt};
pub use session::{ColourSession, LabeledCanvas};
pub use state::EditorState;
