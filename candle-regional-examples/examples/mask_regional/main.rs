//! Regional prompting with colour-coded masks.
//!
//! - **draw**: paint rectangular regions onto a labeled canvas and save it with editor state
//! - **ingest**: decode a saved mask into region masks and print the combined prompt
//! - **demo**: run a randomly initialised attention UNet with and without the regional hooks
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --example mask_regional -- draw \
//!     --rect 1:40,40,200,200 --prompt "1=a red fox" \
//!     --base-prompt "a forest" --output fox.png
//!
//! cargo run --release --example mask_regional -- ingest --mask fox.png --preview preview.png
//!
//! cargo run --release --example mask_regional -- demo --output demo.png
//! ```

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use candle::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_regional::codec::{RegionCodec, RegionTarget};
use candle_regional::colours::brush_hex;
use candle_regional::config::RegionalConfig;
use candle_regional::environment::Environment;
use candle_regional::hooks::Topology;
use candle_regional::host::{AttentionUNet, AttentionUNetConfig, ReferenceModel};
use candle_regional::ingest::setup_masks;
use candle_regional::pipeline::{MaskRegionProcessor, RegionalRequest};
use candle_regional::prompt::RegionalPrompt;
use candle_regional::session::{ColourSession, LabeledCanvas};
use candle_regional::state::{encode_data_url, load_state_png, save_state_png, EditorState};
use clap::{Parser, Subcommand};
use image::{Rgb, RgbImage};

/// Latent downsampling factor of the Stable Diffusion VAE.
const VAE_SCALE_FACTOR: usize = 8;

#[derive(Parser)]
#[command(name = "mask-regional", about = "Regional prompting with colour-coded masks", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Run on CPU rather than on GPU.
    #[arg(long, global = true)]
    cpu: bool,

    /// Enable Chrome tracing profiler.
    #[arg(long, global = true)]
    tracing: bool,

    /// JSON file overriding the regional configuration.
    #[arg(long, global = true)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Paint rectangles onto a blank canvas and save it with the editor state.
    Draw {
        #[arg(long, default_value_t = 512)]
        height: u32,

        #[arg(long, default_value_t = 512)]
        width: u32,

        /// Region rectangle as `id:x,y,w,h`; a negative id erases.
        #[arg(long = "rect")]
        rects: Vec<String>,

        /// Region prompt as `id=text`.
        #[arg(long = "prompt")]
        prompts: Vec<String>,

        #[arg(long, default_value = "")]
        base_prompt: String,

        #[arg(long, default_value = "")]
        negative_prompt: String,

        #[arg(long, default_value = "mask.png")]
        output: String,
    },

    /// Decode a saved mask into region masks.
    Ingest {
        #[arg(long)]
        mask: String,

        /// Region count, used when the saved state has no prompts.
        #[arg(long, default_value_t = 0)]
        regions: usize,

        /// Write the decoded masks back as a labeled image.
        #[arg(long)]
        preview: Option<String>,
    },

    /// Compare a hooked and an unhooked forward pass on random weights.
    Demo {
        #[arg(long, default_value_t = 256)]
        height: usize,

        #[arg(long, default_value_t = 256)]
        width: usize,

        #[arg(long, default_value = "demo.png")]
        output: String,
    },
}

fn parse_rect(arg: &str) -> Result<(RegionTarget, [u32; 4])> {
    let (id, rect) = arg
        .split_once(':')
        .ok_or_else(|| anyhow!("expected id:x,y,w,h, got {arg}"))?;
    let id: i64 = id.trim().parse().with_context(|| format!("bad region id in {arg}"))?;
    let values = rect
        .split(',')
        .map(|v| v.trim().parse::<u32>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("bad rectangle in {arg}"))?;
    let rect: [u32; 4] = values
        .try_into()
        .map_err(|_| anyhow!("expected four rectangle values in {arg}"))?;
    Ok((RegionTarget::from_index(id), rect))
}

fn stroke_layer(canvas: &LabeledCanvas, [x0, y0, w, h]: [u32; 4]) -> RgbImage {
    let (width, height) = canvas.padded().dimensions();
    RgbImage::from_fn(width, height, |x, y| {
        let inside = x >= x0 && x < x0 + w && y >= y0 && y < y0 + h;
        if inside {
            Rgb([255, 255, 255])
        } else {
            Rgb([0, 0, 0])
        }
    })
}

#[allow(clippy::too_many_arguments)]
fn draw(
    config: &RegionalConfig,
    height: u32,
    width: u32,
    rects: &[String],
    prompts: &[String],
    base_prompt: String,
    negative_prompt: String,
    output: &str,
) -> Result<()> {
    let codec = RegionCodec::new(config);
    let mut session = ColourSession::new();
    let mut canvas = session.new_canvas(height, width, true);
    for arg in rects {
        let (target, rect) = parse_rect(arg)?;
        let layer = stroke_layer(&canvas, rect);
        let (next_canvas, next) = codec.commit_stroke(&mut session, &canvas, &layer, target)?;
        canvas = next_canvas;
        if let RegionTarget::Region(id) = target {
            println!("region {id}: brush {}, next {next:?}", brush_hex(id));
        }
    }

    let mut map = BTreeMap::new();
    for arg in prompts {
        let (id, text) = arg
            .split_once('=')
            .ok_or_else(|| anyhow!("expected id=text, got {arg}"))?;
        map.insert(id.trim().to_string(), text.to_string());
    }
    let state = EditorState {
        base_prompt,
        base_neg_prompt: negative_prompt,
        prompts: serde_json::to_string(&map)?,
        ..Default::default()
    };
    if save_state_png(output, &canvas.unpadded(), &state)? {
        println!("saved {output}");
    } else {
        println!("nothing drawn, {output} not written");
    }
    Ok(())
}

fn ingest(
    config: &RegionalConfig,
    mask: &str,
    regions: usize,
    preview: Option<String>,
    device: &Device,
) -> Result<()> {
    let (image, state) = load_state_png(mask)?;
    let prompt = RegionalPrompt::from_dump(
        &state.base_prompt,
        &state.base_neg_prompt,
        &state.prompts,
        regions,
    );
    let mut session = ColourSession::new();
    let set = setup_masks(&mut session, &image, prompt.region_count(), config, device)?;
    for region in set.regions() {
        let pixels = region.mask.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()?;
        println!(
            "region {}: {pixels} pixels, prompt {:?}",
            region.id,
            prompt.region_prompt(region.id, config)
        );
    }
    if let Some(base) = set.base() {
        let pixels = base.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()?;
        println!("base: {pixels} pixels");
    }
    println!("prompt: {}", prompt.combined(config));
    if let Some(path) = preview {
        candle_regional_examples::mask_preview(&set, &mut session)?.save(&path)?;
        println!("preview written to {path}");
    }
    Ok(())
}

fn demo(config: RegionalConfig, height: usize, width: usize, output: &str, device: &Device) -> Result<()> {
    if height % VAE_SCALE_FACTOR != 0 || width % VAE_SCALE_FACTOR != 0 {
        anyhow::bail!("height and width must be multiples of {VAE_SCALE_FACTOR}")
    }
    let mut session = ColourSession::new();
    let (left, right) = (session.colour(1), session.colour(2));
    let mask = RgbImage::from_fn(width as u32, height as u32, |x, _| {
        let third = width as u32 / 3;
        if x < third {
            left
        } else if x >= 2 * third {
            right
        } else {
            Rgb([255, 255, 255])
        }
    });
    let request = RegionalRequest {
        active: true,
        mask_data: encode_data_url(&mask)?,
        base_prompt: "a meadow".to_string(),
        prompts_dump: r#"{"1": "a fox", "2": "a hare"}"#.to_string(),
        ..Default::default()
    };

    let processor = MaskRegionProcessor::with_config(height, width, 1, Environment::default(), config);
    let prepared = processor
        .prepare(&request, &mut session, device)?
        .ok_or_else(|| anyhow!("request was not prepared"))?;
    println!("prompt: {}", prepared.prompt);
    for (key, value) in prepared.metadata.params() {
        println!("{key}: {value}");
    }

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let unet_cfg = AttentionUNetConfig::default();
    let mut model = ReferenceModel {
        unet: AttentionUNet::new(&unet_cfg, vb)?,
        layout: Topology::Standard,
    };
    let chunks = prepared.metadata.regions;
    let latents = Tensor::randn(
        0f32,
        1.,
        (1, unet_cfg.channels, height / VAE_SCALE_FACTOR, width / VAE_SCALE_FACTOR),
        device,
    )?;
    // Stand-in for the text encoder output, one chunk per prompt.
    let context = Tensor::randn(
        0f32,
        1.,
        (1, chunks * processor.config().tokens_per_chunk, unet_cfg.context_dim),
        device,
    )?;

    let plain = model.unet.forward(&latents, &context)?;
    let mut manager = processor.hook_manager(&prepared);
    let regional = {
        let guard = manager.scoped(&mut model);
        guard.unet.forward(&latents, &context)?
    };
    let diff = (regional - &plain)?.abs()?.mean_all()?.to_scalar::<f32>()?;
    println!("mean absolute difference to the unhooked pass: {diff:.6}");

    candle_regional_examples::mask_preview(prepared.masks(), &mut session)?.save(output)?;
    println!("mask preview written to {output}");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = candle_regional_examples::setup_tracing(cli.tracing);
    let device = candle_regional_examples::device(cli.cpu)?;
    let config = match cli.config.as_deref() {
        Some(path) => RegionalConfig::from_file(path)?,
        None => RegionalConfig::default(),
    };
    config.validate()?;
    tracing::info!(?device, tokens_per_chunk = config.tokens_per_chunk, "starting");

    match cli.command {
        Command::Draw {
            height,
            width,
            rects,
            prompts,
            base_prompt,
            negative_prompt,
            output,
        } => draw(
            &config,
            height,
            width,
            &rects,
            &prompts,
            base_prompt,
            negative_prompt,
            &output,
        ),
        Command::Ingest {
            mask,
            regions,
            preview,
        } => ingest(&config, &mask, regions, preview, &device),
        Command::Demo {
            height,
            width,
            output,
        } => demo(config, height, width, &output, &device),
    }
}
