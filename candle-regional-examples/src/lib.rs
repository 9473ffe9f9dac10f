use candle::utils::{cuda_is_available, metal_is_available};
use candle::{DType, Device, Result};
use candle_regional::colours::BACKGROUND;
use candle_regional::ingest::RegionMaskSet;
use candle_regional::session::ColourSession;
use image::RgbImage;
use tracing_chrome::ChromeLayerBuilder;
use tracing_subscriber::prelude::*;

pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            println!(
                "Running on CPU, to run on GPU(metal), build this example with `--features metal`"
            );
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            println!("Running on CPU, to run on GPU, build this example with `--features cuda`");
        }
        Ok(Device::Cpu)
    }
}

/// Initialize Chrome tracing if enabled.
///
/// Returns a guard that must be kept alive for the duration of tracing.
pub fn setup_tracing(enabled: bool) -> Option<tracing_chrome::FlushGuard> {
    if enabled {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry().with(chrome_layer).init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();
        None
    }
}

/// Render the masks of `set` back into a labeled raster, each region in its palette colour.
pub fn mask_preview(set: &RegionMaskSet, session: &mut ColourSession) -> Result<RgbImage> {
    let (height, width) = set.dims();
    let mut img = RgbImage::from_pixel(width as u32, height as u32, BACKGROUND);
    for region in set.regions() {
        let colour = session.colour(region.id);
        let values = region.mask.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        for (i, v) in values.into_iter().enumerate() {
            if v > 0.5 {
                img.put_pixel((i % width) as u32, (i / width) as u32, colour);
            }
        }
    }
    Ok(img)
}
