#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use std::sync::Arc;

use candle::{DType, Device, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_regional::attention::AttentionProcessor;
use candle_regional::colours::BACKGROUND;
use candle_regional::compositor::RegionalAttention;
use candle_regional::config::RegionalConfig;
use candle_regional::hooks::{AttentionHost, HookManager, ModuleMut, Topology};
use candle_regional::host::{AttentionUNet, AttentionUNetConfig, ReferenceModel};
use candle_regional::ingest::{setup_masks, RegionMaskSet};
use candle_regional::session::ColourSession;
use image::RgbImage;

fn model(layout: Topology, dev: &Device) -> Result<ReferenceModel> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
    let cfg = AttentionUNetConfig {
        channels: 8,
        context_dim: 6,
        heads: 2,
        depth: 2,
    };
    Ok(ReferenceModel {
        unet: AttentionUNet::new(&cfg, vb)?,
        layout,
    })
}

fn hooked_layers(unet: &mut AttentionUNet) -> Vec<String> {
    let mut hooked = Vec::new();
    unet.visit_modules_mut(&mut |name: &str, module: ModuleMut<'_>| {
        if let ModuleMut::CrossAttention(attn) = module {
            if attn.is_hooked() {
                hooked.push(name.to_string());
            }
        }
    });
    hooked
}

fn empty_processor() -> Arc<dyn AttentionProcessor> {
    Arc::new(RegionalAttention::new(Arc::new(RegionMaskSet::empty()), 64, 64))
}

#[test]
fn install_and_uninstall_are_idempotent() -> Result<()> {
    let mut model = model(Topology::Standard, &Device::Cpu)?;
    let mut manager = HookManager::new(empty_processor(), Topology::Standard, "attn2");

    assert_eq!(manager.uninstall(&mut model), 0);
    assert_eq!(manager.install(&mut model), 2);
    assert_eq!(manager.install(&mut model), 0);
    let hooked = hooked_layers(&mut model.unet);
    assert_eq!(
        hooked,
        vec![
            "input_blocks.0.1.transformer_blocks.0.attn2",
            "input_blocks.1.1.transformer_blocks.0.attn2",
        ]
    );
    assert_eq!(manager.installed().collect::<Vec<_>>(), hooked);

    assert_eq!(manager.uninstall(&mut model), 2);
    assert_eq!(manager.uninstall(&mut model), 0);
    assert!(!manager.is_installed());
    assert!(hooked_layers(&mut model.unet).is_empty());
    Ok(())
}

#[test]
fn forge_topology_falls_back() -> Result<()> {
    for layout in [Topology::Standard, Topology::Forge] {
        let mut model = model(layout, &Device::Cpu)?;
        let mut manager = HookManager::new(empty_processor(), Topology::Forge, "attn2");
        assert_eq!(manager.install(&mut model), 2);
        assert_eq!(manager.uninstall(&mut model), 2);
    }
    Ok(())
}

#[test]
fn guard_removes_hooks_on_drop() -> Result<()> {
    let dev = Device::Cpu;
    let mut model = model(Topology::Standard, &dev)?;
    let mut manager = HookManager::new(empty_processor(), Topology::Standard, "attn2");
    {
        let mut guard = manager.scoped(&mut model);
        assert_eq!(hooked_layers(&mut guard.unet).len(), 2);
    }
    assert!(hooked_layers(&mut model.unet).is_empty());
    assert!(!manager.is_installed());
    Ok(())
}

#[test]
fn hooked_network_without_regions_is_unchanged() -> Result<()> {
    let dev = Device::Cpu;
    let mut model = model(Topology::Standard, &dev)?;
    let latents = Tensor::randn(0f32, 1., (1, 8, 8, 8), &dev)?;
    let context = Tensor::randn(0f32, 1., (1, 2 * 77, 6), &dev)?;
    let expected = model.unet.forward(&latents, &context)?;

    let mut manager = HookManager::new(empty_processor(), Topology::Standard, "attn2");
    let guard = manager.scoped(&mut model);
    let out = guard.unet.forward(&latents, &context)?;
    let diff = (out - &expected)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
    assert!(diff < 1e-6);
    Ok(())
}

#[test]
fn hooked_network_with_regions() -> Result<()> {
    let dev = Device::Cpu;
    let mut model = model(Topology::Standard, &dev)?;
    let mut session = ColourSession::new();
    let mut img = RgbImage::from_pixel(64, 64, BACKGROUND);
    let colour = session.colour(1);
    for y in 0..64 {
        for x in 0..32 {
            img.put_pixel(x, y, colour);
        }
    }
    let masks = setup_masks(&mut session, &img, 1, &RegionalConfig::default(), &dev)?;
    let processor: Arc<dyn AttentionProcessor> =
        Arc::new(RegionalAttention::new(Arc::new(masks), 64, 64));

    // 64x64 pixels map to an 8x8 latent, then 4x4 after the first block.
    let latents = Tensor::randn(0f32, 1., (1, 8, 8, 8), &dev)?;
    let context = Tensor::randn(0f32, 1., (1, 2 * 77, 6), &dev)?;
    let mut manager = HookManager::new(processor, Topology::Standard, "attn2");
    let guard = manager.scoped(&mut model);
    let out = guard.unet.forward(&latents, &context)?;
    assert_eq!(out.dims(), &[1, 8, 2, 2]);
    Ok(())
}
