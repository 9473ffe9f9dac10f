//! Reversible installation of an attention processor on a host network.
//!
//! Every submodule whose name contains the configured marker and which is a
//! [`CrossAttention`] layer gets the processor; the processor it replaced is kept
//! by the [`HookManager`] so removal restores the layer exactly.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::attention::{AttentionProcessor, CrossAttention};

/// Mutable view of a named submodule during traversal.
pub enum ModuleMut<'a> {
    CrossAttention(&'a mut CrossAttention),
    /// Any other module, identified by its type name.
    Other(&'static str),
}

/// A network whose named submodules can be visited mutably.
pub trait AttentionHost {
    fn visit_modules_mut(&mut self, f: &mut dyn FnMut(&str, ModuleMut<'_>));
}

/// Entry point of a loaded model exposing its denoising network.
pub trait HostModel {
    /// Network reached through the standard model layout.
    fn diffusion_model(&mut self) -> &mut dyn AttentionHost;

    /// Network reached through the Forge model layout, if the model has one.
    fn forge_unet(&mut self) -> Option<&mut dyn AttentionHost> {
        None
    }
}

/// How the denoising network is found on the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Topology {
    #[default]
    Standard,
    Forge,
}

impl Topology {
    pub fn new(is_forge: bool) -> Self {
        if is_forge {
            Self::Forge
        } else {
            Self::Standard
        }
    }

    /// Visit the modules of this topology's root network. A missing Forge root falls
    /// back to the standard layout.
    pub fn visit(&self, model: &mut dyn HostModel, f: &mut dyn FnMut(&str, ModuleMut<'_>)) {
        if *self == Self::Forge {
            if let Some(root) = model.forge_unet() {
                root.visit_modules_mut(f);
                return;
            }
            tracing::warn!("forge network not found, using the standard layout");
        }
        model.diffusion_model().visit_modules_mut(f);
    }
}

/// Installs one processor on every matching cross-attention layer and undoes it.
pub struct HookManager {
    processor: Arc<dyn AttentionProcessor>,
    topology: Topology,
    marker: String,
    originals: BTreeMap<String, Option<Arc<dyn AttentionProcessor>>>,
}

impl std::fmt::Debug for HookManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookManager")
            .field("topology", &self.topology)
            .field("marker", &self.marker)
            .field("installed", &self.originals.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HookManager {
    pub fn new(processor: Arc<dyn AttentionProcessor>, topology: Topology, marker: &str) -> Self {
        Self {
            processor,
            topology,
            marker: marker.to_string(),
            originals: BTreeMap::new(),
        }
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn is_installed(&self) -> bool {
        !self.originals.is_empty()
    }

    /// Names of the layers currently hooked.
    pub fn installed(&self) -> impl Iterator<Item = &str> {
        self.originals.keys().map(String::as_str)
    }

    /// Hook every matching layer not hooked yet. Returns the number of newly hooked layers.
    pub fn install(&mut self, model: &mut dyn HostModel) -> usize {
        let processor = self.processor.clone();
        let marker = self.marker.as_str();
        let originals = &mut self.originals;
        let mut count = 0;
        self.topology
            .visit(model, &mut |name: &str, module: ModuleMut<'_>| {
                if let ModuleMut::CrossAttention(attn) = module {
                    if name.contains(marker) && !originals.contains_key(name) {
                        let original = attn.replace_processor(Some(processor.clone()));
                        originals.insert(name.to_string(), original);
                        count += 1;
                    }
                }
            });
        tracing::debug!(count, topology = ?self.topology, "installed regional attention");
        count
    }

    /// Restore every layer hooked by this manager. Returns the number of restored layers;
    /// a manager that never installed anything does nothing.
    pub fn uninstall(&mut self, model: &mut dyn HostModel) -> usize {
        if self.originals.is_empty() {
            return 0;
        }
        let originals = &mut self.originals;
        let mut count = 0;
        self.topology
            .visit(model, &mut |name: &str, module: ModuleMut<'_>| {
                if let ModuleMut::CrossAttention(attn) = module {
                    if let Some(original) = originals.remove(name) {
                        attn.replace_processor(original);
                        count += 1;
                    }
                }
            });
        if !self.originals.is_empty() {
            tracing::warn!(
                missing = self.originals.len(),
                "hooked layers disappeared before removal"
            );
            self.originals.clear();
        }
        tracing::debug!(count, "removed regional attention");
        count
    }

    /// Install on `model` for the lifetime of the returned guard.
    pub fn scoped<'a, M: HostModel>(&'a mut self, model: &'a mut M) -> HookGuard<'a, M> {
        self.install(&mut *model);
        HookGuard {
            manager: self,
            model,
        }
    }
}

/// Keeps hooks installed on a model; removes them when dropped.
pub struct HookGuard<'a, M: HostModel> {
    manager: &'a mut HookManager,
    model: &'a mut M,
}

impl<M: HostModel> Deref for HookGuard<'_, M> {
    type Target = M;

    fn deref(&self) -> &M {
        &*self.model
    }
}

impl<M: HostModel> DerefMut for HookGuard<'_, M> {
    fn deref_mut(&mut self) -> &mut M {
        &mut *self.model
    }
}

impl<M: HostModel> Drop for HookGuard<'_, M> {
    fn drop(&mut self) {
        self.manager.uninstall(&mut *self.model);
    }
}
