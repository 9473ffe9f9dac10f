//! Host environment capabilities, determined once and passed around as plain values.

/// Flavour of the hosting web UI, derived from its git tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostFlavor {
    #[default]
    Standard,
    Forge,
    ReForge,
}

impl HostFlavor {
    /// Forge tags start with `f2` (or are `neo`), reForge tags with `f1` (or are `classic`).
    pub fn from_git_tag(tag: &str) -> Self {
        if tag.starts_with("f2") || tag == "neo" {
            Self::Forge
        } else if tag.starts_with("f1") || tag == "classic" {
            Self::ReForge
        } else {
            Self::Standard
        }
    }
}

/// Model architecture of the loaded checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelFamily {
    #[default]
    Sd1,
    Sd2,
    Sdxl,
    Flux,
}

impl ModelFamily {
    pub fn from_type_name(name: &str) -> Self {
        match name {
            "StableDiffusionXL" => Self::Sdxl,
            "StableDiffusion2" => Self::Sd2,
            "Flux" => Self::Flux,
            _ => Self::Sd1,
        }
    }
}

/// Capabilities of the environment a request runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Environment {
    pub host: HostFlavor,
    pub family: ModelFamily,
}

impl Environment {
    /// Detection never fails: unknown or missing inputs fall back to the standard host
    /// and the SD1 family.
    pub fn detect(git_tag: Option<&str>, model_type: Option<&str>) -> Self {
        let host = git_tag.map(HostFlavor::from_git_tag).unwrap_or_default();
        let family = model_type.map(ModelFamily::from_type_name).unwrap_or_default();
        if git_tag.is_none() {
            tracing::debug!("no host git tag, assuming the standard host");
        }
        Self { host, family }
    }

    pub fn is_forge(&self) -> bool {
        self.host == HostFlavor::Forge
    }
}
