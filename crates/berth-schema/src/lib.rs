//! Container templates, instance context, and manifest rendering for Berth.
//!
//! This crate is the pure layer of the system: module container templates
//! (`ContainerTemplate`, parsed from hook JSON or a module's TOML file), the
//! per-instance substitution context (`InstanceContext`, `ExtraContext`),
//! deterministic container naming, and `render_manifest`, which turns the two
//! into compose manifest text without touching the filesystem.

pub mod context;
pub mod naming;
pub mod render;
pub mod template;
pub mod types;

pub use context::{ExtraContext, InstanceContext, ResourceOverrides};
pub use naming::{container_name, short_id, CONTAINER_PREFIX};
pub use render::{
    manifest_path, read_manifest, render_manifest, write_manifest, RenderOptions,
    RenderedManifest, MANIFEST_FILE,
};
pub use template::{parse_template_file, parse_template_str, ContainerTemplate, LimitValue};
pub use types::{ContainerName, InstanceId, ModuleName};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read or write manifest: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse module template: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("failed to parse container template: {0}")]
    ParseJson(#[from] serde_json::Error),
    #[error("container template has no image")]
    MissingImage,
    #[error("module file has no [container] or [docker] section")]
    MissingSection,
}
