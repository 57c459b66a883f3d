//! Compose manifest rendering.
//!
//! `render_manifest` is pure: the same template and context always produce
//! byte-identical text, so a manifest can be regenerated at any time without
//! reading what was written before.

use crate::context::{setting_text, ExtraContext, InstanceContext};
use crate::naming::{container_name, short_id};
use crate::template::{non_empty, ContainerTemplate, LimitValue};
use crate::types::ContainerName;
use crate::ManifestError;
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// File name of the rendered manifest inside an instance directory.
pub const MANIFEST_FILE: &str = "docker-compose.yml";

const DEFAULT_RESTART: &str = "unless-stopped";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderOptions {
    /// Use host networking regardless of the template (delegated execution).
    pub force_host_network: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedManifest {
    pub text: String,
    pub container_name: ContainerName,
    /// Placeholders still present after substitution, sorted and deduplicated.
    pub unresolved: Vec<String>,
}

impl RenderedManifest {
    /// Blake3 digest of the manifest text.
    pub fn digest(&self) -> String {
        blake3::hash(self.text.as_bytes()).to_hex().to_string()
    }
}

struct Resolver {
    pairs: Vec<(String, String)>,
}

impl Resolver {
    fn new(ctx: &InstanceContext, extra: &ExtraContext) -> Self {
        let mut pairs = vec![
            ("{instance_id}".to_owned(), ctx.instance_id.clone()),
            (
                "{instance_id_short}".to_owned(),
                short_id(&ctx.instance_id).to_owned(),
            ),
            ("{instance_name}".to_owned(), ctx.instance_name.clone()),
            ("{module_name}".to_owned(), ctx.module_name.clone()),
        ];
        let optional = [
            ("{port}", ctx.port.map(|p| p.to_string())),
            ("{rcon_port}", ctx.rcon_port.map(|p| p.to_string())),
            ("{rest_port}", ctx.rest_port.map(|p| p.to_string())),
            ("{rest_password}", ctx.rest_password.clone()),
            ("{java_version}", extra.java_version.clone()),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                pairs.push((key.to_owned(), value));
            }
        }
        for (key, value) in &ctx.module_settings {
            pairs.push((format!("{{{key}}}"), setting_text(value)));
        }
        Self { pairs }
    }

    fn resolve(&self, input: &str) -> String {
        let mut out = input.to_owned();
        for (key, value) in &self.pairs {
            if out.contains(key.as_str()) {
                out = out.replace(key.as_str(), value);
            }
        }
        out
    }

    fn limit(&self, value: &LimitValue) -> String {
        match value {
            LimitValue::Text(s) => self.resolve(s),
            other => other.to_string(),
        }
    }
}

/// Double-quoted YAML scalar.
fn quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// `{name}` tokens left in `text`. `${VAR}` shell expansions are not placeholders.
fn unresolved_placeholders(text: &str) -> Vec<String> {
    let mut found = BTreeSet::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' && (i == 0 || bytes[i - 1] != b'$') {
            if let Some(len) = text[i + 1..].find('}') {
                let inner = &text[i + 1..i + 1 + len];
                if !inner.is_empty()
                    && inner
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    found.insert(format!("{{{inner}}}"));
                    i += len + 2;
                    continue;
                }
            }
        }
        i += 1;
    }
    found.into_iter().collect()
}

pub fn render_manifest(
    template: &ContainerTemplate,
    ctx: &InstanceContext,
    extra: &ExtraContext,
    options: RenderOptions,
) -> Result<RenderedManifest, ManifestError> {
    let image = template.image().ok_or(ManifestError::MissingImage)?;
    let r = Resolver::new(ctx, extra);
    let name = container_name(&ctx.module_name, &ctx.instance_id);

    let mut lines = vec![
        "services:".to_owned(),
        format!("  {}:", ctx.module_name),
        format!("    image: {}", r.resolve(image)),
        format!("    container_name: {name}"),
        format!(
            "    restart: {}",
            non_empty(template.restart.as_deref()).unwrap_or(DEFAULT_RESTART)
        ),
    ];

    let host_network =
        options.force_host_network || template.network_mode.as_deref() == Some("host");
    if host_network {
        // Published ports are ignored under host networking.
        lines.push("    network_mode: host".to_owned());
    } else if !template.ports.is_empty() {
        lines.push("    ports:".to_owned());
        for p in &template.ports {
            lines.push(format!("      - {}", quoted(&r.resolve(p))));
        }
    }

    if !template.volumes.is_empty() {
        lines.push("    volumes:".to_owned());
        for v in &template.volumes {
            lines.push(format!("      - {}", quoted(&r.resolve(v))));
        }
    }

    if !template.environment.is_empty() {
        lines.push("    environment:".to_owned());
        for (key, value) in &template.environment {
            lines.push(format!(
                "      {key}: {}",
                quoted(&r.resolve(&setting_text(value)))
            ));
        }
    }

    if let Some(dir) = non_empty(template.working_dir.as_deref()) {
        lines.push(format!("    working_dir: {}", r.resolve(dir)));
    }

    let entrypoint = non_empty(template.entrypoint.as_deref());
    if let Some(ep) = entrypoint {
        let resolved = r.resolve(ep);
        let parts: Vec<String> = resolved.split_whitespace().map(quoted).collect();
        lines.push(format!("    entrypoint: [{}]", parts.join(", ")));
    }

    if let Some(cmd) = non_empty(template.command.as_deref()) {
        let resolved = r.resolve(cmd);
        if entrypoint.is_some() {
            // exec form: the whole command is one argument to the entrypoint
            lines.push(format!("    command: [{}]", quoted(&resolved)));
        } else {
            // shell form: the engine prepends /bin/sh -c
            lines.push(format!("    command: {}", quoted(&resolved)));
        }
    }

    if let Some(user) = non_empty(template.user.as_deref()) {
        lines.push(format!("    user: {}", quoted(&r.resolve(user))));
    }

    let cpu = ctx
        .overrides
        .cpu_limit
        .as_ref()
        .or(template.cpu_limit.as_ref());
    let memory = ctx
        .overrides
        .memory_limit
        .as_ref()
        .or(template.memory_limit.as_ref());
    if cpu.is_some() || memory.is_some() {
        lines.push("    deploy:".to_owned());
        lines.push("      resources:".to_owned());
        lines.push("        limits:".to_owned());
        if let Some(cpu) = cpu {
            lines.push(format!("          cpus: {}", quoted(&r.limit(cpu))));
        }
        if let Some(memory) = memory {
            lines.push(format!("          memory: {}", r.limit(memory)));
        }
    }

    lines.push("    stdin_open: true".to_owned());

    let mut text = lines.join("\n");
    text.push('\n');
    let unresolved = unresolved_placeholders(&text);

    Ok(RenderedManifest {
        text,
        container_name: name,
        unresolved,
    })
}

pub fn manifest_path(instance_dir: &Path) -> PathBuf {
    instance_dir.join(MANIFEST_FILE)
}

/// Read the manifest of an instance, `None` if it was never rendered.
pub fn read_manifest(instance_dir: &Path) -> Result<Option<String>, ManifestError> {
    match fs::read_to_string(manifest_path(instance_dir)) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Atomically write the manifest into `instance_dir`.
///
/// Returns `false` without touching the file when the content is unchanged.
pub fn write_manifest(
    instance_dir: &Path,
    manifest: &RenderedManifest,
) -> Result<bool, ManifestError> {
    if read_manifest(instance_dir)?.as_deref() == Some(manifest.text.as_str()) {
        return Ok(false);
    }
    fs::create_dir_all(instance_dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(instance_dir)?;
    tmp.write_all(manifest.text.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(manifest_path(instance_dir))
        .map_err(|e| ManifestError::Io(e.error))?;
    Ok(true)
}
