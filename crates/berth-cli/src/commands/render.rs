use super::{json_pretty, read_stdin, EXIT_SUCCESS};
use berth_core::instance_context;
use berth_schema::{
    manifest_path, parse_template_file, render_manifest, write_manifest, ExtraContext,
    ManifestError, RenderOptions,
};
use serde_json::{json, Value};
use std::io::IsTerminal;
use std::path::Path;

const DEFAULT_JAVA_VERSION: &str = "21";

fn instance_data(path: Option<&Path>) -> Result<Value, String> {
    let text = match path {
        Some(p) => std::fs::read_to_string(p)
            .map_err(|e| format!("failed to read {}: {e}", p.display()))?,
        None if std::io::stdin().is_terminal() => String::new(),
        None => read_stdin()?,
    };
    if text.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(&text).map_err(|e| format!("invalid instance JSON: {e}"))
}

pub fn run(
    template: &Path,
    instance: Option<&Path>,
    java_version: Option<String>,
    host_network: bool,
    write: Option<&Path>,
    json: bool,
) -> Result<u8, String> {
    let template = parse_template_file(template).map_err(|e| e.to_string())?;
    if !template.has_image() {
        return Err(ManifestError::MissingImage.to_string());
    }
    let data = instance_data(instance)?;
    let java_version = java_version.or_else(|| {
        template
            .image_mentions("{java_version}")
            .then(|| DEFAULT_JAVA_VERSION.to_owned())
    });
    let rendered = render_manifest(
        &template,
        &instance_context(&data),
        &ExtraContext { java_version },
        RenderOptions {
            force_host_network: host_network,
        },
    )
    .map_err(|e| e.to_string())?;
    for placeholder in &rendered.unresolved {
        eprintln!("warning: unresolved placeholder {placeholder}");
    }

    let Some(dir) = write else {
        if json {
            let payload = json!({
                "container_name": rendered.container_name,
                "manifest": rendered.text,
                "unresolved_placeholders": rendered.unresolved,
            });
            println!("{}", json_pretty(&payload)?);
        } else {
            print!("{}", rendered.text);
        }
        return Ok(EXIT_SUCCESS);
    };

    let changed = write_manifest(dir, &rendered).map_err(|e| e.to_string())?;
    let path = manifest_path(dir);
    if json {
        let payload = json!({
            "container_name": rendered.container_name,
            "path": path,
            "changed": changed,
            "unresolved_placeholders": rendered.unresolved,
        });
        println!("{}", json_pretty(&payload)?);
    } else if changed {
        println!("wrote {}", path.display());
    } else {
        println!("{} unchanged", path.display());
    }
    Ok(EXIT_SUCCESS)
}
