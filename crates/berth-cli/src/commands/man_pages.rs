use super::EXIT_SUCCESS;
use clap::CommandFactory;
use std::path::Path;

fn render_page(cmd: clap::Command, dir: &Path, name: &str) -> Result<(), String> {
    let mut buf = Vec::new();
    clap_mangen::Man::new(cmd)
        .render(&mut buf)
        .map_err(|e| format!("man page render failed: {e}"))?;
    let path = dir.join(format!("{name}.1"));
    std::fs::write(&path, &buf).map_err(|e| format!("failed to write {}: {e}", path.display()))
}

/// `berth.1` plus one page per subcommand, nested ones included
/// (`berth-engine-ensure.1`).
pub fn run<C: CommandFactory>(dir: &Path) -> Result<u8, String> {
    std::fs::create_dir_all(dir).map_err(|e| format!("failed to create dir: {e}"))?;
    let cmd = C::command();
    render_page(cmd.clone(), dir, "berth")?;
    for sub in cmd.get_subcommands() {
        let sub_name = format!("berth-{}", sub.get_name());
        render_page(sub.clone(), dir, &sub_name)?;
        for nested in sub.get_subcommands() {
            render_page(
                nested.clone(),
                dir,
                &format!("{sub_name}-{}", nested.get_name()),
            )?;
        }
    }
    println!("man pages written to {}", dir.display());
    Ok(EXIT_SUCCESS)
}
