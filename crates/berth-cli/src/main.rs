mod commands;

use berth_runtime::EngineInstallation;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{EngineAction, EXIT_ENGINE_ERROR, EXIT_FAILURE, EXIT_MANIFEST_ERROR};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "berth",
    version,
    about = "Portable container engine supervisor and compose orchestrator for game servers"
)]
struct Cli {
    /// Engine installation directory.
    #[arg(long, env = "BERTH_HOME", global = true)]
    install_dir: Option<PathBuf>,

    /// Route engine commands through the Linux subsystem.
    #[arg(long, default_value_t = false, global = true, conflicts_with = "native")]
    delegated: bool,

    /// Run engine commands directly on this host.
    #[arg(long, default_value_t = false, global = true)]
    native: bool,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Answer one orchestration hook: JSON request on stdin, JSON response on stdout.
    Hook {
        /// Hook name (start, stop, status, provision, ...).
        name: String,
    },
    /// Install, start, stop, or inspect the managed container engine.
    Engine {
        #[command(subcommand)]
        action: EngineAction,
    },
    /// Render a module template into a compose manifest.
    Render {
        /// Module TOML file with a [container] or [docker] section.
        template: PathBuf,
        /// Instance data as JSON (default: stdin).
        #[arg(long)]
        instance: Option<PathBuf>,
        /// Value for `{java_version}` placeholders.
        #[arg(long)]
        java_version: Option<String>,
        /// Use host networking instead of port mappings.
        #[arg(long, default_value_t = false)]
        host_network: bool,
        /// Write docker-compose.yml into this directory instead of printing it.
        #[arg(long)]
        write: Option<PathBuf>,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
    /// Generate man pages in the specified directory.
    ManPages {
        /// Output directory for man pages.
        #[arg(default_value = "man")]
        dir: PathBuf,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    // stdout carries the result; everything else goes to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("BERTH_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    berth_core::install_signal_handler();

    let global = commands::GlobalOptions {
        install_dir: cli.install_dir.unwrap_or_else(EngineInstallation::default_root),
        delegated: if cli.delegated {
            Some(true)
        } else if cli.native {
            Some(false)
        } else {
            None
        },
        json: cli.json,
    };

    let result = match cli.command {
        Commands::Hook { name } => commands::hook::run(&global, &name),
        Commands::Engine { action } => commands::engine::run(&global, action),
        Commands::Render {
            template,
            instance,
            java_version,
            host_network,
            write,
        } => commands::render::run(
            &template,
            instance.as_deref(),
            java_version,
            host_network,
            write.as_deref(),
            global.json,
        ),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
        Commands::ManPages { dir } => commands::man_pages::run::<Cli>(&dir),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("manifest error:")
                || msg.starts_with("failed to parse module template")
                || msg.starts_with("failed to read or write manifest")
                || msg.starts_with("module file has no")
                || msg.starts_with("container template has no image")
            {
                EXIT_MANIFEST_ERROR
            } else if msg.starts_with("container engine") || msg.starts_with("engine lock") {
                EXIT_ENGINE_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}
