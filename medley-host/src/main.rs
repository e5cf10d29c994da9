//! # Medley Host Binary
//!
//! Standalone daemon entry point for the Medley plugin runtime. The real
//! media server embeds [`medley_host::module::PluginModule`] directly; this
//! binary runs the runtime on its own for development, plugin testing, and
//! headless deployments.
//!
//! ## Usage
//!
//! ```bash
//! # Default configuration file (medley.toml)
//! medley-host
//!
//! # Custom configuration and plugins directory
//! medley-host --config /etc/medley/medley.toml --plugins-dir /var/lib/medley/plugins
//!
//! # Debug logging
//! medley-host --log-level debug
//! ```
//!
//! ## Environment Variables
//!
//! All `MEDLEY_*` overrides documented in [`medley_host::config`] apply,
//! plus `RUST_LOG` for fine-grained log filtering.

use clap::Parser;
use medley_host::config::RuntimeConfig;
use medley_host::module::PluginModule;
use std::path::PathBuf;

/// Command line arguments for the Medley plugin runtime daemon.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    ///
    /// A missing file is not an error; the daemon then runs on built-in
    /// defaults plus environment overrides.
    #[arg(short, long, default_value = "medley.toml")]
    config: PathBuf,

    /// Override the plugins directory from the configuration.
    #[arg(long)]
    plugins_dir: Option<PathBuf>,

    /// Logging level for the host process.
    ///
    /// Available levels: trace, debug, info, warn, error.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let mut config = if args.config.is_file() {
        RuntimeConfig::load(&args.config)?
    } else {
        tracing::warn!(
            "configuration file {} not found, using defaults",
            args.config.display()
        );
        let mut config = RuntimeConfig::default();
        config.apply_env_overrides()?;
        config
    };
    if let Some(plugins_dir) = args.plugins_dir {
        config.plugins.dir = plugins_dir;
    }
    config.validate()?;

    let module = PluginModule::new(config);
    module.start().await?;
    tracing::info!("medley plugin runtime up; press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    module.shutdown().await;
    Ok(())
}
