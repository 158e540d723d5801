//! Exposes the command line application.
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use feedcache_service::caching::CacheDir;
use feedcache_service::config::Config;
use feedcache_service::metrics;

use crate::logging;
use crate::replay;

/// Feedcache commands.
#[derive(Subcommand)]
enum Command {
    /// Replay a scroll session from a YAML script and print where each post resolves to.
    Replay {
        /// Path to the session script.
        #[arg(value_name = "SCRIPT")]
        script: PathBuf,

        /// How long to wait for downloads after the last step.
        #[arg(long, default_value = "2s", value_parser = humantime::parse_duration)]
        settle: Duration,
    },

    /// Wipe the configured cache directory.
    Clear,
}

/// Command line interface parser.
#[derive(Parser)]
#[command(bin_name = "feedcache", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config
            .sentry_dsn
            .as_deref()
            .map(str::parse)
            .transpose()
            .context("invalid sentry DSN")?,
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: No other threads have been spawned at this point.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone() {
            if let Some(name) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(tag, name);
            }
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags)
            .context("failed to configure statsd")?;
    }

    match cli.command {
        Command::Replay { script, settle } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .thread_name("feedcache-worker")
                .enable_all()
                .build()
                .context("failed to create the runtime")?;
            let script = replay::Script::load(&script)?;
            runtime.block_on(replay::run(&config, script, settle, std::io::stdout()))?;
        }
        Command::Clear => clear(&config)?,
    }

    Ok(())
}

fn clear(config: &Config) -> Result<()> {
    let Some(cache_dir) = config.cache_dir.as_deref() else {
        tracing::info!("no cache directory configured, nothing to clear");
        return Ok(());
    };
    CacheDir::clear(cache_dir)
        .with_context(|| format!("failed to clear {}", cache_dir.display()))?;
    tracing::info!(cache_dir = %cache_dir.display(), "cleared cache directory");
    Ok(())
}
