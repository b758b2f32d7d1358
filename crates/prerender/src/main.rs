//! `prerender` command-line interface.
//!
//! Prints the effective configuration and replays scripted speculation
//! scenarios against the in-process registry, writing one JSON line per step.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use prerender_core::config::{Config, LogFormat};
use prerender_core::error::format_error_with_remediation;
use prerender_core::logging::init_logging;

mod scenario;

use scenario::Scenario;

#[derive(Parser, Debug)]
#[command(name = "prerender", version, about = "Speculative-render admission and activation tools")]
struct Cli {
    /// Log level filter (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "PRERENDER_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the validated configuration
    Config {
        /// Config file (defaults to $PRERENDER_CONFIG, then built-in defaults)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Print JSON instead of TOML
        #[arg(long)]
        json: bool,
    },

    /// Replay a scenario file, one JSON report per step
    Simulate {
        /// Scenario TOML file
        scenario: PathBuf,

        /// Config file (defaults to $PRERENDER_CONFIG, then built-in defaults)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

impl Commands {
    fn config_path(&self) -> Option<&Path> {
        match self {
            Self::Config { config, .. } | Self::Simulate { config, .. } => config.as_deref(),
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load_or_default(cli.command.config_path())?;
    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    Ok(config)
}

fn print_config(config: &Config, json: bool) -> Result<()> {
    let text = if json {
        serde_json::to_string_pretty(config).context("failed to encode config as JSON")?
    } else {
        config.to_toml_string()?
    };
    println!("{}", text.trim_end());
    Ok(())
}

async fn simulate(config: &Config, path: &Path) -> Result<()> {
    let scenario = Scenario::load(path)?;
    tracing::info!(
        scenario = %scenario.name,
        steps = scenario.steps.len(),
        "Replaying scenario"
    );
    let stdout = std::io::stdout();
    let summary = scenario::run(config, &scenario, |report| {
        let mut out = stdout.lock();
        serde_json::to_writer(&mut out, report)?;
        writeln!(out)?;
        Ok(())
    })
    .await?;
    let mut out = stdout.lock();
    serde_json::to_writer(&mut out, &summary)?;
    writeln!(out)?;
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    init_logging(&config.logging).map_err(prerender_core::Error::from)?;
    tracing::debug!(version = prerender_core::VERSION, "prerender starting");

    match &cli.command {
        Commands::Config { json, .. } => print_config(&config, *json),
        Commands::Simulate { scenario, .. } => simulate(&config, scenario).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<prerender_core::Error>() {
                Some(core) => eprintln!("{}", format_error_with_remediation(core)),
                None => eprintln!("Error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}
