use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;
use tracing::level_filters::LevelFilter;

use uptime_service::config::Config;
use uptime_service::database::models::SiteId;
use uptime_service::orchestrator::Orchestrator;

#[derive(Debug, Parser)]
#[command(version, about = "Scheduled uptime checks for registered sites")]
struct Cli {
    /// TOML config file; defaults to $XDG_CONFIG_HOME/uptime/config.toml if present
    #[arg(short, long, global = true, env = "UPTIME_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the scheduler until interrupted
    Run,
    /// Probe a URL once and start monitoring it
    Register {
        #[arg(long)]
        url: String,
        #[arg(long)]
        email: String,
    },
    /// Stop monitoring a site and drop its history
    Remove { id: String },
    /// List registered sites
    List,
    /// Recent successful probes of a site, newest first
    History {
        id: String,
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Projected check volume
    Stats,
    /// Print the effective configuration
    Config,
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // One-shot commands print JSON; keep the log quiet around it
    match cli.command {
        Command::Run => logger::init(),
        _ => logger::init_with_level(LevelFilter::WARN),
    }

    let config = Config::load(cli.config.as_deref()).context("invalid configuration")?;

    if let Command::Config = cli.command {
        println!("{config}");
        return Ok(());
    }

    let mut orchestrator = Orchestrator::open(config).await?;

    match cli.command {
        Command::Run => {
            info!("Effective configuration:\n{}", orchestrator.config());
            orchestrator.start().await?;

            tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
            info!("Shutting down...");
            orchestrator.shutdown().await;
        }
        Command::Register { url, email } => {
            let site = orchestrator.sites().register(&url, &email).await?;
            print_json(&site)?;
        }
        Command::Remove { id } => {
            let id = SiteId::from(id);
            let removed = orchestrator.sites().remove(&id).await?;
            print_json(&serde_json::json!({ "id": id, "removed": removed }))?;
        }
        Command::List => print_json(&orchestrator.sites().list().await?)?,
        Command::History { id, limit } => {
            print_json(&orchestrator.sites().history(&SiteId::from(id), limit).await?)?
        }
        Command::Stats => print_json(&orchestrator.sites().stats().await?)?,
        Command::Config => {}
    }

    Ok(())
}
