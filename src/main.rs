mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use readdbx::{config::load_or_default, logging, observability};

use crate::commands::{apply::ApplyArgs, count::CountArgs, list::ListArgs};

#[derive(Parser)]
#[command(author, version, about = "Read-history engine CLI")]
struct Cli {
    /// Path to the configuration file. Defaults to ~/.readdbx/config.toml
    #[arg(long, env = "READDBX_CONFIG")]
    config: Option<PathBuf>,

    /// Print Prometheus metrics gathered during the command
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply read-history events from a JSON lines file
    Apply(ApplyArgs),
    /// Show unread, unanswered and tracked counts for an actor
    Count(CountArgs),
    /// List an actor's conversations by latest activity
    List(ListArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli {
        config,
        metrics,
        command,
    } = Cli::parse();

    let (config, _) = load_or_default(config)?;
    logging::init(&config.logging)?;
    if metrics {
        observability::init()?;
    }

    match command {
        Commands::Apply(args) => commands::apply::execute(config, args)?,
        Commands::Count(args) => commands::count::execute(config, args)?,
        Commands::List(args) => commands::list::execute(config, args)?,
    }

    if let Some(rendered) = metrics.then(observability::render).flatten() {
        print!("{rendered}");
    }
    Ok(())
}
