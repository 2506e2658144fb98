use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::PathBuf,
};

use anyhow::{Context, Result};
use clap::Args;
use tracing::warn;

use readdbx::{ReadHistoryService, config::Config, model::ReadHistoryEvent};

#[derive(Args)]
pub struct ApplyArgs {
    /// File with one JSON event per line
    pub file: PathBuf,
    /// Stop at the first rejected event instead of skipping it
    #[arg(long, default_value_t = false)]
    pub strict: bool,
}

pub fn execute(config: Config, args: ApplyArgs) -> Result<()> {
    let service = ReadHistoryService::open(config)?;
    let file = File::open(&args.file)
        .with_context(|| format!("failed to open {}", args.file.display()))?;

    let mut applied = 0usize;
    let mut unchanged = 0usize;
    let mut rejected = 0usize;
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line_no = index + 1;
        let line = line.with_context(|| format!("failed to read line {line_no}"))?;
        if line.trim().is_empty() {
            continue;
        }

        let outcome = serde_json::from_str::<ReadHistoryEvent>(&line)
            .map_err(anyhow::Error::from)
            .and_then(|event| service.apply(event).map_err(anyhow::Error::from));
        match outcome {
            Ok(Some(_)) => applied += 1,
            Ok(None) => unchanged += 1,
            Err(err) if !args.strict => {
                warn!(line = line_no, "skipping event: {err}");
                rejected += 1;
            }
            Err(err) => return Err(err.context(format!("line {line_no}"))),
        }
    }

    let handled = service.pump()?;
    println!(
        "applied {applied} event(s), {unchanged} unchanged, {rejected} rejected; {handled} change(s) propagated"
    );
    Ok(())
}
