use anyhow::Result;
use clap::Args;

use readdbx::{ReadHistoryService, config::Config, counter::AggregationKey};

use crate::commands::ActorArgs;

#[derive(Args)]
pub struct CountArgs {
    #[command(flatten)]
    pub actor: ActorArgs,
    /// Narrow the counts to one target type
    #[arg(long = "type", value_name = "TYPE")]
    pub target_type: Option<String>,
    /// Print the counts as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

pub fn execute(config: Config, args: CountArgs) -> Result<()> {
    let service = ReadHistoryService::open(config)?;

    let actor = args.actor.actor()?;
    let key = match args.target_type {
        Some(target_type) => AggregationKey::per_type(actor, target_type),
        None => AggregationKey::global(actor),
    };
    let counts = service.get_count(&key)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&counts)?);
        return Ok(());
    }

    let suffix = if counts.truncated { "+" } else { "" };
    println!("unread:     {}{suffix}", counts.unread);
    println!("unanswered: {}{suffix}", counts.unanswered);
    println!("tracked:    {}{suffix}", counts.tracked);
    Ok(())
}
