use anyhow::Result;
use clap::{Args, ValueEnum};

use readdbx::{
    ReadHistoryService,
    config::Config,
    query::{IndexSelector, RangeRequest},
};

use crate::commands::ActorArgs;

#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum ListFilter {
    /// Every tracked conversation
    #[default]
    All,
    /// Conversations with events the actor has not read
    Unread,
    /// Conversations the actor wrote in after the newest event
    Unanswered,
}

#[derive(Args)]
pub struct ListArgs {
    #[command(flatten)]
    pub actor: ActorArgs,
    /// Narrow the listing to one target type
    #[arg(long = "type", value_name = "TYPE")]
    pub target_type: Option<String>,
    #[arg(long, value_enum, default_value_t = ListFilter::All)]
    pub filter: ListFilter,
    /// Maximum number of rows to print
    #[arg(long)]
    pub limit: Option<usize>,
    /// Newest activity first
    #[arg(long, default_value_t = false)]
    pub reverse: bool,
    /// Continue after this row id
    #[arg(long, value_name = "ID")]
    pub after: Option<String>,
}

pub fn execute(config: Config, args: ListArgs) -> Result<()> {
    let service = ReadHistoryService::open(config)?;

    let actor = args.actor.actor()?;
    let selector = match (args.filter, args.target_type) {
        (ListFilter::All, None) => IndexSelector::ActivityByActor { actor },
        (ListFilter::All, Some(target_type)) => {
            IndexSelector::ActivityByActorType { actor, target_type }
        }
        (ListFilter::Unread, target_type) => IndexSelector::UnreadByActor { actor, target_type },
        (ListFilter::Unanswered, target_type) => {
            IndexSelector::UnansweredByActor { actor, target_type }
        }
    };

    let mut request = RangeRequest {
        limit: args.limit,
        reverse: args.reverse,
        ..RangeRequest::default()
    };
    if args.reverse {
        request.lt = args.after;
    } else {
        request.gt = args.after;
    }

    let items = service.range_query(&selector, &request)?;
    if items.is_empty() {
        println!("no read histories found");
        return Ok(());
    }
    for item in items {
        match item.record {
            Some(record) => println!(
                "{}\t{}\t{}",
                item.id,
                record.target(),
                serde_json::to_string(&record)?
            ),
            None => println!("{}\t<missing>", item.id),
        }
    }
    Ok(())
}
