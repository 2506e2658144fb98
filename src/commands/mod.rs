use anyhow::Result;
use clap::Args;

use readdbx::model::Actor;

pub mod apply;
pub mod count;
pub mod list;

/// Identifies the actor a command reads for.
#[derive(Args, Debug, Clone)]
pub struct ActorArgs {
    /// Registered user id
    #[arg(long, conflicts_with = "session", required_unless_present = "session")]
    pub user: Option<String>,
    /// Anonymous session id
    #[arg(long)]
    pub session: Option<String>,
}

impl ActorArgs {
    pub fn actor(&self) -> Result<Actor> {
        Ok(Actor::from_parts(self.user.clone(), self.session.clone())?)
    }
}
