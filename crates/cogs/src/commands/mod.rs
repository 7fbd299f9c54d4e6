//! Command dispatch: bridges CLI args to `Session` operations and output.

pub mod config_cmd;
pub mod pubsub;

use cogs_core::Session;

use crate::cli::{Command, GlobalOpts};
use crate::error::CliError;

/// Dispatch a session-bound command to its handler.
pub async fn dispatch(
    cmd: Command,
    session: &Session,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    match cmd {
        Command::Session => pubsub::session(session, global).await,
        Command::Subscribe(args) => pubsub::subscribe(session, &args, global).await,
        Command::Publish(args) => pubsub::publish(session, args, global).await,
        Command::Subscriptions => pubsub::subscriptions(session, global).await,
        Command::UnsubscribeAll => pubsub::unsubscribe_all(session, global).await,
        // Handled before a session is opened.
        Command::Config(_) | Command::Completions(_) => Ok(()),
    }
}
