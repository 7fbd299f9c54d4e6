//! Pub/Sub subcommand handlers.

use tokio::sync::mpsc;
use tracing::{info, warn};

use cogs_core::{ConnectionState, MessageRecord, Session};

use crate::cli::{GlobalOpts, PublishArgs, SubscribeArgs};
use crate::error::CliError;
use crate::output;

pub async fn session(session: &Session, global: &GlobalOpts) -> Result<(), CliError> {
    let uuid = session.get_session_uuid().await?;
    output::print_output(&output::render_value(global.output, "uuid", &uuid)?);
    Ok(())
}

pub async fn publish(
    session: &Session,
    args: PublishArgs,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    if args.ack {
        let id = session.publish_with_ack(args.channel, args.message).await?;
        output::print_output(&output::render_value(global.output, "id", &id)?);
    } else {
        let seq = session.publish(args.channel, args.message).await?;
        output::print_output(&output::render_value(global.output, "seq", &seq)?);
    }
    Ok(())
}

pub async fn subscriptions(session: &Session, global: &GlobalOpts) -> Result<(), CliError> {
    let channels = session.list_subscriptions().await?;
    output::print_output(&output::render_channels(global.output, &channels)?);
    Ok(())
}

pub async fn unsubscribe_all(session: &Session, global: &GlobalOpts) -> Result<(), CliError> {
    let dropped = session.unsubscribe_all().await?;
    output::print_output(&output::render_channels(global.output, &dropped)?);
    Ok(())
}

/// Subscribe to every requested channel and stream messages until
/// interrupted, the message count is reached, or the connection is lost
/// for good.
pub async fn subscribe(
    session: &Session,
    args: &SubscribeArgs,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let (tx, mut rx) = mpsc::unbounded_channel::<MessageRecord>();

    for channel in &args.channels {
        let tx = tx.clone();
        session
            .subscribe(channel.clone(), move |record: &MessageRecord| {
                let _ = tx.send(record.clone());
            })
            .await?;
    }
    drop(tx);
    info!(channels = ?args.channels, "subscribed, waiting for messages");

    let mut state = session.connection_state();
    let mut received: u64 = 0;
    let outcome = loop {
        tokio::select! {
            biased;
            _ = tokio::signal::ctrl_c() => break Ok(()),
            changed = state.changed() => {
                if changed.is_err() || *state.borrow() == ConnectionState::Disconnected {
                    break Err(CliError::ConnectionFailed {
                        reason: "connection lost and not reconnecting".into(),
                    });
                }
            }
            record = rx.recv() => {
                let Some(record) = record else { break Ok(()) };
                output::print_output(&output::render_record(global.output, &record)?);
                received += 1;
                if args.count.is_some_and(|limit| received >= limit) {
                    break Ok(());
                }
            }
        }
    };

    if outcome.is_ok() {
        for channel in &args.channels {
            if let Err(e) = session.unsubscribe(channel.clone()).await {
                warn!(channel = %channel, error = %e, "unsubscribe failed");
            }
        }
    }
    outcome
}
