mod cli;
mod commands;
mod config;
mod error;
mod output;

use clap::Parser;
use secrecy::ExposeSecret;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use cogs_core::{PubSubError, Session};

use crate::cli::{Cli, Command};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_tracing(cli.global.verbose);

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

fn init_tracing(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        // Config commands don't need a connection
        Command::Config(args) => commands::config_cmd::handle(args, &cli.global),

        Command::Completions(args) => {
            use clap::CommandFactory;
            use clap_complete::generate;

            let mut cmd = Cli::command();
            generate(args.shell, &mut cmd, "cogs", &mut std::io::stdout());
            Ok(())
        }

        cmd => {
            let session = open_session(&cli.global).await?;
            debug!(command = ?cmd, "dispatching command");
            commands::dispatch(cmd, &session, &cli.global).await
        }
    }
}

/// Resolve configuration, install the connection-wide handlers and connect.
async fn open_session(global: &cli::GlobalOpts) -> Result<Session, CliError> {
    let resolved = config::resolve(global)?;
    let url = resolved.options.url.clone();
    let session = Session::open(
        resolved.keys.iter().map(ExposeSecret::expose_secret),
        resolved.options,
    )?;

    session.on_error(|err: &PubSubError, seq: Option<u64>, channel: Option<&str>| {
        warn!(error = %err, seq, channel, "pub/sub error");
    });
    session.on_close(|err: Option<&PubSubError>| {
        if let Some(err) = err {
            warn!(error = %err, "connection dropped");
        }
    });
    session.on_reconnect(|| info!("reconnected"));
    session.on_new_session(|uuid| {
        warn!(session = %uuid, "server started a new session; subscriptions were lost");
    });

    info!(profile = %resolved.profile, url = %url, "connecting");
    session.connect().await?;
    Ok(session)
}
