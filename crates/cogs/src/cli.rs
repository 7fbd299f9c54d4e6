//! Clap derive structures for the `cogs` CLI.

use clap::{Args, Parser, Subcommand, ValueEnum};
use uuid::Uuid;

// ── Top-Level CLI ────────────────────────────────────────────────────

/// cogs -- command-line client for Cogswell Pub/Sub
#[derive(Debug, Parser)]
#[command(
    name = "cogs",
    version,
    about = "Publish and subscribe on Cogswell Pub/Sub from the command line",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Configuration profile to use
    #[arg(long, short = 'p', env = "COGS_PROFILE", global = true)]
    pub profile: Option<String>,

    /// Pub/Sub WebSocket URL (overrides profile)
    #[arg(long, env = "COGS_URL", global = true)]
    pub url: Option<String>,

    /// Project key, repeatable or comma-separated (overrides profile)
    #[arg(
        long = "key",
        short = 'k',
        env = "COGS_KEYS",
        value_delimiter = ',',
        global = true,
        hide_env_values = true
    )]
    pub keys: Vec<String>,

    /// Session to resume
    #[arg(long, global = true)]
    pub session: Option<Uuid>,

    /// Do not reconnect after the connection drops
    #[arg(long, global = true)]
    pub no_reconnect: bool,

    /// Connect timeout in milliseconds
    #[arg(long, env = "COGS_TIMEOUT", global = true)]
    pub timeout: Option<u64>,

    /// Output format
    #[arg(long, short = 'o', default_value = "plain", global = true)]
    pub output: OutputFormat,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Plain,
    /// One JSON document per line
    Json,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the session UUID assigned by the server
    Session,

    /// Subscribe to channels and print messages as they arrive
    #[command(alias = "sub")]
    Subscribe(SubscribeArgs),

    /// Publish a message to a channel
    #[command(alias = "pub")]
    Publish(PublishArgs),

    /// List the channels this session is subscribed to
    Subscriptions,

    /// Drop every subscription of this session
    UnsubscribeAll,

    /// Manage CLI configuration and profiles
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Debug, Args)]
pub struct SubscribeArgs {
    /// Channels to subscribe to
    #[arg(required = true)]
    pub channels: Vec<String>,

    /// Exit after this many messages
    #[arg(long, short = 'n')]
    pub count: Option<u64>,
}

#[derive(Debug, Args)]
pub struct PublishArgs {
    /// Destination channel
    pub channel: String,

    /// Message body
    pub message: String,

    /// Wait for the server to acknowledge and print the message id
    #[arg(long, short = 'a')]
    pub ack: bool,
}

// ── Config ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Create or update a profile, prompting for project keys
    Init {
        /// Store the keys in the config file instead of the system keyring
        #[arg(long)]
        plaintext: bool,
    },

    /// Display the configuration with keys redacted
    Show,

    /// Store project keys for a profile in the system keyring
    SetKeys,

    /// Print the config file path
    Path,
}

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
