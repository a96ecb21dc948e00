mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    build::BuildSubcommand, channel::ChannelSubcommand, config::ConfigSubcommand,
    history::HistorySubcommand, installation::InstallationSubcommand, queue::QueueSubcommand,
    subscription::SubscriptionSubcommand, trigger::TriggerSubcommand,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "depflow",
    about = "Dependency-flow engine: trigger subscription updates and drive their pull requests to merge",
    version,
    propagate_version = true
)]
struct Cli {
    /// Engine root (default: nearest ancestor containing .depflow/, else cwd)
    #[arg(long, global = true, env = "DEPFLOW_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create depflow.yaml and the .depflow/ data directory
    Init,

    /// Manage channels
    Channel {
        #[command(subcommand)]
        subcommand: ChannelSubcommand,
    },

    /// Register builds and publish them to channels
    Build {
        #[command(subcommand)]
        subcommand: BuildSubcommand,
    },

    /// Manage subscriptions
    Subscription {
        #[command(subcommand)]
        subcommand: SubscriptionSubcommand,
    },

    /// Manage repository installations
    Installation {
        #[command(subcommand)]
        subcommand: InstallationSubcommand,
    },

    /// Fire triggers and enqueue due updates
    Trigger {
        #[command(subcommand)]
        subcommand: TriggerSubcommand,
    },

    /// Query and retry repository history
    History {
        #[command(subcommand)]
        subcommand: HistorySubcommand,
    },

    /// Inspect the work queue
    Queue {
        #[command(subcommand)]
        subcommand: QueueSubcommand,
    },

    /// Show or validate the engine configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Fail actors left mid-run by a crashed worker
    Recover,

    /// Run dispatcher workers, periodic sweeps and the HTTP API
    Serve {
        /// Port to listen on (default: server.port from depflow.yaml)
        #[arg(long)]
        port: Option<u16>,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root),
        Commands::Channel { subcommand } => cmd::channel::run(&root, subcommand, cli.json),
        Commands::Build { subcommand } => cmd::build::run(&root, subcommand, cli.json),
        Commands::Subscription { subcommand } => {
            cmd::subscription::run(&root, subcommand, cli.json)
        }
        Commands::Installation { subcommand } => {
            cmd::installation::run(&root, subcommand, cli.json)
        }
        Commands::Trigger { subcommand } => cmd::trigger::run(&root, subcommand, cli.json),
        Commands::History { subcommand } => cmd::history::run(&root, subcommand, cli.json),
        Commands::Queue { subcommand } => cmd::queue::run(&root, subcommand, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
        Commands::Recover => cmd::recover::run(&root, cli.json),
        Commands::Serve { port } => cmd::serve::run(&root, port),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
