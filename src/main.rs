use batchload::config::resolve_config_path;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "batchload")]
#[command(about = "Exactly-once batch loader for file arrival notifications", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP intake API
    Run,
    /// Handle one notification read from a JSON file
    Handle { event: PathBuf },
    /// Run the flush check for a prefix's current batch
    Flush { prefix: String },
    /// Store load configurations from a YAML list of records
    Setup { records: PathBuf },
    /// Append a destination to an existing prefix
    AddDestination {
        prefix: String,
        destination: PathBuf,
    },
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Init {
        #[arg(long)]
        stdout: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing subscriber
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "batchload=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config.as_deref());

    match cli.command {
        Some(Commands::Run) | None => {
            batchload::cli::run::run(config_path).await?;
        }
        Some(Commands::Handle { event }) => {
            batchload::cli::run::handle(config_path, &event).await?;
        }
        Some(Commands::Flush { prefix }) => {
            batchload::cli::run::flush(config_path, &prefix).await?;
        }
        Some(Commands::Setup { records }) => {
            batchload::cli::run::setup(config_path, &records).await?;
        }
        Some(Commands::AddDestination {
            prefix,
            destination,
        }) => {
            batchload::cli::run::add_destination(config_path, &prefix, &destination).await?;
        }
        Some(Commands::Config { action }) => match action {
            ConfigAction::Init { stdout } => {
                batchload::cli::config::init(stdout)?;
            }
        },
    }

    Ok(())
}
