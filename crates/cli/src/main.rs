mod command;

use anyhow::Result;
use clap::{Parser, Subcommand};
use command::{CommandAction, CommandContext, CommandHandler, CommandResponse};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "vtk-index",
    version,
    about = "Maintain a property-set search index from a resource change log"
)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// JSON fixture with resources, indexed entries and pending changes
    #[arg(short, long, value_name = "FILE", global = true)]
    fixture: Option<PathBuf>,

    /// Verbose logging (stderr)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply pending change-log entries to the index
    Update {
        /// Maximum number of batches to apply
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
        cycles: u64,
    },

    /// Compare the index against the resource store
    Check {
        /// Fix the reported errors afterwards
        #[arg(long)]
        repair: bool,
    },

    /// Rebuild the index from the resource store
    Reindex,

    /// Show index and maintenance state
    Status,

    /// Run the periodic updater for a while and report its cycles
    Watch {
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
}

impl Commands {
    fn action(&self) -> CommandAction {
        match self {
            Self::Update { cycles } => CommandAction::Update {
                cycles: usize::try_from(*cycles).unwrap_or(usize::MAX),
            },
            Self::Check { repair } => CommandAction::Check { repair: *repair },
            Self::Reindex => CommandAction::Reindex,
            Self::Status => CommandAction::Status,
            Self::Watch { seconds } => CommandAction::Watch {
                duration: Duration::from_secs(*seconds),
            },
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();

    let response = match run(&cli).await {
        Ok(response) => response,
        Err(err) => {
            log::error!("{err:#}");
            CommandResponse::error(format!("{err:#}"))
        }
    };

    match serde_json::to_string_pretty(&response) {
        Ok(json) => println!("{json}"),
        Err(err) => {
            eprintln!("failed to serialize response: {err}");
            return ExitCode::FAILURE;
        }
    }

    if response.is_error() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

async fn run(cli: &Cli) -> Result<CommandResponse> {
    let ctx = CommandContext::build(cli.config.as_deref(), cli.fixture.as_deref())?;
    CommandHandler::new(ctx).execute(cli.command.action()).await
}
