use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use strider_rust::app_config::get_configuration;
use strider_rust::logging::setup_tracing;
use strider_rust::runtime;

#[derive(Parser)]
#[command(author, version, about = "Controls the body of Strider")]
struct Cli {
    #[command(subcommand)]
    command: Command,
    /// Sets the level of verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Path to the settings file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the body control loop
    Backend {
        /// Leg controller type; "fake" forces simulated legs
        #[arg(long = "type")]
        kind: Option<String>,
    },
    /// Reset leg controller boards over RTS
    Reset {
        #[arg(long = "type")]
        kind: Option<String>,
    },
    /// Flash controller board firmware
    Program {
        #[arg(long = "type")]
        kind: Option<String>,
    },
    /// Start the operator ui
    Ui {
        #[arg(long = "type")]
        kind: Option<String>,
    },
    /// Serve the backend to a remote ui
    Remote {
        #[arg(long = "type")]
        kind: Option<String>,
    },
    /// Start the operator ui against a remote backend
    #[command(name = "remote_ui")]
    RemoteUi {
        #[arg(long = "type")]
        kind: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);
    let mut config = get_configuration(cli.config.clone())?;

    match cli.command {
        Command::Backend { kind } => {
            if kind.as_deref() == Some("fake") {
                config.legs.ports.clear();
            }
            runtime::run_backend(&config)
        }
        Command::Reset { .. } => runtime::reset_legs(&config),
        Command::Program { .. } => {
            anyhow::bail!("flashing boards is handled by the firmware tooling")
        }
        Command::Ui { .. } | Command::RemoteUi { .. } => {
            anyhow::bail!("the operator ui ships with the operator tools, not this binary")
        }
        Command::Remote { .. } => {
            anyhow::bail!("the remote transport ships with the operator tools, not this binary")
        }
    }
}
