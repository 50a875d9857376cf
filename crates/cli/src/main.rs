// crates/cli/src/main.rs
//! `scanwatch`: follow and control scan jobs from the terminal.

mod args;
mod commands;
mod logging;

use anyhow::Result;
use clap::Parser;
use scanwatch_core::ControlAction;

use crate::args::{Cli, Command};
use crate::commands::App;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = logging::init(cli.log_json, cli.log_dir.as_deref())?;

    // reqwest and tungstenite can pull in different rustls providers; pick one.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let app = App::build(&cli)?;
    match &cli.command {
        Command::Watch(args) => app.watch(args).await,
        Command::Pause(args) => app.control(args, ControlAction::Pause).await,
        Command::Resume(args) => app.control(args, ControlAction::Resume).await,
        Command::Stop(args) => app.control(args, ControlAction::Stop).await,
        Command::Checkpoint { action } => app.checkpoint(action).await,
        Command::Current { kind, clear } => app.current(*kind, *clear),
    }
}
