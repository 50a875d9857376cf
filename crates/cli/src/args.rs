// crates/cli/src/args.rs
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use scanwatch_core::JobKind;

/// Follow and control scan jobs running on a job engine.
#[derive(Parser, Debug)]
#[command(name = "scanwatch", version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (default: <config dir>/scanwatch/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// REST base URL, e.g. http://localhost:8000
    #[arg(long = "api-url", global = true, value_name = "URL")]
    pub api_url: Option<String>,

    /// Streaming base URL (default: derived from the REST URL)
    #[arg(long = "ws-url", global = true, value_name = "URL")]
    pub ws_url: Option<String>,

    /// Directory for checkpoints and current job ids
    #[arg(long = "state-dir", global = true, value_name = "DIR")]
    pub state_dir: Option<PathBuf>,

    /// Keep checkpoints in memory only; nothing is written to disk
    #[arg(long, global = true)]
    pub ephemeral: bool,

    /// Emit logs as JSON lines
    #[arg(long = "log-json", global = true)]
    pub log_json: bool,

    /// Also write logs to a daily-rotated file in this directory
    #[arg(long = "log-dir", global = true, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Follow a job until it finishes. Type p/r/s/c/q + Enter to pause,
    /// resume, stop, checkpoint or quit.
    Watch(WatchArgs),

    /// Ask the engine to pause a job
    Pause(JobArgs),

    /// Ask the engine to resume a paused job
    Resume(JobArgs),

    /// Ask the engine to stop a job
    Stop(JobArgs),

    /// Manage stored result checkpoints
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointCommand,
    },

    /// Show or clear the current job id for a kind
    Current {
        /// crawler, fuzzer, bruteForce (dbf) or credGen (ml)
        kind: JobKind,

        #[arg(long)]
        clear: bool,
    },
}

#[derive(Args, Debug, Clone)]
pub struct JobArgs {
    /// crawler, fuzzer, bruteForce (dbf) or credGen (ml)
    pub kind: JobKind,

    /// Job id (default: the current job for this kind)
    pub job_id: Option<String>,
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    #[command(flatten)]
    pub job: JobArgs,

    /// The job was just launched; start tracking it as running
    #[arg(long)]
    pub started: bool,

    /// Print snapshots as JSON lines
    #[arg(long)]
    pub json: bool,

    /// Save a checkpoint when the watch is interrupted
    #[arg(long = "checkpoint-on-exit")]
    pub checkpoint_on_exit: bool,
}

#[derive(Subcommand, Debug)]
pub enum CheckpointCommand {
    /// Fetch the job's results from the engine and store them
    Save(JobArgs),

    /// Print the stored checkpoint
    Show(JobArgs),

    /// Delete the stored checkpoint
    Clear(JobArgs),
}
