// crates/cli/src/commands.rs
//! Subcommand implementations.

use std::io::BufRead;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use scanwatch_client::{
    ConnectionManager, ControlChannel, HttpJobEngine, JobWatcher, RetryPolicy,
    WatchContext, WatchError, WatchOutcome, WatcherHandle, WebSocketTransport,
};
use scanwatch_core::{
    ControlAction, FileStore, JobHandle, JobKind, JobSnapshot, KeyValueStore, MemoryStore,
    PersistenceAdapter, ProgressSource, WatchConfig,
};

use crate::args::{CheckpointCommand, Cli, JobArgs, WatchArgs};

/// Everything the subcommands share, built once from config and flags.
pub struct App {
    pub ctx: WatchContext,
}

impl App {
    pub fn build(cli: &Cli) -> Result<Self> {
        let mut config = WatchConfig::load(cli.config.as_deref()).context("loading configuration")?;
        if let Some(url) = &cli.api_url {
            config.api_base_url = url.clone();
        }
        if let Some(url) = &cli.ws_url {
            config.ws_base_url = Some(url.clone());
        }
        if let Some(dir) = &cli.state_dir {
            config.state_dir = Some(dir.clone());
        }
        config.validate().context("invalid configuration")?;

        let store: Arc<dyn KeyValueStore> = if cli.ephemeral {
            Arc::new(MemoryStore::new())
        } else {
            let dir = config.resolved_state_dir().context("resolving state directory")?;
            info!(state_dir = %dir.display(), "using file store");
            Arc::new(FileStore::new(dir))
        };

        let engine = HttpJobEngine::new(&config).context("building HTTP client")?;
        let transport = WebSocketTransport::from_config(&config);
        let manager = ConnectionManager::new(Arc::new(transport), RetryPolicy::from_config(&config));

        Ok(Self {
            ctx: WatchContext {
                config: Arc::new(config),
                store,
                manager,
                engine: Arc::new(engine),
            },
        })
    }

    fn persistence(&self, kind: JobKind) -> PersistenceAdapter {
        PersistenceAdapter::new(kind, Arc::clone(&self.ctx.store))
    }

    /// The given job id, or the recorded current job for the kind.
    fn resolve(&self, args: &JobArgs) -> Result<JobHandle> {
        let job_id = match &args.job_id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => match self.persistence(args.kind).current_job_id() {
                Some(id) => id,
                None => bail!("no job id given and no current {} job recorded", args.kind),
            },
        };
        Ok(JobHandle::new(args.kind, job_id))
    }

    pub async fn watch(&self, args: &WatchArgs) -> Result<()> {
        self.watch_with_keys(args, spawn_key_reader()).await
    }

    /// Follow a job until it ends, taking interactive commands from `keys`.
    /// Returns once the watcher finishes, whether or not `keys` is still open.
    async fn watch_with_keys(&self, args: &WatchArgs, mut keys: mpsc::Receiver<String>) -> Result<()> {
        let handle = self.resolve(&args.job)?;
        let (watcher, task) = JobWatcher::spawn(handle.clone(), &self.ctx)
            .with_context(|| format!("watching {handle}"))?;
        if args.started {
            watcher.start(None).await?;
        }

        let control = ControlChannel::new(Arc::clone(&self.ctx.engine));
        let mut snapshots = watcher.subscribe();
        let mut snapshots_open = true;
        let mut keys_open = true;
        let mut interrupted = false;

        let join = task.join();
        tokio::pin!(join);

        print_snapshot(&watcher.snapshot(), args.json);
        let outcome = loop {
            tokio::select! {
                outcome = &mut join => break outcome?,
                changed = snapshots.changed(), if snapshots_open => match changed {
                    Ok(()) => {
                        let snapshot = snapshots.borrow_and_update().clone();
                        print_snapshot(&snapshot, args.json);
                    }
                    Err(_) => snapshots_open = false,
                },
                line = keys.recv(), if keys_open => match line {
                    Some(line) => {
                        if !run_key(&control, &watcher, line.trim()).await {
                            close_watcher(&watcher).await?;
                        }
                    }
                    None => keys_open = false,
                },
                _ = tokio::signal::ctrl_c(), if !interrupted => {
                    interrupted = true;
                    eprintln!("interrupted, closing {handle}");
                    if args.checkpoint_on_exit {
                        match watcher.save_checkpoint().await {
                            Ok(saved) => report_checkpoint(saved),
                            Err(e) => warn!("checkpoint failed: {e}"),
                        }
                    }
                    close_watcher(&watcher).await?;
                }
            }
        };

        print_outcome(&outcome, args.json)?;
        Ok(())
    }

    pub async fn control(&self, args: &JobArgs, action: ControlAction) -> Result<()> {
        let handle = self.resolve(args)?;
        self.ctx
            .engine
            .control(&handle, action)
            .await
            .with_context(|| format!("{} {handle}", action.as_str()))?;
        println!("{} requested for {handle}", action.as_str());
        Ok(())
    }

    pub async fn checkpoint(&self, action: &CheckpointCommand) -> Result<()> {
        match action {
            CheckpointCommand::Save(args) => {
                let handle = self.resolve(args)?;
                let rows = self
                    .ctx
                    .engine
                    .results(&handle)
                    .await
                    .with_context(|| format!("fetching results for {handle}"))?;
                let count = rows.len();
                if !self.persistence(handle.kind).save_checkpoint(&handle.job_id, &rows) {
                    bail!("nothing saved for {handle} ({count} rows)");
                }
                println!("saved {count} rows for {handle}");
            }
            CheckpointCommand::Show(args) => {
                let handle = self.resolve(args)?;
                let stored = self
                    .persistence(handle.kind)
                    .read_checkpoint(&handle.job_id)
                    .with_context(|| format!("reading checkpoint for {handle}"))?;
                match stored {
                    Some(checkpoint) => {
                        let json = serde_json::to_string_pretty(&checkpoint)?;
                        println!("{json}");
                    }
                    None => bail!("no checkpoint stored for {handle}"),
                }
            }
            CheckpointCommand::Clear(args) => {
                let handle = self.resolve(args)?;
                self.persistence(handle.kind).clear_checkpoint(&handle.job_id);
                println!("cleared checkpoint for {handle}");
            }
        }
        Ok(())
    }

    pub fn current(&self, kind: JobKind, clear: bool) -> Result<()> {
        let persistence = self.persistence(kind);
        if clear {
            persistence.clear_current_job_id();
            println!("cleared current {kind} job");
            return Ok(());
        }
        match persistence.current_job_id() {
            Some(id) => println!("{id}"),
            None => bail!("no current {kind} job recorded"),
        }
        Ok(())
    }
}

/// Read stdin lines on a plain thread. A blocking stdin read cannot be
/// cancelled, so it must not run on the runtime's blocking pool or shutdown
/// would wait on it.
fn spawn_key_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(8);
    let spawned = std::thread::Builder::new()
        .name("scanwatch-keys".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        warn!("interactive keys unavailable: {e}");
    }
    rx
}

/// Ask the watcher to stop. A watcher that already finished is not an error.
async fn close_watcher(watcher: &WatcherHandle) -> Result<()> {
    match watcher.close().await {
        Ok(()) => Ok(()),
        Err(WatchError::Closed { .. }) => {
            debug!(handle = %watcher.handle(), "watcher already finished");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Handle one line of interactive input. Returns false when the user quits.
async fn run_key(control: &ControlChannel, watcher: &WatcherHandle, key: &str) -> bool {
    let result = match key {
        "p" | "pause" => control.pause(watcher).await,
        "r" | "resume" => control.resume(watcher).await,
        "s" | "stop" => control.stop(watcher).await,
        "c" | "checkpoint" => {
            match watcher.save_checkpoint().await {
                Ok(saved) => report_checkpoint(saved),
                Err(e) => warn!("checkpoint failed: {e}"),
            }
            return true;
        }
        "q" | "quit" => return false,
        "" => return true,
        other => {
            eprintln!("unknown command '{other}' (p)ause (r)esume (s)top (c)heckpoint (q)uit");
            return true;
        }
    };
    if let Err(e) = result {
        eprintln!("{e}");
    }
    true
}

fn report_checkpoint(saved: bool) {
    if saved {
        eprintln!("checkpoint saved");
    } else {
        eprintln!("no results to checkpoint");
    }
}

pub fn format_snapshot(snapshot: &JobSnapshot) -> String {
    let source = match snapshot.progress.source {
        ProgressSource::Real => "reported",
        ProgressSource::Simulated => "estimated",
    };
    let mut line = format!(
        "[{}] {:<9} {:>3}% ({source})  rows={}",
        snapshot.handle,
        snapshot.status.state.to_string(),
        snapshot.progress.percent,
        snapshot.row_count
    );
    if let Some(error) = &snapshot.last_error {
        line.push_str(&format!("  error={error}"));
    }
    line
}

fn print_snapshot(snapshot: &JobSnapshot, json: bool) {
    if json {
        match serde_json::to_string(snapshot) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!("failed to serialize snapshot: {e}"),
        }
    } else {
        println!("{}", format_snapshot(snapshot));
    }
}

fn print_outcome(outcome: &WatchOutcome, json: bool) -> Result<()> {
    if json {
        let value = serde_json::json!({
            "snapshot": outcome.snapshot,
            "rows": outcome.rows,
        });
        println!("{}", serde_json::to_string(&value)?);
    } else {
        println!("{}", format_snapshot(&outcome.snapshot));
        for row in &outcome.rows {
            println!("{row}");
        }
    }
    Ok(())
}
