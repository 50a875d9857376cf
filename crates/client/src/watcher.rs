// crates/client/src/watcher.rs
//! Per-job actor.
//!
//! A `JobWatcher` owns one [`JobTracker`] and one session. Its loop selects
//! over session signals, the progress timer and a command channel, and each
//! handler runs to completion before the next input is polled. Readers get
//! a `watch` snapshot; REST calls run in spawned tasks and report back
//! through the command channel.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use scanwatch_core::{
    ControlAction, JobEvent, JobHandle, JobSnapshot, JobStatus, JobTracker, KeyValueStore,
    PersistenceAdapter, Row, WatchConfig,
};

use crate::connection::{ConnectionManager, Session, SessionSignal};
use crate::engine::JobEngine;
use crate::error::{EngineError, WatchError};
use crate::timer::ProgressTimer;

const COMMAND_BUFFER: usize = 64;

/// Everything a watcher needs besides the job itself. Cheap to clone.
#[derive(Clone)]
pub struct WatchContext {
    pub config: Arc<WatchConfig>,
    pub store: Arc<dyn KeyValueStore>,
    pub manager: ConnectionManager,
    pub engine: Arc<dyn JobEngine>,
}

enum Command {
    Event(JobEvent),
    SaveCheckpoint(oneshot::Sender<bool>),
    Rows(oneshot::Sender<Vec<Row>>),
    FinalResults(Result<Vec<Row>, EngineError>),
    Close,
}

/// Final state of a watcher once its loop exits.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchOutcome {
    pub snapshot: JobSnapshot,
    pub rows: Vec<Row>,
}

/// Cloneable handle for talking to a running watcher.
#[derive(Clone)]
pub struct WatcherHandle {
    handle: JobHandle,
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<JobSnapshot>,
}

impl WatcherHandle {
    pub fn handle(&self) -> &JobHandle {
        &self.handle
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobSnapshot> {
        self.snapshot.clone()
    }

    /// Record that the job was launched from this client.
    pub async fn start(&self, started_at: Option<DateTime<Utc>>) -> Result<(), WatchError> {
        self.send(Command::Event(JobEvent::Started { started_at })).await
    }

    pub(crate) async fn acknowledge(&self, action: ControlAction) -> Result<(), WatchError> {
        self.send(Command::Event(JobEvent::ControlAck(action))).await
    }

    pub async fn save_checkpoint(&self) -> Result<bool, WatchError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::SaveCheckpoint(tx)).await?;
        rx.await.map_err(|_| self.closed())
    }

    pub async fn rows(&self) -> Result<Vec<Row>, WatchError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Rows(tx)).await?;
        rx.await.map_err(|_| self.closed())
    }

    /// Close the session and stop the watcher without waiting for results.
    pub async fn close(&self) -> Result<(), WatchError> {
        self.send(Command::Close).await
    }

    async fn send(&self, command: Command) -> Result<(), WatchError> {
        self.commands.send(command).await.map_err(|_| self.closed())
    }

    fn closed(&self) -> WatchError {
        WatchError::Closed {
            handle: self.handle.to_string(),
        }
    }
}

pub struct WatcherTask {
    handle: JobHandle,
    join: JoinHandle<WatchOutcome>,
}

impl WatcherTask {
    pub async fn join(self) -> Result<WatchOutcome, WatchError> {
        self.join.await.map_err(|_| WatchError::Panicked {
            handle: self.handle.to_string(),
        })
    }
}

pub struct JobWatcher {
    tracker: JobTracker,
    session: Option<Session>,
    manager: ConnectionManager,
    engine: Arc<dyn JobEngine>,
    timer: ProgressTimer,
    commands: mpsc::Receiver<Command>,
    commands_tx: mpsc::Sender<Command>,
    snapshot_tx: watch::Sender<JobSnapshot>,
    status_tx: watch::Sender<JobStatus>,
    fetch_pending: bool,
    closing: bool,
}

impl JobWatcher {
    /// Open a session for `handle` and spawn its watcher loop.
    ///
    /// Fails with [`WatchError::AlreadyWatching`] if the manager already
    /// holds a session for the job.
    pub fn spawn(handle: JobHandle, ctx: &WatchContext) -> Result<(WatcherHandle, WatcherTask), WatchError> {
        let persistence = PersistenceAdapter::new(handle.kind, Arc::clone(&ctx.store));
        let mut tracker = JobTracker::new(handle.clone(), &ctx.config, persistence);

        let (status_tx, status_rx) = watch::channel(tracker.status());
        let session = ctx
            .manager
            .open(&handle, status_rx)
            .ok_or_else(|| WatchError::AlreadyWatching {
                handle: handle.to_string(),
            })?;

        tracker.mark_current();
        tracker.restore_checkpoint();

        let (snapshot_tx, snapshot_rx) = watch::channel(tracker.snapshot());
        let (commands_tx, commands) = mpsc::channel(COMMAND_BUFFER);

        let watcher = JobWatcher {
            tracker,
            session: Some(session),
            manager: ctx.manager.clone(),
            engine: Arc::clone(&ctx.engine),
            timer: ProgressTimer::new(ctx.config.tick_interval()),
            commands,
            commands_tx: commands_tx.clone(),
            snapshot_tx,
            status_tx,
            fetch_pending: false,
            closing: false,
        };

        let join = tokio::spawn(watcher.run());
        info!(job_id = %handle.job_id, kind = %handle.kind, "watching job");

        Ok((
            WatcherHandle {
                handle: handle.clone(),
                commands: commands_tx,
                snapshot: snapshot_rx,
            },
            WatcherTask { handle, join },
        ))
    }

    async fn run(mut self) -> WatchOutcome {
        loop {
            if self.closing || (self.session.is_none() && !self.fetch_pending) {
                break;
            }

            tokio::select! {
                signal = next_signal(&mut self.session) => self.on_signal(signal),
                _ = self.timer.tick() => {
                    self.tracker.tick();
                }
                Some(command) = self.commands.recv() => self.on_command(command),
            }

            self.timer.sync(self.tracker.wants_ticks());
            self.publish();
        }

        self.timer.stop();
        if let Some(session) = self.session.take() {
            self.manager.close(session);
        }
        let handle = self.tracker.handle();
        debug!(job_id = %handle.job_id, kind = %handle.kind, "watcher finished");

        WatchOutcome {
            snapshot: self.tracker.snapshot(),
            rows: self.tracker.rows().to_vec(),
        }
    }

    fn on_signal(&mut self, signal: Option<SessionSignal>) {
        match signal {
            Some(SessionSignal::Connected { attempt }) => {
                if attempt > 1 {
                    info!(job_id = %self.tracker.handle().job_id, attempt, "stream reconnected");
                }
            }
            Some(SessionSignal::Message(message)) => self.apply(JobEvent::Message(message)),
            Some(SessionSignal::ConnectionExhausted) => {
                self.session = None;
                self.apply(JobEvent::ConnectionExhausted);
            }
            Some(SessionSignal::UnexpectedClose) => {
                self.session = None;
                self.apply(JobEvent::UnexpectedClose);
            }
            Some(SessionSignal::Closed) | None => self.session = None,
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Event(event) => self.apply(event),
            Command::SaveCheckpoint(reply) => {
                let _ = reply.send(self.tracker.save_checkpoint());
            }
            Command::Rows(reply) => {
                let _ = reply.send(self.tracker.rows().to_vec());
            }
            Command::FinalResults(result) => {
                self.fetch_pending = false;
                match result {
                    Ok(rows) => self.tracker.apply_final_results(rows),
                    Err(e) => {
                        warn!(job_id = %self.tracker.handle().job_id, "failed to fetch final results: {e}")
                    }
                }
            }
            Command::Close => {
                self.closing = true;
                if let Some(session) = self.session.take() {
                    self.manager.close(session);
                }
            }
        }
    }

    fn apply(&mut self, event: JobEvent) {
        let applied = self.tracker.apply(event);
        let status = applied.transition.status;
        self.status_tx.send_replace(status);

        if applied.fetch_results {
            self.fetch_results();
        }
        if status.state.is_terminal() {
            if let Some(session) = self.session.take() {
                self.manager.close(session);
            }
        }
    }

    fn fetch_results(&mut self) {
        if self.fetch_pending {
            return;
        }
        self.fetch_pending = true;

        let engine = Arc::clone(&self.engine);
        let handle = self.tracker.handle().clone();
        let commands = self.commands_tx.clone();
        tokio::spawn(async move {
            let result = engine.results(&handle).await;
            let _ = commands.send(Command::FinalResults(result)).await;
        });
    }

    fn publish(&self) {
        let snapshot = self.tracker.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

async fn next_signal(session: &mut Option<Session>) -> Option<SessionSignal> {
    match session {
        Some(session) => session.next_signal().await,
        None => std::future::pending().await,
    }
}
