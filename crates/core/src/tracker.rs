// crates/core/src/tracker.rs
//! Per-job aggregate: status, progress, results and persistence for one
//! [`JobHandle`], mutated only through the methods below so every handler
//! runs to completion against a fully-applied previous state.

use rand::Rng;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::WatchConfig;
use crate::persistence::PersistenceAdapter;
use crate::progress::{ProgressEstimator, ProgressState};
use crate::protocol::InboundMessage;
use crate::state_machine::{Effect, JobEvent, JobStateMachine, Transition};
use crate::types::{JobHandle, JobStatus, Row};

/// Ordered, append-only result rows for one job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultBuffer {
    rows: Vec<Row>,
}

impl ResultBuffer {
    pub fn push(&mut self, row: Row) {
        self.rows.push(row);
    }

    pub fn reset(&mut self) {
        self.rows.clear();
    }

    /// Swap in a complete row set (checkpoint restore or final results).
    pub fn replace(&mut self, rows: Vec<Row>) {
        self.rows = rows;
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Read-only view published to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub handle: JobHandle,
    pub status: JobStatus,
    pub progress: ProgressState,
    pub row_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// What the async driver still has to do after an event was applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub transition: Transition,
    /// Fetch the authoritative final results from the job engine.
    pub fetch_results: bool,
}

pub struct JobTracker {
    handle: JobHandle,
    machine: JobStateMachine,
    progress: ProgressEstimator,
    results: ResultBuffer,
    persistence: PersistenceAdapter,
    live_rows_seen: bool,
}

impl JobTracker {
    pub fn new(handle: JobHandle, config: &WatchConfig, persistence: PersistenceAdapter) -> Self {
        let machine = JobStateMachine::new(handle.kind, config.error_policy_for(handle.kind));
        let progress = ProgressEstimator::new(config.regression, config.increments.clone());
        Self {
            handle,
            machine,
            progress,
            results: ResultBuffer::default(),
            persistence,
            live_rows_seen: false,
        }
    }

    pub fn handle(&self) -> &JobHandle {
        &self.handle
    }

    pub fn status(&self) -> JobStatus {
        self.machine.status()
    }

    pub fn progress(&self) -> ProgressState {
        self.progress.state()
    }

    pub fn rows(&self) -> &[Row] {
        self.results.rows()
    }

    /// Whether the periodic tick should be running.
    pub fn wants_ticks(&self) -> bool {
        self.machine.state().is_active() && self.progress.wants_ticks()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            handle: self.handle.clone(),
            status: self.machine.status(),
            progress: self.progress.state(),
            row_count: self.results.len(),
            last_error: self.machine.last_error().map(str::to_string),
        }
    }

    /// Record this job as the current one for its kind.
    pub fn mark_current(&self) {
        self.persistence.set_current_job_id(&self.handle.job_id);
    }

    /// Pre-populate results from a stored checkpoint. Only done before any
    /// live row arrived; returns the number of rows restored.
    pub fn restore_checkpoint(&mut self) -> usize {
        if self.live_rows_seen {
            debug!(job_id = %self.handle.job_id, "live rows present, checkpoint not restored");
            return 0;
        }
        match self.persistence.load_checkpoint(&self.handle.job_id) {
            Some(rows) => {
                let count = rows.len();
                self.results.replace(rows);
                info!(
                    job_id = %self.handle.job_id,
                    kind = %self.handle.kind,
                    rows = count,
                    "checkpoint restored"
                );
                count
            }
            None => 0,
        }
    }

    pub fn save_checkpoint(&self) -> bool {
        self.persistence.save_checkpoint(&self.handle.job_id, self.results.rows())
    }

    pub fn apply(&mut self, event: JobEvent) -> Applied {
        match &event {
            JobEvent::Message(InboundMessage::Log { message }) => self.log_line(message),
            JobEvent::Message(InboundMessage::Logs { lines }) => {
                for line in lines {
                    self.log_line(line);
                }
            }
            _ => {}
        }
        let transition = self.machine.apply(event);
        let mut fetch_results = false;

        for effect in &transition.effects {
            match effect {
                Effect::StartProgress => self.progress.set_paused(false),
                Effect::PauseProgress => self.progress.set_paused(true),
                Effect::ResumeProgress => self.progress.set_paused(false),
                Effect::RestartProgress => self.progress.restart(),
                Effect::RealProgress(percent) => {
                    self.progress.on_real_progress(*percent);
                }
                Effect::CompleteProgress => self.progress.complete(),
                Effect::HaltProgress => self.progress.halt(),
                Effect::AppendRow(row) => {
                    self.live_rows_seen = true;
                    self.results.push(row.clone());
                }
                Effect::FetchResults => fetch_results = true,
                Effect::ResetResults => {
                    self.results.reset();
                    self.live_rows_seen = false;
                }
                Effect::ClearCheckpoint => {
                    self.persistence.clear_checkpoint(&self.handle.job_id);
                    let current = self.persistence.current_job_id();
                    if current.as_deref() == Some(self.handle.job_id.as_str()) {
                        self.persistence.clear_current_job_id();
                    }
                }
            }
        }

        if transition.changed() {
            info!(
                job_id = %self.handle.job_id,
                kind = %self.handle.kind,
                from = %transition.previous,
                to = %transition.status.state,
                "job state changed"
            );
        }

        Applied {
            transition,
            fetch_results,
        }
    }

    pub fn apply_message(&mut self, message: InboundMessage) -> Applied {
        self.apply(JobEvent::Message(message))
    }

    pub fn tick_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> bool {
        if !self.machine.state().is_active() {
            return false;
        }
        self.progress.on_tick_with(rng)
    }

    pub fn tick(&mut self) -> bool {
        self.tick_with(&mut rand::thread_rng())
    }

    fn log_line(&self, line: &str) {
        info!(job_id = %self.handle.job_id, kind = %self.handle.kind, "{line}");
    }

    /// Replace the buffer with the engine's final result set.
    pub fn apply_final_results(&mut self, rows: Vec<Row>) {
        info!(job_id = %self.handle.job_id, rows = rows.len(), "final results received");
        self.results.replace(rows);
    }
}
