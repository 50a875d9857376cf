// crates/core/src/state_machine.rs
//! The authoritative job status.
//!
//! `JobStateMachine::apply` is the single entry point. It never touches the
//! progress estimator, result buffer or store directly: it returns the
//! [`Effect`]s a transition implies and the caller (see `tracker`) carries
//! them out. The only input-independent behaviour is the stale-message guard,
//! which depends on the current state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::protocol::{is_not_found, InboundMessage, StatusValue};
use crate::types::{JobKind, JobState, JobStatus, Row};

/// Control requests acknowledged by the job engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Pause,
    Resume,
    Stop,
}

impl ControlAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ControlAction::Pause => "pause",
            ControlAction::Resume => "resume",
            ControlAction::Stop => "stop",
        }
    }
}

/// Everything that can move a job's status.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// The user launched the job from this client.
    Started { started_at: Option<DateTime<Utc>> },
    Message(InboundMessage),
    ControlAck(ControlAction),
    ConnectionExhausted,
    UnexpectedClose,
}

/// Side effects implied by a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// First entry into Running for this handle.
    StartProgress,
    PauseProgress,
    ResumeProgress,
    RestartProgress,
    RealProgress(u8),
    CompleteProgress,
    HaltProgress,
    AppendRow(Row),
    FetchResults,
    ResetResults,
    ClearCheckpoint,
}

/// Whether an `error` message always ends the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Every error is terminal. "Not found" errors additionally clear the
    /// local results and checkpoint.
    #[default]
    AlwaysTerminal,
    /// "Not found" errors clear local state and return the job to Idle so it
    /// can be observed again; other errors are terminal.
    RecoverNotFound,
}

/// Result of applying one event.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub previous: JobState,
    pub status: JobStatus,
    pub effects: Vec<Effect>,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.previous != self.status.state
    }
}

#[derive(Debug, Clone)]
pub struct JobStateMachine {
    kind: JobKind,
    status: JobStatus,
    entered_running: bool,
    error_policy: ErrorPolicy,
    last_error: Option<String>,
}

impl JobStateMachine {
    pub fn new(kind: JobKind, error_policy: ErrorPolicy) -> Self {
        Self {
            kind,
            status: JobStatus::idle(),
            entered_running: false,
            error_policy,
            last_error: None,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn state(&self) -> JobState {
        self.status.state
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn apply(&mut self, event: JobEvent) -> Transition {
        let previous = self.status.state;
        let mut effects = Vec::new();

        match event {
            JobEvent::Started { started_at } => {
                if previous == JobState::Idle {
                    self.enter_running(started_at.or_else(|| Some(Utc::now())), &mut effects);
                } else {
                    warn!(kind = %self.kind, state = %previous, "start ignored, job already observed");
                }
            }
            JobEvent::Message(message) => self.apply_message(message, &mut effects),
            JobEvent::ControlAck(action) => self.apply_control_ack(action, &mut effects),
            JobEvent::ConnectionExhausted => {
                if previous.is_terminal() {
                    debug!(kind = %self.kind, state = %previous, "connection exhausted after job finished");
                } else {
                    self.fail("connection attempts exhausted", &mut effects);
                }
            }
            JobEvent::UnexpectedClose => {
                if previous.is_active() {
                    self.fail("connection closed before the job finished", &mut effects);
                }
            }
        }

        Transition {
            previous,
            status: self.status,
            effects,
        }
    }

    fn apply_message(&mut self, message: InboundMessage, effects: &mut Vec<Effect>) {
        let state = self.status.state;
        match message {
            InboundMessage::Status(update) => match update.status {
                StatusValue::Running => match state {
                    JobState::Idle => self.enter_running(
                        update.started_at.or_else(|| Some(Utc::now())),
                        effects,
                    ),
                    JobState::Paused => {
                        self.status.state = JobState::Running;
                        effects.push(Effect::ResumeProgress);
                        if let (Some(new), Some(old)) = (update.started_at, self.status.started_at) {
                            if new != old {
                                info!(kind = %self.kind, %old, %new, "job restarted while paused");
                                self.status.started_at = Some(new);
                                effects.push(Effect::RestartProgress);
                            }
                        }
                    }
                    JobState::Running => {
                        if let (Some(new), Some(old)) = (update.started_at, self.status.started_at) {
                            if new != old {
                                info!(kind = %self.kind, %old, %new, "job restarted");
                                self.status.started_at = Some(new);
                                effects.push(Effect::RestartProgress);
                            }
                        } else if self.status.started_at.is_none() {
                            self.status.started_at = update.started_at;
                        }
                    }
                    _ => warn!(kind = %self.kind, state = %state, "ignoring running status after job finished"),
                },
                StatusValue::Paused => match state {
                    JobState::Running => {
                        self.status.state = JobState::Paused;
                        effects.push(Effect::PauseProgress);
                    }
                    JobState::Idle => {
                        // Attached to a job that was already paused.
                        self.enter_running(update.started_at.or_else(|| Some(Utc::now())), effects);
                        self.status.state = JobState::Paused;
                        effects.push(Effect::PauseProgress);
                    }
                    JobState::Paused => {}
                    _ => warn!(kind = %self.kind, state = %state, "ignoring paused status after job finished"),
                },
                StatusValue::Completed => self.complete(effects),
                StatusValue::Idle => match state {
                    JobState::Idle => {}
                    JobState::Completed => {
                        warn!(kind = %self.kind, "ignoring idle status after completion");
                    }
                    _ => warn!(kind = %self.kind, state = %state, "rejecting downgrade to idle"),
                },
                StatusValue::Stopped => {
                    if state.is_terminal() {
                        debug!(kind = %self.kind, state = %state, "ignoring stopped status after job finished");
                    } else {
                        self.status.state = JobState::Stopped;
                        effects.push(Effect::HaltProgress);
                    }
                }
                StatusValue::Failed => {
                    if !state.is_terminal() {
                        self.fail("job reported failure", effects);
                    }
                }
                StatusValue::Other(raw) => {
                    debug!(kind = %self.kind, status = %raw, "ignoring unrecognised status");
                }
            },
            InboundMessage::Progress { percent } => {
                if state.is_terminal() {
                    debug!(kind = %self.kind, percent, "ignoring late progress update");
                } else {
                    effects.push(Effect::RealProgress(percent));
                }
            }
            InboundMessage::NewRow(row) => effects.push(Effect::AppendRow(row)),
            InboundMessage::Complete => self.complete(effects),
            InboundMessage::Error { message } => self.server_error(message, effects),
            InboundMessage::Log { .. } | InboundMessage::Logs { .. } => {}
            InboundMessage::Unknown { kind } => {
                debug!(job_kind = %self.kind, message_type = %kind, "ignoring unknown message type");
            }
        }
    }

    fn apply_control_ack(&mut self, action: ControlAction, effects: &mut Vec<Effect>) {
        let state = self.status.state;
        match (action, state) {
            (ControlAction::Pause, JobState::Running) => {
                self.status.state = JobState::Paused;
                effects.push(Effect::PauseProgress);
            }
            (ControlAction::Resume, JobState::Paused) => {
                self.status.state = JobState::Running;
                effects.push(Effect::ResumeProgress);
            }
            (ControlAction::Stop, s) if s.is_active() => {
                self.status.state = JobState::Stopped;
                effects.push(Effect::HaltProgress);
            }
            // The stream already delivered the same transition.
            (ControlAction::Pause, JobState::Paused)
            | (ControlAction::Resume, JobState::Running)
            | (ControlAction::Stop, JobState::Stopped) => {}
            (action, state) => {
                warn!(kind = %self.kind, action = action.as_str(), state = %state, "control acknowledgement does not apply");
            }
        }
    }

    fn enter_running(&mut self, started_at: Option<DateTime<Utc>>, effects: &mut Vec<Effect>) {
        self.status = JobStatus {
            state: JobState::Running,
            started_at,
        };
        if !self.entered_running {
            self.entered_running = true;
            effects.push(Effect::StartProgress);
        } else {
            effects.push(Effect::ResumeProgress);
        }
    }

    fn complete(&mut self, effects: &mut Vec<Effect>) {
        match self.status.state {
            JobState::Completed => {}
            JobState::Errored | JobState::Stopped => {
                warn!(kind = %self.kind, state = %self.status.state, "ignoring completion after job ended");
            }
            _ => {
                self.status.state = JobState::Completed;
                effects.push(Effect::CompleteProgress);
                effects.push(Effect::FetchResults);
            }
        }
    }

    fn server_error(&mut self, message: String, effects: &mut Vec<Effect>) {
        let state = self.status.state;
        if state.is_terminal() {
            warn!(kind = %self.kind, state = %state, error = %message, "ignoring error after job ended");
            return;
        }

        if !is_not_found(&message) {
            self.fail(&message, effects);
            return;
        }

        effects.push(Effect::ResetResults);
        effects.push(Effect::ClearCheckpoint);
        match self.error_policy {
            ErrorPolicy::AlwaysTerminal => self.fail(&message, effects),
            ErrorPolicy::RecoverNotFound => {
                warn!(kind = %self.kind, error = %message, "job unknown to server, local state reset");
                self.last_error = Some(message);
                self.status = JobStatus::idle();
                self.entered_running = false;
                effects.push(Effect::RestartProgress);
            }
        }
    }

    fn fail(&mut self, reason: &str, effects: &mut Vec<Effect>) {
        warn!(kind = %self.kind, state = %self.status.state, reason, "job errored");
        self.last_error = Some(reason.to_string());
        self.status.state = JobState::Errored;
        effects.push(Effect::HaltProgress);
    }
}
