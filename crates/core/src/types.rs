// crates/core/src/types.rs
//! Identity and status types shared by every layer of the job watcher.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One job-specific result record. The shape belongs to the job engine,
/// so rows are carried as opaque JSON.
pub type Row = serde_json::Value;

/// The four job engines a client can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobKind {
    Crawler,
    Fuzzer,
    BruteForce,
    CredGen,
}

impl JobKind {
    /// Path segment the backend mounts this engine under, both for
    /// `/api/{segment}/…` and `/ws/{segment}/…`.
    pub fn route_segment(self) -> &'static str {
        match self {
            JobKind::Crawler => "crawler",
            JobKind::Fuzzer => "fuzzer",
            JobKind::BruteForce => "dbf",
            JobKind::CredGen => "ml",
        }
    }

    /// Name used in persisted keys such as `currentFuzzerJobId`.
    pub fn key_name(self) -> &'static str {
        match self {
            JobKind::Crawler => "Crawler",
            JobKind::Fuzzer => "Fuzzer",
            JobKind::BruteForce => "BruteForce",
            JobKind::CredGen => "CredGen",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Crawler => "crawler",
            JobKind::Fuzzer => "fuzzer",
            JobKind::BruteForce => "bruteForce",
            JobKind::CredGen => "credGen",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "crawler" => Ok(JobKind::Crawler),
            "fuzzer" => Ok(JobKind::Fuzzer),
            "bruteforce" | "brute-force" | "dbf" => Ok(JobKind::BruteForce),
            "credgen" | "cred-gen" | "credgenai" | "ml" => Ok(JobKind::CredGen),
            other => Err(format!("unknown job kind: {other}")),
        }
    }
}

/// Identifies one running unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub job_id: String,
    pub kind: JobKind,
}

impl JobHandle {
    pub fn new(kind: JobKind, job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            kind,
        }
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.job_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Running,
    Paused,
    Completed,
    Errored,
    /// Stopped on request through the control channel.
    Stopped,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Errored | JobState::Stopped)
    }

    /// Running or Paused: the job is live and a close is unexpected.
    pub fn is_active(self) -> bool {
        matches!(self, JobState::Running | JobState::Paused)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Idle => "idle",
            JobState::Running => "running",
            JobState::Paused => "paused",
            JobState::Completed => "completed",
            JobState::Errored => "errored",
            JobState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// The authoritative status of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub state: JobState,
    pub started_at: Option<DateTime<Utc>>,
}

impl JobStatus {
    pub fn idle() -> Self {
        Self {
            state: JobState::Idle,
            started_at: None,
        }
    }
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_segments() {
        assert_eq!(JobKind::Crawler.route_segment(), "crawler");
        assert_eq!(JobKind::Fuzzer.route_segment(), "fuzzer");
        assert_eq!(JobKind::BruteForce.route_segment(), "dbf");
        assert_eq!(JobKind::CredGen.route_segment(), "ml");
    }

    #[test]
    fn test_kind_parse_accepts_route_aliases() {
        assert_eq!("dbf".parse::<JobKind>().unwrap(), JobKind::BruteForce);
        assert_eq!("bruteForce".parse::<JobKind>().unwrap(), JobKind::BruteForce);
        assert_eq!("credGenAI".parse::<JobKind>().unwrap(), JobKind::CredGen);
        assert!("scanner".parse::<JobKind>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Errored.is_terminal());
        assert!(JobState::Stopped.is_terminal());
        assert!(!JobState::Paused.is_terminal());
        assert!(JobState::Paused.is_active());
        assert!(!JobState::Idle.is_active());
    }

    #[test]
    fn test_handle_serialize() {
        let handle = JobHandle::new(JobKind::BruteForce, "abc");
        let json = serde_json::to_string(&handle).unwrap();
        assert!(json.contains("\"jobId\":\"abc\""));
        assert!(json.contains("\"kind\":\"bruteForce\""));
        assert_eq!(handle.to_string(), "bruteForce/abc");
    }
}
