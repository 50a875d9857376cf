// crates/client/src/error.rs
use scanwatch_core::JobState;
use thiserror::Error;

/// Failures of the streaming transport. Always retried by the connection
/// manager; never surfaced past a session.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to connect to {url}: {message}")]
    Connect { url: String, message: String },

    #[error("Stream error: {message}")]
    Stream { message: String },
}

/// Failures talking to the job engine's REST API.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}: {body}")]
    Rejected { url: String, status: u16, body: String },

    #[error("Malformed response from {url}: {message}")]
    Malformed { url: String, message: String },
}

impl EngineError {
    pub fn transport(url: &str, source: reqwest::Error) -> Self {
        Self::Transport {
            url: url.to_string(),
            source,
        }
    }

    pub fn rejected(url: &str, status: reqwest::StatusCode, body: String) -> Self {
        Self::Rejected {
            url: url.to_string(),
            status: status.as_u16(),
            body,
        }
    }
}

/// Errors returned to callers of the control channel. A failed request
/// leaves the job status untouched.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Cannot {action} job {handle} while it is {state}")]
    InvalidState {
        action: &'static str,
        handle: String,
        state: JobState,
    },

    #[error("{action} request for job {handle} failed: {source}")]
    Request {
        action: &'static str,
        handle: String,
        #[source]
        source: EngineError,
    },

    #[error(transparent)]
    Watch(#[from] WatchError),
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Job {handle} is already being watched")]
    AlreadyWatching { handle: String },

    #[error("Watcher for job {handle} has shut down")]
    Closed { handle: String },

    #[error("Watcher task for job {handle} panicked")]
    Panicked { handle: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_error_display() {
        let err = ControlError::InvalidState {
            action: "pause",
            handle: "crawler/abc".into(),
            state: JobState::Idle,
        };
        assert_eq!(err.to_string(), "Cannot pause job crawler/abc while it is idle");
    }

    #[test]
    fn test_rejected_keeps_status_code() {
        let err = EngineError::rejected(
            "http://localhost/api/crawler/1/pause",
            reqwest::StatusCode::CONFLICT,
            "already paused".into(),
        );
        assert!(matches!(err, EngineError::Rejected { status: 409, .. }));
        assert!(err.to_string().contains("409"));
    }
}
