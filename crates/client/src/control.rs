// crates/client/src/control.rs
//! Pause, resume and stop requests.
//!
//! A request is only sent when the job is in a state it applies to. On
//! success the watcher applies the acknowledgement optimistically; the next
//! status message for the same state is then a no-op. On failure the job
//! status is left alone and the error goes back to the caller.

use std::sync::Arc;

use tracing::{info, warn};

use scanwatch_core::{ControlAction, JobState};

use crate::engine::JobEngine;
use crate::error::ControlError;
use crate::watcher::WatcherHandle;

#[derive(Clone)]
pub struct ControlChannel {
    engine: Arc<dyn JobEngine>,
}

impl ControlChannel {
    pub fn new(engine: Arc<dyn JobEngine>) -> Self {
        Self { engine }
    }

    pub async fn pause(&self, watcher: &WatcherHandle) -> Result<(), ControlError> {
        self.request(watcher, ControlAction::Pause).await
    }

    pub async fn resume(&self, watcher: &WatcherHandle) -> Result<(), ControlError> {
        self.request(watcher, ControlAction::Resume).await
    }

    pub async fn stop(&self, watcher: &WatcherHandle) -> Result<(), ControlError> {
        self.request(watcher, ControlAction::Stop).await
    }

    async fn request(&self, watcher: &WatcherHandle, action: ControlAction) -> Result<(), ControlError> {
        let handle = watcher.handle();
        let state = watcher.snapshot().status.state;
        if !applies_to(action, state) {
            return Err(ControlError::InvalidState {
                action: action.as_str(),
                handle: handle.to_string(),
                state,
            });
        }

        if let Err(source) = self.engine.control(handle, action).await {
            warn!(job_id = %handle.job_id, kind = %handle.kind, action = action.as_str(), "control request failed: {source}");
            return Err(ControlError::Request {
                action: action.as_str(),
                handle: handle.to_string(),
                source,
            });
        }

        info!(job_id = %handle.job_id, kind = %handle.kind, action = action.as_str(), "control request accepted");
        watcher.acknowledge(action).await?;
        Ok(())
    }
}

fn applies_to(action: ControlAction, state: JobState) -> bool {
    match action {
        ControlAction::Pause => state == JobState::Running,
        ControlAction::Resume => state == JobState::Paused,
        ControlAction::Stop => state.is_active(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionManager, RetryPolicy};
    use crate::testing::{wait_until, FakeEngine, FakeServer, ScriptedTransport};
    use crate::watcher::{JobWatcher, WatchContext, WatcherTask};
    use pretty_assertions::assert_eq;
    use scanwatch_core::{JobHandle, JobKind, MemoryStore, WatchConfig};
    use serde_json::json;
    use std::time::Duration;

    struct Running {
        engine: Arc<FakeEngine>,
        channel: ControlChannel,
        watcher: WatcherHandle,
        task: WatcherTask,
        server: FakeServer,
    }

    async fn running_job() -> Running {
        let config = Arc::new(WatchConfig::default());
        let transport = ScriptedTransport::new();
        let server = transport.accept_next();
        let engine = FakeEngine::with_results(Vec::new());
        let ctx = WatchContext {
            config: Arc::clone(&config),
            store: Arc::new(MemoryStore::new()),
            manager: ConnectionManager::new(transport, RetryPolicy::from_config(&config)),
            engine: engine.clone(),
        };
        let (watcher, task) = JobWatcher::spawn(JobHandle::new(JobKind::Fuzzer, "f-1"), &ctx).unwrap();

        server.send(json!({"type": "status", "data": {"status": "running"}}));
        wait_until(&watcher, |s| s.status.state == JobState::Running).await;

        Running {
            channel: ControlChannel::new(engine.clone()),
            engine,
            watcher,
            task,
            server,
        }
    }

    #[test]
    fn test_applies_to() {
        assert!(applies_to(ControlAction::Pause, JobState::Running));
        assert!(!applies_to(ControlAction::Pause, JobState::Paused));
        assert!(applies_to(ControlAction::Resume, JobState::Paused));
        assert!(applies_to(ControlAction::Stop, JobState::Paused));
        assert!(!applies_to(ControlAction::Stop, JobState::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_then_matching_status_is_idempotent() {
        let job = running_job().await;

        job.channel.pause(&job.watcher).await.unwrap();
        let paused = wait_until(&job.watcher, |s| s.status.state == JobState::Paused).await;

        job.server.send(json!({"type": "status", "data": {"status": "paused"}}));
        job.server.send(json!({"type": "log", "data": {"message": "marker"}}));
        tokio::time::sleep(Duration::from_secs(5)).await;

        let after = job.watcher.snapshot();
        assert_eq!(after.status.state, JobState::Paused);
        // No ticks while paused.
        assert_eq!(after.progress, paused.progress);
        assert_eq!(job.engine.calls(), vec![ControlAction::Pause]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_after_pause() {
        let job = running_job().await;

        job.channel.pause(&job.watcher).await.unwrap();
        wait_until(&job.watcher, |s| s.status.state == JobState::Paused).await;
        job.channel.resume(&job.watcher).await.unwrap();
        wait_until(&job.watcher, |s| s.status.state == JobState::Running).await;

        assert_eq!(job.engine.calls(), vec![ControlAction::Pause, ControlAction::Resume]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_while_running_is_rejected_locally() {
        let job = running_job().await;

        let err = job.channel.resume(&job.watcher).await.unwrap_err();
        assert!(matches!(
            err,
            ControlError::InvalidState {
                action: "resume",
                state: JobState::Running,
                ..
            }
        ));
        assert!(job.engine.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_request_leaves_state() {
        let job = running_job().await;
        *job.engine.reject_control.lock().unwrap() = true;

        let err = job.channel.pause(&job.watcher).await.unwrap_err();
        assert!(matches!(err, ControlError::Request { action: "pause", .. }));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(job.watcher.snapshot().status.state, JobState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_watch() {
        let job = running_job().await;

        job.channel.stop(&job.watcher).await.unwrap();
        let outcome = job.task.join().await.unwrap();
        assert_eq!(outcome.snapshot.status.state, JobState::Stopped);
        assert_eq!(job.engine.calls(), vec![ControlAction::Stop]);
    }
}
