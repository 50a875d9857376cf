// crates/client/src/connection.rs
//! Connection manager: at most one live streaming session per job.
//!
//! Each session runs in its own task that connects through a [`Transport`],
//! decodes inbound frames and forwards them in order. Transport failures are
//! retried with a fixed delay; `max_retries` consecutive failures end the
//! session with [`SessionSignal::ConnectionExhausted`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use scanwatch_core::protocol;
use scanwatch_core::{InboundMessage, JobHandle, JobStatus, WatchConfig};

use crate::error::TransportError;
use crate::transport::{Connection, Transport};

const SIGNAL_BUFFER: usize = 256;

/// Sent once per successful connect so the server replays its log backlog.
pub const BACKLOG_REQUEST: &str = r#"{"type":"command","command":"get_logs"}"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &WatchConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            delay: config.retry_delay(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&WatchConfig::default())
    }
}

/// What a session reports to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionSignal {
    Connected { attempt: u32 },
    Message(InboundMessage),
    /// Retry bound reached. Final signal of the session.
    ConnectionExhausted,
    /// The stream ended while the job was still running or paused. Final.
    UnexpectedClose,
    /// The stream ended after the job left the active states. Final.
    Closed,
}

enum RawSignal {
    Connected { attempt: u32 },
    Message(InboundMessage),
    Exhausted,
    Ended,
}

struct SessionEntry {
    id: u64,
    token: CancellationToken,
}

type Registry = Arc<Mutex<HashMap<JobHandle, SessionEntry>>>;

/// Written by the session task, read through [`Session`].
#[derive(Debug, Default)]
struct SessionCounters {
    retry_count: AtomicU32,
    closed: AtomicBool,
}

/// A live session. Signals are lazy and cannot be replayed; dropping the
/// session cancels it.
pub struct Session {
    id: u64,
    handle: JobHandle,
    signals: mpsc::Receiver<RawSignal>,
    status: watch::Receiver<JobStatus>,
    token: CancellationToken,
    counters: Arc<SessionCounters>,
    finished: bool,
}

impl Session {
    pub fn handle(&self) -> &JobHandle {
        &self.handle
    }

    /// Consecutive failed attempts since the last successful connect.
    pub fn retry_count(&self) -> u32 {
        self.counters.retry_count.load(Ordering::Acquire)
    }

    /// True once the session was cancelled or its task gave up or ended.
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled() || self.counters.closed.load(Ordering::Acquire)
    }

    /// Next signal, or `None` once a final signal was delivered.
    pub async fn next_signal(&mut self) -> Option<SessionSignal> {
        if self.finished {
            return None;
        }
        match self.signals.recv().await {
            Some(RawSignal::Connected { attempt }) => Some(SessionSignal::Connected { attempt }),
            Some(RawSignal::Message(message)) => Some(SessionSignal::Message(message)),
            Some(RawSignal::Exhausted) => {
                self.finished = true;
                Some(SessionSignal::ConnectionExhausted)
            }
            Some(RawSignal::Ended) => {
                self.finished = true;
                // Every message before the end has been consumed by now, so the
                // status reflects them.
                let state = self.status.borrow().state;
                if state.is_active() {
                    warn!(job_id = %self.handle.job_id, kind = %self.handle.kind, %state, "stream closed while job active");
                    Some(SessionSignal::UnexpectedClose)
                } else {
                    Some(SessionSignal::Closed)
                }
            }
            None => {
                self.finished = true;
                Some(SessionSignal::Closed)
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[derive(Clone)]
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    sessions: Registry,
    next_id: Arc<AtomicU64>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Open a session for `handle`. `status` is the job's current status as
    /// seen by the consumer; it decides how a closed stream is reported.
    ///
    /// Returns `None` (and logs a warning) if a session for `handle` is
    /// still open.
    pub fn open(&self, handle: &JobHandle, status: watch::Receiver<JobStatus>) -> Option<Session> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();

        match self.sessions.lock() {
            Ok(mut sessions) => {
                if sessions.contains_key(handle) {
                    warn!(job_id = %handle.job_id, kind = %handle.kind, "session already open, ignoring");
                    return None;
                }
                sessions.insert(
                    handle.clone(),
                    SessionEntry {
                        id,
                        token: token.clone(),
                    },
                );
            }
            Err(e) => {
                error!("Mutex poisoned opening session: {e}");
                return None;
            }
        }

        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        let transport = Arc::clone(&self.transport);
        let sessions = Arc::clone(&self.sessions);
        let policy = self.policy;
        let task_handle = handle.clone();
        let task_token = token.clone();
        let counters = Arc::new(SessionCounters::default());
        let task_counters = Arc::clone(&counters);
        tokio::spawn(async move {
            run_session(transport.as_ref(), &task_handle, policy, &task_token, &task_counters, &tx).await;
            task_counters.closed.store(true, Ordering::Release);
            remove_entry(&sessions, &task_handle, id);
            debug!(job_id = %task_handle.job_id, "session task finished");
        });

        info!(job_id = %handle.job_id, kind = %handle.kind, "session opened");
        Some(Session {
            id,
            handle: handle.clone(),
            signals: rx,
            status,
            token,
            counters,
            finished: false,
        })
    }

    pub fn close(&self, session: Session) {
        session.token.cancel();
        remove_entry(&self.sessions, &session.handle, session.id);
        info!(job_id = %session.handle.job_id, kind = %session.handle.kind, "session closed");
    }

    /// Cancel every open session.
    pub fn shutdown(&self) {
        match self.sessions.lock() {
            Ok(mut sessions) => {
                for (handle, entry) in sessions.drain() {
                    debug!(job_id = %handle.job_id, "cancelling session");
                    entry.token.cancel();
                }
            }
            Err(e) => error!("Mutex poisoned shutting down sessions: {e}"),
        }
    }

    pub fn is_open(&self, handle: &JobHandle) -> bool {
        match self.sessions.lock() {
            Ok(sessions) => sessions.contains_key(handle),
            Err(e) => {
                error!("Mutex poisoned reading sessions: {e}");
                false
            }
        }
    }

    pub fn session_count(&self) -> usize {
        match self.sessions.lock() {
            Ok(sessions) => sessions.len(),
            Err(e) => {
                error!("Mutex poisoned reading sessions: {e}");
                0
            }
        }
    }
}

fn remove_entry(sessions: &Registry, handle: &JobHandle, id: u64) {
    match sessions.lock() {
        Ok(mut sessions) => {
            if sessions.get(handle).is_some_and(|entry| entry.id == id) {
                sessions.remove(handle);
            }
        }
        Err(e) => error!("Mutex poisoned removing session: {e}"),
    }
}

enum PumpEnd {
    Ended,
    Failed(TransportError),
    Cancelled,
}

async fn run_session(
    transport: &dyn Transport,
    handle: &JobHandle,
    policy: RetryPolicy,
    token: &CancellationToken,
    counters: &SessionCounters,
    tx: &mpsc::Sender<RawSignal>,
) {
    let mut attempt: u32 = 0;
    let mut failures: u32 = 0;

    loop {
        attempt += 1;
        let connected = tokio::select! {
            _ = token.cancelled() => return,
            result = transport.connect(handle) => result,
        };

        match connected {
            Ok(connection) => {
                failures = 0;
                counters.retry_count.store(0, Ordering::Release);
                info!(job_id = %handle.job_id, kind = %handle.kind, attempt, "stream connected");
                if tx.send(RawSignal::Connected { attempt }).await.is_err() {
                    return;
                }
                if connection.outbound.send(BACKLOG_REQUEST.to_string()).is_err() {
                    debug!(job_id = %handle.job_id, "backlog request not sent");
                }
                match pump(handle, connection, token, tx).await {
                    PumpEnd::Cancelled => return,
                    PumpEnd::Ended => {
                        counters.closed.store(true, Ordering::Release);
                        let _ = tx.send(RawSignal::Ended).await;
                        return;
                    }
                    PumpEnd::Failed(e) => {
                        failures += 1;
                        counters.retry_count.store(failures, Ordering::Release);
                        warn!(job_id = %handle.job_id, kind = %handle.kind, attempt, failures, "stream failed: {e}");
                    }
                }
            }
            Err(e) => {
                failures += 1;
                counters.retry_count.store(failures, Ordering::Release);
                warn!(job_id = %handle.job_id, kind = %handle.kind, attempt, failures, "connection attempt failed: {e}");
            }
        }

        if failures >= policy.max_retries {
            error!(
                job_id = %handle.job_id,
                kind = %handle.kind,
                failures,
                "giving up after consecutive connection failures"
            );
            counters.closed.store(true, Ordering::Release);
            let _ = tx.send(RawSignal::Exhausted).await;
            return;
        }

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(policy.delay) => {}
        }
    }
}

async fn pump(
    handle: &JobHandle,
    mut connection: Connection,
    token: &CancellationToken,
    tx: &mpsc::Sender<RawSignal>,
) -> PumpEnd {
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => return PumpEnd::Cancelled,
            next = connection.inbound.next() => next,
        };
        match next {
            None => return PumpEnd::Ended,
            Some(Err(e)) => return PumpEnd::Failed(e),
            Some(Ok(text)) => match protocol::decode(handle.kind, &text) {
                Ok(message) => {
                    debug!(job_id = %handle.job_id, kind = message.type_name(), "inbound message");
                    if tx.send(RawSignal::Message(message)).await.is_err() {
                        return PumpEnd::Cancelled;
                    }
                }
                Err(e) => warn!(job_id = %handle.job_id, "dropping undecodable message: {e}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;
    use pretty_assertions::assert_eq;
    use scanwatch_core::{JobKind, JobState};
    use serde_json::json;

    fn manager(transport: Arc<ScriptedTransport>) -> ConnectionManager {
        ConnectionManager::new(
            transport,
            RetryPolicy {
                max_retries: 5,
                delay: Duration::from_secs(1),
            },
        )
    }

    fn handle() -> JobHandle {
        JobHandle::new(JobKind::Crawler, "job-1")
    }

    fn status(state: JobState) -> (watch::Sender<JobStatus>, watch::Receiver<JobStatus>) {
        watch::channel(JobStatus {
            state,
            started_at: None,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_twice_is_noop() {
        let transport = ScriptedTransport::new();
        let _server = transport.accept_next();
        let manager = manager(transport);
        let (_tx, rx) = status(JobState::Idle);

        let first = manager.open(&handle(), rx.clone());
        assert!(first.is_some());
        let second = manager.open(&handle(), rx);
        assert!(second.is_none());
        assert_eq!(manager.session_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_sends_backlog_request() {
        let transport = ScriptedTransport::new();
        let mut server = transport.accept_next();
        let manager = manager(transport);
        let (_tx, rx) = status(JobState::Idle);

        let mut session = manager.open(&handle(), rx).unwrap();
        assert_eq!(session.next_signal().await, Some(SessionSignal::Connected { attempt: 1 }));
        assert_eq!(server.sent.recv().await.as_deref(), Some(BACKLOG_REQUEST));
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_arrive_in_order_and_garbage_is_dropped() {
        let transport = ScriptedTransport::new();
        let server = transport.accept_next();
        let manager = manager(transport);
        let (_tx, rx) = status(JobState::Running);

        let mut session = manager.open(&handle(), rx).unwrap();
        server.send(json!({"type": "progress", "data": {"progress": 40}}));
        server.send_raw("not json");
        server.send(json!({"type": "progress", "data": {"progress": 85}}));

        assert!(matches!(session.next_signal().await, Some(SessionSignal::Connected { .. })));
        assert_eq!(
            session.next_signal().await,
            Some(SessionSignal::Message(InboundMessage::Progress { percent: 40 }))
        );
        assert_eq!(
            session.next_signal().await,
            Some(SessionSignal::Message(InboundMessage::Progress { percent: 85 }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_five_failures_exhaust_session() {
        let transport = ScriptedTransport::new();
        transport.fail_next(5);
        let manager = manager(Arc::clone(&transport));
        let (_tx, rx) = status(JobState::Running);

        let started = tokio::time::Instant::now();
        let mut session = manager.open(&handle(), rx).unwrap();
        assert_eq!(session.next_signal().await, Some(SessionSignal::ConnectionExhausted));
        assert_eq!(session.next_signal().await, None);

        assert_eq!(transport.attempts(), 5);
        assert_eq!(session.retry_count(), 5);
        assert!(session.is_closed());
        // Four fixed delays between five attempts.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(4) && elapsed < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_count_resets_after_connect() {
        let transport = ScriptedTransport::new();
        transport.fail_next(4);
        let server = transport.accept_next();
        transport.fail_next(3);
        let _last = transport.accept_next();
        let manager = manager(Arc::clone(&transport));
        let (_tx, rx) = status(JobState::Running);

        let mut session = manager.open(&handle(), rx).unwrap();
        assert_eq!(session.next_signal().await, Some(SessionSignal::Connected { attempt: 5 }));
        server.fail();
        assert_eq!(session.next_signal().await, Some(SessionSignal::Connected { attempt: 9 }));
        assert_eq!(transport.attempts(), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_while_running_is_unexpected() {
        let transport = ScriptedTransport::new();
        let server = transport.accept_next();
        let manager = manager(transport);
        let (_tx, rx) = status(JobState::Running);

        let mut session = manager.open(&handle(), rx).unwrap();
        assert!(matches!(session.next_signal().await, Some(SessionSignal::Connected { .. })));
        drop(server);
        assert_eq!(session.next_signal().await, Some(SessionSignal::UnexpectedClose));
        assert_eq!(session.next_signal().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_after_completion_is_clean() {
        let transport = ScriptedTransport::new();
        let server = transport.accept_next();
        let manager = manager(transport);
        let (tx, rx) = status(JobState::Running);

        let mut session = manager.open(&handle(), rx).unwrap();
        server.send(json!({"type": "complete"}));
        drop(server);

        assert!(matches!(session.next_signal().await, Some(SessionSignal::Connected { .. })));
        assert_eq!(
            session.next_signal().await,
            Some(SessionSignal::Message(InboundMessage::Complete))
        );
        // Consumer applies the completion before polling again.
        tx.send_replace(JobStatus {
            state: JobState::Completed,
            started_at: None,
        });
        assert_eq!(session.next_signal().await, Some(SessionSignal::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_allows_reopen() {
        let transport = ScriptedTransport::new();
        let _first = transport.accept_next();
        let _second = transport.accept_next();
        let manager = manager(transport);
        let (_tx, rx) = status(JobState::Idle);

        let session = manager.open(&handle(), rx.clone()).unwrap();
        assert!(manager.is_open(&handle()));
        manager.close(session);
        assert_eq!(manager.session_count(), 0);

        assert!(manager.open(&handle(), rx).is_some());
        assert_eq!(manager.session_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_session_leaves_registry() {
        let transport = ScriptedTransport::new();
        transport.fail_next(5);
        let manager = manager(transport);
        let (_tx, rx) = status(JobState::Idle);

        let mut session = manager.open(&handle(), rx).unwrap();
        assert_eq!(session.next_signal().await, Some(SessionSignal::ConnectionExhausted));
        tokio::task::yield_now().await;
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_count_clears_on_connect() {
        let transport = ScriptedTransport::new();
        transport.fail_next(3);
        let server = transport.accept_next();
        let manager = manager(transport);
        let (_tx, rx) = status(JobState::Running);

        let mut session = manager.open(&handle(), rx).unwrap();
        assert_eq!(session.next_signal().await, Some(SessionSignal::Connected { attempt: 4 }));
        assert_eq!(session.retry_count(), 0);
        assert!(!session.is_closed());

        drop(server);
        assert_eq!(session.next_signal().await, Some(SessionSignal::UnexpectedClose));
        assert!(session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_sessions() {
        let transport = ScriptedTransport::new();
        let _server = transport.accept_next();
        let manager = manager(transport);
        let (_tx, rx) = status(JobState::Running);

        let mut session = manager.open(&handle(), rx).unwrap();
        assert!(matches!(session.next_signal().await, Some(SessionSignal::Connected { .. })));
        manager.shutdown();
        assert!(session.is_closed());
        assert_eq!(manager.session_count(), 0);
        assert_eq!(session.next_signal().await, Some(SessionSignal::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_are_per_handle() {
        let transport = ScriptedTransport::new();
        let _a = transport.accept_next();
        let _b = transport.accept_next();
        let manager = manager(transport);
        let (_tx, rx) = status(JobState::Idle);

        let _crawler = manager.open(&handle(), rx.clone()).unwrap();
        let _fuzzer = manager
            .open(&JobHandle::new(JobKind::Fuzzer, "job-1"), rx)
            .unwrap();
        assert_eq!(manager.session_count(), 2);
    }
}
