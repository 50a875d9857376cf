// crates/client/src/testing.rs
//! In-process transport and job engine for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use scanwatch_core::{ControlAction, JobHandle, JobSnapshot, Row};

use crate::engine::JobEngine;
use crate::error::{EngineError, TransportError};
use crate::transport::{Connection, Transport};
use crate::watcher::WatcherHandle;

enum Step {
    Fail,
    Accept {
        inbound: mpsc::UnboundedReceiver<Result<String, TransportError>>,
        outbound: mpsc::UnboundedSender<String>,
    },
}

/// Transport that plays back a queue of scripted connection attempts. An
/// empty queue refuses the connection.
#[derive(Default)]
pub struct ScriptedTransport {
    steps: Mutex<VecDeque<Step>>,
    attempts: AtomicU32,
}

/// Server side of one scripted connection.
pub struct FakeServer {
    inbound: mpsc::UnboundedSender<Result<String, TransportError>>,
    pub sent: mpsc::UnboundedReceiver<String>,
}

impl FakeServer {
    pub fn send(&self, message: serde_json::Value) {
        let _ = self.inbound.send(Ok(message.to_string()));
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.inbound.send(Ok(text.to_string()));
    }

    /// Break the stream with a transport error.
    pub fn fail(&self) {
        let _ = self.inbound.send(Err(TransportError::Stream {
            message: "connection reset".into(),
        }));
    }
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self, count: usize) {
        let mut steps = self.steps.lock().unwrap();
        for _ in 0..count {
            steps.push_back(Step::Fail);
        }
    }

    pub fn accept_next(&self) -> FakeServer {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.steps.lock().unwrap().push_back(Step::Accept {
            inbound: inbound_rx,
            outbound: outbound_tx,
        });
        FakeServer {
            inbound: inbound_tx,
            sent: outbound_rx,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, handle: &JobHandle) -> Result<Connection, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Accept { inbound, outbound }) => Ok(Connection {
                inbound: UnboundedReceiverStream::new(inbound).boxed(),
                outbound,
            }),
            Some(Step::Fail) | None => Err(TransportError::Connect {
                url: format!("scripted://{handle}"),
                message: "connection refused".into(),
            }),
        }
    }
}

/// Job engine that records control calls and serves canned results.
#[derive(Default)]
pub struct FakeEngine {
    pub calls: Mutex<Vec<ControlAction>>,
    pub results: Mutex<Option<Vec<Row>>>,
    pub reject_control: Mutex<bool>,
}

impl FakeEngine {
    pub fn with_results(rows: Vec<Row>) -> Arc<Self> {
        let engine = Self::default();
        *engine.results.lock().unwrap() = Some(rows);
        Arc::new(engine)
    }

    pub fn calls(&self) -> Vec<ControlAction> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobEngine for FakeEngine {
    async fn control(&self, handle: &JobHandle, action: ControlAction) -> Result<(), EngineError> {
        self.calls.lock().unwrap().push(action);
        if *self.reject_control.lock().unwrap() {
            return Err(EngineError::Rejected {
                url: format!("fake://{handle}/{}", action.as_str()),
                status: 500,
                body: "engine unavailable".into(),
            });
        }
        Ok(())
    }

    async fn results(&self, handle: &JobHandle) -> Result<Vec<Row>, EngineError> {
        self.results
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| EngineError::Rejected {
                url: format!("fake://{handle}/results"),
                status: 503,
                body: String::new(),
            })
    }
}

/// Wait until the watcher publishes a snapshot matching `predicate`.
pub async fn wait_until(
    watcher: &WatcherHandle,
    predicate: impl Fn(&JobSnapshot) -> bool,
) -> JobSnapshot {
    let mut rx = watcher.subscribe();
    let snapshot = tokio::time::timeout(Duration::from_secs(60), rx.wait_for(|s| predicate(s)))
        .await
        .expect("timed out waiting for snapshot")
        .expect("watcher dropped");
    snapshot.clone()
}
