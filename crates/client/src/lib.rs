// crates/client/src/lib.rs
pub mod connection;
pub mod control;
pub mod engine;
pub mod error;
pub mod timer;
pub mod transport;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::{ConnectionManager, RetryPolicy, Session, SessionSignal};
pub use control::ControlChannel;
pub use engine::{HttpJobEngine, JobEngine};
pub use error::*;
pub use transport::{Connection, Transport, WebSocketTransport};
pub use watcher::{JobWatcher, WatchContext, WatchOutcome, WatcherHandle, WatcherTask};
