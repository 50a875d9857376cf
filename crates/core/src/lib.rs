// crates/core/src/lib.rs
pub mod config;
pub mod error;
pub mod paths;
pub mod persistence;
pub mod progress;
pub mod protocol;
pub mod state_machine;
pub mod tracker;
pub mod types;

pub use config::WatchConfig;
pub use error::*;
pub use persistence::{FileStore, KeyValueStore, MemoryStore, PersistenceAdapter};
pub use progress::{ProgressEstimator, ProgressSource, ProgressState, RegressionPolicy};
pub use protocol::{InboundMessage, StatusUpdate, StatusValue};
pub use state_machine::{ControlAction, Effect, ErrorPolicy, JobEvent, JobStateMachine, Transition};
pub use tracker::{JobSnapshot, JobTracker};
pub use types::*;
