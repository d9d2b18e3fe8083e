//! OTA update client: manifest discovery, ranged package downloads,
//! payload metadata verification and the update state machine that drives
//! an external update engine.

mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod http;
pub mod manager;
pub mod manifest;
pub mod range;
pub mod service;
pub mod state;
pub mod status;
pub mod verifier;

pub use config::UpdaterConfig;
pub use engine::{EngineEvent, GrpcEngine, UpdateEngine};
pub use error::UpdateError;
pub use manager::{ApplyOutcome, CheckOutcome, Snapshot, StatusEvent, UpdateManager};
pub use manifest::Manifest;
pub use state::StateStore;
pub use status::UpdateStatus;
