//! Per-connection state
//!
//! Lifecycle phase, the identified client and the live settings snapshot
//! that hot reload writes into.

pub mod context;
pub mod settings;
pub mod state;

pub use context::ClientInfo;
pub use settings::{ConnectionSettings, Pacing, PublishTimeouts};
pub use state::{ConnectionPhase, ConnectionState};
