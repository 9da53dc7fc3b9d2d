//! Media sources and consumers
//!
//! A connection reaches shared media only through the [`SourceRegistry`],
//! [`Source`] and [`Consumer`] traits. The in-memory [`StreamRegistry`] uses
//! `tokio::sync::broadcast` for fan-out to every player of a stream.
//!
//! # Architecture
//!
//! ```text
//!                          Arc<StreamRegistry>
//!                     ┌─────────────────────────┐
//!                     │ streams: HashMap<Key,   │
//!                     │   MemorySource {        │
//!                     │     gop, headers,       │
//!                     │     tx: broadcast::Tx,  │
//!                     │   }                     │
//!                     │ >                       │
//!                     └───────────┬─────────────┘
//!                                 │
//!         ┌───────────────────────┼───────────────────────┐
//!         │                       │                       │
//!         ▼                       ▼                       ▼
//!    [Publisher]             [Consumer]              [Consumer]
//!    on_frame()              recv()                  recv()
//! ```
//!
//! `bytes::Bytes` is reference counted, so every consumer shares the payload
//! allocation of a frame.

pub mod config;
pub mod entry;
pub mod error;
pub mod frame;
pub mod gop;
pub mod source;
pub mod store;

pub use config::RegistryConfig;
pub use entry::{StreamState, StreamStats};
pub use error::RegistryError;
pub use frame::{Frame, FrameType, StreamKey};
pub use gop::GopCache;
pub use source::{Consumer, Source, SourceRegistry};
pub use store::{MemoryConsumer, MemorySource, StreamRegistry};
