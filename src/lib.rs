//! Per-connection control core for an RTMP live streaming server
//!
//! Each accepted client runs through one [`Connection`]:
//!
//! ```text
//! TcpListener (RtmpServer)
//!     |
//!     v
//! Connection (one task per client)
//!     |  Init → Identifying → Publishing | Playing | EdgeForwarding → Closing → Disposed
//!     |
//!     +-- AuthGate        vhost, referer, security, edge token traverse
//!     +-- HookSink        connect / publish / play / stop / close notifications
//!     +-- RecvTask        reads the socket while the loop writes
//!     +-- do_publishing   ingest into a Source, first-packet and steady timeouts
//!     +-- Player          merged-write delivery from a Consumer
//!
//! ConfigStore / ReloadBus  live vhost reload, pushed into ConnectionSettings
//! StreamRegistry           in-memory sources with GOP cache and fan-out
//! ```
//!
//! The byte-level protocol (handshake, chunking, AMF) is reached through the
//! [`Transport`] trait, so the core can be driven by any codec or by a test
//! double.
//!
//! # Example
//!
//! ```no_run
//! use rtmp_conn::{RtmpServer, ServerConfig, TransportFactory};
//!
//! async fn serve<F: TransportFactory>(factory: F) -> rtmp_conn::Result<()> {
//!     let server = RtmpServer::new(ServerConfig::default(), factory);
//!     server
//!         .run_until(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await
//! }
//! ```

pub mod auth;
pub mod error;
pub mod hooks;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod stats;

#[cfg(test)]
pub(crate) mod test_util;

pub use error::{AuthError, Error, HookError, ProtocolError, Result, TimeoutKind};
pub use hooks::{HookContext, HookDispatcher, HookEvent, NoopHooks};
pub use protocol::{ConnType, Message, PublishKind, Request, Transport, TransportFactory};
pub use registry::{Consumer, Source, SourceRegistry, StreamKey, StreamRegistry};
pub use server::{
    Connection, ConnectionHandle, RtmpServer, ServerConfig, ServerContext, VhostConfig,
};
pub use session::{ConnectionPhase, ConnectionSettings};
