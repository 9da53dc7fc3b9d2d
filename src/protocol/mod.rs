//! Protocol-facing types
//!
//! Byte-level framing is delegated to a [`Transport`]; the connection core
//! works on decoded [`Message`]s and the parsed [`Request`].

pub mod message;
pub mod request;
pub mod transport;

pub use message::{Command, Message, UserControlEvent};
pub use request::{ConnType, Identity, PublishKind, Request, Response};
pub use transport::{Transport, TransportFactory, UpstreamClient, UpstreamConnector};
