//! Error types
//!
//! Every fatal error unwinds to the connection teardown sequence, which
//! releases publish rights and fires the close notification regardless of
//! which kind triggered it.

use std::net::IpAddr;

use crate::registry::{RegistryError, StreamKey};

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level connection error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or unexpected message from the peer
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    /// Vhost, referer, security or token traverse denial
    #[error("authorization failed: {0}")]
    Authorization(#[from] AuthError),

    /// Another connection already publishes the stream
    #[error("stream {0} is already being published")]
    PublishConflict(StreamKey),

    /// Publish ingest stalled
    #[error("publish timeout ({0})")]
    Timeout(TimeoutKind),

    /// Transport failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Media source lookup failed
    #[error("source error: {0}")]
    Source(#[from] RegistryError),

    /// Notification failure that the policy treats as fatal
    #[error("hook failed: {0}")]
    Hook(#[from] HookError),

    /// Peer closed the connection
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Connection was disposed by its owner
    #[error("connection disposed")]
    Disposed,
}

impl Error {
    /// Whether this error is a normal way for a session to end
    pub fn is_graceful(&self) -> bool {
        match self {
            Error::ConnectionClosed | Error::Disposed => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Protocol-level errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unsupported client action")]
    UnsupportedAction,

    #[error("invalid stream name: {0:?}")]
    InvalidStreamName(String),

    #[error("invalid tcUrl: {0:?}")]
    InvalidTcUrl(String),

    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),
}

/// Authorization denials
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("vhost {0} not found")]
    VhostNotFound(String),

    #[error("vhost {0} is disabled")]
    VhostDisabled(String),

    #[error("vhost {0} was removed")]
    VhostRemoved(String),

    #[error("referer check failed for page url {0:?}")]
    RefererDenied(String),

    #[error("security denied {action} from {ip}")]
    SecurityDenied { action: &'static str, ip: IpAddr },

    #[error("token traverse failed: {0}")]
    TokenTraverse(String),
}

/// Which publish deadline expired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// No media arrived after publish started
    FirstPacket,
    /// Gap between two media messages was too long
    Steady,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutKind::FirstPacket => write!(f, "first packet"),
            TimeoutKind::Steady => write!(f, "steady"),
        }
    }
}

/// Notification delivery errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HookError {
    /// The hook endpoint answered with a rejection
    #[error("rejected by hook: {0}")]
    Rejected(String),

    /// The hook could not be delivered
    #[error("hook delivery failed: {0}")]
    Delivery(String),
}
