//! Registry error types

use super::frame::StreamKey;

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Stream not found
    #[error("stream not found: {0}")]
    StreamNotFound(StreamKey),

    /// Source was removed while a connection still referenced it
    #[error("stream removed: {0}")]
    StreamRemoved(StreamKey),
}
