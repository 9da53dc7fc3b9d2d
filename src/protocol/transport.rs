//! Transport collaborator interfaces
//!
//! The handshake, chunk codec and AMF command layer sit behind these traits.
//! All methods take `&self`: the receive task calls [`Transport::read_message`]
//! while the owning loop writes, so implementations split the socket
//! internally (read half / write half) and serialize each half on its own.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use super::message::Message;
use super::request::{Identity, PublishKind, Request};
use crate::error::Result;

/// Server-side protocol stack for one accepted connection
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Complete the C0/C1/C2 handshake
    async fn perform_handshake(&self) -> Result<()>;

    /// Wait for the `connect` command and return the parsed request
    async fn connect_app(&self) -> Result<Request>;

    /// Send window ack size, peer bandwidth, chunk size and the connect `_result`
    async fn response_connect_app(&self, req: &Request) -> Result<()>;

    /// Reject the connect command with a description
    async fn response_connect_reject(&self, req: &Request, description: &str);

    /// Run the createStream/publish/play exchange until the client's intent is known
    async fn identify_client(&self, stream_id: u32) -> Result<Identity>;

    /// Answer a play request (StreamBegin, onStatus reset/start, sample access)
    async fn start_play(&self, stream_id: u32) -> Result<()>;

    /// Answer a publish request with the flavor-specific responses
    async fn start_publish(&self, kind: PublishKind, stream_id: u32) -> Result<()>;

    /// Read the next message
    ///
    /// Returns [`Error::ConnectionClosed`](crate::Error::ConnectionClosed)
    /// when the peer closes the socket.
    async fn read_message(&self) -> Result<Message>;

    /// Write a single message and flush
    async fn write_message(&self, stream_id: u32, msg: Message) -> Result<()> {
        self.write_messages(stream_id, std::slice::from_ref(&msg)).await
    }

    /// Write a batch of messages with a single flush
    async fn write_messages(&self, stream_id: u32, msgs: &[Message]) -> Result<()>;

    /// Toggle TCP_NODELAY
    fn set_nodelay(&self, enabled: bool) -> Result<()>;

    /// Size the send buffer for the merged-write interval
    fn set_send_buffer_hint(&self, _mw_sleep: Duration) {}

    /// Close the socket
    async fn shutdown(&self);
}

/// Builds transports for accepted sockets
pub trait TransportFactory: Send + Sync + 'static {
    type Transport: Transport;

    fn create(&self, socket: TcpStream, peer_addr: SocketAddr) -> Result<Self::Transport>;
}

/// Client-role connection toward an upstream origin
#[async_trait]
pub trait UpstreamClient: Send {
    async fn handshake(&mut self) -> Result<()>;

    /// Replay the client's connect; `Ok` only on a positive `_result`
    async fn connect_app(&mut self, req: &Request) -> Result<()>;
}

/// Opens short-lived client connections toward upstream origins
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Connect to `origin` (`host[:port]`)
    async fn connect(&self, origin: &str) -> Result<Box<dyn UpstreamClient>>;
}

#[async_trait]
impl<T: UpstreamConnector + ?Sized> UpstreamConnector for Arc<T> {
    async fn connect(&self, origin: &str) -> Result<Box<dyn UpstreamClient>> {
        (**self).connect(origin).await
    }
}
