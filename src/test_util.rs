//! Test doubles shared by the unit tests

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, HookError, Result};
use crate::hooks::{HookContext, HookDispatcher, HookEvent};
use crate::protocol::{
    ConnType, Identity, Message, PublishKind, Request, Transport, UpstreamClient,
    UpstreamConnector,
};
use crate::registry::{Consumer, Frame};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn peer() -> SocketAddr {
    "192.168.1.20:50000".parse().unwrap()
}

pub fn audio(timestamp: u32) -> Message {
    Message::Audio {
        timestamp,
        data: Bytes::from_static(&[0xAF, 0x01, 0x21]),
    }
}

pub fn audio_frame(timestamp: u32) -> Frame {
    Frame::audio(timestamp, Bytes::from_static(&[0xAF, 0x01, 0x21]), false)
}

/// Everything a [`MockTransport`] was asked to do
#[derive(Default)]
pub struct TransportLog {
    pub writes: Mutex<Vec<Vec<Message>>>,
    pub nodelay: Mutex<Vec<bool>>,
    pub buffer_hints: Mutex<Vec<Duration>>,
    pub rejected: Mutex<Option<String>>,
    pub connect_accepted: AtomicBool,
    pub play_started: AtomicBool,
    pub publish_started: AtomicBool,
    pub shutdown: AtomicBool,
    pub writes_after_shutdown: AtomicUsize,
}

impl TransportLog {
    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.writes.lock().iter().map(Vec::len).collect()
    }
}

/// Scripted transport
///
/// Connects with the given tcUrl, identifies as the given identity and reads
/// whatever the test pushes through its [`MockPeer`]. Dropping the peer
/// closes the connection.
pub struct MockTransport {
    tc_url: String,
    identity: Identity,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    log: Arc<TransportLog>,
}

/// Test side of a [`MockTransport`]
pub struct MockPeer {
    pub tx: mpsc::UnboundedSender<Message>,
    pub log: Arc<TransportLog>,
}

impl MockPeer {
    pub fn send(&self, msg: Message) {
        self.tx.send(msg).unwrap();
    }
}

impl MockTransport {
    pub fn new(tc_url: &str, identity: Identity) -> (Self, MockPeer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let log = Arc::new(TransportLog::default());
        let transport = Self {
            tc_url: tc_url.to_string(),
            identity,
            incoming: tokio::sync::Mutex::new(rx),
            log: Arc::clone(&log),
        };
        (transport, MockPeer { tx, log })
    }

    pub fn publisher(tc_url: &str, stream: &str) -> (Self, MockPeer) {
        Self::new(
            tc_url,
            Identity {
                conn_type: ConnType::Publish(PublishKind::Fmle),
                stream_name: stream.to_string(),
                duration: None,
            },
        )
    }

    pub fn player(tc_url: &str, stream: &str) -> (Self, MockPeer) {
        Self::new(
            tc_url,
            Identity {
                conn_type: ConnType::Play,
                stream_name: stream.to_string(),
                duration: None,
            },
        )
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn perform_handshake(&self) -> Result<()> {
        Ok(())
    }

    async fn connect_app(&self) -> Result<Request> {
        Ok(Request::from_tc_url(&self.tc_url)?)
    }

    async fn response_connect_app(&self, _req: &Request) -> Result<()> {
        self.log.connect_accepted.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn response_connect_reject(&self, _req: &Request, description: &str) {
        *self.log.rejected.lock() = Some(description.to_string());
    }

    async fn identify_client(&self, _stream_id: u32) -> Result<Identity> {
        Ok(self.identity.clone())
    }

    async fn start_play(&self, _stream_id: u32) -> Result<()> {
        self.log.play_started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn start_publish(&self, _kind: PublishKind, _stream_id: u32) -> Result<()> {
        self.log.publish_started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn read_message(&self) -> Result<Message> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::ConnectionClosed)
    }

    async fn write_messages(&self, _stream_id: u32, msgs: &[Message]) -> Result<()> {
        if self.log.shutdown.load(Ordering::SeqCst) {
            self.log.writes_after_shutdown.fetch_add(1, Ordering::SeqCst);
        }
        self.log.writes.lock().push(msgs.to_vec());
        Ok(())
    }

    fn set_nodelay(&self, enabled: bool) -> Result<()> {
        self.log.nodelay.lock().push(enabled);
        Ok(())
    }

    fn set_send_buffer_hint(&self, mw_sleep: Duration) {
        self.log.buffer_hints.lock().push(mw_sleep);
    }

    async fn shutdown(&self) {
        self.log.shutdown.store(true, Ordering::SeqCst);
    }
}

/// Consumer fed directly by the test
pub struct ScriptedConsumer {
    rx: mpsc::UnboundedReceiver<Frame>,
    pub pauses: Arc<Mutex<Vec<bool>>>,
}

impl ScriptedConsumer {
    pub fn new() -> (mpsc::UnboundedSender<Frame>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let consumer = Self {
            rx,
            pauses: Arc::new(Mutex::new(Vec::new())),
        };
        (tx, consumer)
    }
}

#[async_trait]
impl Consumer for ScriptedConsumer {
    async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    async fn on_pause(&mut self, paused: bool) {
        self.pauses.lock().push(paused);
    }
}

/// Hook dispatcher that records every event
#[derive(Default)]
pub struct RecordingHooks {
    pub events: Mutex<Vec<(HookEvent, HookContext)>>,
    pub reject: Option<HookEvent>,
}

impl RecordingHooks {
    pub fn rejecting(event: HookEvent) -> Self {
        Self {
            reject: Some(event),
            ..Default::default()
        }
    }

    pub fn kinds(&self) -> Vec<HookEvent> {
        self.events.lock().iter().map(|(event, _)| *event).collect()
    }

    pub fn context(&self, event: HookEvent) -> Option<HookContext> {
        self.events
            .lock()
            .iter()
            .find(|(e, _)| *e == event)
            .map(|(_, ctx)| ctx.clone())
    }
}

#[async_trait]
impl HookDispatcher for RecordingHooks {
    async fn notify(&self, event: HookEvent, ctx: &HookContext) -> std::result::Result<(), HookError> {
        self.events.lock().push((event, ctx.clone()));
        if self.reject == Some(event) {
            return Err(HookError::Rejected(format!("{} denied", event.as_str())));
        }
        Ok(())
    }
}

/// Upstream whose origins answer from a script
///
/// Origins missing from the script are unreachable.
#[derive(Default)]
pub struct ScriptedUpstream {
    pub origins: Mutex<Vec<(String, bool)>>,
    pub attempts: Mutex<VecDeque<String>>,
}

impl ScriptedUpstream {
    pub fn with_origin(self, origin: &str, accepts: bool) -> Self {
        self.origins.lock().push((origin.to_string(), accepts));
        self
    }
}

struct ScriptedClient {
    accepts: bool,
}

#[async_trait]
impl UpstreamClient for ScriptedClient {
    async fn handshake(&mut self) -> Result<()> {
        Ok(())
    }

    async fn connect_app(&mut self, _req: &Request) -> Result<()> {
        if self.accepts {
            Ok(())
        } else {
            Err(Error::ConnectionClosed)
        }
    }
}

#[async_trait]
impl UpstreamConnector for ScriptedUpstream {
    async fn connect(&self, origin: &str) -> Result<Box<dyn UpstreamClient>> {
        self.attempts.lock().push_back(origin.to_string());
        let accepts = self
            .origins
            .lock()
            .iter()
            .find(|(o, _)| o == origin)
            .map(|(_, accepts)| *accepts);
        match accepts {
            Some(accepts) => Ok(Box::new(ScriptedClient { accepts })),
            None => Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into()),
        }
    }
}
