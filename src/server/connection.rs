//! Per-connection control core
//!
//! One [`Connection`] drives one accepted socket through
//!
//! ```text
//! handshake → connect → identify → authorize → publish | play → teardown
//! ```
//!
//! Whatever ends the session (peer close, protocol error, timeout, denial
//! or [`ConnectionHandle::dispose`]), teardown runs exactly once: publish
//! rights are released, the stop and close hooks fire, the reload
//! subscription is dropped and the transport is shut down.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::config::{VhostConfig, DEFAULT_VHOST};
use super::play::Player;
use super::publish::{acquire_publish, do_publishing, release_publish, PublishStats};
use super::recv::{RecvMode, RecvTask};
use super::reload::{ConfigStore, Subscription};
use crate::auth::{AuthGate, RuleSecurity, SecurityChecker};
use crate::error::{Error, ProtocolError, Result};
use crate::hooks::{HookContext, HookDispatcher, HookEvent, HookSink, NoopHooks};
use crate::protocol::{ConnType, PublishKind, Request, Transport, UpstreamConnector};
use crate::registry::{Source, SourceRegistry};
use crate::session::{ClientInfo, ConnectionPhase, ConnectionSettings, ConnectionState};
use crate::stats::{Kbps, KbpsRate, KbpsSample};

/// Collaborators shared by every connection of a server
#[derive(Clone)]
pub struct ServerContext {
    pub config: Arc<ConfigStore>,
    pub sources: Arc<dyn SourceRegistry>,
    pub hooks: Arc<dyn HookDispatcher>,
    pub security: Arc<dyn SecurityChecker>,
    pub upstream: Option<Arc<dyn UpstreamConnector>>,
}

impl ServerContext {
    /// Context with no hooks, rule-based security and no upstream
    pub fn new(config: Arc<ConfigStore>, sources: Arc<dyn SourceRegistry>) -> Self {
        Self {
            security: Arc::new(RuleSecurity::new(Arc::clone(&config))),
            config,
            sources,
            hooks: Arc::new(NoopHooks),
            upstream: None,
        }
    }

    pub fn hooks(mut self, hooks: Arc<dyn HookDispatcher>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn security(mut self, security: Arc<dyn SecurityChecker>) -> Self {
        self.security = security;
        self
    }

    pub fn upstream(mut self, upstream: Arc<dyn UpstreamConnector>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    fn gate(&self) -> AuthGate {
        let gate = AuthGate::new(Arc::clone(&self.config), Arc::clone(&self.security));
        match &self.upstream {
            Some(upstream) => gate.with_upstream(Arc::clone(upstream)),
            None => gate,
        }
    }
}

/// Owner-side handle to a running connection
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: u64,
    peer_addr: SocketAddr,
    cancel: CancellationToken,
    kbps: Arc<Kbps>,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Force the connection down
    ///
    /// Idempotent and callable from any task. The connection notices at its
    /// next suspension point and runs its normal teardown.
    pub fn dispose(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!(session_id = self.id, "Disposing connection");
        }
        self.cancel.cancel();
    }

    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cumulative bytes in and out
    pub fn remark_kbps(&self) -> KbpsSample {
        self.kbps.remark()
    }

    /// Bitrates since the previous call
    pub fn sample_kbps(&self) -> KbpsRate {
        self.kbps.sample()
    }
}

/// A single client connection
pub struct Connection<T: Transport> {
    state: ConnectionState,
    transport: Arc<T>,
    ctx: ServerContext,
    gate: AuthGate,
    handle: ConnectionHandle,
    hooks: HookSink,
    info: ClientInfo,
    settings: Arc<ConnectionSettings>,
    subscription: Option<Subscription>,
    source: Option<Arc<dyn Source>>,
}

impl<T: Transport> Connection<T> {
    pub fn new(id: u64, peer_addr: SocketAddr, transport: T, ctx: ServerContext) -> Self {
        let request = Request {
            ip: peer_addr.ip(),
            ..Default::default()
        };

        Self {
            state: ConnectionState::new(id, peer_addr),
            transport: Arc::new(transport),
            gate: ctx.gate(),
            hooks: HookSink::new(Arc::clone(&ctx.hooks), id),
            handle: ConnectionHandle {
                id,
                peer_addr,
                cancel: CancellationToken::new(),
                kbps: Arc::new(Kbps::new()),
            },
            info: ClientInfo::new(request),
            settings: Arc::new(ConnectionSettings::from_vhost(
                DEFAULT_VHOST,
                &VhostConfig::default(),
            )),
            subscription: None,
            source: None,
            ctx,
        }
    }

    pub fn id(&self) -> u64 {
        self.state.id
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.state.phase()
    }

    pub fn client_info(&self) -> &ClientInfo {
        &self.info
    }

    /// Drive the connection to completion
    ///
    /// Returns what ended the session; teardown has finished either way.
    pub async fn run(mut self) -> Result<()> {
        let cancel = self.handle.cancel.clone();
        let session_id = self.state.id;

        tracing::debug!(session_id = session_id, peer = %self.state.peer_addr, "Connection started");

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Disposed),
            result = self.service_cycle() => result,
        };

        match &result {
            Ok(()) => tracing::debug!(session_id = session_id, "Session finished"),
            Err(e) if e.is_graceful() => {
                tracing::debug!(session_id = session_id, reason = %e, "Session ended")
            }
            Err(e) => tracing::warn!(session_id = session_id, error = %e, "Session failed"),
        }

        self.on_disconnect().await;
        result
    }

    async fn service_cycle(&mut self) -> Result<()> {
        let config = self.ctx.config.current();
        let transport = Arc::clone(&self.transport);

        let connect = async {
            transport.perform_handshake().await?;
            transport.connect_app().await
        };
        let mut req = tokio::time::timeout(config.connection_timeout, connect)
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "handshake timed out")
            })??;
        req.ip = self.state.peer_addr.ip();

        let vhost = match self.gate.check_vhost(&mut req, true) {
            Ok(vhost) => vhost,
            Err(e) => {
                self.transport.response_connect_reject(&req, &e.to_string()).await;
                return Err(e.into());
            }
        };
        self.info = ClientInfo::new(req);
        self.hooks.set_enabled(vhost.hooks_enabled);

        tracing::info!(
            session_id = self.state.id,
            vhost = %self.info.req.vhost,
            app = %self.info.req.app,
            tc_url = %self.info.req.tc_url,
            "Client connected"
        );

        if let Err(e) = self.hooks.on_connect(&self.hook_context()).await {
            self.transport
                .response_connect_reject(&self.info.req, &e.to_string())
                .await;
            return Err(e.into());
        }

        self.transport.response_connect_app(&self.info.req).await?;
        self.bind_settings(&vhost)?;
        self.state.advance(ConnectionPhase::Identifying);

        self.stream_service_cycle().await
    }

    async fn stream_service_cycle(&mut self) -> Result<()> {
        let stream_id = self.info.res.stream_id;
        let identity = self.transport.identify_client(stream_id).await?;

        if identity.conn_type == ConnType::Unknown {
            return Err(ProtocolError::UnsupportedAction.into());
        }
        self.info.conn_type = identity.conn_type;
        self.info.req.apply_stream_name(&identity.stream_name)?;
        self.info.req.duration = identity.duration;

        // The stream name may carry its own vhost; no fallback this time
        let vhost = self.gate.check_vhost(&mut self.info.req, false)?;
        if self.info.req.vhost != self.settings.vhost() {
            self.bind_settings(&vhost)?;
        }
        self.info.edge = vhost.edge;

        tracing::info!(
            session_id = self.state.id,
            action = self.info.conn_type.action(),
            stream = %self.info.req.stream_key(),
            edge = self.info.edge,
            "Client identified"
        );

        self.gate.authorize(&self.info, &vhost)?;
        self.gate.traverse_token(&self.info.req, &vhost).await?;

        let source = self
            .ctx
            .sources
            .lookup_or_create(&self.info.req.stream_key())
            .await?;
        self.source = Some(Arc::clone(&source));

        match self.info.conn_type {
            ConnType::Play => self.playing(source).await,
            ConnType::Publish(kind) => self.publishing(source, kind).await,
            ConnType::Unknown => Err(ProtocolError::UnsupportedAction.into()),
        }
    }

    async fn playing(&mut self, source: Arc<dyn Source>) -> Result<()> {
        let stream_id = self.info.res.stream_id;

        self.transport.start_play(stream_id).await?;
        self.hooks
            .on_start(HookEvent::Play, &self.hook_context())
            .await;
        self.state.advance(ConnectionPhase::Playing);

        let mut consumer = source.new_consumer().await?;
        let (_recv, mut queue) = self.spawn_recv(RecvMode::Play);

        let settings = Arc::clone(&self.settings);
        let mut player = Player::new(
            self.transport.as_ref(),
            &settings,
            &self.handle.kbps,
            stream_id,
            self.state.id,
        )
        .with_duration(self.info.req.duration);

        let end = player.run(consumer.as_mut(), &mut queue).await?;
        tracing::info!(session_id = self.state.id, end = ?end, "Play finished");
        Ok(())
    }

    async fn publishing(&mut self, source: Arc<dyn Source>, kind: PublishKind) -> Result<()> {
        let stream_id = self.info.res.stream_id;

        acquire_publish(source.as_ref(), self.state.id).await?;
        self.transport.start_publish(kind, stream_id).await?;
        self.hooks
            .on_start(HookEvent::Publish, &self.hook_context())
            .await;

        let phase = if self.info.edge {
            ConnectionPhase::EdgeForwarding
        } else {
            ConnectionPhase::Publishing
        };
        self.state.advance(phase);

        let (_recv, mut queue) = self.spawn_recv(RecvMode::Publish);
        let mut stats = PublishStats::default();
        let result = do_publishing(
            self.transport.as_ref(),
            &mut queue,
            source.as_ref(),
            &self.settings,
            &mut stats,
            self.state.id,
        )
        .await;

        release_publish(source.as_ref(), self.state.id).await;
        tracing::info!(
            session_id = self.state.id,
            stream = %source.key(),
            kind = ?kind,
            media_messages = stats.media_messages,
            frames = stats.frames,
            "Publish finished"
        );
        result
    }

    fn spawn_recv(&self, mode: RecvMode) -> (RecvTask, super::recv::RecvQueue) {
        RecvTask::spawn(
            Arc::clone(&self.transport),
            mode,
            Arc::clone(&self.handle.kbps),
            self.ctx.config.current().recv_queue_capacity,
            &self.handle.cancel,
            self.state.id,
        )
    }

    /// Snapshot the vhost settings and subscribe them to reloads
    fn bind_settings(&mut self, vhost: &VhostConfig) -> Result<()> {
        let settings = Arc::new(ConnectionSettings::from_vhost(
            self.info.req.vhost.clone(),
            vhost,
        ));

        // Drop the old subscription before taking a new one
        self.subscription = None;
        self.subscription = Some(self.ctx.config.bus().subscribe(Arc::clone(&settings)));
        self.settings = settings;

        self.transport.set_nodelay(self.settings.tcp_nodelay())?;
        Ok(())
    }

    fn hook_context(&self) -> HookContext {
        HookContext::from_request(self.state.id, &self.info.req)
    }

    /// Teardown, run once whatever ended the session
    async fn on_disconnect(&mut self) {
        self.state.begin_close();

        if self.info.conn_type.is_publish() {
            if let Some(source) = &self.source {
                release_publish(source.as_ref(), self.state.id).await;
            }
        }

        let totals = self.handle.kbps.remark();
        let mut ctx = self.hook_context();
        ctx.bytes_in = totals.bytes_in;
        ctx.bytes_out = totals.bytes_out;
        self.hooks.on_stop(&ctx).await;
        self.hooks.on_close(&ctx).await;

        self.subscription = None;
        self.source = None;
        self.transport.shutdown().await;
        self.state.advance(ConnectionPhase::Disposed);

        tracing::info!(
            session_id = self.state.id,
            duration_ms = self.state.duration().as_millis() as u64,
            bytes_in = totals.bytes_in,
            bytes_out = totals.bytes_out,
            "Connection closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use bytes::Bytes;
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::error::AuthError;
    use crate::protocol::{Command, Message};
    use crate::registry::{StreamKey, StreamRegistry};
    use crate::server::config::{
        RuleMethod, RuleTarget, SecurityConfig, SecurityRule, ServerConfig,
    };
    use crate::server::reload::ReloadField;
    use crate::test_util::{
        audio, audio_frame, init_tracing, peer, MockTransport, RecordingHooks, ScriptedUpstream,
    };

    struct Harness {
        store: Arc<ConfigStore>,
        registry: Arc<StreamRegistry>,
        hooks: Arc<RecordingHooks>,
        ctx: ServerContext,
    }

    fn harness(config: ServerConfig, hooks: RecordingHooks) -> Harness {
        init_tracing();
        let store = Arc::new(ConfigStore::new(config));
        let registry = Arc::new(StreamRegistry::new());
        let hooks = Arc::new(hooks);
        let ctx = ServerContext::new(Arc::clone(&store), Arc::clone(&registry) as _)
            .hooks(Arc::clone(&hooks) as _);
        Harness {
            store,
            registry,
            hooks,
            ctx,
        }
    }

    fn hooked_default() -> ServerConfig {
        ServerConfig::default().vhost(DEFAULT_VHOST, VhostConfig::default().hooks(true))
    }

    async fn wait_for_subscribers(registry: &StreamRegistry, key: &StreamKey, count: u32) {
        for _ in 0..400 {
            let current = registry
                .stream_stats(key)
                .await
                .map_or(0, |stats| stats.subscriber_count);
            if current == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("subscriber count never reached {count}");
    }

    async fn wait_for(flag: &std::sync::atomic::AtomicBool) {
        for _ in 0..400 {
            if flag.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("flag never set");
    }

    fn media(ts: u32) -> Message {
        match ts {
            0 => Message::Video {
                timestamp: 0,
                data: Bytes::from_static(&[0x17, 0x01, 0x00, 0x00, 0x00]),
            },
            ts if ts % 2 == 1 => Message::Video {
                timestamp: ts,
                data: Bytes::from_static(&[0x27, 0x01, 0x00, 0x00, 0x00]),
            },
            ts => audio(ts),
        }
    }

    #[tokio::test]
    async fn test_publish_session_until_peer_disconnects() {
        let h = harness(hooked_default(), RecordingHooks::default());
        let key = StreamKey::new(DEFAULT_VHOST, "live", "test");
        let source = h.registry.lookup_or_create(&key).await.unwrap();
        let mut consumer = source.new_consumer().await.unwrap();

        let (transport, peer_side) =
            MockTransport::publisher("rtmp://unknown.example.com/live", "test");
        for ts in 0..100 {
            peer_side.send(media(ts));
        }
        let log = Arc::clone(&peer_side.log);
        drop(peer_side);

        let err = assert_err!(Connection::new(1, peer(), transport, h.ctx.clone()).run().await);
        assert!(matches!(err, Error::ConnectionClosed));

        assert_eq!(
            h.hooks.kinds(),
            vec![
                HookEvent::Connect,
                HookEvent::Publish,
                HookEvent::Unpublish,
                HookEvent::Close
            ]
        );
        let close = h.hooks.context(HookEvent::Close).unwrap();
        assert_eq!(close.vhost, DEFAULT_VHOST);
        assert_eq!(close.stream, "test");
        assert_eq!(close.bytes_in, 51 * 5 + 49 * 3);

        for ts in 0..100 {
            assert_eq!(consumer.try_recv().map(|f| f.timestamp), Some(ts));
        }

        let memory = h.registry.source(&key).await;
        assert_eq!(memory.publisher().await, None);
        assert!(log.publish_started.load(Ordering::SeqCst));
        assert!(log.shutdown.load(Ordering::SeqCst));
        assert_eq!(h.store.bus().subscriber_count(DEFAULT_VHOST), 0);
    }

    #[tokio::test]
    async fn test_second_publisher_is_refused() {
        let h = harness(hooked_default(), RecordingHooks::default());
        let key = StreamKey::new(DEFAULT_VHOST, "live", "livestream");
        let source = h.registry.lookup_or_create(&key).await.unwrap();
        assert!(source.acquire_publisher(99).await);

        let (transport, peer_side) = MockTransport::publisher("rtmp://host/live", "livestream");
        let err = Connection::new(2, peer(), transport, h.ctx.clone())
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, Error::PublishConflict(_)));
        assert_eq!(h.hooks.kinds(), vec![HookEvent::Connect, HookEvent::Close]);
        assert!(!peer_side.log.publish_started.load(Ordering::SeqCst));
        assert_eq!(h.registry.source(&key).await.publisher().await, Some(99));
    }

    #[tokio::test]
    async fn test_unknown_vhost_without_default_is_rejected() {
        let config = ServerConfig::default()
            .without_default_vhost()
            .vhost("known.host", VhostConfig::default());
        let h = harness(config, RecordingHooks::default());

        let (transport, peer_side) = MockTransport::player("rtmp://other.host/live", "s");
        let err = Connection::new(1, peer(), transport, h.ctx.clone())
            .run()
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Authorization(AuthError::VhostNotFound(_))
        ));
        assert!(peer_side.log.rejected.lock().is_some());
        assert!(!peer_side.log.connect_accepted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_connect_hook_rejection() {
        let h = harness(hooked_default(), RecordingHooks::rejecting(HookEvent::Connect));

        let (transport, peer_side) = MockTransport::player("rtmp://host/live", "s");
        let err = Connection::new(1, peer(), transport, h.ctx.clone())
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Hook(_)));
        assert!(peer_side.log.rejected.lock().is_some());
        assert!(!peer_side.log.connect_accepted.load(Ordering::SeqCst));
        assert_eq!(h.hooks.kinds(), vec![HookEvent::Connect, HookEvent::Close]);
    }

    #[tokio::test]
    async fn test_security_denial_stops_before_play() {
        let vhost = VhostConfig::default()
            .hooks(true)
            .security(SecurityConfig::with_rules([SecurityRule::deny(
                RuleMethod::Play,
                RuleTarget::All,
            )]));
        let h = harness(ServerConfig::default().vhost(DEFAULT_VHOST, vhost), RecordingHooks::default());

        let (transport, peer_side) = MockTransport::player("rtmp://host/live", "s");
        let err = Connection::new(1, peer(), transport, h.ctx.clone())
            .run()
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Authorization(AuthError::SecurityDenied { action: "play", .. })
        ));
        assert!(!peer_side.log.play_started.load(Ordering::SeqCst));
        assert_eq!(h.hooks.kinds(), vec![HookEvent::Connect, HookEvent::Close]);
    }

    #[tokio::test]
    async fn test_edge_token_traverse_failure() {
        let vhost = VhostConfig::default()
            .edge(["origin-a:1935", "origin-b:1935"])
            .token_traverse(true);
        let h = harness(
            ServerConfig::default().vhost("edge.host", vhost),
            RecordingHooks::default(),
        );
        let upstream = Arc::new(ScriptedUpstream::default().with_origin("origin-b:1935", false));
        let ctx = h.ctx.clone().upstream(Arc::clone(&upstream) as _);

        let (transport, peer_side) = MockTransport::player("rtmp://edge.host/live", "s");
        let err = Connection::new(1, peer(), transport, ctx)
            .run()
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Authorization(AuthError::TokenTraverse(_))
        ));
        assert_eq!(
            upstream.attempts.lock().iter().cloned().collect::<Vec<_>>(),
            vec!["origin-a:1935", "origin-b:1935"]
        );
        assert!(!peer_side.log.play_started.load(Ordering::SeqCst));
        assert_eq!(peer_side.log.write_count(), 0);
        assert_eq!(h.registry.stream_count().await, 0);
    }

    #[tokio::test]
    async fn test_edge_token_traverse_success_then_peer_leaves() {
        let vhost = VhostConfig::default()
            .edge(["origin-a:1935"])
            .token_traverse(true);
        let h = harness(
            ServerConfig::default().vhost("edge.host", vhost),
            RecordingHooks::default(),
        );
        let upstream = Arc::new(ScriptedUpstream::default().with_origin("origin-a:1935", true));
        let ctx = h.ctx.clone().upstream(upstream as _);

        let (transport, peer_side) = MockTransport::player("rtmp://edge.host/live", "s");
        let log = Arc::clone(&peer_side.log);
        drop(peer_side);

        let err = Connection::new(1, peer(), transport, ctx)
            .run()
            .await
            .unwrap_err();

        assert!(err.is_graceful());
        assert!(log.play_started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_dispose_during_play() {
        let h = harness(hooked_default(), RecordingHooks::default());
        let key = StreamKey::new(DEFAULT_VHOST, "live", "s");
        let source = h.registry.lookup_or_create(&key).await.unwrap();
        assert!(source.acquire_publisher(50).await);

        let (transport, peer_side) = MockTransport::player("rtmp://host/live", "s");
        let connection = Connection::new(7, peer(), transport, h.ctx.clone());
        let handle = connection.handle();
        let task = tokio::spawn(connection.run());

        wait_for(&peer_side.log.play_started).await;
        wait_for_subscribers(&h.registry, &key, 1).await;
        for ts in 0..4 {
            source.on_frame(audio_frame(ts * 10)).await;
        }

        handle.dispose();
        handle.dispose();
        assert!(handle.is_disposed());

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Disposed));

        for ts in 4..8 {
            source.on_frame(audio_frame(ts * 10)).await;
        }

        assert_eq!(
            h.hooks.kinds(),
            vec![
                HookEvent::Connect,
                HookEvent::Play,
                HookEvent::Stop,
                HookEvent::Close
            ]
        );
        wait_for_subscribers(&h.registry, &key, 0).await;
        assert!(peer_side.log.shutdown.load(Ordering::SeqCst));
        assert_eq!(peer_side.log.writes_after_shutdown.load(Ordering::SeqCst), 0);
        assert_eq!(h.store.bus().subscriber_count(DEFAULT_VHOST), 0);
    }

    #[tokio::test]
    async fn test_dispose_during_publish() {
        let h = harness(hooked_default(), RecordingHooks::default());
        let key = StreamKey::new(DEFAULT_VHOST, "live", "s");

        let (transport, peer_side) = MockTransport::publisher("rtmp://host/live", "s");
        let connection = Connection::new(3, peer(), transport, h.ctx.clone());
        let handle = connection.handle();
        let task = tokio::spawn(connection.run());

        wait_for(&peer_side.log.publish_started).await;
        for ts in 0..4 {
            peer_side.send(media(ts));
        }
        assert_eq!(h.registry.source(&key).await.publisher().await, Some(3));

        handle.dispose();
        handle.dispose();

        let err = assert_err!(task.await.unwrap());
        assert!(matches!(err, Error::Disposed));

        assert_eq!(
            h.hooks.kinds(),
            vec![
                HookEvent::Connect,
                HookEvent::Publish,
                HookEvent::Unpublish,
                HookEvent::Close
            ]
        );
        assert_eq!(h.registry.source(&key).await.publisher().await, None);
        assert!(peer_side.log.shutdown.load(Ordering::SeqCst));
        assert_eq!(h.store.bus().subscriber_count(DEFAULT_VHOST), 0);

        let (transport, peer_side) = MockTransport::publisher("rtmp://host/live", "s");
        peer_side.send(Message::Command(Command::FcUnpublish));
        assert_ok!(Connection::new(4, peer(), transport, h.ctx.clone()).run().await);
    }

    #[tokio::test]
    async fn test_nodelay_reload_during_publish() {
        let config = ServerConfig::default().vhost("a.host", VhostConfig::default());
        let h = harness(config, RecordingHooks::default());

        let (transport, peer_side) = MockTransport::publisher("rtmp://a.host/live", "s");
        let task = tokio::spawn(Connection::new(1, peer(), transport, h.ctx.clone()).run());

        wait_for(&peer_side.log.publish_started).await;
        let events = h.store.reload(
            ServerConfig::default().vhost("a.host", VhostConfig::default().tcp_nodelay(true)),
        );
        assert!(events
            .iter()
            .any(|e| e.vhost == "a.host" && e.field == ReloadField::TcpNodelay(true)));

        for ts in 0..20 {
            peer_side.send(audio(ts * 10));
        }
        peer_side.send(Message::Command(Command::FcUnpublish));

        assert_ok!(task.await.unwrap());
        assert_eq!(*peer_side.log.nodelay.lock(), vec![false, true]);
    }

    #[tokio::test]
    async fn test_vhost_removal_ends_publish() {
        let config = ServerConfig::default().vhost("a.host", VhostConfig::default().hooks(true));
        let h = harness(config, RecordingHooks::default());

        let (transport, peer_side) = MockTransport::publisher("rtmp://a.host/live", "s");
        let task = tokio::spawn(Connection::new(1, peer(), transport, h.ctx.clone()).run());

        wait_for(&peer_side.log.publish_started).await;
        assert_eq!(h.store.bus().subscriber_count("a.host"), 1);

        let events = h.store.reload(ServerConfig::default());
        assert!(events
            .iter()
            .any(|e| e.vhost == "a.host" && e.field == ReloadField::Removed));

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            Error::Authorization(AuthError::VhostRemoved(_))
        ));
        assert_eq!(
            h.hooks.kinds(),
            vec![
                HookEvent::Connect,
                HookEvent::Publish,
                HookEvent::Unpublish,
                HookEvent::Close
            ]
        );

        let key = StreamKey::new("a.host", "live", "s");
        assert_eq!(h.registry.source(&key).await.publisher().await, None);
    }

    #[tokio::test]
    async fn test_stream_vhost_override_rebinds_settings() {
        let config = ServerConfig::default()
            .vhost("a.host", VhostConfig::default().hooks(true))
            .vhost("b.host", VhostConfig::default().tcp_nodelay(true).hooks(true));
        let h = harness(config, RecordingHooks::default());

        let (transport, peer_side) = MockTransport::publisher("rtmp://a.host/live", "s?vhost=b.host");
        peer_side.send(Message::Command(Command::FcUnpublish));

        assert_ok!(Connection::new(1, peer(), transport, h.ctx.clone()).run().await);

        assert_eq!(*peer_side.log.nodelay.lock(), vec![false, true]);
        let ctx = h.hooks.context(HookEvent::Publish).unwrap();
        assert_eq!(ctx.vhost, "b.host");
        assert_eq!(ctx.param, "vhost=b.host");
    }
}
