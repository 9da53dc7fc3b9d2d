//! Lifecycle notifications
//!
//! A connection reports connect, publish or play start, the matching stop
//! and close to a [`HookDispatcher`] (typically an HTTP callback client).
//! [`HookSink`] wraps the dispatcher for one connection and enforces the
//! order and the at-most-once rule:
//!
//! ```text
//! connect → (publish | play) → (unpublish | stop) → close
//! ```
//!
//! Only a failed connect hook is reported to the caller; the others are
//! logged and otherwise ignored.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::HookError;
use crate::protocol::Request;

/// Lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    Connect,
    Publish,
    Unpublish,
    Play,
    Stop,
    Close,
}

impl HookEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            HookEvent::Connect => "on_connect",
            HookEvent::Publish => "on_publish",
            HookEvent::Unpublish => "on_unpublish",
            HookEvent::Play => "on_play",
            HookEvent::Stop => "on_stop",
            HookEvent::Close => "on_close",
        }
    }
}

/// What a hook receives about the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookContext {
    pub client_id: u64,
    pub ip: IpAddr,
    pub vhost: String,
    pub app: String,
    pub stream: String,
    pub tc_url: String,
    pub page_url: String,
    pub param: String,
    /// Cumulative bytes received, set for close
    pub bytes_in: u64,
    /// Cumulative bytes sent, set for close
    pub bytes_out: u64,
}

impl HookContext {
    pub fn from_request(client_id: u64, req: &Request) -> Self {
        Self {
            client_id,
            ip: req.ip,
            vhost: req.vhost.clone(),
            app: req.app.clone(),
            stream: req.stream.clone(),
            tc_url: req.tc_url.clone(),
            page_url: req.page_url.clone(),
            param: req.param.clone(),
            bytes_in: 0,
            bytes_out: 0,
        }
    }
}

/// Delivers lifecycle events
#[async_trait]
pub trait HookDispatcher: Send + Sync + 'static {
    async fn notify(&self, event: HookEvent, ctx: &HookContext) -> Result<(), HookError>;
}

/// Dispatcher that accepts everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

#[async_trait]
impl HookDispatcher for NoopHooks {
    async fn notify(&self, _event: HookEvent, _ctx: &HookContext) -> Result<(), HookError> {
        Ok(())
    }
}

/// Per-connection hook state
pub struct HookSink {
    dispatcher: Arc<dyn HookDispatcher>,
    session_id: u64,
    enabled: bool,
    connected: bool,
    /// Start event that fired, if any
    started: Option<HookEvent>,
    stopped: bool,
    closed: bool,
}

impl HookSink {
    pub fn new(dispatcher: Arc<dyn HookDispatcher>, session_id: u64) -> Self {
        Self {
            dispatcher,
            session_id,
            enabled: false,
            connected: false,
            started: None,
            stopped: false,
            closed: false,
        }
    }

    /// Whether events reach the dispatcher; follows the vhost setting
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Fire connect; a failure rejects the session
    pub async fn on_connect(&mut self, ctx: &HookContext) -> Result<(), HookError> {
        if self.connected || self.closed {
            return Ok(());
        }
        self.connected = true;
        self.deliver(HookEvent::Connect, ctx).await
    }

    /// Fire publish or play
    pub async fn on_start(&mut self, event: HookEvent, ctx: &HookContext) {
        debug_assert!(matches!(event, HookEvent::Publish | HookEvent::Play));
        if !self.connected || self.started.is_some() || self.closed {
            return;
        }
        self.started = Some(event);
        self.deliver_logged(event, ctx).await;
    }

    /// Fire the stop matching the start that fired
    pub async fn on_stop(&mut self, ctx: &HookContext) {
        let event = match self.started {
            Some(HookEvent::Publish) => HookEvent::Unpublish,
            Some(HookEvent::Play) => HookEvent::Stop,
            _ => return,
        };
        if self.stopped || self.closed {
            return;
        }
        self.stopped = true;
        self.deliver_logged(event, ctx).await;
    }

    /// Fire close; nothing fires afterwards
    pub async fn on_close(&mut self, ctx: &HookContext) {
        if !self.connected || self.closed {
            return;
        }
        self.closed = true;
        self.deliver_logged(HookEvent::Close, ctx).await;
    }

    async fn deliver(&self, event: HookEvent, ctx: &HookContext) -> Result<(), HookError> {
        if !self.enabled {
            return Ok(());
        }
        tracing::debug!(session_id = self.session_id, hook = event.as_str(), "Firing hook");
        self.dispatcher.notify(event, ctx).await
    }

    async fn deliver_logged(&self, event: HookEvent, ctx: &HookContext) {
        if let Err(e) = self.deliver(event, ctx).await {
            tracing::warn!(
                session_id = self.session_id,
                hook = event.as_str(),
                error = %e,
                "Hook failed, ignoring"
            );
        }
    }
}
