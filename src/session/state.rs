//! Connection state machine
//!
//! Tracks a connection from accept to teardown:
//!
//! ```text
//! Init → Identifying → {Publishing | Playing | EdgeForwarding} → Closing → Disposed
//! ```
//!
//! Any phase before `Closing` may jump straight to `Closing` on error.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Connection lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Accepted, handshake not finished
    Init,
    /// Connected; waiting for the client's publish or play request
    Identifying,
    /// Ingesting media into a source
    Publishing,
    /// Delivering media to the client
    Playing,
    /// Ingesting on an edge, frames relayed toward the origin
    EdgeForwarding,
    /// Teardown in progress
    Closing,
    /// All resources released
    Disposed,
}

impl ConnectionPhase {
    /// Whether `next` is a legal successor of this phase
    pub fn can_transition_to(self, next: ConnectionPhase) -> bool {
        use ConnectionPhase::*;

        match (self, next) {
            (Init, Identifying) => true,
            (Identifying, Publishing | Playing | EdgeForwarding) => true,
            (Closing, Disposed) => true,
            (Closing | Disposed, _) => false,
            (_, Closing) => true,
            _ => false,
        }
    }

    /// A data-path loop is running
    pub fn is_streaming(self) -> bool {
        matches!(
            self,
            ConnectionPhase::Publishing | ConnectionPhase::Playing | ConnectionPhase::EdgeForwarding
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionPhase::Init => "init",
            ConnectionPhase::Identifying => "identifying",
            ConnectionPhase::Publishing => "publishing",
            ConnectionPhase::Playing => "playing",
            ConnectionPhase::EdgeForwarding => "edge-forwarding",
            ConnectionPhase::Closing => "closing",
            ConnectionPhase::Disposed => "disposed",
        }
    }
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-connection lifecycle bookkeeping
#[derive(Debug)]
pub struct ConnectionState {
    /// Unique connection ID
    pub id: u64,

    /// Remote peer address
    pub peer_addr: SocketAddr,

    phase: ConnectionPhase,

    /// Accept time
    pub connected_at: Instant,

    /// When the client's intent became known
    pub identified_at: Option<Instant>,
}

impl ConnectionState {
    pub fn new(id: u64, peer_addr: SocketAddr) -> Self {
        Self {
            id,
            peer_addr,
            phase: ConnectionPhase::Init,
            connected_at: Instant::now(),
            identified_at: None,
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// Move to `next`
    ///
    /// Illegal transitions are refused and logged; returns whether the
    /// phase changed.
    pub fn advance(&mut self, next: ConnectionPhase) -> bool {
        if !self.phase.can_transition_to(next) {
            tracing::warn!(
                session_id = self.id,
                from = %self.phase,
                to = %next,
                "Illegal phase transition"
            );
            return false;
        }

        tracing::trace!(session_id = self.id, from = %self.phase, to = %next, "Phase transition");
        if next.is_streaming() {
            self.identified_at = Some(Instant::now());
        }
        self.phase = next;
        true
    }

    /// Enter `Closing` unless teardown already started
    pub fn begin_close(&mut self) -> bool {
        if matches!(self.phase, ConnectionPhase::Closing | ConnectionPhase::Disposed) {
            return false;
        }
        self.advance(ConnectionPhase::Closing)
    }

    /// Time since accept
    pub fn duration(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
