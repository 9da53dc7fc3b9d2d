//! Live connection settings
//!
//! A copy of the vhost settings a connection runs with. The reload bus writes
//! these fields from whatever task publishes a reload while the connection's
//! loops read them, so every field is an atomic and no one ever blocks.
//! Loops read a fresh snapshot at each pacing or timeout decision, which is
//! what makes a reload take effect at the next decision rather than during a
//! write already in progress.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::server::config::VhostConfig;
use crate::server::reload::ReloadField;

/// Settings shared between a connection and the reload bus
#[derive(Debug)]
pub struct ConnectionSettings {
    vhost: String,
    mw_sleep_ms: AtomicU64,
    mw_enabled: AtomicBool,
    realtime: AtomicBool,
    send_min_interval_ms: AtomicU64,
    publish_1stpkt_timeout_ms: AtomicU64,
    publish_normal_timeout_ms: AtomicU64,
    tcp_nodelay: AtomicBool,
    /// Set when `tcp_nodelay` must be re-applied to the socket
    nodelay_dirty: AtomicBool,
    /// Set when the send buffer must be resized for a new `mw_sleep`
    mw_dirty: AtomicBool,
    vhost_removed: CancellationToken,
}

/// Merged-write parameters for one pacing cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub mw_sleep: Duration,
    pub mw_enabled: bool,
    pub realtime: bool,
    pub send_min_interval: Duration,
}

/// Publish deadlines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishTimeouts {
    pub first_packet: Duration,
    pub normal: Duration,
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl ConnectionSettings {
    pub fn from_vhost(vhost: impl Into<String>, config: &VhostConfig) -> Self {
        Self {
            vhost: vhost.into(),
            mw_sleep_ms: AtomicU64::new(millis(config.mw_sleep)),
            mw_enabled: AtomicBool::new(config.mw_enabled),
            realtime: AtomicBool::new(config.realtime),
            send_min_interval_ms: AtomicU64::new(millis(config.send_min_interval)),
            publish_1stpkt_timeout_ms: AtomicU64::new(millis(config.publish_1stpkt_timeout)),
            publish_normal_timeout_ms: AtomicU64::new(millis(config.publish_normal_timeout)),
            tcp_nodelay: AtomicBool::new(config.tcp_nodelay),
            nodelay_dirty: AtomicBool::new(false),
            mw_dirty: AtomicBool::new(false),
            vhost_removed: CancellationToken::new(),
        }
    }

    pub fn vhost(&self) -> &str {
        &self.vhost
    }

    /// Apply one reload event
    pub fn apply(&self, field: &ReloadField) {
        match *field {
            ReloadField::Removed => {
                self.vhost_removed.cancel();
            }
            ReloadField::Play {
                mw_sleep,
                mw_enabled,
                realtime,
                send_min_interval,
            } => {
                self.mw_sleep_ms.store(millis(mw_sleep), Ordering::Release);
                self.mw_enabled.store(mw_enabled, Ordering::Release);
                self.realtime.store(realtime, Ordering::Release);
                self.send_min_interval_ms
                    .store(millis(send_min_interval), Ordering::Release);
                self.mw_dirty.store(true, Ordering::Release);
            }
            ReloadField::TcpNodelay(enabled) => {
                self.tcp_nodelay.store(enabled, Ordering::Release);
                self.nodelay_dirty.store(true, Ordering::Release);
            }
            ReloadField::Realtime(enabled) => {
                self.realtime.store(enabled, Ordering::Release);
            }
            ReloadField::Publish {
                first_packet,
                normal,
            } => {
                self.publish_1stpkt_timeout_ms
                    .store(millis(first_packet), Ordering::Release);
                self.publish_normal_timeout_ms
                    .store(millis(normal), Ordering::Release);
            }
        }
    }

    pub fn pacing(&self) -> Pacing {
        Pacing {
            mw_sleep: Duration::from_millis(self.mw_sleep_ms.load(Ordering::Acquire)),
            mw_enabled: self.mw_enabled.load(Ordering::Acquire),
            realtime: self.realtime.load(Ordering::Acquire),
            send_min_interval: Duration::from_millis(
                self.send_min_interval_ms.load(Ordering::Acquire),
            ),
        }
    }

    pub fn publish_timeouts(&self) -> PublishTimeouts {
        PublishTimeouts {
            first_packet: Duration::from_millis(
                self.publish_1stpkt_timeout_ms.load(Ordering::Acquire),
            ),
            normal: Duration::from_millis(self.publish_normal_timeout_ms.load(Ordering::Acquire)),
        }
    }

    pub fn tcp_nodelay(&self) -> bool {
        self.tcp_nodelay.load(Ordering::Acquire)
    }

    /// New `tcp_nodelay` value if a reload changed it since the last call
    pub fn take_nodelay_change(&self) -> Option<bool> {
        self.nodelay_dirty
            .swap(false, Ordering::AcqRel)
            .then(|| self.tcp_nodelay())
    }

    /// New `mw_sleep` if a reload changed it since the last call
    pub fn take_mw_sleep_change(&self) -> Option<Duration> {
        self.mw_dirty
            .swap(false, Ordering::AcqRel)
            .then(|| self.pacing().mw_sleep)
    }

    pub fn is_vhost_removed(&self) -> bool {
        self.vhost_removed.is_cancelled()
    }

    /// Resolves once the vhost has been removed or disabled
    pub fn vhost_removed(&self) -> WaitForCancellationFuture<'_> {
        self.vhost_removed.cancelled()
    }
}
