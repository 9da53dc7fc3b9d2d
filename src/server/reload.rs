//! Configuration hot reload
//!
//! [`ConfigStore::reload`] diffs the old and new vhost tables and publishes
//! one [`VhostReloadEvent`] per changed field. Every connection subscribes
//! its [`ConnectionSettings`] for its own vhost; publishing applies the event
//! to each subscriber with atomic stores, so reloads never wait on a
//! connection and never touch its state machine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;

use super::config::{ServerConfig, VhostConfig};
use crate::session::ConnectionSettings;

/// A reloadable vhost field and its new value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadField {
    /// The vhost is gone or disabled
    Removed,
    /// Merged-write and delivery cadence
    Play {
        mw_sleep: Duration,
        mw_enabled: bool,
        realtime: bool,
        send_min_interval: Duration,
    },
    TcpNodelay(bool),
    Realtime(bool),
    Publish {
        first_packet: Duration,
        normal: Duration,
    },
}

/// Reload notification scoped to one vhost
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VhostReloadEvent {
    pub vhost: String,
    pub field: ReloadField,
}

type Subscribers = HashMap<String, HashMap<u64, Arc<ConnectionSettings>>>;

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    subscribers: RwLock<Subscribers>,
}

/// Process-wide reload publish/subscribe, keyed by vhost
#[derive(Clone, Default)]
pub struct ReloadBus {
    inner: Arc<BusInner>,
}

impl ReloadBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `settings` to events for its vhost
    ///
    /// Dropping the returned [`Subscription`] unsubscribes.
    pub fn subscribe(&self, settings: Arc<ConnectionSettings>) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let vhost = settings.vhost().to_string();

        self.inner
            .subscribers
            .write()
            .entry(vhost.clone())
            .or_default()
            .insert(id, settings);

        tracing::trace!(vhost = %vhost, subscription = id, "Reload subscription added");

        Subscription {
            bus: Arc::downgrade(&self.inner),
            vhost,
            id,
        }
    }

    /// Apply an event to every subscriber of its vhost
    ///
    /// Returns the number of subscribers reached.
    pub fn publish(&self, event: &VhostReloadEvent) -> usize {
        let subscribers = self.inner.subscribers.read();
        let Some(targets) = subscribers.get(&event.vhost) else {
            return 0;
        };

        for settings in targets.values() {
            settings.apply(&event.field);
        }

        tracing::debug!(
            vhost = %event.vhost,
            field = ?event.field,
            connections = targets.len(),
            "Reload applied"
        );
        targets.len()
    }

    pub fn subscriber_count(&self, vhost: &str) -> usize {
        self.inner
            .subscribers
            .read()
            .get(vhost)
            .map_or(0, HashMap::len)
    }
}

/// Live reload subscription
pub struct Subscription {
    bus: Weak<BusInner>,
    vhost: String,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        let mut subscribers = bus.subscribers.write();
        if let Some(targets) = subscribers.get_mut(&self.vhost) {
            targets.remove(&self.id);
            if targets.is_empty() {
                subscribers.remove(&self.vhost);
            }
        }
    }
}

/// Holder of the live server configuration
pub struct ConfigStore {
    current: RwLock<Arc<ServerConfig>>,
    bus: ReloadBus,
}

impl ConfigStore {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
            bus: ReloadBus::new(),
        }
    }

    /// Current configuration
    pub fn current(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.current.read())
    }

    pub fn bus(&self) -> &ReloadBus {
        &self.bus
    }

    /// Swap in a new configuration and notify affected connections
    ///
    /// Returns the events that were published.
    pub fn reload(&self, config: ServerConfig) -> Vec<VhostReloadEvent> {
        let new = Arc::new(config);
        let old = std::mem::replace(&mut *self.current.write(), Arc::clone(&new));

        let mut events = Vec::new();
        for (name, before) in &old.vhosts {
            let fields = match new.vhosts.get(name) {
                Some(after) if after.enabled || !before.enabled => diff_vhost(before, after),
                _ => vec![ReloadField::Removed],
            };
            events.extend(fields.into_iter().map(|field| VhostReloadEvent {
                vhost: name.clone(),
                field,
            }));
        }

        for event in &events {
            self.bus.publish(event);
        }

        tracing::info!(events = events.len(), "Configuration reloaded");
        events
    }
}

fn diff_vhost(before: &VhostConfig, after: &VhostConfig) -> Vec<ReloadField> {
    let mut fields = Vec::new();

    if before.tcp_nodelay != after.tcp_nodelay {
        fields.push(ReloadField::TcpNodelay(after.tcp_nodelay));
    }
    if before.realtime != after.realtime {
        fields.push(ReloadField::Realtime(after.realtime));
    }
    if before.mw_sleep != after.mw_sleep
        || before.mw_enabled != after.mw_enabled
        || before.send_min_interval != after.send_min_interval
    {
        fields.push(ReloadField::Play {
            mw_sleep: after.mw_sleep,
            mw_enabled: after.mw_enabled,
            realtime: after.realtime,
            send_min_interval: after.send_min_interval,
        });
    }
    if before.publish_1stpkt_timeout != after.publish_1stpkt_timeout
        || before.publish_normal_timeout != after.publish_normal_timeout
    {
        fields.push(ReloadField::Publish {
            first_packet: after.publish_1stpkt_timeout,
            normal: after.publish_normal_timeout,
        });
    }

    fields
}
