//! Server and vhost configuration

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Name of the fallback vhost
pub const DEFAULT_VHOST: &str = "__defaultVhost__";

/// Which authorization check runs first after the vhost is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthOrder {
    /// Referer lists, then security rules
    #[default]
    RefererFirst,
    /// Security rules, then referer lists
    SecurityFirst,
}

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,

    /// Handshake and connect must complete within this time
    pub connection_timeout: Duration,

    /// Capacity of the queue between a receive task and its loop
    pub recv_queue_capacity: usize,

    /// Order of referer and security checks
    pub auth_order: AuthOrder,

    /// Configured vhosts by name
    pub vhosts: HashMap<String, VhostConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 1935)),
            max_connections: 0,
            connection_timeout: Duration::from_secs(10),
            recv_queue_capacity: 128,
            auth_order: AuthOrder::default(),
            vhosts: HashMap::from([(DEFAULT_VHOST.to_string(), VhostConfig::default())]),
        }
    }
}

impl ServerConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn recv_queue_capacity(mut self, capacity: usize) -> Self {
        self.recv_queue_capacity = capacity.max(1);
        self
    }

    pub fn auth_order(mut self, order: AuthOrder) -> Self {
        self.auth_order = order;
        self
    }

    /// Add or replace a vhost
    pub fn vhost(mut self, name: impl Into<String>, config: VhostConfig) -> Self {
        self.vhosts.insert(name.into(), config);
        self
    }

    /// Remove the fallback vhost
    pub fn without_default_vhost(mut self) -> Self {
        self.vhosts.remove(DEFAULT_VHOST);
        self
    }

    /// Look up a vhost by name
    ///
    /// With `try_default`, an unknown name falls back to [`DEFAULT_VHOST`] when
    /// that vhost is configured. Returns the name that was bound.
    pub fn resolve_vhost(&self, name: &str, try_default: bool) -> Option<(&str, &VhostConfig)> {
        if let Some((key, vhost)) = self.vhosts.get_key_value(name) {
            return Some((key.as_str(), vhost));
        }
        if !try_default {
            return None;
        }
        self.vhosts
            .get_key_value(DEFAULT_VHOST)
            .map(|(key, vhost)| (key.as_str(), vhost))
    }
}

/// Per-vhost settings
#[derive(Debug, Clone, PartialEq)]
pub struct VhostConfig {
    pub enabled: bool,

    /// Edge mode: this server relays streams of an upstream origin
    pub edge: bool,

    /// Upstream origins, `host[:port]`, tried in order
    pub edge_origins: Vec<String>,

    /// Authenticate edge clients against the origin before serving them
    pub token_traverse: bool,

    pub token_traverse_timeout: Duration,

    pub refer: RefererConfig,

    pub security: SecurityConfig,

    /// Merged-write interval
    pub mw_sleep: Duration,

    pub mw_enabled: bool,

    /// Low-latency delivery: flush whatever is available every cycle
    pub realtime: bool,

    /// Minimum gap between two sends to a player
    pub send_min_interval: Duration,

    /// No media within this time after publish starts is fatal
    pub publish_1stpkt_timeout: Duration,

    /// Longest allowed gap between two media messages
    pub publish_normal_timeout: Duration,

    pub tcp_nodelay: bool,

    /// Fire lifecycle hooks for this vhost
    pub hooks_enabled: bool,
}

impl Default for VhostConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            edge: false,
            edge_origins: Vec::new(),
            token_traverse: false,
            token_traverse_timeout: Duration::from_millis(3000),
            refer: RefererConfig::default(),
            security: SecurityConfig::default(),
            mw_sleep: Duration::from_millis(350),
            mw_enabled: true,
            realtime: false,
            send_min_interval: Duration::ZERO,
            publish_1stpkt_timeout: Duration::from_millis(20000),
            publish_normal_timeout: Duration::from_millis(5000),
            tcp_nodelay: false,
            hooks_enabled: false,
        }
    }
}

impl VhostConfig {
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Enable edge mode with the given origins
    pub fn edge(mut self, origins: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.edge = true;
        self.edge_origins = origins.into_iter().map(Into::into).collect();
        self
    }

    pub fn token_traverse(mut self, enabled: bool) -> Self {
        self.token_traverse = enabled;
        self
    }

    pub fn token_traverse_timeout(mut self, timeout: Duration) -> Self {
        self.token_traverse_timeout = timeout;
        self
    }

    pub fn refer(mut self, refer: RefererConfig) -> Self {
        self.refer = refer;
        self
    }

    pub fn security(mut self, security: SecurityConfig) -> Self {
        self.security = security;
        self
    }

    pub fn mw_sleep(mut self, sleep: Duration) -> Self {
        self.mw_sleep = sleep;
        self
    }

    pub fn disable_merged_write(mut self) -> Self {
        self.mw_enabled = false;
        self
    }

    pub fn realtime(mut self, enabled: bool) -> Self {
        self.realtime = enabled;
        self
    }

    pub fn send_min_interval(mut self, interval: Duration) -> Self {
        self.send_min_interval = interval;
        self
    }

    pub fn publish_timeouts(mut self, first_packet: Duration, normal: Duration) -> Self {
        self.publish_1stpkt_timeout = first_packet;
        self.publish_normal_timeout = normal;
        self
    }

    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    pub fn hooks(mut self, enabled: bool) -> Self {
        self.hooks_enabled = enabled;
        self
    }
}

/// Allowed page-url domains
///
/// An empty list allows everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefererConfig {
    pub enabled: bool,
    /// Checked for every connection
    pub all: Vec<String>,
    /// Checked before play
    pub play: Vec<String>,
    /// Checked before publish
    pub publish: Vec<String>,
}

impl RefererConfig {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    pub fn all(mut self, domains: &[&str]) -> Self {
        self.all = domains.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn play(mut self, domains: &[&str]) -> Self {
        self.play = domains.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn publish(mut self, domains: &[&str]) -> Self {
        self.publish = domains.iter().map(|d| d.to_string()).collect();
        self
    }
}

/// Allow or deny
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Allow,
    Deny,
}

/// Which client action a rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleMethod {
    Play,
    Publish,
}

/// Which clients a rule matches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleTarget {
    All,
    Ip(IpAddr),
}

impl RuleTarget {
    pub fn matches(&self, ip: IpAddr) -> bool {
        match self {
            RuleTarget::All => true,
            RuleTarget::Ip(target) => *target == ip,
        }
    }
}

/// One `allow|deny play|publish all|<ip>` line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecurityRule {
    pub action: RuleAction,
    pub method: RuleMethod,
    pub target: RuleTarget,
}

impl SecurityRule {
    pub fn allow(method: RuleMethod, target: RuleTarget) -> Self {
        Self {
            action: RuleAction::Allow,
            method,
            target,
        }
    }

    pub fn deny(method: RuleMethod, target: RuleTarget) -> Self {
        Self {
            action: RuleAction::Deny,
            method,
            target,
        }
    }
}

/// Vhost access rules
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityConfig {
    pub enabled: bool,
    pub rules: Vec<SecurityRule>,
}

impl SecurityConfig {
    pub fn with_rules(rules: impl IntoIterator<Item = SecurityRule>) -> Self {
        Self {
            enabled: true,
            rules: rules.into_iter().collect(),
        }
    }
}
