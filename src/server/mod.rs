//! RTMP server: accept loop, per-connection core and live reload

pub mod config;
pub mod connection;
pub mod listener;
pub mod play;
pub mod publish;
pub mod recv;
pub mod reload;

pub use config::{
    AuthOrder, RefererConfig, RuleAction, RuleMethod, RuleTarget, SecurityConfig, SecurityRule,
    ServerConfig, VhostConfig, DEFAULT_VHOST,
};
pub use connection::{Connection, ConnectionHandle, ServerContext};
pub use listener::RtmpServer;
pub use play::{PlayEnd, Player, MAX_MERGED_MESSAGES, MIN_MERGED_MESSAGES};
pub use publish::{acquire_publish, do_publishing, release_publish, PublishStats};
pub use recv::{RecvMode, RecvQueue, RecvTask};
pub use reload::{ConfigStore, ReloadBus, ReloadField, Subscription, VhostReloadEvent};
