//! Registry configuration

use std::time::Duration;

/// Configuration for the in-memory stream registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Capacity of each stream's broadcast channel
    pub broadcast_capacity: usize,

    /// Cache the last GOP for late joiners
    pub gop_cache: bool,

    /// Maximum GOP cache size in bytes
    pub max_gop_size: usize,

    /// How long a stream survives its publisher while players are attached
    pub publisher_grace_period: Duration,

    /// How long an idle stream is kept before removal
    pub idle_stream_timeout: Duration,

    /// Interval of the cleanup task
    pub cleanup_interval: Duration,

    /// Frames a consumer may fall behind before it skips to the next keyframe
    pub lag_threshold: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 1024,
            gop_cache: true,
            max_gop_size: 4 * 1024 * 1024,
            publisher_grace_period: Duration::from_secs(10),
            idle_stream_timeout: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(5),
            lag_threshold: 16,
        }
    }
}

impl RegistryConfig {
    pub fn broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity.max(1);
        self
    }

    pub fn disable_gop_cache(mut self) -> Self {
        self.gop_cache = false;
        self
    }

    pub fn max_gop_size(mut self, size: usize) -> Self {
        self.max_gop_size = size;
        self
    }

    pub fn publisher_grace_period(mut self, period: Duration) -> Self {
        self.publisher_grace_period = period;
        self
    }

    pub fn idle_stream_timeout(mut self, timeout: Duration) -> Self {
        self.idle_stream_timeout = timeout;
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn lag_threshold(mut self, frames: u64) -> Self {
        self.lag_threshold = frames;
        self
    }
}
