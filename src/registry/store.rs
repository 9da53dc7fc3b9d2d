//! In-memory stream registry
//!
//! The central registry that owns every live source in the process and
//! routes media from the single publisher of a stream to its players.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;

use super::config::RegistryConfig;
use super::entry::{StreamEntry, StreamState, StreamStats};
use super::error::RegistryError;
use super::frame::{Frame, FrameType, StreamKey};
use super::source::{Consumer, Source, SourceRegistry};

/// Central registry for all active streams
///
/// Thread-safe via `RwLock`. Lookups take the map's read lock; only creation
/// and cleanup take the write lock.
pub struct StreamRegistry {
    streams: RwLock<HashMap<StreamKey, Arc<MemorySource>>>,
    config: Arc<RegistryConfig>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Find or create the concrete source for `key`
    pub async fn source(&self, key: &StreamKey) -> Arc<MemorySource> {
        if let Some(source) = self.streams.read().await.get(key) {
            return Arc::clone(source);
        }

        let mut streams = self.streams.write().await;
        let source = streams.entry(key.clone()).or_insert_with(|| {
            tracing::debug!(stream = %key, "Source created");
            MemorySource::new(key.clone(), Arc::clone(&self.config))
        });
        Arc::clone(source)
    }

    /// Check if a stream exists and has an active publisher
    pub async fn has_active_stream(&self, key: &StreamKey) -> bool {
        let Some(source) = self.get(key).await else {
            return false;
        };
        let entry = source.entry.read().await;
        entry.state == StreamState::Active && entry.has_publisher()
    }

    pub async fn stream_stats(&self, key: &StreamKey) -> Option<StreamStats> {
        let source = self.get(key).await?;
        let stats = source.entry.read().await.stats();
        Some(stats)
    }

    pub async fn stream_count(&self) -> usize {
        self.streams.read().await.len()
    }

    async fn get(&self, key: &StreamKey) -> Option<Arc<MemorySource>> {
        self.streams.read().await.get(key).cloned()
    }

    /// Run the cleanup pass once
    ///
    /// Removes streams that have:
    /// - been in grace period longer than `publisher_grace_period`
    /// - been idle with no players longer than `idle_stream_timeout`
    ///
    /// Players of a removed stream see the end of their consumer.
    pub async fn cleanup(&self) {
        let mut streams = self.streams.write().await;
        let now = Instant::now();
        let mut removed = Vec::new();

        for (key, source) in streams.iter() {
            let Ok(entry) = source.entry.try_read() else {
                continue;
            };
            let since = entry.publisher_left_at.unwrap_or(entry.created_at);
            let expired = match entry.state {
                StreamState::GracePeriod => {
                    now.duration_since(since) > self.config.publisher_grace_period
                }
                StreamState::Idle => {
                    entry.subscriber_count() == 0
                        && now.duration_since(since) > self.config.idle_stream_timeout
                }
                StreamState::Active => false,
            };
            if expired {
                removed.push(key.clone());
            }
        }

        for key in removed {
            if let Some(source) = streams.remove(&key) {
                source.removed.store(true, Ordering::Release);
                source.entry.write().await.close();
                tracing::info!(stream = %key, "Stream removed by cleanup");
            }
        }
    }

    /// Spawn the background cleanup task
    ///
    /// Returns a handle that can be used to abort the task.
    pub fn spawn_cleanup_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        let interval = registry.config.cleanup_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                registry.cleanup().await;
            }
        })
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceRegistry for StreamRegistry {
    async fn lookup_or_create(&self, key: &StreamKey) -> Result<Arc<dyn Source>, RegistryError> {
        let source: Arc<dyn Source> = self.source(key).await;
        Ok(source)
    }
}

/// A stream held by [`StreamRegistry`]
pub struct MemorySource {
    key: StreamKey,
    entry: RwLock<StreamEntry>,
    config: Arc<RegistryConfig>,
    removed: AtomicBool,
    /// Handed to consumers so a resume can fetch fresh sequence headers
    this: Weak<MemorySource>,
}

impl MemorySource {
    fn new(key: StreamKey, config: Arc<RegistryConfig>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            key,
            entry: RwLock::new(StreamEntry::new(&config)),
            config,
            removed: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    pub async fn stats(&self) -> StreamStats {
        self.entry.read().await.stats()
    }

    pub async fn publisher(&self) -> Option<u64> {
        self.entry.read().await.publisher_id
    }
}

#[async_trait]
impl Source for MemorySource {
    fn key(&self) -> &StreamKey {
        &self.key
    }

    async fn acquire_publisher(&self, conn_id: u64) -> bool {
        if self.removed.load(Ordering::Acquire) {
            return false;
        }

        let mut entry = self.entry.write().await;
        match entry.publisher_id {
            Some(holder) if holder == conn_id => true,
            Some(holder) => {
                tracing::debug!(
                    stream = %self.key,
                    session_id = conn_id,
                    holder = holder,
                    "Publish rejected, stream already published"
                );
                false
            }
            None => {
                entry.publisher_id = Some(conn_id);
                entry.publisher_left_at = None;
                entry.state = StreamState::Active;
                if let Some(gop) = &mut entry.gop {
                    gop.clear();
                }

                tracing::info!(
                    stream = %self.key,
                    session_id = conn_id,
                    subscribers = entry.subscriber_count(),
                    "Publisher registered"
                );
                true
            }
        }
    }

    async fn release_publisher(&self, conn_id: u64) {
        let mut entry = self.entry.write().await;

        if entry.publisher_id != Some(conn_id) {
            tracing::trace!(
                stream = %self.key,
                session_id = conn_id,
                holder = ?entry.publisher_id,
                "Release ignored, not the publisher"
            );
            return;
        }

        entry.publisher_id = None;
        entry.publisher_left_at = Some(Instant::now());

        if entry.subscriber_count() > 0 {
            entry.state = StreamState::GracePeriod;
            tracing::info!(
                stream = %self.key,
                session_id = conn_id,
                subscribers = entry.subscriber_count(),
                grace_period_secs = self.config.publisher_grace_period.as_secs(),
                "Publisher left, entering grace period"
            );
        } else {
            entry.state = StreamState::Idle;
            tracing::info!(
                stream = %self.key,
                session_id = conn_id,
                "Publisher left, no subscribers"
            );
        }
    }

    async fn new_consumer(&self) -> Result<Box<dyn Consumer>, RegistryError> {
        if self.removed.load(Ordering::Acquire) {
            return Err(RegistryError::StreamRemoved(self.key.clone()));
        }

        let entry = self.entry.read().await;
        let rx = entry.subscribe();
        let catchup: VecDeque<Frame> = entry.catchup_frames().into();
        let subscribers = Arc::clone(&entry.subscribers);
        let count = subscribers.fetch_add(1, Ordering::AcqRel) + 1;

        tracing::info!(
            stream = %self.key,
            subscribers = count,
            catchup_frames = catchup.len(),
            "Consumer added"
        );

        Ok(Box::new(MemoryConsumer {
            key: self.key.clone(),
            rx,
            seen_video: catchup.iter().any(|f| f.frame_type == FrameType::Video),
            catchup,
            subscribers,
            source: self.this.clone(),
            lag_threshold: self.config.lag_threshold,
            skipping: false,
            paused: false,
        }))
    }

    async fn on_frame(&self, frame: Frame) {
        let mut entry = self.entry.write().await;
        entry.update_caches(&frame);
        entry.send(frame);
    }
}

/// Consumer handed out by [`MemorySource`]
pub struct MemoryConsumer {
    key: StreamKey,
    rx: broadcast::Receiver<Frame>,
    catchup: VecDeque<Frame>,
    subscribers: Arc<AtomicU32>,
    source: Weak<MemorySource>,
    lag_threshold: u64,
    /// Dropping video until the next keyframe
    skipping: bool,
    seen_video: bool,
    paused: bool,
}

impl MemoryConsumer {
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    fn accept(&mut self, frame: &Frame) -> bool {
        if frame.frame_type == FrameType::Video {
            self.seen_video = true;
        }
        if !self.skipping || frame.must_flush() {
            return true;
        }
        match frame.frame_type {
            FrameType::Video if frame.is_keyframe => {
                self.skipping = false;
                true
            }
            FrameType::Video => false,
            // Audio-only streams have no keyframe to wait for
            _ => !self.seen_video,
        }
    }

    fn on_lag(&mut self, skipped: u64) {
        if skipped < self.lag_threshold {
            tracing::debug!(stream = %self.key, skipped = skipped, "Minor consumer lag, continuing");
            return;
        }
        if !self.skipping {
            tracing::warn!(
                stream = %self.key,
                skipped = skipped,
                "Consumer lagging, skipping to next keyframe"
            );
        }
        self.skipping = true;
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn recv(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.catchup.pop_front() {
                return Some(frame);
            }
            match self.rx.recv().await {
                Ok(frame) => {
                    if self.accept(&frame) {
                        return Some(frame);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => self.on_lag(n),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn try_recv(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.catchup.pop_front() {
                return Some(frame);
            }
            match self.rx.try_recv() {
                Ok(frame) => {
                    if self.accept(&frame) {
                        return Some(frame);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => self.on_lag(n),
                Err(_) => return None,
            }
        }
    }

    async fn on_pause(&mut self, paused: bool) {
        if self.paused == paused {
            return;
        }
        self.paused = paused;

        if paused {
            tracing::debug!(stream = %self.key, "Consumer paused");
            return;
        }

        // Decoders need the headers again after a gap
        if let Some(source) = self.source.upgrade() {
            let headers = source.entry.read().await.sequence_headers();
            tracing::debug!(stream = %self.key, headers = headers.len(), "Consumer resumed");
            self.catchup.extend(headers);
        }
        self.skipping = self.seen_video;
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        let prev = self.subscribers.fetch_sub(1, Ordering::AcqRel);
        tracing::debug!(
            stream = %self.key,
            subscribers = prev.saturating_sub(1),
            "Consumer released"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;

    fn key() -> StreamKey {
        StreamKey::new("__defaultVhost__", "live", "test_stream")
    }

    fn keyframe(ts: u32) -> Frame {
        Frame::video_from_flv(ts, Bytes::from_static(&[0x17, 0x01]))
    }

    fn interframe(ts: u32) -> Frame {
        Frame::video_from_flv(ts, Bytes::from_static(&[0x27, 0x01]))
    }

    #[tokio::test]
    async fn test_publish_exclusivity() {
        let registry = StreamRegistry::new();
        let source = registry.lookup_or_create(&key()).await.unwrap();

        assert!(source.acquire_publisher(1).await);
        assert!(registry.has_active_stream(&key()).await);

        // Second publisher loses, first one is unaffected
        assert!(!source.acquire_publisher(2).await);
        let same = registry.source(&key()).await;
        assert_eq!(same.publisher().await, Some(1));

        // Re-acquire by the holder is fine
        assert!(source.acquire_publisher(1).await);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let registry = StreamRegistry::new();
        let source = registry.lookup_or_create(&key()).await.unwrap();

        source.release_publisher(1).await;
        assert!(source.acquire_publisher(1).await);

        // Someone else releasing does nothing
        source.release_publisher(2).await;
        assert!(registry.has_active_stream(&key()).await);

        source.release_publisher(1).await;
        source.release_publisher(1).await;
        assert!(!registry.has_active_stream(&key()).await);
        assert!(source.acquire_publisher(2).await);
    }

    #[tokio::test]
    async fn test_consumer_receives_and_releases() {
        let registry = StreamRegistry::new();
        let source = registry.lookup_or_create(&key()).await.unwrap();
        source.acquire_publisher(1).await;

        let mut consumer = source.new_consumer().await.unwrap();
        assert!(consumer.try_recv().is_none());

        source.on_frame(keyframe(0)).await;
        let received = consumer.recv().await.unwrap();
        assert_eq!(received.timestamp, 0);
        assert!(received.is_keyframe);

        assert_eq!(registry.stream_stats(&key()).await.unwrap().subscriber_count, 1);
        drop(consumer);
        assert_eq!(registry.stream_stats(&key()).await.unwrap().subscriber_count, 0);
    }

    #[tokio::test]
    async fn test_grace_period_and_reconnect() {
        let registry = StreamRegistry::new();
        let source = registry.lookup_or_create(&key()).await.unwrap();

        source.acquire_publisher(1).await;
        let _consumer = source.new_consumer().await.unwrap();
        source.release_publisher(1).await;

        let stats = registry.stream_stats(&key()).await.unwrap();
        assert_eq!(stats.state, StreamState::GracePeriod);

        // New publisher takes over, player still attached
        assert!(source.acquire_publisher(2).await);
        let stats = registry.stream_stats(&key()).await.unwrap();
        assert!(stats.has_publisher);
        assert_eq!(stats.state, StreamState::Active);
        assert_eq!(stats.subscriber_count, 1);
    }

    #[tokio::test]
    async fn test_catchup_frames() {
        let registry = StreamRegistry::new();
        let source = registry.lookup_or_create(&key()).await.unwrap();
        source.acquire_publisher(1).await;

        source
            .on_frame(Frame::video_from_flv(0, Bytes::from_static(&[0x17, 0x00])))
            .await;
        source
            .on_frame(Frame::audio_from_flv(0, Bytes::from_static(&[0xAF, 0x00])))
            .await;
        source.on_frame(keyframe(33)).await;

        // Late joiner
        let mut consumer = source.new_consumer().await.unwrap();
        let catchup: Vec<Frame> = std::iter::from_fn(|| consumer.try_recv()).collect();

        assert_eq!(catchup.len(), 3);
        assert!(catchup[0].is_header);
        assert!(catchup[1].is_header);
        assert!(catchup[2].is_keyframe);
    }

    #[tokio::test]
    async fn test_lagging_consumer_skips_to_keyframe() {
        let config = RegistryConfig::default().broadcast_capacity(4).lag_threshold(1);
        let registry = StreamRegistry::with_config(config);
        let source = registry.lookup_or_create(&key()).await.unwrap();
        source.acquire_publisher(1).await;

        let mut consumer = source.new_consumer().await.unwrap();
        source.on_frame(keyframe(0)).await;
        for ts in 1..=8 {
            source.on_frame(interframe(ts * 40)).await;
        }
        source.on_frame(keyframe(400)).await;
        source.on_frame(interframe(440)).await;

        let first = consumer.recv().await.unwrap();
        assert!(first.is_keyframe);
        assert_eq!(first.timestamp, 400);
        assert_eq!(consumer.recv().await.unwrap().timestamp, 440);
    }

    #[tokio::test]
    async fn test_resume_reinjects_sequence_headers() {
        let registry = StreamRegistry::new();
        let source = registry.lookup_or_create(&key()).await.unwrap();
        source.acquire_publisher(1).await;
        source
            .on_frame(Frame::video_from_flv(0, Bytes::from_static(&[0x17, 0x00])))
            .await;

        let mut consumer = source.new_consumer().await.unwrap();
        assert!(consumer.try_recv().unwrap().is_header);

        consumer.on_pause(true).await;
        source.on_frame(interframe(40)).await;
        consumer.on_pause(false).await;
        source.on_frame(keyframe(80)).await;

        assert!(consumer.recv().await.unwrap().is_header);
        // The interframe sent while paused is skipped
        assert_eq!(consumer.recv().await.unwrap().timestamp, 80);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_closes_consumers() {
        let config =
            RegistryConfig::default().publisher_grace_period(Duration::from_millis(100));
        let registry = StreamRegistry::with_config(config);
        let source = registry.lookup_or_create(&key()).await.unwrap();

        source.acquire_publisher(1).await;
        let mut consumer = source.new_consumer().await.unwrap();
        source.release_publisher(1).await;

        registry.cleanup().await;
        assert_eq!(registry.stream_count().await, 1);

        tokio::time::advance(Duration::from_millis(150)).await;
        registry.cleanup().await;
        assert_eq!(registry.stream_count().await, 0);
        assert!(consumer.recv().await.is_none());
        assert!(source.new_consumer().await.is_err());
    }

    #[tokio::test]
    async fn test_idle_stream_with_player_is_kept() {
        let config = RegistryConfig::default().idle_stream_timeout(Duration::ZERO);
        let registry = StreamRegistry::with_config(config);
        let source = registry.lookup_or_create(&key()).await.unwrap();

        let _waiting = source.new_consumer().await.unwrap();
        registry.cleanup().await;
        assert_eq!(registry.stream_count().await, 1);
    }
}
