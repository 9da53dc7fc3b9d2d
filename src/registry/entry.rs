//! Per-stream state held by the in-memory registry

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::time::Instant;

use super::config::RegistryConfig;
use super::frame::{Frame, FrameType};
use super::gop::GopCache;

/// State of a stream entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Stream has an active publisher
    Active,
    /// Publisher left while players were attached
    GracePeriod,
    /// No publisher
    Idle,
}

/// Entry for a single stream
pub struct StreamEntry {
    /// Frames since the last keyframe, for late joiners
    pub gop: Option<GopCache>,

    pub video_header: Option<Frame>,
    pub audio_header: Option<Frame>,
    pub metadata: Option<Frame>,

    /// Connection currently holding publish rights
    pub publisher_id: Option<u64>,

    pub(super) tx: broadcast::Sender<Frame>,

    /// Live consumers; shared with each consumer so it can decrement on drop
    pub(super) subscribers: Arc<AtomicU32>,

    /// When the publisher left
    pub publisher_left_at: Option<Instant>,

    pub created_at: Instant,

    pub state: StreamState,
}

impl StreamEntry {
    pub(super) fn new(config: &RegistryConfig) -> Self {
        let (tx, _) = broadcast::channel(config.broadcast_capacity);

        Self {
            gop: config
                .gop_cache
                .then(|| GopCache::with_max_size(config.max_gop_size)),
            video_header: None,
            audio_header: None,
            metadata: None,
            publisher_id: None,
            tx,
            subscribers: Arc::new(AtomicU32::new(0)),
            publisher_left_at: None,
            created_at: Instant::now(),
            state: StreamState::Idle,
        }
    }

    pub fn subscriber_count(&self) -> u32 {
        self.subscribers.load(Ordering::Acquire)
    }

    pub fn has_publisher(&self) -> bool {
        self.publisher_id.is_some()
    }

    /// Sequence headers only, used when a paused player resumes
    pub fn sequence_headers(&self) -> Vec<Frame> {
        self.video_header
            .iter()
            .chain(self.audio_header.iter())
            .cloned()
            .collect()
    }

    /// Everything a new consumer needs before live frames
    ///
    /// Metadata, then sequence headers, then the cached GOP.
    pub fn catchup_frames(&self) -> Vec<Frame> {
        let mut frames: Vec<Frame> = self.metadata.iter().cloned().collect();
        frames.extend(self.sequence_headers());
        if let Some(gop) = &self.gop {
            frames.extend(gop.frames().cloned());
        }
        frames
    }

    pub(super) fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.tx.subscribe()
    }

    /// Fan a frame out; returns how many receivers got it
    pub(super) fn send(&self, frame: Frame) -> usize {
        self.tx.send(frame).unwrap_or(0)
    }

    /// Drop the sender so every consumer sees the end of the stream
    pub(super) fn close(&mut self) {
        let (tx, _) = broadcast::channel(1);
        self.tx = tx;
        self.publisher_id = None;
        self.state = StreamState::Idle;
    }

    pub(super) fn update_caches(&mut self, frame: &Frame) {
        match frame.frame_type {
            FrameType::Video if frame.is_header => self.video_header = Some(frame.clone()),
            FrameType::Audio if frame.is_header => self.audio_header = Some(frame.clone()),
            FrameType::Metadata => self.metadata = Some(frame.clone()),
            _ => {
                if let Some(gop) = &mut self.gop {
                    gop.push(frame);
                }
            }
        }
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            subscriber_count: self.subscriber_count(),
            has_publisher: self.has_publisher(),
            state: self.state,
            gop_frame_count: self.gop.as_ref().map_or(0, GopCache::frame_count),
            gop_size_bytes: self.gop.as_ref().map_or(0, GopCache::size),
        }
    }
}

/// Statistics for a stream
#[derive(Debug, Clone)]
pub struct StreamStats {
    pub subscriber_count: u32,
    pub has_publisher: bool,
    pub state: StreamState,
    /// Number of frames in the GOP cache
    pub gop_frame_count: usize,
    /// Size of the GOP cache in bytes
    pub gop_size_bytes: usize,
}
