//! Stream keys and media frames
//!
//! A [`Frame`] is what publishers push into a source and what consumers
//! hand back to players. It is cheap to clone: the payload is a
//! reference-counted `Bytes`.

use bytes::Bytes;

/// Identifies a media source (vhost + app + stream name)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    /// Virtual host the stream belongs to
    pub vhost: String,
    /// Application name (e.g., "live")
    pub app: String,
    /// Stream name (e.g., "livestream")
    pub name: String,
}

impl StreamKey {
    /// Create a new stream key
    pub fn new(vhost: impl Into<String>, app: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            vhost: vhost.into(),
            app: app.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.vhost, self.app, self.name)
    }
}

/// Type of frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Video,
    Audio,
    /// onMetaData
    Metadata,
}

/// A media frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub frame_type: FrameType,
    /// Timestamp in milliseconds
    pub timestamp: u32,
    /// FLV tag body
    pub data: Bytes,
    /// Whether this is a keyframe (video only)
    pub is_keyframe: bool,
    /// Whether this is a sequence header
    pub is_header: bool,
}

impl Frame {
    /// Create a video frame
    pub fn video(timestamp: u32, data: Bytes, is_keyframe: bool, is_header: bool) -> Self {
        Self {
            frame_type: FrameType::Video,
            timestamp,
            data,
            is_keyframe,
            is_header,
        }
    }

    /// Create an audio frame
    pub fn audio(timestamp: u32, data: Bytes, is_header: bool) -> Self {
        Self {
            frame_type: FrameType::Audio,
            timestamp,
            data,
            is_keyframe: false,
            is_header,
        }
    }

    /// Create a metadata frame
    pub fn metadata(data: Bytes) -> Self {
        Self {
            frame_type: FrameType::Metadata,
            timestamp: 0,
            data,
            is_keyframe: false,
            is_header: false,
        }
    }

    /// Video frame from an FLV video tag body
    ///
    /// Upper nibble 1 is a keyframe; codec 7 (AVC) with packet type 0 is the
    /// sequence header.
    pub fn video_from_flv(timestamp: u32, data: Bytes) -> Self {
        let is_keyframe = !data.is_empty() && (data[0] >> 4) == 1;
        let is_header = data.len() >= 2 && (data[0] & 0x0F) == 7 && data[1] == 0;
        Self::video(timestamp, data, is_keyframe, is_header)
    }

    /// Audio frame from an FLV audio tag body
    ///
    /// Sound format 10 (AAC) with packet type 0 is the sequence header.
    pub fn audio_from_flv(timestamp: u32, data: Bytes) -> Self {
        let is_header = data.len() >= 2 && (data[0] >> 4) == 10 && data[1] == 0;
        Self::audio(timestamp, data, is_header)
    }

    /// Frames a player needs before it can decode anything else
    ///
    /// The merged-write pacer flushes a pending batch as soon as one of
    /// these is queued.
    pub fn must_flush(&self) -> bool {
        self.is_header || self.frame_type == FrameType::Metadata
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}
