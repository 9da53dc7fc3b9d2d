//! Decoded protocol messages as seen by the connection core
//!
//! The chunk codec lives behind [`Transport`](super::transport::Transport);
//! this module only describes what it hands over and how the core classifies
//! it for the publish and play loops.

use bytes::{Buf, Bytes};

use crate::error::ProtocolError;
use crate::registry::Frame;

/// FLV tag type for audio inside aggregate messages
const TAG_AUDIO: u8 = 8;
/// FLV tag type for video inside aggregate messages
const TAG_VIDEO: u8 = 9;
/// FLV tag type for script data inside aggregate messages
const TAG_SCRIPT: u8 = 18;
/// FLV tag header size
const TAG_HEADER_SIZE: usize = 11;
/// Trailing previous-tag-size field
const PREV_TAG_SIZE: usize = 4;

/// A command the core reacts to
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// NetStream.pause from a player
    Pause { is_pause: bool, time_ms: f64 },
    /// closeStream
    CloseStream,
    /// deleteStream
    DeleteStream,
    /// FCUnpublish from an FMLE-style encoder
    FcUnpublish,
    /// Anything else, by name
    Other(String),
}

/// User control events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserControlEvent {
    StreamBegin(u32),
    StreamEof(u32),
    SetBufferLength { stream_id: u32, buffer_ms: u32 },
    PingRequest(u32),
    PingResponse(u32),
    Other(u16),
}

/// A decoded message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Audio { timestamp: u32, data: Bytes },
    Video { timestamp: u32, data: Bytes },
    /// Aggregate of FLV tags
    Aggregate { timestamp: u32, data: Bytes },
    /// AMF data message (`@setDataFrame`, `onMetaData`, ...)
    Data { name: String, data: Bytes },
    Command(Command),
    UserControl(UserControlEvent),
    /// Protocol control or unknown message types
    Other { type_id: u8, data: Bytes },
}

impl Message {
    /// Audio, video or aggregate
    pub fn is_media(&self) -> bool {
        matches!(
            self,
            Message::Audio { .. } | Message::Video { .. } | Message::Aggregate { .. }
        )
    }

    /// Stream metadata carried as a data message
    pub fn is_metadata(&self) -> bool {
        match self {
            Message::Data { name, .. } => is_metadata_name(name),
            _ => false,
        }
    }

    /// Payload size in bytes, used for bandwidth accounting
    pub fn payload_len(&self) -> usize {
        match self {
            Message::Audio { data, .. }
            | Message::Video { data, .. }
            | Message::Aggregate { data, .. }
            | Message::Data { data, .. }
            | Message::Other { data, .. } => data.len(),
            Message::Command(_) | Message::UserControl(_) => 0,
        }
    }

    /// Convert a media or metadata message into frames for the source
    ///
    /// Aggregates expand into their inner tags; anything else yields nothing.
    pub fn into_frames(self) -> Result<Vec<Frame>, ProtocolError> {
        match self {
            Message::Audio { timestamp, data } => {
                if data.is_empty() {
                    return Ok(Vec::new());
                }
                Ok(vec![Frame::audio_from_flv(timestamp, data)])
            }
            Message::Video { timestamp, data } => {
                if data.is_empty() {
                    return Ok(Vec::new());
                }
                Ok(vec![Frame::video_from_flv(timestamp, data)])
            }
            Message::Aggregate { timestamp, data } => split_aggregate(timestamp, data),
            Message::Data { name, data } if is_metadata_name(&name) => {
                Ok(vec![Frame::metadata(data)])
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Build the outbound message for a frame
    pub fn from_frame(frame: &Frame) -> Self {
        use crate::registry::FrameType;

        match frame.frame_type {
            FrameType::Audio => Message::Audio {
                timestamp: frame.timestamp,
                data: frame.data.clone(),
            },
            FrameType::Video => Message::Video {
                timestamp: frame.timestamp,
                data: frame.data.clone(),
            },
            FrameType::Metadata => Message::Data {
                name: "onMetaData".to_string(),
                data: frame.data.clone(),
            },
        }
    }
}

fn is_metadata_name(name: &str) -> bool {
    name == "@setDataFrame" || name == "onMetaData"
}

/// Split an aggregate message into its FLV tags
///
/// Inner timestamps are rebased so that the first tag lands on the
/// aggregate's own timestamp. Rebased values saturate at both ends of the
/// 32-bit range.
pub fn split_aggregate(timestamp: u32, mut data: Bytes) -> Result<Vec<Frame>, ProtocolError> {
    let mut frames = Vec::new();
    let mut delta: Option<i64> = None;

    while data.has_remaining() {
        if data.remaining() < TAG_HEADER_SIZE {
            return Err(ProtocolError::UnexpectedMessage(
                "truncated aggregate tag header".into(),
            ));
        }

        let tag_type = data.get_u8() & 0x1F;
        let size = read_u24(&mut data) as usize;
        let ts_low = read_u24(&mut data);
        let ts_ext = data.get_u8() as u32;
        let _stream_id = read_u24(&mut data);
        let tag_ts = (ts_ext << 24) | ts_low;

        if data.remaining() < size + PREV_TAG_SIZE {
            return Err(ProtocolError::UnexpectedMessage(
                "truncated aggregate tag body".into(),
            ));
        }

        let body = data.split_to(size);
        data.advance(PREV_TAG_SIZE);

        let delta = *delta.get_or_insert(timestamp as i64 - tag_ts as i64);
        let ts = (tag_ts as i64 + delta).clamp(0, i64::from(u32::MAX)) as u32;

        match tag_type {
            TAG_AUDIO if !body.is_empty() => frames.push(Frame::audio_from_flv(ts, body)),
            TAG_VIDEO if !body.is_empty() => frames.push(Frame::video_from_flv(ts, body)),
            TAG_SCRIPT => frames.push(Frame::metadata(body)),
            _ => {
                tracing::trace!(tag_type = tag_type, "Skipping aggregate sub-tag");
            }
        }
    }

    Ok(frames)
}

fn read_u24(buf: &mut Bytes) -> u32 {
    let b = [buf.get_u8(), buf.get_u8(), buf.get_u8()];
    ((b[0] as u32) << 16) | ((b[1] as u32) << 8) | b[2] as u32
}
