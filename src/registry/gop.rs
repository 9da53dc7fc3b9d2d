//! GOP cache for late joiners
//!
//! A new player needs the most recent keyframe and every frame after it to
//! start decoding without waiting for the next keyframe. Sequence headers and
//! metadata are cached separately by the stream entry.

use std::collections::VecDeque;

use super::frame::{Frame, FrameType};

/// Frames since the last video keyframe
#[derive(Debug)]
pub struct GopCache {
    /// Maximum buffered size in bytes
    max_size: usize,
    /// Current buffered size in bytes
    current_size: usize,
    frames: VecDeque<Frame>,
    /// A keyframe opened the current GOP
    has_keyframe: bool,
}

impl GopCache {
    /// Create a cache with the default max size (4MB)
    pub fn new() -> Self {
        Self::with_max_size(4 * 1024 * 1024)
    }

    /// Create a cache with the given max size
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            max_size,
            current_size: 0,
            frames: VecDeque::new(),
            has_keyframe: false,
        }
    }

    /// Add a media frame
    ///
    /// A keyframe starts a new GOP. Frames before the first keyframe are not
    /// useful to a decoder and are dropped. Returns whether the frame was kept.
    pub fn push(&mut self, frame: &Frame) -> bool {
        if frame.is_header || frame.frame_type == FrameType::Metadata {
            return false;
        }

        if frame.frame_type == FrameType::Video && frame.is_keyframe {
            self.clear();
            self.has_keyframe = true;
        }

        if !self.has_keyframe {
            return false;
        }

        let size = frame.size();
        while self.current_size + size > self.max_size {
            match self.frames.pop_front() {
                Some(old) => self.current_size -= old.size(),
                None => break,
            }
        }

        if self.current_size + size > self.max_size {
            return false;
        }

        self.frames.push_back(frame.clone());
        self.current_size += size;
        true
    }

    /// Drop all cached frames
    pub fn clear(&mut self) {
        self.frames.clear();
        self.current_size = 0;
        self.has_keyframe = false;
    }

    /// Cached frames in arrival order
    pub fn frames(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Buffered size in bytes
    pub fn size(&self) -> usize {
        self.current_size
    }

    /// GOP duration in milliseconds
    pub fn duration(&self) -> Option<u32> {
        let first = self.frames.front()?.timestamp;
        let last = self.frames.back()?.timestamp;
        Some(last.saturating_sub(first))
    }
}

impl Default for GopCache {
    fn default() -> Self {
        Self::new()
    }
}
