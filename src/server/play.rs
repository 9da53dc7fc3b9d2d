//! Play delivery with merged writes
//!
//! Frames pulled from the consumer are collected into a batch and written
//! with a single flush. How long a batch may grow is decided once per cycle
//! from a snapshot of the live settings:
//!
//! - merged write disabled, or a minimum send interval set: one frame per write
//! - realtime: write whatever is queued as soon as a frame arrives
//! - otherwise: wait for [`MIN_MERGED_MESSAGES`] frames or `mw_sleep`,
//!   whichever comes first, then take whatever else is queued
//!
//! Sequence headers and metadata flush the batch immediately. A batch never
//! exceeds [`MAX_MERGED_MESSAGES`]. A reload changes the next cycle; the
//! batch being built keeps the snapshot it started with.

use std::time::Duration;

use tokio::time::{sleep, sleep_until, Instant};

use super::recv::RecvQueue;
use crate::error::{AuthError, Error, Result};
use crate::protocol::{Command, Message, Transport};
use crate::registry::{Consumer, Frame};
use crate::session::{ConnectionSettings, Pacing};
use crate::stats::Kbps;

/// Largest batch written in one flush
pub const MAX_MERGED_MESSAGES: usize = 128;

/// Frames to wait for before flushing when not realtime
pub const MIN_MERGED_MESSAGES: usize = 8;

/// Tracks played time against a requested duration
#[derive(Debug)]
struct DurationLimit {
    limit: Duration,
    played_ms: u64,
    last_ts: Option<u32>,
}

impl DurationLimit {
    fn new(limit: Duration) -> Self {
        Self {
            limit,
            played_ms: 0,
            last_ts: None,
        }
    }

    /// Account one outgoing frame; timestamp jumps backwards restart the base
    fn account(&mut self, timestamp: u32) {
        match self.last_ts {
            Some(last) if last <= timestamp => self.played_ms += u64::from(timestamp - last),
            _ => {}
        }
        self.last_ts = Some(timestamp);
    }

    fn reached(&self) -> bool {
        Duration::from_millis(self.played_ms) >= self.limit
    }
}

/// How the play loop ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayEnd {
    /// The player sent closeStream or deleteStream
    Closed,
    /// The requested duration was delivered
    DurationReached,
    /// The source went away
    SourceGone,
}

/// Play loop state for one connection
pub struct Player<'a, T: Transport> {
    transport: &'a T,
    settings: &'a ConnectionSettings,
    kbps: &'a Kbps,
    stream_id: u32,
    session_id: u64,
    duration: Option<DurationLimit>,
    batch: Vec<Message>,
    paused: bool,
}

impl<'a, T: Transport> Player<'a, T> {
    pub fn new(
        transport: &'a T,
        settings: &'a ConnectionSettings,
        kbps: &'a Kbps,
        stream_id: u32,
        session_id: u64,
    ) -> Self {
        Self {
            transport,
            settings,
            kbps,
            stream_id,
            session_id,
            duration: None,
            batch: Vec::with_capacity(MAX_MERGED_MESSAGES),
            paused: false,
        }
    }

    /// Stop once `limit` of media time has been delivered
    pub fn with_duration(mut self, limit: Option<Duration>) -> Self {
        self.duration = limit.filter(|d| !d.is_zero()).map(DurationLimit::new);
        self
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Deliver frames until the player leaves or something fails
    pub async fn run(
        &mut self,
        consumer: &mut dyn Consumer,
        queue: &mut RecvQueue,
    ) -> Result<PlayEnd> {
        self.transport
            .set_send_buffer_hint(self.settings.pacing().mw_sleep);

        let mut pacing = self.settings.pacing();
        let mut flush_at: Option<Instant> = None;

        loop {
            if self.batch.is_empty() {
                self.on_cycle_start()?;
                pacing = self.settings.pacing();
                flush_at = None;
            }

            let want_frames = !self.paused && self.batch.len() < MAX_MERGED_MESSAGES;
            let may_flush = !self.paused && !self.batch.is_empty();
            let deadline = flush_at.unwrap_or_else(Instant::now);

            tokio::select! {
                biased;

                _ = self.settings.vhost_removed() => {
                    return Err(AuthError::VhostRemoved(self.settings.vhost().to_string()).into());
                }

                msg = queue.recv() => {
                    let msg = match msg {
                        Some(msg) => msg?,
                        None => return Err(Error::ConnectionClosed),
                    };
                    if let Some(end) = self.on_control(msg, consumer).await? {
                        return Ok(end);
                    }
                }

                _ = sleep_until(deadline), if may_flush => {
                    if let Some(end) = self.flush(pacing).await? {
                        return Ok(end);
                    }
                }

                frame = consumer.recv(), if want_frames => {
                    let Some(frame) = frame else {
                        tracing::info!(session_id = self.session_id, "Source ended");
                        self.flush(pacing).await?;
                        return Ok(PlayEnd::SourceGone);
                    };

                    let must_flush = frame.must_flush();
                    self.push(&frame);
                    if self.batch.len() == 1 {
                        flush_at = Some(Instant::now() + pacing.mw_sleep);
                    }

                    if self.batch_ready(pacing, must_flush, consumer) {
                        if let Some(end) = self.flush(pacing).await? {
                            return Ok(end);
                        }
                    }
                }
            }
        }
    }

    /// Decision point between two batches
    fn on_cycle_start(&self) -> Result<()> {
        if self.settings.is_vhost_removed() {
            return Err(AuthError::VhostRemoved(self.settings.vhost().to_string()).into());
        }
        if let Some(nodelay) = self.settings.take_nodelay_change() {
            tracing::debug!(session_id = self.session_id, nodelay = nodelay, "Re-applying TCP_NODELAY");
            self.transport.set_nodelay(nodelay)?;
        }
        if let Some(mw_sleep) = self.settings.take_mw_sleep_change() {
            tracing::debug!(
                session_id = self.session_id,
                mw_sleep_ms = mw_sleep.as_millis() as u64,
                "Merged-write interval changed"
            );
            self.transport.set_send_buffer_hint(mw_sleep);
        }
        Ok(())
    }

    fn push(&mut self, frame: &Frame) {
        if let Some(limit) = &mut self.duration {
            limit.account(frame.timestamp);
        }
        self.batch.push(Message::from_frame(frame));
    }

    /// Whether the batch should be written now, topping it up from the
    /// consumer when the cycle allows it
    fn batch_ready(&mut self, pacing: Pacing, must_flush: bool, consumer: &mut dyn Consumer) -> bool {
        if !pacing.mw_enabled || !pacing.send_min_interval.is_zero() {
            return true;
        }
        if must_flush || self.batch.len() >= MAX_MERGED_MESSAGES {
            return true;
        }
        if pacing.realtime || self.batch.len() >= MIN_MERGED_MESSAGES {
            self.drain_queued(consumer);
            return true;
        }
        false
    }

    fn drain_queued(&mut self, consumer: &mut dyn Consumer) {
        while self.batch.len() < MAX_MERGED_MESSAGES {
            let Some(frame) = consumer.try_recv() else {
                break;
            };
            self.push(&frame);
        }
    }

    /// Write the batch with one flush
    async fn flush(&mut self, pacing: Pacing) -> Result<Option<PlayEnd>> {
        if self.batch.is_empty() {
            return Ok(None);
        }

        let bytes: usize = self.batch.iter().map(Message::payload_len).sum();
        self.transport
            .write_messages(self.stream_id, &self.batch)
            .await?;
        self.kbps.add_out(bytes, self.batch.len());

        tracing::trace!(
            session_id = self.session_id,
            messages = self.batch.len(),
            bytes = bytes,
            "Batch written"
        );
        self.batch.clear();

        if self.duration.as_ref().is_some_and(DurationLimit::reached) {
            tracing::info!(session_id = self.session_id, "Requested play duration reached");
            return Ok(Some(PlayEnd::DurationReached));
        }

        if !pacing.send_min_interval.is_zero() {
            sleep(pacing.send_min_interval).await;
        }
        Ok(None)
    }

    async fn on_control(
        &mut self,
        msg: Message,
        consumer: &mut dyn Consumer,
    ) -> Result<Option<PlayEnd>> {
        match msg {
            Message::Command(Command::Pause { is_pause, time_ms }) => {
                if self.paused != is_pause {
                    tracing::info!(
                        session_id = self.session_id,
                        paused = is_pause,
                        time_ms = time_ms,
                        "Play pause toggled"
                    );
                    self.paused = is_pause;
                    consumer.on_pause(is_pause).await;
                }
                Ok(None)
            }
            Message::Command(Command::CloseStream | Command::DeleteStream) => {
                tracing::info!(session_id = self.session_id, "Player closed the stream");
                Ok(Some(PlayEnd::Closed))
            }
            other => {
                tracing::trace!(session_id = self.session_id, message = ?other, "Ignoring message while playing");
                Ok(None)
            }
        }
    }
}
