//! Publish ingest
//!
//! Exclusivity is first-writer-wins: a second publisher is refused at once
//! and the holder is left alone. The ingest loop drains the receive queue,
//! forwards media and metadata into the source and enforces two deadlines:
//! the first media message must arrive within `publish_1stpkt_timeout` of
//! loop entry, and later gaps between media messages may not exceed
//! `publish_normal_timeout`. Deadlines are recomputed from the live settings
//! on every iteration, and a reloaded `tcp_nodelay` is re-applied to the
//! socket before the next message is taken.

use tokio::time::{sleep_until, Instant};

use super::recv::RecvQueue;
use crate::error::{AuthError, Error, Result, TimeoutKind};
use crate::protocol::{Command, Message, Transport};
use crate::registry::Source;
use crate::session::ConnectionSettings;

/// Take publish rights on `source`
pub async fn acquire_publish(source: &dyn Source, conn_id: u64) -> Result<()> {
    if source.acquire_publisher(conn_id).await {
        Ok(())
    } else {
        tracing::warn!(session_id = conn_id, stream = %source.key(), "Stream already published");
        Err(Error::PublishConflict(source.key().clone()))
    }
}

/// Give publish rights back; safe to call when not held
pub async fn release_publish(source: &dyn Source, conn_id: u64) {
    source.release_publisher(conn_id).await;
}

/// Counters for a finished ingest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishStats {
    /// Media messages forwarded
    pub media_messages: u64,
    /// Frames pushed into the source, metadata included
    pub frames: u64,
}

/// Ingest loop
///
/// Returns normally when the publisher unpublishes; every other way out is
/// an error.
pub async fn do_publishing<T: Transport>(
    transport: &T,
    queue: &mut RecvQueue,
    source: &dyn Source,
    settings: &ConnectionSettings,
    stats: &mut PublishStats,
    session_id: u64,
) -> Result<()> {
    let started = Instant::now();
    let mut last_media: Option<Instant> = None;

    loop {
        if settings.is_vhost_removed() {
            return Err(AuthError::VhostRemoved(settings.vhost().to_string()).into());
        }
        if let Some(nodelay) = settings.take_nodelay_change() {
            tracing::debug!(session_id = session_id, nodelay = nodelay, "Re-applying TCP_NODELAY");
            transport.set_nodelay(nodelay)?;
        }

        let timeouts = settings.publish_timeouts();
        let (deadline, kind) = match last_media {
            None => (started + timeouts.first_packet, TimeoutKind::FirstPacket),
            Some(at) => (at + timeouts.normal, TimeoutKind::Steady),
        };

        let msg = tokio::select! {
            msg = queue.recv() => msg,
            _ = settings.vhost_removed() => {
                return Err(AuthError::VhostRemoved(settings.vhost().to_string()).into());
            }
            _ = sleep_until(deadline) => {
                tracing::warn!(
                    session_id = session_id,
                    stream = %source.key(),
                    kind = %kind,
                    "Publish timeout"
                );
                return Err(Error::Timeout(kind));
            }
        };

        let msg = match msg {
            Some(msg) => msg?,
            None => return Err(Error::ConnectionClosed),
        };

        match msg {
            msg if msg.is_media() => {
                last_media = Some(Instant::now());
                stats.media_messages += 1;
                for frame in msg.into_frames()? {
                    source.on_frame(frame).await;
                    stats.frames += 1;
                }
            }
            msg if msg.is_metadata() => {
                tracing::debug!(session_id = session_id, stream = %source.key(), "Metadata updated");
                for frame in msg.into_frames()? {
                    source.on_frame(frame).await;
                    stats.frames += 1;
                }
            }
            Message::Command(Command::FcUnpublish | Command::CloseStream | Command::DeleteStream) => {
                tracing::info!(session_id = session_id, stream = %source.key(), "Publisher unpublished");
                return Ok(());
            }
            other => {
                tracing::trace!(session_id = session_id, message = ?other, "Ignoring message while publishing");
            }
        }
    }
}
