//! Decoupled receive tasks
//!
//! While a publish or play loop is busy writing to the source or the socket,
//! a receive task keeps reading from the transport and queues what it reads
//! in arrival order. The task never closes the connection; a read error is
//! queued like any message and the owning loop decides what happens next.
//!
//! Dropping a [`RecvTask`] stops it.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::protocol::{Message, Transport};
use crate::stats::Kbps;

/// Queue end handed to the owning loop
pub type RecvQueue = mpsc::Receiver<Result<Message>>;

/// What the owning loop wants to see
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvMode {
    /// Every message
    Publish,
    /// Control traffic only; media sent by a player is dropped
    Play,
}

/// Handle to a running receive task
pub struct RecvTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl RecvTask {
    /// Start reading from `transport`
    ///
    /// `parent` is the connection's token; disposing the connection stops
    /// the task as well.
    pub fn spawn<T: Transport>(
        transport: Arc<T>,
        mode: RecvMode,
        kbps: Arc<Kbps>,
        capacity: usize,
        parent: &CancellationToken,
        session_id: u64,
    ) -> (Self, RecvQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let token = parent.child_token();
        let task_token = token.clone();

        let handle = tokio::spawn(async move {
            tracing::trace!(session_id = session_id, mode = ?mode, "Receive task started");

            loop {
                let result = tokio::select! {
                    _ = task_token.cancelled() => break,
                    result = transport.read_message() => result,
                };

                let item = match result {
                    Ok(msg) => {
                        kbps.add_in(msg.payload_len());
                        if mode == RecvMode::Play && msg.is_media() {
                            tracing::trace!(session_id = session_id, "Dropping media sent by player");
                            continue;
                        }
                        Ok(msg)
                    }
                    Err(e) => Err(e),
                };
                let failed = item.is_err();

                let sent = tokio::select! {
                    _ = task_token.cancelled() => break,
                    sent = tx.send(item) => sent,
                };
                if sent.is_err() || failed {
                    break;
                }
            }

            tracing::trace!(session_id = session_id, "Receive task stopped");
        });

        (Self { token, handle }, rx)
    }
}

impl Drop for RecvTask {
    fn drop(&mut self) {
        self.token.cancel();
        self.handle.abort();
    }
}
