//! Bandwidth accounting for a connection

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Cumulative byte counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KbpsSample {
    /// Total bytes received
    pub bytes_in: u64,
    /// Total bytes sent
    pub bytes_out: u64,
}

/// Bitrates over the last sampling window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KbpsRate {
    pub kbps_in: u64,
    pub kbps_out: u64,
}

/// Byte counters shared between a connection's tasks and its owner
#[derive(Debug)]
pub struct Kbps {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    last: Mutex<(Instant, KbpsSample)>,
}

impl Kbps {
    pub fn new() -> Self {
        Self {
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            messages_in: AtomicU64::new(0),
            messages_out: AtomicU64::new(0),
            last: Mutex::new((Instant::now(), KbpsSample::default())),
        }
    }

    pub fn add_in(&self, bytes: usize) {
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_in.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a written batch
    pub fn add_out(&self, bytes: usize, messages: usize) {
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_out
            .fetch_add(messages as u64, Ordering::Relaxed);
    }

    /// Cumulative counters
    pub fn remark(&self) -> KbpsSample {
        KbpsSample {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }

    pub fn messages(&self) -> (u64, u64) {
        (
            self.messages_in.load(Ordering::Relaxed),
            self.messages_out.load(Ordering::Relaxed),
        )
    }

    /// Rates since the previous call
    pub fn sample(&self) -> KbpsRate {
        let now = Instant::now();
        let current = self.remark();
        let mut last = self.last.lock();
        let rate = rate_between(last.1, current, now.duration_since(last.0));
        *last = (now, current);
        rate
    }
}

impl Default for Kbps {
    fn default() -> Self {
        Self::new()
    }
}

fn rate_between(before: KbpsSample, after: KbpsSample, elapsed: Duration) -> KbpsRate {
    let ms = elapsed.as_millis() as u64;
    if ms == 0 {
        return KbpsRate::default();
    }
    // bytes * 8 / ms == kilobits per second
    KbpsRate {
        kbps_in: after.bytes_in.saturating_sub(before.bytes_in) * 8 / ms,
        kbps_out: after.bytes_out.saturating_sub(before.bytes_out) * 8 / ms,
    }
}
