//! Statistics for RTMP connections

pub mod metrics;

pub use metrics::{Kbps, KbpsRate, KbpsSample};
