//! Media source seams
//!
//! The connection core never owns a source. It looks one up by key, asks it
//! for publish rights or a consumer, and pushes frames into it. Anything that
//! implements these traits can stand behind a connection; [`StreamRegistry`]
//! is the in-memory implementation.
//!
//! [`StreamRegistry`]: super::StreamRegistry

use std::sync::Arc;

use async_trait::async_trait;

use super::error::RegistryError;
use super::frame::{Frame, StreamKey};

/// Lookup of shared media sources
#[async_trait]
pub trait SourceRegistry: Send + Sync + 'static {
    /// Find the source for `key`, creating it if needed
    async fn lookup_or_create(&self, key: &StreamKey) -> Result<Arc<dyn Source>, RegistryError>;
}

/// A shared media buffer for one stream
///
/// Many consumers, at most one publisher.
#[async_trait]
pub trait Source: Send + Sync {
    fn key(&self) -> &StreamKey;

    /// Mark the source as published by `conn_id`
    ///
    /// Returns false without waiting if another connection holds it.
    async fn acquire_publisher(&self, conn_id: u64) -> bool;

    /// Give up publish rights
    ///
    /// No-op unless `conn_id` currently holds them.
    async fn release_publisher(&self, conn_id: u64);

    /// Create a private read cursor into the source
    async fn new_consumer(&self) -> Result<Box<dyn Consumer>, RegistryError>;

    /// Ingest one frame from the publisher
    async fn on_frame(&self, frame: Frame);
}

/// A connection's queue into a source
///
/// Dropping the consumer releases it.
#[async_trait]
pub trait Consumer: Send {
    /// Wait for the next frame
    ///
    /// Cancel safe. Returns `None` once the source is gone.
    async fn recv(&mut self) -> Option<Frame>;

    /// Next frame if one is already queued
    fn try_recv(&mut self) -> Option<Frame>;

    /// Player paused or resumed delivery
    async fn on_pause(&mut self, paused: bool);
}
