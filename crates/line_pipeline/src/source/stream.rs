use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tracing::debug;

use super::{HealthSnapshot, Latch, LineSource, SourceHealth};
use crate::config::StreamId;
use crate::error::SourceError;
use crate::pipeline::{CloseReason, Pipeline};

/// Pulls lines from a byte stream the process writes to directly, such as a
/// child's stderr pipe.
pub struct StreamSource<R> {
    pipeline: Arc<Pipeline>,
    reader: Mutex<Option<R>>,
    started: AtomicBool,
    ready: Latch,
    stop: Latch,
    health: SourceHealth,
}

impl<R> std::fmt::Debug for StreamSource<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSource")
            .field("stream", &self.pipeline.id())
            .field("started", &self.started.load(Ordering::Acquire))
            .field("stopped", &self.stop.is_set())
            .field("health", &self.health.snapshot())
            .finish()
    }
}

impl<R> StreamSource<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    /// Wraps an already-open stream. The source is ready immediately.
    pub fn new(pipeline: Arc<Pipeline>, reader: R) -> Self {
        let ready = Latch::default();
        ready.set();
        Self {
            pipeline,
            reader: Mutex::new(Some(reader)),
            started: AtomicBool::new(false),
            ready,
            stop: Latch::default(),
            health: SourceHealth::default(),
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    fn take_reader(&self) -> Option<R> {
        self.reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[async_trait]
impl<R> LineSource for StreamSource<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    fn stream(&self) -> StreamId {
        self.pipeline.id()
    }

    async fn run(&self) -> Result<(), SourceError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(SourceError::AlreadyRan);
        }

        let reader = match self.take_reader() {
            Some(reader) if !self.stop.is_set() => reader,
            _ => {
                self.pipeline.close(CloseReason::Stopped);
                return Ok(());
            }
        };

        let result = tokio::select! {
            ingested = self.pipeline.ingest_tracked(reader, Some(&self.health)) => {
                ingested.map(|bytes| {
                    debug!(stream = %self.stream(), bytes, "process output exhausted");
                }).map_err(SourceError::Read)
            }
            _ = self.stop.wait() => {
                debug!(stream = %self.stream(), "stream source stopped");
                Ok(())
            }
        };

        // No-op unless the ingest future above was dropped without closing.
        self.pipeline.close(CloseReason::Stopped);
        result
    }

    async fn ready(&self) {
        self.ready.wait().await;
    }

    fn stop(&self) {
        self.stop.set();
        drop(self.take_reader());
        if !self.started.load(Ordering::Acquire) {
            self.pipeline.close(CloseReason::Stopped);
        }
    }

    fn health_snapshot(&self) -> HealthSnapshot {
        self.health.snapshot()
    }
}
