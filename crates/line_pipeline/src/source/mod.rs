//! Producers that feed a [`Pipeline`](crate::Pipeline) from a supervised
//! process's output.
//!
//! - [`StreamSource`] pulls from a byte stream the process writes to directly
//!   (e.g. its stderr pipe). It is ready as soon as it is constructed.
//! - [`SocketSource`] listens on a Unix domain socket the process connects
//!   to and pushes each received line. It becomes ready only when it is about
//!   to wait for that connection.
//!
//! Both close their pipeline on every exit path of [`LineSource::run`].

use std::{
    io,
    pin::Pin,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    task::{Context, Poll},
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, ReadBuf},
    sync::watch,
};

use crate::config::StreamId;
use crate::error::SourceError;

#[cfg(unix)]
mod socket;
mod stream;

#[cfg(unix)]
pub use socket::SocketSource;
pub use stream::StreamSource;

/// Shared contract of the line source variants.
///
/// Typical sequencing for one stream of a supervised process:
///
/// 1. construct the pipeline and the source,
/// 2. spawn [`LineSource::run`] and the pipeline's consumer as tasks,
/// 3. await [`LineSource::ready`],
/// 4. launch the process,
/// 5. [`LineSource::stop`] once the process is gone (or to abandon the stream).
#[async_trait]
pub trait LineSource: Send + Sync {
    fn stream(&self) -> StreamId;

    /// Ingests until the input ends, the transport fails, or [`LineSource::stop`]
    /// is called. The pipeline is closed before this returns. A second call
    /// returns [`SourceError::AlreadyRan`] without touching the pipeline.
    async fn run(&self) -> Result<(), SourceError>;

    /// Resolves once the source can accept output from the process. Also
    /// resolves after [`LineSource::stop`] so a waiter is never stranded.
    async fn ready(&self);

    /// Releases the underlying handle or endpoint and makes `run` return.
    /// If `run` has not started yet the pipeline is closed as
    /// [`CloseReason::Stopped`](crate::CloseReason::Stopped) right away, so a
    /// consumer spawned without its source still finishes. Idempotent.
    fn stop(&self);

    fn health_snapshot(&self) -> HealthSnapshot;
}

/// Transport-level view of a source.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct HealthSnapshot {
    pub bytes_read: u64,
    pub lines_read: u64,
    /// `false` once the source hit a transport failure. Orderly shutdown and
    /// stop leave this `true`.
    pub healthy: bool,
}

#[derive(Debug)]
pub(crate) struct SourceHealth {
    bytes_read: AtomicU64,
    lines_read: AtomicU64,
    healthy: AtomicBool,
}

impl Default for SourceHealth {
    fn default() -> Self {
        Self {
            bytes_read: AtomicU64::new(0),
            lines_read: AtomicU64::new(0),
            healthy: AtomicBool::new(true),
        }
    }
}

impl SourceHealth {
    pub(crate) fn add_bytes(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_line(&self) {
        self.lines_read.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Release);
    }

    pub(crate) fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            lines_read: self.lines_read.load(Ordering::Relaxed),
            healthy: self.healthy.load(Ordering::Acquire),
        }
    }
}

/// Adds every chunk pulled from `inner` to the source's byte count as it is
/// read, before any line boundary is seen.
pub(crate) struct CountingReader<'a, R> {
    inner: R,
    health: Option<&'a SourceHealth>,
}

impl<'a, R> CountingReader<'a, R> {
    pub(crate) fn new(inner: R, health: Option<&'a SourceHealth>) -> Self {
        Self { inner, health }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<'_, R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let polled = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let (Poll::Ready(Ok(())), Some(health)) = (&polled, this.health) {
            health.add_bytes((buf.filled().len() - before) as u64);
        }
        polled
    }
}

/// One-shot flag that can be awaited: set once, observed forever after.
#[derive(Debug)]
pub(crate) struct Latch {
    tx: watch::Sender<bool>,
}

impl Default for Latch {
    fn default() -> Self {
        Self {
            tx: watch::Sender::new(false),
        }
    }
}

impl Latch {
    pub(crate) fn set(&self) {
        self.tx.send_replace(true);
    }

    pub(crate) fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed
        // channel while borrowed.
        let _ = rx.wait_for(|set| *set).await;
    }
}
