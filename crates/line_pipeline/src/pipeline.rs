use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, MutexGuard, OnceLock, PoisonError,
    },
};

use tokio::{io::AsyncRead, sync::mpsc};
use tracing::{debug, info, warn};

use crate::config::{PipelineConfig, StreamId};
use crate::line_parser::LineParser;
use crate::reader::{AsyncBoundedLineReader, BoundedLine};
use crate::source::{CountingReader, SourceHealth};

/// Why a pipeline's queue was closed. Only the first close is recorded.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CloseReason {
    /// The producer reached end of stream.
    Exhausted,
    /// The underlying transport failed.
    TransportError,
    /// The owning source was stopped (or its ingest future was dropped).
    Stopped,
}

/// Point-in-time counter values of a [`Pipeline`].
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct PipelineSnapshot {
    /// Lines recognized by the producer side, queued or not.
    pub lines_read: u64,
    /// Lines discarded because the queue was full or already closed.
    pub lines_dropped: u64,
    /// Lines handed to the parser.
    pub lines_parsed: u64,
}

impl PipelineSnapshot {
    pub fn drop_rate(&self) -> f64 {
        if self.lines_read == 0 {
            return 0.0;
        }
        self.lines_dropped as f64 / self.lines_read as f64
    }
}

/// Snapshot plus derived health, suitable for a periodic metrics poll.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineHealth {
    pub stream: StreamId,
    pub snapshot: PipelineSnapshot,
    /// Subset of `lines_dropped` discarded for exceeding the line length limit.
    pub lines_oversized: u64,
    pub drop_rate: f64,
    pub degraded: bool,
    pub closed: bool,
}

/// Bounded, drop-on-full line queue between one producer and one parser.
///
/// The producer side ([`Pipeline::ingest`] or [`Pipeline::feed_line`]) never
/// waits on the queue: a line is either queued immediately or counted as
/// dropped. The consumer side ([`Pipeline::consume`] / [`Pipeline::drain`])
/// waits for lines until [`Pipeline::close`] has been called and the queue is
/// empty.
///
/// Share it between tasks with an `Arc`.
pub struct Pipeline {
    id: StreamId,
    config: PipelineConfig,
    tx: Mutex<Option<mpsc::Sender<String>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
    closing: AtomicBool,
    close_reason: OnceLock<CloseReason>,
    lines_read: AtomicU64,
    lines_dropped: AtomicU64,
    lines_parsed: AtomicU64,
    lines_oversized: AtomicU64,
    degraded_reported: AtomicBool,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("closed", &self.is_closed())
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl Pipeline {
    /// Creates an open pipeline. Invalid capacity or threshold values are
    /// replaced by their defaults, so construction always succeeds.
    pub fn new(id: StreamId, config: PipelineConfig) -> Self {
        let config = config.normalized();
        let (tx, rx) = mpsc::channel(config.capacity);
        Self {
            id,
            config,
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            closing: AtomicBool::new(false),
            close_reason: OnceLock::new(),
            lines_read: AtomicU64::new(0),
            lines_dropped: AtomicU64::new(0),
            lines_parsed: AtomicU64::new(0),
            lines_oversized: AtomicU64::new(0),
            degraded_reported: AtomicBool::new(false),
        }
    }

    pub fn with_defaults(id: StreamId) -> Self {
        Self::new(id, PipelineConfig::default())
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn sender(&self) -> MutexGuard<'_, Option<mpsc::Sender<String>>> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Offers one line to the queue without waiting.
    ///
    /// Returns `false` when the line was dropped (queue full or closed).
    pub fn feed_line(&self, line: impl Into<String>) -> bool {
        self.lines_read.fetch_add(1, Ordering::AcqRel);
        let queued = match self.sender().as_ref() {
            Some(tx) => tx.try_send(line.into()).is_ok(),
            None => false,
        };
        if !queued {
            self.lines_dropped.fetch_add(1, Ordering::AcqRel);
        }
        queued
    }

    fn record_oversized(&self, line_number: usize, observed_bytes: usize, max_line_bytes: usize) {
        self.lines_read.fetch_add(1, Ordering::AcqRel);
        self.lines_dropped.fetch_add(1, Ordering::AcqRel);
        if self.lines_oversized.fetch_add(1, Ordering::AcqRel) == 0 {
            warn!(
                stream = %self.id,
                line_number,
                observed_bytes,
                max_line_bytes,
                "discarding oversized line"
            );
        }
    }

    /// Reads `reader` to exhaustion, queueing every line without waiting on
    /// the queue. Returns the number of raw bytes read.
    ///
    /// The queue is closed on every exit path: [`CloseReason::Exhausted`] at
    /// EOF, [`CloseReason::TransportError`] on a read error, and
    /// [`CloseReason::Stopped`] if this future is dropped before finishing.
    pub async fn ingest<R>(&self, reader: R) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        self.ingest_tracked(reader, None).await
    }

    pub(crate) async fn ingest_tracked<R>(
        &self,
        reader: R,
        health: Option<&SourceHealth>,
    ) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut guard = CloseOnDrop::new(self);
        debug!(stream = %self.id, "ingest started");
        let result = self.pump(reader, health).await;
        guard.reason = match result {
            Ok(_) => CloseReason::Exhausted,
            Err(_) => CloseReason::TransportError,
        };
        result
    }

    /// Splits `reader` into lines and offers each to the queue. Does not
    /// close the pipeline; callers decide what end of input means.
    pub(crate) async fn pump<R>(&self, reader: R, health: Option<&SourceHealth>) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let reader = CountingReader::new(reader, health);
        let mut reader = AsyncBoundedLineReader::new(reader, self.config.max_line_bytes);

        while let Some(next) = reader.next_line().await {
            match next {
                Ok(BoundedLine::Line { bytes, .. }) => {
                    if let Some(health) = health {
                        health.record_line();
                    }
                    self.feed_line(line_from_bytes(bytes));
                }
                Ok(BoundedLine::LineTooLong {
                    line_number,
                    observed_bytes,
                    max_line_bytes,
                }) => {
                    if let Some(health) = health {
                        health.record_line();
                    }
                    self.record_oversized(line_number, observed_bytes, max_line_bytes);
                }
                Err(err) => {
                    warn!(stream = %self.id, error = %err, "process output read failed");
                    if let Some(health) = health {
                        health.mark_unhealthy();
                    }
                    return Err(err);
                }
            }
        }

        Ok(reader.bytes_read())
    }

    /// Closes the queue. Safe to call any number of times from any task; only
    /// the first call has an effect and its `reason` is the one recorded.
    ///
    /// Returns `true` if this call performed the transition.
    pub fn close(&self, reason: CloseReason) -> bool {
        if self
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        // Publishing the reason is what makes the pipeline observably closed.
        let _ = self.close_reason.set(reason);
        drop(self.sender().take());

        let snapshot = self.snapshot();
        debug!(
            stream = %self.id,
            ?reason,
            lines_read = snapshot.lines_read,
            lines_dropped = snapshot.lines_dropped,
            "pipeline closed"
        );
        true
    }

    /// `true` once [`Pipeline::close`] has run; [`Pipeline::close_reason`] is
    /// then always `Some`.
    pub fn is_closed(&self) -> bool {
        self.close_reason.get().is_some()
    }

    /// Reason passed to the first [`Pipeline::close`] call, if any.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    /// Feeds queued lines to `parser` in arrival order until the queue is
    /// closed and empty.
    pub async fn consume<P>(&self, parser: &mut P)
    where
        P: LineParser + ?Sized,
    {
        let mut rx = self.rx.lock().await;
        while let Some(line) = rx.recv().await {
            parser.parse_line(&line);
            self.lines_parsed.fetch_add(1, Ordering::AcqRel);
        }
        debug!(
            stream = %self.id,
            lines_parsed = self.lines_parsed.load(Ordering::Acquire),
            "consumer finished"
        );
    }

    /// Discards queued lines without parsing until the queue is closed and
    /// empty. Returns how many lines were discarded.
    pub async fn drain(&self) -> u64 {
        let mut rx = self.rx.lock().await;
        let mut discarded = 0u64;
        while rx.recv().await.is_some() {
            discarded += 1;
        }
        discarded
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        // Load the consumer- and drop-side counters first so that
        // `lines_parsed <= lines_read` and `lines_dropped <= lines_read` hold
        // in the returned value.
        let lines_parsed = self.lines_parsed.load(Ordering::Acquire);
        let lines_dropped = self.lines_dropped.load(Ordering::Acquire);
        let lines_read = self.lines_read.load(Ordering::Acquire);
        PipelineSnapshot {
            lines_read,
            lines_dropped,
            lines_parsed,
        }
    }

    /// `lines_dropped / lines_read`, or `0.0` before any line was read.
    pub fn drop_rate(&self) -> f64 {
        self.snapshot().drop_rate()
    }

    /// `true` when the drop rate is strictly above the configured threshold.
    pub fn is_degraded(&self) -> bool {
        self.drop_rate() > self.config.drop_threshold
    }

    pub fn lines_oversized(&self) -> u64 {
        self.lines_oversized.load(Ordering::Acquire)
    }

    pub fn health(&self) -> PipelineHealth {
        let snapshot = self.snapshot();
        let drop_rate = snapshot.drop_rate();
        PipelineHealth {
            stream: self.id,
            snapshot,
            lines_oversized: self.lines_oversized(),
            drop_rate,
            degraded: drop_rate > self.config.drop_threshold,
            closed: self.is_closed(),
        }
    }

    /// Like [`Pipeline::is_degraded`], but logs once when the stream enters
    /// the degraded state and once when it leaves it. Meant for the periodic
    /// poller that feeds metrics.
    pub fn check_degraded(&self) -> bool {
        let health = self.health();
        if health.degraded {
            if !self.degraded_reported.swap(true, Ordering::AcqRel) {
                warn!(
                    stream = %self.id,
                    drop_rate = health.drop_rate,
                    threshold = self.config.drop_threshold,
                    lines_read = health.snapshot.lines_read,
                    lines_dropped = health.snapshot.lines_dropped,
                    "stream degraded; derived metrics may be incomplete"
                );
            }
        } else if self.degraded_reported.swap(false, Ordering::AcqRel) {
            info!(
                stream = %self.id,
                drop_rate = health.drop_rate,
                "stream recovered from degraded state"
            );
        }
        health.degraded
    }
}

fn line_from_bytes(bytes: Vec<u8>) -> String {
    let mut line = match String::from_utf8(bytes) {
        Ok(line) => line,
        Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
    };
    if line.ends_with('\r') {
        line.pop();
    }
    line
}

/// Closes the pipeline when dropped, with `reason` as left by its owner.
/// Starts out as [`CloseReason::Stopped`], which is what a cancelled future
/// leaves behind.
pub(crate) struct CloseOnDrop<'a> {
    pipeline: &'a Pipeline,
    pub(crate) reason: CloseReason,
}

impl<'a> CloseOnDrop<'a> {
    pub(crate) fn new(pipeline: &'a Pipeline) -> Self {
        Self {
            pipeline,
            reason: CloseReason::Stopped,
        }
    }
}

impl Drop for CloseOnDrop<'_> {
    fn drop(&mut self) {
        self.pipeline.close(self.reason);
    }
}
