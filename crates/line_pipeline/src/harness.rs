//! Task wiring for one supervised process's output streams.
//!
//! Each stream gets exactly two tasks: the source's ingest loop and the
//! pipeline's consumer. Neither can block the process: the ingest side only
//! waits on the transport, and the consumer only on the queue.

#[cfg(unix)]
use std::path::PathBuf;
use std::sync::Arc;

use tokio::{io::AsyncRead, task::JoinHandle};
use tracing::debug;

use crate::config::{PipelineConfig, StreamId};
use crate::error::SourceError;
use crate::line_parser::LineParser;
use crate::pipeline::{CloseReason, Pipeline, PipelineHealth};
use crate::source::{HealthSnapshot, LineSource, StreamSource};

#[cfg(unix)]
use crate::source::SocketSource;

/// Final state of one stream after both of its tasks have finished.
#[derive(Debug)]
pub struct StreamReport<P> {
    pub stream: StreamId,
    pub pipeline: PipelineHealth,
    pub close_reason: Option<CloseReason>,
    pub source: HealthSnapshot,
    /// Error the source returned, if any.
    pub source_error: Option<SourceError>,
    /// The parser handed back by the consumer; `None` if it panicked.
    pub parser: Option<P>,
}

/// Running ingest + consume tasks for one stream.
pub struct StreamTasks<P> {
    source: Arc<dyn LineSource>,
    pipeline: Arc<Pipeline>,
    ingest: JoinHandle<Result<(), SourceError>>,
    consume: JoinHandle<P>,
}

impl<P> StreamTasks<P>
where
    P: LineParser + 'static,
{
    /// Spawns `source.run()` and `pipeline.consume(parser)` as separate tasks.
    /// `source` must be the producer of `pipeline`.
    pub fn spawn(source: Arc<dyn LineSource>, pipeline: Arc<Pipeline>, mut parser: P) -> Self {
        debug_assert_eq!(source.stream(), pipeline.id());

        let ingest = tokio::spawn({
            let source = Arc::clone(&source);
            async move { source.run().await }
        });
        let consume = tokio::spawn({
            let pipeline = Arc::clone(&pipeline);
            async move {
                pipeline.consume(&mut parser).await;
                parser
            }
        });
        debug!(stream = %pipeline.id(), "stream tasks spawned");

        Self {
            source,
            pipeline,
            ingest,
            consume,
        }
    }

    /// Builds a pipeline fed from an open byte stream and spawns its tasks.
    pub fn spawn_reader<R>(id: StreamId, config: PipelineConfig, reader: R, parser: P) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let pipeline = Arc::new(Pipeline::new(id, config));
        let source = Arc::new(StreamSource::new(Arc::clone(&pipeline), reader));
        Self::spawn(source, pipeline, parser)
    }

    /// Builds a pipeline fed through a Unix socket at `path` and spawns its
    /// tasks. Returns the socket source as well so the caller can hand its
    /// path to the process.
    #[cfg(unix)]
    pub fn spawn_socket(
        id: StreamId,
        config: PipelineConfig,
        path: impl Into<PathBuf>,
        parser: P,
    ) -> Result<(Self, Arc<SocketSource>), SourceError> {
        let pipeline = Arc::new(Pipeline::new(id, config));
        let source = Arc::new(SocketSource::bind(Arc::clone(&pipeline), path)?);
        let tasks = Self::spawn(source.clone(), pipeline, parser);
        Ok((tasks, source))
    }

    pub fn stream(&self) -> StreamId {
        self.pipeline.id()
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn source(&self) -> &Arc<dyn LineSource> {
        &self.source
    }

    /// Waits until the source can receive output. Launch the process after
    /// this resolves.
    pub async fn wait_ready(&self) {
        self.source.ready().await;
    }

    pub fn stop(&self) {
        self.source.stop();
    }

    /// Waits for both tasks and collects the stream's final state.
    ///
    /// Panics inside either task are absorbed: a panicking source still
    /// closes the pipeline on unwind, and a panicking parser only loses the
    /// parser.
    pub async fn join(self) -> StreamReport<P> {
        let stream = self.pipeline.id();

        let source_error = match self.ingest.await {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err),
            Err(join_err) => {
                self.pipeline.close(CloseReason::TransportError);
                Some(SourceError::Join(join_err.to_string()))
            }
        };

        let parser = match self.consume.await {
            Ok(parser) => Some(parser),
            Err(join_err) => {
                debug!(stream = %stream, error = %join_err, "consumer task failed");
                None
            }
        };

        self.pipeline.check_degraded();
        let pipeline = self.pipeline.health();
        debug!(
            stream = %stream,
            lines_read = pipeline.snapshot.lines_read,
            lines_dropped = pipeline.snapshot.lines_dropped,
            lines_parsed = pipeline.snapshot.lines_parsed,
            "stream finished"
        );

        StreamReport {
            stream,
            pipeline,
            close_reason: self.pipeline.close_reason(),
            source: self.source.health_snapshot(),
            source_error,
            parser,
        }
    }
}

/// The progress and diagnostic streams of one supervised process.
pub struct ProcessStreams<P, D> {
    pub progress: StreamTasks<P>,
    pub diagnostic: StreamTasks<D>,
}

impl<P, D> ProcessStreams<P, D>
where
    P: LineParser + 'static,
    D: LineParser + 'static,
{
    pub fn new(progress: StreamTasks<P>, diagnostic: StreamTasks<D>) -> Self {
        debug_assert_eq!(
            progress.stream().process_id,
            diagnostic.stream().process_id
        );
        Self {
            progress,
            diagnostic,
        }
    }

    /// Resolves once both streams can receive output.
    pub async fn wait_ready(&self) {
        tokio::join!(self.progress.wait_ready(), self.diagnostic.wait_ready());
    }

    pub fn stop(&self) {
        self.progress.stop();
        self.diagnostic.stop();
    }

    pub fn pipelines(&self) -> [&Arc<Pipeline>; 2] {
        [self.progress.pipeline(), self.diagnostic.pipeline()]
    }

    pub async fn join(self) -> (StreamReport<P>, StreamReport<D>) {
        tokio::join!(self.progress.join(), self.diagnostic.join())
    }
}
