#![forbid(unsafe_code)]
//! Line ingestion for the output streams of supervised media-client processes.
//!
//! Each stream of each process gets its own [`Pipeline`]: a bounded queue with
//! drop-on-full semantics between a producer ([`StreamSource`] or
//! [`SocketSource`]) and a [`LineParser`]. The producer never waits on the
//! queue, so a slow parser can lose lines but can never stall the process
//! being measured. Loss is visible through [`Pipeline::snapshot`],
//! [`Pipeline::drop_rate`] and [`Pipeline::is_degraded`].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use line_pipeline::{LineSource, NoopParser, Pipeline, StreamId, StreamSource};
//!
//! # async fn demo(stderr: tokio::process::ChildStderr) {
//! let pipeline = Arc::new(Pipeline::with_defaults(StreamId::diagnostic(1)));
//! let source = Arc::new(StreamSource::new(Arc::clone(&pipeline), stderr));
//!
//! let ingest = tokio::spawn({
//!     let source = Arc::clone(&source);
//!     async move { source.run().await }
//! });
//! let consume = tokio::spawn({
//!     let pipeline = Arc::clone(&pipeline);
//!     async move { pipeline.consume(&mut NoopParser).await }
//! });
//!
//! source.ready().await;
//! // ... process runs ...
//! let _ = ingest.await;
//! let _ = consume.await;
//! println!("drop rate: {}", pipeline.drop_rate());
//! # }
//! ```

mod config;
mod error;
mod harness;
mod line_parser;
mod pipeline;
mod reader;
mod source;

pub use config::{
    PipelineConfig, StreamId, StreamKind, DEFAULT_CAPACITY, DEFAULT_DROP_THRESHOLD,
    DEFAULT_MAX_LINE_BYTES,
};
pub use error::SourceError;
pub use harness::{ProcessStreams, StreamReport, StreamTasks};
pub use line_parser::{LineParser, NoopParser};
pub use pipeline::{CloseReason, Pipeline, PipelineHealth, PipelineSnapshot};
pub use source::{HealthSnapshot, LineSource, StreamSource};

#[cfg(unix)]
pub use source::SocketSource;
