use std::{io, path::PathBuf};

use thiserror::Error;

/// Failures reported by a [`LineSource`](crate::LineSource).
///
/// None of these stop the supervised process; they only explain why a stream
/// stopped producing lines. Queue-full drops are never errors, see
/// [`PipelineSnapshot::lines_dropped`](crate::PipelineSnapshot::lines_dropped).
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("line source already ran")]
    AlreadyRan,
    #[error("failed to bind delivery socket (path={path:?}): {source}")]
    Bind { path: PathBuf, source: io::Error },
    #[error("failed to accept on delivery socket: {0}")]
    Accept(io::Error),
    #[error("failed reading process output: {0}")]
    Read(io::Error),
    #[error("ingest task failed: {0}")]
    Join(String),
}
