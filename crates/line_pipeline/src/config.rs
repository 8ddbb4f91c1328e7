use std::fmt;

use serde::{Deserialize, Serialize};

/// Queue capacity used when none (or an invalid one) is configured.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Drop rate above which a stream is reported as degraded.
pub const DEFAULT_DROP_THRESHOLD: f64 = 0.01;

/// Hard ceiling on a single scanned line.
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// Logical output channel of a supervised process.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Progress,
    Diagnostic,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Progress => "progress",
            StreamKind::Diagnostic => "diagnostic",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one pipeline: which process, which of its streams.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct StreamId {
    pub process_id: u64,
    pub kind: StreamKind,
}

impl StreamId {
    pub fn new(process_id: u64, kind: StreamKind) -> Self {
        Self { process_id, kind }
    }

    pub fn progress(process_id: u64) -> Self {
        Self::new(process_id, StreamKind::Progress)
    }

    pub fn diagnostic(process_id: u64) -> Self {
        Self::new(process_id, StreamKind::Diagnostic)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proc-{}/{}", self.process_id, self.kind)
    }
}

/// Tunables for one pipeline.
///
/// Deserializes with every field optional so it can be embedded in a larger
/// TOML document. Out-of-range values are not rejected; [`PipelineConfig::normalized`]
/// replaces them with the defaults.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum number of queued lines awaiting the parser.
    pub capacity: usize,
    /// Drop rate strictly above which the stream counts as degraded.
    pub drop_threshold: f64,
    /// Lines longer than this are discarded at scan time.
    pub max_line_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            drop_threshold: DEFAULT_DROP_THRESHOLD,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl PipelineConfig {
    pub fn new(capacity: usize, drop_threshold: f64) -> Self {
        Self {
            capacity,
            drop_threshold,
            ..Self::default()
        }
    }

    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }

    /// Returns a copy with invalid values replaced by their defaults.
    ///
    /// - `capacity < 1` becomes [`DEFAULT_CAPACITY`].
    /// - `drop_threshold <= 0` (or NaN) becomes [`DEFAULT_DROP_THRESHOLD`];
    ///   values above 1 are clamped to 1.
    /// - `max_line_bytes == 0` becomes [`DEFAULT_MAX_LINE_BYTES`].
    pub fn normalized(self) -> Self {
        let capacity = if self.capacity < 1 {
            DEFAULT_CAPACITY
        } else {
            self.capacity
        };
        let drop_threshold = if self.drop_threshold > 0.0 {
            self.drop_threshold.min(1.0)
        } else {
            DEFAULT_DROP_THRESHOLD
        };
        let max_line_bytes = if self.max_line_bytes == 0 {
            DEFAULT_MAX_LINE_BYTES
        } else {
            self.max_line_bytes
        };
        Self {
            capacity,
            drop_threshold,
            max_line_bytes,
        }
    }
}
