/// Consumes one line of process output and records whatever it extracts into
/// state owned by the implementor (or shared with a statistics aggregator).
///
/// The pipeline knows nothing about line contents; it only guarantees that
/// lines which were not dropped arrive here in production order.
pub trait LineParser: Send {
    fn parse_line(&mut self, line: &str);
}

/// Accepts every line and records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopParser;

impl LineParser for NoopParser {
    fn parse_line(&mut self, _line: &str) {}
}

impl<F> LineParser for F
where
    F: FnMut(&str) + Send,
{
    fn parse_line(&mut self, line: &str) {
        self(line)
    }
}
