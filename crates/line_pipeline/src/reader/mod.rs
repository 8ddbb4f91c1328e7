mod bounded;

pub(crate) use bounded::{AsyncBoundedLineReader, BoundedLine};
