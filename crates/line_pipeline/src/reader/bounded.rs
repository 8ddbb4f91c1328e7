use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

const CHUNK_SIZE_BYTES: usize = 8192;

#[derive(Debug, Eq, PartialEq)]
pub(crate) enum BoundedLine {
    Line {
        line_number: usize,
        bytes: Vec<u8>,
    },
    LineTooLong {
        line_number: usize,
        observed_bytes: usize,
        max_line_bytes: usize,
    },
}

/// Splits an async byte stream on `\n` without ever holding more than
/// `max_line_bytes` of a single line in memory.
///
/// A line that outgrows the limit is discarded up to its terminating newline
/// and reported once as [`BoundedLine::LineTooLong`]; scanning then resumes with
/// the next line. A trailing line without a newline is emitted at EOF.
pub(crate) struct AsyncBoundedLineReader<R: AsyncRead + Unpin> {
    reader: R,
    max_line_bytes: usize,
    buffer: Box<[u8]>,
    buffer_pos: usize,
    buffer_len: usize,
    current_line: Vec<u8>,
    observed_bytes: usize,
    discard_mode: bool,
    line_number: usize,
    bytes_read: u64,
    done: bool,
}

impl<R: AsyncRead + Unpin> AsyncBoundedLineReader<R> {
    pub(crate) fn new(reader: R, max_line_bytes: usize) -> Self {
        Self {
            reader,
            max_line_bytes,
            buffer: vec![0u8; CHUNK_SIZE_BYTES].into_boxed_slice(),
            buffer_pos: 0,
            buffer_len: 0,
            current_line: Vec::new(),
            observed_bytes: 0,
            discard_mode: false,
            line_number: 0,
            bytes_read: 0,
            done: false,
        }
    }

    /// Total raw bytes pulled from the underlying reader so far.
    pub(crate) fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Returns the next line, `None` at EOF, or the read error that ended the
    /// stream. After an error or EOF every later call returns `None`.
    pub(crate) async fn next_line(&mut self) -> Option<io::Result<BoundedLine>> {
        if self.done {
            return None;
        }

        loop {
            if self.buffer_pos >= self.buffer_len {
                self.buffer_pos = 0;
                self.buffer_len = 0;
                match self.reader.read(&mut self.buffer).await {
                    Ok(0) => {
                        self.done = true;
                        if self.discard_mode || !self.current_line.is_empty() {
                            return Some(Ok(self.finish_line()));
                        }
                        return None;
                    }
                    Ok(n) => {
                        self.buffer_len = n;
                        self.bytes_read = self.bytes_read.saturating_add(n as u64);
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        self.done = true;
                        return Some(Err(err));
                    }
                }
            }

            let newline_idx = self.buffer[self.buffer_pos..self.buffer_len]
                .iter()
                .position(|b| *b == b'\n');

            let Some(newline_idx) = newline_idx else {
                self.append(self.buffer_pos, self.buffer_len);
                self.buffer_pos = self.buffer_len;
                continue;
            };

            let end = self.buffer_pos + newline_idx;
            self.append(self.buffer_pos, end);
            self.buffer_pos = end + 1;
            return Some(Ok(self.finish_line()));
        }
    }

    fn append(&mut self, start: usize, end: usize) {
        self.observed_bytes = self.observed_bytes.saturating_add(end - start);
        if self.discard_mode {
            return;
        }
        if self.observed_bytes > self.max_line_bytes {
            self.discard_mode = true;
            self.current_line = Vec::new();
            return;
        }
        self.current_line.extend_from_slice(&self.buffer[start..end]);
    }

    fn finish_line(&mut self) -> BoundedLine {
        let line_number = self.line_number + 1;
        self.line_number = line_number;

        let line = if self.discard_mode {
            BoundedLine::LineTooLong {
                line_number,
                observed_bytes: self.observed_bytes,
                max_line_bytes: self.max_line_bytes,
            }
        } else {
            BoundedLine::Line {
                line_number,
                bytes: std::mem::take(&mut self.current_line),
            }
        };

        self.observed_bytes = 0;
        self.discard_mode = false;
        line
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::io::{AsyncWriteExt, ReadBuf};

    use super::*;

    async fn collect<R: AsyncRead + Unpin>(
        mut reader: AsyncBoundedLineReader<R>,
    ) -> Vec<io::Result<BoundedLine>> {
        let mut out = Vec::new();
        while let Some(next) = reader.next_line().await {
            out.push(next);
        }
        out
    }

    fn line(line_number: usize, text: &str) -> BoundedLine {
        BoundedLine::Line {
            line_number,
            bytes: text.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn splits_lines_and_emits_trailing_partial_line() {
        let reader = AsyncBoundedLineReader::new(&b"one\ntwo\n\nthree"[..], 64);
        let lines: Vec<_> = collect(reader)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        assert_eq!(
            lines,
            vec![line(1, "one"), line(2, "two"), line(3, ""), line(4, "three")]
        );
    }

    #[tokio::test]
    async fn empty_input_yields_nothing() {
        let mut reader = AsyncBoundedLineReader::new(&b""[..], 64);
        assert!(reader.next_line().await.is_none());
        assert!(reader.next_line().await.is_none());
        assert_eq!(reader.bytes_read(), 0);
    }

    #[tokio::test]
    async fn oversized_line_is_discarded_and_scanning_continues() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"ok\n");
        bytes.extend_from_slice(&vec![b'a'; 50]);
        bytes.extend_from_slice(b"\nnext\n");
        let total = bytes.len() as u64;

        let mut reader = AsyncBoundedLineReader::new(&bytes[..], 16);
        let mut lines = Vec::new();
        while let Some(next) = reader.next_line().await {
            lines.push(next.unwrap());
        }

        assert_eq!(lines[0], line(1, "ok"));
        assert_eq!(
            lines[1],
            BoundedLine::LineTooLong {
                line_number: 2,
                observed_bytes: 50,
                max_line_bytes: 16,
            }
        );
        assert_eq!(lines[2], line(3, "next"));
        assert_eq!(reader.bytes_read(), total);
    }

    #[tokio::test]
    async fn line_exactly_at_limit_is_kept() {
        let reader = AsyncBoundedLineReader::new(&b"abcd\nabcde\n"[..], 4);
        let lines: Vec<_> = collect(reader)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(lines[0], line(1, "abcd"));
        assert!(matches!(lines[1], BoundedLine::LineTooLong { .. }));
    }

    #[tokio::test]
    async fn lines_spanning_chunk_boundaries_are_reassembled() {
        let long = "x".repeat(CHUNK_SIZE_BYTES + 100);
        let (mut writer, rd) = tokio::io::duplex(512);
        let payload = format!("{long}\nshort\n");
        let write = tokio::spawn(async move {
            writer.write_all(payload.as_bytes()).await.unwrap();
            writer.shutdown().await.unwrap();
        });

        let lines = collect(AsyncBoundedLineReader::new(rd, 1024 * 1024)).await;
        write.await.unwrap();

        let lines: Vec<_> = lines.into_iter().map(Result::unwrap).collect();
        assert_eq!(lines, vec![line(1, &long), line(2, "short")]);
    }

    struct FailAfter {
        data: &'static [u8],
        served: bool,
    }

    impl AsyncRead for FailAfter {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.served {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")));
            }
            self.served = true;
            buf.put_slice(self.data);
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn read_error_ends_the_stream() {
        let mut reader = AsyncBoundedLineReader::new(
            FailAfter {
                data: b"first\npartial",
                served: false,
            },
            64,
        );

        assert_eq!(reader.next_line().await.unwrap().unwrap(), line(1, "first"));
        let err = reader.next_line().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(reader.next_line().await.is_none());
        assert_eq!(reader.bytes_read(), 13);
    }
}
