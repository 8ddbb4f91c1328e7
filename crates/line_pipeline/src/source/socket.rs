use std::{
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use async_trait::async_trait;
use tokio::{io::AsyncRead, net::UnixListener};
use tracing::{debug, warn};

use super::{HealthSnapshot, Latch, LineSource, SourceHealth};
use crate::config::StreamId;
use crate::error::SourceError;
use crate::pipeline::{CloseOnDrop, CloseReason, Pipeline};

/// Receives lines the process pushes over a Unix domain socket, e.g. a media
/// client writing its progress report to `unix://<path>`.
///
/// The socket is bound on construction so the path exists before the process
/// is launched. One producer connection is served; when it reaches EOF the
/// pipeline is closed as exhausted. The socket file is removed when `run`
/// returns or the source is stopped.
///
/// A socket file left behind by an owner that is no longer listening is
/// replaced on bind, so a restarted stream can reuse its path.
pub struct SocketSource {
    pipeline: Arc<Pipeline>,
    path: PathBuf,
    listener: Mutex<Option<UnixListener>>,
    started: AtomicBool,
    ready: Latch,
    stop: Latch,
    health: SourceHealth,
}

impl std::fmt::Debug for SocketSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketSource")
            .field("stream", &self.pipeline.id())
            .field("path", &self.path)
            .field("started", &self.started.load(Ordering::Acquire))
            .field("stopped", &self.stop.is_set())
            .field("health", &self.health.snapshot())
            .finish()
    }
}

impl SocketSource {
    /// Binds a listener at `path`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(pipeline: Arc<Pipeline>, path: impl Into<PathBuf>) -> Result<Self, SourceError> {
        let path = path.into();
        let listener = bind_listener(&path).map_err(|source| SourceError::Bind {
            path: path.clone(),
            source,
        })?;
        debug!(stream = %pipeline.id(), path = ?path, "delivery socket bound");

        Ok(Self {
            pipeline,
            path,
            listener: Mutex::new(Some(listener)),
            started: AtomicBool::new(false),
            ready: Latch::default(),
            stop: Latch::default(),
            health: SourceHealth::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `unix://` URL form of the socket path, as media clients expect it.
    pub fn url(&self) -> String {
        format!("unix://{}", self.path.display())
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    fn take_listener(&self) -> Option<UnixListener> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn remove_socket_file(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(
                    stream = %self.stream(),
                    path = ?self.path,
                    error = %err,
                    "failed to remove delivery socket"
                );
            }
        }
    }

    async fn serve(&self, listener: UnixListener) -> Result<CloseReason, SourceError> {
        self.ready.set();
        let connection = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((connection, _addr)) => connection,
                Err(err) => {
                    warn!(stream = %self.stream(), error = %err, "delivery socket accept failed");
                    self.health.mark_unhealthy();
                    return Err(SourceError::Accept(err));
                }
            },
            _ = self.stop.wait() => return Ok(CloseReason::Stopped),
        };
        drop(listener);
        debug!(stream = %self.stream(), "producer connected");

        self.serve_connection(connection).await
    }

    async fn serve_connection<C>(&self, connection: C) -> Result<CloseReason, SourceError>
    where
        C: AsyncRead + Unpin,
    {
        tokio::select! {
            pumped = self.pipeline.pump(connection, Some(&self.health)) => match pumped {
                Ok(bytes) => {
                    debug!(stream = %self.stream(), bytes, "producer disconnected");
                    Ok(CloseReason::Exhausted)
                }
                Err(err) => Err(SourceError::Read(err)),
            },
            _ = self.stop.wait() => Ok(CloseReason::Stopped),
        }
    }
}

#[async_trait]
impl LineSource for SocketSource {
    fn stream(&self) -> StreamId {
        self.pipeline.id()
    }

    async fn run(&self) -> Result<(), SourceError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(SourceError::AlreadyRan);
        }
        let guard = CloseOnDrop::new(&self.pipeline);

        let listener = match self.take_listener() {
            Some(listener) if !self.stop.is_set() => listener,
            _ => {
                self.remove_socket_file();
                return Ok(());
            }
        };

        let result = self.serve(listener).await;
        self.remove_socket_file();
        settle(guard, result)
    }

    async fn ready(&self) {
        self.ready.wait().await;
    }

    fn stop(&self) {
        self.stop.set();
        self.ready.set();
        if let Some(listener) = self.take_listener() {
            drop(listener);
            self.remove_socket_file();
        }
        if !self.started.load(Ordering::Acquire) {
            self.pipeline.close(CloseReason::Stopped);
        }
    }

    fn health_snapshot(&self) -> HealthSnapshot {
        self.health.snapshot()
    }
}

/// Records the close reason matching how serving ended; the guard closes the
/// pipeline as it drops.
fn settle(
    mut guard: CloseOnDrop<'_>,
    result: Result<CloseReason, SourceError>,
) -> Result<(), SourceError> {
    match result {
        Ok(reason) => {
            guard.reason = reason;
            Ok(())
        }
        Err(err) => {
            guard.reason = CloseReason::TransportError;
            Err(err)
        }
    }
}

fn bind_listener(path: &Path) -> io::Result<UnixListener> {
    match UnixListener::bind(path) {
        Err(err) if err.kind() == io::ErrorKind::AddrInUse && is_stale_socket(path) => {
            debug!(path = ?path, "replacing stale delivery socket");
            std::fs::remove_file(path)?;
            UnixListener::bind(path)
        }
        bound => bound,
    }
}

/// A socket file nobody listens on any more. Regular files and live
/// listeners are never treated as stale.
fn is_stale_socket(path: &Path) -> bool {
    use std::os::unix::{fs::FileTypeExt, net::UnixStream};

    let is_socket = std::fs::symlink_metadata(path)
        .map(|meta| meta.file_type().is_socket())
        .unwrap_or(false);
    is_socket
        && matches!(
            UnixStream::connect(path),
            Err(err) if err.kind() == io::ErrorKind::ConnectionRefused
        )
}

#[cfg(test)]
mod tests {
    use std::{
        pin::Pin,
        task::{Context, Poll},
        time::Duration,
    };

    use tokio::{
        io::{AsyncWriteExt, ReadBuf},
        net::UnixStream,
        time,
    };

    use super::*;

    fn pipeline() -> Arc<Pipeline> {
        Arc::new(Pipeline::with_defaults(StreamId::progress(4)))
    }

    #[tokio::test]
    async fn ready_only_once_accepting() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline();
        let source = Arc::new(
            SocketSource::bind(Arc::clone(&pipeline), dir.path().join("p.sock")).unwrap(),
        );
        assert!(source.path().exists());
        assert!(source.url().starts_with("unix://"));

        let not_ready = time::timeout(Duration::from_millis(20), source.ready()).await;
        assert!(not_ready.is_err(), "not ready before run");

        let run = tokio::spawn({
            let source = Arc::clone(&source);
            async move { source.run().await }
        });
        time::timeout(Duration::from_secs(5), source.ready())
            .await
            .expect("ready once accepting");

        let mut producer = UnixStream::connect(source.path()).await.unwrap();
        producer
            .write_all(b"frame=1\nframe=2\r\nprogress=end\n")
            .await
            .unwrap();
        drop(producer);

        time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(pipeline.close_reason(), Some(CloseReason::Exhausted));
        assert!(!source.path().exists());
        let health = source.health_snapshot();
        assert_eq!(health.lines_read, 3);
        assert!(health.healthy);

        let mut lines = Vec::new();
        let mut parser = |line: &str| lines.push(line.to_string());
        pipeline.consume(&mut parser).await;
        assert_eq!(lines, vec!["frame=1", "frame=2", "progress=end"]);
    }

    #[tokio::test]
    async fn stop_while_waiting_for_connection() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline();
        let source = Arc::new(
            SocketSource::bind(Arc::clone(&pipeline), dir.path().join("p.sock")).unwrap(),
        );

        let run = tokio::spawn({
            let source = Arc::clone(&source);
            async move { source.run().await }
        });
        source.ready().await;

        source.stop();
        source.stop();
        time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(pipeline.close_reason(), Some(CloseReason::Stopped));
        assert!(!source.path().exists());
        assert!(source.health_snapshot().healthy);
    }

    #[tokio::test]
    async fn stop_before_run_releases_endpoint_and_ready_waiters() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline();
        let source = SocketSource::bind(Arc::clone(&pipeline), dir.path().join("p.sock")).unwrap();

        source.stop();
        assert!(!source.path().exists());
        assert_eq!(pipeline.close_reason(), Some(CloseReason::Stopped));
        time::timeout(Duration::from_secs(1), source.ready())
            .await
            .unwrap();

        source.run().await.unwrap();
        assert_eq!(pipeline.close_reason(), Some(CloseReason::Stopped));
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no-such-dir").join("p.sock");
        let err = SocketSource::bind(pipeline(), missing).unwrap_err();
        assert!(matches!(err, SourceError::Bind { .. }));
    }

    #[tokio::test]
    async fn stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.sock");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let source = SocketSource::bind(pipeline(), &path).unwrap();
        assert_eq!(source.path(), path.as_path());
        let debug = format!("{source:?}");
        assert!(debug.contains("SocketSource"));
        assert!(debug.contains("p.sock"));
    }

    #[tokio::test]
    async fn live_listener_is_not_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.sock");
        let _owner = SocketSource::bind(pipeline(), &path).unwrap();

        let Err(err) = SocketSource::bind(pipeline(), &path) else {
            panic!("second bind on a live path must fail");
        };
        let SourceError::Bind { source, .. } = err else {
            panic!("expected a bind error");
        };
        assert_eq!(source.kind(), io::ErrorKind::AddrInUse);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn regular_file_at_path_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.sock");
        std::fs::write(&path, b"not a socket").unwrap();

        assert!(SocketSource::bind(pipeline(), &path).is_err());
        assert_eq!(std::fs::read(&path).unwrap(), b"not a socket");
    }

    /// Delivers one line, then fails as a reset connection would.
    struct ResetAfterFirstLine {
        served: bool,
    }

    impl AsyncRead for ResetAfterFirstLine {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.served {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "producer reset",
                )));
            }
            self.served = true;
            buf.put_slice(b"frame=1\n");
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn connection_read_failure_closes_as_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline();
        let source = SocketSource::bind(Arc::clone(&pipeline), dir.path().join("p.sock")).unwrap();

        let served = source
            .serve_connection(ResetAfterFirstLine { served: false })
            .await;
        let err = settle(CloseOnDrop::new(&pipeline), served).unwrap_err();

        assert!(
            matches!(err, SourceError::Read(ref e) if e.kind() == io::ErrorKind::ConnectionReset)
        );
        assert_eq!(pipeline.close_reason(), Some(CloseReason::TransportError));
        let health = source.health_snapshot();
        assert!(!health.healthy);
        assert_eq!(health.lines_read, 1);
        assert_eq!(health.bytes_read, 8);
        assert_eq!(pipeline.drain().await, 1);
    }

    #[tokio::test]
    async fn exhausted_connection_settles_as_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline();
        let source = SocketSource::bind(Arc::clone(&pipeline), dir.path().join("p.sock")).unwrap();

        let served = source.serve_connection(&b"progress=end\n"[..]).await;
        settle(CloseOnDrop::new(&pipeline), served).unwrap();

        assert_eq!(pipeline.close_reason(), Some(CloseReason::Exhausted));
        assert!(source.health_snapshot().healthy);
    }
}
