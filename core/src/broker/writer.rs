//! Shared write side of a connection.
//!
//! The input loop and the pump both write frames; each write goes through
//! one async mutex so a frame is always written whole. Every write also
//! races the session's cancellation, so a peer that stopped reading cannot
//! hold either loop past a close.

use crate::protocol::{Frame, FrameCodec, FrameError};
use futures::SinkExt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

/// How long a final flush may take once the session is closed
pub const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Any byte stream a session can run over (plain TCP or TLS)
pub trait AsyncStream: tokio::io::AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: tokio::io::AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn AsyncStream>;

pub type FrameSink = FramedWrite<tokio::io::WriteHalf<BoxedStream>, FrameCodec>;

fn aborted() -> FrameError {
    FrameError::Io(io::Error::new(
        io::ErrorKind::ConnectionAborted,
        "session closed",
    ))
}

#[derive(Clone)]
pub struct ConnectionWriter {
    sink: Arc<Mutex<FrameSink>>,
    cancel: CancellationToken,
}

impl ConnectionWriter {
    /// `buffer_size` bytes may accumulate before a buffered write is flushed;
    /// zero flushes every frame. Writes in progress fail once `cancel` fires.
    pub fn new(mut sink: FrameSink, buffer_size: usize, cancel: CancellationToken) -> Self {
        sink.set_backpressure_boundary(buffer_size);
        Self {
            sink: Arc::new(Mutex::new(sink)),
            cancel,
        }
    }

    async fn guarded<F>(&self, write: F) -> Result<(), FrameError>
    where
        F: Future<Output = Result<(), FrameError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(aborted()),
            result = write => result,
        }
    }

    /// Write a frame and flush it together with anything buffered
    pub async fn send(&self, frame: Frame) -> Result<(), FrameError> {
        self.guarded(async { self.sink.lock().await.send(frame).await })
            .await
    }

    /// Buffer a frame without forcing a flush
    pub async fn feed(&self, frame: Frame) -> Result<(), FrameError> {
        self.guarded(async { self.sink.lock().await.feed(frame).await })
            .await
    }

    pub async fn flush(&self) -> Result<(), FrameError> {
        self.guarded(async { self.sink.lock().await.flush().await })
            .await
    }

    /// Flush and shut down the write half, giving up after `grace`.
    /// Runs after the session is cancelled, so it is bounded by time only.
    pub async fn close(&self, grace: Duration) -> Result<(), FrameError> {
        match tokio::time::timeout(grace, async { self.sink.lock().await.close().await }).await {
            Ok(result) => result,
            Err(_) => Err(FrameError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "peer is not reading",
            ))),
        }
    }
}
