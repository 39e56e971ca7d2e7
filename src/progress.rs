//! Caller-facing progress output
//!
//! Progress is streamed as it happens: every write goes straight to the
//! receiving side of an unbounded channel, so a caller relaying it (for
//! example as a chunked HTTP body) sees each line immediately.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;

/// Cloneable output sink shared by every task of one operation.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
}

impl Progress {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Sink that drops everything written to it.
    pub fn discard() -> Self {
        Self { tx: None }
    }

    pub fn write(&self, data: impl Into<Bytes>) {
        if let Some(tx) = &self.tx {
            // Receiver gone means nobody is listening anymore.
            let _ = tx.send(data.into());
        }
    }

    /// Write `line` followed by a newline.
    pub fn line(&self, line: impl fmt::Display) {
        self.write(format!("{line}\n"));
    }

    pub fn writer(&self) -> ProgressWriter {
        ProgressWriter {
            progress: self.clone(),
        }
    }
}

/// `AsyncWrite` adapter used to pipe attached container output into a
/// [`Progress`] sink.
#[derive(Debug, Clone)]
pub struct ProgressWriter {
    progress: Progress,
}

impl AsyncWrite for ProgressWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.progress.write(Bytes::copy_from_slice(buf));
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Collect everything currently buffered in `rx` as text.
pub fn drain_to_string(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> String {
    let mut out = Vec::new();
    while let Ok(chunk) = rx.try_recv() {
        out.extend_from_slice(&chunk);
    }
    String::from_utf8_lossy(&out).into_owned()
}
