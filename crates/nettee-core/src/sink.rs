//! Tee sinks: write-only destinations for duplicated relay traffic.
//!
//! A [`Sink`] is shared by every relay that tees into it, so each `write`
//! call must be atomic with respect to the others. All implementations here
//! serialise writers behind an async mutex and flush before releasing it.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// A destination that accepts duplicated bytes.
pub trait Sink: Send + Sync {
    /// Write all of `data`. Concurrent calls must not interleave.
    fn write<'a>(
        &'a self,
        data: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send + 'a>>;
}

/// A writer shared between several sinks (e.g. one log file for both directions).
pub type SharedWriter<W> = Arc<Mutex<W>>;

/// Raw sink: bytes are written verbatim.
pub struct WriterSink<W> {
    writer: SharedWriter<W>,
}

impl<W> WriterSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    /// Build a sink over a writer that other sinks may also hold.
    pub fn shared(writer: SharedWriter<W>) -> Self {
        Self { writer }
    }
}

impl<W> Sink for WriterSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn write<'a>(
        &'a self,
        data: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut writer = self.writer.lock().await;
            writer.write_all(data).await?;
            writer.flush().await
        })
    }
}

/// One newline-delimited JSON entry written by [`JsonLinesSink`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeeRecord {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Stream label, e.g. `"send"` or `"recv"`.
    pub stream: String,
    /// Number of payload bytes.
    pub len: usize,
    /// Hex-encoded payload.
    pub data: String,
}

/// Framed sink: each write becomes one JSON line tagged with a stream label.
///
/// Two instances with different labels can share one writer, which keeps
/// both directions distinguishable inside a single log file.
pub struct JsonLinesSink<W> {
    writer: SharedWriter<W>,
    label: String,
}

impl<W> JsonLinesSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W, label: impl Into<String>) -> Self {
        Self::shared(Arc::new(Mutex::new(writer)), label)
    }

    pub fn shared(writer: SharedWriter<W>, label: impl Into<String>) -> Self {
        Self {
            writer,
            label: label.into(),
        }
    }

    fn encode(&self, data: &[u8]) -> io::Result<String> {
        let record = TeeRecord {
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            stream: self.label.clone(),
            len: data.len(),
            data: hex::encode(data),
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        Ok(line)
    }
}

impl<W> Sink for JsonLinesSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn write<'a>(
        &'a self,
        data: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let line = self.encode(data)?;
            let mut writer = self.writer.lock().await;
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        })
    }
}

/// In-memory sink that accumulates everything written to it.
#[derive(Default)]
pub struct MemorySink {
    buf: Mutex<Vec<u8>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all bytes written so far.
    pub async fn contents(&self) -> Vec<u8> {
        self.buf.lock().await.clone()
    }
}

impl Sink for MemorySink {
    fn write<'a>(
        &'a self,
        data: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.buf.lock().await.extend_from_slice(data);
            Ok(())
        })
    }
}
