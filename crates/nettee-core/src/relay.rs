//! One relayed connection pair.
//!
//! A [`Relay`] owns an inbound stream (from the client) and an outbound stream
//! (to the remote), and runs two copy tasks:
//!
//! - **forward**: inbound → outbound, duplicated into the send sink
//! - **reverse**: outbound → inbound, duplicated into the receive sink
//!
//! Each direction ends on its own. End-of-stream is propagated as a write
//! shutdown on the destination, so the peer sees the half-close and can
//! finish its side. A direction that ends with an error raises the shared
//! abort flag, and its sibling stops at its next read or write. Both streams
//! are closed, and the admission token returned, only once both tasks are done.
//!
//! The idle timeout covers the relay as a whole: bytes moving in either
//! direction keep both directions alive.

use crate::error::TeeError;
use crate::gate::AdmissionToken;
use crate::sink::Sink;
use crate::transport::BoxedStream;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Copy buffer size per direction.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Which way bytes flow through a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client → remote.
    Forward,
    /// Remote → client.
    Reverse,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => f.write_str("forward"),
            Direction::Reverse => f.write_str("reverse"),
        }
    }
}

/// Tunables shared by every relay an engine spawns.
#[derive(Debug, Clone, Copy)]
pub struct RelayOptions {
    /// End the relay once neither direction has moved bytes for this long.
    pub idle_timeout: Option<Duration>,
    pub buffer_size: usize,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// How a direction finished.
#[derive(Debug)]
pub enum DirectionEnd {
    /// The source reached end-of-stream.
    Eof,
    Failed(TeeError),
}

#[derive(Debug)]
pub struct DirectionReport {
    pub direction: Direction,
    /// Bytes forwarded to the destination and duplicated to the sink.
    pub bytes: u64,
    pub end: DirectionEnd,
}

/// Summary of a finished relay.
#[derive(Debug)]
pub struct RelayReport {
    pub id: u64,
    pub forward: DirectionReport,
    pub reverse: DirectionReport,
}

/// A connection pair ready to be relayed.
pub struct Relay {
    id: u64,
    inbound: BoxedStream,
    outbound: BoxedStream,
    send_sink: Arc<dyn Sink>,
    recv_sink: Arc<dyn Sink>,
    options: RelayOptions,
}

impl Relay {
    pub fn new(
        id: u64,
        inbound: BoxedStream,
        outbound: BoxedStream,
        send_sink: Arc<dyn Sink>,
        recv_sink: Arc<dyn Sink>,
        options: RelayOptions,
    ) -> Self {
        Self {
            id,
            inbound,
            outbound,
            send_sink,
            recv_sink,
            options,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Relay until both directions finish, then close both streams and
    /// release `token`.
    pub async fn run(self, token: AdmissionToken) -> RelayReport {
        let Relay {
            id,
            inbound,
            outbound,
            send_sink,
            recv_sink,
            options,
        } = self;

        let (in_read, in_write) = tokio::io::split(inbound);
        let (out_read, out_write) = tokio::io::split(outbound);
        let (abort_tx, abort_rx) = watch::channel(false);
        let abort_tx = Arc::new(abort_tx);
        let idle = options.idle_timeout.map(|limit| Arc::new(IdleClock::new(limit)));

        let forward = tokio::spawn(tee_copy(
            id,
            Direction::Forward,
            in_read,
            out_write,
            send_sink,
            options.buffer_size,
            idle.clone(),
            abort_tx.clone(),
            abort_rx.clone(),
        ));
        let reverse = tokio::spawn(tee_copy(
            id,
            Direction::Reverse,
            out_read,
            in_write,
            recv_sink,
            options.buffer_size,
            idle,
            abort_tx,
            abort_rx,
        ));

        // Each task drops its halves on return; the second one to finish
        // closes the underlying streams.
        let forward = join_direction(forward, Direction::Forward).await;
        let reverse = join_direction(reverse, Direction::Reverse).await;
        drop(token);

        info!(
            relay_id = id,
            bytes_sent = forward.bytes,
            bytes_received = reverse.bytes,
            "relay closed"
        );

        RelayReport {
            id,
            forward,
            reverse,
        }
    }
}

async fn join_direction(
    handle: JoinHandle<DirectionReport>,
    direction: Direction,
) -> DirectionReport {
    match handle.await {
        Ok(report) => report,
        Err(e) => DirectionReport {
            direction,
            bytes: 0,
            end: DirectionEnd::Failed(TeeError::Io(std::io::Error::other(e.to_string()))),
        },
    }
}

/// Raises the abort flag when dropped unless disarmed, so a direction that
/// fails (or panics) always releases its sibling.
struct AbortOnDrop {
    tx: Arc<watch::Sender<bool>>,
    armed: bool,
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.tx.send_replace(true);
        }
    }
}

/// Resolves once the abort flag is raised.
async fn aborted(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Last time either direction of a relay moved bytes.
struct IdleClock {
    limit: Duration,
    start: Instant,
    /// Nanoseconds after `start`.
    last: AtomicU64,
}

impl IdleClock {
    fn new(limit: Duration) -> Self {
        Self {
            limit,
            start: Instant::now(),
            last: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.start.elapsed().as_nanos() as u64;
        self.last.fetch_max(now, Ordering::Relaxed);
    }

    fn deadline(&self) -> Instant {
        self.start + Duration::from_nanos(self.last.load(Ordering::Relaxed)) + self.limit
    }
}

async fn read_chunk<R>(
    src: &mut R,
    buf: &mut [u8],
    idle: Option<&IdleClock>,
) -> Result<usize, TeeError>
where
    R: AsyncRead + Unpin,
{
    let Some(clock) = idle else {
        return Ok(src.read(buf).await?);
    };

    let read = src.read(buf);
    tokio::pin!(read);
    loop {
        let deadline = clock.deadline();
        tokio::select! {
            n = &mut read => {
                let n = n?;
                if n > 0 {
                    clock.touch();
                }
                return Ok(n);
            }
            _ = tokio::time::sleep_until(deadline) => {
                // The sibling may have moved bytes while this read waited.
                if clock.deadline() <= Instant::now() {
                    return Err(TeeError::IdleTimeout);
                }
            }
        }
    }
}

/// Copy `src` to `dst`, duplicating every chunk into `sink` after it was
/// delivered, until end-of-stream, an error, or the sibling aborts.
async fn copy_loop<R, W>(
    src: &mut R,
    dst: &mut W,
    sink: &dyn Sink,
    buf: &mut [u8],
    idle: Option<&IdleClock>,
    abort_rx: &mut watch::Receiver<bool>,
    bytes: &mut u64,
) -> Result<(), TeeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let n = tokio::select! {
            _ = aborted(abort_rx) => return Err(TeeError::Aborted),
            read = read_chunk(src, buf, idle) => read?,
        };
        if n == 0 {
            return Ok(());
        }

        tokio::select! {
            _ = aborted(abort_rx) => return Err(TeeError::Aborted),
            written = dst.write_all(&buf[..n]) => written?,
        }
        *bytes += n as u64;

        sink.write(&buf[..n]).await.map_err(TeeError::Sink)?;
    }
}

/// One direction of a relay: runs [`copy_loop`], then shuts down the
/// destination's write side and reports how it ended.
#[allow(clippy::too_many_arguments)]
async fn tee_copy<R, W>(
    relay_id: u64,
    direction: Direction,
    mut src: R,
    mut dst: W,
    sink: Arc<dyn Sink>,
    buffer_size: usize,
    idle: Option<Arc<IdleClock>>,
    abort_tx: Arc<watch::Sender<bool>>,
    mut abort_rx: watch::Receiver<bool>,
) -> DirectionReport
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut guard = AbortOnDrop {
        tx: abort_tx,
        armed: true,
    };
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut bytes: u64 = 0;

    let result = copy_loop(
        &mut src,
        &mut dst,
        sink.as_ref(),
        &mut buf,
        idle.as_deref(),
        &mut abort_rx,
        &mut bytes,
    )
    .await;

    let _ = dst.shutdown().await;

    let end = match result {
        Ok(()) => {
            guard.armed = false;
            debug!(relay_id, %direction, bytes, "source closed");
            DirectionEnd::Eof
        }
        Err(e) => {
            match &e {
                TeeError::Sink(_) => warn!(relay_id, %direction, error = %e, "sink write failed"),
                _ => debug!(relay_id, %direction, error = %e, "direction ended"),
            }
            DirectionEnd::Failed(e)
        }
    };
    drop(guard);

    DirectionReport {
        direction,
        bytes,
        end,
    }
}
