//! UDP treated as a byte stream.
//!
//! Datagram sockets have no connections, so both ends are adapters:
//!
//! - [`UdpConnStream`] is the dialed side: an ephemeral socket `connect`ed to
//!   one remote address.
//! - [`UdpListener`] owns the bound socket and a dispatch task. The first
//!   datagram from an unknown source becomes a [`UdpPeerStream`] returned by
//!   [`UdpListener::accept`]; later datagrams from that source are queued to it.
//!
//! Neither side ever reports end-of-stream on its own. Ordering and delivery
//! are whatever the network provides.
//!
//! Closing a listener is two steps: [`UdpListener::close`] stops admitting
//! peers, and [`UdpShutdown::finish`] stops the dispatcher once the accepted
//! peers are done, which releases the port.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

/// Largest datagram the dispatcher will receive in one call.
const MAX_DATAGRAM: usize = 65536;

/// Datagrams buffered per peer before new ones are dropped.
const PEER_QUEUE: usize = 256;

/// New peers waiting for `accept` before their first datagram is dropped.
const ACCEPT_BACKLOG: usize = 128;

type Accepted = (UdpPeerStream, SocketAddr);

/// Bound UDP socket that hands out one stream per remote peer.
pub struct UdpListener {
    local_addr: SocketAddr,
    incoming: mpsc::Receiver<Accepted>,
    shutdown: UdpShutdown,
}

impl UdpListener {
    /// Bind `addr` and start the dispatch task.
    pub async fn bind(addr: (&str, u16)) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let (accept_tx, incoming) = mpsc::channel(ACCEPT_BACKLOG);
        let (stop, stop_rx) = oneshot::channel();

        let dispatcher = Dispatcher::new(socket, accept_tx);
        let task = tokio::spawn(dispatcher.run(stop_rx));

        Ok(Self {
            local_addr,
            incoming,
            shutdown: UdpShutdown { stop, task },
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for a datagram from a peer that has no stream yet.
    pub async fn accept(&mut self) -> io::Result<Accepted> {
        self.incoming
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "udp dispatcher stopped"))
    }

    /// Stop admitting new peers.
    ///
    /// Peers that were already accepted keep receiving their datagrams until
    /// [`UdpShutdown::finish`] is called. Dropping the returned handle instead
    /// stops the dispatcher without waiting for it.
    pub fn close(self) -> UdpShutdown {
        // Dropping the receiver also drops peers queued but never accepted.
        drop(self.incoming);
        self.shutdown
    }
}

/// The dispatch task of a closed [`UdpListener`].
pub struct UdpShutdown {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl UdpShutdown {
    /// Stop the dispatcher and wait until it has released the socket.
    ///
    /// The port is free once this returns and every peer stream handed out
    /// by the listener has been dropped.
    pub async fn finish(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.task.await {
            debug!(error = %e, "udp dispatcher ended abnormally");
        }
    }
}

/// Routes datagrams from the shared socket to per-peer queues.
struct Dispatcher {
    socket: Arc<UdpSocket>,
    accept_tx: mpsc::Sender<Accepted>,
    peers: HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>,
}

impl Dispatcher {
    fn new(socket: Arc<UdpSocket>, accept_tx: mpsc::Sender<Accepted>) -> Self {
        Self {
            socket,
            accept_tx,
            peers: HashMap::new(),
        }
    }

    /// Runs until `stop` fires or its sender is dropped.
    async fn run(mut self, mut stop: oneshot::Receiver<()>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let socket = self.socket.clone();

        loop {
            let received = tokio::select! {
                biased;
                _ = &mut stop => break,
                result = socket.recv_from(&mut buf) => result,
            };

            match received {
                Ok((n, peer)) => self.route(buf[..n].to_vec(), peer),
                Err(e) => debug!(error = %e, "udp recv failed"),
            }
        }

        debug!(peers = self.peers.len(), "udp dispatcher stopped");
    }

    /// Queue `datagram` to its peer's stream, admitting the peer if it is new.
    fn route(&mut self, mut datagram: Vec<u8>, peer: SocketAddr) {
        if let Some(tx) = self.peers.get(&peer) {
            match tx.try_send(datagram) {
                Ok(()) => return,
                Err(TrySendError::Full(_)) => {
                    debug!(peer = %peer, "peer queue full, dropping datagram");
                    return;
                }
                Err(TrySendError::Closed(returned)) => {
                    // Stream for this peer already ended; treat as a new peer.
                    self.peers.remove(&peer);
                    datagram = returned;
                }
            }
        }

        if self.accept_tx.is_closed() {
            return;
        }

        // Forget peers whose streams were dropped since the last admission.
        self.peers.retain(|_, tx| !tx.is_closed());

        let (tx, rx) = mpsc::channel(PEER_QUEUE);
        let _ = tx.try_send(datagram);
        let stream = UdpPeerStream {
            socket: self.socket.clone(),
            peer,
            rx,
            pending: Vec::new(),
            offset: 0,
        };
        match self.accept_tx.try_send((stream, peer)) {
            Ok(()) => {
                self.peers.insert(peer, tx);
            }
            Err(_) => debug!(peer = %peer, "accept backlog full, dropping datagram"),
        }
    }
}

/// Listener-side stream for one remote peer.
pub struct UdpPeerStream {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
    offset: usize,
}

impl UdpPeerStream {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl AsyncRead for UdpPeerStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        while this.offset >= this.pending.len() {
            match ready!(this.rx.poll_recv(cx)) {
                Some(datagram) => {
                    this.pending = datagram;
                    this.offset = 0;
                }
                None => return Poll::Ready(Ok(())),
            }
        }

        let n = buf.remaining().min(this.pending.len() - this.offset);
        buf.put_slice(&this.pending[this.offset..this.offset + n]);
        this.offset += n;
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for UdpPeerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.socket.poll_send_to(cx, buf, self.peer)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Dialed side: a socket connected to a single remote address.
pub struct UdpConnStream {
    socket: UdpSocket,
}

impl UdpConnStream {
    /// Bind an ephemeral socket of `remote`'s family and connect it.
    pub async fn connect(remote: SocketAddr) -> io::Result<Self> {
        let local: SocketAddr = if remote.is_ipv4() {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        Ok(Self { socket })
    }
}

impl AsyncRead for UdpConnStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        // Skip empty datagrams; a zero-length read would look like EOF.
        loop {
            let before = buf.filled().len();
            ready!(self.socket.poll_recv(cx, buf))?;
            if buf.filled().len() > before || buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }
        }
    }
}

impl AsyncWrite for UdpConnStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
impl UdpListener {
    /// A bound listener whose dispatcher has already exited.
    pub(crate) async fn bind_stopped(addr: (&str, u16)) -> io::Result<Self> {
        let UdpListener {
            local_addr,
            incoming,
            shutdown,
        } = Self::bind(addr).await?;
        shutdown.finish().await;

        let (stop, _) = oneshot::channel();
        Ok(Self {
            local_addr,
            incoming,
            shutdown: UdpShutdown {
                stop,
                task: tokio::spawn(async {}),
            },
        })
    }
}
