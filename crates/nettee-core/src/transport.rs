//! Transport endpoints: listen, accept and dial over TCP or UDP.
//!
//! Every connection is handed to the relay as a [`BoxedStream`], so the relay
//! never needs to know which protocol produced it.

use crate::error::{TeeError, TeeResult};
use crate::udp::{UdpConnStream, UdpListener, UdpShutdown};
use serde::Deserialize;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

/// Wire protocol for both the listening and the dialed side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = TeeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(TeeError::Config(format!("unknown protocol: {other}"))),
        }
    }
}

/// A host and port. The host may be a name, an IPv4 literal or a bare IPv6
/// literal (no brackets); an empty host is not valid here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    fn as_pair(&self) -> (&str, u16) {
        (self.host.as_str(), self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Anything the relay can copy bytes through.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn ByteStream>;

/// The engine's bound listening socket.
pub enum Listener {
    Tcp(TcpListener),
    Udp(UdpListener),
}

impl Listener {
    /// Bind the local endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`TeeError::Bind`] carrying the endpoint and the OS error.
    pub async fn bind(protocol: Protocol, endpoint: &Endpoint) -> TeeResult<Self> {
        let result = match protocol {
            Protocol::Tcp => TcpListener::bind(endpoint.as_pair()).await.map(Listener::Tcp),
            Protocol::Udp => UdpListener::bind(endpoint.as_pair()).await.map(Listener::Udp),
        };
        result.map_err(|source| TeeError::Bind {
            addr: endpoint.to_string(),
            source,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Listener::Tcp(l) => l.local_addr(),
            Listener::Udp(l) => Ok(l.local_addr()),
        }
    }

    /// Wait for the next inbound connection (or, for UDP, a new peer).
    pub async fn accept(&mut self) -> io::Result<(BoxedStream, SocketAddr)> {
        match self {
            Listener::Tcp(l) => {
                let (stream, peer) = l.accept().await?;
                let _ = stream.set_nodelay(true);
                let stream: BoxedStream = Box::new(stream);
                Ok((stream, peer))
            }
            Listener::Udp(l) => {
                let (stream, peer) = l.accept().await?;
                let stream: BoxedStream = Box::new(stream);
                Ok((stream, peer))
            }
        }
    }

    /// Stop accepting. A TCP port is released right away; a UDP port once
    /// the returned handle is finished.
    pub fn close(self) -> ListenerShutdown {
        match self {
            Listener::Tcp(l) => {
                drop(l);
                ListenerShutdown(None)
            }
            Listener::Udp(l) => ListenerShutdown(Some(l.close())),
        }
    }
}

/// Whatever a closed [`Listener`] still runs in the background.
pub struct ListenerShutdown(Option<UdpShutdown>);

impl ListenerShutdown {
    /// Release the listening socket. Call once every accepted stream is gone.
    pub async fn finish(self) {
        if let Some(udp) = self.0 {
            udp.finish().await;
        }
    }
}

/// Open an outbound connection to `endpoint`.
///
/// # Errors
///
/// Returns [`TeeError::Dial`] if resolution or connection fails.
pub async fn dial(protocol: Protocol, endpoint: &Endpoint) -> TeeResult<BoxedStream> {
    let result: io::Result<BoxedStream> = match protocol {
        Protocol::Tcp => TcpStream::connect(endpoint.as_pair())
            .await
            .map(|stream| {
                let _ = stream.set_nodelay(true);
                Box::new(stream) as BoxedStream
            }),
        Protocol::Udp => dial_udp(endpoint).await,
    };
    result.map_err(|source| TeeError::Dial {
        addr: endpoint.to_string(),
        source,
    })
}

async fn dial_udp(endpoint: &Endpoint) -> io::Result<BoxedStream> {
    let remote = tokio::net::lookup_host(endpoint.as_pair())
        .await?
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses for {endpoint}"),
            )
        })?;
    let stream = UdpConnStream::connect(remote).await?;
    Ok(Box::new(stream) as BoxedStream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_protocol_parse() {
        assert_eq!("tcp".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("UDP".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert!("sctp".parse::<Protocol>().is_err());
        assert_eq!(Protocol::Udp.to_string(), "udp");
    }

    #[test]
    fn test_endpoint_display_brackets_ipv6() {
        assert_eq!(Endpoint::new("127.0.0.1", 80).to_string(), "127.0.0.1:80");
        assert_eq!(Endpoint::new("::1", 8080).to_string(), "[::1]:8080");
    }

    #[tokio::test]
    async fn test_tcp_listen_accept_dial() {
        let mut listener = Listener::bind(Protocol::Tcp, &Endpoint::new("127.0.0.1", 0))
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();

        let accept = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut out = dial(Protocol::Tcp, &Endpoint::new("127.0.0.1", port))
            .await
            .unwrap();
        out.write_all(b"ping").await.unwrap();
        assert_eq!(&accept.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_error() {
        let first = Listener::bind(Protocol::Tcp, &Endpoint::new("127.0.0.1", 0))
            .await
            .unwrap();
        let port = first.local_addr().unwrap().port();

        let err = Listener::bind(Protocol::Tcp, &Endpoint::new("127.0.0.1", port))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TeeError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_dial_refused_is_dial_error() {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let err = dial(Protocol::Tcp, &Endpoint::new("127.0.0.1", port))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TeeError::Dial { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_close_releases_port() {
        for protocol in [Protocol::Tcp, Protocol::Udp] {
            let listener = Listener::bind(protocol, &Endpoint::new("127.0.0.1", 0))
                .await
                .unwrap();
            let port = listener.local_addr().unwrap().port();

            listener.close().finish().await;
            let again = Listener::bind(protocol, &Endpoint::new("127.0.0.1", port)).await;
            assert!(again.is_ok(), "{protocol} port {port} still bound");
        }
    }
}
