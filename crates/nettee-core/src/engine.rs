//! The relay engine: listen, dial, admit, spawn, drain.
//!
//! ```text
//! Idle → Listening → { Accepting ⇄ Relaying(n) } → Draining → Stopped
//! ```
//!
//! Each loop iteration dials the remote first and only then accepts the
//! inbound connection to pair with it, so an unreachable remote stops the
//! engine instead of failing clients one by one. Draining stops accepting,
//! waits for every spawned relay to finish on its own, then releases the
//! listening port.

use crate::config::RelayConfig;
use crate::error::{TeeError, TeeResult};
use crate::gate::AdmissionGate;
use crate::relay::{Relay, RelayReport};
use crate::sink::Sink;
use crate::transport::{self, Listener};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

/// Observable engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Listening,
    /// Waiting for the next dial + accept.
    Accepting,
    /// A relay was just spawned; `n` relays are in flight.
    Relaying(usize),
    /// Listener closed, waiting for in-flight relays.
    Draining,
    Stopped,
}

pub struct RelayEngine {
    config: RelayConfig,
    send_sink: Arc<dyn Sink>,
    recv_sink: Arc<dyn Sink>,
    gate: AdmissionGate,
    state: watch::Sender<EngineState>,
    listener: Option<Listener>,
    next_relay_id: u64,
}

impl RelayEngine {
    /// Create an idle engine. Nothing is bound until [`bind`](Self::bind) or
    /// [`run`](Self::run).
    ///
    /// # Arguments
    ///
    /// * `config` - Endpoints, protocol and admission settings.
    /// * `send_sink` - Receives a copy of every byte clients send.
    /// * `recv_sink` - Receives a copy of every byte the remote sends back.
    pub fn new(config: RelayConfig, send_sink: Arc<dyn Sink>, recv_sink: Arc<dyn Sink>) -> Self {
        let gate = AdmissionGate::new(config.max_connections);
        let (state, _) = watch::channel(EngineState::Idle);
        Self {
            config,
            send_sink,
            recv_sink,
            gate,
            state,
            listener: None,
            next_relay_id: 1,
        }
    }

    /// Bind the local endpoint now and return the address actually bound.
    ///
    /// Calling it again returns the existing address.
    pub async fn bind(&mut self) -> TeeResult<SocketAddr> {
        if let Some(listener) = &self.listener {
            return Ok(listener.local_addr()?);
        }
        let listener = self.open_listener().await?;
        let addr = listener.local_addr()?;
        self.listener = Some(listener);
        Ok(addr)
    }

    /// Address of the bound listener, if bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    /// Handle on the admission gate, for instrumentation.
    pub fn gate(&self) -> AdmissionGate {
        self.gate.clone()
    }

    /// Run until the loop ends, then wait for all relays to finish.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped the engine: [`TeeError::Bind`] before
    /// anything was accepted, or [`TeeError::Dial`] / [`TeeError::Accept`] /
    /// [`TeeError::GateClosed`] from the accept loop. In the latter case every
    /// relay admitted so far has finished before the error is returned.
    ///
    /// The listening port is released before this returns.
    pub async fn run(mut self) -> TeeResult<()> {
        let mut listener = match self.listener.take() {
            Some(listener) => listener,
            None => match self.open_listener().await {
                Ok(listener) => listener,
                Err(e) => {
                    self.set_state(EngineState::Stopped);
                    return Err(e);
                }
            },
        };

        let mut relays = JoinSet::new();
        let terminal = self.accept_loop(&mut listener, &mut relays).await;

        let shutdown = listener.close();
        self.set_state(EngineState::Draining);
        info!(in_flight = relays.len(), "listener closed, draining");

        while let Some(joined) = relays.join_next().await {
            reap(joined);
        }
        shutdown.finish().await;

        self.set_state(EngineState::Stopped);
        match terminal {
            Some(e) => {
                info!(error = %e, "engine stopped");
                Err(e)
            }
            None => {
                info!("engine stopped");
                Ok(())
            }
        }
    }

    async fn open_listener(&self) -> TeeResult<Listener> {
        self.config.validate()?;
        let listener = Listener::bind(self.config.protocol, &self.config.bind).await?;
        let local = listener.local_addr()?;
        self.set_state(EngineState::Listening);
        info!(
            protocol = %self.config.protocol,
            addr = %local,
            remote = %self.config.remote,
            max_connections = self.config.max_connections,
            "listening"
        );
        Ok(listener)
    }

    /// Returns the fatal error that ended the loop, or `None` when a
    /// single-shot run finished its one admission.
    async fn accept_loop(
        &mut self,
        listener: &mut Listener,
        relays: &mut JoinSet<RelayReport>,
    ) -> Option<TeeError> {
        let single_shot = self.config.single_shot();
        let options = self.config.relay_options();

        loop {
            self.set_state(EngineState::Accepting);

            let outbound = match transport::dial(self.config.protocol, &self.config.remote).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "remote unreachable, no longer accepting");
                    return Some(e);
                }
            };

            let (inbound, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    drop(outbound);
                    warn!(error = %e, "accept failed, no longer accepting");
                    return Some(TeeError::Accept(e));
                }
            };

            let token = match self.gate.acquire().await {
                Ok(token) => token,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "admission gate closed, no longer accepting");
                    return Some(e);
                }
            };

            let id = self.next_relay_id;
            self.next_relay_id += 1;
            info!(relay_id = id, peer = %peer, remote = %self.config.remote, "relay opened");

            let relay = Relay::new(
                id,
                inbound,
                outbound,
                self.send_sink.clone(),
                self.recv_sink.clone(),
                options,
            );
            relays.spawn(relay.run(token));

            while let Some(joined) = relays.try_join_next() {
                reap(joined);
            }
            self.set_state(EngineState::Relaying(relays.len()));

            if single_shot {
                return None;
            }
        }
    }

    fn set_state(&self, state: EngineState) {
        debug!(?state, "engine state");
        self.state.send_replace(state);
    }
}

fn reap(joined: Result<RelayReport, JoinError>) {
    match joined {
        Ok(report) => debug!(relay_id = report.id, "relay reaped"),
        Err(e) => warn!(error = %e, "relay task failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use crate::transport::{Endpoint, Protocol};
    use crate::udp::UdpListener;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream, UdpSocket};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    /// TCP echo server that answers until the peer half-closes.
    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut rd, mut wr) = stream.into_split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                    let _ = wr.shutdown().await;
                });
            }
        });
        addr
    }

    fn tcp_config(remote: SocketAddr) -> RelayConfig {
        RelayConfig::new(
            Endpoint::new("127.0.0.1", 0),
            Endpoint::new("127.0.0.1", remote.port()),
        )
    }

    struct Running {
        addr: SocketAddr,
        gate: AdmissionGate,
        state: watch::Receiver<EngineState>,
        handle: JoinHandle<TeeResult<()>>,
        send: Arc<MemorySink>,
        recv: Arc<MemorySink>,
    }

    async fn start(config: RelayConfig) -> Running {
        let send = Arc::new(MemorySink::new());
        let recv = Arc::new(MemorySink::new());
        let mut engine = RelayEngine::new(config, send.clone(), recv.clone());
        let addr = engine.bind().await.unwrap();
        assert_eq!(engine.local_addr(), Some(addr));
        let gate = engine.gate();
        let state = engine.subscribe();
        let handle = tokio::spawn(engine.run());
        Running {
            addr,
            gate,
            state,
            handle,
            send,
            recv,
        }
    }

    #[tokio::test]
    async fn test_ping_round_trip_and_tee() {
        let echo = echo_server().await;
        let mut run = start(tcp_config(echo)).await;

        let mut client = TcpStream::connect(run.addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        client.shutdown().await.unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"ping");

        let result = timeout(Duration::from_secs(5), &mut run.handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(run.send.contents().await, b"ping");
        assert_eq!(run.recv.contents().await, b"ping");
        assert_eq!(*run.state.borrow(), EngineState::Stopped);
        assert_eq!(run.gate.active(), 0);
    }

    #[tokio::test]
    async fn test_single_shot_stops_accepting_but_finishes_relay() {
        let echo = echo_server().await;
        let mut run = start(tcp_config(echo)).await;

        let mut client = TcpStream::connect(run.addr).await.unwrap();
        client.write_all(b"first").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"first");

        timeout(
            Duration::from_secs(2),
            run.state.wait_for(|s| *s == EngineState::Draining),
        )
        .await
        .unwrap()
        .unwrap();

        // The listener is gone, so a second client is refused.
        assert!(TcpStream::connect(run.addr).await.is_err());

        // The first relay still works while draining.
        client.write_all(b"again").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"again");
        assert!(!run.handle.is_finished());

        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();

        timeout(Duration::from_secs(5), &mut run.handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(run.send.contents().await, b"firstagain");
        assert_eq!(run.gate.peak(), 1);
    }

    #[tokio::test]
    async fn test_graceful_drain_waits_for_relay() {
        let echo = echo_server().await;
        let mut run = start(tcp_config(echo)).await;

        let mut client = TcpStream::connect(run.addr).await.unwrap();
        client.write_all(b"a").await.unwrap();
        let mut buf = [0u8; 1];
        client.read_exact(&mut buf).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!run.handle.is_finished(), "run must wait for the open relay");
        assert_eq!(run.gate.active(), 1);

        drop(client);
        timeout(Duration::from_secs(5), &mut run.handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(run.gate.active(), 0);
    }

    #[tokio::test]
    async fn test_admission_bound_respected() {
        let echo = echo_server().await;
        let mut config = tcp_config(echo);
        config.max_connections = 2;
        let run = start(config).await;

        let mut clients = Vec::new();
        for i in 0..6 {
            let addr = run.addr;
            clients.push(tokio::spawn(async move {
                let mut stream = TcpStream::connect(addr).await.unwrap();
                let msg = format!("client-{i}");
                stream.write_all(msg.as_bytes()).await.unwrap();
                let mut buf = vec![0u8; msg.len()];
                stream.read_exact(&mut buf).await.unwrap();
                assert_eq!(buf, msg.as_bytes());
                tokio::time::sleep(Duration::from_millis(30)).await;
                stream.shutdown().await.unwrap();
                let mut rest = Vec::new();
                stream.read_to_end(&mut rest).await.unwrap();
                msg.len()
            }));
        }

        let mut total = 0;
        for client in clients {
            total += timeout(Duration::from_secs(10), client)
                .await
                .unwrap()
                .unwrap();
        }

        assert!(run.gate.peak() <= 2, "peak was {}", run.gate.peak());
        assert!(run.gate.peak() >= 1);
        assert_eq!(run.send.contents().await.len(), total);
        assert_eq!(run.recv.contents().await.len(), total);
        run.handle.abort();
    }

    #[tokio::test]
    async fn test_unbounded_mode_never_blocks() {
        let echo = echo_server().await;
        let mut config = tcp_config(echo);
        config.keep_listening = true;
        let run = start(config).await;

        let mut streams = Vec::new();
        for i in 0..4u8 {
            let mut stream = TcpStream::connect(run.addr).await.unwrap();
            stream.write_all(&[i]).await.unwrap();
            let mut buf = [0u8; 1];
            timeout(Duration::from_secs(2), stream.read_exact(&mut buf))
                .await
                .expect("relay should be admitted without waiting")
                .unwrap();
            assert_eq!(buf[0], i);
            streams.push(stream);
        }

        assert_eq!(run.gate.active(), 4);
        assert_eq!(run.gate.capacity(), None);
        run.handle.abort();
    }

    #[tokio::test]
    async fn test_unreachable_remote_is_fatal() {
        let closed_port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let config = RelayConfig::new(
            Endpoint::new("127.0.0.1", 0),
            Endpoint::new("127.0.0.1", closed_port),
        );
        let mut engine = RelayEngine::new(
            config,
            Arc::new(MemorySink::new()),
            Arc::new(MemorySink::new()),
        );
        let addr = engine.bind().await.unwrap();
        let gate = engine.gate();
        let state = engine.subscribe();

        // Queued in the backlog but never paired with a dial.
        let _pending = TcpStream::connect(addr).await.unwrap();

        let err = timeout(Duration::from_secs(5), engine.run())
            .await
            .expect("run must not hang")
            .unwrap_err();
        assert!(matches!(err, TeeError::Dial { .. }));
        assert!(err.is_fatal());
        assert_eq!(*state.borrow(), EngineState::Stopped);
        assert_eq!(gate.peak(), 0);
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let config = RelayConfig::new(
            Endpoint::new("127.0.0.1", port),
            Endpoint::new("127.0.0.1", 9),
        );
        let engine = RelayEngine::new(
            config,
            Arc::new(MemorySink::new()),
            Arc::new(MemorySink::new()),
        );
        let state = engine.subscribe();

        let err = engine.run().await.unwrap_err();
        assert!(matches!(err, TeeError::Bind { .. }));
        assert_eq!(*state.borrow(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_udp_single_shot_relay() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((n, from)) = echo.recv_from(&mut buf).await {
                let _ = echo.send_to(&buf[..n], from).await;
            }
        });

        let mut config = RelayConfig::new(
            Endpoint::new("127.0.0.1", 0),
            Endpoint::new("127.0.0.1", echo_addr.port()),
        );
        config.protocol = Protocol::Udp;
        config.idle_timeout = Some(Duration::from_millis(200));
        let mut run = start(config).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"ping", run.addr).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, run.addr);

        // Datagram peers never close; the idle timeout ends the relay.
        timeout(Duration::from_secs(5), &mut run.handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(run.send.contents().await, b"ping");
        assert_eq!(run.recv.contents().await, b"ping");

        // The dispatcher is gone by the time run returns.
        UdpSocket::bind(run.addr)
            .await
            .expect("listening port should be released");
    }

    #[tokio::test]
    async fn test_accept_failure_closes_outbound_and_is_fatal() {
        let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut engine = RelayEngine::new(
            tcp_config(remote.local_addr().unwrap()),
            Arc::new(MemorySink::new()),
            Arc::new(MemorySink::new()),
        );
        let listener = UdpListener::bind_stopped(("127.0.0.1", 0)).await.unwrap();
        engine.listener = Some(Listener::Udp(listener));
        let state = engine.subscribe();
        let gate = engine.gate();
        let handle = tokio::spawn(engine.run());

        // The dial succeeds, the accept does not, and the dialed stream is closed.
        let (mut dialed, _) = timeout(Duration::from_secs(2), remote.accept())
            .await
            .unwrap()
            .unwrap();
        let mut rest = Vec::new();
        let n = timeout(Duration::from_secs(2), dialed.read_to_end(&mut rest))
            .await
            .expect("outbound should be closed")
            .unwrap();
        assert_eq!(n, 0);

        let err = timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, TeeError::Accept(_)));
        assert_eq!(*state.borrow(), EngineState::Stopped);
        assert_eq!(gate.peak(), 0);
    }

    #[tokio::test]
    async fn test_closed_gate_stops_engine() {
        let echo = echo_server().await;
        let mut config = tcp_config(echo);
        config.max_connections = 1;
        let mut engine = RelayEngine::new(
            config,
            Arc::new(MemorySink::new()),
            Arc::new(MemorySink::new()),
        );
        let addr = engine.bind().await.unwrap();
        engine.gate().close();
        let handle = tokio::spawn(engine.run());

        // The pair is formed, then dropped unadmitted.
        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut rest = Vec::new();
        timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();

        let err = timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, TeeError::GateClosed));
        assert!(err.is_fatal());
    }
}
