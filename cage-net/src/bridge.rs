//! The bridge between the userspace stack and host-shaped connections.
//!
//! Egress flows (created by the workload) are matched against a route table
//! and delivered to listeners registered with [`Bridge::listen`]. Ingress
//! connections are fabricated with [`Bridge::dial`], which binds an
//! arbitrary workload-visible source address thanks to the stack's spoofed
//! routing.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    Error, Result,
    addr::{NetAddr, Transport, parse_network_address},
    conn::{BridgeConn, TcpConn, UdpConn},
    network::Network,
    stack::{Command, ConnId, Ingress, Route, StackTx},
};

/// Default bound on connections queued per listener.
const DEFAULT_MAX_IN_FLIGHT: usize = 1 << 12;

/// Connects a [`Network`]'s stack to the process' real networking world.
///
/// The bridge holds a non-owning handle to the network's stack; it must not
/// outlive the network's usefulness, which in practice means the supervisor
/// tears bridge consumers down before the network.
pub struct Bridge {
    stack: StackTx,
    ingress: Arc<Ingress>,
    max_in_flight: usize,
    registered: AtomicBool,
}

impl Bridge {
    /// Create a bridge over a network that has been set up.
    pub fn new(network: &Network) -> Result<Self> {
        Ok(Self {
            stack: network.stack_tx()?,
            ingress: Arc::new(Ingress::default()),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            registered: AtomicBool::new(false),
        })
    }

    /// Override the per-listener queue bound.
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    /// Idempotent lazy init: hand the route table to the stack's gate.
    fn ensure_registered(&self) {
        if !self.registered.swap(true, Ordering::SeqCst) {
            self.stack.send(Command::RegisterIngress(Arc::clone(&self.ingress)));
            self.stack.kick();
        }
    }

    /// Register a route for egress connections.
    ///
    /// `network` is one or more `+`-joined transports (`"tcp"`, `"udp"`,
    /// `"tcp+udp"`); `address` is `"<ipv4-cidr>:<port>"` with port `0`
    /// matching any port. All transports share a single listener.
    ///
    /// Accepted TCP connections are handshake-deferred: the workload's SYN
    /// is answered only once the connection sees its first read or write.
    /// Shutting the connection down before that sends an RST instead, and
    /// ignoring it entirely lets the workload's handshake time out.
    pub fn listen(&self, network: &str, address: &str) -> Result<Listener> {
        self.ensure_registered();

        let (transports, cidr, port) = parse_network_address(network, address)?;

        let (conns_tx, conns_rx) = mpsc::channel(self.max_in_flight);
        let mut routes = self.ingress.routes.write();
        for transport in transports {
            routes.push(Route { transport, cidr, port, conns: conns_tx.clone() });
        }

        Ok(Listener::new(conns_rx))
    }

    /// Establish an ingress TCP or UDP connection from `local` to `remote`,
    /// both as the workload sees them. An endpoint should exist for `remote`
    /// inside the workload, otherwise UDP packets vanish silently and a TCP
    /// dial blocks until cancelled.
    pub async fn dial(
        &self,
        token: CancellationToken,
        local: NetAddr,
        remote: NetAddr,
    ) -> Result<BridgeConn> {
        self.ensure_registered();

        if local.transport != remote.transport {
            return Err(Error::TransportMismatch {
                local: local.transport,
                remote: remote.transport,
            });
        }
        let (SocketAddr::V4(laddr), SocketAddr::V4(raddr)) = (local.addr, remote.addr) else {
            return Err(Error::Ipv4Only);
        };

        match local.transport {
            Transport::Udp => self.dial_udp(laddr, raddr).await.map(BridgeConn::Udp),
            Transport::Tcp => self.dial_tcp(token, laddr, raddr).await.map(BridgeConn::Tcp),
        }
    }

    async fn dial_udp(
        &self,
        local: std::net::SocketAddrV4,
        remote: std::net::SocketAddrV4,
    ) -> Result<UdpConn> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let id = self.stack.alloc_id();
        self.stack.send(Command::DialUdp { id, local, remote, reply: reply_tx });
        self.stack.kick();
        reply_rx.await.map_err(|_| Error::Stack("stack task stopped".into()))?
    }

    async fn dial_tcp(
        &self,
        token: CancellationToken,
        local: std::net::SocketAddrV4,
        remote: std::net::SocketAddrV4,
    ) -> Result<TcpConn> {
        let (reply_tx, mut reply_rx) = oneshot::channel();
        let id = self.stack.alloc_id();
        self.stack.send(Command::DialTcp { id, local, remote, reply: reply_tx });
        self.stack.kick();

        // Aborts the in-flight handshake if this future is cancelled or
        // dropped (e.g. by a forwarder timeout).
        let mut guard = DialGuard { stack: &self.stack, id, armed: true };

        let result = tokio::select! {
            reply = &mut reply_rx => {
                reply.map_err(|_| Error::Stack("stack task stopped".into()))?
            }
            _ = token.cancelled() => Err(Error::Cancelled),
        };

        match result {
            Ok(conn) => {
                guard.armed = false;
                Ok(conn)
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(err) => {
                // The stack already cleaned up after a failed connect.
                guard.armed = false;
                Err(err)
            }
        }
    }
}

struct DialGuard<'a> {
    stack: &'a StackTx,
    id: ConnId,
    armed: bool,
}

impl Drop for DialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.stack.send(Command::AbortDial { conn: self.id });
            self.stack.kick();
        }
    }
}

/// The accepting end of one or more bridge routes.
///
/// Backed by a bounded FIFO fed by the stack's gate. Closing the listener is
/// idempotent; connections the gate tries to deliver afterwards are dropped
/// silently, and every subsequent [`accept`](Self::accept) fails with
/// [`Error::ListenerClosed`].
pub struct Listener {
    conns: Mutex<mpsc::Receiver<BridgeConn>>,
    closed: CancellationToken,
}

impl Listener {
    fn new(conns: mpsc::Receiver<BridgeConn>) -> Self {
        Self { conns: Mutex::new(conns), closed: CancellationToken::new() }
    }

    /// Wait for the next egress connection.
    pub async fn accept(&self) -> Result<BridgeConn> {
        if self.closed.is_cancelled() {
            return Err(Error::ListenerClosed);
        }
        let mut conns = self.conns.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(Error::ListenerClosed),
            conn = conns.recv() => conn.ok_or(Error::ListenerClosed),
        }
    }

    /// Close the listener. Idempotent; wakes pending accepts.
    pub fn close(&self) {
        self.closed.cancel();
        if let Ok(mut conns) = self.conns.try_lock() {
            conns.close();
        }
    }

    /// A listener stands for potentially many routes, so it has no single
    /// bound address.
    pub fn local_addr(&self) -> Option<NetAddr> {
        None
    }
}

#[cfg(test)]
mod tests {
    use std::{net::Ipv4Addr, sync::Arc, time::Duration};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::sync::CancellationToken;

    use super::Bridge;
    use crate::{
        Error, NetAddr,
        addr::Transport,
        network::{Network, NetworkConfig},
    };

    fn loopback_bridge() -> Bridge {
        let subnet = "192.168.1.0/24".parse().unwrap();
        let mut config = NetworkConfig::new(subnet, Ipv4Addr::new(192, 168, 1, 1));
        config.skip_netns = true;

        let mut network = Network::new(config);
        network.setup().unwrap();
        network.add_loopback().unwrap();
        Bridge::new(&network).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn udp_bridge_round_trip() {
        let _ = tracing_subscriber::fmt::try_init();

        let bridge = loopback_bridge();
        let listener = bridge.listen("udp", "192.168.1.40/29:128").unwrap();

        let mut client = bridge
            .dial(
                CancellationToken::new(),
                NetAddr::udp("192.168.1.2:0".parse().unwrap()),
                NetAddr::udp("192.168.1.42:128".parse().unwrap()),
            )
            .await
            .unwrap();

        client.write_all(b"ping").await.unwrap();

        let mut server = listener.accept().await.unwrap();
        assert_eq!(server.local_addr().to_string(), "192.168.1.42:128");

        let mut buf = [0u8; 1024];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        server.write_all(b"pong").await.unwrap();

        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");

        listener.close();
        assert!(matches!(listener.accept().await, Err(Error::ListenerClosed)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tcp_bridge_round_trip() {
        let _ = tracing_subscriber::fmt::try_init();

        let bridge = Arc::new(loopback_bridge());
        let listener = Arc::new(bridge.listen("tcp", "192.168.1.40/29:128").unwrap());

        let server = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move {
                let mut conn = listener.accept().await.unwrap();

                let mut buf = [0u8; 1024];
                let n = conn.read(&mut buf).await.unwrap();
                assert_eq!(&buf[..n], b"ping");

                conn.write_all(b"pong").await.unwrap();
                conn.shutdown().await.unwrap();
            })
        };

        let client = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move {
                let mut conn = bridge
                    .dial(
                        CancellationToken::new(),
                        NetAddr::tcp("192.168.1.2:0".parse().unwrap()),
                        NetAddr::tcp("192.168.1.42:128".parse().unwrap()),
                    )
                    .await
                    .unwrap();

                conn.write_all(b"ping").await.unwrap();

                let mut buf = [0u8; 1024];
                let n = conn.read(&mut buf).await.unwrap();
                assert_eq!(&buf[..n], b"pong");

                // The peer closed after "pong": the next read is a clean EOF.
                let n = conn.read(&mut buf).await.unwrap();
                assert_eq!(n, 0);

                conn.shutdown().await.unwrap();
            })
        };

        server.await.unwrap();
        client.await.unwrap();

        listener.close();
        listener.close(); // idempotent
        assert!(matches!(listener.accept().await, Err(Error::ListenerClosed)));
    }

    /// Route matching: transport equality, CIDR containment, port wildcard,
    /// and first-registered-wins on overlap.
    #[tokio::test(flavor = "multi_thread")]
    async fn route_matching() {
        let bridge = loopback_bridge();
        let _wide = bridge.listen("tcp", "192.168.1.0/24:0").unwrap();
        let _narrow = bridge.listen("tcp", "192.168.1.40/29:128").unwrap();

        let ip = Ipv4Addr::new(192, 168, 1, 42);
        let routes = bridge.ingress.routes.read();

        // Transport must match.
        assert!(bridge.ingress.match_route(Transport::Udp, ip, 128).is_none());

        // Both routes cover (ip, 128); the first registered wins.
        let matched = bridge.ingress.match_route(Transport::Tcp, ip, 128).unwrap();
        assert!(matched.same_channel(&routes[0].conns));

        // Port 0 routes match any port.
        let matched = bridge.ingress.match_route(Transport::Tcp, ip, 9999).unwrap();
        assert!(matched.same_channel(&routes[0].conns));

        // Out-of-subnet destinations match nothing.
        assert!(bridge.ingress.match_route(Transport::Tcp, Ipv4Addr::new(10, 0, 0, 1), 80).is_none());
    }

    /// `tcp+udp` registers one route per transport sharing one listener.
    #[tokio::test(flavor = "multi_thread")]
    async fn shared_listener_for_joined_transports() {
        let bridge = loopback_bridge();
        let _listener = bridge.listen("tcp+udp", "0.0.0.0/0:0").unwrap();

        let routes = bridge.ingress.routes.read();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].transport, Transport::Tcp);
        assert_eq!(routes[1].transport, Transport::Udp);
        assert!(routes[0].conns.same_channel(&routes[1].conns));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dial_rejects_mismatched_transports() {
        let bridge = loopback_bridge();
        let err = bridge
            .dial(
                CancellationToken::new(),
                NetAddr::tcp("192.168.1.2:0".parse().unwrap()),
                NetAddr::udp("192.168.1.42:128".parse().unwrap()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransportMismatch { .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dial_cancellation_returns_cancelled() {
        let bridge = loopback_bridge();
        // No route for the target: the SYN is parked nowhere and the
        // handshake can never complete.
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let err = bridge
            .dial(
                token,
                NetAddr::tcp("192.168.1.2:0".parse().unwrap()),
                NetAddr::tcp("192.168.1.42:128".parse().unwrap()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
