//! Ingress port-forwarding: dialing one fixed remote endpoint on behalf of
//! inbound traffic.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{Error, NetAddr, Result, bridge::Bridge, conn::BridgeConn};

/// Establishes connections to a fixed forward address.
///
/// Similar in function to a dialer, but the local address is the fabricated
/// **workload-visible source** of the connection: unless
/// [`reuse_port`](Self::reuse_port) is set, its port is zeroed so the stack
/// picks a fresh ephemeral port and a rerun cannot collide with the source
/// port of an earlier fabricated connection.
pub struct Forwarder {
    pub bridge: Arc<Bridge>,
    pub remote_addr: NetAddr,
    pub timeout: Option<Duration>,
    pub reuse_port: bool,
}

impl Forwarder {
    pub fn new(bridge: Arc<Bridge>, remote_addr: NetAddr) -> Self {
        Self { bridge, remote_addr, timeout: None, reuse_port: false }
    }

    /// Connect to the forwarder's remote from `address` on `network`.
    pub async fn forward(
        &self,
        token: CancellationToken,
        network: &str,
        address: &str,
    ) -> Result<BridgeConn> {
        let local = self.resolve_addr(network, address)?;
        let dial = self.bridge.dial(token, local, self.remote_addr);

        match self.timeout {
            Some(timeout) => {
                tokio::time::timeout(timeout, dial).await.map_err(|_| Error::DialTimeout)?
            }
            None => dial.await,
        }
    }

    fn resolve_addr(&self, network: &str, address: &str) -> Result<NetAddr> {
        let transport = network.parse()?;
        let mut addr: SocketAddr =
            address.parse().map_err(|_| Error::InvalidAddress(address.to_owned()))?;
        if !self.reuse_port {
            addr.set_port(0);
        }
        Ok(NetAddr::new(transport, addr))
    }
}

#[cfg(test)]
mod tests {
    use std::{net::Ipv4Addr, sync::Arc, time::Duration};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::sync::CancellationToken;

    use super::Forwarder;
    use crate::{
        Error, NetAddr,
        bridge::Bridge,
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

    /// Unless `reuse_port` is set, the local port is zeroed so the stack
    /// allocates a fresh ephemeral source port.
    #[tokio::test(flavor = "multi_thread")]
    async fn resolve_zeroes_local_port() {
        let bridge = Arc::new(loopback_bridge());
        let remote = NetAddr::tcp("192.168.1.42:128".parse().unwrap());

        let forwarder = Forwarder::new(Arc::clone(&bridge), remote);
        let local = forwarder.resolve_addr("tcp", "4.3.2.1:8765").unwrap();
        assert_eq!(local.addr.port(), 0);
        assert_eq!(local.addr.ip().to_string(), "4.3.2.1");

        let forwarder = Forwarder { reuse_port: true, ..Forwarder::new(bridge, remote) };
        let local = forwarder.resolve_addr("udp", "4.3.2.1:8765").unwrap();
        assert_eq!(local.addr.port(), 8765);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_network_is_rejected() {
        let bridge = Arc::new(loopback_bridge());
        let forwarder =
            Forwarder::new(bridge, NetAddr::tcp("192.168.1.42:128".parse().unwrap()));

        let err = forwarder
            .forward(CancellationToken::new(), "unix", "192.168.1.2:0")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownTransport(_)));
    }

    /// A forwarded connection arrives with the fabricated source address:
    /// the requested IP — even outside the subnet, thanks to spoofing — and
    /// a stack-chosen source port.
    #[tokio::test(flavor = "multi_thread")]
    async fn forward_fabricates_the_source_address() {
        let _ = tracing_subscriber::fmt::try_init();

        let bridge = Arc::new(loopback_bridge());
        let listener = bridge.listen("udp", "0.0.0.0/0:512").unwrap();

        let forwarder = Forwarder::new(
            Arc::clone(&bridge),
            NetAddr::udp("192.168.1.42:512".parse().unwrap()),
        );
        let mut conn = forwarder
            .forward(CancellationToken::new(), "udp", "4.3.2.1:8765")
            .await
            .unwrap();
        conn.write_all(b"hello").await.unwrap();

        let mut server = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        assert_eq!(server.local_addr().to_string(), "192.168.1.42:512");
        let remote = server.remote_addr();
        assert_eq!(remote.ip().to_string(), "4.3.2.1");
        assert_ne!(remote.port(), 8765);

        server.write_all(b"hi back").await.unwrap();
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hi back");
    }

    /// A dial that cannot complete surfaces the timeout as the deadline
    /// error of the forward call.
    #[tokio::test(flavor = "multi_thread")]
    async fn timeout_surfaces_as_dial_timeout() {
        let bridge = Arc::new(loopback_bridge());
        // No route registered for the remote: the handshake can never finish.
        let forwarder = Forwarder {
            timeout: Some(Duration::from_nanos(1)),
            ..Forwarder::new(bridge, NetAddr::tcp("192.168.1.42:128".parse().unwrap()))
        };

        let err = forwarder
            .forward(CancellationToken::new(), "tcp", "192.168.1.2:4321")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DialTimeout));
    }
}
