//! Egress NAT: proxying workload-initiated connections onto real host
//! sockets.
//!
//! Internal connections arrive over the egress listener; for each one the
//! NAT opens the corresponding external connection and splices the two
//! together. The dial-failure policy mirrors real-network behavior: a
//! timed-out dial silently drops the client (its handshake times out at the
//! workload), any other dial failure resets it.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use futures::future::BoxFuture;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    net::{TcpStream, UdpSocket},
    sync::mpsc,
};

use crate::{
    Result,
    addr::Transport,
    bridge::Listener,
    conn::{BridgeConn, HostConn, UdpStream},
};

/// Opens the external connection for an egress flow, given the transport and
/// the destination the workload actually dialed.
pub type EgressDialFn =
    Arc<dyn Fn(Transport, SocketAddr) -> BoxFuture<'static, io::Result<HostConn>> + Send + Sync>;

/// Proxies egress connections from the internal network to the outside.
pub struct Nat {
    egress_listener: Listener,
    egress_dial: EgressDialFn,
}

impl Nat {
    pub fn new(egress_listener: Listener, egress_dial: EgressDialFn) -> Self {
        Self { egress_listener, egress_dial }
    }

    /// The standard dialer: a real TCP connect or a connected UDP socket,
    /// with an optional connect timeout (surfaced as
    /// [`io::ErrorKind::TimedOut`], which [`run`](Self::run) treats as a
    /// silent drop).
    pub fn host_dialer(connect_timeout: Option<Duration>) -> EgressDialFn {
        Arc::new(move |transport, addr| {
            Box::pin(async move {
                match transport {
                    Transport::Tcp => {
                        let connect = TcpStream::connect(addr);
                        let stream = match connect_timeout {
                            Some(timeout) => tokio::time::timeout(timeout, connect)
                                .await
                                .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))??,
                            None => connect.await?,
                        };
                        Ok(HostConn::Tcp(stream))
                    }
                    Transport::Udp => {
                        let socket =
                            UdpSocket::bind((std::net::Ipv4Addr::UNSPECIFIED, 0)).await?;
                        socket.connect(addr).await?;
                        Ok(HostConn::Udp(UdpStream::new(socket)))
                    }
                }
            })
        })
    }

    /// Accept and proxy egress connections until the listener closes.
    pub async fn run(&self) -> Result<()> {
        loop {
            let client = self.egress_listener.accept().await?;
            let dial = Arc::clone(&self.egress_dial);
            tokio::spawn(forward(client, dial));
        }
    }

    /// Interrupt [`run`](Self::run) by closing the egress listener.
    pub fn stop(&self) {
        self.egress_listener.close();
    }
}

async fn forward(client: BridgeConn, dial: EgressDialFn) {
    let transport = client.transport();
    let target = client.local_addr();

    match dial(transport, target).await {
        Ok(server) => {
            if let Err(err) = splice(client, server).await {
                tracing::warn!(?err, %target, "egress splice failed");
            }
        }
        Err(err) if err.kind() == io::ErrorKind::TimedOut => {
            // Drop the client without answering its handshake, so the
            // timeout propagates to the workload as a real one would.
            tracing::debug!(%target, "egress dial timed out, dropping client");
        }
        Err(err) => {
            tracing::debug!(?err, %target, "egress dial failed, resetting client");
            let mut client = client;
            let _ = client.shutdown().await;
        }
    }
}

/// Bidirectional byte copy between two connections.
///
/// Each direction closes its write side when its read side finishes; the
/// first terminal outcome decides the result. Reads failing because the
/// paired writer already closed the connection count as a normal peer close.
async fn splice<A, B>(a: A, b: B) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let (done_tx, mut done_rx) = mpsc::channel::<io::Result<()>>(2);
    tokio::spawn(copy_then_close(a_read, b_write, done_tx.clone()));
    tokio::spawn(copy_then_close(b_read, a_write, done_tx));

    done_rx.recv().await.unwrap_or(Ok(()))?;
    done_rx.recv().await.unwrap_or(Ok(()))
}

async fn copy_then_close<R, W>(
    mut read: ReadHalf<R>,
    mut write: WriteHalf<W>,
    done: mpsc::Sender<io::Result<()>>,
) where
    R: AsyncRead + Send,
    W: AsyncWrite + Send,
{
    let result = tokio::io::copy(&mut read, &mut write).await;
    let _ = write.shutdown().await;

    let result = match result {
        Ok(_) => Ok(()),
        Err(err) if is_benign_close(&err) => Ok(()),
        Err(err) => Err(err),
    };
    let _ = done.send(result).await;
}

/// Errors that just mean "the other side went away first".
fn is_benign_close(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::sync::CancellationToken;

    use super::Nat;
    use crate::{
        NetAddr,
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

    #[tokio::test(flavor = "multi_thread")]
    async fn tcp_egress_through_real_listener() {
        let _ = tracing_subscriber::fmt::try_init();

        let bridge = loopback_bridge();
        let nat = std::sync::Arc::new(Nat::new(
            bridge.listen("tcp+udp", "0.0.0.0/0:0").unwrap(),
            Nat::host_dialer(None),
        ));
        {
            let nat = std::sync::Arc::clone(&nat);
            tokio::spawn(async move {
                let _ = nat.run().await;
            });
        }

        let host = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host_addr = host.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut conn, _) = host.accept().await.unwrap();

            let mut buf = [0u8; 1024];
            let n = conn.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"ping");

            conn.write_all(b"pong").await.unwrap();
            conn.shutdown().await.unwrap();
        });

        let mut client = bridge
            .dial(
                CancellationToken::new(),
                NetAddr::tcp("192.168.1.2:0".parse().unwrap()),
                NetAddr::tcp(host_addr),
            )
            .await
            .unwrap();

        client.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 1024];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");

        // Host side closed: EOF crosses the splice.
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);

        server.await.unwrap();
        nat.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn udp_egress_through_real_socket() {
        let _ = tracing_subscriber::fmt::try_init();

        let bridge = loopback_bridge();
        let nat = std::sync::Arc::new(Nat::new(
            bridge.listen("tcp+udp", "0.0.0.0/0:0").unwrap(),
            Nat::host_dialer(None),
        ));
        {
            let nat = std::sync::Arc::clone(&nat);
            tokio::spawn(async move {
                let _ = nat.run().await;
            });
        }

        let host = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let host_addr = host.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let (n, from) = host.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"ping");
            host.send_to(b"pong", from).await.unwrap();
        });

        let mut client = bridge
            .dial(
                CancellationToken::new(),
                NetAddr::udp("192.168.1.2:0".parse().unwrap()),
                NetAddr::udp(host_addr),
            )
            .await
            .unwrap();

        client.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 1024];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");

        server.await.unwrap();
        nat.stop();
    }
}
