//! Egress NAT over a loopback-backed stack, supervised as a unit.
//!
//! A workload-side dial to a real host listener crosses the userspace stack,
//! gets accepted by the NAT's egress listener, and is spliced onto a real
//! TCP connection. Runs unprivileged: the stack is loopback-backed and the
//! namespace step is skipped.
//!
//! ```sh
//! cargo run --example egress_nat
//! ```

use std::{net::Ipv4Addr, sync::Arc};

use cage::{Bridge, Group, Nat, NetAddr, Network, NetworkConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let subnet = "192.168.1.0/24".parse()?;
    let mut config = NetworkConfig::new(subnet, Ipv4Addr::new(192, 168, 1, 1));
    config.skip_netns = true;

    let mut network = Network::new(config);
    network.setup()?;
    network.add_loopback()?;

    let bridge = Arc::new(Bridge::new(&network)?);
    let nat = Arc::new(Nat::new(
        bridge.listen("tcp+udp", "0.0.0.0/0:0")?,
        Nat::host_dialer(None),
    ));

    // A real host server for the workload to reach.
    let host = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let host_addr = host.local_addr()?;
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, peer)) = host.accept().await else { break };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                if let Ok(n) = conn.read(&mut buf).await {
                    println!("host server: {:?} from {peer}", String::from_utf8_lossy(&buf[..n]));
                    let _ = conn.write_all(b"hello from the outside").await;
                }
            });
        }
    });

    // Supervise the NAT like the real system would.
    let mut group: Group<cage::Error> = Group::new();
    {
        let nat_run = Arc::clone(&nat);
        let nat_stop = Arc::clone(&nat);
        group
            .start(
                async move { nat_run.run().await },
                move || nat_stop.stop(),
            )
            .await?;
    }

    // Simulate the workload dialing out through the stack.
    let mut conn = bridge
        .dial(
            CancellationToken::new(),
            NetAddr::tcp("192.168.1.2:0".parse()?),
            NetAddr::tcp(host_addr),
        )
        .await?;

    conn.write_all(b"hello from the cage").await?;
    let mut buf = [0u8; 1024];
    let n = conn.read(&mut buf).await?;
    println!("workload: {:?}", String::from_utf8_lossy(&buf[..n]));
    conn.shutdown().await?;

    nat.stop();
    // The NAT reports the closed listener as its exit reason.
    let _ = group.run().await;

    Ok(())
}
