//! Sandbox networking for untrusted workloads.
//!
//! `cage` intermediates all network traffic of a sandboxed process tree
//! through a userspace TCP/IP stack: the workload lives in a private network
//! namespace behind a TUN device, and every flow it creates is bridged,
//! NAT-ed, or port-forwarded under the host application's control.
//!
//! This crate re-exports the two building blocks:
//!
//! - [`cage_net`] — the network, bridge, forwarder, NAT, and socket monitor.
//! - [`cage_supervisor`] — the lifecycle group coordinating them.
//!
//! See `examples/egress_nat.rs` for an end-to-end wiring.

pub use cage_net::{
    Bridge, BridgeConn, Conn, Error, Forwarder, HostConn, Ipv4Subnet, Listener, Monitor, Nat,
    NetAddr, Network, NetworkConfig, Result, SocketInfo, SocketState, TcpConn, Transport, UdpConn,
};
pub use cage_supervisor::Group;

pub mod net {
    pub use cage_net::*;
}

pub mod supervisor {
    pub use cage_supervisor::*;
}
