//! Networking isolation for sandboxed workloads.
//!
//! This crate intermediates all network traffic of an untrusted process tree
//! through a userspace IPv4/TCP/UDP stack. The workload lives in a private
//! network namespace and talks to a TUN device; every packet it emits lands
//! in an in-process protocol stack whose routing is deliberately spoofed so
//! that arbitrary peer identities can be fabricated on the other side.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────┐
//! │   workload (private netns) │
//! │        TUN "dyno0"         │
//! └─────────────┬──────────────┘
//!               │ raw IPv4 frames
//! ┌─────────────┴──────────────┐
//! │   Network: userspace stack │  smoltcp, wildcard routes, spoofing on
//! └─────────────┬──────────────┘
//!               │ flows
//! ┌─────────────┴──────────────┐
//! │   Bridge: route table      │  (transport, CIDR, port) → listener
//! │   listen / dial            │
//! └───────┬──────────┬─────────┘
//!         │          │
//!   ┌─────┴────┐ ┌───┴──────┐
//!   │ Forwarder│ │   NAT    │  ingress port-forward / egress splice
//!   └──────────┘ └──────────┘
//! ```
//!
//! [`Network`] owns the namespace, the TUN link and the stack. [`Bridge`]
//! borrows the stack through a cheap handle and translates between stack
//! flows and host-shaped connection objects in both directions. [`Forwarder`]
//! dials a fixed remote on behalf of inbound traffic; [`Nat`] accepts egress
//! flows and splices them onto real host sockets.

use std::{io, net::SocketAddr};

pub mod addr;
pub mod bridge;
pub mod conn;
pub mod forwarder;
pub mod monitor;
pub mod nat;
pub mod network;
mod stack;
#[cfg(target_os = "linux")]
mod tun;

pub use addr::{Ipv4Subnet, NetAddr, Transport};
pub use bridge::{Bridge, Listener};
pub use conn::{BridgeConn, Conn, HostConn, TcpConn, UdpConn};
pub use forwarder::Forwarder;
pub use monitor::{Monitor, SocketInfo, SocketState};
pub use nat::Nat;
pub use network::{Network, NetworkConfig};

/// Errors surfaced by the networking core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("gateway is not part of subnet")]
    GatewayNotInSubnet,

    #[error("invalid mtu")]
    InvalidMtu,

    #[error("address {0} is not part of subnet")]
    AddressNotInSubnet(std::net::Ipv4Addr),

    #[error("network has not been set up")]
    NotSetup,

    #[error("unknown transport: {0}")]
    UnknownTransport(String),

    #[error("dial: transport mismatch: {local} vs {remote}")]
    TransportMismatch { local: Transport, remote: Transport },

    #[error("only ipv4 addresses are supported")]
    Ipv4Only,

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid subnet: {0}")]
    InvalidSubnet(String),

    #[error("invalid port: {0}")]
    InvalidPort(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[cfg(target_os = "linux")]
    #[error("rtnetlink error: {0}")]
    Netlink(#[from] rtnetlink::Error),

    #[error("bind {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },

    #[error("connect {addr}: {reason}")]
    Connect { addr: SocketAddr, reason: String },

    #[error("stack error: {0}")]
    Stack(String),

    #[error("listener closed")]
    ListenerClosed,

    #[error("dial cancelled")]
    Cancelled,

    #[error("dial timed out")]
    DialTimeout,

    #[error("malformed proc net entry: {0}")]
    ProcParse(String),
}

/// Result type for networking operations.
pub type Result<T> = std::result::Result<T, Error>;
