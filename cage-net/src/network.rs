//! The isolated L3 environment: network namespace, TUN link, and the
//! userspace stack whose address space is entirely under our control.

use std::net::Ipv4Addr;

use crate::{
    Error, Result,
    addr::Ipv4Subnet,
    stack::{self, Command, LinkKind, StackConfig, StackTx},
};

/// Configuration for a sandbox [`Network`].
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// The subnet the workload lives in.
    pub subnet: Ipv4Subnet,
    /// Our side of the point-to-point TUN link; must be inside `subnet`.
    pub gateway: Ipv4Addr,
    /// MTU applied to the TUN link and the stack's interface.
    pub mtu: u32,
    /// Transmit queue length of the TUN link and the stack's device.
    pub tx_queue_len: u32,
    /// Per-connection socket buffer size, i.e. the receive window granted to
    /// the workload.
    pub rx_window_len: usize,
    /// Upper bound on concurrently tracked flows.
    pub max_egress_conn_count: usize,
    /// Trace every frame crossing the stack.
    pub debug: bool,
    /// Skip network-namespace creation. A testing escape hatch, also useful
    /// for loopback-only stacks that never touch a real interface.
    pub skip_netns: bool,
}

impl NetworkConfig {
    pub fn new(subnet: Ipv4Subnet, gateway: Ipv4Addr) -> Self {
        Self {
            subnet,
            gateway,
            mtu: 1500,
            tx_queue_len: 512,
            rx_window_len: 1 << 18,
            max_egress_conn_count: 1 << 20,
            debug: false,
            skip_netns: false,
        }
    }
}

/// The networking layout for a sandboxed workload: a private namespace, a
/// TUN (or loopback) link, and the userspace IPv4/TCP/UDP stack behind it.
///
/// # Thread affinity
///
/// [`setup`](Self::setup) enters a fresh network namespace **on the calling
/// OS thread**. Call it — and the subsequent [`add_tun`](Self::add_tun) —
/// from a thread that stays put for the duration, e.g. a dedicated thread
/// running a `current_thread` runtime. Child processes forked from that
/// thread inherit the namespace; the stack itself is namespace-independent
/// once the TUN descriptor is open.
pub struct Network {
    config: NetworkConfig,
    stack: Option<StackTx>,
    nic_id: u32,
}

impl Network {
    pub fn new(config: NetworkConfig) -> Self {
        Self { config, stack: None, nic_id: 0 }
    }

    /// Validate the configuration, enter a fresh network namespace (unless
    /// skipped), and start the protocol stack.
    ///
    /// Must be called within a tokio runtime.
    pub fn setup(&mut self) -> Result<()> {
        if !self.config.subnet.contains(self.config.gateway) {
            return Err(Error::GatewayNotInSubnet);
        }
        if self.config.mtu == 0 {
            return Err(Error::InvalidMtu);
        }

        if !self.config.skip_netns {
            enter_new_netns()?;
        }

        self.stack = Some(stack::spawn(StackConfig {
            subnet: self.config.subnet,
            gateway: self.config.gateway,
            mtu: self.config.mtu as usize,
            tx_queue_len: self.config.tx_queue_len as usize,
            rx_window_len: self.config.rx_window_len,
            max_egress_conn_count: self.config.max_egress_conn_count,
            debug: self.config.debug,
        }));

        tracing::debug!(subnet = %self.config.subnet, gateway = %self.config.gateway, "network ready");
        Ok(())
    }

    /// Attach an in-memory loopback link: transmitted frames re-enter the
    /// stack's receive path. Used for tests and for egress NAT setups where
    /// traffic must not leave the process.
    pub fn add_loopback(&mut self) -> Result<()> {
        let stack = self.stack.as_ref().ok_or(Error::NotSetup)?;
        self.nic_id += 1;
        tracing::debug!(nic = self.nic_id, "attaching loopback link");
        stack.send(Command::Attach(LinkKind::Loopback));
        Ok(())
    }

    /// Create a TUN link named `iface` addressed `ip`, wire up its routes,
    /// and attach its file descriptor to the stack as a new NIC.
    ///
    /// The link is configured with the gateway as point-to-point peer and a
    /// default route through it, so everything the workload sends lands on
    /// the stack regardless of destination.
    #[cfg(target_os = "linux")]
    pub async fn add_tun(&mut self, iface: &str, ip: Ipv4Addr) -> Result<()> {
        use crate::tun;

        if !self.config.subnet.contains(ip) {
            return Err(Error::AddressNotInSubnet(ip));
        }
        let stack = self.stack.as_ref().ok_or(Error::NotSetup)?.clone();

        // The ioctl creates the link in the calling thread's namespace.
        let fd = tun::open(iface)?;
        let index = tun::if_index(iface)?;

        let (connection, handle, _) = rtnetlink::new_connection()?;
        let netlink_task = tokio::spawn(connection);

        let result = self.configure_tun(&handle, iface, index, ip).await;
        netlink_task.abort();
        result?;

        let io = tun::TunIo::new(fd, self.config.mtu as usize)?;
        self.nic_id += 1;
        tracing::debug!(nic = self.nic_id, iface, %ip, "attaching tun link");
        stack.send(Command::Attach(LinkKind::Tun(io)));
        Ok(())
    }

    #[cfg(target_os = "linux")]
    async fn configure_tun(
        &self,
        handle: &rtnetlink::Handle,
        iface: &str,
        index: u32,
        ip: Ipv4Addr,
    ) -> Result<()> {
        use std::net::IpAddr;

        use netlink_packet_route::{address::AddressAttribute, link::LinkAttribute};
        use rtnetlink::{LinkUnspec, RouteMessageBuilder};

        // MTU, transmit queue length, link up.
        let mut link = LinkUnspec::new_with_name(iface).up().build();
        link.attributes.push(LinkAttribute::Mtu(self.config.mtu));
        link.attributes.push(LinkAttribute::TxQueueLen(self.config.tx_queue_len));
        handle.link().set(link).execute().await?;

        // Address with the gateway as point-to-point peer and the subnet
        // broadcast.
        let bcast =
            Ipv4Addr::from_bits(ip.to_bits() | !self.config.subnet.mask_bits());
        let mut req =
            handle.address().add(index, IpAddr::V4(ip), self.config.subnet.prefix());
        let msg = req.message_mut();
        let mut has_local = false;
        let mut has_bcast = false;
        for attr in msg.attributes.iter_mut() {
            match attr {
                AddressAttribute::Address(peer) => *peer = IpAddr::V4(self.config.gateway),
                AddressAttribute::Local(_) => has_local = true,
                AddressAttribute::Broadcast(b) => {
                    *b = bcast;
                    has_bcast = true;
                }
                _ => {}
            }
        }
        if !has_local {
            msg.attributes.push(AddressAttribute::Local(IpAddr::V4(ip)));
        }
        if !has_bcast {
            msg.attributes.push(AddressAttribute::Broadcast(bcast));
        }
        req.execute().await?;

        // Default route through the gateway, sourced from the TUN address.
        let route = RouteMessageBuilder::<Ipv4Addr>::new()
            .output_interface(index)
            .pref_source(ip)
            .gateway(self.config.gateway)
            .build();
        handle.route().add(route).execute().await?;

        Ok(())
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub(crate) fn stack_tx(&self) -> Result<StackTx> {
        self.stack.clone().ok_or(Error::NotSetup)
    }
}

/// Unshare the network namespace on the calling thread. The namespace is
/// kept alive by the thread itself (and by any children forked from it), so
/// no handle needs to be retained.
#[cfg(target_os = "linux")]
fn enter_new_netns() -> Result<()> {
    use nix::sched::{CloneFlags, unshare};

    unshare(CloneFlags::CLONE_NEWNET)
        .map_err(|err| Error::Io(std::io::Error::from_raw_os_error(err as i32)))
}

#[cfg(not(target_os = "linux"))]
fn enter_new_netns() -> Result<()> {
    Err(Error::Io(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "network namespaces are linux-only",
    )))
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use std::{collections::HashMap, net::Ipv4Addr};

    use super::{Network, NetworkConfig};

    fn parse_proc_routes(data: &str) -> Vec<HashMap<String, String>> {
        let mut lines = data.lines();
        let keys: Vec<&str> = lines.next().unwrap_or_default().split_whitespace().collect();
        lines
            .map(|line| {
                keys.iter()
                    .map(|k| k.to_string())
                    .zip(line.split_whitespace().map(|v| v.to_string()))
                    .collect()
            })
            .collect()
    }

    /// After `setup` + `add_tun` in a fresh namespace, the kernel route
    /// table must hold exactly a default route via the gateway and the
    /// on-link subnet route.
    #[test]
    #[ignore = "requires root and /dev/net/tun"]
    fn tun_installs_default_and_subnet_routes() {
        let worker = std::thread::spawn(|| {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("runtime");

            rt.block_on(async {
                let _ = tracing_subscriber::fmt::try_init();

                let subnet = "192.168.1.0/24".parse().unwrap();
                let mut network =
                    Network::new(NetworkConfig::new(subnet, Ipv4Addr::new(192, 168, 1, 1)));
                network.setup().unwrap();
                network.add_tun("dyno0", Ipv4Addr::new(192, 168, 1, 42)).await.unwrap();

                // The thread entered the namespace, so inspect the
                // thread-local view of the route table.
                let data = std::fs::read_to_string("/proc/thread-self/net/route").unwrap();
                let routes = parse_proc_routes(&data);
                assert_eq!(routes.len(), 2, "route table: {routes:?}");

                // Default route: UP | GATEWAY, destination 0.0.0.0 via the
                // gateway (hex fields are little-endian words).
                assert_eq!(routes[0]["Iface"], "dyno0");
                assert_eq!(routes[0]["Flags"], "0003");
                assert_eq!(routes[0]["Destination"], "00000000");
                assert_eq!(routes[0]["Mask"], "00000000");
                assert_eq!(routes[0]["Gateway"], "0101A8C0");

                // Subnet route: UP, on-link /24.
                assert_eq!(routes[1]["Iface"], "dyno0");
                assert_eq!(routes[1]["Flags"], "0001");
                assert_eq!(routes[1]["Destination"], "0001A8C0");
                assert_eq!(routes[1]["Mask"], "00FFFFFF");
            });
        });
        worker.join().unwrap();
    }
}
