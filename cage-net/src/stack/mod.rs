//! The userspace protocol stack driver.
//!
//! A single task owns the smoltcp [`Interface`], its [`SocketSet`], and the
//! attached link (TUN or the in-memory loopback hairpin). Everything else —
//! bridge dials, connection I/O, teardown — reaches the stack through a
//! command channel plus a wakeup [`Notify`], and payload bytes travel over
//! per-connection bounded channels that the driver pumps on every poll
//! round. Backpressure on those channels feeds straight into the TCP window.
//!
//! Inbound flows pass through a *gate* before smoltcp ever sees them. The
//! gate matches the destination against the bridge's route table; a matched
//! TCP SYN is parked (handshake-deferred) until the accepted connection sees
//! its first read or write, and a matched UDP datagram eagerly gets an
//! endpoint. Unmatched traffic is dropped, so the workload's handshakes time
//! out rather than being refused.

use std::{
    collections::HashMap,
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime},
};

use bytes::Bytes;
use parking_lot::RwLock;
use smoltcp::{
    iface::{Config, Interface, SocketHandle, SocketSet},
    socket::{tcp, udp},
    time::Instant,
    wire::{HardwareAddress, IpAddress, IpCidr, IpEndpoint, IpProtocol, Ipv4Packet, PrettyPrinter,
        TcpPacket, UdpPacket},
};
use tokio::sync::{Notify, mpsc, oneshot};

use crate::{
    Error, Result,
    addr::{Ipv4Subnet, Transport},
    conn::{BridgeConn, TcpConn, UdpConn},
};

mod device;
mod rst;

use device::QueueDevice;
#[cfg(target_os = "linux")]
use crate::tun::TunIo;

/// Capacity of each per-connection byte channel.
const CONN_PIPE: usize = 64;
/// Largest chunk moved from a socket buffer to a connection per step.
const RECV_CHUNK: usize = 16 * 1024;
/// Inbound ephemeral port range for unbound local addresses.
const EPHEMERAL_START: u16 = 49152;
const EPHEMERAL_END: u16 = 65535;
/// UDP socket buffer sizing.
const UDP_META: usize = 64;
const UDP_PAYLOAD: usize = 1 << 16;

/// Stack parameters, fixed at [`spawn`] time.
pub(crate) struct StackConfig {
    pub subnet: Ipv4Subnet,
    pub gateway: Ipv4Addr,
    pub mtu: usize,
    pub tx_queue_len: usize,
    pub rx_window_len: usize,
    pub max_egress_conn_count: usize,
    pub debug: bool,
}

/// Identifier of a bridged connection, allocated by the caller side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ConnId(u64);

/// The link a stack forwards frames over.
pub(crate) enum LinkKind {
    /// Transmitted frames are gated straight back into the receive path.
    /// Used by tests and by egress setups that must not leave the process.
    Loopback,
    /// A TUN file descriptor inside the workload's network namespace.
    #[cfg(target_os = "linux")]
    Tun(TunIo),
}

/// Cheap, cloneable handle into the stack task.
///
/// The stack is owned by its driver task; everyone else (network, bridge,
/// connection objects) holds one of these. The handle never outlives the
/// semantics of the stack: commands to a stopped stack are dropped.
#[derive(Clone, Debug)]
pub(crate) struct StackTx {
    cmd: mpsc::UnboundedSender<Command>,
    kick: Arc<Notify>,
    next_id: Arc<AtomicU64>,
}

impl StackTx {
    pub(crate) fn send(&self, cmd: Command) {
        let _ = self.cmd.send(cmd);
    }

    /// Wake the driver so it notices freshly queued payloads or commands.
    pub(crate) fn kick(&self) {
        self.kick.notify_one();
    }

    pub(crate) fn alloc_id(&self) -> ConnId {
        ConnId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

pub(crate) enum Command {
    Attach(LinkKind),
    RegisterIngress(Arc<Ingress>),
    DialTcp {
        id: ConnId,
        local: SocketAddrV4,
        remote: SocketAddrV4,
        reply: oneshot::Sender<Result<TcpConn>>,
    },
    DialUdp {
        id: ConnId,
        local: SocketAddrV4,
        remote: SocketAddrV4,
        reply: oneshot::Sender<Result<UdpConn>>,
    },
    /// First I/O on a handshake-deferred inbound connection.
    CompleteHandshake { conn: ConnId },
    /// Close before any I/O: answer the parked SYN with an RST.
    Reset { conn: ConnId },
    /// Drop before any I/O: discard the parked SYN silently.
    Forget { conn: ConnId },
    /// Cancelled TCP dial.
    AbortDial { conn: ConnId },
}

/// A route registered through [`Bridge::listen`](crate::Bridge::listen),
/// paired with the sender half of its listener channel.
pub(crate) struct Route {
    pub(crate) transport: Transport,
    pub(crate) cidr: Ipv4Subnet,
    pub(crate) port: u16,
    pub(crate) conns: mpsc::Sender<BridgeConn>,
}

/// The bridge's route table, shared with the stack's gate.
///
/// Mutated only under the writer lock; the gate takes the reader lock per
/// matched flow, so registration and matching never observe a torn table.
#[derive(Default)]
pub(crate) struct Ingress {
    pub(crate) routes: RwLock<Vec<Route>>,
}

impl Ingress {
    /// Linear scan in insertion order; first match wins. A route matches
    /// when the transport is equal, the CIDR contains the destination, and
    /// the port is zero or equal.
    pub(crate) fn match_route(
        &self,
        transport: Transport,
        ip: Ipv4Addr,
        port: u16,
    ) -> Option<mpsc::Sender<BridgeConn>> {
        let routes = self.routes.read();
        routes
            .iter()
            .find(|r| {
                r.transport == transport && r.cidr.contains(ip) && (r.port == 0 || r.port == port)
            })
            .map(|r| r.conns.clone())
    }
}

/// Spawn the stack driver task and return the handle to it.
pub(crate) fn spawn(config: StackConfig) -> StackTx {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let tx = StackTx {
        cmd: cmd_tx,
        kick: Arc::new(Notify::new()),
        next_id: Arc::new(AtomicU64::new(1)),
    };
    tokio::spawn(run(config, cmd_rx, tx.clone()));
    tx
}

/// What woke the driver loop.
enum Wake {
    Cmd(Option<Command>),
    Frame(io::Result<Vec<u8>>),
    Idle,
}

async fn run(config: StackConfig, mut cmd_rx: mpsc::UnboundedReceiver<Command>, tx: StackTx) {
    let mut stack = Stack::new(config, tx.clone());

    loop {
        let out = stack.process();
        stack.link_send(out).await;

        let delay = stack.poll_delay();
        let wake = tokio::select! {
            cmd = cmd_rx.recv() => Wake::Cmd(cmd),
            frame = link_recv(&mut stack.link) => Wake::Frame(frame),
            _ = tx.kick.notified() => Wake::Idle,
            _ = tokio::time::sleep(delay) => Wake::Idle,
        };

        match wake {
            Wake::Cmd(Some(cmd)) => stack.handle_command(cmd),
            Wake::Cmd(None) => break,
            Wake::Frame(Ok(frame)) => stack.ingest(frame),
            Wake::Frame(Err(err)) => {
                tracing::error!(?err, "link read failed, detaching");
                stack.link = None;
            }
            Wake::Idle => {}
        }

        while let Ok(cmd) = cmd_rx.try_recv() {
            stack.handle_command(cmd);
        }
    }
}

/// Wait for a frame from the attached TUN link; pends forever otherwise.
async fn link_recv(link: &mut Option<LinkKind>) -> io::Result<Vec<u8>> {
    match link {
        #[cfg(target_os = "linux")]
        Some(LinkKind::Tun(tun)) => tun.recv().await,
        _ => std::future::pending().await,
    }
}

struct Stack {
    config: StackConfig,
    device: QueueDevice,
    iface: Interface,
    sockets: SocketSet<'static>,
    link: Option<LinkKind>,
    ingress: Option<Arc<Ingress>>,
    conns: HashMap<ConnId, ConnEntry>,
    flows: HashMap<FlowKey, ConnId>,
    next_ephemeral: u16,
    tx: StackTx,
}

/// A flow, keyed from the stack's perspective: `local` is the address the
/// workload targeted (our side of the conversation), `remote` the workload's
/// own endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FlowKey {
    transport: Transport,
    local: SocketAddrV4,
    remote: SocketAddrV4,
}

enum ConnEntry {
    Tcp(TcpEntry),
    Udp(UdpEntry),
}

struct TcpEntry {
    key: FlowKey,
    state: TcpFlowState,
    to_conn: Option<mpsc::Sender<io::Result<Bytes>>>,
    from_conn: mpsc::Receiver<Bytes>,
    /// Remainder of a partially accepted payload, retried before new data.
    pending: Option<Bytes>,
    write_eof: bool,
    fin_sent: bool,
    clean_eof: bool,
    dial: Option<PendingDial>,
}

enum TcpFlowState {
    /// Inbound SYN parked until the application's first I/O.
    Deferred { syn: Vec<u8> },
    Active { handle: SocketHandle },
}

struct PendingDial {
    reply: oneshot::Sender<Result<TcpConn>>,
    conn: TcpConn,
    remote: SocketAddr,
}

struct UdpEntry {
    key: FlowKey,
    handle: SocketHandle,
    to_conn: Option<mpsc::Sender<io::Result<Bytes>>>,
    from_conn: mpsc::Receiver<Bytes>,
    closed: bool,
    drained: bool,
}

impl Stack {
    fn new(config: StackConfig, tx: StackTx) -> Self {
        let mut device = QueueDevice::new(config.mtu, config.tx_queue_len);

        let mut iface_config = Config::new(HardwareAddress::Ip);
        iface_config.random_seed = seed();
        let mut iface = Interface::new(iface_config, &mut device, Instant::now());

        iface.update_ip_addrs(|addrs| {
            let _ = addrs.push(IpCidr::new(IpAddress::Ipv4(config.gateway), config.subnet.prefix()));
        });
        // Spoofing plus wildcard routing: the bridge fabricates arbitrary
        // peer identities, so the stack must neither filter destinations nor
        // refuse to source from addresses it does not own.
        iface.set_any_ip(true);
        if let Err(err) = iface.routes_mut().add_default_ipv4_route(config.gateway) {
            tracing::error!(?err, "failed to install wildcard route");
        }

        Self {
            config,
            device,
            iface,
            sockets: SocketSet::new(Vec::new()),
            link: None,
            ingress: None,
            conns: HashMap::new(),
            flows: HashMap::new(),
            next_ephemeral: EPHEMERAL_START,
            tx,
        }
    }

    /// Drive the interface until quiescent. Returns frames bound for a TUN
    /// link; in loopback mode transmitted frames are re-ingested instead.
    fn process(&mut self) -> Vec<Vec<u8>> {
        let loopback = matches!(self.link, Some(LinkKind::Loopback));
        let mut out = Vec::new();

        loop {
            let now = Instant::now();
            self.iface.poll(now, &mut self.device, &mut self.sockets);

            let activity = self.pump();
            let frames = self.device.drain_tx();
            if frames.is_empty() && !activity {
                break;
            }

            if loopback {
                for frame in frames {
                    self.ingest(frame);
                }
            } else {
                out.extend(frames);
            }
        }

        out
    }

    async fn link_send(&mut self, frames: Vec<Vec<u8>>) {
        match &mut self.link {
            #[cfg(target_os = "linux")]
            Some(LinkKind::Tun(tun)) => {
                for frame in frames {
                    if self.config.debug {
                        tracing::trace!(
                            "tx {}",
                            PrettyPrinter::<Ipv4Packet<&[u8]>>::new("", &frame)
                        );
                    }
                    if let Err(err) = tun.send(&frame).await {
                        tracing::debug!(?err, "tun write failed");
                    }
                }
            }
            _ => {
                // No link attached (or loopback, which never reaches here):
                // frames have nowhere to go.
                if !frames.is_empty() {
                    tracing::trace!(count = frames.len(), "dropping frames without a link");
                }
            }
        }
    }

    fn poll_delay(&mut self) -> Duration {
        match self.iface.poll_delay(Instant::now(), &self.sockets) {
            Some(delay) => Duration::from_micros(delay.total_micros()),
            None => Duration::from_secs(1),
        }
    }

    /// The gate: decide what happens to a frame arriving from the link.
    fn ingest(&mut self, frame: Vec<u8>) {
        if self.config.debug {
            tracing::trace!("rx {}", PrettyPrinter::<Ipv4Packet<&[u8]>>::new("", &frame));
        }

        let Ok(packet) = Ipv4Packet::new_checked(frame.as_slice()) else { return };
        if packet.version() != 4 {
            return;
        }
        let src_ip = packet.src_addr();
        let dst_ip = packet.dst_addr();

        match packet.next_header() {
            IpProtocol::Tcp => {
                let Ok(seg) = TcpPacket::new_checked(packet.payload()) else { return };
                let key = FlowKey {
                    transport: Transport::Tcp,
                    local: SocketAddrV4::new(dst_ip, seg.dst_port()),
                    remote: SocketAddrV4::new(src_ip, seg.src_port()),
                };

                if let Some(&id) = self.flows.get(&key) {
                    if let Some(ConnEntry::Tcp(entry)) = self.conns.get(&id) {
                        if matches!(entry.state, TcpFlowState::Deferred { .. }) {
                            // Retransmitted SYN while the original is parked.
                            return;
                        }
                    }
                    self.device.enqueue_rx(frame);
                    return;
                }

                if seg.syn() && !seg.ack() {
                    self.gate_syn(key, frame);
                    return;
                }

                // Flowless non-SYN segments go to the stack, which answers
                // strays with RST per ordinary TCP rules.
                self.device.enqueue_rx(frame);
            }
            IpProtocol::Udp => {
                let Ok(datagram) = UdpPacket::new_checked(packet.payload()) else { return };
                let key = FlowKey {
                    transport: Transport::Udp,
                    local: SocketAddrV4::new(dst_ip, datagram.dst_port()),
                    remote: SocketAddrV4::new(src_ip, datagram.src_port()),
                };

                if self.flows.contains_key(&key) {
                    self.device.enqueue_rx(frame);
                    return;
                }
                self.gate_datagram(key, frame);
            }
            // IPv4 + TCP + UDP only; everything else is dropped.
            _ => {}
        }
    }

    /// A SYN for a new flow: match the route table and park it.
    fn gate_syn(&mut self, key: FlowKey, frame: Vec<u8>) {
        let Some(ingress) = &self.ingress else { return };
        if self.flows.len() >= self.config.max_egress_conn_count {
            tracing::warn!(local = %key.local, remote = %key.remote, "flow limit hit, dropping syn");
            return;
        }
        let Some(listener) = ingress.match_route(Transport::Tcp, *key.local.ip(), key.local.port())
        else {
            tracing::trace!(local = %key.local, remote = %key.remote, "no route for inbound tcp");
            return;
        };

        let id = self.tx.alloc_id();
        let (to_conn_tx, to_conn_rx) = mpsc::channel(CONN_PIPE);
        let (from_conn_tx, from_conn_rx) = mpsc::channel(CONN_PIPE);
        let conn = TcpConn::deferred(
            id,
            SocketAddr::V4(key.local),
            SocketAddr::V4(key.remote),
            to_conn_rx,
            from_conn_tx,
            self.tx.clone(),
        );

        if listener.try_send(BridgeConn::Tcp(conn)).is_err() {
            // Listener closed or over capacity: dropped without a trace, the
            // workload's handshake times out on its own.
            tracing::debug!(local = %key.local, "listener unavailable, dropping inbound tcp");
            return;
        }

        self.flows.insert(key, id);
        self.conns.insert(
            id,
            ConnEntry::Tcp(TcpEntry {
                key,
                state: TcpFlowState::Deferred { syn: frame },
                to_conn: Some(to_conn_tx),
                from_conn: from_conn_rx,
                pending: None,
                write_eof: false,
                fin_sent: false,
                clean_eof: false,
                dial: None,
            }),
        );
    }

    /// A datagram for a new flow: match the route table and open the
    /// endpoint eagerly.
    fn gate_datagram(&mut self, key: FlowKey, frame: Vec<u8>) {
        let Some(ingress) = &self.ingress else { return };
        if self.flows.len() >= self.config.max_egress_conn_count {
            tracing::warn!(local = %key.local, "flow limit hit, dropping datagram");
            return;
        }
        let Some(listener) = ingress.match_route(Transport::Udp, *key.local.ip(), key.local.port())
        else {
            return;
        };

        let mut sock = udp::Socket::new(udp_buffer(), udp_buffer());
        let bind_ep = IpEndpoint::new(IpAddress::Ipv4(*key.local.ip()), key.local.port());
        if let Err(err) = sock.bind(bind_ep) {
            // Endpoint creation failed for an already-matched flow: drop the
            // flow and carry on.
            tracing::warn!(?err, local = %key.local, "udp endpoint bind failed, dropping flow");
            return;
        }
        let handle = self.sockets.add(sock);

        let id = self.tx.alloc_id();
        let (to_conn_tx, to_conn_rx) = mpsc::channel(CONN_PIPE);
        let (from_conn_tx, from_conn_rx) = mpsc::channel(CONN_PIPE);
        let conn = UdpConn::new(
            SocketAddr::V4(key.local),
            SocketAddr::V4(key.remote),
            to_conn_rx,
            from_conn_tx,
            self.tx.clone(),
        );

        if listener.try_send(BridgeConn::Udp(conn)).is_err() {
            tracing::debug!(local = %key.local, "listener unavailable, dropping inbound udp");
            self.sockets.remove(handle);
            return;
        }

        self.flows.insert(key, id);
        self.conns.insert(
            id,
            ConnEntry::Udp(UdpEntry {
                key,
                handle,
                to_conn: Some(to_conn_tx),
                from_conn: from_conn_rx,
                closed: false,
                drained: false,
            }),
        );
        self.device.enqueue_rx(frame);
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Attach(link) => {
                tracing::debug!(
                    loopback = matches!(link, LinkKind::Loopback),
                    "attaching link to stack"
                );
                self.link = Some(link);
            }
            Command::RegisterIngress(ingress) => {
                self.ingress = Some(ingress);
            }
            Command::DialTcp { id, local, remote, reply } => {
                self.dial_tcp(id, local, remote, reply);
            }
            Command::DialUdp { id, local, remote, reply } => {
                self.dial_udp(id, local, remote, reply);
            }
            Command::CompleteHandshake { conn } => self.complete_handshake(conn),
            Command::Reset { conn } => self.reset(conn),
            Command::Forget { conn } => self.forget(conn),
            Command::AbortDial { conn } => self.abort_dial(conn),
        }
    }

    fn dial_tcp(
        &mut self,
        id: ConnId,
        mut local: SocketAddrV4,
        remote: SocketAddrV4,
        reply: oneshot::Sender<Result<TcpConn>>,
    ) {
        if local.port() == 0 {
            local.set_port(self.alloc_ephemeral());
        }
        let key = FlowKey { transport: Transport::Tcp, local, remote };

        let mut sock = tcp::Socket::new(
            tcp::SocketBuffer::new(vec![0u8; self.config.rx_window_len]),
            tcp::SocketBuffer::new(vec![0u8; self.config.rx_window_len]),
        );
        sock.set_nagle_enabled(false);
        sock.set_ack_delay(None);

        let remote_ep = IpEndpoint::new(IpAddress::Ipv4(*remote.ip()), remote.port());
        let local_ep = IpEndpoint::new(IpAddress::Ipv4(*local.ip()), local.port());
        if let Err(err) = sock.connect(self.iface.context(), remote_ep, local_ep) {
            let _ = reply.send(Err(Error::Connect {
                addr: SocketAddr::V4(remote),
                reason: format!("{err:?}"),
            }));
            return;
        }
        let handle = self.sockets.add(sock);

        let (to_conn_tx, to_conn_rx) = mpsc::channel(CONN_PIPE);
        let (from_conn_tx, from_conn_rx) = mpsc::channel(CONN_PIPE);
        let conn = TcpConn::established(
            id,
            SocketAddr::V4(local),
            SocketAddr::V4(remote),
            to_conn_rx,
            from_conn_tx,
            self.tx.clone(),
        );

        self.flows.insert(key, id);
        self.conns.insert(
            id,
            ConnEntry::Tcp(TcpEntry {
                key,
                state: TcpFlowState::Active { handle },
                to_conn: Some(to_conn_tx),
                from_conn: from_conn_rx,
                pending: None,
                write_eof: false,
                fin_sent: false,
                clean_eof: false,
                dial: Some(PendingDial { reply, conn, remote: SocketAddr::V4(remote) }),
            }),
        );
    }

    fn dial_udp(
        &mut self,
        id: ConnId,
        mut local: SocketAddrV4,
        remote: SocketAddrV4,
        reply: oneshot::Sender<Result<UdpConn>>,
    ) {
        if local.port() == 0 {
            local.set_port(self.alloc_ephemeral());
        }
        let key = FlowKey { transport: Transport::Udp, local, remote };

        let mut sock = udp::Socket::new(udp_buffer(), udp_buffer());
        let bind_ep = IpEndpoint::new(IpAddress::Ipv4(*local.ip()), local.port());
        if let Err(err) = sock.bind(bind_ep) {
            let _ = reply.send(Err(Error::Bind {
                addr: SocketAddr::V4(local),
                reason: format!("{err:?}"),
            }));
            return;
        }
        let handle = self.sockets.add(sock);

        let (to_conn_tx, to_conn_rx) = mpsc::channel(CONN_PIPE);
        let (from_conn_tx, from_conn_rx) = mpsc::channel(CONN_PIPE);
        let conn = UdpConn::new(
            SocketAddr::V4(local),
            SocketAddr::V4(remote),
            to_conn_rx,
            from_conn_tx,
            self.tx.clone(),
        );

        self.flows.insert(key, id);
        self.conns.insert(
            id,
            ConnEntry::Udp(UdpEntry {
                key,
                handle,
                to_conn: Some(to_conn_tx),
                from_conn: from_conn_rx,
                closed: false,
                drained: false,
            }),
        );
        let _ = reply.send(Ok(conn));
    }

    /// Materialize the endpoint for a parked SYN and let the handshake run.
    fn complete_handshake(&mut self, id: ConnId) {
        let Some(ConnEntry::Tcp(entry)) = self.conns.get_mut(&id) else { return };
        let TcpFlowState::Deferred { syn } = &mut entry.state else { return };
        let syn = std::mem::take(syn);

        let mut sock = tcp::Socket::new(
            tcp::SocketBuffer::new(vec![0u8; self.config.rx_window_len]),
            tcp::SocketBuffer::new(vec![0u8; self.config.rx_window_len]),
        );
        sock.set_nagle_enabled(false);
        sock.set_ack_delay(None);

        let listen_ep = IpEndpoint::new(IpAddress::Ipv4(*entry.key.local.ip()), entry.key.local.port());
        if let Err(err) = sock.listen(listen_ep) {
            tracing::warn!(?err, local = %entry.key.local, "deferred endpoint listen failed");
            self.remove_conn(id);
            return;
        }
        let handle = self.sockets.add(sock);

        if let Some(ConnEntry::Tcp(entry)) = self.conns.get_mut(&id) {
            entry.state = TcpFlowState::Active { handle };
        }
        self.device.enqueue_rx(syn);
    }

    /// Close-before-I/O on a deferred connection, or an abort on an
    /// established one.
    fn reset(&mut self, id: ConnId) {
        let Some(ConnEntry::Tcp(entry)) = self.conns.get(&id) else { return };
        match &entry.state {
            TcpFlowState::Deferred { syn } => {
                let rst = rst::build_rst_from_syn(syn);
                self.remove_conn(id);
                if let Some(rst) = rst {
                    self.device.enqueue_tx(rst);
                }
            }
            TcpFlowState::Active { handle } => {
                let handle = *handle;
                self.sockets.get_mut::<tcp::Socket>(handle).abort();
            }
        }
    }

    /// Drop-before-I/O: discard the parked SYN without answering it.
    fn forget(&mut self, id: ConnId) {
        let Some(ConnEntry::Tcp(entry)) = self.conns.get(&id) else { return };
        if matches!(entry.state, TcpFlowState::Deferred { .. }) {
            self.remove_conn(id);
        }
    }

    fn abort_dial(&mut self, id: ConnId) {
        let Some(ConnEntry::Tcp(entry)) = self.conns.get_mut(&id) else { return };
        let Some(dial) = entry.dial.take() else { return };
        drop(dial);
        if let TcpFlowState::Active { handle } = &entry.state {
            let handle = *handle;
            self.sockets.get_mut::<tcp::Socket>(handle).abort();
        }
    }

    /// Move payloads between sockets and connection channels, resolve
    /// pending dials, and collect finished flows.
    fn pump(&mut self) -> bool {
        let mut activity = false;
        let mut done = Vec::new();

        for (&id, entry) in self.conns.iter_mut() {
            match entry {
                ConnEntry::Tcp(e) => {
                    let TcpFlowState::Active { handle } = &e.state else { continue };
                    let sock = self.sockets.get_mut::<tcp::Socket>(*handle);
                    let (act, gone) = pump_tcp(sock, e);
                    activity |= act;
                    if gone {
                        done.push(id);
                    }
                }
                ConnEntry::Udp(e) => {
                    let sock = self.sockets.get_mut::<udp::Socket>(e.handle);
                    let (act, gone) = pump_udp(sock, e);
                    activity |= act;
                    if gone {
                        done.push(id);
                    }
                }
            }
        }

        for id in done {
            self.remove_conn(id);
            activity = true;
        }
        activity
    }

    fn remove_conn(&mut self, id: ConnId) {
        let Some(entry) = self.conns.remove(&id) else { return };
        match entry {
            ConnEntry::Tcp(e) => {
                self.flows.remove(&e.key);
                if let TcpFlowState::Active { handle } = e.state {
                    self.sockets.remove(handle);
                }
                if let Some(tx) = e.to_conn {
                    if !e.clean_eof {
                        let _ = tx.try_send(Err(io::ErrorKind::ConnectionReset.into()));
                    }
                }
            }
            ConnEntry::Udp(e) => {
                self.flows.remove(&e.key);
                self.sockets.remove(e.handle);
            }
        }
    }

    fn alloc_ephemeral(&mut self) -> u16 {
        for _ in EPHEMERAL_START..=EPHEMERAL_END {
            let port = self.next_ephemeral;
            self.next_ephemeral =
                if port == EPHEMERAL_END { EPHEMERAL_START } else { port + 1 };
            if !self.flows.keys().any(|k| k.local.port() == port) {
                return port;
            }
        }
        EPHEMERAL_START
    }
}

fn pump_tcp(sock: &mut tcp::Socket, e: &mut TcpEntry) -> (bool, bool) {
    let mut activity = false;

    // Resolve a pending dial once the handshake settles.
    if e.dial.is_some() {
        match sock.state() {
            tcp::State::SynSent | tcp::State::SynReceived => return (false, false),
            tcp::State::Closed => {
                let dial = e.dial.take().expect("dial checked above");
                let _ = dial.reply.send(Err(Error::Connect {
                    addr: dial.remote,
                    reason: "connection reset by stack".into(),
                }));
                return (true, true);
            }
            _ => {
                let dial = e.dial.take().expect("dial checked above");
                let _ = dial.reply.send(Ok(dial.conn));
                activity = true;
            }
        }
    }

    // Connection → socket, retrying any partial remainder first.
    loop {
        if let Some(pending) = e.pending.take() {
            if !sock.can_send() {
                e.pending = Some(pending);
                break;
            }
            match sock.send_slice(&pending) {
                Ok(n) if n < pending.len() => {
                    e.pending = Some(pending.slice(n..));
                    activity |= n > 0;
                    break;
                }
                Ok(_) => activity = true,
                Err(err) => {
                    tracing::debug!(?err, "tcp send failed");
                    e.write_eof = true;
                    break;
                }
            }
            continue;
        }
        if e.write_eof || !sock.can_send() {
            break;
        }
        match e.from_conn.try_recv() {
            Ok(payload) if payload.is_empty() => {
                // In-band write-side close.
                e.write_eof = true;
                activity = true;
                break;
            }
            Ok(payload) => match sock.send_slice(&payload) {
                Ok(n) if n < payload.len() => {
                    e.pending = Some(payload.slice(n..));
                    activity = true;
                    break;
                }
                Ok(_) => activity = true,
                Err(err) => {
                    tracing::debug!(?err, "tcp send failed");
                    e.write_eof = true;
                    break;
                }
            },
            Err(mpsc::error::TryRecvError::Empty) => break,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                e.write_eof = true;
                break;
            }
        }
    }
    if e.write_eof && e.pending.is_none() && !e.fin_sent {
        sock.close();
        e.fin_sent = true;
        activity = true;
    }

    // Socket → connection, leaving data in the socket buffer (and thereby
    // shrinking the TCP window) when the channel is full.
    let mut reader_closed = false;
    if let Some(tx) = &e.to_conn {
        loop {
            if !sock.can_recv() {
                break;
            }
            match tx.try_reserve() {
                Ok(permit) => {
                    match sock.recv(|buf| {
                        let n = buf.len().min(RECV_CHUNK);
                        (n, Bytes::copy_from_slice(&buf[..n]))
                    }) {
                        Ok(data) if data.is_empty() => break,
                        Ok(data) => {
                            permit.send(Ok(data));
                            activity = true;
                        }
                        Err(err) => {
                            tracing::debug!(?err, "tcp recv failed");
                            break;
                        }
                    }
                }
                Err(mpsc::error::TrySendError::Full(())) => break,
                Err(mpsc::error::TrySendError::Closed(())) => {
                    reader_closed = true;
                    break;
                }
            }
        }
    }
    if reader_closed {
        while sock.can_recv() {
            let _ = sock.recv(|buf| (buf.len(), ()));
        }
        e.to_conn = None;
        activity = true;
    }

    // Remote FIN processed and buffer drained: clean EOF to the reader.
    if e.to_conn.is_some() && !sock.can_recv() {
        let fin_seen = matches!(
            sock.state(),
            tcp::State::CloseWait | tcp::State::LastAck | tcp::State::Closing | tcp::State::TimeWait
        );
        if fin_seen {
            e.to_conn = None;
            e.clean_eof = true;
            activity = true;
        }
    }

    let gone = sock.state() == tcp::State::Closed && e.dial.is_none();
    (activity, gone)
}

fn pump_udp(sock: &mut udp::Socket, e: &mut UdpEntry) -> (bool, bool) {
    let mut activity = false;
    let remote = IpEndpoint::new(IpAddress::Ipv4(*e.key.remote.ip()), e.key.remote.port());

    // Connection → socket: one datagram per payload.
    while !e.closed && sock.can_send() {
        match e.from_conn.try_recv() {
            Ok(payload) => match sock.send_slice(&payload, remote) {
                Ok(()) => activity = true,
                Err(err) => tracing::debug!(?err, "udp send failed"),
            },
            Err(mpsc::error::TryRecvError::Empty) => break,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                e.closed = true;
                activity = true;
                break;
            }
        }
    }

    // Socket → connection, filtered to the connected peer.
    let mut reader_closed = false;
    if let Some(tx) = &e.to_conn {
        while sock.can_recv() {
            match tx.try_reserve() {
                Ok(permit) => match sock.recv() {
                    Ok((data, meta)) => {
                        if meta.endpoint == remote {
                            permit.send(Ok(Bytes::copy_from_slice(data)));
                            activity = true;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(?err, "udp recv failed");
                        break;
                    }
                },
                Err(mpsc::error::TrySendError::Full(())) => break,
                Err(mpsc::error::TrySendError::Closed(())) => {
                    reader_closed = true;
                    break;
                }
            }
        }
    }
    if reader_closed {
        while sock.can_recv() {
            let _ = sock.recv();
        }
        e.to_conn = None;
        activity = true;
    }

    // Removal lags the close by one round so queued datagrams still make it
    // through a final interface poll.
    let gone = e.closed && e.drained;
    if e.closed && !e.drained {
        e.drained = true;
        activity = true;
    }
    (activity, gone)
}

fn udp_buffer() -> udp::PacketBuffer<'static> {
    udp::PacketBuffer::new(vec![udp::PacketMetadata::EMPTY; UDP_META], vec![0u8; UDP_PAYLOAD])
}

fn seed() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
