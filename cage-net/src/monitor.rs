//! Socket-state monitoring for the workload's network namespace.
//!
//! The kernel exposes per-namespace TCP tables under
//! `/proc/<pid>/task/<tid>/net/tcp{,6}`. The monitor polls them on an
//! interval, diffs consecutive snapshots, and emits a [`SocketInfo`] event
//! for every socket that appeared or vanished — a vanished socket is
//! reported once with the synthetic [`SocketState::Closed`].
//!
//! The proc files are namespace-scoped through the *thread* that opens them:
//! [`Monitor::setup`] must run on the thread that entered the target
//! namespace, and the files stay open until monitoring ends.

use std::{
    collections::HashMap,
    io::{Read, Seek, SeekFrom},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// The state of a TCP socket, as encoded by the kernel (1..=12), plus the
/// synthetic `Closed` emitted when a previously seen socket disappears.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum SocketState {
    Established = 1,
    SynSent = 2,
    SynRecv = 3,
    FinWait1 = 4,
    FinWait2 = 5,
    TimeWait = 6,
    Close = 7,
    CloseWait = 8,
    LastAck = 9,
    Listen = 10,
    Closing = 11,
    NewSynRecv = 12,

    Closed = -1,
}

impl TryFrom<u8> for SocketState {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => SocketState::Established,
            2 => SocketState::SynSent,
            3 => SocketState::SynRecv,
            4 => SocketState::FinWait1,
            5 => SocketState::FinWait2,
            6 => SocketState::TimeWait,
            7 => SocketState::Close,
            8 => SocketState::CloseWait,
            9 => SocketState::LastAck,
            10 => SocketState::Listen,
            11 => SocketState::Closing,
            12 => SocketState::NewSynRecv,
            other => return Err(Error::ProcParse(format!("socket state {other}"))),
        })
    }
}

/// A change in the state of a socket in the monitored namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketInfo {
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub state: SocketState,
}

impl SocketInfo {
    fn id(&self) -> (SocketAddr, SocketAddr) {
        (self.local_addr, self.remote_addr)
    }
}

/// Watches for changes to TCP sockets within the current network namespace.
pub struct Monitor {
    poll_interval: Duration,
    proc_tcp: Option<std::fs::File>,
    proc_tcp6: Option<std::fs::File>,
    cancel: CancellationToken,
    chans: Vec<mpsc::Sender<SocketInfo>>,
}

impl Monitor {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            proc_tcp: None,
            proc_tcp6: None,
            cancel: CancellationToken::new(),
            chans: Vec::new(),
        }
    }

    /// Open the thread-scoped proc tables. Must run on the thread that
    /// entered the namespace to monitor.
    #[cfg(target_os = "linux")]
    pub fn setup(&mut self) -> Result<()> {
        let pid = std::process::id();
        let tid = unsafe { libc::syscall(libc::SYS_gettid) };
        let dir = format!("/proc/{pid}/task/{tid}/net");

        self.proc_tcp = Some(std::fs::File::open(format!("{dir}/tcp"))?);
        self.proc_tcp6 = Some(std::fs::File::open(format!("{dir}/tcp6"))?);
        Ok(())
    }

    /// Register a new event channel receiving every subsequent change.
    pub fn socket_info_chan(&mut self) -> mpsc::Receiver<SocketInfo> {
        let (tx, rx) = mpsc::channel(64);
        self.chans.push(tx);
        rx
    }

    /// Poll the proc tables on the configured interval and emit diffs until
    /// stopped.
    pub async fn run(&mut self) -> Result<()> {
        let mut prev: HashMap<(SocketAddr, SocketAddr), SocketInfo> = HashMap::new();
        let mut ticker = tokio::time::interval(self.poll_interval);

        loop {
            let stopped = tokio::select! {
                _ = self.cancel.cancelled() => true,
                _ = ticker.tick() => false,
            };
            if stopped {
                self.chans.clear();
                return Ok(());
            }

            let mut current = HashMap::new();
            for file in [&mut self.proc_tcp, &mut self.proc_tcp6].into_iter().flatten() {
                file.seek(SeekFrom::Start(0))?;
                let mut data = String::new();
                file.read_to_string(&mut data)?;
                for info in parse_proc_net_tcp(&data)? {
                    current.entry(info.id()).or_insert(info);
                }
            }

            // New sockets.
            for (id, info) in &current {
                if !prev.contains_key(id) {
                    self.emit(info).await;
                }
            }
            // Vanished sockets surface once as Closed.
            for (id, info) in &prev {
                if !current.contains_key(id) {
                    let mut info = info.clone();
                    info.state = SocketState::Closed;
                    self.emit(&info).await;
                }
            }

            prev = current;
        }
    }

    async fn emit(&self, info: &SocketInfo) {
        for chan in &self.chans {
            let _ = chan.send(info.clone()).await;
        }
    }

    /// Interrupt [`run`](Self::run). Idempotent; closes all event channels.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// A clone of the stop signal, for interrupt hooks that outlive `self`.
    pub fn stop_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Parse a `/proc/net/tcp{,6}` table: whitespace-delimited fields, first
/// line a header, field 1 local address, field 2 remote address, field 3 the
/// state in hex.
fn parse_proc_net_tcp(data: &str) -> Result<Vec<SocketInfo>> {
    let mut lines = data.lines();
    if lines.next().is_none() {
        return Err(Error::ProcParse("empty proc net tcp data".into()));
    }

    let mut infos = Vec::new();
    for line in lines {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            return Err(Error::ProcParse(line.to_owned()));
        }

        let local_addr = parse_hex_addr(fields[1])?;
        let remote_addr = parse_hex_addr(fields[2])?;
        let state = u8::from_str_radix(fields[3], 16)
            .map_err(|_| Error::ProcParse(fields[3].to_owned()))?;

        infos.push(SocketInfo { local_addr, remote_addr, state: state.try_into()? });
    }
    Ok(infos)
}

/// Parse `"<hex-address>:<hex-port>"`: the address is written per 32-bit
/// word in little-endian order (one word for IPv4, four for IPv6); the port
/// is plain big-endian hex.
fn parse_hex_addr(value: &str) -> Result<SocketAddr> {
    let err = || Error::ProcParse(value.to_owned());
    let (addr_hex, port_hex) = value.split_once(':').ok_or_else(err)?;

    let bytes = decode_hex(addr_hex).ok_or_else(err)?;
    if bytes.len() != 4 && bytes.len() != 16 {
        return Err(err());
    }
    let mut addr = Vec::with_capacity(bytes.len());
    for word in bytes.chunks_exact(4) {
        addr.extend(word.iter().rev());
    }

    let ip = match addr.len() {
        4 => IpAddr::V4(Ipv4Addr::from(<[u8; 4]>::try_from(addr.as_slice()).unwrap())),
        16 => IpAddr::V6(Ipv6Addr::from(<[u8; 16]>::try_from(addr.as_slice()).unwrap())),
        _ => return Err(err()),
    };

    let port = u16::from_str_radix(port_hex, 16).map_err(|_| err())?;
    Ok(SocketAddr::new(ip, port))
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    hex.as_bytes()
        .chunks_exact(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            Some((hi * 16 + lo) as u8)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_addr_ipv4() {
        // 127.0.0.1:5432, one little-endian 32-bit word.
        let addr = parse_hex_addr("0100007F:1538").unwrap();
        assert_eq!(addr, "127.0.0.1:5432".parse().unwrap());

        let addr = parse_hex_addr("00000000:0000").unwrap();
        assert_eq!(addr, "0.0.0.0:0".parse().unwrap());
    }

    #[test]
    fn hex_addr_ipv6() {
        // ::1, four little-endian words.
        let addr = parse_hex_addr("00000000000000000000000001000000:0050").unwrap();
        assert_eq!(addr, "[::1]:80".parse().unwrap());
    }

    #[test]
    fn hex_addr_rejects_garbage() {
        assert!(parse_hex_addr("0100007F").is_err());
        assert!(parse_hex_addr("zz00007F:1538").is_err());
        assert!(parse_hex_addr("0100007F00:1538").is_err());
    }

    #[test]
    fn proc_net_tcp_parsing() {
        let data = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n   0: 0100007F:1538 00000000:0000 0A 00000000:00000000 00:00000000 00000000   104        0 21605 1 0000000000000000 100 0 0 10 0\n   1: 0F02000A:0016 0202000A:D2A4 01 00000000:00000000 02:000A7214 00000000     0        0 36856 4 0000000000000000 20 4 31 10 -1\n";

        let infos = parse_proc_net_tcp(data).unwrap();
        assert_eq!(infos.len(), 2);

        assert_eq!(
            infos[0],
            SocketInfo {
                local_addr: "127.0.0.1:5432".parse().unwrap(),
                remote_addr: "0.0.0.0:0".parse().unwrap(),
                state: SocketState::Listen,
            }
        );
        assert_eq!(
            infos[1],
            SocketInfo {
                local_addr: "10.0.2.15:22".parse().unwrap(),
                remote_addr: "10.0.2.2:53924".parse().unwrap(),
                state: SocketState::Established,
            }
        );
    }

    #[test]
    fn proc_net_tcp_rejects_empty_and_malformed() {
        assert!(parse_proc_net_tcp("").is_err());

        let data = "header\n   0: nonsense\n";
        assert!(parse_proc_net_tcp(data).is_err());
    }
}
