//! Transports, subnets, and the listen-address grammar.

use std::{
    fmt::{self, Display},
    net::{Ipv4Addr, SocketAddr},
    str::FromStr,
};

use crate::{Error, Result};

/// A transport protocol carried by the userspace stack.
///
/// The stack is IPv4-only on the internal side, so `tcp`/`udp` and their
/// explicit `tcp4`/`udp4` spellings are the only accepted names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

impl FromStr for Transport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" | "tcp4" => Ok(Transport::Tcp),
            "udp" | "udp4" => Ok(Transport::Udp),
            other => Err(Error::UnknownTransport(other.to_owned())),
        }
    }
}

impl Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => f.write_str("tcp"),
            Transport::Udp => f.write_str("udp"),
        }
    }
}

/// Parse a `+`-joined transport list, e.g. `"tcp"`, `"udp"`, `"tcp+udp"`.
pub fn parse_transports(network: &str) -> Result<Vec<Transport>> {
    if network.is_empty() {
        return Err(Error::UnknownTransport(network.to_owned()));
    }
    network.split('+').map(Transport::from_str).collect()
}

/// An IPv4 subnet: a network address and a prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Subnet {
    address: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Subnet {
    /// Create a new subnet. The address is normalized to its network address.
    pub fn new(address: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            return Err(Error::InvalidSubnet(format!("{address}/{prefix}")));
        }
        let mask = mask_bits(prefix);
        Ok(Self { address: Ipv4Addr::from_bits(address.to_bits() & mask), prefix })
    }

    /// The network address.
    pub fn network(&self) -> Ipv4Addr {
        self.address
    }

    /// The prefix length.
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// The netmask as a bit pattern.
    pub fn mask_bits(&self) -> u32 {
        mask_bits(self.prefix)
    }

    /// Whether `ip` falls inside this subnet.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        ip.to_bits() & self.mask_bits() == self.address.to_bits()
    }
}

fn mask_bits(prefix: u8) -> u32 {
    if prefix == 0 { 0 } else { u32::MAX << (32 - u32::from(prefix)) }
}

impl FromStr for Ipv4Subnet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let err = || Error::InvalidSubnet(s.to_owned());
        let (addr, prefix) = s.split_once('/').ok_or_else(err)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| err())?;
        let prefix: u8 = prefix.parse().map_err(|_| err())?;
        Self::new(addr, prefix)
    }
}

impl Display for Ipv4Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

/// A transport-qualified socket address, the shape both ends of a
/// [`Bridge::dial`](crate::Bridge::dial) take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetAddr {
    pub transport: Transport,
    pub addr: SocketAddr,
}

impl NetAddr {
    pub fn new(transport: Transport, addr: SocketAddr) -> Self {
        Self { transport, addr }
    }

    pub fn tcp(addr: SocketAddr) -> Self {
        Self::new(Transport::Tcp, addr)
    }

    pub fn udp(addr: SocketAddr) -> Self {
        Self::new(Transport::Udp, addr)
    }
}

impl Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.transport, self.addr)
    }
}

/// Parse a listener registration: a `+`-joined transport list plus an
/// `"<ipv4-cidr>:<port>"` address, where port `0` matches any port.
pub fn parse_network_address(
    network: &str,
    address: &str,
) -> Result<(Vec<Transport>, Ipv4Subnet, u16)> {
    let transports = parse_transports(network)?;

    let (host, port) =
        address.rsplit_once(':').ok_or_else(|| Error::InvalidAddress(address.to_owned()))?;
    let cidr: Ipv4Subnet = host.parse()?;
    let port: u16 = port.parse().map_err(|_| Error::InvalidPort(port.to_owned()))?;

    Ok((transports, cidr, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_parsing() {
        assert_eq!("tcp".parse::<Transport>().unwrap(), Transport::Tcp);
        assert_eq!("udp4".parse::<Transport>().unwrap(), Transport::Udp);
        assert!("quic".parse::<Transport>().is_err());

        assert_eq!(
            parse_transports("tcp+udp").unwrap(),
            vec![Transport::Tcp, Transport::Udp]
        );
        assert!(parse_transports("").is_err());
        assert!(parse_transports("tcp+ip").is_err());
    }

    #[test]
    fn subnet_contains() {
        let subnet: Ipv4Subnet = "192.168.1.0/24".parse().unwrap();
        assert!(subnet.contains(Ipv4Addr::new(192, 168, 1, 1)));
        assert!(subnet.contains(Ipv4Addr::new(192, 168, 1, 255)));
        assert!(!subnet.contains(Ipv4Addr::new(192, 168, 2, 1)));

        let all: Ipv4Subnet = "0.0.0.0/0".parse().unwrap();
        assert!(all.contains(Ipv4Addr::new(8, 8, 8, 8)));
        assert!(all.contains(Ipv4Addr::new(127, 0, 0, 1)));
    }

    #[test]
    fn subnet_normalizes_host_bits() {
        let subnet: Ipv4Subnet = "192.168.1.40/29".parse().unwrap();
        assert_eq!(subnet.network(), Ipv4Addr::new(192, 168, 1, 40));
        assert!(subnet.contains(Ipv4Addr::new(192, 168, 1, 42)));
        assert!(!subnet.contains(Ipv4Addr::new(192, 168, 1, 48)));
    }

    #[test]
    fn listen_address_grammar() {
        let (transports, cidr, port) =
            parse_network_address("tcp+udp", "192.168.1.40/29:128").unwrap();
        assert_eq!(transports, vec![Transport::Tcp, Transport::Udp]);
        assert_eq!(cidr, "192.168.1.40/29".parse().unwrap());
        assert_eq!(port, 128);

        let (_, _, port) = parse_network_address("udp", "0.0.0.0/0:0").unwrap();
        assert_eq!(port, 0);

        assert!(parse_network_address("tcp", "192.168.1.40/29").is_err());
        assert!(parse_network_address("tcp", "192.168.1.40/29:70000").is_err());
        assert!(parse_network_address("tcp", "fe80::1/64:80").is_err());
    }
}
