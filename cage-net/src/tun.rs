//! TUN device plumbing.
//!
//! The device is created with the classic `/dev/net/tun` + `TUNSETIFF`
//! ioctl (`IFF_TUN | IFF_NO_PI`, so reads and writes are raw IP frames) and
//! driven non-blocking through tokio's [`AsyncFd`]. The interface lands in
//! whichever network namespace the calling thread is in, which is exactly
//! what [`Network::setup`](crate::Network::setup) arranges.

use std::{
    fs::OpenOptions,
    io,
    os::fd::{AsRawFd, OwnedFd},
};

use tokio::io::unix::AsyncFd;

use crate::Result;

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

#[repr(C)]
struct IfReq {
    ifr_name: [u8; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
}

/// Open `/dev/net/tun` and attach it to the interface `name`, returning the
/// non-blocking file descriptor.
pub(crate) fn open(name: &str) -> Result<OwnedFd> {
    if name.is_empty() || name.len() >= libc::IFNAMSIZ {
        return Err(crate::Error::InvalidAddress(name.to_owned()));
    }

    let file = OpenOptions::new().read(true).write(true).open("/dev/net/tun")?;

    let mut req = IfReq { ifr_name: [0; libc::IFNAMSIZ], ifr_flags: IFF_TUN | IFF_NO_PI };
    req.ifr_name[..name.len()].copy_from_slice(name.as_bytes());

    // SAFETY: req is a properly initialized ifreq and outlives the call.
    if unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &req) } < 0 {
        return Err(io::Error::last_os_error().into());
    }

    let flags = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error().into());
    }
    if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error().into());
    }

    Ok(OwnedFd::from(file))
}

/// The interface index for a device name.
pub(crate) fn if_index(name: &str) -> Result<u32> {
    nix::net::if_::if_nametoindex(name)
        .map_err(|err| crate::Error::Io(io::Error::from_raw_os_error(err as i32)))
}

/// Async frame I/O over the TUN file descriptor. One read is one IP frame.
pub(crate) struct TunIo {
    fd: AsyncFd<OwnedFd>,
    mtu: usize,
}

impl TunIo {
    pub(crate) fn new(fd: OwnedFd, mtu: usize) -> io::Result<Self> {
        Ok(Self { fd: AsyncFd::new(fd)?, mtu })
    }

    pub(crate) async fn recv(&mut self) -> io::Result<Vec<u8>> {
        loop {
            let mut guard = self.fd.readable().await?;
            let mut buf = vec![0u8; self.mtu.max(1500)];
            match guard.try_io(|fd| {
                let n = unsafe {
                    libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
                };
                if n < 0 { Err(io::Error::last_os_error()) } else { Ok(n as usize) }
            }) {
                Ok(Ok(n)) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                Ok(Err(err)) => return Err(err),
                Err(_would_block) => continue,
            }
        }
    }

    pub(crate) async fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|fd| {
                let n = unsafe {
                    libc::write(fd.as_raw_fd(), frame.as_ptr().cast(), frame.len())
                };
                if n < 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
            }) {
                Ok(res) => return res,
                Err(_would_block) => continue,
            }
        }
    }
}
