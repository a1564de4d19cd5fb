//! Connection objects produced by the bridge.
//!
//! Every connection is a pair of bounded byte channels into the stack task:
//! the stack moves payloads between these channels and its smoltcp sockets on
//! each poll round, so backpressure propagates naturally into the TCP window.
//!
//! Inbound TCP connections are *handshake-deferred*: the SYN that produced
//! them is parked in the stack until the application touches the connection.
//! The first read or write completes the handshake; shutting the connection
//! down before any I/O answers the SYN with an RST; dropping it without
//! either leaves the peer to time out on its own.

use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll, ready},
};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpStream, UdpSocket},
    sync::mpsc,
};
use tokio_util::sync::PollSender;

use crate::{
    addr::Transport,
    stack::{Command, ConnId, StackTx},
};

/// Largest single payload handed to the stack per write.
const MAX_WRITE: usize = 64 * 1024;

/// A bidirectional byte stream with dyno-facing addresses.
///
/// `local_addr`/`remote_addr` are the addresses as the sandboxed workload
/// sees them, not the host's: an inbound flow's local address is the
/// destination the workload dialed, its remote address the workload itself.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {
    fn transport(&self) -> Transport;
    fn local_addr(&self) -> SocketAddr;
    fn remote_addr(&self) -> SocketAddr;
}

/// Handshake progress of an inbound TCP connection.
#[derive(Debug)]
enum Latch {
    /// SYN parked in the stack; no endpoint exists yet.
    Deferred,
    /// Endpoint materialized (or the connection was dialed).
    Established,
}

/// A TCP connection through the userspace stack.
#[derive(Debug)]
pub struct TcpConn {
    id: ConnId,
    local: SocketAddr,
    remote: SocketAddr,
    stack: StackTx,
    rx: mpsc::Receiver<io::Result<Bytes>>,
    tx: PollSender<Bytes>,
    read_buf: Option<Bytes>,
    read_done: bool,
    eof_sent: bool,
    closed: bool,
    latch: Latch,
}

impl TcpConn {
    pub(crate) fn deferred(
        id: ConnId,
        local: SocketAddr,
        remote: SocketAddr,
        rx: mpsc::Receiver<io::Result<Bytes>>,
        tx: mpsc::Sender<Bytes>,
        stack: StackTx,
    ) -> Self {
        Self::new(id, local, remote, rx, tx, stack, Latch::Deferred)
    }

    pub(crate) fn established(
        id: ConnId,
        local: SocketAddr,
        remote: SocketAddr,
        rx: mpsc::Receiver<io::Result<Bytes>>,
        tx: mpsc::Sender<Bytes>,
        stack: StackTx,
    ) -> Self {
        Self::new(id, local, remote, rx, tx, stack, Latch::Established)
    }

    fn new(
        id: ConnId,
        local: SocketAddr,
        remote: SocketAddr,
        rx: mpsc::Receiver<io::Result<Bytes>>,
        tx: mpsc::Sender<Bytes>,
        stack: StackTx,
        latch: Latch,
    ) -> Self {
        Self {
            id,
            local,
            remote,
            stack,
            rx,
            tx: PollSender::new(tx),
            read_buf: None,
            read_done: false,
            eof_sent: false,
            closed: false,
            latch,
        }
    }

    /// Complete the deferred handshake, exactly once, on first use.
    fn ensure_established(&mut self) {
        if matches!(self.latch, Latch::Deferred) {
            self.stack.send(Command::CompleteHandshake { conn: self.id });
            self.latch = Latch::Established;
        }
    }
}

impl AsyncRead for TcpConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.ensure_established();

        // Drain a previously received partial payload first.
        if let Some(mut pending) = self.read_buf.take() {
            let n = pending.len().min(buf.remaining());
            buf.put_slice(&pending.split_to(n));
            if !pending.is_empty() {
                self.read_buf = Some(pending);
            }
            return Poll::Ready(Ok(()));
        }

        if self.read_done {
            return Poll::Ready(Ok(()));
        }

        match ready!(self.rx.poll_recv(cx)) {
            Some(Ok(mut data)) => {
                let n = data.len().min(buf.remaining());
                buf.put_slice(&data.split_to(n));
                if !data.is_empty() {
                    self.read_buf = Some(data);
                }
                // Freed channel capacity lifts the stack's backpressure.
                self.stack.kick();
                Poll::Ready(Ok(()))
            }
            Some(Err(err)) => {
                self.read_done = true;
                Poll::Ready(Err(err))
            }
            // Stack dropped its sender: clean EOF.
            None => {
                self.read_done = true;
                Poll::Ready(Ok(()))
            }
        }
    }
}

impl AsyncWrite for TcpConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        self.ensure_established();

        match ready!(self.tx.poll_reserve(cx)) {
            Ok(()) => {
                let n = buf.len().min(MAX_WRITE);
                if self.tx.send_item(Bytes::copy_from_slice(&buf[..n])).is_err() {
                    return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
                }
                self.stack.kick();
                Poll::Ready(Ok(n))
            }
            Err(_) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if matches!(self.latch, Latch::Deferred) {
            // Closed before any I/O: answer the parked SYN with an RST.
            self.stack.send(Command::Reset { conn: self.id });
            self.closed = true;
            self.latch = Latch::Established;
            self.eof_sent = true;
            return Poll::Ready(Ok(()));
        }

        if !self.eof_sent {
            // Write-side close travels in-band (empty payload sentinel) so it
            // cannot overtake queued data.
            match ready!(self.tx.poll_reserve(cx)) {
                Ok(()) => {
                    let _ = self.tx.send_item(Bytes::new());
                    self.eof_sent = true;
                    self.closed = true;
                    self.stack.kick();
                }
                Err(_) => {
                    // Stack already tore the connection down.
                    self.eof_sent = true;
                    self.closed = true;
                }
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for TcpConn {
    fn drop(&mut self) {
        if !self.closed && matches!(self.latch, Latch::Deferred) {
            // Dropped before any I/O: leave the handshake to time out at the
            // peer. The stack only needs to forget the parked SYN.
            self.stack.send(Command::Forget { conn: self.id });
        }
        // For established connections the closing write-half sender is enough:
        // the stack drains buffered payloads and then closes the endpoint.
        self.stack.kick();
    }
}

impl Conn for TcpConn {
    fn transport(&self) -> Transport {
        Transport::Tcp
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
}

/// A UDP connection through the userspace stack.
///
/// The endpoint exists from the moment the connection is handed out. Reads
/// return one datagram at a time, truncating to the caller's buffer.
#[derive(Debug)]
pub struct UdpConn {
    local: SocketAddr,
    remote: SocketAddr,
    stack: StackTx,
    rx: mpsc::Receiver<io::Result<Bytes>>,
    tx: PollSender<Bytes>,
    read_done: bool,
}

impl UdpConn {
    pub(crate) fn new(
        local: SocketAddr,
        remote: SocketAddr,
        rx: mpsc::Receiver<io::Result<Bytes>>,
        tx: mpsc::Sender<Bytes>,
        stack: StackTx,
    ) -> Self {
        Self { local, remote, stack, rx, tx: PollSender::new(tx), read_done: false }
    }
}

impl AsyncRead for UdpConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.read_done {
            return Poll::Ready(Ok(()));
        }
        match ready!(self.rx.poll_recv(cx)) {
            Some(Ok(data)) => {
                let n = data.len().min(buf.remaining());
                buf.put_slice(&data[..n]);
                self.stack.kick();
                Poll::Ready(Ok(()))
            }
            Some(Err(err)) => Poll::Ready(Err(err)),
            None => {
                self.read_done = true;
                Poll::Ready(Ok(()))
            }
        }
    }
}

impl AsyncWrite for UdpConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match ready!(self.tx.poll_reserve(cx)) {
            Ok(()) => {
                let n = buf.len().min(MAX_WRITE);
                if self.tx.send_item(Bytes::copy_from_slice(&buf[..n])).is_err() {
                    return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
                }
                self.stack.kick();
                Poll::Ready(Ok(n))
            }
            Err(_) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl Drop for UdpConn {
    fn drop(&mut self) {
        // Closing the byte channels is the whole teardown: the stack notices
        // the disconnect on its next round and reaps the endpoint.
        self.stack.kick();
    }
}

impl Conn for UdpConn {
    fn transport(&self) -> Transport {
        Transport::Udp
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
}

/// A connection accepted from or dialed through the bridge.
#[derive(Debug)]
pub enum BridgeConn {
    Tcp(TcpConn),
    Udp(UdpConn),
}

impl BridgeConn {
    pub fn transport(&self) -> Transport {
        match self {
            BridgeConn::Tcp(_) => Transport::Tcp,
            BridgeConn::Udp(_) => Transport::Udp,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        match self {
            BridgeConn::Tcp(c) => c.local_addr(),
            BridgeConn::Udp(c) => c.local_addr(),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        match self {
            BridgeConn::Tcp(c) => c.remote_addr(),
            BridgeConn::Udp(c) => c.remote_addr(),
        }
    }
}

impl AsyncRead for BridgeConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BridgeConn::Tcp(c) => Pin::new(c).poll_read(cx, buf),
            BridgeConn::Udp(c) => Pin::new(c).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BridgeConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            BridgeConn::Tcp(c) => Pin::new(c).poll_write(cx, buf),
            BridgeConn::Udp(c) => Pin::new(c).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BridgeConn::Tcp(c) => Pin::new(c).poll_flush(cx),
            BridgeConn::Udp(c) => Pin::new(c).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BridgeConn::Tcp(c) => Pin::new(c).poll_shutdown(cx),
            BridgeConn::Udp(c) => Pin::new(c).poll_shutdown(cx),
        }
    }
}

impl Conn for BridgeConn {
    fn transport(&self) -> Transport {
        BridgeConn::transport(self)
    }

    fn local_addr(&self) -> SocketAddr {
        BridgeConn::local_addr(self)
    }

    fn remote_addr(&self) -> SocketAddr {
        BridgeConn::remote_addr(self)
    }
}

/// A real host-side connection, the external leg of an egress splice.
pub enum HostConn {
    Tcp(TcpStream),
    Udp(UdpStream),
}

impl AsyncRead for HostConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            HostConn::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            HostConn::Udp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for HostConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            HostConn::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            HostConn::Udp(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            HostConn::Tcp(s) => Pin::new(s).poll_flush(cx),
            HostConn::Udp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            HostConn::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            HostConn::Udp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// A connected UDP socket adapted to the stream interface so it can be
/// spliced like any other connection. Each write is one datagram; each read
/// yields one datagram, truncated to the buffer.
pub struct UdpStream {
    socket: UdpSocket,
}

impl UdpStream {
    pub fn new(socket: UdpSocket) -> Self {
        Self { socket }
    }
}

impl AsyncRead for UdpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.socket.poll_recv(cx, buf)
    }
}

impl AsyncWrite for UdpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
