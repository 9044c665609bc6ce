use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::{TcpStream, UnixStream};

use crate::error::Result;
use crate::net::queue::ByteQueue;
use crate::net::NetworkAddress;
use crate::protocol::connect::{AuthResponse, Handshake};
use crate::protocol::{Capabilities, PacketFramer};

/// Outcome of one non-blocking network step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// Progress was made and more may be possible immediately.
    Ready,

    /// The kernel would block; re-enter on the next readiness event.
    WaitForEvent,

    /// The peer shut its end down.
    Closed,
}

/// The underlying connected stream, TCP or Unix-domain.
#[derive(Debug)]
pub enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    /// Non-blocking connect through the runtime's resolver.
    pub async fn connect(addr: &NetworkAddress) -> io::Result<Stream> {
        match addr {
            NetworkAddress::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                configure_tcp(&stream)?;

                Ok(Stream::Tcp(stream))
            }

            NetworkAddress::Unix(path) => Ok(Stream::Unix(UnixStream::connect(path).await?)),
        }
    }

    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.try_read(buf),
            Stream::Unix(s) => s.try_read(buf),
        }
    }

    pub fn try_write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.try_write_vectored(bufs),
            Stream::Unix(s) => s.try_write_vectored(bufs),
        }
    }

    pub async fn readable(&self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.readable().await,
            Stream::Unix(s) => s.readable().await,
        }
    }

    pub async fn writable(&self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.writable().await,
            Stream::Unix(s) => s.writable().await,
        }
    }
}

/// The reference client's socket options.
pub(crate) fn configure_tcp(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;

    let sock = socket2::SockRef::from(stream);
    sock.set_keepalive(true)?;

    // IPTOS_THROUGHPUT; only meaningful for IPv4
    let _ = sock.set_tos(8);

    Ok(())
}

/// One side of a proxied conversation: a non-blocking stream plus the
/// byte queues addressed by packet boundaries.
///
/// A socket is exclusively owned by one connection-state instance (or by
/// the idle pool) at a time.
#[derive(Debug)]
pub struct Socket {
    /// Shared so the idle pool's eviction watchdog can wait for
    /// readability without taking the socket apart.
    stream: Arc<Stream>,

    /// Bytes off the wire, not yet framed.
    pub recv_raw: ByteQueue,

    /// Whole frames, header included.
    pub recv: VecDeque<Bytes>,

    /// Framed bytes awaiting the kernel.
    pub send: ByteQueue,

    pub framer: PacketFramer,

    /// Peer capabilities recorded after the handshake.
    pub capabilities: Capabilities,

    pub default_db: String,

    /// Last auth challenge seen on this conversation (server side of the
    /// proxy: the upstream's greeting; client side: what we sent).
    pub challenge: Option<Handshake>,

    /// Last auth response seen (the identity this socket authenticated
    /// as, once the server accepted it).
    pub response: Option<AuthResponse>,

    is_authed: bool,
}

impl Socket {
    pub fn new(stream: Stream) -> Self {
        Self {
            stream: Arc::new(stream),
            recv_raw: ByteQueue::new(),
            recv: VecDeque::new(),
            send: ByteQueue::new(),
            framer: PacketFramer::new(),
            capabilities: Capabilities::base(),
            default_db: String::new(),
            challenge: None,
            response: None,
            is_authed: false,
        }
    }

    pub async fn connect(addr: &NetworkAddress) -> io::Result<Self> {
        Ok(Self::new(Stream::connect(addr).await?))
    }

    pub fn is_authed(&self) -> bool {
        self.is_authed
    }

    pub fn set_authed(&mut self, authed: bool) {
        self.is_authed = authed;
    }

    /// The username this socket authenticated as, if any.
    pub fn username(&self) -> Option<&str> {
        self.response.as_ref().map(|r| r.username.as_str())
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    /// A handle for the pool watchdog; see [`crate::pool`].
    pub fn stream_handle(&self) -> Arc<Stream> {
        Arc::clone(&self.stream)
    }

    pub async fn readable(&self) -> io::Result<()> {
        self.stream.readable().await
    }

    pub async fn writable(&self) -> io::Result<()> {
        self.stream.writable().await
    }

    /// Pull whatever the kernel has into the raw queue and frame it.
    pub fn receive(&mut self) -> Result<IoStatus> {
        let status = self.read_raw()?;
        self.unframe()?;

        Ok(status)
    }

    fn read_raw(&mut self) -> Result<IoStatus> {
        let mut total = 0usize;
        let mut buf = [0u8; 16 * 1024];

        loop {
            match self.stream.try_read(&mut buf) {
                Ok(0) => {
                    return Ok(if total > 0 {
                        // deliver what we got; the close surfaces on the
                        // next read
                        IoStatus::Ready
                    } else {
                        IoStatus::Closed
                    });
                }

                Ok(n) => {
                    self.recv_raw.push(Bytes::copy_from_slice(&buf[..n]));
                    total += n;
                }

                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(if total > 0 {
                        IoStatus::Ready
                    } else {
                        IoStatus::WaitForEvent
                    });
                }

                Err(e) => return Err(e.into()),
            }
        }
    }

    fn unframe(&mut self) -> Result<()> {
        while let Some(frame) = self.framer.unframe(&mut self.recv_raw)? {
            self.recv.push_back(frame);
        }

        Ok(())
    }

    /// Next complete frame, if one has been assembled.
    pub fn pop_packet(&mut self) -> Option<Bytes> {
        self.recv.pop_front()
    }

    /// Queue a received frame verbatim; sequence bookkeeping follows the
    /// frame's own id.
    pub fn queue_frame(&mut self, frame: Bytes) {
        self.framer.observe(&frame);
        self.send.push(frame);
    }

    /// Frame and queue a payload with this socket's next sequence id.
    pub fn queue_payload(&mut self, payload: &[u8]) {
        self.framer.frame(&mut self.send, payload);
    }

    /// Flush the send queue with one vectored write.
    pub fn try_flush(&mut self) -> Result<IoStatus> {
        while !self.send.is_empty() {
            let mut slices = Vec::new();
            self.send.io_slices(&mut slices);

            match self.stream.try_write_vectored(&slices) {
                Ok(0) => {
                    drop(slices);
                    return Ok(IoStatus::Closed);
                }

                Ok(n) => {
                    drop(slices);
                    self.send.consume(n);
                }

                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(IoStatus::WaitForEvent);
                }

                Err(e) => return Err(e.into()),
            }
        }

        Ok(IoStatus::Ready)
    }

    /// `true` when nothing is queued in either direction; only a quiet
    /// socket may enter the idle pool.
    pub fn is_quiet(&self) -> bool {
        self.recv_raw.is_empty() && self.recv.is_empty() && self.send.is_empty()
    }
}
