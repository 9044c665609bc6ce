use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Type};
use tokio::net::{TcpListener, UnixListener};

use crate::error::{Error, Result};
use crate::net::socket::{configure_tcp, Socket, Stream};
use crate::net::NetworkAddress;

const LISTEN_BACKLOG: i32 = 8;

/// A bound accept socket for one listener address.
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    pub async fn bind(addr: &NetworkAddress) -> Result<Listener> {
        match addr {
            NetworkAddress::Tcp { host, port } => {
                let target = resolve(host, *port).await?;

                let domain = if target.is_ipv6() {
                    Domain::IPV6
                } else {
                    Domain::IPV4
                };

                let sock = socket2::Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
                sock.set_reuse_address(true)?;
                sock.set_nonblocking(true)?;
                sock.bind(&target.into())?;
                sock.listen(LISTEN_BACKLOG)?;

                Ok(Listener::Tcp(TcpListener::from_std(sock.into())?))
            }

            NetworkAddress::Unix(path) => Ok(Listener::Unix(UnixListener::bind(path)?)),
        }
    }

    /// Accept one client, options applied, ready for the state loop.
    pub async fn accept(&self) -> Result<Socket> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, _peer) = listener.accept().await?;
                configure_tcp(&stream)?;

                Ok(Socket::new(Stream::Tcp(stream)))
            }

            Listener::Unix(listener) => {
                let (stream, _peer) = listener.accept().await?;

                Ok(Socket::new(Stream::Unix(stream)))
            }
        }
    }

    /// The bound address; ephemeral ports resolve to their real value.
    pub fn local_addr(&self) -> io::Result<Option<SocketAddr>> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().map(Some),
            Listener::Unix(_) => Ok(None),
        }
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| Error::Configuration(format!("{host:?} did not resolve to any address")))
}
