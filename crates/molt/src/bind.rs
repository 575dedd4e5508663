//! Listening endpoints: logical addresses, bound listeners, accepted
//! connections.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Deserializer};
use tracing::{info, warn};

/// The logical identity of a listening endpoint.
///
/// The canonical string form (`host:port` or the socket path) is the key
/// under which descriptor exchange services register a socket, so it must be
/// identical across generations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BindAddress {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl BindAddress {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        BindAddress::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        BindAddress::Unix(path.into())
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, BindAddress::Unix(_))
    }

    /// Filesystem path of a Unix socket address.
    pub fn path(&self) -> Option<&Path> {
        match self {
            BindAddress::Unix(path) => Some(path),
            BindAddress::Tcp { .. } => None,
        }
    }
}

impl fmt::Display for BindAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindAddress::Tcp { host, port } if host.contains(':') => write!(f, "[{host}]:{port}"),
            BindAddress::Tcp { host, port } => write!(f, "{host}:{port}"),
            BindAddress::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid bind address {0:?}: expected host:port or a socket path")]
pub struct ParseBindAddressError(String);

impl FromStr for BindAddress {
    type Err = ParseBindAddressError;

    /// Anything containing a `/` is a Unix socket path; otherwise the last
    /// `:` separates host and port (IPv6 hosts may be bracketed).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains('/') {
            return Ok(BindAddress::Unix(PathBuf::from(s)));
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ParseBindAddressError(s.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| ParseBindAddressError(s.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(ParseBindAddressError(s.to_string()));
        }
        Ok(BindAddress::tcp(host, port))
    }
}

impl<'de> Deserialize<'de> for BindAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A bound listening socket, either freshly bound or adopted from another
/// generation.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    /// Bind `addr` directly. `AddrInUse` is the signal that another
    /// generation may own it.
    pub fn bind(addr: &BindAddress) -> io::Result<Self> {
        match addr {
            BindAddress::Tcp { host, port } => {
                let resolved: Vec<SocketAddr> = (host.as_str(), *port).to_socket_addrs()?.collect();
                Ok(Listener::Tcp(TcpListener::bind(resolved.as_slice())?))
            }
            BindAddress::Unix(path) => Ok(Listener::Unix(UnixListener::bind(path)?)),
        }
    }

    /// Adopt a descriptor received from another process for `addr`.
    pub fn from_fd(addr: &BindAddress, fd: OwnedFd) -> Self {
        match addr {
            BindAddress::Tcp { .. } => Listener::Tcp(TcpListener::from(fd)),
            BindAddress::Unix(_) => Listener::Unix(UnixListener::from(fd)),
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Listener::Tcp(l) => l.set_nonblocking(nonblocking),
            Listener::Unix(l) => l.set_nonblocking(nonblocking),
        }
    }

    pub fn accept(&self) -> io::Result<Connection> {
        match self {
            Listener::Tcp(l) => {
                let (stream, peer) = l.accept()?;
                Ok(Connection::Tcp { stream, peer })
            }
            Listener::Unix(l) => {
                let (stream, _) = l.accept()?;
                Ok(Connection::Unix { stream })
            }
        }
    }

    /// Human-readable local address, for logs.
    pub fn local_description(&self) -> String {
        match self {
            Listener::Tcp(l) => l
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "tcp:?".to_string()),
            Listener::Unix(l) => l
                .local_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
                .unwrap_or_else(|| "unix:?".to_string()),
        }
    }

    /// Drop connections that queued up on an adopted socket before this
    /// process was ready to serve them. Leaves the listener non-blocking.
    pub fn drain_backlog(&self) -> io::Result<usize> {
        self.set_nonblocking(true)?;
        let mut dropped = 0;
        loop {
            match self.accept() {
                Ok(conn) => {
                    info!(peer = %conn.peer_description(), "dropping backlogged connection");
                    dropped += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "error while draining backlog");
                    break;
                }
            }
        }
        Ok(dropped)
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Listener::Tcp(l) => l.as_raw_fd(),
            Listener::Unix(l) => l.as_raw_fd(),
        }
    }
}

/// An accepted client connection handed to the request callback.
#[derive(Debug)]
pub enum Connection {
    Tcp { stream: TcpStream, peer: SocketAddr },
    Unix { stream: UnixStream },
}

impl Connection {
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Connection::Tcp { stream, .. } => stream.set_nonblocking(nonblocking),
            Connection::Unix { stream } => stream.set_nonblocking(nonblocking),
        }
    }

    pub fn peer_description(&self) -> String {
        match self {
            Connection::Tcp { peer, .. } => peer.to_string(),
            Connection::Unix { .. } => "unix".to_string(),
        }
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Connection::Tcp { stream, .. } => stream.read(buf),
            Connection::Unix { stream } => stream.read(buf),
        }
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Connection::Tcp { stream, .. } => stream.write(buf),
            Connection::Unix { stream } => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Connection::Tcp { stream, .. } => stream.flush(),
            Connection::Unix { stream } => stream.flush(),
        }
    }
}
