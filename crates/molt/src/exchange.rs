//! Descriptor exchange service.
//!
//! Hands out duplicates of this generation's bound sockets to a process that
//! asks for them by address, so a new generation can serve a port without
//! binding it again.
//!
//! ```text
//! CLIENT                               SERVER
//!   REQ_FD, <address>        ──▶        OK  + SCM_RIGHTS(fd)
//!                                       ERROR, <message>
//!   REQ_PID                  ──▶        OK, <pid>
//!   REQ_ADDRS                ──▶        OK, <count:u32>, <address>...
//!   REQ_UMGMT_ADDR           ──▶        OK, <handoff channel path>
//! ```
//!
//! Unlike the handoff channel, one connection may carry any number of calls;
//! the server loops until the client closes it.

use std::collections::BTreeMap;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::bind::BindAddress;
use crate::channel::{Channel, ChannelError};
use crate::fd_passing::{dup_fd, recv_fd, send_fd};
use crate::server::ControlService;
use crate::Pid;

/// Attempts at receiving a descriptor the server has already queued.
pub const RECV_FD_ATTEMPTS: usize = 5;
const RECV_FD_BACKOFF: Duration = Duration::from_millis(20);

pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Commands understood by the exchange service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeCommand {
    RequestFd,
    RequestPid,
    RequestAddrs,
    RequestHandoffAddr,
}

impl ExchangeCommand {
    pub fn token(self) -> &'static str {
        match self {
            ExchangeCommand::RequestFd => "REQ_FD",
            ExchangeCommand::RequestPid => "REQ_PID",
            ExchangeCommand::RequestAddrs => "REQ_ADDRS",
            ExchangeCommand::RequestHandoffAddr => "REQ_UMGMT_ADDR",
        }
    }

    pub fn parse(token: &[u8]) -> Option<Self> {
        match token {
            b"REQ_FD" => Some(ExchangeCommand::RequestFd),
            b"REQ_PID" => Some(ExchangeCommand::RequestPid),
            b"REQ_ADDRS" => Some(ExchangeCommand::RequestAddrs),
            b"REQ_UMGMT_ADDR" => Some(ExchangeCommand::RequestHandoffAddr),
            _ => None,
        }
    }
}

/// Errors from the client side of descriptor exchange.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("cannot reach descriptor exchange at {path}: {source}")]
    Unreachable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("descriptor receive failed after {attempts} attempts: {source}")]
    RecvFd {
        attempts: usize,
        #[source]
        source: io::Error,
    },

    #[error("malformed pid {0:?}")]
    BadPid(String),
}

/// Canonical address string → owned duplicate of the bound descriptor.
#[derive(Debug, Default)]
pub struct DescriptorRegistry {
    fds: Mutex<BTreeMap<String, OwnedFd>>,
}

impl DescriptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `fd` the answer for `address`. The registry keeps its own
    /// duplicate; the last registration for an address wins.
    pub fn register(&self, address: &str, fd: RawFd) -> io::Result<()> {
        let owned = dup_fd(fd)?;
        info!(address, fd = owned.as_raw_fd(), "registered descriptor");
        self.lock().insert(address.to_string(), owned);
        Ok(())
    }

    /// Duplicate of the descriptor registered for `address`.
    pub fn get(&self, address: &str) -> Option<OwnedFd> {
        self.lock()
            .get(address)
            .and_then(|fd| fd.try_clone().ok())
    }

    pub fn addresses(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Raw descriptors held by the registry (closed in forked workers).
    pub fn raw_fds(&self) -> Vec<RawFd> {
        self.lock().values().map(|fd| fd.as_raw_fd()).collect()
    }

    /// Close every registered descriptor.
    pub fn release_all(&self) {
        let released = std::mem::take(&mut *self.lock());
        if !released.is_empty() {
            info!(count = released.len(), "released registered descriptors");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, OwnedFd>> {
        self.fds.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Server half: answers exchange commands from the registry.
pub struct ExchangeService {
    registry: std::sync::Arc<DescriptorRegistry>,
    pid: Pid,
    handoff_path: PathBuf,
}

impl ExchangeService {
    pub fn new(registry: std::sync::Arc<DescriptorRegistry>, pid: Pid, handoff_path: PathBuf) -> Self {
        Self {
            registry,
            pid,
            handoff_path,
        }
    }

    fn handle_request_fd(&self, channel: &mut Channel<UnixStream>) -> Result<(), ChannelError> {
        let address = channel.recv_string()?;
        match self.registry.get(&address) {
            Some(fd) => {
                info!(address, fd = fd.as_raw_fd(), "handing out descriptor");
                channel.send_ok()?;
                send_fd(channel.get_ref(), fd.as_raw_fd())?;
                Ok(())
            }
            None => {
                error!(address, "no descriptor registered");
                channel.send_error(&format!("No fd matching {address:?}"))
            }
        }
    }
}

impl ControlService for ExchangeService {
    fn name(&self) -> &'static str {
        "fd-exchange"
    }

    fn serve(&self, channel: &mut Channel<UnixStream>) -> Result<(), ChannelError> {
        while let Some(token) = channel.recv_frame_opt()? {
            let command = ExchangeCommand::parse(&token).ok_or_else(|| {
                ChannelError::UnknownCommand(String::from_utf8_lossy(&token).into_owned())
            })?;
            match command {
                ExchangeCommand::RequestFd => self.handle_request_fd(channel)?,
                ExchangeCommand::RequestPid => {
                    channel.send_ok()?;
                    channel.send_str(&self.pid.to_string())?;
                }
                ExchangeCommand::RequestAddrs => {
                    let addresses = self.registry.addresses();
                    channel.send_ok()?;
                    channel.send_u32(addresses.len() as u32)?;
                    for address in &addresses {
                        channel.send_str(address)?;
                    }
                }
                ExchangeCommand::RequestHandoffAddr => {
                    channel.send_ok()?;
                    channel.send_str(&self.handoff_path.to_string_lossy())?;
                }
            }
        }
        Ok(())
    }
}

/// Client half. Every call uses a fresh connection.
#[derive(Debug, Clone)]
pub struct ExchangeClient {
    path: PathBuf,
    timeout: Duration,
}

impl ExchangeClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeout: DEFAULT_CLIENT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self, command: ExchangeCommand) -> Result<Channel<UnixStream>, ExchangeError> {
        let mut channel =
            Channel::connect(&self.path, self.timeout).map_err(|source| ExchangeError::Unreachable {
                path: self.path.clone(),
                source,
            })?;
        channel.send_str(command.token())?;
        Ok(channel)
    }

    /// Acquire a duplicate of the socket the server holds for `address`.
    #[instrument(skip(self), fields(exchange = %self.path.display()))]
    pub fn request_fd(&self, address: &str) -> Result<OwnedFd, ExchangeError> {
        let mut channel = self.connect(ExchangeCommand::RequestFd)?;
        channel.send_str(address)?;
        channel.recv_status()?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match recv_fd(channel.get_ref()) {
                Ok(fd) => {
                    info!(address, fd = fd.as_raw_fd(), "acquired descriptor");
                    return Ok(fd);
                }
                Err(e)
                    if attempt < RECV_FD_ATTEMPTS
                        && matches!(
                            e.kind(),
                            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                        ) =>
                {
                    warn!(address, attempt, error = %e, "descriptor receive not ready, retrying");
                    thread::sleep(RECV_FD_BACKOFF);
                }
                Err(source) => {
                    return Err(ExchangeError::RecvFd {
                        attempts: attempt,
                        source,
                    })
                }
            }
        }
    }

    /// Pid of the process that owns the exchange service.
    pub fn request_pid(&self) -> Result<Pid, ExchangeError> {
        let mut channel = self.connect(ExchangeCommand::RequestPid)?;
        channel.recv_status()?;
        let raw = channel.recv_string()?;
        raw.trim().parse().map_err(|_| ExchangeError::BadPid(raw))
    }

    /// Addresses currently registered with the server.
    pub fn request_addrs(&self) -> Result<Vec<String>, ExchangeError> {
        let mut channel = self.connect(ExchangeCommand::RequestAddrs)?;
        channel.recv_status()?;
        let count = channel.recv_u32()?;
        (0..count)
            .map(|_| channel.recv_string().map_err(ExchangeError::from))
            .collect()
    }

    /// Handoff channel path of the owning generation.
    pub fn request_handoff_addr(&self) -> Result<PathBuf, ExchangeError> {
        let mut channel = self.connect(ExchangeCommand::RequestHandoffAddr)?;
        channel.recv_status()?;
        Ok(PathBuf::from(channel.recv_string()?))
    }
}

/// Bind the exchange service's own well-known path.
///
/// If the path is in use, the incumbent exchange service is asked for a
/// duplicate of its own listening socket, and this process serves on that.
/// If the incumbent cannot be reached the stale path is removed and bound
/// fresh. Returns the listener and whether it was adopted.
pub fn bind_exchange_listener(path: &Path, timeout: Duration) -> io::Result<(UnixListener, bool)> {
    match UnixListener::bind(path) {
        Ok(listener) => {
            info!(path = %path.display(), "bound descriptor exchange");
            Ok((listener, false))
        }
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            info!(path = %path.display(), "requesting bound exchange socket from incumbent");
            let address = BindAddress::unix(path).to_string();
            match ExchangeClient::new(path).with_timeout(timeout).request_fd(&address) {
                Ok(fd) => Ok((UnixListener::from(fd), true)),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "forced teardown of stale exchange socket");
                    std::fs::remove_file(path)?;
                    let listener = UnixListener::bind(path)?;
                    info!(path = %path.display(), "bound descriptor exchange");
                    Ok((listener, false))
                }
            }
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_command_tokens_round_trip() {
        for command in [
            ExchangeCommand::RequestFd,
            ExchangeCommand::RequestPid,
            ExchangeCommand::RequestAddrs,
            ExchangeCommand::RequestHandoffAddr,
        ] {
            assert_eq!(ExchangeCommand::parse(command.token().as_bytes()), Some(command));
        }
        assert_eq!(ExchangeCommand::parse(b"req_fd"), None);
        assert_eq!(ExchangeCommand::parse(b"prune_worker"), None);
    }

    #[test]
    fn test_registry_last_registration_wins() {
        let registry = DescriptorRegistry::new();
        let a = TcpListener::bind("127.0.0.1:0").unwrap();
        let b = TcpListener::bind("127.0.0.1:0").unwrap();
        registry.register("0.0.0.0:80", a.as_raw_fd()).unwrap();
        registry.register("0.0.0.0:80", b.as_raw_fd()).unwrap();
        assert_eq!(registry.len(), 1);

        let fd = registry.get("0.0.0.0:80").unwrap();
        let adopted = TcpListener::from(fd);
        assert_eq!(adopted.local_addr().unwrap(), b.local_addr().unwrap());
    }

    #[test]
    fn test_registry_holds_its_own_duplicate() {
        let registry = DescriptorRegistry::new();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        registry.register("x", listener.as_raw_fd()).unwrap();
        drop(listener);

        let adopted = TcpListener::from(registry.get("x").unwrap());
        assert_eq!(adopted.local_addr().unwrap(), addr);
        assert!(registry.get("y").is_none());
    }

    #[test]
    fn test_release_all_empties_registry() {
        let registry = DescriptorRegistry::new();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        registry.register("x", listener.as_raw_fd()).unwrap();
        registry.release_all();
        assert!(registry.is_empty());
        assert!(registry.addresses().is_empty());
    }
}
