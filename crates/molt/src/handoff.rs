//! Generation handoff channel.
//!
//! A private control server per generation, at `<exchange-path>-<pid>`. Only
//! the *next* generation talks to it, one call per connection:
//!
//! - `prune_worker`: shrink the target by one and terminate one worker
//! - `graceful_shutdown`: acknowledge, then drain every worker
//! - `fd_server_shutdown`: stop the descriptor exchange service

use std::ffi::OsString;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::channel::{Channel, ChannelError};
use crate::exchange::DEFAULT_CLIENT_TIMEOUT;
use crate::server::ControlService;
use crate::Pid;

/// Handoff channel path of generation `pid`.
pub fn handoff_address(exchange_path: &Path, pid: Pid) -> PathBuf {
    let mut name = OsString::from(exchange_path.as_os_str());
    name.push(format!("-{pid}"));
    PathBuf::from(name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffCommand {
    PruneWorker,
    GracefulShutdown,
    FdServerShutdown,
}

impl HandoffCommand {
    pub fn token(self) -> &'static str {
        match self {
            HandoffCommand::PruneWorker => "prune_worker",
            HandoffCommand::GracefulShutdown => "graceful_shutdown",
            HandoffCommand::FdServerShutdown => "fd_server_shutdown",
        }
    }

    pub fn parse(token: &[u8]) -> Option<Self> {
        match token {
            b"prune_worker" => Some(HandoffCommand::PruneWorker),
            b"graceful_shutdown" => Some(HandoffCommand::GracefulShutdown),
            b"fd_server_shutdown" => Some(HandoffCommand::FdServerShutdown),
            _ => None,
        }
    }
}

/// What the handoff channel acts upon: the generation that owns it.
pub trait HandoffTarget: Send + Sync + 'static {
    fn prune_worker(&self) -> Result<(), String>;

    /// Start draining. Must return without waiting for workers to exit.
    fn graceful_shutdown(&self) -> Result<(), String>;

    fn fd_server_shutdown(&self) -> Result<(), String>;
}

pub struct HandoffService<T> {
    target: Arc<T>,
}

impl<T: HandoffTarget> HandoffService<T> {
    pub fn new(target: Arc<T>) -> Self {
        Self { target }
    }
}

impl<T: HandoffTarget> ControlService for HandoffService<T> {
    fn name(&self) -> &'static str {
        "handoff"
    }

    fn serve(&self, channel: &mut Channel<UnixStream>) -> Result<(), ChannelError> {
        let token = channel.recv_frame()?;
        let command = HandoffCommand::parse(&token).ok_or_else(|| {
            ChannelError::UnknownCommand(String::from_utf8_lossy(&token).into_owned())
        })?;
        info!(command = command.token(), "handoff request");
        match command {
            HandoffCommand::PruneWorker => reply(channel, command, self.target.prune_worker()),
            HandoffCommand::GracefulShutdown => {
                // Acknowledge first: draining may take this process down
                // before a late reply could be written.
                channel.send_ok()?;
                if let Err(e) = self.target.graceful_shutdown() {
                    error!(error = %e, "graceful_shutdown failed");
                }
                Ok(())
            }
            HandoffCommand::FdServerShutdown => {
                reply(channel, command, self.target.fd_server_shutdown())
            }
        }
    }
}

fn reply(
    channel: &mut Channel<UnixStream>,
    command: HandoffCommand,
    result: Result<(), String>,
) -> Result<(), ChannelError> {
    match result {
        Ok(()) => channel.send_ok(),
        Err(e) => {
            error!(command = command.token(), error = %e, "handoff command failed");
            channel.send_error(&e)
        }
    }
}

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("cannot reach handoff channel at {path}: {source}")]
    Unreachable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed: {source}")]
    Call {
        command: &'static str,
        #[source]
        source: ChannelError,
    },
}

/// Client for a previous generation's handoff channel.
#[derive(Debug, Clone)]
pub struct HandoffClient {
    path: PathBuf,
    timeout: Duration,
}

impl HandoffClient {
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

    pub fn prune_worker(&self) -> Result<(), HandoffError> {
        self.call(HandoffCommand::PruneWorker)
    }

    pub fn graceful_shutdown(&self) -> Result<(), HandoffError> {
        self.call(HandoffCommand::GracefulShutdown)
    }

    pub fn fd_server_shutdown(&self) -> Result<(), HandoffError> {
        self.call(HandoffCommand::FdServerShutdown)
    }

    /// Issue `command`, logging instead of failing. A vanished predecessor
    /// needs no further coordination.
    pub fn call_best_effort(&self, command: HandoffCommand) -> bool {
        match self.call(command) {
            Ok(()) => true,
            Err(e) => {
                warn!(command = command.token(), error = %e, "handoff call failed, continuing");
                false
            }
        }
    }

    fn call(&self, command: HandoffCommand) -> Result<(), HandoffError> {
        let mut channel =
            Channel::connect(&self.path, self.timeout).map_err(|source| HandoffError::Unreachable {
                path: self.path.clone(),
                source,
            })?;
        let call_err = |source| HandoffError::Call {
            command: command.token(),
            source,
        };
        channel.send_str(command.token()).map_err(call_err)?;
        channel.recv_status().map_err(call_err)
    }
}
