//! Polling accept loop shared by the exchange and handoff control servers.
//!
//! Each server owns a Unix listener and one named background thread. The
//! thread waits for connections with a bounded `poll(2)` so a stop request is
//! observed within [`POLL_INTERVAL`], never blocking forever in `accept()`.

use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::channel::{Channel, ChannelError};

pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Per-connection read/write timeout. Large enough that a busy peer does not
/// see spurious timeouts, small enough that a stuck peer cannot pin the
/// server thread forever.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// How long `stop()` waits for the server thread to notice the stop flag.
pub const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// The request handling half of a control server.
pub trait ControlService: Send + Sync + 'static {
    /// Thread name and log label.
    fn name(&self) -> &'static str;

    /// Serve one accepted connection. An error closes the connection.
    fn serve(&self, channel: &mut Channel<UnixStream>) -> Result<(), ChannelError>;
}

/// Cloneable handle that stops a running control server and waits for its
/// accept loop to exit.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl StopHandle {
    /// Stop accepting and wait up to [`TEARDOWN_TIMEOUT`] for the accept
    /// loop. Once this returns `true` no further connection is served.
    pub fn stop(&self) -> bool {
        self.request();
        let mut slot = self.thread.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(handle) = slot.take() else {
            return true;
        };
        let deadline = Instant::now() + TEARDOWN_TIMEOUT;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if handle.is_finished() {
            let _ = handle.join();
            true
        } else {
            false
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn request(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn attach(&self, handle: JoinHandle<()>) {
        *self.thread.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
    }

    fn is_running(&self) -> bool {
        self.thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    fn is_started(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
            || self
                .thread
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .is_some()
    }
}

/// A bound (and possibly running) control server.
pub struct ControlServer {
    path: PathBuf,
    listener: Arc<UnixListener>,
    stop: StopHandle,
}

impl ControlServer {
    /// Bind a fresh listener at `path`, replacing a stale socket file.
    ///
    /// Only for per-generation addresses nobody else can legitimately hold.
    pub fn bind_exclusive(path: &Path) -> io::Result<Self> {
        let listener = match UnixListener::bind(path) {
            Ok(listener) => listener,
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                warn!(path = %path.display(), "removing stale control socket");
                std::fs::remove_file(path)?;
                UnixListener::bind(path)?
            }
            Err(e) => return Err(e),
        };
        Ok(Self::from_listener(path, listener))
    }

    /// Wrap an already bound (or adopted) listener.
    pub fn from_listener(path: &Path, listener: UnixListener) -> Self {
        Self {
            path: path.to_path_buf(),
            listener: Arc::new(listener),
            stop: StopHandle::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn listener(&self) -> &UnixListener {
        &self.listener
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn is_running(&self) -> bool {
        self.stop.is_running()
    }

    /// Start the accept loop on a background thread.
    pub fn start<S: ControlService>(&mut self, service: Arc<S>) -> io::Result<()> {
        if self.stop.is_started() {
            return Ok(());
        }
        self.listener.set_nonblocking(true)?;
        let listener = Arc::clone(&self.listener);
        let stop = self.stop.clone();
        let path = self.path.clone();
        let handle = thread::Builder::new()
            .name(service.name().to_string())
            .spawn(move || serve_forever(&listener, &path, &stop, service.as_ref()))?;
        self.stop.attach(handle);
        Ok(())
    }

    /// Stop the accept loop, wait briefly for the thread, and optionally
    /// remove the socket path.
    pub fn stop(&mut self, unlink: bool) {
        if !self.stop.stop() {
            warn!(path = %self.path.display(), "control server thread did not stop in time");
        }
        if unlink {
            match std::fs::remove_file(&self.path) {
                Ok(()) => debug!(path = %self.path.display(), "removed control socket"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => error!(path = %self.path.display(), error = %e, "error removing control socket"),
            }
        }
    }
}

fn serve_forever<S: ControlService>(
    listener: &UnixListener,
    path: &Path,
    stop: &StopHandle,
    service: &S,
) {
    info!(server = service.name(), path = %path.display(), "control server started");
    while !stop.is_stopped() {
        match wait_readable(listener, POLL_INTERVAL) {
            Ok(false) => continue,
            Ok(true) if stop.is_stopped() => break,
            Ok(true) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(server = service.name(), error = %e, "poll failed, stopping control server");
                break;
            }
        }
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            // Another process sharing this socket won the race.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(server = service.name(), error = %e, "accept failed");
                continue;
            }
        };
        if let Err(e) = prepare(&stream) {
            warn!(server = service.name(), error = %e, "failed to configure control connection");
            continue;
        }
        let mut channel = Channel::new(stream);
        if let Err(e) = service.serve(&mut channel) {
            debug!(server = service.name(), error = %e, "closing control connection");
        }
    }
    info!(server = service.name(), path = %path.display(), "control server stopped");
}

fn prepare(stream: &UnixStream) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(CONNECTION_TIMEOUT))?;
    stream.set_write_timeout(Some(CONNECTION_TIMEOUT))
}

/// Wait up to `timeout` for `fd` to become readable.
pub(crate) fn wait_readable(fd: &impl AsRawFd, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    let n = unsafe { libc::poll(&mut pfd, 1, millis) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Echo;

    impl ControlService for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn serve(&self, channel: &mut Channel<UnixStream>) -> Result<(), ChannelError> {
            let frame = channel.recv_frame()?;
            if frame == b"boom" {
                return Err(ChannelError::UnknownCommand("boom".into()));
            }
            channel.send_ok()?;
            channel.send_frame(&frame)
        }
    }

    #[test]
    fn test_serves_one_call_per_connection_and_survives_bad_requests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.sock");
        let mut server = ControlServer::bind_exclusive(&path).unwrap();
        server.start(Arc::new(Echo)).unwrap();

        let mut bad = Channel::connect(&path, Duration::from_secs(5)).unwrap();
        bad.send_str("boom").unwrap();
        assert!(bad.recv_frame().is_err(), "server should close the connection");

        let mut good = Channel::connect(&path, Duration::from_secs(5)).unwrap();
        good.send_str("hello").unwrap();
        good.recv_status().unwrap();
        assert_eq!(good.recv_frame().unwrap(), b"hello");

        server.stop(true);
        assert!(!server.is_running());
        assert!(!path.exists());
    }

    #[test]
    fn test_stopped_server_leaves_queued_connection_unanswered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.sock");
        let mut server = ControlServer::bind_exclusive(&path).unwrap();
        server.start(Arc::new(Echo)).unwrap();
        let handle = server.stop_handle();

        // Raise the flag without joining; the loop is parked in poll.
        handle.request();
        let mut late = Channel::connect(&path, Duration::from_millis(700)).unwrap();
        late.send_str("hello").unwrap();
        assert!(late.recv_status().is_err(), "stopped server answered");

        assert!(handle.stop());
        assert!(!server.is_running());
        server.stop(true);
        assert!(!path.exists());
    }

    #[test]
    fn test_bind_exclusive_replaces_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        drop(UnixListener::bind(&path).unwrap());
        assert!(path.exists());
        let server = ControlServer::bind_exclusive(&path).unwrap();
        assert_eq!(server.path(), path.as_path());
    }
}
