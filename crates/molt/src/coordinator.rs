//! Generation coordinator.
//!
//! Drives one generation from startup lock to teardown:
//!
//! 1. take the startup lock
//! 2. bind every listener, or acquire it from the incumbent generation
//! 3. bind, then start, the exchange, handoff and admin servers
//! 4. spawn workers, pruning one predecessor worker after each fork
//! 5. tell the predecessor to drain and to stop its exchange service
//! 6. release the lock and supervise until shutdown

use std::io;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::bind::{BindAddress, Listener};
use crate::config::GenerationConfig;
use crate::exchange::{bind_exchange_listener, DescriptorRegistry, ExchangeClient, ExchangeService};
use crate::handoff::{handoff_address, HandoffClient, HandoffCommand, HandoffService, HandoffTarget};
use crate::lock::{LockError, StartupLock};
use crate::resources::MemorySampler;
use crate::server::{ControlServer, StopHandle};
use crate::signals::{install_parent_handlers, LoopSignals};
use crate::supervisor::{LoopExit, Supervisor};
use crate::worker::{Hooks, RequestHandler, ServeLoop};
use crate::Pid;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("cannot bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot register descriptor for {address}: {source}")]
    Register {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("{server} control server at {path}: {source}")]
    ControlServer {
        server: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot start {server}: {source}")]
    Auxiliary {
        server: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("cannot install signal handlers: {0}")]
    Signals(#[source] io::Error),
}

/// An extra server living in the supervisor process, such as the admin
/// front-end. Its listener goes through the same bind-or-acquire path as the
/// worker listeners, so it survives generation changes too.
pub trait AuxiliaryServer: Send {
    fn name(&self) -> &'static str;

    fn address(&self) -> &BindAddress;

    /// Start serving `listener` in the background.
    fn start(&mut self, listener: Listener, supervisor: Supervisor) -> io::Result<()>;

    fn stop(&mut self);
}

/// How a generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub pid: Pid,
    pub exit: LoopExit,
    /// A successor took over before teardown.
    pub superseded: bool,
    /// Workers still alive after the drain gave up.
    pub unreaped: usize,
}

/// State of one running generation, shared with its control-server threads.
pub struct Generation {
    pid: Pid,
    addresses: Vec<BindAddress>,
    registry: Arc<DescriptorRegistry>,
    supervisor: Supervisor,
    superseded: AtomicBool,
    exchange_path: PathBuf,
    handoff_path: PathBuf,
    exchange_stop: Mutex<Option<StopHandle>>,
}

impl Generation {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn addresses(&self) -> &[BindAddress] {
        &self.addresses
    }

    pub fn registry(&self) -> &Arc<DescriptorRegistry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn exchange_path(&self) -> &std::path::Path {
        &self.exchange_path
    }

    pub fn handoff_path(&self) -> &std::path::Path {
        &self.handoff_path
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded.load(Ordering::SeqCst)
    }

    fn mark_superseded(&self) {
        if !self.superseded.swap(true, Ordering::SeqCst) {
            info!(pid = self.pid, "successor generation is taking over");
        }
    }
}

impl HandoffTarget for Generation {
    fn prune_worker(&self) -> Result<(), String> {
        // Only a successor talks to the handoff channel, so from here on the
        // shared exchange path belongs to it.
        self.mark_superseded();
        self.supervisor
            .handle_prune_worker()
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn graceful_shutdown(&self) -> Result<(), String> {
        self.mark_superseded();
        self.supervisor.graceful_shutdown();
        Ok(())
    }

    fn fd_server_shutdown(&self) -> Result<(), String> {
        self.mark_superseded();
        let stop = self
            .exchange_stop
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        match stop {
            Some(handle) => {
                info!(path = %self.exchange_path.display(), "stopping descriptor exchange for successor");
                // The successor releases the startup lock on this reply, so
                // the accept loop must be gone before it is sent.
                if handle.stop() {
                    Ok(())
                } else {
                    Err("descriptor exchange did not stop in time".to_string())
                }
            }
            None => Err("descriptor exchange is not running".to_string()),
        }
    }
}

/// The generation this one is replacing.
#[derive(Debug)]
struct Predecessor {
    pid: Pid,
    handoff: HandoffClient,
}

pub struct Coordinator {
    config: GenerationConfig,
    handler: Arc<dyn RequestHandler>,
    hooks: Arc<Hooks>,
    admin: Option<Box<dyn AuxiliaryServer>>,
    sampler: Option<Box<dyn MemorySampler>>,
    signals: Option<LoopSignals<'static>>,
}

impl Coordinator {
    pub fn new(config: GenerationConfig, handler: Arc<dyn RequestHandler>) -> Self {
        Self {
            config,
            handler,
            hooks: Arc::new(Hooks::new()),
            admin: None,
            sampler: None,
            signals: None,
        }
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    pub fn with_admin(mut self, admin: Box<dyn AuxiliaryServer>) -> Self {
        self.admin = Some(admin);
        self
    }

    pub fn with_sampler(mut self, sampler: Box<dyn MemorySampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// Poll these flags instead of installing process signal handlers.
    pub fn with_signals(mut self, signals: LoopSignals<'static>) -> Self {
        self.signals = Some(signals);
        self
    }

    /// Run the generation to completion.
    #[instrument(skip(self), fields(exchange = %self.config.exchange_path.display()))]
    pub fn run(self) -> Result<RunOutcome, CoordinatorError> {
        let Coordinator {
            config,
            handler,
            hooks,
            mut admin,
            sampler,
            signals,
        } = self;
        let pid = unsafe { libc::getpid() };
        let lock = StartupLock::acquire(&config.lock_path())?;
        let client = ExchangeClient::new(&config.exchange_path).with_timeout(config.client_timeout());

        let registry = Arc::new(DescriptorRegistry::new());
        let mut predecessor: Option<Predecessor> = None;
        let mut listeners = Vec::with_capacity(config.listen.len());
        for address in &config.listen {
            let (listener, incumbent) = acquire_listener(address, &client)?;
            register(&registry, address, &listener)?;
            listener.set_nonblocking(true).map_err(|source| CoordinatorError::Bind {
                address: address.to_string(),
                source,
            })?;
            info!(address = %address, local = %listener.local_description(), "listening");
            if predecessor.is_none() {
                predecessor = incumbent.map(|pid| find_predecessor(&config, &client, pid));
            }
            listeners.push(listener);
        }

        let admin_listener = match admin.as_ref() {
            Some(server) => {
                let address = server.address().clone();
                let (listener, incumbent) = acquire_listener(&address, &client)?;
                if incumbent.is_some() {
                    match listener.drain_backlog() {
                        Ok(0) => {}
                        Ok(dropped) => info!(address = %address, dropped, "cleared admin backlog"),
                        Err(e) => warn!(address = %address, error = %e, "cannot clear admin backlog"),
                    }
                }
                register(&registry, &address, &listener)?;
                Some(listener)
            }
            None => None,
        };

        let body = ServeLoop::new(Arc::new(listeners), handler).with_hooks(hooks);
        let supervisor = match sampler {
            Some(sampler) => Supervisor::with_sampler(&config.supervisor, Arc::new(body), sampler),
            None => Supervisor::new(&config.supervisor, Arc::new(body)),
        };

        let handoff_path = handoff_address(&config.exchange_path, pid);
        let generation = Arc::new(Generation {
            pid,
            addresses: config.listen.clone(),
            registry: Arc::clone(&registry),
            supervisor: supervisor.clone(),
            superseded: AtomicBool::new(false),
            exchange_path: config.exchange_path.clone(),
            handoff_path: handoff_path.clone(),
            exchange_stop: Mutex::new(None),
        });

        let mut plane = ControlPlane::bind(&config, &generation)?;
        for fd in registry.raw_fds() {
            supervisor.add_parent_only_fd(fd);
        }
        supervisor.add_parent_only_fd(plane.exchange.listener().as_raw_fd());
        supervisor.add_parent_only_fd(plane.handoff.listener().as_raw_fd());
        if let Some(fd) = lock.raw_fd() {
            supervisor.add_parent_only_fd(fd);
        }
        if let Some(listener) = admin_listener.as_ref() {
            supervisor.add_parent_only_fd(listener.as_raw_fd());
        }

        if let Err(e) = plane.start(&generation, admin.as_deref_mut(), admin_listener) {
            plane.stop(admin.as_deref_mut(), false);
            return Err(e);
        }
        plane.admin_started = admin.is_some();

        let signals = match signals {
            Some(signals) => signals,
            None => {
                if let Err(e) = install_parent_handlers() {
                    plane.stop(admin.as_deref_mut(), false);
                    return Err(CoordinatorError::Signals(e));
                }
                LoopSignals::process()
            }
        };

        let early_exit = supervisor.converge(&signals, |_| {
            if let Some(previous) = predecessor.as_ref() {
                previous.handoff.call_best_effort(HandoffCommand::PruneWorker);
            }
        });
        if early_exit.is_none() {
            if let Some(previous) = predecessor.as_ref() {
                info!(predecessor = previous.pid, "converged, releasing previous generation");
                previous.handoff.call_best_effort(HandoffCommand::GracefulShutdown);
                previous.handoff.call_best_effort(HandoffCommand::FdServerShutdown);
            }
        }
        lock.release();

        let exit = match early_exit {
            Some(exit) => exit,
            None => supervisor.reap_loop(&signals),
        };
        info!(?exit, "supervision loop finished");

        let unreaped = supervisor.drain_and_wait();
        let superseded = generation.is_superseded();
        plane.stop(admin.as_deref_mut(), superseded);
        if !superseded {
            for path in generation.addresses().iter().filter_map(BindAddress::path) {
                if let Err(e) = std::fs::remove_file(path) {
                    if e.kind() != io::ErrorKind::NotFound {
                        warn!(path = %path.display(), error = %e, "cannot remove listener socket");
                    }
                }
            }
        }
        registry.release_all();
        supervisor.mark_stopped();
        info!(pid, superseded, unreaped, "generation stopped");

        Ok(RunOutcome {
            pid,
            exit,
            superseded,
            unreaped,
        })
    }
}

/// Bind `address`, or take it over from the generation currently holding it.
/// Returns the incumbent's pid when the socket was acquired.
fn acquire_listener(
    address: &BindAddress,
    client: &ExchangeClient,
) -> Result<(Listener, Option<Pid>), CoordinatorError> {
    let bind_err = |source| CoordinatorError::Bind {
        address: address.to_string(),
        source,
    };
    match Listener::bind(address) {
        Ok(listener) => Ok((listener, None)),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            info!(address = %address, "address in use, requesting socket from incumbent");
            let acquired = client
                .request_pid()
                .and_then(|pid| Ok((pid, client.request_fd(&address.to_string())?)));
            match acquired {
                Ok((pid, fd)) => {
                    info!(address = %address, incumbent = pid, "acquired socket from incumbent");
                    Ok((Listener::from_fd(address, fd), Some(pid)))
                }
                Err(err) => {
                    warn!(address = %address, error = %err, "cannot acquire socket, binding fresh");
                    if let Some(path) = address.path() {
                        std::fs::remove_file(path).map_err(bind_err)?;
                    }
                    Listener::bind(address).map(|l| (l, None)).map_err(bind_err)
                }
            }
        }
        Err(e) => Err(bind_err(e)),
    }
}

fn register(
    registry: &DescriptorRegistry,
    address: &BindAddress,
    listener: &Listener,
) -> Result<(), CoordinatorError> {
    registry
        .register(&address.to_string(), listener.as_raw_fd())
        .map_err(|source| CoordinatorError::Register {
            address: address.to_string(),
            source,
        })
}

fn find_predecessor(config: &GenerationConfig, client: &ExchangeClient, pid: Pid) -> Predecessor {
    let path = client.request_handoff_addr().unwrap_or_else(|e| {
        warn!(incumbent = pid, error = %e, "cannot query handoff channel, deriving it");
        handoff_address(&config.exchange_path, pid)
    });
    info!(predecessor = pid, handoff = %path.display(), "found previous generation");
    Predecessor {
        pid,
        handoff: HandoffClient::new(path).with_timeout(config.client_timeout()),
    }
}

/// The control servers of one generation.
struct ControlPlane {
    exchange: ControlServer,
    handoff: ControlServer,
    admin_started: bool,
}

impl ControlPlane {
    fn bind(config: &GenerationConfig, generation: &Generation) -> Result<Self, CoordinatorError> {
        let exchange_path = &generation.exchange_path;
        let (listener, adopted) = bind_exchange_listener(exchange_path, config.client_timeout())
            .map_err(|source| CoordinatorError::ControlServer {
                server: "fd-exchange",
                path: exchange_path.clone(),
                source,
            })?;
        if adopted {
            info!(path = %exchange_path.display(), "adopted exchange socket from incumbent");
        }
        generation
            .registry
            .register(
                &BindAddress::unix(exchange_path).to_string(),
                listener.as_raw_fd(),
            )
            .map_err(|source| CoordinatorError::Register {
                address: exchange_path.display().to_string(),
                source,
            })?;
        let exchange = ControlServer::from_listener(exchange_path, listener);

        let handoff = ControlServer::bind_exclusive(&generation.handoff_path).map_err(|source| {
            CoordinatorError::ControlServer {
                server: "handoff",
                path: generation.handoff_path.clone(),
                source,
            }
        })?;

        Ok(Self {
            exchange,
            handoff,
            admin_started: false,
        })
    }

    fn start(
        &mut self,
        generation: &Arc<Generation>,
        admin: Option<&mut (dyn AuxiliaryServer + 'static)>,
        admin_listener: Option<Listener>,
    ) -> Result<(), CoordinatorError> {
        let service = ExchangeService::new(
            Arc::clone(generation.registry()),
            generation.pid,
            generation.handoff_path.clone(),
        );
        self.exchange
            .start(Arc::new(service))
            .map_err(|source| CoordinatorError::ControlServer {
                server: "fd-exchange",
                path: generation.exchange_path().to_path_buf(),
                source,
            })?;
        *generation
            .exchange_stop
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(self.exchange.stop_handle());

        self.handoff
            .start(Arc::new(HandoffService::new(Arc::clone(generation))))
            .map_err(|source| CoordinatorError::ControlServer {
                server: "handoff",
                path: generation.handoff_path.clone(),
                source,
            })?;

        if let (Some(server), Some(listener)) = (admin, admin_listener) {
            let name = server.name();
            server
                .start(listener, generation.supervisor.clone())
                .map_err(|source| CoordinatorError::Auxiliary { server: name, source })?;
            info!(server = name, address = %server.address(), "auxiliary server started");
        }
        Ok(())
    }

    /// The exchange path is shared with a successor once superseded, so it
    /// is only unlinked while this generation still owns it.
    fn stop(&mut self, admin: Option<&mut (dyn AuxiliaryServer + 'static)>, superseded: bool) {
        if let Some(server) = admin {
            if self.admin_started {
                server.stop();
            }
        }
        self.handoff.stop(true);
        self.exchange.stop(!superseded);
        if superseded {
            info!("exchange socket left in place for successor");
        }
    }
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generation")
            .field("pid", &self.pid)
            .field("addresses", &self.addresses)
            .field("superseded", &self.is_superseded())
            .field("handoff_path", &self.handoff_path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SupervisorConfig;
    use crate::supervisor::Phase;
    use crate::worker::{WorkerBody, WorkerContext};

    struct Idle;

    impl WorkerBody for Idle {
        fn run(&self, _ctx: &WorkerContext) -> i32 {
            0
        }
    }

    fn idle_generation(dir: &std::path::Path) -> Generation {
        let supervisor = Supervisor::new(&SupervisorConfig::default(), Arc::new(Idle));
        Generation {
            pid: 4242,
            addresses: vec![],
            registry: Arc::new(DescriptorRegistry::new()),
            supervisor,
            superseded: AtomicBool::new(false),
            exchange_path: dir.join("fd.sock"),
            handoff_path: dir.join("fd.sock-4242"),
            exchange_stop: Mutex::new(None),
        }
    }

    #[test]
    fn test_handoff_commands_mark_generation_superseded() {
        let dir = tempfile::tempdir().unwrap();
        let target = idle_generation(dir.path());
        assert!(!target.is_superseded());
        target.prune_worker().unwrap();
        assert!(target.is_superseded());
        assert_eq!(target.supervisor.target(), 4);
    }

    #[test]
    fn test_fd_server_shutdown_waits_for_exchange_to_exit() {
        let dir = tempfile::tempdir().unwrap();
        let target = idle_generation(dir.path());
        assert!(target.fd_server_shutdown().is_err());

        let mut exchange = ControlServer::bind_exclusive(target.exchange_path()).unwrap();
        exchange
            .start(Arc::new(ExchangeService::new(
                Arc::clone(target.registry()),
                target.pid(),
                target.handoff_path().to_path_buf(),
            )))
            .unwrap();
        *target.exchange_stop.lock().unwrap() = Some(exchange.stop_handle());
        let client = ExchangeClient::new(target.exchange_path())
            .with_timeout(std::time::Duration::from_millis(700));
        assert_eq!(client.request_pid().unwrap(), 4242);

        target.fd_server_shutdown().unwrap();
        assert!(target.is_superseded());
        assert!(!exchange.is_running());
        assert!(client.request_pid().is_err(), "old generation still answers");
        exchange.stop(true);
    }

    #[test]
    fn test_graceful_shutdown_starts_drain() {
        let dir = tempfile::tempdir().unwrap();
        let target = idle_generation(dir.path());
        target.graceful_shutdown().unwrap();
        assert_eq!(target.supervisor.phase(), Phase::Draining);
        assert_eq!(target.supervisor.target(), 0);
        assert!(target.supervisor.is_frozen());
    }

    #[test]
    fn test_unix_listener_without_incumbent_is_rebound() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("app.sock");
        drop(std::os::unix::net::UnixListener::bind(&socket).unwrap());

        let client = ExchangeClient::new(dir.path().join("missing-exchange.sock"))
            .with_timeout(std::time::Duration::from_millis(200));
        let (listener, incumbent) = acquire_listener(&BindAddress::unix(&socket), &client).unwrap();
        assert!(incumbent.is_none());
        assert!(matches!(listener, Listener::Unix(_)));
    }

    #[test]
    fn test_tcp_address_held_by_stranger_fails() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = holder.local_addr().unwrap().port();
        let dir = tempfile::tempdir().unwrap();
        let client = ExchangeClient::new(dir.path().join("missing.sock"))
            .with_timeout(std::time::Duration::from_millis(200));
        let err = acquire_listener(&BindAddress::tcp("127.0.0.1", port), &client).unwrap_err();
        assert!(matches!(err, CoordinatorError::Bind { .. }), "{err}");
    }
}
