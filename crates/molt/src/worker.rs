//! What runs inside a forked worker.
//!
//! The supervisor only knows [`WorkerBody`]. The stock body is
//! [`ServeLoop`], which accepts connections on the generation's listeners and
//! hands each one to a [`RequestHandler`].

use std::any::Any;
use std::error::Error;
use std::io;
use std::os::fd::AsRawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::bind::{Connection, Listener};
use crate::resources::{default_sampler, MemorySampler, MemoryUsage};
use crate::signals::worker_stop_requested;
use crate::Pid;

/// How often an idle worker re-checks its stop flag.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub type HandlerResult = Result<(), Box<dyn Error + Send + Sync>>;

/// The application callback, invoked once per accepted connection.
///
/// Errors and panics are logged; they never end the worker.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, conn: Connection) -> HandlerResult;
}

impl<F> RequestHandler for F
where
    F: Fn(Connection) -> HandlerResult + Send + Sync + 'static,
{
    fn handle(&self, conn: Connection) -> HandlerResult {
        self(conn)
    }
}

/// Settings captured in the parent at fork time.
#[derive(Debug, Clone, Copy)]
pub struct WorkerContext {
    /// Filled in by the child after fork.
    pub pid: Pid,
    pub parent_pid: Pid,
    pub spawned_at: SystemTime,
    pub max_requests: Option<u64>,
    pub profile_memory: bool,
    pub profile_memory_min_delta_kb: u64,
}

/// Everything a worker process does between fork and `_exit`.
pub trait WorkerBody: Send + Sync + 'static {
    /// Returns the worker's exit status.
    fn run(&self, ctx: &WorkerContext) -> i32;
}

#[derive(Debug, Error)]
pub enum HookError {
    #[error("a {kind} hook named {name:?} is already registered")]
    Duplicate { kind: &'static str, name: String },

    #[error("init hook {name:?} failed: {source}")]
    Failed {
        name: String,
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
}

type HookFn = Box<dyn Fn() -> HandlerResult + Send + Sync>;

/// Named callbacks run in every worker: init hooks in registration order
/// before serving, exit hooks in reverse order after.
#[derive(Default)]
pub struct Hooks {
    init: Vec<(String, HookFn)>,
    exit: Vec<(String, HookFn)>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_init<F>(&mut self, name: &str, hook: F) -> Result<(), HookError>
    where
        F: Fn() -> HandlerResult + Send + Sync + 'static,
    {
        push_unique(&mut self.init, "init", name, Box::new(hook))
    }

    pub fn add_exit<F>(&mut self, name: &str, hook: F) -> Result<(), HookError>
    where
        F: Fn() -> HandlerResult + Send + Sync + 'static,
    {
        push_unique(&mut self.exit, "exit", name, Box::new(hook))
    }

    /// Stops at the first failing hook.
    pub fn run_init(&self) -> Result<(), HookError> {
        for (name, hook) in &self.init {
            debug!(hook = %name, "running init hook");
            hook().map_err(|source| HookError::Failed {
                name: name.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Runs every exit hook; failures are logged and skipped.
    pub fn run_exit(&self) {
        for (name, hook) in self.exit.iter().rev() {
            debug!(hook = %name, "running exit hook");
            if let Err(e) = hook() {
                error!(hook = %name, error = %e, "exit hook failed");
            }
        }
    }
}

fn push_unique(
    hooks: &mut Vec<(String, HookFn)>,
    kind: &'static str,
    name: &str,
    hook: HookFn,
) -> Result<(), HookError> {
    if hooks.iter().any(|(existing, _)| existing == name) {
        return Err(HookError::Duplicate {
            kind,
            name: name.to_string(),
        });
    }
    hooks.push((name.to_string(), hook));
    Ok(())
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = |hooks: &[(String, HookFn)]| -> Vec<String> {
            hooks.iter().map(|(n, _)| n.clone()).collect()
        };
        f.debug_struct("Hooks")
            .field("init", &names(&self.init))
            .field("exit", &names(&self.exit))
            .finish()
    }
}

/// Accept connections on every listener until asked to stop.
pub struct ServeLoop {
    listeners: Arc<Vec<Listener>>,
    handler: Arc<dyn RequestHandler>,
    hooks: Arc<Hooks>,
    sampler: Box<dyn MemorySampler>,
}

impl ServeLoop {
    pub fn new(listeners: Arc<Vec<Listener>>, handler: Arc<dyn RequestHandler>) -> Self {
        Self {
            listeners,
            handler,
            hooks: Arc::new(Hooks::new()),
            sampler: default_sampler(),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<Hooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Serve until stopped, the request budget is spent, or the parent dies.
    /// Returns the number of connections handled.
    fn serve(&self, ctx: &WorkerContext) -> u64 {
        let mut served = 0u64;
        let mut pollfds: Vec<libc::pollfd> = self
            .listeners
            .iter()
            .map(|l| libc::pollfd {
                fd: l.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();

        while !worker_stop_requested() {
            if ctx.max_requests.is_some_and(|max| served >= max) {
                info!(pid = ctx.pid, served, "request budget spent");
                break;
            }
            if unsafe { libc::getppid() } != ctx.parent_pid {
                warn!(pid = ctx.pid, "supervisor went away");
                break;
            }

            for pfd in pollfds.iter_mut() {
                pfd.revents = 0;
            }
            let timeout = ACCEPT_POLL_INTERVAL.as_millis() as libc::c_int;
            let ready = unsafe {
                libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout)
            };
            if ready < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(pid = ctx.pid, error = %err, "poll on listeners failed");
                break;
            }
            if ready == 0 {
                continue;
            }

            for (listener, pfd) in self.listeners.iter().zip(&pollfds) {
                if pfd.revents == 0 {
                    continue;
                }
                match listener.accept() {
                    Ok(conn) => {
                        served += 1;
                        self.handle_connection(conn, ctx);
                    }
                    Err(e) if is_transient_accept_error(&e) => {}
                    Err(e) => warn!(pid = ctx.pid, error = %e, "accept failed"),
                }
                if worker_stop_requested() {
                    break;
                }
            }
        }
        served
    }

    fn handle_connection(&self, conn: Connection, ctx: &WorkerContext) {
        let peer = conn.peer_description();
        if let Err(e) = conn.set_nonblocking(false) {
            warn!(peer, error = %e, "cannot configure connection");
            return;
        }
        let before = ctx
            .profile_memory
            .then(|| self.sampler.sample(ctx.pid).ok())
            .flatten();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.handler.handle(conn)));
        match outcome {
            Ok(Ok(())) => debug!(peer, "request handled"),
            Ok(Err(e)) => error!(peer, error = %e, "request handler failed"),
            Err(payload) => error!(peer, panic = panic_message(&payload), "request handler panicked"),
        }

        if let Some(before) = before {
            match self.sampler.sample(ctx.pid) {
                Ok(after) => log_memory_delta(ctx, &peer, &before, &after),
                Err(e) => debug!(error = %e, "memory sample after request failed"),
            }
        }
    }
}

impl WorkerBody for ServeLoop {
    fn run(&self, ctx: &WorkerContext) -> i32 {
        if let Err(e) = self.hooks.run_init() {
            error!(pid = ctx.pid, error = %e, "worker init failed");
            return 1;
        }
        info!(pid = ctx.pid, listeners = self.listeners.len(), "worker serving");
        let served = self.serve(ctx);
        self.hooks.run_exit();
        info!(pid = ctx.pid, served, "worker exiting");
        0
    }
}

fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
    )
}

fn log_memory_delta(ctx: &WorkerContext, peer: &str, before: &MemoryUsage, after: &MemoryUsage) {
    let delta = after.delta_since(before);
    let min = ctx.profile_memory_min_delta_kb;
    if (delta.rss_kb > 0 && delta.rss_kb >= min) || (delta.vsz_kb > 0 && delta.vsz_kb >= min) {
        info!(
            pid = ctx.pid,
            peer,
            rss_kb = after.rss_kb,
            rss_delta_kb = delta.rss_kb,
            vsz_kb = after.vsz_kb,
            vsz_delta_kb = delta.vsz_kb,
            "memory grew while serving request"
        );
    }
}

pub(crate) fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
