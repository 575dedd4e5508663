//! # molt
//!
//! A pre-forking process supervisor whose listening sockets survive
//! restarts. A new process tree (a *generation*) takes over the sockets of
//! the running one without dropping queued connections and without both
//! trees claiming exclusive ownership at once.
//!
//! ## Overview
//!
//! A restart proceeds in this order:
//! 1. The new generation takes the startup lock (`<exchange>.lock`)
//! 2. Binding the listener fails with `EADDRINUSE`, so it asks the running
//!    generation's descriptor exchange for its pid and a duplicate of the
//!    bound socket (`SCM_RIGHTS` over a Unix socket)
//! 3. It starts its own exchange and handoff control servers
//! 4. For every worker it forks, it asks the old generation to prune one
//! 5. Once converged, it tells the old generation to drain and to stop its
//!    exchange service, then releases the startup lock
//!
//! ## Control sockets
//!
//! - `<exchange>`: descriptor exchange (`REQ_FD`, `REQ_PID`, `REQ_ADDRS`, `REQ_UMGMT_ADDR`)
//! - `<exchange>-<pid>`: handoff channel of generation `<pid>`
//!   (`prune_worker`, `graceful_shutdown`, `fd_server_shutdown`)
//!
//! ## Signals
//!
//! - `SIGTERM` / `SIGINT`: drain workers, tear down, exit
//! - `SIGHUP`: gracefully cycle every worker
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.

#[cfg(not(unix))]
compile_error!("molt requires a Unix platform (Linux or macOS)");

pub mod bind;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod exchange;
pub mod fd_passing;
pub mod handoff;
pub mod lock;
pub mod resources;
pub mod server;
pub mod signals;
pub mod supervisor;
pub mod worker;

pub use bind::{BindAddress, Connection, Listener};
pub use channel::{Channel, ChannelError};
pub use config::{GenerationConfig, SupervisorConfig};
pub use coordinator::{AuxiliaryServer, Coordinator, CoordinatorError, Generation, RunOutcome};
pub use exchange::{DescriptorRegistry, ExchangeClient, ExchangeError};
pub use handoff::{handoff_address, HandoffClient, HandoffError};
pub use lock::{LockError, StartupLock};
pub use resources::{MemorySampler, MemoryUsage, SampleError};
pub use signals::LoopSignals;
pub use supervisor::{
    plan_evictions, EvictionReason, LoopExit, Phase, PoolStatus, Supervisor, SupervisorError,
    WorkerStatus,
};
pub use worker::{
    HandlerResult, HookError, Hooks, RequestHandler, ServeLoop, WorkerBody, WorkerContext,
};

/// A process id as reported by the kernel.
pub type Pid = libc::pid_t;
