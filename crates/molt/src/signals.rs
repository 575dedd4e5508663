//! Signal dispositions for the supervisor and its workers.
//!
//! Handlers only store to atomics. Everything that reacts to a signal
//! (forking, signalling workers, touching the pool) happens on the main loop
//! when it next polls these flags.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::Pid;

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
static CYCLE_REQUESTED: AtomicBool = AtomicBool::new(false);
static WORKER_STOP: AtomicBool = AtomicBool::new(false);

/// Flags polled by the supervision loop.
#[derive(Debug, Clone, Copy)]
pub struct LoopSignals<'a> {
    pub shutdown: &'a AtomicBool,
    pub cycle: &'a AtomicBool,
}

impl LoopSignals<'static> {
    /// The flags set by the handlers from [`install_parent_handlers`].
    pub fn process() -> Self {
        LoopSignals {
            shutdown: &SHUTDOWN_REQUESTED,
            cycle: &CYCLE_REQUESTED,
        }
    }
}

impl LoopSignals<'_> {
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn take_cycle_request(&self) -> bool {
        self.cycle.swap(false, Ordering::SeqCst)
    }
}

extern "C" fn on_parent_terminate(_: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

extern "C" fn on_parent_hangup(_: libc::c_int) {
    CYCLE_REQUESTED.store(true, Ordering::SeqCst);
}

extern "C" fn on_worker_terminate(_: libc::c_int) {
    WORKER_STOP.store(true, Ordering::SeqCst);
}

fn set_handler(signo: libc::c_int, handler: libc::sighandler_t) -> io::Result<()> {
    // SAFETY: a zeroed sigaction with an emptied mask is a valid starting
    // point; the handlers installed here are async-signal-safe.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(signo, &action, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// SIGTERM/SIGINT request shutdown; SIGHUP requests a worker cycle.
pub fn install_parent_handlers() -> io::Result<()> {
    let terminate = on_parent_terminate as extern "C" fn(libc::c_int) as libc::sighandler_t;
    let hangup = on_parent_hangup as extern "C" fn(libc::c_int) as libc::sighandler_t;
    set_handler(libc::SIGTERM, terminate)?;
    set_handler(libc::SIGINT, terminate)?;
    set_handler(libc::SIGHUP, hangup)?;
    Ok(())
}

/// Called in a freshly forked worker: SIGTERM/SIGINT set the cooperative
/// stop flag, everything the parent customised goes back to default.
pub(crate) fn install_worker_handlers() -> io::Result<()> {
    WORKER_STOP.store(false, Ordering::SeqCst);
    SHUTDOWN_REQUESTED.store(false, Ordering::SeqCst);
    CYCLE_REQUESTED.store(false, Ordering::SeqCst);
    let terminate = on_worker_terminate as extern "C" fn(libc::c_int) as libc::sighandler_t;
    set_handler(libc::SIGHUP, libc::SIG_DFL)?;
    set_handler(libc::SIGALRM, libc::SIG_DFL)?;
    set_handler(libc::SIGTERM, terminate)?;
    set_handler(libc::SIGINT, terminate)?;
    Ok(())
}

/// True once a worker has been asked to stop.
pub fn worker_stop_requested() -> bool {
    WORKER_STOP.load(Ordering::SeqCst)
}

/// Send `signo` to `pid`. A process that is already gone is not an error.
pub fn send_signal(pid: Pid, signo: libc::c_int) -> io::Result<()> {
    tracing::info!(pid, signo, "send signal");
    if unsafe { libc::kill(pid, signo) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    tracing::warn!(pid, signo, error = %err, "cannot send signal");
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_signals_take_cycle_resets_flag() {
        let shutdown = AtomicBool::new(false);
        let cycle = AtomicBool::new(true);
        let signals = LoopSignals {
            shutdown: &shutdown,
            cycle: &cycle,
        };
        assert!(signals.take_cycle_request());
        assert!(!signals.take_cycle_request());
        assert!(!signals.shutdown_requested());
        shutdown.store(true, Ordering::SeqCst);
        assert!(signals.shutdown_requested());
    }

    #[test]
    fn test_signal_to_missing_process_is_ok() {
        // Pid numbers near the top of the range are practically never in use.
        assert!(send_signal(i32::MAX - 1, 0).is_ok());
    }
}
