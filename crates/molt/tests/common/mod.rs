//! Shared helpers for the molt integration suites.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use molt::signals::worker_stop_requested;
use molt::{LoopSignals, SupervisorConfig, WorkerBody, WorkerContext};

static FORK_LOCK: Mutex<()> = Mutex::new(());

/// `waitpid(-1)` reaps any child of the test process, so tests that fork
/// must not overlap.
pub fn serial() -> MutexGuard<'static, ()> {
    FORK_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Fast-ticking settings for a small pool.
pub fn fast_config(workers: usize) -> SupervisorConfig {
    SupervisorConfig {
        workers,
        check_interval_ms: 20,
        mem_check_interval_secs: 0,
        respawn_throttle_ms: 10,
        failsafe_timeout_secs: 5,
        ..Default::default()
    }
}

/// Loop flags private to one test.
pub fn leak_signals() -> LoopSignals<'static> {
    LoopSignals {
        shutdown: Box::leak(Box::new(AtomicBool::new(false))),
        cycle: Box::leak(Box::new(AtomicBool::new(false))),
    }
}

/// Sleeps until SIGTERM.
pub struct Sleeper;

impl WorkerBody for Sleeper {
    fn run(&self, _ctx: &WorkerContext) -> i32 {
        while !worker_stop_requested() {
            thread::sleep(Duration::from_millis(10));
        }
        0
    }
}

/// Like [`Sleeper`], but leaves `<dir>/<pid>` behind when it stops
/// cooperatively. A SIGKILL leaves nothing.
pub struct Recorder {
    pub dir: PathBuf,
}

impl Recorder {
    pub fn stopped_gracefully(&self, pid: molt::Pid) -> bool {
        self.dir.join(pid.to_string()).exists()
    }
}

impl WorkerBody for Recorder {
    fn run(&self, ctx: &WorkerContext) -> i32 {
        while !worker_stop_requested() {
            thread::sleep(Duration::from_millis(10));
        }
        match std::fs::write(self.dir.join(ctx.pid.to_string()), b"") {
            Ok(()) => 0,
            Err(_) => 1,
        }
    }
}

/// Never looks at its stop flag; only SIGKILL ends it.
pub struct Stubborn;

impl WorkerBody for Stubborn {
    fn run(&self, _ctx: &WorkerContext) -> i32 {
        loop {
            thread::sleep(Duration::from_millis(50));
        }
    }
}
