//! Worker pool supervisor.
//!
//! Owns the live pid set of one generation. The main thread is the only one
//! that forks or reaps; control-server threads may change the target, toggle
//! spawning, or signal workers, always snapshotting under the pool lock and
//! signalling outside it.

use std::collections::BTreeMap;
use std::io;
use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use rand::seq::IteratorRandom;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{SupervisorConfig, MAX_RSS_RANGE_KB, MIN_TOTAL_MEM_KB, WORKER_COUNT_RANGE};
use crate::resources::{default_sampler, MemorySampler, MemoryUsage};
use crate::signals::{self, send_signal, LoopSignals};
use crate::worker::{panic_message, WorkerBody, WorkerContext};
use crate::Pid;

/// How long reaping continues after the drain failsafe fired.
const KILL_GRACE: Duration = Duration::from_secs(2);
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Lifecycle of a generation's pool. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Phase {
    Converging = 0,
    Steady = 1,
    Draining = 2,
    Stopped = 3,
}

impl Phase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Phase::Converging,
            1 => Phase::Steady,
            2 => Phase::Draining,
            _ => Phase::Stopped,
        }
    }
}

/// Why the supervision loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    ShutdownRequested,
    Drained,
    /// `waitpid` reported no children at all.
    NoChildren,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("worker count {count} outside {min}..={max}")]
    WorkerCountOutOfRange { count: usize, min: usize, max: usize },

    #[error("max_rss {kb} KiB outside {min}..={max} KiB")]
    MaxRssOutOfRange { kb: u64, min: u64, max: u64 },

    #[error("max_total_mem {kb} KiB below the {min} KiB minimum")]
    TotalMemTooSmall { kb: u64, min: u64 },

    #[error("server is shutting down")]
    ShuttingDown,

    #[error("fork failed: {0}")]
    Fork(#[source] io::Error),
}

/// One forked worker as the parent sees it.
#[derive(Debug, Clone)]
pub(crate) struct WorkerRecord {
    pid: Pid,
    spawned_at: Instant,
    /// Memory observation flag the worker was forked with.
    profile_memory: bool,
    /// Refreshed on every memory check.
    last_sample: Option<MemoryUsage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    MaxRss,
    MaxTotalMem,
}

/// One row of [`PoolStatus::workers`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub pid: Pid,
    pub uptime_secs: u64,
    pub profile_memory: bool,
    /// From the latest memory check; absent until one has run.
    pub rss_kb: Option<u64>,
    pub reclaimable_kb: Option<u64>,
}

impl WorkerRecord {
    fn status(&self) -> WorkerStatus {
        WorkerStatus {
            pid: self.pid,
            uptime_secs: self.spawned_at.elapsed().as_secs(),
            profile_memory: self.profile_memory,
            rss_kb: self.last_sample.map(|u| u.rss_kb),
            reclaimable_kb: self.last_sample.map(|u| u.reclaimable_kb()),
        }
    }
}

/// Snapshot served by the admin status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub phase: Phase,
    pub target: usize,
    pub live: Vec<Pid>,
    pub workers: Vec<WorkerStatus>,
    pub allow_spawning: bool,
    pub max_rss_kb: Option<u64>,
    pub max_total_mem_kb: Option<u64>,
    pub profile_memory: bool,
    pub profile_memory_min_delta_kb: u64,
}

#[derive(Debug)]
struct PoolState {
    target: usize,
    workers: BTreeMap<Pid, WorkerRecord>,
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    max_rss_kb: Option<u64>,
    max_total_mem_kb: Option<u64>,
    profile_memory: bool,
    profile_memory_min_delta_kb: u64,
}

#[derive(Debug, Default)]
struct Timers {
    last_mem_check: Option<Instant>,
    last_spawn: Option<Instant>,
}

struct Inner {
    settings: SupervisorConfig,
    pool: Mutex<PoolState>,
    limits: Mutex<Limits>,
    timers: Mutex<Timers>,
    allow_spawning: AtomicBool,
    phase: AtomicU8,
    frozen: AtomicBool,
    failsafe_armed: AtomicBool,
    parent_only_fds: Mutex<Vec<RawFd>>,
    sampler: Box<dyn MemorySampler>,
    body: Arc<dyn WorkerBody>,
}

/// Cheap to clone; every clone drives the same pool.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("phase", &self.phase())
            .field("target", &self.target())
            .field("live", &self.live_count())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Supervisor {
    pub fn new(config: &SupervisorConfig, body: Arc<dyn WorkerBody>) -> Self {
        Self::with_sampler(config, body, default_sampler())
    }

    pub fn with_sampler(
        config: &SupervisorConfig,
        body: Arc<dyn WorkerBody>,
        sampler: Box<dyn MemorySampler>,
    ) -> Self {
        let limits = Limits {
            max_rss_kb: config.max_rss_kb,
            max_total_mem_kb: config.max_total_mem_kb,
            profile_memory: config.profile_memory,
            profile_memory_min_delta_kb: config.profile_memory_min_delta_kb,
        };
        Self {
            inner: Arc::new(Inner {
                settings: config.clone(),
                pool: Mutex::new(PoolState {
                    target: config.workers,
                    workers: BTreeMap::new(),
                }),
                limits: Mutex::new(limits),
                timers: Mutex::new(Timers::default()),
                allow_spawning: AtomicBool::new(true),
                phase: AtomicU8::new(Phase::Converging as u8),
                frozen: AtomicBool::new(false),
                failsafe_armed: AtomicBool::new(false),
                parent_only_fds: Mutex::new(Vec::new()),
                sampler,
                body,
            }),
        }
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.inner.phase.load(Ordering::SeqCst))
    }

    fn advance(&self, to: Phase) {
        let previous = Phase::from_u8(self.inner.phase.fetch_max(to as u8, Ordering::SeqCst));
        if previous < to {
            info!(from = ?previous, to = ?to, "pool phase changed");
        }
    }

    pub fn is_draining(&self) -> bool {
        self.phase() >= Phase::Draining
    }

    pub fn target(&self) -> usize {
        lock(&self.inner.pool).target
    }

    pub fn live_count(&self) -> usize {
        lock(&self.inner.pool).workers.len()
    }

    pub fn live_pids(&self) -> Vec<Pid> {
        lock(&self.inner.pool).workers.keys().copied().collect()
    }

    pub fn allow_spawning(&self) -> bool {
        self.inner.allow_spawning.load(Ordering::SeqCst)
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.frozen.load(Ordering::SeqCst)
    }

    /// Refuse every administrative change from now on.
    pub fn freeze_admin(&self) {
        if !self.inner.frozen.swap(true, Ordering::SeqCst) {
            info!("administrative changes frozen");
        }
    }

    fn ensure_mutable(&self) -> Result<(), SupervisorError> {
        if self.is_frozen() {
            return Err(SupervisorError::ShuttingDown);
        }
        Ok(())
    }

    /// Descriptors every forked worker closes first thing.
    pub fn add_parent_only_fd(&self, fd: RawFd) {
        lock(&self.inner.parent_only_fds).push(fd);
    }

    pub fn status(&self) -> PoolStatus {
        let (target, live, workers) = {
            let pool = lock(&self.inner.pool);
            (
                pool.target,
                pool.workers.keys().copied().collect(),
                pool.workers.values().map(WorkerRecord::status).collect(),
            )
        };
        let limits = *lock(&self.inner.limits);
        PoolStatus {
            phase: self.phase(),
            target,
            live,
            workers,
            allow_spawning: self.allow_spawning(),
            max_rss_kb: limits.max_rss_kb,
            max_total_mem_kb: limits.max_total_mem_kb,
            profile_memory: limits.profile_memory,
            profile_memory_min_delta_kb: limits.profile_memory_min_delta_kb,
        }
    }

    /// Fork one worker. Main thread only.
    pub fn spawn_worker(&self) -> Result<Pid, SupervisorError> {
        let limits = *lock(&self.inner.limits);
        let close_fds = lock(&self.inner.parent_only_fds).clone();
        let ctx = WorkerContext {
            pid: 0,
            parent_pid: unsafe { libc::getpid() },
            spawned_at: SystemTime::now(),
            max_requests: self.inner.settings.max_requests,
            profile_memory: limits.profile_memory,
            profile_memory_min_delta_kb: limits.profile_memory_min_delta_kb,
        };

        match unsafe { libc::fork() } {
            -1 => Err(SupervisorError::Fork(io::Error::last_os_error())),
            0 => run_child(self.inner.body.as_ref(), ctx, &close_fds),
            pid => {
                lock(&self.inner.pool).workers.insert(
                    pid,
                    WorkerRecord {
                        pid,
                        spawned_at: Instant::now(),
                        profile_memory: limits.profile_memory,
                        last_sample: None,
                    },
                );
                lock(&self.inner.timers).last_spawn = Some(Instant::now());
                info!(pid, "spawned worker");
                Ok(pid)
            }
        }
    }

    /// Spawn up to the target, calling `after_spawn` with every worker that
    /// was actually forked.
    ///
    /// The coordinator uses the hook to prune one worker of the previous
    /// generation per worker started here, so a failed fork costs the
    /// previous generation nothing.
    #[instrument(skip_all, fields(target = self.target()))]
    pub fn converge<F: FnMut(Pid)>(&self, signals: &LoopSignals<'_>, mut after_spawn: F) -> Option<LoopExit> {
        while !self.is_draining() && self.live_count() < self.target() {
            if signals.shutdown_requested() {
                return Some(LoopExit::ShutdownRequested);
            }
            match self.spawn_worker() {
                Ok(pid) => after_spawn(pid),
                Err(e) => error!(error = %e, "cannot spawn worker"),
            }
            thread::sleep(self.inner.settings.respawn_throttle());
            if let Err(exit) = self.reap_available() {
                return Some(exit);
            }
        }
        self.advance(Phase::Steady);
        info!(live = self.live_count(), "pool converged");
        None
    }

    /// Run [`Supervisor::step`] until it asks to leave.
    pub fn reap_loop(&self, signals: &LoopSignals<'_>) -> LoopExit {
        loop {
            if let Some(exit) = self.step(signals) {
                return exit;
            }
        }
    }

    /// One pass of the supervision loop: reap, health-check, backfill.
    pub fn step(&self, signals: &LoopSignals<'_>) -> Option<LoopExit> {
        if signals.shutdown_requested() {
            return Some(LoopExit::ShutdownRequested);
        }
        if signals.take_cycle_request() {
            info!("cycle requested by signal");
            if let Err(e) = self.handle_cycle(Duration::ZERO, None, false) {
                warn!(error = %e, "cycle request ignored");
            }
        }
        if self.is_draining() && self.live_count() == 0 {
            return Some(LoopExit::Drained);
        }

        match self.reap_available() {
            Ok(0) => {
                thread::sleep(self.inner.settings.check_interval());
                self.check_children();
            }
            Ok(_) => {}
            Err(exit) => return Some(exit),
        }

        if self.is_draining() && self.live_count() == 0 {
            return Some(LoopExit::Drained);
        }
        self.backfill(signals);
        None
    }

    /// Reap every exited child without blocking. `Err` means there are no
    /// children left to wait for.
    fn reap_available(&self) -> Result<usize, LoopExit> {
        let mut reaped = 0;
        loop {
            let mut status: libc::c_int = 0;
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid == 0 {
                return Ok(reaped);
            }
            if pid < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => {
                        debug!("waitpid interrupted");
                        continue;
                    }
                    Some(libc::ECHILD) => {
                        if reaped > 0 {
                            return Ok(reaped);
                        }
                        let orphaned = std::mem::take(&mut lock(&self.inner.pool).workers);
                        error!(untracked = orphaned.len(), "no children left, leaving supervision loop");
                        return Err(LoopExit::NoChildren);
                    }
                    _ => {
                        error!(error = %err, "waitpid failed");
                        return Ok(reaped);
                    }
                }
            }

            let known = lock(&self.inner.pool).workers.remove(&pid).is_some();
            if !known {
                debug!(pid, status, "reaped process that is not a worker");
                continue;
            }
            reaped += 1;
            log_exit(pid, status);
        }
    }

    fn backfill(&self, signals: &LoopSignals<'_>) {
        loop {
            if self.is_draining() || signals.shutdown_requested() {
                return;
            }
            let (live, target) = {
                let pool = lock(&self.inner.pool);
                (pool.workers.len(), pool.target)
            };
            if live >= target {
                return;
            }
            if !self.allow_spawning() {
                warn!(live, target, "spawning disabled");
                return;
            }
            let since_last = lock(&self.inner.timers).last_spawn.map(|t| t.elapsed());
            let throttle = self.inner.settings.respawn_throttle();
            if let Some(elapsed) = since_last.filter(|e| *e < throttle) {
                thread::sleep(throttle - elapsed);
            }
            if let Err(e) = self.spawn_worker() {
                error!(error = %e, "cannot spawn worker");
                return;
            }
        }
    }

    /// Memory health check, rate limited to once per `mem_check_interval`.
    pub fn check_children(&self) {
        {
            let timers = lock(&self.inner.timers);
            if timers
                .last_mem_check
                .is_some_and(|t| t.elapsed() < self.inner.settings.mem_check_interval())
            {
                return;
            }
        }
        if self.is_draining() || !self.allow_spawning() {
            return;
        }

        let limits = *lock(&self.inner.limits);
        if limits.max_rss_kb.is_some() || limits.max_total_mem_kb.is_some() {
            let samples: Vec<(Pid, MemoryUsage)> = self
                .live_pids()
                .into_iter()
                .filter_map(|pid| match self.inner.sampler.sample(pid) {
                    Ok(usage) => Some((pid, usage)),
                    Err(e) => {
                        warn!(pid, error = %e, "memory sample failed, skipping worker this round");
                        None
                    }
                })
                .collect();

            {
                let mut pool = lock(&self.inner.pool);
                for (pid, usage) in &samples {
                    if let Some(record) = pool.workers.get_mut(pid) {
                        record.last_sample = Some(*usage);
                    }
                }
            }

            let evictions = plan_evictions(
                &samples,
                limits.max_rss_kb,
                limits.max_total_mem_kb,
                self.inner.settings.eviction_hysteresis,
            );
            for (pid, reason) in &evictions {
                let usage = samples.iter().find(|(p, _)| p == pid).map(|(_, u)| *u);
                info!(
                    pid,
                    reason = ?reason,
                    rss_kb = usage.map(|u| u.rss_kb),
                    private_kb = usage.map(|u| u.reclaimable_kb()),
                    "evicting worker"
                );
                let _ = send_signal(*pid, libc::SIGTERM);
            }

            if let Some(ceiling) = limits.max_total_mem_kb {
                if evictions.iter().any(|(_, r)| *r == EvictionReason::MaxTotalMem) {
                    let max_shared = samples.iter().map(|(_, u)| u.shared_kb).max().unwrap_or(0);
                    let target = self.target().max(1) as u64;
                    info!(
                        max_total_mem_kb = ceiling,
                        workers = target,
                        shared_kb = max_shared,
                        private_per_worker_kb = ceiling.saturating_sub(max_shared) / target,
                        "aggregate memory ceiling reached"
                    );
                }
            }
        }

        lock(&self.inner.timers).last_mem_check = Some(Instant::now());
    }

    /// Gracefully (or forcibly) replace every current worker, optionally
    /// changing the target first.
    #[instrument(skip(self))]
    pub fn handle_cycle(
        &self,
        skew: Duration,
        workers: Option<usize>,
        force: bool,
    ) -> Result<(), SupervisorError> {
        self.ensure_mutable()?;
        if let Some(count) = workers {
            if !WORKER_COUNT_RANGE.contains(&count) {
                return Err(SupervisorError::WorkerCountOutOfRange {
                    count,
                    min: *WORKER_COUNT_RANGE.start(),
                    max: *WORKER_COUNT_RANGE.end(),
                });
            }
        }

        self.set_allow_spawning(true)?;
        let old_pids = {
            let mut pool = lock(&self.inner.pool);
            if let Some(count) = workers {
                pool.target = count;
            }
            pool.workers.keys().copied().collect::<Vec<_>>()
        };
        info!(count = old_pids.len(), target = self.target(), force, "cycling workers");

        let signo = if force { libc::SIGKILL } else { libc::SIGTERM };
        for pid in old_pids {
            let _ = send_signal(pid, signo);
            if !skew.is_zero() {
                thread::sleep(skew);
            }
        }
        Ok(())
    }

    /// Lower the target by one and terminate an arbitrary worker. At target
    /// zero this does nothing.
    pub fn handle_prune_worker(&self) -> Result<Option<Pid>, SupervisorError> {
        self.ensure_mutable()?;
        let victim = {
            let mut pool = lock(&self.inner.pool);
            if pool.target == 0 {
                return Ok(None);
            }
            pool.target -= 1;
            pool.workers.keys().copied().choose(&mut rand::rng())
        };
        info!(target = self.target(), victim, "pruning worker");
        if let Some(pid) = victim {
            let _ = send_signal(pid, libc::SIGTERM);
        }
        Ok(victim)
    }

    pub fn set_allow_spawning(&self, allow: bool) -> Result<(), SupervisorError> {
        self.ensure_mutable()?;
        if self.inner.allow_spawning.swap(allow, Ordering::SeqCst) != allow {
            info!(allow, "spawning toggled");
        }
        Ok(())
    }

    pub fn set_max_rss(&self, kb: u64) -> Result<(), SupervisorError> {
        self.ensure_mutable()?;
        if !MAX_RSS_RANGE_KB.contains(&kb) {
            return Err(SupervisorError::MaxRssOutOfRange {
                kb,
                min: *MAX_RSS_RANGE_KB.start(),
                max: *MAX_RSS_RANGE_KB.end(),
            });
        }
        lock(&self.inner.limits).max_rss_kb = Some(kb);
        info!(max_rss_kb = kb, "per-worker memory ceiling set");
        Ok(())
    }

    pub fn set_max_total_mem(&self, kb: u64) -> Result<(), SupervisorError> {
        self.ensure_mutable()?;
        if kb < MIN_TOTAL_MEM_KB {
            return Err(SupervisorError::TotalMemTooSmall {
                kb,
                min: MIN_TOTAL_MEM_KB,
            });
        }
        lock(&self.inner.limits).max_total_mem_kb = Some(kb);
        info!(max_total_mem_kb = kb, "aggregate memory ceiling set");
        Ok(())
    }

    /// Workers forked from now on observe per-request memory growth.
    pub fn set_profile_memory(&self, enable: bool, min_delta_kb: u64) -> Result<(), SupervisorError> {
        self.ensure_mutable()?;
        let mut limits = lock(&self.inner.limits);
        limits.profile_memory = enable;
        limits.profile_memory_min_delta_kb = min_delta_kb;
        info!(enable, min_delta_kb, "memory observation updated");
        Ok(())
    }

    /// Start draining: target 0, SIGTERM to every worker, and a failsafe that
    /// SIGKILLs whatever is left after `failsafe_timeout`. Returns at once.
    pub fn graceful_shutdown(&self) {
        self.freeze_admin();
        self.advance(Phase::Draining);
        let pids = {
            let mut pool = lock(&self.inner.pool);
            pool.target = 0;
            pool.workers.keys().copied().collect::<Vec<_>>()
        };
        info!(count = pids.len(), "draining workers");
        for pid in pids {
            let _ = send_signal(pid, libc::SIGTERM);
        }
        self.arm_failsafe();
    }

    fn arm_failsafe(&self) {
        if self.inner.failsafe_armed.swap(true, Ordering::SeqCst) {
            return;
        }
        let supervisor = self.clone();
        let timeout = self.inner.settings.failsafe_timeout();
        let spawned = thread::Builder::new()
            .name("drain-failsafe".to_string())
            .spawn(move || {
                let deadline = Instant::now() + timeout;
                while Instant::now() < deadline {
                    if supervisor.live_count() == 0 {
                        return;
                    }
                    thread::sleep(DRAIN_POLL);
                }
                warn!(remaining = supervisor.live_count(), "drain failsafe expired");
                supervisor.force_shutdown();
            });
        if let Err(e) = spawned {
            error!(error = %e, "cannot start drain failsafe");
        }
    }

    /// SIGKILL every live worker.
    pub fn force_shutdown(&self) {
        for pid in self.live_pids() {
            let _ = send_signal(pid, libc::SIGKILL);
        }
    }

    /// Drain and reap on the calling thread until the pool is empty, bounded
    /// by `failsafe_timeout` plus a short grace after SIGKILL. Returns how
    /// many workers could not be reaped.
    pub fn drain_and_wait(&self) -> usize {
        self.graceful_shutdown();
        let deadline = Instant::now() + self.inner.settings.failsafe_timeout();
        let mut killed = false;
        loop {
            if self.reap_available().is_err() || self.live_count() == 0 {
                break;
            }
            if Instant::now() >= deadline {
                if killed {
                    break;
                }
                warn!(remaining = self.live_count(), "workers ignored SIGTERM, killing");
                self.force_shutdown();
                killed = true;
            }
            thread::sleep(DRAIN_POLL);
            if killed && Instant::now() >= deadline + KILL_GRACE {
                break;
            }
        }
        let remaining = self.live_count();
        if remaining > 0 {
            error!(remaining, "workers still alive after drain");
        }
        remaining
    }

    pub fn mark_stopped(&self) {
        self.advance(Phase::Stopped);
    }
}

/// Pick the workers to terminate for one memory check.
///
/// Workers whose RSS exceeds `max_rss_kb` go first and are excluded from the
/// aggregate check. With `max_total_mem_kb`, the pool total is
/// `max(shared) + Σ(private + swap)`; if it reaches the ceiling, workers are
/// taken largest-first until the freed private memory covers the overage,
/// then `hysteresis` more.
pub fn plan_evictions(
    samples: &[(Pid, MemoryUsage)],
    max_rss_kb: Option<u64>,
    max_total_mem_kb: Option<u64>,
    hysteresis: usize,
) -> Vec<(Pid, EvictionReason)> {
    let mut evictions = Vec::new();
    let mut remaining: Vec<(Pid, MemoryUsage)> = Vec::with_capacity(samples.len());
    for (pid, usage) in samples {
        match max_rss_kb {
            Some(max) if usage.rss_kb > max => evictions.push((*pid, EvictionReason::MaxRss)),
            _ => remaining.push((*pid, *usage)),
        }
    }

    let Some(ceiling) = max_total_mem_kb else {
        return evictions;
    };
    if remaining.is_empty() {
        return evictions;
    }
    let max_shared = remaining.iter().map(|(_, u)| u.shared_kb).max().unwrap_or(0);
    let total: u64 = max_shared + remaining.iter().map(|(_, u)| u.reclaimable_kb()).sum::<u64>();
    debug!(total_kb = total, ceiling_kb = ceiling, "aggregate memory in use");
    if total < ceiling {
        return evictions;
    }

    let overage = total - ceiling;
    // Largest last, so pop() takes the biggest.
    remaining.sort_by_key(|(pid, u)| (u.reclaimable_kb(), std::cmp::Reverse(*pid)));
    let mut freed = 0u64;
    while freed < overage {
        let Some((pid, usage)) = remaining.pop() else { break };
        freed += usage.reclaimable_kb();
        evictions.push((pid, EvictionReason::MaxTotalMem));
    }
    for _ in 0..hysteresis {
        match remaining.pop() {
            Some((pid, _)) => evictions.push((pid, EvictionReason::MaxTotalMem)),
            None => {
                error!("evicted every worker trying to reclaim memory");
                break;
            }
        }
    }
    evictions
}

fn log_exit(pid: Pid, status: libc::c_int) {
    if libc::WIFEXITED(status) {
        let code = libc::WEXITSTATUS(status);
        if code == 0 {
            info!(pid, "worker exited");
        } else {
            error!(pid, code, "worker exited with error");
        }
    } else if libc::WIFSIGNALED(status) {
        let signal = libc::WTERMSIG(status);
        if signal == libc::SIGTERM {
            info!(pid, signal, "worker terminated");
        } else {
            error!(pid, signal, "worker killed by signal");
        }
    } else {
        error!(pid, status, "worker finished");
    }
}

/// Child side of fork. Never returns.
fn run_child(body: &dyn WorkerBody, mut ctx: WorkerContext, close_fds: &[RawFd]) -> ! {
    for fd in close_fds {
        unsafe { libc::close(*fd) };
    }
    if let Err(e) = signals::install_worker_handlers() {
        error!(error = %e, "cannot install worker signal handlers");
        unsafe { libc::_exit(1) };
    }
    if let Err(e) = rand::rng().reseed() {
        warn!(error = %e, "cannot reseed worker rng");
    }
    ctx.pid = unsafe { libc::getpid() };

    let status = match panic::catch_unwind(AssertUnwindSafe(|| body.run(&ctx))) {
        Ok(status) => status,
        Err(payload) => {
            error!(pid = ctx.pid, panic = panic_message(&payload), "worker panicked");
            1
        }
    };
    unsafe { libc::_exit(status) }
}
