//! Worker pool lifecycle against real forked children.

mod common;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{fast_config, leak_signals, serial, wait_until, Recorder, Sleeper, Stubborn};
use molt::{
    LoopExit, MemorySampler, MemoryUsage, Phase, Pid, SampleError, Supervisor, SupervisorConfig,
};

const SETTLE: Duration = Duration::from_secs(10);

/// Drive the loop until `condition` holds.
fn step_until(
    supervisor: &Supervisor,
    signals: &molt::LoopSignals<'_>,
    mut condition: impl FnMut(&Supervisor) -> bool,
) -> bool {
    wait_until(SETTLE, || {
        assert_eq!(supervisor.step(signals), None, "loop left early");
        condition(supervisor)
    })
}

#[test]
fn converge_spawns_the_target_and_drain_reaps_everyone() {
    let _guard = serial();
    let signals = leak_signals();
    let supervisor = Supervisor::new(&fast_config(3), Arc::new(Sleeper));

    let mut forked = Vec::new();
    assert_eq!(supervisor.converge(&signals, |pid| forked.push(pid)), None);
    // The hook only ever sees workers that really exist.
    forked.sort_unstable();
    assert_eq!(forked, supervisor.live_pids());
    assert_eq!(supervisor.live_count(), 3);
    assert_eq!(supervisor.phase(), Phase::Steady);

    assert_eq!(supervisor.drain_and_wait(), 0);
    assert_eq!(supervisor.live_count(), 0);
    assert_eq!(supervisor.phase(), Phase::Draining);
    assert_eq!(supervisor.step(&signals), Some(LoopExit::Drained));
}

/// Cycle a five-worker pool down to three and return the originals once
/// every one of them has been replaced.
fn cycle_five_to_three(supervisor: &Supervisor, signals: &molt::LoopSignals<'_>, force: bool) -> Vec<Pid> {
    assert_eq!(supervisor.converge(signals, |_| {}), None);
    let originals = supervisor.live_pids();
    assert_eq!(originals.len(), 5);

    supervisor
        .handle_cycle(Duration::ZERO, Some(3), force)
        .expect("cycle");
    assert_eq!(supervisor.target(), 3);

    let replaced = step_until(supervisor, signals, |s| {
        let live = s.live_pids();
        live.len() == 3 && live.iter().all(|pid| !originals.contains(pid))
    });
    assert!(replaced, "pool still holds {:?}", supervisor.live_pids());
    originals
}

#[test]
fn cycle_replaces_every_worker_at_the_new_target() {
    let _guard = serial();
    let signals = leak_signals();
    let dir = tempfile::tempdir().expect("tempdir");
    let body = Arc::new(Recorder {
        dir: dir.path().to_path_buf(),
    });
    let supervisor = Supervisor::new(&fast_config(5), body.clone());

    let originals = cycle_five_to_three(&supervisor, &signals, false);
    for pid in &originals {
        assert!(body.stopped_gracefully(*pid), "worker {pid} was not asked to stop");
    }

    assert_eq!(supervisor.drain_and_wait(), 0);
}

#[test]
fn forced_cycle_kills_every_worker_outright() {
    let _guard = serial();
    let signals = leak_signals();
    let dir = tempfile::tempdir().expect("tempdir");
    let body = Arc::new(Recorder {
        dir: dir.path().to_path_buf(),
    });
    let supervisor = Supervisor::new(&fast_config(5), body.clone());

    let originals = cycle_five_to_three(&supervisor, &signals, true);
    for pid in &originals {
        assert!(!body.stopped_gracefully(*pid), "worker {pid} outlived SIGKILL");
    }

    assert_eq!(supervisor.drain_and_wait(), 0);
}

#[test]
fn prune_lowers_the_target_and_kills_one_worker() {
    let _guard = serial();
    let signals = leak_signals();
    let supervisor = Supervisor::new(&fast_config(3), Arc::new(Sleeper));
    assert_eq!(supervisor.converge(&signals, |_| {}), None);

    let victim = supervisor
        .handle_prune_worker()
        .expect("prune")
        .expect("a victim");
    assert_eq!(supervisor.target(), 2);

    assert!(step_until(&supervisor, &signals, |s| !s.live_pids().contains(&victim)));
    // Nothing is backfilled for the pruned worker.
    for _ in 0..5 {
        assert_eq!(supervisor.step(&signals), None);
    }
    assert_eq!(supervisor.live_count(), 2);

    assert_eq!(supervisor.drain_and_wait(), 0);
}

#[test]
fn killed_worker_is_backfilled_unless_spawning_is_suspended() {
    let _guard = serial();
    let signals = leak_signals();
    let supervisor = Supervisor::new(&fast_config(2), Arc::new(Sleeper));
    assert_eq!(supervisor.converge(&signals, |_| {}), None);

    supervisor.set_allow_spawning(false).expect("suspend");
    let first = supervisor.live_pids()[0];
    unsafe { libc::kill(first, libc::SIGKILL) };
    assert!(step_until(&supervisor, &signals, |s| s.live_count() == 1));
    for _ in 0..5 {
        assert_eq!(supervisor.step(&signals), None);
    }
    assert_eq!(supervisor.live_count(), 1);

    supervisor.set_allow_spawning(true).expect("resume");
    assert!(step_until(&supervisor, &signals, |s| s.live_count() == 2));

    assert_eq!(supervisor.drain_and_wait(), 0);
}

/// Reports every pid in `bloated` as far over any sane RSS ceiling.
struct FakeSampler {
    bloated: Arc<Mutex<HashSet<Pid>>>,
}

impl MemorySampler for FakeSampler {
    fn sample(&self, pid: Pid) -> Result<MemoryUsage, SampleError> {
        let rss_kb = if self.bloated.lock().unwrap().contains(&pid) {
            900 * 1024
        } else {
            30 * 1024
        };
        Ok(MemoryUsage {
            rss_kb,
            vsz_kb: rss_kb * 2,
            private_kb: rss_kb / 2,
            shared_kb: rss_kb / 2,
            swap_kb: 0,
        })
    }
}

#[test]
fn worker_over_the_rss_ceiling_is_replaced() {
    let _guard = serial();
    let signals = leak_signals();
    let bloated = Arc::new(Mutex::new(HashSet::new()));
    let config = SupervisorConfig {
        max_rss_kb: Some(200 * 1024),
        ..fast_config(3)
    };
    let supervisor = Supervisor::with_sampler(
        &config,
        Arc::new(Sleeper),
        Box::new(FakeSampler {
            bloated: Arc::clone(&bloated),
        }),
    );
    assert_eq!(supervisor.converge(&signals, |_| {}), None);

    let pids = supervisor.live_pids();
    let victim = pids[1];
    bloated.lock().unwrap().insert(victim);

    let replaced = step_until(&supervisor, &signals, |s| {
        let live = s.live_pids();
        live.len() == 3 && !live.contains(&victim)
    });
    assert!(replaced, "pool is {:?}", supervisor.live_pids());
    let live = supervisor.live_pids();
    assert!(live.contains(&pids[0]));
    assert!(live.contains(&pids[2]));

    // Status rows carry each worker's latest sample.
    let sampled = step_until(&supervisor, &signals, |s| {
        let rows = s.status().workers;
        rows.len() == 3 && rows.iter().all(|row| row.rss_kb == Some(30 * 1024))
    });
    assert!(sampled, "status is {:?}", supervisor.status().workers);
    let row = supervisor
        .status()
        .workers
        .into_iter()
        .find(|row| row.pid == pids[0])
        .expect("survivor row");
    assert_eq!(row.reclaimable_kb, Some(15 * 1024));

    assert_eq!(supervisor.drain_and_wait(), 0);
}

#[test]
fn drain_escalates_to_sigkill_after_the_failsafe() {
    let _guard = serial();
    let signals = leak_signals();
    let config = SupervisorConfig {
        failsafe_timeout_secs: 1,
        ..fast_config(2)
    };
    let supervisor = Supervisor::new(&config, Arc::new(Stubborn));
    assert_eq!(supervisor.converge(&signals, |_| {}), None);

    assert_eq!(supervisor.drain_and_wait(), 0);
    assert_eq!(supervisor.live_count(), 0);
    assert!(supervisor.handle_prune_worker().is_err());
}

#[test]
fn shutdown_flag_ends_the_loop() {
    let _guard = serial();
    let signals = leak_signals();
    let supervisor = Supervisor::new(&fast_config(1), Arc::new(Sleeper));
    assert_eq!(supervisor.converge(&signals, |_| {}), None);

    signals.shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
    assert_eq!(supervisor.reap_loop(&signals), LoopExit::ShutdownRequested);

    assert_eq!(supervisor.drain_and_wait(), 0);
    supervisor.mark_stopped();
    assert_eq!(supervisor.phase(), Phase::Stopped);
}
