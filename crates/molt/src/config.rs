//! Generation and supervisor settings.
//!
//! Every field has a default so a configuration file only needs to name what
//! it changes.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::bind::BindAddress;

/// Sane range for the worker count of a generation.
pub const WORKER_COUNT_RANGE: std::ops::RangeInclusive<usize> = 1..=64;

/// Per-worker RSS ceiling bounds accepted from administrators, in KiB.
pub const MAX_RSS_RANGE_KB: std::ops::RangeInclusive<u64> = (20 * 1024)..=(800 * 1024);

/// Lowest aggregate memory ceiling accepted from administrators, in KiB.
pub const MIN_TOTAL_MEM_KB: u64 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Target number of workers.
    pub workers: usize,
    /// Per-worker resident memory ceiling (KiB).
    pub max_rss_kb: Option<u64>,
    /// Ceiling for the whole pool: max(shared) + Σ(private + swap), KiB.
    pub max_total_mem_kb: Option<u64>,
    /// Extra workers evicted beyond the computed overage.
    pub eviction_hysteresis: usize,
    /// Sleep between reap attempts when nothing exited.
    pub check_interval_ms: u64,
    /// Minimum time between two memory checks.
    pub mem_check_interval_secs: u64,
    /// Minimum time between two backfill forks.
    pub respawn_throttle_ms: u64,
    /// Grace period before a drain escalates to SIGKILL.
    pub failsafe_timeout_secs: u64,
    /// Connections a worker serves before exiting (None = unlimited).
    pub max_requests: Option<u64>,
    /// Log per-connection memory growth inside workers.
    pub profile_memory: bool,
    /// Minimum growth (KiB) worth logging.
    pub profile_memory_min_delta_kb: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            max_rss_kb: None,
            max_total_mem_kb: None,
            eviction_hysteresis: 1,
            check_interval_ms: 1000,
            mem_check_interval_secs: 30,
            respawn_throttle_ms: 50,
            failsafe_timeout_secs: 30,
            max_requests: None,
            profile_memory: false,
            profile_memory_min_delta_kb: 0,
        }
    }
}

impl SupervisorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn mem_check_interval(&self) -> Duration {
        Duration::from_secs(self.mem_check_interval_secs)
    }

    pub fn respawn_throttle(&self) -> Duration {
        Duration::from_millis(self.respawn_throttle_ms)
    }

    pub fn failsafe_timeout(&self) -> Duration {
        Duration::from_secs(self.failsafe_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Addresses the workers serve.
    pub listen: Vec<BindAddress>,
    /// Well-known path of the descriptor exchange service. The handoff
    /// channel and startup lock paths derive from it.
    pub exchange_path: PathBuf,
    /// Timeout for every control-channel call to another generation.
    pub client_timeout_secs: u64,
    pub supervisor: SupervisorConfig,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            listen: vec![BindAddress::tcp("127.0.0.1", 8080)],
            exchange_path: PathBuf::from("/tmp/molt-exchange.sock"),
            client_timeout_secs: 30,
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl GenerationConfig {
    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    /// `<exchange_path>.lock`
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self.exchange_path.clone().into_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }
}
