//! Per-process memory sampling.
//!
//! The supervisor only depends on [`MemorySampler`]; the platform
//! implementation is picked by [`default_sampler`].

use std::collections::HashMap;
use std::fs;
use std::io;
use std::process::{Command, Stdio};

use thiserror::Error;

use crate::Pid;

/// Memory held by one process, in KiB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub rss_kb: u64,
    pub vsz_kb: u64,
    /// Pages only this process maps.
    pub private_kb: u64,
    /// Pages mapped by other processes too (copy-on-write after fork).
    pub shared_kb: u64,
    /// Swapped out; assumed private since the shared part is unknowable.
    pub swap_kb: u64,
}

impl MemoryUsage {
    /// Memory that would be freed if this process exited.
    pub fn reclaimable_kb(&self) -> u64 {
        self.private_kb + self.swap_kb
    }

    /// Field-wise `self - earlier`, saturating at zero.
    pub fn delta_since(&self, earlier: &MemoryUsage) -> MemoryUsage {
        MemoryUsage {
            rss_kb: self.rss_kb.saturating_sub(earlier.rss_kb),
            vsz_kb: self.vsz_kb.saturating_sub(earlier.vsz_kb),
            private_kb: self.private_kb.saturating_sub(earlier.private_kb),
            shared_kb: self.shared_kb.saturating_sub(earlier.shared_kb),
            swap_kb: self.swap_kb.saturating_sub(earlier.swap_kb),
        }
    }
}

#[derive(Debug, Error)]
pub enum SampleError {
    #[error("cannot read memory of pid {pid}: {source}")]
    Io {
        pid: Pid,
        #[source]
        source: io::Error,
    },

    #[error("malformed memory report for pid {pid}: {reason}")]
    Parse { pid: Pid, reason: String },
}

pub trait MemorySampler: Send + Sync {
    fn sample(&self, pid: Pid) -> Result<MemoryUsage, SampleError>;
}

/// Reads `/proc/<pid>/status` and, when available, `/proc/<pid>/smaps_rollup`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsSampler;

impl MemorySampler for ProcfsSampler {
    fn sample(&self, pid: Pid) -> Result<MemoryUsage, SampleError> {
        let status = fs::read_to_string(format!("/proc/{pid}/status"))
            .map_err(|source| SampleError::Io { pid, source })?;
        let rollup = fs::read_to_string(format!("/proc/{pid}/smaps_rollup")).ok();
        parse_procfs(pid, &status, rollup.as_deref())
    }
}

/// Runs `ps` for platforms without procfs. Private/shared split is unknown,
/// so the whole RSS counts as private.
#[derive(Debug, Default, Clone, Copy)]
pub struct PsSampler;

impl MemorySampler for PsSampler {
    fn sample(&self, pid: Pid) -> Result<MemoryUsage, SampleError> {
        let output = Command::new("ps")
            .args(["-o", "rss=,vsz=", "-p", &pid.to_string()])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .map_err(|source| SampleError::Io { pid, source })?;
        parse_ps(pid, &String::from_utf8_lossy(&output.stdout))
    }
}

pub fn default_sampler() -> Box<dyn MemorySampler> {
    if cfg!(target_os = "linux") {
        Box::new(ProcfsSampler)
    } else {
        Box::new(PsSampler)
    }
}

/// `Key:   1234 kB` lines → map of KiB values.
fn kb_fields(text: &str) -> HashMap<&str, u64> {
    text.lines()
        .filter_map(|line| {
            let (key, rest) = line.split_once(':')?;
            let value = rest.split_whitespace().next()?.parse().ok()?;
            Some((key.trim(), value))
        })
        .collect()
}

pub(crate) fn parse_procfs(
    pid: Pid,
    status: &str,
    smaps_rollup: Option<&str>,
) -> Result<MemoryUsage, SampleError> {
    let fields = kb_fields(status);
    let required = |key: &str| {
        fields.get(key).copied().ok_or_else(|| SampleError::Parse {
            pid,
            reason: format!("missing key {key}"),
        })
    };
    let rss_kb = required("VmRSS")?;
    let vsz_kb = required("VmSize")?;
    let field = |key: &str| fields.get(key).copied().unwrap_or(0);

    let (private_kb, shared_kb, swap_kb) = match smaps_rollup {
        Some(rollup) => {
            let r = kb_fields(rollup);
            let get = |key: &str| r.get(key).copied().unwrap_or(0);
            (
                get("Private_Clean") + get("Private_Dirty"),
                get("Shared_Clean") + get("Shared_Dirty"),
                get("Swap"),
            )
        }
        None => (
            field("RssAnon"),
            field("RssFile") + field("RssShmem"),
            field("VmSwap"),
        ),
    };

    Ok(MemoryUsage {
        rss_kb,
        vsz_kb,
        private_kb,
        shared_kb,
        swap_kb,
    })
}

pub(crate) fn parse_ps(pid: Pid, stdout: &str) -> Result<MemoryUsage, SampleError> {
    let line = stdout
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| SampleError::Parse {
            pid,
            reason: "no such process".to_string(),
        })?;
    let mut parts = line.split_whitespace().map(str::parse::<u64>);
    match (parts.next(), parts.next()) {
        (Some(Ok(rss_kb)), Some(Ok(vsz_kb))) => Ok(MemoryUsage {
            rss_kb,
            vsz_kb,
            private_kb: rss_kb,
            shared_kb: 0,
            swap_kb: 0,
        }),
        _ => Err(SampleError::Parse {
            pid,
            reason: format!("bad value: {line:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &str = "Name:\tworker\nPid:\t4242\nVmPeak:\t  250000 kB\nVmSize:\t  240000 kB\nVmRSS:\t   51200 kB\nRssAnon:\t   40000 kB\nRssFile:\t   11000 kB\nRssShmem:\t     200 kB\nVmSwap:\t     128 kB\nThreads:\t1\n";

    const ROLLUP: &str = "55a0-7ffd ---p 00000000 00:00 0  [rollup]\nRss:               51200 kB\nShared_Clean:      20000 kB\nShared_Dirty:       1200 kB\nPrivate_Clean:       500 kB\nPrivate_Dirty:     29500 kB\nSwap:                256 kB\n";

    #[test]
    fn test_parse_procfs_with_rollup() {
        let usage = parse_procfs(4242, STATUS, Some(ROLLUP)).unwrap();
        assert_eq!(usage.rss_kb, 51200);
        assert_eq!(usage.vsz_kb, 240000);
        assert_eq!(usage.private_kb, 30000);
        assert_eq!(usage.shared_kb, 21200);
        assert_eq!(usage.swap_kb, 256);
        assert_eq!(usage.reclaimable_kb(), 30256);
    }

    #[test]
    fn test_parse_procfs_falls_back_to_status_split() {
        let usage = parse_procfs(4242, STATUS, None).unwrap();
        assert_eq!(usage.private_kb, 40000);
        assert_eq!(usage.shared_kb, 11200);
        assert_eq!(usage.swap_kb, 128);
    }

    #[test]
    fn test_parse_procfs_requires_rss_and_size() {
        let err = parse_procfs(7, "Name:\tzombie\nState:\tZ (zombie)\n", None).unwrap_err();
        assert!(err.to_string().contains("VmRSS"), "{err}");
    }

    #[test]
    fn test_parse_ps_output() {
        let usage = parse_ps(1, "  10240  204800\n").unwrap();
        assert_eq!(usage.rss_kb, 10240);
        assert_eq!(usage.vsz_kb, 204800);
        assert!(parse_ps(1, "").is_err());
        assert!(parse_ps(1, "RSS VSZ\n").is_err());
    }

    #[test]
    fn test_delta_saturates() {
        let before = MemoryUsage {
            rss_kb: 100,
            vsz_kb: 500,
            ..Default::default()
        };
        let after = MemoryUsage {
            rss_kb: 160,
            vsz_kb: 400,
            ..Default::default()
        };
        let delta = after.delta_since(&before);
        assert_eq!(delta.rss_kb, 60);
        assert_eq!(delta.vsz_kb, 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_procfs_samples_this_process() {
        let usage = ProcfsSampler.sample(std::process::id() as Pid).unwrap();
        assert!(usage.rss_kb > 0);
        assert!(usage.vsz_kb >= usage.rss_kb);
    }
}
