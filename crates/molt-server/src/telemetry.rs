//! Tracing setup for the supervisor and its workers.
//!
//! Workers are forked from a process that has other threads (control
//! servers, the admin runtime). Anything holding a userspace lock while
//! writing a log line at fork time would leave that lock held forever in the
//! child, so log output goes straight to `write(2)` on stderr.

use std::io;

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogFormat;

const DEFAULT_FILTER: &str = "info,molt=debug,molt_server=debug";

/// Stderr writer without a userspace lock. Each formatted event is one
/// `write_all`, which short lines complete in a single `write(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForkSafeStderr;

impl io::Write for ForkSafeStderr {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let n = unsafe { libc::write(libc::STDERR_FILENO, buf.as_ptr().cast(), buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for ForkSafeStderr {
    type Writer = ForkSafeStderr;

    fn make_writer(&'a self) -> Self::Writer {
        *self
    }
}

/// Install the global subscriber. The filter comes from `RUST_LOG`.
pub fn init(format: LogFormat) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let (text, json) = match format {
        LogFormat::Text => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(ForkSafeStderr),
            ),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(ForkSafeStderr),
            ),
        ),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(text)
        .with(json)
        .try_init()?;

    tracing::info!(format = %format, "Telemetry initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_fork_safe_writer_reports_full_writes() {
        let mut writer = ForkSafeStderr.make_writer();
        assert_eq!(writer.write(b"").unwrap(), 0);
        writer.write_all(b"telemetry test line\n").unwrap();
        writer.flush().unwrap();
    }
}
