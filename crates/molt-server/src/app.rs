//! Demo application served by the `molt` binary.
//!
//! Each connection sends one line and gets it back prefixed with the pid of
//! the worker that answered, which makes handoffs visible from a client.

use std::io::{BufRead, BufReader, Write};

use molt::{Connection, HandlerResult, Hooks, HookError, RequestHandler};
use tracing::{debug, info};

/// Longest line echoed back.
const MAX_LINE: u64 = 64 * 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

impl RequestHandler for EchoHandler {
    fn handle(&self, mut conn: Connection) -> HandlerResult {
        conn.set_nonblocking(false)?;
        let peer = conn.peer_description();

        let mut line = Vec::new();
        {
            let mut reader = BufReader::new(std::io::Read::take(&mut conn, MAX_LINE));
            reader.read_until(b'\n', &mut line)?;
        }
        let pid = std::process::id();
        debug!(%peer, bytes = line.len(), "echoing");

        write!(conn, "{pid} ")?;
        conn.write_all(&line)?;
        if !line.ends_with(b"\n") {
            conn.write_all(b"\n")?;
        }
        conn.flush()?;
        Ok(())
    }
}

/// Lifecycle hooks that log when a worker starts and stops serving.
pub fn hooks() -> Result<Hooks, HookError> {
    let mut hooks = Hooks::new();
    hooks.add_init("announce", || {
        info!(pid = std::process::id(), "worker ready");
        Ok(())
    })?;
    hooks.add_exit("farewell", || {
        info!(pid = std::process::id(), "worker exiting");
        Ok(())
    })?;
    Ok(hooks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::net::UnixStream;

    fn echo(input: &[u8]) -> String {
        let (mut client, server) = UnixStream::pair().unwrap();
        client.write_all(input).unwrap();
        client.shutdown(std::net::Shutdown::Write).unwrap();

        EchoHandler
            .handle(Connection::Unix { stream: server })
            .unwrap();

        let mut reply = String::new();
        client.read_to_string(&mut reply).unwrap();
        reply
    }

    #[test]
    fn test_echo_prefixes_worker_pid() {
        let reply = echo(b"hello\nignored\n");
        assert_eq!(reply, format!("{} hello\n", std::process::id()));
    }

    #[test]
    fn test_echo_terminates_unfinished_line() {
        let reply = echo(b"partial");
        assert_eq!(reply, format!("{} partial\n", std::process::id()));
    }

    #[test]
    fn test_hooks_register_once() {
        let hooks = hooks().unwrap();
        hooks.run_init().unwrap();
        hooks.run_exit();
    }
}
