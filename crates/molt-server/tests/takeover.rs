//! Two generations of the `molt` binary handing a live port over.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use molt::ExchangeClient;

const SETTLE: Duration = Duration::from_secs(20);

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("addr").port()
}

fn spawn_generation(port: u16, exchange: &Path, admin_port: Option<u16>) -> Child {
    let mut command = Command::new(env!("CARGO_BIN_EXE_molt"));
    command
        .arg("run")
        .args(["--bind", &format!("127.0.0.1:{port}")])
        .arg("--exchange")
        .arg(exchange)
        .args(["--workers", "2"])
        .env("RUST_LOG", "warn")
        .env("MOLT_GENERATION__SUPERVISOR__CHECK_INTERVAL_MS", "50")
        .env("MOLT_GENERATION__SUPERVISOR__FAILSAFE_TIMEOUT_SECS", "5")
        .env("MOLT_GENERATION__CLIENT_TIMEOUT_SECS", "5")
        .stdin(Stdio::null())
        .stdout(Stdio::null());
    if let Some(admin) = admin_port {
        command.args(["--admin", &format!("127.0.0.1:{admin}")]);
    }
    command.spawn().expect("spawn molt")
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + SETTLE;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

fn wait_exit(child: &mut Child) -> Option<ExitStatus> {
    let mut status = None;
    wait_until(|| {
        status = child.try_wait().expect("try_wait");
        status.is_some()
    });
    status
}

/// Send one line and return the pid of the worker that echoed it.
fn echo(port: u16) -> Option<u32> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).ok()?;
    stream.set_read_timeout(Some(Duration::from_secs(5))).ok()?;
    stream.write_all(b"hello\n").ok()?;
    let mut reply = String::new();
    BufReader::new(stream).read_line(&mut reply).ok()?;
    let (pid, rest) = reply.split_once(' ')?;
    if rest != "hello\n" {
        return None;
    }
    pid.parse().ok()
}

fn terminate(child: &mut Child) -> Option<ExitStatus> {
    unsafe { libc::kill(child.id() as libc::pid_t, libc::SIGTERM) };
    wait_exit(child)
}

#[test]
fn successor_takes_over_the_port_and_the_predecessor_exits() {
    let dir = tempfile::tempdir().expect("tempdir");
    let exchange = dir.path().join("exchange.sock");
    let port = free_port();

    let mut first = spawn_generation(port, &exchange, None);
    let first_pid = first.id() as i32;
    let client = ExchangeClient::new(&exchange).with_timeout(Duration::from_secs(2));
    assert!(
        wait_until(|| client.request_pid().ok() == Some(first_pid)),
        "first generation never answered on its exchange"
    );
    assert!(wait_until(|| echo(port).is_some()), "first generation never served");

    let mut second = spawn_generation(port, &exchange, None);
    let second_pid = second.id() as i32;
    assert!(
        wait_until(|| client.request_pid().ok() == Some(second_pid)),
        "second generation never took over the exchange"
    );

    let status = wait_exit(&mut first).expect("first generation did not exit");
    assert!(status.success(), "first generation exited with {status}");

    // Every connection is now answered by the successor's workers.
    for _ in 0..5 {
        let worker = echo(port).expect("echo after takeover");
        let stat = std::fs::read_to_string(format!("/proc/{worker}/stat")).unwrap_or_default();
        if let Some(ppid) = stat.rsplit(')').next().and_then(|s| s.split_whitespace().nth(1)) {
            assert_eq!(ppid, second_pid.to_string());
        }
    }
    let addresses = client.request_addrs().expect("addrs");
    assert!(addresses.contains(&format!("127.0.0.1:{port}")), "{addresses:?}");
    assert!(
        addresses.contains(&molt::BindAddress::unix(&exchange).to_string()),
        "{addresses:?}"
    );

    let status = terminate(&mut second).expect("second generation did not exit");
    assert!(status.success(), "second generation exited with {status}");
    assert!(!exchange.exists(), "last generation leaves no exchange socket behind");
}

#[test]
fn status_command_reports_the_running_generation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let exchange = dir.path().join("exchange.sock");
    let port = free_port();
    let admin = free_port();

    let mut generation = spawn_generation(port, &exchange, Some(admin));
    let pid = generation.id();
    let client = ExchangeClient::new(&exchange).with_timeout(Duration::from_secs(2));
    assert!(wait_until(|| client.request_pid().ok() == Some(pid as i32)));

    let output = Command::new(env!("CARGO_BIN_EXE_molt"))
        .args(["status", "--exchange"])
        .arg(&exchange)
        .output()
        .expect("run status");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(&format!("pid:      {pid}")), "{stdout}");
    assert!(stdout.contains(&format!("127.0.0.1:{port}")), "{stdout}");
    assert!(stdout.contains(&format!("127.0.0.1:{admin}")), "{stdout}");

    // The admin front-end answers over plain HTTP.
    let mut stream = TcpStream::connect(("127.0.0.1", admin)).expect("admin connect");
    stream
        .write_all(b"GET /server-status HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .expect("admin write");
    let mut response = String::new();
    std::io::Read::read_to_string(&mut stream, &mut response).expect("admin read");
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains("\"target\":2"), "{response}");

    let status = terminate(&mut generation).expect("generation did not exit");
    assert!(status.success(), "generation exited with {status}");
}
