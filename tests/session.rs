//! End-to-end session tests against real processes on a real pty.

#![cfg(unix)]

use std::path::Path;
use std::process::Command;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use ptyhost::core::monitor::ExitState;
use ptyhost::core::sweep::Fingerprint;
use ptyhost::{CommandLine, LaunchRequest, PtyError, Session, SessionOptions, TerminalSize};
use sysinfo::{ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};

const TIMEOUT: Duration = Duration::from_secs(10);

// Keeps fd counts and process tables stable between tests.
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn sh(script: &str) -> LaunchRequest {
    LaunchRequest::new(CommandLine::new("/bin/sh").args(["-c", script]))
}

fn plain() -> SessionOptions {
    SessionOptions {
        strip_escapes: true,
        poll_interval: Duration::from_millis(20),
        ..SessionOptions::default()
    }
}

struct Running {
    session: Session,
    output: Receiver<String>,
    exit: Receiver<i32>,
    seen: String,
}

impl Running {
    fn start(request: LaunchRequest, options: SessionOptions) -> Self {
        let (out_tx, output) = mpsc::channel();
        let (exit_tx, exit) = mpsc::channel();
        let session = Session::launch(request, options, out_tx, move |code| {
            let _ = exit_tx.send(code);
        })
        .unwrap();
        Self {
            session,
            output,
            exit,
            seen: String::new(),
        }
    }

    /// Collect output until `needle` shows up.
    fn wait_for(&mut self, needle: &str) -> bool {
        let deadline = Instant::now() + TIMEOUT;
        while !self.seen.contains(needle) {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.output.recv_timeout(left) {
                Ok(text) => self.seen.push_str(&text),
                Err(_) => return false,
            }
        }
        true
    }

    fn wait_exit(&self) -> Option<i32> {
        self.exit.recv_timeout(TIMEOUT).ok()
    }

    fn drain(&mut self) -> &str {
        self.seen.extend(self.output.try_iter());
        &self.seen
    }
}

fn open_fds() -> Option<usize> {
    let dir = Path::new("/proc/self/fd");
    dir.exists()
        .then(|| std::fs::read_dir(dir).map(|entries| entries.count()).ok())
        .flatten()
}

fn live_processes(cmd: &[&str]) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
    );
    system
        .processes()
        .iter()
        .filter(|(_, process)| process.status() != ProcessStatus::Zombie)
        .filter(|(_, process)| {
            process.cmd().len() == cmd.len()
                && process.cmd().iter().zip(cmd).all(|(a, b)| a.to_string_lossy() == *b)
        })
        .map(|(pid, _)| pid.as_u32())
        .collect()
}

fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

#[test]
fn test_output_and_exit_code() {
    let _guard = serial();
    let mut run = Running::start(sh("echo hello; exit 3"), plain());

    assert_eq!(run.wait_exit(), Some(3));
    // The monitor lets the pump drain before notifying.
    assert!(run.drain().contains("hello\n"));
    assert!(run.session.is_exited());
    assert_eq!(run.session.exit_code(), Some(3));
    assert_eq!(run.session.exit_state(), ExitState::Exited(3));

    run.session.dispose();
    assert_eq!(run.session.exit_code(), Some(3));
}

#[test]
fn test_environment_reaches_child() {
    let _guard = serial();
    let request = sh("echo \"[$TERM|$CUSTOM_KEY|$PTYHOST_SESSION]\"").env("CUSTOM_KEY", "some value");
    let mut run = Running::start(request, plain());

    let expected = format!(
        "[xterm-256color|some value|{}]",
        run.session.marker().value()
    );
    assert!(run.wait_for(&expected), "got {:?}", run.seen);
    assert_eq!(run.wait_exit(), Some(0));
}

#[test]
fn test_multibyte_output_survives() {
    let _guard = serial();
    let mut run = Running::start(sh("printf '\\360\\237\\216\\211 done\\n'"), plain());
    assert!(run.wait_for("🎉 done"), "got {:?}", run.seen);
    assert!(!run.seen.contains('\u{fffd}'));
}

#[test]
fn test_resize_visible_to_child() {
    let _guard = serial();
    let request = sh("read x; stty size").size(TerminalSize::new(80, 24).unwrap());
    let mut run = Running::start(request, plain());

    let size = TerminalSize::new(100, 30).unwrap();
    run.session.resize(size).unwrap();
    assert_eq!(run.session.size(), size);
    run.session.write(b"\n").unwrap();

    assert!(run.wait_for("30 100"), "got {:?}", run.seen);
    assert_eq!(run.wait_exit(), Some(0));
}

#[test]
fn test_input_is_forwarded_in_order() {
    let _guard = serial();
    let mut run = Running::start(sh("read a; read b; echo \"got:$a:$b\""), plain());
    run.session.write(b"first\n").unwrap();
    run.session.write(b"second\n").unwrap();
    assert!(run.wait_for("got:first:second"), "got {:?}", run.seen);
}

#[test]
fn test_dispose_twice_is_noop() {
    let _guard = serial();
    let run = Running::start(sh("sleep 30"), plain());

    run.session.dispose();
    run.session.dispose();

    assert!(run.session.is_disposed());
    assert_eq!(run.session.exit_code(), None);
    assert_eq!(run.session.exit_state(), ExitState::Unknown);
    // No notification once disposal started.
    assert!(run.exit.recv_timeout(Duration::from_millis(300)).is_err());
}

#[test]
fn test_write_after_dispose_fails() {
    let _guard = serial();
    let run = Running::start(sh("sleep 30"), plain());
    run.session.dispose();
    assert!(matches!(run.session.write(b"x"), Err(PtyError::AlreadyDisposed)));
    // Resize after dispose is ignored.
    assert!(run.session.resize(TerminalSize::new(10, 10).unwrap()).is_ok());
}

#[test]
fn test_kill_reports_signal_exit() {
    let _guard = serial();
    let run = Running::start(sh("sleep 30"), plain());
    run.session.kill();
    assert_eq!(run.wait_exit(), Some(128 + 9));
    run.session.kill();
}

#[test]
fn test_kill_after_natural_exit_does_not_renotify() {
    let _guard = serial();
    let run = Running::start(sh("exit 0"), plain());
    assert_eq!(run.wait_exit(), Some(0));

    run.session.kill();
    match run.exit.recv_timeout(Duration::from_millis(300)) {
        Ok(code) => panic!("notified twice, second code {code}"),
        Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
    }
    assert_eq!(run.session.exit_code(), Some(0));
}

#[test]
fn test_exited_child_keeps_pid_until_dispose() {
    let _guard = serial();
    let run = Running::start(sh("exit 0"), plain());
    assert_eq!(run.wait_exit(), Some(0));
    let old_pid = run.session.pid();
    if cfg!(target_os = "linux") {
        assert!(Path::new(&format!("/proc/{old_pid}")).exists());
    }

    // Steer the next pid onto the child's where the kernel allows it.
    let _ = std::fs::write("/proc/sys/kernel/ns_last_pid", (old_pid - 1).to_string());
    let mut bystander = Command::new("sleep").arg("30").spawn().unwrap();

    run.session.dispose();
    thread::sleep(Duration::from_millis(200));
    let status = bystander.try_wait().unwrap();
    let _ = bystander.kill();
    let _ = bystander.wait();
    assert_eq!(status, None, "unrelated pid {} was killed", bystander.id());
}

#[test]
fn test_kill_visible_before_next_poll() {
    let _guard = serial();
    let options = SessionOptions {
        poll_interval: Duration::from_secs(60),
        ..plain()
    };
    let run = Running::start(sh("sleep 30"), options);
    // Let the monitor settle into its long park.
    thread::sleep(Duration::from_millis(100));

    run.session.kill();
    assert!(eventually(|| run.session.is_exited()));
    assert_eq!(run.session.exit_code(), Some(128 + 9));
    assert_eq!(run.wait_exit(), Some(128 + 9));
}

#[test]
fn test_invalid_working_directory_leaks_nothing() {
    let _guard = serial();
    let before = open_fds();

    let request = sh("true").working_directory("/definitely/not/a/directory");
    let result = Session::launch(request, plain(), |_: &str| {}, |_| {});
    assert!(matches!(result, Err(PtyError::Launch { .. })), "got {:?}", result.err());

    if let (Some(before), Some(after)) = (before, open_fds()) {
        assert_eq!(before, after);
    }
}

#[test]
fn test_dispose_sweeps_escaped_grandchild() {
    let _guard = serial();
    let token = format!("{}", 7000 + std::process::id() % 1000);
    let has_setsid = Command::new("/bin/sh")
        .args(["-c", "command -v setsid"])
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false);
    // Out of the child's tree and, with setsid, out of its process group.
    let script = if has_setsid {
        format!("(setsid sleep {token} &); echo started; sleep 30")
    } else {
        format!("(sleep {token} &); echo started; sleep 30")
    };

    let options = SessionOptions {
        fingerprint: Some(Fingerprint::new("sleep", token.clone())),
        ..plain()
    };
    let mut run = Running::start(sh(&script), options);
    assert!(run.wait_for("started"), "got {:?}", run.seen);
    assert!(eventually(|| !live_processes(&["sleep", token.as_str()]).is_empty()));

    let child = run.session.pid();
    run.session.dispose();

    assert!(
        eventually(|| live_processes(&["sleep", token.as_str()]).is_empty()),
        "grandchild survived dispose"
    );
    assert!(eventually(|| {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        system
            .process(sysinfo::Pid::from_u32(child))
            .map_or(true, |p| p.status() == ProcessStatus::Zombie)
    }));
}
