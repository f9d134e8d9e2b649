//! Orphan sweeper
//!
//! Interpreter-based children (node, python, ...) often fork helpers that
//! outlive the child the session launched. On disposal the sweeper kills the
//! whole tree under the child, then looks for stragglers that were reparented
//! away from it: processes running the configured interpreter whose command
//! line carries the fingerprint token and whose environment carries this
//! session's marker.

use std::collections::{HashMap, HashSet};
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tracing::{debug, info, warn};

/// Environment variable carrying the session marker.
pub const MARKER_KEY: &str = "PTYHOST_SESSION";

static MARKER_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Per-session identity injected into the child's environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionMarker {
    value: String,
}

impl SessionMarker {
    /// A marker unique to this host process and call.
    pub fn generate() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let seq = MARKER_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self {
            value: format!("{}-{:x}-{}", std::process::id(), nanos, seq),
        }
    }

    pub fn key(&self) -> &'static str {
        MARKER_KEY
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// `KEY=value`, as it appears in a process environment.
    pub fn entry(&self) -> String {
        format!("{}={}", MARKER_KEY, self.value)
    }

    fn found_in(&self, environ: &[OsString]) -> bool {
        let entry = self.entry();
        environ.iter().any(|var| var.as_os_str() == OsStr::new(&entry))
    }
}

/// Identifies processes belonging to the hosted tool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fingerprint {
    /// Executable name of the interpreter, without extension.
    pub interpreter: String,
    /// Substring expected somewhere in the command line.
    pub token: String,
}

impl Fingerprint {
    pub fn new(interpreter: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
            token: token.into(),
        }
    }

    fn names_interpreter(&self, name: &OsStr) -> bool {
        let stem = Path::new(name)
            .file_stem()
            .map(|s| s.to_string_lossy())
            .unwrap_or_default();
        stem.eq_ignore_ascii_case(&self.interpreter)
    }

    /// Whether a process with this name and command line belongs to the tool.
    pub fn matches(&self, name: &OsStr, cmd: &[OsString]) -> bool {
        // Linux truncates process names, so argv[0] counts too.
        let named = self.names_interpreter(name)
            || cmd.first().is_some_and(|arg0| self.names_interpreter(arg0));
        named
            && cmd
                .iter()
                .any(|arg| arg.to_string_lossy().contains(self.token.as_str()))
    }
}

/// Kills a process and everything below it.
pub trait ProcessTreeKiller: Send + Sync {
    /// Returns how many processes were signalled.
    fn kill_tree(&self, pid: u32) -> usize;
}

/// Process tree killer backed by the OS process table.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeTreeKiller;

impl ProcessTreeKiller for NativeTreeKiller {
    fn kill_tree(&self, pid: u32) -> usize {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        if system.process(Pid::from_u32(pid)).is_none() {
            debug!(pid, "process gone, nothing to kill");
            return 0;
        }
        // Collect before killing: dead parents get their children reparented.
        let tree = descendants(&system, Pid::from_u32(pid));
        signal_tree(&system, pid, &tree)
    }
}

#[cfg(unix)]
fn signal_tree(_system: &System, root: u32, tree: &[Pid]) -> usize {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid as NixPid;

    // The child leads its own session, so its group is its pid.
    if let Err(err) = killpg(NixPid::from_raw(root as i32), Signal::SIGKILL) {
        debug!(pid = root, error = %err, "killpg failed");
    }
    tree.iter()
        .filter(|p| kill(NixPid::from_raw(p.as_u32() as i32), Signal::SIGKILL).is_ok())
        .count()
}

#[cfg(windows)]
fn signal_tree(system: &System, _root: u32, tree: &[Pid]) -> usize {
    // Leaves first so parents cannot respawn them.
    tree.iter()
        .rev()
        .filter(|p| system.process(**p).is_some_and(|process| process.kill()))
        .count()
}

/// `root` and all of its descendants, root first.
fn descendants(system: &System, root: Pid) -> Vec<Pid> {
    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in system.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*pid);
        }
    }

    let mut order = Vec::new();
    let mut seen: HashSet<Pid> = HashSet::new();
    let mut stack = vec![root];
    while let Some(current) = stack.pop() {
        if !seen.insert(current) {
            continue;
        }
        order.push(current);
        if let Some(kids) = children.get(&current) {
            stack.extend(kids.iter().filter(|kid| !seen.contains(kid)));
        }
    }
    order
}

/// What a sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub tree: usize,
    pub orphans: usize,
}

/// One-shot cleanup run by the session on kill or dispose.
pub struct OrphanSweeper {
    fingerprint: Option<Fingerprint>,
    marker: SessionMarker,
    killer: Box<dyn ProcessTreeKiller>,
}

impl OrphanSweeper {
    pub fn new(fingerprint: Option<Fingerprint>, marker: SessionMarker) -> Self {
        Self::with_killer(fingerprint, marker, Box::new(NativeTreeKiller))
    }

    pub fn with_killer(
        fingerprint: Option<Fingerprint>,
        marker: SessionMarker,
        killer: Box<dyn ProcessTreeKiller>,
    ) -> Self {
        Self {
            fingerprint,
            marker,
            killer,
        }
    }

    /// Kill the tree under `root_pid`, then matching stragglers. Never fails.
    pub fn sweep(&self, root_pid: Option<u32>) -> SweepReport {
        let mut report = SweepReport::default();

        if let Some(pid) = root_pid {
            report.tree = self.killer.kill_tree(pid);
        }

        if let Some(fingerprint) = &self.fingerprint {
            for pid in self.find_orphans(fingerprint, root_pid) {
                report.orphans += self.killer.kill_tree(pid);
            }
        }

        if report.tree + report.orphans > 0 {
            info!(tree = report.tree, orphans = report.orphans, "swept child processes");
        }
        report
    }

    fn find_orphans(&self, fingerprint: &Fingerprint, root_pid: Option<u32>) -> Vec<u32> {
        let own = std::process::id();
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing()
                .with_cmd(UpdateKind::Always)
                .with_environ(UpdateKind::Always),
        );

        let mut found = Vec::new();
        for (pid, process) in system.processes() {
            let pid = pid.as_u32();
            if pid == own || Some(pid) == root_pid {
                continue;
            }
            if !fingerprint.matches(process.name(), process.cmd()) {
                continue;
            }
            // Unreadable environments are left alone: no marker, no kill.
            if process.environ().is_empty() {
                warn!(pid, "fingerprint match without readable environment, skipped");
                continue;
            }
            if self.marker.found_in(process.environ()) {
                found.push(pid);
            }
        }
        found
    }
}
