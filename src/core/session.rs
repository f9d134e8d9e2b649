//! Session management
//!
//! A [`Session`] owns one child process running on a pseudo console together
//! with the threads that serve it:
//!
//! - the output pump, reading the console and feeding the sink
//! - the lifecycle monitor, polling for exit
//! - the input writer, serializing writes to the console
//!
//! All of them stop on the session's cancellation token, which `dispose`
//! sets before anything is released.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, Thread, ThreadId};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::env::{EnvironmentBuilder, PathRules};
use super::monitor::{ExitHandler, ExitProbe, ExitState, LifecycleMonitor, MonitorShared, POLL_INTERVAL};
use super::pty::{
    self, ChildProcess, CommandLine, PseudoConsole, PtyError, PtyWriter, ReadInterrupt, Result,
    TerminalSize,
};
use super::pump::{OutputPump, OutputSink, PumpExit, READ_BUFFER_SIZE};
use super::sweep::{Fingerprint, OrphanSweeper, SessionMarker};

/// How long `dispose` waits for a killed child to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Delay between read interrupts while `dispose` waits for the pump.
const INTERRUPT_RETRY: Duration = Duration::from_millis(10);

/// Terminal variables every child gets unless overridden.
pub fn default_terminal_environment() -> BTreeMap<String, String> {
    [
        ("TERM", "xterm-256color"),
        ("FORCE_COLOR", "1"),
        ("COLORTERM", "truecolor"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// What to run and where.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub command: CommandLine,
    pub working_directory: Option<PathBuf>,
    /// Passed through verbatim, whatever the key.
    pub environment_overrides: BTreeMap<String, String>,
    pub initial_size: TerminalSize,
}

impl LaunchRequest {
    pub fn new(command: CommandLine) -> Self {
        Self {
            command,
            working_directory: None,
            environment_overrides: BTreeMap::new(),
            initial_size: TerminalSize::default(),
        }
    }

    pub fn working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment_overrides.insert(key.into(), value.into());
        self
    }

    pub fn size(mut self, size: TerminalSize) -> Self {
        self.initial_size = size;
        self
    }
}

/// Host-side behaviour of a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Remove escape sequences and carriage returns from output.
    pub strip_escapes: bool,
    pub poll_interval: Duration,
    pub read_buffer_size: usize,
    /// Start from the host environment instead of an empty one.
    pub inherit_environment: bool,
    pub terminal_environment: BTreeMap<String, String>,
    pub path_rules: PathRules,
    /// Enables the orphan scan on dispose.
    pub fingerprint: Option<Fingerprint>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            strip_escapes: false,
            poll_interval: POLL_INTERVAL,
            read_buffer_size: READ_BUFFER_SIZE,
            inherit_environment: true,
            terminal_environment: default_terminal_environment(),
            path_rules: PathRules::default(),
            fingerprint: None,
        }
    }
}

struct ChildProbe(Arc<Mutex<Option<ChildProcess>>>);

impl ExitProbe for ChildProbe {
    fn poll_exit(&mut self) -> io::Result<Option<i32>> {
        match self.0.lock() {
            Ok(mut child) => match child.as_mut() {
                Some(child) => child.try_wait(),
                None => Ok(None),
            },
            Err(_) => Err(io::Error::new(io::ErrorKind::Other, "child lock poisoned")),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A child process attached to a pseudo console.
pub struct Session {
    pid: u32,
    marker: SessionMarker,
    device: Mutex<Option<PseudoConsole>>,
    child: Arc<Mutex<Option<ChildProcess>>>,
    size: Mutex<TerminalSize>,
    shared: MonitorShared,
    input_tx: Mutex<Option<Sender<Vec<u8>>>>,
    interrupt: Mutex<Option<ReadInterrupt>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    sweeper: Mutex<Option<OrphanSweeper>>,
    disposed: AtomicBool,
}

impl Session {
    /// Allocate a console, start the child on it and begin pumping output.
    ///
    /// `on_exit` runs at most once, on the monitor thread, with the child's
    /// exit code (or `-1` when a stream broke). It never runs once
    /// [`dispose`](Self::dispose) has started.
    pub fn launch<S, F>(request: LaunchRequest, options: SessionOptions, sink: S, on_exit: F) -> Result<Self>
    where
        S: OutputSink,
        F: FnOnce(i32) + Send + 'static,
    {
        let marker = SessionMarker::generate();

        let builder = if options.inherit_environment {
            EnvironmentBuilder::from_process()
        } else {
            EnvironmentBuilder::new()
        };
        let mut environment = builder
            .defaults(options.terminal_environment.clone())
            .path_rules(options.path_rules.clone())
            .overrides(request.environment_overrides.clone())
            .build()?;
        environment.insert(marker.key(), marker.value())?;

        let mut allocation = pty::allocate(request.initial_size)?;
        let child = pty::launch(
            &request.command,
            request.working_directory.as_deref(),
            Some(&environment),
            &mut allocation.device,
        )?;
        let pid = child.pid();

        info!(pid, command = %request.command, size = %request.initial_size, "session started");

        let handler: ExitHandler = Box::new(on_exit);
        let session = Self {
            pid,
            marker: marker.clone(),
            device: Mutex::new(Some(allocation.device)),
            child: Arc::new(Mutex::new(Some(child))),
            size: Mutex::new(request.initial_size),
            shared: MonitorShared::new(Some(handler)),
            input_tx: Mutex::new(None),
            interrupt: Mutex::new(None),
            pump: Mutex::new(None),
            monitor: Mutex::new(None),
            writer: Mutex::new(None),
            sweeper: Mutex::new(Some(OrphanSweeper::new(options.fingerprint.clone(), marker))),
            disposed: AtomicBool::new(false),
        };

        // From here on a failure drops `session`, which disposes it.
        session.start_threads(allocation.input, allocation.output, sink, &options)?;
        Ok(session)
    }

    fn start_threads<S: OutputSink>(
        &self,
        input: PtyWriter,
        output: pty::PtyReader,
        sink: S,
        options: &SessionOptions,
    ) -> Result<()> {
        *lock(&self.interrupt) = Some(output.interrupter()?);

        let monitor = LifecycleMonitor::new(ChildProbe(Arc::clone(&self.child)), self.shared.clone())
            .with_interval(options.poll_interval);
        let handle = thread::Builder::new()
            .name(format!("ptyhost-monitor-{}", self.pid))
            .spawn(move || monitor.run())?;
        let monitor_thread = handle.thread().clone();
        *lock(&self.monitor) = Some(handle);

        let pump = OutputPump::new(output, sink, options.strip_escapes)
            .with_buffer_size(options.read_buffer_size);
        let shared = self.shared.clone();
        let wake = monitor_thread.clone();
        let handle = thread::Builder::new()
            .name(format!("ptyhost-pump-{}", self.pid))
            .spawn(move || {
                if let PumpExit::Failed(_) = pump.run(&shared.cancel) {
                    shared.stream_failed();
                }
                shared.drained.store(true, Ordering::SeqCst);
                wake.unpark();
            })?;
        *lock(&self.pump) = Some(handle);

        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        let shared = self.shared.clone();
        let wake = monitor_thread;
        let handle = thread::Builder::new()
            .name(format!("ptyhost-input-{}", self.pid))
            .spawn(move || input_loop(input, rx, shared, wake))?;
        *lock(&self.writer) = Some(handle);
        *lock(&self.input_tx) = Some(tx);

        Ok(())
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn marker(&self) -> &SessionMarker {
        &self.marker
    }

    pub fn size(&self) -> TerminalSize {
        *lock(&self.size)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn is_exited(&self) -> bool {
        self.observed_exit().is_some()
    }

    /// `None` while the child runs. The latched code survives disposal.
    pub fn exit_code(&self) -> Option<i32> {
        self.observed_exit()
    }

    pub fn exit_state(&self) -> ExitState {
        match self.observed_exit() {
            Some(code) => ExitState::Exited(code),
            None if self.is_disposed() => ExitState::Unknown,
            None => ExitState::Running,
        }
    }

    /// The latched exit code. When none is latched yet the child is probed
    /// directly instead of waiting for the monitor's next poll.
    fn observed_exit(&self) -> Option<i32> {
        if let Some(code) = self.shared.latch.get() {
            return Some(code);
        }
        let code = lock(&self.child).as_mut()?.try_wait().ok().flatten()?;
        if self.shared.latch.latch(code) {
            self.wake_monitor();
        }
        self.shared.latch.get()
    }

    fn wake_monitor(&self) {
        if let Some(monitor) = lock(&self.monitor).as_ref() {
            monitor.thread().unpark();
        }
    }

    /// Queue bytes for the child. Writes are delivered in call order.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        if self.is_disposed() {
            return Err(PtyError::AlreadyDisposed);
        }
        let tx = lock(&self.input_tx);
        let tx = tx.as_ref().ok_or(PtyError::AlreadyDisposed)?;
        tx.send(bytes.to_vec()).map_err(|_| {
            PtyError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "input stream closed"))
        })
    }

    /// Change the console size. Ignored once the child has exited.
    pub fn resize(&self, size: TerminalSize) -> Result<()> {
        if self.is_disposed() || self.is_exited() {
            return Ok(());
        }
        if let Some(device) = lock(&self.device).as_ref() {
            device.resize(size)?;
            *lock(&self.size) = size;
        }
        Ok(())
    }

    /// Force the child and its descendants down. The exit is reported
    /// through the exit callback like any other.
    pub fn kill(&self) {
        if self.is_disposed() || self.is_exited() {
            return;
        }
        info!(pid = self.pid, "killing session");
        self.sweep();
        if let Some(child) = lock(&self.child).as_mut() {
            if let Err(err) = child.kill() {
                debug!(pid = self.pid, error = %err, "kill after sweep");
            }
        }
        self.wake_monitor();
    }

    fn sweep(&self) {
        let Some(sweeper) = lock(&self.sweeper).take() else {
            return;
        };
        // Held for the whole sweep so the pid cannot be released under it.
        let child = lock(&self.child);
        let root = child
            .as_ref()
            .filter(|child| child.pid_reserved())
            .map(ChildProcess::pid);
        if root.is_none() {
            debug!(pid = self.pid, "child already reaped, skipping tree kill");
        }
        sweeper.sweep(root);
    }

    /// Release everything. Safe to call any number of times, from any
    /// thread, including the exit callback and the output sink.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(pid = self.pid, "disposing session");

        self.shared.cancel.cancel();
        // Drop the callback under its lock so the monitor cannot take it.
        drop(lock(&self.shared.handler).take());

        self.sweep();

        let interrupt = lock(&self.interrupt).take();
        drop(lock(&self.input_tx).take());
        let monitor = lock(&self.monitor).take();
        if let Some(monitor) = &monitor {
            monitor.thread().unpark();
        }

        let current = thread::current().id();
        if let Some(pump) = lock(&self.pump).take() {
            join_reader(pump, current, || {
                if let Some(interrupt) = &interrupt {
                    interrupt.interrupt();
                }
            });
        }
        if let Some(monitor) = monitor {
            join_unless_current(monitor, current);
        }

        drop(lock(&self.device).take());

        if let Some(handle) = lock(&self.writer).take() {
            join_unless_current(handle, current);
        }

        if let Some(mut child) = lock(&self.child).take() {
            reap(&mut child, self.pid);
        }

        info!(pid = self.pid, state = ?self.exit_state(), "session disposed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn join_unless_current(handle: JoinHandle<()>, current: ThreadId) {
    if handle.thread().id() == current {
        return;
    }
    if handle.join().is_err() {
        warn!("session thread panicked");
    }
}

/// Join a thread blocked in a read, interrupting it until it is out. An
/// interrupt that lands before the read starts is lost on some platforms.
fn join_reader(handle: JoinHandle<()>, current: ThreadId, interrupt: impl Fn()) {
    if handle.thread().id() == current {
        return;
    }
    while !handle.is_finished() {
        interrupt();
        thread::sleep(INTERRUPT_RETRY);
    }
    join_unless_current(handle, current);
}

fn input_loop(mut input: PtyWriter, rx: mpsc::Receiver<Vec<u8>>, shared: MonitorShared, monitor: Thread) {
    for bytes in rx {
        if shared.cancel.is_cancelled() {
            break;
        }
        if let Err(err) = input.write_all(&bytes).and_then(|_| input.flush()) {
            if !shared.cancel.is_cancelled() {
                warn!(error = %err, "input stream write failed");
                shared.stream_failed();
                monitor.unpark();
            }
            break;
        }
    }
    debug!("input writer stopped");
}

/// Wait briefly for the child to go away, then drop it.
fn reap(child: &mut ChildProcess, pid: u32) {
    let deadline = Instant::now() + REAP_TIMEOUT;
    loop {
        match child.reap() {
            Ok(Some(code)) => {
                debug!(pid, code, "child reaped");
                return;
            }
            Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
            Ok(None) => {
                warn!(pid, "child still running after dispose, killing");
                let _ = child.kill();
                let _ = child.reap();
                return;
            }
            Err(err) => {
                debug!(pid, error = %err, "child wait failed");
                return;
            }
        }
    }
}
