//! Lifecycle monitor
//!
//! Polls the child for exit on a fixed interval, latches the first exit code
//! it sees and delivers one exit notification. Stream failures reported by
//! other threads go through the same latch.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::pty::STREAM_FAILURE_EXIT_CODE;

/// Default exit polling interval.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long the monitor waits for the pump to drain before notifying.
pub const DRAIN_GRACE: Duration = Duration::from_millis(500);

const LATCHED: u64 = 1 << 32;

/// Cancellation signal shared by every background thread of a session.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Observable state of the child.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitState {
    Running,
    Exited(i32),
    /// Disposed before any exit was observed.
    Unknown,
}

/// Write-once exit code, readable from any thread.
#[derive(Debug, Default)]
pub struct ExitLatch(AtomicU64);

impl ExitLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `code` unless a code is already latched. Returns whether this
    /// call won.
    pub fn latch(&self, code: i32) -> bool {
        let value = LATCHED | u64::from(code as u32);
        self.0
            .compare_exchange(0, value, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn get(&self) -> Option<i32> {
        let value = self.0.load(Ordering::SeqCst);
        (value & LATCHED != 0).then_some(value as u32 as i32)
    }
}

/// Non-blocking exit check.
pub trait ExitProbe: Send + 'static {
    /// `Some(code)` once the process has exited.
    fn poll_exit(&mut self) -> io::Result<Option<i32>>;
}

/// One-shot exit callback.
pub type ExitHandler = Box<dyn FnOnce(i32) + Send + 'static>;

/// Slot holding the exit callback until it fires or the session disposes it.
pub type HandlerSlot = Arc<Mutex<Option<ExitHandler>>>;

/// State the monitor shares with the session and the pump.
#[derive(Clone)]
pub struct MonitorShared {
    pub cancel: CancelToken,
    pub latch: Arc<ExitLatch>,
    pub handler: HandlerSlot,
    /// Set by the pump when it stops reading.
    pub drained: Arc<AtomicBool>,
}

impl MonitorShared {
    pub fn new(handler: Option<ExitHandler>) -> Self {
        Self {
            cancel: CancelToken::new(),
            latch: Arc::new(ExitLatch::new()),
            handler: Arc::new(Mutex::new(handler)),
            drained: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Report a broken stream as an exit with [`STREAM_FAILURE_EXIT_CODE`].
    pub fn stream_failed(&self) {
        if self.latch.latch(STREAM_FAILURE_EXIT_CODE) {
            warn!(code = STREAM_FAILURE_EXIT_CODE, "stream failure latched as exit");
        }
    }

    /// Take the handler, unless disposal has begun.
    fn take_handler(&self) -> Option<ExitHandler> {
        let mut slot = self.handler.lock().ok()?;
        if self.cancel.is_cancelled() {
            return None;
        }
        slot.take()
    }
}

/// Exit polling loop. Runs on its own thread.
pub struct LifecycleMonitor<P> {
    probe: P,
    shared: MonitorShared,
    interval: Duration,
    grace: Duration,
}

impl<P: ExitProbe> LifecycleMonitor<P> {
    pub fn new(probe: P, shared: MonitorShared) -> Self {
        Self {
            probe,
            shared,
            interval: POLL_INTERVAL,
            grace: DRAIN_GRACE,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn run(mut self) {
        let code = loop {
            if self.shared.cancel.is_cancelled() {
                debug!("lifecycle monitor cancelled");
                return;
            }
            if let Some(code) = self.shared.latch.get() {
                break code;
            }
            match self.probe.poll_exit() {
                Ok(Some(code)) => {
                    self.shared.latch.latch(code);
                    // A concurrent stream failure may have won the latch.
                    break self.shared.latch.get().unwrap_or(code);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, "exit probe failed");
                    self.shared.stream_failed();
                    continue;
                }
            }
            // `dispose` unparks this thread.
            thread::park_timeout(self.interval);
        };

        self.wait_for_drain();

        match self.shared.take_handler() {
            Some(handler) => {
                info!(code, "child exited");
                handler(code);
            }
            None => debug!(code, "child exited, notification suppressed"),
        }
    }

    fn wait_for_drain(&self) {
        let deadline = Instant::now() + self.grace;
        while !self.shared.drained.load(Ordering::SeqCst) && !self.shared.cancel.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                debug!("output not drained within grace period");
                return;
            }
            thread::park_timeout((deadline - now).min(Duration::from_millis(10)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    /// Reports exit after a fixed number of polls.
    struct CountdownProbe {
        remaining: u32,
        code: i32,
    }

    impl ExitProbe for CountdownProbe {
        fn poll_exit(&mut self) -> io::Result<Option<i32>> {
            if self.remaining == 0 {
                return Ok(Some(self.code));
            }
            self.remaining -= 1;
            Ok(None)
        }
    }

    struct NeverExits;

    impl ExitProbe for NeverExits {
        fn poll_exit(&mut self) -> io::Result<Option<i32>> {
            Ok(None)
        }
    }

    fn shared_with_channel() -> (MonitorShared, mpsc::Receiver<i32>) {
        let (tx, rx) = mpsc::channel();
        let shared = MonitorShared::new(Some(Box::new(move |code: i32| {
            let _ = tx.send(code);
        })));
        shared.drained.store(true, Ordering::SeqCst);
        (shared, rx)
    }

    #[test]
    fn test_latch_first_writer_wins() {
        let latch = ExitLatch::new();
        assert_eq!(latch.get(), None);
        assert!(latch.latch(0));
        assert!(!latch.latch(7));
        assert_eq!(latch.get(), Some(0));
    }

    #[test]
    fn test_latch_negative_codes() {
        let latch = ExitLatch::new();
        latch.latch(-1);
        assert_eq!(latch.get(), Some(-1));
    }

    #[test]
    fn test_notifies_once_with_exit_code() {
        let (shared, rx) = shared_with_channel();
        let probe = CountdownProbe { remaining: 3, code: 42 };
        LifecycleMonitor::new(probe, shared.clone())
            .with_interval(Duration::from_millis(1))
            .run();

        assert_eq!(rx.try_recv(), Ok(42));
        assert!(rx.try_recv().is_err());
        assert_eq!(shared.latch.get(), Some(42));
        assert!(shared.handler.lock().unwrap().is_none());
    }

    #[test]
    fn test_stream_failure_becomes_exit() {
        let (shared, rx) = shared_with_channel();
        shared.stream_failed();
        LifecycleMonitor::new(NeverExits, shared.clone()).run();
        assert_eq!(rx.try_recv(), Ok(STREAM_FAILURE_EXIT_CODE));
    }

    #[test]
    fn test_no_notification_after_cancel() {
        let (shared, rx) = shared_with_channel();
        shared.cancel.cancel();
        let probe = CountdownProbe { remaining: 0, code: 0 };
        LifecycleMonitor::new(probe, shared.clone()).run();
        assert!(rx.try_recv().is_err());
        assert_eq!(shared.latch.get(), None);
    }

    #[test]
    fn test_cancel_wakes_parked_monitor() {
        let (shared, rx) = shared_with_channel();
        let cancel = shared.cancel.clone();
        let handle = thread::spawn(move || {
            LifecycleMonitor::new(NeverExits, shared)
                .with_interval(Duration::from_secs(60))
                .run()
        });
        thread::sleep(Duration::from_millis(20));
        cancel.cancel();
        handle.thread().unpark();
        handle.join().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_waits_for_drain_before_notifying() {
        let (shared, rx) = shared_with_channel();
        shared.drained.store(false, Ordering::SeqCst);
        let drained = Arc::clone(&shared.drained);
        let started = Instant::now();
        let handle = thread::spawn(move || {
            LifecycleMonitor::new(CountdownProbe { remaining: 0, code: 3 }, shared)
                .with_grace(Duration::from_secs(5))
                .run()
        });
        thread::sleep(Duration::from_millis(50));
        assert!(rx.try_recv().is_err());
        drained.store(true, Ordering::SeqCst);
        handle.join().unwrap();
        assert_eq!(rx.try_recv(), Ok(3));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
