//! Core pseudo-terminal hosting components.
//!
//! - **pty**: native pseudo-terminal allocation and process launch
//! - **env**: child environment assembly
//! - **pump**: output stream decoding and delivery
//! - **filter**: escape sequence stripping for plain-text consumers
//! - **monitor**: exit polling and the exit latch
//! - **sweep**: process tree and orphan cleanup
//! - **session**: the session handle tying them together
//!
//! # Architecture
//!
//! ```text
//! Session
//! ├── PseudoConsole (device, child's console)
//! ├── ChildProcess
//! ├── OutputPump thread ── Utf8Decoder ── ControlSequenceFilter ── sink
//! ├── LifecycleMonitor thread ── ExitLatch ── exit callback
//! ├── input writer thread
//! └── OrphanSweeper (run once on kill/dispose)
//! ```

pub mod env;
pub mod filter;
pub mod monitor;
pub mod pty;
pub mod pump;
pub mod session;
pub mod sweep;

pub use env::{EnvironmentBlock, EnvironmentBuilder, PathRules};
pub use monitor::ExitState;
pub use pty::{CommandLine, PtyError, TerminalSize};
pub use pump::OutputSink;
pub use session::{LaunchRequest, Session, SessionOptions};
pub use sweep::{Fingerprint, SessionMarker};
