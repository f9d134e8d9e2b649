//! Host interactive console programs on a pseudo terminal and stream their
//! output as text.

pub mod config;
pub mod core;

pub use crate::core::{
    CommandLine, ExitState, LaunchRequest, OutputSink, PtyError, Session, SessionOptions,
    TerminalSize,
};
