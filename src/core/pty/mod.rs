//! Pseudo-terminal allocation and process launch.
//!
//! This module provides the platform-neutral surface over the native
//! pseudo-terminal backends:
//!
//! - **conpty** (Windows): ConPTY pseudo console fed by two anonymous pipes
//! - **unix**: `openpty(3)` master/slave pair, slave bound as controlling terminal
//!
//! Every native resource is a distinct owned type that releases itself once
//! on drop, so an early return on any failure path leaks nothing.

use std::fmt;
use std::io;
use std::path::Path;

use thiserror::Error;

use super::env::EnvironmentBlock;

#[cfg(windows)]
mod conpty;
#[cfg(windows)]
use conpty as sys;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as sys;

pub use sys::{ChildProcess, PseudoConsole, PtyReader, PtyWriter, ReadInterrupt};

/// Exit code reported when the session ends because its streams failed
/// rather than because the child exited.
pub const STREAM_FAILURE_EXIT_CODE: i32 = -1;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to allocate pseudo terminal: {0}")]
    Allocation(#[source] io::Error),

    #[error("failed to launch '{command}' (os error {code:?}): {source}")]
    Launch {
        command: String,
        code: Option<i32>,
        #[source]
        source: io::Error,
    },

    #[error("pseudo terminal I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("session already disposed")]
    AlreadyDisposed,

    #[error("invalid terminal size {cols}x{rows}: both dimensions must be non-zero")]
    InvalidSize { cols: u16, rows: u16 },

    #[error("invalid environment entry: {0}")]
    InvalidEnvironment(String),
}

impl PtyError {
    pub(crate) fn launch(command: &CommandLine, source: io::Error) -> Self {
        PtyError::Launch {
            command: command.to_string(),
            code: source.raw_os_error(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, PtyError>;

/// Terminal geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalSize {
    pub fn new(cols: u16, rows: u16) -> Result<Self> {
        if cols == 0 || rows == 0 {
            return Err(PtyError::InvalidSize { cols, rows });
        }
        Ok(Self { cols, rows })
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 120, rows: 40 }
    }
}

impl fmt::Display for TerminalSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// Program plus arguments to run inside the pseudo terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Render as a single Windows command line.
    ///
    /// Arguments are quoted following the rules `CommandLineToArgvW` uses to
    /// split them again: backslashes are literal unless they precede a quote.
    pub fn to_windows_command_line(&self) -> String {
        let mut line = String::new();
        quote_windows_arg(&self.program, &mut line);
        for arg in &self.args {
            line.push(' ');
            quote_windows_arg(arg, &mut line);
        }
        line
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

fn quote_windows_arg(arg: &str, out: &mut String) {
    let needs_quotes = arg.is_empty() || arg.contains([' ', '\t', '\n', '\u{b}', '"']);
    if !needs_quotes {
        out.push_str(arg);
        return;
    }

    out.push('"');
    let mut backslashes = 0usize;
    for ch in arg.chars() {
        match ch {
            '\\' => backslashes += 1,
            '"' => {
                out.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                out.push('"');
                backslashes = 0;
            }
            _ => {
                out.extend(std::iter::repeat('\\').take(backslashes));
                out.push(ch);
                backslashes = 0;
            }
        }
    }
    // Trailing backslashes are doubled so the closing quote stays a quote.
    out.extend(std::iter::repeat('\\').take(backslashes * 2));
    out.push('"');
}

/// A freshly allocated pseudo terminal: the device plus the host's ends of
/// the two byte pipes.
pub struct Allocation {
    pub device: PseudoConsole,
    /// Host → child.
    pub input: PtyWriter,
    /// Child → host.
    pub output: PtyReader,
}

/// Create the virtual terminal device and its pipes.
pub fn allocate(size: TerminalSize) -> Result<Allocation> {
    sys::allocate(size)
}

/// Start `command` with `device` as its console.
///
/// With `environment` set to `None` the child inherits the host environment
/// unmodified.
pub fn launch(
    command: &CommandLine,
    working_directory: Option<&Path>,
    environment: Option<&EnvironmentBlock>,
    device: &mut PseudoConsole,
) -> Result<ChildProcess> {
    sys::launch(command, working_directory, environment, device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_size_rejects_zero() {
        assert!(matches!(
            TerminalSize::new(0, 24),
            Err(PtyError::InvalidSize { cols: 0, rows: 24 })
        ));
        assert!(TerminalSize::new(80, 0).is_err());
        assert_eq!(TerminalSize::new(80, 24).unwrap().to_string(), "80x24");
    }

    #[test]
    fn test_windows_command_line_plain() {
        let cmd = CommandLine::new("claude.cmd").arg("--dangerously-skip-permissions");
        assert_eq!(cmd.to_windows_command_line(), "claude.cmd --dangerously-skip-permissions");
    }

    #[test]
    fn test_windows_command_line_quoting() {
        let cmd = CommandLine::new(r"C:\Program Files\node\node.exe")
            .arg("say \"hi\"")
            .arg(r"C:\dir with space\")
            .arg("");
        assert_eq!(
            cmd.to_windows_command_line(),
            r#""C:\Program Files\node\node.exe" "say \"hi\"" "C:\dir with space\\" """#
        );
    }

    #[test]
    fn test_launch_error_carries_os_code() {
        let cmd = CommandLine::new("missing");
        let err = PtyError::launch(&cmd, io::Error::from_raw_os_error(2));
        match err {
            PtyError::Launch { command, code, .. } => {
                assert_eq!(command, "missing");
                assert_eq!(code, Some(2));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
