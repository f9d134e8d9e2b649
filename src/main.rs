//! ptyhost - run an interactive console program on a pseudo terminal
//!
//! The program's output is streamed to stdout, stdin is forwarded to it, and
//! the host terminal's size is mirrored onto the pseudo terminal. ptyhost
//! exits with the program's exit code.
//!
//! # Quick Start
//!
//! ```text
//! ptyhost                          # program from ~/.ptyhost/config.toml
//! ptyhost -- bash -l               # any program
//! ptyhost --strip -- claude -p hi  # plain text output
//! ```

use std::env;
use std::io::{self, IsTerminal, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use crossterm::terminal;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use ptyhost::config::{self, Config};
use ptyhost::{LaunchRequest, Session, TerminalSize};

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How often the host terminal size is checked
const SIZE_POLL: Duration = Duration::from_millis(250);

/// Command line options
#[derive(Debug, Default)]
struct Args {
    cwd: Option<PathBuf>,
    size: Option<TerminalSize>,
    /// `Some(true)` for --strip, `Some(false)` for --raw
    strip: Option<bool>,
    config: Option<PathBuf>,
    /// Program and arguments after `--`
    command: Vec<String>,
}

fn print_version() {
    eprintln!("ptyhost {}", VERSION);
}

fn print_help() {
    eprintln!("ptyhost {} - host a console program on a pseudo terminal", VERSION);
    eprintln!();
    eprintln!("Usage: ptyhost [OPTIONS] [-- PROGRAM ARGS...]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --cwd <DIR>           Working directory for the program");
    eprintln!("  --size <COLSxROWS>    Initial terminal size (default: host terminal or 120x40)");
    eprintln!("  --strip               Strip escape sequences and carriage returns");
    eprintln!("  --raw                 Pass output through unchanged (default)");
    eprintln!("  --config <FILE>       Configuration file (default: ~/.ptyhost/config.toml)");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Without PROGRAM, the program comes from the configuration file.");
    eprintln!();
    eprintln!("Logging: ~/.ptyhost/ptyhost.log, level from PTYHOST_LOG (default: info)");
}

fn parse_size(value: &str) -> Result<TerminalSize, String> {
    let (cols, rows) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("Invalid size '{}': expected COLSxROWS", value))?;
    let cols = cols.trim().parse::<u16>().map_err(|e| format!("Invalid columns '{}': {}", cols, e))?;
    let rows = rows.trim().parse::<u16>().map_err(|e| format!("Invalid rows '{}': {}", rows, e))?;
    TerminalSize::new(cols, rows).map_err(|e| e.to_string())
}

fn parse_args(args: &[String]) -> Result<Option<Args>, String> {
    let mut parsed = Args::default();
    let mut i = 0;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(None);
            }
            "-v" | "--version" => {
                print_version();
                return Ok(None);
            }
            "--cwd" => {
                i += 1;
                let dir = args.get(i).ok_or("Missing directory for --cwd")?;
                parsed.cwd = Some(PathBuf::from(dir));
            }
            "--size" => {
                i += 1;
                let size = args.get(i).ok_or("Missing value for --size")?;
                parsed.size = Some(parse_size(size)?);
            }
            "--strip" => parsed.strip = Some(true),
            "--raw" => parsed.strip = Some(false),
            "--config" => {
                i += 1;
                let file = args.get(i).ok_or("Missing file for --config")?;
                parsed.config = Some(PathBuf::from(file));
            }
            "--" => {
                parsed.command = args[i + 1..].to_vec();
                break;
            }
            arg => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
        }
        i += 1;
    }

    Ok(Some(parsed))
}

fn init_logging() {
    let log_path = config::log_path();
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let filter = EnvFilter::try_from_env("PTYHOST_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .try_init();
    }
}

/// Restores cooked mode on drop
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> anyhow::Result<Self> {
        terminal::enable_raw_mode().context("failed to enable raw mode")?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

fn host_size() -> Option<TerminalSize> {
    let (cols, rows) = terminal::size().ok()?;
    TerminalSize::new(cols, rows).ok()
}

fn main() -> anyhow::Result<ExitCode> {
    let argv: Vec<String> = env::args().skip(1).collect();
    let args = match parse_args(&argv) {
        Ok(Some(args)) => args,
        Ok(None) => return Ok(ExitCode::SUCCESS),
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            return Ok(ExitCode::from(2));
        }
    };

    init_logging();
    info!("ptyhost {} starting", VERSION);

    let code = run(args)?;
    info!(code, "ptyhost exiting");
    // Exit codes outside 0..=255 (including -1) wrap the way shells report them.
    Ok(ExitCode::from(code as u8))
}

fn run(args: Args) -> anyhow::Result<i32> {
    let mut config = match &args.config {
        Some(path) => Config::from_path(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::load(),
    };

    if let Some((program, rest)) = args.command.split_first() {
        config.program = Some(program.clone());
        config.args = rest.to_vec();
    }
    if let Some(strip) = args.strip {
        config.strip_escapes = strip;
    }

    let layout = config.install_layout().context("resolving program")?;
    let interactive = io::stdin().is_terminal() && io::stdout().is_terminal();
    let mirror_size = args.size.is_none() && io::stdout().is_terminal();

    let size = match args.size {
        Some(size) => size,
        None => match host_size().filter(|_| mirror_size) {
            Some(size) => size,
            None => config.terminal_size()?,
        },
    };

    let command = config.command_line(&layout);
    let mut request = LaunchRequest::new(command.clone()).size(size);
    request.working_directory = args.cwd.clone().or_else(|| config.working_directory.clone());
    request.environment_overrides = config.environment.clone();
    let options = config.session_options(&layout);

    info!(program = %layout.program, %size, interactive, "launching");

    let (exit_tx, exit_rx) = mpsc::channel::<i32>();
    let sink = |text: &str| {
        let mut stdout = io::stdout().lock();
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.flush();
    };

    let session = Session::launch(request, options, sink, move |code| {
        let _ = exit_tx.send(code);
    })
    .map_err(|e| {
        error!(error = %e, "launch failed");
        e
    })
    .with_context(|| format!("launching {}", command))?;
    let session = Arc::new(session);

    let _raw = if interactive { Some(RawModeGuard::enable()?) } else { None };

    if let Err(e) = spawn_stdin_forwarder(Arc::clone(&session)) {
        error!(error = %e, "failed to start stdin forwarding");
    }

    let mut last_size = size;
    let code = loop {
        match exit_rx.recv_timeout(SIZE_POLL) {
            Ok(code) => break code,
            Err(RecvTimeoutError::Timeout) => {
                if !mirror_size {
                    continue;
                }
                if let Some(current) = host_size().filter(|s| *s != last_size) {
                    debug!(%current, "host terminal resized");
                    if let Err(e) = session.resize(current) {
                        error!(error = %e, "resize failed");
                    }
                    last_size = current;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break session.exit_code().unwrap_or(-1),
        }
    };

    session.dispose();
    Ok(code)
}

/// Forward stdin to the session until EOF. The thread is left running when
/// the session ends; process exit takes it down.
fn spawn_stdin_forwarder(session: Arc<Session>) -> io::Result<()> {
    thread::Builder::new()
        .name("ptyhost-stdin".to_string())
        .spawn(move || forward_input(io::stdin().lock(), |bytes| session.write(bytes).is_ok()))?;
    Ok(())
}

/// Copy `reader` into `send` until EOF, a read error, or `send` refusing.
fn forward_input(mut reader: impl Read, mut send: impl FnMut(&[u8]) -> bool) {
    let mut buffer = [0u8; 1024];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                if !send(&buffer[..n]) {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "stdin read failed");
                break;
            }
        }
    }
}
