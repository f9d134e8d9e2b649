//! `openpty(3)` backend.
//!
//! The master side is the device: the host reads and writes through two
//! duplicates of it, and window size changes go through `TIOCSWINSZ` on it.
//! The slave side stays parked inside [`PseudoConsole`] until the launcher
//! hands it to the child as stdio and controlling terminal.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};

use nix::pty::{openpty, Winsize};
use tracing::debug;

use super::{Allocation, CommandLine, PtyError, Result, TerminalSize};
use crate::core::env::EnvironmentBlock;

/// Master side of an `openpty` pair.
pub struct PseudoConsole {
    master: OwnedFd,
    slave: Option<OwnedFd>,
}

impl PseudoConsole {
    /// Apply a new window size to the live terminal.
    pub fn resize(&self, size: TerminalSize) -> Result<()> {
        let winsize = to_winsize(size);
        // SAFETY: TIOCSWINSZ reads a `winsize` struct that outlives the call.
        let rc = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &winsize) };
        if rc < 0 {
            return Err(PtyError::Io(io::Error::last_os_error()));
        }
        debug!(cols = size.cols, rows = size.rows, "resized pseudo terminal");
        Ok(())
    }

    /// Window size as the child sees it.
    pub fn size(&self) -> Result<TerminalSize> {
        let mut winsize = to_winsize(TerminalSize::default());
        // SAFETY: TIOCGWINSZ writes into a `winsize` struct we own.
        let rc = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCGWINSZ, &mut winsize) };
        if rc < 0 {
            return Err(PtyError::Io(io::Error::last_os_error()));
        }
        TerminalSize::new(winsize.ws_col, winsize.ws_row)
    }
}

/// Read end of the host's output stream.
///
/// Reads block until the child writes, the stream ends, or the paired
/// [`ReadInterrupt`] fires. An interrupted read reports end of stream.
pub struct PtyReader {
    file: File,
    wake: UnixStream,
    wake_tx: UnixStream,
}

impl PtyReader {
    pub fn interrupter(&self) -> io::Result<ReadInterrupt> {
        Ok(ReadInterrupt {
            wake: self.wake_tx.try_clone()?,
        })
    }

    /// Wait until the master is readable. `false` means interrupted.
    fn wait_readable(&self) -> io::Result<bool> {
        let mut fds = [
            libc::pollfd {
                fd: self.file.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.wake.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        loop {
            // SAFETY: `fds` is a valid array of two pollfd entries for the
            // duration of the call.
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if rc >= 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
        Ok(fds[1].revents == 0)
    }
}

impl Read for PtyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.wait_readable()? {
            return Ok(0);
        }
        match self.file.read(buf) {
            // Linux reports EIO on the master once every slave fd is closed.
            Err(err) if err.raw_os_error() == Some(libc::EIO) => Ok(0),
            other => other,
        }
    }
}

/// Wakes a [`PtyReader`] blocked in `read`.
pub struct ReadInterrupt {
    wake: UnixStream,
}

impl ReadInterrupt {
    pub fn interrupt(&self) {
        let _ = (&self.wake).write(&[1]);
    }
}

/// Write end of the host's input stream.
pub struct PtyWriter {
    file: File,
}

impl Write for PtyWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// The launched child.
///
/// Exit probing leaves the child a zombie where the platform allows it, so
/// its pid cannot be handed to another process until [`reap`](Self::reap).
pub struct ChildProcess {
    child: Child,
    exited: Option<i32>,
    reaped: bool,
}

impl ChildProcess {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Non-blocking exit probe.
    pub fn try_wait(&mut self) -> io::Result<Option<i32>> {
        if self.exited.is_none() {
            self.exited = self.peek_exit()?;
        }
        Ok(self.exited)
    }

    #[cfg(target_os = "linux")]
    fn peek_exit(&mut self) -> io::Result<Option<i32>> {
        if self.reaped {
            return Ok(None);
        }
        // SAFETY: an all-zero siginfo_t is a valid value.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        // SAFETY: `info` outlives the call. WNOWAIT leaves the child waitable.
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                self.child.id() as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOHANG | libc::WNOWAIT,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: waitid filled in a SIGCHLD siginfo, or left it zeroed.
        let (pid, status) = unsafe { (info.si_pid(), info.si_status()) };
        if pid == 0 {
            return Ok(None);
        }
        Ok(Some(match info.si_code {
            libc::CLD_EXITED => status,
            _ => 128 + status,
        }))
    }

    #[cfg(not(target_os = "linux"))]
    fn peek_exit(&mut self) -> io::Result<Option<i32>> {
        let code = self.child.try_wait()?.map(exit_code);
        self.reaped |= code.is_some();
        Ok(code)
    }

    /// Whether the pid still belongs to this child, running or zombie.
    pub fn pid_reserved(&self) -> bool {
        !self.reaped
    }

    /// Collect the child's exit status and release its pid. Non-blocking.
    pub fn reap(&mut self) -> io::Result<Option<i32>> {
        if self.reaped {
            return Ok(self.exited);
        }
        let Some(status) = self.child.try_wait()? else {
            return Ok(None);
        };
        self.reaped = true;
        let code = *self.exited.get_or_insert(exit_code(status));
        Ok(Some(code))
    }

    pub fn kill(&mut self) -> io::Result<()> {
        if self.reaped {
            return Ok(());
        }
        self.child.kill()
    }
}

/// Signal deaths map to the shell convention `128 + signal`.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

fn to_winsize(size: TerminalSize) -> Winsize {
    Winsize {
        ws_row: size.rows,
        ws_col: size.cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

fn set_cloexec(fd: &OwnedFd) -> io::Result<()> {
    // SAFETY: F_GETFD/F_SETFD only touch descriptor flags of a live fd.
    unsafe {
        let flags = libc::fcntl(fd.as_raw_fd(), libc::F_GETFD);
        if flags < 0 || libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

pub(super) fn allocate(size: TerminalSize) -> Result<Allocation> {
    let pty = openpty(Some(&to_winsize(size)), None).map_err(|e| PtyError::Allocation(e.into()))?;

    // Neither end may leak into children spawned elsewhere in the process.
    set_cloexec(&pty.master).map_err(PtyError::Allocation)?;
    set_cloexec(&pty.slave).map_err(PtyError::Allocation)?;

    let reader = pty.master.try_clone().map_err(PtyError::Allocation)?;
    let writer = pty.master.try_clone().map_err(PtyError::Allocation)?;
    let (wake, wake_tx) = UnixStream::pair().map_err(PtyError::Allocation)?;
    // Repeated interrupts must never block on a full socket buffer.
    wake_tx.set_nonblocking(true).map_err(PtyError::Allocation)?;

    debug!(cols = size.cols, rows = size.rows, "allocated pseudo terminal");

    Ok(Allocation {
        device: PseudoConsole {
            master: pty.master,
            slave: Some(pty.slave),
        },
        input: PtyWriter {
            file: File::from(writer),
        },
        output: PtyReader {
            file: File::from(reader),
            wake,
            wake_tx,
        },
    })
}

pub(super) fn launch(
    command: &CommandLine,
    working_directory: Option<&Path>,
    environment: Option<&EnvironmentBlock>,
    device: &mut PseudoConsole,
) -> Result<ChildProcess> {
    let slave = device.slave.take().ok_or_else(|| {
        PtyError::launch(
            command,
            io::Error::new(io::ErrorKind::Other, "terminal device is already bound to a process"),
        )
    })?;

    let stdin = slave.try_clone().map_err(|e| PtyError::launch(command, e))?;
    let stdout = slave.try_clone().map_err(|e| PtyError::launch(command, e))?;

    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args);
    if let Some(dir) = working_directory {
        cmd.current_dir(dir);
    }
    if let Some(env) = environment {
        cmd.env_clear();
        cmd.envs(env.iter());
    }
    cmd.stdin(Stdio::from(stdin))
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(slave));

    // SAFETY: only async-signal-safe calls run between fork and exec. By the
    // time this closure runs, stdin is already the slave terminal.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            if libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY as _, 0) == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(|e| PtyError::launch(command, e))?;
    // Dropping the command closes the parent's copies of the slave.
    drop(cmd);

    debug!(pid = child.id(), command = %command, "launched child on pseudo terminal");
    Ok(ChildProcess {
        child,
        exited: None,
        reaped: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_reports_initial_size() {
        let alloc = allocate(TerminalSize::new(100, 30).unwrap()).unwrap();
        assert_eq!(alloc.device.size().unwrap(), TerminalSize::new(100, 30).unwrap());
    }

    #[test]
    fn test_resize_reaches_device() {
        let alloc = allocate(TerminalSize::new(80, 24).unwrap()).unwrap();
        let size = TerminalSize::new(132, 50).unwrap();
        alloc.device.resize(size).unwrap();
        assert_eq!(alloc.device.size().unwrap(), size);
    }

    #[test]
    fn test_interrupt_unblocks_read() {
        let alloc = allocate(TerminalSize::default()).unwrap();
        let mut reader = alloc.output;
        let interrupt = reader.interrupter().unwrap();
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 16];
            reader.read(&mut buf)
        });
        interrupt.interrupt();
        assert_eq!(handle.join().unwrap().unwrap(), 0);
    }

    fn wait_for_exit(child: &mut ChildProcess) -> Option<i32> {
        for _ in 0..500 {
            if let Some(code) = child.try_wait().unwrap() {
                return Some(code);
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        None
    }

    #[test]
    fn test_exit_probe_keeps_pid_until_reaped() {
        let mut alloc = allocate(TerminalSize::default()).unwrap();
        let cmd = CommandLine::new("/bin/sh").args(["-c", "exit 5"]);
        let mut child = launch(&cmd, None, None, &mut alloc.device).unwrap();

        assert_eq!(wait_for_exit(&mut child), Some(5));
        assert_eq!(child.try_wait().unwrap(), Some(5));
        if cfg!(target_os = "linux") {
            assert!(child.pid_reserved());
            assert!(Path::new(&format!("/proc/{}", child.pid())).exists());
        }

        assert_eq!(child.reap().unwrap(), Some(5));
        assert!(!child.pid_reserved());
        assert_eq!(child.reap().unwrap(), Some(5));
        assert!(child.kill().is_ok());
    }

    #[test]
    fn test_signal_death_reported_as_128_plus_signal() {
        let mut alloc = allocate(TerminalSize::default()).unwrap();
        let cmd = CommandLine::new("/bin/sh").args(["-c", "sleep 30"]);
        let mut child = launch(&cmd, None, None, &mut alloc.device).unwrap();
        child.kill().unwrap();
        assert_eq!(wait_for_exit(&mut child), Some(128 + 9));
        assert_eq!(child.reap().unwrap(), Some(128 + 9));
    }

    #[test]
    fn test_launch_twice_on_same_device_fails() {
        let mut alloc = allocate(TerminalSize::default()).unwrap();
        let cmd = CommandLine::new("true");
        let mut child = launch(&cmd, None, None, &mut alloc.device).unwrap();
        assert!(matches!(
            launch(&cmd, None, None, &mut alloc.device),
            Err(PtyError::Launch { .. })
        ));
        let _ = child.kill();
    }
}
