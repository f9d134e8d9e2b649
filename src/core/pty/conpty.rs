//! ConPTY backend for Windows
//!
//! Requires Windows 10 1809 (build 17763) or later.

use std::ffi::{c_void, OsStr};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{
    CloseHandle, ERROR_BROKEN_PIPE, ERROR_OPERATION_ABORTED, HANDLE, STILL_ACTIVE, WAIT_OBJECT_0,
};
use windows::Win32::System::Console::{
    ClosePseudoConsole, CreatePseudoConsole, ResizePseudoConsole, COORD, HPCON,
};
use windows::Win32::System::Pipes::CreatePipe;
use windows::Win32::System::Threading::{
    CreateProcessW, DeleteProcThreadAttributeList, GetExitCodeProcess,
    InitializeProcThreadAttributeList, TerminateProcess, UpdateProcThreadAttribute,
    WaitForSingleObject, CREATE_UNICODE_ENVIRONMENT, EXTENDED_STARTUPINFO_PRESENT,
    LPPROC_THREAD_ATTRIBUTE_LIST, PROCESS_INFORMATION, STARTUPINFOEXW,
};
use windows::Win32::System::IO::CancelIoEx;

use super::{Allocation, CommandLine, PtyError, Result, TerminalSize};
use crate::core::env::EnvironmentBlock;

const PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE: usize = 0x00020016;

/// Convert a `windows` error into the Win32 error code it wraps.
fn win32_error(err: windows::core::Error) -> io::Error {
    io::Error::from_raw_os_error(err.code().0 & 0xFFFF)
}

fn raw(handle: &OwnedHandle) -> HANDLE {
    HANDLE(handle.as_raw_handle())
}

fn coord(size: TerminalSize) -> COORD {
    COORD {
        X: size.cols as i16,
        Y: size.rows as i16,
    }
}

fn wide(s: &OsStr) -> Vec<u16> {
    s.encode_wide().chain(std::iter::once(0)).collect()
}

/// ConPTY pseudo console handle
pub struct PseudoConsole {
    hpc: HPCON,
}

// Safety: HPCON is an opaque kernel object reference; ConPTY calls on it are
// serialized by the session.
unsafe impl Send for PseudoConsole {}
unsafe impl Sync for PseudoConsole {}

impl PseudoConsole {
    /// Resize the pseudo console
    pub fn resize(&self, size: TerminalSize) -> Result<()> {
        unsafe {
            ResizePseudoConsole(self.hpc, coord(size)).map_err(|e| PtyError::Io(win32_error(e)))?;
        }
        debug!(cols = size.cols, rows = size.rows, "resized pseudo console");
        Ok(())
    }
}

impl Drop for PseudoConsole {
    fn drop(&mut self) {
        unsafe { ClosePseudoConsole(self.hpc) };
    }
}

/// Read end of the output pipe (pseudo console writes, we read)
pub struct PtyReader {
    file: Arc<File>,
}

impl PtyReader {
    pub fn interrupter(&self) -> io::Result<ReadInterrupt> {
        Ok(ReadInterrupt {
            file: Arc::clone(&self.file),
        })
    }
}

impl Read for PtyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match (&*self.file).read(buf) {
            // The console side closed, or a pending read was cancelled.
            Err(err)
                if err.raw_os_error() == Some(ERROR_BROKEN_PIPE.0 as i32)
                    || err.raw_os_error() == Some(ERROR_OPERATION_ABORTED.0 as i32) =>
            {
                Ok(0)
            }
            other => other,
        }
    }
}

/// Cancels a blocking read on the output pipe.
///
/// `CancelIoEx` only reaches a read that is already pending, so callers
/// repeat the interrupt until the reader is out. Holds the pipe open so the
/// handle stays valid for as long as the interrupt exists.
pub struct ReadInterrupt {
    file: Arc<File>,
}

impl ReadInterrupt {
    pub fn interrupt(&self) {
        unsafe {
            let _ = CancelIoEx(HANDLE(self.file.as_raw_handle()), None);
        }
    }
}

/// Write end of the input pipe (we write, pseudo console reads)
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

/// The launched child. Only the process handle is retained.
pub struct ChildProcess {
    process: OwnedHandle,
    pid: u32,
}

impl ChildProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Non-blocking exit probe.
    pub fn try_wait(&mut self) -> io::Result<Option<i32>> {
        unsafe {
            if WaitForSingleObject(raw(&self.process), 0) != WAIT_OBJECT_0 {
                return Ok(None);
            }
            let mut code: u32 = 0;
            GetExitCodeProcess(raw(&self.process), &mut code).map_err(win32_error)?;
            if code == STILL_ACTIVE.0 as u32 {
                return Ok(None);
            }
            Ok(Some(code as i32))
        }
    }

    /// The open process handle keeps the pid from being reused.
    pub fn pid_reserved(&self) -> bool {
        true
    }

    /// Same as [`try_wait`](Self::try_wait); the pid is released when the
    /// handle is dropped.
    pub fn reap(&mut self) -> io::Result<Option<i32>> {
        self.try_wait()
    }

    pub fn kill(&mut self) -> io::Result<()> {
        unsafe { TerminateProcess(raw(&self.process), 1).map_err(win32_error) }
    }
}

unsafe fn create_pipe() -> Result<(OwnedHandle, OwnedHandle)> {
    let mut read = HANDLE::default();
    let mut write = HANDLE::default();
    CreatePipe(&mut read, &mut write, None, 0).map_err(|e| PtyError::Allocation(win32_error(e)))?;
    Ok((
        OwnedHandle::from_raw_handle(read.0),
        OwnedHandle::from_raw_handle(write.0),
    ))
}

pub(super) fn allocate(size: TerminalSize) -> Result<Allocation> {
    unsafe {
        // Input pipe (we write, pseudo console reads)
        let (input_read, input_write) = create_pipe()?;
        // Output pipe (pseudo console writes, we read)
        let (output_read, output_write) = create_pipe()?;

        let hpc = CreatePseudoConsole(coord(size), raw(&input_read), raw(&output_write), 0)
            .map_err(|e| PtyError::Allocation(win32_error(e)))?;

        // The pseudo console holds its own references to these ends now.
        drop(input_read);
        drop(output_write);

        debug!(cols = size.cols, rows = size.rows, "allocated pseudo console");

        Ok(Allocation {
            device: PseudoConsole { hpc },
            input: PtyWriter {
                file: File::from(input_write),
            },
            output: PtyReader {
                file: Arc::new(File::from(output_read)),
            },
        })
    }
}

/// Process/thread attribute list carrying the pseudo console binding.
struct AttributeList {
    // usize storage keeps the list pointer-aligned.
    buffer: Vec<usize>,
    initialized: bool,
}

impl AttributeList {
    unsafe fn with_pseudo_console(hpc: HPCON) -> windows::core::Result<Self> {
        let mut size: usize = 0;
        let _ = InitializeProcThreadAttributeList(LPPROC_THREAD_ATTRIBUTE_LIST::default(), 1, 0, &mut size);

        let words = size.div_ceil(std::mem::size_of::<usize>());
        let mut list = Self {
            buffer: vec![0usize; words],
            initialized: false,
        };

        InitializeProcThreadAttributeList(list.as_ptr(), 1, 0, &mut size)?;
        list.initialized = true;

        UpdateProcThreadAttribute(
            list.as_ptr(),
            0,
            PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE,
            Some(hpc.0 as *const c_void),
            std::mem::size_of::<HPCON>(),
            None,
            None,
        )?;
        Ok(list)
    }

    fn as_ptr(&mut self) -> LPPROC_THREAD_ATTRIBUTE_LIST {
        LPPROC_THREAD_ATTRIBUTE_LIST(self.buffer.as_mut_ptr() as *mut c_void)
    }
}

impl Drop for AttributeList {
    fn drop(&mut self) {
        if self.initialized {
            unsafe { DeleteProcThreadAttributeList(self.as_ptr()) };
        }
    }
}

pub(super) fn launch(
    command: &CommandLine,
    working_directory: Option<&Path>,
    environment: Option<&EnvironmentBlock>,
    device: &mut PseudoConsole,
) -> Result<ChildProcess> {
    unsafe {
        let mut attributes = AttributeList::with_pseudo_console(device.hpc)
            .map_err(|e| PtyError::launch(command, win32_error(e)))?;

        let mut startup_info = STARTUPINFOEXW {
            StartupInfo: std::mem::zeroed(),
            lpAttributeList: attributes.as_ptr(),
        };
        startup_info.StartupInfo.cb = std::mem::size_of::<STARTUPINFOEXW>() as u32;

        let mut cmd_wide = wide(OsStr::new(&command.to_windows_command_line()));
        let cwd_wide = working_directory.map(|dir| wide(dir.as_os_str()));
        let env_block = environment.map(EnvironmentBlock::to_wide);

        let mut process_info = PROCESS_INFORMATION::default();
        CreateProcessW(
            PCWSTR::null(),
            PWSTR(cmd_wide.as_mut_ptr()),
            None,
            None,
            false,
            EXTENDED_STARTUPINFO_PRESENT | CREATE_UNICODE_ENVIRONMENT,
            env_block.as_ref().map(|block| block.as_ptr() as *const c_void),
            cwd_wide
                .as_ref()
                .map_or(PCWSTR::null(), |dir| PCWSTR(dir.as_ptr())),
            &startup_info.StartupInfo,
            &mut process_info,
        )
        .map_err(|e| PtyError::launch(command, win32_error(e)))?;

        // Only the process handle is kept.
        let _ = CloseHandle(process_info.hThread);

        debug!(pid = process_info.dwProcessId, command = %command, "launched child on pseudo console");

        Ok(ChildProcess {
            process: OwnedHandle::from_raw_handle(process_info.hProcess.0),
            pid: process_info.dwProcessId,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conpty_launch() {
        let mut alloc = allocate(TerminalSize::new(80, 24).unwrap()).unwrap();
        let cmd = CommandLine::new("cmd.exe").args(["/c", "echo", "hello"]);
        let child = launch(&cmd, None, None, &mut alloc.device);
        assert!(child.is_ok());
    }

    #[test]
    fn test_launch_invalid_directory_fails() {
        let mut alloc = allocate(TerminalSize::default()).unwrap();
        let cmd = CommandLine::new("cmd.exe");
        let dir = Path::new(r"C:\definitely\not\a\directory");
        assert!(matches!(
            launch(&cmd, Some(dir), None, &mut alloc.device),
            Err(PtyError::Launch { .. })
        ));
    }
}
