//! One-pass process enumeration and process control.
//!
//! Both sides sit behind traits so the state machine can be driven by fakes
//! in tests. Linux reads `/proc` directly; Windows uses a Toolhelp snapshot.

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub cmdline: String,
}

pub trait ProcessScanner: Send + Sync + 'static {
    /// Enumerate running processes. Called once per poll cycle; every
    /// registered application is matched against this single scan.
    fn scan(&self) -> Vec<ProcessInfo>;
}

pub trait ProcessControl: Send + Sync + 'static {
    /// Block the process pending authentication.
    fn suspend(&self, pid: u32) -> Result<()>;
    /// Let a suspended process continue after a successful unlock.
    fn resume(&self, pid: u32) -> Result<()>;
    fn kill(&self, pid: u32) -> Result<()>;
}

pub struct SystemScanner;

#[cfg(unix)]
impl ProcessScanner for SystemScanner {
    fn scan(&self) -> Vec<ProcessInfo> {
        let mut processes = Vec::new();
        let Ok(entries) = std::fs::read_dir("/proc") else {
            return processes;
        };
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Ok(pid) = file_name.to_string_lossy().parse::<u32>() else {
                continue;
            };
            if is_zombie(pid) {
                continue;
            }
            let name = std::fs::read_to_string(format!("/proc/{pid}/comm"))
                .map(|s| s.trim().to_string())
                .unwrap_or_default();
            let cmdline = std::fs::read(format!("/proc/{pid}/cmdline"))
                .map(|bytes| {
                    bytes
                        .split(|b| *b == 0)
                        .filter(|part| !part.is_empty())
                        .map(|part| String::from_utf8_lossy(part).to_string())
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .unwrap_or_default();
            if name.is_empty() && cmdline.is_empty() {
                continue;
            }
            processes.push(ProcessInfo { pid, name, cmdline });
        }
        processes
    }
}

#[cfg(unix)]
fn is_zombie(pid: u32) -> bool {
    // State is the field after the parenthesized comm; comm may itself
    // contain parentheses, so split at the last ')'.
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    stat.rfind(')')
        .and_then(|idx| stat[idx + 1..].split_whitespace().next())
        .map(|state| state == "Z")
        .unwrap_or(false)
}

#[cfg(windows)]
impl ProcessScanner for SystemScanner {
    fn scan(&self) -> Vec<ProcessInfo> {
        use windows_sys::Win32::Foundation::{CloseHandle, INVALID_HANDLE_VALUE};
        use windows_sys::Win32::System::Diagnostics::ToolHelp::{
            CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, PROCESSENTRY32W,
            TH32CS_SNAPPROCESS,
        };

        let mut processes = Vec::new();
        let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) };
        if snapshot == INVALID_HANDLE_VALUE {
            return processes;
        }
        let mut entry: PROCESSENTRY32W = unsafe { std::mem::zeroed() };
        entry.dwSize = std::mem::size_of::<PROCESSENTRY32W>() as u32;
        let mut has_next = unsafe { Process32FirstW(snapshot, &mut entry) } != 0;
        while has_next {
            let len = entry
                .szExeFile
                .iter()
                .position(|c| *c == 0)
                .unwrap_or(entry.szExeFile.len());
            let name = String::from_utf16_lossy(&entry.szExeFile[..len]);
            processes.push(ProcessInfo {
                pid: entry.th32ProcessID,
                name,
                cmdline: String::new(),
            });
            has_next = unsafe { Process32NextW(snapshot, &mut entry) } != 0;
        }
        unsafe { CloseHandle(snapshot) };
        processes
    }
}

pub struct SystemControl;

#[cfg(unix)]
impl ProcessControl for SystemControl {
    fn suspend(&self, pid: u32) -> Result<()> {
        signal(pid, libc::SIGSTOP)
    }

    fn resume(&self, pid: u32) -> Result<()> {
        signal(pid, libc::SIGCONT)
    }

    fn kill(&self, pid: u32) -> Result<()> {
        signal(pid, libc::SIGKILL)
    }
}

#[cfg(unix)]
fn signal(pid: u32, sig: libc::c_int) -> Result<()> {
    let rc = unsafe { libc::kill(pid as libc::pid_t, sig) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        // Already gone counts as done for every signal we send.
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(err.into());
    }
    Ok(())
}

#[cfg(windows)]
impl ProcessControl for SystemControl {
    /// Windows has no clean user-mode suspend for a whole process; the
    /// launch is blocked by terminating it, and the unlock lets the next
    /// launch through.
    fn suspend(&self, pid: u32) -> Result<()> {
        self.kill(pid)
    }

    fn resume(&self, _pid: u32) -> Result<()> {
        Ok(())
    }

    fn kill(&self, pid: u32) -> Result<()> {
        use windows_sys::Win32::Foundation::CloseHandle;
        use windows_sys::Win32::System::Threading::{OpenProcess, TerminateProcess, PROCESS_TERMINATE};

        let handle = unsafe { OpenProcess(PROCESS_TERMINATE, 0, pid) };
        if handle == 0 {
            // Already exited.
            return Ok(());
        }
        let rc = unsafe { TerminateProcess(handle, 1) };
        unsafe { CloseHandle(handle) };
        if rc == 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn scan_sees_this_process() {
        let me = std::process::id();
        let scan = SystemScanner.scan();
        assert!(scan.iter().any(|p| p.pid == me));
    }
}
