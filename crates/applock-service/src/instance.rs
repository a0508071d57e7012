//! OS-level mutual exclusion so exactly one monitor runs per machine.
//!
//! Unix holds `flock(LOCK_EX)` on a lock file; Windows holds a named mutex.
//! Both are released by the kernel on any process exit, including abnormal
//! termination, so no cleanup path is required.

use applock_core::error::LockError;
use std::path::Path;
use tracing::info;

#[cfg(unix)]
pub struct InstanceLease {
    _file: std::fs::File,
}

#[cfg(windows)]
pub struct InstanceLease {
    handle: windows_sys::Win32::Foundation::HANDLE,
}

#[cfg(windows)]
unsafe impl Send for InstanceLease {}

#[cfg(windows)]
impl Drop for InstanceLease {
    fn drop(&mut self) {
        unsafe {
            windows_sys::Win32::Foundation::CloseHandle(self.handle);
        }
    }
}

#[cfg(windows)]
const MUTEX_NAME: &str = "Global\\ApplockMonitor";

#[cfg(unix)]
pub fn acquire(lock_path: &Path) -> Result<InstanceLease, LockError> {
    use std::os::unix::io::AsRawFd;

    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| LockError::file_op(lock_path, e))?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(lock_path)
        .map_err(|e| LockError::file_op(lock_path, e))?;
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return Err(LockError::AlreadyRunning);
        }
        return Err(LockError::file_op(lock_path, err));
    }
    info!(path = %lock_path.display(), "single-instance lease acquired");
    Ok(InstanceLease { _file: file })
}

#[cfg(windows)]
pub fn acquire(_lock_path: &Path) -> Result<InstanceLease, LockError> {
    use windows_sys::Win32::Foundation::{ERROR_ALREADY_EXISTS, GetLastError};
    use windows_sys::Win32::System::Threading::CreateMutexW;

    let name: Vec<u16> = MUTEX_NAME.encode_utf16().chain(Some(0)).collect();
    let handle = unsafe { CreateMutexW(std::ptr::null(), 1, name.as_ptr()) };
    let last = unsafe { GetLastError() };
    if handle == 0 {
        return Err(LockError::file_op(
            _lock_path,
            std::io::Error::last_os_error(),
        ));
    }
    if last == ERROR_ALREADY_EXISTS {
        unsafe { windows_sys::Win32::Foundation::CloseHandle(handle) };
        return Err(LockError::AlreadyRunning);
    }
    info!("single-instance lease acquired (named mutex)");
    Ok(InstanceLease { handle })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    #[cfg(unix)]
    fn second_acquire_fails_while_lease_held() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("applock.lock");
        let lease = acquire(&path).unwrap();
        assert!(matches!(acquire(&path), Err(LockError::AlreadyRunning)));
        drop(lease);
        acquire(&path).unwrap();
    }
}
