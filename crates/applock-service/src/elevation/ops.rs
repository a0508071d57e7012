//! The privileged operations themselves, shared by the session helper, the
//! per-call fallback and the already-elevated direct path.
//!
//! Linux immutability uses the `FS_IMMUTABLE_FL` inode flag; Windows uses
//! READONLY|HIDDEN|SYSTEM attributes. Tool lockdown toggles Windows policy
//! registry values and is reported unsupported elsewhere rather than faked.

use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::{tool_targets, PathOutcome, Verb};

/// Whether this process already runs with the privileges the verbs need.
pub fn is_elevated() -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::geteuid() == 0 }
    }
    #[cfg(windows)]
    {
        // Attribute changes on user-owned files need no token elevation;
        // policy registry writes target HKCU. Direct application works.
        true
    }
}

/// Apply a verb to every path independently; one result per path.
pub fn apply_verb(verb: Verb, paths: &[PathBuf]) -> Vec<PathOutcome> {
    match verb {
        Verb::Protect => paths.iter().map(|p| apply_immutable(p, true)).collect(),
        Verb::Unprotect => paths.iter().map(|p| apply_immutable(p, false)).collect(),
        Verb::DisableTools => tool_targets(paths)
            .iter()
            .map(|t| apply_tool_lockdown(t, true))
            .collect(),
        Verb::EnableTools => tool_targets(paths)
            .iter()
            .map(|t| apply_tool_lockdown(t, false))
            .collect(),
    }
}

fn apply_immutable(path: &Path, on: bool) -> PathOutcome {
    if !path.is_absolute() {
        return PathOutcome::failed(path, "path must be absolute");
    }
    if !path.exists() {
        // Clearing protection on an already-deleted file is a no-op, not an
        // error; the restore path handles recreation.
        if !on {
            return PathOutcome::ok(path);
        }
        return PathOutcome::failed(path, "file not found");
    }
    match set_immutable(path, on) {
        Ok(()) => {
            info!(path = %path.display(), immutable = on, "immutability updated");
            PathOutcome::ok(path)
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "immutability change failed");
            PathOutcome::failed(path, err)
        }
    }
}

#[cfg(unix)]
fn set_immutable(path: &Path, on: bool) -> anyhow::Result<()> {
    use std::os::unix::io::AsRawFd;

    let file = std::fs::OpenOptions::new().read(true).open(path)?;
    let fd = file.as_raw_fd();
    let mut flags: libc::c_long = 0;
    let rc = unsafe { libc::ioctl(fd, libc::FS_IOC_GETFLAGS, &mut flags) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    // `FS_IMMUTABLE_FL` is a fixed Linux uapi constant (<linux/fs.h>) that the
    // pinned libc version does not re-export; supply it directly.
    const FS_IMMUTABLE_FL: libc::c_long = 0x0000_0010;
    let immutable = FS_IMMUTABLE_FL;
    let updated = if on { flags | immutable } else { flags & !immutable };
    if updated == flags {
        return Ok(());
    }
    let rc = unsafe { libc::ioctl(fd, libc::FS_IOC_SETFLAGS, &updated) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(windows)]
fn set_immutable(path: &Path, on: bool) -> anyhow::Result<()> {
    use std::os::windows::ffi::OsStrExt;
    use windows_sys::Win32::Storage::FileSystem::{
        SetFileAttributesW, FILE_ATTRIBUTE_HIDDEN, FILE_ATTRIBUTE_NORMAL,
        FILE_ATTRIBUTE_READONLY, FILE_ATTRIBUTE_SYSTEM,
    };

    let wide: Vec<u16> = path.as_os_str().encode_wide().chain(Some(0)).collect();
    let attributes = if on {
        FILE_ATTRIBUTE_READONLY | FILE_ATTRIBUTE_HIDDEN | FILE_ATTRIBUTE_SYSTEM
    } else {
        FILE_ATTRIBUTE_NORMAL
    };
    let rc = unsafe { SetFileAttributesW(wide.as_ptr(), attributes) };
    if rc == 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(windows)]
fn apply_tool_lockdown(tool: &Path, on: bool) -> PathOutcome {
    let tool_name = tool.to_string_lossy().to_string();
    let (key_path, value_name) = match tool_name.as_str() {
        "taskmgr" => (
            r"Software\Microsoft\Windows\CurrentVersion\Policies\System",
            "DisableTaskMgr",
        ),
        "regedit" => (
            r"Software\Microsoft\Windows\CurrentVersion\Policies\System",
            "DisableRegistryTools",
        ),
        "cmd" => (r"Software\Policies\Microsoft\Windows\System", "DisableCMD"),
        other => return PathOutcome::failed(tool, format!("unknown tool: {other}")),
    };
    match set_policy_value(key_path, value_name, on) {
        Ok(()) => {
            info!(tool = %tool_name, disabled = on, "tool policy updated");
            PathOutcome::ok(tool)
        }
        Err(err) => PathOutcome::failed(tool, err),
    }
}

#[cfg(windows)]
fn set_policy_value(key_path: &str, value_name: &str, on: bool) -> anyhow::Result<()> {
    use windows_sys::Win32::System::Registry::{
        RegCloseKey, RegCreateKeyExW, RegDeleteValueW, RegSetValueExW, HKEY,
        HKEY_CURRENT_USER, KEY_SET_VALUE, REG_DWORD, REG_OPTION_NON_VOLATILE,
    };

    let wide_key: Vec<u16> = key_path.encode_utf16().chain(Some(0)).collect();
    let wide_value: Vec<u16> = value_name.encode_utf16().chain(Some(0)).collect();
    let mut key: HKEY = 0;
    let rc = unsafe {
        RegCreateKeyExW(
            HKEY_CURRENT_USER,
            wide_key.as_ptr(),
            0,
            std::ptr::null(),
            REG_OPTION_NON_VOLATILE,
            KEY_SET_VALUE,
            std::ptr::null(),
            &mut key,
            std::ptr::null_mut(),
        )
    };
    if rc != 0 {
        return Err(anyhow::anyhow!("open policy key failed: {rc}"));
    }
    let rc = if on {
        let data: u32 = 1;
        unsafe {
            RegSetValueExW(
                key,
                wide_value.as_ptr(),
                0,
                REG_DWORD,
                &data as *const u32 as *const u8,
                std::mem::size_of::<u32>() as u32,
            )
        }
    } else {
        unsafe { RegDeleteValueW(key, wide_value.as_ptr()) }
    };
    unsafe { RegCloseKey(key) };
    if rc != 0 && on {
        return Err(anyhow::anyhow!("set policy value failed: {rc}"));
    }
    Ok(())
}

#[cfg(not(windows))]
fn apply_tool_lockdown(tool: &Path, _on: bool) -> PathOutcome {
    PathOutcome::failed(tool, "tool lockdown is not supported on this platform")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_rejected() {
        let outcomes = apply_verb(Verb::Protect, &[PathBuf::from("relative.txt")]);
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].ok);
    }

    #[cfg(unix)]
    #[test]
    fn unprotect_missing_file_is_noop() {
        let outcomes = apply_verb(Verb::Unprotect, &[PathBuf::from("/nonexistent/applock-test")]);
        assert!(outcomes[0].ok);
    }

    #[cfg(not(windows))]
    #[test]
    fn tool_lockdown_reports_unsupported() {
        let outcomes = apply_verb(Verb::DisableTools, &[]);
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| !o.ok));
    }
}
