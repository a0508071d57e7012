use directories::ProjectDirs;
use std::path::PathBuf;

pub const APP_QUALIFIER: &str = "io";
pub const APP_ORG: &str = "applock";
pub const APP_NAME: &str = "applock";

pub fn data_dir() -> anyhow::Result<PathBuf> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

/// Secondary location holding the vault backup copy and one backup artifact
/// per protected file.
pub fn backup_dir() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("backups"))
}

pub fn log_dir() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("logs"))
}

pub fn vault_path() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("vault.dat"))
}

pub fn vault_backup_path() -> anyhow::Result<PathBuf> {
    Ok(backup_dir()?.join("vault.dat.bak"))
}

pub fn instance_lock_path() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("applock.lock"))
}

pub fn session_marker_path() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("session.json"))
}

pub fn crash_journal_path() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("crash-journal.json"))
}

pub fn helper_socket_path() -> PathBuf {
    #[cfg(unix)]
    {
        PathBuf::from("/run/applock/helper.sock")
    }
    #[cfg(windows)]
    {
        PathBuf::from(r"\\.\pipe\ApplockElevatedHelper")
    }
}
