//! Privilege elevation behind one contract, two platform models.
//!
//! The preferred path is a persistent, session-scoped helper process that
//! prompts the user once and then serves every privileged call over a local
//! channel. If that cannot be established, each call pays its own elevation
//! prompt. If no mechanism exists at all, callers get
//! `LockError::ElevationUnavailable` and must degrade.
//!
//! The helper accepts a closed verb set and explicit path lists; there is no
//! way to pass arbitrary command text through this interface.

pub mod helper;
pub mod ops;
#[cfg(unix)]
mod spawn;

use applock_core::error::LockError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// The closed verb set of the elevated helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verb {
    Protect,
    Unprotect,
    DisableTools,
    EnableTools,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Protect => "protect",
            Verb::Unprotect => "unprotect",
            Verb::DisableTools => "disable-tools",
            Verb::EnableTools => "enable-tools",
        }
    }
}

impl FromStr for Verb {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "protect" => Ok(Verb::Protect),
            "unprotect" => Ok(Verb::Unprotect),
            "disable-tools" => Ok(Verb::DisableTools),
            "enable-tools" => Ok(Verb::EnableTools),
            other => Err(anyhow::anyhow!("unknown verb: {other}")),
        }
    }
}

/// Per-path result of one privileged operation. A batch never collapses into
/// a single flag; partial failures stay visible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathOutcome {
    pub path: PathBuf,
    pub ok: bool,
    #[serde(default)]
    pub detail: Option<String>,
}

impl PathOutcome {
    pub fn ok(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ok: true,
            detail: None,
        }
    }

    pub fn failed(path: impl Into<PathBuf>, detail: impl std::fmt::Display) -> Self {
        Self {
            path: path.into(),
            ok: false,
            detail: Some(detail.to_string()),
        }
    }
}

/// Seam between the protection guard and the platform privilege model;
/// tests substitute a fake.
#[async_trait]
pub trait PrivilegedOps: Send + Sync {
    async fn invoke(&self, verb: Verb, paths: &[PathBuf]) -> Result<Vec<PathOutcome>, LockError>;
}

#[derive(Debug, Clone)]
enum Backend {
    /// Already elevated: apply in-process.
    Direct,
    /// Session-scoped helper reachable over the local channel.
    Session,
    /// One elevation prompt per call.
    PerCall,
}

/// Cached elevation state for the process lifetime. Acquisition is lazy and
/// amortized: the backend is probed once and reused; a cancelled prompt
/// fails that call without discarding an established session.
pub struct Elevator {
    exe: PathBuf,
    socket: PathBuf,
    backend: tokio::sync::Mutex<Option<Backend>>,
}

impl Elevator {
    pub fn new(exe: PathBuf, socket: PathBuf) -> Self {
        Self {
            exe,
            socket,
            backend: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_default_paths() -> anyhow::Result<Self> {
        let exe = std::env::current_exe()?;
        Ok(Self::new(exe, applock_core::paths::helper_socket_path()))
    }

    async fn backend(&self) -> Result<Backend, LockError> {
        let mut guard = self.backend.lock().await;
        if let Some(backend) = guard.as_ref() {
            return Ok(backend.clone());
        }
        let backend = self.probe().await?;
        info!(backend = ?backend, "elevation session established");
        *guard = Some(backend.clone());
        Ok(backend)
    }

    #[cfg(unix)]
    async fn probe(&self) -> Result<Backend, LockError> {
        if ops::is_elevated() {
            return Ok(Backend::Direct);
        }
        // A helper from an earlier acquisition in this login session may
        // still be serving.
        if helper::ping(&self.socket).await {
            return Ok(Backend::Session);
        }
        match spawn::establish_session(&self.exe, &self.socket).await {
            Ok(()) => return Ok(Backend::Session),
            Err(err) => {
                debug!(error = %err, "session helper launch failed");
            }
        }
        if spawn::per_call_available().await {
            return Ok(Backend::PerCall);
        }
        Err(LockError::ElevationUnavailable)
    }

    /// Windows file attributes and per-user policy values need no token
    /// elevation, so the direct path always works; an installed elevated
    /// helper pipe is used when present.
    #[cfg(windows)]
    async fn probe(&self) -> Result<Backend, LockError> {
        if helper::ping(&self.socket).await {
            return Ok(Backend::Session);
        }
        Ok(Backend::Direct)
    }

    /// Drop the cached backend; the next call re-acquires.
    pub async fn revoke(&self) {
        *self.backend.lock().await = None;
    }
}

#[async_trait]
impl PrivilegedOps for Elevator {
    async fn invoke(&self, verb: Verb, paths: &[PathBuf]) -> Result<Vec<PathOutcome>, LockError> {
        let backend = self.backend().await?;
        match backend {
            Backend::Direct => Ok(ops::apply_verb(verb, paths)),
            Backend::Session => {
                let request = helper::HelperRequest::Apply {
                    verb,
                    paths: paths.to_vec(),
                };
                match helper::request(&self.socket, &request).await {
                    Ok(response) => Ok(response.results),
                    Err(err) => {
                        // The helper may have died with the login session;
                        // forget it so the next call re-probes.
                        warn!(error = %err, "helper channel failed, revoking cached session");
                        self.revoke().await;
                        Err(LockError::ElevationDenied(err.to_string()))
                    }
                }
            }
            Backend::PerCall => {
                #[cfg(unix)]
                {
                    spawn::invoke_per_call(&self.exe, verb, paths).await
                }
                #[cfg(not(unix))]
                {
                    Err(LockError::ElevationUnavailable)
                }
            }
        }
    }
}

/// Expand an empty tool list to the default lockdown targets.
pub fn tool_targets(paths: &[PathBuf]) -> Vec<PathBuf> {
    if paths.is_empty() {
        ["taskmgr", "regedit", "cmd"]
            .iter()
            .map(PathBuf::from)
            .collect()
    } else {
        paths.to_vec()
    }
}
