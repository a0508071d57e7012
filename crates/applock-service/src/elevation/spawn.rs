//! PolicyKit-backed acquisition paths (Unix).
//!
//! Preferred: launch the elevated helper once per login session via `pkexec`
//! and keep the socket as the cached channel. Fallback: one `pkexec` per
//! privileged call with the `apply` subcommand, which prints per-path
//! outcomes as JSON on stdout.

use applock_core::error::LockError;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use super::{helper, PathOutcome, Verb};

/// pkexec exit codes for a dismissed or failed authorization dialog.
const PKEXEC_DISMISSED: i32 = 126;
const PKEXEC_NOT_AUTHORIZED: i32 = 127;

/// How long the user gets to answer the session authorization prompt.
const SESSION_PROMPT_TIMEOUT: Duration = Duration::from_secs(90);

pub async fn per_call_available() -> bool {
    Command::new("pkexec")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Launch the session helper as root and wait until it answers pings or the
/// authorization fails.
pub async fn establish_session(exe: &Path, socket: &Path) -> Result<(), LockError> {
    let mut child = Command::new("pkexec")
        .arg(exe)
        .arg("helper")
        .arg("--socket")
        .arg(socket)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LockError::ElevationUnavailable
            } else {
                LockError::ElevationDenied(e.to_string())
            }
        })?;

    let deadline = tokio::time::Instant::now() + SESSION_PROMPT_TIMEOUT;
    loop {
        if helper::ping(socket).await {
            info!(socket = %socket.display(), "session helper is up");
            return Ok(());
        }
        // The prompt may still be open; a finished child means it won't
        // come up anymore.
        if let Ok(Some(status)) = child.try_wait() {
            return Err(map_pkexec_status(status));
        }
        if tokio::time::Instant::now() >= deadline {
            let _ = child.start_kill();
            return Err(LockError::ElevationDenied(
                "authorization prompt timed out".to_string(),
            ));
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

/// One elevation prompt for this call only: run `apply` through pkexec and
/// parse the per-path outcomes it prints.
pub async fn invoke_per_call(
    exe: &Path,
    verb: Verb,
    paths: &[PathBuf],
) -> Result<Vec<PathOutcome>, LockError> {
    let mut command = Command::new("pkexec");
    command.arg(exe).arg("apply").arg("--verb").arg(verb.as_str());
    for path in paths {
        command.arg(path);
    }
    let output = command
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LockError::ElevationUnavailable
            } else {
                LockError::ElevationDenied(e.to_string())
            }
        })?;

    if !output.status.success() {
        // `apply` exits non-zero when any path failed, but still prints the
        // outcome list; only treat missing output as a hard failure.
        if output.stdout.is_empty() {
            return Err(map_pkexec_status(output.status));
        }
    }
    parse_outcomes(&output.stdout)
}

fn parse_outcomes(stdout: &[u8]) -> Result<Vec<PathOutcome>, LockError> {
    serde_json::from_slice(stdout)
        .map_err(|e| LockError::ElevationDenied(format!("unparsable apply output: {e}")))
}

fn map_pkexec_status(status: std::process::ExitStatus) -> LockError {
    match status.code() {
        Some(PKEXEC_DISMISSED) => {
            debug!("authorization dialog dismissed");
            LockError::ElevationDenied("authorization dismissed".to_string())
        }
        Some(PKEXEC_NOT_AUTHORIZED) => {
            LockError::ElevationDenied("not authorized".to_string())
        }
        Some(code) => LockError::ElevationDenied(format!("pkexec exited with {code}")),
        None => LockError::ElevationDenied("pkexec terminated by signal".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_parsing() {
        let json = r#"[{"path":"/etc/a.conf","ok":true},{"path":"/etc/b.conf","ok":false,"detail":"denied"}]"#;
        let outcomes = parse_outcomes(json.as_bytes()).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].ok);
        assert!(!outcomes[1].ok);
    }

    #[test]
    fn garbage_output_is_denied() {
        assert!(matches!(
            parse_outcomes(b"not json"),
            Err(LockError::ElevationDenied(_))
        ));
    }
}
