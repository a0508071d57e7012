//! The restricted elevated helper and its client side.
//!
//! Line-delimited JSON over a Unix domain socket (Windows: a named pipe).
//! The helper accepts exactly two operations, `ping` and `apply` with a
//! verb from the closed set, and answers with per-path outcomes. Requests
//! carrying anything else are answered with an error and dropped.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};

use super::{ops, PathOutcome, Verb};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum HelperRequest {
    Ping,
    Apply { verb: Verb, paths: Vec<PathBuf> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelperResponse {
    pub ok: bool,
    #[serde(default)]
    pub results: Vec<PathOutcome>,
    #[serde(default)]
    pub error: Option<String>,
}

impl HelperResponse {
    fn pong() -> Self {
        Self {
            ok: true,
            results: vec![],
            error: None,
        }
    }

    fn from_results(results: Vec<PathOutcome>) -> Self {
        Self {
            ok: results.iter().all(|r| r.ok),
            results,
            error: None,
        }
    }

    fn failure(message: impl std::fmt::Display) -> Self {
        Self {
            ok: false,
            results: vec![],
            error: Some(message.to_string()),
        }
    }
}

/// Run the helper daemon until the process is terminated. Must be started
/// with the privileges the verbs require; refuses to serve otherwise so a
/// misconfigured launch fails loudly instead of protecting nothing.
pub async fn serve(socket_path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        if unsafe { libc::geteuid() } != 0 {
            return Err(anyhow!("elevated helper must run as root"));
        }
        serve_unix(socket_path).await
    }
    #[cfg(windows)]
    {
        serve_pipe(socket_path).await
    }
}

#[cfg(unix)]
async fn serve_unix(socket_path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    use tokio::net::UnixListener;

    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create socket dir {}", parent.display()))?;
    }
    if socket_path.exists() {
        let _ = std::fs::remove_file(socket_path);
    }
    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("bind helper socket {}", socket_path.display()))?;
    // The desktop session user must reach the root-owned socket.
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o666))?;
    info!(socket = %socket_path.display(), "elevated helper listening");

    loop {
        let (stream, _addr) = listener.accept().await?;
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream).await {
                error!("helper connection error: {e}");
            }
        });
    }
}

#[cfg(windows)]
async fn serve_pipe(pipe_path: &Path) -> Result<()> {
    use tokio::net::windows::named_pipe::ServerOptions;

    let name = pipe_path.to_string_lossy().to_string();
    info!(pipe = %name, "elevated helper listening");
    loop {
        let server = ServerOptions::new().create(&name)?;
        server.connect().await?;
        tokio::spawn(async move {
            if let Err(e) = handle_connection(server).await {
                error!("helper connection error: {e}");
            }
        });
    }
}

async fn handle_connection<S>(stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(());
        }
        let response = match serde_json::from_str::<HelperRequest>(line.trim_end()) {
            Ok(HelperRequest::Ping) => HelperResponse::pong(),
            Ok(HelperRequest::Apply { verb, paths }) => {
                info!(verb = verb.as_str(), count = paths.len(), "helper applying verb");
                HelperResponse::from_results(ops::apply_verb(verb, &paths))
            }
            Err(e) => {
                warn!("helper rejected malformed request: {e}");
                HelperResponse::failure(format!("malformed request: {e}"))
            }
        };
        writer
            .write_all(serde_json::to_string(&response)?.as_bytes())
            .await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
}

// ── client side ─────────────────────────────────────────────────────────────

/// Send one request and read one response over a fresh connection.
pub async fn request(socket_path: &Path, request: &HelperRequest) -> Result<HelperResponse> {
    let payload = serde_json::to_string(request)?;
    let raw = exchange(socket_path, &payload).await?;
    let response: HelperResponse =
        serde_json::from_str(raw.trim_end()).context("parse helper response")?;
    if let Some(err) = &response.error {
        return Err(anyhow!("helper error: {err}"));
    }
    Ok(response)
}

/// Whether a live helper answers on the channel.
pub async fn ping(socket_path: &Path) -> bool {
    matches!(
        tokio::time::timeout(
            std::time::Duration::from_millis(500),
            request(socket_path, &HelperRequest::Ping),
        )
        .await,
        Ok(Ok(response)) if response.ok
    )
}

#[cfg(unix)]
async fn exchange(socket_path: &Path, payload: &str) -> Result<String> {
    use tokio::net::UnixStream;

    let stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("connect helper socket {}", socket_path.display()))?;
    exchange_on(stream, payload).await
}

#[cfg(windows)]
async fn exchange(pipe_path: &Path, payload: &str) -> Result<String> {
    use tokio::net::windows::named_pipe::ClientOptions;

    let name = pipe_path.to_string_lossy().to_string();
    let client = ClientOptions::new()
        .open(&name)
        .with_context(|| format!("open helper pipe {name}"))?;
    exchange_on(client, payload).await
}

async fn exchange_on<S>(stream: S, payload: &str) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    writer.write_all(payload.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(anyhow!("helper closed the connection"));
    }
    Ok(line)
}
