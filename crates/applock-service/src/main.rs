use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use applock_core::error::LockError;
use applock_core::paths;
use applock_core::vault::CredentialVault;

use applock_service::elevation::{helper, ops, Elevator, PrivilegedOps, Verb};
use applock_service::instance;
use applock_service::monitor::scan::{SystemControl, SystemScanner};
use applock_service::monitor::{AuthAnswer, MonitorEvent, ProcessMonitor};
use applock_service::protection::backup::BackupStore;
use applock_service::protection::{watcher, FileProtectionGuard};
use applock_service::session::{self, CrashJournal};

#[derive(Parser, Debug)]
#[command(author, version, about = "Applock enforcement service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize a new encrypted vault
    Init {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Run the monitor and file-protection service
    Run {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Run the elevated helper daemon (started via the elevation layer)
    #[command(hide = true)]
    Helper {
        #[arg(long)]
        socket: Option<PathBuf>,
    },
    /// Apply one privileged verb and print per-path outcomes (per-call
    /// elevation fallback)
    #[command(hide = true)]
    Apply {
        #[arg(long)]
        verb: String,
        paths: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Init { data_dir } => init_command(data_dir).await,
        Commands::Run { data_dir } => run_command(data_dir).await,
        Commands::Helper { socket } => {
            let socket = socket.unwrap_or_else(paths::helper_socket_path);
            helper::serve(&socket).await
        }
        Commands::Apply { verb, paths } => apply_command(&verb, paths),
    }
}

async fn init_command(data_dir_override: Option<PathBuf>) -> Result<()> {
    let data = data_dir_override.unwrap_or(paths::data_dir()?);
    std::fs::create_dir_all(&data)?;
    std::fs::create_dir_all(data.join("backups"))?;
    let vault_path = data.join("vault.dat");
    let backup_path = data.join("backups").join("vault.dat.bak");
    if CredentialVault::is_initialized(&vault_path) {
        return Err(anyhow!("vault already exists at {}", vault_path.display()));
    }
    let password = prompt_password_twice("Create master password: ")?;
    let (_vault, codes) = CredentialVault::create(&vault_path, &backup_path, &password)?;
    println!("Vault created at {}", vault_path.display());
    println!();
    println!("Recovery codes (write these down, shown exactly once):");
    for code in codes {
        println!("  {code}");
    }
    Ok(())
}

async fn run_command(data_dir_override: Option<PathBuf>) -> Result<()> {
    let data = data_dir_override.unwrap_or(paths::data_dir()?);
    std::fs::create_dir_all(&data)?;
    let vault_path = data.join("vault.dat");
    let backup_dir = data.join("backups");
    let backup_path = backup_dir.join("vault.dat.bak");
    if !CredentialVault::is_initialized(&vault_path) {
        return Err(anyhow!("vault missing; run init first"));
    }

    // One monitor per machine. Surface the existing instance instead of
    // racing it.
    let _lease = match instance::acquire(&data.join("applock.lock")) {
        Ok(lease) => lease,
        Err(LockError::AlreadyRunning) => {
            return Err(anyhow!("another monitor instance is already running"));
        }
        Err(e) => return Err(e.into()),
    };

    let crash_journal = CrashJournal::new(data.join("crash-journal.json"));
    let start_count = crash_journal.record_start()?;
    if start_count >= 3 {
        warn!(starts_in_window = start_count, "service is restarting rapidly");
    }

    let mut vault = CredentialVault::open(&vault_path, &backup_path)?;
    let password = zeroize::Zeroizing::new(prompt_password_once("Master password: ")?);
    vault
        .verify(&password)
        .map_err(|_| anyhow!("authentication failed"))?;
    drop(password);
    let registry = vault.unlock()?;
    registry.settings.validate()?;
    let settings = registry.settings.clone();
    let signing_key = registry.manifest_signing_key()?;

    let elevator: Arc<dyn PrivilegedOps> = Arc::new(Elevator::with_default_paths()?);

    // Detect a crashed predecessor before locking anything down again.
    let marker_path = data.join("session.json");
    session::recover_unclean_shutdown(&marker_path, &elevator).await?;

    let store = BackupStore::load_or_create(&backup_dir, signing_key)?;
    let guard = Arc::new(FileProtectionGuard::new(store, elevator.clone()));

    let (watcher_shutdown_tx, watcher_shutdown_rx) = watch::channel(false);
    let (mut protection_watcher, watcher_task) = watcher::spawn(
        guard.clone(),
        Duration::from_secs(settings.audit_interval_secs),
        watcher_shutdown_rx,
    )?;

    let protect_paths: Vec<PathBuf> = settings.protected_paths.iter().map(PathBuf::from).collect();
    let outcomes = guard.protect(&protect_paths).await;
    for outcome in &outcomes {
        if !outcome.ok {
            error!(
                path = %outcome.path.display(),
                detail = ?outcome.detail,
                "file could not be protected"
            );
        } else if outcome.degraded {
            warn!(
                path = %outcome.path.display(),
                "protection is degraded (permissions only, no immutability)"
            );
        }
    }
    for path in guard.protected_paths() {
        protection_watcher.watch(&path)?;
    }
    session::write_marker(&marker_path, &guard.protected_paths())?;

    // While the monitor runs, the usual bypass tools stay disabled.
    #[cfg(windows)]
    if let Err(e) = elevator.invoke(Verb::DisableTools, &[]).await {
        warn!(error = %e, "could not disable system tools");
    }

    // Monitor wiring: the vault answers password checks, the console stands
    // in for the UI on the auth channel.
    let vault = Arc::new(Mutex::new(vault));
    let registry = Arc::new(Mutex::new(registry));
    let verifier = {
        let vault = vault.clone();
        Arc::new(move |candidate: &str| vault.lock().verify(candidate).is_ok())
            as applock_service::monitor::Verifier
    };

    let (auth_tx, mut auth_rx) = mpsc::channel::<applock_service::monitor::AuthRequest>(16);
    let (event_tx, mut event_rx) = mpsc::channel(256);

    let prompt_task = tokio::spawn(async move {
        while let Some(request) = auth_rx.recv().await {
            let prompt = format!(
                "Password required to unlock {} (attempt {}/{}): ",
                request.app_name, request.attempt, request.max_attempts
            );
            let answer = tokio::task::spawn_blocking(move || rpassword::prompt_password(prompt))
                .await;
            let answer = match answer {
                Ok(Ok(password)) if !password.is_empty() => AuthAnswer::Submit(password),
                _ => AuthAnswer::Cancel,
            };
            let _ = request.reply.send(answer);
        }
    });

    let event_task = {
        let vault = vault.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                match event {
                    MonitorEvent::Unlocked { app_id, at } => {
                        let mut registry = registry.lock();
                        registry.record_unlock(app_id, at);
                        if let Err(e) = vault.lock().save_registry(&mut registry) {
                            warn!(error = %e, "could not persist unlock counters");
                        }
                    }
                    MonitorEvent::StateChanged {
                        app_name, state, ..
                    } => {
                        info!(app = %app_name, state = ?state, "lock state changed");
                    }
                }
            }
        })
    };

    let monitor = ProcessMonitor::new(
        Arc::new(SystemScanner),
        Arc::new(SystemControl),
        verifier,
        auth_tx,
        event_tx,
        settings,
    );
    let monitor_handle = monitor.start(registry.lock().apps.clone());

    info!("service started");
    signal::ctrl_c().await?;
    info!("service stopping");

    // Scoped release: stop polling, lift every protection, clear the marker.
    monitor_handle.stop().await;
    let _ = watcher_shutdown_tx.send(true);
    let _ = watcher_task.await;
    let outcomes = guard.unprotect_all().await;
    for outcome in outcomes.iter().filter(|o| !o.ok) {
        error!(
            path = %outcome.path.display(),
            detail = ?outcome.detail,
            "file could not be unprotected; it may stay locked"
        );
    }
    #[cfg(windows)]
    if let Err(e) = elevator.invoke(Verb::EnableTools, &[]).await {
        error!(error = %e, "could not re-enable system tools");
    }
    session::clear_marker(&marker_path);
    prompt_task.abort();
    event_task.abort();
    Ok(())
}

fn apply_command(verb: &str, paths: Vec<PathBuf>) -> Result<()> {
    let verb: Verb = verb.parse()?;
    let outcomes = ops::apply_verb(verb, &paths);
    println!("{}", serde_json::to_string(&outcomes)?);
    if outcomes.iter().all(|o| o.ok) {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

fn prompt_password_once(prompt: &str) -> Result<String> {
    if let Ok(pw) = std::env::var("APPLOCK_VAULT_PASSWORD") {
        if !pw.is_empty() {
            return Ok(pw);
        }
    }
    let pw = rpassword::prompt_password(prompt).map_err(|e| anyhow!("password prompt: {e}"))?;
    if pw.is_empty() {
        return Err(anyhow!("empty password"));
    }
    Ok(pw)
}

fn prompt_password_twice(prompt: &str) -> Result<String> {
    if let Ok(pw) = std::env::var("APPLOCK_VAULT_PASSWORD") {
        if !pw.is_empty() {
            return Ok(pw);
        }
    }
    let first = rpassword::prompt_password(prompt).map_err(|e| anyhow!("password prompt: {e}"))?;
    if first.len() < 12 {
        return Err(anyhow!("password too short; minimum 12 characters"));
    }
    let second = rpassword::prompt_password("Confirm password: ")
        .map_err(|e| anyhow!("password prompt: {e}"))?;
    if first != second {
        return Err(anyhow!("passwords do not match"));
    }
    Ok(first)
}
