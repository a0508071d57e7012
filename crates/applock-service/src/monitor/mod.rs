//! The process monitor: detects launches of locked applications, gates them
//! behind the master password, and relocks groups once they exit.
//!
//! One background task enumerates processes once per cycle and drives every
//! application's state machine off that single scan. The only thing that
//! ever waits is the authentication exchange for the one group in
//! `PendingAuth`, and that wait lives in its own task; all other apps keep
//! being evaluated every cycle.
//!
//! State machine per application, rebuilt as `Locked` at every start:
//!
//! ```text
//! Locked --detected launch--> PendingAuth --correct password--> Unlocked
//! PendingAuth --wrong password exhausted | cancel--> Locked (group killed)
//! Unlocked --group empty for N cycles--> Locked
//! ```

pub mod scan;

use applock_core::registry::LockedApplication;
use applock_core::settings::MonitorSettings;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use self::scan::{ProcessControl, ProcessScanner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Locked,
    PendingAuth,
    Unlocked,
}

/// One password prompt for one application group. The UI answers through
/// `reply`; dropping it counts as cancel.
#[derive(Debug)]
pub struct AuthRequest {
    pub app_id: Uuid,
    pub app_name: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub reply: oneshot::Sender<AuthAnswer>,
}

#[derive(Debug)]
pub enum AuthAnswer {
    Submit(String),
    Cancel,
}

/// Outbound notifications for the embedding shell.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    StateChanged {
        app_id: Uuid,
        app_name: String,
        state: LockState,
    },
    Unlocked {
        app_id: Uuid,
        at: DateTime<Utc>,
    },
}

/// Password check injected by the service; wired to the credential vault.
pub type Verifier = Arc<dyn Fn(&str) -> bool + Send + Sync>;

struct AppWatch {
    app: LockedApplication,
    state: LockState,
    pids: HashSet<u32>,
    idle_cycles: u32,
}

struct Inner {
    scanner: Arc<dyn ProcessScanner>,
    control: Arc<dyn ProcessControl>,
    verifier: Verifier,
    auth_tx: mpsc::Sender<AuthRequest>,
    event_tx: mpsc::Sender<MonitorEvent>,
    settings: MonitorSettings,
    watches: Mutex<HashMap<Uuid, AppWatch>>,
}

pub struct ProcessMonitor {
    inner: Arc<Inner>,
}

/// Owner handle for a running monitor; stopping consumes it.
pub struct MonitorHandle {
    inner: Arc<Inner>,
    shutdown_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl MonitorHandle {
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
        info!("process monitor stopped");
    }

    /// Current lock state per application id.
    pub fn states(&self) -> HashMap<Uuid, LockState> {
        self.inner
            .watches
            .lock()
            .iter()
            .map(|(id, w)| (*id, w.state))
            .collect()
    }
}

impl ProcessMonitor {
    pub fn new(
        scanner: Arc<dyn ProcessScanner>,
        control: Arc<dyn ProcessControl>,
        verifier: Verifier,
        auth_tx: mpsc::Sender<AuthRequest>,
        event_tx: mpsc::Sender<MonitorEvent>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                scanner,
                control,
                verifier,
                auth_tx,
                event_tx,
                settings,
                watches: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Begin polling. Every application starts `Locked` regardless of any
    /// state before the restart.
    pub fn start(self, apps: Vec<LockedApplication>) -> MonitorHandle {
        {
            let mut watches = self.inner.watches.lock();
            watches.clear();
            for app in apps {
                watches.insert(
                    app.id,
                    AppWatch {
                        app,
                        state: LockState::Locked,
                        pids: HashSet::new(),
                        idle_cycles: 0,
                    },
                );
            }
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = self.inner.clone();
        let count = inner.watches.lock().len();
        info!(
            apps = count,
            poll_interval_ms = inner.settings.poll_interval_ms,
            "process monitor started"
        );
        let task = tokio::spawn(run_poll_loop(inner, shutdown_rx));
        MonitorHandle {
            inner: self.inner,
            shutdown_tx,
            task,
        }
    }
}

async fn run_poll_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let interval = Duration::from_millis(inner.settings.poll_interval_ms);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }

        // Single scan per cycle; every app is matched against it.
        let scan = inner.scanner.scan();
        let live: HashSet<u32> = scan.iter().map(|p| p.pid).collect();

        let mut to_prompt: Vec<Uuid> = Vec::new();
        let mut events: Vec<MonitorEvent> = Vec::new();
        {
            let mut watches = inner.watches.lock();
            for watch_entry in watches.values_mut() {
                let matched: HashSet<u32> = scan
                    .iter()
                    .filter(|p| watch_entry.app.matches(&p.name, &p.cmdline))
                    .map(|p| p.pid)
                    .collect();
                watch_entry.pids.retain(|pid| live.contains(pid));

                match watch_entry.state {
                    LockState::Locked => {
                        if !matched.is_empty() {
                            for pid in &matched {
                                if let Err(e) = inner.control.suspend(*pid) {
                                    warn!(pid, app = %watch_entry.app.name, error = %e, "suspend failed");
                                }
                            }
                            watch_entry.pids = matched;
                            watch_entry.state = LockState::PendingAuth;
                            to_prompt.push(watch_entry.app.id);
                            events.push(MonitorEvent::StateChanged {
                                app_id: watch_entry.app.id,
                                app_name: watch_entry.app.name.clone(),
                                state: LockState::PendingAuth,
                            });
                        }
                    }
                    LockState::PendingAuth => {
                        // Late arrivals join the group without a second
                        // prompt; they are blocked like the rest.
                        for pid in matched.difference(&watch_entry.pids) {
                            if let Err(e) = inner.control.suspend(*pid) {
                                warn!(pid, app = %watch_entry.app.name, error = %e, "suspend failed");
                            }
                        }
                        watch_entry.pids.extend(matched);
                        if watch_entry.pids.is_empty() {
                            // The whole group died before anyone answered.
                            debug!(app = %watch_entry.app.name, "group exited during authentication");
                            watch_entry.state = LockState::Locked;
                            events.push(MonitorEvent::StateChanged {
                                app_id: watch_entry.app.id,
                                app_name: watch_entry.app.name.clone(),
                                state: LockState::Locked,
                            });
                        }
                    }
                    LockState::Unlocked => {
                        if matched.is_empty() {
                            watch_entry.idle_cycles += 1;
                            if watch_entry.idle_cycles >= inner.settings.relock_after_idle_cycles {
                                info!(app = %watch_entry.app.name, "group exited, relocking");
                                watch_entry.state = LockState::Locked;
                                watch_entry.pids.clear();
                                watch_entry.idle_cycles = 0;
                                events.push(MonitorEvent::StateChanged {
                                    app_id: watch_entry.app.id,
                                    app_name: watch_entry.app.name.clone(),
                                    state: LockState::Locked,
                                });
                            }
                        } else {
                            watch_entry.idle_cycles = 0;
                            watch_entry.pids = matched;
                        }
                    }
                }
            }
        }

        for event in events {
            deliver(&inner.event_tx, event);
        }
        for app_id in to_prompt {
            tokio::spawn(run_auth_flow(inner.clone(), app_id));
        }
    }
}

/// Drive the authentication exchange for one pending group. Lives in its own
/// task so a slow answer never stalls the poll loop.
async fn run_auth_flow(inner: Arc<Inner>, app_id: Uuid) {
    let (app_name, max_attempts) = {
        let watches = inner.watches.lock();
        let Some(w) = watches.get(&app_id) else { return };
        (w.app.name.clone(), inner.settings.max_attempts)
    };

    let mut attempt = 1u32;
    loop {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = AuthRequest {
            app_id,
            app_name: app_name.clone(),
            attempt,
            max_attempts,
            reply: reply_tx,
        };
        if inner.auth_tx.send(request).await.is_err() {
            // No UI listening; keep the app locked.
            break;
        }
        let answer = reply_rx.await;

        // A race may have resolved the episode while the prompt was open.
        let still_pending = {
            let watches = inner.watches.lock();
            watches
                .get(&app_id)
                .map(|w| w.state == LockState::PendingAuth && !w.pids.is_empty())
                .unwrap_or(false)
        };
        if !still_pending {
            debug!(app = %app_name, "authentication abandoned, group no longer pending");
            return;
        }

        match answer {
            Ok(AuthAnswer::Submit(password)) => {
                let verifier = inner.verifier.clone();
                let ok = tokio::task::spawn_blocking(move || verifier(&password))
                    .await
                    .unwrap_or(false);
                if ok {
                    unlock_group(&inner, app_id, &app_name);
                    return;
                }
                warn!(app = %app_name, attempt, "wrong password");
                if attempt >= max_attempts {
                    break;
                }
                attempt += 1;
            }
            Ok(AuthAnswer::Cancel) | Err(_) => break,
        }
    }

    // Retries exhausted, cancelled, or nobody answering: terminate the
    // group and return it to Locked.
    relock_group(&inner, app_id, &app_name);
}

fn unlock_group(inner: &Arc<Inner>, app_id: Uuid, app_name: &str) {
    let now = Utc::now();
    let pids: Vec<u32> = {
        let mut watches = inner.watches.lock();
        let Some(w) = watches.get_mut(&app_id) else { return };
        w.state = LockState::Unlocked;
        w.idle_cycles = 0;
        w.app.unlock_count += 1;
        w.app.last_unlocked_at = Some(now);
        w.pids.iter().copied().collect()
    };
    for pid in pids {
        if let Err(e) = inner.control.resume(pid) {
            warn!(pid, app = %app_name, error = %e, "resume failed");
        }
    }
    info!(app = %app_name, "unlocked");
    deliver(
        &inner.event_tx,
        MonitorEvent::StateChanged {
            app_id,
            app_name: app_name.to_string(),
            state: LockState::Unlocked,
        },
    );
    deliver(&inner.event_tx, MonitorEvent::Unlocked { app_id, at: now });
}

fn relock_group(inner: &Arc<Inner>, app_id: Uuid, app_name: &str) {
    let pids: Vec<u32> = {
        let mut watches = inner.watches.lock();
        let Some(w) = watches.get_mut(&app_id) else { return };
        w.state = LockState::Locked;
        w.pids.drain().collect()
    };
    for pid in pids {
        if let Err(e) = inner.control.kill(pid) {
            warn!(pid, app = %app_name, error = %e, "terminate failed");
        }
    }
    info!(app = %app_name, "authentication failed, group terminated");
    deliver(
        &inner.event_tx,
        MonitorEvent::StateChanged {
            app_id,
            app_name: app_name.to_string(),
            state: LockState::Locked,
        },
    );
}

/// Non-blocking event delivery: a stalled consumer must never stall the
/// monitor.
fn deliver(tx: &mpsc::Sender<MonitorEvent>, event: MonitorEvent) {
    if tx.try_send(event).is_err() {
        debug!("event channel full, notification dropped");
    }
}
