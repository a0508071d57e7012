//! Integration tests for the per-application lock state machine, driven by
//! a scripted process table and a scripted authentication channel.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

use applock_core::registry::LockedApplication;
use applock_core::settings::MonitorSettings;
use applock_service::monitor::scan::{ProcessControl, ProcessInfo, ProcessScanner};
use applock_service::monitor::{
    AuthAnswer, AuthRequest, LockState, MonitorEvent, MonitorHandle, ProcessMonitor, Verifier,
};

/// Process table shared between the scanner and the control: killing a pid
/// removes it from the table, like the real thing.
#[derive(Clone)]
struct FakeProcessTable {
    procs: Arc<Mutex<Vec<ProcessInfo>>>,
    suspended: Arc<Mutex<HashSet<u32>>>,
    resumed: Arc<Mutex<Vec<u32>>>,
    killed: Arc<Mutex<Vec<u32>>>,
}

impl FakeProcessTable {
    fn new() -> Self {
        Self {
            procs: Arc::new(Mutex::new(vec![])),
            suspended: Arc::new(Mutex::new(HashSet::new())),
            resumed: Arc::new(Mutex::new(vec![])),
            killed: Arc::new(Mutex::new(vec![])),
        }
    }

    fn launch(&self, pid: u32, name: &str) {
        self.procs.lock().push(ProcessInfo {
            pid,
            name: name.to_string(),
            cmdline: String::new(),
        });
    }

    fn exit(&self, pid: u32) {
        self.procs.lock().retain(|p| p.pid != pid);
    }
}

impl ProcessScanner for FakeProcessTable {
    fn scan(&self) -> Vec<ProcessInfo> {
        self.procs.lock().clone()
    }
}

impl ProcessControl for FakeProcessTable {
    fn suspend(&self, pid: u32) -> anyhow::Result<()> {
        self.suspended.lock().insert(pid);
        Ok(())
    }

    fn resume(&self, pid: u32) -> anyhow::Result<()> {
        self.resumed.lock().push(pid);
        Ok(())
    }

    fn kill(&self, pid: u32) -> anyhow::Result<()> {
        self.killed.lock().push(pid);
        self.exit(pid);
        Ok(())
    }
}

struct Harness {
    table: FakeProcessTable,
    handle: MonitorHandle,
    auth_rx: mpsc::Receiver<AuthRequest>,
    event_rx: mpsc::Receiver<MonitorEvent>,
}

fn settings() -> MonitorSettings {
    MonitorSettings {
        poll_interval_ms: 200,
        audit_interval_secs: 30,
        max_attempts: 3,
        relock_after_idle_cycles: 2,
        protected_paths: vec![],
    }
}

fn start_monitor(apps: Vec<LockedApplication>) -> Harness {
    let table = FakeProcessTable::new();
    let verifier: Verifier = Arc::new(|candidate: &str| candidate == "P1");
    let (auth_tx, auth_rx) = mpsc::channel(16);
    let (event_tx, event_rx) = mpsc::channel(256);
    let monitor = ProcessMonitor::new(
        Arc::new(table.clone()),
        Arc::new(table.clone()),
        verifier,
        auth_tx,
        event_tx,
        settings(),
    );
    let handle = monitor.start(apps);
    Harness {
        table,
        handle,
        auth_rx,
        event_rx,
    }
}

async fn next_auth(harness: &mut Harness) -> AuthRequest {
    timeout(Duration::from_secs(3), harness.auth_rx.recv())
        .await
        .expect("timed out waiting for auth request")
        .expect("auth channel closed")
}

async fn wait_for_state(harness: &Harness, id: uuid::Uuid, state: LockState) {
    for _ in 0..50 {
        if harness.handle.states().get(&id) == Some(&state) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("app never reached {state:?}");
}

fn locked_app(name: &str, pattern: &str) -> LockedApplication {
    let mut app = LockedApplication::new(name, None);
    app.match_patterns = vec![pattern.to_string()];
    app
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_passwords_terminate_then_correct_password_unlocks() {
    let app = locked_app("calc", "calc");
    let id = app.id;
    let mut harness = start_monitor(vec![app]);

    // Launch: the group is blocked and exactly one prompt goes out.
    harness.table.launch(100, "gnome-calculator");
    let request = next_auth(&mut harness).await;
    assert_eq!(request.app_name, "calc");
    assert_eq!(request.attempt, 1);
    assert!(harness.table.suspended.lock().contains(&100));
    assert_eq!(harness.handle.states()[&id], LockState::PendingAuth);

    // Three wrong answers exhaust the retry limit.
    request.reply.send(AuthAnswer::Submit("nope".into())).unwrap();
    let request = next_auth(&mut harness).await;
    assert_eq!(request.attempt, 2);
    request.reply.send(AuthAnswer::Submit("nope".into())).unwrap();
    let request = next_auth(&mut harness).await;
    assert_eq!(request.attempt, 3);
    request.reply.send(AuthAnswer::Submit("nope".into())).unwrap();

    wait_for_state(&harness, id, LockState::Locked).await;
    assert!(harness.table.killed.lock().contains(&100));

    // Relaunch and answer correctly this time.
    harness.table.launch(101, "gnome-calculator");
    let request = next_auth(&mut harness).await;
    assert_eq!(request.attempt, 1);
    request.reply.send(AuthAnswer::Submit("P1".into())).unwrap();
    wait_for_state(&harness, id, LockState::Unlocked).await;
    assert!(harness.table.resumed.lock().contains(&101));

    // The unlock is reported exactly once.
    let mut unlock_events = 0;
    while let Ok(event) = harness.event_rx.try_recv() {
        if matches!(event, MonitorEvent::Unlocked { app_id, .. } if app_id == id) {
            unlock_events += 1;
        }
    }
    assert_eq!(unlock_events, 1);

    harness.handle.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn one_group_gets_one_prompt() {
    let app = locked_app("browser", "chrome");
    let id = app.id;
    let mut harness = start_monitor(vec![app]);

    // Two group members appear within the same poll window.
    harness.table.launch(200, "chrome");
    harness.table.launch(201, "chrome_crashpad_handler");

    let request = next_auth(&mut harness).await;
    assert_eq!(request.app_name, "browser");

    // No duplicate prompt shows up while the first is pending.
    assert!(
        timeout(Duration::from_millis(700), harness.auth_rx.recv())
            .await
            .is_err(),
        "second prompt for the same group"
    );
    assert!(harness.table.suspended.lock().contains(&200));
    assert!(harness.table.suspended.lock().contains(&201));

    // One correct answer unlocks the whole group.
    request.reply.send(AuthAnswer::Submit("P1".into())).unwrap();
    wait_for_state(&harness, id, LockState::Unlocked).await;
    let resumed = harness.table.resumed.lock().clone();
    assert!(resumed.contains(&200) && resumed.contains(&201));

    // Once every member exits the group relocks.
    harness.table.exit(200);
    harness.table.exit(201);
    wait_for_state(&harness, id, LockState::Locked).await;

    harness.handle.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_terminates_the_group() {
    let app = locked_app("editor", "editor");
    let id = app.id;
    let mut harness = start_monitor(vec![app]);

    harness.table.launch(300, "editor");
    let request = next_auth(&mut harness).await;
    request.reply.send(AuthAnswer::Cancel).unwrap();

    wait_for_state(&harness, id, LockState::Locked).await;
    assert!(harness.table.killed.lock().contains(&300));
    harness.handle.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn group_exit_during_prompt_relocks_without_unlock() {
    let app = locked_app("calc", "calc");
    let id = app.id;
    let mut harness = start_monitor(vec![app]);

    harness.table.launch(400, "calc");
    let request = next_auth(&mut harness).await;

    // The process dies while the prompt is open.
    harness.table.exit(400);
    wait_for_state(&harness, id, LockState::Locked).await;

    // A late correct answer must not unlock anything.
    let _ = request.reply.send(AuthAnswer::Submit("P1".into()));
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(harness.handle.states()[&id], LockState::Locked);

    let mut saw_unlock = false;
    while let Ok(event) = harness.event_rx.try_recv() {
        if matches!(event, MonitorEvent::Unlocked { .. }) {
            saw_unlock = true;
        }
    }
    assert!(!saw_unlock, "unlock without successful verification");

    harness.handle.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn other_apps_keep_polling_while_one_is_pending() {
    let calc = locked_app("calc", "calc");
    let browser = locked_app("browser", "chrome");
    let calc_id = calc.id;
    let browser_id = browser.id;
    let mut harness = start_monitor(vec![calc, browser]);

    harness.table.launch(500, "calc");
    let calc_request = next_auth(&mut harness).await;
    assert_eq!(calc_request.app_name, "calc");

    // While calc waits for its password, a browser launch is still caught.
    harness.table.launch(501, "chrome");
    let browser_request = next_auth(&mut harness).await;
    assert_eq!(browser_request.app_name, "browser");
    assert_eq!(harness.handle.states()[&browser_id], LockState::PendingAuth);
    assert_eq!(harness.handle.states()[&calc_id], LockState::PendingAuth);

    calc_request.reply.send(AuthAnswer::Submit("P1".into())).unwrap();
    browser_request.reply.send(AuthAnswer::Cancel).unwrap();
    wait_for_state(&harness, calc_id, LockState::Unlocked).await;
    wait_for_state(&harness, browser_id, LockState::Locked).await;

    harness.handle.stop().await;
}
