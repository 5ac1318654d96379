// Integration tests — exercise the signing pipeline, approval flow,
// restart resumption, and the control plane against real (in-memory or
// temp-dir) stores. No network: provider events are synthesized where a
// relay would normally produce them.

use intercessio::atoms::error::DaemonError;
use intercessio::atoms::types::*;
use intercessio::control::{self, ControlRequest, Daemon};
use intercessio::engine::activity::ActivityLog;
use intercessio::engine::approval::ApprovalManager;
use intercessio::engine::keys::KeyStore;
use intercessio::engine::manager::{SessionManager, SessionPump};
use intercessio::engine::notify::Notifier;
use intercessio::engine::policy;
use intercessio::engine::store::SessionStore;
use intercessio::engine::vault::SecretVault;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

// ── Fixtures ───────────────────────────────────────────────────────────

struct Fixture {
    store: Arc<SessionStore>,
    activity: Arc<ActivityLog>,
    approvals: Arc<ApprovalManager>,
}

fn fixture_with_ttl(ttl: Duration) -> Fixture {
    let store = Arc::new(SessionStore::open_in_memory().unwrap());
    let approvals = Arc::new(ApprovalManager::with_ttl(
        Arc::clone(&store),
        Arc::new(Notifier::new()),
        ttl,
    ));
    Fixture { store, activity: Arc::new(ActivityLog::new()), approvals }
}

fn fixture() -> Fixture {
    fixture_with_ttl(Duration::from_secs(600))
}

fn sample_record(id: &str, template: &str) -> SessionRecord {
    SessionRecord {
        id: id.to_string(),
        session_type: SessionType::Bunker,
        key_id: "k1".into(),
        alias: "laptop".into(),
        relays: vec!["wss://relay.damus.io".into()],
        secret: Some("pairing-secret".into()),
        uri: None,
        auto_approve: false,
        status: SessionStatus::Waiting,
        last_client: None,
        created_at: now_ms(),
        updated_at: now_ms(),
        active: true,
        template: template.to_string(),
    }
}

fn pump_for(fixture: &Fixture, record: SessionRecord) -> SessionPump {
    let policy = policy::resolve_or_default(&record.template);
    SessionPump::new(
        Arc::clone(&fixture.store),
        Arc::clone(&fixture.activity),
        Arc::clone(&fixture.approvals),
        record,
        policy,
    )
}

/// Feed one sign request through the pipeline and return the receiver the
/// provider would be suspended on.
async fn submit(pump: &SessionPump, draft: serde_json::Value) -> oneshot::Receiver<bool> {
    let (tx, rx) = oneshot::channel();
    pump.handle(intercessio::engine::nostr::ProviderActivity::SignRequest {
        client: "clientpk".into(),
        draft,
        respond: tx,
    })
    .await;
    rx
}

async fn wait_for_pending(approvals: &ApprovalManager) -> ApprovalTask {
    for _ in 0..100 {
        let pending = approvals.list_pending().unwrap();
        if let Some(task) = pending.into_iter().next() {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no approval task appeared");
}

// ── End-to-end signing scenarios ───────────────────────────────────────

#[tokio::test]
async fn auto_sign_policy_signs_without_approval_task() {
    let fx = fixture();
    let pump = pump_for(&fx, sample_record("s1", "auto_sign"));

    let rx = submit(&pump, json!({"kind": 1, "content": "hi"})).await;
    assert!(rx.await.unwrap());
    assert!(fx.approvals.list_pending().unwrap().is_empty());

    let kinds: Vec<ActivityKind> = fx.activity.list().iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&ActivityKind::SignRequest));
}

#[tokio::test]
async fn login_only_policy_rejects_notes() {
    let fx = fixture();
    let pump = pump_for(&fx, sample_record("s1", "online_login"));

    let rx = submit(&pump, json!({"kind": 1, "content": "hi"})).await;
    assert!(!rx.await.unwrap());
    assert!(fx.approvals.list_pending().unwrap().is_empty());
}

#[tokio::test]
async fn referred_request_signs_after_explicit_approval() {
    let fx = fixture();
    let pump = Arc::new(pump_for(&fx, sample_record("s1", "login_and_publish")));

    // kind 4 (DM) is outside login/publish — it must be referred
    let pump_task = {
        let pump = Arc::clone(&pump);
        tokio::spawn(async move { submit(&pump, json!({"kind": 4, "content": "dm"})).await })
    };

    let task = wait_for_pending(&fx.approvals).await;
    assert_eq!(task.status, ApprovalStatus::Pending);
    assert_eq!(task.session_id, "s1");
    assert_eq!(task.event_kind, 4);
    assert_eq!(task.policy_id, "login_and_publish");

    fx.approvals.resolve(&task.id, true).unwrap();
    let rx = pump_task.await.unwrap();
    assert!(rx.await.unwrap());

    assert_eq!(
        fx.approvals.get(&task.id).unwrap().unwrap().status,
        ApprovalStatus::Approved
    );
    // Resolution is at-most-once: a second decision is refused
    assert!(matches!(
        fx.approvals.resolve(&task.id, false),
        Err(DaemonError::NotFound(_))
    ));
}

#[tokio::test]
async fn referred_request_expires_to_deny() {
    let fx = fixture_with_ttl(Duration::from_millis(50));
    let pump = pump_for(&fx, sample_record("s1", "login_and_publish"));

    let rx = submit(&pump, json!({"kind": 4, "content": "dm"})).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!rx.await.unwrap());

    let pending = fx.approvals.list_pending().unwrap();
    assert!(pending.is_empty());
}

#[tokio::test]
async fn template_swap_governs_next_request_only() {
    let fx = fixture();
    let pump = Arc::new(pump_for(&fx, sample_record("s1", "login_auto_review")));

    // First request is referred under the original policy
    let first = {
        let pump = Arc::clone(&pump);
        tokio::spawn(async move { submit(&pump, json!({"kind": 1, "content": "note"})).await })
    };
    let task = wait_for_pending(&fx.approvals).await;
    assert_eq!(task.policy_id, "login_auto_review");

    // Swap the session to auto_sign mid-flight
    let handle = pump.policy_handle();
    *handle.write() = policy::resolve("auto_sign").unwrap();

    // The next request signs without a referral
    let rx = submit(&pump, json!({"kind": 1, "content": "second"})).await;
    assert!(rx.await.unwrap());
    assert_eq!(fx.approvals.list_pending().unwrap().len(), 1);

    // The in-flight task still resolves under its original identity
    fx.approvals.resolve(&task.id, false).unwrap();
    let rx1 = first.await.unwrap();
    assert!(!rx1.await.unwrap());
    let finished = fx.approvals.get(&task.id).unwrap().unwrap();
    assert_eq!(finished.policy_id, "login_auto_review");
    assert_eq!(finished.status, ApprovalStatus::Rejected);
}

#[tokio::test]
async fn auto_approve_short_circuits_referral() {
    let fx = fixture();
    let mut record = sample_record("s1", "login_auto_review");
    record.auto_approve = true;
    let pump = pump_for(&fx, record);

    let rx = submit(&pump, json!({"kind": 30023, "content": "article"})).await;
    assert!(rx.await.unwrap());
    assert!(fx.approvals.list_pending().unwrap().is_empty());
}

// ── Connection handling ────────────────────────────────────────────────

#[tokio::test]
async fn first_client_connect_transitions_waiting_record() {
    let fx = fixture();
    let record = sample_record("s1", "auto_sign");
    fx.store.upsert_session(&record).unwrap();
    let pump = pump_for(&fx, record);

    pump.handle(intercessio::engine::nostr::ProviderActivity::ClientConnected {
        client: "clientpk".into(),
    })
    .await;

    let stored = fx.store.get_session("s1").unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Connected);
    assert_eq!(stored.last_client.as_deref(), Some("clientpk"));
    assert!(stored.active);

    // Disconnect emits activity but keeps the record active
    pump.handle(intercessio::engine::nostr::ProviderActivity::ClientDisconnected {
        client: "clientpk".into(),
    })
    .await;
    let stored = fx.store.get_session("s1").unwrap().unwrap();
    assert!(stored.active);

    let kinds: Vec<ActivityKind> = fx.activity.list().iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&ActivityKind::ProviderConnect));
    assert!(kinds.contains(&ActivityKind::ProviderDisconnect));
}

// ── Secrecy ────────────────────────────────────────────────────────────

#[tokio::test]
async fn secrets_never_reach_activity_or_control_serialization() {
    let fx = fixture();
    let record = sample_record("s1", "auto_sign");
    fx.store.upsert_session(&record).unwrap();
    let pump = pump_for(&fx, record.clone());
    let rx = submit(&pump, json!({"kind": 1, "content": "hello"})).await;
    rx.await.unwrap();

    let activity_json = serde_json::to_string(&fx.activity.list()).unwrap();
    assert!(!activity_json.contains("pairing-secret"));

    // Control-plane serialization of session records omits the secret
    let sessions_json =
        serde_json::to_string(&fx.store.list_sessions(false).unwrap()).unwrap();
    assert!(!sessions_json.contains("pairing-secret"));
}

// ── Restart resumption ─────────────────────────────────────────────────

struct TempHome {
    dir: PathBuf,
}

impl TempHome {
    fn new() -> Self {
        let dir = std::env::temp_dir().join(format!("ic-it-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        TempHome { dir }
    }
}

impl Drop for TempHome {
    fn drop(&mut self) {
        std::fs::remove_dir_all(&self.dir).ok();
    }
}

fn manager_fixture(home: &TempHome, store: Arc<SessionStore>) -> (Arc<SessionManager>, Arc<ApprovalManager>, Arc<KeyStore>) {
    let vault = Arc::new(SecretVault::open_encrypted_file(&home.dir).unwrap());
    let keys = Arc::new(KeyStore::open(&home.dir, vault));
    let approvals = Arc::new(ApprovalManager::with_ttl(
        Arc::clone(&store),
        Arc::new(Notifier::new()),
        Duration::from_secs(600),
    ));
    let manager = Arc::new(SessionManager::new(
        store,
        Arc::clone(&keys),
        Arc::new(ActivityLog::new()),
        Arc::clone(&approvals),
    ));
    (manager, approvals, keys)
}

#[tokio::test]
async fn restart_restores_active_sessions_and_pending_approvals() {
    let home = TempHome::new();
    let db_path = home.dir.join("intercessio.db");
    let store = Arc::new(SessionStore::open(&db_path).unwrap());
    let (_, _, keys) = manager_fixture(&home, Arc::clone(&store));
    let key = keys.generate("primary").unwrap();

    // Persist what a previous daemon run would have left behind:
    // one bunker session, one nostr-connect session, one pending approval.
    // The relay is unreachable — loops retry in the background harmlessly.
    let mut bunker = sample_record("s-bunker", "login_and_publish");
    bunker.key_id = key.id.clone();
    bunker.relays = vec!["ws://127.0.0.1:1".into()];
    bunker.last_client = Some("clientpk".into());
    bunker.status = SessionStatus::Connected;
    store.upsert_session(&bunker).unwrap();

    let client_pk = "ab".repeat(32);
    let mut nc = sample_record("s-nc", "auto_sign");
    nc.session_type = SessionType::NostrConnect;
    nc.key_id = key.id.clone();
    nc.secret = None;
    nc.relays = vec!["ws://127.0.0.1:1".into()];
    nc.uri = Some(format!("nostrconnect://{client_pk}?relay=ws%3A%2F%2F127.0.0.1%3A1"));
    nc.status = SessionStatus::Connected;
    nc.last_client = Some(client_pk);
    store.upsert_session(&nc).unwrap();

    let mut inactive = sample_record("s-old", "auto_sign");
    inactive.key_id = key.id.clone();
    inactive.active = false;
    store.upsert_session(&inactive).unwrap();

    let expires_at = now_ms() + 60_000;
    store
        .insert_task(&ApprovalTask {
            id: "t-pending".into(),
            session_id: "s-bunker".into(),
            session_alias: "laptop".into(),
            session_type: SessionType::Bunker,
            client: "clientpk".into(),
            event_kind: 4,
            event_summary: "kind 4".into(),
            policy_id: "login_and_publish".into(),
            policy_label: "Login + publish".into(),
            draft: json!({"kind": 4, "content": "dm"}),
            created_at: now_ms(),
            expires_at,
            status: ApprovalStatus::Pending,
        })
        .unwrap();

    // "Restart": fresh manager + approval manager over the same store
    let (manager, approvals, _) = manager_fixture(&home, Arc::clone(&store));
    approvals.restore_timers_on_boot().unwrap();
    manager.restore_on_boot().await;

    let mut running = manager.running_session_ids();
    running.sort();
    assert_eq!(running, vec!["s-bunker".to_string(), "s-nc".to_string()]);

    // The pending approval survived with its original deadline
    let pending = approvals.list_pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, "t-pending");
    assert_eq!(pending[0].expires_at, expires_at);

    // The bunker record got a derived URI written back
    let restored = store.get_session("s-bunker").unwrap().unwrap();
    assert!(restored.uri.as_deref().unwrap_or("").starts_with("bunker://"));

    manager.shutdown_all().await;
    // Drain does not deactivate records: the next boot resumes them
    assert_eq!(store.list_sessions(true).unwrap().len(), 2);
}

#[tokio::test]
async fn restore_skips_sessions_with_missing_keys() {
    let home = TempHome::new();
    let store = Arc::new(SessionStore::open(&home.dir.join("intercessio.db")).unwrap());
    let mut record = sample_record("s-orphan", "auto_sign");
    record.key_id = "gone".into();
    record.relays = vec!["ws://127.0.0.1:1".into()];
    store.upsert_session(&record).unwrap();

    let (manager, approvals, _) = manager_fixture(&home, Arc::clone(&store));
    approvals.restore_timers_on_boot().unwrap();
    manager.restore_on_boot().await;
    assert!(manager.running_session_ids().is_empty());
}

// ── Session manager stop/delete semantics ──────────────────────────────

#[tokio::test]
async fn stop_rejects_pending_tasks_and_deactivates() {
    let home = TempHome::new();
    let store = Arc::new(SessionStore::open_in_memory().unwrap());
    let (manager, approvals, _) = manager_fixture(&home, Arc::clone(&store));

    let record = sample_record("s1", "login_and_publish");
    store.upsert_session(&record).unwrap();
    store
        .insert_task(&ApprovalTask {
            id: "t1".into(),
            session_id: "s1".into(),
            session_alias: "laptop".into(),
            session_type: SessionType::Bunker,
            client: "clientpk".into(),
            event_kind: 4,
            event_summary: "kind 4".into(),
            policy_id: "login_and_publish".into(),
            policy_label: "Login + publish".into(),
            draft: json!({"kind": 4}),
            created_at: now_ms(),
            expires_at: now_ms() + 60_000,
            status: ApprovalStatus::Pending,
        })
        .unwrap();

    manager.stop("s1", false).await.unwrap();
    assert_eq!(
        store.get_task("t1").unwrap().unwrap().status,
        ApprovalStatus::Rejected
    );
    let stored = store.get_session("s1").unwrap().unwrap();
    assert!(!stored.active);

    // Idempotent second stop
    manager.stop("s1", false).await.unwrap();

    // Delete removes the row
    manager.stop("s1", true).await.unwrap();
    assert!(store.get_session("s1").unwrap().is_none());

    // And a further stop is NotFound
    assert!(matches!(
        manager.stop("s1", false).await,
        Err(DaemonError::NotFound(_))
    ));
}

#[tokio::test]
async fn update_template_validates_and_rename_persists() {
    let home = TempHome::new();
    let store = Arc::new(SessionStore::open_in_memory().unwrap());
    let (manager, _, _) = manager_fixture(&home, Arc::clone(&store));
    store.upsert_session(&sample_record("s1", "auto_sign")).unwrap();

    assert!(matches!(
        manager.update_template("s1", "no_such_policy"),
        Err(DaemonError::UnknownPolicy(_))
    ));
    manager.update_template("s1", "online_login").unwrap();
    assert_eq!(store.get_session("s1").unwrap().unwrap().template, "online_login");

    manager.rename("s1", "desk").unwrap();
    assert_eq!(store.get_session("s1").unwrap().unwrap().alias, "desk");

    assert!(matches!(
        manager.rename("missing", "x"),
        Err(DaemonError::NotFound(_))
    ));
}

// ── Control plane ──────────────────────────────────────────────────────

fn daemon_fixture(home: &TempHome) -> (Arc<Daemon>, mpsc::UnboundedReceiver<()>) {
    let store = Arc::new(SessionStore::open_in_memory().unwrap());
    let vault = Arc::new(SecretVault::open_encrypted_file(&home.dir).unwrap());
    let keys = Arc::new(KeyStore::open(&home.dir, vault));
    let activity = Arc::new(ActivityLog::new());
    let approvals = Arc::new(ApprovalManager::with_ttl(
        Arc::clone(&store),
        Arc::new(Notifier::new()),
        Duration::from_secs(600),
    ));
    let manager = Arc::new(SessionManager::new(
        Arc::clone(&store),
        Arc::clone(&keys),
        Arc::clone(&activity),
        Arc::clone(&approvals),
    ));
    let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
    (
        Arc::new(Daemon { store, keys, activity, approvals, manager, shutdown: shutdown_tx }),
        shutdown_rx,
    )
}

#[tokio::test]
async fn dispatch_covers_reads_errors_and_shutdown() {
    let home = TempHome::new();
    let (daemon, mut shutdown_rx) = daemon_fixture(&home);

    let pong = control::dispatch(&daemon, ControlRequest::Ping).await;
    assert_eq!(pong["ok"], json!(true));
    assert_eq!(pong["pong"], json!(true));

    let sessions = control::dispatch(&daemon, ControlRequest::ListSessions).await;
    assert_eq!(sessions["ok"], json!(true));
    assert_eq!(sessions["sessions"], json!([]));

    let missing = control::dispatch(
        &daemon,
        ControlRequest::StopSession { session_id: "nope".into() },
    )
    .await;
    assert_eq!(missing["ok"], json!(false));
    assert_eq!(missing["error"], json!("Session not found"));

    let unresolved = control::dispatch(
        &daemon,
        ControlRequest::ResolveApproval {
            id: "nope".into(),
            decision: Some("approve".into()),
            approved: None,
        },
    )
    .await;
    assert_eq!(unresolved["ok"], json!(false));
    assert_eq!(unresolved["error"], json!("Approval not found"));

    let unknown_key = control::dispatch(
        &daemon,
        ControlRequest::StartBunker {
            key_id: "missing".into(),
            alias: String::new(),
            relays: vec!["wss://nos.lol".into()],
            secret: None,
            auto_approve: false,
            template: None,
        },
    )
    .await;
    assert_eq!(unknown_key["ok"], json!(false));
    assert_eq!(unknown_key["error"], json!("Key not found"));

    let bye = control::dispatch(&daemon, ControlRequest::Shutdown).await;
    assert_eq!(bye["ok"], json!(true));
    assert!(shutdown_rx.recv().await.is_some());
}

#[tokio::test]
async fn socket_roundtrip_and_singleton_guard() {
    let home = TempHome::new();
    let socket_path = home.dir.join("intercessio.sock");
    let listener = control::bind_socket(&socket_path).await.unwrap().unwrap();

    let (daemon, _shutdown_rx) = daemon_fixture(&home);
    let server = tokio::spawn(control::serve(listener, daemon));

    // One newline-terminated request, one newline-terminated response
    let mut stream = tokio::net::UnixStream::connect(&socket_path).await.unwrap();
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    stream.write_all(b"{\"type\":\"ping\"}\n").await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.ends_with('\n'));
    let value: serde_json::Value = serde_json::from_str(response.trim()).unwrap();
    assert_eq!(value["ok"], json!(true));

    // Unknown tags get the fixed message
    let mut stream = tokio::net::UnixStream::connect(&socket_path).await.unwrap();
    stream.write_all(b"{\"type\":\"frobnicate\"}\n").await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    let value: serde_json::Value = serde_json::from_str(response.trim()).unwrap();
    assert_eq!(value["ok"], json!(false));
    assert_eq!(value["error"], json!("Unknown request"));

    // A second daemon probing the live socket must stand down
    let second = control::bind_socket(&socket_path).await.unwrap();
    assert!(second.is_none());

    server.abort();
}
