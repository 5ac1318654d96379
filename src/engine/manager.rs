// Intercessio Engine — Session Manager
// The coordinator. Owns every runtime session: creates, resumes, mutates,
// and destroys them; binds each to a provider, a policy handle, and a key;
// routes provider callbacks through policy evaluation and the approval
// flow; persists every state transition before reporting success.
//
// Concurrency shape: one pump task per session consumes that session's
// provider events in order, so requests within a session are serialized.
// A REFER suspends the pump on the approval future; other sessions'
// pumps keep running — that suspension is the daemon's main source of
// in-flight concurrency.

use crate::atoms::error::{DaemonError, DaemonResult};
use crate::atoms::types::{
    now_ms, short_pubkey, ActivityKind, PolicyContext, PolicyDecision, SessionRecord,
    SessionStatus, SessionSummary, SessionType,
};
use crate::engine::activity::ActivityLog;
use crate::engine::approval::{summarize_draft, ApprovalManager};
use crate::engine::keys::KeyStore;
use crate::engine::nostr::{
    parse_nostr_connect_uri, CryptoOp, PairingMode, ProviderActivity, SessionProvider,
};
use crate::engine::policy::{self, Policy};
use crate::engine::store::SessionStore;
use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

// ── Runtime state ──────────────────────────────────────────────────────

struct RuntimeSession {
    record: Arc<RwLock<SessionRecord>>,
    provider: Arc<SessionProvider>,
    /// Swapped in place by update_template; the pump reads it per request.
    policy: Arc<RwLock<&'static Policy>>,
    pump: JoinHandle<()>,
}

pub struct SessionManager {
    store: Arc<SessionStore>,
    keys: Arc<KeyStore>,
    activity: Arc<ActivityLog>,
    approvals: Arc<ApprovalManager>,
    sessions: Mutex<HashMap<String, RuntimeSession>>,
}

pub struct StartBunkerArgs {
    pub key_id: String,
    pub alias: String,
    pub relays: Vec<String>,
    pub secret: Option<String>,
    pub auto_approve: bool,
    pub template: Option<String>,
}

pub struct StartNostrConnectArgs {
    pub key_id: String,
    pub alias: String,
    pub relays: Vec<String>,
    pub uri: String,
    pub auto_approve: bool,
    pub template: Option<String>,
}

impl SessionManager {
    pub fn new(
        store: Arc<SessionStore>,
        keys: Arc<KeyStore>,
        activity: Arc<ActivityLog>,
        approvals: Arc<ApprovalManager>,
    ) -> Self {
        SessionManager {
            store,
            keys,
            activity,
            approvals,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn running_session_ids(&self) -> Vec<String> {
        self.sessions.lock().keys().cloned().collect()
    }

    // ── Public operations ──────────────────────────────────────────────

    /// Start a bunker session: we advertise a URI, the client dials us.
    pub async fn start_bunker(&self, args: StartBunkerArgs) -> DaemonResult<(String, String)> {
        self.require_key(&args.key_id)?;
        let relays = normalize_relays(&args.relays);
        if relays.is_empty() {
            return Err(DaemonError::Config("At least one valid relay is required".into()));
        }
        let template = self.resolve_template(args.template.as_deref());
        let secret = args
            .secret
            .filter(|s| !s.is_empty())
            .unwrap_or_else(generate_pairing_secret);

        let now = now_ms();
        let record = SessionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            session_type: SessionType::Bunker,
            key_id: args.key_id,
            alias: args.alias,
            relays,
            secret: Some(secret),
            uri: None,
            auto_approve: args.auto_approve,
            status: SessionStatus::Waiting,
            last_client: None,
            created_at: now,
            updated_at: now,
            active: true,
            template: template.id.to_string(),
        };
        self.store.upsert_session(&record)?;

        let session_id = record.id.clone();
        let alias = record.alias.clone();
        match self.spawn_runtime(record).await {
            Ok(uri) => {
                self.activity.push(
                    ActivityKind::SessionStart,
                    "Bunker session started",
                    Some((&session_id, &alias)),
                    None,
                );
                Ok((session_id, uri.unwrap_or_default()))
            }
            Err(e) => {
                // The runtime never registered; do not leave the record
                // resumable on next boot.
                self.deactivate_record(&session_id)?;
                Err(e)
            }
        }
    }

    /// Start a nostr-connect session: the client supplied a URI we dial.
    /// Pairing completes during start, so the record begins `connected`.
    pub async fn start_nostr_connect(&self, args: StartNostrConnectArgs) -> DaemonResult<String> {
        self.require_key(&args.key_id)?;
        let info = parse_nostr_connect_uri(&args.uri)?;
        let mut all_relays = args.relays.clone();
        all_relays.extend(info.relays.clone());
        let relays = normalize_relays(&all_relays);
        if relays.is_empty() {
            return Err(DaemonError::Config("At least one valid relay is required".into()));
        }
        let template = self.resolve_template(args.template.as_deref());

        let now = now_ms();
        let record = SessionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            session_type: SessionType::NostrConnect,
            key_id: args.key_id,
            alias: args.alias,
            relays,
            secret: None,
            uri: Some(args.uri),
            auto_approve: args.auto_approve,
            status: SessionStatus::Connected,
            last_client: Some(info.client),
            created_at: now,
            updated_at: now,
            active: true,
            template: template.id.to_string(),
        };
        self.store.upsert_session(&record)?;

        let session_id = record.id.clone();
        let alias = record.alias.clone();
        match self.spawn_runtime(record).await {
            Ok(_) => {
                self.activity.push(
                    ActivityKind::SessionStart,
                    "Nostr Connect session started",
                    Some((&session_id, &alias)),
                    None,
                );
                Ok(session_id)
            }
            Err(e) => {
                self.deactivate_record(&session_id)?;
                Err(e)
            }
        }
    }

    /// Stop a session: tear down the runtime, reject its pending
    /// approvals, and either deactivate or delete the record.
    /// Idempotent on already-stopped sessions.
    pub async fn stop(&self, session_id: &str, remove: bool) -> DaemonResult<()> {
        let runtime = self.sessions.lock().remove(session_id);
        let was_running = runtime.is_some();
        if let Some(rt) = runtime {
            // Reject first so suspended pipelines resolve to deny and the
            // provider gets a chance to flush replies before it stops.
            self.approvals.reject_for_session(session_id)?;
            rt.provider.stop().await;
            rt.pump.abort();
        } else {
            self.approvals.reject_for_session(session_id)?;
        }

        let Some(mut record) = self.store.get_session(session_id)? else {
            return Err(DaemonError::not_found("Session not found"));
        };
        let alias = record.alias.clone();
        if remove {
            self.store.delete_session(session_id)?;
        } else {
            record.active = false;
            record.updated_at = now_ms();
            self.store.upsert_session(&record)?;
        }
        self.activity.push(
            ActivityKind::SessionStop,
            if remove { "Session deleted" } else { "Session stopped" },
            Some((session_id, &alias)),
            None,
        );
        info!(
            "[manager] Session {session_id} {} (was running: {was_running})",
            if remove { "deleted" } else { "stopped" }
        );
        Ok(())
    }

    pub fn rename(&self, session_id: &str, alias: &str) -> DaemonResult<()> {
        let mut record = self.mutate_record(session_id, |record| {
            record.alias = alias.to_string();
        })?;
        record.updated_at = now_ms();
        self.store.upsert_session(&record)?;
        self.activity.push(
            ActivityKind::SessionUpdate,
            format!("Session renamed to \"{alias}\""),
            Some((session_id, alias)),
            None,
        );
        Ok(())
    }

    /// Switch the session's policy. Takes effect on the next inbound
    /// request; in-flight referred tasks keep their original policy label.
    pub fn update_template(&self, session_id: &str, template: &str) -> DaemonResult<()> {
        let policy = policy::resolve(template)
            .ok_or_else(|| DaemonError::UnknownPolicy(template.to_string()))?;

        let mut record = self.mutate_record(session_id, |record| {
            record.template = policy.id.to_string();
        })?;
        record.updated_at = now_ms();
        self.store.upsert_session(&record)?;

        if let Some(rt) = self.sessions.lock().get(session_id) {
            *rt.policy.write() = policy;
        }
        self.activity.push(
            ActivityKind::SessionUpdate,
            format!("Policy changed to {}", policy.label),
            Some((session_id, &record.alias)),
            None,
        );
        Ok(())
    }

    pub fn list(&self, active_only: bool) -> DaemonResult<Vec<SessionRecord>> {
        self.store.list_sessions(active_only)
    }

    /// Re-register every active session after a restart. A failure on one
    /// record is logged and skipped; the others proceed.
    pub async fn restore_on_boot(&self) {
        let records = match self.store.list_sessions(true) {
            Ok(records) => records,
            Err(e) => {
                error!("[manager] Failed to load sessions for restore: {e}");
                return;
            }
        };
        for record in records {
            let session_id = record.id.clone();
            if self.keys.get(&record.key_id).ok().flatten().is_none() {
                warn!(
                    "[manager] Skipping restore of session {session_id}: key {} no longer exists",
                    record.key_id
                );
                continue;
            }
            match self.spawn_runtime(record).await {
                Ok(_) => info!("[manager] Restored session {session_id}"),
                Err(e) => warn!("[manager] Failed to restore session {session_id}: {e}"),
            }
        }
    }

    /// Graceful drain for daemon shutdown: stop every provider without
    /// flipping `active`, so the next boot resumes all of them.
    pub async fn shutdown_all(&self) {
        let drained: Vec<(String, RuntimeSession)> = self.sessions.lock().drain().collect();
        for (session_id, rt) in drained {
            rt.provider.stop().await;
            rt.pump.abort();
            info!("[manager] Session {session_id} drained for shutdown");
        }
    }

    // ── Internals ──────────────────────────────────────────────────────

    fn require_key(&self, key_id: &str) -> DaemonResult<()> {
        self.keys
            .get(key_id)?
            .map(|_| ())
            .ok_or_else(|| DaemonError::not_found("Key not found"))
    }

    /// Explicit template selection on start: unknown ids fall back to the
    /// registry default (only update_template treats them as an error).
    fn resolve_template(&self, template: Option<&str>) -> &'static Policy {
        match template {
            Some(id) if !id.is_empty() => policy::resolve_or_default(id),
            _ => policy::resolve_or_default(policy::DEFAULT_POLICY_ID),
        }
    }

    /// Apply a mutation to the runtime copy when the session is running
    /// (so the pump observes it) or to a freshly loaded row otherwise.
    /// Returns the mutated record for persistence.
    fn mutate_record(
        &self,
        session_id: &str,
        mutate: impl FnOnce(&mut SessionRecord),
    ) -> DaemonResult<SessionRecord> {
        if let Some(rt) = self.sessions.lock().get(session_id) {
            let mut record = rt.record.write();
            mutate(&mut record);
            return Ok(record.clone());
        }
        let Some(mut record) = self.store.get_session(session_id)? else {
            return Err(DaemonError::not_found("Session not found"));
        };
        mutate(&mut record);
        Ok(record)
    }

    fn deactivate_record(&self, session_id: &str) -> DaemonResult<()> {
        if let Some(mut record) = self.store.get_session(session_id)? {
            record.active = false;
            record.updated_at = now_ms();
            self.store.upsert_session(&record)?;
        }
        Ok(())
    }

    /// Build and register the runtime for a record: provider, policy
    /// handle, pump task. Returns the bunker URI for bunker sessions.
    async fn spawn_runtime(&self, mut record: SessionRecord) -> DaemonResult<Option<String>> {
        let secret_key = self.keys.secret_for(&record.key_id)?;

        let mode = match record.session_type {
            SessionType::Bunker => PairingMode::Bunker {
                secret: record
                    .secret
                    .clone()
                    .ok_or_else(|| DaemonError::Config("Bunker session has no secret".into()))?,
            },
            SessionType::NostrConnect => {
                let uri = record
                    .uri
                    .clone()
                    .ok_or_else(|| DaemonError::Config("Nostr Connect session has no URI".into()))?;
                let info = parse_nostr_connect_uri(&uri)?;
                PairingMode::NostrConnect { client: info.client, secret: info.secret }
            }
        };

        let (provider, events) =
            SessionProvider::new(&record.id, secret_key, record.relays.clone(), mode)?;
        provider.start().await?;
        let provider = Arc::new(provider);

        let bunker_uri = match record.session_type {
            SessionType::Bunker => {
                let uri = provider.bunker_uri()?;
                record.uri = Some(uri.clone());
                Some(uri)
            }
            SessionType::NostrConnect => None,
        };

        // Rebind the previous peer so a restart needs no fresh handshake.
        if record.session_type == SessionType::Bunker {
            if let Some(client) = &record.last_client {
                provider.resume_client(client);
            }
        }

        let policy = Arc::new(RwLock::new(policy::resolve_or_default(&record.template)));
        let record = {
            record.updated_at = now_ms();
            self.store.upsert_session(&record)?;
            Arc::new(RwLock::new(record))
        };

        let pump = SessionPump::from_shared(
            Arc::clone(&self.store),
            Arc::clone(&self.activity),
            Arc::clone(&self.approvals),
            Arc::clone(&record),
            Arc::clone(&policy),
        );
        let pump_task = tokio::spawn(pump.run(events));

        let session_id = record.read().id.clone();
        self.sessions.lock().insert(
            session_id,
            RuntimeSession { record, provider, policy, pump: pump_task },
        );
        Ok(bunker_uri)
    }
}

// ── Signing pipeline ───────────────────────────────────────────────────

/// Consumes one session's provider events in order and drives the policy
/// and approval flow. Public so the pipeline can be exercised directly by
/// the integration tests with synthetic events.
pub struct SessionPump {
    store: Arc<SessionStore>,
    activity: Arc<ActivityLog>,
    approvals: Arc<ApprovalManager>,
    record: Arc<RwLock<SessionRecord>>,
    policy: Arc<RwLock<&'static Policy>>,
}

impl SessionPump {
    /// Standalone pipeline over an owned record and policy. Used by tests;
    /// the manager wires shared handles via `from_shared`.
    pub fn new(
        store: Arc<SessionStore>,
        activity: Arc<ActivityLog>,
        approvals: Arc<ApprovalManager>,
        record: SessionRecord,
        policy: &'static Policy,
    ) -> Self {
        Self::from_shared(
            store,
            activity,
            approvals,
            Arc::new(RwLock::new(record)),
            Arc::new(RwLock::new(policy)),
        )
    }

    pub(crate) fn from_shared(
        store: Arc<SessionStore>,
        activity: Arc<ActivityLog>,
        approvals: Arc<ApprovalManager>,
        record: Arc<RwLock<SessionRecord>>,
        policy: Arc<RwLock<&'static Policy>>,
    ) -> Self {
        SessionPump { store, activity, approvals, record, policy }
    }

    /// Handle for swapping the active policy, mirroring update_template.
    pub fn policy_handle(&self) -> Arc<RwLock<&'static Policy>> {
        Arc::clone(&self.policy)
    }

    /// Snapshot of the pipeline's working record copy.
    pub fn record_snapshot(&self) -> SessionRecord {
        self.record.read().clone()
    }

    pub async fn run(self, mut events: mpsc::UnboundedReceiver<ProviderActivity>) {
        while let Some(event) = events.recv().await {
            self.handle(event).await;
        }
    }

    fn session_context(&self) -> (String, String) {
        let record = self.record.read();
        (record.id.clone(), record.alias.clone())
    }

    fn summary(&self) -> SessionSummary {
        let record = self.record.read();
        SessionSummary {
            id: record.id.clone(),
            alias: record.alias.clone(),
            session_type: record.session_type,
        }
    }

    pub async fn handle(&self, event: ProviderActivity) {
        match event {
            ProviderActivity::ConnectRequest { client } => {
                let (id, alias) = self.session_context();
                self.activity.push(
                    ActivityKind::SessionUpdate,
                    format!("Connect request from {}", short_pubkey(&client)),
                    Some((&id, &alias)),
                    Some(&client),
                );
            }
            ProviderActivity::ClientConnected { client } => self.on_client_connected(&client),
            ProviderActivity::ClientDisconnected { client } => {
                // Transient by definition — the record stays active so the
                // session survives relay flaps; only stop/delete deactivate.
                let (id, alias) = self.session_context();
                self.activity.push(
                    ActivityKind::ProviderDisconnect,
                    format!("Client {} disconnected", short_pubkey(&client)),
                    Some((&id, &alias)),
                    Some(&client),
                );
            }
            ProviderActivity::SignRequest { client, draft, respond } => {
                self.on_sign_request(&client, draft, respond).await;
            }
            ProviderActivity::SignDecision { client, event_kind, approved } => {
                let (id, alias) = self.session_context();
                self.activity.push(
                    ActivityKind::SignResult,
                    format!(
                        "kind {event_kind} {}",
                        if approved { "signed" } else { "denied" }
                    ),
                    Some((&id, &alias)),
                    Some(&client),
                );
            }
            ProviderActivity::Nip04 { client, op } => {
                let (id, alias) = self.session_context();
                self.activity.push(
                    ActivityKind::Nip04,
                    format!("NIP-04 {}", op_label(op)),
                    Some((&id, &alias)),
                    Some(&client),
                );
            }
            ProviderActivity::Nip44 { client, op } => {
                let (id, alias) = self.session_context();
                self.activity.push(
                    ActivityKind::Nip44,
                    format!("NIP-44 {}", op_label(op)),
                    Some((&id, &alias)),
                    Some(&client),
                );
            }
        }
    }

    fn on_client_connected(&self, client: &str) {
        let record = {
            let mut record = self.record.write();
            record.status = SessionStatus::Connected;
            record.last_client = Some(client.to_string());
            record.active = true;
            record.updated_at = now_ms();
            record.clone()
        };
        if let Err(e) = self.store.upsert_session(&record) {
            warn!("[manager] Failed to persist client connect for {}: {e}", record.id);
        }
        self.activity.push(
            ActivityKind::ProviderConnect,
            format!("Client {} connected", short_pubkey(client)),
            Some((&record.id, &record.alias)),
            Some(client),
        );
    }

    async fn on_sign_request(
        &self,
        client: &str,
        draft: serde_json::Value,
        respond: oneshot::Sender<bool>,
    ) {
        let summary = self.summary();
        let auto_approve = self.record.read().auto_approve;
        self.activity.push(
            ActivityKind::SignRequest,
            summarize_draft(&draft),
            Some((&summary.id, &summary.alias)),
            Some(client),
        );

        let policy = *self.policy.read();
        let mut decision = evaluate_guarded(policy, &draft, client, &summary);
        if auto_approve && decision == PolicyDecision::Refer {
            decision = PolicyDecision::Sign;
        }

        let approved = match decision {
            PolicyDecision::Sign => true,
            PolicyDecision::Reject => false,
            PolicyDecision::Refer => {
                match self.approvals.create(&summary, client, draft, policy) {
                    Ok((task_id, decision_rx)) => {
                        info!(
                            "[manager] Session {} referred request to approval {task_id}",
                            summary.id
                        );
                        // Suspension point: other sessions keep running.
                        decision_rx.await.unwrap_or(false)
                    }
                    Err(e) => {
                        error!("[manager] Failed to create approval task: {e}");
                        false
                    }
                }
            }
        };
        let _ = respond.send(approved);
    }
}

/// A policy must never take the daemon down: panics count as REJECT.
fn evaluate_guarded(
    policy: &'static Policy,
    draft: &serde_json::Value,
    client: &str,
    session: &SessionSummary,
) -> PolicyDecision {
    let ctx = PolicyContext { event: draft, client, session };
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| policy.evaluate(&ctx))) {
        Ok(decision) => decision,
        Err(_) => {
            error!("[manager] Policy {} panicked — treating as REJECT", policy.id);
            PolicyDecision::Reject
        }
    }
}

fn op_label(op: CryptoOp) -> &'static str {
    match op {
        CryptoOp::Encrypt => "encrypt",
        CryptoOp::Decrypt => "decrypt",
    }
}

fn generate_pairing_secret() -> String {
    crate::engine::nostr::crypto::hex_encode(&rand::random::<[u8; 8]>())
}

// ── Relay URL normalization ────────────────────────────────────────────

/// Normalize one relay URL to `wss://host[:port][/path]` with no trailing
/// slash. Bare hostnames get the wss scheme; anything that is not a
/// WebSocket URL is dropped.
pub fn normalize_relay(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("wss://{raw}")
    };
    let parsed = url::Url::parse(&with_scheme).ok()?;
    if parsed.scheme() != "wss" && parsed.scheme() != "ws" {
        return None;
    }
    let host = parsed.host_str()?;
    let mut out = format!("{}://{}", parsed.scheme(), host);
    if let Some(port) = parsed.port() {
        out.push_str(&format!(":{port}"));
    }
    let path = parsed.path().trim_end_matches('/');
    if !path.is_empty() {
        out.push_str(path);
    }
    Some(out)
}

/// Normalize and deduplicate, preserving first-seen order.
pub fn normalize_relays(raw: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for candidate in raw {
        if let Some(normalized) = normalize_relay(candidate) {
            if !out.contains(&normalized) {
                out.push(normalized);
            }
        }
    }
    out
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_slash_and_defaults_scheme() {
        assert_eq!(normalize_relay("wss://relay.damus.io/"), Some("wss://relay.damus.io".into()));
        assert_eq!(normalize_relay("relay.damus.io"), Some("wss://relay.damus.io".into()));
        assert_eq!(normalize_relay("ws://localhost:7777"), Some("ws://localhost:7777".into()));
        assert_eq!(
            normalize_relay("wss://relay.example.com/nostr/"),
            Some("wss://relay.example.com/nostr".into())
        );
        assert_eq!(normalize_relay("https://example.com"), None);
        assert_eq!(normalize_relay("   "), None);
    }

    #[test]
    fn normalize_is_idempotent_and_dedupes() {
        let input = vec![
            "wss://relay.damus.io/".to_string(),
            "relay.damus.io".to_string(),
            "wss://nos.lol".to_string(),
            "not a url ::".to_string(),
        ];
        let once = normalize_relays(&input);
        assert_eq!(once, vec!["wss://relay.damus.io".to_string(), "wss://nos.lol".to_string()]);
        let twice = normalize_relays(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn normalized_relays_match_contract_shape() {
        let input = vec![
            "wss://relay.example.com/a/b/".to_string(),
            "nos.lol".to_string(),
        ];
        for relay in normalize_relays(&input) {
            assert!(relay.starts_with("ws://") || relay.starts_with("wss://"));
            assert!(!relay.ends_with('/'));
        }
    }
}
