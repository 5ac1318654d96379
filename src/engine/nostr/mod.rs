// Intercessio — Nostr Connect Provider
//
// One SessionProvider per pairing session. It owns the relay WebSocket
// loops for that session, decodes inbound NIP-46 request envelopes
// (kind 24133, NIP-04 or NIP-44 encrypted), answers protocol-level
// requests itself (connect, ping, get_public_key, nip04/nip44 crypto),
// and surfaces signing requests to the session manager as a
// ProviderActivity stream — each sign request carries a oneshot responder
// the manager resolves with the policy verdict.
//
// Protocol:
//   - NIP-01: relay subscription + publishing
//   - NIP-46: request/response envelopes, bunker & nostrconnect pairing
//   - NIP-04 (AES-256-CBC) and NIP-44 v2 (ChaCha20 + HMAC-SHA256) payloads;
//     responses mirror whichever encryption the client used
//   - Events signed with secp256k1 Schnorr (BIP-340) via the k256 crate
//
// Security:
//   - The session secret key stays inside the provider, zeroized on drop
//   - Requests from unpaired peers are refused before dispatch
//   - Inbound envelopes are id- and signature-verified

pub(crate) mod crypto;
mod relay;

use crate::atoms::constants::NOSTR_CONNECT_KIND;
use crate::atoms::error::{DaemonError, DaemonResult};
use crate::atoms::types::short_pubkey;
use log::{debug, info, warn};
use parking_lot::Mutex;
use relay::{RelayContext, RelayInbound};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use zeroize::Zeroizing;

// ── Adapter surface ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoOp {
    Encrypt,
    Decrypt,
}

/// Normalized provider callbacks, each tagged with the peer pubkey.
pub enum ProviderActivity {
    ConnectRequest { client: String },
    SignRequest { client: String, draft: Value, respond: oneshot::Sender<bool> },
    SignDecision { client: String, event_kind: u64, approved: bool },
    ClientConnected { client: String },
    ClientDisconnected { client: String },
    Nip04 { client: String, op: CryptoOp },
    Nip44 { client: String, op: CryptoOp },
}

/// How this session pairs with its peer.
pub enum PairingMode {
    /// We advertise a bunker URI; the client dials us with the secret.
    Bunker { secret: String },
    /// The client handed us a nostrconnect URI; we dial them.
    NostrConnect { client: String, secret: Option<String> },
}

/// Parsed form of a `nostrconnect://` URI.
pub struct NostrConnectInfo {
    pub client: String,
    pub relays: Vec<String>,
    pub secret: Option<String>,
}

// ── Provider ───────────────────────────────────────────────────────────

struct ProviderShared {
    session_id: String,
    secret_key: Zeroizing<Vec<u8>>,
    pubkey_hex: String,
    mode: PairingMode,
    stop: Arc<AtomicBool>,
    outbound: broadcast::Sender<String>,
    events: mpsc::UnboundedSender<ProviderActivity>,
    /// Peers allowed past `connect` (paired now or resumed from a record).
    authorized: Mutex<HashSet<String>>,
    /// Most recent paired peer; drives connect/disconnect events.
    paired: Mutex<Option<String>>,
    first_client: watch::Sender<Option<String>>,
    /// Cross-relay event dedup.
    seen: Mutex<HashSet<String>>,
}

pub struct SessionProvider {
    shared: Arc<ProviderShared>,
    relays: Vec<String>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    first_client_rx: watch::Receiver<Option<String>>,
}

impl SessionProvider {
    /// Build a provider and the activity stream the session manager
    /// consumes. Nothing touches the network until `start`.
    pub fn new(
        session_id: &str,
        secret_key: Zeroizing<Vec<u8>>,
        relays: Vec<String>,
        mode: PairingMode,
    ) -> DaemonResult<(Self, mpsc::UnboundedReceiver<ProviderActivity>)> {
        let pubkey_hex = crypto::hex_encode(&crypto::derive_pubkey(&secret_key)?);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, _) = broadcast::channel(64);
        let (first_tx, first_rx) = watch::channel(None);

        let shared = Arc::new(ProviderShared {
            session_id: session_id.to_string(),
            secret_key,
            pubkey_hex,
            mode,
            stop: Arc::new(AtomicBool::new(false)),
            outbound: outbound_tx,
            events: events_tx,
            authorized: Mutex::new(HashSet::new()),
            paired: Mutex::new(None),
            first_client: first_tx,
            seen: Mutex::new(HashSet::new()),
        });
        Ok((
            SessionProvider {
                shared,
                relays,
                tasks: Mutex::new(Vec::new()),
                first_client_rx: first_rx,
            },
            events_rx,
        ))
    }

    /// Spawn the relay loops and the request dispatcher. For nostrconnect
    /// sessions this also completes pairing by acking the client's URI.
    pub async fn start(&self) -> DaemonResult<()> {
        if self.relays.is_empty() {
            return Err(DaemonError::provider("At least one relay is required"));
        }
        self.shared.stop.store(false, Ordering::Relaxed);

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let mut tasks = self.tasks.lock();
        for relay_url in &self.relays {
            let ctx = Arc::new(RelayContext {
                session_id: self.shared.session_id.clone(),
                signer_pubkey: self.shared.pubkey_hex.clone(),
                stop: Arc::clone(&self.shared.stop),
                inbound: inbound_tx.clone(),
                outbound: self.shared.outbound.clone(),
            });
            tasks.push(tokio::spawn(relay::relay_task(relay_url.clone(), ctx)));
        }
        tasks.push(tokio::spawn(dispatch_loop(Arc::clone(&self.shared), inbound_rx)));
        drop(tasks);

        if let PairingMode::NostrConnect { client, secret } = &self.shared.mode {
            // Pairing ack per NIP-46: a `connect` response carrying the
            // URI's secret (or "ack" when none was supplied).
            let client = client.clone();
            let result = secret.clone().unwrap_or_else(|| "ack".to_string());
            self.shared.authorized.lock().insert(client.clone());
            send_response(
                &self.shared,
                &client,
                false,
                &uuid::Uuid::new_v4().to_string(),
                Some(&result),
                None,
            );
            mark_paired(&self.shared, &client);
        }

        info!(
            "[nostr] Provider for session {} started on {} relay(s)",
            self.shared.session_id,
            self.relays.len()
        );
        Ok(())
    }

    /// Stop the relay loops and the dispatcher. Idempotent.
    pub async fn stop(&self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        let mut tasks = self.tasks.lock();
        for task in tasks.drain(..) {
            task.abort();
        }
        info!("[nostr] Provider for session {} stopped", self.shared.session_id);
    }

    /// The URI a bunker session advertises. Errors for nostrconnect mode.
    pub fn bunker_uri(&self) -> DaemonResult<String> {
        let PairingMode::Bunker { secret } = &self.shared.mode else {
            return Err(DaemonError::provider("Session has no bunker URI"));
        };
        let relay_params: Vec<String> = self
            .relays
            .iter()
            .map(|r| format!("relay={}", urlencoding::encode(r)))
            .collect();
        Ok(format!(
            "bunker://{}?{}&secret={}",
            self.shared.pubkey_hex,
            relay_params.join("&"),
            secret
        ))
    }

    /// Resolve once the first client completes pairing. Returns the peer
    /// pubkey, or None when the provider stops first.
    pub async fn wait_for_client(&self) -> Option<String> {
        let mut rx = self.first_client_rx.clone();
        loop {
            if let Some(client) = rx.borrow().clone() {
                return Some(client);
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Rebind a previously paired client without a fresh handshake.
    /// Used on boot so a restart is transparent to the peer.
    pub fn resume_client(&self, client: &str) {
        self.shared.authorized.lock().insert(client.to_string());
        *self.shared.paired.lock() = Some(client.to_string());
        let _ = self.shared.first_client.send(Some(client.to_string()));
        debug!(
            "[nostr] Session {} resumed client {}",
            self.shared.session_id,
            short_pubkey(client)
        );
    }
}

// ── URI parsing ────────────────────────────────────────────────────────

/// Parse `nostrconnect://<client-pubkey>?relay=…&secret=…&metadata=…`.
pub fn parse_nostr_connect_uri(uri: &str) -> DaemonResult<NostrConnectInfo> {
    let rest = uri
        .strip_prefix("nostrconnect://")
        .ok_or_else(|| DaemonError::provider("Not a nostrconnect URI"))?;
    let (client, query) = rest.split_once('?').unwrap_or((rest, ""));
    if crypto::hex_decode(client).map(|b| b.len() != 32).unwrap_or(true) {
        return Err(DaemonError::provider("nostrconnect URI has no valid client pubkey"));
    }

    let mut relays = Vec::new();
    let mut secret = None;
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "relay" => relays.push(value.to_string()),
            "secret" => secret = Some(value.to_string()),
            _ => {}
        }
    }
    Ok(NostrConnectInfo { client: client.to_string(), relays, secret })
}

// ── Request dispatch ───────────────────────────────────────────────────

async fn dispatch_loop(
    shared: Arc<ProviderShared>,
    mut inbound: mpsc::UnboundedReceiver<RelayInbound>,
) {
    let mut connected_relays: usize = 0;
    while let Some(message) = inbound.recv().await {
        if shared.stop.load(Ordering::Relaxed) {
            break;
        }
        match message {
            RelayInbound::Connected(_) => {
                connected_relays += 1;
                if connected_relays == 1 {
                    if let Some(client) = shared.paired.lock().clone() {
                        emit(&shared, ProviderActivity::ClientConnected { client });
                    }
                }
            }
            RelayInbound::Disconnected(_) => {
                connected_relays = connected_relays.saturating_sub(1);
                if connected_relays == 0 {
                    if let Some(client) = shared.paired.lock().clone() {
                        emit(&shared, ProviderActivity::ClientDisconnected { client });
                    }
                }
            }
            RelayInbound::Event(event) => {
                handle_envelope(&shared, event).await;
            }
        }
    }
}

async fn handle_envelope(shared: &Arc<ProviderShared>, event: Value) {
    let event_id = event["id"].as_str().unwrap_or("").to_string();
    if event_id.is_empty() {
        return;
    }
    {
        let mut seen = shared.seen.lock();
        if !seen.insert(event_id.clone()) {
            return;
        }
        // Limit dedup set size
        if seen.len() > 10_000 {
            seen.clear();
            seen.insert(event_id);
        }
    }

    let sender = event["pubkey"].as_str().unwrap_or("").to_string();
    if sender.is_empty() || sender == shared.pubkey_hex {
        return;
    }
    if let Err(e) = crypto::verify_event(&event) {
        warn!("[nostr] Dropping unverifiable envelope from {}: {}", short_pubkey(&sender), e);
        return;
    }

    let raw_content = event["content"].as_str().unwrap_or("");
    let via_nip04 = crypto::looks_like_nip04(raw_content);
    let decrypted = if via_nip04 {
        crypto::nip04_decrypt(&shared.secret_key, &sender, raw_content)
    } else {
        crypto::nip44_decrypt(&shared.secret_key, &sender, raw_content)
    };
    let content = match decrypted {
        Ok(c) => c,
        Err(e) => {
            warn!("[nostr] Failed to decrypt request from {}: {}", short_pubkey(&sender), e);
            return;
        }
    };

    let request: Value = match serde_json::from_str(&content) {
        Ok(v) => v,
        Err(e) => {
            warn!("[nostr] Malformed request payload from {}: {}", short_pubkey(&sender), e);
            return;
        }
    };
    let request_id = request["id"].as_str().unwrap_or("").to_string();
    let method = request["method"].as_str().unwrap_or("").to_string();
    let params: Vec<Value> = request["params"].as_array().cloned().unwrap_or_default();
    if request_id.is_empty() || method.is_empty() {
        return;
    }

    debug!(
        "[nostr] {} request from {} (session {})",
        method,
        short_pubkey(&sender),
        shared.session_id
    );
    handle_request(shared, &sender, via_nip04, &request_id, &method, params).await;
}

async fn handle_request(
    shared: &Arc<ProviderShared>,
    sender: &str,
    via_nip04: bool,
    request_id: &str,
    method: &str,
    params: Vec<Value>,
) {
    // Pairing is the only request an unknown peer may make.
    if method == "connect" {
        handle_connect(shared, sender, via_nip04, request_id, params);
        return;
    }
    if !shared.authorized.lock().contains(sender) {
        warn!("[nostr] Refusing {} from unpaired peer {}", method, short_pubkey(sender));
        send_response(shared, sender, via_nip04, request_id, None, Some("Unauthorized"));
        return;
    }

    match method {
        "ping" => {
            send_response(shared, sender, via_nip04, request_id, Some("pong"), None);
        }
        "get_public_key" => {
            send_response(shared, sender, via_nip04, request_id, Some(&shared.pubkey_hex), None);
        }
        "sign_event" => {
            handle_sign_event(shared, sender, via_nip04, request_id, params).await;
        }
        "nip04_encrypt" | "nip04_decrypt" | "nip44_encrypt" | "nip44_decrypt" => {
            handle_crypto(shared, sender, via_nip04, request_id, method, params);
        }
        _ => {
            send_response(shared, sender, via_nip04, request_id, None, Some("Unsupported method"));
        }
    }
}

fn handle_connect(
    shared: &Arc<ProviderShared>,
    sender: &str,
    via_nip04: bool,
    request_id: &str,
    params: Vec<Value>,
) {
    let offered_secret = params.get(1).and_then(|s| s.as_str()).unwrap_or("");
    let already_authorized = shared.authorized.lock().contains(sender);
    let accepted = match &shared.mode {
        PairingMode::Bunker { secret } => already_authorized || offered_secret == secret,
        // nostrconnect pairing happened at start; a later connect from the
        // same peer is a benign re-handshake.
        PairingMode::NostrConnect { .. } => already_authorized,
    };
    if !accepted {
        warn!("[nostr] Pairing refused for {} (bad secret)", short_pubkey(sender));
        send_response(shared, sender, via_nip04, request_id, None, Some("Invalid secret"));
        return;
    }

    emit(shared, ProviderActivity::ConnectRequest { client: sender.to_string() });
    shared.authorized.lock().insert(sender.to_string());
    send_response(shared, sender, via_nip04, request_id, Some("ack"), None);
    mark_paired(shared, sender);
}

async fn handle_sign_event(
    shared: &Arc<ProviderShared>,
    sender: &str,
    via_nip04: bool,
    request_id: &str,
    params: Vec<Value>,
) {
    // Drafts arrive JSON-stringified; tolerate a bare object too.
    let draft = match params.first() {
        Some(Value::String(raw)) => serde_json::from_str::<Value>(raw).ok(),
        Some(obj @ Value::Object(_)) => Some(obj.clone()),
        _ => None,
    };
    let Some(draft) = draft else {
        send_response(shared, sender, via_nip04, request_id, None, Some("Malformed draft event"));
        return;
    };
    let event_kind = draft.get("kind").and_then(|k| k.as_u64()).unwrap_or(0);

    let (respond_tx, respond_rx) = oneshot::channel();
    emit(
        shared,
        ProviderActivity::SignRequest {
            client: sender.to_string(),
            draft: draft.clone(),
            respond: respond_tx,
        },
    );

    // Suspends until the policy pipeline (and possibly a human) decides.
    // A dropped responder means the session is shutting down: deny.
    let approved = respond_rx.await.unwrap_or(false);

    if approved {
        match crypto::sign_draft(&shared.secret_key, &shared.pubkey_hex, &draft) {
            Ok(signed) => {
                let serialized = signed.to_string();
                send_response(shared, sender, via_nip04, request_id, Some(&serialized), None);
            }
            Err(e) => {
                warn!("[nostr] Failed to sign approved draft: {e}");
                send_response(shared, sender, via_nip04, request_id, None, Some("Signing failed"));
            }
        }
    } else {
        send_response(shared, sender, via_nip04, request_id, None, Some("Request rejected"));
    }
    emit(
        shared,
        ProviderActivity::SignDecision { client: sender.to_string(), event_kind, approved },
    );
}

fn handle_crypto(
    shared: &Arc<ProviderShared>,
    sender: &str,
    via_nip04: bool,
    request_id: &str,
    method: &str,
    params: Vec<Value>,
) {
    let peer = params.first().and_then(|p| p.as_str()).unwrap_or("");
    let payload = params.get(1).and_then(|p| p.as_str()).unwrap_or("");
    if peer.is_empty() || payload.is_empty() {
        send_response(shared, sender, via_nip04, request_id, None, Some("Missing parameters"));
        return;
    }

    let result = match method {
        "nip04_encrypt" => crypto::nip04_encrypt(&shared.secret_key, peer, payload),
        "nip04_decrypt" => crypto::nip04_decrypt(&shared.secret_key, peer, payload),
        "nip44_encrypt" => crypto::nip44_encrypt(&shared.secret_key, peer, payload),
        "nip44_decrypt" => crypto::nip44_decrypt(&shared.secret_key, peer, payload),
        _ => unreachable!("gated by caller"),
    };
    let op = if method.ends_with("encrypt") { CryptoOp::Encrypt } else { CryptoOp::Decrypt };

    match result {
        Ok(output) => {
            send_response(shared, sender, via_nip04, request_id, Some(&output), None);
        }
        Err(e) => {
            debug!("[nostr] {} failed for {}: {}", method, short_pubkey(sender), e);
            send_response(shared, sender, via_nip04, request_id, None, Some("Operation failed"));
        }
    }
    let activity = if method.starts_with("nip04") {
        ProviderActivity::Nip04 { client: sender.to_string(), op }
    } else {
        ProviderActivity::Nip44 { client: sender.to_string(), op }
    };
    emit(shared, activity);
}

// ── Plumbing ───────────────────────────────────────────────────────────

fn mark_paired(shared: &Arc<ProviderShared>, client: &str) {
    let is_new = {
        let mut paired = shared.paired.lock();
        let changed = paired.as_deref() != Some(client);
        *paired = Some(client.to_string());
        changed
    };
    let _ = shared.first_client.send(Some(client.to_string()));
    if is_new {
        emit(shared, ProviderActivity::ClientConnected { client: client.to_string() });
    }
}

fn emit(shared: &Arc<ProviderShared>, activity: ProviderActivity) {
    if shared.events.send(activity).is_err() {
        // Session manager dropped the stream; the provider is shutting down.
        shared.stop.store(true, Ordering::Relaxed);
    }
}

/// Encrypt, sign, and broadcast a NIP-46 response envelope, mirroring the
/// encryption the client used for the request.
fn send_response(
    shared: &Arc<ProviderShared>,
    client: &str,
    via_nip04: bool,
    request_id: &str,
    result: Option<&str>,
    error: Option<&str>,
) {
    let payload = json!({
        "id": request_id,
        "result": result,
        "error": error,
    })
    .to_string();

    let encrypted = if via_nip04 {
        crypto::nip04_encrypt(&shared.secret_key, client, &payload)
    } else {
        crypto::nip44_encrypt(&shared.secret_key, client, &payload)
    };
    let encrypted = match encrypted {
        Ok(c) => c,
        Err(e) => {
            warn!("[nostr] Failed to encrypt response for {}: {}", short_pubkey(client), e);
            return;
        }
    };

    let tags = json!([["p", client]]);
    match crypto::sign_event(&shared.secret_key, &shared.pubkey_hex, NOSTR_CONNECT_KIND, &tags, &encrypted) {
        Ok(event) => {
            let publish = json!(["EVENT", event]);
            // No receivers means no relay is connected yet; queued copies
            // live in each relay task's broadcast subscription.
            let _ = shared.outbound.send(publish.to_string());
        }
        Err(e) => warn!("[nostr] Failed to sign response: {e}"),
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> Zeroizing<Vec<u8>> {
        Zeroizing::new(
            crypto::hex_decode("e8f32e723decf4051aefac8e2c93c9c5b214313817cdb01a1494b917c8436b35")
                .unwrap(),
        )
    }

    #[test]
    fn bunker_uri_contains_relays_and_secret() {
        let (provider, _events) = SessionProvider::new(
            "s1",
            test_key(),
            vec!["wss://relay.damus.io".into(), "wss://nos.lol".into()],
            PairingMode::Bunker { secret: "pair-secret".into() },
        )
        .unwrap();

        let uri = provider.bunker_uri().unwrap();
        assert!(uri.starts_with("bunker://"));
        assert!(uri.contains("relay=wss%3A%2F%2Frelay.damus.io"));
        assert!(uri.contains("relay=wss%3A%2F%2Fnos.lol"));
        assert!(uri.ends_with("secret=pair-secret"));
    }

    #[test]
    fn nostr_connect_mode_has_no_bunker_uri() {
        let client = "aa".repeat(32);
        let (provider, _events) = SessionProvider::new(
            "s1",
            test_key(),
            vec!["wss://relay.damus.io".into()],
            PairingMode::NostrConnect { client, secret: None },
        )
        .unwrap();
        assert!(provider.bunker_uri().is_err());
    }

    #[test]
    fn parse_nostr_connect_uri_extracts_fields() {
        let client = "ab".repeat(32);
        let uri = format!(
            "nostrconnect://{client}?relay=wss%3A%2F%2Frelay.nsec.app&relay=wss%3A%2F%2Fnos.lol&secret=s3cret&metadata=%7B%22name%22%3A%22Test%22%7D"
        );
        let info = parse_nostr_connect_uri(&uri).unwrap();
        assert_eq!(info.client, client);
        assert_eq!(info.relays, vec!["wss://relay.nsec.app", "wss://nos.lol"]);
        assert_eq!(info.secret.as_deref(), Some("s3cret"));
    }

    #[test]
    fn parse_nostr_connect_uri_rejects_garbage() {
        assert!(parse_nostr_connect_uri("bunker://abcdef").is_err());
        assert!(parse_nostr_connect_uri("nostrconnect://not-hex?relay=x").is_err());
    }

    #[tokio::test]
    async fn resume_client_satisfies_wait_for_client() {
        let (provider, _events) = SessionProvider::new(
            "s1",
            test_key(),
            vec!["wss://relay.damus.io".into()],
            PairingMode::Bunker { secret: "pair".into() },
        )
        .unwrap();

        provider.resume_client("clientpk");
        assert_eq!(provider.wait_for_client().await.as_deref(), Some("clientpk"));
    }
}
