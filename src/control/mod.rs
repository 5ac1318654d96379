// Intercessio Control Plane — local socket IPC surface.
// A filesystem socket inside the config directory; each connection carries
// exactly one newline-terminated JSON request and receives one
// newline-terminated JSON response. Requests are a tagged union; responses
// are `{ok:true, …}` or `{ok:false, error}`.
//
// Single-instance guarantee: before binding we dial the socket as a
// client. A successful connect means another daemon owns it and this
// process exits cleanly; connection-refused means a stale file from a
// crashed run, which we unlink and rebind.

use crate::atoms::error::{DaemonError, DaemonResult};
use crate::engine::activity::ActivityLog;
use crate::engine::approval::ApprovalManager;
use crate::engine::keys::KeyStore;
use crate::engine::manager::{SessionManager, StartBunkerArgs, StartNostrConnectArgs};
use crate::engine::store::SessionStore;
use log::{info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

// ── Daemon handles ─────────────────────────────────────────────────────

/// Everything the dispatcher reaches: the singletons owned by main.
pub struct Daemon {
    pub store: Arc<SessionStore>,
    pub keys: Arc<KeyStore>,
    pub activity: Arc<ActivityLog>,
    pub approvals: Arc<ApprovalManager>,
    pub manager: Arc<SessionManager>,
    pub shutdown: mpsc::UnboundedSender<()>,
}

// ── Request union ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ControlRequest {
    Ping,
    ListSessions,
    ListActivity,
    ListApprovals,
    ResolveApproval {
        /// Canonical shape is `{id, decision}`; the legacy
        /// `{approvalId, approved}` field names are accepted as aliases.
        #[serde(alias = "approvalId")]
        id: String,
        #[serde(default)]
        decision: Option<String>,
        #[serde(default)]
        approved: Option<bool>,
    },
    StopSession {
        session_id: String,
    },
    DeleteSession {
        session_id: String,
    },
    RenameSession {
        session_id: String,
        alias: String,
    },
    UpdateSessionTemplate {
        session_id: String,
        template: String,
    },
    StartBunker {
        key_id: String,
        #[serde(default)]
        alias: String,
        #[serde(default)]
        relays: Vec<String>,
        #[serde(default)]
        secret: Option<String>,
        #[serde(default)]
        auto_approve: bool,
        #[serde(default)]
        template: Option<String>,
    },
    StartNostrConnect {
        key_id: String,
        #[serde(default)]
        alias: String,
        #[serde(default)]
        relays: Vec<String>,
        uri: String,
        #[serde(default)]
        auto_approve: bool,
        #[serde(default)]
        template: Option<String>,
    },
    Shutdown,
}

/// Parse one request line. Unknown tags map to the fixed "Unknown request"
/// message; everything else surfaces the parse error verbatim.
pub fn parse_request(line: &str) -> Result<ControlRequest, String> {
    let value: Value = serde_json::from_str(line.trim()).map_err(|e| e.to_string())?;
    match serde_json::from_value::<ControlRequest>(value) {
        Ok(request) => Ok(request),
        Err(e) => {
            let message = e.to_string();
            if message.contains("unknown variant") {
                Err("Unknown request".to_string())
            } else {
                Err(message)
            }
        }
    }
}

// ── Dispatch ───────────────────────────────────────────────────────────

fn ok(mut extra: serde_json::Map<String, Value>) -> Value {
    extra.insert("ok".into(), json!(true));
    Value::Object(extra)
}

fn ok_empty() -> Value {
    json!({"ok": true})
}

fn err(message: impl std::fmt::Display) -> Value {
    json!({"ok": false, "error": message.to_string()})
}

fn payload(key: &str, value: Value) -> Value {
    let mut map = serde_json::Map::new();
    map.insert(key.to_string(), value);
    ok(map)
}

pub async fn dispatch(daemon: &Daemon, request: ControlRequest) -> Value {
    match request {
        ControlRequest::Ping => json!({"ok": true, "pong": true}),

        ControlRequest::ListSessions => match daemon.manager.list(false) {
            Ok(sessions) => payload("sessions", json!(sessions)),
            Err(e) => err(e),
        },

        ControlRequest::ListActivity => payload("activity", json!(daemon.activity.list())),

        ControlRequest::ListApprovals => match daemon.approvals.list_pending() {
            Ok(approvals) => payload("approvals", json!(approvals)),
            Err(e) => err(e),
        },

        ControlRequest::ResolveApproval { id, decision, approved } => {
            let verdict = match (decision.as_deref(), approved) {
                (Some("approve"), _) => true,
                (Some("reject"), _) => false,
                (Some(other), _) => {
                    return err(format!("Invalid decision: {other}"));
                }
                (None, Some(flag)) => flag,
                (None, None) => return err("Missing decision"),
            };
            match daemon.approvals.resolve(&id, verdict) {
                Ok(()) => ok_empty(),
                Err(DaemonError::NotFound(_)) => err("Approval not found"),
                Err(e) => err(e),
            }
        }

        ControlRequest::StopSession { session_id } => {
            match daemon.manager.stop(&session_id, false).await {
                Ok(()) => ok_empty(),
                Err(e) => err(e),
            }
        }

        ControlRequest::DeleteSession { session_id } => {
            match daemon.manager.stop(&session_id, true).await {
                Ok(()) => ok_empty(),
                Err(e) => err(e),
            }
        }

        ControlRequest::RenameSession { session_id, alias } => {
            match daemon.manager.rename(&session_id, &alias) {
                Ok(()) => ok_empty(),
                Err(e) => err(e),
            }
        }

        ControlRequest::UpdateSessionTemplate { session_id, template } => {
            match daemon.manager.update_template(&session_id, &template) {
                Ok(()) => ok_empty(),
                Err(e) => err(e),
            }
        }

        ControlRequest::StartBunker { key_id, alias, relays, secret, auto_approve, template } => {
            let args = StartBunkerArgs { key_id, alias, relays, secret, auto_approve, template };
            match daemon.manager.start_bunker(args).await {
                Ok((session_id, bunker_uri)) => {
                    json!({"ok": true, "sessionId": session_id, "bunkerUri": bunker_uri})
                }
                Err(e) => err(e),
            }
        }

        ControlRequest::StartNostrConnect {
            key_id,
            alias,
            relays,
            uri,
            auto_approve,
            template,
        } => {
            let args =
                StartNostrConnectArgs { key_id, alias, relays, uri, auto_approve, template };
            match daemon.manager.start_nostr_connect(args).await {
                Ok(session_id) => json!({"ok": true, "sessionId": session_id}),
                Err(e) => err(e),
            }
        }

        ControlRequest::Shutdown => {
            info!("[control] Shutdown requested");
            let _ = daemon.shutdown.send(());
            ok_empty()
        }
    }
}

// ── Socket server ──────────────────────────────────────────────────────

/// Bind the control socket, honoring the single-instance guarantee.
/// `Ok(None)` means another daemon is already serving.
pub async fn bind_socket(path: &Path) -> DaemonResult<Option<UnixListener>> {
    if path.exists() {
        match UnixStream::connect(path).await {
            Ok(_) => {
                info!("[control] Another daemon owns {:?}", path);
                return Ok(None);
            }
            Err(_) => {
                // Stale socket from a crashed run
                std::fs::remove_file(path).ok();
            }
        }
    }
    let listener = UnixListener::bind(path)?;
    info!("[control] Listening on {:?}", path);
    Ok(Some(listener))
}

/// Accept loop. One spawned handler per connection; each handler serves a
/// single request/response exchange.
pub async fn serve(listener: UnixListener, daemon: Arc<Daemon>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let daemon = Arc::clone(&daemon);
                tokio::spawn(async move {
                    handle_connection(stream, daemon).await;
                });
            }
            Err(e) => {
                warn!("[control] Accept failed: {e}");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, daemon: Arc<Daemon>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    let response = match reader.read_line(&mut line).await {
        Ok(0) => return, // peer closed without a request
        Ok(_) => match parse_request(&line) {
            Ok(request) => dispatch(&daemon, request).await,
            Err(message) => err(message),
        },
        Err(e) => err(format!("Read failed: {e}")),
    };

    let mut out = response.to_string();
    out.push('\n');
    if let Err(e) = write_half.write_all(out.as_bytes()).await {
        warn!("[control] Failed to write response: {e}");
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kebab_tags_and_camel_fields() {
        let request = parse_request(
            r#"{"type":"start-bunker","keyId":"k1","alias":"laptop","relays":["wss://nos.lol"],"autoApprove":true}"#,
        )
        .unwrap();
        match request {
            ControlRequest::StartBunker { key_id, alias, relays, auto_approve, .. } => {
                assert_eq!(key_id, "k1");
                assert_eq!(alias, "laptop");
                assert_eq!(relays, vec!["wss://nos.lol"]);
                assert!(auto_approve);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_is_fixed_message() {
        assert_eq!(parse_request(r#"{"type":"frobnicate"}"#).unwrap_err(), "Unknown request");
    }

    #[test]
    fn malformed_json_surfaces_parse_error() {
        let message = parse_request("{not json").unwrap_err();
        assert_ne!(message, "Unknown request");
        assert!(!message.is_empty());
    }

    #[test]
    fn resolve_approval_accepts_both_shapes() {
        let canonical =
            parse_request(r#"{"type":"resolve-approval","id":"t1","decision":"approve"}"#).unwrap();
        match canonical {
            ControlRequest::ResolveApproval { id, decision, approved } => {
                assert_eq!(id, "t1");
                assert_eq!(decision.as_deref(), Some("approve"));
                assert_eq!(approved, None);
            }
            other => panic!("wrong variant: {other:?}"),
        }

        let legacy =
            parse_request(r#"{"type":"resolve-approval","approvalId":"t2","approved":false}"#)
                .unwrap();
        match legacy {
            ControlRequest::ResolveApproval { id, decision, approved } => {
                assert_eq!(id, "t2");
                assert_eq!(decision, None);
                assert_eq!(approved, Some(false));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn ping_parses() {
        assert!(matches!(parse_request(r#"{"type":"ping"}"#), Ok(ControlRequest::Ping)));
    }
}
