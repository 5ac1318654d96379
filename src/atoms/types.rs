// ── Intercessio Atoms: Core Data Model ─────────────────────────────────────
// The types every daemon layer shares: key metadata, session records,
// approval tasks, activity entries, and policy decisions.
//
// Serde note: everything here may cross the control-plane boundary, so all
// structs serialize with camelCase field names and kebab-case enum tags.
// The session store maps these to columns by hand (see engine/store).

use serde::{Deserialize, Serialize};

// ── Key metadata ───────────────────────────────────────────────────────────

/// Which backend physically holds a key's secret material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageKind {
    NativeKeyring,
    EncryptedFile,
}

impl StorageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::NativeKeyring => "native-keyring",
            StorageKind::EncryptedFile => "encrypted-file",
        }
    }
}

/// One entry in `keys.json`. The secret itself lives in the vault under
/// `vault_account`; this record never changes after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMetadata {
    /// Opaque short identifier, unique across the key list.
    pub id: String,
    /// Display string chosen by the user.
    pub label: String,
    /// Bech32-encoded public key, derived from the secret. Never changes.
    pub npub: String,
    /// ISO-8601 creation timestamp.
    pub created_at: String,
    /// Identifier used to retrieve the secret from the vault.
    pub vault_account: String,
    pub storage_kind: StorageKind,
}

// ── Sessions ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionType {
    Bunker,
    NostrConnect,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Bunker => "bunker",
            SessionType::NostrConnect => "nostr-connect",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bunker" => Some(SessionType::Bunker),
            "nostr-connect" => Some(SessionType::NostrConnect),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Waiting,
    Connected,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Waiting => "waiting",
            SessionStatus::Connected => "connected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(SessionStatus::Waiting),
            "connected" => Some(SessionStatus::Connected),
            _ => None,
        }
    }
}

/// Durable state of one pairing session. The session store row is the
/// source of truth; the runtime keeps a working copy that is written back
/// on every transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    pub key_id: String,
    pub alias: String,
    /// Normalized, deduplicated relay URLs (wss://host[/path], no trailing slash).
    pub relays: Vec<String>,
    /// Bunker pairing shared secret. Absent for nostr-connect sessions.
    /// Never serialized over the control plane.
    #[serde(skip_serializing, default)]
    pub secret: Option<String>,
    /// Bunker URI we advertise, or the nostrconnect URI the client supplied.
    pub uri: Option<String>,
    pub auto_approve: bool,
    pub status: SessionStatus,
    /// Public key of the most recent peer, once pairing completed.
    pub last_client: Option<String>,
    /// Epoch milliseconds.
    pub created_at: i64,
    pub updated_at: i64,
    /// Inactive sessions keep their row but are never resumed on boot.
    pub active: bool,
    /// Policy id. Unknown ids fall back to the registry default at load time.
    pub template: String,
}

// ── Approval tasks ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ApprovalStatus::Pending),
            "approved" => Some(ApprovalStatus::Approved),
            "rejected" => Some(ApprovalStatus::Rejected),
            "expired" => Some(ApprovalStatus::Expired),
            _ => None,
        }
    }
}

/// Durable record of a suspended REFER decision. Status is monotonic:
/// any transition out of `pending` is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalTask {
    pub id: String,
    pub session_id: String,
    pub session_alias: String,
    pub session_type: SessionType,
    /// Peer public key that submitted the request.
    pub client: String,
    pub event_kind: u64,
    /// Short human-readable description of the draft.
    pub event_summary: String,
    pub policy_id: String,
    pub policy_label: String,
    /// The signing-request payload, verbatim.
    pub draft: serde_json::Value,
    /// Epoch milliseconds.
    pub created_at: i64,
    pub expires_at: i64,
    pub status: ApprovalStatus,
}

// ── Activity log ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActivityKind {
    SessionStart,
    SessionStop,
    SessionUpdate,
    ProviderConnect,
    ProviderDisconnect,
    SignRequest,
    SignResult,
    Nip04,
    Nip44,
}

/// Ephemeral observation record for the dashboard. Not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    #[serde(default)]
    pub id: String,
    /// Epoch milliseconds. Stamped by the log when zero.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub session_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub client: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metadata: Option<serde_json::Value>,
}

// ── Policy evaluation ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Sign,
    Refer,
    Reject,
}

/// The session fields a policy may inspect. Kept by value so evaluation
/// cannot reach back into runtime state.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: String,
    pub alias: String,
    pub session_type: SessionType,
}

/// Everything a policy sees: the draft event, the requesting peer, and a
/// summary of the owning session.
#[derive(Debug)]
pub struct PolicyContext<'a> {
    pub event: &'a serde_json::Value,
    pub client: &'a str,
    pub session: &'a SessionSummary,
}

impl PolicyContext<'_> {
    /// Kind of the draft event, or u64::MAX when absent/malformed so that
    /// kind-gated policies fail closed.
    pub fn event_kind(&self) -> u64 {
        self.event.get("kind").and_then(|k| k.as_u64()).unwrap_or(u64::MAX)
    }
}

// ── Shared helpers ─────────────────────────────────────────────────────────

/// Current time as epoch milliseconds — the timestamp unit used across the
/// session store, approval tasks, and activity entries.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Shorten a pubkey for logs and human-facing summaries: "abcd1234…wxyz".
pub fn short_pubkey(pk: &str) -> String {
    if pk.len() <= 12 {
        pk.to_string()
    } else {
        format!("{}…{}", &pk[..8], &pk[pk.len() - 4..])
    }
}
