// ── Intercessio Atoms: Constants ───────────────────────────────────────────
// All named constants for the crate live here.
// Rationale: collecting constants in one place eliminates magic strings,
// makes auditing easier, and keeps every layer's code self-documenting.

// ── Secret vault identifiers ───────────────────────────────────────────────
// The keyring entry is keyed on (service, account) — changing the service
// name would make every stored key unreachable. Treat as a stable identifier.
pub const KEYRING_SERVICE: &str = "intercessio";
// Throwaway account used once at startup to decide whether the OS keyring
// backend is usable at all.
pub(crate) const KEYRING_PROBE_ACCOUNT: &str = "__vault-probe";

// ── Filesystem layout inside the config directory ─────────────────────────
pub const CONFIG_DIR_NAME: &str = ".intercessio";
pub const DB_FILE: &str = "intercessio.db";
pub const SOCKET_FILE: &str = "intercessio.sock";
pub const KEYS_FILE: &str = "keys.json";
pub const STATE_FILE: &str = "state.json";
pub const SECRETS_FILE: &str = "secrets.json";
pub const SALT_FILE: &str = "salt";

// ── Nostr event kinds ──────────────────────────────────────────────────────
/// NIP-46 remote-signing request/response envelope.
pub const NOSTR_CONNECT_KIND: u64 = 24133;
/// NIP-42 client authentication ("login") events.
pub const LOGIN_KIND: u64 = 22242;
/// Short text note.
pub const NOTE_KIND: u64 = 1;
/// Profile metadata update.
pub const PROFILE_KIND: u64 = 0;

// ── Approval flow ──────────────────────────────────────────────────────────
/// How long a referred request waits for a human decision before expiring.
pub const DEFAULT_APPROVAL_TTL_SECS: u64 = 600;
/// Env override for the approval TTL (seconds).
pub const APPROVAL_TTL_ENV: &str = "INTERCESSIO_APPROVAL_TTL_SECS";

// ── Activity log ───────────────────────────────────────────────────────────
/// The dashboard only renders recent history; older entries are dropped.
pub const ACTIVITY_CAPACITY: usize = 200;

// ── Notifier (ntfy.sh protocol) ────────────────────────────────────────────
pub const NTFY_TOPIC_ENV: &str = "INTERCESSIO_NTFY_TOPIC";
pub const NTFY_TOPIC_FALLBACK_ENV: &str = "NTFY_TOPIC";
pub const NTFY_BASE_URL_ENV: &str = "NTFY_BASE_URL";
pub const NTFY_DEFAULT_BASE_URL: &str = "https://ntfy.sh";
pub const REVIEW_LINK_ENV: &str = "IC_LINK";
