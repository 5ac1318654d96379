// ── Intercessio Atoms: Error Types ─────────────────────────────────────────
// Single canonical error enum for the daemon, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by domain (I/O, DB, Vault, Provider…).
//   • The `#[from]` attribute wires std/external error conversions automatically.
//   • The control plane converts any `DaemonError` into `{ok:false, error}`
//     via `Display`, so messages double as user-facing text.
//   • No variant carries secret material (private keys, vault contents).

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DaemonError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// SQLite / rusqlite database failure.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// OS keychain / credential store failure.
    #[error("Keyring error: {0}")]
    Keyring(String),

    /// Secret vault failure (either backend; non-secret detail only).
    #[error("Vault error: {0}")]
    Vault(String),

    /// Signing, encryption or key-derivation failure.
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Nostr provider start/resume/stop failure.
    #[error("Provider error: {0}")]
    Provider(String),

    /// A template id was explicitly selected but is absent from the registry.
    #[error("Unknown policy: {0}")]
    UnknownPolicy(String),

    /// Session, key, or approval id does not resolve.
    #[error("{0}")]
    NotFound(String),

    /// Malformed control-plane request.
    #[error("{0}")]
    Protocol(String),

    /// Daemon or session configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Catch-all for errors that do not yet have a dedicated variant.
    /// Prefer adding a specific variant over using this in new code.
    #[error("{0}")]
    Other(String),
}

// ── Convenience constructors ───────────────────────────────────────────────

impl DaemonError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider(message.into())
    }

    pub fn crypto(message: impl Into<String>) -> Self {
        Self::Crypto(message.into())
    }
}

// ── Migration bridge: String → DaemonError ─────────────────────────────────
// Allows `?` and `.into()` on plain string errors without boilerplate.

impl From<String> for DaemonError {
    fn from(s: String) -> Self {
        DaemonError::Other(s)
    }
}

impl From<&str> for DaemonError {
    fn from(s: &str) -> Self {
        DaemonError::Other(s.to_string())
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All daemon operations should return this type.
/// At the control-plane boundary, convert with `.to_string()`.
pub type DaemonResult<T> = Result<T, DaemonError>;
