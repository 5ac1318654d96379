// Intercessio Engine — Secret Vault
// Namespaced secret store keyed by account identifier. Two backends:
//
//   • OS keychain (macOS Keychain / Windows Credential Manager / Linux
//     Secret Service) via the `keyring` crate — preferred.
//   • Encrypted JSON file fallback for headless hosts: AES-256-CBC with a
//     key derived via scrypt from a per-machine identifier plus a random
//     salt stored next to the file.
//
// Contract: `put` is upsert-with-overwrite, `get` fails with NotFound when
// absent, `delete` is idempotent. Secrets never reach the log output or
// the control plane.

use crate::atoms::constants::{KEYRING_PROBE_ACCOUNT, KEYRING_SERVICE, SALT_FILE, SECRETS_FILE};
use crate::atoms::error::{DaemonError, DaemonResult};
use crate::atoms::types::StorageKind;
use base64::Engine;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

// ── Vault handle ───────────────────────────────────────────────────────────

pub struct SecretVault {
    backend: Backend,
}

enum Backend {
    Keyring,
    File(FileVault),
}

impl SecretVault {
    /// Open the vault, preferring the OS keyring. The keyring is probed
    /// once with a throwaway entry; any failure selects the encrypted-file
    /// backend for the lifetime of the process.
    pub fn open(dir: &Path) -> DaemonResult<Self> {
        if keyring_available() {
            info!("[vault] Using OS keyring backend");
            return Ok(SecretVault { backend: Backend::Keyring });
        }
        warn!("[vault] OS keyring unavailable — falling back to encrypted file");
        Self::open_encrypted_file(dir)
    }

    /// Open the vault with the encrypted-file backend unconditionally.
    /// Used by tests and by hosts that opt out of the keyring.
    pub fn open_encrypted_file(dir: &Path) -> DaemonResult<Self> {
        let vault = FileVault::open(dir)?;
        Ok(SecretVault { backend: Backend::File(vault) })
    }

    pub fn kind(&self) -> StorageKind {
        match self.backend {
            Backend::Keyring => StorageKind::NativeKeyring,
            Backend::File(_) => StorageKind::EncryptedFile,
        }
    }

    /// Store (or overwrite) a secret. Returns which backend holds it.
    pub fn put(&self, account: &str, secret: &str) -> DaemonResult<StorageKind> {
        match &self.backend {
            Backend::Keyring => {
                let entry = keyring::Entry::new(KEYRING_SERVICE, account)
                    .map_err(|e| DaemonError::Keyring(e.to_string()))?;
                entry
                    .set_password(secret)
                    .map_err(|e| DaemonError::Keyring(e.to_string()))?;
            }
            Backend::File(vault) => vault.put(account, secret)?,
        }
        Ok(self.kind())
    }

    /// Retrieve a secret. `NotFound` when the account has no entry.
    pub fn get(&self, account: &str) -> DaemonResult<Zeroizing<String>> {
        match &self.backend {
            Backend::Keyring => {
                let entry = keyring::Entry::new(KEYRING_SERVICE, account)
                    .map_err(|e| DaemonError::Keyring(e.to_string()))?;
                match entry.get_password() {
                    Ok(secret) => Ok(Zeroizing::new(secret)),
                    Err(keyring::Error::NoEntry) => {
                        Err(DaemonError::not_found(format!("No vault entry for {account}")))
                    }
                    Err(e) => Err(DaemonError::Keyring(e.to_string())),
                }
            }
            Backend::File(vault) => vault.get(account),
        }
    }

    /// Remove a secret. Succeeds when the account has no entry.
    pub fn delete(&self, account: &str) -> DaemonResult<()> {
        match &self.backend {
            Backend::Keyring => {
                let entry = keyring::Entry::new(KEYRING_SERVICE, account)
                    .map_err(|e| DaemonError::Keyring(e.to_string()))?;
                match entry.delete_credential() {
                    Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                    Err(e) => Err(DaemonError::Keyring(e.to_string())),
                }
            }
            Backend::File(vault) => vault.delete(account),
        }
    }
}

/// Probe the keyring with a write + delete. Headless Linux hosts without a
/// Secret Service agent fail here and fall back to the file backend.
fn keyring_available() -> bool {
    let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, KEYRING_PROBE_ACCOUNT) else {
        return false;
    };
    if entry.set_password("probe").is_err() {
        return false;
    }
    let _ = entry.delete_credential();
    true
}

// ── Encrypted-file backend ─────────────────────────────────────────────────

/// On-disk envelope: a random IV plus the AES-256-CBC ciphertext of the
/// serialized account → secret map.
#[derive(Serialize, Deserialize)]
struct VaultEnvelope {
    iv: String,
    data: String,
}

struct FileVault {
    secrets_path: PathBuf,
    key: Zeroizing<[u8; 32]>,
}

impl FileVault {
    fn open(dir: &Path) -> DaemonResult<Self> {
        std::fs::create_dir_all(dir)?;
        let salt = load_or_create_salt(&dir.join(SALT_FILE))?;
        let key = derive_file_key(&machine_identifier(), &salt)?;
        Ok(FileVault {
            secrets_path: dir.join(SECRETS_FILE),
            key,
        })
    }

    fn put(&self, account: &str, secret: &str) -> DaemonResult<()> {
        let mut map = self.load_map()?;
        map.insert(account.to_string(), secret.to_string());
        self.save_map(&map)
    }

    fn get(&self, account: &str) -> DaemonResult<Zeroizing<String>> {
        let map = self.load_map()?;
        map.get(account)
            .map(|s| Zeroizing::new(s.clone()))
            .ok_or_else(|| DaemonError::not_found(format!("No vault entry for {account}")))
    }

    fn delete(&self, account: &str) -> DaemonResult<()> {
        let mut map = self.load_map()?;
        if map.remove(account).is_some() {
            self.save_map(&map)?;
        }
        Ok(())
    }

    fn load_map(&self) -> DaemonResult<HashMap<String, String>> {
        if !self.secrets_path.exists() {
            return Ok(HashMap::new());
        }
        let raw = std::fs::read_to_string(&self.secrets_path)?;
        let envelope: VaultEnvelope = serde_json::from_str(&raw)?;
        let b64 = base64::engine::general_purpose::STANDARD;
        let iv = b64
            .decode(&envelope.iv)
            .map_err(|e| DaemonError::Vault(format!("Bad IV: {e}")))?;
        let ciphertext = b64
            .decode(&envelope.data)
            .map_err(|e| DaemonError::Vault(format!("Bad ciphertext: {e}")))?;
        if iv.len() != 16 {
            return Err(DaemonError::Vault(format!("Invalid IV length: {}", iv.len())));
        }
        let plaintext = Zeroizing::new(aes_cbc_decrypt(&self.key, &iv, &ciphertext)?);
        Ok(serde_json::from_slice(&plaintext)?)
    }

    fn save_map(&self, map: &HashMap<String, String>) -> DaemonResult<()> {
        let plaintext = Zeroizing::new(serde_json::to_vec(map)?);
        let iv: [u8; 16] = rand::random();
        let ciphertext = aes_cbc_encrypt(&self.key, &iv, &plaintext)?;
        let b64 = base64::engine::general_purpose::STANDARD;
        let envelope = VaultEnvelope {
            iv: b64.encode(iv),
            data: b64.encode(ciphertext),
        };
        write_private_atomic(&self.secrets_path, serde_json::to_string(&envelope)?.as_bytes())
    }
}

// ── Key derivation ─────────────────────────────────────────────────────────

fn load_or_create_salt(path: &Path) -> DaemonResult<Vec<u8>> {
    if path.exists() {
        return Ok(std::fs::read(path)?);
    }
    let salt: [u8; 16] = rand::random();
    write_private_atomic(path, &salt)?;
    Ok(salt.to_vec())
}

fn derive_file_key(machine_id: &str, salt: &[u8]) -> DaemonResult<Zeroizing<[u8; 32]>> {
    let params = scrypt::Params::new(15, 8, 1, 32)
        .map_err(|e| DaemonError::Crypto(format!("scrypt params: {e}")))?;
    let mut key = Zeroizing::new([0u8; 32]);
    scrypt::scrypt(machine_id.as_bytes(), salt, &params, key.as_mut())
        .map_err(|e| DaemonError::Crypto(format!("scrypt: {e}")))?;
    Ok(key)
}

/// A stable per-machine string. Not secret by itself — the co-located salt
/// ensures the derived key is unique per installation.
fn machine_identifier() -> String {
    for candidate in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
        if let Ok(id) = std::fs::read_to_string(candidate) {
            let id = id.trim();
            if !id.is_empty() {
                return id.to_string();
            }
        }
    }
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "intercessio-host".to_string())
}

// ── AES-256-CBC helpers ────────────────────────────────────────────────────

fn aes_cbc_encrypt(key: &[u8; 32], iv: &[u8; 16], plaintext: &[u8]) -> DaemonResult<Vec<u8>> {
    use cbc::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};

    let mut buf = vec![0u8; plaintext.len() + 16];
    buf[..plaintext.len()].copy_from_slice(plaintext);
    let ciphertext = cbc::Encryptor::<aes::Aes256>::new_from_slices(key, iv)
        .map_err(|e| DaemonError::Crypto(e.to_string()))?
        .encrypt_padded_mut::<Pkcs7>(&mut buf, plaintext.len())
        .map_err(|e| DaemonError::Crypto(e.to_string()))?;
    Ok(ciphertext.to_vec())
}

fn aes_cbc_decrypt(key: &[u8; 32], iv: &[u8], ciphertext: &[u8]) -> DaemonResult<Vec<u8>> {
    use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};

    let mut buf = ciphertext.to_vec();
    let plaintext = cbc::Decryptor::<aes::Aes256>::new_from_slices(key, iv)
        .map_err(|e| DaemonError::Crypto(e.to_string()))?
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map_err(|e| DaemonError::Crypto(e.to_string()))?;
    Ok(plaintext.to_vec())
}

/// Write-to-temp-then-rename with owner-only permissions on unix.
fn write_private_atomic(path: &Path, contents: &[u8]) -> DaemonResult<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

// ── Tests ──────────────────────────────────────────────────────────────────
