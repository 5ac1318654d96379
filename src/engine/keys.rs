// Intercessio Engine — Key Metadata Store
// Two JSON documents under the config directory: `keys.json` (array of
// KeyMetadata) and `state.json` (the active-key pointer). Reads return
// empty on a missing file; writes go through write-to-temp-then-rename.
// Secret material never touches these files — it lives in the vault under
// each entry's `vault_account`.

use crate::atoms::constants::{KEYS_FILE, STATE_FILE};
use crate::atoms::error::{DaemonError, DaemonResult};
use crate::atoms::types::KeyMetadata;
use crate::engine::nostr::crypto;
use crate::engine::vault::SecretVault;
use log::info;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zeroize::Zeroizing;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatePointer {
    active_key_id: Option<String>,
}

pub struct KeyStore {
    dir: PathBuf,
    vault: Arc<SecretVault>,
}

impl KeyStore {
    pub fn open(dir: &Path, vault: Arc<SecretVault>) -> Self {
        KeyStore { dir: dir.to_path_buf(), vault }
    }

    fn keys_path(&self) -> PathBuf {
        self.dir.join(KEYS_FILE)
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    // ── Reads ──────────────────────────────────────────────────────────

    pub fn list(&self) -> DaemonResult<Vec<KeyMetadata>> {
        read_json_or_default(&self.keys_path())
    }

    pub fn get(&self, id: &str) -> DaemonResult<Option<KeyMetadata>> {
        Ok(self.list()?.into_iter().find(|k| k.id == id))
    }

    /// The key new sessions bind to when none is named explicitly.
    pub fn active(&self) -> DaemonResult<Option<String>> {
        let pointer: StatePointer = read_json_or_default(&self.state_path())?;
        Ok(pointer.active_key_id)
    }

    /// Fetch and decode the raw secret-key bytes for a key id.
    /// The caller must not hold the result longer than one operation.
    pub fn secret_for(&self, key_id: &str) -> DaemonResult<Zeroizing<Vec<u8>>> {
        let meta = self
            .get(key_id)?
            .ok_or_else(|| DaemonError::not_found(format!("Key not found: {key_id}")))?;
        let secret_hex = self.vault.get(&meta.vault_account)?;
        let bytes = crypto::hex_decode(&secret_hex)?;
        if bytes.len() != 32 {
            return Err(DaemonError::Vault(format!(
                "Vault entry for {key_id} has invalid length"
            )));
        }
        Ok(Zeroizing::new(bytes))
    }

    // ── Writes ─────────────────────────────────────────────────────────

    /// Generate a fresh secp256k1 key, store the secret in the vault, and
    /// append a metadata entry. The new key becomes active.
    pub fn generate(&self, label: &str) -> DaemonResult<KeyMetadata> {
        let secret = Zeroizing::new(crypto::generate_secret_key());
        self.store_key(label, &secret)
    }

    /// Import an existing secret key, accepting 64-char hex or `nsec1…`.
    pub fn import(&self, label: &str, secret: &str) -> DaemonResult<KeyMetadata> {
        let bytes = if secret.starts_with("nsec1") {
            Zeroizing::new(crypto::nsec_decode(secret)?)
        } else {
            Zeroizing::new(crypto::hex_decode(secret.trim())?)
        };
        if bytes.len() != 32 {
            return Err(DaemonError::crypto("Secret key must be 32 bytes"));
        }
        self.store_key(label, &bytes)
    }

    fn store_key(&self, label: &str, secret: &Zeroizing<Vec<u8>>) -> DaemonResult<KeyMetadata> {
        let pubkey = crypto::derive_pubkey(secret)?;
        let npub = crypto::npub_encode(&pubkey)?;

        let id = crypto::hex_encode(&rand::random::<[u8; 4]>());
        let vault_account = format!("key-{id}");
        let secret_hex = Zeroizing::new(crypto::hex_encode(secret));
        let storage_kind = self.vault.put(&vault_account, &secret_hex)?;

        let meta = KeyMetadata {
            id: id.clone(),
            label: label.to_string(),
            npub,
            created_at: chrono::Utc::now().to_rfc3339(),
            vault_account,
            storage_kind,
        };

        let mut keys = self.list()?;
        keys.push(meta.clone());
        write_json_atomic(&self.keys_path(), &keys)?;
        self.set_active(&id)?;
        info!("[keys] Stored key {id} ({})", meta.npub);
        Ok(meta)
    }

    pub fn set_active(&self, id: &str) -> DaemonResult<()> {
        if self.get(id)?.is_none() {
            return Err(DaemonError::not_found(format!("Key not found: {id}")));
        }
        let pointer = StatePointer { active_key_id: Some(id.to_string()) };
        write_json_atomic(&self.state_path(), &pointer)
    }

    /// Remove a key: vault entry first, then metadata. The active pointer
    /// moves to another key when one remains, and is cleared otherwise.
    pub fn delete(&self, id: &str) -> DaemonResult<()> {
        let meta = self
            .get(id)?
            .ok_or_else(|| DaemonError::not_found(format!("Key not found: {id}")))?;
        self.vault.delete(&meta.vault_account)?;

        let keys: Vec<KeyMetadata> =
            self.list()?.into_iter().filter(|k| k.id != id).collect();
        write_json_atomic(&self.keys_path(), &keys)?;

        if self.active()? == Some(id.to_string()) {
            let pointer = StatePointer {
                active_key_id: keys.first().map(|k| k.id.clone()),
            };
            write_json_atomic(&self.state_path(), &pointer)?;
        }
        info!("[keys] Deleted key {id}");
        Ok(())
    }
}

// ── JSON file helpers ──────────────────────────────────────────────────

fn read_json_or_default<T: serde::de::DeserializeOwned + Default>(path: &Path) -> DaemonResult<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> DaemonResult<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(value)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (KeyStore, PathBuf) {
        let dir = std::env::temp_dir().join(format!("ic-keys-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let vault = Arc::new(SecretVault::open_encrypted_file(&dir).unwrap());
        (KeyStore::open(&dir, vault), dir)
    }

    #[test]
    fn generate_lists_and_activates() {
        let (store, dir) = temp_store();
        assert!(store.list().unwrap().is_empty());
        assert!(store.active().unwrap().is_none());

        let meta = store.generate("primary").unwrap();
        assert!(meta.npub.starts_with("npub1"));
        assert_eq!(store.list().unwrap().len(), 1);
        assert_eq!(store.active().unwrap(), Some(meta.id.clone()));

        let secret = store.secret_for(&meta.id).unwrap();
        assert_eq!(secret.len(), 32);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn import_hex_derives_same_npub() {
        let (store, dir) = temp_store();
        let hex = "e8f32e723decf4051aefac8e2c93c9c5b214313817cdb01a1494b917c8436b35";
        let a = store.import("a", hex).unwrap();
        let b = store.import("b", hex).unwrap();
        assert_eq!(a.npub, b.npub);
        assert_ne!(a.id, b.id);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn delete_clears_pointer_when_last_key_dies() {
        let (store, dir) = temp_store();
        let meta = store.generate("only").unwrap();
        store.delete(&meta.id).unwrap();
        assert!(store.list().unwrap().is_empty());
        assert!(store.active().unwrap().is_none());
        assert!(store.secret_for(&meta.id).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }
}
