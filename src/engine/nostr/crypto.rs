// Intercessio — Nostr Cryptography
//
// Event signing and verification (secp256k1 Schnorr / BIP-340), NIP-04
// encrypted payloads (ECDH + AES-256-CBC), NIP-44 v2 payloads (ChaCha20 +
// HMAC-SHA256), pubkey derivation, bech32 and hex utilities.
//
// Everything here is pure computation over byte slices; the relay loop and
// provider adapter decide what gets signed and when.

use crate::atoms::error::{DaemonError, DaemonResult};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

// ── Event Signing (secp256k1 Schnorr / BIP-340) ───────────────────────
//
// NIP-01 event structure:
//   id: sha256([0, pubkey, created_at, kind, tags, content])
//   sig: schnorr signature of id using the secret key (via the k256 crate)

/// sha256 of the canonical NIP-01 serialization.
fn event_id(pubkey_hex: &str, created_at: i64, kind: u64, tags: &Value, content: &str) -> DaemonResult<[u8; 32]> {
    let serialized = json!([0, pubkey_hex, created_at, kind, tags, content]);
    let serialized_str = serde_json::to_string(&serialized)?;
    let mut hasher = Sha256::new();
    hasher.update(serialized_str.as_bytes());
    Ok(hasher.finalize().into())
}

/// Create and sign a Nostr event with arbitrary kind and tags.
pub(crate) fn sign_event(
    secret_key: &[u8],
    pubkey_hex: &str,
    kind: u64,
    tags: &Value,
    content: &str,
) -> DaemonResult<Value> {
    let created_at = chrono::Utc::now().timestamp();
    sign_event_at(secret_key, pubkey_hex, kind, tags, content, created_at)
}

fn sign_event_at(
    secret_key: &[u8],
    pubkey_hex: &str,
    kind: u64,
    tags: &Value,
    content: &str,
    created_at: i64,
) -> DaemonResult<Value> {
    use k256::schnorr::SigningKey;

    let id_bytes = event_id(pubkey_hex, created_at, kind, tags, content)?;
    let id_hex = hex_encode(&id_bytes);

    // BIP-340 Schnorr signature over the event id
    let signing_key =
        SigningKey::from_bytes(secret_key).map_err(|e| DaemonError::Crypto(e.to_string()))?;
    let aux_rand: [u8; 32] = rand::random();
    let sig = signing_key
        .sign_raw(&id_bytes, &aux_rand)
        .map_err(|e| DaemonError::Crypto(e.to_string()))?;
    let sig_hex = hex_encode(&sig.to_bytes());

    Ok(json!({
        "id": id_hex,
        "pubkey": pubkey_hex,
        "created_at": created_at,
        "kind": kind,
        "tags": tags,
        "content": content,
        "sig": sig_hex,
    }))
}

/// Sign a client-supplied draft: missing `pubkey`/`created_at`/`tags`/
/// `content` are filled in, then id and sig are computed fresh. Any id or
/// sig already present in the draft is discarded.
pub(crate) fn sign_draft(secret_key: &[u8], pubkey_hex: &str, draft: &Value) -> DaemonResult<Value> {
    let kind = draft
        .get("kind")
        .and_then(|k| k.as_u64())
        .ok_or_else(|| DaemonError::crypto("Draft event has no kind"))?;
    let tags = draft.get("tags").cloned().unwrap_or_else(|| json!([]));
    let content = draft.get("content").and_then(|c| c.as_str()).unwrap_or("").to_string();
    let created_at = draft
        .get("created_at")
        .and_then(|t| t.as_i64())
        .unwrap_or_else(|| chrono::Utc::now().timestamp());
    sign_event_at(secret_key, pubkey_hex, kind, &tags, &content, created_at)
}

/// Verify an inbound event: recompute the id and check the BIP-340
/// signature against the event's own pubkey.
pub(crate) fn verify_event(event: &Value) -> DaemonResult<()> {
    use k256::schnorr::{Signature, VerifyingKey};

    let pubkey_hex = event
        .get("pubkey")
        .and_then(|p| p.as_str())
        .ok_or_else(|| DaemonError::crypto("Event has no pubkey"))?;
    let created_at = event
        .get("created_at")
        .and_then(|t| t.as_i64())
        .ok_or_else(|| DaemonError::crypto("Event has no created_at"))?;
    let kind = event
        .get("kind")
        .and_then(|k| k.as_u64())
        .ok_or_else(|| DaemonError::crypto("Event has no kind"))?;
    let tags = event.get("tags").cloned().unwrap_or_else(|| json!([]));
    let content = event.get("content").and_then(|c| c.as_str()).unwrap_or("");

    let expected = event_id(pubkey_hex, created_at, kind, &tags, content)?;
    let claimed = event.get("id").and_then(|i| i.as_str()).unwrap_or("");
    if hex_encode(&expected) != claimed {
        return Err(DaemonError::crypto("Event id mismatch"));
    }

    let pk_bytes = hex_decode(pubkey_hex)?;
    let sig_bytes = hex_decode(event.get("sig").and_then(|s| s.as_str()).unwrap_or(""))?;
    let vk = VerifyingKey::from_bytes(&pk_bytes).map_err(|e| DaemonError::Crypto(e.to_string()))?;
    let sig =
        Signature::try_from(sig_bytes.as_slice()).map_err(|e| DaemonError::Crypto(e.to_string()))?;
    vk.verify_raw(&expected, &sig)
        .map_err(|_| DaemonError::crypto("Invalid event signature"))
}

// ── ECDH shared point (NIP-04 and NIP-44 both start here) ─────────────

/// x-coordinate of (our_privkey × their_pubkey) on secp256k1.
fn compute_shared_secret(secret_key: &[u8], pubkey_hex: &str) -> DaemonResult<[u8; 32]> {
    let sk =
        k256::SecretKey::from_slice(secret_key).map_err(|e| DaemonError::Crypto(e.to_string()))?;

    // BIP-340 x-only pubkey → SEC1 compressed (prepend 0x02)
    let pk_bytes = hex_decode(pubkey_hex)?;
    if pk_bytes.len() != 32 {
        return Err(DaemonError::Crypto(format!(
            "Invalid pubkey length: {} (expected 32)",
            pk_bytes.len()
        )));
    }
    let mut sec1 = Vec::with_capacity(33);
    sec1.push(0x02);
    sec1.extend_from_slice(&pk_bytes);
    let pk = k256::PublicKey::from_sec1_bytes(&sec1)
        .map_err(|e| DaemonError::Crypto(e.to_string()))?;

    use k256::elliptic_curve::ecdh::diffie_hellman;
    let shared = diffie_hellman(sk.to_nonzero_scalar(), pk.as_affine());
    let mut out = [0u8; 32];
    out.copy_from_slice(shared.raw_secret_bytes().as_slice());
    Ok(out)
}

// ── NIP-04 (ECDH + AES-256-CBC) ───────────────────────────────────────
//
//   1. shared secret = x-coordinate of the ECDH point
//   2. AES-256-CBC with random 16-byte IV and PKCS#7 padding
//   3. Content format: base64(ciphertext) + "?iv=" + base64(iv)

pub(crate) fn nip04_encrypt(secret_key: &[u8], peer_pk_hex: &str, plaintext: &str) -> DaemonResult<String> {
    use base64::Engine;
    use cbc::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};

    let shared = compute_shared_secret(secret_key, peer_pk_hex)?;
    let iv: [u8; 16] = rand::random();

    let pt = plaintext.as_bytes();
    // Buffer: plaintext + up to 16 bytes PKCS#7 padding
    let mut buf = vec![0u8; pt.len() + 16];
    buf[..pt.len()].copy_from_slice(pt);

    let ciphertext = cbc::Encryptor::<aes::Aes256>::new_from_slices(&shared, &iv)
        .map_err(|e| DaemonError::Crypto(e.to_string()))?
        .encrypt_padded_mut::<Pkcs7>(&mut buf, pt.len())
        .map_err(|e| DaemonError::Crypto(e.to_string()))?;

    let b64 = base64::engine::general_purpose::STANDARD;
    Ok(format!("{}?iv={}", b64.encode(ciphertext), b64.encode(iv)))
}

pub(crate) fn nip04_decrypt(secret_key: &[u8], peer_pk_hex: &str, content: &str) -> DaemonResult<String> {
    use base64::Engine;
    use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};

    let parts: Vec<&str> = content.split("?iv=").collect();
    if parts.len() != 2 {
        return Err(DaemonError::crypto("Invalid NIP-04 format (expected base64?iv=base64)"));
    }

    let b64 = base64::engine::general_purpose::STANDARD;
    let ciphertext = b64
        .decode(parts[0].trim())
        .map_err(|e| DaemonError::Crypto(e.to_string()))?;
    let iv = b64
        .decode(parts[1].trim())
        .map_err(|e| DaemonError::Crypto(e.to_string()))?;
    if iv.len() != 16 {
        return Err(DaemonError::Crypto(format!("Invalid IV length: {} (expected 16)", iv.len())));
    }

    let shared = compute_shared_secret(secret_key, peer_pk_hex)?;

    let mut buf = ciphertext;
    let plaintext = cbc::Decryptor::<aes::Aes256>::new_from_slices(&shared, &iv)
        .map_err(|e| DaemonError::Crypto(e.to_string()))?
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map_err(|e| DaemonError::Crypto(e.to_string()))?;

    String::from_utf8(plaintext.to_vec()).map_err(|e| DaemonError::Crypto(e.to_string()))
}

/// Heuristic used when decoding inbound request envelopes: NIP-04 payloads
/// carry the "?iv=" separator, NIP-44 payloads never do.
pub(crate) fn looks_like_nip04(content: &str) -> bool {
    content.contains("?iv=")
}

// ── NIP-44 v2 (ChaCha20 + HMAC-SHA256, HKDF key schedule) ─────────────
//
// conversation key: hkdf-extract(salt="nip44-v2", ikm=shared_x)
// per message:      hkdf-expand(conv_key, nonce, 76) →
//                   chacha_key(32) ‖ chacha_nonce(12) ‖ hmac_key(32)
// payload:          base64(0x02 ‖ nonce(32) ‖ ciphertext ‖ mac(32))
// plaintext frame:  u16-be length ‖ data ‖ zero padding to calc_padded_len

type HmacSha256 = Hmac<Sha256>;

fn conversation_key(secret_key: &[u8], peer_pk_hex: &str) -> DaemonResult<[u8; 32]> {
    let shared = compute_shared_secret(secret_key, peer_pk_hex)?;
    let (prk, _) = hkdf::Hkdf::<Sha256>::extract(Some(b"nip44-v2"), &shared);
    let mut out = [0u8; 32];
    out.copy_from_slice(&prk);
    Ok(out)
}

fn message_keys(conv_key: &[u8; 32], nonce: &[u8; 32]) -> DaemonResult<([u8; 32], [u8; 12], [u8; 32])> {
    let hk = hkdf::Hkdf::<Sha256>::from_prk(conv_key)
        .map_err(|e| DaemonError::Crypto(e.to_string()))?;
    let mut okm = [0u8; 76];
    hk.expand(nonce, &mut okm)
        .map_err(|e| DaemonError::Crypto(e.to_string()))?;
    let mut chacha_key = [0u8; 32];
    let mut chacha_nonce = [0u8; 12];
    let mut hmac_key = [0u8; 32];
    chacha_key.copy_from_slice(&okm[0..32]);
    chacha_nonce.copy_from_slice(&okm[32..44]);
    hmac_key.copy_from_slice(&okm[44..76]);
    Ok((chacha_key, chacha_nonce, hmac_key))
}

fn calc_padded_len(len: usize) -> usize {
    if len <= 32 {
        return 32;
    }
    // 2^(floor(log2(len - 1)) + 1)
    let next_power = 1usize << (usize::BITS - (len - 1).leading_zeros());
    let chunk = if next_power <= 256 { 32 } else { next_power / 8 };
    chunk * ((len - 1) / chunk + 1)
}

fn chacha20_apply(key: &[u8; 32], nonce: &[u8; 12], buf: &mut [u8]) {
    use chacha20::cipher::{KeyIvInit, StreamCipher};
    let mut cipher = chacha20::ChaCha20::new(key.into(), nonce.into());
    cipher.apply_keystream(buf);
}

fn hmac_aad(key: &[u8; 32], aad: &[u8], message: &[u8]) -> DaemonResult<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| DaemonError::Crypto(e.to_string()))?;
    mac.update(aad);
    mac.update(message);
    let out = mac.finalize().into_bytes();
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&out);
    Ok(bytes)
}

pub(crate) fn nip44_encrypt(secret_key: &[u8], peer_pk_hex: &str, plaintext: &str) -> DaemonResult<String> {
    use base64::Engine;

    let pt = plaintext.as_bytes();
    if pt.is_empty() || pt.len() > 65535 {
        return Err(DaemonError::Crypto(format!("Invalid plaintext length: {}", pt.len())));
    }

    let conv_key = conversation_key(secret_key, peer_pk_hex)?;
    let nonce: [u8; 32] = rand::random();
    let (chacha_key, chacha_nonce, hmac_key) = message_keys(&conv_key, &nonce)?;

    let padded_len = calc_padded_len(pt.len());
    let mut buf = vec![0u8; 2 + padded_len];
    buf[0..2].copy_from_slice(&(pt.len() as u16).to_be_bytes());
    buf[2..2 + pt.len()].copy_from_slice(pt);
    chacha20_apply(&chacha_key, &chacha_nonce, &mut buf);

    let mac = hmac_aad(&hmac_key, &nonce, &buf)?;

    let mut payload = Vec::with_capacity(1 + 32 + buf.len() + 32);
    payload.push(0x02);
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&buf);
    payload.extend_from_slice(&mac);
    Ok(base64::engine::general_purpose::STANDARD.encode(payload))
}

pub(crate) fn nip44_decrypt(secret_key: &[u8], peer_pk_hex: &str, content: &str) -> DaemonResult<String> {
    use base64::Engine;

    let payload = base64::engine::general_purpose::STANDARD
        .decode(content.trim())
        .map_err(|e| DaemonError::Crypto(e.to_string()))?;
    // version(1) + nonce(32) + at least one ciphertext block(34) + mac(32)
    if payload.len() < 99 {
        return Err(DaemonError::crypto("NIP-44 payload too short"));
    }
    if payload[0] != 0x02 {
        return Err(DaemonError::Crypto(format!("Unsupported NIP-44 version: {}", payload[0])));
    }

    let mut nonce = [0u8; 32];
    nonce.copy_from_slice(&payload[1..33]);
    let mac_start = payload.len() - 32;
    let ciphertext = &payload[33..mac_start];
    let mac = &payload[mac_start..];

    let conv_key = conversation_key(secret_key, peer_pk_hex)?;
    let (chacha_key, chacha_nonce, hmac_key) = message_keys(&conv_key, &nonce)?;

    let mut verifier =
        HmacSha256::new_from_slice(&hmac_key).map_err(|e| DaemonError::Crypto(e.to_string()))?;
    verifier.update(&nonce);
    verifier.update(ciphertext);
    verifier
        .verify_slice(mac)
        .map_err(|_| DaemonError::crypto("NIP-44 MAC mismatch"))?;

    let mut buf = ciphertext.to_vec();
    chacha20_apply(&chacha_key, &chacha_nonce, &mut buf);

    if buf.len() < 2 {
        return Err(DaemonError::crypto("NIP-44 plaintext frame too short"));
    }
    let pt_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if pt_len == 0 || buf.len() < 2 + pt_len {
        return Err(DaemonError::crypto("NIP-44 plaintext length out of range"));
    }
    String::from_utf8(buf[2..2 + pt_len].to_vec()).map_err(|e| DaemonError::Crypto(e.to_string()))
}

// ── secp256k1 Pubkey Derivation (BIP-340 x-only) ──────────────────────
//
// Nostr uses the x-coordinate of the secp256k1 public key (BIP-340).
// The k256 crate performs the elliptic curve point multiplication.

pub(crate) fn derive_pubkey(secret_key: &[u8]) -> DaemonResult<Vec<u8>> {
    use k256::elliptic_curve::sec1::ToEncodedPoint;

    let sk =
        k256::SecretKey::from_slice(secret_key).map_err(|e| DaemonError::Crypto(e.to_string()))?;
    let pk = sk.public_key();
    let point = pk.to_encoded_point(true); // compressed
    // BIP-340 x-only: skip the 0x02/0x03 prefix byte, take the 32-byte x-coordinate
    let compressed = point.as_bytes();
    if compressed.len() != 33 {
        return Err(DaemonError::crypto("Unexpected compressed pubkey length"));
    }
    Ok(compressed[1..].to_vec())
}

/// Generate a fresh secp256k1 secret key.
pub(crate) fn generate_secret_key() -> Vec<u8> {
    let sk = k256::SecretKey::random(&mut rand::thread_rng());
    sk.to_bytes().to_vec()
}

// ── Bech32 (npub / nsec) ──────────────────────────────────────────────

pub(crate) fn npub_encode(pubkey: &[u8]) -> DaemonResult<String> {
    let hrp = bech32::Hrp::parse("npub").map_err(|e| DaemonError::Crypto(e.to_string()))?;
    bech32::encode::<bech32::Bech32>(hrp, pubkey).map_err(|e| DaemonError::Crypto(e.to_string()))
}

/// Decode an `nsec1…` string into raw secret-key bytes.
pub(crate) fn nsec_decode(nsec: &str) -> DaemonResult<Vec<u8>> {
    let (hrp, data) = bech32::decode(nsec).map_err(|e| DaemonError::Crypto(e.to_string()))?;
    if hrp.as_str() != "nsec" {
        return Err(DaemonError::Crypto(format!("Expected nsec, got {}", hrp.as_str())));
    }
    if data.len() != 32 {
        return Err(DaemonError::Crypto(format!("Invalid nsec payload length: {}", data.len())));
    }
    Ok(data)
}

// ── Hex Utils ──────────────────────────────────────────────────────────

pub(crate) fn hex_decode(hex: &str) -> DaemonResult<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return Err(DaemonError::crypto("Odd hex length"));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16).map_err(|e| DaemonError::Crypto(e.to_string()))
        })
        .collect()
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // A valid secp256k1 secret key (32 bytes, non-zero, < curve order)
    fn test_secret_key() -> Vec<u8> {
        hex_decode("e8f32e723decf4051aefac8e2c93c9c5b214313817cdb01a1494b917c8436b35").unwrap()
    }

    fn other_secret_key() -> Vec<u8> {
        hex_decode("0b1c4c1a5e0c3d5e7f9a1b3c5d7e9f0a2b4c6d8e0f1a3b5c7d9e1f0a2b4c6d8e").unwrap()
    }

    #[test]
    fn derive_pubkey_produces_32_bytes() {
        let pk = derive_pubkey(&test_secret_key()).unwrap();
        assert_eq!(pk.len(), 32);
    }

    #[test]
    fn sign_event_verifies() {
        let sk = test_secret_key();
        let pk_hex = hex_encode(&derive_pubkey(&sk).unwrap());
        let event = sign_event(&sk, &pk_hex, 1, &json!([]), "hello nostr").unwrap();
        assert_eq!(event["id"].as_str().unwrap().len(), 64);
        assert_eq!(event["sig"].as_str().unwrap().len(), 128);
        verify_event(&event).unwrap();
    }

    #[test]
    fn verify_rejects_tampered_content() {
        let sk = test_secret_key();
        let pk_hex = hex_encode(&derive_pubkey(&sk).unwrap());
        let mut event = sign_event(&sk, &pk_hex, 1, &json!([]), "original").unwrap();
        event["content"] = json!("tampered");
        assert!(verify_event(&event).is_err());
    }

    #[test]
    fn sign_draft_fills_missing_fields() {
        let sk = test_secret_key();
        let pk_hex = hex_encode(&derive_pubkey(&sk).unwrap());
        let draft = json!({"kind": 1, "content": "hi"});
        let signed = sign_draft(&sk, &pk_hex, &draft).unwrap();
        assert_eq!(signed["pubkey"].as_str().unwrap(), pk_hex);
        assert!(signed["created_at"].as_i64().unwrap() > 0);
        verify_event(&signed).unwrap();
    }

    #[test]
    fn nip04_roundtrip() {
        let sk1 = test_secret_key();
        let sk2 = other_secret_key();
        let pk1_hex = hex_encode(&derive_pubkey(&sk1).unwrap());
        let pk2_hex = hex_encode(&derive_pubkey(&sk2).unwrap());

        let plaintext = "Hello, this is a secret message!";
        let encrypted = nip04_encrypt(&sk1, &pk2_hex, plaintext).unwrap();
        assert!(encrypted.contains("?iv="));
        assert!(looks_like_nip04(&encrypted));

        // ECDH is symmetric: decrypt with sk2 + pk1
        let decrypted = nip04_decrypt(&sk2, &pk1_hex, &encrypted).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn nip44_roundtrip() {
        let sk1 = test_secret_key();
        let sk2 = other_secret_key();
        let pk1_hex = hex_encode(&derive_pubkey(&sk1).unwrap());
        let pk2_hex = hex_encode(&derive_pubkey(&sk2).unwrap());

        let plaintext = "nip44 payloads have padded frames";
        let encrypted = nip44_encrypt(&sk1, &pk2_hex, plaintext).unwrap();
        assert!(!looks_like_nip04(&encrypted));
        let decrypted = nip44_decrypt(&sk2, &pk1_hex, &encrypted).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn nip44_rejects_bad_mac() {
        use base64::Engine;
        let sk1 = test_secret_key();
        let sk2 = other_secret_key();
        let pk2_hex = hex_encode(&derive_pubkey(&sk2).unwrap());
        let pk1_hex = hex_encode(&derive_pubkey(&sk1).unwrap());

        let encrypted = nip44_encrypt(&sk1, &pk2_hex, "payload").unwrap();
        let b64 = base64::engine::general_purpose::STANDARD;
        let mut raw = b64.decode(&encrypted).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        let tampered = b64.encode(raw);
        assert!(nip44_decrypt(&sk2, &pk1_hex, &tampered).is_err());
    }

    #[test]
    fn padded_len_matches_reference_vectors() {
        assert_eq!(calc_padded_len(1), 32);
        assert_eq!(calc_padded_len(32), 32);
        assert_eq!(calc_padded_len(33), 64);
        assert_eq!(calc_padded_len(100), 128);
        assert_eq!(calc_padded_len(320), 320);
        assert_eq!(calc_padded_len(1000), 1024);
    }

    #[test]
    fn npub_roundtrip_hrp() {
        let pk = derive_pubkey(&test_secret_key()).unwrap();
        let npub = npub_encode(&pk).unwrap();
        assert!(npub.starts_with("npub1"));
    }

    #[test]
    fn nsec_decode_rejects_wrong_hrp() {
        let pk = derive_pubkey(&test_secret_key()).unwrap();
        let npub = npub_encode(&pk).unwrap();
        assert!(nsec_decode(&npub).is_err());
    }

    #[test]
    fn hex_roundtrip_and_errors() {
        let original = vec![0xde, 0xad, 0xbe, 0xef];
        assert_eq!(hex_decode(&hex_encode(&original)).unwrap(), original);
        assert!(hex_decode("abc").is_err());
    }
}
