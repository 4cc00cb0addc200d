// src/crypto.rs

//! Authenticated encryption for the project state file
//!
//! AES-256-GCM with a 16-byte random IV and a detached 16-byte auth tag,
//! serialized as a base64 JSON payload. The symmetric key is derived from
//! the user's identity private key with HKDF-SHA256, so the same private
//! key always yields the same key and the state file never stores key
//! material of its own.

use crate::error::{Error, Result};
use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// AES-256-GCM with a 16-byte nonce
type Cipher = AesGcm<Aes256, U16>;

const ALGORITHM: &str = "aes-256-gcm";
const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;

/// Domain separation for the state-file key derivation
const KDF_INFO: &[u8] = b"noorm:state-encryption:v1";

/// Encrypted payload as written to disk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedPayload {
    pub algorithm: String,
    pub iv: String,
    pub auth_tag: String,
    pub ciphertext: String,
}

/// Derive the 32-byte symmetric key from identity private key bytes.
///
/// Deterministic: the same private key always produces the same key.
pub fn derive_key(private_key: &[u8]) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, private_key);
    let mut key = [0u8; 32];
    hkdf.expand(KDF_INFO, &mut key)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    key
}

/// Encrypt plaintext under the derived key with a fresh random IV
pub fn encrypt(plaintext: &[u8], key: &[u8; 32]) -> Result<EncryptedPayload> {
    let cipher = Cipher::new(key.into());

    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    let nonce = Nonce::<U16>::from_slice(&iv);

    // The aead API returns ciphertext with the tag appended; the on-disk
    // format keeps them as separate fields.
    let mut sealed = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| Error::DecryptFailure { what: "payload" })?;
    let tag = sealed.split_off(sealed.len() - TAG_LEN);

    Ok(EncryptedPayload {
        algorithm: ALGORITHM.to_string(),
        iv: BASE64.encode(iv),
        auth_tag: BASE64.encode(tag),
        ciphertext: BASE64.encode(sealed),
    })
}

/// Decrypt a payload, verifying the auth tag.
///
/// Any tampering with the IV, tag, or ciphertext fails with
/// `DecryptFailure`; there is no partial or garbage output path.
pub fn decrypt(payload: &EncryptedPayload, key: &[u8; 32]) -> Result<Vec<u8>> {
    if payload.algorithm != ALGORITHM {
        return Err(Error::InvalidArtifact {
            what: "encrypted payload",
            message: format!("unknown algorithm '{}'", payload.algorithm),
        });
    }

    let iv = decode_field(&payload.iv, "iv")?;
    let tag = decode_field(&payload.auth_tag, "authTag")?;
    let ciphertext = decode_field(&payload.ciphertext, "ciphertext")?;

    if iv.len() != IV_LEN || tag.len() != TAG_LEN {
        return Err(Error::DecryptFailure { what: "payload" });
    }

    let cipher = Cipher::new(key.into());
    let nonce = Nonce::<U16>::from_slice(&iv);

    let mut sealed = ciphertext;
    sealed.extend_from_slice(&tag);

    cipher
        .decrypt(nonce, sealed.as_ref())
        .map_err(|_| Error::DecryptFailure { what: "payload" })
}

fn decode_field(value: &str, field: &'static str) -> Result<Vec<u8>> {
    BASE64.decode(value).map_err(|_| Error::InvalidArtifact {
        what: "encrypted payload",
        message: format!("field '{}' is not valid base64", field),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; 32] {
        derive_key(b"test private key material")
    }

    #[test]
    fn test_roundtrip() {
        let key = test_key();
        for plaintext in [
            "".as_bytes(),
            "short".as_bytes(),
            "unicode: \u{1f512} \u{e9}\u{e8}".as_bytes(),
            &[0u8; 4096][..],
        ] {
            let payload = encrypt(plaintext, &key).unwrap();
            let decrypted = decrypt(&payload, &key).unwrap();
            assert_eq!(decrypted, plaintext);
        }
    }

    #[test]
    fn test_fresh_iv_per_encryption() {
        let key = test_key();
        let a = encrypt(b"same input", &key).unwrap();
        let b = encrypt(b"same input", &key).unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_key_derivation_is_deterministic() {
        assert_eq!(derive_key(b"alpha"), derive_key(b"alpha"));
        assert_ne!(derive_key(b"alpha"), derive_key(b"beta"));
    }

    #[test]
    fn test_wrong_key_fails() {
        let payload = encrypt(b"secret", &test_key()).unwrap();
        let other = derive_key(b"different key material");
        assert!(matches!(
            decrypt(&payload, &other),
            Err(Error::DecryptFailure { .. })
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = test_key();
        let mut payload = encrypt(b"attack at dawn", &key).unwrap();
        let mut raw = BASE64.decode(&payload.ciphertext).unwrap();
        raw[0] ^= 0x01;
        payload.ciphertext = BASE64.encode(raw);
        assert!(matches!(
            decrypt(&payload, &key),
            Err(Error::DecryptFailure { .. })
        ));
    }

    #[test]
    fn test_tampered_iv_fails() {
        let key = test_key();
        let mut payload = encrypt(b"attack at dawn", &key).unwrap();
        let mut raw = BASE64.decode(&payload.iv).unwrap();
        raw[3] ^= 0x80;
        payload.iv = BASE64.encode(raw);
        assert!(matches!(
            decrypt(&payload, &key),
            Err(Error::DecryptFailure { .. })
        ));
    }

    #[test]
    fn test_tampered_tag_fails() {
        let key = test_key();
        let mut payload = encrypt(b"attack at dawn", &key).unwrap();
        let mut raw = BASE64.decode(&payload.auth_tag).unwrap();
        raw[15] ^= 0x10;
        payload.auth_tag = BASE64.encode(raw);
        assert!(matches!(
            decrypt(&payload, &key),
            Err(Error::DecryptFailure { .. })
        ));
    }

    #[test]
    fn test_unknown_algorithm_rejected() {
        let key = test_key();
        let mut payload = encrypt(b"data", &key).unwrap();
        payload.algorithm = "rot13".to_string();
        assert!(matches!(
            decrypt(&payload, &key),
            Err(Error::InvalidArtifact { .. })
        ));
    }

    #[test]
    fn test_payload_serializes_with_camel_case_tag() {
        let payload = encrypt(b"x", &test_key()).unwrap();
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"authTag\""));
        assert!(json.contains("\"aes-256-gcm\""));
    }
}
