//! AES-256-GCM sealing of the persisted credential document.
//!
//! The whole document is sealed as one unit with a fresh nonce on every write.
//! The key is 32 bytes, supplied base64-encoded through an environment variable.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Envelope written to disk when a key is configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedDocument {
    pub nonce: String,
    pub ciphertext: String,
}

/// Decodes a base64 key and checks it is exactly 32 bytes.
pub fn validate_key(key_base64: &str) -> Result<Vec<u8>> {
    let key_bytes = BASE64
        .decode(key_base64.trim())
        .context("Failed to decode base64 encryption key")?;

    if key_bytes.len() != KEY_SIZE {
        return Err(anyhow!(
            "Encryption key must be {} bytes (256 bits), got {} bytes",
            KEY_SIZE,
            key_bytes.len()
        ));
    }

    Ok(key_bytes)
}

/// Seals `plaintext` with a random nonce.
pub fn encrypt(plaintext: &str, key: &[u8]) -> Result<SealedDocument> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;

    // Never reuse a nonce with the same key
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|e| anyhow!("Encryption failed: {}", e))?;

    Ok(SealedDocument {
        nonce: BASE64.encode(nonce),
        ciphertext: BASE64.encode(ciphertext),
    })
}

/// Opens a sealed document. Fails on a wrong key or tampered data.
pub fn decrypt(sealed: &SealedDocument, key: &[u8]) -> Result<String> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;

    let nonce_bytes = BASE64
        .decode(&sealed.nonce)
        .context("Failed to decode nonce")?;
    if nonce_bytes.len() != NONCE_SIZE {
        return Err(anyhow!(
            "Invalid nonce size: expected {}, got {}",
            NONCE_SIZE,
            nonce_bytes.len()
        ));
    }
    let ciphertext = BASE64
        .decode(&sealed.ciphertext)
        .context("Failed to decode ciphertext")?;

    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
        .map_err(|e| anyhow!("Decryption failed (wrong key or corrupted data): {}", e))?;

    String::from_utf8(plaintext).context("Decrypted data is not valid UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_validation() {
        assert!(validate_key(&BASE64.encode([0u8; 32])).is_ok());
        assert!(validate_key(&BASE64.encode([0u8; 16])).is_err());
        assert!(validate_key(&BASE64.encode([0u8; 64])).is_err());
        assert!(validate_key("not-valid-base64!@#$").is_err());
    }

    #[test]
    fn test_sealed_document_opens_with_same_key() {
        let key = [7u8; 32];
        let document = r#"{"version":1}"#;

        let sealed = encrypt(document, &key).unwrap();
        assert!(!sealed.ciphertext.contains("version"));
        assert_eq!(decrypt(&sealed, &key).unwrap(), document);
    }

    #[test]
    fn test_each_seal_uses_a_fresh_nonce() {
        let key = [0u8; 32];
        let first = encrypt("same", &key).unwrap();
        let second = encrypt("same", &key).unwrap();
        assert_ne!(first.nonce, second.nonce);
        assert_ne!(first.ciphertext, second.ciphertext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = encrypt("secret", &[0u8; 32]).unwrap();
        assert!(decrypt(&sealed, &[1u8; 32]).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = [0u8; 32];
        let mut sealed = encrypt("secret", &key).unwrap();
        sealed.ciphertext = BASE64.encode(b"definitely not the ciphertext");
        assert!(decrypt(&sealed, &key).is_err());
    }
}
