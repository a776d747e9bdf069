//! Message body codec for direct conversations.
//!
//! The conversation key is derived from the two participant identifiers
//! alone, so either side computes it without a handshake. This is NOT
//! end-to-end encryption: anyone who knows both identifiers (including the
//! backend operator) can derive the key. It only keeps bodies unreadable to
//! a passive observer of storage or of the wire.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::constants::{
    KDF_CONTEXT_CONVERSATION_KEY, NONCE_SIZE, SEALED_BODY_PREFIX, SYMMETRIC_KEY_SIZE,
};
use crate::error::CryptoError;
use crate::types::{ConversationId, UserId};

pub type SymmetricKey = [u8; SYMMETRIC_KEY_SIZE];

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

// Returns nonce || ciphertext (24 bytes nonce prepended)
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce_bytes = generate_nonce();
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

pub fn decrypt(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

// BLAKE3 KDF with domain separation over the sorted pair
pub fn derive_conversation_key(a: &UserId, b: &UserId) -> SymmetricKey {
    let conversation = ConversationId::new(a, b);
    let (low, high) = conversation.participants();

    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_CONVERSATION_KEY);
    hasher.update(low.as_str().as_bytes());
    hasher.update(&[0u8]);
    hasher.update(high.as_str().as_bytes());
    let hash = hasher.finalize();
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    key.copy_from_slice(&hash.as_bytes()[..SYMMETRIC_KEY_SIZE]);
    key
}

/// Short, non-reversible tag for a key, safe to put in logs.
pub fn key_fingerprint(key: &SymmetricKey) -> String {
    hex::encode(&blake3::hash(key).as_bytes()[..4])
}

/// Seal a plaintext body for the conversation between `a` and `b`.
///
/// Empty input stays empty.
pub fn seal_body(plaintext: &str, a: &UserId, b: &UserId) -> Result<String, CryptoError> {
    if plaintext.is_empty() {
        return Ok(String::new());
    }

    let key = derive_conversation_key(a, b);
    let sealed = encrypt(&key, plaintext.as_bytes())?;
    Ok(format!("{SEALED_BODY_PREFIX}{}", STANDARD.encode(sealed)))
}

/// Open a stored body. Never fails: anything that is not a valid sealed body
/// for this pair (legacy plaintext rows, garbage, wrong pair) comes back
/// unchanged.
pub fn open_body(stored: &str, a: &UserId, b: &UserId) -> String {
    try_open_body(stored, a, b).unwrap_or_else(|| stored.to_string())
}

fn try_open_body(stored: &str, a: &UserId, b: &UserId) -> Option<String> {
    let encoded = stored.strip_prefix(SEALED_BODY_PREFIX)?;
    let data = STANDARD.decode(encoded).ok()?;
    let key = derive_conversation_key(a, b);
    let plaintext = decrypt(&key, &data).ok()?;
    let text = String::from_utf8(plaintext).ok()?;
    if text.is_empty() {
        return None;
    }
    Some(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::TAG_SIZE;

    fn pair() -> (UserId, UserId) {
        (UserId::from("u1"), UserId::from("u2"))
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let (a, b) = pair();
        let key = derive_conversation_key(&a, &b);
        let plaintext = b"see you at the library";

        let encrypted = encrypt(&key, plaintext).unwrap();
        let decrypted = decrypt(&key, &encrypted).unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let (a, b) = pair();
        let key = derive_conversation_key(&a, &b);

        let mut encrypted = encrypt(&key, b"Important data").unwrap();
        let len = encrypted.len();
        encrypted[len - 1] ^= 0xFF;

        assert!(decrypt(&key, &encrypted).is_err());
    }

    #[test]
    fn test_empty_data_fails() {
        let (a, b) = pair();
        let key = derive_conversation_key(&a, &b);
        assert!(decrypt(&key, &[]).is_err());
    }

    #[test]
    fn test_nonce_prepended() {
        let (a, b) = pair();
        let key = derive_conversation_key(&a, &b);
        let encrypted = encrypt(&key, b"test").unwrap();
        assert_eq!(encrypted.len(), NONCE_SIZE + 4 + TAG_SIZE);
    }

    #[test]
    fn test_key_derivation_order_independent() {
        let (a, b) = pair();
        assert_eq!(derive_conversation_key(&a, &b), derive_conversation_key(&b, &a));
    }

    #[test]
    fn test_different_pairs_different_keys() {
        let a = UserId::from("u1");
        let key1 = derive_conversation_key(&a, &UserId::from("u2"));
        let key2 = derive_conversation_key(&a, &UserId::from("u3"));
        assert_ne!(key1, key2);

        // The separator keeps ("ab", "c") and ("a", "bc") apart.
        let key3 = derive_conversation_key(&UserId::from("ab"), &UserId::from("c"));
        let key4 = derive_conversation_key(&UserId::from("a"), &UserId::from("bc"));
        assert_ne!(key3, key4);
    }

    #[test]
    fn test_body_roundtrip_either_order() {
        let (a, b) = pair();
        for text in ["hello", "ça va ? 👋", " leading space", "x"] {
            let sealed = seal_body(text, &a, &b).unwrap();
            assert_ne!(sealed, text);
            assert_eq!(open_body(&sealed, &a, &b), text);
            assert_eq!(open_body(&sealed, &b, &a), text);
        }
    }

    #[test]
    fn test_seal_empty_is_empty() {
        let (a, b) = pair();
        assert_eq!(seal_body("", &a, &b).unwrap(), "");
        assert_eq!(open_body("", &a, &b), "");
    }

    #[test]
    fn test_open_legacy_plaintext_unchanged() {
        let (a, b) = pair();
        for legacy in ["hello there", "v1:", "v1:not base64!!", "v1:AAAA", "U2FsdGVkX1+abc"] {
            assert_eq!(open_body(legacy, &a, &b), legacy);
        }
    }

    #[test]
    fn test_open_with_wrong_pair_is_unchanged() {
        let (a, b) = pair();
        let sealed = seal_body("secret", &a, &b).unwrap();
        let other = open_body(&sealed, &a, &UserId::from("u3"));
        assert_eq!(other, sealed);
    }

    #[test]
    fn test_sealed_bodies_are_randomised() {
        let (a, b) = pair();
        let one = seal_body("same", &a, &b).unwrap();
        let two = seal_body("same", &a, &b).unwrap();
        assert_ne!(one, two);
    }

    #[test]
    fn test_fingerprint_is_short() {
        let (a, b) = pair();
        assert_eq!(key_fingerprint(&derive_conversation_key(&a, &b)).len(), 8);
    }
}
