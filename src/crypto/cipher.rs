//! At-rest encryption for stored message content.
//!
//! Blobs are base64 over `nonce (12) || tag (16) || ciphertext`, so encrypted
//! rows stay printable TEXT and each field is at a fixed offset.

use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    Aes256Gcm,
};
use rand::RngCore;

use crate::error::AppError;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug)]
pub struct MessageCipher {
    key: [u8; 32],
}

impl MessageCipher {
    /// Builds a cipher from the configured secret. The secret must carry at
    /// least 32 bytes of material; the first 32 become the AES-256 key.
    pub fn new(secret: &str) -> Result<Self, AppError> {
        let bytes = secret.as_bytes();
        if bytes.len() < 32 {
            return Err(AppError::Crypto(format!(
                "encryption key must be at least 32 bytes, got {}",
                bytes.len()
            )));
        }

        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes[..32]);
        Ok(MessageCipher { key })
    }

    /// Encrypts plaintext under a fresh random nonce.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, AppError> {
        let cipher = Aes256Gcm::new(GenericArray::from_slice(&self.key));

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = GenericArray::from_slice(&nonce_bytes);

        // The AEAD appends the tag to the ciphertext; the stored layout wants
        // it up front, right after the nonce.
        let sealed = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| AppError::Crypto("encryption failed".to_string()))?;
        let tag_at = sealed.len() - TAG_LEN;

        let mut blob = Vec::with_capacity(NONCE_LEN + sealed.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&sealed[tag_at..]);
        blob.extend_from_slice(&sealed[..tag_at]);

        Ok(base64_simd::STANDARD.encode_to_string(&blob))
    }

    /// Decrypts a stored blob. Any tampering with nonce, tag, or ciphertext
    /// makes this fail; there is no partial recovery.
    pub fn decrypt(&self, blob: &str) -> Result<String, AppError> {
        let raw = base64_simd::STANDARD
            .decode_to_vec(blob)
            .map_err(|_| AppError::Crypto("stored ciphertext is not valid base64".to_string()))?;

        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(AppError::Crypto(
                "stored ciphertext is too short".to_string(),
            ));
        }

        let nonce = GenericArray::from_slice(&raw[..NONCE_LEN]);
        let tag = &raw[NONCE_LEN..NONCE_LEN + TAG_LEN];
        let body = &raw[NONCE_LEN + TAG_LEN..];

        let mut sealed = Vec::with_capacity(raw.len() - NONCE_LEN);
        sealed.extend_from_slice(body);
        sealed.extend_from_slice(tag);

        let cipher = Aes256Gcm::new(GenericArray::from_slice(&self.key));
        let plaintext = cipher
            .decrypt(nonce, sealed.as_slice())
            .map_err(|_| AppError::Crypto("decryption failed".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| AppError::Crypto("decrypted content is not valid UTF-8".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn round_trip() {
        let cipher = MessageCipher::new(KEY).unwrap();
        let blob = cipher.encrypt("Hello, how can I help?").unwrap();
        assert_eq!(cipher.decrypt(&blob).unwrap(), "Hello, how can I help?");
    }

    #[test]
    fn rejects_short_key() {
        let err = MessageCipher::new("too-short").unwrap_err();
        assert!(matches!(err, AppError::Crypto(_)));
    }

    #[test]
    fn blob_layout_is_nonce_tag_ciphertext() {
        let cipher = MessageCipher::new(KEY).unwrap();
        let blob = cipher.encrypt("hi").unwrap();
        let raw = base64_simd::STANDARD.decode_to_vec(&blob).unwrap();
        assert_eq!(raw.len(), NONCE_LEN + TAG_LEN + 2);
    }

    #[test]
    fn nonces_are_unique_per_call() {
        let cipher = MessageCipher::new(KEY).unwrap();
        let a = cipher.encrypt("same text").unwrap();
        let b = cipher.encrypt("same text").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn empty_plaintext_round_trips() {
        let cipher = MessageCipher::new(KEY).unwrap();
        let blob = cipher.encrypt("").unwrap();
        assert_eq!(cipher.decrypt(&blob).unwrap(), "");
    }

    #[test]
    fn multibyte_plaintext_round_trips() {
        let cipher = MessageCipher::new(KEY).unwrap();
        let text = "héllo wörld 你好 🙂";
        let blob = cipher.encrypt(text).unwrap();
        assert_eq!(cipher.decrypt(&blob).unwrap(), text);
    }

    #[test]
    fn flipping_any_byte_breaks_decryption() {
        let cipher = MessageCipher::new(KEY).unwrap();
        let blob = cipher.encrypt("tamper target").unwrap();
        let raw = base64_simd::STANDARD.decode_to_vec(&blob).unwrap();

        for i in 0..raw.len() {
            let mut bent = raw.clone();
            bent[i] ^= 0x01;
            let reencoded = base64_simd::STANDARD.encode_to_string(&bent);
            assert!(
                cipher.decrypt(&reencoded).is_err(),
                "flip at byte {} went undetected",
                i
            );
        }
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let cipher = MessageCipher::new(KEY).unwrap();
        let blob = cipher.encrypt("short").unwrap();
        let raw = base64_simd::STANDARD.decode_to_vec(&blob).unwrap();
        let truncated = base64_simd::STANDARD.encode_to_string(&raw[..20]);
        assert!(cipher.decrypt(&truncated).is_err());
    }

    #[test]
    fn garbage_input_is_rejected() {
        let cipher = MessageCipher::new(KEY).unwrap();
        assert!(cipher.decrypt("not base64 at all!!!").is_err());
    }

    #[test]
    fn wrong_key_cannot_decrypt() {
        let cipher = MessageCipher::new(KEY).unwrap();
        let other = MessageCipher::new("ffffffffffffffffffffffffffffffff").unwrap();
        let blob = cipher.encrypt("secret").unwrap();
        assert!(other.decrypt(&blob).is_err());
    }
}
