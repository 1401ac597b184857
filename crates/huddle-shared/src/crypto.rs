//! Encryption Gateway.
//!
//! Message text is sealed at write time and opened per viewer at read time.
//! The rest of the engine only sees [`EncryptionGateway`]; the cipher behind
//! it is replaceable.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::constants::{
    KDF_CONTEXT_CHAT_KEY, MESSAGE_CIPHER, MESSAGE_KEY_VERSION, NONCE_SIZE, SYMMETRIC_KEY_SIZE,
};
use crate::error::CryptoError;
use crate::types::{ChatId, UserId};

pub type SymmetricKey = [u8; SYMMETRIC_KEY_SIZE];

/// Who is writing, and where.
#[derive(Debug, Clone, Copy)]
pub struct EncryptionContext {
    pub chat_id: ChatId,
    pub sender_id: UserId,
}

/// Who is reading, and where.
#[derive(Debug, Clone, Copy)]
pub struct DecryptionContext {
    pub chat_id: ChatId,
    pub viewer_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionMetadata {
    pub algorithm: String,
    pub key_version: u32,
}

/// An at-rest text record: ciphertext plus what is needed to open it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedText {
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    pub metadata: EncryptionMetadata,
}

/// Output of [`EncryptionGateway::encrypt`].
#[derive(Debug, Clone)]
pub struct Encrypted {
    pub sealed: SealedText,
    /// What the sender's own client gets back. Never persisted.
    pub plaintext_for_sender: String,
}

pub trait EncryptionGateway: Send + Sync {
    fn encrypt(&self, plaintext: &str, ctx: &EncryptionContext) -> Result<Encrypted, CryptoError>;

    /// Open a sealed record for one viewer. Callers check read access first;
    /// an implementation may refuse a viewer on its own terms.
    fn decrypt(&self, sealed: &SealedText, ctx: &DecryptionContext) -> Result<String, CryptoError>;
}

/// XChaCha20-Poly1305 with one key per chat, derived from a master key.
pub struct ChatKeyGateway {
    master_key: SymmetricKey,
}

impl ChatKeyGateway {
    pub fn new(master_key: SymmetricKey) -> Self {
        Self { master_key }
    }

    fn chat_key(&self, chat_id: &ChatId) -> SymmetricKey {
        derive_chat_key(&self.master_key, chat_id.as_bytes())
    }
}

impl EncryptionGateway for ChatKeyGateway {
    fn encrypt(&self, plaintext: &str, ctx: &EncryptionContext) -> Result<Encrypted, CryptoError> {
        let key = self.chat_key(&ctx.chat_id);
        let ciphertext = encrypt(&key, plaintext.as_bytes())?;
        Ok(Encrypted {
            sealed: SealedText {
                ciphertext,
                metadata: EncryptionMetadata {
                    algorithm: MESSAGE_CIPHER.to_string(),
                    key_version: MESSAGE_KEY_VERSION,
                },
            },
            plaintext_for_sender: plaintext.to_string(),
        })
    }

    fn decrypt(&self, sealed: &SealedText, ctx: &DecryptionContext) -> Result<String, CryptoError> {
        if sealed.metadata.algorithm != MESSAGE_CIPHER {
            return Err(CryptoError::UnsupportedAlgorithm(
                sealed.metadata.algorithm.clone(),
            ));
        }
        let key = self.chat_key(&ctx.chat_id);
        let bytes = decrypt(&key, &sealed.ciphertext)?;
        String::from_utf8(bytes).map_err(|_| CryptoError::InvalidUtf8)
    }
}

pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

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

// BLAKE3 KDF with domain separation
pub fn derive_chat_key(master_key: &[u8], chat_id: &[u8]) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_CHAT_KEY);
    hasher.update(master_key);
    hasher.update(chat_id);
    *hasher.finalize().as_bytes()
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(chat_id: ChatId) -> (EncryptionContext, DecryptionContext) {
        let user = UserId::new();
        (
            EncryptionContext {
                chat_id,
                sender_id: user,
            },
            DecryptionContext {
                chat_id,
                viewer_id: user,
            },
        )
    }

    #[test]
    fn test_gateway_seals_and_opens() {
        let gateway = ChatKeyGateway::new(generate_symmetric_key());
        let (enc, dec) = ctx(ChatId::new());

        let out = gateway.encrypt("Ward 4 handover at 7", &enc).unwrap();
        assert_eq!(out.plaintext_for_sender, "Ward 4 handover at 7");
        assert_ne!(out.sealed.ciphertext, b"Ward 4 handover at 7".to_vec());
        assert_eq!(out.sealed.metadata.algorithm, MESSAGE_CIPHER);

        assert_eq!(gateway.decrypt(&out.sealed, &dec).unwrap(), "Ward 4 handover at 7");
    }

    #[test]
    fn test_other_chat_key_cannot_open() {
        let gateway = ChatKeyGateway::new(generate_symmetric_key());
        let (enc, _) = ctx(ChatId::new());
        let (_, wrong) = ctx(ChatId::new());

        let out = gateway.encrypt("secret", &enc).unwrap();
        assert!(gateway.decrypt(&out.sealed, &wrong).is_err());
    }

    #[test]
    fn test_unknown_algorithm_rejected() {
        let gateway = ChatKeyGateway::new(generate_symmetric_key());
        let (enc, dec) = ctx(ChatId::new());

        let mut out = gateway.encrypt("hi", &enc).unwrap();
        out.sealed.metadata.algorithm = "rot13".into();
        assert!(matches!(
            gateway.decrypt(&out.sealed, &dec),
            Err(CryptoError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = generate_symmetric_key();
        let mut encrypted = encrypt(&key, b"Important data").unwrap();
        let len = encrypted.len();
        encrypted[len - 1] ^= 0xFF;

        assert!(decrypt(&key, &encrypted).is_err());
    }

    #[test]
    fn test_empty_data_fails() {
        let key = generate_symmetric_key();
        assert!(decrypt(&key, &[]).is_err());
    }

    #[test]
    fn test_sealed_text_json_uses_base64() {
        let sealed = SealedText {
            ciphertext: vec![0xDE, 0xAD, 0xBE, 0xEF],
            metadata: EncryptionMetadata {
                algorithm: MESSAGE_CIPHER.into(),
                key_version: 1,
            },
        };
        let json = serde_json::to_value(&sealed).unwrap();
        assert_eq!(json["ciphertext"], "3q2+7w==");
        let back: SealedText = serde_json::from_value(json).unwrap();
        assert_eq!(back, sealed);
    }
}
