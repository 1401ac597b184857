//! Bearer identity tokens.
//!
//! Tokens are issued by an external identity service and signed with its
//! Ed25519 key. The chat server only verifies them.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::ChatError;
use crate::types::UserId;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityToken {
    pub user_id: UserId,
    pub expires_at: DateTime<Utc>,
    pub signature: Vec<u8>,
}

// payload = user_id (16 bytes) || expires_at (rfc3339)
fn signing_payload(user_id: &UserId, expires_at: &DateTime<Utc>) -> Vec<u8> {
    let mut payload = Vec::with_capacity(48);
    payload.extend_from_slice(user_id.as_bytes());
    payload.extend_from_slice(expires_at.to_rfc3339().as_bytes());
    payload
}

impl IdentityToken {
    /// Encode as the opaque string clients present.
    pub fn encode(&self) -> Result<String, ChatError> {
        let json =
            serde_json::to_vec(self).map_err(|e| ChatError::Internal(format!("token encode: {e}")))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    pub fn decode(raw: &str) -> Result<Self, ChatError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(raw.trim())
            .map_err(|_| ChatError::Unauthenticated("Malformed token".into()))?;
        serde_json::from_slice(&bytes).map_err(|_| ChatError::Unauthenticated("Malformed token".into()))
    }

    /// Check signature and expiry. Returns the authenticated user.
    pub fn verify(&self, issuer_pubkey: &[u8; 32], now: DateTime<Utc>) -> Result<UserId, ChatError> {
        if now > self.expires_at {
            return Err(ChatError::Unauthenticated("Token expired".into()));
        }

        let Ok(verifying_key) = VerifyingKey::from_bytes(issuer_pubkey) else {
            return Err(ChatError::Unauthenticated("Authentication failed".into()));
        };
        let Ok(signature) = Signature::from_slice(&self.signature) else {
            return Err(ChatError::Unauthenticated("Authentication failed".into()));
        };

        verifying_key
            .verify(&signing_payload(&self.user_id, &self.expires_at), &signature)
            .map_err(|_| ChatError::Unauthenticated("Authentication failed".into()))?;

        Ok(self.user_id)
    }
}

/// Decode and verify a raw bearer string in one step.
pub fn authenticate(
    raw: &str,
    issuer_pubkey: &[u8; 32],
    now: DateTime<Utc>,
) -> Result<UserId, ChatError> {
    IdentityToken::decode(raw)?.verify(issuer_pubkey, now)
}

/// Sign a token. Used by the identity service and by tests.
pub fn issue_identity_token(
    user_id: UserId,
    expires_at: DateTime<Utc>,
    issuer_signing_key: &ed25519_dalek::SigningKey,
) -> IdentityToken {
    use ed25519_dalek::Signer;

    let signature = issuer_signing_key.sign(&signing_payload(&user_id, &expires_at));

    IdentityToken {
        user_id,
        expires_at,
        signature: signature.to_bytes().to_vec(),
    }
}
