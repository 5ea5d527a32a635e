//! HMAC-signed magic-link capability tokens.
//!
//! A token is `base64url(payload) "." base64url(HMAC-SHA256(secret, payload))`
//! with `payload = utf8(JSON{sid, role, jti, exp})`. Verification is
//! constant-time on the MAC; every failure mode maps to an opaque error.

use crate::error::{AttestationError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const MIN_SECRET_LEN: usize = 32;

/// The counterparty a magic link authorises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenRole {
    Supplier,
    Buyer,
}

impl TokenRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenRole::Supplier => "supplier",
            TokenRole::Buyer => "buyer",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "supplier" => Ok(TokenRole::Supplier),
            "buyer" => Ok(TokenRole::Buyer),
            other => Err(AttestationError::TokenRole(other.to_string())),
        }
    }
}

/// Decoded, authenticated token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MagicLinkClaims {
    pub sid: String,
    pub role: TokenRole,
    pub jti: String,
    pub exp: i64,
}

/// Mints and verifies magic-link tokens with a process-wide secret.
pub struct TokenCodec {
    mac: HmacSha256,
}

impl TokenCodec {
    pub fn new(secret: &[u8]) -> Result<Self> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(AttestationError::SecretTooShort(secret.len()));
        }
        let mac = HmacSha256::new_from_slice(secret)
            .map_err(|_| AttestationError::SecretTooShort(secret.len()))?;
        Ok(Self { mac })
    }

    /// Mint a token for `sid` expiring at `exp` (unix seconds). Returns the
    /// token and its fresh 96-bit `jti`.
    pub fn mint(&self, sid: &str, role: TokenRole, exp: i64) -> (String, String) {
        let mut jti_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut jti_bytes);
        let jti = hex::encode(jti_bytes);

        let claims = MagicLinkClaims {
            sid: sid.to_string(),
            role,
            jti: jti.clone(),
            exp,
        };
        // Claims are a flat struct of strings and an int; serialization
        // cannot fail.
        let payload = serde_json::to_vec(&claims).unwrap_or_default();
        let mac = self.mac(&payload);
        let token = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(mac)
        );
        (token, jti)
    }

    /// Verify MAC (constant-time), expiry, and role of a presented token.
    pub fn verify(&self, token: &str, now: i64) -> Result<MagicLinkClaims> {
        let (payload_b64, mac_b64) = token
            .split_once('.')
            .ok_or(AttestationError::TokenFormat)?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| AttestationError::TokenFormat)?;
        let mac = URL_SAFE_NO_PAD
            .decode(mac_b64)
            .map_err(|_| AttestationError::TokenFormat)?;

        let mut verifier = self.mac.clone();
        verifier.update(&payload);
        verifier
            .verify_slice(&mac)
            .map_err(|_| AttestationError::TokenMac)?;

        let claims: MagicLinkClaims =
            serde_json::from_slice(&payload).map_err(|_| AttestationError::TokenFormat)?;
        if claims.exp <= now {
            return Err(AttestationError::TokenExpired);
        }
        Ok(claims)
    }

    /// `SHA-256(token)` hex — the database lookup key, safe to store.
    pub fn token_hash(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn mac(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = self.mac.clone();
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> TokenCodec {
        TokenCodec::new(&[0xabu8; 32]).unwrap()
    }

    #[test]
    fn test_secret_length_enforced() {
        assert!(TokenCodec::new(&[0u8; 31]).is_err());
        assert!(TokenCodec::new(&[0u8; 32]).is_ok());
    }

    #[test]
    fn test_mint_verify_round_trip() {
        let codec = codec();
        let (token, jti) = codec.mint("a1b2", TokenRole::Supplier, 2_000);
        let claims = codec.verify(&token, 1_000).unwrap();
        assert_eq!(claims.sid, "a1b2");
        assert_eq!(claims.role, TokenRole::Supplier);
        assert_eq!(claims.jti, jti);
        assert_eq!(claims.exp, 2_000);
    }

    #[test]
    fn test_expiry_boundary() {
        let codec = codec();
        let deadline = 10_000;
        let (token, _) = codec.mint("s", TokenRole::Buyer, deadline);
        // One second before the deadline the token is valid.
        assert!(codec.verify(&token, deadline - 1).is_ok());
        // At or after the deadline it is rejected.
        assert!(matches!(
            codec.verify(&token, deadline),
            Err(AttestationError::TokenExpired)
        ));
        assert!(codec.verify(&token, deadline + 1).is_err());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let codec = codec();
        let (token, _) = codec.mint("session", TokenRole::Supplier, i64::MAX);
        let (payload_b64, mac_b64) = token.split_once('.').unwrap();
        let mut payload = URL_SAFE_NO_PAD.decode(payload_b64).unwrap();
        let text = String::from_utf8(payload.clone()).unwrap();
        payload = text.replace("supplier", "buyer\"  ").into_bytes();
        let forged = format!("{}.{}", URL_SAFE_NO_PAD.encode(&payload), mac_b64);
        assert!(matches!(
            codec.verify(&forged, 0),
            Err(AttestationError::TokenMac)
        ));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let (token, _) = codec().mint("session", TokenRole::Buyer, i64::MAX);
        let other = TokenCodec::new(&[0xcdu8; 32]).unwrap();
        assert!(other.verify(&token, 0).is_err());
    }

    #[test]
    fn test_garbage_token_is_format_error() {
        assert!(matches!(
            codec().verify("not-a-token", 0),
            Err(AttestationError::TokenFormat)
        ));
        assert!(codec().verify("a.b.c", 0).is_err());
    }

    #[test]
    fn test_jti_uniqueness() {
        let codec = codec();
        let (_, jti1) = codec.mint("s", TokenRole::Supplier, 100);
        let (_, jti2) = codec.mint("s", TokenRole::Supplier, 100);
        assert_ne!(jti1, jti2);
        assert_eq!(jti1.len(), 24); // 96 bits hex
    }

    #[test]
    fn test_token_hash_is_stable_and_opaque() {
        let (token, _) = codec().mint("s", TokenRole::Buyer, 100);
        let h1 = TokenCodec::token_hash(&token);
        let h2 = TokenCodec::token_hash(&token);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert!(!h1.contains('.'));
    }
}
