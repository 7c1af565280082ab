//! Identity verification.
//!
//! The external identity provider issues bearer tokens of the form
//! `base64url(claims JSON) "." base64url(Ed25519 signature)`, signed with
//! the provider's key. This service only holds the verifying half
//! (`IDENTITY_VERIFIER_SECRET`). Whatever goes wrong during verification,
//! callers see the single opaque [`InvalidToken`] kind -- provider details
//! must not leak.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use causerie_shared::types::Actor;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid token")]
pub struct InvalidToken;

/// Claims carried inside an identity token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Expiry, seconds since the Unix epoch.
    pub exp: i64,
}

impl From<Claims> for Actor {
    fn from(claims: Claims) -> Self {
        Actor {
            user_id: claims.sub,
            tenant_id: claims.tenant_id,
            tenant_role: claims.tenant_role,
            platform_role: claims.platform_role,
            email: claims.email,
            display_name: claims.name,
        }
    }
}

pub struct TokenVerifier {
    key: VerifyingKey,
}

impl TokenVerifier {
    pub fn new(key_bytes: &[u8; 32]) -> Result<Self, String> {
        let key = VerifyingKey::from_bytes(key_bytes)
            .map_err(|_| "IDENTITY_VERIFIER_SECRET is not a valid Ed25519 key".to_string())?;
        Ok(Self { key })
    }

    /// Verify a bearer token and return the authenticated actor.
    pub fn verify(&self, token: &str) -> Result<Actor, InvalidToken> {
        let (payload_b64, signature_b64) = token.split_once('.').ok_or(InvalidToken)?;

        let payload = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| InvalidToken)?;
        let signature_bytes = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| InvalidToken)?;
        let signature = Signature::from_slice(&signature_bytes).map_err(|_| InvalidToken)?;

        self.key
            .verify(&payload, &signature)
            .map_err(|_| InvalidToken)?;

        let claims: Claims = serde_json::from_slice(&payload).map_err(|_| InvalidToken)?;
        if claims.exp <= Utc::now().timestamp() {
            return Err(InvalidToken);
        }

        Ok(claims.into())
    }
}

/// Sign a token the way the identity provider does. The server never signs
/// in production; this exists for tests and local tooling.
pub fn mint_token(claims: &Claims, signing_key: &ed25519_dalek::SigningKey) -> String {
    use ed25519_dalek::Signer;

    let payload = serde_json::to_vec(claims).unwrap_or_default();
    let signature = signing_key.sign(&payload);

    format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(&payload),
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    )
}
