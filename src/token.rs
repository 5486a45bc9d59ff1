use crate::keys::{SigningKeyPair, SigningKeySet};
use base64ct::{Base64UrlUnpadded, Encoding};
use rsa::errors::Error as RsaError;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::Sha256;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenHeader {
    pub alg: String,
    pub typ: String,
    pub kid: String,
}

impl TokenHeader {
    fn rs256(kid: impl Into<String>) -> Self {
        Self {
            alg: "RS256".to_string(),
            typ: "JWT".to_string(),
            kid: kid.into(),
        }
    }
}

/// Claims carried by an access token.
///
/// `custom` holds the free-form application claims; everything else is
/// mandatory session metadata. Claim values are only exposed to callers after
/// the signature has been verified.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccessTokenClaims {
    pub session_handle: String,
    #[serde(rename = "sub")]
    pub user_id: String,
    #[serde(rename = "rsub")]
    pub recipe_user_id: String,
    pub refresh_token_version: u32,
    pub exp: i64,
    pub iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anti_csrf_token: Option<String>,
    #[serde(flatten)]
    pub custom: Map<String, Value>,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token format")]
    TokenFormat,
    #[error("invalid base64url encoding")]
    Base64,
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlg(String),
    #[error("no valid key with id: {0}")]
    UnknownKid(String),
    #[error("failed to parse RSA key")]
    KeyParse,
    #[error("rsa error")]
    Rsa(#[from] RsaError),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
}

fn b64e_json<T: Serialize>(value: &T) -> Result<String, TokenError> {
    let json = serde_json::to_vec(value)?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

fn b64d_json<T: for<'de> Deserialize<'de>>(s: &str) -> Result<T, TokenError> {
    let bytes = Base64UrlUnpadded::decode_vec(s).map_err(|_| TokenError::Base64)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Create an RS256 signed access token.
///
/// # Errors
///
/// Returns an error if claims/header JSON cannot be encoded or signing fails.
pub fn encode(claims: &AccessTokenClaims, key_pair: &SigningKeyPair) -> Result<String, TokenError> {
    let header = TokenHeader::rs256(key_pair.kid());
    let header_b64 = b64e_json(&header)?;
    let claims_b64 = b64e_json(claims)?;
    let signing_input = format!("{header_b64}.{claims_b64}");

    let signing_key = SigningKey::<Sha256>::new(key_pair.rsa_private_key().clone());
    let signature: Signature = signing_key.sign(signing_input.as_bytes());
    let signature_b64 = Base64UrlUnpadded::encode_string(&signature.to_vec());

    Ok(format!("{signing_input}.{signature_b64}"))
}

/// Verify an RS256 access token against a signing-key set and return its
/// decoded claims.
///
/// The signature is checked before any claim value is decoded; expiry is
/// checked last, so `Expired` implies the token was otherwise well-formed and
/// correctly signed. A key that exists in the set but is outside its validity
/// window at `now_unix_seconds` counts as unknown.
///
/// # Errors
///
/// Returns an error if:
/// - the token is malformed or contains invalid base64/json,
/// - no valid key in `keys` matches the token's `kid`,
/// - the signature is invalid,
/// - the token is past its `exp` (beyond `clock_skew_seconds`).
pub fn decode_and_verify(
    token: &str,
    keys: &SigningKeySet,
    now_unix_seconds: i64,
    clock_skew_seconds: i64,
) -> Result<AccessTokenClaims, TokenError> {
    let mut parts = token.split('.');
    let header_b64 = parts.next().ok_or(TokenError::TokenFormat)?;
    let claims_b64 = parts.next().ok_or(TokenError::TokenFormat)?;
    let sig_b64 = parts.next().ok_or(TokenError::TokenFormat)?;
    if parts.next().is_some() {
        return Err(TokenError::TokenFormat);
    }

    let header: TokenHeader = b64d_json(header_b64)?;
    if header.alg != "RS256" {
        return Err(TokenError::UnsupportedAlg(header.alg));
    }

    let key = keys
        .find_valid(&header.kid, now_unix_seconds)
        .ok_or_else(|| TokenError::UnknownKid(header.kid.clone()))?;

    let public_key = key.to_rsa_public_key()?;
    let verifying_key = VerifyingKey::<Sha256>::new(public_key);
    let signing_input = format!("{header_b64}.{claims_b64}");
    let signature_bytes = Base64UrlUnpadded::decode_vec(sig_b64).map_err(|_| TokenError::Base64)?;
    let signature =
        Signature::try_from(signature_bytes.as_slice()).map_err(|_| TokenError::InvalidSignature)?;
    verifying_key
        .verify(signing_input.as_bytes(), &signature)
        .map_err(|_| TokenError::InvalidSignature)?;

    let claims: AccessTokenClaims = b64d_json(claims_b64)?;
    if claims.exp + clock_skew_seconds <= now_unix_seconds {
        return Err(TokenError::Expired);
    }

    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::test_keys::RSA_2048_PEM_1;
    use crate::keys::SigningKeyPair;
    use serde_json::json;

    // Fixed timestamps keep the assertions stable.
    const NOW: i64 = 1_700_000_000;

    fn test_key_pair() -> SigningKeyPair {
        SigningKeyPair::from_private_key_pem_or_der(RSA_2048_PEM_1.as_bytes(), "k1")
            .expect("test key parses")
            .with_validity(NOW - 60, NOW + 86_400)
    }

    fn test_claims() -> AccessTokenClaims {
        let mut custom = Map::new();
        custom.insert("emailVerified".to_string(), json!({"v": true, "t": NOW}));
        AccessTokenClaims {
            session_handle: "h1".to_string(),
            user_id: "u1".to_string(),
            recipe_user_id: "ru1".to_string(),
            refresh_token_version: 1,
            exp: NOW + 3600,
            iat: NOW,
            anti_csrf_token: Some("csrf-1".to_string()),
            custom,
        }
    }

    #[test]
    fn round_trip_sign_and_verify() -> Result<(), TokenError> {
        let pair = test_key_pair();
        let keys = SigningKeySet::new(vec![pair.public_key()?]);
        let token = encode(&test_claims(), &pair)?;

        let verified = decode_and_verify(&token, &keys, NOW, 0)?;
        assert_eq!(verified, test_claims());
        Ok(())
    }

    #[test]
    fn rejects_expired_within_skew_boundary() -> Result<(), TokenError> {
        let pair = test_key_pair();
        let keys = SigningKeySet::new(vec![pair.public_key()?]);
        let token = encode(&test_claims(), &pair)?;

        // Just past expiry but within the skew tolerance.
        let result = decode_and_verify(&token, &keys, NOW + 3601, 2);
        assert!(result.is_ok());

        let result = decode_and_verify(&token, &keys, NOW + 3602, 2);
        assert!(matches!(result, Err(TokenError::Expired)));
        Ok(())
    }

    #[test]
    fn rejects_unknown_kid_and_tampered_payload() -> Result<(), TokenError> {
        let pair = test_key_pair();
        let keys = SigningKeySet::new(vec![pair.public_key()?]);
        let token = encode(&test_claims(), &pair)?;

        let other_keys = SigningKeySet::new(vec![pair.public_key()?.with_kid("k2")]);
        let result = decode_and_verify(&token, &other_keys, NOW, 0);
        assert!(matches!(result, Err(TokenError::UnknownKid(kid)) if kid == "k1"));

        // Swap the payload segment for a re-encoded one with a different user.
        let mut tampered_claims = test_claims();
        tampered_claims.user_id = "attacker".to_string();
        let tampered_b64 = b64e_json(&tampered_claims)?;
        let mut parts: Vec<&str> = token.split('.').collect();
        parts[1] = &tampered_b64;
        let tampered = parts.join(".");
        let result = decode_and_verify(&tampered, &keys, NOW, 0);
        assert!(matches!(result, Err(TokenError::InvalidSignature)));
        Ok(())
    }

    #[test]
    fn rejects_key_outside_validity_window() -> Result<(), TokenError> {
        let pair = test_key_pair().with_validity(NOW - 600, NOW - 300);
        let keys = SigningKeySet::new(vec![pair.public_key()?]);
        let token = encode(&test_claims(), &pair)?;

        let result = decode_and_verify(&token, &keys, NOW, 0);
        assert!(matches!(result, Err(TokenError::UnknownKid(_))));
        Ok(())
    }

    #[test]
    fn rejects_malformed_tokens() {
        let keys = SigningKeySet::new(Vec::new());
        for garbage in ["", "a.b", "a.b.c.d", "not-a-token"] {
            let result = decode_and_verify(garbage, &keys, NOW, 0);
            assert!(
                matches!(result, Err(TokenError::TokenFormat | TokenError::Base64)),
                "expected malformed failure for {garbage:?}"
            );
        }
    }
}
