//! Local verification of inbound access tokens.
//!
//! Verification is purely computational except for the bounded one-shot
//! key-cache refresh: when no cached key verifies the token, the cache is
//! force-refreshed exactly once and the token retried before the request is
//! declared invalid. An expired token is not a fault; it maps to
//! [`SessionError::TryRefreshToken`] so the caller can invoke the rotator.

use crate::config::{AntiCsrfMode, SessionConfig};
use crate::error::SessionError;
use crate::key_cache::KeyCache;
use crate::registry::HandleRegistry;
use crate::session::VerifiedSession;
use crate::token::{self, AccessTokenClaims, TokenError};
use crate::validators::{
    entry, run_validators, ChainOutcome, ClaimSource, ClaimValidator, ValidationContext,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Anti-CSRF evidence extracted from the inbound request.
#[derive(Debug, Clone, Default)]
pub struct AntiCsrfTokens {
    /// The explicit anti-CSRF token, for [`AntiCsrfMode::ViaToken`].
    pub header_token: Option<String>,
    /// Whether the custom header was present, for
    /// [`AntiCsrfMode::ViaCustomHeader`].
    pub custom_header_present: bool,
}

impl AntiCsrfTokens {
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn via_token(token: impl Into<String>) -> Self {
        Self {
            header_token: Some(token.into()),
            custom_header_present: false,
        }
    }
}

pub struct SessionVerifier {
    config: Arc<SessionConfig>,
    key_cache: Arc<KeyCache>,
    registry: Arc<HandleRegistry>,
    validators: Vec<Arc<dyn ClaimValidator>>,
    claim_source: Arc<dyn ClaimSource>,
}

impl SessionVerifier {
    pub(crate) fn new(
        config: Arc<SessionConfig>,
        key_cache: Arc<KeyCache>,
        registry: Arc<HandleRegistry>,
        validators: Vec<Arc<dyn ClaimValidator>>,
        claim_source: Arc<dyn ClaimSource>,
    ) -> Self {
        Self {
            config,
            key_cache,
            registry,
            validators,
            claim_source,
        }
    }

    /// Verify an access token with the configured validator set.
    ///
    /// # Errors
    ///
    /// - `TryRefreshToken` when the token is well-formed and signed but past
    ///   its expiry,
    /// - `SignatureMismatch` when no key verifies it even after the bounded
    ///   key refresh,
    /// - `TokenInvalid` for malformed tokens,
    /// - `Unauthorised` for anti-CSRF failures,
    /// - `ClaimValidationFailed` when a validator rejects,
    /// - transport failures from the key-cache refresh.
    pub async fn verify(
        &self,
        access_token: &str,
        anti_csrf: AntiCsrfTokens,
        do_anti_csrf_check: bool,
    ) -> Result<VerifiedSession, SessionError> {
        self.verify_with_validators(access_token, anti_csrf, do_anti_csrf_check, &self.validators)
            .await
    }

    /// Same as [`verify`](Self::verify), with a caller-supplied validator
    /// set overriding the configured one.
    ///
    /// # Errors
    ///
    /// See [`verify`](Self::verify).
    pub async fn verify_with_validators(
        &self,
        access_token: &str,
        anti_csrf: AntiCsrfTokens,
        do_anti_csrf_check: bool,
        validators: &[Arc<dyn ClaimValidator>],
    ) -> Result<VerifiedSession, SessionError> {
        let now = crate::now_unix_seconds();
        let claims = self.decode_with_bounded_retry(access_token, now).await?;

        if do_anti_csrf_check {
            self.check_anti_csrf(&claims, &anti_csrf)?;
        }

        let ctx = ValidationContext {
            session_handle: claims.session_handle.clone(),
            user_id: claims.user_id.clone(),
            recipe_user_id: claims.recipe_user_id.clone(),
            now_unix_seconds: now,
        };
        let payload = self.run_claim_chain(claims.custom.clone(), validators, &ctx)?;

        self.registry.record(&claims.session_handle, payload.clone()).await;

        Ok(VerifiedSession::new(
            claims.session_handle,
            claims.user_id,
            claims.recipe_user_id,
            claims.refresh_token_version,
            claims.exp,
            payload,
        ))
    }

    async fn decode_with_bounded_retry(
        &self,
        access_token: &str,
        now: i64,
    ) -> Result<AccessTokenClaims, SessionError> {
        let keys = self.key_cache.get(false).await?;
        let skew = self.config.clock_skew_seconds();
        match token::decode_and_verify(access_token, &keys, now, skew) {
            Ok(claims) => Ok(claims),
            Err(TokenError::Expired) => Err(SessionError::TryRefreshToken),
            Err(TokenError::UnknownKid(kid)) => {
                debug!("no cached key for kid {kid}, forcing one key refresh");
                self.retry_after_refresh(access_token, now, skew).await
            }
            Err(TokenError::InvalidSignature) => {
                debug!("signature failed against cached keys, forcing one key refresh");
                self.retry_after_refresh(access_token, now, skew).await
            }
            Err(other) => Err(SessionError::TokenInvalid(other)),
        }
    }

    async fn retry_after_refresh(
        &self,
        access_token: &str,
        now: i64,
        skew: i64,
    ) -> Result<AccessTokenClaims, SessionError> {
        let keys = self.key_cache.get(true).await?;
        match token::decode_and_verify(access_token, &keys, now, skew) {
            Ok(claims) => Ok(claims),
            Err(TokenError::Expired) => Err(SessionError::TryRefreshToken),
            Err(TokenError::UnknownKid(_) | TokenError::InvalidSignature) => {
                Err(SessionError::SignatureMismatch)
            }
            Err(other) => Err(SessionError::TokenInvalid(other)),
        }
    }

    fn check_anti_csrf(
        &self,
        claims: &AccessTokenClaims,
        presented: &AntiCsrfTokens,
    ) -> Result<(), SessionError> {
        match self.config.anti_csrf() {
            AntiCsrfMode::ViaToken => {
                let embedded = claims.anti_csrf_token.as_deref();
                match (embedded, presented.header_token.as_deref()) {
                    (Some(expected), Some(found)) if expected == found => Ok(()),
                    _ => Err(SessionError::unauthorised(
                        "anti-csrf token missing or mismatched",
                    )),
                }
            }
            AntiCsrfMode::ViaCustomHeader => {
                if presented.custom_header_present {
                    Ok(())
                } else {
                    Err(SessionError::unauthorised(
                        "anti-csrf custom header missing",
                    ))
                }
            }
            AntiCsrfMode::None => Ok(()),
        }
    }

    fn run_claim_chain(
        &self,
        mut payload: serde_json::Map<String, serde_json::Value>,
        validators: &[Arc<dyn ClaimValidator>],
        ctx: &ValidationContext,
    ) -> Result<serde_json::Map<String, serde_json::Value>, SessionError> {
        let mut refetched: HashSet<String> = HashSet::new();
        loop {
            match run_validators(&payload, validators, ctx, &refetched) {
                ChainOutcome::Ok => return Ok(payload),
                ChainOutcome::Failed { claim_key, reason } => {
                    return Err(SessionError::ClaimValidationFailed { claim_key, reason });
                }
                ChainOutcome::RefetchRequired { claim_key } => {
                    // Each claim is refetched at most once per verification,
                    // which bounds this loop at the validator count.
                    refetched.insert(claim_key.clone());
                    if let Some(fresh) = self.claim_source.fetch_claim(&claim_key, ctx) {
                        debug!("refetched claim {claim_key}");
                        payload.insert(claim_key, entry(fresh, ctx.now_unix_seconds));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::AuthorityClient;
    use crate::keys::test_keys::RSA_2048_PEM_1;
    use crate::keys::SigningKeyPair;
    use crate::memory_authority::MemoryAuthority;
    use crate::validators::{BooleanClaimValidator, NoopClaimSource};
    use serde_json::{json, Value};
    use std::time::Duration;

    fn key_pair(kid: &str) -> SigningKeyPair {
        SigningKeyPair::from_private_key_pem_or_der(RSA_2048_PEM_1.as_bytes(), kid)
            .expect("test key parses")
    }

    struct Fixture {
        authority: MemoryAuthority,
        verifier: SessionVerifier,
    }

    fn fixture(validators: Vec<Arc<dyn ClaimValidator>>, claim_source: Arc<dyn ClaimSource>) -> Fixture {
        let authority = MemoryAuthority::new(key_pair("k1"));
        let client = AuthorityClient::in_memory(authority.clone());
        let config = Arc::new(SessionConfig::new(
            url::Url::parse("http://authority.local").expect("static url parses"),
        ));
        let key_cache = Arc::new(KeyCache::new(client, Duration::from_secs(60)));
        let registry = Arc::new(HandleRegistry::new(Duration::from_secs(60)));
        let verifier = SessionVerifier::new(config, key_cache, registry, validators, claim_source);
        Fixture {
            authority,
            verifier,
        }
    }

    async fn login(fixture: &Fixture, claims: serde_json::Map<String, Value>) -> String {
        let client = AuthorityClient::in_memory(fixture.authority.clone());
        let triple = client
            .create_session("u1", None, claims, false)
            .await
            .expect("session mints");
        triple.access_token.token
    }

    #[tokio::test]
    async fn valid_token_verifies_and_is_idempotent() {
        let fixture = fixture(Vec::new(), Arc::new(NoopClaimSource));
        let access_token = login(&fixture, serde_json::Map::new()).await;

        let first = fixture
            .verifier
            .verify(&access_token, AntiCsrfTokens::none(), false)
            .await
            .expect("verifies");
        assert_eq!(first.user_id(), "u1");

        let second = fixture
            .verifier
            .verify(&access_token, AntiCsrfTokens::none(), false)
            .await
            .expect("verifies");
        assert_eq!(second.session_handle(), first.session_handle());
        assert_eq!(second.claims(), first.claims());

        // Both verifications were served by the single initial key fetch.
        assert_eq!(fixture.authority.keys_fetch_count(), 1);
    }

    #[tokio::test]
    async fn unknown_signer_triggers_exactly_one_forced_refresh() {
        let fixture = fixture(Vec::new(), Arc::new(NoopClaimSource));
        let access_token = login(&fixture, serde_json::Map::new()).await;

        // Warm the cache, then rotate the authority onto a key the cache has
        // never seen and retire the old one.
        fixture
            .verifier
            .verify(&access_token, AntiCsrfTokens::none(), false)
            .await
            .expect("verifies");
        assert_eq!(fixture.authority.keys_fetch_count(), 1);
        fixture.authority.rotate_signing_key(key_pair("k2"));
        fixture.authority.retire_old_signing_keys();

        let fresh_token = login(&fixture, serde_json::Map::new()).await;
        let verified = fixture
            .verifier
            .verify(&fresh_token, AntiCsrfTokens::none(), false)
            .await
            .expect("verifies after forced refresh");
        assert_eq!(verified.user_id(), "u1");
        assert_eq!(fixture.authority.keys_fetch_count(), 2);

        // A token signed by a key absent from the refreshed set fails with
        // SignatureMismatch after one more forced refresh, not a retry loop.
        let orphan_pair = key_pair("k-orphan");
        let orphan_authority = MemoryAuthority::new(orphan_pair);
        let orphan_client = AuthorityClient::in_memory(orphan_authority);
        let orphan = orphan_client
            .create_session("u9", None, serde_json::Map::new(), false)
            .await
            .expect("session mints");
        let result = fixture
            .verifier
            .verify(&orphan.access_token.token, AntiCsrfTokens::none(), false)
            .await;
        assert!(matches!(result, Err(SessionError::SignatureMismatch)));
        assert_eq!(fixture.authority.keys_fetch_count(), 3);
    }

    #[tokio::test]
    async fn expired_token_requests_refresh() {
        let authority = MemoryAuthority::new(key_pair("k1")).with_access_token_ttl_seconds(-10);
        let client = AuthorityClient::in_memory(authority.clone());
        let config = Arc::new(
            SessionConfig::new(url::Url::parse("http://authority.local").expect("url parses"))
                .with_clock_skew_seconds(0),
        );
        let key_cache = Arc::new(KeyCache::new(client.clone(), Duration::from_secs(60)));
        let registry = Arc::new(HandleRegistry::new(Duration::from_secs(60)));
        let verifier = SessionVerifier::new(
            config,
            key_cache,
            registry,
            Vec::new(),
            Arc::new(NoopClaimSource),
        );

        let triple = client
            .create_session("u1", None, serde_json::Map::new(), false)
            .await
            .expect("session mints");
        let result = verifier
            .verify(&triple.access_token.token, AntiCsrfTokens::none(), false)
            .await;
        assert!(matches!(result, Err(SessionError::TryRefreshToken)));
    }

    #[tokio::test]
    async fn garbage_tokens_are_invalid_not_retried() {
        let fixture = fixture(Vec::new(), Arc::new(NoopClaimSource));
        let result = fixture
            .verifier
            .verify("definitely.not.a-token", AntiCsrfTokens::none(), false)
            .await;
        assert!(matches!(result, Err(SessionError::TokenInvalid(_))));
        // Malformed input never costs a forced refresh.
        assert_eq!(fixture.authority.keys_fetch_count(), 1);
    }

    #[tokio::test]
    async fn claim_chain_gates_verification() {
        let validators: Vec<Arc<dyn ClaimValidator>> =
            vec![Arc::new(BooleanClaimValidator::is_true("emailVerified"))];
        let fixture = fixture(validators, Arc::new(NoopClaimSource));

        let mut claims = serde_json::Map::new();
        claims.insert(
            "emailVerified".to_string(),
            entry(json!(false), crate::now_unix_seconds()),
        );
        let access_token = login(&fixture, claims).await;

        let result = fixture
            .verifier
            .verify(&access_token, AntiCsrfTokens::none(), false)
            .await;
        assert!(matches!(
            result,
            Err(SessionError::ClaimValidationFailed { claim_key, .. }) if claim_key == "emailVerified"
        ));
    }

    #[tokio::test]
    async fn claim_source_supplies_missing_claims() {
        struct StaticSource;
        impl ClaimSource for StaticSource {
            fn fetch_claim(&self, claim_key: &str, _ctx: &ValidationContext) -> Option<Value> {
                (claim_key == "emailVerified").then(|| json!(true))
            }
        }

        let validators: Vec<Arc<dyn ClaimValidator>> =
            vec![Arc::new(BooleanClaimValidator::is_true("emailVerified"))];
        let fixture = fixture(validators, Arc::new(StaticSource));

        // The token carries no claim at all; the source supplies it.
        let access_token = login(&fixture, serde_json::Map::new()).await;
        let verified = fixture
            .verifier
            .verify(&access_token, AntiCsrfTokens::none(), false)
            .await
            .expect("verifies with refetched claim");
        assert_eq!(verified.claim_value("emailVerified"), Some(&json!(true)));
    }
}
