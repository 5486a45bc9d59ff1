//! The configured session engine, wired once at startup.
//!
//! `SessionService` is the explicit dependency-injection context: it owns the
//! key cache, authority client, validator registry, and handle registry, and
//! request-handling code receives it rather than reaching for global state.

use crate::authority::{AuthorityClient, SessionMetadata};
use crate::config::{AntiCsrfMode, SessionConfig};
use crate::error::SessionError;
use crate::key_cache::KeyCache;
use crate::registry::HandleRegistry;
use crate::rotator::SessionRotator;
use crate::session::{SessionTriple, TokenInfo, VerifiedSession};
use crate::validators::{entry, ClaimSource, ClaimValidator, NoopClaimSource};
use crate::verifier::{AntiCsrfTokens, SessionVerifier};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::instrument;

pub struct SessionService {
    config: Arc<SessionConfig>,
    authority: AuthorityClient,
    key_cache: Arc<KeyCache>,
    registry: Arc<HandleRegistry>,
    validators: Vec<Arc<dyn ClaimValidator>>,
    claim_source: Arc<dyn ClaimSource>,
    verifier: SessionVerifier,
    rotator: SessionRotator,
}

impl SessionService {
    #[must_use]
    pub fn new(config: SessionConfig, authority: AuthorityClient) -> Self {
        Self::assemble(
            Arc::new(config),
            authority,
            Vec::new(),
            Arc::new(NoopClaimSource),
        )
    }

    /// Build a service talking HTTP(S) to the configured authority.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn http(config: SessionConfig) -> Result<Self, SessionError> {
        let authority = AuthorityClient::http(
            config.authority_url().clone(),
            config.authority_api_key().cloned(),
        )?;
        Ok(Self::new(config, authority))
    }

    #[must_use]
    pub fn with_validators(self, validators: Vec<Arc<dyn ClaimValidator>>) -> Self {
        Self::assemble(self.config, self.authority, validators, self.claim_source)
    }

    #[must_use]
    pub fn with_claim_source(self, claim_source: Arc<dyn ClaimSource>) -> Self {
        Self::assemble(self.config, self.authority, self.validators, claim_source)
    }

    fn assemble(
        config: Arc<SessionConfig>,
        authority: AuthorityClient,
        validators: Vec<Arc<dyn ClaimValidator>>,
        claim_source: Arc<dyn ClaimSource>,
    ) -> Self {
        let key_cache = Arc::new(KeyCache::new(authority.clone(), config.key_cache_ttl()));
        let registry = Arc::new(HandleRegistry::new(config.registry_ttl()));
        let verifier = SessionVerifier::new(
            Arc::clone(&config),
            Arc::clone(&key_cache),
            Arc::clone(&registry),
            validators.clone(),
            Arc::clone(&claim_source),
        );
        let rotator = SessionRotator::new(
            Arc::clone(&config),
            authority.clone(),
            Arc::clone(&registry),
        );
        Self {
            config,
            authority,
            key_cache,
            registry,
            validators,
            claim_source,
            verifier,
            rotator,
        }
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[must_use]
    pub fn verifier(&self) -> &SessionVerifier {
        &self.verifier
    }

    #[must_use]
    pub fn rotator(&self) -> &SessionRotator {
        &self.rotator
    }

    #[must_use]
    pub fn key_cache(&self) -> &Arc<KeyCache> {
        &self.key_cache
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    /// Mint a session for a freshly authenticated user.
    ///
    /// # Errors
    ///
    /// Propagates authority failures.
    #[instrument(skip(self, claims))]
    pub async fn create_session(
        &self,
        user_id: &str,
        recipe_user_id: Option<&str>,
        claims: Map<String, Value>,
    ) -> Result<SessionTriple, SessionError> {
        let enable_anti_csrf = self.config.anti_csrf() == AntiCsrfMode::ViaToken;
        let triple = self
            .authority
            .create_session(user_id, recipe_user_id, claims, enable_anti_csrf)
            .await?;
        self.registry
            .record(&triple.session_handle, triple.claims.clone())
            .await;
        Ok(triple)
    }

    /// Verify an inbound access token locally. See
    /// [`SessionVerifier::verify`].
    ///
    /// # Errors
    ///
    /// See [`SessionVerifier::verify`].
    pub async fn verify(
        &self,
        access_token: &str,
        anti_csrf: AntiCsrfTokens,
        do_anti_csrf_check: bool,
    ) -> Result<VerifiedSession, SessionError> {
        self.verifier
            .verify(access_token, anti_csrf, do_anti_csrf_check)
            .await
    }

    /// Exchange a refresh token. See [`SessionRotator::refresh`].
    ///
    /// # Errors
    ///
    /// See [`SessionRotator::refresh`].
    pub async fn refresh(
        &self,
        refresh_token: &str,
        anti_csrf_token: Option<&str>,
    ) -> Result<SessionTriple, SessionError> {
        self.rotator.refresh(refresh_token, anti_csrf_token).await
    }

    /// Update one claim on a session, producing a newly signed access token.
    /// Existing tokens are untouched; they carry the old claim value until
    /// refreshed.
    ///
    /// # Errors
    ///
    /// Fails with `Unauthorised` for unknown handles or `AuthorityProtocol`
    /// when the authority omits the re-signed token.
    #[instrument(skip(self, value))]
    pub async fn update_claim(
        &self,
        session_handle: &str,
        claim_key: &str,
        value: Value,
    ) -> Result<TokenInfo, SessionError> {
        let mut update = Map::new();
        update.insert(
            claim_key.to_string(),
            entry(value, crate::now_unix_seconds()),
        );
        let regenerated = self.authority.regenerate(session_handle, update).await?;
        self.registry.invalidate(session_handle).await;
        regenerated.access_token.ok_or_else(|| {
            SessionError::AuthorityProtocol("regenerate returned no access token".to_string())
        })
    }

    /// Remove one claim from a session, producing a newly signed access
    /// token.
    ///
    /// # Errors
    ///
    /// See [`update_claim`](Self::update_claim).
    #[instrument(skip(self))]
    pub async fn remove_claim(
        &self,
        session_handle: &str,
        claim_key: &str,
    ) -> Result<TokenInfo, SessionError> {
        let mut update = Map::new();
        update.insert(claim_key.to_string(), Value::Null);
        let regenerated = self.authority.regenerate(session_handle, update).await?;
        self.registry.invalidate(session_handle).await;
        regenerated.access_token.ok_or_else(|| {
            SessionError::AuthorityProtocol("regenerate returned no access token".to_string())
        })
    }

    /// Revoke a session handle at the authority and drop the local view.
    /// A revoked handle is never reused.
    ///
    /// # Errors
    ///
    /// Propagates authority failures.
    #[instrument(skip(self))]
    pub async fn revoke(&self, session_handle: &str) -> Result<bool, SessionError> {
        let revoked = self.authority.revoke_session(session_handle).await?;
        self.registry.invalidate(session_handle).await;
        Ok(revoked)
    }

    /// Revoke every session belonging to a user.
    ///
    /// # Errors
    ///
    /// Propagates authority failures.
    #[instrument(skip(self))]
    pub async fn revoke_all_for_user(&self, user_id: &str) -> Result<Vec<String>, SessionError> {
        let handles = self.authority.revoke_user_sessions(user_id).await?;
        for handle in &handles {
            self.registry.invalidate(handle).await;
        }
        Ok(handles)
    }

    /// Live session handles for a user.
    ///
    /// # Errors
    ///
    /// Propagates authority failures.
    pub async fn session_handles_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<String>, SessionError> {
        self.authority.session_handles_for_user(user_id).await
    }

    /// Verification delegated to the authority, for flows that must consult
    /// durable session state instead of the fast local path.
    ///
    /// # Errors
    ///
    /// See [`AuthorityClient::verify_session`].
    pub async fn delegated_verify(
        &self,
        access_token: &str,
    ) -> Result<SessionMetadata, SessionError> {
        self.authority.verify_session(access_token).await
    }
}
