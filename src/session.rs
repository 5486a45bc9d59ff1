//! In-memory session views returned to callers.
//!
//! These are constructed fresh per request and never shared across requests.
//! A claim update always produces a new token pair through
//! [`crate::service::SessionService::update_claim`]; nothing here mutates a
//! token in place.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A token plus its issuance metadata, as returned by the authority.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenInfo {
    pub token: String,
    pub expiry: i64,
    pub created_time: i64,
}

/// The access/refresh/anti-CSRF triple minted on login or refresh.
#[derive(Debug, Clone)]
pub struct SessionTriple {
    pub session_handle: String,
    pub user_id: String,
    pub recipe_user_id: String,
    pub access_token: TokenInfo,
    pub refresh_token: TokenInfo,
    pub anti_csrf_token: Option<String>,
    pub claims: Map<String, Value>,
}

/// A successfully verified session.
///
/// Carries no mutation capability: claim updates go through an explicit
/// update operation that re-signs a new token.
#[derive(Debug, Clone)]
pub struct VerifiedSession {
    session_handle: String,
    user_id: String,
    recipe_user_id: String,
    refresh_token_version: u32,
    expiry: i64,
    claims: Map<String, Value>,
}

impl VerifiedSession {
    pub(crate) fn new(
        session_handle: String,
        user_id: String,
        recipe_user_id: String,
        refresh_token_version: u32,
        expiry: i64,
        claims: Map<String, Value>,
    ) -> Self {
        Self {
            session_handle,
            user_id,
            recipe_user_id,
            refresh_token_version,
            expiry,
            claims,
        }
    }

    #[must_use]
    pub fn session_handle(&self) -> &str {
        &self.session_handle
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    #[must_use]
    pub fn recipe_user_id(&self) -> &str {
        &self.recipe_user_id
    }

    #[must_use]
    pub fn refresh_token_version(&self) -> u32 {
        self.refresh_token_version
    }

    #[must_use]
    pub fn expiry(&self) -> i64 {
        self.expiry
    }

    /// The verified claims map, as embedded at issuance.
    #[must_use]
    pub fn claims(&self) -> &Map<String, Value> {
        &self.claims
    }

    /// A claim's raw entry, envelope included if it carries one.
    #[must_use]
    pub fn claim(&self, key: &str) -> Option<&Value> {
        self.claims.get(key)
    }

    /// A claim's value with its freshness envelope unwrapped.
    #[must_use]
    pub fn claim_value(&self, key: &str) -> Option<&Value> {
        let entry = self.claims.get(key)?;
        crate::validators::entry_value(entry).or(Some(entry))
    }
}
