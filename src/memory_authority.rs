//! In-process authority backend.
//!
//! Implements the authority's session state machine behind the same wire
//! shape the HTTP backend speaks: signing keys, session rows, refresh-token
//! rotation chains, and replay detection. Refresh tokens are opaque random
//! values; only their SHA-256 hashes are stored, never the tokens themselves.
//! Each call is serialised through one lock, which is what guarantees
//! at-most-one-successful-rotation per presented refresh token.

use crate::authority::{
    PATH_JWKS, PATH_REFRESH, PATH_REGENERATE, PATH_SESSION, PATH_SESSION_USER, PATH_VERIFY,
    STATUS_OK, STATUS_TOKEN_THEFT_DETECTED, STATUS_TRY_REFRESH_TOKEN, STATUS_UNAUTHORISED,
};
use crate::error::SessionError;
use crate::keys::{SigningKeyPair, SigningKeySet};
use crate::session::TokenInfo;
use crate::token::{self, AccessTokenClaims, TokenError};
use base64ct::{Base64UrlUnpadded, Encoding};
use rand::RngCore;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const DEFAULT_ACCESS_TOKEN_TTL_SECONDS: i64 = 60 * 60;
const DEFAULT_REFRESH_TOKEN_TTL_SECONDS: i64 = 60 * 24 * 60 * 60;

struct SessionRow {
    user_id: String,
    recipe_user_id: String,
    claims: Map<String, Value>,
    current_refresh_hash: String,
    used_refresh_hashes: HashSet<String>,
    refresh_token_version: u32,
    anti_csrf_token: Option<String>,
    refresh_expires_at: i64,
}

struct AuthorityState {
    key_pairs: Vec<SigningKeyPair>,
    sessions: HashMap<String, SessionRow>,
    access_token_ttl_seconds: i64,
    refresh_token_ttl_seconds: i64,
}

struct Inner {
    state: Mutex<AuthorityState>,
    unreachable: AtomicBool,
    keys_fetches: AtomicUsize,
    refresh_calls: AtomicUsize,
}

#[derive(Clone)]
pub struct MemoryAuthority {
    inner: Arc<Inner>,
}

impl MemoryAuthority {
    #[must_use]
    pub fn new(key_pair: SigningKeyPair) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(AuthorityState {
                    key_pairs: vec![key_pair],
                    sessions: HashMap::new(),
                    access_token_ttl_seconds: DEFAULT_ACCESS_TOKEN_TTL_SECONDS,
                    refresh_token_ttl_seconds: DEFAULT_REFRESH_TOKEN_TTL_SECONDS,
                }),
                unreachable: AtomicBool::new(false),
                keys_fetches: AtomicUsize::new(0),
                refresh_calls: AtomicUsize::new(0),
            }),
        }
    }

    #[must_use]
    pub fn with_access_token_ttl_seconds(self, seconds: i64) -> Self {
        self.lock().access_token_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_refresh_token_ttl_seconds(self, seconds: i64) -> Self {
        self.lock().refresh_token_ttl_seconds = seconds;
        self
    }

    /// Add a new signing key; new tokens are signed with it, and older keys
    /// remain published until their windows lapse.
    pub fn rotate_signing_key(&self, key_pair: SigningKeyPair) {
        let mut state = self.lock();
        state.key_pairs.insert(0, key_pair);
    }

    /// Drop every published key except the newest. Verifiers holding a stale
    /// cache will only learn about this through a forced refresh.
    pub fn retire_old_signing_keys(&self) {
        let mut state = self.lock();
        state.key_pairs.truncate(1);
    }

    /// Simulate the authority being down; every call fails with
    /// `AuthorityUnreachable` until cleared.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.unreachable.store(unreachable, Ordering::SeqCst);
    }

    #[must_use]
    pub fn keys_fetch_count(&self) -> usize {
        self.inner.keys_fetches.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn refresh_call_count(&self) -> usize {
        self.inner.refresh_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AuthorityState> {
        self.inner.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn handle(
        &self,
        method: &str,
        path: &str,
        body: &Value,
    ) -> Result<Value, SessionError> {
        if self.inner.unreachable.load(Ordering::SeqCst) {
            return Err(SessionError::AuthorityUnreachable(
                "in-memory authority marked unreachable".to_string(),
            ));
        }
        match (method, path) {
            ("GET", p) if p == PATH_JWKS => self.jwks(),
            ("POST", p) if p == PATH_SESSION => self.create(body),
            ("POST", p) if p == PATH_REFRESH => self.refresh(body),
            ("POST", p) if p == PATH_VERIFY => self.verify(body),
            ("POST", p) if p == PATH_REGENERATE => self.regenerate(body),
            ("DELETE", p) if p == PATH_SESSION => self.revoke(body),
            ("DELETE", p) if p == PATH_SESSION_USER => self.revoke_user(body),
            ("GET", p) if p == PATH_SESSION_USER => self.handles_for_user(body),
            _ => Ok(json!({ "status": "NOT_FOUND" })),
        }
    }

    fn jwks(&self) -> Result<Value, SessionError> {
        self.inner.keys_fetches.fetch_add(1, Ordering::SeqCst);
        let state = self.lock();
        let keys = state
            .key_pairs
            .iter()
            .map(SigningKeyPair::public_key)
            .collect::<Result<Vec<_>, TokenError>>()
            .map_err(|e| SessionError::AuthorityProtocol(format!("unencodable key: {e}")))?;
        Ok(json!({ "status": STATUS_OK, "keys": keys }))
    }

    fn create(&self, body: &Value) -> Result<Value, SessionError> {
        let user_id = body["userId"].as_str().unwrap_or_default().to_string();
        let recipe_user_id = body["recipeUserId"]
            .as_str()
            .unwrap_or(&user_id)
            .to_string();
        let claims = body["userDataInJWT"]
            .as_object()
            .cloned()
            .unwrap_or_default();
        let enable_anti_csrf = body["enableAntiCsrf"].as_bool().unwrap_or_default();

        let now = crate::now_unix_seconds();
        let session_handle = Uuid::new_v4().to_string();
        let refresh_token = generate_opaque_token();
        let mut state = self.lock();
        let row = SessionRow {
            user_id,
            recipe_user_id,
            claims,
            current_refresh_hash: hash_token(&refresh_token),
            used_refresh_hashes: HashSet::new(),
            refresh_token_version: 1,
            anti_csrf_token: enable_anti_csrf.then(|| Uuid::new_v4().to_string()),
            refresh_expires_at: now + state.refresh_token_ttl_seconds,
        };
        let response = triple_response(&state, &session_handle, &row, &refresh_token, now)?;
        state.sessions.insert(session_handle, row);
        Ok(response)
    }

    fn refresh(&self, body: &Value) -> Result<Value, SessionError> {
        self.inner.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let presented = body["refreshToken"].as_str().unwrap_or_default();
        let presented_hash = hash_token(presented);
        let anti_csrf_token = body["antiCsrfToken"].as_str();
        let enable_anti_csrf = body["enableAntiCsrf"].as_bool().unwrap_or_default();
        let now = crate::now_unix_seconds();

        let mut state = self.lock();

        let current_match = state
            .sessions
            .iter()
            .find(|(_, row)| row.current_refresh_hash == presented_hash)
            .map(|(handle, _)| handle.clone());

        if let Some(handle) = current_match {
            if let Some(mut row) = state.sessions.remove(&handle) {
                if row.refresh_expires_at <= now {
                    // Dropping the row here is the removal.
                    return Ok(unauthorised("refresh token expired"));
                }
                if enable_anti_csrf
                    && row.anti_csrf_token.is_some()
                    && row.anti_csrf_token.as_deref() != anti_csrf_token
                {
                    state.sessions.insert(handle, row);
                    return Ok(unauthorised("anti-csrf token mismatch"));
                }

                let refresh_token = generate_opaque_token();
                let old_hash =
                    std::mem::replace(&mut row.current_refresh_hash, hash_token(&refresh_token));
                row.used_refresh_hashes.insert(old_hash);
                row.refresh_token_version += 1;
                if enable_anti_csrf {
                    row.anti_csrf_token = Some(Uuid::new_v4().to_string());
                }
                row.refresh_expires_at = now + state.refresh_token_ttl_seconds;

                let response = triple_response(&state, &handle, &row, &refresh_token, now)?;
                state.sessions.insert(handle, row);
                return Ok(response);
            }
        }

        let reused = state
            .sessions
            .iter()
            .find(|(_, row)| row.used_refresh_hashes.contains(&presented_hash))
            .map(|(handle, row)| (handle.clone(), row.user_id.clone()));
        if let Some((handle, user_id)) = reused {
            // Reuse of a rotated-out token is treated as theft: the whole
            // session is torn down.
            state.sessions.remove(&handle);
            return Ok(json!({
                "status": STATUS_TOKEN_THEFT_DETECTED,
                "session": { "handle": handle, "userId": user_id },
            }));
        }

        Ok(unauthorised("session does not exist"))
    }

    fn verify(&self, body: &Value) -> Result<Value, SessionError> {
        let access_token = body["accessToken"].as_str().unwrap_or_default();
        let now = crate::now_unix_seconds();
        let state = self.lock();
        let keys = state
            .key_pairs
            .iter()
            .map(SigningKeyPair::public_key)
            .collect::<Result<Vec<_>, TokenError>>()
            .map_err(|e| SessionError::AuthorityProtocol(format!("unencodable key: {e}")))?;
        let key_set = SigningKeySet::new(keys);

        match token::decode_and_verify(access_token, &key_set, now, 0) {
            Ok(claims) => match state.sessions.get(&claims.session_handle) {
                Some(row) => Ok(session_response(&claims.session_handle, row)),
                None => Ok(unauthorised("session revoked")),
            },
            Err(TokenError::Expired) => Ok(json!({ "status": STATUS_TRY_REFRESH_TOKEN })),
            Err(_) => Ok(unauthorised("invalid access token")),
        }
    }

    fn regenerate(&self, body: &Value) -> Result<Value, SessionError> {
        let session_handle = body["sessionHandle"].as_str().unwrap_or_default().to_string();
        let update = body["userDataInJWT"]
            .as_object()
            .cloned()
            .unwrap_or_default();
        let now = crate::now_unix_seconds();

        let mut state = self.lock();
        let Some(mut row) = state.sessions.remove(&session_handle) else {
            return Ok(unauthorised("session does not exist"));
        };
        // Merge, never replace: claims survive unless explicitly cleared.
        for (key, value) in update {
            if value.is_null() {
                row.claims.remove(&key);
            } else {
                row.claims.insert(key, value);
            }
        }

        let access_token = mint_access_token(&state, &session_handle, &row, now)?;
        let mut response = session_response(&session_handle, &row);
        response["accessToken"] = serde_json::to_value(access_token)
            .map_err(|e| SessionError::AuthorityProtocol(format!("unencodable token: {e}")))?;
        state.sessions.insert(session_handle, row);
        Ok(response)
    }

    fn revoke(&self, body: &Value) -> Result<Value, SessionError> {
        let session_handle = body["sessionHandle"].as_str().unwrap_or_default();
        let removed = self.lock().sessions.remove(session_handle).is_some();
        Ok(json!({ "status": STATUS_OK, "revoked": removed }))
    }

    fn revoke_user(&self, body: &Value) -> Result<Value, SessionError> {
        let user_id = body["userId"].as_str().unwrap_or_default();
        let mut state = self.lock();
        let handles: Vec<String> = state
            .sessions
            .iter()
            .filter(|(_, row)| row.user_id == user_id)
            .map(|(handle, _)| handle.clone())
            .collect();
        for handle in &handles {
            state.sessions.remove(handle);
        }
        Ok(json!({ "status": STATUS_OK, "sessionHandlesRevoked": handles }))
    }

    fn handles_for_user(&self, body: &Value) -> Result<Value, SessionError> {
        let user_id = body["userId"].as_str().unwrap_or_default();
        let state = self.lock();
        let handles: Vec<&String> = state
            .sessions
            .iter()
            .filter(|(_, row)| row.user_id == user_id)
            .map(|(handle, _)| handle)
            .collect();
        Ok(json!({ "status": STATUS_OK, "sessionHandles": handles }))
    }
}

fn unauthorised(message: &str) -> Value {
    json!({ "status": STATUS_UNAUTHORISED, "message": message })
}

fn session_response(session_handle: &str, row: &SessionRow) -> Value {
    json!({
        "status": STATUS_OK,
        "session": {
            "handle": session_handle,
            "userId": row.user_id,
            "recipeUserId": row.recipe_user_id,
            "userDataInJWT": row.claims,
        },
    })
}

fn mint_access_token(
    state: &AuthorityState,
    session_handle: &str,
    row: &SessionRow,
    now: i64,
) -> Result<TokenInfo, SessionError> {
    let key_pair = state
        .key_pairs
        .iter()
        .find(|pair| pair.created_at() <= now && now < pair.expires_at())
        .ok_or_else(|| SessionError::AuthorityProtocol("no usable signing key".to_string()))?;
    let expiry = now + state.access_token_ttl_seconds;
    let claims = AccessTokenClaims {
        session_handle: session_handle.to_string(),
        user_id: row.user_id.clone(),
        recipe_user_id: row.recipe_user_id.clone(),
        refresh_token_version: row.refresh_token_version,
        exp: expiry,
        iat: now,
        anti_csrf_token: row.anti_csrf_token.clone(),
        custom: row.claims.clone(),
    };
    let token = token::encode(&claims, key_pair)
        .map_err(|e| SessionError::AuthorityProtocol(format!("token signing failed: {e}")))?;
    Ok(TokenInfo {
        token,
        expiry,
        created_time: now,
    })
}

fn triple_response(
    state: &AuthorityState,
    session_handle: &str,
    row: &SessionRow,
    refresh_token: &str,
    now: i64,
) -> Result<Value, SessionError> {
    let access_token = mint_access_token(state, session_handle, row, now)?;
    let mut response = session_response(session_handle, row);
    response["accessToken"] = serde_json::to_value(access_token)
        .map_err(|e| SessionError::AuthorityProtocol(format!("unencodable token: {e}")))?;
    response["refreshToken"] = serde_json::to_value(TokenInfo {
        token: refresh_token.to_string(),
        expiry: row.refresh_expires_at,
        created_time: now,
    })
    .map_err(|e| SessionError::AuthorityProtocol(format!("unencodable token: {e}")))?;
    if let Some(anti_csrf) = &row.anti_csrf_token {
        response["antiCsrfToken"] = json!(anti_csrf);
    }
    Ok(response)
}

fn generate_opaque_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    Base64UrlUnpadded::encode_string(&bytes)
}

fn hash_token(token: &str) -> String {
    Base64UrlUnpadded::encode_string(&Sha256::digest(token.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::test_keys::RSA_2048_PEM_1;

    fn authority() -> MemoryAuthority {
        let pair = SigningKeyPair::from_private_key_pem_or_der(RSA_2048_PEM_1.as_bytes(), "k1")
            .expect("test key parses");
        MemoryAuthority::new(pair)
    }

    fn create_session(authority: &MemoryAuthority) -> Value {
        authority
            .handle(
                "POST",
                PATH_SESSION,
                &json!({ "userId": "u1", "enableAntiCsrf": false }),
            )
            .expect("create succeeds")
    }

    #[test]
    fn refresh_rotates_and_flags_reuse_as_theft() {
        let authority = authority();
        let created = create_session(&authority);
        assert_eq!(created["status"], STATUS_OK);
        let first_refresh_token = created["refreshToken"]["token"].as_str().unwrap().to_string();

        let rotated = authority
            .handle("POST", PATH_REFRESH, &json!({ "refreshToken": first_refresh_token }))
            .expect("refresh succeeds");
        assert_eq!(rotated["status"], STATUS_OK);
        assert_ne!(
            rotated["refreshToken"]["token"].as_str().unwrap(),
            first_refresh_token
        );

        // Replaying the rotated-out token is theft and tears the session down.
        let replayed = authority
            .handle("POST", PATH_REFRESH, &json!({ "refreshToken": first_refresh_token }))
            .expect("call succeeds");
        assert_eq!(replayed["status"], STATUS_TOKEN_THEFT_DETECTED);
        assert_eq!(
            replayed["session"]["handle"],
            created["session"]["handle"]
        );
        assert_eq!(authority.session_count(), 0);
    }

    #[test]
    fn unknown_refresh_token_is_unauthorised() {
        let authority = authority();
        let response = authority
            .handle("POST", PATH_REFRESH, &json!({ "refreshToken": "never-issued" }))
            .expect("call succeeds");
        assert_eq!(response["status"], STATUS_UNAUTHORISED);
    }

    #[test]
    fn regenerate_merges_and_null_clears() {
        let authority = authority();
        let created = create_session(&authority);
        let handle = created["session"]["handle"].as_str().unwrap();

        let response = authority
            .handle(
                "POST",
                PATH_REGENERATE,
                &json!({
                    "sessionHandle": handle,
                    "userDataInJWT": { "plan": "pro", "beta": true },
                }),
            )
            .expect("regenerate succeeds");
        assert_eq!(response["session"]["userDataInJWT"]["plan"], "pro");
        assert_eq!(response["session"]["userDataInJWT"]["beta"], true);

        let response = authority
            .handle(
                "POST",
                PATH_REGENERATE,
                &json!({
                    "sessionHandle": handle,
                    "userDataInJWT": { "beta": Value::Null },
                }),
            )
            .expect("regenerate succeeds");
        assert_eq!(response["session"]["userDataInJWT"]["plan"], "pro");
        assert!(response["session"]["userDataInJWT"].get("beta").is_none());
    }

    #[test]
    fn revoke_user_removes_all_their_sessions() {
        let authority = authority();
        create_session(&authority);
        create_session(&authority);
        authority
            .handle("POST", PATH_SESSION, &json!({ "userId": "u2" }))
            .expect("create succeeds");

        let response = authority
            .handle("DELETE", PATH_SESSION_USER, &json!({ "userId": "u1" }))
            .expect("revoke succeeds");
        assert_eq!(
            response["sessionHandlesRevoked"].as_array().unwrap().len(),
            2
        );
        assert_eq!(authority.session_count(), 1);
    }

    #[test]
    fn unreachable_authority_fails_every_call() {
        let authority = authority();
        authority.set_unreachable(true);
        let result = authority.handle("GET", PATH_JWKS, &Value::Null);
        assert!(matches!(result, Err(SessionError::AuthorityUnreachable(_))));

        authority.set_unreachable(false);
        let result = authority.handle("GET", PATH_JWKS, &Value::Null);
        assert!(result.is_ok());
    }
}
