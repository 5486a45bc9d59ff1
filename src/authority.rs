//! Client for the remote session authority.
//!
//! All authority calls are JSON request/response with a `status` field
//! distinguishing `OK` from named error statuses; an unrecognised status is a
//! protocol failure, never a silent success. Two backends share the same wire
//! shape: HTTP(S) for production, and an in-process [`MemoryAuthority`] that
//! implements the full authority state machine for tests and local runs.

use crate::error::SessionError;
use crate::keys::SigningKey;
use crate::memory_authority::MemoryAuthority;
use crate::session::{SessionTriple, TokenInfo};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, instrument};
use url::Url;

pub(crate) static APP_USER_AGENT: &str =
    concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

const AUTHORITY_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const AUTHORITY_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const API_KEY_HEADER: &str = "api-key";

pub(crate) const STATUS_OK: &str = "OK";
pub(crate) const STATUS_UNAUTHORISED: &str = "UNAUTHORISED";
pub(crate) const STATUS_TOKEN_THEFT_DETECTED: &str = "TOKEN_THEFT_DETECTED";
pub(crate) const STATUS_TRY_REFRESH_TOKEN: &str = "TRY_REFRESH_TOKEN";

pub(crate) const PATH_JWKS: &str = "/recipe/session/jwks.json";
pub(crate) const PATH_SESSION: &str = "/recipe/session";
pub(crate) const PATH_REFRESH: &str = "/recipe/session/refresh";
pub(crate) const PATH_VERIFY: &str = "/recipe/session/verify";
pub(crate) const PATH_REGENERATE: &str = "/recipe/session/regenerate";
pub(crate) const PATH_SESSION_USER: &str = "/recipe/session/user";

/// Session metadata without tokens, as returned by delegated verification.
#[derive(Debug, Clone)]
pub struct SessionMetadata {
    pub session_handle: String,
    pub user_id: String,
    pub recipe_user_id: String,
    pub claims: Map<String, Value>,
}

/// Result of a claim regeneration: fresh metadata plus the re-signed token.
#[derive(Debug, Clone)]
pub struct RegeneratedToken {
    pub metadata: SessionMetadata,
    pub access_token: Option<TokenInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSession {
    handle: String,
    user_id: String,
    #[serde(default)]
    recipe_user_id: Option<String>,
    #[serde(default, rename = "userDataInJWT")]
    user_data_in_jwt: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTriple {
    session: WireSession,
    access_token: TokenInfo,
    refresh_token: TokenInfo,
    #[serde(default)]
    anti_csrf_token: Option<String>,
}

enum Backend {
    Http {
        client: reqwest::Client,
        base_url: Url,
        api_key: Option<SecretString>,
    },
    Memory(MemoryAuthority),
}

#[derive(Clone)]
pub struct AuthorityClient {
    backend: Arc<Backend>,
}

impl AuthorityClient {
    /// Build an HTTP(S) client for a remote authority.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be constructed.
    pub fn http(base_url: Url, api_key: Option<SecretString>) -> Result<Self, SessionError> {
        let client = reqwest::Client::builder()
            .user_agent(APP_USER_AGENT)
            .connect_timeout(AUTHORITY_CONNECT_TIMEOUT)
            .timeout(AUTHORITY_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SessionError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self {
            backend: Arc::new(Backend::Http {
                client,
                base_url,
                api_key,
            }),
        })
    }

    #[must_use]
    pub fn in_memory(authority: MemoryAuthority) -> Self {
        Self {
            backend: Arc::new(Backend::Memory(authority)),
        }
    }

    async fn call(&self, method: &str, path: &str, body: &Value) -> Result<Value, SessionError> {
        match &*self.backend {
            Backend::Http {
                client,
                base_url,
                api_key,
            } => {
                let url = endpoint_url(base_url, path)?;
                let mut request = match method {
                    "GET" => client.get(url),
                    "DELETE" => client.delete(url),
                    _ => client.post(url),
                };
                if let Some(key) = api_key {
                    request = request.header(API_KEY_HEADER, key.expose_secret());
                }
                if method == "GET" {
                    if let Some(params) = body.as_object() {
                        let params: Vec<(String, String)> = params
                            .iter()
                            .map(|(k, v)| {
                                let value = v
                                    .as_str()
                                    .map_or_else(|| v.to_string(), ToString::to_string);
                                (k.clone(), value)
                            })
                            .collect();
                        request = request.query(&params);
                    }
                } else {
                    request = request.json(body);
                }

                let response = request.send().await.map_err(|e| {
                    error!("authority call to {path} failed: {e}");
                    SessionError::AuthorityUnreachable(e.to_string())
                })?;

                if !response.status().is_success() {
                    let status = response.status();
                    let json_response: Value = response.json().await.unwrap_or_default();
                    let message = json_response["message"].as_str().unwrap_or_default();
                    error!("authority call to {path} failed: {status} {message}");
                    return Err(SessionError::AuthorityProtocol(format!("http {status}")));
                }

                response.json().await.map_err(|e| {
                    SessionError::AuthorityProtocol(format!("invalid json from authority: {e}"))
                })
            }
            Backend::Memory(memory) => {
                // Suspend once so the in-memory backend exercises the same
                // async interleavings as a real transport.
                tokio::task::yield_now().await;
                memory.handle(method, path, body)
            }
        }
    }

    /// Fetch the authority's current signing key set.
    ///
    /// # Errors
    ///
    /// Fails with `AuthorityUnreachable` on transport errors and
    /// `AuthorityProtocol` on unparseable or unrecognised responses.
    #[instrument(skip(self))]
    pub async fn signing_keys(&self) -> Result<Vec<SigningKey>, SessionError> {
        let value = expect_ok(self.call("GET", PATH_JWKS, &Value::Null).await?, PATH_JWKS)?;
        let keys = value.get("keys").cloned().unwrap_or_else(|| json!([]));
        serde_json::from_value(keys)
            .map_err(|e| SessionError::AuthorityProtocol(format!("invalid key set: {e}")))
    }

    /// Mint a new session for a user.
    ///
    /// # Errors
    ///
    /// Fails with the mapped authority status on anything but `OK`.
    #[instrument(skip(self, claims))]
    pub async fn create_session(
        &self,
        user_id: &str,
        recipe_user_id: Option<&str>,
        claims: Map<String, Value>,
        enable_anti_csrf: bool,
    ) -> Result<SessionTriple, SessionError> {
        let body = json!({
            "userId": user_id,
            "recipeUserId": recipe_user_id.unwrap_or(user_id),
            "userDataInJWT": claims,
            "enableAntiCsrf": enable_anti_csrf,
        });
        let value = expect_ok(self.call("POST", PATH_SESSION, &body).await?, PATH_SESSION)?;
        parse_triple(value)
    }

    /// Exchange a refresh token for a new session triple.
    ///
    /// # Errors
    ///
    /// Fails with `TokenTheftDetected` when the presented token was already
    /// rotated out, `Unauthorised` when the session is unknown, or the
    /// transport/protocol failures of any authority call.
    #[instrument(skip_all)]
    pub async fn refresh_session(
        &self,
        refresh_token: &str,
        anti_csrf_token: Option<&str>,
        enable_anti_csrf: bool,
    ) -> Result<SessionTriple, SessionError> {
        let body = json!({
            "refreshToken": refresh_token,
            "antiCsrfToken": anti_csrf_token,
            "enableAntiCsrf": enable_anti_csrf,
        });
        let value = expect_ok(self.call("POST", PATH_REFRESH, &body).await?, PATH_REFRESH)?;
        parse_triple(value)
    }

    /// Delegated verification at the authority. Not used by the fast local
    /// path; exists for flows that must consult durable session state.
    ///
    /// # Errors
    ///
    /// Fails with `TryRefreshToken` for expired tokens, `Unauthorised` for
    /// unknown sessions, or transport/protocol failures.
    #[instrument(skip_all)]
    pub async fn verify_session(&self, access_token: &str) -> Result<SessionMetadata, SessionError> {
        let body = json!({ "accessToken": access_token });
        let value = expect_ok(self.call("POST", PATH_VERIFY, &body).await?, PATH_VERIFY)?;
        parse_metadata(&value)
    }

    /// Re-sign a session's access token with updated claims. A `null` claim
    /// value clears that claim; everything else is merged in.
    ///
    /// # Errors
    ///
    /// Fails with `Unauthorised` for unknown handles, or transport/protocol
    /// failures.
    #[instrument(skip(self, claims_update))]
    pub async fn regenerate(
        &self,
        session_handle: &str,
        claims_update: Map<String, Value>,
    ) -> Result<RegeneratedToken, SessionError> {
        let body = json!({
            "sessionHandle": session_handle,
            "userDataInJWT": claims_update,
        });
        let value = expect_ok(
            self.call("POST", PATH_REGENERATE, &body).await?,
            PATH_REGENERATE,
        )?;
        let metadata = parse_metadata(&value)?;
        let access_token = match value.get("accessToken") {
            Some(raw) => Some(serde_json::from_value(raw.clone()).map_err(|e| {
                SessionError::AuthorityProtocol(format!("invalid access token payload: {e}"))
            })?),
            None => None,
        };
        Ok(RegeneratedToken {
            metadata,
            access_token,
        })
    }

    /// Revoke a single session handle. Returns whether anything was revoked.
    ///
    /// # Errors
    ///
    /// Fails on transport/protocol failures.
    #[instrument(skip(self))]
    pub async fn revoke_session(&self, session_handle: &str) -> Result<bool, SessionError> {
        let body = json!({ "sessionHandle": session_handle });
        let value = expect_ok(self.call("DELETE", PATH_SESSION, &body).await?, PATH_SESSION)?;
        Ok(value["revoked"].as_bool().unwrap_or_default())
    }

    /// Revoke every session belonging to a user. Returns the revoked handles.
    ///
    /// # Errors
    ///
    /// Fails on transport/protocol failures.
    #[instrument(skip(self))]
    pub async fn revoke_user_sessions(&self, user_id: &str) -> Result<Vec<String>, SessionError> {
        let body = json!({ "userId": user_id });
        let value = expect_ok(
            self.call("DELETE", PATH_SESSION_USER, &body).await?,
            PATH_SESSION_USER,
        )?;
        parse_handle_list(&value, "sessionHandlesRevoked")
    }

    /// List the live session handles for a user.
    ///
    /// # Errors
    ///
    /// Fails on transport/protocol failures.
    #[instrument(skip(self))]
    pub async fn session_handles_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<String>, SessionError> {
        let body = json!({ "userId": user_id });
        let value = expect_ok(
            self.call("GET", PATH_SESSION_USER, &body).await?,
            PATH_SESSION_USER,
        )?;
        parse_handle_list(&value, "sessionHandles")
    }
}

fn endpoint_url(base_url: &Url, path: &str) -> Result<Url, SessionError> {
    let mut url = base_url.clone();
    url.set_path(path);
    url.set_query(None);
    Ok(url)
}

fn expect_ok(value: Value, path: &str) -> Result<Value, SessionError> {
    let status = value
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or_default();
    match status {
        STATUS_OK => Ok(value),
        STATUS_UNAUTHORISED => {
            let reason = value["message"]
                .as_str()
                .unwrap_or("session does not exist")
                .to_string();
            Err(SessionError::Unauthorised { reason })
        }
        STATUS_TOKEN_THEFT_DETECTED => Err(SessionError::TokenTheftDetected {
            session_handle: value["session"]["handle"].as_str().unwrap_or_default().to_string(),
            user_id: value["session"]["userId"].as_str().unwrap_or_default().to_string(),
        }),
        STATUS_TRY_REFRESH_TOKEN => Err(SessionError::TryRefreshToken),
        "" => Err(SessionError::AuthorityProtocol(format!(
            "missing status from {path}"
        ))),
        other => Err(SessionError::AuthorityProtocol(other.to_string())),
    }
}

fn parse_triple(value: Value) -> Result<SessionTriple, SessionError> {
    let wire: WireTriple = serde_json::from_value(value)
        .map_err(|e| SessionError::AuthorityProtocol(format!("invalid session payload: {e}")))?;
    let recipe_user_id = wire
        .session
        .recipe_user_id
        .unwrap_or_else(|| wire.session.user_id.clone());
    Ok(SessionTriple {
        session_handle: wire.session.handle,
        user_id: wire.session.user_id,
        recipe_user_id,
        access_token: wire.access_token,
        refresh_token: wire.refresh_token,
        anti_csrf_token: wire.anti_csrf_token,
        claims: wire.session.user_data_in_jwt,
    })
}

fn parse_metadata(value: &Value) -> Result<SessionMetadata, SessionError> {
    let wire: WireSession = serde_json::from_value(value["session"].clone())
        .map_err(|e| SessionError::AuthorityProtocol(format!("invalid session payload: {e}")))?;
    let recipe_user_id = wire.recipe_user_id.unwrap_or_else(|| wire.user_id.clone());
    Ok(SessionMetadata {
        session_handle: wire.handle,
        user_id: wire.user_id,
        recipe_user_id,
        claims: wire.user_data_in_jwt,
    })
}

fn parse_handle_list(value: &Value, field: &str) -> Result<Vec<String>, SessionError> {
    value[field]
        .as_array()
        .map(|handles| {
            handles
                .iter()
                .filter_map(Value::as_str)
                .map(ToString::to_string)
                .collect()
        })
        .ok_or_else(|| SessionError::AuthorityProtocol(format!("missing {field} in response")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecognised_status_is_a_protocol_error() {
        let result = expect_ok(json!({"status": "SOMETHING_NEW"}), PATH_REFRESH);
        assert!(
            matches!(result, Err(SessionError::AuthorityProtocol(status)) if status == "SOMETHING_NEW")
        );

        let result = expect_ok(json!({"noStatus": true}), PATH_REFRESH);
        assert!(matches!(result, Err(SessionError::AuthorityProtocol(_))));
    }

    #[test]
    fn theft_status_carries_session_identity() {
        let value = json!({
            "status": "TOKEN_THEFT_DETECTED",
            "session": {"handle": "h1", "userId": "u1"},
        });
        let result = expect_ok(value, PATH_REFRESH);
        assert!(matches!(
            result,
            Err(SessionError::TokenTheftDetected { session_handle, user_id })
                if session_handle == "h1" && user_id == "u1"
        ));
    }

    #[test]
    fn endpoint_url_keeps_host_and_replaces_path() {
        let base = Url::parse("https://authority.example.test:3567/base").expect("url parses");
        let url = endpoint_url(&base, PATH_JWKS).expect("join succeeds");
        assert_eq!(
            url.as_str(),
            "https://authority.example.test:3567/recipe/session/jwks.json"
        );
    }
}
