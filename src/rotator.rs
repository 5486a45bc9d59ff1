//! Refresh-token exchange against the authority.
//!
//! Refresh-token validity is authoritative state, so this is the one
//! operation on the hot path that always crosses the network. The authority
//! is the sole serialisation point: a presented refresh token is exchanged at
//! most once, and any later presentation of the same value is reuse.

use crate::authority::AuthorityClient;
use crate::config::{AntiCsrfMode, SessionConfig};
use crate::error::SessionError;
use crate::registry::HandleRegistry;
use crate::session::SessionTriple;
use std::sync::Arc;
use tracing::{error, instrument};

pub struct SessionRotator {
    config: Arc<SessionConfig>,
    authority: AuthorityClient,
    registry: Arc<HandleRegistry>,
}

impl SessionRotator {
    pub(crate) fn new(
        config: Arc<SessionConfig>,
        authority: AuthorityClient,
        registry: Arc<HandleRegistry>,
    ) -> Self {
        Self {
            config,
            authority,
            registry,
        }
    }

    /// Exchange a refresh token for a fresh triple.
    ///
    /// # Errors
    ///
    /// - `TokenTheftDetected` when the token was already rotated out; callers
    ///   must treat this as hard session termination, clear local session
    ///   state, and require full re-authentication. The cached local view is
    ///   dropped here.
    /// - `Unauthorised` when the session handle is revoked or expired
    ///   server-side.
    /// - Transport/protocol failures from the authority call.
    #[instrument(skip_all)]
    pub async fn refresh(
        &self,
        refresh_token: &str,
        anti_csrf_token: Option<&str>,
    ) -> Result<SessionTriple, SessionError> {
        let enable_anti_csrf = self.config.anti_csrf() == AntiCsrfMode::ViaToken;
        match self
            .authority
            .refresh_session(refresh_token, anti_csrf_token, enable_anti_csrf)
            .await
        {
            Ok(triple) => {
                // The local view from the previous token generation is gone.
                self.registry.invalidate(&triple.session_handle).await;
                self.registry
                    .record(&triple.session_handle, triple.claims.clone())
                    .await;
                Ok(triple)
            }
            Err(SessionError::TokenTheftDetected {
                session_handle,
                user_id,
            }) => {
                error!("refresh token reuse for session {session_handle}");
                self.registry.invalidate(&session_handle).await;
                Err(SessionError::TokenTheftDetected {
                    session_handle,
                    user_id,
                })
            }
            Err(err) => Err(err),
        }
    }
}
