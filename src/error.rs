use crate::token::TokenError;
use thiserror::Error;

/// Failure taxonomy for session operations.
///
/// `TryRefreshToken` is an expected outcome, not a fault: it tells the caller
/// to exchange the refresh token and retry once. `AuthorityUnreachable` is
/// kept separate from `SignatureMismatch` so callers can distinguish "the
/// authority is down" from "the token is genuinely invalid".
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("malformed access token: {0}")]
    TokenInvalid(#[source] TokenError),
    #[error("access token expired, refresh required")]
    TryRefreshToken,
    #[error("no current signing key verifies the access token")]
    SignatureMismatch,
    #[error("unauthorised: {reason}")]
    Unauthorised { reason: String },
    #[error("refresh token reuse detected for session {session_handle}")]
    TokenTheftDetected {
        session_handle: String,
        user_id: String,
    },
    #[error("claim {claim_key} failed validation: {reason}")]
    ClaimValidationFailed { claim_key: String, reason: String },
    #[error("authority unreachable: {0}")]
    AuthorityUnreachable(String),
    #[error("authority returned unrecognised status: {0}")]
    AuthorityProtocol(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SessionError {
    pub(crate) fn unauthorised(reason: impl Into<String>) -> Self {
        Self::Unauthorised {
            reason: reason.into(),
        }
    }

    /// Whether retrying the same request later could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::AuthorityUnreachable(_))
    }
}
