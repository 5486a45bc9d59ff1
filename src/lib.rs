//! Session issuance, verification, and rotation for HTTP-facing
//! applications.
//!
//! The engine verifies access tokens locally from cached signing-key
//! material, decides when a token must instead be refreshed against the
//! authority, rotates refresh tokens safely under concurrent use, and runs a
//! pluggable chain of claim validators before granting access.
//!
//! Wiring happens once at startup through [`SessionService`]; request
//! handlers talk to the service through the neutral adapter boundary in
//! [`framework`].

pub mod authority;
pub mod config;
pub mod error;
pub mod framework;
pub mod key_cache;
pub mod keys;
pub mod memory_authority;
pub mod registry;
pub mod rotator;
pub mod service;
pub mod session;
pub mod token;
pub mod validators;
pub mod verifier;

pub use authority::{AuthorityClient, RegeneratedToken, SessionMetadata};
pub use config::{AntiCsrfMode, SessionConfig, TokenTransferMethod};
pub use error::SessionError;
pub use key_cache::KeyCache;
pub use keys::{SigningKey, SigningKeyPair, SigningKeySet};
pub use memory_authority::MemoryAuthority;
pub use registry::HandleRegistry;
pub use rotator::SessionRotator;
pub use service::SessionService;
pub use session::{SessionTriple, TokenInfo, VerifiedSession};
pub use token::{AccessTokenClaims, TokenError};
pub use validators::{
    BooleanClaimValidator, ClaimCheck, ClaimSource, ClaimValidator, NoopClaimSource,
    PrimitiveClaimValidator, ValidationContext,
};
pub use verifier::{AntiCsrfTokens, SessionVerifier};

use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn now_unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| i64::try_from(duration.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
