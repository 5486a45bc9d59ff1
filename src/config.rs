//! Deployment configuration for the session engine.
//!
//! Cookie/header names, token placement, and expiry durations are
//! configuration inputs, not protocol constants. Defaults below are the
//! documented configuration surface; every one of them can be overridden with
//! the `with_*` builders or, for the deployment-facing subset, environment
//! variables (`SESIO_*`).

use crate::error::SessionError;
use secrecy::SecretString;
use std::env;
use std::time::Duration;
use url::Url;

const DEFAULT_ACCESS_TOKEN_TTL_SECONDS: i64 = 60 * 60;
const DEFAULT_REFRESH_TOKEN_TTL_SECONDS: i64 = 60 * 24 * 60 * 60;
const DEFAULT_KEY_CACHE_TTL_SECONDS: u64 = 60;
const DEFAULT_CLOCK_SKEW_SECONDS: i64 = 2;
const DEFAULT_REGISTRY_TTL_SECONDS: u64 = 5 * 60;
const DEFAULT_APP_ORIGIN: &str = "http://localhost:3000";
const DEFAULT_ACCESS_TOKEN_COOKIE: &str = "sAccessToken";
const DEFAULT_REFRESH_TOKEN_COOKIE: &str = "sRefreshToken";
const DEFAULT_ANTI_CSRF_HEADER: &str = "anti-csrf";
const DEFAULT_RID_HEADER: &str = "rid";
const DEFAULT_REFRESH_PATH: &str = "/auth/session/refresh";
const DEFAULT_SAME_SITE: &str = "Lax";

/// How a request proves it is not a cross-site forgery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AntiCsrfMode {
    /// An explicit token, compared against the value embedded at issuance.
    ViaToken,
    /// Presence of a custom header implies same-site trust.
    ViaCustomHeader,
    /// No check.
    #[default]
    None,
}

impl AntiCsrfMode {
    fn parse(raw: &str) -> Result<Self, SessionError> {
        match raw {
            "via-token" => Ok(Self::ViaToken),
            "via-custom-header" => Ok(Self::ViaCustomHeader),
            "none" => Ok(Self::None),
            other => Err(SessionError::Config(format!(
                "invalid anti-csrf mode: {other}"
            ))),
        }
    }
}

/// Where tokens travel between client and server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenTransferMethod {
    #[default]
    Cookie,
    Header,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    authority_url: Url,
    authority_api_key: Option<SecretString>,
    app_origin: String,
    cookie_domain: Option<String>,
    access_token_cookie: String,
    refresh_token_cookie: String,
    anti_csrf_header: String,
    rid_header: String,
    anti_csrf: AntiCsrfMode,
    transfer_method: TokenTransferMethod,
    access_token_ttl_seconds: i64,
    refresh_token_ttl_seconds: i64,
    key_cache_ttl: Duration,
    clock_skew_seconds: i64,
    registry_ttl: Duration,
    refresh_path: String,
    same_site: String,
}

impl SessionConfig {
    #[must_use]
    pub fn new(authority_url: Url) -> Self {
        Self {
            authority_url,
            authority_api_key: None,
            app_origin: DEFAULT_APP_ORIGIN.to_string(),
            cookie_domain: None,
            access_token_cookie: DEFAULT_ACCESS_TOKEN_COOKIE.to_string(),
            refresh_token_cookie: DEFAULT_REFRESH_TOKEN_COOKIE.to_string(),
            anti_csrf_header: DEFAULT_ANTI_CSRF_HEADER.to_string(),
            rid_header: DEFAULT_RID_HEADER.to_string(),
            anti_csrf: AntiCsrfMode::default(),
            transfer_method: TokenTransferMethod::default(),
            access_token_ttl_seconds: DEFAULT_ACCESS_TOKEN_TTL_SECONDS,
            refresh_token_ttl_seconds: DEFAULT_REFRESH_TOKEN_TTL_SECONDS,
            key_cache_ttl: Duration::from_secs(DEFAULT_KEY_CACHE_TTL_SECONDS),
            clock_skew_seconds: DEFAULT_CLOCK_SKEW_SECONDS,
            registry_ttl: Duration::from_secs(DEFAULT_REGISTRY_TTL_SECONDS),
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            same_site: DEFAULT_SAME_SITE.to_string(),
        }
    }

    /// Build a configuration from `SESIO_*` environment variables.
    ///
    /// `SESIO_AUTHORITY_URL` is required; `SESIO_AUTHORITY_API_KEY`,
    /// `SESIO_APP_ORIGIN`, `SESIO_ANTI_CSRF`
    /// (`via-token`|`via-custom-header`|`none`),
    /// `SESIO_ACCESS_TOKEN_TTL_SECONDS`, and `SESIO_REFRESH_TOKEN_TTL_SECONDS`
    /// override their defaults when present.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but unparseable, or the
    /// authority URL is missing or invalid.
    pub fn from_env() -> Result<Self, SessionError> {
        let raw_url = env::var("SESIO_AUTHORITY_URL")
            .map_err(|_| SessionError::Config("SESIO_AUTHORITY_URL is not set".to_string()))?;
        let authority_url = Url::parse(&raw_url)
            .map_err(|e| SessionError::Config(format!("invalid SESIO_AUTHORITY_URL: {e}")))?;

        let mut config = Self::new(authority_url);
        if let Ok(key) = env::var("SESIO_AUTHORITY_API_KEY") {
            config.authority_api_key = Some(SecretString::from(key));
        }
        if let Ok(origin) = env::var("SESIO_APP_ORIGIN") {
            config.app_origin = origin;
        }
        if let Ok(mode) = env::var("SESIO_ANTI_CSRF") {
            config.anti_csrf = AntiCsrfMode::parse(&mode)?;
        }
        if let Ok(raw) = env::var("SESIO_ACCESS_TOKEN_TTL_SECONDS") {
            config.access_token_ttl_seconds = parse_seconds("SESIO_ACCESS_TOKEN_TTL_SECONDS", &raw)?;
        }
        if let Ok(raw) = env::var("SESIO_REFRESH_TOKEN_TTL_SECONDS") {
            config.refresh_token_ttl_seconds =
                parse_seconds("SESIO_REFRESH_TOKEN_TTL_SECONDS", &raw)?;
        }
        Ok(config)
    }

    #[must_use]
    pub fn with_authority_api_key(mut self, api_key: SecretString) -> Self {
        self.authority_api_key = Some(api_key);
        self
    }

    #[must_use]
    pub fn with_app_origin(mut self, origin: impl Into<String>) -> Self {
        self.app_origin = origin.into();
        self
    }

    #[must_use]
    pub fn with_cookie_domain(mut self, domain: impl Into<String>) -> Self {
        self.cookie_domain = Some(domain.into());
        self
    }

    #[must_use]
    pub fn with_access_token_cookie(mut self, name: impl Into<String>) -> Self {
        self.access_token_cookie = name.into();
        self
    }

    #[must_use]
    pub fn with_refresh_token_cookie(mut self, name: impl Into<String>) -> Self {
        self.refresh_token_cookie = name.into();
        self
    }

    #[must_use]
    pub fn with_anti_csrf(mut self, mode: AntiCsrfMode) -> Self {
        self.anti_csrf = mode;
        self
    }

    #[must_use]
    pub fn with_transfer_method(mut self, method: TokenTransferMethod) -> Self {
        self.transfer_method = method;
        self
    }

    #[must_use]
    pub fn with_access_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.access_token_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_refresh_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.refresh_token_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_key_cache_ttl(mut self, ttl: Duration) -> Self {
        self.key_cache_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_clock_skew_seconds(mut self, seconds: i64) -> Self {
        self.clock_skew_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_registry_ttl(mut self, ttl: Duration) -> Self {
        self.registry_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_refresh_path(mut self, path: impl Into<String>) -> Self {
        self.refresh_path = path.into();
        self
    }

    #[must_use]
    pub fn with_same_site(mut self, same_site: impl Into<String>) -> Self {
        self.same_site = same_site.into();
        self
    }

    #[must_use]
    pub fn authority_url(&self) -> &Url {
        &self.authority_url
    }

    #[must_use]
    pub fn authority_api_key(&self) -> Option<&SecretString> {
        self.authority_api_key.as_ref()
    }

    #[must_use]
    pub fn app_origin(&self) -> &str {
        &self.app_origin
    }

    #[must_use]
    pub fn cookie_domain(&self) -> Option<&str> {
        self.cookie_domain.as_deref()
    }

    #[must_use]
    pub fn access_token_cookie(&self) -> &str {
        &self.access_token_cookie
    }

    #[must_use]
    pub fn refresh_token_cookie(&self) -> &str {
        &self.refresh_token_cookie
    }

    #[must_use]
    pub fn anti_csrf_header(&self) -> &str {
        &self.anti_csrf_header
    }

    #[must_use]
    pub fn rid_header(&self) -> &str {
        &self.rid_header
    }

    #[must_use]
    pub fn anti_csrf(&self) -> AntiCsrfMode {
        self.anti_csrf
    }

    #[must_use]
    pub fn transfer_method(&self) -> TokenTransferMethod {
        self.transfer_method
    }

    #[must_use]
    pub fn access_token_ttl_seconds(&self) -> i64 {
        self.access_token_ttl_seconds
    }

    #[must_use]
    pub fn refresh_token_ttl_seconds(&self) -> i64 {
        self.refresh_token_ttl_seconds
    }

    #[must_use]
    pub fn key_cache_ttl(&self) -> Duration {
        self.key_cache_ttl
    }

    #[must_use]
    pub fn clock_skew_seconds(&self) -> i64 {
        self.clock_skew_seconds
    }

    #[must_use]
    pub fn registry_ttl(&self) -> Duration {
        self.registry_ttl
    }

    #[must_use]
    pub fn refresh_path(&self) -> &str {
        &self.refresh_path
    }

    #[must_use]
    pub fn same_site(&self) -> &str {
        &self.same_site
    }

    /// Only mark cookies secure when the app is served over HTTPS.
    #[must_use]
    pub fn cookie_secure(&self) -> bool {
        self.app_origin.starts_with("https://")
    }
}

fn parse_seconds(name: &str, raw: &str) -> Result<i64, SessionError> {
    raw.parse::<i64>()
        .map_err(|e| SessionError::Config(format!("invalid {name}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_url() -> Url {
        Url::parse("https://authority.example.test").expect("static url parses")
    }

    #[test]
    fn defaults_and_overrides() {
        let config = SessionConfig::new(test_url());
        assert_eq!(config.access_token_cookie(), "sAccessToken");
        assert_eq!(config.refresh_token_cookie(), "sRefreshToken");
        assert_eq!(config.anti_csrf(), AntiCsrfMode::None);
        assert_eq!(config.transfer_method(), TokenTransferMethod::Cookie);
        assert_eq!(
            config.access_token_ttl_seconds(),
            DEFAULT_ACCESS_TOKEN_TTL_SECONDS
        );
        assert!(!config.cookie_secure());

        let config = config
            .with_app_origin("https://app.example.test")
            .with_anti_csrf(AntiCsrfMode::ViaToken)
            .with_access_token_ttl_seconds(120)
            .with_cookie_domain(".example.test")
            .with_same_site("Strict");
        assert!(config.cookie_secure());
        assert_eq!(config.anti_csrf(), AntiCsrfMode::ViaToken);
        assert_eq!(config.access_token_ttl_seconds(), 120);
        assert_eq!(config.cookie_domain(), Some(".example.test"));
        assert_eq!(config.same_site(), "Strict");
    }

    #[test]
    fn from_env_requires_authority_url() {
        temp_env::with_var_unset("SESIO_AUTHORITY_URL", || {
            let result = SessionConfig::from_env();
            assert!(matches!(result, Err(SessionError::Config(_))));
        });
    }

    #[test]
    fn from_env_reads_overrides() {
        temp_env::with_vars(
            [
                (
                    "SESIO_AUTHORITY_URL",
                    Some("https://authority.example.test"),
                ),
                ("SESIO_ANTI_CSRF", Some("via-custom-header")),
                ("SESIO_ACCESS_TOKEN_TTL_SECONDS", Some("900")),
            ],
            || {
                let config = SessionConfig::from_env().expect("config parses");
                assert_eq!(
                    config.authority_url().as_str(),
                    "https://authority.example.test/"
                );
                assert_eq!(config.anti_csrf(), AntiCsrfMode::ViaCustomHeader);
                assert_eq!(config.access_token_ttl_seconds(), 900);
            },
        );
    }

    #[test]
    fn from_env_rejects_bad_mode() {
        temp_env::with_vars(
            [
                (
                    "SESIO_AUTHORITY_URL",
                    Some("https://authority.example.test"),
                ),
                ("SESIO_ANTI_CSRF", Some("sometimes")),
            ],
            || {
                let result = SessionConfig::from_env();
                assert!(matches!(result, Err(SessionError::Config(_))));
            },
        );
    }
}
