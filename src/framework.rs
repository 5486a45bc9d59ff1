//! Neutral request/response boundary for web-framework adapters.
//!
//! The engine never depends on a specific framework's request or response
//! types; adapters implement [`SessionRequest`] and [`SessionResponse`] and
//! the helpers here do token extraction, attachment, and clearing. An axum
//! implementation ships as the reference adapter.
//!
//! Status mapping is the adapter's responsibility. The conventional mapping
//! is provided by [`error_status`] (401 for unauthorised/expired sessions,
//! 403 for claim failures), and [`should_clear_tokens`] says when cookies
//! must be cleared (theft detection).

use crate::config::{SessionConfig, TokenTransferMethod};
use crate::error::SessionError;
use crate::session::SessionTriple;
use crate::verifier::AntiCsrfTokens;

const ACCESS_TOKEN_HEADER: &str = "st-access-token";
const REFRESH_TOKEN_HEADER: &str = "st-refresh-token";

/// Neutral view of an inbound request.
pub trait SessionRequest {
    fn get_header(&self, name: &str) -> Option<String>;
    fn get_cookie(&self, name: &str) -> Option<String>;
    fn method(&self) -> String;
    fn original_url(&self) -> String;
}

/// Neutral view of an outbound response the engine writes tokens into.
pub trait SessionResponse {
    fn set_header(&mut self, name: &str, value: &str);
    /// Append a `Set-Cookie` value.
    fn set_cookie(&mut self, cookie: &str);
    fn set_status(&mut self, status: u16);
}

/// Pull the access token from cookie or header, per configured placement.
pub fn extract_access_token(
    request: &dyn SessionRequest,
    config: &SessionConfig,
) -> Option<String> {
    match config.transfer_method() {
        TokenTransferMethod::Cookie => request.get_cookie(config.access_token_cookie()),
        TokenTransferMethod::Header => extract_bearer_token(request),
    }
}

/// Pull the refresh token from cookie or header, per configured placement.
pub fn extract_refresh_token(
    request: &dyn SessionRequest,
    config: &SessionConfig,
) -> Option<String> {
    match config.transfer_method() {
        TokenTransferMethod::Cookie => request.get_cookie(config.refresh_token_cookie()),
        TokenTransferMethod::Header => request.get_header(REFRESH_TOKEN_HEADER),
    }
}

/// Anti-CSRF evidence from the request: the explicit token header and
/// whether the custom rid header was present.
#[must_use]
pub fn extract_anti_csrf(
    request: &dyn SessionRequest,
    config: &SessionConfig,
) -> AntiCsrfTokens {
    AntiCsrfTokens {
        header_token: request.get_header(config.anti_csrf_header()),
        custom_header_present: request.get_header(config.rid_header()).is_some(),
    }
}

/// Default anti-CSRF policy: check everything except plain GETs.
#[must_use]
pub fn anti_csrf_check_required(request: &dyn SessionRequest) -> bool {
    !request.method().eq_ignore_ascii_case("get")
}

/// Write a freshly minted triple into the outbound response.
pub fn attach_session(
    response: &mut dyn SessionResponse,
    triple: &SessionTriple,
    config: &SessionConfig,
) {
    match config.transfer_method() {
        TokenTransferMethod::Cookie => {
            response.set_cookie(&build_cookie(
                config.access_token_cookie(),
                &triple.access_token.token,
                "/",
                config.access_token_ttl_seconds(),
                config,
            ));
            response.set_cookie(&build_cookie(
                config.refresh_token_cookie(),
                &triple.refresh_token.token,
                config.refresh_path(),
                config.refresh_token_ttl_seconds(),
                config,
            ));
        }
        TokenTransferMethod::Header => {
            response.set_header(ACCESS_TOKEN_HEADER, &triple.access_token.token);
            response.set_header(REFRESH_TOKEN_HEADER, &triple.refresh_token.token);
        }
    }
    if let Some(anti_csrf) = &triple.anti_csrf_token {
        response.set_header(config.anti_csrf_header(), anti_csrf);
    }
}

/// Clear session tokens from the client, e.g. after revocation or theft
/// detection.
pub fn clear_session(response: &mut dyn SessionResponse, config: &SessionConfig) {
    match config.transfer_method() {
        TokenTransferMethod::Cookie => {
            response.set_cookie(&build_cookie(
                config.access_token_cookie(),
                "",
                "/",
                0,
                config,
            ));
            response.set_cookie(&build_cookie(
                config.refresh_token_cookie(),
                "",
                config.refresh_path(),
                0,
                config,
            ));
        }
        TokenTransferMethod::Header => {
            response.set_header(ACCESS_TOKEN_HEADER, "");
            response.set_header(REFRESH_TOKEN_HEADER, "");
        }
    }
}

/// Conventional HTTP status for a session failure.
#[must_use]
pub fn error_status(err: &SessionError) -> u16 {
    match err {
        SessionError::ClaimValidationFailed { .. } => 403,
        SessionError::TokenInvalid(_)
        | SessionError::TryRefreshToken
        | SessionError::SignatureMismatch
        | SessionError::Unauthorised { .. }
        | SessionError::TokenTheftDetected { .. } => 401,
        SessionError::AuthorityUnreachable(_) => 503,
        SessionError::AuthorityProtocol(_) | SessionError::Config(_) => 500,
    }
}

/// Whether the client's tokens must be cleared along with the error response.
#[must_use]
pub fn should_clear_tokens(err: &SessionError) -> bool {
    matches!(err, SessionError::TokenTheftDetected { .. })
}

fn build_cookie(
    name: &str,
    value: &str,
    path: &str,
    max_age_seconds: i64,
    config: &SessionConfig,
) -> String {
    let same_site = config.same_site();
    let mut cookie =
        format!("{name}={value}; Path={path}; HttpOnly; SameSite={same_site}; Max-Age={max_age_seconds}");
    if let Some(domain) = config.cookie_domain() {
        cookie.push_str("; Domain=");
        cookie.push_str(domain);
    }
    if config.cookie_secure() {
        cookie.push_str("; Secure");
    }
    cookie
}

fn extract_bearer_token(request: &dyn SessionRequest) -> Option<String> {
    let value = request.get_header("authorization")?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

pub mod axum_support {
    //! Reference adapter over axum's http types.

    use super::{SessionRequest, SessionResponse};
    use axum::http::header::{COOKIE, SET_COOKIE};
    use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};

    pub struct AxumRequest<'a> {
        headers: &'a HeaderMap,
        method: &'a Method,
        uri: &'a Uri,
    }

    impl<'a> AxumRequest<'a> {
        #[must_use]
        pub fn new(headers: &'a HeaderMap, method: &'a Method, uri: &'a Uri) -> Self {
            Self {
                headers,
                method,
                uri,
            }
        }
    }

    impl SessionRequest for AxumRequest<'_> {
        fn get_header(&self, name: &str) -> Option<String> {
            self.headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(ToString::to_string)
        }

        fn get_cookie(&self, name: &str) -> Option<String> {
            let header = self.headers.get(COOKIE)?;
            let value = header.to_str().ok()?;
            for pair in value.split(';') {
                let trimmed = pair.trim();
                let mut parts = trimmed.splitn(2, '=');
                let key = parts.next()?.trim();
                let val = parts.next()?.trim();
                if key == name {
                    return Some(val.to_string());
                }
            }
            None
        }

        fn method(&self) -> String {
            self.method.as_str().to_string()
        }

        fn original_url(&self) -> String {
            self.uri.to_string()
        }
    }

    /// Collects headers/cookies/status to apply to an axum response.
    #[derive(Debug, Default)]
    pub struct AxumResponse {
        headers: HeaderMap,
        status: Option<StatusCode>,
    }

    impl AxumResponse {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        #[must_use]
        pub fn status(&self) -> Option<StatusCode> {
            self.status
        }

        #[must_use]
        pub fn headers(&self) -> &HeaderMap {
            &self.headers
        }

        /// Merge the collected parts into a response under construction.
        pub fn apply<B>(self, response: &mut axum::http::Response<B>) {
            if let Some(status) = self.status {
                *response.status_mut() = status;
            }
            for (name, value) in &self.headers {
                response.headers_mut().append(name, value.clone());
            }
        }
    }

    impl SessionResponse for AxumResponse {
        fn set_header(&mut self, name: &str, value: &str) {
            if let (Ok(name), Ok(value)) = (
                name.parse::<axum::http::header::HeaderName>(),
                HeaderValue::from_str(value),
            ) {
                self.headers.insert(name, value);
            }
        }

        fn set_cookie(&mut self, cookie: &str) {
            if let Ok(value) = HeaderValue::from_str(cookie) {
                self.headers.append(SET_COOKIE, value);
            }
        }

        fn set_status(&mut self, status: u16) {
            self.status = StatusCode::from_u16(status).ok();
        }
    }
}
