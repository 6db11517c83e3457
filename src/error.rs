use crate::auth::AuthFailure;
use crate::upstream::BackendError;
use http::StatusCode;
use std::fmt;

/// Per-request failures. Every variant becomes exactly one written response.
#[derive(Debug)]
pub enum GatewayError {
    NoRouteMatch,
    Unauthorized(AuthFailure),
    AuthUnavailable(String),
    RateLimited(StatusCode),
    Plugin(String),
    Backend(BackendError),
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::NoRouteMatch => StatusCode::NOT_FOUND,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimited(code) => *code,
            GatewayError::AuthUnavailable(_)
            | GatewayError::Plugin(_)
            | GatewayError::Backend(_)
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable reason written in the default error body.
    pub fn reason(&self) -> &'static str {
        match self {
            GatewayError::NoRouteMatch => "no_route",
            GatewayError::Unauthorized(f) => f.reason(),
            GatewayError::AuthUnavailable(_) => "auth_unavailable",
            GatewayError::RateLimited(_) => "rate_limited",
            GatewayError::Plugin(_) => "plugin_failure",
            GatewayError::Backend(_) => "backend_failure",
            GatewayError::Internal(_) => "internal_error",
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::NoRouteMatch => write!(f, "no endpoint matched"),
            GatewayError::Unauthorized(r) => write!(f, "unauthorized: {}", r),
            GatewayError::AuthUnavailable(msg) => write!(f, "token validation unavailable: {}", msg),
            GatewayError::RateLimited(_) => write!(f, "rate limited"),
            GatewayError::Plugin(msg) => write!(f, "plugin error: {}", msg),
            GatewayError::Backend(e) => write!(f, "{}", e),
            GatewayError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<BackendError> for GatewayError {
    fn from(e: BackendError) -> Self {
        GatewayError::Backend(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_no_route_match() {
        assert_eq!(GatewayError::NoRouteMatch.to_string(), "no endpoint matched");
    }

    #[test]
    fn display_unauthorized() {
        assert_eq!(
            GatewayError::Unauthorized(AuthFailure::InvalidScope).to_string(),
            "unauthorized: invalid_scope"
        );
    }

    #[test]
    fn display_backend_connect() {
        assert_eq!(
            GatewayError::Backend(BackendError::Connect("conn refused".to_string())).to_string(),
            "backend connect failed: conn refused"
        );
    }

    #[test]
    fn every_backend_failure_is_500() {
        for e in [
            BackendError::Connect("x".into()),
            BackendError::Timeout,
            BackendError::Reset("x".into()),
        ] {
            assert_eq!(GatewayError::from(e).status(), StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    #[test]
    fn status_and_reason() {
        let e = GatewayError::Unauthorized(AuthFailure::MissingToken);
        assert_eq!(e.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(e.reason(), "missing_token");

        let e = GatewayError::RateLimited(StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(e.status().as_u16(), 429);
        assert_eq!(e.reason(), "rate_limited");

        assert_eq!(GatewayError::NoRouteMatch.status(), StatusCode::NOT_FOUND);
        assert_eq!(GatewayError::AuthUnavailable("down".into()).status().as_u16(), 500);
    }
}
