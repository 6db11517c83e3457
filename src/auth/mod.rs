pub mod validator;

pub use validator::{IntrospectionValidator, RejectAllValidator, TokenInfo, TokenValidator};

use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which kind of token an endpoint accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthType {
    /// Token issued to an end user; must carry a subject id.
    User,
    /// Token issued to a client application without a user.
    ClientApp,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthType::User => "user",
            AuthType::ClientApp => "client-app",
        }
    }
}

/// Machine-readable reason for a 401.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    MissingToken,
    InvalidToken,
    InvalidScope,
    WrongTokenType,
}

impl AuthFailure {
    pub fn reason(&self) -> &'static str {
        match self {
            AuthFailure::MissingToken => "missing_token",
            AuthFailure::InvalidToken => "invalid_token",
            AuthFailure::InvalidScope => "invalid_scope",
            AuthFailure::WrongTokenType => "wrong_token_type",
        }
    }
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

/// Identity attached to a request after the auth step. Anonymous for
/// endpoints without an `auth_type`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthContext {
    pub token: Option<String>,
    pub subject_id: Option<String>,
    pub client_id: Option<String>,
    pub scope: Option<String>,
}

impl AuthContext {
    pub fn anonymous() -> Self {
        Self::default()
    }
}

/// Outcome of the auth step that is not an admission.
#[derive(Debug)]
pub enum AuthError {
    Rejected(AuthFailure),
    /// The validation collaborator could not be reached or answered garbage.
    Unavailable(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::Rejected(r) => write!(f, "unauthorized: {}", r),
            AuthError::Unavailable(e) => write!(f, "token validation unavailable: {}", e),
        }
    }
}

/// `Authorization: Bearer <token>`, case-insensitive scheme.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// Scopes are space- or comma-separated; any overlap satisfies the requirement.
pub fn scope_satisfied(granted: Option<&str>, required: Option<&str>) -> bool {
    let required: Vec<&str> = match required {
        Some(r) => split_scope(r).collect(),
        None => return true,
    };
    if required.is_empty() {
        return true;
    }
    match granted {
        Some(g) => split_scope(g).any(|s| required.contains(&s)),
        None => false,
    }
}

fn split_scope(s: &str) -> impl Iterator<Item = &str> {
    s.split(|c: char| c == ' ' || c == ',').filter(|p| !p.is_empty())
}

/// Run the auth step for an endpoint that declares `auth_type`.
pub async fn authorize(
    validator: &dyn TokenValidator,
    headers: &HeaderMap,
    auth_type: AuthType,
    required_scope: Option<&str>,
) -> Result<AuthContext, AuthError> {
    let token = bearer_token(headers).ok_or(AuthError::Rejected(AuthFailure::MissingToken))?;

    let info = validator
        .validate(token)
        .await
        .map_err(|e| AuthError::Unavailable(e.to_string()))?;

    if !info.valid {
        return Err(AuthError::Rejected(AuthFailure::InvalidToken));
    }
    if !scope_satisfied(info.scope.as_deref(), required_scope) {
        return Err(AuthError::Rejected(AuthFailure::InvalidScope));
    }

    let has_subject = info.subject_id.as_deref().is_some_and(|s| !s.is_empty());
    match (auth_type, has_subject) {
        (AuthType::User, false) | (AuthType::ClientApp, true) => {
            return Err(AuthError::Rejected(AuthFailure::WrongTokenType));
        }
        _ => {}
    }

    Ok(AuthContext {
        token: Some(token.to_string()),
        subject_id: info.subject_id,
        client_id: info.client_id,
        scope: info.scope,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FixedValidator(Option<TokenInfo>);

    #[async_trait]
    impl TokenValidator for FixedValidator {
        async fn validate(&self, _token: &str) -> anyhow::Result<TokenInfo> {
            self.0
                .clone()
                .ok_or_else(|| anyhow::anyhow!("connection refused"))
        }
    }

    fn user_token(scope: &str) -> TokenInfo {
        TokenInfo {
            valid: true,
            scope: Some(scope.to_string()),
            subject_id: Some("1223".to_string()),
            client_id: Some("app-1".to_string()),
        }
    }

    fn headers_with(auth: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(http::header::AUTHORIZATION, auth.parse().unwrap());
        h
    }

    #[test]
    fn test_bearer_token_extraction() {
        assert_eq!(bearer_token(&headers_with("Bearer abc")), Some("abc"));
        assert_eq!(bearer_token(&headers_with("bearer  abc ")), Some("abc"));
        assert_eq!(bearer_token(&headers_with("Basic abc")), None);
        assert_eq!(bearer_token(&headers_with("Bearer ")), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn test_scope_overlap() {
        assert!(scope_satisfied(Some("basic payments"), Some("payments")));
        assert!(scope_satisfied(Some("a,b"), Some("c b")));
        assert!(!scope_satisfied(Some("basic"), Some("payments")));
        assert!(!scope_satisfied(None, Some("payments")));
        assert!(scope_satisfied(None, None));
        assert!(scope_satisfied(None, Some("")));
    }

    #[test]
    fn test_auth_type_serde_names() {
        let t: AuthType = serde_json::from_str(r#""client-app""#).unwrap();
        assert_eq!(t, AuthType::ClientApp);
        let t: AuthType = serde_json::from_str(r#""user""#).unwrap();
        assert_eq!(t, AuthType::User);
    }

    #[tokio::test]
    async fn test_missing_token() {
        let v = FixedValidator(Some(user_token("basic")));
        let err = authorize(&v, &HeaderMap::new(), AuthType::User, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Rejected(AuthFailure::MissingToken)));
    }

    #[tokio::test]
    async fn test_invalid_token() {
        let mut info = user_token("basic");
        info.valid = false;
        let v = FixedValidator(Some(info));
        let err = authorize(&v, &headers_with("Bearer t"), AuthType::User, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Rejected(AuthFailure::InvalidToken)));
    }

    #[tokio::test]
    async fn test_scope_mismatch() {
        let v = FixedValidator(Some(user_token("basic")));
        let err = authorize(&v, &headers_with("Bearer t"), AuthType::User, Some("payments"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Rejected(AuthFailure::InvalidScope)));
    }

    #[tokio::test]
    async fn test_user_token_on_client_app_endpoint() {
        let v = FixedValidator(Some(user_token("basic")));
        let err = authorize(&v, &headers_with("Bearer t"), AuthType::ClientApp, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Rejected(AuthFailure::WrongTokenType)));
    }

    #[tokio::test]
    async fn test_client_token_on_user_endpoint() {
        let mut info = user_token("basic");
        info.subject_id = None;
        let v = FixedValidator(Some(info));
        let err = authorize(&v, &headers_with("Bearer t"), AuthType::User, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Rejected(AuthFailure::WrongTokenType)));
    }

    #[tokio::test]
    async fn test_validator_unreachable() {
        let v = FixedValidator(None);
        let err = authorize(&v, &headers_with("Bearer t"), AuthType::User, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_authorized_user() {
        let v = FixedValidator(Some(user_token("basic payments")));
        let ctx = authorize(&v, &headers_with("Bearer t"), AuthType::User, Some("payments"))
            .await
            .unwrap();
        assert_eq!(ctx.subject_id.as_deref(), Some("1223"));
        assert_eq!(ctx.client_id.as_deref(), Some("app-1"));
        assert_eq!(ctx.token.as_deref(), Some("t"));
    }
}
