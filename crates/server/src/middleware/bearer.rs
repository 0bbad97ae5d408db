//! Bearer token extractor.
//!
//! The development hub trusts the token itself: `userId` or `userId:role`.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, HeaderMap, StatusCode},
};
use fitchat_shared::ParticipantRole;

use crate::hub::Caller;

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let caller = caller_from_headers(&parts.headers).ok_or_else(|| {
            tracing::debug!("rejecting request without a bearer token");
            (
                StatusCode::UNAUTHORIZED,
                "Unauthorized: missing bearer token".to_string(),
            )
        });
        async move { caller }
    }
}

pub fn caller_from_headers(headers: &HeaderMap) -> Option<Caller> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?;
    parse_token(token)
}

/// `userId` or `userId:role`; the role defaults to `client`.
pub fn parse_token(token: &str) -> Option<Caller> {
    let token = token.trim();
    let (user_id, role) = match token.split_once(':') {
        Some((user_id, role)) => (user_id.trim(), ParticipantRole::parse(role.trim())),
        None => (token, ParticipantRole::Client),
    };
    if user_id.is_empty() {
        return None;
    }
    Some(Caller {
        user_id: user_id.to_string(),
        role,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn parses_user_and_optional_role() {
        let client = parse_token("client-1").expect("caller");
        assert_eq!(client.user_id, "client-1");
        assert_eq!(client.role, ParticipantRole::Client);

        let advisor = parse_token("advisor-7:advisor").expect("caller");
        assert_eq!(advisor.role, ParticipantRole::Advisor);
    }

    #[test]
    fn rejects_empty_tokens() {
        assert!(parse_token("").is_none());
        assert!(parse_token("  ").is_none());
        assert!(parse_token(":admin").is_none());
    }

    #[test]
    fn reads_authorization_header() {
        let mut headers = HeaderMap::new();
        assert!(caller_from_headers(&headers).is_none());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(caller_from_headers(&headers).is_none());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer admin-1:admin"));
        let caller = caller_from_headers(&headers).expect("caller");
        assert_eq!(caller.user_id, "admin-1");
        assert_eq!(caller.role, ParticipantRole::Admin);
    }
}
