//! Caller identity forwarded by the edge proxy.
//!
//! Tokens are verified upstream; services only read the trusted headers,
//! once, into a typed [`RequestContext`].

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use uuid::Uuid;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";
pub const USER_EMAIL_HEADER: &str = "x-user-email";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub user_id: Uuid,
    pub role: String,
    pub email: Option<String>,
}

impl RequestContext {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, String> {
        let user_id = header_str(headers, USER_ID_HEADER)
            .ok_or_else(|| "missing identity header".to_string())?;
        let user_id = Uuid::parse_str(user_id).map_err(|_| "malformed user id".to_string())?;
        let role = header_str(headers, USER_ROLE_HEADER)
            .unwrap_or("customer")
            .to_string();
        let email = header_str(headers, USER_EMAIL_HEADER).map(str::to_string);
        Ok(Self { user_id, role, email })
    }

    /// Header pairs to forward on calls to downstream collaborators.
    pub fn forwarded_headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            (USER_ID_HEADER, self.user_id.to_string()),
            (USER_ROLE_HEADER, self.role.clone()),
        ];
        if let Some(email) = &self.email {
            headers.push((USER_EMAIL_HEADER, email.clone()));
        }
        headers
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for RequestContext {
    type Rejection = (StatusCode, Json<serde_json::Value>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        RequestContext::from_headers(&parts.headers).map_err(|error| {
            (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": error })),
            )
        })
    }
}
