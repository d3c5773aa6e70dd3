use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};
use tracing::debug;

use crate::auth::Identity;
use crate::state::AppState;

use super::ApiError;

/// Raw bearer credential pulled off the request; resolved to an
/// [`Identity`] by [`authorize`] once the handler has state in hand.
#[derive(Clone, Debug)]
pub struct AuthToken(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for AuthToken
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        extract_token(&parts.headers)
            .map(AuthToken)
            .ok_or(ApiError::Unauthorized)
    }
}

impl AuthToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

pub fn authorize(state: &AppState, token: &AuthToken) -> Result<Identity, ApiError> {
    state.auth.verify(token.as_str()).map_err(|err| {
        debug!(error = %err, "bearer token rejected");
        ApiError::Unauthorized
    })
}

fn extract_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(|token| token.to_owned())
}
