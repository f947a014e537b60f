use axum::{
    extract::{Query, Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};
use jsonwebtoken::{DecodingKey, Validation, decode};
use serde::Deserialize;
use tracing::debug;

use parley_types::api::Claims;

use crate::error::ApiError;
use crate::state::AppState;

/// Browsers cannot set headers on a WebSocket upgrade, so the token may
/// also arrive as `?access_token=`.
#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    access_token: Option<String>,
}

/// Validate the caller's JWT and stash its [`Claims`] in the request
/// extensions. Every protected route reads identity from there.
pub async fn require_auth(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    Query(query): Query<TokenQuery>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = match (&bearer, &query.access_token) {
        (Some(TypedHeader(Authorization(bearer))), _) => bearer.token(),
        (None, Some(token)) => token.as_str(),
        (None, None) => return Err(ApiError::Unauthenticated),
    };

    let claims = decode_claims(token, &state.jwt_secret)?;
    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

pub fn decode_claims(token: &str, secret: &str) -> Result<Claims, ApiError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| {
        debug!("rejected token: {}", e);
        ApiError::Unauthenticated
    })
}
