use crate::AppState;
use crate::error::ApiError;
use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};

/// Lets a request through only when it carries `Authorization: Bearer <api key>`.
pub async fn require_bearer(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let authorized = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| token == state.api_key.as_ref());
    if !authorized {
        return ApiError::Unauthorized.into_response();
    }
    next.run(request).await
}
