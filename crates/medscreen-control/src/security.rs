use axum::{
    extract::{Request, State},
    http::{HeaderValue, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::TypedHeader;
use axum_extra::headers::{Authorization, authorization::Bearer};

use crate::auth::validate_access_jwt;
use crate::error::ApiError;
use crate::request_meta::{REQUEST_ID_HEADER, RequestMeta, peer_addr};
use crate::state::AppState;

fn is_unsafe_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

fn request_id_of(req: &Request) -> String {
    req.extensions()
        .get::<RequestMeta>()
        .map(|m| m.request_id.clone())
        .unwrap_or_default()
}

// Middleware: resolve request id, client address and user agent once per
// request and echo the request id back.
pub async fn request_meta(mut req: Request, next: Next) -> Response {
    let meta = RequestMeta::from_headers(req.headers(), peer_addr(req.extensions()));
    let request_id = meta.request_id.clone();
    req.extensions_mut().insert(meta);

    let mut resp = next.run(req).await;
    if let Ok(v) = HeaderValue::from_str(&request_id) {
        resp.headers_mut().insert(REQUEST_ID_HEADER, v);
    }
    resp
}

// Middleware: require a valid bearer token and expose the caller as an
// `AuthUser` extension.
pub async fn auth_guard(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(TypedHeader(Authorization(bearer))) = bearer else {
        return ApiError::unauthorized("authorization header missing")
            .with_request_id(request_id_of(&req))
            .into_response();
    };

    match validate_access_jwt(&state.config.jwt_secret, bearer.token()) {
        Ok(user) => {
            req.extensions_mut().insert(user);
            next.run(req).await
        }
        Err(err) => {
            tracing::debug!(%err, "rejected access token");
            ApiError::unauthorized("invalid or expired token")
                .with_request_id(request_id_of(&req))
                .into_response()
        }
    }
}

// Middleware: reject every mutation while the service runs read-only.
pub async fn read_only_guard(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if state.config.read_only && is_unsafe_method(req.method()) {
        return ApiError::read_only()
            .with_request_id(request_id_of(&req))
            .into_response();
    }
    next.run(req).await
}
