use axum::{
    Json,
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::CookieJar;
use serde::{Deserialize, Serialize};
use serde_json::json;
use typeshare::typeshare;

use super::cookie::{SESSION_COOKIE, clear_cookie_header, request_is_secure, set_cookie_header};
use super::store::session_ttl_secs;
use super::types::{AuthUser, normalize_pin, valid_device_id};
use crate::api::http_server::AppState;

/// Custom error type for auth handlers.
///
/// Failed password, failed PIN, and expired session all surface as the
/// same opaque 401; the one exception is 428 when the password was valid
/// but the device has no PIN registered yet.
#[derive(Debug)]
pub enum AuthError {
    Internal(anyhow::Error),
    Unauthorized,
    BadRequest(String),
    PinRequired,
}

impl From<anyhow::Error> for AuthError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        match self {
            Self::Internal(err) => {
                tracing::error!("Auth error: {err}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "internal error"})),
                )
                    .into_response()
            }
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "invalid credentials"})),
            )
                .into_response(),
            Self::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, Json(json!({"error": msg}))).into_response()
            }
            Self::PinRequired => (
                StatusCode::PRECONDITION_REQUIRED,
                Json(json!({"devicePinRequired": true})),
            )
                .into_response(),
        }
    }
}

/// Request for password login, optionally enrolling a device PIN.
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    /// Opaque token identifying this browser installation.
    pub device_id: String,
    /// PIN to enroll when the device has none yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin: Option<String>,
}

/// Request for device-PIN login.
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinLoginRequest {
    pub device_id: String,
    pub pin: String,
}

/// Response for successful logins.
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub user: AuthUser,
}

/// POST /api/auth/login
pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<LoginRequest>,
) -> Result<Response, AuthError> {
    if !valid_device_id(&request.device_id) {
        return Err(AuthError::BadRequest(
            "device id must be 16-200 characters".to_string(),
        ));
    }

    let user = state
        .auth
        .verify_password(&request.username, &request.password)
        .await?
        .ok_or(AuthError::Unauthorized)?;

    if !state.auth.has_device_pin(&request.device_id).await? {
        let Some(pin) = request.pin.as_deref() else {
            return Err(AuthError::PinRequired);
        };
        let pin = normalize_pin(pin)
            .ok_or_else(|| AuthError::BadRequest("pin must be 4-8 digits".to_string()))?;
        state
            .auth
            .upsert_device_pin(&user.id, &request.device_id, &pin)
            .await?;
    }

    let session_id = state.auth.create_session(&user.id).await?;
    Ok(login_response(user, &session_id, &headers))
}

/// POST /api/auth/pin-login
pub async fn pin_login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PinLoginRequest>,
) -> Result<Response, AuthError> {
    if !valid_device_id(&request.device_id) {
        return Err(AuthError::BadRequest(
            "device id must be 16-200 characters".to_string(),
        ));
    }
    let pin = normalize_pin(&request.pin)
        .ok_or_else(|| AuthError::BadRequest("pin must be 4-8 digits".to_string()))?;

    let outcome = state
        .auth
        .login_with_device_pin(&request.device_id, &pin)
        .await?
        .ok_or(AuthError::Unauthorized)?;

    Ok(login_response(outcome.user, &outcome.session_id, &headers))
}

/// POST /api/auth/logout
pub async fn logout(
    State(state): State<AppState>,
    jar: CookieJar,
) -> Result<Response, AuthError> {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        state.auth.logout(cookie.value()).await?;
    }

    let mut response = StatusCode::NO_CONTENT.into_response();
    if let Ok(value) = header::HeaderValue::from_str(&clear_cookie_header()) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
    Ok(response)
}

/// GET /api/auth/me
pub async fn me(
    State(state): State<AppState>,
    jar: CookieJar,
) -> Result<Json<AuthUser>, AuthError> {
    let Some(cookie) = jar.get(SESSION_COOKIE) else {
        return Err(AuthError::Unauthorized);
    };
    let user = state
        .auth
        .authenticate_session(cookie.value())
        .await?
        .ok_or(AuthError::Unauthorized)?;
    Ok(Json(user))
}

/// Extension carrying the authenticated user through protected routes.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub AuthUser);

/// Middleware guarding the protected API routes.
pub async fn require_session(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let cookie_header = request
        .headers()
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    let user = state.auth.authenticate(cookie_header).await.map_err(|err| {
        tracing::error!("Session lookup failed: {err}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let Some(user) = user else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    request.extensions_mut().insert(CurrentUser(user));
    Ok(next.run(request).await)
}

fn login_response(user: AuthUser, session_id: &str, headers: &HeaderMap) -> Response {
    let cookie = set_cookie_header(session_id, session_ttl_secs(), request_is_secure(headers));
    let mut response = Json(LoginResponse { user }).into_response();
    if let Ok(value) = header::HeaderValue::from_str(&cookie) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
    response
}
