use axum::{extract::State, http::HeaderMap, response::IntoResponse, Json};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};

use crate::error::{ApiResponse, AppError, Result};
use crate::models::TokenPairResponse;
use crate::services::TokenService;
use crate::AppState;

pub const REFRESH_COOKIE: &str = "lk_refresh";

/// Refresh cookie scoped to the API; the browser never exposes it to scripts
pub fn refresh_cookie(value: String, secure: bool) -> Cookie<'static> {
    Cookie::build((REFRESH_COOKIE, value))
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(secure)
        .path("/api/v1")
        .build()
}

fn extract_refresh_token(jar: &CookieJar, headers: &HeaderMap) -> Option<String> {
    jar.get(REFRESH_COOKIE)
        .map(|c| c.value().to_string())
        .or_else(|| {
            headers
                .get("X-Refresh-Token")
                .and_then(|h| h.to_str().ok())
                .map(|s| s.to_string())
        })
}

/// Rotate a refresh token for a new token pair
/// POST /api/v1/auth/refresh
pub async fn refresh_token(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    let raw = extract_refresh_token(&jar, &headers)
        .ok_or_else(|| AppError::Unauthorized("Invalid refresh token".to_string()))?;

    let (access_token, new_refresh) = TokenService::refresh(&state.db, &state.config, &raw).await?;

    // The old token is revoked; the cookie must carry the rotated one
    let jar = jar.add(refresh_cookie(new_refresh.clone(), state.config.jwt.cookie_secure));

    let response = TokenPairResponse {
        access_token,
        refresh_token: new_refresh,
        token_type: "Bearer".to_string(),
        expires_in: state.config.jwt.access_token_expire_minutes * 60,
    };

    Ok((jar, Json(ApiResponse::success(response))))
}

/// Revoke the presented refresh token
/// POST /api/v1/auth/logout
///
/// Always reports success, including for unknown or already-revoked tokens,
/// so the endpoint leaks nothing about token validity.
pub async fn logout(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    if let Some(raw) = extract_refresh_token(&jar, &headers) {
        TokenService::revoke(&state.db, &raw).await?;
    }

    let remove = refresh_cookie(String::new(), state.config.jwt.cookie_secure);
    Ok((
        jar.remove(remove),
        Json(ApiResponse::<()>::success_message("Logged out successfully")),
    ))
}
