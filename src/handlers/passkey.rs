use axum::{extract::State, response::IntoResponse, Extension, Json};
use axum_extra::extract::cookie::CookieJar;
use serde::{Deserialize, Serialize};
use webauthn_rs::prelude::*;

use crate::error::{ApiResponse, AppError, Result};
use crate::handlers::auth::refresh_cookie;
use crate::models::{CurrentUser, LoginResponse, PasskeyCredential, UserResponse};
use crate::services::{PasskeyService, TokenService};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct RegistrationCompleteRequest {
    pub credential: RegisterPublicKeyCredential,
    pub device_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegistrationCompleteResponse {
    pub credential_id: String,
}

#[derive(Debug, Deserialize)]
pub struct AuthenticationBeginRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct AuthenticationCompleteRequest {
    pub email: String,
    pub credential: PublicKeyCredential,
}

#[derive(Debug, Deserialize)]
pub struct RenamePasskeyRequest {
    pub device_name: String,
}

/// Safe projection of a stored credential; the key material never leaves
/// the server
#[derive(Debug, Serialize)]
pub struct PasskeyInfo {
    pub id: String,
    pub device_name: Option<String>,
    pub created_at: String,
    pub last_used_at: Option<String>,
}

impl From<PasskeyCredential> for PasskeyInfo {
    fn from(c: PasskeyCredential) -> Self {
        Self {
            id: c.id,
            device_name: c.device_name,
            created_at: c.created_at,
            last_used_at: c.last_used_at,
        }
    }
}

/// Start passkey registration for the logged-in user
/// POST /api/v1/auth/passkey/register/begin
pub async fn begin_register(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
) -> Result<Json<ApiResponse<CreationChallengeResponse>>> {
    let options = PasskeyService::begin_register(&state.db, &state.config, &current_user.id).await?;
    Ok(Json(ApiResponse::success(options)))
}

/// Verify the attestation and store the new passkey
/// POST /api/v1/auth/passkey/register/finish
pub async fn finish_register(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    Json(req): Json<RegistrationCompleteRequest>,
) -> Result<Json<ApiResponse<RegistrationCompleteResponse>>> {
    let stored = PasskeyService::finish_register(
        &state.db,
        &state.config,
        &current_user.id,
        req.credential,
        req.device_name,
    )
    .await?;

    Ok(Json(ApiResponse::success(RegistrationCompleteResponse {
        credential_id: stored.credential_id,
    })))
}

/// Start passkey authentication for an account
/// POST /api/v1/auth/passkey/login/begin
pub async fn begin_login(
    State(state): State<AppState>,
    Json(req): Json<AuthenticationBeginRequest>,
) -> Result<Json<ApiResponse<RequestChallengeResponse>>> {
    let email = req.email.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(AppError::BadRequest("Invalid email format".to_string()));
    }

    let options = PasskeyService::begin_login(&state.db, &state.config, email).await?;
    Ok(Json(ApiResponse::success(options)))
}

/// Verify the assertion and log the user in
/// POST /api/v1/auth/passkey/login/finish
pub async fn finish_login(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(req): Json<AuthenticationCompleteRequest>,
) -> Result<impl IntoResponse> {
    let user =
        PasskeyService::finish_login(&state.db, &state.config, req.email.trim(), req.credential)
            .await?;

    let (access_token, refresh_token) = TokenService::issue(&state.db, &state.config, &user).await?;

    let jar = jar.add(refresh_cookie(refresh_token.clone(), state.config.jwt.cookie_secure));

    let response = LoginResponse {
        access_token,
        refresh_token,
        token_type: "Bearer".to_string(),
        expires_in: state.config.jwt.access_token_expire_minutes * 60,
        user: UserResponse::from(user),
    };

    Ok((jar, Json(ApiResponse::success(response))))
}

/// List the caller's active passkeys
/// GET /api/v1/user/passkeys
pub async fn list_passkeys(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
) -> Result<Json<ApiResponse<Vec<PasskeyInfo>>>> {
    let keys = PasskeyService::list(&state.db, &current_user.id).await?;
    let data = keys.into_iter().map(PasskeyInfo::from).collect();

    Ok(Json(ApiResponse::success(data)))
}

/// Deactivate one of the caller's passkeys
/// DELETE /api/v1/user/passkeys/:id
pub async fn remove_passkey(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    axum::extract::Path(passkey_id): axum::extract::Path<String>,
) -> Result<Json<ApiResponse<()>>> {
    PasskeyService::remove(&state.db, &current_user.id, &passkey_id).await?;
    Ok(Json(ApiResponse::<()>::success_message("Passkey removed successfully")))
}

/// Relabel one of the caller's passkeys
/// PATCH /api/v1/user/passkeys/:id
pub async fn rename_passkey(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    axum::extract::Path(passkey_id): axum::extract::Path<String>,
    Json(req): Json<RenamePasskeyRequest>,
) -> Result<Json<ApiResponse<()>>> {
    if req.device_name.trim().is_empty() || req.device_name.len() > 64 {
        return Err(AppError::BadRequest(
            "Device name must be between 1 and 64 characters".to_string(),
        ));
    }

    PasskeyService::rename(&state.db, &current_user.id, &passkey_id, req.device_name.trim())
        .await?;
    Ok(Json(ApiResponse::<()>::success_message("Passkey renamed successfully")))
}
