use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use uuid::Uuid;

use crate::config::Config;
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{Claims, RefreshClaims, RefreshToken, User};

/// Mints access/refresh token pairs and tracks refresh-token state for
/// single-use rotation and revocation
pub struct TokenService;

impl TokenService {
    /// Issue a fresh token pair for a user. The refresh token is persisted
    /// only as a one-way hash.
    pub async fn issue(db: &Database, config: &Config, user: &User) -> Result<(String, String)> {
        let access_token = Self::generate_access_token(user, config)?;

        let mut tx = db.pool().begin().await?;
        let refresh_token = Self::generate_refresh_token_tx(tx.as_mut(), &user.id, config).await?;
        tx.commit().await?;

        Ok((access_token, refresh_token))
    }

    /// Rotate a refresh token: verify it, revoke the stored record, and issue
    /// a replacement pair. Every verification failure collapses to the same
    /// generic message so the endpoint cannot be used as a token oracle.
    pub async fn refresh(db: &Database, config: &Config, raw: &str) -> Result<(String, String)> {
        let claims = Self::decode_refresh_token(raw, config)?;
        if claims.token_type != "refresh" {
            return Err(AppError::Unauthorized("Invalid refresh token".to_string()));
        }

        let mut tx = db.pool().begin().await?;

        let token_hash = Self::hash_token(raw);
        let stored: RefreshToken =
            sqlx::query_as("SELECT * FROM refresh_tokens WHERE token_hash = ?")
                .bind(&token_hash)
                .fetch_optional(tx.as_mut())
                .await?
                .ok_or_else(|| AppError::Unauthorized("Invalid refresh token".to_string()))?;

        if stored.revoked {
            // Replay of a rotated token; likely theft of the old value
            tracing::warn!(user_id = %stored.user_id, "revoked refresh token replayed");
            return Err(AppError::Unauthorized("Invalid refresh token".to_string()));
        }

        // Stored expiry is checked independently of the signature's embedded
        // expiry
        let expires_at = chrono::DateTime::parse_from_rfc3339(&stored.expires_at)
            .map_err(|_| AppError::Internal("Invalid token expiry format".to_string()))?;
        if expires_at < Utc::now() {
            return Err(AppError::Unauthorized("Invalid refresh token".to_string()));
        }

        let user: User = sqlx::query_as("SELECT * FROM users WHERE id = ?")
            .bind(&stored.user_id)
            .fetch_optional(tx.as_mut())
            .await?
            .ok_or_else(|| AppError::Unauthorized("Invalid refresh token".to_string()))?;

        if !user.is_active {
            return Err(AppError::Forbidden("Account is disabled".to_string()));
        }

        // Single-use rotation: the revoke only lands if the row is still
        // unrevoked, so of two concurrent refresh calls at most one proceeds
        let now = Utc::now().to_rfc3339();
        let affected = sqlx::query(
            "UPDATE refresh_tokens SET revoked = 1, revoked_at = ? WHERE id = ? AND revoked = 0",
        )
        .bind(&now)
        .bind(&stored.id)
        .execute(tx.as_mut())
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(AppError::Unauthorized("Invalid refresh token".to_string()));
        }

        let access_token = Self::generate_access_token(&user, config)?;
        let refresh_token = Self::generate_refresh_token_tx(tx.as_mut(), &user.id, config).await?;

        tx.commit().await?;

        Ok((access_token, refresh_token))
    }

    /// Revoke the record matching a raw refresh token (logout). Idempotent,
    /// and deliberately silent about whether anything matched.
    pub async fn revoke(db: &Database, raw: &str) -> Result<()> {
        let token_hash = Self::hash_token(raw);
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            "UPDATE refresh_tokens SET revoked = 1, revoked_at = ? WHERE token_hash = ? AND revoked = 0",
        )
        .bind(&now)
        .bind(&token_hash)
        .execute(db.pool())
        .await?;

        Ok(())
    }

    /// Delete refresh rows past their own stored expiry. Expired-but-unrevoked
    /// rows are inert; this just reclaims them.
    pub async fn sweep_expired(db: &Database) -> Result<u64> {
        let now = Utc::now().to_rfc3339();
        let deleted = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at < ?")
            .bind(&now)
            .execute(db.pool())
            .await?
            .rows_affected();

        Ok(deleted)
    }

    /// Generate access token (JWT)
    fn generate_access_token(user: &User, config: &Config) -> Result<String> {
        let now = Utc::now();
        let exp = now + Duration::minutes(config.jwt.access_token_expire_minutes as i64);

        let claims = Claims {
            sub: user.id.clone(),
            email: user.email.clone(),
            role: user.role.clone(),
            jti: Uuid::new_v4().to_string(),
            exp: exp.timestamp() as usize,
            iat: now.timestamp() as usize,
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(config.jwt.access_secret.as_bytes()),
        )?;

        Ok(token)
    }

    /// Generate a refresh token and persist its hashed record
    async fn generate_refresh_token_tx(
        conn: &mut sqlx::SqliteConnection,
        user_id: &str,
        config: &Config,
    ) -> Result<String> {
        let now = Utc::now();
        let expires = now + Duration::days(config.jwt.refresh_token_expire_days as i64);

        let claims = RefreshClaims {
            sub: user_id.to_string(),
            token_type: "refresh".to_string(),
            jti: Uuid::new_v4().to_string(),
            exp: expires.timestamp() as usize,
            iat: now.timestamp() as usize,
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(config.jwt.refresh_secret.as_bytes()),
        )?;

        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO refresh_tokens (id, user_id, token_hash, expires_at, revoked, revoked_at, created_at)
            VALUES (?, ?, ?, ?, 0, NULL, ?)
            "#,
        )
        .bind(&id)
        .bind(user_id)
        .bind(Self::hash_token(&token))
        .bind(expires.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(conn)
        .await?;

        Ok(token)
    }

    fn decode_refresh_token(token: &str, config: &Config) -> Result<RefreshClaims> {
        let mut validation = Validation::default();
        validation.validate_exp = true;

        let data = decode::<RefreshClaims>(
            token,
            &DecodingKey::from_secret(config.jwt.refresh_secret.as_bytes()),
            &validation,
        )
        .map_err(|_| AppError::Unauthorized("Invalid refresh token".to_string()))?;

        Ok(data.claims)
    }

    /// Validate access token and extract claims
    pub fn validate_access_token(token: &str, config: &Config) -> Result<Claims> {
        let mut validation = Validation::default();
        validation.validate_exp = true;

        let keys = std::iter::once(config.jwt.access_secret.as_str())
            .chain(config.jwt.previous_secrets.iter().map(|s| s.as_str()));

        for secret in keys {
            if let Ok(token_data) = decode::<Claims>(
                token,
                &DecodingKey::from_secret(secret.as_bytes()),
                &validation,
            ) {
                return Ok(token_data.claims);
            }
        }

        Err(AppError::Unauthorized("Invalid token".to_string()))
    }

    /// Hash token for storage
    pub fn hash_token(token: &str) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }
}
