use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{ChallengeType, WebAuthnChallenge};

/// Challenge time-to-live
pub const CHALLENGE_TTL_SECS: i64 = 300;

/// How long finished or abandoned challenges are kept before the sweep
/// reclaims them
pub const CHALLENGE_RETENTION_SECS: i64 = 3600;

/// Durable store for single-use, time-boxed WebAuthn challenges
pub struct ChallengeService;

impl ChallengeService {
    /// Persist a fresh challenge for a ceremony. state_json is the serialized
    /// webauthn-rs registration/authentication state.
    pub async fn begin(
        db: &Database,
        user_id: &str,
        kind: ChallengeType,
        state_json: String,
    ) -> Result<WebAuthnChallenge> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let expires_at = (now + Duration::seconds(CHALLENGE_TTL_SECS)).to_rfc3339();
        let created_at = now.to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO webauthn_challenges (id, user_id, challenge_type, state_json, expires_at, used_at, created_at)
            VALUES (?, ?, ?, ?, ?, NULL, ?)
            "#,
        )
        .bind(&id)
        .bind(user_id)
        .bind(kind.as_str())
        .bind(&state_json)
        .bind(&expires_at)
        .bind(&created_at)
        .execute(db.pool())
        .await?;

        Ok(WebAuthnChallenge {
            id,
            user_id: user_id.to_string(),
            challenge_type: kind.as_str().to_string(),
            state_json,
            expires_at,
            used_at: None,
            created_at,
        })
    }

    /// Most recently created unused challenge of the given kind for a user.
    /// If several exist, the latest wins; an expired latest is a miss.
    pub async fn find_active(
        db: &Database,
        user_id: &str,
        kind: ChallengeType,
    ) -> Result<WebAuthnChallenge> {
        let ch: WebAuthnChallenge = sqlx::query_as(
            r#"
            SELECT * FROM webauthn_challenges
            WHERE user_id = ? AND challenge_type = ? AND used_at IS NULL
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(kind.as_str())
        .fetch_optional(db.pool())
        .await?
        .ok_or_else(|| AppError::BadRequest("Challenge missing or expired".to_string()))?;

        let exp = chrono::DateTime::parse_from_rfc3339(&ch.expires_at)
            .map_err(|_| AppError::Internal("Invalid challenge expiry".to_string()))?;
        if exp < Utc::now() {
            return Err(AppError::BadRequest("Challenge missing or expired".to_string()));
        }

        Ok(ch)
    }

    /// Mark a challenge used. Conditional on it still being unused, so two
    /// completions racing on the same challenge cannot both succeed.
    pub async fn consume(db: &Database, id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let affected = sqlx::query(
            "UPDATE webauthn_challenges SET used_at = ? WHERE id = ? AND used_at IS NULL",
        )
        .bind(&now)
        .bind(id)
        .execute(db.pool())
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(AppError::BadRequest("Challenge missing or expired".to_string()));
        }
        Ok(())
    }

    /// Delete challenges older than the retention window, used or not.
    /// Bounds table growth; run periodically.
    pub async fn sweep_expired(db: &Database, retention_secs: i64) -> Result<u64> {
        let cutoff = (Utc::now() - Duration::seconds(retention_secs)).to_rfc3339();
        let deleted = sqlx::query("DELETE FROM webauthn_challenges WHERE created_at < ?")
            .bind(&cutoff)
            .execute(db.pool())
            .await?
            .rows_affected();

        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> Database {
        let db = Database::new_in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        sqlx::query("INSERT INTO users (id, email, name) VALUES ('u1', 'guest@example.com', 'Guest')")
            .execute(db.pool())
            .await
            .unwrap();
        db
    }

    #[tokio::test]
    async fn latest_challenge_wins() {
        let db = setup().await;

        let first =
            ChallengeService::begin(&db, "u1", ChallengeType::Authentication, "{\"a\":1}".into())
                .await
                .unwrap();
        let second =
            ChallengeService::begin(&db, "u1", ChallengeType::Authentication, "{\"a\":2}".into())
                .await
                .unwrap();

        let found = ChallengeService::find_active(&db, "u1", ChallengeType::Authentication)
            .await
            .unwrap();
        assert_eq!(found.id, second.id);
        assert_ne!(found.id, first.id);
    }

    #[tokio::test]
    async fn challenge_types_do_not_mix() {
        let db = setup().await;

        ChallengeService::begin(&db, "u1", ChallengeType::Registration, "{}".into())
            .await
            .unwrap();

        let err = ChallengeService::find_active(&db, "u1", ChallengeType::Authentication)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn consume_is_single_use() {
        let db = setup().await;

        let ch = ChallengeService::begin(&db, "u1", ChallengeType::Registration, "{}".into())
            .await
            .unwrap();

        ChallengeService::consume(&db, &ch.id).await.unwrap();

        // Replay fails and the challenge no longer resolves as active
        let err = ChallengeService::consume(&db, &ch.id).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        assert!(ChallengeService::find_active(&db, "u1", ChallengeType::Registration)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn expired_challenge_is_a_miss() {
        let db = setup().await;

        let ch = ChallengeService::begin(&db, "u1", ChallengeType::Authentication, "{}".into())
            .await
            .unwrap();
        let past = (Utc::now() - Duration::seconds(10)).to_rfc3339();
        sqlx::query("UPDATE webauthn_challenges SET expires_at = ? WHERE id = ?")
            .bind(&past)
            .bind(&ch.id)
            .execute(db.pool())
            .await
            .unwrap();

        let err = ChallengeService::find_active(&db, "u1", ChallengeType::Authentication)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn sweep_removes_old_rows_regardless_of_state() {
        let db = setup().await;

        let used = ChallengeService::begin(&db, "u1", ChallengeType::Registration, "{}".into())
            .await
            .unwrap();
        ChallengeService::consume(&db, &used.id).await.unwrap();
        let fresh = ChallengeService::begin(&db, "u1", ChallengeType::Registration, "{}".into())
            .await
            .unwrap();

        // Age the first row past the retention window
        let old = (Utc::now() - Duration::seconds(7200)).to_rfc3339();
        sqlx::query("UPDATE webauthn_challenges SET created_at = ? WHERE id = ?")
            .bind(&old)
            .bind(&used.id)
            .execute(db.pool())
            .await
            .unwrap();

        let deleted = ChallengeService::sweep_expired(&db, 3600).await.unwrap();
        assert_eq!(deleted, 1);

        let remaining: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM webauthn_challenges")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(remaining.0, 1);
        let _ = fresh;
    }
}
