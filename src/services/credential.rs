use chrono::Utc;
use uuid::Uuid;

use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::PasskeyCredential;

/// Registry of public-key credentials bound to user accounts
pub struct CredentialService;

impl CredentialService {
    /// Active credentials for a user, oldest first
    pub async fn list_active(db: &Database, user_id: &str) -> Result<Vec<PasskeyCredential>> {
        let creds: Vec<PasskeyCredential> = sqlx::query_as(
            "SELECT * FROM passkey_credentials WHERE user_id = ? AND is_active = 1 ORDER BY created_at ASC",
        )
        .bind(user_id)
        .fetch_all(db.pool())
        .await?;

        Ok(creds)
    }

    pub async fn count_active(db: &Database, user_id: &str) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM passkey_credentials WHERE user_id = ? AND is_active = 1",
        )
        .bind(user_id)
        .fetch_one(db.pool())
        .await?;

        Ok(count.0)
    }

    /// Store a newly verified credential. The authenticator-assigned
    /// credential_id is unique across all users; a duplicate is a Conflict
    /// no matter which account owns the existing row.
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        db: &Database,
        user_id: &str,
        credential_id: &str,
        credential_data: &str,
        sign_count: i64,
        device_name: Option<String>,
        transports: Option<String>,
    ) -> Result<PasskeyCredential> {
        let existing: Option<(String,)> =
            sqlx::query_as("SELECT id FROM passkey_credentials WHERE credential_id = ?")
                .bind(credential_id)
                .fetch_optional(db.pool())
                .await?;
        if existing.is_some() {
            return Err(AppError::Conflict("Passkey already registered".to_string()));
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO passkey_credentials
                (id, user_id, credential_id, credential_data, sign_count, transports, device_name, is_active, created_at, last_used_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, NULL)
            "#,
        )
        .bind(&id)
        .bind(user_id)
        .bind(credential_id)
        .bind(credential_data)
        .bind(sign_count)
        .bind(transports.as_deref())
        .bind(device_name.as_deref())
        .bind(&now)
        .execute(db.pool())
        .await
        .map_err(|e| match &e {
            // Unique index on credential_id closes the race between the
            // pre-check and the insert
            sqlx::Error::Database(d) if d.is_unique_violation() => {
                AppError::Conflict("Passkey already registered".to_string())
            }
            _ => AppError::Database(e),
        })?;

        Ok(PasskeyCredential {
            id,
            user_id: user_id.to_string(),
            credential_id: credential_id.to_string(),
            credential_data: credential_data.to_string(),
            sign_count,
            transports,
            device_name,
            is_active: true,
            created_at: now,
            last_used_at: None,
        })
    }

    /// Look up a credential within one user's active set. Scoping to the
    /// claimed account is what rejects cross-account credential references.
    pub async fn find_active_by_credential_id(
        db: &Database,
        user_id: &str,
        credential_id: &str,
    ) -> Result<Option<PasskeyCredential>> {
        let cred: Option<PasskeyCredential> = sqlx::query_as(
            "SELECT * FROM passkey_credentials WHERE user_id = ? AND credential_id = ? AND is_active = 1",
        )
        .bind(user_id)
        .bind(credential_id)
        .fetch_optional(db.pool())
        .await?;

        Ok(cred)
    }

    /// Advance the signature counter after a verified assertion. The update
    /// only lands if the stored counter is still below the new one, so
    /// concurrent authentications serialize their comparison-and-update;
    /// returns false when the counter did not advance.
    pub async fn update_after_use(
        db: &Database,
        credential_id: &str,
        new_counter: i64,
        credential_data: &str,
    ) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let affected = sqlx::query(
            r#"
            UPDATE passkey_credentials
            SET sign_count = ?, credential_data = ?, last_used_at = ?
            WHERE credential_id = ? AND is_active = 1 AND sign_count < ?
            "#,
        )
        .bind(new_counter)
        .bind(credential_data)
        .bind(&now)
        .bind(credential_id)
        .bind(new_counter)
        .execute(db.pool())
        .await?
        .rows_affected();

        Ok(affected > 0)
    }

    /// Soft-deactivate; rows are never deleted so the audit trail survives.
    /// Idempotent.
    pub async fn deactivate(db: &Database, credential_id: &str) -> Result<()> {
        sqlx::query("UPDATE passkey_credentials SET is_active = 0 WHERE credential_id = ?")
            .bind(credential_id)
            .execute(db.pool())
            .await?;

        Ok(())
    }

    /// Ownership predicate shared by remove and rename: the row must exist
    /// and belong to the calling user.
    pub async fn find_owned(
        db: &Database,
        user_id: &str,
        passkey_id: &str,
    ) -> Result<PasskeyCredential> {
        let cred: PasskeyCredential =
            sqlx::query_as("SELECT * FROM passkey_credentials WHERE id = ?")
                .bind(passkey_id)
                .fetch_optional(db.pool())
                .await?
                .ok_or_else(|| AppError::NotFound("Passkey not found".to_string()))?;

        if cred.user_id != user_id {
            return Err(AppError::Unauthorized(
                "Passkey belongs to another account".to_string(),
            ));
        }

        Ok(cred)
    }

    pub async fn rename(db: &Database, passkey_id: &str, device_name: &str) -> Result<()> {
        sqlx::query("UPDATE passkey_credentials SET device_name = ? WHERE id = ?")
            .bind(device_name)
            .bind(passkey_id)
            .execute(db.pool())
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> Database {
        let db = Database::new_in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        for (id, email) in [("u1", "one@example.com"), ("u2", "two@example.com")] {
            sqlx::query("INSERT INTO users (id, email, name) VALUES (?, ?, '')")
                .bind(id)
                .bind(email)
                .execute(db.pool())
                .await
                .unwrap();
        }
        db
    }

    #[tokio::test]
    async fn duplicate_credential_id_conflicts_across_users() {
        let db = setup().await;

        CredentialService::create(&db, "u1", "cred-a", "{}", 0, None, None)
            .await
            .unwrap();

        // Same authenticator enrolled by a different account
        let err = CredentialService::create(&db, "u2", "cred-a", "{}", 0, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn counter_update_requires_strict_increase() {
        let db = setup().await;
        CredentialService::create(&db, "u1", "cred-a", "{}", 7, None, None)
            .await
            .unwrap();

        // Lower and equal counters are rejected
        assert!(!CredentialService::update_after_use(&db, "cred-a", 5, "{}").await.unwrap());
        assert!(!CredentialService::update_after_use(&db, "cred-a", 7, "{}").await.unwrap());

        // A strictly higher counter lands, once
        assert!(CredentialService::update_after_use(&db, "cred-a", 9, "{}").await.unwrap());
        assert!(!CredentialService::update_after_use(&db, "cred-a", 9, "{}").await.unwrap());

        let cred = CredentialService::find_active_by_credential_id(&db, "u1", "cred-a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cred.sign_count, 9);
        assert!(cred.last_used_at.is_some());
    }

    #[tokio::test]
    async fn counter_update_skips_inactive_credentials() {
        let db = setup().await;
        CredentialService::create(&db, "u1", "cred-a", "{}", 7, None, None)
            .await
            .unwrap();
        CredentialService::deactivate(&db, "cred-a").await.unwrap();

        // A validly-higher counter still fails once the credential is dead
        assert!(!CredentialService::update_after_use(&db, "cred-a", 9, "{}").await.unwrap());
    }

    #[tokio::test]
    async fn deactivate_is_idempotent_and_hides_from_active_set() {
        let db = setup().await;
        CredentialService::create(&db, "u1", "cred-a", "{}", 0, None, None)
            .await
            .unwrap();

        CredentialService::deactivate(&db, "cred-a").await.unwrap();
        CredentialService::deactivate(&db, "cred-a").await.unwrap();

        assert_eq!(CredentialService::count_active(&db, "u1").await.unwrap(), 0);
        assert!(CredentialService::find_active_by_credential_id(&db, "u1", "cred-a")
            .await
            .unwrap()
            .is_none());
        // Row still exists for the audit trail
        let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM passkey_credentials")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(total.0, 1);
    }

    #[tokio::test]
    async fn ownership_predicate_distinguishes_missing_from_foreign() {
        let db = setup().await;
        let cred = CredentialService::create(&db, "u1", "cred-a", "{}", 0, None, None)
            .await
            .unwrap();

        let err = CredentialService::find_owned(&db, "u1", "no-such-row").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let err = CredentialService::find_owned(&db, "u2", &cred.id).await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));

        let found = CredentialService::find_owned(&db, "u1", &cred.id).await.unwrap();
        assert_eq!(found.credential_id, "cred-a");
    }
}
