use base64::Engine;
use chrono::Utc;
use uuid::Uuid;
use webauthn_rs::prelude::*;
use webauthn_rs_proto::{AuthenticatorAttachment, UserVerificationPolicy};

use crate::config::Config;
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{ChallengeType, PasskeyCredential, User};
use crate::services::{ChallengeService, CredentialService};

/// Registration ceremony window, matches the challenge TTL
const REGISTER_TIMEOUT_MS: u32 = 300_000;
/// Authentication ceremony window
const LOGIN_TIMEOUT_MS: u32 = 60_000;

/// Passkey registration and authentication flows, plus credential lifecycle
pub struct PasskeyService;

impl PasskeyService {
    fn webauthn_from_config(config: &Config) -> Result<Webauthn> {
        let rp_origin_raw = config.webauthn.rp_origin.trim();
        let rp_origin = url::Url::parse(rp_origin_raw).map_err(|_| {
            AppError::Internal(format!(
                "Invalid rp_origin: {} (expected like http://localhost:3000)",
                rp_origin_raw
            ))
        })?;
        let builder = WebauthnBuilder::new(&config.webauthn.rp_id, &rp_origin).map_err(|_| {
            AppError::Internal(format!(
                "Invalid WebAuthn config (rp_id={}, rp_origin={})",
                config.webauthn.rp_id, rp_origin
            ))
        })?;
        let builder = builder.rp_name(&config.webauthn.rp_name);
        let webauthn = builder
            .build()
            .map_err(|e| AppError::Internal(format!("WebAuthn build error: {:?}", e)))?;
        Ok(webauthn)
    }

    async fn load_user(db: &Database, user_id: &str) -> Result<User> {
        let user: User = sqlx::query_as("SELECT * FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(db.pool())
            .await?
            .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;

        Ok(user)
    }

    async fn load_user_by_email(db: &Database, email: &str) -> Result<User> {
        let user: User = sqlx::query_as("SELECT * FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(db.pool())
            .await?
            .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;

        Ok(user)
    }

    fn stored_passkey(cred: &PasskeyCredential) -> Result<Passkey> {
        serde_json::from_str(&cred.credential_data)
            .map_err(|_| AppError::Internal("Deserialize passkey failed".to_string()))
    }

    fn encode_cred_id(id: impl AsRef<[u8]>) -> String {
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(id)
    }

    /// Start passkey registration for an authenticated user. Already-enrolled
    /// authenticators go on the exclusion list so they cannot be registered
    /// twice.
    pub async fn begin_register(
        db: &Database,
        config: &Config,
        user_id: &str,
    ) -> Result<CreationChallengeResponse> {
        let webauthn = Self::webauthn_from_config(config)?;
        let user = Self::load_user(db, user_id).await?;

        let creds = CredentialService::list_active(db, &user.id).await?;
        let mut exclude: Vec<CredentialID> = Vec::new();
        for c in &creds {
            exclude.push(Self::stored_passkey(c)?.cred_id().clone());
        }
        let exclude = if exclude.is_empty() { None } else { Some(exclude) };

        let uid = Uuid::parse_str(&user.id).unwrap_or_else(|_| Uuid::new_v4());
        let (mut ccr, reg_state) = webauthn
            .start_passkey_registration(uid, &user.email, &user.name, exclude)
            .map_err(|e| AppError::BadRequest(format!("start registration failed: {:?}", e)))?;

        // Platform authenticators, no resident key, user verification
        // required; algorithms pinned to ES256 and RS256
        if let Some(selection) = ccr.public_key.authenticator_selection.as_mut() {
            selection.authenticator_attachment = Some(AuthenticatorAttachment::Platform);
            selection.require_resident_key = false;
            selection.user_verification = UserVerificationPolicy::Required;
        }
        ccr.public_key.pub_key_cred_params.retain(|p| p.alg == -7 || p.alg == -257);
        ccr.public_key.timeout = Some(REGISTER_TIMEOUT_MS);

        let state_json = serde_json::to_string(&reg_state)
            .map_err(|_| AppError::Internal("Serialize registration state failed".to_string()))?;
        ChallengeService::begin(db, &user.id, ChallengeType::Registration, state_json).await?;

        Ok(ccr)
    }

    /// Verify an attestation against the pending registration challenge and
    /// store the new credential.
    pub async fn finish_register(
        db: &Database,
        config: &Config,
        user_id: &str,
        reg: RegisterPublicKeyCredential,
        device_name: Option<String>,
    ) -> Result<PasskeyCredential> {
        let webauthn = Self::webauthn_from_config(config)?;

        let ch = ChallengeService::find_active(db, user_id, ChallengeType::Registration).await?;
        let reg_state: PasskeyRegistration = serde_json::from_str(&ch.state_json)
            .map_err(|_| AppError::Internal("Deserialize registration state failed".to_string()))?;

        let transports = reg
            .response
            .transports
            .as_ref()
            .and_then(|t| serde_json::to_string(t).ok());

        let passkey = webauthn
            .finish_passkey_registration(&reg, &reg_state)
            .map_err(|e| {
                tracing::warn!(user_id = %user_id, "passkey registration failed: {:?}", e);
                AppError::BadRequest(format!("Registration verification failed: {:?}", e))
            })?;

        let verified = Credential::from(passkey.clone());
        if !verified.user_verified {
            return Err(AppError::BadRequest(
                "Registration verification failed: user verification required".to_string(),
            ));
        }

        let cred_id = Self::encode_cred_id(passkey.cred_id());
        let credential_data = serde_json::to_string(&passkey)
            .map_err(|_| AppError::Internal("Serialize passkey failed".to_string()))?;

        let stored = CredentialService::create(
            db,
            user_id,
            &cred_id,
            &credential_data,
            i64::from(verified.counter),
            device_name,
            transports,
        )
        .await?;

        ChallengeService::consume(db, &ch.id).await?;

        Ok(stored)
    }

    /// Start passkey authentication for an account identified by email. The
    /// allow-list is built from the account's active credentials only.
    pub async fn begin_login(
        db: &Database,
        config: &Config,
        email: &str,
    ) -> Result<RequestChallengeResponse> {
        let webauthn = Self::webauthn_from_config(config)?;
        let user = Self::load_user_by_email(db, email).await?;
        if !user.is_active {
            return Err(AppError::Forbidden("Account is disabled".to_string()));
        }

        let creds = CredentialService::list_active(db, &user.id).await?;
        if creds.is_empty() {
            return Err(AppError::BadRequest("No passkey registered".to_string()));
        }

        let mut passkeys: Vec<Passkey> = Vec::new();
        for c in &creds {
            passkeys.push(Self::stored_passkey(c)?);
        }

        let (mut rcr, auth_state) = webauthn
            .start_passkey_authentication(&passkeys)
            .map_err(|e| AppError::BadRequest(format!("start authentication failed: {:?}", e)))?;

        rcr.public_key.user_verification = UserVerificationPolicy::Required;
        rcr.public_key.timeout = Some(LOGIN_TIMEOUT_MS);
        // Replay the transport hints the authenticator reported at enrollment
        for allow in rcr.public_key.allow_credentials.iter_mut() {
            let id = Self::encode_cred_id(&allow.id);
            if let Some(stored) = creds.iter().find(|c| c.credential_id == id) {
                if let Some(t) = stored.transports.as_deref() {
                    allow.transports = serde_json::from_str(t).ok();
                }
            }
        }

        let state_json = serde_json::to_string(&auth_state)
            .map_err(|_| AppError::Internal("Serialize authentication state failed".to_string()))?;
        ChallengeService::begin(db, &user.id, ChallengeType::Authentication, state_json).await?;

        Ok(rcr)
    }

    /// Verify an assertion against the pending authentication challenge.
    /// Returns the authenticated user; token issuance is the caller's step.
    pub async fn finish_login(
        db: &Database,
        config: &Config,
        email: &str,
        rsp: PublicKeyCredential,
    ) -> Result<User> {
        let webauthn = Self::webauthn_from_config(config)?;
        let mut user = Self::load_user_by_email(db, email).await?;
        if !user.is_active {
            return Err(AppError::Forbidden("Account is disabled".to_string()));
        }

        let ch = ChallengeService::find_active(db, &user.id, ChallengeType::Authentication).await?;

        // The assertion must reference a credential this account owns; a
        // credential id from any other account is rejected before any
        // cryptographic work happens
        let cred_id = Self::encode_cred_id(&rsp.raw_id);
        let cred = CredentialService::find_active_by_credential_id(db, &user.id, &cred_id)
            .await?
            .ok_or_else(|| AppError::Unauthorized("Authentication failed".to_string()))?;

        let auth_state: PasskeyAuthentication = serde_json::from_str(&ch.state_json)
            .map_err(|_| AppError::Internal("Deserialize authentication state failed".to_string()))?;

        let result = match webauthn.finish_passkey_authentication(&rsp, &auth_state) {
            Ok(result) => result,
            Err(WebauthnError::CredentialPossibleCompromise) => {
                // The signature checked out but the counter did not advance:
                // the protocol's signal of a cloned authenticator. Fatal to
                // the credential, not to the account.
                CredentialService::deactivate(db, &cred.credential_id).await?;
                tracing::warn!(
                    user_id = %user.id,
                    credential_id = %cred.credential_id,
                    "signature counter regressed; credential deactivated"
                );
                return Err(AppError::Unauthorized("Authentication failed".to_string()));
            }
            Err(e) => {
                tracing::warn!(user_id = %user.id, "passkey authentication failed: {:?}", e);
                return Err(AppError::Unauthorized("Authentication failed".to_string()));
            }
        };

        if !result.user_verified() {
            return Err(AppError::Unauthorized("Authentication failed".to_string()));
        }

        let mut passkey = Self::stored_passkey(&cred)?;
        passkey.update_credential(&result);
        let credential_data = serde_json::to_string(&passkey)
            .map_err(|_| AppError::Internal("Serialize passkey failed".to_string()))?;

        // Compare-and-set against the stored counter; losing the race, or a
        // counter that failed to advance, reads the same as cloning
        let new_counter = i64::from(result.counter());
        let advanced =
            CredentialService::update_after_use(db, &cred.credential_id, new_counter, &credential_data)
                .await?;
        if !advanced {
            CredentialService::deactivate(db, &cred.credential_id).await?;
            tracing::warn!(
                user_id = %user.id,
                credential_id = %cred.credential_id,
                "signature counter did not advance; credential deactivated"
            );
            return Err(AppError::Unauthorized("Authentication failed".to_string()));
        }

        ChallengeService::consume(db, &ch.id).await?;

        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE users SET last_login_at = ?, updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(&now)
            .bind(&user.id)
            .execute(db.pool())
            .await?;
        user.last_login_at = Some(now);

        Ok(user)
    }

    /// Active credentials for the settings page; callers project away the
    /// credential material
    pub async fn list(db: &Database, user_id: &str) -> Result<Vec<PasskeyCredential>> {
        CredentialService::list_active(db, user_id).await
    }

    /// Deactivate one of the caller's credentials. An account with no
    /// password must retain at least one active passkey.
    pub async fn remove(db: &Database, user_id: &str, passkey_id: &str) -> Result<()> {
        let cred = CredentialService::find_owned(db, user_id, passkey_id).await?;

        let user = Self::load_user(db, user_id).await?;
        if user.password_hash.is_none() && cred.is_active {
            let active = CredentialService::count_active(db, user_id).await?;
            if active <= 1 {
                return Err(AppError::BadRequest(
                    "Cannot remove the last sign-in method".to_string(),
                ));
            }
        }

        CredentialService::deactivate(db, &cred.credential_id).await
    }

    /// Relabel one of the caller's credentials
    pub async fn rename(
        db: &Database,
        user_id: &str,
        passkey_id: &str,
        device_name: &str,
    ) -> Result<()> {
        let cred = CredentialService::find_owned(db, user_id, passkey_id).await?;
        CredentialService::rename(db, &cred.id, device_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (Database, Config) {
        let db = Database::new_in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        (db, Config::default())
    }

    async fn insert_user(db: &Database, id: &str, email: &str, password_hash: Option<&str>) {
        sqlx::query("INSERT INTO users (id, email, name, password_hash) VALUES (?, ?, '', ?)")
            .bind(id)
            .bind(email)
            .bind(password_hash)
            .execute(db.pool())
            .await
            .unwrap();
    }

    fn assertion_for(raw_id_b64: &str) -> PublicKeyCredential {
        serde_json::from_value(serde_json::json!({
            "id": raw_id_b64,
            "rawId": raw_id_b64,
            "response": {
                "authenticatorData": "AAAA",
                "clientDataJSON": "AAAA",
                "signature": "AAAA"
            },
            "type": "public-key"
        }))
        .unwrap()
    }

    fn attestation() -> RegisterPublicKeyCredential {
        serde_json::from_value(serde_json::json!({
            "id": "AAAA",
            "rawId": "AAAA",
            "response": {
                "attestationObject": "AAAA",
                "clientDataJSON": "AAAA"
            },
            "type": "public-key"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn begin_register_requires_a_known_user() {
        let (db, config) = setup().await;

        let err = PasskeyService::begin_register(&db, &config, "missing").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn finish_register_without_challenge_is_rejected() {
        let (db, config) = setup().await;
        insert_user(&db, "u1", "guest@example.com", None).await;

        let err = PasskeyService::finish_register(&db, &config, "u1", attestation(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn begin_login_requires_a_known_user() {
        let (db, config) = setup().await;

        let err = PasskeyService::begin_login(&db, &config, "nobody@example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn begin_login_without_credentials_is_rejected() {
        let (db, config) = setup().await;
        insert_user(&db, "u1", "nopasskey@example.com", None).await;

        let err = PasskeyService::begin_login(&db, &config, "nopasskey@example.com")
            .await
            .unwrap_err();
        match err {
            AppError::BadRequest(msg) => assert_eq!(msg, "No passkey registered"),
            other => panic!("expected BadRequest, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn finish_login_without_challenge_is_rejected() {
        let (db, config) = setup().await;
        insert_user(&db, "u1", "guest@example.com", None).await;

        let err = PasskeyService::finish_login(&db, &config, "guest@example.com", assertion_for("AAAA"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn finish_login_rejects_credentials_the_account_does_not_own() {
        let (db, config) = setup().await;
        insert_user(&db, "u1", "one@example.com", None).await;
        insert_user(&db, "u2", "two@example.com", None).await;

        // u2 owns the credential the assertion references
        CredentialService::create(&db, "u2", "AAAA", "{}", 0, None, None)
            .await
            .unwrap();
        ChallengeService::begin(&db, "u1", ChallengeType::Authentication, "{}".into())
            .await
            .unwrap();

        let err = PasskeyService::finish_login(&db, &config, "one@example.com", assertion_for("AAAA"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn finish_login_rejects_deactivated_credentials() {
        let (db, config) = setup().await;
        insert_user(&db, "u1", "one@example.com", None).await;

        CredentialService::create(&db, "u1", "AAAA", "{}", 7, None, None)
            .await
            .unwrap();
        CredentialService::deactivate(&db, "AAAA").await.unwrap();
        ChallengeService::begin(&db, "u1", ChallengeType::Authentication, "{}".into())
            .await
            .unwrap();

        // Even a later, validly-higher counter cannot revive a dead credential
        let err = PasskeyService::finish_login(&db, &config, "one@example.com", assertion_for("AAAA"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn finish_login_rejects_disabled_accounts() {
        let (db, config) = setup().await;
        insert_user(&db, "u1", "one@example.com", None).await;
        sqlx::query("UPDATE users SET is_active = 0 WHERE id = 'u1'")
            .execute(db.pool())
            .await
            .unwrap();

        let err = PasskeyService::finish_login(&db, &config, "one@example.com", assertion_for("AAAA"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn remove_keeps_at_least_one_sign_in_method() {
        let (db, _config) = setup().await;
        insert_user(&db, "u1", "one@example.com", None).await;

        let only = CredentialService::create(&db, "u1", "cred-a", "{}", 0, None, None)
            .await
            .unwrap();

        // Password-less account with a single passkey: removal refused
        let err = PasskeyService::remove(&db, "u1", &only.id).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));

        // A second passkey unblocks removal of the first
        let second = CredentialService::create(&db, "u1", "cred-b", "{}", 0, None, None)
            .await
            .unwrap();
        PasskeyService::remove(&db, "u1", &only.id).await.unwrap();

        // Now the second is the last one again
        let err = PasskeyService::remove(&db, "u1", &second.id).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn remove_last_passkey_is_fine_when_a_password_exists() {
        let (db, _config) = setup().await;
        insert_user(&db, "u1", "one@example.com", Some("argon2-hash")).await;

        let only = CredentialService::create(&db, "u1", "cred-a", "{}", 0, None, None)
            .await
            .unwrap();
        PasskeyService::remove(&db, "u1", &only.id).await.unwrap();

        assert_eq!(CredentialService::count_active(&db, "u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn remove_and_rename_enforce_ownership() {
        let (db, _config) = setup().await;
        insert_user(&db, "u1", "one@example.com", None).await;
        insert_user(&db, "u2", "two@example.com", None).await;

        let cred = CredentialService::create(&db, "u1", "cred-a", "{}", 0, None, None)
            .await
            .unwrap();

        let err = PasskeyService::remove(&db, "u2", &cred.id).await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));

        let err = PasskeyService::rename(&db, "u2", &cred.id, "Stolen").await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));

        PasskeyService::rename(&db, "u1", &cred.id, "My iPhone").await.unwrap();
        let listed = PasskeyService::list(&db, "u1").await.unwrap();
        assert_eq!(listed[0].device_name.as_deref(), Some("My iPhone"));
    }

    #[tokio::test]
    async fn rename_missing_passkey_is_not_found() {
        let (db, _config) = setup().await;
        insert_user(&db, "u1", "one@example.com", None).await;

        let err = PasskeyService::rename(&db, "u1", "no-such-row", "Label").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
