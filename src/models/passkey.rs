use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Stored passkey credential. credential_id is the authenticator-assigned
/// identifier (base64url, globally unique); credential_data is the serialized
/// webauthn-rs Passkey carrying the public key.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PasskeyCredential {
    pub id: String,
    pub user_id: String,
    pub credential_id: String,
    pub credential_data: String,
    pub sign_count: i64,
    pub transports: Option<String>,
    pub device_name: Option<String>,
    pub is_active: bool,
    pub created_at: String,
    pub last_used_at: Option<String>,
}

/// Which ceremony a stored challenge belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeType {
    Registration,
    Authentication,
}

impl ChallengeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeType::Registration => "registration",
            ChallengeType::Authentication => "authentication",
        }
    }
}

/// Single-use, time-boxed WebAuthn challenge. state_json holds the serialized
/// registration/authentication state, which embeds the random challenge value.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WebAuthnChallenge {
    pub id: String,
    pub user_id: String,
    pub challenge_type: String,
    pub state_json: String,
    pub expires_at: String,
    pub used_at: Option<String>,
    pub created_at: String,
}
