pub mod challenge;
pub mod credential;
pub mod passkey;
pub mod token;

pub use challenge::ChallengeService;
pub use credential::CredentialService;
pub use passkey::PasskeyService;
pub use token::TokenService;
