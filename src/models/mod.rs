pub mod passkey;
pub mod user;

pub use passkey::*;
pub use user::*;
