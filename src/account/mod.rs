pub mod dto;
pub mod lockout;
pub mod memory;
pub mod model;
pub mod notifier;
pub mod password;
pub mod repo;
pub mod service;
pub mod token;

pub use dto::{ChangePasswordRequest, LoginRequest, RegisterRequest, ResetPasswordRequest};
pub use model::{User, UserCredential};
pub use notifier::{LoggingNotifier, Notifier};
pub use password::{Argon2Hasher, PasswordHasher};
pub use repo::{CredentialStore, PgCredentialStore};
pub use service::AccountService;
