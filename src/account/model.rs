use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Identity record. Created once at registration and never deleted here.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub active: bool,
    pub created_at: OffsetDateTime,
    pub version: i32,
}

/// Security record, one-to-one with `User` (shared id). Only hashes of
/// tokens and passwords are ever stored here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct UserCredential {
    pub user_id: Uuid,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    /// None = the current password never expires.
    pub password_expires_at: Option<OffsetDateTime>,
    pub invalid_attempts: i32,
    pub locked: bool,
    #[serde(skip_serializing)]
    pub activation_key_hash: Option<String>,
    pub activation_key_expires_at: Option<OffsetDateTime>,
    pub activated: bool,
    #[serde(skip_serializing)]
    pub reset_key_hash: Option<String>,
    pub reset_key_expires_at: Option<OffsetDateTime>,
    pub reset_at: Option<OffsetDateTime>,
    pub version: i32,
}

/// Insert payload for `users`; the store assigns id, timestamps and version.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

/// Insert payload for `user_credentials`. Registration fills the password
/// and activation fields; a reset initiated for a user without a credential
/// row fills only the reset fields.
#[derive(Debug, Clone, Default)]
pub struct NewCredential {
    pub user_id: Uuid,
    pub password_hash: Option<String>,
    pub activation_key_hash: Option<String>,
    pub activation_key_expires_at: Option<OffsetDateTime>,
    pub reset_key_hash: Option<String>,
    pub reset_key_expires_at: Option<OffsetDateTime>,
}

/// Outcome of an atomic failed-attempt increment: the post-increment count
/// and whether the row is now locked.
#[derive(Debug, Clone, Copy, FromRow)]
pub struct LockState {
    pub invalid_attempts: i32,
    pub locked: bool,
}
