use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use super::lockout;
use super::model::{LockState, NewCredential, NewUser, User, UserCredential};
use super::repo::CredentialStore;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
struct State {
    users: HashMap<Uuid, User>,
    credentials: HashMap<Uuid, UserCredential>,
}

/// In-memory `CredentialStore` with snapshot transactions: a transaction
/// works on a copy of the state and commit publishes the copy wholesale.
/// Backs the service tests; also usable by embedders that want the account
/// flows without Postgres.
#[derive(Debug, Clone, Default)]
pub struct MemoryCredentialStore {
    inner: Arc<Mutex<State>>,
}

pub struct MemoryTx {
    snapshot: State,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> MutexGuard<'_, State> {
        self.inner.lock().expect("store mutex poisoned")
    }

    /// Committed credential row, if any. Fixture helper for assertions.
    pub fn find_credential(&self, user_id: Uuid) -> Option<UserCredential> {
        self.locked().credentials.get(&user_id).cloned()
    }

    /// Applies a direct mutation to a committed credential row, bypassing
    /// transactions. Fixture helper, e.g. for forcing a token expiry into
    /// the past.
    pub fn with_credential(&self, user_id: Uuid, f: impl FnOnce(&mut UserCredential)) {
        if let Some(credential) = self.locked().credentials.get_mut(&user_id) {
            f(credential);
        }
    }

    /// Same as `with_credential`, for the user row.
    pub fn with_user(&self, user_id: Uuid, f: impl FnOnce(&mut User)) {
        if let Some(user) = self.locked().users.get_mut(&user_id) {
            f(user);
        }
    }

    pub fn user_count(&self) -> usize {
        self.locked().users.len()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<Self::Tx> {
        Ok(MemoryTx {
            snapshot: self.locked().clone(),
        })
    }

    async fn commit(&self, tx: Self::Tx) -> Result<()> {
        *self.locked() = tx.snapshot;
        Ok(())
    }

    async fn rollback(&self, _tx: Self::Tx) -> Result<()> {
        Ok(())
    }

    async fn insert_user(&self, tx: &mut Self::Tx, user: NewUser) -> Result<User> {
        let user = User {
            id: Uuid::new_v4(),
            email: user.email,
            first_name: user.first_name,
            last_name: user.last_name,
            active: true,
            created_at: OffsetDateTime::now_utc(),
            version: 0,
        };
        tx.snapshot.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn insert_credential(&self, tx: &mut Self::Tx, credential: NewCredential) -> Result<()> {
        let row = UserCredential {
            user_id: credential.user_id,
            password_hash: credential.password_hash,
            password_expires_at: None,
            invalid_attempts: 0,
            locked: false,
            activation_key_hash: credential.activation_key_hash,
            activation_key_expires_at: credential.activation_key_expires_at,
            activated: false,
            reset_key_hash: credential.reset_key_hash,
            reset_key_expires_at: credential.reset_key_expires_at,
            reset_at: None,
            version: 0,
        };
        tx.snapshot.credentials.insert(row.user_id, row);
        Ok(())
    }

    async fn find_user(&self, tx: &mut Self::Tx, user_id: Uuid) -> Result<User> {
        tx.snapshot.users.get(&user_id).cloned().ok_or(Error::NotFound)
    }

    async fn find_user_by_email(&self, tx: &mut Self::Tx, email: &str) -> Result<User> {
        tx.snapshot
            .users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned()
            .ok_or(Error::NotFound)
    }

    async fn exists_by_email(&self, tx: &mut Self::Tx, email: &str) -> Result<bool> {
        Ok(tx
            .snapshot
            .users
            .values()
            .any(|u| u.email.eq_ignore_ascii_case(email)))
    }

    async fn credential(&self, tx: &mut Self::Tx, user_id: Uuid) -> Result<UserCredential> {
        tx.snapshot
            .credentials
            .get(&user_id)
            .cloned()
            .ok_or(Error::NotFound)
    }

    async fn credential_by_activation_hash(
        &self,
        tx: &mut Self::Tx,
        hash: &str,
    ) -> Result<UserCredential> {
        tx.snapshot
            .credentials
            .values()
            .find(|c| c.activation_key_hash.as_deref() == Some(hash))
            .cloned()
            .ok_or(Error::NotFound)
    }

    async fn credential_by_reset_hash(
        &self,
        tx: &mut Self::Tx,
        hash: &str,
    ) -> Result<UserCredential> {
        tx.snapshot
            .credentials
            .values()
            .find(|c| c.reset_key_hash.as_deref() == Some(hash))
            .cloned()
            .ok_or(Error::NotFound)
    }

    async fn set_activated(&self, tx: &mut Self::Tx, user_id: Uuid) -> Result<()> {
        let credential = credential_mut(tx, user_id)?;
        credential.activated = true;
        credential.version += 1;
        Ok(())
    }

    async fn set_reset_key(
        &self,
        tx: &mut Self::Tx,
        user_id: Uuid,
        hash: &str,
        expires_at: OffsetDateTime,
    ) -> Result<()> {
        let credential = credential_mut(tx, user_id)?;
        credential.reset_key_hash = Some(hash.to_string());
        credential.reset_key_expires_at = Some(expires_at);
        credential.version += 1;
        Ok(())
    }

    async fn increment_invalid_attempts(
        &self,
        tx: &mut Self::Tx,
        user_id: Uuid,
        threshold: i32,
    ) -> Result<LockState> {
        let credential = credential_mut(tx, user_id)?;
        credential.invalid_attempts += 1;
        if lockout::should_lock(credential.invalid_attempts, threshold) {
            credential.locked = true;
        }
        credential.version += 1;
        Ok(LockState {
            invalid_attempts: credential.invalid_attempts,
            locked: credential.locked,
        })
    }

    async fn reset_invalid_attempts(&self, tx: &mut Self::Tx, user_id: Uuid) -> Result<()> {
        let credential = credential_mut(tx, user_id)?;
        credential.invalid_attempts = 0;
        credential.version += 1;
        Ok(())
    }

    async fn set_password_and_clear_reset(
        &self,
        tx: &mut Self::Tx,
        user_id: Uuid,
        password_hash: &str,
        password_expires_at: OffsetDateTime,
        reset_at: OffsetDateTime,
    ) -> Result<()> {
        let credential = credential_mut(tx, user_id)?;
        credential.password_hash = Some(password_hash.to_string());
        credential.password_expires_at = Some(password_expires_at);
        credential.activated = true;
        credential.invalid_attempts = 0;
        credential.locked = false;
        credential.reset_key_hash = None;
        credential.reset_key_expires_at = None;
        credential.reset_at = Some(reset_at);
        credential.version += 1;
        Ok(())
    }

    async fn set_password(
        &self,
        tx: &mut Self::Tx,
        user_id: Uuid,
        password_hash: &str,
        password_expires_at: OffsetDateTime,
    ) -> Result<()> {
        let credential = credential_mut(tx, user_id)?;
        credential.password_hash = Some(password_hash.to_string());
        credential.password_expires_at = Some(password_expires_at);
        credential.invalid_attempts = 0;
        credential.locked = false;
        credential.version += 1;
        Ok(())
    }
}

fn credential_mut(tx: &mut MemoryTx, user_id: Uuid) -> Result<&mut UserCredential> {
    tx.snapshot
        .credentials
        .get_mut(&user_id)
        .ok_or(Error::NotFound)
}
