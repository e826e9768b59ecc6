use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use super::model::{LockState, NewCredential, NewUser, User, UserCredential};
use crate::error::{Error, Result};

/// Transactional persistence for `User`/`UserCredential`. Every data method
/// takes an explicit transaction handle; the service owns begin/commit/
/// rollback so no operation can partially write across the pair.
///
/// Data methods fail with `NotFound` or `Internal` only; mapping `NotFound`
/// to a caller-facing error is the service's job.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    type Tx: Send;

    async fn begin(&self) -> Result<Self::Tx>;
    async fn commit(&self, tx: Self::Tx) -> Result<()>;
    async fn rollback(&self, tx: Self::Tx) -> Result<()>;

    async fn insert_user(&self, tx: &mut Self::Tx, user: NewUser) -> Result<User>;
    async fn insert_credential(&self, tx: &mut Self::Tx, credential: NewCredential) -> Result<()>;
    async fn find_user(&self, tx: &mut Self::Tx, user_id: Uuid) -> Result<User>;
    async fn find_user_by_email(&self, tx: &mut Self::Tx, email: &str) -> Result<User>;
    async fn exists_by_email(&self, tx: &mut Self::Tx, email: &str) -> Result<bool>;
    async fn credential(&self, tx: &mut Self::Tx, user_id: Uuid) -> Result<UserCredential>;
    async fn credential_by_activation_hash(
        &self,
        tx: &mut Self::Tx,
        hash: &str,
    ) -> Result<UserCredential>;
    async fn credential_by_reset_hash(
        &self,
        tx: &mut Self::Tx,
        hash: &str,
    ) -> Result<UserCredential>;
    async fn set_activated(&self, tx: &mut Self::Tx, user_id: Uuid) -> Result<()>;
    async fn set_reset_key(
        &self,
        tx: &mut Self::Tx,
        user_id: Uuid,
        hash: &str,
        expires_at: OffsetDateTime,
    ) -> Result<()>;
    /// Single-statement increment-and-conditional-lock. Two concurrent
    /// failures must never under-count, so the lock decision happens inside
    /// the same UPDATE as the increment.
    async fn increment_invalid_attempts(
        &self,
        tx: &mut Self::Tx,
        user_id: Uuid,
        threshold: i32,
    ) -> Result<LockState>;
    async fn reset_invalid_attempts(&self, tx: &mut Self::Tx, user_id: Uuid) -> Result<()>;
    /// Sets the new password, clears the reset fields, stamps `reset_at`,
    /// activates and unlocks the credential.
    async fn set_password_and_clear_reset(
        &self,
        tx: &mut Self::Tx,
        user_id: Uuid,
        password_hash: &str,
        password_expires_at: OffsetDateTime,
        reset_at: OffsetDateTime,
    ) -> Result<()>;
    /// Sets the new password and clears the failure state, leaving reset and
    /// activation fields alone.
    async fn set_password(
        &self,
        tx: &mut Self::Tx,
        user_id: Uuid,
        password_hash: &str,
        password_expires_at: OffsetDateTime,
    ) -> Result<()>;
}

const USER_COLUMNS: &str = "id, email, first_name, last_name, active, created_at, version";
const CREDENTIAL_COLUMNS: &str = "user_id, password_hash, password_expires_at, invalid_attempts, \
     locked, activation_key_hash, activation_key_expires_at, activated, \
     reset_key_hash, reset_key_expires_at, reset_at, version";

fn db_err(e: sqlx::Error) -> Error {
    match e {
        sqlx::Error::RowNotFound => Error::NotFound,
        e => Error::internal(e, "database error"),
    }
}

#[derive(Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Tx> {
        self.pool.begin().await.map_err(db_err)
    }

    async fn commit(&self, tx: Self::Tx) -> Result<()> {
        tx.commit().await.map_err(db_err)
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<()> {
        tx.rollback().await.map_err(db_err)
    }

    async fn insert_user(&self, tx: &mut Self::Tx, user: NewUser) -> Result<User> {
        sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (email, first_name, last_name, active)
            VALUES ($1, $2, $3, TRUE)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(&user.email)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .fetch_one(&mut **tx)
        .await
        .map_err(db_err)
    }

    async fn insert_credential(&self, tx: &mut Self::Tx, credential: NewCredential) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_credentials
                (user_id, password_hash, activation_key_hash, activation_key_expires_at,
                 reset_key_hash, reset_key_expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(credential.user_id)
        .bind(&credential.password_hash)
        .bind(&credential.activation_key_hash)
        .bind(credential.activation_key_expires_at)
        .bind(&credential.reset_key_hash)
        .bind(credential.reset_key_expires_at)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn find_user(&self, tx: &mut Self::Tx, user_id: Uuid) -> Result<User> {
        sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(user_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(db_err)
    }

    async fn find_user_by_email(&self, tx: &mut Self::Tx, email: &str) -> Result<User> {
        sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE LOWER(email) = LOWER($1)"
        ))
        .bind(email)
        .fetch_one(&mut **tx)
        .await
        .map_err(db_err)
    }

    async fn exists_by_email(&self, tx: &mut Self::Tx, email: &str) -> Result<bool> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM users WHERE LOWER(email) = LOWER($1))",
        )
        .bind(email)
        .fetch_one(&mut **tx)
        .await
        .map_err(db_err)
    }

    async fn credential(&self, tx: &mut Self::Tx, user_id: Uuid) -> Result<UserCredential> {
        sqlx::query_as::<_, UserCredential>(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM user_credentials WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(db_err)
    }

    async fn credential_by_activation_hash(
        &self,
        tx: &mut Self::Tx,
        hash: &str,
    ) -> Result<UserCredential> {
        sqlx::query_as::<_, UserCredential>(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM user_credentials WHERE activation_key_hash = $1"
        ))
        .bind(hash)
        .fetch_one(&mut **tx)
        .await
        .map_err(db_err)
    }

    async fn credential_by_reset_hash(
        &self,
        tx: &mut Self::Tx,
        hash: &str,
    ) -> Result<UserCredential> {
        sqlx::query_as::<_, UserCredential>(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM user_credentials WHERE reset_key_hash = $1"
        ))
        .bind(hash)
        .fetch_one(&mut **tx)
        .await
        .map_err(db_err)
    }

    async fn set_activated(&self, tx: &mut Self::Tx, user_id: Uuid) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE user_credentials
            SET activated = TRUE, version = version + 1
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        ensure_updated(result.rows_affected())
    }

    async fn set_reset_key(
        &self,
        tx: &mut Self::Tx,
        user_id: Uuid,
        hash: &str,
        expires_at: OffsetDateTime,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE user_credentials
            SET reset_key_hash = $2, reset_key_expires_at = $3, version = version + 1
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(hash)
        .bind(expires_at)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        ensure_updated(result.rows_affected())
    }

    async fn increment_invalid_attempts(
        &self,
        tx: &mut Self::Tx,
        user_id: Uuid,
        threshold: i32,
    ) -> Result<LockState> {
        sqlx::query_as::<_, LockState>(
            r#"
            UPDATE user_credentials
            SET invalid_attempts = invalid_attempts + 1,
                locked = locked OR (invalid_attempts + 1 >= $2),
                version = version + 1
            WHERE user_id = $1
            RETURNING invalid_attempts, locked
            "#,
        )
        .bind(user_id)
        .bind(threshold)
        .fetch_one(&mut **tx)
        .await
        .map_err(db_err)
    }

    async fn reset_invalid_attempts(&self, tx: &mut Self::Tx, user_id: Uuid) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE user_credentials
            SET invalid_attempts = 0, version = version + 1
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        ensure_updated(result.rows_affected())
    }

    async fn set_password_and_clear_reset(
        &self,
        tx: &mut Self::Tx,
        user_id: Uuid,
        password_hash: &str,
        password_expires_at: OffsetDateTime,
        reset_at: OffsetDateTime,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE user_credentials
            SET password_hash = $2,
                password_expires_at = $3,
                activated = TRUE,
                invalid_attempts = 0,
                locked = FALSE,
                reset_key_hash = NULL,
                reset_key_expires_at = NULL,
                reset_at = $4,
                version = version + 1
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(password_hash)
        .bind(password_expires_at)
        .bind(reset_at)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        ensure_updated(result.rows_affected())
    }

    async fn set_password(
        &self,
        tx: &mut Self::Tx,
        user_id: Uuid,
        password_hash: &str,
        password_expires_at: OffsetDateTime,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE user_credentials
            SET password_hash = $2,
                password_expires_at = $3,
                invalid_attempts = 0,
                locked = FALSE,
                version = version + 1
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(password_hash)
        .bind(password_expires_at)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        ensure_updated(result.rows_affected())
    }
}

fn ensure_updated(rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        Err(Error::NotFound)
    } else {
        Ok(())
    }
}
