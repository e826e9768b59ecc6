use std::sync::Arc;

use time::{Duration, OffsetDateTime};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::dto::{
    check_token, ChangePasswordRequest, LoginRequest, RegisterRequest, ResetPasswordRequest,
};
use super::model::{NewCredential, NewUser, User};
use super::notifier::Notifier;
use super::password::PasswordHasher;
use super::repo::CredentialStore;
use super::token;
use crate::config::AccountConfig;
use crate::error::{Error, Result};

/// Orchestrates the credential lifecycle: registration, activation, login
/// with lockout, password change and password reset. One transaction per
/// operation; notifications go out only after the commit, so a slow or
/// failing mail send never holds a transaction open.
pub struct AccountService<S: CredentialStore> {
    store: S,
    hasher: Arc<dyn PasswordHasher>,
    notifier: Arc<dyn Notifier>,
    config: AccountConfig,
}

impl<S: CredentialStore> AccountService<S> {
    pub fn new(
        store: S,
        hasher: Arc<dyn PasswordHasher>,
        notifier: Arc<dyn Notifier>,
        config: AccountConfig,
    ) -> Self {
        Self {
            store,
            hasher,
            notifier,
            config,
        }
    }

    /// Creates the user and its credential in one transaction, then emails
    /// the activation token. A notification failure surfaces as `Internal`
    /// but the registration itself stays committed.
    #[instrument(skip(self, request))]
    pub async fn register(&self, mut request: RegisterRequest) -> Result<User> {
        request.validate()?;

        let password_hash = self
            .hasher
            .hash(&request.password)
            .map_err(|e| Error::internal(e, "failed to hash password"))?;
        let activation = token::issue();
        let activation_expires_at = OffsetDateTime::now_utc()
            + Duration::minutes(self.config.activation_key_ttl_minutes);

        let mut tx = self.store.begin().await?;
        let out = self
            .register_in_tx(
                &mut tx,
                &request,
                password_hash,
                &activation.hash,
                activation_expires_at,
            )
            .await;
        let user = self.finish(tx, out).await?;

        if let Err(e) = self.notifier.notify_activation(&user, &activation.plain).await {
            return Err(Error::internal(e, "failed to send account activation email"));
        }

        info!(user_id = %user.id, "user registered");
        Ok(user)
    }

    async fn register_in_tx(
        &self,
        tx: &mut S::Tx,
        request: &RegisterRequest,
        password_hash: String,
        activation_key_hash: &str,
        activation_key_expires_at: OffsetDateTime,
    ) -> Result<User> {
        if self.store.exists_by_email(tx, &request.email).await? {
            return Err(Error::field("email", "already registered"));
        }

        let user = self
            .store
            .insert_user(
                tx,
                NewUser {
                    first_name: request.first_name.clone(),
                    last_name: request.last_name.clone(),
                    email: request.email.clone(),
                },
            )
            .await?;
        self.store
            .insert_credential(
                tx,
                NewCredential {
                    user_id: user.id,
                    password_hash: Some(password_hash),
                    activation_key_hash: Some(activation_key_hash.to_string()),
                    activation_key_expires_at: Some(activation_key_expires_at),
                    ..Default::default()
                },
            )
            .await?;
        Ok(user)
    }

    /// Exchanges an emailed activation token for `activated = true`.
    /// Replaying the token against an already-activated credential is a
    /// no-op, so activation is idempotent.
    #[instrument(skip(self, plain_token))]
    pub async fn activate(&self, plain_token: &str) -> Result<()> {
        check_token("token", plain_token)?;
        let hash = token::hash_token(plain_token);

        let mut tx = self.store.begin().await?;
        let out = self.activate_in_tx(&mut tx, &hash).await;
        self.finish(tx, out).await
    }

    async fn activate_in_tx(&self, tx: &mut S::Tx, hash: &str) -> Result<()> {
        let credential = match self.store.credential_by_activation_hash(tx, hash).await {
            Ok(c) => c,
            Err(Error::NotFound) => return Err(Error::bad_request("invalid activation token")),
            Err(e) => return Err(e),
        };

        if credential.activated {
            return Ok(());
        }
        match credential.activation_key_expires_at {
            Some(expires_at) if expires_at > OffsetDateTime::now_utc() => {}
            _ => {
                return Err(Error::bad_request(
                    "activation token is expired, sign up again",
                ))
            }
        }
        self.store.set_activated(tx, credential.user_id).await
    }

    /// Verifies the password and returns the user. Failures are deliberately
    /// generic so callers cannot probe which factor was wrong. A failed
    /// verification still commits, so the attempt counter survives the
    /// unauthorized result.
    #[instrument(skip(self, request))]
    pub async fn login(&self, mut request: LoginRequest) -> Result<User> {
        request.validate()?;

        let mut tx = self.store.begin().await?;
        let out = self.login_in_tx(&mut tx, &request).await;
        let user = self.finish_verify(tx, out).await?;

        info!(user_id = %user.id, "user logged in");
        Ok(user)
    }

    async fn login_in_tx(&self, tx: &mut S::Tx, request: &LoginRequest) -> Result<User> {
        let user = match self.store.find_user_by_email(tx, &request.email).await {
            Ok(u) => u,
            Err(Error::NotFound) => {
                return Err(Error::unauthorized("invalid email or password"))
            }
            Err(e) => return Err(e),
        };
        if !user.active {
            return Err(Error::unauthorized("invalid email or password"));
        }

        let credential = match self.store.credential(tx, user.id).await {
            Ok(c) => c,
            Err(Error::NotFound) => {
                return Err(Error::unauthorized("invalid email or password"))
            }
            Err(e) => return Err(e),
        };

        if !credential.activated {
            return Err(Error::unauthorized("user is not activated"));
        }
        if let Some(expires_at) = credential.password_expires_at {
            if expires_at < OffsetDateTime::now_utc() {
                return Err(Error::unauthorized("password expired"));
            }
        }
        // A locked account fails before any hash comparison.
        if credential.locked {
            return Err(Error::unauthorized("account is locked"));
        }

        if !self.verify_or_count_failure(tx, user.id, &request.password, &credential.password_hash).await? {
            return Err(Error::unauthorized("invalid email or password"));
        }

        if credential.invalid_attempts > 0 {
            // Not fatal: the login already succeeded.
            if let Err(e) = self.store.reset_invalid_attempts(tx, user.id).await {
                warn!(user_id = %user.id, error = %e, "failed to reset invalid attempts");
            }
        }
        Ok(user)
    }

    /// Replaces the password of an authenticated principal. A wrong current
    /// password counts towards lockout exactly like a failed login. On
    /// success the failure state is cleared and the password expiry window
    /// restarts, mirroring a reset.
    #[instrument(skip(self, request))]
    pub async fn change_password(
        &self,
        user_id: Uuid,
        request: ChangePasswordRequest,
    ) -> Result<()> {
        request.validate()?;

        let mut tx = self.store.begin().await?;
        let out = self.change_password_in_tx(&mut tx, user_id, &request).await;
        let user = self.finish_verify(tx, out).await?;

        if let Err(e) = self.notifier.notify_password_change(&user).await {
            return Err(Error::internal(e, "failed to send password change email"));
        }

        info!(user_id = %user.id, "password changed");
        Ok(())
    }

    async fn change_password_in_tx(
        &self,
        tx: &mut S::Tx,
        user_id: Uuid,
        request: &ChangePasswordRequest,
    ) -> Result<User> {
        let credential = match self.store.credential(tx, user_id).await {
            Ok(c) => c,
            Err(Error::NotFound) => {
                return Err(Error::bad_request(
                    "password cannot be changed as user does not exist",
                ))
            }
            Err(e) => return Err(e),
        };

        if !self
            .verify_or_count_failure(tx, user_id, &request.current_password, &credential.password_hash)
            .await?
        {
            return Err(Error::unauthorized("invalid current password"));
        }

        let new_hash = self
            .hasher
            .hash(&request.new_password)
            .map_err(|e| Error::internal(e, "failed to hash password"))?;
        let expires_at =
            OffsetDateTime::now_utc() + Duration::days(self.config.password_expiry_days);
        self.store
            .set_password(tx, user_id, &new_hash, expires_at)
            .await?;

        match self.store.find_user(tx, user_id).await {
            Ok(user) => Ok(user),
            Err(Error::NotFound) => Err(Error::bad_request(
                "password cannot be changed as user does not exist",
            )),
            Err(e) => Err(e),
        }
    }

    /// Issues a time-boxed reset token and emails it. Deliberately reports
    /// a distinct "user not found" for unknown emails (observed behavior,
    /// see DESIGN.md).
    #[instrument(skip(self))]
    pub async fn initiate_password_reset(&self, email: &str) -> Result<()> {
        let email = email.trim().to_lowercase();
        let reset = token::issue();
        let expires_at =
            OffsetDateTime::now_utc() + Duration::minutes(self.config.reset_key_ttl_minutes);

        let mut tx = self.store.begin().await?;
        let out = self
            .initiate_reset_in_tx(&mut tx, &email, &reset.hash, expires_at)
            .await;
        let user = self.finish(tx, out).await?;

        if let Err(e) = self
            .notifier
            .notify_password_reset_init(&user, &reset.plain)
            .await
        {
            return Err(Error::internal(e, "failed to send password reset email"));
        }

        info!(user_id = %user.id, "password reset email sent");
        Ok(())
    }

    async fn initiate_reset_in_tx(
        &self,
        tx: &mut S::Tx,
        email: &str,
        reset_key_hash: &str,
        expires_at: OffsetDateTime,
    ) -> Result<User> {
        let user = match self.store.find_user_by_email(tx, email).await {
            Ok(u) => u,
            Err(Error::NotFound) => return Err(Error::bad_request("user not found")),
            Err(e) => return Err(e),
        };

        match self.store.credential(tx, user.id).await {
            Ok(_) => {
                self.store
                    .set_reset_key(tx, user.id, reset_key_hash, expires_at)
                    .await?
            }
            // A user provisioned without a credential row gets one carrying
            // only the reset fields.
            Err(Error::NotFound) => {
                self.store
                    .insert_credential(
                        tx,
                        NewCredential {
                            user_id: user.id,
                            reset_key_hash: Some(reset_key_hash.to_string()),
                            reset_key_expires_at: Some(expires_at),
                            ..Default::default()
                        },
                    )
                    .await?
            }
            Err(e) => return Err(e),
        }
        Ok(user)
    }

    /// Exchanges an unexpired reset token for a new password. Also clears
    /// the lock and failure count, activates the credential and restarts
    /// the password expiry window.
    #[instrument(skip(self, request))]
    pub async fn reset_password(&self, request: ResetPasswordRequest) -> Result<()> {
        request.validate()?;

        let token_hash = token::hash_token(&request.reset_token);
        let new_hash = self
            .hasher
            .hash(&request.new_password)
            .map_err(|e| Error::internal(e, "failed to hash password"))?;

        let mut tx = self.store.begin().await?;
        let out = self.reset_password_in_tx(&mut tx, &token_hash, &new_hash).await;
        self.finish(tx, out).await
    }

    async fn reset_password_in_tx(
        &self,
        tx: &mut S::Tx,
        token_hash: &str,
        new_password_hash: &str,
    ) -> Result<()> {
        let credential = match self.store.credential_by_reset_hash(tx, token_hash).await {
            Ok(c) => c,
            Err(Error::NotFound) => return Err(Error::bad_request("reset key is invalid")),
            Err(e) => return Err(e),
        };

        let now = OffsetDateTime::now_utc();
        match credential.reset_key_expires_at {
            Some(expires_at) if expires_at > now => {}
            _ => return Err(Error::bad_request("reset key is expired")),
        }

        self.store
            .set_password_and_clear_reset(
                tx,
                credential.user_id,
                new_password_hash,
                now + Duration::days(self.config.password_expiry_days),
                now,
            )
            .await
    }

    /// Verifies a password against the stored hash; on mismatch bumps the
    /// failure counter atomically, locking the row once the threshold is
    /// reached.
    async fn verify_or_count_failure(
        &self,
        tx: &mut S::Tx,
        user_id: Uuid,
        plain: &str,
        password_hash: &Option<String>,
    ) -> Result<bool> {
        let matched = match password_hash.as_deref() {
            Some(hash) => self
                .hasher
                .verify(plain, hash)
                .map_err(|e| Error::internal(e, "failed to verify password"))?,
            // A credential without a password (reset-only row) never matches.
            None => false,
        };

        if !matched {
            let state = self
                .store
                .increment_invalid_attempts(tx, user_id, self.config.lockout_threshold)
                .await?;
            if state.locked {
                warn!(
                    user_id = %user_id,
                    invalid_attempts = state.invalid_attempts,
                    "account locked after repeated failed attempts"
                );
            }
        }
        Ok(matched)
    }

    /// Commits on success, rolls back on failure.
    async fn finish<T>(&self, tx: S::Tx, out: Result<T>) -> Result<T> {
        match out {
            Ok(value) => {
                self.store.commit(tx).await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(e) = self.store.rollback(tx).await {
                    warn!(error = %e, "rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Like `finish`, but an `Unauthorized` outcome also commits: a failed
    /// verification has bumped the attempt counter and that write must
    /// survive the error result.
    async fn finish_verify<T>(&self, tx: S::Tx, out: Result<T>) -> Result<T> {
        match out {
            Err(err @ Error::Unauthorized(_)) => {
                self.store.commit(tx).await?;
                Err(err)
            }
            other => self.finish(tx, other).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::account::memory::MemoryCredentialStore;

    /// Cheap deterministic hasher; the real Argon2 scheme has its own tests.
    /// Counts verifications so tests can assert the locked fast path skips
    /// the comparison.
    #[derive(Default)]
    struct CountingHasher {
        verifications: AtomicUsize,
    }

    impl PasswordHasher for CountingHasher {
        fn hash(&self, plain: &str) -> anyhow::Result<String> {
            Ok(format!("hashed:{plain}"))
        }

        fn verify(&self, plain: &str, hash: &str) -> anyhow::Result<bool> {
            self.verifications.fetch_add(1, Ordering::SeqCst);
            Ok(hash == format!("hashed:{plain}"))
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        activation_tokens: Mutex<Vec<String>>,
        reset_tokens: Mutex<Vec<String>>,
        password_changes: AtomicUsize,
        fail: AtomicBool,
    }

    impl RecordingNotifier {
        fn last_activation_token(&self) -> String {
            self.activation_tokens.lock().unwrap().last().cloned().unwrap()
        }

        fn last_reset_token(&self) -> String {
            self.reset_tokens.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait::async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify_activation(&self, _user: &User, token: &str) -> anyhow::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("smtp down");
            }
            self.activation_tokens.lock().unwrap().push(token.to_string());
            Ok(())
        }

        async fn notify_password_reset_init(&self, _user: &User, token: &str) -> anyhow::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("smtp down");
            }
            self.reset_tokens.lock().unwrap().push(token.to_string());
            Ok(())
        }

        async fn notify_password_change(&self, _user: &User) -> anyhow::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("smtp down");
            }
            self.password_changes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        service: AccountService<MemoryCredentialStore>,
        store: MemoryCredentialStore,
        hasher: Arc<CountingHasher>,
        notifier: Arc<RecordingNotifier>,
    }

    fn harness() -> Harness {
        let store = MemoryCredentialStore::new();
        let hasher = Arc::new(CountingHasher::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let service = AccountService::new(
            store.clone(),
            hasher.clone() as Arc<dyn PasswordHasher>,
            notifier.clone() as Arc<dyn Notifier>,
            AccountConfig::fake(),
        );
        Harness {
            service,
            store,
            hasher,
            notifier,
        }
    }

    fn register_request() -> RegisterRequest {
        RegisterRequest {
            first_name: "Jo".into(),
            last_name: "Doe".into(),
            email: "jo@example.com".into(),
            password: "Secret123".into(),
        }
    }

    fn login_request(email: &str, password: &str) -> LoginRequest {
        LoginRequest {
            email: email.into(),
            password: password.into(),
        }
    }

    async fn register_and_activate(h: &Harness) -> User {
        let user = h.service.register(register_request()).await.unwrap();
        let token = h.notifier.last_activation_token();
        h.service.activate(&token).await.unwrap();
        user
    }

    fn assert_unauthorized(err: Error, cause: &str) {
        match err {
            Error::Unauthorized(message) => assert_eq!(message, cause),
            other => panic!("expected unauthorized, got {other:?}"),
        }
    }

    fn assert_bad_request(err: Error, cause: &str) {
        match err {
            Error::BadRequest(message) => assert_eq!(message, cause),
            other => panic!("expected bad request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn register_activate_login_round_trip() {
        let h = harness();
        let user = h.service.register(register_request()).await.unwrap();
        assert_eq!(user.email, "jo@example.com");
        assert!(user.active);

        let token = h.notifier.last_activation_token();
        h.service.activate(&token).await.unwrap();

        let logged_in = h
            .service
            .login(login_request("jo@example.com", "Secret123"))
            .await
            .unwrap();
        assert_eq!(logged_in.email, "jo@example.com");
        assert_eq!(logged_in.id, user.id);
    }

    #[tokio::test]
    async fn registering_the_same_email_twice_names_the_field() {
        let h = harness();
        h.service.register(register_request()).await.unwrap();

        let mut second = register_request();
        // Case only differs; lookup is case-insensitive.
        second.email = "JO@example.com".into();
        match h.service.register(second).await.unwrap_err() {
            Error::Validation(errors) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].field, "email");
                assert_eq!(errors[0].message, "already registered");
            }
            other => panic!("expected field error, got {other:?}"),
        }
        assert_eq!(h.store.user_count(), 1);
    }

    #[tokio::test]
    async fn bogus_activation_token_is_rejected_without_mutation() {
        let h = harness();
        let user = h.service.register(register_request()).await.unwrap();
        let before = h.store.find_credential(user.id).unwrap();

        let err = h
            .service
            .activate("not-a-real-token")
            .await
            .unwrap_err();
        assert_bad_request(err, "invalid activation token");
        assert_eq!(h.store.find_credential(user.id).unwrap(), before);
    }

    #[tokio::test]
    async fn activation_is_idempotent() {
        let h = harness();
        h.service.register(register_request()).await.unwrap();
        let token = h.notifier.last_activation_token();
        h.service.activate(&token).await.unwrap();
        // Replaying the same token is a harmless no-op.
        h.service.activate(&token).await.unwrap();
    }

    #[tokio::test]
    async fn expired_activation_token_is_rejected_even_though_its_hash_matches() {
        let h = harness();
        let user = h.service.register(register_request()).await.unwrap();
        let token = h.notifier.last_activation_token();
        h.store.with_credential(user.id, |c| {
            c.activation_key_expires_at =
                Some(OffsetDateTime::now_utc() - Duration::minutes(1));
        });

        let err = h.service.activate(&token).await.unwrap_err();
        assert_bad_request(err, "activation token is expired, sign up again");
    }

    #[tokio::test]
    async fn login_is_generic_about_unknown_emails_and_inactive_users() {
        let h = harness();
        let err = h
            .service
            .login(login_request("nobody@example.com", "Secret123"))
            .await
            .unwrap_err();
        assert_unauthorized(err, "invalid email or password");

        let user = register_and_activate(&h).await;
        h.store.with_user(user.id, |u| u.active = false);
        let err = h
            .service
            .login(login_request("jo@example.com", "Secret123"))
            .await
            .unwrap_err();
        assert_unauthorized(err, "invalid email or password");
    }

    #[tokio::test]
    async fn login_requires_activation() {
        let h = harness();
        h.service.register(register_request()).await.unwrap();
        let err = h
            .service
            .login(login_request("jo@example.com", "Secret123"))
            .await
            .unwrap_err();
        assert_unauthorized(err, "user is not activated");
    }

    #[tokio::test]
    async fn login_rejects_an_expired_password() {
        let h = harness();
        let user = register_and_activate(&h).await;
        h.store.with_credential(user.id, |c| {
            c.password_expires_at = Some(OffsetDateTime::now_utc() - Duration::days(1));
        });

        let err = h
            .service
            .login(login_request("jo@example.com", "Secret123"))
            .await
            .unwrap_err();
        assert_unauthorized(err, "password expired");
    }

    #[tokio::test]
    async fn a_failed_login_commits_the_attempt_counter() {
        let h = harness();
        let user = register_and_activate(&h).await;

        let err = h
            .service
            .login(login_request("jo@example.com", "WrongPassword"))
            .await
            .unwrap_err();
        assert_unauthorized(err, "invalid email or password");
        assert_eq!(h.store.find_credential(user.id).unwrap().invalid_attempts, 1);
    }

    #[tokio::test]
    async fn three_failures_lock_the_account_and_skip_later_comparisons() {
        let h = harness();
        let user = register_and_activate(&h).await;

        for _ in 0..3 {
            let err = h
                .service
                .login(login_request("jo@example.com", "WrongPassword"))
                .await
                .unwrap_err();
            assert_unauthorized(err, "invalid email or password");
        }
        let credential = h.store.find_credential(user.id).unwrap();
        assert!(credential.locked);
        assert_eq!(credential.invalid_attempts, 3);

        let verifications_before = h.hasher.verifications.load(Ordering::SeqCst);
        let err = h
            .service
            .login(login_request("jo@example.com", "Secret123"))
            .await
            .unwrap_err();
        assert_unauthorized(err, "account is locked");
        // The correct password was never compared.
        assert_eq!(
            h.hasher.verifications.load(Ordering::SeqCst),
            verifications_before
        );
    }

    #[tokio::test]
    async fn a_successful_login_resets_the_attempt_counter() {
        let h = harness();
        let user = register_and_activate(&h).await;

        for _ in 0..2 {
            let _ = h
                .service
                .login(login_request("jo@example.com", "WrongPassword"))
                .await;
        }
        assert_eq!(h.store.find_credential(user.id).unwrap().invalid_attempts, 2);

        h.service
            .login(login_request("jo@example.com", "Secret123"))
            .await
            .unwrap();
        assert_eq!(h.store.find_credential(user.id).unwrap().invalid_attempts, 0);
    }

    #[tokio::test]
    async fn reset_flow_replaces_the_password_and_unlocks_the_account() {
        let h = harness();
        let user = register_and_activate(&h).await;

        // Lock the account first.
        for _ in 0..3 {
            let _ = h
                .service
                .login(login_request("jo@example.com", "WrongPassword"))
                .await;
        }
        assert!(h.store.find_credential(user.id).unwrap().locked);

        h.service
            .initiate_password_reset("jo@example.com")
            .await
            .unwrap();
        let token = h.notifier.last_reset_token();
        h.service
            .reset_password(ResetPasswordRequest {
                reset_token: token,
                new_password: "Fresh456".into(),
            })
            .await
            .unwrap();

        let credential = h.store.find_credential(user.id).unwrap();
        assert!(!credential.locked);
        assert_eq!(credential.invalid_attempts, 0);
        assert!(credential.reset_key_hash.is_none());
        assert!(credential.reset_at.is_some());
        assert!(credential.password_expires_at.is_some());

        h.service
            .login(login_request("jo@example.com", "Fresh456"))
            .await
            .unwrap();
        let err = h
            .service
            .login(login_request("jo@example.com", "Secret123"))
            .await
            .unwrap_err();
        assert_unauthorized(err, "invalid email or password");
    }

    #[tokio::test]
    async fn reset_initiation_reports_unknown_users() {
        let h = harness();
        let err = h
            .service
            .initiate_password_reset("nobody@example.com")
            .await
            .unwrap_err();
        assert_bad_request(err, "user not found");
    }

    #[tokio::test]
    async fn reset_initiation_creates_a_credential_row_when_missing() {
        let h = harness();
        // Provision a user directly, without a credential (e.g. imported).
        let mut tx = h.store.begin().await.unwrap();
        let user = h
            .store
            .insert_user(
                &mut tx,
                NewUser {
                    first_name: "Sam".into(),
                    last_name: "Lee".into(),
                    email: "sam@example.com".into(),
                },
            )
            .await
            .unwrap();
        h.store.commit(tx).await.unwrap();
        assert!(h.store.find_credential(user.id).is_none());

        h.service
            .initiate_password_reset("sam@example.com")
            .await
            .unwrap();
        let credential = h.store.find_credential(user.id).unwrap();
        assert!(credential.reset_key_hash.is_some());
        assert!(credential.password_hash.is_none());

        // Completing the reset activates the credential and sets a password.
        let token = h.notifier.last_reset_token();
        h.service
            .reset_password(ResetPasswordRequest {
                reset_token: token,
                new_password: "Fresh456".into(),
            })
            .await
            .unwrap();
        h.service
            .login(login_request("sam@example.com", "Fresh456"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn invalid_and_expired_reset_tokens_are_distinguished() {
        let h = harness();
        let user = register_and_activate(&h).await;

        let err = h
            .service
            .reset_password(ResetPasswordRequest {
                reset_token: "not-a-real-token".into(),
                new_password: "Fresh456".into(),
            })
            .await
            .unwrap_err();
        assert_bad_request(err, "reset key is invalid");

        h.service
            .initiate_password_reset("jo@example.com")
            .await
            .unwrap();
        h.store.with_credential(user.id, |c| {
            c.reset_key_expires_at = Some(OffsetDateTime::now_utc() - Duration::minutes(1));
        });
        let token = h.notifier.last_reset_token();
        let err = h
            .service
            .reset_password(ResetPasswordRequest {
                reset_token: token,
                new_password: "Fresh456".into(),
            })
            .await
            .unwrap_err();
        assert_bad_request(err, "reset key is expired");
    }

    #[tokio::test]
    async fn change_password_swaps_the_credential_and_notifies() {
        let h = harness();
        let user = register_and_activate(&h).await;

        h.service
            .change_password(
                user.id,
                ChangePasswordRequest {
                    current_password: "Secret123".into(),
                    new_password: "Fresh456".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(h.notifier.password_changes.load(Ordering::SeqCst), 1);

        h.service
            .login(login_request("jo@example.com", "Fresh456"))
            .await
            .unwrap();
        let err = h
            .service
            .login(login_request("jo@example.com", "Secret123"))
            .await
            .unwrap_err();
        assert_unauthorized(err, "invalid email or password");
    }

    #[tokio::test]
    async fn wrong_current_password_counts_towards_lockout() {
        let h = harness();
        let user = register_and_activate(&h).await;

        for _ in 0..3 {
            let err = h
                .service
                .change_password(
                    user.id,
                    ChangePasswordRequest {
                        current_password: "WrongPassword".into(),
                        new_password: "Fresh456".into(),
                    },
                )
                .await
                .unwrap_err();
            assert_unauthorized(err, "invalid current password");
        }
        assert!(h.store.find_credential(user.id).unwrap().locked);
    }

    #[tokio::test]
    async fn change_password_for_a_vanished_user_is_a_bad_request() {
        let h = harness();
        let err = h
            .service
            .change_password(
                Uuid::new_v4(),
                ChangePasswordRequest {
                    current_password: "Secret123".into(),
                    new_password: "Fresh456".into(),
                },
            )
            .await
            .unwrap_err();
        assert_bad_request(err, "password cannot be changed as user does not exist");
    }

    #[tokio::test]
    async fn notification_failure_surfaces_internal_but_keeps_the_registration() {
        let h = harness();
        h.notifier.fail.store(true, Ordering::SeqCst);

        let err = h.service.register(register_request()).await.unwrap_err();
        assert!(matches!(err, Error::Internal { .. }));
        // The rows are durable despite the failed email.
        assert_eq!(h.store.user_count(), 1);
    }

    #[tokio::test]
    async fn register_rejects_invalid_fields_before_touching_the_store() {
        let h = harness();
        let mut request = register_request();
        request.email = "not-an-email".into();
        request.password = "short".into();

        match h.service.register(request).await.unwrap_err() {
            Error::Validation(errors) => {
                assert!(errors.iter().any(|e| e.field == "email"));
                assert!(errors.iter().any(|e| e.field == "password"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
        assert_eq!(h.store.user_count(), 0);
    }
}
