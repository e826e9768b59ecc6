use async_trait::async_trait;
use tracing::info;

use super::model::User;

/// Delivers account emails. Always invoked after the surrounding transaction
/// has committed; a failure here is reported to the caller but never rolls
/// the committed state change back.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_activation(&self, user: &User, token: &str) -> anyhow::Result<()>;
    async fn notify_password_reset_init(&self, user: &User, token: &str) -> anyhow::Result<()>;
    async fn notify_password_change(&self, user: &User) -> anyhow::Result<()>;
}

/// Logs that a notification would have been sent, without the token. For
/// local runs until a real mailer is wired in.
#[derive(Debug, Clone, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify_activation(&self, user: &User, _token: &str) -> anyhow::Result<()> {
        info!(user_id = %user.id, "activation email suppressed by logging notifier");
        Ok(())
    }

    async fn notify_password_reset_init(&self, user: &User, _token: &str) -> anyhow::Result<()> {
        info!(user_id = %user.id, "password reset email suppressed by logging notifier");
        Ok(())
    }

    async fn notify_password_change(&self, user: &User) -> anyhow::Result<()> {
        info!(user_id = %user.id, "password change email suppressed by logging notifier");
        Ok(())
    }
}
