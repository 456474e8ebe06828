//! Operator alerting over SMTP.
//!
//! Only one alert exists today: the SMS quota hit its floor and
//! dispatch is halted. Alerts are best-effort — a failed send is
//! logged and the tick continues.

use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{error, info, warn};

use textgate_core::config::AlertConfig;

pub struct AdminNotifier {
    config: AlertConfig,
}

impl AdminNotifier {
    pub fn new(config: AlertConfig) -> Self {
        Self { config }
    }

    /// Notify the operator that the send quota reached the floor.
    pub async fn quota_exhausted(&self, remaining: i64) {
        let subject = "SMS quota exhausted";
        let body = format!(
            "The SMS gateway reports {remaining} sends remaining. \
             Dispatch is paused until the quota is topped up."
        );
        if let Err(e) = self.send(subject, &body).await {
            error!(error = %e, "failed to send quota alert");
        }
    }

    async fn send(&self, subject: &str, body: &str) -> anyhow::Result<()> {
        if !self.config.enabled || self.config.smtp_host.is_empty() {
            warn!(subject, "alerts disabled, logging only: {body}");
            return Ok(());
        }

        let email = Message::builder()
            .from(self.config.from_address.parse()?)
            .to(self.config.admin_address.parse()?)
            .subject(subject)
            .body(body.to_string())?;

        let creds = Credentials::new(
            self.config.smtp_username.clone(),
            self.config.smtp_password.clone(),
        );
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.config.smtp_host)?
            .port(self.config.smtp_port)
            .credentials(creds)
            .build();

        transport.send(email).await?;
        info!(subject, to = %self.config.admin_address, "alert sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_notifier_is_silent() {
        let notifier = AdminNotifier::new(AlertConfig::default());
        // Must not error or attempt a connection.
        notifier.quota_exhausted(0).await;
    }

    #[tokio::test]
    async fn test_enabled_without_host_is_silent() {
        let notifier = AdminNotifier::new(AlertConfig {
            enabled: true,
            ..AlertConfig::default()
        });
        notifier.quota_exhausted(17).await;
    }
}
