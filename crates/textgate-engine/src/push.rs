//! Reply pusher — delivers text back into the portal.
//!
//! Two flows: replying in an existing thread (inbound SMS answers,
//! interpreter and dispatcher notices) and composing a brand-new
//! message addressed by the recipient's name (the welcome mail after
//! an accepted invitation). Both go through the rendered-submission
//! layer because the portal's send pages need JavaScript to submit.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use textgate_core::config::{PortalConfig, SchedulerConfig};
use textgate_core::error::{Error, Result};
use textgate_core::model::Bot;
use textgate_core::Store;
use textgate_portal::session::SessionCache;
use textgate_portal::splash::SplashClient;

use crate::ReplyPort;

const MODULE_NAME: &str = "push_email";

pub struct ReplyPusher {
    store: Arc<Store>,
    sessions: Arc<SessionCache>,
    splash: Arc<SplashClient>,
    portal: PortalConfig,
    max_retries: u32,
}

impl ReplyPusher {
    pub fn new(
        store: Arc<Store>,
        sessions: Arc<SessionCache>,
        splash: Arc<SplashClient>,
        portal: PortalConfig,
        scheduler: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            sessions,
            splash,
            portal,
            max_retries: scheduler.reply_max_retries.max(1),
        }
    }

    /// Push every unprocessed inbound SMS of this bot back into its
    /// originating portal thread.
    pub async fn run(&self, bot: &Bot) -> Result<()> {
        let inbound = self.store.unprocessed_inbound_sms(bot.id)?;
        if inbound.is_empty() {
            return Ok(());
        }
        info!(bot_id = bot.id, count = inbound.len(), "pushing sms replies");

        for sms in inbound {
            let Some(email) = self.store.get_email(sms.email_id)? else {
                warn!(sms_id = sms.id, "inbound sms without originating email");
                continue;
            };

            match self.submit_reply(bot, &email.message_id, &sms.message).await {
                Ok(()) => {
                    self.store.mark_sms_processed(sms.id)?;
                    self.store.record_processed(
                        bot.id,
                        MODULE_NAME,
                        sms.text_id.as_deref().unwrap_or(&email.message_id),
                        "replied",
                    )?;
                }
                Err(e) => {
                    // Left unprocessed; retried on the next tick.
                    warn!(sms_id = sms.id, error = %e, "reply push failed");
                }
            }
        }
        Ok(())
    }

    /// Submit one reply through the rendered-submission layer, with
    /// bounded retries on unconfirmed submissions.
    async fn submit_reply(&self, bot: &Bot, portal_message_id: &str, content: &str) -> Result<()> {
        let session = self.sessions.get_session(bot).await?;
        let cookies = session.cookie_pairs()?;
        let reply_url = self.portal.reply_url(portal_message_id);

        for attempt in 1..=self.max_retries {
            match self
                .splash
                .send_reply(&self.portal, &cookies, &reply_url, content)
                .await
            {
                Ok(result) if result.element_found => {
                    info!(portal_message_id, attempt, "reply confirmed");
                    return Ok(());
                }
                Ok(result) => {
                    warn!(
                        portal_message_id,
                        attempt,
                        message = result.message.as_deref().unwrap_or(""),
                        "reply not confirmed"
                    );
                }
                Err(e) => {
                    warn!(portal_message_id, attempt, error = %e, "reply submission failed");
                }
            }
        }

        Err(Error::Transient(format!(
            "reply to {portal_message_id} not confirmed after {} attempts",
            self.max_retries
        )))
    }

    /// Compose a brand-new message to a recipient found by name.
    /// Used for the welcome mail after an accepted invitation.
    pub async fn send_new_message(&self, bot: &Bot, pic_name: &str, content: &str) -> Result<()> {
        let session = self.sessions.get_session(bot).await?;
        let cookies = session.cookie_pairs()?;
        let search_name = transform_name(pic_name);

        for attempt in 1..=self.max_retries {
            match self
                .splash
                .send_new_message(&self.portal, &cookies, &search_name, content)
                .await
            {
                Ok(result) if result.element_found => {
                    info!(pic_name, attempt, "new message confirmed");
                    return Ok(());
                }
                Ok(result) => {
                    warn!(
                        pic_name,
                        attempt,
                        message = result.message.as_deref().unwrap_or(""),
                        "new message not confirmed"
                    );
                }
                Err(e) => {
                    warn!(pic_name, attempt, error = %e, "new message submission failed");
                }
            }
        }

        Err(Error::Transient(format!(
            "new message to {pic_name} not confirmed after {} attempts",
            self.max_retries
        )))
    }
}

#[async_trait]
impl ReplyPort for ReplyPusher {
    async fn send_reply(&self, bot: &Bot, portal_message_id: &str, content: &str) -> Result<()> {
        self.submit_reply(bot, portal_message_id, content).await
    }
}

/// The portal's recipient search wants `"Last First Middle"` while the
/// invitation email carries `"First Middle Last"`.
pub fn transform_name(name: &str) -> String {
    let tokens: Vec<&str> = name.split_whitespace().collect();
    match tokens.split_last() {
        Some((last, rest)) if !rest.is_empty() => {
            let mut out = vec![*last];
            out.extend(rest);
            out.join(" ")
        }
        _ => name.trim().to_string(),
    }
}
