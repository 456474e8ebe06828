//! Invitation acceptor — turns mailbox invites into approved portal
//! contacts.
//!
//! Per bot tick: search the bot's mailbox for invitation emails
//! (walked newest first), collect `code → (name, message)` with a
//! duplicated code collapsing to its oldest sighting, then drive the
//! pending-contact page through the rendered-submission layer for each
//! code. Once a script run reports the code consumed, the email is
//! deleted regardless of confirmation; one failing code never blocks
//! the others.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use textgate_core::config::{MailboxConfig, PortalConfig, SchedulerConfig};
use textgate_core::error::Result;
use textgate_core::model::Bot;
use textgate_core::Store;
use textgate_mailbox::{invite_from_raw, Mailbox};
use textgate_portal::session::{PortalSession, SessionCache};
use textgate_portal::splash::SplashClient;

const MODULE_NAME: &str = "accept_invite";

/// An invitation that made it all the way through acceptance; the
/// scheduler follows up with a welcome mail.
#[derive(Clone, Debug, PartialEq)]
pub struct AcceptedInvite {
    pub code: String,
    pub full_name: String,
}

pub struct InvitationAcceptor {
    store: Arc<Store>,
    sessions: Arc<SessionCache>,
    splash: Arc<SplashClient>,
    portal: PortalConfig,
    mailbox: MailboxConfig,
    max_retries: u32,
}

impl InvitationAcceptor {
    pub fn new(
        store: Arc<Store>,
        sessions: Arc<SessionCache>,
        splash: Arc<SplashClient>,
        portal: PortalConfig,
        mailbox: MailboxConfig,
        scheduler: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            sessions,
            splash,
            portal,
            mailbox,
            max_retries: scheduler.accept_max_retries.max(1),
        }
    }

    /// Accept pending invitations found in the bot's own mailbox.
    pub async fn run(&self, bot: &Bot) -> Result<Vec<AcceptedInvite>> {
        let session = self.sessions.get_session(bot).await?;
        self.accept_from_mailbox(
            Some(bot.id),
            &session,
            &bot.imap_host,
            &bot.imap_username,
            &bot.imap_password,
        )
        .await
    }

    /// Accept invitations landing in the shared operator mailbox,
    /// using the alternate portal login. No-op unless both are
    /// configured.
    pub async fn run_for_operator(&self) -> Result<Vec<AcceptedInvite>> {
        if !self.mailbox.has_operator_mailbox() || self.portal.alternate_username.is_empty() {
            return Ok(Vec::new());
        }
        let session = self
            .sessions
            .get_operator_session(
                &self.portal.alternate_username,
                &self.portal.alternate_password,
            )
            .await?;
        let host = self.mailbox.operator_host.clone();
        let username = self.mailbox.operator_username.clone();
        let password = self.mailbox.operator_password.clone();
        self.accept_from_mailbox(None, &session, &host, &username, &password)
            .await
    }

    async fn accept_from_mailbox(
        &self,
        bot_id: Option<i64>,
        session: &PortalSession,
        host: &str,
        username: &str,
        password: &str,
    ) -> Result<Vec<AcceptedInvite>> {
        let mut mailbox = Mailbox::open(host, username, password).await?;

        let ids = mailbox
            .search_invites(
                self.mailbox.search_days,
                &self.mailbox.invite_subject,
                &self.mailbox.invite_subject_fallback,
            )
            .await?;

        // code → (full name, message carrying it). Ids arrive newest
        // first and every sighting overwrites, so a duplicated code
        // ends up keyed to its oldest email.
        let mut invites: HashMap<String, (String, u32)> = HashMap::new();
        for seqnum in ids {
            let raw = match mailbox.fetch(seqnum).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(seqnum, error = %e, "failed to fetch invite candidate");
                    continue;
                }
            };
            match invite_from_raw(&raw) {
                Ok(Some(invite)) => {
                    invites.insert(invite.code, (invite.full_name, seqnum));
                }
                Ok(None) => {}
                Err(e) => warn!(seqnum, error = %e, "unparseable invite candidate"),
            }
        }

        if invites.is_empty() {
            info!(host, "no new invites found");
            mailbox.close().await;
            return Ok(Vec::new());
        }

        let cookies = session.cookie_pairs()?;
        let mut accepted = Vec::new();

        for (code, (full_name, seqnum)) in invites {
            let mut confirmed = false;

            for attempt in 1..=self.max_retries {
                match self
                    .splash
                    .accept_invite(&self.portal, &cookies, &code)
                    .await
                {
                    Ok(result) => {
                        // Once the portal consumed the code, the email
                        // must go, whatever the confirmation said.
                        if result.processed() {
                            if let Err(e) = mailbox.delete(seqnum).await {
                                warn!(code = %code, error = %e, "failed to delete invite email");
                            }
                        }
                        if result.element_found {
                            confirmed = true;
                            break;
                        }
                        warn!(
                            code = %code,
                            attempt,
                            error = result.error_message.as_deref().unwrap_or(""),
                            "invite acceptance not confirmed"
                        );
                        if result.processed() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(code = %code, attempt, error = %e, "invite submission failed");
                    }
                }
            }

            if let Some(bot_id) = bot_id {
                self.store.record_processed(
                    bot_id,
                    MODULE_NAME,
                    &code,
                    if confirmed { "accepted" } else { "failed" },
                )?;
            }
            if confirmed {
                info!(code = %code, full_name = %full_name, "invitation accepted");
                accepted.push(AcceptedInvite { code, full_name });
            }
        }

        mailbox.close().await;
        Ok(accepted)
    }
}
