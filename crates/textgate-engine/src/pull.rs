//! Inbox puller — walks the bot's portal inbox and persists new
//! messages.
//!
//! The inbox page yields a viewstate and row list; each row is opened
//! with an AJAX postback and the resulting update-panel slice parsed
//! into from/date/subject/body. Users are created on first sighting
//! from the `"Display Name (pic_number)"` sender field; duplicates on
//! `(bot, portal message id)` are dropped. After persistence the
//! command interpreter takes its pass over the new mail.

use std::sync::Arc;

use tracing::{debug, info, warn};

use textgate_core::config::PortalConfig;
use textgate_core::error::{Error, Result};
use textgate_core::model::{Bot, NewEmail};
use textgate_core::Store;
use textgate_portal::inbox::{
    extract_update_panel, parse_inbox, parse_message_detail, row_event_data, AJAX_HEADERS,
};
use textgate_portal::session::SessionCache;

use crate::commands::CommandInterpreter;

const MODULE_NAME: &str = "pull_email";

/// Row cap when running in test mode.
const TEST_MODE_ROW_LIMIT: usize = 3;

/// Split `"Display Name (pic_number)"` into its halves.
pub fn parse_from_field(from: &str) -> Option<(String, String)> {
    let (name, pic) = from.rsplit_once(" (")?;
    let pic = pic.strip_suffix(')')?;
    if name.trim().is_empty() || pic.trim().is_empty() {
        return None;
    }
    Some((name.trim().to_string(), pic.trim().to_string()))
}

pub struct InboxPuller {
    store: Arc<Store>,
    sessions: Arc<SessionCache>,
    interpreter: Arc<CommandInterpreter>,
    portal: PortalConfig,
    test_mode: bool,
}

impl InboxPuller {
    pub fn new(
        store: Arc<Store>,
        sessions: Arc<SessionCache>,
        interpreter: Arc<CommandInterpreter>,
        portal: PortalConfig,
        test_mode: bool,
    ) -> Self {
        Self {
            store,
            sessions,
            interpreter,
            portal,
            test_mode,
        }
    }

    /// One pull pass: fetch the inbox, persist new rows, then run the
    /// command interpreter over the bot's unprocessed mail.
    pub async fn run(&self, bot: &Bot) -> Result<usize> {
        let session = self.sessions.get_session(bot).await?;
        let inbox_url = self.portal.inbox_url();

        let html = match session.get(&inbox_url).await {
            Ok(html) => html,
            Err(Error::SessionExpired) => {
                self.sessions.invalidate(bot.id).await;
                return Err(Error::SessionExpired);
            }
            Err(e) => return Err(e),
        };

        let (state, rows) = parse_inbox(&html)?;
        info!(bot_id = bot.id, rows = rows.len(), "inbox fetched");

        let limit = if self.test_mode {
            TEST_MODE_ROW_LIMIT
        } else {
            rows.len()
        };

        let mut saved = 0;
        for row in rows.iter().take(limit) {
            if self.store.email_exists(bot.id, &row.message_id)? {
                debug!(message_id = %row.message_id, "already pulled, skipping");
                continue;
            }

            // Per-item failures skip the row, not the batch.
            match self.pull_row(bot, &session, &inbox_url, &state, row.index, &row.message_id)
                .await
            {
                Ok(true) => saved += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        bot_id = bot.id,
                        message_id = %row.message_id,
                        error = %e,
                        "failed to pull inbox row"
                    );
                }
            }
        }
        info!(bot_id = bot.id, saved, "inbox pull finished");

        self.interpreter.run(bot).await?;
        Ok(saved)
    }

    async fn pull_row(
        &self,
        bot: &Bot,
        session: &textgate_portal::session::PortalSession,
        inbox_url: &str,
        state: &textgate_portal::forms::PortalFormState,
        index: usize,
        message_id: &str,
    ) -> Result<bool> {
        let data = row_event_data(state, index)?;
        let mut headers: Vec<(&str, &str)> = AJAX_HEADERS.to_vec();
        headers.push(("Referer", inbox_url));

        let response = session.post_form(inbox_url, &data, &headers).await?;
        let panel = extract_update_panel(&response).ok_or_else(|| {
            Error::Protocol(format!("no update panel in response for row {index}"))
        })?;
        let detail = parse_message_detail(&panel)?;

        let Some((display_name, pic_number)) = parse_from_field(&detail.from) else {
            return Err(Error::Protocol(format!(
                "unparseable sender field '{}'",
                detail.from
            )));
        };

        let (user, _) = self.store.get_or_create_user(&pic_number, &display_name)?;
        let stored = self.store.insert_email(&NewEmail {
            bot_id: bot.id,
            user_id: user.id,
            message_id: message_id.to_string(),
            sent_at: detail.date.clone(),
            subject: detail.subject.clone(),
            body: detail.body.clone(),
        })?;

        match stored {
            Some(email) => {
                self.store
                    .record_processed(bot.id, MODULE_NAME, &email.message_id, "saved")?;
                self.store.set_last_seen_message_id(bot.id, &email.message_id)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
