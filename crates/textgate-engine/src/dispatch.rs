//! SMS dispatcher — turns unprocessed portal emails into outbound
//! texts and walks each send through the delivery state machine.
//!
//! A subject resolves to a destination either as a bare ten-digit
//! number or as "Text <contact name>" against the user's contact list.
//! Dispatch is gated on the gateway quota; sends poll for delivery
//! with a bounded backoff and allow a single resend before giving up.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use textgate_core::config::{SmsConfig, WebhookConfig};
use textgate_core::error::{Error, Result};
use textgate_core::model::{
    Bot, Contact, EmailMessage, NewSms, SmsDirection, SmsStatus, User,
};
use textgate_core::templates::{RenderArgs, TemplateEngine};
use textgate_core::{phone, Store};
use textgate_sms::gateway::DeliveryStatus;
use textgate_sms::{token, SmsGateway};

use crate::notify::AdminNotifier;
use crate::ReplyPort;

const MODULE_NAME: &str = "send_sms";

/// Where a subject pointed us.
enum Target {
    Number(String),
    Named(Contact),
    /// "Text <name>" with no matching contact.
    UnknownName(String),
    /// Not an SMS subject at all.
    NotOurs,
}

pub struct SmsDispatcher {
    store: Arc<Store>,
    gateway: Arc<SmsGateway>,
    templates: Arc<TemplateEngine>,
    reply: Arc<dyn ReplyPort>,
    notifier: Arc<AdminNotifier>,
    sms: SmsConfig,
    webhook: WebhookConfig,
}

impl SmsDispatcher {
    pub fn new(
        store: Arc<Store>,
        gateway: Arc<SmsGateway>,
        templates: Arc<TemplateEngine>,
        reply: Arc<dyn ReplyPort>,
        notifier: Arc<AdminNotifier>,
        sms: SmsConfig,
        webhook: WebhookConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            templates,
            reply,
            notifier,
            sms,
            webhook,
        }
    }

    /// One dispatch pass for a bot.
    pub async fn run(&self, bot: &Bot) -> Result<()> {
        let quota = self.gateway.quota().await?;
        if quota <= self.sms.quota_threshold {
            warn!(quota, threshold = self.sms.quota_threshold, "sms quota exhausted, skipping dispatch");
            self.notifier.quota_exhausted(quota).await;
            return Ok(());
        }
        info!(bot_id = bot.id, quota, "dispatching sms");

        for email in self.store.unprocessed_emails(bot.id)? {
            if let Err(e) = self.dispatch_email(bot, &email).await {
                if e.is_transient() {
                    warn!(
                        bot_id = bot.id,
                        message_id = %email.message_id,
                        error = %e,
                        "transient dispatch failure, will retry next tick"
                    );
                } else {
                    error!(
                        bot_id = bot.id,
                        message_id = %email.message_id,
                        error = %e,
                        "dispatch failed"
                    );
                }
            }
        }
        Ok(())
    }

    fn resolve_target(&self, user: &User, subject: &str) -> Result<Target> {
        if let Some(number) = phone::extract_subject_number(subject) {
            return Ok(Target::Number(number));
        }

        // Same claim rule as the interpreter's skip rule, so every
        // "text"-flavored subject ends up handled by exactly one side.
        if subject.to_lowercase().contains("text") {
            let name = subject
                .split_whitespace()
                .filter(|w| !w.eq_ignore_ascii_case("text"))
                .collect::<Vec<_>>()
                .join(" ");
            if name.is_empty() {
                return Ok(Target::UnknownName(name));
            }
            return match self.store.find_contact_by_name(user.id, &name)? {
                Some(contact) if contact.phone_number.is_some() => Ok(Target::Named(contact)),
                _ => Ok(Target::UnknownName(name)),
            };
        }

        Ok(Target::NotOurs)
    }

    async fn dispatch_email(&self, bot: &Bot, email: &EmailMessage) -> Result<()> {
        let Some(user) = self.store.get_user(email.user_id)? else {
            warn!(message_id = %email.message_id, "email without user, marking processed");
            self.store.mark_email_processed(email.id)?;
            return Ok(());
        };

        let (contact, to_number) = match self.resolve_target(&user, &email.subject)? {
            Target::Number(number) => {
                let contact = match self.store.find_contact_by_phone(user.id, &number)? {
                    Some(contact) => contact,
                    None => {
                        // First text to an unnamed number gets an
                        // auto-created contact.
                        let auto_name = format!("{}_{}", user.user_name, number);
                        let (contact, _) = self.store.upsert_contact(
                            user.id,
                            &auto_name,
                            &textgate_core::model::ContactDetail::Phone(number.clone()),
                        )?;
                        contact
                    }
                };
                (contact, number)
            }
            Target::Named(contact) => {
                let number = contact
                    .phone_number
                    .clone()
                    .ok_or_else(|| Error::Validation("contact without phone".to_string()))?;
                (contact, number)
            }
            Target::UnknownName(name) => {
                info!(bot_id = bot.id, name = %name, "text target not in contacts");
                self.store.mark_email_processed(email.id)?;
                self.store
                    .record_processed(bot.id, MODULE_NAME, &email.message_id, "failed")?;
                self.send_user_notice(bot, email, &user, "CONTACT_NOT_FOUND").await;
                return Ok(());
            }
            Target::NotOurs => return Ok(()),
        };

        let webhook_data = token::sign(
            &format!("{}:{}", bot.id, email.id),
            &self.webhook.signing_secret,
        )?;

        match self
            .gateway
            .send(
                &to_number,
                &email.body,
                &self.sms.reply_webhook_url,
                &webhook_data,
            )
            .await?
        {
            Ok(outcome) => {
                let sms = self.store.insert_sms(&NewSms {
                    bot_id: bot.id,
                    contact_id: contact.id,
                    email_id: email.id,
                    phone_number: to_number.clone(),
                    message: email.body.clone(),
                    text_id: Some(outcome.text_id.clone()),
                    direction: SmsDirection::Outbound,
                    status: SmsStatus::Sent,
                })?;
                self.poll_delivery(bot, email, &user, &contact, sms.id, outcome.text_id, &to_number)
                    .await
            }
            Err(reason) => {
                error!(
                    bot_id = bot.id,
                    message_id = %email.message_id,
                    reason = %reason,
                    "gateway rejected send"
                );
                self.store.insert_sms(&NewSms {
                    bot_id: bot.id,
                    contact_id: contact.id,
                    email_id: email.id,
                    phone_number: to_number,
                    message: email.body.clone(),
                    text_id: None,
                    direction: SmsDirection::Outbound,
                    status: SmsStatus::Failed,
                })?;
                self.store.mark_email_processed(email.id)?;
                self.store
                    .record_processed(bot.id, MODULE_NAME, &email.message_id, "rejected")?;
                Ok(())
            }
        }
    }

    /// Poll for delivery. After the poll budget runs dry once, the
    /// message is resent a single time and the new text id polled with
    /// a fresh budget; a second exhaustion is terminal.
    #[allow(clippy::too_many_arguments)]
    async fn poll_delivery(
        &self,
        bot: &Bot,
        email: &EmailMessage,
        user: &User,
        contact: &Contact,
        mut sms_id: i64,
        mut text_id: String,
        to_number: &str,
    ) -> Result<()> {
        let mut resent = false;

        loop {
            for attempt in 1..=self.sms.max_retries {
                tokio::time::sleep(Duration::from_secs(self.sms.retry_delay_secs)).await;

                match self.gateway.status(&text_id).await {
                    Ok(DeliveryStatus::Delivered) => {
                        self.store.update_sms_status(sms_id, SmsStatus::Delivered)?;
                        self.store.mark_email_processed(email.id)?;
                        self.store.record_processed(
                            bot.id,
                            MODULE_NAME,
                            &email.message_id,
                            "delivered",
                        )?;
                        info!(text_id = %text_id, "sms delivered");
                        return Ok(());
                    }
                    Ok(status) => {
                        warn!(text_id = %text_id, attempt, status = ?status, "sms not delivered yet");
                    }
                    Err(e) => {
                        warn!(text_id = %text_id, attempt, error = %e, "status poll failed");
                    }
                }
            }

            if resent {
                break;
            }
            resent = true;

            info!(text_id = %text_id, "poll budget exhausted, resending once");
            let webhook_data = token::sign(
                &format!("{}:{}", bot.id, email.id),
                &self.webhook.signing_secret,
            )?;
            match self
                .gateway
                .send(
                    to_number,
                    &email.body,
                    &self.sms.reply_webhook_url,
                    &webhook_data,
                )
                .await
            {
                Ok(Ok(outcome)) => {
                    let sms = self.store.insert_sms(&NewSms {
                        bot_id: bot.id,
                        contact_id: contact.id,
                        email_id: email.id,
                        phone_number: to_number.to_string(),
                        message: email.body.clone(),
                        text_id: Some(outcome.text_id.clone()),
                        direction: SmsDirection::Outbound,
                        status: SmsStatus::Sent,
                    })?;
                    sms_id = sms.id;
                    text_id = outcome.text_id;
                }
                Ok(Err(reason)) => {
                    warn!(reason = %reason, "resend rejected by gateway");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "resend transport failure");
                    break;
                }
            }
        }

        // Terminal failure after all retries.
        self.store.update_sms_status(sms_id, SmsStatus::Failed)?;
        self.store.mark_email_processed(email.id)?;
        self.store
            .record_processed(bot.id, MODULE_NAME, &email.message_id, "failed")?;
        error!(text_id = %text_id, to_number, "sms failed after all retries");
        self.send_user_notice(bot, email, user, "TEXT_NOT_SENT_ERROR").await;
        Ok(())
    }

    /// Best-effort templated notice back to the user; failures here
    /// are logged, never fatal to the dispatch pass.
    async fn send_user_notice(&self, bot: &Bot, email: &EmailMessage, user: &User, key: &str) {
        let contacts = self.store.list_contacts(user.id).unwrap_or_default();
        let existing_contacts = contacts
            .iter()
            .map(|c| {
                format!(
                    "{}: {} : {}",
                    c.contact_name,
                    c.email_address.as_deref().unwrap_or(""),
                    c.phone_number.as_deref().unwrap_or(""),
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let args = RenderArgs {
            first_name: user.display_name.clone(),
            existing_contacts,
            command: email.subject.clone(),
            detail: format!(" ({})", email.subject),
            ..Default::default()
        };

        let rendered = match self.templates.render(key, &args) {
            Ok(rendered) => rendered,
            Err(e) => {
                error!(key, error = %e, "failed to render user notice");
                return;
            }
        };
        if let Err(e) = self.reply.send_reply(bot, &email.message_id, &rendered).await {
            error!(key, error = %e, "failed to deliver user notice");
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use textgate_core::config::AlertConfig;
    use textgate_core::model::{BotSpec, ContactDetail, NewEmail};
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct CapturePort {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ReplyPort for CapturePort {
        async fn send_reply(
            &self,
            _bot: &Bot,
            portal_message_id: &str,
            content: &str,
        ) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((portal_message_id.to_string(), content.to_string()));
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<Store>,
        port: Arc<CapturePort>,
        dispatcher: SmsDispatcher,
        bot: Bot,
        user: User,
    }

    async fn fixture(server: &MockServer) -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        TemplateEngine::seed_defaults(&store).unwrap();
        let bot = store
            .upsert_bot(&BotSpec {
                name: "bot-1".into(),
                portal_username: "bot1@example.com".into(),
                portal_password: "pw".into(),
                imap_host: "mail.example.com".into(),
                imap_username: "bot1@example.com".into(),
                imap_password: "pw".into(),
                is_active: true,
            })
            .unwrap();
        let (user, _) = store
            .get_or_create_user("15372010", "COOK ZACHARY")
            .unwrap();

        let sms = SmsConfig {
            gateway_url: server.uri(),
            api_key: "test-key".into(),
            reply_webhook_url: "https://hook.example/sms".into(),
            retry_delay_secs: 0,
            max_retries: 2,
            quota_threshold: 0,
            ..SmsConfig::default()
        };
        let webhook = WebhookConfig {
            signing_secret: "secret".into(),
            ..WebhookConfig::default()
        };
        let port = Arc::new(CapturePort::default());
        let dispatcher = SmsDispatcher::new(
            store.clone(),
            Arc::new(SmsGateway::new(&server.uri(), "test-key").unwrap()),
            Arc::new(TemplateEngine::new(store.clone())),
            port.clone(),
            Arc::new(AdminNotifier::new(AlertConfig::default())),
            sms,
            webhook,
        );

        Fixture {
            store,
            port,
            dispatcher,
            bot,
            user,
        }
    }

    fn add_email(f: &Fixture, message_id: &str, subject: &str, body: &str) -> EmailMessage {
        f.store
            .insert_email(&NewEmail {
                bot_id: f.bot.id,
                user_id: f.user.id,
                message_id: message_id.to_string(),
                sent_at: "7/10/2024 3:15:00 PM".to_string(),
                subject: subject.to_string(),
                body: body.to_string(),
            })
            .unwrap()
            .unwrap()
    }

    async fn mount_quota(server: &MockServer, remaining: i64) {
        Mock::given(method("GET"))
            .and(path("/quota/test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "quotaRemaining": remaining
            })))
            .mount(server)
            .await;
    }

    // ── Scenario: text by number, delivered ──

    #[tokio::test]
    async fn test_text_by_number_delivered() {
        let server = MockServer::start().await;
        mount_quota(&server, 40).await;
        Mock::given(method("POST"))
            .and(path("/text"))
            .and(body_string_contains("phone=4024312303"))
            .and(body_string_contains("message=Hi+bugs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "textId": "txt-1",
                "quotaRemaining": 39
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/status/txt-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "DELIVERED"})))
            .mount(&server)
            .await;

        let f = fixture(&server).await;
        let email = add_email(&f, "m-1", "4024312303", "Hi bugs");

        f.dispatcher.run(&f.bot).await.unwrap();

        let sms = f.store.latest_outbound_by_text_id("txt-1").unwrap().unwrap();
        assert_eq!(sms.status, SmsStatus::Delivered);
        assert_eq!(sms.phone_number, "4024312303");
        assert!(f.store.get_email(email.id).unwrap().unwrap().is_processed);
        // An auto-named contact was created for the bare number.
        assert!(f
            .store
            .find_contact_by_phone(f.user.id, "4024312303")
            .unwrap()
            .is_some());
    }

    // ── Scenario: text by contact name ──

    #[tokio::test]
    async fn test_text_by_contact_name() {
        let server = MockServer::start().await;
        mount_quota(&server, 40).await;
        Mock::given(method("POST"))
            .and(path("/text"))
            .and(body_string_contains("phone=5555555555"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "textId": "txt-2"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/status/txt-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "DELIVERED"})))
            .mount(&server)
            .await;

        let f = fixture(&server).await;
        f.store
            .upsert_contact(f.user.id, "Daffy", &ContactDetail::Phone("5555555555".into()))
            .unwrap();
        add_email(&f, "m-1", "Text Daffy", "Miss you");

        f.dispatcher.run(&f.bot).await.unwrap();

        let sms = f.store.latest_outbound_by_text_id("txt-2").unwrap().unwrap();
        assert_eq!(sms.phone_number, "5555555555");
        assert_eq!(sms.message, "Miss you");
    }

    #[tokio::test]
    async fn test_text_unknown_name_notifies_user() {
        let server = MockServer::start().await;
        mount_quota(&server, 40).await;

        let f = fixture(&server).await;
        let email = add_email(&f, "m-1", "Text Nobody", "hello");

        f.dispatcher.run(&f.bot).await.unwrap();

        assert!(f.store.get_email(email.id).unwrap().unwrap().is_processed);
        let sent = f.port.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("couldn't find the contact"));
    }

    // ── Scenario: quota exhausted ──

    #[tokio::test]
    async fn test_quota_exhausted_skips_dispatch() {
        let server = MockServer::start().await;
        mount_quota(&server, 0).await;

        let f = fixture(&server).await;
        let email = add_email(&f, "m-1", "4024312303", "Hi bugs");

        f.dispatcher.run(&f.bot).await.unwrap();

        // Nothing sent, nothing processed.
        assert!(!f.store.get_email(email.id).unwrap().unwrap().is_processed);
        assert!(f.store.latest_outbound_by_text_id("txt-1").unwrap().is_none());
    }

    // ── Gateway rejection ──

    #[tokio::test]
    async fn test_gateway_reject_marks_failed() {
        let server = MockServer::start().await;
        mount_quota(&server, 40).await;
        Mock::given(method("POST"))
            .and(path("/text"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "error": "number blocked"
            })))
            .mount(&server)
            .await;

        let f = fixture(&server).await;
        let email = add_email(&f, "m-1", "4024312303", "Hi");

        f.dispatcher.run(&f.bot).await.unwrap();

        assert!(f.store.get_email(email.id).unwrap().unwrap().is_processed);
        let rows = f.store.recent_sms_for_user(f.user.id, 20).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0.status, SmsStatus::Failed);
    }

    // ── Retry exhaustion → single resend → terminal failure ──

    #[tokio::test]
    async fn test_undelivered_resends_once_then_fails() {
        let server = MockServer::start().await;
        mount_quota(&server, 40).await;
        Mock::given(method("POST"))
            .and(path("/text"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "textId": "txt-stuck"
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/text"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "textId": "txt-stuck-2"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/status/txt-stuck"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "SENT"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/status/txt-stuck-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "SENT"})))
            .mount(&server)
            .await;

        let f = fixture(&server).await;
        let email = add_email(&f, "m-1", "4024312303", "Hi");

        f.dispatcher.run(&f.bot).await.unwrap();

        // Two sends total (original + one resend), both ended failed
        // from the dispatcher's point of view.
        assert_eq!(
            server
                .received_requests()
                .await
                .unwrap()
                .iter()
                .filter(|r| r.url.path() == "/text")
                .count(),
            2
        );
        assert!(f.store.get_email(email.id).unwrap().unwrap().is_processed);
        let sent = f.port.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("unable to deliver"));
    }

    // ── Non-SMS subjects are ignored ──

    #[tokio::test]
    async fn test_command_subject_not_ours() {
        let server = MockServer::start().await;
        mount_quota(&server, 40).await;

        let f = fixture(&server).await;
        let email = add_email(&f, "m-1", "hello there friend", "body");

        f.dispatcher.run(&f.bot).await.unwrap();

        assert!(!f.store.get_email(email.id).unwrap().unwrap().is_processed);
        assert!(f.port.sent.lock().unwrap().is_empty());
    }
}
