//! Email command interpreter — contact management driven by subject
//! lines.
//!
//! Subjects classify into add/update/remove/list commands. Anything
//! that is only a phone number or contains the word "text" belongs to
//! the SMS dispatcher and is left alone; anything neither path claims
//! gets an instructional reply so no email ever lingers unprocessed.

use std::sync::Arc;

use regex::Regex;
use tracing::{info, warn};

use textgate_core::error::Result;
use textgate_core::model::{Bot, ContactDetail, EmailMessage, User};
use textgate_core::templates::{format_sms_status, RenderArgs, TemplateEngine};
use textgate_core::{phone, Store};

use crate::ReplyPort;

/// Minimum similarity for a fuzzy command match.
const SIMILARITY_THRESHOLD: f64 = 0.90;

/// How many recent messages the status grid shows.
const STATUS_GRID_ROWS: u32 = 20;

const MODULE_NAME: &str = "contact_management";

// ─────────────────────────────────────────────
// Classification
// ─────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    AddEmail,
    AddNumber,
    UpdateEmail,
    UpdateNumber,
    Remove,
    List,
}

const COMMANDS: &[(Command, &str)] = &[
    (Command::AddEmail, "Add Contact Email"),
    (Command::AddNumber, "Add Contact Number"),
    (Command::UpdateEmail, "Update Contact Email"),
    (Command::UpdateNumber, "Update Contact Number"),
    (Command::Remove, "Remove Contact"),
    (Command::List, "Contact List"),
];

fn email_regex() -> Regex {
    Regex::new(r"^[a-zA-Z0-9_.+-]+@[a-zA-Z0-9-]+\.[a-zA-Z0-9-.]+$").unwrap()
}

/// Match the subject's leading words against the command set, fuzzily.
pub fn classify(subject: &str) -> Option<Command> {
    let words: Vec<String> = subject
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect();
    if words.is_empty() {
        return None;
    }

    let mut best: Option<(Command, f64)> = None;
    for (command, canonical) in COMMANDS {
        let canonical_lower = canonical.to_lowercase();
        let word_count = canonical_lower.split_whitespace().count();
        if words.len() < word_count {
            continue;
        }
        let prefix = words[..word_count].join(" ");
        let score = strsim::jaro_winkler(&prefix, &canonical_lower);
        if score >= SIMILARITY_THRESHOLD
            && best.map(|(_, s)| score > s).unwrap_or(true)
        {
            best = Some((*command, score));
        }
    }
    best.map(|(command, _)| command)
}

/// A classified subject, split into command, contact name, and the
/// trailing detail (phone or email) when present.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedCommand {
    pub command: Command,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Tokenize the subject: leading tokens are the command, the trailing
/// token(s) the detail, the middle the contact name.
pub fn parse_subject(subject: &str) -> Option<ParsedCommand> {
    let command = classify(subject)?;
    let canonical_len = COMMANDS
        .iter()
        .find(|(c, _)| *c == command)
        .map(|(_, text)| text.split_whitespace().count())
        .unwrap_or(0);

    let tokens: Vec<&str> = subject.split_whitespace().collect();
    let mut rest: Vec<&str> = tokens[canonical_len.min(tokens.len())..].to_vec();

    let email_re = email_regex();
    let mut email = None;
    let mut phone = None;

    // Trailing email token.
    if let Some(last) = rest.last() {
        if email_re.is_match(last) {
            email = Some(last.to_string());
            rest.pop();
        }
    }

    // Trailing phone, possibly spread over several digit-ish tokens.
    if email.is_none() {
        let is_digitish = |t: &str| {
            !t.is_empty()
                && t.chars()
                    .all(|c| c.is_ascii_digit() || matches!(c, '-' | '.' | '(' | ')' | '+'))
                && t.chars().any(|c| c.is_ascii_digit())
        };
        let mut tail = Vec::new();
        while rest.last().map(|t| is_digitish(t)).unwrap_or(false) {
            tail.insert(0, rest.pop().unwrap_or_default());
        }
        if !tail.is_empty() {
            phone = Some(tail.join(""));
        }
    }

    Some(ParsedCommand {
        command,
        name: rest.join(" "),
        email,
        phone,
    })
}

// ─────────────────────────────────────────────
// Interpreter
// ─────────────────────────────────────────────

/// Outcome of one interpreted email, ready for rendering.
struct ActionOutcome {
    success: bool,
    template_key: &'static str,
    new_contacts: Vec<String>,
    failed_contacts: Vec<String>,
}

pub struct CommandInterpreter {
    store: Arc<Store>,
    templates: Arc<TemplateEngine>,
    reply: Arc<dyn ReplyPort>,
}

impl CommandInterpreter {
    pub fn new(store: Arc<Store>, templates: Arc<TemplateEngine>, reply: Arc<dyn ReplyPort>) -> Self {
        Self {
            store,
            templates,
            reply,
        }
    }

    /// Interpret every unprocessed email for the bot. Emails reserved
    /// for the SMS dispatcher are skipped untouched; everything else
    /// ends the pass processed with a reply enqueued.
    pub async fn run(&self, bot: &Bot) -> Result<()> {
        let emails = self.store.unprocessed_emails(bot.id)?;
        for email in emails {
            if self.is_reserved_for_dispatcher(&email.subject) {
                info!(
                    bot_id = bot.id,
                    subject = %email.subject,
                    "subject reserved for sms dispatch, skipping"
                );
                continue;
            }

            if let Err(e) = self.process_email(bot, &email).await {
                warn!(
                    bot_id = bot.id,
                    message_id = %email.message_id,
                    error = %e,
                    "failed to interpret email"
                );
            }
        }
        Ok(())
    }

    /// The dispatcher owns subjects that are a bare phone number,
    /// contain the word "text", or carry a dialable number.
    fn is_reserved_for_dispatcher(&self, subject: &str) -> bool {
        if subject.to_lowercase().contains("text") {
            return true;
        }
        if phone::is_only_phone(subject) {
            return true;
        }
        // A subject with a dialable number but no command is a
        // free-form "text by number" request.
        classify(subject).is_none() && phone::extract_subject_number(subject).is_some()
    }

    async fn process_email(&self, bot: &Bot, email: &EmailMessage) -> Result<()> {
        let Some(user) = self.store.get_user(email.user_id)? else {
            warn!(message_id = %email.message_id, "email without user, marking processed");
            self.store.mark_email_processed(email.id)?;
            return Ok(());
        };

        let outcome = match parse_subject(&email.subject) {
            Some(parsed) => self.execute(&user, &parsed)?,
            None => ActionOutcome {
                success: false,
                template_key: "INSTRUCTIONAL_ERROR",
                new_contacts: Vec::new(),
                failed_contacts: Vec::new(),
            },
        };

        // Processed before the reply goes out; a reply failure must
        // not re-run the action on the next tick.
        self.store.mark_email_processed(email.id)?;
        self.store.record_processed(
            bot.id,
            MODULE_NAME,
            &email.message_id,
            if outcome.success { "processed" } else { "failed" },
        )?;

        self.respond(bot, email, &user, &outcome).await
    }

    fn execute(&self, user: &User, parsed: &ParsedCommand) -> Result<ActionOutcome> {
        let mut failed = Vec::new();
        let mut new_contacts = Vec::new();

        let detail = match parsed.command {
            Command::AddEmail | Command::UpdateEmail => match &parsed.email {
                Some(email) => Some(ContactDetail::Email(email.clone())),
                None => {
                    failed.push(format!("{}: Invalid email address.", parsed.name));
                    None
                }
            },
            Command::AddNumber | Command::UpdateNumber => {
                match parsed.phone.as_deref().and_then(phone::canonicalize) {
                    Some(number) => Some(ContactDetail::Phone(number)),
                    None => {
                        failed.push(format!("{}: Invalid phone number.", parsed.name));
                        None
                    }
                }
            }
            Command::Remove | Command::List => None,
        };

        match parsed.command {
            Command::AddEmail | Command::AddNumber => {
                if parsed.name.is_empty() {
                    failed.push("Missing contact name.".to_string());
                }
                let Some(detail) = detail else {
                    return Ok(ActionOutcome {
                        success: false,
                        template_key: "FAMILY_CONTACT_UPDATE",
                        new_contacts,
                        failed_contacts: failed,
                    });
                };
                if !failed.is_empty() {
                    return Ok(ActionOutcome {
                        success: false,
                        template_key: "FAMILY_CONTACT_UPDATE",
                        new_contacts,
                        failed_contacts: failed,
                    });
                }
                let (_, created) = self.store.upsert_contact(user.id, &parsed.name, &detail)?;
                if created {
                    new_contacts.push(parsed.name.clone());
                }
                Ok(ActionOutcome {
                    success: true,
                    template_key: "FAMILY_CONTACT_UPDATE",
                    new_contacts,
                    failed_contacts: failed,
                })
            }
            Command::UpdateEmail | Command::UpdateNumber => {
                if self
                    .store
                    .find_contact_by_name(user.id, &parsed.name)?
                    .is_none()
                {
                    return Ok(ActionOutcome {
                        success: false,
                        template_key: "CONTACT_NOT_FOUND",
                        new_contacts,
                        failed_contacts: failed,
                    });
                }
                let Some(detail) = detail else {
                    return Ok(ActionOutcome {
                        success: false,
                        template_key: "FAMILY_CONTACT_UPDATE",
                        new_contacts,
                        failed_contacts: failed,
                    });
                };
                self.store.upsert_contact(user.id, &parsed.name, &detail)?;
                Ok(ActionOutcome {
                    success: true,
                    template_key: "FAMILY_CONTACT_UPDATE",
                    new_contacts,
                    failed_contacts: failed,
                })
            }
            Command::Remove => {
                match self.store.find_contact_by_name(user.id, &parsed.name)? {
                    Some(contact) => {
                        self.store.delete_contact(contact.id)?;
                        Ok(ActionOutcome {
                            success: true,
                            template_key: "FAMILY_CONTACT_UPDATE",
                            new_contacts,
                            failed_contacts: failed,
                        })
                    }
                    None => Ok(ActionOutcome {
                        success: false,
                        template_key: "CONTACT_NOT_FOUND",
                        new_contacts,
                        failed_contacts: failed,
                    }),
                }
            }
            Command::List => Ok(ActionOutcome {
                success: true,
                template_key: "CONTACT_LIST",
                new_contacts,
                failed_contacts: failed,
            }),
        }
    }

    async fn respond(
        &self,
        bot: &Bot,
        email: &EmailMessage,
        user: &User,
        outcome: &ActionOutcome,
    ) -> Result<()> {
        let contacts = self.store.list_contacts(user.id)?;
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

        let bot_accounts = self
            .store
            .list_bots()?
            .iter()
            .map(|b| b.portal_username.clone())
            .collect();

        let previous_text_messages_status = if outcome.template_key == "INSTRUCTIONAL_ERROR" {
            format_sms_status(&self.store.recent_sms_for_user(user.id, STATUS_GRID_ROWS)?)
        } else {
            String::new()
        };

        let args = RenderArgs {
            first_name: user.display_name.clone(),
            bot_accounts,
            existing_contacts,
            new_contacts: outcome.new_contacts.clone(),
            failed_contacts: outcome.failed_contacts.clone(),
            command: email.subject.clone(),
            detail: format!(" ({})", email.subject),
            previous_text_messages_status,
            ..Default::default()
        };

        let rendered = self.templates.render(outcome.template_key, &args)?;
        info!(
            bot_id = bot.id,
            message_id = %email.message_id,
            template = outcome.template_key,
            success = outcome.success,
            "sending interpreter reply"
        );
        self.reply.send_reply(bot, &email.message_id, &rendered).await
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use textgate_core::model::{BotSpec, NewEmail};

    // ── Capturing reply port ──

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
        interpreter: CommandInterpreter,
        bot: Bot,
        user: User,
    }

    fn fixture() -> Fixture {
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
        let port = Arc::new(CapturePort::default());
        let templates = Arc::new(TemplateEngine::new(store.clone()));
        let interpreter =
            CommandInterpreter::new(store.clone(), templates, port.clone());
        Fixture {
            store,
            port,
            interpreter,
            bot,
            user,
        }
    }

    fn add_email(f: &Fixture, message_id: &str, subject: &str) -> EmailMessage {
        f.store
            .insert_email(&NewEmail {
                bot_id: f.bot.id,
                user_id: f.user.id,
                message_id: message_id.to_string(),
                sent_at: "7/10/2024 3:15:00 PM".to_string(),
                subject: subject.to_string(),
                body: String::new(),
            })
            .unwrap()
            .unwrap()
    }

    // ── Classification ──

    #[test]
    fn test_classify_exact() {
        assert_eq!(classify("Add Contact Number Daffy 5555555555"), Some(Command::AddNumber));
        assert_eq!(classify("add contact email John j@x.com"), Some(Command::AddEmail));
        assert_eq!(classify("Remove Contact Daffy"), Some(Command::Remove));
        assert_eq!(classify("Contact List"), Some(Command::List));
        assert_eq!(classify("Update Contact Number Daffy 5555555555"), Some(Command::UpdateNumber));
    }

    #[test]
    fn test_classify_fuzzy() {
        assert_eq!(classify("Add Contct Number Daffy 5555555555"), Some(Command::AddNumber));
        assert_eq!(classify("Remve Contact Daffy"), Some(Command::Remove));
    }

    #[test]
    fn test_classify_rejects_noise() {
        assert_eq!(classify("4024312303"), None);
        assert_eq!(classify("hello there"), None);
        assert_eq!(classify(""), None);
    }

    // ── Subject parsing ──

    #[test]
    fn test_parse_add_number() {
        let parsed = parse_subject("Add Contact Number Daffy 555-555-5555").unwrap();
        assert_eq!(parsed.command, Command::AddNumber);
        assert_eq!(parsed.name, "Daffy");
        assert_eq!(parsed.phone.as_deref(), Some("555-555-5555"));
        assert_eq!(parsed.email, None);
    }

    #[test]
    fn test_parse_add_number_spaced_digits() {
        let parsed = parse_subject("Add Contact Number Daffy Duck 555 555 5555").unwrap();
        assert_eq!(parsed.name, "Daffy Duck");
        assert_eq!(parsed.phone.as_deref(), Some("5555555555"));
    }

    #[test]
    fn test_parse_add_email() {
        let parsed = parse_subject("Add Contact Email John Doe john@example.com").unwrap();
        assert_eq!(parsed.command, Command::AddEmail);
        assert_eq!(parsed.name, "John Doe");
        assert_eq!(parsed.email.as_deref(), Some("john@example.com"));
    }

    #[test]
    fn test_parse_remove() {
        let parsed = parse_subject("Remove Contact Daffy").unwrap();
        assert_eq!(parsed.command, Command::Remove);
        assert_eq!(parsed.name, "Daffy");
    }

    // ── Scenario: add contact by phone ──

    #[tokio::test]
    async fn test_add_contact_by_phone() {
        let f = fixture();
        add_email(&f, "m-1", "Add Contact Number Daffy 555-555-5555");

        f.interpreter.run(&f.bot).await.unwrap();

        let contact = f
            .store
            .find_contact_by_name(f.user.id, "Daffy")
            .unwrap()
            .unwrap();
        assert_eq!(contact.phone_number.as_deref(), Some("5555555555"));

        let email = f.store.get_email(1).unwrap().unwrap();
        assert!(email.is_processed);

        let sent = f.port.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "m-1");
        assert!(sent[0].1.contains("New contacts: Daffy"));
        assert!(sent[0].1.contains("COOK ZACHARY"));
    }

    // ── Other actions ──

    #[tokio::test]
    async fn test_update_missing_contact_not_found() {
        let f = fixture();
        add_email(&f, "m-1", "Update Contact Number Daffy 5555555555");

        f.interpreter.run(&f.bot).await.unwrap();

        let sent = f.port.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("couldn't find the contact"));
        assert!(f
            .store
            .find_contact_by_name(f.user.id, "Daffy")
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_remove_contact() {
        let f = fixture();
        f.store
            .upsert_contact(f.user.id, "Daffy", &ContactDetail::Phone("5555555555".into()))
            .unwrap();
        add_email(&f, "m-1", "Remove Contact Daffy");

        f.interpreter.run(&f.bot).await.unwrap();

        assert!(f
            .store
            .find_contact_by_name(f.user.id, "Daffy")
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_contact_list_reply_contains_contacts() {
        let f = fixture();
        f.store
            .upsert_contact(f.user.id, "Daffy", &ContactDetail::Phone("5555555555".into()))
            .unwrap();
        add_email(&f, "m-1", "Contact List");

        f.interpreter.run(&f.bot).await.unwrap();

        let sent = f.port.sent.lock().unwrap();
        assert!(sent[0].1.contains("Daffy: : 5555555555"));
    }

    #[tokio::test]
    async fn test_invalid_phone_reported_as_failed_contact() {
        let f = fixture();
        add_email(&f, "m-1", "Add Contact Number Daffy 123");

        f.interpreter.run(&f.bot).await.unwrap();

        let sent = f.port.sent.lock().unwrap();
        assert!(sent[0].1.contains("Invalid phone number."));
        assert!(f
            .store
            .find_contact_by_name(f.user.id, "Daffy")
            .unwrap()
            .is_none());
    }

    // ── Skip rules ──

    #[tokio::test]
    async fn test_phone_only_subject_left_for_dispatcher() {
        let f = fixture();
        add_email(&f, "m-1", "4024312303");

        f.interpreter.run(&f.bot).await.unwrap();

        assert!(!f.store.get_email(1).unwrap().unwrap().is_processed);
        assert!(f.port.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_text_subject_left_for_dispatcher() {
        let f = fixture();
        add_email(&f, "m-1", "Text Daffy");

        f.interpreter.run(&f.bot).await.unwrap();

        assert!(!f.store.get_email(1).unwrap().unwrap().is_processed);
        assert!(f.port.sent.lock().unwrap().is_empty());
    }

    // ── Unknown subject path ──

    #[tokio::test]
    async fn test_unknown_subject_gets_instructional_error() {
        let f = fixture();
        add_email(&f, "m-1", "what is going on");

        f.interpreter.run(&f.bot).await.unwrap();

        assert!(f.store.get_email(1).unwrap().unwrap().is_processed);
        let sent = f.port.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("couldn't understand"));
        assert!(sent[0].1.contains("No previous messages found."));
    }

    // ── Idempotence ──

    #[tokio::test]
    async fn test_rerun_is_noop_for_processed_email() {
        let f = fixture();
        add_email(&f, "m-1", "Add Contact Number Daffy 5555555555");

        f.interpreter.run(&f.bot).await.unwrap();
        f.interpreter.run(&f.bot).await.unwrap();

        assert_eq!(f.port.sent.lock().unwrap().len(), 1);
        assert_eq!(
            f.store.list_processed(f.bot.id, MODULE_NAME).unwrap().len(),
            1
        );
    }
}
