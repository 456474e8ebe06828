//! Response templates — operator-facing reply emails keyed by outcome.
//!
//! Templates live in the store (seeded from the defaults below) and
//! carry `{placeholder}` slots filled from a fixed parameter set.
//! Rendering an unknown key or leaving a placeholder unresolved is an
//! error; silent holes in user-facing mail are worse than a failed tick.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::model::Sms;
use crate::store::Store;

/// Every key the engine renders. Seeding writes all of them; rendering
/// any other key fails.
pub const TEMPLATE_KEYS: &[&str] = &[
    "WELCOME_STATUS",
    "SIGNUP_INSTRUCTIONS",
    "INSTRUCTIONAL_ERROR",
    "FAMILY_CONTACT_UPDATE",
    "MESSAGE_SENT_CONFIRMATION",
    "CONTACT_NOT_FOUND",
    "CONTACT_LIST",
    "TEXT_NOT_SENT_ERROR",
    "SCREENNAME_CONFIRMATION",
    "SCREENNAME_ERROR",
    "LIST_PENPAL_USERS",
    "FAMILY_TEXT_TO_CL",
];

/// Default template texts, seeded with update-or-create semantics so an
/// operator can reword any of them in the database afterwards.
pub const DEFAULT_TEMPLATES: &[(&str, &str)] = &[
    (
        "WELCOME_STATUS",
        "Hello {first_name},\n\n\
         Your account is set up and ready to go. You can now send text \
         messages to your contacts by emailing any of our accounts:\n\
         {bot_accounts}\n\n\
         Reply to this message with a 10-digit phone number in the subject \
         to send your first text.",
    ),
    (
        "SIGNUP_INSTRUCTIONS",
        "Hello {first_name},\n\n\
         To finish signing up, add one of our accounts below as a contact \
         and send it a message:\n{bot_accounts}",
    ),
    (
        "INSTRUCTIONAL_ERROR",
        "Hello {first_name},\n\n\
         We couldn't understand your last message{detail}.\n\n\
         To send a text, put a 10-digit phone number or \"Text <contact \
         name>\" in the subject line. To manage contacts use: Add Contact \
         Number, Add Contact Email, Update Contact Number, Update Contact \
         Email, Remove Contact, or Contact List.\n\n\
         Your recent messages:\n{previous_text_messages_status}",
    ),
    (
        "FAMILY_CONTACT_UPDATE",
        "Hello {first_name},\n\n\
         Your contact list has been updated.\n\n\
         New contacts: {new_contacts}\n\
         Failed: {failed_contacts}\n\n\
         Current contacts:\n{existing_contacts}",
    ),
    (
        "MESSAGE_SENT_CONFIRMATION",
        "Hello {first_name},\n\nYour message was sent successfully.",
    ),
    (
        "CONTACT_NOT_FOUND",
        "Hello {first_name},\n\n\
         We couldn't find the contact you referred to{detail}.\n\n\
         Current contacts:\n{existing_contacts}",
    ),
    (
        "CONTACT_LIST",
        "Hello {first_name},\n\nYour contacts:\n{existing_contacts}",
    ),
    (
        "TEXT_NOT_SENT_ERROR",
        "Hello {first_name},\n\n\
         We were unable to deliver your text message{detail}. Please try \
         again later or contact support if the problem persists.",
    ),
    (
        "SCREENNAME_CONFIRMATION",
        "Hello {first_name},\n\nYour screen name is now {screen_name}.",
    ),
    (
        "SCREENNAME_ERROR",
        "Hello {first_name},\n\n\
         That screen name could not be used. Please pick a different one.",
    ),
    (
        "LIST_PENPAL_USERS",
        "Hello {first_name},\n\nActive pen-pal users:\n{penpal_users}",
    ),
    (
        "FAMILY_TEXT_TO_CL",
        "Message from {first_name} ({detail}):\n\n{message}",
    ),
];

// ─────────────────────────────────────────────
// Render arguments
// ─────────────────────────────────────────────

/// The fixed parameter set templates may reference. Anything unset
/// renders as its "none" phrasing rather than an empty hole.
#[derive(Clone, Debug, Default)]
pub struct RenderArgs {
    pub first_name: String,
    pub bot_accounts: Vec<String>,
    pub existing_contacts: String,
    pub new_contacts: Vec<String>,
    pub failed_contacts: Vec<String>,
    pub command: String,
    pub detail: String,
    pub previous_text_messages_status: String,
    pub screen_name: String,
    pub penpal_users: String,
    pub message: String,
}

impl RenderArgs {
    fn to_map(&self) -> HashMap<&'static str, String> {
        let mut map = HashMap::new();
        map.insert("first_name", self.first_name.clone());
        map.insert("bot_accounts", self.bot_accounts.join("\n"));
        map.insert("existing_contacts", self.existing_contacts.clone());
        map.insert(
            "new_contacts",
            if self.new_contacts.is_empty() {
                "No new contacts".to_string()
            } else {
                self.new_contacts.join(", ")
            },
        );
        map.insert(
            "failed_contacts",
            if self.failed_contacts.is_empty() {
                "No failed contacts".to_string()
            } else {
                self.failed_contacts.join("\n")
            },
        );
        map.insert("command", self.command.clone());
        map.insert("detail", self.detail.clone());
        map.insert(
            "previous_text_messages_status",
            if self.previous_text_messages_status.is_empty() {
                "No previous messages found.".to_string()
            } else {
                self.previous_text_messages_status.clone()
            },
        );
        map.insert("screen_name", self.screen_name.clone());
        map.insert("penpal_users", self.penpal_users.clone());
        map.insert("message", self.message.clone());
        map
    }
}

// ─────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────

pub struct TemplateEngine {
    store: Arc<Store>,
}

impl TemplateEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Write all default templates (update-or-create). Returns how many
    /// were newly created.
    pub fn seed_defaults(store: &Store) -> Result<usize> {
        let mut created = 0;
        for (key, content) in DEFAULT_TEMPLATES {
            if store.upsert_template(key, content)? {
                created += 1;
            }
        }
        Ok(created)
    }

    /// Render the template stored under `key` with `args`.
    pub fn render(&self, key: &str, args: &RenderArgs) -> Result<String> {
        let template = self
            .store
            .get_template(key)?
            .ok_or_else(|| Error::Template(format!("unknown template key {key}")))?;
        render_str(&template.content, &args.to_map())
    }
}

/// Substitute `{placeholder}` slots from the map. A placeholder without
/// a value is an error; literal braces are not supported in template
/// text.
pub fn render_str(template: &str, values: &HashMap<&'static str, String>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or_else(|| Error::Template("unclosed placeholder".to_string()))?;
        let name = &after[..close];
        let value = values
            .get(name)
            .ok_or_else(|| Error::Template(format!("unresolved placeholder {{{name}}}")))?;
        out.push_str(value);
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Format recent SMS rows into the status grid embedded in
/// instructional replies.
pub fn format_sms_status(rows: &[(Sms, String)]) -> String {
    rows.iter()
        .map(|(sms, contact_name)| {
            format!(
                "DATE: {} | TIME: {} | CONTACT: {} | MESSAGE ID: {} | DELIVERED: {}",
                sms.created_at.format("%Y-%m-%d"),
                sms.created_at.format("%H:%M:%S"),
                contact_name,
                sms.text_id.as_deref().unwrap_or("N/A"),
                sms.status.as_str(),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SmsDirection, SmsStatus};
    use chrono::Utc;

    fn engine() -> TemplateEngine {
        let store = Arc::new(Store::open_in_memory().unwrap());
        TemplateEngine::seed_defaults(&store).unwrap();
        TemplateEngine::new(store)
    }

    #[test]
    fn test_seed_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(
            TemplateEngine::seed_defaults(&store).unwrap(),
            DEFAULT_TEMPLATES.len()
        );
        assert_eq!(TemplateEngine::seed_defaults(&store).unwrap(), 0);
    }

    #[test]
    fn test_all_keys_have_defaults() {
        for key in TEMPLATE_KEYS {
            assert!(
                DEFAULT_TEMPLATES.iter().any(|(k, _)| k == key),
                "missing default for {key}"
            );
        }
    }

    #[test]
    fn test_render_contact_update() {
        let engine = engine();
        let args = RenderArgs {
            first_name: "COOK ZACHARY".to_string(),
            new_contacts: vec!["Daffy".to_string()],
            existing_contacts: "Daffy: : 5555555555".to_string(),
            ..Default::default()
        };
        let out = engine.render("FAMILY_CONTACT_UPDATE", &args).unwrap();
        assert!(out.contains("Hello COOK ZACHARY"));
        assert!(out.contains("New contacts: Daffy"));
        assert!(out.contains("Failed: No failed contacts"));
        assert!(out.contains("Daffy: : 5555555555"));
    }

    #[test]
    fn test_render_unknown_key_errors() {
        let engine = engine();
        let err = engine.render("NOT_A_KEY", &RenderArgs::default()).unwrap_err();
        assert!(matches!(err, Error::Template(_)));
    }

    #[test]
    fn test_render_str_unresolved_placeholder_errors() {
        let values = HashMap::new();
        assert!(render_str("hi {nope}", &values).is_err());
    }

    #[test]
    fn test_render_str_unclosed_errors() {
        let values = HashMap::new();
        assert!(render_str("hi {first_name", &values).is_err());
    }

    #[test]
    fn test_format_sms_status() {
        let sms = Sms {
            id: 1,
            bot_id: 1,
            contact_id: 1,
            email_id: 1,
            phone_number: "4024312303".to_string(),
            message: "hello".to_string(),
            text_id: Some("txt-9".to_string()),
            direction: SmsDirection::Outbound,
            status: SmsStatus::Delivered,
            is_processed: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let grid = format_sms_status(&[(sms, "Daffy".to_string())]);
        assert!(grid.contains("CONTACT: Daffy"));
        assert!(grid.contains("MESSAGE ID: txt-9"));
        assert!(grid.contains("DELIVERED: delivered"));
    }

    #[test]
    fn test_format_sms_status_missing_text_id() {
        let sms = Sms {
            id: 1,
            bot_id: 1,
            contact_id: 1,
            email_id: 1,
            phone_number: "4024312303".to_string(),
            message: "hello".to_string(),
            text_id: None,
            direction: SmsDirection::Outbound,
            status: SmsStatus::Failed,
            is_processed: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let grid = format_sms_status(&[(sms, "Daffy".to_string())]);
        assert!(grid.contains("MESSAGE ID: N/A"));
    }
}
