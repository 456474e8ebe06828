//! Data model — typed rows for the relational store.
//!
//! Mirrors the persisted table layout: bots, users, contacts, emails,
//! sms, templates, and the processed-data audit trail. Timestamps are
//! RFC 3339 UTC strings in the database and `DateTime<Utc>` here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────
// Bot
// ─────────────────────────────────────────────

/// A worker identity: one portal login plus one IMAP mailbox.
/// Bots are deactivated, never deleted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Bot {
    pub id: i64,
    pub name: String,
    pub portal_username: String,
    pub portal_password: String,
    pub imap_host: String,
    pub imap_username: String,
    pub imap_password: String,
    pub last_seen_message_id: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating or updating a bot, keyed by `name`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotSpec {
    pub name: String,
    pub portal_username: String,
    pub portal_password: String,
    pub imap_host: String,
    pub imap_username: String,
    pub imap_password: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

// ─────────────────────────────────────────────
// User
// ─────────────────────────────────────────────

/// The incarcerated correspondent. Identified forever by the portal's
/// pic number; created deactivated on first sighting.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub pic_number: String,
    pub display_name: String,
    pub user_name: String,
    pub is_active: bool,
    pub private_mode: bool,
    pub balance: f64,
    pub sms_remaining: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────
// Contact
// ─────────────────────────────────────────────

/// An outside contact owned by exactly one user. `(user_id, contact_name)`
/// is unique; phone numbers are stored in canonical digits-only form.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Contact {
    pub id: i64,
    pub user_id: i64,
    pub contact_name: String,
    pub phone_number: Option<String>,
    pub email_address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The detail half of an add/update contact command.
#[derive(Clone, Debug, PartialEq)]
pub enum ContactDetail {
    Phone(String),
    Email(String),
}

// ─────────────────────────────────────────────
// Email (inbound portal message)
// ─────────────────────────────────────────────

/// A message pulled from a bot's portal inbox. Immutable once stored
/// except for the `is_processed` flag.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmailMessage {
    pub id: i64,
    pub bot_id: i64,
    pub user_id: i64,
    pub message_id: String,
    pub sent_at: String,
    pub subject: String,
    pub body: String,
    pub is_processed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewEmail {
    pub bot_id: i64,
    pub user_id: i64,
    pub message_id: String,
    pub sent_at: String,
    pub subject: String,
    pub body: String,
}

// ─────────────────────────────────────────────
// SMS
// ─────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmsDirection {
    Inbound,
    Outbound,
}

impl SmsDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SmsDirection::Inbound => "inbound",
            SmsDirection::Outbound => "outbound",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inbound" => Some(SmsDirection::Inbound),
            "outbound" => Some(SmsDirection::Outbound),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmsStatus {
    Sent,
    Delivered,
    Failed,
    Unknown,
}

impl SmsStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SmsStatus::Sent => "sent",
            SmsStatus::Delivered => "delivered",
            SmsStatus::Failed => "failed",
            SmsStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "sent" => SmsStatus::Sent,
            "delivered" => SmsStatus::Delivered,
            "failed" => SmsStatus::Failed,
            _ => SmsStatus::Unknown,
        }
    }

    /// Terminal statuses end the dispatch state machine for a message.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SmsStatus::Delivered | SmsStatus::Failed)
    }
}

/// One SMS leg. Outbound rows are written on dispatch; inbound rows are
/// written by the webhook, copying `(bot, email, contact)` from the
/// outbound row they answer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Sms {
    pub id: i64,
    pub bot_id: i64,
    pub contact_id: i64,
    pub email_id: i64,
    pub phone_number: String,
    pub message: String,
    pub text_id: Option<String>,
    pub direction: SmsDirection,
    pub status: SmsStatus,
    pub is_processed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewSms {
    pub bot_id: i64,
    pub contact_id: i64,
    pub email_id: i64,
    pub phone_number: String,
    pub message: String,
    pub text_id: Option<String>,
    pub direction: SmsDirection,
    pub status: SmsStatus,
}

// ─────────────────────────────────────────────
// Response template
// ─────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponseTemplate {
    pub id: i64,
    pub key: String,
    pub content: String,
}

// ─────────────────────────────────────────────
// Processed-data audit row
// ─────────────────────────────────────────────

/// Audit trail: which module of which bot finished which original
/// message, and with what outcome. Enables idempotency checks across
/// components.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessedData {
    pub id: i64,
    pub bot_id: i64,
    pub module_name: String,
    pub original_message_id: String,
    pub status: String,
    pub processed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sms_status_round_trip() {
        for status in [SmsStatus::Sent, SmsStatus::Delivered, SmsStatus::Failed] {
            assert_eq!(SmsStatus::parse(status.as_str()), status);
        }
        assert_eq!(SmsStatus::parse("garbage"), SmsStatus::Unknown);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(SmsStatus::Delivered.is_terminal());
        assert!(SmsStatus::Failed.is_terminal());
        assert!(!SmsStatus::Sent.is_terminal());
        assert!(!SmsStatus::Unknown.is_terminal());
    }

    #[test]
    fn test_direction_parse() {
        assert_eq!(SmsDirection::parse("inbound"), Some(SmsDirection::Inbound));
        assert_eq!(SmsDirection::parse("outbound"), Some(SmsDirection::Outbound));
        assert_eq!(SmsDirection::parse("sideways"), None);
    }

    #[test]
    fn test_bot_spec_defaults_active() {
        let spec: BotSpec = serde_json::from_value(serde_json::json!({
            "name": "bot-1",
            "portalUsername": "u@example.com",
            "portalPassword": "pw",
            "imapHost": "mail.example.com",
            "imapUsername": "u@example.com",
            "imapPassword": "pw"
        }))
        .unwrap();
        assert!(spec.is_active);
    }
}
