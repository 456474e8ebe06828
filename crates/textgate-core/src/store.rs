//! Relational store — the single piece of shared mutable state between
//! pipeline stages.
//!
//! One SQLite connection behind a mutex; migrations run idempotently at
//! open. Writes are committed per record; no multi-stage transaction
//! spans components. The `locks` table doubles as the shared key-value
//! lock store used for per-bot mutual exclusion.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::{
    Bot, BotSpec, Contact, ContactDetail, EmailMessage, NewEmail, NewSms, ProcessedData,
    ResponseTemplate, Sms, SmsDirection, SmsStatus, User,
};

pub type DbConnection = Arc<Mutex<Connection>>;

pub struct Store {
    connection: DbConnection,
}

fn now_str() -> String {
    Utc::now().to_rfc3339()
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_default()
}

impl Store {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        let store = Store {
            connection: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    /// In-memory store for tests and one-shot tooling.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Store {
            connection: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.connection
            .lock()
            .map_err(|_| Error::Transient("store mutex poisoned".to_string()))
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS bots (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                portal_username TEXT NOT NULL,
                portal_password TEXT NOT NULL,
                imap_host TEXT NOT NULL,
                imap_username TEXT NOT NULL,
                imap_password TEXT NOT NULL,
                last_seen_message_id TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                pic_number TEXT NOT NULL UNIQUE,
                display_name TEXT NOT NULL,
                user_name TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 0,
                private_mode INTEGER NOT NULL DEFAULT 0,
                balance REAL NOT NULL DEFAULT 0,
                sms_remaining REAL NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS contacts (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                contact_name TEXT NOT NULL,
                phone_number TEXT,
                email_address TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(user_id, contact_name)
            );
            CREATE INDEX IF NOT EXISTS idx_contacts_phone ON contacts(phone_number);

            CREATE TABLE IF NOT EXISTS emails (
                id INTEGER PRIMARY KEY,
                bot_id INTEGER NOT NULL REFERENCES bots(id) ON DELETE CASCADE,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                message_id TEXT NOT NULL,
                sent_at TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                is_processed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(bot_id, message_id)
            );
            CREATE INDEX IF NOT EXISTS idx_emails_unprocessed ON emails(bot_id, is_processed);

            CREATE TABLE IF NOT EXISTS sms (
                id INTEGER PRIMARY KEY,
                bot_id INTEGER NOT NULL REFERENCES bots(id) ON DELETE CASCADE,
                contact_id INTEGER NOT NULL REFERENCES contacts(id) ON DELETE CASCADE,
                email_id INTEGER NOT NULL REFERENCES emails(id) ON DELETE CASCADE,
                phone_number TEXT NOT NULL,
                message TEXT NOT NULL,
                text_id TEXT,
                direction TEXT NOT NULL,
                status TEXT NOT NULL,
                is_processed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_sms_outbound_text_id
                ON sms(text_id) WHERE direction = 'outbound' AND text_id IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_sms_unprocessed ON sms(bot_id, direction, is_processed);

            CREATE TABLE IF NOT EXISTS templates (
                id INTEGER PRIMARY KEY,
                key TEXT NOT NULL UNIQUE,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS processed_data (
                id INTEGER PRIMARY KEY,
                bot_id INTEGER NOT NULL,
                module_name TEXT NOT NULL,
                original_message_id TEXT NOT NULL,
                status TEXT NOT NULL,
                processed_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_processed_lookup
                ON processed_data(bot_id, module_name, original_message_id);

            CREATE TABLE IF NOT EXISTS locks (
                name TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );",
        )?;

        debug!("store migrations completed");
        Ok(())
    }

    // ─────────────────────────────────────────
    // Bots
    // ─────────────────────────────────────────

    fn row_to_bot(row: &Row) -> rusqlite::Result<Bot> {
        Ok(Bot {
            id: row.get(0)?,
            name: row.get(1)?,
            portal_username: row.get(2)?,
            portal_password: row.get(3)?,
            imap_host: row.get(4)?,
            imap_username: row.get(5)?,
            imap_password: row.get(6)?,
            last_seen_message_id: row.get(7)?,
            is_active: row.get::<_, i64>(8)? != 0,
            created_at: parse_ts(&row.get::<_, String>(9)?),
            updated_at: parse_ts(&row.get::<_, String>(10)?),
        })
    }

    const BOT_COLUMNS: &'static str = "id, name, portal_username, portal_password, imap_host, \
         imap_username, imap_password, last_seen_message_id, is_active, created_at, updated_at";

    /// Create or update a bot keyed by its unique name.
    pub fn upsert_bot(&self, spec: &BotSpec) -> Result<Bot> {
        let conn = self.conn()?;
        let now = now_str();

        conn.execute(
            "INSERT INTO bots (name, portal_username, portal_password, imap_host,
                               imap_username, imap_password, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
             ON CONFLICT(name) DO UPDATE SET
                portal_username = excluded.portal_username,
                portal_password = excluded.portal_password,
                imap_host = excluded.imap_host,
                imap_username = excluded.imap_username,
                imap_password = excluded.imap_password,
                is_active = excluded.is_active,
                updated_at = excluded.updated_at",
            params![
                spec.name,
                spec.portal_username,
                spec.portal_password,
                spec.imap_host,
                spec.imap_username,
                spec.imap_password,
                spec.is_active as i64,
                now,
            ],
        )?;

        let bot = conn.query_row(
            &format!("SELECT {} FROM bots WHERE name = ?1", Self::BOT_COLUMNS),
            params![spec.name],
            Self::row_to_bot,
        )?;
        Ok(bot)
    }

    pub fn get_bot(&self, id: i64) -> Result<Option<Bot>> {
        let conn = self.conn()?;
        let bot = conn
            .query_row(
                &format!("SELECT {} FROM bots WHERE id = ?1", Self::BOT_COLUMNS),
                params![id],
                Self::row_to_bot,
            )
            .optional()?;
        Ok(bot)
    }

    pub fn list_bots(&self) -> Result<Vec<Bot>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare(&format!("SELECT {} FROM bots ORDER BY id", Self::BOT_COLUMNS))?;
        let bots = stmt
            .query_map([], Self::row_to_bot)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(bots)
    }

    pub fn list_active_bots(&self) -> Result<Vec<Bot>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM bots WHERE is_active = 1 ORDER BY id",
            Self::BOT_COLUMNS
        ))?;
        let bots = stmt
            .query_map([], Self::row_to_bot)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(bots)
    }

    pub fn set_bot_active(&self, id: i64, active: bool) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE bots SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
            params![active as i64, now_str(), id],
        )?;
        Ok(changed > 0)
    }

    /// Deactivate every bot whose name is not in `names`; returns the
    /// names that were deactivated. Bots are never deleted.
    pub fn deactivate_bots_not_in(&self, names: &[String]) -> Result<Vec<String>> {
        let mut deactivated = Vec::new();
        for bot in self.list_bots()? {
            if bot.is_active && !names.contains(&bot.name) {
                self.set_bot_active(bot.id, false)?;
                deactivated.push(bot.name);
            }
        }
        Ok(deactivated)
    }

    pub fn set_last_seen_message_id(&self, bot_id: i64, message_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE bots SET last_seen_message_id = ?1, updated_at = ?2 WHERE id = ?3",
            params![message_id, now_str(), bot_id],
        )?;
        Ok(())
    }

    // ─────────────────────────────────────────
    // Users
    // ─────────────────────────────────────────

    fn row_to_user(row: &Row) -> rusqlite::Result<User> {
        Ok(User {
            id: row.get(0)?,
            pic_number: row.get(1)?,
            display_name: row.get(2)?,
            user_name: row.get(3)?,
            is_active: row.get::<_, i64>(4)? != 0,
            private_mode: row.get::<_, i64>(5)? != 0,
            balance: row.get(6)?,
            sms_remaining: row.get(7)?,
            created_at: parse_ts(&row.get::<_, String>(8)?),
            updated_at: parse_ts(&row.get::<_, String>(9)?),
        })
    }

    const USER_COLUMNS: &'static str = "id, pic_number, display_name, user_name, is_active, \
         private_mode, balance, sms_remaining, created_at, updated_at";

    /// Get the user for a pic number, creating a deactivated record on
    /// first sighting. The derived login name is
    /// `strip_spaces(display_name) + "_" + pic_number`.
    pub fn get_or_create_user(&self, pic_number: &str, display_name: &str) -> Result<(User, bool)> {
        let conn = self.conn()?;
        let existing = conn
            .query_row(
                &format!(
                    "SELECT {} FROM users WHERE pic_number = ?1",
                    Self::USER_COLUMNS
                ),
                params![pic_number],
                Self::row_to_user,
            )
            .optional()?;

        if let Some(user) = existing {
            return Ok((user, false));
        }

        let user_name = format!(
            "{}_{}",
            display_name.replace(' ', ""),
            pic_number.replace(' ', "")
        );
        let now = now_str();
        conn.execute(
            "INSERT INTO users (pic_number, display_name, user_name, is_active,
                                private_mode, balance, sms_remaining, created_at, updated_at)
             VALUES (?1, ?2, ?3, 0, 0, 0, 0, ?4, ?4)",
            params![pic_number, display_name, user_name, now],
        )?;
        info!(pic_number = %pic_number, user_name = %user_name, "created user");

        let user = conn.query_row(
            &format!(
                "SELECT {} FROM users WHERE pic_number = ?1",
                Self::USER_COLUMNS
            ),
            params![pic_number],
            Self::row_to_user,
        )?;
        Ok((user, true))
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        let conn = self.conn()?;
        let user = conn
            .query_row(
                &format!("SELECT {} FROM users WHERE id = ?1", Self::USER_COLUMNS),
                params![id],
                Self::row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    // ─────────────────────────────────────────
    // Contacts
    // ─────────────────────────────────────────

    fn row_to_contact(row: &Row) -> rusqlite::Result<Contact> {
        Ok(Contact {
            id: row.get(0)?,
            user_id: row.get(1)?,
            contact_name: row.get(2)?,
            phone_number: row.get(3)?,
            email_address: row.get(4)?,
            created_at: parse_ts(&row.get::<_, String>(5)?),
            updated_at: parse_ts(&row.get::<_, String>(6)?),
        })
    }

    const CONTACT_COLUMNS: &'static str =
        "id, user_id, contact_name, phone_number, email_address, created_at, updated_at";

    /// Insert or update a contact keyed by `(user, name)`, setting the
    /// given detail and leaving the other detail untouched.
    pub fn upsert_contact(
        &self,
        user_id: i64,
        name: &str,
        detail: &ContactDetail,
    ) -> Result<(Contact, bool)> {
        let existing = self.find_contact_by_name(user_id, name)?;
        let conn = self.conn()?;
        let now = now_str();

        let created = match &existing {
            Some(contact) => {
                match detail {
                    ContactDetail::Phone(phone) => conn.execute(
                        "UPDATE contacts SET phone_number = ?1, updated_at = ?2 WHERE id = ?3",
                        params![phone, now, contact.id],
                    )?,
                    ContactDetail::Email(email) => conn.execute(
                        "UPDATE contacts SET email_address = ?1, updated_at = ?2 WHERE id = ?3",
                        params![email, now, contact.id],
                    )?,
                };
                false
            }
            None => {
                let (phone, email) = match detail {
                    ContactDetail::Phone(p) => (Some(p.as_str()), None),
                    ContactDetail::Email(e) => (None, Some(e.as_str())),
                };
                conn.execute(
                    "INSERT INTO contacts (user_id, contact_name, phone_number, email_address,
                                           created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                    params![user_id, name, phone, email, now],
                )?;
                true
            }
        };
        drop(conn);

        let contact = self
            .find_contact_by_name(user_id, name)?
            .ok_or_else(|| Error::Protocol(format!("contact {name} vanished after upsert")))?;
        Ok((contact, created))
    }

    pub fn find_contact_by_name(&self, user_id: i64, name: &str) -> Result<Option<Contact>> {
        let conn = self.conn()?;
        let contact = conn
            .query_row(
                &format!(
                    "SELECT {} FROM contacts WHERE user_id = ?1 AND contact_name = ?2",
                    Self::CONTACT_COLUMNS
                ),
                params![user_id, name],
                Self::row_to_contact,
            )
            .optional()?;
        Ok(contact)
    }

    pub fn get_contact(&self, id: i64) -> Result<Option<Contact>> {
        let conn = self.conn()?;
        let contact = conn
            .query_row(
                &format!(
                    "SELECT {} FROM contacts WHERE id = ?1",
                    Self::CONTACT_COLUMNS
                ),
                params![id],
                Self::row_to_contact,
            )
            .optional()?;
        Ok(contact)
    }

    pub fn find_contact_by_phone(&self, user_id: i64, phone: &str) -> Result<Option<Contact>> {
        let conn = self.conn()?;
        let contact = conn
            .query_row(
                &format!(
                    "SELECT {} FROM contacts WHERE user_id = ?1 AND phone_number = ?2",
                    Self::CONTACT_COLUMNS
                ),
                params![user_id, phone],
                Self::row_to_contact,
            )
            .optional()?;
        Ok(contact)
    }

    /// Hard delete. Returns whether a row existed.
    pub fn delete_contact(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM contacts WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    pub fn list_contacts(&self, user_id: i64) -> Result<Vec<Contact>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM contacts WHERE user_id = ?1 ORDER BY contact_name",
            Self::CONTACT_COLUMNS
        ))?;
        let contacts = stmt
            .query_map(params![user_id], Self::row_to_contact)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(contacts)
    }

    // ─────────────────────────────────────────
    // Emails
    // ─────────────────────────────────────────

    fn row_to_email(row: &Row) -> rusqlite::Result<EmailMessage> {
        Ok(EmailMessage {
            id: row.get(0)?,
            bot_id: row.get(1)?,
            user_id: row.get(2)?,
            message_id: row.get(3)?,
            sent_at: row.get(4)?,
            subject: row.get(5)?,
            body: row.get(6)?,
            is_processed: row.get::<_, i64>(7)? != 0,
            created_at: parse_ts(&row.get::<_, String>(8)?),
            updated_at: parse_ts(&row.get::<_, String>(9)?),
        })
    }

    const EMAIL_COLUMNS: &'static str = "id, bot_id, user_id, message_id, sent_at, subject, \
         body, is_processed, created_at, updated_at";

    /// Insert a pulled email; duplicates on `(bot, message_id)` are
    /// silently dropped and return `None`.
    pub fn insert_email(&self, email: &NewEmail) -> Result<Option<EmailMessage>> {
        let conn = self.conn()?;
        let now = now_str();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO emails
                (bot_id, user_id, message_id, sent_at, subject, body, is_processed,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?7)",
            params![
                email.bot_id,
                email.user_id,
                email.message_id,
                email.sent_at,
                email.subject,
                email.body,
                now,
            ],
        )?;

        if changed == 0 {
            debug!(bot_id = email.bot_id, message_id = %email.message_id, "duplicate email skipped");
            return Ok(None);
        }

        let id = conn.last_insert_rowid();
        let stored = conn.query_row(
            &format!("SELECT {} FROM emails WHERE id = ?1", Self::EMAIL_COLUMNS),
            params![id],
            Self::row_to_email,
        )?;
        Ok(Some(stored))
    }

    pub fn email_exists(&self, bot_id: i64, message_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM emails WHERE bot_id = ?1 AND message_id = ?2",
            params![bot_id, message_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn get_email(&self, id: i64) -> Result<Option<EmailMessage>> {
        let conn = self.conn()?;
        let email = conn
            .query_row(
                &format!("SELECT {} FROM emails WHERE id = ?1", Self::EMAIL_COLUMNS),
                params![id],
                Self::row_to_email,
            )
            .optional()?;
        Ok(email)
    }

    pub fn unprocessed_emails(&self, bot_id: i64) -> Result<Vec<EmailMessage>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM emails WHERE bot_id = ?1 AND is_processed = 0 ORDER BY id",
            Self::EMAIL_COLUMNS
        ))?;
        let emails = stmt
            .query_map(params![bot_id], Self::row_to_email)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(emails)
    }

    pub fn mark_email_processed(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE emails SET is_processed = 1, updated_at = ?1 WHERE id = ?2",
            params![now_str(), id],
        )?;
        Ok(())
    }

    // ─────────────────────────────────────────
    // SMS
    // ─────────────────────────────────────────

    fn row_to_sms(row: &Row) -> rusqlite::Result<Sms> {
        let direction: String = row.get(7)?;
        let status: String = row.get(8)?;
        Ok(Sms {
            id: row.get(0)?,
            bot_id: row.get(1)?,
            contact_id: row.get(2)?,
            email_id: row.get(3)?,
            phone_number: row.get(4)?,
            message: row.get(5)?,
            text_id: row.get(6)?,
            direction: SmsDirection::parse(&direction).unwrap_or(SmsDirection::Outbound),
            status: SmsStatus::parse(&status),
            is_processed: row.get::<_, i64>(9)? != 0,
            created_at: parse_ts(&row.get::<_, String>(10)?),
            updated_at: parse_ts(&row.get::<_, String>(11)?),
        })
    }

    const SMS_COLUMNS: &'static str = "id, bot_id, contact_id, email_id, phone_number, message, \
         text_id, direction, status, is_processed, created_at, updated_at";

    pub fn insert_sms(&self, sms: &NewSms) -> Result<Sms> {
        let conn = self.conn()?;
        let now = now_str();
        conn.execute(
            "INSERT INTO sms (bot_id, contact_id, email_id, phone_number, message, text_id,
                              direction, status, is_processed, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?9)",
            params![
                sms.bot_id,
                sms.contact_id,
                sms.email_id,
                sms.phone_number,
                sms.message,
                sms.text_id,
                sms.direction.as_str(),
                sms.status.as_str(),
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();
        let stored = conn.query_row(
            &format!("SELECT {} FROM sms WHERE id = ?1", Self::SMS_COLUMNS),
            params![id],
            Self::row_to_sms,
        )?;
        Ok(stored)
    }

    pub fn update_sms_status(&self, id: i64, status: SmsStatus) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sms SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now_str(), id],
        )?;
        Ok(())
    }

    /// Most recent outbound SMS for a gateway text id.
    pub fn latest_outbound_by_text_id(&self, text_id: &str) -> Result<Option<Sms>> {
        let conn = self.conn()?;
        let sms = conn
            .query_row(
                &format!(
                    "SELECT {} FROM sms
                     WHERE text_id = ?1 AND direction = 'outbound'
                     ORDER BY created_at DESC, id DESC LIMIT 1",
                    Self::SMS_COLUMNS
                ),
                params![text_id],
                Self::row_to_sms,
            )
            .optional()?;
        Ok(sms)
    }

    /// Whether an inbound SMS was already paired to this text id.
    /// Used to make webhook replays a no-op.
    pub fn has_inbound_for_text_id(&self, text_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sms WHERE text_id = ?1 AND direction = 'inbound'",
            params![text_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn unprocessed_inbound_sms(&self, bot_id: i64) -> Result<Vec<Sms>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sms
             WHERE bot_id = ?1 AND direction = 'inbound' AND is_processed = 0
             ORDER BY id",
            Self::SMS_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![bot_id], Self::row_to_sms)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn mark_sms_processed(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sms SET is_processed = 1, updated_at = ?1 WHERE id = ?2",
            params![now_str(), id],
        )?;
        Ok(())
    }

    /// Recent SMS for a user with the owning contact's name, newest
    /// first. Feeds the status grid in instructional replies.
    pub fn recent_sms_for_user(&self, user_id: i64, limit: u32) -> Result<Vec<(Sms, String)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {}, c.contact_name FROM sms s
             JOIN contacts c ON c.id = s.contact_id
             WHERE c.user_id = ?1
             ORDER BY s.created_at DESC, s.id DESC LIMIT ?2",
            Self::SMS_COLUMNS
                .split(", ")
                .map(|c| format!("s.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        ))?;
        let rows = stmt
            .query_map(params![user_id, limit], |row| {
                let sms = Self::row_to_sms(row)?;
                let name: String = row.get(12)?;
                Ok((sms, name))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ─────────────────────────────────────────
    // Templates
    // ─────────────────────────────────────────

    /// Returns whether the template was newly created.
    pub fn upsert_template(&self, key: &str, content: &str) -> Result<bool> {
        let conn = self.conn()?;
        let now = now_str();
        let existing: i64 = conn.query_row(
            "SELECT COUNT(*) FROM templates WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT INTO templates (key, content, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(key) DO UPDATE SET content = excluded.content,
                                            updated_at = excluded.updated_at",
            params![key, content, now],
        )?;
        Ok(existing == 0)
    }

    pub fn get_template(&self, key: &str) -> Result<Option<ResponseTemplate>> {
        let conn = self.conn()?;
        let template = conn
            .query_row(
                "SELECT id, key, content FROM templates WHERE key = ?1",
                params![key],
                |row| {
                    Ok(ResponseTemplate {
                        id: row.get(0)?,
                        key: row.get(1)?,
                        content: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(template)
    }

    // ─────────────────────────────────────────
    // Processed-data audit trail
    // ─────────────────────────────────────────

    pub fn record_processed(
        &self,
        bot_id: i64,
        module_name: &str,
        original_message_id: &str,
        status: &str,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO processed_data (bot_id, module_name, original_message_id, status,
                                         processed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![bot_id, module_name, original_message_id, status, now_str()],
        )?;
        Ok(())
    }

    pub fn processed_exists(
        &self,
        bot_id: i64,
        module_name: &str,
        original_message_id: &str,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM processed_data
             WHERE bot_id = ?1 AND module_name = ?2 AND original_message_id = ?3",
            params![bot_id, module_name, original_message_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn list_processed(&self, bot_id: i64, module_name: &str) -> Result<Vec<ProcessedData>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, bot_id, module_name, original_message_id, status, processed_at
             FROM processed_data WHERE bot_id = ?1 AND module_name = ?2 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![bot_id, module_name], |row| {
                Ok(ProcessedData {
                    id: row.get(0)?,
                    bot_id: row.get(1)?,
                    module_name: row.get(2)?,
                    original_message_id: row.get(3)?,
                    status: row.get(4)?,
                    processed_at: parse_ts(&row.get::<_, String>(5)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ─────────────────────────────────────────
    // Named locks
    // ─────────────────────────────────────────

    /// Non-blocking named lock acquisition with a lease. Expired leases
    /// are stolen; a live lease held by anyone (including the same
    /// holder) fails the acquire.
    pub fn try_acquire_lock(&self, name: &str, holder: &str, lease_secs: i64) -> Result<bool> {
        let conn = self.conn()?;
        let now = Utc::now();
        let expires = (now + Duration::seconds(lease_secs)).to_rfc3339();

        let current: Option<(String, String)> = conn
            .query_row(
                "SELECT holder, expires_at FROM locks WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match current {
            None => {
                conn.execute(
                    "INSERT INTO locks (name, holder, expires_at) VALUES (?1, ?2, ?3)",
                    params![name, holder, expires],
                )?;
                Ok(true)
            }
            Some((_, expires_at)) if parse_ts(&expires_at) <= now => {
                conn.execute(
                    "UPDATE locks SET holder = ?1, expires_at = ?2 WHERE name = ?3",
                    params![holder, expires, name],
                )?;
                debug!(lock = %name, "stole expired lock");
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    /// Release a lock if (and only if) we still hold it.
    pub fn release_lock(&self, name: &str, holder: &str) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "DELETE FROM locks WHERE name = ?1 AND holder = ?2",
            params![name, holder],
        )?;
        Ok(changed > 0)
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
