//! Configuration schema and loader.
//!
//! Hierarchy: `Config` → `PortalConfig`, `SmsConfig`, `WebhookConfig`,
//! `SplashConfig`, `MailboxConfig`, `SchedulerConfig`, `AlertConfig`,
//! `DatabaseConfig`.
//!
//! JSON on disk uses **camelCase** keys; Rust uses snake_case. Secrets
//! can be overridden through environment variables so the config file
//! never has to carry them.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

// ─────────────────────────────────────────────
// Root config
// ─────────────────────────────────────────────

/// Root configuration — loaded from a JSON file plus env overrides.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub portal: PortalConfig,
    pub sms: SmsConfig,
    pub webhook: WebhookConfig,
    pub splash: SplashConfig,
    pub mailbox: MailboxConfig,
    pub scheduler: SchedulerConfig,
    pub alerts: AlertConfig,
    pub database: DatabaseConfig,
    /// Test mode caps inbox walks at three rows, skips webhook token
    /// checks, uses the gateway test key, and persists Splash artifacts.
    pub test_mode: bool,
}

// ─────────────────────────────────────────────
// Portal
// ─────────────────────────────────────────────

/// Everything needed to talk to the portal: URLs, form-field ids, the
/// browser fingerprint, and the element ids the rendered-submission
/// scripts poke at.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PortalConfig {
    pub base_url: String,
    pub login_page: String,
    pub inbox_page: String,
    pub pending_contact_page: String,
    pub new_message_page: String,
    /// User-Agent presented on every portal request. The portal's
    /// anti-bot layer expects a current desktop browser string.
    pub user_agent: String,
    pub proxy_url: String,
    pub use_proxy: bool,
    /// Cap on login-page fetch attempts before the tick gives up.
    pub login_max_attempts: u32,
    /// Alternate portal login for the shared operator identity
    /// (invite handling outside any bot). Empty disables it.
    pub alternate_username: String,
    pub alternate_password: String,

    // Login form field names.
    pub login_email_field: String,
    pub login_password_field: String,
    pub login_button_field: String,
    pub login_button_text: String,

    // Pending-contact (invite) element ids.
    pub invite_code_box_id: String,
    pub invite_go_button_id: String,
    pub invite_accept_button_id: String,
    pub custody_info_div_id: String,
    pub record_not_found_span_id: String,

    // Reply / compose element ids.
    pub message_box_id: String,
    pub send_button_id: String,
    pub sent_confirmation_text: String,
    pub recipient_search_box_id: String,
    pub recipient_go_button_id: String,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.corrlinks.com".to_string(),
            login_page: "/Login.aspx".to_string(),
            inbox_page: "/Inbox.aspx".to_string(),
            pending_contact_page: "/PendingContact.aspx".to_string(),
            new_message_page: "/NewMessage.aspx".to_string(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36"
                .to_string(),
            proxy_url: String::new(),
            use_proxy: false,
            login_max_attempts: 10,
            alternate_username: String::new(),
            alternate_password: String::new(),
            login_email_field: "ctl00$mainContentPlaceHolder$loginUserNameTextBox".to_string(),
            login_password_field: "ctl00$mainContentPlaceHolder$loginPasswordTextBox".to_string(),
            login_button_field: "ctl00$mainContentPlaceHolder$loginButton".to_string(),
            login_button_text: "Login >>".to_string(),
            invite_code_box_id:
                "ctl00_mainContentPlaceHolder_PendingContactUC1_InmateNumberTextBox".to_string(),
            invite_go_button_id:
                "ctl00_mainContentPlaceHolder_PendingContactUC1_SearchButton".to_string(),
            invite_accept_button_id:
                "ctl00_mainContentPlaceHolder_PendingContactUC1_addInmateButton".to_string(),
            custody_info_div_id:
                "ctl00_mainContentPlaceHolder_PendingContactUC1_inmatesGridViewPanel".to_string(),
            record_not_found_span_id:
                "ctl00_mainContentPlaceHolder_PendingContactUC1_ResultLabel".to_string(),
            message_box_id: "ctl00_mainContentPlaceHolder_messageTextBox".to_string(),
            send_button_id: "ctl00_mainContentPlaceHolder_sendMessageButton".to_string(),
            sent_confirmation_text: "Message successfully sent.".to_string(),
            recipient_search_box_id: "ctl00_mainContentPlaceHolder_addressBox".to_string(),
            recipient_go_button_id: "ctl00_mainContentPlaceHolder_searchButton".to_string(),
        }
    }
}

impl PortalConfig {
    pub fn login_url(&self) -> String {
        format!("{}{}", self.base_url, self.login_page)
    }

    pub fn inbox_url(&self) -> String {
        format!("{}{}", self.base_url, self.inbox_page)
    }

    pub fn pending_contact_url(&self) -> String {
        format!("{}{}", self.base_url, self.pending_contact_page)
    }

    pub fn reply_url(&self, message_id: &str) -> String {
        format!(
            "{}{}?messageId={}&type=reply",
            self.base_url, self.new_message_page, message_id
        )
    }

    pub fn new_message_url(&self) -> String {
        format!("{}{}", self.base_url, self.new_message_page)
    }

    /// Host part of the base URL, for scoping cookies.
    pub fn domain(&self) -> String {
        self.base_url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string()
    }
}

// ─────────────────────────────────────────────
// SMS gateway
// ─────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SmsConfig {
    pub gateway_url: String,
    pub api_key: String,
    /// Gateway key used when `test_mode` is on; sends are not billed.
    pub test_key: String,
    /// Public URL the gateway calls back with replies and receipts.
    pub reply_webhook_url: String,
    /// Seconds between delivery-status polls.
    pub retry_delay_secs: u64,
    /// Status-poll attempts (also the cap across a resend).
    pub max_retries: u32,
    /// Dispatch halts when the remaining quota is at or below this.
    pub quota_threshold: i64,
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            gateway_url: "https://textbelt.com".to_string(),
            api_key: String::new(),
            test_key: String::new(),
            reply_webhook_url: String::new(),
            retry_delay_secs: 120,
            max_retries: 3,
            quota_threshold: 100,
        }
    }
}

// ─────────────────────────────────────────────
// Inbound webhook
// ─────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebhookConfig {
    pub host: String,
    pub port: u16,
    /// HMAC secret for the signed `webhookData` token.
    pub signing_secret: String,
    /// Token max age in seconds.
    pub token_max_age_secs: i64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8941,
            signing_secret: String::new(),
            token_max_age_secs: 86_400,
        }
    }
}

// ─────────────────────────────────────────────
// Splash (rendered submission)
// ─────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SplashConfig {
    /// The `execute` endpoint of the headless-browser service.
    pub url: String,
    /// Where screenshots/HAR files land in test mode.
    pub artifacts_dir: String,
    /// Retries per rendered submission.
    pub max_retries: u32,
}

impl Default for SplashConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8050/execute".to_string(),
            artifacts_dir: "splash-artifacts".to_string(),
            max_retries: 3,
        }
    }
}

// ─────────────────────────────────────────────
// Mailbox search + shared operator mailbox
// ─────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MailboxConfig {
    /// How many days back invitation searches reach.
    pub search_days: u32,
    pub invite_subject: String,
    /// Broader fallback when the exact subject finds nothing.
    pub invite_subject_fallback: String,
    /// Shared operator mailbox, processed outside any bot.
    pub operator_host: String,
    pub operator_username: String,
    pub operator_password: String,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            search_days: 7,
            invite_subject: "Person in Custody:".to_string(),
            invite_subject_fallback: "Custody".to_string(),
            operator_host: String::new(),
            operator_username: String::new(),
            operator_password: String::new(),
        }
    }
}

impl MailboxConfig {
    pub fn has_operator_mailbox(&self) -> bool {
        !self.operator_host.is_empty() && !self.operator_username.is_empty()
    }
}

// ─────────────────────────────────────────────
// Scheduler
// ─────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
    /// Seconds between pipeline rounds.
    pub interval_secs: u64,
    /// Per-bot lock lease. A crashed worker's lock becomes stealable
    /// after this many seconds.
    pub lock_lease_secs: i64,
    /// Uniform start jitter bounds, in seconds.
    pub jitter_min_secs: u64,
    pub jitter_max_secs: u64,
    /// Retries for invite acceptance and reply submission.
    pub accept_max_retries: u32,
    pub reply_max_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 600,
            lock_lease_secs: 300,
            jitter_min_secs: 5,
            jitter_max_secs: 10,
            accept_max_retries: 3,
            reply_max_retries: 3,
        }
    }
}

// ─────────────────────────────────────────────
// Admin alerts
// ─────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlertConfig {
    pub enabled: bool,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: String,
    pub smtp_password: String,
    pub from_address: String,
    pub admin_address: String,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp_host: String::new(),
            smtp_port: 587,
            smtp_username: String::new(),
            smtp_password: String::new(),
            from_address: String::new(),
            admin_address: String::new(),
        }
    }
}

// ─────────────────────────────────────────────
// Database
// ─────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "textgate.db".to_string(),
        }
    }
}

// ─────────────────────────────────────────────
// Loader
// ─────────────────────────────────────────────

/// Load configuration from `path` (defaults when missing), then apply
/// env-var overrides for the secret-bearing fields.
pub fn load_config(path: Option<&Path>) -> Config {
    let default_path = PathBuf::from("textgate.json");
    let path = path.unwrap_or(&default_path);

    let mut config = match std::fs::read_to_string(path) {
        Ok(data) => match serde_json::from_str::<Config>(&data) {
            Ok(cfg) => {
                debug!(path = %path.display(), "loaded config file");
                cfg
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "bad config file, using defaults");
                Config::default()
            }
        },
        Err(_) => {
            debug!(path = %path.display(), "no config file, using defaults");
            Config::default()
        }
    };

    apply_env_overrides(&mut config);
    config
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(v) = std::env::var("TEXTGATE_SMS_API_KEY") {
        config.sms.api_key = v;
    }
    if let Ok(v) = std::env::var("TEXTGATE_SIGNING_SECRET") {
        config.webhook.signing_secret = v;
    }
    if let Ok(v) = std::env::var("TEXTGATE_DATABASE") {
        config.database.path = v;
    }
    if let Ok(v) = std::env::var("TEXTGATE_PROXY_URL") {
        config.portal.proxy_url = v;
        config.portal.use_proxy = true;
    }
    if let Ok(v) = std::env::var("TEXTGATE_TEST_MODE") {
        config.test_mode = matches!(v.as_str(), "1" | "true" | "True");
    }
}
