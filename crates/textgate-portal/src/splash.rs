//! Rendered form submission through the headless-browser service.
//!
//! The reply, compose, and pending-contact pages need their client-side
//! JavaScript to run before a submit sticks, so each action posts a Lua
//! script plus inputs to the service's `execute` endpoint and gets a
//! structured result back. The scripts live under `scripts/` and are
//! versioned with the code — they are part of the external contract.

use std::path::PathBuf;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use textgate_core::config::{PortalConfig, SplashConfig};
use textgate_core::error::{Error, Result};

const SEND_REPLY_LUA: &str = include_str!("../scripts/send_reply.lua");
const SEND_NEW_MESSAGE_LUA: &str = include_str!("../scripts/send_new_message.lua");
const ACCEPT_INVITE_LUA: &str = include_str!("../scripts/accept_invite.lua");

/// Wall-clock budget the scripts poll for their confirmation element.
pub const POLL_BUDGET_SECS: f64 = 6.0;
/// Poll step inside the scripts.
pub const POLL_STEP_SECS: f64 = 0.5;

// ─────────────────────────────────────────────
// Result shape
// ─────────────────────────────────────────────

/// Structured result every script returns. Screenshot and HAR keys ride
/// along in `extra` and are only persisted in test mode.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SubmissionResult {
    #[serde(default)]
    pub element_found: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub extra_messages: Option<Value>,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub is_processed: Option<bool>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl SubmissionResult {
    pub fn processed(&self) -> bool {
        self.is_processed.unwrap_or(false)
    }
}

// ─────────────────────────────────────────────
// Cookie conversion
// ─────────────────────────────────────────────

/// `name=value; name2=value2` — the Cookie header the scripts install.
pub fn cookie_header(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Cookies in the browser service's own format, scoped to the portal
/// domain with a one-hour expiry.
pub fn to_splash_cookies(pairs: &[(String, String)], domain: &str) -> Vec<Value> {
    let expires = (Utc::now() + ChronoDuration::hours(1)).to_rfc3339();
    pairs
        .iter()
        .map(|(name, value)| {
            json!({
                "name": name,
                "value": value,
                "expires": expires,
                "path": "/",
                "httpOnly": true,
                "secure": true,
                "domain": domain,
            })
        })
        .collect()
}

// ─────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────

pub struct SplashClient {
    client: reqwest::Client,
    url: String,
    test_mode: bool,
    artifacts_dir: PathBuf,
}

impl SplashClient {
    pub fn new(config: &SplashConfig, test_mode: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
            test_mode,
            artifacts_dir: PathBuf::from(&config.artifacts_dir),
        })
    }

    /// Reply to an existing portal thread.
    pub async fn send_reply(
        &self,
        portal: &PortalConfig,
        cookies: &[(String, String)],
        reply_url: &str,
        message_content: &str,
    ) -> Result<SubmissionResult> {
        let params = json!({
            "lua_source": SEND_REPLY_LUA,
            "reply_url": reply_url,
            "headers": portal_headers(portal, &portal.inbox_url()),
            "cookies": cookie_header(cookies),
            "splash_cookies": to_splash_cookies(cookies, &portal.domain()),
            "message_box_id": portal.message_box_id,
            "send_button_id": portal.send_button_id,
            "sent_confirmation_text": portal.sent_confirmation_text,
            "message_content": message_content,
        });
        self.execute("send_reply", params).await
    }

    /// Compose a brand-new message to a recipient found by name.
    pub async fn send_new_message(
        &self,
        portal: &PortalConfig,
        cookies: &[(String, String)],
        pic_name: &str,
        message_content: &str,
    ) -> Result<SubmissionResult> {
        let params = json!({
            "lua_source": SEND_NEW_MESSAGE_LUA,
            "new_message_url": portal.new_message_url(),
            "headers": portal_headers(portal, &portal.inbox_url()),
            "cookies": cookie_header(cookies),
            "splash_cookies": to_splash_cookies(cookies, &portal.domain()),
            "recipient_search_box_id": portal.recipient_search_box_id,
            "recipient_go_button_id": portal.recipient_go_button_id,
            "message_box_id": portal.message_box_id,
            "send_button_id": portal.send_button_id,
            "sent_confirmation_text": portal.sent_confirmation_text,
            "pic_name": pic_name,
            "message_content": message_content,
        });
        self.execute("send_new_message", params).await
    }

    /// Enter an invitation code on the pending-contact page and accept.
    pub async fn accept_invite(
        &self,
        portal: &PortalConfig,
        cookies: &[(String, String)],
        invitation_code: &str,
    ) -> Result<SubmissionResult> {
        let params = json!({
            "lua_source": ACCEPT_INVITE_LUA,
            "url": portal.pending_contact_url(),
            "headers": portal_headers(portal, &portal.pending_contact_url()),
            "cookies": cookie_header(cookies),
            "splash_cookies": to_splash_cookies(cookies, &portal.domain()),
            "invite_code_box_id": portal.invite_code_box_id,
            "invitation_code": invitation_code,
            "person_in_custody_information_div_id": portal.custody_info_div_id,
            "invitation_code_go_button_id": portal.invite_go_button_id,
            "invitation_accept_button_id": portal.invite_accept_button_id,
            "record_not_found_span_id": portal.record_not_found_span_id,
        });
        self.execute("accept_invite", params).await
    }

    async fn execute(&self, action: &str, params: Value) -> Result<SubmissionResult> {
        let resp = self.client.post(&self.url).json(&params).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Transient(format!(
                "splash {action} returned {status}"
            )));
        }

        let result: SubmissionResult = resp
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("splash {action} response unreadable: {e}")))?;

        debug!(
            action,
            element_found = result.element_found,
            is_processed = result.processed(),
            "splash execution finished"
        );

        if self.test_mode {
            if let Err(e) = self.persist_artifacts(&result) {
                warn!(error = %e, "failed to persist splash artifacts");
            }
        }

        Ok(result)
    }

    /// Write any base64 screenshots and the HAR capture to disk.
    /// Test-mode only; keys just need to contain "screenshot".
    fn persist_artifacts(&self, result: &SubmissionResult) -> Result<()> {
        let screenshots: Vec<&Value> = result
            .extra
            .iter()
            .filter(|(key, _)| key.contains("screenshot"))
            .map(|(_, value)| value)
            .collect();
        if screenshots.is_empty() && !result.extra.contains_key("har") {
            return Ok(());
        }

        std::fs::create_dir_all(&self.artifacts_dir)?;
        for (number, shot) in screenshots.iter().enumerate() {
            let Some(encoded) = shot.as_str() else {
                continue;
            };
            let Ok(bytes) = BASE64.decode(encoded) else {
                warn!(number, "screenshot was not valid base64");
                continue;
            };
            let path = self.artifacts_dir.join(format!("screenshot_{}.png", number + 1));
            std::fs::write(path, bytes)?;
        }

        if let Some(har) = result.extra.get("har") {
            let path = self.artifacts_dir.join("output.har");
            std::fs::write(path, serde_json::to_vec(har).unwrap_or_default())?;
        }
        Ok(())
    }
}

fn portal_headers(portal: &PortalConfig, referer: &str) -> Value {
    json!({
        "User-Agent": portal.user_agent,
        "Accept": "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
        "Accept-Encoding": "gzip, deflate, br",
        "Referer": referer,
        "X-Requested-With": "XMLHttpRequest",
        "X-MicrosoftAjax": "Delta=true",
    })
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
