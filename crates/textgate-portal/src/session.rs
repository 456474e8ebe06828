//! Authenticated portal sessions, one per bot, cached per process.
//!
//! Login mimics a real browser: a fingerprint User-Agent, an optional
//! outbound proxy, the login page's hidden ASP.NET inputs posted back
//! as multipart form data alongside the credentials. The page fetch is
//! retried with cleared state until it returns 200 (bounded by config);
//! a failed credential POST fails the session for this tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::{CookieStore, Jar};
use reqwest::multipart;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use textgate_core::config::PortalConfig;
use textgate_core::error::{Error, Result};
use textgate_core::model::Bot;

use crate::forms::PortalFormState;

/// Cache key for the shared operator login, which is not a bot.
const OPERATOR_SESSION_KEY: i64 = -1;

/// Request timeout for ordinary portal traffic.
const PORTAL_TIMEOUT: Duration = Duration::from_secs(30);

// ─────────────────────────────────────────────
// PortalSession
// ─────────────────────────────────────────────

/// One logged-in portal identity: a cookie-carrying HTTP client plus
/// the portal endpoints it talks to.
#[derive(Debug)]
pub struct PortalSession {
    pub key: i64,
    client: reqwest::Client,
    jar: Arc<Jar>,
    portal: PortalConfig,
}

fn build_client(portal: &PortalConfig) -> Result<(reqwest::Client, Arc<Jar>)> {
    let jar = Arc::new(Jar::default());
    let mut builder = reqwest::Client::builder()
        .cookie_provider(jar.clone())
        .user_agent(portal.user_agent.clone())
        .timeout(PORTAL_TIMEOUT);

    if portal.use_proxy && !portal.proxy_url.is_empty() {
        debug!(proxy = %portal.proxy_url, "routing portal traffic through proxy");
        builder = builder.proxy(reqwest::Proxy::all(&portal.proxy_url)?);
    }

    Ok((builder.build()?, jar))
}

impl PortalSession {
    /// Log in and return a live session.
    pub async fn login(
        key: i64,
        username: &str,
        password: &str,
        portal: &PortalConfig,
    ) -> Result<Self> {
        let login_url = portal.login_url();
        let attempts = portal.login_max_attempts.max(1);

        for attempt in 1..=attempts {
            // Fresh client per attempt: headers and cookies cleared.
            let (client, jar) = build_client(portal)?;

            let page = match client.get(&login_url).send().await {
                Ok(resp) if resp.status().is_success() => resp,
                Ok(resp) => {
                    warn!(attempt, status = %resp.status(), "login page fetch failed, retrying");
                    continue;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "login page fetch failed, retrying");
                    continue;
                }
            };
            debug!(attempt, "login page fetched");

            let html = page.text().await?;
            let hidden = PortalFormState::hidden_from_html(&html);

            let mut form = multipart::Form::new()
                .text(portal.login_email_field.clone(), username.to_string())
                .text(portal.login_password_field.clone(), password.to_string())
                .text(
                    portal.login_button_field.clone(),
                    portal.login_button_text.clone(),
                );
            for (name, value) in hidden.pairs() {
                form = form.text(name.clone(), value.clone());
            }

            let submit = client.post(&login_url).multipart(form).send().await?;
            if !submit.status().is_success() {
                return Err(Error::Transient(format!(
                    "login submit returned {}",
                    submit.status()
                )));
            }

            info!(key, "portal session initialized");
            return Ok(PortalSession {
                key,
                client,
                jar,
                portal: portal.clone(),
            });
        }

        Err(Error::Transient(format!(
            "login page not reachable after {attempts} attempts"
        )))
    }

    pub fn portal(&self) -> &PortalConfig {
        &self.portal
    }

    /// GET an absolute portal URL, surfacing an expired session as such.
    pub async fn get(&self, url: &str) -> Result<String> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if status.as_u16() == 302 || !status.is_success() {
            return Err(Error::SessionExpired);
        }
        let body = resp.text().await?;
        if body.contains("Login.aspx") && body.contains("loginButton") {
            return Err(Error::SessionExpired);
        }
        Ok(body)
    }

    /// POST urlencoded form data with extra headers (the AJAX postback
    /// shape the inbox grid expects).
    pub async fn post_form(
        &self,
        url: &str,
        data: &[(String, String)],
        headers: &[(&str, &str)],
    ) -> Result<String> {
        let mut req = self.client.post(url).form(data);
        for (name, value) in headers {
            req = req.header(*name, *value);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(Error::SessionExpired);
        }
        Ok(resp.text().await?)
    }

    /// Current cookies for the portal origin as name/value pairs, in
    /// the shape the Splash scripts consume.
    pub fn cookie_pairs(&self) -> Result<Vec<(String, String)>> {
        let url = reqwest::Url::parse(&self.portal.base_url)
            .map_err(|e| Error::Protocol(format!("bad portal base url: {e}")))?;

        let Some(header) = self.jar.cookies(&url) else {
            return Ok(Vec::new());
        };
        let header = header
            .to_str()
            .map_err(|e| Error::Protocol(format!("unreadable cookie header: {e}")))?
            .to_string();

        Ok(header
            .split("; ")
            .filter_map(|pair| {
                let (name, value) = pair.split_once('=')?;
                Some((name.to_string(), value.to_string()))
            })
            .collect())
    }
}

// ─────────────────────────────────────────────
// SessionCache
// ─────────────────────────────────────────────

/// Process-wide session cache keyed by bot id, with an explicit
/// `get`/`invalidate` surface. A stale session is invalidated by the
/// stage that trips over it; the next tick re-logs-in.
pub struct SessionCache {
    portal: PortalConfig,
    sessions: RwLock<HashMap<i64, Arc<PortalSession>>>,
}

impl SessionCache {
    pub fn new(portal: PortalConfig) -> Self {
        Self {
            portal,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Session for a bot, logging in on first use.
    pub async fn get_session(&self, bot: &Bot) -> Result<Arc<PortalSession>> {
        self.get_or_login(bot.id, &bot.portal_username, &bot.portal_password)
            .await
    }

    /// Session for the shared operator identity (invite handling for
    /// the operator mailbox).
    pub async fn get_operator_session(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Arc<PortalSession>> {
        self.get_or_login(OPERATOR_SESSION_KEY, username, password)
            .await
    }

    async fn get_or_login(
        &self,
        key: i64,
        username: &str,
        password: &str,
    ) -> Result<Arc<PortalSession>> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(&key) {
                return Ok(session.clone());
            }
        }

        let session = Arc::new(PortalSession::login(key, username, password, &self.portal).await?);
        let mut sessions = self.sessions.write().await;
        sessions.insert(key, session.clone());
        Ok(session)
    }

    pub async fn invalidate(&self, key: i64) {
        let mut sessions = self.sessions.write().await;
        if sessions.remove(&key).is_some() {
            info!(key, "portal session invalidated");
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const LOGIN_PAGE: &str = r#"
        <html><body><form id="aspnetForm">
        <input type="hidden" name="__VIEWSTATE" value="vs-1" />
        <input type="hidden" name="__EVENTVALIDATION" value="ev-1" />
        </form></body></html>"#;

    fn portal_for(server: &MockServer) -> PortalConfig {
        PortalConfig {
            base_url: server.uri(),
            login_max_attempts: 3,
            ..PortalConfig::default()
        }
    }

    async fn mount_login(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/Login.aspx"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("set-cookie", "ASP.NET_SessionId=abc123; Path=/")
                    .set_body_string(LOGIN_PAGE),
            )
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/Login.aspx"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>inbox</html>"))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_login_succeeds_and_keeps_cookies() {
        let server = MockServer::start().await;
        mount_login(&server).await;

        let session = PortalSession::login(1, "bot@example.com", "pw", &portal_for(&server))
            .await
            .unwrap();
        let pairs = session.cookie_pairs().unwrap();
        assert!(pairs
            .iter()
            .any(|(n, v)| n == "ASP.NET_SessionId" && v == "abc123"));
    }

    #[tokio::test]
    async fn test_login_retries_page_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/Login.aspx"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        mount_login(&server).await;

        let session = PortalSession::login(1, "bot@example.com", "pw", &portal_for(&server)).await;
        assert!(session.is_ok());
    }

    #[tokio::test]
    async fn test_login_gives_up_after_max_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/Login.aspx"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = PortalSession::login(1, "bot@example.com", "pw", &portal_for(&server))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_login_submit_failure_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/Login.aspx"))
            .respond_with(ResponseTemplate::new(200).set_body_string(LOGIN_PAGE))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/Login.aspx"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = PortalSession::login(1, "bot@example.com", "pw", &portal_for(&server))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_get_detects_expired_session() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        Mock::given(method("GET"))
            .and(path("/Inbox.aspx"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let portal = portal_for(&server);
        let session = PortalSession::login(1, "bot@example.com", "pw", &portal)
            .await
            .unwrap();
        let err = session.get(&portal.inbox_url()).await.unwrap_err();
        assert!(matches!(err, Error::SessionExpired));
    }

    #[tokio::test]
    async fn test_cache_reuses_and_invalidates() {
        let server = MockServer::start().await;
        mount_login(&server).await;

        let cache = SessionCache::new(portal_for(&server));
        let bot = Bot {
            id: 7,
            name: "bot-7".into(),
            portal_username: "bot@example.com".into(),
            portal_password: "pw".into(),
            imap_host: String::new(),
            imap_username: String::new(),
            imap_password: String::new(),
            last_seen_message_id: None,
            is_active: true,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };

        let first = cache.get_session(&bot).await.unwrap();
        let second = cache.get_session(&bot).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        cache.invalidate(bot.id).await;
        let third = cache.get_session(&bot).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }
}
