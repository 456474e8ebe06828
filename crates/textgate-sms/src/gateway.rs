//! HTTP client for the SMS gateway.
//!
//! Three endpoints: `POST /text` (form-encoded send), `GET
//! /status/{textId}`, and `GET /quota/{key}`. Send failures come back
//! as a structured outcome rather than an error so the dispatcher can
//! record a failed SMS and move on.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, error, info};

use textgate_core::error::{Error, Result};

// ─────────────────────────────────────────────
// Wire shapes
// ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    success: bool,
    #[serde(rename = "textId")]
    text_id: Option<String>,
    #[serde(rename = "quotaRemaining")]
    quota_remaining: Option<i64>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QuotaResponse {
    #[serde(default)]
    success: bool,
    #[serde(rename = "quotaRemaining")]
    quota_remaining: Option<i64>,
}

/// Result of an accepted send.
#[derive(Clone, Debug, PartialEq)]
pub struct SendOutcome {
    pub text_id: String,
    pub quota_remaining: Option<i64>,
}

/// Delivery state reported by the status endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Failed,
    Unknown(String),
}

impl DeliveryStatus {
    fn parse(raw: &str) -> Self {
        match raw {
            "SENT" => DeliveryStatus::Sent,
            "DELIVERED" => DeliveryStatus::Delivered,
            "FAILED" => DeliveryStatus::Failed,
            other => DeliveryStatus::Unknown(other.to_string()),
        }
    }
}

// ─────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────

pub struct SmsGateway {
    client: reqwest::Client,
    base_url: String,
    key: String,
}

impl SmsGateway {
    pub fn new(base_url: &str, key: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            key: key.to_string(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Send one message. `Ok(Ok(outcome))` on gateway acceptance,
    /// `Ok(Err(reason))` on gateway rejection, `Err` only on transport
    /// failures.
    pub async fn send(
        &self,
        phone: &str,
        message: &str,
        reply_webhook_url: &str,
        webhook_data: &str,
    ) -> Result<std::result::Result<SendOutcome, String>> {
        let form = [
            ("phone", phone),
            ("message", message),
            ("key", self.key.as_str()),
            ("replyWebhookUrl", reply_webhook_url),
            ("webhookData", webhook_data),
        ];

        let resp = self
            .client
            .post(format!("{}/text", self.base_url))
            .form(&form)
            .send()
            .await?;
        let body: SendResponse = resp
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("unreadable send response: {e}")))?;

        if body.success {
            let text_id = body
                .text_id
                .ok_or_else(|| Error::Protocol("send succeeded without textId".to_string()))?;
            info!(
                text_id = %text_id,
                quota_remaining = ?body.quota_remaining,
                "message accepted by gateway"
            );
            Ok(Ok(SendOutcome {
                text_id,
                quota_remaining: body.quota_remaining,
            }))
        } else {
            let reason = body.error.unwrap_or_else(|| "unspecified".to_string());
            error!(phone, reason = %reason, "gateway rejected send");
            Ok(Err(reason))
        }
    }

    /// Delivery status of a previously sent message.
    pub async fn status(&self, text_id: &str) -> Result<DeliveryStatus> {
        let resp = self
            .client
            .get(format!("{}/status/{}", self.base_url, text_id))
            .send()
            .await?;
        let body: StatusResponse = resp
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("unreadable status response: {e}")))?;

        let status = DeliveryStatus::parse(body.status.as_deref().unwrap_or(""));
        debug!(text_id, status = ?status, "status poll");
        Ok(status)
    }

    /// Remaining send quota for our key.
    pub async fn quota(&self) -> Result<i64> {
        let resp = self
            .client
            .get(format!("{}/quota/{}", self.base_url, self.key))
            .send()
            .await?;
        let body: QuotaResponse = resp
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("unreadable quota response: {e}")))?;

        if !body.success {
            return Err(Error::Transient("quota check unsuccessful".to_string()));
        }
        body.quota_remaining
            .ok_or_else(|| Error::Protocol("quota response without quotaRemaining".to_string()))
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn gateway_for(server: &MockServer) -> SmsGateway {
        SmsGateway::new(&server.uri(), "test-key").unwrap()
    }

    #[tokio::test]
    async fn test_send_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/text"))
            .and(body_string_contains("phone=4024312303"))
            .and(body_string_contains("key=test-key"))
            .and(body_string_contains("webhookData="))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "textId": "12345",
                "quotaRemaining": 40
            })))
            .mount(&server)
            .await;

        let outcome = gateway_for(&server)
            .await
            .send("4024312303", "Hi bugs", "https://hook/sms", "signed")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.text_id, "12345");
        assert_eq!(outcome.quota_remaining, Some(40));
    }

    #[tokio::test]
    async fn test_send_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/text"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "error": "Out of quota"
            })))
            .mount(&server)
            .await;

        let outcome = gateway_for(&server)
            .await
            .send("4024312303", "Hi", "https://hook/sms", "signed")
            .await
            .unwrap();
        assert_eq!(outcome.unwrap_err(), "Out of quota");
    }

    #[tokio::test]
    async fn test_status_parsing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status/12345"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "status": "DELIVERED" })),
            )
            .mount(&server)
            .await;

        let status = gateway_for(&server).await.status("12345").await.unwrap();
        assert_eq!(status, DeliveryStatus::Delivered);
    }

    #[tokio::test]
    async fn test_status_unknown_value() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status/777"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "QUEUED" })))
            .mount(&server)
            .await;

        let status = gateway_for(&server).await.status("777").await.unwrap();
        assert_eq!(status, DeliveryStatus::Unknown("QUEUED".to_string()));
    }

    #[tokio::test]
    async fn test_quota() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/quota/test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "quotaRemaining": 0
            })))
            .mount(&server)
            .await;

        assert_eq!(gateway_for(&server).await.quota().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_quota_failure_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/quota/test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": false })))
            .mount(&server)
            .await;

        let err = gateway_for(&server).await.quota().await.unwrap_err();
        assert!(err.is_transient());
    }
}
