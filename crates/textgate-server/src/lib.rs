//! Inbound SMS webhook.
//!
//! The gateway calls `POST /sms` with the reply (or delivery event) for
//! an outbound message. The handler authenticates the signed token it
//! attached on send, pairs the callback to the newest outbound SMS with
//! that text id, and records the inbound leg the reply pusher consumes
//! on the next tick. Replays of an already-paired text id are rejected
//! without touching the database.

use std::fmt;
use std::sync::Arc;

use actix_web::{web, App, HttpResponse, HttpServer, ResponseError};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use textgate_core::error::Error;
use textgate_core::model::{NewSms, SmsDirection, SmsStatus};
use textgate_core::Store;
use textgate_sms::token;

// ─────────────────────────────────────────────
// State and error mapping
// ─────────────────────────────────────────────

pub struct AppState {
    pub store: Arc<Store>,
    pub signing_secret: String,
    pub token_max_age_secs: i64,
    pub test_mode: bool,
}

/// Webhook-facing error: carries the taxonomy error and renders the
/// status and body the gateway expects.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self.0 {
            Error::UnknownTextId(_) => StatusCode::BAD_REQUEST,
            Error::InvalidSignature => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        match &self.0 {
            Error::UnknownTextId(text_id) => {
                warn!(text_id = %text_id, "webhook for unknown text id");
                HttpResponse::BadRequest().json(json!({ "email": false, "contact": false }))
            }
            Error::InvalidSignature => {
                warn!("webhook with invalid or expired token");
                HttpResponse::Forbidden().json(json!({ "error": "Invalid or expired token" }))
            }
            other => {
                error!(error = %other, "webhook internal error");
                HttpResponse::InternalServerError().json(json!({ "error": other.to_string() }))
            }
        }
    }
}

// ─────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    #[serde(rename = "textId")]
    pub text_id: Option<String>,
    #[serde(rename = "fromNumber")]
    pub from_number: Option<String>,
    pub text: Option<String>,
    pub data: Option<String>,
}

pub async fn sms_webhook(
    state: web::Data<AppState>,
    payload: web::Json<WebhookPayload>,
) -> Result<HttpResponse, ApiError> {
    let text_id = payload
        .text_id
        .clone()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Error::UnknownTextId("<missing>".to_string()))?;

    if !state.test_mode {
        let data = payload
            .data
            .as_deref()
            .ok_or(Error::InvalidSignature)?;
        token::verify(data, &state.signing_secret, state.token_max_age_secs)?;
    }

    let outbound = state
        .store
        .latest_outbound_by_text_id(&text_id)?
        .ok_or_else(|| Error::UnknownTextId(text_id.clone()))?;

    // Replay of an already-paired callback: reject without a write.
    if state.store.has_inbound_for_text_id(&text_id)? {
        return Err(ApiError(Error::UnknownTextId(text_id)));
    }

    let email = state
        .store
        .get_email(outbound.email_id)?
        .ok_or_else(|| Error::Protocol(format!("outbound sms {} without email", outbound.id)))?;
    let contact = state
        .store
        .get_contact(outbound.contact_id)?
        .ok_or_else(|| Error::Protocol(format!("outbound sms {} without contact", outbound.id)))?;

    let inbound = state.store.insert_sms(&NewSms {
        bot_id: outbound.bot_id,
        contact_id: contact.id,
        email_id: email.id,
        phone_number: payload.from_number.clone().unwrap_or_default(),
        message: payload.text.clone().unwrap_or_default(),
        text_id: Some(text_id.clone()),
        direction: SmsDirection::Inbound,
        status: SmsStatus::Delivered,
    })?;

    info!(
        text_id = %text_id,
        inbound_id = inbound.id,
        bot_id = outbound.bot_id,
        "inbound sms recorded"
    );

    Ok(HttpResponse::Ok().json(json!({
        "email": email.message_id,
        "contact": contact.contact_name,
    })))
}

/// Liveness probe, registered in test mode only.
pub async fn api_test() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "message": "API is working." }))
}

// ─────────────────────────────────────────────
// Server
// ─────────────────────────────────────────────

pub async fn run_server(state: AppState, host: &str, port: u16) -> std::io::Result<()> {
    let test_mode = state.test_mode;
    let state = web::Data::new(state);
    info!(host, port, "webhook server starting");

    HttpServer::new(move || {
        let app = App::new()
            .app_data(state.clone())
            .route("/sms", web::post().to(sms_webhook));
        if test_mode {
            app.route("/sms/test", web::get().to(api_test))
        } else {
            app
        }
    })
    .bind((host, port))?
    .run()
    .await
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test};
    use textgate_core::model::{BotSpec, ContactDetail, NewEmail};

    const SECRET: &str = "hook-secret";

    fn seeded_store() -> Arc<Store> {
        let store = Arc::new(Store::open_in_memory().unwrap());
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
        let (contact, _) = store
            .upsert_contact(user.id, "Daffy", &ContactDetail::Phone("4024312303".into()))
            .unwrap();
        let email = store
            .insert_email(&NewEmail {
                bot_id: bot.id,
                user_id: user.id,
                message_id: "3706018280".into(),
                sent_at: "7/10/2024 3:15:00 PM".into(),
                subject: "4024312303".into(),
                body: "Hi bugs".into(),
            })
            .unwrap()
            .unwrap();
        store
            .insert_sms(&NewSms {
                bot_id: bot.id,
                contact_id: contact.id,
                email_id: email.id,
                phone_number: "4024312303".into(),
                message: "Hi bugs".into(),
                text_id: Some("txt-1".into()),
                direction: SmsDirection::Outbound,
                status: SmsStatus::Sent,
            })
            .unwrap();
        store
    }

    fn app_state(store: Arc<Store>, test_mode: bool) -> web::Data<AppState> {
        web::Data::new(AppState {
            store,
            signing_secret: SECRET.to_string(),
            token_max_age_secs: 86_400,
            test_mode,
        })
    }

    macro_rules! make_app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data($state)
                    .route("/sms", web::post().to(sms_webhook))
                    .route("/sms/test", web::get().to(api_test)),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn test_pairs_inbound_to_outbound() {
        let store = seeded_store();
        let app = make_app!(app_state(store.clone(), true));

        let resp = test::TestRequest::post()
            .uri("/sms")
            .set_json(json!({
                "textId": "txt-1",
                "fromNumber": "4024312303",
                "text": "Reply from outside"
            }))
            .send_request(&app)
            .await;

        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["email"], "3706018280");
        assert_eq!(body["contact"], "Daffy");

        let inbound = store.unprocessed_inbound_sms(1).unwrap();
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].message, "Reply from outside");
        assert_eq!(inbound[0].phone_number, "4024312303");
        assert_eq!(inbound[0].status, SmsStatus::Delivered);
    }

    #[actix_web::test]
    async fn test_unknown_text_id_is_400_without_writes() {
        let store = seeded_store();
        let app = make_app!(app_state(store.clone(), true));

        let resp = test::TestRequest::post()
            .uri("/sms")
            .set_json(json!({ "textId": "ghost", "fromNumber": "1", "text": "x" }))
            .send_request(&app)
            .await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["email"], false);
        assert_eq!(body["contact"], false);
        assert!(store.unprocessed_inbound_sms(1).unwrap().is_empty());
    }

    #[actix_web::test]
    async fn test_replay_is_a_noop() {
        let store = seeded_store();
        let app = make_app!(app_state(store.clone(), true));

        let payload = json!({ "textId": "txt-1", "fromNumber": "4024312303", "text": "hi" });
        let first = test::TestRequest::post()
            .uri("/sms")
            .set_json(payload.clone())
            .send_request(&app)
            .await;
        assert_eq!(first.status(), StatusCode::OK);

        let second = test::TestRequest::post()
            .uri("/sms")
            .set_json(payload)
            .send_request(&app)
            .await;
        assert_eq!(second.status(), StatusCode::BAD_REQUEST);
        assert_eq!(store.unprocessed_inbound_sms(1).unwrap().len(), 1);
    }

    #[actix_web::test]
    async fn test_missing_token_is_403_outside_test_mode() {
        let store = seeded_store();
        let app = make_app!(app_state(store.clone(), false));

        let resp = test::TestRequest::post()
            .uri("/sms")
            .set_json(json!({ "textId": "txt-1", "fromNumber": "1", "text": "x" }))
            .send_request(&app)
            .await;

        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "Invalid or expired token");
    }

    #[actix_web::test]
    async fn test_bad_token_is_403() {
        let store = seeded_store();
        let app = make_app!(app_state(store, false));

        let resp = test::TestRequest::post()
            .uri("/sms")
            .set_json(json!({
                "textId": "txt-1",
                "fromNumber": "1",
                "text": "x",
                "data": "not-a-valid-token"
            }))
            .send_request(&app)
            .await;

        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[actix_web::test]
    async fn test_valid_token_accepted() {
        let store = seeded_store();
        let app = make_app!(app_state(store, false));
        let data = token::sign("1:1", SECRET).unwrap();

        let resp = test::TestRequest::post()
            .uri("/sms")
            .set_json(json!({
                "textId": "txt-1",
                "fromNumber": "4024312303",
                "text": "hi",
                "data": data
            }))
            .send_request(&app)
            .await;

        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn test_health_probe() {
        let store = seeded_store();
        let app = make_app!(app_state(store, true));

        let resp = test::TestRequest::get()
            .uri("/sms/test")
            .send_request(&app)
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["message"], "API is working.");
    }
}
