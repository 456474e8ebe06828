//! `textgate seed-test-db` — fixtures for exercising the pipeline
//! locally: one user with a contact, plus a batch of pulled emails and
//! inbound SMS rows ready for the push/dispatch stages.

use anyhow::Result;

use textgate_core::model::{BotSpec, ContactDetail, NewEmail, NewSms, SmsDirection, SmsStatus};
use textgate_core::Store;

const SEED_MESSAGE_IDS: &[&str] = &[
    "3736625367",
    "3736550349",
    "3736435606",
    "3736414498",
    "3736366249",
    "3735333329",
];

pub fn seed(store: &Store) -> Result<()> {
    let bot = match store.list_bots()?.into_iter().next() {
        Some(bot) => bot,
        None => {
            println!("No bots found, creating inactive seed-bot.");
            store.upsert_bot(&BotSpec {
                name: "seed-bot".into(),
                portal_username: "seed-bot@example.com".into(),
                portal_password: "seed".into(),
                imap_host: "mail.example.com".into(),
                imap_username: "seed-bot@example.com".into(),
                imap_password: "seed".into(),
                is_active: false,
            })?
        }
    };

    let (user, created) = store.get_or_create_user("15372010", "COOK ZACHARY")?;
    if !created {
        println!("User with pic_number 15372010 already exists.");
        return Ok(());
    }
    println!("Created user with pic_number 15372010.");

    let (contact, _) = store.upsert_contact(
        user.id,
        "Bradley Roth",
        &ContactDetail::Phone("4024312303".into()),
    )?;
    println!("Created contact for user {}.", user.display_name);

    for message_id in SEED_MESSAGE_IDS {
        let Some(email) = store.insert_email(&NewEmail {
            bot_id: bot.id,
            user_id: user.id,
            message_id: (*message_id).to_string(),
            sent_at: "7/10/2024 3:15:00 PM".to_string(),
            subject: format!("Subject {message_id}"),
            body: format!(
                "Send message to {}",
                contact.phone_number.as_deref().unwrap_or("")
            ),
        })?
        else {
            continue;
        };

        store.insert_sms(&NewSms {
            bot_id: bot.id,
            contact_id: contact.id,
            email_id: email.id,
            phone_number: contact.phone_number.clone().unwrap_or_default(),
            message: format!("This is a test message for {message_id}"),
            text_id: Some(format!("text-{message_id}")),
            direction: SmsDirection::Inbound,
            status: SmsStatus::Sent,
        })?;
    }

    println!("Successfully seeded DB with data.");
    Ok(())
}
