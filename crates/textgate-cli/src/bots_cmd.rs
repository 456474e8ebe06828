//! `textgate bots` — sync bot identities from a JSON config file.
//!
//! The file is the source of truth: listed bots are created or
//! updated in place, bots missing from the file are deactivated (never
//! deleted).

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;

use textgate_core::model::BotSpec;
use textgate_core::Store;

/// Parse the `{"bots": [...]}` config file.
pub fn parse_bot_file(data: &str) -> Result<Vec<BotSpec>> {
    let value: Value = serde_json::from_str(data).context("bot config is not valid JSON")?;
    let bots = value
        .get("bots")
        .and_then(Value::as_array)
        .context("bot config has no \"bots\" array")?;
    bots.iter()
        .map(|bot| serde_json::from_value(bot.clone()).context("invalid bot entry"))
        .collect()
}

pub fn sync(store: &Store, file: &Path) -> Result<()> {
    let data = std::fs::read_to_string(file)
        .with_context(|| format!("reading bot config {}", file.display()))?;
    let specs = parse_bot_file(&data)?;

    let mut names = Vec::new();
    for spec in &specs {
        let existed = store.list_bots()?.iter().any(|b| b.name == spec.name);
        let bot = store.upsert_bot(spec)?;
        names.push(bot.name.clone());
        if existed {
            println!("Updated bot: {}", bot.name);
        } else {
            println!("Created bot: {}", bot.name);
        }
    }

    let deactivated = store.deactivate_bots_not_in(&names)?;
    for name in &deactivated {
        println!("Bot missing in config file: {name}. It has been deactivated.");
    }
    if deactivated.is_empty() {
        println!("All bots in the database are present in the configuration file.");
    }
    Ok(())
}

pub fn list(store: &Store) -> Result<()> {
    for bot in store.list_bots()? {
        println!(
            "{}\t{}\t{}",
            bot.id,
            bot.name,
            if bot.is_active { "active" } else { "inactive" }
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE: &str = r#"{
        "bots": [
            {
                "name": "bot-1",
                "portalUsername": "bot1@example.com",
                "portalPassword": "pw",
                "imapHost": "mail.example.com",
                "imapUsername": "bot1@example.com",
                "imapPassword": "imap-pw",
                "isActive": true
            },
            {
                "name": "bot-2",
                "portalUsername": "bot2@example.com",
                "portalPassword": "pw",
                "imapHost": "mail.example.com",
                "imapUsername": "bot2@example.com",
                "imapPassword": "imap-pw",
                "isActive": false
            }
        ]
    }"#;

    #[test]
    fn test_parse_bot_file() {
        let specs = parse_bot_file(FILE).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].name, "bot-1");
        assert!(specs[0].is_active);
        assert!(!specs[1].is_active);
    }

    #[test]
    fn test_parse_rejects_missing_bots_key() {
        assert!(parse_bot_file("{}").is_err());
        assert!(parse_bot_file("not json").is_err());
    }

    #[test]
    fn test_sync_deactivates_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("t.db")).unwrap();

        // Pre-existing bot not in the file.
        store
            .upsert_bot(&BotSpec {
                name: "old-bot".into(),
                portal_username: "old@example.com".into(),
                portal_password: "pw".into(),
                imap_host: "mail.example.com".into(),
                imap_username: "old@example.com".into(),
                imap_password: "pw".into(),
                is_active: true,
            })
            .unwrap();

        let file = dir.path().join("bots.json");
        std::fs::write(&file, FILE).unwrap();
        sync(&store, &file).unwrap();

        let bots = store.list_bots().unwrap();
        assert_eq!(bots.len(), 3);
        let old = bots.iter().find(|b| b.name == "old-bot").unwrap();
        assert!(!old.is_active);
        let one = bots.iter().find(|b| b.name == "bot-1").unwrap();
        assert!(one.is_active);
    }
}
