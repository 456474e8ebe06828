//! Textgate CLI — entry point.
//!
//! # Commands
//!
//! - `textgate bots sync --file bots.json` — sync bot identities
//! - `textgate templates seed` — write the default response templates
//! - `textgate run <stage> --bot-id N` — one-shot run of one stage
//! - `textgate schedule` — the interval scheduler (the long-running mode)
//! - `textgate serve` — the inbound SMS webhook server
//! - `textgate seed-test-db` — local test fixtures

mod bots_cmd;
mod runtime;
mod seed_cmd;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use textgate_core::config::load_config;
use textgate_core::model::Bot;
use textgate_core::templates::TemplateEngine;
use textgate_server::AppState;

use runtime::Runtime;

// ─────────────────────────────────────────────
// CLI definition
// ─────────────────────────────────────────────

/// Textgate — portal-to-SMS bridge engine
#[derive(Parser)]
#[command(name = "textgate", version, about, long_about = None)]
struct Cli {
    /// Path to the config file (default: textgate.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true, default_value_t = false)]
    logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage bot identities
    Bots {
        #[command(subcommand)]
        action: BotsCommands,
    },

    /// Manage response templates
    Templates {
        #[command(subcommand)]
        action: TemplatesCommands,
    },

    /// Run a single pipeline stage for one bot
    Run {
        #[command(subcommand)]
        stage: RunCommands,
    },

    /// Run the interval scheduler over all active bots
    Schedule,

    /// Run the inbound SMS webhook server
    Serve,

    /// Seed the database with test fixtures
    SeedTestDb,
}

#[derive(Subcommand)]
enum BotsCommands {
    /// Create/update bots from a JSON file; bots missing from the file
    /// are deactivated
    Sync {
        /// Path to the bot config file
        #[arg(long)]
        file: PathBuf,
    },
    /// List known bots
    List,
}

#[derive(Subcommand)]
enum TemplatesCommands {
    /// Write the default response templates (update-or-create)
    Seed,
}

#[derive(Subcommand)]
enum RunCommands {
    /// Accept pending invitations from the bot's mailbox
    Invites {
        #[arg(long)]
        bot_id: i64,
    },
    /// Pull new messages from the bot's portal inbox
    Pull {
        #[arg(long)]
        bot_id: i64,
    },
    /// Push unprocessed inbound SMS back into the portal
    Push {
        #[arg(long)]
        bot_id: i64,
    },
    /// Dispatch unprocessed emails as outbound SMS
    Dispatch {
        #[arg(long)]
        bot_id: i64,
    },
    /// Compose a new portal message addressed by name
    NewMessage {
        #[arg(long)]
        bot_id: i64,
        #[arg(long)]
        pic_name: String,
        #[arg(long)]
        message: String,
    },
}

// ─────────────────────────────────────────────
// Entrypoint
// ─────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.logs);

    let config = load_config(cli.config.as_deref());
    let runtime = Runtime::build(config).context("failed to build runtime")?;

    match cli.command {
        Commands::Bots { action } => match action {
            BotsCommands::Sync { file } => bots_cmd::sync(&runtime.store, &file),
            BotsCommands::List => bots_cmd::list(&runtime.store),
        },
        Commands::Templates { action } => match action {
            TemplatesCommands::Seed => {
                let created = TemplateEngine::seed_defaults(&runtime.store)?;
                println!("Seeded templates ({created} newly created).");
                Ok(())
            }
        },
        Commands::Run { stage } => run_stage(&runtime, stage).await,
        Commands::Schedule => {
            info!("starting scheduler");
            runtime.scheduler().start().await?;
            Ok(())
        }
        Commands::Serve => {
            let state = AppState {
                store: runtime.store.clone(),
                signing_secret: runtime.config.webhook.signing_secret.clone(),
                token_max_age_secs: runtime.config.webhook.token_max_age_secs,
                test_mode: runtime.config.test_mode,
            };
            textgate_server::run_server(
                state,
                &runtime.config.webhook.host,
                runtime.config.webhook.port,
            )
            .await?;
            Ok(())
        }
        Commands::SeedTestDb => seed_cmd::seed(&runtime.store),
    }
}

async fn run_stage(runtime: &Runtime, stage: RunCommands) -> Result<()> {
    match stage {
        RunCommands::Invites { bot_id } => {
            let bot = load_bot(runtime, bot_id)?;
            let accepted = runtime.invites.run(&bot).await?;
            for invite in &accepted {
                println!("Accepted invite {} for {}", invite.code, invite.full_name);
            }
            println!("{} invitation(s) accepted.", accepted.len());
            Ok(())
        }
        RunCommands::Pull { bot_id } => {
            let bot = load_bot(runtime, bot_id)?;
            let saved = runtime.puller.run(&bot).await?;
            println!("Pulled {saved} new message(s).");
            Ok(())
        }
        RunCommands::Push { bot_id } => {
            let bot = load_bot(runtime, bot_id)?;
            runtime.pusher.run(&bot).await?;
            println!("Reply push pass finished.");
            Ok(())
        }
        RunCommands::Dispatch { bot_id } => {
            let bot = load_bot(runtime, bot_id)?;
            runtime.dispatcher.run(&bot).await?;
            println!("Dispatch pass finished.");
            Ok(())
        }
        RunCommands::NewMessage {
            bot_id,
            pic_name,
            message,
        } => {
            let bot = load_bot(runtime, bot_id)?;
            runtime.pusher.send_new_message(&bot, &pic_name, &message).await?;
            println!("New message sent to {pic_name}.");
            Ok(())
        }
    }
}

fn load_bot(runtime: &Runtime, bot_id: i64) -> Result<Bot> {
    match runtime.store.get_bot(bot_id)? {
        Some(bot) => Ok(bot),
        None => bail!("no bot with id {bot_id}"),
    }
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
