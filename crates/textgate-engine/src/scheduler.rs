//! Interval scheduler — drives every active bot's pipeline.
//!
//! Each round re-reads the active bot set from the registry (so
//! activating or deactivating a bot takes effect on the next round),
//! spawns one task per bot, plus the unconditional operator-mailbox
//! invite task. A task takes the bot's named lock non-blockingly,
//! sleeps a uniform start jitter, runs the stages in order, and
//! releases the lock on every path. Stage failures are logged and
//! never escape the task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use textgate_core::config::SchedulerConfig;
use textgate_core::error::Result;
use textgate_core::model::Bot;
use textgate_core::templates::{RenderArgs, TemplateEngine};
use textgate_core::Store;

use crate::dispatch::SmsDispatcher;
use crate::invites::InvitationAcceptor;
use crate::pull::InboxPuller;
use crate::push::ReplyPusher;

/// Distinguishes a tick that ran from one that found the bot busy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    Skipped,
    Ran,
}

static TICKET: AtomicU64 = AtomicU64::new(0);

fn next_holder() -> String {
    format!(
        "worker-{}-{}",
        std::process::id(),
        TICKET.fetch_add(1, Ordering::Relaxed)
    )
}

// ─────────────────────────────────────────────
// Per-bot pipeline
// ─────────────────────────────────────────────

pub struct BotPipeline {
    store: Arc<Store>,
    templates: Arc<TemplateEngine>,
    invites: Arc<InvitationAcceptor>,
    puller: Arc<InboxPuller>,
    pusher: Arc<ReplyPusher>,
    dispatcher: Arc<SmsDispatcher>,
    config: SchedulerConfig,
}

impl BotPipeline {
    pub fn new(
        store: Arc<Store>,
        templates: Arc<TemplateEngine>,
        invites: Arc<InvitationAcceptor>,
        puller: Arc<InboxPuller>,
        pusher: Arc<ReplyPusher>,
        dispatcher: Arc<SmsDispatcher>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            templates,
            invites,
            puller,
            pusher,
            dispatcher,
            config,
        }
    }

    /// One tick for one bot, guarded by its named lock. At most one
    /// pipeline instance runs per bot at any instant.
    pub async fn run_bot_tick(&self, bot: &Bot) -> Result<TickOutcome> {
        let lock_name = format!("bot_lock_{}", bot.id);
        let holder = next_holder();

        if !self
            .store
            .try_acquire_lock(&lock_name, &holder, self.config.lock_lease_secs)?
        {
            warn!(bot_id = bot.id, "bot is already being processed, skipping tick");
            return Ok(TickOutcome::Skipped);
        }

        // Stages never error out of run_stages; the release below runs
        // on every path.
        self.run_stages(bot).await;

        if !self.store.release_lock(&lock_name, &holder)? {
            warn!(bot_id = bot.id, "lock lease expired during tick");
        }
        Ok(TickOutcome::Ran)
    }

    async fn run_stages(&self, bot: &Bot) {
        // Stagger bot starts so parallel ticks don't hit the portal in
        // lockstep.
        let (min, max) = (self.config.jitter_min_secs, self.config.jitter_max_secs);
        if max > 0 && max >= min {
            let jitter = {
                let mut rng = rand::thread_rng();
                rng.gen_range(min..=max)
            };
            debug!(bot_id = bot.id, jitter, "tick start jitter");
            tokio::time::sleep(Duration::from_secs(jitter)).await;
        }

        info!(bot_id = bot.id, name = %bot.name, "bot tick starting");

        match self.invites.run(bot).await {
            Ok(accepted) => {
                for invite in accepted {
                    self.send_welcome(bot, &invite.full_name).await;
                }
            }
            Err(e) => error!(bot_id = bot.id, error = %e, "invitation stage failed"),
        }

        if let Err(e) = self.puller.run(bot).await {
            error!(bot_id = bot.id, error = %e, "inbox pull stage failed");
        }

        if let Err(e) = self.pusher.run(bot).await {
            error!(bot_id = bot.id, error = %e, "reply push stage failed");
        }

        if let Err(e) = self.dispatcher.run(bot).await {
            error!(bot_id = bot.id, error = %e, "sms dispatch stage failed");
        }

        info!(bot_id = bot.id, "bot tick finished");
    }

    /// Welcome mail for a freshly accepted contact.
    async fn send_welcome(&self, bot: &Bot, full_name: &str) {
        let bot_accounts = match self.store.list_bots() {
            Ok(bots) => bots.iter().map(|b| b.portal_username.clone()).collect(),
            Err(e) => {
                error!(error = %e, "failed to list bots for welcome mail");
                Vec::new()
            }
        };
        let args = RenderArgs {
            first_name: full_name.to_string(),
            bot_accounts,
            ..Default::default()
        };
        let content = match self.templates.render("WELCOME_STATUS", &args) {
            Ok(content) => content,
            Err(e) => {
                error!(error = %e, "failed to render welcome mail");
                return;
            }
        };
        if let Err(e) = self.pusher.send_new_message(bot, full_name, &content).await {
            error!(full_name, error = %e, "failed to send welcome mail");
        }
    }
}

// ─────────────────────────────────────────────
// Scheduler loop
// ─────────────────────────────────────────────

pub struct Scheduler {
    store: Arc<Store>,
    pipeline: Arc<BotPipeline>,
    invites: Arc<InvitationAcceptor>,
    config: SchedulerConfig,
    shutdown: Arc<Notify>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        pipeline: Arc<BotPipeline>,
        invites: Arc<InvitationAcceptor>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            pipeline,
            invites,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Run rounds forever (until `stop`), one every interval.
    pub async fn start(&self) -> Result<()> {
        info!(
            interval_secs = self.config.interval_secs,
            "scheduler started"
        );
        loop {
            self.run_round().await;

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(self.config.interval_secs)) => {}
                _ = self.shutdown.notified() => {
                    info!("scheduler shutting down");
                    return Ok(());
                }
            }
        }
    }

    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }

    /// One scheduling round: a task per active bot plus the operator
    /// invite task. The active set is re-read every round, which is
    /// what keeps scheduled work in sync with the registry.
    pub async fn run_round(&self) {
        let bots = match self.store.list_active_bots() {
            Ok(bots) => bots,
            Err(e) => {
                error!(error = %e, "failed to list active bots");
                return;
            }
        };
        debug!(bots = bots.len(), "scheduling round");

        let mut handles = Vec::new();
        for bot in bots {
            let pipeline = self.pipeline.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = pipeline.run_bot_tick(&bot).await {
                    error!(bot_id = bot.id, error = %e, "bot tick errored");
                }
            }));
        }

        let invites = self.invites.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = invites.run_for_operator().await {
                error!(error = %e, "operator invite task failed");
            }
        }));

        for handle in handles {
            let _ = handle.await;
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use textgate_core::config::{
        AlertConfig, MailboxConfig, PortalConfig, SmsConfig, SplashConfig, WebhookConfig,
    };
    use textgate_core::model::BotSpec;
    use textgate_portal::session::SessionCache;
    use textgate_portal::splash::SplashClient;
    use textgate_sms::SmsGateway;

    use crate::commands::CommandInterpreter;
    use crate::notify::AdminNotifier;

    /// Pipeline wired to unreachable local services: every stage fails
    /// fast, which is exactly what the lock tests need.
    fn offline_pipeline(store: Arc<Store>) -> BotPipeline {
        let portal = PortalConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            login_max_attempts: 1,
            ..PortalConfig::default()
        };
        let splash = Arc::new(
            SplashClient::new(
                &SplashConfig {
                    url: "http://127.0.0.1:1/execute".to_string(),
                    ..SplashConfig::default()
                },
                false,
            )
            .unwrap(),
        );
        let sessions = Arc::new(SessionCache::new(portal.clone()));
        let templates = Arc::new(TemplateEngine::new(store.clone()));
        let scheduler_cfg = SchedulerConfig {
            jitter_min_secs: 0,
            jitter_max_secs: 0,
            ..SchedulerConfig::default()
        };

        let pusher = Arc::new(ReplyPusher::new(
            store.clone(),
            sessions.clone(),
            splash.clone(),
            portal.clone(),
            &scheduler_cfg,
        ));
        let interpreter = Arc::new(CommandInterpreter::new(
            store.clone(),
            templates.clone(),
            pusher.clone(),
        ));
        let invites = Arc::new(InvitationAcceptor::new(
            store.clone(),
            sessions.clone(),
            splash.clone(),
            portal.clone(),
            MailboxConfig {
                operator_host: String::new(),
                ..MailboxConfig::default()
            },
            &scheduler_cfg,
        ));
        let puller = Arc::new(InboxPuller::new(
            store.clone(),
            sessions.clone(),
            interpreter,
            portal.clone(),
            true,
        ));
        let dispatcher = Arc::new(SmsDispatcher::new(
            store.clone(),
            Arc::new(SmsGateway::new("http://127.0.0.1:1", "k").unwrap()),
            templates.clone(),
            pusher.clone(),
            Arc::new(AdminNotifier::new(AlertConfig::default())),
            SmsConfig {
                gateway_url: "http://127.0.0.1:1".to_string(),
                retry_delay_secs: 0,
                ..SmsConfig::default()
            },
            WebhookConfig::default(),
        ));

        BotPipeline::new(
            store,
            templates,
            invites,
            puller,
            pusher,
            dispatcher,
            scheduler_cfg,
        )
    }

    fn make_bot(store: &Store) -> Bot {
        store
            .upsert_bot(&BotSpec {
                name: "bot-1".into(),
                portal_username: "bot1@example.com".into(),
                portal_password: "pw".into(),
                imap_host: "127.0.0.1".into(),
                imap_username: "bot1@example.com".into(),
                imap_password: "pw".into(),
                is_active: true,
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_tick_skipped_when_lock_held() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bot = make_bot(&store);
        let pipeline = offline_pipeline(store.clone());

        assert!(store
            .try_acquire_lock(&format!("bot_lock_{}", bot.id), "someone-else", 300)
            .unwrap());

        let outcome = pipeline.run_bot_tick(&bot).await.unwrap();
        assert_eq!(outcome, TickOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_tick_releases_lock_even_when_stages_fail() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bot = make_bot(&store);
        let pipeline = offline_pipeline(store.clone());

        let outcome = pipeline.run_bot_tick(&bot).await.unwrap();
        assert_eq!(outcome, TickOutcome::Ran);

        // Lock is free again.
        assert!(store
            .try_acquire_lock(&format!("bot_lock_{}", bot.id), "next-worker", 300)
            .unwrap());
    }
}
