//! Component wiring — one place that turns a [`Config`] into the live
//! object graph every command uses.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use textgate_core::config::Config;
use textgate_core::templates::TemplateEngine;
use textgate_core::Store;
use textgate_engine::commands::CommandInterpreter;
use textgate_engine::dispatch::SmsDispatcher;
use textgate_engine::invites::InvitationAcceptor;
use textgate_engine::notify::AdminNotifier;
use textgate_engine::pull::InboxPuller;
use textgate_engine::push::ReplyPusher;
use textgate_engine::scheduler::{BotPipeline, Scheduler};
use textgate_portal::session::SessionCache;
use textgate_portal::splash::SplashClient;
use textgate_sms::SmsGateway;

pub struct Runtime {
    pub config: Config,
    pub store: Arc<Store>,
    pub templates: Arc<TemplateEngine>,
    pub invites: Arc<InvitationAcceptor>,
    pub puller: Arc<InboxPuller>,
    pub pusher: Arc<ReplyPusher>,
    pub dispatcher: Arc<SmsDispatcher>,
    pub pipeline: Arc<BotPipeline>,
}

impl Runtime {
    pub fn build(config: Config) -> Result<Self> {
        let store = Arc::new(
            Store::open(Path::new(&config.database.path))
                .with_context(|| format!("opening database {}", config.database.path))?,
        );
        let templates = Arc::new(TemplateEngine::new(store.clone()));
        let sessions = Arc::new(SessionCache::new(config.portal.clone()));
        let splash = Arc::new(SplashClient::new(&config.splash, config.test_mode)?);

        // Test mode sends on the gateway's unbilled test key.
        let gateway_key = if config.test_mode && !config.sms.test_key.is_empty() {
            config.sms.test_key.clone()
        } else {
            config.sms.api_key.clone()
        };
        let gateway = Arc::new(SmsGateway::new(&config.sms.gateway_url, &gateway_key)?);

        let pusher = Arc::new(ReplyPusher::new(
            store.clone(),
            sessions.clone(),
            splash.clone(),
            config.portal.clone(),
            &config.scheduler,
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
            config.portal.clone(),
            config.mailbox.clone(),
            &config.scheduler,
        ));
        let puller = Arc::new(InboxPuller::new(
            store.clone(),
            sessions.clone(),
            interpreter,
            config.portal.clone(),
            config.test_mode,
        ));
        let dispatcher = Arc::new(SmsDispatcher::new(
            store.clone(),
            gateway,
            templates.clone(),
            pusher.clone(),
            Arc::new(AdminNotifier::new(config.alerts.clone())),
            config.sms.clone(),
            config.webhook.clone(),
        ));
        let pipeline = Arc::new(BotPipeline::new(
            store.clone(),
            templates.clone(),
            invites.clone(),
            puller.clone(),
            pusher.clone(),
            dispatcher.clone(),
            config.scheduler.clone(),
        ));

        Ok(Self {
            config,
            store,
            templates,
            invites,
            puller,
            pusher,
            dispatcher,
            pipeline,
        })
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.store.clone(),
            self.pipeline.clone(),
            self.invites.clone(),
            self.config.scheduler.clone(),
        )
    }
}
