//! Octogram Core
//!
//! Bridge runtime: command handlers, notifications, the Telegram listener
//! and the printer watcher wired around one shared context.

pub mod commands;
pub mod context;
pub mod format;
pub mod listener;
pub mod media;
pub mod notify;
pub mod session;
pub mod sink;
pub mod store;
pub mod upload;
pub mod watcher;

#[cfg(test)]
mod testkit;

use anyhow::{Context as _, Result};
use commands::CommandRegistry;
use context::{BridgeContext, ConnectionStatus, Shutdown};
use listener::Listener;
use media::MediaCapture;
use notify::Notifier;
use octogram_config::Config;
use octogram_ipc::{EventBus, PrinterEvent};
use octogram_octoprint::{Capabilities, FileStorage, HostServices, OctoPrintClient, PrinterControl};
use octogram_policy::PolicyEngine;
use octogram_telegram::{BotApi, Emoji, TelegramClient};
use session::Sessions;
use sink::SendSink;
use std::sync::Arc;
use std::time::Duration;
use store::ChatStore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use watcher::Watcher;

/// How long stopped tasks get to finish their current step.
const STOP_GRACE: Duration = Duration::from_secs(10);

pub struct Bridge {
    ctx: Arc<BridgeContext>,
    registry: Arc<CommandRegistry>,
    events: EventBus,
}

impl Bridge {
    /// Connects the clients, loads the chat store and probes the host's plugins.
    pub async fn from_config(config: Config) -> Result<Self> {
        config.validate()?;

        let octoprint = Arc::new(OctoPrintClient::new(&config.octoprint)?);
        let api: Arc<dyn BotApi> = Arc::new(TelegramClient::new(&config.telegram)?);
        let printer: Arc<dyn PrinterControl> = octoprint.clone();
        let files: Arc<dyn FileStorage> = octoprint.clone();
        let host: Arc<dyn HostServices> = octoprint;

        let data_dir = config.data_dir();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("cannot create data dir {}", data_dir.display()))?;
        let store = Arc::new(ChatStore::open(
            &config.state_path(),
            &config.notifications,
            &commands::permission_keys(),
            &notify::notification_keys(),
        )?);

        let capabilities = Capabilities::detect(host.as_ref()).await;
        info!("Host capabilities: {:?}", capabilities);

        let status = Arc::new(ConnectionStatus::default());
        let shutdown = Shutdown::new();
        let emoji = Emoji::new(config.telegram.send_icon);
        let media = Arc::new(MediaCapture::new(
            config.media.clone(),
            Arc::clone(&host),
            Arc::clone(&printer),
            data_dir.clone(),
        ));
        let sink = Arc::new(SendSink::new(
            Arc::clone(&api),
            Arc::clone(&store),
            Arc::clone(&host),
            media,
            Arc::clone(&status),
        ));
        let notifier = Arc::new(Notifier::new(
            config.notifications.clone(),
            Arc::clone(&printer),
            Arc::clone(&files),
            Arc::clone(&host),
            capabilities.clone(),
            Arc::clone(&store),
            Arc::clone(&sink),
            emoji,
            shutdown.clone(),
        ));

        let ctx = BridgeContext {
            policy: PolicyEngine::new(Some(&config.notifications)),
            config,
            api,
            printer,
            files,
            host,
            capabilities,
            store,
            sessions: Sessions::default(),
            sink,
            notifier,
            emoji,
            status,
            shutdown,
            data_dir,
        };
        Ok(Self::from_context(Arc::new(ctx)))
    }

    pub fn from_context(ctx: Arc<BridgeContext>) -> Self {
        Self {
            ctx,
            registry: Arc::new(CommandRegistry::new()),
            events: EventBus::new(),
        }
    }

    pub fn context(&self) -> &Arc<BridgeContext> {
        &self.ctx
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn shutdown(&self) -> Shutdown {
        self.ctx.shutdown.clone()
    }

    /// Publishes the command menu and refreshes every known chat picture.
    pub async fn prepare(&self) {
        let commands = self.registry.bot_commands(&self.ctx.capabilities);
        self.ctx.sink.publish_commands(&commands).await;
        for (chat_id, _) in self.ctx.store.all().await {
            listener::update_picture(&self.ctx, &chat_id).await;
        }
    }

    /// Runs listener, watcher and event pump until shutdown.
    pub async fn run(&self) -> Result<()> {
        info!("Octogram bridge starting...");
        self.prepare().await;

        let shutdown = self.shutdown();
        let tasks = vec![
            tokio::spawn(Listener::new(Arc::clone(&self.ctx), Arc::clone(&self.registry)).run()),
            tokio::spawn(
                Watcher::new(
                    Arc::clone(&self.ctx.printer),
                    self.events.clone(),
                    &self.ctx.config.watcher,
                )
                .run(shutdown.clone()),
            ),
            tokio::spawn(watcher::pump(
                Arc::clone(&self.ctx.notifier),
                self.events.subscribe(),
                shutdown.clone(),
            )),
        ];

        shutdown.wait().await;
        info!("Shutdown requested");
        self.finish().await;
        join_all(tasks).await;
        info!("Octogram bridge stopped");
        Ok(())
    }

    /// Says goodbye to subscribed chats and stops all outgoing traffic.
    pub async fn finish(&self) {
        self.ctx
            .notifier
            .on_event(&PrinterEvent::new("PrinterShutdown"))
            .await;
        self.ctx.sink.disable();
    }
}

async fn join_all(tasks: Vec<JoinHandle<()>>) {
    for task in tasks {
        match tokio::time::timeout(STOP_GRACE, task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Bridge task failed: {}", e),
            Err(_) => warn!("Bridge task did not stop within {}s", STOP_GRACE.as_secs()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{BotCall, Harness};
    use octogram_ipc::OutboundMessage;

    #[tokio::test]
    async fn prepare_publishes_the_command_menu() {
        let h = Harness::new().await;
        h.add_chat("42", false).await;
        let bridge = Bridge::from_context(Arc::clone(&h.ctx));
        bridge.prepare().await;

        let published = h.bot.calls().into_iter().find_map(|call| match call {
            BotCall::SetCommands(commands) => Some(commands),
            _ => None,
        });
        let published = published.unwrap_or_default();
        assert!(published.iter().any(|c| c.command == "status"));
        assert_eq!(
            h.ctx.store.get("42").await.map(|r| r.image),
            Some(listener::DEFAULT_PICTURE.to_string())
        );
    }

    #[tokio::test]
    async fn finish_announces_shutdown_and_mutes_the_sink() {
        let h = Harness::new().await;
        h.add_chat("42", true).await;
        let bridge = Bridge::from_context(Arc::clone(&h.ctx));
        bridge.finish().await;
        assert_eq!(h.bot.sent_chats(), vec!["42"]);
        assert!(!h.ctx.sink.is_enabled());

        h.ctx.sink.send(OutboundMessage::to_chat("late", "42")).await;
        assert_eq!(h.bot.sent_chats(), vec!["42"]);
    }

    #[tokio::test]
    async fn run_returns_once_shutdown_is_triggered() {
        let h = Harness::new().await;
        h.ctx.shutdown.trigger();
        let bridge = Bridge::from_context(Arc::clone(&h.ctx));
        let stopped = tokio::time::timeout(Duration::from_secs(5), bridge.run()).await;
        assert!(matches!(stopped, Ok(Ok(()))));
    }
}
