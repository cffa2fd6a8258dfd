//! Shared handles passed to the listener, the command handlers and the notifier.

use crate::notify::Notifier;
use crate::session::Sessions;
use crate::sink::SendSink;
use crate::store::ChatStore;
use octogram_config::Config;
use octogram_octoprint::{Capabilities, FileStorage, HostServices, PrinterControl};
use octogram_policy::PolicyEngine;
use octogram_telegram::{BotApi, Emoji};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{info, warn};

/// Cooperative stop signal shared by every loop of the bridge.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        if !self.is_triggered() {
            info!("Bridge stop requested");
        }
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`Shutdown::trigger`] has been called.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        if rx.wait_for(|stopped| *stopped).await.is_err() {
            warn!("Shutdown channel closed");
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Human readable state of the Telegram connection.
#[derive(Default)]
pub struct ConnectionStatus {
    line: Mutex<String>,
}

impl ConnectionStatus {
    pub fn set(&self, status: impl Into<String>) {
        let status = status.into();
        info!("Bridge status: {}", status);
        if let Ok(mut line) = self.line.lock() {
            *line = status;
        }
    }

    pub fn get(&self) -> String {
        self.line.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

/// Everything a command handler may touch.
pub struct BridgeContext {
    pub config: Config,
    pub api: Arc<dyn BotApi>,
    pub printer: Arc<dyn PrinterControl>,
    pub files: Arc<dyn FileStorage>,
    pub host: Arc<dyn HostServices>,
    pub capabilities: Capabilities,
    pub store: Arc<ChatStore>,
    pub sessions: Sessions,
    pub sink: Arc<SendSink>,
    pub notifier: Arc<Notifier>,
    pub policy: PolicyEngine,
    pub emoji: Emoji,
    pub status: Arc<ConnectionStatus>,
    pub shutdown: Shutdown,
    pub data_dir: PathBuf,
}

impl BridgeContext {
    /// Shorthand for an emoji glyph, empty when icons are disabled.
    pub fn emo(&self, name: &str) -> &'static str {
        self.emoji.get(name)
    }

    /// Permission check against the stored chat record and, in groups, the
    /// sender's own private record.
    pub async fn is_allowed(&self, chat_id: &str, from_id: &str, command: &str, bind_none: bool) -> bool {
        let chat = self.store.get(chat_id).await;
        let sender = if from_id == chat_id {
            None
        } else {
            self.store.get(from_id).await
        };
        self.policy
            .is_command_allowed(chat_id, chat.as_ref(), sender.as_ref(), command, bind_none)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_wakes_waiters() {
        let shutdown = Shutdown::new();
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.wait().await })
        };
        assert!(!shutdown.is_triggered());
        shutdown.trigger();
        waiter.await.expect("join");
        assert!(shutdown.is_triggered());
    }

    #[test]
    fn status_keeps_last_line() {
        let status = ConnectionStatus::default();
        status.set("Connected as @printer_bot");
        assert_eq!(status.get(), "Connected as @printer_bot");
    }
}
