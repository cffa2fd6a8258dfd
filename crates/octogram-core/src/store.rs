//! Chat registry and wizard-edited settings, persisted after every change.

use anyhow::Result;
use octogram_config::{BridgeState, ChatRecord, NotificationsConfig};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{info, warn};

pub struct ChatStore {
    state: Mutex<BridgeState>,
    path: Option<PathBuf>,
    /// Chats that asked for silence until the current print ends. Never persisted.
    muted: Mutex<HashSet<String>>,
}

impl ChatStore {
    /// Loads the state file (seeding it from the notification defaults when missing)
    /// and migrates every chat record onto the current command and event sets.
    pub fn open(
        path: &Path,
        defaults: &NotificationsConfig,
        commands: &[&str],
        notifications: &[&str],
    ) -> Result<Self> {
        let (mut state, fresh) = match BridgeState::load(path)? {
            Some(state) => (state, false),
            None => {
                info!("No bridge state at {}, starting fresh", path.display());
                (BridgeState::seeded(defaults), true)
            }
        };
        if state.migrate(commands, notifications) || fresh {
            state.save(path)?;
        }
        info!("Loaded {} known chat(s)", state.chats.len());

        Ok(Self {
            state: Mutex::new(state),
            path: Some(path.to_path_buf()),
            muted: Mutex::new(HashSet::new()),
        })
    }

    /// Store without a backing file.
    pub fn in_memory(state: BridgeState) -> Self {
        Self {
            state: Mutex::new(state),
            path: None,
            muted: Mutex::new(HashSet::new()),
        }
    }

    fn persist(&self, state: &BridgeState) -> Result<()> {
        match &self.path {
            Some(path) => state.save(path),
            None => Ok(()),
        }
    }

    pub async fn get(&self, chat_id: &str) -> Option<ChatRecord> {
        self.state.lock().await.chats.get(chat_id).cloned()
    }

    pub async fn contains(&self, chat_id: &str) -> bool {
        self.state.lock().await.chats.contains_key(chat_id)
    }

    pub async fn upsert(&self, chat_id: &str, record: ChatRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        state.chats.insert(chat_id.to_string(), record);
        self.persist(&state)
    }

    /// Returns whether the chat existed.
    pub async fn delete(&self, chat_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let existed = state.chats.remove(chat_id).is_some();
        if existed {
            self.persist(&state)?;
        }
        self.muted.lock().await.remove(chat_id);
        Ok(existed)
    }

    pub async fn all(&self) -> Vec<(String, ChatRecord)> {
        self.state
            .lock()
            .await
            .chats
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect()
    }

    /// Applies `change` to the state and saves it.
    pub async fn update<R>(&self, change: impl FnOnce(&mut BridgeState) -> R) -> Result<R> {
        let mut state = self.state.lock().await;
        let result = change(&mut state);
        self.persist(&state)?;
        Ok(result)
    }

    /// Like [`ChatStore::update`] for a single chat; `None` when the chat is unknown.
    pub async fn update_chat<R>(
        &self,
        chat_id: &str,
        change: impl FnOnce(&mut ChatRecord) -> R,
    ) -> Result<Option<R>> {
        let mut state = self.state.lock().await;
        let Some(record) = state.chats.get_mut(chat_id) else {
            return Ok(None);
        };
        let result = change(record);
        self.persist(&state)?;
        Ok(Some(result))
    }

    pub async fn snapshot(&self) -> BridgeState {
        self.state.lock().await.clone()
    }

    pub async fn notification_height(&self) -> f64 {
        self.state.lock().await.notification_height
    }

    pub async fn notification_time(&self) -> i64 {
        self.state.lock().await.notification_time
    }

    pub async fn send_gif(&self) -> bool {
        self.state.lock().await.send_gif
    }

    pub async fn file_order(&self) -> bool {
        self.state.lock().await.file_order
    }

    pub async fn mute(&self, chat_id: &str) {
        self.muted.lock().await.insert(chat_id.to_string());
    }

    pub async fn unmute(&self, chat_id: &str) -> bool {
        self.muted.lock().await.remove(chat_id)
    }

    pub async fn is_muted(&self, chat_id: &str) -> bool {
        self.muted.lock().await.contains(chat_id)
    }

    pub async fn clear_muted(&self) {
        let mut muted = self.muted.lock().await;
        if !muted.is_empty() {
            info!("Clearing {} muted chat(s)", muted.len());
            muted.clear();
        }
    }
}

/// Logs and swallows a persistence failure; chat flows continue with the in-memory state.
pub(crate) fn log_save_error(result: Result<()>, what: &str) {
    if let Err(e) = result {
        warn!("Failed to save bridge state after {}: {}", what, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMMANDS: &[&str] = &["/status", "/print"];
    const EVENTS: &[&str] = &["PrintDone"];

    #[tokio::test]
    async fn open_seeds_and_persists_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        let defaults = NotificationsConfig::default();

        let store = ChatStore::open(&path, &defaults, COMMANDS, EVENTS).expect("open");
        assert!(path.exists());
        store
            .upsert("42", ChatRecord::new(COMMANDS, EVENTS))
            .await
            .expect("upsert");
        store
            .update(|state| state.notification_height = 2.5)
            .await
            .expect("update");

        let reopened = ChatStore::open(&path, &defaults, COMMANDS, EVENTS).expect("reopen");
        assert!(reopened.contains("42").await);
        assert_eq!(reopened.notification_height().await, 2.5);
    }

    #[tokio::test]
    async fn update_chat_ignores_unknown_chats() {
        let store = ChatStore::in_memory(BridgeState::seeded(&NotificationsConfig::default()));
        let outcome = store
            .update_chat("7", |chat| chat.accept_commands = true)
            .await
            .expect("update");
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn mute_set_is_cleared_and_delete_unmutes() {
        let store = ChatStore::in_memory(BridgeState::seeded(&NotificationsConfig::default()));
        store.upsert("1", ChatRecord::new(COMMANDS, EVENTS)).await.expect("upsert");
        store.mute("1").await;
        store.mute("2").await;
        assert!(store.is_muted("1").await);

        assert!(store.delete("1").await.expect("delete"));
        assert!(!store.is_muted("1").await);

        store.clear_muted().await;
        assert!(!store.is_muted("2").await);
    }
}
