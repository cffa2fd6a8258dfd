//! Persisted bridge state: chat registry and values edited from chat.

use crate::NotificationsConfig;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

pub const STATE_VERSION: u32 = 6;

/// Placeholder entry older releases kept at the end of the chat table.
const LEGACY_BOTTOM_MARKER: &str = "zBOTTOMOFCHATS";

const RENAMED_COMMANDS: &[(&str, &str)] = &[
    ("/list", "/files"),
    ("/imsorrydontshutup", "/dontshutup"),
];

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatRecord {
    #[serde(default)]
    pub title: String,
    #[serde(default, rename = "type")]
    pub chat_type: String,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub accept_commands: bool,
    #[serde(default)]
    pub send_notifications: bool,
    #[serde(default)]
    pub allow_users: bool,
    #[serde(default = "default_true")]
    pub new: bool,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub commands: BTreeMap<String, bool>,
    #[serde(default)]
    pub notifications: BTreeMap<String, bool>,
}

impl ChatRecord {
    /// Fresh record with every command and notification switched off.
    pub fn new(commands: &[&str], notifications: &[&str]) -> Self {
        Self {
            title: String::new(),
            chat_type: String::new(),
            private: true,
            accept_commands: false,
            send_notifications: false,
            allow_users: false,
            new: true,
            image: String::new(),
            commands: commands.iter().map(|c| (c.to_string(), false)).collect(),
            notifications: notifications
                .iter()
                .map(|n| (n.to_string(), false))
                .collect(),
        }
    }

    pub fn command_enabled(&self, command: &str) -> bool {
        self.commands.get(command).copied().unwrap_or(false)
    }

    pub fn notification_enabled(&self, event: &str) -> bool {
        self.notifications.get(event).copied().unwrap_or(false)
    }

    /// Prunes stale keys and adds missing ones as `false`. Returns true when anything changed.
    pub fn sync_keys(&mut self, commands: &[&str], notifications: &[&str]) -> bool {
        let before_commands = self.commands.len();
        let before_notifications = self.notifications.len();
        let mut changed = false;

        self.commands.retain(|k, _| commands.contains(&k.as_str()));
        self.notifications
            .retain(|k, _| notifications.contains(&k.as_str()));
        changed |= before_commands != self.commands.len();
        changed |= before_notifications != self.notifications.len();

        for command in commands {
            if !self.commands.contains_key(*command) {
                self.commands.insert(command.to_string(), false);
                changed = true;
            }
        }
        for event in notifications {
            if !self.notifications.contains_key(*event) {
                self.notifications.insert(event.to_string(), false);
                changed = true;
            }
        }
        changed
    }
}

/// Groups and channels have negative identifiers.
pub fn is_group_chat(chat_id: &str) -> bool {
    chat_id.trim().parse::<i64>().map(|id| id < 0).unwrap_or(false)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeState {
    #[serde(default)]
    pub settings_version: u32,
    #[serde(default)]
    pub chats: BTreeMap<String, ChatRecord>,
    #[serde(default)]
    pub notification_height: f64,
    #[serde(default)]
    pub notification_time: i64,
    #[serde(default)]
    pub send_gif: bool,
    /// Sort files by upload date (true) or by name (false).
    #[serde(default)]
    pub file_order: bool,
}

impl BridgeState {
    pub fn seeded(notifications: &NotificationsConfig) -> Self {
        Self {
            settings_version: STATE_VERSION,
            chats: BTreeMap::new(),
            notification_height: notifications.height,
            notification_time: notifications.time,
            send_gif: notifications.send_gif,
            file_order: false,
        }
    }

    /// Reads the state file. A missing file yields `Ok(None)`.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(anyhow!("failed to read state {}: {}", path.display(), e)),
        };
        let state: BridgeState = serde_json::from_str(&content)
            .map_err(|e| anyhow!("failed to parse state {}: {}", path.display(), e))?;
        Ok(Some(state))
    }

    /// Writes the state through a temporary file so a crash never leaves half a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        debug!("Saved bridge state to {}", path.display());
        Ok(())
    }

    /// Brings every chat record in line with the current command and notification sets.
    /// Returns true when the state changed and should be saved.
    pub fn migrate(&mut self, commands: &[&str], notifications: &[&str]) -> bool {
        let mut changed = false;

        if self.chats.remove(LEGACY_BOTTOM_MARKER).is_some() {
            changed = true;
        }

        if self.settings_version < STATE_VERSION {
            info!(
                "Migrating bridge state from version {} to {}",
                self.settings_version, STATE_VERSION
            );
            for chat in self.chats.values_mut() {
                for (old, new) in RENAMED_COMMANDS {
                    if let Some(value) = chat.commands.get(*old).copied() {
                        chat.commands.entry(new.to_string()).or_insert(value);
                    }
                }
            }
            self.settings_version = STATE_VERSION;
            changed = true;
        }

        for chat in self.chats.values_mut() {
            changed |= chat.sync_keys(commands, notifications);
        }

        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMMANDS: &[&str] = &["/status", "/files", "/dontshutup"];
    const EVENTS: &[&str] = &["PrintDone", "ZChange"];

    #[test]
    fn new_record_has_complete_maps_all_disabled() {
        let chat = ChatRecord::new(COMMANDS, EVENTS);
        assert_eq!(chat.commands.len(), 3);
        assert!(chat.commands.values().all(|v| !v));
        assert!(!chat.notification_enabled("PrintDone"));
        assert!(chat.new);
    }

    #[test]
    fn migrate_copies_renamed_commands_and_prunes_stale_keys() {
        let mut state = BridgeState::seeded(&NotificationsConfig::default());
        state.settings_version = 4;
        let mut chat = ChatRecord::new(&[], &[]);
        chat.commands.insert("/list".to_string(), true);
        chat.commands.insert("/imsorrydontshutup".to_string(), true);
        chat.notifications.insert("Obsolete".to_string(), true);
        state.chats.insert("42".to_string(), chat);
        state
            .chats
            .insert(LEGACY_BOTTOM_MARKER.to_string(), ChatRecord::new(&[], &[]));

        assert!(state.migrate(COMMANDS, EVENTS));

        let chat = state.chats.get("42").expect("chat kept");
        assert!(chat.command_enabled("/files"));
        assert!(chat.command_enabled("/dontshutup"));
        assert!(!chat.commands.contains_key("/list"));
        assert!(!chat.command_enabled("/status"));
        assert!(!chat.notifications.contains_key("Obsolete"));
        assert!(chat.notifications.contains_key("ZChange"));
        assert!(!state.chats.contains_key(LEGACY_BOTTOM_MARKER));
        assert_eq!(state.settings_version, STATE_VERSION);
    }

    #[test]
    fn migrate_is_stable_once_current() {
        let mut state = BridgeState::seeded(&NotificationsConfig::default());
        state
            .chats
            .insert("7".to_string(), ChatRecord::new(COMMANDS, EVENTS));
        assert!(!state.migrate(COMMANDS, EVENTS));
    }

    #[test]
    fn save_then_load_restores_chats() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        let mut state = BridgeState::seeded(&NotificationsConfig::default());
        let mut chat = ChatRecord::new(COMMANDS, EVENTS);
        chat.title = "Workshop".to_string();
        state.chats.insert("-100".to_string(), chat);
        state.save(&path).expect("save");

        let loaded = BridgeState::load(&path).expect("load").expect("present");
        assert_eq!(loaded.chats.get("-100").map(|c| c.title.as_str()), Some("Workshop"));
        assert_eq!(loaded.notification_height, 5.0);
    }

    #[test]
    fn load_missing_file_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(BridgeState::load(&dir.path().join("nope.json"))
            .expect("load")
            .is_none());
    }

    #[test]
    fn group_ids_are_negative() {
        assert!(is_group_chat("-1001234"));
        assert!(!is_group_chat("42"));
        assert!(!is_group_chat("abc"));
    }
}
