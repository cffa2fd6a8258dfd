//! Octogram Configuration
//!
//! TOML configuration loading plus the persisted bridge state schema

pub mod state;

pub use state::{is_group_chat, BridgeState, ChatRecord, STATE_VERSION};

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub const MARKUP_NAMES: &[&str] = &["off", "HTML", "Markdown", "MarkdownV2"];
pub const IMAGE_HOOK_METHODS: &[&str] = &["none", "gcode", "system"];

/// Legacy message keys renamed in settings version 6.
const LEGACY_MESSAGE_KEYS: &[(&str, &str)] = &[
    ("TelegramSendNotPrintingStatus", "StatusNotPrinting"),
    ("TelegramSendPrintingStatus", "StatusPrinting"),
];

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub octoprint: OctoPrintConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub files: FilesConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    pub data_dir: Option<String>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
    #[serde(default = "default_client_timeout")]
    pub client_timeout_secs: u64,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    /// Stay silent on unknown commands instead of answering.
    #[serde(default)]
    pub no_mistake: bool,
    #[serde(default = "default_true")]
    pub send_icon: bool,
    #[serde(default)]
    pub show_web: bool,
    /// When set, unknown chats are only registered during this many seconds after startup.
    pub enrollment_window_secs: Option<u64>,
    #[serde(default)]
    pub force_loop_message: bool,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            poll_timeout_secs: default_poll_timeout(),
            client_timeout_secs: default_client_timeout(),
            retry_backoff_secs: default_retry_backoff(),
            http_proxy: None,
            https_proxy: None,
            no_mistake: false,
            send_icon: true,
            show_web: false,
            enrollment_window_secs: None,
            force_loop_message: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OctoPrintConfig {
    #[serde(default = "default_octoprint_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for OctoPrintConfig {
    fn default() -> Self {
        Self {
            base_url: default_octoprint_url(),
            api_key: String::new(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    /// Z step in millimetres between two ZChange notifications.
    #[serde(default = "default_height")]
    pub height: f64,
    /// Minutes between two ZChange notifications.
    #[serde(default = "default_time")]
    pub time: i64,
    #[serde(default)]
    pub send_gif: bool,
    #[serde(default = "default_true")]
    pub image_not_connected: bool,
    #[serde(default)]
    pub gif_not_connected: bool,
    #[serde(default)]
    pub message_at_print_done_delay: u64,
    #[serde(default = "default_time_format")]
    pub time_format: String,
    #[serde(default = "default_day_time_format")]
    pub day_time_format: String,
    #[serde(default = "default_week_time_format")]
    pub week_time_format: String,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,
    #[serde(default)]
    pub messages: BTreeMap<String, MessageConfig>,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            height: default_height(),
            time: default_time(),
            send_gif: false,
            image_not_connected: true,
            gif_not_connected: false,
            message_at_print_done_delay: 0,
            time_format: default_time_format(),
            day_time_format: default_day_time_format(),
            week_time_format: default_week_time_format(),
            rate_limit_per_minute: default_rate_limit(),
            messages: BTreeMap::new(),
        }
    }
}

impl NotificationsConfig {
    /// Message overrides with legacy event names mapped onto their current names.
    pub fn normalized_messages(&self) -> BTreeMap<String, MessageConfig> {
        let mut messages = self.messages.clone();
        for (legacy, current) in LEGACY_MESSAGE_KEYS {
            if let Some(value) = messages.remove(*legacy) {
                messages.entry(current.to_string()).or_insert(value);
            }
        }
        messages
    }
}

/// Per-event override of a notification descriptor. Unset fields keep the built-in value.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct MessageConfig {
    pub text: Option<String>,
    pub image: Option<bool>,
    pub gif: Option<bool>,
    pub silent: Option<bool>,
    pub markup: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    #[serde(default)]
    pub snapshot_urls: Vec<String>,
    #[serde(default)]
    pub stream_urls: Vec<String>,
    pub ffmpeg_path: Option<String>,
    #[serde(default = "default_ffmpeg_preset")]
    pub ffmpeg_preset: String,
    #[serde(default)]
    pub no_cpulimit: bool,
    #[serde(default = "default_snapshot_timeout")]
    pub snapshot_timeout_secs: u64,
    #[serde(default)]
    pub pre_image: ImageHook,
    #[serde(default)]
    pub post_image: ImageHook,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            snapshot_urls: Vec::new(),
            stream_urls: Vec::new(),
            ffmpeg_path: None,
            ffmpeg_preset: default_ffmpeg_preset(),
            no_cpulimit: false,
            snapshot_timeout_secs: default_snapshot_timeout(),
            pre_image: ImageHook::default(),
            post_image: ImageHook::default(),
        }
    }
}

/// Command run around webcam capture, e.g. to switch a light on and off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageHook {
    #[serde(default = "default_hook_method")]
    pub method: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub delay_secs: u64,
}

impl Default for ImageHook {
    fn default() -> Self {
        Self {
            method: default_hook_method(),
            command: String::new(),
            delay_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesConfig {
    #[serde(default = "default_upload_folder")]
    pub upload_folder: String,
    #[serde(default)]
    pub select_file_upload: bool,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            upload_folder: default_upload_folder(),
            select_file_upload: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    #[serde(default = "default_watch_interval")]
    pub poll_interval_secs: u64,
    /// OctoPrint `serial.log` to tail for host prompts and M600 requests.
    pub serial_log: Option<String>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_watch_interval(),
            serial_log: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_poll_timeout() -> u64 {
    30
}

fn default_client_timeout() -> u64 {
    40
}

fn default_retry_backoff() -> u64 {
    120
}

fn default_octoprint_url() -> String {
    "http://localhost:5000".to_string()
}

fn default_request_timeout() -> u64 {
    15
}

fn default_height() -> f64 {
    5.0
}

fn default_time() -> i64 {
    15
}

fn default_time_format() -> String {
    "%H:%M:%S".to_string()
}

fn default_day_time_format() -> String {
    "%a %H:%M:%S".to_string()
}

fn default_week_time_format() -> String {
    "%d.%m.%Y %H:%M:%S".to_string()
}

fn default_rate_limit() -> u32 {
    10
}

fn default_ffmpeg_preset() -> String {
    "medium".to_string()
}

fn default_snapshot_timeout() -> u64 {
    15
}

fn default_hook_method() -> String {
    "none".to_string()
}

fn default_upload_folder() -> String {
    "TelegramPlugin".to_string()
}

fn default_watch_interval() -> u64 {
    5
}

fn token_regex() -> Option<&'static Regex> {
    static TOKEN: OnceLock<Option<Regex>> = OnceLock::new();
    TOKEN
        .get_or_init(|| Regex::new(r"^(\d+):([a-zA-Z0-9_-]+)$").ok())
        .as_ref()
}

/// True when the whole string has the `123456:ABC-DEF...` bot token shape.
pub fn is_valid_bot_token(token: &str) -> bool {
    token_regex().is_some_and(|re| re.is_match(token))
}

/// Numeric bot id, the part before the colon.
pub fn bot_id(token: &str) -> Option<&str> {
    token_regex()?
        .captures(token)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("octogram").join("config.toml"))
    }

    /// Data directory with `~` expanded; falls back to the platform data dir.
    pub fn data_dir(&self) -> PathBuf {
        if let Some(data_dir) = &self.core.data_dir {
            if data_dir == "~" || data_dir.starts_with("~/") {
                if let Some(home) = dirs::home_dir() {
                    let rest = data_dir.trim_start_matches('~').trim_start_matches('/');
                    return if rest.is_empty() { home } else { home.join(rest) };
                }
            }
            return PathBuf::from(data_dir);
        }
        dirs::data_dir()
            .map(|dir| dir.join("octogram"))
            .unwrap_or_else(|| PathBuf::from(".octogram"))
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir().join("state.json")
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let token = self.telegram.bot_token.trim();
        if token.is_empty() {
            anyhow::bail!("telegram.bot_token must be set");
        }
        if !is_valid_bot_token(token) {
            anyhow::bail!(
                "telegram.bot_token doesn't seem to have the correct format. It should look like this: 123456:ABC-DEF1234ghIkl-zyx57W2v1u123ew11"
            );
        }
        if self.telegram.client_timeout_secs <= self.telegram.poll_timeout_secs {
            anyhow::bail!(
                "telegram.client_timeout_secs ({}) must be greater than telegram.poll_timeout_secs ({})",
                self.telegram.client_timeout_secs,
                self.telegram.poll_timeout_secs
            );
        }
        if self.octoprint.base_url.trim().is_empty() {
            anyhow::bail!("octoprint.base_url cannot be empty");
        }
        if self.notifications.rate_limit_per_minute == 0 {
            anyhow::bail!("notifications.rate_limit_per_minute must be at least 1");
        }
        if self.notifications.height < 0.0 {
            anyhow::bail!("notifications.height cannot be negative");
        }
        for (event, message) in &self.notifications.messages {
            if let Some(markup) = &message.markup {
                if !MARKUP_NAMES.contains(&markup.as_str()) {
                    anyhow::bail!(
                        "notifications.messages.{}.markup '{}' must be one of {}",
                        event,
                        markup,
                        MARKUP_NAMES.join(", ")
                    );
                }
            }
        }
        for (name, hook) in [
            ("pre_image", &self.media.pre_image),
            ("post_image", &self.media.post_image),
        ] {
            let method = hook.method.to_ascii_lowercase();
            if !IMAGE_HOOK_METHODS.contains(&method.as_str()) {
                anyhow::bail!(
                    "media.{}.method '{}' must be one of {}",
                    name,
                    hook.method,
                    IMAGE_HOOK_METHODS.join(", ")
                );
            }
            if method != "none" && hook.command.trim().is_empty() {
                anyhow::bail!("media.{}.command must be set when method is '{}'", name, method);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{bot_id, is_valid_bot_token, Config};

    fn parse_config(input: &str) -> Config {
        let cfg: Config = toml::from_str(input).expect("valid TOML");
        cfg
    }

    #[test]
    fn validate_accepts_minimal_config() {
        let cfg = parse_config(
            r#"
[telegram]
bot_token = "123456:ABC-DEF1234ghIkl-zyx57W2v1u123ew11"
"#,
        );
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.telegram.poll_timeout_secs, 30);
        assert_eq!(cfg.telegram.client_timeout_secs, 40);
        assert_eq!(cfg.files.upload_folder, "TelegramPlugin");
    }

    #[test]
    fn validate_rejects_missing_token() {
        let cfg = parse_config("[core]\n");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_malformed_token() {
        let cfg = parse_config(
            r#"
[telegram]
bot_token = "not a token"
"#,
        );
        let err = cfg.validate().expect_err("malformed token");
        assert!(err.to_string().contains("123456:ABC-DEF1234ghIkl"));
    }

    #[test]
    fn validate_rejects_client_timeout_not_above_poll_timeout() {
        let cfg = parse_config(
            r#"
[telegram]
bot_token = "1:abc"
poll_timeout_secs = 30
client_timeout_secs = 30
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_unknown_markup_override() {
        let cfg = parse_config(
            r#"
[telegram]
bot_token = "1:abc"

[notifications.messages.PrintDone]
markup = "bbcode"
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_hook_without_command() {
        let cfg = parse_config(
            r#"
[telegram]
bot_token = "1:abc"

[media.pre_image]
method = "system"
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn legacy_message_keys_are_renamed() {
        let cfg = parse_config(
            r#"
[telegram]
bot_token = "1:abc"

[notifications.messages.TelegramSendNotPrintingStatus]
text = "idle"
"#,
        );
        let messages = cfg.notifications.normalized_messages();
        assert!(!messages.contains_key("TelegramSendNotPrintingStatus"));
        assert_eq!(
            messages
                .get("StatusNotPrinting")
                .and_then(|m| m.text.as_deref()),
            Some("idle")
        );
    }

    #[test]
    fn token_helpers_extract_bot_id() {
        assert!(is_valid_bot_token("110201543:AAHdqTcvCH1vGWJxfSeofSAs0K5PALDsaw"));
        assert!(!is_valid_bot_token("110201543:AAH dq"));
        assert!(!is_valid_bot_token(":abc"));
        assert_eq!(bot_id("42:xyz"), Some("42"));
        assert_eq!(bot_id("garbage"), None);
    }

    #[test]
    fn data_dir_uses_configured_absolute_path() {
        let cfg = parse_config(
            r#"
[core]
data_dir = "/var/lib/octogram"
"#,
        );
        assert_eq!(cfg.data_dir(), std::path::PathBuf::from("/var/lib/octogram"));
        assert!(cfg.state_path().ends_with("state.json"));
    }
}
