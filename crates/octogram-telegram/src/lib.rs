//! Octogram Telegram Adapter
//!
//! Bot API transport with envelope validation and proxy support, wire types,
//! emoji names, markup escaping and inline keyboard helpers

pub mod client;
pub mod emoji;
pub mod keyboard;
pub mod markup;
pub mod types;

pub use client::{check_envelope, TelegramClient};
pub use emoji::Emoji;
pub use types::*;

use anyhow::Result;
use octogram_ipc::Keyboard;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Telegram refuses uploads above this size.
pub const MAX_UPLOAD_BYTES: u64 = 50 * 1024 * 1024;
/// Chat actions expire after five seconds, so they are refreshed a little earlier.
pub const CHAT_ACTION_INTERVAL: Duration = Duration::from_millis(4500);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("telegram {method} request failed: {reason}")]
    Request { method: String, reason: String },
    #[error("telegram {method} responded with code {status}. Response was: {body}")]
    Status {
        method: String,
        status: u16,
        body: String,
    },
    #[error("telegram {method} unexpected Content-Type. Expected: application/json. It was: {content_type}")]
    ContentType { method: String, content_type: String },
    #[error("telegram {method} returned ok=false: {description}")]
    NotOk { method: String, description: String },
    #[error("telegram {method} decode failed: {reason}")]
    Decode { method: String, reason: String },
}

impl TransportError {
    /// Short status line shown as the bridge connection state.
    pub fn status_line(&self) -> String {
        match self {
            TransportError::Request { .. } => "Connection error".to_string(),
            TransportError::Status { status, .. } => format!("Telegram responded with code {}", status),
            TransportError::ContentType { .. } => "Unexpected Content-Type from Telegram".to_string(),
            TransportError::NotOk { .. } => "Telegram answered ok=false".to_string(),
            TransportError::Decode { .. } => "Unreadable response from Telegram".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendMessage {
    pub chat_id: String,
    pub text: String,
    pub parse_mode: Option<String>,
    pub reply_markup: Option<Keyboard>,
    pub disable_notification: bool,
    pub disable_web_page_preview: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EditMessage {
    pub chat_id: String,
    pub message_id: i64,
    pub text: String,
    pub parse_mode: Option<String>,
    pub reply_markup: Option<Keyboard>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Photo,
    Video,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
        }
    }
}

/// One album entry for `sendMediaGroup`.
#[derive(Debug, Clone)]
pub struct MediaItem {
    pub kind: MediaKind,
    pub bytes: Vec<u8>,
    pub caption: Option<String>,
    pub parse_mode: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MediaGroup {
    pub chat_id: String,
    pub items: Vec<MediaItem>,
    pub disable_notification: bool,
}

/// The slice of the Bot API the bridge uses.
#[async_trait::async_trait]
pub trait BotApi: Send + Sync {
    async fn get_me(&self) -> Result<User>;
    async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Update>>;
    async fn send_message(&self, message: &SendMessage) -> Result<Message>;
    async fn edit_message_text(&self, edit: &EditMessage) -> Result<()>;
    async fn send_media_group(&self, group: MediaGroup) -> Result<Vec<Message>>;
    async fn send_document(
        &self,
        chat_id: &str,
        file_name: &str,
        bytes: Vec<u8>,
        caption: &str,
    ) -> Result<()>;
    async fn send_chat_action(&self, chat_id: &str, action: &str) -> Result<()>;
    async fn delete_message(&self, chat_id: &str, message_id: i64) -> Result<()>;
    async fn answer_callback_query(&self, callback_query_id: &str) -> Result<()>;
    async fn get_file(&self, file_id: &str) -> Result<File>;
    async fn download_file(&self, file_path: &str) -> Result<Vec<u8>>;
    async fn get_chat(&self, chat_id: &str) -> Result<ChatInfo>;
    async fn get_user_profile_photos(&self, user_id: &str, limit: u32) -> Result<UserProfilePhotos>;
    async fn set_my_commands(&self, commands: &[BotCommand]) -> Result<()>;
    async fn get_my_commands(&self) -> Result<Vec<BotCommand>>;
}

/// Keeps a chat action ("typing", "upload_photo", ...) visible until dropped.
pub struct ChatActionGuard {
    stop: Arc<AtomicBool>,
}

impl Drop for ChatActionGuard {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

pub fn start_chat_action(api: Arc<dyn BotApi>, chat_id: &str, action: &'static str) -> ChatActionGuard {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    let chat_id = chat_id.to_string();

    tokio::spawn(async move {
        while !stop_flag.load(Ordering::Relaxed) {
            if let Err(e) = api.send_chat_action(&chat_id, action).await {
                tracing::debug!("Chat action {} failed for {}: {}", action, chat_id, e);
            }
            tokio::time::sleep(CHAT_ACTION_INTERVAL).await;
        }
    });

    ChatActionGuard { stop }
}
