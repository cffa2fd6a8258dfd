//! Outbound delivery: recipient routing, edit markers, media albums and documents.

use crate::context::ConnectionStatus;
use crate::media::{read_file_limited, MediaCapture};
use crate::store::ChatStore;
use anyhow::Result;
use octogram_ipc::OutboundMessage;
use octogram_octoprint::HostServices;
use octogram_telegram::markup::line_break;
use octogram_telegram::{
    start_chat_action, BotApi, BotCommand, EditMessage, MediaGroup, MediaItem, MediaKind,
    SendMessage, MAX_UPLOAD_BYTES,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const FALLBACK_TEXT: &str =
    "I tried to send you a message, but an exception occurred. Please check the logs.";
const MOVIE_TOO_BIG: &str = "The timelapse/Octolapse video could not be sent via Telegram because its size exceeds 50MB. Please download it manually from the OctoPrint web interface.";
const THUMBNAIL_TIMEOUT: Duration = Duration::from_secs(15);

pub struct SendSink {
    api: Arc<dyn BotApi>,
    store: Arc<ChatStore>,
    host: Arc<dyn HostServices>,
    media: Arc<MediaCapture>,
    status: Arc<ConnectionStatus>,
    /// Last message per chat that the next reply should edit in place.
    markers: Mutex<HashMap<String, i64>>,
    enabled: AtomicBool,
}

impl SendSink {
    pub fn new(
        api: Arc<dyn BotApi>,
        store: Arc<ChatStore>,
        host: Arc<dyn HostServices>,
        media: Arc<MediaCapture>,
        status: Arc<ConnectionStatus>,
    ) -> Self {
        Self {
            api,
            store,
            host,
            media,
            status,
            markers: Mutex::new(HashMap::new()),
            enabled: AtomicBool::new(true),
        }
    }

    /// Stops every further send; queued deliveries become no-ops.
    pub fn disable(&self) {
        if self.enabled.swap(false, Ordering::SeqCst) {
            info!("Send sink disabled");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Reads and clears the chat's edit marker.
    pub async fn take_marker(&self, chat_id: &str) -> Option<i64> {
        self.markers.lock().await.remove(chat_id)
    }

    async fn remember(&self, chat_id: &str, message_id: i64) {
        self.markers.lock().await.insert(chat_id.to_string(), message_id);
    }

    /// Fire-and-forget variant of [`SendSink::send`].
    pub fn dispatch(self: &Arc<Self>, message: OutboundMessage) {
        let sink = Arc::clone(self);
        tokio::spawn(async move { sink.send(message).await });
    }

    /// Routes the message and waits until every recipient has been served.
    pub async fn send(&self, message: OutboundMessage) {
        if !self.is_enabled() {
            return;
        }
        delay(message.delay_secs).await;
        if !self.is_enabled() {
            return;
        }
        match (&message.chat_id, message.edit_message_id) {
            (Some(chat_id), Some(message_id)) => self.edit(chat_id, message_id, &message).await,
            (Some(chat_id), None) => self.deliver(chat_id, &message).await,
            (None, _) => {
                for chat_id in self.recipients(&message).await {
                    self.deliver(&chat_id, &message).await;
                }
            }
        }
    }

    /// Chats subscribed to the message's event, or every chat for a broadcast.
    async fn recipients(&self, message: &OutboundMessage) -> Vec<String> {
        let mut recipients = Vec::new();
        for (chat_id, chat) in self.store.all().await {
            let wanted = match &message.event {
                Some(event) => {
                    chat.send_notifications
                        && chat.notification_enabled(event)
                        && !self.store.is_muted(&chat_id).await
                }
                None => true,
            };
            if wanted {
                recipients.push(chat_id);
            }
        }
        debug!(
            "Message for event {:?} goes to {} chat(s)",
            message.event,
            recipients.len()
        );
        recipients
    }

    async fn edit(&self, chat_id: &str, message_id: i64, message: &OutboundMessage) {
        let edit = EditMessage {
            chat_id: chat_id.to_string(),
            message_id,
            text: message.text.clone(),
            parse_mode: message.markup.parse_mode().map(str::to_string),
            reply_markup: message
                .inline_keyboard
                .clone()
                .filter(|_| message.inline),
        };
        match self.api.edit_message_text(&edit).await {
            Ok(()) => {
                if message.inline {
                    self.remember(chat_id, message_id).await;
                }
            }
            Err(e) => self.fail(chat_id, e).await,
        }
    }

    async fn deliver(&self, chat_id: &str, message: &OutboundMessage) {
        match self.try_deliver(chat_id, message).await {
            Ok(Some(message_id)) if message.inline => self.remember(chat_id, message_id).await,
            Ok(_) => {}
            Err(e) => self.fail(chat_id, e).await,
        }
    }

    async fn try_deliver(&self, chat_id: &str, message: &OutboundMessage) -> Result<Option<i64>> {
        let mut text = message.text.clone();
        let mut photos: Vec<Vec<u8>> = Vec::new();
        let mut videos: Vec<PathBuf> = Vec::new();

        if let Some(thumbnail) = &message.thumbnail {
            match self.host.fetch(thumbnail, THUMBNAIL_TIMEOUT).await {
                Ok(bytes) => photos.push(bytes),
                Err(e) => warn!("Cannot fetch thumbnail {}: {}", thumbnail, e),
            }
        }

        if let Some(movie) = &message.movie {
            match std::fs::metadata(movie) {
                Ok(meta) if meta.len() > MAX_UPLOAD_BYTES => {
                    warn!("Skipping movie {}: bigger than 50MB", movie.display());
                    text.push_str(line_break(message.markup));
                    text.push_str(MOVIE_TOO_BIG);
                }
                Ok(_) => videos.push(movie.clone()),
                Err(e) => warn!("Cannot read movie {}: {}", movie.display(), e),
            }
        }

        if message.with_image || message.with_gif {
            let _action = start_chat_action(Arc::clone(&self.api), chat_id, "record_video");
            self.media.pre_image().await;
            if message.with_image {
                photos.extend(self.media.snapshots().await);
            }
            if message.with_gif {
                videos.extend(self.media.clips(message.gif_duration).await);
            }
            self.media.post_image().await;
        }

        let parse_mode = message.markup.parse_mode().map(str::to_string);
        let mut items = Vec::new();
        for bytes in photos {
            if bytes.len() as u64 > MAX_UPLOAD_BYTES {
                warn!("Skipping an image bigger than 50MB");
                continue;
            }
            items.push(MediaItem {
                kind: MediaKind::Photo,
                bytes,
                caption: None,
                parse_mode: None,
            });
        }
        let has_videos = !videos.is_empty();
        for path in videos {
            match read_file_limited(&path, MAX_UPLOAD_BYTES) {
                Ok(bytes) => items.push(MediaItem {
                    kind: MediaKind::Video,
                    bytes,
                    caption: None,
                    parse_mode: None,
                }),
                Err(e) => warn!("Skipping video {}: {}", path.display(), e),
            }
        }

        if let Some(first) = items.first_mut() {
            if !text.is_empty() {
                first.caption = Some(text);
                first.parse_mode = parse_mode;
            }
            let action = if has_videos { "upload_video" } else { "upload_photo" };
            let _action = start_chat_action(Arc::clone(&self.api), chat_id, action);
            debug!("Sending {} media item(s) to chat {}", items.len(), chat_id);
            let sent = self
                .api
                .send_media_group(MediaGroup {
                    chat_id: chat_id.to_string(),
                    items,
                    disable_notification: message.silent,
                })
                .await?;
            return Ok(sent.first().map(|m| m.message_id));
        }

        let _action = start_chat_action(Arc::clone(&self.api), chat_id, "typing");
        let sent = self
            .api
            .send_message(&SendMessage {
                chat_id: chat_id.to_string(),
                text,
                parse_mode,
                reply_markup: message.inline_keyboard.clone(),
                disable_notification: message.silent,
                disable_web_page_preview: !message.show_web,
            })
            .await?;
        Ok(Some(sent.message_id))
    }

    async fn fail(&self, chat_id: &str, e: anyhow::Error) {
        error!("Sending to chat {} failed: {}", chat_id, e);
        self.status.set("Exception sending a message");
        let fallback = SendMessage {
            chat_id: chat_id.to_string(),
            text: FALLBACK_TEXT.to_string(),
            ..SendMessage::default()
        };
        if let Err(e) = self.api.send_message(&fallback).await {
            error!("Fallback message to chat {} failed: {}", chat_id, e);
        }
    }

    /// Sends a document, or explains why it is too large for Telegram.
    pub async fn send_document(&self, chat_id: &str, file_name: &str, bytes: Vec<u8>, caption: &str) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        if bytes.len() as u64 > MAX_UPLOAD_BYTES {
            warn!("File {} not sent to chat {}: exceeds 50MB", file_name, chat_id);
            let text = format!(
                "The file `{}` is too large (>50MB) to send via Telegram. Please download it manually from the OctoPrint web interface.",
                file_name
            );
            let edit = self.take_marker(chat_id).await;
            self.send(OutboundMessage::to_chat(text, chat_id).with_edit(edit)).await;
            return Ok(());
        }
        info!("Sending file {} to chat {}", file_name, chat_id);
        let _action = start_chat_action(Arc::clone(&self.api), chat_id, "upload_document");
        self.api.send_document(chat_id, file_name, bytes, caption).await
    }

    /// Publishes the bot's command list in the Telegram client menu.
    pub async fn publish_commands(&self, commands: &[BotCommand]) {
        match self.api.set_my_commands(commands).await {
            Ok(()) => info!("Published {} bot command(s)", commands.len()),
            Err(e) => warn!("Failed to publish bot commands: {}", e),
        }
    }

    pub fn api(&self) -> &Arc<dyn BotApi> {
        &self.api
    }
}

async fn delay(secs: u64) {
    if secs > 0 {
        debug!("Delaying message by {}s", secs);
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }
}
