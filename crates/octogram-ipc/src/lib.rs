//! Octogram IPC
//!
//! Message and event types shared between the watcher, dispatcher and send sink

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

static NEXT_TRACE_COUNTER: AtomicU64 = AtomicU64::new(1);

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn generate_trace_id() -> String {
    let ts = now_unix_secs();
    let n = NEXT_TRACE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("trace-{}-{}", ts, n)
}

/// Text formatting requested for an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Markup {
    #[default]
    Off,
    Html,
    Markdown,
    MarkdownV2,
}

impl Markup {
    /// Parses a configured markup name. Unknown names yield `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "off" | "" => Some(Markup::Off),
            "HTML" => Some(Markup::Html),
            "Markdown" => Some(Markup::Markdown),
            "MarkdownV2" => Some(Markup::MarkdownV2),
            _ => None,
        }
    }

    /// Value for the Bot API `parse_mode` parameter.
    pub fn parse_mode(self) -> Option<&'static str> {
        match self {
            Markup::Off => None,
            Markup::Html => Some("HTML"),
            Markup::Markdown => Some("Markdown"),
            Markup::MarkdownV2 => Some("MarkdownV2"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineButton {
    pub text: String,
    pub callback_data: String,
}

impl InlineButton {
    pub fn new(text: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callback_data: callback_data.into(),
        }
    }
}

pub type Keyboard = Vec<Vec<InlineButton>>;

/// A message handed to the send sink.
///
/// `chat_id: None` means "every eligible chat": chats subscribed to `event`
/// when an event is set, otherwise every known chat.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub text: String,
    pub chat_id: Option<String>,
    pub event: Option<String>,
    pub inline_keyboard: Option<Keyboard>,
    pub edit_message_id: Option<i64>,
    pub markup: Markup,
    pub silent: bool,
    pub with_image: bool,
    pub with_gif: bool,
    pub gif_duration: u64,
    pub movie: Option<PathBuf>,
    pub thumbnail: Option<String>,
    /// Remember the sent message id so the next reply in the chat edits it.
    pub inline: bool,
    pub show_web: bool,
    pub delay_secs: u64,
}

impl OutboundMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            chat_id: None,
            event: None,
            inline_keyboard: None,
            edit_message_id: None,
            markup: Markup::Off,
            silent: false,
            with_image: false,
            with_gif: false,
            gif_duration: 5,
            movie: None,
            thumbnail: None,
            inline: true,
            show_web: false,
            delay_secs: 0,
        }
    }

    pub fn to_chat(text: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self::new(text).with_chat(chat_id)
    }

    pub fn with_chat(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = Some(chat_id.into());
        self
    }

    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    pub fn with_keyboard(mut self, keyboard: Keyboard) -> Self {
        self.inline_keyboard = Some(keyboard);
        self
    }

    pub fn with_edit(mut self, message_id: Option<i64>) -> Self {
        self.edit_message_id = message_id;
        self
    }

    pub fn with_markup(mut self, markup: Markup) -> Self {
        self.markup = markup;
        self
    }

    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    pub fn with_image(mut self, with_image: bool) -> Self {
        self.with_image = with_image;
        self
    }

    pub fn with_gif(mut self, with_gif: bool, duration: u64) -> Self {
        self.with_gif = with_gif;
        self.gif_duration = duration;
        self
    }

    pub fn with_movie(mut self, movie: PathBuf) -> Self {
        self.movie = Some(movie);
        self
    }

    pub fn with_thumbnail(mut self, thumbnail: Option<String>) -> Self {
        self.thumbnail = thumbnail;
        self
    }

    pub fn inline(mut self, inline: bool) -> Self {
        self.inline = inline;
        self
    }

    pub fn with_delay(mut self, delay_secs: u64) -> Self {
        self.delay_secs = delay_secs;
        self
    }

    pub fn has_media(&self) -> bool {
        self.with_image || self.with_gif || self.movie.is_some() || self.thumbnail.is_some()
    }
}

/// Printer lifecycle event, named like the host's event bus names it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterEvent {
    pub trace_id: String,
    pub name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl PrinterEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            trace_id: generate_trace_id(),
            name: name.into(),
            payload: serde_json::json!({}),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }
}

/// Everything the watcher observes on the host side.
#[derive(Debug, Clone)]
pub enum HostSignal {
    Event(PrinterEvent),
    /// A line received from the printer on the serial port.
    SerialReceived(String),
    /// A G-code line sent to the printer.
    GcodeSent(String),
}

pub const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    signals: broadcast::Sender<HostSignal>,
}

impl EventBus {
    pub fn new() -> Self {
        let (signals, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { signals }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostSignal> {
        self.signals.subscribe()
    }

    pub fn publish(&self, signal: HostSignal) -> anyhow::Result<()> {
        self.signals.send(signal)?;
        Ok(())
    }

    /// Publishes an event; having no subscriber is not an error.
    pub fn emit(&self, event: PrinterEvent) {
        if self.signals.send(HostSignal::Event(event)).is_err() {
            tracing::debug!("No subscriber for printer event");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
