//! Short-lived per-chat wizard state.
//!
//! Drafts live only in memory and expire after a period of inactivity. Losing one
//! mid-wizard is expected: the user simply opens the wizard again.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

pub const SESSION_TTL: Duration = Duration::from_secs(15 * 60);

/// Notification height and interval being edited through `/settings`.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsDraft {
    pub height: f64,
    pub time: i64,
}

/// Feed rate, flow rate and heater targets being edited through `/tune`.
#[derive(Debug, Clone, PartialEq)]
pub struct TuneDraft {
    pub feed: f64,
    pub flow: f64,
    pub tools: Vec<f64>,
    pub bed: Option<f64>,
}

impl Default for TuneDraft {
    fn default() -> Self {
        Self {
            feed: 100.0,
            flow: 100.0,
            tools: Vec::new(),
            bed: None,
        }
    }
}

/// Directory lookup table of the file browser and the file picked for move/copy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileDraft {
    /// Short hash to `origin/dir/.../` path.
    pub dirs: BTreeMap<String, String>,
    pub pending_file: Option<String>,
}

/// Manual connection parameters collected over several button presses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectDraft {
    pub port: Option<String>,
    pub baudrate: Option<u32>,
}

#[derive(Debug)]
pub struct ChatSession {
    pub settings: Option<SettingsDraft>,
    pub tune: TuneDraft,
    pub files: FileDraft,
    pub connect: ConnectDraft,
    touched: Instant,
}

impl ChatSession {
    fn new(now: Instant) -> Self {
        Self {
            settings: None,
            tune: TuneDraft::default(),
            files: FileDraft::default(),
            connect: ConnectDraft::default(),
            touched: now,
        }
    }
}

pub struct Sessions {
    ttl: Duration,
    chats: Mutex<HashMap<String, ChatSession>>,
}

impl Sessions {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            chats: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `f` on the chat's session, creating a fresh one when none is live.
    pub async fn with<R>(&self, chat_id: &str, f: impl FnOnce(&mut ChatSession) -> R) -> R {
        self.with_at(chat_id, Instant::now(), f).await
    }

    async fn with_at<R>(&self, chat_id: &str, now: Instant, f: impl FnOnce(&mut ChatSession) -> R) -> R {
        let mut chats = self.chats.lock().await;
        let ttl = self.ttl;
        chats.retain(|_, session| now.duration_since(session.touched) < ttl);
        let session = chats
            .entry(chat_id.to_string())
            .or_insert_with(|| ChatSession::new(now));
        session.touched = now;
        f(session)
    }

    pub async fn clear(&self, chat_id: &str) {
        self.chats.lock().await.remove(chat_id);
    }

    pub async fn live(&self) -> usize {
        self.chats.lock().await.len()
    }
}

impl Default for Sessions {
    fn default() -> Self {
        Self::new(SESSION_TTL)
    }
}
