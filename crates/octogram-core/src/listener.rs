//! Long-poll listener.
//!
//! Owns the update offset, drains the backlog on first contact, classifies
//! every update into an [`Outcome`] and routes dispatchable actions to worker
//! tasks. Workers for the same chat run one at a time so that wizard steps
//! never interleave; the poll loop itself never waits on a handler.

use crate::commands::{permission_keys, CommandRegistry, CommandSpec, Invocation, Parsed};
use crate::context::BridgeContext;
use crate::media::{chat_picture_path, chat_thumbnail};
use crate::notify::notification_keys;
use crate::upload;
use anyhow::{anyhow, Result};
use octogram_config::{is_group_chat, ChatRecord};
use octogram_ipc::{OutboundMessage, PrinterEvent};
use octogram_telegram::{Chat, Document, Message, TransportError, Update, User};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Picture shown for chats without a profile photo.
pub const DEFAULT_PICTURE: &str = "img/default.jpg";
pub const GROUP_PICTURE: &str = "img/group.jpg";

/// What an update asks the bridge to do.
#[derive(Debug)]
pub enum Action {
    Command {
        spec: &'static CommandSpec,
        invocation: Invocation,
    },
    Upload {
        chat_id: String,
        from_id: String,
        document: Document,
    },
    /// First message from an unknown chat: register it and say hello.
    Enroll { chat_id: String, chat: Chat },
    ChatTitle { chat_id: String, title: String },
    ChatPhoto { chat_id: String },
    BotRemoved { chat_id: String },
}

/// Classification result of a single update.
#[derive(Debug)]
pub enum Outcome {
    Dispatch(Action),
    /// Nothing to run. `reply` is still sent when present.
    Skip {
        reason: String,
        reply: Option<OutboundMessage>,
    },
    Denied { chat_id: String, command: String },
    Error(anyhow::Error),
}

impl Outcome {
    fn skip(reason: impl Into<String>) -> Self {
        Outcome::Skip {
            reason: reason.into(),
            reply: None,
        }
    }
}

/// Display title of a chat: group title, then the person's name, then the handle.
pub fn chat_title(chat: &Chat) -> String {
    if let Some(title) = chat.title.as_deref().filter(|t| !t.is_empty()) {
        return title.to_string();
    }
    let name = [chat.first_name.as_deref(), chat.last_name.as_deref()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");
    if !name.trim().is_empty() {
        return name.trim().to_string();
    }
    match &chat.username {
        Some(username) => format!("@{}", username),
        None => chat.id.to_string(),
    }
}

/// `Telegram - @name - Full Name`, recorded as the owner of started jobs.
pub fn describe_sender(sender: Option<&User>) -> String {
    let mut parts = Vec::new();
    if let Some(user) = sender {
        if let Some(username) = &user.username {
            parts.push(format!("@{}", username));
        }
        let full = [Some(user.first_name.as_str()), user.last_name.as_deref()]
            .into_iter()
            .flatten()
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if !full.is_empty() {
            parts.push(full);
        }
    }
    if parts.is_empty() {
        "Telegram - UNKNOWN".to_string()
    } else {
        format!("Telegram - {}", parts.join(" - "))
    }
}

/// Status line for a failed poll; transport errors get their short form.
pub fn poll_failure_status(error: &anyhow::Error, backoff_secs: u64) -> String {
    let reason = match error.downcast_ref::<TransportError>() {
        Some(transport) => transport.status_line(),
        None => error.to_string(),
    };
    format!(
        "Caught an exception getting updates: {}. Waiting {} seconds before trying again.",
        reason, backoff_secs
    )
}

/// Fetches the chat's profile photo into the picture cache and returns the
/// path to show for it.
pub async fn save_chat_picture(ctx: &BridgeContext, chat_id: &str) -> String {
    let group = is_group_chat(chat_id);
    let fallback = if group { GROUP_PICTURE } else { DEFAULT_PICTURE };
    let target = chat_picture_path(&ctx.data_dir, chat_id);
    match fetch_chat_picture(ctx, chat_id, group).await {
        Ok(Some(bytes)) => {
            let written = match target.parent() {
                Some(dir) => std::fs::create_dir_all(dir).and_then(|_| std::fs::write(&target, &bytes)),
                None => std::fs::write(&target, &bytes),
            };
            match written {
                Ok(()) => {
                    info!("Saved chat picture for chat id {}", chat_id);
                    target.display().to_string()
                }
                Err(e) => {
                    warn!("Cannot write chat picture {}: {}", target.display(), e);
                    fallback.to_string()
                }
            }
        }
        Ok(None) => {
            debug!("Chat {} has no photo", chat_id);
            if target.exists() {
                if let Err(e) = std::fs::remove_file(&target) {
                    warn!("Cannot remove chat picture {}: {}", target.display(), e);
                }
            }
            fallback.to_string()
        }
        Err(e) => {
            warn!("Caught an exception saving chat picture for chat_id {}: {:#}", chat_id, e);
            DEFAULT_PICTURE.to_string()
        }
    }
}

async fn fetch_chat_picture(ctx: &BridgeContext, chat_id: &str, group: bool) -> Result<Option<Vec<u8>>> {
    let file_id = if group {
        ctx.api
            .get_chat(chat_id)
            .await?
            .photo
            .map(|photo| photo.small_file_id)
    } else {
        ctx.api
            .get_user_profile_photos(chat_id, 1)
            .await?
            .photos
            .first()
            .and_then(|sizes| sizes.first())
            .map(|size| size.file_id.clone())
    };
    let Some(file_id) = file_id else {
        return Ok(None);
    };
    let file = ctx.api.get_file(&file_id).await?;
    let path = file
        .file_path
        .ok_or_else(|| anyhow!("telegram returned no path for file {}", file_id))?;
    let bytes = ctx.api.download_file(&path).await?;
    Ok(Some(chat_thumbnail(&bytes)?))
}

pub(crate) async fn update_picture(ctx: &BridgeContext, chat_id: &str) {
    let image = save_chat_picture(ctx, chat_id).await;
    if let Err(e) = ctx.store.update_chat(chat_id, |record| record.image = image).await {
        warn!("Cannot store picture of chat {}: {:#}", chat_id, e);
    }
}

pub struct Listener {
    ctx: Arc<BridgeContext>,
    registry: Arc<CommandRegistry>,
    offset: i64,
    drained: bool,
    announced: bool,
    bot: Option<User>,
    started: Instant,
    chat_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    workers: Vec<JoinHandle<()>>,
}

impl Listener {
    pub fn new(ctx: Arc<BridgeContext>, registry: Arc<CommandRegistry>) -> Self {
        Self {
            ctx,
            registry,
            offset: 0,
            drained: false,
            announced: false,
            bot: None,
            started: Instant::now(),
            chat_locks: Arc::new(Mutex::new(HashMap::new())),
            workers: Vec::new(),
        }
    }

    /// Next update id the listener asks for.
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// `@username` of the bot once first contact succeeded.
    pub fn username(&self) -> String {
        match &self.bot {
            Some(bot) => format!("@{}", bot.username.as_deref().unwrap_or(&bot.first_name)),
            None => "UNKNOWN".to_string(),
        }
    }

    /// Moves the offset past `update_id`; the offset never goes back.
    fn set_update_offset(&mut self, update_id: i64) {
        if update_id >= self.offset {
            debug!("Updating update offset from {} to {}", self.offset, update_id + 1);
            self.offset = update_id + 1;
        } else {
            debug!(
                "Not changing update offset, it would go back from {} to {}",
                self.offset,
                update_id + 1
            );
        }
    }

    /// Runs until shutdown: first contact, then one poll cycle per iteration.
    pub async fn run(mut self) {
        debug!("Try first connect.");
        if !self.first_contact().await {
            return;
        }
        info!("Listener is running.");
        let backoff = self.ctx.config.telegram.retry_backoff_secs;
        while !self.ctx.shutdown.is_triggered() {
            if let Err(e) = self.poll_once().await {
                error!("Caught an exception getting updates: {:#}", e);
                self.ctx.status.set(poll_failure_status(&e, backoff));
                if self.pause(backoff).await {
                    break;
                }
            }
        }
        self.settle().await;
        info!("Listener exits now.");
    }

    /// Sleeps for the backoff; true when shutdown was requested meanwhile.
    async fn pause(&self, secs: u64) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(secs)) => self.ctx.shutdown.is_triggered(),
            _ = self.ctx.shutdown.wait() => true,
        }
    }

    /// Identifies the bot with `getMe`, retrying until it works or shutdown.
    pub async fn first_contact(&mut self) -> bool {
        let backoff = self.ctx.config.telegram.retry_backoff_secs;
        while !self.ctx.shutdown.is_triggered() {
            match self.ctx.api.get_me().await {
                Ok(me) => {
                    self.bot = Some(me);
                    self.ctx.status.set(format!("Connected as {}", self.username()));
                    return true;
                }
                Err(e) => {
                    error!("Caught an exception connecting to telegram: {:#}", e);
                    self.ctx.status.set(format!(
                        "Caught an exception connecting to telegram: {}. Waiting {} seconds before trying again.",
                        e, backoff
                    ));
                    if self.pause(backoff).await {
                        return false;
                    }
                }
            }
        }
        false
    }

    /// One iteration: fetch, classify and route, then the per-cycle housekeeping.
    pub async fn poll_once(&mut self) -> Result<()> {
        let updates = self.fetch().await?;
        for update in updates {
            self.handle(update).await;
        }
        self.after_cycle().await;
        Ok(())
    }

    async fn fetch(&mut self) -> Result<Vec<Update>> {
        if !self.drained {
            self.drain().await?;
            return Ok(Vec::new());
        }
        let timeout = self.ctx.config.telegram.poll_timeout_secs;
        let batch = self.ctx.api.get_updates(self.offset, timeout).await?;
        let mut fresh = Vec::with_capacity(batch.len());
        for update in batch {
            if update.update_id < self.offset {
                debug!("Ignoring update {} below offset {}", update.update_id, self.offset);
                continue;
            }
            self.set_update_offset(update.update_id);
            fresh.push(update);
        }
        Ok(fresh)
    }

    /// Skips everything that queued up while the bridge was down.
    async fn drain(&mut self) -> Result<()> {
        if self.offset == 0 {
            loop {
                let batch = self.ctx.api.get_updates(self.offset, 0).await?;
                if batch.is_empty() {
                    break;
                }
                for update in &batch {
                    self.set_update_offset(update.update_id);
                }
            }
            debug!("Ignored all messages until now because of first contact");
        }
        self.drained = true;
        Ok(())
    }

    async fn after_cycle(&mut self) {
        self.workers.retain(|worker| !worker.is_finished());

        if self.ctx.config.telegram.force_loop_message && self.ctx.notifier.status_due().await {
            debug!("Forcing StatusPrinting after poll cycle");
            self.notify(PrinterEvent::new("StatusPrinting"));
        }
        self.ctx.status.set(format!("Connected as {}", self.username()));
        if !self.announced {
            self.announced = true;
            self.notify(PrinterEvent::new("PrinterStart"));
        }
    }

    fn notify(&mut self, event: PrinterEvent) {
        let ctx = Arc::clone(&self.ctx);
        self.workers
            .push(tokio::spawn(async move { ctx.notifier.on_event(&event).await }));
    }

    /// Waits for every worker spawned so far.
    pub async fn settle(&mut self) {
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                error!("Listener worker panicked: {}", e);
            }
        }
    }

    /// Classifies and applies one update.
    pub async fn handle(&mut self, update: Update) {
        debug!("Processing update {}", update.update_id);
        if let Some(callback) = &update.callback_query {
            if let Err(e) = self.ctx.api.answer_callback_query(&callback.id).await {
                debug!("Cannot answer callback {}: {}", callback.id, e);
            }
        }
        let outcome = self.classify(update).await;
        self.apply(outcome).await;
    }

    /// Decides what an update means without running any handler.
    pub async fn classify(&self, update: Update) -> Outcome {
        if let Some(callback) = update.callback_query {
            let Some(message) = callback.message else {
                return Outcome::skip("callback without message");
            };
            let Some(data) = callback.data else {
                return Outcome::skip("callback without data");
            };
            let chat_id = message.chat.id.to_string();
            if let Some(outcome) = self.onboarding(&chat_id, &message.chat).await {
                return outcome;
            }
            let from_id = callback.from.id.to_string();
            return self.command(chat_id, from_id, &data, Some(&callback.from)).await;
        }

        let Some(message) = update.message else {
            return Outcome::skip("update without message or callback");
        };
        let chat_id = message.chat.id.to_string();
        let from_id = message
            .from
            .as_ref()
            .map(|user| user.id.to_string())
            .unwrap_or_else(|| chat_id.clone());
        if let Some(outcome) = self.onboarding(&chat_id, &message.chat).await {
            return outcome;
        }
        if let Err(e) = self.refresh_chat(&chat_id, &message.chat).await {
            return Outcome::Error(e);
        }
        self.classify_message(chat_id, from_id, message).await
    }

    async fn classify_message(&self, chat_id: String, from_id: String, message: Message) -> Outcome {
        if let Some(text) = message.text.as_deref() {
            return self.command(chat_id, from_id, text, message.from.as_ref()).await;
        }
        if let Some(document) = message.document {
            return Outcome::Dispatch(Action::Upload {
                chat_id,
                from_id,
                document,
            });
        }
        if let Some(title) = message.new_chat_title {
            return Outcome::Dispatch(Action::ChatTitle { chat_id, title });
        }
        if message.new_chat_photo.is_some() || message.delete_chat_photo.unwrap_or(false) {
            return Outcome::Dispatch(Action::ChatPhoto { chat_id });
        }
        if let Some(left) = message.left_chat_member {
            let is_bot = self.bot.as_ref().is_some_and(|bot| bot.id == left.id);
            if is_bot {
                return Outcome::Dispatch(Action::BotRemoved { chat_id });
            }
            return Outcome::skip(format!("member {} left chat {}", left.id, chat_id));
        }
        Outcome::skip(format!("unknown message type in chat {}", chat_id))
    }

    /// `Some` when the chat is unknown: enrollment or a drop.
    async fn onboarding(&self, chat_id: &str, chat: &Chat) -> Option<Outcome> {
        if self.ctx.store.contains(chat_id).await {
            return None;
        }
        if let Some(window) = self.ctx.config.telegram.enrollment_window_secs {
            if self.started.elapsed() >= Duration::from_secs(window) {
                warn!("Received a message from unknown chat {} while enrollment is closed", chat_id);
                return Some(Outcome::skip(format!("unknown chat {}", chat_id)));
            }
        }
        Some(Outcome::Dispatch(Action::Enroll {
            chat_id: chat_id.to_string(),
            chat: chat.clone(),
        }))
    }

    /// Keeps type and title of a known chat current.
    async fn refresh_chat(&self, chat_id: &str, chat: &Chat) -> Result<()> {
        let title = chat_title(chat);
        let current = self.ctx.store.get(chat_id).await;
        let stale = current.is_some_and(|record| {
            record.title != title || record.chat_type != chat.chat_type || record.private != chat.is_private()
        });
        if stale {
            self.ctx
                .store
                .update_chat(chat_id, |record| {
                    record.title = title;
                    record.chat_type = chat.chat_type.clone();
                    record.private = chat.is_private();
                })
                .await?;
        }
        Ok(())
    }

    async fn command(&self, chat_id: String, from_id: String, text: &str, sender: Option<&User>) -> Outcome {
        match self.registry.parse(text) {
            Parsed::Unknown(token) => {
                info!("Received unknown command '{}' in chat {} from {}", token, chat_id, from_id);
                let reply = if self.ctx.config.telegram.no_mistake {
                    None
                } else {
                    let text = format!("{} I do not understand you!", self.ctx.emo("notallowed"));
                    Some(OutboundMessage::to_chat(text, &chat_id).inline(false))
                };
                Outcome::Skip {
                    reason: format!("unknown command {}", token),
                    reply,
                }
            }
            Parsed::Known { spec, param } => {
                info!(
                    "Received command '{}' with parameter '{}' in chat {} from {}",
                    spec.token, param, chat_id, from_id
                );
                if !self
                    .ctx
                    .is_allowed(&chat_id, &from_id, spec.auth_key, spec.bind_none)
                    .await
                {
                    return Outcome::Denied {
                        chat_id,
                        command: spec.token.to_string(),
                    };
                }
                let invocation = Invocation::new(chat_id, from_id, param).with_user(describe_sender(sender));
                Outcome::Dispatch(Action::Command { spec, invocation })
            }
        }
    }

    async fn apply(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Dispatch(action) => self.dispatch(action).await,
            Outcome::Skip { reason, reply } => {
                debug!("Skipping update: {}", reason);
                if let Some(reply) = reply {
                    self.ctx.sink.send(reply).await;
                }
            }
            Outcome::Denied { chat_id, command } => {
                warn!("Command {} from an unauthorized user in chat {}", command, chat_id);
                let text = format!("You are not allowed to do this! {}", self.ctx.emo("notallowed"));
                self.ctx
                    .sink
                    .send(OutboundMessage::to_chat(text, chat_id).inline(false))
                    .await;
            }
            Outcome::Error(e) => error!("Caught an exception processing an update: {:#}", e),
        }
    }

    async fn dispatch(&mut self, action: Action) {
        let ctx = Arc::clone(&self.ctx);
        match action {
            Action::Command { spec, invocation } => {
                let registry = Arc::clone(&self.registry);
                let chat_id = invocation.chat_id.clone();
                self.spawn_for(&chat_id, async move {
                    registry.execute(&ctx, spec, &invocation).await;
                })
                .await;
            }
            Action::Upload {
                chat_id,
                from_id,
                document,
            } => {
                let scope = chat_id.clone();
                self.spawn_for(&scope, async move {
                    upload::handle(&ctx, &chat_id, &from_id, &document).await;
                })
                .await;
            }
            Action::Enroll { chat_id, chat } => self.enroll(chat_id, chat).await,
            Action::ChatTitle { chat_id, title } => {
                info!("Chat {} changed title to {}", chat_id, title);
                if let Err(e) = ctx.store.update_chat(&chat_id, |record| record.title = title).await {
                    error!("Cannot store the title of chat {}: {:#}", chat_id, e);
                }
            }
            Action::ChatPhoto { chat_id } => {
                info!("Chat {} changed picture, updating it", chat_id);
                self.workers
                    .push(tokio::spawn(async move { update_picture(&ctx, &chat_id).await }));
            }
            Action::BotRemoved { chat_id } => {
                info!("Chat {} kicked the bot out, removing it", chat_id);
                ctx.sessions.clear(&chat_id).await;
                if let Err(e) = ctx.store.delete(&chat_id).await {
                    error!("Cannot remove chat {}: {:#}", chat_id, e);
                }
            }
        }
    }

    async fn enroll(&mut self, chat_id: String, chat: Chat) {
        info!("Adding chat {} to known chats", chat_id);
        let mut record = ChatRecord::new(&permission_keys(), &notification_keys());
        record.chat_type = chat.chat_type.clone();
        record.private = chat.is_private();
        record.title = chat_title(&chat);
        if let Err(e) = self.ctx.store.upsert(&chat_id, record).await {
            error!("Cannot register chat {}: {:#}", chat_id, e);
            return;
        }
        let text = format!(
            "{} Chat added to known chats. Before you can do anything, please ask the bridge administrator to edit your permissions.",
            self.ctx.emo("info")
        );
        self.ctx
            .sink
            .send(OutboundMessage::to_chat(text, &chat_id).inline(false))
            .await;
        let ctx = Arc::clone(&self.ctx);
        self.workers
            .push(tokio::spawn(async move { update_picture(&ctx, &chat_id).await }));
    }

    /// Spawns `work` behind the chat's lock.
    async fn spawn_for<F>(&mut self, chat_id: &str, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let lock = {
            let mut locks = self.chat_locks.lock().await;
            locks
                .entry(chat_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        self.workers.push(tokio::spawn(async move {
            let _guard = lock.lock_owned().await;
            work.await;
        }));
    }
}
