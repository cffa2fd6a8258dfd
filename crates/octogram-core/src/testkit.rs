//! In-memory collaborators for listener, command and notification tests.

use crate::context::{BridgeContext, ConnectionStatus, Shutdown};
use crate::media::MediaCapture;
use crate::notify::Notifier;
use crate::session::Sessions;
use crate::sink::SendSink;
use crate::store::ChatStore;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use octogram_config::{BridgeState, ChatRecord, Config, NotificationsConfig};
use octogram_octoprint::{
    Capabilities, ConnectRequest, ConnectionInfo, FileEntry, FileStorage, HostServices, JobSnapshot,
    PluginReply, PrinterControl, PrinterFlags, PrinterProfile, PrinterSnapshot, SystemCommand, Temperature,
};
use octogram_policy::PolicyEngine;
use octogram_telegram::{
    BotApi, BotCommand, Chat, ChatInfo, EditMessage, File, MediaGroup, Message, SendMessage, Update, User,
    UserProfilePhotos,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const BOT_USERNAME: &str = "printer_bot";

#[derive(Debug, Clone)]
pub enum BotCall {
    Send(SendMessage),
    Edit(EditMessage),
    MediaGroup { chat_id: String, items: usize, caption: Option<String> },
    Document { chat_id: String, file_name: String, size: usize },
    Delete { chat_id: String, message_id: i64 },
    Answer(String),
    SetCommands(Vec<BotCommand>),
}

#[derive(Default)]
pub struct FakeBot {
    calls: Mutex<Vec<BotCall>>,
    batches: Mutex<VecDeque<Vec<Update>>>,
    offsets: Mutex<Vec<(i64, u64)>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    next_id: AtomicI64,
    fail_send: AtomicBool,
    fail_get_me: AtomicBool,
}

impl FakeBot {
    pub fn calls(&self) -> Vec<BotCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: BotCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    pub fn sent(&self) -> Vec<SendMessage> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                BotCall::Send(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    /// Chats that received a new message or album, in order.
    pub fn sent_chats(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                BotCall::Send(message) => Some(message.chat_id),
                BotCall::MediaGroup { chat_id, .. } => Some(chat_id),
                _ => None,
            })
            .collect()
    }

    /// Text of the last sent or edited message.
    pub fn last_text(&self) -> Option<String> {
        self.calls().into_iter().rev().find_map(|c| match c {
            BotCall::Send(message) => Some(message.text),
            BotCall::Edit(edit) => Some(edit.text),
            BotCall::MediaGroup { caption, .. } => caption,
            _ => None,
        })
    }

    pub fn last_keyboard_data(&self) -> Vec<String> {
        let keyboard = self.calls().into_iter().rev().find_map(|c| match c {
            BotCall::Send(message) => Some(message.reply_markup),
            BotCall::Edit(edit) => Some(edit.reply_markup),
            _ => None,
        });
        keyboard
            .flatten()
            .map(|rows| rows.into_iter().flatten().map(|b| b.callback_data).collect())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }

    pub fn fail_next_send(&self) {
        self.fail_send.store(true, Ordering::SeqCst);
    }

    pub fn fail_get_me(&self, fail: bool) {
        self.fail_get_me.store(fail, Ordering::SeqCst);
    }

    /// Queues the answer of one `getUpdates` call. Updates are returned as given,
    /// even when their ids are below the requested offset.
    pub fn queue_updates(&self, updates: Vec<Update>) {
        if let Ok(mut batches) = self.batches.lock() {
            batches.push_back(updates);
        }
    }

    /// `(offset, timeout)` of every `getUpdates` call.
    pub fn polls(&self) -> Vec<(i64, u64)> {
        self.offsets.lock().map(|o| o.clone()).unwrap_or_default()
    }

    pub fn add_file(&self, file_id: &str, bytes: Vec<u8>) {
        if let Ok(mut files) = self.files.lock() {
            files.insert(file_id.to_string(), bytes);
        }
    }

    fn message(&self, chat_id: &str, text: Option<String>) -> Message {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 100;
        Message {
            message_id: id,
            from: None,
            chat: Chat {
                id: chat_id.parse().unwrap_or_default(),
                chat_type: "private".to_string(),
                title: None,
                username: None,
                first_name: None,
                last_name: None,
            },
            date: None,
            text,
            caption: None,
            document: None,
            new_chat_photo: None,
            delete_chat_photo: None,
            new_chat_title: None,
            left_chat_member: None,
        }
    }
}

#[async_trait]
impl BotApi for FakeBot {
    async fn get_me(&self) -> Result<User> {
        if self.fail_get_me.load(Ordering::SeqCst) {
            bail!("telegram getMe request failed: connection refused");
        }
        Ok(User {
            id: 999,
            is_bot: true,
            first_name: "Printer".to_string(),
            last_name: None,
            username: Some(BOT_USERNAME.to_string()),
        })
    }

    async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Update>> {
        if let Ok(mut offsets) = self.offsets.lock() {
            offsets.push((offset, timeout_secs));
        }
        Ok(self
            .batches
            .lock()
            .ok()
            .and_then(|mut b| b.pop_front())
            .unwrap_or_default())
    }

    async fn send_message(&self, message: &SendMessage) -> Result<Message> {
        if self.fail_send.swap(false, Ordering::SeqCst) {
            bail!("telegram sendMessage responded with code 400. Response was: can't parse entities");
        }
        self.record(BotCall::Send(message.clone()));
        Ok(self.message(&message.chat_id, Some(message.text.clone())))
    }

    async fn edit_message_text(&self, edit: &EditMessage) -> Result<()> {
        self.record(BotCall::Edit(edit.clone()));
        Ok(())
    }

    async fn send_media_group(&self, group: MediaGroup) -> Result<Vec<Message>> {
        self.record(BotCall::MediaGroup {
            chat_id: group.chat_id.clone(),
            items: group.items.len(),
            caption: group.items.first().and_then(|i| i.caption.clone()),
        });
        Ok(vec![self.message(&group.chat_id, None)])
    }

    async fn send_document(&self, chat_id: &str, file_name: &str, bytes: Vec<u8>, _caption: &str) -> Result<()> {
        self.record(BotCall::Document {
            chat_id: chat_id.to_string(),
            file_name: file_name.to_string(),
            size: bytes.len(),
        });
        Ok(())
    }

    async fn send_chat_action(&self, _chat_id: &str, _action: &str) -> Result<()> {
        Ok(())
    }

    async fn delete_message(&self, chat_id: &str, message_id: i64) -> Result<()> {
        self.record(BotCall::Delete {
            chat_id: chat_id.to_string(),
            message_id,
        });
        Ok(())
    }

    async fn answer_callback_query(&self, callback_query_id: &str) -> Result<()> {
        self.record(BotCall::Answer(callback_query_id.to_string()));
        Ok(())
    }

    async fn get_file(&self, file_id: &str) -> Result<File> {
        Ok(File {
            file_id: file_id.to_string(),
            file_path: Some(format!("documents/{}", file_id)),
            file_size: None,
        })
    }

    async fn download_file(&self, file_path: &str) -> Result<Vec<u8>> {
        let file_id = file_path.trim_start_matches("documents/");
        self.files
            .lock()
            .ok()
            .and_then(|f| f.get(file_id).cloned())
            .ok_or_else(|| anyhow!("no such file {}", file_path))
    }

    async fn get_chat(&self, chat_id: &str) -> Result<ChatInfo> {
        Ok(ChatInfo {
            id: chat_id.parse().unwrap_or_default(),
            title: None,
            photo: None,
        })
    }

    async fn get_user_profile_photos(&self, _user_id: &str, _limit: u32) -> Result<UserProfilePhotos> {
        Ok(UserProfilePhotos::default())
    }

    async fn set_my_commands(&self, commands: &[BotCommand]) -> Result<()> {
        self.record(BotCall::SetCommands(commands.to_vec()));
        Ok(())
    }

    async fn get_my_commands(&self) -> Result<Vec<BotCommand>> {
        Ok(Vec::new())
    }
}

struct PrinterInner {
    snapshot: PrinterSnapshot,
    job: JobSnapshot,
    connection: ConnectionInfo,
    profiles: Vec<PrinterProfile>,
    connect_state: String,
    calls: Vec<String>,
}

pub struct FakePrinter {
    inner: Mutex<PrinterInner>,
}

impl Default for FakePrinter {
    fn default() -> Self {
        let mut connection = ConnectionInfo::default();
        connection.current.state = "Closed".to_string();
        Self {
            inner: Mutex::new(PrinterInner {
                snapshot: PrinterSnapshot::offline(),
                job: JobSnapshot::default(),
                connection,
                profiles: Vec::new(),
                connect_state: "Operational".to_string(),
                calls: Vec::new(),
            }),
        }
    }
}

impl FakePrinter {
    fn with<R>(&self, f: impl FnOnce(&mut PrinterInner) -> R) -> R {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut inner)
    }

    fn set_flags(&self, text: &str, flags: PrinterFlags) {
        self.with(|p| {
            p.snapshot.state.text = text.to_string();
            p.snapshot.state.flags = flags;
            p.connection.current.state = text.to_string();
        });
    }

    pub fn set_operational(&self, operational: bool) {
        if operational {
            self.set_flags(
                "Operational",
                PrinterFlags {
                    operational: true,
                    ready: true,
                    ..PrinterFlags::default()
                },
            );
        } else {
            self.with(|p| {
                p.snapshot.state = PrinterSnapshot::offline().state;
                p.connection.current.state = "Closed".to_string();
            });
        }
    }

    pub fn set_printing(&self, printing: bool) {
        if printing {
            self.set_flags(
                "Printing",
                PrinterFlags {
                    operational: true,
                    printing: true,
                    ..PrinterFlags::default()
                },
            );
        } else {
            self.set_operational(true);
        }
    }

    pub fn set_paused(&self) {
        self.set_flags(
            "Paused",
            PrinterFlags {
                operational: true,
                paused: true,
                ..PrinterFlags::default()
            },
        );
    }

    pub fn set_temperature_reading(&self, heater: &str, actual: f64, target: f64) {
        self.with(|p| {
            p.snapshot.temperature.insert(
                heater.to_string(),
                Temperature {
                    actual: Some(actual),
                    target: Some(target),
                },
            );
        });
    }

    pub fn set_job(&self, job: JobSnapshot) {
        self.with(|p| p.job = job);
    }

    pub fn set_connection(&self, connection: ConnectionInfo) {
        self.with(|p| p.connection = connection);
    }

    pub fn set_profiles(&self, profiles: Vec<PrinterProfile>) {
        self.with(|p| p.profiles = profiles);
    }

    /// State the connection reaches after `connect`.
    pub fn connect_settles_to(&self, state: &str) {
        self.with(|p| p.connect_state = state.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.with(|p| p.calls.clone())
    }

    fn record(&self, call: String) {
        self.with(|p| p.calls.push(call));
    }
}

#[async_trait]
impl PrinterControl for FakePrinter {
    async fn printer(&self) -> Result<PrinterSnapshot> {
        Ok(self.with(|p| p.snapshot.clone()))
    }

    async fn job(&self) -> Result<JobSnapshot> {
        Ok(self.with(|p| p.job.clone()))
    }

    async fn connection(&self) -> Result<ConnectionInfo> {
        Ok(self.with(|p| p.connection.clone()))
    }

    async fn connect(&self, request: &ConnectRequest) -> Result<()> {
        self.record(format!(
            "connect {} {} {}",
            request.port.as_deref().unwrap_or("AUTO"),
            request.baudrate.map(|b| b.to_string()).unwrap_or_else(|| "AUTO".to_string()),
            request.printer_profile.as_deref().unwrap_or("-")
        ));
        let state = self.with(|p| p.connect_state.clone());
        if state == "Operational" {
            self.set_operational(true);
        } else {
            self.with(|p| p.connection.current.state = state);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.record("disconnect".to_string());
        self.set_operational(false);
        Ok(())
    }

    async fn start_print(&self) -> Result<()> {
        self.record("start".to_string());
        self.set_printing(true);
        Ok(())
    }

    async fn unselect(&self) -> Result<()> {
        self.record("unselect".to_string());
        self.with(|p| p.job.job.file = Default::default());
        Ok(())
    }

    async fn cancel_print(&self) -> Result<()> {
        self.record("cancel".to_string());
        Ok(())
    }

    async fn toggle_pause(&self) -> Result<()> {
        self.record("toggle_pause".to_string());
        Ok(())
    }

    async fn home(&self, axes: &[&str]) -> Result<()> {
        self.record(format!("home {}", axes.join("")));
        Ok(())
    }

    async fn set_temperature(&self, heater: &str, target: f64) -> Result<()> {
        self.record(format!("temp {} {}", heater, target));
        Ok(())
    }

    async fn feed_rate(&self, percent: u32) -> Result<()> {
        self.record(format!("feed {}", percent));
        Ok(())
    }

    async fn flow_rate(&self, percent: u32) -> Result<()> {
        self.record(format!("flow {}", percent));
        Ok(())
    }

    async fn commands(&self, commands: &[String]) -> Result<()> {
        self.record(format!("gcode {}", commands.join(";")));
        Ok(())
    }

    async fn script(&self, name: &str) -> Result<()> {
        self.record(format!("script {}", name));
        Ok(())
    }

    async fn profiles(&self) -> Result<Vec<PrinterProfile>> {
        Ok(self.with(|p| p.profiles.clone()))
    }
}

#[derive(Debug, Clone)]
struct StoredFile {
    folder: bool,
    date: Option<i64>,
    bytes: Vec<u8>,
}

/// File tree keyed by `(origin, path)`; folders are explicit entries.
#[derive(Default)]
pub struct FakeFiles {
    entries: Mutex<BTreeMap<(String, String), StoredFile>>,
    busy: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
}

impl FakeFiles {
    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<(String, String), StoredFile>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Adds a file and its parent folders.
    pub fn put(&self, origin: &str, path: &str, date: i64, bytes: &[u8]) {
        let mut entries = self.entries();
        let mut prefix = String::new();
        let parts: Vec<&str> = path.split('/').collect();
        for part in &parts[..parts.len().saturating_sub(1)] {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(part);
            entries.entry((origin.to_string(), prefix.clone())).or_insert(StoredFile {
                folder: true,
                date: None,
                bytes: Vec::new(),
            });
        }
        entries.insert(
            (origin.to_string(), path.to_string()),
            StoredFile {
                folder: false,
                date: Some(date),
                bytes: bytes.to_vec(),
            },
        );
    }

    pub fn mark_busy(&self, path: &str) {
        if let Ok(mut busy) = self.busy.lock() {
            busy.insert(path.to_string());
        }
    }

    pub fn paths(&self, origin: &str) -> Vec<String> {
        self.entries()
            .keys()
            .filter(|(o, _)| o == origin)
            .map(|(_, p)| p.clone())
            .collect()
    }

    fn node(origin: &str, path: &str, file: &StoredFile, children: Vec<FileEntry>) -> FileEntry {
        FileEntry {
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            path: path.to_string(),
            kind: if file.folder { "folder" } else { "machinecode" }.to_string(),
            origin: origin.to_string(),
            date: file.date,
            size: (!file.folder).then_some(file.bytes.len() as u64),
            children,
            ..FileEntry::default()
        }
    }

    fn children(entries: &BTreeMap<(String, String), StoredFile>, origin: &str, parent: &str) -> Vec<FileEntry> {
        entries
            .iter()
            .filter(|((o, path), _)| {
                o == origin
                    && match path.rsplit_once('/') {
                        Some((dir, _)) => dir == parent,
                        None => parent.is_empty(),
                    }
            })
            .map(|((_, path), file)| {
                let children = if file.folder {
                    Self::children(entries, origin, path)
                } else {
                    Vec::new()
                };
                Self::node(origin, path, file, children)
            })
            .collect()
    }
}

#[async_trait]
impl FileStorage for FakeFiles {
    async fn list(&self) -> Result<Vec<FileEntry>> {
        let entries = self.entries();
        let origins: HashSet<String> = entries.keys().map(|(o, _)| o.clone()).collect();
        let mut origins: Vec<String> = origins.into_iter().collect();
        origins.sort();
        Ok(origins
            .iter()
            .flat_map(|origin| Self::children(&entries, origin, ""))
            .collect())
    }

    async fn entry(&self, origin: &str, path: &str) -> Result<Option<FileEntry>> {
        let entries = self.entries();
        Ok(entries
            .get(&(origin.to_string(), path.to_string()))
            .map(|file| Self::node(origin, path, file, Vec::new())))
    }

    async fn add_folder(&self, origin: &str, path: &str) -> Result<()> {
        self.record(format!("add_folder {}", path));
        self.entries()
            .entry((origin.to_string(), path.to_string()))
            .or_insert(StoredFile {
                folder: true,
                date: None,
                bytes: Vec::new(),
            });
        Ok(())
    }

    async fn add_file(&self, origin: &str, folder: &str, name: &str, bytes: Vec<u8>) -> Result<String> {
        let path = if folder.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", folder, name)
        };
        self.record(format!("add_file {}", path));
        self.put(origin, &path, 1_700_000_000, &bytes);
        Ok(path)
    }

    async fn select(&self, origin: &str, path: &str, print: bool) -> Result<()> {
        self.record(format!("select {}/{} {}", origin, path, print));
        Ok(())
    }

    async fn copy(&self, origin: &str, source: &str, destination: &str) -> Result<()> {
        self.record(format!("copy {} {}", source, destination));
        let mut entries = self.entries();
        let file = entries
            .get(&(origin.to_string(), source.to_string()))
            .cloned()
            .ok_or_else(|| anyhow!("Source does not exist"))?;
        entries.insert((origin.to_string(), destination.to_string()), file);
        Ok(())
    }

    async fn move_entry(&self, origin: &str, source: &str, destination: &str) -> Result<()> {
        self.record(format!("move {} {}", source, destination));
        let mut entries = self.entries();
        let file = entries
            .remove(&(origin.to_string(), source.to_string()))
            .ok_or_else(|| anyhow!("Source does not exist"))?;
        entries.insert((origin.to_string(), destination.to_string()), file);
        Ok(())
    }

    async fn remove(&self, origin: &str, path: &str) -> Result<()> {
        self.record(format!("remove {}", path));
        let mut entries = self.entries();
        entries.retain(|(o, p), _| !(o == origin && (p == path || p.starts_with(&format!("{}/", path)))));
        Ok(())
    }

    async fn is_busy(&self, _origin: &str, path: &str) -> Result<bool> {
        Ok(self.busy.lock().map(|b| b.contains(path)).unwrap_or(false))
    }

    async fn download(&self, origin: &str, path: &str) -> Result<Vec<u8>> {
        self.entries()
            .get(&(origin.to_string(), path.to_string()))
            .map(|f| f.bytes.clone())
            .ok_or_else(|| anyhow!("no such file {}", path))
    }
}

struct HostInner {
    plugins: Vec<String>,
    settings: Value,
    system_commands: Vec<SystemCommand>,
    controls: Value,
    replies: HashMap<String, PluginReply>,
    calls: Vec<String>,
}

pub struct FakeHost {
    inner: Mutex<HostInner>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self {
            inner: Mutex::new(HostInner {
                plugins: Vec::new(),
                settings: json!({}),
                system_commands: Vec::new(),
                controls: json!([]),
                replies: HashMap::new(),
                calls: Vec::new(),
            }),
        }
    }
}

impl FakeHost {
    fn with<R>(&self, f: impl FnOnce(&mut HostInner) -> R) -> R {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut inner)
    }

    pub fn set_plugins(&self, plugins: &[&str]) {
        self.with(|h| h.plugins = plugins.iter().map(|p| p.to_string()).collect());
    }

    pub fn set_settings(&self, settings: Value) {
        self.with(|h| h.settings = settings);
    }

    pub fn set_system_commands(&self, commands: Vec<SystemCommand>) {
        self.with(|h| h.system_commands = commands);
    }

    pub fn set_controls(&self, controls: Value) {
        self.with(|h| h.controls = controls);
    }

    /// Reply for `plugin_api(plugin, ..)` or `plugin_get/patch(path)`.
    pub fn reply(&self, key: &str, status: u16, body: Value) {
        self.with(|h| h.replies.insert(key.to_string(), PluginReply { status, body }));
    }

    pub fn calls(&self) -> Vec<String> {
        self.with(|h| h.calls.clone())
    }

    fn answer(&self, key: &str, call: String) -> PluginReply {
        self.with(|h| {
            h.calls.push(call);
            h.replies.get(key).cloned().unwrap_or(PluginReply {
                status: 200,
                body: json!({}),
            })
        })
    }
}

fn merge(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                merge(target.entry(key).or_insert(Value::Null), value);
            }
        }
        (target, patch) => *target = patch,
    }
}

#[async_trait]
impl HostServices for FakeHost {
    async fn installed_plugins(&self) -> Result<Vec<String>> {
        Ok(self.with(|h| h.plugins.clone()))
    }

    async fn settings(&self) -> Result<Value> {
        Ok(self.with(|h| h.settings.clone()))
    }

    async fn update_settings(&self, patch: Value) -> Result<()> {
        self.with(|h| {
            h.calls.push(format!("settings {}", patch));
            merge(&mut h.settings, patch);
        });
        Ok(())
    }

    async fn set_default_profile(&self, profile_id: &str) -> Result<()> {
        self.with(|h| h.calls.push(format!("default_profile {}", profile_id)));
        Ok(())
    }

    async fn system_commands(&self) -> Result<Vec<SystemCommand>> {
        Ok(self.with(|h| h.system_commands.clone()))
    }

    async fn run_system_command(&self, source: &str, action: &str) -> Result<()> {
        self.with(|h| h.calls.push(format!("system {}/{}", source, action)));
        Ok(())
    }

    async fn custom_controls(&self) -> Result<Value> {
        Ok(self.with(|h| h.controls.clone()))
    }

    async fn plugin_api(&self, plugin: &str, payload: Value) -> Result<PluginReply> {
        let command = payload.get("command").and_then(Value::as_str).unwrap_or_default().to_string();
        Ok(self.answer(plugin, format!("api {} {}", plugin, command)))
    }

    async fn plugin_get(&self, path: &str) -> Result<PluginReply> {
        Ok(self.answer(path, format!("get {}", path)))
    }

    async fn plugin_patch(&self, path: &str, body: Value) -> Result<PluginReply> {
        Ok(self.answer(path, format!("patch {} {}", path, body)))
    }

    async fn fetch(&self, url: &str, _timeout: Duration) -> Result<Vec<u8>> {
        bail!("no network in tests: {}", url)
    }
}

pub struct Harness {
    pub ctx: Arc<BridgeContext>,
    pub bot: Arc<FakeBot>,
    pub printer: Arc<FakePrinter>,
    pub files: Arc<FakeFiles>,
    pub host: Arc<FakeHost>,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(Config::default(), Capabilities::default()).await
    }

    pub async fn with_notifications(notifications: NotificationsConfig) -> Self {
        let config = Config {
            notifications,
            ..Config::default()
        };
        Self::with_config(config, Capabilities::default()).await
    }

    pub async fn with_capabilities(capabilities: Capabilities) -> Self {
        Self::with_config(Config::default(), capabilities).await
    }

    pub async fn with_config(config: Config, capabilities: Capabilities) -> Self {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {}", e));
        let bot = Arc::new(FakeBot::default());
        let printer = Arc::new(FakePrinter::default());
        let files = Arc::new(FakeFiles::default());
        let host = Arc::new(FakeHost::default());

        let api: Arc<dyn BotApi> = bot.clone();
        let printer_dyn: Arc<dyn PrinterControl> = printer.clone();
        let files_dyn: Arc<dyn FileStorage> = files.clone();
        let host_dyn: Arc<dyn HostServices> = host.clone();

        let store = Arc::new(ChatStore::in_memory(BridgeState::seeded(&config.notifications)));
        let status = Arc::new(ConnectionStatus::default());
        let shutdown = Shutdown::new();
        let emoji = octogram_telegram::Emoji::new(config.telegram.send_icon);
        let media = Arc::new(MediaCapture::new(
            config.media.clone(),
            Arc::clone(&host_dyn),
            Arc::clone(&printer_dyn),
            dir.path().to_path_buf(),
        ));
        let sink = Arc::new(SendSink::new(
            Arc::clone(&api),
            Arc::clone(&store),
            Arc::clone(&host_dyn),
            media,
            Arc::clone(&status),
        ));
        let notifier = Arc::new(Notifier::new(
            config.notifications.clone(),
            Arc::clone(&printer_dyn),
            Arc::clone(&files_dyn),
            Arc::clone(&host_dyn),
            capabilities.clone(),
            Arc::clone(&store),
            Arc::clone(&sink),
            emoji,
            shutdown.clone(),
        ));

        let ctx = Arc::new(BridgeContext {
            policy: PolicyEngine::new(Some(&config.notifications)),
            config,
            api,
            printer: printer_dyn,
            files: files_dyn,
            host: host_dyn,
            capabilities,
            store,
            sessions: Sessions::default(),
            sink,
            notifier,
            emoji,
            status,
            shutdown,
            data_dir: dir.path().to_path_buf(),
        });

        Self {
            ctx,
            bot,
            printer,
            files,
            host,
            _dir: dir,
        }
    }

    /// Registers a chat that accepts every command; `subscribed` also turns on
    /// notifications for every event.
    pub async fn add_chat(&self, chat_id: &str, subscribed: bool) {
        let commands = crate::commands::permission_keys();
        let events = crate::notify::notification_keys();
        let mut record = ChatRecord::new(&commands, &events);
        record.new = false;
        record.accept_commands = true;
        record.commands.values_mut().for_each(|v| *v = true);
        record.send_notifications = subscribed;
        if subscribed {
            record.notifications.values_mut().for_each(|v| *v = true);
        }
        record.private = !octogram_config::is_group_chat(chat_id);
        record.chat_type = if record.private { "private" } else { "group" }.to_string();
        record.title = format!("Chat {}", chat_id);
        if let Err(e) = self.ctx.store.upsert(chat_id, record).await {
            panic!("upsert chat {}: {}", chat_id, e);
        }
    }

    /// A registered chat that may only run `commands`.
    pub async fn add_chat_allowing(&self, chat_id: &str, commands: &[&str]) {
        let keys = crate::commands::permission_keys();
        let events = crate::notify::notification_keys();
        let mut record = ChatRecord::new(&keys, &events);
        record.new = false;
        record.accept_commands = true;
        for command in commands {
            record.commands.insert(command.to_string(), true);
        }
        if let Err(e) = self.ctx.store.upsert(chat_id, record).await {
            panic!("upsert chat {}: {}", chat_id, e);
        }
    }

    /// A registered chat with every permission switched off.
    pub async fn add_locked_chat(&self, chat_id: &str) {
        let commands = crate::commands::permission_keys();
        let events = crate::notify::notification_keys();
        let mut record = ChatRecord::new(&commands, &events);
        record.new = false;
        if let Err(e) = self.ctx.store.upsert(chat_id, record).await {
            panic!("upsert chat {}: {}", chat_id, e);
        }
    }
}

/// A text message update from a private chat.
pub fn text_update(update_id: i64, chat_id: i64, text: &str) -> Update {
    let raw = json!({
        "update_id": update_id,
        "message": {
            "message_id": update_id,
            "from": {"id": chat_id.abs(), "first_name": "Ada", "username": "ada"},
            "chat": {"id": chat_id, "type": if chat_id < 0 { "group" } else { "private" }, "title": "Lab", "first_name": "Ada"},
            "text": text
        }
    });
    serde_json::from_value(raw).unwrap_or_else(|e| panic!("update: {}", e))
}

/// An inline button press from a private chat.
pub fn callback_update(update_id: i64, chat_id: i64, data: &str) -> Update {
    let raw = json!({
        "update_id": update_id,
        "callback_query": {
            "id": format!("cb{}", update_id),
            "from": {"id": chat_id.abs(), "first_name": "Ada", "username": "ada"},
            "message": {"message_id": 1, "chat": {"id": chat_id, "type": "private"}},
            "data": data
        }
    });
    serde_json::from_value(raw).unwrap_or_else(|e| panic!("update: {}", e))
}
