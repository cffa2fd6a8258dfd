//! `/files` and `/print`: paginated file browser, file details and file operations.
//!
//! Callback data cannot hold arbitrary paths, so directories are addressed by
//! an 8 character hash of `origin/dir/` and files by a 32 character hash of
//! their path. The hash to directory table lives in the chat session and is
//! rebuilt from the file tree whenever a lookup misses.

use super::{marker, marker_if, Invocation};
use crate::context::BridgeContext;
use crate::format::{calculate_eta, format_duration, format_filament, format_fuzzy_print_time, format_size, hash_id};
use anyhow::Result;
use chrono::{Local, TimeZone};
use octogram_ipc::{InlineButton, Keyboard, Markup};
use octogram_octoprint::{plugins, FileEntry, FileStorage};
use octogram_telegram::keyboard::rows_of;
use octogram_telegram::markup::{escape, escape_html};
use octogram_telegram::MAX_UPLOAD_BYTES;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::{debug, info, warn};

const PAGE_SIZE: usize = 10;
const RELIST_DELAY_SECS: u64 = 3;
const DIR_HASH_LEN: usize = 8;
const FILE_HASH_LEN: usize = 32;
const DEFAULT_ORIGIN: &str = "local";

#[derive(Debug, Error)]
pub enum FileOpError {
    #[error("Source does not exist")]
    SourceMissing,
    #[error("Destination already exists")]
    DestinationExists,
    #[error("You can't move a file while it is in use")]
    MoveBusy,
    #[error("Trying to delete a file that is currently in use")]
    FileBusy,
    #[error("Trying to delete a folder that contains a file that is currently in use")]
    FolderBusy,
    #[error("Unknown target")]
    UnknownTarget,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    Copy,
    Move,
}

impl Transfer {
    fn past(self) -> &'static str {
        match self {
            Transfer::Copy => "copied",
            Transfer::Move => "moved",
        }
    }

    fn verb(self) -> &'static str {
        match self {
            Transfer::Copy => "Copy",
            Transfer::Move => "Move",
        }
    }
}

fn dir_hash(dir: &str) -> String {
    hash_id(dir, DIR_HASH_LEN)
}

fn file_hash(path: &str) -> String {
    hash_id(path, FILE_HASH_LEN)
}

fn join(folder: &str, name: &str) -> String {
    if folder.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", folder.trim_end_matches('/'), name)
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Copies or moves `source` into `folder`; returns the new path.
pub async fn transfer(
    files: &dyn FileStorage,
    origin: &str,
    op: Transfer,
    source: &str,
    folder: &str,
) -> Result<String, FileOpError> {
    if !files.exists(origin, source).await? {
        return Err(FileOpError::SourceMissing);
    }
    let destination = join(folder, file_name(source));
    if files.exists(origin, &destination).await? {
        return Err(FileOpError::DestinationExists);
    }
    match op {
        Transfer::Copy => files.copy(origin, source, &destination).await?,
        Transfer::Move => {
            if files.is_busy(origin, source).await? {
                return Err(FileOpError::MoveBusy);
            }
            files.move_entry(origin, source, &destination).await?
        }
    }
    Ok(destination)
}

/// Removes a file, or a whole folder on local storage; refuses anything in use.
pub async fn delete(files: &dyn FileStorage, origin: &str, path: &str) -> Result<(), FileOpError> {
    let entry = files.entry(origin, path).await?.ok_or(FileOpError::SourceMissing)?;
    let busy = files.is_busy(origin, path).await?;
    if entry.is_folder() {
        if origin != DEFAULT_ORIGIN {
            return Err(FileOpError::UnknownTarget);
        }
        if busy {
            return Err(FileOpError::FolderBusy);
        }
    } else if busy {
        return Err(FileOpError::FileBusy);
    }
    files.remove(origin, path).await?;
    Ok(())
}

fn add_folders(origin: &str, entry: &FileEntry, table: &mut BTreeMap<String, String>) {
    if !entry.is_folder() {
        return;
    }
    let key = format!("{}/{}/", origin, entry.path);
    table.insert(dir_hash(&key), key);
    for child in &entry.children {
        add_folders(origin, child, table);
    }
}

/// Every origin root and folder of the tree, keyed by its short hash.
pub fn directory_table(tree: &[FileEntry]) -> BTreeMap<String, String> {
    let mut table = BTreeMap::new();
    let root = format!("{}/", DEFAULT_ORIGIN);
    table.insert(dir_hash(&root), root);
    for entry in tree {
        let root = format!("{}/", entry.origin);
        table.insert(dir_hash(&root), root);
        add_folders(&entry.origin, entry, &mut table);
    }
    table
}

fn origins(tree: &[FileEntry]) -> Vec<String> {
    let mut origins: Vec<String> = tree.iter().map(|e| e.origin.clone()).collect();
    origins.sort();
    origins.dedup();
    if origins.is_empty() {
        origins.push(DEFAULT_ORIGIN.to_string());
    }
    origins
}

/// Entries directly inside `dir` (relative, no trailing slash) of `origin`.
fn entries_in<'a>(tree: &'a [FileEntry], origin: &str, dir: &str) -> Vec<&'a FileEntry> {
    let mut level: Vec<&FileEntry> = tree.iter().filter(|e| e.origin == origin).collect();
    for segment in dir.split('/').filter(|s| !s.is_empty()) {
        match level.iter().find(|e| e.is_folder() && e.name == segment) {
            Some(folder) => level = folder.children.iter().collect(),
            None => return Vec::new(),
        }
    }
    level
}

fn find_in<'a>(entries: &'a [FileEntry], hash: &str) -> Option<&'a FileEntry> {
    entries.iter().find_map(|entry| {
        if entry.is_folder() {
            find_in(&entry.children, hash)
        } else if file_hash(&entry.path) == hash {
            Some(entry)
        } else {
            None
        }
    })
}

/// Origin and entry of the file whose path hashes to `hash`.
fn find_file<'a>(tree: &'a [FileEntry], hash: &str) -> Option<(String, &'a FileEntry)> {
    tree.iter().find_map(|top| {
        find_in(std::slice::from_ref(top), hash).map(|entry| (top.origin.clone(), entry))
    })
}

/// Splits `origin/a/b/` into `("origin", "a/b")`.
fn split_dir(full: &str) -> (&str, &str) {
    match full.split_once('/') {
        Some((origin, rest)) => (origin, rest.trim_end_matches('/')),
        None => (full, ""),
    }
}

fn parent_dir(full: &str) -> String {
    let (origin, dir) = split_dir(full);
    match dir.rsplit_once('/') {
        Some((parent, _)) => format!("{}/{}/", origin, parent),
        None => format!("{}/", origin),
    }
}

fn print_label(ctx: &BridgeContext, entry: &FileEntry) -> &'static str {
    match &entry.prints {
        Some(prints) if prints.total() > 0 => match &prints.last {
            Some(last) if last.success => ctx.emo("hooray"),
            Some(_) => ctx.emo("warning"),
            None => ctx.emo("file"),
        },
        _ => ctx.emo("new"),
    }
}

fn format_date(timestamp: i64) -> Option<String> {
    Local
        .timestamp_opt(timestamp, 0)
        .single()
        .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
}

pub async fn handle(ctx: &BridgeContext, inv: &Invocation) -> Result<()> {
    browse(ctx, inv, "/files").await
}

/// `/print_<hash>` loads a file, `/print_s` starts it, `/print_x` backs out.
/// Anything else opens the browser under `/print`.
pub async fn print(ctx: &BridgeContext, inv: &Invocation) -> Result<()> {
    if inv.param.is_empty() || inv.param.contains('|') || inv.param == "back" {
        return browse(ctx, inv, "/print").await;
    }
    match inv.param.as_str() {
        "s" => start(ctx, inv).await,
        "x" => {
            if let Err(e) = ctx.printer.unselect().await {
                warn!("Unselecting the loaded file failed: {:#}", e);
            }
            let edit = marker(ctx, inv).await;
            ctx.sink
                .send(inv.reply("Maybe next time.").with_edit(edit).inline(false))
                .await;
            Ok(())
        }
        hash => load(ctx, inv, hash).await,
    }
}

async fn start(ctx: &BridgeContext, inv: &Invocation) -> Result<()> {
    let job = ctx.printer.job().await?;
    let snapshot = ctx.printer.printer().await?;
    let text = if job.file_name().is_none() {
        format!(
            "{} Uh oh... No file is selected for printing. Did you select one using /files?",
            ctx.emo("warning")
        )
    } else if !snapshot.is_operational() {
        format!("{} Can't start printing: I'm not connected to a printer.", ctx.emo("warning"))
    } else if snapshot.is_printing() {
        format!(
            "{} A print job is already running. You can't print two thing at the same time. Maybe you want to use /abort?",
            ctx.emo("warning")
        )
    } else {
        ctx.printer.start_print().await?;
        info!("Print of {:?} started by {}", job.file_name(), inv.user);
        format!("{} Started the print job.", ctx.emo("rocket"))
    };
    let edit = marker(ctx, inv).await;
    ctx.sink.send(inv.reply(text).with_edit(edit).inline(false)).await;
    Ok(())
}

async fn load(ctx: &BridgeContext, inv: &Invocation, hash: &str) -> Result<()> {
    debug!("Looking for file hash {}", hash);
    let tree = ctx.files.list().await?;
    let edit = marker(ctx, inv).await;
    let Some((origin, entry)) = find_file(&tree, hash) else {
        let text = format!(
            "{} I'm sorry, but I couldn't find the file you wanted me to print. Perhaps you want to have a look at /files again?",
            ctx.emo("warning")
        );
        ctx.sink.send(inv.reply(text).with_edit(edit).inline(false)).await;
        return Ok(());
    };
    if !ctx.printer.printer().await?.is_operational() {
        let text = format!("{} Can't start printing: I'm not connected to a printer.", ctx.emo("warning"));
        ctx.sink.send(inv.reply(text).with_edit(edit).inline(false)).await;
        return Ok(());
    }
    ctx.files.select(&origin, &entry.path, false).await?;
    let text = format!(
        "{} Okay. The file {} is loaded.\n\n{} Do you want me to start printing it now?",
        ctx.emo("info"),
        entry.name,
        ctx.emo("question")
    );
    let keyboard = vec![vec![
        InlineButton::new(format!("{} Print", ctx.emo("play")), "/print_s"),
        InlineButton::new(format!("{} Cancel", ctx.emo("cancel")), "/print_x"),
    ]];
    ctx.sink
        .send(inv.reply(text).with_keyboard(keyboard).with_edit(edit))
        .await;
    Ok(())
}

/// Parsed `dir|page|file|option` browser parameter.
struct Route<'a> {
    dir: &'a str,
    page: usize,
    file: &'a str,
    option: &'a str,
}

impl<'a> Route<'a> {
    fn parse(param: &'a str) -> Self {
        let parts: Vec<&str> = param.split('|').collect();
        Self {
            dir: parts.first().copied().unwrap_or_default(),
            page: parts.get(1).and_then(|p| p.parse().ok()).unwrap_or(0),
            file: parts.get(2).copied().unwrap_or_default(),
            option: parts.get(3).copied().unwrap_or_default(),
        }
    }
}

async fn browse(ctx: &BridgeContext, inv: &Invocation, cmd: &str) -> Result<()> {
    if inv.param.is_empty() || inv.param == "back" {
        return storages(ctx, inv, cmd).await;
    }
    let route = Route::parse(&inv.param);
    let view = Browser { ctx, inv, cmd };
    match (route.file, route.option) {
        ("", "") => view.list(route.dir, route.page, 0).await,
        (file, "") => view.details(route.dir, route.page, file, 0).await,
        (dir, option) if option.starts_with("dir") => view.list(dir, 0, 0).await,
        (file, option) => view.option(route.dir, route.page, file, option).await,
    }
}

async fn storages(ctx: &BridgeContext, inv: &Invocation, cmd: &str) -> Result<()> {
    let tree = ctx.files.list().await?;
    let table = directory_table(&tree);
    ctx.sessions.with(&inv.chat_id, |s| s.files.dirs = table).await;
    let origins = origins(&tree);

    if let [origin] = origins.as_slice() {
        ctx.sink.send(inv.reply("Loading files...")).await;
        let view = Browser { ctx, inv, cmd };
        return view.list(&dir_hash(&format!("{}/", origin)), 0, 0).await;
    }

    let mut keyboard: Keyboard = origins
        .iter()
        .map(|origin| {
            vec![InlineButton::new(
                origin.clone(),
                format!("{}_{}|0", cmd, dir_hash(&format!("{}/", origin))),
            )]
        })
        .collect();
    keyboard.push(vec![InlineButton::new(format!("{} Close", ctx.emo("cancel")), "No")]);
    let edit = marker_if(ctx, inv, inv.param == "back").await;
    let text = format!("{} *Select Storage*", ctx.emo("save"));
    ctx.sink
        .send(
            inv.reply(text)
                .with_keyboard(keyboard)
                .with_markup(Markup::Markdown)
                .with_edit(edit),
        )
        .await;
    Ok(())
}

struct Browser<'a> {
    ctx: &'a BridgeContext,
    inv: &'a Invocation,
    cmd: &'a str,
}

impl Browser<'_> {
    async fn send(&self, text: String, keyboard: Option<Keyboard>, markup: Markup, delay: u64) {
        let edit = marker(self.ctx, self.inv).await;
        let mut message = self.inv.reply(text).with_markup(markup).with_edit(edit).with_delay(delay);
        if let Some(keyboard) = keyboard {
            message = message.with_keyboard(keyboard);
        }
        self.ctx.sink.send(message).await;
    }

    async fn expired(&self) -> Result<()> {
        let text = format!(
            "{} This menu has expired, please use {} again.",
            self.ctx.emo("warning"),
            self.cmd
        );
        self.send(text, None, Markup::Off, 0).await;
        Ok(())
    }

    /// Looks the hash up in the session table, rebuilding it once on a miss.
    async fn resolve_dir(&self, hash: &str) -> Result<Option<String>> {
        let chat = &self.inv.chat_id;
        if let Some(dir) = self
            .ctx
            .sessions
            .with(chat, |s| s.files.dirs.get(hash).cloned())
            .await
        {
            return Ok(Some(dir));
        }
        let table = directory_table(&self.ctx.files.list().await?);
        let dir = table.get(hash).cloned();
        self.ctx.sessions.with(chat, |s| s.files.dirs = table).await;
        Ok(dir)
    }

    async fn list(&self, hash: &str, page: usize, delay: u64) -> Result<()> {
        let ctx = self.ctx;
        let Some(full) = self.resolve_dir(hash).await? else {
            return self.expired().await;
        };
        let (origin, dir) = split_dir(&full);
        let tree = ctx.files.list().await?;
        let entries = entries_in(&tree, origin, dir);

        let mut folders: Vec<&FileEntry> = entries.iter().copied().filter(|e| e.is_folder()).collect();
        folders.sort_by(|a, b| a.name.cmp(&b.name));
        let mut files: Vec<&FileEntry> = entries.iter().copied().filter(|e| e.is_machinecode()).collect();
        if ctx.store.file_order().await {
            files.sort_by(|a, b| b.date.cmp(&a.date));
        } else {
            files.sort_by(|a, b| a.display_stem().cmp(b.display_stem()));
        }

        let total = folders.len() + files.len();
        let pages = total.div_ceil(PAGE_SIZE).max(1);
        let page = page.min(pages - 1);

        let buttons: Vec<InlineButton> = folders
            .iter()
            .map(|folder| {
                let target = dir_hash(&format!("{}{}/", full, folder.name));
                InlineButton::new(
                    format!("{} {}", ctx.emo("folder"), folder.name),
                    format!("{}_{}|0|{}|dir", self.cmd, hash, target),
                )
            })
            .chain(files.iter().map(|file| {
                InlineButton::new(
                    format!("{} {}", print_label(ctx, file), file.display_stem()),
                    format!("{}_{}|{}|{}", self.cmd, hash, page, file_hash(&file.path)),
                )
            }))
            .skip(page * PAGE_SIZE)
            .take(PAGE_SIZE)
            .collect();
        let mut keyboard = rows_of(buttons, 2);

        let mut nav = Vec::new();
        if page > 0 {
            nav.push(InlineButton::new(ctx.emo("left"), format!("{}_{}|{}", self.cmd, hash, page - 1)));
        }
        if page + 1 < pages {
            nav.push(InlineButton::new(ctx.emo("right"), format!("{}_{}|{}", self.cmd, hash, page + 1)));
        }
        if !dir.is_empty() {
            nav.push(InlineButton::new(
                format!("{} Back", ctx.emo("back")),
                format!("{}_{}|0", self.cmd, dir_hash(&parent_dir(&full))),
            ));
        }
        nav.push(InlineButton::new(
            format!("{} Settings", ctx.emo("settings")),
            format!("{}_{}|{}|0|s", self.cmd, hash, page),
        ));
        nav.push(InlineButton::new(format!("{} Close", ctx.emo("cancel")), "No"));
        keyboard.push(nav);

        let text = format!(
            "{} Files in */{}*    \\[{}/{}]",
            ctx.emo("save"),
            escape(Markup::Markdown, dir),
            page + 1,
            pages
        );
        self.send(text, Some(keyboard), Markup::Markdown, delay).await;
        Ok(())
    }

    async fn summary(&self, origin: &str, entry: &FileEntry, title: &str) -> String {
        let ctx = self.ctx;
        let mut text = format!(
            "{} <b>{}</b>\n\n{} <b>Name:</b> {}",
            ctx.emo("info"),
            title,
            ctx.emo("name"),
            escape_html(&entry.path)
        );
        if let Some(date) = entry.date.and_then(format_date) {
            text.push_str(&format!("\n{} <b>Uploaded:</b> {}", ctx.emo("calendar"), date));
        }
        let count = entry.prints.as_ref().map(|p| p.total()).unwrap_or(0);
        text.push_str(&format!(
            "\n{} <b>Number of Print:</b> {}",
            print_label(ctx, entry),
            count
        ));
        text.push_str(&format!("\n{} <b>Size:</b> {}", ctx.emo("filesize"), format_size(entry.size)));

        let Some(analysis) = &entry.analysis else {
            debug!("No analysis for {}/{}", origin, entry.path);
            return text;
        };
        let mut length = 0.0;
        if !analysis.filament.is_empty() {
            text.push_str(&format!("\n{} <b>Filament:</b> ", ctx.emo("filament")));
            match analysis.filament.get("tool0") {
                Some(tool) if analysis.filament.len() == 1 && tool.length.is_some() => {
                    text.push_str(&format_filament(tool));
                    length += tool.length.unwrap_or(0.0);
                }
                _ => {
                    for (tool, usage) in analysis.filament.iter().filter(|(_, u)| u.length.is_some()) {
                        text.push_str(&format!("\n      {}: {}", tool, format_filament(usage)));
                        length += usage.length.unwrap_or(0.0);
                    }
                }
            }
        }
        if let Some(seconds) = analysis.estimated_print_time {
            text.push_str(&format!(
                "\n{} <b>Print Time:</b> {}",
                ctx.emo("stopwatch"),
                format_fuzzy_print_time(Some(seconds))
            ));
            match calculate_eta(seconds, &ctx.config.notifications) {
                Ok(eta) => text.push_str(&format!("\n{} <b>Completed Time:</b> {}", ctx.emo("finish"), eta)),
                Err(e) => warn!("Failed to compute completion time: {}", e),
            }
            if ctx.capabilities.cost {
                let cost = match ctx.host.settings().await {
                    Ok(settings) => plugins::cost_settings(&settings)
                        .filter(|_| seconds > 0.0 && length != 0.0)
                        .map(|c| c.estimate(length, seconds)),
                    Err(e) => {
                        warn!("Cost settings unavailable: {}", e);
                        None
                    }
                };
                text.push_str(&format!(
                    "\n{} <b>Cost:</b> {}",
                    ctx.emo("cost"),
                    escape_html(&cost.unwrap_or_else(|| "-".to_string()))
                ));
            }
        }
        text
    }

    async fn not_found(&self) -> Result<()> {
        let text = format!(
            "{} I'm sorry, but I couldn't find that file anymore. Perhaps you want to have a look at {} again?",
            self.ctx.emo("warning"),
            self.cmd
        );
        self.send(text, None, Markup::Off, 0).await;
        Ok(())
    }

    async fn details(&self, dir: &str, page: usize, hash: &str, delay: u64) -> Result<()> {
        let ctx = self.ctx;
        let tree = ctx.files.list().await?;
        let Some((origin, entry)) = find_file(&tree, hash) else {
            return self.not_found().await;
        };
        let text = self.summary(&origin, entry, "File information").await;

        let chat = &self.inv.chat_id;
        let from = &self.inv.from_id;
        let route = format!("{}_{}|{}|{}", self.cmd, dir, page, hash);
        let mut keyboard = Vec::new();
        let mut row = Vec::new();
        if ctx.is_allowed(chat, from, "/print", false).await {
            row.push(InlineButton::new(format!("{} Print", ctx.emo("play")), format!("/print_{}", hash)));
        }
        row.push(InlineButton::new(format!("{} Details", ctx.emo("search")), format!("{}|inf", route)));
        keyboard.push(row);

        let mut row = Vec::new();
        if ctx.is_allowed(chat, from, "/files", false).await {
            keyboard.push(vec![
                InlineButton::new(format!("{} Move", ctx.emo("cut")), format!("{}|m", route)),
                InlineButton::new(format!("{} Copy", ctx.emo("copy")), format!("{}|c", route)),
                InlineButton::new(format!("{} Delete", ctx.emo("delete")), format!("{}|d", route)),
            ]);
            if origin == DEFAULT_ORIGIN {
                row.push(InlineButton::new(format!("{} Download", ctx.emo("download")), format!("{}|dl", route)));
            }
        }
        row.push(InlineButton::new(
            format!("{} Back", ctx.emo("back")),
            format!("{}_{}|{}", self.cmd, dir, page),
        ));
        keyboard.push(row);

        self.send(text, Some(keyboard), Markup::Html, delay).await;
        Ok(())
    }

    async fn option(&self, dir: &str, page: usize, hash: &str, option: &str) -> Result<()> {
        let touches_files = matches!(option, "m" | "c" | "d" | "m_m" | "c_c" | "d_d" | "dl");
        if touches_files
            && !self
                .ctx
                .is_allowed(&self.inv.chat_id, &self.inv.from_id, "/files", false)
                .await
        {
            warn!("Chat {} may not use file option {}", self.inv.chat_id, option);
            let text = format!("You are not allowed to do this! {}", self.ctx.emo("notallowed"));
            self.ctx.sink.send(self.inv.reply(text).inline(false)).await;
            return Ok(());
        }
        match option {
            "m_m" => self.commit_transfer(dir, page, hash, Transfer::Move).await,
            "c_c" => self.commit_transfer(dir, page, hash, Transfer::Copy).await,
            "s_n" | "s_d" => {
                let by_date = option == "s_d";
                self.ctx.store.update(|state| state.file_order = by_date).await?;
                self.list(dir, page, 0).await
            }
            "s" => self.sorting(dir, page, hash).await,
            "inf" => self.info(dir, page, hash).await,
            "dl" => self.download(dir, page, hash).await,
            "m" => self.pick_destination(dir, page, hash, Transfer::Move).await,
            "c" => self.pick_destination(dir, page, hash, Transfer::Copy).await,
            "d" => self.confirm_delete(dir, page, hash).await,
            "d_d" => self.commit_delete(dir, page, hash).await,
            other => {
                warn!("Unknown file option {}", other);
                self.list(dir, page, 0).await
            }
        }
    }

    async fn info(&self, dir: &str, page: usize, hash: &str) -> Result<()> {
        let ctx = self.ctx;
        let tree = ctx.files.list().await?;
        let Some((origin, entry)) = find_file(&tree, hash) else {
            return self.not_found().await;
        };
        let mut text = self.summary(&origin, entry, "Detailed File information").await;

        let profiles: HashMap<String, String> = match ctx.printer.profiles().await {
            Ok(profiles) => profiles.into_iter().map(|p| (p.id, p.name)).collect(),
            Err(e) => {
                warn!("Printer profiles unavailable: {}", e);
                HashMap::new()
            }
        };
        let profile_name = |id: &str| escape_html(profiles.get(id).map(String::as_str).unwrap_or(id));

        if let Some(stats) = &entry.statistics {
            if !stats.average_print_time.is_empty() {
                text.push_str("\n<b>Average Print Time:</b>");
                for (profile, seconds) in &stats.average_print_time {
                    text.push_str(&format!("\n      {}: {}", profile_name(profile), format_duration(Some(*seconds))));
                }
            }
            if !stats.last_print_time.is_empty() {
                text.push_str("\n<b>Last Print Time:</b>");
                for (profile, seconds) in &stats.last_print_time {
                    text.push_str(&format!("\n      {}: {}", profile_name(profile), format_duration(Some(*seconds))));
                }
            }
        }
        if let Some(last) = entry.prints.as_ref().and_then(|p| p.last.as_ref()) {
            text.push_str("\n\n<b>Print History:</b> ");
            if let Some(date) = last.date.and_then(|d| format_date(d as i64)) {
                text.push_str(&format!("\n      Timestamp: {}", date));
            }
            if last.print_time.is_some() {
                text.push_str(&format!("\n      Print Time: {}", format_duration(last.print_time)));
            }
            text.push_str(if last.success {
                "\n      Successful printed"
            } else {
                "\n      Print failed"
            });
            text.push('\n');
        }

        let keyboard = vec![vec![InlineButton::new(
            format!("{} Back", ctx.emo("back")),
            format!("{}_{}|{}|{}", self.cmd, dir, page, hash),
        )]];
        self.send(text, Some(keyboard), Markup::Html, 0).await;
        Ok(())
    }

    async fn download(&self, dir: &str, page: usize, hash: &str) -> Result<()> {
        let ctx = self.ctx;
        let tree = ctx.files.list().await?;
        let Some((origin, entry)) = find_file(&tree, hash) else {
            return self.not_found().await;
        };
        if entry.size.unwrap_or(0) > MAX_UPLOAD_BYTES {
            let text = format!("{} {} is too big (>50MB) to download!", ctx.emo("warning"), entry.path);
            self.send(text, None, Markup::Off, 0).await;
            return self.details(dir, page, hash, RELIST_DELAY_SECS).await;
        }
        let sent = match ctx.files.download(&origin, &entry.path).await {
            Ok(bytes) => ctx.sink.send_document(&self.inv.chat_id, &entry.name, bytes, "").await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!("Sending {} to chat {} failed: {:#}", entry.path, self.inv.chat_id, e);
            let text = format!(
                "{} An error occurred sending your file. Please check logs.",
                ctx.emo("warning")
            );
            self.send(text, None, Markup::Off, 0).await;
        }
        Ok(())
    }

    async fn pick_destination(&self, dir: &str, page: usize, hash: &str, op: Transfer) -> Result<()> {
        let ctx = self.ctx;
        let pending = hash.to_string();
        let table = ctx
            .sessions
            .with(&self.inv.chat_id, |s| {
                s.files.pending_file = Some(pending);
                s.files.dirs.clone()
            })
            .await;
        let option = match op {
            Transfer::Move => "m_m",
            Transfer::Copy => "c_c",
        };

        let mut keyboard = vec![vec![InlineButton::new(
            format!("{} Back", ctx.emo("back")),
            format!("{}_{}|{}|{}", self.cmd, dir, page, hash),
        )]];
        let mut targets: Vec<(&String, &String)> = table.iter().collect();
        targets.sort_by(|a, b| a.1.cmp(b.1));
        for (target_hash, path) in targets {
            keyboard.push(vec![InlineButton::new(
                format!("{} {}", ctx.emo("folder"), path),
                format!("{}_{}|{}|{}|{}", self.cmd, dir, page, target_hash, option),
            )]);
        }
        let text = format!(
            "{} *Choose destination to {} file*",
            ctx.emo("question"),
            op.verb().to_lowercase()
        );
        self.send(text, Some(keyboard), Markup::Markdown, 0).await;
        Ok(())
    }

    async fn commit_transfer(&self, dir: &str, page: usize, target: &str, op: Transfer) -> Result<()> {
        let ctx = self.ctx;
        let pending = ctx
            .sessions
            .with(&self.inv.chat_id, |s| s.files.pending_file.take())
            .await;
        let (Some(pending), Some(target_dir)) = (pending, self.resolve_dir(target).await?) else {
            return self.expired().await;
        };
        let tree = ctx.files.list().await?;
        let Some((origin, entry)) = find_file(&tree, &pending) else {
            return self.not_found().await;
        };
        let (target_origin, folder) = split_dir(&target_dir);
        let result = if target_origin == origin {
            transfer(ctx.files.as_ref(), &origin, op, &entry.path, folder).await
        } else {
            Err(FileOpError::UnknownTarget)
        };
        match result {
            Ok(destination) => {
                info!("File {} {} to {}", entry.path, op.past(), destination);
                let text = format!("{} File {} {}", ctx.emo("info"), entry.path, op.past());
                self.send(text, None, Markup::Off, 0).await;
                self.list(dir, page, RELIST_DELAY_SECS).await
            }
            Err(e) => {
                warn!("{} of {} failed: {}", op.verb(), entry.path, e);
                let text = format!(
                    "{} FAILED: {} file {}\nReason: {}",
                    ctx.emo("warning"),
                    op.verb(),
                    entry.path,
                    e
                );
                self.send(text, None, Markup::Off, 0).await;
                self.details(dir, page, &pending, RELIST_DELAY_SECS).await
            }
        }
    }

    async fn confirm_delete(&self, dir: &str, page: usize, hash: &str) -> Result<()> {
        let ctx = self.ctx;
        let tree = ctx.files.list().await?;
        let Some((_, entry)) = find_file(&tree, hash) else {
            return self.not_found().await;
        };
        let route = format!("{}_{}|{}|{}", self.cmd, dir, page, hash);
        let keyboard = vec![vec![
            InlineButton::new(format!("{} Yes", ctx.emo("check")), format!("{}|d_d", route)),
            InlineButton::new(format!("{} No", ctx.emo("cancel")), route),
        ]];
        let text = format!("{} Delete {} ?", ctx.emo("warning"), entry.path);
        self.send(text, Some(keyboard), Markup::Off, 0).await;
        Ok(())
    }

    async fn commit_delete(&self, dir: &str, page: usize, hash: &str) -> Result<()> {
        let ctx = self.ctx;
        let tree = ctx.files.list().await?;
        let Some((origin, entry)) = find_file(&tree, hash) else {
            return self.not_found().await;
        };
        let text = match delete(ctx.files.as_ref(), &origin, &entry.path).await {
            Ok(()) => {
                info!("File {} deleted by {}", entry.path, self.inv.user);
                format!("{} File {} deleted", ctx.emo("info"), entry.path)
            }
            Err(e) => {
                warn!("Delete of {} failed: {}", entry.path, e);
                format!("{} FAILED: Delete file {}\nReason: {}", ctx.emo("warning"), entry.path, e)
            }
        };
        self.send(text, None, Markup::Off, 0).await;
        self.list(dir, page, RELIST_DELAY_SECS).await
    }

    async fn sorting(&self, dir: &str, page: usize, hash: &str) -> Result<()> {
        let ctx = self.ctx;
        let route = format!("{}_{}|{}|{}", self.cmd, dir, page, hash);
        let keyboard = vec![
            vec![
                InlineButton::new(format!("{} By name", ctx.emo("name")), format!("{}|s_n", route)),
                InlineButton::new(format!("{} By date", ctx.emo("calendar")), format!("{}|s_d", route)),
            ],
            vec![InlineButton::new(
                format!("{} Back", ctx.emo("back")),
                format!("{}_{}|{}", self.cmd, dir, page),
            )],
        ];
        let text = format!("{} *Choose sorting order of files*", ctx.emo("question"));
        self.send(text, Some(keyboard), Markup::Markdown, 0).await;
        Ok(())
    }
}
