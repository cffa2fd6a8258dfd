//! Documents sent to the bot: single G-code files or zip archives of them,
//! stored in the upload folder of the local storage.

use crate::context::BridgeContext;
use anyhow::{anyhow, Result};
use octogram_ipc::{InlineButton, OutboundMessage};
use octogram_telegram::{Document, MAX_UPLOAD_BYTES};
use std::io::{Cursor, Read};
use std::path::Path;
use tracing::{debug, info, warn};

const ORIGIN: &str = "local";
const MACHINECODE_EXTENSIONS: &[&str] = &["gcode", "gco", "g"];

/// Last component of a client-supplied name, never a path.
pub fn base_name(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

fn extension(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
}

pub fn is_machinecode(name: &str) -> bool {
    extension(name).is_some_and(|ext| MACHINECODE_EXTENSIONS.contains(&ext.as_str()))
}

pub fn is_zip(name: &str) -> bool {
    extension(name).as_deref() == Some("zip")
}

/// Machine code members of a zip archive, flattened to their base names.
/// Folders, other file types and members over the upload limit are skipped.
pub fn machinecode_members(bytes: &[u8]) -> Result<Vec<(String, Vec<u8>)>> {
    members_within(bytes, MAX_UPLOAD_BYTES)
}

fn members_within(bytes: &[u8], limit: u64) -> Result<Vec<(String, Vec<u8>)>> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| anyhow!("not a readable zip archive: {}", e))?;
    let mut members = Vec::new();
    for index in 0..archive.len() {
        let mut member = match archive.by_index(index) {
            Ok(member) => member,
            Err(e) => {
                warn!("Skipping zip member #{}: {}", index, e);
                continue;
            }
        };
        let name = base_name(member.name()).to_string();
        if member.is_dir() {
            debug!("Ignoring {} while extracting a zip because it's a folder", member.name());
            continue;
        }
        if !is_machinecode(&name) {
            debug!("Ignoring {} while extracting a zip because it has an invalid extension", name);
            continue;
        }
        let mut content = Vec::new();
        if let Err(e) = (&mut member).take(limit + 1).read_to_end(&mut content) {
            warn!("Exception while extracting {} contained in the zip: {}", name, e);
            continue;
        }
        if content.len() as u64 > limit {
            warn!("Ignoring {} while extracting a zip because it is larger than {} bytes", name, limit);
            continue;
        }
        members.push((name, content));
    }
    Ok(members)
}

/// Saves an uploaded document and reports back to the chat. Never fails
/// towards the caller; problems end up in the chat and the log.
pub async fn handle(ctx: &BridgeContext, chat_id: &str, from_id: &str, document: &Document) {
    let file_name = base_name(document.file_name.as_deref().unwrap_or("upload.gcode")).to_string();
    if !ctx.is_allowed(chat_id, from_id, "/upload", false).await {
        warn!("Received file {} from an unauthorized user", file_name);
        let text = format!("{} You are not authorized to upload files", ctx.emo("warning"));
        ctx.sink.send(OutboundMessage::to_chat(text, chat_id).inline(false)).await;
        return;
    }
    if let Err(e) = store(ctx, chat_id, &file_name, document).await {
        warn!("Caught an exception processing file {}: {:#}", file_name, e);
        let text = format!(
            "{} Something went wrong during processing of your file.\nSorry. More details are in log files.",
            ctx.emo("attention")
        );
        ctx.sink.send(OutboundMessage::to_chat(text, chat_id).inline(false)).await;
    }
}

async fn store(ctx: &BridgeContext, chat_id: &str, file_name: &str, document: &Document) -> Result<()> {
    let zipped = is_zip(file_name);
    if !zipped && !is_machinecode(file_name) {
        warn!("Received file {} with invalid extension", file_name);
        let text = format!(
            "{} Sorry, I only accept files with .gcode, .gco or .g or .zip extension",
            ctx.emo("warning")
        );
        ctx.sink.send(OutboundMessage::to_chat(text, chat_id).inline(false)).await;
        return Ok(());
    }

    let text = format!("{} Saving file {}...", ctx.emo("save"), file_name);
    ctx.sink.send(OutboundMessage::to_chat(text, chat_id).inline(false)).await;

    let file = ctx.api.get_file(&document.file_id).await?;
    let path = file
        .file_path
        .ok_or_else(|| anyhow!("telegram returned no path for file {}", document.file_id))?;
    let content = ctx.api.download_file(&path).await?;

    let folder = ctx.config.files.upload_folder.trim_matches('/').to_string();
    ctx.files.add_folder(ORIGIN, &folder).await?;

    let mut added = Vec::new();
    if zipped {
        for (name, bytes) in machinecode_members(&content)? {
            match ctx.files.add_file(ORIGIN, &folder, &name, bytes).await {
                Ok(stored) => {
                    info!("Added file to {}", stored);
                    added.push(stored);
                }
                Err(e) => warn!("Exception while storing {} contained in the zip: {:#}", name, e),
            }
        }
    } else {
        let stored = ctx.files.add_file(ORIGIN, &folder, file_name, content).await?;
        info!("Added file to {}", stored);
        added.push(stored);
    }

    let mut text = if added.is_empty() {
        format!("{} No files were added. Did you upload an empty zip?", ctx.emo("warning"))
    } else {
        format!(
            "{} I've successfully saved the file(s) you sent me as {}",
            ctx.emo("download"),
            added.join(", ")
        )
    };
    let edit = ctx.sink.take_marker(chat_id).await;
    let reply = |text: String| OutboundMessage::to_chat(text, chat_id).with_edit(edit);

    if added.len() != 1 || !ctx.config.files.select_file_upload {
        ctx.sink.send(reply(text).inline(false)).await;
        return Ok(());
    }

    let ready = ctx.printer.printer().await.map(|s| s.is_ready()).unwrap_or(false);
    if !ready {
        text.push_str(" but I can't load it because the printer is not ready");
        ctx.sink.send(reply(text).inline(false)).await;
        return Ok(());
    }
    if let Err(e) = ctx.files.select(ORIGIN, &added[0], false).await {
        warn!("Selecting {} failed: {:#}", added[0], e);
        text.push_str(" but I wasn't able to load the file");
        ctx.sink.send(reply(text).inline(false)).await;
        return Ok(());
    }

    text.push_str(&format!(
        " and it is loaded.\n\n{} Do you want me to start printing it now?",
        ctx.emo("question")
    ));
    let keyboard = vec![vec![
        InlineButton::new(format!("{} Print", ctx.emo("check")), "/print_s"),
        InlineButton::new(format!("{} Cancel", ctx.emo("cancel")), "/print_x"),
    ]];
    ctx.sink.send(reply(text).with_keyboard(keyboard)).await;
    Ok(())
}
