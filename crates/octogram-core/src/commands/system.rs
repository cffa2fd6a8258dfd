//! `/sys` runs OctoPrint system commands, `/ctrl` runs the custom printer
//! controls. Both list their entries first; nothing runs on a bare call.

use super::{marker, marker_if, Invocation};
use crate::context::BridgeContext;
use crate::format::hash_id;
use anyhow::{bail, Result};
use octogram_ipc::{InlineButton, Keyboard};
use octogram_octoprint::SystemCommand;
use octogram_telegram::keyboard::rows_of;
use serde_json::Value;
use tracing::{info, warn};

const SYS_HASH_LEN: usize = 8;
const CTRL_HASH_LEN: usize = 6;

fn system_hash(command: &SystemCommand) -> String {
    hash_id(&format!("{}/{}", command.source, command.action), SYS_HASH_LEN)
}

/// Splits `do_<hash>` into `(true, hash)`.
fn confirmed(param: &str) -> (bool, &str) {
    match param.strip_prefix("do_") {
        Some(hash) => (true, hash),
        None => (false, param),
    }
}

fn close_row(ctx: &BridgeContext) -> Vec<InlineButton> {
    vec![InlineButton::new(format!("{} Close", ctx.emo("cancel")), "No")]
}

fn confirm_keyboard(ctx: &BridgeContext, execute: String, back: &str) -> Keyboard {
    vec![vec![
        InlineButton::new(format!("{} Execute", ctx.emo("check")), execute),
        InlineButton::new(format!("{} Back", ctx.emo("back")), back),
    ]]
}

pub async fn sys(ctx: &BridgeContext, inv: &Invocation) -> Result<()> {
    let commands: Vec<SystemCommand> = ctx
        .host
        .system_commands()
        .await?
        .into_iter()
        .filter(|c| c.action != "divider")
        .collect();

    if inv.param.is_empty() || inv.param == "back" {
        let buttons = commands
            .iter()
            .map(|c| InlineButton::new(c.name.clone(), format!("/sys_{}", system_hash(c))))
            .collect();
        let mut keyboard = rows_of(buttons, 2);
        let text = if keyboard.is_empty() {
            format!("{}  No known System Commands.", ctx.emo("info"))
        } else {
            format!("{}  The following System Commands are known.", ctx.emo("info"))
        };
        keyboard.push(close_row(ctx));
        let edit = marker_if(ctx, inv, inv.param == "back").await;
        ctx.sink.send(inv.reply(text).with_keyboard(keyboard).with_edit(edit)).await;
        return Ok(());
    }

    let (confirmed, hash) = confirmed(&inv.param);
    let edit = marker(ctx, inv).await;
    let Some(command) = commands.iter().find(|c| system_hash(c) == hash) else {
        let text = format!("{} Sorry, i don't know this System Command.", ctx.emo("warning"));
        ctx.sink.send(inv.reply(text).with_edit(edit).inline(false)).await;
        return Ok(());
    };

    if command.needs_confirm() && !confirmed {
        let text = format!("{} {}\nExecute system command?", ctx.emo("question"), command.name);
        let keyboard = confirm_keyboard(ctx, format!("/sys_do_{}", hash), "/sys_back");
        ctx.sink.send(inv.reply(text).with_keyboard(keyboard).with_edit(edit)).await;
        return Ok(());
    }

    info!("Performing system command {}/{} for {}", command.source, command.action, inv.user);
    let text = match ctx.host.run_system_command(&command.source, &command.action).await {
        Ok(()) => format!("{} System Command {} executed.", ctx.emo("check"), command.name),
        Err(e) => {
            warn!("System command {} failed: {:#}", command.action, e);
            format!("{} Command failed, please check log files", ctx.emo("warning"))
        }
    };
    ctx.sink.send(inv.reply(text).with_edit(edit).inline(false)).await;
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
enum ControlCommand {
    Script(String),
    Gcode(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
struct ControlAction {
    name: String,
    hash: String,
    command: ControlCommand,
    confirm: bool,
}

fn command_lines(value: &Value) -> Vec<String> {
    match value {
        Value::String(line) => vec![line.clone()],
        Value::Array(lines) => lines.iter().filter_map(Value::as_str).map(str::to_string).collect(),
        _ => Vec::new(),
    }
}

/// Flattens the control tree into runnable actions. Controls that take input
/// or parse a regex are skipped; nested names keep their path below the top
/// level container.
fn flatten_controls(tree: &[Value], base: &str, first: &str, out: &mut Vec<ControlAction>) {
    for control in tree {
        let Some(object) = control.as_object() else {
            continue;
        };
        let name = object.get("name").and_then(Value::as_str).unwrap_or_default();
        let first = if base.is_empty() { format!(" {}", name) } else { first.to_string() };

        if let Some(children) = object.get("children").and_then(Value::as_array) {
            flatten_controls(children, &format!("{} {}", base, name), &first, out);
            continue;
        }
        if object.contains_key("regex") || object.contains_key("input") {
            continue;
        }
        let (command, raw) = if let Some(script) = object.get("script").and_then(Value::as_str) {
            (ControlCommand::Script(script.to_string()), script.to_string())
        } else if let Some(value) = object.get("command").or_else(|| object.get("commands")) {
            let lines = command_lines(value);
            let raw = lines.join("\n");
            (ControlCommand::Gcode(lines), raw)
        } else {
            continue;
        };
        out.push(ControlAction {
            name: format!("{} {}", base.replacen(&first, "", 1), name).trim().to_string(),
            hash: hash_id(&format!("{} {}{}", base, name, raw), CTRL_HASH_LEN),
            command,
            confirm: object.contains_key("confirm"),
        });
    }
}

async fn controls(ctx: &BridgeContext) -> Result<Vec<ControlAction>> {
    let tree = ctx.host.custom_controls().await?;
    let Some(tree) = tree.as_array() else {
        bail!("custom controls are not a list: {}", tree);
    };
    let mut actions = Vec::new();
    flatten_controls(tree, "", "", &mut actions);
    Ok(actions)
}

pub async fn ctrl(ctx: &BridgeContext, inv: &Invocation) -> Result<()> {
    if !ctx.printer.printer().await?.is_operational() {
        let text = format!(
            "{} Printer not connected. You can't send any command.",
            ctx.emo("warning")
        );
        ctx.sink.send(inv.reply(text).inline(false)).await;
        return Ok(());
    }
    let actions = controls(ctx).await?;

    if inv.param.is_empty() || inv.param == "back" {
        let mut text = format!("{} The following Printer Controls are known.", ctx.emo("info"));
        if actions.is_empty() {
            text.push_str(&format!("\n\n{} No Printer Control Command found...", ctx.emo("warning")));
        }
        let buttons = actions
            .iter()
            .map(|a| InlineButton::new(a.name.clone(), format!("/ctrl_{}", a.hash)))
            .collect();
        let mut keyboard = rows_of(buttons, 2);
        keyboard.push(close_row(ctx));
        let edit = marker_if(ctx, inv, inv.param == "back").await;
        ctx.sink.send(inv.reply(text).with_keyboard(keyboard).with_edit(edit)).await;
        return Ok(());
    }

    let (confirmed, hash) = confirmed(&inv.param);
    let edit = marker(ctx, inv).await;
    let Some(action) = actions.iter().find(|a| a.hash == hash) else {
        let text = format!("{} Control Command not found.", ctx.emo("warning"));
        ctx.sink.send(inv.reply(text).with_edit(edit).inline(false)).await;
        return Ok(());
    };

    if action.confirm && !confirmed {
        let text = format!("{} {}\nExecute control command?", ctx.emo("question"), action.name);
        let keyboard = confirm_keyboard(ctx, format!("/ctrl_do_{}", hash), "/ctrl_back");
        ctx.sink.send(inv.reply(text).with_keyboard(keyboard).with_edit(edit)).await;
        return Ok(());
    }

    info!("Running control {} for {}", action.name, inv.user);
    let text = match &action.command {
        ControlCommand::Script(script) => match ctx.printer.script(script).await {
            Ok(()) => format!("{} Control Command {} executed.", ctx.emo("check"), action.name),
            Err(e) => {
                warn!("Script {} failed: {:#}", script, e);
                format!("{} Unknown script: {}", ctx.emo("warning"), script)
            }
        },
        ControlCommand::Gcode(lines) => {
            ctx.printer.commands(lines).await?;
            format!("{} Control Command {} executed.", ctx.emo("check"), action.name)
        }
    };
    ctx.sink.send(inv.reply(text).with_edit(edit).inline(false)).await;
    Ok(())
}
