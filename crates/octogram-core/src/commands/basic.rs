//! One-shot commands: status, media, print control, muting and help.

use super::{marker, marker_if, visible, Invocation};
use crate::context::BridgeContext;
use anyhow::{anyhow, Result};
use octogram_ipc::{InlineButton, Markup};
use octogram_telegram::markup::escape_html;
use tracing::{info, warn};

pub async fn yes(ctx: &BridgeContext, inv: &Invocation) -> Result<()> {
    let edit = marker(ctx, inv).await;
    ctx.sink.send(inv.reply("Alright.").with_edit(edit).inline(false)).await;
    Ok(())
}

pub async fn no(ctx: &BridgeContext, inv: &Invocation) -> Result<()> {
    let edit = marker(ctx, inv).await;
    ctx.sink
        .send(inv.reply("Maybe next time.").with_edit(edit).inline(false))
        .await;
    Ok(())
}

pub async fn status(ctx: &BridgeContext, inv: &Invocation) -> Result<()> {
    let snapshot = ctx.printer.printer().await?;
    if !snapshot.is_operational() {
        let notifications = &ctx.config.notifications;
        let with_gif = notifications.gif_not_connected && ctx.store.send_gif().await;
        let text = format!("{} Not connected to a printer. Use /con to connect.", ctx.emo("warning"));
        ctx.sink
            .send(
                inv.reply(text)
                    .with_image(notifications.image_not_connected)
                    .with_gif(with_gif, 5)
                    .inline(false),
            )
            .await;
        return Ok(());
    }
    let event = if snapshot.is_printing() {
        "StatusPrinting"
    } else {
        "StatusNotPrinting"
    };
    match ctx.notifier.notify_chat(event, &inv.chat_id).await {
        Some(message) => ctx.sink.send(message).await,
        None => warn!("No status template for {}", event),
    }
    Ok(())
}

pub async fn gif(ctx: &BridgeContext, inv: &Invocation, seconds: u64) -> Result<()> {
    let message = if ctx.store.send_gif().await {
        inv.reply(format!("{} Here are your GIF(s)", ctx.emo("video")))
            .with_gif(true, seconds)
    } else {
        inv.reply(format!(
            "{} Sending GIFs is disabled in plugin settings",
            ctx.emo("notallowed")
        ))
    };
    ctx.sink.send(message.inline(false)).await;
    Ok(())
}

pub async fn photo(ctx: &BridgeContext, inv: &Invocation) -> Result<()> {
    let text = format!("{} Here are your photo(s)", ctx.emo("photo"));
    ctx.sink.send(inv.reply(text).with_image(true).inline(false)).await;
    Ok(())
}

pub async fn abort(ctx: &BridgeContext, inv: &Invocation) -> Result<()> {
    let snapshot = ctx.printer.printer().await?;
    let running = snapshot.is_printing() || snapshot.is_paused();
    if inv.param == "stop" && running {
        ctx.printer.cancel_print().await?;
        info!("Print cancelled by {}", inv.user);
        let edit = marker(ctx, inv).await;
        let text = format!("{} Aborting the print.", ctx.emo("info"));
        ctx.sink.send(inv.reply(text).with_edit(edit).inline(false)).await;
        return Ok(());
    }

    if running {
        let text = format!("{} Really abort the currently running print?", ctx.emo("question"));
        let keyboard = vec![vec![
            InlineButton::new(format!("{} Stop print", ctx.emo("check")), "/abort_stop"),
            InlineButton::new(format!("{} Close", ctx.emo("cancel")), "No"),
        ]];
        ctx.sink.send(inv.reply(text).with_keyboard(keyboard)).await;
    } else {
        let edit = marker_if(ctx, inv, inv.param == "stop").await;
        let text = format!(
            "{} Currently I'm not printing, so there is nothing to stop.",
            ctx.emo("info")
        );
        ctx.sink.send(inv.reply(text).with_edit(edit).inline(false)).await;
    }
    Ok(())
}

pub async fn toggle_pause(ctx: &BridgeContext, inv: &Invocation) -> Result<()> {
    let snapshot = ctx.printer.printer().await?;
    let text = if snapshot.is_printing() {
        ctx.printer.toggle_pause().await?;
        format!("{} Pausing the print.", ctx.emo("pause"))
    } else if snapshot.is_paused() {
        ctx.printer.toggle_pause().await?;
        format!("{} Resuming the print.", ctx.emo("resume"))
    } else {
        format!(
            "{} Currently I'm not printing, so there is nothing to pause/resume.",
            ctx.emo("warning")
        )
    };
    ctx.sink.send(inv.reply(text).inline(false)).await;
    Ok(())
}

pub async fn home(ctx: &BridgeContext, inv: &Invocation) -> Result<()> {
    let text = if ctx.printer.printer().await?.is_ready() {
        ctx.printer.home(&["x", "y", "z"]).await?;
        format!("{} Homing.", ctx.emo("home"))
    } else {
        format!("{} I can't go home now.", ctx.emo("warning"))
    };
    ctx.sink.send(inv.reply(text).inline(false)).await;
    Ok(())
}

pub async fn shut_up(ctx: &BridgeContext, inv: &Invocation) -> Result<()> {
    ctx.store.mute(&inv.chat_id).await;
    let text = format!(
        "{} Okay, shutting up until the next print is finished.\nUse /dontshutup to let me talk again before that.",
        ctx.emo("nonotify")
    );
    ctx.sink.send(inv.reply(text).inline(false)).await;
    Ok(())
}

pub async fn dont_shut_up(ctx: &BridgeContext, inv: &Invocation) -> Result<()> {
    ctx.store.unmute(&inv.chat_id).await;
    let text = format!("{} Yay, I can talk again.", ctx.emo("notify"));
    ctx.sink.send(inv.reply(text).inline(false)).await;
    Ok(())
}

pub async fn upload(ctx: &BridgeContext, inv: &Invocation) -> Result<()> {
    let text = format!(
        "{} To upload a gcode file (also accept zip file), just send it to me.\nThe file will be stored in '{}' folder.",
        ctx.emo("info"),
        ctx.config.files.upload_folder
    );
    ctx.sink.send(inv.reply(text).inline(false)).await;
    Ok(())
}

/// Reads the stored record every time; the permissions shown must be the persisted ones.
pub async fn user(ctx: &BridgeContext, inv: &Invocation) -> Result<()> {
    let chat = ctx
        .store
        .get(&inv.chat_id)
        .await
        .ok_or_else(|| anyhow!("chat {} is not registered", inv.chat_id))?;

    let mut text = format!(
        "{} <b>Your user settings:</b>\n\n<b>ID:</b> {}\n<b>Name:</b> {}\n",
        ctx.emo("info"),
        escape_html(&inv.chat_id),
        escape_html(&chat.title)
    );
    if chat.private {
        text.push_str("<b>Type:</b> Private\n\n");
    } else {
        text.push_str("<b>Type:</b> Group\n");
        text.push_str(if chat.accept_commands {
            "<b>Accept-Commands:</b> All users\n\n"
        } else if chat.allow_users {
            "<b>Accept-Commands:</b> Allowed users\n\n"
        } else {
            "<b>Accept-Commands:</b> None\n\n"
        });
    }

    text.push_str("<b>Allowed commands:</b>\n");
    if chat.accept_commands {
        let enabled = enabled_keys(&chat.commands);
        if enabled.is_empty() {
            text.push_str("You are NOT allowed to send any command.\n\n");
        } else {
            text.push_str(&format!("{}\n\n", enabled));
        }
    } else if chat.allow_users {
        text.push_str("Allowed users ONLY. See specific user settings for details.\n\n");
    } else {
        text.push_str("You are NOT allowed to send any command.\n\n");
    }

    text.push_str("<b>Get notification on:</b>\n");
    let notifications = enabled_keys(&chat.notifications);
    if chat.send_notifications && !notifications.is_empty() {
        text.push_str(&format!("{}\n\n", notifications));
    } else {
        text.push_str("You will receive NO notifications.\n\n");
    }

    ctx.sink
        .send(inv.reply(text).with_markup(Markup::Html).inline(false))
        .await;
    Ok(())
}

fn enabled_keys(flags: &std::collections::BTreeMap<String, bool>) -> String {
    flags
        .iter()
        .filter(|(_, enabled)| **enabled)
        .map(|(key, _)| escape_html(key))
        .collect::<Vec<_>>()
        .join(", ")
}

pub async fn help(ctx: &BridgeContext, inv: &Invocation) -> Result<()> {
    let mut text = format!("{} <b>The following commands are known:</b>\n\n", ctx.emo("info"));
    for spec in visible(&ctx.capabilities) {
        text.push_str(&format!(
            "{} - {}\n",
            escape_html(spec.token),
            escape_html(spec.description)
        ));
    }
    ctx.sink
        .send(inv.reply(text.trim_end()).with_markup(Markup::Html).inline(false))
        .await;
    Ok(())
}

/// `/gcode_G28` sends `G28`; several lines may be joined with `;`.
pub async fn gcode(ctx: &BridgeContext, inv: &Invocation) -> Result<()> {
    if !inv.param.is_empty() && inv.param != "back" {
        let lines: Vec<String> = inv
            .param
            .split(';')
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        let text = if !ctx.printer.printer().await?.is_operational() {
            format!("{} Not connected to a printer. Use /con to connect.", ctx.emo("warning"))
        } else {
            info!("Sending {} G-code line(s) for {}", lines.len(), inv.user);
            ctx.printer.commands(&lines).await?;
            format!("{} Sent <code>{}</code>", ctx.emo("check"), escape_html(&lines.join("; ")))
        };
        ctx.sink
            .send(inv.reply(text).with_markup(Markup::Html).inline(false))
            .await;
        return Ok(());
    }
    let edit = marker_if(ctx, inv, inv.param == "back").await;
    let text = format!(
        "{} Use <code>/gcode_XXX</code> to call the command, where <code>XXX</code> is the G-code you want to execute",
        ctx.emo("info")
    );
    ctx.sink
        .send(
            inv.reply(text)
                .with_markup(Markup::Html)
                .with_edit(edit)
                .inline(false),
        )
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{CommandKind, CommandRegistry};
    use crate::testkit::{BotCall, Harness};

    async fn run(h: &Harness, kind: CommandKind, param: &str) {
        let registry = CommandRegistry::new();
        let spec = registry.spec(kind).expect("spec");
        registry
            .execute(&h.ctx, spec, &Invocation::new("42", "42", param))
            .await;
    }

    #[tokio::test]
    async fn gcode_needs_a_connected_printer() {
        let h = Harness::new().await;
        run(&h, CommandKind::Gcode, "G28").await;
        assert!(h.printer.calls().is_empty());
        assert!(h
            .bot
            .last_text()
            .unwrap_or_default()
            .contains("Not connected to a printer"));

        h.printer.set_operational(true);
        run(&h, CommandKind::Gcode, "G28; M117 Hi").await;
        assert_eq!(h.printer.calls(), vec!["gcode G28;M117 Hi"]);
        assert!(h
            .bot
            .last_text()
            .unwrap_or_default()
            .contains("Sent <code>G28; M117 Hi</code>"));
    }

    #[tokio::test]
    async fn status_without_printer_is_a_single_plain_warning() {
        let h = Harness::new().await;
        h.add_chat("42", false).await;
        run(&h, CommandKind::Status, "").await;

        let sent = h.bot.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].text.starts_with(&format!("{} Not connected to a printer", h.ctx.emo("warning"))));
        assert!(sent[0].reply_markup.is_none());
    }

    #[tokio::test]
    async fn status_while_printing_uses_the_progress_template() {
        let h = Harness::new().await;
        h.add_chat("42", false).await;
        h.printer.set_printing(true);
        run(&h, CommandKind::Status, "").await;
        assert!(h.bot.last_text().unwrap_or_default().starts_with("Printing at Z="));
    }

    #[tokio::test]
    async fn abort_asks_before_cancelling() {
        let h = Harness::new().await;
        h.printer.set_printing(true);
        run(&h, CommandKind::Abort, "").await;
        assert!(h.printer.calls().is_empty());
        assert_eq!(h.bot.last_keyboard_data(), vec!["/abort_stop", "No"]);

        run(&h, CommandKind::Abort, "stop").await;
        assert_eq!(h.printer.calls(), vec!["cancel"]);
        let edited = h.bot.calls().into_iter().any(|c| matches!(c, BotCall::Edit(e) if e.text.contains("Aborting the print.")));
        assert!(edited);
    }

    #[tokio::test]
    async fn toggle_pause_needs_a_job() {
        let h = Harness::new().await;
        h.printer.set_operational(true);
        run(&h, CommandKind::TogglePause, "").await;
        assert!(h.printer.calls().is_empty());
        assert!(h.bot.last_text().unwrap_or_default().contains("nothing to pause/resume"));

        h.printer.set_paused();
        run(&h, CommandKind::TogglePause, "").await;
        assert_eq!(h.printer.calls(), vec!["toggle_pause"]);
        assert!(h.bot.last_text().unwrap_or_default().contains("Resuming the print."));
    }

    #[tokio::test]
    async fn shutup_mutes_until_dontshutup() {
        let h = Harness::new().await;
        run(&h, CommandKind::ShutUp, "").await;
        assert!(h.ctx.store.is_muted("42").await);
        run(&h, CommandKind::DontShutUp, "").await;
        assert!(!h.ctx.store.is_muted("42").await);
    }

    #[tokio::test]
    async fn user_reflects_the_stored_permissions() {
        let h = Harness::new().await;
        h.add_locked_chat("42").await;
        run(&h, CommandKind::User, "").await;
        let text = h.bot.last_text().unwrap_or_default();
        assert!(text.contains("<b>Type:</b> Private"));
        assert!(text.contains("You are NOT allowed to send any command."));
        assert!(text.contains("You will receive NO notifications."));
    }

    #[tokio::test]
    async fn help_lists_commands_without_power_entries() {
        let h = Harness::new().await;
        run(&h, CommandKind::Help, "").await;
        let text = h.bot.last_text().unwrap_or_default();
        assert!(text.contains("/status - Sends the current status including a current photo."));
        assert!(text.ends_with("/help - Show this help message."));
        assert!(!text.contains("/on - "));
    }
}
