//! `/on`, `/off` and their `SwitchOn`/`SwitchOff` confirmations through
//! PSU Control or one of the smart plug plugins.

use super::{marker, marker_if, Invocation};
use crate::context::BridgeContext;
use anyhow::Result;
use octogram_ipc::InlineButton;
use octogram_octoprint::plugins::{self, SmartPlug};
use octogram_octoprint::PlugPlugin;
use octogram_telegram::keyboard::rows_of;
use tracing::{debug, info, warn};

fn word(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

fn switch_token(on: bool) -> &'static str {
    if on {
        "SwitchOn"
    } else {
        "SwitchOff"
    }
}

async fn ask(ctx: &BridgeContext, inv: &Invocation, on: bool, target: Option<&str>) {
    let data = match target {
        Some(address) => format!("{}_{}", switch_token(on), address),
        None => switch_token(on).to_string(),
    };
    let text = format!("{} Turn {} the Printer?\n\n", ctx.emo("question"), word(on));
    let keyboard = vec![vec![
        InlineButton::new(format!("{} Yes", ctx.emo("check")), data),
        InlineButton::new(format!("{} No", ctx.emo("cancel")), "No"),
    ]];
    ctx.sink.send(inv.reply(text).with_keyboard(keyboard)).await;
}

pub async fn handle(ctx: &BridgeContext, inv: &Invocation, on: bool) -> Result<()> {
    if ctx.capabilities.psucontrol {
        match plugins::psu_is_on(ctx.host.as_ref()).await {
            Ok(state) if state == on => {
                let text = format!("{} Printer has already been turned {}.", ctx.emo("warning"), word(on));
                ctx.sink.send(inv.reply(text).inline(false)).await;
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => {
                warn!("PSU state unknown: {:#}", e);
                let text = format!("{} Command failed, please check log files", ctx.emo("warning"));
                ctx.sink.send(inv.reply(text).inline(false)).await;
            }
        }
        ask(ctx, inv, on, None).await;
        return Ok(());
    }

    let Some(plugin) = ctx.capabilities.smart_plug else {
        let text = format!(
            "{} PSU Control plugin not found. Command can not be executed.",
            ctx.emo("warning")
        );
        ctx.sink.send(inv.reply(text).inline(false)).await;
        return Ok(());
    };

    if !inv.param.is_empty() && inv.param != "back" {
        let (address, state) = inv.param.rsplit_once('_').unwrap_or((inv.param.as_str(), ""));
        if state == word(on) {
            let text = format!(
                "{} Plug {} has already been turned {}.",
                ctx.emo("warning"),
                address,
                word(on)
            );
            ctx.sink.send(inv.reply(text).inline(false)).await;
            return Ok(());
        }
        return switch_plug(ctx, inv, plugin, address, on).await;
    }

    let plugs = plugins::list_plugs(ctx.host.as_ref(), plugin).await?;
    debug!("{} plugs configured in {}", plugs.len(), plugin.id());
    match plugs.as_slice() {
        [] => {
            let text = format!("{} No plug found in the {} settings.", ctx.emo("warning"), plugin.id());
            ctx.sink.send(inv.reply(text).inline(false)).await;
        }
        [plug] => ask(ctx, inv, on, Some(&plug.address)).await,
        plugs => plug_menu(ctx, inv, on, plugs).await,
    }
    Ok(())
}

async fn plug_menu(ctx: &BridgeContext, inv: &Invocation, on: bool, plugs: &[SmartPlug]) {
    let command = if on { "/on" } else { "/off" };
    let buttons = plugs
        .iter()
        .map(|plug| {
            InlineButton::new(
                plug.label.clone(),
                format!("{}_{}_{}", command, plug.address, plug.state),
            )
        })
        .collect();
    let mut keyboard = rows_of(buttons, 2);
    keyboard.push(vec![InlineButton::new(format!("{} Close", ctx.emo("cancel")), "No")]);
    let text = format!("Which plug would you turn {} ", word(on));
    let edit = marker_if(ctx, inv, inv.param == "back").await;
    ctx.sink.send(inv.reply(text).with_keyboard(keyboard).with_edit(edit)).await;
}

async fn switch_plug(ctx: &BridgeContext, inv: &Invocation, plugin: PlugPlugin, address: &str, on: bool) -> Result<()> {
    info!("Turning {} plug {} via {} for {}", word(on), address, plugin.id(), inv.user);
    let reply = plugins::switch_plug(ctx.host.as_ref(), plugin, address, on).await;
    report(ctx, inv, on, reply).await;
    Ok(())
}

async fn report(ctx: &BridgeContext, inv: &Invocation, on: bool, reply: Result<octogram_octoprint::PluginReply>) {
    let text = match reply {
        Ok(reply) if reply.is_success() => format!("{} Command executed.", ctx.emo("check")),
        Ok(reply) => {
            debug!("Power plugin answered with code {}: {}", reply.status, reply.body);
            format!(
                "{} Something wrong, Power {} attempt failed.",
                ctx.emo("warning"),
                word(on)
            )
        }
        Err(e) => {
            warn!("Power plugin call failed: {:#}", e);
            format!("{} Command failed, please check logs", ctx.emo("warning"))
        }
    };
    let edit = marker(ctx, inv).await;
    ctx.sink.send(inv.reply(text).with_edit(edit).inline(false)).await;
}

/// Confirmation callback: switches the PSU, or the plug named in the parameter.
pub async fn switch(ctx: &BridgeContext, inv: &Invocation, on: bool) -> Result<()> {
    if ctx.capabilities.psucontrol {
        info!("Turning {} the printer PSU for {}", word(on), inv.user);
        let reply = plugins::psu_switch(ctx.host.as_ref(), on).await;
        report(ctx, inv, on, reply).await;
        return Ok(());
    }
    match ctx.capabilities.smart_plug {
        Some(plugin) if !inv.param.is_empty() => switch_plug(ctx, inv, plugin, &inv.param, on).await,
        _ => {
            warn!("{} without a plug or power plugin", switch_token(on));
            let edit = marker(ctx, inv).await;
            let text = format!("{} Something wrong, shutdown failed.", ctx.emo("warning"));
            ctx.sink.send(inv.reply(text).with_edit(edit).inline(false)).await;
            Ok(())
        }
    }
}
