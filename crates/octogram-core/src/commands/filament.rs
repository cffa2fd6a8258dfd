//! `/filament`: spool overview and spool change through the Filament Manager plugin.

use super::{marker, marker_if, Invocation};
use crate::context::BridgeContext;
use anyhow::Result;
use octogram_ipc::InlineButton;
use octogram_octoprint::plugins;
use octogram_telegram::keyboard::rows_of;
use tracing::{info, warn};

pub async fn handle(ctx: &BridgeContext, inv: &Invocation) -> Result<()> {
    if !ctx.capabilities.filament_manager {
        let text = format!("{} No filament manager plugin installed.", ctx.emo("warning"));
        ctx.sink.send(inv.reply(text).inline(false)).await;
        return Ok(());
    }
    if inv.param.is_empty() || inv.param == "back" {
        return menu(ctx, inv).await;
    }
    match inv.param.split_once('_') {
        None if inv.param == "spools" => list(ctx, inv).await,
        None if inv.param == "changeSpool" => pick(ctx, inv).await,
        Some(("changeSpool", spool)) => change(ctx, inv, spool).await,
        _ => menu(ctx, inv).await,
    }
}

async fn menu(ctx: &BridgeContext, inv: &Invocation) -> Result<()> {
    let text = format!("{} The following Filament Manager commands are known.", ctx.emo("info"));
    let keyboard = vec![
        vec![InlineButton::new("Show spools", "/filament_spools")],
        vec![InlineButton::new("Change spool", "/filament_changeSpool")],
        vec![InlineButton::new(format!("{} Close", ctx.emo("cancel")), "No")],
    ];
    let edit = marker_if(ctx, inv, inv.param == "back").await;
    ctx.sink.send(inv.reply(text).with_keyboard(keyboard).with_edit(edit)).await;
    Ok(())
}

async fn failure(ctx: &BridgeContext, inv: &Invocation, what: &str, error: anyhow::Error) {
    warn!("Filament manager call failed: {:#}", error);
    let text = format!("{} {}\nError text: {}", ctx.emo("attention"), what, error);
    let edit = marker(ctx, inv).await;
    ctx.sink.send(inv.reply(text).with_edit(edit).inline(false)).await;
}

async fn list(ctx: &BridgeContext, inv: &Invocation) -> Result<()> {
    let host = ctx.host.as_ref();
    let spools = match plugins::spools(host).await {
        Ok(spools) => spools,
        Err(e) => {
            failure(
                ctx,
                inv,
                "Error getting spools. Are you sure, you have installed the Filament Manager Plugin?",
                e,
            )
            .await;
            return Ok(());
        }
    };
    let mut text = format!("{} Available filament spools are:\n", ctx.emo("info"));
    for spool in &spools {
        text.push_str(&format!("{} [{}%]\n", spool.describe(), spool.percent_left()));
    }
    match plugins::selected_spool(host).await {
        Ok(Some(selected)) => text.push_str(&format!("\n\nCurrently selected: {}", selected.describe())),
        Ok(None) => {}
        Err(e) => warn!("Spool selection unavailable: {:#}", e),
    }
    let edit = marker(ctx, inv).await;
    ctx.sink.send(inv.reply(text).with_edit(edit).inline(false)).await;
    Ok(())
}

async fn pick(ctx: &BridgeContext, inv: &Invocation) -> Result<()> {
    let spools = match plugins::spools(ctx.host.as_ref()).await {
        Ok(spools) => spools,
        Err(e) => {
            failure(ctx, inv, "Error changing spool", e).await;
            return Ok(());
        }
    };
    let buttons = spools
        .iter()
        .map(|spool| InlineButton::new(spool.describe(), format!("/filament_changeSpool_{}", spool.id_text())))
        .collect();
    let mut keyboard = rows_of(buttons, 2);
    keyboard.push(vec![InlineButton::new(format!("{} Close", ctx.emo("cancel")), "No")]);
    let text = format!("{} which filament spool do you want to select?", ctx.emo("question"));
    let edit = marker(ctx, inv).await;
    ctx.sink.send(inv.reply(text).with_keyboard(keyboard).with_edit(edit)).await;
    Ok(())
}

async fn change(ctx: &BridgeContext, inv: &Invocation, spool_id: &str) -> Result<()> {
    info!("Changing spool to {} for {}", spool_id, inv.user);
    match plugins::select_spool(ctx.host.as_ref(), spool_id).await {
        Ok(spool) => {
            let text = format!("{} Selected spool is now: {}", ctx.emo("check"), spool.describe());
            let edit = marker(ctx, inv).await;
            ctx.sink.send(inv.reply(text).with_edit(edit).inline(false)).await;
        }
        Err(e) => failure(ctx, inv, "Error changing spool", e).await,
    }
    Ok(())
}
