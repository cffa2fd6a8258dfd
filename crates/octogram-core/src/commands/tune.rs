//! `/tune`: feed rate, flow rate and heater targets.

use super::{marker, marker_if, step_delta, wizard_base, Invocation};
use crate::context::BridgeContext;
use anyhow::{bail, Result};
use octogram_ipc::{InlineButton, Keyboard, Markup};
use octogram_octoprint::PrinterProfile;
use tracing::{debug, info};

const RATE_MIN: f64 = 50.0;
const RATE_MAX: f64 = 200.0;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Rate {
    Feed,
    Flow,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Heater {
    Tool(usize),
    Bed,
}

impl Heater {
    fn name(self) -> String {
        match self {
            Heater::Tool(index) => format!("tool{}", index),
            Heater::Bed => "bed".to_string(),
        }
    }

    fn prefix(self) -> String {
        match self {
            Heater::Tool(index) => format!("/tune_e_{}", index),
            Heater::Bed => "/tune_b".to_string(),
        }
    }
}

pub async fn handle(ctx: &BridgeContext, inv: &Invocation) -> Result<()> {
    if inv.param.is_empty() || inv.param == "back" {
        return menu(ctx, inv).await;
    }
    let parts: Vec<&str> = inv.param.split('_').collect();
    match parts.as_slice() {
        ["feed", rest @ ..] => rate(ctx, inv, Rate::Feed, rest.first().copied()).await,
        ["flow", rest @ ..] => rate(ctx, inv, Rate::Flow, rest.first().copied()).await,
        ["e", index, rest @ ..] => {
            let index: usize = index.parse()?;
            heater(ctx, inv, Heater::Tool(index), rest.first().copied()).await
        }
        ["b", rest @ ..] => heater(ctx, inv, Heater::Bed, rest.first().copied()).await,
        _ => bail!("unknown tune parameter {}", inv.param),
    }
}

/// The active printer profile: the current one, else the default, else the first.
async fn active_profile(ctx: &BridgeContext) -> Result<Option<PrinterProfile>> {
    let profiles = ctx.printer.profiles().await?;
    let chosen = profiles
        .iter()
        .find(|p| p.current)
        .or_else(|| profiles.iter().find(|p| p.default))
        .or_else(|| profiles.first())
        .cloned();
    Ok(chosen)
}

async fn menu(ctx: &BridgeContext, inv: &Invocation) -> Result<()> {
    let text = format!("{} *Tune print settings*", ctx.emo("settings"));
    let mut keyboard: Keyboard = vec![vec![
        InlineButton::new(format!("{} Feedrate", ctx.emo("feedrate")), "/tune_feed"),
        InlineButton::new(format!("{} Flowrate", ctx.emo("flowrate")), "/tune_flow"),
    ]];

    let snapshot = ctx.printer.printer().await?;
    let mut tools = Vec::new();
    let mut bed = None;
    if snapshot.is_operational() {
        let profile = active_profile(ctx).await?.unwrap_or_default();
        let mut row = Vec::new();
        for index in 0..profile.extruder.count.max(1) as usize {
            row.push(InlineButton::new(
                format!("{} Tool {}", ctx.emo("tool"), index),
                format!("/tune_e_{}", index),
            ));
            tools.push(snapshot.heater(&format!("tool{}", index)).target_or_zero().trunc());
        }
        if profile.heated_bed {
            row.push(InlineButton::new(format!("{} Bed", ctx.emo("hotbed")), "/tune_b"));
            bed = Some(snapshot.heater("bed").target_or_zero().trunc());
        }
        keyboard.push(row);
    }
    keyboard.push(vec![InlineButton::new(format!("{} Close", ctx.emo("cancel")), "No")]);

    ctx.sessions
        .with(&inv.chat_id, |s| {
            s.tune.tools = tools;
            s.tune.bed = bed;
        })
        .await;

    let edit = marker_if(ctx, inv, inv.param == "back").await;
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

async fn rate(ctx: &BridgeContext, inv: &Invocation, which: Rate, token: Option<&str>) -> Result<()> {
    let mut current = ctx
        .sessions
        .with(&inv.chat_id, |s| match which {
            Rate::Feed => s.tune.feed,
            Rate::Flow => s.tune.flow,
        })
        .await;

    if let Some(token) = token {
        match step_delta(token, wizard_base(token, 1000.0, 2500.0)) {
            Some(delta) => current = (current + delta).clamp(RATE_MIN, RATE_MAX),
            None => {
                let percent = current as u32;
                match which {
                    Rate::Feed => ctx.printer.feed_rate(percent).await?,
                    Rate::Flow => ctx.printer.flow_rate(percent).await?,
                }
                info!("{:?} rate set to {}% by {}", which, percent, inv.user);
                return menu(ctx, &inv.with_param("back")).await;
            }
        }
        ctx.sessions
            .with(&inv.chat_id, |s| match which {
                Rate::Feed => s.tune.feed = current,
                Rate::Flow => s.tune.flow = current,
            })
            .await;
    }

    let (text, prefix) = match which {
        Rate::Feed => (
            format!("{} Set feedrate.\nCurrent:  *{:.0}%*", ctx.emo("feedrate"), current),
            "/tune_feed",
        ),
        Rate::Flow => (
            format!("{} Set flowrate.\nCurrent: *{:.0}%*", ctx.emo("flowrate"), current),
            "/tune_flow",
        ),
    };
    let steps = [
        ("+25", "+*"),
        ("+10", "++"),
        ("+1", "+++"),
        ("-1", "---"),
        ("-10", "--"),
        ("-25", "-*"),
    ];
    let keyboard = vec![
        steps
            .iter()
            .map(|(label, token)| InlineButton::new(*label, format!("{}_{}", prefix, token)))
            .collect(),
        vec![
            InlineButton::new(format!("{} Set", ctx.emo("check")), format!("{}_s", prefix)),
            InlineButton::new(format!("{} Back", ctx.emo("back")), "/tune_back"),
        ],
    ];
    let edit = marker(ctx, inv).await;
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

async fn heater(ctx: &BridgeContext, inv: &Invocation, heater: Heater, token: Option<&str>) -> Result<()> {
    let snapshot = ctx.printer.printer().await?;
    let reading = snapshot.heater(&heater.name());
    let stored = ctx
        .sessions
        .with(&inv.chat_id, |s| match heater {
            Heater::Tool(index) => s.tune.tools.get(index).copied(),
            Heater::Bed => s.tune.bed,
        })
        .await;
    let mut target = stored.unwrap_or_else(|| reading.target_or_zero().trunc());

    if let Some(token) = token {
        match step_delta(token, wizard_base(token, 1000.0, 5000.0)) {
            Some(delta) => target = (target + delta).max(0.0),
            None => {
                let value = if token.starts_with('s') { target } else { 0.0 };
                ctx.printer.set_temperature(&heater.name(), value).await?;
                info!("{} target set to {} by {}", heater.name(), value, inv.user);
                remember_target(ctx, inv, heater, value).await;
                return menu(ctx, &inv.with_param("back")).await;
            }
        }
        remember_target(ctx, inv, heater, target).await;
    }
    debug!("Tune draft for {}: {}", heater.name(), target);

    let text = match heater {
        Heater::Tool(index) => format!(
            "{} Set temperature for tool {}.\nCurrent: {:.2}/*{}°C*",
            ctx.emo("tool"),
            index,
            reading.actual_or_zero(),
            target
        ),
        Heater::Bed => format!(
            "{} Set temperature for bed.\nCurrent: {:.2}/*{}°C*",
            ctx.emo("hotbed"),
            reading.actual_or_zero(),
            target
        ),
    };
    let prefix = heater.prefix();
    let row = |labels: &[(&str, &str)]| -> Vec<InlineButton> {
        labels
            .iter()
            .map(|(label, token)| InlineButton::new(*label, format!("{}_{}", prefix, token)))
            .collect()
    };
    let keyboard = vec![
        row(&[("+100", "+"), ("+50", "+*"), ("+10", "++"), ("+5", "++*"), ("+1", "+++")]),
        row(&[("-100", "-"), ("-50", "-*"), ("-10", "--"), ("-5", "--*"), ("-1", "---")]),
        vec![
            InlineButton::new(format!("{} Set", ctx.emo("check")), format!("{}_s", prefix)),
            InlineButton::new(format!("{} Off", ctx.emo("cooldown")), format!("{}_off", prefix)),
            InlineButton::new(format!("{} Back", ctx.emo("back")), "/tune_back"),
        ],
    ];
    let edit = marker(ctx, inv).await;
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

async fn remember_target(ctx: &BridgeContext, inv: &Invocation, heater: Heater, value: f64) {
    ctx.sessions
        .with(&inv.chat_id, |s| match heater {
            Heater::Tool(index) => {
                if s.tune.tools.len() <= index {
                    s.tune.tools.resize(index + 1, 0.0);
                }
                s.tune.tools[index] = value;
            }
            Heater::Bed => s.tune.bed = Some(value),
        })
        .await;
}
