//! `/settings`: notification height, interval and gif toggle.

use super::{marker, marker_if, step_delta, Invocation};
use crate::context::BridgeContext;
use crate::session::SettingsDraft;
use anyhow::Result;
use octogram_ipc::{InlineButton, Keyboard, Markup};
use tracing::info;

const HEIGHT_BASE: f64 = 100.0;
const TIME_BASE: f64 = 100.0;

pub async fn handle(ctx: &BridgeContext, inv: &Invocation) -> Result<()> {
    if inv.param.is_empty() || inv.param == "back" {
        return menu(ctx, inv).await;
    }
    let (field, token) = match inv.param.split_once('_') {
        Some((field, token)) => (field, Some(token)),
        None => (inv.param.as_str(), None),
    };
    match field {
        "h" => height(ctx, inv, token).await,
        "t" => time(ctx, inv, token).await,
        "g" => {
            let enabled = ctx
                .store
                .update(|state| {
                    state.send_gif = !state.send_gif;
                    state.send_gif
                })
                .await?;
            info!("Gif notifications switched {}", if enabled { "on" } else { "off" });
            menu(ctx, &inv.with_param("back")).await
        }
        _ => menu(ctx, &inv.with_param("back")).await,
    }
}

async fn draft(ctx: &BridgeContext, chat_id: &str) -> SettingsDraft {
    let stored = SettingsDraft {
        height: ctx.store.notification_height().await,
        time: ctx.store.notification_time().await,
    };
    ctx.sessions
        .with(chat_id, |s| s.settings.get_or_insert(stored).clone())
        .await
}

async fn menu(ctx: &BridgeContext, inv: &Invocation) -> Result<()> {
    let state = ctx.store.snapshot().await;
    let draft = SettingsDraft {
        height: state.notification_height,
        time: state.notification_time,
    };
    ctx.sessions
        .with(&inv.chat_id, |s| s.settings = Some(draft))
        .await;

    let (gif_emo, gif_label) = if state.send_gif {
        (ctx.emo("check"), "Deactivate gif")
    } else {
        (ctx.emo("cancel"), "Activate gif")
    };
    let text = format!(
        "{} *Current notification settings are:*\n\n{} Height: {:.2}mm\n\n{} Time: {}min\n\n{} Gif is activate: {}",
        ctx.emo("settings"),
        ctx.emo("height"),
        state.notification_height,
        ctx.emo("alarmclock"),
        state.notification_time,
        ctx.emo("video"),
        gif_emo
    );
    let keyboard = vec![
        vec![
            InlineButton::new(format!("{} Set height", ctx.emo("height")), "/settings_h"),
            InlineButton::new(format!("{} Set time", ctx.emo("alarmclock")), "/settings_t"),
            InlineButton::new(format!("{} {}", ctx.emo("video"), gif_label), "/settings_g"),
        ],
        vec![InlineButton::new(format!("{} Close", ctx.emo("cancel")), "No")],
    ];
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

fn step_row(prefix: &str, labels: &[(&str, &str)]) -> Vec<InlineButton> {
    labels
        .iter()
        .map(|(label, token)| InlineButton::new(*label, format!("{}_{}", prefix, token)))
        .collect()
}

fn wizard_keyboard(ctx: &BridgeContext, prefix: &str, plus: &[(&str, &str)], minus: &[(&str, &str)]) -> Keyboard {
    vec![
        step_row(prefix, plus),
        step_row(prefix, minus),
        vec![
            InlineButton::new(format!("{} Save", ctx.emo("save")), format!("{}_s", prefix)),
            InlineButton::new(format!("{} Back", ctx.emo("back")), "/settings_back"),
        ],
    ]
}

async fn height(ctx: &BridgeContext, inv: &Invocation, token: Option<&str>) -> Result<()> {
    let mut current = draft(ctx, &inv.chat_id).await.height;
    if let Some(token) = token {
        match step_delta(token, HEIGHT_BASE) {
            Some(delta) => current = (current + delta).max(0.0),
            None => {
                ctx.store.update(|state| state.notification_height = current).await?;
                info!("Notification height set to {:.2}mm", current);
                return menu(ctx, &inv.with_param("back")).await;
            }
        }
        ctx.sessions
            .with(&inv.chat_id, |s| {
                if let Some(settings) = s.settings.as_mut() {
                    settings.height = current;
                }
            })
            .await;
    }

    let text = format!("{} Set new height.\nCurrent:  *{:.2}mm*", ctx.emo("height"), current);
    let keyboard = wizard_keyboard(
        ctx,
        "/settings_h",
        &[("+10", "+"), ("+1", "++"), ("+.1", "+++"), ("+.01", "++++")],
        &[("-10", "-"), ("-1", "--"), ("-.1", "---"), ("-.01", "----")],
    );
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

async fn time(ctx: &BridgeContext, inv: &Invocation, token: Option<&str>) -> Result<()> {
    let mut current = draft(ctx, &inv.chat_id).await.time;
    if let Some(token) = token {
        match step_delta(token, TIME_BASE) {
            Some(delta) => current = (current + delta as i64).max(0),
            None => {
                ctx.store.update(|state| state.notification_time = current).await?;
                info!("Notification interval set to {}min", current);
                return menu(ctx, &inv.with_param("back")).await;
            }
        }
        ctx.sessions
            .with(&inv.chat_id, |s| {
                if let Some(settings) = s.settings.as_mut() {
                    settings.time = current;
                }
            })
            .await;
    }

    let text = format!("{} Set new time.\nCurrent: *{}min*", ctx.emo("alarmclock"), current);
    let keyboard = wizard_keyboard(
        ctx,
        "/settings_t",
        &[("+10", "+"), ("+1", "++")],
        &[("-10", "-"), ("-1", "--")],
    );
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{CommandKind, CommandRegistry};
    use crate::testkit::Harness;

    async fn press(h: &Harness, param: &str) {
        let registry = CommandRegistry::new();
        let spec = registry.spec(CommandKind::Settings).expect("spec");
        registry
            .execute(&h.ctx, spec, &Invocation::new("42", "42", param))
            .await;
    }

    #[tokio::test]
    async fn height_wizard_commits_three_coarse_steps() {
        let h = Harness::new().await;
        h.ctx
            .store
            .update(|state| state.notification_height = 5.0)
            .await
            .expect("update");

        press(&h, "h").await;
        for _ in 0..3 {
            press(&h, "h_+").await;
        }
        assert_eq!(h.ctx.store.notification_height().await, 5.0);
        assert!(h.bot.last_text().unwrap_or_default().contains("*35.00mm*"));

        press(&h, "h_s").await;
        assert_eq!(h.ctx.store.notification_height().await, 35.0);
        assert!(h.bot.last_text().unwrap_or_default().contains("Height: 35.00mm"));
    }

    #[tokio::test]
    async fn wizard_never_goes_below_zero() {
        let h = Harness::new().await;
        press(&h, "t").await;
        press(&h, "t_-").await;
        press(&h, "t_-").await;
        press(&h, "t_s").await;
        assert_eq!(h.ctx.store.notification_time().await, 0);
    }

    #[tokio::test]
    async fn gif_toggle_flips_the_stored_flag() {
        let h = Harness::new().await;
        let before = h.ctx.store.send_gif().await;
        press(&h, "g").await;
        assert_eq!(h.ctx.store.send_gif().await, !before);
        assert!(h.bot.last_keyboard_data().contains(&"/settings_g".to_string()));
    }

    #[tokio::test]
    async fn menu_buttons_fit_telegram_limits() {
        let h = Harness::new().await;
        press(&h, "h").await;
        assert!(h
            .bot
            .last_keyboard_data()
            .iter()
            .all(|data| data.len() <= octogram_telegram::keyboard::MAX_CALLBACK_DATA));
    }
}
