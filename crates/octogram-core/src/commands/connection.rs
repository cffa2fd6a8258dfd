//! `/con`: connection status, connect wizard, disconnect and default
//! connection settings.

use super::{marker, marker_if, Invocation};
use crate::context::BridgeContext;
use anyhow::Result;
use octogram_ipc::{InlineButton, Keyboard, Markup};
use octogram_octoprint::{ConnectRequest, ConnectionInfo};
use octogram_telegram::keyboard::rows_of;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

const STATE_POLL: Duration = Duration::from_millis(500);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection states that mean OctoPrint is still negotiating.
const WAIT_STATES: &[&str] = &[
    "Offline",
    "Detecting baudrate",
    "Connecting",
    "Opening serial port",
    "Detecting serial port",
    "Detecting serial connection",
    "Opening serial connection",
];

fn is_settling(state: &str) -> bool {
    WAIT_STATES.iter().any(|s| state.contains(s))
}

fn baud_text(baudrate: Option<u32>) -> String {
    match baudrate {
        Some(rate) if rate > 0 => rate.to_string(),
        _ => "AUTO".to_string(),
    }
}

fn auto_text(autoconnect: Option<bool>) -> &'static str {
    if autoconnect.unwrap_or(false) {
        "True"
    } else {
        "False"
    }
}

pub async fn handle(ctx: &BridgeContext, inv: &Invocation) -> Result<()> {
    if inv.param.is_empty() || inv.param == "back" {
        return overview(ctx, inv).await;
    }
    let parts: Vec<&str> = inv.param.split('|').collect();
    match parts.as_slice() {
        ["s", rest @ ..] => defaults(ctx, inv, rest).await,
        ["c", rest @ ..] => connect(ctx, inv, rest).await,
        ["d", ..] => disconnect(ctx, inv).await,
        _ => overview(ctx, inv).await,
    }
}

async fn profile_name(ctx: &BridgeContext, id: Option<&str>) -> String {
    let Some(id) = id else {
        return "None".to_string();
    };
    match ctx.printer.profiles().await {
        Ok(profiles) => profiles
            .into_iter()
            .find(|p| p.id == id)
            .map(|p| p.name)
            .unwrap_or_else(|| id.to_string()),
        Err(_) => id.to_string(),
    }
}

async fn default_profile_name(ctx: &BridgeContext, info: &ConnectionInfo) -> String {
    match ctx.printer.profiles().await {
        Ok(profiles) => profiles
            .iter()
            .find(|p| p.default)
            .or_else(|| {
                let preferred = info.options.printer_profile_preference.as_deref()?;
                profiles.iter().find(|p| p.id == preferred)
            })
            .map(|p| p.name.clone())
            .unwrap_or_else(|| "-".to_string()),
        Err(_) => "-".to_string(),
    }
}

async fn overview(ctx: &BridgeContext, inv: &Invocation) -> Result<()> {
    let info = ctx.printer.connection().await?;
    let current = &info.current;
    let mut text = format!(
        "{} Connection information\n\n*Status*: {}\n\n*Port*: {}\n*Baud*: {}\n*Profile*: {}\n*AutoConnect*: {}\n\n",
        ctx.emo("info"),
        current.state,
        current.port.as_deref().unwrap_or("None"),
        baud_text(current.baudrate),
        profile_name(ctx, current.printer_profile.as_deref()).await,
        auto_text(info.options.autoconnect)
    );

    let snapshot = ctx.printer.printer().await?;
    let defaults = InlineButton::new(format!("{} Defaults", ctx.emo("star")), "/con_s");
    let close = InlineButton::new(format!("{} Close", ctx.emo("cancel")), "No");
    let row = if !snapshot.is_operational() {
        vec![InlineButton::new(format!("{} Connect", ctx.emo("online")), "/con_c"), defaults, close]
    } else if snapshot.is_printing() || snapshot.is_paused() {
        text.push_str(&format!("{} You can't disconnect while printing.", ctx.emo("warning")));
        vec![defaults, close]
    } else {
        vec![InlineButton::new(format!("{} Disconnect", ctx.emo("offline")), "/con_d"), defaults, close]
    };

    let edit = marker_if(ctx, inv, inv.param == "back").await;
    ctx.sink
        .send(
            inv.reply(text)
                .with_keyboard(vec![row])
                .with_markup(Markup::Markdown)
                .with_edit(edit),
        )
        .await;
    Ok(())
}

async fn disconnect(ctx: &BridgeContext, inv: &Invocation) -> Result<()> {
    let snapshot = ctx.printer.printer().await?;
    let edit = marker(ctx, inv).await;
    let text = if snapshot.is_printing() || snapshot.is_paused() {
        format!("{} You can't disconnect while printing.", ctx.emo("warning"))
    } else {
        ctx.printer.disconnect().await?;
        info!("Printer disconnected by {}", inv.user);
        format!("{} Printer disconnected.", ctx.emo("info"))
    };
    ctx.sink.send(inv.reply(text).with_edit(edit).inline(false)).await;
    Ok(())
}

/// Picker rows of three plus a back button to `/con_{parent}`.
fn picker(ctx: &BridgeContext, parent: &str, buttons: Vec<InlineButton>) -> Keyboard {
    let mut keyboard = rows_of(buttons, 3);
    keyboard.push(vec![InlineButton::new(
        format!("{} Back", ctx.emo("back")),
        format!("/con_{}", parent),
    )]);
    keyboard
}

async fn send_picker(ctx: &BridgeContext, inv: &Invocation, text: String, keyboard: Keyboard) {
    let edit = marker(ctx, inv).await;
    ctx.sink.send(inv.reply(text).with_keyboard(keyboard).with_edit(edit)).await;
}

async fn pick_port(ctx: &BridgeContext, inv: &Invocation, parent: &str) -> Result<()> {
    let options = ctx.printer.connection().await?.options;
    let mut buttons = vec![InlineButton::new(
        format!("{} AUTO", ctx.emo("lamp")),
        format!("/con_{}|p|AUTO", parent),
    )];
    buttons.extend(options.ports.iter().map(|port| {
        InlineButton::new(format!("{} {}", ctx.emo("port"), port), format!("/con_{}|p|{}", parent, port))
    }));
    let text = format!(
        "{} Select default port.\nCurrent setting: {}",
        ctx.emo("question"),
        options.port_preference.as_deref().unwrap_or("AUTO")
    );
    send_picker(ctx, inv, text, picker(ctx, parent, buttons)).await;
    Ok(())
}

async fn pick_baud(ctx: &BridgeContext, inv: &Invocation, parent: &str) -> Result<()> {
    let options = ctx.printer.connection().await?.options;
    let mut buttons = vec![InlineButton::new(
        format!("{} AUTO", ctx.emo("lamp")),
        format!("/con_{}|b|0", parent),
    )];
    buttons.extend(options.baudrates.iter().map(|rate| {
        InlineButton::new(format!("{} {}", ctx.emo("speed"), rate), format!("/con_{}|b|{}", parent, rate))
    }));
    let text = format!(
        "{} Select default baudrate.\nCurrent setting: {}",
        ctx.emo("question"),
        baud_text(options.baudrate_preference)
    );
    send_picker(ctx, inv, text, picker(ctx, parent, buttons)).await;
    Ok(())
}

async fn pick_profile(ctx: &BridgeContext, inv: &Invocation, parent: &str) -> Result<()> {
    let info = ctx.printer.connection().await?;
    let profiles = ctx.printer.profiles().await?;
    let buttons = profiles
        .iter()
        .map(|p| InlineButton::new(format!("{} {}", ctx.emo("profile"), p.name), format!("/con_{}|pr|{}", parent, p.id)))
        .collect();
    let text = format!(
        "{} Select default profile.\nCurrent setting: {}",
        ctx.emo("question"),
        default_profile_name(ctx, &info).await
    );
    send_picker(ctx, inv, text, picker(ctx, parent, buttons)).await;
    Ok(())
}

async fn defaults(ctx: &BridgeContext, inv: &Invocation, rest: &[&str]) -> Result<()> {
    match rest {
        ["p"] => return pick_port(ctx, inv, "s").await,
        ["b"] => return pick_baud(ctx, inv, "s").await,
        ["pr"] => return pick_profile(ctx, inv, "s").await,
        ["a"] => {
            let options = ctx.printer.connection().await?.options;
            let keyboard = vec![
                vec![
                    InlineButton::new(format!("{} ON", ctx.emo("check")), "/con_s|a|true"),
                    InlineButton::new(format!("{} OFF", ctx.emo("cancel")), "/con_s|a|false"),
                ],
                vec![InlineButton::new(format!("{} Back", ctx.emo("back")), "/con_s")],
            ];
            let text = format!(
                "{} AutoConnect on startup.\nCurrent setting: {}",
                ctx.emo("question"),
                auto_text(options.autoconnect)
            );
            send_picker(ctx, inv, text, keyboard).await;
            return Ok(());
        }
        ["p", port] => {
            let port = if *port == "AUTO" { Value::Null } else { json!(port) };
            ctx.host.update_settings(json!({"serial": {"port": port}})).await?;
        }
        ["b", rate] => {
            let rate: u32 = rate.parse()?;
            let rate = if rate == 0 { Value::Null } else { json!(rate) };
            ctx.host.update_settings(json!({"serial": {"baudrate": rate}})).await?;
        }
        ["pr", profile] => ctx.host.set_default_profile(profile).await?,
        ["a", flag] => {
            let enabled = *flag == "true";
            ctx.host.update_settings(json!({"serial": {"autoconnect": enabled}})).await?;
        }
        _ => {}
    }
    if !rest.is_empty() {
        debug!("Default connection setting {:?} saved", rest);
    }

    let info = ctx.printer.connection().await?;
    let options = &info.options;
    let text = format!(
        "{} Default connection settings \n\n*Port:* {}\n*Baud:* {}\n*Profile:* {}\n*AutoConnect:* {}",
        ctx.emo("settings"),
        options.port_preference.as_deref().unwrap_or("AUTO"),
        baud_text(options.baudrate_preference),
        default_profile_name(ctx, &info).await,
        auto_text(options.autoconnect)
    );
    let keyboard = vec![
        vec![
            InlineButton::new(format!("{} Port", ctx.emo("port")), "/con_s|p"),
            InlineButton::new(format!("{} Baud", ctx.emo("speed")), "/con_s|b"),
            InlineButton::new(format!("{} Profile", ctx.emo("profile")), "/con_s|pr"),
            InlineButton::new(format!("{} Auto", ctx.emo("lamp")), "/con_s|a"),
        ],
        vec![InlineButton::new(format!("{} Back", ctx.emo("back")), "/con_back")],
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

async fn connect(ctx: &BridgeContext, inv: &Invocation, rest: &[&str]) -> Result<()> {
    let snapshot = ctx.printer.printer().await?;
    if snapshot.is_operational() || snapshot.is_printing() || snapshot.is_paused() {
        let edit = marker(ctx, inv).await;
        let text = format!(
            "{} Printer is already connected. Disconnect it first.",
            ctx.emo("warning")
        );
        ctx.sink.send(inv.reply(text).with_edit(edit).inline(false)).await;
        return Ok(());
    }

    let request = match rest {
        [] => {
            let keyboard = vec![
                vec![
                    InlineButton::new(format!("{} AUTO", ctx.emo("lamp")), "/con_c|a"),
                    InlineButton::new(format!("{} Default", ctx.emo("star")), "/con_c|d"),
                ],
                vec![
                    InlineButton::new(format!("{} Manual", ctx.emo("edit")), "/con_c|p"),
                    InlineButton::new(format!("{} Back", ctx.emo("back")), "/con_back"),
                ],
            ];
            let text = format!("{} Select connection option.", ctx.emo("question"));
            send_picker(ctx, inv, text, keyboard).await;
            return Ok(());
        }
        ["a", ..] => ConnectRequest::default(),
        ["d", ..] => {
            let options = ctx.printer.connection().await?.options;
            ConnectRequest {
                port: options.port_preference,
                baudrate: options.baudrate_preference.filter(|rate| *rate > 0),
                printer_profile: options.printer_profile_preference,
            }
        }
        ["p"] => return pick_port(ctx, inv, "c").await,
        ["p", port, ..] => {
            let port = (*port != "AUTO").then(|| port.to_string());
            ctx.sessions.with(&inv.chat_id, |s| s.connect.port = port).await;
            return pick_baud(ctx, inv, "c").await;
        }
        ["b", rate, ..] => {
            let rate = rate.parse::<u32>().ok().filter(|rate| *rate > 0);
            ctx.sessions.with(&inv.chat_id, |s| s.connect.baudrate = rate).await;
            return pick_profile(ctx, inv, "c").await;
        }
        ["pr", profile, ..] => {
            let draft = ctx
                .sessions
                .with(&inv.chat_id, |s| std::mem::take(&mut s.connect))
                .await;
            ConnectRequest {
                port: draft.port,
                baudrate: draft.baudrate,
                printer_profile: Some(profile.to_string()),
            }
        }
        _ => return overview(ctx, inv).await,
    };

    let edit = marker(ctx, inv).await;
    ctx.sink
        .send(inv.reply(format!("{} Connecting...", ctx.emo("info"))).with_edit(edit))
        .await;
    info!("Connecting printer with {:?} for {}", request, inv.user);
    ctx.printer.connect(&request).await?;

    let state = settle(ctx).await?;
    let text = if state == "Operational" {
        format!("{} Connection established.", ctx.emo("check"))
    } else {
        format!("{} Failed to start connection.\n\n{}", ctx.emo("warning"), state)
    };
    let edit = marker(ctx, inv).await;
    ctx.sink.send(inv.reply(text).with_edit(edit).inline(false)).await;
    Ok(())
}

/// Polls the connection until it leaves the negotiating states or the
/// deadline passes; returns the last state seen.
async fn settle(ctx: &BridgeContext) -> Result<String> {
    let deadline = Instant::now() + CONNECT_TIMEOUT;
    loop {
        let state = ctx.printer.connection().await?.current.state;
        if !is_settling(&state) || Instant::now() >= deadline {
            debug!("Connection settled in state {}", state);
            return Ok(state);
        }
        sleep(STATE_POLL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{CommandKind, CommandRegistry};
    use crate::testkit::Harness;
    use octogram_octoprint::{ConnectionOptions, PrinterProfile};

    async fn press(h: &Harness, param: &str) {
        let registry = CommandRegistry::new();
        let spec = registry.spec(CommandKind::Con).expect("spec");
        registry
            .execute(&h.ctx, spec, &Invocation::new("42", "42", param))
            .await;
    }

    fn with_options(h: &Harness) {
        let mut info = ConnectionInfo::default();
        info.current.state = "Closed".to_string();
        info.options = ConnectionOptions {
            ports: vec!["/dev/ttyUSB0".to_string()],
            baudrates: vec![115200, 250000],
            ..ConnectionOptions::default()
        };
        h.printer.set_connection(info);
        h.printer.set_profiles(vec![PrinterProfile {
            id: "_default".to_string(),
            name: "Prusa".to_string(),
            default: true,
            ..PrinterProfile::default()
        }]);
    }

    #[tokio::test]
    async fn overview_offers_connect_when_closed() {
        let h = Harness::new().await;
        press(&h, "").await;
        assert_eq!(h.bot.last_keyboard_data(), vec!["/con_c", "/con_s", "No"]);
        assert!(h.bot.last_text().unwrap_or_default().contains("*Status*: Closed"));
    }

    #[tokio::test]
    async fn disconnect_is_blocked_while_printing() {
        let h = Harness::new().await;
        h.printer.set_printing(true);
        press(&h, "").await;
        assert_eq!(h.bot.last_keyboard_data(), vec!["/con_s", "No"]);
        press(&h, "d").await;
        assert!(h.printer.calls().is_empty());
        assert!(h.bot.last_text().unwrap_or_default().contains("can't disconnect while printing"));

        h.printer.set_printing(false);
        press(&h, "d").await;
        assert_eq!(h.printer.calls(), vec!["disconnect"]);
    }

    #[tokio::test]
    async fn connect_is_refused_while_connected() {
        let h = Harness::new().await;
        h.printer.set_printing(true);
        press(&h, "c|a").await;
        assert!(h.printer.calls().is_empty());
        assert!(h.bot.last_text().unwrap_or_default().contains("already connected"));

        h.printer.set_paused();
        press(&h, "c|d").await;
        h.printer.set_operational(true);
        press(&h, "c").await;
        assert!(h.printer.calls().is_empty());
        assert!(h.bot.last_keyboard_data().is_empty());
    }

    #[tokio::test]
    async fn manual_wizard_connects_with_the_picked_values() {
        let h = Harness::new().await;
        with_options(&h);
        press(&h, "c|p").await;
        assert!(h.bot.last_keyboard_data().contains(&"/con_c|p|/dev/ttyUSB0".to_string()));
        press(&h, "c|p|/dev/ttyUSB0").await;
        assert!(h.bot.last_keyboard_data().contains(&"/con_c|b|250000".to_string()));
        press(&h, "c|b|250000").await;
        assert_eq!(h.bot.last_keyboard_data(), vec!["/con_c|pr|_default", "/con_c"]);
        press(&h, "c|pr|_default").await;

        assert_eq!(h.printer.calls(), vec!["connect /dev/ttyUSB0 250000 _default"]);
        assert!(h.bot.last_text().unwrap_or_default().contains("Connection established."));
    }

    #[tokio::test]
    async fn failed_connection_reports_the_state() {
        let h = Harness::new().await;
        h.printer.connect_settles_to("Error: Failed to autodetect serial port");
        press(&h, "c|a").await;
        assert_eq!(h.printer.calls(), vec!["connect AUTO AUTO -"]);
        assert!(h
            .bot
            .last_text()
            .unwrap_or_default()
            .ends_with("Failed to start connection.\n\nError: Failed to autodetect serial port"));
    }

    #[tokio::test]
    async fn defaults_are_written_to_the_host() {
        let h = Harness::new().await;
        with_options(&h);
        press(&h, "s|b|250000").await;
        press(&h, "s|p|AUTO").await;
        press(&h, "s|pr|_default").await;
        assert_eq!(
            h.host.calls(),
            vec![
                r#"settings {"serial":{"baudrate":250000}}"#,
                r#"settings {"serial":{"port":null}}"#,
                "default_profile _default",
            ]
        );
        assert!(h.bot.last_text().unwrap_or_default().contains("*Profile:* Prusa"));
    }

    #[test]
    fn negotiating_states_keep_waiting() {
        assert!(is_settling("Detecting serial port"));
        assert!(is_settling("Opening serial connection"));
        assert!(!is_settling("Operational"));
        assert!(!is_settling("Error: timeout"));
    }
}
