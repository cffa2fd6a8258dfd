//! Chat command table, parsing and dispatch.
//!
//! Every command is a [`CommandKind`] with a static [`CommandSpec`]; the
//! registry maps the lowercase token to its spec once at startup and
//! [`CommandRegistry::execute`] routes an [`Invocation`] to the handler.
//! Handlers never fail towards the chat: errors are logged and answered with
//! a short notice.

mod basic;
mod connection;
mod files;
mod filament;
mod power;
mod settings;
mod system;
mod tune;

pub use files::FileOpError;

use crate::context::BridgeContext;
use anyhow::Result;
use octogram_ipc::OutboundMessage;
use octogram_octoprint::Capabilities;
use octogram_telegram::BotCommand;
use std::collections::HashMap;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Yes,
    No,
    SwitchOn,
    SwitchOff,
    Status,
    Gif,
    SuperGif,
    Photo,
    Settings,
    Abort,
    TogglePause,
    Home,
    ShutUp,
    DontShutUp,
    Print,
    Files,
    Upload,
    Filament,
    Sys,
    Ctrl,
    Off,
    On,
    Con,
    User,
    Tune,
    Help,
    Gcode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    pub kind: CommandKind,
    pub token: &'static str,
    /// The text after the first `_` is passed to the handler.
    pub has_param: bool,
    /// Runs without any permission check.
    pub bind_none: bool,
    /// Permission key checked in the chat record.
    pub auth_key: &'static str,
    pub description: &'static str,
}

const fn command(kind: CommandKind, token: &'static str, has_param: bool, description: &'static str) -> CommandSpec {
    CommandSpec {
        kind,
        token,
        has_param,
        bind_none: false,
        auth_key: token,
        description,
    }
}

pub const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        kind: CommandKind::Yes,
        token: "Yes",
        has_param: false,
        bind_none: true,
        auth_key: "Yes",
        description: "",
    },
    CommandSpec {
        kind: CommandKind::No,
        token: "No",
        has_param: false,
        bind_none: true,
        auth_key: "No",
        description: "",
    },
    CommandSpec {
        kind: CommandKind::SwitchOn,
        token: "SwitchOn",
        has_param: true,
        bind_none: false,
        auth_key: "/on",
        description: "",
    },
    CommandSpec {
        kind: CommandKind::SwitchOff,
        token: "SwitchOff",
        has_param: true,
        bind_none: false,
        auth_key: "/off",
        description: "",
    },
    command(
        CommandKind::Abort,
        "/abort",
        true,
        "Aborts the currently running print. A confirmation is required.",
    ),
    command(
        CommandKind::ShutUp,
        "/shutup",
        false,
        "Disables automatic notifications till the next print ends.",
    ),
    command(
        CommandKind::DontShutUp,
        "/dontshutup",
        false,
        "The opposite of /shutup - Makes the bot talk again.",
    ),
    command(
        CommandKind::Status,
        "/status",
        false,
        "Sends the current status including a current photo.",
    ),
    command(CommandKind::Gif, "/gif", false, "Sends a gif from the current video."),
    command(CommandKind::SuperGif, "/supergif", false, "Sends a bigger gif from the current video."),
    command(CommandKind::Photo, "/photo", false, "Sends a photo from webcams."),
    command(
        CommandKind::Settings,
        "/settings",
        true,
        "Displays the current notification settings and allows you to change them.",
    ),
    command(CommandKind::Files, "/files", true, "Lists all the files available for printing."),
    command(
        CommandKind::Filament,
        "/filament",
        true,
        "Shows you your filament spools or lets you change it. Requires the Filament Manager Plugin.",
    ),
    command(CommandKind::Print, "/print", true, "Lets you start a print. A confirmation is required."),
    command(CommandKind::TogglePause, "/togglepause", false, "Pause/Resume current Print."),
    command(CommandKind::Home, "/home", false, "Home the printer print head."),
    command(CommandKind::Con, "/con", true, "Connect/disconnect printer."),
    command(
        CommandKind::Upload,
        "/upload",
        false,
        "You can just send me a gcode file or a zip file to save it to my library.",
    ),
    command(CommandKind::Sys, "/sys", true, "Execute Octoprint System Commands."),
    command(CommandKind::Ctrl, "/ctrl", true, "Use self defined controls from Octoprint."),
    command(CommandKind::Tune, "/tune", true, "Set feed- and flowrate. Control temperatures."),
    command(CommandKind::User, "/user", false, "Get user info."),
    command(CommandKind::Off, "/off", true, "Switch off the Printer."),
    command(CommandKind::On, "/on", true, "Switch on the Printer."),
    command(CommandKind::Gcode, "/gcode", true, "Send a G-code line, e.g. /gcode_M117 Hello."),
    CommandSpec {
        kind: CommandKind::Help,
        token: "/help",
        has_param: false,
        bind_none: true,
        auth_key: "/help",
        description: "Show this help message.",
    },
];

/// Permission keys stored per chat: every `/` command that needs authorization.
pub fn permission_keys() -> Vec<&'static str> {
    COMMANDS
        .iter()
        .filter(|spec| !spec.bind_none && spec.token.starts_with('/'))
        .map(|spec| spec.token)
        .collect()
}

/// One parsed command ready to run.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub chat_id: String,
    pub from_id: String,
    pub param: String,
    /// `Telegram - @name - Full Name`, recorded as the job owner.
    pub user: String,
}

impl Invocation {
    pub fn new(chat_id: impl Into<String>, from_id: impl Into<String>, param: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            from_id: from_id.into(),
            param: param.into(),
            user: "Telegram - UNKNOWN".to_string(),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Reply addressed to the invoking chat.
    pub fn reply(&self, text: impl Into<String>) -> OutboundMessage {
        OutboundMessage::to_chat(text, &self.chat_id)
    }

    /// Same invocation with another parameter, for re-rendering a menu.
    pub fn with_param(&self, param: impl Into<String>) -> Self {
        Self {
            param: param.into(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    Known { spec: &'static CommandSpec, param: String },
    Unknown(String),
}

pub struct CommandRegistry {
    by_token: HashMap<String, &'static CommandSpec>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        let by_token = COMMANDS
            .iter()
            .map(|spec| (spec.token.to_lowercase(), spec))
            .collect();
        Self { by_token }
    }

    pub fn spec(&self, kind: CommandKind) -> Option<&'static CommandSpec> {
        COMMANDS.iter().find(|spec| spec.kind == kind)
    }

    /// Splits `/token_param@BotName` into the command and its parameter.
    pub fn parse(&self, text: &str) -> Parsed {
        let text = text.split('@').next().unwrap_or_default().trim();
        let mut parts = text.split('_');
        let token = parts.next().unwrap_or_default().to_lowercase();
        match self.by_token.get(&token) {
            Some(spec) => {
                let param = if spec.has_param {
                    parts.collect::<Vec<_>>().join("_")
                } else {
                    String::new()
                };
                Parsed::Known { spec, param }
            }
            None => Parsed::Unknown(token),
        }
    }

    /// Command list for the Telegram client menu.
    pub fn bot_commands(&self, capabilities: &Capabilities) -> Vec<BotCommand> {
        visible(capabilities)
            .map(|spec| BotCommand {
                command: spec.token.trim_start_matches('/').to_string(),
                description: spec.description.to_string(),
            })
            .collect()
    }

    /// Runs the handler; failures become a notice in the chat.
    pub async fn execute(&self, ctx: &BridgeContext, spec: &CommandSpec, inv: &Invocation) {
        info!(
            "Running command '{}' with parameter '{}' in chat {} for {}",
            spec.token, inv.param, inv.chat_id, inv.from_id
        );
        if let Err(e) = run(ctx, spec.kind, inv).await {
            error!("Command {} failed in chat {}: {:#}", spec.token, inv.chat_id, e);
            let text = format!("{} Command failed, please check logs", ctx.emo("warning"));
            ctx.sink.send(inv.reply(text).inline(false)).await;
        }
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// `/` commands worth listing; power commands only when a power plugin exists.
fn visible(capabilities: &Capabilities) -> impl Iterator<Item = &'static CommandSpec> + '_ {
    COMMANDS.iter().filter(move |spec| {
        spec.token.starts_with('/')
            && (capabilities.power_control() || !matches!(spec.kind, CommandKind::On | CommandKind::Off))
    })
}

async fn run(ctx: &BridgeContext, kind: CommandKind, inv: &Invocation) -> Result<()> {
    match kind {
        CommandKind::Yes => basic::yes(ctx, inv).await,
        CommandKind::No => basic::no(ctx, inv).await,
        CommandKind::SwitchOn => power::switch(ctx, inv, true).await,
        CommandKind::SwitchOff => power::switch(ctx, inv, false).await,
        CommandKind::Status => basic::status(ctx, inv).await,
        CommandKind::Gif => basic::gif(ctx, inv, 5).await,
        CommandKind::SuperGif => basic::gif(ctx, inv, 10).await,
        CommandKind::Photo => basic::photo(ctx, inv).await,
        CommandKind::Settings => settings::handle(ctx, inv).await,
        CommandKind::Abort => basic::abort(ctx, inv).await,
        CommandKind::TogglePause => basic::toggle_pause(ctx, inv).await,
        CommandKind::Home => basic::home(ctx, inv).await,
        CommandKind::ShutUp => basic::shut_up(ctx, inv).await,
        CommandKind::DontShutUp => basic::dont_shut_up(ctx, inv).await,
        CommandKind::Print => files::print(ctx, inv).await,
        CommandKind::Files => files::handle(ctx, inv).await,
        CommandKind::Upload => basic::upload(ctx, inv).await,
        CommandKind::Filament => filament::handle(ctx, inv).await,
        CommandKind::Sys => system::sys(ctx, inv).await,
        CommandKind::Ctrl => system::ctrl(ctx, inv).await,
        CommandKind::Off => power::handle(ctx, inv, false).await,
        CommandKind::On => power::handle(ctx, inv, true).await,
        CommandKind::Con => connection::handle(ctx, inv).await,
        CommandKind::User => basic::user(ctx, inv).await,
        CommandKind::Tune => tune::handle(ctx, inv).await,
        CommandKind::Help => basic::help(ctx, inv).await,
        CommandKind::Gcode => basic::gcode(ctx, inv).await,
    }
}

/// Takes the chat's edit marker when `edit` holds.
async fn marker_if(ctx: &BridgeContext, inv: &Invocation, edit: bool) -> Option<i64> {
    if edit {
        ctx.sink.take_marker(&inv.chat_id).await
    } else {
        None
    }
}

async fn marker(ctx: &BridgeContext, inv: &Invocation) -> Option<i64> {
    ctx.sink.take_marker(&inv.chat_id).await
}

/// Signed step of a wizard token such as `++` or `+*`: `base / 10^len`, the
/// trailing `*` included in the length. `None` when the token is not a step.
pub fn step_delta(token: &str, base: f64) -> Option<f64> {
    let signs = token.strip_suffix('*').unwrap_or(token);
    let negative = signs.starts_with('-');
    let uniform = signs.chars().all(|c| c == if negative { '-' } else { '+' });
    if signs.is_empty() || !uniform {
        return None;
    }
    let delta = base / 10f64.powi(token.chars().count() as i32);
    Some(if negative { -delta } else { delta })
}

/// Coarse tokens end with `*` and use the larger base.
pub fn wizard_base(token: &str, fine: f64, coarse: f64) -> f64 {
    if token.ends_with('*') {
        coarse
    } else {
        fine
    }
}
