//! Chat registry administration: what the host plugin's settings page used to do.

use anyhow::{bail, Result};
use clap::Args;
use octogram_config::ChatRecord;

/// Which rights a `grant` or `revoke` touches.
#[derive(Args, Debug, Clone, Default)]
pub struct Rights {
    /// Command to change, e.g. `/print` or `print` (repeatable)
    #[arg(long = "command")]
    pub commands: Vec<String>,

    /// Notification event to change, e.g. `PrintDone` (repeatable)
    #[arg(long = "notification")]
    pub notifications: Vec<String>,

    /// Every command and every notification
    #[arg(long)]
    pub all: bool,

    /// Let members of a group use their own chat rights
    #[arg(long)]
    pub allow_users: bool,
}

impl Rights {
    fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.notifications.is_empty() && !self.all && !self.allow_users
    }
}

fn command_key(name: &str) -> String {
    let name = name.trim().to_lowercase();
    if name.starts_with('/') {
        name
    } else {
        format!("/{}", name)
    }
}

/// Switches the selected rights on or off. Unknown names are rejected before
/// anything changes.
pub fn apply(record: &mut ChatRecord, rights: &Rights, enabled: bool) -> Result<()> {
    if rights.is_empty() {
        bail!("nothing to change: pass --command, --notification, --all or --allow-users");
    }
    let commands: Vec<String> = rights.commands.iter().map(|c| command_key(c)).collect();
    if let Some(unknown) = commands.iter().find(|c| !record.commands.contains_key(*c)) {
        bail!("unknown command {}", unknown);
    }
    if let Some(unknown) = rights
        .notifications
        .iter()
        .find(|n| !record.notifications.contains_key(*n))
    {
        bail!("unknown notification {}", unknown);
    }

    if rights.all {
        record.commands.values_mut().for_each(|v| *v = enabled);
        record.notifications.values_mut().for_each(|v| *v = enabled);
    }
    for command in &commands {
        record.commands.insert(command.clone(), enabled);
    }
    for event in &rights.notifications {
        record.notifications.insert(event.clone(), enabled);
    }
    if rights.allow_users {
        record.allow_users = enabled;
    }

    record.accept_commands = record.commands.values().any(|v| *v);
    record.send_notifications = record.notifications.values().any(|v| *v);
    record.new = false;
    Ok(())
}

/// One line per chat for `chats list`.
pub fn summary(chat_id: &str, record: &ChatRecord) -> String {
    let granted = record.commands.values().filter(|v| **v).count();
    let subscribed = record.notifications.values().filter(|v| **v).count();
    format!(
        "{:>15}  {:<8} {:<30} commands {}/{}  notifications {}/{}{}{}",
        chat_id,
        record.chat_type,
        record.title,
        granted,
        record.commands.len(),
        subscribed,
        record.notifications.len(),
        if record.allow_users { "  allow-users" } else { "" },
        if record.new { "  new" } else { "" },
    )
}
