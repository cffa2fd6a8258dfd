//! Built-in notification descriptors and their configured overrides.

use octogram_config::MessageConfig;
use octogram_ipc::Markup;
use std::collections::BTreeMap;

struct Builtin {
    event: &'static str,
    text: &'static str,
    image: bool,
    bind_msg: Option<&'static str>,
    no_setting: bool,
    description: &'static str,
}

const fn event(event: &'static str, text: &'static str, image: bool, description: &'static str) -> Builtin {
    Builtin {
        event,
        text,
        image,
        bind_msg: None,
        no_setting: false,
        description,
    }
}

const fn alias(event: &'static str, target: &'static str, description: &'static str) -> Builtin {
    Builtin {
        event,
        text: "",
        image: false,
        bind_msg: Some(target),
        no_setting: true,
        description,
    }
}

const BUILTINS: &[Builtin] = &[
    event(
        "PrinterStart",
        "{emo:rocket} Hello. I'm online and ready to receive your commands.",
        false,
        "The bridge started",
    ),
    event(
        "PrinterShutdown",
        "{emo:shutdown} Shutting down. Goodbye.",
        false,
        "The bridge is shutting down",
    ),
    event("PrintStarted", "{emo:play} Started printing {file}.", true, "A print started"),
    event(
        "PrintPaused",
        "{emo:pause} Paused printing {file} at {percent}%. {time_left} remaining.",
        true,
        "A print was paused",
    ),
    event(
        "PrintResumed",
        "{emo:resume} Resumed printing {file} at {percent}%. {time_left} remaining.",
        true,
        "A paused print was resumed",
    ),
    event("PrintFailed", "{emo:attention} Printing {file} failed.", true, "A print failed"),
    event(
        "ZChange",
        "Printing at Z={z}.\nBed {bed_temp}/{bed_target}, Extruder {e1_temp}/{e1_target}.\n{time_done}, {percent}% done, {time_left} remaining.\nCompleted time {time_finish}.",
        true,
        "The print head reached a new height",
    ),
    event("PrintDone", "{emo:finish} Finished printing {file}.", true, "A print completed"),
    Builtin {
        event: "StatusNotPrinting",
        text: "Not printing.\nBed {bed_temp}/{bed_target}, Extruder {e1_temp}/{e1_target}.",
        image: true,
        bind_msg: None,
        no_setting: true,
        description: "Status requested while idle",
    },
    alias("StatusPrinting", "ZChange", "Status requested while printing"),
    event(
        "plugin_pause_for_user_event_notify",
        "{emo:warning} User interaction required.\nBed {bed_temp}/{bed_target}, Extruder {e1_temp}/{e1_target}.",
        true,
        "The printer waits for the user",
    ),
    event(
        "gCode_M600",
        "{emo:warning} Color change requested.\nBed {bed_temp}/{bed_target}, Extruder {e1_temp}/{e1_target}.",
        true,
        "An M600 filament change was sent",
    ),
    event("Error", "{emo:attention} Printer Error {error_msg}.", true, "Unrecoverable printer error"),
    alias("plugin_octolapse_movie_done", "MovieDone", "Octolapse finished rendering"),
    event("MovieDone", "{emo:movie} Movie done.", false, "A timelapse was rendered"),
    event("Connected", "{emo:online} Printer Connected.", false, "The printer connected"),
    event("Disconnected", "{emo:offline} Printer Disconnected.", false, "The printer disconnected"),
    event(
        "Home",
        "{emo:home} Printer received home command\nBed {bed_temp}/{bed_target}, Extruder {e1_temp}/{e1_target}.",
        true,
        "The printer was homed",
    ),
    event(
        "Alert",
        "{emo:notify} Printer received alert command\nBed {bed_temp}/{bed_target}, Extruder {e1_temp}/{e1_target}.",
        true,
        "The printer sounded its buzzer",
    ),
    event(
        "UserNotif",
        "{emo:notify} User Notification: {UserNotif_Text}.",
        true,
        "The printer sent echo:UserNotif",
    ),
];

/// Template and attachments of one event after applying overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    pub text: String,
    pub image: bool,
    pub gif: bool,
    pub silent: bool,
    pub markup: Markup,
    pub bind_msg: Option<&'static str>,
    pub no_setting: bool,
}

pub struct DescriptorTable {
    descriptors: BTreeMap<&'static str, Descriptor>,
}

impl DescriptorTable {
    pub fn new(overrides: &BTreeMap<String, MessageConfig>) -> Self {
        let descriptors = BUILTINS
            .iter()
            .map(|builtin| {
                let mut descriptor = Descriptor {
                    text: builtin.text.to_string(),
                    image: builtin.image,
                    gif: false,
                    silent: false,
                    markup: Markup::Off,
                    bind_msg: builtin.bind_msg,
                    no_setting: builtin.no_setting,
                };
                if let Some(custom) = overrides.get(builtin.event) {
                    apply(&mut descriptor, custom);
                }
                (builtin.event, descriptor)
            })
            .collect();
        Self { descriptors }
    }

    pub fn get(&self, event: &str) -> Option<&Descriptor> {
        self.descriptors.get(event)
    }

    /// Follows `bind_msg` once: the event whose template and chat flag apply.
    pub fn resolve<'a>(&'a self, event: &'a str) -> Option<(&'a str, &'a Descriptor)> {
        let descriptor = self.descriptors.get(event)?;
        match descriptor.bind_msg {
            Some(target) => self.descriptors.get(target).map(|d| (target, d)),
            None => Some((event, descriptor)),
        }
    }

    pub fn is_known(&self, event: &str) -> bool {
        self.descriptors.contains_key(event)
    }
}

fn apply(descriptor: &mut Descriptor, custom: &MessageConfig) {
    if let Some(text) = &custom.text {
        descriptor.text = text.clone();
    }
    if let Some(image) = custom.image {
        descriptor.image = image;
    }
    if let Some(gif) = custom.gif {
        descriptor.gif = gif;
    }
    if let Some(silent) = custom.silent {
        descriptor.silent = silent;
    }
    if let Some(markup) = custom.markup.as_deref().and_then(Markup::from_name) {
        descriptor.markup = markup;
    }
}

/// Events a chat can switch on and off.
pub fn notification_keys() -> Vec<&'static str> {
    BUILTINS
        .iter()
        .filter(|b| !b.no_setting)
        .map(|b| b.event)
        .collect()
}

/// `(event, description)` of every configurable event.
pub fn event_descriptions() -> Vec<(&'static str, &'static str)> {
    BUILTINS
        .iter()
        .filter(|b| !b.no_setting)
        .map(|b| (b.event, b.description))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_resolve_to_their_target() {
        let table = DescriptorTable::new(&BTreeMap::new());
        let (target, descriptor) = table.resolve("StatusPrinting").expect("known");
        assert_eq!(target, "ZChange");
        assert!(descriptor.text.starts_with("Printing at Z="));
        assert_eq!(table.resolve("PrintDone").map(|(e, _)| e), Some("PrintDone"));
        assert!(table.resolve("SomethingElse").is_none());
    }

    #[test]
    fn overrides_replace_only_set_fields() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "PrintDone".to_string(),
            MessageConfig {
                text: Some("<b>{file}</b> done".to_string()),
                markup: Some("HTML".to_string()),
                ..MessageConfig::default()
            },
        );
        let table = DescriptorTable::new(&overrides);
        let done = table.get("PrintDone").expect("descriptor");
        assert_eq!(done.text, "<b>{file}</b> done");
        assert_eq!(done.markup, Markup::Html);
        assert!(done.image);
    }

    #[test]
    fn status_events_are_not_chat_settings() {
        let keys = notification_keys();
        assert!(keys.contains(&"ZChange"));
        assert!(!keys.contains(&"StatusPrinting"));
        assert!(!keys.contains(&"StatusNotPrinting"));
        assert!(!keys.contains(&"plugin_octolapse_movie_done"));
        assert_eq!(keys.len(), event_descriptions().len());
    }
}
