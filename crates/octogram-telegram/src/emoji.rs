//! Symbolic emoji names used in replies and notification templates.

const EMOJI: &[(&str, &str)] = &[
    ("octo", "\u{1f419}"),
    ("plugin", "\u{1f9e9}"),
    ("cancel", "\u{274c}"),
    ("check", "\u{2705}"),
    ("info", "\u{2139}\u{fe0f}"),
    ("question", "\u{2753}"),
    ("warning", "\u{26a0}\u{fe0f}"),
    ("attention", "\u{2757}"),
    ("notallowed", "\u{1f6ab}"),
    ("rocket", "\u{1f680}"),
    ("hooray", "\u{1f389}"),
    ("shutdown", "\u{1f4a4}"),
    ("settings", "\u{2699}\u{fe0f}"),
    ("star", "\u{2b50}"),
    ("lamp", "\u{1f4a1}"),
    ("back", "\u{21a9}\u{fe0f}"),
    ("up", "\u{2b06}\u{fe0f}"),
    ("right", "\u{27a1}\u{fe0f}"),
    ("down", "\u{2b07}\u{fe0f}"),
    ("left", "\u{2b05}\u{fe0f}"),
    ("folder", "\u{1f4c2}"),
    ("file", "\u{1f4c4}"),
    ("name", "\u{1f3f7}\u{fe0f}"),
    ("filesize", "\u{2696}\u{fe0f}"),
    ("search", "\u{1f50d}"),
    ("upload", "\u{1f4e4}"),
    ("download", "\u{1f4e5}"),
    ("new", "\u{1f195}"),
    ("edit", "\u{270f}\u{fe0f}"),
    ("save", "\u{1f4be}"),
    ("cut", "\u{2702}\u{fe0f}"),
    ("copy", "\u{1f4cb}"),
    ("delete", "\u{1f5d1}\u{fe0f}"),
    ("photo", "\u{1f4f8}"),
    ("video", "\u{1f3a6}"),
    ("movie", "\u{1f3ac}"),
    ("home", "\u{1f3e0}"),
    ("play", "\u{25b6}\u{fe0f}"),
    ("pause", "\u{23f8}\u{fe0f}"),
    ("resume", "\u{23ef}\u{fe0f}"),
    ("stop", "\u{23f9}\u{fe0f}"),
    ("online", "\u{1f7e2}"),
    ("offline", "\u{1f534}"),
    ("profile", "\u{1f464}"),
    ("port", "\u{1f50c}"),
    ("speed", "\u{26a1}"),
    ("tool", "\u{1f527}"),
    ("hotbed", "\u{2668}\u{fe0f}"),
    ("cooldown", "\u{2744}\u{fe0f}"),
    ("flowrate", "\u{23ec}"),
    ("feedrate", "\u{23e9}"),
    ("filament", "\u{1f9f5}"),
    ("height", "\u{2195}\u{fe0f}"),
    ("cost", "\u{1f4b0}"),
    ("notify", "\u{1f514}"),
    ("nonotify", "\u{1f515}"),
    ("emergency", "\u{1f6a8}"),
    ("calendar", "\u{1f4c5}"),
    ("clock", "\u{1f552}"),
    ("alarmclock", "\u{23f0}"),
    ("stopwatch", "\u{23f1}\u{fe0f}"),
    ("finish", "\u{1f3c1}"),
    // A few common names that show up in user templates.
    ("thumbs up", "\u{1f44d}"),
    ("fire", "\u{1f525}"),
    ("hourglass done", "\u{231b}"),
    ("party popper", "\u{1f389}"),
    ("thermometer", "\u{1f321}\u{fe0f}"),
];

/// Case-insensitive lookup; colons around the name are ignored.
pub fn lookup(name: &str) -> Option<&'static str> {
    let normalized = name.replace(':', "").to_lowercase();
    EMOJI
        .iter()
        .find(|(key, _)| *key == normalized)
        .map(|(_, glyph)| *glyph)
}

/// Resolves emoji names, or renders nothing when icons are switched off.
#[derive(Debug, Clone, Copy)]
pub struct Emoji {
    enabled: bool,
}

impl Emoji {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn get(&self, name: &str) -> &'static str {
        if !self.enabled {
            return "";
        }
        lookup(name).unwrap_or("")
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_ignores_case_and_colons() {
        assert_eq!(lookup(":Warning:"), Some("\u{26a0}\u{fe0f}"));
        assert_eq!(lookup("thumbs up"), Some("\u{1f44d}"));
        assert_eq!(lookup("unknown-thing"), None);
    }

    #[test]
    fn disabled_resolver_renders_nothing() {
        assert_eq!(Emoji::new(false).get("check"), "");
        assert_eq!(Emoji::new(true).get("check"), "\u{2705}");
        assert_eq!(Emoji::new(true).get("nope"), "");
    }
}
