//! Escaping of user-controlled values for the Bot API parse modes.

use octogram_ipc::Markup;

const MARKDOWN_V1_SPECIAL: &[char] = &['_', '*', '`', '['];
const MARKDOWN_V2_SPECIAL: &[char] = &[
    '\\', '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
];

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            other => out.push(other),
        }
    }
    out
}

fn escape_chars(text: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

pub fn escape_markdown(text: &str) -> String {
    escape_chars(text, MARKDOWN_V1_SPECIAL)
}

pub fn escape_markdown_v2(text: &str) -> String {
    escape_chars(text, MARKDOWN_V2_SPECIAL)
}

/// Escapes `text` for the given parse mode; `Off` leaves it untouched.
pub fn escape(markup: Markup, text: &str) -> String {
    match markup {
        Markup::Off => text.to_string(),
        Markup::Html => escape_html(text),
        Markup::Markdown => escape_markdown(text),
        Markup::MarkdownV2 => escape_markdown_v2(text),
    }
}

/// Line break for the parse mode.
pub fn line_break(markup: Markup) -> &'static str {
    match markup {
        Markup::Html => "<br>",
        _ => "\n",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_escapes_entities() {
        assert_eq!(escape_html("<b>Tom & \"Jerry\"</b>"), "&lt;b&gt;Tom &amp; &quot;Jerry&quot;&lt;/b&gt;");
    }

    #[test]
    fn markdown_v1_only_touches_its_specials() {
        assert_eq!(escape_markdown("a_b*c`d[e]f.g"), "a\\_b\\*c\\`d\\[e]f.g");
    }

    #[test]
    fn markdown_v2_escapes_punctuation() {
        assert_eq!(escape_markdown_v2("v1.2-rc!"), "v1\\.2\\-rc\\!");
        assert_eq!(escape_markdown_v2("a\\b"), "a\\\\b");
    }

    #[test]
    fn off_is_identity() {
        assert_eq!(escape(Markup::Off, "<_*>"), "<_*>");
        assert_eq!(escape(Markup::Html, "<"), "&lt;");
    }
}
