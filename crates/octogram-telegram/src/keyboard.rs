//! Inline keyboard helpers

use octogram_ipc::{InlineButton, Keyboard};

/// Telegram rejects callback payloads longer than this many bytes.
pub const MAX_CALLBACK_DATA: usize = 64;

pub fn inline_keyboard_json(keyboard: &Keyboard) -> serde_json::Value {
    serde_json::json!({
        "inline_keyboard": keyboard.iter().map(|row| {
            row.iter().map(|btn| serde_json::json!({
                "text": btn.text,
                "callback_data": btn.callback_data
            })).collect::<Vec<_>>()
        }).collect::<Vec<_>>()
    })
}

/// Lays buttons out `per_row` at a time; the last row may be shorter.
pub fn rows_of(buttons: Vec<InlineButton>, per_row: usize) -> Keyboard {
    let per_row = per_row.max(1);
    let mut rows = Vec::new();
    let mut current = Vec::with_capacity(per_row);
    for button in buttons {
        current.push(button);
        if current.len() == per_row {
            rows.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        rows.push(current);
    }
    rows
}

/// True when every button payload fits Telegram's callback limit.
pub fn fits_callback_limit(keyboard: &Keyboard) -> bool {
    keyboard
        .iter()
        .flatten()
        .all(|button| button.callback_data.len() <= MAX_CALLBACK_DATA)
}
