//! Bot API wire types, limited to the fields the bridge reads.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: i64,
    #[serde(default)]
    pub from: Option<User>,
    pub chat: Chat,
    #[serde(default)]
    pub date: Option<i64>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub document: Option<Document>,
    #[serde(default)]
    pub new_chat_photo: Option<Vec<PhotoSize>>,
    #[serde(default)]
    pub delete_chat_photo: Option<bool>,
    #[serde(default)]
    pub new_chat_title: Option<String>,
    #[serde(default)]
    pub left_chat_member: Option<User>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type")]
    pub chat_type: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

impl Chat {
    pub fn is_private(&self) -> bool {
        self.chat_type == "private"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

impl User {
    /// `First Last`, falling back to `@username`.
    pub fn display_name(&self) -> String {
        let mut name = self.first_name.clone();
        if let Some(last) = &self.last_name {
            if !name.is_empty() {
                name.push(' ');
            }
            name.push_str(last);
        }
        if name.is_empty() {
            if let Some(username) = &self.username {
                return format!("@{}", username);
            }
        }
        name
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub file_id: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub file_size: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotoSize {
    pub file_id: String,
    #[serde(default)]
    pub width: i64,
    #[serde(default)]
    pub height: i64,
    #[serde(default)]
    pub file_size: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct File {
    pub file_id: String,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub file_size: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatPhoto {
    pub small_file_id: String,
    #[serde(default)]
    pub big_file_id: Option<String>,
}

/// Result of `getChat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatInfo {
    pub id: i64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub photo: Option<ChatPhoto>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserProfilePhotos {
    #[serde(default)]
    pub total_count: i64,
    #[serde(default)]
    pub photos: Vec<Vec<PhotoSize>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BotCommand {
    pub command: String,
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_update_parses_nested_message() {
        let raw = r#"{
            "update_id": 11,
            "callback_query": {
                "id": "cb1",
                "from": {"id": 7, "first_name": "Ada"},
                "message": {"message_id": 3, "chat": {"id": -100, "type": "group", "title": "Lab"}},
                "data": "/files"
            }
        }"#;
        let update: Update = serde_json::from_str(raw).expect("parse");
        let callback = update.callback_query.expect("callback");
        assert_eq!(callback.data.as_deref(), Some("/files"));
        let message = callback.message.expect("message");
        assert_eq!(message.chat.title.as_deref(), Some("Lab"));
        assert!(!message.chat.is_private());
        assert!(update.message.is_none());
    }

    #[test]
    fn service_messages_parse() {
        let raw = r#"{
            "message_id": 9,
            "chat": {"id": -5, "type": "supergroup"},
            "left_chat_member": {"id": 123, "is_bot": true, "first_name": "bot", "username": "printer_bot"},
            "delete_chat_photo": true
        }"#;
        let message: Message = serde_json::from_str(raw).expect("parse");
        assert_eq!(message.left_chat_member.map(|u| u.id), Some(123));
        assert_eq!(message.delete_chat_photo, Some(true));
        assert!(message.text.is_none());
    }

    #[test]
    fn display_name_prefers_full_name() {
        let user = User {
            id: 1,
            is_bot: false,
            first_name: "Grace".to_string(),
            last_name: Some("Hopper".to_string()),
            username: Some("grace".to_string()),
        };
        assert_eq!(user.display_name(), "Grace Hopper");

        let anonymous = User {
            first_name: String::new(),
            last_name: None,
            ..user
        };
        assert_eq!(anonymous.display_name(), "@grace");
    }
}
