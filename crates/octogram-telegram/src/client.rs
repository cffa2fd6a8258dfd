//! HTTP transport for the Bot API.

use crate::keyboard::inline_keyboard_json;
use crate::types::{BotCommand, ChatInfo, File, Message, Update, User, UserProfilePhotos};
use crate::{BotApi, EditMessage, MediaGroup, SendMessage, TransportError};
use anyhow::{anyhow, Result};
use octogram_config::TelegramConfig;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, ClientBuilder, Proxy, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";
const REQUEST_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    result: Option<T>,
}

/// Validates a Bot API response: status 200, a JSON content type and `ok:true`.
pub fn check_envelope<T: DeserializeOwned>(
    method: &str,
    status: u16,
    content_type: Option<&str>,
    body: &str,
) -> std::result::Result<T, TransportError> {
    if status != 200 {
        return Err(TransportError::Status {
            method: method.to_string(),
            status,
            body: body.to_string(),
        });
    }

    let content_type = content_type.unwrap_or_default();
    if !content_type.starts_with("application/json") {
        return Err(TransportError::ContentType {
            method: method.to_string(),
            content_type: content_type.to_string(),
        });
    }

    let parsed: ApiResponse<T> = serde_json::from_str(body).map_err(|e| TransportError::Decode {
        method: method.to_string(),
        reason: e.to_string(),
    })?;

    if !parsed.ok {
        return Err(TransportError::NotOk {
            method: method.to_string(),
            description: parsed.description.unwrap_or_default(),
        });
    }

    parsed.result.ok_or_else(|| TransportError::Decode {
        method: method.to_string(),
        reason: "missing result".to_string(),
    })
}

pub struct TelegramClient {
    client: Client,
    bot_token: String,
    api_base: String,
    client_timeout: Duration,
}

impl std::fmt::Debug for TelegramClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramClient")
            .field("api_base", &self.api_base)
            .field("client_timeout", &self.client_timeout)
            .finish()
    }
}

impl TelegramClient {
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        Ok(Self {
            client: Self::build_client(config)?,
            bot_token: config.bot_token.trim().to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            client_timeout: Duration::from_secs(config.client_timeout_secs),
        })
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    fn build_client(config: &TelegramConfig) -> Result<Client> {
        let mut builder = ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(600))
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::none());

        if let Some(proxy) = config.http_proxy.as_deref().filter(|p| !p.trim().is_empty()) {
            builder = builder.proxy(
                Proxy::http(proxy.trim()).map_err(|e| anyhow!("invalid http_proxy: {}", e))?,
            );
        }
        if let Some(proxy) = config.https_proxy.as_deref().filter(|p| !p.trim().is_empty()) {
            builder = builder.proxy(
                Proxy::https(proxy.trim()).map_err(|e| anyhow!("invalid https_proxy: {}", e))?,
            );
        }

        builder
            .build()
            .map_err(|e| anyhow!("failed to build HTTP client: {}", e))
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!("{}/file/bot{}/{}", self.api_base, self.bot_token, file_path)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        payload: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<T> {
        debug!("Sending Telegram request {}", method);
        let mut request = self.client.post(self.method_url(method)).json(&payload);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let resp = request.send().await.map_err(|e| TransportError::Request {
            method: method.to_string(),
            reason: without_url(e),
        })?;
        Ok(Self::finish(method, resp).await?)
    }

    async fn call_multipart<T: DeserializeOwned>(&self, method: &str, form: Form) -> Result<T> {
        debug!("Sending Telegram multipart request {}", method);
        let resp = self
            .client
            .post(self.method_url(method))
            .multipart(form)
            .send()
            .await
            .map_err(|e| TransportError::Request {
                method: method.to_string(),
                reason: without_url(e),
            })?;
        Ok(Self::finish(method, resp).await?)
    }

    async fn finish<T: DeserializeOwned>(
        method: &str,
        resp: Response,
    ) -> std::result::Result<T, TransportError> {
        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.text().await.map_err(|e| TransportError::Decode {
            method: method.to_string(),
            reason: without_url(e),
        })?;
        check_envelope(method, status, content_type.as_deref(), &body)
    }
}

/// reqwest errors embed the request URL, which carries the bot token.
fn without_url(err: reqwest::Error) -> String {
    err.without_url().to_string()
}

fn message_payload(message: &SendMessage) -> serde_json::Value {
    let mut payload = serde_json::json!({
        "chat_id": message.chat_id,
        "text": message.text,
        "disable_notification": message.disable_notification,
        "disable_web_page_preview": message.disable_web_page_preview,
    });
    if let Some(parse_mode) = &message.parse_mode {
        payload["parse_mode"] = serde_json::json!(parse_mode);
    }
    if let Some(keyboard) = &message.reply_markup {
        payload["reply_markup"] = inline_keyboard_json(keyboard);
    }
    payload
}

fn edit_payload(edit: &EditMessage) -> serde_json::Value {
    let mut payload = serde_json::json!({
        "chat_id": edit.chat_id,
        "message_id": edit.message_id,
        "text": edit.text,
    });
    if let Some(parse_mode) = &edit.parse_mode {
        payload["parse_mode"] = serde_json::json!(parse_mode);
    }
    if let Some(keyboard) = &edit.reply_markup {
        payload["reply_markup"] = inline_keyboard_json(keyboard);
    }
    payload
}

fn media_descriptor(group: &MediaGroup) -> serde_json::Value {
    let items: Vec<serde_json::Value> = group
        .items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let mut entry = serde_json::json!({
                "type": item.kind.as_str(),
                "media": format!("attach://{}_{}", item.kind.as_str(), i),
            });
            if let Some(caption) = &item.caption {
                entry["caption"] = serde_json::json!(caption);
                if let Some(parse_mode) = &item.parse_mode {
                    entry["parse_mode"] = serde_json::json!(parse_mode);
                }
            }
            entry
        })
        .collect();
    serde_json::Value::Array(items)
}

#[async_trait::async_trait]
impl BotApi for TelegramClient {
    async fn get_me(&self) -> Result<User> {
        self.call("getMe", serde_json::json!({}), None).await
    }

    async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Update>> {
        let payload = serde_json::json!({
            "offset": offset,
            "timeout": timeout_secs,
        });
        // The client must outlive the server-side long poll.
        let client_timeout = self
            .client_timeout
            .max(Duration::from_secs(timeout_secs + 1));
        self.call("getUpdates", payload, Some(client_timeout)).await
    }

    async fn send_message(&self, message: &SendMessage) -> Result<Message> {
        self.call("sendMessage", message_payload(message), None).await
    }

    async fn edit_message_text(&self, edit: &EditMessage) -> Result<()> {
        let _: serde_json::Value = self.call("editMessageText", edit_payload(edit), None).await?;
        Ok(())
    }

    async fn send_media_group(&self, group: MediaGroup) -> Result<Vec<Message>> {
        let media = media_descriptor(&group);
        let mut form = Form::new()
            .text("chat_id", group.chat_id.clone())
            .text("disable_notification", group.disable_notification.to_string())
            .text("media", media.to_string());
        for (i, item) in group.items.into_iter().enumerate() {
            let name = format!("{}_{}", item.kind.as_str(), i);
            let extension = match item.kind {
                crate::MediaKind::Photo => "jpg",
                crate::MediaKind::Video => "mp4",
            };
            let part = Part::bytes(item.bytes).file_name(format!("{}.{}", name, extension));
            form = form.part(name, part);
        }
        self.call_multipart("sendMediaGroup", form).await
    }

    async fn send_document(
        &self,
        chat_id: &str,
        file_name: &str,
        bytes: Vec<u8>,
        caption: &str,
    ) -> Result<()> {
        let form = Form::new()
            .text("chat_id", chat_id.to_string())
            .text("caption", caption.to_string())
            .part("document", Part::bytes(bytes).file_name(file_name.to_string()));
        let _: serde_json::Value = self.call_multipart("sendDocument", form).await?;
        Ok(())
    }

    async fn send_chat_action(&self, chat_id: &str, action: &str) -> Result<()> {
        let payload = serde_json::json!({
            "chat_id": chat_id,
            "action": action,
        });
        let _: bool = self.call("sendChatAction", payload, None).await?;
        Ok(())
    }

    async fn delete_message(&self, chat_id: &str, message_id: i64) -> Result<()> {
        let payload = serde_json::json!({
            "chat_id": chat_id,
            "message_id": message_id,
        });
        let _: bool = self.call("deleteMessage", payload, None).await?;
        Ok(())
    }

    async fn answer_callback_query(&self, callback_query_id: &str) -> Result<()> {
        let payload = serde_json::json!({ "callback_query_id": callback_query_id });
        let _: bool = self.call("answerCallbackQuery", payload, None).await?;
        Ok(())
    }

    async fn get_file(&self, file_id: &str) -> Result<File> {
        self.call("getFile", serde_json::json!({ "file_id": file_id }), None)
            .await
    }

    async fn download_file(&self, file_path: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get(self.file_url(file_path))
            .send()
            .await
            .map_err(|e| anyhow!("telegram file download failed: {}", without_url(e)))?
            .error_for_status()
            .map_err(|e| anyhow!("telegram file download HTTP error: {}", without_url(e)))?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| anyhow!("telegram file download read failed: {}", without_url(e)))?;
        Ok(bytes.to_vec())
    }

    async fn get_chat(&self, chat_id: &str) -> Result<ChatInfo> {
        self.call("getChat", serde_json::json!({ "chat_id": chat_id }), None)
            .await
    }

    async fn get_user_profile_photos(&self, user_id: &str, limit: u32) -> Result<UserProfilePhotos> {
        let payload = serde_json::json!({
            "user_id": user_id,
            "limit": limit,
        });
        self.call("getUserProfilePhotos", payload, None).await
    }

    async fn set_my_commands(&self, commands: &[BotCommand]) -> Result<()> {
        let payload = serde_json::json!({ "commands": commands });
        let _: bool = self.call("setMyCommands", payload, None).await?;
        Ok(())
    }

    async fn get_my_commands(&self) -> Result<Vec<BotCommand>> {
        self.call("getMyCommands", serde_json::json!({}), None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MediaItem, MediaKind};
    use octogram_ipc::InlineButton;

    #[test]
    fn envelope_requires_status_200() {
        let err = check_envelope::<serde_json::Value>("getUpdates", 502, Some("text/html"), "oops")
            .expect_err("status");
        assert!(matches!(err, TransportError::Status { status: 502, .. }));
    }

    #[test]
    fn envelope_requires_json_content_type() {
        let err = check_envelope::<serde_json::Value>("getUpdates", 200, Some("text/html"), "{}")
            .expect_err("content type");
        assert!(matches!(err, TransportError::ContentType { .. }));
    }

    #[test]
    fn envelope_requires_ok_true() {
        let err = check_envelope::<serde_json::Value>(
            "sendMessage",
            200,
            Some("application/json"),
            r#"{"ok":false,"description":"Bad Request: chat not found"}"#,
        )
        .expect_err("not ok");
        match err {
            TransportError::NotOk { description, .. } => assert!(description.contains("chat not found")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn envelope_decodes_result() {
        let updates: Vec<Update> = check_envelope(
            "getUpdates",
            200,
            Some("application/json; charset=utf-8"),
            r#"{"ok":true,"result":[{"update_id":5,"message":{"message_id":1,"chat":{"id":42,"type":"private"},"text":"/status"}}]}"#,
        )
        .expect("decode");
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].update_id, 5);
    }

    #[test]
    fn message_payload_carries_options_and_keyboard() {
        let payload = message_payload(&SendMessage {
            chat_id: "42".to_string(),
            text: "hi".to_string(),
            parse_mode: Some("HTML".to_string()),
            reply_markup: Some(vec![vec![InlineButton::new("Yes", "/print_ab12")]]),
            disable_notification: true,
            disable_web_page_preview: true,
        });
        assert_eq!(payload["parse_mode"], "HTML");
        assert_eq!(payload["disable_notification"], true);
        assert_eq!(
            payload["reply_markup"]["inline_keyboard"][0][0]["callback_data"],
            "/print_ab12"
        );
    }

    #[test]
    fn media_descriptor_captions_only_first_item() {
        let group = MediaGroup {
            chat_id: "42".to_string(),
            items: vec![
                MediaItem {
                    kind: MediaKind::Photo,
                    bytes: vec![1],
                    caption: Some("done".to_string()),
                    parse_mode: Some("Markdown".to_string()),
                },
                MediaItem {
                    kind: MediaKind::Video,
                    bytes: vec![2],
                    caption: None,
                    parse_mode: Some("Markdown".to_string()),
                },
            ],
            disable_notification: false,
        };
        let media = media_descriptor(&group);
        assert_eq!(media[0]["media"], "attach://photo_0");
        assert_eq!(media[0]["caption"], "done");
        assert_eq!(media[1]["media"], "attach://video_1");
        assert!(media[1].get("caption").is_none());
        assert!(media[1].get("parse_mode").is_none());
    }

    #[test]
    fn debug_output_hides_token() {
        let config = TelegramConfig {
            bot_token: "123456:SECRETSECRET".to_string(),
            ..TelegramConfig::default()
        };
        let client = TelegramClient::new(&config).expect("client");
        assert!(!format!("{:?}", client).contains("SECRET"));
        assert!(client.method_url("getMe").ends_with("/bot123456:SECRETSECRET/getMe"));
    }
}
