//! Relay Telegram Adapter
//!
//! Telegram Bot API long-polling with client recreation, inline keyboards,
//! callback queries, message chunking, and the outbound `Messenger` surface
//! (send/edit/delete, chat membership, documents, file downloads).

pub mod menu;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use relay_config::TelegramConfig;
use relay_ipc::{
    BotIdentity, CallbackEvent, ChatKind, Envelope, EventBus, FileMeta, Inbound, InboundMessage,
    InlineKeyboard, Messenger, ReplyRef, UserProfile,
};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, ClientBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const TELEGRAM_MAX_MESSAGE_LEN: usize = 4096;
const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    pub message: Option<TelegramMessage>,
    #[serde(default)]
    pub callback_query: Option<TelegramCallbackQuery>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub text: Option<String>,
    pub caption: Option<String>,
    #[serde(default)]
    pub document: Option<TelegramDocument>,
    pub chat: TelegramChat,
    pub from: Option<TelegramUser>,
    #[serde(default)]
    pub reply_to_message: Option<Box<TelegramReplyToMessage>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramDocument {
    pub file_id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
    #[serde(rename = "type")]
    pub chat_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUser {
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

impl From<&TelegramUser> for UserProfile {
    fn from(user: &TelegramUser) -> Self {
        UserProfile {
            id: user.id,
            username: user.username.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            is_bot: user.is_bot,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramReplyToMessage {
    pub message_id: i64,
    pub from: Option<TelegramUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramCallbackQuery {
    pub id: String,
    pub from: TelegramUser,
    pub message: Option<TelegramMessage>,
    pub data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct TelegramChatMember {
    user: TelegramUser,
}

#[derive(Debug, Clone, Deserialize)]
struct TelegramFile {
    file_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

pub struct TelegramAdapter {
    client: Client,
    bot_token: String,
    account_tag: String,
    allowed_chats: Option<HashSet<i64>>,
    api_base: String,
    poll_timeout_secs: u64,
    client_recreate_interval_secs: u64,
    event_bus: Option<EventBus>,
}

impl TelegramAdapter {
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        let allowed_chats = config
            .allowed_chats
            .clone()
            .map(|items| items.into_iter().collect());

        Ok(Self {
            client: Self::build_client()?,
            bot_token: config.bot_token.trim().to_string(),
            account_tag: config.account_tag(),
            allowed_chats,
            api_base: TELEGRAM_API_BASE.to_string(),
            poll_timeout_secs: config.poll_timeout_secs.unwrap_or(60),
            client_recreate_interval_secs: config.client_recreate_interval_secs.unwrap_or(60),
            event_bus: None,
        })
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Points the adapter at another Bot API host (local bot server, tests).
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    pub fn account_tag(&self) -> &str {
        &self.account_tag
    }

    fn build_client() -> Result<Client> {
        ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(600))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .timeout(Duration::from_secs(180))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| anyhow!("failed to build HTTP client: {}", e))
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!("{}/file/bot{}/{}", self.api_base, self.bot_token, file_path)
    }

    fn is_chat_allowed(&self, chat_id: i64) -> bool {
        self.allowed_chats
            .as_ref()
            .map_or(true, |allowed| allowed.contains(&chat_id))
    }

    /// Plain JSON call without Markdown handling.
    async fn call<T: DeserializeOwned>(
        &self,
        client: &Client,
        method: &str,
        payload: serde_json::Value,
    ) -> Result<T> {
        let resp = client
            .post(self.method_url(method))
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow!("telegram {} request failed: {}", method, e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("telegram {} HTTP {}: {}", method, status, body));
        }

        let parsed: ApiResponse<T> = resp
            .json()
            .await
            .map_err(|e| anyhow!("telegram {} decode failed: {}", method, e))?;

        Self::unwrap_result(method, parsed)
    }

    fn unwrap_result<T>(method: &str, parsed: ApiResponse<T>) -> Result<T> {
        if !parsed.ok {
            return Err(anyhow!(
                "telegram {} returned ok=false: {}",
                method,
                parsed.description.unwrap_or_default()
            ));
        }
        parsed
            .result
            .ok_or_else(|| anyhow!("telegram {} returned no result", method))
    }

    pub async fn get_updates(
        &self,
        client: &Client,
        offset: Option<i64>,
    ) -> Result<Vec<TelegramUpdate>> {
        let mut payload = serde_json::json!({
            "timeout": self.poll_timeout_secs,
            "allowed_updates": ["message", "callback_query"],
        });

        if let Some(offset) = offset {
            payload["offset"] = serde_json::json!(offset);
        }

        self.call(client, "getUpdates", payload).await
    }

    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<i64>,
        inline_keyboard: Option<InlineKeyboard>,
    ) -> Result<i64> {
        let chunks = self.chunk_message(text);
        let url = self.method_url("sendMessage");
        let mut last_message_id = None;

        for (i, chunk) in chunks.iter().enumerate() {
            let mut payload = serde_json::json!({
                "chat_id": chat_id,
                "text": chunk,
                "parse_mode": "Markdown",
            });

            if let Some(reply_to_message_id) = reply_to {
                if i == 0 {
                    payload["reply_to_message_id"] = serde_json::json!(reply_to_message_id);
                }
            }

            if i == chunks.len() - 1 {
                if let Some(keyboard) = &inline_keyboard {
                    payload["reply_markup"] = Self::keyboard_markup(keyboard);
                }
            }

            let sent = self.send_with_markdown_fallback(&url, payload).await?;
            last_message_id = sent.get("message_id").and_then(|v| v.as_i64());
        }

        last_message_id.ok_or_else(|| anyhow!("telegram sendMessage returned no message_id"))
    }

    pub async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        inline_keyboard: Option<InlineKeyboard>,
    ) -> Result<()> {
        // editMessageText cannot be split into chunks: fallback to a new message if too long.
        if text.chars().count() > TELEGRAM_MAX_MESSAGE_LEN {
            return self
                .send_message(chat_id, text, None, inline_keyboard)
                .await
                .map(|_| ());
        }

        let url = self.method_url("editMessageText");

        let mut payload = serde_json::json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": text,
            "parse_mode": "Markdown",
        });

        if let Some(keyboard) = &inline_keyboard {
            payload["reply_markup"] = Self::keyboard_markup(keyboard);
        }

        self.send_with_markdown_fallback(&url, payload)
            .await
            .map(|_| ())
    }

    fn keyboard_markup(keyboard: &InlineKeyboard) -> serde_json::Value {
        serde_json::json!({
            "inline_keyboard": keyboard.iter().map(|row| {
                row.iter().map(|btn| serde_json::json!({
                    "text": btn.text,
                    "callback_data": btn.callback_data
                })).collect::<Vec<_>>()
            }).collect::<Vec<_>>()
        })
    }

    async fn send_with_markdown_fallback(
        &self,
        url: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let endpoint = url.rsplit('/').next().unwrap_or("telegram");

        let first_resp = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow!("telegram {} request failed: {}", endpoint, e))?;

        if first_resp.status().is_success() {
            let parsed: ApiResponse<serde_json::Value> = first_resp
                .json()
                .await
                .map_err(|e| anyhow!("telegram {} decode failed: {}", endpoint, e))?;
            if parsed.ok {
                return Ok(parsed.result.unwrap_or(serde_json::Value::Null));
            }
            warn!(
                "telegram {} returned ok=false with Markdown payload, retrying without parse_mode",
                endpoint
            );
        } else {
            let status = first_resp.status();
            let body = first_resp.text().await.unwrap_or_default();
            warn!(
                "telegram {} HTTP {} with Markdown payload, retrying without parse_mode: {}",
                endpoint, status, body
            );
        }

        let mut fallback_payload = payload;
        if let Some(obj) = fallback_payload.as_object_mut() {
            obj.remove("parse_mode");
        }

        let fallback_resp = self
            .client
            .post(url)
            .json(&fallback_payload)
            .send()
            .await
            .map_err(|e| anyhow!("telegram {} fallback request failed: {}", endpoint, e))?;

        if !fallback_resp.status().is_success() {
            let status = fallback_resp.status();
            let body = fallback_resp.text().await.unwrap_or_default();
            if Self::is_reply_target_missing(&body) {
                let mut no_reply_payload = fallback_payload.clone();
                if Self::remove_reply_to_message_id(&mut no_reply_payload) {
                    warn!(
                        "telegram {} fallback failed due to missing reply target; retrying without reply_to_message_id",
                        endpoint
                    );
                    return self
                        .call(&self.client, endpoint, no_reply_payload)
                        .await;
                }
            }
            return Err(anyhow!(
                "telegram {} fallback HTTP {}: {}",
                endpoint,
                status,
                body
            ));
        }

        let parsed: ApiResponse<serde_json::Value> = fallback_resp
            .json()
            .await
            .map_err(|e| anyhow!("telegram {} fallback decode failed: {}", endpoint, e))?;
        Self::unwrap_result(endpoint, parsed)
    }

    fn remove_reply_to_message_id(payload: &mut serde_json::Value) -> bool {
        payload
            .as_object_mut()
            .map(|obj| obj.remove("reply_to_message_id").is_some())
            .unwrap_or(false)
    }

    fn is_reply_target_missing(body: &str) -> bool {
        body.to_ascii_lowercase()
            .contains("message to be replied not found")
    }

    fn chunk_message(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        if chars.len() <= TELEGRAM_MAX_MESSAGE_LEN {
            return vec![text.to_string()];
        }

        let mut chunks = Vec::new();
        let mut start = 0usize;

        while start < chars.len() {
            let mut end = (start + TELEGRAM_MAX_MESSAGE_LEN).min(chars.len());

            if end < chars.len() {
                let split = (start..end)
                    .rev()
                    .find(|&i| matches!(chars[i], '\n' | ' ' | '.' | '!' | '?'))
                    .map(|i| i + 1);
                if let Some(split) = split.filter(|&split| split > start) {
                    end = split;
                }
            }

            chunks.push(chars[start..end].iter().collect::<String>());
            start = end;
        }

        chunks
    }

    pub async fn poll(&self) -> Result<()> {
        let mut offset: Option<i64> = None;

        info!(account_tag = %self.account_tag, "Telegram polling started");

        let mut client = self.client.clone();
        let mut client_recreate_at =
            Instant::now() + Duration::from_secs(self.client_recreate_interval_secs);

        if let Err(err) = self.sync_bot_commands(&client).await {
            warn!("Failed to sync Telegram bot commands: {}", err);
        } else {
            info!("Telegram bot commands synced");
        }

        loop {
            if Instant::now() >= client_recreate_at {
                info!("Recreating HTTP client to prevent stale connections");
                client = Self::build_client()?;
                client_recreate_at =
                    Instant::now() + Duration::from_secs(self.client_recreate_interval_secs);
            }

            let updates = match self.get_updates(&client, offset).await {
                Ok(v) => v,
                Err(err) => {
                    warn!("Telegram polling error: {}", err);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };

            for update in updates {
                offset = Some(update.update_id + 1);

                if let Some(message) = &update.message {
                    self.handle_message(message).await;
                }

                if let Some(callback) = &update.callback_query {
                    self.handle_callback(callback).await;
                }
            }
        }
    }

    async fn sync_bot_commands(&self, client: &Client) -> Result<()> {
        let commands = menu::command_list()
            .iter()
            .map(|(command, description)| {
                serde_json::json!({ "command": command, "description": description })
            })
            .collect::<Vec<_>>();

        let _: bool = self
            .call(
                client,
                "setMyCommands",
                serde_json::json!({ "commands": commands }),
            )
            .await?;
        Ok(())
    }

    /// Maps a Bot API message onto the platform-neutral shape.
    /// Returns `None` for unknown chat types and for messages carrying neither
    /// text nor a document.
    pub fn to_inbound(message: &TelegramMessage) -> Option<InboundMessage> {
        let chat_kind = match message.chat.chat_type.parse::<ChatKind>() {
            Ok(kind) => kind,
            Err(err) => {
                debug!("Skipping message: {}", err);
                return None;
            }
        };

        let text = message.text.clone().or_else(|| message.caption.clone());
        let document = message.document.as_ref().map(|doc| FileMeta {
            file_id: doc.file_id.clone(),
            file_name: doc.file_name.clone(),
            mime_type: doc.mime_type.clone(),
            file_size: doc.file_size,
        });

        // Stickers, photos and voice notes carry neither, but still show who is in the chat.
        if text.is_none() && document.is_none() && message.from.is_none() {
            return None;
        }

        Some(InboundMessage {
            chat_id: message.chat.id,
            chat_kind,
            message_id: message.message_id,
            sender: message.from.as_ref().map(UserProfile::from),
            text,
            reply_to: message.reply_to_message.as_ref().map(|reply| ReplyRef {
                message_id: reply.message_id,
                author: reply.from.as_ref().map(UserProfile::from),
            }),
            document,
        })
    }

    async fn handle_message(&self, message: &TelegramMessage) {
        let chat_id = message.chat.id;

        if !self.is_chat_allowed(chat_id) {
            info!("Skipping message from unauthorized chat {}", chat_id);
            return;
        }

        let Some(inbound) = Self::to_inbound(message) else {
            return;
        };

        let from_username = message
            .from
            .as_ref()
            .and_then(|u| u.username.as_deref())
            .unwrap_or("unknown");
        debug!(
            chat_id = chat_id,
            has_document = inbound.document.is_some(),
            "Received message from {}",
            from_username
        );

        self.publish(Inbound::Message(inbound)).await;
    }

    async fn handle_callback(&self, callback: &TelegramCallbackQuery) {
        let chat = callback.message.as_ref().map(|m| &m.chat);
        let chat_id = chat.map(|c| c.id);

        debug!("Received callback query: {:?}", callback.data);

        if let Some(chat_id) = chat_id {
            if !self.is_chat_allowed(chat_id) {
                info!("Skipping callback from unauthorized chat {}", chat_id);
                let _ = self.answer_callback_query(&callback.id, None).await;
                return;
            }
        }

        let event = CallbackEvent {
            query_id: callback.id.clone(),
            from: UserProfile::from(&callback.from),
            chat_id,
            chat_kind: chat.and_then(|c| c.chat_type.parse::<ChatKind>().ok()),
            message_id: callback.message.as_ref().map(|m| m.message_id),
            data: callback.data.clone().unwrap_or_default(),
        };

        self.publish(Inbound::Callback(event)).await;
    }

    async fn publish(&self, inbound: Inbound) {
        if let Some(event_bus) = &self.event_bus {
            let envelope = Envelope::new(&self.account_tag, inbound);
            if let Err(e) = event_bus.publish(envelope).await {
                warn!("Failed to publish update to event bus: {}", e);
            }
        } else {
            info!("No event bus configured, update not forwarded");
        }
    }

    pub async fn answer_callback_query(
        &self,
        callback_query_id: &str,
        text: Option<&str>,
    ) -> Result<()> {
        let mut payload = serde_json::json!({
            "callback_query_id": callback_query_id,
        });

        if let Some(t) = text {
            payload["text"] = serde_json::json!(t);
        }

        let _: bool = self
            .call(&self.client, "answerCallbackQuery", payload)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Messenger for TelegramAdapter {
    async fn get_me(&self) -> Result<BotIdentity> {
        let me: TelegramUser = self
            .call(&self.client, "getMe", serde_json::json!({}))
            .await?;
        let username = me
            .username
            .ok_or_else(|| anyhow!("telegram getMe returned no username"))?;
        Ok(BotIdentity {
            id: me.id,
            username,
        })
    }

    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<i64>,
        keyboard: Option<InlineKeyboard>,
    ) -> Result<i64> {
        self.send_message(chat_id, text, reply_to, keyboard).await
    }

    async fn edit_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        keyboard: Option<InlineKeyboard>,
    ) -> Result<()> {
        self.edit_message_text(chat_id, message_id, text, keyboard)
            .await
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()> {
        let _: bool = self
            .call(
                &self.client,
                "deleteMessage",
                serde_json::json!({ "chat_id": chat_id, "message_id": message_id }),
            )
            .await?;
        Ok(())
    }

    async fn answer_callback(&self, query_id: &str, text: Option<&str>) -> Result<()> {
        self.answer_callback_query(query_id, text).await
    }

    async fn send_chat_action(&self, chat_id: i64, action: &str) -> Result<()> {
        let _: bool = self
            .call(
                &self.client,
                "sendChatAction",
                serde_json::json!({ "chat_id": chat_id, "action": action }),
            )
            .await?;
        Ok(())
    }

    async fn chat_member_count(&self, chat_id: i64) -> Result<u32> {
        self.call(
            &self.client,
            "getChatMemberCount",
            serde_json::json!({ "chat_id": chat_id }),
        )
        .await
    }

    async fn chat_administrators(&self, chat_id: i64) -> Result<Vec<UserProfile>> {
        let members: Vec<TelegramChatMember> = self
            .call(
                &self.client,
                "getChatAdministrators",
                serde_json::json!({ "chat_id": chat_id }),
            )
            .await?;
        Ok(members
            .iter()
            .map(|member| UserProfile::from(&member.user))
            .collect())
    }

    async fn send_document(&self, chat_id: i64, file_name: &str, bytes: Vec<u8>) -> Result<i64> {
        let form = Form::new().text("chat_id", chat_id.to_string()).part(
            "document",
            Part::bytes(bytes).file_name(file_name.to_string()),
        );

        let resp = self
            .client
            .post(self.method_url("sendDocument"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| anyhow!("telegram sendDocument request failed: {}", e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("telegram sendDocument HTTP {}: {}", status, body));
        }

        let parsed: ApiResponse<serde_json::Value> = resp
            .json()
            .await
            .map_err(|e| anyhow!("telegram sendDocument decode failed: {}", e))?;
        let sent = Self::unwrap_result("sendDocument", parsed)?;
        sent.get("message_id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| anyhow!("telegram sendDocument returned no message_id"))
    }

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>> {
        let file: TelegramFile = self
            .call(
                &self.client,
                "getFile",
                serde_json::json!({ "file_id": file_id }),
            )
            .await?;
        let file_path = file
            .file_path
            .ok_or_else(|| anyhow!("telegram getFile returned no file_path"))?;

        let resp = self
            .client
            .get(self.file_url(&file_path))
            .send()
            .await
            .map_err(|e| anyhow!("telegram file download failed: {}", e))?
            .error_for_status()
            .map_err(|e| anyhow!("telegram file download HTTP error: {}", e))?;

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| anyhow!("telegram file download read failed: {}", e))?;
        Ok(bytes.to_vec())
    }
}
