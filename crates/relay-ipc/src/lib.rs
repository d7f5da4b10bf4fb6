//! Relay IPC - adapter/runtime boundary
//!
//! Platform-neutral inbound events, the event bus carrying them from the
//! polling adapter to the runtime, and the `Messenger` trait the runtime
//! uses to talk back to the platform.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

static NEXT_TRACE_COUNTER: AtomicU64 = AtomicU64::new(1);

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn generate_trace_id() -> String {
    let ts = now_unix_secs();
    let n = NEXT_TRACE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("trace-{}-{}", ts, n)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Private,
    Group,
    Supergroup,
    Channel,
}

impl ChatKind {
    /// Everything except one-to-one chats.
    pub fn is_group_kind(self) -> bool {
        !matches!(self, ChatKind::Private)
    }
}

impl FromStr for ChatKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(ChatKind::Private),
            "group" => Ok(ChatKind::Group),
            "supergroup" => Ok(ChatKind::Supergroup),
            "channel" => Ok(ChatKind::Channel),
            other => Err(format!("Unknown chat kind: {}", other)),
        }
    }
}

/// Snapshot of a platform account as seen in one update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: String,
    pub last_name: Option<String>,
    pub is_bot: bool,
}

impl UserProfile {
    /// First name when present, else `@handle`, else the numeric id.
    pub fn display_name(&self) -> String {
        let first = self.first_name.trim();
        if !first.is_empty() {
            return first.to_string();
        }
        match self.username.as_deref().map(str::trim) {
            Some(handle) if !handle.is_empty() => format!("@{}", handle),
            _ => self.id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyRef {
    pub message_id: i64,
    pub author: Option<UserProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMeta {
    pub file_id: String,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub chat_id: i64,
    pub chat_kind: ChatKind,
    pub message_id: i64,
    pub sender: Option<UserProfile>,
    pub text: Option<String>,
    pub reply_to: Option<ReplyRef>,
    pub document: Option<FileMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackEvent {
    pub query_id: String,
    pub from: UserProfile,
    pub chat_id: Option<i64>,
    pub chat_kind: Option<ChatKind>,
    pub message_id: Option<i64>,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    Message(InboundMessage),
    Callback(CallbackEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub trace_id: String,
    pub account_tag: String,
    pub inbound: Inbound,
}

impl Envelope {
    pub fn new(account_tag: &str, inbound: Inbound) -> Self {
        Self {
            trace_id: generate_trace_id(),
            account_tag: account_tag.to_string(),
            inbound,
        }
    }

    pub fn chat_id(&self) -> Option<i64> {
        match &self.inbound {
            Inbound::Message(message) => Some(message.chat_id),
            Inbound::Callback(callback) => callback.chat_id,
        }
    }

    pub fn sender_id(&self) -> Option<i64> {
        match &self.inbound {
            Inbound::Message(message) => message.sender.as_ref().map(|user| user.id),
            Inbound::Callback(callback) => Some(callback.from.id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineButton {
    pub text: String,
    pub callback_data: String,
}

impl InlineButton {
    pub fn new(text: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callback_data: callback_data.into(),
        }
    }
}

pub type InlineKeyboard = Vec<Vec<InlineButton>>;

/// The assistant's own platform account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotIdentity {
    pub id: i64,
    pub username: String,
}

impl BotIdentity {
    pub fn mention_token(&self) -> String {
        format!("@{}", self.username)
    }
}

/// Outbound operations the runtime needs from the messaging platform.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn get_me(&self) -> anyhow::Result<BotIdentity>;

    /// Returns the id of the last message sent (long texts are chunked).
    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<i64>,
        keyboard: Option<InlineKeyboard>,
    ) -> anyhow::Result<i64>;

    async fn edit_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        keyboard: Option<InlineKeyboard>,
    ) -> anyhow::Result<()>;

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> anyhow::Result<()>;

    async fn answer_callback(&self, query_id: &str, text: Option<&str>) -> anyhow::Result<()>;

    async fn send_chat_action(&self, chat_id: i64, action: &str) -> anyhow::Result<()>;

    async fn chat_member_count(&self, chat_id: i64) -> anyhow::Result<u32>;

    async fn chat_administrators(&self, chat_id: i64) -> anyhow::Result<Vec<UserProfile>>;

    async fn send_document(
        &self,
        chat_id: i64,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> anyhow::Result<i64>;

    async fn download_file(&self, file_id: &str) -> anyhow::Result<Vec<u8>>;
}

pub const EVENT_BUS_CAPACITY: usize = 256;

/// Producer half of the inbound queue. Cloned into every adapter.
#[derive(Clone)]
pub struct EventBus {
    inbound: mpsc::Sender<Envelope>,
}

impl EventBus {
    pub fn channel() -> (Self, mpsc::Receiver<Envelope>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(EVENT_BUS_CAPACITY);
        (
            Self {
                inbound: inbound_tx,
            },
            inbound_rx,
        )
    }

    pub async fn publish(&self, envelope: Envelope) -> anyhow::Result<()> {
        self.inbound
            .send(envelope)
            .await
            .map_err(|_| anyhow::anyhow!("event bus receiver dropped"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: i64, first: &str, handle: Option<&str>) -> UserProfile {
        UserProfile {
            id,
            username: handle.map(str::to_string),
            first_name: first.to_string(),
            last_name: None,
            is_bot: false,
        }
    }

    fn message(chat_id: i64) -> Inbound {
        Inbound::Message(InboundMessage {
            chat_id,
            chat_kind: ChatKind::Group,
            message_id: 1,
            sender: Some(user(7, "Anna", None)),
            text: Some("hello".to_string()),
            reply_to: None,
            document: None,
        })
    }

    #[test]
    fn chat_kind_parses_telegram_types() {
        assert_eq!("private".parse::<ChatKind>(), Ok(ChatKind::Private));
        assert_eq!("supergroup".parse::<ChatKind>(), Ok(ChatKind::Supergroup));
        assert!("secret".parse::<ChatKind>().is_err());
        assert!(!ChatKind::Private.is_group_kind());
        assert!(ChatKind::Channel.is_group_kind());
    }

    #[test]
    fn display_name_falls_back_to_handle_then_id() {
        assert_eq!(user(1, "Anna", Some("anna")).display_name(), "Anna");
        assert_eq!(user(1, " ", Some("anna")).display_name(), "@anna");
        assert_eq!(user(1, "", None).display_name(), "1");
    }

    #[test]
    fn trace_id_different_for_each_envelope() {
        let env1 = Envelope::new("123", message(1));
        let env2 = Envelope::new("123", message(1));
        assert!(env1.trace_id.starts_with("trace-"));
        assert_ne!(env1.trace_id, env2.trace_id);
    }

    #[test]
    fn envelope_exposes_chat_and_sender() {
        let env = Envelope::new("123", message(-100));
        assert_eq!(env.chat_id(), Some(-100));
        assert_eq!(env.sender_id(), Some(7));
    }

    #[test]
    fn mention_token_prefixes_at_sign() {
        let me = BotIdentity {
            id: 1,
            username: "RelayBot".to_string(),
        };
        assert_eq!(me.mention_token(), "@RelayBot");
    }

    #[tokio::test]
    async fn event_bus_delivers_in_order() {
        let (bus, mut rx) = EventBus::channel();
        bus.publish(Envelope::new("t", message(1))).await.expect("publish");
        bus.publish(Envelope::new("t", message(2))).await.expect("publish");
        assert_eq!(rx.recv().await.and_then(|e| e.chat_id()), Some(1));
        assert_eq!(rx.recv().await.and_then(|e| e.chat_id()), Some(2));
    }

    #[tokio::test]
    async fn publish_fails_once_receiver_is_gone() {
        let (bus, rx) = EventBus::channel();
        drop(rx);
        assert!(bus.publish(Envelope::new("t", message(1))).await.is_err());
    }
}
