//! In-memory doubles for the platform and the completion service.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use relay_ipc::{BotIdentity, InlineKeyboard, Messenger, UserProfile};
use relay_providers::{CompletionError, CompletionService, Turn};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use tokio::sync::Semaphore;

pub const BOT_ID: i64 = 999;
pub const BOT_USERNAME: &str = "RelayBot";

#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Text {
        chat_id: i64,
        message_id: i64,
        text: String,
        reply_to: Option<i64>,
        keyboard: Option<InlineKeyboard>,
    },
    Edit {
        chat_id: i64,
        message_id: i64,
        text: String,
    },
    Document {
        chat_id: i64,
        file_name: String,
        len: usize,
    },
    CallbackAnswer {
        query_id: String,
        text: Option<String>,
    },
    ChatAction {
        chat_id: i64,
        action: String,
    },
}

pub struct RecordingMessenger {
    next_id: AtomicI64,
    sent: Mutex<Vec<Sent>>,
    deleted: Mutex<Vec<(i64, i64)>>,
    fail_deletes: AtomicBool,
    administrators: Mutex<Vec<UserProfile>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl RecordingMessenger {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(100),
            sent: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            fail_deletes: AtomicBool::new(false),
            administrators: Mutex::new(Vec::new()),
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn fail_deletes(&self) {
        self.fail_deletes.store(true, Ordering::SeqCst);
    }

    pub fn set_administrators(&self, admins: Vec<UserProfile>) {
        *self.administrators.lock().expect("lock") = admins;
    }

    pub fn add_file(&self, file_id: &str, bytes: Vec<u8>) {
        self.files
            .lock()
            .expect("lock")
            .insert(file_id.to_string(), bytes);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().expect("lock").clone()
    }

    pub fn deleted(&self) -> Vec<(i64, i64)> {
        self.deleted.lock().expect("lock").clone()
    }

    /// Texts of plain sends, in order.
    pub fn texts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|sent| match sent {
                Sent::Text { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    fn record(&self, sent: Sent) {
        self.sent.lock().expect("lock").push(sent);
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn get_me(&self) -> Result<BotIdentity> {
        Ok(BotIdentity {
            id: BOT_ID,
            username: BOT_USERNAME.to_string(),
        })
    }

    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        reply_to: Option<i64>,
        keyboard: Option<InlineKeyboard>,
    ) -> Result<i64> {
        let message_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.record(Sent::Text {
            chat_id,
            message_id,
            text: text.to_string(),
            reply_to,
            keyboard,
        });
        Ok(message_id)
    }

    async fn edit_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        _keyboard: Option<InlineKeyboard>,
    ) -> Result<()> {
        self.record(Sent::Edit {
            chat_id,
            message_id,
            text: text.to_string(),
        });
        Ok(())
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(anyhow!("message can't be deleted"));
        }
        self.deleted
            .lock()
            .expect("lock")
            .push((chat_id, message_id));
        Ok(())
    }

    async fn answer_callback(&self, query_id: &str, text: Option<&str>) -> Result<()> {
        self.record(Sent::CallbackAnswer {
            query_id: query_id.to_string(),
            text: text.map(str::to_string),
        });
        Ok(())
    }

    async fn send_chat_action(&self, chat_id: i64, action: &str) -> Result<()> {
        self.record(Sent::ChatAction {
            chat_id,
            action: action.to_string(),
        });
        Ok(())
    }

    async fn chat_member_count(&self, _chat_id: i64) -> Result<u32> {
        Ok(42)
    }

    async fn chat_administrators(&self, _chat_id: i64) -> Result<Vec<UserProfile>> {
        Ok(self.administrators.lock().expect("lock").clone())
    }

    async fn send_document(&self, chat_id: i64, file_name: &str, bytes: Vec<u8>) -> Result<i64> {
        self.record(Sent::Document {
            chat_id,
            file_name: file_name.to_string(),
            len: bytes.len(),
        });
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>> {
        self.files
            .lock()
            .expect("lock")
            .get(file_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown file {}", file_id))
    }
}

/// Replays queued outcomes and records every request it receives.
pub struct ScriptedCompletion {
    outcomes: Mutex<VecDeque<Result<String, CompletionError>>>,
    requests: Mutex<Vec<(String, String, Vec<Turn>)>>,
}

impl ScriptedCompletion {
    pub fn new(outcomes: Vec<Result<String, CompletionError>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<(String, String, Vec<Turn>)> {
        self.requests.lock().expect("lock").clone()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        prompt: &str,
        model: &str,
        prior: &[Turn],
    ) -> Result<String, CompletionError> {
        self.requests.lock().expect("lock").push((
            prompt.to_string(),
            model.to_string(),
            prior.to_vec(),
        ));
        self.outcomes
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(|| Ok(format!("echo: {}", prompt)))
    }
}

/// Holds every prompt starting with `prefix` until `release` is called.
/// Other prompts are echoed at once.
pub struct GatedCompletion {
    prefix: String,
    gate: Semaphore,
}

impl GatedCompletion {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            gate: Semaphore::new(0),
        }
    }

    pub fn release(&self) {
        self.gate.add_permits(1024);
    }
}

#[async_trait]
impl CompletionService for GatedCompletion {
    fn name(&self) -> &str {
        "gated"
    }

    async fn complete(
        &self,
        prompt: &str,
        _model: &str,
        _prior: &[Turn],
    ) -> Result<String, CompletionError> {
        if prompt.starts_with(&self.prefix) {
            let _ = self.gate.acquire().await;
        }
        Ok(format!("echo: {}", prompt))
    }
}
