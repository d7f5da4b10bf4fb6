use crate::error::RelayError;
use crate::keyed::KeyedState;
use std::collections::HashMap;

#[derive(Default)]
pub struct NicknameRegistry {
    chats: KeyedState<i64, HashMap<i64, String>>,
}

impl NicknameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites any previous alias. An empty alias is refused rather than clearing.
    pub async fn set(&self, chat_id: i64, user_id: i64, alias: &str) -> Result<String, RelayError> {
        let alias = alias.trim();
        if alias.is_empty() {
            return Err(RelayError::EmptyInput);
        }
        let slot = self.chats.slot(&chat_id).await;
        slot.lock().await.insert(user_id, alias.to_string());
        Ok(alias.to_string())
    }

    pub async fn get(&self, chat_id: i64, user_id: i64) -> Option<String> {
        let slot = self.chats.existing(&chat_id).await?;
        let aliases = slot.lock().await;
        aliases.get(&user_id).cloned()
    }

    pub async fn snapshot(&self, chat_id: i64) -> HashMap<i64, String> {
        match self.chats.existing(&chat_id).await {
            Some(slot) => slot.lock().await.clone(),
            None => HashMap::new(),
        }
    }
}
