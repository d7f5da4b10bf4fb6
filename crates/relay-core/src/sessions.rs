use crate::catalog::ModelCatalog;
use crate::error::RelayError;
use crate::keyed::KeyedState;
use relay_providers::Turn;
use std::collections::VecDeque;
use std::sync::Arc;

pub const MAX_HISTORY_TURNS: usize = 10;

#[derive(Debug, Default)]
struct Session {
    selected_model: Option<String>,
    history: VecDeque<Turn>,
}

/// Per-user model choice and bounded conversation history.
/// Keyed by user id alone: a user has one history across all chats.
pub struct SessionStore {
    catalog: Arc<ModelCatalog>,
    sessions: KeyedState<i64, Session>,
}

impl SessionStore {
    pub fn new(catalog: Arc<ModelCatalog>) -> Self {
        Self {
            catalog,
            sessions: KeyedState::new(),
        }
    }

    pub async fn get_model(&self, user_id: i64) -> String {
        if let Some(slot) = self.sessions.existing(&user_id).await {
            if let Some(model) = slot.lock().await.selected_model.clone() {
                return model;
            }
        }
        self.catalog.default_id().to_string()
    }

    pub async fn set_model(&self, user_id: i64, model_id: &str) -> Result<(), RelayError> {
        let model_id = model_id.trim();
        if !self.catalog.contains(model_id) {
            return Err(RelayError::UnknownModel(model_id.to_string()));
        }
        let slot = self.sessions.slot(&user_id).await;
        slot.lock().await.selected_model = Some(model_id.to_string());
        Ok(())
    }

    pub async fn append_turn(&self, user_id: i64, question: String, answer: String) {
        let slot = self.sessions.slot(&user_id).await;
        let mut session = slot.lock().await;
        session.history.push_back(Turn { question, answer });
        while session.history.len() > MAX_HISTORY_TURNS {
            session.history.pop_front();
        }
    }

    /// Oldest turn first.
    pub async fn history(&self, user_id: i64) -> Vec<Turn> {
        match self.sessions.existing(&user_id).await {
            Some(slot) => slot.lock().await.history.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Resets the user's slot in place, so a writer that already holds the
    /// slot still lands in the live session.
    pub async fn clear(&self, user_id: i64) {
        if let Some(slot) = self.sessions.existing(&user_id).await {
            *slot.lock().await = Session::default();
        }
    }
}
