use crate::error::RelayError;
use anyhow::Result;
use relay_ipc::Messenger;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct PlaceholderManager {
    messenger: Arc<dyn Messenger>,
    text: String,
}

impl PlaceholderManager {
    pub fn new(messenger: Arc<dyn Messenger>, text: &str) -> Self {
        Self {
            messenger,
            text: text.to_string(),
        }
    }

    /// Posts the "thinking" status message.
    pub async fn begin(&self, chat_id: i64, reply_to: Option<i64>) -> Result<PlaceholderHandle> {
        let message_id = self
            .messenger
            .send_text(chat_id, &self.text, reply_to, None)
            .await?;
        debug!(chat_id, message_id, "Placeholder posted");
        Ok(PlaceholderHandle {
            messenger: Arc::clone(&self.messenger),
            chat_id,
            message_id,
            resolved: false,
        })
    }
}

/// One posted placeholder. `resolve` consumes it; a handle dropped unresolved
/// still schedules the delete.
pub struct PlaceholderHandle {
    messenger: Arc<dyn Messenger>,
    chat_id: i64,
    message_id: i64,
    resolved: bool,
}

impl PlaceholderHandle {
    pub fn message_id(&self) -> i64 {
        self.message_id
    }

    /// Deletes the placeholder. Failures are logged and swallowed.
    pub async fn resolve(mut self) {
        self.resolved = true;
        delete_placeholder(self.messenger.as_ref(), self.chat_id, self.message_id).await;
    }
}

impl Drop for PlaceholderHandle {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                chat_id = self.chat_id,
                message_id = self.message_id,
                "Placeholder dropped outside a runtime, leaving it in place"
            );
            return;
        };
        let messenger = Arc::clone(&self.messenger);
        let (chat_id, message_id) = (self.chat_id, self.message_id);
        runtime.spawn(async move {
            delete_placeholder(messenger.as_ref(), chat_id, message_id).await;
        });
    }
}

async fn delete_placeholder(messenger: &dyn Messenger, chat_id: i64, message_id: i64) {
    if let Err(err) = messenger.delete_message(chat_id, message_id).await {
        let err = RelayError::PlaceholderDeleteFailed {
            chat_id,
            message_id,
            detail: err.to_string(),
        };
        warn!("{}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingMessenger, Sent};
    use std::time::Duration;

    #[tokio::test]
    async fn resolve_deletes_posted_message() {
        let messenger = Arc::new(RecordingMessenger::new());
        let manager = PlaceholderManager::new(messenger.clone(), "thinking");
        let handle = manager.begin(5, Some(1)).await.expect("posted");
        let id = handle.message_id();
        handle.resolve().await;

        assert_eq!(messenger.deleted(), vec![(5, id)]);
        assert!(matches!(
            messenger.sent().first(),
            Some(Sent::Text { text, reply_to: Some(1), .. }) if text == "thinking"
        ));
    }

    #[tokio::test]
    async fn delete_failure_is_swallowed() {
        let messenger = Arc::new(RecordingMessenger::new());
        messenger.fail_deletes();
        let manager = PlaceholderManager::new(messenger.clone(), "thinking");
        manager.begin(5, None).await.expect("posted").resolve().await;
        assert!(messenger.deleted().is_empty());
    }

    #[tokio::test]
    async fn dropped_handle_still_deletes() {
        let messenger = Arc::new(RecordingMessenger::new());
        let manager = PlaceholderManager::new(messenger.clone(), "thinking");
        drop(manager.begin(5, None).await.expect("posted"));

        for _ in 0..20 {
            if !messenger.deleted().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(messenger.deleted().len(), 1);
    }
}
