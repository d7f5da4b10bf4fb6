use relay_providers::CompletionError;

/// Shown when a handler fails for a reason with no dedicated message.
pub const GENERIC_FAILURE_MESSAGE: &str = "😔 Что-то пошло не так. Попробуйте ещё раз чуть позже.";

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("input is empty")]
    EmptyInput,
    #[error("unknown model: {0}")]
    UnknownModel(String),
    #[error(transparent)]
    Completion(#[from] CompletionError),
    #[error("no eligible members in chat")]
    NoEligibleMembers,
    #[error("fewer than two eligible members in chat")]
    InsufficientMembers,
    #[error("command is only available in group chats")]
    WrongChatKind,
    #[error("failed to delete placeholder {message_id} in chat {chat_id}: {detail}")]
    PlaceholderDeleteFailed {
        chat_id: i64,
        message_id: i64,
        detail: String,
    },
    #[error("upload received before the speed test started")]
    SpeedtestNotStarted,
}

impl RelayError {
    pub fn user_message(&self) -> &'static str {
        match self {
            RelayError::EmptyInput => "✏️ Напишите вопрос: после команды или после упоминания.",
            RelayError::UnknownModel(_) => "❓ Такой модели нет. Список моделей: /model",
            RelayError::Completion(err) => err.user_message(),
            RelayError::NoEligibleMembers => {
                "🤷 Я пока никого здесь не знаю. Пусть участники напишут что-нибудь в чат."
            }
            RelayError::InsufficientMembers => {
                "👥 Нужны хотя бы два знакомых мне участника. Пусть кто-нибудь ещё напишет в чат."
            }
            RelayError::WrongChatKind => "👥 Эта команда работает только в группах.",
            RelayError::PlaceholderDeleteFailed { .. } => GENERIC_FAILURE_MESSAGE,
            RelayError::SpeedtestNotStarted => {
                "📏 Сначала запустите тест: /speedtest"
            }
        }
    }
}
