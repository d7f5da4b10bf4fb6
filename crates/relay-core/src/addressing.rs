use relay_ipc::ChatKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addressing {
    /// Group chatter not meant for the bot. Ignored without a reply.
    NotAddressed,
    Addressed(String),
    /// Addressed, but nothing left once the mention is stripped.
    Empty,
}

/// Decides whether `raw_text` is meant for the bot whose mention token is `mention`.
///
/// Direct chats are always addressed. In group-kind chats a reply to one of the
/// bot's own messages counts as addressed; otherwise the text has to start with
/// the mention token, compared case-sensitively and followed by a word boundary
/// so a longer handle sharing the prefix does not match.
pub fn resolve(
    chat_kind: ChatKind,
    raw_text: &str,
    replied_to_assistant: bool,
    mention: &str,
) -> Addressing {
    let starts_with_mention = !mention.is_empty()
        && raw_text.strip_prefix(mention).is_some_and(|rest| {
            !rest
                .chars()
                .next()
                .is_some_and(|c| c.is_alphanumeric() || c == '_')
        });

    if chat_kind.is_group_kind() && !replied_to_assistant && !starts_with_mention {
        return Addressing::NotAddressed;
    }

    let body = if starts_with_mention {
        &raw_text[mention.len()..]
    } else {
        raw_text
    };

    match body.trim() {
        "" => Addressing::Empty,
        text => Addressing::Addressed(text.to_string()),
    }
}
