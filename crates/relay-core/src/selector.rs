//! "Who in this chat..." answers: picks one or two members at random and
//! phrases the question about them.

use crate::error::RelayError;
use rand::Rng;
use relay_ipc::{ChatKind, UserProfile};
use std::collections::HashMap;

pub const INTROS: [&str; 4] = ["Звёзды говорят", "Я уверен", "Без сомнений", "Все знают"];

/// First/second-person pronouns that turn a pair question into an action.
const PRONOUNS: [&str; 4] = ["я", "ты", "мы", "вы"];

/// Alias when one is set, display name otherwise.
pub fn mention_for(member: &UserProfile, aliases: &HashMap<i64, String>) -> String {
    aliases
        .get(&member.id)
        .cloned()
        .unwrap_or_else(|| member.display_name())
}

/// Remainder of `question` after a leading pronoun, when it has one.
pub fn pronoun_action(question: &str) -> Option<&str> {
    let question = question.trim_start();
    let split = question.find(char::is_whitespace)?;
    let (first, rest) = question.split_at(split);
    let rest = rest.trim();
    if rest.is_empty() || !PRONOUNS.contains(&first.to_lowercase().as_str()) {
        return None;
    }
    Some(rest)
}

fn check_request(chat_kind: ChatKind, question: &str) -> Result<&str, RelayError> {
    if !chat_kind.is_group_kind() {
        return Err(RelayError::WrongChatKind);
    }
    match question.trim() {
        "" => Err(RelayError::EmptyInput),
        question => Ok(question),
    }
}

fn eligible(members: &[UserProfile]) -> Vec<&UserProfile> {
    members.iter().filter(|member| !member.is_bot).collect()
}

fn intro<R: Rng + ?Sized>(rng: &mut R) -> &'static str {
    INTROS[rng.gen_range(0..INTROS.len())]
}

/// `"<intro>, что <mention> <question>"` about one uniformly drawn member.
pub fn select_single<R: Rng + ?Sized>(
    rng: &mut R,
    chat_kind: ChatKind,
    question: &str,
    members: &[UserProfile],
    aliases: &HashMap<i64, String>,
) -> Result<String, RelayError> {
    let question = check_request(chat_kind, question)?;
    let pool = eligible(members);
    if pool.is_empty() {
        return Err(RelayError::NoEligibleMembers);
    }

    let member = pool[rng.gen_range(0..pool.len())];
    Ok(format!(
        "{}, что {} {}",
        intro(rng),
        mention_for(member, aliases),
        question
    ))
}

/// Draws two distinct members. A question led by a pronoun reads as an action
/// from the first to the second (`"<m1> <action> <m2>"`), anything else is
/// asked about the second only (`"<m2> <question>"`). No intro phrase.
pub fn select_pair<R: Rng + ?Sized>(
    rng: &mut R,
    chat_kind: ChatKind,
    question: &str,
    members: &[UserProfile],
    aliases: &HashMap<i64, String>,
) -> Result<String, RelayError> {
    let question = check_request(chat_kind, question)?;
    let mut pool = eligible(members);
    if pool.is_empty() {
        return Err(RelayError::NoEligibleMembers);
    }
    if pool.len() < 2 {
        return Err(RelayError::InsufficientMembers);
    }

    let first = pool.swap_remove(rng.gen_range(0..pool.len()));
    let second = pool[rng.gen_range(0..pool.len())];

    let clause = match pronoun_action(question) {
        Some(action) => format!(
            "{} {} {}",
            mention_for(first, aliases),
            action,
            mention_for(second, aliases)
        ),
        None => format!("{} {}", mention_for(second, aliases), question),
    };
    Ok(clause)
}
