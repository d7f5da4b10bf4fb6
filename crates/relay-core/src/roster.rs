use crate::keyed::KeyedState;
use relay_ipc::{ChatKind, UserProfile};
use std::collections::HashMap;

/// Members seen speaking in each group chat, latest profile per user.
/// Entries are never purged while the process runs.
#[derive(Default)]
pub struct MembershipRoster {
    chats: KeyedState<i64, HashMap<i64, UserProfile>>,
}

impl MembershipRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `sender` if it is a human in a group-kind chat. Returns whether it was recorded.
    pub async fn observe(&self, chat_id: i64, chat_kind: ChatKind, sender: &UserProfile) -> bool {
        if !chat_kind.is_group_kind() || sender.is_bot {
            return false;
        }
        let slot = self.chats.slot(&chat_id).await;
        slot.lock().await.insert(sender.id, sender.clone());
        true
    }

    /// Known members ordered by user id.
    pub async fn members(&self, chat_id: i64) -> Vec<UserProfile> {
        let Some(slot) = self.chats.existing(&chat_id).await else {
            return Vec::new();
        };
        let mut members: Vec<UserProfile> = slot.lock().await.values().cloned().collect();
        members.sort_by_key(|member| member.id);
        members
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: i64, first: &str, is_bot: bool) -> UserProfile {
        UserProfile {
            id,
            username: None,
            first_name: first.to_string(),
            last_name: None,
            is_bot,
        }
    }

    #[tokio::test]
    async fn keeps_latest_snapshot_per_user() {
        let roster = MembershipRoster::new();
        roster.observe(-1, ChatKind::Group, &profile(5, "Old", false)).await;
        roster.observe(-1, ChatKind::Group, &profile(5, "New", false)).await;
        let members = roster.members(-1).await;
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].first_name, "New");
    }

    #[tokio::test]
    async fn ignores_bots_and_private_chats() {
        let roster = MembershipRoster::new();
        assert!(!roster.observe(-1, ChatKind::Group, &profile(9, "Bot", true)).await);
        assert!(!roster.observe(3, ChatKind::Private, &profile(3, "Solo", false)).await);
        assert!(roster.members(-1).await.is_empty());
        assert!(roster.members(3).await.is_empty());
    }

    #[tokio::test]
    async fn chats_are_separate() {
        let roster = MembershipRoster::new();
        roster.observe(-1, ChatKind::Supergroup, &profile(2, "B", false)).await;
        roster.observe(-1, ChatKind::Supergroup, &profile(1, "A", false)).await;
        roster.observe(-2, ChatKind::Group, &profile(3, "C", false)).await;
        let ids: Vec<i64> = roster.members(-1).await.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(roster.members(-2).await.len(), 1);
    }
}
