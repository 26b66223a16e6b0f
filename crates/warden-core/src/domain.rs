/// Telegram user id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UserId(pub i64);

/// Telegram chat id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChatId(pub i64);

/// Identity of a tracked member: one compliance record per user per chat.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemberKey {
    pub user: UserId,
    pub chat: ChatId,
}

impl MemberKey {
    pub fn new(user: UserId, chat: ChatId) -> Self {
        Self { user, chat }
    }
}
