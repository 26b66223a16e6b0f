use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    domain::{ChatId, UserId},
    signals::SignalKind,
    Result,
};

/// Durable anchor times for one member's compliance window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerAnchor {
    /// When the current window began.
    pub window_start: DateTime<Utc>,
    /// Set while the member is on declared leave.
    pub leave_start: Option<DateTime<Utc>>,
}

/// Durable activity log, one record per member per chat.
///
/// SQLite is the first implementation; the engine only sees this trait, so
/// tests drive it with in-memory fakes.
#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Stored anchors for a member, or `None` when no record exists
    /// (or the member is flagged removed).
    async fn get_timer_anchor(&self, member: UserId, chat: ChatId)
        -> Result<Option<TimerAnchor>>;

    /// Record an observed signal and apply its anchor effects: proof
    /// re-anchors the window at `at` and clears any leave, leave-start stamps
    /// `leave_start = at`, leave-end clears it. Every kind updates the
    /// last-seen time and clears the removed flag.
    async fn record_signal(
        &self,
        member: UserId,
        chat: ChatId,
        at: DateTime<Utc>,
        kind: SignalKind,
    ) -> Result<()>;

    /// True iff a proof was recorded strictly after `since`.
    async fn has_proof_since(&self, member: UserId, chat: ChatId, since: DateTime<Utc>)
        -> Result<bool>;

    /// Re-anchor the window (membership events, post-leave rollover, bulk
    /// re-arm). Creates the record if missing, clears any recorded leave,
    /// and clears the removed flag.
    async fn set_window_start(&self, member: UserId, chat: ChatId, at: DateTime<Utc>)
        -> Result<()>;

    /// Flag the member as removed from the chat. The record itself stays.
    async fn mark_removed(&self, member: UserId, chat: ChatId) -> Result<()>;

    /// Exempt members have their signals recorded but are never scheduled.
    async fn is_exempt(&self, member: UserId, chat: ChatId) -> Result<bool>;
}

/// Outbound moderation capabilities.
///
/// Telegram is the first implementation; the shape stays chat-platform
/// neutral so the engine never links against a bot framework.
#[async_trait]
pub trait NotificationPort: Send + Sync {
    /// Warn the member that the removal deadline is approaching. `deadline`
    /// is when removal will fire, so late deliveries can still render the
    /// real time remaining.
    async fn send_warning(&self, chat: ChatId, member: UserId, deadline: DateTime<Utc>)
        -> Result<()>;

    /// Remove the member from the chat. Implementations ban and immediately
    /// unban, so the member can rejoin later.
    async fn remove_member(&self, chat: ChatId, member: UserId) -> Result<()>;
}
