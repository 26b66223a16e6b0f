//! Telegram adapter (teloxide).
//!
//! This crate implements the `warden-core` NotificationPort over the Telegram
//! Bot API and hosts the long-polling update loop.

use std::sync::Arc;

use async_trait::async_trait;

use chrono::{DateTime, Utc};

use teloxide::{prelude::*, types::ParseMode};

use tokio::time::sleep;

pub mod handlers;
pub mod router;

use warden_core::{
    audit::{AuditEvent, AuditLogger},
    config::Config,
    domain::{ChatId, UserId},
    errors::Error,
    formatting::{escape_html, format_duration, mention},
    ports::NotificationPort,
    Result,
};

#[derive(Clone)]
pub struct TelegramNotifier {
    bot: Bot,
    cfg: Arc<Config>,
    audit: Arc<AuditLogger>,
}

impl TelegramNotifier {
    pub fn new(bot: Bot, cfg: Arc<Config>, audit: Arc<AuditLogger>) -> Self {
        Self { bot, cfg, audit }
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }

    fn tg_user(user_id: UserId) -> teloxide::types::UserId {
        teloxide::types::UserId(user_id.0 as u64)
    }

    fn map_err(e: teloxide::RequestError) -> Error {
        Error::Transport(format!("telegram error: {e}"))
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, teloxide::RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => match e {
                    teloxide::RequestError::RetryAfter(d) if attempts < MAX_RETRIES => {
                        attempts += 1;
                        sleep(d).await;
                        continue;
                    }
                    other => return Err(Self::map_err(other)),
                },
            }
        }
    }

    pub async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<()> {
        self.with_retry(|| {
            self.bot
                .send_message(Self::tg_chat(chat_id), html.to_string())
                .parse_mode(ParseMode::Html)
        })
        .await?;
        Ok(())
    }

    /// Resolve a display name for the mention. Timers fire long after the
    /// triggering message, so the name is looked up at send time.
    async fn display_name(&self, chat: ChatId, member: UserId) -> String {
        match self
            .with_retry(|| {
                self.bot
                    .get_chat_member(Self::tg_chat(chat), Self::tg_user(member))
            })
            .await
        {
            Ok(m) => m.user.full_name(),
            Err(_) => format!("user {}", member.0),
        }
    }
}

fn warning_text(user_id: i64, display: &str, proof_tag: &str, seconds_left: i64) -> String {
    format!(
        "\u{26a0}\u{fe0f} {}, there is no {} from you this period.\n\
Post one within <b>{}</b> or you will be removed from the group.",
        mention(user_id, display),
        escape_html(proof_tag),
        format_duration(seconds_left)
    )
}

fn removal_text(user_id: i64, display: &str, proof_tag: &str) -> String {
    format!(
        "\u{1f44b} {} was removed: no {} this period. They are welcome to rejoin.",
        mention(user_id, display),
        escape_html(proof_tag)
    )
}

#[async_trait]
impl NotificationPort for TelegramNotifier {
    async fn send_warning(
        &self,
        chat: ChatId,
        member: UserId,
        deadline: DateTime<Utc>,
    ) -> Result<()> {
        let display = self.display_name(chat, member).await;
        let left = (deadline - Utc::now()).num_seconds();
        self.send_html(
            chat,
            &warning_text(member.0, &display, &self.cfg.proof_tag, left),
        )
        .await?;

        if let Err(e) = self
            .audit
            .write(AuditEvent::warning(member.0, chat.0, &deadline.to_rfc3339()))
        {
            eprintln!("[AUDIT] Failed to write warning audit event: {e}");
        }
        Ok(())
    }

    async fn remove_member(&self, chat: ChatId, member: UserId) -> Result<()> {
        // Look the name up first; after the ban the member record may be gone.
        let display = self.display_name(chat, member).await;

        self.with_retry(|| {
            self.bot
                .ban_chat_member(Self::tg_chat(chat), Self::tg_user(member))
        })
        .await?;

        // Lift the ban right away so the member can rejoin whenever they like.
        self.with_retry(|| {
            self.bot
                .unban_chat_member(Self::tg_chat(chat), Self::tg_user(member))
        })
        .await?;

        let announce = removal_text(member.0, &display, &self.cfg.proof_tag);
        if let Err(e) = self.send_html(chat, &announce).await {
            eprintln!("[BOT] Removal announcement failed: {e}");
        }

        if let Err(e) = self.audit.write(AuditEvent::removal(member.0, chat.0)) {
            eprintln!("[AUDIT] Failed to write removal audit event: {e}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warning_mentions_user_and_shows_time_left() {
        let text = warning_text(42, "Alice", "#report", 86_400);
        assert!(text.contains("tg://user?id=42"));
        assert!(text.contains("#report"));
        assert!(text.contains("<b>1d 0h</b>"));
    }

    #[test]
    fn removal_escapes_display_name() {
        let text = removal_text(7, "Bob <3", "#report");
        assert!(text.contains("Bob &lt;3"));
        assert!(!text.contains("Bob <3"));
    }
}
