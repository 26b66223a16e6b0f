//! Telegram update handlers.
//!
//! A single message handler covers everything the warden reacts to:
//! membership service messages, tagged reports, and `/` commands. Everything
//! else only refreshes `last_seen` in the ledger.

use std::sync::Arc;

use chrono::Utc;

use teloxide::{prelude::*, types::Message};

use warden_core::{
    audit::AuditEvent,
    config::Config,
    domain::{ChatId, UserId},
    engine::{MemberSnapshot, MemberState},
    formatting::{escape_html, format_duration, mention},
    signals::SignalKind,
};

use crate::router::AppState;

mod commands;

fn welcome_text(user_id: i64, display: &str, cfg: &Config) -> String {
    format!(
        "\u{1f44b} Welcome, {}!\n\
Every member posts a {} once per <b>{}</b>; your timer starts now.\n\
Going away? Post {} to pause it and {} when you return.",
        mention(user_id, display),
        escape_html(&cfg.proof_tag),
        format_duration(cfg.window.num_seconds()),
        escape_html(&cfg.leave_tag),
        escape_html(&cfg.return_tag),
    )
}

async fn member_snapshot(state: &AppState, chat: ChatId, member: UserId) -> Option<MemberSnapshot> {
    state
        .engine
        .snapshot(chat)
        .await
        .into_iter()
        .find(|s| s.user == member)
}

pub async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let chat = ChatId(msg.chat.id.0);

    // Service message: new members joined.
    if let Some(users) = msg.new_chat_members() {
        let now = Utc::now();
        for user in users {
            if user.is_bot {
                continue;
            }
            let member = UserId(user.id.0 as i64);
            state.engine.on_member_joined(member, chat, now).await;
            let _ = state
                .notifier
                .send_html(chat, &welcome_text(member.0, &user.full_name(), &state.cfg))
                .await;
        }
        return Ok(());
    }

    // Service message: a member left on their own. The timer dies with the
    // membership; the ledger row stays.
    if let Some(user) = msg.left_chat_member() {
        if !user.is_bot {
            state.engine.cancel(UserId(user.id.0 as i64), chat).await;
        }
        return Ok(());
    }

    let Some(user) = msg.from() else {
        return Ok(());
    };
    if user.is_bot {
        return Ok(());
    }
    let member = UserId(user.id.0 as i64);

    if let Some(text) = msg.text() {
        if text.starts_with('/') {
            return commands::handle_command(bot, msg, state).await;
        }
    }

    let Some(text) = msg.text().or_else(|| msg.caption()) else {
        return Ok(());
    };

    let kind = state.cfg.tags().classify(text);
    let now = Utc::now();

    if kind != SignalKind::Other {
        let username = user
            .username
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        if let Err(e) = state.audit.write(AuditEvent::signal(
            member.0,
            chat.0,
            &username,
            kind.label(),
            text,
        )) {
            eprintln!("[AUDIT] Failed to write signal audit event: {e}");
        }
    }

    state.engine.on_signal(member, chat, kind, now).await;

    // Best-effort confirmations for the tagged signals. Exempt members get
    // no snapshot entry and therefore no reply.
    match kind {
        SignalKind::Proof => {
            if let Some(snap) = member_snapshot(&state, chat, member).await {
                if let Some(deadline) = snap.deadline {
                    let body = format!(
                        "\u{2705} {}, your {} is in. The next one is due within <b>{}</b>.",
                        mention(member.0, &user.full_name()),
                        escape_html(&state.cfg.proof_tag),
                        format_duration((deadline - now).num_seconds())
                    );
                    let _ = state.notifier.send_html(chat, &body).await;
                }
            }
        }
        SignalKind::LeaveStart => {
            if let Some(snap) = member_snapshot(&state, chat, member).await {
                if let MemberState::OnLeave { since } = snap.state {
                    let frozen =
                        ((snap.window_start + state.engine.policy().window) - since).num_seconds();
                    let body = format!(
                        "\u{1f54a} Leave noted. Your timer is paused with <b>{}</b> remaining; post {} when you are back.",
                        format_duration(frozen),
                        escape_html(&state.cfg.return_tag)
                    );
                    let _ = state.notifier.send_html(chat, &body).await;
                }
            }
        }
        SignalKind::LeaveEnd => {
            if let Some(snap) = member_snapshot(&state, chat, member).await {
                if let Some(deadline) = snap.deadline {
                    let body = format!(
                        "\u{25b6} Welcome back, {}. <b>{}</b> left until your next {} is due.",
                        mention(member.0, &user.full_name()),
                        format_duration((deadline - now).num_seconds()),
                        escape_html(&state.cfg.proof_tag)
                    );
                    let _ = state.notifier.send_html(chat, &body).await;
                }
            }
        }
        SignalKind::Other => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cfg() -> Config {
        Config {
            telegram_bot_token: "t".into(),
            owner_id: 1,
            database_path: "/tmp/warden-test.db".into(),
            window: chrono::Duration::days(7),
            warning_offset: chrono::Duration::days(6),
            proof_tag: "#report".into(),
            leave_tag: "#away".into(),
            return_tag: "#back".into(),
            audit_log_path: "/tmp/warden-audit.log".into(),
            audit_log_json: false,
        }
    }

    #[test]
    fn welcome_names_the_tags_and_the_window() {
        let text = welcome_text(9, "Carol", &test_cfg());
        assert!(text.contains("tg://user?id=9"));
        assert!(text.contains("#report"));
        assert!(text.contains("#away"));
        assert!(text.contains("#back"));
        assert!(text.contains("7d 0h"));
    }
}
