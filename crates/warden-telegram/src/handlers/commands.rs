use std::sync::Arc;

use chrono::{DateTime, Utc};

use teloxide::{prelude::*, types::Message};

use warden_core::{
    audit::AuditEvent,
    domain::{ChatId, UserId},
    engine::{MemberSnapshot, MemberState},
    formatting::{escape_html, format_duration},
};

use crate::router::AppState;

fn parse_command(text: &str) -> (String, String) {
    // Telegram may send `/cmd@botname arg1 ...`
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    (cmd, rest)
}

fn parse_target_arg(arg: &str) -> Option<UserId> {
    arg.split_whitespace()
        .next()?
        .parse::<i64>()
        .ok()
        .map(UserId)
}

/// `/exempt`-style commands take the target either as a numeric argument or
/// by replying to one of the member's messages.
fn target_from(msg: &Message, arg: &str) -> Option<UserId> {
    if let Some(user) = msg.reply_to_message().and_then(|m| m.from()) {
        return Some(UserId(user.id.0 as i64));
    }
    parse_target_arg(arg)
}

async fn is_admin(bot: &Bot, chat: ChatId, user_id: i64, state: &AppState) -> bool {
    if user_id == state.cfg.owner_id {
        return true;
    }
    match bot
        .get_chat_administrators(teloxide::types::ChatId(chat.0))
        .await
    {
        Ok(admins) => admins.iter().any(|m| m.user.id.0 as i64 == user_id),
        Err(_) => false,
    }
}

fn status_line(snap: &MemberSnapshot, now: DateTime<Utc>) -> String {
    match snap.state {
        MemberState::Active | MemberState::Warned => {
            let left = snap
                .deadline
                .map(|d| format_duration((d - now).num_seconds()))
                .unwrap_or_else(|| "?".to_string());
            let flag = if snap.state == MemberState::Warned {
                "\u{26a0}\u{fe0f}"
            } else {
                "\u{23f3}"
            };
            format!("{flag} <code>{}</code> - {left} left", snap.user.0)
        }
        MemberState::OnLeave { since } => format!(
            "\u{1f54a} <code>{}</code> - on leave since {}",
            snap.user.0,
            since.format("%Y-%m-%d")
        ),
        MemberState::Removed => format!("\u{274c} <code>{}</code> - removed", snap.user.0),
    }
}

pub async fn handle_command(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let Some(text) = msg.text() else {
        return Ok(());
    };

    let user_id = user.id.0 as i64;
    let username = user
        .username
        .clone()
        .unwrap_or_else(|| "unknown".to_string());
    let chat = ChatId(msg.chat.id.0);

    let (cmd, arg) = parse_command(text);

    // Commands belong to the owner and chat admins; members talk in tags.
    if !is_admin(&bot, chat, user_id, &state).await {
        return Ok(());
    }

    if let Err(e) = state
        .audit
        .write(AuditEvent::admin(user_id, chat.0, &username, &cmd))
    {
        eprintln!("[AUDIT] Failed to write admin audit event: {e}");
    }

    match cmd.as_str() {
        "start" | "help" => {
            let window = format_duration(state.cfg.window.num_seconds());
            let lead =
                format_duration((state.cfg.window - state.cfg.warning_offset).num_seconds());
            let body = format!(
                "\u{1f6e1} <b>Group Activity Warden</b>\n\n\
Every member posts a {proof} once per <b>{window}</b>.\n\
A reminder goes out <b>{lead}</b> before removal. {leave} pauses the timer, \
{ret} resumes it.\n\n\
\u{1f4cb} <b>Commands (admin):</b>\n\
/status - tracked members and time remaining\n\
/start_timer - arm timers for every known member\n\
/exempt [user_id] - stop tracking a member (or reply to them)\n\
/unexempt [user_id] - track a member again\n\
/help - this message",
                proof = escape_html(&state.cfg.proof_tag),
                leave = escape_html(&state.cfg.leave_tag),
                ret = escape_html(&state.cfg.return_tag),
            );
            let _ = state.notifier.send_html(chat, &body).await;
            Ok(())
        }

        "status" => {
            let now = Utc::now();
            let snaps = state.engine.snapshot(chat).await;
            if snaps.is_empty() {
                let _ = state
                    .notifier
                    .send_html(
                        chat,
                        "No tracked members in this chat yet. \
Use /start_timer to arm timers from the ledger.",
                    )
                    .await;
                return Ok(());
            }
            let mut lines: Vec<String> = vec!["\u{1f4ca} <b>Report timers</b>\n".to_string()];
            for snap in &snaps {
                lines.push(status_line(snap, now));
            }
            let _ = state.notifier.send_html(chat, &lines.join("\n")).await;
            Ok(())
        }

        "start_timer" => {
            match state.store.roster(chat).await {
                Ok(members) => {
                    let armed = state.engine.reschedule_all(chat, &members, Utc::now()).await;
                    let _ = state
                        .notifier
                        .send_html(
                            chat,
                            &format!(
                                "\u{23f1} Armed report timers for {} member{}.",
                                armed,
                                if armed == 1 { "" } else { "s" }
                            ),
                        )
                        .await;
                }
                Err(e) => {
                    let _ = state
                        .notifier
                        .send_html(chat, &format!("\u{274c} {}", escape_html(&format!("{e}"))))
                        .await;
                }
            }
            Ok(())
        }

        "exempt" => {
            let Some(target) = target_from(&msg, &arg) else {
                let _ = state
                    .notifier
                    .send_html(chat, "Reply to the member or pass a numeric id: /exempt 12345")
                    .await;
                return Ok(());
            };
            match state.store.set_exempt(target, chat, true, Utc::now()).await {
                Ok(()) => {
                    state.engine.cancel(target, chat).await;
                    let _ = state
                        .notifier
                        .send_html(
                            chat,
                            &format!(
                                "\u{1f6ab} <code>{}</code> is exempt from report timers.",
                                target.0
                            ),
                        )
                        .await;
                }
                Err(e) => {
                    let _ = state
                        .notifier
                        .send_html(chat, &format!("\u{274c} {}", escape_html(&format!("{e}"))))
                        .await;
                }
            }
            Ok(())
        }

        "unexempt" => {
            let Some(target) = target_from(&msg, &arg) else {
                let _ = state
                    .notifier
                    .send_html(chat, "Reply to the member or pass a numeric id: /unexempt 12345")
                    .await;
                return Ok(());
            };
            match state.store.set_exempt(target, chat, false, Utc::now()).await {
                Ok(()) => {
                    let _ = state
                        .notifier
                        .send_html(
                            chat,
                            &format!(
                                "\u{2705} <code>{}</code> is tracked again; \
their timer arms with their next message or /start_timer.",
                                target.0
                            ),
                        )
                        .await;
                }
                Err(e) => {
                    let _ = state
                        .notifier
                        .send_html(chat, &format!("\u{274c} {}", escape_html(&format!("{e}"))))
                        .await;
                }
            }
            Ok(())
        }

        _ => {
            // Some other bot's command; stay quiet.
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_bot_suffix_and_lowercases() {
        let (cmd, arg) = parse_command("/Start_Timer@warden_bot now");
        assert_eq!(cmd, "start_timer");
        assert_eq!(arg, "now");
    }

    #[test]
    fn bare_command_has_no_argument() {
        let (cmd, arg) = parse_command("/status");
        assert_eq!(cmd, "status");
        assert_eq!(arg, "");
    }

    #[test]
    fn target_argument_must_be_numeric() {
        assert_eq!(parse_target_arg("12345 extra"), Some(UserId(12345)));
        assert_eq!(parse_target_arg("@alice"), None);
        assert_eq!(parse_target_arg(""), None);
    }

    #[test]
    fn status_lines_show_state_and_remaining_time() {
        let now = DateTime::parse_from_rfc3339("2024-03-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let active = MemberSnapshot {
            user: UserId(5),
            state: MemberState::Active,
            window_start: now,
            deadline: Some(now + chrono::Duration::hours(30)),
        };
        let line = status_line(&active, now);
        assert!(line.contains("<code>5</code>"));
        assert!(line.contains("1d 6h left"));

        let on_leave = MemberSnapshot {
            state: MemberState::OnLeave { since: now },
            deadline: None,
            ..active
        };
        assert!(status_line(&on_leave, now).contains("on leave since 2024-03-01"));

        let removed = MemberSnapshot {
            state: MemberState::Removed,
            deadline: None,
            ..active
        };
        assert!(status_line(&removed, now).contains("removed"));
    }
}
