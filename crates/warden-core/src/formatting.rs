//! Outbound message formatting (Telegram HTML helpers).

/// Escape HTML special characters for Telegram HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Inline mention that notifies the user even without a username.
pub fn mention(user_id: i64, display: &str) -> String {
    format!(
        r#"<a href="tg://user?id={user_id}">{}</a>"#,
        escape_html(display)
    )
}

/// Human form of a duration, largest unit first.
pub fn format_duration(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3600;
    let mins = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if days > 0 {
        return format!("{days}d {hours}h");
    }
    if hours > 0 {
        return format!("{hours}h {mins}m");
    }
    if mins > 0 {
        return format!("{mins}m {secs}s");
    }
    format!("{secs}s")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_html_specials() {
        assert_eq!(escape_html("<b> & \"x\""), "&lt;b&gt; &amp; &quot;x&quot;");
    }

    #[test]
    fn mention_escapes_display_name() {
        assert_eq!(
            mention(42, "Ann <x>"),
            r#"<a href="tg://user?id=42">Ann &lt;x&gt;</a>"#
        );
    }

    #[test]
    fn duration_picks_largest_unit() {
        assert_eq!(format_duration(3 * 86_400 + 5 * 3600), "3d 5h");
        assert_eq!(format_duration(2 * 3600 + 60), "2h 1m");
        assert_eq!(format_duration(95), "1m 35s");
        assert_eq!(format_duration(9), "9s");
    }

    #[test]
    fn negative_duration_clamps_to_zero() {
        assert_eq!(format_duration(-30), "0s");
    }
}
