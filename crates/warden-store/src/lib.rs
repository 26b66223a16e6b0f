//! SQLite-backed activity store.
//!
//! Two tables, upsert-only writes:
//! - `member_log`: one row per member per chat with the latest signal flags,
//!   the window/leave anchors, and the removal/exemption flags.
//! - `report_log`: one row per member with the last proof timestamp; the
//!   freshness check reads only this, so later chatter overwriting the
//!   flags can never mask a recorded proof.
//!
//! Timestamps are stored as RFC 3339 text in UTC, which keeps SQL string
//! comparison consistent with chronological order.

use std::{
    path::Path,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use warden_core::{
    domain::{ChatId, UserId},
    ports::{ActivityStore, TimerAnchor},
    signals::SignalKind,
    Error, Result,
};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(map_err)?;
        migrate(&conn).map_err(map_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for tests).
    #[cfg(test)]
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(map_err)?;
        migrate(&conn).map_err(map_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A poisoned lock only means a writer panicked mid-call; the SQL
        // statements themselves are atomic, so the connection stays usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Members of `chat` that are tracked for scheduling: not removed, not
    /// exempt. Sorted by user id.
    pub async fn roster(&self, chat: ChatId) -> Result<Vec<UserId>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT user_id FROM member_log
                 WHERE chat_id = ?1 AND is_removed = 0 AND is_exempt = 0
                 ORDER BY user_id",
            )
            .map_err(map_err)?;
        let rows = stmt
            .query_map(params![chat.0], |row| row.get::<_, i64>(0))
            .map_err(map_err)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(UserId(row.map_err(map_err)?));
        }
        Ok(out)
    }

    /// Set or clear the exemption flag.
    pub async fn set_exempt(
        &self,
        member: UserId,
        chat: ChatId,
        exempt: bool,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO member_log (user_id, chat_id, last_seen, window_start, is_exempt)
                 VALUES (?1, ?2, ?3, ?3, ?4)
                 ON CONFLICT(user_id, chat_id) DO UPDATE SET
                    is_exempt = excluded.is_exempt",
                params![member.0, chat.0, at.to_rfc3339(), exempt],
            )
            .map_err(map_err)?;
        Ok(())
    }
}

#[async_trait]
impl ActivityStore for SqliteStore {
    async fn get_timer_anchor(
        &self,
        member: UserId,
        chat: ChatId,
    ) -> Result<Option<TimerAnchor>> {
        let row: Option<(Option<String>, Option<String>)> = {
            let conn = self.conn();
            let mut stmt = conn
                .prepare(
                    "SELECT window_start, leave_start FROM member_log
                     WHERE user_id = ?1 AND chat_id = ?2 AND is_removed = 0",
                )
                .map_err(map_err)?;
            match stmt.query_row(params![member.0, chat.0], |row| {
                Ok((row.get(0)?, row.get(1)?))
            }) {
                Ok(v) => Some(v),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(map_err(e)),
            }
        };

        let Some((window_start, leave_start)) = row else {
            return Ok(None);
        };
        let Some(window_start) = window_start else {
            return Ok(None);
        };

        Ok(Some(TimerAnchor {
            window_start: parse_ts(&window_start)?,
            leave_start: leave_start.as_deref().map(parse_ts).transpose()?,
        }))
    }

    async fn record_signal(
        &self,
        member: UserId,
        chat: ChatId,
        at: DateTime<Utc>,
        kind: SignalKind,
    ) -> Result<()> {
        let conn = self.conn();
        let ts = at.to_rfc3339();
        match kind {
            SignalKind::Proof => {
                conn.execute(
                    "INSERT INTO member_log
                        (user_id, chat_id, has_report, has_leave, has_return, is_removed, last_seen, window_start)
                     VALUES (?1, ?2, 1, 0, 0, 0, ?3, ?3)
                     ON CONFLICT(user_id, chat_id) DO UPDATE SET
                        has_report = 1, has_leave = 0, has_return = 0, is_removed = 0,
                        last_seen = excluded.last_seen,
                        window_start = excluded.window_start,
                        leave_start = NULL",
                    params![member.0, chat.0, ts],
                )
                .map_err(map_err)?;
                conn.execute(
                    "INSERT INTO report_log (user_id, last_report) VALUES (?1, ?2)
                     ON CONFLICT(user_id) DO UPDATE SET last_report = excluded.last_report",
                    params![member.0, ts],
                )
                .map_err(map_err)?;
            }
            SignalKind::LeaveStart => {
                conn.execute(
                    "INSERT INTO member_log
                        (user_id, chat_id, has_report, has_leave, has_return, is_removed, last_seen, window_start, leave_start)
                     VALUES (?1, ?2, 0, 1, 0, 0, ?3, ?3, ?3)
                     ON CONFLICT(user_id, chat_id) DO UPDATE SET
                        has_report = 0, has_leave = 1, has_return = 0, is_removed = 0,
                        last_seen = excluded.last_seen,
                        leave_start = excluded.leave_start",
                    params![member.0, chat.0, ts],
                )
                .map_err(map_err)?;
            }
            SignalKind::LeaveEnd => {
                conn.execute(
                    "INSERT INTO member_log
                        (user_id, chat_id, has_report, has_leave, has_return, is_removed, last_seen, window_start)
                     VALUES (?1, ?2, 0, 0, 1, 0, ?3, ?3)
                     ON CONFLICT(user_id, chat_id) DO UPDATE SET
                        has_report = 0, has_leave = 0, has_return = 1, is_removed = 0,
                        last_seen = excluded.last_seen,
                        leave_start = NULL",
                    params![member.0, chat.0, ts],
                )
                .map_err(map_err)?;
            }
            SignalKind::Other => {
                conn.execute(
                    "INSERT INTO member_log
                        (user_id, chat_id, has_report, has_leave, has_return, is_removed, last_seen, window_start)
                     VALUES (?1, ?2, 0, 0, 0, 0, ?3, ?3)
                     ON CONFLICT(user_id, chat_id) DO UPDATE SET
                        has_report = 0, has_leave = 0, has_return = 0, is_removed = 0,
                        last_seen = excluded.last_seen",
                    params![member.0, chat.0, ts],
                )
                .map_err(map_err)?;
            }
        }
        Ok(())
    }

    async fn has_proof_since(
        &self,
        member: UserId,
        _chat: ChatId,
        since: DateTime<Utc>,
    ) -> Result<bool> {
        let found: i64 = self
            .conn()
            .query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM report_log WHERE user_id = ?1 AND last_report > ?2
                 )",
                params![member.0, since.to_rfc3339()],
                |row| row.get(0),
            )
            .map_err(map_err)?;
        Ok(found != 0)
    }

    async fn set_window_start(
        &self,
        member: UserId,
        chat: ChatId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO member_log (user_id, chat_id, last_seen, window_start)
                 VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(user_id, chat_id) DO UPDATE SET
                    window_start = excluded.window_start,
                    leave_start = NULL,
                    is_removed = 0",
                params![member.0, chat.0, at.to_rfc3339()],
            )
            .map_err(map_err)?;
        Ok(())
    }

    async fn mark_removed(&self, member: UserId, chat: ChatId) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE member_log SET is_removed = 1 WHERE user_id = ?1 AND chat_id = ?2",
                params![member.0, chat.0],
            )
            .map_err(map_err)?;
        Ok(())
    }

    async fn is_exempt(&self, member: UserId, chat: ChatId) -> Result<bool> {
        let result = self.conn().query_row(
            "SELECT is_exempt FROM member_log WHERE user_id = ?1 AND chat_id = ?2",
            params![member.0, chat.0],
            |row| row.get::<_, bool>(0),
        );
        match result {
            Ok(v) => Ok(v),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(false),
            Err(e) => Err(map_err(e)),
        }
    }
}

fn migrate(conn: &Connection) -> std::result::Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS member_log (
            user_id      INTEGER NOT NULL,
            chat_id      INTEGER NOT NULL,
            has_report   INTEGER NOT NULL DEFAULT 0,
            has_leave    INTEGER NOT NULL DEFAULT 0,
            has_return   INTEGER NOT NULL DEFAULT 0,
            is_removed   INTEGER NOT NULL DEFAULT 0,
            is_exempt    INTEGER NOT NULL DEFAULT 0,
            last_seen    TEXT NOT NULL,
            window_start TEXT,
            leave_start  TEXT,
            PRIMARY KEY (user_id, chat_id)
        );

        CREATE TABLE IF NOT EXISTS report_log (
            user_id     INTEGER PRIMARY KEY,
            last_report TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_member_log_chat ON member_log(chat_id);",
    )?;
    Ok(())
}

fn map_err(e: rusqlite::Error) -> Error {
    Error::Store(e.to_string())
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| Error::Store(format!("bad timestamp {s:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const U: UserId = UserId(11);
    const C: ChatId = ChatId(-100);

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn first_signal_creates_the_record() {
        let store = SqliteStore::open_memory().unwrap();
        assert!(store.get_timer_anchor(U, C).await.unwrap().is_none());

        store
            .record_signal(U, C, t0(), SignalKind::Other)
            .await
            .unwrap();
        let anchor = store.get_timer_anchor(U, C).await.unwrap().unwrap();
        assert_eq!(anchor.window_start, t0());
        assert_eq!(anchor.leave_start, None);
    }

    #[tokio::test]
    async fn chatter_does_not_move_the_window() {
        let store = SqliteStore::open_memory().unwrap();
        store
            .record_signal(U, C, t0(), SignalKind::Other)
            .await
            .unwrap();
        store
            .record_signal(U, C, t0() + Duration::days(1), SignalKind::Other)
            .await
            .unwrap();
        let anchor = store.get_timer_anchor(U, C).await.unwrap().unwrap();
        assert_eq!(anchor.window_start, t0());
    }

    #[tokio::test]
    async fn proof_reanchors_and_clears_leave() {
        let store = SqliteStore::open_memory().unwrap();
        store
            .record_signal(U, C, t0(), SignalKind::LeaveStart)
            .await
            .unwrap();
        let anchor = store.get_timer_anchor(U, C).await.unwrap().unwrap();
        assert_eq!(anchor.leave_start, Some(t0()));

        let at = t0() + Duration::days(2);
        store.record_signal(U, C, at, SignalKind::Proof).await.unwrap();
        let anchor = store.get_timer_anchor(U, C).await.unwrap().unwrap();
        assert_eq!(anchor.window_start, at);
        assert_eq!(anchor.leave_start, None);
    }

    #[tokio::test]
    async fn leave_start_keeps_the_window_anchor() {
        let store = SqliteStore::open_memory().unwrap();
        store.record_signal(U, C, t0(), SignalKind::Proof).await.unwrap();
        store
            .record_signal(U, C, t0() + Duration::days(3), SignalKind::LeaveStart)
            .await
            .unwrap();
        let anchor = store.get_timer_anchor(U, C).await.unwrap().unwrap();
        assert_eq!(anchor.window_start, t0());
        assert_eq!(anchor.leave_start, Some(t0() + Duration::days(3)));

        store
            .record_signal(U, C, t0() + Duration::days(5), SignalKind::LeaveEnd)
            .await
            .unwrap();
        let anchor = store.get_timer_anchor(U, C).await.unwrap().unwrap();
        assert_eq!(anchor.window_start, t0());
        assert_eq!(anchor.leave_start, None);
    }

    #[tokio::test]
    async fn proof_check_is_strictly_after() {
        let store = SqliteStore::open_memory().unwrap();
        store.record_signal(U, C, t0(), SignalKind::Proof).await.unwrap();

        assert!(!store.has_proof_since(U, C, t0()).await.unwrap());
        assert!(store
            .has_proof_since(U, C, t0() - Duration::seconds(1))
            .await
            .unwrap());
        assert!(!store
            .has_proof_since(U, C, t0() + Duration::seconds(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn no_proof_row_means_no_proof() {
        let store = SqliteStore::open_memory().unwrap();
        store
            .record_signal(U, C, t0(), SignalKind::Other)
            .await
            .unwrap();
        assert!(!store
            .has_proof_since(U, C, t0() - Duration::days(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn later_chatter_cannot_mask_a_proof() {
        let store = SqliteStore::open_memory().unwrap();
        store.record_signal(U, C, t0(), SignalKind::Proof).await.unwrap();
        store
            .record_signal(U, C, t0() + Duration::hours(1), SignalKind::Other)
            .await
            .unwrap();
        assert!(store
            .has_proof_since(U, C, t0() - Duration::seconds(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn removed_member_has_no_anchor_until_revived() {
        let store = SqliteStore::open_memory().unwrap();
        store.record_signal(U, C, t0(), SignalKind::Proof).await.unwrap();
        store.mark_removed(U, C).await.unwrap();
        assert!(store.get_timer_anchor(U, C).await.unwrap().is_none());

        let back = t0() + Duration::days(10);
        store.set_window_start(U, C, back).await.unwrap();
        let anchor = store.get_timer_anchor(U, C).await.unwrap().unwrap();
        assert_eq!(anchor.window_start, back);
    }

    #[tokio::test]
    async fn any_signal_clears_the_removed_flag() {
        let store = SqliteStore::open_memory().unwrap();
        store.record_signal(U, C, t0(), SignalKind::Other).await.unwrap();
        store.mark_removed(U, C).await.unwrap();
        store
            .record_signal(U, C, t0() + Duration::days(1), SignalKind::Other)
            .await
            .unwrap();
        assert!(store.get_timer_anchor(U, C).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn revival_leave_lands_on_the_fresh_window() {
        let store = SqliteStore::open_memory().unwrap();
        store.record_signal(U, C, t0(), SignalKind::Proof).await.unwrap();
        store.mark_removed(U, C).await.unwrap();

        // Callers re-anchor first, then record the leave.
        let back = t0() + Duration::days(10);
        store.set_window_start(U, C, back).await.unwrap();
        store
            .record_signal(U, C, back, SignalKind::LeaveStart)
            .await
            .unwrap();

        let anchor = store.get_timer_anchor(U, C).await.unwrap().unwrap();
        assert_eq!(anchor.window_start, back);
        assert_eq!(anchor.leave_start, Some(back));
    }

    #[tokio::test]
    async fn exemption_roundtrip_and_roster_filtering() {
        let store = SqliteStore::open_memory().unwrap();
        let other = UserId(12);
        let removed = UserId(13);
        store.record_signal(U, C, t0(), SignalKind::Other).await.unwrap();
        store.record_signal(other, C, t0(), SignalKind::Other).await.unwrap();
        store.record_signal(removed, C, t0(), SignalKind::Other).await.unwrap();
        store.mark_removed(removed, C).await.unwrap();

        assert!(!store.is_exempt(U, C).await.unwrap());
        store.set_exempt(U, C, true, t0()).await.unwrap();
        assert!(store.is_exempt(U, C).await.unwrap());

        assert_eq!(store.roster(C).await.unwrap(), vec![other]);

        store.set_exempt(U, C, false, t0()).await.unwrap();
        assert_eq!(store.roster(C).await.unwrap(), vec![U, other]);
    }

    #[tokio::test]
    async fn rosters_are_scoped_per_chat() {
        let store = SqliteStore::open_memory().unwrap();
        let other_chat = ChatId(-200);
        store.record_signal(U, C, t0(), SignalKind::Other).await.unwrap();
        store
            .record_signal(UserId(12), other_chat, t0(), SignalKind::Other)
            .await
            .unwrap();

        assert_eq!(store.roster(C).await.unwrap(), vec![U]);
        assert_eq!(store.roster(other_chat).await.unwrap(), vec![UserId(12)]);
    }

    #[tokio::test]
    async fn exempting_an_unseen_member_creates_the_row() {
        let store = SqliteStore::open_memory().unwrap();
        store.set_exempt(U, C, true, t0()).await.unwrap();
        assert!(store.is_exempt(U, C).await.unwrap());
    }
}
