//! Per-member compliance timers.
//!
//! Every tracked member owns at most one live (warning, removal) pair of
//! delayed tasks, armed against the member's `window_start` anchor. A proof
//! resets the pair from any state; leave freezes the countdown and return
//! resumes it with the time that was left. The pair is canceled as a unit
//! and a firing task re-checks the activity store for a proof newer than its
//! anchor before acting, so a stale fire racing a reset is a no-op.
//!
//! Timestamps come in as parameters rather than being read from the clock
//! here; only the sleep durations derive from them. That keeps the state
//! machine deterministic under test.

use std::{collections::HashMap, sync::Arc, time::Duration as StdDuration};

use chrono::{DateTime, Duration, Utc};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{
    domain::{ChatId, MemberKey, UserId},
    ports::{ActivityStore, NotificationPort, TimerAnchor},
    signals::SignalKind,
};

/// Window lengths for the compliance policy.
#[derive(Clone, Copy, Debug)]
pub struct TimerPolicy {
    /// Removal fires this long after the window anchor.
    pub window: Duration,
    /// Warning fires this long after the window anchor; shorter than `window`.
    pub warning_offset: Duration,
}

impl Default for TimerPolicy {
    fn default() -> Self {
        Self {
            window: Duration::days(7),
            warning_offset: Duration::days(6),
        }
    }
}

/// Where a member is in the compliance lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberState {
    /// Window running, no warning delivered yet.
    Active,
    /// Warning delivered; removal still pending.
    Warned,
    /// Countdown frozen since the contained instant.
    OnLeave { since: DateTime<Utc> },
    /// Removed from the chat; any new message starts them over.
    Removed,
}

/// Point-in-time view of one tracked member, for the admin surface.
#[derive(Clone, Copy, Debug)]
pub struct MemberSnapshot {
    pub user: UserId,
    pub state: MemberState,
    pub window_start: DateTime<Utc>,
    /// When removal will fire; `None` while frozen or after removal.
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct ComplianceTimerEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    policy: TimerPolicy,
    store: Arc<dyn ActivityStore>,
    notifier: Arc<dyn NotificationPort>,
    state: tokio::sync::Mutex<EngineState>,
}

#[derive(Default)]
struct EngineState {
    members: HashMap<MemberKey, MemberEntry>,
}

struct MemberEntry {
    state: MemberState,
    window_start: DateTime<Utc>,
    deadline: DateTime<Utc>,
    timers: Option<TimerPair>,
}

struct TimerPair {
    warning: TimerTask,
    removal: TimerTask,
}

impl TimerPair {
    fn abort(self) {
        for task in [self.warning, self.removal] {
            task.cancel.cancel();
            task.handle.abort(); // best-effort
        }
    }
}

struct TimerTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ComplianceTimerEngine {
    pub fn new(
        policy: TimerPolicy,
        store: Arc<dyn ActivityStore>,
        notifier: Arc<dyn NotificationPort>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                policy,
                store,
                notifier,
                state: tokio::sync::Mutex::new(EngineState::default()),
            }),
        }
    }

    pub fn policy(&self) -> TimerPolicy {
        self.inner.policy
    }

    /// Start tracking a member with a fresh full window anchored at `at`.
    pub async fn on_member_joined(&self, member: UserId, chat: ChatId, at: DateTime<Utc>) {
        if self.is_exempt(member, chat).await {
            println!("[TIMER] User {} in chat {} is exempt, not arming", member.0, chat.0);
            return;
        }
        if let Err(e) = self.inner.store.set_window_start(member, chat, at).await {
            eprintln!("[TIMER] Failed to persist window start for user {}: {e}", member.0);
        }
        self.arm(MemberKey::new(member, chat), at, at).await;
        println!(
            "[TIMER] Tracking user {} in chat {} (removal due {})",
            member.0,
            chat.0,
            (at + self.inner.policy.window).to_rfc3339()
        );
    }

    /// Drive the state machine with a classified signal observed at `at`.
    pub async fn on_signal(&self, member: UserId, chat: ChatId, kind: SignalKind, at: DateTime<Utc>) {
        let key = MemberKey::new(member, chat);

        // A proof is recorded before the new pair is armed, so a stale timer
        // already in flight sees it. It resets the window from any state,
        // leave included.
        if kind == SignalKind::Proof {
            if let Err(e) = self.inner.store.record_signal(member, chat, at, kind).await {
                eprintln!("[TIMER] Failed to record proof from user {}: {e}", member.0);
            }
            if self.is_exempt(member, chat).await {
                return;
            }
            println!("[TIMER] Report from user {} in chat {}, window reset", member.0, chat.0);
            self.arm(key, at, at).await;
            return;
        }

        let exempt = self.is_exempt(member, chat).await;

        // First sighting, or a removed member came back.
        let needs_revival = !exempt && {
            let st = self.inner.state.lock().await;
            match st.members.get(&key) {
                None => true,
                Some(entry) => entry.state == MemberState::Removed,
            }
        };

        if needs_revival {
            // The fresh window is anchored before the signal is recorded, so
            // the record (a leave marker in particular) lands on it.
            if let Err(e) = self.inner.store.set_window_start(member, chat, at).await {
                eprintln!("[TIMER] Failed to persist window start for user {}: {e}", member.0);
            }
        }

        if let Err(e) = self.inner.store.record_signal(member, chat, at, kind).await {
            eprintln!(
                "[TIMER] Failed to record {} from user {}: {e}",
                kind.label(),
                member.0
            );
        }

        if exempt {
            return;
        }

        if needs_revival {
            if kind == SignalKind::LeaveStart {
                // Frozen from the first moment of the fresh window.
                let mut st = self.inner.state.lock().await;
                st.members.insert(
                    key,
                    MemberEntry {
                        state: MemberState::OnLeave { since: at },
                        window_start: at,
                        deadline: at + self.inner.policy.window,
                        timers: None,
                    },
                );
            } else {
                self.arm(key, at, at).await;
            }
            return;
        }

        match kind {
            SignalKind::LeaveStart => self.begin_leave(key, at).await,
            SignalKind::LeaveEnd => self.end_leave(key, at).await,
            _ => {}
        }
    }

    /// Cancel the member's pair and drop the volatile entry. The durable
    /// record is untouched. Safe to call when nothing is scheduled.
    pub async fn cancel(&self, member: UserId, chat: ChatId) {
        let mut st = self.inner.state.lock().await;
        if let Some(entry) = st.members.remove(&MemberKey::new(member, chat)) {
            if let Some(pair) = entry.timers {
                pair.abort();
            }
            println!("[TIMER] Stopped tracking user {} in chat {}", member.0, chat.0);
        }
    }

    /// Bulk re-arm from stored anchors. Members with an anchor resume with
    /// whatever time is left (overdue ones fire straight through the normal
    /// freshness-checked path), members without one start fresh at `now`,
    /// members with a stored leave are rebuilt frozen. Returns how many
    /// timers were armed.
    pub async fn reschedule_all(&self, chat: ChatId, members: &[UserId], now: DateTime<Utc>) -> usize {
        let mut armed = 0usize;
        for &member in members {
            let key = MemberKey::new(member, chat);
            if self.is_exempt(member, chat).await {
                continue;
            }

            let anchor = match self.inner.store.get_timer_anchor(member, chat).await {
                Ok(v) => v,
                Err(e) => {
                    eprintln!(
                        "[TIMER] Anchor lookup failed for user {} (starting fresh): {e}",
                        member.0
                    );
                    None
                }
            };

            match anchor {
                Some(TimerAnchor {
                    window_start,
                    leave_start: Some(since),
                }) => {
                    let mut st = self.inner.state.lock().await;
                    let old = st.members.insert(
                        key,
                        MemberEntry {
                            state: MemberState::OnLeave { since },
                            window_start,
                            deadline: window_start + self.inner.policy.window,
                            timers: None,
                        },
                    );
                    if let Some(pair) = old.and_then(|e| e.timers) {
                        pair.abort();
                    }
                }
                Some(TimerAnchor {
                    window_start,
                    leave_start: None,
                }) => {
                    self.arm(key, window_start, now).await;
                    armed += 1;
                }
                None => {
                    if let Err(e) = self.inner.store.set_window_start(member, chat, now).await {
                        eprintln!(
                            "[TIMER] Failed to persist window start for user {}: {e}",
                            member.0
                        );
                    }
                    self.arm(key, now, now).await;
                    armed += 1;
                }
            }
        }
        println!("[TIMER] Re-armed {armed} member(s) in chat {}", chat.0);
        armed
    }

    /// Tracked members of one chat, sorted by user id.
    pub async fn snapshot(&self, chat: ChatId) -> Vec<MemberSnapshot> {
        let st = self.inner.state.lock().await;
        let mut out: Vec<MemberSnapshot> = st
            .members
            .iter()
            .filter(|(key, _)| key.chat == chat)
            .map(|(key, entry)| MemberSnapshot {
                user: key.user,
                state: entry.state,
                window_start: entry.window_start,
                deadline: match entry.state {
                    MemberState::Active | MemberState::Warned => Some(entry.deadline),
                    _ => None,
                },
            })
            .collect();
        out.sort_by_key(|s| s.user.0);
        out
    }

    /// Cancel everything (process shutdown).
    pub async fn shutdown(&self) {
        let mut st = self.inner.state.lock().await;
        for (_, entry) in st.members.drain() {
            if let Some(pair) = entry.timers {
                pair.abort();
            }
        }
    }

    // ---- internals ----

    async fn is_exempt(&self, member: UserId, chat: ChatId) -> bool {
        match self.inner.store.is_exempt(member, chat).await {
            Ok(v) => v,
            Err(e) => {
                eprintln!(
                    "[TIMER] Exemption check failed for user {} (assuming tracked): {e}",
                    member.0
                );
                false
            }
        }
    }

    /// Arm a full window anchored at `anchor`, with delays measured from `now`.
    async fn arm(&self, key: MemberKey, anchor: DateTime<Utc>, now: DateTime<Utc>) {
        let warn_at = anchor + self.inner.policy.warning_offset;
        let remove_at = anchor + self.inner.policy.window;
        let mut st = self.inner.state.lock().await;
        self.install_locked(&mut st, key, anchor, warn_at, remove_at, now);
    }

    /// Replace the member's schedule under an already-held state lock.
    ///
    /// Spawning inside the critical section guarantees a zero-delay task
    /// cannot observe the table before its own entry is in place.
    fn install_locked(
        &self,
        st: &mut EngineState,
        key: MemberKey,
        anchor: DateTime<Utc>,
        warn_at: DateTime<Utc>,
        remove_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        let pair = TimerPair {
            warning: self.spawn_warning(key, anchor, remove_at, to_sleep(warn_at - now)),
            removal: self.spawn_removal(key, anchor, to_sleep(remove_at - now)),
        };

        let entry = st.members.entry(key).or_insert_with(|| MemberEntry {
            state: MemberState::Active,
            window_start: anchor,
            deadline: remove_at,
            timers: None,
        });
        entry.state = MemberState::Active;
        entry.window_start = anchor;
        entry.deadline = remove_at;
        if let Some(old) = entry.timers.replace(pair) {
            old.abort();
        }
    }

    fn spawn_warning(
        &self,
        key: MemberKey,
        anchor: DateTime<Utc>,
        deadline: DateTime<Utc>,
        delay: StdDuration,
    ) -> TimerTask {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
              _ = token.cancelled() => return,
              _ = sleep(delay) => {}
            }
            engine.fire_warning(key, anchor, deadline).await;
        });
        TimerTask { cancel, handle }
    }

    fn spawn_removal(&self, key: MemberKey, anchor: DateTime<Utc>, delay: StdDuration) -> TimerTask {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
              _ = token.cancelled() => return,
              _ = sleep(delay) => {}
            }
            engine.fire_removal(key, anchor).await;
        });
        TimerTask { cancel, handle }
    }

    async fn fire_warning(&self, key: MemberKey, anchor: DateTime<Utc>, deadline: DateTime<Utc>) {
        match self.inner.store.has_proof_since(key.user, key.chat, anchor).await {
            Ok(true) => return, // a newer report already reset this member
            Ok(false) => {}
            Err(e) => {
                eprintln!(
                    "[TIMER] Proof check failed for user {} (skipping warning): {e}",
                    key.user.0
                );
                return;
            }
        }

        {
            let mut st = self.inner.state.lock().await;
            let Some(entry) = st.members.get_mut(&key) else {
                return;
            };
            if entry.window_start != anchor || entry.state != MemberState::Active {
                return; // superseded while we slept
            }
            entry.state = MemberState::Warned;
        }

        println!(
            "[TIMER] Warning user {} in chat {} (removal due {})",
            key.user.0,
            key.chat.0,
            deadline.to_rfc3339()
        );
        if let Err(e) = self.inner.notifier.send_warning(key.chat, key.user, deadline).await {
            eprintln!("[TIMER] Failed to warn user {}: {e}", key.user.0);
        }
    }

    async fn fire_removal(&self, key: MemberKey, anchor: DateTime<Utc>) {
        match self.inner.store.has_proof_since(key.user, key.chat, anchor).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                eprintln!(
                    "[TIMER] Proof check failed for user {} (skipping removal): {e}",
                    key.user.0
                );
                return;
            }
        }

        {
            let mut st = self.inner.state.lock().await;
            let Some(entry) = st.members.get_mut(&key) else {
                return;
            };
            if entry.window_start != anchor
                || !matches!(entry.state, MemberState::Active | MemberState::Warned)
            {
                return;
            }
            entry.state = MemberState::Removed;
            // This task is half of the pair, so plain drop rather than abort.
            entry.timers = None;
        }

        println!(
            "[TIMER] Removing user {} from chat {} (no report since {})",
            key.user.0,
            key.chat.0,
            anchor.to_rfc3339()
        );
        if let Err(e) = self.inner.notifier.remove_member(key.chat, key.user).await {
            eprintln!("[TIMER] Failed to remove user {}: {e}", key.user.0);
        }
        if let Err(e) = self.inner.store.mark_removed(key.user, key.chat).await {
            eprintln!("[TIMER] Failed to record removal of user {}: {e}", key.user.0);
        }
    }

    async fn begin_leave(&self, key: MemberKey, at: DateTime<Utc>) {
        let mut st = self.inner.state.lock().await;
        let Some(entry) = st.members.get_mut(&key) else {
            return;
        };
        match entry.state {
            MemberState::Active | MemberState::Warned => {
                entry.state = MemberState::OnLeave { since: at };
                if let Some(pair) = entry.timers.take() {
                    pair.abort();
                }
                println!(
                    "[TIMER] User {} in chat {} on leave, countdown frozen",
                    key.user.0, key.chat.0
                );
            }
            // A repeated leave keeps the original freeze point.
            MemberState::OnLeave { .. } | MemberState::Removed => {}
        }
    }

    async fn end_leave(&self, key: MemberKey, at: DateTime<Utc>) {
        let re_anchored = {
            let mut st = self.inner.state.lock().await;
            let (anchor, since) = {
                let Some(entry) = st.members.get(&key) else {
                    return;
                };
                let MemberState::OnLeave { since } = entry.state else {
                    return; // not frozen, nothing to resume
                };
                (entry.window_start, since)
            };

            let elapsed = since - anchor;
            let remaining_removal = self.inner.policy.window - elapsed;
            let remaining_warning = self.inner.policy.warning_offset - elapsed;

            if remaining_removal > Duration::zero() {
                // Resume against the original anchor so reports older than
                // the window cannot satisfy the freshness check.
                println!(
                    "[TIMER] User {} back from leave, {}s of window left",
                    key.user.0,
                    remaining_removal.num_seconds()
                );
                self.install_locked(
                    &mut st,
                    key,
                    anchor,
                    at + remaining_warning,
                    at + remaining_removal,
                    at,
                );
                false
            } else {
                // The whole window went by while frozen; start the member over.
                println!(
                    "[TIMER] User {} back from leave after a full window, starting over",
                    key.user.0
                );
                self.install_locked(
                    &mut st,
                    key,
                    at,
                    at + self.inner.policy.warning_offset,
                    at + self.inner.policy.window,
                    at,
                );
                true
            }
        };

        if re_anchored {
            if let Err(e) = self.inner.store.set_window_start(key.user, key.chat, at).await {
                eprintln!("[TIMER] Failed to re-anchor window for user {}: {e}", key.user.0);
            }
        }
    }
}

fn to_sleep(d: Duration) -> StdDuration {
    match d.to_std() {
        Ok(d) => d,
        Err(_) => StdDuration::from_secs(0),
    }
}
