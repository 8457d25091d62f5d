//! Per-user funnel state storage (SQLite).
//!
//! Mutations are single conditional statements that persist exactly the
//! fields of one transition, so concurrent event tasks for the same user
//! can never overwrite each other's committed state. Each statement's
//! `WHERE` clause carries the transition rule; `rows_affected` reports
//! whether the transition applied.

use crate::error::Result;
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use sqlx::{Row as _, SqlitePool};

/// Lifecycle status of a funnel user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserStatus {
    /// Eligible for further steps.
    Alive,
    /// Delivery permanently failed; no further sends.
    Dead,
    /// Funnel completed or ended early by content policy.
    Finished,
}

impl UserStatus {
    pub const ALL: [UserStatus; 3] = [UserStatus::Alive, UserStatus::Dead, UserStatus::Finished];

    pub fn as_str(self) -> &'static str {
        match self {
            UserStatus::Alive => "alive",
            UserStatus::Dead => "dead",
            UserStatus::Finished => "finished",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "alive" => Some(UserStatus::Alive),
            "dead" => Some(UserStatus::Dead),
            "finished" => Some(UserStatus::Finished),
            _ => None,
        }
    }
}

impl std::fmt::Display for UserStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One funnel record per end-user. Rows are created lazily on first contact
/// and never deleted.
#[derive(Debug, Clone)]
pub struct FunnelUser {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub status: UserStatus,
    pub status_updated_at: DateTime<Utc>,
    /// Highest funnel step dispatched so far, 0 before any send.
    pub last_step_sent: i64,
    /// At-most-one-in-flight-send guard for this user.
    pub send_in_progress: bool,
    /// When the send guard was last acquired. Feeds the stale-guard sweep.
    pub send_marked_at: Option<DateTime<Utc>>,
    /// Stamp of the most recent successful step dispatch. Delay anchor for
    /// the following step.
    pub last_send_attempt_at: Option<DateTime<Utc>>,
    pub trigger_fired: bool,
    pub trigger_fired_at: Option<DateTime<Utc>>,
    /// Stamp of the user's first inbound private message. Delay anchor for
    /// step 1.
    pub first_message_at: Option<DateTime<Utc>>,
}

/// SQLite-backed store for [`FunnelUser`] records.
#[derive(Debug, Clone)]
pub struct UserStore {
    pool: SqlitePool,
}

impl UserStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, user_id: &str) -> Result<Option<FunnelUser>> {
        let row = sqlx::query(
            "SELECT id, created_at, status, status_updated_at, last_step_sent, send_in_progress, \
             send_marked_at, last_send_attempt_at, trigger_fired, trigger_fired_at, first_message_at \
             FROM users WHERE id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch user")?;

        row.map(user_from_row).transpose()
    }

    /// Create the record with default state if it does not exist, then
    /// return the stored row either way.
    pub async fn create_if_absent(&self, user_id: &str) -> Result<FunnelUser> {
        sqlx::query("INSERT INTO users (id) VALUES (?) ON CONFLICT(id) DO NOTHING")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("failed to insert user")?;

        self.get(user_id)
            .await?
            .context("user inserted but not found")
            .map_err(Into::into)
    }

    /// Stamp the user's first inbound message. Writes once; later calls
    /// leave the original stamp in place.
    pub async fn stamp_first_message(&self, user_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE users SET first_message_at = ? WHERE id = ? AND first_message_at IS NULL",
        )
        .bind(now.naive_utc())
        .bind(user_id)
        .execute(&self.pool)
        .await
        .context("failed to stamp first message")?;

        Ok(result.rows_affected() > 0)
    }

    /// One-way trigger transition. Returns whether the flag fired now;
    /// an already-fired trigger is never re-stamped.
    pub async fn fire_trigger(&self, user_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE users SET trigger_fired = 1, trigger_fired_at = ? \
             WHERE id = ? AND trigger_fired = 0",
        )
        .bind(now.naive_utc())
        .bind(user_id)
        .execute(&self.pool)
        .await
        .context("failed to fire trigger")?;

        Ok(result.rows_affected() > 0)
    }

    /// Claim the per-user send guard. Returns false when another task
    /// already holds it or the user is no longer alive. `rows_affected`
    /// decides the winner, which serializes sends per user.
    pub async fn try_begin_send(&self, user_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE users SET send_in_progress = 1, send_marked_at = ? \
             WHERE id = ? AND status = 'alive' AND send_in_progress = 0",
        )
        .bind(Utc::now().naive_utc())
        .bind(user_id)
        .execute(&self.pool)
        .await
        .context("failed to claim send guard")?;

        Ok(result.rows_affected() > 0)
    }

    /// Record a successful step dispatch and release the send guard.
    /// Refuses when the record left `alive` while the send was in flight,
    /// so terminal users never advance the step counter.
    pub async fn record_step_sent(
        &self,
        user_id: &str,
        step: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE users SET last_send_attempt_at = ?, last_step_sent = ?, \
             send_in_progress = 0, send_marked_at = NULL \
             WHERE id = ? AND status = 'alive'",
        )
        .bind(now.naive_utc())
        .bind(step)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .context("failed to record step dispatch")?;

        Ok(result.rows_affected() > 0)
    }

    /// Permanent delivery failure: mark the user dead and release the
    /// guard in one statement. Terminal states are never left.
    pub async fn mark_dead(&self, user_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE users SET status = ?, status_updated_at = ?, \
             send_in_progress = 0, send_marked_at = NULL \
             WHERE id = ? AND status = 'alive'",
        )
        .bind(UserStatus::Dead.as_str())
        .bind(now.naive_utc())
        .bind(user_id)
        .execute(&self.pool)
        .await
        .context("failed to mark user dead")?;

        Ok(result.rows_affected() > 0)
    }

    /// Content-policy finish: end the funnel without sending. The send
    /// guard is untouched; the finish path never holds it.
    pub async fn mark_finished(&self, user_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE users SET status = ?, status_updated_at = ? \
             WHERE id = ? AND status = 'alive'",
        )
        .bind(UserStatus::Finished.as_str())
        .bind(now.naive_utc())
        .bind(user_id)
        .execute(&self.pool)
        .await
        .context("failed to mark user finished")?;

        Ok(result.rows_affected() > 0)
    }

    /// Unconditionally clear the send guard for a user. Used by the
    /// rollback path after an aborted send attempt.
    pub async fn release_send_guard(&self, user_id: &str) -> Result<()> {
        sqlx::query("UPDATE users SET send_in_progress = 0, send_marked_at = NULL WHERE id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("failed to release send guard")?;

        Ok(())
    }

    /// Clear send guards held longer than `older_than`, returning how many
    /// were cleared. Run at startup so users stranded by a crash mid-wait
    /// become eligible again.
    pub async fn release_stale_sends(&self, older_than: std::time::Duration) -> Result<u64> {
        let older_than =
            chrono::Duration::from_std(older_than).context("stale send timeout out of range")?;
        let cutoff = Utc::now() - older_than;

        let result = sqlx::query(
            "UPDATE users SET send_in_progress = 0, send_marked_at = NULL \
             WHERE send_in_progress = 1 AND (send_marked_at IS NULL OR send_marked_at < ?)",
        )
        .bind(cutoff.naive_utc())
        .execute(&self.pool)
        .await
        .context("failed to clear stale send guards")?;

        Ok(result.rows_affected())
    }
}

fn opt_timestamp(row: &sqlx::sqlite::SqliteRow, column: &str) -> Option<DateTime<Utc>> {
    row.try_get::<Option<chrono::NaiveDateTime>, _>(column)
        .ok()
        .flatten()
        .map(|v| v.and_utc())
}

fn user_from_row(row: sqlx::sqlite::SqliteRow) -> Result<FunnelUser> {
    let status_value: String = row.try_get("status").context("failed to read user status")?;
    let status = UserStatus::parse(&status_value)
        .with_context(|| format!("invalid user status in database: {status_value}"))?;

    Ok(FunnelUser {
        id: row.try_get("id").context("failed to read user id")?,
        created_at: row
            .try_get::<chrono::NaiveDateTime, _>("created_at")
            .map(|v| v.and_utc())
            .context("failed to read user created_at")?,
        status,
        status_updated_at: row
            .try_get::<chrono::NaiveDateTime, _>("status_updated_at")
            .map(|v| v.and_utc())
            .context("failed to read user status_updated_at")?,
        last_step_sent: row
            .try_get("last_step_sent")
            .context("failed to read last_step_sent")?,
        send_in_progress: row
            .try_get("send_in_progress")
            .context("failed to read send_in_progress")?,
        send_marked_at: opt_timestamp(&row, "send_marked_at"),
        last_send_attempt_at: opt_timestamp(&row, "last_send_attempt_at"),
        trigger_fired: row
            .try_get("trigger_fired")
            .context("failed to read trigger_fired")?,
        trigger_fired_at: opt_timestamp(&row, "trigger_fired_at"),
        first_message_at: opt_timestamp(&row, "first_message_at"),
    })
}
