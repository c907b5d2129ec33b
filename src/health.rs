//! Read-only snapshot of queue, cursor and activity state.

use crate::db::{self, Pool};
use crate::model::{CrawlCursor, QueueItem, QueueStatus};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Upper bound on the stale-pending window (30 days).
pub const MAX_STALE_MINUTES: i64 = 60 * 24 * 30;

/// Stale-pending window for a caller-supplied minute count, clamped to
/// `0..=MAX_STALE_MINUTES`.
pub fn stale_window(minutes: i64) -> Duration {
    Duration::minutes(minutes.clamp(0, MAX_STALE_MINUTES))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivitySummary {
    pub records: i64,
    pub newest_remote_updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub statuses: BTreeMap<QueueStatus, i64>,
    pub total: i64,
    /// Rows not yet `done`.
    pub backlog: i64,
    /// `processing` rows whose lease already ran out.
    pub stuck_leases: i64,
    pub error_count: i64,
    pub recent_errors: Vec<QueueItem>,
    pub recent_done: Vec<QueueItem>,
    pub stale_pending: Vec<QueueItem>,
    pub stale_after_minutes: i64,
    pub cursors: Vec<CrawlCursor>,
    pub activity: ActivitySummary,
}

pub async fn report(
    pool: &Pool,
    sample_size: i64,
    stale_after: Duration,
    now: DateTime<Utc>,
) -> Result<HealthReport> {
    let sample = sample_size.max(0);
    let statuses = db::queue::status_counts(pool).await?;
    let total: i64 = statuses.values().sum();
    let count_of = |s: QueueStatus| statuses.get(&s).copied().unwrap_or(0);
    let backlog = total - count_of(QueueStatus::Done);
    let error_count = count_of(QueueStatus::Error);

    let stuck_leases = db::queue::count_stuck(pool, now).await?;
    let recent_errors = db::queue::recent_by_status(pool, QueueStatus::Error, sample).await?;
    let recent_done = db::queue::recent_by_status(pool, QueueStatus::Done, sample).await?;
    let stale_pending = db::queue::stale_pending(pool, now - stale_after, sample).await?;
    let cursors = db::cursor::list_cursors(pool).await?;
    let (records, newest_remote_updated_at) = db::activity::summary(pool).await?;

    Ok(HealthReport {
        generated_at: now,
        statuses,
        total,
        backlog,
        stuck_leases,
        error_count,
        recent_errors,
        recent_done,
        stale_pending,
        stale_after_minutes: stale_after.num_minutes(),
        cursors,
        activity: ActivitySummary {
            records,
            newest_remote_updated_at,
        },
    })
}
