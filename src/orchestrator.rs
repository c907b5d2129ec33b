//! One orchestrator tick: promote recent activity into the work queue, lease a
//! batch, refresh each leased parent and report the outcome back to the queue.

use crate::activity;
use crate::catalog::CatalogSource;
use crate::db::{self, Pool};
use crate::model::{Outcome, QueueItem};
use anyhow::Result;
use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

pub const MAX_BATCH: i64 = 50;
pub const MIN_LEASE_SECS: i64 = 30;
pub const MAX_LEASE_SECS: i64 = 600;
pub const MAX_WINDOW: i64 = 500;

const MAX_ERROR_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncParams {
    /// How many of the newest activity records feed phase A.
    pub window: i64,
    pub batch_size: i64,
    pub lease_seconds: i64,
    /// Feed page size used when refreshing one parent.
    pub item_limit: i64,
}

impl SyncParams {
    pub fn clamped(self) -> Self {
        Self {
            window: self.window.clamp(1, MAX_WINDOW),
            batch_size: self.batch_size.clamp(1, MAX_BATCH),
            lease_seconds: self.lease_seconds.clamp(MIN_LEASE_SECS, MAX_LEASE_SECS),
            item_limit: self.item_limit.max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemResult {
    pub id: i64,
    pub external_id: String,
    pub ok: bool,
    pub processed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// False when the lease was taken over before this tick resolved it.
    pub resolved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrchestratorReport {
    pub enqueued: usize,
    pub claimed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub stale_resolves: usize,
    pub results: Vec<ItemResult>,
}

#[instrument(skip_all)]
pub async fn run(
    pool: &Pool,
    source: &dyn CatalogSource,
    params: SyncParams,
) -> Result<OrchestratorReport> {
    let params = params.clamped();

    let parents = db::activity::recent_parent_ids(pool, params.window).await?;
    let now = Utc::now();
    for (external_id, observed_at) in &parents {
        db::queue::enqueue_or_touch(pool, external_id, *observed_at, now).await?;
    }

    let lease = Duration::seconds(params.lease_seconds);
    let claimed = db::queue::claim_batch(pool, params.batch_size, lease, Utc::now()).await?;

    let mut report = OrchestratorReport {
        enqueued: parents.len(),
        claimed: claimed.len(),
        succeeded: 0,
        failed: 0,
        stale_resolves: 0,
        results: Vec::with_capacity(claimed.len()),
    };
    for item in &claimed {
        let result = process_item(pool, source, item, params.item_limit).await?;
        if result.ok {
            report.succeeded += 1;
        } else {
            report.failed += 1;
        }
        if !result.resolved {
            report.stale_resolves += 1;
        }
        report.results.push(result);
    }

    info!(
        enqueued = report.enqueued,
        claimed = report.claimed,
        succeeded = report.succeeded,
        failed = report.failed,
        "orchestrator tick finished"
    );
    Ok(report)
}

async fn process_item(
    pool: &Pool,
    source: &dyn CatalogSource,
    item: &QueueItem,
    item_limit: i64,
) -> Result<ItemResult> {
    let Some(token) = item.lock_token.as_deref() else {
        warn!(id = item.id, "claimed row has no lock token");
        return Ok(ItemResult {
            id: item.id,
            external_id: item.external_id.clone(),
            ok: false,
            processed: 0,
            error: Some("missing lock token".to_string()),
            resolved: false,
        });
    };

    let (outcome, processed) =
        match activity::sync_parent(pool, source, &item.external_id, item_limit).await {
            Ok(parent) => (Outcome::Success, parent.processed),
            Err(err) => {
                warn!(?err, id = item.id, external_id = %item.external_id, "queue item failed");
                (Outcome::Failure(truncate_error(&format!("{err:#}"))), 0)
            }
        };

    let resolved = db::queue::resolve(pool, item.id, token, &outcome, Utc::now()).await?;
    if !resolved {
        warn!(id = item.id, "lease expired before resolve; outcome dropped");
    }
    let error = match outcome {
        Outcome::Success => None,
        Outcome::Failure(message) => Some(message),
    };
    Ok(ItemResult {
        id: item.id,
        external_id: item.external_id.clone(),
        ok: error.is_none(),
        processed,
        error,
        resolved,
    })
}

fn truncate_error(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_CHARS {
        return message.to_string();
    }
    let mut out: String = message.chars().take(MAX_ERROR_CHARS).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_are_clamped_into_range() {
        let p = SyncParams {
            window: 10_000,
            batch_size: 0,
            lease_seconds: 5,
            item_limit: 0,
        }
        .clamped();
        assert_eq!(p.window, MAX_WINDOW);
        assert_eq!(p.batch_size, 1);
        assert_eq!(p.lease_seconds, MIN_LEASE_SECS);
        assert_eq!(p.item_limit, 1);

        let p = SyncParams {
            window: 0,
            batch_size: 99,
            lease_seconds: 9_999,
            item_limit: 20,
        }
        .clamped();
        assert_eq!(p.window, 1);
        assert_eq!(p.batch_size, MAX_BATCH);
        assert_eq!(p.lease_seconds, MAX_LEASE_SECS);
        assert_eq!(p.item_limit, 20);
    }

    #[test]
    fn long_errors_are_truncated() {
        let long = "x".repeat(2_000);
        let out = truncate_error(&long);
        assert_eq!(out.chars().count(), MAX_ERROR_CHARS + 1);
        assert_eq!(truncate_error("short"), "short");
    }
}
