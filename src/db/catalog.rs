//! Crawler output: `catalog_entries` and the `artifact_jobs` follow-ups.

use super::{to_millis, Pool};
use crate::model::{ArtifactKind, CatalogEntry};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;
use tracing::instrument;

const MAX_SLUG_ATTEMPTS: usize = 50;

/// Slug to store for `external_id`. An existing entry keeps its slug. A new
/// entry gets `wanted`, or `wanted-2`, `wanted-3`, ... when another entry
/// already holds it.
async fn assign_slug(pool: &Pool, external_id: &str, wanted: &str) -> Result<String> {
    let existing = sqlx::query_scalar::<_, String>(
        "SELECT slug FROM catalog_entries WHERE external_id = ?",
    )
    .bind(external_id)
    .fetch_optional(pool)
    .await?;
    if let Some(slug) = existing {
        return Ok(slug);
    }

    for n in 1..=MAX_SLUG_ATTEMPTS {
        let candidate = match n {
            1 => wanted.to_string(),
            n => format!("{wanted}-{n}"),
        };
        let taken: Option<i64> =
            sqlx::query_scalar("SELECT id FROM catalog_entries WHERE slug = ?")
                .bind(&candidate)
                .fetch_optional(pool)
                .await?;
        if taken.is_none() {
            return Ok(candidate);
        }
    }
    anyhow::bail!("no free slug for {external_id} after {MAX_SLUG_ATTEMPTS} attempts ({wanted})")
}

/// Insert or refresh an entry keyed by its external id. The slug assigned on
/// first insert is kept on later refreshes, and a slug already held by
/// another entry is suffixed. Returns the local id.
#[instrument(skip_all, fields(external_id = %entry.external_id))]
pub async fn upsert_entry(
    pool: &Pool,
    entry: &CatalogEntry,
    raw: &Value,
    now: DateTime<Utc>,
) -> Result<i64> {
    let slug = assign_slug(pool, &entry.external_id, &entry.slug).await?;
    let alt_titles = serde_json::to_string(&entry.alt_titles)?;
    let raw = serde_json::to_string(raw)?;
    let now_ms = to_millis(now);
    let row = sqlx::query(
        "INSERT INTO catalog_entries (external_id, slug, title, alt_titles, description, status, year, \
             content_rating, original_language, remote_updated_at, raw, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12) \
         ON CONFLICT(external_id) DO UPDATE SET \
             title = excluded.title, \
             alt_titles = excluded.alt_titles, \
             description = excluded.description, \
             status = excluded.status, \
             year = excluded.year, \
             content_rating = excluded.content_rating, \
             original_language = excluded.original_language, \
             remote_updated_at = excluded.remote_updated_at, \
             raw = excluded.raw, \
             updated_at = excluded.updated_at \
         RETURNING id",
    )
    .bind(&entry.external_id)
    .bind(&slug)
    .bind(&entry.title)
    .bind(alt_titles)
    .bind(&entry.description)
    .bind(&entry.status)
    .bind(entry.year)
    .bind(&entry.content_rating)
    .bind(&entry.original_language)
    .bind(entry.remote_updated_at.map(to_millis))
    .bind(raw)
    .bind(now_ms)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to upsert catalog entry {}", entry.external_id))?;
    Ok(row.get("id"))
}

/// Local id for an external catalog id, if the entry has been crawled.
pub async fn find_entry_id(pool: &Pool, external_id: &str) -> Result<Option<i64>> {
    let id = sqlx::query_scalar::<_, i64>("SELECT id FROM catalog_entries WHERE external_id = ?")
        .bind(external_id)
        .fetch_optional(pool)
        .await?;
    Ok(id)
}

/// Queue a follow-up job for an entry. An existing job goes back to `pending`
/// only when its source reference changed.
#[instrument(skip_all, fields(entry_id = entry_id, kind = kind.as_str()))]
pub async fn enqueue_artifact(
    pool: &Pool,
    entry_id: i64,
    kind: ArtifactKind,
    source_ref: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO artifact_jobs (entry_id, kind, source_ref, status, created_at, updated_at) \
         VALUES (?1, ?2, ?3, 'pending', ?4, ?4) \
         ON CONFLICT(entry_id, kind) DO UPDATE SET \
             source_ref = excluded.source_ref, \
             status = 'pending', \
             updated_at = excluded.updated_at \
         WHERE artifact_jobs.source_ref <> excluded.source_ref",
    )
    .bind(entry_id)
    .bind(kind.as_str())
    .bind(source_ref)
    .bind(to_millis(now))
    .execute(pool)
    .await?;
    Ok(())
}
