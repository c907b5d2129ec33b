#![allow(dead_code)]

use anyhow::{anyhow, Result};
use catalog_sync::catalog::{CatalogPage, CatalogSource, FeedPage, RemoteResource};
use catalog_sync::db;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Mutex;

/// File-backed pool; the TempDir must outlive the pool.
pub async fn setup_pool() -> (TempDir, db::Pool) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}/test.db", dir.path().display());
    let pool = db::init_pool(&url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    (dir, pool)
}

pub fn ts(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap()
}

pub fn manga(id: &str, title: &str) -> RemoteResource {
    serde_json::from_value(json!({
        "id": id,
        "type": "manga",
        "attributes": {
            "title": { "en": title },
            "status": "ongoing",
            "updatedAt": "2024-05-01T00:00:00+00:00"
        },
        "relationships": [
            { "id": format!("cover-{id}"), "type": "cover_art", "attributes": { "fileName": format!("{id}.jpg") } }
        ]
    }))
    .unwrap()
}

/// Catalog item with no usable title.
pub fn broken_manga(id: &str) -> RemoteResource {
    serde_json::from_value(json!({ "id": id, "type": "manga", "attributes": { "title": {} } }))
        .unwrap()
}

pub fn chapter(id: &str, parent: &str, updated_at: DateTime<Utc>) -> RemoteResource {
    serde_json::from_value(json!({
        "id": id,
        "type": "chapter",
        "attributes": {
            "chapter": "1",
            "translatedLanguage": "en",
            "updatedAt": updated_at.to_rfc3339()
        },
        "relationships": [
            { "id": parent, "type": "manga" },
            { "id": "g-1", "type": "scanlation_group", "attributes": { "name": "Team" } }
        ]
    }))
    .unwrap()
}

/// Feed item without the parent relationship.
pub fn orphan_chapter(id: &str, updated_at: DateTime<Utc>) -> RemoteResource {
    serde_json::from_value(json!({
        "id": id,
        "type": "chapter",
        "attributes": { "updatedAt": updated_at.to_rfc3339() }
    }))
    .unwrap()
}

fn parent_of(item: &RemoteResource) -> Option<&str> {
    item.relationships
        .iter()
        .find(|r| r.kind == "manga")
        .map(|r| r.id.as_str())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    ListPage { limit: i64, offset: i64 },
    ListRecent { limit: i64, offset: i64 },
    ListForParent { parent: String, limit: i64 },
}

/// In-memory catalog service. The catalog is served by offset, the feed is
/// kept newest first, and every call is recorded.
#[derive(Clone, Default)]
pub struct FakeCatalog {
    catalog: Arc<Mutex<Vec<RemoteResource>>>,
    feed: Arc<Mutex<Vec<RemoteResource>>>,
    failing_parents: Arc<Mutex<HashSet<String>>>,
    fail_listing: Arc<Mutex<bool>>,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl FakeCatalog {
    pub fn with_catalog(items: Vec<RemoteResource>) -> Self {
        Self {
            catalog: Arc::new(Mutex::new(items)),
            ..Default::default()
        }
    }

    pub fn with_feed(items: Vec<RemoteResource>) -> Self {
        Self {
            feed: Arc::new(Mutex::new(items)),
            ..Default::default()
        }
    }

    /// Prepend newer items; `items` must already be newest first.
    pub async fn publish(&self, items: Vec<RemoteResource>) {
        let mut feed = self.feed.lock().await;
        let mut next = items;
        next.extend(feed.drain(..));
        *feed = next;
    }

    pub async fn fail_parent(&self, parent: &str) {
        self.failing_parents.lock().await.insert(parent.to_string());
    }

    pub async fn set_fail_listing(&self, fail: bool) {
        *self.fail_listing.lock().await = fail;
    }

    pub async fn calls(&self) -> Vec<Call> {
        self.calls.lock().await.clone()
    }

    pub async fn clear_calls(&self) {
        self.calls.lock().await.clear();
    }
}

fn slice(items: &[RemoteResource], limit: i64, offset: i64) -> Vec<RemoteResource> {
    items
        .iter()
        .skip(offset.max(0) as usize)
        .take(limit.max(0) as usize)
        .cloned()
        .collect()
}

#[async_trait::async_trait]
impl CatalogSource for FakeCatalog {
    async fn list_page(&self, limit: i64, offset: i64) -> Result<CatalogPage> {
        self.calls.lock().await.push(Call::ListPage { limit, offset });
        if *self.fail_listing.lock().await {
            return Err(anyhow!("catalog error 503 Service Unavailable: maintenance"));
        }
        let catalog = self.catalog.lock().await;
        Ok(CatalogPage {
            items: slice(&catalog, limit, offset),
            limit,
            offset,
            total: Some(catalog.len() as i64),
        })
    }

    async fn list_recent(&self, limit: i64, offset: i64) -> Result<FeedPage> {
        self.calls.lock().await.push(Call::ListRecent { limit, offset });
        if *self.fail_listing.lock().await {
            return Err(anyhow!("catalog error 503 Service Unavailable: maintenance"));
        }
        let feed = self.feed.lock().await;
        Ok(FeedPage {
            items: slice(&feed, limit, offset),
        })
    }

    async fn list_recent_for_parent(&self, parent_id: &str, limit: i64) -> Result<FeedPage> {
        self.calls.lock().await.push(Call::ListForParent {
            parent: parent_id.to_string(),
            limit,
        });
        if self.failing_parents.lock().await.contains(parent_id) {
            return Err(anyhow!("catalog error 500 Internal Server Error: boom"));
        }
        let feed = self.feed.lock().await;
        let items: Vec<RemoteResource> = feed
            .iter()
            .filter(|item| parent_of(item) == Some(parent_id))
            .take(limit.max(0) as usize)
            .cloned()
            .collect();
        Ok(FeedPage { items })
    }
}

pub async fn count(pool: &db::Pool, sql: &str) -> i64 {
    sqlx::query_scalar::<_, i64>(sql)
        .fetch_one(pool)
        .await
        .unwrap()
}
