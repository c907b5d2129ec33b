use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Done,
    Error,
}

impl QueueStatus {
    pub const ALL: [QueueStatus; 4] = [
        QueueStatus::Pending,
        QueueStatus::Processing,
        QueueStatus::Done,
        QueueStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Done => "done",
            QueueStatus::Error => "error",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "processing" => Some(QueueStatus::Processing),
            "done" => Some(QueueStatus::Done),
            "error" => Some(QueueStatus::Error),
            _ => None,
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result a lease holder reports back to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(String),
}

/// One row of `sync_queue`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueItem {
    pub id: i64,
    pub external_id: String,
    pub status: QueueStatus,
    pub last_seen_at: DateTime<Utc>,
    pub next_run_at: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
    pub lock_token: Option<String>,
    pub last_error: Option<String>,
    pub attempts: i64,
    pub updated_at: DateTime<Utc>,
}

/// Persisted position of one crawl stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CrawlCursor {
    pub stream_id: String,
    pub cursor_offset: i64,
    pub cursor_timestamp: Option<DateTime<Utc>>,
    pub cursor_last_id: Option<String>,
    pub page_size: i64,
    pub total: Option<i64>,
    pub processed_count: i64,
    pub updated_at: DateTime<Utc>,
}

/// Feed position: remote update time first, item id breaks ties.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct FeedPosition {
    pub updated_at: DateTime<Utc>,
    pub id: String,
}

impl CrawlCursor {
    pub fn feed_position(&self) -> Option<FeedPosition> {
        match (&self.cursor_timestamp, &self.cursor_last_id) {
            (Some(ts), Some(id)) => Some(FeedPosition {
                updated_at: *ts,
                id: id.clone(),
            }),
            _ => None,
        }
    }
}

/// One observed "item changed" event from the remote activity feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivityRecord {
    pub external_item_id: String,
    pub external_parent_id: String,
    pub local_parent_id: Option<i64>,
    pub title: Option<String>,
    pub number: Option<String>,
    pub volume: Option<String>,
    pub language: Option<String>,
    pub group_name: Option<String>,
    pub remote_updated_at: DateTime<Utc>,
    pub remote_readable_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Local catalog record seeded by the crawler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogEntry {
    pub external_id: String,
    pub slug: String,
    pub title: String,
    pub alt_titles: Vec<String>,
    pub description: Option<String>,
    pub status: Option<String>,
    pub year: Option<i64>,
    pub content_rating: Option<String>,
    pub original_language: Option<String>,
    pub remote_updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ArtifactKind {
    Cover,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Cover => "cover",
        }
    }
}
