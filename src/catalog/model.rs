//! Wire types for the remote catalog API and their normalisation into local
//! records. Attributes stay as raw JSON until normalisation so that a single
//! malformed item fails on its own instead of failing the whole page.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::model::CatalogEntry;

/// JSON:API style collection envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct ListResponse {
    #[serde(default)]
    pub result: Option<String>,
    pub data: Vec<RemoteResource>,
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
    #[serde(default)]
    pub total: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteResource {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub attributes: Value,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Value>,
}

impl RemoteResource {
    fn relationship(&self, kind: &str) -> Option<&Relationship> {
        self.relationships.iter().find(|r| r.kind == kind)
    }
}

/// One page of the offset-paginated catalog listing.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogPage {
    pub items: Vec<RemoteResource>,
    pub limit: i64,
    pub offset: i64,
    pub total: Option<i64>,
}

/// One page of a newest-first activity feed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeedPage {
    pub items: Vec<RemoteResource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryAttributes {
    #[serde(default)]
    title: HashMap<String, String>,
    #[serde(default)]
    alt_titles: Vec<HashMap<String, String>>,
    #[serde(default)]
    description: HashMap<String, String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    year: Option<i64>,
    #[serde(default)]
    content_rating: Option<String>,
    #[serde(default)]
    original_language: Option<String>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChapterAttributes {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    chapter: Option<String>,
    #[serde(default)]
    volume: Option<String>,
    #[serde(default)]
    translated_language: Option<String>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    readable_at: Option<DateTime<Utc>>,
}

/// Catalog entry ready to upsert, plus the follow-up artifact reference.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEntry {
    pub entry: CatalogEntry,
    pub cover_ref: Option<String>,
    pub raw: Value,
}

/// Feed item ready to upsert into `activity_records`.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityItem {
    pub external_item_id: String,
    pub external_parent_id: String,
    pub title: Option<String>,
    pub number: Option<String>,
    pub volume: Option<String>,
    pub language: Option<String>,
    pub group_name: Option<String>,
    pub remote_updated_at: DateTime<Utc>,
    pub remote_readable_at: Option<DateTime<Utc>>,
    pub raw: Value,
}

static NON_SLUG_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

/// Lowercase ASCII slug from a title with a short external-id suffix so that
/// equal titles still map to distinct slugs.
pub fn slugify(title: &str, external_id: &str) -> String {
    let lowered = title.to_lowercase();
    let base = NON_SLUG_CHARS.replace_all(&lowered, "-");
    let base = base.trim_matches('-');
    let base: String = base.chars().take(80).collect();
    let base = base.trim_end_matches('-');
    let suffix: String = external_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect::<String>()
        .to_lowercase();
    match (base.is_empty(), suffix.is_empty()) {
        (true, _) => format!("entry-{suffix}"),
        (false, true) => base.to_string(),
        (false, false) => format!("{base}-{suffix}"),
    }
}

/// English first, then romanised Japanese, then whatever comes first.
fn pick_localized(map: &HashMap<String, String>) -> Option<String> {
    ["en", "ja-ro"]
        .iter()
        .find_map(|lang| map.get(*lang))
        .or_else(|| {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            keys.first().and_then(|k| map.get(*k))
        })
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn normalize_entry(item: &RemoteResource) -> Result<NormalizedEntry> {
    if item.id.trim().is_empty() {
        return Err(anyhow!("catalog item has an empty id"));
    }
    let attrs: EntryAttributes = serde_json::from_value(item.attributes.clone())
        .with_context(|| format!("catalog item {} has malformed attributes", item.id))?;
    let title = pick_localized(&attrs.title)
        .ok_or_else(|| anyhow!("catalog item {} has no usable title", item.id))?;
    let alt_titles = attrs
        .alt_titles
        .iter()
        .filter_map(pick_localized)
        .filter(|t| t != &title)
        .collect();
    let cover_ref = item.relationship("cover_art").map(|r| {
        r.attributes
            .as_ref()
            .and_then(|a| a.get("fileName"))
            .and_then(Value::as_str)
            .map(|file| format!("{}/{}", item.id, file))
            .unwrap_or_else(|| r.id.clone())
    });
    let raw = serde_json::to_value(item).context("failed to snapshot catalog item")?;

    Ok(NormalizedEntry {
        entry: CatalogEntry {
            external_id: item.id.clone(),
            slug: slugify(&title, &item.id),
            title,
            alt_titles,
            description: pick_localized(&attrs.description),
            status: attrs.status,
            year: attrs.year,
            content_rating: attrs.content_rating,
            original_language: attrs.original_language,
            remote_updated_at: attrs.updated_at,
        },
        cover_ref,
        raw,
    })
}

pub fn normalize_activity(item: &RemoteResource) -> Result<ActivityItem> {
    if item.id.trim().is_empty() {
        return Err(anyhow!("feed item has an empty id"));
    }
    let attrs: ChapterAttributes = serde_json::from_value(item.attributes.clone())
        .with_context(|| format!("feed item {} has malformed attributes", item.id))?;
    let parent = item
        .relationship("manga")
        .ok_or_else(|| anyhow!("feed item {} has no parent relationship", item.id))?;
    let group_name = item
        .relationship("scanlation_group")
        .and_then(|r| r.attributes.as_ref())
        .and_then(|a| a.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let raw = serde_json::to_value(item).context("failed to snapshot feed item")?;

    Ok(ActivityItem {
        external_item_id: item.id.clone(),
        external_parent_id: parent.id.clone(),
        title: attrs.title.filter(|t| !t.trim().is_empty()),
        number: attrs.chapter,
        volume: attrs.volume,
        language: attrs.translated_language,
        group_name,
        remote_updated_at: attrs.updated_at,
        remote_readable_at: attrs.readable_at,
        raw,
    })
}
