use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::config::Config;

pub mod model;

pub use model::{
    normalize_activity, normalize_entry, ActivityItem, CatalogPage, FeedPage, NormalizedEntry,
    Relationship, RemoteResource,
};

use model::ListResponse;

/// Paginated read access to the remote catalog service.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Offset-paginated listing of catalog entries, oldest first.
    async fn list_page(&self, limit: i64, offset: i64) -> Result<CatalogPage>;

    /// Global activity feed, newest `updatedAt` first.
    async fn list_recent(&self, limit: i64, offset: i64) -> Result<FeedPage>;

    /// Activity feed of a single catalog entry, newest `updatedAt` first.
    async fn list_recent_for_parent(&self, parent_id: &str, limit: i64) -> Result<FeedPage>;
}

#[derive(Clone)]
pub struct CatalogClient {
    http: Client,
    base_url: Url,
}

impl fmt::Debug for CatalogClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl CatalogClient {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let base_url = Url::parse(&cfg.catalog.base_url).context("invalid catalog base URL")?;
        Self::with_base_url(
            base_url,
            &cfg.catalog.user_agent,
            Duration::from_secs(cfg.catalog.timeout_seconds),
        )
    }

    pub fn with_base_url(mut base_url: Url, user_agent: &str, timeout: Duration) -> Result<Self> {
        // Url::join drops the last path segment unless the base ends in '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = Client::builder()
            .user_agent(user_agent.to_string())
            .timeout(timeout)
            .no_proxy()
            .build()
            .context("failed to build catalog http client")?;
        Ok(Self { http, base_url })
    }

    pub fn build_request(&self, path: &str, query: &[(&str, String)]) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(path)
            .with_context(|| format!("invalid catalog path {path}"))?;
        self.http
            .get(endpoint)
            .header("Accept", "application/json")
            .query(query)
            .build()
            .context("failed to build catalog request")
    }

    async fn fetch_list(&self, path: &str, query: &[(&str, String)]) -> Result<ListResponse> {
        let request = self.build_request(path, query)?;
        debug!(url = %request.url(), "sending catalog request");
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach catalog service")?;

        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("received 429 from catalog service: {}", body));
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("catalog error {}: {}", status, body));
        }

        let body = res
            .text()
            .await
            .context("failed to read catalog response")?;
        let payload: ListResponse =
            serde_json::from_str(&body).context("invalid catalog response JSON")?;
        if let Some(result) = payload.result.as_deref() {
            if result != "ok" {
                return Err(anyhow!("catalog service reported result={}", result));
            }
        }
        Ok(payload)
    }
}

#[async_trait]
impl CatalogSource for CatalogClient {
    async fn list_page(&self, limit: i64, offset: i64) -> Result<CatalogPage> {
        let query = [
            ("limit", limit.to_string()),
            ("offset", offset.to_string()),
            ("order[createdAt]", "asc".to_string()),
            ("includes[]", "cover_art".to_string()),
        ];
        let payload = self.fetch_list("manga", &query).await?;
        Ok(CatalogPage {
            items: payload.data,
            limit: payload.limit,
            offset: payload.offset,
            total: payload.total,
        })
    }

    async fn list_recent(&self, limit: i64, offset: i64) -> Result<FeedPage> {
        let query = [
            ("limit", limit.to_string()),
            ("offset", offset.to_string()),
            ("order[updatedAt]", "desc".to_string()),
            ("includes[]", "scanlation_group".to_string()),
        ];
        let payload = self.fetch_list("chapter", &query).await?;
        Ok(FeedPage {
            items: payload.data,
        })
    }

    async fn list_recent_for_parent(&self, parent_id: &str, limit: i64) -> Result<FeedPage> {
        let query = [
            ("limit", limit.to_string()),
            ("order[updatedAt]", "desc".to_string()),
            ("includes[]", "scanlation_group".to_string()),
        ];
        let path = format!("manga/{}/feed", parent_id);
        let payload = self.fetch_list(&path, &query).await?;
        Ok(FeedPage {
            items: payload.data,
        })
    }
}
