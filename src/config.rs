//! Configuration loader and validator for the catalog sync pipeline.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub server: Server,
    pub catalog: Catalog,
    pub crawl: Crawl,
    pub activity: Activity,
    pub queue: Queue,
    pub health: Health,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// Trigger server settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Server {
    pub bind: String,
    pub shared_secret: String,
    #[serde(default = "default_secret_header")]
    pub secret_header: String,
}

/// Remote catalog service settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Catalog {
    pub base_url: String,
    pub user_agent: String,
    pub timeout_seconds: u64,
}

/// Offset-paginated catalog crawl stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Crawl {
    pub stream_id: String,
    pub page_size: i64,
    pub batch_limit: usize,
}

/// Time+id paginated activity feed stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Activity {
    pub stream_id: String,
    pub page_size: i64,
    pub max_pages: usize,
    pub hard_cap: usize,
}

/// Work queue drain settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Queue {
    pub batch_size: i64,
    pub lease_seconds: i64,
    pub window: i64,
    pub item_limit: i64,
}

/// Health report defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Health {
    pub sample_size: i64,
    pub stale_minutes: i64,
}

fn default_secret_header() -> String {
    "x-sync-secret".to_string()
}

impl App {
    /// Expand a leading `~/` in `data_dir`.
    pub fn resolved_data_dir(&self) -> String {
        if let Some(rest) = self.data_dir.strip_prefix("~/") {
            if let Ok(home) = std::env::var("HOME") {
                return format!("{}/{}", home.trim_end_matches('/'), rest);
            }
        }
        self.data_dir.clone()
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// `DATABASE_URL` wins; otherwise a SQLite file under `app.data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!("sqlite://{}/catalog_sync.db", self.app.resolved_data_dir())
        })
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    if cfg.server.bind.trim().is_empty() {
        return Err(ConfigError::Invalid("server.bind must be non-empty"));
    }
    if cfg.server.shared_secret.trim().is_empty() {
        return Err(ConfigError::Invalid("server.shared_secret must be non-empty"));
    }
    if cfg.server.secret_header.trim().is_empty() {
        return Err(ConfigError::Invalid("server.secret_header must be non-empty"));
    }

    if reqwest::Url::parse(&cfg.catalog.base_url).is_err() {
        return Err(ConfigError::Invalid("catalog.base_url must be an absolute URL"));
    }
    if cfg.catalog.user_agent.trim().is_empty() {
        return Err(ConfigError::Invalid("catalog.user_agent must be non-empty"));
    }
    if cfg.catalog.timeout_seconds == 0 {
        return Err(ConfigError::Invalid("catalog.timeout_seconds must be > 0"));
    }

    if cfg.crawl.stream_id.trim().is_empty() {
        return Err(ConfigError::Invalid("crawl.stream_id must be non-empty"));
    }
    if cfg.crawl.page_size <= 0 {
        return Err(ConfigError::Invalid("crawl.page_size must be > 0"));
    }
    if cfg.crawl.batch_limit == 0 {
        return Err(ConfigError::Invalid("crawl.batch_limit must be > 0"));
    }

    if cfg.activity.stream_id.trim().is_empty() {
        return Err(ConfigError::Invalid("activity.stream_id must be non-empty"));
    }
    if cfg.activity.stream_id == cfg.crawl.stream_id {
        return Err(ConfigError::Invalid(
            "activity.stream_id must differ from crawl.stream_id",
        ));
    }
    if cfg.activity.page_size <= 0 {
        return Err(ConfigError::Invalid("activity.page_size must be > 0"));
    }
    if cfg.activity.max_pages == 0 {
        return Err(ConfigError::Invalid("activity.max_pages must be > 0"));
    }
    if cfg.activity.hard_cap == 0 {
        return Err(ConfigError::Invalid("activity.hard_cap must be > 0"));
    }

    if !(1..=50).contains(&cfg.queue.batch_size) {
        return Err(ConfigError::Invalid("queue.batch_size must be within 1..=50"));
    }
    if !(30..=600).contains(&cfg.queue.lease_seconds) {
        return Err(ConfigError::Invalid("queue.lease_seconds must be within 30..=600"));
    }
    if cfg.queue.window <= 0 {
        return Err(ConfigError::Invalid("queue.window must be > 0"));
    }
    if cfg.queue.item_limit <= 0 {
        return Err(ConfigError::Invalid("queue.item_limit must be > 0"));
    }

    if cfg.health.sample_size <= 0 {
        return Err(ConfigError::Invalid("health.sample_size must be > 0"));
    }
    if cfg.health.stale_minutes <= 0 {
        return Err(ConfigError::Invalid("health.stale_minutes must be > 0"));
    }

    Ok(())
}

/// Returns a complete, valid example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

server:
  bind: "127.0.0.1:8787"
  shared_secret: "CHANGE_ME"
  secret_header: "x-sync-secret"

catalog:
  base_url: "https://api.mangadex.org/"
  user_agent: "catalog-sync/0.1"
  timeout_seconds: 20

crawl:
  stream_id: "catalog_seed"
  page_size: 25
  batch_limit: 25

activity:
  stream_id: "chapter_feed"
  page_size: 100
  max_pages: 5
  hard_cap: 400

queue:
  batch_size: 10
  lease_seconds: 120
  window: 200
  item_limit: 50

health:
  sample_size: 10
  stale_minutes: 60
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn example_cfg() -> Config {
        serde_yaml::from_str(example()).unwrap()
    }

    #[test]
    fn parse_example_ok() {
        let cfg = example_cfg();
        validate(&cfg).unwrap();
        assert_eq!(cfg.server.secret_header, "x-sync-secret");
        assert_eq!(cfg.crawl.page_size, 25);
    }

    #[test]
    fn secret_header_defaults_when_omitted() {
        let yaml = example().replace("  secret_header: \"x-sync-secret\"\n", "");
        let cfg: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(cfg.server.secret_header, "x-sync-secret");
    }

    #[test]
    fn invalid_shared_secret() {
        let mut cfg = example_cfg();
        cfg.server.shared_secret = "  ".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("server.shared_secret")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_base_url() {
        let mut cfg = example_cfg();
        cfg.catalog.base_url = "not a url".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("catalog.base_url")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn queue_bounds_are_enforced() {
        let mut cfg = example_cfg();
        cfg.queue.batch_size = 51;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        cfg.queue.lease_seconds = 29;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        cfg.queue.lease_seconds = 601;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn streams_must_be_distinct() {
        let mut cfg = example_cfg();
        cfg.activity.stream_id = cfg.crawl.stream_id.clone();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("activity.stream_id")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg = example_cfg();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.activity.stream_id, "chapter_feed");
    }
}
