//! Minimal HTTP/1.1 trigger surface.
//!
//! Every pipeline step is one route guarded by a shared-secret header. Requests
//! carry no state beyond their query string; each call reads everything it
//! needs from the database, so any number of invocations may overlap.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::activity::{self, SyncOptions};
use crate::catalog::CatalogSource;
use crate::config::Config;
use crate::crawl;
use crate::db::Pool;
use crate::health;
use crate::orchestrator::{self, SyncParams};

const MAX_HEADER_BYTES: usize = 16 * 1024;
const MAX_BODY_BYTES: usize = 16 * 1024;
const READ_TIMEOUT_SECS: u64 = 10;
const MAX_PAGE_SIZE: i64 = 100;
const MAX_PAGES: usize = 50;

pub struct AppState {
    pub pool: Pool,
    pub source: Arc<dyn CatalogSource>,
    pub cfg: Config,
}

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("not found")]
    NotFound,
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Step(#[from] anyhow::Error),
}

impl TriggerError {
    pub fn status(&self) -> u16 {
        match self {
            TriggerError::Unauthorized => 401,
            TriggerError::NotFound => 404,
            TriggerError::MethodNotAllowed => 405,
            TriggerError::BadRequest(_) => 400,
            TriggerError::Step(_) => 500,
        }
    }

    fn body(&self) -> Value {
        match self {
            TriggerError::Step(err) => json!({ "error": format!("{err:#}") }),
            TriggerError::BadRequest(msg) => json!({ "error": msg }),
            other => json!({ "error": other.to_string() }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn path(&self) -> &str {
        let path = self.target.split('?').next().unwrap_or("/");
        if path.is_empty() {
            "/"
        } else {
            path
        }
    }

    /// Decoded query parameters; the last occurrence of a key wins.
    pub fn query(&self) -> HashMap<String, String> {
        let Some((_, raw)) = self.target.split_once('?') else {
            return HashMap::new();
        };
        match reqwest::Url::parse(&format!("http://localhost/?{raw}")) {
            Ok(url) => url.query_pairs().into_owned().collect(),
            Err(_) => HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Crawl,
    Activity,
    Sync,
    Health,
}

impl Route {
    fn from_path(path: &str) -> Option<Self> {
        match path.trim_end_matches('/') {
            "/crawl" => Some(Route::Crawl),
            "/activity" => Some(Route::Activity),
            "/sync" => Some(Route::Sync),
            "/health" => Some(Route::Health),
            _ => None,
        }
    }
}

/// Accept connections until the listener fails, one task per connection.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    let addr = listener.local_addr().context("listener has no local address")?;
    info!(%addr, "trigger server listening");
    loop {
        let (stream, peer) = listener.accept().await.context("accept failed")?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, &state).await {
                warn!(?err, %peer, "connection error");
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, state: &AppState) -> std::io::Result<()> {
    let read = tokio::time::timeout(
        std::time::Duration::from_secs(READ_TIMEOUT_SECS),
        read_request(&mut stream),
    )
    .await;
    let request = match read {
        Ok(Ok(Some(request))) => request,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(err)) => return Err(err),
        Err(_) => {
            debug!("request read timed out");
            return Ok(());
        }
    };
    let (status, body) = dispatch(state, &request).await;
    write_json(&mut stream, status, &body).await
}

/// Parse one request: request line, headers and a `Content-Length` body.
pub async fn read_request<R>(stream: &mut R) -> std::io::Result<Option<HttpRequest>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];
    let mut data = Vec::<u8>::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "request header too large",
            ));
        }
        let read = stream.read(&mut buf).await?;
        if read == 0 {
            if data.is_empty() {
                return Ok(None);
            }
            break data.len();
        }
        data.extend_from_slice(&buf[..read]);
    };

    let header_text = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut body = data[header_end..].to_vec();
    let mut lines = header_text.split("\r\n");
    let Some(request_line) = lines.next() else {
        return Ok(None);
    };
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_ascii_uppercase();
    let target = parts.next().unwrap_or("/").to_string();
    if method.is_empty() {
        return Ok(None);
    }

    let mut headers = Vec::new();
    let mut content_length = 0usize;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim().to_string();
        let value = value.trim().to_string();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value.parse::<usize>().unwrap_or(0).min(MAX_BODY_BYTES);
        }
        headers.push((name, value));
    }

    while body.len() < content_length {
        let read = stream.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(&buf[..read]);
    }
    body.truncate(content_length);

    Ok(Some(HttpRequest {
        method,
        target,
        headers,
        body,
    }))
}

pub async fn write_json<W>(stream: &mut W, status: u16, body: &Value) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = body.to_string();
    let head = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json; charset=utf-8\r\n\
         Cache-Control: no-store\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n",
        status,
        reason_phrase(status),
        payload.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(payload.as_bytes()).await?;
    stream.flush().await
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Internal Server Error",
    }
}

/// Route, authorize and run one request. Always produces a JSON body.
pub async fn dispatch(state: &AppState, request: &HttpRequest) -> (u16, Value) {
    let started = std::time::Instant::now();
    let path = request.path().to_string();
    let result = handle(state, request).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(body) => {
            info!(method = %request.method, %path, status = 200, elapsed_ms, "trigger handled");
            (200, body)
        }
        Err(err) => {
            let status = err.status();
            match &err {
                TriggerError::Step(inner) => {
                    error!(method = %request.method, %path, status, ?inner, "trigger step failed")
                }
                _ => warn!(method = %request.method, %path, status, "trigger rejected"),
            }
            (status, err.body())
        }
    }
}

async fn handle(state: &AppState, request: &HttpRequest) -> Result<Value, TriggerError> {
    let route = Route::from_path(request.path()).ok_or(TriggerError::NotFound)?;
    if request.method != "GET" && request.method != "POST" {
        return Err(TriggerError::MethodNotAllowed);
    }
    authorize(&state.cfg, request)?;

    let query = request.query();
    let cfg = &state.cfg;
    let source = state.source.as_ref();
    match route {
        Route::Crawl => {
            let stream_id = stream_param(&query, &cfg.crawl.stream_id);
            let page_size =
                param::<i64>(&query, "page_size")?.map(|size| size.clamp(1, MAX_PAGE_SIZE));
            let batch = param::<usize>(&query, "batch")?
                .unwrap_or(cfg.crawl.batch_limit)
                .max(1);
            let report = crawl::step(
                &state.pool,
                source,
                &stream_id,
                cfg.crawl.page_size,
                page_size,
                batch,
            )
            .await?;
            to_json(&report)
        }
        Route::Activity => {
            let stream_id = stream_param(&query, &cfg.activity.stream_id);
            let opts = SyncOptions {
                max_pages: param::<usize>(&query, "max_pages")?
                    .unwrap_or(cfg.activity.max_pages)
                    .clamp(1, MAX_PAGES),
                page_size: param::<i64>(&query, "page_size")?
                    .unwrap_or(cfg.activity.page_size)
                    .clamp(1, MAX_PAGE_SIZE),
                hard_cap: param::<usize>(&query, "hard_cap")?
                    .unwrap_or(cfg.activity.hard_cap)
                    .max(1),
                force: flag(&query, "force")?,
            };
            let report = activity::sync(&state.pool, source, &stream_id, opts).await?;
            to_json(&report)
        }
        Route::Sync => {
            let params = SyncParams {
                window: param(&query, "window")?.unwrap_or(cfg.queue.window),
                batch_size: param(&query, "batch")?.unwrap_or(cfg.queue.batch_size),
                lease_seconds: param(&query, "lease")?.unwrap_or(cfg.queue.lease_seconds),
                item_limit: param(&query, "page_size")?.unwrap_or(cfg.queue.item_limit),
            };
            let report = orchestrator::run(&state.pool, source, params).await?;
            to_json(&report)
        }
        Route::Health => {
            let sample = param::<i64>(&query, "sample")?
                .unwrap_or(cfg.health.sample_size)
                .clamp(0, 100);
            let stale = param::<i64>(&query, "stale_minutes")?.unwrap_or(cfg.health.stale_minutes);
            let report =
                health::report(&state.pool, sample, health::stale_window(stale), Utc::now())
                    .await?;
            to_json(&report)
        }
    }
}

fn authorize(cfg: &Config, request: &HttpRequest) -> Result<(), TriggerError> {
    let presented = request
        .header(&cfg.server.secret_header)
        .ok_or(TriggerError::Unauthorized)?;
    if secrets_match(presented.as_bytes(), cfg.server.shared_secret.as_bytes()) {
        Ok(())
    } else {
        Err(TriggerError::Unauthorized)
    }
}

/// Compare without short-circuiting on the first differing byte.
fn secrets_match(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn stream_param(query: &HashMap<String, String>, default: &str) -> String {
    query
        .get("stream_id")
        .or_else(|| query.get("state_id"))
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or(default)
        .to_string()
}

fn param<T: FromStr>(query: &HashMap<String, String>, key: &str) -> Result<Option<T>, TriggerError> {
    match query.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| TriggerError::BadRequest(format!("invalid {key}: {raw}"))),
    }
}

fn flag(query: &HashMap<String, String>, key: &str) -> Result<bool, TriggerError> {
    match query.get(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) => match v.as_str() {
            "" | "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(TriggerError::BadRequest(format!("invalid {key}: {v}"))),
        },
    }
}

fn to_json<T: Serialize>(report: &T) -> Result<Value, TriggerError> {
    serde_json::to_value(report)
        .context("failed to serialize report")
        .map_err(TriggerError::Step)
}
