//! HTTP fetcher implementation
//!
//! This module handles all HTTP requests for the crawler, including:
//! - Building HTTP clients with the configured user agent and session cookie
//! - Mapping probe targets to site URLs
//! - Classifying responses into pages, absent ids and transient failures

use crate::config::SiteConfig;
use crate::crawler::parser::{parse_chart_page, parse_song_page, ParseError};
use crate::crawler::source::{FetchError, ProbeSource};
use crate::state::{ProbeTarget, TransientKind};
use crate::storage::Record;
use crate::{ConfigError, HarvestError};
use reqwest::header::{HeaderMap, HeaderValue, COOKIE};
use reqwest::{Client, StatusCode};
use std::time::Duration;

/// Builds an HTTP client with proper configuration
///
/// # Arguments
///
/// * `config` - The site configuration
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(HarvestError)` - Invalid cookie value or client construction failure
pub fn build_http_client(config: &SiteConfig) -> Result<Client, HarvestError> {
    let mut headers = HeaderMap::new();
    if let Some(cookie) = &config.cookie {
        let value = HeaderValue::from_str(cookie).map_err(|e| {
            ConfigError::Validation(format!("cookie is not a valid header value: {}", e))
        })?;
        headers.insert(COOKIE, value);
    }

    let client = Client::builder()
        .user_agent(config.user_agent.clone())
        .default_headers(headers)
        .timeout(Duration::from_secs(config.timeout_secs))
        .connect_timeout(Duration::from_secs(config.timeout_secs.min(10)))
        .gzip(true)
        .brotli(true)
        .build()?;

    Ok(client)
}

/// Maps a non-success status to a fetch error
///
/// | Status | Result |
/// |--------|--------|
/// | 2xx | `None` (page body follows) |
/// | 404, 410 | `NotFound` |
/// | 429, 5xx, anything else | `Transient(Status)` |
pub fn classify_status(status: StatusCode) -> Option<FetchError> {
    if status.is_success() {
        return None;
    }
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => Some(FetchError::NotFound),
        other => Some(FetchError::Transient(TransientKind::Status(other.as_u16()))),
    }
}

fn classify_reqwest_error(e: &reqwest::Error) -> TransientKind {
    if e.is_timeout() {
        TransientKind::Timeout
    } else if e.is_body() || e.is_decode() {
        TransientKind::Body
    } else {
        TransientKind::Connection
    }
}

/// HTTP probe source for the catalog site
#[derive(Debug, Clone)]
pub struct MalodySource {
    client: Client,
    base_url: String,
}

impl MalodySource {
    pub fn new(config: &SiteConfig) -> Result<Self, HarvestError> {
        Ok(Self::with_client(build_http_client(config)?, &config.base_url))
    }

    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// URL of the page a target lives on
    pub fn url_for(&self, target: ProbeTarget) -> String {
        match target {
            ProbeTarget::Chart(cid) => format!("{}/chart/{}", self.base_url, cid),
            ProbeTarget::Song(sid) => format!("{}/song/{}", self.base_url, sid),
        }
    }

    /// URL of the leaderboard for a game mode
    pub fn leaderboard_url(&self, mode: u8) -> String {
        format!("{}/page/all/player?from=0&mode={}", self.base_url, mode)
    }

    /// Fetches a page and classifies the result
    pub async fn fetch_page(&self, url: &str) -> Result<String, FetchError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            tracing::debug!("Request to {} failed: {}", url, e);
            FetchError::Transient(classify_reqwest_error(&e))
        })?;

        if let Some(err) = classify_status(response.status()) {
            tracing::debug!("{} answered {}", url, response.status());
            return Err(err);
        }

        response.text().await.map_err(|e| {
            tracing::debug!("Reading body of {} failed: {}", url, e);
            FetchError::Transient(TransientKind::Body)
        })
    }

    /// Fetches the leaderboard page for a game mode
    pub async fn fetch_leaderboard(&self, mode: u8) -> Result<String, FetchError> {
        self.fetch_page(&self.leaderboard_url(mode)).await
    }
}

impl ProbeSource for MalodySource {
    async fn fetch(&self, target: ProbeTarget) -> Result<String, FetchError> {
        self.fetch_page(&self.url_for(target)).await
    }

    fn parse(&self, html: &str, target: ProbeTarget) -> Result<Vec<Record>, ParseError> {
        match target {
            ProbeTarget::Chart(cid) => {
                let (song, chart) = parse_chart_page(html, cid)?;
                Ok(vec![Record::Song(song), Record::Chart(chart)])
            }
            ProbeTarget::Song(sid) => Ok(vec![Record::Listing(parse_song_page(html, sid))]),
        }
    }
}
