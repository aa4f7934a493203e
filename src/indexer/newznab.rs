use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use tracing::{debug, warn};

use crate::config::IndexerConfig;
use crate::indexer::types::{Category, Item, SearchRequest, parse_search_response};
use crate::indexer::{Indexer, IndexerError};
use crate::usage::{Usage, UsageManager};

const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);
const PING_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = concat!("streamnzb/", env!("CARGO_PKG_VERSION"));

/// Generic Newznab backend; also the HTTP plumbing the meta-indexer
/// clients wrap.
pub struct NewznabClient {
    name: String,
    base_url: String,
    api_key: String,
    http: reqwest::Client,
    usage: Arc<UsageManager>,
    download_timeout: Duration,
}

impl NewznabClient {
    pub fn new(
        config: &IndexerConfig,
        usage: Arc<UsageManager>,
        download_timeout: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(SEARCH_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            name: config.name.clone(),
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            http,
            usage,
            download_timeout,
        }
    }

    fn search_mode(request: &SearchRequest) -> &'static str {
        if request.category == Category::Tv || request.season.is_some() {
            "tvsearch"
        } else if request.category == Category::Movies {
            "movie"
        } else {
            "search"
        }
    }

    pub(crate) async fn raw_search(
        &self,
        request: &SearchRequest,
    ) -> Result<Vec<Item>, IndexerError> {
        if self.usage.api_limit_reached(&self.name).await {
            return Err(IndexerError::LimitReached(self.name.clone()));
        }

        let mut params: Vec<(&str, String)> = vec![
            ("t", Self::search_mode(request).to_string()),
            ("apikey", self.api_key.clone()),
            ("o", "xml".to_string()),
            ("limit", request.limit.to_string()),
            ("offset", "0".to_string()),
        ];
        if !request.query.is_empty() {
            params.push(("q", request.query.clone()));
        }
        if let Some(imdb) = &request.imdb_id {
            params.push(("imdbid", imdb.trim_start_matches("tt").to_string()));
        }
        if let Some(tmdb) = &request.tmdb_id {
            params.push(("tmdbid", tmdb.clone()));
        }
        if let Some(tvdb) = &request.tvdb_id {
            params.push(("tvdbid", tvdb.clone()));
        }
        if request.category != Category::Any {
            params.push(("cat", request.category.as_str().to_string()));
        }
        if let Some(season) = request.season {
            params.push(("season", season.to_string()));
        }
        if let Some(episode) = request.episode {
            params.push(("ep", episode.to_string()));
        }

        let url = format!("{}/api", self.base_url);
        let response = self.http.get(&url).query(&params).send().await?;
        self.usage.increment_used(&self.name, 1, 0).await;
        self.harvest_limit_headers(response.headers()).await;

        let status = response.status();
        if !status.is_success() {
            return Err(IndexerError::Status {
                indexer: self.name.clone(),
                code: status.as_u16(),
            });
        }

        let body = response.bytes().await?;
        let items = parse_search_response(&body, &self.name)?;
        debug!(indexer = %self.name, items = items.len(), "search complete");
        Ok(items)
    }

    pub(crate) async fn raw_download(&self, url: &str) -> Result<Bytes, IndexerError> {
        if self.usage.download_limit_reached(&self.name).await {
            return Err(IndexerError::LimitReached(self.name.clone()));
        }

        let response = self
            .http
            .get(url)
            .timeout(self.download_timeout)
            .send()
            .await?;
        self.usage.increment_used(&self.name, 0, 1).await;
        self.harvest_limit_headers(response.headers()).await;

        let status = response.status();
        if !status.is_success() {
            return Err(IndexerError::Status {
                indexer: self.name.clone(),
                code: status.as_u16(),
            });
        }

        Ok(response.bytes().await?)
    }

    pub(crate) async fn raw_ping(&self) -> Result<(), IndexerError> {
        let url = format!("{}/api", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("t", "caps"), ("apikey", self.api_key.as_str())])
            .timeout(PING_TIMEOUT)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(IndexerError::Status {
                indexer: self.name.clone(),
                code: status.as_u16(),
            });
        }
        Ok(())
    }

    pub(crate) fn base_name(&self) -> &str {
        &self.name
    }

    pub(crate) fn usage_manager(&self) -> &Arc<UsageManager> {
        &self.usage
    }

    /// Rate/grab-limit response headers carry the indexer's own view of
    /// today's quota; absolute values replace our local counts.
    async fn harvest_limit_headers(&self, headers: &HeaderMap) {
        let number = |names: &[&str]| {
            names.iter().find_map(|n| {
                headers
                    .get(*n)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
            })
        };

        let api_limit = number(&["x-ratelimit-apilimit", "x-ratelimit-limit"]);
        let api_remaining = number(&["x-ratelimit-apiremaining", "x-ratelimit-remaining"]);
        let dl_limit = number(&["x-ratelimit-downloadlimit", "x-downloadlimit"]);
        let dl_remaining = number(&["x-ratelimit-downloadremaining", "x-downloadremaining"]);

        if api_limit.is_some() || dl_limit.is_some() {
            self.usage
                .set_limits(&self.name, api_limit, dl_limit)
                .await;
        }
        if let (Some(limit), Some(remaining)) = (api_limit, api_remaining) {
            let used = limit.saturating_sub(remaining);
            let dl_used = match (dl_limit, dl_remaining) {
                (Some(l), Some(r)) => l.saturating_sub(r),
                _ => self.usage.usage(&self.name).await.downloads_used,
            };
            self.usage.update_usage(&self.name, used, dl_used).await;
            if remaining == 0 {
                warn!(indexer = %self.name, "API quota exhausted until daily reset");
            }
        }
    }
}

#[async_trait]
impl Indexer for NewznabClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<Item>, IndexerError> {
        self.raw_search(request).await
    }

    async fn download_nzb(&self, url: &str) -> Result<Bytes, IndexerError> {
        self.raw_download(url).await
    }

    async fn ping(&self) -> Result<(), IndexerError> {
        self.raw_ping().await
    }

    async fn usage(&self) -> Usage {
        self.usage.usage(&self.name).await
    }
}
