use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::config::IndexerConfig;
use crate::indexer::hydra::sizes_match;
use crate::indexer::newznab::NewznabClient;
use crate::indexer::types::{Category, Item, SearchRequest};
use crate::indexer::{Indexer, IndexerError};
use crate::usage::{Usage, UsageManager};

/// Prowlarr meta-indexer, consumed through its Newznab-compatible
/// endpoint (the configured URL points at it). Downstream display names
/// carry a `"Prowlarr: "` prefix which the stream pipeline strips for
/// oracle bookkeeping.
pub struct ProwlarrClient {
    inner: NewznabClient,
}

impl ProwlarrClient {
    pub fn new(
        config: &IndexerConfig,
        usage: Arc<UsageManager>,
        download_timeout: Duration,
    ) -> Self {
        Self {
            inner: NewznabClient::new(config, usage, download_timeout),
        }
    }

    async fn attribute_items(&self, mut items: Vec<Item>) -> Vec<Item> {
        for item in items.iter_mut() {
            item.actual_indexer = item
                .attribute("prowlarrindexer")
                .or_else(|| item.attribute("indexer"))
                .map(str::to_string);
            // Prowlarr does not expose the upstream guid; the oracle key
            // falls back to the item guid.
            item.actual_guid = None;

            if let Some(sub) = &item.actual_indexer {
                self.inner
                    .usage_manager()
                    .touch(&format!("{}: {}", self.inner.base_name(), sub))
                    .await;
            }
        }
        items
    }
}

#[async_trait]
impl Indexer for ProwlarrClient {
    fn name(&self) -> &str {
        self.inner.base_name()
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<Item>, IndexerError> {
        let items = self.inner.raw_search(request).await?;
        Ok(self.attribute_items(items).await)
    }

    async fn download_nzb(&self, url: &str) -> Result<Bytes, IndexerError> {
        self.inner.raw_download(url).await
    }

    async fn ping(&self) -> Result<(), IndexerError> {
        self.inner.raw_ping().await
    }

    async fn usage(&self) -> Usage {
        self.inner.usage().await
    }

    async fn resolve_download_url(
        &self,
        _direct_url: &str,
        title: &str,
        size: u64,
        category: Category,
    ) -> Option<String> {
        let request = SearchRequest {
            query: title.to_string(),
            category,
            limit: 50,
            ..SearchRequest::default()
        };
        let items = self.inner.raw_search(&request).await.ok()?;
        let found = items
            .into_iter()
            .find(|item| item.title == title && sizes_match(item.size, size))?;
        debug!(title, "resolved direct URL through Prowlarr");
        Some(found.link)
    }
}
