use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::config::IndexerConfig;
use crate::indexer::newznab::NewznabClient;
use crate::indexer::types::{Category, Item, SearchRequest};
use crate::indexer::{Indexer, IndexerError};
use crate::usage::{Usage, UsageManager};

/// NZBHydra2 meta-indexer. Speaks the same Newznab API; results carry the
/// real upstream indexer in response attributes.
pub struct HydraClient {
    inner: NewznabClient,
}

impl HydraClient {
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
                .attribute("hydraIndexerName")
                .map(str::to_string);
            item.actual_guid = item.attribute("hydraIndexerGuid").map(str::to_string);

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
impl Indexer for HydraClient {
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

    /// Find the same release through Hydra so the download is proxied
    /// instead of hitting the upstream indexer directly.
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
        debug!(title, "resolved direct URL through Hydra");
        Some(found.link)
    }
}

/// Meta-indexers sometimes round sizes; allow 1% drift.
pub(crate) fn sizes_match(a: u64, b: u64) -> bool {
    if a == b {
        return true;
    }
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    hi - lo <= hi / 100
}
