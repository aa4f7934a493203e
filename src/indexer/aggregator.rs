use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::indexer::types::{Item, SearchRequest};
use crate::indexer::{Indexer, IndexerError};

const FANOUT_DEADLINE: Duration = Duration::from_secs(30);

/// Parallel multi-indexer search with deduplication and size-sorted merge.
pub struct Aggregator {
    indexers: Vec<Arc<dyn Indexer>>,
}

impl Aggregator {
    pub fn new(indexers: Vec<Arc<dyn Indexer>>) -> Self {
        Self { indexers }
    }

    pub fn indexers(&self) -> &[Arc<dyn Indexer>] {
        &self.indexers
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<dyn Indexer>> {
        self.indexers
            .iter()
            .find(|i| i.name() == name)
            .map(Arc::clone)
    }

    /// Fan out to every configured indexer under a shared deadline.
    /// Per-indexer failures degrade to empty results; the call errors only
    /// when every indexer failed.
    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<Item>, IndexerError> {
        if self.indexers.is_empty() {
            return Ok(Vec::new());
        }

        let searches = self.indexers.iter().map(|indexer| {
            let indexer = Arc::clone(indexer);
            async move {
                match timeout(FANOUT_DEADLINE, indexer.search(request)).await {
                    Ok(Ok(items)) => {
                        debug!(indexer = indexer.name(), items = items.len(), "search ok");
                        Some(items)
                    }
                    Ok(Err(e)) => {
                        warn!(indexer = indexer.name(), error = %e, "search failed");
                        None
                    }
                    Err(_) => {
                        warn!(indexer = indexer.name(), "search timed out");
                        None
                    }
                }
            }
        });

        let results = futures::future::join_all(searches).await;

        let responded = results.iter().filter(|r| r.is_some()).count();
        if responded == 0 {
            return Err(IndexerError::AllFailed);
        }

        let mut merged = dedup(results.into_iter().flatten().flatten().collect());
        merged.sort_by(|a, b| b.size.cmp(&a.size));
        Ok(merged)
    }
}

/// Three-tier cascade, first match wins: guid, normalized link,
/// normalized-title + size (only when size is known).
fn dedup(items: Vec<Item>) -> Vec<Item> {
    let mut seen_guids: HashSet<String> = HashSet::new();
    let mut seen_links: HashSet<String> = HashSet::new();
    let mut seen_title_size: HashSet<(String, u64)> = HashSet::new();
    let mut out = Vec::with_capacity(items.len());

    for item in items {
        if !item.guid.is_empty() && !seen_guids.insert(item.guid.clone()) {
            continue;
        }
        let link = normalize_link(&item.link);
        if !link.is_empty() && !seen_links.insert(link) {
            continue;
        }
        if item.size > 0 && !seen_title_size.insert((normalize_title(&item.title), item.size)) {
            continue;
        }
        out.push(item);
    }

    out
}

/// scheme + host + path, lowercased; query strings (api keys) ignored.
fn normalize_link(link: &str) -> String {
    match reqwest::Url::parse(link) {
        Ok(url) => format!(
            "{}://{}{}",
            url.scheme(),
            url.host_str().unwrap_or(""),
            url.path()
        )
        .to_lowercase(),
        Err(_) => link.to_lowercase(),
    }
}

fn normalize_title(title: &str) -> String {
    title
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase()
}
