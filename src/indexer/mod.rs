pub mod aggregator;
pub mod hydra;
pub mod newznab;
pub mod prowlarr;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::config::{IndexerConfig, IndexerKind};
use crate::usage::{Usage, UsageManager};

pub use aggregator::Aggregator;
pub use types::{Category, Item, SearchRequest, parse_search_response};

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("HTTP error")]
    Http(#[from] reqwest::Error),

    #[error("{indexer} returned HTTP {code}")]
    Status { indexer: String, code: u16 },

    #[error("Daily limit reached for {0}")]
    LimitReached(String),

    #[error("Indexer response parse error: {0}")]
    Parse(String),

    #[error("No indexer responded")]
    AllFailed,
}

/// The capability set every search backend implements.
#[async_trait]
pub trait Indexer: Send + Sync {
    fn name(&self) -> &str;

    async fn search(&self, request: &SearchRequest) -> Result<Vec<Item>, IndexerError>;

    async fn download_nzb(&self, url: &str) -> Result<Bytes, IndexerError>;

    async fn ping(&self) -> Result<(), IndexerError>;

    async fn usage(&self) -> Usage;

    /// Optional: re-route a direct indexer download URL through this
    /// backend (meta-indexers only). `None` when unsupported or when no
    /// matching release is found.
    async fn resolve_download_url(
        &self,
        _direct_url: &str,
        _title: &str,
        _size: u64,
        _category: Category,
    ) -> Option<String> {
        None
    }
}

/// Instantiate the configured backend.
pub fn build_indexer(
    config: &IndexerConfig,
    usage: Arc<UsageManager>,
    download_timeout: std::time::Duration,
) -> Arc<dyn Indexer> {
    match config.kind {
        IndexerKind::Newznab => Arc::new(newznab::NewznabClient::new(
            config,
            usage,
            download_timeout,
        )),
        IndexerKind::Hydra => Arc::new(hydra::HydraClient::new(config, usage, download_timeout)),
        IndexerKind::Prowlarr => Arc::new(prowlarr::ProwlarrClient::new(
            config,
            usage,
            download_timeout,
        )),
    }
}
