use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use rand::seq::SliceRandom;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::nntp::ArticleSource;
use crate::nzb::Nzb;

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub provider_host: String,
    pub provider_priority: u8,
    pub ok: bool,
    pub sample_missing: usize,
    pub sample_size: usize,
    pub elapsed: Duration,
}

impl ValidationResult {
    pub fn hits(&self) -> usize {
        self.sample_size - self.sample_missing
    }
}

#[derive(Debug, Clone)]
pub struct ValidationConfig {
    pub sample_size: usize,
    /// Fraction of the sample that must be present; 1.0 = strict.
    pub threshold: f64,
    pub max_providers: usize,
    pub max_per_provider: usize,
    pub cache_ttl: Duration,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            sample_size: 10,
            threshold: 1.0,
            max_providers: 3,
            max_per_provider: 4,
            cache_ttl: Duration::from_secs(86_400),
        }
    }
}

/// Sample-based article-existence checks across the provider pools, with a
/// TTL cache keyed by NZB content hash.
pub struct ValidationChecker {
    sources: RwLock<Vec<Arc<dyn ArticleSource>>>,
    config: ValidationConfig,
    cache: moka::future::Cache<String, Arc<Vec<ValidationResult>>>,
}

impl ValidationChecker {
    pub fn new(sources: Vec<Arc<dyn ArticleSource>>, config: ValidationConfig) -> Self {
        let cache = moka::future::Cache::builder()
            .max_capacity(10_000)
            .time_to_live(config.cache_ttl)
            .build();
        Self {
            sources: RwLock::new(Self::prepare(sources)),
            config,
            cache,
        }
    }

    fn prepare(mut sources: Vec<Arc<dyn ArticleSource>>) -> Vec<Arc<dyn ArticleSource>> {
        sources.retain(|s| s.enabled());
        sources.sort_by_key(|s| s.priority());
        sources
    }

    /// Swap the provider list on config reload.
    pub async fn update_sources(&self, sources: Vec<Arc<dyn ArticleSource>>) {
        *self.sources.write().await = Self::prepare(sources);
    }

    /// Probe every enabled provider with a random article sample. Cached by
    /// `nzb.hash()` until the TTL runs out or playback invalidates it.
    pub async fn validate_nzb(&self, nzb: &Nzb) -> Vec<ValidationResult> {
        let key = nzb.hash();
        if let Some(cached) = self.cache.get(&key).await {
            debug!(nzb = %key, "validation cache hit");
            return cached.as_ref().clone();
        }

        let mut ids: Vec<String> = nzb.message_ids().map(str::to_string).collect();
        let sample_size = self.config.sample_size.min(ids.len());
        ids.shuffle(&mut rand::thread_rng());
        ids.truncate(sample_size);
        let sample = Arc::new(ids);

        let sources = self.sources.read().await.clone();
        let per_provider = self.config.max_per_provider.max(1);

        let threshold = self.config.threshold;
        let mut probes = Vec::new();
        for source in sources.into_iter() {
            let sample = Arc::clone(&sample);
            probes.push(async move { probe_provider(source, &sample, threshold, per_provider).await });
        }
        let results: Vec<ValidationResult> = futures::stream::iter(probes)
            .buffer_unordered(self.config.max_providers.max(1))
            .collect()
            .await;

        info!(
            nzb = %key,
            providers = results.len(),
            ok = results.iter().filter(|r| r.ok).count(),
            "validation complete"
        );

        self.cache.insert(key, Arc::new(results.clone())).await;
        results
    }

    /// Drop a cached verdict after a structural playback failure.
    pub async fn invalidate(&self, nzb_hash: &str) {
        self.cache.invalidate(nzb_hash).await;
    }

    /// Deterministic winner: most present samples, then lowest latency,
    /// then lowest provider priority number. `None` when nothing passed.
    pub fn best_provider(results: &[ValidationResult]) -> Option<&ValidationResult> {
        results.iter().filter(|r| r.ok).min_by(|a, b| {
            b.hits()
                .cmp(&a.hits())
                .then(a.elapsed.cmp(&b.elapsed))
                .then(a.provider_priority.cmp(&b.provider_priority))
        })
    }
}

async fn probe_provider(
    source: Arc<dyn ArticleSource>,
    sample: &[String],
    threshold: f64,
    max_concurrent: usize,
) -> ValidationResult {
    let started = Instant::now();

    let hits: usize = futures::stream::iter(sample.iter().map(|id| {
        let source = Arc::clone(&source);
        async move {
            match source.stat(id).await {
                Ok(found) => usize::from(found),
                Err(e) => {
                    warn!(host = source.host(), %id, error = %e, "STAT failed");
                    0
                }
            }
        }
    }))
    .buffer_unordered(max_concurrent)
    .fold(0usize, |acc, hit| async move { acc + hit })
    .await;

    let sample_size = sample.len();
    let needed = (sample_size as f64 * threshold).ceil() as usize;

    ValidationResult {
        provider_host: source.host().to_string(),
        provider_priority: source.priority(),
        ok: sample_size > 0 && hits >= needed,
        sample_missing: sample_size - hits,
        sample_size,
        elapsed: started.elapsed(),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::nntp::NntpError;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fake provider with a fixed set of present articles.
    pub struct FakeSource {
        pub host: String,
        pub priority: u8,
        pub present: HashSet<String>,
        pub stat_calls: AtomicUsize,
    }

    impl FakeSource {
        pub fn new(host: &str, priority: u8, present: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                host: host.to_string(),
                priority,
                present: present.iter().map(|s| s.to_string()).collect(),
                stat_calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ArticleSource for FakeSource {
        fn host(&self) -> &str {
            &self.host
        }

        fn priority(&self) -> u8 {
            self.priority
        }

        fn enabled(&self) -> bool {
            true
        }

        async fn stat(&self, message_id: &str) -> Result<bool, NntpError> {
            self.stat_calls.fetch_add(1, Ordering::Relaxed);
            Ok(self.present.contains(message_id))
        }

        async fn body(&self, message_id: &str) -> Result<Bytes, NntpError> {
            Err(NntpError::ArticleMissing(message_id.to_string()))
        }

        async fn article(&self, message_id: &str) -> Result<Bytes, NntpError> {
            Err(NntpError::ArticleMissing(message_id.to_string()))
        }

        async fn head(&self, message_id: &str) -> Result<Bytes, NntpError> {
            Err(NntpError::ArticleMissing(message_id.to_string()))
        }

        async fn group(&self, name: &str) -> Result<String, NntpError> {
            Err(NntpError::ArticleMissing(name.to_string()))
        }
    }
}
