use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::state::StateManager;

const INDEXER_USAGE_KEY: &str = "indexer_usage";
const PROVIDER_USAGE_KEY: &str = "provider_usage";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Host-local date of the last daily reset, `YYYY-MM-DD`.
    pub last_reset_day: String,
    pub api_hits_limit: Option<u64>,
    pub api_hits_used: u64,
    pub downloads_limit: Option<u64>,
    pub downloads_used: u64,
    pub all_time_api_hits: u64,
    pub all_time_downloads: u64,
}

impl UsageRecord {
    fn new(today: &str) -> Self {
        Self {
            last_reset_day: today.to_string(),
            api_hits_limit: None,
            api_hits_used: 0,
            downloads_limit: None,
            downloads_used: 0,
            all_time_api_hits: 0,
            all_time_downloads: 0,
        }
    }

    /// On a day change, daily counters roll into the all-time totals.
    fn rollover(&mut self, today: &str) {
        if self.last_reset_day != today {
            self.all_time_api_hits += self.api_hits_used;
            self.all_time_downloads += self.downloads_used;
            self.api_hits_used = 0;
            self.downloads_used = 0;
            self.last_reset_day = today.to_string();
        }
    }
}

/// Point-in-time view handed to callers.
#[derive(Debug, Clone, Serialize)]
pub struct Usage {
    pub api_hits_limit: Option<u64>,
    pub api_hits_used: u64,
    pub api_hits_remaining: Option<i64>,
    pub downloads_limit: Option<u64>,
    pub downloads_used: u64,
    pub downloads_remaining: Option<i64>,
    pub all_time_api_hits: u64,
    pub all_time_downloads: u64,
}

impl From<&UsageRecord> for Usage {
    fn from(r: &UsageRecord) -> Self {
        let remaining =
            |limit: Option<u64>, used: u64| limit.map(|l| l as i64 - used as i64);
        Self {
            api_hits_limit: r.api_hits_limit,
            api_hits_used: r.api_hits_used,
            api_hits_remaining: remaining(r.api_hits_limit, r.api_hits_used),
            downloads_limit: r.downloads_limit,
            downloads_used: r.downloads_used,
            downloads_remaining: remaining(r.downloads_limit, r.downloads_used),
            all_time_api_hits: r.all_time_api_hits,
            all_time_downloads: r.all_time_downloads,
        }
    }
}

/// Daily-reset counters per indexer (and provider), persisted through the
/// state manager.
pub struct UsageManager {
    state: Arc<StateManager>,
    indexers: RwLock<HashMap<String, UsageRecord>>,
    providers: RwLock<HashMap<String, UsageRecord>>,
}

fn today_string() -> String {
    format_day(Local::now().date_naive())
}

fn format_day(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

impl UsageManager {
    pub async fn load(state: Arc<StateManager>) -> Self {
        let indexers: HashMap<String, UsageRecord> =
            state.get(INDEXER_USAGE_KEY).await.unwrap_or_default();
        let providers: HashMap<String, UsageRecord> =
            state.get(PROVIDER_USAGE_KEY).await.unwrap_or_default();
        debug!(
            indexers = indexers.len(),
            providers = providers.len(),
            "usage tables loaded"
        );
        Self {
            state,
            indexers: RwLock::new(indexers),
            providers: RwLock::new(providers),
        }
    }

    /// Increment daily and all-time counters.
    pub async fn increment_used(&self, name: &str, d_hits: u64, d_downloads: u64) {
        self.increment_used_on(name, d_hits, d_downloads, &today_string())
            .await;
        self.persist_indexers().await;
    }

    pub(crate) async fn increment_used_on(
        &self,
        name: &str,
        d_hits: u64,
        d_downloads: u64,
        today: &str,
    ) {
        let mut table = self.indexers.write().await;
        let record = table
            .entry(name.to_string())
            .or_insert_with(|| UsageRecord::new(today));
        record.rollover(today);
        record.api_hits_used += d_hits;
        record.downloads_used += d_downloads;
        record.all_time_api_hits += d_hits;
        record.all_time_downloads += d_downloads;
    }

    /// Ensure a record exists (used for `"<parent>: <sub>"` children seen
    /// in meta-indexer results).
    pub async fn touch(&self, name: &str) {
        self.increment_used_on(name, 0, 0, &today_string()).await;
        self.persist_indexers().await;
    }

    /// Absolute daily-used values, as reported by indexer limit headers.
    pub async fn update_usage(&self, name: &str, abs_hits: u64, abs_downloads: u64) {
        let today = today_string();
        {
            let mut table = self.indexers.write().await;
            let record = table
                .entry(name.to_string())
                .or_insert_with(|| UsageRecord::new(&today));
            record.rollover(&today);
            record.api_hits_used = abs_hits;
            record.downloads_used = abs_downloads;
        }
        self.persist_indexers().await;
    }

    pub async fn set_limits(
        &self,
        name: &str,
        api_limit: Option<u64>,
        download_limit: Option<u64>,
    ) {
        let today = today_string();
        {
            let mut table = self.indexers.write().await;
            let record = table
                .entry(name.to_string())
                .or_insert_with(|| UsageRecord::new(&today));
            record.rollover(&today);
            if api_limit.is_some() {
                record.api_hits_limit = api_limit;
            }
            if download_limit.is_some() {
                record.downloads_limit = download_limit;
            }
        }
        self.persist_indexers().await;
    }

    pub async fn usage(&self, name: &str) -> Usage {
        let today = today_string();
        let mut table = self.indexers.write().await;
        let record = table
            .entry(name.to_string())
            .or_insert_with(|| UsageRecord::new(&today));
        record.rollover(&today);
        Usage::from(&*record)
    }

    /// True when the daily API quota is known to be exhausted.
    pub async fn api_limit_reached(&self, name: &str) -> bool {
        self.usage(name)
            .await
            .api_hits_remaining
            .is_some_and(|r| r <= 0)
    }

    pub async fn download_limit_reached(&self, name: &str) -> bool {
        self.usage(name)
            .await
            .downloads_remaining
            .is_some_and(|r| r <= 0)
    }

    /// Drop records whose name is neither an active indexer nor a
    /// `"<parent>: <sub>"` child of one.
    pub async fn sync_usage(&self, active: &[String]) {
        {
            let mut table = self.indexers.write().await;
            table.retain(|name, _| {
                active.iter().any(|a| {
                    name == a
                        || name
                            .strip_prefix(a.as_str())
                            .is_some_and(|rest| rest.starts_with(": "))
                })
            });
        }
        self.persist_indexers().await;
    }

    /// Provider-side byte/article accounting, keyed by host.
    pub async fn record_provider_articles(&self, host: &str, articles: u64) {
        let today = today_string();
        {
            let mut table = self.providers.write().await;
            let record = table
                .entry(host.to_string())
                .or_insert_with(|| UsageRecord::new(&today));
            record.rollover(&today);
            record.downloads_used += articles;
            record.all_time_downloads += articles;
        }
        if let Err(e) = self
            .state
            .set(PROVIDER_USAGE_KEY, &*self.providers.read().await)
            .await
        {
            warn!("Failed to persist provider usage: {e}");
        }
    }

    async fn persist_indexers(&self) {
        let table = self.indexers.read().await;
        if let Err(e) = self.state.set(INDEXER_USAGE_KEY, &*table).await {
            warn!("Failed to persist indexer usage: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn manager(dir: &TempDir) -> UsageManager {
        let state = Arc::new(StateManager::open(dir.path()).await.unwrap());
        UsageManager::load(state).await
    }

    #[tokio::test]
    async fn daily_rollover_preserves_all_time() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir).await;

        m.increment_used_on("nzbgeek", 5, 2, "2026-07-31").await;
        // Observed just before midnight.
        {
            let table = m.indexers.read().await;
            let r = &table["nzbgeek"];
            assert_eq!(r.api_hits_used, 5);
            assert_eq!(r.all_time_api_hits, 5);
        }

        // First hit of the next day resets dailies, keeps totals.
        m.increment_used_on("nzbgeek", 1, 0, "2026-08-01").await;
        let table = m.indexers.read().await;
        let r = &table["nzbgeek"];
        assert_eq!(r.api_hits_used, 1);
        assert_eq!(r.downloads_used, 0);
        assert_eq!(r.all_time_api_hits, 6);
        assert_eq!(r.all_time_downloads, 2);
        assert_eq!(r.last_reset_day, "2026-08-01");
    }

    #[tokio::test]
    async fn limit_reached_uses_remaining() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir).await;

        m.set_limits("geek", Some(2), None).await;
        assert!(!m.api_limit_reached("geek").await);

        m.increment_used("geek", 2, 0).await;
        assert!(m.api_limit_reached("geek").await);
        assert!(!m.download_limit_reached("geek").await);
    }

    #[tokio::test]
    async fn sync_keeps_children() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir).await;

        m.increment_used("Prowlarr", 1, 0).await;
        m.increment_used("Prowlarr: nzbgeek", 1, 0).await;
        m.increment_used("stale", 1, 0).await;

        m.sync_usage(&["Prowlarr".to_string()]).await;

        let table = m.indexers.read().await;
        assert!(table.contains_key("Prowlarr"));
        assert!(table.contains_key("Prowlarr: nzbgeek"));
        assert!(!table.contains_key("stale"));
    }

    #[tokio::test]
    async fn usage_persists_across_reload() {
        let dir = TempDir::new().unwrap();
        {
            let m = manager(&dir).await;
            m.increment_used("geek", 3, 1).await;
        }
        let m = manager(&dir).await;
        let usage = m.usage("geek").await;
        assert_eq!(usage.api_hits_used, 3);
        assert_eq!(usage.downloads_used, 1);
    }
}
