use std::time::Duration;

use config::{Config, Environment};
use derive_more::Constructor;
use serde::Deserialize;

/// One upstream Usenet provider. Owned by configuration; connection pools
/// are rebuilt from these records on reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provider {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub max_connections: usize,
    pub use_tls: bool,
    /// Lower number = tried first.
    pub priority: u8,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexerKind {
    Newznab,
    Hydra,
    Prowlarr,
}

#[derive(Debug, Clone, Constructor)]
pub struct IndexerConfig {
    pub name: String,
    pub url: String,
    pub api_key: String,
    pub kind: IndexerKind,
}

#[derive(Debug, Clone, Constructor)]
pub struct ProxyConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub auth_user: String,
    pub auth_pass: String,
}

/// Flat scalar settings pulled straight from the environment.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "defaults::addon_port")]
    pub addon_port: u16,
    #[serde(default = "defaults::addon_base_url")]
    pub addon_base_url: String,
    #[serde(default)]
    pub addon_security_token: Option<String>,
    #[serde(default)]
    pub log_level: Option<String>,

    #[serde(default = "defaults::cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,
    #[serde(default = "defaults::validation_sample_size")]
    pub validation_sample_size: usize,
    #[serde(default = "defaults::validation_threshold")]
    pub validation_threshold: f64,
    #[serde(default = "defaults::validation_max_providers")]
    pub validation_max_providers: usize,
    #[serde(default = "defaults::validation_max_per_provider")]
    pub validation_max_per_provider: usize,
    #[serde(default = "defaults::max_streams")]
    pub max_streams: usize,
    #[serde(default = "defaults::nzb_download_timeout_seconds")]
    pub nzb_download_timeout_seconds: u64,
    #[serde(default = "defaults::session_idle_ttl_seconds")]
    pub session_idle_ttl_seconds: u64,
    #[serde(default = "defaults::unavailable_video_url")]
    pub unavailable_video_url: String,
    #[serde(default = "defaults::data_dir")]
    pub data_dir: String,

    #[serde(default)]
    pub nzbcheck_url: Option<String>,
    #[serde(default)]
    pub nzbcheck_api_key: Option<String>,

    #[serde(default)]
    pub nntp_proxy_enabled: bool,
    #[serde(default = "defaults::nntp_proxy_host")]
    pub nntp_proxy_host: String,
    #[serde(default = "defaults::nntp_proxy_port")]
    pub nntp_proxy_port: u16,
    #[serde(default)]
    pub nntp_proxy_auth_user: String,
    #[serde(default)]
    pub nntp_proxy_auth_pass: String,
}

mod defaults {
    pub fn addon_port() -> u16 {
        7990
    }
    pub fn addon_base_url() -> String {
        "http://127.0.0.1:7990".to_string()
    }
    pub fn cache_ttl_seconds() -> u64 {
        86_400
    }
    pub fn validation_sample_size() -> usize {
        10
    }
    pub fn validation_threshold() -> f64 {
        1.0
    }
    pub fn validation_max_providers() -> usize {
        3
    }
    pub fn validation_max_per_provider() -> usize {
        4
    }
    pub fn max_streams() -> usize {
        6
    }
    pub fn nzb_download_timeout_seconds() -> u64 {
        30
    }
    pub fn session_idle_ttl_seconds() -> u64 {
        300
    }
    pub fn unavailable_video_url() -> String {
        "https://static.streamnzb.dev/unavailable.mp4".to_string()
    }
    pub fn data_dir() -> String {
        "./data".to_string()
    }
    pub fn nntp_proxy_host() -> String {
        "0.0.0.0".to_string()
    }
    pub fn nntp_proxy_port() -> u16 {
        1190
    }
}

impl Settings {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    pub fn nzb_download_timeout(&self) -> Duration {
        Duration::from_secs(self.nzb_download_timeout_seconds)
    }

    pub fn session_idle_ttl(&self) -> Duration {
        Duration::from_secs(self.session_idle_ttl_seconds)
    }
}

/// Everything bootstrap needs, assembled from the process environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub settings: Settings,
    pub providers: Vec<Provider>,
    pub indexers: Vec<IndexerConfig>,
    pub proxy: ProxyConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let settings: Settings = Config::builder()
            .add_source(Environment::default().try_parsing(true))
            .build()?
            .try_deserialize()?;

        let lookup = |key: &str| std::env::var(key).ok();
        let providers = scan_providers(&lookup)?;
        let indexers = scan_indexers(&lookup);

        let proxy = ProxyConfig {
            enabled: settings.nntp_proxy_enabled,
            host: settings.nntp_proxy_host.clone(),
            port: settings.nntp_proxy_port,
            auth_user: settings.nntp_proxy_auth_user.clone(),
            auth_pass: settings.nntp_proxy_auth_pass.clone(),
        };

        Ok(Self {
            settings,
            providers,
            indexers,
            proxy,
        })
    }
}

const MAX_INDEXED: usize = 32;

/// Collect `PROVIDER_i_*` records. A slot exists when its `HOST` is set;
/// malformed numeric fields abort startup rather than silently dropping a
/// provider.
pub fn scan_providers<F>(lookup: &F) -> Result<Vec<Provider>, config::ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut providers = Vec::new();

    for i in 0..MAX_INDEXED {
        let Some(host) = lookup(&format!("PROVIDER_{i}_HOST")) else {
            continue;
        };

        let field = |suffix: &str| lookup(&format!("PROVIDER_{i}_{suffix}"));
        fn parse_num<T: std::str::FromStr>(
            i: usize,
            suffix: &str,
            raw: String,
        ) -> Result<T, config::ConfigError> {
            raw.parse().map_err(|_| {
                config::ConfigError::Message(format!("PROVIDER_{i}_{suffix} is not a number: {raw}"))
            })
        }

        let port = match field("PORT") {
            Some(raw) => parse_num(i, "PORT", raw)?,
            None => 563,
        };
        let max_connections = match field("CONNECTIONS") {
            Some(raw) => parse_num(i, "CONNECTIONS", raw)?,
            None => 10,
        };
        let priority = match field("PRIORITY") {
            Some(raw) => parse_num(i, "PRIORITY", raw)?,
            None => i as u8,
        };

        providers.push(Provider {
            name: field("NAME").unwrap_or_else(|| host.clone()),
            host,
            port,
            username: field("USERNAME").unwrap_or_default(),
            password: field("PASSWORD").unwrap_or_default(),
            max_connections,
            use_tls: field("SSL").map(|v| parse_bool(&v)).unwrap_or(true),
            priority,
            enabled: field("ENABLED").map(|v| parse_bool(&v)).unwrap_or(true),
        });
    }

    providers.sort_by_key(|p| p.priority);
    Ok(providers)
}

/// Collect `INDEXER_i_*` Newznab entries plus the optional meta-indexers.
pub fn scan_indexers<F>(lookup: &F) -> Vec<IndexerConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut indexers = Vec::new();

    for i in 0..MAX_INDEXED {
        let Some(url) = lookup(&format!("INDEXER_{i}_URL")) else {
            continue;
        };

        indexers.push(IndexerConfig {
            name: lookup(&format!("INDEXER_{i}_NAME")).unwrap_or_else(|| format!("indexer-{i}")),
            api_key: lookup(&format!("INDEXER_{i}_API_KEY")).unwrap_or_default(),
            url,
            kind: IndexerKind::Newznab,
        });
    }

    if let Some(url) = lookup("NZBHYDRA2_URL") {
        indexers.push(IndexerConfig {
            name: "NZBHydra2".to_string(),
            api_key: lookup("NZBHYDRA2_API_KEY").unwrap_or_default(),
            url,
            kind: IndexerKind::Hydra,
        });
    }

    if let Some(url) = lookup("PROWLARR_URL") {
        indexers.push(IndexerConfig {
            name: "Prowlarr".to_string(),
            api_key: lookup("PROWLARR_API_KEY").unwrap_or_default(),
            url,
            kind: IndexerKind::Prowlarr,
        });
    }

    indexers
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn providers_scanned_and_sorted_by_priority() {
        let vars = env(&[
            ("PROVIDER_0_HOST", "news.slow.com"),
            ("PROVIDER_0_PRIORITY", "5"),
            ("PROVIDER_1_HOST", "news.fast.com"),
            ("PROVIDER_1_PRIORITY", "1"),
            ("PROVIDER_1_CONNECTIONS", "30"),
            ("PROVIDER_1_SSL", "false"),
        ]);
        let providers = scan_providers(&|k| vars.get(k).cloned()).unwrap();

        assert_eq!(providers.len(), 2);
        assert_eq!(providers[0].host, "news.fast.com");
        assert_eq!(providers[0].max_connections, 30);
        assert!(!providers[0].use_tls);
        assert_eq!(providers[1].host, "news.slow.com");
        assert_eq!(providers[1].port, 563);
    }

    #[test]
    fn provider_bad_port_is_config_error() {
        let vars = env(&[("PROVIDER_0_HOST", "x"), ("PROVIDER_0_PORT", "nope")]);
        assert!(scan_providers(&|k| vars.get(k).cloned()).is_err());
    }

    #[test]
    fn indexers_include_meta_backends() {
        let vars = env(&[
            ("INDEXER_0_NAME", "nzbgeek"),
            ("INDEXER_0_URL", "https://api.nzbgeek.info"),
            ("INDEXER_0_API_KEY", "k"),
            ("PROWLARR_URL", "http://localhost:9696"),
            ("PROWLARR_API_KEY", "pk"),
        ]);
        let indexers = scan_indexers(&|k| vars.get(k).cloned());

        assert_eq!(indexers.len(), 2);
        assert_eq!(indexers[0].kind, IndexerKind::Newznab);
        assert_eq!(indexers[1].kind, IndexerKind::Prowlarr);
        assert_eq!(indexers[1].name, "Prowlarr");
    }

    #[test]
    fn gaps_in_indices_are_allowed() {
        let vars = env(&[("PROVIDER_3_HOST", "news.only.com")]);
        let providers = scan_providers(&|k| vars.get(k).cloned()).unwrap();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].name, "news.only.com");
    }
}
