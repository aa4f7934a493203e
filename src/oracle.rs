use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

const ORACLE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("HTTP error")]
    Http(#[from] reqwest::Error),

    #[error("Oracle returned HTTP {0}")]
    Status(u16),
}

#[derive(Debug, Clone, Serialize)]
struct Report<'a> {
    nzb_id: &'a str,
    provider_url: &'a str,
    status: bool,
    indexer: &'a str,
    external_id: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSummary {
    pub provider_url: String,
    pub status: bool,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OracleStatus {
    pub nzb_id: String,
    #[serde(default)]
    pub summary: Vec<ProviderSummary>,
}

/// Outcome of the pre-download shortcut.
#[derive(Debug, Clone, Default)]
pub struct PreDownloadCheck {
    pub nzb_id: Option<String>,
    /// True iff one of *our* provider hosts is listed healthy.
    pub healthy: bool,
    pub last_updated: Option<DateTime<Utc>>,
    pub capable_provider: Option<String>,
}

/// Client for the community availability database. With no API key
/// configured every operation is a silent no-op / empty result.
pub struct OracleClient {
    base_url: Option<String>,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl OracleClient {
    pub fn new(base_url: Option<String>, api_key: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(ORACLE_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
            api_key,
            http,
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, None)
    }

    fn endpoint(&self) -> Option<(&str, &str)> {
        match (self.base_url.as_deref(), self.api_key.as_deref()) {
            (Some(url), Some(key)) => Some((url, key)),
            _ => None,
        }
    }

    pub async fn report_availability(
        &self,
        nzb_id: &str,
        provider_host: &str,
        ok: bool,
        indexer: &str,
        external_id: &str,
    ) -> Result<(), OracleError> {
        let Some((base, key)) = self.endpoint() else {
            return Ok(());
        };

        let response = self
            .http
            .post(format!("{base}/report"))
            .header("X-API-Key", key)
            .json(&Report {
                nzb_id,
                provider_url: provider_host,
                status: ok,
                indexer,
                external_id,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(OracleError::Status(response.status().as_u16()));
        }
        debug!(nzb_id, provider_host, ok, "availability reported");
        Ok(())
    }

    /// Fire-and-forget report; errors are only logged. Never holds any
    /// lock from the request path.
    pub fn spawn_report(
        self: &Arc<Self>,
        nzb_id: String,
        provider_host: String,
        ok: bool,
        indexer: String,
        external_id: String,
    ) {
        let oracle = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = oracle
                .report_availability(&nzb_id, &provider_host, ok, &indexer, &external_id)
                .await
            {
                warn!(nzb_id, error = %e, "availability report failed");
            }
        });
    }

    pub async fn get_status(&self, nzb_id: &str) -> Option<OracleStatus> {
        let (base, key) = self.endpoint()?;

        let response = self
            .http
            .get(format!("{base}/status/{nzb_id}"))
            .header("X-API-Key", key)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.json().await.ok()
    }

    /// Shortcut before the first NZB download: ask the oracle whether this
    /// release is already known healthy on one of our providers.
    pub async fn check_pre_download(
        &self,
        indexer: &str,
        external_id: &str,
        our_hosts: &[String],
    ) -> PreDownloadCheck {
        let Some((base, key)) = self.endpoint() else {
            return PreDownloadCheck::default();
        };

        let response = match self
            .http
            .get(format!("{base}/status/{external_id}"))
            .query(&[("indexer", indexer), ("external_id", external_id)])
            .header("X-API-Key", key)
            .send()
            .await
        {
            Ok(r) if r.status().is_success() => r,
            Ok(_) | Err(_) => return PreDownloadCheck::default(),
        };

        let Ok(status) = response.json::<OracleStatus>().await else {
            return PreDownloadCheck::default();
        };

        let mut check = PreDownloadCheck {
            nzb_id: Some(status.nzb_id),
            ..PreDownloadCheck::default()
        };

        for entry in &status.summary {
            check.last_updated = match (check.last_updated, entry.last_updated) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
            if entry.status && our_hosts.iter().any(|h| h == &entry.provider_url) {
                check.healthy = true;
                check.capable_provider = Some(entry.provider_url.clone());
            }
        }

        check
    }
}
