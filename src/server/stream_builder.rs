use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::indexer::{Category, Item};
use crate::nzb::NzbParser;
use crate::server::AppState;
use crate::session::Session;
use crate::triage::Candidate;
use crate::validation::ValidationChecker;

/// Bounded concurrency for per-candidate validation work.
pub const VALIDATION_CONCURRENCY: usize = 6;

/// A negative oracle verdict younger than this rejects the candidate.
const NEGATIVE_REPORT_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone, Serialize)]
pub struct BehaviorHints {
    #[serde(rename = "bingeGroup")]
    pub binge_group: String,
    #[serde(rename = "videoSize")]
    pub video_size: u64,
    pub filename: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamEntry {
    pub url: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "behaviorHints")]
    pub behavior_hints: BehaviorHints,
}

/// Validate candidates with bounded concurrency until `max_streams`
/// sessions exist, then cancel the stragglers. Per-candidate failures are
/// logged and swallowed; the result is the successful subset sorted by
/// display quality.
pub async fn build_streams(
    state: &AppState,
    candidates: Vec<Candidate>,
    category: Category,
) -> Vec<StreamEntry> {
    let max_streams = state.settings.max_streams.max(1);
    let semaphore = Arc::new(Semaphore::new(VALIDATION_CONCURRENCY));
    let cancel = CancellationToken::new();
    let validated = Arc::new(AtomicUsize::new(0));

    let mut tasks = JoinSet::new();
    for candidate in candidates {
        let state = state.clone();
        let semaphore = Arc::clone(&semaphore);
        let cancel = cancel.clone();
        let validated = Arc::clone(&validated);

        tasks.spawn(async move {
            let _permit = tokio::select! {
                _ = cancel.cancelled() => return None,
                permit = semaphore.acquire_owned() => permit.ok()?,
            };
            if cancel.is_cancelled() {
                return None;
            }

            let result =
                Box::pin(process_candidate(state.clone(), candidate.clone(), cancel.clone())).await;
            if result.is_some() && validated.fetch_add(1, Ordering::SeqCst) + 1 >= max_streams {
                cancel.cancel();
            }
            result.map(|session| (session, candidate))
        });
    }

    let mut successes: Vec<(Arc<Session>, Candidate)> = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        if let Ok(Some(success)) = joined {
            successes.push(success);
        }
    }

    successes.sort_by_key(|(_, c)| std::cmp::Reverse(display_quality_score(&c.item.title)));
    successes.truncate(max_streams);

    successes
        .into_iter()
        .map(|(session, candidate)| stream_entry(&state.settings, &session, &candidate, category))
        .collect()
}

/// One candidate through the oracle shortcut or the immediate
/// download-and-validate path. `None` means rejected or failed; failures
/// this deep never surface to the HTTP response.
async fn process_candidate(
    state: AppState,
    candidate: Candidate,
    cancel: CancellationToken,
) -> Option<Arc<Session>> {
    let title = candidate.item.title.clone();
    let link = candidate.item.link.clone();
    let source_indexer = candidate.item.source_indexer.clone();
    let indexer_name = oracle_indexer_name(&candidate.item);
    let guid = candidate.item.effective_guid().to_string();

    // Pre-download shortcut against the community oracle.
    let hosts = state.provider_hosts().await;
    let check = state
        .oracle
        .check_pre_download(&indexer_name, &guid, &hosts)
        .await;

    if check.healthy {
        debug!(title = %title, provider = ?check.capable_provider, "oracle shortcut, deferring NZB download");
        let session = state
            .sessions
            .create_deferred_session(link, indexer_name, title, source_indexer, guid)
            .await;
        return Some(session);
    }

    if !check.healthy && check.nzb_id.is_some() {
        if let Some(updated) = check.last_updated {
            if Utc::now() - updated <= chrono::Duration::hours(NEGATIVE_REPORT_WINDOW_HOURS) {
                debug!(title = %title, "oracle reports unhealthy, rejecting");
                return None;
            }
        }
    }

    // Immediate path: download, parse, validate.
    let indexer = match state.aggregator.by_name(&source_indexer) {
        Some(indexer) => indexer,
        None => {
            warn!(indexer = %source_indexer, "item references unknown indexer");
            return None;
        }
    };

    let download_fut = indexer.download_nzb(&link);
    let bytes = tokio::select! {
        _ = cancel.cancelled() => return None,
        result = download_fut => match result {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(title = %title, error = %e, "NZB download failed");
                return None;
            }
        },
    };

    let nzb = match NzbParser::parse(Cursor::new(&bytes[..])) {
        Ok(nzb) => nzb,
        Err(e) => {
            debug!(title = %title, error = %e, "NZB parse failed");
            return None;
        }
    };

    let validate_fut = state.validator.validate_nzb(&nzb);
    let results = tokio::select! {
        _ = cancel.cancelled() => return None,
        results = validate_fut => results,
    };

    let best = match ValidationChecker::best_provider(&results) {
        Some(best) => best.clone(),
        None => {
            debug!(title = %title, "no provider passed validation");
            return None;
        }
    };

    // Positive report only after a successful validation; cancelled work
    // never publishes.
    state.oracle.spawn_report(
        nzb.oracle_id(),
        best.provider_host.clone(),
        true,
        indexer_name.clone(),
        guid.clone(),
    );

    let session = state
        .sessions
        .create_session(nzb, guid, indexer_name, title)
        .await;
    Some(session)
}

/// Indexer name for oracle bookkeeping: the meta-indexer's attributed
/// upstream when present, else the source backend with any
/// `"Prowlarr: "` display prefix stripped.
fn oracle_indexer_name(item: &Item) -> String {
    let name = item.effective_indexer();
    name.strip_prefix("Prowlarr: ").unwrap_or(name).to_string()
}

fn stream_entry(
    settings: &Settings,
    session: &Session,
    candidate: &Candidate,
    _category: Category,
) -> StreamEntry {
    let bucket = candidate.resolution_bucket.as_str();
    let size_gb = candidate.item.size as f64 / 1_073_741_824.0;

    StreamEntry {
        url: play_url(settings, &session.id),
        name: format!("StreamNZB\n{bucket}"),
        description: format!(
            "{}\n{:.1} GB | {}",
            candidate.item.title, size_gb, session.indexer_name
        ),
        behavior_hints: BehaviorHints {
            binge_group: format!("streamnzb-{bucket}"),
            video_size: candidate.item.size,
            filename: candidate.item.title.clone(),
        },
    }
}

pub fn play_url(settings: &Settings, session_id: &str) -> String {
    let base = settings.addon_base_url.trim_end_matches('/');
    match settings.addon_security_token.as_deref() {
        Some(token) if !token.is_empty() => format!("{base}/{token}/play/{session_id}"),
        _ => format!("{base}/play/{session_id}"),
    }
}

/// Ordering for the final stream list: resolution beats source tier beats
/// HDR beats Atmos.
pub(crate) fn display_quality_score(title: &str) -> i64 {
    let t = title.to_lowercase();

    let resolution = if t.contains("2160") || t.contains("4k") {
        4
    } else if t.contains("1080") {
        3
    } else if t.contains("720") {
        2
    } else {
        1
    };

    let source = if t.contains("remux") {
        5
    } else if t.contains("bluray") || t.contains("blu-ray") {
        4
    } else if t.contains("web-dl") || t.contains("webdl") {
        3
    } else if t.contains("webrip") {
        2
    } else if t.contains("hdtv") {
        1
    } else {
        0
    };

    static DV_RE: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
        regex::Regex::new(r"\b(dv|dovi)\b|dolby[ .]vision").unwrap()
    });
    let hdr = if DV_RE.is_match(&t) {
        3
    } else if t.contains("hdr10+") {
        2
    } else if t.contains("hdr") {
        1
    } else {
        0
    };

    let atmos = i64::from(t.contains("atmos"));

    resolution * 1000 + source * 100 + hdr * 10 + atmos
}
