pub mod config;
pub mod title;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::indexer::Item;

pub use config::{FilterConfig, WeightConfig};
pub use title::{ParsedTitle, parse_release_title};

pub const PREFERRED_GROUP_BOOST: i64 = 1000;

const CAM_KEYWORDS: &[&str] = &["cam", "camrip", "hdcam", "telesync", "hdts", "telecine"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionBucket {
    FourK,
    P1080,
    P720,
    Sd,
}

impl ResolutionBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionBucket::FourK => "4k",
            ResolutionBucket::P1080 => "1080p",
            ResolutionBucket::P720 => "720p",
            ResolutionBucket::Sd => "sd",
        }
    }

    fn from_resolution(resolution: &str) -> Self {
        let r = resolution.to_lowercase();
        if r.contains("2160") || r.contains("4k") {
            ResolutionBucket::FourK
        } else if r.contains("1080") {
            ResolutionBucket::P1080
        } else if r.contains("720") {
            ResolutionBucket::P720
        } else {
            ResolutionBucket::Sd
        }
    }
}

/// An item that passed all filters, with its parsed metadata and score.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub item: Item,
    pub parsed: ParsedTitle,
    pub resolution_bucket: ResolutionBucket,
    pub score: i64,
}

/// Filter + score + dedup pipeline over raw indexer items.
pub struct TriageService {
    filters: FilterConfig,
    weights: WeightConfig,
}

impl TriageService {
    pub fn new(filters: FilterConfig, weights: WeightConfig) -> Self {
        Self { filters, weights }
    }

    /// Returns surviving candidates, highest score first.
    pub fn filter(&self, items: Vec<Item>, now: DateTime<Utc>) -> Vec<Candidate> {
        let total = items.len();
        let mut best: HashMap<String, Candidate> = HashMap::new();

        for item in items {
            let parsed = parse_release_title(&item.title);
            if !self.passes(&item, &parsed) {
                continue;
            }

            let resolution_bucket = ResolutionBucket::from_resolution(&parsed.resolution);
            let score = self.score(&item, &parsed, resolution_bucket, now);
            let candidate = Candidate {
                item,
                parsed,
                resolution_bucket,
                score,
            };

            let key = dedup_key(&candidate);
            match best.get(&key) {
                Some(existing) if existing.score >= candidate.score => {}
                _ => {
                    best.insert(key, candidate);
                }
            }
        }

        let mut candidates: Vec<Candidate> = best.into_values().collect();
        candidates.sort_by(|a, b| b.score.cmp(&a.score));
        debug!(total, surviving = candidates.len(), "triage complete");
        candidates
    }

    fn passes(&self, item: &Item, parsed: &ParsedTitle) -> bool {
        let f = &self.filters;
        let title = item.title.to_lowercase();

        // Quality block/allow.
        if f.blocked_qualities.iter().any(|q| title.contains(&q.to_lowercase())) {
            return false;
        }
        if !f.allowed_qualities.is_empty()
            && !f.allowed_qualities.iter().any(|q| title.contains(&q.to_lowercase()))
        {
            return false;
        }

        // Resolution ladder.
        if f.min_resolution.is_some() || f.max_resolution.is_some() {
            match resolution_rank(&parsed.resolution) {
                Some(rank) => {
                    if f.min_resolution.is_some_and(|min| rank < min) {
                        return false;
                    }
                    if f.max_resolution.is_some_and(|max| rank > max) {
                        return false;
                    }
                }
                // Unknown resolution only passes when no bound is set.
                None => return false,
            }
        }

        if !f.allowed_codecs.is_empty()
            && !f.allowed_codecs.iter().any(|c| parsed.codec.eq_ignore_ascii_case(c))
        {
            return false;
        }

        // Audio: every required track, and (when set) at least one allowed.
        if !f.required_audio.iter().all(|a| {
            parsed.audio.iter().any(|have| have.eq_ignore_ascii_case(a))
        }) {
            return false;
        }
        if !f.allowed_audio.is_empty()
            && !parsed.audio.iter().any(|have| {
                f.allowed_audio.iter().any(|a| have.eq_ignore_ascii_case(a))
            })
        {
            return false;
        }

        if let Some(min) = f.min_channels.as_deref().and_then(channel_rank) {
            let best = parsed
                .channels
                .iter()
                .filter_map(|c| channel_rank(c))
                .max()
                .unwrap_or(0);
            if best < min {
                return false;
            }
        }

        // HDR policy.
        if !f.required_hdr.is_empty()
            && !parsed.hdr.iter().any(|h| {
                f.required_hdr.iter().any(|r| h.eq_ignore_ascii_case(r))
            })
        {
            return false;
        }
        if parsed.hdr.iter().any(|h| {
            f.blocked_hdr.iter().any(|b| h.eq_ignore_ascii_case(b))
        }) {
            return false;
        }
        if !f.allowed_hdr.is_empty()
            && !parsed.hdr.is_empty()
            && !parsed.hdr.iter().all(|h| {
                f.allowed_hdr.iter().any(|a| h.eq_ignore_ascii_case(a))
            })
        {
            return false;
        }
        if f.block_sdr && parsed.hdr.is_empty() {
            return false;
        }

        // Languages.
        if !f.required_languages.iter().all(|l| {
            parsed.languages.iter().any(|have| have.eq_ignore_ascii_case(l))
        }) {
            return false;
        }
        if !f.allowed_languages.is_empty()
            && !parsed.languages.is_empty()
            && !parsed.languages.iter().any(|have| {
                f.allowed_languages.iter().any(|l| have.eq_ignore_ascii_case(l))
            })
        {
            return false;
        }

        if f.require_proper && !parsed.proper {
            return false;
        }
        if !f.allow_repack && parsed.repack {
            return false;
        }

        if f.block_cam && CAM_KEYWORDS.iter().any(|k| contains_word(&title, k)) {
            return false;
        }

        // Size bounds.
        let size_gb = item.size as f64 / 1_073_741_824.0;
        if f.min_size_gb.is_some_and(|min| size_gb < min) {
            return false;
        }
        if f.max_size_gb.is_some_and(|max| size_gb > max) {
            return false;
        }

        if f.blocked_groups.iter().any(|g| parsed.group.eq_ignore_ascii_case(g)) {
            return false;
        }

        true
    }

    fn score(
        &self,
        item: &Item,
        parsed: &ParsedTitle,
        bucket: ResolutionBucket,
        now: DateTime<Utc>,
    ) -> i64 {
        let title = item.title.to_lowercase();
        let mut score = self.weights.resolution_weight(bucket.as_str());

        // First matching codec weight.
        if let Some((_, w)) = self.weights.codec.iter().find(|(k, _)| title.contains(k)) {
            score += w;
        }

        // All matching audio weights.
        score += self
            .weights
            .audio
            .iter()
            .filter(|(k, _)| title.contains(k))
            .map(|(_, w)| w)
            .sum::<i64>();

        // First matching quality weight.
        if let Some((_, w)) = self.weights.quality.iter().find(|(k, _)| title.contains(k)) {
            score += w;
        }

        // Visual tags: HDR formats from the parse, "3d" matches any format.
        for (key, weight) in &self.weights.visual {
            let hit = if key == "3d" {
                parsed.is_3d
            } else {
                parsed.hdr.iter().any(|h| h.eq_ignore_ascii_case(key))
            };
            if hit {
                score += weight;
            }
        }

        // Freshness: newer releases score higher.
        if let Some(published) = item.pub_date {
            let age_hours = (now - published).num_hours().max(0);
            score += ((100_000 - age_hours) as f64 * self.weights.age_weight) as i64;
        }

        score += (item.grabs as f64 * self.weights.grab_weight) as i64;

        if self
            .filters
            .preferred_groups
            .iter()
            .any(|g| parsed.group.eq_ignore_ascii_case(g))
        {
            score += PREFERRED_GROUP_BOOST;
        }

        score
    }
}

/// Same release in the same flavour collapses to the highest score.
fn dedup_key(candidate: &Candidate) -> String {
    let p = &candidate.parsed;
    let title: String = candidate
        .item
        .title
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase();
    format!(
        "{title}|{}|s{:02}|e{:02}|{}|{}|{}|{}",
        p.year.unwrap_or(0),
        p.season.unwrap_or(0),
        p.episode.unwrap_or(0),
        p.resolution,
        p.quality,
        p.codec,
        p.group.to_lowercase(),
    )
}

fn resolution_rank(resolution: &str) -> Option<u32> {
    let r = resolution.to_lowercase();
    for rank in [2160u32, 1440, 1080, 720, 576, 480, 360, 240] {
        if r.contains(&rank.to_string()) {
            return Some(rank);
        }
    }
    if r.contains("4k") { Some(2160) } else { None }
}

/// 2.0 < 5.1 < 7.1
fn channel_rank(channels: &str) -> Option<u32> {
    match channels {
        "2.0" => Some(2),
        "5.1" => Some(6),
        "7.1" => Some(8),
        _ => None,
    }
}

/// Keyword match that won't fire inside longer words ("camera").
fn contains_word(haystack: &str, word: &str) -> bool {
    haystack.split(|c: char| !c.is_ascii_alphanumeric()).any(|t| t == word)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(title: &str, size: u64) -> Item {
        Item {
            title: title.to_string(),
            guid: title.to_string(),
            size,
            ..Item::default()
        }
    }

    fn service(filters: FilterConfig) -> TriageService {
        TriageService::new(filters, WeightConfig::default())
    }

    const GB: u64 = 1_073_741_824;

    #[test]
    fn resolution_bounds_filter() {
        let svc = service(FilterConfig {
            min_resolution: Some(1080),
            ..FilterConfig::default()
        });
        let candidates = svc.filter(
            vec![
                item("Movie.2023.1080p.BluRay.x264-GRP", 8 * GB),
                item("Movie.2023.720p.WEB-DL.x264-GRP", 4 * GB),
                item("Movie.2023.BluRay.x264-GRP", 8 * GB), // no resolution
            ],
            Utc::now(),
        );
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].resolution_bucket, ResolutionBucket::P1080);
    }

    #[test]
    fn unknown_resolution_passes_without_bounds() {
        let svc = service(FilterConfig::default());
        let candidates = svc.filter(vec![item("Movie.2023.BluRay.x264-GRP", 8 * GB)], Utc::now());
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].resolution_bucket, ResolutionBucket::Sd);
    }

    #[test]
    fn cam_releases_blocked_by_default() {
        let svc = service(FilterConfig::default());
        let candidates = svc.filter(
            vec![item("Movie.2023.HDCAM.x264", 2 * GB)],
            Utc::now(),
        );
        assert!(candidates.is_empty());
    }

    #[test]
    fn size_bounds() {
        let svc = service(FilterConfig {
            min_size_gb: Some(1.0),
            max_size_gb: Some(20.0),
            ..FilterConfig::default()
        });
        let candidates = svc.filter(
            vec![
                item("Movie.2023.1080p.BluRay-A", GB / 2),
                item("Movie.2023.1080p.BluRay-B", 8 * GB),
                item("Movie.2023.2160p.Remux-C", 60 * GB),
            ],
            Utc::now(),
        );
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].item.title, "Movie.2023.1080p.BluRay-B");
    }

    #[test]
    fn scoring_prefers_resolution_then_quality() {
        let svc = service(FilterConfig::default());
        let candidates = svc.filter(
            vec![
                item("Movie.2023.720p.BluRay.x264-GRP", 4 * GB),
                item("Movie.2023.2160p.Remux.TrueHD.Atmos-GRP", 40 * GB),
                item("Movie.2023.1080p.WEB-DL.x264-GRP", 8 * GB),
            ],
            Utc::now(),
        );
        assert_eq!(candidates.len(), 3);
        assert!(candidates[0].item.title.contains("2160p"));
        assert!(candidates[1].item.title.contains("1080p"));
    }

    #[test]
    fn preferred_group_boost_dominates() {
        let svc = service(FilterConfig {
            preferred_groups: vec!["FAV".to_string()],
            ..FilterConfig::default()
        });
        let candidates = svc.filter(
            vec![
                item("Movie.2023.2160p.Remux-OTHER", 40 * GB),
                item("Movie.2023.720p.WEB-DL-FAV", 2 * GB),
            ],
            Utc::now(),
        );
        assert_eq!(candidates[0].item.title, "Movie.2023.720p.WEB-DL-FAV");
        assert!(candidates[0].score - candidates[1].score < PREFERRED_GROUP_BOOST);
    }

    #[test]
    fn dedup_keeps_highest_score() {
        let svc = service(FilterConfig::default());
        let mut newer = item("Movie.2023.1080p.BluRay.x264-GRP", 8 * GB);
        newer.pub_date = Some(Utc::now());
        newer.guid = "other-guid".to_string();
        let mut older = item("Movie.2023.1080p.BluRay.x264-GRP", 9 * GB);
        older.pub_date = Some(Utc::now() - chrono::Duration::days(300));

        let candidates = svc.filter(vec![older, newer], Utc::now());
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].item.guid, "other-guid");
    }

    #[test]
    fn score_is_deterministic() {
        let svc = service(FilterConfig::default());
        let now = Utc::now();
        let mut i = item("Movie.2023.1080p.WEB-DL.DDP5.1.x264-GRP", 8 * GB);
        i.pub_date = Some(now - chrono::Duration::hours(12));
        i.grabs = 40;

        let a = svc.filter(vec![i.clone()], now)[0].score;
        let b = svc.filter(vec![i], now)[0].score;
        assert_eq!(a, b);
    }

    #[test]
    fn block_sdr_requires_hdr() {
        let svc = service(FilterConfig {
            block_sdr: true,
            ..FilterConfig::default()
        });
        let candidates = svc.filter(
            vec![
                item("Movie.2023.2160p.WEB-DL.HDR10.x265-A", 10 * GB),
                item("Movie.2023.2160p.WEB-DL.x265-B", 10 * GB),
            ],
            Utc::now(),
        );
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].item.title.contains("HDR10"));
    }
}
