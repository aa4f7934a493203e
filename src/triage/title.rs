use std::sync::LazyLock;

use regex::Regex;

/// Structured metadata pulled out of a release name. Pure function of the
/// title string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedTitle {
    pub resolution: String,
    pub quality: String,
    pub codec: String,
    pub audio: Vec<String>,
    pub channels: Vec<String>,
    pub hdr: Vec<String>,
    pub is_3d: bool,
    pub languages: Vec<String>,
    pub group: String,
    pub proper: bool,
    pub repack: bool,
    pub extended: bool,
    pub unrated: bool,
    pub year: Option<u32>,
    pub season: Option<u32>,
    pub episode: Option<u32>,
}

static RESOLUTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(2160p|1440p|1080p|720p|576p|480p|360p|240p|4k)\b").unwrap());
static YEAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(19\d{2}|20\d{2})\b").unwrap());
static SEASON_EPISODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bS(\d{1,2})[\s.]?E(\d{1,3})\b").unwrap());
static SEASON_ONLY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bS(\d{1,2})\b").unwrap());
static CHANNELS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(7\.1|5\.1|2\.0)\b").unwrap());
static GROUP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-([A-Za-z0-9]+)$").unwrap());
static THREE_D_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(3d|h?sbs|h?ou|half-sbs|half-ou)\b").unwrap());
static BARE_DV_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bDV\b").unwrap());

/// Ordered: first hit wins, so `WEB-DL` is found before plain `WEB`.
const QUALITIES: &[(&str, &str)] = &[
    ("remux", "Remux"),
    ("blu-ray", "BluRay"),
    ("bluray", "BluRay"),
    ("bdrip", "BDRip"),
    ("brrip", "BRRip"),
    ("web-dl", "WEB-DL"),
    ("webdl", "WEB-DL"),
    ("webrip", "WEBRip"),
    ("web", "WEB-DL"),
    ("hdtv", "HDTV"),
    ("dvdrip", "DVDRip"),
    ("dvd", "DVD"),
    ("telesync", "TS"),
    ("telecine", "TC"),
    ("screener", "SCR"),
    ("hdcam", "CAM"),
    ("camrip", "CAM"),
    ("cam", "CAM"),
];

const CODECS: &[(&str, &str)] = &[
    ("x265", "x265"),
    ("h265", "x265"),
    ("h.265", "x265"),
    ("hevc", "x265"),
    ("x264", "x264"),
    ("h264", "x264"),
    ("h.264", "x264"),
    ("avc", "x264"),
    ("av1", "AV1"),
    ("xvid", "XviD"),
    ("divx", "DivX"),
];

const AUDIO: &[(&str, &str)] = &[
    ("atmos", "Atmos"),
    ("truehd", "TrueHD"),
    ("dts-hd", "DTS-HD"),
    ("dtshd", "DTS-HD"),
    ("dts-x", "DTS-X"),
    ("dtsx", "DTS-X"),
    ("dts", "DTS"),
    ("eac3", "EAC3"),
    ("ddp", "EAC3"),
    ("dd+", "EAC3"),
    ("ac3", "AC3"),
    ("flac", "FLAC"),
    ("aac", "AAC"),
    ("opus", "Opus"),
    ("mp3", "MP3"),
];

const HDR_TAGS: &[(&str, &str)] = &[
    ("dolby vision", "DV"),
    ("dolby.vision", "DV"),
    ("dovi", "DV"),
    ("dv", "DV"),
    ("hdr10+", "HDR10+"),
    ("hdr10plus", "HDR10+"),
    ("hdr10", "HDR10"),
    ("hdr", "HDR"),
];

const LANGUAGES: &[&str] = &[
    "multi", "french", "truefrench", "vostfr", "german", "spanish", "italian", "english",
    "hindi", "korean", "japanese", "russian", "nordic", "dual",
];

pub fn parse_release_title(title: &str) -> ParsedTitle {
    let lower = title.to_lowercase();
    let mut parsed = ParsedTitle::default();

    if let Some(m) = RESOLUTION_RE.find(title) {
        let r = m.as_str().to_lowercase();
        parsed.resolution = if r == "4k" { "2160p".to_string() } else { r };
    }

    for (needle, canonical) in QUALITIES {
        if lower.contains(needle) {
            parsed.quality = (*canonical).to_string();
            break;
        }
    }

    for (needle, canonical) in CODECS {
        if lower.contains(needle) {
            parsed.codec = (*canonical).to_string();
            break;
        }
    }

    for (needle, canonical) in AUDIO {
        if lower.contains(needle) && !parsed.audio.iter().any(|a| a == canonical) {
            parsed.audio.push((*canonical).to_string());
        }
    }

    for m in CHANNELS_RE.find_iter(title) {
        let c = m.as_str().to_string();
        if !parsed.channels.contains(&c) {
            parsed.channels.push(c);
        }
    }

    for (needle, canonical) in HDR_TAGS {
        let hit = if *needle == "dv" {
            // Bare DV needs word boundaries, it shows up inside other tags.
            BARE_DV_RE.is_match(title)
        } else {
            lower.contains(needle)
        };
        // More specific tags shadow the ones they contain as substrings.
        let shadowed = match *canonical {
            "HDR10" => parsed.hdr.iter().any(|h| h == "HDR10+"),
            "HDR" => parsed.hdr.iter().any(|h| h.starts_with("HDR10")),
            _ => false,
        };
        if hit && !shadowed && !parsed.hdr.iter().any(|h| h == canonical) {
            parsed.hdr.push((*canonical).to_string());
        }
    }

    parsed.is_3d = THREE_D_RE.is_match(title);

    for lang in LANGUAGES {
        if lower.contains(lang) {
            parsed.languages.push((*lang).to_string());
        }
    }

    parsed.proper = lower.contains("proper");
    parsed.repack = lower.contains("repack") || lower.contains("rerip");
    parsed.extended = lower.contains("extended");
    parsed.unrated = lower.contains("unrated");

    if let Some(c) = YEAR_RE.captures(title) {
        parsed.year = c[1].parse().ok();
    }

    if let Some(c) = SEASON_EPISODE_RE.captures(title) {
        parsed.season = c[1].parse().ok();
        parsed.episode = c[2].parse().ok();
    } else if let Some(c) = SEASON_ONLY_RE.captures(title) {
        parsed.season = c[1].parse().ok();
    }

    if let Some(c) = GROUP_RE.captures(title.trim()) {
        parsed.group = c[1].to_string();
    }

    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_typical_movie_release() {
        let parsed =
            parse_release_title("Inception.2010.2160p.BluRay.REMUX.HDR10.TrueHD.Atmos.7.1-FraMeSToR");

        assert_eq!(parsed.resolution, "2160p");
        assert_eq!(parsed.quality, "Remux");
        assert_eq!(parsed.year, Some(2010));
        assert!(parsed.audio.contains(&"TrueHD".to_string()));
        assert!(parsed.audio.contains(&"Atmos".to_string()));
        assert_eq!(parsed.channels, vec!["7.1"]);
        assert!(parsed.hdr.contains(&"HDR10".to_string()));
        assert_eq!(parsed.group, "FraMeSToR");
    }

    #[test]
    fn parses_series_numbering() {
        let parsed = parse_release_title("Show.Name.S02E05.1080p.WEB-DL.DDP5.1.x264-NTb");
        assert_eq!(parsed.season, Some(2));
        assert_eq!(parsed.episode, Some(5));
        assert_eq!(parsed.quality, "WEB-DL");
        assert_eq!(parsed.codec, "x264");
        assert!(parsed.audio.contains(&"EAC3".to_string()));
        assert_eq!(parsed.group, "NTb");
    }

    #[test]
    fn four_k_maps_to_2160p() {
        assert_eq!(parse_release_title("Movie 4K HDR").resolution, "2160p");
    }

    #[test]
    fn dv_needs_word_boundary() {
        assert!(parse_release_title("Movie.2160p.DV.HDR10").hdr.contains(&"DV".to_string()));
        assert!(!parse_release_title("Movie.1080p.DVDRip").hdr.contains(&"DV".to_string()));
    }

    #[test]
    fn flags_and_languages() {
        let parsed = parse_release_title("Film.2020.MULTi.FRENCH.PROPER.REPACK.1080p");
        assert!(parsed.proper);
        assert!(parsed.repack);
        assert!(parsed.languages.contains(&"multi".to_string()));
        assert!(parsed.languages.contains(&"french".to_string()));
    }

    #[test]
    fn empty_fields_on_bare_title() {
        let parsed = parse_release_title("Some random words");
        assert!(parsed.resolution.is_empty());
        assert!(parsed.quality.is_empty());
        assert!(parsed.year.is_none());
    }
}
