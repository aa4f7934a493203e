use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nzb {
    pub meta: NzbMeta,
    pub files: Vec<NzbFile>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NzbMeta {
    pub attributes: HashMap<String, String>,
}

impl NzbMeta {
    pub fn password(&self) -> Option<&str> {
        self.attributes.get("password").map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NzbFile {
    pub subject: String,
    pub poster: String,
    pub date: DateTime<Utc>,
    pub groups: Vec<String>,
    pub segments: Vec<NzbSegment>,
    /// Filename extracted from the subject, normalized to forward slashes.
    pub path: String,
    /// Sum of declared segment sizes.
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NzbSegment {
    pub message_id: String,
    pub number: u32,
    pub bytes: u64,
}

impl Default for Nzb {
    fn default() -> Self {
        Self::new()
    }
}

impl Nzb {
    pub fn new() -> Self {
        Self {
            meta: NzbMeta::default(),
            files: Vec::new(),
        }
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn segment_count(&self) -> usize {
        self.files.iter().map(|f| f.segments.len()).sum()
    }

    pub fn message_ids(&self) -> impl Iterator<Item = &str> {
        self.files
            .iter()
            .flat_map(|f| f.segments.iter().map(|s| s.message_id.as_str()))
    }

    /// Content fingerprint: md5 over the sorted `(message_id, bytes)`
    /// tuples. Equal iff the tuple sets are equal, independent of file and
    /// segment order. Used as the session key and play-URL path.
    pub fn hash(&self) -> String {
        let mut tuples: Vec<(&str, u64)> = self
            .files
            .iter()
            .flat_map(|f| f.segments.iter().map(|s| (s.message_id.as_str(), s.bytes)))
            .collect();
        tuples.sort_unstable();

        let mut hasher = Md5::new();
        for (id, bytes) in tuples {
            hasher.update(id.as_bytes());
            hasher.update(b":");
            hasher.update(bytes.to_string().as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }

    /// Id under which the availability oracle tracks this release: md5
    /// over the canonical (sorted, newline-joined) message-id list.
    pub fn oracle_id(&self) -> String {
        let mut ids: Vec<&str> = self.message_ids().collect();
        ids.sort_unstable();

        let mut hasher = Md5::new();
        for id in ids {
            hasher.update(id.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}

impl NzbFile {
    pub fn new(subject: String, poster: String, date: DateTime<Utc>) -> Self {
        Self {
            subject,
            poster,
            date,
            groups: Vec::new(),
            segments: Vec::new(),
            path: String::new(),
            size: 0,
        }
    }

    pub fn add_segment(&mut self, segment: NzbSegment) {
        self.segments.push(segment);
    }

    /// Sort segments by declared number and drop duplicates of the same
    /// number; recompute the size afterwards.
    pub fn finish_segments(&mut self) {
        self.segments.sort_by_key(|s| s.number);
        self.segments.dedup_by_key(|s| s.number);
        self.size = self.segments.iter().map(|s| s.bytes).sum();
    }

    pub fn extension(&self) -> Option<String> {
        self.path.rsplit('.').next().map(str::to_ascii_lowercase)
    }

    pub fn is_video(&self) -> bool {
        is_video_file(&self.path)
    }
}

pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches('/').to_string()
}

pub fn is_video_file(path: &str) -> bool {
    match path.rsplit('.').next() {
        Some(ext) => matches!(
            ext.to_ascii_lowercase().as_str(),
            "mp4" | "mkv" | "avi" | "mov" | "wmv" | "flv" | "webm" | "m4v" | "mpg" | "mpeg" | "ts"
        ),
        None => false,
    }
}

/// `.rar`, `.rNN`, `.7z`, `.7z.NNN` and `.partNN.rar` style names.
pub fn is_archive_part(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".rar") || lower.ends_with(".7z") {
        return true;
    }
    match lower.rsplit('.').next() {
        Some(ext) if ext.len() >= 2 => {
            (ext.starts_with('r') && ext[1..].parse::<u32>().is_ok())
                || ext.parse::<u32>().map(|_| lower.contains(".7z.")).unwrap_or(false)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_with(ids: &[(&str, u32, u64)]) -> NzbFile {
        let mut file = NzbFile::new("s".into(), "p".into(), Utc::now());
        for (id, number, bytes) in ids {
            file.add_segment(NzbSegment {
                message_id: (*id).to_string(),
                number: *number,
                bytes: *bytes,
            });
        }
        file.finish_segments();
        file
    }

    #[test]
    fn segments_sorted_and_deduped() {
        let file = file_with(&[("b@x", 2, 10), ("a@x", 1, 5), ("dup@x", 2, 10)]);
        assert_eq!(file.segments.len(), 2);
        assert_eq!(file.segments[0].message_id, "a@x");
        assert_eq!(file.size, 15);
    }

    #[test]
    fn hash_is_order_independent() {
        let mut a = Nzb::new();
        a.files.push(file_with(&[("a@x", 1, 5), ("b@x", 2, 10)]));
        let mut b = Nzb::new();
        b.files.push(file_with(&[("b@x", 2, 10), ("a@x", 1, 5)]));

        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.hash().len(), 32);
    }

    #[test]
    fn hash_changes_with_sizes() {
        let mut a = Nzb::new();
        a.files.push(file_with(&[("a@x", 1, 5)]));
        let mut b = Nzb::new();
        b.files.push(file_with(&[("a@x", 1, 6)]));

        assert_ne!(a.hash(), b.hash());
        // Same message ids, so the oracle id is unchanged.
        assert_eq!(a.oracle_id(), b.oracle_id());
    }

    #[test]
    fn archive_part_detection() {
        assert!(is_archive_part("movie.rar"));
        assert!(is_archive_part("movie.r00"));
        assert!(is_archive_part("movie.part01.rar"));
        assert!(is_archive_part("movie.7z"));
        assert!(is_archive_part("movie.7z.001"));
        assert!(!is_archive_part("movie.mkv"));
        assert!(!is_archive_part("movie.par2"));
    }
}
