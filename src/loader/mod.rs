use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::nntp::yenc::{self, DecodedSegment};
use crate::nntp::{ArticleSource, NntpError};
use crate::nzb::NzbFile;

/// Byte-weighted cache of decoded segments, shared across the readers of a
/// session so contiguous range reads don't refetch.
pub type SegmentCache = moka::future::Cache<String, Arc<DecodedSegment>>;

pub fn segment_cache(max_bytes: u64) -> SegmentCache {
    moka::future::Cache::builder()
        .max_capacity(max_bytes)
        .weigher(|_key: &String, value: &Arc<DecodedSegment>| {
            value.data.len().try_into().unwrap_or(u32::MAX)
        })
        .build()
}

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("NNTP error")]
    Nntp(#[from] NntpError),

    #[error("Segment {0} is shorter than its declared size")]
    TruncatedSegment(String),

    #[error("Article missing on all providers: {0}")]
    ArticleMissing(String),
}

/// Fetches one raw (still yEnc-encoded) article body. Production
/// implementation fails over across provider pools; tests substitute an
/// in-memory map.
#[async_trait]
pub trait SegmentFetcher: Send + Sync {
    async fn fetch(&self, message_id: &str) -> Result<Bytes, LoaderError>;
}

/// Provider-pool fetcher: enabled sources in priority order, transient
/// failures retried with exponential backoff, misses fall through to the
/// next provider.
pub struct PooledFetcher {
    sources: Vec<Arc<dyn ArticleSource>>,
}

impl PooledFetcher {
    pub fn new(mut sources: Vec<Arc<dyn ArticleSource>>) -> Self {
        sources.retain(|s| s.enabled());
        sources.sort_by_key(|s| s.priority());
        Self { sources }
    }

    fn retry_policy() -> ExponentialBackoff {
        ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(10)),
            ..ExponentialBackoff::default()
        }
    }
}

#[async_trait]
impl SegmentFetcher for PooledFetcher {
    async fn fetch(&self, message_id: &str) -> Result<Bytes, LoaderError> {
        let mut last_err: Option<NntpError> = None;

        for source in &self.sources {
            let attempt = backoff::future::retry(Self::retry_policy(), || async {
                source.body(message_id).await.map_err(|e| {
                    if e.is_fatal() {
                        backoff::Error::permanent(e)
                    } else {
                        backoff::Error::transient(e)
                    }
                })
            })
            .await;

            match attempt {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    debug!(host = source.host(), %message_id, error = %e, "segment fetch failed, trying next provider");
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(NntpError::ArticleMissing(_)) | None => {
                Err(LoaderError::ArticleMissing(message_id.to_string()))
            }
            Some(e) => Err(LoaderError::Nntp(e)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Layout {
    /// Decoded size of every segment except possibly the last.
    part_size: u64,
    /// Decoded size of the whole file.
    total: u64,
}

/// Read-seek view over one NZB file entry.
///
/// The decoded layout comes from the first segment's yEnc headers
/// (`=ybegin size=`, `=ypart begin/end`): segment `i` starts at
/// `i * part_size`. Every decoded segment is checked against that placement
/// so a short or shuffled article surfaces as `TruncatedSegment` instead of
/// corrupt video bytes.
pub struct NzbFileReader {
    file: NzbFile,
    fetcher: Arc<dyn SegmentFetcher>,
    cache: SegmentCache,
    layout: OnceCell<Layout>,
}

impl NzbFileReader {
    pub fn new(file: NzbFile, fetcher: Arc<dyn SegmentFetcher>, cache: SegmentCache) -> Self {
        Self {
            file,
            fetcher,
            cache,
            layout: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.file.path
    }

    pub fn declared_size(&self) -> u64 {
        self.file.size
    }

    /// Decoded size of the file; initializes the layout on first use.
    pub async fn size(&self) -> Result<u64, LoaderError> {
        Ok(self.layout().await?.total)
    }

    async fn layout(&self) -> Result<&Layout, LoaderError> {
        self.layout
            .get_or_try_init(|| async {
                let first = self.decoded_segment(0).await?;
                let part_size = first
                    .expected_len()
                    .unwrap_or(first.data.len() as u64)
                    .max(1);
                let total = first.file_size.unwrap_or(self.file.size);
                debug!(path = %self.file.path, part_size, total, "segment layout initialized");
                Ok(Layout { part_size, total })
            })
            .await
    }

    async fn decoded_segment(&self, index: usize) -> Result<Arc<DecodedSegment>, LoaderError> {
        let segment = self
            .file
            .segments
            .get(index)
            .ok_or_else(|| LoaderError::TruncatedSegment(self.file.path.clone()))?;

        if let Some(hit) = self.cache.get(&segment.message_id).await {
            return Ok(hit);
        }

        let raw = self.fetcher.fetch(&segment.message_id).await?;
        let decoded = yenc::decode(&raw).map_err(LoaderError::Nntp)?;

        if let Some(expected) = decoded.expected_len() {
            if (decoded.data.len() as u64) < expected {
                warn!(message_id = %segment.message_id, got = decoded.data.len(), expected, "short segment");
                return Err(LoaderError::TruncatedSegment(segment.message_id.clone()));
            }
        }

        let decoded = Arc::new(decoded);
        self.cache
            .insert(segment.message_id.clone(), Arc::clone(&decoded))
            .await;
        Ok(decoded)
    }

    /// Read up to `len` bytes at `offset`; short only at end of file.
    pub async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, LoaderError> {
        let layout = *self.layout().await?;
        if offset >= layout.total || len == 0 {
            return Ok(Bytes::new());
        }

        let end = layout.total.min(offset + len as u64);
        let mut out = BytesMut::with_capacity((end - offset) as usize);
        let mut pos = offset;

        while pos < end {
            let index = (pos / layout.part_size) as usize;
            let segment_start = index as u64 * layout.part_size;
            let decoded = self.decoded_segment(index).await?;

            if let Some((begin, _)) = decoded.part_range {
                // yEnc part offsets are 1-based.
                if begin >= 1 && begin - 1 != segment_start {
                    return Err(LoaderError::TruncatedSegment(
                        self.file.segments[index].message_id.clone(),
                    ));
                }
            }

            let within = (pos - segment_start) as usize;
            if within >= decoded.data.len() {
                return Err(LoaderError::TruncatedSegment(
                    self.file.segments[index].message_id.clone(),
                ));
            }

            let take = decoded.data.len().saturating_sub(within).min((end - pos) as usize);
            out.extend_from_slice(&decoded.data[within..within + take]);
            pos += take as u64;
        }

        Ok(out.freeze())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn reads_across_segment_boundaries() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let reader = reader_for(&data, 16_384, "media.bin");

        assert_eq!(reader.size().await.unwrap(), data.len() as u64);

        let slice = reader.read_at(16_000, 1000).await.unwrap();
        assert_eq!(&slice[..], &data[16_000..17_000]);

        let tail = reader.read_at(99_990, 100).await.unwrap();
        assert_eq!(&tail[..], &data[99_990..]);
    }

    #[tokio::test]
    async fn read_past_end_is_empty() {
        let reader = reader_for(b"abcdef", 4, "x.bin");
        assert!(reader.read_at(100, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_article_surfaces() {
        use crate::nzb::{NzbFile, NzbSegment};
        use chrono::Utc;
        use std::collections::HashMap;

        let mut file = NzbFile::new("x".into(), "p".into(), Utc::now());
        file.path = "x.bin".into();
        file.add_segment(NzbSegment {
            message_id: "gone@x".into(),
            number: 1,
            bytes: 100,
        });
        file.finish_segments();

        let reader = NzbFileReader::new(
            file,
            Arc::new(MapFetcher(HashMap::new())),
            segment_cache(1 << 20),
        );
        assert!(matches!(
            reader.read_at(0, 10).await,
            Err(LoaderError::ArticleMissing(_))
        ));
    }
}
