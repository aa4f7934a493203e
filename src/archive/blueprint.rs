use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::archive::{ArchiveError, ByteSource};

/// One contiguous run of the media file inside a source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlueprintPart {
    /// Index into the session's ordered file list.
    pub file_index: usize,
    /// Byte offset of the run inside that file.
    pub offset: u64,
    pub length: u64,
}

/// Precomputed offset map of the chosen media file across archive parts.
/// Concatenating the parts reproduces the media file bit-exact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blueprint {
    pub filename: String,
    pub parts: Vec<BlueprintPart>,
    /// Virtual start offset of each part; same length as `parts`.
    starts: Vec<u64>,
    pub size: u64,
}

impl Blueprint {
    pub fn new(filename: String, parts: Vec<BlueprintPart>) -> Self {
        let mut starts = Vec::with_capacity(parts.len());
        let mut size = 0u64;
        for part in &parts {
            starts.push(size);
            size += part.length;
        }
        Self {
            filename,
            parts,
            starts,
            size,
        }
    }

    /// Whole-file blueprint for a bare video container.
    pub fn passthrough(filename: String, file_index: usize, size: u64) -> Self {
        Self::new(
            filename,
            vec![BlueprintPart {
                file_index,
                offset: 0,
                length: size,
            }],
        )
    }

    /// Map a virtual offset to (part index, offset within that part).
    fn locate(&self, offset: u64) -> Option<(usize, u64)> {
        if offset >= self.size {
            return None;
        }
        let idx = self.starts.partition_point(|&s| s <= offset) - 1;
        Some((idx, offset - self.starts[idx]))
    }
}

/// Seekable view of the media file described by a blueprint.
pub struct BlueprintReader {
    blueprint: Arc<Blueprint>,
    sources: Vec<Arc<dyn ByteSource>>,
}

impl BlueprintReader {
    pub fn new(blueprint: Arc<Blueprint>, sources: Vec<Arc<dyn ByteSource>>) -> Self {
        Self { blueprint, sources }
    }

    pub fn size(&self) -> u64 {
        self.blueprint.size
    }

    pub fn filename(&self) -> &str {
        &self.blueprint.filename
    }

    /// Read up to `len` bytes at `offset`, crossing part boundaries as
    /// needed; short only at end of stream.
    pub async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, ArchiveError> {
        let end = self.blueprint.size.min(offset + len as u64);
        if offset >= end {
            return Ok(Bytes::new());
        }

        let mut out = BytesMut::with_capacity((end - offset) as usize);
        let mut pos = offset;

        while pos < end {
            let (idx, within) = self
                .blueprint
                .locate(pos)
                .ok_or_else(|| ArchiveError::Malformed("offset beyond blueprint".to_string()))?;
            let part = &self.blueprint.parts[idx];
            let source = self
                .sources
                .get(part.file_index)
                .ok_or_else(|| ArchiveError::Malformed("blueprint references unknown file".to_string()))?;

            let want = ((part.length - within).min(end - pos)) as usize;
            let chunk = source.read_at(part.offset + within, want).await?;
            if chunk.is_empty() {
                return Err(ArchiveError::TruncatedSegment(self.blueprint.filename.clone()));
            }
            pos += chunk.len() as u64;
            out.extend_from_slice(&chunk);
        }

        Ok(out.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::testing::MemSource;

    fn reader() -> BlueprintReader {
        // Media "ABCDEFGHIJ" split over two sources with junk around it.
        let a = MemSource(Bytes::from_static(b"xxABCDEyy"));
        let b = MemSource(Bytes::from_static(b"zFGHIJzz"));
        let blueprint = Blueprint::new(
            "m.mkv".to_string(),
            vec![
                BlueprintPart {
                    file_index: 0,
                    offset: 2,
                    length: 5,
                },
                BlueprintPart {
                    file_index: 1,
                    offset: 1,
                    length: 5,
                },
            ],
        );
        BlueprintReader::new(Arc::new(blueprint), vec![Arc::new(a), Arc::new(b)])
    }

    #[test]
    fn size_is_sum_of_parts() {
        assert_eq!(reader().size(), 10);
    }

    #[tokio::test]
    async fn reads_cross_part_boundary() {
        let r = reader();
        assert_eq!(&r.read_at(0, 10).await.unwrap()[..], b"ABCDEFGHIJ");
        assert_eq!(&r.read_at(3, 4).await.unwrap()[..], b"DEFG");
        assert_eq!(&r.read_at(9, 5).await.unwrap()[..], b"J");
        assert!(r.read_at(10, 1).await.unwrap().is_empty());
    }
}
