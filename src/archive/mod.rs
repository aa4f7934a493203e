pub mod blueprint;
pub mod rar;
pub mod sevenzip;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

use crate::loader::{LoaderError, NzbFileReader};
use crate::nzb::{NzbFile, is_video_file};

pub use blueprint::{Blueprint, BlueprintPart, BlueprintReader};

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Archive entry is compressed, only store mode can be streamed")]
    CompressedArchive,

    #[error("Archive is encrypted")]
    EncryptedArchive,

    #[error("No video entry in archive")]
    NoVideoEntry,

    #[error("Truncated segment: {0}")]
    TruncatedSegment(String),

    #[error("Article missing during playback: {0}")]
    ArticleMissing(String),

    #[error("Malformed archive: {0}")]
    Malformed(String),

    #[error("NNTP error")]
    Nntp(#[from] crate::nntp::NntpError),
}

impl ArchiveError {
    /// Structural failures invalidate the validation cache and produce a
    /// negative oracle report; transport problems do not.
    pub fn is_structural(&self) -> bool {
        !matches!(self, ArchiveError::Nntp(_))
    }
}

impl From<LoaderError> for ArchiveError {
    fn from(e: LoaderError) -> Self {
        match e {
            LoaderError::Nntp(e) => ArchiveError::Nntp(e),
            LoaderError::TruncatedSegment(id) => ArchiveError::TruncatedSegment(id),
            LoaderError::ArticleMissing(id) => ArchiveError::ArticleMissing(id),
        }
    }
}

/// Random-access bytes for the archive scanners: an NZB-backed file in
/// production, a plain buffer in tests.
#[async_trait]
pub trait ByteSource: Send + Sync {
    async fn size(&self) -> Result<u64, ArchiveError>;

    /// Read up to `len` bytes; short only at end of source.
    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, ArchiveError>;
}

#[async_trait]
impl ByteSource for NzbFileReader {
    async fn size(&self) -> Result<u64, ArchiveError> {
        Ok(NzbFileReader::size(self).await?)
    }

    async fn read_at(&self, offset: u64, len: usize) -> Result<Bytes, ArchiveError> {
        Ok(NzbFileReader::read_at(self, offset, len).await?)
    }
}

/// What the ordered file list of a release looks like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveKind {
    /// Multi-part RAR; indices in volume order.
    Rar(Vec<usize>),
    /// 7z volume set; indices in volume order.
    SevenZip(Vec<usize>),
    /// Bare video container; index of the chosen file.
    Plain(usize),
}

/// Classify the release. RAR volumes win over a stray video file (sample
/// clips often ride along), 7z next, then the largest plain video.
pub fn detect(files: &[NzbFile]) -> Result<ArchiveKind, ArchiveError> {
    let mut rar: Vec<usize> = Vec::new();
    let mut sevenzip: Vec<usize> = Vec::new();

    for (i, file) in files.iter().enumerate() {
        if rar_volume_key(&file.path).is_some() {
            rar.push(i);
        } else if sevenzip_volume_key(&file.path).is_some() {
            sevenzip.push(i);
        }
    }

    if !rar.is_empty() {
        rar.sort_by_key(|&i| rar_volume_key(&files[i].path));
        debug!(volumes = rar.len(), "detected RAR set");
        return Ok(ArchiveKind::Rar(rar));
    }
    if !sevenzip.is_empty() {
        sevenzip.sort_by_key(|&i| sevenzip_volume_key(&files[i].path));
        debug!(volumes = sevenzip.len(), "detected 7z set");
        return Ok(ArchiveKind::SevenZip(sevenzip));
    }

    files
        .iter()
        .enumerate()
        .filter(|(_, f)| is_video_file(&f.path))
        .max_by_key(|(_, f)| f.size)
        .map(|(i, _)| ArchiveKind::Plain(i))
        .ok_or(ArchiveError::NoVideoEntry)
}

/// Volume ordering for `.rar`/`.rNN` and `.partNN.rar` naming. `None` for
/// non-RAR names.
fn rar_volume_key(path: &str) -> Option<u32> {
    let lower = path.to_ascii_lowercase();

    if let Some(stem) = lower.strip_suffix(".rar") {
        if let Some(pos) = stem.rfind(".part") {
            if let Ok(n) = stem[pos + 5..].parse::<u32>() {
                return Some(n);
            }
        }
        return Some(0);
    }

    let ext = lower.rsplit('.').next()?;
    if ext.len() >= 2 && ext.starts_with('r') {
        if let Ok(n) = ext[1..].parse::<u32>() {
            return Some(n + 1);
        }
    }
    None
}

/// Volume ordering for `.7z` and `.7z.NNN` naming.
fn sevenzip_volume_key(path: &str) -> Option<u32> {
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".7z") {
        return Some(0);
    }
    if let Some(pos) = lower.rfind(".7z.") {
        if let Ok(n) = lower[pos + 4..].parse::<u32>() {
            return Some(n);
        }
    }
    None
}

/// Build the blueprint for a session's ordered files. `sources` is
/// index-aligned with `files`.
pub async fn build_blueprint(
    files: &[NzbFile],
    sources: &[std::sync::Arc<dyn ByteSource>],
) -> Result<Blueprint, ArchiveError> {
    match detect(files)? {
        ArchiveKind::Rar(volumes) => rar::scan(sources, &volumes).await,
        ArchiveKind::SevenZip(volumes) => sevenzip::scan(sources, &volumes).await,
        ArchiveKind::Plain(index) => {
            let size = sources[index].size().await?;
            Ok(Blueprint::passthrough(
                files[index].path.clone(),
                index,
                size,
            ))
        }
    }
}
