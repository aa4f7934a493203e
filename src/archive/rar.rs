use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::archive::blueprint::{Blueprint, BlueprintPart};
use crate::archive::{ArchiveError, ByteSource};
use crate::nzb::is_video_file;

const RAR4_MARKER: [u8; 7] = [0x52, 0x61, 0x72, 0x21, 0x1A, 0x07, 0x00];
const RAR5_MARKER: [u8; 8] = [0x52, 0x61, 0x72, 0x21, 0x1A, 0x07, 0x01, 0x00];

const MAIN_HEAD: u8 = 0x73;
const FILE_HEAD: u8 = 0x74;
const ENDARC_HEAD: u8 = 0x7B;

const MHD_PASSWORD: u16 = 0x0080;
const LHD_SPLIT_BEFORE: u16 = 0x0001;
const LHD_SPLIT_AFTER: u16 = 0x0002;
const LHD_PASSWORD: u16 = 0x0004;
const LHD_LARGE: u16 = 0x0100;
const LONG_BLOCK: u16 = 0x8000;

const METHOD_STORE: u8 = 0x30;

/// One stored run of an entry's payload inside a volume.
#[derive(Debug)]
struct Run {
    file_index: usize,
    offset: u64,
    length: u64,
}

#[derive(Debug, Default)]
struct Entry {
    unp_size: u64,
    runs: Vec<Run>,
}

/// Walk the RAR4 headers of every volume and map the largest stored video
/// entry. Volumes are scanned in order so split entries accumulate their
/// runs in stream order.
pub async fn scan(
    sources: &[Arc<dyn ByteSource>],
    volumes: &[usize],
) -> Result<Blueprint, ArchiveError> {
    let mut entries: HashMap<String, Entry> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for &file_index in volumes {
        let source = sources
            .get(file_index)
            .ok_or_else(|| ArchiveError::Malformed("volume index out of range".to_string()))?;
        scan_volume(source.as_ref(), file_index, &mut entries, &mut order).await?;
    }

    let chosen = order
        .iter()
        .filter(|name| is_video_file(name))
        .max_by_key(|name| entries[*name].unp_size)
        .ok_or(ArchiveError::NoVideoEntry)?
        .clone();

    let entry = entries.remove(&chosen).unwrap_or_default();
    let total: u64 = entry.runs.iter().map(|r| r.length).sum();
    if total != entry.unp_size {
        return Err(ArchiveError::Malformed(format!(
            "stored runs of {chosen} cover {total} bytes, header says {}",
            entry.unp_size
        )));
    }

    debug!(entry = %chosen, runs = entry.runs.len(), size = entry.unp_size, "RAR blueprint built");
    Ok(Blueprint::new(
        chosen,
        entry
            .runs
            .into_iter()
            .map(|r| BlueprintPart {
                file_index: r.file_index,
                offset: r.offset,
                length: r.length,
            })
            .collect(),
    ))
}

async fn scan_volume(
    source: &dyn ByteSource,
    file_index: usize,
    entries: &mut HashMap<String, Entry>,
    order: &mut Vec<String>,
) -> Result<(), ArchiveError> {
    let volume_size = source.size().await?;
    let head = source.read_at(0, 1024.min(volume_size as usize)).await?;

    if head.windows(8).any(|w| w == RAR5_MARKER) {
        return Err(ArchiveError::Malformed(
            "RAR5 archives are not supported".to_string(),
        ));
    }
    let marker = head
        .windows(7)
        .position(|w| w == RAR4_MARKER)
        .ok_or_else(|| ArchiveError::Malformed("no RAR marker in volume".to_string()))?
        as u64;

    let mut cursor = Cursor {
        source,
        pos: marker + 7,
        size: volume_size,
    };

    loop {
        let Some(base) = cursor.try_read(7).await? else {
            break; // clean end of volume
        };
        let block_start = cursor.pos - 7;
        let head_type = base[2];
        let flags = u16::from_le_bytes([base[3], base[4]]);
        let head_size = u16::from_le_bytes([base[5], base[6]]) as u64;

        if head_size < 7 {
            return Err(ArchiveError::Malformed("block header too small".to_string()));
        }

        match head_type {
            MAIN_HEAD => {
                if flags & MHD_PASSWORD != 0 {
                    return Err(ArchiveError::EncryptedArchive);
                }
                cursor.seek(block_start + head_size);
            }
            FILE_HEAD => {
                let fixed = cursor.read_exact(25).await?;
                let mut pack_size = u32::from_le_bytes(fixed[0..4].try_into().unwrap()) as u64;
                let mut unp_size = u32::from_le_bytes(fixed[4..8].try_into().unwrap()) as u64;
                let method = fixed[18];
                let name_size = u16::from_le_bytes([fixed[19], fixed[20]]) as usize;

                if flags & LHD_LARGE != 0 {
                    let high = cursor.read_exact(8).await?;
                    pack_size |= (u32::from_le_bytes(high[0..4].try_into().unwrap()) as u64) << 32;
                    unp_size |= (u32::from_le_bytes(high[4..8].try_into().unwrap()) as u64) << 32;
                }

                if flags & LHD_PASSWORD != 0 {
                    return Err(ArchiveError::EncryptedArchive);
                }
                if method != METHOD_STORE {
                    return Err(ArchiveError::CompressedArchive);
                }

                let raw_name = cursor.read_exact(name_size).await?;
                // With the unicode flag the ASCII name ends at the first NUL.
                let ascii = raw_name.split(|&b| b == 0).next().unwrap_or(&raw_name);
                let name = String::from_utf8_lossy(ascii).to_string();

                let data_offset = block_start + head_size;
                trace!(
                    %name,
                    pack_size,
                    data_offset,
                    split_before = flags & LHD_SPLIT_BEFORE != 0,
                    split_after = flags & LHD_SPLIT_AFTER != 0,
                    "file head"
                );

                let entry = entries.entry(name.clone()).or_insert_with(|| {
                    order.push(name.clone());
                    Entry::default()
                });
                entry.unp_size = entry.unp_size.max(unp_size);
                entry.runs.push(Run {
                    file_index,
                    offset: data_offset,
                    length: pack_size,
                });

                cursor.seek(data_offset + pack_size);
            }
            ENDARC_HEAD => break,
            _ => {
                let add_size = if flags & LONG_BLOCK != 0 {
                    let add = cursor.read_exact(4).await?;
                    u32::from_le_bytes(add[0..4].try_into().unwrap()) as u64
                } else {
                    0
                };
                cursor.seek(block_start + head_size + add_size);
            }
        }
    }

    Ok(())
}

struct Cursor<'a> {
    source: &'a dyn ByteSource,
    pos: u64,
    size: u64,
}

impl Cursor<'_> {
    fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    async fn read_exact(&mut self, len: usize) -> Result<Bytes, ArchiveError> {
        self.try_read(len)
            .await?
            .ok_or_else(|| ArchiveError::Malformed("unexpected end of volume".to_string()))
    }

    /// `None` when the volume ends exactly here; an error on a partial read.
    async fn try_read(&mut self, len: usize) -> Result<Option<Bytes>, ArchiveError> {
        if self.pos >= self.size {
            return Ok(None);
        }
        let chunk = self.source.read_at(self.pos, len).await?;
        if chunk.len() < len {
            return Err(ArchiveError::Malformed(
                "unexpected end of volume".to_string(),
            ));
        }
        self.pos += len as u64;
        Ok(Some(chunk))
    }
}
