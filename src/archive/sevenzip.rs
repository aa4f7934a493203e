use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::archive::blueprint::{Blueprint, BlueprintPart};
use crate::archive::{ArchiveError, ByteSource};
use crate::nzb::is_video_file;

const MAGIC: [u8; 6] = [b'7', b'z', 0xBC, 0xAF, 0x27, 0x1C];

const K_END: u64 = 0x00;
const K_HEADER: u64 = 0x01;
const K_ARCHIVE_PROPERTIES: u64 = 0x02;
const K_MAIN_STREAMS_INFO: u64 = 0x04;
const K_FILES_INFO: u64 = 0x05;
const K_PACK_INFO: u64 = 0x06;
const K_UNPACK_INFO: u64 = 0x07;
const K_SUBSTREAMS_INFO: u64 = 0x08;
const K_SIZE: u64 = 0x09;
const K_CRC: u64 = 0x0A;
const K_FOLDER: u64 = 0x0B;
const K_CODERS_UNPACK_SIZE: u64 = 0x0C;
const K_NUM_UNPACK_STREAM: u64 = 0x0D;
const K_EMPTY_STREAM: u64 = 0x0E;
const K_NAME: u64 = 0x11;
const K_ENCODED_HEADER: u64 = 0x17;

const CODEC_COPY: &[u8] = &[0x00];
const CODEC_AES_PREFIX: &[u8] = &[0x06, 0xF1, 0x07];

const MAX_HEADER_SIZE: u64 = 1 << 20;

/// Scan a 7z volume set (volumes are plain byte concatenation) and map the
/// largest stored video entry. Only copy-coder ("store") folders can be
/// streamed; anything else is compressed or encrypted.
pub async fn scan(
    sources: &[Arc<dyn ByteSource>],
    volumes: &[usize],
) -> Result<Blueprint, ArchiveError> {
    let concat = Concat::open(sources, volumes).await?;

    let sig = concat.read_exact(0, 32).await?;
    if sig[0..6] != MAGIC {
        return Err(ArchiveError::Malformed("no 7z signature".to_string()));
    }
    let next_offset = u64::from_le_bytes(sig[12..20].try_into().unwrap());
    let next_size = u64::from_le_bytes(sig[20..28].try_into().unwrap());
    if next_size == 0 {
        return Err(ArchiveError::Malformed("empty 7z archive".to_string()));
    }
    if next_size > MAX_HEADER_SIZE {
        return Err(ArchiveError::Malformed("7z header too large".to_string()));
    }

    let header_bytes = concat.read_exact(32 + next_offset, next_size as usize).await?;
    let header = parse_header(&header_bytes)?;

    // Stored folders map 1:1 onto pack streams laid out sequentially from
    // the end of the signature header.
    if header.pack_sizes.len() != header.folder_sizes.len() {
        return Err(ArchiveError::CompressedArchive);
    }
    let base = 32 + header.pack_pos;
    let mut folder_starts = Vec::with_capacity(header.pack_sizes.len());
    let mut acc = base;
    for (&pack, &unpack) in header.pack_sizes.iter().zip(&header.folder_sizes) {
        if pack != unpack {
            return Err(ArchiveError::CompressedArchive);
        }
        folder_starts.push(acc);
        acc += pack;
    }

    // Pair non-empty files with substreams in folder-major order.
    let mut stream_files: Vec<&str> = Vec::new();
    for (i, name) in header.names.iter().enumerate() {
        let empty = header.empty_stream.get(i).copied().unwrap_or(false);
        if !empty {
            stream_files.push(name);
        }
    }
    let total_substreams: usize = header.substream_sizes.iter().map(Vec::len).sum();
    if stream_files.len() != total_substreams {
        return Err(ArchiveError::Malformed(format!(
            "{} files with data but {} substreams",
            stream_files.len(),
            total_substreams
        )));
    }

    // Virtual (start, len) of every file with data.
    let mut placed: Vec<(&str, u64, u64)> = Vec::with_capacity(total_substreams);
    let mut file_iter = stream_files.into_iter();
    for (folder, sizes) in header.substream_sizes.iter().enumerate() {
        let mut offset = folder_starts[folder];
        for &size in sizes {
            let name = file_iter.next().expect("counts checked above");
            placed.push((name, offset, size));
            offset += size;
        }
    }

    let (name, start, len) = placed
        .iter()
        .filter(|(name, _, _)| is_video_file(name))
        .max_by_key(|(_, _, len)| *len)
        .copied()
        .ok_or(ArchiveError::NoVideoEntry)?;

    debug!(entry = %name, size = len, "7z blueprint built");
    Ok(Blueprint::new(name.to_string(), concat.map_range(start, len)?))
}

#[derive(Debug, Default)]
struct Header {
    pack_pos: u64,
    pack_sizes: Vec<u64>,
    folder_sizes: Vec<u64>,
    /// Per folder, the decoded size of each substream.
    substream_sizes: Vec<Vec<u64>>,
    names: Vec<String>,
    empty_stream: Vec<bool>,
}

fn parse_header(data: &[u8]) -> Result<Header, ArchiveError> {
    let mut r = SliceReader { data, pos: 0 };
    let mut header = Header::default();

    match r.number()? {
        K_HEADER => {}
        // A compressed header means the archive was not written in plain
        // store mode.
        K_ENCODED_HEADER => return Err(ArchiveError::CompressedArchive),
        _ => return Err(ArchiveError::Malformed("unexpected 7z root property".to_string())),
    }

    loop {
        match r.number()? {
            K_END => break,
            K_MAIN_STREAMS_INFO => parse_streams_info(&mut r, &mut header)?,
            K_FILES_INFO => parse_files_info(&mut r, &mut header)?,
            K_ARCHIVE_PROPERTIES => loop {
                let id = r.number()?;
                if id == K_END {
                    break;
                }
                let size = r.number()? as usize;
                r.bytes(size)?;
            },
            other => {
                return Err(ArchiveError::Malformed(format!(
                    "unsupported 7z header property {other:#x}"
                )));
            }
        }
    }

    if header.substream_sizes.is_empty() {
        // No SubStreamsInfo: one substream per folder of the folder size.
        header.substream_sizes = header.folder_sizes.iter().map(|&s| vec![s]).collect();
    }

    Ok(header)
}

fn parse_streams_info(r: &mut SliceReader, header: &mut Header) -> Result<(), ArchiveError> {
    let mut folder_crc_defined: Vec<bool> = Vec::new();

    loop {
        match r.number()? {
            K_END => break,
            K_PACK_INFO => {
                header.pack_pos = r.number()?;
                let num = r.number()? as usize;
                loop {
                    match r.number()? {
                        K_END => break,
                        K_SIZE => {
                            for _ in 0..num {
                                header.pack_sizes.push(r.number()?);
                            }
                        }
                        K_CRC => {
                            skip_digests(r, num)?;
                        }
                        other => {
                            return Err(ArchiveError::Malformed(format!(
                                "unexpected PackInfo property {other:#x}"
                            )));
                        }
                    }
                }
            }
            K_UNPACK_INFO => {
                if r.number()? != K_FOLDER {
                    return Err(ArchiveError::Malformed("expected kFolder".to_string()));
                }
                let num_folders = r.number()? as usize;
                if r.byte()? != 0 {
                    return Err(ArchiveError::Malformed(
                        "external folder data is unsupported".to_string(),
                    ));
                }
                for _ in 0..num_folders {
                    parse_folder(r)?;
                }
                if r.number()? != K_CODERS_UNPACK_SIZE {
                    return Err(ArchiveError::Malformed("expected kCodersUnpackSize".to_string()));
                }
                for _ in 0..num_folders {
                    header.folder_sizes.push(r.number()?);
                }
                loop {
                    match r.number()? {
                        K_END => break,
                        K_CRC => {
                            folder_crc_defined = skip_digests(r, num_folders)?;
                        }
                        other => {
                            return Err(ArchiveError::Malformed(format!(
                                "unexpected UnpackInfo property {other:#x}"
                            )));
                        }
                    }
                }
            }
            K_SUBSTREAMS_INFO => {
                let num_folders = header.folder_sizes.len();
                let mut counts = vec![1usize; num_folders];
                let mut sizes_seen = false;

                loop {
                    match r.number()? {
                        K_END => break,
                        K_NUM_UNPACK_STREAM => {
                            for count in counts.iter_mut() {
                                *count = r.number()? as usize;
                            }
                        }
                        K_SIZE => {
                            sizes_seen = true;
                            for (folder, &count) in counts.iter().enumerate() {
                                let mut sizes = Vec::with_capacity(count);
                                let mut used = 0u64;
                                // The last substream size of each folder is
                                // implicit; folders with one substream store
                                // nothing at all.
                                for _ in 0..count.saturating_sub(1) {
                                    let s = r.number()?;
                                    used += s;
                                    sizes.push(s);
                                }
                                if count > 0 {
                                    let folder_size = header.folder_sizes[folder];
                                    let last = folder_size.checked_sub(used).ok_or_else(|| {
                                        ArchiveError::Malformed(
                                            "substream sizes exceed folder size".to_string(),
                                        )
                                    })?;
                                    sizes.push(last);
                                }
                                header.substream_sizes.push(sizes);
                            }
                        }
                        K_CRC => {
                            let digests = counts
                                .iter()
                                .enumerate()
                                .map(|(f, &n)| {
                                    let folder_known =
                                        folder_crc_defined.get(f).copied().unwrap_or(false);
                                    if n == 1 && folder_known { 0 } else { n }
                                })
                                .sum();
                            skip_digests(r, digests)?;
                        }
                        other => {
                            return Err(ArchiveError::Malformed(format!(
                                "unexpected SubStreamsInfo property {other:#x}"
                            )));
                        }
                    }
                }

                if !sizes_seen {
                    if counts.iter().any(|&c| c != 1) {
                        return Err(ArchiveError::Malformed(
                            "substream counts without sizes".to_string(),
                        ));
                    }
                    header.substream_sizes =
                        header.folder_sizes.iter().map(|&s| vec![s]).collect();
                }
            }
            other => {
                return Err(ArchiveError::Malformed(format!(
                    "unexpected StreamsInfo property {other:#x}"
                )));
            }
        }
    }

    Ok(())
}

/// A streamable folder is exactly one copy coder. AES marks encryption;
/// everything else is compression.
fn parse_folder(r: &mut SliceReader) -> Result<(), ArchiveError> {
    let num_coders = r.number()? as usize;
    if num_coders != 1 {
        return Err(ArchiveError::CompressedArchive);
    }

    let flags = r.byte()?;
    let id_size = (flags & 0x0F) as usize;
    let codec_id = r.bytes(id_size)?.to_vec();

    if flags & 0x10 != 0 {
        let _num_in = r.number()?;
        let num_out = r.number()?;
        if num_out != 1 {
            return Err(ArchiveError::CompressedArchive);
        }
    }
    if flags & 0x20 != 0 {
        let props = r.number()? as usize;
        r.bytes(props)?;
    }

    if codec_id == CODEC_COPY {
        Ok(())
    } else if codec_id.starts_with(CODEC_AES_PREFIX) {
        Err(ArchiveError::EncryptedArchive)
    } else {
        Err(ArchiveError::CompressedArchive)
    }
}

fn parse_files_info(r: &mut SliceReader, header: &mut Header) -> Result<(), ArchiveError> {
    let num_files = r.number()? as usize;
    header.empty_stream = vec![false; num_files];

    loop {
        let id = r.number()?;
        if id == K_END {
            break;
        }
        let size = r.number()? as usize;
        let block = r.bytes(size)?;
        let mut br = SliceReader { data: block, pos: 0 };

        match id {
            K_EMPTY_STREAM => {
                header.empty_stream = br.bitfield(num_files)?;
            }
            K_NAME => {
                if br.byte()? != 0 {
                    return Err(ArchiveError::Malformed(
                        "external file names are unsupported".to_string(),
                    ));
                }
                header.names = parse_utf16_names(&block[1..]);
            }
            _ => {} // timestamps, attributes, anti files: irrelevant here
        }
    }

    if header.names.len() != num_files {
        return Err(ArchiveError::Malformed("file name count mismatch".to_string()));
    }

    Ok(())
}

fn parse_utf16_names(data: &[u8]) -> Vec<String> {
    let mut names = Vec::new();
    let mut current: Vec<u16> = Vec::new();

    for pair in data.chunks_exact(2) {
        let unit = u16::from_le_bytes([pair[0], pair[1]]);
        if unit == 0 {
            names.push(String::from_utf16_lossy(&current));
            current.clear();
        } else {
            current.push(unit);
        }
    }
    names
}

/// Skip a digests block, returning which entries had a CRC defined.
fn skip_digests(r: &mut SliceReader, count: usize) -> Result<Vec<bool>, ArchiveError> {
    let all_defined = r.byte()?;
    let defined = if all_defined != 0 {
        vec![true; count]
    } else {
        r.bitfield(count)?
    };
    for &d in &defined {
        if d {
            r.bytes(4)?;
        }
    }
    Ok(defined)
}

struct SliceReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SliceReader<'a> {
    fn byte(&mut self) -> Result<u8, ArchiveError> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| ArchiveError::Malformed("truncated 7z header".to_string()))?;
        self.pos += 1;
        Ok(b)
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], ArchiveError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&e| e <= self.data.len())
            .ok_or_else(|| ArchiveError::Malformed("truncated 7z header".to_string()))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// 7z variable-length integer: leading ones in the first byte count the
    /// little-endian extension bytes.
    fn number(&mut self) -> Result<u64, ArchiveError> {
        let first = self.byte()?;
        let mut mask = 0x80u8;
        let mut value = 0u64;

        for i in 0..8 {
            if first & mask == 0 {
                value |= ((first & (mask.wrapping_sub(1))) as u64) << (8 * i);
                return Ok(value);
            }
            value |= (self.byte()? as u64) << (8 * i);
            mask >>= 1;
        }
        Ok(value)
    }

    /// MSB-first packed bit vector.
    fn bitfield(&mut self, count: usize) -> Result<Vec<bool>, ArchiveError> {
        let bytes = self.bytes(count.div_ceil(8))?;
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            out.push(bytes[i / 8] & (0x80 >> (i % 8)) != 0);
        }
        Ok(out)
    }
}

/// Treats the ordered volume set as one byte space.
struct Concat<'a> {
    sources: &'a [Arc<dyn ByteSource>],
    volumes: &'a [usize],
    starts: Vec<u64>,
    sizes: Vec<u64>,
}

impl<'a> Concat<'a> {
    async fn open(
        sources: &'a [Arc<dyn ByteSource>],
        volumes: &'a [usize],
    ) -> Result<Concat<'a>, ArchiveError> {
        let mut starts = Vec::with_capacity(volumes.len());
        let mut sizes = Vec::with_capacity(volumes.len());
        let mut acc = 0u64;
        for &index in volumes {
            let size = sources
                .get(index)
                .ok_or_else(|| ArchiveError::Malformed("volume index out of range".to_string()))?
                .size()
                .await?;
            starts.push(acc);
            sizes.push(size);
            acc += size;
        }
        Ok(Self {
            sources,
            volumes,
            starts,
            sizes,
        })
    }

    async fn read_exact(&self, offset: u64, len: usize) -> Result<Bytes, ArchiveError> {
        let mut out = BytesMut::with_capacity(len);
        for part in self.map_range(offset, len as u64)? {
            let chunk = self.sources[part.file_index]
                .read_at(part.offset, part.length as usize)
                .await?;
            if chunk.len() as u64 != part.length {
                return Err(ArchiveError::Malformed("short read from volume".to_string()));
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Split a virtual range into per-volume blueprint parts.
    fn map_range(&self, start: u64, len: u64) -> Result<Vec<BlueprintPart>, ArchiveError> {
        let total: u64 = self.sizes.iter().sum();
        if start + len > total {
            return Err(ArchiveError::Malformed("range beyond archive end".to_string()));
        }

        let mut parts = Vec::new();
        let mut pos = start;
        let mut remaining = len;
        while remaining > 0 {
            let vi = self.starts.partition_point(|&s| s <= pos) - 1;
            let within = pos - self.starts[vi];
            let take = (self.sizes[vi] - within).min(remaining);
            parts.push(BlueprintPart {
                file_index: self.volumes[vi],
                offset: within,
                length: take,
            });
            pos += take;
            remaining -= take;
        }
        Ok(parts)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::build_archive;
    use super::*;
    use crate::archive::testing::MemSource;

    fn sources(volumes: Vec<Vec<u8>>) -> Vec<Arc<dyn ByteSource>> {
        volumes
            .into_iter()
            .map(|v| Arc::new(MemSource(Bytes::from(v))) as Arc<dyn ByteSource>)
            .collect()
    }

    #[tokio::test]
    async fn picks_stored_video_entry() {
        let video = b"SEVENZIP-VIDEO-PAYLOAD";
        let archive = build_archive(&[("notes.nfo", b"meta"), ("movie.mkv", video)], CODEC_COPY);

        let sources = sources(vec![archive]);
        let blueprint = scan(&sources, &[0]).await.unwrap();

        assert_eq!(blueprint.filename, "movie.mkv");
        assert_eq!(blueprint.size, video.len() as u64);

        let reader = crate::archive::BlueprintReader::new(Arc::new(blueprint), sources);
        let out = reader.read_at(0, video.len()).await.unwrap();
        assert_eq!(&out[..], video);
    }

    #[tokio::test]
    async fn volume_split_maps_across_files() {
        let video = b"VIDEO-SPLIT-ACROSS-VOLUMES";
        let archive = build_archive(&[("movie.mkv", video)], CODEC_COPY);

        // Cut mid-payload so the entry itself spans both volumes.
        let cut = 40.min(archive.len() / 2);
        let (a, b) = archive.split_at(cut);
        let sources = sources(vec![a.to_vec(), b.to_vec()]);

        let blueprint = scan(&sources, &[0, 1]).await.unwrap();
        assert_eq!(blueprint.size, video.len() as u64);

        let reader = crate::archive::BlueprintReader::new(Arc::new(blueprint), sources);
        let out = reader.read_at(0, video.len()).await.unwrap();
        assert_eq!(&out[..], video);
    }

    #[tokio::test]
    async fn lzma_folder_is_compressed() {
        let archive = build_archive(&[("movie.mkv", b"x")], &[0x21]);
        let sources = sources(vec![archive]);
        assert!(matches!(
            scan(&sources, &[0]).await,
            Err(ArchiveError::CompressedArchive)
        ));
    }

    #[tokio::test]
    async fn aes_folder_is_encrypted() {
        let archive = build_archive(&[("movie.mkv", b"x")], &[0x06, 0xF1, 0x07, 0x01]);
        let sources = sources(vec![archive]);
        assert!(matches!(
            scan(&sources, &[0]).await,
            Err(ArchiveError::EncryptedArchive)
        ));
    }

    #[tokio::test]
    async fn no_video_entry() {
        let archive = build_archive(&[("readme.txt", b"hello")], CODEC_COPY);
        let sources = sources(vec![archive]);
        assert!(matches!(
            scan(&sources, &[0]).await,
            Err(ArchiveError::NoVideoEntry)
        ));
    }
}
