//! On-disk layout of one log segment: a file-header block followed by data
//! blocks, each block framed as `{ magic, length, body_crc32, padding }` +
//! body. All integers little-endian.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::base::{Decree, Gpid};
use crate::utils::ReplicoreError;

use crc32c::crc32c;

use tokio::fs::File;
use tokio::io::AsyncReadExt;

pub(crate) const LOG_BLOCK_MAGIC: u32 = 0xdead_beef;
pub(crate) const LOG_FILE_MAGIC: u32 = 0x4c4f_4746; // "LOGF"
pub(crate) const LOG_FILE_VERSION: u32 = 1;
pub(crate) const BLOCK_HEADER_LEN: usize = 16;

/// Wraps a block body with the framing header.
pub(crate) fn encode_block(body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(BLOCK_HEADER_LEN + body.len());
    buf.extend_from_slice(&LOG_BLOCK_MAGIC.to_le_bytes());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&crc32c(body).to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes()); // padding
    buf.extend_from_slice(body);
    buf
}

/// Reads the next block body from `file`. Returns `Ok(None)` on a clean or
/// torn tail: end of file, a short read, a magic mismatch, or a body CRC
/// mismatch all end replay at the last valid position.
pub(crate) async fn read_next_block(
    file: &mut File,
) -> Result<Option<Vec<u8>>, ReplicoreError> {
    let mut header = [0u8; BLOCK_HEADER_LEN];
    let mut read = 0usize;
    while read < BLOCK_HEADER_LEN {
        let n = file.read(&mut header[read..]).await?;
        if n == 0 {
            return Ok(None);
        }
        read += n;
    }

    let magic = u32::from_le_bytes(header[0..4].try_into().expect("4 bytes"));
    if magic != LOG_BLOCK_MAGIC {
        return Ok(None);
    }
    let length =
        u32::from_le_bytes(header[4..8].try_into().expect("4 bytes")) as usize;
    let expected_crc =
        u32::from_le_bytes(header[8..12].try_into().expect("4 bytes"));

    let mut body = vec![0u8; length];
    let mut read_body = 0usize;
    while read_body < length {
        let n = file.read(&mut body[read_body..]).await?;
        if n == 0 {
            return Ok(None);
        }
        read_body += n;
    }

    if crc32c(&body) != expected_crc {
        return Ok(None);
    }
    Ok(Some(body))
}

/// Fixed segment metadata written exactly once as the body of the first
/// block of every segment file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFileHeader {
    pub version: u32,
    pub max_staleness_for_commit: u32,
    pub buffer_size_bytes: u32,
    /// Global data offset at which this segment's first mutation frame sits.
    pub start_global_offset: u64,
    /// Per-gpid max decree present in the log *before* this segment; the
    /// next segment's header is therefore the seal record of this one.
    pub init_max_decrees: BTreeMap<Gpid, Decree>,
}

impl LogFileHeader {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let header_size = 4 * 5 + 8 + self.init_max_decrees.len() * 16;
        let mut buf = Vec::with_capacity(header_size);
        buf.extend_from_slice(&LOG_FILE_MAGIC.to_le_bytes());
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&(header_size as u32).to_le_bytes());
        buf.extend_from_slice(&self.max_staleness_for_commit.to_le_bytes());
        buf.extend_from_slice(&self.buffer_size_bytes.to_le_bytes());
        buf.extend_from_slice(&self.start_global_offset.to_le_bytes());
        // BTreeMap iteration gives the sorted order the format requires
        for (gpid, decree) in &self.init_max_decrees {
            buf.extend_from_slice(&gpid.app_id.to_le_bytes());
            buf.extend_from_slice(&gpid.partition_index.to_le_bytes());
            buf.extend_from_slice(&decree.to_le_bytes());
        }
        debug_assert_eq!(buf.len(), header_size);
        buf
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, ReplicoreError> {
        if bytes.len() < 4 * 5 + 8 {
            return Err(ReplicoreError::msg("log file header truncated"));
        }
        fn take_u32(bytes: &[u8], pos: &mut usize) -> u32 {
            let v = u32::from_le_bytes(
                bytes[*pos..*pos + 4].try_into().expect("4 bytes"),
            );
            *pos += 4;
            v
        }

        let mut pos = 0usize;
        let magic = take_u32(bytes, &mut pos);
        if magic != LOG_FILE_MAGIC {
            return Err(ReplicoreError::msg(format!(
                "bad log file magic {:#x}",
                magic
            )));
        }
        let version = take_u32(bytes, &mut pos);
        if version != LOG_FILE_VERSION {
            return Err(ReplicoreError::msg(format!(
                "unsupported log file version {}",
                version
            )));
        }
        let header_size = take_u32(bytes, &mut pos) as usize;
        if header_size != bytes.len() {
            return Err(ReplicoreError::msg(format!(
                "log file header size {} does not match block body {}",
                header_size,
                bytes.len()
            )));
        }
        let max_staleness_for_commit = take_u32(bytes, &mut pos);
        let buffer_size_bytes = take_u32(bytes, &mut pos);
        let start_global_offset = u64::from_le_bytes(
            bytes[pos..pos + 8].try_into().expect("8 bytes"),
        );
        pos += 8;

        let entries = bytes.len() - pos;
        if entries % 16 != 0 {
            return Err(ReplicoreError::msg(
                "log file header decree map misaligned",
            ));
        }
        let mut init_max_decrees = BTreeMap::new();
        while pos < bytes.len() {
            let app_id = u32::from_le_bytes(
                bytes[pos..pos + 4].try_into().expect("4 bytes"),
            );
            let partition_index = u32::from_le_bytes(
                bytes[pos + 4..pos + 8].try_into().expect("4 bytes"),
            );
            let decree = u64::from_le_bytes(
                bytes[pos + 8..pos + 16].try_into().expect("8 bytes"),
            );
            init_max_decrees
                .insert(Gpid::new(app_id, partition_index), decree);
            pos += 16;
        }

        Ok(LogFileHeader {
            version,
            max_staleness_for_commit,
            buffer_size_bytes,
            start_global_offset,
            init_max_decrees,
        })
    }
}

/// In-memory record of one segment file.
#[derive(Debug, Clone)]
pub struct LogFileMeta {
    pub index: u64,
    pub path: PathBuf,
    pub header: LogFileHeader,
    /// Global data offset one past this segment's last replayed frame; kept
    /// current by replay and by the writer.
    pub end_offset: u64,
    /// Per-gpid max decree contained up through this segment; populated when
    /// the segment is sealed (or recovered from the next segment's header).
    pub seal_max_decrees: Option<BTreeMap<Gpid, Decree>>,
}

/// Segment file naming: `log.<index>`.
pub(crate) fn segment_file_name(index: u64) -> String {
    format!("log.{}", index)
}

/// Parses an index out of a segment file name, if it is one.
pub(crate) fn parse_segment_file_name(name: &str) -> Option<u64> {
    let index = name.strip_prefix("log.")?;
    index.parse::<u64>().ok()
}

/// Opens a segment for reading and decodes its header block. A corrupt
/// header block (unlike a corrupt data block) fails the whole open.
pub(crate) async fn open_segment(
    path: &Path,
    index: u64,
) -> Result<(File, LogFileMeta), ReplicoreError> {
    let mut file = File::open(path).await?;
    let header_body = read_next_block(&mut file).await?.ok_or_else(|| {
        ReplicoreError(format!(
            "segment {} has no valid header block",
            path.display()
        ))
    })?;
    let header = LogFileHeader::decode(&header_body)?;

    let meta = LogFileMeta {
        index,
        path: path.to_path_buf(),
        end_offset: header.start_global_offset,
        header,
        seal_max_decrees: None,
    };
    Ok((file, meta))
}

#[cfg(test)]
mod log_file_tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn sample_header() -> LogFileHeader {
        let mut init_max_decrees = BTreeMap::new();
        init_max_decrees.insert(Gpid::new(1, 0), 50);
        init_max_decrees.insert(Gpid::new(1, 1), 30);
        LogFileHeader {
            version: LOG_FILE_VERSION,
            max_staleness_for_commit: 10,
            buffer_size_bytes: 4096,
            start_global_offset: 777,
            init_max_decrees,
        }
    }

    #[test]
    fn header_roundtrip() {
        let header = sample_header();
        let bytes = header.encode();
        let decoded = LogFileHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn header_bad_magic_rejected() {
        let mut bytes = sample_header().encode();
        bytes[0] ^= 0xFF;
        assert!(LogFileHeader::decode(&bytes).is_err());
    }

    #[test]
    fn segment_name_parsing() {
        assert_eq!(parse_segment_file_name("log.12"), Some(12));
        assert_eq!(parse_segment_file_name("log.x"), None);
        assert_eq!(parse_segment_file_name("checkpoint.3"), None);
        assert_eq!(segment_file_name(4), "log.4");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn block_read_back_and_torn_tail() -> Result<(), ReplicoreError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("log.1");

        let mut file = File::create(&path).await?;
        file.write_all(&encode_block(b"first")).await?;
        file.write_all(&encode_block(b"second")).await?;
        // torn tail: header claims more body bytes than exist
        let mut torn = encode_block(b"third");
        torn.truncate(torn.len() - 2);
        file.write_all(&torn).await?;
        file.sync_all().await?;

        let mut file = File::open(&path).await?;
        assert_eq!(
            read_next_block(&mut file).await?.as_deref(),
            Some(b"first".as_ref())
        );
        assert_eq!(
            read_next_block(&mut file).await?.as_deref(),
            Some(b"second".as_ref())
        );
        assert_eq!(read_next_block(&mut file).await?, None);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn block_crc_mismatch_stops_replay() -> Result<(), ReplicoreError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("log.1");

        let mut block = encode_block(b"payload");
        let last = block.len() - 1;
        block[last] ^= 0xFF;
        let mut file = File::create(&path).await?;
        file.write_all(&block).await?;
        file.sync_all().await?;

        let mut file = File::open(&path).await?;
        assert_eq!(read_next_block(&mut file).await?, None);
        Ok(())
    }
}
