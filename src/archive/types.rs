//! On-disk types of the flow-archive format: file header, data-block header,
//! stat record (summary trailer), layout constants and the archive error type.
//!
//! All multi-byte fields are little-endian.  Files carrying a foreign magic
//! or layout version are refused at open.

use thiserror::Error;

use crate::archive::codec::{read_le16, read_le32, read_le64, write_le16, write_le32, write_le64};

// ── Layout constants ──────────────────────────────────────────────────────────

/// File magic, first two bytes of every archive.
pub const MAGIC: u16 = 0xA50C;
/// On-disk layout version accepted by this implementation.
pub const LAYOUT_VERSION: u16 = 1;
/// Fixed size of the NUL-padded identifier string in the file header.
pub const IDENT_SIZE: usize = 32;
/// Total encoded size of the file header.
pub const FILE_HEADER_SIZE: usize = 44;
/// Encoded size of a data-block header.
pub const BLOCK_HEADER_SIZE: usize = 16;
/// Encoded size of the stat record (summary trailer payload).
pub const STAT_RECORD_SIZE: usize = 136;

/// Block id of a flow-record data block.
pub const DATA_BLOCK_TYPE_1: u32 = 1;
/// Block id of the summary trailer block (`num_records == 0`).
pub const STAT_BLOCK_TYPE: u32 = 2;

/// Initial input-buffer size; the buffer grows on demand, never shrinks.
pub const BUFFSIZE: usize = 1 << 20;
/// Hard cap on a single block payload; larger declared sizes mean corruption.
pub const MAX_BUFFER_SIZE: usize = 16 << 20;
/// Capacity of the output staging buffer.
pub const OUTPUT_BUFF_SIZE: usize = 1 << 20;
/// High-water mark: the staging buffer is flushed as one block beyond this.
pub const OUTPUT_FLUSH_LIMIT: usize = OUTPUT_BUFF_SIZE - 1024;

// ── Error type ────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a flow archive (bad magic 0x{0:04x})")]
    BadMagic(u16),

    #[error("unsupported archive layout version {0}")]
    BadVersion(u16),

    #[error("corrupt data file: block size {size} exceeds max buffer size")]
    OversizedBlock { size: u32, records: u32 },

    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },

    #[error("corrupt record: {0}")]
    BadRecord(String),
}

// ── File header ───────────────────────────────────────────────────────────────

/// Fixed-size archive file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub magic: u16,
    pub version: u16,
    pub flags: u32,
    pub ident: String,
}

impl FileHeader {
    /// New header for the current layout with the given identifier.
    /// The identifier is truncated to [`IDENT_SIZE`] bytes on encode.
    pub fn new(ident: &str) -> Self {
        FileHeader {
            magic: MAGIC,
            version: LAYOUT_VERSION,
            flags: 0,
            ident: ident.to_owned(),
        }
    }

    pub fn encode(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut buf = [0u8; FILE_HEADER_SIZE];
        write_le16(&mut buf, 0, self.magic);
        write_le16(&mut buf, 2, self.version);
        write_le32(&mut buf, 4, self.flags);
        // bytes 8..12 reserved
        let ident = self.ident.as_bytes();
        let n = ident.len().min(IDENT_SIZE);
        buf[12..12 + n].copy_from_slice(&ident[..n]);
        buf
    }

    /// Decode and validate a header.  Refuses foreign magic or version.
    pub fn decode(buf: &[u8; FILE_HEADER_SIZE]) -> Result<Self, ArchiveError> {
        let magic = read_le16(buf, 0);
        if magic != MAGIC {
            return Err(ArchiveError::BadMagic(magic));
        }
        let version = read_le16(buf, 2);
        if version != LAYOUT_VERSION {
            return Err(ArchiveError::BadVersion(version));
        }
        let flags = read_le32(buf, 4);
        let ident_raw = &buf[12..12 + IDENT_SIZE];
        let end = ident_raw.iter().position(|&b| b == 0).unwrap_or(IDENT_SIZE);
        let ident = String::from_utf8_lossy(&ident_raw[..end]).into_owned();
        Ok(FileHeader {
            magic,
            version,
            flags,
            ident,
        })
    }
}

// ── Data block header ─────────────────────────────────────────────────────────

/// Header preceding every block payload: `{size, num_records, id, pad}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataBlockHeader {
    pub size: u32,
    pub num_records: u32,
    pub id: u32,
    pub pad: u32,
}

impl DataBlockHeader {
    pub fn encode(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut buf = [0u8; BLOCK_HEADER_SIZE];
        write_le32(&mut buf, 0, self.size);
        write_le32(&mut buf, 4, self.num_records);
        write_le32(&mut buf, 8, self.id);
        write_le32(&mut buf, 12, self.pad);
        buf
    }

    pub fn decode(buf: &[u8; BLOCK_HEADER_SIZE]) -> Self {
        DataBlockHeader {
            size: read_le32(buf, 0),
            num_records: read_le32(buf, 4),
            id: read_le32(buf, 8),
            pad: read_le32(buf, 12),
        }
    }
}

// ── Stat record (summary trailer) ─────────────────────────────────────────────

/// Aggregate counters for a whole archive: the summary-trailer payload.
///
/// `first_seen`/`msec_first` start out at their maxima so the first matching
/// record always wins the lexicographic minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatRecord {
    pub numflows: u64,
    pub numbytes: u64,
    pub numpackets: u64,
    pub numflows_tcp: u64,
    pub numflows_udp: u64,
    pub numflows_icmp: u64,
    pub numflows_other: u64,
    pub numbytes_tcp: u64,
    pub numbytes_udp: u64,
    pub numbytes_icmp: u64,
    pub numbytes_other: u64,
    pub numpackets_tcp: u64,
    pub numpackets_udp: u64,
    pub numpackets_icmp: u64,
    pub numpackets_other: u64,
    pub first_seen: u32,
    pub last_seen: u32,
    pub msec_first: u16,
    pub msec_last: u16,
    pub numblocks: u32,
}

impl Default for StatRecord {
    fn default() -> Self {
        StatRecord {
            numflows: 0,
            numbytes: 0,
            numpackets: 0,
            numflows_tcp: 0,
            numflows_udp: 0,
            numflows_icmp: 0,
            numflows_other: 0,
            numbytes_tcp: 0,
            numbytes_udp: 0,
            numbytes_icmp: 0,
            numbytes_other: 0,
            numpackets_tcp: 0,
            numpackets_udp: 0,
            numpackets_icmp: 0,
            numpackets_other: 0,
            first_seen: u32::MAX,
            last_seen: 0,
            msec_first: 999,
            msec_last: 0,
            numblocks: 0,
        }
    }
}

impl StatRecord {
    pub fn encode(&self) -> [u8; STAT_RECORD_SIZE] {
        let mut buf = [0u8; STAT_RECORD_SIZE];
        let fields = [
            self.numflows,
            self.numbytes,
            self.numpackets,
            self.numflows_tcp,
            self.numflows_udp,
            self.numflows_icmp,
            self.numflows_other,
            self.numbytes_tcp,
            self.numbytes_udp,
            self.numbytes_icmp,
            self.numbytes_other,
            self.numpackets_tcp,
            self.numpackets_udp,
            self.numpackets_icmp,
            self.numpackets_other,
        ];
        for (i, f) in fields.iter().enumerate() {
            write_le64(&mut buf, i * 8, *f);
        }
        write_le32(&mut buf, 120, self.first_seen);
        write_le32(&mut buf, 124, self.last_seen);
        write_le16(&mut buf, 128, self.msec_first);
        write_le16(&mut buf, 130, self.msec_last);
        write_le32(&mut buf, 132, self.numblocks);
        buf
    }

    pub fn decode(buf: &[u8; STAT_RECORD_SIZE]) -> Self {
        let f = |i: usize| read_le64(buf, i * 8);
        StatRecord {
            numflows: f(0),
            numbytes: f(1),
            numpackets: f(2),
            numflows_tcp: f(3),
            numflows_udp: f(4),
            numflows_icmp: f(5),
            numflows_other: f(6),
            numbytes_tcp: f(7),
            numbytes_udp: f(8),
            numbytes_icmp: f(9),
            numbytes_other: f(10),
            numpackets_tcp: f(11),
            numpackets_udp: f(12),
            numpackets_icmp: f(13),
            numpackets_other: f(14),
            first_seen: read_le32(buf, 120),
            last_seen: read_le32(buf, 124),
            msec_first: read_le16(buf, 128),
            msec_last: read_le16(buf, 130),
            numblocks: read_le32(buf, 132),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_header_round_trip() {
        let h = FileHeader::new("collector-7");
        let buf = h.encode();
        let back = FileHeader::decode(&buf).unwrap();
        assert_eq!(back.magic, MAGIC);
        assert_eq!(back.version, LAYOUT_VERSION);
        assert_eq!(back.ident, "collector-7");
    }

    #[test]
    fn file_header_ident_truncated() {
        let long = "x".repeat(IDENT_SIZE + 10);
        let h = FileHeader::new(&long);
        let back = FileHeader::decode(&h.encode()).unwrap();
        assert_eq!(back.ident.len(), IDENT_SIZE);
    }

    #[test]
    fn file_header_rejects_foreign_magic() {
        let mut buf = FileHeader::new("x").encode();
        buf[0] = 0x42;
        match FileHeader::decode(&buf) {
            Err(ArchiveError::BadMagic(_)) => {}
            other => panic!("expected BadMagic, got {:?}", other),
        }
    }

    #[test]
    fn file_header_rejects_foreign_version() {
        let mut buf = FileHeader::new("x").encode();
        buf[2] = 99;
        assert!(matches!(
            FileHeader::decode(&buf),
            Err(ArchiveError::BadVersion(99))
        ));
    }

    #[test]
    fn block_header_round_trip() {
        let h = DataBlockHeader {
            size: 4096,
            num_records: 17,
            id: DATA_BLOCK_TYPE_1,
            pad: 0,
        };
        assert_eq!(DataBlockHeader::decode(&h.encode()), h);
    }

    #[test]
    fn stat_record_round_trip() {
        let s = StatRecord {
            numflows: 100,
            numbytes: 123_456,
            numpackets: 789,
            numflows_tcp: 60,
            numflows_udp: 40,
            first_seen: 1_100_000_000,
            last_seen: 1_100_000_600,
            msec_first: 250,
            msec_last: 750,
            numblocks: 3,
            ..StatRecord::default()
        };
        assert_eq!(StatRecord::decode(&s.encode()), s);
    }

    #[test]
    fn stat_record_default_window_is_inverted() {
        let s = StatRecord::default();
        assert_eq!(s.first_seen, u32::MAX);
        assert_eq!(s.last_seen, 0);
        assert_eq!(s.msec_first, 999);
    }
}
