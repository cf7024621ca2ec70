//! Packed on-disk flow records and their fixed-width in-memory expansion.
//!
//! A common record starts with `{size, flags, mark}`, carries the fixed flow
//! fields, and ends with the address pair: two u32 for IPv4 or two u128 for
//! IPv6, selected by bit 0 of `flags`.  Trailing bytes beyond the known
//! layout are extension data and are preserved verbatim on copy.
//!
//! [`MasterRecord`] is the evaluation context for the filter, the
//! aggregation key projection and the formatter.  Counters are widened to
//! u64; the address pair becomes the [`FlowAddrs`] sum type.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::archive::codec::{
    read_le128, read_le16, read_le32, write_le128, write_le16, write_le32,
};
use crate::archive::types::ArchiveError;

// ── Record layout ─────────────────────────────────────────────────────────────

/// `flags` bit 0: the record carries IPv6 addresses.
pub const FLAG_IPV6_ADDR: u16 = 1;

/// Byte offset of the address pair from the start of a record.
pub const IP_OFFSET: usize = 42;
/// Size of a v4 record without extensions.
pub const V4_RECORD_SIZE: usize = IP_OFFSET + 8;
/// Size of a v6 record without extensions.
pub const V6_RECORD_SIZE: usize = IP_OFFSET + 32;

// ── Address sum type ──────────────────────────────────────────────────────────

/// Source/destination address pair, tagged by family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowAddrs {
    V4 { src: u32, dst: u32 },
    V6 { src: u128, dst: u128 },
}

impl FlowAddrs {
    #[inline]
    pub fn is_v6(&self) -> bool {
        matches!(self, FlowAddrs::V6 { .. })
    }

    /// Source address widened to 128 bits (v4 lives in the low 32 bits).
    #[inline]
    pub fn src_u128(&self) -> u128 {
        match *self {
            FlowAddrs::V4 { src, .. } => src as u128,
            FlowAddrs::V6 { src, .. } => src,
        }
    }

    /// Destination address widened to 128 bits.
    #[inline]
    pub fn dst_u128(&self) -> u128 {
        match *self {
            FlowAddrs::V4 { dst, .. } => dst as u128,
            FlowAddrs::V6 { dst, .. } => dst,
        }
    }

    pub fn src_ip(&self) -> IpAddr {
        match *self {
            FlowAddrs::V4 { src, .. } => IpAddr::V4(Ipv4Addr::from(src)),
            FlowAddrs::V6 { src, .. } => IpAddr::V6(Ipv6Addr::from(src)),
        }
    }

    pub fn dst_ip(&self) -> IpAddr {
        match *self {
            FlowAddrs::V4 { dst, .. } => IpAddr::V4(Ipv4Addr::from(dst)),
            FlowAddrs::V6 { dst, .. } => IpAddr::V6(Ipv6Addr::from(dst)),
        }
    }
}

// ── Master record ─────────────────────────────────────────────────────────────

/// Fixed-width, in-memory expansion of one packed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterRecord {
    /// On-disk record size including extensions; re-serialization recomputes
    /// it from the address family.
    pub size: u16,
    pub flags: u16,
    pub input: u16,
    pub output: u16,
    pub srcport: u16,
    pub dstport: u16,
    pub srcas: u16,
    pub dstas: u16,
    pub prot: u8,
    pub tcp_flags: u8,
    pub tos: u8,
    pub first: u32,
    pub last: u32,
    pub msec_first: u16,
    pub msec_last: u16,
    pub d_pkts: u64,
    pub d_octets: u64,
    pub addrs: FlowAddrs,
}

impl Default for MasterRecord {
    fn default() -> Self {
        MasterRecord {
            size: V4_RECORD_SIZE as u16,
            flags: 0,
            input: 0,
            output: 0,
            srcport: 0,
            dstport: 0,
            srcas: 0,
            dstas: 0,
            prot: 0,
            tcp_flags: 0,
            tos: 0,
            first: 0,
            last: 0,
            msec_first: 0,
            msec_last: 0,
            d_pkts: 0,
            d_octets: 0,
            addrs: FlowAddrs::V4 { src: 0, dst: 0 },
        }
    }
}

impl MasterRecord {
    /// Expand a packed record.  `buf` must start at the record and contain at
    /// least the declared size; the declared size must cover the layout of
    /// the flagged address family.
    pub fn expand(buf: &[u8]) -> Result<MasterRecord, ArchiveError> {
        if buf.len() < IP_OFFSET {
            return Err(ArchiveError::BadRecord(format!(
                "record truncated to {} bytes",
                buf.len()
            )));
        }
        let size = read_le16(buf, 0);
        let flags = read_le16(buf, 2);
        let v6 = flags & FLAG_IPV6_ADDR != 0;
        let min = if v6 { V6_RECORD_SIZE } else { V4_RECORD_SIZE };
        if (size as usize) < min || buf.len() < min {
            return Err(ArchiveError::BadRecord(format!(
                "record size {} below minimum {} for address family",
                size, min
            )));
        }
        let addrs = if v6 {
            FlowAddrs::V6 {
                src: read_le128(buf, IP_OFFSET),
                dst: read_le128(buf, IP_OFFSET + 16),
            }
        } else {
            FlowAddrs::V4 {
                src: read_le32(buf, IP_OFFSET),
                dst: read_le32(buf, IP_OFFSET + 4),
            }
        };
        Ok(MasterRecord {
            size,
            flags,
            input: read_le16(buf, 6),
            output: read_le16(buf, 8),
            srcport: read_le16(buf, 10),
            dstport: read_le16(buf, 12),
            srcas: read_le16(buf, 14),
            dstas: read_le16(buf, 16),
            prot: buf[18],
            tcp_flags: buf[19],
            tos: buf[20],
            first: read_le32(buf, 22),
            last: read_le32(buf, 26),
            msec_first: read_le16(buf, 30),
            msec_last: read_le16(buf, 32),
            d_pkts: read_le32(buf, 34) as u64,
            d_octets: read_le32(buf, 38) as u64,
            addrs,
        })
    }

    /// Serialize into the packed layout.  The size field is recomputed from
    /// the address family; `mark` is always written as zero and extension
    /// bytes are not carried.
    pub fn encode(&self) -> Vec<u8> {
        let (v6, total) = match self.addrs {
            FlowAddrs::V4 { .. } => (false, V4_RECORD_SIZE),
            FlowAddrs::V6 { .. } => (true, V6_RECORD_SIZE),
        };
        let mut buf = vec![0u8; total];
        write_le16(&mut buf, 0, total as u16);
        let flags = if v6 {
            self.flags | FLAG_IPV6_ADDR
        } else {
            self.flags & !FLAG_IPV6_ADDR
        };
        write_le16(&mut buf, 2, flags);
        // mark at offset 4 stays zero
        write_le16(&mut buf, 6, self.input);
        write_le16(&mut buf, 8, self.output);
        write_le16(&mut buf, 10, self.srcport);
        write_le16(&mut buf, 12, self.dstport);
        write_le16(&mut buf, 14, self.srcas);
        write_le16(&mut buf, 16, self.dstas);
        buf[18] = self.prot;
        buf[19] = self.tcp_flags;
        buf[20] = self.tos;
        write_le32(&mut buf, 22, self.first);
        write_le32(&mut buf, 26, self.last);
        write_le16(&mut buf, 30, self.msec_first);
        write_le16(&mut buf, 32, self.msec_last);
        write_le32(&mut buf, 34, self.d_pkts.min(u32::MAX as u64) as u32);
        write_le32(&mut buf, 38, self.d_octets.min(u32::MAX as u64) as u32);
        match self.addrs {
            FlowAddrs::V4 { src, dst } => {
                write_le32(&mut buf, IP_OFFSET, src);
                write_le32(&mut buf, IP_OFFSET + 4, dst);
            }
            FlowAddrs::V6 { src, dst } => {
                write_le128(&mut buf, IP_OFFSET, src);
                write_le128(&mut buf, IP_OFFSET + 16, dst);
            }
        }
        buf
    }

    /// Duration of the flow in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        let start = self.first as u64 * 1000 + self.msec_first as u64;
        let end = self.last as u64 * 1000 + self.msec_last as u64;
        end.saturating_sub(start)
    }
}

// ── Record cursor ─────────────────────────────────────────────────────────────

/// Walks the packed records of one block payload in file order.
///
/// Yields `(offset, record_bytes)` slices covering each record including any
/// extension bytes; stops with an error on a record that is undersized or
/// overruns the payload.
pub struct RecordCursor<'a> {
    payload: &'a [u8],
    offset: usize,
}

impl<'a> RecordCursor<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        RecordCursor { payload, offset: 0 }
    }
}

impl<'a> Iterator for RecordCursor<'a> {
    type Item = Result<(usize, &'a [u8]), ArchiveError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.payload.len() {
            return None;
        }
        let rest = &self.payload[self.offset..];
        if rest.len() < 4 {
            self.offset = self.payload.len();
            return Some(Err(ArchiveError::BadRecord(
                "trailing bytes shorter than a record header".to_owned(),
            )));
        }
        let at = self.offset;
        let size = read_le16(rest, 0) as usize;
        let flags = read_le16(rest, 2);
        let min = if flags & FLAG_IPV6_ADDR != 0 {
            V6_RECORD_SIZE
        } else {
            V4_RECORD_SIZE
        };
        if size < min || size > rest.len() {
            self.offset = self.payload.len();
            return Some(Err(ArchiveError::BadRecord(format!(
                "record size {} invalid at offset {}",
                size, at
            ))));
        }
        self.offset += size;
        Some(Ok((at, &rest[..size])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_v4() -> MasterRecord {
        MasterRecord {
            input: 2,
            output: 3,
            srcport: 1024,
            dstport: 80,
            srcas: 64512,
            dstas: 64513,
            prot: 6,
            tcp_flags: 0x1b,
            tos: 4,
            first: 1_100_000_000,
            last: 1_100_000_010,
            msec_first: 100,
            msec_last: 900,
            d_pkts: 42,
            d_octets: 12345,
            addrs: FlowAddrs::V4 {
                src: u32::from(Ipv4Addr::new(10, 0, 0, 1)),
                dst: u32::from(Ipv4Addr::new(192, 168, 1, 1)),
            },
            ..MasterRecord::default()
        }
    }

    #[test]
    fn v4_round_trip() {
        let rec = sample_v4();
        let bytes = rec.encode();
        assert_eq!(bytes.len(), V4_RECORD_SIZE);
        let back = MasterRecord::expand(&bytes).unwrap();
        assert_eq!(back.srcport, 1024);
        assert_eq!(back.dstport, 80);
        assert_eq!(back.addrs, rec.addrs);
        assert_eq!(back.size as usize, V4_RECORD_SIZE);
    }

    #[test]
    fn v6_round_trip() {
        let rec = MasterRecord {
            addrs: FlowAddrs::V6 {
                src: u128::from(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)),
                dst: u128::from(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 2)),
            },
            ..sample_v4()
        };
        let bytes = rec.encode();
        assert_eq!(bytes.len(), V6_RECORD_SIZE);
        let back = MasterRecord::expand(&bytes).unwrap();
        assert!(back.addrs.is_v6());
        assert_eq!(back.addrs, rec.addrs);
        assert_eq!(back.flags & FLAG_IPV6_ADDR, FLAG_IPV6_ADDR);
    }

    #[test]
    fn mark_written_zero() {
        let bytes = sample_v4().encode();
        assert_eq!(read_le16(&bytes, 4), 0);
    }

    #[test]
    fn expand_rejects_undersized_record() {
        let mut bytes = sample_v4().encode();
        write_le16(&mut bytes, 0, 10);
        assert!(MasterRecord::expand(&bytes).is_err());
    }

    #[test]
    fn cursor_walks_packed_records() {
        let a = sample_v4().encode();
        let b = MasterRecord {
            srcport: 53,
            prot: 17,
            ..sample_v4()
        }
        .encode();
        let mut payload = a.clone();
        payload.extend_from_slice(&b);
        let records: Vec<_> = RecordCursor::new(&payload)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0, 0);
        assert_eq!(records[1].0, a.len());
        let second = MasterRecord::expand(records[1].1).unwrap();
        assert_eq!(second.srcport, 53);
    }

    #[test]
    fn cursor_preserves_extension_bytes() {
        let mut bytes = sample_v4().encode();
        // grow the record by 8 extension bytes
        bytes.extend_from_slice(&[0xAA; 8]);
        let total = bytes.len() as u16;
        write_le16(&mut bytes, 0, total);
        let records: Vec<_> = RecordCursor::new(&bytes)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].1.len(), total as usize);
        assert_eq!(&records[0].1[V4_RECORD_SIZE..], &[0xAA; 8]);
    }

    #[test]
    fn cursor_flags_overrun() {
        let mut bytes = sample_v4().encode();
        write_le16(&mut bytes, 0, 4096);
        let res: Result<Vec<_>, _> = RecordCursor::new(&bytes).collect();
        assert!(res.is_err());
    }

    #[test]
    fn duration_includes_milliseconds() {
        let rec = sample_v4();
        // 10 s span, 100 ms → 900 ms
        assert_eq!(rec.duration_ms(), 10_800);
    }
}
