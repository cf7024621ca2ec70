//! The flow hash table: 2^20 buckets, collision chains, pre-allocated slab.
//!
//! The key is the serialized field projection; the hash is xxh64 over those
//! bytes and equality compares only the projected fields.  Entries are never
//! evicted — the table lives for one run and is consumed by the report.

use anyhow::{anyhow, Result};
use xxhash_rust::xxh64::xxh64;

use crate::record::MasterRecord;

/// log2 of the bucket count.
pub const HASH_BITS: u32 = 20;
const NUM_BUCKETS: usize = 1 << HASH_BITS;
/// Entries pre-allocated at init.
pub const NUM_PREALLOC: usize = 128_000;

const EMPTY: u32 = u32::MAX;

/// Projected grouping key.  Zero fields are masked out of the projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlowKey {
    /// 4 or 6 when an address participates, 0 otherwise.
    pub af: u8,
    pub proto: u8,
    pub src: u128,
    pub dst: u128,
    pub srcport: u16,
    pub dstport: u16,
    pub srcas: u16,
    pub dstas: u16,
}

impl FlowKey {
    fn to_bytes(self) -> [u8; 42] {
        let mut b = [0u8; 42];
        b[0] = self.af;
        b[1] = self.proto;
        b[2..18].copy_from_slice(&self.src.to_le_bytes());
        b[18..34].copy_from_slice(&self.dst.to_le_bytes());
        b[34..36].copy_from_slice(&self.srcport.to_le_bytes());
        b[36..38].copy_from_slice(&self.dstport.to_le_bytes());
        b[38..40].copy_from_slice(&self.srcas.to_le_bytes());
        b[40..42].copy_from_slice(&self.dstas.to_le_bytes());
        b
    }

    #[inline]
    fn hash(&self) -> u64 {
        xxh64(&self.to_bytes(), 0)
    }
}

/// Accumulated value of one group.
#[derive(Debug, Clone, Copy)]
pub struct FlowEntry {
    pub key: FlowKey,
    /// Insertion order, the Top-N tie-breaker.
    pub seq: u32,
    pub flows: u64,
    pub packets: u64,
    pub bytes: u64,
    pub first: u32,
    pub msec_first: u16,
    pub last: u32,
    pub msec_last: u16,
    pub tcp_flags: u8,
    /// Representative record for rendering (projection applied).
    pub record: MasterRecord,
    next: u32,
}

impl FlowEntry {
    /// Group duration in milliseconds, min(first) to max(last).
    pub fn duration_ms(&self) -> u64 {
        let start = self.first as u64 * 1000 + self.msec_first as u64;
        let end = self.last as u64 * 1000 + self.msec_last as u64;
        end.saturating_sub(start)
    }
}

pub struct FlowTable {
    buckets: Vec<u32>,
    entries: Vec<FlowEntry>,
}

impl FlowTable {
    /// Allocate the bucket array and the entry slab.  Allocation failure is
    /// reported, not aborted on — the caller maps it to the init-failure
    /// exit path.
    pub fn init() -> Result<FlowTable> {
        let mut buckets = Vec::new();
        buckets
            .try_reserve_exact(NUM_BUCKETS)
            .map_err(|e| anyhow!("can't allocate flow table buckets: {}", e))?;
        buckets.resize(NUM_BUCKETS, EMPTY);
        let mut entries = Vec::new();
        entries
            .try_reserve(NUM_PREALLOC)
            .map_err(|e| anyhow!("can't allocate flow table entries: {}", e))?;
        Ok(FlowTable { buckets, entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fold one record into its group, creating the group on first sight.
    /// `record` is the representative stored for rendering.
    pub fn upsert(&mut self, key: FlowKey, r: &MasterRecord, record: MasterRecord) {
        let bucket = (key.hash() & (NUM_BUCKETS as u64 - 1)) as usize;
        let mut idx = self.buckets[bucket];
        while idx != EMPTY {
            let e = &mut self.entries[idx as usize];
            if e.key == key {
                e.flows += 1;
                e.packets += r.d_pkts;
                e.bytes += r.d_octets;
                // lexicographic (sec, msec) min / max
                if (r.first, r.msec_first) < (e.first, e.msec_first) {
                    e.first = r.first;
                    e.msec_first = r.msec_first;
                }
                if (r.last, r.msec_last) > (e.last, e.msec_last) {
                    e.last = r.last;
                    e.msec_last = r.msec_last;
                }
                e.tcp_flags |= r.tcp_flags;
                return;
            }
            idx = e.next;
        }
        let seq = self.entries.len() as u32;
        self.entries.push(FlowEntry {
            key,
            seq,
            flows: 1,
            packets: r.d_pkts,
            bytes: r.d_octets,
            first: r.first,
            msec_first: r.msec_first,
            last: r.last,
            msec_last: r.msec_last,
            tcp_flags: r.tcp_flags,
            record,
            next: self.buckets[bucket],
        });
        self.buckets[bucket] = seq;
    }

    /// Consume the table in insertion order.
    pub fn into_entries(self) -> Vec<FlowEntry> {
        self.entries
    }

    pub fn entries(&self) -> &[FlowEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(pkts: u64, bytes: u64, first: u32, msec: u16) -> MasterRecord {
        MasterRecord {
            d_pkts: pkts,
            d_octets: bytes,
            first,
            last: first + 10,
            msec_first: msec,
            msec_last: msec,
            tcp_flags: 0,
            ..MasterRecord::default()
        }
    }

    fn key(srcport: u16) -> FlowKey {
        FlowKey {
            srcport,
            ..FlowKey::default()
        }
    }

    #[test]
    fn same_key_accumulates() {
        let mut t = FlowTable::init().unwrap();
        let a = rec(10, 1000, 100, 500);
        let b = rec(5, 700, 90, 250);
        t.upsert(key(80), &a, a);
        t.upsert(key(80), &b, b);
        assert_eq!(t.len(), 1);
        let e = &t.entries()[0];
        assert_eq!(e.flows, 2);
        assert_eq!(e.packets, 15);
        assert_eq!(e.bytes, 1700);
        assert_eq!((e.first, e.msec_first), (90, 250));
        assert_eq!((e.last, e.msec_last), (110, 250));
    }

    #[test]
    fn msec_breaks_timestamp_ties() {
        let mut t = FlowTable::init().unwrap();
        let a = rec(1, 1, 100, 500);
        let mut b = rec(1, 1, 100, 100);
        b.last = 110;
        b.msec_last = 900;
        t.upsert(key(1), &a, a);
        t.upsert(key(1), &b, b);
        let e = &t.entries()[0];
        assert_eq!(e.msec_first, 100);
        assert_eq!(e.msec_last, 900);
    }

    #[test]
    fn distinct_keys_get_distinct_entries() {
        let mut t = FlowTable::init().unwrap();
        let r = rec(1, 1, 0, 0);
        for port in 0..100u16 {
            t.upsert(key(port), &r, r);
        }
        assert_eq!(t.len(), 100);
        // insertion order is preserved in the slab
        assert!(t
            .entries()
            .windows(2)
            .all(|w| w[0].seq + 1 == w[1].seq));
    }

    #[test]
    fn tcp_flags_accumulate_by_or() {
        let mut t = FlowTable::init().unwrap();
        let mut a = rec(1, 1, 0, 0);
        a.tcp_flags = 0b0000_0010; // SYN
        let mut b = rec(1, 1, 0, 0);
        b.tcp_flags = 0b0001_0001; // ACK|FIN
        t.upsert(key(1), &a, a);
        t.upsert(key(1), &b, b);
        assert_eq!(t.entries()[0].tcp_flags, 0b0001_0011);
    }

    #[test]
    fn flow_key_serialization_is_stable() {
        let k = FlowKey {
            af: 4,
            proto: 6,
            src: 1,
            dst: 2,
            srcport: 3,
            dstport: 4,
            srcas: 5,
            dstas: 6,
        };
        assert_eq!(k.to_bytes(), k.to_bytes());
        assert_ne!(
            k.hash(),
            FlowKey {
                srcport: 7,
                ..k
            }
            .hash()
        );
    }
}
