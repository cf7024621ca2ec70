//! Top-N selection over aggregated flows and the date-sort buffer.

use crate::aggregate::table::FlowEntry;
use crate::record::MasterRecord;

/// Ordering key for statistics output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderBy {
    #[default]
    Flows,
    Packets,
    Bytes,
    Bps,
    Pps,
    Bpp,
}

impl OrderBy {
    pub fn parse(s: &str) -> Option<OrderBy> {
        match s.to_ascii_lowercase().as_str() {
            "flows" => Some(OrderBy::Flows),
            "packets" => Some(OrderBy::Packets),
            "bytes" => Some(OrderBy::Bytes),
            "bps" => Some(OrderBy::Bps),
            "pps" => Some(OrderBy::Pps),
            "bpp" => Some(OrderBy::Bpp),
            _ => None,
        }
    }

    /// The sort value of one entry under this ordering.
    pub fn value(self, e: &FlowEntry) -> u64 {
        match self {
            OrderBy::Flows => e.flows,
            OrderBy::Packets => e.packets,
            OrderBy::Bytes => e.bytes,
            OrderBy::Bps => bps(e.bytes, e.duration_ms()),
            OrderBy::Pps => pps(e.packets, e.duration_ms()),
            OrderBy::Bpp => bpp(e.bytes, e.packets),
        }
    }
}

/// Bits per second over a millisecond duration; zero duration is zero rate.
pub fn bps(bytes: u64, duration_ms: u64) -> u64 {
    if duration_ms == 0 {
        0
    } else {
        bytes.saturating_mul(8).saturating_mul(1000) / duration_ms
    }
}

/// Packets per second; zero duration is zero rate.
pub fn pps(packets: u64, duration_ms: u64) -> u64 {
    if duration_ms == 0 {
        0
    } else {
        packets.saturating_mul(1000) / duration_ms
    }
}

/// Bytes per packet; zero packets is zero.
pub fn bpp(bytes: u64, packets: u64) -> u64 {
    if packets == 0 {
        0
    } else {
        bytes / packets
    }
}

/// Sort descending by the ordering key and keep the first `n`.  The sort is
/// stable over insertion order, so ties resolve to first-seen-first.
pub fn top_n(mut entries: Vec<FlowEntry>, n: usize, order: OrderBy) -> Vec<FlowEntry> {
    entries.sort_by(|a, b| order.value(b).cmp(&order.value(a)));
    entries.truncate(n);
    entries
}

/// Insertion buffer for date-sorted printing across all input files.
#[derive(Default)]
pub struct SortBuffer {
    records: Vec<MasterRecord>,
}

impl SortBuffer {
    pub fn new() -> SortBuffer {
        SortBuffer::default()
    }

    pub fn insert(&mut self, r: &MasterRecord) {
        self.records.push(*r);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records ordered by (first, msec_first); input order breaks ties.
    pub fn into_sorted(mut self) -> Vec<MasterRecord> {
        self.records
            .sort_by_key(|r| (r.first, r.msec_first));
        self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::table::{FlowKey, FlowTable};

    fn entry(flows: u64, packets: u64, bytes: u64, seq_port: u16) -> FlowEntry {
        // build entries through the table so `seq` reflects insertion order
        let mut t = FlowTable::init().unwrap();
        let r = MasterRecord {
            d_pkts: packets,
            d_octets: bytes,
            ..MasterRecord::default()
        };
        t.upsert(
            FlowKey {
                srcport: seq_port,
                ..FlowKey::default()
            },
            &r,
            r,
        );
        let mut e = t.into_entries().pop().unwrap();
        e.flows = flows;
        e
    }

    #[test]
    fn orders_descending_and_truncates() {
        let entries = vec![
            entry(1, 0, 100, 0),
            entry(1, 0, 500, 1),
            entry(1, 0, 300, 2),
            entry(1, 0, 400, 3),
        ];
        let top = top_n(entries, 3, OrderBy::Bytes);
        let bytes: Vec<u64> = top.iter().map(|e| e.bytes).collect();
        assert_eq!(bytes, vec![500, 400, 300]);
    }

    #[test]
    fn ties_resolve_to_insertion_order() {
        let entries = vec![
            entry(5, 0, 0, 10),
            entry(5, 0, 0, 11),
            entry(5, 0, 0, 12),
        ];
        let top = top_n(entries.clone(), 3, OrderBy::Flows);
        let ports: Vec<u16> = top.iter().map(|e| e.key.srcport).collect();
        assert_eq!(ports, vec![10, 11, 12]);
        // identical run, identical sequence
        let again = top_n(entries, 3, OrderBy::Flows);
        let ports2: Vec<u16> = again.iter().map(|e| e.key.srcport).collect();
        assert_eq!(ports, ports2);
    }

    #[test]
    fn zero_duration_yields_zero_rate() {
        assert_eq!(bps(1_000_000, 0), 0);
        assert_eq!(pps(1_000_000, 0), 0);
        assert_eq!(bpp(1000, 0), 0);
    }

    #[test]
    fn rates() {
        // 1000 bytes over 2 s → 4000 bps
        assert_eq!(bps(1000, 2000), 4000);
        // 100 packets over 4 s → 25 pps
        assert_eq!(pps(100, 4000), 25);
        assert_eq!(bpp(1500, 10), 150);
    }

    #[test]
    fn order_parse() {
        assert_eq!(OrderBy::parse("bytes"), Some(OrderBy::Bytes));
        assert_eq!(OrderBy::parse("Flows"), Some(OrderBy::Flows));
        assert_eq!(OrderBy::parse("nope"), None);
    }

    #[test]
    fn sort_buffer_orders_by_time() {
        let mut buf = SortBuffer::new();
        for (first, msec) in [(300u32, 0u16), (100, 500), (100, 100), (200, 0)] {
            buf.insert(&MasterRecord {
                first,
                msec_first: msec,
                ..MasterRecord::default()
            });
        }
        let sorted = buf.into_sorted();
        let times: Vec<(u32, u16)> = sorted.iter().map(|r| (r.first, r.msec_first)).collect();
        assert_eq!(times, vec![(100, 100), (100, 500), (200, 0), (300, 0)]);
    }
}
