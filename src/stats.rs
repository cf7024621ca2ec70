//! Per-run statistics: the summary accumulator behind the trailer, scaled
//! number rendering, and the element/record statistics (`-s`) machinery.

use anyhow::{bail, Result};

use crate::aggregate::table::{FlowEntry, FlowKey};
use crate::aggregate::topn::{bpp, bps, pps, OrderBy};
use crate::archive::types::StatRecord;
use crate::record::MasterRecord;
use crate::timewin::format_ts;

// ── Accumulator ───────────────────────────────────────────────────────────────

/// Fold one filtered record into the summary counters.
///
/// Per-protocol sub-totals: ICMP=1, TCP=6, UDP=17, everything else `other`.
/// First/last seen are strict lexicographic (sec, msec) min/max.
pub fn update_stat(stat: &mut StatRecord, r: &MasterRecord) {
    match r.prot {
        1 => {
            stat.numflows_icmp += 1;
            stat.numpackets_icmp += r.d_pkts;
            stat.numbytes_icmp += r.d_octets;
        }
        6 => {
            stat.numflows_tcp += 1;
            stat.numpackets_tcp += r.d_pkts;
            stat.numbytes_tcp += r.d_octets;
        }
        17 => {
            stat.numflows_udp += 1;
            stat.numpackets_udp += r.d_pkts;
            stat.numbytes_udp += r.d_octets;
        }
        _ => {
            stat.numflows_other += 1;
            stat.numpackets_other += r.d_pkts;
            stat.numbytes_other += r.d_octets;
        }
    }
    stat.numflows += 1;
    stat.numpackets += r.d_pkts;
    stat.numbytes += r.d_octets;

    if (r.first, r.msec_first) < (stat.first_seen, stat.msec_first) {
        stat.first_seen = r.first;
        stat.msec_first = r.msec_first;
    }
    if (r.last, r.msec_last) > (stat.last_seen, stat.msec_last) {
        stat.last_seen = r.last;
        stat.msec_last = r.msec_last;
    }
}

/// Merge per-file trailers (the `-I` summary walk).
pub fn sum_stat_records(acc: &mut StatRecord, s: &StatRecord) {
    acc.numflows += s.numflows;
    acc.numbytes += s.numbytes;
    acc.numpackets += s.numpackets;
    acc.numflows_tcp += s.numflows_tcp;
    acc.numflows_udp += s.numflows_udp;
    acc.numflows_icmp += s.numflows_icmp;
    acc.numflows_other += s.numflows_other;
    acc.numbytes_tcp += s.numbytes_tcp;
    acc.numbytes_udp += s.numbytes_udp;
    acc.numbytes_icmp += s.numbytes_icmp;
    acc.numbytes_other += s.numbytes_other;
    acc.numpackets_tcp += s.numpackets_tcp;
    acc.numpackets_udp += s.numpackets_udp;
    acc.numpackets_icmp += s.numpackets_icmp;
    acc.numpackets_other += s.numpackets_other;
    acc.numblocks += s.numblocks;
    if (s.first_seen, s.msec_first) < (acc.first_seen, acc.msec_first) {
        acc.first_seen = s.first_seen;
        acc.msec_first = s.msec_first;
    }
    if (s.last_seen, s.msec_last) > (acc.last_seen, acc.msec_last) {
        acc.last_seen = s.last_seen;
        acc.msec_last = s.msec_last;
    }
}

// ── Number scaling ────────────────────────────────────────────────────────────

/// Render a counter scaled to K/M/G (1000-based), or verbatim when `plain`.
pub fn format_number(n: u64, plain: bool) -> String {
    if plain {
        return n.to_string();
    }
    let f = n as f64;
    if f >= 1e9 {
        format!("{:.1} G", f / 1e9)
    } else if f >= 1e6 {
        format!("{:.1} M", f / 1e6)
    } else if f >= 1e3 {
        format!("{:.1} K", f / 1e3)
    } else {
        n.to_string()
    }
}

/// The one-line run summary printed under the record listing.
pub fn summary_line(stat: &StatRecord, plain: bool) -> String {
    let mut avg_bps = 0;
    let mut avg_pps = 0;
    let mut avg_bpp = 0;
    if stat.last_seen > 0 && stat.first_seen != u32::MAX {
        let duration_ms = (stat.last_seen as u64 * 1000 + stat.msec_last as u64)
            .saturating_sub(stat.first_seen as u64 * 1000 + stat.msec_first as u64);
        avg_bps = bps(stat.numbytes, duration_ms);
        avg_pps = pps(stat.numpackets, duration_ms);
        avg_bpp = bpp(stat.numbytes, stat.numpackets);
    }
    format!(
        "Summary: total flows: {}, total bytes: {}, total packets: {}, avg bps: {}, avg pps: {}, avg bpp: {}",
        stat.numflows,
        format_number(stat.numbytes, plain),
        format_number(stat.numpackets, plain),
        format_number(avg_bps, plain),
        format_number(avg_pps, plain),
        format_number(avg_bpp, plain)
    )
}

/// Multi-line rendering of a file trailer for `-I`.
pub fn file_stat_lines(ident: &str, stat: &StatRecord) -> Vec<String> {
    vec![
        format!("Ident: {}", ident),
        format!("Flows: {}", stat.numflows),
        format!("Flows_tcp: {}", stat.numflows_tcp),
        format!("Flows_udp: {}", stat.numflows_udp),
        format!("Flows_icmp: {}", stat.numflows_icmp),
        format!("Flows_other: {}", stat.numflows_other),
        format!("Packets: {}", stat.numpackets),
        format!("Packets_tcp: {}", stat.numpackets_tcp),
        format!("Packets_udp: {}", stat.numpackets_udp),
        format!("Packets_icmp: {}", stat.numpackets_icmp),
        format!("Packets_other: {}", stat.numpackets_other),
        format!("Bytes: {}", stat.numbytes),
        format!("Bytes_tcp: {}", stat.numbytes_tcp),
        format!("Bytes_udp: {}", stat.numbytes_udp),
        format!("Bytes_icmp: {}", stat.numbytes_icmp),
        format!("Bytes_other: {}", stat.numbytes_other),
        format!("First: {}", stat.first_seen),
        format!("Last: {}", stat.last_seen),
        format!("msec_first: {}", stat.msec_first),
        format!("msec_last: {}", stat.msec_last),
        format!("Blocks: {}", stat.numblocks),
    ]
}

// ── Element statistics ────────────────────────────────────────────────────────

/// What `-s <expr>` counts by.  `Record` selects flow statistics (the full
/// aggregation key); everything else is a single-element statistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatElement {
    Record,
    SrcIp,
    DstIp,
    Ip,
    SrcPort,
    DstPort,
    Port,
    SrcAs,
    DstAs,
    As,
    InIf,
    OutIf,
    Proto,
}

/// Parsed `-s` argument: element plus optional `/order`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatSpec {
    pub element: StatElement,
    pub order: OrderBy,
}

impl StatSpec {
    /// Parse `element[/order[/order…]]`; the last order given wins.
    pub fn parse(arg: &str) -> Result<StatSpec> {
        let mut parts = arg.split('/');
        let elem_str = parts.next().unwrap_or("");
        let element = match elem_str.to_ascii_lowercase().as_str() {
            "record" => StatElement::Record,
            "srcip" => StatElement::SrcIp,
            "dstip" => StatElement::DstIp,
            "ip" => StatElement::Ip,
            "srcport" => StatElement::SrcPort,
            "dstport" => StatElement::DstPort,
            "port" => StatElement::Port,
            "srcas" => StatElement::SrcAs,
            "dstas" => StatElement::DstAs,
            "as" => StatElement::As,
            "inif" => StatElement::InIf,
            "outif" => StatElement::OutIf,
            "proto" => StatElement::Proto,
            other => bail!("unknown statistic: '{}'", other),
        };
        let mut order = OrderBy::Flows;
        for o in parts {
            order = OrderBy::parse(o)
                .ok_or_else(|| anyhow::anyhow!("order '{}' unknown!", o))?;
        }
        Ok(StatSpec { element, order })
    }
}

fn ip_key(v6: bool, addr: u128) -> FlowKey {
    FlowKey {
        af: if v6 { 6 } else { 4 },
        src: addr,
        ..FlowKey::default()
    }
}

fn num_key(value: u64) -> FlowKey {
    FlowKey {
        src: value as u128,
        ..FlowKey::default()
    }
}

impl StatElement {
    /// Keys this record contributes under the element.  The bidirectional
    /// elements (`ip`, `port`, `as`) contribute one key per direction.
    pub fn keys(self, r: &MasterRecord) -> (FlowKey, Option<FlowKey>) {
        let v6 = r.addrs.is_v6();
        match self {
            StatElement::Record => unreachable!("record statistics use the aggregation path"),
            StatElement::SrcIp => (ip_key(v6, r.addrs.src_u128()), None),
            StatElement::DstIp => (ip_key(v6, r.addrs.dst_u128()), None),
            StatElement::Ip => (
                ip_key(v6, r.addrs.src_u128()),
                Some(ip_key(v6, r.addrs.dst_u128())),
            ),
            StatElement::SrcPort => (num_key(r.srcport as u64), None),
            StatElement::DstPort => (num_key(r.dstport as u64), None),
            StatElement::Port => (
                num_key(r.srcport as u64),
                Some(num_key(r.dstport as u64)),
            ),
            StatElement::SrcAs => (num_key(r.srcas as u64), None),
            StatElement::DstAs => (num_key(r.dstas as u64), None),
            StatElement::As => (num_key(r.srcas as u64), Some(num_key(r.dstas as u64))),
            StatElement::InIf => (num_key(r.input as u64), None),
            StatElement::OutIf => (num_key(r.output as u64), None),
            StatElement::Proto => (num_key(r.prot as u64), None),
        }
    }

    /// Render the element value out of a key.
    pub fn format_key(self, key: &FlowKey) -> String {
        use std::net::{Ipv4Addr, Ipv6Addr};
        match self {
            StatElement::SrcIp | StatElement::DstIp | StatElement::Ip => {
                if key.af == 6 {
                    Ipv6Addr::from(key.src).to_string()
                } else {
                    Ipv4Addr::from(key.src as u32).to_string()
                }
            }
            _ => (key.src as u64).to_string(),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            StatElement::Record => "record",
            StatElement::SrcIp => "Src IP Addr",
            StatElement::DstIp => "Dst IP Addr",
            StatElement::Ip => "IP Addr",
            StatElement::SrcPort => "Src Port",
            StatElement::DstPort => "Dst Port",
            StatElement::Port => "Port",
            StatElement::SrcAs => "Src AS",
            StatElement::DstAs => "Dst AS",
            StatElement::As => "AS",
            StatElement::InIf => "Input If",
            StatElement::OutIf => "Output If",
            StatElement::Proto => "Protocol",
        }
    }
}

/// Render the Top-N table for an element statistic.
pub fn element_stat_lines(
    element: StatElement,
    order: OrderBy,
    entries: &[FlowEntry],
    plain: bool,
) -> Vec<String> {
    let mut out = Vec::with_capacity(entries.len() + 2);
    out.push(format!(
        "Top {} {} ordered by {:?}:",
        entries.len(),
        element.label(),
        order
    ));
    out.push(format!(
        "{:<23} {:>9} {:>18} {:>8} {:>9} {:>9} {:>8} {:>8} {:>6}",
        "Date first seen", "Duration", element.label(), "Flows", "Packets", "Bytes", "pps", "bps", "bpp"
    ));
    for e in entries {
        let dur_ms = e.duration_ms();
        out.push(format!(
            "{:<23} {:>9.3} {:>18} {:>8} {:>9} {:>9} {:>8} {:>8} {:>6}",
            format_ts(e.first, e.msec_first),
            dur_ms as f64 / 1000.0,
            element.format_key(&e.key),
            e.flows,
            format_number(e.packets, plain),
            format_number(e.bytes, plain),
            format_number(pps(e.packets, dur_ms), plain),
            format_number(bps(e.bytes, dur_ms), plain),
            format_number(bpp(e.bytes, e.packets), plain),
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::FlowAddrs;

    fn rec(prot: u8, pkts: u64, bytes: u64) -> MasterRecord {
        MasterRecord {
            prot,
            d_pkts: pkts,
            d_octets: bytes,
            first: 1000,
            last: 1010,
            ..MasterRecord::default()
        }
    }

    #[test]
    fn per_protocol_buckets() {
        let mut stat = StatRecord::default();
        update_stat(&mut stat, &rec(6, 10, 100));
        update_stat(&mut stat, &rec(17, 5, 50));
        update_stat(&mut stat, &rec(1, 1, 10));
        update_stat(&mut stat, &rec(47, 2, 20));
        assert_eq!(stat.numflows, 4);
        assert_eq!(stat.numflows_tcp, 1);
        assert_eq!(stat.numflows_udp, 1);
        assert_eq!(stat.numflows_icmp, 1);
        assert_eq!(stat.numflows_other, 1);
        assert_eq!(stat.numpackets, 18);
        assert_eq!(stat.numbytes, 180);
    }

    #[test]
    fn first_last_window_encloses_records() {
        let mut stat = StatRecord::default();
        let mut a = rec(6, 1, 1);
        a.first = 500;
        a.msec_first = 300;
        a.last = 900;
        a.msec_last = 100;
        let mut b = rec(6, 1, 1);
        b.first = 500;
        b.msec_first = 100;
        b.last = 900;
        b.msec_last = 400;
        update_stat(&mut stat, &a);
        update_stat(&mut stat, &b);
        assert_eq!((stat.first_seen, stat.msec_first), (500, 100));
        assert_eq!((stat.last_seen, stat.msec_last), (900, 400));
    }

    #[test]
    fn sum_merges_windows() {
        let mut acc = StatRecord::default();
        let a = StatRecord {
            numflows: 10,
            first_seen: 100,
            last_seen: 200,
            ..StatRecord::default()
        };
        let b = StatRecord {
            numflows: 5,
            first_seen: 50,
            last_seen: 150,
            ..StatRecord::default()
        };
        sum_stat_records(&mut acc, &a);
        sum_stat_records(&mut acc, &b);
        assert_eq!(acc.numflows, 15);
        assert_eq!(acc.first_seen, 50);
        assert_eq!(acc.last_seen, 200);
    }

    #[test]
    fn number_scaling() {
        assert_eq!(format_number(999, false), "999");
        assert_eq!(format_number(1500, false), "1.5 K");
        assert_eq!(format_number(2_500_000, false), "2.5 M");
        assert_eq!(format_number(3_000_000_000, false), "3.0 G");
        assert_eq!(format_number(2_500_000, true), "2500000");
    }

    #[test]
    fn stat_spec_parse() {
        let s = StatSpec::parse("srcip/bytes").unwrap();
        assert_eq!(s.element, StatElement::SrcIp);
        assert_eq!(s.order, OrderBy::Bytes);
        let s = StatSpec::parse("record").unwrap();
        assert_eq!(s.element, StatElement::Record);
        assert_eq!(s.order, OrderBy::Flows);
        // the legacy multi-order form keeps the last one
        let s = StatSpec::parse("record/packets/bytes").unwrap();
        assert_eq!(s.order, OrderBy::Bytes);
        assert!(StatSpec::parse("nonsense").is_err());
        assert!(StatSpec::parse("srcip/sideways").is_err());
    }

    #[test]
    fn bidirectional_elements_contribute_two_keys() {
        let r = MasterRecord {
            srcport: 53,
            dstport: 4242,
            ..MasterRecord::default()
        };
        let (k1, k2) = StatElement::Port.keys(&r);
        assert_eq!(k1.src, 53);
        assert_eq!(k2.unwrap().src, 4242);
        let (k1, k2) = StatElement::SrcPort.keys(&r);
        assert_eq!(k1.src, 53);
        assert!(k2.is_none());
    }

    #[test]
    fn ip_element_keys_are_family_tagged() {
        let v4 = MasterRecord::default();
        let v6 = MasterRecord {
            addrs: FlowAddrs::V6 { src: 0, dst: 0 },
            ..MasterRecord::default()
        };
        let (a, _) = StatElement::SrcIp.keys(&v4);
        let (b, _) = StatElement::SrcIp.keys(&v6);
        assert_ne!(a, b);
    }

    #[test]
    fn format_key_renders_addresses() {
        let key = ip_key(false, u32::from(std::net::Ipv4Addr::new(10, 1, 2, 3)) as u128);
        assert_eq!(StatElement::SrcIp.format_key(&key), "10.1.2.3");
        assert_eq!(StatElement::Proto.format_key(&num_key(17)), "17");
    }
}
