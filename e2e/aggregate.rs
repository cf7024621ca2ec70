//! E2E Test Suite 03: Aggregation and Top-N
//!
//! Subnet aggregation groups records by masked source address with additive
//! counters; flow statistics select the Top-N under a chosen ordering.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use flowdump::aggregate::mask::AggrSpec;
use flowdump::aggregate::table::FlowTable;
use flowdump::aggregate::topn::{top_n, OrderBy};
use flowdump::archive::types::StatRecord;
use flowdump::archive::write::ArchiveWriter;
use flowdump::filter::FilterEngine;
use flowdump::flist::FileSequence;
use flowdump::output::{OutputLimits, OutputMode};
use flowdump::process::{process_files, RunConfig, RunMode};
use flowdump::record::{FlowAddrs, MasterRecord};
use flowdump::stats::update_stat;
use tempfile::TempDir;

fn src_record(src: Ipv4Addr, pkts: u64, bytes: u64) -> MasterRecord {
    MasterRecord {
        srcport: 5000,
        dstport: 80,
        prot: 6,
        first: 1_300_000_000,
        last: 1_300_000_010,
        d_pkts: pkts,
        d_octets: bytes,
        addrs: FlowAddrs::V4 {
            src: u32::from(src),
            dst: u32::from(Ipv4Addr::new(172, 16, 0, 1)),
        },
        ..MasterRecord::default()
    }
}

fn write_archive(path: &Path, records: &[MasterRecord]) {
    let mut w = ArchiveWriter::create(path.to_str().unwrap(), "e2e").unwrap();
    let mut stat = StatRecord::default();
    for r in records {
        w.append_record(&r.encode()).unwrap();
        update_stat(&mut stat, r);
    }
    w.close(&stat).unwrap();
}

fn aggregate(input: PathBuf, spec: &str) -> FlowTable {
    let cfg = RunConfig {
        mode: RunMode::Aggregate {
            spec: AggrSpec::parse(spec).unwrap(),
        },
        filter: FilterEngine::compile("any").unwrap(),
        twin: None,
        limitflows: 0,
        anon: None,
        output: OutputMode::resolve(None, false).unwrap(),
        limits: OutputLimits::default(),
    };
    let mut out = Vec::new();
    process_files(FileSequence::from_paths(vec![input]), &cfg, &mut out)
        .unwrap()
        .table
        .unwrap()
}

#[test]
fn srcip24_groups_by_subnet() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("subnets.flows");
    write_archive(
        &input,
        &[
            src_record(Ipv4Addr::new(10, 0, 0, 1), 10, 1000),
            src_record(Ipv4Addr::new(10, 0, 0, 2), 20, 2000),
            src_record(Ipv4Addr::new(10, 0, 1, 1), 5, 500),
            src_record(Ipv4Addr::new(10, 0, 1, 2), 5, 500),
            src_record(Ipv4Addr::new(10, 1, 0, 1), 1, 100),
        ],
    );

    let table = aggregate(input, "srcip4/24");
    assert_eq!(table.len(), 3);

    let entries = table.into_entries();
    let find = |net: Ipv4Addr| {
        entries
            .iter()
            .find(|e| e.key.src == u32::from(net) as u128)
            .unwrap()
    };
    let a = find(Ipv4Addr::new(10, 0, 0, 0));
    assert_eq!(a.flows, 2);
    assert_eq!(a.packets, 30);
    assert_eq!(a.bytes, 3000);
    let b = find(Ipv4Addr::new(10, 0, 1, 0));
    assert_eq!(b.flows, 2);
    assert_eq!(b.packets, 10);
    assert_eq!(b.bytes, 1000);
    let c = find(Ipv4Addr::new(10, 1, 0, 0));
    assert_eq!(c.flows, 1);

    // the representative renders as the network address
    assert_eq!(
        a.record.addrs.src_u128(),
        u32::from(Ipv4Addr::new(10, 0, 0, 0)) as u128
    );
}

#[test]
fn aggregated_flow_count_equals_record_count() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("sum.flows");
    let records: Vec<MasterRecord> = (0..37)
        .map(|i| src_record(Ipv4Addr::new(10, 0, 0, (i % 5) as u8), 1, 10))
        .collect();
    write_archive(&input, &records);

    let table = aggregate(input, "srcip");
    let total: u64 = table.entries().iter().map(|e| e.flows).sum();
    assert_eq!(total, 37);
}

#[test]
fn top3_by_bytes_descending() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("topn.flows");
    // 10 flows with distinct byte totals and distinct source addresses
    let records: Vec<MasterRecord> = (0..10)
        .map(|i| src_record(Ipv4Addr::new(10, 9, 0, i as u8), 1, (i as u64 + 1) * 111))
        .collect();
    write_archive(&input, &records);

    let table = aggregate(input, "srcip");
    assert_eq!(table.len(), 10);
    let top = top_n(table.into_entries(), 3, OrderBy::Bytes);
    let bytes: Vec<u64> = top.iter().map(|e| e.bytes).collect();
    assert_eq!(bytes, vec![1110, 999, 888]);
}

#[test]
fn topn_is_stable_across_runs() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("stable.flows");
    // all identical byte counts: ties everywhere
    let records: Vec<MasterRecord> = (0..8)
        .map(|i| src_record(Ipv4Addr::new(10, 7, 0, i as u8), 1, 400))
        .collect();
    write_archive(&input, &records);

    let first: Vec<u128> = top_n(
        aggregate(input.clone(), "srcip").into_entries(),
        5,
        OrderBy::Bytes,
    )
    .iter()
    .map(|e| e.key.src)
    .collect();
    let second: Vec<u128> = top_n(
        aggregate(input, "srcip").into_entries(),
        5,
        OrderBy::Bytes,
    )
    .iter()
    .map(|e| e.key.src)
    .collect();
    assert_eq!(first, second);
    // insertion order wins the tie
    assert_eq!(first[0], u32::from(Ipv4Addr::new(10, 7, 0, 0)) as u128);
}

#[test]
fn five_tuple_aggregation_keeps_distinct_flows_apart() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("tuple.flows");
    let a = src_record(Ipv4Addr::new(10, 0, 0, 1), 1, 100);
    let mut b = a;
    b.dstport = 443; // different tuple
    let c = a; // same tuple as a
    write_archive(&input, &[a, b, c]);

    let table = aggregate(input, "srcip,dstip,srcport,dstport,proto");
    assert_eq!(table.len(), 2);
}
