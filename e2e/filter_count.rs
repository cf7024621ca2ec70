//! E2E Test Suite 02: Filter + count
//!
//! A compound filter selects a subset of records; only that subset shows up
//! in the counters, and rejected records leave no trace anywhere.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use flowdump::archive::types::StatRecord;
use flowdump::archive::write::ArchiveWriter;
use flowdump::filter::FilterEngine;
use flowdump::flist::FileSequence;
use flowdump::output::{OutputLimits, OutputMode};
use flowdump::process::{process_files, RunConfig, RunMode};
use flowdump::record::{FlowAddrs, MasterRecord};
use flowdump::stats::update_stat;
use tempfile::TempDir;

fn record(prot: u8, srcport: u16) -> MasterRecord {
    MasterRecord {
        srcport,
        dstport: 33000,
        prot,
        first: 1_200_000_000,
        last: 1_200_000_005,
        d_pkts: 2,
        d_octets: 256,
        addrs: FlowAddrs::V4 {
            src: u32::from(Ipv4Addr::new(10, 1, 1, 1)),
            dst: u32::from(Ipv4Addr::new(10, 2, 2, 2)),
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

fn run_filter(input: PathBuf, filter: &str) -> (StatRecord, String) {
    let cfg = RunConfig {
        mode: RunMode::Print,
        filter: FilterEngine::compile(filter).unwrap(),
        twin: None,
        limitflows: 0,
        anon: None,
        output: OutputMode::resolve(Some("pipe"), false).unwrap(),
        limits: OutputLimits::default(),
    };
    let mut out = Vec::new();
    let result = process_files(FileSequence::from_paths(vec![input]), &cfg, &mut out).unwrap();
    (result.stat, String::from_utf8(out).unwrap())
}

#[test]
fn udp_dns_filter_counts_only_matches() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("mixed.flows");
    let records = vec![
        record(17, 53),   // match
        record(17, 53),   // match
        record(17, 4242), // udp, wrong port
        record(6, 53),    // right port, tcp
        record(6, 80),
        record(1, 0),
    ];
    write_archive(&input, &records);

    let (stat, printed) = run_filter(input, "proto udp and src port 53");
    assert_eq!(stat.numflows, 2);
    assert_eq!(stat.numflows_udp, 2);
    assert_eq!(stat.numflows_tcp, 0);
    assert_eq!(stat.numflows_icmp, 0);
    assert_eq!(stat.numflows_other, 0);
    assert_eq!(stat.numpackets, 4);
    assert_eq!(stat.numbytes, 512);
    assert_eq!(printed.lines().count(), 2);
}

#[test]
fn rejected_records_contribute_nothing() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("none.flows");
    write_archive(&input, &[record(6, 80), record(6, 443)]);

    let (stat, printed) = run_filter(input, "proto udp");
    assert_eq!(stat.numflows, 0);
    assert_eq!(stat.numbytes, 0);
    assert_eq!(stat.numpackets, 0);
    // the untouched window markers prove no record was folded in
    assert_eq!(stat.first_seen, u32::MAX);
    assert_eq!(stat.last_seen, 0);
    assert!(printed.is_empty());
}

#[test]
fn negation_and_either_direction() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("dir.flows");
    write_archive(
        &input,
        &[record(6, 80), record(6, 443), record(17, 80)],
    );

    // port 80 in either direction, tcp only
    let (stat, _) = run_filter(input.clone(), "port 80 and not proto udp");
    assert_eq!(stat.numflows, 1);

    let (stat, _) = run_filter(input, "dst port 33000");
    assert_eq!(stat.numflows, 3);
}
